//! Generation worker behaviour against a scripted model
//!
//! Tenet: every accepted line passed validation, or the retry budget ran out.

use loom_decode::{
    GenerationBackend, GenerationConfig, GenerationError, GenerationRequest, GenerationWorker, ModelError,
    OutlineHint, WorkerHandle,
};
use loom_test_utils::{greedy, FixedSummarizer, ScriptedModel, ScriptedScorer};
use pretty_assertions::assert_eq;

fn config() -> GenerationConfig {
    GenerationConfig::default().with_sampling(greedy())
}

fn worker(scripts: &[&str]) -> GenerationWorker<ScriptedModel> {
    GenerationWorker::new(ScriptedModel::new(scripts.iter().copied()), config())
}

#[test]
fn generates_one_line() {
    let mut worker = worker(&["Anna: Hello there."]);
    let outcome = worker
        .generate_lines(&GenerationRequest::new("s-a", "Bob: Hi."))
        .unwrap();

    assert_eq!(outcome.lines, vec!["Anna: Hello there.".to_string()]);
    assert_eq!(outcome.model, "scripted");
}

#[test]
fn prompt_gets_a_newline_unless_it_ends_in_a_speaker() {
    let model = ScriptedModel::new(["Hi.", " Hello."]);
    let contexts = model.contexts();
    let mut worker = GenerationWorker::new(model, config());

    worker.generate_lines(&GenerationRequest::new("s-a", "Bob: Hi.")).unwrap();
    let outcome = worker.generate_lines(&GenerationRequest::new("s-b", "Bob: Hi.\nAnna:")).unwrap();

    let seen = contexts.lock().clone();
    assert_eq!(seen[0], "Bob: Hi.\n");
    assert_eq!(seen[1], "Bob: Hi.\nAnna:");
    assert_eq!(outcome.lines, vec![" Hello.".to_string()]);
}

#[test]
fn one_call_produces_one_line() {
    let model = ScriptedModel::new(["Anna: One.", "Bob: Hi."]);
    let contexts = model.contexts();
    let mut worker = GenerationWorker::new(model, config());
    let request = GenerationRequest::new("s-a", "Bob: Hi.").with_forbidden(vec!["Bob: Hi.".to_string()]);

    let outcome = worker.generate_lines(&request).unwrap();

    assert_eq!(outcome.lines, vec!["Anna: One.".to_string()]);
    assert_eq!(contexts.lock().len(), 1);
}

#[test]
fn forbidden_line_is_retried() {
    let mut worker = worker(&["Anna: Same.", "Anna: Different."]);
    let request = GenerationRequest::new("s-b", "Bob: Hi.").with_forbidden(vec!["Anna: Same.".to_string()]);

    let outcome = worker.generate_lines(&request).unwrap();

    assert_eq!(outcome.lines, vec!["Anna: Different.".to_string()]);
}

#[test]
fn remark_after_remark_is_retried() {
    let mut worker = worker(&["[Rain.]", "Anna: Wet."]);
    let outcome = worker
        .generate_lines(&GenerationRequest::new("s-a", "Bob: Hi.\n[Night.]"))
        .unwrap();

    assert_eq!(outcome.lines, vec!["Anna: Wet.".to_string()]);
}

#[test]
fn remark_after_dialogue_is_fine() {
    let mut worker = worker(&["[Rain.]"]);
    let outcome = worker.generate_lines(&GenerationRequest::new("s-a", "Bob: Hi.")).unwrap();

    assert_eq!(outcome.lines, vec!["[Rain.]".to_string()]);
}

#[test]
fn exhausted_budget_accepts_best_attempt() {
    let model = ScriptedModel::new(["Anna: Same."]);
    let contexts = model.contexts();
    let mut worker = GenerationWorker::new(model, config().with_max_retries(3));
    let request = GenerationRequest::new("s-a", "Bob: Hi.").with_forbidden(vec!["Anna: Same.".to_string()]);

    let outcome = worker.generate_lines(&request).unwrap();

    assert_eq!(outcome.lines, vec!["Anna: Same.".to_string()]);
    assert_eq!(contexts.lock().len(), 3);
}

#[test]
fn low_entailment_is_retried() {
    let scorer = ScriptedScorer::new([0.1, 0.9]);
    let calls = scorer.calls();
    let mut worker = GenerationWorker::new(ScriptedModel::new(["Anna: Nope.", "Anna: Yes then\n"]), config())
        .with_scorer(Box::new(scorer));

    let outcome = worker
        .generate_lines(&GenerationRequest::new("s-a", "Anna: I am here.\nBob: Are you?"))
        .unwrap();

    assert_eq!(outcome.lines, vec!["Anna: Yes then".to_string()]);
    let calls = calls.lock().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], ("I am here.".to_string(), "Nope.".to_string()));
}

#[test]
fn prose_accumulates_sentences_until_end_of_line() {
    let config = config().with_prose(true);
    let mut worker = GenerationWorker::new(
        ScriptedModel::new(["It rains.", " It pours.", " Then it stops: quietly\n"]),
        config,
    );

    let outcome = worker
        .generate_lines(&GenerationRequest::new("s-a", "A grey morning."))
        .unwrap();

    assert_eq!(
        outcome.lines,
        vec!["It rains. It pours. Then it stops; quietly".to_string()]
    );
}

#[test]
fn sentence_cap_forces_acceptance() {
    let mut worker = GenerationWorker::new(ScriptedModel::new(["Go."]), config().with_prose(true));

    let outcome = worker.generate_lines(&GenerationRequest::new("s-a", "Start.")).unwrap();

    assert_eq!(outcome.lines, vec!["Go.Go.Go.Go.Go.".to_string()]);
}

#[test]
fn outline_remark_is_injected_first() {
    let model = ScriptedModel::new(["Anna: Look."]);
    let contexts = model.contexts();
    let mut worker = GenerationWorker::new(model, config());
    let request = GenerationRequest::new("s-a", "Bob: Hi.").with_outline(OutlineHint {
        next_remark: Some("[A storm.]".to_string()),
        lines_since_remark: 40,
    });

    let outcome = worker.generate_lines(&request).unwrap();

    assert_eq!(
        outcome.lines,
        vec!["\n[A storm.]".to_string(), "Anna: Look.".to_string()]
    );
    assert_eq!(contexts.lock()[0], "Bob: Hi.\n\n[A storm.]\n");
}

#[test]
fn forbidden_outline_remark_is_skipped() {
    let mut worker = worker(&["Anna: Look."]);
    let request = GenerationRequest::new("s-a", "Bob: Hi.")
        .with_forbidden(vec!["[A storm.]".to_string()])
        .with_outline(OutlineHint {
            next_remark: Some("[A storm.]".to_string()),
            lines_since_remark: 40,
        });

    let outcome = worker.generate_lines(&request).unwrap();

    assert_eq!(outcome.lines, vec!["Anna: Look.".to_string()]);
}

#[test]
fn outline_remark_waits_after_a_recent_one() {
    let mut worker = worker(&["Anna: Look."]);
    let request = GenerationRequest::new("s-a", "Bob: Hi.").with_outline(OutlineHint {
        next_remark: Some("[A storm.]".to_string()),
        lines_since_remark: 0,
    });

    let outcome = worker.generate_lines(&request).unwrap();

    assert_eq!(outcome.lines.len(), 1);
}

#[test]
fn long_prompt_is_summarized() {
    let model = ScriptedModel::new(["Anna: Ok."]).with_max_context(60);
    let contexts = model.contexts();
    let mut worker = GenerationWorker::new(model, config().with_max_new_tokens(20))
        .with_summarizer(Box::new(FixedSummarizer("They argued. ".to_string())));

    let prompt = "Bob: ".to_string() + &"blah ".repeat(10);
    let outcome = worker.generate_lines(&GenerationRequest::new("s-a", prompt)).unwrap();

    assert_eq!(contexts.lock()[0], "They argued. \n");
    assert_eq!(outcome.lines, vec!["Anna: Ok.".to_string()]);
}

#[test]
fn long_prompt_is_left_truncated_without_summarizer() {
    let model = ScriptedModel::new(["Anna: Ok."]).with_max_context(60);
    let contexts = model.contexts();
    let mut worker = GenerationWorker::new(model, config().with_max_new_tokens(20));

    let prompt = "Bob: ".to_string() + &"x".repeat(100) + " end.";
    worker.generate_lines(&GenerationRequest::new("s-a", prompt)).unwrap();

    let first = contexts.lock()[0].clone();
    assert_eq!(first.chars().count(), 40);
    assert!(first.ends_with(" end.\n"));
}

#[test]
fn speaker_constraint_picks_a_known_name() {
    let config = config().with_limit_characters(true);
    let mut worker = GenerationWorker::new(ScriptedModel::new(["Zed: Hm.\n"]), config);

    let outcome = worker
        .generate_lines(&GenerationRequest::new("s-a", "Anna: Hi.\nBob: Yo."))
        .unwrap();

    let line = &outcome.lines[0];
    assert!(line.starts_with("Anna:") || line.starts_with("Bob:"), "{line}");
    assert!(line.ends_with("Hm."), "{line}");
}

#[test]
fn model_failure_is_an_error() {
    let mut worker = GenerationWorker::new(ScriptedModel::new(["x"]).failing(), config());

    let err = worker
        .generate_lines(&GenerationRequest::new("s-a", "Bob: Hi."))
        .unwrap_err();

    assert_eq!(
        err,
        GenerationError::Model(ModelError::Inference("scripted failure".to_string()))
    );
}

#[test]
fn same_key_replays_identically() {
    let run = || {
        let params = loom_decode::SamplingParams::default();
        let model = ScriptedModel::new(["Anna: Hello."]);
        let mut worker = GenerationWorker::new(model, GenerationConfig::default().with_sampling(params));
        worker.generate_lines(&GenerationRequest::new("s-ab", "Bob: Hi.")).unwrap()
    };
    assert_eq!(run(), run());
}

#[tokio::test]
async fn handle_serves_requests_from_its_thread() {
    let (handle, _thread) = WorkerHandle::spawn(|| {
        Ok(GenerationWorker::new(
            ScriptedModel::new(["Anna: Threaded."]).with_name("tiny"),
            config(),
        ))
    })
    .await
    .unwrap();

    assert_eq!(handle.model_name(), "tiny");
    let outcome = handle.generate(GenerationRequest::new("s-a", "Bob: Hi.")).await.unwrap();
    assert_eq!(outcome.lines, vec!["Anna: Threaded.".to_string()]);
    assert_eq!(outcome.model, "tiny");
}

#[tokio::test]
async fn handle_survives_a_panicking_model() {
    let (handle, _thread) = WorkerHandle::spawn(|| {
        Ok(GenerationWorker::new(ScriptedModel::new(["x"]).panicking(), config()))
    })
    .await
    .unwrap();

    for _ in 0..2 {
        let err = handle
            .generate(GenerationRequest::new("s-a", "Bob: Hi."))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Panicked(_)), "{err:?}");
    }
}

#[tokio::test]
async fn load_failure_is_reported() {
    let result = WorkerHandle::spawn::<ScriptedModel, _>(|| {
        Err(GenerationError::LoadFailed("no weights".to_string()))
    })
    .await;

    assert_eq!(
        result.map(|_| ()).unwrap_err(),
        GenerationError::LoadFailed("no weights".to_string())
    );
}

#[tokio::test]
async fn shutdown_makes_the_handle_unavailable() {
    let (handle, thread) = WorkerHandle::spawn(|| Ok(GenerationWorker::new(ScriptedModel::new(["x"]), config())))
        .await
        .unwrap();

    handle.shutdown().await;
    tokio::task::spawn_blocking(move || thread.join()).await.unwrap().unwrap();

    let err = handle
        .generate(GenerationRequest::new("s-a", "Bob: Hi."))
        .await
        .unwrap_err();
    assert_eq!(err, GenerationError::WorkerUnavailable);
}
