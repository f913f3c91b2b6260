//! Line generation with validation and retries
//!
//! One call to [`GenerationWorker::generate_lines`] produces the line for one
//! key, plus an outline remark in front when one is injected. Every candidate is checked before it is accepted:
//! - it must not repeat a forbidden line
//! - it must not be a stage direction right after another stage direction
//! - its entailment score must reach the threshold (when a scorer is set)
//!
//! Rejected candidates are retried under one budget; when the budget runs
//! out the best rejected candidate is used. In sentence mode accepted
//! fragments accumulate until a line ends or the fragment cap is hit.

use crate::config::GenerationConfig;
use crate::decoder::{DecodeOptions, Decoded, LineDecoder, StopReason};
use crate::error::GenerationError;
use crate::lines::{extract_character_names, looks_scenic, shorten};
use crate::model::{EntailmentScorer, LanguageModel, Summarizer, TokenId};
use crate::sampling::Sampler;
use crate::trie::CharacterTrie;
use crate::types::{GenerationOutcome, GenerationRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static SPEAKER_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^:]+:\s*").expect("speaker prefix pattern compiles"));

/// A candidate that failed validation, kept as a fallback
#[derive(Debug, Clone)]
struct Rejected {
    text: String,
    forbidden: bool,
    score: f32,
}

impl Rejected {
    fn better_than(&self, other: &Self) -> bool {
        (!self.forbidden, self.score) > (!other.forbidden, other.score)
    }
}

/// Owns a model and turns prompts into lines
pub struct GenerationWorker<M: LanguageModel> {
    model: M,
    config: GenerationConfig,
    scorer: Option<Box<dyn EntailmentScorer>>,
    summarizer: Option<Box<dyn Summarizer>>,
    newline: Vec<TokenId>,
}

impl<M: LanguageModel> GenerationWorker<M> {
    /// Wrap a loaded model
    pub fn new(model: M, config: GenerationConfig) -> Self {
        let newline = model.tokenize("\n");
        Self {
            model,
            config,
            scorer: None,
            summarizer: None,
            newline,
        }
    }

    /// Builder: attach an entailment scorer
    #[must_use]
    pub fn with_scorer(mut self, scorer: Box<dyn EntailmentScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Builder: attach a summarizer for prompts that do not fit
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Name of the wrapped model
    #[inline]
    #[must_use]
    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Active configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    /// Generate the line for a key
    ///
    /// Produces one line, preceded by an outline remark when one is injected.
    /// Follow-up lines are separate calls, each with its own constraints.
    ///
    /// # Errors
    /// Returns `GenerationError::Model` if the model, scorer or summarizer
    /// fails, including failures the model only recorded while decoding.
    pub fn generate_lines(
        &mut self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, GenerationError> {
        let lines = self.generate_one(request);
        if let Some(e) = self.model.take_failure() {
            tracing::warn!("Model reported a failure while generating {}: {}", request.key, e);
            return Err(e.into());
        }
        Ok(GenerationOutcome {
            lines: lines?,
            model: self.model.name().to_string(),
        })
    }

    fn generate_one(&mut self, request: &GenerationRequest) -> Result<Vec<String>, GenerationError> {
        tracing::info!("Generating {}: {:?}", request.key, shorten(&request.prompt, 50));

        let gen_len = self.config.max_new_tokens;
        let budget = self.model.max_context().saturating_sub(gen_len);

        let mut context = self.model.tokenize(&request.prompt);
        if context.len() >= budget {
            if let Some(summarizer) = self.summarizer.as_mut() {
                let before = context.len();
                let mut summary = summarizer.summarize(&request.prompt)?;
                if summary.ends_with(": ") {
                    summary.pop();
                }
                context = self.model.tokenize(&summary);
                tracing::info!("Summarized prompt from {} to {} tokens", before, context.len());
            }
        }

        let continuation = request.prompt.ends_with(':');
        if !continuation {
            context.extend_from_slice(&self.newline);
        }

        let last_prompt_line = request
            .prompt
            .split('\n')
            .filter(|l| !l.is_empty())
            .last()
            .unwrap_or("");

        let mut sampler = Sampler::for_key(self.config.sampling, &request.key);

        let remark = request
            .outline
            .next_remark
            .as_deref()
            .filter(|r| !continuation && !request.forbidden.iter().any(|f| f == r))
            .filter(|_| {
                let draw = sampler.uniform();
                self.config
                    .outline
                    .should_insert(request.outline.lines_since_remark, draw)
            })
            .map(str::to_string);
        if let Some(remark) = &remark {
            tracing::info!("Injecting outline remark {:?}", remark);
            context.extend_from_slice(&self.newline);
            context.extend(self.model.tokenize(remark));
            context.extend_from_slice(&self.newline);
        }

        if context.len() > budget {
            context.drain(..context.len() - budget);
        }

        let mut trie = if self.config.limit_characters && !continuation {
            let names = extract_character_names(&request.prompt);
            CharacterTrie::from_names(
                &self.model,
                names.iter().map(String::as_str),
                self.config.history_coefficient,
            )
        } else {
            None
        };

        let line = self.decode_validated(
            &mut sampler,
            context,
            request,
            continuation,
            last_prompt_line,
            trie.as_mut(),
        )?;
        tracing::info!("Generated {}: {:?}", request.key, shorten(&line, 50));

        let mut lines = Vec::with_capacity(2);
        if let Some(remark) = remark {
            lines.push(format!("\n{remark}"));
        }
        lines.push(line);
        Ok(lines)
    }

    fn decode_validated(
        &mut self,
        sampler: &mut Sampler,
        mut context: Vec<TokenId>,
        request: &GenerationRequest,
        continuation: bool,
        last_prompt_line: &str,
        mut trie: Option<&mut CharacterTrie>,
    ) -> Result<String, GenerationError> {
        let forbidden: HashSet<&str> = request.forbidden.iter().map(|l| l.trim()).collect();
        let sentence_mode = self.config.prose || self.scorer.is_some();
        let gen_len = self.config.max_new_tokens;
        let max_context = self.model.max_context();

        let mut sentences: Vec<String> = Vec::new();
        let mut best: Option<Rejected> = None;
        let mut retries = 0;

        while retries < self.config.max_retries && context.len() + gen_len <= max_context {
            let options = DecodeOptions {
                max_tokens: gen_len,
                sentence_mode,
                line_in_progress: !sentences.is_empty(),
                at_line_start: !continuation,
            };
            let decoded =
                LineDecoder::new(&mut self.model, sampler).generate(&context, options, trie.as_deref_mut())?;
            let text = self.postprocess(&decoded.text);

            let score = if decoded.stop.is_boundary() {
                self.entailment(&context, &decoded)?
            } else {
                1.0
            };
            let nli_ok = score >= self.config.nli_threshold;
            let is_forbidden = forbidden.contains(text.trim());
            let banned_remark = sentences.is_empty()
                && self.config.ban_remarks
                && !self.config.prose
                && looks_scenic(&text, continuation)
                && looks_scenic(last_prompt_line, false);

            if nli_ok && !is_forbidden && !banned_remark {
                sentences.push(text);
                if decoded.stop != StopReason::EndOfSentence || sentences.len() >= self.config.max_sentences {
                    return Ok(sentences.concat());
                }
                context.extend(decoded.tokens);
                continue;
            }

            if banned_remark {
                tracing::info!("Line is a banned scenic remark on retry {}", retries);
            } else if !nli_ok {
                tracing::info!("Line has a too low NLI score ({:.2}) on retry {}", score, retries);
            } else {
                tracing::info!("Line is forbidden on retry {}", retries);
            }
            retries += 1;

            let candidate = Rejected {
                text,
                forbidden: is_forbidden,
                score,
            };
            if best.as_ref().map_or(true, |b| candidate.better_than(b)) {
                best = Some(candidate);
            }
        }

        if !sentences.is_empty() {
            return Ok(sentences.concat());
        }
        if let Some(best) = best {
            tracing::warn!("Retry budget exhausted for {}, accepting best attempt", request.key);
            return Ok(best.text);
        }
        tracing::warn!("No room left in context for {}", request.key);
        Ok(String::new())
    }

    fn postprocess(&self, text: &str) -> String {
        let line = text.trim_end();
        if self.config.prose {
            line.replace(':', ";")
        } else {
            line.to_string()
        }
    }

    /// Entailment of a finished segment against what preceded it
    ///
    /// Prose is scored against the whole preceding text. Dialogue is scored
    /// against the earlier utterances of the same speaker; lines without a
    /// speaker are not scored.
    fn entailment(&mut self, context: &[TokenId], decoded: &Decoded) -> Result<f32, GenerationError> {
        let Some(scorer) = self.scorer.as_mut() else {
            return Ok(1.0);
        };

        if self.config.prose {
            let premise = self.model.detokenize(context);
            return Ok(scorer.score(&premise, &decoded.text)?);
        }

        let mut all = context.to_vec();
        all.extend_from_slice(&decoded.tokens);
        let decoded_all = self.model.detokenize(&all);
        let lines: Vec<&str> = decoded_all.split('\n').filter(|l| !l.is_empty()).collect();
        let Some(speaker) = lines.last().and_then(|l| l.split_once(':')).map(|(name, _)| name) else {
            return Ok(1.0);
        };
        if speaker.chars().count() <= 1 {
            return Ok(1.0);
        }

        let output = SPEAKER_PREFIX.replace_all(&decoded.text, "").into_owned();
        let utterances: Vec<String> = lines
            .iter()
            .filter(|l| l.trim().starts_with(speaker))
            .map(|l| {
                let mut utterance = SPEAKER_PREFIX.replace_all(l, "").trim().to_string();
                if !utterance.ends_with(['.', '?', '!']) {
                    utterance.push('.');
                }
                utterance
            })
            .collect();

        let mut premise = utterances.join(" ");
        if let Some(stripped) = premise.strip_suffix(output.as_str()) {
            premise = stripped.trim().to_string();
        }
        Ok(scorer.score(&premise, &output)?)
    }
}
