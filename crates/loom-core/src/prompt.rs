//! Building the model input for one slot of a branch

use crate::config::SchedulerConfig;
use crate::types::Scene;
use loom_decode::{join_lines, looks_scenic, GenerationRequest, OutlineHint};

/// Marker after which a scene is finished
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Speaker prefix forced on the next line, if the scene names speakers
///
/// The first line goes to `char1`, the second to `char2`; after that, when
/// both are set, whoever did not speak the previous line.
#[must_use]
pub fn forced_speaker<S: AsRef<str>>(
    prompt: &str,
    lines: &[S],
    char1: Option<&str>,
    char2: Option<&str>,
) -> String {
    let char1 = char1.filter(|c| !c.is_empty());
    let char2 = char2.filter(|c| !c.is_empty());

    match (lines.len(), char1, char2) {
        (0, Some(first), _) if prompt.is_empty() => format!("{first}:"),
        (0, Some(first), _) => format!("\n{first}:"),
        (1, _, Some(second)) => format!("\n{second}:"),
        (n, Some(first), Some(second)) if n >= 1 => {
            let last_is_second = lines
                .last()
                .is_some_and(|l| l.as_ref().trim().starts_with(second));
            if last_is_second {
                format!("\n{first}:")
            } else {
                format!("\n{second}:")
            }
        }
        _ => String::new(),
    }
}

/// Scene prompt joined with the lines before a slot, plus the forced prefix
#[must_use]
pub fn build_prompt<S: AsRef<str>>(scene: &Scene, lines: &[S]) -> (String, String) {
    let joined = join_lines(&scene.prompt, lines);
    let prepend = forced_speaker(
        &scene.prompt,
        lines,
        scene.char1.as_deref(),
        scene.char2.as_deref(),
    );
    (joined, prepend)
}

/// Request for the line after `lines`, and the speaker prefix forced on it
///
/// `forbidden` holds the slot's own rejected texts; the last
/// `forbidden_window` lines are added to it. Returns `None` once the scene
/// has reached its end marker.
#[must_use]
pub fn next_line_request<S: AsRef<str>>(
    scene: &Scene,
    lines: &[S],
    key: String,
    mut forbidden: Vec<String>,
    config: &SchedulerConfig,
) -> Option<(GenerationRequest, String)> {
    let (joined, prepend) = build_prompt(scene, lines);
    if joined.contains(END_OF_TEXT) {
        return None;
    }
    extend_with_window(&mut forbidden, &joined, config.forbidden_window);

    let mut request = GenerationRequest::new(key, format!("{joined}{prepend}")).with_forbidden(forbidden);
    if config.outlines {
        if let Some(outline) = scene.outline.as_deref().filter(|o| !o.is_empty()) {
            request = request.with_outline(outline_hint(outline, &joined));
        }
    }
    Some((request, prepend))
}

/// Non-empty lines of a joined prompt, stripped
#[must_use]
pub fn stripped_lines(joined: &str) -> Vec<&str> {
    joined.split('\n').map(str::trim).filter(|l| !l.is_empty()).collect()
}

/// Forbid repeating any of the last `window` lines
pub fn extend_with_window(forbidden: &mut Vec<String>, joined: &str, window: usize) {
    let lines = stripped_lines(joined);
    let start = lines.len().saturating_sub(window);
    forbidden.extend(lines[start..].iter().map(|l| (*l).to_string()));
}

/// Find the next unused outline remark
///
/// Outline sentences become `[sentence]` remarks. They are matched in order
/// against the lines written so far; dialogue lines since the last remark
/// are counted, and any stage direction resets the count.
#[must_use]
pub fn outline_hint(outline: &str, joined: &str) -> OutlineHint {
    let remarks: Vec<String> = outline
        .split('\n')
        .map(|o| format!("[{}]", o.trim()))
        .collect();

    let mut next = 0;
    let mut lines_since_remark = 0;
    for line in stripped_lines(joined) {
        if next >= remarks.len() {
            break;
        }
        if remarks[next] == line {
            next += 1;
            lines_since_remark = 0;
        } else if looks_scenic(line, false) {
            lines_since_remark = 0;
        } else {
            lines_since_remark += 1;
        }
    }

    OutlineHint {
        next_remark: remarks.get(next).cloned(),
        lines_since_remark,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(char1: Option<&str>, char2: Option<&str>) -> Scene {
        Scene {
            key: "demo".to_string(),
            prompt: "A room.".to_string(),
            outline: None,
            char1: char1.map(str::to_string),
            char2: char2.map(str::to_string),
            username: String::new(),
            timestamp: String::new(),
            translated_prompt: None,
            translated_outline: None,
        }
    }

    #[test]
    fn no_speakers_no_prefix() {
        let (joined, prepend) = build_prompt(&scene(None, None), &["Man: Hi."]);
        assert_eq!(joined, "A room.\nMan: Hi.");
        assert_eq!(prepend, "");
    }

    #[test]
    fn speakers_alternate() {
        let scene = scene(Some("Anna"), Some("Bob"));
        let none: [&str; 0] = [];
        assert_eq!(build_prompt(&scene, &none).1, "\nAnna:");
        assert_eq!(build_prompt(&scene, &["Anna: Hi."]).1, "\nBob:");
        assert_eq!(build_prompt(&scene, &["Anna: Hi.", "Bob: Yo."]).1, "\nAnna:");
        assert_eq!(build_prompt(&scene, &["Anna: Hi.", "Anna: Again."]).1, "\nBob:");
    }

    #[test]
    fn first_speaker_without_prompt() {
        let none: [&str; 0] = [];
        assert_eq!(forced_speaker("", &none, Some("Anna"), None), "Anna:");
        assert_eq!(forced_speaker("", &["Anna: Hi."], Some("Anna"), None), "");
        assert_eq!(forced_speaker("x", &none, Some(""), None), "");
    }

    #[test]
    fn window_takes_last_lines() {
        let mut forbidden = vec!["old".to_string()];
        extend_with_window(&mut forbidden, "A.\n\nB. \nC.\nD.\nE.", 4);
        assert_eq!(forbidden, vec!["old", "B.", "C.", "D.", "E."]);
    }

    #[test]
    fn next_request_carries_window_and_speaker() {
        let scene = scene(Some("Anna"), Some("Bob"));
        let config = SchedulerConfig {
            forbidden_window: 2,
            ..SchedulerConfig::default()
        };

        let (request, prepend) = next_line_request(
            &scene,
            &["Anna: Hi.", "Bob: Yo.", "Anna: Hm."],
            "demo-aaaa".to_string(),
            vec!["Bob: No.".to_string()],
            &config,
        )
        .unwrap();

        assert_eq!(prepend, "\nBob:");
        assert_eq!(request.prompt, "A room.\nAnna: Hi.\nBob: Yo.\nAnna: Hm.\nBob:");
        assert_eq!(request.forbidden, vec!["Bob: No.", "Bob: Yo.", "Anna: Hm."]);
        assert_eq!(request.outline, OutlineHint::default());
    }

    #[test]
    fn no_request_after_the_end() {
        let lines = [format!("Anna: Bye.{END_OF_TEXT}")];
        let request = next_line_request(
            &scene(None, None),
            &lines,
            "demo-aa".to_string(),
            Vec::new(),
            &SchedulerConfig::default(),
        );
        assert!(request.is_none());
    }

    #[test]
    fn outline_progress_is_tracked() {
        let outline = "They meet.\nThey part.";
        let hint = outline_hint(outline, "A room.\nAnna: Hi.");
        assert_eq!(hint.next_remark.as_deref(), Some("[They meet.]"));
        // the prompt line itself reads as scenic
        assert_eq!(hint.lines_since_remark, 1);

        let hint = outline_hint(outline, "A room.\n\n[They meet.]\nAnna: Hi.\nBob: Yo.");
        assert_eq!(hint.next_remark.as_deref(), Some("[They part.]"));
        assert_eq!(hint.lines_since_remark, 2);

        let hint = outline_hint(outline, "[They meet.]\n[They part.]\nAnna: Bye.");
        assert_eq!(hint.next_remark, None);
    }
}
