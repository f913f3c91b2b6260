//! Text heuristics over dialogue lines

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static BRACKETED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\[(].*[\])]$").expect("bracket pattern compiles")
});

/// Does this line look like a stage direction?
///
/// - `[He leaves.]` and `(pause)` are scenic
/// - `Peter: [looks into his bag]` is scenic
/// - a line without a speaker colon is scenic, unless it continues a line
///   whose speaker was already written
#[must_use]
pub fn looks_scenic(line: &str, is_continuation: bool) -> bool {
    if BRACKETED.is_match(line.trim()) {
        return true;
    }
    if is_continuation {
        return false;
    }
    match line.split_once(':') {
        Some((_, utterance)) => BRACKETED.is_match(utterance.trim()),
        None => true,
    }
}

/// Speaker names present in a prompt
///
/// Lines that carry brackets or slashes, and lines without a colon, are
/// skipped. The name is everything before the first colon.
#[must_use]
pub fn extract_character_names(prompt: &str) -> BTreeSet<String> {
    prompt
        .split('\n')
        .filter(|line| !line.contains(['[', ']', '/']))
        .filter_map(|line| line.split_once(':'))
        .map(|(name, _)| name.to_string())
        .filter(|name| !name.trim().is_empty())
        .collect()
}

/// Append lines to a prompt the way the model reads them
///
/// Empty (cut) lines are skipped. Each line starts on a new line unless the
/// text so far ends in a speaker colon, so `Anna:` followed by ` Hi.` reads
/// `Anna: Hi.`.
#[must_use]
pub fn join_lines<S: AsRef<str>>(prompt: &str, lines: &[S]) -> String {
    let mut text = prompt.to_string();
    for line in lines.iter().map(AsRef::as_ref).filter(|l| !l.is_empty()) {
        if !text.is_empty() && !text.ends_with(':') {
            text.push('\n');
        }
        text.push_str(line);
    }
    text
}

/// Speaker of a line, if it has one
#[must_use]
pub fn speaker(line: &str) -> Option<&str> {
    line.split_once(':').map(|(name, _)| name.trim())
}

/// Shorten text for log lines, keeping both ends
#[must_use]
pub fn shorten(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count < max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(count - half).collect();
    format!("{head}...{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenic_lines() {
        assert!(looks_scenic("[He leaves.]", false));
        assert!(looks_scenic("(a pause)", false));
        assert!(looks_scenic("Peter: [looks into his bag]", false));
        assert!(looks_scenic("The lights go out.", false));
    }

    #[test]
    fn dialogue_lines() {
        assert!(!looks_scenic("Peter: Hello.", false));
        assert!(!looks_scenic(" and then he left.", true));
        assert!(looks_scenic("[then he left]", true));
    }

    #[test]
    fn names_from_prompt() {
        let prompt = "[A room.]\nAnna: Hi.\nBob: Hey: you.\nhttp://x: y\nnarration\nAnna: Again.";
        let names: Vec<String> = extract_character_names(prompt).into_iter().collect();
        assert_eq!(names, vec!["Anna".to_string(), "Bob".to_string()]);
    }

    #[test]
    fn join_skips_cut_lines_and_continues_speakers() {
        let lines = ["Anna: Hi.", "", "Bob:", " Yo.", "\n[Night.]"];
        assert_eq!(
            join_lines("A room.", &lines),
            "A room.\nAnna: Hi.\nBob: Yo.\n\n[Night.]"
        );
        assert_eq!(join_lines("", &["Anna: Hi."]), "Anna: Hi.");
    }

    #[test]
    fn speaker_of_line() {
        assert_eq!(speaker("Anna: Hi."), Some("Anna"));
        assert_eq!(speaker("[Night.]"), None);
    }

    #[test]
    fn shorten_keeps_ends() {
        assert_eq!(shorten("short", 50), "short");
        assert_eq!(shorten("abcdefghij", 4), "ab...ij");
    }
}
