//! Line and sentence boundary detection on decoded text

use once_cell::sync::Lazy;
use regex::Regex;

/// Abbreviations (and single initials) whose trailing dot does not end a sentence
static UNBREAKING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^.*(\s[A-Z]|v|vs|i\.e|rev|e\.g|Adj|Adm|Adv|Asst|Bart|Bldg|Brig|Bros|Capt|Cmdr|Col|Comdr|Con|Corp|Cpl|DR|Dr|Drs|Ens|Gen|Gov|Hon|Hr|Hosp|Insp|Lt|MM|MR|MRS|MS|Maj|Messrs|Mlle|Mme|Mr|Mrs|Ms|Msgr|Op|Ord|Pfc|Ph|Prof|Pvt|Rep|Reps|Res|Rev|Rt|Sen|Sens|Sfc|Sgt|Sr|St|Supt|Surg)\.\s*",
    )
    .expect("abbreviation pattern compiles")
});

/// Characters inspected for an abbreviation before a dot
const ABBREVIATION_WINDOW: usize = 9;

/// Generated text ends a line: it ends in a newline and either holds some
/// non-whitespace or continues a line already in progress.
#[must_use]
pub fn is_end_of_line(generated: &str, line_in_progress: bool) -> bool {
    generated.ends_with('\n') && (line_in_progress || !generated.trim().is_empty())
}

/// The last token closed a sentence
///
/// `piece` is the decoded last token, `generated` everything decoded so far.
/// A dot right after a known abbreviation does not count.
#[must_use]
pub fn is_end_of_sentence(piece: &str, generated: &str) -> bool {
    if piece.contains('.') {
        let tail = last_chars(generated, ABBREVIATION_WINDOW);
        if UNBREAKING.is_match(tail) {
            return false;
        }
    }
    piece.contains(['.', '?', '!', ';'])
}

fn last_chars(text: &str, n: usize) -> &str {
    let start = text
        .char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newline_after_text_ends_line() {
        assert!(is_end_of_line("Hello there.\n", false));
        assert!(!is_end_of_line("Hello there.", false));
    }

    #[test]
    fn leading_newline_does_not_end_line() {
        assert!(!is_end_of_line("\n", false));
        assert!(!is_end_of_line("  \n", false));
        assert!(is_end_of_line("\n", true));
    }

    #[test]
    fn sentence_punctuation() {
        assert!(is_end_of_sentence(".", "He left."));
        assert!(is_end_of_sentence("?", "Why?"));
        assert!(is_end_of_sentence("!", "Go!"));
        assert!(is_end_of_sentence(";", "wait;"));
        assert!(!is_end_of_sentence(",", "well,"));
    }

    #[test]
    fn abbreviations_do_not_end_sentences() {
        assert!(!is_end_of_sentence(".", "I met Mr."));
        assert!(!is_end_of_sentence(".", "Ask Dr."));
        assert!(!is_end_of_sentence(".", "by John F."));
        assert!(!is_end_of_sentence(".", "fruit, e.g."));
    }

    #[test]
    fn window_is_character_based() {
        assert_eq!(last_chars("žluťoučký kůň", 3), "kůň");
        assert_eq!(last_chars("ab", 9), "ab");
    }
}
