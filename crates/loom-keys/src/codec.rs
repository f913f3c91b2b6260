//! Pure functions over the textual key grammar
//!
//! The scene part of a key is passed through untouched by every function;
//! only the path after the first `-` is rewritten.

use crate::error::KeyError;

/// Cut the line at the given position
pub const CUT: char = '_';

/// Insert a new line before the given position
pub const INSERT: char = '.';

/// Regenerate the line at the given position
pub const REGENERATE: char = '~';

/// Largest run a `<digits><letter>` segment may expand to
pub const MAX_RUN_LENGTH: usize = 10_000;

const SCENE_DISPLAY_LIMIT: usize = 70;
const PATH_DISPLAY_LIMIT: usize = 50;
const ELLIPSIS: &str = "(...)";

/// Split a key into its scene prefix (including the trailing `-`) and path.
///
/// A key without any `-` is a bare path with an empty scene prefix.
#[inline]
#[must_use]
pub fn split_scene(key: &str) -> (&str, &str) {
    match key.find('-') {
        Some(idx) => (&key[..=idx], &key[idx + 1..]),
        None => ("", key),
    }
}

/// Is this one of the edit command characters?
#[inline]
#[must_use]
pub fn is_command(c: char) -> bool {
    matches!(c, CUT | INSERT | REGENERATE)
}

/// Check that a key (compressed or expanded) is safe to process.
///
/// The path must be ASCII, use only `[A-Za-z0-9_.~-]` and end in a letter or
/// command character. An empty path is valid (the scene root).
#[must_use]
pub fn validate(key: &str) -> bool {
    let (_, path) = split_scene(key);
    if path.is_empty() {
        return true;
    }
    if !path.is_ascii() {
        return false;
    }

    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '~' | '-');
    let ends_well = path
        .chars()
        .last()
        .is_some_and(|c| c.is_ascii_alphabetic() || is_command(c));

    ends_well && path.chars().all(allowed)
}

/// Run-length encode maximal runs of an identical letter (`aaa` -> `3a`).
#[must_use]
pub fn compress(key: &str) -> String {
    let (scene, path) = split_scene(key);
    let mut out = String::with_capacity(key.len());
    out.push_str(scene);
    out.push_str(&compress_path(path));
    out
}

/// Compress and truncate for log lines and listings.
///
/// Long scene ids keep their first 70 characters, long paths their last 50.
/// The result is for display only and cannot be expanded back to the full key.
#[must_use]
pub fn compress_display(key: &str) -> String {
    let (scene, path) = split_scene(key);

    let scene = if scene.chars().count() > SCENE_DISPLAY_LIMIT {
        let head: String = scene.chars().take(SCENE_DISPLAY_LIMIT).collect();
        format!("{head}{ELLIPSIS}-")
    } else {
        scene.to_string()
    };

    let path = compress_path(path);
    let path_len = path.chars().count();
    let path = if path_len > PATH_DISPLAY_LIMIT {
        let tail: String = path.chars().skip(path_len - PATH_DISPLAY_LIMIT).collect();
        format!("{ELLIPSIS}{tail}")
    } else {
        path
    };

    scene + &path
}

fn compress_path(path: &str) -> String {
    let chars: Vec<char> = path.chars().collect();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let mut run = 1;
        if c.is_ascii_alphabetic() {
            while i + run < chars.len() && chars[i + run] == c {
                run += 1;
            }
        }
        if run > 1 {
            out.push_str(&run.to_string());
        }
        out.push(c);
        i += run;
    }

    out
}

/// Inverse of [`compress`]: every `<digits><letter>` becomes the repeated letter.
///
/// Command segments (`<digits>_`, `<digits>.`, `<digits>~`) are left as they are.
///
/// # Errors
/// - `KeyError::RunTooLong` if a run exceeds [`MAX_RUN_LENGTH`]
pub fn expand(key: &str) -> Result<String, KeyError> {
    let (scene, path) = split_scene(key);
    let mut out = String::with_capacity(key.len());
    out.push_str(scene);

    let mut digits = String::new();
    for c in path.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else if c.is_ascii_alphabetic() && !digits.is_empty() {
            let run = parse_run(&digits)?;
            out.extend(std::iter::repeat(c).take(run));
            digits.clear();
        } else {
            out.push_str(&digits);
            digits.clear();
            out.push(c);
        }
    }
    out.push_str(&digits);

    Ok(out)
}

fn parse_run(digits: &str) -> Result<usize, KeyError> {
    let too_long = || KeyError::RunTooLong {
        run: digits.to_string(),
        limit: MAX_RUN_LENGTH,
    };
    let run: usize = digits.parse().map_err(|_| too_long())?;
    if run > MAX_RUN_LENGTH {
        return Err(too_long());
    }
    Ok(run)
}

/// Tokenize an expanded path into segments.
///
/// Plain letters become one-character segments, commands become
/// `<digits><command>` segments. Concatenating the result yields the input.
///
/// # Errors
/// - `KeyError::Malformed` for digits without a closing command, a command
///   without a position, or any character outside the path alphabet
pub fn split(path: &str) -> Result<Vec<String>, KeyError> {
    let mut parts = Vec::new();
    let mut buf = String::new();

    for c in path.chars() {
        if c.is_ascii_digit() {
            buf.push(c);
        } else if is_command(c) {
            if buf.is_empty() {
                return Err(KeyError::malformed(path, format!("command '{c}' has no position")));
            }
            buf.push(c);
            parts.push(std::mem::take(&mut buf));
        } else if c.is_ascii_alphabetic() {
            if !buf.is_empty() {
                return Err(KeyError::malformed(
                    path,
                    format!("digits '{buf}' followed by letter '{c}' (path not expanded?)"),
                ));
            }
            parts.push(c.to_string());
        } else {
            return Err(KeyError::malformed(path, format!("unexpected character '{c}'")));
        }
    }

    if !buf.is_empty() {
        return Err(KeyError::malformed(path, format!("dangling digits '{buf}'")));
    }

    Ok(parts)
}
