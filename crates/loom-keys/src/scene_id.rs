//! Scene id normalization

use crate::error::KeyError;

/// Turn a user-supplied scene title into an ASCII scene id.
///
/// Diacritics are transliterated, dashes and spaces become `_`, anything
/// else outside `[A-Za-z0-9_]` is dropped.
///
/// # Errors
/// Returns `KeyError::EmptySceneId` if nothing survives normalization.
pub fn normalize_scene_id(raw: &str) -> Result<String, KeyError> {
    let ascii = deunicode::deunicode(&raw.replace(['\u{2013}', '\u{2014}'], "-"));

    let id: String = ascii
        .chars()
        .filter_map(|c| match c {
            '-' | ' ' => Some('_'),
            c if c.is_ascii_alphanumeric() || c == '_' => Some(c),
            _ => None,
        })
        .collect();

    if id.is_empty() {
        return Err(KeyError::EmptySceneId);
    }
    Ok(id)
}
