//! Keys as sequences of edit operations
//!
//! Provides [`KeyOp`] (one path segment) and [`BranchKey`] (a validated,
//! expanded `scene_id-path` pair).

use crate::codec::{self, CUT, INSERT, REGENERATE};
use crate::error::KeyError;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// One path segment, interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyOp {
    /// Append the n-th variant of the next line (`a`..`z` machine, `A`..`Z` human)
    Continue(char),
    /// Blank the line at this position (`<n>_`)
    Cut(usize),
    /// Open a new slot before this position (`<n>.`)
    Insert(usize),
    /// Replace the line at this position (`<n>~`)
    Regenerate(usize),
}

impl KeyOp {
    /// Parse a single segment as produced by [`codec::split`]
    ///
    /// # Errors
    /// Returns `KeyError::Malformed` for anything that is not a letter or
    /// `<digits><command>`.
    pub fn parse(segment: &str) -> Result<Self, KeyError> {
        let mut chars = segment.chars();
        let Some(last) = chars.next_back() else {
            return Err(KeyError::malformed(segment, "empty segment"));
        };

        if segment.len() == 1 && last.is_ascii_alphabetic() {
            return Ok(Self::Continue(last));
        }

        let digits = chars.as_str();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(KeyError::malformed(segment, "expected <digits><command>"));
        }
        let position: usize = digits
            .parse()
            .map_err(|_| KeyError::malformed(segment, "position out of range"))?;

        match last {
            CUT => Ok(Self::Cut(position)),
            INSERT => Ok(Self::Insert(position)),
            REGENERATE => Ok(Self::Regenerate(position)),
            other => Err(KeyError::malformed(segment, format!("unknown command '{other}'"))),
        }
    }

    /// Line written by a person rather than the model
    #[inline]
    #[must_use]
    pub fn is_human(&self) -> bool {
        matches!(self, Self::Continue(c) if c.is_ascii_uppercase())
    }

    /// Target position for commands; `None` for plain continuations
    #[inline]
    #[must_use]
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::Continue(_) => None,
            Self::Cut(n) | Self::Insert(n) | Self::Regenerate(n) => Some(*n),
        }
    }
}

impl Display for KeyOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue(c) => write!(f, "{c}"),
            Self::Cut(n) => write!(f, "{n}{CUT}"),
            Self::Insert(n) => write!(f, "{n}{INSERT}"),
            Self::Regenerate(n) => write!(f, "{n}{REGENERATE}"),
        }
    }
}

impl FromStr for KeyOp {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A validated key in expanded form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchKey {
    scene_id: String,
    path: String,
}

impl BranchKey {
    /// Validate and expand a client-supplied key
    ///
    /// # Errors
    /// - `KeyError::Invalid` if [`codec::validate`] rejects the key
    /// - `KeyError::RunTooLong` if expansion would blow up
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        if !codec::validate(key) {
            return Err(KeyError::Invalid(key.to_string()));
        }
        let expanded = codec::expand(key)?;
        let (scene, path) = codec::split_scene(&expanded);
        Ok(Self {
            scene_id: scene.trim_end_matches('-').to_string(),
            path: path.to_string(),
        })
    }

    /// Key of the scene root (`scene_id-`)
    #[inline]
    #[must_use]
    pub fn root(scene_id: impl Into<String>) -> Self {
        Self {
            scene_id: scene_id.into(),
            path: String::new(),
        }
    }

    /// Scene id without the trailing `-`
    #[inline]
    #[must_use]
    pub fn scene_id(&self) -> &str {
        &self.scene_id
    }

    /// Expanded path
    #[inline]
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path tokenized into raw segments
    ///
    /// # Errors
    /// See [`codec::split`].
    pub fn segments(&self) -> Result<Vec<String>, KeyError> {
        codec::split(&self.path)
    }

    /// Path interpreted as edit operations
    ///
    /// # Errors
    /// See [`codec::split`].
    pub fn ops(&self) -> Result<Vec<KeyOp>, KeyError> {
        self.segments()?.iter().map(|s| KeyOp::parse(s)).collect()
    }

    /// Key with one more segment appended
    #[inline]
    #[must_use]
    pub fn child(&self, op: KeyOp) -> Self {
        Self {
            scene_id: self.scene_id.clone(),
            path: format!("{}{op}", self.path),
        }
    }

    /// Compressed form for display
    #[inline]
    #[must_use]
    pub fn display(&self) -> String {
        codec::compress_display(&self.to_string())
    }
}

impl Display for BranchKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.scene_id, self.path)
    }
}

impl FromStr for BranchKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_parse_letters_and_commands() {
        assert_eq!(KeyOp::parse("a").unwrap(), KeyOp::Continue('a'));
        assert_eq!(KeyOp::parse("Q").unwrap(), KeyOp::Continue('Q'));
        assert_eq!(KeyOp::parse("2_").unwrap(), KeyOp::Cut(2));
        assert_eq!(KeyOp::parse("10.").unwrap(), KeyOp::Insert(10));
        assert_eq!(KeyOp::parse("0~").unwrap(), KeyOp::Regenerate(0));
    }

    #[test]
    fn op_parse_rejects_garbage() {
        assert!(KeyOp::parse("").is_err());
        assert!(KeyOp::parse("_").is_err());
        assert!(KeyOp::parse("2x").is_err());
        assert!(KeyOp::parse("a_").is_err());
    }

    #[test]
    fn op_display_round_trips() {
        for seg in ["a", "Z", "3_", "12.", "0~"] {
            assert_eq!(KeyOp::parse(seg).unwrap().to_string(), seg);
        }
    }

    #[test]
    fn op_is_human() {
        assert!(KeyOp::Continue('B').is_human());
        assert!(!KeyOp::Continue('b').is_human());
        assert!(!KeyOp::Cut(1).is_human());
    }

    #[test]
    fn branch_key_parse_expands() {
        let key = BranchKey::parse("demo-3a1_").unwrap();
        assert_eq!(key.scene_id(), "demo");
        assert_eq!(key.path(), "aaa1_");
        assert_eq!(key.to_string(), "demo-aaa1_");
        assert_eq!(
            key.ops().unwrap(),
            vec![
                KeyOp::Continue('a'),
                KeyOp::Continue('a'),
                KeyOp::Continue('a'),
                KeyOp::Cut(1)
            ]
        );
    }

    #[test]
    fn branch_key_rejects_invalid() {
        assert!(matches!(BranchKey::parse("demo-a3"), Err(KeyError::Invalid(_))));
    }

    #[test]
    fn branch_key_root_and_child() {
        let root = BranchKey::root("demo");
        assert_eq!(root.to_string(), "demo-");
        let child = root.child(KeyOp::Continue('a')).child(KeyOp::Insert(0));
        assert_eq!(child.to_string(), "demo-a0.");
    }

    #[test]
    fn branch_key_display_is_compressed() {
        let key = BranchKey::parse("demo-aaaa").unwrap();
        assert_eq!(key.display(), "demo-4a");
    }
}
