//! Records exchanged between the store, the scheduler and clients

use crate::error::LoomError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Timestamp format used in every table
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time in [`TIMESTAMP_FORMAT`]
#[must_use]
pub fn timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// A stored scene
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    /// Normalized scene id
    pub key: String,
    /// Scene prompt
    pub prompt: String,
    /// Outline, one sentence per line
    pub outline: Option<String>,
    /// First forced speaker
    pub char1: Option<String>,
    /// Second forced speaker
    pub char2: Option<String>,
    /// Creator
    pub username: String,
    /// Creation time
    pub timestamp: String,
    /// Translated prompt, filled lazily
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_prompt: Option<String>,
    /// Translated outline, filled lazily
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_outline: Option<String>,
}

/// Scene about to be inserted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewScene {
    /// Normalized id to try first
    pub key: String,
    /// Scene prompt
    pub prompt: String,
    /// Outline
    pub outline: Option<String>,
    /// First forced speaker
    pub char1: Option<String>,
    /// Second forced speaker
    pub char2: Option<String>,
    /// Creator
    pub username: String,
}

/// A stored line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    /// Full expanded key
    pub key: String,
    /// Line text, possibly empty
    pub text: String,
    /// Model name, or the human input type
    pub model: String,
    /// Server version that stored the line
    pub server_version: String,
    /// Storage time
    pub timestamp: String,
    /// Translated text, filled lazily
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
}

impl Line {
    /// Create a line stamped with the current time
    #[must_use]
    pub fn new(key: impl Into<String>, text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            text: text.into(),
            model: model.into(),
            server_version: crate::VERSION.to_string(),
            timestamp: timestamp(),
            translated_text: None,
        }
    }
}

/// One row of the access log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    /// Requested key
    pub key: String,
    /// Requesting user
    pub username: String,
    /// Last access
    pub timestamp: String,
    /// Rating 1-5, if given
    pub rating: Option<i64>,
}

/// Resolved state of a branch, as returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneView {
    /// Requested key, expanded
    pub key: String,
    /// Scene prompt
    pub prompt: String,
    /// Materialized lines; cut lines are empty
    pub lines: Vec<String>,
    /// Scene outline
    pub outline: Option<String>,
    /// Latest rating of this key
    pub rating: Option<i64>,
    /// Translated prompt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_prompt: Option<String>,
    /// Translated lines
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_lines: Option<Vec<String>>,
    /// Translated outline
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_outline: Option<String>,
}

/// How a human-written line is wrapped before storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// Stored as written
    #[default]
    Human,
    /// Synopsis line, stored as a `[stage direction]`
    SynLine,
    /// Speaker name, stored as `Name:` so the model continues the line
    CharName,
}

impl InputType {
    /// Apply the wrapping for this input type
    #[must_use]
    pub fn format(self, text: &str) -> String {
        let text = text.replace("\r\n", "\n");
        let text = text.trim_end();
        match self {
            Self::Human => text.to_string(),
            Self::SynLine => {
                let inner = text.trim();
                if inner.starts_with('[') && inner.ends_with(']') {
                    format!("\n{inner}")
                } else {
                    format!("\n[{inner}]")
                }
            }
            Self::CharName => {
                let name = text.trim();
                if name.ends_with(':') {
                    format!("\n{name}")
                } else {
                    format!("\n{name}:")
                }
            }
        }
    }

    /// Value recorded in the `model` column
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::SynLine => "syn_line",
            Self::CharName => "char_name",
        }
    }
}

/// Columns open to search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    /// `scenes.prompt`
    Prompt,
    /// `scenes.translated_prompt`
    TranslatedPrompt,
    /// `lines.text`
    Text,
    /// `lines.translated_text`
    TranslatedText,
}

impl SearchField {
    /// Column name
    #[inline]
    #[must_use]
    pub fn column(self) -> &'static str {
        match self {
            Self::Prompt => "prompt",
            Self::TranslatedPrompt => "translated_prompt",
            Self::Text => "text",
            Self::TranslatedText => "translated_text",
        }
    }

    /// Does the column live in `scenes` (otherwise `lines`)?
    #[inline]
    #[must_use]
    pub fn in_scenes(self) -> bool {
        matches!(self, Self::Prompt | Self::TranslatedPrompt)
    }
}

impl FromStr for SearchField {
    type Err = LoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prompt" => Ok(Self::Prompt),
            "translated_prompt" => Ok(Self::TranslatedPrompt),
            "text" => Ok(Self::Text),
            "translated_text" => Ok(Self::TranslatedText),
            other => Err(LoomError::RequestMalformed(format!("cannot search field {other}"))),
        }
    }
}

impl Display for SearchField {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Rows matching a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SearchResults {
    /// Matching scenes
    Scenes(Vec<Scene>),
    /// Matching lines
    Lines(Vec<Line>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syn_line_is_bracketed_once() {
        assert_eq!(InputType::SynLine.format("[laughs]"), "\n[laughs]");
        assert_eq!(InputType::SynLine.format("laughs"), "\n[laughs]");
    }

    #[test]
    fn char_name_ends_in_colon() {
        assert_eq!(InputType::CharName.format("Anna"), "\nAnna:");
        assert_eq!(InputType::CharName.format("Anna: \r\n"), "\nAnna:");
    }

    #[test]
    fn human_input_is_normalized() {
        assert_eq!(InputType::Human.format("Anna: Hi.\r\nBob: Yo.  \n"), "Anna: Hi.\nBob: Yo.");
    }

    #[test]
    fn input_type_deserializes_snake_case() {
        let t: InputType = serde_json::from_str(r#""syn_line""#).unwrap();
        assert_eq!(t, InputType::SynLine);
    }

    #[test]
    fn search_field_allow_list() {
        assert_eq!("text".parse::<SearchField>().unwrap(), SearchField::Text);
        assert!("username".parse::<SearchField>().is_err());
        assert!(SearchField::TranslatedPrompt.in_scenes());
    }
}
