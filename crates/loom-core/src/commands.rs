//! JSON command surface
//!
//! A request is one JSON object holding exactly one verb. Verbs are checked
//! in a fixed order, so an object carrying both `human_input` and `key` is a
//! human input, and one carrying `rating` and `key` is a rating.

use crate::error::{LoomError, LoomResult};
use crate::types::{InputType, SearchField};
use loom_keys::{expand, validate, BranchKey, KeyError};
use serde::Deserialize;
use serde_json::{json, Value};

/// A parsed request
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Liveness check
    Ping,
    /// Stop the server
    Kill,
    /// Create a scene
    Scene(SceneArgs),
    /// Store a human-written line
    HumanInput(HumanInputArgs),
    /// Rate a branch
    Rating(RatingArgs),
    /// Resolve a branch
    Key(KeyArgs),
    /// Substring search
    Search(SearchArgs),
    /// Resolve a branch speculatively, without waiting
    Pregenerate(BranchKey),
    /// Access log listing
    Recent(RecentArgs),
    /// Scene listing
    ListScenes(ListScenesArgs),
}

/// Arguments of `scene`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SceneArgs {
    /// Requested scene id, normalized before storing
    pub key: String,
    /// Prompt text
    pub scene: String,
    /// Outline, one sentence per line
    #[serde(default)]
    pub outline: Option<String>,
    /// First forced speaker
    #[serde(default)]
    pub char1: Option<String>,
    /// Second forced speaker
    #[serde(default)]
    pub char2: Option<String>,
    /// Creator
    #[serde(default)]
    pub username: String,
}

/// Arguments of `human_input`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HumanInputArgs {
    /// Expanded parent key
    pub key: String,
    /// Text as typed
    pub text: String,
    /// Wrapping to apply
    pub input_type: InputType,
}

/// Arguments of `rating`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatingArgs {
    /// Expanded key
    pub key: String,
    /// 1 to 5
    pub rating: i64,
    /// Rating user
    pub username: String,
}

/// Arguments of `key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyArgs {
    /// Key to resolve
    pub key: BranchKey,
    /// Requesting user
    pub username: String,
}

/// Arguments of `search`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchArgs {
    /// Column to search
    pub field: SearchField,
    /// Substring, may contain `%` and `_` wildcards
    pub query: String,
}

/// Arguments of `recent`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentArgs {
    /// Entries per page; 0 lists everything
    pub page_len: usize,
    /// Zero-based page
    pub page: usize,
    /// Only this user's entries
    pub username_limit: Option<String>,
}

/// Arguments of `list_scenes`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListScenesArgs {
    /// Only this user's scenes
    pub username_limit: Option<String>,
    /// Only scenes with an outline
    pub outline_limit: bool,
}

impl Command {
    /// Parse a request object
    ///
    /// # Errors
    /// - `LoomError::RequestMalformed` for unknown verbs or bad arguments
    /// - `LoomError::InvalidKey` if `key` or `pregenerate` fails validation
    pub fn parse(data: &Value) -> LoomResult<Self> {
        let Some(object) = data.as_object() else {
            return Err(LoomError::RequestMalformed("request must be a JSON object".to_string()));
        };
        let has = |verb: &str| object.contains_key(verb);

        if has("ping") {
            return Ok(Self::Ping);
        }
        if let Some(killme) = object.get("killme") {
            return if killme.as_str() == Some("now") {
                Ok(Self::Kill)
            } else {
                Err(LoomError::RequestMalformed("killme must be \"now\"".to_string()))
            };
        }
        if has("scene") {
            return Ok(Self::Scene(SceneArgs::deserialize(data)?));
        }

        let username = string_field(data, "username").unwrap_or_default();

        if has("human_input") {
            let input_type = match data.get("input_type") {
                Some(value) if !value.is_null() => InputType::deserialize(value)?,
                _ => InputType::default(),
            };
            return Ok(Self::HumanInput(HumanInputArgs {
                key: expanded_key(data)?,
                text: required_string(data, "human_input")?,
                input_type,
            }));
        }
        if let Some(rating) = object.get("rating") {
            let rating = rating
                .as_i64()
                .filter(|r| (1..=5).contains(r))
                .ok_or_else(|| LoomError::RequestMalformed(format!("rating must be 1 to 5, got {rating}")))?;
            return Ok(Self::Rating(RatingArgs {
                key: expanded_key(data)?,
                rating,
                username,
            }));
        }
        if has("key") {
            let raw = required_string(data, "key")?;
            return Ok(Self::Key(KeyArgs {
                key: BranchKey::parse(&raw)?,
                username,
            }));
        }
        if has("search") {
            return Ok(Self::Search(SearchArgs {
                field: required_string(data, "search")?.parse()?,
                query: required_string(data, "query")?,
            }));
        }
        if has("pregenerate") {
            let raw = required_string(data, "pregenerate")?;
            return Ok(Self::Pregenerate(BranchKey::parse(&raw)?));
        }
        if let Some(page_len) = object.get("recent") {
            return Ok(Self::Recent(RecentArgs {
                page_len: count(page_len, "recent")?,
                page: object.get("page").map_or(Ok(0), |p| count(p, "page"))?,
                username_limit: string_field(data, "username_limit"),
            }));
        }
        if has("list_scenes") {
            return Ok(Self::ListScenes(ListScenesArgs {
                username_limit: string_field(data, "username_limit"),
                outline_limit: object.get("outline_limit").is_some_and(truthy),
            }));
        }

        Err(LoomError::RequestMalformed(format!("unknown command: {data}")))
    }

    /// Verb name, for logs
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Kill => "killme",
            Self::Scene(_) => "scene",
            Self::HumanInput(_) => "human_input",
            Self::Rating(_) => "rating",
            Self::Key(_) => "key",
            Self::Search(_) => "search",
            Self::Pregenerate(_) => "pregenerate",
            Self::Recent(_) => "recent",
            Self::ListScenes(_) => "list_scenes",
        }
    }
}

/// Render a command result the way clients expect it
#[must_use]
pub fn render(result: LoomResult<Value>) -> Value {
    match result {
        Ok(value) => value,
        Err(e) => json!({ "error": e.to_string() }),
    }
}

fn string_field(data: &Value, field: &str) -> Option<String> {
    data.get(field).and_then(Value::as_str).map(str::to_string)
}

fn required_string(data: &Value, field: &str) -> LoomResult<String> {
    string_field(data, field).ok_or_else(|| LoomError::RequestMalformed(format!("missing string field {field}")))
}

fn expanded_key(data: &Value) -> LoomResult<String> {
    let raw = required_string(data, "key")?;
    if !validate(&raw) {
        return Err(KeyError::Invalid(raw).into());
    }
    Ok(expand(&raw)?)
}

fn count(value: &Value, field: &str) -> LoomResult<usize> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(false) | Value::Null => Some(0),
        _ => None,
    };
    parsed
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| LoomError::RequestMalformed(format!("{field} must be a non-negative integer")))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
