//! Normalizing translation-server payloads into one record shape.
//!
//! The helper answers with a JSON list of Zotero items, a bare item, or a
//! plain-text error message. Downstream code reads fields under `data`, the
//! way items fetched from a Zotero library are laid out, so `data` is
//! synthesized when the helper left it out.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, TranslatorError};

/// One normalized item; always carries a `data` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct TranslationResult(Map<String, Value>);

impl TryFrom<Map<String, Value>> for TranslationResult {
    type Error = TranslatorError;

    fn try_from(item: Map<String, Value>) -> Result<Self> {
        Self::from_item(item)
    }
}

impl From<TranslationResult> for Map<String, Value> {
    fn from(result: TranslationResult) -> Self {
        result.0
    }
}

/// An author-like creator with both name parts present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creator {
    pub first_name: String,
    pub last_name: String,
    pub creator_type: Option<String>,
}

/// Turn a raw helper response body into a [`TranslationResult`].
pub fn normalize_payload(body: &[u8]) -> Result<TranslationResult> {
    let text = String::from_utf8_lossy(body);
    let value = serde_json::from_str::<Value>(&text)
        .unwrap_or_else(|_| Value::String(text.into_owned()));
    normalize_value(value)
}

/// Same as [`normalize_payload`], for an already-decoded value.
pub fn normalize_value(value: Value) -> Result<TranslationResult> {
    let item = match value {
        // e.g. "The remote document is not in a supported format"
        Value::String(message) => return Err(TranslatorError::TranslationRejected(message)),
        Value::Array(items) => match items.into_iter().next() {
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(TranslatorError::MalformedResponse(format!(
                    "expected a list of objects, got a list of {}",
                    kind(&other)
                )));
            }
            None => {
                return Err(TranslatorError::MalformedResponse(
                    "empty item list".to_string(),
                ));
            }
        },
        Value::Object(map) => map,
        other => {
            return Err(TranslatorError::MalformedResponse(format!(
                "expected an object or a list, got {}",
                kind(&other)
            )));
        }
    };
    TranslationResult::from_item(item)
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

impl TranslationResult {
    /// Wrap a single item, adding `data` as a shallow copy of the top-level
    /// fields when it is absent.
    pub fn from_item(mut item: Map<String, Value>) -> Result<Self> {
        match item.get("data") {
            None => {
                let copy = Value::Object(item.clone());
                item.insert("data".to_string(), copy);
            }
            Some(Value::Object(_)) => {}
            Some(other) => {
                return Err(TranslatorError::MalformedResponse(format!(
                    "`data` must be an object, got {}",
                    kind(other)
                )));
            }
        }
        Ok(Self(item))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// The `data` object; present by construction.
    pub fn data(&self) -> &Map<String, Value> {
        static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
        self.0
            .get("data")
            .and_then(Value::as_object)
            .unwrap_or_else(|| EMPTY.get_or_init(Map::new))
    }

    fn data_str(&self, field: &str) -> Option<&str> {
        self.data()
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn key(&self) -> Option<&str> {
        self.0
            .get("key")
            .and_then(Value::as_str)
            .or_else(|| self.data_str("key"))
    }

    pub fn item_type(&self) -> Option<&str> {
        self.data_str("itemType")
    }

    pub fn title(&self) -> Option<&str> {
        self.data_str("title")
    }

    pub fn abstract_note(&self) -> Option<&str> {
        self.data_str("abstractNote")
    }

    pub fn url(&self) -> Option<&str> {
        self.data_str("url")
    }

    pub fn doi(&self) -> Option<&str> {
        self.data_str("DOI")
    }

    /// The last path segment of an arxiv.org URL.
    pub fn arxiv_id(&self) -> Option<&str> {
        let url = self.url()?;
        if !url.contains("arxiv.org") {
            return None;
        }
        url.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|id| !id.is_empty())
    }

    /// Creators carrying both `firstName` and `lastName`; single-field
    /// creators (institutions) are skipped.
    pub fn authors(&self) -> Vec<Creator> {
        self.data()
            .get("creators")
            .and_then(Value::as_array)
            .map(|creators| {
                creators
                    .iter()
                    .filter_map(|c| {
                        Some(Creator {
                            first_name: c.get("firstName")?.as_str()?.to_string(),
                            last_name: c.get("lastName")?.as_str()?.to_string(),
                            creator_type: c
                                .get("creatorType")
                                .and_then(Value::as_str)
                                .map(String::from),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tags(&self) -> Vec<&str> {
        self.data()
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.get("tag").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn year(&self) -> Option<i32> {
        parse_year(self.data_str("date")?)
    }
}

/// Extract a year from the free-form dates Zotero items carry
/// (`2021`, `2021-03-04`, `March 4, 2021`, `04/03/2021`).
pub fn parse_year(date: &str) -> Option<i32> {
    let date = date.trim();
    if date.is_empty() {
        return None;
    }
    if date.chars().all(|c| c.is_ascii_digit()) {
        return date.parse().ok();
    }
    let sep = ['-', '/', '*', '.', ',', ' '].into_iter().find(|s| date.contains(*s))?;
    date.split(sep)
        .map(str::trim)
        .find(|part| part.len() == 4 && part.chars().all(|c| c.is_ascii_digit()))
        .and_then(|part| part.parse().ok())
}
