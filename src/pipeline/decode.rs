//! Strict decoders for oracle replies.
//!
//! Each decoder returns either a value or a [`SchemaError`] describing why the
//! reply matched none of the accepted shapes. An empty list therefore always
//! means "the oracle found nothing", never "the reply was unreadable", and
//! callers can treat the two differently.
//!
//! Individual malformed entries inside an otherwise well-shaped reply are
//! skipped with a warning; the reply as a whole is only rejected when its
//! outer shape is wrong or no entry at all is usable.

use crate::output::{AnswerEntry, Booklet, Page, PageQuestions, PaperHeader, Question, StructureResult};
use crate::pipeline::sanitize::{extract_json_payload, sanitize_json_strings};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// The reply did not match any accepted shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{detail}")]
pub struct SchemaError {
    pub detail: String,
}

impl SchemaError {
    fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Why a structure reply was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructureDecodeError {
    #[error("response is not valid JSON: {0}")]
    NotJson(String),

    #[error("response is missing required field(s): {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
}

const QUESTION_PAGE_KEYS: &[&str] = &["pages", "results", "data", "questionPages"];
const FLAT_QUESTION_KEYS: &[&str] = &["questions"];
const ANSWER_KEYS: &[&str] = &["answers", "answerKey", "answer_key", "data"];
const STRUCTURE_WRAPPER_KEYS: &[&str] = &["structure", "result", "data"];

/// Clean a raw reply and parse it as JSON.
pub fn parse_json(raw: &str, separator: &str) -> Result<Value, serde_json::Error> {
    let payload = extract_json_payload(raw);
    let clean = sanitize_json_strings(payload, separator);
    serde_json::from_str(&clean)
}

// ── Structure ────────────────────────────────────────────────────────────────

/// Decode a structure-analysis reply.
///
/// Both `pages` and `booklets` must be present as arrays, either at the root
/// or inside a single wrapper object (`structure`, `result`, `data`).
pub fn decode_structure(raw: &str, separator: &str) -> Result<StructureResult, StructureDecodeError> {
    let value = parse_json(raw, separator).map_err(|e| StructureDecodeError::NotJson(e.to_string()))?;

    let root = match value {
        Value::Object(map) => unwrap_structure(map),
        _ => return Err(StructureDecodeError::MissingFields(vec!["pages", "booklets"])),
    };

    let mut missing = Vec::new();
    let pages = root.get("pages").and_then(Value::as_array);
    let booklets = root.get("booklets").and_then(Value::as_array);
    if pages.is_none() {
        missing.push("pages");
    }
    if booklets.is_none() {
        missing.push("booklets");
    }
    let (Some(pages), Some(booklets)) = (pages, booklets) else {
        return Err(StructureDecodeError::MissingFields(missing));
    };

    let header = match root.get("header") {
        Some(h) if !h.is_null() => serde_json::from_value::<PaperHeader>(h.clone()).unwrap_or_else(|e| {
            warn!("Structure: unreadable header ignored — {}", e);
            PaperHeader::default()
        }),
        _ => PaperHeader::default(),
    };

    let pages = decode_entries::<Page>(pages, "page");
    let booklets = decode_entries::<Booklet>(booklets, "booklet");

    Ok(StructureResult {
        header,
        pages,
        booklets,
    })
}

fn unwrap_structure(map: Map<String, Value>) -> Map<String, Value> {
    if map.contains_key("pages") || map.contains_key("booklets") {
        return map;
    }
    for key in STRUCTURE_WRAPPER_KEYS {
        if let Some(Value::Object(inner)) = map.get(*key) {
            if inner.contains_key("pages") || inner.contains_key("booklets") {
                return inner.clone();
            }
        }
    }
    map
}

fn decode_entries<T: serde::de::DeserializeOwned>(items: &[Value], what: &str) -> Vec<T> {
    items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| match serde_json::from_value::<T>(item.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Structure: skipping malformed {} entry #{} — {}", what, i, e);
                None
            }
        })
        .collect()
}

// ── Questions ────────────────────────────────────────────────────────────────

/// Decode a question-boundary reply into per-page question lists.
///
/// Accepted shapes:
/// * an array of page entries `{pageIndex, questions: [...]}`, bare or under
///   `pages` / `results` / `data` / `questionPages`;
/// * a flat array of questions each carrying `pageIndex`, bare or under
///   `questions`.
///
/// Page indices are returned exactly as the oracle wrote them; remapping is
/// the caller's job.
pub fn decode_question_pages(raw: &str, separator: &str) -> Result<Vec<PageQuestions>, SchemaError> {
    let value = parse_json(raw, separator).map_err(|e| SchemaError::new(format!("not valid JSON: {e}")))?;

    let items = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => find_array(map, QUESTION_PAGE_KEYS)
            .or_else(|| find_array(map, FLAT_QUESTION_KEYS))
            .ok_or_else(|| {
                SchemaError::new(format!(
                    "expected an array of pages or questions, found an object with keys [{}]",
                    map.keys().cloned().collect::<Vec<_>>().join(", ")
                ))
            })?,
        other => {
            return Err(SchemaError::new(format!(
                "expected an array of pages or questions, found {}",
                json_kind(other)
            )))
        }
    };

    if items.is_empty() {
        return Ok(Vec::new());
    }

    let mut pages: BTreeMap<usize, Vec<Question>> = BTreeMap::new();
    let mut usable = 0usize;

    for (i, item) in items.iter().enumerate() {
        let Value::Object(obj) = item else {
            warn!("Questions: entry #{} is {}, not an object", i, json_kind(item));
            continue;
        };
        let Some(page_index) = page_index_of(obj) else {
            warn!("Questions: entry #{} has no usable page index", i);
            continue;
        };

        if let Some(list) = obj.get("questions") {
            let Value::Array(list) = list else {
                warn!("Questions: page {} has a non-array `questions`", page_index);
                continue;
            };
            usable += 1;
            let entry = pages.entry(page_index).or_default();
            for (j, q) in list.iter().enumerate() {
                match serde_json::from_value::<Question>(q.clone()) {
                    Ok(q) => entry.push(q),
                    Err(e) => warn!("Questions: page {} question #{} skipped — {}", page_index, j, e),
                }
            }
        } else if looks_like_question(obj) {
            match serde_json::from_value::<Question>(item.clone()) {
                Ok(q) => {
                    usable += 1;
                    pages.entry(page_index).or_default().push(q);
                }
                Err(e) => warn!("Questions: flat entry #{} skipped — {}", i, e),
            }
        } else {
            warn!("Questions: entry #{} is neither a page nor a question", i);
        }
    }

    if usable == 0 {
        return Err(SchemaError::new(format!(
            "none of the {} entries is a page entry or a question with a page index",
            items.len()
        )));
    }

    Ok(pages
        .into_iter()
        .map(|(index, questions)| PageQuestions { index, questions })
        .collect())
}

fn looks_like_question(obj: &Map<String, Value>) -> bool {
    ["questionNum", "questionNumber", "number"]
        .iter()
        .any(|k| obj.contains_key(*k))
}

fn page_index_of(obj: &Map<String, Value>) -> Option<usize> {
    ["pageIndex", "index", "page", "page_index"]
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(lenient::value_to_usize)
}

// ── Answers ──────────────────────────────────────────────────────────────────

/// Decode an answer-key reply into `(questionNum, entry)` pairs in reply order.
///
/// Accepted shapes: an object map `{"1": ..., "2": ...}` or an array of
/// entries carrying `questionNum`, bare or under `answers` / `answerKey` /
/// `data`. Values may be plain strings or numbers (text answers), or objects
/// describing text or an image region.
pub fn decode_answers(raw: &str, separator: &str) -> Result<Vec<(String, AnswerEntry)>, SchemaError> {
    let value = parse_json(raw, separator).map_err(|e| SchemaError::new(format!("not valid JSON: {e}")))?;

    let body = match &value {
        Value::Object(map) => ANSWER_KEYS
            .iter()
            .find_map(|k| map.get(*k).filter(|v| v.is_object() || v.is_array()))
            .unwrap_or(&value),
        _ => &value,
    };

    let mut out = Vec::new();
    match body {
        Value::Object(map) => {
            if !map.is_empty() && !map.keys().any(|k| k.chars().any(|c| c.is_ascii_digit())) {
                return Err(SchemaError::new(format!(
                    "expected answers keyed by question number, found keys [{}]",
                    map.keys().cloned().collect::<Vec<_>>().join(", ")
                )));
            }
            for (key, v) in map {
                match answer_from_value(v) {
                    Some(entry) => out.push((key.trim().to_string(), entry)),
                    None => warn!("Answers: entry for {} skipped — unreadable value", key),
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let Value::Object(obj) = item else {
                    warn!("Answers: entry #{} is not an object", i);
                    continue;
                };
                let Some(num) = ["questionNum", "questionNumber", "question", "number"]
                    .iter()
                    .find_map(|k| obj.get(*k))
                    .and_then(lenient::value_to_string)
                else {
                    warn!("Answers: entry #{} has no question number", i);
                    continue;
                };
                match answer_from_value(item) {
                    Some(entry) => out.push((num, entry)),
                    None => warn!("Answers: entry for {} skipped — unreadable value", num),
                }
            }
            if out.is_empty() && !items.is_empty() {
                return Err(SchemaError::new("no array entry carried a question number and an answer"));
            }
        }
        other => {
            return Err(SchemaError::new(format!(
                "expected an answer map or array, found {}",
                json_kind(other)
            )))
        }
    }

    Ok(out)
}

pub(crate) fn answer_from_value(v: &Value) -> Option<AnswerEntry> {
    match v {
        Value::String(s) => Some(AnswerEntry::Text { value: s.clone() }),
        Value::Number(n) => Some(AnswerEntry::Text {
            value: n.to_string(),
        }),
        Value::Object(obj) => {
            let kind = ["type", "kind", "format"]
                .iter()
                .find_map(|k| obj.get(*k))
                .and_then(Value::as_str)
                .map(|s| s.to_ascii_lowercase().replace(['_', '-', ' '], ""));
            let gloss = ["value", "answer", "text", "description"]
                .iter()
                .find_map(|k| obj.get(*k))
                .and_then(lenient::value_to_string);

            let is_image = match kind.as_deref() {
                Some("image") | Some("imageregion") | Some("region") | Some("diagram") => true,
                Some(_) => false,
                None => obj.contains_key("pageIndex") && obj.contains_key("yStartPct"),
            };

            if is_image {
                let page_index = page_index_of(obj)?;
                let y_start_pct = obj.get("yStartPct").and_then(lenient::value_to_f64)?;
                let y_end_pct = obj.get("yEndPct").and_then(lenient::value_to_f64)?;
                Some(AnswerEntry::ImageRegion {
                    page_index,
                    y_start_pct,
                    y_end_pct,
                    value: gloss.filter(|s| !s.trim().is_empty()),
                })
            } else {
                gloss.map(|value| AnswerEntry::Text { value })
            }
        }
        _ => None,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn find_array<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a [Value]> {
    keys.iter()
        .find_map(|k| map.get(*k).and_then(Value::as_array))
        .map(Vec::as_slice)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Serde helpers that accept the loose typing vision models produce:
/// numbers as strings, strings as numbers, `null` for absent values.
pub mod lenient {
    use serde::de::{DeserializeOwned, Error};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub(crate) fn value_to_string(v: &Value) -> Option<String> {
        match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub(crate) fn value_to_f64(v: &Value) -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
            _ => None,
        }
    }

    pub(crate) fn value_to_usize(v: &Value) -> Option<usize> {
        match v {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
                .map(|n| n as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        let v = Value::deserialize(d)?;
        match v {
            Value::Null => Ok(String::new()),
            other => value_to_string(&other).ok_or_else(|| D::Error::custom("expected a string")),
        }
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(value_to_string(&v).filter(|s| !s.is_empty()))
    }

    pub fn f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let v = Value::deserialize(d)?;
        match v {
            Value::Null => Ok(0.0),
            other => value_to_f64(&other).ok_or_else(|| D::Error::custom("expected a number")),
        }
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(value_to_f64(&v))
    }

    pub fn usize<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        let v = Value::deserialize(d)?;
        value_to_usize(&v).ok_or_else(|| D::Error::custom("expected a non-negative integer"))
    }

    pub fn u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let v = Value::deserialize(d)?;
        match v {
            Value::Null => Ok(0),
            other => value_to_usize(&other)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| D::Error::custom("expected a non-negative integer")),
        }
    }

    pub fn opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(value_to_usize(&v).and_then(|n| u32::try_from(n).ok()))
    }

    pub fn bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let v = Value::deserialize(d)?;
        Ok(match v {
            Value::Bool(b) => b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
            _ => false,
        })
    }

    pub fn null_default<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: Default + DeserializeOwned,
    {
        let v = Value::deserialize(d)?;
        if v.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(v).map_err(D::Error::custom)
    }
}
