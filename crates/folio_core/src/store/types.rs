//! Value model for block properties.
//!
//! Block properties are stored inside a block's Y.Map. Scalars, lists and
//! nested maps are stored as plain [`yrs::Any`] values; rich text is stored
//! as a Y.Text; references to other pages/blocks are stored as a small map
//! with a `pageId` key so that peers on other platforms can read them.
//!
//! This module owns the conversions between the three representations a
//! property passes through:
//!
//! ```text
//! PropValue  <->  yrs::Any / Y.Text   (live document)
//! PropValue  <->  serde_json::Value   (snapshot interchange)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use yrs::Any;

/// A property value attached to a block.
///
/// `Text` and `Reference` are first-class variants rather than loosely
/// shaped maps: rich text becomes a live Y.Text handle in the document, and
/// references are what the backlink index is derived from.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    /// Absent/null value.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Numeric scalar.
    Number(f64),
    /// String scalar.
    String(String),
    /// Ordered list of values.
    List(Vec<PropValue>),
    /// Nested key/value bag.
    Map(IndexMap<String, PropValue>),
    /// Rich text content, expressed as an ordered delta.
    Text(TextDelta),
    /// A link to another page (or a block within one).
    Reference(RefTarget),
}

impl PropValue {
    /// Shorthand for a plain-text rich text property.
    pub fn text(content: impl Into<String>) -> Self {
        PropValue::Text(TextDelta::plain(content))
    }

    /// Shorthand for a string property.
    pub fn string(content: impl Into<String>) -> Self {
        PropValue::String(content.into())
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::String(value.to_string())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        PropValue::String(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Number(value)
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

/// An ordered list of text spans, the portable form of a Y.Text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextDelta(pub Vec<TextSpan>);

impl TextDelta {
    /// A delta holding a single unattributed span.
    pub fn plain(content: impl Into<String>) -> Self {
        let content = content.into();
        if content.is_empty() {
            return Self::default();
        }
        Self(vec![TextSpan {
            insert: content,
            attributes: None,
        }])
    }

    /// Concatenated plain text of all spans.
    pub fn to_plain_text(&self) -> String {
        self.0.iter().map(|s| s.insert.as_str()).collect()
    }
}

/// One span of a text delta: inserted characters plus optional formatting
/// attributes (bold, link, reference, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextSpan {
    /// Inserted characters.
    pub insert: String,
    /// Formatting attributes applied to the span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<IndexMap<String, serde_json::Value>>,
}

/// Target of a page/block reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RefTarget {
    /// Referenced page id.
    #[serde(rename = "pageId")]
    pub page_id: String,

    /// Referenced block within the page, if the link points below page level.
    #[serde(rename = "blockId", default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
}

impl RefTarget {
    /// Reference to a whole page.
    pub fn page(page_id: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            block_id: None,
        }
    }

    /// Reference to a block within a page.
    pub fn block(page_id: impl Into<String>, block_id: impl Into<String>) -> Self {
        Self {
            page_id: page_id.into(),
            block_id: Some(block_id.into()),
        }
    }
}

/// A read-only materialized view of a block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockView {
    /// Block id.
    pub id: String,
    /// Block flavour.
    pub flavour: String,
    /// Ordered child ids.
    pub children: Vec<String>,
    /// Properties with namespace prefixes stripped, sorted by key.
    pub props: IndexMap<String, PropValue>,
}

// ===========================================================================
// PropValue <-> yrs::Any
// ===========================================================================

/// Key marking a stored map as a reference.
pub(crate) const REF_PAGE_KEY: &str = "pageId";
pub(crate) const REF_BLOCK_KEY: &str = "blockId";

/// Convert a property value to a [`yrs::Any`].
///
/// `Text` has no `Any` form at the top level (it becomes a Y.Text); when it
/// appears nested inside a list or map it degrades to an array of span maps,
/// which [`any_to_prop`] recognizes on the way back.
pub(crate) fn prop_to_any(value: &PropValue) -> Any {
    match value {
        PropValue::Null => Any::Null,
        PropValue::Bool(b) => Any::Bool(*b),
        PropValue::Number(n) => Any::Number(*n),
        PropValue::String(s) => Any::String(Arc::from(s.as_str())),
        PropValue::List(items) => {
            let items: Vec<Any> = items.iter().map(prop_to_any).collect();
            Any::Array(Arc::from(items))
        }
        PropValue::Map(entries) => {
            let map: HashMap<String, Any> = entries
                .iter()
                .map(|(k, v)| (k.clone(), prop_to_any(v)))
                .collect();
            Any::Map(Arc::new(map))
        }
        PropValue::Text(delta) => {
            let spans: Vec<Any> = delta
                .0
                .iter()
                .map(|span| {
                    let mut map = HashMap::new();
                    map.insert(
                        "insert".to_string(),
                        Any::String(Arc::from(span.insert.as_str())),
                    );
                    if let Some(attrs) = &span.attributes {
                        let attrs: HashMap<String, Any> = attrs
                            .iter()
                            .map(|(k, v)| (k.clone(), json_to_any(v)))
                            .collect();
                        map.insert("attributes".to_string(), Any::Map(Arc::new(attrs)));
                    }
                    Any::Map(Arc::new(map))
                })
                .collect();
            Any::Array(Arc::from(spans))
        }
        PropValue::Reference(target) => {
            let mut map = HashMap::new();
            map.insert(
                REF_PAGE_KEY.to_string(),
                Any::String(Arc::from(target.page_id.as_str())),
            );
            if let Some(block_id) = &target.block_id {
                map.insert(
                    REF_BLOCK_KEY.to_string(),
                    Any::String(Arc::from(block_id.as_str())),
                );
            }
            Any::Map(Arc::new(map))
        }
    }
}

/// Convert a [`yrs::Any`] back to a property value.
///
/// Maps carrying a string `pageId` are read as references; arrays whose
/// elements all carry an `insert` string are read as text deltas.
pub(crate) fn any_to_prop(value: &Any) -> PropValue {
    match value {
        Any::Null | Any::Undefined => PropValue::Null,
        Any::Bool(b) => PropValue::Bool(*b),
        Any::Number(n) => PropValue::Number(*n),
        Any::BigInt(i) => PropValue::Number(*i as f64),
        Any::String(s) => PropValue::String(s.to_string()),
        Any::Buffer(bytes) => PropValue::List(
            bytes
                .iter()
                .map(|b| PropValue::Number(*b as f64))
                .collect(),
        ),
        Any::Array(items) => {
            if let Some(delta) = any_array_as_delta(items) {
                return PropValue::Text(delta);
            }
            PropValue::List(items.iter().map(any_to_prop).collect())
        }
        Any::Map(entries) => {
            if let Some(target) = any_map_as_reference(entries) {
                return PropValue::Reference(target);
            }
            let mut map: Vec<(String, PropValue)> = entries
                .iter()
                .map(|(k, v)| (k.clone(), any_to_prop(v)))
                .collect();
            // HashMap iteration order is unstable; keep views deterministic.
            map.sort_by(|(a, _), (b, _)| a.cmp(b));
            PropValue::Map(map.into_iter().collect())
        }
    }
}

pub(crate) fn any_map_as_reference(entries: &HashMap<String, Any>) -> Option<RefTarget> {
    let page_id = match entries.get(REF_PAGE_KEY)? {
        Any::String(s) => s.to_string(),
        _ => return None,
    };
    let block_id = match entries.get(REF_BLOCK_KEY) {
        Some(Any::String(s)) => Some(s.to_string()),
        _ => None,
    };
    Some(RefTarget { page_id, block_id })
}

fn any_array_as_delta(items: &[Any]) -> Option<TextDelta> {
    if items.is_empty() {
        return None;
    }
    let mut spans = Vec::with_capacity(items.len());
    for item in items {
        let Any::Map(entries) = item else {
            return None;
        };
        let insert = match entries.get("insert") {
            Some(Any::String(s)) => s.to_string(),
            _ => return None,
        };
        let attributes = match entries.get("attributes") {
            Some(Any::Map(attrs)) => {
                let mut attrs: Vec<(String, serde_json::Value)> = attrs
                    .iter()
                    .map(|(k, v)| (k.clone(), any_to_json(v)))
                    .collect();
                attrs.sort_by(|(a, _), (b, _)| a.cmp(b));
                Some(attrs.into_iter().collect())
            }
            _ => None,
        };
        spans.push(TextSpan { insert, attributes });
    }
    Some(TextDelta(spans))
}

// ===========================================================================
// serde_json::Value <-> yrs::Any
// ===========================================================================

pub(crate) fn json_to_any(value: &serde_json::Value) -> Any {
    match value {
        serde_json::Value::Null => Any::Null,
        serde_json::Value::Bool(b) => Any::Bool(*b),
        serde_json::Value::Number(n) => Any::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Any::String(Arc::from(s.as_str())),
        serde_json::Value::Array(items) => {
            let items: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(Arc::from(items))
        }
        serde_json::Value::Object(entries) => {
            let map: HashMap<String, Any> = entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect();
            Any::Map(Arc::new(map))
        }
    }
}

pub(crate) fn any_to_json(value: &Any) -> serde_json::Value {
    match value {
        Any::Null | Any::Undefined => serde_json::Value::Null,
        Any::Bool(b) => serde_json::Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Any::BigInt(i) => serde_json::Value::Number((*i).into()),
        Any::String(s) => serde_json::Value::String(s.to_string()),
        Any::Buffer(bytes) => serde_json::Value::Array(
            bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
        ),
        Any::Array(items) => serde_json::Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(entries) => {
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            serde_json::Value::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), any_to_json(&entries[k])))
                    .collect(),
            )
        }
    }
}

// ===========================================================================
// PropValue <-> serde_json::Value (snapshot interchange)
// ===========================================================================

/// Convert a property value to its snapshot JSON form.
///
/// Text becomes a delta array; references keep their `pageId`/`blockId`
/// object shape.
pub fn prop_to_json(value: &PropValue) -> serde_json::Value {
    match value {
        PropValue::Null => serde_json::Value::Null,
        PropValue::Bool(b) => serde_json::Value::Bool(*b),
        PropValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        PropValue::String(s) => serde_json::Value::String(s.clone()),
        PropValue::List(items) => {
            serde_json::Value::Array(items.iter().map(prop_to_json).collect())
        }
        PropValue::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), prop_to_json(v)))
                .collect(),
        ),
        PropValue::Text(delta) => serde_json::to_value(delta).unwrap_or(serde_json::Value::Null),
        PropValue::Reference(target) => {
            serde_json::to_value(target).unwrap_or(serde_json::Value::Null)
        }
    }
}

/// Convert a snapshot JSON value back to a property value.
///
/// Arrays of `{insert, attributes?}` objects are rehydrated into text
/// deltas; objects with a string `pageId` become references.
pub fn json_to_prop(value: &serde_json::Value) -> PropValue {
    match value {
        serde_json::Value::Null => PropValue::Null,
        serde_json::Value::Bool(b) => PropValue::Bool(*b),
        serde_json::Value::Number(n) => PropValue::Number(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => PropValue::String(s.clone()),
        serde_json::Value::Array(items) => {
            if let Ok(delta) = serde_json::from_value::<TextDelta>(value.clone())
                && !delta.0.is_empty()
                && items.iter().all(|i| i.is_object())
            {
                return PropValue::Text(delta);
            }
            PropValue::List(items.iter().map(json_to_prop).collect())
        }
        serde_json::Value::Object(entries) => {
            if let Some(serde_json::Value::String(page_id)) = entries.get(REF_PAGE_KEY) {
                let block_id = match entries.get(REF_BLOCK_KEY) {
                    Some(serde_json::Value::String(s)) => Some(s.clone()),
                    _ => None,
                };
                return PropValue::Reference(RefTarget {
                    page_id: page_id.clone(),
                    block_id,
                });
            }
            PropValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), json_to_prop(v)))
                    .collect(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_roundtrip_scalars() {
        for value in [
            PropValue::Null,
            PropValue::Bool(true),
            PropValue::Number(42.5),
            PropValue::String("hello".to_string()),
        ] {
            assert_eq!(any_to_prop(&prop_to_any(&value)), value);
        }
    }

    #[test]
    fn test_any_roundtrip_reference() {
        let value = PropValue::Reference(RefTarget::block("page-1", "block-2"));
        assert_eq!(any_to_prop(&prop_to_any(&value)), value);

        let value = PropValue::Reference(RefTarget::page("page-1"));
        assert_eq!(any_to_prop(&prop_to_any(&value)), value);
    }

    #[test]
    fn test_any_roundtrip_nested_delta() {
        let value = PropValue::List(vec![PropValue::Text(TextDelta::plain("nested"))]);
        assert_eq!(any_to_prop(&prop_to_any(&value)), value);
    }

    #[test]
    fn test_json_roundtrip_delta() {
        let delta = TextDelta(vec![
            TextSpan {
                insert: "bold".to_string(),
                attributes: Some(
                    [("bold".to_string(), serde_json::Value::Bool(true))]
                        .into_iter()
                        .collect(),
                ),
            },
            TextSpan {
                insert: " plain".to_string(),
                attributes: None,
            },
        ]);
        let value = PropValue::Text(delta);
        assert_eq!(json_to_prop(&prop_to_json(&value)), value);
    }

    #[test]
    fn test_json_roundtrip_reference() {
        let value = PropValue::Reference(RefTarget::page("target"));
        let json = prop_to_json(&value);
        assert_eq!(json["pageId"], "target");
        assert_eq!(json_to_prop(&json), value);
    }

    #[test]
    fn test_json_plain_list_stays_list() {
        let value = PropValue::List(vec![PropValue::Number(1.0), PropValue::Number(2.0)]);
        assert_eq!(json_to_prop(&prop_to_json(&value)), value);
    }

    #[test]
    fn test_delta_plain_text() {
        let delta = TextDelta(vec![
            TextSpan {
                insert: "hello ".to_string(),
                attributes: None,
            },
            TextSpan {
                insert: "world".to_string(),
                attributes: None,
            },
        ]);
        assert_eq!(delta.to_plain_text(), "hello world");
    }

    #[test]
    fn test_empty_plain_delta_has_no_spans() {
        assert!(TextDelta::plain("").0.is_empty());
    }
}
