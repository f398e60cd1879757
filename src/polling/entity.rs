//! Pollable entities, their field maps, and completion predicates.
//!
//! Backend records grow optional fields as enrichment finishes. Instead of
//! ad hoc null checks at each use site, callers name the fields they wait for
//! through a [`CompletionPredicate`], and journal entries expose their known
//! field set through [`EntryField`] and [`EntryInsights`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::errors::SyncResult;
use crate::core::ids::EntityId;

/// Version of the journal-entry field set.
pub const ENTRY_FIELD_SET_VERSION: u16 = 1;

/// Field name to JSON value mapping of a fetched entity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityFields(Map<String, Value>);

impl EntityFields {
    /// Empty field set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON value; anything but an object yields an empty set.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self::default(),
        }
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Raw value of a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// String value of a field.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Whether a field exists, is not `null`, and is not an empty string.
    #[must_use]
    pub fn is_present(&self, name: &str) -> bool {
        match self.0.get(name) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the underlying map.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Convert into a JSON object value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for EntityFields {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

type PredicateFn = dyn Fn(&EntityFields) -> bool + Send + Sync;

/// Pure test deciding whether an entity has finished enriching.
#[derive(Clone)]
pub struct CompletionPredicate {
    description: String,
    test: Arc<PredicateFn>,
}

impl CompletionPredicate {
    /// Predicate from a closure.
    pub fn new<F>(description: impl Into<String>, test: F) -> Self
    where
        F: Fn(&EntityFields) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            test: Arc::new(test),
        }
    }

    /// Complete once `name` is present.
    #[must_use]
    pub fn field_present(name: &str) -> Self {
        let field = name.to_string();
        Self::new(format!("{name} present"), move |fields| fields.is_present(&field))
    }

    /// Complete once every field in `names` is present.
    #[must_use]
    pub fn all_present(names: &[&str]) -> Self {
        let fields_wanted: Vec<String> = names.iter().map(|n| (*n).to_string()).collect();
        Self::new(format!("{} present", names.join(" + ")), move |fields| {
            fields_wanted.iter().all(|name| fields.is_present(name))
        })
    }

    /// Evaluate against a field set.
    #[must_use]
    pub fn evaluate(&self, fields: &EntityFields) -> bool {
        (self.test)(fields)
    }

    /// Human-readable description for logs.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for CompletionPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompletionPredicate")
            .field(&self.description)
            .finish()
    }
}

/// A server-side record whose enrichment the client observes.
#[derive(Clone, Debug)]
pub struct PollableEntity {
    /// Backend key.
    pub id: EntityId,
    /// Freshest known fields.
    pub fields: EntityFields,
    /// Completion test.
    pub predicate: CompletionPredicate,
}

impl PollableEntity {
    /// Entity with known fields and a completion test.
    #[must_use]
    pub fn new(
        id: impl Into<EntityId>,
        fields: EntityFields,
        predicate: CompletionPredicate,
    ) -> Self {
        Self {
            id: id.into(),
            fields,
            predicate,
        }
    }

    /// Whether the known fields satisfy the predicate.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.predicate.evaluate(&self.fields)
    }
}

/// Known fields of a journal entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EntryField {
    /// Generated title.
    Title,
    /// Generated summary.
    Summary,
    /// Overall sentiment label.
    Sentiment,
    /// Extracted keywords.
    Keywords,
    /// Structured emotional insight.
    EmotionalLandscape,
    /// Generated illustration.
    ImageUrl,
}

impl EntryField {
    /// Wire name of the field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Summary => "summary",
            Self::Sentiment => "sentiment",
            Self::Keywords => "keywords",
            Self::EmotionalLandscape => "emotional_landscape",
            Self::ImageUrl => "image_url",
        }
    }

    /// Predicate that completes once this field is present.
    #[must_use]
    pub fn present(self) -> CompletionPredicate {
        CompletionPredicate::field_present(self.as_str())
    }
}

impl fmt::Display for EntryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed view over a journal entry's fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryInsights {
    /// Generated title.
    pub title: Option<String>,
    /// Entry text.
    pub content: Option<String>,
    /// Generated summary.
    pub summary: Option<String>,
    /// Sentiment label.
    pub sentiment: Option<String>,
    /// Extracted keywords.
    pub keywords: Option<Vec<String>>,
    /// Structured emotional insight.
    pub emotional_landscape: Option<Value>,
    /// Generated illustration.
    pub image_url: Option<String>,
    /// Creation time.
    pub created_at: Option<DateTime<Utc>>,
}

impl EntryInsights {
    /// Decode the known fields, ignoring unknown ones.
    ///
    /// # Errors
    /// Returns an error if a known field has the wrong JSON type.
    pub fn from_fields(fields: &EntityFields) -> SyncResult<Self> {
        Ok(serde_json::from_value(Value::Object(fields.as_map().clone()))?)
    }

    /// Title, or "Untitled" while it has not been generated.
    #[must_use]
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or("Untitled")
    }
}
