use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An immutable event document stored in the event store.
///
/// Events follow the Flux Standard Action shape: a required `type`, and
/// optional `payload`, `error` and `meta` fields. The `payload` is untyped
/// ([`serde_json::Value`]); the store has no opinion about event shapes.
/// Reducers give events meaning.
///
/// The `id` is assigned by [`Registry::emit`](crate::Registry::emit) using
/// [`id::generate`](crate::id::generate), so native store ordering by id is
/// chronological.
///
/// # Examples
///
/// ```
/// use eventfold_registry::Event;
/// use serde_json::json;
///
/// let event = Event::new("11e7b68fb373d1a0a33e8fb9afebf642", "user_added")
///     .with_payload(json!({"name": "ada"}));
/// assert_eq!(event.event_type, "user_added");
/// assert_eq!(event.payload, Some(json!({"name": "ada"})));
/// assert_eq!(event.error, None);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct Event {
    /// Sortable 32-character hex identifier.
    pub id: String,

    /// The event type identifier (e.g. `"user_added"`). Selects the reducer.
    ///
    /// Serialized as `"type"` in JSON.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Arbitrary JSON payload, passed to reducers untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Marks the event as describing a failure. Interpretation is up to
    /// reducers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,

    /// Extensible metadata bag kept separate from `payload`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Event {
    /// Create an event with the given id and type and no optional fields.
    pub fn new(id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Event {
            id: id.into(),
            event_type: event_type.into(),
            payload: None,
            error: None,
            meta: None,
        }
    }

    /// Build the stored document for an emitted [`NewEvent`].
    pub(crate) fn from_new(id: String, new: NewEvent) -> Self {
        Event {
            id,
            event_type: new.event_type,
            payload: new.payload,
            error: new.error,
            meta: new.meta,
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the error flag.
    pub fn with_error(mut self, error: bool) -> Self {
        self.error = Some(error);
        self
    }

    /// Set extensible metadata.
    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// An event as submitted to [`Registry::emit`](crate::Registry::emit),
/// before an identifier is assigned.
///
/// `NewEvent::default()` has an empty type and is rejected by `emit` with
/// [`RegistryError::InvalidArgument`](crate::RegistryError::InvalidArgument).
///
/// # Examples
///
/// ```
/// use eventfold_registry::NewEvent;
/// use serde_json::json;
///
/// let event = NewEvent::new("order_placed")
///     .with_payload(json!({"total": 99}))
///     .with_meta(json!({"session": "abc"}));
/// assert_eq!(event.event_type, "order_placed");
/// assert!(event.error.is_none());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NewEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        NewEvent {
            event_type: event_type.into(),
            ..NewEvent::default()
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_error(mut self, error: bool) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// One entry of an event store's change feed.
///
/// `seq` is assigned by the store and strictly increases along a feed; it
/// starts at 1, so a `seq` of 0 marks a malformed record. `doc` is present
/// when the feed was opened with `include_docs` and the change is not a
/// deletion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    /// Id of the changed document.
    pub id: String,
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Event>,
    #[serde(default)]
    pub deleted: bool,
}

impl ChangeRecord {
    /// A regular change carrying its document.
    pub fn event(seq: u64, doc: Event) -> Self {
        ChangeRecord {
            id: doc.id.clone(),
            seq,
            doc: Some(doc),
            deleted: false,
        }
    }

    /// A tombstone for a deleted document.
    pub fn deletion(seq: u64, id: impl Into<String>) -> Self {
        ChangeRecord {
            id: id.into(),
            seq,
            doc: None,
            deleted: true,
        }
    }

    /// Drop the document, as a feed opened without `include_docs` would.
    pub(crate) fn without_doc(mut self) -> Self {
        self.doc = None;
        self
    }
}
