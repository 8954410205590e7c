//! The document-store boundary.
//!
//! A [`DocumentSource`] opens live listeners for a [`QueryKey`]. Listeners
//! never call back into the caller synchronously: every snapshot or error is
//! pushed as a [`SourceEvent`] into one channel, and the owner of the
//! receiving end applies events in arrival order.

use std::{
  borrow::Cow,
  fmt,
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SubscriptionError;

// ─── Query identity ──────────────────────────────────────────────────────────

/// An equality filter on a (possibly dotted) document field.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FieldFilter {
  pub field: String,
  pub value: String,
}

/// The identity of one live query: a single document, or every document in a
/// collection matching all of `filters`.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryKey {
  Document {
    collection: String,
    id:         String,
  },
  Query {
    collection: String,
    /// Sorted and deduplicated so equal queries compare equal.
    filters:    Vec<FieldFilter>,
  },
}

impl QueryKey {
  pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
    Self::Document {
      collection: collection.into(),
      id:         id.into(),
    }
  }

  pub fn query<I, F, V>(collection: impl Into<String>, filters: I) -> Self
  where
    I: IntoIterator<Item = (F, V)>,
    F: Into<String>,
    V: Into<String>,
  {
    let mut filters: Vec<FieldFilter> = filters
      .into_iter()
      .map(|(field, value)| FieldFilter {
        field: field.into(),
        value: value.into(),
      })
      .collect();
    filters.sort();
    filters.dedup();
    Self::Query {
      collection: collection.into(),
      filters,
    }
  }

  pub fn collection(&self) -> &str {
    match self {
      Self::Document { collection, .. } | Self::Query { collection, .. } => {
        collection
      }
    }
  }

  /// Whether `document`, stored in `collection`, belongs to this query's
  /// result set.
  pub fn matches(&self, collection: &str, document: &Document) -> bool {
    if collection != self.collection() {
      return false;
    }
    match self {
      Self::Document { id, .. } => *id == document.id,
      Self::Query { filters, .. } => filters.iter().all(|f| {
        lookup_field(&document.data, &f.field)
          .and_then(scalar_text)
          .is_some_and(|text| text == f.value)
      }),
    }
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Document { collection, id } => write!(f, "{collection}/{id}"),
      Self::Query {
        collection,
        filters,
      } => {
        write!(f, "{collection}?")?;
        for (i, filter) in filters.iter().enumerate() {
          if i > 0 {
            f.write_str("&")?;
          }
          write!(f, "{}=={}", filter.field, filter.value)?;
        }
        Ok(())
      }
    }
  }
}

/// Resolve a dotted path (`personName.surname`) inside a JSON object.
pub fn lookup_field<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
  path
    .split('.')
    .try_fold(data, |value, segment| value.as_object()?.get(segment))
}

/// Text form of a scalar JSON value, used for equality filters.
pub fn scalar_text(value: &Value) -> Option<Cow<'_, str>> {
  match value {
    Value::String(s) => Some(Cow::Borrowed(s)),
    Value::Number(n) => Some(Cow::Owned(n.to_string())),
    Value::Bool(b) => Some(Cow::Owned(b.to_string())),
    _ => None,
  }
}

// ─── Documents and events ────────────────────────────────────────────────────

/// A raw document as delivered by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id:   String,
  pub data: Value,
}

impl Document {
  pub fn new(id: impl Into<String>, data: Value) -> Self {
    Self {
      id: id.into(),
      data,
    }
  }
}

#[derive(Debug, Clone)]
pub enum Payload {
  /// The full current result set. Empty for a missing document.
  Snapshot(Vec<Document>),
  Error(SubscriptionError),
}

/// One delivery from a listener, stamped with the generation of the attach
/// that produced it.
#[derive(Debug, Clone)]
pub struct SourceEvent {
  pub key:        QueryKey,
  pub generation: u64,
  pub payload:    Payload,
}

// ─── Listener plumbing ───────────────────────────────────────────────────────

/// Create the event channel shared by every listener of one store.
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<SourceEvent>) {
  let (tx, rx) = mpsc::unbounded_channel();
  let sink = EventSink {
    tx,
    issued: Arc::new(AtomicU64::new(0)),
  };
  (sink, rx)
}

/// The sending half of a store's event channel. Hands out [`Listener`]s
/// stamped with monotonically increasing generations.
#[derive(Debug, Clone)]
pub struct EventSink {
  tx:     mpsc::UnboundedSender<SourceEvent>,
  issued: Arc<AtomicU64>,
}

impl EventSink {
  /// A listener for `key` carrying a fresh generation.
  pub fn listener(&self, key: QueryKey) -> Listener {
    let generation = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
    Listener {
      key,
      generation,
      tx: self.tx.clone(),
    }
  }

  /// The highest generation handed out so far.
  pub fn issued(&self) -> u64 { self.issued.load(Ordering::Relaxed) }
}

/// The callback capability handed to a [`DocumentSource`] for one attach.
#[derive(Debug, Clone)]
pub struct Listener {
  key:        QueryKey,
  generation: u64,
  tx:         mpsc::UnboundedSender<SourceEvent>,
}

impl Listener {
  pub fn key(&self) -> &QueryKey { &self.key }

  pub fn generation(&self) -> u64 { self.generation }

  /// Push a full snapshot. Returns `false` once the receiving store is gone.
  pub fn snapshot(&self, documents: Vec<Document>) -> bool {
    self.send(Payload::Snapshot(documents))
  }

  /// Push a listener failure. Returns `false` once the receiving store is
  /// gone.
  pub fn error(&self, error: SubscriptionError) -> bool {
    self.send(Payload::Error(error))
  }

  fn send(&self, payload: Payload) -> bool {
    self
      .tx
      .send(SourceEvent {
        key: self.key.clone(),
        generation: self.generation,
        payload,
      })
      .is_ok()
  }
}

/// Detaches a listener when [`detach`](Self::detach)ed or dropped.
#[must_use = "dropping a ListenerHandle detaches the listener"]
pub struct ListenerHandle {
  detach: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerHandle {
  pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
    Self {
      detach: Some(Box::new(detach)),
    }
  }

  pub fn detach(mut self) {
    if let Some(detach) = self.detach.take() {
      detach();
    }
  }
}

impl Drop for ListenerHandle {
  fn drop(&mut self) {
    if let Some(detach) = self.detach.take() {
      detach();
    }
  }
}

impl fmt::Debug for ListenerHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ListenerHandle")
      .field("attached", &self.detach.is_some())
      .finish()
  }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a live document store (Firestore-style listeners).
///
/// Implementations must deliver through `listener` only, never by calling
/// back into the subscriber on the same stack.
pub trait DocumentSource {
  /// Open a listener for `key`. A synchronous error means nothing was
  /// attached.
  fn listen(
    &self,
    key: &QueryKey,
    listener: Listener,
  ) -> Result<ListenerHandle, SubscriptionError>;
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn query_filters_are_normalised() {
    let a = QueryKey::query("clients", [("stateCode", "US_XX"), ("officerId", "O1")]);
    let b = QueryKey::query("clients", [("officerId", "O1"), ("stateCode", "US_XX")]);
    assert_eq!(a, b);
    assert_eq!(a.to_string(), "clients?officerId==O1&stateCode==US_XX");
  }

  #[test]
  fn query_matches_nested_and_numeric_fields() {
    let key = QueryKey::query("clients", [("meta.unit", "7"), ("officerId", "O1")]);
    let hit = Document::new("P1", json!({ "officerId": "O1", "meta": { "unit": 7 } }));
    let miss = Document::new("P2", json!({ "officerId": "O2", "meta": { "unit": 7 } }));
    assert!(key.matches("clients", &hit));
    assert!(!key.matches("clients", &miss));
    assert!(!key.matches("residents", &hit));
  }

  #[test]
  fn listeners_carry_increasing_generations() {
    let (sink, mut rx) = event_channel();
    let first = sink.listener(QueryKey::document("staff", "O1"));
    let second = sink.listener(QueryKey::document("staff", "O1"));
    assert!(second.generation() > first.generation());
    assert_eq!(sink.issued(), second.generation());

    assert!(first.snapshot(vec![]));
    let event = rx.try_recv().unwrap();
    assert_eq!(event.generation, first.generation());
  }

  #[test]
  fn handle_detaches_once() {
    let count = Arc::new(AtomicU64::new(0));
    let c = Arc::clone(&count);
    let handle = ListenerHandle::new(move || {
      c.fetch_add(1, Ordering::SeqCst);
    });
    handle.detach();
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }
}
