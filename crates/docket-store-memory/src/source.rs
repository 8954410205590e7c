//! The in-memory implementation of [`DocumentSource`].

use std::{
  collections::{BTreeMap, HashMap},
  path::Path,
  sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use docket_core::{
  SubscriptionError,
  source::{Document, DocumentSource, Listener, ListenerHandle, QueryKey},
};
use serde_json::Value;
use tracing::{debug, trace};

use crate::{Error, Result};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A live document store held in memory.
///
/// Cloning is cheap: clones share the same collections and listeners.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
  inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
  collections:     BTreeMap<String, BTreeMap<String, Value>>,
  listeners:       BTreeMap<u64, Listener>,
  next_listener:   u64,
  attaches:        HashMap<QueryKey, usize>,
  attach_failures: HashMap<QueryKey, SubscriptionError>,
}

impl Inner {
  /// The current result set for `key`, ordered by document ID.
  fn snapshot(&self, key: &QueryKey) -> Vec<Document> {
    let Some(documents) = self.collections.get(key.collection()) else {
      return Vec::new();
    };
    match key {
      QueryKey::Document { id, .. } => documents
        .get(id)
        .map(|data| Document::new(id.clone(), data.clone()))
        .into_iter()
        .collect(),
      QueryKey::Query { collection, .. } => documents
        .iter()
        .map(|(id, data)| Document::new(id.clone(), data.clone()))
        .filter(|document| key.matches(collection, document))
        .collect(),
    }
  }

  /// Push fresh snapshots to every listener whose result set contains
  /// `before` or `after`.
  fn notify(&self, collection: &str, before: Option<&Document>, after: Option<&Document>) {
    for listener in self.listeners.values() {
      let key = listener.key();
      let affected = [before, after]
        .into_iter()
        .flatten()
        .any(|document| key.matches(collection, document));
      if affected {
        trace!(%key, "notifying listener");
        listener.snapshot(self.snapshot(key));
      }
    }
  }
}

impl MemorySource {
  pub fn new() -> Self { Self::default() }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  // ─── Fixtures ──────────────────────────────────────────────────────────────

  /// Build a store from `{ "<collection>": { "<docId>": { ... } } }`.
  pub fn from_fixtures(fixtures: Value) -> Result<Self> {
    let Value::Object(collections) = fixtures else {
      return Err(Error::InvalidFixture("top level must be an object".into()));
    };
    let source = Self::new();
    {
      let mut inner = source.lock();
      for (collection, documents) in collections {
        let Value::Object(documents) = documents else {
          return Err(Error::InvalidFixture(format!(
            "collection {collection:?} must be an object of documents"
          )));
        };
        inner
          .collections
          .entry(collection)
          .or_default()
          .extend(documents);
      }
    }
    Ok(source)
  }

  /// Read a JSON fixture file; see [`from_fixtures`](Self::from_fixtures).
  pub fn load_fixture_file(path: impl AsRef<Path>) -> Result<Self> {
    let text = std::fs::read_to_string(path)?;
    Self::from_fixtures(serde_json::from_str(&text)?)
  }

  // ─── Writes ────────────────────────────────────────────────────────────────

  /// Insert or replace a document and notify affected listeners.
  pub fn put(&self, collection: &str, id: &str, data: Value) {
    let mut inner = self.lock();
    let before = inner
      .collections
      .get(collection)
      .and_then(|documents| documents.get(id))
      .map(|data| Document::new(id, data.clone()));
    inner
      .collections
      .entry(collection.to_owned())
      .or_default()
      .insert(id.to_owned(), data.clone());
    trace!(collection, id, "document written");
    inner.notify(collection, before.as_ref(), Some(&Document::new(id, data)));
  }

  /// Remove a document. Returns `false` if it did not exist.
  pub fn delete(&self, collection: &str, id: &str) -> bool {
    let mut inner = self.lock();
    let removed = inner
      .collections
      .get_mut(collection)
      .and_then(|documents| documents.remove(id));
    match removed {
      Some(data) => {
        trace!(collection, id, "document deleted");
        inner.notify(collection, Some(&Document::new(id, data)), None);
        true
      }
      None => false,
    }
  }

  pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
    self
      .lock()
      .collections
      .get(collection)
      .and_then(|documents| documents.get(id))
      .cloned()
  }

  // ─── Failure injection ─────────────────────────────────────────────────────

  /// Fail every open listener for `key`. Failed listeners receive nothing
  /// further.
  pub fn fail(&self, key: &QueryKey, error: SubscriptionError) {
    let mut inner = self.lock();
    inner.listeners.retain(|_, listener| {
      if listener.key() == key {
        listener.error(error.clone());
        false
      } else {
        true
      }
    });
  }

  /// Make the next attach for `key` fail synchronously.
  pub fn fail_next_attach(&self, key: QueryKey, error: SubscriptionError) {
    self.lock().attach_failures.insert(key, error);
  }

  // ─── Introspection ─────────────────────────────────────────────────────────

  /// How many times a listener for `key` was attached, including failed
  /// attempts.
  pub fn attach_count(&self, key: &QueryKey) -> usize {
    self.lock().attaches.get(key).copied().unwrap_or(0)
  }

  pub fn total_attaches(&self) -> usize { self.lock().attaches.values().sum() }

  pub fn active_listeners(&self) -> usize { self.lock().listeners.len() }

  pub fn active_listeners_for(&self, key: &QueryKey) -> usize {
    self
      .lock()
      .listeners
      .values()
      .filter(|listener| listener.key() == key)
      .count()
  }
}

// ─── DocumentSource ──────────────────────────────────────────────────────────

impl DocumentSource for MemorySource {
  fn listen(
    &self,
    key: &QueryKey,
    listener: Listener,
  ) -> Result<ListenerHandle, SubscriptionError> {
    let mut inner = self.lock();
    *inner.attaches.entry(key.clone()).or_default() += 1;
    if let Some(error) = inner.attach_failures.remove(key) {
      debug!(%key, %error, "rejecting attach");
      return Err(error);
    }

    listener.snapshot(inner.snapshot(key));
    inner.next_listener += 1;
    let id = inner.next_listener;
    inner.listeners.insert(id, listener);
    debug!(%key, listener = id, "listener attached");

    let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
    Ok(ListenerHandle::new(move || {
      if let Some(inner) = weak.upgrade() {
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.listeners.remove(&id).is_some() {
          trace!(listener = id, "listener detached");
        }
      }
    }))
  }
}
