//! A single live query and its hydration lifecycle.
//!
//! ```text
//! NeedsHydration ──hydrate──▶ Hydrating ──snapshot──▶ Hydrated
//!        ▲                        │                      │
//!        │                        └──────error──────▶ Failed
//!        └─────────────── unsubscribe (from any state) ──┘
//! ```
//!
//! Every attach is stamped with a generation drawn from the owning
//! [`EventSink`]. Deliveries whose generation does not match the open attach
//! are discarded, so a late callback can never resurrect a torn-down
//! subscription.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::{
  Error, Result,
  error::SubscriptionError,
  source::{
    Document, DocumentSource, EventSink, ListenerHandle, Payload, QueryKey,
    SourceEvent,
  },
};

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HydrationState {
  NeedsHydration,
  Hydrating,
  Hydrated,
  Failed { error: SubscriptionError },
}

impl HydrationState {
  pub fn is_hydrated(&self) -> bool { matches!(self, Self::Hydrated) }

  pub fn is_failed(&self) -> bool { matches!(self, Self::Failed { .. }) }

  /// Hydrated or failed: nothing further is expected without a retry.
  pub fn is_finished(&self) -> bool { self.is_hydrated() || self.is_failed() }
}

// ─── Subscription ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Subscription {
  key:         QueryKey,
  state:       HydrationState,
  data:        Vec<Document>,
  /// Generation of the currently open attach, if any.
  generation:  Option<u64>,
  handle:      Option<ListenerHandle>,
  attaches:    u64,
  hydrated_at: Option<DateTime<Utc>>,
}

impl Subscription {
  pub fn new(key: QueryKey) -> Self {
    Self {
      key,
      state: HydrationState::NeedsHydration,
      data: Vec::new(),
      generation: None,
      handle: None,
      attaches: 0,
      hydrated_at: None,
    }
  }

  pub fn key(&self) -> &QueryKey { &self.key }

  pub fn state(&self) -> &HydrationState { &self.state }

  /// The last delivered result set; empty unless hydrated.
  pub fn data(&self) -> &[Document] { &self.data }

  /// Number of listeners opened over this subscription's lifetime.
  pub fn attach_count(&self) -> u64 { self.attaches }

  pub fn hydrated_at(&self) -> Option<DateTime<Utc>> { self.hydrated_at }

  /// Open the listener unless one is already hydrating or hydrated.
  ///
  /// Returns `true` if a listener was opened. A failed subscription is
  /// re-opened from scratch. A synchronous attach error is captured in the
  /// state, never returned.
  pub fn hydrate<S>(&mut self, source: &S, sink: &EventSink) -> bool
  where
    S: DocumentSource + ?Sized,
  {
    if matches!(
      self.state,
      HydrationState::Hydrating | HydrationState::Hydrated
    ) {
      trace!(key = %self.key, "already hydrating");
      return false;
    }
    if let Some(handle) = self.handle.take() {
      handle.detach();
    }

    let listener = sink.listener(self.key.clone());
    let generation = listener.generation();
    self.attaches += 1;
    self.state = HydrationState::Hydrating;

    match source.listen(&self.key, listener) {
      Ok(handle) => {
        debug!(key = %self.key, generation, "listener attached");
        self.generation = Some(generation);
        self.handle = Some(handle);
      }
      Err(error) => {
        warn!(key = %self.key, %error, "listener attach failed");
        self.generation = None;
        self.state = HydrationState::Failed { error };
      }
    }
    true
  }

  /// Detach the listener and return to [`HydrationState::NeedsHydration`].
  /// Safe to call repeatedly.
  pub fn unsubscribe(&mut self) {
    if let Some(handle) = self.handle.take() {
      debug!(key = %self.key, "listener detached");
      handle.detach();
    }
    self.generation = None;
    self.state = HydrationState::NeedsHydration;
    self.data.clear();
    self.hydrated_at = None;
  }

  /// Apply one delivery. Returns `Ok(false)` when the event belongs to an
  /// attach that is no longer current.
  pub fn deliver(&mut self, event: SourceEvent, sink: &EventSink) -> Result<bool> {
    if event.generation > sink.issued() {
      return Err(Error::ReconciliationRace {
        key:        event.key,
        generation: event.generation,
      });
    }
    if self.generation != Some(event.generation) {
      trace!(
        key = %self.key,
        generation = event.generation,
        "discarding stale delivery"
      );
      return Ok(false);
    }

    match event.payload {
      Payload::Snapshot(documents) => {
        trace!(key = %self.key, documents = documents.len(), "snapshot");
        self.data = documents;
        self.state = HydrationState::Hydrated;
        self.hydrated_at = Some(Utc::now());
      }
      Payload::Error(error) => {
        warn!(key = %self.key, %error, "subscription failed");
        // A failed listener is terminal on the source side.
        if let Some(handle) = self.handle.take() {
          handle.detach();
        }
        self.generation = None;
        self.data.clear();
        self.state = HydrationState::Failed { error };
      }
    }
    Ok(true)
  }
}

impl Drop for Subscription {
  fn drop(&mut self) { self.unsubscribe(); }
}
