//! A scripted document source for unit tests.
//!
//! Listeners are parked rather than answered, so tests decide exactly when
//! (and whether) each delivery fires.

use std::{
  cell::RefCell,
  collections::HashMap,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use crate::{
  error::SubscriptionError,
  source::{Document, DocumentSource, Listener, ListenerHandle, QueryKey},
};

#[derive(Default)]
pub struct ScriptedSource {
  parked:   RefCell<Vec<Listener>>,
  attaches: RefCell<HashMap<QueryKey, usize>>,
  reject:   RefCell<Option<SubscriptionError>>,
  detached: Arc<AtomicUsize>,
}

impl ScriptedSource {
  pub fn attaches(&self, key: &QueryKey) -> usize {
    self.attaches.borrow().get(key).copied().unwrap_or(0)
  }

  pub fn detached(&self) -> usize { self.detached.load(Ordering::SeqCst) }

  /// Make the next `listen` call fail synchronously.
  pub fn reject_next(&self, error: SubscriptionError) {
    *self.reject.borrow_mut() = Some(error);
  }

  /// Answer every parked listener for `key` with `documents`.
  pub fn answer(&self, key: &QueryKey, documents: Vec<Document>) {
    for listener in self.parked.borrow().iter().filter(|l| l.key() == key) {
      listener.snapshot(documents.clone());
    }
  }

  /// Fail every parked listener for `key`.
  pub fn fail(&self, key: &QueryKey, error: SubscriptionError) {
    for listener in self.parked.borrow().iter().filter(|l| l.key() == key) {
      listener.error(error.clone());
    }
  }
}

impl DocumentSource for ScriptedSource {
  fn listen(
    &self,
    key: &QueryKey,
    listener: Listener,
  ) -> Result<ListenerHandle, SubscriptionError> {
    *self.attaches.borrow_mut().entry(key.clone()).or_default() += 1;
    if let Some(error) = self.reject.borrow_mut().take() {
      return Err(error);
    }
    self.parked.borrow_mut().push(listener);
    let detached = Arc::clone(&self.detached);
    Ok(ListenerHandle::new(move || {
      detached.fetch_add(1, Ordering::SeqCst);
    }))
  }
}
