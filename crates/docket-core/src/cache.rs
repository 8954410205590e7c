//! Reference-counted subscription cache.
//!
//! At most one [`Subscription`] exists per [`QueryKey`]. Each entry records
//! the set of owners that asked for it; the listener is detached when the
//! last owner releases it.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, trace};

use crate::{
  Result,
  source::{DocumentSource, EventSink, QueryKey, SourceEvent},
  subscription::{HydrationState, Subscription},
};

/// Who holds a reference to a cached subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Owner {
  /// The search store's caseload queries.
  Search,
  /// A watched person's own subscriptions (record, referrals, staff).
  Person(String),
}

#[derive(Debug)]
struct Entry {
  subscription: Subscription,
  owners:       BTreeSet<Owner>,
}

#[derive(Debug)]
pub struct SubscriptionCache {
  entries: HashMap<QueryKey, Entry>,
  sink:    EventSink,
}

impl SubscriptionCache {
  pub fn new(sink: EventSink) -> Self {
    Self {
      entries: HashMap::new(),
      sink,
    }
  }

  /// Add `owner` as a holder of `key`, creating and hydrating the
  /// subscription if this is the first request for it.
  ///
  /// Returns `true` if a new subscription was created.
  pub fn acquire<S>(&mut self, key: &QueryKey, owner: Owner, source: &S) -> bool
  where
    S: DocumentSource + ?Sized,
  {
    if let Some(entry) = self.entries.get_mut(key) {
      if entry.owners.insert(owner) {
        trace!(%key, refs = entry.owners.len(), "shared subscription");
      }
      return false;
    }

    let mut subscription = Subscription::new(key.clone());
    subscription.hydrate(source, &self.sink);
    self.entries.insert(key.clone(), Entry {
      subscription,
      owners: BTreeSet::from([owner]),
    });
    true
  }

  /// Drop `owner`'s reference to `key`. Returns `true` if this was the last
  /// reference and the listener was detached.
  pub fn release(&mut self, key: &QueryKey, owner: &Owner) -> bool {
    let Some(entry) = self.entries.get_mut(key) else {
      return false;
    };
    if !entry.owners.remove(owner) || !entry.owners.is_empty() {
      return false;
    }
    if let Some(mut entry) = self.entries.remove(key) {
      entry.subscription.unsubscribe();
      debug!(%key, "subscription released");
    }
    true
  }

  /// Route a delivery to its subscription. Returns `Ok(false)` for events
  /// whose subscription is gone or has been re-attached since.
  pub fn deliver(&mut self, event: SourceEvent) -> Result<bool> {
    match self.entries.get_mut(&event.key) {
      Some(entry) => entry.subscription.deliver(event, &self.sink),
      None => {
        trace!(key = %event.key, "delivery for released subscription");
        Ok(false)
      }
    }
  }

  /// Re-open every failed subscription. Returns how many were retried.
  pub fn retry_failed<S>(&mut self, source: &S) -> usize
  where
    S: DocumentSource + ?Sized,
  {
    let mut retried = 0;
    for entry in self.entries.values_mut() {
      if entry.subscription.state().is_failed() {
        entry.subscription.hydrate(source, &self.sink);
        retried += 1;
      }
    }
    retried
  }

  pub fn get(&self, key: &QueryKey) -> Option<&Subscription> {
    self.entries.get(key).map(|e| &e.subscription)
  }

  pub fn state(&self, key: &QueryKey) -> Option<&HydrationState> {
    self.get(key).map(Subscription::state)
  }

  /// Number of owners currently holding `key`.
  pub fn ref_count(&self, key: &QueryKey) -> usize {
    self.entries.get(key).map_or(0, |e| e.owners.len())
  }

  pub fn contains(&self, key: &QueryKey) -> bool { self.entries.contains_key(key) }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    error::SubscriptionError, source::event_channel, testing::ScriptedSource,
  };

  fn staff_key() -> QueryKey { QueryKey::document("staff", "O2") }

  fn alice() -> Owner { Owner::Person("A".into()) }

  fn bob() -> Owner { Owner::Person("B".into()) }

  #[test]
  fn shared_key_opens_one_listener() {
    let source = ScriptedSource::default();
    let (sink, _rx) = event_channel();
    let mut cache = SubscriptionCache::new(sink);

    assert!(cache.acquire(&staff_key(), alice(), &source));
    assert!(!cache.acquire(&staff_key(), bob(), &source));
    assert_eq!(source.attaches(&staff_key()), 1);
    assert_eq!(cache.ref_count(&staff_key()), 2);
  }

  #[test]
  fn detaches_after_last_owner_releases() {
    let source = ScriptedSource::default();
    let (sink, _rx) = event_channel();
    let mut cache = SubscriptionCache::new(sink);
    cache.acquire(&staff_key(), alice(), &source);
    cache.acquire(&staff_key(), bob(), &source);

    assert!(!cache.release(&staff_key(), &alice()));
    assert_eq!(source.detached(), 0);
    assert!(cache.contains(&staff_key()));

    assert!(cache.release(&staff_key(), &bob()));
    assert_eq!(source.detached(), 1);
    assert!(!cache.contains(&staff_key()));
  }

  #[test]
  fn acquire_and_release_are_idempotent_per_owner() {
    let source = ScriptedSource::default();
    let (sink, _rx) = event_channel();
    let mut cache = SubscriptionCache::new(sink);
    cache.acquire(&staff_key(), alice(), &source);
    cache.acquire(&staff_key(), alice(), &source);
    assert_eq!(cache.ref_count(&staff_key()), 1);

    assert!(!cache.release(&staff_key(), &bob()));
    assert!(cache.release(&staff_key(), &alice()));
    assert!(!cache.release(&staff_key(), &alice()));
  }

  #[test]
  fn delivery_to_recreated_key_ignores_old_generation() {
    let source = ScriptedSource::default();
    let (sink, mut rx) = event_channel();
    let mut cache = SubscriptionCache::new(sink);

    cache.acquire(&staff_key(), alice(), &source);
    cache.release(&staff_key(), &alice());
    cache.acquire(&staff_key(), alice(), &source);
    source.answer(&staff_key(), vec![]);

    let stale = rx.try_recv().unwrap();
    let fresh = rx.try_recv().unwrap();
    assert!(!cache.deliver(stale).unwrap());
    assert!(cache.deliver(fresh).unwrap());
    assert!(cache.state(&staff_key()).unwrap().is_hydrated());
  }

  #[test]
  fn retry_failed_reopens_only_failed_entries() {
    let source = ScriptedSource::default();
    let (sink, _rx) = event_channel();
    let mut cache = SubscriptionCache::new(sink);
    let other = QueryKey::document("staff", "O3");

    source.reject_next(SubscriptionError::new("unavailable", "offline"));
    cache.acquire(&staff_key(), alice(), &source);
    cache.acquire(&other, alice(), &source);
    assert!(cache.state(&staff_key()).unwrap().is_failed());

    assert_eq!(cache.retry_failed(&source), 1);
    assert_eq!(source.attaches(&staff_key()), 2);
    assert_eq!(source.attaches(&other), 1);
  }
}
