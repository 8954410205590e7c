//! The caseload coordinator.
//!
//! [`WorkflowsStore`] owns the search store, the subscription cache and the
//! decoded person models. Selection changes reconcile subscriptions
//! synchronously; source deliveries queue on one channel and are applied in
//! arrival order by [`process_pending`](WorkflowsStore::process_pending) or
//! [`next_event`](WorkflowsStore::next_event). Every mutation goes through
//! `&mut self`, so a delivery can never re-enter a reconciliation.

use std::{
  cmp::Ordering,
  collections::{BTreeMap, BTreeSet, HashMap},
  fmt,
  sync::Arc,
};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
  Error, Result,
  cache::{Owner, SubscriptionCache},
  config::DocketConfig,
  error::{SubscriptionError, ValidationError},
  opportunity::{Opportunity, OpportunityStatus, OpportunityType},
  person::{LocationRecord, PersonKind, PersonModel, PersonRecord, StaffRecord},
  registry::OpportunityRegistry,
  search::{Searchable, SearchCriteria, SearchStore, SearchType, SystemId},
  source::{Document, DocumentSource, QueryKey, SourceEvent, event_channel},
  subscription::HydrationState,
};

// ─── Read model ──────────────────────────────────────────────────────────────

/// Why a watched person is missing from the caseload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
  /// The person's record listener failed.
  Subscription { error: SubscriptionError },
  /// The record arrived but did not decode.
  Validation { error: ValidationError },
  /// The record listener hydrated with no document.
  Missing,
}

impl fmt::Display for FailureReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Subscription { error } => write!(f, "subscription failed: {error}"),
      Self::Validation { error } => write!(f, "{error}"),
      Self::Missing => f.write_str("record not found"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonFailure {
  pub person_id: String,
  pub kind:      PersonKind,
  pub reason:    FailureReason,
}

/// A search query whose listener failed. It contributes no person IDs until
/// retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryFailure {
  pub query: QueryKey,
  pub error: SubscriptionError,
}

/// The caseload as of the last applied delivery.
#[derive(Debug)]
pub struct CaseloadView<'a> {
  /// Hydrated, valid persons in comparator order.
  pub persons:        Vec<&'a PersonModel>,
  pub failed:         Vec<PersonFailure>,
  /// Watched IDs whose record has not arrived yet.
  pub pending:        Vec<String>,
  pub failed_queries: Vec<QueryFailure>,
  /// Search results left unwatched by `max_watched_persons`.
  pub truncated:      usize,
}

impl CaseloadView<'_> {
  /// No record is still loading.
  pub fn is_settled(&self) -> bool { self.pending.is_empty() }
}

/// Caseload persons sharing one assigned officer.
#[derive(Debug)]
pub struct StaffGroup<'a> {
  pub officer_id: &'a str,
  /// `None` until the staff record hydrates.
  pub staff:      Option<&'a StaffRecord>,
  pub persons:    Vec<&'a PersonModel>,
}

enum PersonStatus<'a> {
  Ready(&'a PersonModel),
  Failed(FailureReason),
  Pending,
}

pub type Comparator = Box<dyn Fn(&PersonModel, &PersonModel) -> Ordering>;

/// Surname, then given names, case-insensitively; person ID breaks ties.
pub fn by_name(a: &PersonModel, b: &PersonModel) -> Ordering {
  let key = |p: &PersonModel| {
    let name = p.record().name();
    (name.surname.to_lowercase(), name.given_names.to_lowercase())
  };
  key(a).cmp(&key(b)).then_with(|| a.id().cmp(b.id()))
}

/// Surname, then given names, ignoring case and anything but letters and
/// spaces; staff ID breaks ties.
pub fn by_staff_name(a: &StaffRecord, b: &StaffRecord) -> Ordering {
  let fold = |s: &str| -> String {
    s.chars()
      .filter(|c| c.is_alphabetic() || c.is_whitespace())
      .flat_map(char::to_lowercase)
      .collect()
  };
  let key = |s: &StaffRecord| (fold(&s.surname), fold(&s.given_names));
  key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id))
}

// ─── Store ───────────────────────────────────────────────────────────────────

pub struct WorkflowsStore<S> {
  source:       S,
  config:       DocketConfig,
  jurisdiction: String,
  registry:     Arc<OpportunityRegistry>,
  search:       SearchStore,
  cache:        SubscriptionCache,
  events:       mpsc::UnboundedReceiver<SourceEvent>,
  /// Current watched set: search results plus pinned persons.
  watched:      BTreeMap<String, PersonKind>,
  pinned:       BTreeMap<String, PersonKind>,
  /// Keys held in the cache under `Owner::Person(id)`.
  person_keys:  HashMap<String, BTreeSet<QueryKey>>,
  /// Decoded persons. Unwatched persons are kept, marked stale.
  persons:      BTreeMap<String, PersonModel>,
  /// Decode failures and missing records. Subscription failures are read
  /// from the cache instead.
  failures:     BTreeMap<String, FailureReason>,
  truncated:    usize,
  comparator:   Comparator,
  /// Staff and location queries held under `Owner::Search` while
  /// searchables are open.
  directory:    BTreeSet<QueryKey>,
  searchables:  bool,
}

impl<S: DocumentSource> WorkflowsStore<S> {
  pub fn new(
    source: S,
    config: DocketConfig,
    registry: Arc<OpportunityRegistry>,
  ) -> Result<Self> {
    config.validate()?;
    let (sink, events) = event_channel();
    Ok(Self {
      source,
      jurisdiction: config.jurisdiction.clone(),
      config,
      registry,
      search: SearchStore::new(),
      cache: SubscriptionCache::new(sink),
      events,
      watched: BTreeMap::new(),
      pinned: BTreeMap::new(),
      person_keys: HashMap::new(),
      persons: BTreeMap::new(),
      failures: BTreeMap::new(),
      truncated: 0,
      comparator: Box::new(by_name),
      directory: BTreeSet::new(),
      searchables: false,
    })
  }

  pub fn source(&self) -> &S { &self.source }

  pub fn jurisdiction(&self) -> &str { &self.jurisdiction }

  pub fn registry(&self) -> &OpportunityRegistry { &self.registry }

  pub fn search(&self) -> &SearchStore { &self.search }

  pub fn subscriptions(&self) -> &SubscriptionCache { &self.cache }

  // ─── Selection ─────────────────────────────────────────────────────────────

  /// Replace the caseload selection and reconcile subscriptions against it.
  pub fn set_search_criteria(&mut self, criteria: SearchCriteria) {
    info!(
      search_type = ?criteria.search_type,
      ids = criteria.search_ids.len(),
      "search criteria changed"
    );
    self.search.set_criteria(criteria);
    self.reconcile_search();
  }

  pub fn set_search_type_override(&mut self, search_type: Option<SearchType>) {
    self.search.set_type_override(search_type);
    self.reconcile_search();
  }

  pub fn set_active_system(&mut self, system: SystemId) {
    if self.search.active_system() == system {
      return;
    }
    info!(%system, "active system changed");
    self.search.set_active_system(system);
    self.reconcile_search();
  }

  /// Switch jurisdiction. Clears the selection and pins, and forgets every
  /// person of the previous jurisdiction.
  pub fn set_jurisdiction(&mut self, jurisdiction: impl Into<String>) {
    let jurisdiction = jurisdiction.into();
    if jurisdiction == self.jurisdiction {
      return;
    }
    info!(from = %self.jurisdiction, to = %jurisdiction, "jurisdiction changed");
    self.jurisdiction = jurisdiction;
    self.search.clear();
    self.pinned.clear();
    self.reconcile_search();
    self.reconcile_directory();
    self.persons.clear();
  }

  /// Watch `id` regardless of the search selection, e.g. for an open
  /// profile.
  pub fn pin_person(&mut self, id: impl Into<String>, kind: PersonKind) -> Result<()> {
    if self.config.system(kind).is_none() {
      return Err(Error::Config(format!("no system configured for {kind}")));
    }
    self.pinned.insert(id.into(), kind);
    self.reconcile_watched();
    Ok(())
  }

  pub fn unpin_person(&mut self, id: &str) {
    if self.pinned.remove(id).is_some() {
      self.reconcile_watched();
    }
  }

  pub fn set_comparator(
    &mut self,
    comparator: impl Fn(&PersonModel, &PersonModel) -> Ordering + 'static,
  ) {
    self.comparator = Box::new(comparator);
  }

  // ─── Events ────────────────────────────────────────────────────────────────

  /// Apply every queued delivery, including any queued while applying.
  /// Returns the number applied.
  pub fn process_pending(&mut self) -> usize {
    let mut applied = 0;
    while let Ok(event) = self.events.try_recv() {
      self.apply(event);
      applied += 1;
    }
    applied
  }

  /// Wait for the next delivery and apply it. The store holds a sender
  /// itself, so this only returns `false` if the channel is closed.
  pub async fn next_event(&mut self) -> bool {
    match self.events.recv().await {
      Some(event) => {
        self.apply(event);
        true
      }
      None => false,
    }
  }

  /// Re-open every failed subscription. Returns how many were retried.
  pub fn retry_failed(&mut self) -> usize {
    let retried = self.cache.retry_failed(&self.source);
    if retried > 0 {
      info!(retried, "retrying failed subscriptions");
    }
    retried
  }

  fn apply(&mut self, event: SourceEvent) {
    let key = event.key.clone();
    match self.cache.deliver(event) {
      Ok(true) => self.route(&key),
      Ok(false) => {}
      Err(err) => error!(error = %err, "dropping delivery"),
    }
  }

  fn route(&mut self, key: &QueryKey) {
    if self.search.is_active_query(key) {
      self.reconcile_watched();
      return;
    }
    let QueryKey::Document { collection, id } = key else {
      return;
    };
    if self.config.systems.iter().any(|s| s.collection == *collection) {
      self.refresh_person(id);
    }
    if *collection == self.config.staff_collection {
      self.refresh_staff(id);
    }
    if self.persons.contains_key(id) {
      self.refresh_referrals(id, Some(collection.as_str()));
    }
  }

  // ─── Reconciliation ────────────────────────────────────────────────────────

  fn reconcile_search(&mut self) {
    let required = self.search.required_queries(&self.config, &self.jurisdiction);
    self.search.reconcile(required, &mut self.cache, &self.source);
    self.reconcile_watched();
  }

  /// Diff the watched set against search results plus pins, opening and
  /// closing person subscriptions for the difference.
  fn reconcile_watched(&mut self) {
    let mut next = self.search.matching_ids(&self.cache);
    let mut capped = Vec::new();
    if let Some(max) = self.config.max_watched_persons {
      if next.len() > max {
        capped = next.keys().skip(max).cloned().collect();
        next = next.into_iter().take(max).collect();
      }
    }
    for (id, kind) in &self.pinned {
      next.entry(id.clone()).or_insert(*kind);
    }
    self.truncated = capped.iter().filter(|id| !next.contains_key(*id)).count();
    if self.truncated > 0 {
      warn!(dropped = self.truncated, "watched persons capped");
    }

    let removed: Vec<String> = self
      .watched
      .iter()
      .filter(|(id, kind)| next.get(*id) != Some(*kind))
      .map(|(id, _)| id.clone())
      .collect();
    for id in &removed {
      self.unwatch(id);
    }
    for (id, kind) in next {
      if !self.watched.contains_key(&id) {
        self.watch(id, kind);
      }
    }
  }

  fn watch(&mut self, id: String, kind: PersonKind) {
    let owner = Owner::Person(id.clone());
    let mut keys = BTreeSet::new();
    if let Some(key) = self.record_key(kind, &id) {
      keys.insert(key);
    }
    for collection in self.referral_collections(&self.jurisdiction, kind) {
      keys.insert(QueryKey::document(collection, &id));
    }
    for key in &keys {
      self.cache.acquire(key, owner.clone(), &self.source);
    }
    debug!(person = %id, %kind, subscriptions = keys.len(), "watching person");
    self.person_keys.insert(id.clone(), keys);
    self.watched.insert(id.clone(), kind);
    self.refresh_person(&id);
  }

  fn unwatch(&mut self, id: &str) {
    let owner = Owner::Person(id.to_owned());
    for key in self.person_keys.remove(id).unwrap_or_default() {
      self.cache.release(&key, &owner);
    }
    self.watched.remove(id);
    self.failures.remove(id);
    if let Some(person) = self.persons.get_mut(id) {
      person.set_stale(true);
    }
    debug!(person = %id, "unwatched person");
  }

  fn record_key(&self, kind: PersonKind, id: &str) -> Option<QueryKey> {
    self
      .config
      .system(kind)
      .map(|system| QueryKey::document(&system.collection, id))
  }

  fn referral_collections(&self, jurisdiction: &str, kind: PersonKind) -> BTreeSet<String> {
    self
      .registry
      .types_for(jurisdiction)
      .filter(|(_, config)| config.person_kind == kind)
      .filter_map(|(_, config)| config.referral_collection.clone())
      .collect()
  }

  // ─── Entity refresh ────────────────────────────────────────────────────────

  /// Re-decode a watched person's record from its subscription.
  fn refresh_person(&mut self, id: &str) {
    let Some(kind) = self.watched.get(id).copied() else {
      return;
    };
    let Some(key) = self.record_key(kind, id) else {
      return;
    };
    let Some(subscription) = self.cache.get(&key) else {
      return;
    };
    if !subscription.state().is_hydrated() {
      return;
    }
    let decoded = subscription
      .data()
      .first()
      .map(|document| PersonRecord::decode(kind, document));

    match decoded {
      None => {
        warn!(person = %id, "record not found");
        self.failures.insert(id.to_owned(), FailureReason::Missing);
      }
      Some(Err(err)) => {
        warn!(person = %id, error = %err, "record failed validation");
        self
          .failures
          .insert(id.to_owned(), FailureReason::Validation { error: err });
      }
      Some(Ok(record)) => {
        self.failures.remove(id);
        self.upsert_person(record);
      }
    }
  }

  fn upsert_person(&mut self, record: PersonRecord) {
    let id = record.id().to_owned();
    let officer_id = record.officer_id().to_owned();
    let kind = record.kind();
    self.attach_staff(&id, &officer_id);
    self.attach_referrals(&id, kind, record.state_code());

    if let Some(person) = self.persons.get_mut(&id).filter(|p| p.kind() == kind) {
      person.update_record(record);
      person.set_stale(false);
    } else {
      debug!(person = %id, "person hydrated");
      let person = PersonModel::new(record, Arc::clone(&self.registry));
      self.persons.insert(id.clone(), person);
    }

    let staff = self.staff_record(&officer_id);
    if let Some(person) = self.persons.get_mut(&id) {
      person.set_assigned_staff(staff);
    }
    self.refresh_referrals(&id, None);
  }

  /// Point the person's staff subscription at `officer_id`, releasing the
  /// previous officer's if it changed.
  fn attach_staff(&mut self, id: &str, officer_id: &str) {
    let wanted = QueryKey::document(&self.config.staff_collection, officer_id);
    let owner = Owner::Person(id.to_owned());
    let keys = self.person_keys.entry(id.to_owned()).or_default();

    let previous: Vec<QueryKey> = keys
      .iter()
      .filter(|k| k.collection() == self.config.staff_collection && **k != wanted)
      .cloned()
      .collect();
    for key in previous {
      keys.remove(&key);
      self.cache.release(&key, &owner);
    }
    if keys.insert(wanted.clone()) {
      self.cache.acquire(&wanted, owner, &self.source);
    }
  }

  /// Hold referral subscriptions for the types registered in the record's
  /// own jurisdiction, which may differ from the store's for pinned persons.
  fn attach_referrals(&mut self, id: &str, kind: PersonKind, state_code: &str) {
    let wanted: BTreeSet<QueryKey> = self
      .referral_collections(state_code, kind)
      .into_iter()
      .map(|collection| QueryKey::document(collection, id))
      .collect();
    let record_key = self.record_key(kind, id);
    let owner = Owner::Person(id.to_owned());
    let keys = self.person_keys.entry(id.to_owned()).or_default();

    let previous: Vec<QueryKey> = keys
      .iter()
      .filter(|k| {
        Some(*k) != record_key.as_ref()
          && k.collection() != self.config.staff_collection
          && !wanted.contains(*k)
      })
      .cloned()
      .collect();
    for key in previous {
      keys.remove(&key);
      self.cache.release(&key, &owner);
    }
    for key in wanted {
      if keys.insert(key.clone()) {
        self.cache.acquire(&key, owner.clone(), &self.source);
      }
    }
  }

  fn staff_record(&self, officer_id: &str) -> Option<StaffRecord> {
    let key = QueryKey::document(&self.config.staff_collection, officer_id);
    let subscription = self.cache.get(&key)?;
    if !subscription.state().is_hydrated() {
      return None;
    }
    let document = subscription.data().first()?;
    match StaffRecord::decode(document) {
      Ok(staff) => Some(staff),
      Err(err) => {
        warn!(staff = %officer_id, error = %err, "staff record failed validation");
        None
      }
    }
  }

  fn refresh_staff(&mut self, officer_id: &str) {
    let staff = self.staff_record(officer_id);
    for person in self
      .persons
      .values_mut()
      .filter(|p| !p.is_stale() && p.record().officer_id() == officer_id)
    {
      person.set_assigned_staff(staff.clone());
    }
  }

  /// Mirror referral subscriptions into the person's slots; limited to one
  /// collection when `only` is set.
  fn refresh_referrals(&mut self, id: &str, only: Option<&str>) {
    let Some((kind, state_code)) = self
      .persons
      .get(id)
      .map(|p| (p.kind(), p.record().state_code().to_owned()))
    else {
      return;
    };
    let slots: Vec<(OpportunityType, HydrationState, Option<Value>)> = self
      .registry
      .types_for(&state_code)
      .filter(|(_, config)| config.person_kind == kind)
      .filter_map(|(ty, config)| {
        let collection = config.referral_collection.as_deref()?;
        if only.is_some_and(|c| c != collection) {
          return None;
        }
        let key = QueryKey::document(collection, id);
        Some(match self.cache.get(&key) {
          Some(subscription) => (
            ty.clone(),
            subscription.state().clone(),
            subscription.data().first().map(|d| d.data.clone()),
          ),
          None => (ty.clone(), HydrationState::NeedsHydration, None),
        })
      })
      .collect();

    if let Some(person) = self.persons.get_mut(id) {
      for (ty, state, record) in slots {
        person.set_referral(ty, state, record);
      }
    }
  }

  // ─── Views ─────────────────────────────────────────────────────────────────

  fn status(&self, id: &str, kind: PersonKind) -> PersonStatus<'_> {
    let Some(key) = self.record_key(kind, id) else {
      return PersonStatus::Pending;
    };
    match self.cache.state(&key) {
      Some(HydrationState::Failed { error }) => {
        PersonStatus::Failed(FailureReason::Subscription {
          error: error.clone(),
        })
      }
      Some(HydrationState::Hydrated) => match self.failures.get(id) {
        Some(reason) => PersonStatus::Failed(reason.clone()),
        None => match self.persons.get(id) {
          Some(person) if !person.is_stale() => PersonStatus::Ready(person),
          _ => PersonStatus::Pending,
        },
      },
      _ => PersonStatus::Pending,
    }
  }

  pub fn caseload(&self) -> CaseloadView<'_> {
    let mut view = CaseloadView {
      persons:        Vec::new(),
      failed:         Vec::new(),
      pending:        Vec::new(),
      failed_queries: Vec::new(),
      truncated:      self.truncated,
    };
    let system = self.search.active_system();
    for (id, kind) in &self.watched {
      if !system.includes(*kind) {
        continue;
      }
      match self.status(id, *kind) {
        PersonStatus::Ready(person) => view.persons.push(person),
        PersonStatus::Failed(reason) => view.failed.push(PersonFailure {
          person_id: id.clone(),
          kind: *kind,
          reason,
        }),
        PersonStatus::Pending => view.pending.push(id.clone()),
      }
    }
    view.persons.sort_by(|a, b| (self.comparator)(a, b));

    for (query, _) in self.search.active_queries() {
      if let Some(HydrationState::Failed { error }) = self.cache.state(query) {
        view.failed_queries.push(QueryFailure {
          query: query.clone(),
          error: error.clone(),
        });
      }
    }
    view
  }

  /// Hydrated, valid caseload persons in comparator order.
  pub fn caseload_persons(&self) -> Vec<&PersonModel> { self.caseload().persons }

  /// Eligible opportunities of `opportunity_type` across the caseload, in
  /// the type's configured order or else caseload order.
  pub fn opportunities_by_type(
    &self,
    opportunity_type: &OpportunityType,
  ) -> Vec<&Opportunity> {
    let mut opportunities = self
      .caseload_persons()
      .into_iter()
      .filter_map(|p| p.opportunity_for_type(opportunity_type))
      .collect();
    self.sort_opportunities(opportunity_type, &mut opportunities);
    opportunities
  }

  pub fn opportunities_by_status(
    &self,
    opportunity_type: &OpportunityType,
    status: OpportunityStatus,
  ) -> Vec<&Opportunity> {
    let mut opportunities = self
      .caseload_persons()
      .into_iter()
      .flat_map(|p| p.opportunities_with_status(status))
      .filter(|o| o.opportunity_type == *opportunity_type)
      .collect();
    self.sort_opportunities(opportunity_type, &mut opportunities);
    opportunities
  }

  fn sort_opportunities(
    &self,
    opportunity_type: &OpportunityType,
    opportunities: &mut Vec<&Opportunity>,
  ) {
    let sort = self
      .registry
      .config(&self.jurisdiction, opportunity_type)
      .and_then(|config| config.sort.as_ref());
    if let Some(sort) = sort {
      opportunities.sort_by(|a, b| sort(a, b));
    }
  }

  /// Caseload persons grouped by officer, ordered by officer ID.
  pub fn caseload_grouped_by_staff(&self) -> Vec<StaffGroup<'_>> {
    let mut groups: BTreeMap<&str, StaffGroup<'_>> = BTreeMap::new();
    for person in self.caseload_persons() {
      let officer_id = person.record().officer_id();
      groups
        .entry(officer_id)
        .or_insert_with(|| StaffGroup {
          officer_id,
          staff: person.assigned_staff(),
          persons: Vec::new(),
        })
        .persons
        .push(person);
    }
    groups.into_values().collect()
  }

  /// Any known person, watched or stale.
  pub fn person(&self, id: &str) -> Option<&PersonModel> { self.persons.get(id) }

  pub fn watched_ids(&self) -> impl Iterator<Item = (&str, PersonKind)> {
    self.watched.iter().map(|(id, kind)| (id.as_str(), *kind))
  }

  pub fn is_pinned(&self, id: &str) -> bool { self.pinned.contains_key(id) }

  // ─── Searchables ───────────────────────────────────────────────────────────

  /// Subscribe to the jurisdiction's staff and locations, the values offered
  /// as search IDs.
  pub fn open_searchables(&mut self) {
    self.searchables = true;
    self.reconcile_directory();
  }

  pub fn close_searchables(&mut self) {
    self.searchables = false;
    self.reconcile_directory();
  }

  fn reconcile_directory(&mut self) {
    let mut required = BTreeSet::new();
    if self.searchables {
      let state = [("stateCode", self.jurisdiction.as_str())];
      required.insert(QueryKey::query(&self.config.staff_collection, state));
      if let Some(locations) = &self.config.location_collection {
        required.insert(QueryKey::query(locations, state));
      }
    }
    for key in self.directory.difference(&required) {
      self.cache.release(key, &Owner::Search);
    }
    for key in required.difference(&self.directory) {
      self.cache.acquire(key, Owner::Search, &self.source);
    }
    self.directory = required;
  }

  /// Hydrated documents of the open directory query over `collection`.
  fn directory_documents(&self, collection: &str) -> &[Document] {
    self
      .directory
      .iter()
      .find(|key| key.collection() == collection)
      .and_then(|key| self.cache.get(key))
      .filter(|subscription| subscription.state().is_hydrated())
      .map(|subscription| subscription.data())
      .unwrap_or_default()
  }

  /// Staff with a caseload in the active system, by name.
  pub fn available_officers(&self) -> Vec<StaffRecord> {
    let system = self.search.active_system();
    let mut officers: Vec<StaffRecord> = self
      .directory_documents(&self.config.staff_collection)
      .iter()
      .filter_map(|document| match StaffRecord::decode(document) {
        Ok(staff) => Some(staff),
        Err(err) => {
          debug!(staff = %document.id, error = %err, "skipping invalid staff record");
          None
        }
      })
      .filter(|staff| {
        [PersonKind::Client, PersonKind::Resident]
          .into_iter()
          .any(|kind| system.includes(kind) && staff.has_caseload_of(kind))
      })
      .collect();
    officers.sort_by(by_staff_name);
    officers
  }

  /// Locations in the active system, by name.
  pub fn available_locations(&self) -> Vec<LocationRecord> {
    let Some(collection) = &self.config.location_collection else {
      return Vec::new();
    };
    let system = self.search.active_system();
    let mut locations: Vec<LocationRecord> = self
      .directory_documents(collection)
      .iter()
      .filter_map(|document| match LocationRecord::decode(document) {
        Ok(location) => Some(location),
        Err(err) => {
          debug!(location = %document.id, error = %err, "skipping invalid location record");
          None
        }
      })
      .filter(|location| system.includes(location.person_kind))
      .collect();
    locations.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    locations
  }

  /// What can be selected for the current search type. Caseload IDs are
  /// officer IDs; `All` lists officers before locations.
  pub fn available_searchables(&self) -> Vec<Searchable> {
    let officers = || -> Vec<Searchable> {
      self.available_officers().iter().map(Searchable::officer).collect()
    };
    let locations = || -> Vec<Searchable> {
      self.available_locations().iter().map(Searchable::location).collect()
    };
    match self.search.search_type() {
      None => Vec::new(),
      Some(SearchType::Officer | SearchType::Caseload) => officers(),
      Some(SearchType::Location) => locations(),
      Some(SearchType::All) => {
        let mut all = officers();
        all.extend(locations());
        all
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{
    config::{SearchFieldConfig, SystemConfig},
    registry::OpportunityConfig,
    source::Document,
    testing::ScriptedSource,
  };

  fn config() -> DocketConfig {
    let mut config = DocketConfig::new("US_XX");
    config.systems.push(SystemConfig {
      person_kind: PersonKind::Client,
      collection:  "clients".into(),
      search:      vec![SearchFieldConfig {
        search_type: SearchType::Officer,
        field:       "officerId".into(),
      }],
    });
    config
  }

  fn registry() -> Arc<OpportunityRegistry> {
    let mut registry = OpportunityRegistry::new();
    registry.register_opportunity_type(
      "US_XX",
      "earlyTermination",
      OpportunityConfig::new(
        "Early termination",
        PersonKind::Client,
        |_: &PersonRecord, referral: Option<&Value>| referral.is_some(),
      )
      .with_referral_collection("earlyTerminationReferrals"),
    );
    Arc::new(registry)
  }

  fn store() -> WorkflowsStore<ScriptedSource> {
    WorkflowsStore::new(ScriptedSource::default(), config(), registry()).unwrap()
  }

  fn officer_query(id: &str) -> QueryKey {
    QueryKey::query("clients", [("stateCode", "US_XX"), ("officerId", id)])
  }

  fn client(id: &str, surname: &str) -> Document {
    Document::new(
      id,
      json!({
        "personExternalId": id,
        "stateCode": "US_XX",
        "personName": { "givenNames": "Pat", "surname": surname },
        "officerId": "O1",
      }),
    )
  }

  #[test]
  fn incomplete_selection_opens_nothing() {
    let mut store = store();
    store.set_search_criteria(SearchCriteria {
      search_type: Some(SearchType::Officer),
      search_ids:  BTreeSet::new(),
    });
    assert!(store.subscriptions().is_empty());
    assert_eq!(store.watched_ids().count(), 0);
  }

  #[test]
  fn search_results_hydrate_into_persons() {
    let mut store = store();
    store.set_search_criteria(SearchCriteria::new(SearchType::Officer, ["O1"]));
    store.source().answer(&officer_query("O1"), vec![
      client("A", "Zed"),
      client("B", "Able"),
    ]);
    store.process_pending();

    let view = store.caseload();
    assert!(view.persons.is_empty());
    assert_eq!(view.pending, ["A", "B"]);

    for (id, surname) in [("A", "Zed"), ("B", "Able")] {
      let key = QueryKey::document("clients", id);
      store.source().answer(&key, vec![client(id, surname)]);
    }
    store.process_pending();

    let ids: Vec<_> = store.caseload_persons().iter().map(|p| p.id()).collect();
    assert_eq!(ids, ["B", "A"]);

    // Both persons share one staff listener.
    let staff = QueryKey::document("staff", "O1");
    assert_eq!(store.subscriptions().ref_count(&staff), 2);
    assert_eq!(store.source().attaches(&staff), 1);
  }

  #[test]
  fn referral_delivery_recomputes_opportunities() {
    let mut store = store();
    store.pin_person("A", PersonKind::Client).unwrap();
    store
      .source()
      .answer(&QueryKey::document("clients", "A"), vec![client("A", "Zed")]);
    store.process_pending();

    let ty = OpportunityType::new("earlyTermination");
    let person = store.person("A").unwrap();
    assert!(person.opportunities().is_empty());

    let referral = QueryKey::document("earlyTerminationReferrals", "A");
    store
      .source()
      .answer(&referral, vec![Document::new("A", json!({ "eligibleDate": "2026-01-01" }))]);
    store.process_pending();
    assert_eq!(store.opportunities_by_type(&ty).len(), 1);
  }

  #[test]
  fn invalid_record_is_reported_with_its_path() {
    let mut store = store();
    store.pin_person("A", PersonKind::Client).unwrap();
    let mut doc = client("A", "Zed");
    doc.data["personName"] = json!({ "givenNames": "Pat" });
    store
      .source()
      .answer(&QueryKey::document("clients", "A"), vec![doc]);
    store.process_pending();

    let view = store.caseload();
    assert!(view.persons.is_empty());
    let FailureReason::Validation { error } = &view.failed[0].reason else {
      panic!("expected a validation failure, got {:?}", view.failed[0].reason);
    };
    assert_eq!(error.path, "personName.surname");
  }

  #[test]
  fn pinning_an_unconfigured_kind_is_rejected() {
    let mut store = store();
    assert!(matches!(
      store.pin_person("R1", PersonKind::Resident),
      Err(Error::Config(_))
    ));
  }
}
