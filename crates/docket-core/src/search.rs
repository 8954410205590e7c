//! Caseload search: selected criteria → search queries → watched IDs.
//!
//! Each selected search ID becomes one query per searchable system
//! (`clients?officerId==O1&stateCode==US_XX`). Changing the selection
//! reconciles the open queries by set difference, so adding one officer to
//! an existing selection opens exactly one new listener per system.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
  cache::{Owner, SubscriptionCache},
  config::DocketConfig,
  person::{LocationRecord, PersonKind, StaffRecord},
  source::{DocumentSource, QueryKey},
};

// ─── Types ───────────────────────────────────────────────────────────────────

/// Which dimension the selected search IDs refer to.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum SearchType {
  Officer,
  Location,
  Caseload,
  /// Match against every configured search field.
  All,
}

/// The system a caseworker is currently viewing.
#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum SystemId {
  Supervision,
  Incarceration,
  #[default]
  All,
}

impl SystemId {
  pub fn includes(self, kind: PersonKind) -> bool {
    match self {
      Self::All => true,
      Self::Supervision => kind == PersonKind::Client,
      Self::Incarceration => kind == PersonKind::Resident,
    }
  }
}

/// A value a caseworker can pick as a search ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Searchable {
  pub search_type:  SearchType,
  pub search_id:    String,
  pub search_label: String,
}

impl Searchable {
  pub fn officer(staff: &StaffRecord) -> Self {
    Self {
      search_type:  SearchType::Officer,
      search_id:    staff.id.clone(),
      search_label: staff.full_name(),
    }
  }

  pub fn location(location: &LocationRecord) -> Self {
    Self {
      search_type:  SearchType::Location,
      search_id:    location.id.clone(),
      search_label: location.name.clone(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionState {
  Empty,
  /// Some but not all required dimensions are chosen.
  Partial,
  /// A search type and at least one search ID: queries may be opened.
  Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
  pub search_type: Option<SearchType>,
  pub search_ids:  BTreeSet<String>,
}

impl SearchCriteria {
  pub fn new<I, T>(search_type: SearchType, search_ids: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<String>,
  {
    Self {
      search_type: Some(search_type),
      search_ids:  search_ids.into_iter().map(Into::into).collect(),
    }
  }
}

/// What one reconciliation opened and closed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryDiff {
  pub opened: Vec<QueryKey>,
  pub closed: Vec<QueryKey>,
}

// ─── Store ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SearchStore {
  criteria:      SearchCriteria,
  type_override: Option<SearchType>,
  active_system: SystemId,
  /// Queries currently held in the cache under [`Owner::Search`].
  active:        BTreeMap<QueryKey, PersonKind>,
}

impl SearchStore {
  pub fn new() -> Self { Self::default() }

  pub fn criteria(&self) -> &SearchCriteria { &self.criteria }

  pub fn selected_search_ids(&self) -> impl Iterator<Item = &str> {
    self.criteria.search_ids.iter().map(String::as_str)
  }

  /// The override if set, otherwise the criteria's own type.
  pub fn search_type(&self) -> Option<SearchType> {
    self.type_override.or(self.criteria.search_type)
  }

  pub fn active_system(&self) -> SystemId { self.active_system }

  pub fn selection_state(&self) -> SelectionState {
    match (self.search_type(), self.criteria.search_ids.is_empty()) {
      (None, true) => SelectionState::Empty,
      (Some(_), false) => SelectionState::Complete,
      _ => SelectionState::Partial,
    }
  }

  pub(crate) fn set_criteria(&mut self, criteria: SearchCriteria) {
    self.criteria = criteria;
  }

  pub(crate) fn set_type_override(&mut self, search_type: Option<SearchType>) {
    self.type_override = search_type;
  }

  pub(crate) fn set_active_system(&mut self, system: SystemId) {
    self.active_system = system;
  }

  /// Forget the selection and any override, e.g. on a jurisdiction switch.
  pub(crate) fn clear(&mut self) {
    self.criteria = SearchCriteria::default();
    self.type_override = None;
  }

  /// The queries the current selection calls for. Empty unless the
  /// selection is complete.
  pub fn required_queries(
    &self,
    config: &DocketConfig,
    jurisdiction: &str,
  ) -> BTreeMap<QueryKey, PersonKind> {
    let mut queries = BTreeMap::new();
    let Some(search_type) = self.search_type() else {
      return queries;
    };
    if self.selection_state() != SelectionState::Complete {
      return queries;
    }

    for system in &config.systems {
      if !self.active_system.includes(system.person_kind) {
        continue;
      }
      let fields = system.search.iter().filter(|f| {
        search_type == SearchType::All || f.search_type == search_type
      });
      for field in fields {
        for id in &self.criteria.search_ids {
          let key = QueryKey::query(&system.collection, [
            ("stateCode", jurisdiction),
            (field.field.as_str(), id.as_str()),
          ]);
          queries.insert(key, system.person_kind);
        }
      }
    }
    queries
  }

  /// Bring the cache in line with `required` by set difference: new queries
  /// are hydrated, dropped ones released, unchanged ones left untouched.
  pub(crate) fn reconcile<S>(
    &mut self,
    required: BTreeMap<QueryKey, PersonKind>,
    cache: &mut SubscriptionCache,
    source: &S,
  ) -> QueryDiff
  where
    S: DocumentSource + ?Sized,
  {
    let mut diff = QueryDiff::default();
    for key in self.active.keys() {
      if !required.contains_key(key) {
        cache.release(key, &Owner::Search);
        diff.closed.push(key.clone());
      }
    }
    for key in required.keys() {
      if !self.active.contains_key(key) {
        cache.acquire(key, Owner::Search, source);
        diff.opened.push(key.clone());
      }
    }
    if !diff.opened.is_empty() || !diff.closed.is_empty() {
      debug!(
        opened = diff.opened.len(),
        closed = diff.closed.len(),
        "search queries reconciled"
      );
    }
    self.active = required;
    diff
  }

  pub fn is_active_query(&self, key: &QueryKey) -> bool { self.active.contains_key(key) }

  pub fn active_queries(&self) -> impl Iterator<Item = (&QueryKey, PersonKind)> {
    self.active.iter().map(|(key, kind)| (key, *kind))
  }

  /// Person IDs delivered by the hydrated search queries.
  pub fn matching_ids(&self, cache: &SubscriptionCache) -> BTreeMap<String, PersonKind> {
    let mut ids = BTreeMap::new();
    for (key, kind) in &self.active {
      let Some(subscription) = cache.get(key) else {
        continue;
      };
      if !subscription.state().is_hydrated() {
        continue;
      }
      for document in subscription.data() {
        ids.entry(document.id.clone()).or_insert(*kind);
      }
    }
    ids
  }
}
