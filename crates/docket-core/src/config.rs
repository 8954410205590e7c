//! Runtime configuration, deserialised from `docket.toml` by the binary.
//!
//! ```toml
//! jurisdiction        = "US_XX"
//! location_collection = "locations"
//!
//! [[systems]]
//! person_kind = "CLIENT"
//! collection  = "clients"
//! search      = [
//!   { search_type = "OFFICER",  field = "officerId" },
//!   { search_type = "LOCATION", field = "district" },
//! ]
//!
//! [[opportunities]]
//! jurisdiction     = "US_XX"
//! opportunity_type = "earlyTermination"
//! label            = "Early Termination"
//! person_kind      = "CLIENT"
//! criteria         = [{ kind = "marked_eligible" }]
//! ```

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::{
  Error, Result, opportunity::Criterion, person::PersonKind,
  search::SearchType,
};

#[derive(Debug, Clone, Deserialize)]
pub struct DocketConfig {
  /// The active jurisdiction (state code), e.g. `US_ND`.
  pub jurisdiction:        String,
  /// Collection holding staff records, keyed by staff ID.
  #[serde(default = "default_staff_collection")]
  pub staff_collection:    String,
  /// Collection holding searchable locations. Location searchables are
  /// unavailable without one.
  #[serde(default)]
  pub location_collection: Option<String>,
  /// Upper bound on persons watched through search results. Pinned persons
  /// are always watched.
  #[serde(default)]
  pub max_watched_persons: Option<usize>,
  #[serde(default)]
  pub systems:             Vec<SystemConfig>,
  #[serde(default)]
  pub opportunities:       Vec<OpportunitySettings>,
}

fn default_staff_collection() -> String { "staff".to_owned() }

/// Where persons of one kind live and how they can be searched.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
  pub person_kind: PersonKind,
  pub collection:  String,
  #[serde(default)]
  pub search:      Vec<SearchFieldConfig>,
}

/// Maps a search type to the document field its IDs are matched against.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchFieldConfig {
  pub search_type: SearchType,
  pub field:       String,
}

/// One `[[opportunities]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct OpportunitySettings {
  pub jurisdiction:        String,
  pub opportunity_type:    String,
  pub label:               String,
  pub person_kind:         PersonKind,
  #[serde(default)]
  pub referral_collection: Option<String>,
  #[serde(default)]
  pub form_generator_ref:  Option<String>,
  #[serde(default)]
  pub display_order:       i32,
  #[serde(default)]
  pub criteria:            Vec<Criterion>,
  /// Referral field ordering this type's opportunities across a caseload.
  #[serde(default)]
  pub sort_by:             Option<String>,
}

impl DocketConfig {
  /// A config with no systems or opportunities.
  pub fn new(jurisdiction: impl Into<String>) -> Self {
    Self {
      jurisdiction:        jurisdiction.into(),
      staff_collection:    default_staff_collection(),
      location_collection: None,
      max_watched_persons: None,
      systems:             Vec::new(),
      opportunities:       Vec::new(),
    }
  }

  pub fn system(&self, kind: PersonKind) -> Option<&SystemConfig> {
    self.systems.iter().find(|s| s.person_kind == kind)
  }

  pub fn validate(&self) -> Result<()> {
    if self.jurisdiction.trim().is_empty() {
      return Err(Error::Config("jurisdiction must not be empty".into()));
    }
    let mut kinds = BTreeSet::new();
    for system in &self.systems {
      if !kinds.insert(system.person_kind) {
        return Err(Error::Config(format!(
          "system {} configured more than once",
          system.person_kind
        )));
      }
      if system.collection.is_empty() {
        return Err(Error::Config(format!(
          "system {} has no collection",
          system.person_kind
        )));
      }
      if let Some(field) = system.search.iter().find(|f| f.field.is_empty()) {
        return Err(Error::Config(format!(
          "search type {} of system {} has no field",
          field.search_type, system.person_kind
        )));
      }
    }
    if self.systems.iter().any(|s| s.collection == self.staff_collection) {
      return Err(Error::Config(format!(
        "collection {:?} is used for both persons and staff",
        self.staff_collection
      )));
    }
    if let Some(locations) = &self.location_collection {
      if *locations == self.staff_collection
        || self.systems.iter().any(|s| s.collection == *locations)
      {
        return Err(Error::Config(format!(
          "location collection {locations:?} is already in use"
        )));
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn system(kind: PersonKind, collection: &str) -> SystemConfig {
    SystemConfig {
      person_kind: kind,
      collection:  collection.into(),
      search:      vec![SearchFieldConfig {
        search_type: SearchType::Officer,
        field:       "officerId".into(),
      }],
    }
  }

  #[test]
  fn valid_config_passes() {
    let mut config = DocketConfig::new("US_XX");
    config.systems.push(system(PersonKind::Client, "clients"));
    config.systems.push(system(PersonKind::Resident, "residents"));
    assert!(config.validate().is_ok());
    assert_eq!(config.system(PersonKind::Resident).unwrap().collection, "residents");
  }

  #[test]
  fn deserialises_with_defaults() {
    let config: DocketConfig = serde_json::from_value(serde_json::json!({
      "jurisdiction": "US_XX",
      "systems": [{
        "person_kind": "RESIDENT",
        "collection": "residents",
        "search": [{ "search_type": "LOCATION", "field": "facilityId" }],
      }],
      "opportunities": [{
        "jurisdiction": "US_XX",
        "opportunity_type": "workRelease",
        "label": "Work Release",
        "person_kind": "RESIDENT",
        "criteria": [{ "kind": "custody_level_in", "levels": ["MINIMUM"] }],
      }],
    }))
    .unwrap();
    assert_eq!(config.staff_collection, "staff");
    assert_eq!(config.systems[0].search[0].search_type, SearchType::Location);
    assert_eq!(config.opportunities[0].criteria, vec![Criterion::CustodyLevelIn {
      levels: vec!["MINIMUM".into()],
    }]);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn duplicate_system_is_rejected() {
    let mut config = DocketConfig::new("US_XX");
    config.systems.push(system(PersonKind::Client, "clients"));
    config.systems.push(system(PersonKind::Client, "others"));
    assert!(matches!(config.validate(), Err(Error::Config(_))));
  }

  #[test]
  fn staff_collection_must_be_distinct() {
    let mut config = DocketConfig::new("US_XX");
    config.systems.push(system(PersonKind::Client, "staff"));
    assert!(matches!(config.validate(), Err(Error::Config(_))));
  }

  #[test]
  fn location_collection_must_be_distinct() {
    let mut config = DocketConfig::new("US_XX");
    config.systems.push(system(PersonKind::Client, "clients"));
    config.location_collection = Some("clients".into());
    assert!(matches!(config.validate(), Err(Error::Config(_))));
    config.location_collection = Some("locations".into());
    assert!(config.validate().is_ok());
  }
}
