//! The opportunity registry: (jurisdiction, opportunity type) → config.
//!
//! Registration order within a jurisdiction is the order opportunities are
//! evaluated and listed in. Re-registering a key replaces its configuration
//! in place, keeping its original slot.

use std::{cmp::Ordering, collections::HashMap, fmt, sync::Arc};

use serde_json::Value;
use tracing::debug;

use crate::{
  config::DocketConfig,
  opportunity::{
    Criterion, Eligibility, Opportunity, OpportunityType, staff_denial,
    status_for,
  },
  person::{PersonKind, PersonModel, PersonRecord},
  source::{lookup_field, scalar_text},
};

// ─── Predicates ──────────────────────────────────────────────────────────────

/// Decides eligibility from a person's attributes and referral record.
/// Implementations must be pure.
pub trait EligibilityPredicate: Send + Sync {
  fn evaluate(
    &self,
    opportunity_type: &OpportunityType,
    person: &PersonRecord,
    referral: Option<&Value>,
  ) -> Eligibility;
}

impl<F> EligibilityPredicate for F
where
  F: Fn(&PersonRecord, Option<&Value>) -> bool + Send + Sync,
{
  fn evaluate(
    &self,
    opportunity_type: &OpportunityType,
    person: &PersonRecord,
    referral: Option<&Value>,
  ) -> Eligibility {
    if self(person, referral) {
      Eligibility::eligible()
    } else {
      Eligibility::from_reasons(vec![format!(
        "criteria for {opportunity_type} not met"
      )])
    }
  }
}

/// All of the listed criteria must hold.
#[derive(Debug, Clone, Default)]
pub struct Criteria(pub Vec<Criterion>);

impl EligibilityPredicate for Criteria {
  fn evaluate(
    &self,
    opportunity_type: &OpportunityType,
    person: &PersonRecord,
    referral: Option<&Value>,
  ) -> Eligibility {
    let reasons = self
      .0
      .iter()
      .filter_map(|c| c.check(opportunity_type, person, referral).err())
      .collect();
    Eligibility::from_reasons(reasons)
  }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Orders one type's opportunities when listed across a caseload.
pub type OpportunitySort =
  Arc<dyn Fn(&Opportunity, &Opportunity) -> Ordering + Send + Sync>;

/// Ascending by a referral field; opportunities without it sort last.
pub fn by_referral_field(path: impl Into<String>) -> OpportunitySort {
  let path = path.into();
  Arc::new(move |a: &Opportunity, b: &Opportunity| {
    let key = |o: &Opportunity| {
      o.referral
        .as_ref()
        .and_then(|r| lookup_field(r, &path))
        .and_then(scalar_text)
        .map(|text| text.into_owned())
    };
    match (key(a), key(b)) {
      (Some(a), Some(b)) => a.cmp(&b),
      (Some(_), None) => Ordering::Less,
      (None, Some(_)) => Ordering::Greater,
      (None, None) => Ordering::Equal,
    }
  })
}

#[derive(Clone)]
pub struct OpportunityConfig {
  pub label:               String,
  pub person_kind:         PersonKind,
  /// Collection holding one referral document per person, keyed by person
  /// ID. `None` when eligibility needs no referral.
  pub referral_collection: Option<String>,
  pub form_generator_ref:  Option<String>,
  /// Position among the jurisdiction's tabs; evaluation order is
  /// registration order.
  pub display_order:       i32,
  pub predicate:           Arc<dyn EligibilityPredicate>,
  /// Listing order for this type; `None` keeps caseload order.
  pub sort:                Option<OpportunitySort>,
}

impl OpportunityConfig {
  pub fn new(
    label: impl Into<String>,
    person_kind: PersonKind,
    predicate: impl EligibilityPredicate + 'static,
  ) -> Self {
    Self {
      label: label.into(),
      person_kind,
      referral_collection: None,
      form_generator_ref: None,
      display_order: 0,
      predicate: Arc::new(predicate),
      sort: None,
    }
  }

  pub fn with_referral_collection(mut self, collection: impl Into<String>) -> Self {
    self.referral_collection = Some(collection.into());
    self
  }

  pub fn with_form_generator(mut self, reference: impl Into<String>) -> Self {
    self.form_generator_ref = Some(reference.into());
    self
  }

  pub fn with_display_order(mut self, display_order: i32) -> Self {
    self.display_order = display_order;
    self
  }

  pub fn with_sort(
    mut self,
    sort: impl Fn(&Opportunity, &Opportunity) -> Ordering + Send + Sync + 'static,
  ) -> Self {
    self.sort = Some(Arc::new(sort));
    self
  }
}

impl fmt::Debug for OpportunityConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("OpportunityConfig")
      .field("label", &self.label)
      .field("person_kind", &self.person_kind)
      .field("referral_collection", &self.referral_collection)
      .field("form_generator_ref", &self.form_generator_ref)
      .field("display_order", &self.display_order)
      .field("sorted", &self.sort.is_some())
      .finish_non_exhaustive()
  }
}

// ─── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct OpportunityRegistry {
  jurisdictions: HashMap<String, Vec<(OpportunityType, OpportunityConfig)>>,
}

impl OpportunityRegistry {
  pub fn new() -> Self { Self::default() }

  /// Build a registry from the `[[opportunities]]` tables of a config.
  pub fn from_config(config: &DocketConfig) -> Self {
    let mut registry = Self::new();
    for settings in &config.opportunities {
      let mut opportunity = OpportunityConfig::new(
        settings.label.clone(),
        settings.person_kind,
        Criteria(settings.criteria.clone()),
      )
      .with_display_order(settings.display_order);
      opportunity.referral_collection = settings.referral_collection.clone();
      opportunity.form_generator_ref = settings.form_generator_ref.clone();
      opportunity.sort = settings.sort_by.clone().map(by_referral_field);
      registry.register_opportunity_type(
        settings.jurisdiction.clone(),
        settings.opportunity_type.as_str(),
        opportunity,
      );
    }
    debug!(
      jurisdictions = registry.jurisdictions.len(),
      "opportunity registry built from config"
    );
    registry
  }

  /// Register `config` for `(jurisdiction, opportunity_type)`. Last write
  /// wins; the previous configuration is returned.
  pub fn register_opportunity_type(
    &mut self,
    jurisdiction: impl Into<String>,
    opportunity_type: impl Into<OpportunityType>,
    config: OpportunityConfig,
  ) -> Option<OpportunityConfig> {
    let opportunity_type = opportunity_type.into();
    let entries = self.jurisdictions.entry(jurisdiction.into()).or_default();
    match entries.iter_mut().find(|(ty, _)| *ty == opportunity_type) {
      Some((_, existing)) => Some(std::mem::replace(existing, config)),
      None => {
        entries.push((opportunity_type, config));
        None
      }
    }
  }

  pub fn config(
    &self,
    jurisdiction: &str,
    opportunity_type: &OpportunityType,
  ) -> Option<&OpportunityConfig> {
    self
      .types_for(jurisdiction)
      .find(|(ty, _)| *ty == opportunity_type)
      .map(|(_, config)| config)
  }

  /// Registered types for `jurisdiction`, in registration order.
  pub fn types_for(
    &self,
    jurisdiction: &str,
  ) -> impl Iterator<Item = (&OpportunityType, &OpportunityConfig)> {
    self
      .jurisdictions
      .get(jurisdiction)
      .into_iter()
      .flatten()
      .map(|(ty, config)| (ty, config))
  }

  /// Registered types for `jurisdiction`, ordered by `display_order` (ties
  /// keep registration order).
  pub fn types_by_display_order(&self, jurisdiction: &str) -> Vec<&OpportunityType> {
    let mut types: Vec<_> = self.types_for(jurisdiction).collect();
    types.sort_by_key(|(_, config)| config.display_order);
    types.into_iter().map(|(ty, _)| ty).collect()
  }

  /// Lazily yields the types whose predicate holds for `person`, in
  /// registration order. Types awaiting their referral are skipped.
  pub fn eligible_types_for<'a>(
    &'a self,
    person: &'a PersonModel,
  ) -> impl Iterator<Item = &'a OpportunityType> + 'a {
    self
      .applicable(person)
      .filter(move |(ty, config)| {
        config
          .predicate
          .evaluate(ty, person.record(), person.referral(ty))
          .eligible
      })
      .map(|(ty, _)| ty)
  }

  /// Evaluate every applicable opportunity for `person`.
  pub fn evaluate<'a>(
    &'a self,
    person: &'a PersonModel,
  ) -> impl Iterator<Item = Opportunity> + 'a {
    self.applicable(person).map(move |(ty, config)| {
      let referral = person.referral(ty);
      let eligibility = config.predicate.evaluate(ty, person.record(), referral);
      let staff_denial = staff_denial(referral);
      let status = status_for(&eligibility, &staff_denial, referral);
      Opportunity {
        person_id: person.id().to_owned(),
        opportunity_type: ty.clone(),
        label: config.label.clone(),
        form_generator_ref: config.form_generator_ref.clone(),
        eligibility,
        status,
        staff_denial,
        referral: referral.cloned(),
      }
    })
  }

  /// Types registered for the person's jurisdiction and kind whose referral
  /// (if any) has hydrated.
  fn applicable<'a>(
    &'a self,
    person: &'a PersonModel,
  ) -> impl Iterator<Item = (&'a OpportunityType, &'a OpportunityConfig)> + 'a {
    self
      .types_for(person.record().state_code())
      .filter(move |(ty, config)| {
        config.person_kind == person.kind()
          && person.opportunity_hydration(ty).is_hydrated()
      })
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{config::OpportunitySettings, source::Document};

  fn always(_: &PersonRecord, _: Option<&Value>) -> bool { true }

  fn person(registry: Arc<OpportunityRegistry>) -> PersonModel {
    let doc = Document::new(
      "P1",
      json!({
        "personExternalId": "P1",
        "stateCode": "US_XX",
        "personName": { "surname": "Person" },
        "officerId": "O1",
      }),
    );
    PersonModel::new(
      PersonRecord::decode(PersonKind::Client, &doc).unwrap(),
      registry,
    )
  }

  #[test]
  fn eligible_types_follow_registration_order() {
    let mut registry = OpportunityRegistry::new();
    for ty in ["X", "Y", "Z"] {
      registry.register_opportunity_type(
        "US_XX",
        ty,
        OpportunityConfig::new(ty, PersonKind::Client, always),
      );
    }
    let registry = Arc::new(registry);
    let person = person(Arc::clone(&registry));

    let types: Vec<_> = registry
      .eligible_types_for(&person)
      .map(OpportunityType::as_str)
      .collect();
    assert_eq!(types, ["X", "Y", "Z"]);
  }

  #[test]
  fn reregistering_overwrites_in_place() {
    let mut registry = OpportunityRegistry::new();
    for ty in ["X", "Y", "Z"] {
      registry.register_opportunity_type(
        "US_XX",
        ty,
        OpportunityConfig::new(ty, PersonKind::Client, always),
      );
    }
    let previous = registry.register_opportunity_type(
      "US_XX",
      "X",
      OpportunityConfig::new("X again", PersonKind::Client, |_: &PersonRecord, _: Option<&Value>| false),
    );
    assert_eq!(previous.map(|c| c.label), Some("X".to_owned()));

    let registry = Arc::new(registry);
    let labels: Vec<_> = registry
      .types_for("US_XX")
      .map(|(_, c)| c.label.as_str())
      .collect();
    assert_eq!(labels, ["X again", "Y", "Z"]);

    let person = person(Arc::clone(&registry));
    let types: Vec<_> = registry
      .eligible_types_for(&person)
      .map(OpportunityType::as_str)
      .collect();
    assert_eq!(types, ["Y", "Z"]);
  }

  #[test]
  fn other_kinds_and_jurisdictions_are_ignored() {
    let mut registry = OpportunityRegistry::new();
    registry.register_opportunity_type(
      "US_XX",
      "custody",
      OpportunityConfig::new("custody", PersonKind::Resident, always),
    );
    registry.register_opportunity_type(
      "US_YY",
      "elsewhere",
      OpportunityConfig::new("elsewhere", PersonKind::Client, always),
    );
    let registry = Arc::new(registry);
    let person = person(Arc::clone(&registry));
    assert_eq!(registry.eligible_types_for(&person).count(), 0);
  }

  #[test]
  fn display_order_is_separate_from_registration_order() {
    let mut registry = OpportunityRegistry::new();
    for (ty, order) in [("X", 2), ("Y", 1), ("Z", 2)] {
      registry.register_opportunity_type(
        "US_XX",
        ty,
        OpportunityConfig::new(ty, PersonKind::Client, always).with_display_order(order),
      );
    }
    let ordered: Vec<_> = registry
      .types_by_display_order("US_XX")
      .into_iter()
      .map(OpportunityType::as_str)
      .collect();
    assert_eq!(ordered, ["Y", "X", "Z"]);
  }

  fn settings(
    jurisdiction: &str,
    opportunity_type: &str,
    label: &str,
    display_order: i32,
  ) -> OpportunitySettings {
    OpportunitySettings {
      jurisdiction: jurisdiction.into(),
      opportunity_type: opportunity_type.into(),
      label: label.into(),
      person_kind: PersonKind::Client,
      referral_collection: None,
      form_generator_ref: None,
      display_order,
      criteria: Vec::new(),
      sort_by: None,
    }
  }

  #[test]
  fn from_config_keeps_slots_and_settings() {
    let mut config = DocketConfig::new("US_XX");
    config.opportunities = vec![
      settings("US_XX", "A", "A", 2),
      OpportunitySettings {
        form_generator_ref: Some("b-form".into()),
        criteria: vec![Criterion::FieldPresent {
          field: "officerId".into(),
        }],
        ..settings("US_XX", "B", "B", 1)
      },
      settings("US_YY", "C", "C", 0),
      OpportunitySettings {
        referral_collection: Some("aReferrals".into()),
        sort_by: Some("eligibleDate".into()),
        ..settings("US_XX", "A", "A again", 3)
      },
    ];
    let registry = Arc::new(OpportunityRegistry::from_config(&config));

    let labels: Vec<_> = registry
      .types_for("US_XX")
      .map(|(_, c)| c.label.as_str())
      .collect();
    assert_eq!(labels, ["A again", "B"]);
    let ordered: Vec<_> = registry
      .types_by_display_order("US_XX")
      .into_iter()
      .map(OpportunityType::as_str)
      .collect();
    assert_eq!(ordered, ["B", "A"]);
    assert_eq!(registry.types_for("US_YY").count(), 1);

    let a = registry.config("US_XX", &OpportunityType::new("A")).unwrap();
    assert_eq!(a.referral_collection.as_deref(), Some("aReferrals"));
    assert!(a.sort.is_some());
    let b = registry.config("US_XX", &OpportunityType::new("B")).unwrap();
    assert_eq!(b.form_generator_ref.as_deref(), Some("b-form"));
    assert!(b.sort.is_none());

    // `A` waits on its referral; `B`'s criterion holds.
    let person = person(Arc::clone(&registry));
    let types: Vec<_> = registry
      .eligible_types_for(&person)
      .map(OpportunityType::as_str)
      .collect();
    assert_eq!(types, ["B"]);
  }

  #[test]
  fn referral_field_sort_puts_missing_last() {
    let opportunity = |id: &str, referral: Option<Value>| Opportunity {
      person_id: id.into(),
      opportunity_type: OpportunityType::new("A"),
      label: "A".into(),
      form_generator_ref: None,
      eligibility: Eligibility::eligible(),
      status: crate::opportunity::OpportunityStatus::Eligible,
      staff_denial: Vec::new(),
      referral,
    };
    let mut opportunities = vec![
      opportunity("P1", None),
      opportunity("P2", Some(json!({ "eligibleDate": "2024-03-01" }))),
      opportunity("P3", Some(json!({ "eligibleDate": "2023-11-15" }))),
    ];
    let sort = by_referral_field("eligibleDate");
    opportunities.sort_by(|a, b| sort(a, b));
    let ids: Vec<_> = opportunities.iter().map(|o| o.person_id.as_str()).collect();
    assert_eq!(ids, ["P3", "P2", "P1"]);
  }
}
