//! Entity models decoded from raw documents.
//!
//! Records are validated on decode; a malformed document fails with a
//! [`ValidationError`] naming the offending field path. A [`PersonModel`]
//! wraps a validated record together with its referral records and memoizes
//! the derived opportunity list until the next mutation.

use std::{cell::OnceCell, collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
  error::ValidationError,
  opportunity::{Opportunity, OpportunityStatus, OpportunityType},
  registry::OpportunityRegistry,
  source::{Document, lookup_field, scalar_text},
  subscription::HydrationState,
};

// ─── Kinds ───────────────────────────────────────────────────────────────────

/// Which justice system a person is tracked in.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum PersonKind {
  /// Under community supervision.
  Client,
  /// Incarcerated.
  Resident,
}

// ─── Field access ────────────────────────────────────────────────────────────

/// Typed accessors over a JSON object that report failures by dotted path.
struct Fields<'a> {
  map:    &'a Map<String, Value>,
  prefix: String,
}

impl<'a> Fields<'a> {
  fn root(document: &'a Document) -> Result<Self, ValidationError> {
    match &document.data {
      Value::Object(map) => Ok(Self {
        map,
        prefix: String::new(),
      }),
      _ => Err(ValidationError::new("$", "document is not an object")),
    }
  }

  fn path(&self, name: &str) -> String {
    if self.prefix.is_empty() {
      name.to_owned()
    } else {
      format!("{}.{name}", self.prefix)
    }
  }

  fn required_str(&self, name: &str) -> Result<String, ValidationError> {
    self
      .optional_str(name)?
      .ok_or_else(|| ValidationError::new(self.path(name), "required field is missing"))
  }

  fn optional_str(&self, name: &str) -> Result<Option<String>, ValidationError> {
    match self.map.get(name) {
      None | Some(Value::Null) => Ok(None),
      Some(Value::String(s)) => Ok(Some(s.clone())),
      Some(_) => Err(ValidationError::new(self.path(name), "expected a string")),
    }
  }

  fn optional_bool(&self, name: &str) -> Result<Option<bool>, ValidationError> {
    match self.map.get(name) {
      None | Some(Value::Null) => Ok(None),
      Some(Value::Bool(b)) => Ok(Some(*b)),
      Some(_) => Err(ValidationError::new(self.path(name), "expected a boolean")),
    }
  }

  fn string_list(&self, name: &str) -> Result<Vec<String>, ValidationError> {
    match self.map.get(name) {
      None | Some(Value::Null) => Ok(Vec::new()),
      Some(Value::Array(items)) => items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
          Value::String(s) => Ok(s.clone()),
          _ => Err(ValidationError::new(
            format!("{}[{i}]", self.path(name)),
            "expected a string",
          )),
        })
        .collect(),
      Some(_) => Err(ValidationError::new(self.path(name), "expected a list")),
    }
  }

  fn object(&self, name: &str) -> Result<Fields<'a>, ValidationError> {
    match self.map.get(name) {
      Some(Value::Object(map)) => Ok(Fields {
        map,
        prefix: self.path(name),
      }),
      None | Some(Value::Null) => {
        Err(ValidationError::new(self.path(name), "required field is missing"))
      }
      Some(_) => Err(ValidationError::new(self.path(name), "expected an object")),
    }
  }
}

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonName {
  pub given_names: String,
  pub surname:     String,
}

impl PersonName {
  fn decode(fields: &Fields<'_>) -> Result<Self, ValidationError> {
    let name = fields.object("personName")?;
    Ok(Self {
      given_names: name.optional_str("givenNames")?.unwrap_or_default(),
      surname:     name.required_str("surname")?,
    })
  }
}

/// A person on community supervision.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
  pub person_external_id:         String,
  pub state_code:                 String,
  pub display_id:                 Option<String>,
  pub person_name:                PersonName,
  pub officer_id:                 String,
  pub district:                   Option<String>,
  pub supervision_level:          Option<String>,
  pub all_eligible_opportunities: Vec<String>,
  #[serde(skip)]
  raw:                            Value,
}

/// An incarcerated person.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResidentRecord {
  pub person_external_id:         String,
  pub state_code:                 String,
  pub display_id:                 Option<String>,
  pub person_name:                PersonName,
  pub officer_id:                 String,
  pub facility_id:                Option<String>,
  pub custody_level:              Option<String>,
  pub all_eligible_opportunities: Vec<String>,
  #[serde(skip)]
  raw:                            Value,
}

/// A validated person record, discriminated by `personType`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "personType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PersonRecord {
  Client(ClientRecord),
  Resident(ResidentRecord),
}

impl PersonRecord {
  /// Decode and validate `document` as a person of `kind`.
  ///
  /// An explicit `personType` must agree with `kind`, and
  /// `personExternalId` must equal the document ID.
  pub fn decode(kind: PersonKind, document: &Document) -> Result<Self, ValidationError> {
    let fields = Fields::root(document)?;

    if let Some(tag) = fields.optional_str("personType")? {
      let tagged: PersonKind = tag.parse().map_err(|_| {
        ValidationError::new("personType", format!("unknown person type {tag:?}"))
      })?;
      if tagged != kind {
        return Err(ValidationError::new(
          "personType",
          format!("expected {kind}, found {tagged}"),
        ));
      }
    }

    let person_external_id = fields.required_str("personExternalId")?;
    if person_external_id != document.id {
      return Err(ValidationError::new(
        "personExternalId",
        format!("does not match document id {:?}", document.id),
      ));
    }
    let state_code = fields.required_str("stateCode")?;
    let display_id = fields.optional_str("displayId")?;
    let person_name = PersonName::decode(&fields)?;
    let officer_id = fields.required_str("officerId")?;
    let all_eligible_opportunities = fields.string_list("allEligibleOpportunities")?;
    let raw = document.data.clone();

    Ok(match kind {
      PersonKind::Client => Self::Client(ClientRecord {
        person_external_id,
        state_code,
        display_id,
        person_name,
        officer_id,
        district: fields.optional_str("district")?,
        supervision_level: fields.optional_str("supervisionLevel")?,
        all_eligible_opportunities,
        raw,
      }),
      PersonKind::Resident => Self::Resident(ResidentRecord {
        person_external_id,
        state_code,
        display_id,
        person_name,
        officer_id,
        facility_id: fields.optional_str("facilityId")?,
        custody_level: fields.optional_str("custodyLevel")?,
        all_eligible_opportunities,
        raw,
      }),
    })
  }

  pub fn kind(&self) -> PersonKind {
    match self {
      Self::Client(_) => PersonKind::Client,
      Self::Resident(_) => PersonKind::Resident,
    }
  }

  pub fn id(&self) -> &str {
    match self {
      Self::Client(r) => &r.person_external_id,
      Self::Resident(r) => &r.person_external_id,
    }
  }

  pub fn state_code(&self) -> &str {
    match self {
      Self::Client(r) => &r.state_code,
      Self::Resident(r) => &r.state_code,
    }
  }

  pub fn name(&self) -> &PersonName {
    match self {
      Self::Client(r) => &r.person_name,
      Self::Resident(r) => &r.person_name,
    }
  }

  /// The assigned staff member's ID.
  pub fn officer_id(&self) -> &str {
    match self {
      Self::Client(r) => &r.officer_id,
      Self::Resident(r) => &r.officer_id,
    }
  }

  /// District for clients, facility for residents.
  pub fn location_id(&self) -> Option<&str> {
    match self {
      Self::Client(r) => r.district.as_deref(),
      Self::Resident(r) => r.facility_id.as_deref(),
    }
  }

  pub fn supervision_level(&self) -> Option<&str> {
    match self {
      Self::Client(r) => r.supervision_level.as_deref(),
      Self::Resident(_) => None,
    }
  }

  pub fn custody_level(&self) -> Option<&str> {
    match self {
      Self::Client(_) => None,
      Self::Resident(r) => r.custody_level.as_deref(),
    }
  }

  pub fn all_eligible_opportunities(&self) -> &[String] {
    match self {
      Self::Client(r) => &r.all_eligible_opportunities,
      Self::Resident(r) => &r.all_eligible_opportunities,
    }
  }

  /// Text value of any scalar field of the underlying document, by dotted
  /// path.
  pub fn field(&self, path: &str) -> Option<String> {
    let raw = match self {
      Self::Client(r) => &r.raw,
      Self::Resident(r) => &r.raw,
    };
    lookup_field(raw, path)
      .and_then(scalar_text)
      .map(|text| text.into_owned())
  }
}

/// A staff member (officer) record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffRecord {
  pub id:                    String,
  pub state_code:            String,
  pub given_names:           String,
  pub surname:               String,
  pub email:                 Option<String>,
  pub district:              Option<String>,
  /// Supervises a caseload of clients.
  pub has_caseload:          bool,
  /// Responsible for residents of a facility.
  pub has_facility_caseload: bool,
}

impl StaffRecord {
  pub fn decode(document: &Document) -> Result<Self, ValidationError> {
    let fields = Fields::root(document)?;
    Ok(Self {
      id:                    document.id.clone(),
      state_code:            fields.required_str("stateCode")?,
      given_names:           fields.optional_str("givenNames")?.unwrap_or_default(),
      surname:               fields.required_str("surname")?,
      email:                 fields.optional_str("email")?,
      district:              fields.optional_str("district")?,
      has_caseload:          fields.optional_bool("hasCaseload")?.unwrap_or(false),
      has_facility_caseload: fields
        .optional_bool("hasFacilityCaseload")?
        .unwrap_or(false),
    })
  }

  /// Whether this officer carries a caseload of `kind`.
  pub fn has_caseload_of(&self, kind: PersonKind) -> bool {
    match kind {
      PersonKind::Client => self.has_caseload,
      PersonKind::Resident => self.has_facility_caseload,
    }
  }

  pub fn full_name(&self) -> String {
    format!("{} {}", self.given_names, self.surname)
      .trim()
      .to_owned()
  }
}

/// A searchable location: a district office or a facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
  pub id:          String,
  pub state_code:  String,
  pub name:        String,
  /// The kind of person housed or supervised here.
  pub person_kind: PersonKind,
}

impl LocationRecord {
  pub fn decode(document: &Document) -> Result<Self, ValidationError> {
    let fields = Fields::root(document)?;
    let system = fields.required_str("system")?;
    let person_kind = match system.as_str() {
      "SUPERVISION" => PersonKind::Client,
      "INCARCERATION" => PersonKind::Resident,
      _ => {
        return Err(ValidationError::new(
          "system",
          format!("unknown system {system:?}"),
        ));
      }
    };
    Ok(Self {
      id: document.id.clone(),
      state_code: fields.required_str("stateCode")?,
      name: fields.required_str("name")?,
      person_kind,
    })
  }
}

// ─── Person model ────────────────────────────────────────────────────────────

/// The current referral record for one opportunity type, mirrored from its
/// subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferralSlot {
  pub state:  HydrationState,
  pub record: Option<Value>,
}

/// A watched person with derived opportunity state.
///
/// Mutations invalidate the memoized opportunity list; it is recomputed on
/// the next read.
#[derive(Debug)]
pub struct PersonModel {
  record:         PersonRecord,
  registry:       Arc<OpportunityRegistry>,
  referrals:      BTreeMap<OpportunityType, ReferralSlot>,
  assigned_staff: Option<StaffRecord>,
  stale:          bool,
  updated_at:     DateTime<Utc>,
  opportunities:  OnceCell<Vec<Opportunity>>,
}

impl PersonModel {
  pub fn new(record: PersonRecord, registry: Arc<OpportunityRegistry>) -> Self {
    Self {
      record,
      registry,
      referrals: BTreeMap::new(),
      assigned_staff: None,
      stale: false,
      updated_at: Utc::now(),
      opportunities: OnceCell::new(),
    }
  }

  pub fn id(&self) -> &str { self.record.id() }

  pub fn kind(&self) -> PersonKind { self.record.kind() }

  pub fn record(&self) -> &PersonRecord { &self.record }

  pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

  /// `true` once the person has left the watched set. Stale persons keep
  /// their last-known state but no longer receive updates.
  pub fn is_stale(&self) -> bool { self.stale }

  pub fn assigned_staff(&self) -> Option<&StaffRecord> { self.assigned_staff.as_ref() }

  pub fn display_name(&self) -> String {
    let name = self.record.name();
    format!("{} {}", name.given_names, name.surname)
      .trim()
      .to_owned()
  }

  pub fn update_record(&mut self, record: PersonRecord) {
    self.record = record;
    self.touch();
  }

  pub fn set_referral(
    &mut self,
    opportunity_type: OpportunityType,
    state: HydrationState,
    record: Option<Value>,
  ) {
    let slot = ReferralSlot { state, record };
    if self.referrals.get(&opportunity_type) == Some(&slot) {
      return;
    }
    self.referrals.insert(opportunity_type, slot);
    self.touch();
  }

  pub fn set_assigned_staff(&mut self, staff: Option<StaffRecord>) {
    self.assigned_staff = staff;
  }

  pub fn set_stale(&mut self, stale: bool) { self.stale = stale; }

  fn touch(&mut self) {
    self.updated_at = Utc::now();
    self.opportunities = OnceCell::new();
  }

  pub fn referral(&self, opportunity_type: &OpportunityType) -> Option<&Value> {
    self
      .referrals
      .get(opportunity_type)
      .and_then(|slot| slot.record.as_ref())
  }

  /// Hydration state of the opportunity's referral. Types without a
  /// referral collection are always hydrated.
  pub fn opportunity_hydration(&self, opportunity_type: &OpportunityType) -> HydrationState {
    if let Some(slot) = self.referrals.get(opportunity_type) {
      return slot.state.clone();
    }
    match self.registry.config(self.record.state_code(), opportunity_type) {
      Some(config) if config.referral_collection.is_none() => HydrationState::Hydrated,
      _ => HydrationState::NeedsHydration,
    }
  }

  /// Whether every applicable opportunity's referral has finished loading.
  pub fn all_opportunities_loaded(&self) -> bool {
    self
      .registry
      .types_for(self.record.state_code())
      .filter(|(_, config)| config.person_kind == self.kind())
      .all(|(ty, _)| self.opportunity_hydration(ty).is_finished())
  }

  /// Every evaluated opportunity, in registration order. Types whose
  /// referral has not hydrated yet are omitted.
  pub fn opportunities(&self) -> &[Opportunity] {
    self
      .opportunities
      .get_or_init(|| self.registry.evaluate(self).collect())
  }

  /// The opportunity of `opportunity_type` if its criteria are met.
  pub fn opportunity_for_type(
    &self,
    opportunity_type: &OpportunityType,
  ) -> Option<&Opportunity> {
    self
      .opportunities()
      .iter()
      .find(|o| o.opportunity_type == *opportunity_type && o.is_eligible())
  }

  pub fn opportunities_with_status(
    &self,
    status: OpportunityStatus,
  ) -> impl Iterator<Item = &Opportunity> {
    self.opportunities().iter().filter(move |o| o.status == status)
  }

  pub fn eligible_opportunities(&self) -> impl Iterator<Item = &Opportunity> {
    self.opportunities_with_status(OpportunityStatus::Eligible)
  }

  pub fn almost_eligible_opportunities(&self) -> impl Iterator<Item = &Opportunity> {
    self.opportunities_with_status(OpportunityStatus::AlmostEligible)
  }

  pub fn denied_opportunities(&self) -> impl Iterator<Item = &Opportunity> {
    self.opportunities_with_status(OpportunityStatus::Denied)
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::{
    opportunity::Criterion,
    registry::{Criteria, OpportunityConfig},
  };

  fn client_doc(id: &str, level: &str) -> Document {
    Document::new(
      id,
      json!({
        "personExternalId": id,
        "personType": "CLIENT",
        "stateCode": "US_XX",
        "personName": { "givenNames": "Real", "surname": "Person" },
        "officerId": "O1",
        "supervisionLevel": level,
      }),
    )
  }

  fn registry() -> Arc<OpportunityRegistry> {
    let mut registry = OpportunityRegistry::new();
    registry.register_opportunity_type(
      "US_XX",
      "downgrade",
      OpportunityConfig::new(
        "Supervision level downgrade",
        PersonKind::Client,
        Criteria(vec![Criterion::SupervisionLevelIn {
          levels: vec!["HIGH".into()],
        }]),
      ),
    );
    registry.register_opportunity_type(
      "US_XX",
      "earlyTermination",
      OpportunityConfig::new(
        "Early termination",
        PersonKind::Client,
        Criteria(vec![Criterion::ReferralPresent]),
      )
      .with_referral_collection("earlyTerminationReferrals"),
    );
    Arc::new(registry)
  }

  #[test]
  fn decode_valid_client() {
    let record = PersonRecord::decode(PersonKind::Client, &client_doc("P1", "HIGH")).unwrap();
    assert_eq!(record.kind(), PersonKind::Client);
    assert_eq!(record.id(), "P1");
    assert_eq!(record.officer_id(), "O1");
    assert_eq!(record.supervision_level(), Some("HIGH"));
    assert_eq!(record.field("personName.givenNames").as_deref(), Some("Real"));
  }

  #[test]
  fn decode_reports_nested_field_path() {
    let mut doc = client_doc("P1", "HIGH");
    doc.data["personName"]["surname"] = json!(42);
    let err = PersonRecord::decode(PersonKind::Client, &doc).unwrap_err();
    assert_eq!(err.path, "personName.surname");
  }

  #[test]
  fn decode_rejects_mismatched_tag_and_id() {
    let doc = client_doc("P1", "HIGH");
    let err = PersonRecord::decode(PersonKind::Resident, &doc).unwrap_err();
    assert_eq!(err.path, "personType");

    let mut doc = client_doc("P1", "HIGH");
    doc.id = "P2".into();
    let err = PersonRecord::decode(PersonKind::Client, &doc).unwrap_err();
    assert_eq!(err.path, "personExternalId");
  }

  #[test]
  fn decode_reports_list_item_path() {
    let mut doc = client_doc("P1", "HIGH");
    doc.data["allEligibleOpportunities"] = json!(["LSU", 3]);
    let err = PersonRecord::decode(PersonKind::Client, &doc).unwrap_err();
    assert_eq!(err.path, "allEligibleOpportunities[1]");
  }

  #[test]
  fn decode_staff() {
    let doc = Document::new(
      "O1",
      json!({ "stateCode": "US_XX", "givenNames": "Ofelia", "surname": "Officer" }),
    );
    let staff = StaffRecord::decode(&doc).unwrap();
    assert_eq!(staff.full_name(), "Ofelia Officer");
    assert!(!staff.has_caseload_of(PersonKind::Client));
    assert!(StaffRecord::decode(&Document::new("O2", json!([]))).is_err());

    let doc = Document::new(
      "O3",
      json!({ "stateCode": "US_XX", "surname": "Warden", "hasFacilityCaseload": true }),
    );
    let staff = StaffRecord::decode(&doc).unwrap();
    assert!(staff.has_caseload_of(PersonKind::Resident));
    let doc = Document::new("O4", json!({ "stateCode": "US_XX", "surname": "X", "hasCaseload": "yes" }));
    assert_eq!(StaffRecord::decode(&doc).unwrap_err().path, "hasCaseload");
  }

  #[test]
  fn decode_location() {
    let doc = Document::new(
      "FAC1",
      json!({ "stateCode": "US_XX", "system": "INCARCERATION", "name": "Facility 1" }),
    );
    let location = LocationRecord::decode(&doc).unwrap();
    assert_eq!(location.person_kind, PersonKind::Resident);
    assert_eq!(location.name, "Facility 1");

    let doc = Document::new("X", json!({ "stateCode": "US_XX", "system": "PAROLE", "name": "X" }));
    assert_eq!(LocationRecord::decode(&doc).unwrap_err().path, "system");
  }

  #[test]
  fn opportunities_recompute_after_mutation() {
    let registry = registry();
    let record = PersonRecord::decode(PersonKind::Client, &client_doc("P1", "LOW")).unwrap();
    let mut person = PersonModel::new(record, registry);
    let downgrade = OpportunityType::new("downgrade");
    let early = OpportunityType::new("earlyTermination");

    // The referral has not hydrated, so only `downgrade` is evaluated.
    assert_eq!(person.opportunities().len(), 1);
    assert!(person.opportunity_for_type(&downgrade).is_none());
    assert!(!person.all_opportunities_loaded());

    let record = PersonRecord::decode(PersonKind::Client, &client_doc("P1", "HIGH")).unwrap();
    person.update_record(record);
    assert!(person.opportunity_for_type(&downgrade).is_some());

    person.set_referral(early.clone(), HydrationState::Hydrated, Some(json!({})));
    assert!(person.all_opportunities_loaded());
    let types: Vec<_> = person
      .opportunities()
      .iter()
      .map(|o| o.opportunity_type.as_str())
      .collect();
    assert_eq!(types, ["downgrade", "earlyTermination"]);
    assert!(person.opportunity_for_type(&early).is_some());
  }

  #[test]
  fn denied_referral_moves_opportunity_to_denied() {
    let registry = registry();
    let record = PersonRecord::decode(PersonKind::Client, &client_doc("P1", "LOW")).unwrap();
    let mut person = PersonModel::new(record, registry);
    let early = OpportunityType::new("earlyTermination");

    person.set_referral(
      early.clone(),
      HydrationState::Hydrated,
      Some(json!({ "denial": { "reasons": ["FINES"] } })),
    );
    assert_eq!(person.eligible_opportunities().count(), 0);
    let denied: Vec<_> = person.denied_opportunities().collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].staff_denial, vec!["FINES".to_owned()]);
    // Criteria are still met.
    assert!(person.opportunity_for_type(&early).is_some());
  }
}
