//! Opportunities: jurisdiction-specific eligibility determinations.
//!
//! An [`Opportunity`] is derived, never stored. It is a pure function of the
//! owning person's record, the opportunity's referral record and the
//! registered configuration.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  person::PersonRecord,
  source::{lookup_field, scalar_text},
};

// ─── Identity ────────────────────────────────────────────────────────────────

/// Opportunity type key, e.g. `earlyTermination`.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OpportunityType(String);

impl OpportunityType {
  pub fn new(key: impl Into<String>) -> Self { Self(key.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for OpportunityType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for OpportunityType {
  fn from(key: &str) -> Self { Self::new(key) }
}

impl From<String> for OpportunityType {
  fn from(key: String) -> Self { Self(key) }
}

// ─── Eligibility ─────────────────────────────────────────────────────────────

/// The outcome of evaluating an eligibility predicate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Eligibility {
  pub eligible:       bool,
  /// One entry per unmet criterion; empty when eligible.
  pub denial_reasons: Vec<String>,
}

impl Eligibility {
  pub fn eligible() -> Self {
    Self {
      eligible:       true,
      denial_reasons: Vec::new(),
    }
  }

  pub fn from_reasons(denial_reasons: Vec<String>) -> Self {
    Self {
      eligible: denial_reasons.is_empty(),
      denial_reasons,
    }
  }
}

/// Where an opportunity sits in the caseworker's workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
  Eligible,
  /// Criteria met, but the referral flags remaining requirements.
  AlmostEligible,
  /// Criteria met, but staff recorded a denial on the referral.
  Denied,
  Ineligible,
}

// ─── Declarative criteria ────────────────────────────────────────────────────

/// A single eligibility requirement, loadable from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criterion {
  SupervisionLevelIn { levels: Vec<String> },
  CustodyLevelIn { levels: Vec<String> },
  /// The upstream pipeline listed this type in `allEligibleOpportunities`.
  MarkedEligible,
  /// A referral document exists for the person.
  ReferralPresent,
  FieldEquals { field: String, value: String },
  FieldPresent { field: String },
}

impl Criterion {
  /// `Err` carries the human-readable reason the criterion is unmet.
  pub fn check(
    &self,
    opportunity_type: &OpportunityType,
    person: &PersonRecord,
    referral: Option<&Value>,
  ) -> Result<(), String> {
    match self {
      Self::SupervisionLevelIn { levels } => {
        level_in("supervision level", person.supervision_level(), levels)
      }
      Self::CustodyLevelIn { levels } => {
        level_in("custody level", person.custody_level(), levels)
      }
      Self::MarkedEligible => {
        if person
          .all_eligible_opportunities()
          .iter()
          .any(|t| t == opportunity_type.as_str())
        {
          Ok(())
        } else {
          Err(format!("not marked eligible for {opportunity_type}"))
        }
      }
      Self::ReferralPresent => match referral {
        Some(_) => Ok(()),
        None => Err("no referral record".to_owned()),
      },
      Self::FieldEquals { field, value } => match person.field(field) {
        Some(actual) if actual == *value => Ok(()),
        Some(actual) => Err(format!("{field} is {actual}, expected {value}")),
        None => Err(format!("{field} is missing")),
      },
      Self::FieldPresent { field } => match person.field(field) {
        Some(_) => Ok(()),
        None => Err(format!("{field} is missing")),
      },
    }
  }
}

fn level_in(
  label: &str,
  level: Option<&str>,
  allowed: &[String],
) -> Result<(), String> {
  match level {
    Some(level) if allowed.iter().any(|a| a == level) => Ok(()),
    Some(level) => Err(format!("{label} {level} not in [{}]", allowed.join(", "))),
    None => Err(format!("{label} unknown")),
  }
}

// ─── Opportunity ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
  /// The owning person; lookup only.
  pub person_id:          String,
  pub opportunity_type:   OpportunityType,
  pub label:              String,
  pub form_generator_ref: Option<String>,
  pub eligibility:        Eligibility,
  pub status:             OpportunityStatus,
  /// Denial reasons staff recorded on the referral, if any.
  pub staff_denial:       Vec<String>,
  pub referral:           Option<Value>,
}

impl Opportunity {
  pub fn is_eligible(&self) -> bool { self.eligibility.eligible }
}

/// Staff denial reasons recorded under `denial.reasons` on a referral.
pub fn staff_denial(referral: Option<&Value>) -> Vec<String> {
  referral
    .and_then(|r| lookup_field(r, "denial.reasons"))
    .and_then(Value::as_array)
    .map(|reasons| {
      reasons
        .iter()
        .filter_map(scalar_text)
        .map(|r| r.into_owned())
        .collect()
    })
    .unwrap_or_default()
}

/// Combine the criteria result with what the referral says.
pub fn status_for(
  eligibility: &Eligibility,
  staff_denial: &[String],
  referral: Option<&Value>,
) -> OpportunityStatus {
  if !eligibility.eligible {
    return OpportunityStatus::Ineligible;
  }
  if !staff_denial.is_empty() {
    return OpportunityStatus::Denied;
  }
  let almost = referral
    .and_then(|r| lookup_field(r, "isAlmostEligible"))
    .and_then(Value::as_bool)
    .unwrap_or(false);
  if almost {
    OpportunityStatus::AlmostEligible
  } else {
    OpportunityStatus::Eligible
  }
}
