//! docket binary.
//!
//! Reads `docket.toml` (or the path given with `--config`), loads fixture
//! documents into an in-memory store, runs one caseload selection against it
//! and prints the resulting read model.
//!
//! ```
//! cargo run -p docket-cli -- --config crates/docket-cli/demo/docket.toml \
//!   --fixtures crates/docket-cli/demo/fixtures.json --ids O1,O2
//! ```

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use docket_core::{
  config::DocketConfig,
  opportunity::{Opportunity, OpportunityStatus},
  person::{PersonKind, PersonModel, PersonRecord},
  registry::OpportunityRegistry,
  search::{SearchCriteria, SearchType, Searchable, SystemId},
  workflows::{CaseloadView, PersonFailure, QueryFailure, WorkflowsStore},
};
use docket_store_memory::MemorySource;
use serde::Serialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Docket caseload inspector")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "docket.toml")]
  config: PathBuf,

  /// JSON fixture file: `{ collection: { docId: document } }`.
  #[arg(short, long)]
  fixtures: Option<PathBuf>,

  /// What the selected IDs refer to.
  #[arg(short = 't', long, default_value = "OFFICER")]
  search_type: SearchType,

  /// Comma-separated search IDs, e.g. officer IDs.
  #[arg(short, long, value_delimiter = ',')]
  ids: Vec<String>,

  /// Limit the search to one system.
  #[arg(short, long, default_value = "ALL")]
  system: SystemId,

  /// Watch a person regardless of the search selection. Repeatable.
  #[arg(short, long)]
  pin: Vec<String>,

  /// Kind of the pinned persons.
  #[arg(long, default_value = "CLIENT")]
  pin_kind: PersonKind,

  /// Also list the officers and locations selectable for the search type.
  #[arg(long)]
  searchables: bool,

  /// Print the read model as JSON.
  #[arg(long)]
  json: bool,
}

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct Report<'a> {
  jurisdiction:   &'a str,
  persons:        Vec<PersonReport<'a>>,
  failed:         Vec<PersonFailure>,
  pending:        Vec<String>,
  failed_queries: Vec<QueryFailure>,
  truncated:      usize,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  searchables:    Vec<Searchable>,
}

#[derive(Serialize)]
struct PersonReport<'a> {
  id:            &'a str,
  name:          String,
  officer:       Option<String>,
  record:        &'a PersonRecord,
  opportunities: &'a [Opportunity],
}

impl<'a> PersonReport<'a> {
  fn new(person: &'a PersonModel) -> Self {
    Self {
      id:            person.id(),
      name:          person.display_name(),
      officer:       person.assigned_staff().map(|s| s.full_name()),
      record:        person.record(),
      opportunities: person.opportunities(),
    }
  }
}

impl<'a> Report<'a> {
  fn new(
    jurisdiction: &'a str,
    view: CaseloadView<'a>,
    searchables: Vec<Searchable>,
  ) -> Self {
    Self {
      jurisdiction,
      searchables,
      persons: view.persons.into_iter().map(PersonReport::new).collect(),
      failed: view.failed,
      pending: view.pending,
      failed_queries: view.failed_queries,
      truncated: view.truncated,
    }
  }

  fn print(&self) {
    println!(
      "{}: {} persons, {} failed, {} pending",
      self.jurisdiction,
      self.persons.len(),
      self.failed.len(),
      self.pending.len()
    );
    for person in &self.persons {
      let officer = person.officer.as_deref().unwrap_or("unassigned");
      println!("  {} ({})  officer: {officer}", person.name, person.id);
      for opportunity in person.opportunities {
        let mark = match opportunity.status {
          OpportunityStatus::Eligible => "+",
          OpportunityStatus::AlmostEligible => "~",
          OpportunityStatus::Denied => "x",
          OpportunityStatus::Ineligible => "-",
        };
        println!(
          "    {mark} {} ({})",
          opportunity.label, opportunity.opportunity_type
        );
        for reason in opportunity
          .eligibility
          .denial_reasons
          .iter()
          .chain(&opportunity.staff_denial)
        {
          println!("        {reason}");
        }
      }
    }
    for failure in &self.failed {
      println!("  ! {} {}: {}", failure.kind, failure.person_id, failure.reason);
    }
    for failure in &self.failed_queries {
      println!("  ! query {}: {}", failure.query, failure.error);
    }
    for id in &self.pending {
      println!("  … {id} still loading");
    }
    if self.truncated > 0 {
      println!("  ({} more search results not watched)", self.truncated);
    }
    if !self.searchables.is_empty() {
      println!("searchable:");
      for searchable in &self.searchables {
        println!(
          "  {} {} ({})",
          searchable.search_type, searchable.search_label, searchable.search_id
        );
      }
    }
  }
}

// ─── Main ────────────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("DOCKET"))
    .build()
    .context("failed to read config file")?;

  let docket_cfg: DocketConfig = settings
    .try_deserialize()
    .context("failed to deserialise DocketConfig")?;

  let source = match &cli.fixtures {
    Some(path) => MemorySource::load_fixture_file(path)
      .with_context(|| format!("failed to load fixtures from {path:?}"))?,
    None => MemorySource::new(),
  };

  let registry = Arc::new(OpportunityRegistry::from_config(&docket_cfg));
  let mut store = WorkflowsStore::new(source, docket_cfg, registry)
    .context("invalid configuration")?;

  store.set_active_system(cli.system);
  if !cli.ids.is_empty() {
    store.set_search_criteria(SearchCriteria::new(cli.search_type, cli.ids));
  }
  for id in cli.pin {
    store
      .pin_person(id.clone(), cli.pin_kind)
      .with_context(|| format!("failed to pin {id}"))?;
  }

  if cli.searchables {
    store.open_searchables();
  }

  let applied = store.process_pending();
  tracing::debug!(applied, "deliveries applied");

  let report = Report::new(
    store.jurisdiction(),
    store.caseload(),
    store.available_searchables(),
  );
  if cli.json {
    println!(
      "{}",
      serde_json::to_string_pretty(&report).context("failed to serialise report")?
    );
  } else {
    report.print();
  }

  Ok(())
}
