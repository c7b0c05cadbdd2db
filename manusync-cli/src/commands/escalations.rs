//! `manusync escalations`: conflicts awaiting an editorial decision.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use manusync_core::Escalation;

/// Arguments for `manusync escalations`.
#[derive(Args, Debug)]
pub struct EscalationsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct EscalationRow {
    #[tabled(rename = "#")]
    seq: u64,
    #[tabled(rename = "record")]
    record: String,
    #[tabled(rename = "field")]
    field: String,
    #[tabled(rename = "canonical")]
    canonical: String,
    #[tabled(rename = "shadow")]
    shadow: String,
    #[tabled(rename = "last agreed")]
    baseline: String,
    #[tabled(rename = "confidence")]
    confidence: String,
}

impl From<&Escalation> for EscalationRow {
    fn from(escalation: &Escalation) -> Self {
        Self {
            seq: escalation.seq,
            record: escalation.record_id.to_string(),
            field: escalation.field.clone(),
            canonical: render(escalation.canonical.as_ref()),
            shadow: render(escalation.shadow.as_ref()),
            baseline: render(escalation.baseline.as_ref()),
            confidence: format!("{:.2}", escalation.confidence),
        }
    }
}

impl EscalationsArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let open = super::open(&home)?.escalations().open();

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&open).context("failed to serialize escalations")?
            );
            return Ok(());
        }

        if open.is_empty() {
            println!("No open escalations.");
            return Ok(());
        }
        let rows: Vec<EscalationRow> = open.iter().map(EscalationRow::from).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!("Run 'manusync resolve <record> <field> <value>' to decide.");
        Ok(())
    }
}

fn render(value: Option<&Value>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "(absent)".to_string(),
    }
}
