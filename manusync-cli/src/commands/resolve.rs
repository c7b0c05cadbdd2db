//! `manusync resolve <record_id> <field> <value>`: editorial decision.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use manusync_core::RecordId;
use manusync_daemon::request_resolve;

const EDITOR_ACTOR: &str = "editor";

/// Arguments for `manusync resolve`.
#[derive(Args, Debug)]
pub struct ResolveArgs {
    pub record_id: String,

    pub field: String,

    /// Decided value as JSON (`"accepted"`, `3`, `null`). Text that is not
    /// valid JSON is taken as a string.
    pub value: String,

    /// Emit the resulting sync event as JSON.
    #[arg(long)]
    pub json: bool,

    /// Send the decision to the running daemon instead of applying it
    /// in-process.
    #[arg(long)]
    pub daemon: bool,
}

impl ResolveArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let value = parse_value(&self.value);

        let event = if self.daemon {
            let data = request_resolve(&home, &self.record_id, &self.field, value)
                .with_context(|| format!("daemon rejected decision for '{}'", self.field))?;
            serde_json::from_value(data).context("daemon returned a malformed sync event")?
        } else {
            let orchestrator = super::open(&home)?;
            let record_id = RecordId::from(self.record_id.as_str());
            super::block_on(async {
                orchestrator
                    .resolve_escalation(&record_id, &self.field, value)
                    .await
                    .with_context(|| {
                        format!("cannot resolve '{}' on '{}'", self.field, self.record_id)
                    })?;
                Ok::<_, anyhow::Error>(orchestrator.synchronize_as(&record_id, EDITOR_ACTOR).await)
            })??
        };
        super::sync::report(&event, self.json)
    }
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
