//! `manusync init --canonical <dir> --shadow <dir>`

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use manusync_core::{config, paths::config_path};

/// Write a default config pointing at the two record directories.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Directory holding the CMS (canonical) record documents.
    #[arg(long, value_name = "DIR")]
    pub canonical: PathBuf,

    /// Directory holding the agent (shadow) record documents.
    #[arg(long, value_name = "DIR")]
    pub shadow: PathBuf,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let canonical = resolve_dir(&self.canonical)?;
        let shadow = resolve_dir(&self.shadow)?;

        let config = config::init_at(&home, canonical, shadow)
            .context("failed to write manusync config")?;

        println!("✓ Initialized manusync");
        println!("  Config:    {}", config_path(&home).display());
        if let Some(dir) = &config.canonical_dir {
            println!("  Canonical: {}", dir.display());
        }
        if let Some(dir) = &config.shadow_dir {
            println!("  Shadow:    {}", dir.display());
        }
        Ok(())
    }
}

fn resolve_dir(path: &Path) -> Result<PathBuf> {
    fs::create_dir_all(path).with_context(|| format!("cannot create '{}'", path.display()))?;
    path.canonicalize()
        .with_context(|| format!("cannot resolve path '{}'", path.display()))
}
