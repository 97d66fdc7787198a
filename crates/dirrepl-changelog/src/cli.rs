use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dirrepl_changelog::{ChangelogConfig, ChangelogDb, SystemClock};
use dirrepl_store::PersistentStoreProvider;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "dirrepl")]
#[command(about = "Directory replication changelog", long_about = None)]
pub struct Cli {
    /// TOML or JSON configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Overrides the changelog directory of the configuration.
    #[arg(long)]
    pub db_dir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Open the changelog and keep purging and indexing until Ctrl-C.
    Serve,
    /// Print domains, the newest cookie and the change number range.
    Status,
    /// Index pending changes, run one purge cycle and exit.
    Purge,
}

impl Cli {
    pub fn load_config(&self) -> Result<ChangelogConfig> {
        let mut config = match &self.config {
            Some(path) => ChangelogConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ChangelogConfig::default(),
        };
        if let Some(dir) = &self.db_dir {
            config.db_dir = dir.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub async fn run(self) -> Result<()> {
        let config = self.load_config()?;
        let changelog = open_changelog(&config)?;
        let result = match self.command.clone().unwrap_or(Command::Serve) {
            Command::Serve => serve(&changelog).await,
            Command::Status => status(&changelog),
            Command::Purge => purge(&changelog),
        };
        changelog.shutdown_db().await?;
        result
    }
}

fn open_changelog(config: &ChangelogConfig) -> Result<Arc<ChangelogDb>> {
    let provider = Arc::new(PersistentStoreProvider::new(&config.db_dir));
    let changelog = Arc::new(ChangelogDb::new(config, provider, Arc::new(SystemClock)));
    changelog
        .initialize_db()
        .with_context(|| format!("opening changelog at {}", config.db_dir.display()))?;
    Ok(changelog)
}

async fn serve(changelog: &ChangelogDb) -> Result<()> {
    info!(
        domains = changelog.domains()?.len(),
        cookie = %changelog.newest_cookie(&[])?,
        oldest_change_number = changelog.oldest_change_number()?,
        newest_change_number = changelog.newest_change_number()?,
        "changelog ready"
    );
    tokio::signal::ctrl_c().await?;
    warn!("interrupted, shutting down");
    Ok(())
}

fn status(changelog: &ChangelogDb) -> Result<()> {
    println!("Domains:");
    for domain_dn in changelog.domains()? {
        println!("  {}  {}", domain_dn, changelog.domain_server_state(&domain_dn)?);
    }
    println!("Newest cookie: {}", changelog.newest_cookie(&[])?);
    println!(
        "Change numbers: {} .. {}",
        changelog.oldest_change_number()?,
        changelog.newest_change_number()?
    );
    Ok(())
}

fn purge(changelog: &ChangelogDb) -> Result<()> {
    let indexed = changelog.index_pending()?;
    let report = changelog.purge_once()?;
    println!("Indexed {} pending changes", indexed);
    println!(
        "Purged {} logs, skipped {}, failed {}",
        report.purged_logs, report.skipped_logs, report.failed_logs
    );
    Ok(())
}
