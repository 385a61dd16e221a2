use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use mobilizer_core::{LocationId, LocationLevel};
use mobilizer_ingest::{load_canonical_locations, ExternalColumns};
use mobilizer_reconcile::{normalize_name, LocationIndex, LocationReconciler, ReconcileConfig};

#[derive(Debug, Parser)]
#[command(name = "mobilizer")]
#[command(about = "Reconcile free-text Nigerian location names onto canonical records")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve one name against a candidate file and print the match as JSON.
    Resolve {
        /// Canonical candidates (.csv or .json with id,name,parent_id).
        #[arg(long)]
        candidates: PathBuf,
        /// Only consider candidates under this parent id. Required unless every
        /// candidate shares one parent.
        #[arg(long)]
        parent: Option<String>,
        /// Level of the candidate records.
        #[arg(long, default_value = "lga")]
        level: LocationLevel,
        name: String,
    },
    /// Reconcile an external dataset against states and LGAs and write reports.
    Reconcile {
        #[arg(long)]
        parents: PathBuf,
        #[arg(long)]
        children: PathBuf,
        #[arg(long)]
        records: PathBuf,
        #[arg(long, default_value = "name")]
        name_column: String,
        #[arg(long, default_value = "parent")]
        parent_column: String,
    },
    /// Print the comparison key for a name.
    Normalize { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };
    tracing::debug!(?command, "mobilizer v{}", env!("CARGO_PKG_VERSION"));

    match command {
        Commands::Resolve {
            candidates,
            parent,
            level,
            name,
        } => {
            let config = ReconcileConfig::from_env().context("reading MOBILIZER_* configuration")?;
            // States are the parent level of a batch run and use its table.
            let overrides = match level {
                LocationLevel::State => config.load_parent_overrides()?,
                _ => config.load_overrides()?,
            };
            let reconciler = LocationReconciler::new(overrides, config.policy)?;
            let path = config.resolve_path(&candidates);
            let index = LocationIndex::new(load_canonical_locations(&path, level)?);
            let scope = match parent {
                Some(parent) => index.candidates_for(&LocationId::new(parent)),
                None => index.sole_scope().with_context(|| {
                    format!(
                        "{} spans {} parent scopes; pass --parent to pick one",
                        path.display(),
                        index.scope_count()
                    )
                })?,
            };
            let result = reconciler.resolve(&name, scope);
            let json = serde_json::to_string_pretty(&result).context("serializing match result")?;
            println!("{json}");
        }
        Commands::Reconcile {
            parents,
            children,
            records,
            name_column,
            parent_column,
        } => {
            let columns = ExternalColumns {
                name: name_column,
                parent: parent_column,
            };
            let summary =
                mobilizer_reconcile::run_reconcile_from_env(&parents, &children, &records, &columns)
                    .await?;
            println!(
                "reconcile complete: run_id={} records={} review_queue={} parent_unmatched={} reports={}",
                summary.run_id,
                summary.total,
                summary.review_queue,
                summary.parent_unmatched,
                summary.reports_dir
            );
            for (reason, count) in &summary.by_reason {
                println!("  {reason}: {count}");
            }
        }
        Commands::Normalize { name } => {
            println!("{}", normalize_name(&name));
        }
    }

    Ok(())
}
