use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pfcat_core::{AllowlistAction, BrandCoverage, MergeOutcome};
use pfcat_merge::allowlist::{load_allowlist_seed, AllowlistAdmin, AllowlistRequest, PromotionPolicy};
use pfcat_merge::report::RunReportWriter;
use pfcat_merge::{MergeConfig, MergeEngine, MergeError, MergeOptions};
use pfcat_storage::{ArtifactStore, CatalogStore, PgStore};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pfcat")]
#[command(about = "Pet food catalog staging and merge pipeline")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "PFCAT_LOG_JSON")]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply embedded database migrations.
    Migrate,
    /// Append extraction bundles to staging.
    Stage {
        #[arg(required = true)]
        bundles: Vec<PathBuf>,
    },
    /// Merge one staging run into the canonical catalog.
    Merge {
        run_id: String,
        #[arg(long)]
        dry_run: bool,
        /// Skip writing report artifacts.
        #[arg(long)]
        no_report: bool,
    },
    /// Show recorded merge invocations for a run.
    Results {
        run_id: String,
        /// Also print the residual rows of this invocation.
        #[arg(long)]
        residuals: Option<u32>,
    },
    #[command(subcommand)]
    Allowlist(AllowlistCommand),
}

#[derive(Debug, Subcommand)]
enum AllowlistCommand {
    List,
    Add(TransitionArgs),
    Promote {
        #[command(flatten)]
        transition: TransitionArgs,
        /// JSON file with the brand's coverage figures.
        #[arg(long)]
        coverage: Option<PathBuf>,
        /// Promote even when coverage is below the policy thresholds.
        #[arg(long)]
        force: bool,
    },
    Pause(TransitionArgs),
    Remove(TransitionArgs),
    Audit {
        brand_slug: Option<String>,
    },
    /// Re-hash the audit chain and compare it with the allowlist table.
    Verify,
    /// Rebuild the allowlist table from the audit log.
    Rebuild,
    /// Apply an allowlist seed file.
    Seed {
        path: PathBuf,
    },
}

#[derive(Debug, Args)]
struct TransitionArgs {
    brand_slug: String,
    #[arg(long, env = "PFCAT_ACTOR")]
    actor: String,
    #[arg(long)]
    reason: String,
}

impl TransitionArgs {
    fn into_request(self, action: AllowlistAction) -> AllowlistRequest {
        AllowlistRequest {
            brand_slug: self.brand_slug,
            action,
            actor: self.actor,
            reason: self.reason,
            coverage: None,
            force: false,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn summarize(outcome: &MergeOutcome) {
    let r = &outcome.result;
    println!(
        "merge {}: run_id={} seq={} staged={} inserted={} updated={} skipped={}",
        if r.dry_run { "dry-run" } else { "complete" },
        r.run_id,
        r.seq,
        r.staged,
        r.inserted,
        r.updated,
        r.skipped_total()
    );
    for (reason, count) in &r.skipped {
        println!("  {reason}: {count}");
    }
}

async fn connect(config: &MergeConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to the catalog database")
}

async fn run_merge(config: &MergeConfig, run_id: &str, dry_run: bool, no_report: bool) -> Result<()> {
    let store = Arc::new(connect(config).await?);
    let engine = MergeEngine::new(store, config);
    let reports = RunReportWriter::new(ArtifactStore::new(&config.reports_dir));

    match engine.merge_with(run_id, MergeOptions { dry_run }).await {
        Ok(outcome) => {
            summarize(&outcome);
            if !no_report && outcome.result.staged > 0 {
                let manifest = reports.write(&outcome, false).await?;
                println!("report: {}/{}", run_id, manifest.invocation);
            }
            Ok(())
        }
        Err(MergeError::RunHealth { outcome }) => {
            summarize(&outcome);
            warn!(
                run_id,
                staged = outcome.result.staged,
                residuals = outcome.residuals.len(),
                "merge rejected by run health check, nothing committed"
            );
            if !no_report {
                let manifest = reports.write(&outcome, true).await?;
                println!("report: {}/{}", run_id, manifest.invocation);
            }
            Err(MergeError::RunHealth { outcome }.into())
        }
        Err(err) => {
            error!(run_id, error = %err, "merge failed");
            Err(err.into())
        }
    }
}

async fn run_allowlist(config: &MergeConfig, command: AllowlistCommand) -> Result<()> {
    let store = connect(config).await?;
    let policy = PromotionPolicy::from_workspace_root(&config.workspace_root)?;
    let admin = AllowlistAdmin::new(&store, policy);

    let request = match command {
        AllowlistCommand::List => {
            for entry in admin.list().await? {
                println!(
                    "{:<32} {:<8} v{} {}",
                    entry.brand_slug,
                    entry.status.as_str(),
                    entry.version,
                    entry.updated_at.to_rfc3339()
                );
            }
            return Ok(());
        }
        AllowlistCommand::Audit { brand_slug } => {
            return print_json(&admin.audit(brand_slug.as_deref()).await?);
        }
        AllowlistCommand::Verify => {
            let report = admin.verify().await?;
            print_json(&report)?;
            if !report.is_clean() {
                error!(
                    chain_break = ?report.chain_break,
                    drifted_brands = ?report.drifted_brands,
                    "allowlist audit verification failed"
                );
                anyhow::bail!("allowlist audit verification failed");
            }
            return Ok(());
        }
        AllowlistCommand::Rebuild => {
            let entries = store.rebuild_allowlist().await?;
            println!("allowlist rebuilt: {entries} brands");
            return Ok(());
        }
        AllowlistCommand::Seed { path } => {
            let seed = load_allowlist_seed(&path)?;
            return print_json(&admin.seed(&seed).await?);
        }
        AllowlistCommand::Add(args) => args.into_request(AllowlistAction::Add),
        AllowlistCommand::Pause(args) => args.into_request(AllowlistAction::Pause),
        AllowlistCommand::Remove(args) => args.into_request(AllowlistAction::Remove),
        AllowlistCommand::Promote {
            transition,
            coverage,
            force,
        } => {
            let mut request = transition.into_request(AllowlistAction::Promote);
            request.force = force;
            if let Some(path) = coverage {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let coverage: BrandCoverage = serde_json::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?;
                request.coverage = Some(coverage);
            }
            request
        }
    };

    let record = admin.apply(request).await?;
    println!(
        "#{} {} {}: {} -> {}",
        record.seq,
        record.action,
        record.brand_slug,
        record
            .from_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string()),
        record.to_status
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = MergeConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            connect(&config).await?.migrate().await?;
            info!("migrations applied");
            println!("migrations applied");
        }
        Commands::Stage { bundles } => {
            let store = connect(&config).await?;
            for path in bundles {
                let summary = pfcat_staging::append_bundle_file(&store, &path).await?;
                println!(
                    "staged {}: run_id={} rows={} appended={} duplicates={}",
                    path.display(),
                    summary.run_id,
                    summary.rows,
                    summary.appended,
                    summary.duplicates
                );
            }
        }
        Commands::Merge {
            run_id,
            dry_run,
            no_report,
        } => run_merge(&config, &run_id, dry_run, no_report).await?,
        Commands::Results { run_id, residuals } => {
            let store = connect(&config).await?;
            print_json(&store.merge_results(&run_id).await?)?;
            if let Some(seq) = residuals {
                print_json(&store.residuals(&run_id, seq).await?)?;
            }
        }
        Commands::Allowlist(command) => run_allowlist(&config, command).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn merge_flags_parse() {
        let cli = Cli::try_parse_from(["pfcat", "merge", "R1", "--dry-run", "--no-report"]).unwrap();
        match cli.command {
            Commands::Merge {
                run_id,
                dry_run,
                no_report,
            } => {
                assert_eq!(run_id, "R1");
                assert!(dry_run);
                assert!(no_report);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
