use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use stockwise_source::{default_connector, LegacySource, SourceClient};
use stockwise_storage::PgDestination;
use stockwise_sync::{Orchestrator, SyncConfig, SystemClock};
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stockwise")]
#[command(about = "Syncs the production/warehouse database into the analytics warehouse")]
struct Cli {
    /// Print reports as JSON instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reload all history from the full-history source, then rebuild aggregates.
    Full,
    /// Reload movements and the stock master only.
    StockOnly,
    /// One incremental pass including timed jobs.
    Once,
    /// Run the weekly pipeline now.
    Weekly,
    /// First-time load: full reload, live catch-up, forecast pipeline.
    Bootstrap,
    /// Resume a bootstrap after its full reload.
    BootstrapContinue,
    BootstrapStockOnly,
    /// Live catch-up followed by the post-forecast and dashboard refreshes.
    CompleteLive,
    /// Scheduler loop (default).
    Run,
    /// Reload the stock master dimension.
    StockMaster,
    /// Run refresh scripts on demand.
    RunSql {
        #[arg(long)]
        pre: bool,
        #[arg(long)]
        post: bool,
        #[arg(long)]
        dashboard: bool,
    },
    /// Compare stored balances with a replay of raw movements.
    VerifyStock,
    CheckConnections,
    /// Print every stored watermark.
    Status,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c; stop the process to exit");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    let dest = PgDestination::connect(&config.destination).await?;
    let source = LegacySource::new(SourceClient::new(config.source.clone(), default_connector()));
    let mut orchestrator = Orchestrator::new(
        config,
        Box::new(source),
        Box::new(dest),
        Arc::new(SystemClock),
    );

    let command = cli.command.unwrap_or(Commands::Run);
    if !matches!(command, Commands::CheckConnections | Commands::Status) {
        orchestrator.prepare().await?;
    }

    match command {
        Commands::Full => orchestrator.run_full(true).await?,
        Commands::StockOnly => orchestrator.run_full_stock_only().await?,
        Commands::Once => {
            let report = orchestrator.run_incremental(true).await?;
            if cli.json {
                print_json(&report)?;
                return Ok(ExitCode::SUCCESS);
            }
            println!(
                "incremental pass complete: consumption={} movements={} skipped={}",
                report.consumption.watermark,
                report.movements.watermark,
                report.consumption.report.skipped.len() + report.movements.report.skipped.len()
            );
        }
        Commands::Weekly => orchestrator.run_weekly().await?,
        Commands::Bootstrap => orchestrator.run_bootstrap().await?,
        Commands::BootstrapContinue => orchestrator.run_bootstrap_continue().await?,
        Commands::BootstrapStockOnly => orchestrator.run_bootstrap_stock_only().await?,
        Commands::CompleteLive => orchestrator.complete_live().await?,
        Commands::Run => {
            info!("scheduler started");
            orchestrator.run_forever(shutdown_signal()).await?;
        }
        Commands::StockMaster => {
            let rows = orchestrator.load_stock_master_only().await?;
            println!("stock master reloaded: rows={rows}");
        }
        Commands::RunSql {
            pre,
            post,
            dashboard,
        } => {
            if !(pre || post || dashboard) {
                eprintln!("nothing selected; pass --pre, --post and/or --dashboard");
                return Ok(ExitCode::from(2));
            }
            orchestrator.run_scripts(pre, post, dashboard).await?;
        }
        Commands::VerifyStock => {
            let report = orchestrator.verify_stock().await?;
            let code = ExitCode::from(u8::try_from(report.exit_code()).unwrap_or(1));
            if cli.json {
                print_json(&report)?;
                return Ok(code);
            }
            if !report.missing_tables.is_empty() {
                eprintln!("missing tables: {}", report.missing_tables.join(", "));
            }
            println!(
                "balance rows={} mismatches={}; variant rows={} mismatches={}",
                report.balance_rows,
                report.balance_mismatches.len(),
                report.variant_rows,
                report.variant_mismatches.len()
            );
            for mismatch in report.balance_mismatches.iter().take(10) {
                println!(
                    "  balance {}/{}/{}: expected={} actual={}",
                    mismatch.key.material,
                    mismatch.key.warehouse,
                    mismatch.key.unit,
                    mismatch.expected,
                    mismatch.actual
                );
            }
            for mismatch in report.variant_mismatches.iter().take(10) {
                println!(
                    "  variant {}/{}/{}/{}: expected={} actual={}",
                    mismatch.key.bom_material_name.as_deref().unwrap_or("-"),
                    mismatch.key.stock_adi,
                    mismatch.key.warehouse,
                    mismatch.key.stock_uom,
                    mismatch.expected,
                    mismatch.actual
                );
            }
            return Ok(code);
        }
        Commands::CheckConnections => {
            let report = orchestrator.check_connections().await;
            match &report.destination {
                None => println!("destination: ok"),
                Some(err) => println!("destination: FAILED ({err})"),
            }
            match &report.source {
                None => println!("source: ok"),
                Some(err) => println!("source: FAILED ({err})"),
            }
            if !report.is_ok() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Status => {
            let states = orchestrator.status().await?;
            if cli.json {
                print_json(&states)?;
                return Ok(ExitCode::SUCCESS);
            }
            for state in states {
                println!(
                    "{:<28} {:>12}  {}",
                    state.name, state.last_watermark, state.updated_at
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
