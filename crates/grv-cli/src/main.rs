use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use grv_core::BatchPayload;
use grv_reconcile::{Backend, ServiceConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "grv-cli")]
#[command(about = "Grievance Desk complaint reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Apply schema migrations and the optional department/student seed file.
    Migrate,
    /// Print the merged complaint list as JSON.
    Merge,
    /// Apply a batch report file inside one transaction.
    ApplyBatch {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            grv_web::serve(&config).await?;
        }
        Commands::Migrate => {
            let summary = grv_reconcile::run_migrate(&config).await?;
            println!(
                "migrate complete: departments={} students={}",
                summary.departments, summary.students
            );
        }
        Commands::Merge => {
            let backend = Backend::connect(&config).await?;
            let merged = backend.reconciler.merged().await;
            println!("{}", serde_json::to_string_pretty(&merged)?);
            backend.store.close().await;
        }
        Commands::ApplyBatch { file } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let payload: BatchPayload = serde_json::from_str(&text)
                .with_context(|| format!("decoding batch payload in {}", file.display()))?;
            let backend = Backend::connect(&config).await?;
            let results = backend.store.apply_batch(&payload.into_items()).await?;
            let failed = results.iter().filter(|r| !r.is_success()).count();
            println!("{}", serde_json::to_string_pretty(&results)?);
            eprintln!(
                "apply-batch complete: items={} succeeded={} failed={}",
                results.len(),
                results.len() - failed,
                failed
            );
            backend.store.close().await;
        }
    }

    Ok(())
}
