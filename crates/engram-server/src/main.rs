// crates/engram-server/src/main.rs
// Engram - per-project memory service

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use engram::Engram;

#[derive(Parser)]
#[command(name = "engram", about = "Per-project memory service", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service until interrupted
    Serve,
    /// Rebuild the in-memory vector index for a project and exit
    RebuildIndex {
        /// Project UUID
        #[arg(long)]
        project: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Environment files are opt-in; a missing .env is not an error
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::RebuildIndex { project } => rebuild_index(project).await,
    }
}

async fn serve() -> Result<()> {
    let service = Engram::from_env().await?;
    tracing::info!(
        data_dir = %service.config().data_dir.display(),
        "Engram service started"
    );

    tokio::signal::ctrl_c().await?;
    if let Some(queue) = service.queue() {
        queue.stop();
    }
    tracing::info!("Engram service stopped");
    Ok(())
}

async fn rebuild_index(project: Uuid) -> Result<()> {
    let service = Engram::from_env().await?;
    match service.spawn_index_rebuild(vec![project]) {
        Some(handle) => {
            handle.await?;
            let count = service.vector_index().active_count().await;
            println!("Rebuilt index for {project}: {count} vectors");
        }
        None => {
            anyhow::bail!("no embedding model configured; set ENGRAM_EMBEDDINGS_URL");
        }
    }
    Ok(())
}
