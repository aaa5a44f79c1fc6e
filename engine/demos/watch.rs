//! Ingest and watch a directory of Markdown files until Ctrl-C.
//!
//! Usage: cargo run -p ragforge-engine --example watch -- <directory> [project]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ragforge_engine::{DirectoryConfig, EngineConfig, HashingProvider, IngestionEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logs
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let directory = PathBuf::from(args.next().ok_or("usage: watch <directory> [project]")?);
    let project = args.next().unwrap_or_else(|| "default".to_string());

    let config = EngineConfig::default().with_directory(
        project,
        DirectoryConfig::new(&directory).with_extensions(["md", "markdown"]),
    );
    let engine = IngestionEngine::builder(config)
        .with_embedder(Arc::new(HashingProvider::default()))
        .build()?;

    let report = engine.start().await?;
    println!(
        "Watching {} ({} files scanned, {} queued)",
        directory.display(),
        report.scanned,
        report.discovered
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let stats = engine.stats().await?;
                println!(
                    "files: {} total, {} completed, {} pending, {} failed",
                    stats.progress.total,
                    stats.progress.completed,
                    stats.progress.pending,
                    stats.progress.failed
                );
            }
        }
    }

    let graceful = engine.stop().await;
    println!("Stopped{}", if graceful { "" } else { " (forced)" });
    Ok(())
}
