use anyhow::Context;
use clap::Parser;
use marketplace_scanner::{
    cli::{commands, Cli, Commands},
    Cancellation, Settings,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    // Silently ignore if file doesn't exist
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,marketplace_scanner=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let settings = Settings::from_env().context("Failed to load settings")?;
    settings.validate().context("Invalid settings")?;

    // Ctrl+C cancels whatever is in flight
    let (handle, cancel) = Cancellation::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling");
            handle.cancel();
        }
    });

    match cli.command {
        Commands::Search {
            query,
            min_stars,
            topics,
            sort,
            limit,
        } => {
            commands::search(&settings, &query, min_stars, topics, sort, limit, &cancel)
                .await
                .with_context(|| format!("Search for '{query}' failed"))?;
        }
        Commands::Manifest { repo, path } => {
            commands::manifest(&settings, &repo, path, &cancel)
                .await
                .with_context(|| format!("Failed to fetch manifest for {repo}"))?;
        }
        Commands::Metadata { repo, base_only } => {
            commands::metadata(&settings, &repo, base_only, &cancel)
                .await
                .with_context(|| format!("Failed to assemble metadata for {repo}"))?;
        }
        Commands::Validate { file, strict } => {
            commands::validate(&settings, &file, strict)
                .with_context(|| format!("{} failed validation", file.display()))?;
        }
        Commands::Scan { queries, repos } => {
            let report = commands::scan(&settings, queries.as_deref(), &repos, &cancel)
                .await
                .context("Scan failed")?;
            if let Some(reason) = &report.aborted {
                anyhow::bail!("Scan {} aborted: {}", report.scan_id, reason);
            }
        }
        Commands::Limits => {
            commands::limits(&settings, &cancel)
                .await
                .context("Failed to query rate limits")?;
        }
    }

    Ok(())
}
