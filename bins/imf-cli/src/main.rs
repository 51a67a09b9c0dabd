use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use imf_core::{RefreshPipeline, RefreshSpec, StoreSpec};
use imf_io::{open_destination, sink_stdout::StdoutPreview, source_catalog::HttpCatalog};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "imf-refresh", about = "Reload IMF DataMapper indicators through a staging table")]
struct Args {
    /// Refresh YAML; IMF__* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Fetch and reshape only, print the first rows instead of loading
    #[arg(long)]
    dry_run: bool,
    /// Rows printed by --dry-run
    #[arg(long, default_value_t = 20)]
    preview_rows: usize,
    /// Print the run outcome as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    let args = Args::parse();
    let spec = RefreshSpec::load(args.config.as_deref())?;

    let catalog = HttpCatalog::new(&spec.catalog)?;
    // a dry run never opens the configured store
    let store = if args.dry_run {
        StoreSpec::Memory { ack_delay_ms: 0 }
    } else {
        spec.store.clone()
    };
    let destination = open_destination(&store)?;
    let pipeline = RefreshPipeline::new(
        spec,
        Arc::new(catalog),
        destination.tables,
        destination.ingest,
    );

    // Ctrl-C handling
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            on_interrupt.cancel();
        }
    });

    if args.dry_run {
        let rows = pipeline.preview(Utc::now(), &cancel).await?;
        info!("Dry run assembled {} rows", rows.len());
        StdoutPreview::new(args.preview_rows).print(&rows)?;
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = pipeline.run(cancel).await;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{outcome}");
    }
    Ok(if outcome.is_replaced() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
