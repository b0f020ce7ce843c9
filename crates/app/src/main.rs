mod server;
mod services;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use services::{Services, Settings};
use std::path::Path;
use supportkb_core::{discover_input_files, load_uploaded_file, EventSink, IngestionPipeline};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "supportkb", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    settings: Settings,
}

#[derive(Subcommand)]
enum Command {
    /// Serve ingestion jobs and answers over HTTP.
    Serve {
        /// Address to bind.
        #[arg(long, env = "SUPPORTKB_LISTEN", default_value = "127.0.0.1:8080")]
        listen: String,
    },
    /// Run the ingestion pipeline over a file or folder and print events as JSON lines.
    Ingest {
        /// File, or folder searched recursively.
        #[arg(long)]
        path: String,
    },
    /// Answer one question against the knowledge base.
    Ask {
        #[arg(long)]
        question: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "supportkb boot"
    );

    let services = Services::build(&cli.settings)
        .await
        .context("failed to set up collaborators")?;

    match cli.command {
        Command::Serve { listen } => server::start(&listen, services).await?,
        Command::Ingest { path } => ingest(&path, services).await?,
        Command::Ask { question } => {
            let result = services.router.answer(&question).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

async fn ingest(path: &str, services: Services) -> anyhow::Result<()> {
    let root = Path::new(path);
    let paths = if root.is_file() {
        vec![root.to_path_buf()]
    } else {
        discover_input_files(root)
    };
    if paths.is_empty() {
        anyhow::bail!("no supported files found in {}", root.display());
    }

    let files = paths
        .iter()
        .map(|path| load_uploaded_file(path))
        .collect::<Result<Vec<_>, _>>()
        .context("failed to read input files")?;
    info!(path = %root.display(), files = files.len(), "ingesting");

    let pipeline = IngestionPipeline::new(services.deps.clone(), services.options.clone())?;
    let (mut sink, mut rx) = EventSink::channel(supportkb_core::ingest::EVENT_CHANNEL_CAPACITY);

    let printer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message.event) {
                Ok(line) => println!("{line}"),
                Err(error) => eprintln!("unprintable event: {error}"),
            }
        }
    });

    let candidates = pipeline.run(&files, &mut sink).await?;
    drop(sink);
    printer.await?;

    println!(
        "{} candidates generated at {}",
        candidates.len(),
        Utc::now().to_rfc3339()
    );
    Ok(())
}
