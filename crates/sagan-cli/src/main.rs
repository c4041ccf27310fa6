use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sagan_gateway::GatewayConfig;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sagan")]
#[command(about = "Sagan contacts command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Export every contact, refresh the local cache and optionally write the records out.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Segments,
    /// Show the status of a contact import job.
    JobStatus { job_id: String },
    CustomFields,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.web_port);
            sagan_web::serve(sagan_web::state_from_config(&config)?, port).await?;
        }
        Commands::Export { out } => {
            let directory = sagan_web::state_from_config(&config)?.directory;
            let listing = directory.refresh().await.context("exporting contacts")?;
            println!(
                "export complete: contacts={} skipped={} fetched_at={}",
                listing.contacts.len(),
                listing.skipped,
                listing.fetched_at
            );
            if let Some(out) = out {
                let bytes = serde_json::to_vec_pretty(&listing.contacts)
                    .context("serializing contacts")?;
                tokio::fs::write(&out, bytes)
                    .await
                    .with_context(|| format!("writing {}", out.display()))?;
                info!(path = %out.display(), "contacts written");
            }
        }
        Commands::Segments => {
            let directory = sagan_web::state_from_config(&config)?.directory;
            for segment in directory.list_segments().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    segment.id,
                    segment.name,
                    segment.contacts_count,
                    segment.tags.join(",")
                );
            }
        }
        Commands::JobStatus { job_id } => {
            let directory = sagan_web::state_from_config(&config)?.directory;
            let status = directory.refresh_job_status(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::CustomFields => {
            let directory = sagan_web::state_from_config(&config)?.directory;
            for field in directory.gateway().list_custom_fields().await? {
                println!("{}\t{}\t{}", field.key, field.name, field.field_type);
            }
        }
    }

    Ok(())
}
