//! sapid: the SAPI registry daemon's admin entry point.
//!
//! Opens the registry on this node's data directory and answers queries
//! against it. Every command prints pretty JSON on stdout.
//!
//! # Usage
//!
//! ```text
//! sapid --config /opt/smartdc/sapi/etc/sapi.toml status
//! sapid list services --filter application_uuid=<uuid>
//! sapid payload <instance-uuid>
//! ```

mod admin;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sapi_core::{Bucket, SapiConfig};
use tracing::debug;

#[derive(Parser)]
#[command(name = "sapid", about = "SAPI registry daemon")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the operating mode and store health.
    Status,
    /// List the objects of a bucket.
    List {
        /// applications, services, instances, manifests or history.
        bucket: Bucket,

        /// Exact-match filter as key=value; repeatable.
        #[arg(long = "filter", value_parser = admin::parse_filter)]
        filters: Vec<(String, String)>,

        /// Lower bound on `started` (milliseconds).
        #[arg(long)]
        since: Option<i64>,

        /// Upper bound on `started` (milliseconds).
        #[arg(long)]
        until: Option<i64>,
    },
    /// Fetch one object.
    Get { bucket: Bucket, uuid: String },
    /// Provisioning parameters for an instance's VM.
    Payload { instance: String },
    /// Configuration served to an instance's zone.
    Config { instance: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = match &cli.config {
        Some(path) => SapiConfig::from_file(path)?,
        None => SapiConfig::default(),
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    let model = admin::open_model(&config).await?;
    let output = match cli.command {
        Command::Status => admin::status(&model, &config).await,
        Command::List {
            bucket,
            filters,
            since,
            until,
        } => {
            let query = admin::ListQuery {
                filters,
                since,
                until,
            };
            admin::list(&model, bucket, &query).await?
        }
        Command::Get { bucket, uuid } => admin::get(&model, bucket, &uuid).await?,
        Command::Payload { instance } => {
            serde_json::to_value(model.get_instance_payload(&instance).await?)?
        }
        Command::Config { instance } => serde_json::to_value(model.get_config(&instance).await?)?,
    };
    model.close().await;

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sapid=debug,sapi=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
