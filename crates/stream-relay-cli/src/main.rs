// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;

use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use stream_relay::coordinator::{run_indexer, run_ingest};
use stream_relay::routing::parse_terms;
use stream_relay::RelayConfig;

const APPLICATIONS: [(u8, &str); 2] = [
    (1, "Firehose to log: stream filtered events into the Kafka topic"),
    (2, "Log to index: write a bounded number of log records into Elasticsearch"),
];

#[derive(Parser, Debug)]
#[command(name = "stream-relay")]
#[command(about = "Relay a filtered event firehose into Kafka and from Kafka into Elasticsearch", long_about = None)]
#[command(version)]
struct Cli {
    /// Application to run (1 = ingest, 2 = index writer)
    #[arg(short, long, allow_negative_numbers = true)]
    app: Option<i64>,

    /// Filter terms separated by '|', e.g. "corona|covid"
    #[arg(short, long)]
    elements: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    Usage,
    MissingParameters,
    Ingest,
    Indexer,
    Unknown(i64),
}

impl Selection {
    fn from_cli(cli: &Cli) -> Self {
        match cli.app {
            None if cli.elements.is_some() => Self::MissingParameters,
            None => Self::Usage,
            Some(0) => Self::MissingParameters,
            Some(1) => Self::Ingest,
            Some(2) => Self::Indexer,
            Some(other) => Self::Unknown(other),
        }
    }
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("RELAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,librdkafka=warn,{}", log_level);

    let filter = EnvFilter::try_new(&env_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
        return;
    }
    debug!("Logging subsystem enabled");

    let cli = Cli::parse();
    match Selection::from_cli(&cli) {
        Selection::Usage => print_usage(),
        Selection::MissingParameters => {
            error!("Parameters missing. Use --app <N> [--elements \"a|b|c\"]");
        }
        Selection::Unknown(app) => {
            info!("No application selected [{app}]");
            print_usage();
        }
        Selection::Ingest => {
            let Some(config) = load_config() else { return };
            let terms = parse_terms(cli.elements.as_deref());
            info!("Starting ingest with terms {terms:?}");
            match run_ingest(&config, terms).await {
                Ok(summary) => info!(
                    "Ingest complete: {} published, {} delivered, {} failed",
                    summary.published, summary.delivery.delivered, summary.delivery.failed
                ),
                Err(e) => error!("Ingest failed: {e}"),
            }
        }
        Selection::Indexer => {
            let Some(config) = load_config() else { return };
            match run_indexer(&config).await {
                Ok(summary) => info!(
                    "Index writer complete: {} inserts ({:?})",
                    summary.inserted, summary.stopped_by
                ),
                Err(e) => error!("Index writer failed: {e}"),
            }
        }
    }
}

fn load_config() -> Option<RelayConfig> {
    match RelayConfig::from_env() {
        Ok(config) => Some(config),
        Err(e) => {
            error!("{e}");
            None
        }
    }
}

fn print_usage() {
    info!("Usage: stream-relay --app <N> [--elements \"a|b|c\"]");
    for (number, description) in APPLICATIONS {
        info!("  {number}: {description}");
    }
}
