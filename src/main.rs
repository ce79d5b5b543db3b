//! Binary entrypoint
//!
//! Two subcommands mirror the two execution modes:
//!
//! - `wienfeed refresh <provider>` fetches one upstream and rewrites its
//!   cache file (scheduled independently per provider)
//! - `wienfeed build` assembles the RSS feed from the local caches
//!
//! Exit codes: 0 success, 1 invalid configuration, 2 no enabled provider
//! produced data, 3 persistent I/O failure on the feed output.

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use wienfeed::commands;
use wienfeed::config::Config;
use wienfeed::error::{Error, ErrorCategory};
use wienfeed::providers::ProviderKind;

#[derive(Parser)]
#[command(
    name = "wienfeed",
    version,
    about = "Aggregates Vienna public-transport disruption notices into an RSS feed"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one provider's upstream and refresh its cache
    Refresh {
        /// Provider to refresh: wl, oebb or vor
        provider: String,
    },
    /// Build the RSS feed from the local provider caches
    Build,
}

fn init_tracing(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    if config.logging.format == "json" {
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed(),
        );
    } else {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .boxed(),
        );
    }

    let guard = match std::fs::create_dir_all(&config.logging.dir) {
        Ok(()) => {
            let appender =
                tracing_appender::rolling::daily(&config.logging.dir, "wienfeed.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed(),
            );
            Some(guard)
        }
        Err(_) => None,
    };

    tracing_subscriber::registry().with(layers).with(filter).init();
    guard
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let base_dir = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("cannot determine working directory: {e}");
            return 1;
        }
    };
    let config = match Config::from_env(base_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 1;
        }
    };
    let _log_guard = init_tracing(&config);

    match cli.command {
        Commands::Refresh { provider } => {
            let Some(kind) = ProviderKind::from_arg(&provider) else {
                eprintln!("unknown provider {provider:?} (expected wl, oebb or vor)");
                return 1;
            };
            match commands::refresh::execute(&config, kind).await {
                Ok(()) => 0,
                Err(Error::RateLimitExceeded { provider, detail }) => {
                    // Clean abort: the cache stays as it was, the next
                    // scheduled refresh tries again
                    tracing::warn!(provider = %provider, detail = %detail, "refresh skipped");
                    0
                }
                Err(e) if e.category() == ErrorCategory::Config => {
                    tracing::error!(error = %e, "refresh aborted by configuration");
                    1
                }
                Err(e) => {
                    tracing::error!(error = %e, "refresh failed");
                    1
                }
            }
        }
        Commands::Build => match commands::build::execute(&config).await {
            Ok(outcome) => {
                if outcome.enabled_providers > 0 && outcome.providers_with_data == 0 {
                    tracing::error!("no enabled provider produced data");
                    2
                } else {
                    0
                }
            }
            Err(e) if e.category() == ErrorCategory::Storage => {
                tracing::error!(error = %e, "feed output could not be written");
                3
            }
            Err(e) if e.category() == ErrorCategory::Config => {
                tracing::error!(error = %e, "build aborted by configuration");
                1
            }
            Err(e) => {
                tracing::error!(error = %e, "feed build failed");
                1
            }
        },
    }
}

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}
