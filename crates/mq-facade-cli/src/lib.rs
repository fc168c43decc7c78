//! # MQ Facade CLI
//!
//! Command-line front end for the MQ facade.
//!
//! This module provides CLI commands for:
//! - Configuration validation
//! - Relaying standard input through a broker destination to standard output

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use mq_facade_core::{
    run_until_shutdown, ConfigurationError, Consumer, DestinationKind, MqConfig, MqError,
    Producer, ShutdownCoordinator, ShutdownState, WorkerStats,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// MQ facade CLI - send and receive through a message broker
#[derive(Parser)]
#[command(name = "mq-facade")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Send and receive messages through a broker destination")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate configuration
    CheckConfig {
        /// Print the resolved configuration as TOML
        #[arg(short, long)]
        print: bool,
    },

    /// Send each stdin line to a destination and print what arrives there
    Relay {
        /// Destination kind
        #[arg(short, long, default_value = "queue")]
        kind: KindArg,

        /// Destination name
        #[arg(short, long)]
        name: String,

        /// Broker URL, overriding the configured one
        #[arg(short, long)]
        url: Option<String>,

        /// Send messages persistently
        #[arg(long)]
        persistent: bool,

        /// Message time-to-live in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
}

/// Destination kind as accepted on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum KindArg {
    Queue,
    Topic,
}

impl From<KindArg> for DestinationKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Queue => DestinationKind::Queue,
            KindArg::Topic => DestinationKind::Topic,
        }
    }
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// Errors raised before a command runs
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },
}

/// Process exit code for an error returned by [`run`]
pub fn exit_code(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<ConfigurationError>().is_some() {
        3
    } else if error.downcast_ref::<MqError>().is_some() {
        2
    } else {
        1
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `log_level`. Logs go to stderr so stdout carries only
/// relayed messages.
pub fn init_logging(log_level: &str, json: bool) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Execute a parsed command line
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config =
        MqConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::CheckConfig { print } => execute_check_config(&config, print),
        Commands::Relay {
            kind,
            name,
            url,
            persistent,
            ttl_ms,
        } => {
            if let Some(url) = url {
                config.broker_url = url;
            }
            if persistent {
                config.producer.persistent = true;
            }
            if ttl_ms.is_some() {
                config.producer.time_to_live_ms = ttl_ms;
            }
            config.validate().context("Invalid relay options")?;

            let input = tokio::io::BufReader::new(tokio::io::stdin());
            let output = Arc::new(Mutex::new(std::io::stdout()));
            let stats = relay(&config, kind.into(), &name, input, output).await?;

            info!(
                processed = stats.processed,
                failed = stats.failed,
                "Relay finished"
            );
            Ok(())
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn execute_check_config(config: &MqConfig, print: bool) -> anyhow::Result<()> {
    info!(broker_url = %config.broker_url, "Configuration is valid");

    if print {
        let rendered =
            toml::to_string_pretty(config).context("Failed to render configuration as TOML")?;
        println!("{}", rendered);
    } else {
        println!("Configuration OK (broker: {})", config.broker_url);
    }
    Ok(())
}

/// Relay lines from `input` through the destination to `output`.
///
/// A consumer worker writes every received text message to `output` while
/// the producer sends each input line. The relay stops on SIGINT/SIGTERM or
/// once input ends and everything sent has come back (or the consumer's
/// receive timeout passes without it). Both facades share one connection.
pub async fn relay<R, W>(
    config: &MqConfig,
    kind: DestinationKind,
    name: &str,
    input: R,
    output: Arc<Mutex<W>>,
) -> anyhow::Result<WorkerStats>
where
    R: AsyncBufRead + Unpin,
    W: Write + Send + 'static,
{
    let state = ShutdownState::new();
    let coordinator = ShutdownCoordinator::from_config(state.clone(), &config.shutdown)
        .on_cleanup({
            let output = output.clone();
            move || match output.lock() {
                Ok(mut output) => {
                    if let Err(e) = output.flush() {
                        warn!(error = %e, "Failed to flush relay output");
                    }
                }
                Err(_) => warn!("Output writer lock poisoned; not flushed"),
            }
        });

    let mut consumer = Consumer::from_config(config);
    consumer
        .connect(kind, name)
        .await
        .with_context(|| format!("Failed to subscribe to {} '{}'", kind, name))?;
    let connection = consumer
        .connection()
        .ok_or_else(|| anyhow!("Consumer lost its connection"))?;

    let mut producer = Producer::from_config(config);
    producer
        .connect_with_connection(kind, name, connection)
        .await
        .with_context(|| format!("Failed to open producer for {} '{}'", kind, name))?;

    let relayed = Arc::new(AtomicU64::new(0));
    let worker = {
        let state = state.clone();
        let relayed = relayed.clone();
        tokio::spawn(async move {
            let stats = run_until_shutdown(&mut consumer, &state, |message| {
                let output = output.clone();
                let relayed = relayed.clone();
                async move {
                    let Some(text) = message.text() else {
                        warn!(message_id = %message.message_id, "Skipping non-text message");
                        return Ok(());
                    };
                    let mut output = output
                        .lock()
                        .map_err(|_| anyhow!("Output writer lock poisoned"))?;
                    writeln!(output, "{}", text)?;
                    output.flush()?;
                    relayed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
            consumer.close();
            stats
        })
    };

    let use_transactions = config.producer.use_transactions;
    let drain_limit = Duration::from_millis(config.consumer.receive_timeout_ms);
    let pump = async {
        let mut sent = 0u64;
        let mut lines = input.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match send_line(&mut producer, &line, use_transactions).await {
                    Ok(true) => sent += 1,
                    Ok(false) => {}
                    Err(e) => {
                        error!(error = %e, "Failed to send line; stopping relay");
                        break;
                    }
                },
                Ok(None) => {
                    debug!(sent = sent, "Input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input; stopping relay");
                    break;
                }
            }
        }
        wait_for_drain(&relayed, sent, drain_limit).await;
    };

    let completed = coordinator.run_until(pump).await;

    let report = producer.close();
    debug!(report = %report, "Producer released");

    if !completed {
        worker.abort();
        return Err(anyhow!("Relay worker did not finish within the grace period"));
    }

    let stats = worker.await.context("Relay worker task failed")??;
    Ok(stats)
}

async fn send_line(
    producer: &mut Producer,
    line: &str,
    use_transactions: bool,
) -> Result<bool, MqError> {
    let sent = producer.send_message(line).await?.is_some();
    if sent && use_transactions {
        producer.commit().await?;
    }
    Ok(sent)
}

async fn wait_for_drain(relayed: &AtomicU64, sent: u64, limit: Duration) {
    let deadline = Instant::now().checked_add(limit);
    while relayed.load(Ordering::SeqCst) < sent {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            warn!(
                sent = sent,
                relayed = relayed.load(Ordering::SeqCst),
                "Not every sent message came back before the drain limit"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
