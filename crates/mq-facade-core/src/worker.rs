//! Shutdown-aware receive loop.

use crate::consumer::Consumer;
use crate::error::MqError;
use crate::message::ReceivedMessage;
use crate::shutdown::ShutdownState;
use crate::transport::AcknowledgeMode;
use std::future::Future;
use tracing::{debug, error, info};

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

/// Counts reported when a worker loop ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages the handler accepted
    pub processed: u64,
    /// Handler failures; each failed message was handed back for redelivery
    pub failed: u64,
}

/// Sets the finished flag on every exit path, including errors and panics
struct FinishedGuard<'a>(&'a ShutdownState);

impl Drop for FinishedGuard<'_> {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

/// Receive and handle messages until shutdown is requested.
///
/// Each receive waits at most the consumer's timeout, so a shutdown request
/// is noticed within one timeout. After a successful handler call the
/// message is acknowledged (client acknowledgement) or committed
/// (transacted session). After a failed call it is recovered or rolled back
/// so the broker redelivers it. The shutdown state is marked finished when
/// the loop ends for any reason.
pub async fn run_until_shutdown<H, Fut>(
    consumer: &mut Consumer,
    shutdown: &ShutdownState,
    mut handler: H,
) -> Result<WorkerStats, MqError>
where
    H: FnMut(ReceivedMessage) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let _finished = FinishedGuard(shutdown);
    let mut stats = WorkerStats::default();

    info!(destination = ?consumer.destination().map(ToString::to_string), "Worker started");

    while !shutdown.is_shutdown_requested() {
        let Some(message) = consumer.receive().await? else {
            continue;
        };

        let message_id = message.message_id.clone();
        match handler(message).await {
            Ok(()) => {
                settle(consumer, Outcome::Success).await?;
                stats.processed += 1;
                debug!(message_id = %message_id, "Message processed");
            }
            Err(e) => {
                stats.failed += 1;
                error!(
                    message_id = %message_id,
                    error = %format!("{:#}", e),
                    "Message handler failed; returning message for redelivery"
                );
                settle(consumer, Outcome::Failure).await?;
            }
        }
    }

    info!(
        processed = stats.processed,
        failed = stats.failed,
        "Worker stopped after shutdown request"
    );
    Ok(stats)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
}

async fn settle(consumer: &mut Consumer, outcome: Outcome) -> Result<(), MqError> {
    let Some(options) = consumer.session_options() else {
        return Ok(());
    };

    match (options.transacted, options.acknowledge_mode, outcome) {
        (true, _, Outcome::Success) => consumer.commit().await,
        (true, _, Outcome::Failure) => consumer.rollback().await,
        (false, AcknowledgeMode::Client, Outcome::Success) => consumer.acknowledge().await,
        (false, AcknowledgeMode::Client, Outcome::Failure) => consumer.recover().await,
        // Auto acknowledgement already settled the message on receive.
        (false, AcknowledgeMode::Auto, _) => Ok(()),
    }
}
