//! Cooperative process shutdown.
//!
//! [`ShutdownState`] is a cloneable handle on two flags shared by the
//! coordinator and the workers:
//!
//! ```text
//! Running ──signal──▶ ShutdownRequested ──worker done──▶ Finished
//! ```
//!
//! Workers stop pulling new messages once shutdown is requested, finish what
//! they hold, then mark the state finished. The [`ShutdownCoordinator`] waits
//! for that, polling at a short fixed interval, then runs its registered
//! cleanup hooks (flushing output, for example) before letting the process
//! exit.

use crate::config::ShutdownConfig;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "shutdown_tests.rs"]
mod tests;

/// Default interval at which the coordinator checks for completion
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Observable phase of a [`ShutdownState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    ShutdownRequested,
    Finished,
}

#[derive(Debug, Default)]
struct Flags {
    requested: AtomicBool,
    finished: AtomicBool,
}

/// Shared shutdown flags passed explicitly to workers
#[derive(Debug, Clone, Default)]
pub struct ShutdownState {
    flags: Arc<Flags>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask workers to stop taking new work
    pub fn request_shutdown(&self) {
        self.flags.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.flags.requested.load(Ordering::SeqCst)
    }

    /// Report that the worker has stopped and released what it held
    pub fn mark_finished(&self) {
        self.flags.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.flags.finished.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> ShutdownPhase {
        if self.is_finished() {
            ShutdownPhase::Finished
        } else if self.is_shutdown_requested() {
            ShutdownPhase::ShutdownRequested
        } else {
            ShutdownPhase::Running
        }
    }
}

type CleanupHook = Box<dyn FnOnce() + Send>;

/// Waits for a termination signal, then for the workers to finish
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: ShutdownState,
    poll_interval: Duration,
    grace_period: Option<Duration>,
    cleanup: Arc<Mutex<Vec<CleanupHook>>>,
}

impl ShutdownCoordinator {
    pub fn new(state: ShutdownState) -> Self {
        Self {
            state,
            poll_interval: DEFAULT_POLL_INTERVAL,
            grace_period: None,
            cleanup: Arc::default(),
        }
    }

    pub fn from_config(state: ShutdownState, config: &ShutdownConfig) -> Self {
        Self {
            state,
            poll_interval: config.poll_interval(),
            grace_period: config.grace_period(),
            cleanup: Arc::default(),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Stop waiting for workers after `grace_period`
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    /// Run `hook` once, after the wait for workers ends. Hooks run in
    /// registration order, also when the grace period ran out.
    pub fn on_cleanup(self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup_hooks().push(Box::new(hook));
        self
    }

    fn cleanup_hooks(&self) -> std::sync::MutexGuard<'_, Vec<CleanupHook>> {
        self.cleanup
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn run_cleanup(&self) {
        let hooks = std::mem::take(&mut *self.cleanup_hooks());
        if !hooks.is_empty() {
            debug!(hooks = hooks.len(), "Running shutdown cleanup");
        }
        for hook in hooks {
            hook();
        }
    }

    pub fn state(&self) -> &ShutdownState {
        &self.state
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Poll until the finished flag is set. Returns `false` if the grace
    /// period ran out first.
    pub async fn wait_for_finish(&self) -> bool {
        let wait = async {
            while !self.state.is_finished() {
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        match self.grace_period {
            Some(grace_period) => tokio::time::timeout(grace_period, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    /// Request shutdown and wait for the workers to report finished
    pub async fn handle_shutdown(&self) -> bool {
        info!("Caught signal to shutdown");
        self.state.request_shutdown();

        let finished = self.wait_for_finish().await;
        if !finished {
            warn!(
                grace_period_ms = self.grace_period.map(|g| g.as_millis() as u64),
                "Workers did not finish within the grace period"
            );
        }
        self.run_cleanup();
        if finished {
            info!("Finished shutdown");
        }
        finished
    }

    /// Wait for SIGINT or SIGTERM, then run [`ShutdownCoordinator::handle_shutdown`]
    pub async fn run(self) -> bool {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Like [`ShutdownCoordinator::run`], additionally triggered when
    /// `trigger` completes
    pub async fn run_until<F>(self, trigger: F) -> bool
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = termination_signal() => {}
            _ = trigger => {
                info!("Shutdown triggered by application");
            }
        }
        self.handle_shutdown().await
    }

    /// Run the coordinator on its own task
    pub fn spawn(self) -> JoinHandle<bool> {
        tokio::spawn(self.run())
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state)
            .field("poll_interval", &self.poll_interval)
            .field("grace_period", &self.grace_period)
            .field("cleanup_hooks", &self.cleanup_hooks().len())
            .finish()
    }
}

async fn termination_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT (Ctrl+C)"),
            Err(e) => {
                error!(error = %e, "Failed to install Ctrl+C signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
