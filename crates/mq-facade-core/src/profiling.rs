//! Start/stop timers for logging how long operations take.
//!
//! Timers are keyed by the calling thread and a tag, so the same tag can be
//! timed concurrently from different threads. Output and misuse reports go to
//! the `profiling` tracing target. Misuse (starting a running timer, stopping
//! one that never started) is logged and otherwise ignored.

use crate::config::ProfilingConfig;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{error, info};

#[cfg(test)]
#[path = "profiling_tests.rs"]
mod tests;

/// Tracing target used for all profiler output
pub const PROFILING_TARGET: &str = "profiling";

/// Tag-keyed operation timer
#[derive(Debug)]
pub struct Profiler {
    enabled: bool,
    configured: bool,
    reported_unconfigured: AtomicBool,
    timers: Mutex<HashMap<String, Instant>>,
}

impl Profiler {
    pub fn new(config: &ProfilingConfig) -> Self {
        Self {
            enabled: config.enabled,
            configured: true,
            reported_unconfigured: AtomicBool::new(false),
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Profiler without configuration; the first call reports that and
    /// every call is ignored
    pub fn unconfigured() -> Self {
        Self {
            enabled: false,
            configured: false,
            reported_unconfigured: AtomicBool::new(false),
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.configured && self.enabled
    }

    /// Start the timer for `tag` on the current thread
    pub fn start(&self, tag: &str) -> bool {
        self.start_key(timer_key(tag))
    }

    /// Stop the timer for `tag` on the current thread and log the elapsed time
    pub fn stop(&self, tag: &str) -> Option<Duration> {
        self.stop_key(&timer_key(tag))
    }

    /// Time a synchronous operation
    pub fn profile<T>(&self, tag: &str, operation: impl FnOnce() -> T) -> T {
        let key = timer_key(tag);
        let started = self.start_key(key.clone());
        let result = operation();
        if started {
            self.stop_key(&key);
        }
        result
    }

    /// Time a future. The timer key is taken when the call is made, so the
    /// future may resume on a different thread.
    pub async fn profile_async<F: Future>(&self, tag: &str, operation: F) -> F::Output {
        let key = timer_key(tag);
        let started = self.start_key(key.clone());
        let result = operation.await;
        if started {
            self.stop_key(&key);
        }
        result
    }

    fn active(&self) -> bool {
        if !self.configured {
            if !self.reported_unconfigured.swap(true, Ordering::Relaxed) {
                error!(target: PROFILING_TARGET, "Profiler not initialized; profiling calls are ignored");
            }
            return false;
        }
        self.enabled
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start_key(&self, key: String) -> bool {
        if !self.active() {
            return false;
        }

        let mut timers = self.timers();
        if timers.contains_key(&key) {
            error!(target: PROFILING_TARGET, timer = %key, "Timer already started");
            return false;
        }
        timers.insert(key, Instant::now());
        true
    }

    fn stop_key(&self, key: &str) -> Option<Duration> {
        if !self.active() {
            return None;
        }

        let Some(started_at) = self.timers().remove(key) else {
            error!(target: PROFILING_TARGET, timer = %key, "Timer was never started");
            return None;
        };

        let elapsed = started_at.elapsed();
        info!(
            target: PROFILING_TARGET,
            timer = %key,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Timer stopped"
        );
        Some(elapsed)
    }
}

fn timer_key(tag: &str) -> String {
    format!("{:?} - {}", std::thread::current().id(), tag)
}
