//! # timer
//!
//! why: give the engine timers it can cancel instead of callbacks that reschedule themselves
//! relations: owned by engine.rs
//! what: ScheduledTask (abort on stop or drop), randomized election timeout

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use raft_core::RaftConfig;
use tokio::task::JoinHandle;
use tracing::trace;

/// A spawned background task that is aborted when stopped or dropped
#[derive(Debug)]
pub struct ScheduledTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `future` on the current tokio runtime
    pub fn spawn<F>(name: &'static str, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(future),
        }
    }

    /// Run `f` once after `delay`
    pub fn after<F>(name: &'static str, delay: Duration, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(name, async move {
            tokio::time::sleep(delay).await;
            f();
        })
    }

    /// Run `f` every `period`, first right away, until it returns false
    pub fn every<F>(name: &'static str, period: Duration, mut f: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        Self::spawn(name, async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !f() {
                    break;
                }
            }
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn stop(&self) {
        if !self.handle.is_finished() {
            trace!(task = self.name, "stopping");
        }
        self.handle.abort();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Uniformly random duration in `[election_timeout_min, election_timeout_max]`
pub fn election_timeout(config: &RaftConfig) -> Duration {
    let millis = rand::thread_rng().gen_range(config.election_timeout_min..=config.election_timeout_max);
    Duration::from_millis(millis)
}
