//! Periodic per-CA background jobs.
//!
//! Three thread-based timers: the CRL tick, the expired-certificate
//! purge and the suspended-certificate sweep. A tick that fires while
//! the previous run is still busy is skipped, not queued. Start times
//! are jittered so that many CAs in one process do not align.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use clokwerk::{ScheduleHandle, Scheduler, TimeUnits};
use log::{error, warn};
use rand::Rng;

use crate::constants::{
    CRL_TICK_JITTER_SECONDS, CRL_TICK_SECONDS, EXPIRED_PURGE_INTERVAL_SECONDS,
    JOB_START_JITTER_SECONDS, SUSPENDED_REVOKE_INTERVAL_SECONDS,
};
use crate::server::ca::Ca;

//------------ SkippingScheduler ---------------------------------------------

struct SkippingScheduler;

impl SkippingScheduler {
    fn run(
        seconds: u32,
        jitter_seconds: u64,
        name: &'static str,
        mut job: impl FnMut() + Send + 'static,
    ) -> ScheduleHandle {
        let lock = RunLock::new();
        let start_after =
            Instant::now() + Duration::from_secs(rand::rng().random_range(0..=jitter_seconds));

        let mut scheduler = Scheduler::new();
        scheduler.every(seconds.seconds()).run(move || {
            if Instant::now() < start_after {
                return;
            }
            if lock.is_running() {
                warn!("job '{}' is still running, skipping this tick", name);
            } else {
                lock.run();
                job();
                lock.done();
            }
        });

        scheduler.watch_thread(Duration::from_millis(100))
    }
}

struct RunLock {
    state: RwLock<bool>,
}

impl RunLock {
    fn new() -> Self {
        RunLock {
            state: RwLock::new(false),
        }
    }

    fn run(&self) {
        if let Ok(mut state) = self.state.write() {
            *state = true;
        }
    }

    fn done(&self) {
        if let Ok(mut state) = self.state.write() {
            *state = false;
        }
    }

    fn is_running(&self) -> bool {
        self.state.read().map(|state| *state).unwrap_or(false)
    }
}

//------------ CaJobs --------------------------------------------------------

/// Handles to the running background jobs of one CA. Dropping the value
/// stops the timer threads.
pub struct CaJobs {
    #[allow(dead_code)]
    handles: Vec<ScheduleHandle>,
}

impl CaJobs {
    pub fn start(ca: Arc<Ca>) -> Self {
        let mut handles = Vec::new();

        let tick_ca = ca.clone();
        handles.push(SkippingScheduler::run(
            CRL_TICK_SECONDS,
            CRL_TICK_JITTER_SECONDS,
            "crl_tick",
            move || {
                if let Err(e) = tick_ca.crl_tick() {
                    error!("ca {}: scheduled CRL generation failed: {}", tick_ca.ident(), e);
                }
            },
        ));

        let purge_ca = ca.clone();
        handles.push(SkippingScheduler::run(
            EXPIRED_PURGE_INTERVAL_SECONDS,
            JOB_START_JITTER_SECONDS,
            "purge_expired_certs",
            move || {
                if let Err(e) = purge_ca.purge_expired_certs() {
                    error!("ca {}: expired-certificate purge failed: {}", purge_ca.ident(), e);
                }
            },
        ));

        handles.push(SkippingScheduler::run(
            SUSPENDED_REVOKE_INTERVAL_SECONDS,
            JOB_START_JITTER_SECONDS,
            "revoke_suspended_certs",
            move || {
                if let Err(e) = ca.revoke_suspended_sweep() {
                    error!("ca {}: suspended-certificate sweep failed: {}", ca.ident(), e);
                }
            },
        ));

        CaJobs { handles }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_lock_round_trip() {
        let lock = RunLock::new();
        assert!(!lock.is_running());
        lock.run();
        assert!(lock.is_running());
        lock.done();
        assert!(!lock.is_running());
    }
}
