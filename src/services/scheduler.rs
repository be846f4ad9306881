//! Periodic driver for reconciliation and the summary job.
//!
//! Both jobs share one thread, so a run in progress can never overlap another;
//! ticks that elapse meanwhile collapse into a single catch-up run.

use log::{error, info, warn};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::client::HttpFeedClient;
use crate::db::store::StormStore;
use crate::services::reconcile::reconcile;
use crate::services::summary::build_summary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Reconcile,
    Summary,
}

/// Steady cadence for one job.
#[derive(Debug, Clone)]
pub struct Cadence {
    interval: Duration,
    next_due: Instant,
}

impl Cadence {
    /// First run is due immediately.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Cadence {
            interval,
            next_due: now,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    /// Advance past a finished run. Returns how many ticks were coalesced
    /// because the run overran them.
    pub fn complete(&mut self, now: Instant) -> u32 {
        self.next_due += self.interval;
        let mut coalesced = 0;
        while self.next_due <= now {
            self.next_due += self.interval;
            coalesced += 1;
        }
        coalesced
    }
}

pub struct Schedule {
    jobs: Vec<(Job, Cadence)>,
}

impl Schedule {
    pub fn new(reconcile_every: Option<Duration>, summary_every: Option<Duration>, now: Instant) -> Self {
        let jobs = [(Job::Reconcile, reconcile_every), (Job::Summary, summary_every)]
            .into_iter()
            .filter_map(|(job, every)| every.map(|interval| (job, Cadence::new(interval, now))))
            .collect();
        Schedule { jobs }
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs due at `now`, reconcile first.
    pub fn due(&self, now: Instant) -> Vec<Job> {
        self.jobs
            .iter()
            .filter(|(_, cadence)| cadence.is_due(now))
            .map(|(job, _)| *job)
            .collect()
    }

    pub fn complete(&mut self, job: Job, now: Instant) -> u32 {
        self.jobs
            .iter_mut()
            .find(|(j, _)| *j == job)
            .map(|(_, cadence)| cadence.complete(now))
            .unwrap_or(0)
    }

    /// Time left until the earliest job is due.
    pub fn sleep_for(&self, now: Instant) -> Option<Duration> {
        self.jobs
            .iter()
            .map(|(_, cadence)| cadence.next_due().saturating_duration_since(now))
            .min()
    }
}

/// Run one job to completion. Fatal feed errors were already logged at the
/// run boundary; the next tick starts from scratch.
pub fn run_job<S: StormStore + ?Sized>(store: &mut S, feed: &HttpFeedClient, media_root: &Path, job: Job) {
    feed.refresh();
    let started = Instant::now();
    let ok = match job {
        Job::Reconcile => reconcile(store, feed, media_root).is_ok(),
        Job::Summary => build_summary(store, feed, media_root).is_ok(),
    };
    if ok {
        info!("Scheduler: {:?} finished in {}ms", job, started.elapsed().as_millis());
    } else {
        error!("Scheduler: {:?} aborted after {}ms", job, started.elapsed().as_millis());
    }
}

pub fn run_loop<S: StormStore + ?Sized>(
    store: &mut S,
    feed: &HttpFeedClient,
    media_root: &Path,
    mut schedule: Schedule,
) -> Result<(), String> {
    if schedule.is_empty() {
        return Err("Both reconciliation and summary jobs are disabled; nothing to schedule".to_string());
    }
    loop {
        for job in schedule.due(Instant::now()) {
            run_job(store, feed, media_root, job);
            let coalesced = schedule.complete(job, Instant::now());
            if coalesced > 0 {
                warn!("Scheduler: {:?} overran its interval; coalesced {} tick(s)", job, coalesced);
            }
        }

        if let Some(wait) = schedule.sleep_for(Instant::now()) {
            thread::sleep(wait);
        }
    }
}
