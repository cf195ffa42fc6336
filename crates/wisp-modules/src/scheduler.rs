//! Recurring Job Scheduler
//!
//! Polls the job store on a fixed cadence and hands every due job to the
//! dispatcher on its own task. Rescheduling happens before the dispatch is
//! awaited, so a slow run can never get the same job re-selected on the
//! following tick. Fan-out is bounded by a semaphore.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use wisp_common::{Clock, ExecutionMode, ModuleId, UserId};

use crate::config::ModulesConfig;
use crate::dispatch::{DispatchError, Dispatcher, ExecutionReport, ExecutionRequest};

/// Fallback interval when a schedule expression cannot be parsed. Keeps a
/// malformed job making forward progress instead of re-triggering tightly.
const FALLBACK_INTERVAL_HOURS: i64 = 1;

/// A recurring trigger for one module run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub user_id: UserId,
    pub module_id: ModuleId,
    /// Duration literal ("10m", "1h30m") or minute-interval cron
    /// shorthand ("*/5 * * * *").
    pub schedule: String,
    pub input: serde_json::Map<String, serde_json::Value>,
    pub is_enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Scheduler faults surfaced to operators.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job not found")]
    NotFound,
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Persisted job set. The scheduler owns the run timestamps; owners manage
/// the enabled flag and lifetime.
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, ScheduledJob>>,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    /// Store with an injected clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Register a recurring job; the first run is one interval out.
    pub fn create(
        &self,
        user: UserId,
        module: &str,
        schedule: &str,
        input: serde_json::Map<String, serde_json::Value>,
    ) -> ScheduledJob {
        let now = self.clock.now();
        let job = ScheduledJob {
            id: Uuid::new_v4(),
            user_id: user,
            module_id: module.to_owned(),
            schedule: schedule.to_owned(),
            input,
            is_enabled: true,
            last_run_at: None,
            next_run_at: next_run_after(schedule, now),
            created_at: now,
        };
        self.jobs.write().insert(job.id, job.clone());
        info!(job = %job.id, module, schedule, "scheduled job created");
        job
    }

    /// Fetch a job by id.
    pub fn get(&self, id: Uuid) -> Option<ScheduledJob> {
        self.jobs.read().get(&id).cloned()
    }

    /// Enabled jobs whose next run is due at `now`.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<ScheduledJob> {
        self.jobs
            .read()
            .values()
            .filter(|j| j.is_enabled && j.next_run_at <= now)
            .cloned()
            .collect()
    }

    /// Flip a job's enabled flag without touching its history.
    pub fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or(SchedulerError::NotFound)?;
        job.is_enabled = enabled;
        Ok(())
    }

    /// Delete a job.
    pub fn remove(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.jobs
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(SchedulerError::NotFound)
    }

    fn mark_run(&self, id: Uuid, last_run: DateTime<Utc>, next_run: DateTime<Utc>) {
        if let Some(job) = self.jobs.write().get_mut(&id) {
            job.last_run_at = Some(last_run);
            job.next_run_at = next_run;
        }
    }
}

/// Restartable polling service driving scheduled module runs.
pub struct Scheduler {
    jobs: Arc<JobStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    inflight: Arc<Semaphore>,
    poll_interval: std::time::Duration,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    /// Scheduler over the given store and dispatcher.
    pub fn new(
        jobs: Arc<JobStore>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
        config: &ModulesConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs,
            dispatcher,
            clock,
            inflight: Arc::new(Semaphore::new(config.max_inflight_jobs)),
            poll_interval: config.poll_interval(),
            shutdown,
        }
    }

    /// Polling loop; runs until [`Self::stop`].
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.subscribe();
        info!(interval = ?self.poll_interval, "scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    info!("scheduler stopped");
                    return;
                }
            }
        }
    }

    /// Signal the polling loop to exit. In-flight dispatches finish.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// One poll: reschedule every due job, then dispatch each on its own
    /// task. Never waits for a dispatch to finish.
    pub async fn tick(&self) {
        let now = self.clock.now();
        let due = self.jobs.due(now);
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "dispatching due jobs");

        for job in due {
            // Advance from the stored due time, not from this tick's `now`,
            // so delayed polls do not accumulate drift.
            let next = next_run_after(&job.schedule, job.next_run_at);
            self.jobs.mark_run(job.id, now, next);

            let dispatcher = self.dispatcher.clone();
            let inflight = self.inflight.clone();
            tokio::spawn(async move {
                let _permit = match inflight.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let req = ExecutionRequest {
                    user_id: job.user_id,
                    module_id: job.module_id.clone(),
                    execution_mode: Some(ExecutionMode::Server),
                    input: job.input.clone(),
                };
                match dispatcher.execute(&req).await {
                    Ok(report) if !report.outcome.success() => {
                        warn!(job = %job.id, module = %job.module_id, "scheduled run did not succeed");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(job = %job.id, module = %job.module_id, error = %e, "scheduled run failed");
                    }
                }
            });
        }
    }

    /// Operator-initiated immediate run. Does not touch the job's
    /// next-run-at or last-run-at.
    pub async fn trigger_now(&self, job_id: Uuid) -> Result<ExecutionReport, SchedulerError> {
        let job = self.jobs.get(job_id).ok_or(SchedulerError::NotFound)?;
        info!(job = %job.id, module = %job.module_id, "manual trigger");
        let req = ExecutionRequest {
            user_id: job.user_id,
            module_id: job.module_id,
            execution_mode: Some(ExecutionMode::Server),
            input: job.input,
        };
        Ok(self.dispatcher.execute(&req).await?)
    }
}

/// Next run time for a schedule expression, anchored at `from`.
///
/// Tried in order: duration literal, minute-interval cron shorthand, then a
/// fixed one-hour fallback for anything unparseable.
pub fn next_run_after(schedule: &str, from: DateTime<Utc>) -> DateTime<Utc> {
    if let Some(duration) = parse_duration_literal(schedule) {
        return from + duration;
    }

    if let Some(minutes) = parse_minute_interval(schedule) {
        let step = i64::from(minutes) * 60;
        let ts = from.timestamp();
        // Truncate to the interval boundary, then step; the boundary must
        // strictly advance even when `from` sits exactly on one.
        let next_ts = ts - ts.rem_euclid(step) + step;
        if let Some(next) = DateTime::from_timestamp(next_ts, 0) {
            return next;
        }
    }

    from + Duration::hours(FALLBACK_INTERVAL_HOURS)
}

/// Go-style duration literal: concatenated `<int><unit>` segments with
/// units `h`, `m`, `s`, `ms` ("10m", "1h30m", "90s").
fn parse_duration_literal(s: &str) -> Option<Duration> {
    let s = s.trim();
    let mut chars = s.chars().peekable();
    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut segments = 0;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: i64 = digits.parse().ok()?;
        digits.clear();
        total = total
            + match c {
                'h' => Duration::hours(value),
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    Duration::milliseconds(value)
                }
                'm' => Duration::minutes(value),
                's' => Duration::seconds(value),
                _ => return None,
            };
        segments += 1;
    }

    if segments == 0 || !digits.is_empty() {
        return None;
    }
    Some(total)
}

/// Minute-interval cron shorthand: `*/N * * * *` with N > 0. Only the
/// minute field is interpreted; the remaining fields must be wildcards.
fn parse_minute_interval(s: &str) -> Option<u32> {
    let mut fields = s.split_whitespace();
    let interval: u32 = fields.next()?.strip_prefix("*/")?.parse().ok()?;
    if interval == 0 {
        return None;
    }
    let rest: Vec<&str> = fields.collect();
    if rest.len() != 4 || rest.iter().any(|f| *f != "*") {
        return None;
    }
    Some(interval)
}
