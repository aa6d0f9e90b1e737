//! Periodic integrity sweep worker.
//!
//! The monitor wakes on a fixed duty cycle anchored to UTC midnight,
//! sweeps the head-bag staging cache and then the data cache until no
//! objects are due, rewrites the status document atomically, and goes
//! back to sleep. Interrupts are honored at the next sleep or batch
//! boundary; the `once` flag can be toggled at runtime to make the
//! current cycle the last one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use pdrcache_core::{iso8601_utc, utc_midnight, ClockSource};

use crate::config::MonitorConfig;
use crate::integrity::IntegrityMonitor;

/// How many deleted ids a cycle's log line shows before truncating.
const LOGGED_DELETIONS: usize = 5;

/// Errors raised starting or running the monitor worker.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("monitor duty cycle must be positive, got {0} ms")]
    BadDutyCycle(i64),
    #[error("monitor status I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("monitor status is not valid JSON: {0}")]
    BadStatus(#[from] serde_json::Error),
}

/// Where the worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Created, not yet started.
    Idle,
    /// Waiting until the epoch-ms instant for the next cycle.
    Sleeping(i64),
    /// Running a sweep cycle.
    Checking,
    /// Interrupt observed; winding down.
    Stopping,
    /// The worker task has ended.
    Exited,
}

/// The status document rewritten after every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    /// Epoch-ms when the last cycle started.
    pub last_ran: i64,
    pub last_ran_date: String,
    /// Epoch-ms when the last cycle finished checking.
    pub last_checked: i64,
    pub last_checked_date: String,
    /// Objects examined in the last cycle.
    pub filecount: i64,
    /// Ids deleted by the last cycle, in full.
    pub deleted: Vec<String>,
    /// Whether a monitor worker is live; set at read time.
    #[serde(default)]
    pub running: bool,
}

/// Reads the status document, stamping in the caller's `running` flag.
///
/// # Errors
///
/// Fails when the file is missing or not valid JSON.
pub fn read_status(path: impl AsRef<Path>, running: bool) -> Result<MonitorStatus, MonitorError> {
    let text = std::fs::read_to_string(path)?;
    let mut status: MonitorStatus = serde_json::from_str(&text)?;
    status.running = running;
    Ok(status)
}

/// Next cycle start: UTC midnight + offset, advanced past `now` in
/// duty-cycle steps.
fn next_cycle_start(now: i64, duty_cycle_ms: i64, start_offset_ms: i64) -> i64 {
    let mut start = utc_midnight(now) + start_offset_ms;
    if start <= now {
        start = now - (now - start).rem_euclid(duty_cycle_ms) + duty_cycle_ms;
    }
    start
}

/// Periodic sweep scheduler over two [`IntegrityMonitor`]s.
pub struct MonitorWorker {
    headbag_monitor: Arc<IntegrityMonitor>,
    data_monitor: Arc<IntegrityMonitor>,
    status_path: PathBuf,
    config: MonitorConfig,
    clock: Arc<dyn ClockSource>,
    state: Arc<ArcSwap<MonitorState>>,
    interrupt: watch::Sender<bool>,
    once: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl MonitorWorker {
    #[must_use]
    pub fn new(
        headbag_monitor: Arc<IntegrityMonitor>,
        data_monitor: Arc<IntegrityMonitor>,
        status_path: impl Into<PathBuf>,
        config: MonitorConfig,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let (interrupt, _) = watch::channel(false);
        let once = Arc::new(AtomicBool::new(config.once));
        Self {
            headbag_monitor,
            data_monitor,
            status_path: status_path.into(),
            config,
            clock,
            state: Arc::new(ArcSwap::from_pointee(MonitorState::Idle)),
            interrupt,
            once,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MonitorState {
        **self.state.load()
    }

    /// Whether the sweep task is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Toggles one-shot mode; switching it on ends the worker after the
    /// current cycle.
    pub fn set_once(&self, once: bool) {
        self.once.store(once, Ordering::SeqCst);
    }

    /// Requests exit at the next sleep or batch boundary.
    pub fn interrupt(&self) {
        let _ = self.interrupt.send(true);
    }

    /// Spawns the sweep loop, unless one is already running.
    ///
    /// # Errors
    ///
    /// Rejects a non-positive duty cycle before spawning anything.
    pub fn start(&self) -> Result<Option<JoinHandle<()>>, MonitorError> {
        if self.config.duty_cycle_ms <= 0 {
            return Err(MonitorError::BadDutyCycle(self.config.duty_cycle_ms));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let _ = self.interrupt.send(false);

        // The sweep's due-selection reads the grace period from the
        // inventories; apply the configured value to both.
        self.headbag_monitor
            .set_check_grace(self.config.grace_period_ms);
        self.data_monitor
            .set_check_grace(self.config.grace_period_ms);

        let task = MonitorTask {
            headbag_monitor: self.headbag_monitor.clone(),
            data_monitor: self.data_monitor.clone(),
            status_path: self.status_path.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            state: self.state.clone(),
            interrupt: self.interrupt.subscribe(),
            once: self.once.clone(),
            running: self.running.clone(),
        };
        Ok(Some(tokio::spawn(task.run())))
    }
}

struct MonitorTask {
    headbag_monitor: Arc<IntegrityMonitor>,
    data_monitor: Arc<IntegrityMonitor>,
    status_path: PathBuf,
    config: MonitorConfig,
    clock: Arc<dyn ClockSource>,
    state: Arc<ArcSwap<MonitorState>>,
    interrupt: watch::Receiver<bool>,
    once: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl MonitorTask {
    async fn run(mut self) {
        loop {
            let now = self.clock.now_ms();
            let next = next_cycle_start(
                now,
                self.config.duty_cycle_ms,
                self.config.start_offset_ms,
            );
            self.state.store(Arc::new(MonitorState::Sleeping(next)));

            let wait = Duration::from_millis(u64::try_from(next - now).unwrap_or(0));
            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                changed = self.interrupt.changed() => {
                    // A closed channel means the controller is gone;
                    // treat it as an interrupt.
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *self.interrupt.borrow() {
                break;
            }

            self.state.store(Arc::new(MonitorState::Checking));
            self.run_cycle().await;

            if self.once.load(Ordering::SeqCst) || *self.interrupt.borrow() {
                break;
            }
        }

        self.state.store(Arc::new(MonitorState::Stopping));
        self.running.store(false, Ordering::SeqCst);
        self.state.store(Arc::new(MonitorState::Exited));
        info!("integrity monitor worker exited");
    }

    async fn run_cycle(&self) {
        let cycle_start = self.clock.now_ms();
        let mut deleted = Vec::new();
        let mut examined: usize = 0;

        // Head-bag staging cache first, then the data cache, each until
        // no objects are due.
        for monitor in [&self.headbag_monitor, &self.data_monitor] {
            examined += self.sweep(monitor, &mut deleted).await;
            if *self.interrupt.borrow() {
                break;
            }
        }

        let cycle_end = self.clock.now_ms();
        let status = MonitorStatus {
            last_ran: cycle_start,
            last_ran_date: iso8601_utc(cycle_start),
            last_checked: cycle_end,
            last_checked_date: iso8601_utc(cycle_end),
            filecount: i64::try_from(examined).unwrap_or(i64::MAX),
            deleted: deleted.clone(),
            running: false,
        };
        if let Err(e) = write_status(&self.status_path, &status).await {
            error!(error = %e, "could not write monitor status document");
        }

        if deleted.len() > LOGGED_DELETIONS {
            info!(
                checked = examined,
                "integrity cycle deleted {} objects, including: {}",
                deleted.len(),
                deleted[..LOGGED_DELETIONS].join(", ")
            );
        } else if deleted.is_empty() {
            info!(checked = examined, "integrity cycle complete");
        } else {
            info!(
                checked = examined,
                "integrity cycle deleted: {}",
                deleted.join(", ")
            );
        }
    }

    async fn sweep(&self, monitor: &IntegrityMonitor, deleted: &mut Vec<String>) -> usize {
        let batch = self.config.max_objects_per_batch;
        let mut examined = 0;
        loop {
            if *self.interrupt.borrow() {
                break;
            }
            match monitor.find_corrupted_objects(batch, deleted, true).await {
                Ok(n) => {
                    examined += n;
                    if n < batch {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "integrity sweep batch failed");
                    break;
                }
            }
        }
        examined
    }
}

/// Atomically replaces the status document (write temp, then rename), so
/// readers never observe a torn write.
async fn write_status(path: &Path, status: &MonitorStatus) -> Result<(), MonitorError> {
    let json = serde_json::to_vec_pretty(status)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
