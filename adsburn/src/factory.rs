//! The production-line scheduler.
//!
//! A factory run wires four moving parts together:
//!
//! - the **sighting scanner** ([`crate::scan`]) feeding advertisements in,
//! - a bounded **job queue** of devices waiting for a dongle,
//! - an **idle pool** of dongle ports,
//! - one blocking **worker** per dispatched job, owning its port for the
//!   job's lifetime.
//!
//! Every worker iteration ends in one of three [`Outcome`]s. SUCCESS
//! retires the device. REBURN clears its checkpoint and puts it straight
//! back on the queue. RELEASE frees the device for re-sighting with its
//! checkpoint intact, so whichever dongle sees it next resumes where this
//! one stopped.
//!
//! Shared state is deliberately small: the processing set and the progress
//! map live behind a single mutex and are only touched for lookups and
//! updates, never across I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use btleplug::platform::Adapter;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::burner::Burner;
use crate::error::{Error, Result};
use crate::event::{Reporter, SYSTEM_PORT};
use crate::image::AdsImage;
use crate::scan::{self, Sighting};
use crate::transport::{DongleLink, Link};
use crate::verifier::{self, ReadTimings, VerifyOutcome};

/// Upper bound on queued jobs.
const JOB_QUEUE_CAP: usize = 100;

/// A factory run configuration.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Path of the audio image file.
    pub file: String,
    /// Advertised-name substrings identifying target devices.
    pub target_ids: Vec<String>,
    /// Dongle serial ports available to this run.
    pub ports: Vec<String>,
}

/// Per-device resume state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Bytes of the encoded image already acknowledged by the device.
    pub offset: usize,
    /// Whether the device passed verification.
    pub done: bool,
}

/// One unit of work: flash (or finish flashing) a single device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Advertised device name at sighting time.
    pub name: String,
    /// Device MAC address.
    pub mac: String,
    /// Resume offset into the encoded image.
    pub current_offset: usize,
    /// Skip the write phase and verify only.
    pub skip_write: bool,
    /// This job was queued by a REBURN outcome.
    pub is_reburn: bool,
}

/// Terminal result of one worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Verified; the device is finished.
    Success,
    /// Content mismatch; rewrite from offset zero.
    Reburn,
    /// Could not finish; free the device for another sighting.
    Release,
}

/// Worker pacing knobs. Defaults are the production values; tests shrink
/// them.
#[derive(Debug, Clone)]
pub struct WorkerTimings {
    /// Grace period for the device reboot after a completed write.
    pub reboot_grace: Duration,
    /// Reconnect attempts in the verify phase.
    pub reconnect_attempts: usize,
    /// Gap between reconnect attempts.
    pub reconnect_gap: Duration,
    /// Paged-read pacing.
    pub read: ReadTimings,
}

impl Default for WorkerTimings {
    fn default() -> Self {
        Self {
            reboot_grace: Duration::from_secs(15),
            reconnect_attempts: 5,
            reconnect_gap: Duration::from_secs(2),
            read: ReadTimings::default(),
        }
    }
}

/// Mutex-guarded scheduler state.
#[derive(Debug, Default)]
pub(crate) struct FactoryState {
    /// MACs currently bound to a job.
    processing: HashSet<String>,
    /// Checkpoint per MAC ever sighted. A missing entry reads as
    /// `{offset: 0, done: false}`.
    progress: HashMap<String, Checkpoint>,
}

impl FactoryState {
    fn checkpoint(&self, mac: &str) -> Checkpoint {
        self.progress.get(mac).copied().unwrap_or_default()
    }

    /// Gate a sighting into a job.
    ///
    /// Finished and in-flight devices are dropped. An admitted MAC enters
    /// the processing set in the same critical section, which is what keeps
    /// a MAC from ever riding two jobs at once.
    fn admit(&mut self, name: &str, mac: &str) -> Option<Job> {
        let checkpoint = self.checkpoint(mac);
        if checkpoint.done || self.processing.contains(mac) {
            return None;
        }
        self.processing.insert(mac.to_string());
        Some(Job {
            name: name.to_string(),
            mac: mac.to_string(),
            current_offset: checkpoint.offset,
            skip_write: false,
            is_reburn: false,
        })
    }

    fn release(&mut self, mac: &str) {
        self.processing.remove(mac);
    }
}

/// Shared context handed to the scanner, the dispatcher, and every worker.
pub(crate) struct FactoryCore {
    pub(crate) image: Arc<AdsImage>,
    pub(crate) reporter: Reporter,
    pub(crate) state: Mutex<FactoryState>,
    pub(crate) job_tx: mpsc::Sender<Job>,
    pub(crate) idle_tx: mpsc::UnboundedSender<String>,
    pub(crate) timings: WorkerTimings,
}

impl FactoryCore {
    fn state(&self) -> MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle one sighting: gate it and queue the job.
    fn admit_sighting(&self, sighting: &Sighting) {
        let job = {
            let mut state = self.state();
            let Some(job) = state.admit(&sighting.name, &sighting.mac) else {
                return;
            };
            job
        };
        debug!("admitted {} ({}) at offset {}", job.name, job.mac, job.current_offset);
        self.enqueue(job);
    }

    /// Queue a job, rolling the MAC back out of the processing set if the
    /// queue has no room. The device is simply re-admitted on a later
    /// sighting.
    fn enqueue(&self, job: Job) {
        if let Err(e) = self.job_tx.try_send(job) {
            let job = match e {
                mpsc::error::TrySendError::Full(job)
                | mpsc::error::TrySendError::Closed(job) => job,
            };
            warn!("job queue unavailable, dropping {}", job.mac);
            self.state().release(&job.mac);
        }
    }

    fn persist(&self, mac: &str, offset: usize, done: bool) {
        self.state()
            .progress
            .insert(mac.to_string(), Checkpoint { offset, done });
    }

    fn clear_progress(&self, mac: &str) {
        self.state().progress.remove(mac);
    }
}

/// A configured factory, ready to start.
pub struct Factory {
    core: Arc<FactoryCore>,
    config: FactoryConfig,
    job_rx: mpsc::Receiver<Job>,
    idle_rx: mpsc::UnboundedReceiver<String>,
}

/// Handle for stopping a running factory.
pub struct FactoryHandle {
    quit: watch::Sender<bool>,
    reporter: Reporter,
}

impl FactoryHandle {
    /// Signal every factory task to wind down.
    ///
    /// Cooperative: the scanner stops at its next sweep, the dispatcher at
    /// its next receive, and in-flight workers run to their next timeout.
    pub fn stop(&self) {
        let _ = self.quit.send(true);
        self.reporter.log(SYSTEM_PORT, "", "factory stopped");
    }
}

impl Factory {
    /// Load the image and build the factory for `config`.
    pub fn new(config: FactoryConfig, reporter: Reporter) -> Result<Self> {
        if config.ports.is_empty() {
            return Err(Error::NoDongle);
        }
        if config.target_ids.is_empty() {
            return Err(Error::Config("no target ids configured".into()));
        }
        let image = Arc::new(AdsImage::from_file(&config.file)?);

        let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_CAP);
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let core = Arc::new(FactoryCore {
            image,
            reporter,
            state: Mutex::new(FactoryState::default()),
            job_tx,
            idle_tx,
            timings: WorkerTimings::default(),
        });
        Ok(Self {
            core,
            config,
            job_rx,
            idle_rx,
        })
    }

    /// Start the scanner and dispatcher tasks.
    pub fn start(self, adapter: Adapter) -> FactoryHandle {
        let (quit_tx, quit_rx) = watch::channel(false);

        for port in &self.config.ports {
            let _ = self.core.idle_tx.send(port.clone());
        }
        self.core.reporter.log(
            SYSTEM_PORT,
            "",
            format!("factory started (targets: {:?})", self.config.target_ids),
        );

        let scan_core = Arc::clone(&self.core);
        let targets = self.config.target_ids.clone();
        let scan_quit = quit_rx.clone();
        tokio::spawn(async move {
            scan_core.reporter.log(SYSTEM_PORT, "", "scanner started");
            let sighting_core = Arc::clone(&scan_core);
            let result = scan::run_sighting_scan(adapter, targets, scan_quit, move |sighting| {
                sighting_core.admit_sighting(&sighting);
            })
            .await;
            if let Err(e) = result {
                scan_core
                    .reporter
                    .error(SYSTEM_PORT, format!("BLE scan failed: {e}"));
            }
        });

        tokio::spawn(run_dispatcher(
            Arc::clone(&self.core),
            self.job_rx,
            self.idle_rx,
            quit_rx,
        ));

        FactoryHandle {
            quit: quit_tx,
            reporter: self.core.reporter.clone(),
        }
    }
}

/// Pair queued jobs with idle dongles and spawn a worker for each.
async fn run_dispatcher(
    core: Arc<FactoryCore>,
    mut job_rx: mpsc::Receiver<Job>,
    mut idle_rx: mpsc::UnboundedReceiver<String>,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            changed = quit.changed() => {
                if changed.is_err() || *quit.borrow() {
                    break;
                }
                continue;
            },
            maybe_job = job_rx.recv() => {
                let Some(job) = maybe_job else { break };
                job
            },
        };

        let port = tokio::select! {
            changed = quit.changed() => {
                if changed.is_err() || *quit.borrow() {
                    break;
                }
                continue;
            },
            maybe_port = idle_rx.recv() => {
                let Some(port) = maybe_port else { break };
                port
            },
        };

        let worker_core = Arc::clone(&core);
        tokio::task::spawn_blocking(move || run_worker(&worker_core, &port, job));
    }
    info!("dispatcher stopped");
}

/// Execute one job on one dongle, then hand the port back.
fn run_worker(core: &FactoryCore, port: &str, mut job: Job) {
    let mut link = DongleLink::new(port);
    let outcome = execute_job(&mut link, core, port, &mut job);
    link.disconnect();
    apply_outcome(core, port, job, outcome);
}

/// The worker body: write phase, reboot grace, verify phase.
pub(crate) fn execute_job<L: Link>(
    link: &mut L,
    core: &FactoryCore,
    port: &str,
    job: &mut Job,
) -> Outcome {
    let image = &core.image;
    let reporter = &core.reporter;
    let total = image.encoded_len();

    if job.current_offset >= total && total > 0 {
        // a previous worker finished the write; only verification is left
        job.skip_write = true;
        reporter.log(
            port,
            &job.mac,
            format!("{}: write already complete, verifying only", job.name),
        );
    } else if job.is_reburn {
        reporter.log(port, &job.mac, format!("reburning {}", job.name));
    } else {
        reporter.log(port, &job.mac, format!("job started: {}", job.name));
    }
    reporter.progress(port, &job.mac, 0);

    if !job.skip_write {
        let write_result = {
            let mac = job.mac.clone();
            let mut checkpoint = |at: usize| core.persist(&mac, at, false);
            let mut burner = Burner::new(link, image, reporter, port, &job.mac);
            burner
                .connect()
                .and_then(|()| burner.unlock())
                .and_then(|()| burner.init_checksum_region())
                .and_then(|()| burner.write_image(&mut job.current_offset, &mut checkpoint))
        };
        if let Err(e) = write_result {
            core.persist(&job.mac, job.current_offset, false);
            reporter.log(port, &job.mac, format!("write failed: {e}"));
            return Outcome::Release;
        }

        // Persist completion before finalise/reboot: if anything after this
        // point fails, the next worker must skip the write, not redo it.
        core.persist(&job.mac, total, false);

        if let Err(e) =
            Burner::new(link, image, reporter, port, &job.mac).finalize_and_reboot()
        {
            reporter.log(port, &job.mac, format!("finalise failed: {e}"));
            return Outcome::Release;
        }
        reporter.progress(port, &job.mac, 100);

        link.disconnect();
        reporter.log(
            port,
            &job.mac,
            format!(
                "device rebooting, waiting {}s...",
                core.timings.reboot_grace.as_secs()
            ),
        );
        thread::sleep(core.timings.reboot_grace);
    }

    let mut connected = false;
    for _ in 0..core.timings.reconnect_attempts {
        if link.connect(&job.mac).is_ok() {
            connected = true;
            break;
        }
        thread::sleep(core.timings.reconnect_gap);
    }
    if !connected {
        reporter.log(port, &job.mac, "verify-phase reconnect timed out, releasing job");
        return Outcome::Release;
    }

    match verifier::verify_device(link, image, reporter, port, &job.mac, &core.timings.read) {
        Err(e) => {
            reporter.log(port, &job.mac, format!("read-back failed ({e}), releasing job"));
            Outcome::Release
        },
        Ok(VerifyOutcome::Mismatch) => {
            reporter.log(port, &job.mac, "content mismatch, scheduling reburn");
            core.clear_progress(&job.mac);
            Outcome::Reburn
        },
        Ok(VerifyOutcome::Match) => {
            Burner::new(link, image, reporter, port, &job.mac).send_final_reboot();
            core.persist(&job.mac, total, true);
            reporter.log(port, &job.mac, "job complete");
            Outcome::Success
        },
    }
}

/// Apply an outcome to the shared state and return the port to the pool.
pub(crate) fn apply_outcome(core: &FactoryCore, port: &str, job: Job, outcome: Outcome) {
    match outcome {
        Outcome::Success => {
            core.state().release(&job.mac);
        },
        Outcome::Reburn => {
            // Re-admit through the same gate as a sighting, inside one
            // critical section, so the MAC never rides two jobs at once.
            let requeued = {
                let mut state = core.state();
                state.release(&job.mac);
                state.admit(&job.name, &job.mac)
            };
            if let Some(mut next) = requeued {
                next.is_reburn = true;
                core.enqueue(next);
            }
        },
        Outcome::Release => {
            core.state().release(&job.mac);
            core.reporter.log(port, &job.mac, "job released");
        },
    }
    let _ = core.idle_tx.send(port.to_string());
}
