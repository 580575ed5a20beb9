//! Path availability probing on bounded auxiliary threads
//!
//! A reachability check against dead network or removable media can
//! block inside the kernel for minutes. The caller must never be stuck
//! that long: the blocking call runs on a probe thread, the caller
//! waits with a bounded poll and can abandon the probe. An abandoned
//! thread is left to finish on its own (a zombie) because terminating a
//! thread stuck in a kernel call on unreliable media is unsafe; the
//! thread count is capped so zombies cannot pile up without bound.
//!
//! The first probe thread is spawned up front and parked between
//! requests, so the common case pays no thread-creation latency.

use app_fs::{FsError, FsOps, PathMedia};
use crossbeam_channel::{Receiver, Sender};
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Maximum probe threads alive at once, zombies included
pub const PROBE_SLOTS: usize = 30;

/// Silent wait before the caller is told the probe is still running
const PROBE_GRACE: Duration = Duration::from_millis(200);
/// Poll interval while waiting beyond the grace period
const PROBE_POLL: Duration = Duration::from_millis(200);
/// Pause before rescanning when every slot is taken
const SLOTS_BUSY_RETRY: Duration = Duration::from_millis(100);

/// Result of a probe, with cancellation distinct from any path error:
/// an abandoned probe says nothing about whether the path exists
#[derive(Debug)]
pub enum ProbeOutcome {
    Ready,
    Failed(FsError),
    Cancelled,
}

/// Caller-side progress hooks for a probe in flight
pub trait ProbeWait {
    /// The grace period elapsed and the probe is still blocked; show
    /// a "still checking - cancel?" indicator
    fn still_checking(&mut self, path: &Path);

    /// Polled between waits; return true to abandon the probe
    fn cancelled(&mut self) -> bool;
}

/// A wait policy that never gives up and never reports; for callers
/// that already run on a background thread with their own cancel flag
pub struct CancelFlagWait<'a> {
    cancel: &'a AtomicBool,
}

impl<'a> CancelFlagWait<'a> {
    pub fn new(cancel: &'a AtomicBool) -> Self {
        Self { cancel }
    }
}

impl ProbeWait for CancelFlagWait<'_> {
    fn still_checking(&mut self, path: &Path) {
        tracing::info!("still checking path {}", path.display());
    }

    fn cancelled(&mut self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

struct ProbeJob {
    path: PathBuf,
    fs: Arc<dyn FsOps>,
    reply: Sender<Result<(), FsError>>,
}

impl ProbeJob {
    fn run(self) {
        // This is the call that can hang; everything else exists to
        // keep the caller responsive around it
        let result = self.fs.check_path(&self.path);
        let _ = self.reply.send(result);
    }
}

pub struct PathProber {
    warm_tx: Sender<ProbeJob>,
    warm_busy: Arc<AtomicBool>,
    /// On-demand probe threads currently alive (zombies included)
    active: Arc<AtomicUsize>,
}

static GLOBAL_PROBER: Lazy<Arc<PathProber>> = Lazy::new(|| Arc::new(PathProber::new()));

impl PathProber {
    pub fn new() -> Self {
        let (warm_tx, warm_rx) = crossbeam_channel::unbounded::<ProbeJob>();
        let warm_busy = Arc::new(AtomicBool::new(false));

        let busy = warm_busy.clone();
        let spawned = std::thread::Builder::new()
            .name("path-probe-0".into())
            .spawn(move || {
                // Parked between requests; lives for the whole process
                while let Ok(job) = warm_rx.recv() {
                    let result = job.fs.check_path(&job.path);
                    // Free the slot before replying so the next request
                    // can already take the warm path
                    busy.store(false, Ordering::Release);
                    let _ = job.reply.send(result);
                }
            });
        if let Err(e) = spawned {
            // Probes fall back to on-demand threads
            tracing::error!("unable to start the warm probe thread: {}", e);
        }

        Self {
            warm_tx,
            warm_busy,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn global() -> Arc<PathProber> {
        GLOBAL_PROBER.clone()
    }

    /// Check whether `path` is reachable without blocking the caller
    /// beyond a bounded poll
    ///
    /// Fast local media is checked synchronously in place. Everything
    /// else goes to a probe thread; `wait` is notified once the grace
    /// period passes and may abandon the probe at any poll.
    pub fn check_path(
        &self,
        fs: &Arc<dyn FsOps>,
        path: &Path,
        media: PathMedia,
        wait: &mut dyn ProbeWait,
    ) -> ProbeOutcome {
        if media.is_fast() {
            return match fs.check_path(path) {
                Ok(()) => ProbeOutcome::Ready,
                Err(e) => ProbeOutcome::Failed(e),
            };
        }

        let reply_rx = loop {
            match self.dispatch(fs, path) {
                Some(rx) => break rx,
                None => {
                    // Every slot is taken. Non-network paths are safe
                    // enough to check in place; network paths wait for
                    // a slot to free up.
                    if !media.is_network() {
                        return match fs.check_path(path) {
                            Ok(()) => ProbeOutcome::Ready,
                            Err(e) => ProbeOutcome::Failed(e),
                        };
                    }
                    if wait.cancelled() {
                        return ProbeOutcome::Cancelled;
                    }
                    std::thread::sleep(SLOTS_BUSY_RETRY);
                }
            }
        };

        // Grace period: most probes answer well within it
        match reply_rx.recv_timeout(PROBE_GRACE) {
            Ok(result) => return Self::outcome(result),
            Err(_) => wait.still_checking(path),
        }

        loop {
            if wait.cancelled() {
                // The probe thread is abandoned, not killed; it will
                // deliver into a dropped channel whenever the kernel
                // lets it go
                tracing::info!("probe of {} abandoned by caller", path.display());
                return ProbeOutcome::Cancelled;
            }
            match reply_rx.recv_timeout(PROBE_POLL) {
                Ok(result) => return Self::outcome(result),
                Err(_) => continue,
            }
        }
    }

    /// Hand the job to the warm thread or a fresh one; None when every
    /// slot is occupied
    fn dispatch(
        &self,
        fs: &Arc<dyn FsOps>,
        path: &Path,
    ) -> Option<Receiver<Result<(), FsError>>> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let job = ProbeJob {
            path: path.to_path_buf(),
            fs: fs.clone(),
            reply: reply_tx,
        };

        if self
            .warm_busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            match self.warm_tx.send(job) {
                Ok(()) => return Some(reply_rx),
                Err(e) => {
                    // Warm thread is gone; fall through to on-demand
                    self.warm_busy.store(false, Ordering::Release);
                    let job = e.into_inner();
                    return self.spawn_on_demand(job, reply_rx);
                }
            }
        }

        self.spawn_on_demand(job, reply_rx)
    }

    fn spawn_on_demand(
        &self,
        job: ProbeJob,
        reply_rx: Receiver<Result<(), FsError>>,
    ) -> Option<Receiver<Result<(), FsError>>> {
        // Slot 0 is the warm thread
        if self.active.load(Ordering::Acquire) >= PROBE_SLOTS - 1 {
            return None;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        let active = self.active.clone();
        let spawned = std::thread::Builder::new()
            .name("path-probe".into())
            .spawn(move || {
                job.run();
                active.fetch_sub(1, Ordering::AcqRel);
            });
        match spawned {
            Ok(_) => Some(reply_rx),
            Err(e) => {
                tracing::error!("unable to start probe thread: {}", e);
                self.active.fetch_sub(1, Ordering::AcqRel);
                None
            }
        }
    }

    fn outcome(result: Result<(), FsError>) -> ProbeOutcome {
        match result {
            Ok(()) => ProbeOutcome::Ready,
            Err(e) => ProbeOutcome::Failed(e),
        }
    }
}

impl Default for PathProber {
    fn default() -> Self {
        Self::new()
    }
}
