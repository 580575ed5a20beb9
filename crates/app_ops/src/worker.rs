//! Operation workers
//!
//! One OS thread per in-flight operation. The thread walks its script
//! strictly in order, consults the speed limiter before each I/O burst,
//! publishes progress through the status board, and resolves
//! recoverable errors by blocking on the UI bridge. Pausing happens
//! between steps (never mid-file); cancellation is polled once per copy
//! buffer and unwinds without further prompts.

use crate::bridge::{Decision, ErrorContext, ErrorResolver};
use crate::config::EngineConfig;
use crate::error::{ItemErrorKind, OpError, Result};
use crate::gate::Gate;
use crate::limiter::SpeedLimit;
use crate::prober::{CancelFlagWait, PathProber, ProbeOutcome};
use crate::queue::{OperationId, OperationsQueue, PauseState};
use crate::script::{OperationScript, Step, StepKind};
use crate::status::StatusBoard;
use app_fs::{
    is_cross_device, is_valid_filename, AttrChange, ConvertTable, CopyControl, CopyEnd,
    CopyOptions, FsError, FsOps, PathMedia, Recoder, TransferSink,
};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Paused,
    Cancelling,
    Finishing,
    Terminated,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Created,
            1 => WorkerState::Running,
            2 => WorkerState::Paused,
            3 => WorkerState::Cancelling,
            4 => WorkerState::Finishing,
            _ => WorkerState::Terminated,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Created => 0,
            WorkerState::Running => 1,
            WorkerState::Paused => 2,
            WorkerState::Cancelling => 3,
            WorkerState::Finishing => 4,
            WorkerState::Terminated => 5,
        }
    }
}

/// How the operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Cancelled,
}

/// Final report of one operation
#[derive(Debug, Clone)]
pub struct OperationSummary {
    pub outcome: Outcome,
    pub completed_steps: usize,
    pub skipped_items: usize,
}

/// Everything a worker needs besides its script
pub struct WorkerContext {
    pub fs: Arc<dyn FsOps>,
    pub resolver: Arc<dyn ErrorResolver>,
    pub queue: Arc<OperationsQueue>,
    pub prober: Arc<PathProber>,
    pub config: EngineConfig,
}

impl WorkerContext {
    /// Context wired to the process-wide queue and prober
    pub fn new(fs: Arc<dyn FsOps>, resolver: Arc<dyn ErrorResolver>, config: EngineConfig) -> Self {
        Self {
            fs,
            resolver,
            queue: OperationsQueue::global(),
            prober: PathProber::global(),
            config,
        }
    }
}

/// Handle the spawning side keeps; the script itself moved into the
/// worker and comes back only as a summary
pub struct WorkerHandle {
    join: Option<JoinHandle<OperationSummary>>,
    gate: Arc<Gate>,
    cancel: Arc<AtomicBool>,
    status: StatusBoard,
    queue: Arc<OperationsQueue>,
    state: Arc<AtomicU8>,
    id: OperationId,
}

impl WorkerHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn status(&self) -> StatusBoard {
        self.status.clone()
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// User pause; takes effect at the next step boundary
    pub fn pause(&self) {
        self.queue.set_paused(self.id, PauseState::ManuallyPaused);
        self.status.set_paused(true);
    }

    pub fn resume(&self) {
        self.queue.set_paused(self.id, PauseState::Running);
        self.status.set_paused(false);
    }

    /// "Wait for others to finish": park behind every other operation
    pub fn wait_for_others(&self) {
        self.queue.auto_pause(self.id);
        self.status.set_paused(true);
    }

    /// Cooperative cancel; a paused worker is woken so it can unwind
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        self.state
            .store(WorkerState::Cancelling.as_u8(), Ordering::Release);
        self.gate.open();
    }

    /// Block until the worker terminates
    pub fn wait(mut self) -> OperationSummary {
        let join = self.join.take().expect("worker already joined");
        join.join().unwrap_or(OperationSummary {
            outcome: Outcome::Cancelled,
            completed_steps: 0,
            skipped_items: 0,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }
}

/// Start executing a script on a fresh worker thread
///
/// Fatal setup problems (free space, thread creation) fail here, before
/// any file-system mutation.
pub fn start(mut script: OperationScript, ctx: WorkerContext) -> Result<WorkerHandle> {
    script.mark_started();

    // Pre-flight: a copy/move that cannot fit must fail before touching
    // anything
    if let Some(root) = &script.target_root {
        if script.total_file_size > 0 {
            if let Ok(Some(avail)) = ctx.fs.free_space(root) {
                if avail < script.total_file_size {
                    return Err(OpError::Setup(format!(
                        "not enough space on {}: need {} bytes, {} available",
                        root.display(),
                        script.total_file_size,
                        avail
                    )));
                }
            }
        }
    }

    let limit = match ctx.config.speed_limit {
        Some(bps) if bps > 0 => SpeedLimit::capped(bps),
        _ => SpeedLimit::off(),
    };
    let status = StatusBoard::new();
    status.begin(script.total_cost(), script.total_file_size, limit);

    let gate = Arc::new(Gate::new(true));
    let start_on_idle = script.start_on_idle || ctx.config.start_on_idle;
    let (id, start_paused) = ctx.queue.add(gate.clone(), start_on_idle);
    if start_paused {
        status.set_paused(true);
        tracing::info!("operation {} queued behind running operations", id);
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let state = Arc::new(AtomicU8::new(WorkerState::Created.as_u8()));

    let run = Run {
        script,
        fs: ctx.fs,
        resolver: ctx.resolver,
        queue: ctx.queue.clone(),
        prober: ctx.prober,
        config: ctx.config,
        status: status.clone(),
        gate: gate.clone(),
        cancel: cancel.clone(),
        state: state.clone(),
        id,
        skip_all: HashSet::new(),
        overwrite_all: false,
        progress_base: 0,
        completed: 0,
        skipped: 0,
    };

    let join = std::thread::Builder::new()
        .name(format!("op-worker-{}", id))
        .spawn(move || run.run())
        .map_err(|e| {
            ctx.queue.operation_ended(id, true);
            OpError::Setup(format!("unable to start worker thread: {}", e))
        })?;

    Ok(WorkerHandle {
        join: Some(join),
        gate,
        cancel,
        status,
        queue: ctx.queue,
        state,
        id,
    })
}

/// How one step resolution ended
enum StepResult {
    Done,
    Skipped,
    /// Continue at this index (a skipped directory jumped past its
    /// subtree)
    JumpTo(usize),
    Cancel,
}

/// What a single execution attempt produced
enum StepOutcome {
    Done,
    /// Policy said to skip without asking (overwrite-older)
    SilentSkip,
}

enum ExecError {
    Item(FsError),
    Cancelled,
}

type ExecResult = std::result::Result<StepOutcome, ExecError>;

struct Run {
    script: OperationScript,
    fs: Arc<dyn FsOps>,
    resolver: Arc<dyn ErrorResolver>,
    queue: Arc<OperationsQueue>,
    prober: Arc<PathProber>,
    config: EngineConfig,
    status: StatusBoard,
    gate: Arc<Gate>,
    cancel: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    id: OperationId,

    /// Error kinds the user chose to skip for the rest of the script
    skip_all: HashSet<ItemErrorKind>,
    overwrite_all: bool,

    /// Sum of costs of every step already passed; progress settles to
    /// this after each step so copy-loop drift never accumulates
    progress_base: u64,
    completed: usize,
    skipped: usize,
}

impl Run {
    fn run(mut self) -> OperationSummary {
        self.set_state(WorkerState::Running);

        // Admission may have parked us before the first step
        self.pause_point();
        if self.cancelled() {
            return self.finish(Outcome::Cancelled);
        }

        if !self.probe_roots() {
            return self.finish(Outcome::Cancelled);
        }

        let mut index = 0;
        let outcome = loop {
            if index >= self.script.len() {
                break Outcome::Finished;
            }
            self.pause_point();
            if self.cancelled() {
                break Outcome::Cancelled;
            }
            match self.run_step(index) {
                StepResult::Done => {
                    self.completed += 1;
                    index += 1;
                }
                StepResult::Skipped => {
                    self.skipped += 1;
                    index += 1;
                }
                StepResult::JumpTo(next) => {
                    self.skipped += 1;
                    index = next;
                }
                StepResult::Cancel => break Outcome::Cancelled,
            }
        };

        self.finish(outcome)
    }

    fn finish(&mut self, outcome: Outcome) -> OperationSummary {
        self.set_state(WorkerState::Finishing);
        self.queue.operation_ended(self.id, false);
        self.set_state(WorkerState::Terminated);
        tracing::info!(
            "operation {} {:?}: {} steps done, {} skipped",
            self.id,
            outcome,
            self.completed,
            self.skipped
        );
        OperationSummary {
            outcome,
            completed_steps: self.completed,
            skipped_items: self.skipped,
        }
    }

    fn set_state(&self, state: WorkerState) {
        // Cancelling is set from the handle side and must not be
        // overwritten by the regular transitions
        let current = WorkerState::from_u8(self.state.load(Ordering::Acquire));
        if current == WorkerState::Cancelling && state == WorkerState::Running {
            return;
        }
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Between-step suspension; meters restart on resume so the pause
    /// does not read as a collapsed transfer rate
    fn pause_point(&self) {
        if self.gate.is_open() {
            return;
        }
        self.set_state(WorkerState::Paused);
        self.status.set_paused(true);
        self.gate.wait();
        self.status.set_paused(false);
        self.status.reset_meters();
        self.set_state(WorkerState::Running);
    }

    /// Probe possibly-stale roots before the first touch; a dead
    /// network share must not hang the whole operation silently
    fn probe_roots(&self) -> bool {
        let roots: Vec<PathBuf> = [&self.script.source_root, &self.script.target_root]
            .into_iter()
            .flatten()
            .cloned()
            .collect();

        for root in roots {
            let media = self.fs.media(&root);
            loop {
                let mut wait = CancelFlagWait::new(&self.cancel);
                match self.prober.check_path(&self.fs, &root, media, &mut wait) {
                    ProbeOutcome::Ready => break,
                    ProbeOutcome::Cancelled => return false,
                    ProbeOutcome::Failed(e) => {
                        let context = ErrorContext {
                            kind: ItemErrorKind::of(&e),
                            source: root.clone(),
                            target: None,
                            message: e.to_string(),
                        };
                        match self.resolver.resolve(&context) {
                            Decision::Retry => continue,
                            other => {
                                tracing::info!(
                                    "root {} unavailable, user chose {:?}",
                                    root.display(),
                                    other
                                );
                                return false;
                            }
                        }
                    }
                }
            }
        }
        true
    }

    /// Execute one step through its retry loop
    fn run_step(&mut self, index: usize) -> StepResult {
        let step = self.script.steps()[index].clone();
        let mut target_override: Option<PathBuf> = None;
        let mut force_overwrite = false;
        let mut older_tested = false;

        loop {
            let attempt = self.exec_step(
                &step,
                target_override.as_deref(),
                force_overwrite,
                &mut older_tested,
            );
            match attempt {
                Ok(StepOutcome::Done) => {
                    return self.advance(index, &step, false);
                }
                Ok(StepOutcome::SilentSkip) => {
                    return self.advance(index, &step, true);
                }
                Err(ExecError::Cancelled) => return StepResult::Cancel,
                Err(ExecError::Item(err)) => {
                    let kind = ItemErrorKind::of(&err);
                    if self.skip_all.contains(&kind) {
                        tracing::debug!(
                            "skipping {} ({:?} marked skip-all)",
                            step.source.display(),
                            kind
                        );
                        return self.advance(index, &step, true);
                    }

                    // Freeze the displayed status while the prompt is up
                    self.status.set_paused(true);
                    let context = ErrorContext {
                        kind,
                        source: step.source.clone(),
                        target: target_override
                            .clone()
                            .or_else(|| step.target.clone()),
                        message: err.to_string(),
                    };
                    let decision = self.resolver.resolve(&context);
                    self.status.set_paused(false);
                    self.status.reset_meters();

                    // A cancel issued while the prompt was open wins
                    // over whatever was answered
                    if self.cancelled() {
                        return StepResult::Cancel;
                    }

                    match decision {
                        Decision::Retry => continue,
                        Decision::Skip => return self.advance(index, &step, true),
                        Decision::SkipAll => {
                            self.skip_all.insert(kind);
                            return self.advance(index, &step, true);
                        }
                        Decision::Overwrite => {
                            force_overwrite = true;
                            continue;
                        }
                        Decision::OverwriteAll => {
                            self.overwrite_all = true;
                            continue;
                        }
                        Decision::Rename(new_target) => {
                            target_override = Some(new_target);
                            continue;
                        }
                        Decision::Cancel => return StepResult::Cancel,
                    }
                }
            }
        }
    }

    /// Book the step's cost into progress and decide where to go next;
    /// a skipped CreateDir jumps past its pre-planned subtree
    fn advance(&mut self, index: usize, step: &Step, skipped: bool) -> StepResult {
        if skipped {
            if matches!(step.kind, StepKind::CreateDir) {
                if let Some(label_index) = self.script.skip_label_for(index) {
                    let skipped_cost = match &self.script.steps()[label_index].kind {
                        StepKind::SkipLabel { skipped_cost, .. } => *skipped_cost,
                        _ => 0,
                    };
                    self.progress_base += step.cost + skipped_cost;
                    self.status.settle_progress(self.progress_base);
                    tracing::debug!(
                        "skipped directory {}; jumping over {} cost units",
                        step.source.display(),
                        skipped_cost
                    );
                    return StepResult::JumpTo(label_index + 1);
                }
            }
            self.progress_base += step.cost;
            self.status.settle_progress(self.progress_base);
            return StepResult::Skipped;
        }

        self.progress_base += step.cost;
        self.status.settle_progress(self.progress_base);
        StepResult::Done
    }

    /// One execution attempt of one step; recoverable problems come
    /// back as `ExecError::Item`
    fn exec_step(
        &self,
        step: &Step,
        target_override: Option<&Path>,
        force_overwrite: bool,
        older_tested: &mut bool,
    ) -> ExecResult {
        match &step.kind {
            StepKind::CopyFile { file_size } => {
                let target = self.effective_target(step, target_override)?;
                self.check_target_name(step, &target)?;
                if let Some(outcome) =
                    self.resolve_collision(step, &target, force_overwrite, older_tested)?
                {
                    return Ok(outcome);
                }
                self.copy_file(step, &target, *file_size)
            }
            StepKind::MoveFile { .. } => {
                let target = self.effective_target(step, target_override)?;
                self.check_target_name(step, &target)?;
                if let Some(outcome) =
                    self.resolve_collision(step, &target, force_overwrite, older_tested)?
                {
                    return Ok(outcome);
                }
                self.move_file(step, &target)
            }
            StepKind::MoveDir => {
                let target = self.effective_target(step, target_override)?;
                self.check_target_name(step, &target)?;
                self.fs
                    .rename(&step.source, &target)
                    .map_err(ExecError::Item)?;
                Ok(StepOutcome::Done)
            }
            StepKind::DeleteFile => {
                self.fs.delete_file(&step.source).map_err(ExecError::Item)?;
                Ok(StepOutcome::Done)
            }
            StepKind::DeleteDir => {
                self.fs.delete_dir(&step.source).map_err(ExecError::Item)?;
                Ok(StepOutcome::Done)
            }
            StepKind::DeleteDirLink => {
                self.fs
                    .delete_dir_link(&step.source)
                    .map_err(ExecError::Item)?;
                Ok(StepOutcome::Done)
            }
            StepKind::CreateDir => {
                let target = self.effective_target(step, target_override)?;
                self.check_target_name(step, &target)?;
                match self.fs.create_dir(&target) {
                    Ok(()) => Ok(StepOutcome::Done),
                    Err(FsError::AlreadyExists(name)) => {
                        // An existing directory is simply reused; only a
                        // file in the way is a real collision
                        match self.fs.metadata(&target) {
                            Ok(meta) if meta.is_dir => {
                                tracing::debug!("reusing existing directory {}", name);
                                Ok(StepOutcome::Done)
                            }
                            _ => Err(ExecError::Item(FsError::AlreadyExists(name))),
                        }
                    }
                    Err(e) => Err(ExecError::Item(e)),
                }
            }
            StepKind::ChangeAttrs(change) => {
                self.fs
                    .change_attrs(&step.source, change)
                    .map_err(ExecError::Item)?;
                Ok(StepOutcome::Done)
            }
            StepKind::CountSize => {
                self.fs.metadata(&step.source).map_err(ExecError::Item)?;
                Ok(StepOutcome::Done)
            }
            StepKind::ConvertFile { table } => self.convert_file(step, table.clone()),
            StepKind::CopyDirTime { modified } => {
                self.fs
                    .change_attrs(&step.source, &AttrChange::times(*modified))
                    .map_err(ExecError::Item)?;
                Ok(StepOutcome::Done)
            }
            StepKind::SkipLabel { .. } => {
                // Reached in normal flow when its CreateDir succeeded
                Ok(StepOutcome::Done)
            }
        }
    }

    fn effective_target<'a>(
        &self,
        step: &'a Step,
        target_override: Option<&'a Path>,
    ) -> std::result::Result<PathBuf, ExecError> {
        let target = target_override
            .map(Path::to_path_buf)
            .or_else(|| step.target.clone());
        target.ok_or_else(|| {
            ExecError::Item(FsError::InvalidName(format!(
                "step on {} has no target",
                step.source.display()
            )))
        })
    }

    fn check_target_name(&self, step: &Step, target: &Path) -> std::result::Result<(), ExecError> {
        if step.flags.ignore_invalid_name {
            return Ok(());
        }
        if let Some(name) = target.file_name().and_then(|n| n.to_str()) {
            if !is_valid_filename(name) {
                return Err(ExecError::Item(FsError::InvalidName(name.to_string())));
            }
        }
        Ok(())
    }

    /// Overwrite policy for copy/move targets. Returns Some when the
    /// step is already decided (silent skip), Err for a collision the
    /// user must resolve, None to proceed with the write.
    fn resolve_collision(
        &self,
        step: &Step,
        target: &Path,
        force_overwrite: bool,
        older_tested: &mut bool,
    ) -> std::result::Result<Option<StepOutcome>, ExecError> {
        let existing = match self.fs.metadata(target) {
            Ok(meta) => meta,
            Err(FsError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(ExecError::Item(e)),
        };

        if existing.is_dir {
            // A directory in the way of a file is never overwritten
            return Err(ExecError::Item(FsError::AlreadyExists(
                target.display().to_string(),
            )));
        }

        if force_overwrite || self.overwrite_all {
            return Ok(None);
        }

        if self.script.overwrite_older && !*older_tested {
            *older_tested = true;
            let source = self.fs.metadata(&step.source).map_err(ExecError::Item)?;
            let source_newer = match (source.modified, existing.modified) {
                (Some(s), Some(t)) => s > t,
                _ => false,
            };
            if source_newer {
                return Ok(None);
            }
            tracing::debug!(
                "keeping newer target {}, skipping {}",
                target.display(),
                step.source.display()
            );
            return Ok(Some(StepOutcome::SilentSkip));
        }

        if self.config.confirm_overwrite {
            return Err(ExecError::Item(FsError::AlreadyExists(
                target.display().to_string(),
            )));
        }

        Ok(None)
    }

    fn buffer_for(&self, step: &Step, target: &Path) -> usize {
        let flags = &step.flags;
        let source_media = self.media_of(&step.source, flags.source_is_fast, flags.source_is_network);
        let target_media = self.media_of(target, flags.target_is_fast, flags.target_is_network);
        if source_media == PathMedia::Removable || target_media == PathMedia::Removable {
            self.config.removable_buffer_size
        } else {
            self.config.buffer_size
        }
    }

    fn media_of(&self, path: &Path, flagged_fast: bool, flagged_network: bool) -> PathMedia {
        if flagged_fast {
            PathMedia::Fixed
        } else if flagged_network {
            PathMedia::Network
        } else {
            self.fs.media(path)
        }
    }

    fn copy_file(&self, step: &Step, target: &Path, file_size: u64) -> ExecResult {
        let buffer = self.buffer_for(step, target);
        let opts = CopyOptions {
            buffer_size: buffer,
            preserve_times: true,
            encrypt: step.flags.encrypt,
            copy_ads: step.flags.copy_ads,
        };
        let mut sink = WorkerSink {
            status: &self.status,
            cancel: &self.cancel,
            default_buffer: buffer,
            only_progress: false,
            total: 0,
        };

        match self.fs.copy_file(&step.source, target, &opts, &mut sink) {
            Ok(CopyEnd::Done { bytes }) => {
                // Files can change on disk mid-run; the status line
                // still totals to the pre-scanned size
                self.status.settle_transferred(file_size, bytes);
                Ok(StepOutcome::Done)
            }
            Ok(CopyEnd::Cancelled { bytes }) => {
                self.discard_partial(target, bytes);
                Err(ExecError::Cancelled)
            }
            Err(e) => {
                self.discard_partial(target, sink.total);
                Err(ExecError::Item(e))
            }
        }
    }

    /// A half-written target must not survive; either the whole file
    /// lands or nothing does
    fn discard_partial(&self, target: &Path, flushed: u64) {
        if let Err(e) = self.fs.delete_file(target) {
            tracing::debug!(
                "could not remove partial target {}: {}",
                target.display(),
                e
            );
        }
        // Un-book the discarded bytes so a retry does not double-count
        self.status.settle_transferred(0, flushed);
    }

    fn move_file(&self, step: &Step, target: &Path) -> ExecResult {
        // Overwrite-by-move needs the target gone first
        if self.fs.metadata(target).is_ok() {
            self.fs.delete_file(target).map_err(ExecError::Item)?;
        }

        match self.fs.rename(&step.source, target) {
            Ok(()) => Ok(StepOutcome::Done),
            Err(e) if is_cross_device(&e) => {
                tracing::debug!(
                    "cross-volume move {} -> {}, falling back to copy+delete",
                    step.source.display(),
                    target.display()
                );
                let file_size = self.fs.metadata(&step.source).map_err(ExecError::Item)?.size;
                self.copy_file(step, target, file_size)?;
                self.fs.delete_file(&step.source).map_err(ExecError::Item)?;
                Ok(StepOutcome::Done)
            }
            Err(e) => Err(ExecError::Item(e)),
        }
    }

    fn convert_file(&self, step: &Step, table: ConvertTable) -> ExecResult {
        let mut tmp_name = step.source.as_os_str().to_os_string();
        tmp_name.push(".cvt");
        let tmp = PathBuf::from(tmp_name);

        let result = self.convert_into(step, table, &tmp);
        if result.is_err() {
            if let Err(e) = self.fs.delete_file(&tmp) {
                tracing::debug!("could not remove temp file {}: {}", tmp.display(), e);
            }
        }
        result
    }

    fn convert_into(&self, step: &Step, table: ConvertTable, tmp: &Path) -> ExecResult {
        let mut reader = self.fs.open_read(&step.source).map_err(ExecError::Item)?;
        let mut writer = self.fs.create_write(tmp).map_err(ExecError::Item)?;
        let mut recoder = Recoder::new(table);

        let buffer_size = self.config.buffer_size.max(1);
        let mut buf = vec![0u8; buffer_size];
        let mut out = Vec::with_capacity(buffer_size + 4);

        loop {
            if self.cancelled() {
                return Err(ExecError::Cancelled);
            }
            let n = reader
                .read(&mut buf)
                .map_err(|e| ExecError::Item(FsError::classify(e, &step.source)))?;
            if n == 0 {
                break;
            }
            out.clear();
            recoder.push(&buf[..n], &mut out);
            writer
                .write_all(&out)
                .map_err(|e| ExecError::Item(FsError::classify(e, tmp)))?;
            // Conversion rewrites in place: progress only, no transfer
            self.status
                .record_chunk(n as u64, buffer_size as u64, buffer_size, true);
        }

        out.clear();
        recoder.finish(&mut out);
        if !out.is_empty() {
            writer
                .write_all(&out)
                .map_err(|e| ExecError::Item(FsError::classify(e, tmp)))?;
        }
        drop(writer);

        self.fs.replace(tmp, &step.source).map_err(ExecError::Item)?;
        Ok(StepOutcome::Done)
    }
}

/// Drives throttle, progress and cancellation from inside a copy loop
struct WorkerSink<'a> {
    status: &'a StatusBoard,
    cancel: &'a AtomicBool,
    default_buffer: usize,
    only_progress: bool,
    total: u64,
}

impl TransferSink for WorkerSink<'_> {
    fn on_chunk(&mut self, bytes: usize) -> CopyControl {
        self.total += bytes as u64;
        if self.cancel.load(Ordering::Acquire) {
            return CopyControl::Cancel;
        }
        let plan = self.status.record_chunk(
            bytes as u64,
            self.default_buffer as u64,
            self.default_buffer,
            self.only_progress,
        );
        if !plan.sleep.is_zero() {
            std::thread::sleep(plan.sleep);
        }
        CopyControl::Continue {
            buffer_limit: plan.buffer_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::AutoResolver;
    use app_fs::{DiskFs, EolPolicy};
    use parking_lot::Mutex;
    use std::fs;
    use std::time::{Duration, Instant};

    /// Records every prompt and replays a scripted list of decisions
    struct ScriptedResolver {
        decisions: Mutex<Vec<Decision>>,
        seen: Mutex<Vec<ItemErrorKind>>,
    }

    impl ScriptedResolver {
        fn new(decisions: Vec<Decision>) -> Arc<Self> {
            Arc::new(Self {
                decisions: Mutex::new(decisions),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<ItemErrorKind> {
            self.seen.lock().clone()
        }
    }

    impl ErrorResolver for ScriptedResolver {
        fn resolve(&self, context: &ErrorContext) -> Decision {
            self.seen.lock().push(context.kind);
            let mut decisions = self.decisions.lock();
            if decisions.is_empty() {
                panic!("unexpected prompt: {:?} on {:?}", context.kind, context.source);
            }
            decisions.remove(0)
        }
    }

    struct PanicResolver;
    impl ErrorResolver for PanicResolver {
        fn resolve(&self, context: &ErrorContext) -> Decision {
            panic!("unexpected prompt: {:?} on {:?}", context.kind, context.source);
        }
    }

    fn test_ctx(resolver: Arc<dyn ErrorResolver>, config: EngineConfig) -> WorkerContext {
        WorkerContext {
            fs: Arc::new(DiskFs::new()),
            resolver,
            queue: Arc::new(OperationsQueue::new()),
            prober: Arc::new(PathProber::new()),
            config,
        }
    }

    fn small_buffers() -> EngineConfig {
        EngineConfig {
            buffer_size: 4096,
            removable_buffer_size: 4096,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_dir_then_copy_reaches_full_progress() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, vec![b'x'; 1000]).unwrap();
        let sub = dir.path().join("X");

        let mut script = OperationScript::new();
        script.is_copy = true;
        script.total_file_size = 1000;
        script.push(Step::create_dir(sub.clone())).unwrap();
        script
            .push(Step::copy_file(src.clone(), sub.join("a.txt"), 1000))
            .unwrap();
        let total_cost = script.total_cost();

        let handle = start(script, test_ctx(Arc::new(PanicResolver), small_buffers())).unwrap();
        let status = handle.status();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(summary.completed_steps, 2);
        assert_eq!(summary.skipped_items, 0);
        assert_eq!(fs::read(sub.join("a.txt")).unwrap(), vec![b'x'; 1000]);

        let snap = status.snapshot();
        assert_eq!(snap.progress, total_cost);
        assert_eq!(snap.transferred, 1000);
    }

    #[test]
    fn test_skip_all_covers_same_kind_only() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        // Five copies: the first is clean, the next three collide, the
        // last one's source is missing (a different error kind)
        let mut script = OperationScript::new();
        let mut sources = Vec::new();
        for i in 0..4 {
            let src = dir.path().join(format!("s{}.txt", i));
            fs::write(&src, format!("new {}", i)).unwrap();
            sources.push(src);
        }
        for (i, src) in sources.iter().enumerate() {
            let dst = out.join(format!("s{}.txt", i));
            if i > 0 {
                fs::write(&dst, "old").unwrap();
            }
            script.push(Step::copy_file(src.clone(), dst, 16)).unwrap();
        }
        script
            .push(Step::copy_file(
                dir.path().join("missing.txt"),
                out.join("missing.txt"),
                16,
            ))
            .unwrap();

        let resolver = ScriptedResolver::new(vec![Decision::SkipAll, Decision::Skip]);
        let handle = start(script, test_ctx(resolver.clone(), small_buffers())).unwrap();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(summary.completed_steps, 1);
        assert_eq!(summary.skipped_items, 4);

        // Exactly two prompts: one collision, one unrelated not-found
        assert_eq!(
            resolver.seen(),
            vec![ItemErrorKind::AlreadyExists, ItemErrorKind::NotFound]
        );

        // Skipped targets kept their old content
        for i in 1..4 {
            assert_eq!(
                fs::read_to_string(out.join(format!("s{}.txt", i))).unwrap(),
                "old"
            );
        }
    }

    #[test]
    fn test_overwrite_all_prompts_once() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let mut script = OperationScript::new();
        for i in 0..3 {
            let src = dir.path().join(format!("s{}.txt", i));
            let dst = out.join(format!("s{}.txt", i));
            fs::write(&src, format!("new {}", i)).unwrap();
            fs::write(&dst, "old").unwrap();
            script.push(Step::copy_file(src, dst, 16)).unwrap();
        }

        let resolver = ScriptedResolver::new(vec![Decision::OverwriteAll]);
        let handle = start(script, test_ctx(resolver.clone(), small_buffers())).unwrap();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(summary.completed_steps, 3);
        assert_eq!(resolver.seen().len(), 1);
        for i in 0..3 {
            assert_eq!(
                fs::read_to_string(out.join(format!("s{}.txt", i))).unwrap(),
                format!("new {}", i)
            );
        }
    }

    #[test]
    fn test_overwrite_older_skips_newer_targets_silently() {
        let dir = tempfile::tempdir().unwrap();

        // Target written after the source: the target is newer
        let src = dir.path().join("src.txt");
        fs::write(&src, "from source").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let dst = dir.path().join("dst.txt");
        fs::write(&dst, "newer target").unwrap();

        let mut script = OperationScript::new();
        script.overwrite_older = true;
        script.push(Step::copy_file(src, dst.clone(), 16)).unwrap();

        let handle = start(script, test_ctx(Arc::new(PanicResolver), small_buffers())).unwrap();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(summary.skipped_items, 1);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "newer target");
    }

    #[test]
    fn test_overwrite_older_replaces_older_targets() {
        let dir = tempfile::tempdir().unwrap();

        let dst = dir.path().join("dst.txt");
        fs::write(&dst, "older target").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let src = dir.path().join("src.txt");
        fs::write(&src, "from source").unwrap();

        let mut script = OperationScript::new();
        script.overwrite_older = true;
        script.push(Step::copy_file(src, dst.clone(), 16)).unwrap();

        let handle = start(script, test_ctx(Arc::new(PanicResolver), small_buffers())).unwrap();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(summary.completed_steps, 1);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "from source");
    }

    #[test]
    fn test_queued_operation_starts_after_predecessor_ends() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let mut script = OperationScript::new();
        script.start_on_idle = true;
        for i in 0..3 {
            let src = dir.path().join(format!("s{}.txt", i));
            fs::write(&src, format!("data {}", i)).unwrap();
            script
                .push(Step::copy_file(src, out.join(format!("s{}.txt", i)), 16))
                .unwrap();
        }

        let ctx = test_ctx(Arc::new(PanicResolver), small_buffers());
        let queue = ctx.queue.clone();

        // Another operation is "running"
        let blocker = Arc::new(Gate::new(true));
        let (blocker_id, blocker_paused) = queue.add(blocker, false);
        assert!(!blocker_paused);

        let handle = start(script, ctx).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        // Parked: nothing was copied yet
        assert_eq!(handle.status().snapshot().progress, 0);
        assert!(handle.status().snapshot().paused);
        assert!(!out.join("s0.txt").exists());

        // Predecessor ends; the parked operation resumes and finishes
        queue.operation_ended(blocker_id, false);
        let summary = handle.wait();
        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(summary.completed_steps, 3);
        for i in 0..3 {
            assert_eq!(
                fs::read_to_string(out.join(format!("s{}.txt", i))).unwrap(),
                format!("data {}", i)
            );
        }
    }

    #[test]
    fn test_pause_and_resume_completes_every_step_once() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();

        let mut script = OperationScript::new();
        for i in 0..5 {
            let src = dir.path().join(format!("s{}.txt", i));
            fs::write(&src, format!("data {}", i)).unwrap();
            script
                .push(Step::copy_file(src, out.join(format!("s{}.txt", i)), 16))
                .unwrap();
        }

        let handle = start(script, test_ctx(Arc::new(PanicResolver), small_buffers())).unwrap();
        handle.pause();
        std::thread::sleep(Duration::from_millis(50));
        handle.resume();

        let summary = handle.wait();
        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(summary.completed_steps, 5);
        assert_eq!(summary.skipped_items, 0);
        for i in 0..5 {
            assert_eq!(
                fs::read_to_string(out.join(format!("s{}.txt", i))).unwrap(),
                format!("data {}", i)
            );
        }
    }

    #[test]
    fn test_cancel_mid_copy_leaves_no_partial_target() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("big.bin");
        let dst = dir.path().join("big-copy.bin");
        fs::write(&src, vec![0u8; 2_000_000]).unwrap();

        let mut config = small_buffers();
        // Throttle hard so the copy is slow enough to cancel mid-file
        config.speed_limit = Some(200_000);

        let mut script = OperationScript::new();
        script
            .push(Step::copy_file(src, dst.clone(), 2_000_000))
            .unwrap();

        let handle = start(script, test_ctx(Arc::new(PanicResolver), config)).unwrap();
        let status = handle.status();

        let deadline = Instant::now() + Duration::from_secs(5);
        while status.snapshot().transferred == 0 {
            assert!(Instant::now() < deadline, "copy never started");
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.cancel();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Cancelled);
        assert!(!dst.exists(), "partial target must be rolled back");
    }

    #[test]
    fn test_throttled_copy_takes_proportional_time() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("data.bin");
        let dst = dir.path().join("data-copy.bin");
        fs::write(&src, vec![7u8; 500_000]).unwrap();

        let mut config = small_buffers();
        config.speed_limit = Some(250_000);

        let mut script = OperationScript::new();
        script
            .push(Step::copy_file(src, dst.clone(), 500_000))
            .unwrap();

        let started = Instant::now();
        let handle = start(script, test_ctx(Arc::new(PanicResolver), config)).unwrap();
        let summary = handle.wait();
        let elapsed = started.elapsed();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(fs::read(&dst).unwrap().len(), 500_000);
        // 500 KB at 250 KB/s is two seconds; allow generous scheduling slack
        assert!(
            elapsed >= Duration::from_millis(1200),
            "copy finished too fast for the cap: {:?}",
            elapsed
        );
    }

    #[test]
    fn test_skipped_directory_jumps_over_its_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let src_inner = dir.path().join("inner.txt");
        fs::write(&src_inner, "inner").unwrap();
        let src_after = dir.path().join("after.txt");
        fs::write(&src_after, "after").unwrap();

        // A plain file occupies the directory's target path
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, "in the way").unwrap();

        let mut script = OperationScript::new();
        script.push(Step::create_dir(blocked.clone())).unwrap();
        let inner = Step::copy_file(src_inner, blocked.join("inner.txt"), 16);
        let inner_cost = inner.cost;
        script.push(inner).unwrap();
        script.push(Step::skip_label(0, inner_cost)).unwrap();
        let after = dir.path().join("after-copy.txt");
        script
            .push(Step::copy_file(src_after, after.clone(), 16))
            .unwrap();
        let total_cost = script.total_cost();

        let resolver = ScriptedResolver::new(vec![Decision::Skip]);
        let handle = start(script, test_ctx(resolver.clone(), small_buffers())).unwrap();
        let status = handle.status();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        // Only the directory prompt fired; the doomed inner copy was
        // never attempted
        assert_eq!(resolver.seen(), vec![ItemErrorKind::AlreadyExists]);
        assert_eq!(fs::read_to_string(&after).unwrap(), "after");
        assert_eq!(fs::read_to_string(&blocked).unwrap(), "in the way");
        assert_eq!(status.snapshot().progress, total_cost);
    }

    #[test]
    fn test_convert_step_rewrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("text.txt");
        // "caf<euro>" in windows-1252 with a CRLF line ending
        fs::write(&file, [b'c', b'a', b'f', 0x80, b'\r', b'\n', b'x']).unwrap();

        let table =
            ConvertTable::by_label("windows-1252", "iso-8859-15", EolPolicy::Lf).unwrap();
        let mut script = OperationScript::new();
        script
            .push(Step::convert_file(file.clone(), 7, table))
            .unwrap();

        let handle = start(script, test_ctx(Arc::new(PanicResolver), small_buffers())).unwrap();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        // Euro remapped, CRLF collapsed, no temp file left behind
        assert_eq!(fs::read(&file).unwrap(), [b'c', b'a', b'f', 0xA4, b'\n', b'x']);
        assert!(!dir.path().join("text.txt.cvt").exists());
    }

    #[test]
    fn test_rename_decision_redirects_target() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, "payload").unwrap();
        let dst = dir.path().join("taken.txt");
        fs::write(&dst, "occupied").unwrap();
        let renamed = dir.path().join("renamed.txt");

        let mut script = OperationScript::new();
        script.push(Step::copy_file(src, dst.clone(), 16)).unwrap();

        let resolver = ScriptedResolver::new(vec![Decision::Rename(renamed.clone())]);
        let handle = start(script, test_ctx(resolver, small_buffers())).unwrap();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(fs::read_to_string(&renamed).unwrap(), "payload");
        assert_eq!(fs::read_to_string(&dst).unwrap(), "occupied");
    }

    #[test]
    fn test_move_uses_rename_and_deletes_nothing_extra() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, "move me").unwrap();
        let dst = dir.path().join("dst.txt");

        let mut script = OperationScript::new();
        script
            .push(Step::move_file(src.clone(), dst.clone(), 7))
            .unwrap();

        let handle = start(script, test_ctx(Arc::new(PanicResolver), small_buffers())).unwrap();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert!(!src.exists());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "move me");
    }

    #[test]
    fn test_invalid_target_name_prompts() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        fs::write(&src, "data").unwrap();

        let mut script = OperationScript::new();
        script
            .push(Step::copy_file(src, dir.path().join("CON"), 16))
            .unwrap();

        let resolver = ScriptedResolver::new(vec![Decision::Skip]);
        let handle = start(script, test_ctx(resolver.clone(), small_buffers())).unwrap();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(summary.skipped_items, 1);
        assert_eq!(resolver.seen(), vec![ItemErrorKind::InvalidName]);
    }

    #[test]
    fn test_delete_script() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let file = sub.join("f.txt");
        fs::write(&file, "x").unwrap();

        let mut script = OperationScript::new();
        script.push(Step::delete_file(file.clone())).unwrap();
        script.push(Step::delete_dir(sub.clone())).unwrap();

        let handle = start(script, test_ctx(Arc::new(PanicResolver), small_buffers())).unwrap();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert!(!file.exists());
        assert!(!sub.exists());
    }

    #[test]
    fn test_auto_resolver_skip_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        fs::create_dir(&out).unwrap();
        let good = dir.path().join("good.txt");
        fs::write(&good, "good").unwrap();

        let mut script = OperationScript::new();
        script
            .push(Step::copy_file(
                dir.path().join("missing.txt"),
                out.join("missing.txt"),
                16,
            ))
            .unwrap();
        script
            .push(Step::copy_file(good, out.join("good.txt"), 16))
            .unwrap();

        let resolver: Arc<dyn ErrorResolver> = Arc::new(AutoResolver(Decision::Skip));
        let handle = start(script, test_ctx(resolver, small_buffers())).unwrap();
        let summary = handle.wait();

        assert_eq!(summary.outcome, Outcome::Finished);
        assert_eq!(summary.completed_steps, 1);
        assert_eq!(summary.skipped_items, 1);
        assert_eq!(fs::read_to_string(out.join("good.txt")).unwrap(), "good");
    }
}
