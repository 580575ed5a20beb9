//! Operation scripts: the ordered plan a worker executes
//!
//! A planning pass (directory walk, not part of the engine) appends
//! steps; once execution starts the script is immutable and only the
//! worker's cursor moves. Step costs weight the progress bar, they are
//! not byte-accurate.

use crate::error::{OpError, Result};
use app_fs::{AttrChange, ConvertTable};
use std::path::PathBuf;
use std::time::SystemTime;

// Per-step progress weights, measured from worker thread runtimes
pub const CREATE_DIR_COST: u64 = 4096;
pub const MOVE_DIR_COST: u64 = 5050;
pub const DELETE_DIR_COST: u64 = 2400;
pub const DELETE_DIRLINK_COST: u64 = 2400;
pub const MOVE_FILE_COST: u64 = 6500;
pub const COPY_MIN_COST: u64 = 4096;
pub const CONVERT_MIN_COST: u64 = 4096;
pub const DELETE_FILE_COST: u64 = 2300;
pub const CHANGE_ATTRS_COST: u64 = 500;

/// Per-step flags
#[derive(Debug, Clone, Copy, Default)]
pub struct StepFlags {
    /// Target should come out encrypted
    pub encrypt: bool,
    /// Copy alternate data streams as well
    pub copy_ads: bool,
    /// Skip the target-name validity test
    pub ignore_invalid_name: bool,
    pub source_is_network: bool,
    /// Disk, USB, flash, CD/DVD, or RAM disk (not network or floppy)
    pub source_is_fast: bool,
    pub target_is_network: bool,
    pub target_is_fast: bool,
}

/// What a single step does
#[derive(Debug, Clone)]
pub enum StepKind {
    CopyFile { file_size: u64 },
    MoveFile { file_size: u64 },
    MoveDir,
    DeleteFile,
    DeleteDir,
    DeleteDirLink,
    CreateDir,
    ChangeAttrs(AttrChange),
    /// Counts its cost into progress; used so size-calculation scripts
    /// still advance the bar
    CountSize,
    ConvertFile { table: ConvertTable },
    /// Re-apply a directory timestamp after its contents were processed
    CopyDirTime { modified: SystemTime },
    /// Jump target used when the paired CreateDir step is skipped;
    /// carries the total cost of the steps it skips over
    SkipLabel {
        skipped_cost: u64,
        create_dir_index: usize,
    },
}

/// One indivisible file-system action
#[derive(Debug, Clone)]
pub struct Step {
    pub kind: StepKind,
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    /// Progress weight; correctness never depends on it
    pub cost: u64,
    pub flags: StepFlags,
}

impl Step {
    pub fn copy_file(source: PathBuf, target: PathBuf, file_size: u64) -> Self {
        Self {
            kind: StepKind::CopyFile { file_size },
            source,
            target: Some(target),
            cost: file_size.max(COPY_MIN_COST),
            flags: StepFlags::default(),
        }
    }

    pub fn move_file(source: PathBuf, target: PathBuf, file_size: u64) -> Self {
        Self {
            kind: StepKind::MoveFile { file_size },
            source,
            target: Some(target),
            cost: MOVE_FILE_COST,
            flags: StepFlags::default(),
        }
    }

    pub fn move_dir(source: PathBuf, target: PathBuf) -> Self {
        Self {
            kind: StepKind::MoveDir,
            source,
            target: Some(target),
            cost: MOVE_DIR_COST,
            flags: StepFlags::default(),
        }
    }

    pub fn delete_file(source: PathBuf) -> Self {
        Self {
            kind: StepKind::DeleteFile,
            source,
            target: None,
            cost: DELETE_FILE_COST,
            flags: StepFlags::default(),
        }
    }

    pub fn delete_dir(source: PathBuf) -> Self {
        Self {
            kind: StepKind::DeleteDir,
            source,
            target: None,
            cost: DELETE_DIR_COST,
            flags: StepFlags::default(),
        }
    }

    pub fn delete_dir_link(source: PathBuf) -> Self {
        Self {
            kind: StepKind::DeleteDirLink,
            source,
            target: None,
            cost: DELETE_DIRLINK_COST,
            flags: StepFlags::default(),
        }
    }

    pub fn create_dir(target: PathBuf) -> Self {
        Self {
            kind: StepKind::CreateDir,
            source: target.clone(),
            target: Some(target),
            cost: CREATE_DIR_COST,
            flags: StepFlags::default(),
        }
    }

    pub fn change_attrs(source: PathBuf, change: AttrChange) -> Self {
        Self {
            kind: StepKind::ChangeAttrs(change),
            source,
            target: None,
            cost: CHANGE_ATTRS_COST,
            flags: StepFlags::default(),
        }
    }

    pub fn count_size(source: PathBuf, cost: u64) -> Self {
        Self {
            kind: StepKind::CountSize,
            source,
            target: None,
            cost,
            flags: StepFlags::default(),
        }
    }

    pub fn convert_file(source: PathBuf, file_size: u64, table: ConvertTable) -> Self {
        Self {
            kind: StepKind::ConvertFile { table },
            source,
            target: None,
            cost: file_size.max(CONVERT_MIN_COST),
            flags: StepFlags::default(),
        }
    }

    pub fn copy_dir_time(source: PathBuf, modified: SystemTime) -> Self {
        Self {
            kind: StepKind::CopyDirTime { modified },
            source,
            target: None,
            cost: 0,
            flags: StepFlags::default(),
        }
    }

    pub fn skip_label(create_dir_index: usize, skipped_cost: u64) -> Self {
        Self {
            kind: StepKind::SkipLabel {
                skipped_cost,
                create_dir_index,
            },
            source: PathBuf::new(),
            target: None,
            cost: 0,
            flags: StepFlags::default(),
        }
    }

    pub fn with_flags(mut self, flags: StepFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A path the operation touches, reported so the UI can refresh the
/// affected panels when the operation ends
#[derive(Debug, Clone)]
pub struct WorkPath {
    pub path: PathBuf,
    pub include_subdirs: bool,
}

/// The ordered plan for one copy/move/delete/attrs/convert invocation
#[derive(Debug, Default)]
pub struct OperationScript {
    steps: Vec<Step>,
    started: bool,

    /// Real byte total of the files involved (the "X of Y" status line);
    /// unlike step costs this is exact
    pub total_file_size: u64,
    pub files_count: u32,
    pub dirs_count: u32,

    /// Root of the source selection, probed before first touch;
    /// must name an existing path
    pub source_root: Option<PathBuf>,
    /// Existing base of the target, probed and free-space-checked
    /// before start
    pub target_root: Option<PathBuf>,
    /// Touched paths for post-operation change notifications; the
    /// progress dialog reads these when the worker terminates
    pub work_paths: Vec<WorkPath>,

    /// True = copy, false = move/delete/other (status line wording)
    pub is_copy: bool,
    /// Overwrite older targets and skip newer ones without prompting
    pub overwrite_older: bool,
    /// Restore directory timestamps after processing their contents
    pub preserve_dir_time: bool,
    /// Wait in the operations queue until nothing else runs
    pub start_on_idle: bool,
    /// The speed limit may change mid-run; hold at buffer boundaries
    pub change_speed_limit: bool,
    /// At least one item was renamed in place, so the transferred-bytes
    /// line would be misleading
    pub fast_move_used: bool,
}

impl OperationScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step; fails once execution has started
    pub fn push(&mut self, step: Step) -> Result<()> {
        debug_assert!(!self.started, "script modified after start");
        if self.started {
            return Err(OpError::Setup("script modified after start".into()));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Seal the script for execution; calling twice is a programmer error
    pub fn mark_started(&mut self) {
        debug_assert!(!self.started, "script started twice");
        if self.started {
            tracing::error!("OperationScript::mark_started called twice");
        }
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Sum of step costs; seeds the progress denominator at hand-off
    pub fn total_cost(&self) -> u64 {
        self.steps.iter().map(|s| s.cost).sum()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Index of the skip label paired with the CreateDir step at
    /// `create_dir_index`, if the planner emitted one
    pub fn skip_label_for(&self, create_dir_index: usize) -> Option<usize> {
        self.steps[create_dir_index + 1..]
            .iter()
            .position(|s| {
                matches!(
                    s.kind,
                    StepKind::SkipLabel { create_dir_index: idx, .. } if idx == create_dir_index
                )
            })
            .map(|offset| create_dir_index + 1 + offset)
    }
}
