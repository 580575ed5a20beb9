//! LightningOps - command-line driver for the operation engine
//!
//! Copies a directory tree with live progress on stdout. Exists for
//! smoke-testing the engine outside the file manager:
//!
//!     lightning_ops <source-dir> <target-dir> [speed-limit-bytes-per-sec]

use anyhow::{bail, Context, Result};
use app_fs::{DiskFs, UniversalPath};
use app_ops::{
    AutoResolver, Decision, EngineConfig, OperationScript, Step, TimeLeft, WorkerContext,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() -> Result<()> {
    // Initialize logging and panic hook first
    app_log::init()?;

    // Clean up old logs (7 days)
    if let Err(e) = app_log::cleanup_old_logs(7) {
        tracing::warn!("Failed to cleanup old logs: {}", e);
    }

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("usage: {} <source-dir> <target-dir> [speed-limit-bps]", args[0]);
    }
    // UNC-prefixed on Windows so deep trees survive MAX_PATH
    let source = UniversalPath::new(&args[1]);
    let target = UniversalPath::new(&args[2]);

    let mut config = EngineConfig::load();
    if let Some(limit) = args.get(3) {
        config.speed_limit = Some(limit.parse().context("speed limit must be a number")?);
    }

    tracing::info!("copying {} -> {} (limit: {:?})", source, target, config.speed_limit);

    let script = plan_copy(source.as_path(), target.as_path())?;
    let steps = script.len();

    let ctx = WorkerContext::new(
        Arc::new(DiskFs::new()),
        Arc::new(AutoResolver(Decision::Skip)),
        config,
    );
    let handle = app_ops::start(script, ctx).map_err(|e| anyhow::anyhow!("{}", e))?;
    let status = handle.status();

    let started = Instant::now();
    let mut time_left = TimeLeft::new();
    while !handle.is_finished() {
        std::thread::sleep(Duration::from_millis(500));
        let snap = status.snapshot();
        let percent = if snap.total_cost > 0 {
            snap.progress * 100 / snap.total_cost
        } else {
            100
        };
        let eta = time_left.update(
            started.elapsed().as_millis() as u64,
            snap.remaining_cost(),
            snap.progress_bps,
        );
        match eta {
            Some(secs) => println!(
                "{:>3}%  {} / {} bytes, {} B/s, ~{} s left",
                percent, snap.transferred, snap.total_file_size, snap.transfer_bps, secs
            ),
            None => println!(
                "{:>3}%  {} / {} bytes",
                percent, snap.transferred, snap.total_file_size
            ),
        }
    }

    let summary = handle.wait();
    println!(
        "{:?}: {}/{} steps, {} skipped, {} bytes in {:.1?}",
        summary.outcome,
        summary.completed_steps,
        steps,
        summary.skipped_items,
        status.snapshot().transferred,
        started.elapsed()
    );
    Ok(())
}

/// Minimal planning pass: walk the tree, emit create-dir/copy steps
/// with skip labels so a refused directory skips its whole subtree
fn plan_copy(source: &Path, target: &Path) -> Result<OperationScript> {
    let mut script = OperationScript::new();
    script.is_copy = true;
    script.source_root = Some(source.to_path_buf());
    // The target itself is created by the first step; probe and
    // free-space-check the directory it lands in
    let target_base = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => target,
    };
    script.target_root = Some(target_base.to_path_buf());
    script.work_paths = vec![app_ops::WorkPath {
        path: target.to_path_buf(),
        include_subdirs: true,
    }];

    let mut total_file_size = 0u64;
    let mut files = 0u32;
    let mut dirs = 0u32;
    plan_dir(source, target, &mut script, &mut total_file_size, &mut files, &mut dirs)?;

    script.total_file_size = total_file_size;
    script.files_count = files;
    script.dirs_count = dirs;
    Ok(script)
}

fn plan_dir(
    source: &Path,
    target: &Path,
    script: &mut OperationScript,
    total_file_size: &mut u64,
    files: &mut u32,
    dirs: &mut u32,
) -> Result<()> {
    *dirs += 1;
    let create_index = script.len();
    script
        .push(Step::create_dir(target.to_path_buf()))
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let subtree_start = script.total_cost();

    let mut entries: Vec<_> = std::fs::read_dir(source)
        .with_context(|| format!("cannot list {}", source.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            plan_dir(&path, &target.join(&name), script, total_file_size, files, dirs)?;
        } else {
            *files += 1;
            *total_file_size += meta.len();
            script
                .push(Step::copy_file(path, target.join(&name), meta.len()))
                .map_err(|e| anyhow::anyhow!("{}", e))?;
        }
    }

    let skipped_cost = script.total_cost() - subtree_start;
    script
        .push(Step::skip_label(create_index, skipped_cost))
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(())
}
