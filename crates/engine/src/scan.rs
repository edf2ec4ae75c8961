//! Input directory scanning and job building
//!
//! Each configured directory is walked recursively for video files, following
//! symlinks. Hidden directories and the output directory are skipped.
//! Discovery order is the walk order with entries sorted by file name, so caps
//! are reproducible.
//!
//! Outputs mirror the input tree: `out/<input dir name>/<relative path>`.

use crate::config::DirectoryLimits;
use crate::job::{Job, SourceClaim};
use crate::plan::Plan;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Video file extensions recognized by the scanner (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &[".mp4", ".avi", ".mov", ".mkv"];

/// Run-level scan failure
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Input directory {dir} is inaccessible: {source}")]
    Inaccessible {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Input path is not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Checks if a file has a video extension (case-insensitive).
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

fn is_excluded(path: &Path, excluded: &[PathBuf]) -> bool {
    if excluded.is_empty() {
        return false;
    }
    match std::fs::canonicalize(path) {
        Ok(canonical) => excluded.iter().any(|x| *x == canonical),
        Err(_) => false,
    }
}

/// Canonical forms of the directories the scanner must never descend into.
/// Paths that do not exist yet cannot hold files and are dropped.
pub fn exclusions(paths: &[&Path]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter_map(|p| std::fs::canonicalize(p).ok())
        .collect()
}

/// List video files under `dir`, keeping at most `cap` of them (0 = no cap).
///
/// A missing or unreadable root is a run-level error; unreadable entries
/// below it are logged and skipped.
pub fn scan_directory(
    dir: &Path,
    cap: usize,
    excluded: &[PathBuf],
) -> Result<Vec<PathBuf>, ScanError> {
    let meta = std::fs::metadata(dir).map_err(|source| ScanError::Inaccessible {
        dir: dir.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(ScanError::NotADirectory(dir.to_path_buf()));
    }

    let walker = WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let hidden = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with('.'))
                .unwrap_or(false);
            !hidden && !is_excluded(entry.path(), excluded)
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() && is_video_file(entry.path()) {
            files.push(entry.into_path());
            if cap > 0 && files.len() == cap {
                break;
            }
        }
    }

    Ok(files)
}

/// True if any directory still holds at least one video file
pub fn has_eligible_files(dirs: &[PathBuf], excluded: &[PathBuf]) -> Result<bool, ScanError> {
    for dir in dirs {
        if !scan_directory(dir, 1, excluded)?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// One output root per input directory, `output_dir/<dir name>`.
///
/// Directories sharing a base name get `_2`, `_3`, ... in configuration order,
/// so the mapping is stable across loop passes.
pub fn output_roots(dirs: &[PathBuf], output_dir: &Path) -> Vec<PathBuf> {
    let mut used = HashSet::new();
    dirs.iter()
        .map(|dir| {
            let base = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "input".to_string());
            let mut name = base.clone();
            let mut n = 2;
            while !used.insert(name.clone()) {
                name = format!("{}_{}", base, n);
                n += 1;
            }
            output_dir.join(name)
        })
        .collect()
}

/// `output_root/<path of source below input_dir>`; with several plans selected
/// the plan id is appended to the stem so outputs do not collide.
pub fn destination_for(
    input_dir: &Path,
    source: &Path,
    output_root: &Path,
    plan: &Plan,
    multi_plan: bool,
) -> PathBuf {
    let relative = source
        .strip_prefix(input_dir)
        .ok()
        .and_then(|rel| rel.parent())
        .map(|parent| output_root.join(parent))
        .unwrap_or_else(|| output_root.to_path_buf());

    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if !multi_plan {
        return relative.join(file_name);
    }

    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    match source.extension() {
        Some(ext) => relative.join(format!(
            "{}_plan{}.{}",
            stem,
            plan.id,
            ext.to_string_lossy()
        )),
        None => relative.join(format!("{}_plan{}", stem, plan.id)),
    }
}

/// Scan every directory and cross retained files with the selected plans.
///
/// A directory listed twice is scanned once, and a source whose destination is
/// already taken by another job is skipped, so no two jobs share an output.
pub fn build_jobs(
    dirs: &[PathBuf],
    limits: &DirectoryLimits,
    plans: &[Arc<Plan>],
    output_dir: &Path,
    excluded: &[PathBuf],
    gpu_eligible: bool,
) -> Result<Vec<Job>, ScanError> {
    let multi_plan = plans.len() > 1;
    let mut jobs = Vec::new();
    let mut scanned = HashSet::new();
    let mut taken = HashSet::new();

    for (dir, root) in dirs.iter().zip(output_roots(dirs, output_dir)) {
        let canonical = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.clone());
        if !scanned.insert(canonical) {
            warn!(dir = %dir.display(), "Directory listed more than once, scanning it once");
            continue;
        }
        let cap = limits.limit_for(dir);
        let files = scan_directory(dir, cap, excluded)?;
        if files.is_empty() {
            info!(dir = %dir.display(), "No video files found");
            continue;
        }
        debug!(dir = %dir.display(), files = files.len(), cap, "Directory scanned");

        for source in files {
            let destinations: Vec<PathBuf> = plans
                .iter()
                .map(|plan| destination_for(dir, &source, &root, plan, multi_plan))
                .collect();
            if let Some(clash) = destinations.iter().find(|d| taken.contains(*d)) {
                warn!(source = %source.display(), destination = %clash.display(), "Destination already used by another job, skipping");
                continue;
            }
            taken.extend(destinations.iter().cloned());

            let claim = SourceClaim::new(plans.len());
            for (plan, destination) in plans.iter().zip(destinations) {
                jobs.push(
                    Job::new(source.clone(), destination, plan.clone(), claim.clone())
                        .with_gpu_eligible(gpu_eligible),
                );
            }
        }
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::builtin_plans;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn plans(ids: &[u32]) -> Vec<Arc<Plan>> {
        builtin_plans()
            .into_iter()
            .filter(|p| ids.contains(&p.id))
            .map(Arc::new)
            .collect()
    }

    fn touch_videos(dir: &Path, names: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        for name in names {
            fs::write(dir.join(name), b"video").unwrap();
        }
    }

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file(Path::new("/in/clip.mp4")));
        assert!(is_video_file(Path::new("/in/clip.MOV")));
        assert!(is_video_file(Path::new("/in/clip.Mkv")));
        assert!(!is_video_file(Path::new("/in/clip.srt")));
        assert!(!is_video_file(Path::new("/in/clip")));
    }

    #[test]
    fn test_cap_truncates_in_discovery_order() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("batch");
        touch_videos(&dir, &["e.mp4", "c.mp4", "a.mp4", "d.mov", "b.avi"]);

        let mut caps = HashMap::new();
        caps.insert(dir.clone(), 2);
        let limits = DirectoryLimits::new(0, caps);

        let jobs = build_jobs(
            &[dir.clone()],
            &limits,
            &plans(&[1]),
            &temp.path().join("out"),
            &[],
            true,
        )
        .unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].source, dir.join("a.mp4"));
        assert_eq!(jobs[1].source, dir.join("b.avi"));
    }

    #[test]
    fn test_zero_cap_means_no_cap() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("batch");
        touch_videos(&dir, &["a.mp4", "b.mp4", "c.mp4", "notes.txt"]);

        let files = scan_directory(&dir, 0, &[]).unwrap();
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn test_empty_directory_yields_no_jobs() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("empty");
        fs::create_dir_all(&dir).unwrap();

        let jobs = build_jobs(
            &[dir.clone()],
            &DirectoryLimits::default(),
            &plans(&[1, 2]),
            &temp.path().join("out"),
            &[],
            true,
        )
        .unwrap();
        assert!(jobs.is_empty());
        assert!(!has_eligible_files(&[dir], &[]).unwrap());
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let temp = TempDir::new().unwrap();
        let result = scan_directory(&temp.path().join("gone"), 0, &[]);
        assert!(matches!(result, Err(ScanError::Inaccessible { .. })));

        let file = temp.path().join("file.mp4");
        File::create(&file).unwrap();
        assert!(matches!(
            scan_directory(&file, 0, &[]),
            Err(ScanError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_recurses_but_skips_hidden_and_output_dirs() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("batch");
        touch_videos(&dir.join("nested"), &["deep.mp4"]);
        touch_videos(&dir.join(".cache"), &["hidden.mp4"]);
        touch_videos(&dir.join("out"), &["encoded.mp4"]);

        let excluded = exclusions(&[&dir.join("out")]);
        let files = scan_directory(&dir, 0, &excluded).unwrap();
        assert_eq!(files, vec![dir.join("nested").join("deep.mp4")]);
    }

    #[test]
    fn test_jobs_cross_files_with_plans() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("batch");
        touch_videos(&dir, &["a.mp4", "b.mp4"]);
        let out = temp.path().join("out");

        let jobs = build_jobs(
            &[dir.clone()],
            &DirectoryLimits::default(),
            &plans(&[1, 3]),
            &out,
            &[],
            true,
        )
        .unwrap();

        assert_eq!(jobs.len(), 4);
        assert_eq!(jobs[0].destination, out.join("batch").join("a_plan1.mp4"));
        assert_eq!(jobs[1].destination, out.join("batch").join("a_plan3.mp4"));
        // both plans for one source share a claim
        assert!(Arc::ptr_eq(&jobs[0].claim, &jobs[1].claim));
        assert!(!Arc::ptr_eq(&jobs[1].claim, &jobs[2].claim));
    }

    #[test]
    fn test_single_plan_keeps_relative_path() {
        let plan = &plans(&[1])[0];
        let dest = destination_for(
            Path::new("/videos/batch"),
            Path::new("/videos/batch/sub/clip.mov"),
            Path::new("/out/batch"),
            plan,
            false,
        );
        assert_eq!(dest, PathBuf::from("/out/batch/sub/clip.mov"));
    }

    #[test]
    fn test_same_name_in_subdirectories_gets_distinct_outputs() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("batch");
        touch_videos(&dir.join("x"), &["clip.mp4"]);
        touch_videos(&dir.join("y"), &["clip.mp4"]);
        let out = temp.path().join("out");

        let jobs = build_jobs(
            &[dir.clone()],
            &DirectoryLimits::default(),
            &plans(&[1]),
            &out,
            &[],
            true,
        )
        .unwrap();

        let destinations: Vec<_> = jobs.iter().map(|j| j.destination.clone()).collect();
        assert_eq!(
            destinations,
            vec![
                out.join("batch").join("x").join("clip.mp4"),
                out.join("batch").join("y").join("clip.mp4"),
            ]
        );
    }

    #[test]
    fn test_input_dirs_with_same_base_name_get_separate_roots() {
        let temp = TempDir::new().unwrap();
        let first = temp.path().join("a").join("batch");
        let second = temp.path().join("b").join("batch");
        touch_videos(&first, &["clip.mp4"]);
        touch_videos(&second, &["clip.mp4"]);
        let out = temp.path().join("out");

        let jobs = build_jobs(
            &[first.clone(), second.clone()],
            &DirectoryLimits::default(),
            &plans(&[1]),
            &out,
            &[],
            true,
        )
        .unwrap();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].destination, out.join("batch").join("clip.mp4"));
        assert_eq!(jobs[1].destination, out.join("batch_2").join("clip.mp4"));
        assert_eq!(
            output_roots(&[first, second], &out),
            vec![out.join("batch"), out.join("batch_2")]
        );
    }

    #[test]
    fn test_directory_listed_twice_is_scanned_once() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("batch");
        touch_videos(&dir, &["a.mp4", "b.mp4"]);

        let jobs = build_jobs(
            &[dir.clone(), dir.clone()],
            &DirectoryLimits::default(),
            &plans(&[1]),
            &temp.path().join("out"),
            &[],
            false,
        )
        .unwrap();

        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| !j.gpu_eligible));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_videos_are_found() {
        let temp = TempDir::new().unwrap();
        let store = temp.path().join("store");
        touch_videos(&store, &["real.mp4"]);
        let dir = temp.path().join("batch");
        fs::create_dir_all(&dir).unwrap();
        std::os::unix::fs::symlink(store.join("real.mp4"), dir.join("linked.mp4")).unwrap();

        let files = scan_directory(&dir, 0, &[]).unwrap();
        assert_eq!(files, vec![dir.join("linked.mp4")]);
    }

    // For any file name, the scanner accepts it iff its extension is one of
    // mp4, avi, mov or mkv, ignoring case.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_video_extension_filtering(
            basename in "[a-zA-Z0-9_-]{1,20}",
            ext in prop_oneof![
                Just("mp4"), Just("MP4"), Just("avi"), Just("Avi"),
                Just("mov"), Just("MOV"), Just("mkv"), Just("MkV"),
                Just("m4v"), Just("ts"), Just("txt"), Just("srt"),
                Just("wav"), Just("jpg"),
            ],
        ) {
            let path = PathBuf::from(format!("/in/{}.{}", basename, ext));
            let expected = matches!(ext.to_lowercase().as_str(), "mp4" | "avi" | "mov" | "mkv");
            prop_assert_eq!(is_video_file(&path), expected);
        }

        #[test]
        fn prop_cap_bounds_jobs_per_directory(total in 0usize..8, cap in 0usize..6) {
            let temp = TempDir::new().unwrap();
            let dir = temp.path().join("batch");
            fs::create_dir_all(&dir).unwrap();
            for i in 0..total {
                fs::write(dir.join(format!("clip{}.mp4", i)), b"v").unwrap();
            }

            let limits = DirectoryLimits::new(cap, HashMap::new());
            let jobs = build_jobs(&[dir], &limits, &plans(&[1]), &temp.path().join("out"), &[], true).unwrap();

            let expected = if cap == 0 { total } else { total.min(cap) };
            prop_assert_eq!(jobs.len(), expected);
        }
    }
}
