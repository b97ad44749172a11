//! Script-file change detection for hot reload.
//!
//! The run loop polls the watcher between quanta; the watcher stats the
//! script file at most once per elapsed wall-clock second and reports when
//! the modification timestamp differs from the baseline recorded at
//! construction. That report is the sole reload trigger: the run loop exits
//! and the supervisor restarts the whole runtime.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Watches one file's modification timestamp against a fixed baseline.
#[derive(Debug)]
pub struct ScriptWatcher {
    path: PathBuf,
    baseline: Option<SystemTime>,
    last_check_secs: u64,
}

impl ScriptWatcher {
    /// Record the baseline timestamp of `path`. A file that cannot be
    /// stat'ed yet gets its baseline adopted on the first successful check.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let baseline = mtime(&path);
        Self {
            path,
            baseline,
            last_check_secs: 0,
        }
    }

    /// True once the file's modification timestamp differs from the
    /// baseline. Throttled to one stat per elapsed second; stat failures
    /// are ignored and never trigger.
    pub fn poll_changed(&mut self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now <= self.last_check_secs {
            return false;
        }
        self.last_check_secs = now;

        let Some(current) = mtime(&self.path) else {
            return false;
        };
        match self.baseline {
            Some(baseline) => baseline != current,
            None => {
                self.baseline = Some(current);
                false
            }
        }
    }

    /// The watched path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;
    use std::time::Duration;

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("Should create temp dir");
        let path = dir.path().join("script.lua");
        let mut f = File::create(&path).expect("Should create file");
        writeln!(f, "-- fixture").expect("Should write");
        (dir, path)
    }

    fn bump_mtime(path: &Path, by: Duration) {
        let f = File::options()
            .write(true)
            .open(path)
            .expect("Should open file");
        let current = f
            .metadata()
            .expect("Should stat")
            .modified()
            .expect("Should read mtime");
        f.set_modified(current + by).expect("Should set mtime");
    }

    #[test]
    fn test_unchanged_file_never_triggers() {
        let (_dir, path) = fixture();
        let mut watcher = ScriptWatcher::new(path);
        assert!(!watcher.poll_changed());
    }

    #[test]
    fn test_mtime_change_triggers_on_first_check() {
        let (_dir, path) = fixture();
        let mut watcher = ScriptWatcher::new(path.clone());
        bump_mtime(&path, Duration::from_secs(5));
        assert!(watcher.poll_changed());
    }

    #[test]
    fn test_checks_throttled_to_one_per_second() {
        let (_dir, path) = fixture();
        let mut watcher = ScriptWatcher::new(path.clone());
        assert!(!watcher.poll_changed());

        // The change lands after the first check; within the same second
        // the watcher must not stat again.
        bump_mtime(&path, Duration::from_secs(5));
        assert!(!watcher.poll_changed());

        std::thread::sleep(Duration::from_millis(1100));
        assert!(watcher.poll_changed());
    }

    #[test]
    fn test_missing_file_is_silent() {
        let (dir, path) = fixture();
        let mut watcher = ScriptWatcher::new(path.clone());
        std::fs::remove_file(&path).expect("Should remove");
        assert!(!watcher.poll_changed());
        drop(dir);
    }
}
