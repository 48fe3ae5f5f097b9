use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// Extensions picked up by a static crawl.
pub const CRAWL_EXTENSIONS: [&str; 3] = ["php", "hck", "inc"];

/// Crawls that find more files than this log an advisory recommending a watch query.
pub const CRAWL_ADVISORY_THRESHOLD: usize = 100_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    /// Root-relative paths, sorted.
    pub files: Vec<PathBuf>,
    /// Whether the advisory threshold was crossed.
    pub exceeded_threshold: bool,
    /// Entries that could not be read and were skipped.
    pub walk_errors: u64,
}

/// Enumerates the files under `root` whose extension is in [`CRAWL_EXTENSIONS`].
pub fn crawl(root: &Path) -> io::Result<CrawlReport> {
    crawl_with_threshold(root, CRAWL_ADVISORY_THRESHOLD)
}

pub fn crawl_with_threshold(root: &Path, threshold: usize) -> io::Result<CrawlReport> {
    tracing::info!(target: "strata.vfs", root = %root.display(), "crawling repository");

    let mut report = walk_files(root, |path, is_dir| !is_dir && has_crawl_extension(path))?;
    if report.files.len() > threshold {
        report.exceeded_threshold = true;
        tracing::warn!(
            target: "strata.vfs",
            root = %root.display(),
            files = report.files.len(),
            threshold,
            "static crawl found a very large number of files; configure a watch query to \
             subscribe to changes instead"
        );
    }
    Ok(report)
}

/// Walks `root` without following symlinks and collects the root-relative paths of files
/// accepted by `filter`.
pub(crate) fn walk_files(
    root: &Path,
    filter: impl Fn(&Path, bool) -> bool,
) -> io::Result<CrawlReport> {
    let metadata = std::fs::metadata(root)?;
    if !metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        ));
    }

    let mut report = CrawlReport::default();
    let mut error_samples = 0u8;
    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                report.walk_errors += 1;
                if error_samples < 3 {
                    error_samples += 1;
                    tracing::debug!(
                        target: "strata.vfs",
                        root = %root.display(),
                        path = ?err.path(),
                        error = %err,
                        "failed to read entry while crawling; skipping"
                    );
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if filter(relative, false) {
            report.files.push(relative.to_path_buf());
        }
    }
    report.files.sort();
    Ok(report)
}

fn has_crawl_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| CRAWL_EXTENSIONS.contains(&ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"<?hh\n").unwrap();
    }

    #[test]
    fn crawl_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "a.php");
        touch(dir.path(), "lib/b.hck");
        touch(dir.path(), "lib/deep/c.inc");
        touch(dir.path(), "README.md");
        touch(dir.path(), "lib/d.PHP.bak");
        fs::create_dir_all(dir.path().join("empty.php")).unwrap();

        let report = crawl(dir.path()).unwrap();
        assert_eq!(
            report.files,
            vec![
                PathBuf::from("a.php"),
                PathBuf::from("lib/b.hck"),
                PathBuf::from("lib/deep/c.inc"),
            ]
        );
        assert!(!report.exceeded_threshold);
    }

    #[test]
    fn crossing_the_threshold_is_advisory_only() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            touch(dir.path(), &format!("f{i}.php"));
        }

        let report = crawl_with_threshold(dir.path(), 3).unwrap();
        assert_eq!(report.files.len(), 4);
        assert!(report.exceeded_threshold);

        let report = crawl_with_threshold(dir.path(), 4).unwrap();
        assert!(!report.exceeded_threshold);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(crawl(&dir.path().join("missing")).is_err());
    }
}
