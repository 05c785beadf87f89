//! Zip archive builds, deduplicated per source directory.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::{Result, ShareError};
use crate::paths::{self, PathTranslator, ROOT};
use crate::protocol::ServerMessage;
use crate::push::PushDispatcher;

const ROOT_ARCHIVE_NAME: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveRequest {
    Started,
    /// A build for the same directory is in flight; the caller will be
    /// notified when it completes.
    AlreadyRunning,
}

#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    pub zip_dir: PathBuf,
    /// Deflate level, 0-9.
    pub level: i64,
}

type JobTable = Arc<Mutex<HashMap<String, HashSet<String>>>>;

pub struct ArchiveJobManager {
    config: ArchiveConfig,
    translator: PathTranslator,
    dispatcher: Arc<PushDispatcher>,
    jobs: JobTable,
}

impl fmt::Debug for ArchiveJobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveJobManager")
            .field("config", &self.config)
            .field("in_flight", &self.jobs.lock().len())
            .finish()
    }
}

impl ArchiveJobManager {
    pub fn new(
        config: ArchiveConfig,
        translator: PathTranslator,
        dispatcher: Arc<PushDispatcher>,
    ) -> Self {
        Self {
            config,
            translator,
            dispatcher,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Queue an archive of the directory at `logical` for `token`.
    pub async fn request_archive(
        self: &Arc<Self>,
        token: &str,
        logical: &str,
    ) -> Result<ArchiveRequest> {
        let logical = paths::normalize(logical)?;
        let source = self.translator.to_fs(&logical)?;

        {
            let mut jobs = self.jobs.lock();
            if let Some(waiters) = jobs.get_mut(&logical) {
                waiters.insert(token.to_string());
                debug!(path = %logical, "archive already in progress; joined as waiter");
                return Ok(ArchiveRequest::AlreadyRunning);
            }
            jobs.insert(logical.clone(), HashSet::from([token.to_string()]));
        }
        let guard = JobGuard {
            jobs: Arc::clone(&self.jobs),
            path: logical.clone(),
            finished: false,
        };

        let meta = tokio::fs::metadata(&source)
            .await
            .map_err(|err| ShareError::from_io(err, &logical))?;
        if !meta.is_dir() {
            return Err(ShareError::InvalidPath(logical));
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(guard, source).await });
        Ok(ArchiveRequest::Started)
    }

    pub fn in_flight(&self, logical: &str) -> bool {
        self.jobs.lock().contains_key(logical)
    }

    /// Location of the finished archive relative to the zip directory.
    ///
    /// Each archive sits in a directory named by the SHA-256 of its logical
    /// path, so distinct sources never share a location. The file keeps the
    /// directory's base name for the download.
    pub fn archive_location(logical: &str) -> String {
        let digest = hex::encode(Sha256::digest(logical.as_bytes()));
        let name = match paths::basename(logical) {
            "" => ROOT_ARCHIVE_NAME,
            name => name,
        };
        format!("{digest}/{name}.zip")
    }

    /// Resolve a download request under the zip directory.
    pub fn resolve_download(&self, relative: &str) -> Result<PathBuf> {
        let segments = paths::validate_relative(relative)?;
        let mut path = self.config.zip_dir.clone();
        path.extend(segments);
        Ok(path)
    }

    async fn run(&self, guard: JobGuard, source: PathBuf) {
        let logical = guard.path.clone();
        let location = Self::archive_location(&logical);
        let target = self.config.zip_dir.join(&location);
        let level = self.config.level;
        let strip_base = if logical == ROOT {
            source.clone()
        } else {
            source.parent().map(Path::to_path_buf).unwrap_or_else(|| source.clone())
        };

        info!(path = %logical, "building archive");
        let result =
            spawn_blocking(move || build_archive(&source, &strip_base, &target, level)).await;

        let size = match result {
            Ok(Ok(size)) => size,
            Ok(Err(err)) => {
                error!(path = %logical, error = %err, "archive build failed");
                return;
            }
            Err(join_err) => {
                error!(path = %logical, error = %join_err, "archive task panicked");
                return;
            }
        };

        let waiters = guard.finish();
        info!(path = %logical, size, waiters = waiters.len(), "archive ready");
        for token in waiters {
            let message = ServerMessage::ZipReady {
                path: location.clone(),
                size,
            };
            self.dispatcher.notify(&token, message, false).await;
        }
    }
}

/// Removes the job from the in-flight table however the build ends.
struct JobGuard {
    jobs: JobTable,
    path: String,
    finished: bool,
}

impl JobGuard {
    fn finish(mut self) -> HashSet<String> {
        self.finished = true;
        self.jobs.lock().remove(&self.path).unwrap_or_default()
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.jobs.lock().remove(&self.path);
        }
    }
}

fn build_archive(source: &Path, strip_base: &Path, target: &Path, level: i64) -> Result<u64> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let partial = target.with_extension("zip.partial");
    let file = File::create(&partial)?;
    let mut writer = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(level));

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable archive entry");
                continue;
            }
        };
        let Some(name) = entry_name(entry.path(), strip_base) else {
            continue;
        };

        if entry.file_type().is_dir() {
            writer.add_directory(name, options).map_err(zip_error)?;
        } else if entry.file_type().is_file() {
            let mut input = match File::open(entry.path()) {
                Ok(input) => input,
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "skipping unreadable file");
                    continue;
                }
            };
            writer.start_file(name, options).map_err(zip_error)?;
            if let Err(err) = io::copy(&mut input, &mut writer) {
                warn!(path = %entry.path().display(), error = %err, "file truncated in archive");
            }
        }
    }

    let mut inner = writer.finish().map_err(zip_error)?;
    io::Write::flush(&mut inner)?;
    drop(inner);

    std::fs::rename(&partial, target)?;
    Ok(std::fs::metadata(target)?.len())
}

/// `/`-separated entry name relative to `base`; `None` for the base itself.
fn entry_name(path: &Path, base: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|component| match component {
            Component::Normal(seg) => Some(seg.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn zip_error(err: zip::result::ZipError) -> ShareError {
    ShareError::Internal(format!("zip: {err}"))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    #[test]
    fn archive_locations_keep_base_name() {
        let root = ArchiveJobManager::archive_location("/");
        let sub = ArchiveJobManager::archive_location("/docs/sub");
        assert!(root.ends_with("/root.zip"), "{root}");
        assert!(sub.ends_with("/sub.zip"), "{sub}");
        assert!(paths::validate_relative(&sub).is_ok());
        assert_eq!(sub, ArchiveJobManager::archive_location("/docs/sub"));
    }

    #[test]
    fn root_and_root_named_directory_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let files = tmp.path().join("files");
        let zip_dir = tmp.path().join("zip");
        std::fs::create_dir_all(files.join("root")).unwrap();
        std::fs::write(files.join("top.txt"), b"top").unwrap();
        std::fs::write(files.join("root/inner.txt"), b"inner").unwrap();

        let whole = zip_dir.join(ArchiveJobManager::archive_location("/"));
        let nested = zip_dir.join(ArchiveJobManager::archive_location("/root"));
        assert_ne!(whole, nested);

        build_archive(&files, &files, &whole, 1).unwrap();
        build_archive(&files.join("root"), &files, &nested, 1).unwrap();

        let names = |path: &Path| {
            let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
            let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
            names.sort();
            names
        };
        assert_eq!(names(&whole), vec!["root/", "root/inner.txt", "top.txt"]);
        assert_eq!(names(&nested), vec!["root/", "root/inner.txt"]);
    }

    #[test]
    fn builds_archive_with_relative_names() {
        let tmp = tempfile::tempdir().unwrap();
        let files = tmp.path().join("files");
        std::fs::create_dir_all(files.join("docs/inner")).unwrap();
        std::fs::write(files.join("docs/a.txt"), b"alpha").unwrap();
        std::fs::write(files.join("docs/inner/b.txt"), b"beta").unwrap();

        let target = tmp.path().join("zip/docs.zip");
        let size = build_archive(&files.join("docs"), &files, &target, 1).unwrap();
        assert!(size > 0);
        assert!(!tmp.path().join("zip/docs.zip.partial").exists());

        let mut archive = zip::ZipArchive::new(File::open(&target).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["docs/", "docs/a.txt", "docs/inner/", "docs/inner/b.txt"]
        );

        let mut contents = String::new();
        archive
            .by_name("docs/inner/b.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "beta");
    }

    #[test]
    fn guard_releases_job_on_drop() {
        let jobs: JobTable = Arc::new(Mutex::new(HashMap::new()));
        jobs.lock()
            .insert("/docs".into(), HashSet::from(["t".to_string()]));
        let guard = JobGuard {
            jobs: Arc::clone(&jobs),
            path: "/docs".into(),
            finished: false,
        };
        drop(guard);
        assert!(jobs.lock().is_empty());
    }
}
