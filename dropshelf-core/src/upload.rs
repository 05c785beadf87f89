//! Staged uploads.
//!
//! Every part of a multipart request is written to a temp file in the
//! incoming directory, named after the hash of its final destination. Nothing
//! lands in the shared tree until the whole request has been received, at
//! which point [`UploadBatch::commit`] moves the files into place.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use futures::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, ShareError};
use crate::paths::{self, PathTranslator};

#[derive(Debug, Clone)]
pub struct UploadStager {
    translator: PathTranslator,
    incoming_dir: PathBuf,
}

impl UploadStager {
    pub fn new(translator: PathTranslator, incoming_dir: impl Into<PathBuf>) -> Self {
        Self {
            translator,
            incoming_dir: incoming_dir.into(),
        }
    }

    /// Start a batch whose relative destinations resolve against `base_dir`.
    pub fn begin(&self, token: impl Into<String>, base_dir: impl Into<String>) -> UploadBatch {
        UploadBatch {
            stager: self.clone(),
            token: token.into(),
            base_dir: base_dir.into(),
            staged: Vec::new(),
        }
    }
}

struct StagedFile {
    temp: PathBuf,
    destination: PathBuf,
    logical: String,
}

/// Files received so far for one upload request.
pub struct UploadBatch {
    stager: UploadStager,
    token: String,
    base_dir: String,
    staged: Vec<StagedFile>,
}

impl fmt::Debug for UploadBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadBatch")
            .field("base_dir", &self.base_dir)
            .field("staged", &self.staged.len())
            .finish_non_exhaustive()
    }
}

impl UploadBatch {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn base_dir(&self) -> &str {
        &self.base_dir
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Stream one part into its temp file. On any failure the whole batch
    /// is discarded, temp files included, and the error is returned.
    pub async fn stage_stream<S, B, E>(&mut self, relative: &str, stream: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        match self.write_part(relative, stream).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%relative, error = %err, "upload staging failed; discarding batch");
                self.discard().await;
                Err(err)
            }
        }
    }

    async fn write_part<S, B, E>(&mut self, relative: &str, stream: S) -> Result<()>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: fmt::Display,
    {
        let segments = paths::validate_relative(relative)?;
        let logical = paths::join(&self.base_dir, &segments.join("/"));
        let destination = self.stager.translator.to_fs(&logical)?;
        let temp = self.stager.incoming_dir.join(temp_name(&destination));

        // Register before writing so a failure mid-stream still cleans up.
        if !self.staged.iter().any(|staged| staged.temp == temp) {
            self.staged.push(StagedFile {
                temp: temp.clone(),
                destination,
                logical: logical.clone(),
            });
        }

        let mut file = fs::File::create(&temp).await?;
        let mut stream = std::pin::pin!(stream);
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|err| ShareError::Internal(format!("upload stream failed: {err}")))?;
            let bytes = chunk.as_ref();
            file.write_all(bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;

        debug!(path = %logical, bytes = written, "staged upload part");
        Ok(())
    }

    /// Remove every temp file of this batch.
    pub async fn discard(&mut self) {
        for staged in self.staged.drain(..) {
            remove_quietly(&staged.temp).await;
        }
    }

    /// Move every staged file to its destination. Files that cannot be
    /// placed are logged and skipped. Returns the logical paths placed.
    pub async fn commit(mut self) -> Vec<String> {
        let mut placed = Vec::with_capacity(self.staged.len());
        for staged in std::mem::take(&mut self.staged) {
            match place(&staged.temp, &staged.destination).await {
                Ok(()) => placed.push(staged.logical),
                Err(err) => {
                    warn!(path = %staged.logical, error = %err, "failed to place uploaded file");
                    remove_quietly(&staged.temp).await;
                }
            }
        }
        info!(files = placed.len(), dir = %self.base_dir, "upload committed");
        placed
    }
}

impl Drop for UploadBatch {
    /// A batch dropped without `commit` or `discard` (for example when the
    /// request future is cancelled) must not leave temp files behind.
    fn drop(&mut self) {
        for staged in self.staged.drain(..) {
            if let Err(err) = std::fs::remove_file(&staged.temp)
                && err.kind() != io::ErrorKind::NotFound
            {
                debug!(path = %staged.temp.display(), error = %err, "failed to remove temp file");
            }
        }
    }
}

async fn place(temp: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }
    match fs::rename(temp, destination).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(temp, destination).await?;
            fs::remove_file(temp).await
        }
        Err(err) => Err(err),
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path).await
        && err.kind() != io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %err, "failed to remove temp file");
    }
}

fn temp_name(destination: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(destination.as_os_str().as_encoded_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn chunks(
        parts: &[&'static str],
    ) -> impl Stream<Item = std::result::Result<&'static [u8], io::Error>> + use<> {
        let items: Vec<std::result::Result<&'static [u8], io::Error>> =
            parts.iter().copied().map(|p| Ok(p.as_bytes())).collect();
        stream::iter(items)
    }

    fn stager(tmp: &Path) -> UploadStager {
        std::fs::create_dir_all(tmp.join("files")).unwrap();
        std::fs::create_dir_all(tmp.join("incoming")).unwrap();
        UploadStager::new(PathTranslator::new(tmp.join("files")), tmp.join("incoming"))
    }

    fn incoming_is_empty(tmp: &Path) -> bool {
        std::fs::read_dir(tmp.join("incoming")).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn nothing_lands_before_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let stager = stager(tmp.path());
        let mut batch = stager.begin("tok", "/docs");

        batch.stage_stream("a.txt", chunks(&["hel", "lo"])).await.unwrap();
        batch.stage_stream("sub/b.txt", chunks(&["world"])).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(!tmp.path().join("files/docs/a.txt").exists());

        let placed = batch.commit().await;
        assert_eq!(placed, vec!["/docs/a.txt", "/docs/sub/b.txt"]);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("files/docs/a.txt")).unwrap(),
            "hello"
        );
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("files/docs/sub/b.txt")).unwrap(),
            "world"
        );
        assert!(incoming_is_empty(tmp.path()));
    }

    #[tokio::test]
    async fn failed_part_discards_batch() {
        let tmp = tempfile::tempdir().unwrap();
        let stager = stager(tmp.path());
        let mut batch = stager.begin("tok", "/");

        batch.stage_stream("ok.txt", chunks(&["fine"])).await.unwrap();
        let broken = stream::iter(vec![
            Ok(b"part".as_slice()),
            Err(io::Error::other("connection reset")),
        ]);
        assert!(batch.stage_stream("broken.txt", broken).await.is_err());
        assert!(batch.is_empty());
        assert!(incoming_is_empty(tmp.path()));

        assert!(batch.commit().await.is_empty());
        assert!(!tmp.path().join("files/ok.txt").exists());
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let stager = stager(tmp.path());
        let mut batch = stager.begin("tok", "/");

        let err = batch
            .stage_stream("../escape.txt", chunks(&["x"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ShareError::InvalidPath(_)));
        assert!(incoming_is_empty(tmp.path()));
    }

    #[tokio::test]
    async fn dropped_batch_removes_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let stager = stager(tmp.path());
        let mut batch = stager.begin("tok", "/");

        batch.stage_stream("big.bin", chunks(&["half of it"])).await.unwrap();
        assert!(!incoming_is_empty(tmp.path()));

        drop(batch);
        assert!(incoming_is_empty(tmp.path()));
        assert!(!tmp.path().join("files/big.bin").exists());
    }

    #[test]
    fn temp_names_are_stable_hex() {
        let a = temp_name(Path::new("/srv/files/a.txt"));
        assert_eq!(a, temp_name(Path::new("/srv/files/a.txt")));
        assert_ne!(a, temp_name(Path::new("/srv/files/b.txt")));
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
    }
}
