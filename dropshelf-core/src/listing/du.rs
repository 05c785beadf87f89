use std::path::Path;

use tokio::fs;
use tracing::debug;

/// Recursive sum of the file sizes below `path`.
///
/// Walks depth-first with an explicit stack. Unreadable directories count as
/// empty and symlinked directories are not followed, so the result is always
/// a number rather than an error.
pub async fn aggregate(path: &Path) -> u64 {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_file() => return meta.len(),
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return 0,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "du: stat failed");
            return 0;
        }
    }

    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(path = %dir.display(), error = %err, "du: unreadable directory");
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    debug!(path = %dir.display(), error = %err, "du: listing interrupted");
                    break;
                }
            };

            let Ok(file_type) = entry.file_type().await else {
                continue;
            };

            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                if let Ok(meta) = entry.metadata().await {
                    total += meta.len();
                }
            } else if file_type.is_symlink()
                && let Ok(meta) = fs::metadata(entry.path()).await
                && meta.is_file()
            {
                total += meta.len();
            }
        }
    }

    total
}
