use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Atomically replaces `dst` with `content` using write-to-temp-then-rename.
///
/// The temp file lives next to `dst` (same filesystem, so the rename is
/// atomic on POSIX) and is created with `create_new` so an existing path is
/// never clobbered or followed. On any failure the temp file is removed and
/// `dst` keeps its previous content: a reader never observes a truncated file
/// under the final name.
pub fn write_atomic(dst: &Path, content: &[u8]) -> io::Result<()> {
    let temp_path = temp_path_for(dst);

    let mut temp_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)?;

    let written = temp_file
        .write_all(content)
        .and_then(|()| temp_file.sync_all());
    drop(temp_file);

    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    // On Windows, rename fails if destination exists, so remove it first
    #[cfg(windows)]
    if dst.exists() {
        if let Err(e) = std::fs::remove_file(dst) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
    }

    std::fs::rename(&temp_path, dst).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp_path);
    })
}

/// Randomized sibling path: `<name>.tmp.<nanos><counter>`.
fn temp_path_for(dst: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dst.with_file_name(format!("{file_name}.tmp.{nanos:016x}{counter:04x}"))
}
