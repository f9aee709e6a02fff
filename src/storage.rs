//! Persistence of captured stills to the transient cache area.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::error::{CaptureError, Result};
use crate::traits::FrameHandle;

/// File name prefix of every persisted still.
pub const FILE_PREFIX: &str = "captured_image_";

/// Process-wide, so stores sharing a directory never allocate the same name.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Location of a durably written still. The only handle to the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocator(PathBuf);

impl StorageLocator {
    /// Absolute path of the written file.
    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Consume the locator, yielding the path.
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl fmt::Display for StorageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Writes one file per captured still.
#[derive(Debug)]
pub struct FrameStore {
    dir: PathBuf,
}

impl FrameStore {
    /// Store frames under `dir`. The directory is created on first write.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Write `frame` to a new, uniquely named file and return its locator.
    ///
    /// The frame is consumed either way; on failure its bytes are dropped.
    pub fn persist(&self, frame: FrameHandle) -> Result<StorageLocator> {
        fs::create_dir_all(&self.dir).map_err(|source| CaptureError::Persistence {
            path: self.dir.clone(),
            source,
        })?;

        let dir = fs::canonicalize(&self.dir).map_err(|source| CaptureError::Persistence {
            path: self.dir.clone(),
            source,
        })?;
        let path = dir.join(Self::next_file_name(&frame));

        let write = || -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
            file.write_all(&frame.data)?;
            file.sync_all()
        };
        write().map_err(|source| CaptureError::Persistence {
            path: path.clone(),
            source,
        })?;

        info!(
            path = %path.display(),
            bytes = frame.data.len(),
            "still persisted"
        );
        Ok(StorageLocator(path))
    }

    fn next_file_name(frame: &FrameHandle) -> String {
        let millis = frame.metadata.captured_at.timestamp_millis();
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{FILE_PREFIX}{millis}_{seq}.{}",
            frame.metadata.encoding.extension()
        );
        debug!(%name, "allocated still file name");
        name
    }
}
