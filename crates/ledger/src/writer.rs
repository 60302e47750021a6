//! Append-only ledger writer.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::entry::{compute_hash, EventType, LedgerEntry, GENESIS_HASH};
use crate::LedgerError;

struct Inner {
    file: Option<File>,
    seq: u64,
    last_hash: String,
}

/// An open ledger file.
///
/// Appends are serialized behind an internal lock and flushed line-at-a-time.
/// Reopening an existing file resumes sequence numbering from its last entry;
/// a malformed tail is a fatal open error so a broken chain is never silently
/// restarted.
pub struct Ledger {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl Ledger {
    /// Create or open the ledger at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] on filesystem failures and
    /// [`LedgerError::CorruptTail`] when the last line of an existing file
    /// does not parse as an entry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (seq, last_hash) = match read_tail(&path)? {
            Some(tail_line) => {
                let entry: LedgerEntry =
                    serde_json::from_str(&tail_line).map_err(|e| LedgerError::CorruptTail {
                        path: path.display().to_string(),
                        detail: e.to_string(),
                    })?;
                (entry.seq, entry.hash)
            }
            None => (0, GENESIS_HASH.to_string()),
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), resume_seq = seq, "ledger opened");
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file: Some(file),
                seq,
                last_hash,
            }),
        })
    }

    /// Ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event, extending the hash chain.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Closed`] after [`Ledger::close`], otherwise
    /// propagates I/O and serialization failures.
    pub fn append(
        &self,
        session_id: &str,
        event_type: EventType,
        data: serde_json::Value,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut guard = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let inner = &mut *guard;
        let Some(file) = inner.file.as_mut() else {
            return Err(LedgerError::Closed);
        };

        let seq = inner.seq + 1;
        let ts = warden_core::ids::now_iso();
        let prev = inner.last_hash.clone();
        let hash = compute_hash(seq, &ts, &prev, event_type, &data);
        let entry = LedgerEntry {
            seq,
            ts,
            hash: hash.clone(),
            prev,
            session_id: session_id.to_string(),
            event_type,
            data,
        };

        let line = serde_json::to_string(&entry)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        inner.seq = seq;
        inner.last_hash = hash;
        Ok(entry)
    }

    /// Close the ledger; later appends fail with [`LedgerError::Closed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(file) = inner.file.take() {
            if let Err(e) = (&file).flush() {
                warn!(path = %self.path.display(), error = %e, "flush on close failed");
            }
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").field("path", &self.path).finish_non_exhaustive()
    }
}

/// Last non-empty line of the file, or `None` for a missing/empty file.
fn read_tail(path: &Path) -> Result<Option<String>, LedgerError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let reader = BufReader::new(file);
    let mut tail = None;
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            tail = Some(line);
        }
    }
    Ok(tail)
}
