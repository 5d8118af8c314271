//! Shared append-only record log backed by a single flat file.
//!
//! All mutation and read-back goes through one exclusive lock. Callers that
//! echo the log back to a client hold the same guard across the append, the
//! full read-back, and the socket write, so a client never observes a
//! half-written record from a concurrent appender.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// The shared append-only log.
///
/// The file itself is reopened per operation; the `Mutex` is what serializes
/// appenders and guarantees that an append and its read-back are atomic as a
/// pair.
pub struct RecordLog {
    path: PathBuf,
    lock: Mutex<()>,
}

/// Exclusive access to the log for one append-plus-read-back cycle.
pub struct LogGuard<'a> {
    log: &'a RecordLog,
    _guard: MutexGuard<'a, ()>,
}

impl RecordLog {
    /// Create the log at `path`, truncating any leftover contents from a
    /// previous run.
    pub async fn create(path: impl Into<PathBuf>) -> io::Result<Arc<Self>> {
        let path = path.into();
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "Record log created");
        Ok(Arc::new(Self {
            path,
            lock: Mutex::new(()),
        }))
    }

    /// Acquire exclusive access to the log.
    pub async fn lock(&self) -> LogGuard<'_> {
        LogGuard {
            log: self,
            _guard: self.lock.lock().await,
        }
    }

    /// Delete the backing file. Takes the lock so an in-flight append
    /// completes first.
    pub async fn remove(&self) -> io::Result<()> {
        let _guard = self.lock.lock().await;
        tokio::fs::remove_file(&self.path).await?;
        info!(path = %self.path.display(), "Record log removed");
        Ok(())
    }
}

impl LogGuard<'_> {
    /// Append `bytes` to the end of the log.
    pub async fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log.path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        debug!(len = bytes.len(), "Appended record");
        Ok(())
    }

    /// Read the complete current contents, oldest-first.
    pub async fn read_all(&self) -> io::Result<Vec<u8>> {
        tokio::fs::read(&self.log.path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("echolog-store-{}-{}", std::process::id(), name))
    }

    #[tokio::test]
    async fn test_create_truncates_previous_contents() {
        let path = temp_path("truncate");
        std::fs::write(&path, b"stale\n").unwrap();

        let log = RecordLog::create(&path).await.unwrap();
        let guard = log.lock().await;
        assert!(guard.read_all().await.unwrap().is_empty());
        drop(guard);

        log.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_then_read_back_under_one_guard() {
        let path = temp_path("append");
        let log = RecordLog::create(&path).await.unwrap();

        let guard = log.lock().await;
        guard.append(b"hello\n").await.unwrap();
        assert_eq!(guard.read_all().await.unwrap(), b"hello\n");
        drop(guard);

        let guard = log.lock().await;
        guard.append(b"world\n").await.unwrap();
        assert_eq!(guard.read_all().await.unwrap(), b"hello\nworld\n");
        drop(guard);

        log.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_delimiter_only_record() {
        let path = temp_path("delim");
        let log = RecordLog::create(&path).await.unwrap();

        let guard = log.lock().await;
        guard.append(b"\n").await.unwrap();
        assert_eq!(guard.read_all().await.unwrap(), b"\n");
        drop(guard);

        log.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_interleave() {
        let path = temp_path("concurrent");
        let log = RecordLog::create(&path).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let log = Arc::clone(&log);
            tasks.push(tokio::spawn(async move {
                let mut record = vec![b'a' + i; 64];
                record.push(b'\n');
                let guard = log.lock().await;
                guard.append(&record).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let guard = log.lock().await;
        let contents = guard.read_all().await.unwrap();
        drop(guard);

        // Every line must be one uniform 64-byte run: no byte interleaving.
        let lines: Vec<&[u8]> = contents.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 8);
        for line in lines {
            assert_eq!(line.len(), 64);
            assert!(line.iter().all(|&b| b == line[0]));
        }

        log.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_deletes_file() {
        let path = temp_path("remove");
        let log = RecordLog::create(&path).await.unwrap();
        assert!(path.exists());
        log.remove().await.unwrap();
        assert!(!path.exists());
    }
}
