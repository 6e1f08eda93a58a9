//! Serial number providers backing the standard-envelope sequence
//! fields. The standalone provider owns per-id JSON documents with
//! `.lock` sentinels under its data directory; the memory provider
//! serves tests and single-process deployments.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use micra_core::formatter::SerialNumberProvider;
use micra_core::{MicraError, Result};

/// Render a serial as a fixed-width decimal, keeping the low digits
/// on overflow.
pub fn serial_fix_str(serial: u64, width: usize) -> String {
    let modulus = 10u64.checked_pow(width as u32).unwrap_or(u64::MAX);
    let bounded = if modulus == u64::MAX { serial } else { serial % modulus };
    format!("{:0width$}", bounded, width = width)
}

/// In-process counter provider.
#[derive(Default)]
pub struct MemorySerialNumbers {
    counters: DashMap<String, u64>,
}

impl MemorySerialNumbers {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }
}

#[async_trait]
impl SerialNumberProvider for MemorySerialNumbers {
    async fn next(&self, id: &str) -> Result<u64> {
        let mut counter = self.counters.entry(id.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

/// File-backed provider: one JSON document per serial id plus a
/// `.lock` sentinel guarding cross-process increments. Batches can be
/// pre-fetched to cut file round-trips.
pub struct StandaloneSerialNumbers {
    data_path: PathBuf,
    batches: DashMap<String, VecDeque<u64>>,
    batch_sizes: DashMap<String, u64>,
    lock_timeout: Duration,
}

#[derive(serde::Serialize, serde::Deserialize, Default)]
struct SerialDoc {
    current: u64,
}

impl StandaloneSerialNumbers {
    pub fn new(data_path: impl Into<PathBuf>) -> Result<Self> {
        let data_path = data_path.into();
        std::fs::create_dir_all(&data_path)?;
        Ok(Self {
            data_path,
            batches: DashMap::new(),
            batch_sizes: DashMap::new(),
            lock_timeout: Duration::from_secs(5),
        })
    }

    fn doc_path(&self, id: &str) -> PathBuf {
        self.data_path.join(format!("{}.json", id))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.data_path.join(format!("{}.lock", id))
    }

    /// Advance the stored counter by `count` under the file lock,
    /// returning the first serial of the claimed range.
    async fn claim_range(&self, id: &str, count: u64) -> Result<u64> {
        let lock_path = self.lock_path(id);
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(MicraError::Timeout(format!(
                            "serial number lock [{}]",
                            lock_path.display()
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => return Err(MicraError::from(e)),
            }
        }

        let result = (|| -> Result<u64> {
            let doc_path = self.doc_path(id);
            let mut doc: SerialDoc = match std::fs::read_to_string(&doc_path) {
                Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
                Err(_) => SerialDoc::default(),
            };
            let first = doc.current + 1;
            doc.current += count;
            std::fs::write(&doc_path, serde_json::to_string(&doc)?)?;
            Ok(first)
        })();

        if let Err(e) = std::fs::remove_file(&lock_path) {
            warn!(path = %lock_path.display(), error = %e, "serial lock cleanup failed");
        }
        result
    }
}

#[async_trait]
impl SerialNumberProvider for StandaloneSerialNumbers {
    async fn next(&self, id: &str) -> Result<u64> {
        if let Some(mut batch) = self.batches.get_mut(id)
            && let Some(serial) = batch.pop_front()
        {
            return Ok(serial);
        }

        let batch_size = self.batch_sizes.get(id).map(|s| *s).unwrap_or(0);
        if batch_size > 1 {
            let first = self.claim_range(id, batch_size).await?;
            let mut range: VecDeque<u64> = (first..first + batch_size).collect();
            let serial = range.pop_front().expect("batch is non-empty");
            self.batches.insert(id.to_string(), range);
            return Ok(serial);
        }

        self.claim_range(id, 1).await
    }

    async fn cache_batch(&self, id: &str, batch_size: u64) -> Result<()> {
        if batch_size == 0 {
            return Ok(());
        }
        self.batch_sizes.insert(id.to_string(), batch_size);
        let first = self.claim_range(id, batch_size).await?;
        self.batches
            .insert(id.to_string(), (first..first + batch_size).collect());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "micra-serial-test-{}-{}",
            std::process::id(),
            DIR_SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn fix_str_pads_and_wraps() {
        assert_eq!(serial_fix_str(7, 10), "0000000007");
        assert_eq!(serial_fix_str(12345678901, 10), "2345678901");
        assert_eq!(serial_fix_str(42, 4), "0042");
    }

    #[tokio::test]
    async fn memory_counters_are_per_id() {
        let serials = MemorySerialNumbers::new();
        assert_eq!(serials.next("a").await.unwrap(), 1);
        assert_eq!(serials.next("a").await.unwrap(), 2);
        assert_eq!(serials.next("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn standalone_persists_across_instances() {
        let dir = scratch_dir();
        {
            let serials = StandaloneSerialNumbers::new(&dir).unwrap();
            assert_eq!(serials.next("globSeqNum").await.unwrap(), 1);
            assert_eq!(serials.next("globSeqNum").await.unwrap(), 2);
        }
        let serials = StandaloneSerialNumbers::new(&dir).unwrap();
        assert_eq!(serials.next("globSeqNum").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn batch_cache_claims_a_range() {
        let dir = scratch_dir();
        let serials = StandaloneSerialNumbers::new(&dir).unwrap();
        serials.cache_batch("inf", 5).await.unwrap();
        for expected in 1..=5u64 {
            assert_eq!(serials.next("inf").await.unwrap(), expected);
        }
        // The batch is exhausted; the next claim continues after the
        // reserved range.
        assert_eq!(serials.next("inf").await.unwrap(), 6);
    }

    #[tokio::test]
    async fn stale_lock_times_out() {
        let dir = scratch_dir();
        let mut serials = StandaloneSerialNumbers::new(&dir).unwrap();
        serials.lock_timeout = Duration::from_millis(50);
        std::fs::write(dir.join("x.lock"), "").unwrap();
        let err = serials.next("x").await.unwrap_err();
        assert!(matches!(err, MicraError::Timeout(_)));
    }
}
