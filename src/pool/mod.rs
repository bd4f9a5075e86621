//! Adaptive temp-bucket pool.
//!
//! Hands out byte buffers that start in RAM when they fit the pool's
//! budget and transparently migrate to disk when they grow past the
//! conversion threshold, when the budget runs out, or when they sit in
//! RAM past the age limit. Announcement noderef buffers all come from
//! here.
//!
//! Lock discipline: the pool mutex guards the budget counter and the RAM
//! registry; each bucket has its own mutex for backing, size and stream
//! state. A bucket lock may take the pool lock (accounting), never the
//! other way round; the sweep collects candidates under the pool lock
//! and migrates them after releasing it.

mod bucket;
mod encrypted;

pub use bucket::{BucketReader, BucketWriter, TempBucket};
pub use encrypted::{EncryptedFile, FRAME_PLAIN, FRAME_RECORD};

use crate::types::PoolConfig;
use bucket::{Backing, BucketShared, BucketState};
use std::sync::{Arc, Mutex, Weak};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often `make` bothers scanning for over-age RAM buckets.
const SWEEP_INTERVAL_DIV: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bucket already has a writer")]
    WriterBusy,

    #[error("bucket is read-only")]
    ReadOnly,

    #[error("bucket was freed")]
    Freed,
}

struct PoolState {
    bytes_in_use: u64,
    ram: Vec<Weak<BucketShared>>,
    last_sweep: Instant,
    file_seq: u64,
}

pub(crate) struct PoolShared {
    pub(crate) cfg: PoolConfig,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn fresh_file_path(&self) -> std::path::PathBuf {
        let seq = {
            let mut state = self.lock();
            state.file_seq += 1;
            state.file_seq
        };
        self.cfg
            .dir
            .join(format!("tbkt-{}-{:08x}.tmp", seq, rand::random::<u32>()))
    }

    /// Write-path migration test for a RAM bucket growing from `current`
    /// to `future` bytes.
    pub(crate) fn must_migrate(&self, current: u64, future: u64) -> bool {
        if future > self.cfg.max_ram_bucket_size * self.cfg.conversion_factor {
            return true;
        }
        let state = self.lock();
        future - current + state.bytes_in_use > self.cfg.max_ram_used
    }

    pub(crate) fn ram_grown(&self, delta: u64) {
        let mut state = self.lock();
        state.bytes_in_use += delta;
    }

    pub(crate) fn ram_freed(&self, size: u64) {
        let mut state = self.lock();
        debug_assert!(state.bytes_in_use >= size);
        state.bytes_in_use = state.bytes_in_use.saturating_sub(size);
    }
}

/// The pool. Cheap to clone; all clones share the budget.
#[derive(Clone)]
pub struct TempBucketPool {
    shared: Arc<PoolShared>,
}

impl TempBucketPool {
    pub fn new(cfg: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                cfg,
                state: Mutex::new(PoolState {
                    bytes_in_use: 0,
                    ram: Vec::new(),
                    last_sweep: Instant::now(),
                    file_seq: 0,
                }),
            }),
        }
    }

    /// Create a bucket for roughly `estimated_size` bytes. RAM-backed only
    /// when the estimate fits a single RAM bucket and the budget has room;
    /// a zero budget disables RAM backing entirely.
    pub fn make(&self, estimated_size: u64) -> Result<TempBucket, PoolError> {
        self.maybe_sweep();

        let cfg = &self.shared.cfg;
        let ram = {
            let state = self.shared.lock();
            estimated_size > 0
                && estimated_size <= cfg.max_ram_bucket_size
                && cfg.max_ram_used > 0
                && state.bytes_in_use <= cfg.max_ram_used
        };

        let backing = if ram {
            Backing::Ram(Vec::with_capacity(estimated_size as usize))
        } else {
            let path = self.shared.fresh_file_path();
            let mut file = std::fs::File::options()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)?;
            let crypt = if cfg.really_encrypt {
                let crypt = EncryptedFile::new();
                crypt.write_all(&mut file, &[])?;
                Some(crypt)
            } else {
                None
            };
            Backing::File { file, path, crypt }
        };

        let shared = Arc::new(BucketShared {
            state: Mutex::new(BucketState {
                backing,
                size: 0,
                generation: 0,
                writer_alive: false,
                read_only: false,
                freed: false,
            }),
            pool: self.shared.clone(),
            created: Instant::now(),
        });

        if ram {
            let mut state = self.shared.lock();
            state.ram.push(Arc::downgrade(&shared));
        }

        Ok(TempBucket { shared })
    }

    /// Current RAM budget consumption.
    pub fn bytes_in_use(&self) -> u64 {
        self.shared.lock().bytes_in_use
    }

    /// Migrate every RAM bucket older than `max_age` right now, on the
    /// calling thread. Returns how many migrated.
    pub fn sweep_now(&self) -> usize {
        let candidates = self.collect_over_age();
        migrate_batch(candidates)
    }

    /// Opportunistic sweep trigger. Collection happens under the pool
    /// lock; migration is handed to a blocking worker without it.
    fn maybe_sweep(&self) {
        let interval = self.shared.cfg.max_age / SWEEP_INTERVAL_DIV;
        {
            let mut state = self.shared.lock();
            if state.last_sweep.elapsed() < interval {
                return;
            }
            state.last_sweep = Instant::now();
        }

        let candidates = self.collect_over_age();
        if candidates.is_empty() {
            return;
        }
        debug!("sweeping {} over-age ram buckets to disk", candidates.len());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    migrate_batch(candidates);
                });
            }
            Err(_) => {
                migrate_batch(candidates);
            }
        }
    }

    fn collect_over_age(&self) -> Vec<Arc<BucketShared>> {
        let max_age = self.shared.cfg.max_age;
        let mut state = self.shared.lock();
        let mut out = Vec::new();
        state.ram.retain(|weak| match weak.upgrade() {
            Some(shared) => {
                if shared.created.elapsed() > max_age {
                    out.push(shared);
                    false
                } else {
                    true
                }
            }
            None => false,
        });
        out
    }
}

fn migrate_batch(candidates: Vec<Arc<BucketShared>>) -> usize {
    let mut migrated = 0;
    for shared in candidates {
        match shared.migrate_to_file() {
            Ok(()) => migrated += 1,
            // Bucket stays RAM-backed until the next trigger.
            Err(PoolError::Freed) => {}
            Err(e) => warn!("async bucket migration failed: {}", e),
        }
    }
    migrated
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;
    use tempfile::TempDir;

    fn pool_cfg(dir: &TempDir) -> PoolConfig {
        PoolConfig {
            max_ram_bucket_size: 1024,
            max_ram_used: 4096,
            really_encrypt: false,
            max_age: Duration::from_secs(300),
            conversion_factor: 4,
            dir: dir.path().to_path_buf(),
        }
    }

    #[test]
    fn test_small_bucket_is_ram_backed() {
        let dir = TempDir::new().unwrap();
        let pool = TempBucketPool::new(pool_cfg(&dir));
        let b = pool.make(100).unwrap();
        assert!(b.is_ram_backed());
    }

    #[test]
    fn test_large_estimate_goes_to_file() {
        let dir = TempDir::new().unwrap();
        let pool = TempBucketPool::new(pool_cfg(&dir));
        let b = pool.make(10_000).unwrap();
        assert!(!b.is_ram_backed());
    }

    #[test]
    fn test_zero_budget_never_ram() {
        let dir = TempDir::new().unwrap();
        let mut cfg = pool_cfg(&dir);
        cfg.max_ram_used = 0;
        let pool = TempBucketPool::new(cfg);
        let b = pool.make(10).unwrap();
        assert!(!b.is_ram_backed());
    }

    #[test]
    fn test_accounting_tracks_ram_writes() {
        let dir = TempDir::new().unwrap();
        let pool = TempBucketPool::new(pool_cfg(&dir));
        let b = pool.make(100).unwrap();
        {
            let mut w = b.open_write().unwrap();
            w.write_all(&[0u8; 100]).unwrap();
        }
        assert_eq!(pool.bytes_in_use(), 100);
        b.free();
        assert_eq!(pool.bytes_in_use(), 0);
    }

    #[test]
    fn test_write_path_migration_on_conversion_factor() {
        let dir = TempDir::new().unwrap();
        let mut cfg = pool_cfg(&dir);
        cfg.max_ram_used = 1 << 30;
        let pool = TempBucketPool::new(cfg);
        let b = pool.make(1024).unwrap();
        assert!(b.is_ram_backed());

        let mut w = b.open_write().unwrap();
        // 1024 * 4 = 4096 is still allowed; one byte more migrates.
        w.write_all(&vec![1u8; 4096]).unwrap();
        assert!(b.is_ram_backed());
        w.write_all(&[2u8]).unwrap();
        assert!(!b.is_ram_backed());
        assert_eq!(pool.bytes_in_use(), 0);
        assert_eq!(b.size(), 4097);
    }

    #[test]
    fn test_write_path_migration_on_budget() {
        let dir = TempDir::new().unwrap();
        let mut cfg = pool_cfg(&dir);
        cfg.max_ram_used = 1000;
        let pool = TempBucketPool::new(cfg);
        let b = pool.make(100).unwrap();

        let mut w = b.open_write().unwrap();
        w.write_all(&vec![0u8; 600]).unwrap();
        assert!(b.is_ram_backed());
        // 600 + 600 blows the budget; the write lands on disk.
        w.write_all(&vec![0u8; 600]).unwrap();
        assert!(!b.is_ram_backed());
        assert_eq!(b.size(), 1200);
        assert_eq!(pool.bytes_in_use(), 0);

        let mut out = Vec::new();
        b.open_read().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 1200);
    }

    #[test]
    fn test_second_writer_fails() {
        let dir = TempDir::new().unwrap();
        let pool = TempBucketPool::new(pool_cfg(&dir));
        let b = pool.make(100).unwrap();
        let w1 = b.open_write().unwrap();
        assert!(matches!(b.open_write(), Err(PoolError::WriterBusy)));
        drop(w1);
        assert!(b.open_write().is_ok());
    }

    #[test]
    fn test_read_only_blocks_writer() {
        let dir = TempDir::new().unwrap();
        let pool = TempBucketPool::new(pool_cfg(&dir));
        let b = pool.make(100).unwrap();
        b.set_read_only();
        assert!(matches!(b.open_write(), Err(PoolError::ReadOnly)));
    }

    #[test]
    fn test_reader_rebinds_across_migration() {
        let dir = TempDir::new().unwrap();
        let pool = TempBucketPool::new(pool_cfg(&dir));
        let b = pool.make(100).unwrap();
        let payload: Vec<u8> = (0..100u8).collect();
        {
            let mut w = b.open_write().unwrap();
            w.write_all(&payload).unwrap();
        }

        let mut r = b.open_read().unwrap();
        let mut head = [0u8; 40];
        r.read_exact(&mut head).unwrap();
        assert_eq!(&head, &payload[..40]);

        // Migrate underneath the open reader.
        b.shared.migrate_to_file().unwrap();
        assert!(!b.is_ram_backed());

        let mut tail = Vec::new();
        r.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &payload[40..]);
    }

    #[test]
    fn test_migrate_file_backed_is_noop() {
        let dir = TempDir::new().unwrap();
        let pool = TempBucketPool::new(pool_cfg(&dir));
        let b = pool.make(10_000).unwrap();
        {
            let mut w = b.open_write().unwrap();
            w.write_all(b"hello").unwrap();
        }
        b.shared.migrate_to_file().unwrap();
        b.shared.migrate_to_file().unwrap();
        assert_eq!(b.read_to_vec().unwrap(), b"hello");
    }

    #[test]
    fn test_encrypted_bucket_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut cfg = pool_cfg(&dir);
        cfg.really_encrypt = true;
        let pool = TempBucketPool::new(cfg);
        let b = pool.make(10_000).unwrap();
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();
        {
            let mut w = b.open_write().unwrap();
            // Two appends to cross a frame boundary mid-write
            w.write_all(&payload[..1500]).unwrap();
            w.write_all(&payload[1500..]).unwrap();
        }
        assert_eq!(b.read_to_vec().unwrap(), payload);

        // On-disk bytes are sealed: the raw file must not contain the
        // plaintext run.
        let raw = std::fs::read(
            std::fs::read_dir(dir.path())
                .unwrap()
                .next()
                .unwrap()
                .unwrap()
                .path(),
        )
        .unwrap();
        assert!(!raw
            .windows(64)
            .any(|w| w == &payload[..64]));
    }

    #[test]
    fn test_sweep_migrates_by_age() {
        let dir = TempDir::new().unwrap();
        let mut cfg = pool_cfg(&dir);
        cfg.max_age = Duration::from_millis(50);
        let pool = TempBucketPool::new(cfg);
        let b = pool.make(100).unwrap();
        {
            let mut w = b.open_write().unwrap();
            w.write_all(&[9u8; 100]).unwrap();
        }
        assert!(b.is_ram_backed());
        assert_eq!(pool.bytes_in_use(), 100);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(pool.sweep_now(), 1);
        assert!(!b.is_ram_backed());
        assert_eq!(pool.bytes_in_use(), 0);
        assert_eq!(b.read_to_vec().unwrap().len(), 100);
    }

    #[test]
    fn test_freed_bucket_rejects_streams() {
        let dir = TempDir::new().unwrap();
        let pool = TempBucketPool::new(pool_cfg(&dir));
        let b = pool.make(100).unwrap();
        b.free();
        assert!(matches!(b.open_write(), Err(PoolError::Freed)));
        assert!(matches!(b.open_read(), Err(PoolError::Freed)));
    }
}
