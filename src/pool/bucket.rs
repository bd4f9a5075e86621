//! Temp buckets: RAM- or file-backed byte buffers with migration.

use super::encrypted::EncryptedFile;
use super::{PoolError, PoolShared};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

pub(super) enum Backing {
    Ram(Vec<u8>),
    File {
        file: File,
        path: PathBuf,
        crypt: Option<EncryptedFile>,
    },
}

pub(super) struct BucketState {
    pub backing: Backing,
    pub size: u64,
    /// Bumped on every migration; readers rebind when it changes.
    pub generation: u64,
    pub writer_alive: bool,
    pub read_only: bool,
    pub freed: bool,
}

pub(super) struct BucketShared {
    pub state: Mutex<BucketState>,
    pub pool: Arc<PoolShared>,
    /// Immutable, so the sweep can age-filter without the bucket lock.
    pub created: Instant,
}

impl BucketShared {
    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Migrate to file backing. No-op when already file-backed. The bucket
    /// lock is held for the whole copy; the pool lock only for the final
    /// accounting update (bucket before pool, never the reverse).
    pub(super) fn migrate_to_file(&self) -> Result<(), PoolError> {
        let mut state = self.lock();
        if state.freed {
            return Err(PoolError::Freed);
        }
        let data = match &state.backing {
            Backing::File { .. } => return Ok(()),
            Backing::Ram(data) => data.clone(),
        };

        let path = self.pool.fresh_file_path();
        let result = (|| -> io::Result<(File, Option<EncryptedFile>)> {
            let mut file = File::options()
                .create_new(true)
                .read(true)
                .write(true)
                .open(&path)?;
            if self.pool.cfg.really_encrypt {
                let crypt = EncryptedFile::new();
                crypt.write_all(&mut file, &data)?;
                Ok((file, Some(crypt)))
            } else {
                file.write_all(&data)?;
                file.flush()?;
                Ok((file, None))
            }
        })();

        match result {
            Ok((file, crypt)) => {
                state.backing = Backing::File { file, path, crypt };
                state.generation += 1;
                self.pool.ram_freed(state.size);
                debug!("bucket migrated to disk ({} bytes)", state.size);
                Ok(())
            }
            Err(e) => {
                // Original backing stays; a partial file is garbage.
                std::fs::remove_file(&path).ok();
                Err(PoolError::Io(e))
            }
        }
    }

    fn append(&self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.lock();
        if guard.freed {
            return Err(io::Error::new(io::ErrorKind::Other, "bucket freed"));
        }
        if guard.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "bucket is read-only",
            ));
        }

        let future = guard.size + buf.len() as u64;
        if matches!(guard.backing, Backing::Ram(_)) && self.pool.must_migrate(guard.size, future) {
            drop(guard);
            self.migrate_to_file()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            guard = self.lock();
            if guard.freed {
                return Err(io::Error::new(io::ErrorKind::Other, "bucket freed"));
            }
        }

        let state = &mut *guard;
        match &mut state.backing {
            Backing::Ram(data) => {
                data.extend_from_slice(buf);
                state.size += buf.len() as u64;
                self.pool.ram_grown(buf.len() as u64);
            }
            Backing::File { file, crypt, .. } => {
                match crypt {
                    Some(crypt) => crypt.append(file, state.size, buf)?,
                    None => {
                        file.seek(SeekFrom::End(0))?;
                        file.write_all(buf)?;
                    }
                }
                state.size += buf.len() as u64;
            }
        }
        Ok(buf.len())
    }

    fn free(&self) {
        let mut state = self.lock();
        if state.freed {
            return;
        }
        state.freed = true;
        match &state.backing {
            Backing::Ram(_) => self.pool.ram_freed(state.size),
            Backing::File { path, .. } => {
                std::fs::remove_file(path).ok();
            }
        }
        state.backing = Backing::Ram(Vec::new());
        state.size = 0;
    }
}

/// A pooled byte buffer. Clones share the same underlying storage.
#[derive(Clone)]
pub struct TempBucket {
    pub(super) shared: Arc<BucketShared>,
}

impl TempBucket {
    pub fn size(&self) -> u64 {
        self.shared.lock().size
    }

    pub fn is_ram_backed(&self) -> bool {
        matches!(self.shared.lock().backing, Backing::Ram(_))
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.lock().read_only
    }

    pub fn set_read_only(&self) {
        self.shared.lock().read_only = true;
    }

    /// Exclusive write stream. Fails while another writer is alive or the
    /// bucket is read-only.
    pub fn open_write(&self) -> Result<BucketWriter, PoolError> {
        let mut state = self.shared.lock();
        if state.freed {
            return Err(PoolError::Freed);
        }
        if state.read_only {
            return Err(PoolError::ReadOnly);
        }
        if state.writer_alive {
            return Err(PoolError::WriterBusy);
        }
        state.writer_alive = true;
        Ok(BucketWriter {
            shared: self.shared.clone(),
        })
    }

    /// Read stream from offset zero. Readers survive migration: they
    /// rebind to the new backing and continue at the offset they had
    /// reached. Mark/reset is not supported.
    pub fn open_read(&self) -> Result<BucketReader, PoolError> {
        let state = self.shared.lock();
        if state.freed {
            return Err(PoolError::Freed);
        }
        Ok(BucketReader {
            shared: self.shared.clone(),
            offset: 0,
            generation: state.generation,
            handle: None,
        })
    }

    /// Release storage and return any RAM share to the pool. Further
    /// stream operations fail.
    pub fn free(&self) {
        self.shared.free();
    }

    /// Copy the full logical content. Convenience for consumers that need
    /// the whole blob at once.
    pub fn read_to_vec(&self) -> io::Result<Vec<u8>> {
        let mut reader = self
            .open_read()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let mut out = Vec::with_capacity(self.size() as usize);
        reader.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Exclusive append-only writer.
pub struct BucketWriter {
    shared: Arc<BucketShared>,
}

impl Write for BucketWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.append(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BucketWriter {
    fn drop(&mut self) {
        self.shared.lock().writer_alive = false;
    }
}

/// Sequential reader with an index into the logical stream and the
/// generation of the backing it last read from.
pub struct BucketReader {
    shared: Arc<BucketShared>,
    offset: u64,
    generation: u64,
    handle: Option<File>,
}

impl Read for BucketReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let state = self.shared.lock();
        if state.freed {
            return Err(io::Error::new(io::ErrorKind::Other, "bucket freed"));
        }
        if self.generation != state.generation {
            // Backing changed under us: drop the stale handle and fast-
            // forward on the new backing by our recorded index.
            self.handle = None;
            self.generation = state.generation;
        }
        if self.offset >= state.size {
            return Ok(0);
        }
        let n = match &state.backing {
            Backing::Ram(data) => {
                let avail = &data[self.offset as usize..state.size as usize];
                let take = avail.len().min(buf.len());
                buf[..take].copy_from_slice(&avail[..take]);
                take
            }
            Backing::File { path, crypt, .. } => {
                let file = match self.handle.take() {
                    Some(f) => self.handle.insert(f),
                    None => self.handle.insert(File::open(path)?),
                };
                match crypt {
                    Some(crypt) => crypt.read_at(file, self.offset, buf, state.size)?,
                    None => {
                        file.seek(SeekFrom::Start(self.offset))?;
                        let want = buf.len().min((state.size - self.offset) as usize);
                        let mut done = 0;
                        while done < want {
                            let n = file.read(&mut buf[done..want])?;
                            if n == 0 {
                                break;
                            }
                            done += n;
                        }
                        done
                    }
                }
            }
        };
        self.offset += n as u64;
        Ok(n)
    }
}
