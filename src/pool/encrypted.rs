//! Padded, ephemerally-keyed encryption for file-backed buckets.
//!
//! The file is a sequence of fixed-size records, each holding a fresh
//! random nonce and one ChaCha20-Poly1305-sealed 1024-byte plaintext
//! frame. The last frame is zero-padded to the block boundary; logical
//! length lives in the owning bucket, never on disk. The key is generated
//! per instance and dies with it, so a leaked file is unreadable once the
//! bucket is gone.

use crate::types::PAD_BLOCK;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Plaintext bytes per frame.
pub const FRAME_PLAIN: usize = PAD_BLOCK;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// On-disk bytes per frame record: nonce + ciphertext + tag.
pub const FRAME_RECORD: usize = NONCE_LEN + FRAME_PLAIN + TAG_LEN;

/// Single-use encryption context for one bucket's backing file.
pub struct EncryptedFile {
    cipher: ChaCha20Poly1305,
}

impl EncryptedFile {
    /// Fresh ephemeral key.
    pub fn new() -> Self {
        let key: Key = ChaCha20Poly1305::generate_key(&mut OsRng);
        Self {
            cipher: ChaCha20Poly1305::new(&key),
        }
    }

    fn seal_frame(&self, plain: &[u8]) -> io::Result<Vec<u8>> {
        debug_assert!(plain.len() <= FRAME_PLAIN);
        let mut frame = [0u8; FRAME_PLAIN];
        frame[..plain.len()].copy_from_slice(plain);

        let nonce: Nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, frame.as_slice())
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "frame seal failed"))?;

        let mut record = Vec::with_capacity(FRAME_RECORD);
        record.extend_from_slice(nonce.as_slice());
        record.extend_from_slice(&sealed);
        Ok(record)
    }

    fn open_frame(&self, record: &[u8]) -> io::Result<Vec<u8>> {
        if record.len() != FRAME_RECORD {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated frame record",
            ));
        }
        let nonce = Nonce::from_slice(&record[..NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &record[NONCE_LEN..])
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame open failed"))
    }

    fn read_record(&self, file: &mut File, frame_index: u64) -> io::Result<Vec<u8>> {
        file.seek(SeekFrom::Start(frame_index * FRAME_RECORD as u64))?;
        let mut record = vec![0u8; FRAME_RECORD];
        file.read_exact(&mut record)?;
        self.open_frame(&record)
    }

    fn write_record(&self, file: &mut File, frame_index: u64, plain: &[u8]) -> io::Result<()> {
        let record = self.seal_frame(plain)?;
        file.seek(SeekFrom::Start(frame_index * FRAME_RECORD as u64))?;
        file.write_all(&record)
    }

    /// Write `data` as the complete content, replacing anything present.
    pub fn write_all(&self, file: &mut File, data: &[u8]) -> io::Result<()> {
        file.set_len(0)?;
        for (i, chunk) in data.chunks(FRAME_PLAIN).enumerate() {
            self.write_record(file, i as u64, chunk)?;
        }
        if data.is_empty() {
            self.write_record(file, 0, &[])?;
        }
        file.flush()
    }

    /// Append `data` after `logical_len` existing bytes. The trailing
    /// partial frame, if any, is re-sealed under a fresh nonce.
    pub fn append(&self, file: &mut File, logical_len: u64, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut frame_index = logical_len / FRAME_PLAIN as u64;
        let rem = (logical_len % FRAME_PLAIN as u64) as usize;

        let mut pending: Vec<u8>;
        let mut data = data;
        if rem > 0 {
            let mut head = self.read_record(file, frame_index)?;
            head.truncate(rem);
            let take = (FRAME_PLAIN - rem).min(data.len());
            head.extend_from_slice(&data[..take]);
            data = &data[take..];
            pending = head;
        } else {
            let take = FRAME_PLAIN.min(data.len());
            pending = data[..take].to_vec();
            data = &data[take..];
        }

        loop {
            self.write_record(file, frame_index, &pending)?;
            frame_index += 1;
            if data.is_empty() {
                break;
            }
            let take = FRAME_PLAIN.min(data.len());
            pending = data[..take].to_vec();
            data = &data[take..];
        }
        file.flush()
    }

    /// Read up to `buf.len()` bytes at `offset`, bounded by `logical_len`.
    pub fn read_at(
        &self,
        file: &mut File,
        offset: u64,
        buf: &mut [u8],
        logical_len: u64,
    ) -> io::Result<usize> {
        if offset >= logical_len {
            return Ok(0);
        }
        let want = buf.len().min((logical_len - offset) as usize);
        let mut done = 0;
        while done < want {
            let pos = offset + done as u64;
            let frame_index = pos / FRAME_PLAIN as u64;
            let within = (pos % FRAME_PLAIN as u64) as usize;
            let plain = self.read_record(file, frame_index)?;
            let take = (FRAME_PLAIN - within).min(want - done);
            buf[done..done + take].copy_from_slice(&plain[within..within + take]);
            done += take;
        }
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp() -> (File, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("ringcast-enc-{}.tmp", rand::random::<u64>()));
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        (file, path)
    }

    #[test]
    fn test_roundtrip_identity() {
        let enc = EncryptedFile::new();
        let (mut file, path) = temp();
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 256) as u8).collect();

        enc.write_all(&mut file, &data).unwrap();
        // 3000 bytes -> 3 frames, padded
        assert_eq!(file.metadata().unwrap().len(), 3 * FRAME_RECORD as u64);

        let mut back = vec![0u8; 3000];
        let n = enc.read_at(&mut file, 0, &mut back, 3000).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(back, data);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_read_at_offset() {
        let enc = EncryptedFile::new();
        let (mut file, path) = temp();
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 256) as u8).collect();
        enc.write_all(&mut file, &data).unwrap();

        let mut buf = vec![0u8; 100];
        let n = enc.read_at(&mut file, 1000, &mut buf, 2048).unwrap();
        assert_eq!(n, 100);
        assert_eq!(buf, &data[1000..1100]);

        // Reads stop at the logical length, not the padded length
        let mut tail = vec![0u8; 100];
        let n = enc.read_at(&mut file, 2000, &mut tail, 2048).unwrap();
        assert_eq!(n, 48);
        assert_eq!(&tail[..48], &data[2000..]);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_append_respects_partial_frame() {
        let enc = EncryptedFile::new();
        let (mut file, path) = temp();

        let first = vec![0x11u8; 700];
        enc.write_all(&mut file, &first).unwrap();
        let second = vec![0x22u8; 700];
        enc.append(&mut file, 700, &second).unwrap();

        let mut back = vec![0u8; 1400];
        let n = enc.read_at(&mut file, 0, &mut back, 1400).unwrap();
        assert_eq!(n, 1400);
        assert!(back[..700].iter().all(|&b| b == 0x11));
        assert!(back[700..].iter().all(|&b| b == 0x22));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_keys_are_per_instance() {
        let a = EncryptedFile::new();
        let b = EncryptedFile::new();
        let (mut file, path) = temp();
        a.write_all(&mut file, b"secret payload").unwrap();

        let mut buf = vec![0u8; 14];
        assert!(b.read_at(&mut file, 0, &mut buf, 14).is_err());

        std::fs::remove_file(path).ok();
    }
}
