//! Finite, restartable stream of random bytes for upload payloads.

use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;
use std::io::{self, Read, Seek, SeekFrom};

/// Outcome of a [`RandomStream::read_chunk`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The buffer was filled and more data remains
    More,
    /// The stream is exhausted; the count returned alongside may be short or zero
    Eof,
}

/// Payload generated once from the OS entropy source, then replayed by seeking.
///
/// Reads never touch the entropy source again, so benchmarks can resend the same payload
/// every iteration by seeking back to the start.
#[derive(Debug, Clone)]
pub struct RandomStream {
    offset: u64,
    base_data: Bytes,
}

impl RandomStream {
    /// Generate `size` cryptographically random bytes.
    ///
    /// Fails only when the OS entropy source does.
    pub fn new(size: usize) -> io::Result<Self> {
        let mut data = vec![0u8; size];
        OsRng
            .try_fill_bytes(&mut data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Self {
            offset: 0,
            base_data: Bytes::from(data),
        })
    }

    pub fn len(&self) -> usize {
        self.base_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base_data.is_empty()
    }

    pub fn position(&self) -> u64 {
        self.offset
    }

    fn remaining_slice(&self) -> &[u8] {
        let start = usize::try_from(self.offset)
            .unwrap_or(usize::MAX)
            .min(self.base_data.len());
        &self.base_data[start..]
    }

    /// Copy as much as fits into `buf` and report whether the stream ran dry.
    ///
    /// A read that comes back short returns [`ReadStatus::Eof`] together with the bytes it
    /// did copy. Further reads return `(0, Eof)` until the stream is seeked.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> (usize, ReadStatus) {
        let remaining = self.remaining_slice();
        if remaining.is_empty() {
            return (0, ReadStatus::Eof);
        }

        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n as u64;

        if n < buf.len() {
            (n, ReadStatus::Eof)
        } else {
            (n, ReadStatus::More)
        }
    }

    /// Hand out everything after the cursor without copying and move the cursor to the end
    pub fn read_remaining(&mut self) -> Bytes {
        let start = self.len() - self.remaining_slice().len();
        self.offset = self.len() as u64;
        self.base_data.slice(start..)
    }

    /// No-op; present so the stream can stand in for a file handle
    pub fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for RandomStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, _) = self.read_chunk(buf);
        Ok(n)
    }
}

impl Seek for RandomStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => (0i128, i128::from(offset)),
            SeekFrom::Current(delta) => (i128::from(self.offset), i128::from(delta)),
            SeekFrom::End(delta) => (self.len() as i128, i128::from(delta)),
        };

        let target = base + delta;
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("negative position: {}", target),
            ));
        }

        self.offset = u64::try_from(target)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "position overflow"))?;
        Ok(self.offset)
    }
}
