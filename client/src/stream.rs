//! Length-bounded reader for reply sideband streams.
//!
//! A stream frame announces its exact byte count; the reader enforces
//! that bound so a codec can never consume bytes belonging to the next
//! reply. A small lookahead buffer supports peeking the leading magic
//! without consuming it.

use std::io::Read;

use boxtin_protocol::{Error, WireRecord};

pub struct StreamReader<'a, T> {
    inner: &'a mut T,
    /// Bytes of the stream not yet handed out, including any sitting in
    /// the lookahead buffer.
    remaining: u32,
    lookahead: Vec<u8>,
}

impl<'a, T: Read> StreamReader<'a, T> {
    pub fn new(inner: &'a mut T, size: u32) -> Self {
        Self {
            inner,
            remaining: size,
            lookahead: Vec::new(),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Returns the next `n` bytes without consuming them. Fails with
    /// `EndOfStream` if fewer than `n` bytes remain.
    pub fn peek(&mut self, n: usize) -> Result<&[u8], Error> {
        if (self.remaining as usize) < n {
            return Err(Error::EndOfStream);
        }
        while self.lookahead.len() < n {
            let mut buf = [0u8; 64];
            let want = (n - self.lookahead.len()).min(buf.len());
            self.inner.read_exact(&mut buf[..want])?;
            self.lookahead.extend_from_slice(&buf[..want]);
        }
        Ok(&self.lookahead[..n])
    }

    /// Reads up to `buf.len()` bytes. Reads past the announced stream
    /// length truncate and yield zero.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let want = buf.len().min(self.remaining as usize);
        if want == 0 {
            return Ok(0);
        }
        let from_lookahead = want.min(self.lookahead.len());
        if from_lookahead > 0 {
            buf[..from_lookahead].copy_from_slice(&self.lookahead[..from_lookahead]);
            self.lookahead.drain(..from_lookahead);
            self.remaining -= from_lookahead as u32;
            return Ok(from_lookahead);
        }
        let n = self.inner.read(&mut buf[..want])?;
        self.remaining -= n as u32;
        Ok(n)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        if (self.remaining as usize) < buf.len() {
            return Err(Error::EndOfStream);
        }
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::EndOfStream);
            }
            filled += n;
        }
        Ok(())
    }

    pub fn read_record<R: WireRecord>(&mut self) -> Result<R, Error> {
        let mut buf = vec![0u8; R::WIRE_SIZE];
        self.read_exact(&mut buf)?;
        R::decode(&buf)
    }

    /// Consumes whatever is left of the stream so the connection is
    /// positioned at the next frame. Returns the number of bytes
    /// discarded.
    pub fn drain(&mut self) -> Result<u64, Error> {
        let mut discarded = 0u64;
        let mut buf = [0u8; 4096];
        while self.remaining > 0 {
            let n = self.read(&mut buf)?;
            if n == 0 {
                return Err(Error::EndOfStream);
            }
            discarded += n as u64;
        }
        Ok(discarded)
    }
}
