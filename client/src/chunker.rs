//! Content-defined chunking for uploads.
//!
//! A keyed buzhash runs over a sliding window; a chunk boundary is
//! declared whenever the low bits of the hash are all set, giving
//! chunks of `mean` bytes on average with a hard cap at `max`. The
//! 256-entry hash table is derived from a secret key, so chunk
//! boundaries are deterministic for a given `(key, stream)` pair but
//! unpredictable without the key.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use boxtin_protocol::Error;

/// Sliding window length; also the minimum chunk size.
const WINDOW_SIZE: usize = 64;

pub struct Chunker {
    table: [u32; 256],
    mean_mask: u32,
    max_size: usize,
    window: [u8; WINDOW_SIZE],
    window_len: usize,
    window_pos: usize,
    hash: u32,
    current: Vec<u8>,
    complete: Vec<Vec<u8>>,
}

fn derive_table(key: &[u8; 32]) -> [u32; 256] {
    let mut rng = StdRng::from_seed(*key);
    let mut table = [0u32; 256];
    for slot in &mut table {
        *slot = rng.next_u32();
    }
    table
}

impl Chunker {
    /// `mean` must be a power of two; `max` bounds the largest chunk.
    pub fn new(key: &[u8; 32], mean: u32, max: u32) -> Result<Self, Error> {
        if mean == 0 || !mean.is_power_of_two() {
            return Err(Error::ConfigInvalid(format!(
                "chunker mean size {mean} is not a power of two"
            )));
        }
        if (max as usize) < WINDOW_SIZE {
            return Err(Error::ConfigInvalid(format!(
                "chunker max size {max} is smaller than the {WINDOW_SIZE}-byte window"
            )));
        }
        Ok(Self {
            table: derive_table(key),
            mean_mask: mean - 1,
            max_size: max as usize,
            window: [0; WINDOW_SIZE],
            window_len: 0,
            window_pos: 0,
            hash: 0,
            current: Vec::new(),
            complete: Vec::new(),
        })
    }

    pub fn write(&mut self, data: &[u8]) {
        for &byte in data {
            self.push_byte(byte);
        }
    }

    /// Chunks completed so far, in order.
    pub fn take_chunks(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.complete)
    }

    /// Flushes the trailing partial chunk and returns everything still
    /// pending.
    pub fn finish(mut self) -> Vec<Vec<u8>> {
        if !self.current.is_empty() {
            let chunk = std::mem::take(&mut self.current);
            self.complete.push(chunk);
        }
        self.complete
    }

    fn push_byte(&mut self, byte: u8) {
        self.current.push(byte);

        let outgoing = self.window[self.window_pos];
        self.window[self.window_pos] = byte;
        self.window_pos = (self.window_pos + 1) % WINDOW_SIZE;

        self.hash = self.hash.rotate_left(1) ^ self.table[byte as usize];
        if self.window_len < WINDOW_SIZE {
            self.window_len += 1;
        } else {
            self.hash ^= self.table[outgoing as usize]
                .rotate_left((WINDOW_SIZE % 32) as u32);
        }

        let at_boundary = self.window_len == WINDOW_SIZE
            && self.current.len() >= WINDOW_SIZE
            && self.hash & self.mean_mask == self.mean_mask;
        if at_boundary || self.current.len() >= self.max_size {
            let chunk = std::mem::take(&mut self.current);
            self.complete.push(chunk);
            self.window_len = 0;
            self.window_pos = 0;
            self.window = [0; WINDOW_SIZE];
            self.hash = 0;
        }
    }
}
