//! Fixed-capacity socket buffers.
//!
//! Every connection owns one read buffer and one write buffer. Buffers never
//! reallocate; the state machine flushes or compacts before appending.

/// Capacity of each per-connection read and write buffer, in bytes.
pub const SOCKET_BUFFER_SIZE: usize = 8192;

/// Fixed-capacity byte buffer with a consume cursor.
///
/// Invariant: `0 <= cursor <= filled <= capacity`. Both indices rewind to
/// zero once everything buffered has been consumed, so a drained buffer
/// always offers its full capacity again.
pub struct Buffer {
    data: Box<[u8]>,
    cursor: usize,
    filled: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; SOCKET_BUFFER_SIZE].into_boxed_slice(),
            cursor: 0,
            filled: 0,
        }
    }

    /// Rewind cursor and fill level. Contents are not zeroed.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.filled = 0;
    }

    /// Bytes buffered and not yet consumed.
    pub fn remaining(&self) -> usize {
        self.filled - self.cursor
    }

    /// Free space past the fill level.
    pub fn unfilled(&self) -> usize {
        self.data.len() - self.filled
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unconsumed contents.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.cursor..self.filled]
    }

    /// Advance the cursor past `n` consumed bytes.
    ///
    /// # Panics
    /// Debug builds panic if `n` exceeds `remaining()`.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.remaining(), "consume past fill level");
        self.cursor += n;
        if self.cursor == self.filled {
            self.cursor = 0;
            self.filled = 0;
        }
    }

    /// Copy `src` in past the fill level.
    ///
    /// # Panics
    /// Debug builds panic if `src` does not fit in the unfilled region.
    pub fn append(&mut self, src: &[u8]) {
        debug_assert!(src.len() <= self.unfilled(), "append past capacity");
        self.data[self.filled..self.filled + src.len()].copy_from_slice(src);
        self.filled += src.len();
    }

    /// Writable slice past the fill level, for direct socket reads.
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Account `n` bytes the socket delivered into the unfilled region.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.data.len(), "advance past capacity");
        self.filled += n;
    }

    /// Move the unconsumed tail to the front, reclaiming consumed space.
    pub fn compact(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.data.copy_within(self.cursor..self.filled, 0);
        self.filled -= self.cursor;
        self.cursor = 0;
    }
}
