//! Message ID allocation.

use parking_lot::Mutex;

//------------ IdAllocator ---------------------------------------------------

/// Hands out 16 bit DNS message IDs.
///
/// IDs are taken from a monotonic counter modulo 2^16 that starts at a
/// random point. That alone keeps collisions rare since responses live far
/// shorter than the wrap period; actual uniqueness per socket is enforced
/// by the dispatcher, which rejects a submission whose ID is still in
/// flight so the caller can allocate a fresh one.
#[derive(Debug)]
pub struct IdAllocator {
    /// The most recently handed out ID.
    last: Mutex<u16>,
}

impl IdAllocator {
    /// Creates an allocator starting at a random position.
    pub fn new() -> Self {
        IdAllocator {
            last: Mutex::new(rand::random()),
        }
    }

    /// Returns the next ID.
    pub fn allocate(&self) -> u16 {
        let mut last = self.last.lock();
        *last = last.wrapping_add(1);
        *last
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

//============ Testing =======================================================
