//! Counter Replay Protection
//!
//! A sliding bitmap window over the packet counters accepted on a session's
//! receive path. Counters more than the window width below the highest
//! accepted counter are rejected, as are duplicates inside the window.
//! Counter 0 is never valid; send counters start at 1.

use crate::constants::REPLAY_WINDOW_SIZE;

const BLOCK_BITS: usize = 64;
const BLOCKS: usize = REPLAY_WINDOW_SIZE / BLOCK_BITS;

/// Sliding replay window over received packet counters
pub struct ReplayWindow {
    highest: u64,
    bitmap: [u64; BLOCKS],
}

impl ReplayWindow {
    /// Create an empty window
    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: [0u64; BLOCKS],
        }
    }

    /// Highest counter accepted so far
    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// Would `counter` be accepted? Pure query, no state change.
    pub fn check(&self, counter: u64) -> bool {
        if counter == 0 {
            return false;
        }
        if counter > self.highest {
            return true;
        }
        if self.highest - counter >= REPLAY_WINDOW_SIZE as u64 {
            return false;
        }
        !self.is_set(counter)
    }

    /// Check `counter` and, if acceptable, mark it as seen.
    /// Returns false when the packet must be dropped as a replay.
    pub fn update(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }

        if counter > self.highest {
            let advance = counter - self.highest;
            if advance >= REPLAY_WINDOW_SIZE as u64 {
                self.bitmap = [0u64; BLOCKS];
            } else {
                for c in (self.highest + 1)..counter {
                    self.clear(c);
                }
                self.clear(counter);
            }
            self.highest = counter;
        }

        self.set(counter);
        true
    }

    /// Forget all accepted counters
    pub fn reset(&mut self) {
        self.highest = 0;
        self.bitmap = [0u64; BLOCKS];
    }

    fn position(counter: u64) -> (usize, u64) {
        let bit = (counter % REPLAY_WINDOW_SIZE as u64) as usize;
        (bit / BLOCK_BITS, 1u64 << (bit % BLOCK_BITS))
    }

    fn is_set(&self, counter: u64) -> bool {
        let (block, mask) = Self::position(counter);
        self.bitmap[block] & mask != 0
    }

    fn set(&mut self, counter: u64) {
        let (block, mask) = Self::position(counter);
        self.bitmap[block] |= mask;
    }

    fn clear(&mut self, counter: u64) {
        let (block, mask) = Self::position(counter);
        self.bitmap[block] &= !mask;
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
