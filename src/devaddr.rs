//! Function-address generation for one root hub and its whole sub-tree.
//!
//! Every root port owns one [`DevAddrPool`]; downstream hub ports resolve to
//! it by walking their parent chain (see [`crate::port`]). Address 0 is the
//! unaddressed default and is never handed out.

use std::sync::Mutex;

use log::warn;

use crate::error::Error;

/// Highest assignable USB function address.
pub const MAX_DEVADDR: u8 = 127;

const WORDS: usize = 4;

/// Bitmap allocator over the 1..=127 device-address space.
///
/// `allocate` always returns the lowest currently-free address, so the
/// sequence of handed-out addresses is deterministic. The interior mutex
/// scopes exclusion to one root's sub-tree; enumeration itself is
/// single-threaded per root, but teardown of a downstream hub may race an
/// allocation elsewhere under the same root.
pub struct DevAddrPool {
    bitmap: Mutex<[u32; WORDS]>,
}

impl DevAddrPool {
    pub fn new() -> Self {
        let mut bitmap = [0u32; WORDS];
        // Address 0 is reserved for unaddressed devices.
        bitmap[0] = 1;
        Self {
            bitmap: Mutex::new(bitmap),
        }
    }

    /// Hands out the lowest free address.
    pub fn allocate(&self) -> Result<u8, Error> {
        let mut bitmap = self.bitmap.lock().unwrap();
        for (word_index, word) in bitmap.iter_mut().enumerate() {
            let free = !*word;
            if free == 0 {
                continue;
            }
            let bit = free.trailing_zeros();
            let addr = word_index as u32 * 32 + bit;
            if addr > u32::from(MAX_DEVADDR) {
                break;
            }
            *word |= 1 << bit;
            return Ok(addr as u8);
        }
        Err(Error::ResourceExhausted("device address"))
    }

    /// Returns an address to the free set.
    ///
    /// Releasing 0 (never allocated) or an address that is already free is a
    /// no-op, so teardown paths may release unconditionally.
    pub fn release(&self, addr: u8) {
        if addr == 0 || addr > MAX_DEVADDR {
            return;
        }
        let mut bitmap = self.bitmap.lock().unwrap();
        let word = &mut bitmap[usize::from(addr) / 32];
        let bit = 1u32 << (u32::from(addr) % 32);
        if *word & bit == 0 {
            warn!("release of unallocated device address {}", addr);
            return;
        }
        *word &= !bit;
    }

    #[cfg(test)]
    fn is_allocated(&self, addr: u8) -> bool {
        let bitmap = self.bitmap.lock().unwrap();
        bitmap[usize::from(addr) / 32] & (1 << (u32::from(addr) % 32)) != 0
    }
}

impl Default for DevAddrPool {
    fn default() -> Self {
        Self::new()
    }
}
