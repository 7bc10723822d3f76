//! BAR register accessor
//!
//! Validated 32-bit register access at byte offsets within a mapped region.
//! Every call is exactly one bus transaction on the backing region; register
//! semantics and sequencing are left to the caller.

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result, UnsafeAccess};
use crate::util::{get_lower_32_bits, get_upper_32_bits, is_multiple, join_32_bits, set_bits};

/// Raw 32-bit register space
///
/// Implementations return `None`/`false` for accesses that do not fit in the
/// region and never touch memory in that case.
pub trait RegisterRegion: Send + Sync {
    /// Size in bytes
    fn size(&self) -> usize;
    fn read32(&self, offset: usize) -> Option<u32>;
    fn write32(&self, offset: usize, value: u32) -> bool;
}

impl<R: RegisterRegion + ?Sized> RegisterRegion for Box<R> {
    fn size(&self) -> usize {
        (**self).size()
    }

    fn read32(&self, offset: usize) -> Option<u32> {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) -> bool {
        (**self).write32(offset, value)
    }
}

/// In-memory register file standing in for a card
///
/// Each access optionally spins for a fixed latency to model bus cost.
pub struct SimulatedRegion {
    words: Mutex<Vec<u32>>,
    latency: Duration,
}

impl SimulatedRegion {
    pub fn new(size: usize) -> Self {
        Self {
            words: Mutex::new(vec![0; size / 4]),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn wait(&self) {
        if self.latency.is_zero() {
            return;
        }
        let start = std::time::Instant::now();
        while start.elapsed() < self.latency {
            std::hint::spin_loop();
        }
    }
}

impl RegisterRegion for SimulatedRegion {
    fn size(&self) -> usize {
        self.words.lock().len() * 4
    }

    fn read32(&self, offset: usize) -> Option<u32> {
        let words = self.words.lock();
        let value = *words.get(offset / 4)?;
        drop(words);
        self.wait();
        Some(value)
    }

    fn write32(&self, offset: usize, value: u32) -> bool {
        let mut words = self.words.lock();
        match words.get_mut(offset / 4) {
            Some(word) => *word = value,
            None => return false,
        }
        drop(words);
        self.wait();
        true
    }
}

/// Validated access to one BAR of a card
pub struct BarAccessor<R = Box<dyn RegisterRegion>> {
    region: R,
    bar_index: u32,
}

impl<R: RegisterRegion> BarAccessor<R> {
    pub fn new(region: R, bar_index: u32) -> Self {
        Self { region, bar_index }
    }

    pub fn bar_index(&self) -> u32 {
        self.bar_index
    }

    /// Size of the mapped BAR in bytes
    pub fn bar_size(&self) -> usize {
        self.region.size()
    }

    fn check_offset(&self, offset: usize) -> Result<()> {
        if offset != 0 && !is_multiple(offset, 4) {
            return Err(Error::invalid_parameter(format!(
                "register offset {:#x} is not a multiple of 4",
                offset
            )));
        }
        Ok(())
    }

    fn in_range(&self, offset: usize) -> bool {
        matches!(offset.checked_add(4), Some(end) if end <= self.region.size())
    }

    pub fn read_register(&self, offset: usize) -> Result<u32> {
        self.check_offset(offset)?;
        let size = self.region.size();
        if !self.in_range(offset) {
            return Err(UnsafeAccess::Read { offset, size }.into());
        }
        let value = self
            .region
            .read32(offset)
            .ok_or(UnsafeAccess::Read { offset, size })?;
        tracing::trace!("BAR{} read {:#x} = {:#x}", self.bar_index, offset, value);
        Ok(value)
    }

    pub fn write_register(&self, offset: usize, value: u32) -> Result<()> {
        self.check_offset(offset)?;
        let size = self.region.size();
        if !self.in_range(offset) {
            return Err(UnsafeAccess::Write { offset, size }.into());
        }
        tracing::trace!("BAR{} write {:#x} = {:#x}", self.bar_index, offset, value);
        if !self.region.write32(offset, value) {
            return Err(UnsafeAccess::Write { offset, size }.into());
        }
        Ok(())
    }

    /// Read-modify-write of a `width`-bit field starting at bit `index`
    pub fn modify_register(&self, offset: usize, index: u32, width: u32, value: u32) -> Result<()> {
        if width == 0 || index.checked_add(width).map_or(true, |end| end > 32) {
            return Err(Error::invalid_parameter(format!(
                "field {}+{} does not fit a 32-bit register",
                index, width
            )));
        }
        let mut current = self.read_register(offset)?;
        set_bits(&mut current, index, width, value);
        self.write_register(offset, current)
    }

    /// Read a 64-bit value exposed as a register pair, low word first
    pub fn read_register_u64(&self, offset: usize) -> Result<u64> {
        let lower = self.read_register(offset)?;
        let upper = self.read_register(offset + 4)?;
        Ok(join_32_bits(lower, upper))
    }

    /// Write a 64-bit value to a register pair, low word first
    pub fn write_register_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.check_offset(offset)?;
        let upper = offset.saturating_add(4);
        if !self.in_range(upper) {
            return Err(UnsafeAccess::Write {
                offset: upper,
                size: self.region.size(),
            }
            .into());
        }
        self.write_register(offset, get_lower_32_bits(value))?;
        self.write_register(upper, get_upper_32_bits(value))
    }
}
