//! Ready queue (descriptor ring)
//!
//! A fixed array of `(length, status)` pairs written by the card's DMA engine
//! as pages complete. Software resets entries to `(-1, -1)` and then only
//! observes them. All accesses go through volatile loads and stores because
//! the hardware writes the memory behind the compiler's back.
//!
//! Entry lifecycle: `Empty (-1, -1)` -> `Pending` (hardware writing, still
//! looks empty) -> `Ready` (status valid) -> consumed -> reset to `Empty`.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use crate::error::{CrorcError, CrorcStep, Error, Result};
use crate::interrupt::InterruptFlag;
use crate::util::{check_alignment, get_bit, get_bits};

/// Ready queue capacity of the C-RORC generation
pub const CRORC_NUMBER_OF_PAGES: usize = 128;

/// Data transmission status word marker in the low status byte
pub const DTSW: u32 = 0x82;

const STATUS_ERROR_BIT: u32 = 31;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyFifoEntry {
    pub length: i32,
    pub status: i32,
}

/// What an observed entry says about its page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataArrival {
    NotArrived,
    PartiallyArrived,
    WholeArrived { length: u32 },
}

impl ReadyFifoEntry {
    pub const EMPTY: ReadyFifoEntry = ReadyFifoEntry {
        length: -1,
        status: -1,
    };

    pub fn is_empty(&self) -> bool {
        self.status == -1
    }

    /// Classify the entry; error status words are C-RORC data arrival faults
    pub fn arrival(&self) -> Result<DataArrival> {
        if self.status == -1 {
            return Ok(DataArrival::NotArrived);
        }
        if self.status == 0 {
            return Ok(DataArrival::PartiallyArrived);
        }
        let status = self.status as u32;
        if get_bits(status, 0, 7) == DTSW {
            if get_bit(status, STATUS_ERROR_BIT) {
                return Err(CrorcError::new(
                    CrorcStep::DataArrival,
                    format!("status word {:#010x} has error bit set", status),
                )
                .into());
            }
            return Ok(DataArrival::WholeArrived {
                length: self.length as u32,
            });
        }
        Err(CrorcError::new(
            CrorcStep::DataArrival,
            format!("unrecognized status word {:#010x}", status),
        )
        .into())
    }
}

/// Non-owning view over ready queue memory shared with hardware
pub struct ReadyFifo<'a> {
    entries: NonNull<ReadyFifoEntry>,
    capacity: usize,
    _memory: PhantomData<&'a ReadyFifoEntry>,
}

impl<'a> ReadyFifo<'a> {
    /// View `len` bytes at `ptr` as a ready queue of the C-RORC capacity
    ///
    /// # Safety
    /// `ptr` must stay valid for reads and writes of `len` bytes for `'a`, and
    /// nothing but volatile accesses (this view, the DMA engine) may touch it.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Result<Self> {
        let entries = NonNull::new(ptr.cast::<ReadyFifoEntry>())
            .ok_or_else(|| Error::invalid_parameter("ready fifo pointer is null"))?;
        if !check_alignment(ptr as usize, std::mem::align_of::<ReadyFifoEntry>()) {
            return Err(Error::invalid_parameter(format!(
                "ready fifo address {:p} is not word aligned",
                ptr
            )));
        }
        let needed = CRORC_NUMBER_OF_PAGES * std::mem::size_of::<ReadyFifoEntry>();
        if len < needed {
            return Err(Error::invalid_parameter(format!(
                "ready fifo buffer of {} bytes is smaller than {} bytes",
                len, needed
            )));
        }
        Ok(Self {
            entries,
            capacity: CRORC_NUMBER_OF_PAGES,
            _memory: PhantomData,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slot(&self, index: usize) -> Result<*mut ReadyFifoEntry> {
        if index >= self.capacity {
            return Err(Error::OutOfRange {
                what: "ready fifo index",
                value: index as u64,
                min: 0,
                max: self.capacity as u64,
            });
        }
        // SAFETY: index < capacity, inside the region validated at construction
        Ok(unsafe { self.entries.as_ptr().add(index) })
    }

    /// Set every entry to the empty sentinel
    ///
    /// Caller must own the channel; entries not yet consumed are discarded.
    pub fn reset(&self) {
        for index in 0..self.capacity {
            // SAFETY: index < capacity
            unsafe { write_entry(self.entries.as_ptr().add(index), ReadyFifoEntry::EMPTY) };
        }
        fence(Ordering::Release);
    }

    /// Re-arm a single consumed slot
    pub fn reset_entry(&self, index: usize) -> Result<()> {
        let slot = self.slot(index)?;
        // SAFETY: slot validated by self.slot
        unsafe { write_entry(slot, ReadyFifoEntry::EMPTY) };
        fence(Ordering::Release);
        Ok(())
    }

    /// Snapshot of one entry
    ///
    /// `status` is read first; `length` is only meaningful once `status`
    /// reports arrival.
    pub fn entry(&self, index: usize) -> Result<ReadyFifoEntry> {
        let slot = self.slot(index)?;
        // SAFETY: slot validated by self.slot
        let status = unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*slot).status)) };
        fence(Ordering::Acquire);
        let length = unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*slot).length)) };
        Ok(ReadyFifoEntry { length, status })
    }

    pub fn arrival(&self, index: usize) -> Result<DataArrival> {
        self.entry(index)?.arrival()
    }

    /// Poll one slot until its page has wholly arrived
    ///
    /// Returns `Ok(None)` when `interrupt` is raised first and a timeout fault
    /// once `timeout` has elapsed without arrival.
    pub fn wait_for_arrival(
        &self,
        index: usize,
        timeout: Duration,
        interrupt: &InterruptFlag,
    ) -> Result<Option<u32>> {
        let start = Instant::now();
        loop {
            if interrupt.is_set() {
                return Ok(None);
            }
            if let DataArrival::WholeArrived { length } = self.arrival(index)? {
                return Ok(Some(length));
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout(format!(
                    "ready fifo slot {} did not complete within {:?}",
                    index, timeout
                )));
            }
            std::hint::spin_loop();
        }
    }

    /// Entries that currently hold a status word
    pub fn ready_count(&self) -> usize {
        (0..self.capacity)
            .filter_map(|i| self.entry(i).ok())
            .filter(|e| !e.is_empty())
            .count()
    }
}

unsafe fn write_entry(slot: *mut ReadyFifoEntry, entry: ReadyFifoEntry) {
    std::ptr::write_volatile(std::ptr::addr_of_mut!((*slot).length), entry.length);
    std::ptr::write_volatile(std::ptr::addr_of_mut!((*slot).status), entry.status);
}

/// Page-aligned host memory holding one ready queue
pub struct ReadyFifoBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// Safety: the buffer is only accessed through volatile reads/writes via ReadyFifo
unsafe impl Send for ReadyFifoBuffer {}
unsafe impl Sync for ReadyFifoBuffer {}

impl ReadyFifoBuffer {
    const ALIGNMENT: usize = 4096;

    pub fn new() -> Result<Self> {
        let size = CRORC_NUMBER_OF_PAGES * std::mem::size_of::<ReadyFifoEntry>();
        let layout = Layout::from_size_align(size, Self::ALIGNMENT)
            .map_err(|e| Error::MemoryMap(format!("invalid ready fifo layout: {}", e)))?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| Error::MemoryMap("ready fifo allocation failed".into()))?;
        let buffer = Self { ptr, layout };
        buffer.fifo().reset();
        Ok(buffer)
    }

    pub fn fifo(&self) -> ReadyFifo<'_> {
        ReadyFifo {
            entries: self.ptr.cast(),
            capacity: CRORC_NUMBER_OF_PAGES,
            _memory: PhantomData,
        }
    }

    /// Address handed to the DMA engine
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for ReadyFifoBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in new() with this layout
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
