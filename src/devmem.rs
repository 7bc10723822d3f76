//! Memory-mapped card resources
//!
//! Maps a PCI BAR through its sysfs `resource<N>` file so control registers
//! can be accessed from userspace with volatile 32-bit loads and stores.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::bar::RegisterRegion;
use crate::error::{Error, Result};

/// Memory-mapped region for hardware access
pub struct DevMem {
    ptr: *mut u8,
    size: usize,
    base_offset: usize,
    path: PathBuf,
    _file: File,
}

// Safety: DevMem only provides &self methods that use volatile reads/writes.
// Cross-process exclusion is provided by the channel lock, not by this type.
unsafe impl Send for DevMem {}
unsafe impl Sync for DevMem {}

fn page_size() -> usize {
    // SAFETY: sysconf has no memory safety preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

impl DevMem {
    /// Map a whole resource file (a BAR under sysfs, or any mappable file)
    pub fn map_resource(path: &Path) -> Result<Self> {
        let file = open_resource(path)?;
        let size = file
            .metadata()
            .map_err(|e| Error::Pda(format!("cannot stat {}: {}", path.display(), e)))?
            .len() as usize;
        Self::map_file(file, path, 0, size)
    }

    /// Map `size` bytes starting at byte `base_offset` of a resource file
    ///
    /// The offset does not need to be page-aligned, the mapping is widened to
    /// the enclosing page and the returned region starts at `base_offset`.
    pub fn map(path: &Path, base_offset: usize, size: usize) -> Result<Self> {
        let file = open_resource(path)?;
        Self::map_file(file, path, base_offset, size)
    }

    fn map_file(file: File, path: &Path, base_offset: usize, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::MemoryMap(format!(
                "{} has zero size (device not enabled?)",
                path.display()
            )));
        }

        let page_offset = base_offset % page_size();
        let map_base = base_offset - page_offset;
        let map_size = size + page_offset;

        tracing::debug!(
            "Mapping {} at offset {:#x}, {} bytes",
            path.display(),
            map_base,
            map_size
        );

        // SAFETY: fd is open for read/write and stays open for the lifetime
        // of the mapping (stored in the struct); the result is checked below
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                map_base as libc::off_t,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryMap(format!(
                "mmap of {} failed: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        // Adjust pointer to account for page alignment
        // SAFETY: page_offset < map_size, so the result stays inside the mapping
        let adjusted_ptr = unsafe { (ptr as *mut u8).add(page_offset) };

        tracing::info!(
            "Mapped {} ({} bytes at {:p})",
            path.display(),
            size,
            adjusted_ptr
        );

        Ok(Self {
            ptr: adjusted_ptr,
            size,
            base_offset,
            path: path.to_path_buf(),
            _file: file,
        })
    }

    /// Read a 32-bit word at byte offset
    #[inline]
    pub fn read32(&self, offset: usize) -> Option<u32> {
        if offset.checked_add(4)? > self.size {
            return None;
        }
        // SAFETY: bounds checked above, registers are word aligned
        Some(unsafe { std::ptr::read_volatile(self.ptr.add(offset) as *const u32) })
    }

    /// Write a 32-bit word at byte offset
    #[inline]
    pub fn write32(&self, offset: usize, value: u32) -> bool {
        match offset.checked_add(4) {
            Some(end) if end <= self.size => {}
            _ => return false,
        }
        // SAFETY: bounds checked above, registers are word aligned
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset) as *mut u32, value);
        }
        true
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_resource(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| Error::Pda(format!("cannot open {}: {}", path.display(), e)))
}

impl RegisterRegion for DevMem {
    fn size(&self) -> usize {
        self.size
    }

    fn read32(&self, offset: usize) -> Option<u32> {
        DevMem::read32(self, offset)
    }

    fn write32(&self, offset: usize, value: u32) -> bool {
        DevMem::write32(self, offset, value)
    }
}

impl Drop for DevMem {
    fn drop(&mut self) {
        let page_offset = self.base_offset % page_size();
        // SAFETY: reverses the adjustment made in map_file
        let map_ptr = unsafe { self.ptr.sub(page_offset) };
        let map_size = self.size + page_offset;

        tracing::debug!("Unmapping {}", self.path.display());
        // SAFETY: pointer and length are exactly those returned by/passed to mmap
        let rc = unsafe { libc::munmap(map_ptr as *mut libc::c_void, map_size) };
        if rc != 0 {
            tracing::warn!(
                "munmap of {} failed: {}",
                self.path.display(),
                std::io::Error::last_os_error()
            );
        }
    }
}
