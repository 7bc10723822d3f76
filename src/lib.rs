//! Readout card driver core
//!
//! User-space access to readout cards (C-RORC, CRU): validated BAR register
//! access, the hardware-written ready queue and cross-process channel
//! ownership. A [`Channel`] ties the three together.
//!
//! ## Build-time Configuration
//! - `ROC_LOCK_DIR`: directory for channel lock records (default: /dev/shm/readoutcard)
//! - `ROC_SYSFS_ROOT`: PCI device directory (default: /sys/bus/pci/devices)

pub mod bar;
pub mod channel;
pub mod device_finder;
pub mod devmem;
pub mod error;
pub mod interrupt;
pub mod lock;
pub mod parameters;
pub mod ready_fifo;
pub mod stress;
pub mod util;

pub use bar::{BarAccessor, RegisterRegion, SimulatedRegion};
pub use channel::Channel;
pub use error::{Error, ErrorKind, Result};
pub use interrupt::InterruptFlag;
pub use lock::{ChannelKey, ChannelLock, LockManager, SharedState};
pub use parameters::{CardId, CardType, LockMedium, Parameters};
pub use ready_fifo::{DataArrival, ReadyFifo, ReadyFifoEntry};
