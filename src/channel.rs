//! Channel: the unit an application opens
//!
//! Opening resolves the card, maps the channel's BAR, takes the cross-process
//! channel lock and arms a fresh ready queue. Closing (explicitly or on drop)
//! resets the ready queue, releases the lock and unmaps the BAR.

use crate::bar::{BarAccessor, RegisterRegion};
use crate::device_finder::{CardDescriptor, DeviceFinder};
use crate::devmem::DevMem;
use crate::error::{Error, Result};
use crate::interrupt::InterruptFlag;
use crate::lock::{ChannelKey, ChannelLock, LockManager, SharedState};
use crate::parameters::Parameters;
use crate::ready_fifo::{ReadyFifo, ReadyFifoBuffer};

pub struct Channel<R: RegisterRegion = DevMem> {
    params: Parameters,
    card: Option<CardDescriptor>,
    ready_fifo: ReadyFifoBuffer,
    lock: Option<ChannelLock>,
    // Dropped last so the BAR is unmapped after the lock is gone
    bar: BarAccessor<R>,
}

impl Channel<DevMem> {
    /// Open a channel on real hardware (or a sysfs-like tree of mappable files)
    pub fn open(params: Parameters) -> Result<Self> {
        let card = DeviceFinder::new(params.sysfs_root()).find(params.card_id())?;
        if let Some(expected) = params.card_type() {
            if expected != card.card_type {
                return Err(Error::invalid_parameter(format!(
                    "card {} is a {}, expected {}",
                    card.address, card.card_type, expected
                )));
            }
        }
        card.card_type.check_channel(params.channel_number())?;

        let resource = card.bar_resource(params.channel_number());
        let region = DevMem::map_resource(&resource)?;
        let key = ChannelKey::new(card.address, params.channel_number());
        Self::assemble(params, Some(card), key, region)
    }
}

impl<R: RegisterRegion> Channel<R> {
    /// Open a channel over an already mapped register region
    ///
    /// The lock is keyed by the card id as given in `params`.
    pub fn open_with_region(params: Parameters, region: R) -> Result<Self> {
        let key = ChannelKey::new(params.card_id(), params.channel_number());
        Self::assemble(params, None, key, region)
    }

    fn assemble(
        params: Parameters,
        card: Option<CardDescriptor>,
        key: ChannelKey,
        region: R,
    ) -> Result<Self> {
        let bar = BarAccessor::new(region, params.channel_number());
        let locks = LockManager::new(params.lock_dir(), params.lock_medium(), params.lock_timeout());
        let lock = locks.acquire(&key)?;

        // Allocated already reset to the empty sentinel
        let ready_fifo = ReadyFifoBuffer::new()?;

        tracing::info!(
            "Opened {} channel {} (BAR size {:#x})",
            key.card(),
            key.channel(),
            bar.bar_size()
        );

        Ok(Self {
            params,
            card,
            ready_fifo,
            lock: Some(lock),
            bar,
        })
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    /// Card resolved by the device finder, when opened through it
    pub fn card(&self) -> Option<&CardDescriptor> {
        self.card.as_ref()
    }

    pub fn bar(&self) -> &BarAccessor<R> {
        &self.bar
    }

    pub fn ready_fifo(&self) -> ReadyFifo<'_> {
        self.ready_fifo.fifo()
    }

    /// Ready queue memory to hand to the DMA buffer manager
    pub fn ready_fifo_buffer(&self) -> &ReadyFifoBuffer {
        &self.ready_fifo
    }

    pub fn lock_record(&self) -> Option<&SharedState> {
        self.lock.as_ref().map(|lock| lock.record())
    }

    /// Wait for one page with the session's arrival timeout
    pub fn wait_for_page(&self, index: usize, interrupt: &InterruptFlag) -> Result<Option<u32>> {
        self.ready_fifo()
            .wait_for_arrival(index, self.params.arrival_timeout(), interrupt)
    }

    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(lock) = self.lock.take() else {
            return Ok(());
        };
        self.ready_fifo.fifo().reset();
        let key = lock.key().clone();
        lock.release()?;
        tracing::info!("Closed {} channel {}", key.card(), key.channel());
        Ok(())
    }
}

impl<R: RegisterRegion> Drop for Channel<R> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Closing channel failed: {}", e);
        }
    }
}
