//! BAR stress: back-to-back register write/read cycles
//!
//! One cycle is a write of `value` followed by a read of the same register.
//! The loop checks the interrupt flag between cycles.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::bar::{BarAccessor, RegisterRegion};
use crate::error::Result;
use crate::interrupt::InterruptFlag;

#[derive(Debug, Clone, Serialize)]
pub struct StressReport {
    pub requested_cycles: u64,
    pub cycles: u64,
    pub operations: u64,
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub interrupted: bool,
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl StressReport {
    /// Operations per second
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.operations as f64 / secs
        } else {
            0.0
        }
    }

    /// 32 bits move per operation
    pub fn throughput_mbps(&self) -> f64 {
        self.throughput() * 32.0 / 1e6
    }

    /// Seconds per operation
    pub fn latency(&self) -> f64 {
        if self.operations > 0 {
            self.elapsed.as_secs_f64() / self.operations as f64
        } else {
            0.0
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.insert("throughput_ops".into(), self.throughput().into());
            map.insert("throughput_mbps".into(), self.throughput_mbps().into());
            map.insert("latency_s".into(), self.latency().into());
        }
        value
    }
}

impl fmt::Display for StressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.interrupted {
            writeln!(f, "Interrupted after {} of {} cycles", self.cycles, self.requested_cycles)?;
        }
        writeln!(f, "Total BAR operations: {}", self.operations)?;
        writeln!(f, "Time: {:.6} s", self.elapsed.as_secs_f64())?;
        writeln!(f, "Throughput: {:.2} ops/sec", self.throughput())?;
        writeln!(f, "Throughput: {:.2} Mbps", self.throughput_mbps())?;
        write!(f, "Operation latency: {:.3e} sec", self.latency())
    }
}

pub fn stress<R: RegisterRegion>(
    bar: &BarAccessor<R>,
    address: usize,
    value: u32,
    cycles: u64,
    interrupt: &InterruptFlag,
) -> Result<StressReport> {
    tracing::info!(
        "Stressing BAR{} at {:#x} with {:#x} for {} cycles",
        bar.bar_index(),
        address,
        value,
        cycles
    );

    let start = Instant::now();
    let mut done = 0;
    while done < cycles {
        if interrupt.is_set() {
            break;
        }
        bar.write_register(address, value)?;
        bar.read_register(address)?;
        done += 1;
    }
    let elapsed = start.elapsed();

    Ok(StressReport {
        requested_cycles: cycles,
        cycles: done,
        operations: done.saturating_mul(2),
        elapsed,
        interrupted: done < cycles,
    })
}
