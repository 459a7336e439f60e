//! System load probing for the prefetch throttle.
//!
//! The prefetch worker throttles itself when the machine is busy so that a
//! crowd of readers on seek-bound storage cannot drive the load average
//! through the roof. The probe is a trait so tests can pin the load to a
//! fixed value.

use std::sync::Arc;
use std::thread;

/// Reports the 1-minute load average normalized by the number of cores.
///
/// A return value of `1.0` means the run queue equals the core count; the
/// throttle policy treats anything above `0.5` (load > cores/2) as busy.
pub trait SystemLoadProbe: Send + Sync {
    /// The current 1-minute load average divided by the core count.
    fn load_fraction(&self) -> f64;
}

/// Production probe backed by `sysinfo`.
#[derive(Debug, Default)]
pub struct SysinfoLoadProbe;

impl SystemLoadProbe for SysinfoLoadProbe {
    fn load_fraction(&self) -> f64 {
        let load = sysinfo::System::load_average().one;
        load / available_cores() as f64
    }
}

/// Test probe returning a fixed load fraction.
#[derive(Debug)]
pub struct FixedLoadProbe(pub f64);

impl SystemLoadProbe for FixedLoadProbe {
    fn load_fraction(&self) -> f64 {
        self.0
    }
}

/// Number of cores available to this process.
#[must_use]
pub fn available_cores() -> usize {
    thread::available_parallelism().map_or(1, usize::from)
}

/// The default production probe, shared across readers.
#[must_use]
pub fn default_probe() -> Arc<dyn SystemLoadProbe> {
    Arc::new(SysinfoLoadProbe)
}
