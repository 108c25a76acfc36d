use crate::registry::GpuRequirement;
use itertools::Itertools;
use std::env;
use tracing::{debug, warn};

/// environment variable listing device memory in MB, comma separated
pub const DEVICE_MEMORY_ENV: &str = "FLOTILLA_DEVICE_MEMORY_MB";

/// Opaque provider of accelerator information
pub trait DeviceInventory: Send + Sync {
    fn device_count(&self) -> usize;

    fn total_memory_mb(&self, device: usize) -> Option<f64>;

    fn free_memory_mb(&self, device: usize) -> Option<f64>;
}

/// Inventory of a host without accelerators
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDevices;

impl DeviceInventory for NoDevices {
    fn device_count(&self) -> usize {
        0
    }

    fn total_memory_mb(&self, _device: usize) -> Option<f64> {
        None
    }

    fn free_memory_mb(&self, _device: usize) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Device {
    pub total_mb: f64,
    pub free_mb: f64,
}

/// Fixed inventory, either configured or read from the environment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticInventory {
    devices: Vec<Device>,
}

impl StaticInventory {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    /// read `FLOTILLA_DEVICE_MEMORY_MB`, unparsable entries are skipped
    pub fn from_env() -> Self {
        let devices = env::var(DEVICE_MEMORY_ENV)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .filter_map(|entry| match entry.parse::<f64>() {
                        Ok(total_mb) if total_mb > 0.0 => Some(Device {
                            total_mb,
                            free_mb: total_mb,
                        }),
                        _ => {
                            warn!("Ignoring device memory entry {entry:?} in {DEVICE_MEMORY_ENV}");
                            None
                        }
                    })
                    .collect_vec()
            })
            .unwrap_or_default();

        debug!("Found {} devices in the environment", devices.len());

        Self { devices }
    }
}

impl DeviceInventory for StaticInventory {
    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn total_memory_mb(&self, device: usize) -> Option<f64> {
        self.devices.get(device).map(|device| device.total_mb)
    }

    fn free_memory_mb(&self, device: usize) -> Option<f64> {
        self.devices.get(device).map(|device| device.free_mb)
    }
}

/// index of the device with the most free memory
pub fn most_free_device(inventory: &dyn DeviceInventory) -> Option<usize> {
    (0..inventory.device_count())
        .filter_map(|device| inventory.free_memory_mb(device).map(|free| (device, free)))
        .fold(None, |best: Option<(usize, f64)>, (device, free)| match best {
            Some((_, best_free)) if best_free >= free => best,
            _ => Some((device, free)),
        })
        .map(|(device, _)| device)
}

/// Accelerator share requested from the fabric
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum GpuAllocation {
    /// cpu only
    #[default]
    None,
    /// a share in (0, 1] of one device
    Fraction(f64),
    /// whole devices
    Whole(u32),
}

impl GpuAllocation {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::None => None,
            Self::Fraction(share) => Some(*share),
            Self::Whole(units) => Some(f64::from(*units)),
        }
    }

    /// the fabric only accepts fractions up to one unit, anything above is rounded up
    pub fn from_ratio(ratio: f64) -> Self {
        if !ratio.is_finite() || ratio <= 0.0 {
            Self::None
        } else if ratio > 1.0 {
            Self::Whole(ratio.ceil() as u32)
        } else {
            Self::Fraction(ratio)
        }
    }
}

/// share of one device needed for `required_mb` out of `available_mb`
pub fn share_for_memory(required_mb: f64, available_mb: f64) -> GpuAllocation {
    if available_mb <= 0.0 {
        return GpuAllocation::None;
    }

    GpuAllocation::from_ratio(required_mb / available_mb)
}

/// Turn a declared requirement into an allocation, measured against device 0
pub fn allocate(requirement: GpuRequirement, inventory: &dyn DeviceInventory) -> GpuAllocation {
    let allocation = match requirement {
        GpuRequirement::None => GpuAllocation::None,
        GpuRequirement::Share(share) => GpuAllocation::from_ratio(share),
        GpuRequirement::VramMb(required_mb) => match inventory.total_memory_mb(0) {
            Some(available_mb) => share_for_memory(required_mb as f64, available_mb),
            None => {
                debug!("No accelerator available for {required_mb} MB, scheduling cpu only");
                GpuAllocation::None
            }
        },
    };

    debug!(?requirement, ?allocation, "Computed accelerator allocation");

    allocation
}
