use crate::resources::DeviceInventory;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// placeholder for "as many as the host has", also the cli default for caps
pub const UNBOUNDED: usize = 1000;

pub const ALLOCATION_FILE: &str = "allocation.yaml";

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("No config directory could be determined for this user")]
    NoConfigDirectory,
    #[error("Failed to access allocation config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Allocation config {path:?} is invalid: {source}")]
    Invalid {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// location of the persisted allocation config in the user's config directory
pub fn default_config_path() -> Result<PathBuf, ConfigErrors> {
    ProjectDirs::from("org", "Flotilla", "flotilla")
        .map(|dirs| dirs.config_dir().join(ALLOCATION_FILE))
        .ok_or(ConfigErrors::NoConfigDirectory)
}

/// CPU and accelerator capacity of the host running the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapacity {
    pub cpus: usize,
    pub gpus: usize,
}

impl HostCapacity {
    pub fn detect(inventory: &dyn DeviceInventory) -> Self {
        Self {
            cpus: num_cpus::get(),
            gpus: inventory.device_count(),
        }
    }

    /// clamp a requested gpu cap, hosts without devices do not limit it
    fn clamp_gpus(&self, requested: usize) -> usize {
        if self.gpus == 0 {
            requested.min(UNBOUNDED)
        } else {
            self.gpus.min(requested)
        }
    }
}

/// Previously generated resource allocation
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AllocationConfig {
    pub num_cpus: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_gpus: Option<usize>,
}

impl AllocationConfig {
    /// build a config from operator caps, clamped to what the host actually has
    pub fn generate(max_num_cpu: usize, max_num_gpu: usize, host: HostCapacity) -> Self {
        let num_cpus = host.cpus.min(max_num_cpu).max(1);
        let num_gpus = match host.clamp_gpus(max_num_gpu) {
            0 | UNBOUNDED => None,
            gpus => Some(gpus),
        };

        debug!("num_cpus: {num_cpus}");
        debug!("num_gpus: {num_gpus:?}");

        Self { num_cpus, num_gpus }
    }

    /// a missing file is not an error, it means defaults are used
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigErrors> {
        match fs::read_to_string(path) {
            Ok(contents) => serde_yaml::from_str(&contents)
                .map(Some)
                .map_err(|source| ConfigErrors::Invalid {
                    path: path.to_path_buf(),
                    source,
                }),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!("No allocation config at {}, using defaults", path.display());
                Ok(None)
            }
            Err(source) => Err(ConfigErrors::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigErrors> {
        let io_error = |source| ConfigErrors::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let contents = serde_yaml::to_string(self).map_err(|source| ConfigErrors::Invalid {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, contents).map_err(io_error)?;

        info!("Wrote allocation config to {}", path.display());

        Ok(())
    }
}

/// Operator caps on CPU cores and accelerators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceLimits {
    pub max_num_cpu: Option<usize>,
    pub max_num_gpu: Option<usize>,
}

impl ResourceLimits {
    /// fill unset caps from `fallback`
    pub fn or(self, fallback: Self) -> Self {
        Self {
            max_num_cpu: self.max_num_cpu.or(fallback.max_num_cpu),
            max_num_gpu: self.max_num_gpu.or(fallback.max_num_gpu),
        }
    }
}

/// Capacity the fabric is started with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FabricConfig {
    pub num_cpus: usize,
    /// `None` uses every device the host has
    pub num_gpus: Option<usize>,
}

impl FabricConfig {
    /// start from the persisted config (or the host) and apply operator caps
    pub fn resolve(
        persisted: Option<&AllocationConfig>,
        limits: ResourceLimits,
        host: HostCapacity,
    ) -> Self {
        let mut config = match persisted {
            Some(persisted) => Self {
                num_cpus: persisted.num_cpus,
                num_gpus: persisted.num_gpus,
            },
            None => Self {
                num_cpus: host.cpus,
                num_gpus: None,
            },
        };

        if let Some(max_num_cpu) = limits.max_num_cpu {
            config.num_cpus = host.cpus.min(max_num_cpu).max(1);
        }
        if let Some(max_num_gpu) = limits.max_num_gpu {
            config.num_gpus = Some(host.clamp_gpus(max_num_gpu));
        }

        config
    }

    pub fn gpu_capacity(&self, host: HostCapacity) -> usize {
        self.num_gpus.unwrap_or(host.gpus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: HostCapacity = HostCapacity { cpus: 8, gpus: 2 };
    const CPU_ONLY: HostCapacity = HostCapacity { cpus: 8, gpus: 0 };

    #[test]
    fn generate_clamps_to_host() {
        assert_eq!(
            AllocationConfig::generate(UNBOUNDED, UNBOUNDED, HOST),
            AllocationConfig {
                num_cpus: 8,
                num_gpus: Some(2)
            }
        );
        assert_eq!(
            AllocationConfig::generate(4, 1, HOST),
            AllocationConfig {
                num_cpus: 4,
                num_gpus: Some(1)
            }
        );
    }

    #[test]
    fn generate_omits_meaningless_gpu_counts() {
        assert_eq!(AllocationConfig::generate(4, UNBOUNDED, CPU_ONLY).num_gpus, None);
        assert_eq!(AllocationConfig::generate(4, 0, HOST).num_gpus, None);
    }

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(AllocationConfig::load(&dir.path().join(ALLOCATION_FILE)).unwrap(), None);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(ALLOCATION_FILE);
        let config = AllocationConfig {
            num_cpus: 6,
            num_gpus: None,
        };

        config.save(&path).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "num_cpus: 6\n");
        assert_eq!(AllocationConfig::load(&path).unwrap(), Some(config));
    }

    #[test]
    fn invalid_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ALLOCATION_FILE);
        fs::write(&path, "num_cpus: 2\nnum_tpus: 1\n").unwrap();

        assert!(matches!(
            AllocationConfig::load(&path),
            Err(ConfigErrors::Invalid { .. })
        ));
    }

    #[test]
    fn persisted_config_is_the_starting_point() {
        let persisted = AllocationConfig {
            num_cpus: 3,
            num_gpus: Some(1),
        };

        assert_eq!(
            FabricConfig::resolve(Some(&persisted), ResourceLimits::default(), HOST),
            FabricConfig {
                num_cpus: 3,
                num_gpus: Some(1)
            }
        );
        assert_eq!(
            FabricConfig::resolve(None, ResourceLimits::default(), HOST),
            FabricConfig {
                num_cpus: 8,
                num_gpus: None
            }
        );
    }

    #[test]
    fn overrides_are_clamped_to_host() {
        let limits = ResourceLimits {
            max_num_cpu: Some(64),
            max_num_gpu: Some(4),
        };
        let persisted = AllocationConfig {
            num_cpus: 3,
            num_gpus: None,
        };

        let config = FabricConfig::resolve(Some(&persisted), limits, HOST);

        assert_eq!(config.num_cpus, 8);
        assert_eq!(config.num_gpus, Some(2));
        assert_eq!(FabricConfig::resolve(None, limits, CPU_ONLY).num_gpus, Some(4));
    }

    #[test]
    fn job_limits_take_precedence() {
        let job = ResourceLimits {
            max_num_cpu: Some(2),
            max_num_gpu: None,
        };
        let operator = ResourceLimits {
            max_num_cpu: Some(4),
            max_num_gpu: Some(1),
        };

        assert_eq!(
            job.or(operator),
            ResourceLimits {
                max_num_cpu: Some(2),
                max_num_gpu: Some(1)
            }
        );
    }
}
