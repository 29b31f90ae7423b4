use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use vmpress_core::allocator::{Watermarks, ZoneClass};

use crate::SimError;

/// One simulated zone.
#[derive(Clone, Debug, Deserialize)]
pub struct ZoneConfig {
    /// Class of the zone
    pub zone: ZoneClass,
    /// NUMA node the zone belongs to
    #[serde(default)]
    pub node: usize,
    /// Pages managed by the zone
    pub pages: u64,
    /// Reclaim thresholds of the zone
    pub watermarks: Watermarks,
}

/// Makes `PageAllocator::allocate` start failing.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct FailurePlan {
    /// Attempts that succeed normally before failures start
    pub after_attempts: u64,
    /// Only attempts of at least this order fail
    #[serde(default)]
    pub min_order: usize,
}

/// Configuration of a simulated machine.
///
/// Zones are laid out one after another in the order given, so list them
/// from low to high memory.
#[derive(Clone, Debug, Deserialize)]
pub struct SimConfig {
    /// The zones, lowest address first
    pub zones: Vec<ZoneConfig>,
    /// Fraction of every zone's pages pinned at random at start-up
    #[serde(default)]
    pub fragmentation: f64,
    /// Seed for the fragmentation pattern
    #[serde(default)]
    pub seed: u64,
    /// Injected allocation failures
    #[serde(default)]
    pub failure: Option<FailurePlan>,
}

impl SimConfig {
    /// A machine with a single normal zone.
    pub fn single_zone(pages: u64, watermarks: Watermarks) -> Self {
        Self {
            zones: vec![ZoneConfig {
                zone: ZoneClass::Normal,
                node: 0,
                pages,
                watermarks,
            }],
            fragmentation: 0.0,
            seed: 0,
            failure: None,
        }
    }

    /// Adds a zone above the existing ones.
    pub fn with_zone(mut self, zone: ZoneClass, pages: u64, watermarks: Watermarks) -> Self {
        self.zones.push(ZoneConfig {
            zone,
            node: 0,
            pages,
            watermarks,
        });
        self
    }

    /// Pins `fraction` of all pages, chosen with `seed`.
    pub fn with_fragmentation(mut self, fraction: f64, seed: u64) -> Self {
        self.fragmentation = fraction;
        self.seed = seed;
        self
    }

    /// Lets `after_attempts` allocations of order `min_order` or above
    /// succeed and fails every one after that.
    pub fn with_failure(mut self, after_attempts: u64, min_order: usize) -> Self {
        self.failure = Some(FailurePlan {
            after_attempts,
            min_order,
        });
        self
    }

    /// Loads configuration from a JSON file.
    ///
    /// # Arguments
    ///
    /// * `filepath` - Path to the JSON configuration file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_jsonfile(filepath: &str) -> Result<SimConfig, SimError> {
        let mut file = File::open(Path::new(filepath))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: SimConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that zones are non-empty and watermarks are ordered.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.zones.is_empty() {
            return Err(SimError::InvalidConfig("no zones".into()));
        }
        if !(0.0..1.0).contains(&self.fragmentation) {
            return Err(SimError::InvalidConfig(format!(
                "fragmentation {} outside [0, 1)",
                self.fragmentation
            )));
        }
        for z in &self.zones {
            let wm = z.watermarks;
            if z.pages == 0 {
                return Err(SimError::InvalidConfig(format!("zone {} is empty", z.zone)));
            }
            if !(wm.min <= wm.low && wm.low <= wm.high && wm.high <= z.pages) {
                return Err(SimError::InvalidConfig(format!(
                    "zone {}: watermarks {:?} not ordered within {} pages",
                    z.zone, wm, z.pages
                )));
            }
        }
        Ok(())
    }
}

impl Default for SimConfig {
    /// 16 MiB of DMA memory below 1 GiB of normal memory.
    fn default() -> Self {
        Self {
            zones: vec![
                ZoneConfig {
                    zone: ZoneClass::Dma,
                    node: 0,
                    pages: 4096,
                    watermarks: Watermarks {
                        min: 32,
                        low: 40,
                        high: 48,
                    },
                },
                ZoneConfig {
                    zone: ZoneClass::Normal,
                    node: 0,
                    pages: 262_144,
                    watermarks: Watermarks {
                        min: 1024,
                        low: 1280,
                        high: 1536,
                    },
                },
            ],
            fragmentation: 0.0,
            seed: 0,
            failure: None,
        }
    }
}
