//! Reconstruction configuration.
//!
//! Every field has a default, so a TOML file only needs the keys it
//! changes:
//!
//! ```toml
//! [device]
//! profile = "portable"
//!
//! [solver]
//! timing = true
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors from loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Hardware profile controlling requested device limits and default
/// workgroup sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProfile {
    /// Use the adapter's default limits.
    #[default]
    Native,
    /// Request downlevel limits so that any dispatch which would fail on a
    /// weaker device is rejected on the development machine too.
    Portable,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Native => write!(f, "Native"),
            DeviceProfile::Portable => write!(f, "Portable (downlevel limits)"),
        }
    }
}

/// Device selection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub profile: DeviceProfile,
    /// Skip software rasterizers (llvmpipe, WARP) when a hardware adapter
    /// is present. Off by default: the first enumerated adapter is used.
    pub prefer_hardware: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            profile: DeviceProfile::Native,
            prefer_hardware: false,
        }
    }
}

/// CG solver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// `⟨p, AᵗA·p⟩` at or below this value ends the iteration as converged.
    pub degeneracy_floor: f32,
    /// Wait for every volume kernel to finish and log its wall time, and
    /// record the wall time of each whole iteration.
    pub timing: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            degeneracy_floor: 1e-30,
            timing: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    pub device: DeviceConfig,
    pub solver: SolverConfig,
}

impl ReconConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
