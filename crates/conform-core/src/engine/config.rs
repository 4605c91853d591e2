use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file '{path}': {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Distance window for accepting a disulfide between two thiol-capable atoms.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DisulfideWindow {
    pub ideal: f64,
    pub tolerance: f64,
}

impl DisulfideWindow {
    pub fn cutoff(&self) -> f64 {
        self.ideal + self.tolerance
    }

    pub fn accepts(&self, distance: f64) -> bool {
        (distance - self.ideal).abs() <= self.tolerance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisulfideCutoffs {
    /// Sulfur-sulfur window for full-atom residues.
    pub full_atom: DisulfideWindow,
    /// Window between reduced-representation side-chain centroids.
    pub centroid: DisulfideWindow,
}

impl Default for DisulfideCutoffs {
    fn default() -> Self {
        Self {
            full_atom: DisulfideWindow {
                ideal: 2.02,
                tolerance: 0.5,
            },
            centroid: DisulfideWindow {
                ideal: 3.72,
                tolerance: 1.0,
            },
        }
    }
}

/// Parameters of the bond and disulfide inference heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BondDetectionConfig {
    /// Added to the neighbour-search radius on top of template bond lengths and residue radii (Å).
    pub search_margin: f64,
    /// Largest accepted deviation between a candidate bond and either template length (Å).
    pub distance_tolerance: f64,
    pub disulfide: DisulfideCutoffs,
}

impl Default for BondDetectionConfig {
    fn default() -> Self {
        Self {
            search_margin: 0.5,
            distance_tolerance: 0.5,
            disulfide: DisulfideCutoffs::default(),
        }
    }
}

impl BondDetectionConfig {
    /// A builder pre-filled with the defaults.
    pub fn builder() -> BondDetectionConfigBuilder {
        let defaults = Self::default();
        BondDetectionConfigBuilder::new()
            .search_margin(defaults.search_margin)
            .distance_tolerance(defaults.distance_tolerance)
            .full_atom_disulfide(defaults.disulfide.full_atom)
            .centroid_disulfide(defaults.disulfide.centroid)
    }

    /// Reads a TOML file; absent keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Toml {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded bond detection configuration.");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_negative("search_margin", self.search_margin)?;
        non_negative("distance_tolerance", self.distance_tolerance)?;
        window("disulfide.full_atom", &self.disulfide.full_atom)?;
        window("disulfide.centroid", &self.disulfide.centroid)
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidParameter {
            name,
            reason: format!("expected a finite, non-negative number, got {}", value),
        })
    }
}

fn window(name: &'static str, window: &DisulfideWindow) -> Result<(), ConfigError> {
    if !(window.ideal.is_finite() && window.ideal > 0.0) {
        return Err(ConfigError::InvalidParameter {
            name,
            reason: format!("ideal distance must be positive, got {}", window.ideal),
        });
    }
    non_negative(name, window.tolerance)
}

#[derive(Default)]
pub struct BondDetectionConfigBuilder {
    search_margin: Option<f64>,
    distance_tolerance: Option<f64>,
    full_atom_disulfide: Option<DisulfideWindow>,
    centroid_disulfide: Option<DisulfideWindow>,
}

impl BondDetectionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn search_margin(mut self, margin: f64) -> Self {
        self.search_margin = Some(margin);
        self
    }
    pub fn distance_tolerance(mut self, tolerance: f64) -> Self {
        self.distance_tolerance = Some(tolerance);
        self
    }
    pub fn full_atom_disulfide(mut self, window: DisulfideWindow) -> Self {
        self.full_atom_disulfide = Some(window);
        self
    }
    pub fn centroid_disulfide(mut self, window: DisulfideWindow) -> Self {
        self.centroid_disulfide = Some(window);
        self
    }

    pub fn build(self) -> Result<BondDetectionConfig, ConfigError> {
        let config = BondDetectionConfig {
            search_margin: self
                .search_margin
                .ok_or(ConfigError::MissingParameter("search_margin"))?,
            distance_tolerance: self
                .distance_tolerance
                .ok_or(ConfigError::MissingParameter("distance_tolerance"))?,
            disulfide: DisulfideCutoffs {
                full_atom: self
                    .full_atom_disulfide
                    .ok_or(ConfigError::MissingParameter("full_atom_disulfide"))?,
                centroid: self
                    .centroid_disulfide
                    .ok_or(ConfigError::MissingParameter("centroid_disulfide"))?,
            },
        };
        config.validate()?;
        Ok(config)
    }
}
