//! Reconstruction parameters supplied by the surrounding application.

use glam::DMat3;
use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_BATCH_SIZE;
use crate::error::{ReconstructionError, Result};
use crate::extent::DEFAULT_MAX_VOXELS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    /// Isotropic output voxel spacing, in location units.
    pub spacing: f64,
    /// Neighbourhood half-width around the projected pixel, in pixels.
    pub search_radius: u32,
    /// Standard deviation of the Gaussian splat weight, in pixels.
    pub kernel_std_dev: f32,
    /// Slices uploaded per dispatch.
    pub batch_size: usize,
    /// Output grid axes; identity when unset.
    pub output_direction: Option<DMat3>,
    /// Largest output grid accepted before anything is allocated.
    pub max_voxels: u64,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            spacing: 1.0,
            search_radius: 1,
            kernel_std_dev: 0.5,
            batch_size: DEFAULT_BATCH_SIZE,
            output_direction: None,
            max_voxels: DEFAULT_MAX_VOXELS,
        }
    }
}

impl ReconstructionConfig {
    pub fn with_spacing(mut self, spacing: f64) -> Self {
        self.spacing = spacing;
        self
    }

    pub fn with_search_radius(mut self, search_radius: u32) -> Self {
        self.search_radius = search_radius;
        self
    }

    pub fn with_kernel_std_dev(mut self, kernel_std_dev: f32) -> Self {
        self.kernel_std_dev = kernel_std_dev;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_output_direction(mut self, direction: DMat3) -> Self {
        self.output_direction = Some(direction);
        self
    }

    pub fn with_max_voxels(mut self, max_voxels: u64) -> Self {
        self.max_voxels = max_voxels;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.spacing.is_finite() && self.spacing > 0.0) {
            return Err(ReconstructionError::invalid_state(format!(
                "output spacing must be positive, got {}",
                self.spacing
            )));
        }
        let sigma = self.kernel_std_dev;
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(ReconstructionError::invalid_state(format!(
                "kernel standard deviation must be positive, got {sigma}"
            )));
        }
        // The splat weight divides by 2σ², which must not underflow or overflow.
        if !(2.0 * sigma * sigma).is_normal() {
            return Err(ReconstructionError::invalid_state(format!(
                "kernel standard deviation {sigma} is out of the representable range"
            )));
        }
        if self.batch_size == 0 {
            return Err(ReconstructionError::invalid_state("batch size must be at least 1"));
        }
        if self.max_voxels == 0 {
            return Err(ReconstructionError::invalid_state("voxel limit must be at least 1"));
        }
        if let Some(direction) = self.output_direction {
            let orthonormal = (direction.transpose() * direction).abs_diff_eq(DMat3::IDENTITY, 1e-6);
            if !orthonormal {
                return Err(ReconstructionError::invalid_state(
                    "output direction must be an orthonormal matrix",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tuned_constants() {
        let config = ReconstructionConfig::default();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.search_radius, 1);
        assert_eq!(config.kernel_std_dev, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_parameters() {
        assert!(ReconstructionConfig::default().with_spacing(0.0).validate().is_err());
        assert!(ReconstructionConfig::default().with_spacing(f64::NAN).validate().is_err());
        assert!(ReconstructionConfig::default().with_kernel_std_dev(-1.0).validate().is_err());
        assert!(ReconstructionConfig::default().with_batch_size(0).validate().is_err());
        assert!(ReconstructionConfig::default().with_max_voxels(0).validate().is_err());
        assert!(
            ReconstructionConfig::default()
                .with_output_direction(DMat3::from_diagonal(glam::DVec3::splat(2.0)))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn rejects_std_dev_whose_variance_underflows() {
        let tiny = ReconstructionConfig::default().with_kernel_std_dev(1e-23);
        assert!(matches!(tiny.validate(), Err(ReconstructionError::InvalidState(_))));
        let huge = ReconstructionConfig::default().with_kernel_std_dev(1e20);
        assert!(huge.validate().is_err());
        assert!(ReconstructionConfig::default().with_kernel_std_dev(1e-3).validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ReconstructionConfig =
            serde_json::from_str(r#"{ "spacing": 0.25, "batch_size": 1 }"#).unwrap();
        assert_eq!(config.spacing, 0.25);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.search_radius, 1);
        assert_eq!(config.output_direction, None);
        assert_eq!(config.max_voxels, DEFAULT_MAX_VOXELS);
    }
}
