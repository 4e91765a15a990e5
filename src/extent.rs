use glam::{DMat3, DMat4, DVec3};
use tracing::warn;

use crate::error::{ReconstructionError, Result};
use crate::slice::Slice;
use crate::volume::OutputVolume;

/// Slack, in voxels, absorbed before rounding an extent up to the next voxel.
const EXTENT_TOLERANCE: f64 = 1e-6;

/// Upper bound on output voxels unless configured otherwise.
pub const DEFAULT_MAX_VOXELS: u64 = 1 << 30;

/// Chooses the output grid that tightly bounds a set of transformed slices.
pub struct ExtentCalculator {
    spacing: f64,
    direction: DMat3,
    max_voxels: u64,
}

impl ExtentCalculator {
    pub fn new(spacing: f64, direction: Option<DMat3>) -> Self {
        Self {
            spacing,
            direction: direction.unwrap_or(DMat3::IDENTITY),
            max_voxels: DEFAULT_MAX_VOXELS,
        }
    }

    pub fn with_max_voxels(mut self, max_voxels: u64) -> Self {
        self.max_voxels = max_voxels;
        self
    }

    /// Allocates a zero-filled volume whose voxel centres span every
    /// transformed slice corner.
    ///
    /// `slice_to_location` holds each slice's transformed index-to-location
    /// matrix, in the same order as `slices`. Slices without pixels are
    /// skipped.
    ///
    /// # Errors
    ///
    /// [`ReconstructionError::InvalidState`] when no slice has pixels, or when
    /// the grid would exceed the voxel limit. Nothing is allocated then.
    pub fn compute(&self, slices: &[Slice], slice_to_location: &[DMat4]) -> Result<OutputVolume> {
        let (min, max) = self.bounds(slices, slice_to_location)?;

        let span = (max - min) / self.spacing;
        let intervals = (span - DVec3::splat(EXTENT_TOLERANCE)).ceil().max(DVec3::ZERO);
        let [width, height, depth] = self.voxel_counts(intervals)?;
        let dim = (depth as usize, height as usize, width as usize);

        Ok(OutputVolume::zeros(
            dim,
            self.direction * min,
            self.spacing,
            self.direction,
        ))
    }

    /// Voxels along x, y and z, each representable as `u32` and with a
    /// product within the configured limit.
    fn voxel_counts(&self, intervals: DVec3) -> Result<[u32; 3]> {
        let too_large = || {
            ReconstructionError::invalid_state(format!(
                "output grid of {} x {} x {} voxels at spacing {} exceeds the limit of {} voxels",
                intervals.x + 1.0,
                intervals.y + 1.0,
                intervals.z + 1.0,
                self.spacing,
                self.max_voxels
            ))
        };

        let mut counts = [0u32; 3];
        for (count, interval) in counts.iter_mut().zip(intervals.to_array()) {
            if !interval.is_finite() || interval + 1.0 > u32::MAX as f64 {
                return Err(too_large());
            }
            *count = interval as u32 + 1;
        }
        counts
            .iter()
            .try_fold(1u64, |total, &count| total.checked_mul(count as u64))
            .filter(|&total| total <= self.max_voxels && usize::try_from(total).is_ok())
            .ok_or_else(too_large)?;
        Ok(counts)
    }

    /// Per-axis minimum and maximum of all corners, expressed in the output
    /// direction frame.
    fn bounds(&self, slices: &[Slice], slice_to_location: &[DMat4]) -> Result<(DVec3, DVec3)> {
        let to_grid_frame = self.direction.transpose();
        let mut min = DVec3::splat(f64::INFINITY);
        let mut max = DVec3::splat(f64::NEG_INFINITY);
        let mut valid = 0usize;

        for (index, (slice, matrix)) in slices.iter().zip(slice_to_location).enumerate() {
            let (height, width) = slice.dim();
            if height == 0 || width == 0 {
                warn!(slice = index, "skipping empty slice while computing extent");
                continue;
            }
            for corner in slice.corner_indices() {
                let location = to_grid_frame * matrix.transform_point3(corner);
                min = min.min(location);
                max = max.max(location);
            }
            valid += 1;
        }

        if valid == 0 {
            return Err(ReconstructionError::invalid_state(
                "no non-empty slice to derive the output extent from",
            ));
        }
        Ok((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{RigidTransform, TransformComposer};
    use ndarray::Array2;

    fn slice_matrices(slices: &[Slice], shared: &RigidTransform) -> Vec<DMat4> {
        let transforms = vec![RigidTransform::IDENTITY; slices.len()];
        TransformComposer::new(shared)
            .transformed_slice_index_to_location(slices, &transforms)
            .expect("regular geometry")
    }

    #[test]
    fn parallel_slices_produce_tight_grid() {
        let slices: Vec<_> = (0..3)
            .map(|i| Slice::axis_aligned(Array2::zeros((64, 64)), DVec3::new(0.0, 0.0, 4.0 * i as f64)))
            .collect();
        let matrices = slice_matrices(&slices, &RigidTransform::IDENTITY);
        let volume = ExtentCalculator::new(1.0, None).compute(&slices, &matrices).unwrap();

        assert_eq!(volume.dim(), (9, 64, 64));
        assert_eq!(volume.origin, DVec3::ZERO);
        assert!(volume.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn corners_lie_within_one_voxel_of_bounds() {
        let rotation = DMat3::from_rotation_y(0.3) * DMat3::from_rotation_x(-0.7);
        let slices: Vec<_> = (0..4)
            .map(|i| {
                Slice::new(
                    Array2::zeros((20, 30)),
                    DVec3::new(i as f64 * 1.3, -2.0, 0.5 * i as f64),
                    (0.3, 0.4),
                    rotation,
                )
            })
            .collect();
        let shared = RigidTransform::new(DMat3::from_rotation_z(0.4), DVec3::new(5.0, -1.0, 2.0));
        let matrices = slice_matrices(&slices, &shared);
        let spacing = 0.7;
        let volume = ExtentCalculator::new(spacing, None).compute(&slices, &matrices).unwrap();
        let (grid_min, grid_max) = volume.world_bounds();

        let mut true_min = DVec3::splat(f64::INFINITY);
        let mut true_max = DVec3::splat(f64::NEG_INFINITY);
        for (slice, matrix) in slices.iter().zip(&matrices) {
            for corner in slice.corner_indices() {
                let location = matrix.transform_point3(corner);
                assert!(location.cmpge(grid_min - 1e-6).all());
                assert!(location.cmple(grid_max + 1e-6).all());
                true_min = true_min.min(location);
                true_max = true_max.max(location);
            }
        }
        assert!(((grid_max - grid_min) - (true_max - true_min)).max_element() <= spacing);
    }

    #[test]
    fn single_slice_grid_is_one_voxel_thick() {
        let slices = vec![Slice::axis_aligned(Array2::zeros((5, 7)), DVec3::new(1.0, 1.0, 1.0))];
        let matrices = slice_matrices(&slices, &RigidTransform::IDENTITY);
        let volume = ExtentCalculator::new(1.0, None).compute(&slices, &matrices).unwrap();
        assert_eq!(volume.dim(), (1, 5, 7));
    }

    #[test]
    fn rotated_output_direction_aligns_grid() {
        let direction = DMat3::from_rotation_z(std::f64::consts::FRAC_PI_2);
        let slice = Slice::new(
            Array2::zeros((4, 10)),
            DVec3::ZERO,
            (1.0, 1.0),
            direction,
        );
        let matrices = slice_matrices(std::slice::from_ref(&slice), &RigidTransform::IDENTITY);
        let volume = ExtentCalculator::new(1.0, Some(direction))
            .compute(std::slice::from_ref(&slice), &matrices)
            .unwrap();
        assert_eq!(volume.dim(), (1, 4, 10));
    }

    #[test]
    fn oversized_grid_is_rejected_before_allocation() {
        let slices: Vec<_> = (0..2)
            .map(|i| Slice::axis_aligned(Array2::zeros((64, 64)), DVec3::new(0.0, 0.0, 4.0 * i as f64)))
            .collect();
        let matrices = slice_matrices(&slices, &RigidTransform::IDENTITY);

        let result = ExtentCalculator::new(1e-7, None).compute(&slices, &matrices);
        assert!(matches!(result, Err(ReconstructionError::InvalidState(_))));

        let limited = ExtentCalculator::new(1.0, None)
            .with_max_voxels(64 * 64 * 5 - 1)
            .compute(&slices, &matrices);
        assert!(matches!(limited, Err(ReconstructionError::InvalidState(_))));

        let exact = ExtentCalculator::new(1.0, None)
            .with_max_voxels(64 * 64 * 5)
            .compute(&slices, &matrices)
            .unwrap();
        assert_eq!(exact.dim(), (5, 64, 64));
    }

    #[test]
    fn empty_slices_are_skipped() {
        let slices = vec![
            Slice::axis_aligned(Array2::zeros((3, 4)), DVec3::ZERO),
            Slice::axis_aligned(Array2::zeros((0, 0)), DVec3::new(100.0, 100.0, 100.0)),
            Slice::axis_aligned(Array2::zeros((3, 4)), DVec3::new(0.0, 0.0, 2.0)),
        ];
        let matrices: Vec<_> = slices.iter().map(Slice::index_to_location).collect();
        let volume = ExtentCalculator::new(1.0, None).compute(&slices, &matrices).unwrap();
        assert_eq!(volume.dim(), (3, 3, 4));
    }

    #[test]
    fn only_empty_slices_are_rejected() {
        let slices = vec![Slice::axis_aligned(Array2::zeros((0, 4)), DVec3::ZERO)];
        let matrices = vec![DMat4::IDENTITY];
        let result = ExtentCalculator::new(1.0, None).compute(&slices, &matrices);
        assert!(matches!(result, Err(ReconstructionError::InvalidState(_))));
    }
}
