use bytemuck::{Pod, Zeroable};
use glam::{DMat3, DMat4, DVec3};
use serde::{Deserialize, Serialize};

use crate::error::{ReconstructionError, Result};
use crate::slice::Slice;
use crate::volume::OutputVolume;

/// Threshold on the determinant of the linear block divided by the product of
/// its column norms, which is independent of the length unit.
const SINGULAR_NORMALIZED_DETERMINANT: f64 = 1e-9;

/// Rotation followed by a translation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    pub rotation: DMat3,
    pub offset: DVec3,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl RigidTransform {
    pub const IDENTITY: Self = Self {
        rotation: DMat3::IDENTITY,
        offset: DVec3::ZERO,
    };

    pub fn new(rotation: DMat3, offset: DVec3) -> Self {
        Self { rotation, offset }
    }

    pub fn from_translation(offset: DVec3) -> Self {
        Self::new(DMat3::IDENTITY, offset)
    }

    pub fn to_matrix(&self) -> DMat4 {
        DMat4::from_mat3_translation(self.rotation, self.offset)
    }
}

/// Upper 3x4 block of a homogeneous transform, row-major, with the
/// translation in the fourth column. The bottom row is always `[0, 0, 0, 1]`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PackedMatrix(pub [f32; 12]);

impl PackedMatrix {
    pub const FLOATS: usize = 12;

    pub fn from_mat4(matrix: &DMat4) -> Self {
        let mut packed = [0.0f32; 12];
        for row in 0..3 {
            let values = matrix.row(row).to_array();
            for (column, value) in values.iter().enumerate() {
                packed[row * 4 + column] = *value as f32;
            }
        }
        Self(packed)
    }

    #[inline]
    pub fn transform_point(&self, point: [f32; 3]) -> [f32; 3] {
        let m = &self.0;
        let [x, y, z] = point;
        [
            m[0] * x + m[1] * y + m[2] * z + m[3],
            m[4] * x + m[5] * y + m[6] * z + m[7],
            m[8] * x + m[9] * y + m[10] * z + m[11],
        ]
    }
}

/// Matrices consumed by the scatter kernel, all expressed in transformed
/// location space.
#[derive(Debug, Clone)]
pub struct TransformSet {
    pub volume_index_to_location: PackedMatrix,
    pub slice_index_to_location: Vec<PackedMatrix>,
    pub volume_index_to_slice_index: Vec<PackedMatrix>,
}

impl TransformSet {
    pub fn len(&self) -> usize {
        self.volume_index_to_slice_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volume_index_to_slice_index.is_empty()
    }

    /// `[volume_index_to_location, slice_index_to_location[range],
    /// volume_index_to_slice_index[range]]` for one dispatch.
    pub fn pack_range(&self, range: std::ops::Range<usize>) -> Vec<PackedMatrix> {
        let mut packed = Vec::with_capacity(1 + 2 * range.len());
        packed.push(self.volume_index_to_location);
        packed.extend_from_slice(&self.slice_index_to_location[range.clone()]);
        packed.extend_from_slice(&self.volume_index_to_slice_index[range]);
        packed
    }
}

pub struct TransformComposer {
    location_to_transformed_location: DMat4,
}

impl TransformComposer {
    pub fn new(shared_transform: &RigidTransform) -> Self {
        Self {
            location_to_transformed_location: shared_transform.to_matrix(),
        }
    }

    /// `locationToTransformedLocation · sliceTransform · sliceIndexToLocation`
    /// for every slice.
    ///
    /// # Errors
    ///
    /// Returns [`ReconstructionError::SingularTransform`] for the first slice
    /// whose composed matrix cannot be inverted.
    pub fn transformed_slice_index_to_location(
        &self,
        slices: &[Slice],
        transforms: &[RigidTransform],
    ) -> Result<Vec<DMat4>> {
        slices
            .iter()
            .zip(transforms)
            .enumerate()
            .map(|(slice_index, (slice, transform))| {
                let matrix = self.location_to_transformed_location
                    * transform.to_matrix()
                    * slice.index_to_location();
                if is_singular(&matrix) {
                    return Err(ReconstructionError::SingularTransform { slice_index });
                }
                Ok(matrix)
            })
            .collect()
    }

    /// Builds the packed transform set for `volume` from the per-slice
    /// matrices returned by [`Self::transformed_slice_index_to_location`].
    pub fn compose(&self, volume: &OutputVolume, slice_to_location: &[DMat4]) -> TransformSet {
        let volume_index_to_location = volume.index_to_location();
        let (slice_index_to_location, volume_index_to_slice_index) = slice_to_location
            .iter()
            .map(|matrix| {
                (
                    PackedMatrix::from_mat4(matrix),
                    PackedMatrix::from_mat4(&(matrix.inverse() * volume_index_to_location)),
                )
            })
            .unzip();

        TransformSet {
            volume_index_to_location: PackedMatrix::from_mat4(&volume_index_to_location),
            slice_index_to_location,
            volume_index_to_slice_index,
        }
    }
}

/// Whether the affine `matrix` collapses space onto a plane or line.
fn is_singular(matrix: &DMat4) -> bool {
    let column_norms = matrix.x_axis.truncate().length()
        * matrix.y_axis.truncate().length()
        * matrix.z_axis.truncate().length();
    if !column_norms.is_finite() || column_norms == 0.0 {
        return true;
    }
    let normalized = matrix.determinant() / column_norms;
    !normalized.is_finite() || normalized.abs() < SINGULAR_NORMALIZED_DETERMINANT
}
