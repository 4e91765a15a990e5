//! Scatter-accumulation kernel math shared by the compute backends.
//!
//! The WGSL shader in `shaders/scatter_accumulate.wgsl` mirrors
//! [`accumulate_voxel`]; the CPU backend calls it directly.

use bytemuck::{Pod, Zeroable};
use ndarray::ArrayView3;

use crate::slice::ValidityMask;
use crate::transform::PackedMatrix;

/// Per-voxel `(weight, weight × intensity)` running sum.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Accumulation {
    pub weight: f32,
    pub weighted_value: f32,
}

impl Accumulation {
    #[inline]
    pub fn add(&mut self, other: Accumulation) {
        self.weight += other.weight;
        self.weighted_value += other.weighted_value;
    }

    /// Weighted mean, or exactly zero when nothing contributed.
    #[inline]
    pub fn normalized(&self) -> f32 {
        if self.weight > 0.0 {
            self.weighted_value / self.weight
        } else {
            0.0
        }
    }
}

/// Scalars shared by every dispatch of one reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelParameters {
    /// Output voxels along x, y and z.
    pub grid: [u32; 3],
    /// Neighbourhood half-width, in pixels.
    pub search_radius: u32,
    pub kernel_std_dev: f32,
}

impl KernelParameters {
    /// Out-of-plane distance, in pixels, beyond which a slice is ignored.
    #[inline]
    pub fn reach(&self) -> f32 {
        self.search_radius as f32 + 0.5
    }

    #[inline]
    pub fn splat_weight(&self, distance_squared: f32) -> f32 {
        let sigma = self.kernel_std_dev;
        (-distance_squared / (2.0 * sigma * sigma)).exp()
    }
}

/// Sums the contributions of every slice in a batch to voxel `(i, j, k)`.
///
/// `pixels` is the batch image `(depth, height, width)` and
/// `volume_index_to_slice_index` holds one matrix per batch slice.
pub fn accumulate_voxel(
    voxel: [u32; 3],
    pixels: &ArrayView3<'_, f32>,
    volume_index_to_slice_index: &[PackedMatrix],
    mask: &ValidityMask,
    params: &KernelParameters,
) -> Accumulation {
    let (_, height, width) = pixels.dim();
    let radius = params.search_radius as i64;
    let reach = params.reach();
    let position = [voxel[0] as f32, voxel[1] as f32, voxel[2] as f32];
    let mut total = Accumulation::default();

    for (slice, matrix) in volume_index_to_slice_index.iter().enumerate() {
        let [u, v, w] = matrix.transform_point(position);
        if w.is_nan() || w.abs() > reach {
            continue;
        }
        let nearest_u = (u + 0.5).floor() as i64;
        let nearest_v = (v + 0.5).floor() as i64;

        for dv in -radius..=radius {
            let pv = nearest_v + dv;
            if pv < 0 || pv >= height as i64 {
                continue;
            }
            for du in -radius..=radius {
                let pu = nearest_u + du;
                if pu < 0 || pu >= width as i64 {
                    continue;
                }
                if !mask.is_valid(pu as usize, pv as usize) {
                    continue;
                }
                let dx = pu as f32 - u;
                let dy = pv as f32 - v;
                let weight = params.splat_weight(dx * dx + dy * dy + w * w);
                let intensity = pixels[[slice, pv as usize, pu as usize]];
                total.add(Accumulation {
                    weight,
                    weighted_value: weight * intensity,
                });
            }
        }
    }
    total
}
