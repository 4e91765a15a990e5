use ndarray::{Array3, Zip};

use super::ComputeBackend;
use crate::batch::Batch;
use crate::error::Result;
use crate::kernel::{Accumulation, KernelParameters, accumulate_voxel};
use crate::slice::ValidityMask;

/// Runs the kernel on the host with rayon, one task per voxel.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

pub struct CpuAccumulator {
    /// Indexed `(z, y, x)`.
    buffer: Array3<Accumulation>,
    mask: ValidityMask,
}

impl ComputeBackend for CpuBackend {
    type Accumulator = CpuAccumulator;

    fn name(&self) -> &'static str {
        "cpu"
    }

    fn begin(&self, params: &KernelParameters, mask: &ValidityMask) -> Result<CpuAccumulator> {
        let [width, height, depth] = params.grid;
        Ok(CpuAccumulator {
            buffer: Array3::default((depth as usize, height as usize, width as usize)),
            mask: mask.clone(),
        })
    }

    fn dispatch(
        &self,
        accumulator: &mut CpuAccumulator,
        batch: &Batch,
        params: &KernelParameters,
    ) -> Result<()> {
        let pixels = batch.pixels.view();
        let matrices = &batch.matrices[1 + batch.len()..];
        let mask = &accumulator.mask;

        Zip::indexed(&mut accumulator.buffer).par_for_each(|(k, j, i), acc| {
            acc.add(accumulate_voxel(
                [i as u32, j as u32, k as u32],
                &pixels,
                matrices,
                mask,
                params,
            ));
        });
        Ok(())
    }

    fn read_back(&self, accumulator: CpuAccumulator) -> Result<Vec<Accumulation>> {
        Ok(accumulator.buffer.into_raw_vec_and_offset().0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::PackedMatrix;
    use glam::DMat4;
    use ndarray::Array3;

    #[test]
    fn dispatch_accumulates_across_batches() {
        let identity = PackedMatrix::from_mat4(&DMat4::IDENTITY);
        let params = KernelParameters {
            grid: [2, 2, 1],
            search_radius: 0,
            kernel_std_dev: 0.5,
        };
        let mask = ValidityMask::all_valid(2, 2);
        let batch = Batch {
            range: 0..1,
            pixels: Array3::from_elem((1, 2, 2), 3.0),
            matrices: vec![identity, identity, identity],
        };

        let backend = CpuBackend;
        let mut accumulator = backend.begin(&params, &mask).unwrap();
        backend.dispatch(&mut accumulator, &batch, &params).unwrap();
        backend.dispatch(&mut accumulator, &batch, &params).unwrap();
        let result = backend.read_back(accumulator).unwrap();

        assert_eq!(result.len(), 4);
        assert!(result.iter().all(|acc| acc.weight == 2.0 && acc.weighted_value == 6.0));
    }
}
