use ndarray::{ArrayView3, Zip};

use crate::error::{ReconstructionError, Result};
use crate::kernel::Accumulation;
use crate::volume::OutputVolume;

/// Writes `weighted_value / weight` into every voxel of `volume`, or zero
/// where no slice contributed.
///
/// `accumulation` is the read-back buffer in x-fastest order.
pub fn normalize_into(accumulation: &[Accumulation], volume: &mut OutputVolume) -> Result<()> {
    let accumulation = ArrayView3::from_shape(volume.dim(), accumulation).map_err(|e| {
        ReconstructionError::invalid_state(format!(
            "accumulation buffer does not match the output grid {:?}: {e}",
            volume.dim()
        ))
    })?;

    Zip::from(volume.data_mut())
        .and(&accumulation)
        .par_for_each(|voxel, acc| *voxel = acc.normalized());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{DMat3, DVec3};

    #[test]
    fn empty_voxels_become_zero() {
        let mut volume = OutputVolume::zeros((1, 1, 3), DVec3::ZERO, 1.0, DMat3::IDENTITY);
        volume.data_mut().fill(f32::NAN);
        let accumulation = [
            Accumulation {
                weight: 0.5,
                weighted_value: 2.0,
            },
            Accumulation::default(),
            Accumulation {
                weight: 4.0,
                weighted_value: 4.0,
            },
        ];
        normalize_into(&accumulation, &mut volume).unwrap();
        assert_eq!(volume.data().as_slice().unwrap(), &[4.0, 0.0, 1.0]);
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let mut volume = OutputVolume::zeros((1, 2, 2), DVec3::ZERO, 1.0, DMat3::IDENTITY);
        let result = normalize_into(&[Accumulation::default(); 3], &mut volume);
        assert!(matches!(result, Err(ReconstructionError::InvalidState(_))));
    }
}
