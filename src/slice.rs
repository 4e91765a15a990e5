use glam::{DMat3, DMat4, DVec3};
use ndarray::{Array2, ArrayView2};

use crate::error::{ReconstructionError, Result};

/// A tracked 2D ultrasound frame.
///
/// Pixels are stored as `(height, width)`; pixel `(u, v)` lives at
/// `pixels[[v, u]]`. The direction columns are the row axis (increasing `u`),
/// the column axis (increasing `v`) and the slice normal.
#[derive(Debug, Clone)]
pub struct Slice {
    pub pixels: Array2<f32>,
    pub origin: DVec3,
    pub spacing: (f64, f64),
    pub direction: DMat3,
}

impl Slice {
    pub fn new(pixels: Array2<f32>, origin: DVec3, spacing: (f64, f64), direction: DMat3) -> Self {
        Self {
            pixels,
            origin,
            spacing,
            direction,
        }
    }

    /// Slice with unit spacing and axes aligned to the location axes.
    pub fn axis_aligned(pixels: Array2<f32>, origin: DVec3) -> Self {
        Self::new(pixels, origin, (1.0, 1.0), DMat3::IDENTITY)
    }

    /// Get the dimensions of the slice (height, width)
    pub fn dim(&self) -> (usize, usize) {
        self.pixels.dim()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Maps `(u, v, w, 1)` slice-index coordinates to location space.
    ///
    /// The out-of-plane axis uses the smaller in-plane spacing as its unit so
    /// that distances along the normal are measured in pixels.
    pub fn index_to_location(&self) -> DMat4 {
        let (spacing_u, spacing_v) = self.spacing;
        let spacing_w = spacing_u.min(spacing_v);
        DMat4::from_cols(
            (self.direction.x_axis * spacing_u).extend(0.0),
            (self.direction.y_axis * spacing_v).extend(0.0),
            (self.direction.z_axis * spacing_w).extend(0.0),
            self.origin.extend(1.0),
        )
    }

    /// The four pixel-extent corners in slice-index space.
    pub fn corner_indices(&self) -> [DVec3; 4] {
        let (height, width) = self.dim();
        let max_u = width.saturating_sub(1) as f64;
        let max_v = height.saturating_sub(1) as f64;
        [
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(max_u, 0.0, 0.0),
            DVec3::new(0.0, max_v, 0.0),
            DVec3::new(max_u, max_v, 0.0),
        ]
    }
}

/// Binary mask shared by every slice of an acquisition; non-zero pixels may
/// contribute to the reconstruction.
#[derive(Debug, Clone)]
pub struct ValidityMask {
    data: Array2<u8>,
}

impl ValidityMask {
    pub fn new(data: Array2<u8>) -> Self {
        Self { data }
    }

    /// Mask marking every pixel of a `(height, width)` frame as valid.
    pub fn all_valid(height: usize, width: usize) -> Self {
        Self::new(Array2::from_elem((height, width), 1))
    }

    pub fn from_fn(height: usize, width: usize, f: impl Fn(usize, usize) -> bool) -> Self {
        Self::new(Array2::from_shape_fn((height, width), |(v, u)| {
            u8::from(f(u, v))
        }))
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn view(&self) -> ArrayView2<'_, u8> {
        self.data.view()
    }

    #[inline]
    pub fn is_valid(&self, u: usize, v: usize) -> bool {
        self.data[[v, u]] != 0
    }

    /// Contiguous row-major mask bytes.
    pub fn as_standard_bytes(&self) -> std::borrow::Cow<'_, [u8]> {
        match self.data.as_slice() {
            Some(bytes) => std::borrow::Cow::Borrowed(bytes),
            None => std::borrow::Cow::Owned(self.data.iter().copied().collect()),
        }
    }
}

/// Checks the inputs of a reconstruction call before anything is allocated
/// and returns the mask they were validated against.
pub(crate) fn validate_inputs<'m>(
    slices: &[Slice],
    transform_count: usize,
    mask: Option<&'m ValidityMask>,
) -> Result<&'m ValidityMask> {
    if slices.is_empty() {
        return Err(ReconstructionError::invalid_state(
            "at least one slice is required",
        ));
    }
    if slices.len() != transform_count {
        return Err(ReconstructionError::invalid_state(format!(
            "{} slices were supplied with {} transforms",
            slices.len(),
            transform_count
        )));
    }
    let mask = mask.ok_or_else(|| ReconstructionError::invalid_state("validity mask is not set"))?;
    let mask_dim = mask.dim();
    if mask_dim.0 == 0 || mask_dim.1 == 0 {
        return Err(ReconstructionError::invalid_state("validity mask is empty"));
    }

    for (index, slice) in slices.iter().enumerate() {
        if slice.is_empty() {
            return Err(ReconstructionError::invalid_state(format!(
                "slice {index} has no pixel data"
            )));
        }
        if slice.dim() != mask_dim {
            return Err(ReconstructionError::invalid_state(format!(
                "slice {index} has dimensions {:?} but the mask has {:?}",
                slice.dim(),
                mask_dim
            )));
        }
        let (spacing_u, spacing_v) = slice.spacing;
        if !(spacing_u.is_finite() && spacing_v.is_finite() && spacing_u > 0.0 && spacing_v > 0.0)
        {
            return Err(ReconstructionError::invalid_state(format!(
                "slice {index} has invalid pixel spacing {:?}",
                slice.spacing
            )));
        }
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(height: usize, width: usize) -> Slice {
        Slice::axis_aligned(Array2::zeros((height, width)), DVec3::ZERO)
    }

    #[test]
    fn index_to_location_scales_axes() {
        let s = Slice::new(
            Array2::zeros((4, 4)),
            DVec3::new(1.0, 2.0, 3.0),
            (0.5, 0.25),
            DMat3::IDENTITY,
        );
        let location = s.index_to_location().transform_point3(DVec3::new(2.0, 4.0, 1.0));
        assert_eq!(location, DVec3::new(2.0, 3.0, 3.25));
    }

    #[test]
    fn corners_cover_pixel_extent() {
        let corners = slice(3, 5).corner_indices();
        assert_eq!(corners[3], DVec3::new(4.0, 2.0, 0.0));
    }

    #[test]
    fn rejects_zero_slices() {
        let mask = ValidityMask::all_valid(2, 2);
        let result = validate_inputs(&[], 0, Some(&mask));
        assert!(matches!(result, Err(ReconstructionError::InvalidState(_))));
    }

    #[test]
    fn rejects_missing_mask() {
        let result = validate_inputs(&[slice(2, 2)], 1, None);
        assert!(matches!(result, Err(ReconstructionError::InvalidState(_))));
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let mask = ValidityMask::all_valid(2, 2);
        let result = validate_inputs(&[slice(2, 2), slice(2, 3)], 2, Some(&mask));
        assert!(matches!(result, Err(ReconstructionError::InvalidState(_))));
    }

    #[test]
    fn rejects_transform_count_mismatch() {
        let mask = ValidityMask::all_valid(2, 2);
        let result = validate_inputs(&[slice(2, 2)], 2, Some(&mask));
        assert!(matches!(result, Err(ReconstructionError::InvalidState(_))));
    }

    #[test]
    fn mask_from_fn_uses_pixel_coordinates() {
        let mask = ValidityMask::from_fn(2, 3, |u, v| u == 2 && v == 0);
        assert!(mask.is_valid(2, 0));
        assert!(!mask.is_valid(0, 1));
        assert_eq!(mask.as_standard_bytes().as_ref(), &[0, 0, 1, 0, 0, 0]);
    }
}
