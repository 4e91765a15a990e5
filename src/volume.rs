use crate::enums::Orientation;
use crate::error::{ReconstructionError, Result};

use glam::{DMat3, DMat4, DVec3};
use image::ImageBuffer;
use image::Luma;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;

/// Reconstructed scalar grid. Data is indexed `(z, y, x)`; voxel `(i, j, k)`
/// in volume-index space is `data[[k, j, i]]`.
#[derive(Debug, Clone)]
pub struct OutputVolume {
    pub data: Array3<f32>,
    pub origin: DVec3,
    pub spacing: f64,
    pub direction: DMat3,
}

impl OutputVolume {
    pub fn new(data: Array3<f32>, origin: DVec3, spacing: f64, direction: DMat3) -> Self {
        Self {
            data,
            origin,
            spacing,
            direction,
        }
    }

    /// Zero-filled volume with `(depth, height, width)` voxels.
    pub fn zeros(dim: (usize, usize, usize), origin: DVec3, spacing: f64, direction: DMat3) -> Self {
        Self::new(Array3::zeros(dim), origin, spacing, direction)
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Number of voxels along the x, y and z index axes.
    ///
    /// # Errors
    ///
    /// [`ReconstructionError::InvalidState`] when an axis does not fit a `u32`
    /// kernel grid.
    pub fn extent(&self) -> Result<[u32; 3]> {
        let (depth, height, width) = self.dim();
        let axis = |count: usize| {
            u32::try_from(count).map_err(|_| {
                ReconstructionError::invalid_state(format!(
                    "volume of {:?} voxels exceeds the kernel grid range",
                    self.dim()
                ))
            })
        };
        Ok([axis(width)?, axis(height)?, axis(depth)?])
    }

    pub fn voxel_count(&self) -> usize {
        self.data.len()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    /// `direction · diag(spacing)` with the origin as translation.
    pub fn index_to_location(&self) -> DMat4 {
        DMat4::from_mat3_translation(self.direction * self.spacing, self.origin)
    }

    pub fn location_of(&self, i: usize, j: usize, k: usize) -> DVec3 {
        self.index_to_location()
            .transform_point3(DVec3::new(i as f64, j as f64, k as f64))
    }

    /// Nearest voxel `(z, y, x)` to `location`, if it lies inside the grid.
    pub fn voxel_at(&self, location: DVec3) -> Option<(usize, usize, usize)> {
        let index = self.index_to_location().inverse().transform_point3(location).round();
        let (depth, height, width) = self.dim();
        let inside = index.min_element() >= 0.0
            && (index.x as usize) < width
            && (index.y as usize) < height
            && (index.z as usize) < depth;
        inside.then(|| (index.z as usize, index.y as usize, index.x as usize))
    }

    pub fn value_at(&self, location: DVec3) -> Option<f32> {
        self.voxel_at(location).map(|index| self.data[index])
    }

    /// Axis-aligned bounds spanned by the voxel centres in location space.
    pub fn world_bounds(&self) -> (DVec3, DVec3) {
        let (depth, height, width) = self.dim();
        let last = DVec3::new(
            width.saturating_sub(1) as f64,
            height.saturating_sub(1) as f64,
            depth.saturating_sub(1) as f64,
        );
        let matrix = self.index_to_location();
        let mut min = DVec3::splat(f64::INFINITY);
        let mut max = DVec3::splat(f64::NEG_INFINITY);
        for corner in 0..8 {
            let index = DVec3::new(
                if corner & 1 == 0 { 0.0 } else { last.x },
                if corner & 2 == 0 { 0.0 } else { last.y },
                if corner & 4 == 0 { 0.0 } else { last.z },
            );
            let location = matrix.transform_point3(index);
            min = min.min(location);
            max = max.max(location);
        }
        (min, max)
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice_result = match orientation {
            Orientation::Axial => self.data().slice(s![index, .., ..]),
            Orientation::Coronal => self.data().slice(s![.., index, ..]),
            Orientation::Sagittal => self.data().slice(s![.., .., index]),
        };
        Some(slice_result)
    }

    /// Renders an axis slice as an 8-bit image, stretching the volume's value
    /// range to `0..=255`.
    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.get_slice_from_axis(index, &orientation)?;
        let (min, max) = self.value_range();
        Self::slice_to_image(&slice, min, max)
    }

    fn value_range(&self) -> (f32, f32) {
        self.data
            .par_iter()
            .fold(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |(min, max), &v| (min.min(v), max.max(v)),
            )
            .reduce(
                || (f32::INFINITY, f32::NEG_INFINITY),
                |a, b| (a.0.min(b.0), a.1.max(b.1)),
            )
    }

    #[inline]
    fn normalize_to_u8(value: f32, min: f32, range: f32) -> u8 {
        if range <= 0.0 {
            return 0;
        }
        (((value - min) / range) * 255.0).clamp(0.0, 255.0) as u8
    }

    /// Converts a 2D slice to an 8-bit image, mapping `min..=max` to `0..=255`.
    pub fn slice_to_image(
        slice: &ArrayView2<'_, f32>,
        min: f32,
        max: f32,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (height, width) = slice.dim();
        let range = max - min;
        let pixel_data: Vec<u8> = slice
            .into_par_iter()
            .map(|&v| Self::normalize_to_u8(v, min, range))
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        let dim = self.data.dim();
        let max_index = match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        };
        index < max_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> OutputVolume {
        let data = Array3::from_shape_fn((2, 3, 4), |(z, y, x)| (z * 12 + y * 4 + x) as f32);
        OutputVolume::new(data, DVec3::new(1.0, 2.0, 3.0), 0.5, DMat3::IDENTITY)
    }

    #[test]
    fn extent_is_reported_x_first() {
        assert_eq!(ramp().extent().unwrap(), [4, 3, 2]);
    }

    #[test]
    fn world_bounds_span_voxel_centres() {
        let (min, max) = ramp().world_bounds();
        assert_eq!(min, DVec3::new(1.0, 2.0, 3.0));
        assert_eq!(max, DVec3::new(2.5, 3.0, 3.5));
    }

    #[test]
    fn value_at_finds_nearest_voxel() {
        let volume = ramp();
        assert_eq!(volume.value_at(DVec3::new(2.0, 2.5, 3.5)), Some(12.0 + 4.0 + 2.0));
        assert_eq!(volume.value_at(DVec3::new(0.0, 2.0, 3.0)), None);
    }

    #[test]
    fn axis_slices_have_expected_shape() {
        let volume = ramp();
        assert_eq!(volume.get_slice_from_axis(1, &Orientation::Axial).unwrap().dim(), (3, 4));
        assert_eq!(volume.get_slice_from_axis(0, &Orientation::Coronal).unwrap().dim(), (2, 4));
        assert_eq!(volume.get_slice_from_axis(3, &Orientation::Sagittal).unwrap().dim(), (2, 3));
        assert!(volume.get_slice_from_axis(2, &Orientation::Axial).is_none());
    }

    #[test]
    fn image_stretches_value_range() {
        let image = ramp().get_image_from_axis(1, Orientation::Axial).unwrap();
        assert_eq!(image.dimensions(), (4, 3));
        assert_eq!(image.get_pixel(3, 2).0[0], 255);
        assert_eq!(image.get_pixel(0, 0).0[0], ((12.0 / 23.0) * 255.0) as u8);
    }
}
