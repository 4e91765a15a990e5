use std::ops::Range;

use ndarray::{Array3, s};

use crate::slice::Slice;
use crate::transform::{PackedMatrix, TransformSet};

/// Number of slices uploaded per dispatch unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 8;

/// A contiguous group of slices packed for a single kernel dispatch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub range: Range<usize>,
    /// Slice pixels stacked as `(depth, height, width)`.
    pub pixels: Array3<f32>,
    /// `[volume_index_to_location, slice_index_to_location × n,
    /// volume_index_to_slice_index × n]`.
    pub matrices: Vec<PackedMatrix>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Position of the first slice of this batch in the whole acquisition.
    pub fn slice_offset(&self) -> usize {
        self.range.start
    }

    pub fn volume_index_to_location(&self) -> &PackedMatrix {
        &self.matrices[0]
    }

    pub fn slice_index_to_location(&self, slice: usize) -> &PackedMatrix {
        &self.matrices[1 + slice]
    }

    pub fn volume_index_to_slice_index(&self, slice: usize) -> &PackedMatrix {
        &self.matrices[1 + self.len() + slice]
    }

    /// `(width, height)` of every slice in the batch.
    pub fn slice_extent(&self) -> (u32, u32) {
        let (_, height, width) = self.pixels.dim();
        (width as u32, height as u32)
    }
}

/// Splits an acquisition into fixed-size, contiguous batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    batch_size: usize,
}

impl Default for BatchScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl BatchScheduler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batch_count(&self, slice_count: usize) -> usize {
        slice_count.div_ceil(self.batch_size)
    }

    pub fn ranges(&self, slice_count: usize) -> impl Iterator<Item = Range<usize>> + use<> {
        let batch_size = self.batch_size;
        (0..slice_count)
            .step_by(batch_size)
            .map(move |start| start..(start + batch_size).min(slice_count))
    }

    /// Lazily packs each batch so only one batch's host copy is alive at a time.
    pub fn batches<'a>(
        &self,
        slices: &'a [Slice],
        transforms: &'a TransformSet,
    ) -> impl Iterator<Item = Batch> + 'a {
        self.ranges(slices.len()).map(move |range| Batch {
            pixels: Self::pack_pixels(&slices[range.clone()]),
            matrices: transforms.pack_range(range.clone()),
            range,
        })
    }

    fn pack_pixels(slices: &[Slice]) -> Array3<f32> {
        let (height, width) = slices[0].dim();
        let depth = slices.len();
        let mut pixels = Array3::<f32>::zeros((depth, height, width));

        for (i, slice) in slices.iter().enumerate() {
            pixels.slice_mut(s![i, .., ..]).assign(&slice.pixels);
        }

        pixels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{DMat4, DVec3};
    use ndarray::Array2;

    fn acquisition(count: usize) -> (Vec<Slice>, TransformSet) {
        let slices: Vec<_> = (0..count)
            .map(|i| {
                Slice::axis_aligned(Array2::from_elem((2, 3), i as f32), DVec3::new(0.0, 0.0, i as f64))
            })
            .collect();
        let matrices: Vec<_> = (0..count)
            .map(|i| PackedMatrix::from_mat4(&DMat4::from_translation(DVec3::splat(i as f64))))
            .collect();
        let transforms = TransformSet {
            volume_index_to_location: PackedMatrix::from_mat4(&DMat4::IDENTITY),
            slice_index_to_location: matrices.clone(),
            volume_index_to_slice_index: matrices,
        };
        (slices, transforms)
    }

    #[test]
    fn ranges_cover_every_slice_once() {
        let scheduler = BatchScheduler::new(8);
        let ranges: Vec<_> = scheduler.ranges(19).collect();
        assert_eq!(ranges, vec![0..8, 8..16, 16..19]);
        assert_eq!(scheduler.batch_count(19), 3);
        assert_eq!(scheduler.batch_count(16), 2);
    }

    #[test]
    fn zero_batch_size_falls_back_to_one() {
        let scheduler = BatchScheduler::new(0);
        assert_eq!(scheduler.batch_size(), 1);
        assert_eq!(scheduler.ranges(3).count(), 3);
    }

    #[test]
    fn batches_pack_pixels_and_matrices() {
        let (slices, transforms) = acquisition(5);
        let batches: Vec<_> = BatchScheduler::new(2).batches(&slices, &transforms).collect();
        assert_eq!(batches.len(), 3);

        let last = &batches[2];
        assert_eq!(last.slice_offset(), 4);
        assert_eq!(last.len(), 1);
        assert_eq!(last.pixels.dim(), (1, 2, 3));
        assert!(last.pixels.iter().all(|&v| v == 4.0));
        assert_eq!(last.matrices.len(), 3);
        assert_eq!(last.volume_index_to_slice_index(0).0[3], 4.0);

        let middle = &batches[1];
        assert_eq!(middle.pixels[[1, 0, 0]], 3.0);
        assert_eq!(middle.slice_index_to_location(1).0[7], 3.0);
        assert_eq!(middle.slice_extent(), (3, 2));
    }
}
