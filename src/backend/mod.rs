//! Compute backends executing the scatter-accumulation kernel.

mod cpu;
mod gpu;

pub use cpu::{CpuAccumulator, CpuBackend};
pub use gpu::{GpuAccumulator, GpuBackend, GpuContext};

use crate::batch::Batch;
use crate::error::Result;
use crate::kernel::{Accumulation, KernelParameters};
use crate::slice::ValidityMask;

/// Device-side driver for one reconstruction call.
///
/// A reconstruction calls [`begin`](Self::begin) once, then
/// [`dispatch`](Self::dispatch) for every batch, then
/// [`read_back`](Self::read_back) once. The accumulator owns every resource
/// that lives for the whole call (accumulation buffer, mask); dropping it
/// releases them.
pub trait ComputeBackend {
    type Accumulator;

    fn name(&self) -> &'static str;

    /// Allocates a zeroed accumulation buffer for `params.grid` and uploads
    /// the mask shared by all batches.
    fn begin(&self, params: &KernelParameters, mask: &ValidityMask) -> Result<Self::Accumulator>;

    /// Adds the contributions of `batch` to the accumulation buffer and
    /// blocks until the device has finished.
    fn dispatch(
        &self,
        accumulator: &mut Self::Accumulator,
        batch: &Batch,
        params: &KernelParameters,
    ) -> Result<()>;

    /// Copies the accumulation buffer to host memory in x-fastest order.
    fn read_back(&self, accumulator: Self::Accumulator) -> Result<Vec<Accumulation>>;
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for &B {
    type Accumulator = B::Accumulator;

    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn begin(&self, params: &KernelParameters, mask: &ValidityMask) -> Result<Self::Accumulator> {
        (**self).begin(params, mask)
    }

    fn dispatch(
        &self,
        accumulator: &mut Self::Accumulator,
        batch: &Batch,
        params: &KernelParameters,
    ) -> Result<()> {
        (**self).dispatch(accumulator, batch, params)
    }

    fn read_back(&self, accumulator: Self::Accumulator) -> Result<Vec<Accumulation>> {
        (**self).read_back(accumulator)
    }
}
