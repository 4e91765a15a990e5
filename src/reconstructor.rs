use tracing::{debug, info};
use web_time::Instant;

use crate::backend::ComputeBackend;
use crate::batch::BatchScheduler;
use crate::config::ReconstructionConfig;
use crate::error::Result;
use crate::extent::ExtentCalculator;
use crate::kernel::KernelParameters;
use crate::normalize::normalize_into;
use crate::slice::{Slice, ValidityMask, validate_inputs};
use crate::transform::{RigidTransform, TransformComposer};
use crate::volume::OutputVolume;

/// Inputs of one reconstruction call, borrowed from the caller.
#[derive(Debug, Clone, Copy)]
pub struct ReconstructionRequest<'a> {
    pub slices: &'a [Slice],
    /// One tracking transform per slice.
    pub transforms: &'a [RigidTransform],
    pub mask: Option<&'a ValidityMask>,
    /// Applied to the whole acquisition after the per-slice transforms.
    pub shared_transform: RigidTransform,
}

impl<'a> ReconstructionRequest<'a> {
    pub fn new(
        slices: &'a [Slice],
        transforms: &'a [RigidTransform],
        mask: &'a ValidityMask,
    ) -> Self {
        Self {
            slices,
            transforms,
            mask: Some(mask),
            shared_transform: RigidTransform::IDENTITY,
        }
    }

    pub fn with_shared_transform(mut self, shared_transform: RigidTransform) -> Self {
        self.shared_transform = shared_transform;
        self
    }
}

/// Drives extent computation, transform composition, batched dispatch and
/// normalization on an injected compute backend.
pub struct Reconstructor<B: ComputeBackend> {
    backend: B,
}

impl<B: ComputeBackend> Reconstructor<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Reconstructs a volume with the default batch size and output direction.
    ///
    /// # Errors
    ///
    /// See [`Self::reconstruct_with`].
    #[allow(clippy::too_many_arguments)]
    pub fn reconstruct(
        &self,
        slices: &[Slice],
        transforms: &[RigidTransform],
        mask: Option<&ValidityMask>,
        shared_transform: &RigidTransform,
        spacing: f64,
        search_radius: u32,
        kernel_std_dev: f32,
    ) -> Result<OutputVolume> {
        let request = ReconstructionRequest {
            slices,
            transforms,
            mask,
            shared_transform: *shared_transform,
        };
        let config = ReconstructionConfig::default()
            .with_spacing(spacing)
            .with_search_radius(search_radius)
            .with_kernel_std_dev(kernel_std_dev);
        self.reconstruct_with(&request, &config)
    }

    /// Reconstructs a volume tightly bounding every transformed slice.
    ///
    /// # Errors
    ///
    /// - [`InvalidState`] when there are no slices, the mask is missing, the
    ///   slice and transform counts differ, dimensions disagree with the mask,
    ///   or the configuration is out of range. Nothing is allocated.
    /// - [`SingularTransform`] when a slice's geometry cannot be inverted.
    /// - [`ComputeBackend`] when the backend fails; no volume is returned.
    ///
    /// [`InvalidState`]: crate::error::ReconstructionError::InvalidState
    /// [`SingularTransform`]: crate::error::ReconstructionError::SingularTransform
    /// [`ComputeBackend`]: crate::error::ReconstructionError::ComputeBackend
    pub fn reconstruct_with(
        &self,
        request: &ReconstructionRequest<'_>,
        config: &ReconstructionConfig,
    ) -> Result<OutputVolume> {
        let slices = request.slices;
        let mask = validate_inputs(slices, request.transforms.len(), request.mask)?;
        config.validate()?;
        let started = Instant::now();

        let composer = TransformComposer::new(&request.shared_transform);
        let slice_to_location =
            composer.transformed_slice_index_to_location(slices, request.transforms)?;
        let mut volume = ExtentCalculator::new(config.spacing, config.output_direction)
            .with_max_voxels(config.max_voxels)
            .compute(slices, &slice_to_location)?;
        let transforms = composer.compose(&volume, &slice_to_location);

        let params = KernelParameters {
            grid: volume.extent()?,
            search_radius: config.search_radius,
            kernel_std_dev: config.kernel_std_dev,
        };
        let scheduler = BatchScheduler::new(config.batch_size);
        info!(
            backend = self.backend.name(),
            slices = slices.len(),
            batches = scheduler.batch_count(slices.len()),
            grid = ?params.grid,
            spacing = config.spacing,
            "starting reconstruction"
        );

        let mut accumulator = self.backend.begin(&params, mask)?;
        for batch in scheduler.batches(slices, &transforms) {
            self.backend.dispatch(&mut accumulator, &batch, &params)?;
            debug!(
                offset = batch.slice_offset(),
                slices = batch.len(),
                "accumulated batch"
            );
        }
        let accumulation = self.backend.read_back(accumulator)?;
        normalize_into(&accumulation, &mut volume)?;

        info!(
            voxels = volume.voxel_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconstruction finished"
        );
        Ok(volume)
    }
}
