use std::f64::consts::PI;
use std::sync::Arc;

use glam::{DMat3, DVec3};
use ndarray::Array2;
use tracing::warn;
use us_reconstruction::{
    CpuBackend, GpuBackend, GpuContext, OutputVolume, ReconstructionConfig, ReconstructionRequest,
    Reconstructor, RigidTransform, Slice, ValidityMask, enums::Orientation,
};

const FRAME_SIZE: usize = 128;
const FRAME_COUNT: usize = 40;

/// A fan sweep of frames tilting about the probe's x axis, imaging a sphere.
fn synthetic_sweep() -> (Vec<Slice>, Vec<RigidTransform>) {
    let half = FRAME_SIZE as f64 / 2.0;
    let centre = DVec3::new(half, half * 1.2, 0.0);
    let radius = half * 0.5;

    let transforms: Vec<_> = (0..FRAME_COUNT)
        .map(|i| {
            let angle = (i as f64 / (FRAME_COUNT - 1) as f64 - 0.5) * PI / 3.0;
            RigidTransform::new(DMat3::from_rotation_x(angle), DVec3::ZERO)
        })
        .collect();
    let slices = transforms
        .iter()
        .map(|transform| {
            let pixels = Array2::from_shape_fn((FRAME_SIZE, FRAME_SIZE), |(v, u)| {
                let location = transform.rotation * DVec3::new(u as f64, v as f64, 0.0);
                if location.distance(centre) < radius { 200.0 } else { 40.0 }
            });
            Slice::axis_aligned(pixels, DVec3::ZERO)
        })
        .collect();
    (slices, transforms)
}

fn reconstruct(
    gpu: Option<GpuContext>,
    request: &ReconstructionRequest<'_>,
    config: &ReconstructionConfig,
) -> us_reconstruction::Result<OutputVolume> {
    match gpu {
        Some(context) => {
            Reconstructor::new(GpuBackend::new(Arc::new(context))).reconstruct_with(request, config)
        }
        None => Reconstructor::new(CpuBackend).reconstruct_with(request, config),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt().init();

    let (slices, transforms) = synthetic_sweep();
    // Excludes the top rows where the probe housing would be.
    let mask = ValidityMask::from_fn(FRAME_SIZE, FRAME_SIZE, |_, v| v >= 8);
    let request = ReconstructionRequest::new(&slices, &transforms, &mask);
    let config = ReconstructionConfig::default().with_spacing(1.0);

    let gpu = match GpuContext::new().await {
        Ok(context) => Some(context),
        Err(error) => {
            warn!(%error, "no usable GPU, falling back to the CPU backend");
            None
        }
    };

    let volume = reconstruct(gpu, &request, &config).expect("should have reconstructed the sweep");
    let image = volume
        .get_image_from_axis(volume.dim().0 / 2, Orientation::Axial)
        .expect("should have returned image at center of volume");
    image.save("result.png").expect("should have written result.png");
}
