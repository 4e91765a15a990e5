use std::borrow::Cow;
use std::sync::Arc;

use futures::executor::block_on;
use tracing::debug;
use wgpu::{PollType, util::DeviceExt};

use super::ComputeBackend;
use crate::batch::Batch;
use crate::error::{ReconstructionError, Result};
use crate::kernel::{Accumulation, KernelParameters};
use crate::slice::ValidityMask;

pub(crate) const SCATTER_ACCUMULATE_WGSL: &str = include_str!("../shaders/scatter_accumulate.wgsl");

const WORKGROUP_SIZE: u32 = 4;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Uniforms {
    grid_x: u32,
    grid_y: u32,
    grid_z: u32,
    slice_count: u32,
    slice_width: u32,
    slice_height: u32,
    search_radius: u32,
    slice_offset: u32,
    kernel_std_dev: f32,
    _padding: [u32; 3],
}

/// Device, queue and compiled scatter pipeline.
///
/// Created once by the application and shared by every reconstruction.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl GpuContext {
    /// Requests the default adapter and a device with its full limits.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .map_err(|e| ReconstructionError::backend("context creation", e))?;
        let info = adapter.get_info();
        debug!(adapter = %info.name, backend = ?info.backend, "selected compute adapter");

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Reconstruction Device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await
            .map_err(|e| ReconstructionError::backend("context creation", e))?;

        Self::from_device(device, queue)
    }

    /// Builds the scatter pipeline on a device owned by the application.
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Result<Self> {
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Scatter Accumulate Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(SCATTER_ACCUMULATE_WGSL)),
        });
        let compilation = block_on(shader.get_compilation_info());
        let build_log: Vec<String> = compilation
            .messages
            .iter()
            .filter(|message| message.message_type == wgpu::CompilationMessageType::Error)
            .map(|message| message.message.clone())
            .collect();

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Scatter Accumulate Bind Group Layout"),
            entries: &[
                // Batch slice pixels
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
                // Validity mask
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Uint,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                // Packed matrices
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Accumulation buffer
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Uniforms
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Scatter Accumulate Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Scatter Accumulate Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        if let Some(error) = block_on(device.pop_error_scope()) {
            let diagnostic = if build_log.is_empty() {
                error.to_string()
            } else {
                build_log.join("\n")
            };
            return Err(ReconstructionError::backend("kernel build", diagnostic));
        }

        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    /// Runs `f` inside validation and out-of-memory error scopes, turning a
    /// captured error into a [`ReconstructionError::ComputeBackend`].
    fn scoped<T>(&self, operation: &'static str, f: impl FnOnce() -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let validation = block_on(self.device.pop_error_scope());
        let out_of_memory = block_on(self.device.pop_error_scope());
        match validation.or(out_of_memory) {
            Some(error) => Err(ReconstructionError::backend(operation, error)),
            None => Ok(value),
        }
    }

    fn wait(&self) -> Result<()> {
        self.device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map(|_| ())
            .map_err(|e| ReconstructionError::backend("synchronization", e))
    }
}

/// Runs the scatter kernel as a wgpu compute shader.
#[derive(Clone)]
pub struct GpuBackend {
    context: Arc<GpuContext>,
}

pub struct GpuAccumulator {
    accumulation: wgpu::Buffer,
    size: u64,
    // Keeps the mask alive alongside its view for the whole call.
    _mask_texture: wgpu::Texture,
    mask_view: wgpu::TextureView,
}

impl GpuBackend {
    pub fn new(context: Arc<GpuContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    fn check_limits(&self, params: &KernelParameters, mask: &ValidityMask) -> Result<u64> {
        let limits = self.context.limits();
        let [width, height, depth] = params.grid;
        let size = width as u64
            * height as u64
            * depth as u64
            * std::mem::size_of::<Accumulation>() as u64;
        if size > limits.max_storage_buffer_binding_size as u64 || size > limits.max_buffer_size {
            return Err(ReconstructionError::backend(
                "buffer allocation",
                format!(
                    "accumulation buffer of {size} bytes exceeds the device limit of {} bytes",
                    limits.max_storage_buffer_binding_size
                ),
            ));
        }

        let (mask_height, mask_width) = mask.dim();
        let max_2d = limits.max_texture_dimension_2d as usize;
        if mask_width > max_2d || mask_height > max_2d {
            return Err(ReconstructionError::backend(
                "buffer allocation",
                format!("mask of {mask_width}x{mask_height} exceeds the 2D texture limit {max_2d}"),
            ));
        }

        let max_groups = limits.max_compute_workgroups_per_dimension;
        if params
            .grid
            .iter()
            .any(|&n| n.div_ceil(WORKGROUP_SIZE) > max_groups)
        {
            return Err(ReconstructionError::backend(
                "kernel dispatch",
                format!("grid {:?} needs more than {max_groups} workgroups per dimension", params.grid),
            ));
        }
        Ok(size)
    }
}

impl ComputeBackend for GpuBackend {
    type Accumulator = GpuAccumulator;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn begin(&self, params: &KernelParameters, mask: &ValidityMask) -> Result<GpuAccumulator> {
        let size = self.check_limits(params, mask)?;
        let context = &self.context;
        let (mask_height, mask_width) = mask.dim();
        let mask_bytes = mask.as_standard_bytes();

        context.scoped("buffer allocation", || {
            let accumulation = context.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Accumulation Buffer"),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            });

            let mask_size = wgpu::Extent3d {
                width: mask_width as u32,
                height: mask_height as u32,
                depth_or_array_layers: 1,
            };
            let mask_texture = context.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("Validity Mask Texture"),
                size: mask_size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::R8Uint,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            context.queue.write_texture(
                wgpu::TexelCopyTextureInfoBase {
                    texture: &mask_texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                mask_bytes.as_ref(),
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(mask_width as u32),
                    rows_per_image: Some(mask_height as u32),
                },
                mask_size,
            );
            let mask_view = mask_texture.create_view(&wgpu::TextureViewDescriptor::default());

            GpuAccumulator {
                accumulation,
                size,
                _mask_texture: mask_texture,
                mask_view,
            }
        })
    }

    fn dispatch(
        &self,
        accumulator: &mut GpuAccumulator,
        batch: &Batch,
        params: &KernelParameters,
    ) -> Result<()> {
        let context = &self.context;
        let (slice_width, slice_height) = batch.slice_extent();
        let depth = batch.len() as u32;

        let max_3d = context.limits().max_texture_dimension_3d;
        if slice_width > max_3d || slice_height > max_3d || depth > max_3d {
            return Err(ReconstructionError::backend(
                "buffer allocation",
                format!(
                    "batch image {slice_width}x{slice_height}x{depth} exceeds the 3D texture limit {max_3d}"
                ),
            ));
        }
        let pixels = batch.pixels.as_slice().ok_or_else(|| {
            ReconstructionError::backend("buffer allocation", "batch pixels are not contiguous")
        })?;

        // Per-batch resources are dropped when this scope ends, on every path.
        let (slice_texture, matrix_buffer, uniform_buffer) =
            context.scoped("buffer allocation", || {
                let texture_size = wgpu::Extent3d {
                    width: slice_width,
                    height: slice_height,
                    depth_or_array_layers: depth,
                };
                let slice_texture = context.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("Batch Slice 3D Texture"),
                    size: texture_size,
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D3,
                    format: wgpu::TextureFormat::R32Float,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                });
                context.queue.write_texture(
                    wgpu::TexelCopyTextureInfoBase {
                        texture: &slice_texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    bytemuck::cast_slice(pixels),
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(slice_width * std::mem::size_of::<f32>() as u32),
                        rows_per_image: Some(slice_height),
                    },
                    texture_size,
                );

                let matrix_buffer =
                    context
                        .device
                        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some("Batch Matrix Buffer"),
                            contents: bytemuck::cast_slice(&batch.matrices),
                            usage: wgpu::BufferUsages::STORAGE,
                        });

                let uniforms = Uniforms {
                    grid_x: params.grid[0],
                    grid_y: params.grid[1],
                    grid_z: params.grid[2],
                    slice_count: depth,
                    slice_width,
                    slice_height,
                    search_radius: params.search_radius,
                    slice_offset: batch.slice_offset() as u32,
                    kernel_std_dev: params.kernel_std_dev,
                    _padding: [0; 3],
                };
                let uniform_buffer =
                    context
                        .device
                        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                            label: Some("Batch Uniform Buffer"),
                            contents: bytemuck::bytes_of(&uniforms),
                            usage: wgpu::BufferUsages::UNIFORM,
                        });

                (slice_texture, matrix_buffer, uniform_buffer)
            })?;

        context.scoped("kernel dispatch", || {
            let slice_view = slice_texture.create_view(&wgpu::TextureViewDescriptor::default());
            let bind_group = context.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Scatter Accumulate Bind Group"),
                layout: &context.bind_group_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(&slice_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(&accumulator.mask_view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: matrix_buffer.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: accumulator.accumulation.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: uniform_buffer.as_entire_binding(),
                    },
                ],
            });

            let mut encoder = context
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Scatter Accumulate Encoder"),
                });
            {
                let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("Scatter Accumulate Pass"),
                    timestamp_writes: None,
                });
                compute_pass.set_pipeline(&context.pipeline);
                compute_pass.set_bind_group(0, &bind_group, &[]);
                let [x, y, z] = params.grid.map(|n| n.div_ceil(WORKGROUP_SIZE));
                compute_pass.dispatch_workgroups(x, y, z);
            }
            context.queue.submit(Some(encoder.finish()));
        })?;

        context.wait()
    }

    fn read_back(&self, accumulator: GpuAccumulator) -> Result<Vec<Accumulation>> {
        let context = &self.context;
        let size = accumulator.size;

        let staging_buffer = context.scoped("read back", || {
            let staging_buffer = context.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Accumulation Staging Buffer"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = context
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Accumulation Read Back Encoder"),
                });
            encoder.copy_buffer_to_buffer(&accumulator.accumulation, 0, &staging_buffer, 0, size);
            context.queue.submit(Some(encoder.finish()));
            staging_buffer
        })?;

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        context.wait()?;
        block_on(receiver)
            .map_err(|e| ReconstructionError::backend("synchronization", e))?
            .map_err(|e| ReconstructionError::backend("read back", e))?;

        let data = buffer_slice.get_mapped_range();
        let result = bytemuck::cast_slice::<u8, Accumulation>(&data).to_vec();

        drop(data);
        staging_buffer.unmap();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use naga::valid::{Capabilities, ValidationFlags, Validator};

    fn parse_shader() -> naga::Module {
        naga::front::wgsl::parse_str(SCATTER_ACCUMULATE_WGSL)
            .unwrap_or_else(|err| panic!("scatter_accumulate: {err:?}"))
    }

    #[test]
    fn scatter_shader_validates() {
        let module = parse_shader();
        let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
        validator
            .validate(&module)
            .unwrap_or_else(|err| panic!("scatter_accumulate: {err:?}"));
    }

    #[test]
    fn uniforms_match_shader_layout() {
        let module = parse_shader();
        let span = module
            .types
            .iter()
            .find_map(|(_, ty)| match (&ty.name, &ty.inner) {
                (Some(name), naga::TypeInner::Struct { span, .. }) if name == "Params" => {
                    Some(*span)
                }
                _ => None,
            })
            .expect("shader declares Params");
        assert_eq!(span as usize, std::mem::size_of::<Uniforms>());
    }

    #[test]
    fn accumulation_entries_are_vec2() {
        assert_eq!(std::mem::size_of::<Accumulation>(), 8);
    }
}
