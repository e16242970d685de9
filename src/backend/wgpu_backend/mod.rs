//! wgpu backend implementation
//!
//! Emulates the immediate-mode backend contract on top of wgpu. Draws are
//! buffered per bound framebuffer and replayed in one render pass when the
//! target changes, a clear or readback needs the results, or the frame ends.
//! Uniform values are snapshotted per draw into a dynamic-offset ring buffer,
//! so a later `set_uniform` never leaks into an earlier buffered draw.
//!
//! Bind group layout per program:
//! - group 0: the uniform struct (dynamic offset into the ring)
//! - group 1: one `texture_2d<f32>` per sampler uniform, in declaration order
//! - group 2: the light uniform block

use std::any::Any;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::Arc;

use crate::backend::traits::*;
use crate::backend::types::*;

const INITIAL_RING_SIZE: u64 = 64 * 1024;

/// Texture plus the descriptor needed to recreate it on resize
struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    desc: TextureDescriptor,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

/// Pipelines are specialized lazily on the state they are drawn with
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    color_formats: Vec<Option<wgpu::TextureFormat>>,
    depth_format: Option<wgpu::TextureFormat>,
    depth_test: bool,
    blend: Option<BlendState>,
    topology: PrimitiveTopology,
    strip_index_format: Option<IndexFormat>,
    vertex_layouts: Vec<VertexBufferLayout>,
}

struct GpuProgram {
    label: String,
    module: wgpu::ShaderModule,
    pipeline_layout: wgpu::PipelineLayout,
    layout: UniformLayout,
    /// Texture unit read by each sampler binding
    sampler_units: Vec<u32>,
    uniform_data: Vec<u8>,
    uniform_block: bool,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
}

#[derive(Debug, Default)]
struct DrawState {
    framebuffer: Option<FramebufferHandle>,
    viewport: Option<(u32, u32)>,
    blend: Option<BlendState>,
    depth_test: bool,
    program: Option<ProgramHandle>,
    textures: HashMap<u32, TextureHandle>,
    uniform_block: Option<BufferHandle>,
    vertex_array: Option<VertexArrayHandle>,
}

/// Draw call recorded against the pending pass
struct PendingDraw {
    program: u64,
    key: PipelineKey,
    uniform_offset: Option<u32>,
    textures: Vec<Option<u64>>,
    block: Option<u64>,
    vertex_buffers: Vec<u64>,
    index_buffer: Option<(u64, IndexFormat)>,
    viewport: (u32, u32),
    range: Range<u32>,
    instances: u32,
    indexed: bool,
}

/// Buffered render pass, replayed in `flush`
struct PendingPass {
    framebuffer: FramebufferHandle,
    clear_color: Option<[f32; 4]>,
    clear_depth: Option<f32>,
    uniforms: Vec<u8>,
    draws: Vec<PendingDraw>,
}

/// Presentation target: a window surface or an offscreen texture
enum Canvas {
    Surface {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        frame: Option<(wgpu::SurfaceTexture, wgpu::TextureView)>,
    },
    Offscreen {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
        width: u32,
        height: u32,
    },
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    canvas: Canvas,
    canvas_format: wgpu::TextureFormat,

    // Resource storage
    buffers: HashMap<u64, GpuBuffer>,
    textures: HashMap<u64, GpuTexture>,
    framebuffers: HashMap<u64, FramebufferDescriptor>,
    programs: HashMap<u64, GpuProgram>,
    vertex_arrays: HashMap<u64, VertexArrayDescriptor>,
    next_id: u64,

    // Shared layouts
    empty_layout: wgpu::BindGroupLayout,
    empty_bind_group: wgpu::BindGroup,
    uniforms_layout: wgpu::BindGroupLayout,
    block_layout: wgpu::BindGroupLayout,
    texture_layouts: HashMap<usize, wgpu::BindGroupLayout>,
    placeholder: wgpu::TextureView,

    ring: wgpu::Buffer,
    ring_size: u64,
    uniform_alignment: u64,

    state: DrawState,
    pending: Option<PendingPass>,
    stats: BackendStats,
    in_frame: bool,
}

impl WgpuBackend {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        }
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::COPY_DST;
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        result
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        // Readback needs COPY_SRC on everything
        let mut result = wgpu::TextureUsages::COPY_SRC;
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32 => wgpu::VertexFormat::Float32,
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
            VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
            VertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
        }
    }

    fn convert_index_format(format: IndexFormat) -> wgpu::IndexFormat {
        match format {
            IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
            IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
        }
    }

    fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
        match factor {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::Src => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::Dst => wgpu::BlendFactor::Dst,
            BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }

    fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
        match op {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
            BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOperation::Min => wgpu::BlendOperation::Min,
            BlendOperation::Max => wgpu::BlendOperation::Max,
        }
    }

    fn convert_blend_component(component: &BlendComponent) -> wgpu::BlendComponent {
        wgpu::BlendComponent {
            src_factor: Self::convert_blend_factor(component.src_factor),
            dst_factor: Self::convert_blend_factor(component.dst_factor),
            operation: Self::convert_blend_operation(component.operation),
        }
    }
}

impl WgpuBackend {
    /// Windowed backend presenting to `window`
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(Some((window, vsync)), (1, 1)))
    }

    /// Backend rendering into an offscreen `width` x `height` canvas
    pub fn headless(width: u32, height: u32) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(None, (width, height)))
    }

    async fn new_async(
        window: Option<(Arc<winit::window::Window>, bool)>,
        offscreen_size: (u32, u32),
    ) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = match &window {
            Some((window, _)) => Some(
                instance
                    .create_surface(window.clone())
                    .map_err(|e| BackendError::SurfaceError(e.to_string()))?,
            ),
            None => None,
        };

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface.as_ref(),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::InitializationFailed("No suitable adapter found".into()))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        // Five G-buffer targets exceed the default per-sample byte budget
        let adapter_limits = adapter.limits();
        let required_limits = wgpu::Limits {
            max_color_attachments: adapter_limits.max_color_attachments,
            max_color_attachment_bytes_per_sample: adapter_limits
                .max_color_attachment_bytes_per_sample,
            ..wgpu::Limits::downlevel_defaults().using_resolution(adapter_limits.clone())
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Deferred Renderer Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits,
                },
                None,
            )
            .await
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

        device.on_uncaptured_error(Box::new(|error: wgpu::Error| {
            log::error!("wgpu: {}", error);
        }));

        let (canvas, canvas_format) = match (surface, window) {
            (Some(surface), Some((window, vsync))) => {
                let size = window.inner_size();
                let caps = surface.get_capabilities(&adapter);
                // Blit output is already display-ready, so prefer a linear format
                let format = caps
                    .formats
                    .iter()
                    .copied()
                    .find(|f| !f.is_srgb())
                    .or_else(|| caps.formats.first().copied())
                    .ok_or_else(|| BackendError::SurfaceError("Surface has no formats".into()))?;
                let config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format,
                    width: size.width.max(1),
                    height: size.height.max(1),
                    present_mode: if vsync {
                        wgpu::PresentMode::AutoVsync
                    } else {
                        wgpu::PresentMode::AutoNoVsync
                    },
                    alpha_mode: caps
                        .alpha_modes
                        .first()
                        .copied()
                        .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                    view_formats: vec![],
                    desired_maximum_frame_latency: 2,
                };
                surface.configure(&device, &config);
                (
                    Canvas::Surface {
                        surface,
                        config,
                        frame: None,
                    },
                    format,
                )
            }
            _ => (
                Self::offscreen_canvas(&device, offscreen_size.0, offscreen_size.1),
                wgpu::TextureFormat::Rgba8Unorm,
            ),
        };

        let empty_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Empty"),
            entries: &[],
        });
        let empty_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Empty"),
            layout: &empty_layout,
            entries: &[],
        });
        let uniform_entry = |dynamic: bool| wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: dynamic,
                min_binding_size: None,
            },
            count: None,
        };
        let uniforms_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Uniforms"),
            entries: &[uniform_entry(true)],
        });
        let block_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Light Block"),
            entries: &[uniform_entry(false)],
        });

        let placeholder = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("Unbound Texture"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba16Float,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        let ring = Self::create_ring(&device, INITIAL_RING_SIZE);
        let uniform_alignment = device.limits().min_uniform_buffer_offset_alignment as u64;

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            canvas,
            canvas_format,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            vertex_arrays: HashMap::new(),
            next_id: 1,
            empty_layout,
            empty_bind_group,
            uniforms_layout,
            block_layout,
            texture_layouts: HashMap::new(),
            placeholder,
            ring,
            ring_size: INITIAL_RING_SIZE,
            uniform_alignment,
            state: DrawState::default(),
            pending: None,
            stats: BackendStats::default(),
            in_frame: false,
        })
    }

    fn offscreen_canvas(device: &wgpu::Device, width: u32, height: u32) -> Canvas {
        let (width, height) = (width.max(1), height.max(1));
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Canvas"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Canvas::Offscreen {
            texture,
            view,
            width,
            height,
        }
    }

    fn create_ring(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Uniform Ring"),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn texture_layout(&mut self, count: usize) -> &wgpu::BindGroupLayout {
        let device = &self.device;
        self.texture_layouts.entry(count).or_insert_with(|| {
            let entries: Vec<wgpu::BindGroupLayoutEntry> = (0..count as u32)
                .map(|binding| wgpu::BindGroupLayoutEntry {
                    binding,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: false },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                })
                .collect();
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Textures"),
                entries: &entries,
            })
        })
    }

    /// Color formats (indexed by slot) and depth format of a framebuffer
    fn target_formats(
        &self,
        framebuffer: FramebufferHandle,
    ) -> Option<(Vec<Option<wgpu::TextureFormat>>, Option<wgpu::TextureFormat>, (u32, u32))> {
        if framebuffer == FramebufferHandle::CANVAS {
            return Some((vec![Some(self.canvas_format)], None, self.canvas_size()));
        }
        let desc = self.framebuffers.get(&framebuffer.0)?;
        let slots = desc
            .color_attachments
            .iter()
            .map(|(slot, _)| *slot as usize + 1)
            .max()
            .unwrap_or(0);
        let mut formats = vec![None; slots];
        let mut size = (1, 1);
        for (slot, texture) in &desc.color_attachments {
            let texture = self.textures.get(&texture.0)?;
            formats[*slot as usize] = Some(Self::convert_texture_format(texture.desc.format));
            size = (texture.desc.width, texture.desc.height);
        }
        let depth = match desc.depth_attachment {
            Some(texture) => Some(Self::convert_texture_format(
                self.textures.get(&texture.0)?.desc.format,
            )),
            None => None,
        };
        Some((formats, depth, size))
    }

    /// Pending pass for the bound framebuffer, flushing a pass for another target
    fn pending_pass(&mut self) -> Option<&mut PendingPass> {
        let framebuffer = self.state.framebuffer.unwrap_or(FramebufferHandle::CANVAS);
        if self
            .pending
            .as_ref()
            .is_some_and(|pass| pass.framebuffer != framebuffer)
        {
            self.flush();
        }
        if self.pending.is_none() {
            self.pending = Some(PendingPass {
                framebuffer,
                clear_color: None,
                clear_depth: None,
                uniforms: Vec::new(),
                draws: Vec::new(),
            });
        }
        self.pending.as_mut()
    }

    /// Flush only when buffered draws could observe a resource change
    fn flush_draws(&mut self) {
        if self.pending.as_ref().is_some_and(|pass| !pass.draws.is_empty()) {
            self.flush();
        }
    }

    fn record_draw(
        &mut self,
        topology: PrimitiveTopology,
        range: Range<u32>,
        instances: u32,
        indexed: bool,
    ) {
        let Some(program_handle) = self.state.program else {
            log::warn!("WgpuBackend: draw without a program");
            return;
        };
        let Some(vertex_array) = self
            .state
            .vertex_array
            .and_then(|handle| self.vertex_arrays.get(&handle.0))
            .cloned()
        else {
            log::warn!("WgpuBackend: draw without a vertex array");
            return;
        };
        if indexed && vertex_array.index_buffer.is_none() {
            log::warn!("WgpuBackend: indexed draw without an index buffer");
            return;
        }
        let framebuffer = self.state.framebuffer.unwrap_or(FramebufferHandle::CANVAS);
        let Some((color_formats, depth_format, target_size)) = self.target_formats(framebuffer) else {
            log::warn!("WgpuBackend: draw into unknown framebuffer {:?}", framebuffer);
            return;
        };
        let Some(program) = self.programs.get(&program_handle.0) else {
            log::warn!("WgpuBackend: draw with destroyed program");
            return;
        };

        let key = PipelineKey {
            color_formats,
            depth_format,
            depth_test: self.state.depth_test,
            blend: self.state.blend,
            topology,
            strip_index_format: match topology {
                PrimitiveTopology::TriangleStrip if indexed => {
                    vertex_array.index_buffer.map(|(_, format)| format)
                }
                _ => None,
            },
            vertex_layouts: vertex_array
                .buffers
                .iter()
                .map(|binding| binding.layout.clone())
                .collect(),
        };
        let textures = program
            .sampler_units
            .iter()
            .map(|unit| self.state.textures.get(unit).map(|t| t.0))
            .collect();
        let uniform_data = (!program.uniform_data.is_empty()).then(|| program.uniform_data.clone());
        let block = if program.uniform_block {
            self.state.uniform_block.map(|b| b.0)
        } else {
            None
        };
        let viewport = match self.state.viewport {
            Some((w, h)) => (w.min(target_size.0), h.min(target_size.1)),
            None => target_size,
        };
        let alignment = self.uniform_alignment;

        let Some(pass) = self.pending_pass() else {
            return;
        };
        let uniform_offset = uniform_data.map(|data| {
            let offset = (pass.uniforms.len() as u64).div_ceil(alignment) * alignment;
            pass.uniforms.resize(offset as usize, 0);
            pass.uniforms.extend_from_slice(&data);
            offset as u32
        });
        pass.draws.push(PendingDraw {
            program: program_handle.0,
            key,
            uniform_offset,
            textures,
            block,
            vertex_buffers: vertex_array.buffers.iter().map(|b| b.buffer.0).collect(),
            index_buffer: vertex_array.index_buffer.map(|(b, f)| (b.0, f)),
            viewport,
            range,
            instances,
            indexed,
        });
        self.stats.draw_calls += 1;
    }

    fn create_pipeline(
        device: &wgpu::Device,
        program: &GpuProgram,
        key: &PipelineKey,
    ) -> Option<wgpu::RenderPipeline> {
        let vertex_attrs: Vec<Vec<wgpu::VertexAttribute>> = key
            .vertex_layouts
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: Self::convert_vertex_format(a.format),
                        offset: a.offset,
                        shader_location: a.location,
                    })
                    .collect()
            })
            .collect();

        let vertex_buffers: Vec<wgpu::VertexBufferLayout> = key
            .vertex_layouts
            .iter()
            .zip(vertex_attrs.iter())
            .map(|(layout, attrs)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: match layout.step_mode {
                    VertexStepMode::Vertex => wgpu::VertexStepMode::Vertex,
                    VertexStepMode::Instance => wgpu::VertexStepMode::Instance,
                },
                attributes: attrs,
            })
            .collect();

        let blend = key.blend.map(|b| wgpu::BlendState {
            color: Self::convert_blend_component(&b.color),
            alpha: Self::convert_blend_component(&b.alpha),
        });
        let color_targets: Vec<Option<wgpu::ColorTargetState>> = key
            .color_formats
            .iter()
            .map(|format| {
                format.map(|format| wgpu::ColorTargetState {
                    format,
                    blend,
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();

        let depth_stencil = key.depth_format.map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: key.depth_test,
            depth_compare: if key.depth_test {
                wgpu::CompareFunction::Less
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(program.label.as_str()),
            layout: Some(&program.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &program.module,
                entry_point: "vs_main",
                buffers: &vertex_buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &program.module,
                entry_point: "fs_main",
                targets: &color_targets,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: match key.topology {
                    PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
                    PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
                },
                strip_index_format: key.strip_index_format.map(Self::convert_index_format),
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });
        if let Some(error) = pollster::block_on(device.pop_error_scope()) {
            log::error!("Pipeline for '{}' failed: {}", program.label, error);
            return None;
        }
        log::debug!("Created pipeline for '{}'", program.label);
        Some(pipeline)
    }

    /// Replay the pending pass into a command buffer and submit it
    fn flush(&mut self) {
        let Some(pass) = self.pending.take() else {
            return;
        };
        if pass.draws.is_empty() && pass.clear_color.is_none() && pass.clear_depth.is_none() {
            return;
        }

        // Specialize pipelines first; the encode phase only borrows
        for draw in &pass.draws {
            let Some(program) = self.programs.get_mut(&draw.program) else {
                continue;
            };
            if !program.pipelines.contains_key(&draw.key) {
                if let Some(pipeline) = Self::create_pipeline(&self.device, program, &draw.key) {
                    program.pipelines.insert(draw.key.clone(), pipeline);
                }
            }
        }

        if !pass.uniforms.is_empty() {
            let needed = pass.uniforms.len() as u64;
            if needed > self.ring_size {
                self.ring_size = needed.next_power_of_two();
                self.ring = Self::create_ring(&self.device, self.ring_size);
                log::debug!("WgpuBackend: uniform ring grown to {} bytes", self.ring_size);
            }
            self.queue.write_buffer(&self.ring, 0, &pass.uniforms);
        }

        // Bind groups for every draw
        for draw in &pass.draws {
            self.texture_layout(draw.textures.len());
        }
        let mut bind_groups: Vec<[Option<wgpu::BindGroup>; 3]> = Vec::with_capacity(pass.draws.len());
        for draw in &pass.draws {
            let Some(program) = self.programs.get(&draw.program) else {
                bind_groups.push([None, None, None]);
                continue;
            };
            let uniforms = draw.uniform_offset.map(|_| {
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Uniforms"),
                    layout: &self.uniforms_layout,
                    entries: &[wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: &self.ring,
                            offset: 0,
                            size: NonZeroU64::new(program.layout.size),
                        }),
                    }],
                })
            });
            let textures = if draw.textures.is_empty() {
                None
            } else {
                let entries: Vec<wgpu::BindGroupEntry> = draw
                    .textures
                    .iter()
                    .enumerate()
                    .map(|(binding, texture)| wgpu::BindGroupEntry {
                        binding: binding as u32,
                        resource: wgpu::BindingResource::TextureView(
                            texture
                                .and_then(|id| self.textures.get(&id))
                                .map(|t| &t.view)
                                .unwrap_or(&self.placeholder),
                        ),
                    })
                    .collect();
                self.texture_layouts.get(&draw.textures.len()).map(|layout| {
                    self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("Textures"),
                        layout,
                        entries: &entries,
                    })
                })
            };
            let block = draw
                .block
                .and_then(|id| self.buffers.get(&id))
                .map(|buffer| {
                    self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some("Light Block"),
                        layout: &self.block_layout,
                        entries: &[wgpu::BindGroupEntry {
                            binding: 0,
                            resource: buffer.buffer.as_entire_binding(),
                        }],
                    })
                });
            bind_groups.push([uniforms, textures, block]);
        }

        let (color_views, depth_view): (Vec<Option<&wgpu::TextureView>>, Option<&wgpu::TextureView>) =
            if pass.framebuffer == FramebufferHandle::CANVAS {
                let view = match &self.canvas {
                    Canvas::Surface { frame, .. } => frame.as_ref().map(|(_, view)| view),
                    Canvas::Offscreen { view, .. } => Some(view),
                };
                let Some(view) = view else {
                    log::warn!("WgpuBackend: canvas pass outside a frame was dropped");
                    return;
                };
                (vec![Some(view)], None)
            } else {
                let Some(desc) = self.framebuffers.get(&pass.framebuffer.0) else {
                    log::warn!("WgpuBackend: pass for unknown framebuffer dropped");
                    return;
                };
                let slots = desc
                    .color_attachments
                    .iter()
                    .map(|(slot, _)| *slot as usize + 1)
                    .max()
                    .unwrap_or(0);
                let mut views = vec![None; slots];
                for (slot, texture) in &desc.color_attachments {
                    views[*slot as usize] = self.textures.get(&texture.0).map(|t| &t.view);
                }
                let depth = desc
                    .depth_attachment
                    .and_then(|t| self.textures.get(&t.0))
                    .map(|t| &t.view);
                (views, depth)
            };

        let color_load = match pass.clear_color {
            Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                r: r as f64,
                g: g as f64,
                b: b as f64,
                a: a as f64,
            }),
            None => wgpu::LoadOp::Load,
        };
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
            .iter()
            .map(|view| {
                view.map(|view| wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: color_load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let depth_attachment = depth_view.map(|view| wgpu::RenderPassDepthStencilAttachment {
            view,
            depth_ops: Some(wgpu::Operations {
                load: match pass.clear_depth {
                    Some(depth) => wgpu::LoadOp::Clear(depth),
                    None => wgpu::LoadOp::Load,
                },
                store: wgpu::StoreOp::Store,
            }),
            stencil_ops: None,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Pass Encoder"),
            });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: None,
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            for (draw, groups) in pass.draws.iter().zip(&bind_groups) {
                let Some(pipeline) = self
                    .programs
                    .get(&draw.program)
                    .and_then(|program| program.pipelines.get(&draw.key))
                else {
                    continue;
                };
                render_pass.set_pipeline(pipeline);
                match (&groups[0], draw.uniform_offset) {
                    (Some(group), Some(offset)) => render_pass.set_bind_group(0, group, &[offset]),
                    _ => render_pass.set_bind_group(0, &self.empty_bind_group, &[]),
                }
                render_pass.set_bind_group(1, groups[1].as_ref().unwrap_or(&self.empty_bind_group), &[]);
                render_pass.set_bind_group(2, groups[2].as_ref().unwrap_or(&self.empty_bind_group), &[]);
                for (slot, id) in draw.vertex_buffers.iter().enumerate() {
                    if let Some(buffer) = self.buffers.get(id) {
                        render_pass.set_vertex_buffer(slot as u32, buffer.buffer.slice(..));
                    }
                }
                render_pass.set_viewport(
                    0.0,
                    0.0,
                    draw.viewport.0 as f32,
                    draw.viewport.1 as f32,
                    0.0,
                    1.0,
                );
                if draw.indexed {
                    let Some(buffer) = draw
                        .index_buffer
                        .and_then(|(id, format)| self.buffers.get(&id).map(|b| (b, format)))
                    else {
                        continue;
                    };
                    render_pass.set_index_buffer(
                        buffer.0.buffer.slice(..),
                        Self::convert_index_format(buffer.1),
                    );
                    render_pass.draw_indexed(draw.range.clone(), 0, 0..draw.instances);
                } else {
                    render_pass.draw(draw.range.clone(), 0..draw.instances);
                }
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn build_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<GpuProgram> {
        let source = desc.processed_source();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.label.as_str()),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::ShaderCompilationFailed {
                label: desc.label.clone(),
                message: error.to_string(),
            });
        }

        let layout = UniformLayout::new(&desc.uniforms);
        let sampler_count = layout.samplers.len();
        self.texture_layout(sampler_count);
        let group0 = if layout.size > 0 {
            &self.uniforms_layout
        } else {
            &self.empty_layout
        };
        let group1 = match self.texture_layouts.get(&sampler_count) {
            Some(layout) if sampler_count > 0 => layout,
            _ => &self.empty_layout,
        };
        let group2 = if desc.uniform_block {
            &self.block_layout
        } else {
            &self.empty_layout
        };
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label.as_str()),
                bind_group_layouts: &[group0, group1, group2],
                push_constant_ranges: &[],
            });

        Ok(GpuProgram {
            label: desc.label.clone(),
            module,
            pipeline_layout,
            sampler_units: (0..sampler_count as u32).collect(),
            uniform_data: vec![0; layout.size as usize],
            layout,
            uniform_block: desc.uniform_block,
            pipelines: HashMap::new(),
        })
    }

    fn decode_pixels(
        format: TextureFormat,
        data: &[u8],
        width: u32,
        height: u32,
        padded_row: usize,
    ) -> Vec<[f32; 4]> {
        let bpp = format.bytes_per_pixel() as usize;
        let mut pixels = Vec::with_capacity((width * height) as usize);
        for row in 0..height as usize {
            for col in 0..width as usize {
                let start = row * padded_row + col * bpp;
                let texel = &data[start..start + bpp];
                let unorm = |i: usize| texel[i] as f32 / 255.0;
                let pixel = match format {
                    TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb => {
                        [unorm(0), unorm(1), unorm(2), unorm(3)]
                    }
                    TextureFormat::Bgra8Unorm | TextureFormat::Bgra8UnormSrgb => {
                        [unorm(2), unorm(1), unorm(0), unorm(3)]
                    }
                    TextureFormat::Rgba16Float => {
                        let half = |i: usize| {
                            half::f16::from_le_bytes([texel[i * 2], texel[i * 2 + 1]]).to_f32()
                        };
                        [half(0), half(1), half(2), half(3)]
                    }
                    TextureFormat::Rgba32Float | TextureFormat::Depth32Float => {
                        let float = |i: usize| {
                            f32::from_le_bytes([
                                texel[i * 4],
                                texel[i * 4 + 1],
                                texel.get(i * 4 + 2).copied().unwrap_or(0),
                                texel.get(i * 4 + 3).copied().unwrap_or(0),
                            ])
                        };
                        if format.is_depth() {
                            let depth = float(0);
                            [depth, depth, depth, 1.0]
                        } else {
                            [float(0), float(1), float(2), float(3)]
                        }
                    }
                };
                pixels.push(pixel);
            }
        }
        pixels
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu Backend"
    }

    fn capabilities(&self) -> BackendCapabilities {
        let limits = self.device.limits();
        let float_render_targets = self
            .adapter
            .get_texture_format_features(wgpu::TextureFormat::Rgba16Float)
            .allowed_usages
            .contains(wgpu::TextureUsages::RENDER_ATTACHMENT);
        // Every attachment costs 8 bytes per sample once aligned
        let byte_budget = limits.max_color_attachment_bytes_per_sample / 8;
        BackendCapabilities {
            float_render_targets,
            max_color_attachments: limits.max_color_attachments.min(byte_budget),
            max_texture_dimension: limits.max_texture_dimension_2d,
        }
    }

    fn stats(&self) -> &BackendStats {
        &self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = BackendStats::default();
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        if self.in_frame {
            log::warn!("WgpuBackend: begin_frame called twice");
        }
        self.in_frame = true;
        if let Canvas::Surface {
            surface,
            config,
            frame,
        } = &mut self.canvas
        {
            let texture = match surface.get_current_texture() {
                Ok(texture) => texture,
                Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                    surface.configure(&self.device, config);
                    surface
                        .get_current_texture()
                        .map_err(|e| BackendError::SurfaceError(e.to_string()))?
                }
                Err(e) => return Err(BackendError::SurfaceError(e.to_string())),
            };
            let view = texture
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());
            *frame = Some((texture, view));
        }
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.flush();
        self.in_frame = false;
        if let Canvas::Surface { frame, .. } = &mut self.canvas {
            if let Some((texture, view)) = frame.take() {
                drop(view);
                texture.present();
            }
        }
        Ok(())
    }

    fn canvas_size(&self) -> (u32, u32) {
        match &self.canvas {
            Canvas::Surface { config, .. } => (config.width, config.height),
            Canvas::Offscreen { width, height, .. } => (*width, *height),
        }
    }

    fn resize_canvas(&mut self, width: u32, height: u32) {
        self.flush();
        let max = self.device.limits().max_texture_dimension_2d;
        let (width, height) = (width.clamp(1, max), height.clamp(1, max));
        if let Canvas::Surface {
            surface, config, ..
        } = &mut self.canvas
        {
            config.width = width;
            config.height = height;
            surface.configure(&self.device, config);
        } else {
            let canvas = Self::offscreen_canvas(&self.device, width, height);
            self.canvas = canvas;
        }
        log::debug!("WgpuBackend: canvas resized to {}x{}", width, height);
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        // Uniform bindings need a 16-byte multiple
        let size = desc.size.max(4).div_ceil(16) * 16;
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size,
            usage: Self::convert_buffer_usage(desc.usage),
            mapped_at_creation: false,
        });
        let id = self.allocate_id();
        self.buffers.insert(id, GpuBuffer { buffer, size });
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(&BufferDescriptor {
            size: desc.size.max(data.len() as u64),
            ..desc.clone()
        })?;
        if !data.is_empty() {
            if let Some(buffer) = self.buffers.get(&handle.0) {
                // write_buffer needs a multiple of 4
                let mut padded = data.to_vec();
                padded.resize(data.len().div_ceil(4) * 4, 0);
                self.queue.write_buffer(&buffer.buffer, 0, &padded);
            }
        }
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        self.flush_draws();
        let Some(target) = self.buffers.get(&buffer.0) else {
            log::warn!("WgpuBackend: write to unknown buffer {:?}", buffer);
            return;
        };
        if offset + data.len() as u64 > target.size {
            log::warn!(
                "WgpuBackend: write of {} bytes at {} overflows buffer of {}",
                data.len(),
                offset,
                target.size
            );
            return;
        }
        let mut padded = data.to_vec();
        padded.resize(data.len().div_ceil(4) * 4, 0);
        self.queue.write_buffer(&target.buffer, offset, &padded);
        self.stats.buffer_writes += 1;
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.flush_draws();
        if let Some(buffer) = self.buffers.remove(&buffer.0) {
            buffer.buffer.destroy();
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let max = self.device.limits().max_texture_dimension_2d;
        if desc.width > max || desc.height > max {
            return Err(BackendError::ResourceCreationFailed(format!(
                "texture {}x{} exceeds the {} limit",
                desc.width, desc.height, max
            )));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width.max(1),
                height: desc.height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let id = self.allocate_id();
        self.textures.insert(
            id,
            GpuTexture {
                texture,
                view,
                desc: desc.clone(),
            },
        );
        Ok(TextureHandle(id))
    }

    fn resize_texture(&mut self, texture: TextureHandle, width: u32, height: u32) {
        self.flush();
        let Some(existing) = self.textures.get(&texture.0) else {
            log::warn!("WgpuBackend: resize of unknown texture {:?}", texture);
            return;
        };
        let desc = TextureDescriptor {
            width,
            height,
            ..existing.desc.clone()
        };
        let resized = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });
        let view = resized.create_view(&wgpu::TextureViewDescriptor::default());
        if let Some(old) = self.textures.insert(
            texture.0,
            GpuTexture {
                texture: resized,
                view,
                desc,
            },
        ) {
            old.texture.destroy();
        }
    }

    fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)> {
        self.textures
            .get(&texture.0)
            .map(|t| (t.desc.width, t.desc.height))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.flush_draws();
        if let Some(texture) = self.textures.remove(&texture.0) {
            texture.texture.destroy();
        }
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        for (slot, texture) in &desc.color_attachments {
            if !self.textures.contains_key(&texture.0) {
                return Err(BackendError::InvalidHandle(format!(
                    "color attachment {} of {:?}",
                    slot, desc.label
                )));
            }
        }
        if let Some(depth) = desc.depth_attachment {
            if !self.textures.contains_key(&depth.0) {
                return Err(BackendError::InvalidHandle(format!(
                    "depth attachment of {:?}",
                    desc.label
                )));
            }
        }
        let id = self.allocate_id();
        self.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle(id))
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        let program = self.build_program(desc)?;
        self.stats.program_compilations += 1;
        log::debug!(
            "WgpuBackend: compiled program '{}' ({:?}, {} uniform bytes)",
            desc.label,
            desc.kind,
            program.layout.size
        );
        let id = self.allocate_id();
        self.programs.insert(id, program);
        Ok(ProgramHandle(id))
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.flush_draws();
        self.programs.remove(&program.0);
        if self.state.program == Some(program) {
            self.state.program = None;
        }
    }

    fn create_vertex_array(
        &mut self,
        desc: &VertexArrayDescriptor,
    ) -> BackendResult<VertexArrayHandle> {
        for binding in &desc.buffers {
            if !self.buffers.contains_key(&binding.buffer.0) {
                return Err(BackendError::InvalidHandle(format!(
                    "vertex buffer of {:?}",
                    desc.label
                )));
            }
        }
        let id = self.allocate_id();
        self.vertex_arrays.insert(id, desc.clone());
        Ok(VertexArrayHandle(id))
    }

    fn destroy_vertex_array(&mut self, vertex_array: VertexArrayHandle) {
        self.vertex_arrays.remove(&vertex_array.0);
        if self.state.vertex_array == Some(vertex_array) {
            self.state.vertex_array = None;
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.state.framebuffer = Some(framebuffer);
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.state.viewport = Some((width, height));
    }

    fn set_blend(&mut self, blend: Option<BlendState>) {
        self.state.blend = blend;
    }

    fn set_depth_test(&mut self, enabled: bool) {
        self.state.depth_test = enabled;
    }

    fn use_program(&mut self, program: Option<ProgramHandle>) {
        self.state.program = program;
    }

    fn set_uniform(&mut self, program: ProgramHandle, name: &str, value: UniformValue) {
        self.stats.record_uniform(name);
        let Some(target) = self.programs.get_mut(&program.0) else {
            log::warn!("WgpuBackend: uniform '{}' set on unknown program", name);
            return;
        };
        if let Some(binding) = target.layout.samplers.get(name) {
            match value {
                UniformValue::Int(unit) if unit >= 0 => {
                    target.sampler_units[*binding as usize] = unit as u32;
                }
                _ => log::warn!(
                    "WgpuBackend: sampler '{}' of '{}' needs a texture unit, got {:?}",
                    name,
                    target.label,
                    value
                ),
            }
            return;
        }
        match target.layout.offsets.get(name) {
            Some((offset, ty)) if *ty == value.uniform_type() => {
                let bytes = value.to_bytes();
                let start = *offset as usize;
                target.uniform_data[start..start + bytes.len()].copy_from_slice(&bytes);
                log::trace!("WgpuBackend: {}.{} = {:?}", target.label, name, value);
            }
            Some((_, ty)) => log::warn!(
                "WgpuBackend: uniform '{}' of '{}' is {:?}, got {:?}",
                name,
                target.label,
                ty,
                value.uniform_type()
            ),
            None => log::trace!(
                "WgpuBackend: program '{}' has no uniform '{}'",
                target.label,
                name
            ),
        }
    }

    fn bind_texture(&mut self, unit: u32, texture: Option<TextureHandle>) {
        match texture {
            Some(texture) => {
                self.state.textures.insert(unit, texture);
            }
            None => {
                self.state.textures.remove(&unit);
            }
        }
    }

    fn bind_uniform_block(&mut self, buffer: Option<BufferHandle>) {
        self.state.uniform_block = buffer;
    }

    fn bind_vertex_array(&mut self, vertex_array: Option<VertexArrayHandle>) {
        self.state.vertex_array = vertex_array;
    }

    fn clear(&mut self, color: Option<[f32; 4]>, depth: Option<f32>) {
        // A clear after draws starts a new pass so it lands in order
        self.flush_draws();
        let Some(pass) = self.pending_pass() else {
            return;
        };
        if color.is_some() {
            pass.clear_color = color;
        }
        if depth.is_some() {
            pass.clear_depth = depth;
        }
        self.stats.clears += 1;
    }

    fn draw(&mut self, topology: PrimitiveTopology, vertices: Range<u32>, instances: u32) {
        self.record_draw(topology, vertices, instances, false);
    }

    fn draw_indexed(&mut self, topology: PrimitiveTopology, indices: Range<u32>, instances: u32) {
        self.record_draw(topology, indices, instances, true);
    }

    fn read_pixels(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: u32,
        rect: (u32, u32, u32, u32),
    ) -> BackendResult<Vec<[f32; 4]>> {
        self.flush();

        let (texture, format, size) = if framebuffer == FramebufferHandle::CANVAS {
            match &self.canvas {
                Canvas::Offscreen {
                    texture,
                    width,
                    height,
                    ..
                } => (texture, TextureFormat::Rgba8Unorm, (*width, *height)),
                Canvas::Surface { .. } => {
                    return Err(BackendError::ReadbackFailed(
                        "surface canvas cannot be read back".into(),
                    ))
                }
            }
        } else {
            let fb = self.framebuffers.get(&framebuffer.0).ok_or_else(|| {
                BackendError::InvalidHandle(format!("framebuffer {:?}", framebuffer))
            })?;
            let id = fb
                .color_attachments
                .iter()
                .find(|(slot, _)| *slot == attachment)
                .map(|(_, texture)| texture.0)
                .ok_or_else(|| {
                    BackendError::ReadbackFailed(format!("no color attachment {}", attachment))
                })?;
            let texture = self
                .textures
                .get(&id)
                .ok_or_else(|| BackendError::InvalidHandle(format!("texture {}", id)))?;
            (
                &texture.texture,
                texture.desc.format,
                (texture.desc.width, texture.desc.height),
            )
        };

        let (x, y, width, height) = rect;
        if x + width > size.0 || y + height > size.1 || width == 0 || height == 0 {
            return Err(BackendError::ReadbackFailed(format!(
                "rect {:?} outside {}x{}",
                rect, size.0, size.1
            )));
        }

        let bpp = format.bytes_per_pixel();
        let padded_row = (width * bpp).div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?;

        let pixels = {
            let data = slice.get_mapped_range();
            Self::decode_pixels(format, &data, width, height, padded_row as usize)
        };
        staging.unmap();
        Ok(pixels)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_padded_rows() {
        // 1x2 Rgba8 image with rows padded to 8 bytes
        let data = [255, 0, 0, 255, 9, 9, 9, 9, 0, 51, 0, 0, 9, 9, 9, 9];
        let pixels = WgpuBackend::decode_pixels(TextureFormat::Rgba8Unorm, &data, 1, 2, 8);
        assert_eq!(pixels, vec![[1.0, 0.0, 0.0, 1.0], [0.0, 0.2, 0.0, 0.0]]);
    }

    #[test]
    fn test_decode_bgra_swaps_channels() {
        let data = [0, 0, 255, 255];
        let pixels = WgpuBackend::decode_pixels(TextureFormat::Bgra8Unorm, &data, 1, 1, 4);
        assert_eq!(pixels, vec![[1.0, 0.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_decode_half_float() {
        let data: Vec<u8> = [0.5f32, -2.0, 0.0, 1.0]
            .iter()
            .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
            .collect();
        let pixels = WgpuBackend::decode_pixels(TextureFormat::Rgba16Float, &data, 1, 1, 8);
        assert_eq!(pixels, vec![[0.5, -2.0, 0.0, 1.0]]);
    }

    #[test]
    fn test_usage_conversion() {
        let buffer = WgpuBackend::convert_buffer_usage(BufferUsage::VERTEX | BufferUsage::UNIFORM);
        assert_eq!(
            buffer,
            wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST
        );

        let texture = WgpuBackend::convert_texture_usage(
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        );
        assert!(texture.contains(wgpu::TextureUsages::COPY_SRC));
        assert!(texture.contains(wgpu::TextureUsages::RENDER_ATTACHMENT));
        assert!(!texture.contains(wgpu::TextureUsages::COPY_DST));
    }

    #[test]
    fn test_pipeline_key_distinguishes_blend() {
        let key = PipelineKey {
            color_formats: vec![Some(wgpu::TextureFormat::Rgba16Float)],
            depth_format: None,
            depth_test: false,
            blend: None,
            topology: PrimitiveTopology::TriangleList,
            strip_index_format: None,
            vertex_layouts: Vec::new(),
        };
        let blended = PipelineKey {
            blend: Some(BlendState::alpha_blending()),
            ..key.clone()
        };
        let mut cache = HashMap::new();
        cache.insert(key.clone(), 0);
        cache.insert(blended, 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key), Some(&0));
    }
}
