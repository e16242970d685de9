//! Software backend.
//!
//! Executes the pipeline programs on the CPU with a small rasterizer. It needs
//! no GPU, produces deterministic output and counts every state change, which
//! makes it the reference backend for tests.

mod raster;
mod shading;

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::ops::Range;

use glam::Vec4;

use crate::backend::traits::*;
use crate::backend::types::*;

use raster::ClipVertex;
use shading::{ShaderEnv, VertexInputs};

/// CPU-side texture; depth formats store their value in the first channel
#[derive(Debug, Clone)]
pub(crate) struct SoftTexture {
    format: TextureFormat,
    width: u32,
    height: u32,
    texels: Vec<Vec4>,
}

impl SoftTexture {
    fn new(format: TextureFormat, width: u32, height: u32) -> Self {
        let fill = if format.is_depth() { Vec4::ONE } else { Vec4::ZERO };
        Self {
            format,
            width,
            height,
            texels: vec![fill; (width as usize) * (height as usize)],
        }
    }

    pub(crate) fn load(&self, x: i64, y: i64) -> Vec4 {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return Vec4::ZERO;
        }
        self.texels[(y as usize) * (self.width as usize) + x as usize]
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y as usize) * (self.width as usize) + x as usize
    }

    fn store(&mut self, x: u32, y: u32, value: Vec4) {
        let value = if self.format.is_unorm8() {
            (value.clamp(Vec4::ZERO, Vec4::ONE) * 255.0).round() / 255.0
        } else {
            value
        };
        let index = self.index(x, y);
        self.texels[index] = value;
    }

    fn fill(&mut self, value: Vec4) {
        for y in 0..self.height {
            for x in 0..self.width {
                self.store(x, y, value);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct SoftFramebuffer {
    color: Vec<(u32, u64)>,
    depth: Option<u64>,
}

/// A "compiled" program: the kind to execute plus its live uniform values
#[derive(Debug, Clone)]
pub(crate) struct SoftProgram {
    label: String,
    kind: ProgramKind,
    layout: UniformLayout,
    pub(crate) uniforms: HashMap<String, UniformValue>,
    pub(crate) data_size: u32,
    pub(crate) enabled: bool,
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

/// Render target taken out of the texture table for the duration of a draw
struct Target {
    slot: u32,
    id: Option<u64>,
    texture: SoftTexture,
}

/// CPU reference backend
pub struct SoftwareBackend {
    capabilities: BackendCapabilities,
    stats: BackendStats,
    canvas: SoftTexture,
    buffers: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, SoftTexture>,
    framebuffers: HashMap<u64, SoftFramebuffer>,
    programs: HashMap<u64, SoftProgram>,
    vertex_arrays: HashMap<u64, VertexArrayDescriptor>,
    state: DrawState,
    failing_programs: HashSet<ProgramKind>,
    in_frame: bool,
    next_id: u64,
}

impl SoftwareBackend {
    /// Create a backend whose canvas is `width` x `height`
    pub fn new(width: u32, height: u32) -> Self {
        log::info!("SoftwareBackend: created with {}x{} canvas", width, height);
        Self {
            capabilities: BackendCapabilities::default(),
            stats: BackendStats::default(),
            canvas: SoftTexture::new(TextureFormat::Rgba8Unorm, width.max(1), height.max(1)),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            vertex_arrays: HashMap::new(),
            state: DrawState::default(),
            failing_programs: HashSet::new(),
            in_frame: false,
            next_id: 1,
        }
    }

    /// Override the reported capabilities, e.g. to emulate a device without
    /// float render targets
    pub fn with_capabilities(mut self, capabilities: BackendCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make every later compilation of `kind` fail
    pub fn fail_compilation(&mut self, kind: ProgramKind) {
        self.failing_programs.insert(kind);
    }

    /// Current value of a program uniform, as last uploaded
    pub fn uniform(&self, program: ProgramHandle, name: &str) -> Option<UniformValue> {
        self.programs.get(&program.0)?.uniforms.get(name).copied()
    }

    /// Number of live programs
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn compile(&self, desc: &ProgramDescriptor) -> BackendResult<SoftProgram> {
        let failure = |message: String| BackendError::ShaderCompilationFailed {
            label: desc.label.clone(),
            message,
        };

        if self.failing_programs.contains(&desc.kind) {
            return Err(failure("compilation disabled for this program".to_string()));
        }
        if desc.source.trim().is_empty() {
            return Err(failure("empty source".to_string()));
        }

        let data_size = match desc.define("DATA_SIZE") {
            Some(value) => value
                .trim_end_matches('u')
                .parse::<u32>()
                .map_err(|e| failure(format!("invalid DATA_SIZE '{}': {}", value, e)))?,
            None => 1,
        };
        if data_size == 0 {
            return Err(failure("DATA_SIZE must be at least 1".to_string()));
        }
        let enabled = match desc.define("ENABLED") {
            Some(value) => value
                .parse::<bool>()
                .map_err(|e| failure(format!("invalid ENABLED '{}': {}", value, e)))?,
            None => true,
        };

        Ok(SoftProgram {
            label: desc.label.clone(),
            kind: desc.kind,
            layout: UniformLayout::new(&desc.uniforms),
            uniforms: HashMap::new(),
            data_size,
            enabled,
        })
    }

    fn take_targets(&mut self) -> Option<(Vec<Target>, Option<(u64, SoftTexture)>)> {
        match self.state.framebuffer {
            None | Some(FramebufferHandle::CANVAS) => {
                let canvas = std::mem::replace(
                    &mut self.canvas,
                    SoftTexture::new(TextureFormat::Rgba8Unorm, 0, 0),
                );
                Some((
                    vec![Target {
                        slot: 0,
                        id: None,
                        texture: canvas,
                    }],
                    None,
                ))
            }
            Some(handle) => {
                let framebuffer = self.framebuffers.get(&handle.0)?.clone();
                let mut targets = Vec::with_capacity(framebuffer.color.len());
                for (slot, id) in framebuffer.color {
                    if let Some(texture) = self.textures.remove(&id) {
                        targets.push(Target {
                            slot,
                            id: Some(id),
                            texture,
                        });
                    }
                }
                let depth = framebuffer
                    .depth
                    .and_then(|id| self.textures.remove(&id).map(|texture| (id, texture)));
                Some((targets, depth))
            }
        }
    }

    fn restore_targets(&mut self, targets: Vec<Target>, depth: Option<(u64, SoftTexture)>) {
        for target in targets {
            match target.id {
                Some(id) => {
                    self.textures.insert(id, target.texture);
                }
                None => self.canvas = target.texture,
            }
        }
        if let Some((id, texture)) = depth {
            self.textures.insert(id, texture);
        }
    }

    fn fetch_vertex(&self, desc: &VertexArrayDescriptor, vertex: u32, instance: u32) -> VertexInputs {
        let mut inputs: VertexInputs = [Vec4::W; 8];
        for binding in &desc.buffers {
            let Some(data) = self.buffers.get(&binding.buffer.0) else {
                continue;
            };
            let element = match binding.layout.step_mode {
                VertexStepMode::Vertex => vertex,
                VertexStepMode::Instance => instance,
            } as u64;
            for attribute in &binding.layout.attributes {
                let start = (element * binding.layout.array_stride + attribute.offset) as usize;
                let Some(bytes) = data.get(start..start + attribute.format.size() as usize) else {
                    continue;
                };
                if let Some(slot) = inputs.get_mut(attribute.location as usize) {
                    *slot = decode_attribute(attribute.format, bytes);
                }
            }
        }
        inputs
    }

    fn read_indices(&self, desc: &VertexArrayDescriptor, range: Range<u32>) -> Option<Vec<u32>> {
        let (buffer, format) = desc.index_buffer?;
        let data = self.buffers.get(&buffer.0)?;
        let size = format.size() as usize;
        range
            .map(|i| {
                let start = i as usize * size;
                let bytes = data.get(start..start + size)?;
                Some(match format {
                    IndexFormat::Uint16 => u16::from_ne_bytes([bytes[0], bytes[1]]) as u32,
                    IndexFormat::Uint32 => {
                        u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
                    }
                })
            })
            .collect()
    }

    fn execute(&mut self, topology: PrimitiveTopology, vertices: Vec<u32>, instances: u32) {
        let Some(program_handle) = self.state.program else {
            log::warn!("SoftwareBackend: draw without a program");
            return;
        };
        let Some(vertex_array) = self
            .state
            .vertex_array
            .and_then(|handle| self.vertex_arrays.get(&handle.0))
            .cloned()
        else {
            log::warn!("SoftwareBackend: draw without a vertex array");
            return;
        };
        let Some((mut targets, mut depth)) = self.take_targets() else {
            log::warn!("SoftwareBackend: draw into unknown framebuffer");
            return;
        };
        self.stats.draw_calls += 1;

        let (width, height) = match targets.first() {
            Some(target) => (target.texture.width, target.texture.height),
            None => self.state.viewport.unwrap_or((0, 0)),
        };
        let (width, height) = match self.state.viewport {
            Some((w, h)) => (w.min(width), h.min(height)),
            None => (width, height),
        };
        let depth_test = self.state.depth_test;
        let blend = self.state.blend;

        if let Some(program) = self.programs.get(&program_handle.0) {
            let env = ShaderEnv {
                program,
                textures: &self.textures,
                units: &self.state.textures,
                block: self
                    .state
                    .uniform_block
                    .and_then(|buffer| self.buffers.get(&buffer.0))
                    .map(|data| data.as_slice()),
            };
            let kind = program.kind;

            for instance in 0..instances {
                let transformed: Vec<ClipVertex> = vertices
                    .iter()
                    .map(|&v| shading::vertex(kind, &env, &self.fetch_vertex(&vertex_array, v, instance)))
                    .collect();

                for [a, b, c] in raster::assemble(topology, transformed.len()) {
                    let triangle = [&transformed[a], &transformed[b], &transformed[c]];
                    raster::rasterize_triangle(triangle, width, height, |fragment| {
                        if depth_test {
                            if let Some((_, depth)) = depth.as_ref() {
                                if fragment.depth >= depth.load(fragment.x as i64, fragment.y as i64).x {
                                    return;
                                }
                            }
                        }
                        let Some(outputs) =
                            shading::fragment(kind, &env, fragment.x, fragment.y, &fragment.varyings)
                        else {
                            return;
                        };
                        for target in targets.iter_mut() {
                            let Some(Some(src)) = outputs.get(target.slot as usize) else {
                                continue;
                            };
                            let dst = target.texture.load(fragment.x as i64, fragment.y as i64);
                            let value = match blend {
                                Some(state) => apply_blend(&state, *src, dst),
                                None => *src,
                            };
                            target.texture.store(fragment.x, fragment.y, value);
                        }
                        if depth_test {
                            if let Some((_, depth)) = depth.as_mut() {
                                depth.store(fragment.x, fragment.y, Vec4::splat(fragment.depth));
                            }
                        }
                    });
                }
            }
        } else {
            log::warn!("SoftwareBackend: draw with destroyed program");
        }

        self.restore_targets(targets, depth.take());
    }
}

fn decode_attribute(format: VertexFormat, bytes: &[u8]) -> Vec4 {
    let word = |i: usize| [bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]];
    let float = |i: usize| f32::from_ne_bytes(word(i));
    match format {
        VertexFormat::Float32 => Vec4::new(float(0), 0.0, 0.0, 1.0),
        VertexFormat::Float32x2 => Vec4::new(float(0), float(1), 0.0, 1.0),
        VertexFormat::Float32x3 => Vec4::new(float(0), float(1), float(2), 1.0),
        VertexFormat::Float32x4 => Vec4::new(float(0), float(1), float(2), float(3)),
        VertexFormat::Uint32 => Vec4::new(u32::from_ne_bytes(word(0)) as f32, 0.0, 0.0, 1.0),
        VertexFormat::Sint32 => Vec4::new(i32::from_ne_bytes(word(0)) as f32, 0.0, 0.0, 1.0),
    }
}

fn blend_factor(factor: BlendFactor, src: f32, dst: f32, src_alpha: f32, dst_alpha: f32) -> f32 {
    match factor {
        BlendFactor::Zero => 0.0,
        BlendFactor::One => 1.0,
        BlendFactor::Src => src,
        BlendFactor::OneMinusSrc => 1.0 - src,
        BlendFactor::SrcAlpha => src_alpha,
        BlendFactor::OneMinusSrcAlpha => 1.0 - src_alpha,
        BlendFactor::Dst => dst,
        BlendFactor::OneMinusDst => 1.0 - dst,
        BlendFactor::DstAlpha => dst_alpha,
        BlendFactor::OneMinusDstAlpha => 1.0 - dst_alpha,
    }
}

fn blend_channel(component: &BlendComponent, src: f32, dst: f32, src_alpha: f32, dst_alpha: f32) -> f32 {
    let s = src * blend_factor(component.src_factor, src, dst, src_alpha, dst_alpha);
    let d = dst * blend_factor(component.dst_factor, src, dst, src_alpha, dst_alpha);
    match component.operation {
        BlendOperation::Add => s + d,
        BlendOperation::Subtract => s - d,
        BlendOperation::ReverseSubtract => d - s,
        BlendOperation::Min => src.min(dst),
        BlendOperation::Max => src.max(dst),
    }
}

fn apply_blend(state: &BlendState, src: Vec4, dst: Vec4) -> Vec4 {
    Vec4::new(
        blend_channel(&state.color, src.x, dst.x, src.w, dst.w),
        blend_channel(&state.color, src.y, dst.y, src.w, dst.w),
        blend_channel(&state.color, src.z, dst.z, src.w, dst.w),
        blend_channel(&state.alpha, src.w, dst.w, src.w, dst.w),
    )
}

impl GraphicsBackend for SoftwareBackend {
    fn name(&self) -> &'static str {
        "Software Backend"
    }

    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn stats(&self) -> &BackendStats {
        &self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = BackendStats::default();
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        if self.in_frame {
            log::warn!("SoftwareBackend: begin_frame called twice");
        }
        self.in_frame = true;
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.in_frame = false;
        Ok(())
    }

    fn canvas_size(&self) -> (u32, u32) {
        (self.canvas.width, self.canvas.height)
    }

    fn resize_canvas(&mut self, width: u32, height: u32) {
        log::debug!("SoftwareBackend: canvas resized to {}x{}", width, height);
        self.canvas = SoftTexture::new(self.canvas.format, width.max(1), height.max(1));
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "SoftwareBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = self.allocate_id();
        self.buffers.insert(id, vec![0; desc.size as usize]);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        if let Some(buffer) = self.buffers.get_mut(&handle.0) {
            let len = data.len().min(buffer.len());
            buffer[..len].copy_from_slice(&data[..len]);
        }
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let Some(target) = self.buffers.get_mut(&buffer.0) else {
            log::warn!("SoftwareBackend: write to unknown buffer {:?}", buffer);
            return;
        };
        let start = offset as usize;
        let Some(slice) = target.get_mut(start..start + data.len()) else {
            log::warn!(
                "SoftwareBackend: write of {} bytes at {} overflows buffer of {}",
                data.len(),
                offset,
                target.len()
            );
            return;
        };
        slice.copy_from_slice(data);
        self.stats.buffer_writes += 1;
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "SoftwareBackend: creating texture {:?} ({}x{} {:?})",
            desc.label,
            desc.width,
            desc.height,
            desc.format
        );
        let max = self.capabilities.max_texture_dimension;
        if desc.width > max || desc.height > max {
            return Err(BackendError::ResourceCreationFailed(format!(
                "texture {}x{} exceeds the {} limit",
                desc.width, desc.height, max
            )));
        }
        let id = self.allocate_id();
        self.textures
            .insert(id, SoftTexture::new(desc.format, desc.width, desc.height));
        Ok(TextureHandle(id))
    }

    fn resize_texture(&mut self, texture: TextureHandle, width: u32, height: u32) {
        match self.textures.get_mut(&texture.0) {
            Some(existing) => *existing = SoftTexture::new(existing.format, width, height),
            None => log::warn!("SoftwareBackend: resize of unknown texture {:?}", texture),
        }
    }

    fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)> {
        self.textures.get(&texture.0).map(|t| (t.width, t.height))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        let mut color = Vec::with_capacity(desc.color_attachments.len());
        for (slot, texture) in &desc.color_attachments {
            if !self.textures.contains_key(&texture.0) {
                return Err(BackendError::InvalidHandle(format!(
                    "color attachment {} of {:?}",
                    slot, desc.label
                )));
            }
            color.push((*slot, texture.0));
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
        self.framebuffers.insert(
            id,
            SoftFramebuffer {
                color,
                depth: desc.depth_attachment.map(|t| t.0),
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn create_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        let program = self.compile(desc)?;
        self.stats.program_compilations += 1;
        log::debug!(
            "SoftwareBackend: compiled program '{}' ({:?}, DATA_SIZE={})",
            program.label,
            program.kind,
            program.data_size
        );
        let id = self.allocate_id();
        self.programs.insert(id, program);
        Ok(ProgramHandle(id))
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
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
            log::warn!("SoftwareBackend: uniform '{}' set on unknown program", name);
            return;
        };
        let declared = if target.layout.samplers.contains_key(name) {
            Some(UniformType::Int)
        } else {
            target.layout.offsets.get(name).map(|(_, ty)| *ty)
        };
        match declared {
            Some(ty) if ty == value.uniform_type() => {
                log::trace!("SoftwareBackend: {}.{} = {:?}", target.label, name, value);
                target.uniforms.insert(name.to_string(), value);
            }
            Some(ty) => log::warn!(
                "SoftwareBackend: uniform '{}' of '{}' is {:?}, got {:?}",
                name,
                target.label,
                ty,
                value.uniform_type()
            ),
            None => log::trace!(
                "SoftwareBackend: program '{}' has no uniform '{}'",
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
        let Some((mut targets, mut depth_target)) = self.take_targets() else {
            log::warn!("SoftwareBackend: clear of unknown framebuffer");
            return;
        };
        self.stats.clears += 1;
        if let Some(color) = color {
            for target in targets.iter_mut() {
                target.texture.fill(Vec4::from_array(color));
            }
        }
        if let (Some(value), Some((_, texture))) = (depth, depth_target.as_mut()) {
            texture.fill(Vec4::splat(value));
        }
        self.restore_targets(targets, depth_target);
    }

    fn draw(&mut self, topology: PrimitiveTopology, vertices: Range<u32>, instances: u32) {
        self.execute(topology, vertices.collect(), instances);
    }

    fn draw_indexed(&mut self, topology: PrimitiveTopology, indices: Range<u32>, instances: u32) {
        let Some(vertex_array) = self
            .state
            .vertex_array
            .and_then(|handle| self.vertex_arrays.get(&handle.0))
        else {
            log::warn!("SoftwareBackend: indexed draw without a vertex array");
            return;
        };
        let Some(vertices) = self.read_indices(vertex_array, indices) else {
            log::warn!("SoftwareBackend: indexed draw with missing or short index buffer");
            return;
        };
        self.execute(topology, vertices, instances);
    }

    fn read_pixels(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: u32,
        rect: (u32, u32, u32, u32),
    ) -> BackendResult<Vec<[f32; 4]>> {
        let texture = if framebuffer == FramebufferHandle::CANVAS {
            &self.canvas
        } else {
            let fb = self.framebuffers.get(&framebuffer.0).ok_or_else(|| {
                BackendError::InvalidHandle(format!("framebuffer {:?}", framebuffer))
            })?;
            let id = fb
                .color
                .iter()
                .find(|(slot, _)| *slot == attachment)
                .map(|(_, id)| *id)
                .ok_or_else(|| {
                    BackendError::ReadbackFailed(format!("no color attachment {}", attachment))
                })?;
            self.textures
                .get(&id)
                .ok_or_else(|| BackendError::InvalidHandle(format!("texture {}", id)))?
        };

        let (x, y, width, height) = rect;
        if x + width > texture.width || y + height > texture.height {
            return Err(BackendError::ReadbackFailed(format!(
                "rect {:?} outside {}x{}",
                rect, texture.width, texture.height
            )));
        }
        let mut pixels = Vec::with_capacity((width * height) as usize);
        for row in y..y + height {
            for col in x..x + width {
                pixels.push(texture.texels[texture.index(col, row)].to_array());
            }
        }
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

    const FULLSCREEN: [[f32; 2]; 3] = [[-1.0, -1.0], [3.0, -1.0], [-1.0, 3.0]];

    fn fullscreen_vertex_array(backend: &mut SoftwareBackend) -> VertexArrayHandle {
        let buffer = backend
            .create_buffer_init(
                &BufferDescriptor {
                    label: None,
                    size: 24,
                    usage: BufferUsage::VERTEX,
                },
                bytemuck::cast_slice(&FULLSCREEN),
            )
            .unwrap();
        backend
            .create_vertex_array(&VertexArrayDescriptor {
                label: None,
                buffers: vec![VertexBufferBinding {
                    buffer,
                    layout: VertexBufferLayout {
                        array_stride: 8,
                        step_mode: VertexStepMode::Vertex,
                        attributes: vec![VertexAttribute {
                            location: 0,
                            format: VertexFormat::Float32x2,
                            offset: 0,
                        }],
                    },
                }],
                index_buffer: None,
            })
            .unwrap()
    }

    fn texture(backend: &mut SoftwareBackend, format: TextureFormat) -> TextureHandle {
        backend
            .create_texture(&TextureDescriptor {
                width: 4,
                height: 4,
                format,
                ..Default::default()
            })
            .unwrap()
    }

    fn accumulate_program(backend: &mut SoftwareBackend) -> ProgramHandle {
        backend
            .create_program(&ProgramDescriptor {
                label: "Accumulate".to_string(),
                kind: ProgramKind::Accumulate,
                source: "fn fs_main() {}".to_string(),
                defines: Vec::new(),
                uniforms: vec![
                    UniformDecl::new("u_merged", UniformType::Sampler),
                    UniformDecl::new("u_alpha", UniformType::Float),
                ],
                uniform_block: false,
            })
            .unwrap()
    }

    #[test]
    fn test_clear_and_read_back() {
        let mut backend = SoftwareBackend::new(4, 4);
        let color = texture(&mut backend, TextureFormat::Rgba16Float);
        let fb = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                color_attachments: vec![(0, color)],
                depth_attachment: None,
            })
            .unwrap();

        backend.bind_framebuffer(fb);
        backend.clear(Some([0.25, 0.5, 0.75, 1.0]), None);
        let pixels = backend.read_pixels(fb, 0, (0, 0, 4, 4)).unwrap();
        assert_eq!(pixels.len(), 16);
        assert!(pixels.iter().all(|p| *p == [0.25, 0.5, 0.75, 1.0]));
        assert_eq!(backend.stats().clears, 1);
    }

    #[test]
    fn test_unorm_targets_quantize() {
        let mut backend = SoftwareBackend::new(2, 2);
        backend.bind_framebuffer(FramebufferHandle::CANVAS);
        backend.clear(Some([1.5, -0.5, 0.1, 1.0]), None);
        let pixel = backend
            .read_pixels(FramebufferHandle::CANVAS, 0, (0, 0, 1, 1))
            .unwrap()[0];
        assert_eq!(pixel[0], 1.0);
        assert_eq!(pixel[1], 0.0);
        assert!((pixel[2] - 26.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_alpha_blended_fullscreen_draw() {
        let mut backend = SoftwareBackend::new(4, 4);
        let source = texture(&mut backend, TextureFormat::Rgba16Float);
        let target = texture(&mut backend, TextureFormat::Rgba16Float);
        let source_fb = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                color_attachments: vec![(0, source)],
                depth_attachment: None,
            })
            .unwrap();
        let target_fb = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                color_attachments: vec![(0, target)],
                depth_attachment: None,
            })
            .unwrap();

        backend.bind_framebuffer(source_fb);
        backend.clear(Some([1.0, 1.0, 1.0, 1.0]), None);
        backend.bind_framebuffer(target_fb);
        backend.clear(Some([0.0, 0.0, 0.0, 0.0]), None);

        let program = accumulate_program(&mut backend);
        let vao = fullscreen_vertex_array(&mut backend);
        backend.set_uniform(program, "u_merged", UniformValue::Int(0));
        backend.set_uniform(program, "u_alpha", UniformValue::Float(0.25));
        backend.use_program(Some(program));
        backend.bind_texture(0, Some(source));
        backend.bind_vertex_array(Some(vao));
        backend.set_blend(Some(BlendState::alpha_blending()));
        backend.draw(PrimitiveTopology::TriangleList, 0..3, 1);

        let pixels = backend.read_pixels(target_fb, 0, (0, 0, 4, 4)).unwrap();
        assert!(pixels.iter().all(|p| (p[0] - 0.25).abs() < 1e-6));
        assert_eq!(backend.stats().draw_calls, 1);
        assert_eq!(backend.stats().uniform_uploads("u_alpha"), 1);
    }

    #[test]
    fn test_uniform_type_mismatch_is_ignored() {
        let mut backend = SoftwareBackend::new(1, 1);
        let program = accumulate_program(&mut backend);
        backend.set_uniform(program, "u_alpha", UniformValue::Int(3));
        assert_eq!(backend.uniform(program, "u_alpha"), None);
        backend.set_uniform(program, "u_alpha", UniformValue::Float(0.5));
        assert_eq!(
            backend.uniform(program, "u_alpha"),
            Some(UniformValue::Float(0.5))
        );
        assert_eq!(backend.stats().uniform_uploads("u_alpha"), 2);
    }

    #[test]
    fn test_injected_compile_failure() {
        let mut backend = SoftwareBackend::new(1, 1);
        backend.fail_compilation(ProgramKind::Accumulate);
        let result = backend.create_program(&ProgramDescriptor {
            label: "Accumulate".to_string(),
            kind: ProgramKind::Accumulate,
            source: "fn fs_main() {}".to_string(),
            defines: Vec::new(),
            uniforms: Vec::new(),
            uniform_block: false,
        });
        assert!(matches!(
            result,
            Err(BackendError::ShaderCompilationFailed { .. })
        ));
        assert_eq!(backend.stats().program_compilations, 0);
    }

    #[test]
    fn test_invalid_data_size_define() {
        let mut backend = SoftwareBackend::new(1, 1);
        let result = backend.create_program(&ProgramDescriptor {
            label: "Ambient Light".to_string(),
            kind: ProgramKind::AmbientLight,
            source: "const DATA_SIZE: u32 = 1u;".to_string(),
            defines: vec![("DATA_SIZE".to_string(), "many".to_string())],
            uniforms: Vec::new(),
            uniform_block: true,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_resize_keeps_handle() {
        let mut backend = SoftwareBackend::new(1, 1);
        let handle = texture(&mut backend, TextureFormat::Rgba8Unorm);
        backend.resize_texture(handle, 7, 3);
        assert_eq!(backend.texture_size(handle), Some((7, 3)));
    }
}
