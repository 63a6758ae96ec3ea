//! The per-frame interpreter.
//!
//! A [`Dispatcher`] borrows a decoded module and drives one [`Backend`]
//! through the full run: `init` executes every creation opcode once and
//! indexes the pass and frame regions, `frame` refreshes uniforms and
//! replays the active frame's region, `shutdown` releases handles in reverse
//! creation order. The backend is a type parameter, so mock, recorder and
//! real drivers all monomorphize; there is no dynamic dispatch on the frame
//! path and no allocation after `init` beyond first-fire bookkeeping.
//!
//! Pass encoding is guarded by a small state machine: draws need an open
//! render pass, dispatches an open compute pass, and a second `begin` without
//! an intervening `end_pass` is fatal.

pub mod command;

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::backend::{Backend, IndexFormat, PipelineKind, ResourceKind};
use crate::pngb::op::Op;
use crate::pngb::{varint, Module, SOURCE_PNGINE_INPUTS, SOURCE_SCENE_TIME, SOURCE_USER_BASE};
use crate::scene::BufferUsages;
use crate::uniforms::{PngineInputs, SceneTimeInputs};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher has not been initialized")]
    NotInitialized,
    #[error("opcode stream ended unexpectedly")]
    TruncatedStream,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("`{op}` is not valid in the current pass state")]
    BadPassState { op: &'static str },
    #[error("no {kind:?} with id {id}")]
    UnknownResource { kind: ResourceKind, id: u16 },
    #[error("no pass with id {id}")]
    UnknownPass { id: u16 },
    #[error("no frame named `{name}`")]
    UnknownFrame { name: String },
    #[error("module defines no frames")]
    NoFrames,
    #[error("buffer {id} holds {actual} bytes where {expected} are required")]
    UniformSizeMismatch { id: u16, expected: u32, actual: u32 },
    #[error("data blob {data_id} is not a valid descriptor")]
    BadDescriptor { data_id: u16 },
    #[error("backend failed to create {kind:?} {id}: {message}")]
    Backend {
        kind: ResourceKind,
        id: u16,
        message: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EncoderState {
    NotEncoding,
    InRenderPass,
    InComputePass,
}

#[derive(Clone, Copy)]
struct PassRegion {
    /// Stream offset of the first op after `define_pass`.
    start: usize,
    kind: u32,
}

#[derive(Clone, Copy)]
struct FrameRegion {
    id: u16,
    name: u16,
    /// Stream offset of the first op after `define_frame`.
    start: usize,
}

pub struct Dispatcher<'m, B: Backend> {
    module: &'m Module,
    backend: B,
    initialized: bool,
    frame_counter: u32,
    passes: HashMap<u16, PassRegion>,
    frames: Vec<FrameRegion>,
    active_frame: Option<usize>,
    once_fired: HashSet<u16>,
    buffer_pools: HashMap<u16, u16>,
    buffer_sizes: HashMap<u16, u32>,
    group_pools: HashMap<u16, u16>,
    created: Vec<(ResourceKind, u16)>,
}

impl<'m, B: Backend> Dispatcher<'m, B> {
    pub fn new(module: &'m Module, backend: B) -> Self {
        Self {
            module,
            backend,
            initialized: false,
            frame_counter: 0,
            passes: HashMap::new(),
            frames: Vec::new(),
            active_frame: None,
            once_fired: HashSet::new(),
            buffer_pools: HashMap::new(),
            buffer_sizes: HashMap::new(),
            group_pools: HashMap::new(),
            created: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    /// Execute every resource-creation opcode once, index the pass and frame
    /// regions, and submit the creation batch. A creation failure unwinds
    /// everything created so far, in reverse order.
    pub fn init(&mut self) -> Result<(), DispatchError> {
        let mut reader = Reader::new(&self.module.ops);
        loop {
            let result = reader
                .op()
                .and_then(|op| self.init_step(op, &mut reader));
            match result {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => {
                    for (kind, id) in self.created.drain(..).rev() {
                        self.backend.destroy(kind, id);
                    }
                    return Err(err);
                }
            }
        }
        self.active_frame = if self.frames.is_empty() { None } else { Some(0) };
        self.initialized = true;
        Ok(())
    }

    /// One init-phase opcode; `Ok(false)` means the stream ended.
    fn init_step(&mut self, op: Op, reader: &mut Reader<'_>) -> Result<bool, DispatchError> {
        match op {
            Op::CreateBuffer => {
                let id = reader.id()?;
                let size = reader.operand()?;
                let usage = BufferUsages::from_bits_truncate(reader.operand()?);
                let pool = reader.id()?;
                let data_plus_one = reader.operand()?;
                let data = match data_plus_one {
                    0 => None,
                    d => Some(self.data_blob((d - 1) as u16)?),
                };
                self.backend
                    .create_buffer(id, size, usage, data)
                    .map_err(|e| self.creation_error(ResourceKind::Buffer, id, e))?;
                self.buffer_pools.insert(id, pool.max(1));
                self.buffer_sizes.insert(id, size);
                self.created.push((ResourceKind::Buffer, id));
            }
            Op::CreateTexture => {
                let id = reader.id()?;
                let json = self.data_str(reader.id()?)?;
                self.backend
                    .create_texture(id, json)
                    .map_err(|e| self.creation_error(ResourceKind::Texture, id, e))?;
                self.created.push((ResourceKind::Texture, id));
            }
            Op::CreateSampler => {
                let id = reader.id()?;
                let json = self.data_str(reader.id()?)?;
                self.backend
                    .create_sampler(id, json)
                    .map_err(|e| self.creation_error(ResourceKind::Sampler, id, e))?;
                self.created.push((ResourceKind::Sampler, id));
            }
            Op::CreateShaderModule => {
                let id = reader.id()?;
                let wgsl_id = reader.id()?;
                let source = self.concatenated_source(wgsl_id)?;
                self.backend
                    .create_shader_module(id, &source)
                    .map_err(|e| self.creation_error(ResourceKind::ShaderModule, id, e))?;
                self.created.push((ResourceKind::ShaderModule, id));
            }
            Op::CreateBindGroupLayout => {
                let id = reader.id()?;
                let json = self.data_str(reader.id()?)?;
                self.backend
                    .create_bind_group_layout(id, json)
                    .map_err(|e| self.creation_error(ResourceKind::BindGroupLayout, id, e))?;
                self.created.push((ResourceKind::BindGroupLayout, id));
            }
            Op::CreatePipelineLayout => {
                let id = reader.id()?;
                let count = reader.operand()?;
                let mut layouts = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    layouts.push(reader.id()?);
                }
                self.backend
                    .create_pipeline_layout(id, &layouts)
                    .map_err(|e| self.creation_error(ResourceKind::PipelineLayout, id, e))?;
                self.created.push((ResourceKind::PipelineLayout, id));
            }
            Op::CreateRenderPipeline => {
                let id = reader.id()?;
                let json = self.data_str(reader.id()?)?;
                self.backend
                    .create_render_pipeline(id, json)
                    .map_err(|e| self.creation_error(ResourceKind::RenderPipeline, id, e))?;
                self.created.push((ResourceKind::RenderPipeline, id));
            }
            Op::CreateComputePipeline => {
                let id = reader.id()?;
                let json = self.data_str(reader.id()?)?;
                self.backend
                    .create_compute_pipeline(id, json)
                    .map_err(|e| self.creation_error(ResourceKind::ComputePipeline, id, e))?;
                self.created.push((ResourceKind::ComputePipeline, id));
            }
            Op::CreateBindGroup => {
                let id = reader.id()?;
                let json_id = reader.id()?;
                let pool = reader.id()?;
                let json = self.data_str(json_id)?;
                self.backend
                    .create_bind_group(id, json)
                    .map_err(|e| self.creation_error(ResourceKind::BindGroup, id, e))?;
                self.group_pools.insert(id, pool.max(1));
                self.created.push((ResourceKind::BindGroup, id));
            }
            Op::Submit => self.backend.submit(),
            Op::DefinePass => {
                let id = reader.id()?;
                let kind = reader.operand()?;
                let start = reader.pos;
                log::trace!("pass {id} (kind {kind}) defined at offset {start}");
                self.passes.insert(id, PassRegion { start, kind });
                reader.skip_region(Op::EndPass)?;
            }
            Op::DefineFrame => {
                let id = reader.id()?;
                let name = reader.id()?;
                let start = reader.pos;
                self.frames.push(FrameRegion { id, name, start });
                reader.skip_region(Op::EndFrame)?;
            }
            Op::End => return Ok(false),
            other => {
                return Err(DispatchError::BadPassState { op: other.name() });
            }
        }
        Ok(true)
    }

    /// Execute the active frame: refresh every uniform-table entry, replay
    /// the frame's region, submit, and advance the frame counter.
    pub fn frame(
        &mut self,
        time: f32,
        width: u32,
        height: u32,
        inputs: &[(&str, &[u8])],
    ) -> Result<(), DispatchError> {
        if !self.initialized {
            return Err(DispatchError::NotInitialized);
        }
        let pngine_inputs = PngineInputs::new(time, width, height);
        let scene_time = self.select_scene(time);
        self.refresh_uniforms(&pngine_inputs, scene_time, inputs)?;

        let frame = self.active_frame.ok_or(DispatchError::NoFrames)?;
        let start = self.frames[frame].start;
        self.run_frame_region(start)?;
        self.backend.submit();
        self.frame_counter += 1;
        Ok(())
    }

    /// Select the active frame from the animation table. Returns the scene
    /// time block when a scene window covers `time`.
    fn select_scene(&mut self, time: f32) -> Option<SceneTimeInputs> {
        let time_ms = (time.max(0.0) * 1000.0) as u64;
        let scene = self.module.animations.iter().find(|scene| {
            let start = u64::from(scene.start_ms);
            start <= time_ms && time_ms < start + u64::from(scene.duration_ms)
        })?;
        if let Some(position) = self
            .frames
            .iter()
            .position(|frame| frame.id == scene.frame_id)
        {
            self.active_frame = Some(position);
        }
        let scene_time = (time_ms - u64::from(scene.start_ms)) as f32 / 1000.0;
        let duration = scene.duration_ms as f32 / 1000.0;
        Some(SceneTimeInputs::new(scene_time, duration))
    }

    fn refresh_uniforms(
        &mut self,
        pngine_inputs: &PngineInputs,
        scene_time: Option<SceneTimeInputs>,
        user: &[(&str, &[u8])],
    ) -> Result<(), DispatchError> {
        for entry in &self.module.uniforms {
            let size = *self
                .buffer_sizes
                .get(&entry.buffer_id)
                .ok_or(DispatchError::UnknownResource {
                    kind: ResourceKind::Buffer,
                    id: entry.buffer_id,
                })?;
            if u32::from(entry.offset) + u32::from(entry.size) > size {
                return Err(DispatchError::UniformSizeMismatch {
                    id: entry.buffer_id,
                    expected: u32::from(entry.offset) + u32::from(entry.size),
                    actual: size,
                });
            }
            match entry.source {
                SOURCE_PNGINE_INPUTS => {
                    if entry.size != 16 {
                        return Err(DispatchError::UniformSizeMismatch {
                            id: entry.buffer_id,
                            expected: 16,
                            actual: u32::from(entry.size),
                        });
                    }
                    self.backend.write_buffer(
                        entry.buffer_id,
                        u32::from(entry.offset),
                        pngine_inputs.as_bytes(),
                    );
                }
                SOURCE_SCENE_TIME => {
                    let Some(block) = scene_time else { continue };
                    if entry.size != 12 {
                        return Err(DispatchError::UniformSizeMismatch {
                            id: entry.buffer_id,
                            expected: 12,
                            actual: u32::from(entry.size),
                        });
                    }
                    self.backend.write_buffer(
                        entry.buffer_id,
                        u32::from(entry.offset),
                        block.as_bytes(),
                    );
                }
                source => {
                    let name = match self
                        .module
                        .strings
                        .get((source - SOURCE_USER_BASE) as usize)
                    {
                        Some(name) => name.as_str(),
                        None => continue,
                    };
                    let Some((_, bytes)) = user.iter().find(|(key, _)| *key == name) else {
                        continue;
                    };
                    if bytes.len() as u32 != u32::from(entry.size) {
                        return Err(DispatchError::UniformSizeMismatch {
                            id: entry.buffer_id,
                            expected: u32::from(entry.size),
                            actual: bytes.len() as u32,
                        });
                    }
                    self.backend
                        .write_buffer(entry.buffer_id, u32::from(entry.offset), bytes);
                }
            }
        }
        Ok(())
    }

    /// Switch the active frame by name.
    pub fn set_frame(&mut self, name: &str) -> Result<(), DispatchError> {
        let found = self.frames.iter().position(|frame| {
            self.module
                .strings
                .get(frame.name as usize)
                .is_some_and(|candidate| candidate == name)
        });
        match found {
            Some(position) => {
                self.active_frame = Some(position);
                Ok(())
            }
            None => Err(DispatchError::UnknownFrame {
                name: name.to_string(),
            }),
        }
    }

    /// Release every backend handle in reverse creation order.
    pub fn shutdown(&mut self) {
        for (kind, id) in self.created.drain(..).rev() {
            self.backend.destroy(kind, id);
        }
        self.backend.end();
        self.initialized = false;
    }

    fn run_frame_region(&mut self, start: usize) -> Result<(), DispatchError> {
        let mut reader = Reader::at(&self.module.ops, start);
        loop {
            match reader.op()? {
                Op::ExecPass => {
                    let id = reader.id()?;
                    self.run_pass(id)?;
                }
                Op::ExecPassOnce => {
                    let id = reader.id()?;
                    if self.once_fired.contains(&id) {
                        continue;
                    }
                    self.once_fired.insert(id);
                    self.run_pass(id)?;
                }
                Op::EndFrame => return Ok(()),
                other => return Err(DispatchError::BadPassState { op: other.name() }),
            }
        }
    }

    fn run_pass(&mut self, id: u16) -> Result<(), DispatchError> {
        let region = *self
            .passes
            .get(&id)
            .ok_or(DispatchError::UnknownPass { id })?;
        log::trace!("exec pass {id} (kind {})", region.kind);
        let mut reader = Reader::at(&self.module.ops, region.start);
        let mut state = EncoderState::NotEncoding;
        loop {
            let op = reader.op()?;
            match op {
                Op::BeginRenderPass => {
                    let json = self.data_str(reader.id()?)?;
                    if state != EncoderState::NotEncoding {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    self.backend.begin_render_pass(json);
                    state = EncoderState::InRenderPass;
                }
                Op::BeginComputePass => {
                    if state != EncoderState::NotEncoding {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    self.backend.begin_compute_pass();
                    state = EncoderState::InComputePass;
                }
                Op::SetPipeline => {
                    let kind = reader.operand()?;
                    let pipeline = reader.id()?;
                    let (expected, kind) = match kind {
                        0 => (EncoderState::InRenderPass, PipelineKind::Render),
                        _ => (EncoderState::InComputePass, PipelineKind::Compute),
                    };
                    if state != expected {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    self.backend.set_pipeline(kind, pipeline);
                }
                Op::SetBindGroup => {
                    let slot = reader.operand()?;
                    let group = reader.id()?;
                    if state == EncoderState::NotEncoding {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    self.require_group(group)?;
                    self.backend.set_bind_group(slot, group);
                }
                Op::SetBindGroupPool => {
                    let slot = reader.operand()?;
                    let base = reader.id()?;
                    let offset = reader.operand()?;
                    if state == EncoderState::NotEncoding {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    let pool = *self.group_pools.get(&base).ok_or(
                        DispatchError::UnknownResource {
                            kind: ResourceKind::BindGroup,
                            id: base,
                        },
                    )?;
                    let actual = base + self.pool_slot(offset, pool);
                    self.backend.set_bind_group(slot, actual);
                }
                Op::SetVertexBuffer => {
                    let slot = reader.operand()?;
                    let buffer = reader.id()?;
                    if state != EncoderState::InRenderPass {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    self.require_buffer(buffer)?;
                    self.backend.set_vertex_buffer(slot, buffer);
                }
                Op::SetVertexBufferPool => {
                    let slot = reader.operand()?;
                    let base = reader.id()?;
                    let offset = reader.operand()?;
                    if state != EncoderState::InRenderPass {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    let pool = *self.buffer_pools.get(&base).ok_or(
                        DispatchError::UnknownResource {
                            kind: ResourceKind::Buffer,
                            id: base,
                        },
                    )?;
                    let actual = base + self.pool_slot(offset, pool);
                    self.backend.set_vertex_buffer(slot, actual);
                }
                Op::SetIndexBuffer => {
                    let buffer = reader.id()?;
                    let format = match reader.operand()? {
                        0 => IndexFormat::Uint16,
                        _ => IndexFormat::Uint32,
                    };
                    if state != EncoderState::InRenderPass {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    self.require_buffer(buffer)?;
                    self.backend.set_index_buffer(buffer, format);
                }
                Op::Draw => {
                    let vertices = reader.operand()?;
                    let instances = reader.operand()?;
                    if state != EncoderState::InRenderPass {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    self.backend.draw(vertices, instances);
                }
                Op::DrawIndexed => {
                    let indices = reader.operand()?;
                    let instances = reader.operand()?;
                    if state != EncoderState::InRenderPass {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    self.backend.draw_indexed(indices, instances);
                }
                Op::Dispatch => {
                    let x = reader.operand()?;
                    let y = reader.operand()?;
                    let z = reader.operand()?;
                    if state != EncoderState::InComputePass {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    self.backend.dispatch(x, y, z);
                }
                Op::WriteBuffer => {
                    let buffer = reader.id()?;
                    let offset = reader.operand()?;
                    let data_id = reader.id()?;
                    if state != EncoderState::NotEncoding {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    self.require_buffer(buffer)?;
                    let bytes = self.data_blob(data_id)?;
                    self.backend.write_buffer(buffer, offset, bytes);
                }
                Op::WriteTimeUniform => {
                    let buffer = reader.id()?;
                    if state != EncoderState::NotEncoding {
                        return Err(DispatchError::BadPassState { op: op.name() });
                    }
                    let size = *self.buffer_sizes.get(&buffer).ok_or(
                        DispatchError::UnknownResource {
                            kind: ResourceKind::Buffer,
                            id: buffer,
                        },
                    )?;
                    if size != 16 {
                        return Err(DispatchError::UniformSizeMismatch {
                            id: buffer,
                            expected: 16,
                            actual: size,
                        });
                    }
                    self.backend.write_time_uniform(buffer);
                }
                Op::EndPass => {
                    if state != EncoderState::NotEncoding {
                        self.backend.end_pass();
                    }
                    return Ok(());
                }
                other => return Err(DispatchError::BadPassState { op: other.name() }),
            }
        }
    }

    /// `actual = base + (frame + offset) % pool`.
    fn pool_slot(&self, offset: u32, pool: u16) -> u16 {
        ((self.frame_counter + offset) % u32::from(pool.max(1))) as u16
    }

    fn require_buffer(&self, id: u16) -> Result<(), DispatchError> {
        if self.buffer_sizes.contains_key(&id) {
            Ok(())
        } else {
            Err(DispatchError::UnknownResource {
                kind: ResourceKind::Buffer,
                id,
            })
        }
    }

    fn require_group(&self, id: u16) -> Result<(), DispatchError> {
        if self.group_pools.contains_key(&id) {
            Ok(())
        } else {
            Err(DispatchError::UnknownResource {
                kind: ResourceKind::BindGroup,
                id,
            })
        }
    }

    fn data_blob(&self, id: u16) -> Result<&'m [u8], DispatchError> {
        self.module
            .data
            .get(id as usize)
            .map(Vec::as_slice)
            .ok_or(DispatchError::BadDescriptor { data_id: id })
    }

    fn data_str(&self, id: u16) -> Result<&'m str, DispatchError> {
        std::str::from_utf8(self.data_blob(id)?)
            .map_err(|_| DispatchError::BadDescriptor { data_id: id })
    }

    /// A shader module's source with its transitive imports prepended in
    /// dependency order, per the WGSL table.
    fn concatenated_source(&self, wgsl_id: u16) -> Result<String, DispatchError> {
        let entry = self
            .module
            .wgsl
            .get(wgsl_id as usize)
            .ok_or(DispatchError::BadDescriptor { data_id: wgsl_id })?;
        let mut source = String::new();
        for &dep in &entry.deps {
            let dep_entry = self
                .module
                .wgsl
                .get(dep as usize)
                .ok_or(DispatchError::BadDescriptor { data_id: dep })?;
            source.push_str(self.data_str(dep_entry.data_id)?);
            source.push('\n');
        }
        source.push_str(self.data_str(entry.data_id)?);
        Ok(source)
    }

    fn creation_error(
        &self,
        kind: ResourceKind,
        id: u16,
        err: crate::backend::BackendError,
    ) -> DispatchError {
        DispatchError::Backend {
            kind,
            id,
            message: err.message,
        }
    }
}

/// Varint-aware cursor over the opcode stream.
struct Reader<'a> {
    ops: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(ops: &'a [u8]) -> Self {
        Self::at(ops, 0)
    }

    fn at(ops: &'a [u8], pos: usize) -> Self {
        Self { ops, pos }
    }

    fn op(&mut self) -> Result<Op, DispatchError> {
        let byte = *self
            .ops
            .get(self.pos)
            .ok_or(DispatchError::TruncatedStream)?;
        self.pos += 1;
        Op::from_byte(byte).ok_or(DispatchError::UnknownOpcode(byte))
    }

    fn operand(&mut self) -> Result<u32, DispatchError> {
        let (value, width) =
            varint::read(self.ops, self.pos).map_err(|_| DispatchError::TruncatedStream)?;
        self.pos += width;
        Ok(value)
    }

    fn id(&mut self) -> Result<u16, DispatchError> {
        let value = self.operand()?;
        u16::try_from(value).map_err(|_| DispatchError::TruncatedStream)
    }

    /// Skip ops (operands included) until `terminator`, leaving the cursor
    /// just past it.
    fn skip_region(&mut self, terminator: Op) -> Result<(), DispatchError> {
        loop {
            let op = self.op()?;
            if op == terminator {
                return Ok(());
            }
            if op == Op::End {
                return Err(DispatchError::TruncatedStream);
            }
            let mut last = 0u32;
            for _ in 0..op.operand_count() {
                last = self.operand()?;
            }
            if op == Op::CreatePipelineLayout {
                for _ in 0..last {
                    self.operand()?;
                }
            }
        }
    }
}
