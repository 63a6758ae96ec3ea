//! Lowering: validated scene to PNGB module.
//!
//! One linear pass in a fixed order. Resource creation comes first — WGSL
//! modules in topological import order, then buffers, textures, samplers,
//! layouts, pipelines, bind groups — followed by a `submit`, then the pass
//! regions, then the frame regions, then `end`. Tables are assembled along
//! the way and the module carries them out.
//!
//! Id assignment is dense and reproducible: every namespace hands out ids in
//! declaration order, and pooled resources occupy `pool` consecutive ids
//! starting at their base. Because the scene's maps preserve insertion order,
//! emitting the same source twice yields byte-identical modules.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::Serialize;

use crate::pngb::op::Op;
use crate::pngb::{
    varint, AnimationEntry, EmitError, Module, UniformEntry, WgslEntry, SOURCE_PNGINE_INPUTS,
    SOURCE_SCENE_TIME, SOURCE_USER_BASE, VERSION,
};
use crate::scene::{
    BindGroupDecl, BindGroupLayoutRef, BindingResource, PassRef, QueueDecl, Scene, UniformSource,
};

/// Pass kinds as stored in the `define_pass` opcode.
pub const PASS_KIND_RENDER: u32 = 0;
pub const PASS_KIND_COMPUTE: u32 = 1;
pub const PASS_KIND_QUEUE: u32 = 2;

/// Pipeline kinds as stored in the `set_pipeline` opcode.
pub const PIPELINE_KIND_RENDER: u32 = 0;
pub const PIPELINE_KIND_COMPUTE: u32 = 1;

/// Index buffer formats as stored in the `set_index_buffer` opcode.
pub const INDEX_FORMAT_UINT16: u32 = 0;
pub const INDEX_FORMAT_UINT32: u32 = 1;

/// Scene-to-module lowering, optionally carrying a platform executor image.
#[derive(Default)]
pub struct Emitter {
    executor: Option<Vec<u8>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embed an opaque platform-side interpreter image into the module.
    pub fn with_executor(mut self, bytes: Vec<u8>) -> Self {
        self.executor = Some(bytes);
        self
    }

    pub fn emit(&self, scene: &Scene) -> Result<Module, EmitError> {
        let mut state = EmitState::new(scene);
        state.assign_ids()?;
        state.data_decls()?;
        state.wgsl_table()?;
        state.wasm_calls()?;
        state.creation_ops()?;
        state.pass_regions()?;
        state.frame_regions()?;
        state.push_op(Op::End);
        state.uniform_table()?;
        state.animation_table();
        Ok(Module {
            version: VERSION,
            flags: 0,
            plugins: scene.plugins,
            executor: self.executor.clone(),
            ops: state.ops,
            strings: state.strings.into_keys().collect(),
            data: state.data,
            wgsl: state.wgsl,
            uniforms: state.uniforms,
            animations: state.animations,
        })
    }
}

/// Emit `scene` without an executor image.
pub fn emit(scene: &Scene) -> Result<Module, EmitError> {
    Emitter::new().emit(scene)
}

/// The JSON blob stored for a `create_bind_group` opcode: the resolved
/// layout reference plus entries with concrete backend ids.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BindGroupBlob {
    layout: BindGroupLayoutRef,
    entries: Vec<ResolvedEntry>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolvedEntry {
    binding: u32,
    resource: ResolvedResource,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum ResolvedResource {
    Buffer(u16),
    Sampler(u16),
    Texture(u16),
}

/// Descriptor for one `#wasmCall`: the data id of the embedded module and
/// the entry function to invoke.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WasmCallBlob {
    module: u16,
    func: String,
}

struct EmitState<'s> {
    scene: &'s Scene,
    ops: Vec<u8>,
    strings: IndexMap<String, ()>,
    data: Vec<Vec<u8>>,
    data_index: HashMap<Vec<u8>, u16>,
    wgsl: Vec<WgslEntry>,
    uniforms: Vec<UniformEntry>,
    animations: Vec<AnimationEntry>,
    /// Base runtime id per buffer declaration (pools span consecutive ids).
    buffer_base: Vec<u16>,
    /// Base runtime id per bind group declaration.
    group_base: Vec<u16>,
    /// First pass id of the compute and queue ranges; render passes start at 0.
    compute_pass_base: u16,
    queue_pass_base: u16,
}

impl<'s> EmitState<'s> {
    fn new(scene: &'s Scene) -> Self {
        Self {
            scene,
            ops: Vec::new(),
            strings: IndexMap::new(),
            data: Vec::new(),
            data_index: HashMap::new(),
            wgsl: Vec::new(),
            uniforms: Vec::new(),
            animations: Vec::new(),
            buffer_base: Vec::new(),
            group_base: Vec::new(),
            compute_pass_base: 0,
            queue_pass_base: 0,
        }
    }

    fn assign_ids(&mut self) -> Result<(), EmitError> {
        let mut next = 0u32;
        for decl in self.scene.buffers.values() {
            self.buffer_base.push(check_id(next)?);
            next += u32::from(decl.pool);
        }
        check_id(next)?;
        let mut next = 0u32;
        for decl in self.scene.bind_groups.values() {
            self.group_base.push(check_id(next)?);
            next += u32::from(decl.pool);
        }
        check_id(next)?;
        self.compute_pass_base = check_id(self.scene.render_passes.len() as u32)?;
        self.queue_pass_base = check_id(
            (self.scene.render_passes.len() + self.scene.compute_passes.len()) as u32,
        )?;
        Ok(())
    }

    fn pass_id(&self, pass: PassRef) -> u32 {
        match pass {
            PassRef::Render(id) => u32::from(id),
            PassRef::Compute(id) => u32::from(self.compute_pass_base) + u32::from(id),
            PassRef::Queue(id) => u32::from(self.queue_pass_base) + u32::from(id),
        }
    }

    // ---- table builders ---------------------------------------------------

    fn intern(&mut self, text: &str) -> Result<u16, EmitError> {
        if let Some(index) = self.strings.get_index_of(text) {
            return Ok(index as u16);
        }
        let index = self.strings.len();
        if index > u16::MAX as usize {
            return Err(EmitError::TableOverflow { table: "string" });
        }
        self.strings.insert(text.to_string(), ());
        Ok(index as u16)
    }

    fn add_data(&mut self, bytes: Vec<u8>) -> Result<u16, EmitError> {
        if let Some(&id) = self.data_index.get(&bytes) {
            return Ok(id);
        }
        let id = u16::try_from(self.data.len())
            .map_err(|_| EmitError::TableOverflow { table: "data" })?;
        self.data_index.insert(bytes.clone(), id);
        self.data.push(bytes);
        Ok(id)
    }

    fn add_json<T: Serialize>(&mut self, value: &T) -> Result<u16, EmitError> {
        let json = serde_json::to_vec(value)
            .map_err(|_| EmitError::TableOverflow { table: "data" })?;
        self.add_data(json)
    }

    /// Data declarations occupy the first data ids, in declaration order, so
    /// a scene-level data index doubles as its data-section id.
    fn data_decls(&mut self) -> Result<(), EmitError> {
        for decl in self.scene.data.values() {
            let id = u16::try_from(self.data.len())
                .map_err(|_| EmitError::TableOverflow { table: "data" })?;
            self.data_index.entry(decl.bytes.clone()).or_insert(id);
            self.data.push(decl.bytes.clone());
        }
        Ok(())
    }

    fn wgsl_table(&mut self) -> Result<(), EmitError> {
        for (index, decl) in self.scene.wgsl.values().enumerate() {
            let data_id = self.add_data(decl.source.clone().into_bytes())?;
            let mut deps = self.scene.wgsl_closure(index as u16);
            deps.pop();
            self.wgsl.push(WgslEntry { data_id, deps });
        }
        Ok(())
    }

    /// Wasm calls have no stored opcode; each one becomes a JSON descriptor
    /// in the data section for the platform-side executor to pick up.
    fn wasm_calls(&mut self) -> Result<(), EmitError> {
        for decl in self.scene.wasm_calls.values() {
            let blob = WasmCallBlob {
                module: decl.module,
                func: decl.func.clone(),
            };
            self.add_json(&blob)?;
        }
        Ok(())
    }

    fn uniform_table(&mut self) -> Result<(), EmitError> {
        for (index, decl) in self.scene.buffers.values().enumerate() {
            for field in &decl.uniforms {
                let source = match &field.source {
                    UniformSource::PngineInputs => SOURCE_PNGINE_INPUTS,
                    UniformSource::SceneTimeInputs => SOURCE_SCENE_TIME,
                    UniformSource::User(name) => {
                        let id = self.intern(name)?;
                        SOURCE_USER_BASE
                            .checked_add(id)
                            .ok_or(EmitError::TableOverflow { table: "string" })?
                    }
                };
                self.uniforms.push(UniformEntry {
                    buffer_id: self.buffer_base[index],
                    offset: field.offset,
                    size: field.size,
                    source,
                });
            }
        }
        Ok(())
    }

    fn animation_table(&mut self) {
        for (index, scene) in self.scene.animations.iter().enumerate() {
            self.animations.push(AnimationEntry {
                scene_id: index as u16,
                start_ms: scene.start_ms,
                duration_ms: scene.duration_ms,
                frame_id: scene.frame,
            });
        }
    }

    // ---- opcode emission --------------------------------------------------

    fn push_op(&mut self, op: Op) {
        self.ops.push(op as u8);
    }

    fn operand(&mut self, value: u32) -> Result<(), EmitError> {
        if value > varint::MAX {
            return Err(EmitError::OperandTooLarge {
                value: u64::from(value),
            });
        }
        varint::write(&mut self.ops, value);
        Ok(())
    }

    fn op_with(&mut self, op: Op, operands: &[u32]) -> Result<(), EmitError> {
        self.push_op(op);
        for &value in operands {
            self.operand(value)?;
        }
        Ok(())
    }

    fn creation_ops(&mut self) -> Result<(), EmitError> {
        // Shader modules first, dependencies before dependents.
        let order = self.scene.wgsl_order.clone();
        for id in order {
            self.op_with(Op::CreateShaderModule, &[u32::from(id), u32::from(id)])?;
        }

        for (index, decl) in self.scene.buffers.values().enumerate() {
            let base = self.buffer_base[index];
            let data_operand = match decl.data {
                Some(data_id) => u32::from(data_id) + 1,
                None => 0,
            };
            for slot in 0..decl.pool {
                self.op_with(
                    Op::CreateBuffer,
                    &[
                        u32::from(base + slot),
                        decl.size,
                        decl.usage.bits(),
                        u32::from(decl.pool),
                        data_operand,
                    ],
                )?;
            }
        }

        for (index, desc) in self.scene.textures.values().enumerate() {
            let data_id = self.add_json(desc)?;
            self.op_with(Op::CreateTexture, &[index as u32, u32::from(data_id)])?;
        }

        for (index, desc) in self.scene.samplers.values().enumerate() {
            let data_id = self.add_json(desc)?;
            self.op_with(Op::CreateSampler, &[index as u32, u32::from(data_id)])?;
        }

        for (index, decl) in self.scene.bind_group_layouts.values().enumerate() {
            let data_id = self.add_json(&decl.entries)?;
            self.op_with(
                Op::CreateBindGroupLayout,
                &[index as u32, u32::from(data_id)],
            )?;
        }

        for (index, decl) in self.scene.pipeline_layouts.values().enumerate() {
            self.push_op(Op::CreatePipelineLayout);
            self.operand(index as u32)?;
            self.operand(decl.layouts.len() as u32)?;
            for &layout in &decl.layouts {
                self.operand(u32::from(layout))?;
            }
        }

        for (index, desc) in self.scene.render_pipelines.values().enumerate() {
            let data_id = self.add_json(desc)?;
            self.op_with(
                Op::CreateRenderPipeline,
                &[index as u32, u32::from(data_id)],
            )?;
        }

        for (index, desc) in self.scene.compute_pipelines.values().enumerate() {
            let data_id = self.add_json(desc)?;
            self.op_with(
                Op::CreateComputePipeline,
                &[index as u32, u32::from(data_id)],
            )?;
        }

        for (index, decl) in self.scene.bind_groups.values().enumerate() {
            let base = self.group_base[index];
            for slot in 0..decl.pool {
                let blob = self.bind_group_blob(decl, slot);
                let data_id = self.add_json(&blob)?;
                self.op_with(
                    Op::CreateBindGroup,
                    &[
                        u32::from(base + slot),
                        u32::from(data_id),
                        u32::from(decl.pool),
                    ],
                )?;
            }
        }

        self.push_op(Op::Submit);
        Ok(())
    }

    /// Resolve a bind group's entries for one pool slot. A pooled entry
    /// rotates with the slot: slot `k` with ping-pong offset `o` binds the
    /// buffer instance `(k + o) % pool`.
    fn bind_group_blob(&self, decl: &BindGroupDecl, slot: u16) -> BindGroupBlob {
        let entries = decl
            .entries
            .iter()
            .map(|entry| {
                let resource = match entry.resource {
                    BindingResource::Buffer { buffer, ping_pong } => {
                        let base = self.buffer_base[buffer as usize];
                        let pool = self.scene.buffers[buffer as usize].pool;
                        let rotated = if pool > 1 {
                            (slot + ping_pong.unwrap_or(0)) % pool
                        } else {
                            0
                        };
                        ResolvedResource::Buffer(base + rotated)
                    }
                    BindingResource::Sampler(id) => ResolvedResource::Sampler(id),
                    BindingResource::Texture(id) => ResolvedResource::Texture(id),
                };
                ResolvedEntry {
                    binding: entry.binding,
                    resource,
                }
            })
            .collect();
        BindGroupBlob {
            layout: decl.layout,
            entries,
        }
    }

    fn pass_regions(&mut self) -> Result<(), EmitError> {
        for (index, decl) in self.scene.render_passes.values().enumerate() {
            self.op_with(Op::DefinePass, &[index as u32, PASS_KIND_RENDER])?;
            let data_id = self.add_json(&decl.attachments)?;
            self.op_with(Op::BeginRenderPass, &[u32::from(data_id)])?;
            for command in &decl.commands {
                self.op_with(
                    Op::SetPipeline,
                    &[PIPELINE_KIND_RENDER, u32::from(command.pipeline)],
                )?;
                for binding in &command.bind_groups {
                    self.emit_bind_group_binding(binding.slot, binding.group, binding.ping_pong)?;
                }
                for binding in &command.vertex_buffers {
                    self.emit_vertex_buffer_binding(
                        binding.slot,
                        binding.buffer,
                        binding.ping_pong,
                    )?;
                }
                if let Some((buffer, format)) = command.index_buffer {
                    let format = match format {
                        crate::scene::IndexFormat::Uint16 => INDEX_FORMAT_UINT16,
                        crate::scene::IndexFormat::Uint32 => INDEX_FORMAT_UINT32,
                    };
                    let id = self.buffer_base[buffer as usize];
                    self.op_with(Op::SetIndexBuffer, &[u32::from(id), format])?;
                }
                if let Some((vertices, instances)) = command.draw {
                    self.op_with(Op::Draw, &[vertices, instances])?;
                }
                if let Some((indices, instances)) = command.draw_indexed {
                    self.op_with(Op::DrawIndexed, &[indices, instances])?;
                }
            }
            self.push_op(Op::EndPass);
        }

        for (index, decl) in self.scene.compute_passes.values().enumerate() {
            let id = u32::from(self.compute_pass_base) + index as u32;
            self.op_with(Op::DefinePass, &[id, PASS_KIND_COMPUTE])?;
            self.push_op(Op::BeginComputePass);
            self.op_with(
                Op::SetPipeline,
                &[PIPELINE_KIND_COMPUTE, u32::from(decl.pipeline)],
            )?;
            for binding in &decl.bind_groups {
                self.emit_bind_group_binding(binding.slot, binding.group, binding.ping_pong)?;
            }
            let [x, y, z] = decl.dispatch;
            self.op_with(Op::Dispatch, &[x, y, z])?;
            self.push_op(Op::EndPass);
        }

        for (index, decl) in self.scene.queues.values().enumerate() {
            let id = u32::from(self.queue_pass_base) + index as u32;
            self.op_with(Op::DefinePass, &[id, PASS_KIND_QUEUE])?;
            match decl {
                QueueDecl::WriteBuffer {
                    buffer,
                    offset,
                    data,
                } => {
                    let id = self.buffer_base[*buffer as usize];
                    self.op_with(
                        Op::WriteBuffer,
                        &[u32::from(id), *offset, u32::from(*data)],
                    )?;
                }
                QueueDecl::WriteTimeUniform { buffer } => {
                    let id = self.buffer_base[*buffer as usize];
                    self.op_with(Op::WriteTimeUniform, &[u32::from(id)])?;
                }
            }
            self.push_op(Op::EndPass);
        }
        Ok(())
    }

    fn emit_bind_group_binding(
        &mut self,
        slot: u32,
        group: u16,
        ping_pong: Option<u16>,
    ) -> Result<(), EmitError> {
        let base = self.group_base[group as usize];
        let pool = self.scene.bind_groups[group as usize].pool;
        if pool > 1 {
            let offset = ping_pong.unwrap_or(0);
            self.op_with(
                Op::SetBindGroupPool,
                &[slot, u32::from(base), u32::from(offset)],
            )
        } else {
            self.op_with(Op::SetBindGroup, &[slot, u32::from(base)])
        }
    }

    fn emit_vertex_buffer_binding(
        &mut self,
        slot: u32,
        buffer: u16,
        ping_pong: Option<u16>,
    ) -> Result<(), EmitError> {
        let base = self.buffer_base[buffer as usize];
        let pool = self.scene.buffers[buffer as usize].pool;
        if pool > 1 {
            let offset = ping_pong.unwrap_or(0);
            self.op_with(
                Op::SetVertexBufferPool,
                &[slot, u32::from(base), u32::from(offset)],
            )
        } else {
            self.op_with(Op::SetVertexBuffer, &[slot, u32::from(base)])
        }
    }

    /// Frames lower their three lists onto the two exec opcodes: `init`
    /// entries run once per dispatcher lifetime, `before` and `perform`
    /// entries run every frame, in that order.
    fn frame_regions(&mut self) -> Result<(), EmitError> {
        for (index, (name, decl)) in self.scene.frames.iter().enumerate() {
            let name_id = self.intern(name)?;
            self.op_with(Op::DefineFrame, &[index as u32, u32::from(name_id)])?;
            for &pass in &decl.init {
                let id = self.pass_id(pass);
                self.op_with(Op::ExecPassOnce, &[id])?;
            }
            for &pass in decl.before.iter().chain(&decl.perform) {
                let id = self.pass_id(pass);
                self.op_with(Op::ExecPass, &[id])?;
            }
            self.push_op(Op::EndFrame);
        }
        Ok(())
    }
}

fn check_id(value: u32) -> Result<u16, EmitError> {
    u16::try_from(value).map_err(|_| EmitError::OperandTooLarge {
        value: u64::from(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::analyze;
    use crate::lexer::tokenize;
    use crate::parser::parse_tokens;
    use crate::pngb::Module;

    fn compile(source: &str) -> Module {
        let ast = parse_tokens(tokenize(source).unwrap()).unwrap();
        let scene = analyze(source, &ast).unwrap();
        emit(&scene).unwrap()
    }

    const TRIANGLE: &str = r#"
        #wgsl tri { code = "@vertex fn vs() {} @fragment fn fs() {}" }
        #renderPipeline p {
            vertex = { module = $wgsl.tri, entryPoint = "vs" }
            , fragment = { module = $wgsl.tri, entryPoint = "fs", targets = [{ format = bgra8unorm }] }
        }
        #renderPass draw { colorAttachments = [{}], pipeline = $renderPipeline.p, draw = 3 }
        #frame main { perform = [$renderPass.draw] }
    "#;

    #[test]
    fn triangle_module_is_small_and_valid() {
        let module = compile(TRIANGLE);
        let bytes = module.encode().unwrap();
        assert!(bytes.len() < 1024, "module is {} bytes", bytes.len());
        assert_eq!(Module::decode(&bytes).unwrap(), module);
    }

    #[test]
    fn emission_is_deterministic() {
        let first = compile(TRIANGLE).encode().unwrap();
        let second = compile(TRIANGLE).encode().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn wgsl_deps_use_transitive_closure_order() {
        let module = compile(
            r#"
            #wgsl top { code = "fn t() {}", imports = [$wgsl.mid] }
            #wgsl mid { code = "fn m() {}", imports = [$wgsl.base] }
            #wgsl base { code = "fn b() {}" }
            "#,
        );
        // top is declaration 0; its deps list base (2) before mid (1).
        assert_eq!(module.wgsl[0].deps, vec![2, 1]);
        assert!(module.wgsl[2].deps.is_empty());
    }

    #[test]
    fn pooled_buffers_take_consecutive_ids() {
        let module = compile(
            r#"
            #buffer particles { size = 64, usage = [VERTEX, STORAGE], pool = 2 }
            #buffer uniforms { size = 16, usage = [UNIFORM, COPY_DST], stream = "pngineInputs" }
            "#,
        );
        // Two create_buffer ops for the pool, then one for `uniforms` at id 2.
        let stream = module.ops.clone();
        assert_eq!(stream[0], Op::CreateBuffer as u8);
        // Uniform table points at the post-pool base id.
        assert_eq!(module.uniforms.len(), 1);
        assert_eq!(module.uniforms[0].buffer_id, 2);
        assert_eq!(module.uniforms[0].size, 16);
        assert_eq!(module.uniforms[0].source, SOURCE_PNGINE_INPUTS);
    }

    #[test]
    fn identical_blobs_are_deduplicated() {
        let module = compile(
            r#"
            #sampler a { magFilter = linear, minFilter = linear }
            #sampler b { magFilter = linear, minFilter = linear }
            "#,
        );
        // Both samplers share one descriptor blob.
        assert_eq!(module.data.len(), 1);
    }

    #[test]
    fn wasm_calls_become_data_descriptors() {
        let module = compile(
            r#"
            #data blob { values = [0, 97, 115, 109], kind = u8 }
            #wasmCall tick { module = $data.blob, func = "step" }
            "#,
        );
        let descriptor = br#"{"module":0,"func":"step"}"#.to_vec();
        assert!(module.data.contains(&descriptor));
    }

    #[test]
    fn executor_is_carried_opaquely() {
        let source = "#frame main { perform = [] }";
        let ast = parse_tokens(tokenize(source).unwrap()).unwrap();
        let scene = analyze(source, &ast).unwrap();
        let module = Emitter::new()
            .with_executor(vec![7u8; 64])
            .emit(&scene)
            .unwrap();
        let bytes = module.encode().unwrap();
        let decoded = Module::decode(&bytes).unwrap();
        assert_eq!(decoded.executor.as_deref(), Some(&[7u8; 64][..]));
    }
}
