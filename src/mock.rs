//! A recording backend for tests.
//!
//! Every call is captured as a [`Call`] with its arguments copied by value,
//! so assertions can compare whole traces without keeping the dispatcher
//! alive. Creation never fails unless a failure is scripted with
//! [`MockBackend::fail_on`].

use crate::backend::{Backend, BackendError, IndexFormat, PipelineKind, ResourceKind};
use crate::scene::BufferUsages;

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    CreateBuffer {
        id: u16,
        size: u32,
        usage: BufferUsages,
        data: Option<Vec<u8>>,
    },
    CreateTexture { id: u16, descriptor: String },
    CreateSampler { id: u16, descriptor: String },
    CreateShaderModule { id: u16, source: String },
    CreateBindGroupLayout { id: u16, entries: String },
    CreatePipelineLayout { id: u16, layouts: Vec<u16> },
    CreateRenderPipeline { id: u16, descriptor: String },
    CreateComputePipeline { id: u16, descriptor: String },
    CreateBindGroup { id: u16, entries: String },
    BeginRenderPass { attachments: String },
    BeginComputePass,
    SetPipeline { kind: PipelineKind, id: u16 },
    SetBindGroup { slot: u32, id: u16 },
    SetVertexBuffer { slot: u32, id: u16 },
    SetIndexBuffer { id: u16, format: IndexFormat },
    Draw { vertices: u32, instances: u32 },
    DrawIndexed { indices: u32, instances: u32 },
    Dispatch { x: u32, y: u32, z: u32 },
    EndPass,
    WriteBuffer { id: u16, offset: u32, bytes: Vec<u8> },
    WriteTimeUniform { id: u16 },
    Submit,
    End,
    Destroy { kind: ResourceKind, id: u16 },
}

#[derive(Default)]
pub struct MockBackend {
    calls: Vec<Call>,
    fail_on: Option<(ResourceKind, u16)>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next matching creation call to fail.
    pub fn fail_on(&mut self, kind: ResourceKind, id: u16) {
        self.fail_on = Some((kind, id));
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }

    fn check(&mut self, kind: ResourceKind, id: u16) -> Result<(), BackendError> {
        if self.fail_on == Some((kind, id)) {
            return Err(BackendError::new(format!(
                "scripted failure for {kind:?} {id}"
            )));
        }
        Ok(())
    }
}

impl Backend for MockBackend {
    fn create_buffer(
        &mut self,
        id: u16,
        size: u32,
        usage: BufferUsages,
        data: Option<&[u8]>,
    ) -> Result<(), BackendError> {
        self.check(ResourceKind::Buffer, id)?;
        self.calls.push(Call::CreateBuffer {
            id,
            size,
            usage,
            data: data.map(<[u8]>::to_vec),
        });
        Ok(())
    }

    fn create_texture(&mut self, id: u16, descriptor_json: &str) -> Result<(), BackendError> {
        self.check(ResourceKind::Texture, id)?;
        self.calls.push(Call::CreateTexture {
            id,
            descriptor: descriptor_json.to_string(),
        });
        Ok(())
    }

    fn create_sampler(&mut self, id: u16, descriptor_json: &str) -> Result<(), BackendError> {
        self.check(ResourceKind::Sampler, id)?;
        self.calls.push(Call::CreateSampler {
            id,
            descriptor: descriptor_json.to_string(),
        });
        Ok(())
    }

    fn create_shader_module(&mut self, id: u16, source: &str) -> Result<(), BackendError> {
        self.check(ResourceKind::ShaderModule, id)?;
        self.calls.push(Call::CreateShaderModule {
            id,
            source: source.to_string(),
        });
        Ok(())
    }

    fn create_bind_group_layout(
        &mut self,
        id: u16,
        entries_json: &str,
    ) -> Result<(), BackendError> {
        self.check(ResourceKind::BindGroupLayout, id)?;
        self.calls.push(Call::CreateBindGroupLayout {
            id,
            entries: entries_json.to_string(),
        });
        Ok(())
    }

    fn create_pipeline_layout(&mut self, id: u16, layouts: &[u16]) -> Result<(), BackendError> {
        self.check(ResourceKind::PipelineLayout, id)?;
        self.calls.push(Call::CreatePipelineLayout {
            id,
            layouts: layouts.to_vec(),
        });
        Ok(())
    }

    fn create_render_pipeline(
        &mut self,
        id: u16,
        descriptor_json: &str,
    ) -> Result<(), BackendError> {
        self.check(ResourceKind::RenderPipeline, id)?;
        self.calls.push(Call::CreateRenderPipeline {
            id,
            descriptor: descriptor_json.to_string(),
        });
        Ok(())
    }

    fn create_compute_pipeline(
        &mut self,
        id: u16,
        descriptor_json: &str,
    ) -> Result<(), BackendError> {
        self.check(ResourceKind::ComputePipeline, id)?;
        self.calls.push(Call::CreateComputePipeline {
            id,
            descriptor: descriptor_json.to_string(),
        });
        Ok(())
    }

    fn create_bind_group(&mut self, id: u16, entries_json: &str) -> Result<(), BackendError> {
        self.check(ResourceKind::BindGroup, id)?;
        self.calls.push(Call::CreateBindGroup {
            id,
            entries: entries_json.to_string(),
        });
        Ok(())
    }

    fn begin_render_pass(&mut self, attachments_json: &str) {
        self.calls.push(Call::BeginRenderPass {
            attachments: attachments_json.to_string(),
        });
    }

    fn begin_compute_pass(&mut self) {
        self.calls.push(Call::BeginComputePass);
    }

    fn set_pipeline(&mut self, kind: PipelineKind, id: u16) {
        self.calls.push(Call::SetPipeline { kind, id });
    }

    fn set_bind_group(&mut self, slot: u32, id: u16) {
        self.calls.push(Call::SetBindGroup { slot, id });
    }

    fn set_vertex_buffer(&mut self, slot: u32, id: u16) {
        self.calls.push(Call::SetVertexBuffer { slot, id });
    }

    fn set_index_buffer(&mut self, id: u16, format: IndexFormat) {
        self.calls.push(Call::SetIndexBuffer { id, format });
    }

    fn draw(&mut self, vertices: u32, instances: u32) {
        self.calls.push(Call::Draw {
            vertices,
            instances,
        });
    }

    fn draw_indexed(&mut self, indices: u32, instances: u32) {
        self.calls.push(Call::DrawIndexed {
            indices,
            instances,
        });
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.calls.push(Call::Dispatch { x, y, z });
    }

    fn end_pass(&mut self) {
        self.calls.push(Call::EndPass);
    }

    fn write_buffer(&mut self, id: u16, offset: u32, bytes: &[u8]) {
        self.calls.push(Call::WriteBuffer {
            id,
            offset,
            bytes: bytes.to_vec(),
        });
    }

    fn write_time_uniform(&mut self, id: u16) {
        self.calls.push(Call::WriteTimeUniform { id });
    }

    fn submit(&mut self) {
        self.calls.push(Call::Submit);
    }

    fn end(&mut self) {
        self.calls.push(Call::End);
    }

    fn destroy(&mut self, kind: ResourceKind, id: u16) {
        self.calls.push(Call::Destroy { kind, id });
    }
}
