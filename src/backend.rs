//! The abstract GPU capability the dispatcher drives.
//!
//! A backend owns handles for every resource keyed by `(kind, id)` and
//! receives pass encoding calls in a strict order the dispatcher guarantees:
//! `begin_*` before any set/draw/dispatch, `end_pass` before the next
//! `begin_*`, `submit` after each batch. Structured descriptors arrive as the
//! JSON blobs stored in the module's data section; a backend deserializes
//! them or forwards them verbatim.
//!
//! Creation calls can fail; encoding calls cannot. The mock backend records
//! every call, the command recorder serializes them for a platform loader,
//! and a real driver binding would be a third peer.

use std::fmt;

use crate::scene::BufferUsages;

/// Which resource table an id indexes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Sampler,
    ShaderModule,
    BindGroupLayout,
    PipelineLayout,
    RenderPipeline,
    ComputePipeline,
    BindGroup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineKind {
    Render,
    Compute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// A failure reported by the backend itself (device loss, invalid
/// descriptor, out of memory).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BackendError {}

pub trait Backend {
    // Resource creation, executed once during dispatcher init.
    fn create_buffer(
        &mut self,
        id: u16,
        size: u32,
        usage: BufferUsages,
        data: Option<&[u8]>,
    ) -> Result<(), BackendError>;
    fn create_texture(&mut self, id: u16, descriptor_json: &str) -> Result<(), BackendError>;
    fn create_sampler(&mut self, id: u16, descriptor_json: &str) -> Result<(), BackendError>;
    /// `source` is the module's WGSL with its transitive imports already
    /// concatenated in dependency order.
    fn create_shader_module(&mut self, id: u16, source: &str) -> Result<(), BackendError>;
    fn create_bind_group_layout(
        &mut self,
        id: u16,
        entries_json: &str,
    ) -> Result<(), BackendError>;
    fn create_pipeline_layout(&mut self, id: u16, layouts: &[u16]) -> Result<(), BackendError>;
    fn create_render_pipeline(&mut self, id: u16, descriptor_json: &str)
        -> Result<(), BackendError>;
    fn create_compute_pipeline(
        &mut self,
        id: u16,
        descriptor_json: &str,
    ) -> Result<(), BackendError>;
    fn create_bind_group(&mut self, id: u16, entries_json: &str) -> Result<(), BackendError>;

    // Pass encoding.
    fn begin_render_pass(&mut self, attachments_json: &str);
    fn begin_compute_pass(&mut self);
    fn set_pipeline(&mut self, kind: PipelineKind, id: u16);
    fn set_bind_group(&mut self, slot: u32, id: u16);
    fn set_vertex_buffer(&mut self, slot: u32, id: u16);
    fn set_index_buffer(&mut self, id: u16, format: IndexFormat);
    fn draw(&mut self, vertices: u32, instances: u32);
    fn draw_indexed(&mut self, indices: u32, instances: u32);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
    fn end_pass(&mut self);

    // Queue operations.
    fn write_buffer(&mut self, id: u16, offset: u32, bytes: &[u8]);
    /// Platform-side write of the 16-byte inputs block into buffer `id`.
    fn write_time_uniform(&mut self, id: u16);
    fn submit(&mut self);
    fn end(&mut self);

    /// Release one handle; called in reverse creation order on shutdown and
    /// on failed init.
    fn destroy(&mut self, kind: ResourceKind, id: u16);
}
