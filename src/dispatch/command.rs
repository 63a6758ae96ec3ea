//! The emitted GPU command space.
//!
//! This is the dispatcher's output vocabulary: a parallel opcode set with
//! fixed-size operands, distinct from the stored PNGB opcodes. Creation
//! commands sit at 0x80.., pass commands at 0x90.., queue commands at 0xa0..,
//! with `submit` pinned at 0xf0 and `end` at 0xff. `draw` is deliberately a
//! different byte here (0x96) than in the stored space (0x16); a table test
//! keeps every shared semantic on distinct bytes, terminator excepted.
//!
//! [`CommandRecorder`] is a [`Backend`] that serializes every call into such
//! records. Variable payloads (shader source, descriptor JSON, write bytes)
//! go into a side blob; the record carries their fixed-size `(offset, len)`.

use crate::backend::{Backend, BackendError, IndexFormat, PipelineKind, ResourceKind};
use crate::scene::BufferUsages;

pub const CREATE_BUFFER: u8 = 0x81;
pub const CREATE_TEXTURE: u8 = 0x82;
pub const CREATE_SAMPLER: u8 = 0x83;
pub const CREATE_SHADER_MODULE: u8 = 0x84;
pub const CREATE_BIND_GROUP_LAYOUT: u8 = 0x85;
pub const CREATE_PIPELINE_LAYOUT: u8 = 0x86;
pub const CREATE_RENDER_PIPELINE: u8 = 0x87;
pub const CREATE_COMPUTE_PIPELINE: u8 = 0x88;
pub const CREATE_BIND_GROUP: u8 = 0x89;
pub const BEGIN_RENDER_PASS: u8 = 0x90;
pub const BEGIN_COMPUTE_PASS: u8 = 0x91;
pub const SET_PIPELINE: u8 = 0x92;
pub const SET_BIND_GROUP: u8 = 0x93;
pub const SET_VERTEX_BUFFER: u8 = 0x94;
pub const SET_INDEX_BUFFER: u8 = 0x95;
pub const DRAW: u8 = 0x96;
pub const DRAW_INDEXED: u8 = 0x97;
pub const DISPATCH: u8 = 0x98;
pub const END_PASS: u8 = 0x99;
pub const WRITE_BUFFER: u8 = 0xa0;
pub const WRITE_TIME_UNIFORM: u8 = 0xa1;
pub const DESTROY: u8 = 0xa2;
pub const SUBMIT: u8 = 0xf0;
pub const END: u8 = 0xff;

/// Name table for the emitted space. Shares names with the stored space
/// where the semantics match; the disjointness test compares the two.
pub const NAMES: &[(u8, &str)] = &[
    (CREATE_BUFFER, "create_buffer"),
    (CREATE_TEXTURE, "create_texture"),
    (CREATE_SAMPLER, "create_sampler"),
    (CREATE_SHADER_MODULE, "create_shader_module"),
    (CREATE_BIND_GROUP_LAYOUT, "create_bind_group_layout"),
    (CREATE_PIPELINE_LAYOUT, "create_pipeline_layout"),
    (CREATE_RENDER_PIPELINE, "create_render_pipeline"),
    (CREATE_COMPUTE_PIPELINE, "create_compute_pipeline"),
    (CREATE_BIND_GROUP, "create_bind_group"),
    (BEGIN_RENDER_PASS, "begin_render_pass"),
    (BEGIN_COMPUTE_PASS, "begin_compute_pass"),
    (SET_PIPELINE, "set_pipeline"),
    (SET_BIND_GROUP, "set_bind_group"),
    (SET_VERTEX_BUFFER, "set_vertex_buffer"),
    (SET_INDEX_BUFFER, "set_index_buffer"),
    (DRAW, "draw"),
    (DRAW_INDEXED, "draw_indexed"),
    (DISPATCH, "dispatch"),
    (END_PASS, "end_pass"),
    (WRITE_BUFFER, "write_buffer"),
    (WRITE_TIME_UNIFORM, "write_time_uniform"),
    (DESTROY, "destroy"),
    (SUBMIT, "submit"),
    (END, "end"),
];

/// Serializes backend calls into the fixed-size command stream plus a side
/// blob for variable payloads. The pair is what a platform loader replays.
#[derive(Default)]
pub struct CommandRecorder {
    stream: Vec<u8>,
    blob: Vec<u8>,
}

impl CommandRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(&self) -> &[u8] {
        &self.stream
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn finish(self) -> (Vec<u8>, Vec<u8>) {
        (self.stream, self.blob)
    }

    fn u16(&mut self, value: u16) {
        self.stream.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.stream.extend_from_slice(&value.to_le_bytes());
    }

    /// Stash a payload in the blob and write its `(offset, len)` operands.
    fn payload(&mut self, bytes: &[u8]) {
        let offset = self.blob.len() as u32;
        self.blob.extend_from_slice(bytes);
        self.u32(offset);
        self.u32(bytes.len() as u32);
    }
}

impl Backend for CommandRecorder {
    fn create_buffer(
        &mut self,
        id: u16,
        size: u32,
        usage: BufferUsages,
        data: Option<&[u8]>,
    ) -> Result<(), BackendError> {
        self.stream.push(CREATE_BUFFER);
        self.u16(id);
        self.u32(size);
        self.u32(usage.bits());
        self.payload(data.unwrap_or(&[]));
        Ok(())
    }

    fn create_texture(&mut self, id: u16, descriptor_json: &str) -> Result<(), BackendError> {
        self.stream.push(CREATE_TEXTURE);
        self.u16(id);
        self.payload(descriptor_json.as_bytes());
        Ok(())
    }

    fn create_sampler(&mut self, id: u16, descriptor_json: &str) -> Result<(), BackendError> {
        self.stream.push(CREATE_SAMPLER);
        self.u16(id);
        self.payload(descriptor_json.as_bytes());
        Ok(())
    }

    fn create_shader_module(&mut self, id: u16, source: &str) -> Result<(), BackendError> {
        self.stream.push(CREATE_SHADER_MODULE);
        self.u16(id);
        self.payload(source.as_bytes());
        Ok(())
    }

    fn create_bind_group_layout(
        &mut self,
        id: u16,
        entries_json: &str,
    ) -> Result<(), BackendError> {
        self.stream.push(CREATE_BIND_GROUP_LAYOUT);
        self.u16(id);
        self.payload(entries_json.as_bytes());
        Ok(())
    }

    fn create_pipeline_layout(&mut self, id: u16, layouts: &[u16]) -> Result<(), BackendError> {
        self.stream.push(CREATE_PIPELINE_LAYOUT);
        self.u16(id);
        let mut bytes = Vec::with_capacity(layouts.len() * 2);
        for &layout in layouts {
            bytes.extend_from_slice(&layout.to_le_bytes());
        }
        self.payload(&bytes);
        Ok(())
    }

    fn create_render_pipeline(
        &mut self,
        id: u16,
        descriptor_json: &str,
    ) -> Result<(), BackendError> {
        self.stream.push(CREATE_RENDER_PIPELINE);
        self.u16(id);
        self.payload(descriptor_json.as_bytes());
        Ok(())
    }

    fn create_compute_pipeline(
        &mut self,
        id: u16,
        descriptor_json: &str,
    ) -> Result<(), BackendError> {
        self.stream.push(CREATE_COMPUTE_PIPELINE);
        self.u16(id);
        self.payload(descriptor_json.as_bytes());
        Ok(())
    }

    fn create_bind_group(&mut self, id: u16, entries_json: &str) -> Result<(), BackendError> {
        self.stream.push(CREATE_BIND_GROUP);
        self.u16(id);
        self.payload(entries_json.as_bytes());
        Ok(())
    }

    fn begin_render_pass(&mut self, attachments_json: &str) {
        self.stream.push(BEGIN_RENDER_PASS);
        self.payload(attachments_json.as_bytes());
    }

    fn begin_compute_pass(&mut self) {
        self.stream.push(BEGIN_COMPUTE_PASS);
    }

    fn set_pipeline(&mut self, kind: PipelineKind, id: u16) {
        self.stream.push(SET_PIPELINE);
        self.stream.push(match kind {
            PipelineKind::Render => 0,
            PipelineKind::Compute => 1,
        });
        self.u16(id);
    }

    fn set_bind_group(&mut self, slot: u32, id: u16) {
        self.stream.push(SET_BIND_GROUP);
        self.u32(slot);
        self.u16(id);
    }

    fn set_vertex_buffer(&mut self, slot: u32, id: u16) {
        self.stream.push(SET_VERTEX_BUFFER);
        self.u32(slot);
        self.u16(id);
    }

    fn set_index_buffer(&mut self, id: u16, format: IndexFormat) {
        self.stream.push(SET_INDEX_BUFFER);
        self.u16(id);
        self.stream.push(match format {
            IndexFormat::Uint16 => 0,
            IndexFormat::Uint32 => 1,
        });
    }

    fn draw(&mut self, vertices: u32, instances: u32) {
        self.stream.push(DRAW);
        self.u32(vertices);
        self.u32(instances);
    }

    fn draw_indexed(&mut self, indices: u32, instances: u32) {
        self.stream.push(DRAW_INDEXED);
        self.u32(indices);
        self.u32(instances);
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.stream.push(DISPATCH);
        self.u32(x);
        self.u32(y);
        self.u32(z);
    }

    fn end_pass(&mut self) {
        self.stream.push(END_PASS);
    }

    fn write_buffer(&mut self, id: u16, offset: u32, bytes: &[u8]) {
        self.stream.push(WRITE_BUFFER);
        self.u16(id);
        self.u32(offset);
        self.payload(bytes);
    }

    fn write_time_uniform(&mut self, id: u16) {
        self.stream.push(WRITE_TIME_UNIFORM);
        self.u16(id);
    }

    fn submit(&mut self) {
        self.stream.push(SUBMIT);
    }

    fn end(&mut self) {
        self.stream.push(END);
    }

    fn destroy(&mut self, kind: ResourceKind, id: u16) {
        self.stream.push(DESTROY);
        self.stream.push(kind as u8);
        self.u16(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorder_emits_fixed_records() {
        let mut recorder = CommandRecorder::new();
        recorder.draw(3, 1);
        recorder.submit();
        recorder.end();
        assert_eq!(recorder.stream()[0], DRAW);
        assert_eq!(&recorder.stream()[1..5], &3u32.to_le_bytes());
        assert_eq!(recorder.stream()[9], SUBMIT);
        assert_eq!(recorder.stream()[10], END);
    }

    #[test]
    fn payloads_land_in_the_blob() {
        let mut recorder = CommandRecorder::new();
        recorder
            .create_shader_module(0, "fn main() {}")
            .unwrap();
        recorder.write_buffer(1, 0, &[9, 9]);
        assert_eq!(&recorder.blob()[0..12], b"fn main() {}");
        assert_eq!(&recorder.blob()[12..], &[9, 9]);
    }
}
