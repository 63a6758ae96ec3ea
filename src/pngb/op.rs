//! The stored opcode set.
//!
//! These are the instruction bytes that live inside a module's opcode stream.
//! They are not the bytes the dispatcher emits toward the platform; that
//! parallel set lives in [`crate::dispatch::command`] and a table test keeps
//! the two spaces from ever sharing a byte for the same semantic.

/// Stored opcodes, grouped by prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // 0x00..=0x0f: resource creation.
    /// `create_buffer(id, size, usage, pool, data_id_plus_one)`; the final
    /// operand is 0 when the buffer starts zeroed, otherwise `data_id + 1`.
    CreateBuffer = 0x01,
    /// `create_texture(id, desc_data_id)`
    CreateTexture = 0x02,
    /// `create_sampler(id, desc_data_id)`
    CreateSampler = 0x03,
    /// `create_shader_module(id, wgsl_id)` — the operand joins through the
    /// WGSL table, never directly into the data section.
    CreateShaderModule = 0x04,
    /// `create_bind_group_layout(id, entries_data_id)`
    CreateBindGroupLayout = 0x05,
    /// `create_pipeline_layout(id, count, bgl_ids...)`
    CreatePipelineLayout = 0x06,
    /// `create_render_pipeline(id, desc_data_id)`
    CreateRenderPipeline = 0x07,
    /// `create_compute_pipeline(id, desc_data_id)`
    CreateComputePipeline = 0x08,
    /// `create_bind_group(id, entries_data_id, pool)`
    CreateBindGroup = 0x09,

    // 0x10..=0x1f: pass ops.
    /// `begin_render_pass(attachments_data_id)`
    BeginRenderPass = 0x10,
    BeginComputePass = 0x11,
    /// `set_pipeline(kind, id)`; kind 0 = render, 1 = compute.
    SetPipeline = 0x12,
    /// `set_bind_group(slot, id)`
    SetBindGroup = 0x13,
    /// `set_vertex_buffer(slot, id)`
    SetVertexBuffer = 0x14,
    /// `set_index_buffer(id, format)`; format 0 = uint16, 1 = uint32.
    SetIndexBuffer = 0x15,
    /// `draw(vertices, instances)`
    Draw = 0x16,
    /// `draw_indexed(indices, instances)`
    DrawIndexed = 0x17,
    /// `dispatch(x, y, z)`
    Dispatch = 0x18,
    EndPass = 0x19,
    /// `define_pass(id, kind)`; kind 0 = render, 1 = compute, 2 = queue.
    /// Opens a region closed by `end_pass`.
    DefinePass = 0x1a,

    // 0x20..=0x2f: queue ops.
    /// `write_buffer(id, offset, data_id)`
    WriteBuffer = 0x20,
    /// `write_time_uniform(id)`
    WriteTimeUniform = 0x21,
    Submit = 0x22,

    // 0x30..=0x3f: frame control.
    /// `define_frame(id, name_string_id)`; region closed by `end_frame`.
    DefineFrame = 0x30,
    /// `exec_pass(id)`
    ExecPass = 0x31,
    /// `exec_pass_once(id)`
    ExecPassOnce = 0x32,
    EndFrame = 0x33,

    // 0x40..=0x4f: pool ops.
    /// `set_vertex_buffer_pool(slot, id, offset)`
    SetVertexBufferPool = 0x40,
    /// `set_bind_group_pool(slot, id, offset)`
    SetBindGroupPool = 0x41,

    /// Stream terminator.
    End = 0xff,
}

impl Op {
    pub fn from_byte(byte: u8) -> Option<Op> {
        Some(match byte {
            0x01 => Op::CreateBuffer,
            0x02 => Op::CreateTexture,
            0x03 => Op::CreateSampler,
            0x04 => Op::CreateShaderModule,
            0x05 => Op::CreateBindGroupLayout,
            0x06 => Op::CreatePipelineLayout,
            0x07 => Op::CreateRenderPipeline,
            0x08 => Op::CreateComputePipeline,
            0x09 => Op::CreateBindGroup,
            0x10 => Op::BeginRenderPass,
            0x11 => Op::BeginComputePass,
            0x12 => Op::SetPipeline,
            0x13 => Op::SetBindGroup,
            0x14 => Op::SetVertexBuffer,
            0x15 => Op::SetIndexBuffer,
            0x16 => Op::Draw,
            0x17 => Op::DrawIndexed,
            0x18 => Op::Dispatch,
            0x19 => Op::EndPass,
            0x1a => Op::DefinePass,
            0x20 => Op::WriteBuffer,
            0x21 => Op::WriteTimeUniform,
            0x22 => Op::Submit,
            0x30 => Op::DefineFrame,
            0x31 => Op::ExecPass,
            0x32 => Op::ExecPassOnce,
            0x33 => Op::EndFrame,
            0x40 => Op::SetVertexBufferPool,
            0x41 => Op::SetBindGroupPool,
            0xff => Op::End,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        let byte = *self as u8;
        NAMES
            .iter()
            .find(|(candidate, _)| *candidate == byte)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }

    /// Number of fixed varint operands following the opcode byte.
    /// `CreatePipelineLayout` is the one variadic case: after its two fixed
    /// operands (id, count) the count says how many layout ids follow.
    pub fn operand_count(&self) -> usize {
        match self {
            Op::CreateBuffer => 5,
            Op::CreateTexture
            | Op::CreateSampler
            | Op::CreateShaderModule
            | Op::CreateBindGroupLayout
            | Op::CreateRenderPipeline
            | Op::CreateComputePipeline => 2,
            Op::CreateBindGroup => 3,
            Op::BeginRenderPass => 1,
            Op::BeginComputePass => 0,
            Op::SetPipeline => 2,
            Op::SetBindGroup | Op::SetVertexBuffer | Op::SetIndexBuffer => 2,
            Op::Draw | Op::DrawIndexed => 2,
            Op::Dispatch => 3,
            Op::EndPass => 0,
            Op::DefinePass => 2,
            Op::WriteBuffer => 3,
            Op::WriteTimeUniform => 1,
            Op::Submit => 0,
            Op::DefineFrame => 2,
            Op::ExecPass | Op::ExecPassOnce => 1,
            Op::EndFrame => 0,
            Op::SetVertexBufferPool | Op::SetBindGroupPool => 3,
            Op::End => 0,
            Op::CreatePipelineLayout => 2,
        }
    }
}

/// Name table for the stored space, used by the disjointness test.
pub const NAMES: &[(u8, &str)] = &[
    (0x01, "create_buffer"),
    (0x02, "create_texture"),
    (0x03, "create_sampler"),
    (0x04, "create_shader_module"),
    (0x05, "create_bind_group_layout"),
    (0x06, "create_pipeline_layout"),
    (0x07, "create_render_pipeline"),
    (0x08, "create_compute_pipeline"),
    (0x09, "create_bind_group"),
    (0x10, "begin_render_pass"),
    (0x11, "begin_compute_pass"),
    (0x12, "set_pipeline"),
    (0x13, "set_bind_group"),
    (0x14, "set_vertex_buffer"),
    (0x15, "set_index_buffer"),
    (0x16, "draw"),
    (0x17, "draw_indexed"),
    (0x18, "dispatch"),
    (0x19, "end_pass"),
    (0x1a, "define_pass"),
    (0x20, "write_buffer"),
    (0x21, "write_time_uniform"),
    (0x22, "submit"),
    (0x30, "define_frame"),
    (0x31, "exec_pass"),
    (0x32, "exec_pass_once"),
    (0x33, "end_frame"),
    (0x40, "set_vertex_buffer_pool"),
    (0x41, "set_bind_group_pool"),
    (0xff, "end"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_mapping_is_total_over_names() {
        for &(byte, _) in NAMES {
            let op = Op::from_byte(byte).expect("named opcode decodes");
            assert_eq!(op as u8, byte);
        }
    }

    #[test]
    fn unknown_bytes_do_not_decode() {
        for byte in [0x00u8, 0x0a, 0x1b, 0x23, 0x34, 0x42, 0x80, 0xfe] {
            assert!(Op::from_byte(byte).is_none(), "0x{byte:02x}");
        }
    }
}
