//! The PNGB module format: header, section tables, encode and decode.
//!
//! Everything on disk is little-endian. A module is one blob:
//!
//! ```text
//! header (40 B) | executor | opcode stream | string table | data section
//!              | wgsl table | uniform table | animation table
//! ```
//!
//! The header records the byte offset of every section plus the executor
//! length; the opcode stream sits between the executor and the string table
//! and terminates with `end` (0xff). Decoding is fail-fast: a module either
//! parses completely, with every id bounds-checked, or not at all.

pub mod op;
pub mod varint;

use thiserror::Error;

use crate::scene::Plugins;
use op::Op;

pub const MAGIC: [u8; 4] = *b"PNGB";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 40;

/// Uniform source tags as stored in the uniform table.
pub const SOURCE_PNGINE_INPUTS: u16 = 0;
pub const SOURCE_SCENE_TIME: u16 = 1;
/// User-named sources are `SOURCE_USER_BASE + string_id`.
pub const SOURCE_USER_BASE: u16 = 2;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("module does not start with the PNGB magic")]
    BadMagic,
    #[error("unsupported module version or flags")]
    UnsupportedVersion,
    #[error("module shorter than its header")]
    TruncatedHeader,
    #[error("{0} section offset out of range")]
    OffsetOutOfRange(&'static str),
    #[error("{0} table truncated")]
    TruncatedTable(&'static str),
    #[error("opcode stream truncated")]
    TruncatedOpcodeStream,
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("operand is not canonically encoded")]
    NonCanonicalVarint,
    #[error("string id out of range")]
    StringIdOutOfRange,
    #[error("data id out of range")]
    DataIdOutOfRange,
    #[error("wgsl id out of range")]
    WgslIdOutOfRange,
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EmitError {
    #[error("{table} table overflow")]
    TableOverflow { table: &'static str },
    #[error("operand {value} exceeds the encodable range")]
    OperandTooLarge { value: u64 },
}

/// One WGSL table entry: where the source lives and which other modules must
/// be concatenated before it (transitive closure, dependencies first).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WgslEntry {
    pub data_id: u16,
    pub deps: Vec<u16>,
}

/// One uniform table entry: a runtime-settable region of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformEntry {
    pub buffer_id: u16,
    pub offset: u16,
    pub size: u16,
    /// [`SOURCE_PNGINE_INPUTS`], [`SOURCE_SCENE_TIME`], or
    /// `SOURCE_USER_BASE + string_id`.
    pub source: u16,
}

/// One animation table entry: a scene window on the timeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnimationEntry {
    pub scene_id: u16,
    pub start_ms: u32,
    pub duration_ms: u32,
    pub frame_id: u16,
}

/// A decoded (or freshly emitted) module. Immutable after load; the
/// dispatcher borrows it for its whole lifetime.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
    pub version: u16,
    pub flags: u16,
    pub plugins: Plugins,
    /// Opaque platform-side interpreter image, if embedded.
    pub executor: Option<Vec<u8>>,
    /// The opcode stream, including the trailing `end`.
    pub ops: Vec<u8>,
    pub strings: Vec<String>,
    pub data: Vec<Vec<u8>>,
    pub wgsl: Vec<WgslEntry>,
    pub uniforms: Vec<UniformEntry>,
    pub animations: Vec<AnimationEntry>,
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn check_u16(value: usize, table: &'static str) -> Result<u16, EmitError> {
    u16::try_from(value).map_err(|_| EmitError::TableOverflow { table })
}

impl Module {
    /// Serialize to the on-disk layout.
    pub fn encode(&self) -> Result<Vec<u8>, EmitError> {
        let mut out = vec![0u8; HEADER_LEN];

        let executor_offset = out.len() as u32;
        let executor_len = match &self.executor {
            Some(blob) => {
                out.extend_from_slice(blob);
                blob.len() as u32
            }
            None => 0,
        };

        out.extend_from_slice(&self.ops);

        let string_offset = out.len() as u32;
        let blob_len: usize = self.strings.iter().map(String::len).sum();
        push_u16(&mut out, check_u16(self.strings.len(), "string")?);
        push_u16(&mut out, check_u16(blob_len, "string")?);
        let mut at = 0usize;
        for string in &self.strings {
            push_u16(&mut out, check_u16(at, "string")?);
            at += string.len();
        }
        for string in &self.strings {
            out.extend_from_slice(string.as_bytes());
        }

        let data_offset = out.len() as u32;
        push_u16(&mut out, check_u16(self.data.len(), "data")?);
        let mut at = 0usize;
        for blob in &self.data {
            push_u16(&mut out, check_u16(at, "data")?);
            push_u16(&mut out, check_u16(blob.len(), "data")?);
            at += blob.len();
        }
        check_u16(at, "data")?;
        for blob in &self.data {
            out.extend_from_slice(blob);
        }

        let wgsl_offset = out.len() as u32;
        push_u16(&mut out, check_u16(self.wgsl.len(), "wgsl")?);
        for entry in &self.wgsl {
            push_u16(&mut out, entry.data_id);
            push_u16(&mut out, check_u16(entry.deps.len(), "wgsl")?);
            for &dep in &entry.deps {
                push_u16(&mut out, dep);
            }
        }

        let uniform_offset = out.len() as u32;
        push_u16(&mut out, check_u16(self.uniforms.len(), "uniform")?);
        for entry in &self.uniforms {
            push_u16(&mut out, entry.buffer_id);
            push_u16(&mut out, entry.offset);
            push_u16(&mut out, entry.size);
            push_u16(&mut out, entry.source);
        }

        let animation_offset = out.len() as u32;
        push_u16(&mut out, check_u16(self.animations.len(), "animation")?);
        for entry in &self.animations {
            push_u16(&mut out, entry.scene_id);
            push_u32(&mut out, entry.start_ms);
            push_u32(&mut out, entry.duration_ms);
            push_u16(&mut out, entry.frame_id);
        }

        out[0..4].copy_from_slice(&MAGIC);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8] = self.plugins.bits();
        // Bytes 9..12 stay reserved zeroes.
        out[12..16].copy_from_slice(&executor_offset.to_le_bytes());
        out[16..20].copy_from_slice(&string_offset.to_le_bytes());
        out[20..24].copy_from_slice(&data_offset.to_le_bytes());
        out[24..28].copy_from_slice(&wgsl_offset.to_le_bytes());
        out[28..32].copy_from_slice(&uniform_offset.to_le_bytes());
        out[32..36].copy_from_slice(&animation_offset.to_le_bytes());
        out[36..40].copy_from_slice(&executor_len.to_le_bytes());
        Ok(out)
    }

    /// Parse and validate a module. Fail-fast: no partial result.
    pub fn decode(bytes: &[u8]) -> Result<Module, FormatError> {
        if bytes.len() < HEADER_LEN {
            return Err(FormatError::TruncatedHeader);
        }
        if bytes[0..4] != MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion);
        }
        let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
        if flags != 0 {
            // No flag bits are defined in version 1; unknown bits are not
            // forward-compatible.
            return Err(FormatError::UnsupportedVersion);
        }
        let plugins = Plugins::from_bits(bytes[8]).ok_or(FormatError::UnsupportedVersion)?;

        let read_offset = |at: usize| -> u32 {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let executor_offset = read_offset(12) as usize;
        let string_offset = read_offset(16) as usize;
        let data_offset = read_offset(20) as usize;
        let wgsl_offset = read_offset(24) as usize;
        let uniform_offset = read_offset(28) as usize;
        let animation_offset = read_offset(32) as usize;
        let executor_len = read_offset(36) as usize;

        if executor_offset != HEADER_LEN {
            return Err(FormatError::OffsetOutOfRange("executor"));
        }
        let ops_start = executor_offset
            .checked_add(executor_len)
            .ok_or(FormatError::OffsetOutOfRange("executor"))?;
        let ordered = [
            (ops_start, "executor"),
            (string_offset, "string"),
            (data_offset, "data"),
            (wgsl_offset, "wgsl"),
            (uniform_offset, "uniform"),
            (animation_offset, "animation"),
            (bytes.len(), "animation"),
        ];
        for pair in ordered.windows(2) {
            if pair[0].0 > pair[1].0 {
                return Err(FormatError::OffsetOutOfRange(pair[0].1));
            }
        }

        let executor = if executor_len > 0 {
            Some(bytes[executor_offset..ops_start].to_vec())
        } else {
            None
        };

        let strings = decode_strings(&bytes[string_offset..data_offset])?;
        let data = decode_data(&bytes[data_offset..wgsl_offset])?;
        let wgsl = decode_wgsl(&bytes[wgsl_offset..uniform_offset], data.len())?;
        let uniforms = decode_uniforms(&bytes[uniform_offset..animation_offset], strings.len())?;
        let animations = decode_animations(&bytes[animation_offset..])?;

        let ops = bytes[ops_start..string_offset].to_vec();
        validate_ops(&ops, strings.len(), data.len(), wgsl.len())?;

        Ok(Module {
            version,
            flags,
            plugins,
            executor,
            ops,
            strings,
            data,
            wgsl,
            uniforms,
            animations,
        })
    }
}

/// Little-endian cursor over one section's byte region.
struct Cursor<'b> {
    buf: &'b [u8],
    pos: usize,
    section: &'static str,
}

impl<'b> Cursor<'b> {
    fn new(buf: &'b [u8], section: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            section,
        }
    }

    fn u16(&mut self) -> Result<u16, FormatError> {
        let end = self.pos + 2;
        if end > self.buf.len() {
            return Err(FormatError::TruncatedTable(self.section));
        }
        let value = u16::from_le_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos = end;
        Ok(value)
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        let end = self.pos + 4;
        if end > self.buf.len() {
            return Err(FormatError::TruncatedTable(self.section));
        }
        let value = u32::from_le_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos = end;
        Ok(value)
    }

    fn bytes(&mut self, len: usize) -> Result<&'b [u8], FormatError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(FormatError::TruncatedTable(self.section))?;
        if end > self.buf.len() {
            return Err(FormatError::TruncatedTable(self.section));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

fn decode_strings(region: &[u8]) -> Result<Vec<String>, FormatError> {
    let mut cursor = Cursor::new(region, "string");
    let count = cursor.u16()? as usize;
    let blob_len = cursor.u16()? as usize;
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        offsets.push(cursor.u16()? as usize);
    }
    let blob = cursor.bytes(blob_len)?;
    let mut strings = Vec::with_capacity(count);
    for (index, &start) in offsets.iter().enumerate() {
        let end = offsets.get(index + 1).copied().unwrap_or(blob_len);
        if start > end || end > blob_len {
            return Err(FormatError::TruncatedTable("string"));
        }
        let text = std::str::from_utf8(&blob[start..end])
            .map_err(|_| FormatError::TruncatedTable("string"))?;
        strings.push(text.to_string());
    }
    Ok(strings)
}

fn decode_data(region: &[u8]) -> Result<Vec<Vec<u8>>, FormatError> {
    let mut cursor = Cursor::new(region, "data");
    let count = cursor.u16()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let offset = cursor.u16()? as usize;
        let len = cursor.u16()? as usize;
        entries.push((offset, len));
    }
    let blob = &region[cursor.pos..];
    let mut data = Vec::with_capacity(count);
    for (offset, len) in entries {
        let end = offset
            .checked_add(len)
            .ok_or(FormatError::TruncatedTable("data"))?;
        if end > blob.len() {
            return Err(FormatError::TruncatedTable("data"));
        }
        data.push(blob[offset..end].to_vec());
    }
    Ok(data)
}

fn decode_wgsl(region: &[u8], data_count: usize) -> Result<Vec<WgslEntry>, FormatError> {
    let mut cursor = Cursor::new(region, "wgsl");
    let count = cursor.u16()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let data_id = cursor.u16()?;
        if data_id as usize >= data_count {
            return Err(FormatError::DataIdOutOfRange);
        }
        let dep_count = cursor.u16()? as usize;
        let mut deps = Vec::with_capacity(dep_count);
        for _ in 0..dep_count {
            let dep = cursor.u16()?;
            if dep as usize >= count {
                return Err(FormatError::WgslIdOutOfRange);
            }
            deps.push(dep);
        }
        entries.push(WgslEntry { data_id, deps });
    }
    Ok(entries)
}

fn decode_uniforms(region: &[u8], string_count: usize) -> Result<Vec<UniformEntry>, FormatError> {
    let mut cursor = Cursor::new(region, "uniform");
    let count = cursor.u16()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let entry = UniformEntry {
            buffer_id: cursor.u16()?,
            offset: cursor.u16()?,
            size: cursor.u16()?,
            source: cursor.u16()?,
        };
        if entry.source >= SOURCE_USER_BASE
            && (entry.source - SOURCE_USER_BASE) as usize >= string_count
        {
            return Err(FormatError::StringIdOutOfRange);
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn decode_animations(region: &[u8]) -> Result<Vec<AnimationEntry>, FormatError> {
    let mut cursor = Cursor::new(region, "animation");
    let count = cursor.u16()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(AnimationEntry {
            scene_id: cursor.u16()?,
            start_ms: cursor.u32()?,
            duration_ms: cursor.u32()?,
            frame_id: cursor.u16()?,
        });
    }
    Ok(entries)
}

/// Walk the opcode stream once: every opcode must decode, every operand must
/// be canonical, every referenced id must be inside its table, and the stream
/// must end with `end` exactly at its last byte.
fn validate_ops(
    ops: &[u8],
    string_count: usize,
    data_count: usize,
    wgsl_count: usize,
) -> Result<(), FormatError> {
    let mut pos = 0usize;
    loop {
        let byte = *ops.get(pos).ok_or(FormatError::TruncatedOpcodeStream)?;
        pos += 1;
        let op = Op::from_byte(byte).ok_or(FormatError::UnknownOpcode(byte))?;
        if op == Op::End {
            if pos == ops.len() {
                return Ok(());
            }
            return Err(FormatError::TruncatedOpcodeStream);
        }
        let mut operands = [0u32; 5];
        for slot in operands.iter_mut().take(op.operand_count()) {
            let (value, width) = varint::read(ops, pos)?;
            *slot = value;
            pos += width;
        }
        match op {
            Op::CreatePipelineLayout => {
                for _ in 0..operands[1] {
                    let (_, width) = varint::read(ops, pos)?;
                    pos += width;
                }
            }
            Op::CreateTexture
            | Op::CreateSampler
            | Op::CreateBindGroupLayout
            | Op::CreateRenderPipeline
            | Op::CreateComputePipeline
            | Op::CreateBindGroup
            | Op::BeginRenderPass => {
                let data_id = if op == Op::BeginRenderPass {
                    operands[0]
                } else {
                    operands[1]
                };
                if data_id as usize >= data_count {
                    return Err(FormatError::DataIdOutOfRange);
                }
            }
            Op::CreateShaderModule => {
                if operands[1] as usize >= wgsl_count {
                    return Err(FormatError::WgslIdOutOfRange);
                }
            }
            Op::WriteBuffer => {
                if operands[2] as usize >= data_count {
                    return Err(FormatError::DataIdOutOfRange);
                }
            }
            Op::DefineFrame => {
                if operands[1] as usize >= string_count {
                    return Err(FormatError::StringIdOutOfRange);
                }
            }
            Op::CreateBuffer => {
                if operands[4] > 0 && (operands[4] - 1) as usize >= data_count {
                    return Err(FormatError::DataIdOutOfRange);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_module() -> Module {
        let mut ops = Vec::new();
        ops.push(Op::CreateBuffer as u8);
        for operand in [0u32, 16, 0x24, 1, 0] {
            varint::write(&mut ops, operand);
        }
        ops.push(Op::Submit as u8);
        ops.push(Op::DefineFrame as u8);
        varint::write(&mut ops, 0);
        varint::write(&mut ops, 0);
        ops.push(Op::EndFrame as u8);
        ops.push(Op::End as u8);
        Module {
            version: VERSION,
            flags: 0,
            plugins: Plugins::CORE,
            executor: None,
            ops,
            strings: vec!["main".to_string()],
            data: vec![vec![1, 2, 3], vec![]],
            wgsl: vec![WgslEntry {
                data_id: 0,
                deps: vec![],
            }],
            uniforms: vec![UniformEntry {
                buffer_id: 0,
                offset: 0,
                size: 16,
                source: SOURCE_PNGINE_INPUTS,
            }],
            animations: vec![AnimationEntry {
                scene_id: 0,
                start_ms: 0,
                duration_ms: 4000,
                frame_id: 0,
            }],
        }
    }

    #[test]
    fn roundtrip_preserves_everything() {
        let module = sample_module();
        let bytes = module.encode().unwrap();
        assert_eq!(Module::decode(&bytes).unwrap(), module);
    }

    #[test]
    fn roundtrip_with_executor() {
        let mut module = sample_module();
        module.executor = Some(vec![0xaa; 32]);
        let bytes = module.encode().unwrap();
        assert_eq!(Module::decode(&bytes).unwrap(), module);
    }

    #[test]
    fn bad_magic() {
        let mut bytes = sample_module().encode().unwrap();
        bytes[0] = b'X';
        assert_eq!(Module::decode(&bytes), Err(FormatError::BadMagic));
    }

    #[test]
    fn truncated_header() {
        assert_eq!(
            Module::decode(&[0u8; 10]),
            Err(FormatError::TruncatedHeader)
        );
    }

    #[test]
    fn unknown_flags_are_rejected() {
        let mut bytes = sample_module().encode().unwrap();
        bytes[6] = 0x04;
        assert_eq!(Module::decode(&bytes), Err(FormatError::UnsupportedVersion));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = sample_module().encode().unwrap();
        bytes[4] = 9;
        assert_eq!(Module::decode(&bytes), Err(FormatError::UnsupportedVersion));
    }

    #[test]
    fn truncating_the_data_section_fails_cleanly() {
        let bytes = sample_module().encode().unwrap();
        let truncated = &bytes[..bytes.len() - 1];
        assert!(matches!(
            Module::decode(truncated),
            Err(FormatError::TruncatedTable(_)) | Err(FormatError::OffsetOutOfRange(_))
        ));
    }

    #[test]
    fn unknown_opcode_fails_decode() {
        let mut module = sample_module();
        let end = module.ops.len() - 1;
        module.ops.insert(end, 0x42);
        let bytes = module.encode().unwrap();
        assert_eq!(Module::decode(&bytes), Err(FormatError::UnknownOpcode(0x42)));
    }

    #[test]
    fn out_of_range_data_id_fails_decode() {
        let mut module = sample_module();
        module.ops.clear();
        module.ops.push(Op::CreateTexture as u8);
        varint::write(&mut module.ops, 0);
        varint::write(&mut module.ops, 7);
        module.ops.push(Op::End as u8);
        let bytes = module.encode().unwrap();
        assert_eq!(Module::decode(&bytes), Err(FormatError::DataIdOutOfRange));
    }

    #[test]
    fn string_table_overflow_is_reported() {
        let mut module = sample_module();
        module.strings = vec!["x".repeat(40_000), "y".repeat(40_000)];
        assert_eq!(
            module.encode(),
            Err(EmitError::TableOverflow { table: "string" })
        );
    }
}
