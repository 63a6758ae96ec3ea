//! Field schemas: typed access to the fields of a parsed macro body.
//!
//! [`Fields`] wraps one record node and hands out coerced values, recording
//! which fields were consumed so the analyzer can flag unknown ones. Numeric
//! coercion is one-way: integers widen to floats, nothing else converts.
//! `$define.name` references substitute their literal value here, so every
//! consumer downstream only ever sees literals.

use std::rc::Rc;

use indexmap::IndexMap;

use super::{AnalyzeError, AnalyzeErrorKind};
use crate::diag::Span;
use crate::lexer::{self, Tag};
use crate::parser::{Ast, NodeTag};
use crate::scene::{
    AddressMode, BindingType, BufferUsages, CompareFunction, FilterMode, IndexFormat, LoadOp,
    PrimitiveTopology, StoreOp, TextureFormat, TextureUsages, VertexFormat, VertexStepMode,
};

/// A `#define` value after evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum DefineValue {
    Int(i64),
    Float(f64),
    Str(String),
}

/// A field value after define substitution.
#[derive(Clone, Debug)]
pub enum Value<'a> {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(&'a str),
    Reference { ns: &'a str, name: &'a str },
    List(Vec<u32>),
    Record(u32),
}

/// Typed view over one record node's fields.
pub struct Fields<'a> {
    ast: &'a Ast,
    source: &'a str,
    defines: Rc<IndexMap<String, DefineValue>>,
    entries: IndexMap<&'a str, FieldEntry>,
    record_span: Span,
}

struct FieldEntry {
    value: u32,
    name_span: Span,
    used: bool,
}

impl<'a> Fields<'a> {
    pub fn new(
        ast: &'a Ast,
        source: &'a str,
        defines: Rc<IndexMap<String, DefineValue>>,
        record: u32,
        errors: &mut Vec<AnalyzeError>,
    ) -> Self {
        let node = ast.node(record);
        debug_assert_eq!(node.tag, NodeTag::Record);
        let mut entries = IndexMap::new();
        for &field_id in ast.children(node) {
            let field = ast.node(field_id);
            let name_span = ast.token(field.token).span;
            let name = name_span.slice(source);
            if entries
                .insert(
                    name,
                    FieldEntry {
                        value: field.lhs,
                        name_span,
                        used: false,
                    },
                )
                .is_some()
            {
                errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::DuplicateField {
                        field: name.to_string(),
                    },
                    span: name_span,
                });
            }
        }
        Self {
            ast,
            source,
            defines,
            entries,
            record_span: ast.node_span(record),
        }
    }

    /// Resolve a value node, substituting `$define` references.
    pub fn value(&self, node_id: u32) -> Value<'a> {
        let node = self.ast.node(node_id);
        match node.tag {
            NodeTag::Number => {
                let token = self.ast.token(node.token);
                let text = token.span.slice(self.source);
                match token.tag {
                    Tag::Int => Value::Int(text.parse().unwrap_or(0)),
                    _ => Value::Float(text.parse().unwrap_or(0.0)),
                }
            }
            NodeTag::Str => Value::Str(lexer::string_value(
                self.source,
                self.ast.token(node.token).span,
            )),
            NodeTag::Ident => Value::Ident(self.ast.token(node.token).span.slice(self.source)),
            NodeTag::Reference => {
                let span = self.ast.token(node.token).span;
                let (ns, name) = lexer::reference_parts(self.source, span);
                if ns == "define" {
                    if let Some(value) = self.defines.get(name) {
                        return match value {
                            DefineValue::Int(v) => Value::Int(*v),
                            DefineValue::Float(v) => Value::Float(*v),
                            DefineValue::Str(v) => Value::Str(v.clone()),
                        };
                    }
                }
                Value::Reference { ns, name }
            }
            NodeTag::List => Value::List(self.ast.children(node).to_vec()),
            NodeTag::Record => Value::Record(node_id),
            _ => unreachable!("field values are leaves or containers"),
        }
    }

    pub fn node_span(&self, node_id: u32) -> Span {
        self.ast.node_span(node_id)
    }

    fn take(&mut self, name: &str) -> Option<(u32, Span)> {
        let entry = self.entries.get_mut(name)?;
        entry.used = true;
        Some((entry.value, entry.name_span))
    }

    /// Whether `name` is present (does not mark it consumed).
    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn mismatch(&self, field: &str, expected: &'static str, span: Span) -> AnalyzeError {
        AnalyzeError {
            kind: AnalyzeErrorKind::TypeMismatch {
                field: field.to_string(),
                expected,
            },
            span,
        }
    }

    fn missing(&self, field: &'static str) -> AnalyzeError {
        AnalyzeError {
            kind: AnalyzeErrorKind::MissingField { field },
            span: self.record_span,
        }
    }

    pub fn opt_node(&mut self, name: &str) -> Option<(u32, Span)> {
        self.take(name)
    }

    pub fn opt_i64(&mut self, name: &str) -> Result<Option<i64>, AnalyzeError> {
        let Some((node, span)) = self.take(name) else {
            return Ok(None);
        };
        match self.value(node) {
            Value::Int(v) => Ok(Some(v)),
            _ => Err(self.mismatch(name, "an integer", span.merge(self.node_span(node)))),
        }
    }

    pub fn opt_u32(&mut self, name: &str) -> Result<Option<u32>, AnalyzeError> {
        let span = self.entries.get(name).map(|e| e.name_span);
        match self.opt_i64(name)? {
            None => Ok(None),
            Some(v) if (0..=u32::MAX as i64).contains(&v) => Ok(Some(v as u32)),
            Some(_) => Err(self.mismatch(name, "an unsigned 32-bit integer", span.unwrap_or_default())),
        }
    }

    pub fn req_u32(&mut self, name: &'static str) -> Result<u32, AnalyzeError> {
        self.opt_u32(name)?.ok_or_else(|| self.missing(name))
    }

    pub fn opt_u16(&mut self, name: &str) -> Result<Option<u16>, AnalyzeError> {
        let span = self.entries.get(name).map(|e| e.name_span);
        match self.opt_i64(name)? {
            None => Ok(None),
            Some(v) if (0..=u16::MAX as i64).contains(&v) => Ok(Some(v as u16)),
            Some(_) => Err(self.mismatch(name, "an unsigned 16-bit integer", span.unwrap_or_default())),
        }
    }

    pub fn opt_string(&mut self, name: &str) -> Result<Option<String>, AnalyzeError> {
        let Some((node, span)) = self.take(name) else {
            return Ok(None);
        };
        match self.value(node) {
            Value::Str(v) => Ok(Some(v)),
            _ => Err(self.mismatch(name, "a string", span.merge(self.node_span(node)))),
        }
    }

    pub fn req_string(&mut self, name: &'static str) -> Result<String, AnalyzeError> {
        self.opt_string(name)?.ok_or_else(|| self.missing(name))
    }

    pub fn opt_ident(&mut self, name: &str) -> Result<Option<(&'a str, Span)>, AnalyzeError> {
        let Some((node, span)) = self.take(name) else {
            return Ok(None);
        };
        match self.value(node) {
            Value::Ident(v) => Ok(Some((v, self.node_span(node)))),
            _ => Err(self.mismatch(name, "an identifier", span.merge(self.node_span(node)))),
        }
    }

    /// Boolean field, written as the identifiers `true` / `false`.
    pub fn opt_bool(&mut self, name: &str) -> Result<Option<bool>, AnalyzeError> {
        let Some((node, span)) = self.take(name) else {
            return Ok(None);
        };
        match self.value(node) {
            Value::Ident("true") => Ok(Some(true)),
            Value::Ident("false") => Ok(Some(false)),
            _ => Err(self.mismatch(name, "`true` or `false`", span.merge(self.node_span(node)))),
        }
    }

    /// A reference field; namespace checking happens at resolution time.
    pub fn opt_reference(&mut self, name: &str) -> Result<Option<(&'a str, &'a str, Span)>, AnalyzeError> {
        let Some((node, span)) = self.take(name) else {
            return Ok(None);
        };
        match self.value(node) {
            Value::Reference { ns, name: target } => Ok(Some((ns, target, self.node_span(node)))),
            _ => Err(self.mismatch(name, "a reference", span.merge(self.node_span(node)))),
        }
    }

    pub fn req_reference(
        &mut self,
        name: &'static str,
    ) -> Result<(&'a str, &'a str, Span), AnalyzeError> {
        self.opt_reference(name)?.ok_or_else(|| self.missing(name))
    }

    /// A list field; returns the element node ids.
    pub fn opt_list(&mut self, name: &str) -> Result<Option<Vec<u32>>, AnalyzeError> {
        let Some((node, span)) = self.take(name) else {
            return Ok(None);
        };
        match self.value(node) {
            Value::List(items) => Ok(Some(items)),
            _ => Err(self.mismatch(name, "a list", span.merge(self.node_span(node)))),
        }
    }

    pub fn req_list(&mut self, name: &'static str) -> Result<Vec<u32>, AnalyzeError> {
        self.opt_list(name)?.ok_or_else(|| self.missing(name))
    }

    pub fn opt_record(&mut self, name: &str) -> Result<Option<u32>, AnalyzeError> {
        let Some((node, span)) = self.take(name) else {
            return Ok(None);
        };
        match self.value(node) {
            Value::Record(id) => Ok(Some(id)),
            _ => Err(self.mismatch(name, "a record", span.merge(self.node_span(node)))),
        }
    }

    pub fn req_record(&mut self, name: &'static str) -> Result<u32, AnalyzeError> {
        self.opt_record(name)?.ok_or_else(|| self.missing(name))
    }

    /// Report every field the schema never consumed.
    pub fn finish(self, errors: &mut Vec<AnalyzeError>) {
        for (name, entry) in &self.entries {
            if !entry.used {
                errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::UnknownField {
                        field: name.to_string(),
                    },
                    span: entry.name_span,
                });
            }
        }
    }
}

/// `usage = [VERTEX, COPY_DST]` for buffers.
pub fn buffer_usage(name: &str) -> Option<BufferUsages> {
    Some(match name {
        "VERTEX" => BufferUsages::VERTEX,
        "INDEX" => BufferUsages::INDEX,
        "UNIFORM" => BufferUsages::UNIFORM,
        "STORAGE" => BufferUsages::STORAGE,
        "COPY_SRC" => BufferUsages::COPY_SRC,
        "COPY_DST" => BufferUsages::COPY_DST,
        "MAP_READ" => BufferUsages::MAP_READ,
        "MAP_WRITE" => BufferUsages::MAP_WRITE,
        _ => return None,
    })
}

pub fn texture_usage(name: &str) -> Option<TextureUsages> {
    Some(match name {
        "TEXTURE_BINDING" => TextureUsages::TEXTURE_BINDING,
        "STORAGE_BINDING" => TextureUsages::STORAGE_BINDING,
        "RENDER_ATTACHMENT" => TextureUsages::RENDER_ATTACHMENT,
        "COPY_SRC" => TextureUsages::COPY_SRC,
        "COPY_DST" => TextureUsages::COPY_DST,
        _ => return None,
    })
}

pub fn texture_format(name: &str) -> Option<TextureFormat> {
    Some(match name {
        "rgba8unorm" => TextureFormat::Rgba8Unorm,
        "bgra8unorm" => TextureFormat::Bgra8Unorm,
        "rgba16float" => TextureFormat::Rgba16Float,
        "rgba32float" => TextureFormat::Rgba32Float,
        "r32float" => TextureFormat::R32Float,
        "rg32float" => TextureFormat::Rg32Float,
        "depth24plus" => TextureFormat::Depth24Plus,
        "depth32float" => TextureFormat::Depth32Float,
        _ => return None,
    })
}

pub fn filter_mode(name: &str) -> Option<FilterMode> {
    Some(match name {
        "nearest" => FilterMode::Nearest,
        "linear" => FilterMode::Linear,
        _ => return None,
    })
}

pub fn address_mode(name: &str) -> Option<AddressMode> {
    Some(match name {
        "clampToEdge" => AddressMode::ClampToEdge,
        "repeat" => AddressMode::Repeat,
        "mirrorRepeat" => AddressMode::MirrorRepeat,
        _ => return None,
    })
}

pub fn binding_type(name: &str) -> Option<BindingType> {
    Some(match name {
        "uniform" => BindingType::Uniform,
        "storage" => BindingType::Storage,
        "readOnlyStorage" => BindingType::ReadOnlyStorage,
        "sampler" => BindingType::Sampler,
        "texture" => BindingType::Texture,
        "storageTexture" => BindingType::StorageTexture,
        _ => return None,
    })
}

pub fn shader_stage(name: &str) -> Option<u32> {
    Some(match name {
        "VERTEX" => 1 << 0,
        "FRAGMENT" => 1 << 1,
        "COMPUTE" => 1 << 2,
        _ => return None,
    })
}

pub fn primitive_topology(name: &str) -> Option<PrimitiveTopology> {
    Some(match name {
        "pointList" => PrimitiveTopology::PointList,
        "lineList" => PrimitiveTopology::LineList,
        "lineStrip" => PrimitiveTopology::LineStrip,
        "triangleList" => PrimitiveTopology::TriangleList,
        "triangleStrip" => PrimitiveTopology::TriangleStrip,
        _ => return None,
    })
}

pub fn vertex_format(name: &str) -> Option<VertexFormat> {
    Some(match name {
        "float32" => VertexFormat::Float32,
        "float32x2" => VertexFormat::Float32x2,
        "float32x3" => VertexFormat::Float32x3,
        "float32x4" => VertexFormat::Float32x4,
        "uint32" => VertexFormat::Uint32,
        "sint32" => VertexFormat::Sint32,
        _ => return None,
    })
}

pub fn step_mode(name: &str) -> Option<VertexStepMode> {
    Some(match name {
        "vertex" => VertexStepMode::Vertex,
        "instance" => VertexStepMode::Instance,
        _ => return None,
    })
}

pub fn index_format(name: &str) -> Option<IndexFormat> {
    Some(match name {
        "uint16" => IndexFormat::Uint16,
        "uint32" => IndexFormat::Uint32,
        _ => return None,
    })
}

pub fn load_op(name: &str) -> Option<LoadOp> {
    Some(match name {
        "clear" => LoadOp::Clear,
        "load" => LoadOp::Load,
        _ => return None,
    })
}

pub fn store_op(name: &str) -> Option<StoreOp> {
    Some(match name {
        "store" => StoreOp::Store,
        "discard" => StoreOp::Discard,
        _ => return None,
    })
}

pub fn compare_function(name: &str) -> Option<CompareFunction> {
    Some(match name {
        "never" => CompareFunction::Never,
        "less" => CompareFunction::Less,
        "lessEqual" => CompareFunction::LessEqual,
        "greater" => CompareFunction::Greater,
        "greaterEqual" => CompareFunction::GreaterEqual,
        "equal" => CompareFunction::Equal,
        "notEqual" => CompareFunction::NotEqual,
        "always" => CompareFunction::Always,
        _ => return None,
    })
}
