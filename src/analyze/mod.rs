//! Semantic analysis: symbol tables, reference resolution, plugin detection.
//!
//! The analyzer runs two passes over the AST. The declaration pass fills one
//! insertion-ordered table per namespace, so every name already has its dense
//! declaration index before any field is looked at. The field pass then
//! validates each macro body against its schema, resolves `$ns.name`
//! references against those tables, checks the WGSL import graph for cycles,
//! and enforces pool consistency across buffers and bind groups.
//!
//! Unlike the lexer and parser, analysis never stops at the first problem:
//! errors accumulate and the caller receives the full list. A declaration
//! whose body fails validation still lands in its namespace with a
//! best-effort entry, so later references keep resolving to stable ids. A
//! duplicate name is rejected outright: the first declaration keeps the
//! name and the duplicate consumes no index.

pub mod schema;

use std::rc::Rc;

use indexmap::IndexMap;

use crate::diag::{Located, Span};
use crate::lexer::{MacroKind, Tag};
use crate::parser::{Ast, NodeTag};
use crate::scene::*;
use schema::{DefineValue, Fields, Value};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalyzeErrorKind {
    Duplicate { name: String },
    DuplicateField { field: String },
    UnknownField { field: String },
    MissingField { field: &'static str },
    TypeMismatch { field: String, expected: &'static str },
    UnresolvedReference { ns: String, name: String },
    WrongNamespace { expected: &'static str, got: String },
    ImportCycle { members: Vec<String> },
    PoolMismatch { group: String, buffer: String },
    PoolOffsetOutOfRange { offset: u16, pool: u16 },
    InvalidFrameEntry { name: String },
    BadValue { field: String, reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalyzeError {
    pub kind: AnalyzeErrorKind,
    pub span: Span,
}

impl std::error::Error for AnalyzeError {}

impl std::fmt::Display for AnalyzeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AnalyzeErrorKind::Duplicate { name } => {
                write!(f, "duplicate declaration of `{name}`")
            }
            AnalyzeErrorKind::DuplicateField { field } => {
                write!(f, "field `{field}` given twice")
            }
            AnalyzeErrorKind::UnknownField { field } => write!(f, "unknown field `{field}`"),
            AnalyzeErrorKind::MissingField { field } => {
                write!(f, "required field `{field}` is missing")
            }
            AnalyzeErrorKind::TypeMismatch { field, expected } => {
                write!(f, "field `{field}` expects {expected}")
            }
            AnalyzeErrorKind::UnresolvedReference { ns, name } => {
                write!(f, "`${ns}.{name}` does not resolve to a declaration")
            }
            AnalyzeErrorKind::WrongNamespace { expected, got } => {
                write!(f, "expected a `${expected}` reference, found `${got}`")
            }
            AnalyzeErrorKind::ImportCycle { members } => {
                write!(f, "wgsl import cycle: {}", members.join(" -> "))
            }
            AnalyzeErrorKind::PoolMismatch { group, buffer } => {
                write!(
                    f,
                    "bind group `{group}` must declare the pool size of buffer `{buffer}` or pick a fixed offset"
                )
            }
            AnalyzeErrorKind::PoolOffsetOutOfRange { offset, pool } => {
                write!(f, "pool offset {offset} is out of range for pool size {pool}")
            }
            AnalyzeErrorKind::InvalidFrameEntry { name } => {
                write!(f, "frame entry `{name}` is not a pass or queue")
            }
            AnalyzeErrorKind::BadValue { field, reason } => {
                write!(f, "invalid `{field}`: {reason}")
            }
        }
    }
}

impl Located for AnalyzeError {
    fn span(&self) -> Span {
        self.span
    }
}

/// A uniform field reported by an external WGSL reflector.
#[derive(Clone, Debug)]
pub struct ReflectedField {
    /// Buffer declaration name the field belongs to.
    pub buffer: String,
    pub offset: u16,
    pub size: u16,
    /// Runtime source name, e.g. `pngineInputs` or a user-defined tag.
    pub source: String,
}

/// Optional hook into the external WGSL reflector tool.
pub trait Reflector {
    fn uniform_fields(&self, wgsl_source: &str) -> Vec<ReflectedField>;
}

/// Analyze a parsed scene without reflection metadata.
pub fn analyze(source: &str, ast: &Ast) -> Result<Scene, Vec<AnalyzeError>> {
    analyze_with(source, ast, None)
}

/// Analyze a parsed scene, filling uniform layouts from `reflector` where
/// buffers did not declare them.
pub fn analyze_with(
    source: &str,
    ast: &Ast,
    reflector: Option<&dyn Reflector>,
) -> Result<Scene, Vec<AnalyzeError>> {
    let mut analyzer = Analyzer {
        source,
        ast,
        defines: Rc::new(IndexMap::new()),
        decls: Decls::default(),
        errors: Vec::new(),
        scene: Scene::default(),
    };
    analyzer.declaration_pass();
    analyzer.field_pass(reflector);
    if analyzer.errors.is_empty() {
        Ok(analyzer.scene)
    } else {
        Err(analyzer.errors)
    }
}

#[derive(Clone, Copy)]
struct Site {
    body: u32,
    name_span: Span,
}

#[derive(Default)]
struct Decls<'a> {
    data: IndexMap<&'a str, Site>,
    wgsl: IndexMap<&'a str, Site>,
    buffer: IndexMap<&'a str, Site>,
    texture: IndexMap<&'a str, Site>,
    sampler: IndexMap<&'a str, Site>,
    bind_group_layout: IndexMap<&'a str, Site>,
    pipeline_layout: IndexMap<&'a str, Site>,
    render_pipeline: IndexMap<&'a str, Site>,
    compute_pipeline: IndexMap<&'a str, Site>,
    bind_group: IndexMap<&'a str, Site>,
    render_pass: IndexMap<&'a str, Site>,
    compute_pass: IndexMap<&'a str, Site>,
    queue: IndexMap<&'a str, Site>,
    frame: IndexMap<&'a str, Site>,
    animation: IndexMap<&'a str, Site>,
    wasm_call: IndexMap<&'a str, Site>,
}

impl Decls<'_> {
    /// Resolve a reference expected to land in `kind`'s namespace.
    fn resolve(
        &self,
        errors: &mut Vec<AnalyzeError>,
        kind: RefKind,
        ns: &str,
        name: &str,
        span: Span,
    ) -> Option<u16> {
        let expected = ns_keyword(kind);
        if ns != expected {
            errors.push(AnalyzeError {
                kind: AnalyzeErrorKind::WrongNamespace {
                    expected,
                    got: ns.to_string(),
                },
                span,
            });
            return None;
        }
        match self.table(kind).get_index_of(name) {
            Some(index) => Some(index as u16),
            None => {
                errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::UnresolvedReference {
                        ns: ns.to_string(),
                        name: name.to_string(),
                    },
                    span,
                });
                None
            }
        }
    }

    fn table(&self, kind: RefKind) -> &IndexMap<&str, Site> {
        match kind {
            RefKind::Buffer => &self.buffer,
            RefKind::Texture => &self.texture,
            RefKind::Sampler => &self.sampler,
            RefKind::Wgsl => &self.wgsl,
            RefKind::BindGroupLayout => &self.bind_group_layout,
            RefKind::PipelineLayout => &self.pipeline_layout,
            RefKind::BindGroup => &self.bind_group,
            RefKind::RenderPipeline => &self.render_pipeline,
            RefKind::ComputePipeline => &self.compute_pipeline,
            RefKind::RenderPass => &self.render_pass,
            RefKind::ComputePass => &self.compute_pass,
            RefKind::Frame => &self.frame,
            RefKind::Queue => &self.queue,
            RefKind::Data => &self.data,
        }
    }
}

fn ns_keyword(kind: RefKind) -> &'static str {
    match kind {
        RefKind::Buffer => "buffer",
        RefKind::Texture => "texture",
        RefKind::Sampler => "sampler",
        RefKind::Wgsl => "wgsl",
        RefKind::BindGroupLayout => "bindGroupLayout",
        RefKind::PipelineLayout => "pipelineLayout",
        RefKind::BindGroup => "bindGroup",
        RefKind::RenderPipeline => "renderPipeline",
        RefKind::ComputePipeline => "computePipeline",
        RefKind::RenderPass => "renderPass",
        RefKind::ComputePass => "computePass",
        RefKind::Frame => "frame",
        RefKind::Queue => "queue",
        RefKind::Data => "data",
    }
}

/// Unwrap a schema result, stashing its error and substituting a fallback.
fn ok_or<T>(errors: &mut Vec<AnalyzeError>, result: Result<T, AnalyzeError>, fallback: T) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            errors.push(err);
            fallback
        }
    }
}

struct Analyzer<'a> {
    source: &'a str,
    ast: &'a Ast,
    defines: Rc<IndexMap<String, DefineValue>>,
    decls: Decls<'a>,
    errors: Vec<AnalyzeError>,
    scene: Scene,
}

impl<'a> Analyzer<'a> {
    fn fields(&mut self, record: u32) -> Fields<'a> {
        Fields::new(
            self.ast,
            self.source,
            Rc::clone(&self.defines),
            record,
            &mut self.errors,
        )
    }

    fn site(table: &IndexMap<&'a str, Site>, index: usize) -> (&'a str, Site) {
        let (name, site) = table.get_index(index).expect("index in range");
        (*name, *site)
    }

    // ---- declaration pass -------------------------------------------------

    fn declaration_pass(&mut self) {
        let ast = self.ast;
        let root = ast.node(0);
        let mut defines = IndexMap::new();
        for &decl_id in ast.children(root) {
            let decl = ast.node(decl_id);
            debug_assert_eq!(decl.tag, NodeTag::MacroDecl);
            let keyword = ast.token(decl.token);
            let name_span = ast.token(decl.lhs).span;
            let name = name_span.slice(self.source);
            let site = Site {
                body: decl.rhs,
                name_span,
            };
            let kind = match keyword.tag {
                Tag::Macro(kind) => kind,
                _ => continue,
            };
            if kind == MacroKind::Define {
                self.define_decl(&mut defines, name, site);
                continue;
            }
            let table = match kind {
                MacroKind::Buffer => &mut self.decls.buffer,
                MacroKind::Texture => &mut self.decls.texture,
                MacroKind::Sampler => &mut self.decls.sampler,
                MacroKind::Wgsl => &mut self.decls.wgsl,
                MacroKind::BindGroupLayout => &mut self.decls.bind_group_layout,
                MacroKind::PipelineLayout => &mut self.decls.pipeline_layout,
                MacroKind::BindGroup => &mut self.decls.bind_group,
                MacroKind::RenderPipeline => &mut self.decls.render_pipeline,
                MacroKind::ComputePipeline => &mut self.decls.compute_pipeline,
                MacroKind::RenderPass => &mut self.decls.render_pass,
                MacroKind::ComputePass => &mut self.decls.compute_pass,
                MacroKind::Frame => &mut self.decls.frame,
                MacroKind::Queue => &mut self.decls.queue,
                MacroKind::Animation => &mut self.decls.animation,
                MacroKind::WasmCall => &mut self.decls.wasm_call,
                MacroKind::Data => &mut self.decls.data,
                MacroKind::Define => unreachable!("handled above"),
            };
            if table.contains_key(name) {
                self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::Duplicate {
                        name: name.to_string(),
                    },
                    span: name_span,
                });
            } else {
                table.insert(name, site);
            }
        }
        self.defines = Rc::new(defines);
    }

    /// Defines are evaluated immediately; their values must be literals.
    /// A define cannot reference another define.
    fn define_decl(
        &mut self,
        defines: &mut IndexMap<String, DefineValue>,
        name: &str,
        site: Site,
    ) {
        if defines.contains_key(name) {
            self.errors.push(AnalyzeError {
                kind: AnalyzeErrorKind::Duplicate {
                    name: name.to_string(),
                },
                span: site.name_span,
            });
            return;
        }
        let mut fields = self.fields(site.body);
        let value = match fields.opt_node("value") {
            Some((node, _)) => match fields.value(node) {
                Value::Int(v) => Some(DefineValue::Int(v)),
                Value::Float(v) => Some(DefineValue::Float(v)),
                Value::Str(v) => Some(DefineValue::Str(v)),
                _ => {
                    self.errors.push(AnalyzeError {
                        kind: AnalyzeErrorKind::TypeMismatch {
                            field: "value".to_string(),
                            expected: "a number or string literal",
                        },
                        span: fields.node_span(node),
                    });
                    None
                }
            },
            None => {
                self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::MissingField { field: "value" },
                    span: site.name_span,
                });
                None
            }
        };
        fields.finish(&mut self.errors);
        if let Some(value) = value {
            defines.insert(name.to_string(), value);
        }
    }

    // ---- field pass -------------------------------------------------------

    fn field_pass(&mut self, reflector: Option<&dyn Reflector>) {
        self.pass_data();
        self.pass_wgsl();
        self.pass_buffers();
        self.pass_textures();
        self.pass_samplers();
        self.pass_bind_group_layouts();
        self.pass_pipeline_layouts();
        self.pass_render_pipelines();
        self.pass_compute_pipelines();
        self.pass_bind_groups();
        self.pass_render_passes();
        self.pass_compute_passes();
        self.pass_queues();
        self.pass_frames();
        self.pass_animations();
        self.pass_wasm_calls();
        if let Some(reflector) = reflector {
            self.apply_reflection(reflector);
        }
        self.warn_unreflected();
        self.detect_plugins();
    }

    fn pass_data(&mut self) {
        for index in 0..self.decls.data.len() {
            let (name, site) = Self::site(&self.decls.data, index);
            let mut fields = self.fields(site.body);
            let mut bytes = Vec::new();
            if let Some((values, _)) = fields.opt_node("values") {
                let kind = ok_or(&mut self.errors, fields.opt_ident("kind"), None);
                let kind_name = kind.map(|(k, _)| k).unwrap_or("f32");
                if let Some((kind_name, span)) = kind {
                    if !matches!(kind_name, "f32" | "u32" | "u16" | "u8") {
                        self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::BadValue {
                                field: "kind".to_string(),
                                reason: format!("`{kind_name}` is not a scalar kind"),
                            },
                            span,
                        });
                    }
                }
                match fields.value(values) {
                    Value::List(items) => {
                        for item in items {
                            Self::push_scalar(
                                &mut self.errors,
                                &fields,
                                kind_name,
                                item,
                                &mut bytes,
                            );
                        }
                    }
                    _ => self.errors.push(AnalyzeError {
                        kind: AnalyzeErrorKind::TypeMismatch {
                            field: "values".to_string(),
                            expected: "a list",
                        },
                        span: fields.node_span(values),
                    }),
                }
            } else if let Some(text) = ok_or(&mut self.errors, fields.opt_string("text"), None) {
                bytes = text.into_bytes();
            } else {
                self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::MissingField { field: "values" },
                    span: site.name_span,
                });
            }
            fields.finish(&mut self.errors);
            self.scene.data.insert(name.to_string(), DataDecl { bytes });
        }
    }

    fn push_scalar(
        errors: &mut Vec<AnalyzeError>,
        fields: &Fields<'_>,
        kind: &str,
        item: u32,
        bytes: &mut Vec<u8>,
    ) {
        let span = fields.node_span(item);
        let (number, integral) = match fields.value(item) {
            Value::Int(v) => (v as f64, true),
            Value::Float(v) => (v, false),
            _ => {
                errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::TypeMismatch {
                        field: "values".to_string(),
                        expected: "a number",
                    },
                    span,
                });
                return;
            }
        };
        match kind {
            "f32" => bytes.extend_from_slice(&(number as f32).to_le_bytes()),
            "u32" | "u16" | "u8" if !integral => errors.push(AnalyzeError {
                kind: AnalyzeErrorKind::TypeMismatch {
                    field: "values".to_string(),
                    expected: "an integer",
                },
                span,
            }),
            "u32" => bytes.extend_from_slice(&(number as i64 as u32).to_le_bytes()),
            "u16" => bytes.extend_from_slice(&(number as i64 as u16).to_le_bytes()),
            "u8" => bytes.push(number as i64 as u8),
            _ => {}
        }
    }

    fn pass_wgsl(&mut self) {
        for index in 0..self.decls.wgsl.len() {
            let (name, site) = Self::site(&self.decls.wgsl, index);
            let mut fields = self.fields(site.body);
            let source = ok_or(&mut self.errors, fields.req_string("code"), String::new());
            let mut imports = Vec::new();
            if let Some(items) = ok_or(&mut self.errors, fields.opt_list("imports"), None) {
                for item in items {
                    let span = fields.node_span(item);
                    match fields.value(item) {
                        Value::Reference { ns, name } => {
                            if let Some(id) = self.decls.resolve(
                                &mut self.errors,
                                RefKind::Wgsl,
                                ns,
                                name,
                                span,
                            ) {
                                imports.push(id);
                            }
                        }
                        _ => self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::TypeMismatch {
                                field: "imports".to_string(),
                                expected: "a `$wgsl` reference",
                            },
                            span,
                        }),
                    }
                }
            }
            fields.finish(&mut self.errors);
            self.scene
                .wgsl
                .insert(name.to_string(), WgslDecl { source, imports });
        }
        self.check_wgsl_cycles();
    }

    /// Iterative three-color DFS over the import graph. A gray-gray edge is a
    /// cycle; the offending members are reported once, in stack order.
    fn check_wgsl_cycles(&mut self) {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;
        let count = self.scene.wgsl.len();
        let mut color = vec![WHITE; count];
        let mut finish_order = Vec::with_capacity(count);
        let mut cycle: Option<Vec<usize>> = None;

        for start in 0..count {
            if color[start] != WHITE || cycle.is_some() {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            color[start] = GRAY;
            while let Some(&(node, next)) = stack.last() {
                let imports = &self.scene.wgsl[node].imports;
                if next < imports.len() {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    let dep = imports[next] as usize;
                    match color[dep] {
                        WHITE => {
                            color[dep] = GRAY;
                            stack.push((dep, 0));
                        }
                        GRAY => {
                            // Everything from `dep` up the stack is the cycle.
                            let members: Vec<usize> = stack
                                .iter()
                                .map(|&(n, _)| n)
                                .skip_while(|&n| n != dep)
                                .collect();
                            cycle = Some(members);
                            break;
                        }
                        _ => {}
                    }
                    continue;
                }
                stack.pop();
                color[node] = BLACK;
                finish_order.push(node as u16);
            }
            if cycle.is_some() {
                break;
            }
        }

        match cycle {
            Some(members) => {
                let names: Vec<String> = members
                    .iter()
                    .map(|&i| {
                        self.scene
                            .wgsl
                            .get_index(i)
                            .map(|(name, _)| name.clone())
                            .unwrap_or_default()
                    })
                    .collect();
                let span = members
                    .first()
                    .and_then(|&i| self.decls.wgsl.get_index(i))
                    .map(|(_, site)| site.name_span)
                    .unwrap_or_default();
                self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::ImportCycle { members: names },
                    span,
                });
            }
            None => self.scene.wgsl_order = finish_order,
        }
    }

    fn pass_buffers(&mut self) {
        for index in 0..self.decls.buffer.len() {
            let (name, site) = Self::site(&self.decls.buffer, index);
            let mut fields = self.fields(site.body);

            let mut usage = BufferUsages::empty();
            match fields.req_list("usage") {
                Ok(items) => {
                    for item in items {
                        let span = fields.node_span(item);
                        match fields.value(item) {
                            Value::Ident(flag) => match schema::buffer_usage(flag) {
                                Some(bit) => usage |= bit,
                                None => self.errors.push(AnalyzeError {
                                    kind: AnalyzeErrorKind::BadValue {
                                        field: "usage".to_string(),
                                        reason: format!("unknown usage `{flag}`"),
                                    },
                                    span,
                                }),
                            },
                            _ => self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::TypeMismatch {
                                    field: "usage".to_string(),
                                    expected: "a usage identifier",
                                },
                                span,
                            }),
                        }
                    }
                }
                Err(err) => self.errors.push(err),
            }

            let data = match ok_or(&mut self.errors, fields.opt_reference("data"), None) {
                Some((ns, target, span)) => {
                    self.decls
                        .resolve(&mut self.errors, RefKind::Data, ns, target, span)
                }
                None => None,
            };

            let size = match ok_or(&mut self.errors, fields.opt_u32("size"), None) {
                Some(size) => size,
                None => match data.and_then(|id| self.scene.data.get_index(id as usize)) {
                    Some((_, decl)) => decl.bytes.len() as u32,
                    None => {
                        self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::MissingField { field: "size" },
                            span: site.name_span,
                        });
                        0
                    }
                },
            };

            let pool = ok_or(&mut self.errors, fields.opt_u16("pool"), None).unwrap_or(1);
            if pool == 0 {
                self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::BadValue {
                        field: "pool".to_string(),
                        reason: "pool size must be at least 1".to_string(),
                    },
                    span: site.name_span,
                });
            }

            let mut uniforms = Vec::new();
            if let Some(stream) = ok_or(&mut self.errors, fields.opt_string("stream"), None) {
                uniforms.push(Self::stream_field(
                    &mut self.errors,
                    &stream,
                    size,
                    site.name_span,
                ));
            }
            if let Some(items) = ok_or(&mut self.errors, fields.opt_list("fields"), None) {
                for item in items {
                    let span = fields.node_span(item);
                    let Value::Record(record) = fields.value(item) else {
                        self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::TypeMismatch {
                                field: "fields".to_string(),
                                expected: "a record",
                            },
                            span,
                        });
                        continue;
                    };
                    let mut sub = self.fields(record);
                    let offset = ok_or(&mut self.errors, sub.opt_u16("offset"), None).unwrap_or(0);
                    let field_size = ok_or(&mut self.errors, sub.opt_u16("size"), None).unwrap_or(0);
                    let source = ok_or(&mut self.errors, sub.req_string("source"), String::new());
                    sub.finish(&mut self.errors);
                    if u32::from(offset) + u32::from(field_size) > size {
                        self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::BadValue {
                                field: "fields".to_string(),
                                reason: format!(
                                    "field at offset {offset} with size {field_size} exceeds the {size}-byte buffer"
                                ),
                            },
                            span,
                        });
                    }
                    uniforms.push(UniformField {
                        offset,
                        size: field_size,
                        source: uniform_source(&source),
                    });
                }
            }

            fields.finish(&mut self.errors);
            self.scene.buffers.insert(
                name.to_string(),
                BufferDecl {
                    size,
                    usage,
                    pool: pool.max(1),
                    data,
                    uniforms,
                },
            );
        }
    }

    fn stream_field(
        errors: &mut Vec<AnalyzeError>,
        stream: &str,
        buffer_size: u32,
        span: Span,
    ) -> UniformField {
        let source = uniform_source(stream);
        let size = match source {
            UniformSource::PngineInputs => 16,
            UniformSource::SceneTimeInputs => 12,
            UniformSource::User(_) => buffer_size.min(u16::MAX as u32) as u16,
        };
        if u32::from(size) > buffer_size {
            errors.push(AnalyzeError {
                kind: AnalyzeErrorKind::BadValue {
                    field: "stream".to_string(),
                    reason: format!(
                        "`{stream}` needs {size} bytes but the buffer holds {buffer_size}"
                    ),
                },
                span,
            });
        }
        UniformField {
            offset: 0,
            size,
            source,
        }
    }

    fn pass_textures(&mut self) {
        for index in 0..self.decls.texture.len() {
            let (name, site) = Self::site(&self.decls.texture, index);
            let mut fields = self.fields(site.body);

            let format = match ok_or(&mut self.errors, fields.opt_ident("format"), None) {
                Some((ident, span)) => match schema::texture_format(ident) {
                    Some(format) => format,
                    None => {
                        self.bad_ident("format", ident, span);
                        TextureFormat::Rgba8Unorm
                    }
                },
                None => {
                    self.errors.push(AnalyzeError {
                        kind: AnalyzeErrorKind::MissingField { field: "format" },
                        span: site.name_span,
                    });
                    TextureFormat::Rgba8Unorm
                }
            };

            let width = self.extent(&mut fields, "width", site.name_span);
            let height = self.extent(&mut fields, "height", site.name_span);

            let mut usage = TextureUsages::empty();
            if let Some(items) = ok_or(&mut self.errors, fields.opt_list("usage"), None) {
                for item in items {
                    let span = fields.node_span(item);
                    match fields.value(item) {
                        Value::Ident(flag) => match schema::texture_usage(flag) {
                            Some(bit) => usage |= bit,
                            None => self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::BadValue {
                                    field: "usage".to_string(),
                                    reason: format!("unknown usage `{flag}`"),
                                },
                                span,
                            }),
                        },
                        _ => self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::TypeMismatch {
                                field: "usage".to_string(),
                                expected: "a usage identifier",
                            },
                            span,
                        }),
                    }
                }
            }
            if usage.is_empty() {
                usage = TextureUsages::TEXTURE_BINDING;
            }

            let source = ok_or(&mut self.errors, fields.opt_string("source"), None);
            fields.finish(&mut self.errors);
            self.scene.textures.insert(
                name.to_string(),
                TextureDesc {
                    format,
                    width,
                    height,
                    usage: usage.bits(),
                    source,
                },
            );
        }
    }

    /// `width = 512` or `width = $canvas.width`.
    fn extent(&mut self, fields: &mut Fields<'_>, field: &'static str, decl_span: Span) -> Extent {
        let Some((node, span)) = fields.opt_node(field) else {
            self.errors.push(AnalyzeError {
                kind: AnalyzeErrorKind::MissingField { field },
                span: decl_span,
            });
            return Extent::Px(0);
        };
        match fields.value(node) {
            Value::Int(v) if v > 0 && v <= u32::MAX as i64 => Extent::Px(v as u32),
            Value::Reference {
                ns: "canvas",
                name: "width",
            } => Extent::CanvasWidth,
            Value::Reference {
                ns: "canvas",
                name: "height",
            } => Extent::CanvasHeight,
            _ => {
                self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::TypeMismatch {
                        field: field.to_string(),
                        expected: "a positive integer or `$canvas` dimension",
                    },
                    span: span.merge(fields.node_span(node)),
                });
                Extent::Px(0)
            }
        }
    }

    fn pass_samplers(&mut self) {
        for index in 0..self.decls.sampler.len() {
            let (name, site) = Self::site(&self.decls.sampler, index);
            let mut fields = self.fields(site.body);
            let mut desc = SamplerDesc::default();
            if let Some((ident, span)) = ok_or(&mut self.errors, fields.opt_ident("magFilter"), None)
            {
                match schema::filter_mode(ident) {
                    Some(mode) => desc.mag_filter = mode,
                    None => self.bad_ident("magFilter", ident, span),
                }
            }
            if let Some((ident, span)) = ok_or(&mut self.errors, fields.opt_ident("minFilter"), None)
            {
                match schema::filter_mode(ident) {
                    Some(mode) => desc.min_filter = mode,
                    None => self.bad_ident("minFilter", ident, span),
                }
            }
            for (field, slot) in [
                ("addressModeU", 0usize),
                ("addressModeV", 1),
                ("addressModeW", 2),
            ] {
                if let Some((ident, span)) = ok_or(&mut self.errors, fields.opt_ident(field), None) {
                    match schema::address_mode(ident) {
                        Some(mode) => match slot {
                            0 => desc.address_mode_u = mode,
                            1 => desc.address_mode_v = mode,
                            _ => desc.address_mode_w = mode,
                        },
                        None => self.bad_ident(field, ident, span),
                    }
                }
            }
            fields.finish(&mut self.errors);
            self.scene.samplers.insert(name.to_string(), desc);
        }
    }

    fn bad_ident(&mut self, field: &str, got: &str, span: Span) {
        self.errors.push(AnalyzeError {
            kind: AnalyzeErrorKind::BadValue {
                field: field.to_string(),
                reason: format!("unknown value `{got}`"),
            },
            span,
        });
    }

    fn pass_bind_group_layouts(&mut self) {
        for index in 0..self.decls.bind_group_layout.len() {
            let (name, site) = Self::site(&self.decls.bind_group_layout, index);
            let mut fields = self.fields(site.body);
            let mut entries = Vec::new();
            match fields.req_list("entries") {
                Ok(items) => {
                    for item in items {
                        let span = fields.node_span(item);
                        let Value::Record(record) = fields.value(item) else {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::TypeMismatch {
                                    field: "entries".to_string(),
                                    expected: "a record",
                                },
                                span,
                            });
                            continue;
                        };
                        if let Some(entry) = self.bgl_entry(record, span) {
                            entries.push(entry);
                        }
                    }
                }
                Err(err) => self.errors.push(err),
            }
            fields.finish(&mut self.errors);
            self.scene
                .bind_group_layouts
                .insert(name.to_string(), BindGroupLayoutDecl { entries });
        }
    }

    fn bgl_entry(&mut self, record: u32, span: Span) -> Option<BglEntry> {
        let mut sub = self.fields(record);
        let binding = ok_or(&mut self.errors, sub.req_u32("binding"), 0);
        let mut visibility = 0u32;
        match sub.req_list("visibility") {
            Ok(stages) => {
                for stage in stages {
                    let span = sub.node_span(stage);
                    match sub.value(stage) {
                        Value::Ident(ident) => match schema::shader_stage(ident) {
                            Some(bit) => visibility |= bit,
                            None => self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::BadValue {
                                    field: "visibility".to_string(),
                                    reason: format!("unknown stage `{ident}`"),
                                },
                                span,
                            }),
                        },
                        _ => self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::TypeMismatch {
                                field: "visibility".to_string(),
                                expected: "a stage identifier",
                            },
                            span,
                        }),
                    }
                }
            }
            Err(err) => self.errors.push(err),
        }
        let ty = match ok_or(&mut self.errors, sub.opt_ident("type"), None) {
            Some((ident, span)) => match schema::binding_type(ident) {
                Some(ty) => ty,
                None => {
                    self.bad_ident("type", ident, span);
                    BindingType::Uniform
                }
            },
            None => {
                self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::MissingField { field: "type" },
                    span,
                });
                BindingType::Uniform
            }
        };
        sub.finish(&mut self.errors);
        Some(BglEntry {
            binding,
            visibility,
            ty,
        })
    }

    fn pass_pipeline_layouts(&mut self) {
        for index in 0..self.decls.pipeline_layout.len() {
            let (name, site) = Self::site(&self.decls.pipeline_layout, index);
            let mut fields = self.fields(site.body);
            let mut layouts = Vec::new();
            match fields.req_list("layouts") {
                Ok(items) => {
                    for item in items {
                        let span = fields.node_span(item);
                        match fields.value(item) {
                            Value::Reference { ns, name } => {
                                if let Some(id) = self.decls.resolve(
                                    &mut self.errors,
                                    RefKind::BindGroupLayout,
                                    ns,
                                    name,
                                    span,
                                ) {
                                    layouts.push(id);
                                }
                            }
                            _ => self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::TypeMismatch {
                                    field: "layouts".to_string(),
                                    expected: "a `$bindGroupLayout` reference",
                                },
                                span,
                            }),
                        }
                    }
                }
                Err(err) => self.errors.push(err),
            }
            fields.finish(&mut self.errors);
            self.scene
                .pipeline_layouts
                .insert(name.to_string(), PipelineLayoutDecl { layouts });
        }
    }

    /// `layout = auto` or `layout = $pipelineLayout.x`.
    fn layout_field(&mut self, fields: &mut Fields<'_>) -> Layout {
        let Some((node, span)) = fields.opt_node("layout") else {
            return Layout::Auto;
        };
        match fields.value(node) {
            Value::Ident("auto") => Layout::Auto,
            Value::Reference { ns, name } => self
                .decls
                .resolve(
                    &mut self.errors,
                    RefKind::PipelineLayout,
                    ns,
                    name,
                    fields.node_span(node),
                )
                .map(Layout::Explicit)
                .unwrap_or(Layout::Auto),
            _ => {
                self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::TypeMismatch {
                        field: "layout".to_string(),
                        expected: "`auto` or a `$pipelineLayout` reference",
                    },
                    span: span.merge(fields.node_span(node)),
                });
                Layout::Auto
            }
        }
    }

    fn pass_render_pipelines(&mut self) {
        for index in 0..self.decls.render_pipeline.len() {
            let (name, site) = Self::site(&self.decls.render_pipeline, index);
            let mut fields = self.fields(site.body);
            let layout = self.layout_field(&mut fields);

            let vertex = match fields.req_record("vertex") {
                Ok(record) => self.vertex_stage(record),
                Err(err) => {
                    self.errors.push(err);
                    VertexStage {
                        module: 0,
                        entry_point: String::new(),
                        buffers: Vec::new(),
                    }
                }
            };

            let fragment = match ok_or(&mut self.errors, fields.opt_record("fragment"), None) {
                Some(record) => Some(self.fragment_stage(record)),
                None => None,
            };

            let topology = match ok_or(&mut self.errors, fields.opt_ident("topology"), None) {
                Some((ident, span)) => match schema::primitive_topology(ident) {
                    Some(topology) => topology,
                    None => {
                        self.bad_ident("topology", ident, span);
                        PrimitiveTopology::TriangleList
                    }
                },
                None => PrimitiveTopology::TriangleList,
            };

            let depth_stencil =
                match ok_or(&mut self.errors, fields.opt_record("depthStencil"), None) {
                    Some(record) => Some(self.depth_stencil(record)),
                    None => None,
                };

            let multisample_count =
                ok_or(&mut self.errors, fields.opt_u32("multisample"), None).unwrap_or(1);

            fields.finish(&mut self.errors);
            self.scene.render_pipelines.insert(
                name.to_string(),
                RenderPipelineDesc {
                    layout,
                    vertex,
                    fragment,
                    topology,
                    depth_stencil,
                    multisample_count,
                },
            );
        }
    }

    fn wgsl_module_ref(&mut self, sub: &mut Fields<'_>) -> u16 {
        match sub.req_reference("module") {
            Ok((ns, name, span)) => self
                .decls
                .resolve(&mut self.errors, RefKind::Wgsl, ns, name, span)
                .unwrap_or(0),
            Err(err) => {
                self.errors.push(err);
                0
            }
        }
    }

    fn vertex_stage(&mut self, record: u32) -> VertexStage {
        let mut sub = self.fields(record);
        let module = self.wgsl_module_ref(&mut sub);
        let entry_point = ok_or(&mut self.errors, sub.req_string("entryPoint"), String::new());
        let mut buffers = Vec::new();
        if let Some(items) = ok_or(&mut self.errors, sub.opt_list("buffers"), None) {
            for item in items {
                let span = sub.node_span(item);
                let Value::Record(layout_record) = sub.value(item) else {
                    self.errors.push(AnalyzeError {
                        kind: AnalyzeErrorKind::TypeMismatch {
                            field: "buffers".to_string(),
                            expected: "a record",
                        },
                        span,
                    });
                    continue;
                };
                buffers.push(self.vertex_buffer_layout(layout_record));
            }
        }
        sub.finish(&mut self.errors);
        VertexStage {
            module,
            entry_point,
            buffers,
        }
    }

    fn vertex_buffer_layout(&mut self, record: u32) -> VertexBufferLayout {
        let mut sub = self.fields(record);
        let array_stride = ok_or(&mut self.errors, sub.req_u32("arrayStride"), 0);
        let step_mode = match ok_or(&mut self.errors, sub.opt_ident("stepMode"), None) {
            Some((ident, span)) => match schema::step_mode(ident) {
                Some(mode) => mode,
                None => {
                    self.bad_ident("stepMode", ident, span);
                    VertexStepMode::Vertex
                }
            },
            None => VertexStepMode::Vertex,
        };
        let mut attributes = Vec::new();
        match sub.req_list("attributes") {
            Ok(items) => {
                for item in items {
                    let span = sub.node_span(item);
                    let Value::Record(attr_record) = sub.value(item) else {
                        self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::TypeMismatch {
                                field: "attributes".to_string(),
                                expected: "a record",
                            },
                            span,
                        });
                        continue;
                    };
                    let mut attr = self.fields(attr_record);
                    let format = match ok_or(&mut self.errors, attr.opt_ident("format"), None) {
                        Some((ident, span)) => match schema::vertex_format(ident) {
                            Some(format) => format,
                            None => {
                                self.bad_ident("format", ident, span);
                                VertexFormat::Float32
                            }
                        },
                        None => {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::MissingField { field: "format" },
                                span,
                            });
                            VertexFormat::Float32
                        }
                    };
                    let offset = ok_or(&mut self.errors, attr.opt_u32("offset"), None).unwrap_or(0);
                    let shader_location = ok_or(&mut self.errors, attr.req_u32("shaderLocation"), 0);
                    attr.finish(&mut self.errors);
                    attributes.push(VertexAttribute {
                        format,
                        offset,
                        shader_location,
                    });
                }
            }
            Err(err) => self.errors.push(err),
        }
        sub.finish(&mut self.errors);
        VertexBufferLayout {
            array_stride,
            step_mode,
            attributes,
        }
    }

    fn fragment_stage(&mut self, record: u32) -> FragmentStage {
        let mut sub = self.fields(record);
        let module = self.wgsl_module_ref(&mut sub);
        let entry_point = ok_or(&mut self.errors, sub.req_string("entryPoint"), String::new());
        let mut targets = Vec::new();
        match sub.req_list("targets") {
            Ok(items) => {
                for item in items {
                    let span = sub.node_span(item);
                    let Value::Record(target_record) = sub.value(item) else {
                        self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::TypeMismatch {
                                field: "targets".to_string(),
                                expected: "a record",
                            },
                            span,
                        });
                        continue;
                    };
                    let mut target = self.fields(target_record);
                    let format = match ok_or(&mut self.errors, target.opt_ident("format"), None) {
                        Some((ident, span)) => match schema::texture_format(ident) {
                            Some(format) => format,
                            None => {
                                self.bad_ident("format", ident, span);
                                TextureFormat::Bgra8Unorm
                            }
                        },
                        None => TextureFormat::Bgra8Unorm,
                    };
                    target.finish(&mut self.errors);
                    targets.push(ColorTarget { format });
                }
            }
            Err(err) => self.errors.push(err),
        }
        sub.finish(&mut self.errors);
        FragmentStage {
            module,
            entry_point,
            targets,
        }
    }

    fn depth_stencil(&mut self, record: u32) -> DepthStencilState {
        let mut sub = self.fields(record);
        let format = match ok_or(&mut self.errors, sub.opt_ident("format"), None) {
            Some((ident, span)) => match schema::texture_format(ident) {
                Some(format) => format,
                None => {
                    self.bad_ident("format", ident, span);
                    TextureFormat::Depth24Plus
                }
            },
            None => TextureFormat::Depth24Plus,
        };
        let depth_write_enabled =
            ok_or(&mut self.errors, sub.opt_bool("depthWriteEnabled"), None).unwrap_or(true);
        let depth_compare = match ok_or(&mut self.errors, sub.opt_ident("depthCompare"), None) {
            Some((ident, span)) => match schema::compare_function(ident) {
                Some(func) => func,
                None => {
                    self.bad_ident("depthCompare", ident, span);
                    CompareFunction::Less
                }
            },
            None => CompareFunction::Less,
        };
        sub.finish(&mut self.errors);
        DepthStencilState {
            format,
            depth_write_enabled,
            depth_compare,
        }
    }

    fn pass_compute_pipelines(&mut self) {
        for index in 0..self.decls.compute_pipeline.len() {
            let (name, site) = Self::site(&self.decls.compute_pipeline, index);
            let mut fields = self.fields(site.body);
            let layout = self.layout_field(&mut fields);
            let module = self.wgsl_module_ref(&mut fields);
            let entry_point =
                ok_or(&mut self.errors, fields.req_string("entryPoint"), String::new());
            fields.finish(&mut self.errors);
            self.scene.compute_pipelines.insert(
                name.to_string(),
                ComputePipelineDesc {
                    layout,
                    module,
                    entry_point,
                },
            );
        }
    }

    fn pass_bind_groups(&mut self) {
        for index in 0..self.decls.bind_group.len() {
            let (name, site) = Self::site(&self.decls.bind_group, index);
            let mut fields = self.fields(site.body);
            let layout = self.bind_group_layout_ref(&mut fields, site.name_span);
            let pool = ok_or(&mut self.errors, fields.opt_u16("pool"), None).unwrap_or(1);
            let mut entries = Vec::new();
            match fields.req_list("entries") {
                Ok(items) => {
                    for item in items {
                        let span = fields.node_span(item);
                        let Value::Record(record) = fields.value(item) else {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::TypeMismatch {
                                    field: "entries".to_string(),
                                    expected: "a record",
                                },
                                span,
                            });
                            continue;
                        };
                        if let Some(entry) = self.bind_group_entry(record, span) {
                            entries.push(entry);
                        }
                    }
                }
                Err(err) => self.errors.push(err),
            }
            fields.finish(&mut self.errors);

            // Pool consistency against the buffers the entries reference.
            for entry in &entries {
                if let BindingResource::Buffer { buffer, ping_pong } = entry.resource {
                    let Some((buffer_name, decl)) = self.scene.buffers.get_index(buffer as usize)
                    else {
                        continue;
                    };
                    match ping_pong {
                        Some(offset) if offset >= decl.pool => {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::PoolOffsetOutOfRange {
                                    offset,
                                    pool: decl.pool,
                                },
                                span: site.name_span,
                            });
                        }
                        Some(_) => {}
                        None if decl.pool > 1 && pool != decl.pool => {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::PoolMismatch {
                                    group: name.to_string(),
                                    buffer: buffer_name.clone(),
                                },
                                span: site.name_span,
                            });
                        }
                        None => {}
                    }
                }
            }

            self.scene.bind_groups.insert(
                name.to_string(),
                BindGroupDecl {
                    layout,
                    pool: pool.max(1),
                    entries,
                },
            );
        }
    }

    fn bind_group_layout_ref(
        &mut self,
        fields: &mut Fields<'_>,
        decl_span: Span,
    ) -> BindGroupLayoutRef {
        let Some((node, _)) = fields.opt_node("layout") else {
            self.errors.push(AnalyzeError {
                kind: AnalyzeErrorKind::MissingField { field: "layout" },
                span: decl_span,
            });
            return BindGroupLayoutRef::Explicit(0);
        };
        let span = fields.node_span(node);
        match fields.value(node) {
            Value::Reference { ns, name } => self
                .decls
                .resolve(&mut self.errors, RefKind::BindGroupLayout, ns, name, span)
                .map(BindGroupLayoutRef::Explicit)
                .unwrap_or(BindGroupLayoutRef::Explicit(0)),
            Value::Record(record) => {
                let mut sub = self.fields(record);
                let group = ok_or(&mut self.errors, sub.opt_u32("group"), None).unwrap_or(0);
                let result = if sub.has("renderPipeline") {
                    match sub.req_reference("renderPipeline") {
                        Ok((ns, name, span)) => self
                            .decls
                            .resolve(&mut self.errors, RefKind::RenderPipeline, ns, name, span)
                            .map(|pipeline| BindGroupLayoutRef::RenderPipeline { pipeline, group }),
                        Err(err) => {
                            self.errors.push(err);
                            None
                        }
                    }
                } else {
                    match sub.req_reference("computePipeline") {
                        Ok((ns, name, span)) => self
                            .decls
                            .resolve(&mut self.errors, RefKind::ComputePipeline, ns, name, span)
                            .map(|pipeline| BindGroupLayoutRef::ComputePipeline { pipeline, group }),
                        Err(err) => {
                            self.errors.push(err);
                            None
                        }
                    }
                };
                sub.finish(&mut self.errors);
                result.unwrap_or(BindGroupLayoutRef::Explicit(0))
            }
            _ => {
                self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::TypeMismatch {
                        field: "layout".to_string(),
                        expected: "a `$bindGroupLayout` reference or pipeline record",
                    },
                    span,
                });
                BindGroupLayoutRef::Explicit(0)
            }
        }
    }

    fn bind_group_entry(&mut self, record: u32, span: Span) -> Option<BindGroupEntry> {
        let mut sub = self.fields(record);
        let binding = ok_or(&mut self.errors, sub.req_u32("binding"), 0);
        let resource = if sub.has("buffer") {
            let buffer = match sub.req_reference("buffer") {
                Ok((ns, name, span)) => self
                    .decls
                    .resolve(&mut self.errors, RefKind::Buffer, ns, name, span)
                    .unwrap_or(0),
                Err(err) => {
                    self.errors.push(err);
                    0
                }
            };
            let ping_pong = ok_or(&mut self.errors, sub.opt_u16("pingPong"), None);
            Some(BindingResource::Buffer { buffer, ping_pong })
        } else if sub.has("sampler") {
            match sub.req_reference("sampler") {
                Ok((ns, name, span)) => self
                    .decls
                    .resolve(&mut self.errors, RefKind::Sampler, ns, name, span)
                    .map(BindingResource::Sampler),
                Err(err) => {
                    self.errors.push(err);
                    None
                }
            }
        } else if sub.has("texture") {
            match sub.req_reference("texture") {
                Ok((ns, name, span)) => self
                    .decls
                    .resolve(&mut self.errors, RefKind::Texture, ns, name, span)
                    .map(BindingResource::Texture),
                Err(err) => {
                    self.errors.push(err);
                    None
                }
            }
        } else {
            self.errors.push(AnalyzeError {
                kind: AnalyzeErrorKind::MissingField { field: "buffer" },
                span,
            });
            None
        };
        sub.finish(&mut self.errors);
        resource.map(|resource| BindGroupEntry { binding, resource })
    }

    fn pass_render_passes(&mut self) {
        for index in 0..self.decls.render_pass.len() {
            let (name, site) = Self::site(&self.decls.render_pass, index);
            let mut fields = self.fields(site.body);

            let mut color = Vec::new();
            match fields.req_list("colorAttachments") {
                Ok(items) => {
                    for item in items {
                        let span = fields.node_span(item);
                        let Value::Record(record) = fields.value(item) else {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::TypeMismatch {
                                    field: "colorAttachments".to_string(),
                                    expected: "a record",
                                },
                                span,
                            });
                            continue;
                        };
                        color.push(self.color_attachment(record, span));
                    }
                }
                Err(err) => self.errors.push(err),
            }

            let commands = if fields.has("commands") {
                let mut commands = Vec::new();
                if let Some(items) = ok_or(&mut self.errors, fields.opt_list("commands"), None) {
                    for item in items {
                        let span = fields.node_span(item);
                        let Value::Record(record) = fields.value(item) else {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::TypeMismatch {
                                    field: "commands".to_string(),
                                    expected: "a record",
                                },
                                span,
                            });
                            continue;
                        };
                        let mut sub = self.fields(record);
                        let command = self.draw_command(&mut sub, span);
                        sub.finish(&mut self.errors);
                        commands.push(command);
                    }
                }
                commands
            } else {
                vec![self.draw_command(&mut fields, site.name_span)]
            };

            fields.finish(&mut self.errors);
            self.scene.render_passes.insert(
                name.to_string(),
                RenderPassDecl {
                    attachments: RenderPassAttachments { color },
                    commands,
                },
            );
        }
    }

    fn color_attachment(&mut self, record: u32, span: Span) -> ColorAttachment {
        let mut sub = self.fields(record);
        let view = match sub.opt_node("view") {
            Some((node, _)) => match sub.value(node) {
                Value::Reference {
                    ns: "canvas",
                    name: "texture",
                } => AttachmentView::Context,
                Value::Reference { ns, name } => self
                    .decls
                    .resolve(
                        &mut self.errors,
                        RefKind::Texture,
                        ns,
                        name,
                        sub.node_span(node),
                    )
                    .map(AttachmentView::Texture)
                    .unwrap_or(AttachmentView::Context),
                _ => {
                    self.errors.push(AnalyzeError {
                        kind: AnalyzeErrorKind::TypeMismatch {
                            field: "view".to_string(),
                            expected: "a `$texture` reference or `$canvas.texture`",
                        },
                        span: sub.node_span(node),
                    });
                    AttachmentView::Context
                }
            },
            None => AttachmentView::Context,
        };
        let clear_value = match ok_or(&mut self.errors, sub.opt_list("clearValue"), None) {
            Some(items) => {
                let mut channels = [0.0f32; 4];
                if items.len() != 4 {
                    self.errors.push(AnalyzeError {
                        kind: AnalyzeErrorKind::BadValue {
                            field: "clearValue".to_string(),
                            reason: "expected exactly four numbers".to_string(),
                        },
                        span,
                    });
                }
                for (slot, item) in items.into_iter().take(4).enumerate() {
                    match sub.value(item) {
                        Value::Int(v) => channels[slot] = v as f32,
                        Value::Float(v) => channels[slot] = v as f32,
                        _ => self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::TypeMismatch {
                                field: "clearValue".to_string(),
                                expected: "a number",
                            },
                            span: sub.node_span(item),
                        }),
                    }
                }
                Some(channels)
            }
            None => None,
        };
        let load_op = match ok_or(&mut self.errors, sub.opt_ident("loadOp"), None) {
            Some((ident, span)) => match schema::load_op(ident) {
                Some(op) => op,
                None => {
                    self.bad_ident("loadOp", ident, span);
                    LoadOp::Clear
                }
            },
            None => LoadOp::Clear,
        };
        let store_op = match ok_or(&mut self.errors, sub.opt_ident("storeOp"), None) {
            Some((ident, span)) => match schema::store_op(ident) {
                Some(op) => op,
                None => {
                    self.bad_ident("storeOp", ident, span);
                    StoreOp::Store
                }
            },
            None => StoreOp::Store,
        };
        sub.finish(&mut self.errors);
        ColorAttachment {
            view,
            clear_value,
            load_op,
            store_op,
        }
    }

    fn draw_command(&mut self, fields: &mut Fields<'_>, span: Span) -> DrawCommand {
        let pipeline = match fields.req_reference("pipeline") {
            Ok((ns, name, span)) => self
                .decls
                .resolve(&mut self.errors, RefKind::RenderPipeline, ns, name, span)
                .unwrap_or(0),
            Err(err) => {
                self.errors.push(err);
                0
            }
        };
        let bind_groups = self.pass_bind_groups_field(fields);
        let vertex_buffers = self.pass_vertex_buffers_field(fields);

        let index_buffer = match ok_or(&mut self.errors, fields.opt_record("indexBuffer"), None) {
            Some(record) => {
                let mut sub = self.fields(record);
                let buffer = match sub.req_reference("buffer") {
                    Ok((ns, name, span)) => self
                        .decls
                        .resolve(&mut self.errors, RefKind::Buffer, ns, name, span)
                        .unwrap_or(0),
                    Err(err) => {
                        self.errors.push(err);
                        0
                    }
                };
                let format = match ok_or(&mut self.errors, sub.opt_ident("format"), None) {
                    Some((ident, span)) => match schema::index_format(ident) {
                        Some(format) => format,
                        None => {
                            self.bad_ident("format", ident, span);
                            IndexFormat::Uint16
                        }
                    },
                    None => IndexFormat::Uint16,
                };
                sub.finish(&mut self.errors);
                Some((buffer, format))
            }
            None => None,
        };

        let draw = self.counts_field(fields, "draw");
        let draw_indexed = self.counts_field(fields, "drawIndexed");
        if draw.is_none() && draw_indexed.is_none() {
            self.errors.push(AnalyzeError {
                kind: AnalyzeErrorKind::MissingField { field: "draw" },
                span,
            });
        }
        DrawCommand {
            pipeline,
            bind_groups,
            vertex_buffers,
            index_buffer,
            draw,
            draw_indexed,
        }
    }

    /// `draw = 3` or `draw = [3, 1]`.
    fn counts_field(&mut self, fields: &mut Fields<'_>, name: &str) -> Option<(u32, u32)> {
        let (node, span) = fields.opt_node(name)?;
        match fields.value(node) {
            Value::Int(v) if v >= 0 => Some((v as u32, 1)),
            Value::List(items) if items.len() == 2 => {
                let mut counts = [0u32; 2];
                for (slot, item) in items.into_iter().enumerate() {
                    match fields.value(item) {
                        Value::Int(v) if v >= 0 => counts[slot] = v as u32,
                        _ => self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::TypeMismatch {
                                field: name.to_string(),
                                expected: "a non-negative integer",
                            },
                            span: fields.node_span(item),
                        }),
                    }
                }
                Some((counts[0], counts[1]))
            }
            _ => {
                self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::TypeMismatch {
                        field: name.to_string(),
                        expected: "a count or `[count, instances]`",
                    },
                    span: span.merge(fields.node_span(node)),
                });
                None
            }
        }
    }

    /// Bind group bindings inside a pass: a bare reference takes its list
    /// position as slot; records may pick a slot and a pool offset.
    fn pass_bind_groups_field(&mut self, fields: &mut Fields<'_>) -> Vec<BindGroupBinding> {
        let mut bindings = Vec::new();
        let Some(items) = ok_or(&mut self.errors, fields.opt_list("bindGroups"), None) else {
            return bindings;
        };
        for (position, item) in items.into_iter().enumerate() {
            let span = fields.node_span(item);
            match fields.value(item) {
                Value::Reference { ns, name } => {
                    if let Some(id) =
                        self.decls
                            .resolve(&mut self.errors, RefKind::BindGroup, ns, name, span)
                    {
                        bindings.push(BindGroupBinding {
                            slot: position as u32,
                            group: id,
                            ping_pong: None,
                        });
                    }
                }
                Value::Record(record) => {
                    let mut sub = self.fields(record);
                    let slot = ok_or(&mut self.errors, sub.opt_u32("slot"), None)
                        .unwrap_or(position as u32);
                    let group = match sub.req_reference("group") {
                        Ok((ns, name, span)) => self
                            .decls
                            .resolve(&mut self.errors, RefKind::BindGroup, ns, name, span)
                            .unwrap_or(0),
                        Err(err) => {
                            self.errors.push(err);
                            0
                        }
                    };
                    let ping_pong = ok_or(&mut self.errors, sub.opt_u16("pingPong"), None);
                    sub.finish(&mut self.errors);
                    self.check_group_offset(group, ping_pong, span);
                    bindings.push(BindGroupBinding {
                        slot,
                        group,
                        ping_pong,
                    });
                }
                _ => self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::TypeMismatch {
                        field: "bindGroups".to_string(),
                        expected: "a `$bindGroup` reference or record",
                    },
                    span,
                }),
            }
        }
        bindings
    }

    fn check_group_offset(&mut self, group: u16, ping_pong: Option<u16>, span: Span) {
        let Some(offset) = ping_pong else { return };
        let Some((_, decl)) = self.scene.bind_groups.get_index(group as usize) else {
            return;
        };
        if offset >= decl.pool {
            self.errors.push(AnalyzeError {
                kind: AnalyzeErrorKind::PoolOffsetOutOfRange {
                    offset,
                    pool: decl.pool,
                },
                span,
            });
        }
    }

    fn pass_vertex_buffers_field(&mut self, fields: &mut Fields<'_>) -> Vec<VertexBufferBinding> {
        let mut bindings = Vec::new();
        let Some(items) = ok_or(&mut self.errors, fields.opt_list("vertexBuffers"), None) else {
            return bindings;
        };
        for (position, item) in items.into_iter().enumerate() {
            let span = fields.node_span(item);
            match fields.value(item) {
                Value::Reference { ns, name } => {
                    if let Some(id) =
                        self.decls
                            .resolve(&mut self.errors, RefKind::Buffer, ns, name, span)
                    {
                        bindings.push(VertexBufferBinding {
                            slot: position as u32,
                            buffer: id,
                            ping_pong: None,
                        });
                    }
                }
                Value::Record(record) => {
                    let mut sub = self.fields(record);
                    let slot = ok_or(&mut self.errors, sub.opt_u32("slot"), None)
                        .unwrap_or(position as u32);
                    let buffer = match sub.req_reference("buffer") {
                        Ok((ns, name, span)) => self
                            .decls
                            .resolve(&mut self.errors, RefKind::Buffer, ns, name, span)
                            .unwrap_or(0),
                        Err(err) => {
                            self.errors.push(err);
                            0
                        }
                    };
                    let ping_pong = ok_or(&mut self.errors, sub.opt_u16("pingPong"), None);
                    sub.finish(&mut self.errors);
                    if let (Some(offset), Some((_, decl))) =
                        (ping_pong, self.scene.buffers.get_index(buffer as usize))
                    {
                        if offset >= decl.pool {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::PoolOffsetOutOfRange {
                                    offset,
                                    pool: decl.pool,
                                },
                                span,
                            });
                        }
                    }
                    bindings.push(VertexBufferBinding {
                        slot,
                        buffer,
                        ping_pong,
                    });
                }
                _ => self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::TypeMismatch {
                        field: "vertexBuffers".to_string(),
                        expected: "a `$buffer` reference or record",
                    },
                    span,
                }),
            }
        }
        bindings
    }

    fn pass_compute_passes(&mut self) {
        for index in 0..self.decls.compute_pass.len() {
            let (name, site) = Self::site(&self.decls.compute_pass, index);
            let mut fields = self.fields(site.body);
            let pipeline = match fields.req_reference("pipeline") {
                Ok((ns, target, span)) => self
                    .decls
                    .resolve(&mut self.errors, RefKind::ComputePipeline, ns, target, span)
                    .unwrap_or(0),
                Err(err) => {
                    self.errors.push(err);
                    0
                }
            };
            let bind_groups = self.pass_bind_groups_field(&mut fields);
            let dispatch = match fields.opt_node("dispatch") {
                Some((node, span)) => match fields.value(node) {
                    Value::Int(v) if v > 0 => [v as u32, 1, 1],
                    Value::List(items) if !items.is_empty() && items.len() <= 3 => {
                        let mut counts = [1u32; 3];
                        for (slot, item) in items.into_iter().enumerate() {
                            match fields.value(item) {
                                Value::Int(v) if v > 0 => counts[slot] = v as u32,
                                _ => self.errors.push(AnalyzeError {
                                    kind: AnalyzeErrorKind::TypeMismatch {
                                        field: "dispatch".to_string(),
                                        expected: "a positive integer",
                                    },
                                    span: fields.node_span(item),
                                }),
                            }
                        }
                        counts
                    }
                    _ => {
                        self.errors.push(AnalyzeError {
                            kind: AnalyzeErrorKind::TypeMismatch {
                                field: "dispatch".to_string(),
                                expected: "a count or `[x, y, z]`",
                            },
                            span: span.merge(fields.node_span(node)),
                        });
                        [1, 1, 1]
                    }
                },
                None => {
                    self.errors.push(AnalyzeError {
                        kind: AnalyzeErrorKind::MissingField { field: "dispatch" },
                        span: site.name_span,
                    });
                    [1, 1, 1]
                }
            };
            fields.finish(&mut self.errors);
            self.scene.compute_passes.insert(
                name.to_string(),
                ComputePassDecl {
                    pipeline,
                    bind_groups,
                    dispatch,
                },
            );
        }
    }

    fn pass_queues(&mut self) {
        for index in 0..self.decls.queue.len() {
            let (name, site) = Self::site(&self.decls.queue, index);
            let mut fields = self.fields(site.body);
            let decl = if fields.has("timeUniform") {
                match fields.req_reference("timeUniform") {
                    Ok((ns, target, span)) => {
                        let buffer = self
                            .decls
                            .resolve(&mut self.errors, RefKind::Buffer, ns, target, span)
                            .unwrap_or(0);
                        QueueDecl::WriteTimeUniform { buffer }
                    }
                    Err(err) => {
                        self.errors.push(err);
                        QueueDecl::WriteTimeUniform { buffer: 0 }
                    }
                }
            } else {
                let buffer = match fields.req_reference("buffer") {
                    Ok((ns, target, span)) => self
                        .decls
                        .resolve(&mut self.errors, RefKind::Buffer, ns, target, span)
                        .unwrap_or(0),
                    Err(err) => {
                        self.errors.push(err);
                        0
                    }
                };
                let data = match fields.req_reference("data") {
                    Ok((ns, target, span)) => self
                        .decls
                        .resolve(&mut self.errors, RefKind::Data, ns, target, span)
                        .unwrap_or(0),
                    Err(err) => {
                        self.errors.push(err);
                        0
                    }
                };
                let offset = ok_or(&mut self.errors, fields.opt_u32("offset"), None).unwrap_or(0);
                QueueDecl::WriteBuffer {
                    buffer,
                    offset,
                    data,
                }
            };
            fields.finish(&mut self.errors);
            self.scene.queues.insert(name.to_string(), decl);
        }
    }

    fn pass_frames(&mut self) {
        for index in 0..self.decls.frame.len() {
            let (name, site) = Self::site(&self.decls.frame, index);
            let mut fields = self.fields(site.body);
            let before = self.frame_list(&mut fields, "before");
            let init = self.frame_list(&mut fields, "init");
            let perform = self.frame_list(&mut fields, "perform");
            fields.finish(&mut self.errors);
            self.scene.frames.insert(
                name.to_string(),
                FrameDecl {
                    before,
                    init,
                    perform,
                },
            );
        }
    }

    fn frame_list(&mut self, fields: &mut Fields<'_>, name: &str) -> Vec<PassRef> {
        let mut passes = Vec::new();
        let Some(items) = ok_or(&mut self.errors, fields.opt_list(name), None) else {
            return passes;
        };
        for item in items {
            let span = fields.node_span(item);
            match fields.value(item) {
                Value::Reference { ns, name: target } => {
                    let resolved = match ns {
                        "renderPass" => self
                            .decls
                            .resolve(&mut self.errors, RefKind::RenderPass, ns, target, span)
                            .map(PassRef::Render),
                        "computePass" => self
                            .decls
                            .resolve(&mut self.errors, RefKind::ComputePass, ns, target, span)
                            .map(PassRef::Compute),
                        "queue" => self
                            .decls
                            .resolve(&mut self.errors, RefKind::Queue, ns, target, span)
                            .map(PassRef::Queue),
                        _ => {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::InvalidFrameEntry {
                                    name: format!("${ns}.{target}"),
                                },
                                span,
                            });
                            None
                        }
                    };
                    if let Some(pass) = resolved {
                        passes.push(pass);
                    }
                }
                _ => self.errors.push(AnalyzeError {
                    kind: AnalyzeErrorKind::TypeMismatch {
                        field: name.to_string(),
                        expected: "a pass or queue reference",
                    },
                    span,
                }),
            }
        }
        passes
    }

    fn pass_animations(&mut self) {
        for index in 0..self.decls.animation.len() {
            let (_, site) = Self::site(&self.decls.animation, index);
            let mut fields = self.fields(site.body);
            match fields.req_list("scenes") {
                Ok(items) => {
                    for item in items {
                        let span = fields.node_span(item);
                        let Value::Record(record) = fields.value(item) else {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::TypeMismatch {
                                    field: "scenes".to_string(),
                                    expected: "a record",
                                },
                                span,
                            });
                            continue;
                        };
                        let mut sub = self.fields(record);
                        let frame = match sub.req_reference("frame") {
                            Ok((ns, target, span)) => self
                                .decls
                                .resolve(&mut self.errors, RefKind::Frame, ns, target, span)
                                .unwrap_or(0),
                            Err(err) => {
                                self.errors.push(err);
                                0
                            }
                        };
                        let start_ms =
                            ok_or(&mut self.errors, sub.opt_u32("start"), None).unwrap_or(0);
                        let duration_ms = ok_or(&mut self.errors, sub.req_u32("duration"), 0);
                        if duration_ms == 0 {
                            self.errors.push(AnalyzeError {
                                kind: AnalyzeErrorKind::BadValue {
                                    field: "duration".to_string(),
                                    reason: "scene duration must be positive".to_string(),
                                },
                                span,
                            });
                        }
                        sub.finish(&mut self.errors);
                        self.scene.animations.push(AnimationScene {
                            frame,
                            start_ms,
                            duration_ms,
                        });
                    }
                }
                Err(err) => self.errors.push(err),
            }
            fields.finish(&mut self.errors);
        }
    }

    fn pass_wasm_calls(&mut self) {
        for index in 0..self.decls.wasm_call.len() {
            let (name, site) = Self::site(&self.decls.wasm_call, index);
            let mut fields = self.fields(site.body);
            let module = match fields.req_reference("module") {
                Ok((ns, target, span)) => self
                    .decls
                    .resolve(&mut self.errors, RefKind::Data, ns, target, span)
                    .unwrap_or(0),
                Err(err) => {
                    self.errors.push(err);
                    0
                }
            };
            let func = ok_or(&mut self.errors, fields.req_string("func"), String::new());
            fields.finish(&mut self.errors);
            self.scene
                .wasm_calls
                .insert(name.to_string(), WasmCallDecl { module, func });
        }
    }

    // ---- post passes ------------------------------------------------------

    /// Reflected fields only ever fill buffers that declared no layout of
    /// their own; an explicit `stream`/`fields` declaration wins outright.
    fn apply_reflection(&mut self, reflector: &dyn Reflector) {
        let declared: Vec<bool> = self
            .scene
            .buffers
            .values()
            .map(|decl| !decl.uniforms.is_empty())
            .collect();
        let mut additions: Vec<(usize, UniformField)> = Vec::new();
        for (_, decl) in &self.scene.wgsl {
            for field in reflector.uniform_fields(&decl.source) {
                let Some(index) = self.scene.buffers.get_index_of(&field.buffer) else {
                    continue;
                };
                if declared[index] {
                    log::debug!(
                        "buffer `{}` declares its own uniform layout; \
                         ignoring reflected field `{}`",
                        field.buffer,
                        field.source
                    );
                    continue;
                }
                additions.push((
                    index,
                    UniformField {
                        offset: field.offset,
                        size: field.size,
                        source: uniform_source(&field.source),
                    },
                ));
            }
        }
        for (index, field) in additions {
            let Some((_, decl)) = self.scene.buffers.get_index_mut(index) else {
                continue;
            };
            if !decl.uniforms.contains(&field) {
                decl.uniforms.push(field);
            }
        }
    }

    fn warn_unreflected(&self) {
        for (name, decl) in &self.scene.buffers {
            if decl.usage.contains(BufferUsages::UNIFORM) && decl.uniforms.is_empty() {
                log::warn!(
                    "buffer `{name}` has UNIFORM usage but no uniform layout; \
                     runtime updates are limited to explicit queue writes"
                );
            }
        }
    }

    fn detect_plugins(&mut self) {
        let mut plugins = Plugins::CORE;
        if !self.scene.render_pipelines.is_empty() || !self.scene.render_passes.is_empty() {
            plugins |= Plugins::RENDER;
        }
        if !self.scene.compute_pipelines.is_empty() || !self.scene.compute_passes.is_empty() {
            plugins |= Plugins::COMPUTE;
        }
        if !self.scene.wasm_calls.is_empty() {
            plugins |= Plugins::WASM;
        }
        if !self.scene.animations.is_empty() {
            plugins |= Plugins::ANIMATION;
        }
        if self
            .scene
            .textures
            .values()
            .any(|texture| texture.source.is_some())
        {
            plugins |= Plugins::TEXTURE;
        }
        self.scene.plugins = plugins;
    }
}

fn uniform_source(name: &str) -> UniformSource {
    match name {
        "pngineInputs" => UniformSource::PngineInputs,
        "sceneTimeInputs" => UniformSource::SceneTimeInputs,
        other => UniformSource::User(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse_tokens;

    fn analyze_src(source: &str) -> Result<Scene, Vec<AnalyzeError>> {
        let ast = parse_tokens(tokenize(source).unwrap()).unwrap();
        analyze(source, &ast)
    }

    fn kinds(errors: &[AnalyzeError]) -> Vec<&AnalyzeErrorKind> {
        errors.iter().map(|e| &e.kind).collect()
    }

    #[test]
    fn minimal_scene_resolves() {
        let scene = analyze_src(
            r#"
            #wgsl tri { code = "@vertex fn vs() {}" }
            #renderPipeline p {
                vertex = { module = $wgsl.tri, entryPoint = "vs" }
                , fragment = { module = $wgsl.tri, entryPoint = "fs", targets = [{ format = bgra8unorm }] }
            }
            #renderPass draw { colorAttachments = [{}], pipeline = $renderPipeline.p, draw = 3 }
            #frame main { perform = [$renderPass.draw] }
            "#,
        )
        .unwrap();
        assert_eq!(scene.wgsl.len(), 1);
        assert_eq!(scene.render_passes["draw"].commands[0].draw, Some((3, 1)));
        assert_eq!(
            scene.frames["main"].perform,
            vec![PassRef::Render(0)]
        );
        assert!(scene.plugins.contains(Plugins::RENDER));
        assert!(!scene.plugins.contains(Plugins::COMPUTE));
    }

    #[test]
    fn errors_accumulate_independently() {
        // Three independent mistakes: unknown field, unresolved reference,
        // duplicate declaration.
        let errors = analyze_src(
            r#"
            #buffer a { size = 4, usage = [UNIFORM], bogus = 1 }
            #buffer a { size = 4, usage = [UNIFORM] }
            #queue q { buffer = $buffer.missing, data = $data.missing }
            "#,
        )
        .unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn import_cycle_names_members_once() {
        let errors = analyze_src(
            r#"
            #wgsl a { code = "", imports = [$wgsl.b] }
            #wgsl b { code = "", imports = [$wgsl.c] }
            #wgsl c { code = "", imports = [$wgsl.a] }
            "#,
        )
        .unwrap_err();
        let cycle = errors
            .iter()
            .find_map(|e| match &e.kind {
                AnalyzeErrorKind::ImportCycle { members } => Some(members.clone()),
                _ => None,
            })
            .expect("cycle reported");
        let mut sorted = cycle.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3, "each member listed exactly once: {cycle:?}");
    }

    #[test]
    fn wgsl_topological_order() {
        let scene = analyze_src(
            r#"
            #wgsl top { code = "", imports = [$wgsl.mid] }
            #wgsl mid { code = "", imports = [$wgsl.base] }
            #wgsl base { code = "" }
            "#,
        )
        .unwrap();
        // top=0, mid=1, base=2; dependencies must come first.
        assert_eq!(scene.wgsl_order, vec![2, 1, 0]);
    }

    #[test]
    fn pool_mismatch_is_flagged() {
        let errors = analyze_src(
            r#"
            #buffer particles { size = 64, usage = [STORAGE], pool = 2 }
            #bindGroupLayout l { entries = [{ binding = 0, visibility = [COMPUTE], type = storage }] }
            #bindGroup sim { layout = $bindGroupLayout.l, entries = [{ binding = 0, buffer = $buffer.particles }] }
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            kinds(&errors)[0],
            AnalyzeErrorKind::PoolMismatch { .. }
        ));
    }

    #[test]
    fn pool_offset_out_of_range() {
        let errors = analyze_src(
            r#"
            #buffer particles { size = 64, usage = [STORAGE], pool = 2 }
            #bindGroupLayout l { entries = [{ binding = 0, visibility = [COMPUTE], type = storage }] }
            #bindGroup sim {
                layout = $bindGroupLayout.l
                , pool = 2
                , entries = [{ binding = 0, buffer = $buffer.particles, pingPong = 2 }]
            }
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            kinds(&errors)[0],
            AnalyzeErrorKind::PoolOffsetOutOfRange { offset: 2, pool: 2 }
        ));
    }

    #[test]
    fn defines_substitute_literals() {
        let scene = analyze_src(
            r#"
            #define count { value = 128 }
            #buffer b { size = $define.count, usage = [STORAGE] }
            "#,
        )
        .unwrap();
        assert_eq!(scene.buffers["b"].size, 128);
    }

    #[test]
    fn buffer_size_defaults_to_data_length() {
        let scene = analyze_src(
            r#"
            #data verts { values = [0.0, 0.5, 1.0] }
            #buffer v { usage = [VERTEX, COPY_DST], data = $data.verts }
            "#,
        )
        .unwrap();
        assert_eq!(scene.buffers["v"].size, 12);
        assert_eq!(scene.data["verts"].bytes.len(), 12);
    }

    #[test]
    fn frame_entry_must_be_pass_or_queue() {
        let errors = analyze_src(
            r#"
            #buffer b { size = 4, usage = [UNIFORM] }
            #frame main { perform = [$buffer.b] }
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            kinds(&errors)[0],
            AnalyzeErrorKind::InvalidFrameEntry { .. }
        ));
    }

    #[test]
    fn animation_sets_plugin_bit() {
        let scene = analyze_src(
            r#"
            #frame main { perform = [] }
            #animation timeline { scenes = [{ frame = $frame.main, start = 0, duration = 5000 }] }
            "#,
        )
        .unwrap();
        assert!(scene.plugins.contains(Plugins::ANIMATION));
        assert_eq!(scene.animations[0].duration_ms, 5000);
    }

    #[test]
    fn reflector_fills_missing_uniform_layouts() {
        struct StubReflector;
        impl Reflector for StubReflector {
            fn uniform_fields(&self, wgsl_source: &str) -> Vec<ReflectedField> {
                if wgsl_source.contains("params") {
                    vec![ReflectedField {
                        buffer: "params".to_string(),
                        offset: 0,
                        size: 8,
                        source: "speed".to_string(),
                    }]
                } else {
                    Vec::new()
                }
            }
        }

        let source = r#"
            #wgsl sim { code = "var<uniform> params: vec2f;" }
            #buffer params { size = 8, usage = [UNIFORM, COPY_DST] }
        "#;
        let ast = parse_tokens(tokenize(source).unwrap()).unwrap();
        let scene = analyze_with(source, &ast, Some(&StubReflector)).unwrap();
        let uniforms = &scene.buffers["params"].uniforms;
        assert_eq!(uniforms.len(), 1);
        assert_eq!(uniforms[0].source, UniformSource::User("speed".to_string()));
    }

    #[test]
    fn explicit_uniform_layouts_beat_reflection() {
        struct ConflictingReflector;
        impl Reflector for ConflictingReflector {
            fn uniform_fields(&self, _wgsl_source: &str) -> Vec<ReflectedField> {
                vec![ReflectedField {
                    buffer: "params".to_string(),
                    offset: 4,
                    size: 12,
                    source: "speed".to_string(),
                }]
            }
        }

        let source = r#"
            #wgsl sim { code = "var<uniform> params: vec4f;" }
            #buffer params {
                size = 16,
                usage = [UNIFORM, COPY_DST],
                fields = [{ offset = 0, size = 16, source = "custom" }]
            }
        "#;
        let ast = parse_tokens(tokenize(source).unwrap()).unwrap();
        let scene = analyze_with(source, &ast, Some(&ConflictingReflector)).unwrap();
        let uniforms = &scene.buffers["params"].uniforms;
        assert_eq!(uniforms.len(), 1);
        assert_eq!(
            uniforms[0],
            UniformField {
                offset: 0,
                size: 16,
                source: UniformSource::User("custom".to_string()),
            }
        );
    }

    #[test]
    fn wasm_call_sets_plugin_bit() {
        let scene = analyze_src(
            r#"
            #data blob { values = [0, 97, 115, 109], kind = u8 }
            #wasmCall tick { module = $data.blob, func = "step" }
            "#,
        )
        .unwrap();
        assert!(scene.plugins.contains(Plugins::WASM));
        assert_eq!(scene.wasm_calls["tick"].func, "step");
    }

    #[test]
    fn stream_buffers_fill_uniform_table() {
        let scene = analyze_src(
            r#"
            #buffer inputs { size = 16, usage = [UNIFORM, COPY_DST], stream = "pngineInputs" }
            "#,
        )
        .unwrap();
        let uniforms = &scene.buffers["inputs"].uniforms;
        assert_eq!(uniforms.len(), 1);
        assert_eq!(uniforms[0].size, 16);
        assert_eq!(uniforms[0].source, UniformSource::PngineInputs);
    }
}
