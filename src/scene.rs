//! The validated scene model.
//!
//! This is what the analyzer hands to the emitter: per-namespace tables of
//! descriptors keyed by source identifier, with every cross-reference already
//! resolved to a dense declaration index. Descriptor structs that end up
//! JSON-encoded into the module's data section derive serde traits; the
//! dispatcher treats those blobs as opaque and forwards them to the backend.

use bitflags::bitflags;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BufferUsages: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
        const MAP_READ = 1 << 6;
        const MAP_WRITE = 1 << 7;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TextureUsages: u32 {
        const TEXTURE_BINDING = 1 << 0;
        const STORAGE_BINDING = 1 << 1;
        const RENDER_ATTACHMENT = 1 << 2;
        const COPY_SRC = 1 << 3;
        const COPY_DST = 1 << 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

bitflags! {
    /// Capability subsets a module requires. Stored as one header byte.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Plugins: u8 {
        const CORE = 1 << 0;
        const RENDER = 1 << 1;
        const COMPUTE = 1 << 2;
        const WASM = 1 << 3;
        const ANIMATION = 1 << 4;
        const TEXTURE = 1 << 5;
    }
}

/// The namespace a resolved reference points into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RefKind {
    Buffer,
    Texture,
    Sampler,
    Wgsl,
    BindGroupLayout,
    PipelineLayout,
    BindGroup,
    RenderPipeline,
    ComputePipeline,
    RenderPass,
    ComputePass,
    Frame,
    Queue,
    Data,
}

/// Runtime-settable uniform sources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UniformSource {
    /// 16 bytes: time, width, height, aspect.
    PngineInputs,
    /// 12 bytes: sceneTime, sceneDuration, normalizedTime.
    SceneTimeInputs,
    /// Caller-provided bytes keyed by name.
    User(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniformField {
    pub offset: u16,
    pub size: u16,
    pub source: UniformSource,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BufferDecl {
    pub size: u32,
    pub usage: BufferUsages,
    /// Cyclic pool size; 1 means not pooled.
    pub pool: u16,
    /// Initial contents, as a `#data` declaration index.
    pub data: Option<u16>,
    pub uniforms: Vec<UniformField>,
}

/// A width or height that may defer to the platform surface.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Extent {
    Px(u32),
    CanvasWidth,
    CanvasHeight,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Rg32Float,
    Depth24Plus,
    Depth32Float,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextureDesc {
    pub format: TextureFormat,
    pub width: Extent,
    pub height: Extent,
    pub usage: u32,
    /// External source URI (image or video); requires the texture plugin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplerDesc {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub address_mode_u: AddressMode,
    pub address_mode_v: AddressMode,
    pub address_mode_w: AddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            address_mode_u: AddressMode::ClampToEdge,
            address_mode_v: AddressMode::ClampToEdge,
            address_mode_w: AddressMode::ClampToEdge,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WgslDecl {
    pub source: String,
    /// Direct imports, as wgsl declaration indices.
    pub imports: Vec<u16>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DataDecl {
    pub bytes: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BindingType {
    Uniform,
    Storage,
    ReadOnlyStorage,
    Sampler,
    Texture,
    StorageTexture,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BglEntry {
    pub binding: u32,
    /// [`ShaderStages`] bits; kept raw so the blob stays a plain JSON number.
    pub visibility: u32,
    #[serde(rename = "type")]
    pub ty: BindingType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BindGroupLayoutDecl {
    pub entries: Vec<BglEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineLayoutDecl {
    /// Bind group layout declaration indices, by group slot.
    pub layouts: Vec<u16>,
}

/// Pipeline layout selection: explicit or deferred to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Layout {
    Auto,
    Explicit(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Sint32,
}

impl VertexFormat {
    pub fn byte_size(&self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Sint32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VertexStepMode {
    Vertex,
    Instance,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexAttribute {
    pub format: VertexFormat,
    pub offset: u32,
    pub shader_location: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexBufferLayout {
    pub array_stride: u32,
    pub step_mode: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexStage {
    /// Shader module as a wgsl declaration index, never a data id.
    pub module: u16,
    pub entry_point: String,
    pub buffers: Vec<VertexBufferLayout>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorTarget {
    pub format: TextureFormat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentStage {
    pub module: u16,
    pub entry_point: String,
    pub targets: Vec<ColorTarget>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompareFunction {
    Never,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
    Always,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPipelineDesc {
    pub layout: Layout,
    pub vertex: VertexStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<FragmentStage>,
    pub topology: PrimitiveTopology,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_stencil: Option<DepthStencilState>,
    pub multisample_count: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputePipelineDesc {
    pub layout: Layout,
    pub module: u16,
    pub entry_point: String,
}

/// How a bind group obtains its layout.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BindGroupLayoutRef {
    Explicit(u16),
    RenderPipeline { pipeline: u16, group: u32 },
    ComputePipeline { pipeline: u16, group: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BindingResource {
    Buffer {
        buffer: u16,
        /// Pool slot selector for ping-pong entries.
        #[serde(skip_serializing_if = "Option::is_none")]
        ping_pong: Option<u16>,
    },
    Sampler(u16),
    Texture(u16),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindGroupEntry {
    pub binding: u32,
    pub resource: BindingResource,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BindGroupDecl {
    pub layout: BindGroupLayoutRef,
    /// Cyclic pool size; 1 means not pooled.
    pub pool: u16,
    pub entries: Vec<BindGroupEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadOp {
    Clear,
    Load,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreOp {
    Store,
    Discard,
}

/// Where a color attachment renders to.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttachmentView {
    /// The platform-provided output texture.
    Context,
    Texture(u16),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorAttachment {
    pub view: AttachmentView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clear_value: Option<[f32; 4]>,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPassAttachments {
    pub color: Vec<ColorAttachment>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

/// A bind group slot assignment inside a pass, with an optional pool offset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BindGroupBinding {
    pub slot: u32,
    pub group: u16,
    pub ping_pong: Option<u16>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VertexBufferBinding {
    pub slot: u32,
    pub buffer: u16,
    pub ping_pong: Option<u16>,
}

/// One pipeline/bindings/draw group inside a render pass. A pass usually has
/// exactly one; the `commands` list form allows several per pass.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawCommand {
    pub pipeline: u16,
    pub bind_groups: Vec<BindGroupBinding>,
    pub vertex_buffers: Vec<VertexBufferBinding>,
    pub index_buffer: Option<(u16, IndexFormat)>,
    pub draw: Option<(u32, u32)>,
    pub draw_indexed: Option<(u32, u32)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderPassDecl {
    pub attachments: RenderPassAttachments,
    pub commands: Vec<DrawCommand>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ComputePassDecl {
    pub pipeline: u16,
    pub bind_groups: Vec<BindGroupBinding>,
    pub dispatch: [u32; 3],
}

/// A queue operation referencable from frame lists.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueDecl {
    WriteBuffer {
        buffer: u16,
        offset: u32,
        data: u16,
    },
    WriteTimeUniform {
        buffer: u16,
    },
}

/// A pass-like entry in a frame list.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PassRef {
    Render(u16),
    Compute(u16),
    Queue(u16),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FrameDecl {
    pub before: Vec<PassRef>,
    pub init: Vec<PassRef>,
    pub perform: Vec<PassRef>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnimationScene {
    pub frame: u16,
    pub start_ms: u32,
    pub duration_ms: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WasmCallDecl {
    /// `#data` declaration index of the embedded module bytes.
    pub module: u16,
    pub func: String,
}

/// The fully validated scene, namespaces keyed by source identifier.
///
/// Insertion order is declaration order, which makes every derived id
/// assignment reproducible.
#[derive(Debug, Default)]
pub struct Scene {
    pub data: IndexMap<String, DataDecl>,
    pub wgsl: IndexMap<String, WgslDecl>,
    pub buffers: IndexMap<String, BufferDecl>,
    pub textures: IndexMap<String, TextureDesc>,
    pub samplers: IndexMap<String, SamplerDesc>,
    pub bind_group_layouts: IndexMap<String, BindGroupLayoutDecl>,
    pub pipeline_layouts: IndexMap<String, PipelineLayoutDecl>,
    pub render_pipelines: IndexMap<String, RenderPipelineDesc>,
    pub compute_pipelines: IndexMap<String, ComputePipelineDesc>,
    pub bind_groups: IndexMap<String, BindGroupDecl>,
    pub render_passes: IndexMap<String, RenderPassDecl>,
    pub compute_passes: IndexMap<String, ComputePassDecl>,
    pub queues: IndexMap<String, QueueDecl>,
    pub frames: IndexMap<String, FrameDecl>,
    pub animations: Vec<AnimationScene>,
    pub wasm_calls: IndexMap<String, WasmCallDecl>,
    /// Topological order of `wgsl` (dependencies first).
    pub wgsl_order: Vec<u16>,
    pub plugins: Plugins,
}

impl Scene {
    /// The transitive import closure of a wgsl module, dependencies first,
    /// each module once, ending with the module itself.
    pub fn wgsl_closure(&self, id: u16) -> Vec<u16> {
        let mut order = Vec::new();
        let mut seen = vec![false; self.wgsl.len()];
        // Iterative post-order; the import graph is a DAG by analyzer law.
        let mut stack = vec![(id, 0usize)];
        while let Some(&(module, next)) = stack.last() {
            let imports = &self.wgsl[module as usize].imports;
            if next < imports.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let dep = imports[next];
                if !seen[dep as usize] {
                    stack.push((dep, 0));
                }
                continue;
            }
            stack.pop();
            if !seen[module as usize] {
                seen[module as usize] = true;
                order.push(module);
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wgsl(source: &str, imports: &[u16]) -> WgslDecl {
        WgslDecl {
            source: source.to_string(),
            imports: imports.to_vec(),
        }
    }

    #[test]
    fn closure_orders_dependencies_first() {
        let mut scene = Scene::default();
        scene.wgsl.insert("util".into(), wgsl("fn u() {}", &[]));
        scene.wgsl.insert("noise".into(), wgsl("fn n() {}", &[0]));
        scene.wgsl.insert("main".into(), wgsl("fn m() {}", &[1, 0]));
        assert_eq!(scene.wgsl_closure(2), vec![0, 1, 2]);
        assert_eq!(scene.wgsl_closure(0), vec![0]);
    }

    #[test]
    fn closure_visits_diamonds_once() {
        let mut scene = Scene::default();
        scene.wgsl.insert("base".into(), wgsl("", &[]));
        scene.wgsl.insert("a".into(), wgsl("", &[0]));
        scene.wgsl.insert("b".into(), wgsl("", &[0]));
        scene.wgsl.insert("top".into(), wgsl("", &[1, 2]));
        assert_eq!(scene.wgsl_closure(3), vec![0, 1, 2, 3]);
    }

    #[test]
    fn descriptor_json_shape_is_stable() {
        let desc = ComputePipelineDesc {
            layout: Layout::Auto,
            module: 0,
            entry_point: "main".into(),
        };
        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(json, r#"{"layout":"auto","module":0,"entryPoint":"main"}"#);
    }
}
