//! Format laws: module roundtrip, trace determinism, truncation, and the
//! separation of the stored and emitted opcode spaces.

use pngine::dispatch::command;
use pngine::mock::Call;
use pngine::pngb::op;
use pngine::{compile, Dispatcher, MockBackend, Module};

const SCENE: &str = r#"
    #data verts { values = [0.0, 0.5, -0.5, -0.5, 0.5, -0.5] }
    #wgsl util { code = "fn id(v: f32) -> f32 { return v; }" }
    #wgsl tri { code = "@vertex fn vs() {} @fragment fn fs() {}", imports = [$wgsl.util] }
    #buffer verts { usage = [VERTEX, COPY_DST], data = $data.verts }
    #buffer uniforms { size = 16, usage = [UNIFORM, COPY_DST], stream = "pngineInputs" }
    #bindGroupLayout bgl { entries = [{ binding = 0, visibility = [VERTEX], type = uniform }] }
    #bindGroup u { layout = $bindGroupLayout.bgl, entries = [{ binding = 0, buffer = $buffer.uniforms }] }
    #renderPipeline p {
        vertex = {
            module = $wgsl.tri,
            entryPoint = "vs",
            buffers = [{
                arrayStride = 8,
                attributes = [{ format = float32x2, offset = 0, shaderLocation = 0 }]
            }]
        },
        fragment = { module = $wgsl.tri, entryPoint = "fs", targets = [{ format = bgra8unorm }] }
    }
    #renderPass draw {
        colorAttachments = [{ clearValue = [0.1, 0.1, 0.1, 1] }],
        pipeline = $renderPipeline.p,
        bindGroups = [$bindGroup.u],
        vertexBuffers = [$buffer.verts],
        draw = 3
    }
    #frame main { perform = [$renderPass.draw] }
"#;

fn trace(module: &Module, frames: u32) -> Vec<Call> {
    let mut dispatcher = Dispatcher::new(module, MockBackend::new());
    dispatcher.init().unwrap();
    for frame in 0..frames {
        dispatcher
            .frame(frame as f32 * 0.016, 640, 480, &[])
            .unwrap();
    }
    dispatcher.into_backend().calls().to_vec()
}

#[test]
fn decoded_module_equals_emitted_module() {
    let module = compile(SCENE).unwrap();
    let bytes = module.encode().unwrap();
    assert_eq!(Module::decode(&bytes).unwrap(), module);
}

#[test]
fn decoded_module_produces_identical_trace() {
    let module = compile(SCENE).unwrap();
    let decoded = Module::decode(&module.encode().unwrap()).unwrap();
    assert_eq!(trace(&module, 3), trace(&decoded, 3));
}

#[test]
fn two_dispatchers_are_deterministic() {
    let module = compile(SCENE).unwrap();
    assert_eq!(trace(&module, 5), trace(&module, 5));
}

#[test]
fn compiling_twice_is_byte_identical() {
    let first = pngine::compile_to_bytes(SCENE).unwrap();
    let second = pngine::compile_to_bytes(SCENE).unwrap();
    assert_eq!(first, second);
}

#[test]
fn imports_are_concatenated_dependencies_first() {
    let module = compile(SCENE).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();
    let source = dispatcher
        .backend()
        .calls()
        .iter()
        .find_map(|call| match call {
            // `tri` is wgsl declaration 1.
            Call::CreateShaderModule { id: 1, source } => Some(source.clone()),
            _ => None,
        })
        .expect("tri module created");
    let util_at = source.find("fn id").unwrap();
    let tri_at = source.find("@vertex").unwrap();
    assert!(util_at < tri_at);
}

/// Drop one byte out of the data-section blob (fixing up the later section
/// offsets), so the last data entry overruns its region.
#[test]
fn truncated_data_section_fails_cleanly() {
    let module = compile(SCENE).unwrap();
    let mut bytes = module.encode().unwrap();

    let read_u32 = |bytes: &[u8], at: usize| {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    };
    let wgsl_offset = read_u32(&bytes, 24) as usize;
    bytes.remove(wgsl_offset - 1);
    for at in [24usize, 28, 32] {
        let patched = read_u32(&bytes, at) - 1;
        bytes[at..at + 4].copy_from_slice(&patched.to_le_bytes());
    }

    assert_eq!(
        Module::decode(&bytes),
        Err(pngine::FormatError::TruncatedTable("data"))
    );
}

#[test]
fn truncated_tail_never_yields_a_module() {
    let bytes = pngine::compile_to_bytes(SCENE).unwrap();
    for cut in 1..64 {
        assert!(Module::decode(&bytes[..bytes.len() - cut]).is_err());
    }
}

/// The stored and emitted opcode tables never put the same semantic on the
/// same byte; the shared `end` terminator (0xff in both) is the one pinned
/// exception.
#[test]
fn opcode_spaces_are_disjoint() {
    for &(stored_byte, stored_name) in op::NAMES {
        for &(command_byte, command_name) in command::NAMES {
            if stored_name == command_name && stored_name != "end" {
                assert_ne!(
                    stored_byte, command_byte,
                    "`{stored_name}` shares byte 0x{stored_byte:02x} across spaces"
                );
            }
        }
    }
    // Both spaces have a draw, and they deliberately differ.
    let stored_draw = op::NAMES.iter().find(|(_, n)| *n == "draw").unwrap().0;
    let command_draw = command::NAMES.iter().find(|(_, n)| *n == "draw").unwrap().0;
    assert_ne!(stored_draw, command_draw);
    assert_eq!(command::SUBMIT, 0xf0);
    assert_eq!(command::END, 0xff);
}

/// Replaying a frame through the command recorder yields a stream that ends
/// with `submit`, proving the recorder is a drop-in backend peer.
#[test]
fn command_recorder_is_a_backend_peer() {
    let module = compile(SCENE).unwrap();
    let mut dispatcher = Dispatcher::new(&module, command::CommandRecorder::new());
    dispatcher.init().unwrap();
    dispatcher.frame(0.0, 256, 256, &[]).unwrap();
    let (stream, blob) = dispatcher.into_backend().finish();
    assert_eq!(stream.last(), Some(&command::SUBMIT));
    assert!(stream.contains(&command::DRAW));
    assert!(!blob.is_empty());
}
