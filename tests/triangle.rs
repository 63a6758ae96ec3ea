//! End-to-end: minimal and moving triangle scenes against the mock backend.

use pngine::backend::PipelineKind;
use pngine::mock::Call;
use pngine::uniforms::PngineInputs;
use pngine::{compile, Dispatcher, MockBackend};

const MINIMAL_TRIANGLE: &str = r#"
    #wgsl tri {
        code = "@vertex fn vs(@builtin(vertex_index) i: u32) -> @builtin(position) vec4f { return vec4f(0.0); }"
    }
    #renderPipeline p {
        vertex = { module = $wgsl.tri, entryPoint = "vs" },
        fragment = { module = $wgsl.tri, entryPoint = "fs", targets = [{ format = bgra8unorm }] }
    }
    #renderPass draw { colorAttachments = [{}], pipeline = $renderPipeline.p, draw = 3 }
    #frame main { perform = [$renderPass.draw] }
"#;

#[test]
fn minimal_triangle_compiles_under_a_kilobyte() {
    let bytes = pngine::compile_to_bytes(MINIMAL_TRIANGLE).unwrap();
    assert!(bytes.len() < 1024, "{} bytes", bytes.len());
}

#[test]
fn minimal_triangle_trace() {
    let _ = env_logger::builder().is_test(true).try_init();
    let module = compile(MINIMAL_TRIANGLE).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();

    let init_trace = dispatcher.backend().calls().to_vec();
    assert!(matches!(
        init_trace[0],
        Call::CreateShaderModule { id: 0, .. }
    ));
    assert!(matches!(
        init_trace[1],
        Call::CreateRenderPipeline { id: 0, .. }
    ));
    assert_eq!(init_trace[2], Call::Submit);
    assert_eq!(init_trace.len(), 3);

    dispatcher.frame(0.0, 512, 512, &[]).unwrap();
    let frame_trace = dispatcher.backend().calls()[3..].to_vec();
    assert!(matches!(frame_trace[0], Call::BeginRenderPass { .. }));
    assert_eq!(
        frame_trace[1],
        Call::SetPipeline {
            kind: PipelineKind::Render,
            id: 0
        }
    );
    assert_eq!(
        frame_trace[2],
        Call::Draw {
            vertices: 3,
            instances: 1
        }
    );
    assert_eq!(frame_trace[3], Call::EndPass);
    assert_eq!(frame_trace[4], Call::Submit);
    assert_eq!(frame_trace.len(), 5);
    assert_eq!(dispatcher.frame_counter(), 1);
}

const MOVING_TRIANGLE: &str = r#"
    #wgsl tri { code = "@vertex fn vs() {} @fragment fn fs() {}" }
    #buffer uniforms { size = 16, usage = [UNIFORM, COPY_DST], stream = "pngineInputs" }
    #bindGroupLayout bgl {
        entries = [{ binding = 0, visibility = [VERTEX, FRAGMENT], type = uniform }]
    }
    #pipelineLayout pl { layouts = [$bindGroupLayout.bgl] }
    #bindGroup u { layout = $bindGroupLayout.bgl, entries = [{ binding = 0, buffer = $buffer.uniforms }] }
    #renderPipeline p {
        layout = $pipelineLayout.pl,
        vertex = { module = $wgsl.tri, entryPoint = "vs" },
        fragment = { module = $wgsl.tri, entryPoint = "fs", targets = [{ format = bgra8unorm }] }
    }
    #renderPass draw {
        colorAttachments = [{ clearValue = [0, 0, 0, 1] }],
        pipeline = $renderPipeline.p,
        bindGroups = [$bindGroup.u],
        draw = 3
    }
    #frame main { perform = [$renderPass.draw] }
"#;

#[test]
fn moving_triangle_writes_inputs_before_the_pass() {
    let module = compile(MOVING_TRIANGLE).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();
    let init_len = dispatcher.backend().calls().len();

    dispatcher.frame(1.0, 800, 600, &[]).unwrap();
    let trace = &dispatcher.backend().calls()[init_len..];

    let expected = PngineInputs::new(1.0, 800, 600).as_bytes().to_vec();
    assert_eq!(
        trace[0],
        Call::WriteBuffer {
            id: 0,
            offset: 0,
            bytes: expected
        }
    );
    assert!(matches!(trace[1], Call::BeginRenderPass { .. }));
    assert_eq!(trace[3], Call::SetBindGroup { slot: 0, id: 0 });
}

#[test]
fn aspect_ratio_lands_in_the_last_float() {
    let module = compile(MOVING_TRIANGLE).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();
    dispatcher.frame(2.5, 1024, 512, &[]).unwrap();

    let bytes = dispatcher
        .backend()
        .calls()
        .iter()
        .find_map(|call| match call {
            Call::WriteBuffer { id: 0, bytes, .. } => Some(bytes.clone()),
            _ => None,
        })
        .expect("inputs written");
    assert_eq!(&bytes[12..16], &2.0f32.to_le_bytes());
}

#[test]
fn shutdown_releases_in_reverse_creation_order() {
    let module = compile(MOVING_TRIANGLE).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();
    let created: Vec<Call> = dispatcher
        .backend()
        .calls()
        .iter()
        .filter(|call| {
            matches!(
                call,
                Call::CreateShaderModule { .. }
                    | Call::CreateBuffer { .. }
                    | Call::CreateBindGroupLayout { .. }
                    | Call::CreatePipelineLayout { .. }
                    | Call::CreateRenderPipeline { .. }
                    | Call::CreateBindGroup { .. }
            )
        })
        .cloned()
        .collect();

    dispatcher.shutdown();
    let destroys: Vec<Call> = dispatcher
        .backend()
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::Destroy { .. }))
        .cloned()
        .collect();
    assert_eq!(destroys.len(), created.len());
    assert_eq!(
        dispatcher.backend().calls().last(),
        Some(&Call::End)
    );
}

#[test]
fn creation_failure_unwinds_created_resources() {
    let module = compile(MOVING_TRIANGLE).unwrap();
    let mut backend = MockBackend::new();
    backend.fail_on(pngine::backend::ResourceKind::RenderPipeline, 0);
    let mut dispatcher = Dispatcher::new(&module, backend);
    let err = dispatcher.init().unwrap_err();
    assert!(matches!(err, pngine::DispatchError::Backend { .. }));

    // Everything created before the failure is destroyed, last first.
    let calls = dispatcher.backend().calls();
    let creations = calls
        .iter()
        .filter(|call| {
            matches!(
                call,
                Call::CreateShaderModule { .. }
                    | Call::CreateBuffer { .. }
                    | Call::CreateBindGroupLayout { .. }
                    | Call::CreatePipelineLayout { .. }
                    | Call::CreateBindGroup { .. }
            )
        })
        .count();
    let destroys = calls
        .iter()
        .filter(|call| matches!(call, Call::Destroy { .. }))
        .count();
    assert_eq!(creations, destroys);

    // A frame after failed init is refused.
    assert_eq!(
        dispatcher.frame(0.0, 64, 64, &[]),
        Err(pngine::DispatchError::NotInitialized)
    );
}
