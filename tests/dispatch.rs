//! Dispatcher semantics: pass-state machine, one-shot passes, strict time
//! uniforms, user uniforms, and the animation timeline.

use pngine::mock::Call;
use pngine::pngb::{op::Op, varint, Module};
use pngine::scene::Plugins;
use pngine::uniforms::SceneTimeInputs;
use pngine::{compile, DispatchError, Dispatcher, MockBackend};

/// Hand-assemble a module whose single pass runs `body`, so malformed
/// streams the compiler would never produce can still be exercised.
fn module_with_pass(body: &[(Op, &[u32])]) -> Module {
    let mut ops = Vec::new();
    let push = |op: Op, operands: &[u32], ops: &mut Vec<u8>| {
        ops.push(op as u8);
        for &value in operands {
            varint::write(ops, value);
        }
    };
    push(Op::Submit, &[], &mut ops);
    push(Op::DefinePass, &[0, 0], &mut ops);
    for (op, operands) in body {
        push(*op, operands, &mut ops);
    }
    push(Op::EndPass, &[], &mut ops);
    push(Op::DefineFrame, &[0, 0], &mut ops);
    push(Op::ExecPass, &[0], &mut ops);
    push(Op::EndFrame, &[], &mut ops);
    push(Op::End, &[], &mut ops);
    Module {
        version: pngine::pngb::VERSION,
        flags: 0,
        plugins: Plugins::CORE,
        executor: None,
        ops,
        strings: vec!["main".into()],
        data: vec![b"{}".to_vec()],
        wgsl: Vec::new(),
        uniforms: Vec::new(),
        animations: Vec::new(),
    }
}

fn run(body: &[(Op, &[u32])]) -> Result<(), DispatchError> {
    let module = module_with_pass(body);
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();
    dispatcher.frame(0.0, 64, 64, &[])
}

#[test]
fn draw_outside_a_pass_is_fatal() {
    assert_eq!(
        run(&[(Op::Draw, &[3, 1])]),
        Err(DispatchError::BadPassState { op: "draw" })
    );
}

#[test]
fn set_pipeline_outside_a_pass_is_fatal() {
    assert_eq!(
        run(&[(Op::SetPipeline, &[0, 0])]),
        Err(DispatchError::BadPassState { op: "set_pipeline" })
    );
}

#[test]
fn nested_begin_is_fatal() {
    assert_eq!(
        run(&[
            (Op::BeginRenderPass, &[0]),
            (Op::BeginRenderPass, &[0]),
        ]),
        Err(DispatchError::BadPassState {
            op: "begin_render_pass"
        })
    );
}

#[test]
fn dispatch_inside_a_render_pass_is_fatal() {
    assert_eq!(
        run(&[(Op::BeginRenderPass, &[0]), (Op::Dispatch, &[1, 1, 1])]),
        Err(DispatchError::BadPassState { op: "dispatch" })
    );
}

#[test]
fn draw_inside_a_compute_pass_is_fatal() {
    assert_eq!(
        run(&[(Op::BeginComputePass, &[]), (Op::Draw, &[3, 1])]),
        Err(DispatchError::BadPassState { op: "draw" })
    );
}

#[test]
fn a_well_formed_render_pass_runs() {
    run(&[(Op::BeginRenderPass, &[0]), (Op::Draw, &[3, 1])]).unwrap();
}

#[test]
fn frame_failure_leaves_later_frames_possible() {
    let module = module_with_pass(&[(Op::Draw, &[3, 1])]);
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();
    assert!(dispatcher.frame(0.0, 64, 64, &[]).is_err());
    // The failed frame did not advance the counter.
    assert_eq!(dispatcher.frame_counter(), 0);
}

const ONCE: &str = r#"
    #data seed { values = [7, 7], kind = u32 }
    #buffer state { size = 8, usage = [STORAGE, COPY_DST] }
    #queue upload { buffer = $buffer.state, data = $data.seed }
    #frame main { init = [$queue.upload], perform = [] }
"#;

#[test]
fn exec_pass_once_fires_once_per_dispatcher_lifetime() {
    let module = compile(ONCE).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();
    for frame in 0..3 {
        dispatcher.frame(frame as f32, 64, 64, &[]).unwrap();
    }
    let writes = dispatcher
        .backend()
        .calls()
        .iter()
        .filter(|call| matches!(call, Call::WriteBuffer { .. }))
        .count();
    assert_eq!(writes, 1);
}

#[test]
fn write_time_uniform_requires_exactly_16_bytes() {
    let source = r#"
        #buffer small { size = 8, usage = [UNIFORM, COPY_DST] }
        #queue tick { timeUniform = $buffer.small }
        #frame main { perform = [$queue.tick] }
    "#;
    let module = compile(source).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();
    assert_eq!(
        dispatcher.frame(0.0, 64, 64, &[]),
        Err(DispatchError::UniformSizeMismatch {
            id: 0,
            expected: 16,
            actual: 8
        })
    );
}

#[test]
fn write_time_uniform_goes_through_the_backend() {
    let source = r#"
        #buffer inputs { size = 16, usage = [UNIFORM, COPY_DST] }
        #queue tick { timeUniform = $buffer.inputs }
        #frame main { perform = [$queue.tick] }
    "#;
    let module = compile(source).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();
    dispatcher.frame(0.5, 64, 64, &[]).unwrap();
    assert!(dispatcher
        .backend()
        .calls()
        .contains(&Call::WriteTimeUniform { id: 0 }));
}

#[test]
fn user_uniforms_are_written_by_name() {
    let source = r#"
        #buffer params { size = 8, usage = [UNIFORM, COPY_DST], fields = [{ offset = 0, size = 8, source = "custom" }] }
        #frame main { perform = [] }
    "#;
    let module = compile(source).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();

    let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
    dispatcher.frame(0.0, 64, 64, &[("custom", &payload)]).unwrap();
    assert!(dispatcher.backend().calls().contains(&Call::WriteBuffer {
        id: 0,
        offset: 0,
        bytes: payload.to_vec()
    }));

    // A wrong-size payload is rejected, an unknown name is ignored.
    assert!(matches!(
        dispatcher.frame(0.0, 64, 64, &[("custom", &[1u8, 2])]),
        Err(DispatchError::UniformSizeMismatch { .. })
    ));
    dispatcher.frame(0.0, 64, 64, &[("unrelated", &payload)]).unwrap();
}

const TIMELINE: &str = r#"
    #buffer sceneClock { size = 12, usage = [UNIFORM, COPY_DST], stream = "sceneTimeInputs" }
    #frame intro { perform = [] }
    #frame outro { perform = [] }
    #animation timeline {
        scenes = [
            { frame = $frame.intro, start = 0, duration = 2000 },
            { frame = $frame.outro, start = 2000, duration = 3000 }
        ]
    }
"#;

#[test]
fn animation_switches_frames_and_feeds_scene_time() {
    let module = compile(TIMELINE).unwrap();
    assert!(module.plugins.contains(Plugins::ANIMATION));
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();

    // Inside the second scene: 3.0s is 1.0s into a 3s window.
    dispatcher.frame(3.0, 64, 64, &[]).unwrap();
    let expected = SceneTimeInputs::new(1.0, 3.0);
    assert!(dispatcher.backend().calls().contains(&Call::WriteBuffer {
        id: 0,
        offset: 0,
        bytes: expected.as_bytes().to_vec()
    }));

    // Past the timeline no scene is active; the clock is left alone.
    let before = dispatcher.backend().calls().len();
    dispatcher.frame(60.0, 64, 64, &[]).unwrap();
    let writes_after = dispatcher.backend().calls()[before..]
        .iter()
        .filter(|call| matches!(call, Call::WriteBuffer { .. }))
        .count();
    assert_eq!(writes_after, 0);
}

#[test]
fn set_frame_selects_by_name() {
    let module = compile(TIMELINE).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    dispatcher.init().unwrap();
    dispatcher.set_frame("outro").unwrap();
    assert_eq!(
        dispatcher.set_frame("nope"),
        Err(DispatchError::UnknownFrame {
            name: "nope".into()
        })
    );
}

#[test]
fn frame_before_init_is_refused() {
    let module = compile(TIMELINE).unwrap();
    let mut dispatcher = Dispatcher::new(&module, MockBackend::new());
    assert_eq!(
        dispatcher.frame(0.0, 64, 64, &[]),
        Err(DispatchError::NotInitialized)
    );
}
