mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pipetrace::pipe::{
    BindFlags, Context, Format, FramebufferState, Handle, PrimitiveType, ResourceTemplate,
    SamplerViewTemplate, Screen, ShaderSource, ShaderStage, SurfaceTemplate,
};
use pipetrace::{BlockFlags, ProxyScreen, TraceConfig};
use pipetrace_protocol::{
    decode_reply, encode_frame, Client, ClientError, DrawRule, ErrorCode, Event, FrameParser,
    Reply, BLOCK_AFTER, BLOCK_BEFORE, BLOCK_RULE,
};
use pretty_assertions::assert_eq;

use common::{debug_config, rgba_texture, wait_until, FakeLog, FakeScreen, BAD_SHADER};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn start() -> (ProxyScreen, FakeLog, Client) {
    start_with(debug_config())
}

fn start_with(config: TraceConfig) -> (ProxyScreen, FakeLog, Client) {
    let (backend, log) = FakeScreen::new();
    let screen = ProxyScreen::new(backend, &config).unwrap();
    let client = Client::connect(screen.debug_addr().unwrap()).unwrap();
    (screen, log, client)
}

fn server_error(err: ClientError) -> ErrorCode {
    match err {
        ClientError::Server { code, .. } => code,
        other => panic!("expected an error reply, got {other:?}"),
    }
}

/// Run one draw on another thread. The receiver fires when the draw has returned.
fn draw_in_background(
    mut ctx: Box<dyn Context>,
) -> (mpsc::Receiver<()>, JoinHandle<Box<dyn Context>>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        ctx.draw_arrays(PrimitiveType::Triangles, 0, 3);
        let _ = tx.send(());
        ctx
    });
    (rx, handle)
}

fn shader(ctx: &mut Box<dyn Context>, stage: ShaderStage, source: &str) -> Handle {
    ctx.create_shader(stage, &ShaderSource::new(source))
        .unwrap()
}

#[test]
fn ping_and_object_lists() {
    let (screen, _log, mut client) = start();
    client.ping().unwrap();
    assert_eq!(client.context_list().unwrap(), Vec::<u64>::new());

    let ctx = screen.create_context().unwrap();
    let tex = screen.resource_create(&rgba_texture(4, 4)).unwrap();
    let _buf = screen
        .resource_create(&ResourceTemplate::buffer(32, BindFlags::VERTEX_BUFFER))
        .unwrap();

    assert_eq!(client.context_list().unwrap(), vec![2]);
    assert_eq!(client.texture_list().unwrap(), vec![tex.get()]);

    drop(ctx);
    assert_eq!(client.context_list().unwrap(), Vec::<u64>::new());
}

#[test]
fn context_info_reports_proxy_identities() {
    let (screen, _log, mut client) = start();
    let mut ctx = screen.create_context().unwrap();
    let tex = screen.resource_create(&rgba_texture(4, 4)).unwrap();
    let surf = ctx
        .create_surface(
            tex,
            &SurfaceTemplate {
                format: Format::R8G8B8A8Unorm,
                level: 0,
                first_layer: 0,
                last_layer: 0,
                usage: BindFlags::RENDER_TARGET,
            },
        )
        .unwrap();
    let vs = shader(&mut ctx, ShaderStage::Vertex, "VERT");
    let fs = shader(&mut ctx, ShaderStage::Fragment, "FRAG");
    ctx.bind_shader(ShaderStage::Vertex, Some(vs));
    ctx.bind_shader(ShaderStage::Fragment, Some(fs));
    ctx.set_sampler_textures(ShaderStage::Fragment, &[None, Some(tex)]);
    ctx.set_framebuffer_state(&FramebufferState {
        width: 4,
        height: 4,
        cbufs: vec![Some(surf)],
        zsbuf: None,
    });

    let info = client.context_info(2).unwrap();
    assert_eq!(info.vertex, vs.get());
    assert_eq!(info.fragment, fs.get());
    assert_eq!(info.fragment_textures, vec![0, tex.get()]);
    assert!(info.vertex_textures.is_empty());
    assert_eq!(info.cbufs, vec![surf.get()]);
    assert_eq!(info.zsbuf, 0);
    assert_eq!((info.blocker, info.blocked), (0, 0));

    assert_eq!(client.shader_list(2).unwrap(), vec![vs.get(), fs.get()]);
    let fs_info = client.shader_info(2, fs.get()).unwrap();
    assert_eq!(fs_info.stage, 1);
    assert_eq!(fs_info.original, "FRAG");
    assert_eq!(fs_info.replaced, None);
    assert!(!fs_info.disabled);
}

#[test]
fn sampler_view_bindings_report_the_viewed_textures() {
    let (screen, _log, mut client) = start();
    let mut ctx = screen.create_context().unwrap();
    let templ = rgba_texture(4, 4);
    let tex = screen.resource_create(&templ).unwrap();
    let view = ctx
        .create_sampler_view(tex, &SamplerViewTemplate::for_resource(&templ))
        .unwrap();

    ctx.set_sampler_views(ShaderStage::Vertex, &[Some(view), None]);
    let info = client.context_info(2).unwrap();
    assert_eq!(info.vertex_textures, vec![tex.get(), 0]);
    assert!(info.fragment_textures.is_empty());
}

#[test]
fn before_block_pauses_draw_until_stepped() {
    let (screen, log, mut client) = start();
    let ctx = screen.create_context().unwrap();
    let id = 2;

    client.draw_block(id, BLOCK_BEFORE).unwrap();
    let (done, handle) = draw_in_background(ctx);

    assert_eq!(
        client.next_event(Some(EVENT_TIMEOUT)).unwrap(),
        Some(Event::DrawBlocked {
            context: id,
            blocked: BLOCK_BEFORE
        })
    );
    assert!(done.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(log.calls_starting_with("draw_arrays").is_empty());
    let info = client.context_info(id).unwrap();
    assert_eq!((info.blocker, info.blocked), (BLOCK_BEFORE, BLOCK_BEFORE));

    client.draw_step(id, BLOCK_BEFORE).unwrap();
    done.recv_timeout(EVENT_TIMEOUT).unwrap();
    let ctx = handle.join().unwrap();
    assert_eq!(log.calls_starting_with("draw_arrays").len(), 1);

    // The blocker survives a step, so the next draw pauses as well.
    let (done, handle) = draw_in_background(ctx);
    assert!(matches!(
        client.next_event(Some(EVENT_TIMEOUT)).unwrap(),
        Some(Event::DrawBlocked { .. })
    ));
    client.draw_unblock(id, BLOCK_BEFORE).unwrap();
    done.recv_timeout(EVENT_TIMEOUT).unwrap();
    let mut ctx = handle.join().unwrap();

    // Unblocked: draws go straight through.
    ctx.draw_arrays(PrimitiveType::Points, 0, 1);
    assert_eq!(log.calls_starting_with("draw_arrays").len(), 3);
    assert_eq!(client.context_info(id).unwrap().blocker, 0);
}

#[test]
fn after_block_pauses_once_the_backend_has_drawn() {
    let (screen, log, mut client) = start();
    let ctx = screen.create_context().unwrap();

    client.draw_block(2, BLOCK_AFTER).unwrap();
    let (done, handle) = draw_in_background(ctx);
    assert_eq!(
        client.next_event(Some(EVENT_TIMEOUT)).unwrap(),
        Some(Event::DrawBlocked {
            context: 2,
            blocked: BLOCK_AFTER
        })
    );
    assert_eq!(log.calls_starting_with("draw_arrays").len(), 1);
    assert!(done.recv_timeout(Duration::from_millis(50)).is_err());

    client.draw_unblock(2, BLOCK_AFTER).unwrap();
    done.recv_timeout(EVENT_TIMEOUT).unwrap();
    handle.join().unwrap();
}

#[test]
fn rule_blocks_only_matching_draws() {
    let (screen, log, mut client) = start();
    let mut ctx = screen.create_context().unwrap();
    let plain = shader(&mut ctx, ShaderStage::Fragment, "PLAIN");
    let suspect = shader(&mut ctx, ShaderStage::Fragment, "SUSPECT");

    client
        .draw_rule(
            2,
            DrawRule {
                fragment: suspect.get(),
                block: BLOCK_BEFORE,
                ..DrawRule::default()
            },
        )
        .unwrap();
    assert_eq!(client.context_info(2).unwrap().blocker, BLOCK_RULE);

    ctx.bind_shader(ShaderStage::Fragment, Some(plain));
    ctx.draw_arrays(PrimitiveType::Triangles, 0, 3);
    assert_eq!(log.calls_starting_with("draw_arrays").len(), 1);

    ctx.bind_shader(ShaderStage::Fragment, Some(suspect));
    let (done, handle) = draw_in_background(ctx);
    assert_eq!(
        client.next_event(Some(EVENT_TIMEOUT)).unwrap(),
        Some(Event::DrawBlocked {
            context: 2,
            blocked: BLOCK_BEFORE | BLOCK_RULE
        })
    );

    // A rule hit is released as a whole by a step that includes the rule bit.
    client.draw_step(2, BLOCK_RULE).unwrap();
    done.recv_timeout(EVENT_TIMEOUT).unwrap();
    let mut ctx = handle.join().unwrap();
    assert_eq!(client.context_info(2).unwrap().blocked, 0);

    client.draw_unblock(2, BLOCK_RULE).unwrap();
    ctx.draw_arrays(PrimitiveType::Triangles, 0, 3);
    assert_eq!(log.calls_starting_with("draw_arrays").len(), 3);
}

#[test]
fn disabled_shader_skips_draws() {
    let (screen, log, mut client) = start();
    let mut ctx = screen.create_context().unwrap();
    let fs = shader(&mut ctx, ShaderStage::Fragment, "FRAG");
    ctx.bind_shader(ShaderStage::Fragment, Some(fs));

    client.shader_disable(2, fs.get(), true).unwrap();
    assert!(client.shader_info(2, fs.get()).unwrap().disabled);
    ctx.draw_arrays(PrimitiveType::Triangles, 0, 3);
    assert!(log.calls_starting_with("draw_arrays").is_empty());

    client.shader_disable(2, fs.get(), false).unwrap();
    ctx.draw_arrays(PrimitiveType::Triangles, 0, 3);
    assert_eq!(log.calls_starting_with("draw_arrays").len(), 1);

    assert_eq!(
        server_error(client.shader_disable(2, 999, true).unwrap_err()),
        ErrorCode::NOT_FOUND
    );
}

#[test]
fn shader_replace_swaps_the_bound_program() {
    let (screen, log, mut client) = start();
    let mut ctx = screen.create_context().unwrap();
    let fs = shader(&mut ctx, ShaderStage::Fragment, "ORIGINAL");
    ctx.bind_shader(ShaderStage::Fragment, Some(fs));
    // Backend ids: context 0x1001, original program 0x1002.
    log.clear();

    client
        .shader_replace(2, fs.get(), Some("REPLACED".into()))
        .unwrap();
    assert_eq!(
        log.calls(),
        vec![
            "create_shader Fragment 0x1003".to_owned(),
            format!("bind_shader Fragment Some({})", 0x1003),
        ]
    );
    let info = client.shader_info(2, fs.get()).unwrap();
    assert_eq!(info.original, "ORIGINAL");
    assert_eq!(info.replaced.as_deref(), Some("REPLACED"));

    ctx.draw_arrays(PrimitiveType::Triangles, 0, 3);
    assert_eq!(
        log.calls_starting_with("draw_arrays"),
        vec![format!("draw_arrays Triangles 0 3 vs=None fs=Some({})", 0x1003)]
    );

    // Replacing again retires the previous replacement.
    client
        .shader_replace(2, fs.get(), Some("REPLACED".into()))
        .unwrap();
    assert_eq!(log.live_shaders(), 2);
    assert_eq!(log.calls_starting_with("delete_shader").len(), 1);
    assert_eq!(
        client.shader_info(2, fs.get()).unwrap().replaced.as_deref(),
        Some("REPLACED")
    );

    // A program the backend rejects leaves the current replacement in place.
    let err = client
        .shader_replace(2, fs.get(), Some(BAD_SHADER.into()))
        .unwrap_err();
    assert_eq!(server_error(err), ErrorCode::BACKEND);
    assert_eq!(
        client.shader_info(2, fs.get()).unwrap().replaced.as_deref(),
        Some("REPLACED")
    );

    // Restoring rebinds the original and frees the replacement.
    client.shader_replace(2, fs.get(), None).unwrap();
    assert_eq!(client.shader_info(2, fs.get()).unwrap().replaced, None);
    assert_eq!(log.live_shaders(), 1);
    assert_eq!(
        log.calls().last().map(String::as_str),
        Some("delete_shader Fragment 0x1004")
    );
    ctx.draw_arrays(PrimitiveType::Triangles, 0, 3);
    assert_eq!(
        log.calls_starting_with("draw_arrays").last().cloned(),
        Some(format!("draw_arrays Triangles 0 3 vs=None fs=Some({})", 0x1002))
    );

    client
        .shader_replace(2, fs.get(), Some("AGAIN".into()))
        .unwrap();
    ctx.delete_shader(ShaderStage::Fragment, fs);
    assert_eq!(log.live_shaders(), 0);
    assert_eq!(client.shader_list(2).unwrap(), Vec::<u64>::new());
}

#[test]
fn paused_draw_runs_with_shader_changes_made_while_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.xml");
    let (screen, log, mut client) = start_with(TraceConfig {
        output: Some(path.clone()),
        ..debug_config()
    });
    let mut ctx = screen.create_context().unwrap();
    // Backend ids: context 0x1001, original program 0x1002.
    let fs = shader(&mut ctx, ShaderStage::Fragment, "ORIGINAL");
    ctx.bind_shader(ShaderStage::Fragment, Some(fs));

    client.draw_block(2, BLOCK_BEFORE).unwrap();
    let (done, handle) = draw_in_background(ctx);
    client.next_event(Some(EVENT_TIMEOUT)).unwrap().unwrap();
    client
        .shader_replace(2, fs.get(), Some("REPLACED".into()))
        .unwrap();
    client.draw_step(2, BLOCK_BEFORE).unwrap();
    done.recv_timeout(EVENT_TIMEOUT).unwrap();
    let ctx = handle.join().unwrap();
    assert_eq!(
        log.calls_starting_with("draw_arrays"),
        vec![format!("draw_arrays Triangles 0 3 vs=None fs=Some({})", 0x1003)]
    );

    // Disabled during the pause: the released draw never reaches the backend.
    let (done, handle) = draw_in_background(ctx);
    client.next_event(Some(EVENT_TIMEOUT)).unwrap().unwrap();
    client.shader_disable(2, fs.get(), true).unwrap();
    client.draw_unblock(2, BLOCK_BEFORE).unwrap();
    done.recv_timeout(EVENT_TIMEOUT).unwrap();
    drop(handle.join().unwrap());
    assert_eq!(log.calls_starting_with("draw_arrays").len(), 1);

    drop(client);
    drop(screen);
    let doc = std::fs::read_to_string(&path).unwrap();
    let draws: Vec<&str> = doc
        .lines()
        .filter(|l| l.contains("method='draw_arrays'"))
        .collect();
    assert_eq!(draws.len(), 2);
    assert!(draws[0].contains("<arg name='fs'><ptr>0x1003</ptr></arg>"), "{}", draws[0]);
    assert!(!draws[0].contains("skipped"), "{}", draws[0]);
    assert!(draws[1].contains("<enum>skipped</enum>"), "{}", draws[1]);
}

#[test]
fn texture_reads_return_the_requested_region() {
    let (screen, log, mut client) = start();
    let tex = screen.resource_create(&rgba_texture(4, 4)).unwrap();
    let backend_tex = screen.backend_resource(tex).unwrap();
    let pixels: Vec<u8> = (0..64).collect();
    log.fill(backend_tex, &pixels);

    let info = client.texture_info(tex.get()).unwrap();
    assert_eq!(info.levels, vec![[4, 4, 1]]);
    assert_eq!(info.format, Format::R8G8B8A8Unorm.as_u32());
    assert_eq!(info.block_size, 4);
    assert_eq!(info.last_level, 0);

    let full = client.texture_read(tex.get(), 0, 0, 0, 0, 0, 0, 0).unwrap();
    assert_eq!(full.stride, 16);
    assert_eq!(full.data, pixels);

    let part = client.texture_read(tex.get(), 0, 0, 0, 1, 1, 2, 2).unwrap();
    assert_eq!(part.stride, 8);
    assert_eq!(
        part.data,
        [&pixels[20..28], &pixels[36..44]].concat()
    );

    // Reads use a private context and leave no mapping behind.
    assert_eq!(
        log.calls_starting_with("transfer_map").len(),
        log.calls_starting_with("transfer_unmap").len()
    );
    assert!(screen.contexts().is_empty());

    assert_eq!(
        server_error(client.texture_read(999, 0, 0, 0, 0, 0, 0, 0).unwrap_err()),
        ErrorCode::NOT_FOUND
    );
    assert_eq!(
        server_error(client.texture_read(tex.get(), 0, 3, 0, 0, 0, 0, 0).unwrap_err()),
        ErrorCode::PROTOCOL
    );
}

#[test]
fn unknown_objects_and_opcodes_get_error_replies() {
    let (screen, _log, mut client) = start();
    let buf = screen
        .resource_create(&ResourceTemplate::buffer(16, BindFlags::VERTEX_BUFFER))
        .unwrap();

    assert_eq!(
        server_error(client.context_info(42).unwrap_err()),
        ErrorCode::NOT_FOUND
    );
    assert_eq!(
        server_error(client.texture_info(buf.get()).unwrap_err()),
        ErrorCode::NOT_FOUND
    );
    assert_eq!(
        server_error(client.draw_block(0, BLOCK_BEFORE).unwrap_err()),
        ErrorCode::NOT_FOUND
    );

    // One client at a time.
    drop(client);
    let mut raw = TcpStream::connect(screen.debug_addr().unwrap()).unwrap();
    raw.set_read_timeout(Some(EVENT_TIMEOUT)).unwrap();
    raw.write_all(&encode_frame(4242, 9, &[]).unwrap()).unwrap();

    let mut parser = FrameParser::new();
    let mut buf = [0u8; 256];
    let frame = loop {
        let n = raw.read(&mut buf).unwrap();
        assert!(n > 0, "server closed the connection");
        if let Some(frame) = parser.push(&buf[..n]).unwrap().into_iter().next() {
            break frame;
        }
    };
    assert_eq!(frame.serial, 9);
    match decode_reply(&frame).unwrap() {
        Reply::Error { code, .. } => assert_eq!(code, ErrorCode::UNKNOWN_OPCODE),
        other => panic!("unexpected reply {other:?}"),
    }
}

#[test]
fn debugger_flush_destroys_the_fence() {
    let (screen, log, mut client) = start();
    let _ctx = screen.create_context().unwrap();

    client.flush(2).unwrap();
    assert_eq!(
        log.calls_starting_with("f"),
        vec!["flush 1".to_owned(), "fence_destroy 1".to_owned()]
    );
}

#[test]
fn paused_draws_survive_a_client_disconnect() {
    let (screen, log, mut client) = start();
    let ctx = screen.create_context().unwrap();

    client.draw_block(2, BLOCK_BEFORE).unwrap();
    let (done, handle) = draw_in_background(ctx);
    client.next_event(Some(EVENT_TIMEOUT)).unwrap().unwrap();
    drop(client);

    assert!(done.recv_timeout(Duration::from_millis(100)).is_err());
    let mut client = Client::connect(screen.debug_addr().unwrap()).unwrap();
    assert_eq!(client.context_info(2).unwrap().blocked, BLOCK_BEFORE);

    client.draw_unblock(2, BLOCK_BEFORE).unwrap();
    done.recv_timeout(EVENT_TIMEOUT).unwrap();
    handle.join().unwrap();
    assert_eq!(log.calls_starting_with("draw_arrays").len(), 1);
}

#[test]
fn stalled_draw_is_inspected_and_stepped_by_a_late_client() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.xml");
    let config = TraceConfig {
        output: Some(path.clone()),
        initial_blocker: BlockFlags::BEFORE,
        ..debug_config()
    };

    let (backend, log) = FakeScreen::new();
    let screen = ProxyScreen::new(backend, &config).unwrap();
    let mut ctx = screen.create_context().unwrap();
    let s = shader(&mut ctx, ShaderStage::Vertex, "VERT");
    ctx.bind_shader(ShaderStage::Vertex, Some(s));
    let (done, handle) = draw_in_background(ctx);

    let mut client = Client::connect(screen.debug_addr().unwrap()).unwrap();
    assert_eq!(client.context_list().unwrap(), vec![2]);
    assert!(wait_until(EVENT_TIMEOUT, || {
        client.context_info(2).unwrap().blocked != 0
    }));
    let info = client.context_info(2).unwrap();
    assert_eq!(info.vertex, s.get());
    assert_eq!(info.blocked, BLOCK_BEFORE);
    assert!(done.try_recv().is_err());

    client.draw_step(2, BLOCK_BEFORE).unwrap();
    done.recv_timeout(EVENT_TIMEOUT).unwrap();
    drop(handle.join().unwrap());
    drop(client);
    drop(screen);

    let doc = std::fs::read_to_string(&path).unwrap();
    let draws: Vec<&str> = doc
        .lines()
        .filter(|l| l.contains("method='draw_arrays'"))
        .collect();
    assert_eq!(draws.len(), 1);
    // The record names the original program the backend was given.
    assert_eq!(
        log.calls_starting_with("create_shader"),
        vec!["create_shader Vertex 0x1002".to_owned()]
    );
    assert!(draws[0].contains("<arg name='vs'><ptr>0x1002</ptr></arg>"), "{}", draws[0]);
}
