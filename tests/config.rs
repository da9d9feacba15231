use vkgfx::backend::{BackendKind, PresentMode};
use vkgfx::config::Config;

#[test]
fn partial_file_keeps_defaults() {
    let config: Config = toml::from_str(
        r#"
        [graphics]
        samples = 4
        "#,
    )
    .unwrap();

    assert_eq!(config.graphics.samples, 4);
    assert_eq!(config.graphics.max_frames_in_flight, 2);
    assert_eq!(config.window.width, 1280);
    assert!(config.debug.validation_layers);
}

#[test]
fn offscreen_uses_graphics_size() {
    let config: Config = toml::from_str(
        r#"
        [window]
        width = 800
        height = 600

        [graphics]
        offscreen = true
        width = 256
        height = 256
        clear_color = [1.0, 0.0, 0.0, 1.0]
        scissor = [0, 0, 128, 128]

        [debug]
        debug_capture = true
        fence_timeout_ms = 5000
        "#,
    )
    .unwrap();

    let ctx = config.context_config().unwrap();
    assert!(ctx.offscreen);
    assert_eq!((ctx.width, ctx.height), (256, 256));
    assert_eq!(ctx.clear_color, [1.0, 0.0, 0.0, 1.0]);
    assert_eq!(ctx.viewport, None);
    assert_eq!(ctx.scissor, Some([0, 0, 128, 128]));
    assert!(ctx.debug_capture);
    assert_eq!(ctx.fence_timeout, 5_000_000_000);
    assert!(ctx.window.is_none());
}

#[test]
fn onscreen_uses_window_size() {
    let config: Config = toml::from_str(
        r#"
        [window]
        width = 800
        height = 600

        [graphics]
        present_mode = "mailbox"
        "#,
    )
    .unwrap();

    let ctx = config.context_config().unwrap();
    assert!(!ctx.offscreen);
    assert_eq!((ctx.width, ctx.height), (800, 600));
    assert_eq!(ctx.present_mode, PresentMode::Mailbox);
    assert_eq!(ctx.backend, BackendKind::Vulkan);
}

#[test]
fn gl_backend_parses_but_unknown_is_rejected() {
    let config: Config = toml::from_str("[graphics]\nbackend = \"gl\"\n").unwrap();
    assert_eq!(config.context_config().unwrap().backend, BackendKind::Gl);

    let config: Config = toml::from_str("[graphics]\nbackend = \"d3d12\"\n").unwrap();
    assert!(config.context_config().is_err());
}

#[test]
fn unsupported_capture_type_is_rejected() {
    let config: Config =
        toml::from_str("[graphics]\ncapture_buffer_type = \"corevideo\"\n").unwrap();
    assert!(config.context_config().is_err());
}

#[test]
fn bad_toml_is_an_error() {
    assert!(toml::from_str::<Config>("[graphics]\nsamples = \"four\"\n").is_err());
}
