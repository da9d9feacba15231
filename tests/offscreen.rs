// GPU round trips on an offscreen context. Every test returns early when
// no Vulkan device can be created.

use std::rc::Rc;
use vkgfx::backend::context::capture_buffer_size;
use vkgfx::backend::rendertarget::{LoadOp, StoreOp};
use vkgfx::backend::{
    create_context, Attachment, BackendError, ContextConfig, Format, GraphicsContext,
    RenderTarget, RenderTargetParams, Texture, TextureParams, TextureUsage, VulkanContext,
};

fn offscreen_context(samples: u32, clear_color: [f32; 4]) -> Option<VulkanContext> {
    let config = ContextConfig {
        width: 256,
        height: 256,
        samples,
        offscreen: true,
        clear_color,
        validation: false,
        // Ten seconds, so a wedged GPU fails the test instead of hanging it
        fence_timeout: 10_000_000_000,
        ..Default::default()
    };
    match create_context(config) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("skipping: no usable Vulkan device ({})", e);
            None
        }
    }
}

fn assert_all_pixels(pixels: &[u8], expected: [u8; 4]) {
    for (i, px) in pixels.chunks_exact(4).enumerate() {
        assert_eq!(px, expected, "pixel {} differs", i);
    }
}

#[test]
fn multisampled_clear_is_captured() {
    let Some(mut ctx) = offscreen_context(4, [1.0, 0.0, 0.0, 1.0]) else {
        return;
    };
    let size = capture_buffer_size(256, 256);
    ctx.set_capture_buffer(Some(vec![0; size])).unwrap();

    let frame = ctx.begin_frame(0.0).unwrap();
    ctx.end_frame(frame, 0.0).unwrap();

    let pixels = ctx.capture_buffer().unwrap();
    assert_eq!(pixels.len(), 256 * 256 * 4);
    assert_all_pixels(pixels, [255, 0, 0, 255]);
}

#[test]
fn upload_then_read_pixels_round_trips() {
    let Some(ctx) = offscreen_context(1, [0.0, 0.0, 0.0, 1.0]) else {
        return;
    };
    let (width, height) = (64u32, 32u32);
    let texture = Rc::new(
        Texture::new(
            ctx.device(),
            TextureParams {
                format: Format::R8G8B8A8Unorm,
                width,
                height,
                usage: TextureUsage::COLOR_ATTACHMENT
                    | TextureUsage::SAMPLED
                    | TextureUsage::TRANSFER_SRC
                    | TextureUsage::TRANSFER_DST,
                ..Default::default()
            },
        )
        .unwrap(),
    );

    let data: Vec<u8> = (0..width * height * 4).map(|i| (i * 7 % 251) as u8).collect();
    texture.upload(&data, 0).unwrap();

    let rt = RenderTarget::new(
        ctx.device(),
        RenderTargetParams {
            width,
            height,
            colors: vec![Attachment::new(Rc::clone(&texture)).with_ops(LoadOp::Load, StoreOp::Store)],
            depth_stencil: None,
            readable: true,
        },
    )
    .unwrap();

    let mut out = vec![0u8; data.len()];
    rt.read_pixels(&mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn read_pixels_mid_frame_sees_the_clear() {
    let Some(mut ctx) = offscreen_context(1, [0.0, 1.0, 0.0, 1.0]) else {
        return;
    };
    let mut frame = ctx.begin_frame(0.0).unwrap();
    let rt = frame.rendertarget().cloned().unwrap();

    let mut out = vec![0u8; capture_buffer_size(256, 256)];
    ctx.read_pixels(&mut frame, &rt, &mut out).unwrap();
    assert_all_pixels(&out, [0, 255, 0, 255]);
    assert!(!frame.is_pass_open());

    ctx.end_frame(frame, 0.0).unwrap();
}

#[test]
fn non_readable_target_is_rejected() {
    let Some(ctx) = offscreen_context(1, [0.0, 0.0, 0.0, 1.0]) else {
        return;
    };
    let texture = Rc::new(
        Texture::new(
            ctx.device(),
            TextureParams {
                format: Format::R8G8B8A8Unorm,
                width: 16,
                height: 16,
                usage: TextureUsage::COLOR_ATTACHMENT,
                ..Default::default()
            },
        )
        .unwrap(),
    );
    let rt = RenderTarget::new(
        ctx.device(),
        RenderTargetParams {
            width: 16,
            height: 16,
            colors: vec![Attachment::new(texture)],
            depth_stencil: None,
            readable: false,
        },
    )
    .unwrap();

    let mut out = vec![0u8; 16 * 16 * 4];
    assert!(matches!(
        rt.read_pixels(&mut out),
        Err(BackendError::InvalidUsage(_))
    ));
}

#[test]
fn frames_cycle_through_slots() {
    let Some(mut ctx) = offscreen_context(1, [0.0, 0.0, 0.0, 1.0]) else {
        return;
    };
    let slots = ctx.frames_in_flight();
    for i in 0..(slots * 3) {
        let frame = ctx.begin_frame(i as f64).unwrap();
        assert_eq!(frame.frame_index(), i % slots);
        assert_eq!(frame.serial(), i as u64);
        // A second frame cannot start while one is recording
        assert!(ctx.begin_frame(i as f64).is_err());
        ctx.end_frame(frame, i as f64).unwrap();
    }
}

#[test]
fn capture_buffer_must_fit_the_target() {
    let Some(mut ctx) = offscreen_context(1, [0.0, 0.0, 0.0, 1.0]) else {
        return;
    };
    assert!(matches!(
        ctx.set_capture_buffer(Some(vec![0; 16])),
        Err(BackendError::InvalidUsage(_))
    ));
    assert!(ctx.set_capture_buffer(None).is_ok());
    assert!(ctx.capture_buffer().is_none());
    assert!(ctx.resize(128, 128, None).is_err());
}
