// Vulkan graphics context
//
// Owns the device, the frame slots and either a swapchain (onscreen) or a
// ring of readable render targets (offscreen). Drives the per-frame
// lifecycle: wait slot fence -> acquire -> record -> submit -> present.

use super::command::Recording;
use super::device::{DeviceOptions, Limits};
use super::error::{BackendError, BackendResult};
use super::format::Format;
use super::layout::ImageLayout;
use super::pipeline::CullMode;
use super::rendertarget::{
    Attachment, AttachmentDesc, LoadOp, RenderTarget, RenderTargetDesc, RenderTargetParams,
    StoreOp,
};
use super::surface::WindowHandles;
use super::swapchain::{acquire_with_rebuild, PresentMode, Swapchain, SwapchainParams};
use super::sync::{next_frame_index, FrameSlot};
use super::texture::{Texture, TextureParams};
use super::usage::TextureUsage;
use super::{BackendKind, GraphicsContext, VulkanDevice};
use ash::vk;
use glam::Mat4;
use std::rc::Rc;
use std::sync::Arc;

const OFFSCREEN_COLOR_FORMAT: Format = Format::R8G8B8A8Unorm;
const ONSCREEN_COLOR_FORMAT: Format = Format::B8G8R8A8Unorm;

// Clip space fix-up: flip Y, remap depth from -1..1 to 0..1
const VULKAN_CLIP: Mat4 = Mat4::from_cols_array(&[
    1.0, 0.0, 0.0, 0.0, //
    0.0, -1.0, 0.0, 0.0, //
    0.0, 0.0, 0.5, 0.0, //
    0.0, 0.0, 0.5, 1.0,
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureBufferType {
    #[default]
    Cpu,
}

impl CaptureBufferType {
    pub fn from_name(name: &str) -> BackendResult<Self> {
        match name {
            "cpu" => Ok(Self::Cpu),
            other => Err(BackendError::UnsupportedFeature(format!(
                "capture buffer type '{}'",
                other
            ))),
        }
    }
}

/// Init-time configuration, read-only once the context exists.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub backend: BackendKind,
    pub width: u32,
    pub height: u32,
    /// 0 or 1 means single-sampled
    pub samples: u32,
    pub offscreen: bool,
    pub clear_color: [f32; 4],
    /// Defaults to the full surface
    pub viewport: Option<[i32; 4]>,
    pub scissor: Option<[i32; 4]>,
    pub max_frames_in_flight: usize,
    pub present_mode: PresentMode,
    pub capture_buffer_type: CaptureBufferType,
    pub debug_capture: bool,
    pub validation: bool,
    /// Nanoseconds; u64::MAX waits forever
    pub fence_timeout: u64,
    pub window: Option<WindowHandles>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Vulkan,
            width: 1280,
            height: 720,
            samples: 0,
            offscreen: false,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            viewport: None,
            scissor: None,
            max_frames_in_flight: 2,
            present_mode: PresentMode::Fifo,
            capture_buffer_type: CaptureBufferType::Cpu,
            debug_capture: false,
            validation: cfg!(debug_assertions),
            fence_timeout: u64::MAX,
            window: None,
        }
    }
}

/// Minimum capture buffer size for a `width` x `height` RGBA8 target.
pub fn capture_buffer_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

pub fn transform_projection_matrix(matrix: Mat4) -> Mat4 {
    VULKAN_CLIP * matrix
}

/// The Y flip of the projection reverses winding, so front and back swap.
pub fn transform_cull_mode(mode: CullMode) -> CullMode {
    match mode {
        CullMode::None => CullMode::None,
        CullMode::Front => CullMode::Back,
        CullMode::Back => CullMode::Front,
    }
}

pub fn default_rendertarget_desc(offscreen: bool, samples: u32, depth_stencil: Format) -> RenderTargetDesc {
    let samples = samples.max(1);
    let format = if offscreen {
        OFFSCREEN_COLOR_FORMAT
    } else {
        ONSCREEN_COLOR_FORMAT
    };
    RenderTargetDesc {
        samples,
        colors: vec![AttachmentDesc {
            format,
            resolve: samples > 1,
        }],
        depth_stencil: Some(AttachmentDesc {
            format: depth_stencil,
            resolve: false,
        }),
    }
}

pub struct VulkanContext {
    config: ContextConfig,
    device: Arc<VulkanDevice>,
    command_pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    frame_index: usize,
    serial: u64,
    frame_active: bool,

    swapchain: Option<Swapchain>,
    image_index: u32,
    rebuild_pending: bool,
    offscreen_rts: Vec<Rc<RenderTarget>>,

    width: u32,
    height: u32,
    viewport: [i32; 4],
    scissor: [i32; 4],
    capture_buffer: Option<Vec<u8>>,
}

impl VulkanContext {
    pub fn new(config: ContextConfig) -> BackendResult<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(BackendError::invalid_usage("context size must be non-zero"));
        }
        if config.max_frames_in_flight == 0 {
            return Err(BackendError::invalid_usage("at least one frame in flight is required"));
        }
        let window = if config.offscreen {
            None
        } else {
            Some(config.window.ok_or_else(|| {
                BackendError::invalid_usage("onscreen context needs a window handle")
            })?)
        };

        log::info!(
            "Creating {} context {}x{} ({} samples, {} frames in flight)",
            if config.offscreen { "offscreen" } else { "onscreen" },
            config.width,
            config.height,
            config.samples.max(1),
            config.max_frames_in_flight
        );
        if config.debug_capture {
            log::info!("Debug capture enabled");
        }

        let device = VulkanDevice::new(&DeviceOptions {
            app_name: "vkgfx".to_string(),
            enable_validation: config.validation,
            window,
            fence_timeout: config.fence_timeout,
        })?;

        let samples = config.samples.max(1);
        if samples > device.limits.max_samples {
            return Err(BackendError::UnsupportedFeature(format!(
                "{} samples (device supports up to {})",
                samples, device.limits.max_samples
            )));
        }

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None)? };

        let viewport = config
            .viewport
            .unwrap_or([0, 0, config.width as i32, config.height as i32]);
        let scissor = config
            .scissor
            .unwrap_or([0, 0, config.width as i32, config.height as i32]);

        let mut context = Self {
            width: config.width,
            height: config.height,
            config,
            device,
            command_pool,
            slots: Vec::new(),
            frame_index: 0,
            serial: 0,
            frame_active: false,
            swapchain: None,
            image_index: 0,
            rebuild_pending: false,
            offscreen_rts: Vec::new(),
            viewport,
            scissor,
            capture_buffer: None,
        };
        // From here on Drop cleans up whatever was created
        context.create_frame_slots()?;
        if context.config.offscreen {
            context.create_offscreen_rts()?;
        } else {
            context.swapchain = Some(Swapchain::new(
                &context.device,
                SwapchainParams {
                    width: context.width,
                    height: context.height,
                    samples,
                    present_mode: context.config.present_mode,
                    depth_format: context.device.preferred_depth_stencil_format(),
                },
            )?);
        }

        log::info!("Context ready");
        Ok(context)
    }

    fn create_frame_slots(&mut self) -> BackendResult<()> {
        let count = self.config.max_frames_in_flight;
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);
        let command_buffers = unsafe { self.device.device.allocate_command_buffers(&alloc_info)? };

        for cmd in command_buffers {
            self.slots.push(FrameSlot::new(&self.device.device, cmd)?);
        }
        log::debug!("Created {} frame slots", self.slots.len());
        Ok(())
    }

    fn create_offscreen_rts(&mut self) -> BackendResult<()> {
        let samples = self.config.samples.max(1);
        let depth_format = self.device.preferred_depth_stencil_format();

        for _ in 0..self.config.max_frames_in_flight {
            let color_usage = if samples > 1 {
                TextureUsage::COLOR_ATTACHMENT
            } else {
                TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC
            };
            let color = Rc::new(Texture::new(
                &self.device,
                TextureParams {
                    format: OFFSCREEN_COLOR_FORMAT,
                    width: self.width,
                    height: self.height,
                    samples,
                    usage: color_usage,
                    ..Default::default()
                },
            )?);
            let mut color = Attachment::new(color).with_ops(LoadOp::Load, StoreOp::Store);
            if samples > 1 {
                let resolve = Rc::new(Texture::new(
                    &self.device,
                    TextureParams {
                        format: OFFSCREEN_COLOR_FORMAT,
                        width: self.width,
                        height: self.height,
                        usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC,
                        ..Default::default()
                    },
                )?);
                color = color.with_resolve(resolve);
            }

            let depth = Rc::new(Texture::new(
                &self.device,
                TextureParams {
                    format: depth_format,
                    width: self.width,
                    height: self.height,
                    samples,
                    usage: TextureUsage::DEPTH_STENCIL_ATTACHMENT,
                    ..Default::default()
                },
            )?);

            let rt = RenderTarget::new(
                &self.device,
                RenderTargetParams {
                    width: self.width,
                    height: self.height,
                    colors: vec![color],
                    depth_stencil: Some(Attachment::new(depth).with_ops(LoadOp::Load, StoreOp::Store)),
                    readable: true,
                },
            )?;
            self.offscreen_rts.push(Rc::new(rt));
        }
        Ok(())
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Slot the next `begin_frame` records into.
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    pub fn debug_capture(&self) -> bool {
        self.config.debug_capture
    }

    pub fn begin_transient_command(&self) -> BackendResult<vk::CommandBuffer> {
        self.device.begin_transient_command()
    }

    pub fn execute_transient_command(&self, cmd: vk::CommandBuffer) -> BackendResult<()> {
        self.device.execute_transient_command(cmd)
    }

    /// Render target the frame starts with: the acquired swapchain image's
    /// or the current slot's offscreen target.
    fn frame_rendertarget(&self) -> BackendResult<Rc<RenderTarget>> {
        let rt = match &self.swapchain {
            Some(swapchain) => swapchain.rendertarget(self.image_index as usize),
            None => self.offscreen_rts.get(self.frame_index),
        };
        rt.cloned()
            .ok_or_else(|| BackendError::ExternalApi("missing default render target".into()))
    }

    fn check_recording(&self, rec: &Recording) -> BackendResult<()> {
        if !self.frame_active || rec.frame_index != self.frame_index {
            return Err(BackendError::invalid_usage(
                "recording does not belong to the current frame",
            ));
        }
        Ok(())
    }

    /// Reads `rt` back in the middle of a frame. The work recorded so far is
    /// submitted and waited on, then recording resumes on the same slot with
    /// no render pass active.
    pub fn read_pixels(
        &mut self,
        rec: &mut Recording,
        rt: &RenderTarget,
        out: &mut [u8],
    ) -> BackendResult<()> {
        self.check_recording(rec)?;
        rt.check_readable()?;

        rec.end_render_pass();
        rt.record_readback(rec.command_buffer)?;

        let device = &self.device;
        let slot = &mut self.slots[self.frame_index];
        slot.submit(&device.device, device.graphics_queue, false)?;
        slot.wait(&device.device, device.fence_timeout)?;
        let result = rt.fetch_readback(out);
        slot.begin(&device.device)?;
        result
    }

    /// Ends the pass, submits the slot and presents, or captures when
    /// `capture` is set and a capture buffer exists. Advancing the ring is
    /// left to the caller.
    fn submit_frame(&mut self, mut rec: Recording, capture: bool) -> BackendResult<()> {
        rec.end_render_pass();
        self.frame_active = false;

        let device = &self.device;
        let slot = &mut self.slots[self.frame_index];
        match &self.swapchain {
            Some(swapchain) => {
                let image = swapchain.image(self.image_index as usize).ok_or_else(|| {
                    BackendError::ExternalApi("acquired image is gone".into())
                })?;
                image.record_transition(rec.command_buffer, ImageLayout::Present);
                slot.submit(&device.device, device.graphics_queue, true)?;
                let wait = [slot.render_finished];
                if swapchain.present(device.present_queue, self.image_index, &wait)? {
                    self.rebuild_pending = true;
                }
            }
            None => {
                let readback = match (capture, self.capture_buffer.as_mut()) {
                    (true, Some(buffer)) => {
                        let rt = self.offscreen_rts.get(self.frame_index).ok_or_else(|| {
                            BackendError::ExternalApi("missing offscreen target".into())
                        })?;
                        rt.record_readback(rec.command_buffer)?;
                        Some((rt, buffer))
                    }
                    _ => None,
                };
                slot.submit(&device.device, device.graphics_queue, false)?;
                if let Some((rt, buffer)) = readback {
                    slot.wait(&device.device, device.fence_timeout)?;
                    rt.fetch_readback(buffer)?;
                }
            }
        }
        Ok(())
    }
}

impl GraphicsContext for VulkanContext {
    type Frame = Recording;

    fn begin_frame(&mut self, t: f64) -> BackendResult<Recording> {
        if self.frame_active {
            return Err(BackendError::invalid_usage("a frame is already being recorded"));
        }
        log::trace!("Begin frame {} (t={:.3})", self.serial, t);

        let device = &self.device;
        let timeout = device.fence_timeout;
        let slot = &mut self.slots[self.frame_index];
        slot.wait(&device.device, timeout)?;
        slot.clear_lists();

        if let Some(swapchain) = self.swapchain.as_mut() {
            let semaphore = slot.image_available;
            let size = (self.width, self.height);
            let pending = std::mem::take(&mut self.rebuild_pending);
            self.image_index = acquire_with_rebuild(
                swapchain,
                pending,
                |sc| sc.acquire(semaphore, timeout),
                |sc| sc.rebuild(Some(size)),
            )?;
            let extent = swapchain.extent();
            self.width = extent.width;
            self.height = extent.height;

            slot.wait_semaphores.push(semaphore);
            slot.wait_stages
                .push(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
            slot.signal_semaphores.push(slot.render_finished);
        }

        slot.begin(&device.device)?;
        let mut rec = Recording {
            device: Arc::clone(device),
            command_buffer: slot.command_buffer,
            frame_index: self.frame_index,
            serial: self.serial,
            rendertarget: None,
            pass_open: false,
            viewport: self.viewport,
            scissor: self.scissor,
        };
        self.frame_active = true;

        let started = self.frame_rendertarget().and_then(|rt| {
            rec.begin_render_pass(&rt)?;
            rt.clear(rec.command_buffer, self.config.clear_color);
            Ok(())
        });
        if let Err(e) = started {
            // Flush the empty frame so the slot and any acquired image are released
            if let Err(flush) = self.submit_frame(rec, false) {
                log::warn!("Failed to flush abandoned frame: {}", flush);
            }
            return Err(e);
        }
        Ok(rec)
    }

    fn end_frame(&mut self, rec: Recording, t: f64) -> BackendResult<()> {
        self.check_recording(&rec)?;
        self.submit_frame(rec, true)?;

        log::trace!("End frame {} (t={:.3})", self.serial, t);
        self.frame_index = next_frame_index(self.frame_index, self.slots.len());
        self.serial += 1;
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32, viewport: Option<[i32; 4]>) -> BackendResult<()> {
        if self.config.offscreen {
            return Err(BackendError::invalid_usage("offscreen contexts cannot be resized"));
        }
        if width == 0 || height == 0 {
            return Err(BackendError::invalid_usage("context size must be non-zero"));
        }
        log::debug!("Resize to {}x{}", width, height);

        self.width = width;
        self.height = height;
        self.rebuild_pending = true;
        self.viewport = match viewport {
            Some(v) if v[2] > 0 && v[3] > 0 => v,
            _ => [0, 0, width as i32, height as i32],
        };
        self.scissor = [0, 0, width as i32, height as i32];
        Ok(())
    }

    fn set_viewport(&mut self, viewport: [i32; 4]) {
        self.viewport = viewport;
    }

    fn viewport(&self) -> [i32; 4] {
        self.viewport
    }

    fn set_scissor(&mut self, scissor: [i32; 4]) {
        self.scissor = scissor;
    }

    fn scissor(&self) -> [i32; 4] {
        self.scissor
    }

    fn default_rendertarget_desc(&self) -> RenderTargetDesc {
        let live = match &self.swapchain {
            Some(swapchain) => swapchain.rendertarget(0),
            None => self.offscreen_rts.first(),
        };
        match live {
            Some(rt) => rt.desc().clone(),
            None => default_rendertarget_desc(
                self.config.offscreen,
                self.config.samples,
                self.device.preferred_depth_stencil_format(),
            ),
        }
    }

    fn preferred_depth_format(&self) -> Format {
        self.device.preferred_depth_format()
    }

    fn preferred_depth_stencil_format(&self) -> Format {
        self.device.preferred_depth_stencil_format()
    }

    fn limits(&self) -> Limits {
        self.device.limits
    }

    fn transform_projection_matrix(&self, matrix: Mat4) -> Mat4 {
        transform_projection_matrix(matrix)
    }

    fn transform_cull_mode(&self, mode: CullMode) -> CullMode {
        transform_cull_mode(mode)
    }

    fn set_capture_buffer(&mut self, buffer: Option<Vec<u8>>) -> BackendResult<()> {
        if let Some(buffer) = &buffer {
            if !self.config.offscreen {
                return Err(BackendError::invalid_usage(
                    "capture buffers are only supported offscreen",
                ));
            }
            let needed = capture_buffer_size(self.width, self.height);
            if buffer.len() < needed {
                return Err(BackendError::invalid_usage(format!(
                    "capture buffer needs {} bytes, got {}",
                    needed,
                    buffer.len()
                )));
            }
        }
        self.capture_buffer = buffer;
        Ok(())
    }

    fn capture_buffer(&self) -> Option<&[u8]> {
        self.capture_buffer.as_deref()
    }

    fn wait_idle(&self) -> BackendResult<()> {
        self.device.wait_idle()
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.offscreen_rts.clear();
        self.swapchain = None;
        for slot in &self.slots {
            slot.destroy(&self.device.device);
        }
        self.slots.clear();
        unsafe { self.device.device.destroy_command_pool(self.command_pool, None) };
        log::info!("Context destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sync::SlotState;
    use glam::Vec4;

    #[test]
    fn test_projection_flips_y_and_remaps_depth() {
        let m = transform_projection_matrix(Mat4::IDENTITY);
        let near = m * Vec4::new(0.5, 0.5, -1.0, 1.0);
        let far = m * Vec4::new(0.5, 0.5, 1.0, 1.0);
        assert_eq!(near, Vec4::new(0.5, -0.5, 0.0, 1.0));
        assert_eq!(far, Vec4::new(0.5, -0.5, 1.0, 1.0));
    }

    #[test]
    fn test_cull_mode_swaps_faces() {
        assert_eq!(transform_cull_mode(CullMode::Front), CullMode::Back);
        assert_eq!(transform_cull_mode(CullMode::Back), CullMode::Front);
        assert_eq!(transform_cull_mode(CullMode::None), CullMode::None);
    }

    #[test]
    fn test_default_rendertarget_desc() {
        let desc = default_rendertarget_desc(true, 4, Format::D24UnormS8Uint);
        assert_eq!(desc.samples, 4);
        assert_eq!(desc.colors.len(), 1);
        assert_eq!(desc.colors[0].format, Format::R8G8B8A8Unorm);
        assert!(desc.colors[0].resolve);
        assert_eq!(
            desc.depth_stencil.map(|d| d.format),
            Some(Format::D24UnormS8Uint)
        );

        let desc = default_rendertarget_desc(false, 0, Format::D32SfloatS8Uint);
        assert_eq!(desc.samples, 1);
        assert_eq!(desc.colors[0].format, Format::B8G8R8A8Unorm);
        assert!(!desc.colors[0].resolve);
    }

    #[test]
    fn test_capture_buffer_type() {
        assert_eq!(CaptureBufferType::from_name("cpu"), Ok(CaptureBufferType::Cpu));
        assert!(matches!(
            CaptureBufferType::from_name("corevideo"),
            Err(BackendError::UnsupportedFeature(_))
        ));
        assert_eq!(capture_buffer_size(256, 256), 262_144);
    }

    #[test]
    fn test_failed_begin_releases_the_frame() {
        let config = ContextConfig {
            width: 64,
            height: 64,
            offscreen: true,
            validation: false,
            fence_timeout: 10_000_000_000,
            ..Default::default()
        };
        let Ok(mut ctx) = VulkanContext::new(config) else {
            eprintln!("skipping: no usable Vulkan device");
            return;
        };

        let targets = std::mem::take(&mut ctx.offscreen_rts);
        assert!(matches!(ctx.begin_frame(0.0), Err(BackendError::ExternalApi(_))));
        assert!(!ctx.frame_active);
        assert_eq!(ctx.slots[0].state, SlotState::Submitted);
        assert_eq!(ctx.frame_index, 0);

        ctx.offscreen_rts = targets;
        let frame = ctx.begin_frame(1.0).unwrap();
        assert_eq!(frame.frame_index(), 0);
        assert_eq!(frame.serial(), 0);
        ctx.end_frame(frame, 1.0).unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = ContextConfig::default();
        assert_eq!(config.backend, BackendKind::Vulkan);
        assert_eq!(config.max_frames_in_flight, 2);
        assert_eq!(config.fence_timeout, u64::MAX);
        assert!(config.window.is_none());
    }
}
