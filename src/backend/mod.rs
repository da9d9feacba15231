// Backend module - GPU abstraction layer
//
// Design: one GraphicsContext interface, one implementation per native API,
// chosen once at startup by create_context. Only Vulkan is implemented.

pub mod buffer;
pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod format;
pub mod layout;
pub mod pipeline;
pub mod program;
pub mod rendertarget;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod usage;

pub use buffer::Buffer;
pub use command::Recording;
pub use context::{CaptureBufferType, ContextConfig, VulkanContext};
pub use device::{Limits, VulkanDevice};
pub use error::{BackendError, BackendResult};
pub use format::Format;
pub use layout::ImageLayout;
pub use pipeline::{CullMode, Pipeline, PipelineParams};
pub use program::{Program, ShaderCompiler, ShaderStage};
pub use rendertarget::{Attachment, RenderTarget, RenderTargetDesc, RenderTargetParams};
pub use surface::WindowHandles;
pub use swapchain::{PresentMode, Swapchain};
pub use texture::{Texture, TextureParams};
pub use usage::{BufferUsage, TextureUsage};

use glam::Mat4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Vulkan,
    /// Reserved for a GL implementation; rejected by the factory
    Gl,
}

impl BackendKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "vulkan" | "vk" => Some(Self::Vulkan),
            "gl" | "opengl" | "gles" => Some(Self::Gl),
            _ => None,
        }
    }
}

/// Frame lifecycle and queries shared by every backend.
///
/// `begin_frame` hands out the frame value every recording call takes;
/// `end_frame` consumes it, so a frame cannot be used after submission.
pub trait GraphicsContext {
    type Frame;

    fn begin_frame(&mut self, t: f64) -> BackendResult<Self::Frame>;
    fn end_frame(&mut self, frame: Self::Frame, t: f64) -> BackendResult<()>;

    /// New surface size. `viewport` replaces the current viewport when it
    /// has a positive size, otherwise the viewport covers the new size.
    fn resize(&mut self, width: u32, height: u32, viewport: Option<[i32; 4]>) -> BackendResult<()>;

    fn set_viewport(&mut self, viewport: [i32; 4]);
    fn viewport(&self) -> [i32; 4];
    fn set_scissor(&mut self, scissor: [i32; 4]);
    fn scissor(&self) -> [i32; 4];

    fn default_rendertarget_desc(&self) -> RenderTargetDesc;
    fn preferred_depth_format(&self) -> Format;
    fn preferred_depth_stencil_format(&self) -> Format;
    fn limits(&self) -> Limits;

    fn transform_projection_matrix(&self, matrix: Mat4) -> Mat4;
    fn transform_cull_mode(&self, mode: CullMode) -> CullMode;

    fn set_capture_buffer(&mut self, buffer: Option<Vec<u8>>) -> BackendResult<()>;
    fn capture_buffer(&self) -> Option<&[u8]>;

    fn wait_idle(&self) -> BackendResult<()>;
}

/// Creates the context for `config.backend`.
pub fn create_context(config: ContextConfig) -> BackendResult<VulkanContext> {
    match config.backend {
        BackendKind::Vulkan => VulkanContext::new(config),
        BackendKind::Gl => Err(BackendError::UnsupportedFeature(
            "GL backend is not available in this build".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names() {
        assert_eq!(BackendKind::from_name("vulkan"), Some(BackendKind::Vulkan));
        assert_eq!(BackendKind::from_name("gl"), Some(BackendKind::Gl));
        assert_eq!(BackendKind::from_name("metal"), None);
    }

    #[test]
    fn test_factory_rejects_gl() {
        let config = ContextConfig {
            backend: BackendKind::Gl,
            offscreen: true,
            ..Default::default()
        };
        assert!(matches!(
            create_context(config),
            Err(BackendError::UnsupportedFeature(_))
        ));
    }
}
