// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Every image is wrapped as a texture and gets its own render target, with
// a depth buffer and, when multisampled, a color buffer that resolves into
// the swapchain image.

use super::error::{BackendError, BackendResult};
use super::format::Format;
use super::layout::ImageLayout;
use super::rendertarget::{Attachment, LoadOp, RenderTarget, RenderTargetParams, StoreOp};
use super::texture::{Texture, TextureParams};
use super::usage::TextureUsage;
use super::VulkanDevice;
use ash::extensions::khr;
use ash::vk;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentMode {
    #[default]
    Fifo,
    FifoRelaxed,
    Mailbox,
    Immediate,
}

impl PresentMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "fifo" => Some(Self::Fifo),
            "fifo_relaxed" => Some(Self::FifoRelaxed),
            "mailbox" => Some(Self::Mailbox),
            "immediate" => Some(Self::Immediate),
            _ => None,
        }
    }

    pub fn to_vk(self) -> vk::PresentModeKHR {
        match self {
            Self::Fifo => vk::PresentModeKHR::FIFO,
            Self::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
            Self::Mailbox => vk::PresentModeKHR::MAILBOX,
            Self::Immediate => vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainParams {
    pub width: u32,
    pub height: u32,
    pub samples: u32,
    pub present_mode: PresentMode,
    pub depth_format: Format,
}

/// Result of one acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

/// Picks B8G8R8A8_UNORM / sRGB non-linear when offered, otherwise the
/// first format the backend can render to. A lone UNDEFINED entry means
/// the surface has no preference.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_UNORM,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };
    match formats {
        [] => None,
        [only] if only.format == vk::Format::UNDEFINED => Some(preferred),
        _ => formats
            .iter()
            .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
            .or_else(|| {
                formats.iter().find(|f| {
                    matches!(
                        Format::from_vk(f.format),
                        Some(Format::B8G8R8A8Unorm | Format::R8G8B8A8Unorm)
                    )
                })
            })
            .copied(),
    }
}

/// Requested mode if the surface supports it, FIFO otherwise.
pub fn choose_present_mode(available: &[vk::PresentModeKHR], requested: PresentMode) -> vk::PresentModeKHR {
    let requested = requested.to_vk();
    if available.contains(&requested) {
        requested
    } else {
        vk::PresentModeKHR::FIFO
    }
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, bounded by the maximum (0 = unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Acquires an image, rebuilding the chain at most once. A pending rebuild
/// is performed first and counts as that one rebuild; going out of date
/// again afterwards is fatal.
pub fn acquire_with_rebuild<T, A, R>(
    target: &mut T,
    rebuild_pending: bool,
    mut acquire: A,
    mut rebuild: R,
) -> BackendResult<u32>
where
    A: FnMut(&mut T) -> BackendResult<AcquireOutcome>,
    R: FnMut(&mut T) -> BackendResult<()>,
{
    let mut rebuilt = false;
    if rebuild_pending {
        rebuild(target)?;
        rebuilt = true;
    }
    loop {
        match acquire(target)? {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    log::debug!("Swapchain is suboptimal");
                }
                return Ok(index);
            }
            AcquireOutcome::OutOfDate if !rebuilt => {
                log::info!("Swapchain out of date, rebuilding");
                rebuild(target)?;
                rebuilt = true;
            }
            AcquireOutcome::OutOfDate => {
                return Err(BackendError::ExternalApi(
                    "swapchain still out of date after rebuild".into(),
                ));
            }
        }
    }
}

pub struct Swapchain {
    device: Arc<VulkanDevice>,
    loader: khr::Swapchain,
    swapchain: vk::SwapchainKHR,
    format: Format,
    extent: vk::Extent2D,
    params: SwapchainParams,
    images: Vec<Rc<Texture>>,
    rendertargets: Vec<Rc<RenderTarget>>,
}

impl Swapchain {
    pub fn new(device: &Arc<VulkanDevice>, params: SwapchainParams) -> BackendResult<Self> {
        let mut swapchain = Self {
            device: Arc::clone(device),
            loader: khr::Swapchain::new(&device.instance, &device.device),
            swapchain: vk::SwapchainKHR::null(),
            format: Format::Undefined,
            extent: vk::Extent2D::default(),
            params,
            images: Vec::new(),
            rendertargets: Vec::new(),
        };
        swapchain.create()?;
        Ok(swapchain)
    }

    fn create(&mut self) -> BackendResult<()> {
        let Some(surface) = &self.device.surface else {
            return Err(BackendError::invalid_usage("swapchain needs a window surface"));
        };
        let physical_device = self.device.physical_device;

        let (caps, formats, present_modes) = unsafe {
            (
                surface
                    .loader
                    .get_physical_device_surface_capabilities(physical_device, surface.surface)?,
                surface
                    .loader
                    .get_physical_device_surface_formats(physical_device, surface.surface)?,
                surface
                    .loader
                    .get_physical_device_surface_present_modes(physical_device, surface.surface)?,
            )
        };

        let surface_format = choose_surface_format(&formats).ok_or_else(|| {
            BackendError::UnsupportedFormat("no usable surface format".into())
        })?;
        let format = Format::from_vk(surface_format.format).ok_or_else(|| {
            BackendError::UnsupportedFormat(format!("{:?}", surface_format.format))
        })?;
        let present_mode = choose_present_mode(&present_modes, self.params.present_mode);
        let extent = choose_extent(&caps, self.params.width, self.params.height);
        let image_count = choose_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{} {:?} {:?} ({} images)",
            extent.width,
            extent.height,
            format,
            present_mode,
            image_count
        );

        let queue_families = [
            self.device.graphics_queue_family,
            self.device.present_queue_family,
        ];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);
        create_info = if queue_families[0] != queue_families[1] {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        self.swapchain = unsafe { self.loader.create_swapchain(&create_info, None)? };
        self.format = format;
        self.extent = extent;

        let images = unsafe { self.loader.get_swapchain_images(self.swapchain)? };
        for image in images {
            let (texture, rendertarget) = self.create_image_target(image)?;
            self.images.push(texture);
            self.rendertargets.push(rendertarget);
        }

        log::info!("Created swapchain with {} images", self.images.len());
        Ok(())
    }

    fn create_image_target(&self, image: vk::Image) -> BackendResult<(Rc<Texture>, Rc<RenderTarget>)> {
        let device = &self.device;
        let (width, height) = (self.extent.width, self.extent.height);
        let samples = self.params.samples.max(1);

        let wrapped = Rc::new(Texture::wrap(
            device,
            TextureParams {
                format: self.format,
                width,
                height,
                usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_SRC,
                ..Default::default()
            },
            image,
            ImageLayout::Undefined,
        )?);

        let depth = Rc::new(Texture::new(
            device,
            TextureParams {
                format: self.params.depth_format,
                width,
                height,
                samples,
                usage: TextureUsage::DEPTH_STENCIL_ATTACHMENT,
                ..Default::default()
            },
        )?);

        let color = if samples > 1 {
            let ms_color = Rc::new(Texture::new(
                device,
                TextureParams {
                    format: self.format,
                    width,
                    height,
                    samples,
                    usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSIENT_ATTACHMENT,
                    ..Default::default()
                },
            )?);
            Attachment::new(ms_color).with_resolve(Rc::clone(&wrapped))
        } else {
            Attachment::new(Rc::clone(&wrapped))
        };

        let rendertarget = RenderTarget::new(
            device,
            RenderTargetParams {
                width,
                height,
                colors: vec![color.with_ops(LoadOp::Load, StoreOp::Store)],
                depth_stencil: Some(
                    Attachment::new(depth).with_ops(LoadOp::Load, StoreOp::Store),
                ),
                readable: false,
            },
        )?;

        Ok((wrapped, Rc::new(rendertarget)))
    }

    /// Frees every per-image resource and the chain itself. Safe to call
    /// more than once.
    pub fn destroy(&mut self) {
        self.rendertargets.clear();
        self.images.clear();
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { self.loader.destroy_swapchain(self.swapchain, None) };
            self.swapchain = vk::SwapchainKHR::null();
        }
    }

    /// Recreates the whole chain, optionally with a new size.
    pub fn rebuild(&mut self, size: Option<(u32, u32)>) -> BackendResult<()> {
        self.device.wait_idle()?;
        self.destroy();
        if let Some((width, height)) = size {
            self.params.width = width;
            self.params.height = height;
        }
        self.create()
    }

    pub fn acquire(&self, semaphore: vk::Semaphore, timeout: u64) -> BackendResult<AcquireOutcome> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, timeout, semaphore, vk::Fence::null())
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Err(
                BackendError::ExternalApi("timed out acquiring swapchain image".into()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Presents `index` once `wait` has signalled. Returns true when the
    /// chain should be rebuilt before the next acquisition.
    pub fn present(&self, queue: vk::Queue, index: u32, wait: &[vk::Semaphore]) -> BackendResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: usize) -> Option<&Rc<Texture>> {
        self.images.get(index)
    }

    pub fn rendertarget(&self, index: usize) -> Option<&Rc<RenderTarget>> {
        self.rendertargets.get(index)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    struct FakeChain {
        extent: (u32, u32),
        surface: (u32, u32),
        generation: u32,
        out_of_date_left: u32,
        rebuilds: u32,
        leaked: u32,
    }

    impl FakeChain {
        fn acquire(&mut self) -> BackendResult<AcquireOutcome> {
            if self.out_of_date_left > 0 || self.extent != self.surface {
                self.out_of_date_left = self.out_of_date_left.saturating_sub(1);
                return Ok(AcquireOutcome::OutOfDate);
            }
            Ok(AcquireOutcome::Acquired {
                index: self.generation,
                suboptimal: false,
            })
        }

        fn rebuild(&mut self) -> BackendResult<()> {
            // Old images go away before new ones are created
            self.leaked = 0;
            self.extent = self.surface;
            self.generation += 1;
            self.rebuilds += 1;
            Ok(())
        }
    }

    #[test]
    fn test_surface_format_preference() {
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen = choose_surface_format(&[srgb, unorm]).map(|f| f.format);
        assert_eq!(chosen, Some(vk::Format::B8G8R8A8_UNORM));

        let undefined = vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let chosen = choose_surface_format(&[undefined]).map(|f| (f.format, f.color_space));
        assert_eq!(
            chosen,
            Some((vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR))
        );
        assert!(choose_surface_format(&[srgb]).is_none());
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_present_mode_fallback() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, PresentMode::Mailbox),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, PresentMode::Immediate),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(PresentMode::from_name("fifo_relaxed"), Some(PresentMode::FifoRelaxed));
        assert_eq!(PresentMode::from_name("vsync"), None);
    }

    #[test]
    fn test_extent_and_image_count() {
        let fixed = caps((800, 600));
        assert_eq!(choose_extent(&fixed, 1920, 1080), vk::Extent2D { width: 800, height: 600 });

        let free = caps((u32::MAX, u32::MAX));
        assert_eq!(choose_extent(&free, 640, 480), vk::Extent2D { width: 640, height: 480 });
        assert_eq!(choose_extent(&free, 9000, 0), vk::Extent2D { width: 4096, height: 1 });

        assert_eq!(choose_image_count(&fixed), 3);
        let unbounded = vk::SurfaceCapabilitiesKHR {
            max_image_count: 0,
            ..fixed
        };
        assert_eq!(choose_image_count(&unbounded), 3);
        let tight = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            ..fixed
        };
        assert_eq!(choose_image_count(&tight), 3);
    }

    #[test]
    fn test_resize_rebuilds_exactly_once() {
        let mut chain = FakeChain {
            extent: (800, 600),
            surface: (800, 600),
            generation: 0,
            out_of_date_left: 0,
            rebuilds: 0,
            leaked: 3,
        };
        assert_eq!(
            acquire_with_rebuild(&mut chain, false, FakeChain::acquire, FakeChain::rebuild).unwrap(),
            0
        );

        // Surface resized without notice: first acquire goes out of date
        chain.surface = (640, 480);
        let index =
            acquire_with_rebuild(&mut chain, false, FakeChain::acquire, FakeChain::rebuild).unwrap();
        assert_eq!(index, 1);
        assert_eq!(chain.rebuilds, 1);
        assert_eq!(chain.extent, (640, 480));
        assert_eq!(chain.leaked, 0);
    }

    #[test]
    fn test_pending_rebuild_counts_as_the_retry() {
        let mut chain = FakeChain {
            extent: (800, 600),
            surface: (640, 480),
            generation: 0,
            out_of_date_left: 0,
            rebuilds: 0,
            leaked: 0,
        };
        acquire_with_rebuild(&mut chain, true, FakeChain::acquire, FakeChain::rebuild).unwrap();
        assert_eq!(chain.rebuilds, 1);

        chain.out_of_date_left = 1;
        let err = acquire_with_rebuild(&mut chain, true, FakeChain::acquire, FakeChain::rebuild);
        assert!(matches!(err, Err(BackendError::ExternalApi(_))));
        assert_eq!(chain.rebuilds, 2);
    }

    #[test]
    fn test_second_out_of_date_is_fatal() {
        let mut chain = FakeChain {
            extent: (800, 600),
            surface: (800, 600),
            generation: 0,
            out_of_date_left: 2,
            rebuilds: 0,
            leaked: 0,
        };
        let err = acquire_with_rebuild(&mut chain, false, FakeChain::acquire, FakeChain::rebuild);
        assert!(err.unwrap_err().is_fatal());
        assert_eq!(chain.rebuilds, 1);
    }
}
