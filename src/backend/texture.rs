// Textures - device images with a view, a sampler and a tracked layout
//
// A texture either owns its image and memory, or wraps an image owned by
// someone else (swapchain images). Both kinds own their view and sampler,
// and both track their layout through every transition.

use super::buffer::Buffer;
use super::command::{record_commands, Recording};
use super::error::{BackendError, BackendResult};
use super::format::Format;
use super::layout::{ImageLayout, LayoutBarrier, LayoutState};
use super::usage::TextureUsage;
use super::VulkanDevice;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::cell::RefCell;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureType {
    #[default]
    Texture2D,
    Texture2DArray,
    Texture3D,
    Cube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

impl Filter {
    pub fn to_vk(self) -> vk::Filter {
        match self {
            Self::Nearest => vk::Filter::NEAREST,
            Self::Linear => vk::Filter::LINEAR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MipmapFilter {
    #[default]
    None,
    Nearest,
    Linear,
}

impl MipmapFilter {
    pub fn to_vk(self) -> vk::SamplerMipmapMode {
        match self {
            Self::None | Self::Nearest => vk::SamplerMipmapMode::NEAREST,
            Self::Linear => vk::SamplerMipmapMode::LINEAR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    ClampToEdge,
    MirroredRepeat,
    Repeat,
}

impl WrapMode {
    pub fn to_vk(self) -> vk::SamplerAddressMode {
        match self {
            Self::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            Self::MirroredRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
            Self::Repeat => vk::SamplerAddressMode::REPEAT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureParams {
    pub texture_type: TextureType,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Array layers of a 2D array texture; cube maps always use 6
    pub layers: u32,
    /// 0 or 1 means single-sampled
    pub samples: u32,
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mipmap_filter: MipmapFilter,
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    pub wrap_r: WrapMode,
    pub usage: TextureUsage,
}

impl Default for TextureParams {
    fn default() -> Self {
        Self {
            texture_type: TextureType::Texture2D,
            format: Format::R8G8B8A8Unorm,
            width: 0,
            height: 0,
            depth: 1,
            layers: 1,
            samples: 0,
            min_filter: Filter::Nearest,
            mag_filter: Filter::Nearest,
            mipmap_filter: MipmapFilter::None,
            wrap_s: WrapMode::ClampToEdge,
            wrap_t: WrapMode::ClampToEdge,
            wrap_r: WrapMode::ClampToEdge,
            usage: TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST,
        }
    }
}

impl TextureParams {
    pub fn array_layers(&self) -> u32 {
        match self.texture_type {
            TextureType::Cube => 6,
            TextureType::Texture2DArray => self.layers.max(1),
            _ => 1,
        }
    }

    pub fn extent_depth(&self) -> u32 {
        match self.texture_type {
            TextureType::Texture3D => self.depth.max(1),
            _ => 1,
        }
    }

    pub fn mip_levels(&self) -> u32 {
        if self.mipmap_filter == MipmapFilter::None {
            return 1;
        }
        mip_level_count(self.width, self.height)
    }

    pub fn has_mipmap(&self) -> bool {
        self.mip_levels() > 1
    }

    /// Layout the texture rests in between uses.
    pub fn resting_layout(&self) -> ImageLayout {
        if self.usage.contains(TextureUsage::SAMPLED) && !self.usage.contains(TextureUsage::STORAGE)
        {
            ImageLayout::ShaderReadOnly
        } else {
            ImageLayout::General
        }
    }

    /// Row length of an upload in pixels. 0 means tightly packed rows;
    /// anything else must cover a full row.
    pub fn check_linesize(&self, linesize: u32) -> BackendResult<()> {
        if linesize != 0 && linesize < self.width {
            return Err(BackendError::invalid_usage(format!(
                "linesize {} is shorter than the texture width {}",
                linesize, self.width
            )));
        }
        Ok(())
    }

    /// Bytes needed to stage one upload with rows of `linesize` pixels.
    pub fn staging_size(&self, linesize: u32) -> usize {
        let row = if linesize > 0 { linesize } else { self.width };
        row as usize
            * self.height as usize
            * self.extent_depth() as usize
            * self.format.bytes_per_pixel()
            * self.array_layers() as usize
    }
}

/// Number of levels down to 1x1: one more than the highest set bit.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let mut levels = 1;
    while (width | height) >> levels != 0 {
        levels += 1;
    }
    levels
}

pub fn sample_count_flags(samples: u32) -> vk::SampleCountFlags {
    match samples {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        32 => vk::SampleCountFlags::TYPE_32,
        _ => vk::SampleCountFlags::TYPE_64,
    }
}

struct Staging {
    buffer: Buffer,
    linesize: u32,
}

pub struct Texture {
    device: Arc<VulkanDevice>,
    params: TextureParams,
    image: vk::Image,
    // None for wrapped images
    allocation: Option<Allocation>,
    view: vk::ImageView,
    sampler: vk::Sampler,
    layout: LayoutState,
    mip_levels: u32,
    array_layers: u32,
    external_storage: bool,
    staging: RefCell<Option<Staging>>,
}

impl Texture {
    pub fn new(device: &Arc<VulkanDevice>, params: TextureParams) -> BackendResult<Self> {
        if params.width == 0 || params.height == 0 {
            return Err(BackendError::invalid_usage("texture dimensions must be non-zero"));
        }

        let required = params.usage.required_format_features();
        if !device.supports_format(params.format, required) {
            return Err(BackendError::UnsupportedFormat(format!(
                "{:?} does not support {:?}",
                params.format, required
            )));
        }

        let mip_levels = params.mip_levels();
        let array_layers = params.array_layers();
        let flags = if params.texture_type == TextureType::Cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_type = if params.texture_type == TextureType::Texture3D {
            vk::ImageType::TYPE_3D
        } else {
            vk::ImageType::TYPE_2D
        };

        let image_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(image_type)
            .extent(vk::Extent3D {
                width: params.width,
                height: params.height,
                depth: params.extent_depth(),
            })
            .mip_levels(mip_levels)
            .array_layers(array_layers)
            .format(params.format.to_vk())
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(params.usage.to_vk())
            .samples(sample_count_flags(params.samples))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None)? };
        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name: "texture",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e.into());
            }
        };

        let bind = unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind {
            unsafe { device.device.destroy_image(image, None) };
            let _ = device.allocator().free(allocation);
            return Err(e.into());
        }

        // From here on Drop cleans up whatever was created
        let mut texture = Self {
            device: Arc::clone(device),
            params,
            image,
            allocation: Some(allocation),
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            layout: LayoutState::new(ImageLayout::Undefined),
            mip_levels,
            array_layers,
            external_storage: false,
            staging: RefCell::new(None),
        };
        texture.create_view_and_sampler()?;

        let resting = texture.params.resting_layout();
        texture.transition(None, resting)?;

        log::debug!(
            "Created {:?} texture {}x{} {:?} ({} levels, {} layers)",
            texture.params.texture_type,
            texture.params.width,
            texture.params.height,
            texture.params.format,
            mip_levels,
            array_layers
        );

        Ok(texture)
    }

    /// Adopts an image owned elsewhere. The texture owns only its view and
    /// sampler; `layout` is the layout the image is currently in.
    pub fn wrap(
        device: &Arc<VulkanDevice>,
        params: TextureParams,
        image: vk::Image,
        layout: ImageLayout,
    ) -> BackendResult<Self> {
        let mut texture = Self {
            device: Arc::clone(device),
            mip_levels: 1,
            array_layers: params.array_layers(),
            params,
            image,
            allocation: None,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            layout: LayoutState::new(layout),
            external_storage: true,
            staging: RefCell::new(None),
        };
        texture.create_view_and_sampler()?;
        Ok(texture)
    }

    fn create_view_and_sampler(&mut self) -> BackendResult<()> {
        let view_type = match self.params.texture_type {
            TextureType::Texture2D => vk::ImageViewType::TYPE_2D,
            TextureType::Texture2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
            TextureType::Texture3D => vk::ImageViewType::TYPE_3D,
            TextureType::Cube => vk::ImageViewType::CUBE,
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(self.image)
            .view_type(view_type)
            .format(self.params.format.to_vk())
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(self.subresource_range());
        self.view = unsafe { self.device.device.create_image_view(&view_info, None)? };

        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(self.params.mag_filter.to_vk())
            .min_filter(self.params.min_filter.to_vk())
            .mipmap_mode(self.params.mipmap_filter.to_vk())
            .address_mode_u(self.params.wrap_s.to_vk())
            .address_mode_v(self.params.wrap_t.to_vk())
            .address_mode_w(self.params.wrap_r.to_vk())
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .min_lod(0.0)
            .max_lod(self.mip_levels as f32);
        self.sampler = unsafe { self.device.device.create_sampler(&sampler_info, None)? };
        Ok(())
    }

    pub fn params(&self) -> &TextureParams {
        &self.params
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn format(&self) -> Format {
        self.params.format
    }

    pub fn width(&self) -> u32 {
        self.params.width
    }

    pub fn height(&self) -> u32 {
        self.params.height
    }

    pub fn samples(&self) -> u32 {
        self.params.samples
    }

    pub fn usage(&self) -> TextureUsage {
        self.params.usage
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn is_external(&self) -> bool {
        self.external_storage
    }

    pub fn layout(&self) -> ImageLayout {
        self.layout.current()
    }

    pub fn resting_layout(&self) -> ImageLayout {
        self.params.resting_layout()
    }

    pub fn subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.params.format.aspect_flags(),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    /// Records a barrier into `cmd` if the texture is not already in `target`.
    pub(crate) fn record_transition(&self, cmd: vk::CommandBuffer, target: ImageLayout) {
        if let Some(barrier) = self.layout.transition(target) {
            barrier.record(&self.device.device, cmd, self.image, self.subresource_range());
        }
    }

    /// Render passes change layouts on their own; keep the tracker in sync.
    pub(crate) fn assume_layout(&self, layout: ImageLayout) {
        self.layout.assume(layout);
    }

    /// Moves the texture to `target`, recording into the frame when one is
    /// given, otherwise through a transient command.
    pub fn transition(&self, recording: Option<&Recording>, target: ImageLayout) -> BackendResult<()> {
        if self.layout.current() == target {
            return Ok(());
        }
        record_commands(&self.device, recording, |cmd| {
            self.record_transition(cmd, target);
            Ok(())
        })
    }

    /// Uploads `data` to every layer of mip level 0. `linesize` is the row
    /// length in pixels, 0 meaning tightly packed.
    pub fn upload(&self, data: &[u8], linesize: u32) -> BackendResult<()> {
        if self.external_storage {
            return Err(BackendError::invalid_usage(
                "cannot upload to a texture with external storage",
            ));
        }
        if !self.params.usage.contains(TextureUsage::TRANSFER_DST) {
            return Err(BackendError::invalid_usage(
                "texture upload requires TRANSFER_DST usage",
            ));
        }

        self.params.check_linesize(linesize)?;
        let size = self.params.staging_size(linesize);
        if data.len() < size {
            return Err(BackendError::invalid_usage(format!(
                "upload needs {} bytes, got {}",
                size,
                data.len()
            )));
        }

        let mut staging = self.staging.borrow_mut();
        if staging.as_ref().map(|s| s.linesize) != Some(linesize) {
            *staging = None;
            *staging = Some(Staging {
                buffer: Buffer::staging(&self.device, size)?,
                linesize,
            });
        }
        let Some(staging) = staging.as_ref() else {
            return Err(BackendError::ExternalApi("staging buffer missing".into()));
        };
        staging.buffer.upload(&data[..size], 0)?;

        let layers = self.array_layers;
        let layer_size = (size / layers as usize) as vk::DeviceSize;
        let aspect = self.params.format.aspect_flags();
        let regions: Vec<vk::BufferImageCopy> = (0..layers)
            .map(|layer| vk::BufferImageCopy {
                buffer_offset: layer as vk::DeviceSize * layer_size,
                buffer_row_length: linesize,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: aspect,
                    mip_level: 0,
                    base_array_layer: layer,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: vk::Extent3D {
                    width: self.params.width,
                    height: self.params.height,
                    depth: self.params.extent_depth(),
                },
            })
            .collect();

        let previous = self.layout.current();
        let restore = if previous == ImageLayout::Undefined {
            self.params.resting_layout()
        } else {
            previous
        };

        record_commands(&self.device, None, |cmd| {
            self.record_transition(cmd, ImageLayout::TransferDst);
            unsafe {
                self.device.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer.handle(),
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &regions,
                );
            }
            self.record_transition(cmd, restore);
            Ok(())
        })?;

        if self.params.has_mipmap() {
            self.generate_mipmap(None)?;
        }
        Ok(())
    }

    /// Fills mip levels 1..N by successive linear blits from level 0.
    pub fn generate_mipmap(&self, recording: Option<&Recording>) -> BackendResult<()> {
        let needed = TextureUsage::TRANSFER_SRC | TextureUsage::TRANSFER_DST;
        if !self.params.usage.contains(needed) {
            return Err(BackendError::invalid_usage(
                "mipmap generation requires TRANSFER_SRC and TRANSFER_DST usage",
            ));
        }
        if !self
            .device
            .supports_format(self.params.format, vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            return Err(BackendError::UnsupportedFormat(format!(
                "{:?} does not support linear blits",
                self.params.format
            )));
        }
        if self.mip_levels <= 1 {
            return Ok(());
        }

        let recording = recording.and_then(Recording::transfer_target);
        record_commands(&self.device, recording, |cmd| {
            self.record_mipmap_blits(cmd);
            Ok(())
        })
    }

    fn record_mipmap_blits(&self, cmd: vk::CommandBuffer) {
        let device = &self.device.device;
        let final_layout = match self.layout.current() {
            ImageLayout::Undefined => self.params.resting_layout(),
            layout => layout,
        };
        self.record_transition(cmd, ImageLayout::TransferDst);

        let aspect = self.params.format.aspect_flags();
        let level_range = |level: u32| vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: level,
            level_count: 1,
            base_array_layer: 0,
            layer_count: self.array_layers,
        };
        let level_layers = |level: u32| vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: level,
            base_array_layer: 0,
            layer_count: self.array_layers,
        };

        let mut width = self.params.width as i32;
        let mut height = self.params.height as i32;

        for level in 1..self.mip_levels {
            LayoutBarrier::new(ImageLayout::TransferDst, ImageLayout::TransferSrc).record(
                device,
                cmd,
                self.image,
                level_range(level - 1),
            );

            let next_width = (width / 2).max(1);
            let next_height = (height / 2).max(1);
            let blit = vk::ImageBlit {
                src_subresource: level_layers(level - 1),
                src_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D { x: width, y: height, z: 1 },
                ],
                dst_subresource: level_layers(level),
                dst_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D { x: next_width, y: next_height, z: 1 },
                ],
            };
            unsafe {
                device.cmd_blit_image(
                    cmd,
                    self.image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    vk::Filter::LINEAR,
                );
            }

            LayoutBarrier::new(ImageLayout::TransferSrc, final_layout).record(
                device,
                cmd,
                self.image,
                level_range(level - 1),
            );

            width = next_width;
            height = next_height;
        }

        LayoutBarrier::new(ImageLayout::TransferDst, final_layout).record(
            device,
            cmd,
            self.image,
            level_range(self.mip_levels - 1),
        );
        self.layout.assume(final_layout);
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        self.staging.get_mut().take();
        unsafe {
            if self.sampler != vk::Sampler::null() {
                self.device.device.destroy_sampler(self.sampler, None);
            }
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
        }
        if let Some(allocation) = self.allocation.take() {
            unsafe { self.device.device.destroy_image(self.image, None) };
            if let Err(e) = self.device.allocator().free(allocation) {
                log::error!("Failed to free texture memory: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mip_level_count() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(300, 20), 9);
    }

    #[test]
    fn test_no_mipmaps_without_mipmap_filter() {
        let params = TextureParams {
            width: 64,
            height: 64,
            ..Default::default()
        };
        assert_eq!(params.mip_levels(), 1);

        let params = TextureParams {
            mipmap_filter: MipmapFilter::Linear,
            ..params
        };
        assert_eq!(params.mip_levels(), 7);
        assert!(params.has_mipmap());
    }

    #[test]
    fn test_staging_size_uses_linesize() {
        let params = TextureParams {
            width: 10,
            height: 4,
            ..Default::default()
        };
        assert_eq!(params.staging_size(0), 10 * 4 * 4);
        assert_eq!(params.staging_size(16), 16 * 4 * 4);

        let cube = TextureParams {
            texture_type: TextureType::Cube,
            ..params
        };
        assert_eq!(cube.staging_size(0), 10 * 4 * 4 * 6);
    }

    #[test]
    fn test_linesize_must_cover_a_row() {
        let params = TextureParams {
            width: 10,
            height: 4,
            ..Default::default()
        };
        assert!(params.check_linesize(0).is_ok());
        assert!(params.check_linesize(10).is_ok());
        assert!(params.check_linesize(16).is_ok());
        for short in [1, 9] {
            assert!(matches!(
                params.check_linesize(short),
                Err(BackendError::InvalidUsage(_))
            ));
        }
    }

    #[test]
    fn test_resting_layout() {
        let sampled = TextureParams::default();
        assert_eq!(sampled.resting_layout(), ImageLayout::ShaderReadOnly);

        let storage = TextureParams {
            usage: TextureUsage::SAMPLED | TextureUsage::STORAGE,
            ..Default::default()
        };
        assert_eq!(storage.resting_layout(), ImageLayout::General);

        let attachment = TextureParams {
            usage: TextureUsage::COLOR_ATTACHMENT,
            ..Default::default()
        };
        assert_eq!(attachment.resting_layout(), ImageLayout::General);
    }

    #[test]
    fn test_sample_count_flags() {
        assert_eq!(sample_count_flags(0), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count_flags(4), vk::SampleCountFlags::TYPE_4);
    }
}
