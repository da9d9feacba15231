// Render targets and render-pass compatibility
//
// A RenderTargetDesc is the compatibility key: attachment formats, sample
// count and resolve flags, no live handles. Render passes are created once
// per key and cached on the device; pipelines and render targets with equal
// descriptors share them.

use super::buffer::Buffer;
use super::error::{BackendError, BackendResult};
use super::format::Format;
use super::layout::ImageLayout;
use super::texture::{sample_count_flags, Texture};
use super::VulkanDevice;
use ash::vk;
use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadOp {
    Load,
    Clear,
    #[default]
    DontCare,
}

impl LoadOp {
    pub fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            Self::Load => vk::AttachmentLoadOp::LOAD,
            Self::Clear => vk::AttachmentLoadOp::CLEAR,
            Self::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StoreOp {
    #[default]
    Store,
    DontCare,
}

impl StoreOp {
    pub fn to_vk(self) -> vk::AttachmentStoreOp {
        match self {
            Self::Store => vk::AttachmentStoreOp::STORE,
            Self::DontCare => vk::AttachmentStoreOp::DONT_CARE,
        }
    }
}

/// One attachment slot of a compatibility descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDesc {
    pub format: Format,
    pub resolve: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RenderTargetDesc {
    /// Shared by every attachment; 0 or 1 means single-sampled
    pub samples: u32,
    pub colors: Vec<AttachmentDesc>,
    pub depth_stencil: Option<AttachmentDesc>,
}

/// Render pass cache key: the descriptor plus the load/store behavior.
/// Passes differing only in ops are compatible with the same pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    pub desc: RenderTargetDesc,
    pub color_ops: Vec<(LoadOp, StoreOp)>,
    pub depth_stencil_ops: (LoadOp, StoreOp),
}

impl RenderPassKey {
    /// Key used by pipelines, which only care about compatibility.
    pub fn compatible(desc: &RenderTargetDesc) -> Self {
        Self {
            desc: desc.clone(),
            color_ops: vec![(LoadOp::DontCare, StoreOp::DontCare); desc.colors.len()],
            depth_stencil_ops: (LoadOp::DontCare, StoreOp::DontCare),
        }
    }

    /// Same key with every load op forced to LOAD.
    pub fn resumed(&self) -> Self {
        Self {
            desc: self.desc.clone(),
            color_ops: self
                .color_ops
                .iter()
                .map(|&(_, store)| (LoadOp::Load, store))
                .collect(),
            depth_stencil_ops: (LoadOp::Load, self.depth_stencil_ops.1),
        }
    }
}

/// Create-once cache keyed by value.
pub struct KeyedCache<K, V> {
    entries: HashMap<K, V>,
}

impl<K, V> Default for KeyedCache<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq + Clone, V: Copy> KeyedCache<K, V> {
    pub fn get_or_create<F>(&mut self, key: &K, create: F) -> BackendResult<V>
    where
        F: FnOnce(&K) -> BackendResult<V>,
    {
        if let Some(value) = self.entries.get(key) {
            return Ok(*value);
        }
        let value = create(key)?;
        self.entries.insert(key.clone(), value);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type RenderPassCache = KeyedCache<RenderPassKey, vk::RenderPass>;

impl RenderPassCache {
    pub fn destroy(&mut self, device: &ash::Device) {
        for (_, render_pass) in self.entries.drain() {
            unsafe { device.destroy_render_pass(render_pass, None) };
        }
    }
}

/// Looks up the render pass for `key`, creating it on first use.
pub fn render_pass_for(device: &VulkanDevice, key: &RenderPassKey) -> BackendResult<vk::RenderPass> {
    device
        .render_passes()
        .get_or_create(key, |key| create_render_pass(device, key))
}

/// Checks that every attachment format of `desc` can be rendered to.
pub fn check_desc_formats(device: &VulkanDevice, desc: &RenderTargetDesc) -> BackendResult<()> {
    for color in &desc.colors {
        if !device.supports_format(color.format, vk::FormatFeatureFlags::COLOR_ATTACHMENT) {
            return Err(BackendError::UnsupportedFormat(format!(
                "{:?} cannot be used as a color attachment",
                color.format
            )));
        }
    }
    if let Some(depth) = &desc.depth_stencil {
        if !device.supports_format(depth.format, vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT) {
            return Err(BackendError::UnsupportedFormat(format!(
                "{:?} cannot be used as a depth/stencil attachment",
                depth.format
            )));
        }
        if depth.resolve {
            return Err(BackendError::UnsupportedFeature(
                "depth/stencil resolve".into(),
            ));
        }
    }
    Ok(())
}

/// Attachment description list in framebuffer order: each color followed
/// by its resolve target, then depth/stencil.
fn attachment_descriptions(key: &RenderPassKey) -> Vec<vk::AttachmentDescription> {
    let samples = sample_count_flags(key.desc.samples);
    let mut descs = Vec::new();

    for (color, &(load, store)) in key.desc.colors.iter().zip(&key.color_ops) {
        descs.push(vk::AttachmentDescription {
            format: color.format.to_vk(),
            samples,
            load_op: load.to_vk(),
            store_op: store.to_vk(),
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ..Default::default()
        });
        if color.resolve {
            descs.push(vk::AttachmentDescription {
                format: color.format.to_vk(),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: vk::AttachmentLoadOp::DONT_CARE,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                ..Default::default()
            });
        }
    }

    if let Some(depth) = &key.desc.depth_stencil {
        let (load, store) = key.depth_stencil_ops;
        descs.push(vk::AttachmentDescription {
            format: depth.format.to_vk(),
            samples,
            load_op: load.to_vk(),
            store_op: store.to_vk(),
            stencil_load_op: load.to_vk(),
            stencil_store_op: store.to_vk(),
            initial_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        });
    }

    descs
}

fn create_render_pass(device: &VulkanDevice, key: &RenderPassKey) -> BackendResult<vk::RenderPass> {
    check_desc_formats(device, &key.desc)?;

    let descs = attachment_descriptions(key);

    let mut color_refs = Vec::new();
    let mut resolve_refs = Vec::new();
    let mut index = 0;
    for color in &key.desc.colors {
        color_refs.push(vk::AttachmentReference {
            attachment: index,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        });
        index += 1;
        if color.resolve {
            resolve_refs.push(vk::AttachmentReference {
                attachment: index,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            });
            index += 1;
        } else {
            resolve_refs.push(vk::AttachmentReference {
                attachment: vk::ATTACHMENT_UNUSED,
                layout: vk::ImageLayout::UNDEFINED,
            });
        }
    }
    let depth_ref = vk::AttachmentReference {
        attachment: index,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };

    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if key.desc.colors.iter().any(|c| c.resolve) {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }
    if key.desc.depth_stencil.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }
    let subpasses = [subpass.build()];

    let dependencies = [
        vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::MEMORY_READ)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .build(),
        vk::SubpassDependency::builder()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::BOTTOM_OF_PIPE)
            .src_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .dst_access_mask(vk::AccessFlags::MEMORY_READ)
            .dependency_flags(vk::DependencyFlags::BY_REGION)
            .build(),
    ];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&descs)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { device.device.create_render_pass(&render_pass_info, None)? };
    log::debug!("Created render pass for {:?}", key);
    Ok(render_pass)
}

/// A texture bound to a render target slot.
#[derive(Clone)]
pub struct Attachment {
    pub texture: Rc<Texture>,
    pub layer: u32,
    pub resolve_target: Option<Rc<Texture>>,
    pub resolve_layer: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: [f32; 4],
}

impl Attachment {
    pub fn new(texture: Rc<Texture>) -> Self {
        Self {
            texture,
            layer: 0,
            resolve_target: None,
            resolve_layer: 0,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            clear_value: [0.0; 4],
        }
    }

    pub fn with_resolve(mut self, target: Rc<Texture>) -> Self {
        self.resolve_target = Some(target);
        self
    }

    pub fn with_ops(mut self, load_op: LoadOp, store_op: StoreOp) -> Self {
        self.load_op = load_op;
        self.store_op = store_op;
        self
    }

    pub fn with_clear_value(mut self, clear_value: [f32; 4]) -> Self {
        self.clear_value = clear_value;
        self
    }
}

#[derive(Clone, Default)]
pub struct RenderTargetParams {
    pub width: u32,
    pub height: u32,
    pub colors: Vec<Attachment>,
    pub depth_stencil: Option<Attachment>,
    /// Allocate a staging buffer for read_pixels
    pub readable: bool,
}

impl RenderTargetParams {
    /// Derives the compatibility descriptor, checking that attachments
    /// agree on size and sample count.
    pub fn desc(&self) -> BackendResult<RenderTargetDesc> {
        let mut samples: Option<u32> = None;
        let all = self.colors.iter().chain(self.depth_stencil.iter());
        for attachment in all {
            let texture = &attachment.texture;
            if texture.width() < self.width || texture.height() < self.height {
                return Err(BackendError::invalid_usage(format!(
                    "attachment {}x{} is smaller than render target {}x{}",
                    texture.width(),
                    texture.height(),
                    self.width,
                    self.height
                )));
            }
            let texture_samples = texture.samples().max(1);
            match samples {
                Some(s) if s != texture_samples => {
                    return Err(BackendError::invalid_usage(format!(
                        "attachments disagree on sample count ({} vs {})",
                        s, texture_samples
                    )));
                }
                _ => samples = Some(texture_samples),
            }
        }

        let slot = |a: &Attachment| AttachmentDesc {
            format: a.texture.format(),
            resolve: a.resolve_target.is_some(),
        };
        Ok(RenderTargetDesc {
            samples: samples.unwrap_or(1),
            colors: self.colors.iter().map(slot).collect(),
            depth_stencil: self.depth_stencil.as_ref().map(slot),
        })
    }

    fn pass_key(&self, desc: RenderTargetDesc) -> RenderPassKey {
        RenderPassKey {
            desc,
            color_ops: self.colors.iter().map(|a| (a.load_op, a.store_op)).collect(),
            depth_stencil_ops: self
                .depth_stencil
                .as_ref()
                .map(|a| (a.load_op, a.store_op))
                .unwrap_or_default(),
        }
    }
}

pub struct RenderTarget {
    device: Arc<VulkanDevice>,
    width: u32,
    height: u32,
    desc: RenderTargetDesc,
    colors: Vec<Attachment>,
    depth_stencil: Option<Attachment>,
    // Owned by the device's render pass cache
    render_pass: vk::RenderPass,
    resume_render_pass: vk::RenderPass,
    framebuffer: vk::Framebuffer,
    views: Vec<vk::ImageView>,
    clear_values: Vec<vk::ClearValue>,
    readback: Option<Buffer>,
}

impl RenderTarget {
    pub fn new(device: &Arc<VulkanDevice>, params: RenderTargetParams) -> BackendResult<Self> {
        if params.colors.is_empty() && params.depth_stencil.is_none() {
            return Err(BackendError::invalid_usage("render target has no attachments"));
        }
        if params.colors.len() as u32 > device.limits.max_color_attachments {
            return Err(BackendError::UnsupportedFeature(format!(
                "{} color attachments (max {})",
                params.colors.len(),
                device.limits.max_color_attachments
            )));
        }

        let desc = params.desc()?;
        check_desc_formats(device, &desc)?;
        let key = params.pass_key(desc.clone());
        let render_pass = render_pass_for(device, &key)?;
        let resume_render_pass = render_pass_for(device, &key.resumed())?;

        let mut rt = Self {
            device: Arc::clone(device),
            width: params.width,
            height: params.height,
            desc,
            colors: params.colors,
            depth_stencil: params.depth_stencil,
            render_pass,
            resume_render_pass,
            framebuffer: vk::Framebuffer::null(),
            views: Vec::new(),
            clear_values: Vec::new(),
            readback: None,
        };
        rt.create_framebuffer()?;

        if params.readable {
            let Some(color) = rt.colors.first() else {
                return Err(BackendError::invalid_usage(
                    "a readable render target needs a color attachment",
                ));
            };
            let size =
                rt.width as usize * rt.height as usize * color.texture.format().bytes_per_pixel();
            rt.readback = Some(Buffer::readback(device, size)?);
        }

        log::debug!(
            "Created render target {}x{} ({} colors, samples {})",
            rt.width,
            rt.height,
            rt.colors.len(),
            rt.desc.samples
        );
        Ok(rt)
    }

    fn create_framebuffer(&mut self) -> BackendResult<()> {
        let mut targets: Vec<(&Rc<Texture>, u32)> = Vec::new();
        for color in &self.colors {
            targets.push((&color.texture, color.layer));
            self.clear_values.push(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: color.clear_value,
                },
            });
            if let Some(resolve) = &color.resolve_target {
                targets.push((resolve, color.resolve_layer));
                self.clear_values.push(vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: color.clear_value,
                    },
                });
            }
        }
        if let Some(depth) = &self.depth_stencil {
            targets.push((&depth.texture, depth.layer));
            self.clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        }

        for (texture, layer) in targets {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(texture.image())
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(texture.format().to_vk())
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: texture.format().aspect_flags(),
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: layer,
                    layer_count: 1,
                });
            let view = unsafe { self.device.device.create_image_view(&view_info, None)? };
            self.views.push(view);
        }

        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(self.render_pass)
            .attachments(&self.views)
            .width(self.width)
            .height(self.height)
            .layers(1);
        self.framebuffer = unsafe { self.device.device.create_framebuffer(&framebuffer_info, None)? };
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn desc(&self) -> &RenderTargetDesc {
        &self.desc
    }

    pub fn colors(&self) -> &[Attachment] {
        &self.colors
    }

    pub fn depth_stencil(&self) -> Option<&Attachment> {
        self.depth_stencil.as_ref()
    }

    pub fn is_readable(&self) -> bool {
        self.readback.is_some()
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Whether `texture` is written by this render target.
    pub fn uses_texture(&self, texture: &Texture) -> bool {
        let same = |t: &Rc<Texture>| std::ptr::eq(Rc::as_ptr(t), texture);
        self.colors
            .iter()
            .chain(self.depth_stencil.iter())
            .any(|a| same(&a.texture) || a.resolve_target.as_ref().is_some_and(same))
    }

    fn full_rect(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: self.width,
                height: self.height,
            },
        }
    }

    /// Moves attachments to their attachment layouts and begins the native
    /// pass. `resume` selects the pass variant that loads previous contents.
    pub(crate) fn begin_pass(&self, cmd: vk::CommandBuffer, resume: bool) -> BackendResult<()> {
        for color in &self.colors {
            color.texture.record_transition(cmd, ImageLayout::ColorAttachment);
            if let Some(resolve) = &color.resolve_target {
                resolve.assume_layout(ImageLayout::ColorAttachment);
            }
        }
        if let Some(depth) = &self.depth_stencil {
            depth.texture.record_transition(cmd, ImageLayout::DepthAttachment);
        }

        let render_pass = if resume {
            self.resume_render_pass
        } else {
            self.render_pass
        };
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(render_pass)
            .framebuffer(self.framebuffer)
            .render_area(self.full_rect())
            .clear_values(&self.clear_values);

        unsafe {
            self.device
                .device
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
        }
        Ok(())
    }

    /// Ends the native pass and moves attachments to the layout they rest in
    /// between passes: shader-readable if sampled, general otherwise.
    pub(crate) fn end_pass(&self, cmd: vk::CommandBuffer) {
        unsafe { self.device.device.cmd_end_render_pass(cmd) };

        for attachment in self.colors.iter().chain(self.depth_stencil.iter()) {
            let texture = &attachment.texture;
            texture.record_transition(cmd, texture.resting_layout());
            if let Some(resolve) = &attachment.resolve_target {
                resolve.record_transition(cmd, resolve.resting_layout());
            }
        }
    }

    /// Clears the whole target from inside an open pass: colors to
    /// `clear_color`, depth to 1.0 and stencil to 0.
    pub(crate) fn clear(&self, cmd: vk::CommandBuffer, clear_color: [f32; 4]) {
        let mut attachments: Vec<vk::ClearAttachment> = (0..self.colors.len() as u32)
            .map(|i| vk::ClearAttachment {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                color_attachment: i,
                clear_value: vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: clear_color,
                    },
                },
            })
            .collect();
        if let Some(depth) = &self.depth_stencil {
            attachments.push(vk::ClearAttachment {
                aspect_mask: depth.texture.format().aspect_flags(),
                color_attachment: 0,
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            });
        }
        let rect = vk::ClearRect {
            rect: self.full_rect(),
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.device
                .device
                .cmd_clear_attachments(cmd, &attachments, &[rect]);
        }
    }

    pub(crate) fn check_readable(&self) -> BackendResult<()> {
        if self.readback.is_none() {
            log::error!("Render target is not readable");
            return Err(BackendError::invalid_usage("render target is not readable"));
        }
        Ok(())
    }

    /// Records the copy of the first color (or its resolve target) into the
    /// staging buffer. Must be recorded outside a render pass.
    pub(crate) fn record_readback(&self, cmd: vk::CommandBuffer) -> BackendResult<()> {
        let (Some(readback), Some(color)) = (&self.readback, self.colors.first()) else {
            return Err(BackendError::invalid_usage("render target is not readable"));
        };
        let (source, layer) = match &color.resolve_target {
            Some(resolve) => (resolve, color.resolve_layer),
            None => (&color.texture, color.layer),
        };

        let previous = source.layout();
        source.record_transition(cmd, ImageLayout::TransferSrc);

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: layer,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.device.cmd_copy_image_to_buffer(
                cmd,
                source.image(),
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                readback.handle(),
                &[region],
            );
        }

        if previous != ImageLayout::Undefined {
            source.record_transition(cmd, previous);
        }
        Ok(())
    }

    /// Copies the staging buffer into `out` once the readback has executed.
    pub(crate) fn fetch_readback(&self, out: &mut [u8]) -> BackendResult<()> {
        let Some(readback) = &self.readback else {
            return Err(BackendError::invalid_usage("render target is not readable"));
        };
        let size = readback.size();
        if out.len() < size {
            return Err(BackendError::invalid_usage(format!(
                "read_pixels needs {} bytes, got {}",
                size,
                out.len()
            )));
        }
        readback.download(&mut out[..size], 0)
    }

    /// Reads the target's pixels outside of any frame, through a transient
    /// command. Inside a frame use the context's `read_pixels`.
    pub fn read_pixels(&self, out: &mut [u8]) -> BackendResult<()> {
        self.check_readable()?;
        let cmd = self.device.begin_transient_command()?;
        if let Err(e) = self.record_readback(cmd) {
            let _ = self.device.execute_transient_command(cmd);
            return Err(e);
        }
        self.device.execute_transient_command(cmd)?;
        self.fetch_readback(out)
    }
}

impl Drop for RenderTarget {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        unsafe {
            if self.framebuffer != vk::Framebuffer::null() {
                self.device.device.destroy_framebuffer(self.framebuffer, None);
            }
            for &view in &self.views {
                self.device.device.destroy_image_view(view, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(samples: u32, resolve: bool) -> RenderTargetDesc {
        RenderTargetDesc {
            samples,
            colors: vec![AttachmentDesc {
                format: Format::R8G8B8A8Unorm,
                resolve,
            }],
            depth_stencil: Some(AttachmentDesc {
                format: Format::D24UnormS8Uint,
                resolve: false,
            }),
        }
    }

    #[test]
    fn test_cache_creates_once_per_key() {
        let mut cache: KeyedCache<RenderPassKey, u32> = KeyedCache::default();
        let mut created = 0;
        let key = RenderPassKey::compatible(&desc(4, true));

        for _ in 0..3 {
            let value = cache
                .get_or_create(&key, |_| {
                    created += 1;
                    Ok(7)
                })
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(created, 1);

        // An equal descriptor built separately hits the same entry
        let same = RenderPassKey::compatible(&desc(4, true));
        cache.get_or_create(&same, |_| Ok(8)).unwrap();
        assert_eq!(cache.len(), 1);

        let other = RenderPassKey::compatible(&desc(1, false));
        cache.get_or_create(&other, |_| Ok(9)).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_failed_creation_is_not_cached() {
        let mut cache: KeyedCache<RenderPassKey, u32> = KeyedCache::default();
        let key = RenderPassKey::compatible(&desc(1, false));
        let err = cache.get_or_create(&key, |_| {
            Err(BackendError::UnsupportedFormat("test".into()))
        });
        assert!(err.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_resumed_key_loads() {
        let key = RenderPassKey {
            desc: desc(1, false),
            color_ops: vec![(LoadOp::Clear, StoreOp::Store)],
            depth_stencil_ops: (LoadOp::Clear, StoreOp::DontCare),
        };
        let resumed = key.resumed();
        assert_eq!(resumed.color_ops, vec![(LoadOp::Load, StoreOp::Store)]);
        assert_eq!(resumed.depth_stencil_ops, (LoadOp::Load, StoreOp::DontCare));
        assert_eq!(resumed.desc, key.desc);
    }

    #[test]
    fn test_attachment_order_puts_resolve_after_color() {
        let key = RenderPassKey::compatible(&desc(4, true));
        let descs = attachment_descriptions(&key);
        assert_eq!(descs.len(), 3);
        assert_eq!(descs[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(descs[1].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(descs[1].initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(descs[2].format, vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(
            descs[2].final_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }
}
