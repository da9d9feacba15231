// Graphics and compute pipelines
//
// A pipeline bundles the native pipeline object with everything a draw
// needs: vertex buffer bindings, a descriptor set per frame slot, and a
// host-side shadow of each stage's uniform block.
//
// Binding updates only touch host state. Descriptor sets are rewritten
// lazily at draw time for the slot being recorded, whose previous
// submission is known to be complete.

use super::buffer::Buffer;
use super::command::Recording;
use super::error::{BackendError, BackendResult};
use super::format::Format;
use super::program::{Program, ShaderStage};
use super::rendertarget::{render_pass_for, RenderPassKey, RenderTargetDesc};
use super::texture::{sample_count_flags, Texture};
use super::usage::{BufferUsage, TextureUsage};
use super::VulkanDevice;
use ash::vk;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

const ENTRY_POINT: &std::ffi::CStr = c"main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineType {
    #[default]
    Graphics,
    Compute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

impl Topology {
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            Self::PointList => vk::PrimitiveTopology::POINT_LIST,
            Self::LineList => vk::PrimitiveTopology::LINE_LIST,
            Self::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            Self::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            Self::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
}

impl BlendFactor {
    pub fn to_vk(self) -> vk::BlendFactor {
        match self {
            Self::Zero => vk::BlendFactor::ZERO,
            Self::One => vk::BlendFactor::ONE,
            Self::SrcColor => vk::BlendFactor::SRC_COLOR,
            Self::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            Self::DstColor => vk::BlendFactor::DST_COLOR,
            Self::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            Self::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            Self::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            Self::DstAlpha => vk::BlendFactor::DST_ALPHA,
            Self::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOp {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendOp {
    pub fn to_vk(self) -> vk::BlendOp {
        match self {
            Self::Add => vk::BlendOp::ADD,
            Self::Subtract => vk::BlendOp::SUBTRACT,
            Self::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            Self::Min => vk::BlendOp::MIN,
            Self::Max => vk::BlendOp::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessOrEqual,
    Greater,
    NotEqual,
    GreaterOrEqual,
    Always,
}

impl CompareOp {
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            Self::Never => vk::CompareOp::NEVER,
            Self::Less => vk::CompareOp::LESS,
            Self::Equal => vk::CompareOp::EQUAL,
            Self::LessOrEqual => vk::CompareOp::LESS_OR_EQUAL,
            Self::Greater => vk::CompareOp::GREATER,
            Self::NotEqual => vk::CompareOp::NOT_EQUAL,
            Self::GreaterOrEqual => vk::CompareOp::GREATER_OR_EQUAL,
            Self::Always => vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    IncrementAndClamp,
    DecrementAndClamp,
    Invert,
    IncrementAndWrap,
    DecrementAndWrap,
}

impl StencilOp {
    pub fn to_vk(self) -> vk::StencilOp {
        match self {
            Self::Keep => vk::StencilOp::KEEP,
            Self::Zero => vk::StencilOp::ZERO,
            Self::Replace => vk::StencilOp::REPLACE,
            Self::IncrementAndClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
            Self::DecrementAndClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
            Self::Invert => vk::StencilOp::INVERT,
            Self::IncrementAndWrap => vk::StencilOp::INCREMENT_AND_WRAP,
            Self::DecrementAndWrap => vk::StencilOp::DECREMENT_AND_WRAP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

impl CullMode {
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            Self::None => vk::CullModeFlags::NONE,
            Self::Front => vk::CullModeFlags::FRONT,
            Self::Back => vk::CullModeFlags::BACK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorWriteMask {
    pub r: bool,
    pub g: bool,
    pub b: bool,
    pub a: bool,
}

impl ColorWriteMask {
    pub const ALL: Self = Self {
        r: true,
        g: true,
        b: true,
        a: true,
    };

    pub fn to_vk(self) -> vk::ColorComponentFlags {
        let mut flags = vk::ColorComponentFlags::empty();
        if self.r {
            flags |= vk::ColorComponentFlags::R;
        }
        if self.g {
            flags |= vk::ColorComponentFlags::G;
        }
        if self.b {
            flags |= vk::ColorComponentFlags::B;
        }
        if self.a {
            flags |= vk::ColorComponentFlags::A;
        }
        flags
    }
}

/// Fixed-function state of a graphics pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsState {
    pub blend: bool,
    pub blend_src_factor: BlendFactor,
    pub blend_dst_factor: BlendFactor,
    pub blend_src_factor_a: BlendFactor,
    pub blend_dst_factor_a: BlendFactor,
    pub blend_op: BlendOp,
    pub blend_op_a: BlendOp,
    pub color_write_mask: ColorWriteMask,

    pub depth_test: bool,
    pub depth_write_mask: bool,
    pub depth_func: CompareOp,

    pub stencil_test: bool,
    pub stencil_write_mask: u32,
    pub stencil_func: CompareOp,
    pub stencil_ref: u32,
    pub stencil_read_mask: u32,
    pub stencil_fail: StencilOp,
    pub stencil_depth_fail: StencilOp,
    pub stencil_depth_pass: StencilOp,

    pub cull_mode: CullMode,
    pub scissor_test: bool,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            blend: false,
            blend_src_factor: BlendFactor::One,
            blend_dst_factor: BlendFactor::Zero,
            blend_src_factor_a: BlendFactor::One,
            blend_dst_factor_a: BlendFactor::Zero,
            blend_op: BlendOp::Add,
            blend_op_a: BlendOp::Add,
            color_write_mask: ColorWriteMask::ALL,
            depth_test: false,
            depth_write_mask: true,
            depth_func: CompareOp::Less,
            stencil_test: false,
            stencil_write_mask: 0xff,
            stencil_func: CompareOp::Always,
            stencil_ref: 0,
            stencil_read_mask: 0xff,
            stencil_fail: StencilOp::Keep,
            stencil_depth_fail: StencilOp::Keep,
            stencil_depth_pass: StencilOp::Keep,
            cull_mode: CullMode::None,
            scissor_test: false,
        }
    }
}

impl GraphicsState {
    fn stencil_op_state(&self) -> vk::StencilOpState {
        vk::StencilOpState {
            fail_op: self.stencil_fail.to_vk(),
            pass_op: self.stencil_depth_pass.to_vk(),
            depth_fail_op: self.stencil_depth_fail.to_vk(),
            compare_op: self.stencil_func.to_vk(),
            compare_mask: self.stencil_read_mask,
            write_mask: self.stencil_write_mask,
            reference: self.stencil_ref,
        }
    }

    fn blend_attachment(&self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: self.blend.into(),
            src_color_blend_factor: self.blend_src_factor.to_vk(),
            dst_color_blend_factor: self.blend_dst_factor.to_vk(),
            color_blend_op: self.blend_op.to_vk(),
            src_alpha_blend_factor: self.blend_src_factor_a.to_vk(),
            dst_alpha_blend_factor: self.blend_dst_factor_a.to_vk(),
            alpha_blend_op: self.blend_op_a.to_vk(),
            color_write_mask: self.color_write_mask.to_vk(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphicsParams {
    pub topology: Topology,
    pub state: GraphicsState,
    /// Render targets this pipeline may draw into must have this descriptor
    pub rt_desc: RenderTargetDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributeRate {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDesc {
    pub name: String,
    pub location: u32,
    pub format: Format,
    pub stride: u32,
    pub offset: u32,
    pub rate: AttributeRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingType {
    UniformBuffer,
    StorageBuffer,
    Sampler2D,
    Sampler3D,
    SamplerCube,
    Image2D,
}

impl BindingType {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::Sampler2D | Self::Sampler3D | Self::SamplerCube => {
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
            Self::Image2D => vk::DescriptorType::STORAGE_IMAGE,
        }
    }

    fn is_buffer(self) -> bool {
        matches!(self, Self::UniformBuffer | Self::StorageBuffer)
    }
}

/// A buffer or texture slot of the descriptor set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    pub name: String,
    pub binding: u32,
    pub binding_type: BindingType,
    pub stage: ShaderStage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformField {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

/// Layout of one stage's uniform block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlock {
    pub name: String,
    pub binding: u32,
    pub size: usize,
    pub fields: Vec<UniformField>,
}

pub struct PipelineParams {
    pub pipeline_type: PipelineType,
    pub program: Rc<Program>,
    pub graphics: GraphicsParams,
    pub attributes: Vec<AttributeDesc>,
    pub buffers: Vec<ResourceDesc>,
    pub textures: Vec<ResourceDesc>,
    /// Indexed by shader stage
    pub uniform_blocks: [Option<UniformBlock>; 3],
}

/// Resources for `set_resources`, parallel to the params lists.
#[derive(Default, Clone)]
pub struct PipelineResources {
    pub attributes: Vec<Option<Rc<Buffer>>>,
    pub buffers: Vec<Option<Rc<Buffer>>>,
    pub textures: Vec<Option<Rc<Texture>>>,
}

/// Element size used for the vertex layout. When the caller's stride does
/// not cover `count` elements exactly, the element size follows the stride.
pub fn reconcile_element_size(stride: u32, element_size: u32, count: u32) -> u32 {
    if stride == 0 || count == 0 {
        return element_size;
    }
    if stride != element_size * count {
        stride / count
    } else {
        element_size
    }
}

/// Scissor rectangle for a draw. `scissor` is [x, y, w, h] with a
/// bottom-left origin; it is flipped against the target height.
pub fn scissor_rect(scissor: [i32; 4], scissor_test: bool, rt_width: u32, rt_height: u32) -> vk::Rect2D {
    if !scissor_test {
        return vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: rt_width,
                height: rt_height,
            },
        };
    }
    let [x, y, w, h] = scissor;
    vk::Rect2D {
        offset: vk::Offset2D {
            x: x.max(0),
            y: (rt_height as i32 - y - h).max(0),
        },
        extent: vk::Extent2D {
            width: w.max(0) as u32,
            height: h.max(0) as u32,
        },
    }
}

pub fn index_type(format: Format) -> BackendResult<vk::IndexType> {
    match format {
        Format::R16Unorm => Ok(vk::IndexType::UINT16),
        Format::R32Uint => Ok(vk::IndexType::UINT32),
        other => Err(BackendError::UnsupportedFormat(format!(
            "{:?} is not an index format",
            other
        ))),
    }
}

/// Tracks which vertex attributes have a buffer bound.
#[derive(Debug, Clone, Default)]
pub struct AttributeBindings {
    bound: Vec<bool>,
    unbound: usize,
}

impl AttributeBindings {
    pub fn new(count: usize) -> Self {
        Self {
            bound: vec![false; count],
            unbound: count,
        }
    }

    pub fn set(&mut self, index: usize, bound: bool) {
        let Some(slot) = self.bound.get_mut(index) else {
            return;
        };
        match (*slot, bound) {
            (false, true) => self.unbound -= 1,
            (true, false) => self.unbound += 1,
            _ => {}
        }
        *slot = bound;
    }

    pub fn unbound(&self) -> usize {
        self.unbound
    }
}

/// Host copy of a uniform block. Writes land here; each frame slot's
/// uniform buffer is refreshed from it at most once per draw.
#[derive(Debug, Clone)]
pub struct UniformShadow {
    block: UniformBlock,
    data: Vec<u8>,
    generation: u64,
    uploaded: Vec<Option<u64>>,
}

impl UniformShadow {
    pub fn new(block: UniformBlock, slots: usize) -> Self {
        Self {
            data: vec![0; block.size],
            block,
            generation: 0,
            uploaded: vec![None; slots],
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.block.fields.iter().position(|f| f.name == name)
    }

    pub fn write(&mut self, field: usize, value: &[u8]) -> BackendResult<()> {
        let Some(info) = self.block.fields.get(field) else {
            return Err(BackendError::not_found(format!("uniform field {}", field)));
        };
        if value.len() > info.size || info.offset + value.len() > self.data.len() {
            return Err(BackendError::invalid_usage(format!(
                "uniform '{}' holds {} bytes, got {}",
                info.name,
                info.size,
                value.len()
            )));
        }
        self.data[info.offset..info.offset + value.len()].copy_from_slice(value);
        self.generation += 1;
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Data to upload for `slot`, or None if that slot is current.
    pub fn pending(&self, slot: usize) -> Option<&[u8]> {
        match self.uploaded.get(slot) {
            Some(Some(generation)) if *generation == self.generation => None,
            _ => Some(&self.data),
        }
    }

    pub fn mark_uploaded(&mut self, slot: usize) {
        if let Some(uploaded) = self.uploaded.get_mut(slot) {
            *uploaded = Some(self.generation);
        }
    }
}

struct AttributeSlot {
    desc: AttributeDesc,
    active: bool,
    binding: u32,
    buffer: Option<Rc<Buffer>>,
}

struct BufferSlot {
    desc: ResourceDesc,
    active: bool,
    buffer: Option<Rc<Buffer>>,
}

struct TextureSlot {
    desc: ResourceDesc,
    active: bool,
    texture: Option<Rc<Texture>>,
}

struct UniformSlot {
    stage: ShaderStage,
    binding: u32,
    shadow: UniformShadow,
    // One per frame slot
    buffers: Vec<Buffer>,
}

pub struct Pipeline {
    device: Arc<VulkanDevice>,
    pipeline_type: PipelineType,
    graphics: GraphicsParams,
    _program: Rc<Program>,

    attributes: Vec<AttributeSlot>,
    attribute_bindings: AttributeBindings,
    buffers: Vec<BufferSlot>,
    textures: Vec<TextureSlot>,
    uniforms: Vec<UniformSlot>,

    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    stale: Vec<bool>,

    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

impl Pipeline {
    /// Builds a pipeline whose descriptor sets cover `frame_count` frame slots.
    pub fn new(
        device: &Arc<VulkanDevice>,
        frame_count: usize,
        params: PipelineParams,
    ) -> BackendResult<Self> {
        if frame_count == 0 {
            return Err(BackendError::invalid_usage("frame count must be non-zero"));
        }
        let program = params.program;

        let mut attributes = Vec::with_capacity(params.attributes.len());
        let mut next_binding = 0;
        for desc in params.attributes {
            let active = match program.reflection() {
                Some(reflection) => reflection.attribute(&desc.name).is_some(),
                None => true,
            };
            if !active {
                log::warn!("Attribute '{}' is not used by the program, skipping", desc.name);
            }
            attributes.push(AttributeSlot {
                desc,
                active,
                binding: next_binding,
                buffer: None,
            });
            if active {
                next_binding += 1;
            }
        }
        let active_attributes = attributes.iter().filter(|a| a.active).count();
        let mut attribute_bindings = AttributeBindings::new(attributes.len());
        for (i, attribute) in attributes.iter().enumerate() {
            if !attribute.active {
                attribute_bindings.set(i, true);
            }
        }
        debug_assert_eq!(attribute_bindings.unbound(), active_attributes);

        let declared = |desc: &ResourceDesc, kind: &str| {
            let active = program.declares_binding(desc.stage, &desc.name);
            if !active {
                log::warn!(
                    "{} '{}' is not declared by the {:?} stage, skipping",
                    kind,
                    desc.name,
                    desc.stage
                );
            }
            active
        };

        let mut buffers = Vec::with_capacity(params.buffers.len());
        for desc in params.buffers {
            if !desc.binding_type.is_buffer() {
                return Err(BackendError::invalid_usage(format!(
                    "buffer '{}' has texture binding type {:?}",
                    desc.name, desc.binding_type
                )));
            }
            let active = declared(&desc, "Buffer");
            buffers.push(BufferSlot {
                desc,
                active,
                buffer: None,
            });
        }

        let mut textures = Vec::with_capacity(params.textures.len());
        for desc in params.textures {
            if desc.binding_type.is_buffer() {
                return Err(BackendError::invalid_usage(format!(
                    "texture '{}' has buffer binding type {:?}",
                    desc.name, desc.binding_type
                )));
            }
            let active = declared(&desc, "Texture");
            textures.push(TextureSlot {
                desc,
                active,
                texture: None,
            });
        }

        let mut uniforms = Vec::new();
        for (index, block) in params.uniform_blocks.into_iter().enumerate() {
            let (Some(block), Some(stage)) = (block, ShaderStage::from_index(index)) else {
                continue;
            };
            if block.size == 0 {
                continue;
            }
            if !program.declares_binding(stage, &block.name) {
                log::warn!(
                    "Uniform block '{}' is not declared by the {:?} stage, skipping",
                    block.name,
                    stage
                );
                continue;
            }
            let buffers = (0..frame_count)
                .map(|_| Buffer::new(device, block.size, BufferUsage::UNIFORM))
                .collect::<BackendResult<Vec<_>>>()?;
            uniforms.push(UniformSlot {
                stage,
                binding: block.binding,
                shadow: UniformShadow::new(block, frame_count),
                buffers,
            });
        }

        let mut pipeline = Self {
            device: Arc::clone(device),
            pipeline_type: params.pipeline_type,
            graphics: params.graphics,
            _program: Rc::clone(&program),
            attributes,
            attribute_bindings,
            buffers,
            textures,
            uniforms,
            set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_sets: Vec::new(),
            stale: vec![true; frame_count],
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        };

        pipeline.create_descriptor_sets(frame_count)?;
        pipeline.create_pipeline_layout()?;
        match pipeline.pipeline_type {
            PipelineType::Graphics => pipeline.create_graphics_pipeline(&program)?,
            PipelineType::Compute => pipeline.create_compute_pipeline(&program)?,
        }

        log::debug!(
            "Created {:?} pipeline ({} attributes, {} buffers, {} textures, {} uniform blocks)",
            pipeline.pipeline_type,
            pipeline.attributes.len(),
            pipeline.buffers.len(),
            pipeline.textures.len(),
            pipeline.uniforms.len()
        );
        Ok(pipeline)
    }

    fn layout_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding> {
        let buffers = self
            .buffers
            .iter()
            .filter(|b| b.active)
            .map(|b| (b.desc.binding, b.desc.binding_type.descriptor_type(), b.desc.stage));
        let textures = self
            .textures
            .iter()
            .filter(|t| t.active)
            .map(|t| (t.desc.binding, t.desc.binding_type.descriptor_type(), t.desc.stage));
        let uniforms = self
            .uniforms
            .iter()
            .map(|u| (u.binding, vk::DescriptorType::UNIFORM_BUFFER, u.stage));

        buffers
            .chain(textures)
            .chain(uniforms)
            .map(|(binding, descriptor_type, stage)| vk::DescriptorSetLayoutBinding {
                binding,
                descriptor_type,
                descriptor_count: 1,
                stage_flags: stage.to_vk(),
                ..Default::default()
            })
            .collect()
    }

    fn create_descriptor_sets(&mut self, frame_count: usize) -> BackendResult<()> {
        let bindings = self.layout_bindings();
        if bindings.is_empty() {
            return Ok(());
        }

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        self.set_layout = unsafe {
            self.device
                .device
                .create_descriptor_set_layout(&layout_info, None)?
        };

        let mut counts: HashMap<vk::DescriptorType, u32> = HashMap::new();
        for binding in &bindings {
            *counts.entry(binding.descriptor_type).or_default() += frame_count as u32;
        }
        let pool_sizes: Vec<vk::DescriptorPoolSize> = counts
            .into_iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(frame_count as u32);
        self.descriptor_pool = unsafe { self.device.device.create_descriptor_pool(&pool_info, None)? };

        let layouts = vec![self.set_layout; frame_count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        self.descriptor_sets = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info)? };
        Ok(())
    }

    fn create_pipeline_layout(&mut self) -> BackendResult<()> {
        let set_layouts = [self.set_layout];
        let count = usize::from(self.set_layout != vk::DescriptorSetLayout::null());
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts[..count]);
        self.pipeline_layout = unsafe { self.device.device.create_pipeline_layout(&layout_info, None)? };
        Ok(())
    }

    fn vertex_input(
        &self,
        program: &Program,
    ) -> (
        Vec<vk::VertexInputBindingDescription>,
        Vec<vk::VertexInputAttributeDescription>,
    ) {
        let mut bindings = Vec::new();
        let mut descs = Vec::new();

        for slot in self.attributes.iter().filter(|a| a.active) {
            let desc = &slot.desc;
            let (element_size, count) = program
                .reflection()
                .and_then(|r| r.attribute(&desc.name))
                .map(|a| (a.element_size, a.count.max(1)))
                .unwrap_or((desc.format.bytes_per_pixel() as u32, 1));
            let element_size = reconcile_element_size(desc.stride, element_size, count);

            bindings.push(vk::VertexInputBindingDescription {
                binding: slot.binding,
                stride: desc.stride,
                input_rate: match desc.rate {
                    AttributeRate::Vertex => vk::VertexInputRate::VERTEX,
                    AttributeRate::Instance => vk::VertexInputRate::INSTANCE,
                },
            });
            for i in 0..count {
                descs.push(vk::VertexInputAttributeDescription {
                    location: desc.location + i,
                    binding: slot.binding,
                    format: desc.format.to_vk(),
                    offset: desc.offset + i * element_size,
                });
            }
        }

        (bindings, descs)
    }

    fn create_graphics_pipeline(&mut self, program: &Program) -> BackendResult<()> {
        let (Some(vertex), Some(fragment)) = (
            program.module(ShaderStage::Vertex),
            program.module(ShaderStage::Fragment),
        ) else {
            return Err(BackendError::invalid_usage(
                "graphics pipeline needs vertex and fragment stages",
            ));
        };

        let stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex)
                .name(ENTRY_POINT)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment)
                .name(ENTRY_POINT)
                .build(),
        ];

        let (vertex_bindings, vertex_attributes) = self.vertex_input(program);
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(self.graphics.topology.to_vk())
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic; only the counts matter here
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let state = &self.graphics.state;
        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(state.cull_mode.to_vk())
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(sample_count_flags(self.graphics.rt_desc.samples));

        let stencil = state.stencil_op_state();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(state.depth_test)
            .depth_write_enable(state.depth_write_mask)
            .depth_compare_op(state.depth_func.to_vk())
            .depth_bounds_test_enable(false)
            .stencil_test_enable(state.stencil_test)
            .front(stencil)
            .back(stencil);

        let blend_attachments = vec![state.blend_attachment(); self.graphics.rt_desc.colors.len()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::LINE_WIDTH,
        ];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let render_pass = render_pass_for(
            &self.device,
            &RenderPassKey::compatible(&self.graphics.rt_desc),
        )?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(self.pipeline_layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            self.device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)?
        };
        self.pipeline = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::ExternalApi("no graphics pipeline returned".into()))?;
        self.bind_point = vk::PipelineBindPoint::GRAPHICS;
        Ok(())
    }

    fn create_compute_pipeline(&mut self, program: &Program) -> BackendResult<()> {
        let Some(compute) = program.module(ShaderStage::Compute) else {
            return Err(BackendError::invalid_usage("compute pipeline needs a compute stage"));
        };

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(compute)
            .name(ENTRY_POINT)
            .build();
        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(self.pipeline_layout)
            .build();

        let pipelines = unsafe {
            self.device
                .device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| e)?
        };
        self.pipeline = pipelines
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::ExternalApi("no compute pipeline returned".into()))?;
        self.bind_point = vk::PipelineBindPoint::COMPUTE;
        Ok(())
    }

    pub fn pipeline_type(&self) -> PipelineType {
        self.pipeline_type
    }

    pub fn rt_desc(&self) -> &RenderTargetDesc {
        &self.graphics.rt_desc
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn unbound_attributes(&self) -> usize {
        self.attribute_bindings.unbound()
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes
            .iter()
            .position(|a| a.active && a.desc.name == name)
    }

    pub fn buffer_index(&self, name: &str) -> Option<usize> {
        self.buffers.iter().position(|b| b.active && b.desc.name == name)
    }

    pub fn texture_index(&self, name: &str) -> Option<usize> {
        self.textures
            .iter()
            .position(|t| t.active && t.desc.name == name)
    }

    /// Index of a uniform field: stage in the high 16 bits, field below.
    pub fn uniform_index(&self, name: &str) -> Option<u32> {
        self.uniforms.iter().find_map(|u| {
            u.shadow
                .field_index(name)
                .map(|field| ((u.stage.index() as u32) << 16) | field as u32)
        })
    }

    /// Binds every resource in `resources`, slot by slot.
    pub fn set_resources(&mut self, resources: PipelineResources) -> BackendResult<()> {
        for (i, buffer) in resources.attributes.into_iter().enumerate() {
            self.update_attribute(i, buffer)?;
        }
        for (i, buffer) in resources.buffers.into_iter().enumerate() {
            self.update_buffer(i, buffer)?;
        }
        for (i, texture) in resources.textures.into_iter().enumerate() {
            self.update_texture(i, texture)?;
        }
        Ok(())
    }

    pub fn update_attribute(&mut self, index: usize, buffer: Option<Rc<Buffer>>) -> BackendResult<()> {
        let Some(slot) = self.attributes.get_mut(index) else {
            return Err(BackendError::not_found(format!("attribute index {}", index)));
        };
        if !slot.active {
            return Ok(());
        }
        if let Some(buffer) = &buffer {
            if !buffer.usage().contains(BufferUsage::VERTEX) {
                return Err(BackendError::invalid_usage(format!(
                    "attribute '{}' needs a buffer with VERTEX usage",
                    slot.desc.name
                )));
            }
        }
        self.attribute_bindings.set(index, buffer.is_some());
        slot.buffer = buffer;
        Ok(())
    }

    pub fn update_buffer(&mut self, index: usize, buffer: Option<Rc<Buffer>>) -> BackendResult<()> {
        let Some(slot) = self.buffers.get_mut(index) else {
            return Err(BackendError::not_found(format!("buffer index {}", index)));
        };
        if !slot.active {
            return Ok(());
        }
        if let Some(buffer) = &buffer {
            let needed = match slot.desc.binding_type {
                BindingType::UniformBuffer => BufferUsage::UNIFORM,
                _ => BufferUsage::STORAGE,
            };
            if !buffer.usage().contains(needed) {
                return Err(BackendError::invalid_usage(format!(
                    "buffer '{}' needs {:?} usage",
                    slot.desc.name, needed
                )));
            }
        }
        slot.buffer = buffer;
        self.stale.fill(true);
        Ok(())
    }

    pub fn update_texture(&mut self, index: usize, texture: Option<Rc<Texture>>) -> BackendResult<()> {
        let Some(slot) = self.textures.get_mut(index) else {
            return Err(BackendError::not_found(format!("texture index {}", index)));
        };
        if !slot.active {
            return Ok(());
        }
        if let Some(texture) = &texture {
            let needed = match slot.desc.binding_type {
                BindingType::Image2D => TextureUsage::STORAGE,
                _ => TextureUsage::SAMPLED,
            };
            if !texture.usage().contains(needed) {
                return Err(BackendError::invalid_usage(format!(
                    "texture '{}' needs {:?} usage",
                    slot.desc.name, needed
                )));
            }
        }
        slot.texture = texture;
        self.stale.fill(true);
        Ok(())
    }

    /// Writes a uniform value into the host shadow. Nothing reaches the
    /// GPU until the next draw or dispatch.
    pub fn update_uniform(&mut self, index: u32, value: &[u8]) -> BackendResult<()> {
        let stage = ShaderStage::from_index((index >> 16) as usize);
        let field = (index & 0xffff) as usize;
        let Some(uniform) = self.uniforms.iter_mut().find(|u| Some(u.stage) == stage) else {
            return Err(BackendError::not_found(format!("uniform index {:#x}", index)));
        };
        uniform.shadow.write(field, value)
    }

    fn check_bindings_complete(&self) -> BackendResult<()> {
        if let Some(slot) = self.buffers.iter().find(|b| b.active && b.buffer.is_none()) {
            return Err(BackendError::invalid_usage(format!(
                "buffer '{}' is not bound",
                slot.desc.name
            )));
        }
        if let Some(slot) = self.textures.iter().find(|t| t.active && t.texture.is_none()) {
            return Err(BackendError::invalid_usage(format!(
                "texture '{}' is not bound",
                slot.desc.name
            )));
        }
        Ok(())
    }

    fn bound_textures(&self) -> impl Iterator<Item = &Rc<Texture>> {
        self.textures
            .iter()
            .filter(|t| t.active)
            .filter_map(|t| t.texture.as_ref())
    }

    fn flush_uniforms(&mut self, slot: usize) -> BackendResult<()> {
        for uniform in &mut self.uniforms {
            if let Some(data) = uniform.shadow.pending(slot) {
                uniform.buffers[slot].upload(data, 0)?;
                uniform.shadow.mark_uploaded(slot);
            }
        }
        Ok(())
    }

    fn write_descriptor_set(&mut self, slot: usize) {
        if !self.stale[slot] {
            return;
        }
        let Some(&set) = self.descriptor_sets.get(slot) else {
            return;
        };

        let mut buffer_infos = Vec::new();
        let mut buffer_targets = Vec::new();
        for b in self.buffers.iter().filter(|b| b.active) {
            if let Some(buffer) = &b.buffer {
                buffer_infos.push(vk::DescriptorBufferInfo {
                    buffer: buffer.handle(),
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                });
                buffer_targets.push((b.desc.binding, b.desc.binding_type.descriptor_type()));
            }
        }
        for u in &self.uniforms {
            buffer_infos.push(vk::DescriptorBufferInfo {
                buffer: u.buffers[slot].handle(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            });
            buffer_targets.push((u.binding, vk::DescriptorType::UNIFORM_BUFFER));
        }

        let mut image_infos = Vec::new();
        let mut image_targets = Vec::new();
        for t in self.textures.iter().filter(|t| t.active) {
            if let Some(texture) = &t.texture {
                image_infos.push(vk::DescriptorImageInfo {
                    sampler: texture.sampler(),
                    image_view: texture.view(),
                    image_layout: texture.resting_layout().to_vk(),
                });
                image_targets.push((t.desc.binding, t.desc.binding_type.descriptor_type()));
            }
        }

        let mut writes = Vec::with_capacity(buffer_infos.len() + image_infos.len());
        for (info, &(binding, descriptor_type)) in buffer_infos.iter().zip(&buffer_targets) {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(descriptor_type)
                    .buffer_info(std::slice::from_ref(info))
                    .build(),
            );
        }
        for (info, &(binding, descriptor_type)) in image_infos.iter().zip(&image_targets) {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(binding)
                    .descriptor_type(descriptor_type)
                    .image_info(std::slice::from_ref(info))
                    .build(),
            );
        }

        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
        self.stale[slot] = false;
    }

    fn bind(&mut self, rec: &Recording) {
        let slot = rec.frame_index;
        self.write_descriptor_set(slot);

        let cmd = rec.command_buffer;
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(cmd, self.bind_point, self.pipeline);
            if let Some(&set) = self.descriptor_sets.get(slot) {
                self.device.device.cmd_bind_descriptor_sets(
                    cmd,
                    self.bind_point,
                    self.pipeline_layout,
                    0,
                    &[set],
                    &[],
                );
            }
        }
    }

    /// Validates, then opens the pass and binds all draw state. Nothing is
    /// recorded when a check fails.
    fn prepare_draw(&mut self, rec: &mut Recording) -> BackendResult<()> {
        if self.pipeline_type != PipelineType::Graphics {
            return Err(BackendError::invalid_usage("draw on a compute pipeline"));
        }
        if self.attribute_bindings.unbound() > 0 {
            log::error!("Pipeline has {} unbound vertex attributes", self.attribute_bindings.unbound());
            return Err(BackendError::invalid_usage("pipeline has unbound vertex attributes"));
        }
        if rec.frame_index >= self.stale.len() {
            return Err(BackendError::invalid_usage(format!(
                "frame slot {} is out of range",
                rec.frame_index
            )));
        }
        let Some(rt) = rec.rendertarget().cloned() else {
            log::error!("Draw without an active render pass");
            return Err(BackendError::invalid_usage("no render pass is active"));
        };
        if rt.desc() != &self.graphics.rt_desc {
            log::error!(
                "Render target {:?} does not match pipeline {:?}",
                rt.desc(),
                self.graphics.rt_desc
            );
            return Err(BackendError::invalid_usage(
                "render target is not compatible with the pipeline",
            ));
        }
        self.check_bindings_complete()?;
        if self.bound_textures().any(|t| rt.uses_texture(t)) {
            return Err(BackendError::invalid_usage(
                "texture is sampled while attached to the active render target",
            ));
        }
        if rec.pass_open {
            if let Some(texture) = self.bound_textures().find(|t| t.layout() != t.resting_layout()) {
                log::error!(
                    "Texture is in {:?} layout inside a render pass, expected {:?}",
                    texture.layout(),
                    texture.resting_layout()
                );
                return Err(BackendError::invalid_usage(
                    "texture cannot be sampled inside the current render pass",
                ));
            }
        }

        self.flush_uniforms(rec.frame_index)?;

        if !rec.pass_open {
            for texture in self.bound_textures() {
                texture.record_transition(rec.command_buffer, texture.resting_layout());
            }
        }
        rec.resume_render_pass()?;
        self.bind(rec);

        let cmd = rec.command_buffer;
        let [x, y, w, h] = rec.viewport;
        let viewport = vk::Viewport {
            x: x as f32,
            y: y as f32,
            width: w as f32,
            height: h as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = scissor_rect(
            rec.scissor,
            self.graphics.state.scissor_test,
            rt.width(),
            rt.height(),
        );

        let vertex_buffers: Vec<vk::Buffer> = self
            .attributes
            .iter()
            .filter(|a| a.active)
            .map(|a| a.buffer.as_ref().map_or(vk::Buffer::null(), |b| b.handle()))
            .collect();
        let offsets = vec![0; vertex_buffers.len()];

        unsafe {
            let device = &self.device.device;
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_line_width(cmd, 1.0);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
            if !vertex_buffers.is_empty() {
                device.cmd_bind_vertex_buffers(cmd, 0, &vertex_buffers, &offsets);
            }
        }
        Ok(())
    }

    pub fn draw(&mut self, rec: &mut Recording, nb_vertices: u32, nb_instances: u32) -> BackendResult<()> {
        self.prepare_draw(rec)?;
        unsafe {
            self.device
                .device
                .cmd_draw(rec.command_buffer, nb_vertices, nb_instances, 0, 0);
        }
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        rec: &mut Recording,
        indices: &Buffer,
        indices_format: Format,
        nb_indices: u32,
        nb_instances: u32,
    ) -> BackendResult<()> {
        let index_type = index_type(indices_format)?;
        if !indices.usage().contains(BufferUsage::INDEX) {
            return Err(BackendError::invalid_usage("index buffer needs INDEX usage"));
        }
        self.prepare_draw(rec)?;
        unsafe {
            let device = &self.device.device;
            device.cmd_bind_index_buffer(rec.command_buffer, indices.handle(), 0, index_type);
            device.cmd_draw_indexed(rec.command_buffer, nb_indices, nb_instances, 0, 0, 0);
        }
        Ok(())
    }

    /// Runs the compute pipeline outside of any render pass, then makes its
    /// writes visible to everything that follows.
    pub fn dispatch(&mut self, rec: &mut Recording, groups: [u32; 3]) -> BackendResult<()> {
        if self.pipeline_type != PipelineType::Compute {
            return Err(BackendError::invalid_usage("dispatch on a graphics pipeline"));
        }
        if rec.frame_index >= self.stale.len() {
            return Err(BackendError::invalid_usage(format!(
                "frame slot {} is out of range",
                rec.frame_index
            )));
        }
        let limits = &self.device.limits;
        if groups
            .iter()
            .zip(limits.max_compute_work_group_count)
            .any(|(&n, max)| n > max)
        {
            return Err(BackendError::invalid_usage(format!(
                "dispatch {:?} exceeds {:?}",
                groups, limits.max_compute_work_group_count
            )));
        }
        self.check_bindings_complete()?;

        self.flush_uniforms(rec.frame_index)?;
        rec.suspend_render_pass();

        let cmd = rec.command_buffer;
        for texture in self.bound_textures() {
            texture.record_transition(cmd, texture.resting_layout());
        }
        self.bind(rec);

        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::SHADER_WRITE)
            .dst_access_mask(
                vk::AccessFlags::SHADER_READ
                    | vk::AccessFlags::SHADER_WRITE
                    | vk::AccessFlags::VERTEX_ATTRIBUTE_READ
                    | vk::AccessFlags::INDEX_READ
                    | vk::AccessFlags::UNIFORM_READ
                    | vk::AccessFlags::TRANSFER_READ,
            )
            .build();
        unsafe {
            let device = &self.device.device;
            device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let _ = self.device.wait_idle();
        unsafe {
            let device = &self.device.device;
            if self.pipeline != vk::Pipeline::null() {
                device.destroy_pipeline(self.pipeline, None);
            }
            if self.pipeline_layout != vk::PipelineLayout::null() {
                device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.set_layout, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> UniformBlock {
        UniformBlock {
            name: "ubo".into(),
            binding: 0,
            size: 32,
            fields: vec![
                UniformField {
                    name: "color".into(),
                    offset: 0,
                    size: 16,
                },
                UniformField {
                    name: "time".into(),
                    offset: 16,
                    size: 4,
                },
            ],
        }
    }

    #[test]
    fn test_reconcile_element_size_follows_stride() {
        // vec3 declared, caller packs vec4
        assert_eq!(reconcile_element_size(16, 12, 1), 16);
        // mat4 over 4 locations with a matching stride
        assert_eq!(reconcile_element_size(64, 16, 4), 16);
        // mat4 with padding per column
        assert_eq!(reconcile_element_size(80, 16, 4), 20);
        // stride 0 keeps the shader size
        assert_eq!(reconcile_element_size(0, 12, 1), 12);
    }

    #[test]
    fn test_attribute_bindings_counter() {
        let mut bindings = AttributeBindings::new(3);
        assert_eq!(bindings.unbound(), 3);

        bindings.set(0, true);
        bindings.set(0, true);
        assert_eq!(bindings.unbound(), 2);

        bindings.set(1, true);
        bindings.set(2, true);
        assert_eq!(bindings.unbound(), 0);

        bindings.set(1, false);
        assert_eq!(bindings.unbound(), 1);
        bindings.set(1, false);
        assert_eq!(bindings.unbound(), 1);

        // Out of range indices are ignored
        bindings.set(7, true);
        assert_eq!(bindings.unbound(), 1);
    }

    #[test]
    fn test_uniform_last_write_wins() {
        let mut shadow = UniformShadow::new(block(), 2);
        let field = shadow.field_index("time").unwrap();

        shadow.write(field, &1.0f32.to_ne_bytes()).unwrap();
        shadow.write(field, &2.0f32.to_ne_bytes()).unwrap();
        shadow.write(field, &3.0f32.to_ne_bytes()).unwrap();

        let data = shadow.pending(0).unwrap();
        assert_eq!(&data[16..20], &3.0f32.to_ne_bytes());
    }

    #[test]
    fn test_uniform_upload_once_per_slot() {
        let mut shadow = UniformShadow::new(block(), 2);
        assert!(shadow.pending(0).is_some());
        shadow.mark_uploaded(0);
        assert!(shadow.pending(0).is_none());
        assert!(shadow.pending(1).is_some());

        shadow.write(0, &[1; 16]).unwrap();
        assert!(shadow.pending(0).is_some());
        shadow.mark_uploaded(0);
        shadow.mark_uploaded(1);
        assert!(shadow.pending(0).is_none());
        assert!(shadow.pending(1).is_none());
    }

    #[test]
    fn test_uniform_write_errors() {
        let mut shadow = UniformShadow::new(block(), 1);
        assert!(matches!(
            shadow.write(5, &[0; 4]),
            Err(BackendError::NotFound(_))
        ));
        assert!(matches!(
            shadow.write(1, &[0; 8]),
            Err(BackendError::InvalidUsage(_))
        ));
        assert!(shadow.field_index("missing").is_none());
    }

    #[test]
    fn test_scissor_flip() {
        let rect = scissor_rect([10, 20, 100, 50], true, 640, 480);
        assert_eq!(rect.offset.x, 10);
        assert_eq!(rect.offset.y, 480 - 20 - 50);
        assert_eq!(rect.extent.width, 100);
        assert_eq!(rect.extent.height, 50);

        // Clamped at the top edge
        let rect = scissor_rect([0, 400, 10, 200], true, 640, 480);
        assert_eq!(rect.offset.y, 0);

        let rect = scissor_rect([10, 20, 100, 50], false, 640, 480);
        assert_eq!(rect.offset.x, 0);
        assert_eq!(rect.offset.y, 0);
        assert_eq!(rect.extent.width, 640);
        assert_eq!(rect.extent.height, 480);
    }

    #[test]
    fn test_index_formats() {
        assert_eq!(index_type(Format::R16Unorm).unwrap(), vk::IndexType::UINT16);
        assert_eq!(index_type(Format::R32Uint).unwrap(), vk::IndexType::UINT32);
        assert!(matches!(
            index_type(Format::R8Unorm),
            Err(BackendError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_default_state() {
        let state = GraphicsState::default();
        assert!(!state.blend);
        assert_eq!(state.color_write_mask.to_vk(), vk::ColorComponentFlags::RGBA);
        let blend = state.blend_attachment();
        assert_eq!(blend.blend_enable, vk::FALSE);
        assert_eq!(blend.src_color_blend_factor, vk::BlendFactor::ONE);
    }

    #[test]
    fn test_binding_descriptor_types() {
        assert_eq!(
            BindingType::SamplerCube.descriptor_type(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(
            BindingType::Image2D.descriptor_type(),
            vk::DescriptorType::STORAGE_IMAGE
        );
        assert!(BindingType::StorageBuffer.is_buffer());
        assert!(!BindingType::Sampler2D.is_buffer());
    }
}
