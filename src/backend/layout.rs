// Image layout state machine
//
// Every texture remembers the layout established by its last transition.
// A transition to the layout it is already in records nothing.

use ash::vk;
use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ColorAttachment,
    DepthAttachment,
    TransferSrc,
    TransferDst,
    ShaderReadOnly,
    Present,
}

impl ImageLayout {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            Self::Undefined => vk::ImageLayout::UNDEFINED,
            Self::General => vk::ImageLayout::GENERAL,
            Self::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            Self::DepthAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            Self::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Self::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Self::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Self::Present => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Accesses that may touch an image while it sits in this layout.
    pub fn access_mask(self) -> vk::AccessFlags {
        match self {
            Self::Undefined => vk::AccessFlags::empty(),
            Self::General => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            Self::ColorAttachment => {
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            }
            Self::DepthAttachment => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
            Self::TransferSrc => vk::AccessFlags::TRANSFER_READ,
            Self::TransferDst => vk::AccessFlags::TRANSFER_WRITE,
            Self::ShaderReadOnly => {
                vk::AccessFlags::SHADER_READ | vk::AccessFlags::INPUT_ATTACHMENT_READ
            }
            Self::Present => vk::AccessFlags::MEMORY_READ,
        }
    }
}

/// A planned layout change, not yet recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBarrier {
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl LayoutBarrier {
    pub fn new(old_layout: ImageLayout, new_layout: ImageLayout) -> Self {
        Self {
            old_layout,
            new_layout,
            src_access: old_layout.access_mask(),
            dst_access: new_layout.access_mask(),
        }
    }

    pub fn record(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .old_layout(self.old_layout.to_vk())
            .new_layout(self.new_layout.to_vk())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(range)
            .build();

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

/// Tracked layout of one image.
#[derive(Debug, Default)]
pub struct LayoutState {
    current: Cell<ImageLayout>,
}

impl LayoutState {
    pub fn new(initial: ImageLayout) -> Self {
        Self {
            current: Cell::new(initial),
        }
    }

    pub fn current(&self) -> ImageLayout {
        self.current.get()
    }

    /// Moves the tracked layout to `target` and returns the barrier to
    /// record, or `None` when nothing changes.
    pub fn transition(&self, target: ImageLayout) -> Option<LayoutBarrier> {
        let old = self.current.replace(target);
        (old != target).then(|| LayoutBarrier::new(old, target))
    }

    /// Records a layout change done implicitly by a render pass.
    pub fn assume(&self, layout: ImageLayout) {
        self.current.set(layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_transition_yields_one_barrier() {
        let state = LayoutState::new(ImageLayout::Undefined);
        let first = state.transition(ImageLayout::TransferDst);
        let second = state.transition(ImageLayout::TransferDst);
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(state.current(), ImageLayout::TransferDst);
    }

    #[test]
    fn test_barrier_access_masks() {
        let barrier = LayoutBarrier::new(ImageLayout::TransferDst, ImageLayout::ShaderReadOnly);
        assert_eq!(barrier.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(
            barrier.dst_access,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::INPUT_ATTACHMENT_READ
        );

        let barrier = LayoutBarrier::new(ImageLayout::Undefined, ImageLayout::ColorAttachment);
        assert!(barrier.src_access.is_empty());
    }

    #[test]
    fn test_present_and_depth_mapping() {
        assert_eq!(ImageLayout::Present.to_vk(), vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(
            ImageLayout::DepthAttachment.to_vk(),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn test_assume_updates_without_barrier() {
        let state = LayoutState::new(ImageLayout::Undefined);
        state.assume(ImageLayout::ColorAttachment);
        assert!(state.transition(ImageLayout::ColorAttachment).is_none());
    }
}
