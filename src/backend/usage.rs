// Usage bit flags for buffers and textures
//
// Backend-neutral flag sets consumed from resource params and mapped to
// Vulkan usage flags at creation time.

use ash::vk;
use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
        const TRANSIENT_ATTACHMENT = 1 << 6;
    }
}

const BUFFER_USAGE_VK: [(BufferUsage, vk::BufferUsageFlags); 6] = [
    (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
    (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
    (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
    (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
    (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
    (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
];

const TEXTURE_USAGE_VK: [(TextureUsage, vk::ImageUsageFlags); 7] = [
    (TextureUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
    (TextureUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
    (TextureUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
    (TextureUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
    (TextureUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
    (TextureUsage::DEPTH_STENCIL_ATTACHMENT, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT),
    (TextureUsage::TRANSIENT_ATTACHMENT, vk::ImageUsageFlags::TRANSIENT_ATTACHMENT),
];

impl BufferUsage {
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        BUFFER_USAGE_VK
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .fold(vk::BufferUsageFlags::empty(), |acc, (_, vk_flag)| acc | *vk_flag)
    }
}

impl TextureUsage {
    pub fn to_vk(self) -> vk::ImageUsageFlags {
        TEXTURE_USAGE_VK
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .fold(vk::ImageUsageFlags::empty(), |acc, (_, vk_flag)| acc | *vk_flag)
    }

    /// Format features an optimal-tiling image needs for this usage.
    pub fn required_format_features(self) -> vk::FormatFeatureFlags {
        let mut features = vk::FormatFeatureFlags::empty();
        if self.contains(Self::TRANSFER_SRC) {
            features |= vk::FormatFeatureFlags::TRANSFER_SRC;
        }
        if self.contains(Self::TRANSFER_DST) {
            features |= vk::FormatFeatureFlags::TRANSFER_DST;
        }
        if self.contains(Self::SAMPLED) {
            features |= vk::FormatFeatureFlags::SAMPLED_IMAGE;
        }
        if self.contains(Self::STORAGE) {
            features |= vk::FormatFeatureFlags::STORAGE_IMAGE;
        }
        if self.contains(Self::COLOR_ATTACHMENT) {
            features |= vk::FormatFeatureFlags::COLOR_ATTACHMENT;
        }
        if self.contains(Self::DEPTH_STENCIL_ATTACHMENT) {
            features |= vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usage_to_vk() {
        let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DST;
        assert_eq!(
            usage.to_vk(),
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert!(usage.contains(BufferUsage::VERTEX));
        assert!(!usage.contains(BufferUsage::UNIFORM));
    }

    #[test]
    fn test_every_buffer_flag_maps() {
        assert_eq!(
            BufferUsage::all().to_vk(),
            vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::UNIFORM_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::VERTEX_BUFFER
        );
    }

    #[test]
    fn test_texture_usage_features() {
        let usage = TextureUsage::SAMPLED | TextureUsage::COLOR_ATTACHMENT;
        assert_eq!(
            usage.required_format_features(),
            vk::FormatFeatureFlags::SAMPLED_IMAGE | vk::FormatFeatureFlags::COLOR_ATTACHMENT
        );
        assert_eq!(
            usage.to_vk(),
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::COLOR_ATTACHMENT
        );
        assert!(TextureUsage::empty().to_vk().is_empty());
    }

    #[test]
    fn test_transient_has_no_format_feature() {
        let usage = TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSIENT_ATTACHMENT;
        assert_eq!(
            usage.required_format_features(),
            vk::FormatFeatureFlags::COLOR_ATTACHMENT
        );
        assert!(usage.intersects(TextureUsage::TRANSIENT_ATTACHMENT));
    }
}
