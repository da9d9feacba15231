// Pixel and vertex formats understood by the backend

use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    Undefined,
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    R16Unorm,
    R16G16B16A16Sfloat,
    R32Uint,
    R32Sfloat,
    R32G32Sfloat,
    R32G32B32Sfloat,
    R32G32B32A32Sfloat,
    D16Unorm,
    X8D24UnormPack32,
    D32Sfloat,
    D24UnormS8Uint,
    D32SfloatS8Uint,
}

impl Format {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::Undefined => vk::Format::UNDEFINED,
            Self::R8Unorm => vk::Format::R8_UNORM,
            Self::R8G8Unorm => vk::Format::R8G8_UNORM,
            Self::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
            Self::R16Unorm => vk::Format::R16_UNORM,
            Self::R16G16B16A16Sfloat => vk::Format::R16G16B16A16_SFLOAT,
            Self::R32Uint => vk::Format::R32_UINT,
            Self::R32Sfloat => vk::Format::R32_SFLOAT,
            Self::R32G32Sfloat => vk::Format::R32G32_SFLOAT,
            Self::R32G32B32Sfloat => vk::Format::R32G32B32_SFLOAT,
            Self::R32G32B32A32Sfloat => vk::Format::R32G32B32A32_SFLOAT,
            Self::D16Unorm => vk::Format::D16_UNORM,
            Self::X8D24UnormPack32 => vk::Format::X8_D24_UNORM_PACK32,
            Self::D32Sfloat => vk::Format::D32_SFLOAT,
            Self::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
            Self::D32SfloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
        }
    }

    /// Reverse mapping, used for surface formats reported by the driver.
    pub fn from_vk(format: vk::Format) -> Option<Self> {
        const ALL: [Format; 18] = [
            Format::Undefined,
            Format::R8Unorm,
            Format::R8G8Unorm,
            Format::R8G8B8A8Unorm,
            Format::R8G8B8A8Srgb,
            Format::B8G8R8A8Unorm,
            Format::R16Unorm,
            Format::R16G16B16A16Sfloat,
            Format::R32Uint,
            Format::R32Sfloat,
            Format::R32G32Sfloat,
            Format::R32G32B32Sfloat,
            Format::R32G32B32A32Sfloat,
            Format::D16Unorm,
            Format::X8D24UnormPack32,
            Format::D32Sfloat,
            Format::D24UnormS8Uint,
            Format::D32SfloatS8Uint,
        ];
        ALL.into_iter().find(|f| f.to_vk() == format)
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Undefined => 0,
            Self::R8Unorm => 1,
            Self::R8G8Unorm | Self::R16Unorm | Self::D16Unorm => 2,
            Self::R8G8B8A8Unorm
            | Self::R8G8B8A8Srgb
            | Self::B8G8R8A8Unorm
            | Self::R32Uint
            | Self::R32Sfloat
            | Self::X8D24UnormPack32
            | Self::D32Sfloat
            | Self::D24UnormS8Uint => 4,
            Self::R16G16B16A16Sfloat | Self::R32G32Sfloat | Self::D32SfloatS8Uint => 8,
            Self::R32G32B32Sfloat => 12,
            Self::R32G32B32A32Sfloat => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::D16Unorm
                | Self::X8D24UnormPack32
                | Self::D32Sfloat
                | Self::D24UnormS8Uint
                | Self::D32SfloatS8Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Self::D24UnormS8Uint | Self::D32SfloatS8Uint)
    }

    pub fn aspect_flags(self) -> vk::ImageAspectFlags {
        if self.has_stencil() {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else if self.is_depth() {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_mapping_round_trips_through_table() {
        assert_eq!(Format::from_vk(vk::Format::B8G8R8A8_UNORM), Some(Format::B8G8R8A8Unorm));
        assert_eq!(Format::from_vk(vk::Format::D32_SFLOAT_S8_UINT), Some(Format::D32SfloatS8Uint));
        assert_eq!(Format::from_vk(vk::Format::ASTC_4X4_UNORM_BLOCK), None);
    }

    #[test]
    fn test_bytes_per_pixel() {
        assert_eq!(Format::R8G8B8A8Unorm.bytes_per_pixel(), 4);
        assert_eq!(Format::R32G32B32Sfloat.bytes_per_pixel(), 12);
        assert_eq!(Format::R8Unorm.bytes_per_pixel(), 1);
    }

    #[test]
    fn test_aspect_flags() {
        assert_eq!(Format::R8G8B8A8Unorm.aspect_flags(), vk::ImageAspectFlags::COLOR);
        assert_eq!(Format::D32Sfloat.aspect_flags(), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            Format::D24UnormS8Uint.aspect_flags(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
