//! vkgfx: a GPU backend abstraction over Vulkan.
//!
//! Frame lifecycle and presentation live in [`backend::VulkanContext`];
//! buffers, textures, render targets, programs and pipelines are created
//! against its device and recorded through the per-frame
//! [`backend::Recording`].

pub mod backend;
pub mod config;
