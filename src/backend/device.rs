// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Presentation surface (onscreen contexts only)
// - Physical device selection (prefer discrete GPU)
// - Logical device + graphics/present queues
// - Memory allocator, transient commands and the render pass cache

use super::command::TransientPool;
use super::error::{BackendError, BackendResult};
use super::format::Format;
use super::rendertarget::RenderPassCache;
use super::surface::{self, Surface, WindowHandles};
use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

const DEPTH_STENCIL_CANDIDATES: [Format; 2] = [Format::D24UnormS8Uint, Format::D32SfloatS8Uint];
const DEPTH_CANDIDATES: [Format; 3] = [Format::D16Unorm, Format::X8D24UnormPack32, Format::D32Sfloat];

/// Options for device creation
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub app_name: String,
    pub enable_validation: bool,
    pub window: Option<WindowHandles>,
    /// Timeout in nanoseconds for every blocking fence wait
    pub fence_timeout: u64,
}

/// Device limits exposed to the resource layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_color_attachments: u32,
    pub max_texture_dimension_1d: u32,
    pub max_texture_dimension_2d: u32,
    pub max_texture_dimension_3d: u32,
    pub max_texture_dimension_cube: u32,
    pub max_compute_work_group_count: [u32; 3],
    pub max_compute_work_group_invocations: u32,
    pub max_compute_work_group_size: [u32; 3],
    pub max_samples: u32,
}

impl Limits {
    pub fn from_properties(limits: &vk::PhysicalDeviceLimits) -> Self {
        let counts = limits.framebuffer_color_sample_counts
            & limits.framebuffer_depth_sample_counts;
        let max_samples = [64, 32, 16, 8, 4, 2]
            .into_iter()
            .find(|&n| counts.contains(vk::SampleCountFlags::from_raw(n)))
            .unwrap_or(1);

        Self {
            max_color_attachments: limits.max_color_attachments,
            max_texture_dimension_1d: limits.max_image_dimension1_d,
            max_texture_dimension_2d: limits.max_image_dimension2_d,
            max_texture_dimension_3d: limits.max_image_dimension3_d,
            max_texture_dimension_cube: limits.max_image_dimension_cube,
            max_compute_work_group_count: limits.max_compute_work_group_count,
            max_compute_work_group_invocations: limits.max_compute_work_group_invocations,
            max_compute_work_group_size: limits.max_compute_work_group_size,
            max_samples,
        }
    }
}

/// Cleanup for a device that failed half way through creation. Steps run
/// in reverse order of registration unless construction finished.
#[derive(Default)]
struct Unwind {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl Unwind {
    fn push(&mut self, step: impl FnOnce() + 'static) {
        self.steps.push(Box::new(step));
    }

    /// Ownership moved into the finished device.
    fn disarm(mut self) {
        self.steps.clear();
    }
}

impl Drop for Unwind {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            log::debug!("Destroying {} partially created device object(s)", self.steps.len());
        }
        while let Some(step) = self.steps.pop() {
            step();
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Dropped by hand before the logical device goes away
    allocator: ManuallyDrop<Mutex<Allocator>>,
    transient: Mutex<TransientPool>,
    render_passes: Mutex<RenderPassCache>,

    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    pub entry: Entry,
    pub surface: Option<Surface>,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue: vk::Queue,
    pub present_queue_family: u32,

    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub limits: Limits,
    pub fence_timeout: u64,
    preferred_depth_format: Format,
    preferred_depth_stencil_format: Format,
}

impl VulkanDevice {
    /// Create Vulkan device, with a presentation surface when window
    /// handles are given.
    pub fn new(options: &DeviceOptions) -> BackendResult<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", options.app_name);

        let entry = unsafe { Entry::load()? };

        let enable_validation =
            options.enable_validation && Self::validation_available(&entry);
        let instance = Self::create_instance(&entry, options, enable_validation)?;
        let mut unwind = Unwind::default();
        {
            let instance = instance.clone();
            unwind.push(move || unsafe { instance.destroy_instance(None) });
        }

        let debug_utils = if enable_validation {
            let (utils, messenger) = Self::setup_debug_messenger(&entry, &instance)?;
            let loader = utils.clone();
            unwind.push(move || unsafe { loader.destroy_debug_utils_messenger(messenger, None) });
            Some((utils, messenger))
        } else {
            None
        };

        let surface = match options.window {
            Some(handles) => {
                let surface = unsafe { surface::create_surface(&entry, &instance, handles)? };
                let (loader, handle) = (surface.loader.clone(), surface.surface);
                unwind.push(move || unsafe { loader.destroy_surface(handle, None) });
                Some(surface)
            }
            None => None,
        };

        let (physical_device, graphics_queue_family, present_queue_family) =
            Self::pick_physical_device(&instance, surface.as_ref())?;

        let (device, graphics_queue, present_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            present_queue_family,
            surface.is_some(),
        )?;
        {
            let device = device.clone();
            unwind.push(move || unsafe { device.destroy_device(None) });
        }

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;

        let transient = TransientPool::new(&device, graphics_queue_family)?;

        let supports = |format: Format, features: vk::FormatFeatureFlags| unsafe {
            instance
                .get_physical_device_format_properties(physical_device, format.to_vk())
                .optimal_tiling_features
                .contains(features)
        };
        let depth_feature = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
        let preferred_depth_format = DEPTH_CANDIDATES
            .into_iter()
            .find(|&f| supports(f, depth_feature))
            .unwrap_or(Format::D32Sfloat);
        let preferred_depth_stencil_format = DEPTH_STENCIL_CANDIDATES
            .into_iter()
            .find(|&f| supports(f, depth_feature))
            .unwrap_or(Format::D32SfloatS8Uint);
        log::debug!(
            "Preferred depth formats: {:?} / {:?}",
            preferred_depth_format,
            preferred_depth_stencil_format
        );

        unwind.disarm();
        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            transient: Mutex::new(transient),
            render_passes: Mutex::new(RenderPassCache::default()),
            device,
            physical_device,
            instance,
            entry,
            surface,
            graphics_queue,
            graphics_queue_family,
            present_queue,
            present_queue_family,
            debug_utils,
            limits: Limits::from_properties(&properties.limits),
            properties,
            memory_properties,
            fence_timeout: options.fence_timeout,
            preferred_depth_format,
            preferred_depth_stencil_format,
        }))
    }

    fn validation_available(entry: &Entry) -> bool {
        let layers = unsafe { entry.enumerate_instance_layer_properties() }.unwrap_or_default();
        let found = layers
            .iter()
            .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER);
        if !found {
            log::warn!("Validation requested but {:?} is not installed", VALIDATION_LAYER);
        }
        found
    }

    fn create_instance(
        entry: &Entry,
        options: &DeviceOptions,
        enable_validation: bool,
    ) -> BackendResult<ash::Instance> {
        let app_name_cstr = CString::new(options.app_name.as_str())
            .map_err(|e| BackendError::invalid_usage(e.to_string()))?;
        let engine_name = c"vkgfx";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let mut extensions = Vec::new();
        if enable_validation {
            extensions.push(ash::extensions::ext::DebugUtils::name().as_ptr());
        }
        if let Some(window) = &options.window {
            for name in surface::required_extensions(window.display)? {
                extensions.push(name.as_ptr());
            }
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None)? };
        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> BackendResult<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface: Option<&Surface>,
    ) -> BackendResult<(vk::PhysicalDevice, u32, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices()? };

        if devices.is_empty() {
            return Err(BackendError::UnsupportedFeature(
                "no Vulkan-capable GPU found".into(),
            ));
        }

        let mut best_device = None;
        let mut best_score = 0;

        for device in devices {
            let props = unsafe { instance.get_physical_device_properties(device) };
            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(device) };

            let graphics_family = queue_families
                .iter()
                .position(|props| props.queue_flags.contains(vk::QueueFlags::GRAPHICS))
                .map(|i| i as u32);
            let Some(graphics_family) = graphics_family else {
                continue;
            };

            let present_family = match surface {
                None => Some(graphics_family),
                Some(surface) => {
                    let supports = |family: u32| unsafe {
                        surface
                            .loader
                            .get_physical_device_surface_support(device, family, surface.surface)
                            .unwrap_or(false)
                    };
                    // Prefer presenting from the graphics queue
                    if supports(graphics_family) {
                        Some(graphics_family)
                    } else {
                        (0..queue_families.len() as u32).find(|&f| supports(f))
                    }
                }
            };
            let Some(present_family) = present_family else {
                continue;
            };

            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best_device = Some((device, graphics_family, present_family));
            }
        }

        best_device.ok_or_else(|| BackendError::UnsupportedFeature("no suitable GPU found".into()))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        present_queue_family: u32,
        onscreen: bool,
    ) -> BackendResult<(ash::Device, vk::Queue, vk::Queue)> {
        let queue_priorities = [1.0];
        let mut queue_create_infos = vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities)
            .build()];
        if present_queue_family != graphics_queue_family {
            queue_create_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(present_queue_family)
                    .queue_priorities(&queue_priorities)
                    .build(),
            );
        }

        let mut extensions = Vec::new();
        if onscreen {
            extensions.push(ash::extensions::khr::Swapchain::name().as_ptr());
        }

        let available = unsafe { instance.get_physical_device_features(physical_device) };
        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: available.sampler_anisotropy,
            fill_mode_non_solid: available.fill_mode_non_solid,
            ..Default::default()
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None)? };

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        Ok((device, graphics_queue, present_queue))
    }

    /// Locks the memory allocator
    pub fn allocator(&self) -> parking_lot::MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    pub fn render_passes(&self) -> parking_lot::MutexGuard<'_, RenderPassCache> {
        self.render_passes.lock()
    }

    pub fn begin_transient_command(&self) -> BackendResult<vk::CommandBuffer> {
        self.transient.lock().begin(&self.device)
    }

    pub fn execute_transient_command(&self, cmd: vk::CommandBuffer) -> BackendResult<()> {
        self.transient
            .lock()
            .execute(&self.device, self.graphics_queue, cmd, self.fence_timeout)
    }

    pub fn format_features(&self, format: Format) -> vk::FormatFeatureFlags {
        unsafe {
            self.instance
                .get_physical_device_format_properties(self.physical_device, format.to_vk())
                .optimal_tiling_features
        }
    }

    pub fn supports_format(&self, format: Format, features: vk::FormatFeatureFlags) -> bool {
        self.format_features(format).contains(features)
    }

    pub fn preferred_depth_format(&self) -> Format {
        self.preferred_depth_format
    }

    pub fn preferred_depth_stencil_format(&self) -> Format {
        self.preferred_depth_stencil_format
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> BackendResult<()> {
        unsafe { self.device.device_wait_idle()? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            self.render_passes.get_mut().destroy(&self.device);
            self.transient.get_mut().destroy(&self.device);
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                surface.destroy();
            }
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recording_unwind(log: &Rc<RefCell<Vec<&'static str>>>) -> Unwind {
        let mut unwind = Unwind::default();
        for name in ["instance", "messenger", "surface", "device"] {
            let log = Rc::clone(log);
            unwind.push(move || log.borrow_mut().push(name));
        }
        unwind
    }

    #[test]
    fn test_unwind_destroys_in_reverse_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            // Construction bails out with everything registered so far
            let _unwind = recording_unwind(&log);
        }
        assert_eq!(*log.borrow(), ["device", "surface", "messenger", "instance"]);
    }

    #[test]
    fn test_disarmed_unwind_destroys_nothing() {
        let log = Rc::new(RefCell::new(Vec::new()));
        recording_unwind(&log).disarm();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_limits_pick_highest_common_sample_count() {
        let limits = vk::PhysicalDeviceLimits {
            framebuffer_color_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
            framebuffer_depth_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_4,
            max_color_attachments: 8,
            ..Default::default()
        };
        let limits = Limits::from_properties(&limits);
        assert_eq!(limits.max_samples, 4);
        assert_eq!(limits.max_color_attachments, 8);
    }
}
