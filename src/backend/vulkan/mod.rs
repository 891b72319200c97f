//! Vulkan backend implementation using ash
//!
//! Vulkan 1.3 with dynamic rendering: render passes are begun directly on
//! image views, and every layout transition the render graph plans is
//! recorded as an explicit image memory barrier. WGSL shaders are translated
//! to SPIR-V with naga.

mod barriers;
mod shader;

use barriers::BarrierBatch;

use crate::backend::traits::*;
use crate::backend::types::*;
use ash::khr::{dynamic_rendering, surface, swapchain};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::Arc;

/// Vulkan backend implementation
pub struct VulkanBackend {
    _entry: ash::Entry,
    instance: ash::Instance,
    surface_fn: surface::Instance,
    swapchain_fn: swapchain::Device,
    dynamic_rendering: dynamic_rendering::Device,
    surface: vk::SurfaceKHR,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    graphics_queue_family: u32,
    allocator: Option<Allocator>,

    // Swapchain
    swapchain: vk::SwapchainKHR,
    swapchain_images: Vec<vk::Image>,
    swapchain_image_views: Vec<vk::ImageView>,
    swapchain_format: vk::Format,
    swapchain_extent: vk::Extent2D,
    current_image_index: u32,
    /// Handle id of the acquired swapchain image, `None` between frames
    swapchain_view_id: Option<u64>,

    // Synchronization, one frame in flight
    image_available_semaphore: vk::Semaphore,
    /// One per swapchain image
    render_finished_semaphores: Vec<vk::Semaphore>,
    in_flight_fence: vk::Fence,

    // Command pool and buffer
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    is_recording: bool,
    in_render_pass: bool,
    bound_pipeline_layout: Option<vk::PipelineLayout>,

    // Resource storage
    buffers: HashMap<u64, VkBuffer>,
    textures: HashMap<u64, VkTexture>,
    texture_views: HashMap<u64, VkTextureView>,
    samplers: HashMap<u64, vk::Sampler>,
    descriptor_set_layouts: HashMap<u64, vk::DescriptorSetLayout>,
    descriptor_sets: HashMap<u64, vk::DescriptorSet>,
    render_pipelines: HashMap<u64, VkRenderPipeline>,

    descriptor_pool: vk::DescriptorPool,

    // Handle counters
    next_buffer_id: u64,
    next_texture_id: u64,
    next_view_id: u64,
    next_sampler_id: u64,
    next_layout_id: u64,
    next_bind_group_id: u64,
    next_render_pipeline_id: u64,

    vsync: bool,
}

struct VkBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

struct VkTexture {
    image: vk::Image,
    allocation: Allocation,
    format: vk::Format,
    extent: vk::Extent2D,
}

struct VkTextureView {
    view: vk::ImageView,
    texture: u64,
}

/// Everything recording needs to know about a resolved view handle
#[derive(Clone, Copy)]
struct ViewInfo {
    view: vk::ImageView,
    image: vk::Image,
    format: vk::Format,
    extent: vk::Extent2D,
}

struct VkRenderPipeline {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

/// Resolved descriptor contents of one bind group entry
enum DescriptorInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo, vk::DescriptorType),
}

fn vk_err(kind: fn(String) -> BackendError) -> impl Fn(vk::Result) -> BackendError {
    move |e| kind(format!("{e:?}"))
}

impl VulkanBackend {
    /// Get the Vulkan instance
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan device
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the graphics queue
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    pub fn vk_swapchain_format(&self) -> vk::Format {
        self.swapchain_format
    }

    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain_extent
    }

    fn convert_format(format: TextureFormat) -> vk::Format {
        match format {
            TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            TextureFormat::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
            TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
            TextureFormat::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
            TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
            TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
            TextureFormat::R32Float => vk::Format::R32_SFLOAT,
            TextureFormat::Depth16Unorm => vk::Format::D16_UNORM,
            TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
            TextureFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
        }
    }

    fn convert_format_back(format: vk::Format) -> TextureFormat {
        match format {
            vk::Format::R8G8B8A8_UNORM => TextureFormat::Rgba8Unorm,
            vk::Format::R8G8B8A8_SRGB => TextureFormat::Rgba8UnormSrgb,
            vk::Format::B8G8R8A8_UNORM => TextureFormat::Bgra8Unorm,
            vk::Format::B8G8R8A8_SRGB => TextureFormat::Bgra8UnormSrgb,
            vk::Format::R16G16B16A16_SFLOAT => TextureFormat::Rgba16Float,
            vk::Format::R32G32B32A32_SFLOAT => TextureFormat::Rgba32Float,
            vk::Format::R32_SFLOAT => TextureFormat::R32Float,
            vk::Format::D16_UNORM => TextureFormat::Depth16Unorm,
            vk::Format::D32_SFLOAT => TextureFormat::Depth32Float,
            vk::Format::D24_UNORM_S8_UINT => TextureFormat::Depth24PlusStencil8,
            _ => TextureFormat::Rgba8Unorm,
        }
    }

    fn convert_compare_op(func: CompareFunction) -> vk::CompareOp {
        match func {
            CompareFunction::Never => vk::CompareOp::NEVER,
            CompareFunction::Less => vk::CompareOp::LESS,
            CompareFunction::Equal => vk::CompareOp::EQUAL,
            CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareFunction::Greater => vk::CompareOp::GREATER,
            CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareFunction::Always => vk::CompareOp::ALWAYS,
        }
    }

    fn convert_filter(mode: FilterMode) -> vk::Filter {
        match mode {
            FilterMode::Nearest => vk::Filter::NEAREST,
            FilterMode::Linear => vk::Filter::LINEAR,
        }
    }

    fn convert_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
        match mode {
            AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
            AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        }
    }

    fn convert_shader_stages(stages: ShaderStageFlags) -> vk::ShaderStageFlags {
        let mut result = vk::ShaderStageFlags::empty();
        if stages.contains(ShaderStageFlags::VERTEX) {
            result |= vk::ShaderStageFlags::VERTEX;
        }
        if stages.contains(ShaderStageFlags::FRAGMENT) {
            result |= vk::ShaderStageFlags::FRAGMENT;
        }
        result
    }

    fn convert_vertex_format(format: VertexFormat) -> vk::Format {
        match format {
            VertexFormat::Float32 => vk::Format::R32_SFLOAT,
            VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
            VertexFormat::Uint32 => vk::Format::R32_UINT,
        }
    }

    fn convert_color_target(target: &ColorTargetState) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::from_raw(target.write_mask.bits()))
            .blend_enable(false)
    }

    fn convert_load_op(op: &LoadOp) -> vk::AttachmentLoadOp {
        match op {
            LoadOp::Clear(_) => vk::AttachmentLoadOp::CLEAR,
            LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        }
    }

    fn convert_store_op(op: StoreOp) -> vk::AttachmentStoreOp {
        match op {
            StoreOp::Store => vk::AttachmentStoreOp::STORE,
            StoreOp::Discard => vk::AttachmentStoreOp::DONT_CARE,
        }
    }

    fn find_queue_family(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Option<u32> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        queue_families.iter().enumerate().find_map(|(index, family)| {
            let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
            let supports_surface = unsafe {
                surface_fn
                    .get_physical_device_surface_support(physical_device, index as u32, surface)
                    .unwrap_or(false)
            };
            (supports_graphics && supports_surface).then_some(index as u32)
        })
    }

    /// Pick the best Vulkan 1.3 device that can present to `surface`.
    ///
    /// Prefers discrete GPUs over integrated GPUs.
    fn select_physical_device(
        instance: &ash::Instance,
        surface_fn: &surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> BackendResult<(vk::PhysicalDevice, u32)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(vk_err(BackendError::InitializationFailed))?;

        let mut best = None;
        let mut best_score = 0;

        for device in devices {
            let properties = unsafe { instance.get_physical_device_properties(device) };
            let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };

            if properties.api_version < vk::API_VERSION_1_3 {
                log::debug!("Skipping GPU {:?}: Vulkan 1.3 not supported", device_name);
                continue;
            }
            let Some(queue_family) = Self::find_queue_family(instance, device, surface_fn, surface)
            else {
                continue;
            };

            let mut score = 1;
            if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
                score += 1000;
            } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
                score += 100;
            }

            log::info!(
                "Found GPU: {:?} (type: {:?}, score: {})",
                device_name,
                properties.device_type,
                score
            );

            if score > best_score {
                best_score = score;
                best = Some((device, queue_family));
            }
        }

        best.ok_or_else(|| BackendError::InitializationFailed("No suitable physical device".into()))
    }

    fn create_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        unsafe {
            self.device.device_wait_idle().ok();

            // Clean up old swapchain resources
            for &view in &self.swapchain_image_views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_image_views.clear();
            for &semaphore in &self.render_finished_semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.render_finished_semaphores.clear();
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_fn.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }

            let capabilities = self
                .surface_fn
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(vk_err(BackendError::SwapchainCreationFailed))?;

            let formats = self
                .surface_fn
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(vk_err(BackendError::SwapchainCreationFailed))?;

            let present_modes = self
                .surface_fn
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(vk_err(BackendError::SwapchainCreationFailed))?;

            // Prefer SRGB
            let format = formats
                .iter()
                .find(|f| {
                    f.format == vk::Format::B8G8R8A8_SRGB
                        && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
                })
                .or_else(|| formats.first())
                .copied()
                .ok_or_else(|| {
                    BackendError::SwapchainCreationFailed("surface reports no formats".into())
                })?;

            let present_mode = if self.vsync {
                vk::PresentModeKHR::FIFO
            } else {
                present_modes
                    .iter()
                    .copied()
                    .find(|&m| m == vk::PresentModeKHR::MAILBOX)
                    .unwrap_or(vk::PresentModeKHR::FIFO)
            };

            let extent = if capabilities.current_extent.width != u32::MAX {
                capabilities.current_extent
            } else {
                vk::Extent2D {
                    width: width.clamp(
                        capabilities.min_image_extent.width,
                        capabilities.max_image_extent.width,
                    ),
                    height: height.clamp(
                        capabilities.min_image_extent.height,
                        capabilities.max_image_extent.height,
                    ),
                }
            };

            let image_count = (capabilities.min_image_count + 1).min(
                if capabilities.max_image_count > 0 {
                    capabilities.max_image_count
                } else {
                    u32::MAX
                },
            );

            let swapchain_info = vk::SwapchainCreateInfoKHR::default()
                .surface(self.surface)
                .min_image_count(image_count)
                .image_format(format.format)
                .image_color_space(format.color_space)
                .image_extent(extent)
                .image_array_layers(1)
                .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
                .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
                .pre_transform(capabilities.current_transform)
                .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
                .present_mode(present_mode)
                .clipped(true);

            self.swapchain = self
                .swapchain_fn
                .create_swapchain(&swapchain_info, None)
                .map_err(vk_err(BackendError::SwapchainCreationFailed))?;

            self.swapchain_images = self
                .swapchain_fn
                .get_swapchain_images(self.swapchain)
                .map_err(vk_err(BackendError::SwapchainCreationFailed))?;

            self.swapchain_format = format.format;
            self.swapchain_extent = extent;

            for &image in &self.swapchain_images {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(format.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                let view = self
                    .device
                    .create_image_view(&view_info, None)
                    .map_err(vk_err(BackendError::SwapchainCreationFailed))?;
                self.swapchain_image_views.push(view);

                let semaphore = self
                    .device
                    .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                    .map_err(vk_err(BackendError::SwapchainCreationFailed))?;
                self.render_finished_semaphores.push(semaphore);
            }

            log::info!(
                "Vulkan swapchain: {}x{}, {:?}, {:?}, {} images",
                extent.width,
                extent.height,
                format.format,
                present_mode,
                self.swapchain_images.len()
            );

            Ok(())
        }
    }

    fn resolve_view(&self, handle: TextureViewHandle) -> BackendResult<ViewInfo> {
        if self.swapchain_view_id == Some(handle.0) {
            let index = self.current_image_index as usize;
            return Ok(ViewInfo {
                view: self.swapchain_image_views[index],
                image: self.swapchain_images[index],
                format: self.swapchain_format,
                extent: self.swapchain_extent,
            });
        }

        let view = self
            .texture_views
            .get(&handle.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture view {}", handle.0)))?;
        let texture = self.textures.get(&view.texture).ok_or_else(|| {
            BackendError::InvalidHandle(format!("texture {} of view {}", view.texture, handle.0))
        })?;

        Ok(ViewInfo {
            view: view.view,
            image: texture.image,
            format: texture.format,
            extent: texture.extent,
        })
    }

    /// Command buffer to record draw state into, `None` outside of a render pass
    fn pass_command_buffer(&self) -> Option<vk::CommandBuffer> {
        if self.in_render_pass {
            Some(self.command_buffer)
        } else {
            log::warn!("Vulkan: render command recorded outside of a render pass");
            None
        }
    }

    fn allocate(
        &mut self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation, String> {
        self.allocator
            .as_mut()
            .ok_or_else(|| "Allocator not available".to_string())?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| e.to_string())
    }

    fn free(&mut self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::warn!("Vulkan: failed to free allocation: {}", e);
            }
        }
    }

    fn create_raw_buffer(
        &mut self,
        name: &str,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> BackendResult<(vk::Buffer, Allocation)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size.max(4))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(vk_err(BackendError::BufferCreationFailed))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(name, requirements, location, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(BackendError::BufferCreationFailed(e));
            }
        };

        if let Err(e) =
            unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation);
            return Err(BackendError::BufferCreationFailed(format!("{e:?}")));
        }

        Ok((buffer, allocation))
    }

    /// Copy `data` into a device-local buffer through a temporary staging buffer
    fn upload_via_staging(&mut self, dst: vk::Buffer, offset: u64, data: &[u8]) -> BackendResult<()> {
        let (staging, mut allocation) = self.create_raw_buffer(
            "staging",
            data.len() as u64,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;

        let result = match allocation.mapped_slice_mut() {
            Some(mapped) => {
                mapped[..data.len()].copy_from_slice(data);
                self.submit_one_time(|device, cmd| unsafe {
                    let region = vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: offset,
                        size: data.len() as u64,
                    };
                    device.cmd_copy_buffer(cmd, staging, dst, &[region]);
                })
            }
            None => Err(BackendError::BufferCreationFailed(
                "staging buffer is not host visible".into(),
            )),
        };

        unsafe { self.device.destroy_buffer(staging, None) };
        self.free(allocation);
        result
    }

    /// Record `record` into a throwaway command buffer and wait for it to execute
    fn submit_one_time(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> BackendResult<()> {
        let map = vk_err(BackendError::CommandRecordingFailed);
        unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(self.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = self.device.allocate_command_buffers(&alloc_info).map_err(&map)?[0];

            let result = (|| {
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                self.device.begin_command_buffer(cmd, &begin_info).map_err(&map)?;
                record(&self.device, cmd);
                self.device.end_command_buffer(cmd).map_err(&map)?;

                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
                self.device
                    .queue_submit(self.graphics_queue, &[submit_info], vk::Fence::null())
                    .map_err(&map)?;
                self.device.queue_wait_idle(self.graphics_queue).map_err(&map)
            })();

            self.device.free_command_buffers(self.command_pool, &[cmd]);
            result
        }
    }
}

impl VulkanBackend {
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let app_info = vk::ApplicationInfo::default()
                .application_name(c"Shadowmap Renderer")
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(c"Shadowmap Renderer")
                .engine_version(vk::make_api_version(0, 1, 0, 0))
                .api_version(vk::API_VERSION_1_3);

            let display_handle = window
                .display_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
            let window_handle = window
                .window_handle()
                .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
                .map_err(vk_err(BackendError::InitializationFailed))?;

            let instance_info = vk::InstanceCreateInfo::default()
                .application_info(&app_info)
                .enabled_extension_names(extensions);

            let instance = entry
                .create_instance(&instance_info, None)
                .map_err(vk_err(BackendError::InitializationFailed))?;

            let surface_fn = surface::Instance::new(&entry, &instance);
            let surface = ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(vk_err(BackendError::SurfaceCreationFailed))?;

            let (physical_device, graphics_queue_family) =
                Self::select_physical_device(&instance, &surface_fn, surface)?;

            let queue_priorities = [1.0f32];
            let queue_infos = [vk::DeviceQueueCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .queue_priorities(&queue_priorities)];

            let device_extensions = [swapchain::NAME.as_ptr(), dynamic_rendering::NAME.as_ptr()];
            let features = vk::PhysicalDeviceFeatures::default();
            let mut vulkan_13_features =
                vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

            let device_info = vk::DeviceCreateInfo::default()
                .queue_create_infos(&queue_infos)
                .enabled_extension_names(&device_extensions)
                .enabled_features(&features)
                .push_next(&mut vulkan_13_features);

            let device = instance
                .create_device(physical_device, &device_info, None)
                .map_err(vk_err(BackendError::DeviceCreationFailed))?;

            let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.clone(),
                device: device.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;

            let swapchain_fn = swapchain::Device::new(&instance, &device);
            let dynamic_rendering = dynamic_rendering::Device::new(&instance, &device);

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

            let command_pool = device
                .create_command_pool(&pool_info, None)
                .map_err(vk_err(BackendError::InitializationFailed))?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);

            let command_buffer = device
                .allocate_command_buffers(&alloc_info)
                .map_err(vk_err(BackendError::InitializationFailed))?[0];

            let image_available_semaphore = device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .map_err(vk_err(BackendError::InitializationFailed))?;
            let in_flight_fence = device
                .create_fence(
                    &vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED),
                    None,
                )
                .map_err(vk_err(BackendError::InitializationFailed))?;

            let pool_sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: 256,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: 256,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLER,
                    descriptor_count: 256,
                },
            ];

            let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
                .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                .max_sets(256)
                .pool_sizes(&pool_sizes);

            let descriptor_pool = device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(vk_err(BackendError::InitializationFailed))?;

            let mut backend = Self {
                _entry: entry,
                instance,
                surface_fn,
                swapchain_fn,
                dynamic_rendering,
                surface,
                physical_device,
                device,
                graphics_queue,
                graphics_queue_family,
                allocator: Some(allocator),
                swapchain: vk::SwapchainKHR::null(),
                swapchain_images: Vec::new(),
                swapchain_image_views: Vec::new(),
                swapchain_format: vk::Format::B8G8R8A8_SRGB,
                swapchain_extent: vk::Extent2D { width: 0, height: 0 },
                current_image_index: 0,
                swapchain_view_id: None,
                image_available_semaphore,
                render_finished_semaphores: Vec::new(),
                in_flight_fence,
                command_pool,
                command_buffer,
                is_recording: false,
                in_render_pass: false,
                bound_pipeline_layout: None,
                buffers: HashMap::new(),
                textures: HashMap::new(),
                texture_views: HashMap::new(),
                samplers: HashMap::new(),
                descriptor_set_layouts: HashMap::new(),
                descriptor_sets: HashMap::new(),
                render_pipelines: HashMap::new(),
                descriptor_pool,
                next_buffer_id: 1,
                next_texture_id: 1,
                next_view_id: 1,
                next_sampler_id: 1,
                next_layout_id: 1,
                next_bind_group_id: 1,
                next_render_pipeline_id: 1,
                vsync,
            };

            let size = window.inner_size();
            backend.create_swapchain(size.width.max(1), size.height.max(1))?;

            Ok(backend)
        }
    }
}

impl GraphicsBackend for VulkanBackend {
    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            if let Err(e) = self.create_swapchain(width, height) {
                log::error!("Vulkan: swapchain recreation failed: {}", e);
            }
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.swapchain_extent.width, self.swapchain_extent.height)
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        if self.is_recording {
            return Err(BackendError::CommandRecordingFailed(
                "frame begun while another frame is recording".into(),
            ));
        }

        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
                .map_err(vk_err(BackendError::AcquireImageFailed))?;

            let acquired = self.swapchain_fn.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available_semaphore,
                vk::Fence::null(),
            );
            let image_index = match acquired {
                Ok((index, _)) => index,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    let (width, height) = self.surface_size();
                    self.create_swapchain(width, height)?;
                    return Err(BackendError::SurfaceLost);
                }
                Err(vk::Result::ERROR_DEVICE_LOST) => return Err(BackendError::DeviceLost),
                Err(e) => return Err(BackendError::AcquireImageFailed(format!("{e:?}"))),
            };

            self.current_image_index = image_index;

            self.device
                .reset_fences(&[self.in_flight_fence])
                .map_err(vk_err(BackendError::AcquireImageFailed))?;

            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(vk_err(BackendError::CommandRecordingFailed))?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(vk_err(BackendError::CommandRecordingFailed))?;
        }

        self.is_recording = true;

        // The swapchain image gets a fresh view id every frame
        let view_id = self.next_view_id;
        self.next_view_id += 1;
        self.swapchain_view_id = Some(view_id);

        Ok(FrameContext {
            swapchain_view: TextureViewHandle(view_id),
            width: self.swapchain_extent.width,
            height: self.swapchain_extent.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.is_recording {
            return Err(BackendError::PresentFailed("no frame in flight".into()));
        }

        unsafe {
            if self.in_render_pass {
                log::warn!("Vulkan: frame ended inside a render pass");
                self.dynamic_rendering.cmd_end_rendering(self.command_buffer);
                self.in_render_pass = false;
            }

            self.is_recording = false;
            self.swapchain_view_id = None;
            self.bound_pipeline_layout = None;

            self.device
                .end_command_buffer(self.command_buffer)
                .map_err(vk_err(BackendError::CommandRecordingFailed))?;

            let wait_semaphores = [self.image_available_semaphore];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semaphores = [self.render_finished_semaphores[self.current_image_index as usize]];
            let command_buffers = [self.command_buffer];

            let submit_info = vk::SubmitInfo::default()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);

            self.device
                .queue_submit(self.graphics_queue, &[submit_info], self.in_flight_fence)
                .map_err(|e| match e {
                    vk::Result::ERROR_DEVICE_LOST => BackendError::DeviceLost,
                    _ => BackendError::PresentFailed(format!("{e:?}")),
                })?;

            let swapchains = [self.swapchain];
            let image_indices = [self.current_image_index];
            let present_info = vk::PresentInfoKHR::default()
                .wait_semaphores(&signal_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);

            match self.swapchain_fn.queue_present(self.graphics_queue, &present_info) {
                Ok(false) => Ok(()),
                Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    log::debug!("Vulkan: swapchain out of date, recreating");
                    let (width, height) = self.surface_size();
                    self.create_swapchain(width, height)
                }
                Err(e) => Err(BackendError::PresentFailed(format!("{e:?}"))),
            }
        }
    }

    fn swapchain_format(&self) -> TextureFormat {
        Self::convert_format_back(self.swapchain_format)
    }

    fn wait_idle(&mut self) {
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::error!("Vulkan: device_wait_idle failed: {:?}", e);
        }
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let mut usage = vk::BufferUsageFlags::empty();
        if desc.usage.contains(BufferUsage::VERTEX) {
            usage |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if desc.usage.contains(BufferUsage::INDEX) {
            usage |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if desc.usage.contains(BufferUsage::UNIFORM) {
            usage |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if desc.usage.contains(BufferUsage::STORAGE) {
            usage |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if desc.usage.contains(BufferUsage::COPY_SRC) {
            usage |= vk::BufferUsageFlags::TRANSFER_SRC;
        }

        let host_visible = desc.host_visible
            || desc.usage.contains(BufferUsage::MAP_READ)
            || desc.usage.contains(BufferUsage::MAP_WRITE);

        // Device-local buffers are filled through staging copies
        let location = if host_visible {
            MemoryLocation::CpuToGpu
        } else {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
            MemoryLocation::GpuOnly
        };
        if desc.usage.contains(BufferUsage::COPY_DST) {
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }

        let (buffer, allocation) = self.create_raw_buffer(
            desc.label.as_deref().unwrap_or("buffer"),
            desc.size,
            usage,
            location,
        )?;

        let id = self.next_buffer_id;
        self.next_buffer_id += 1;
        self.buffers.insert(
            id,
            VkBuffer {
                buffer,
                allocation,
                size: desc.size,
            },
        );

        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        if let Err(e) = self.write_buffer(handle, 0, data) {
            self.destroy_buffer(handle);
            return Err(e);
        }
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()> {
        let vk_buffer = self
            .buffers
            .get(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))?;

        if offset + data.len() as u64 > vk_buffer.size {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} bytes at {} overflows buffer {} ({} bytes)",
                data.len(),
                offset,
                buffer.0,
                vk_buffer.size
            )));
        }

        if vk_buffer.allocation.mapped_ptr().is_none() {
            let dst = vk_buffer.buffer;
            return self.upload_via_staging(dst, offset, data);
        }

        // Wait for the previous frame before touching memory it may still read
        if !self.is_recording {
            unsafe { self.device.wait_for_fences(&[self.in_flight_fence], true, u64::MAX) }
                .map_err(vk_err(BackendError::BufferCreationFailed))?;
        }

        let start = offset as usize;
        let vk_buffer = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("buffer {}", buffer.0)))?;
        let mapped = vk_buffer.allocation.mapped_slice_mut().ok_or_else(|| {
            BackendError::BufferCreationFailed(format!("buffer {} is not mapped", buffer.0))
        })?;
        mapped[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        let format = Self::convert_format(desc.format);
        let is_depth = desc.format.is_depth();

        let mut usage = vk::ImageUsageFlags::empty();
        if desc.usage.contains(TextureUsage::COPY_SRC) {
            usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if desc.usage.contains(TextureUsage::COPY_DST) {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        if desc.usage.contains(TextureUsage::TEXTURE_BINDING) {
            usage |= vk::ImageUsageFlags::SAMPLED;
        }
        if desc.usage.contains(TextureUsage::STORAGE_BINDING) {
            usage |= vk::ImageUsageFlags::STORAGE;
        }
        if desc.usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            if is_depth {
                usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
            } else {
                usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            }
        }

        let extent = vk::Extent2D {
            width: desc.width,
            height: desc.height,
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe { self.device.create_image(&image_info, None) }
            .map_err(vk_err(BackendError::TextureCreationFailed))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(
            desc.label.as_deref().unwrap_or("texture"),
            requirements,
            MemoryLocation::GpuOnly,
            false,
        ) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(BackendError::TextureCreationFailed(e));
            }
        };

        if let Err(e) =
            unsafe { self.device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
        {
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation);
            return Err(BackendError::TextureCreationFailed(format!("{e:?}")));
        }

        let id = self.next_texture_id;
        self.next_texture_id += 1;
        self.textures.insert(
            id,
            VkTexture {
                image,
                allocation,
                format,
                extent,
            },
        );

        Ok(TextureHandle(id))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {}", texture.0)))?;

        // Sampled views of depth images only see the depth aspect
        let aspect_mask = if barriers::aspect_mask(tex.format) == vk::ImageAspectFlags::COLOR {
            vk::ImageAspectFlags::COLOR
        } else {
            vk::ImageAspectFlags::DEPTH
        };

        let view_info = vk::ImageViewCreateInfo::default()
            .image(tex.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(tex.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { self.device.create_image_view(&view_info, None) }
            .map_err(vk_err(BackendError::TextureCreationFailed))?;

        let id = self.next_view_id;
        self.next_view_id += 1;
        self.texture_views.insert(
            id,
            VkTextureView {
                view,
                texture: texture.0,
            },
        );

        Ok(TextureViewHandle(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(Self::convert_filter(desc.mag_filter))
            .min_filter(Self::convert_filter(desc.min_filter))
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(Self::convert_address_mode(desc.address_mode_u))
            .address_mode_v(Self::convert_address_mode(desc.address_mode_v))
            .address_mode_w(Self::convert_address_mode(desc.address_mode_w))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);

        let sampler = unsafe { self.device.create_sampler(&sampler_info, None) }
            .map_err(vk_err(BackendError::TextureCreationFailed))?;

        let id = self.next_sampler_id;
        self.next_sampler_id += 1;
        self.samplers.insert(id, sampler);

        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = entries
            .iter()
            .map(|e| {
                let descriptor_type = match &e.ty {
                    BindingType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
                    BindingType::Texture { .. } => vk::DescriptorType::SAMPLED_IMAGE,
                    BindingType::Sampler { .. } => vk::DescriptorType::SAMPLER,
                };

                vk::DescriptorSetLayoutBinding::default()
                    .binding(e.binding)
                    .descriptor_type(descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(Self::convert_shader_stages(e.visibility))
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        let layout = unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(vk_err(BackendError::BindGroupCreationFailed))?;

        let id = self.next_layout_id;
        self.next_layout_id += 1;
        self.descriptor_set_layouts.insert(id, layout);

        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let set_layout = *self
            .descriptor_set_layouts
            .get(&layout.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("bind group layout {}", layout.0)))?;

        // Resolve everything before allocating so a bad handle leaks nothing
        let infos = entries
            .iter()
            .map(|(binding, entry)| {
                let info = match entry {
                    BindGroupEntry::Buffer { buffer, offset, size } => {
                        let vk_buffer = self.buffers.get(&buffer.0).ok_or_else(|| {
                            BackendError::InvalidHandle(format!("buffer {}", buffer.0))
                        })?;
                        DescriptorInfo::Buffer(vk::DescriptorBufferInfo {
                            buffer: vk_buffer.buffer,
                            offset: *offset,
                            range: size.unwrap_or(vk::WHOLE_SIZE),
                        })
                    }
                    BindGroupEntry::Texture(view) => DescriptorInfo::Image(
                        vk::DescriptorImageInfo {
                            sampler: vk::Sampler::null(),
                            image_view: self.resolve_view(*view)?.view,
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        },
                        vk::DescriptorType::SAMPLED_IMAGE,
                    ),
                    BindGroupEntry::Sampler(sampler) => {
                        let vk_sampler = self.samplers.get(&sampler.0).ok_or_else(|| {
                            BackendError::InvalidHandle(format!("sampler {}", sampler.0))
                        })?;
                        DescriptorInfo::Image(
                            vk::DescriptorImageInfo {
                                sampler: *vk_sampler,
                                image_view: vk::ImageView::null(),
                                image_layout: vk::ImageLayout::UNDEFINED,
                            },
                            vk::DescriptorType::SAMPLER,
                        )
                    }
                };
                Ok((*binding, info))
            })
            .collect::<BackendResult<Vec<_>>>()?;

        let set_layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&set_layouts);

        let descriptor_set = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(vk_err(BackendError::BindGroupCreationFailed))?[0];

        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .map(|(binding, info)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(descriptor_set)
                    .dst_binding(*binding)
                    .dst_array_element(0);
                match info {
                    DescriptorInfo::Buffer(buffer_info) => write
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(std::slice::from_ref(buffer_info)),
                    DescriptorInfo::Image(image_info, ty) => write
                        .descriptor_type(*ty)
                        .image_info(std::slice::from_ref(image_info)),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        let id = self.next_bind_group_id;
        self.next_bind_group_id += 1;
        self.descriptor_sets.insert(id, descriptor_set);

        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let set_layouts = desc
            .bind_group_layouts
            .iter()
            .map(|h| {
                self.descriptor_set_layouts.get(&h.0).copied().ok_or_else(|| {
                    BackendError::InvalidHandle(format!("bind group layout {}", h.0))
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;

        let vertex_module = shader::create_shader_module(
            &self.device,
            &desc.vertex_shader,
            naga::ShaderStage::Vertex,
            "vs_main",
        )?;
        let fragment_module = match &desc.fragment_shader {
            Some(source) => {
                match shader::create_shader_module(
                    &self.device,
                    source,
                    naga::ShaderStage::Fragment,
                    "fs_main",
                ) {
                    Ok(module) => Some(module),
                    Err(e) => {
                        unsafe { self.device.destroy_shader_module(vertex_module, None) };
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let result = self.build_pipeline(desc, &set_layouts, vertex_module, fragment_module);

        unsafe {
            self.device.destroy_shader_module(vertex_module, None);
            if let Some(module) = fragment_module {
                self.device.destroy_shader_module(module, None);
            }
        }

        let pipeline = result?;
        log::debug!("Vulkan: created render pipeline {:?}", desc.label);

        let id = self.next_render_pipeline_id;
        self.next_render_pipeline_id += 1;
        self.render_pipelines.insert(id, pipeline);

        Ok(RenderPipelineHandle(id))
    }

    fn texture_barriers(&mut self, barriers: &[TextureBarrier]) -> BackendResult<()> {
        if !self.is_recording {
            return Err(BackendError::CommandRecordingFailed(
                "texture barriers outside of a frame".into(),
            ));
        }
        if self.in_render_pass {
            return Err(BackendError::CommandRecordingFailed(
                "texture barriers inside a render pass".into(),
            ));
        }

        let mut batch = BarrierBatch::new();
        for barrier in barriers {
            let info = self.resolve_view(barrier.view)?;
            batch.add_image_barrier(
                info.image,
                barriers::aspect_mask(info.format),
                barrier.old,
                barrier.new,
            );
        }
        batch.submit(&self.device, self.command_buffer);
        Ok(())
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) -> BackendResult<()> {
        if !self.is_recording {
            return Err(BackendError::CommandRecordingFailed(
                "render pass begun outside of a frame".into(),
            ));
        }
        if self.in_render_pass {
            return Err(BackendError::CommandRecordingFailed(
                "render pass begun inside another render pass".into(),
            ));
        }

        let mut render_extent = None;

        let color_attachments = desc
            .color_attachments
            .iter()
            .map(|att| {
                let info = self.resolve_view(att.view)?;
                render_extent.get_or_insert(info.extent);
                let clear = match att.load_op {
                    LoadOp::Clear(color) => color,
                    LoadOp::Load => [0.0; 4],
                };
                Ok(vk::RenderingAttachmentInfo::default()
                    .image_view(info.view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(Self::convert_load_op(&att.load_op))
                    .store_op(Self::convert_store_op(att.store_op))
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: clear },
                    }))
            })
            .collect::<BackendResult<Vec<_>>>()?;

        let depth_attachment = desc
            .depth_stencil_attachment
            .as_ref()
            .map(|att| {
                let info = self.resolve_view(att.view)?;
                render_extent.get_or_insert(info.extent);
                let attachment = vk::RenderingAttachmentInfo::default()
                    .image_view(info.view)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: att.depth_clear_value,
                            stencil: 0,
                        },
                    });
                Ok(if att.read_only {
                    attachment
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)
                        .load_op(vk::AttachmentLoadOp::LOAD)
                        .store_op(vk::AttachmentStoreOp::NONE)
                } else {
                    attachment
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(Self::convert_load_op(&att.depth_load_op))
                        .store_op(Self::convert_store_op(att.depth_store_op))
                })
            })
            .transpose()?;

        let extent = render_extent.ok_or_else(|| {
            BackendError::CommandRecordingFailed(format!(
                "render pass {:?} has no attachments",
                desc.label
            ))
        })?;
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }

        unsafe {
            self.dynamic_rendering
                .cmd_begin_rendering(self.command_buffer, &rendering_info);
        }
        self.in_render_pass = true;
        self.bound_pipeline_layout = None;

        // Full-target viewport and scissor until the pass sets its own
        self.set_viewport(0.0, 0.0, extent.width as f32, extent.height as f32, 0.0, 1.0);
        self.set_scissor_rect(0, 0, extent.width, extent.height);

        Ok(())
    }

    fn end_render_pass(&mut self) -> BackendResult<()> {
        if !self.in_render_pass {
            return Err(BackendError::CommandRecordingFailed(
                "no render pass to end".into(),
            ));
        }
        unsafe {
            self.dynamic_rendering.cmd_end_rendering(self.command_buffer);
        }
        self.in_render_pass = false;
        Ok(())
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        let Some(cmd) = self.pass_command_buffer() else {
            return;
        };
        match self.render_pipelines.get(&pipeline.0) {
            Some(p) => {
                unsafe {
                    self.device
                        .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, p.pipeline);
                }
                self.bound_pipeline_layout = Some(p.layout);
            }
            None => log::warn!("Vulkan: unknown render pipeline {}", pipeline.0),
        }
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        let Some(cmd) = self.pass_command_buffer() else {
            return;
        };
        let Some(layout) = self.bound_pipeline_layout else {
            log::warn!("Vulkan: bind group set before a pipeline");
            return;
        };
        match self.descriptor_sets.get(&bind_group.0) {
            Some(&set) => unsafe {
                self.device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    layout,
                    index,
                    &[set],
                    &[],
                );
            },
            None => log::warn!("Vulkan: unknown bind group {}", bind_group.0),
        }
    }

    fn set_push_constants(&mut self, stages: ShaderStageFlags, offset: u32, data: &[u8]) {
        let Some(cmd) = self.pass_command_buffer() else {
            return;
        };
        let Some(layout) = self.bound_pipeline_layout else {
            log::warn!("Vulkan: push constants set before a pipeline");
            return;
        };
        unsafe {
            self.device.cmd_push_constants(
                cmd,
                layout,
                Self::convert_shader_stages(stages),
                offset,
                data,
            );
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        let Some(cmd) = self.pass_command_buffer() else {
            return;
        };
        match self.buffers.get(&buffer.0) {
            Some(b) => unsafe {
                self.device
                    .cmd_bind_vertex_buffers(cmd, slot, &[b.buffer], &[offset]);
            },
            None => log::warn!("Vulkan: unknown vertex buffer {}", buffer.0),
        }
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        let Some(cmd) = self.pass_command_buffer() else {
            return;
        };
        let index_type = match format {
            IndexFormat::Uint16 => vk::IndexType::UINT16,
            IndexFormat::Uint32 => vk::IndexType::UINT32,
        };
        match self.buffers.get(&buffer.0) {
            Some(b) => unsafe {
                self.device
                    .cmd_bind_index_buffer(cmd, b.buffer, offset, index_type);
            },
            None => log::warn!("Vulkan: unknown index buffer {}", buffer.0),
        }
    }

    fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        let Some(cmd) = self.pass_command_buffer() else {
            return;
        };
        // Negative height flips Y so clip space matches the wgpu convention
        let viewport = vk::Viewport {
            x,
            y: y + height,
            width,
            height: -height,
            min_depth,
            max_depth,
        };
        unsafe {
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
        }
    }

    fn set_scissor_rect(&mut self, x: u32, y: u32, width: u32, height: u32) {
        let Some(cmd) = self.pass_command_buffer() else {
            return;
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: x as i32,
                y: y as i32,
            },
            extent: vk::Extent2D { width, height },
        };
        unsafe {
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
        }
    }

    fn draw(&mut self, vertices: std::ops::Range<u32>, instances: std::ops::Range<u32>) {
        let Some(cmd) = self.pass_command_buffer() else {
            return;
        };
        unsafe {
            self.device.cmd_draw(
                cmd,
                vertices.end - vertices.start,
                instances.end - instances.start,
                vertices.start,
                instances.start,
            );
        }
    }

    fn draw_indexed(
        &mut self,
        indices: std::ops::Range<u32>,
        base_vertex: i32,
        instances: std::ops::Range<u32>,
    ) {
        let Some(cmd) = self.pass_command_buffer() else {
            return;
        };
        unsafe {
            self.device.cmd_draw_indexed(
                cmd,
                indices.end - indices.start,
                instances.end - instances.start,
                indices.start,
                base_vertex,
                instances.start,
            );
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(vk_buffer) = self.buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(vk_buffer.buffer, None) };
            self.free(vk_buffer.allocation);
        }
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        let device = &self.device;
        self.texture_views.retain(|_, view| {
            if view.texture == texture.0 {
                unsafe { device.destroy_image_view(view.view, None) };
                false
            } else {
                true
            }
        });

        if let Some(vk_texture) = self.textures.remove(&texture.0) {
            unsafe { self.device.destroy_image(vk_texture.image, None) };
            self.free(vk_texture.allocation);
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(s) = self.samplers.remove(&sampler.0) {
            unsafe { self.device.destroy_sampler(s, None) };
        }
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        if let Some(set) = self.descriptor_sets.remove(&bind_group.0) {
            if let Err(e) = unsafe {
                self.device
                    .free_descriptor_sets(self.descriptor_pool, &[set])
            } {
                log::warn!("Vulkan: failed to free descriptor set: {:?}", e);
            }
        }
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        if let Some(l) = self.descriptor_set_layouts.remove(&layout.0) {
            unsafe { self.device.destroy_descriptor_set_layout(l, None) };
        }
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(p) = self.render_pipelines.remove(&pipeline.0) {
            unsafe {
                self.device.destroy_pipeline(p.pipeline, None);
                self.device.destroy_pipeline_layout(p.layout, None);
            }
        }
    }
}

impl VulkanBackend {
    fn build_pipeline(
        &self,
        desc: &RenderPipelineDescriptor,
        set_layouts: &[vk::DescriptorSetLayout],
        vertex_module: vk::ShaderModule,
        fragment_module: Option<vk::ShaderModule>,
    ) -> BackendResult<VkRenderPipeline> {
        let push_constant_ranges: Vec<vk::PushConstantRange> = desc
            .push_constant_ranges
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: Self::convert_shader_stages(r.stages),
                offset: r.offset,
                size: r.size,
            })
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let layout = unsafe { self.device.create_pipeline_layout(&layout_info, None) }
            .map_err(vk_err(BackendError::PipelineCreationFailed))?;

        let mut shader_stages = vec![vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(c"vs_main")];
        if let Some(module) = fragment_module {
            shader_stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(module)
                    .name(c"fs_main"),
            );
        }

        let binding_descriptions: Vec<vk::VertexInputBindingDescription> = desc
            .vertex_layouts
            .iter()
            .enumerate()
            .map(|(i, layout)| {
                vk::VertexInputBindingDescription::default()
                    .binding(i as u32)
                    .stride(layout.array_stride as u32)
                    .input_rate(match layout.step_mode {
                        VertexStepMode::Vertex => vk::VertexInputRate::VERTEX,
                        VertexStepMode::Instance => vk::VertexInputRate::INSTANCE,
                    })
            })
            .collect();

        let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = desc
            .vertex_layouts
            .iter()
            .enumerate()
            .flat_map(|(i, layout)| {
                layout.attributes.iter().map(move |attr| {
                    vk::VertexInputAttributeDescription::default()
                        .location(attr.location)
                        .binding(i as u32)
                        .format(Self::convert_vertex_format(attr.format))
                        .offset(attr.offset as u32)
                })
            })
            .collect();

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let topology = match desc.primitive_topology {
            PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        };
        let input_assembly_state =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(topology);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        // With the flipped viewport, winding keeps its wgpu meaning
        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(match desc.cull_mode {
                CullMode::None => vk::CullModeFlags::NONE,
                CullMode::Front => vk::CullModeFlags::FRONT,
                CullMode::Back => vk::CullModeFlags::BACK,
            })
            .front_face(match desc.front_face {
                FrontFace::Ccw => vk::FrontFace::COUNTER_CLOCKWISE,
                FrontFace::Cw => vk::FrontFace::CLOCKWISE,
            });

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil_state = match &desc.depth_stencil {
            Some(ds) => vk::PipelineDepthStencilStateCreateInfo::default()
                .depth_test_enable(true)
                .depth_write_enable(ds.depth_write_enabled)
                .depth_compare_op(Self::convert_compare_op(ds.depth_compare)),
            None => vk::PipelineDepthStencilStateCreateInfo::default(),
        };

        let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_targets
            .iter()
            .map(Self::convert_color_target)
            .collect();
        let color_blend_state =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats: Vec<vk::Format> = desc
            .color_targets
            .iter()
            .map(|t| Self::convert_format(t.format))
            .collect();
        let depth_format = desc
            .depth_stencil
            .as_ref()
            .map(|ds| Self::convert_format(ds.format))
            .unwrap_or(vk::Format::UNDEFINED);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        match pipelines {
            Ok(pipelines) => Ok(VkRenderPipeline {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, e)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                Err(BackendError::PipelineCreationFailed(format!(
                    "{:?}: {e:?}",
                    desc.label
                )))
            }
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for (_, buffer) in self.buffers.drain() {
                self.device.destroy_buffer(buffer.buffer, None);
                if let Some(allocator) = self.allocator.as_mut() {
                    let _ = allocator.free(buffer.allocation);
                }
            }

            for (_, view) in self.texture_views.drain() {
                self.device.destroy_image_view(view.view, None);
            }

            for (_, texture) in self.textures.drain() {
                self.device.destroy_image(texture.image, None);
                if let Some(allocator) = self.allocator.as_mut() {
                    let _ = allocator.free(texture.allocation);
                }
            }

            // Drop the allocator before destroying the device
            drop(self.allocator.take());

            for (_, sampler) in self.samplers.drain() {
                self.device.destroy_sampler(sampler, None);
            }

            for (_, pipeline) in self.render_pipelines.drain() {
                self.device.destroy_pipeline(pipeline.pipeline, None);
                self.device.destroy_pipeline_layout(pipeline.layout, None);
            }

            for (_, layout) in self.descriptor_set_layouts.drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }

            self.descriptor_sets.clear();
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);

            self.device.destroy_semaphore(self.image_available_semaphore, None);
            for &semaphore in &self.render_finished_semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }
            self.device.destroy_fence(self.in_flight_fence, None);

            for &view in &self.swapchain_image_views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_fn.destroy_swapchain(self.swapchain, None);

            self.device.destroy_device(None);
            self.surface_fn.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_round_trip() {
        for format in [
            TextureFormat::Depth16Unorm,
            TextureFormat::Depth32Float,
            TextureFormat::Rgba32Float,
            TextureFormat::Bgra8UnormSrgb,
        ] {
            let vk_format = VulkanBackend::convert_format(format);
            assert_eq!(VulkanBackend::convert_format_back(vk_format), format);
        }
    }

    #[test]
    fn test_color_write_mask_bits_match() {
        let target = ColorTargetState {
            format: TextureFormat::Bgra8UnormSrgb,
            write_mask: ColorWrites::ALL,
        };
        let state = VulkanBackend::convert_color_target(&target);
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);
        assert_eq!(state.blend_enable, vk::FALSE);
    }
}
