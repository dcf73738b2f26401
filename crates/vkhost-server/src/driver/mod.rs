//! The real-driver seam. Everything the decoder does to the GPU goes through
//! [`Driver`], with already-unboxed driver handles.

pub mod ash_driver;
pub mod fake;

use std::ptr::NonNull;

use ash::prelude::VkResult;
use ash::vk;

use vkhost_protocol::vulkan_commands::{
    BufferCreateInfo, CommandPoolCreateInfo, DescriptorPoolCreateInfo,
    DescriptorSetLayoutCreateInfo, DescriptorUpdateTemplateCreateInfo, DeviceCreateInfo,
    ExtensionProperties, ImageCreateInfo, ImageFormatQuery, ImageViewCreateInfo,
    InstanceCreateInfo, RenderPassCreateInfo, SamplerCreateInfo,
};

pub use ash_driver::AshDriver;
pub use fake::FakeDriver;

/// A pointer into driver-mapped (or host staging) memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(NonNull<u8>);

// Mapped pointers are only dereferenced under the decoder lock or by the
// guest through its own mapping.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(&self) -> u64 {
        self.0.as_ptr() as u64
    }
}

/// Physical device properties the decoder consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub api_version: u32,
    pub driver_version: u32,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub device_name: String,
    pub pipeline_cache_uuid: [u8; 16],
}

/// Identity UUIDs reported next to the core properties by the *2 query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceIdProperties {
    pub device_uuid: [u8; 16],
    pub driver_uuid: [u8; 16],
}

/// Core features plus the 1.1 feature structs the decoder inspects.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhysicalDeviceFeatures2 {
    pub features: vk::PhysicalDeviceFeatures,
    pub protected_memory: bool,
    pub sampler_ycbcr_conversion: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryRequirements2 {
    pub requirements: vk::MemoryRequirements,
    pub prefers_dedicated: bool,
    pub requires_dedicated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExternalSemaphoreProperties {
    pub export_from_imported_handle_types: vk::ExternalSemaphoreHandleTypeFlags,
    pub compatible_handle_types: vk::ExternalSemaphoreHandleTypeFlags,
    pub external_semaphore_features: vk::ExternalSemaphoreFeatureFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: vk::MemoryPropertyFlags,
    pub heap_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    pub size: u64,
    pub flags: vk::MemoryHeapFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryProperties {
    pub types: Vec<MemoryType>,
    pub heaps: Vec<MemoryHeap>,
}

/// One `VkSubmitInfo` with its handles resolved.
#[derive(Debug, Clone, Default)]
pub struct SubmitBatch {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_dst_stage_masks: Vec<vk::PipelineStageFlags>,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

#[derive(Debug, Clone, Copy)]
pub struct SparseBind {
    pub resource_offset: u64,
    pub size: u64,
    pub memory: vk::DeviceMemory,
    pub memory_offset: u64,
    pub flags: vk::SparseMemoryBindFlags,
}

/// One `VkBindSparseInfo` with its handles resolved (buffer binds only).
#[derive(Debug, Clone, Default)]
pub struct SparseBindBatch {
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub buffer_binds: Vec<(vk::Buffer, Vec<SparseBind>)>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// One `VkWriteDescriptorSet` with its handles resolved.
#[derive(Debug, Clone)]
pub struct DescriptorWrite {
    pub dst_set: vk::DescriptorSet,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub image_infos: Vec<vk::DescriptorImageInfo>,
    pub buffer_infos: Vec<vk::DescriptorBufferInfo>,
}

/// Entry points of the host graphics driver.
///
/// Physical-device queries take the owning instance, device-level calls take
/// the owning device; both come from the caller's dispatch table.
pub trait Driver: Send + Sync {
    // ── Instance ────────────────────────────────────────────
    fn enumerate_instance_version(&self) -> VkResult<u32>;
    fn create_instance(&self, info: &InstanceCreateInfo) -> VkResult<vk::Instance>;
    fn destroy_instance(&self, instance: vk::Instance);
    fn enumerate_physical_devices(&self, instance: vk::Instance) -> VkResult<Vec<vk::PhysicalDevice>>;

    // ── Physical Device Queries ─────────────────────────────
    fn get_physical_device_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<DeviceProperties>;
    fn get_physical_device_features(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<vk::PhysicalDeviceFeatures>;
    fn get_physical_device_memory_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<MemoryProperties>;
    fn get_physical_device_queue_family_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<Vec<vk::QueueFamilyProperties>>;
    fn get_physical_device_format_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        format: vk::Format,
    ) -> VkResult<vk::FormatProperties>;
    fn get_physical_device_image_format_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        query: &ImageFormatQuery,
    ) -> VkResult<vk::ImageFormatProperties>;
    fn enumerate_device_extension_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<Vec<ExtensionProperties>>;
    fn get_physical_device_features2(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<PhysicalDeviceFeatures2>;
    fn get_physical_device_id_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<DeviceIdProperties>;
    fn get_physical_device_external_semaphore_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        handle_type: vk::ExternalSemaphoreHandleTypeFlags,
    ) -> VkResult<ExternalSemaphoreProperties>;

    // ── Logical Device ──────────────────────────────────────
    fn create_device(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        info: &DeviceCreateInfo,
    ) -> VkResult<vk::Device>;
    fn destroy_device(&self, device: vk::Device);
    fn get_device_queue(&self, device: vk::Device, family_index: u32, queue_index: u32) -> VkResult<vk::Queue>;
    fn device_wait_idle(&self, device: vk::Device) -> VkResult<()>;

    // ── Memory ──────────────────────────────────────────────
    fn allocate_memory(
        &self,
        device: vk::Device,
        size: u64,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory>;
    fn free_memory(&self, device: vk::Device, memory: vk::DeviceMemory);
    fn map_memory(
        &self,
        device: vk::Device,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<HostPtr>;
    fn unmap_memory(&self, device: vk::Device, memory: vk::DeviceMemory);
    fn flush_mapped_memory_ranges(
        &self,
        device: vk::Device,
        ranges: &[(vk::DeviceMemory, u64, u64)],
    ) -> VkResult<()>;
    fn invalidate_mapped_memory_ranges(
        &self,
        device: vk::Device,
        ranges: &[(vk::DeviceMemory, u64, u64)],
    ) -> VkResult<()>;

    // ── Buffers / Images ────────────────────────────────────
    fn create_buffer(&self, device: vk::Device, info: &BufferCreateInfo) -> VkResult<vk::Buffer>;
    fn destroy_buffer(&self, device: vk::Device, buffer: vk::Buffer);
    fn get_buffer_memory_requirements(
        &self,
        device: vk::Device,
        buffer: vk::Buffer,
    ) -> VkResult<vk::MemoryRequirements>;
    fn bind_buffer_memory(
        &self,
        device: vk::Device,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;
    /// Bind several buffers at once; each entry is `(buffer, memory, offset)`.
    fn bind_buffer_memory2(
        &self,
        device: vk::Device,
        binds: &[(vk::Buffer, vk::DeviceMemory, u64)],
    ) -> VkResult<()>;
    fn create_image(&self, device: vk::Device, info: &ImageCreateInfo) -> VkResult<vk::Image>;
    fn destroy_image(&self, device: vk::Device, image: vk::Image);
    fn get_image_memory_requirements(
        &self,
        device: vk::Device,
        image: vk::Image,
    ) -> VkResult<vk::MemoryRequirements>;
    fn get_image_memory_requirements2(
        &self,
        device: vk::Device,
        image: vk::Image,
    ) -> VkResult<MemoryRequirements2>;
    fn bind_image_memory(
        &self,
        device: vk::Device,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()>;
    /// Layout of mip 0, layer 0 of the color aspect of a linear image.
    fn get_image_subresource_layout(&self, device: vk::Device, image: vk::Image) -> VkResult<vk::SubresourceLayout>;
    fn create_image_view(
        &self,
        device: vk::Device,
        image: vk::Image,
        info: &ImageViewCreateInfo,
    ) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, device: vk::Device, view: vk::ImageView);
    fn create_sampler(&self, device: vk::Device, info: &SamplerCreateInfo) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&self, device: vk::Device, sampler: vk::Sampler);

    // ── Descriptors ─────────────────────────────────────────
    fn create_descriptor_set_layout(
        &self,
        device: vk::Device,
        info: &DescriptorSetLayoutCreateInfo,
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, device: vk::Device, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        device: vk::Device,
        info: &DescriptorPoolCreateInfo,
    ) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, device: vk::Device, pool: vk::DescriptorPool);
    fn reset_descriptor_pool(&self, device: vk::Device, pool: vk::DescriptorPool) -> VkResult<()>;
    fn allocate_descriptor_sets(
        &self,
        device: vk::Device,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>>;
    fn free_descriptor_sets(
        &self,
        device: vk::Device,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()>;
    fn update_descriptor_sets(&self, device: vk::Device, writes: &[DescriptorWrite]);
    fn create_descriptor_update_template(
        &self,
        device: vk::Device,
        layout: vk::DescriptorSetLayout,
        info: &DescriptorUpdateTemplateCreateInfo,
    ) -> VkResult<vk::DescriptorUpdateTemplate>;
    fn destroy_descriptor_update_template(
        &self,
        device: vk::Device,
        template: vk::DescriptorUpdateTemplate,
    );

    // ── Render Pass ─────────────────────────────────────────
    fn create_render_pass(&self, device: vk::Device, info: &RenderPassCreateInfo) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, device: vk::Device, render_pass: vk::RenderPass);

    // ── Command Pool / Buffer ───────────────────────────────
    fn create_command_pool(
        &self,
        device: vk::Device,
        info: &CommandPoolCreateInfo,
    ) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, device: vk::Device, pool: vk::CommandPool);
    fn reset_command_pool(&self, device: vk::Device, pool: vk::CommandPool, flags: u32) -> VkResult<()>;
    fn allocate_command_buffers(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    );
    fn begin_command_buffer(
        &self,
        device: vk::Device,
        command_buffer: vk::CommandBuffer,
        flags: u32,
    ) -> VkResult<()>;
    fn end_command_buffer(&self, device: vk::Device, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(
        &self,
        device: vk::Device,
        command_buffer: vk::CommandBuffer,
        flags: u32,
    ) -> VkResult<()>;

    // ── Queue ───────────────────────────────────────────────
    fn queue_submit(
        &self,
        device: vk::Device,
        queue: vk::Queue,
        submits: &[SubmitBatch],
        fence: vk::Fence,
    ) -> VkResult<()>;
    fn queue_wait_idle(&self, device: vk::Device, queue: vk::Queue) -> VkResult<()>;
    fn queue_bind_sparse(
        &self,
        device: vk::Device,
        queue: vk::Queue,
        binds: &[SparseBindBatch],
        fence: vk::Fence,
    ) -> VkResult<()>;

    // ── Sync Objects ────────────────────────────────────────
    fn create_semaphore(&self, device: vk::Device) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, device: vk::Device, semaphore: vk::Semaphore);
    fn create_fence(&self, device: vk::Device, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, device: vk::Device, fence: vk::Fence);
    fn wait_for_fences(
        &self,
        device: vk::Device,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult<()>;
    fn reset_fences(&self, device: vk::Device, fences: &[vk::Fence]) -> VkResult<()>;
    fn get_fence_status(&self, device: vk::Device, fence: vk::Fence) -> VkResult<bool>;
}
