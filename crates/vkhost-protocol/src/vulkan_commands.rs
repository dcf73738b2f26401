use serde::{Deserialize, Serialize};

use crate::handle::BoxedHandle;

// ============================================================================
// Plain-data Vulkan structures as delivered by the guest decoder
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceCreateInfo {
    pub app_name: Option<String>,
    pub app_version: u32,
    pub engine_name: Option<String>,
    pub engine_version: u32,
    pub api_version: u32,
    pub enabled_extensions: Vec<String>,
    pub enabled_layers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceQueueCreateInfo {
    pub queue_family_index: u32,
    pub queue_priorities: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCreateInfo {
    pub queue_create_infos: Vec<DeviceQueueCreateInfo>,
    pub enabled_extensions: Vec<String>,
    /// Raw bytes of a `VkPhysicalDeviceFeatures`, if the guest enabled any.
    pub enabled_features: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFormatQuery {
    pub format: i32,
    pub image_type: i32,
    pub tiling: i32,
    pub usage: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAllocateInfo {
    pub allocation_size: u64,
    /// Guest-relative memory type index.
    pub memory_type_index: u32,
    /// Color buffer imported into this allocation, if any.
    pub import_color_buffer: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedMemoryRange {
    pub memory: BoxedHandle,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferCreateInfo {
    pub flags: u32,
    pub size: u64,
    pub usage: u32,
    pub sharing_mode: i32,
    pub queue_family_indices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCreateInfo {
    pub flags: u32,
    pub image_type: i32,
    pub format: i32,
    pub extent: [u32; 3],
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: u32,
    pub tiling: i32,
    pub usage: u32,
    pub sharing_mode: i32,
    pub queue_family_indices: Vec<u32>,
    pub initial_layout: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentMapping {
    pub r: i32,
    pub g: i32,
    pub b: i32,
    pub a: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSubresourceRange {
    pub aspect_mask: u32,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageViewCreateInfo {
    pub flags: u32,
    pub image: BoxedHandle,
    pub view_type: i32,
    pub format: i32,
    pub components: ComponentMapping,
    pub subresource_range: ImageSubresourceRange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplerCreateInfo {
    pub flags: u32,
    pub mag_filter: i32,
    pub min_filter: i32,
    pub mipmap_mode: i32,
    pub address_mode_u: i32,
    pub address_mode_v: i32,
    pub address_mode_w: i32,
    pub mip_lod_bias: f32,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
    pub compare_enable: bool,
    pub compare_op: i32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: i32,
    pub unnormalized_coordinates: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: i32,
    pub descriptor_count: u32,
    pub stage_flags: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorSetLayoutCreateInfo {
    pub flags: u32,
    pub bindings: Vec<DescriptorSetLayoutBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorPoolSize {
    pub descriptor_type: i32,
    pub descriptor_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorPoolCreateInfo {
    pub flags: u32,
    pub max_sets: u32,
    pub pool_sizes: Vec<DescriptorPoolSize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorBufferInfo {
    pub buffer: BoxedHandle,
    pub offset: u64,
    pub range: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorImageInfo {
    pub sampler: BoxedHandle,
    pub image_view: BoxedHandle,
    pub image_layout: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteDescriptorSet {
    pub dst_set: BoxedHandle,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_type: i32,
    pub image_infos: Vec<DescriptorImageInfo>,
    pub buffer_infos: Vec<DescriptorBufferInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorUpdateTemplateEntry {
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_count: u32,
    pub descriptor_type: i32,
    pub offset: usize,
    pub stride: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorUpdateTemplateCreateInfo {
    pub entries: Vec<DescriptorUpdateTemplateEntry>,
    pub template_type: i32,
    pub descriptor_set_layout: BoxedHandle,
    pub pipeline_bind_point: i32,
    pub set: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescription {
    pub flags: u32,
    pub format: i32,
    pub samples: u32,
    pub load_op: i32,
    pub store_op: i32,
    pub stencil_load_op: i32,
    pub stencil_store_op: i32,
    pub initial_layout: i32,
    pub final_layout: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentReference {
    pub attachment: u32,
    pub layout: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubpassDescription {
    pub flags: u32,
    pub pipeline_bind_point: i32,
    pub input_attachments: Vec<AttachmentReference>,
    pub color_attachments: Vec<AttachmentReference>,
    pub resolve_attachments: Vec<AttachmentReference>,
    pub depth_stencil_attachment: Option<AttachmentReference>,
    pub preserve_attachments: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubpassDependency {
    pub src_subpass: u32,
    pub dst_subpass: u32,
    pub src_stage_mask: u32,
    pub dst_stage_mask: u32,
    pub src_access_mask: u32,
    pub dst_access_mask: u32,
    pub dependency_flags: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderPassCreateInfo {
    pub flags: u32,
    pub attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<SubpassDescription>,
    pub dependencies: Vec<SubpassDependency>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPoolCreateInfo {
    pub flags: u32,
    pub queue_family_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitInfo {
    pub wait_semaphores: Vec<BoxedHandle>,
    pub wait_dst_stage_masks: Vec<u32>,
    pub command_buffers: Vec<BoxedHandle>,
    pub signal_semaphores: Vec<BoxedHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindBufferMemoryInfo {
    pub buffer: BoxedHandle,
    pub memory: BoxedHandle,
    pub memory_offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseMemoryBind {
    pub resource_offset: u64,
    pub size: u64,
    pub memory: BoxedHandle,
    pub memory_offset: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseBufferMemoryBindInfo {
    pub buffer: BoxedHandle,
    pub binds: Vec<SparseMemoryBind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindSparseInfo {
    pub wait_semaphores: Vec<BoxedHandle>,
    pub buffer_binds: Vec<SparseBufferMemoryBindInfo>,
    pub signal_semaphores: Vec<BoxedHandle>,
}

// ============================================================================
// Response serialized types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionProperties {
    pub extension_name: String,
    pub spec_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedMemoryType {
    pub property_flags: u32,
    pub heap_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedMemoryHeap {
    pub size: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedQueueFamilyProperties {
    pub queue_flags: u32,
    pub queue_count: u32,
    pub timestamp_valid_bits: u32,
    pub min_image_transfer_granularity: [u32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedMemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

// ============================================================================
// Decoded guest calls
// ============================================================================

/// One decoded guest API call. Handle fields carry the boxed values the guest
/// holds; the host unboxes them before touching the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VulkanCommand {
    // ── Instance ────────────────────────────────────────────
    EnumerateInstanceVersion,
    CreateInstance {
        create_info: InstanceCreateInfo,
    },
    DestroyInstance {
        instance: BoxedHandle,
    },
    EnumeratePhysicalDevices {
        instance: BoxedHandle,
    },

    // ── Physical Device Queries ─────────────────────────────
    GetPhysicalDeviceProperties {
        physical_device: BoxedHandle,
    },
    GetPhysicalDeviceFeatures {
        physical_device: BoxedHandle,
    },
    GetPhysicalDeviceMemoryProperties {
        physical_device: BoxedHandle,
    },
    GetPhysicalDeviceQueueFamilyProperties {
        physical_device: BoxedHandle,
    },
    GetPhysicalDeviceFormatProperties {
        physical_device: BoxedHandle,
        format: i32,
    },
    GetPhysicalDeviceImageFormatProperties {
        physical_device: BoxedHandle,
        query: ImageFormatQuery,
    },
    EnumerateDeviceExtensionProperties {
        physical_device: BoxedHandle,
    },
    GetPhysicalDeviceProperties2 {
        physical_device: BoxedHandle,
    },
    GetPhysicalDeviceFeatures2 {
        physical_device: BoxedHandle,
    },
    GetPhysicalDeviceMemoryProperties2 {
        physical_device: BoxedHandle,
    },
    GetPhysicalDeviceFormatProperties2 {
        physical_device: BoxedHandle,
        format: i32,
    },
    GetPhysicalDeviceImageFormatProperties2 {
        physical_device: BoxedHandle,
        query: ImageFormatQuery,
    },
    GetPhysicalDeviceExternalSemaphoreProperties {
        physical_device: BoxedHandle,
        handle_type: u32,
    },

    // ── Logical Device ──────────────────────────────────────
    CreateDevice {
        physical_device: BoxedHandle,
        create_info: DeviceCreateInfo,
    },
    DestroyDevice {
        device: BoxedHandle,
    },
    DeviceWaitIdle {
        device: BoxedHandle,
    },
    GetDeviceQueue {
        device: BoxedHandle,
        queue_family_index: u32,
        queue_index: u32,
    },

    // ── Memory ──────────────────────────────────────────────
    AllocateMemory {
        device: BoxedHandle,
        allocate_info: MemoryAllocateInfo,
    },
    FreeMemory {
        device: BoxedHandle,
        memory: BoxedHandle,
    },
    FreeMemorySync {
        device: BoxedHandle,
        memory: BoxedHandle,
    },
    MapMemory {
        device: BoxedHandle,
        memory: BoxedHandle,
        offset: u64,
        size: u64,
        flags: u32,
    },
    UnmapMemory {
        device: BoxedHandle,
        memory: BoxedHandle,
    },
    FlushMappedMemoryRanges {
        device: BoxedHandle,
        ranges: Vec<MappedMemoryRange>,
    },
    InvalidateMappedMemoryRanges {
        device: BoxedHandle,
        ranges: Vec<MappedMemoryRange>,
    },
    MapMemoryIntoAddressSpace {
        device: BoxedHandle,
        memory: BoxedHandle,
    },
    GetMemoryHostAddressInfo {
        device: BoxedHandle,
        memory: BoxedHandle,
    },

    // ── Buffer ──────────────────────────────────────────────
    CreateBuffer {
        device: BoxedHandle,
        create_info: BufferCreateInfo,
    },
    CreateBufferWithRequirements {
        device: BoxedHandle,
        create_info: BufferCreateInfo,
    },
    DestroyBuffer {
        device: BoxedHandle,
        buffer: BoxedHandle,
    },
    BindBufferMemory {
        device: BoxedHandle,
        buffer: BoxedHandle,
        memory: BoxedHandle,
        memory_offset: u64,
    },
    BindBufferMemory2 {
        device: BoxedHandle,
        bind_infos: Vec<BindBufferMemoryInfo>,
    },
    GetBufferMemoryRequirements {
        device: BoxedHandle,
        buffer: BoxedHandle,
    },
    RegisterBufferColorBuffer {
        device: BoxedHandle,
        buffer: BoxedHandle,
        color_buffer: u32,
    },

    // ── Image ───────────────────────────────────────────────
    CreateImage {
        device: BoxedHandle,
        create_info: ImageCreateInfo,
    },
    CreateImageWithRequirements {
        device: BoxedHandle,
        create_info: ImageCreateInfo,
    },
    DestroyImage {
        device: BoxedHandle,
        image: BoxedHandle,
    },
    BindImageMemory {
        device: BoxedHandle,
        image: BoxedHandle,
        memory: BoxedHandle,
        memory_offset: u64,
    },
    GetImageMemoryRequirements {
        device: BoxedHandle,
        image: BoxedHandle,
    },
    GetImageMemoryRequirements2 {
        device: BoxedHandle,
        image: BoxedHandle,
    },
    GetLinearImageLayout {
        device: BoxedHandle,
        format: i32,
    },
    RegisterImageColorBuffer {
        device: BoxedHandle,
        image: BoxedHandle,
        color_buffer: u32,
    },
    CreateImageView {
        device: BoxedHandle,
        create_info: ImageViewCreateInfo,
    },
    DestroyImageView {
        device: BoxedHandle,
        image_view: BoxedHandle,
    },
    CreateSampler {
        device: BoxedHandle,
        create_info: SamplerCreateInfo,
    },
    DestroySampler {
        device: BoxedHandle,
        sampler: BoxedHandle,
    },

    // ── Descriptors ─────────────────────────────────────────
    CreateDescriptorSetLayout {
        device: BoxedHandle,
        create_info: DescriptorSetLayoutCreateInfo,
    },
    DestroyDescriptorSetLayout {
        device: BoxedHandle,
        layout: BoxedHandle,
    },
    CreateDescriptorPool {
        device: BoxedHandle,
        create_info: DescriptorPoolCreateInfo,
    },
    DestroyDescriptorPool {
        device: BoxedHandle,
        pool: BoxedHandle,
    },
    ResetDescriptorPool {
        device: BoxedHandle,
        pool: BoxedHandle,
        flags: u32,
    },
    AllocateDescriptorSets {
        device: BoxedHandle,
        pool: BoxedHandle,
        set_layouts: Vec<BoxedHandle>,
    },
    FreeDescriptorSets {
        device: BoxedHandle,
        pool: BoxedHandle,
        descriptor_sets: Vec<BoxedHandle>,
    },
    UpdateDescriptorSets {
        device: BoxedHandle,
        writes: Vec<WriteDescriptorSet>,
    },
    CreateDescriptorUpdateTemplate {
        device: BoxedHandle,
        create_info: DescriptorUpdateTemplateCreateInfo,
    },
    DestroyDescriptorUpdateTemplate {
        device: BoxedHandle,
        template: BoxedHandle,
    },
    UpdateDescriptorSetWithTemplate {
        device: BoxedHandle,
        descriptor_set: BoxedHandle,
        template: BoxedHandle,
        image_infos: Vec<DescriptorImageInfo>,
        buffer_infos: Vec<DescriptorBufferInfo>,
    },

    // ── Render Pass ─────────────────────────────────────────
    CreateRenderPass {
        device: BoxedHandle,
        create_info: RenderPassCreateInfo,
    },
    DestroyRenderPass {
        device: BoxedHandle,
        render_pass: BoxedHandle,
    },

    // ── Sync Objects ────────────────────────────────────────
    CreateSemaphore {
        device: BoxedHandle,
    },
    DestroySemaphore {
        device: BoxedHandle,
        semaphore: BoxedHandle,
    },
    CreateFence {
        device: BoxedHandle,
        signaled: bool,
    },
    DestroyFence {
        device: BoxedHandle,
        fence: BoxedHandle,
    },
    WaitForFences {
        device: BoxedHandle,
        fences: Vec<BoxedHandle>,
        wait_all: bool,
        timeout_ns: u64,
    },
    ResetFences {
        device: BoxedHandle,
        fences: Vec<BoxedHandle>,
    },
    GetFenceStatus {
        device: BoxedHandle,
        fence: BoxedHandle,
    },

    // ── Command Pool / Buffer ───────────────────────────────
    CreateCommandPool {
        device: BoxedHandle,
        create_info: CommandPoolCreateInfo,
    },
    DestroyCommandPool {
        device: BoxedHandle,
        command_pool: BoxedHandle,
    },
    ResetCommandPool {
        device: BoxedHandle,
        command_pool: BoxedHandle,
        flags: u32,
    },
    AllocateCommandBuffers {
        device: BoxedHandle,
        command_pool: BoxedHandle,
        level: i32,
        count: u32,
    },
    FreeCommandBuffers {
        device: BoxedHandle,
        command_pool: BoxedHandle,
        command_buffers: Vec<BoxedHandle>,
    },
    BeginCommandBuffer {
        command_buffer: BoxedHandle,
        flags: u32,
    },
    EndCommandBuffer {
        command_buffer: BoxedHandle,
    },
    ResetCommandBuffer {
        command_buffer: BoxedHandle,
        flags: u32,
    },
    BeginCommandBufferAsync {
        command_buffer: BoxedHandle,
        flags: u32,
        sequence_number: u32,
    },
    EndCommandBufferAsync {
        command_buffer: BoxedHandle,
        sequence_number: u32,
    },
    ResetCommandBufferAsync {
        command_buffer: BoxedHandle,
        flags: u32,
        sequence_number: u32,
    },
    CommandBufferHostSync {
        command_buffer: BoxedHandle,
        need_host_sync: bool,
        sequence_number: u32,
    },

    // ── Queue ───────────────────────────────────────────────
    QueueSubmit {
        queue: BoxedHandle,
        submits: Vec<SubmitInfo>,
        fence: BoxedHandle,
    },
    QueueWaitIdle {
        queue: BoxedHandle,
    },
    QueueBindSparse {
        queue: BoxedHandle,
        bind_infos: Vec<BindSparseInfo>,
        fence: BoxedHandle,
    },
    QueueSubmitAsync {
        queue: BoxedHandle,
        submits: Vec<SubmitInfo>,
        fence: BoxedHandle,
        sequence_number: u32,
    },
    QueueWaitIdleAsync {
        queue: BoxedHandle,
        sequence_number: u32,
    },
    QueueBindSparseAsync {
        queue: BoxedHandle,
        bind_infos: Vec<BindSparseInfo>,
        fence: BoxedHandle,
        sequence_number: u32,
    },
    QueueHostSync {
        queue: BoxedHandle,
        need_host_sync: bool,
        sequence_number: u32,
    },
}

/// Result of executing one [`VulkanCommand`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VulkanResponse {
    Success,
    Error { code: i32, message: String },

    ApiVersion { version: u32 },
    Handle { handle: BoxedHandle },
    Handles { handles: Vec<BoxedHandle> },

    PhysicalDeviceProperties {
        api_version: u32,
        driver_version: u32,
        vendor_id: u32,
        device_id: u32,
        device_type: i32,
        device_name: String,
        pipeline_cache_uuid: [u8; 16],
    },
    PhysicalDeviceFeatures {
        /// Raw bytes of `VkPhysicalDeviceFeatures`
        features_raw: Vec<u8>,
    },
    PhysicalDeviceProperties2 {
        api_version: u32,
        driver_version: u32,
        vendor_id: u32,
        device_id: u32,
        device_type: i32,
        device_name: String,
        pipeline_cache_uuid: [u8; 16],
        device_uuid: [u8; 16],
        driver_uuid: [u8; 16],
    },
    PhysicalDeviceFeatures2 {
        features_raw: Vec<u8>,
        protected_memory: bool,
        sampler_ycbcr_conversion: bool,
    },
    ExternalSemaphoreProperties {
        export_from_imported_handle_types: u32,
        compatible_handle_types: u32,
        external_semaphore_features: u32,
    },
    PhysicalDeviceMemoryProperties {
        memory_types: Vec<SerializedMemoryType>,
        memory_heaps: Vec<SerializedMemoryHeap>,
    },
    QueueFamilyProperties {
        families: Vec<SerializedQueueFamilyProperties>,
    },
    FormatProperties {
        linear_tiling_features: u32,
        optimal_tiling_features: u32,
        buffer_features: u32,
    },
    ImageFormatProperties {
        max_extent: [u32; 3],
        max_mip_levels: u32,
        max_array_layers: u32,
        sample_counts: u32,
        max_resource_size: u64,
    },
    ExtensionProperties {
        extensions: Vec<ExtensionProperties>,
    },

    MemoryMapped { address: u64 },
    Address { address: u64 },
    MemoryRequirements { requirements: SerializedMemoryRequirements },
    HandleWithRequirements {
        handle: BoxedHandle,
        requirements: SerializedMemoryRequirements,
    },
    MemoryRequirements2 {
        requirements: SerializedMemoryRequirements,
        prefers_dedicated: bool,
        requires_dedicated: bool,
    },
    HostAddressInfo {
        address: u64,
        size: u64,
        id: u64,
    },
    LinearImageLayout {
        offset: u64,
        row_pitch_alignment: u64,
    },
    FenceStatus { signaled: bool },
}
