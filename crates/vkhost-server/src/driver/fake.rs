//! Deterministic software driver. Reports a fixed physical device, backs
//! allocations with host bytes, and lets tests hold queue submissions to
//! observe async ordering.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use vkhost_protocol::vulkan_commands::{
    BufferCreateInfo, CommandPoolCreateInfo, DescriptorPoolCreateInfo,
    DescriptorSetLayoutCreateInfo, DescriptorUpdateTemplateCreateInfo, DeviceCreateInfo,
    ExtensionProperties, ImageCreateInfo, ImageFormatQuery, ImageViewCreateInfo,
    InstanceCreateInfo, RenderPassCreateInfo, SamplerCreateInfo,
};

use super::{
    DescriptorWrite, DeviceIdProperties, DeviceProperties, Driver, ExternalSemaphoreProperties,
    HostPtr, MemoryHeap, MemoryProperties, MemoryRequirements2, MemoryType,
    PhysicalDeviceFeatures2, SparseBindBatch, SubmitBatch,
};

const MAX_ALLOCATION: u64 = 1 << 30;
const BUFFER_ALIGNMENT: u64 = 256;
/// Linear images get rows padded to this many bytes.
pub const FAKE_ROW_PITCH_ALIGNMENT: u64 = 64;
/// Images at least this large prefer a dedicated allocation.
const DEDICATED_THRESHOLD: u64 = 1 << 20;

/// Host memory types 0, 2 and 3.
pub const FAKE_BUFFER_TYPE_BITS: u32 = 0b1101;
/// All host memory types.
pub const FAKE_IMAGE_TYPE_BITS: u32 = 0b1111;

struct FakeAllocation {
    data: Box<[u8]>,
    type_index: u32,
    mapped: bool,
}

#[derive(Default)]
struct FakeState {
    instances: HashSet<u64>,
    physical_devices: HashMap<u64, Vec<u64>>,
    devices: HashSet<u64>,
    queues: HashMap<(u64, u32, u32), u64>,
    allocations: HashMap<u64, FakeAllocation>,
    buffers: HashMap<u64, u64>,
    images: HashMap<u64, [u32; 3]>,
    fences: HashMap<u64, bool>,
    /// Everything else that has a destroy call
    objects: HashSet<u64>,
    descriptor_sets: HashMap<u64, u64>,
    command_buffers: HashMap<u64, u64>,
}

/// In-process stand-in for the host GPU driver.
pub struct FakeDriver {
    state: Mutex<FakeState>,
    next_handle: AtomicU64,
    physical_device_count: usize,
    held: Mutex<bool>,
    released: Condvar,
    /// Notified whenever a fence is signaled
    fence_signaled: Condvar,
    submits: AtomicU64,
    queue_waits: AtomicU64,
    command_buffer_ops: AtomicU64,
    destroyed_instances: AtomicU64,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::with_physical_devices(1)
    }

    pub fn with_physical_devices(count: usize) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            next_handle: AtomicU64::new(0x1000),
            physical_device_count: count,
            held: Mutex::new(false),
            released: Condvar::new(),
            fence_signaled: Condvar::new(),
            submits: AtomicU64::new(0),
            queue_waits: AtomicU64::new(0),
            command_buffer_ops: AtomicU64::new(0),
            destroyed_instances: AtomicU64::new(0),
        }
    }

    /// Block every queue submission until [`release_submissions`](Self::release_submissions).
    pub fn hold_submissions(&self) {
        *self.held.lock() = true;
    }

    pub fn release_submissions(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }

    pub fn submit_count(&self) -> u64 {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn queue_wait_count(&self) -> u64 {
        self.queue_waits.load(Ordering::SeqCst)
    }

    /// Begin/end/reset calls on command buffers.
    pub fn command_buffer_op_count(&self) -> u64 {
        self.command_buffer_ops.load(Ordering::SeqCst)
    }

    pub fn destroyed_instance_count(&self) -> u64 {
        self.destroyed_instances.load(Ordering::SeqCst)
    }

    pub fn live_instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    pub fn live_device_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    pub fn live_allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Host memory type index an allocation was made with.
    pub fn allocation_type_index(&self, memory: vk::DeviceMemory) -> Option<u32> {
        self.state
            .lock()
            .allocations
            .get(&memory.as_raw())
            .map(|a| a.type_index)
    }

    pub fn is_mapped(&self, memory: vk::DeviceMemory) -> bool {
        self.state
            .lock()
            .allocations
            .get(&memory.as_raw())
            .map(|a| a.mapped)
            .unwrap_or(false)
    }

    /// Copy of an allocation's backing bytes.
    pub fn read_memory(&self, memory: vk::DeviceMemory) -> Option<Vec<u8>> {
        self.state
            .lock()
            .allocations
            .get(&memory.as_raw())
            .map(|a| a.data.to_vec())
    }

    fn next(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn wait_for_gate(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
    }

    fn check_device(&self, device: vk::Device) -> VkResult<()> {
        if self.state.lock().devices.contains(&device.as_raw()) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_DEVICE_LOST)
        }
    }

    fn new_object(&self, device: vk::Device) -> VkResult<u64> {
        self.check_device(device)?;
        let raw = self.next();
        self.state.lock().objects.insert(raw);
        Ok(raw)
    }

    fn drop_object(&self, raw: u64) {
        if !self.state.lock().objects.remove(&raw) {
            debug!(raw, "fake driver: destroy of unknown object");
        }
    }

    fn memory_properties() -> MemoryProperties {
        let device_local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        MemoryProperties {
            types: vec![
                MemoryType {
                    property_flags: device_local,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: device_local | vk::MemoryPropertyFlags::PROTECTED,
                    heap_index: 0,
                },
                MemoryType {
                    property_flags: host,
                    heap_index: 1,
                },
                MemoryType {
                    property_flags: host | vk::MemoryPropertyFlags::HOST_CACHED,
                    heap_index: 1,
                },
            ],
            heaps: vec![
                MemoryHeap {
                    size: 256 << 20,
                    flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: 256 << 20,
                    flags: vk::MemoryHeapFlags::empty(),
                },
            ],
        }
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for FakeDriver {
    fn enumerate_instance_version(&self) -> VkResult<u32> {
        Ok(vk::make_api_version(0, 1, 3, 0))
    }

    fn create_instance(&self, _info: &InstanceCreateInfo) -> VkResult<vk::Instance> {
        let raw = self.next();
        let pds = (0..self.physical_device_count).map(|_| self.next()).collect();
        let mut state = self.state.lock();
        state.instances.insert(raw);
        state.physical_devices.insert(raw, pds);
        Ok(vk::Instance::from_raw(raw))
    }

    fn destroy_instance(&self, instance: vk::Instance) {
        let mut state = self.state.lock();
        if state.instances.remove(&instance.as_raw()) {
            state.physical_devices.remove(&instance.as_raw());
            self.destroyed_instances.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn enumerate_physical_devices(&self, instance: vk::Instance) -> VkResult<Vec<vk::PhysicalDevice>> {
        let state = self.state.lock();
        state
            .physical_devices
            .get(&instance.as_raw())
            .map(|pds| pds.iter().map(|pd| vk::PhysicalDevice::from_raw(*pd)).collect())
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn get_physical_device_properties(
        &self,
        _instance: vk::Instance,
        _physical_device: vk::PhysicalDevice,
    ) -> VkResult<DeviceProperties> {
        Ok(DeviceProperties {
            api_version: vk::make_api_version(0, 1, 3, 250),
            driver_version: vk::make_api_version(0, 24, 0, 0),
            vendor_id: 0x10005,
            device_id: 0x0042,
            device_type: vk::PhysicalDeviceType::CPU,
            device_name: "vkhost fake device".to_string(),
            pipeline_cache_uuid: [7; 16],
        })
    }

    fn get_physical_device_features(
        &self,
        _instance: vk::Instance,
        _physical_device: vk::PhysicalDevice,
    ) -> VkResult<vk::PhysicalDeviceFeatures> {
        Ok(vk::PhysicalDeviceFeatures {
            robust_buffer_access: vk::TRUE,
            sampler_anisotropy: vk::TRUE,
            shader_int16: vk::TRUE,
            sparse_binding: vk::TRUE,
            sparse_residency_buffer: vk::TRUE,
            sparse_residency_image2_d: vk::TRUE,
            sparse_residency_aliased: vk::TRUE,
            ..Default::default()
        })
    }

    fn get_physical_device_memory_properties(
        &self,
        _instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<MemoryProperties> {
        let mut props = Self::memory_properties();
        // Only the first physical device of an instance has protected memory.
        let secondary = self
            .state
            .lock()
            .physical_devices
            .values()
            .any(|pds| pds.iter().skip(1).any(|pd| *pd == physical_device.as_raw()));
        if secondary {
            props
                .types
                .retain(|t| !t.property_flags.contains(vk::MemoryPropertyFlags::PROTECTED));
        }
        Ok(props)
    }

    fn get_physical_device_queue_family_properties(
        &self,
        _instance: vk::Instance,
        _physical_device: vk::PhysicalDevice,
    ) -> VkResult<Vec<vk::QueueFamilyProperties>> {
        Ok(vec![vk::QueueFamilyProperties {
            queue_flags: vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE
                | vk::QueueFlags::TRANSFER
                | vk::QueueFlags::SPARSE_BINDING,
            queue_count: 2,
            timestamp_valid_bits: 64,
            min_image_transfer_granularity: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
        }])
    }

    fn get_physical_device_format_properties(
        &self,
        _instance: vk::Instance,
        _physical_device: vk::PhysicalDevice,
        format: vk::Format,
    ) -> VkResult<vk::FormatProperties> {
        if format == vk::Format::UNDEFINED {
            return Ok(vk::FormatProperties::default());
        }
        Ok(vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::DISJOINT,
            optimal_tiling_features: vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::COLOR_ATTACHMENT
                | vk::FormatFeatureFlags::TRANSFER_SRC
                | vk::FormatFeatureFlags::TRANSFER_DST
                | vk::FormatFeatureFlags::DISJOINT,
            buffer_features: vk::FormatFeatureFlags::VERTEX_BUFFER,
        })
    }

    fn get_physical_device_image_format_properties(
        &self,
        _instance: vk::Instance,
        _physical_device: vk::PhysicalDevice,
        query: &ImageFormatQuery,
    ) -> VkResult<vk::ImageFormatProperties> {
        if query.format == vk::Format::UNDEFINED.as_raw() {
            return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED);
        }
        Ok(vk::ImageFormatProperties {
            max_extent: vk::Extent3D {
                width: 16384,
                height: 16384,
                depth: 2048,
            },
            max_mip_levels: 15,
            max_array_layers: 2048,
            sample_counts: vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4,
            max_resource_size: 1 << 31,
        })
    }

    fn enumerate_device_extension_properties(
        &self,
        _instance: vk::Instance,
        _physical_device: vk::PhysicalDevice,
    ) -> VkResult<Vec<ExtensionProperties>> {
        Ok([
            ("VK_KHR_maintenance1", 2),
            ("VK_KHR_bind_memory2", 1),
            ("VK_KHR_external_memory", 1),
            ("VK_KHR_external_memory_fd", 1),
            ("VK_KHR_swapchain", 70),
            ("VK_EXT_debug_marker", 4),
        ]
        .iter()
        .map(|(name, version)| ExtensionProperties {
            extension_name: name.to_string(),
            spec_version: *version,
        })
        .collect())
    }

    fn get_physical_device_features2(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<PhysicalDeviceFeatures2> {
        Ok(PhysicalDeviceFeatures2 {
            features: self.get_physical_device_features(instance, physical_device)?,
            protected_memory: true,
            sampler_ycbcr_conversion: true,
        })
    }

    fn get_physical_device_id_properties(
        &self,
        _instance: vk::Instance,
        _physical_device: vk::PhysicalDevice,
    ) -> VkResult<DeviceIdProperties> {
        Ok(DeviceIdProperties {
            device_uuid: [0x42; 16],
            driver_uuid: [0x24; 16],
        })
    }

    /// Only opaque fds are supported.
    fn get_physical_device_external_semaphore_properties(
        &self,
        _instance: vk::Instance,
        _physical_device: vk::PhysicalDevice,
        handle_type: vk::ExternalSemaphoreHandleTypeFlags,
    ) -> VkResult<ExternalSemaphoreProperties> {
        if handle_type != vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD {
            return Ok(ExternalSemaphoreProperties::default());
        }
        Ok(ExternalSemaphoreProperties {
            export_from_imported_handle_types: handle_type,
            compatible_handle_types: handle_type,
            external_semaphore_features: vk::ExternalSemaphoreFeatureFlags::EXPORTABLE
                | vk::ExternalSemaphoreFeatureFlags::IMPORTABLE,
        })
    }

    fn create_device(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        _info: &DeviceCreateInfo,
    ) -> VkResult<vk::Device> {
        let known = self
            .state
            .lock()
            .physical_devices
            .get(&instance.as_raw())
            .map(|pds| pds.contains(&physical_device.as_raw()))
            .unwrap_or(false);
        if !known {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let raw = self.next();
        self.state.lock().devices.insert(raw);
        Ok(vk::Device::from_raw(raw))
    }

    fn destroy_device(&self, device: vk::Device) {
        let mut state = self.state.lock();
        state.devices.remove(&device.as_raw());
        state.queues.retain(|(dev, _, _), _| *dev != device.as_raw());
    }

    fn get_device_queue(&self, device: vk::Device, family_index: u32, queue_index: u32) -> VkResult<vk::Queue> {
        self.check_device(device)?;
        let fresh = self.next();
        let mut state = self.state.lock();
        let raw = *state
            .queues
            .entry((device.as_raw(), family_index, queue_index))
            .or_insert(fresh);
        Ok(vk::Queue::from_raw(raw))
    }

    fn device_wait_idle(&self, device: vk::Device) -> VkResult<()> {
        self.check_device(device)
    }

    // ── Memory ──────────────────────────────────────────────

    fn allocate_memory(
        &self,
        device: vk::Device,
        size: u64,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        self.check_device(device)?;
        if size == 0 || size > MAX_ALLOCATION {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        if memory_type_index as usize >= Self::memory_properties().types.len() {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let raw = self.next();
        self.state.lock().allocations.insert(
            raw,
            FakeAllocation {
                data: vec![0u8; size as usize].into_boxed_slice(),
                type_index: memory_type_index,
                mapped: false,
            },
        );
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, _device: vk::Device, memory: vk::DeviceMemory) {
        self.state.lock().allocations.remove(&memory.as_raw());
    }

    fn map_memory(
        &self,
        _device: vk::Device,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<HostPtr> {
        let mut state = self.state.lock();
        let alloc = state
            .allocations
            .get_mut(&memory.as_raw())
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let flags = Self::memory_properties().types[alloc.type_index as usize].property_flags;
        if !flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) || alloc.mapped {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let len = alloc.data.len() as u64;
        let end = if size == vk::WHOLE_SIZE {
            len
        } else {
            offset.saturating_add(size)
        };
        if offset >= len || end > len {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        alloc.mapped = true;
        let base = alloc.data.as_mut_ptr();
        HostPtr::new(unsafe { base.add(offset as usize) }).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn unmap_memory(&self, _device: vk::Device, memory: vk::DeviceMemory) {
        if let Some(alloc) = self.state.lock().allocations.get_mut(&memory.as_raw()) {
            alloc.mapped = false;
        }
    }

    fn flush_mapped_memory_ranges(
        &self,
        device: vk::Device,
        _ranges: &[(vk::DeviceMemory, u64, u64)],
    ) -> VkResult<()> {
        self.check_device(device)
    }

    fn invalidate_mapped_memory_ranges(
        &self,
        device: vk::Device,
        _ranges: &[(vk::DeviceMemory, u64, u64)],
    ) -> VkResult<()> {
        self.check_device(device)
    }

    // ── Buffers / Images ────────────────────────────────────

    fn create_buffer(&self, device: vk::Device, info: &BufferCreateInfo) -> VkResult<vk::Buffer> {
        self.check_device(device)?;
        if info.size == 0 {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let raw = self.next();
        self.state.lock().buffers.insert(raw, info.size);
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, _device: vk::Device, buffer: vk::Buffer) {
        self.state.lock().buffers.remove(&buffer.as_raw());
    }

    fn get_buffer_memory_requirements(
        &self,
        _device: vk::Device,
        buffer: vk::Buffer,
    ) -> VkResult<vk::MemoryRequirements> {
        let size = *self
            .state
            .lock()
            .buffers
            .get(&buffer.as_raw())
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        Ok(vk::MemoryRequirements {
            size: size.div_ceil(BUFFER_ALIGNMENT) * BUFFER_ALIGNMENT,
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: FAKE_BUFFER_TYPE_BITS,
        })
    }

    fn bind_buffer_memory(
        &self,
        _device: vk::Device,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        _offset: u64,
    ) -> VkResult<()> {
        let state = self.state.lock();
        if state.buffers.contains_key(&buffer.as_raw())
            && state.allocations.contains_key(&memory.as_raw())
        {
            Ok(())
        } else {
            Err(vk::Result::ERROR_DEVICE_LOST)
        }
    }

    fn bind_buffer_memory2(
        &self,
        device: vk::Device,
        binds: &[(vk::Buffer, vk::DeviceMemory, u64)],
    ) -> VkResult<()> {
        for (buffer, memory, offset) in binds {
            self.bind_buffer_memory(device, *buffer, *memory, *offset)?;
        }
        Ok(())
    }

    fn create_image(&self, device: vk::Device, info: &ImageCreateInfo) -> VkResult<vk::Image> {
        self.check_device(device)?;
        let raw = self.next();
        self.state.lock().images.insert(raw, info.extent);
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, _device: vk::Device, image: vk::Image) {
        self.state.lock().images.remove(&image.as_raw());
    }

    fn get_image_memory_requirements(
        &self,
        _device: vk::Device,
        image: vk::Image,
    ) -> VkResult<vk::MemoryRequirements> {
        let extent = *self
            .state
            .lock()
            .images
            .get(&image.as_raw())
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let texels = extent.iter().map(|d| u64::from((*d).max(1))).product::<u64>();
        Ok(vk::MemoryRequirements {
            size: (texels * 4).div_ceil(4096) * 4096,
            alignment: 4096,
            memory_type_bits: FAKE_IMAGE_TYPE_BITS,
        })
    }

    fn get_image_memory_requirements2(
        &self,
        device: vk::Device,
        image: vk::Image,
    ) -> VkResult<MemoryRequirements2> {
        let requirements = self.get_image_memory_requirements(device, image)?;
        Ok(MemoryRequirements2 {
            requirements,
            prefers_dedicated: requirements.size >= DEDICATED_THRESHOLD,
            requires_dedicated: false,
        })
    }

    /// Four bytes per texel, rows padded to [`FAKE_ROW_PITCH_ALIGNMENT`].
    fn get_image_subresource_layout(&self, _device: vk::Device, image: vk::Image) -> VkResult<vk::SubresourceLayout> {
        let extent = *self
            .state
            .lock()
            .images
            .get(&image.as_raw())
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?;
        let row_pitch = (u64::from(extent[0].max(1)) * 4).next_multiple_of(FAKE_ROW_PITCH_ALIGNMENT);
        let size = row_pitch * u64::from(extent[1].max(1));
        Ok(vk::SubresourceLayout {
            offset: 0,
            size,
            row_pitch,
            array_pitch: size,
            depth_pitch: size,
        })
    }

    fn bind_image_memory(
        &self,
        _device: vk::Device,
        image: vk::Image,
        memory: vk::DeviceMemory,
        _offset: u64,
    ) -> VkResult<()> {
        let state = self.state.lock();
        if state.images.contains_key(&image.as_raw())
            && state.allocations.contains_key(&memory.as_raw())
        {
            Ok(())
        } else {
            Err(vk::Result::ERROR_DEVICE_LOST)
        }
    }

    fn create_image_view(
        &self,
        device: vk::Device,
        image: vk::Image,
        _info: &ImageViewCreateInfo,
    ) -> VkResult<vk::ImageView> {
        if !self.state.lock().images.contains_key(&image.as_raw()) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(vk::ImageView::from_raw(self.new_object(device)?))
    }

    fn destroy_image_view(&self, _device: vk::Device, view: vk::ImageView) {
        self.drop_object(view.as_raw());
    }

    fn create_sampler(&self, device: vk::Device, _info: &SamplerCreateInfo) -> VkResult<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.new_object(device)?))
    }

    fn destroy_sampler(&self, _device: vk::Device, sampler: vk::Sampler) {
        self.drop_object(sampler.as_raw());
    }

    // ── Descriptors ─────────────────────────────────────────

    fn create_descriptor_set_layout(
        &self,
        device: vk::Device,
        _info: &DescriptorSetLayoutCreateInfo,
    ) -> VkResult<vk::DescriptorSetLayout> {
        Ok(vk::DescriptorSetLayout::from_raw(self.new_object(device)?))
    }

    fn destroy_descriptor_set_layout(&self, _device: vk::Device, layout: vk::DescriptorSetLayout) {
        self.drop_object(layout.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        device: vk::Device,
        _info: &DescriptorPoolCreateInfo,
    ) -> VkResult<vk::DescriptorPool> {
        Ok(vk::DescriptorPool::from_raw(self.new_object(device)?))
    }

    fn destroy_descriptor_pool(&self, _device: vk::Device, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state.objects.remove(&pool.as_raw());
        state.descriptor_sets.retain(|_, p| *p != pool.as_raw());
    }

    fn reset_descriptor_pool(&self, _device: vk::Device, pool: vk::DescriptorPool) -> VkResult<()> {
        self.state
            .lock()
            .descriptor_sets
            .retain(|_, p| *p != pool.as_raw());
        Ok(())
    }

    fn allocate_descriptor_sets(
        &self,
        device: vk::Device,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        self.check_device(device)?;
        {
            let state = self.state.lock();
            if !state.objects.contains(&pool.as_raw())
                || layouts.iter().any(|l| !state.objects.contains(&l.as_raw()))
            {
                return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
            }
        }
        let sets: Vec<u64> = layouts.iter().map(|_| self.next()).collect();
        let mut state = self.state.lock();
        for set in &sets {
            state.descriptor_sets.insert(*set, pool.as_raw());
        }
        Ok(sets.into_iter().map(vk::DescriptorSet::from_raw).collect())
    }

    fn free_descriptor_sets(
        &self,
        _device: vk::Device,
        _pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        for set in sets {
            state.descriptor_sets.remove(&set.as_raw());
        }
        Ok(())
    }

    fn update_descriptor_sets(&self, _device: vk::Device, writes: &[DescriptorWrite]) {
        let state = self.state.lock();
        for write in writes {
            if !state.descriptor_sets.contains_key(&write.dst_set.as_raw()) {
                debug!(set = write.dst_set.as_raw(), "fake driver: write to unknown set");
            }
        }
    }

    fn create_descriptor_update_template(
        &self,
        device: vk::Device,
        _layout: vk::DescriptorSetLayout,
        _info: &DescriptorUpdateTemplateCreateInfo,
    ) -> VkResult<vk::DescriptorUpdateTemplate> {
        Ok(vk::DescriptorUpdateTemplate::from_raw(self.new_object(device)?))
    }

    fn destroy_descriptor_update_template(
        &self,
        _device: vk::Device,
        template: vk::DescriptorUpdateTemplate,
    ) {
        self.drop_object(template.as_raw());
    }

    // ── Render Pass ─────────────────────────────────────────

    fn create_render_pass(&self, device: vk::Device, _info: &RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        Ok(vk::RenderPass::from_raw(self.new_object(device)?))
    }

    fn destroy_render_pass(&self, _device: vk::Device, render_pass: vk::RenderPass) {
        self.drop_object(render_pass.as_raw());
    }

    // ── Command Pool / Buffer ───────────────────────────────

    fn create_command_pool(
        &self,
        device: vk::Device,
        _info: &CommandPoolCreateInfo,
    ) -> VkResult<vk::CommandPool> {
        Ok(vk::CommandPool::from_raw(self.new_object(device)?))
    }

    fn destroy_command_pool(&self, _device: vk::Device, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state.objects.remove(&pool.as_raw());
        state.command_buffers.retain(|_, p| *p != pool.as_raw());
    }

    fn reset_command_pool(&self, device: vk::Device, _pool: vk::CommandPool, _flags: u32) -> VkResult<()> {
        self.check_device(device)
    }

    fn allocate_command_buffers(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        self.check_device(device)?;
        if !self.state.lock().objects.contains(&pool.as_raw()) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let buffers: Vec<u64> = (0..count).map(|_| self.next()).collect();
        let mut state = self.state.lock();
        for cb in &buffers {
            state.command_buffers.insert(*cb, pool.as_raw());
        }
        Ok(buffers.into_iter().map(vk::CommandBuffer::from_raw).collect())
    }

    fn free_command_buffers(
        &self,
        _device: vk::Device,
        _pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        let mut state = self.state.lock();
        for cb in command_buffers {
            state.command_buffers.remove(&cb.as_raw());
        }
    }

    fn begin_command_buffer(
        &self,
        _device: vk::Device,
        command_buffer: vk::CommandBuffer,
        _flags: u32,
    ) -> VkResult<()> {
        self.touch_command_buffer(command_buffer)
    }

    fn end_command_buffer(&self, _device: vk::Device, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.touch_command_buffer(command_buffer)
    }

    fn reset_command_buffer(
        &self,
        _device: vk::Device,
        command_buffer: vk::CommandBuffer,
        _flags: u32,
    ) -> VkResult<()> {
        self.touch_command_buffer(command_buffer)
    }

    // ── Queue ───────────────────────────────────────────────

    fn queue_submit(
        &self,
        device: vk::Device,
        _queue: vk::Queue,
        _submits: &[SubmitBatch],
        fence: vk::Fence,
    ) -> VkResult<()> {
        self.wait_for_gate();
        self.check_device(device)?;
        self.submits.fetch_add(1, Ordering::SeqCst);
        self.signal(fence);
        Ok(())
    }

    fn queue_wait_idle(&self, device: vk::Device, _queue: vk::Queue) -> VkResult<()> {
        self.wait_for_gate();
        self.check_device(device)?;
        self.queue_waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn queue_bind_sparse(
        &self,
        device: vk::Device,
        _queue: vk::Queue,
        _binds: &[SparseBindBatch],
        fence: vk::Fence,
    ) -> VkResult<()> {
        self.wait_for_gate();
        self.check_device(device)?;
        self.signal(fence);
        Ok(())
    }

    // ── Sync Objects ────────────────────────────────────────

    fn create_semaphore(&self, device: vk::Device) -> VkResult<vk::Semaphore> {
        Ok(vk::Semaphore::from_raw(self.new_object(device)?))
    }

    fn destroy_semaphore(&self, _device: vk::Device, semaphore: vk::Semaphore) {
        self.drop_object(semaphore.as_raw());
    }

    fn create_fence(&self, device: vk::Device, signaled: bool) -> VkResult<vk::Fence> {
        self.check_device(device)?;
        let raw = self.next();
        self.state.lock().fences.insert(raw, signaled);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, _device: vk::Device, fence: vk::Fence) {
        self.state.lock().fences.remove(&fence.as_raw());
    }

    /// Blocks until the fences signal or `timeout_ns` passes.
    fn wait_for_fences(
        &self,
        _device: vk::Device,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult<()> {
        let done = |state: &FakeState| {
            let mut signaled = fences
                .iter()
                .map(|f| state.fences.get(&f.as_raw()).copied().unwrap_or(false));
            if wait_all {
                signaled.all(|s| s)
            } else {
                signaled.any(|s| s)
            }
        };
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        while !done(&state) {
            match deadline {
                Some(deadline) => {
                    if self.fence_signaled.wait_until(&mut state, deadline).timed_out() && !done(&state) {
                        return Err(vk::Result::TIMEOUT);
                    }
                }
                None => self.fence_signaled.wait(&mut state),
            }
        }
        Ok(())
    }

    fn reset_fences(&self, _device: vk::Device, fences: &[vk::Fence]) -> VkResult<()> {
        let mut state = self.state.lock();
        for fence in fences {
            if let Some(signaled) = state.fences.get_mut(&fence.as_raw()) {
                *signaled = false;
            }
        }
        Ok(())
    }

    fn get_fence_status(&self, _device: vk::Device, fence: vk::Fence) -> VkResult<bool> {
        self.state
            .lock()
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_DEVICE_LOST)
    }
}

impl FakeDriver {
    fn touch_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        if !self
            .state
            .lock()
            .command_buffers
            .contains_key(&command_buffer.as_raw())
        {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        self.command_buffer_ops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn signal(&self, fence: vk::Fence) {
        if fence != vk::Fence::null() {
            if let Some(signaled) = self.state.lock().fences.get_mut(&fence.as_raw()) {
                *signaled = true;
            }
            self.fence_signaled.notify_all();
        }
    }
}
