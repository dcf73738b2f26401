use std::ffi::{c_char, CStr, CString};

use ash::prelude::VkResult;
use ash::vk;
use dashmap::DashMap;
use tracing::{debug, info};

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

/// Driver backed by the system Vulkan loader.
pub struct AshDriver {
    /// The ash Entry (loaded once)
    entry: ash::Entry,
    instances: DashMap<vk::Instance, ash::Instance>,
    devices: DashMap<vk::Device, ash::Device>,
}

impl AshDriver {
    /// Load the system Vulkan loader.
    pub fn load() -> Result<Self, ash::LoadingError> {
        let entry = unsafe { ash::Entry::load()? };
        info!("Vulkan entry loaded successfully");
        Ok(Self {
            entry,
            instances: DashMap::new(),
            devices: DashMap::new(),
        })
    }

    fn instance(
        &self,
        instance: vk::Instance,
    ) -> VkResult<dashmap::mapref::one::Ref<'_, vk::Instance, ash::Instance>> {
        self.instances
            .get(&instance)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
    }

    fn device(
        &self,
        device: vk::Device,
    ) -> VkResult<dashmap::mapref::one::Ref<'_, vk::Device, ash::Device>> {
        self.devices.get(&device).ok_or(vk::Result::ERROR_DEVICE_LOST)
    }
}

fn c_strings(names: &[String]) -> Vec<CString> {
    names
        .iter()
        .map(|s| CString::new(s.as_str()).unwrap_or_default())
        .collect()
}

fn c_ptrs(names: &[CString]) -> Vec<*const c_char> {
    names.iter().map(|s| s.as_ptr()).collect()
}

fn attachment_refs(
    refs: &[vkhost_protocol::vulkan_commands::AttachmentReference],
) -> Vec<vk::AttachmentReference> {
    refs.iter()
        .map(|r| vk::AttachmentReference {
            attachment: r.attachment,
            layout: vk::ImageLayout::from_raw(r.layout),
        })
        .collect()
}

fn mapped_ranges(ranges: &[(vk::DeviceMemory, u64, u64)]) -> Vec<vk::MappedMemoryRange<'static>> {
    ranges
        .iter()
        .map(|(memory, offset, size)| {
            vk::MappedMemoryRange::default()
                .memory(*memory)
                .offset(*offset)
                .size(*size)
        })
        .collect()
}

impl Driver for AshDriver {
    // ── Instance ────────────────────────────────────────────

    fn enumerate_instance_version(&self) -> VkResult<u32> {
        let version = unsafe { self.entry.try_enumerate_instance_version()? };
        Ok(version.unwrap_or(vk::API_VERSION_1_0))
    }

    fn create_instance(&self, info: &InstanceCreateInfo) -> VkResult<vk::Instance> {
        let app_name_c = info
            .app_name
            .as_deref()
            .map(|s| CString::new(s).unwrap_or_default());
        let engine_name_c = info
            .engine_name
            .as_deref()
            .map(|s| CString::new(s).unwrap_or_default());

        let mut app_info = vk::ApplicationInfo::default()
            .application_version(info.app_version)
            .engine_version(info.engine_version)
            .api_version(if info.api_version == 0 {
                vk::API_VERSION_1_1
            } else {
                info.api_version
            });
        if let Some(ref name) = app_name_c {
            app_info = app_info.application_name(name.as_c_str());
        }
        if let Some(ref name) = engine_name_c {
            app_info = app_info.engine_name(name.as_c_str());
        }

        let extensions = c_strings(&info.enabled_extensions);
        let extension_ptrs = c_ptrs(&extensions);
        let layers = c_strings(&info.enabled_layers);
        let layer_ptrs = c_ptrs(&layers);

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { self.entry.create_instance(&create_info, None)? };
        let raw = instance.handle();
        self.instances.insert(raw, instance);
        Ok(raw)
    }

    fn destroy_instance(&self, instance: vk::Instance) {
        if let Some((_, wrapper)) = self.instances.remove(&instance) {
            unsafe { wrapper.destroy_instance(None) };
        }
    }

    fn enumerate_physical_devices(&self, instance: vk::Instance) -> VkResult<Vec<vk::PhysicalDevice>> {
        let wrapper = self.instance(instance)?;
        unsafe { wrapper.enumerate_physical_devices() }
    }

    // ── Physical Device Queries ─────────────────────────────

    fn get_physical_device_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<DeviceProperties> {
        let wrapper = self.instance(instance)?;
        let props = unsafe { wrapper.get_physical_device_properties(physical_device) };
        let device_name = unsafe {
            CStr::from_ptr(props.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };
        Ok(DeviceProperties {
            api_version: props.api_version,
            driver_version: props.driver_version,
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            device_type: props.device_type,
            device_name,
            pipeline_cache_uuid: props.pipeline_cache_uuid,
        })
    }

    fn get_physical_device_features(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<vk::PhysicalDeviceFeatures> {
        let wrapper = self.instance(instance)?;
        Ok(unsafe { wrapper.get_physical_device_features(physical_device) })
    }

    fn get_physical_device_memory_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<MemoryProperties> {
        let wrapper = self.instance(instance)?;
        let props = unsafe { wrapper.get_physical_device_memory_properties(physical_device) };
        Ok(MemoryProperties {
            types: props.memory_types[..props.memory_type_count as usize]
                .iter()
                .map(|t| MemoryType {
                    property_flags: t.property_flags,
                    heap_index: t.heap_index,
                })
                .collect(),
            heaps: props.memory_heaps[..props.memory_heap_count as usize]
                .iter()
                .map(|h| MemoryHeap {
                    size: h.size,
                    flags: h.flags,
                })
                .collect(),
        })
    }

    fn get_physical_device_queue_family_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<Vec<vk::QueueFamilyProperties>> {
        let wrapper = self.instance(instance)?;
        Ok(unsafe { wrapper.get_physical_device_queue_family_properties(physical_device) })
    }

    fn get_physical_device_format_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        format: vk::Format,
    ) -> VkResult<vk::FormatProperties> {
        let wrapper = self.instance(instance)?;
        Ok(unsafe { wrapper.get_physical_device_format_properties(physical_device, format) })
    }

    fn get_physical_device_image_format_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        query: &ImageFormatQuery,
    ) -> VkResult<vk::ImageFormatProperties> {
        let wrapper = self.instance(instance)?;
        unsafe {
            wrapper.get_physical_device_image_format_properties(
                physical_device,
                vk::Format::from_raw(query.format),
                vk::ImageType::from_raw(query.image_type),
                vk::ImageTiling::from_raw(query.tiling),
                vk::ImageUsageFlags::from_raw(query.usage),
                vk::ImageCreateFlags::from_raw(query.flags),
            )
        }
    }

    fn enumerate_device_extension_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<Vec<ExtensionProperties>> {
        let wrapper = self.instance(instance)?;
        let props = unsafe { wrapper.enumerate_device_extension_properties(physical_device)? };
        Ok(props
            .iter()
            .map(|p| ExtensionProperties {
                extension_name: unsafe {
                    CStr::from_ptr(p.extension_name.as_ptr())
                        .to_string_lossy()
                        .into_owned()
                },
                spec_version: p.spec_version,
            })
            .collect())
    }

    fn get_physical_device_features2(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<PhysicalDeviceFeatures2> {
        let wrapper = self.instance(instance)?;
        let mut protected = vk::PhysicalDeviceProtectedMemoryFeatures::default();
        let mut ycbcr = vk::PhysicalDeviceSamplerYcbcrConversionFeatures::default();
        let features = {
            let mut features2 = vk::PhysicalDeviceFeatures2::default()
                .push_next(&mut protected)
                .push_next(&mut ycbcr);
            unsafe { wrapper.get_physical_device_features2(physical_device, &mut features2) };
            features2.features
        };
        Ok(PhysicalDeviceFeatures2 {
            features,
            protected_memory: protected.protected_memory == vk::TRUE,
            sampler_ycbcr_conversion: ycbcr.sampler_ycbcr_conversion == vk::TRUE,
        })
    }

    fn get_physical_device_id_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
    ) -> VkResult<DeviceIdProperties> {
        let wrapper = self.instance(instance)?;
        let mut ids = vk::PhysicalDeviceIDProperties::default();
        {
            let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut ids);
            unsafe { wrapper.get_physical_device_properties2(physical_device, &mut props2) };
        }
        Ok(DeviceIdProperties {
            device_uuid: ids.device_uuid,
            driver_uuid: ids.driver_uuid,
        })
    }

    fn get_physical_device_external_semaphore_properties(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        handle_type: vk::ExternalSemaphoreHandleTypeFlags,
    ) -> VkResult<ExternalSemaphoreProperties> {
        let wrapper = self.instance(instance)?;
        let info = vk::PhysicalDeviceExternalSemaphoreInfo::default().handle_type(handle_type);
        let mut props = vk::ExternalSemaphoreProperties::default();
        unsafe {
            wrapper.get_physical_device_external_semaphore_properties(physical_device, &info, &mut props)
        };
        Ok(ExternalSemaphoreProperties {
            export_from_imported_handle_types: props.export_from_imported_handle_types,
            compatible_handle_types: props.compatible_handle_types,
            external_semaphore_features: props.external_semaphore_features,
        })
    }

    // ── Logical Device ──────────────────────────────────────

    fn create_device(
        &self,
        instance: vk::Instance,
        physical_device: vk::PhysicalDevice,
        info: &DeviceCreateInfo,
    ) -> VkResult<vk::Device> {
        let wrapper = self.instance(instance)?;

        let vk_queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = info
            .queue_create_infos
            .iter()
            .map(|qi| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(qi.queue_family_index)
                    .queue_priorities(&qi.queue_priorities)
            })
            .collect();

        let features = info.enabled_features.as_ref().and_then(|raw| {
            if raw.len() == std::mem::size_of::<vk::PhysicalDeviceFeatures>() {
                Some(unsafe {
                    std::ptr::read_unaligned(raw.as_ptr() as *const vk::PhysicalDeviceFeatures)
                })
            } else {
                None
            }
        });

        let extensions = c_strings(&info.enabled_extensions);
        let extension_ptrs = c_ptrs(&extensions);

        let mut device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&vk_queue_create_infos)
            .enabled_extension_names(&extension_ptrs);
        if let Some(ref f) = features {
            device_create_info = device_create_info.enabled_features(f);
        }

        let device = unsafe { wrapper.create_device(physical_device, &device_create_info, None)? };
        let raw = device.handle();
        self.devices.insert(raw, device);
        debug!(?raw, "created driver device");
        Ok(raw)
    }

    fn destroy_device(&self, device: vk::Device) {
        if let Some((_, wrapper)) = self.devices.remove(&device) {
            unsafe { wrapper.destroy_device(None) };
        }
    }

    fn get_device_queue(&self, device: vk::Device, family_index: u32, queue_index: u32) -> VkResult<vk::Queue> {
        let dev = self.device(device)?;
        Ok(unsafe { dev.get_device_queue(family_index, queue_index) })
    }

    fn device_wait_idle(&self, device: vk::Device) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.device_wait_idle() }
    }

    // ── Memory ──────────────────────────────────────────────

    fn allocate_memory(
        &self,
        device: vk::Device,
        size: u64,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let dev = self.device(device)?;
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);
        unsafe { dev.allocate_memory(&alloc_info, None) }
    }

    fn free_memory(&self, device: vk::Device, memory: vk::DeviceMemory) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.free_memory(memory, None) };
        }
    }

    fn map_memory(
        &self,
        device: vk::Device,
        memory: vk::DeviceMemory,
        offset: u64,
        size: u64,
    ) -> VkResult<HostPtr> {
        let dev = self.device(device)?;
        let ptr = unsafe { dev.map_memory(memory, offset, size, vk::MemoryMapFlags::empty())? };
        HostPtr::new(ptr as *mut u8).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)
    }

    fn unmap_memory(&self, device: vk::Device, memory: vk::DeviceMemory) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.unmap_memory(memory) };
        }
    }

    fn flush_mapped_memory_ranges(
        &self,
        device: vk::Device,
        ranges: &[(vk::DeviceMemory, u64, u64)],
    ) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.flush_mapped_memory_ranges(&mapped_ranges(ranges)) }
    }

    fn invalidate_mapped_memory_ranges(
        &self,
        device: vk::Device,
        ranges: &[(vk::DeviceMemory, u64, u64)],
    ) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.invalidate_mapped_memory_ranges(&mapped_ranges(ranges)) }
    }

    // ── Buffers / Images ────────────────────────────────────

    fn create_buffer(&self, device: vk::Device, info: &BufferCreateInfo) -> VkResult<vk::Buffer> {
        let dev = self.device(device)?;
        let buffer_info = vk::BufferCreateInfo::default()
            .flags(vk::BufferCreateFlags::from_raw(info.flags))
            .size(info.size)
            .usage(vk::BufferUsageFlags::from_raw(info.usage))
            .sharing_mode(vk::SharingMode::from_raw(info.sharing_mode))
            .queue_family_indices(&info.queue_family_indices);
        unsafe { dev.create_buffer(&buffer_info, None) }
    }

    fn destroy_buffer(&self, device: vk::Device, buffer: vk::Buffer) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_buffer(buffer, None) };
        }
    }

    fn get_buffer_memory_requirements(
        &self,
        device: vk::Device,
        buffer: vk::Buffer,
    ) -> VkResult<vk::MemoryRequirements> {
        let dev = self.device(device)?;
        Ok(unsafe { dev.get_buffer_memory_requirements(buffer) })
    }

    fn bind_buffer_memory(
        &self,
        device: vk::Device,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.bind_buffer_memory(buffer, memory, offset) }
    }

    fn bind_buffer_memory2(
        &self,
        device: vk::Device,
        binds: &[(vk::Buffer, vk::DeviceMemory, u64)],
    ) -> VkResult<()> {
        let dev = self.device(device)?;
        let infos: Vec<vk::BindBufferMemoryInfo<'static>> = binds
            .iter()
            .map(|(buffer, memory, offset)| {
                vk::BindBufferMemoryInfo::default()
                    .buffer(*buffer)
                    .memory(*memory)
                    .memory_offset(*offset)
            })
            .collect();
        unsafe { dev.bind_buffer_memory2(&infos) }
    }

    fn create_image(&self, device: vk::Device, info: &ImageCreateInfo) -> VkResult<vk::Image> {
        let dev = self.device(device)?;
        let image_info = vk::ImageCreateInfo::default()
            .flags(vk::ImageCreateFlags::from_raw(info.flags))
            .image_type(vk::ImageType::from_raw(info.image_type))
            .format(vk::Format::from_raw(info.format))
            .extent(vk::Extent3D {
                width: info.extent[0],
                height: info.extent[1],
                depth: info.extent[2],
            })
            .mip_levels(info.mip_levels)
            .array_layers(info.array_layers)
            .samples(vk::SampleCountFlags::from_raw(info.samples))
            .tiling(vk::ImageTiling::from_raw(info.tiling))
            .usage(vk::ImageUsageFlags::from_raw(info.usage))
            .sharing_mode(vk::SharingMode::from_raw(info.sharing_mode))
            .queue_family_indices(&info.queue_family_indices)
            .initial_layout(vk::ImageLayout::from_raw(info.initial_layout));
        unsafe { dev.create_image(&image_info, None) }
    }

    fn destroy_image(&self, device: vk::Device, image: vk::Image) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_image(image, None) };
        }
    }

    fn get_image_memory_requirements(
        &self,
        device: vk::Device,
        image: vk::Image,
    ) -> VkResult<vk::MemoryRequirements> {
        let dev = self.device(device)?;
        Ok(unsafe { dev.get_image_memory_requirements(image) })
    }

    fn get_image_memory_requirements2(
        &self,
        device: vk::Device,
        image: vk::Image,
    ) -> VkResult<MemoryRequirements2> {
        let dev = self.device(device)?;
        let info = vk::ImageMemoryRequirementsInfo2::default().image(image);
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let requirements = {
            let mut out = vk::MemoryRequirements2::default().push_next(&mut dedicated);
            unsafe { dev.get_image_memory_requirements2(&info, &mut out) };
            out.memory_requirements
        };
        Ok(MemoryRequirements2 {
            requirements,
            prefers_dedicated: dedicated.prefers_dedicated_allocation == vk::TRUE,
            requires_dedicated: dedicated.requires_dedicated_allocation == vk::TRUE,
        })
    }

    fn get_image_subresource_layout(&self, device: vk::Device, image: vk::Image) -> VkResult<vk::SubresourceLayout> {
        let dev = self.device(device)?;
        let subresource = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        Ok(unsafe { dev.get_image_subresource_layout(image, subresource) })
    }

    fn bind_image_memory(
        &self,
        device: vk::Device,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.bind_image_memory(image, memory, offset) }
    }

    fn create_image_view(
        &self,
        device: vk::Device,
        image: vk::Image,
        info: &ImageViewCreateInfo,
    ) -> VkResult<vk::ImageView> {
        let dev = self.device(device)?;
        let range = info.subresource_range;
        let view_info = vk::ImageViewCreateInfo::default()
            .flags(vk::ImageViewCreateFlags::from_raw(info.flags))
            .image(image)
            .view_type(vk::ImageViewType::from_raw(info.view_type))
            .format(vk::Format::from_raw(info.format))
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::from_raw(info.components.r),
                g: vk::ComponentSwizzle::from_raw(info.components.g),
                b: vk::ComponentSwizzle::from_raw(info.components.b),
                a: vk::ComponentSwizzle::from_raw(info.components.a),
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::from_raw(range.aspect_mask),
                base_mip_level: range.base_mip_level,
                level_count: range.level_count,
                base_array_layer: range.base_array_layer,
                layer_count: range.layer_count,
            });
        unsafe { dev.create_image_view(&view_info, None) }
    }

    fn destroy_image_view(&self, device: vk::Device, view: vk::ImageView) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_image_view(view, None) };
        }
    }

    fn create_sampler(&self, device: vk::Device, info: &SamplerCreateInfo) -> VkResult<vk::Sampler> {
        let dev = self.device(device)?;
        let sampler_info = vk::SamplerCreateInfo::default()
            .flags(vk::SamplerCreateFlags::from_raw(info.flags))
            .mag_filter(vk::Filter::from_raw(info.mag_filter))
            .min_filter(vk::Filter::from_raw(info.min_filter))
            .mipmap_mode(vk::SamplerMipmapMode::from_raw(info.mipmap_mode))
            .address_mode_u(vk::SamplerAddressMode::from_raw(info.address_mode_u))
            .address_mode_v(vk::SamplerAddressMode::from_raw(info.address_mode_v))
            .address_mode_w(vk::SamplerAddressMode::from_raw(info.address_mode_w))
            .mip_lod_bias(info.mip_lod_bias)
            .anisotropy_enable(info.anisotropy_enable)
            .max_anisotropy(info.max_anisotropy)
            .compare_enable(info.compare_enable)
            .compare_op(vk::CompareOp::from_raw(info.compare_op))
            .min_lod(info.min_lod)
            .max_lod(info.max_lod)
            .border_color(vk::BorderColor::from_raw(info.border_color))
            .unnormalized_coordinates(info.unnormalized_coordinates);
        unsafe { dev.create_sampler(&sampler_info, None) }
    }

    fn destroy_sampler(&self, device: vk::Device, sampler: vk::Sampler) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_sampler(sampler, None) };
        }
    }

    // ── Descriptors ─────────────────────────────────────────

    fn create_descriptor_set_layout(
        &self,
        device: vk::Device,
        info: &DescriptorSetLayoutCreateInfo,
    ) -> VkResult<vk::DescriptorSetLayout> {
        let dev = self.device(device)?;
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = info
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(vk::DescriptorType::from_raw(b.descriptor_type))
                    .descriptor_count(b.descriptor_count)
                    .stage_flags(vk::ShaderStageFlags::from_raw(b.stage_flags))
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .flags(vk::DescriptorSetLayoutCreateFlags::from_raw(info.flags))
            .bindings(&bindings);
        unsafe { dev.create_descriptor_set_layout(&layout_info, None) }
    }

    fn destroy_descriptor_set_layout(&self, device: vk::Device, layout: vk::DescriptorSetLayout) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn create_descriptor_pool(
        &self,
        device: vk::Device,
        info: &DescriptorPoolCreateInfo,
    ) -> VkResult<vk::DescriptorPool> {
        let dev = self.device(device)?;
        let pool_sizes: Vec<vk::DescriptorPoolSize> = info
            .pool_sizes
            .iter()
            .map(|s| vk::DescriptorPoolSize {
                ty: vk::DescriptorType::from_raw(s.descriptor_type),
                descriptor_count: s.descriptor_count,
            })
            .collect();
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::from_raw(info.flags))
            .max_sets(info.max_sets)
            .pool_sizes(&pool_sizes);
        unsafe { dev.create_descriptor_pool(&pool_info, None) }
    }

    fn destroy_descriptor_pool(&self, device: vk::Device, pool: vk::DescriptorPool) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_descriptor_pool(pool, None) };
        }
    }

    fn reset_descriptor_pool(&self, device: vk::Device, pool: vk::DescriptorPool) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty()) }
    }

    fn allocate_descriptor_sets(
        &self,
        device: vk::Device,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let dev = self.device(device)?;
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        unsafe { dev.allocate_descriptor_sets(&alloc_info) }
    }

    fn free_descriptor_sets(
        &self,
        device: vk::Device,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.free_descriptor_sets(pool, sets) }
    }

    fn update_descriptor_sets(&self, device: vk::Device, writes: &[DescriptorWrite]) {
        let Ok(dev) = self.device(device) else {
            return;
        };
        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .map(|w| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(w.dst_set)
                    .dst_binding(w.dst_binding)
                    .dst_array_element(w.dst_array_element)
                    .descriptor_type(w.descriptor_type);
                if w.image_infos.is_empty() {
                    write.buffer_info(&w.buffer_infos)
                } else {
                    write.image_info(&w.image_infos)
                }
            })
            .collect();
        unsafe { dev.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn create_descriptor_update_template(
        &self,
        device: vk::Device,
        layout: vk::DescriptorSetLayout,
        info: &DescriptorUpdateTemplateCreateInfo,
    ) -> VkResult<vk::DescriptorUpdateTemplate> {
        let dev = self.device(device)?;
        let entries: Vec<vk::DescriptorUpdateTemplateEntry> = info
            .entries
            .iter()
            .map(|e| {
                vk::DescriptorUpdateTemplateEntry::default()
                    .dst_binding(e.dst_binding)
                    .dst_array_element(e.dst_array_element)
                    .descriptor_count(e.descriptor_count)
                    .descriptor_type(vk::DescriptorType::from_raw(e.descriptor_type))
                    .offset(e.offset)
                    .stride(e.stride)
            })
            .collect();
        let template_info = vk::DescriptorUpdateTemplateCreateInfo::default()
            .descriptor_update_entries(&entries)
            .template_type(vk::DescriptorUpdateTemplateType::from_raw(info.template_type))
            .descriptor_set_layout(layout)
            .pipeline_bind_point(vk::PipelineBindPoint::from_raw(info.pipeline_bind_point))
            .set(info.set);
        unsafe { dev.create_descriptor_update_template(&template_info, None) }
    }

    fn destroy_descriptor_update_template(
        &self,
        device: vk::Device,
        template: vk::DescriptorUpdateTemplate,
    ) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_descriptor_update_template(template, None) };
        }
    }

    // ── Render Pass ─────────────────────────────────────────

    fn create_render_pass(&self, device: vk::Device, info: &RenderPassCreateInfo) -> VkResult<vk::RenderPass> {
        let dev = self.device(device)?;

        let vk_attachments: Vec<vk::AttachmentDescription> = info
            .attachments
            .iter()
            .map(|a| {
                vk::AttachmentDescription::default()
                    .flags(vk::AttachmentDescriptionFlags::from_raw(a.flags))
                    .format(vk::Format::from_raw(a.format))
                    .samples(vk::SampleCountFlags::from_raw(a.samples))
                    .load_op(vk::AttachmentLoadOp::from_raw(a.load_op))
                    .store_op(vk::AttachmentStoreOp::from_raw(a.store_op))
                    .stencil_load_op(vk::AttachmentLoadOp::from_raw(a.stencil_load_op))
                    .stencil_store_op(vk::AttachmentStoreOp::from_raw(a.stencil_store_op))
                    .initial_layout(vk::ImageLayout::from_raw(a.initial_layout))
                    .final_layout(vk::ImageLayout::from_raw(a.final_layout))
            })
            .collect();

        // Subpass reference arrays must outlive the descriptions
        let input_refs: Vec<Vec<vk::AttachmentReference>> = info
            .subpasses
            .iter()
            .map(|sp| attachment_refs(&sp.input_attachments))
            .collect();
        let color_refs: Vec<Vec<vk::AttachmentReference>> = info
            .subpasses
            .iter()
            .map(|sp| attachment_refs(&sp.color_attachments))
            .collect();
        let resolve_refs: Vec<Vec<vk::AttachmentReference>> = info
            .subpasses
            .iter()
            .map(|sp| attachment_refs(&sp.resolve_attachments))
            .collect();
        let ds_refs: Vec<Option<vk::AttachmentReference>> = info
            .subpasses
            .iter()
            .map(|sp| {
                sp.depth_stencil_attachment.map(|r| vk::AttachmentReference {
                    attachment: r.attachment,
                    layout: vk::ImageLayout::from_raw(r.layout),
                })
            })
            .collect();

        let mut vk_subpasses: Vec<vk::SubpassDescription> = Vec::new();
        for (i, sp) in info.subpasses.iter().enumerate() {
            let mut desc = vk::SubpassDescription::default()
                .flags(vk::SubpassDescriptionFlags::from_raw(sp.flags))
                .pipeline_bind_point(vk::PipelineBindPoint::from_raw(sp.pipeline_bind_point))
                .input_attachments(&input_refs[i])
                .color_attachments(&color_refs[i])
                .preserve_attachments(&sp.preserve_attachments);
            if !resolve_refs[i].is_empty() {
                desc = desc.resolve_attachments(&resolve_refs[i]);
            }
            if let Some(ref ds) = ds_refs[i] {
                desc = desc.depth_stencil_attachment(ds);
            }
            vk_subpasses.push(desc);
        }

        let vk_dependencies: Vec<vk::SubpassDependency> = info
            .dependencies
            .iter()
            .map(|d| {
                vk::SubpassDependency::default()
                    .src_subpass(d.src_subpass)
                    .dst_subpass(d.dst_subpass)
                    .src_stage_mask(vk::PipelineStageFlags::from_raw(d.src_stage_mask))
                    .dst_stage_mask(vk::PipelineStageFlags::from_raw(d.dst_stage_mask))
                    .src_access_mask(vk::AccessFlags::from_raw(d.src_access_mask))
                    .dst_access_mask(vk::AccessFlags::from_raw(d.dst_access_mask))
                    .dependency_flags(vk::DependencyFlags::from_raw(d.dependency_flags))
            })
            .collect();

        let rp_ci = vk::RenderPassCreateInfo::default()
            .flags(vk::RenderPassCreateFlags::from_raw(info.flags))
            .attachments(&vk_attachments)
            .subpasses(&vk_subpasses)
            .dependencies(&vk_dependencies);
        unsafe { dev.create_render_pass(&rp_ci, None) }
    }

    fn destroy_render_pass(&self, device: vk::Device, render_pass: vk::RenderPass) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_render_pass(render_pass, None) };
        }
    }

    // ── Command Pool / Buffer ───────────────────────────────

    fn create_command_pool(
        &self,
        device: vk::Device,
        info: &CommandPoolCreateInfo,
    ) -> VkResult<vk::CommandPool> {
        let dev = self.device(device)?;
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::from_raw(info.flags))
            .queue_family_index(info.queue_family_index);
        unsafe { dev.create_command_pool(&pool_info, None) }
    }

    fn destroy_command_pool(&self, device: vk::Device, pool: vk::CommandPool) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_command_pool(pool, None) };
        }
    }

    fn reset_command_pool(&self, device: vk::Device, pool: vk::CommandPool, flags: u32) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.reset_command_pool(pool, vk::CommandPoolResetFlags::from_raw(flags)) }
    }

    fn allocate_command_buffers(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let dev = self.device(device)?;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);
        unsafe { dev.allocate_command_buffers(&alloc_info) }
    }

    fn free_command_buffers(
        &self,
        device: vk::Device,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.free_command_buffers(pool, command_buffers) };
        }
    }

    fn begin_command_buffer(
        &self,
        device: vk::Device,
        command_buffer: vk::CommandBuffer,
        flags: u32,
    ) -> VkResult<()> {
        let dev = self.device(device)?;
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::from_raw(flags));
        unsafe { dev.begin_command_buffer(command_buffer, &begin_info) }
    }

    fn end_command_buffer(&self, device: vk::Device, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.end_command_buffer(command_buffer) }
    }

    fn reset_command_buffer(
        &self,
        device: vk::Device,
        command_buffer: vk::CommandBuffer,
        flags: u32,
    ) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe {
            dev.reset_command_buffer(
                command_buffer,
                vk::CommandBufferResetFlags::from_raw(flags),
            )
        }
    }

    // ── Queue ───────────────────────────────────────────────

    fn queue_submit(
        &self,
        device: vk::Device,
        queue: vk::Queue,
        submits: &[SubmitBatch],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let dev = self.device(device)?;
        let submit_infos: Vec<vk::SubmitInfo> = submits
            .iter()
            .map(|s| {
                vk::SubmitInfo::default()
                    .wait_semaphores(&s.wait_semaphores)
                    .wait_dst_stage_mask(&s.wait_dst_stage_masks)
                    .command_buffers(&s.command_buffers)
                    .signal_semaphores(&s.signal_semaphores)
            })
            .collect();
        unsafe { dev.queue_submit(queue, &submit_infos, fence) }
    }

    fn queue_wait_idle(&self, device: vk::Device, queue: vk::Queue) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.queue_wait_idle(queue) }
    }

    fn queue_bind_sparse(
        &self,
        device: vk::Device,
        queue: vk::Queue,
        binds: &[SparseBindBatch],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let dev = self.device(device)?;

        let memory_binds: Vec<Vec<Vec<vk::SparseMemoryBind>>> = binds
            .iter()
            .map(|b| {
                b.buffer_binds
                    .iter()
                    .map(|(_, binds)| {
                        binds
                            .iter()
                            .map(|m| {
                                vk::SparseMemoryBind::default()
                                    .resource_offset(m.resource_offset)
                                    .size(m.size)
                                    .memory(m.memory)
                                    .memory_offset(m.memory_offset)
                                    .flags(m.flags)
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect();
        let buffer_binds: Vec<Vec<vk::SparseBufferMemoryBindInfo>> = binds
            .iter()
            .zip(&memory_binds)
            .map(|(b, mems)| {
                b.buffer_binds
                    .iter()
                    .zip(mems)
                    .map(|((buffer, _), m)| {
                        vk::SparseBufferMemoryBindInfo::default()
                            .buffer(*buffer)
                            .binds(m)
                    })
                    .collect()
            })
            .collect();
        let bind_infos: Vec<vk::BindSparseInfo> = binds
            .iter()
            .zip(&buffer_binds)
            .map(|(b, bb)| {
                vk::BindSparseInfo::default()
                    .wait_semaphores(&b.wait_semaphores)
                    .buffer_binds(bb)
                    .signal_semaphores(&b.signal_semaphores)
            })
            .collect();
        unsafe { dev.queue_bind_sparse(queue, &bind_infos, fence) }
    }

    // ── Sync Objects ────────────────────────────────────────

    fn create_semaphore(&self, device: vk::Device) -> VkResult<vk::Semaphore> {
        let dev = self.device(device)?;
        unsafe { dev.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
    }

    fn destroy_semaphore(&self, device: vk::Device, semaphore: vk::Semaphore) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_fence(&self, device: vk::Device, signaled: bool) -> VkResult<vk::Fence> {
        let dev = self.device(device)?;
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe { dev.create_fence(&vk::FenceCreateInfo::default().flags(flags), None) }
    }

    fn destroy_fence(&self, device: vk::Device, fence: vk::Fence) {
        if let Ok(dev) = self.device(device) {
            unsafe { dev.destroy_fence(fence, None) };
        }
    }

    fn wait_for_fences(
        &self,
        device: vk::Device,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    fn reset_fences(&self, device: vk::Device, fences: &[vk::Fence]) -> VkResult<()> {
        let dev = self.device(device)?;
        unsafe { dev.reset_fences(fences) }
    }

    fn get_fence_status(&self, device: vk::Device, fence: vk::Fence) -> VkResult<bool> {
        let dev = self.device(device)?;
        unsafe { dev.get_fence_status(fence) }
    }
}
