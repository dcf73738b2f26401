#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;

use vkhost_core::VkHostConfig;
use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::*;
use vkhost_server::{DecoderState, FakeDriver};

/// Guest index of the first host-visible memory type the fake driver reports
/// (host type 2, behind the hidden protected type 1).
pub const HOST_VISIBLE_TYPE: u32 = 1;
pub const DEVICE_LOCAL_TYPE: u32 = 0;

pub fn decoder(config: VkHostConfig) -> (Arc<FakeDriver>, Arc<DecoderState>) {
    vkhost_common::logging::try_init_logging();
    let fake = Arc::new(FakeDriver::new());
    let state = Arc::new(DecoderState::new(fake.clone(), config));
    (fake, state)
}

pub fn default_decoder() -> (Arc<FakeDriver>, Arc<DecoderState>) {
    decoder(VkHostConfig::default())
}

pub fn snapshot_config() -> VkHostConfig {
    let mut config = VkHostConfig::default();
    config.snapshot.enabled = true;
    config
}

pub fn handles(list: &[BoxedHandle]) -> BTreeSet<BoxedHandle> {
    list.iter().copied().collect()
}

pub fn device_info() -> DeviceCreateInfo {
    DeviceCreateInfo {
        queue_create_infos: vec![DeviceQueueCreateInfo {
            queue_family_index: 0,
            queue_priorities: vec![1.0],
        }],
        enabled_extensions: vec![],
        enabled_features: None,
    }
}

pub fn memory_info(size: u64, memory_type_index: u32) -> MemoryAllocateInfo {
    MemoryAllocateInfo {
        allocation_size: size,
        memory_type_index,
        import_color_buffer: None,
    }
}

pub fn buffer_info(size: u64) -> BufferCreateInfo {
    BufferCreateInfo {
        flags: 0,
        size,
        usage: vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw(),
        sharing_mode: vk::SharingMode::EXCLUSIVE.as_raw(),
        queue_family_indices: vec![],
    }
}

pub fn image_info() -> ImageCreateInfo {
    ImageCreateInfo {
        flags: 0,
        image_type: vk::ImageType::TYPE_2D.as_raw(),
        format: vk::Format::R8G8B8A8_UNORM.as_raw(),
        extent: [64, 64, 1],
        mip_levels: 1,
        array_layers: 1,
        samples: vk::SampleCountFlags::TYPE_1.as_raw(),
        tiling: vk::ImageTiling::OPTIMAL.as_raw(),
        usage: vk::ImageUsageFlags::SAMPLED.as_raw(),
        sharing_mode: vk::SharingMode::EXCLUSIVE.as_raw(),
        queue_family_indices: vec![],
        initial_layout: vk::ImageLayout::UNDEFINED.as_raw(),
    }
}

pub fn view_info(image: BoxedHandle) -> ImageViewCreateInfo {
    ImageViewCreateInfo {
        flags: 0,
        image,
        view_type: vk::ImageViewType::TYPE_2D.as_raw(),
        format: vk::Format::R8G8B8A8_UNORM.as_raw(),
        components: ComponentMapping::default(),
        subresource_range: ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR.as_raw(),
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        },
    }
}

pub fn layout_info() -> DescriptorSetLayoutCreateInfo {
    DescriptorSetLayoutCreateInfo {
        flags: 0,
        bindings: vec![
            DescriptorSetLayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER.as_raw(),
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::COMPUTE.as_raw(),
            },
            DescriptorSetLayoutBinding {
                binding: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER.as_raw(),
                descriptor_count: 1,
                stage_flags: vk::ShaderStageFlags::COMPUTE.as_raw(),
            },
        ],
    }
}

pub fn pool_info(max_sets: u32) -> DescriptorPoolCreateInfo {
    DescriptorPoolCreateInfo {
        flags: vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET.as_raw(),
        max_sets,
        pool_sizes: vec![
            DescriptorPoolSize {
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER.as_raw(),
                descriptor_count: max_sets,
            },
            DescriptorPoolSize {
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER.as_raw(),
                descriptor_count: max_sets,
            },
        ],
    }
}

pub fn command_pool_info() -> CommandPoolCreateInfo {
    CommandPoolCreateInfo {
        flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER.as_raw(),
        queue_family_index: 0,
    }
}

/// Instance, its first physical device, a device and its first queue.
pub struct Fixture {
    pub instance: BoxedHandle,
    pub physical_device: BoxedHandle,
    pub device: BoxedHandle,
    pub queue: BoxedHandle,
}

pub fn bring_up(state: &DecoderState) -> Fixture {
    let mut s = state.lock();
    let instance = s
        .create_instance(&InstanceCreateInfo {
            app_name: Some("vkhost-test".to_string()),
            api_version: vk::make_api_version(0, 1, 1, 0),
            ..Default::default()
        })
        .unwrap();
    let physical_device = s.enumerate_physical_devices(instance).unwrap()[0];
    let device = s.create_device(physical_device, &device_info()).unwrap();
    let queue = s.get_device_queue(device, 0, 0).unwrap();
    Fixture {
        instance,
        physical_device,
        device,
        queue,
    }
}

/// Driver handle behind a boxed memory handle.
pub fn raw_memory(state: &DecoderState, memory: BoxedHandle) -> vk::DeviceMemory {
    let raw = state
        .lock()
        .handle_map()
        .unbox(ObjectType::DeviceMemory, memory)
        .unwrap();
    vk::DeviceMemory::from_raw(raw)
}
