//! Integration test: DecoderState
//!
//! Drives the decoder against the fake driver: handle lifetimes, object
//! graph bookkeeping, memory mapping modes and the query overrides the
//! guest sees.
//!
//! Run with: cargo test --test decoder_state_test -- --nocapture

mod common;

use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;

use common::*;
use vkhost_core::VkHostConfig;
use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::*;
use vkhost_server::driver::fake::FAKE_ROW_PITCH_ALIGNMENT;
use vkhost_server::object_graph::NodeInfo;
use vkhost_server::{DecoderState, FakeDriver, VulkanExecutor, INVALID_HANDLE};

#[test]
fn test_handle_lifecycle_tracks_live_set() {
    let (fake, state) = default_decoder();
    let mut s = state.lock();

    let instance = s.create_instance(&InstanceCreateInfo::default()).unwrap();
    assert_eq!(s.live_handles(), handles(&[instance]));

    let pd = s.enumerate_physical_devices(instance).unwrap()[0];
    assert_eq!(s.live_handles(), handles(&[instance, pd]));

    let device = s.create_device(pd, &device_info()).unwrap();
    assert_eq!(s.live_handles(), handles(&[instance, pd, device]));

    let memory = s
        .allocate_memory(device, &memory_info(4096, HOST_VISIBLE_TYPE))
        .unwrap();
    assert_eq!(s.live_handles(), handles(&[instance, pd, device, memory]));
    assert_eq!(s.get_device_memory_size(memory), Some(4096));

    let ptr = s.map_memory(device, memory, 0, vk::WHOLE_SIZE, 0).unwrap();
    assert_ne!(ptr.addr(), 0);
    assert_eq!(s.get_mapped_host_pointer(memory), Some(ptr));
    match &s.object(memory).unwrap().info {
        NodeInfo::DeviceMemory(info) => {
            assert_eq!(info.mapped.map(|m| m.size), Some(4096));
        }
        other => panic!("expected memory info, got {:?}", other),
    }

    s.unmap_memory(device, memory);
    assert_eq!(s.get_mapped_host_pointer(memory), None);

    s.free_memory(device, memory);
    assert_eq!(s.live_handles(), handles(&[instance, pd, device]));
    assert_eq!(fake.live_allocation_count(), 0);

    s.destroy_device(device);
    assert_eq!(s.live_handles(), handles(&[instance, pd]));
    assert_eq!(fake.live_device_count(), 0);

    s.destroy_instance(instance);
    assert!(s.live_handles().is_empty());
    assert!(s.graph().is_empty());
}

#[test]
fn test_boxed_handles_are_unique_and_typed() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let a = s.create_buffer(f.device, &buffer_info(256)).unwrap();
    let b = s.create_buffer(f.device, &buffer_info(256)).unwrap();
    assert_ne!(a, b);
    assert_eq!(a.object_type(), Some(ObjectType::Buffer));
    assert_eq!(f.device.object_type(), Some(ObjectType::Device));
    assert_eq!(s.object(a).unwrap().parent, Some(f.device));
}

#[test]
fn test_destroy_device_forgets_leaked_children() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let buffer = s.create_buffer(f.device, &buffer_info(1024)).unwrap();
    let memory = s
        .allocate_memory(f.device, &memory_info(1024, HOST_VISIBLE_TYPE))
        .unwrap();
    s.map_memory(f.device, memory, 0, vk::WHOLE_SIZE, 0).unwrap();
    let pool = s.create_command_pool(f.device, &command_pool_info()).unwrap();
    let cbs = s.allocate_command_buffers(f.device, pool, 0, 2).unwrap();
    assert_eq!(s.live_handles().len(), 9);

    s.destroy_device(f.device);

    assert_eq!(s.live_handles(), handles(&[f.instance, f.physical_device]));
    for leaked in [buffer, memory, pool, cbs[0], cbs[1], f.queue] {
        assert!(s.object(leaked).is_none());
        assert!(s.handle_map().dispatch(leaked).is_none());
    }
    assert_eq!(s.get_mapped_host_pointer(memory), None);
}

#[test]
fn test_destroy_instance_leaves_devices_as_roots() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    s.destroy_instance(f.instance);
    assert_eq!(s.live_handles(), handles(&[f.device, f.queue]));
    assert_eq!(s.object(f.device).unwrap().parent, None);

    // The orphaned device keeps working.
    let buffer = s.create_buffer(f.device, &buffer_info(64)).unwrap();
    s.destroy_buffer(f.device, buffer);
    s.destroy_device(f.device);
    assert!(s.live_handles().is_empty());
}

#[test]
fn test_instance_cleanup_can_be_disabled() {
    let mut config = VkHostConfig::default();
    config.vulkan.cleanup_instances = false;
    let (fake, state) = decoder(config);
    let mut s = state.lock();

    let before = fake.destroyed_instance_count();
    let instance = s.create_instance(&InstanceCreateInfo::default()).unwrap();
    s.destroy_instance(instance);
    assert!(s.live_handles().is_empty());
    assert_eq!(fake.destroyed_instance_count(), before);
}

#[test]
fn test_invalid_and_wrong_type_handles() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let bogus = BoxedHandle::compose(ObjectType::Buffer, 0x7777);
    assert_eq!(
        s.bind_buffer_memory(f.device, bogus, BoxedHandle::NULL, 0),
        Err(INVALID_HANDLE)
    );

    // A real handle of the wrong type
    assert_eq!(
        s.allocate_memory(f.instance, &memory_info(256, HOST_VISIBLE_TYPE)),
        Err(INVALID_HANDLE)
    );
    let buffer = s.create_buffer(f.device, &buffer_info(256)).unwrap();
    assert_eq!(
        s.map_memory(f.device, buffer, 0, vk::WHOLE_SIZE, 0),
        Err(INVALID_HANDLE)
    );

    // A guest memory type index beyond what the guest was shown
    assert_eq!(
        s.allocate_memory(f.device, &memory_info(256, 9)),
        Err(INVALID_HANDLE)
    );

    let live = s.live_handles();
    s.destroy_buffer(f.device, bogus);
    s.destroy_image(f.device, BoxedHandle::NULL);
    s.free_memory(f.device, BoxedHandle::compose(ObjectType::DeviceMemory, 12));
    assert_eq!(s.live_handles(), live);
}

#[test]
fn test_double_destroy_and_unmap_are_ignored() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let memory = s
        .allocate_memory(f.device, &memory_info(512, HOST_VISIBLE_TYPE))
        .unwrap();
    s.unmap_memory(f.device, memory);
    s.map_memory(f.device, memory, 0, 256, 0).unwrap();
    assert_eq!(
        s.map_memory(f.device, memory, 0, 256, 0),
        Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
    );
    s.unmap_memory(f.device, memory);
    s.unmap_memory(f.device, memory);

    let sampler = s
        .create_sampler(f.device, &SamplerCreateInfo::default())
        .unwrap();
    s.destroy_sampler(f.device, sampler);
    s.destroy_sampler(f.device, sampler);
    s.free_memory(f.device, memory);
    s.free_memory(f.device, memory);

    assert_eq!(
        s.live_handles(),
        handles(&[f.instance, f.physical_device, f.device, f.queue])
    );
}

#[test]
fn test_free_memory_implicitly_unmaps() {
    let (fake, state) = default_decoder();
    let f = bring_up(&state);
    let memory = {
        let mut s = state.lock();
        let memory = s
            .allocate_memory(f.device, &memory_info(256, HOST_VISIBLE_TYPE))
            .unwrap();
        s.map_memory(f.device, memory, 0, vk::WHOLE_SIZE, 0).unwrap();
        memory
    };
    let raw = raw_memory(&state, memory);
    assert!(fake.is_mapped(raw));

    state.lock().free_memory(f.device, memory);
    assert_eq!(fake.live_allocation_count(), 0);
}

#[test]
fn test_direct_mapping_writes_reach_driver() {
    let (fake, state) = default_decoder();
    assert!(state.using_direct_mapping());
    let f = bring_up(&state);

    let (memory, ptr) = {
        let mut s = state.lock();
        let memory = s
            .allocate_memory(f.device, &memory_info(4096, HOST_VISIBLE_TYPE))
            .unwrap();
        let ptr = s.map_memory(f.device, memory, 0, vk::WHOLE_SIZE, 0).unwrap();
        (memory, ptr)
    };
    unsafe {
        std::ptr::copy_nonoverlapping(b"guest".as_ptr(), ptr.as_ptr(), 5);
    }
    let bytes = fake.read_memory(raw_memory(&state, memory)).unwrap();
    assert_eq!(&bytes[..5], b"guest");

    let address = state
        .lock()
        .map_memory_into_address_space(f.device, memory)
        .unwrap();
    assert_eq!(address, ptr.addr());
}

#[test]
fn test_staging_mapping_needs_flush() {
    let mut config = VkHostConfig::default();
    config.vulkan.direct_mapping = false;
    let (fake, state) = decoder(config);
    assert!(!state.using_direct_mapping());
    let f = bring_up(&state);

    let (memory, ptr) = {
        let mut s = state.lock();
        let memory = s
            .allocate_memory(f.device, &memory_info(1024, HOST_VISIBLE_TYPE))
            .unwrap();
        let ptr = s.map_memory(f.device, memory, 0, vk::WHOLE_SIZE, 0).unwrap();
        (memory, ptr)
    };
    let raw = raw_memory(&state, memory);

    unsafe {
        std::ptr::write_bytes(ptr.as_ptr(), 0xab, 16);
    }
    assert_eq!(fake.read_memory(raw).unwrap()[0], 0);

    state
        .lock()
        .flush_mapped_memory_ranges(
            f.device,
            &[MappedMemoryRange {
                memory,
                offset: 0,
                size: vk::WHOLE_SIZE,
            }],
        )
        .unwrap();
    assert_eq!(&fake.read_memory(raw).unwrap()[..16], &[0xab; 16]);

    unsafe {
        std::ptr::write_bytes(ptr.as_ptr().add(16), 0xcd, 16);
    }
    state.lock().unmap_memory(f.device, memory);
    assert_eq!(&fake.read_memory(raw).unwrap()[16..32], &[0xcd; 16]);

    assert_eq!(
        state.lock().map_memory_into_address_space(f.device, memory),
        Err(vk::Result::ERROR_FEATURE_NOT_PRESENT)
    );
}

#[test]
fn test_api_version_is_clamped() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let s = state.lock();

    let version = s.enumerate_instance_version().unwrap();
    assert_eq!(vk::api_version_major(version), 1);
    assert_eq!(vk::api_version_minor(version), 1);

    let props = s.get_physical_device_properties(f.physical_device).unwrap();
    assert_eq!(props.api_version, vk::make_api_version(0, 1, 1, 0));
    assert_eq!(
        state.host_feature_support().api_version,
        vk::make_api_version(0, 1, 1, 0)
    );
}

#[test]
fn test_sparse_features_follow_config() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    {
        let s = state.lock();
        let features = s.get_physical_device_features(f.physical_device).unwrap();
        assert_eq!(features.sparse_binding, vk::FALSE);
        assert_eq!(features.sparse_residency_buffer, vk::FALSE);
        assert_eq!(features.sparse_residency_aliased, vk::FALSE);
        let families = s
            .get_physical_device_queue_family_properties(f.physical_device)
            .unwrap();
        assert!(!families[0].queue_flags.contains(vk::QueueFlags::SPARSE_BINDING));
    }

    let mut config = VkHostConfig::default();
    config.vulkan.sparse_binding = true;
    let (_fake, sparse) = decoder(config);
    let f = bring_up(&sparse);
    let s = sparse.lock();
    let features = s.get_physical_device_features(f.physical_device).unwrap();
    assert_eq!(features.sparse_binding, vk::TRUE);
    assert_eq!(features.sparse_residency_image2_d, vk::TRUE);
    let families = s
        .get_physical_device_queue_family_properties(f.physical_device)
        .unwrap();
    assert!(families[0].queue_flags.contains(vk::QueueFlags::SPARSE_BINDING));
}

#[test]
fn test_memory_types_hide_protected() {
    let (fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let props = s
        .get_physical_device_memory_properties(f.physical_device)
        .unwrap();
    assert_eq!(props.types.len(), 3);
    assert!(props
        .types
        .iter()
        .all(|t| !t.property_flags.contains(vk::MemoryPropertyFlags::PROTECTED)));
    assert!(props.types[HOST_VISIBLE_TYPE as usize]
        .property_flags
        .contains(vk::MemoryPropertyFlags::HOST_VISIBLE));

    // Guest type 1 is host type 2.
    let memory = s
        .allocate_memory(f.device, &memory_info(64, HOST_VISIBLE_TYPE))
        .unwrap();
    let raw = vk::DeviceMemory::from_raw(
        s.handle_map()
            .unbox(ObjectType::DeviceMemory, memory)
            .unwrap(),
    );
    assert_eq!(fake.allocation_type_index(raw), Some(2));

    let buffer = s.create_buffer(f.device, &buffer_info(100)).unwrap();
    let requirements = s.get_buffer_memory_requirements(f.device, buffer).unwrap();
    assert_eq!(requirements.memory_type_bits, 0b111);
    assert_eq!(requirements.size, 256);
}

#[test]
fn test_disjoint_is_hidden() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let s = state.lock();

    let props = s
        .get_physical_device_format_properties(f.physical_device, vk::Format::R8G8B8A8_UNORM)
        .unwrap();
    assert!(!props
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::DISJOINT));
    assert!(!props
        .linear_tiling_features
        .contains(vk::FormatFeatureFlags::DISJOINT));

    let query = ImageFormatQuery {
        format: vk::Format::R8G8B8A8_UNORM.as_raw(),
        image_type: vk::ImageType::TYPE_2D.as_raw(),
        tiling: vk::ImageTiling::OPTIMAL.as_raw(),
        usage: vk::ImageUsageFlags::SAMPLED.as_raw(),
        flags: 0,
    };
    assert!(s
        .get_physical_device_image_format_properties(f.physical_device, &query)
        .is_ok());
    let disjoint = ImageFormatQuery {
        flags: vk::ImageCreateFlags::DISJOINT.as_raw(),
        ..query
    };
    assert_eq!(
        s.get_physical_device_image_format_properties(f.physical_device, &disjoint).err(),
        Some(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)
    );
}

#[test]
fn test_device_extensions_are_filtered() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let names: Vec<String> = s
        .enumerate_device_extension_properties(f.physical_device)
        .unwrap()
        .into_iter()
        .map(|e| e.extension_name)
        .collect();
    assert_eq!(names.len(), 4);
    assert!(names.iter().any(|n| n == "VK_KHR_maintenance1"));
    assert!(!names.iter().any(|n| n == "VK_KHR_swapchain"));

    let info = DeviceCreateInfo {
        enabled_extensions: vec![
            "VK_KHR_bind_memory2".to_string(),
            "VK_EXT_debug_marker".to_string(),
        ],
        ..device_info()
    };
    let device = s.create_device(f.physical_device, &info).unwrap();
    match &s.object(device).unwrap().info {
        NodeInfo::Device { create_info, .. } => {
            assert_eq!(create_info.enabled_extensions, vec!["VK_KHR_bind_memory2".to_string()]);
        }
        other => panic!("expected device info, got {:?}", other),
    }
}

#[test]
fn test_create_with_requirements() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let (buffer, requirements) = s
        .create_buffer_with_requirements(f.device, &buffer_info(300))
        .unwrap();
    assert!(s.object(buffer).is_some());
    assert_eq!(requirements.size, 512);

    let (image, requirements) = s.create_image_with_requirements(f.device, &image_info()).unwrap();
    assert!(s.object(image).is_some());
    assert_eq!(requirements.memory_type_bits, 0b111);
    drop(s);

    let mut config = VkHostConfig::default();
    config.vulkan.create_resources_with_requirements = false;
    let (_fake, plain) = decoder(config);
    let f = bring_up(&plain);
    assert_eq!(
        plain
            .lock()
            .create_buffer_with_requirements(f.device, &buffer_info(300))
            .map(|(b, _)| b),
        Err(vk::Result::ERROR_FEATURE_NOT_PRESENT)
    );
}

#[test]
fn test_bindings_and_color_buffers_are_recorded() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let memory = s
        .allocate_memory(f.device, &memory_info(4096, DEVICE_LOCAL_TYPE))
        .unwrap();
    let buffer = s.create_buffer(f.device, &buffer_info(1024)).unwrap();
    s.bind_buffer_memory(f.device, buffer, memory, 256).unwrap();
    s.register_buffer_color_buffer(buffer, 7).unwrap();

    match &s.object(buffer).unwrap().info {
        NodeInfo::Buffer {
            binding,
            color_buffer,
            ..
        } => {
            let binding = binding.unwrap();
            assert_eq!(binding.memory, memory);
            assert_eq!(binding.offset, 256);
            assert_eq!(*color_buffer, Some(7));
        }
        other => panic!("expected buffer info, got {:?}", other),
    }
    assert_eq!(s.register_image_color_buffer(buffer, 1), Err(INVALID_HANDLE));
}

#[test]
fn test_image_views_outlive_their_image() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let image = s.create_image(f.device, &image_info()).unwrap();
    let view = s.create_image_view(f.device, &view_info(image)).unwrap();
    assert_eq!(s.object(view).unwrap().parent, Some(image));

    s.destroy_image(f.device, image);
    assert!(s.object(image).is_none());
    assert_eq!(s.object(view).unwrap().parent, Some(f.device));

    s.destroy_image_view(f.device, view);
    assert!(s.object(view).is_none());
}

#[test]
fn test_descriptor_pool_free_and_reset() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let layout = s.create_descriptor_set_layout(f.device, &layout_info()).unwrap();
    let pool = s.create_descriptor_pool(f.device, &pool_info(4)).unwrap();
    let sets = s
        .allocate_descriptor_sets(f.device, pool, &[layout, layout, layout])
        .unwrap();
    assert_eq!(sets.len(), 3);
    assert_eq!(s.graph().count_of_type(ObjectType::DescriptorSet), 3);
    assert!(sets.iter().all(|set| s.object(*set).unwrap().parent == Some(pool)));

    s.free_descriptor_sets(f.device, pool, &[sets[0], BoxedHandle::NULL])
        .unwrap();
    assert!(s.object(sets[0]).is_none());
    assert_eq!(s.graph().count_of_type(ObjectType::DescriptorSet), 2);

    s.reset_descriptor_pool(f.device, pool, 0).unwrap();
    assert_eq!(s.graph().count_of_type(ObjectType::DescriptorSet), 0);
    assert!(s.object(pool).is_some());

    let again = s.allocate_descriptor_sets(f.device, pool, &[layout]).unwrap();
    s.destroy_descriptor_pool(f.device, pool);
    assert!(s.object(again[0]).is_none());
    assert!(s.object(pool).is_none());
    assert!(s.object(layout).is_some());
}

#[test]
fn test_descriptor_updates() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let layout = s.create_descriptor_set_layout(f.device, &layout_info()).unwrap();
    let pool = s.create_descriptor_pool(f.device, &pool_info(1)).unwrap();
    let set = s.allocate_descriptor_sets(f.device, pool, &[layout]).unwrap()[0];
    let buffer = s.create_buffer(f.device, &buffer_info(256)).unwrap();
    let buffer_write = DescriptorBufferInfo {
        buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    };

    s.update_descriptor_sets(
        f.device,
        &[WriteDescriptorSet {
            dst_set: set,
            dst_binding: 0,
            dst_array_element: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER.as_raw(),
            image_infos: vec![],
            buffer_infos: vec![buffer_write],
        }],
    )
    .unwrap();

    // A stale buffer in the write is rejected.
    s.destroy_buffer(f.device, buffer);
    assert_eq!(
        s.update_descriptor_sets(
            f.device,
            &[WriteDescriptorSet {
                dst_set: set,
                dst_binding: 0,
                dst_array_element: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER.as_raw(),
                image_infos: vec![],
                buffer_infos: vec![buffer_write],
            }],
        ),
        Err(INVALID_HANDLE)
    );
}

#[test]
fn test_command_pool_owns_its_buffers() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let pool = s.create_command_pool(f.device, &command_pool_info()).unwrap();
    let cbs = s.allocate_command_buffers(f.device, pool, 0, 3).unwrap();
    assert_eq!(cbs.len(), 3);
    assert!(s.handle_map().dispatch(cbs[0]).is_some());

    s.free_command_buffers(f.device, pool, &[cbs[0], BoxedHandle::NULL]);
    assert!(s.object(cbs[0]).is_none());

    s.begin_command_buffer(cbs[1], 0).unwrap();
    s.end_command_buffer(cbs[1]).unwrap();
    s.reset_command_pool(f.device, pool, 0).unwrap();
    assert!(s.object(cbs[1]).is_some());

    s.destroy_command_pool(f.device, pool);
    assert_eq!(s.graph().count_of_type(ObjectType::CommandBuffer), 0);
    assert_eq!(s.graph().count_of_type(ObjectType::CommandPool), 0);
    assert_eq!(s.begin_command_buffer(cbs[2], 0), Err(INVALID_HANDLE));
}

#[test]
fn test_fences_signal_on_submit() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);

    let fence = state.lock().create_fence(f.device, false).unwrap();
    assert_eq!(state.lock().get_fence_status(f.device, fence), Ok(false));
    assert_eq!(
        state.wait_for_fences(f.device, &[fence], true, 0),
        Err(vk::Result::TIMEOUT)
    );

    state
        .lock()
        .queue_submit(f.queue, &[SubmitInfo::default()], fence)
        .unwrap();
    assert_eq!(state.lock().get_fence_status(f.device, fence), Ok(true));
    state
        .wait_for_fences(f.device, &[fence], true, u64::MAX)
        .unwrap();

    let mut s = state.lock();
    s.reset_fences(f.device, &[fence]).unwrap();
    assert_eq!(s.get_fence_status(f.device, fence), Ok(false));
    s.destroy_fence(f.device, fence);
    assert_eq!(s.get_fence_status(f.device, fence), Err(INVALID_HANDLE));
    drop(s);
    assert_eq!(
        state.wait_for_fences(f.device, &[fence], true, 0),
        Err(INVALID_HANDLE)
    );
}

#[test]
fn test_fence_reset_is_recorded() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let fence = s.create_fence(f.device, true).unwrap();
    assert!(matches!(
        s.object(fence).unwrap().info,
        NodeInfo::Fence { signaled: true }
    ));
    s.reset_fences(f.device, &[fence]).unwrap();
    assert!(matches!(
        s.object(fence).unwrap().info,
        NodeInfo::Fence { signaled: false }
    ));
}

#[test]
fn test_memory_transform_round_trip() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let memory = s
        .allocate_memory(f.device, &memory_info(64, HOST_VISIBLE_TYPE))
        .unwrap();
    let raw = s
        .handle_map()
        .unbox(ObjectType::DeviceMemory, memory)
        .unwrap();

    let mut memories = [memory.raw()];
    let mut offsets = [16u64];
    let mut sizes = [32u64];
    let mut type_index = [HOST_VISIBLE_TYPE];
    let mut type_bits = [0b111u32];

    s.device_memory_transform_to_host(
        &mut memories,
        &mut offsets,
        &mut sizes,
        &mut type_index,
        &mut type_bits,
    );
    assert_eq!(memories, [raw]);
    assert_eq!(type_index, [2]);
    assert_eq!(type_bits, [0b1101]);
    assert_eq!((offsets, sizes), ([16], [32]));

    s.device_memory_transform_from_host(
        &mut memories,
        &mut offsets,
        &mut sizes,
        &mut type_index,
        &mut type_bits,
    );
    assert_eq!(memories, [memory.raw()]);
    assert_eq!(type_index, [HOST_VISIBLE_TYPE]);
    assert_eq!(type_bits, [0b111]);
}

#[test]
fn test_memory_transform_uses_the_owning_device_table() {
    vkhost_common::logging::try_init_logging();
    let fake = Arc::new(FakeDriver::with_physical_devices(2));
    let state = DecoderState::new(fake.clone(), VkHostConfig::default());
    let mut s = state.lock();

    let instance = s.create_instance(&InstanceCreateInfo::default()).unwrap();
    let pds = s.enumerate_physical_devices(instance).unwrap();
    // The second physical device has no protected type, so its guest and
    // host indices agree while the first device's table shifts them.
    let device = s.create_device(pds[1], &device_info()).unwrap();
    let memory = s.allocate_memory(device, &memory_info(64, 1)).unwrap();
    let raw = s
        .handle_map()
        .unbox(ObjectType::DeviceMemory, memory)
        .unwrap();
    assert_eq!(fake.allocation_type_index(vk::DeviceMemory::from_raw(raw)), Some(1));

    let mut memories = [memory.raw()];
    let mut offsets = [0u64];
    let mut sizes = [64u64];
    let mut type_index = [1u32];
    let mut type_bits = [0b111u32];
    s.device_memory_transform_to_host(
        &mut memories,
        &mut offsets,
        &mut sizes,
        &mut type_index,
        &mut type_bits,
    );
    assert_eq!(memories, [raw]);
    assert_eq!(type_index, [1]);
    assert_eq!(type_bits, [0b111]);

    s.device_memory_transform_from_host(
        &mut memories,
        &mut offsets,
        &mut sizes,
        &mut type_index,
        &mut type_bits,
    );
    assert_eq!(memories, [memory.raw()]);
    assert_eq!(type_index, [1]);
    assert_eq!(type_bits, [0b111]);
}

#[test]
fn test_map_ranges_outside_the_allocation_are_rejected() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let memory = s
        .allocate_memory(f.device, &memory_info(4096, HOST_VISIBLE_TYPE))
        .unwrap();
    for (offset, size) in [(2, u64::MAX - 1), (4096, vk::WHOLE_SIZE), (0, 4097), (1, 0)] {
        assert_eq!(
            s.map_memory(f.device, memory, offset, size, 0),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED),
            "offset {} size {}",
            offset,
            size
        );
    }
    assert_eq!(s.get_mapped_host_pointer(memory), None);
    s.map_memory(f.device, memory, 2, 4094, 0).unwrap();

    let range = |offset, size| MappedMemoryRange {
        memory,
        offset,
        size,
    };
    assert_eq!(
        s.flush_mapped_memory_ranges(f.device, &[range(8, u64::MAX - 4)]),
        Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
    );
    assert_eq!(
        s.flush_mapped_memory_ranges(f.device, &[range(8192, vk::WHOLE_SIZE)]),
        Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
    );
    assert_eq!(
        s.invalidate_mapped_memory_ranges(f.device, &[range(4000, 200)]),
        Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
    );
    s.flush_mapped_memory_ranges(f.device, &[range(2, vk::WHOLE_SIZE)])
        .unwrap();
    s.invalidate_mapped_memory_ranges(f.device, &[range(0, 4096)])
        .unwrap();
}

#[test]
fn test_freeing_memory_clears_bindings_to_it() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let freed = s
        .allocate_memory(f.device, &memory_info(1 << 16, DEVICE_LOCAL_TYPE))
        .unwrap();
    let kept = s
        .allocate_memory(f.device, &memory_info(4096, DEVICE_LOCAL_TYPE))
        .unwrap();
    let buffer = s.create_buffer(f.device, &buffer_info(256)).unwrap();
    let image = s.create_image(f.device, &image_info()).unwrap();
    let other = s.create_buffer(f.device, &buffer_info(256)).unwrap();
    s.bind_buffer_memory(f.device, buffer, freed, 0).unwrap();
    s.bind_image_memory(f.device, image, freed, 4096).unwrap();
    s.bind_buffer_memory(f.device, other, kept, 0).unwrap();

    s.free_memory(f.device, freed);

    let binding_of = |info: &NodeInfo| match info {
        NodeInfo::Buffer { binding, .. } | NodeInfo::Image { binding, .. } => *binding,
        other => panic!("expected a resource, got {:?}", other),
    };
    assert_eq!(binding_of(&s.object(buffer).unwrap().info), None);
    assert_eq!(binding_of(&s.object(image).unwrap().info), None);
    assert_eq!(
        binding_of(&s.object(other).unwrap().info).map(|b| b.memory),
        Some(kept)
    );
}

#[test]
fn test_physical_device_queries2_match_the_masked_queries() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let s = state.lock();

    let features = s.get_physical_device_features2(f.physical_device).unwrap();
    assert_eq!(features.features.sparse_binding, vk::FALSE);
    assert_eq!(features.features.sparse_residency_buffer, vk::FALSE);
    assert!(!features.protected_memory);
    assert!(features.sampler_ycbcr_conversion);

    let (props, ids) = s.get_physical_device_properties2(f.physical_device).unwrap();
    assert_eq!(props.api_version, vk::make_api_version(0, 1, 1, 0));
    assert_eq!(ids.device_uuid, [0x42; 16]);
    assert_eq!(ids.driver_uuid, [0x24; 16]);

    let memory = s
        .get_physical_device_memory_properties2(f.physical_device)
        .unwrap();
    assert_eq!(
        memory,
        s.get_physical_device_memory_properties(f.physical_device).unwrap()
    );
    assert_eq!(memory.types.len(), 3);

    let format = s
        .get_physical_device_format_properties2(f.physical_device, vk::Format::R8G8B8A8_UNORM)
        .unwrap();
    assert!(!format
        .linear_tiling_features
        .contains(vk::FormatFeatureFlags::DISJOINT));
    assert!(format
        .linear_tiling_features
        .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE));

    let query = ImageFormatQuery {
        format: vk::Format::R8G8B8A8_UNORM.as_raw(),
        image_type: vk::ImageType::TYPE_2D.as_raw(),
        tiling: vk::ImageTiling::OPTIMAL.as_raw(),
        usage: vk::ImageUsageFlags::SAMPLED.as_raw(),
        flags: 0,
    };
    assert!(s
        .get_physical_device_image_format_properties2(f.physical_device, &query)
        .is_ok());
    let disjoint = ImageFormatQuery {
        flags: vk::ImageCreateFlags::DISJOINT.as_raw(),
        ..query
    };
    assert_eq!(
        s.get_physical_device_image_format_properties2(f.physical_device, &disjoint).err(),
        Some(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)
    );
}

#[test]
fn test_sync_fd_semaphores_are_backed_by_opaque_fds() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let s = state.lock();
    let query = |ty: vk::ExternalSemaphoreHandleTypeFlags| {
        s.get_physical_device_external_semaphore_properties(f.physical_device, ty.as_raw())
            .unwrap()
    };
    let both = vk::ExternalSemaphoreFeatureFlags::EXPORTABLE | vk::ExternalSemaphoreFeatureFlags::IMPORTABLE;

    let sync_fd = query(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD);
    assert_eq!(sync_fd.compatible_handle_types, vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD);
    assert_eq!(
        sync_fd.export_from_imported_handle_types,
        vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD
    );
    assert_eq!(sync_fd.external_semaphore_features, both);

    let opaque = query(vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);
    assert_eq!(opaque.compatible_handle_types, vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD);
    assert_eq!(opaque.external_semaphore_features, both);

    let unsupported = query(vk::ExternalSemaphoreHandleTypeFlags::D3D12_FENCE);
    assert!(unsupported.compatible_handle_types.is_empty());
    assert!(unsupported.external_semaphore_features.is_empty());
}

#[test]
fn test_bind_buffer_memory2_checks_every_handle_first() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let memory = s
        .allocate_memory(f.device, &memory_info(4096, DEVICE_LOCAL_TYPE))
        .unwrap();
    let first = s.create_buffer(f.device, &buffer_info(256)).unwrap();
    let second = s.create_buffer(f.device, &buffer_info(256)).unwrap();
    let bind = |buffer, memory_offset| BindBufferMemoryInfo {
        buffer,
        memory,
        memory_offset,
    };
    let bound = |s: &vkhost_server::StateGuard<'_>, buffer| match &s.object(buffer).unwrap().info {
        NodeInfo::Buffer { binding, .. } => binding.map(|b| (b.memory, b.offset)),
        other => panic!("expected buffer info, got {:?}", other),
    };

    let bogus = BoxedHandle::compose(ObjectType::Buffer, 0x5555);
    assert_eq!(
        s.bind_buffer_memory2(f.device, &[bind(first, 0), bind(bogus, 256)]),
        Err(INVALID_HANDLE)
    );
    assert_eq!(bound(&s, first), None);

    s.bind_buffer_memory2(f.device, &[bind(first, 0), bind(second, 256)])
        .unwrap();
    assert_eq!(bound(&s, first), Some((memory, 0)));
    assert_eq!(bound(&s, second), Some((memory, 256)));
}

#[test]
fn test_image_memory_requirements2_reports_dedicated_preference() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let small = s.create_image(f.device, &image_info()).unwrap();
    let requirements = s.get_image_memory_requirements2(f.device, small).unwrap();
    assert_eq!(requirements.requirements.memory_type_bits, 0b111);
    assert_eq!(requirements.requirements.size, 16384);
    assert!(!requirements.prefers_dedicated);

    let large = s
        .create_image(
            f.device,
            &ImageCreateInfo {
                extent: [1024, 1024, 1],
                ..image_info()
            },
        )
        .unwrap();
    let requirements = s.get_image_memory_requirements2(f.device, large).unwrap();
    assert_eq!(requirements.requirements.size, 4 << 20);
    assert!(requirements.prefers_dedicated);
    assert!(!requirements.requires_dedicated);
}

#[test]
fn test_memory_host_address_info_ids_are_stable() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let first = s
        .allocate_memory(f.device, &memory_info(4096, HOST_VISIBLE_TYPE))
        .unwrap();
    let second = s
        .allocate_memory(f.device, &memory_info(8192, HOST_VISIBLE_TYPE))
        .unwrap();

    let (address, size, id) = s.get_memory_host_address_info(f.device, first).unwrap();
    assert_ne!(address, 0);
    assert_eq!(size, 4096);
    assert_eq!(s.get_mapped_host_pointer(first).map(|p| p.addr()), Some(address));
    assert_eq!(
        s.get_memory_host_address_info(f.device, first).unwrap(),
        (address, size, id)
    );

    let (_, size, other_id) = s.get_memory_host_address_info(f.device, second).unwrap();
    assert_eq!(size, 8192);
    assert_ne!(other_id, id);

    s.free_memory(f.device, first);
    assert_eq!(
        s.get_memory_host_address_info(f.device, first),
        Err(INVALID_HANDLE)
    );

    let mut config = VkHostConfig::default();
    config.vulkan.direct_mapping = false;
    let (_fake, staged) = decoder(config);
    let f = bring_up(&staged);
    let mut s = staged.lock();
    let memory = s
        .allocate_memory(f.device, &memory_info(4096, HOST_VISIBLE_TYPE))
        .unwrap();
    assert_eq!(
        s.get_memory_host_address_info(f.device, memory),
        Err(vk::Result::ERROR_FEATURE_NOT_PRESENT)
    );
}

#[test]
fn test_linear_image_layout_is_measured_once() {
    let (fake, state) = default_decoder();
    let f = bring_up(&state);
    let mut s = state.lock();

    let format = vk::Format::R8G8B8A8_UNORM.as_raw();
    assert_eq!(
        s.get_linear_image_layout(f.device, format),
        Ok((0, FAKE_ROW_PITCH_ALIGNMENT))
    );
    assert_eq!(fake.live_image_count(), 0);
    assert_eq!(
        s.get_linear_image_layout(f.device, format),
        Ok((0, FAKE_ROW_PITCH_ALIGNMENT))
    );
    assert_eq!(
        s.get_linear_image_layout(f.instance, format),
        Err(INVALID_HANDLE)
    );
}

#[test]
fn test_executor_batch_runs_blocking_commands_between_locked_runs() {
    let (_fake, state) = default_decoder();
    let f = bring_up(&state);
    let executor = VulkanExecutor::new(state.clone());

    let fence = match executor.execute(VulkanCommand::CreateFence {
        device: f.device,
        signaled: false,
    }) {
        VulkanResponse::Handle { handle } => handle,
        other => panic!("expected Handle, got {:?}", other),
    };

    let responses = executor.execute_batch(vec![
        VulkanCommand::QueueSubmitAsync {
            queue: f.queue,
            submits: vec![SubmitInfo::default()],
            fence,
            sequence_number: 1,
        },
        VulkanCommand::QueueHostSync {
            queue: f.queue,
            need_host_sync: true,
            sequence_number: 1,
        },
        VulkanCommand::WaitForFences {
            device: f.device,
            fences: vec![fence],
            wait_all: true,
            timeout_ns: u64::MAX,
        },
        VulkanCommand::GetFenceStatus {
            device: f.device,
            fence,
        },
        VulkanCommand::ResetFences {
            device: f.device,
            fences: vec![fence],
        },
        VulkanCommand::GetFenceStatus {
            device: f.device,
            fence,
        },
        VulkanCommand::GetLinearImageLayout {
            device: f.device,
            format: vk::Format::R8G8B8A8_UNORM.as_raw(),
        },
    ]);
    assert_eq!(responses.len(), 7);
    for response in &responses[..3] {
        assert!(matches!(response, VulkanResponse::Success), "got {:?}", response);
    }
    assert!(matches!(responses[3], VulkanResponse::FenceStatus { signaled: true }));
    assert!(matches!(responses[4], VulkanResponse::Success));
    assert!(matches!(responses[5], VulkanResponse::FenceStatus { signaled: false }));
    match &responses[6] {
        VulkanResponse::LinearImageLayout {
            offset,
            row_pitch_alignment,
        } => assert_eq!((*offset, *row_pitch_alignment), (0, FAKE_ROW_PITCH_ALIGNMENT)),
        other => panic!("expected LinearImageLayout, got {:?}", other),
    }

    // The lock is free once the batch returns.
    assert!(state.lock().object(fence).is_some());
}

#[test]
fn test_executor_round_trip() {
    let (_fake, state) = default_decoder();
    let executor = VulkanExecutor::new(state.clone());

    let instance = match executor.execute(VulkanCommand::CreateInstance {
        create_info: InstanceCreateInfo::default(),
    }) {
        VulkanResponse::Handle { handle } => handle,
        other => panic!("expected Handle, got {:?}", other),
    };
    let pd = match executor.execute(VulkanCommand::EnumeratePhysicalDevices { instance }) {
        VulkanResponse::Handles { handles } => handles[0],
        other => panic!("expected Handles, got {:?}", other),
    };
    let device = match executor.execute(VulkanCommand::CreateDevice {
        physical_device: pd,
        create_info: device_info(),
    }) {
        VulkanResponse::Handle { handle } => handle,
        other => panic!("expected Handle, got {:?}", other),
    };

    let responses = executor.execute_batch(vec![
        VulkanCommand::AllocateMemory {
            device,
            allocate_info: memory_info(4096, HOST_VISIBLE_TYPE),
        },
        VulkanCommand::CreateBufferWithRequirements {
            device,
            create_info: buffer_info(1000),
        },
    ]);
    let memory = match &responses[0] {
        VulkanResponse::Handle { handle } => *handle,
        other => panic!("expected Handle, got {:?}", other),
    };
    match &responses[1] {
        VulkanResponse::HandleWithRequirements { requirements, .. } => {
            assert_eq!(requirements.size, 1024);
            assert_eq!(requirements.memory_type_bits, 0b111);
        }
        other => panic!("expected HandleWithRequirements, got {:?}", other),
    }

    match executor.execute(VulkanCommand::MapMemory {
        device,
        memory,
        offset: 0,
        size: vk::WHOLE_SIZE,
        flags: 0,
    }) {
        VulkanResponse::MemoryMapped { address } => assert_ne!(address, 0),
        other => panic!("expected MemoryMapped, got {:?}", other),
    }

    match executor.execute(VulkanCommand::FreeMemory {
        device,
        memory: BoxedHandle::compose(ObjectType::DeviceMemory, 99),
    }) {
        VulkanResponse::Success => {}
        other => panic!("expected Success, got {:?}", other),
    }
    match executor.execute(VulkanCommand::MapMemory {
        device,
        memory: instance,
        offset: 0,
        size: 16,
        flags: 0,
    }) {
        VulkanResponse::Error { code, .. } => assert_eq!(code, INVALID_HANDLE.as_raw()),
        other => panic!("expected Error, got {:?}", other),
    }

    executor.execute(VulkanCommand::DestroyDevice { device });
    executor.execute(VulkanCommand::DestroyInstance { instance });
    assert!(state.lock().live_handles().is_empty());
}
