//! Integration test: snapshot save and load
//!
//! Saves a populated decoder, restores it into a fresh one with the recorded
//! handles reserved, and checks the two states match object for object.
//!
//! Run with: cargo test --test snapshot_test -- --nocapture

mod common;

use std::io::Cursor;
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;

use common::*;
use vkhost_core::encode_created_handles;
use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::*;
use vkhost_server::object_graph::{MemoryBinding, NodeInfo};
use vkhost_server::snapshot::{read_snapshot, write_snapshot, SNAPSHOT_MAGIC};
use vkhost_server::{DecoderState, FakeDriver, SnapshotError, SnapshotImage};

/// Handles of the populated state that tests look at again after restore.
struct Populated {
    device: BoxedHandle,
    memory: BoxedHandle,
    buffer: BoxedHandle,
    set: BoxedHandle,
    fence: BoxedHandle,
}

fn populate(state: &DecoderState) -> Populated {
    let f = bring_up(state);
    let mut s = state.lock();

    let memory = s
        .allocate_memory(f.device, &memory_info(4096, HOST_VISIBLE_TYPE))
        .unwrap();
    let ptr = s.map_memory(f.device, memory, 0, vk::WHOLE_SIZE, 0).unwrap();
    unsafe {
        std::ptr::copy_nonoverlapping(b"snapshot contents".as_ptr(), ptr.as_ptr(), 17);
    }
    let buffer = s.create_buffer(f.device, &buffer_info(1024)).unwrap();
    s.bind_buffer_memory(f.device, buffer, memory, 0).unwrap();
    s.register_buffer_color_buffer(buffer, 3).unwrap();

    let image = s.create_image(f.device, &image_info()).unwrap();
    s.create_image_view(f.device, &view_info(image)).unwrap();
    s.create_sampler(f.device, &SamplerCreateInfo::default()).unwrap();
    s.create_render_pass(f.device, &RenderPassCreateInfo::default())
        .unwrap();

    // The set outlives its layout.
    let layout = s.create_descriptor_set_layout(f.device, &layout_info()).unwrap();
    let pool = s.create_descriptor_pool(f.device, &pool_info(2)).unwrap();
    let set = s.allocate_descriptor_sets(f.device, pool, &[layout]).unwrap()[0];
    s.destroy_descriptor_set_layout(f.device, layout);

    let command_pool = s.create_command_pool(f.device, &command_pool_info()).unwrap();
    s.allocate_command_buffers(f.device, command_pool, 0, 2).unwrap();
    s.create_semaphore(f.device).unwrap();
    let fence = s.create_fence(f.device, true).unwrap();

    Populated {
        device: f.device,
        memory,
        buffer,
        set,
        fence,
    }
}

fn sorted_table(image: &SnapshotImage) -> Vec<(BoxedHandle, ObjectType, bool)> {
    let mut table: Vec<_> = image
        .table
        .iter()
        .map(|e| (e.handle, e.object_type, e.owns_dispatch))
        .collect();
    table.sort();
    table
}

/// Load `image` into a fresh decoder with its handles reserved.
fn restore(image: &SnapshotImage) -> (Arc<FakeDriver>, Arc<DecoderState>) {
    let (fake, restored) = decoder(snapshot_config());
    {
        let mut s = restored.lock();
        s.set_created_handles_for_snapshot_load(&encode_created_handles(&image.created_handles()))
            .unwrap();
        s.snapshot_load_image(image).unwrap();
    }
    (fake, restored)
}

fn fence_record(image: &SnapshotImage, fence: BoxedHandle) -> bool {
    match image.records.iter().find(|r| r.handle == fence).map(|r| &r.info) {
        Some(NodeInfo::Fence { signaled }) => *signaled,
        other => panic!("expected fence record, got {:?}", other),
    }
}

#[test]
fn test_round_trip_restores_identical_state() {
    let (_fake, state) = decoder(snapshot_config());
    let p = populate(&state);

    let mut bytes = Vec::new();
    state.lock().snapshot_save(&mut bytes).unwrap();
    let saved = state.lock().snapshot_capture().unwrap();
    let saved_handles = state.lock().live_handles();

    let (fake2, restored) = decoder(snapshot_config());
    {
        let mut s = restored.lock();
        let image = read_snapshot(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(image.records, saved.records);
        assert_eq!(sorted_table(&image), sorted_table(&saved));
        s.set_created_handles_for_snapshot_load(&encode_created_handles(&image.created_handles()))
            .unwrap();
        s.snapshot_load(&mut Cursor::new(&bytes)).unwrap();

        assert_eq!(s.live_handles(), saved_handles);
        assert_eq!(s.handle_map().reserved_remaining(), 0);

        let again = s.snapshot_capture().unwrap();
        assert_eq!(again.records, saved.records);
        assert_eq!(sorted_table(&again), sorted_table(&saved));

        // Restored objects work through their old handles.
        assert_eq!(s.get_fence_status(p.device, p.fence), Ok(true));
        let pool = s.object(p.set).unwrap().parent.unwrap();
        s.free_descriptor_sets(p.device, pool, &[p.set]).unwrap();
        s.destroy_buffer(p.device, p.buffer);
    }

    let bytes = fake2.read_memory(raw_memory(&restored, p.memory)).unwrap();
    assert_eq!(&bytes[..17], b"snapshot contents");
}

#[test]
fn test_round_trip_through_file() {
    let (_fake, state) = decoder(snapshot_config());
    let p = populate(&state);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decoder.snap");
    {
        let mut file = std::fs::File::create(&path).unwrap();
        state.lock().snapshot_save(&mut file).unwrap();
    }

    let image = read_snapshot(&mut std::fs::File::open(&path).unwrap()).unwrap();
    let (_fake2, restored) = decoder(snapshot_config());
    let mut s = restored.lock();
    s.set_created_handles_for_snapshot_load(&encode_created_handles(&image.created_handles()))
        .unwrap();
    s.snapshot_load(&mut std::fs::File::open(&path).unwrap())
        .unwrap();
    assert_eq!(s.get_device_memory_size(p.memory), Some(4096));
    assert!(s.get_mapped_host_pointer(p.memory).is_some());
}

#[test]
fn test_memory_contents_can_be_skipped() {
    let mut config = snapshot_config();
    config.snapshot.save_memory_contents = false;
    let (_fake, state) = decoder(config);
    populate(&state);

    let image = state.lock().snapshot_capture().unwrap();
    assert!(image.records.iter().all(|r| r.mapped_contents.is_none()));
}

#[test]
fn test_snapshots_disabled_by_default() {
    let (_fake, state) = default_decoder();
    assert!(!state.snapshots_enabled());
    bring_up(&state);

    let mut s = state.lock();
    assert!(matches!(s.snapshot_capture(), Err(SnapshotError::Disabled)));
    assert!(matches!(
        s.snapshot_load_image(&SnapshotImage::default()),
        Err(SnapshotError::Disabled)
    ));
}

#[test]
fn test_load_requires_empty_state() {
    let (_fake, state) = decoder(snapshot_config());
    bring_up(&state);

    let mut s = state.lock();
    let image = s.snapshot_capture().unwrap();
    let live_before = s.live_handles();
    match s.snapshot_load_image(&image) {
        Err(SnapshotError::StateNotEmpty { live }) => assert_eq!(live, 4),
        other => panic!("expected StateNotEmpty, got {:?}", other),
    }
    assert_eq!(s.live_handles(), live_before);
}

#[test]
fn test_load_requires_reserved_handles() {
    let (_fake, state) = decoder(snapshot_config());
    populate(&state);
    let image = state.lock().snapshot_capture().unwrap();

    let (_fake2, restored) = decoder(snapshot_config());
    let mut s = restored.lock();
    let handles = image.created_handles();
    s.set_created_handles_for_snapshot_load(&encode_created_handles(&handles[..3]))
        .unwrap();
    match s.snapshot_load_image(&image) {
        Err(SnapshotError::InsufficientHandles { needed, available }) => {
            assert_eq!(needed, image.records.len());
            assert_eq!(available, 3);
        }
        other => panic!("expected InsufficientHandles, got {:?}", other),
    }
    assert!(s.live_handles().is_empty());
}

#[test]
fn test_bad_header_is_rejected() {
    let (_fake, state) = decoder(snapshot_config());
    let mut s = state.lock();

    let mut garbage = Cursor::new(b"NOPE\x01\x00\x00\x00".to_vec());
    assert!(matches!(
        s.snapshot_load(&mut garbage),
        Err(SnapshotError::InvalidMagic)
    ));

    let mut future = SNAPSHOT_MAGIC.to_vec();
    future.extend_from_slice(&2u32.to_le_bytes());
    assert!(matches!(
        read_snapshot(&mut Cursor::new(future)),
        Err(SnapshotError::UnsupportedVersion(2))
    ));

    let mut truncated = Vec::new();
    write_snapshot(&mut truncated, &SnapshotImage::default()).unwrap();
    truncated.truncate(6);
    assert!(matches!(
        read_snapshot(&mut Cursor::new(truncated)),
        Err(SnapshotError::Io(_))
    ));
}

#[test]
fn test_failed_load_rolls_back() {
    let (_fake, state) = decoder(snapshot_config());
    populate(&state);
    let image = state.lock().snapshot_capture().unwrap();

    let (fake2, restored) = decoder(snapshot_config());
    let mut s = restored.lock();
    let mut handles = image.created_handles();
    // Records are in creation order: instance, physical device, device, ...
    let expected_device = handles[2];
    handles[2] = BoxedHandle::compose(ObjectType::Device, 0xdead);
    s.set_created_handles_for_snapshot_load(&encode_created_handles(&handles))
        .unwrap();

    match s.snapshot_load_image(&image) {
        Err(SnapshotError::HandleMismatch {
            expected,
            object_type,
            ..
        }) => {
            assert_eq!(expected, expected_device);
            assert_eq!(object_type, ObjectType::Device);
        }
        other => panic!("expected HandleMismatch, got {:?}", other),
    }

    assert!(s.live_handles().is_empty());
    assert!(s.graph().is_empty());
    assert_eq!(s.handle_map().reserved_remaining(), 0);
    assert_eq!(fake2.live_device_count(), 0);
    assert_eq!(fake2.live_instance_count(), 0);
}

#[test]
fn test_binding_to_freed_memory_does_not_block_load() {
    let (_fake, state) = decoder(snapshot_config());
    let f = bring_up(&state);
    let (freed, buffer, image) = {
        let mut s = state.lock();
        let freed = s
            .allocate_memory(f.device, &memory_info(1 << 16, DEVICE_LOCAL_TYPE))
            .unwrap();
        let buffer = s.create_buffer(f.device, &buffer_info(1024)).unwrap();
        let image = s.create_image(f.device, &image_info()).unwrap();
        s.bind_buffer_memory(f.device, buffer, freed, 0).unwrap();
        s.bind_image_memory(f.device, image, freed, 4096).unwrap();
        s.free_memory(f.device, freed);
        (freed, buffer, image)
    };
    let saved = state.lock().snapshot_capture().unwrap();
    let saved_handles = state.lock().live_handles();

    let (_fake2, restored) = restore(&saved);
    {
        let s = restored.lock();
        assert_eq!(s.live_handles(), saved_handles);
        assert_eq!(s.snapshot_capture().unwrap().records, saved.records);
    }

    // A binding that still names the freed allocation is dropped on load.
    let mut stale = saved.clone();
    for record in stale.records.iter_mut().filter(|r| r.handle == buffer || r.handle == image) {
        match &mut record.info {
            NodeInfo::Buffer { binding, .. } | NodeInfo::Image { binding, .. } => {
                *binding = Some(MemoryBinding {
                    memory: freed,
                    offset: 0,
                });
            }
            other => panic!("expected a resource, got {:?}", other),
        }
    }
    let (_fake3, restored) = restore(&stale);
    let s = restored.lock();
    assert_eq!(s.live_handles(), saved_handles);
    for resource in [buffer, image] {
        match &s.object(resource).unwrap().info {
            NodeInfo::Buffer { binding, .. } | NodeInfo::Image { binding, .. } => {
                assert_eq!(*binding, None)
            }
            other => panic!("expected a resource, got {:?}", other),
        }
    }
}

#[test]
fn test_device_outliving_its_instance_is_restored() {
    let (_fake, state) = decoder(snapshot_config());
    let f = bring_up(&state);
    let (memory, buffer) = {
        let mut s = state.lock();
        let memory = s
            .allocate_memory(f.device, &memory_info(4096, HOST_VISIBLE_TYPE))
            .unwrap();
        s.map_memory(f.device, memory, 0, vk::WHOLE_SIZE, 0).unwrap();
        let buffer = s.create_buffer(f.device, &buffer_info(1024)).unwrap();
        s.bind_buffer_memory(f.device, buffer, memory, 0).unwrap();
        s.destroy_instance(f.instance);
        (memory, buffer)
    };
    let mut bytes = Vec::new();
    state.lock().snapshot_save(&mut bytes).unwrap();
    let saved = read_snapshot(&mut Cursor::new(&bytes)).unwrap();
    let saved_handles = state.lock().live_handles();

    let (fake2, restored) = restore(&saved);
    let mut s = restored.lock();
    assert_eq!(s.live_handles(), saved_handles);
    assert_eq!(s.object(f.device).unwrap().parent, None);
    assert!(s.get_mapped_host_pointer(memory).is_some());
    let again = s.snapshot_capture().unwrap();
    assert_eq!(again.records, saved.records);
    assert_eq!(sorted_table(&again), sorted_table(&saved));
    // Only the hidden instance backs the device.
    assert_eq!(fake2.live_instance_count(), 1);

    // The device, its queue and its memory table keep working.
    let fence = s.create_fence(f.device, false).unwrap();
    s.queue_submit(f.queue, &[SubmitInfo::default()], fence).unwrap();
    assert_eq!(s.get_fence_status(f.device, fence), Ok(true));
    let more = s
        .allocate_memory(f.device, &memory_info(64, HOST_VISIBLE_TYPE))
        .unwrap();
    assert_eq!(fake2.allocation_type_index(raw_memory_of(&s, more)), Some(2));

    s.destroy_buffer(f.device, buffer);
    s.destroy_device(f.device);
    assert!(s.live_handles().is_empty());
    assert_eq!(fake2.live_device_count(), 0);
    assert_eq!(fake2.live_instance_count(), 0);
}

fn raw_memory_of(s: &vkhost_server::StateGuard<'_>, memory: BoxedHandle) -> vk::DeviceMemory {
    vk::DeviceMemory::from_raw(
        s.handle_map()
            .unbox(ObjectType::DeviceMemory, memory)
            .unwrap(),
    )
}

#[test]
fn test_fence_state_is_read_back_at_capture() {
    let (_fake, state) = decoder(snapshot_config());
    let f = bring_up(&state);
    let (reset, submitted, queued) = {
        let mut s = state.lock();
        let reset = s.create_fence(f.device, true).unwrap();
        s.reset_fences(f.device, &[reset]).unwrap();
        let submitted = s.create_fence(f.device, false).unwrap();
        s.queue_submit(f.queue, &[SubmitInfo::default()], submitted)
            .unwrap();
        let queued = s.create_fence(f.device, false).unwrap();
        s.queue_submit_async(f.queue, &[SubmitInfo::default()], queued, 1)
            .unwrap();
        (reset, submitted, queued)
    };

    let saved = state.lock().snapshot_capture().unwrap();
    assert!(!fence_record(&saved, reset));
    assert!(fence_record(&saved, submitted));
    assert!(fence_record(&saved, queued));

    let (_fake2, restored) = restore(&saved);
    let s = restored.lock();
    assert_eq!(s.get_fence_status(f.device, reset), Ok(false));
    assert_eq!(s.get_fence_status(f.device, submitted), Ok(true));
    assert_eq!(s.get_fence_status(f.device, queued), Ok(true));
}
