//! Decoder state: the handle indirection table, the object graph and the
//! host-side bookkeeping for mappings and async work, all behind one lock.
//!
//! Every intercepted call is a method on [`StateGuard`]; callers get one
//! from [`DecoderState::lock`] and may hold it across several calls.

mod command;
mod descriptor;
mod instance;
mod memory;
mod queue;
mod resources;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use vkhost_core::{CoreError, DispatchTable, HandleMap, VkHostConfig};
use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::InstanceCreateInfo;

use crate::driver::{Driver, HostPtr};
use crate::host_sync::{Lane, SyncTimeline};
use crate::object_graph::{NodeInfo, ObjectGraph, ObjectNode};
use crate::transform::{clamp_api_version, MemoryTypeMap};

/// Result of any call made with a handle the table does not know.
pub const INVALID_HANDLE: vk::Result = vk::Result::ERROR_VALIDATION_FAILED_EXT;

const EXTERNAL_MEMORY_EXTENSION: &str = "VK_KHR_external_memory";

/// What the host driver can do, queried once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostFeatureSupport {
    pub supports_vulkan: bool,
    pub supports_vulkan_1_1: bool,
    pub supports_external_memory: bool,
    pub use_deferred_commands: bool,
    pub use_create_resources_with_requirements: bool,
    /// Advertised (clamped) API version
    pub api_version: u32,
    pub driver_version: u32,
    pub device_id: u32,
    pub vendor_id: u32,
}

/// A live memory mapping. `guest_ptr` is either the driver's pointer or the
/// start of `staging`.
pub(crate) struct Mapping {
    pub(crate) device: vk::Device,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) driver_ptr: HostPtr,
    pub(crate) guest_ptr: HostPtr,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) staging: Option<Box<[u8]>>,
}

pub(crate) struct StateInner {
    pub(crate) handles: HandleMap,
    pub(crate) graph: ObjectGraph,
    /// Per physical device
    pub(crate) memory_types: HashMap<BoxedHandle, MemoryTypeMap>,
    /// Taken from the first physical device enumerated
    pub(crate) primary_memory_types: Option<MemoryTypeMap>,
    pub(crate) mappings: HashMap<BoxedHandle, Mapping>,
    /// Completion timelines of queues and command buffers
    pub(crate) timelines: HashMap<BoxedHandle, Arc<SyncTimeline>>,
    /// Async lanes, one per device
    pub(crate) lanes: HashMap<BoxedHandle, Lane>,
    /// Driver instances backing devices whose guest instance is gone
    pub(crate) hidden_instances: HashMap<BoxedHandle, vk::Instance>,
    /// Ids handed out for exported allocations
    pub(crate) host_memory_ids: HashMap<BoxedHandle, u64>,
    pub(crate) next_host_memory_id: u64,
    /// Linear image layout per format: (offset, row pitch alignment)
    pub(crate) linear_layouts: HashMap<i32, (u64, u64)>,
}

impl StateInner {
    fn new() -> Self {
        Self {
            handles: HandleMap::new(),
            graph: ObjectGraph::new(),
            memory_types: HashMap::new(),
            primary_memory_types: None,
            mappings: HashMap::new(),
            timelines: HashMap::new(),
            lanes: HashMap::new(),
            hidden_instances: HashMap::new(),
            host_memory_ids: HashMap::new(),
            next_host_memory_id: 1,
            linear_layouts: HashMap::new(),
        }
    }
}

/// Process-wide decoder state. Constructed once by the process entry point and
/// shared by reference with every decoder thread.
pub struct DecoderState {
    driver: Arc<dyn Driver>,
    config: VkHostConfig,
    features: HostFeatureSupport,
    inner: Mutex<StateInner>,
}

impl DecoderState {
    pub fn new(driver: Arc<dyn Driver>, config: VkHostConfig) -> Self {
        let features = query_host_features(driver.as_ref(), &config);
        Self {
            driver,
            config,
            features,
            inner: Mutex::new(StateInner::new()),
        }
    }

    /// Acquire the global lock. Dropping the guard releases it.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            state: self,
            inner: self.inner.lock(),
        }
    }

    pub fn snapshots_enabled(&self) -> bool {
        self.config.snapshot.enabled
    }

    pub fn host_feature_support(&self) -> &HostFeatureSupport {
        &self.features
    }

    pub fn using_direct_mapping(&self) -> bool {
        self.config.vulkan.direct_mapping
    }

    pub fn config(&self) -> &VkHostConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    /// Stop all async lanes and release every host-sync waiter.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        shutdown_inner(&mut inner);
    }

    fn warn_interval(&self) -> Duration {
        Duration::from_millis(self.config.vulkan.host_sync_warn_ms)
    }

    /// Wait on a timeline without holding the global lock.
    fn wait_timeline(
        &self,
        timeline: Arc<SyncTimeline>,
        need_host_sync: bool,
        sequence_number: u32,
    ) -> VkResult<()> {
        if !need_host_sync {
            return Ok(());
        }
        if timeline.wait(sequence_number, self.warn_interval()) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_DEVICE_LOST)
        }
    }
}

impl Drop for DecoderState {
    fn drop(&mut self) {
        shutdown_inner(self.inner.get_mut());
    }
}

fn shutdown_inner(inner: &mut StateInner) {
    for (device, mut lane) in inner.lanes.drain() {
        debug!(?device, "stopping lane");
        lane.shutdown();
    }
    for timeline in inner.timelines.values() {
        timeline.shutdown();
    }
}

fn query_host_features(driver: &dyn Driver, config: &VkHostConfig) -> HostFeatureSupport {
    let mut support = HostFeatureSupport {
        use_deferred_commands: config.vulkan.deferred_commands,
        use_create_resources_with_requirements: config.vulkan.create_resources_with_requirements,
        ..Default::default()
    };

    let version = match driver.enumerate_instance_version() {
        Ok(v) => v,
        Err(e) => {
            warn!("host Vulkan unavailable: {:?}", e);
            return support;
        }
    };
    let query_info = InstanceCreateInfo {
        app_name: Some("vkhost-feature-query".to_string()),
        api_version: version,
        ..Default::default()
    };
    let instance = match driver.create_instance(&query_info) {
        Ok(i) => i,
        Err(e) => {
            warn!("failed to create feature query instance: {:?}", e);
            return support;
        }
    };

    support.supports_vulkan = true;
    support.supports_vulkan_1_1 = version >= vk::API_VERSION_1_1;
    support.api_version = clamp_api_version(version, config.vulkan.max_api_version());

    if let Some(pd) = driver
        .enumerate_physical_devices(instance)
        .ok()
        .and_then(|pds| pds.first().copied())
    {
        if let Ok(props) = driver.get_physical_device_properties(instance, pd) {
            support.driver_version = props.driver_version;
            support.device_id = props.device_id;
            support.vendor_id = props.vendor_id;
        }
        if let Ok(exts) = driver.enumerate_device_extension_properties(instance, pd) {
            support.supports_external_memory =
                exts.iter().any(|e| e.extension_name == EXTERNAL_MEMORY_EXTENSION);
        }
    }
    driver.destroy_instance(instance);

    info!(
        api_version = format_args!(
            "{}.{}",
            vk::api_version_major(support.api_version),
            vk::api_version_minor(support.api_version)
        ),
        external_memory = support.supports_external_memory,
        "queried host Vulkan support"
    );
    support
}

/// Exclusive access to the decoder state for the lifetime of the guard.
pub struct StateGuard<'a> {
    state: &'a DecoderState,
    inner: MutexGuard<'a, StateInner>,
}

impl<'a> StateGuard<'a> {
    pub(crate) fn driver(&self) -> &'a dyn Driver {
        let state: &'a DecoderState = self.state;
        state.driver.as_ref()
    }

    pub(crate) fn config(&self) -> &'a VkHostConfig {
        let state: &'a DecoderState = self.state;
        &state.config
    }

    pub fn decoder(&self) -> &'a DecoderState {
        self.state
    }

    pub fn handle_map(&self) -> &HandleMap {
        &self.inner.handles
    }

    pub fn graph(&self) -> &ObjectGraph {
        &self.inner.graph
    }

    /// Boxed handles of every live object.
    pub fn live_handles(&self) -> BTreeSet<BoxedHandle> {
        self.inner.graph.handles()
    }

    pub fn object(&self, handle: BoxedHandle) -> Option<&ObjectNode> {
        self.inner.graph.get(handle)
    }

    // ── Snapshot handle reservations ────────────────────────

    pub fn set_created_handles_for_snapshot_load(&mut self, buffer: &[u8]) -> Result<usize, CoreError> {
        self.inner.handles.set_created_handles_for_snapshot_load(buffer)
    }

    pub fn clear_created_handles_for_snapshot_load(&mut self) {
        self.inner.handles.clear_created_handles_for_snapshot_load();
    }

    // ── Unboxing ────────────────────────────────────────────

    pub(crate) fn unbox<H: Handle>(&self, object_type: ObjectType, boxed: BoxedHandle) -> VkResult<H> {
        match self.inner.handles.unbox(object_type, boxed) {
            Some(raw) => Ok(H::from_raw(raw)),
            None => {
                warn!(?boxed, ?object_type, "invalid handle");
                Err(INVALID_HANDLE)
            }
        }
    }

    /// Like [`unbox`](Self::unbox), but a null handle maps to a null handle.
    pub(crate) fn unbox_optional<H: Handle>(
        &self,
        object_type: ObjectType,
        boxed: BoxedHandle,
    ) -> VkResult<H> {
        if boxed.is_null() {
            Ok(H::from_raw(0))
        } else {
            self.unbox(object_type, boxed)
        }
    }

    pub(crate) fn unbox_all<H: Handle>(
        &self,
        object_type: ObjectType,
        boxed: &[BoxedHandle],
    ) -> VkResult<Vec<H>> {
        boxed.iter().map(|b| self.unbox(object_type, *b)).collect()
    }

    /// Dispatch table of a dispatchable object.
    pub(crate) fn dispatch(&self, boxed: BoxedHandle) -> VkResult<Arc<DispatchTable>> {
        self.inner.handles.dispatch(boxed).ok_or_else(|| {
            warn!(?boxed, "no dispatch table for handle");
            INVALID_HANDLE
        })
    }

    /// Nearest device owning `boxed` (or `boxed` itself).
    pub(crate) fn owning_device(&self, boxed: BoxedHandle) -> VkResult<BoxedHandle> {
        self.inner
            .graph
            .ancestor_of_type(boxed, ObjectType::Device)
            .ok_or(INVALID_HANDLE)
    }

    // ── Boxing ──────────────────────────────────────────────

    pub(crate) fn box_object(
        &mut self,
        object_type: ObjectType,
        underlying: u64,
        parent: Option<BoxedHandle>,
        info: NodeInfo,
    ) -> BoxedHandle {
        let boxed = self
            .inner
            .handles
            .new_boxed_non_dispatchable(object_type, underlying);
        if !self.inner.graph.contains(boxed) {
            self.inner.graph.insert(boxed, object_type, parent, info);
        }
        boxed
    }

    pub(crate) fn box_dispatchable(
        &mut self,
        object_type: ObjectType,
        underlying: u64,
        dispatch: Arc<DispatchTable>,
        owns_dispatch: bool,
        parent: Option<BoxedHandle>,
        info: NodeInfo,
    ) -> BoxedHandle {
        let boxed = self.inner.handles.new_boxed_dispatchable(
            object_type,
            underlying,
            dispatch,
            owns_dispatch,
        );
        if !self.inner.graph.contains(boxed) {
            self.inner.graph.insert(boxed, object_type, parent, info);
        }
        boxed
    }

    /// Drop every host-side trace of an object: its box, its graph node, a
    /// live mapping, and its timeline.
    pub(crate) fn forget_object(&mut self, boxed: BoxedHandle) -> Option<ObjectNode> {
        self.inner.handles.delete(boxed);
        self.inner.mappings.remove(&boxed);
        if let Some(timeline) = self.inner.timelines.remove(&boxed) {
            timeline.shutdown();
        }
        self.inner.memory_types.remove(&boxed);
        self.inner.host_memory_ids.remove(&boxed);
        self.inner.graph.remove(boxed)
    }

    /// Forget every descendant of `boxed`, deepest first. No driver calls.
    pub(crate) fn forget_descendants(&mut self, boxed: BoxedHandle) -> usize {
        let descendants = self.inner.graph.descendants(boxed);
        for child in &descendants {
            self.forget_object(*child);
        }
        descendants.len()
    }

    /// Create a device-level object and box it under `parent` (the device
    /// itself when `None`).
    pub(crate) fn create_child<H: Handle>(
        &mut self,
        object_type: ObjectType,
        device: BoxedHandle,
        parent: Option<BoxedHandle>,
        info: NodeInfo,
        create: impl FnOnce(&'a dyn Driver, vk::Device) -> VkResult<H>,
    ) -> VkResult<BoxedHandle> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw = create(self.driver(), dev)?;
        let boxed = self.box_object(
            object_type,
            raw.as_raw(),
            Some(parent.unwrap_or(device)),
            info,
        );
        debug!(handle = ?boxed, "created {:?}", object_type);
        Ok(boxed)
    }

    /// Destroy a device-level object. Unknown or null handles are ignored.
    pub(crate) fn destroy_child<H: Handle>(
        &mut self,
        object_type: ObjectType,
        device: BoxedHandle,
        object: BoxedHandle,
        destroy: impl FnOnce(&'a dyn Driver, vk::Device, H),
    ) {
        if object.is_null() {
            return;
        }
        let dev = self.inner.handles.unbox(ObjectType::Device, device);
        let raw = self.inner.handles.unbox(object_type, object);
        let (Some(dev), Some(raw)) = (dev, raw) else {
            warn!(?object, ?object_type, "destroy of unknown handle ignored");
            return;
        };
        self.forget_object(object);
        destroy(self.driver(), vk::Device::from_raw(dev), H::from_raw(raw));
        debug!(handle = ?object, "destroyed {:?}", object_type);
    }

    /// Destroy one object through its normal destroy path. Objects the driver
    /// frees with their parent are only forgotten.
    pub(crate) fn destroy_object(&mut self, handle: BoxedHandle, object_type: ObjectType) {
        let device = match object_type {
            ObjectType::Instance | ObjectType::PhysicalDevice | ObjectType::Device => BoxedHandle::NULL,
            _ => match self.owning_device(handle) {
                Ok(device) => device,
                Err(_) => {
                    self.forget_object(handle);
                    return;
                }
            },
        };
        match object_type {
            ObjectType::Instance => self.destroy_instance(handle),
            ObjectType::Device => self.destroy_device(handle),
            ObjectType::PhysicalDevice
            | ObjectType::Queue
            | ObjectType::DescriptorSet
            | ObjectType::CommandBuffer => {
                self.forget_object(handle);
            }
            ObjectType::DeviceMemory => self.free_memory(device, handle),
            ObjectType::Buffer => self.destroy_buffer(device, handle),
            ObjectType::Image => self.destroy_image(device, handle),
            ObjectType::ImageView => self.destroy_image_view(device, handle),
            ObjectType::Sampler => self.destroy_sampler(device, handle),
            ObjectType::DescriptorSetLayout => self.destroy_descriptor_set_layout(device, handle),
            ObjectType::DescriptorPool => self.destroy_descriptor_pool(device, handle),
            ObjectType::DescriptorUpdateTemplate => {
                self.destroy_descriptor_update_template(device, handle)
            }
            ObjectType::RenderPass => self.destroy_render_pass(device, handle),
            ObjectType::CommandPool => self.destroy_command_pool(device, handle),
            ObjectType::Semaphore => self.destroy_semaphore(device, handle),
            ObjectType::Fence => self.destroy_fence(device, handle),
        }
    }

    /// Memory-type translation for a device (or physical device).
    pub(crate) fn memory_type_map(&self, owner: BoxedHandle) -> MemoryTypeMap {
        let graph = &self.inner.graph;
        [ObjectType::Device, ObjectType::PhysicalDevice]
            .into_iter()
            .find_map(|ty| {
                graph
                    .ancestor_of_type(owner, ty)
                    .and_then(|h| self.inner.memory_types.get(&h))
            })
            .or(self.inner.primary_memory_types.as_ref())
            .cloned()
            .unwrap_or_else(|| MemoryTypeMap::identity(vk::MAX_MEMORY_TYPES as u32))
    }

    /// Timeline of a queue or command buffer, created on first use.
    pub(crate) fn timeline(
        &mut self,
        object_type: ObjectType,
        boxed: BoxedHandle,
    ) -> VkResult<Arc<SyncTimeline>> {
        if self.inner.handles.unbox(object_type, boxed).is_none() {
            warn!(?boxed, ?object_type, "invalid handle");
            return Err(INVALID_HANDLE);
        }
        Ok(self
            .inner
            .timelines
            .entry(boxed)
            .or_insert_with(SyncTimeline::new)
            .clone())
    }

    /// Run `job` for `sequence_number` on the device's lane, or inline when
    /// deferred commands are off.
    pub(crate) fn run_async<F>(
        &mut self,
        device: BoxedHandle,
        timeline: Arc<SyncTimeline>,
        sequence_number: u32,
        what: &'static str,
        job: F,
    ) where
        F: FnOnce(&dyn Driver) -> VkResult<()> + Send + 'static,
    {
        let driver = Arc::clone(&self.state.driver);
        let run = move || {
            if let Err(e) = job(driver.as_ref()) {
                tracing::error!(sequence_number, "async {} failed: {:?}", what, e);
            }
        };
        match self.inner.lanes.get(&device) {
            Some(lane) if self.config().vulkan.deferred_commands => {
                lane.submit(timeline, sequence_number, run);
            }
            _ => {
                run();
                timeline.advance(sequence_number);
            }
        }
    }

    /// Wait for all queued async work of a device.
    pub(crate) fn drain_lane(&self, device: BoxedHandle) {
        if let Some(lane) = self.inner.lanes.get(&device) {
            lane.drain();
        }
    }

    /// Marker for a device's queued async work, to wait on after the guard
    /// is dropped.
    pub(crate) fn lane_drain_marker(&self, device: BoxedHandle) -> Option<Receiver<()>> {
        self.inner.lanes.get(&device).and_then(Lane::drain_marker)
    }

    /// Wait for the queued async work of every device.
    pub(crate) fn drain_all_lanes(&self) {
        for lane in self.inner.lanes.values() {
            lane.drain();
        }
    }
}
