use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use tracing::{debug, info, warn};

use vkhost_core::{DispatchLevel, DispatchTable};
use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::{
    DeviceCreateInfo, ExtensionProperties, ImageFormatQuery, InstanceCreateInfo,
};

use super::StateGuard;
use crate::driver::{
    DeviceIdProperties, DeviceProperties, ExternalSemaphoreProperties, MemoryProperties,
    PhysicalDeviceFeatures2,
};
use crate::host_sync::{Lane, SyncTimeline};
use crate::object_graph::NodeInfo;
use crate::transform::{clamp_api_version, MemoryTypeMap};

impl StateGuard<'_> {
    // ── Instance ────────────────────────────────────────────

    pub fn enumerate_instance_version(&self) -> VkResult<u32> {
        let version = self.driver().enumerate_instance_version()?;
        Ok(clamp_api_version(version, self.config().vulkan.max_api_version()))
    }

    pub fn create_instance(&mut self, info: &InstanceCreateInfo) -> VkResult<BoxedHandle> {
        let mut driver_info = info.clone();
        driver_info.api_version =
            clamp_api_version(info.api_version, self.config().vulkan.max_api_version());

        let instance = self.driver().create_instance(&driver_info)?;
        let dispatch = DispatchTable::new(DispatchLevel::Instance, instance.as_raw());
        let boxed = self.box_dispatchable(
            ObjectType::Instance,
            instance.as_raw(),
            dispatch,
            true,
            None,
            NodeInfo::Instance {
                create_info: info.clone(),
            },
        );
        info!(instance = ?boxed, app = ?info.app_name, "instance created");
        Ok(boxed)
    }

    /// Physical devices go with their instance. Devices created from them
    /// stay alive as roots until the guest destroys them.
    pub fn destroy_instance(&mut self, instance: BoxedHandle) {
        let Some(raw) = self.inner.handles.unbox(ObjectType::Instance, instance) else {
            if !instance.is_null() {
                warn!(?instance, "destroy of unknown instance ignored");
            }
            return;
        };
        for pd in self
            .inner
            .graph
            .children_of_type(instance, ObjectType::PhysicalDevice)
        {
            self.forget_object(pd);
        }
        self.forget_object(instance);

        if self.config().vulkan.cleanup_instances {
            self.driver().destroy_instance(vk::Instance::from_raw(raw));
        } else {
            debug!(?instance, "keeping driver instance alive");
        }
        info!(?instance, "instance destroyed");
    }

    pub fn enumerate_physical_devices(&mut self, instance: BoxedHandle) -> VkResult<Vec<BoxedHandle>> {
        let raw: vk::Instance = self.unbox(ObjectType::Instance, instance)?;
        let dispatch = self.dispatch(instance)?;
        let driver = self.driver();
        let physical_devices = driver.enumerate_physical_devices(raw)?;

        let mut boxed = Vec::with_capacity(physical_devices.len());
        for (index, pd) in physical_devices.into_iter().enumerate() {
            let handle = self.box_dispatchable(
                ObjectType::PhysicalDevice,
                pd.as_raw(),
                dispatch.clone(),
                false,
                Some(instance),
                NodeInfo::PhysicalDevice {
                    index: index as u32,
                },
            );
            if !self.inner.memory_types.contains_key(&handle) {
                let props = driver.get_physical_device_memory_properties(raw, pd)?;
                let map = MemoryTypeMap::from_properties(&props);
                if self.inner.primary_memory_types.is_none() {
                    self.inner.primary_memory_types = Some(map.clone());
                }
                self.inner.memory_types.insert(handle, map);
            }
            boxed.push(handle);
        }
        debug!(?instance, count = boxed.len(), "enumerated physical devices");
        Ok(boxed)
    }

    fn physical_device(&self, pd: BoxedHandle) -> VkResult<(vk::Instance, vk::PhysicalDevice)> {
        let raw: vk::PhysicalDevice = self.unbox(ObjectType::PhysicalDevice, pd)?;
        let dispatch = self.dispatch(pd)?;
        Ok((vk::Instance::from_raw(dispatch.root), raw))
    }

    // ── Physical Device Queries ─────────────────────────────

    pub fn get_physical_device_properties(&self, pd: BoxedHandle) -> VkResult<DeviceProperties> {
        let (instance, raw) = self.physical_device(pd)?;
        let mut props = self.driver().get_physical_device_properties(instance, raw)?;
        props.api_version =
            clamp_api_version(props.api_version, self.config().vulkan.max_api_version());
        Ok(props)
    }

    pub fn get_physical_device_features(&self, pd: BoxedHandle) -> VkResult<vk::PhysicalDeviceFeatures> {
        let (instance, raw) = self.physical_device(pd)?;
        let mut features = self.driver().get_physical_device_features(instance, raw)?;
        if !self.config().vulkan.sparse_binding {
            mask_sparse_features(&mut features);
        }
        Ok(features)
    }

    pub fn get_physical_device_memory_properties(&self, pd: BoxedHandle) -> VkResult<MemoryProperties> {
        let (instance, raw) = self.physical_device(pd)?;
        let props = self
            .driver()
            .get_physical_device_memory_properties(instance, raw)?;
        Ok(guest_memory_properties(props))
    }

    pub fn get_physical_device_queue_family_properties(
        &self,
        pd: BoxedHandle,
    ) -> VkResult<Vec<vk::QueueFamilyProperties>> {
        let (instance, raw) = self.physical_device(pd)?;
        let mut families = self
            .driver()
            .get_physical_device_queue_family_properties(instance, raw)?;
        if !self.config().vulkan.sparse_binding {
            for family in &mut families {
                family.queue_flags &= !vk::QueueFlags::SPARSE_BINDING;
            }
        }
        Ok(families)
    }

    pub fn get_physical_device_format_properties(
        &self,
        pd: BoxedHandle,
        format: vk::Format,
    ) -> VkResult<vk::FormatProperties> {
        let (instance, raw) = self.physical_device(pd)?;
        let mut props = self
            .driver()
            .get_physical_device_format_properties(instance, raw, format)?;
        mask_disjoint_features(&mut props);
        Ok(props)
    }

    pub fn get_physical_device_image_format_properties(
        &self,
        pd: BoxedHandle,
        query: &ImageFormatQuery,
    ) -> VkResult<vk::ImageFormatProperties> {
        let (instance, raw) = self.physical_device(pd)?;
        reject_disjoint(query)?;
        self.driver()
            .get_physical_device_image_format_properties(instance, raw, query)
    }

    pub fn enumerate_device_extension_properties(
        &self,
        pd: BoxedHandle,
    ) -> VkResult<Vec<ExtensionProperties>> {
        let (instance, raw) = self.physical_device(pd)?;
        let allowed = &self.config().vulkan.device_extensions;
        let mut extensions = self
            .driver()
            .enumerate_device_extension_properties(instance, raw)?;
        extensions.retain(|e| allowed.iter().any(|a| *a == e.extension_name));
        Ok(extensions)
    }

    // ── Physical Device Queries (*2) ────────────────────────

    pub fn get_physical_device_features2(&self, pd: BoxedHandle) -> VkResult<PhysicalDeviceFeatures2> {
        let (instance, raw) = self.physical_device(pd)?;
        let mut features = self.driver().get_physical_device_features2(instance, raw)?;
        if !self.config().vulkan.sparse_binding {
            mask_sparse_features(&mut features.features);
        }
        // Protected memory types are never shown to the guest.
        features.protected_memory = false;
        Ok(features)
    }

    pub fn get_physical_device_properties2(
        &self,
        pd: BoxedHandle,
    ) -> VkResult<(DeviceProperties, DeviceIdProperties)> {
        let properties = self.get_physical_device_properties(pd)?;
        let (instance, raw) = self.physical_device(pd)?;
        let ids = self.driver().get_physical_device_id_properties(instance, raw)?;
        Ok((properties, ids))
    }

    pub fn get_physical_device_memory_properties2(&self, pd: BoxedHandle) -> VkResult<MemoryProperties> {
        self.get_physical_device_memory_properties(pd)
    }

    pub fn get_physical_device_format_properties2(
        &self,
        pd: BoxedHandle,
        format: vk::Format,
    ) -> VkResult<vk::FormatProperties> {
        self.get_physical_device_format_properties(pd, format)
    }

    pub fn get_physical_device_image_format_properties2(
        &self,
        pd: BoxedHandle,
        query: &ImageFormatQuery,
    ) -> VkResult<vk::ImageFormatProperties> {
        self.get_physical_device_image_format_properties(pd, query)
    }

    /// Guest sync fds are backed by host opaque fds, so a sync fd query is
    /// answered from the opaque fd properties.
    pub fn get_physical_device_external_semaphore_properties(
        &self,
        pd: BoxedHandle,
        handle_type: u32,
    ) -> VkResult<ExternalSemaphoreProperties> {
        let (instance, raw) = self.physical_device(pd)?;
        let requested = vk::ExternalSemaphoreHandleTypeFlags::from_raw(handle_type);
        let host_type = if requested == vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD {
            vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD
        } else {
            requested
        };
        let mut props = self
            .driver()
            .get_physical_device_external_semaphore_properties(instance, raw, host_type)?;
        if host_type != requested && props.compatible_handle_types.contains(host_type) {
            props.compatible_handle_types = requested;
            props.export_from_imported_handle_types = requested;
        }
        Ok(props)
    }

    // ── Logical Device ──────────────────────────────────────

    pub fn create_device(&mut self, pd: BoxedHandle, info: &DeviceCreateInfo) -> VkResult<BoxedHandle> {
        let (instance, raw) = self.physical_device(pd)?;
        let instance_info = self
            .inner
            .graph
            .parent(pd)
            .and_then(|i| match &self.inner.graph.get(i)?.info {
                NodeInfo::Instance { create_info } => Some(create_info.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let physical_device_index = match self.inner.graph.get(pd).map(|n| &n.info) {
            Some(NodeInfo::PhysicalDevice { index }) => *index,
            _ => 0,
        };
        let memory_types = self.memory_type_map(pd);
        self.create_device_on(
            Some(pd),
            (instance, raw),
            info,
            instance_info,
            physical_device_index,
            memory_types,
        )
    }

    /// Re-create a device whose instance the guest already destroyed. The
    /// device gets a driver instance of its own that is never boxed; it goes
    /// away with the device.
    pub(crate) fn create_detached_device(
        &mut self,
        instance_info: &InstanceCreateInfo,
        physical_device_index: u32,
        info: &DeviceCreateInfo,
    ) -> VkResult<BoxedHandle> {
        let mut driver_info = instance_info.clone();
        driver_info.api_version =
            clamp_api_version(instance_info.api_version, self.config().vulkan.max_api_version());
        let driver = self.driver();
        let instance = driver.create_instance(&driver_info)?;
        match self.create_device_on_hidden_instance(instance, instance_info, physical_device_index, info) {
            Ok(device) => {
                self.inner.hidden_instances.insert(device, instance);
                debug!(?device, physical_device_index, "device created under a hidden instance");
                Ok(device)
            }
            Err(e) => {
                driver.destroy_instance(instance);
                Err(e)
            }
        }
    }

    fn create_device_on_hidden_instance(
        &mut self,
        instance: vk::Instance,
        instance_info: &InstanceCreateInfo,
        physical_device_index: u32,
        info: &DeviceCreateInfo,
    ) -> VkResult<BoxedHandle> {
        let driver = self.driver();
        let raw = driver
            .enumerate_physical_devices(instance)?
            .get(physical_device_index as usize)
            .copied()
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let map = MemoryTypeMap::from_properties(&driver.get_physical_device_memory_properties(instance, raw)?);
        if self.inner.primary_memory_types.is_none() {
            self.inner.primary_memory_types = Some(map.clone());
        }
        self.create_device_on(
            None,
            (instance, raw),
            info,
            instance_info.clone(),
            physical_device_index,
            map,
        )
    }

    fn create_device_on(
        &mut self,
        pd: Option<BoxedHandle>,
        (instance, raw): (vk::Instance, vk::PhysicalDevice),
        info: &DeviceCreateInfo,
        instance_info: InstanceCreateInfo,
        physical_device_index: u32,
        memory_types: MemoryTypeMap,
    ) -> VkResult<BoxedHandle> {
        let config = self.config();

        let mut filtered = info.clone();
        filtered.enabled_extensions.retain(|ext| {
            let allowed = config.vulkan.device_extensions.iter().any(|a| a == ext);
            if !allowed {
                warn!(extension = %ext, "dropping device extension not exposed to the guest");
            }
            allowed
        });

        let device = self.driver().create_device(instance, raw, &filtered)?;
        let dispatch = DispatchTable::new(DispatchLevel::Device, device.as_raw());
        let boxed = self.box_dispatchable(
            ObjectType::Device,
            device.as_raw(),
            dispatch,
            true,
            pd,
            NodeInfo::Device {
                create_info: filtered,
                instance_info,
                physical_device_index,
            },
        );
        // Kept per device so it survives the instance.
        self.inner.memory_types.insert(boxed, memory_types);

        if config.vulkan.deferred_commands && !self.inner.lanes.contains_key(&boxed) {
            match Lane::spawn(format!("vkhost-device-{}", boxed.index())) {
                Ok(lane) => {
                    self.inner.lanes.insert(boxed, lane);
                }
                Err(e) => warn!(device = ?boxed, "failed to start async lane, running inline: {}", e),
            }
        }
        info!(device = ?boxed, physical_device = ?pd, "device created");
        Ok(boxed)
    }

    /// Tear down a device. Objects the guest leaked under it are dropped from
    /// the host tables without driver calls; the driver reclaims them with the
    /// device.
    pub fn destroy_device(&mut self, device: BoxedHandle) {
        let Some(raw) = self.inner.handles.unbox(ObjectType::Device, device) else {
            if !device.is_null() {
                warn!(?device, "destroy of unknown device ignored");
            }
            return;
        };

        if let Some(mut lane) = self.inner.lanes.remove(&device) {
            lane.drain();
            lane.shutdown();
        }
        let leaked = self.forget_descendants(device);
        if leaked > 0 {
            warn!(?device, leaked, "device destroyed with live child objects");
        }
        self.forget_object(device);
        self.driver().destroy_device(vk::Device::from_raw(raw));
        if let Some(instance) = self.inner.hidden_instances.remove(&device) {
            self.driver().destroy_instance(instance);
        }
        info!(?device, "device destroyed");
    }

    pub fn get_device_queue(
        &mut self,
        device: BoxedHandle,
        queue_family_index: u32,
        queue_index: u32,
    ) -> VkResult<BoxedHandle> {
        let raw: vk::Device = self.unbox(ObjectType::Device, device)?;
        let dispatch = self.dispatch(device)?;
        let queue = self
            .driver()
            .get_device_queue(raw, queue_family_index, queue_index)?;
        let boxed = self.box_dispatchable(
            ObjectType::Queue,
            queue.as_raw(),
            dispatch,
            false,
            Some(device),
            NodeInfo::Queue {
                family_index: queue_family_index,
                queue_index,
            },
        );
        self.inner
            .timelines
            .entry(boxed)
            .or_insert_with(SyncTimeline::new);
        Ok(boxed)
    }

    pub fn device_wait_idle(&self, device: BoxedHandle) -> VkResult<()> {
        let raw: vk::Device = self.unbox(ObjectType::Device, device)?;
        self.drain_lane(device);
        self.driver().device_wait_idle(raw)
    }
}

fn guest_memory_properties(props: MemoryProperties) -> MemoryProperties {
    let map = MemoryTypeMap::from_properties(&props);
    MemoryProperties {
        types: map.guest_types(&props),
        heaps: props.heaps,
    }
}

fn mask_disjoint_features(props: &mut vk::FormatProperties) {
    props.linear_tiling_features &= !vk::FormatFeatureFlags::DISJOINT;
    props.optimal_tiling_features &= !vk::FormatFeatureFlags::DISJOINT;
    props.buffer_features &= !vk::FormatFeatureFlags::DISJOINT;
}

fn reject_disjoint(query: &ImageFormatQuery) -> VkResult<()> {
    if vk::ImageCreateFlags::from_raw(query.flags).contains(vk::ImageCreateFlags::DISJOINT) {
        Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)
    } else {
        Ok(())
    }
}

fn mask_sparse_features(features: &mut vk::PhysicalDeviceFeatures) {
    features.sparse_binding = vk::FALSE;
    features.sparse_residency_buffer = vk::FALSE;
    features.sparse_residency_image2_d = vk::FALSE;
    features.sparse_residency_image3_d = vk::FALSE;
    features.sparse_residency2_samples = vk::FALSE;
    features.sparse_residency4_samples = vk::FALSE;
    features.sparse_residency8_samples = vk::FALSE;
    features.sparse_residency16_samples = vk::FALSE;
    features.sparse_residency_aliased = vk::FALSE;
}
