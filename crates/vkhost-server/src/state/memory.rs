use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use tracing::{debug, warn};

use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::{MappedMemoryRange, MemoryAllocateInfo};

use super::{Mapping, StateGuard, INVALID_HANDLE};
use crate::driver::HostPtr;
use crate::object_graph::{MappedRange, MemoryInfo, NodeInfo};
use crate::transform::MemoryTypeMap;

/// Which way a flush or invalidate moves bytes between staging and driver.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SyncDirection {
    ToDriver,
    FromDriver,
}

impl StateGuard<'_> {
    pub fn allocate_memory(&mut self, device: BoxedHandle, info: &MemoryAllocateInfo) -> VkResult<BoxedHandle> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let map = self.memory_type_map(device);
        let Some(host_type_index) = map.host_index(info.memory_type_index) else {
            warn!(
                memory_type_index = info.memory_type_index,
                "allocation with a memory type the guest was never shown"
            );
            return Err(INVALID_HANDLE);
        };

        let memory = self
            .driver()
            .allocate_memory(dev, info.allocation_size, host_type_index)?;
        let boxed = self.box_object(
            ObjectType::DeviceMemory,
            memory.as_raw(),
            Some(device),
            NodeInfo::DeviceMemory(MemoryInfo {
                size: info.allocation_size,
                memory_type_index: info.memory_type_index,
                host_type_index,
                mapped: None,
                direct: false,
                color_buffer: info.import_color_buffer,
            }),
        );
        debug!(
            memory = ?boxed,
            size = info.allocation_size,
            host_type_index,
            "memory allocated"
        );
        Ok(boxed)
    }

    pub fn free_memory(&mut self, device: BoxedHandle, memory: BoxedHandle) {
        self.free_memory_sync(device, memory).ok();
    }

    /// Like [`free_memory`](Self::free_memory), reporting unknown handles.
    pub fn free_memory_sync(&mut self, device: BoxedHandle, memory: BoxedHandle) -> VkResult<()> {
        if memory.is_null() {
            return Ok(());
        }
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: vk::DeviceMemory = self.unbox(ObjectType::DeviceMemory, memory)?;
        if self.inner.mappings.contains_key(&memory) {
            // Freeing implicitly unmaps.
            self.unmap_memory(device, memory);
        }
        let unbound = self.inner.graph.clear_bindings_to(memory);
        self.forget_object(memory);
        self.driver().free_memory(dev, raw);
        debug!(?memory, unbound, "memory freed");
        Ok(())
    }

    /// Map an allocation and return the pointer the guest writes through:
    /// the driver's own when direct mapping is on, a staging copy otherwise.
    pub fn map_memory(
        &mut self,
        device: BoxedHandle,
        memory: BoxedHandle,
        offset: u64,
        size: u64,
        _flags: u32,
    ) -> VkResult<HostPtr> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: vk::DeviceMemory = self.unbox(ObjectType::DeviceMemory, memory)?;
        if self.inner.mappings.contains_key(&memory) {
            warn!(?memory, "memory is already mapped");
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let allocation_size = self.memory_info(memory)?.size;
        if offset >= allocation_size {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let size = if size == vk::WHOLE_SIZE {
            allocation_size - offset
        } else {
            size
        };
        let in_range = offset.checked_add(size).is_some_and(|end| end <= allocation_size);
        if size == 0 || !in_range {
            warn!(?memory, offset, size, allocation_size, "map range outside the allocation");
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        let driver_ptr = self.driver().map_memory(dev, raw, offset, size)?;
        let direct = self.decoder().using_direct_mapping();
        let (guest_ptr, staging) = if direct {
            (driver_ptr, None)
        } else {
            let mut staging = vec![0u8; size as usize].into_boxed_slice();
            // SAFETY: the driver mapped `size` bytes at `driver_ptr`.
            unsafe {
                std::ptr::copy_nonoverlapping(driver_ptr.as_ptr(), staging.as_mut_ptr(), size as usize);
            }
            let ptr = HostPtr::new(staging.as_mut_ptr()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
            (ptr, Some(staging))
        };

        self.inner.mappings.insert(
            memory,
            Mapping {
                device: dev,
                memory: raw,
                driver_ptr,
                guest_ptr,
                offset,
                size,
                staging,
            },
        );
        if let Some(info) = self.memory_info_mut(memory) {
            info.mapped = Some(MappedRange { offset, size });
            info.direct = direct;
        }
        debug!(?memory, offset, size, direct, "memory mapped");
        Ok(guest_ptr)
    }

    /// Unmapping memory that is not mapped only logs.
    pub fn unmap_memory(&mut self, device: BoxedHandle, memory: BoxedHandle) {
        if self.inner.handles.unbox(ObjectType::Device, device).is_none() {
            warn!(?device, "unmap with unknown device ignored");
            return;
        }
        let Some(mapping) = self.inner.mappings.remove(&memory) else {
            warn!(?memory, "unmap of memory that is not mapped");
            return;
        };
        if mapping.staging.is_some() {
            copy_staging(&mapping, 0, mapping.size, SyncDirection::ToDriver);
        }
        self.driver().unmap_memory(mapping.device, mapping.memory);
        if let Some(info) = self.memory_info_mut(memory) {
            info.mapped = None;
            info.direct = false;
        }
        debug!(?memory, "memory unmapped");
    }

    pub fn flush_mapped_memory_ranges(
        &mut self,
        device: BoxedHandle,
        ranges: &[MappedMemoryRange],
    ) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let driver_ranges = self.sync_ranges(ranges, SyncDirection::ToDriver)?;
        self.driver().flush_mapped_memory_ranges(dev, &driver_ranges)
    }

    pub fn invalidate_mapped_memory_ranges(
        &mut self,
        device: BoxedHandle,
        ranges: &[MappedMemoryRange],
    ) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let driver_ranges = self.resolve_ranges(ranges)?;
        self.driver().invalidate_mapped_memory_ranges(dev, &driver_ranges)?;
        self.sync_ranges(ranges, SyncDirection::FromDriver)?;
        Ok(())
    }

    /// Expose a whole allocation's driver pointer for placement into the
    /// guest's address space. Only possible with direct mapping.
    pub fn map_memory_into_address_space(&mut self, device: BoxedHandle, memory: BoxedHandle) -> VkResult<u64> {
        if !self.decoder().using_direct_mapping() {
            warn!(?memory, "address-space mapping needs direct mapping");
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let ptr = match self.inner.mappings.get(&memory) {
            Some(mapping) => mapping.driver_ptr,
            None => self.map_memory(device, memory, 0, vk::WHOLE_SIZE, 0)?,
        };
        Ok(ptr.addr())
    }

    /// Host address, mapped size and export id of an allocation. The whole
    /// allocation is mapped on first use and the id stays fixed until free.
    pub fn get_memory_host_address_info(
        &mut self,
        device: BoxedHandle,
        memory: BoxedHandle,
    ) -> VkResult<(u64, u64, u64)> {
        let address = self.map_memory_into_address_space(device, memory)?;
        let size = self.inner.mappings.get(&memory).map_or(0, |m| m.size);
        let id = match self.inner.host_memory_ids.get(&memory) {
            Some(id) => *id,
            None => {
                let id = self.inner.next_host_memory_id;
                self.inner.next_host_memory_id += 1;
                self.inner.host_memory_ids.insert(memory, id);
                id
            }
        };
        debug!(?memory, address, size, id, "memory exported");
        Ok((address, size, id))
    }

    /// Pointer the guest sees for a mapped allocation.
    pub fn get_mapped_host_pointer(&self, memory: BoxedHandle) -> Option<HostPtr> {
        self.inner.mappings.get(&memory).map(|m| m.guest_ptr)
    }

    pub fn get_device_memory_size(&self, memory: BoxedHandle) -> Option<u64> {
        match &self.inner.graph.get(memory)?.info {
            NodeInfo::DeviceMemory(info) => Some(info.size),
            _ => None,
        }
    }

    /// Rewrite guest-relative memory descriptions into host-relative ones.
    /// Offsets and sizes pass through; unknown type indices are left alone.
    pub fn device_memory_transform_to_host(
        &self,
        memory: &mut [u64],
        _offset: &mut [u64],
        _size: &mut [u64],
        type_index: &mut [u32],
        type_bits: &mut [u32],
    ) {
        let owner = memory
            .iter()
            .map(|m| BoxedHandle(*m))
            .find(|boxed| self.inner.graph.contains(*boxed));
        let map = self.transform_map(owner);
        for m in memory.iter_mut() {
            *m = self
                .inner
                .handles
                .unbox(ObjectType::DeviceMemory, BoxedHandle(*m))
                .unwrap_or(*m);
        }
        for index in type_index.iter_mut() {
            *index = map.host_index(*index).unwrap_or(*index);
        }
        for bits in type_bits.iter_mut() {
            *bits = map.host_bits(*bits);
        }
    }

    /// Inverse of [`device_memory_transform_to_host`](Self::device_memory_transform_to_host).
    pub fn device_memory_transform_from_host(
        &self,
        memory: &mut [u64],
        _offset: &mut [u64],
        _size: &mut [u64],
        type_index: &mut [u32],
        type_bits: &mut [u32],
    ) {
        let owner = memory
            .iter()
            .find_map(|m| self.inner.handles.unboxed_to_boxed(ObjectType::DeviceMemory, *m));
        let map = self.transform_map(owner);
        for m in memory.iter_mut() {
            if let Some(boxed) = self
                .inner
                .handles
                .unboxed_to_boxed(ObjectType::DeviceMemory, *m)
            {
                *m = boxed.raw();
            }
        }
        for index in type_index.iter_mut() {
            *index = map.guest_index(*index).unwrap_or(*index);
        }
        for bits in type_bits.iter_mut() {
            *bits = map.guest_bits(*bits);
        }
    }

    /// Table of the device owning the first known allocation in a
    /// transform, or the primary table when none is known.
    fn transform_map(&self, owner: Option<BoxedHandle>) -> MemoryTypeMap {
        match owner {
            Some(memory) => self.memory_type_map(memory),
            None => self
                .inner
                .primary_memory_types
                .clone()
                .unwrap_or_else(|| MemoryTypeMap::identity(vk::MAX_MEMORY_TYPES as u32)),
        }
    }

    pub(crate) fn memory_info(&self, memory: BoxedHandle) -> VkResult<&MemoryInfo> {
        match self.inner.graph.get(memory).map(|n| &n.info) {
            Some(NodeInfo::DeviceMemory(info)) => Ok(info),
            _ => Err(INVALID_HANDLE),
        }
    }

    fn memory_info_mut(&mut self, memory: BoxedHandle) -> Option<&mut MemoryInfo> {
        match self.inner.graph.get_mut(memory).map(|n| &mut n.info) {
            Some(NodeInfo::DeviceMemory(info)) => Some(info),
            _ => None,
        }
    }

    /// Contents of a live mapping, as the guest currently sees them.
    pub(crate) fn mapped_contents(&self, memory: BoxedHandle) -> Option<Vec<u8>> {
        let mapping = self.inner.mappings.get(&memory)?;
        // SAFETY: the mapping covers `size` bytes at `guest_ptr` until unmapped.
        let bytes =
            unsafe { std::slice::from_raw_parts(mapping.guest_ptr.as_ptr(), mapping.size as usize) };
        Some(bytes.to_vec())
    }

    /// Overwrite the start of a live mapping, then push it to the driver.
    pub(crate) fn write_mapped_contents(&mut self, memory: BoxedHandle, contents: &[u8]) -> VkResult<()> {
        let mapping = self.inner.mappings.get(&memory).ok_or(INVALID_HANDLE)?;
        let len = contents.len().min(mapping.size as usize);
        // SAFETY: `len` is within the mapped range.
        unsafe {
            std::ptr::copy_nonoverlapping(contents.as_ptr(), mapping.guest_ptr.as_ptr(), len);
        }
        if mapping.staging.is_some() {
            copy_staging(mapping, 0, mapping.size, SyncDirection::ToDriver);
        }
        Ok(())
    }

    /// Unbox each range's memory and reject ranges that leave the allocation.
    fn resolve_ranges(&self, ranges: &[MappedMemoryRange]) -> VkResult<Vec<(vk::DeviceMemory, u64, u64)>> {
        ranges
            .iter()
            .map(|r| {
                let raw: vk::DeviceMemory = self.unbox(ObjectType::DeviceMemory, r.memory)?;
                let allocation_size = self.memory_info(r.memory)?.size;
                let in_range = r.offset <= allocation_size
                    && (r.size == vk::WHOLE_SIZE
                        || r.offset.checked_add(r.size).is_some_and(|end| end <= allocation_size));
                if !in_range {
                    warn!(memory = ?r.memory, offset = r.offset, size = r.size, "range outside the allocation");
                    return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
                }
                Ok((raw, r.offset, r.size))
            })
            .collect()
    }

    /// Move staging bytes for each range in `direction`. Direct mappings
    /// need no copy.
    fn sync_ranges(
        &self,
        ranges: &[MappedMemoryRange],
        direction: SyncDirection,
    ) -> VkResult<Vec<(vk::DeviceMemory, u64, u64)>> {
        let resolved = self.resolve_ranges(ranges)?;
        for range in ranges {
            let Some(mapping) = self.inner.mappings.get(&range.memory) else {
                warn!(memory = ?range.memory, "range on memory that is not mapped");
                continue;
            };
            if mapping.staging.is_none() {
                continue;
            }
            let Some(start) = range.offset.checked_sub(mapping.offset) else {
                warn!(memory = ?range.memory, "range starts before the mapping");
                continue;
            };
            let len = if range.size == vk::WHOLE_SIZE {
                mapping.size.saturating_sub(start)
            } else {
                range.size
            };
            copy_staging(mapping, start, len, direction);
        }
        Ok(resolved)
    }
}

/// Copy `len` bytes at mapping-relative `start` between the staging copy and
/// the driver mapping. Clamped to the mapped range.
fn copy_staging(mapping: &Mapping, start: u64, len: u64, direction: SyncDirection) {
    if start >= mapping.size {
        return;
    }
    let len = len.min(mapping.size - start) as usize;
    let start = start as usize;
    // SAFETY: both regions span `mapping.size` bytes and never overlap.
    unsafe {
        let staging = mapping.guest_ptr.as_ptr().add(start);
        let driver = mapping.driver_ptr.as_ptr().add(start);
        match direction {
            SyncDirection::ToDriver => std::ptr::copy_nonoverlapping(staging, driver, len),
            SyncDirection::FromDriver => std::ptr::copy_nonoverlapping(driver, staging, len),
        }
    }
}
