use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use tracing::debug;

use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::CommandPoolCreateInfo;

use super::{DecoderState, StateGuard};
use crate::object_graph::NodeInfo;

impl StateGuard<'_> {
    pub fn create_command_pool(&mut self, device: BoxedHandle, info: &CommandPoolCreateInfo) -> VkResult<BoxedHandle> {
        self.create_child(
            ObjectType::CommandPool,
            device,
            None,
            NodeInfo::CommandPool {
                create_info: info.clone(),
            },
            |driver, dev| driver.create_command_pool(dev, info),
        )
    }

    /// Command buffers of the pool die with it; the driver frees them.
    pub fn destroy_command_pool(&mut self, device: BoxedHandle, pool: BoxedHandle) {
        if self.inner.handles.contains(pool) {
            self.drain_lane(device);
            let buffers = self.forget_descendants(pool);
            debug!(?pool, buffers, "released command buffers with pool");
        }
        self.destroy_child(ObjectType::CommandPool, device, pool, |driver, dev, p: vk::CommandPool| {
            driver.destroy_command_pool(dev, p)
        });
    }

    pub fn reset_command_pool(&mut self, device: BoxedHandle, pool: BoxedHandle, flags: u32) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: vk::CommandPool = self.unbox(ObjectType::CommandPool, pool)?;
        self.drain_lane(device);
        self.driver().reset_command_pool(dev, raw, flags)
    }

    pub fn allocate_command_buffers(
        &mut self,
        device: BoxedHandle,
        pool: BoxedHandle,
        level: i32,
        count: u32,
    ) -> VkResult<Vec<BoxedHandle>> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw_pool: vk::CommandPool = self.unbox(ObjectType::CommandPool, pool)?;
        let dispatch = self.dispatch(device)?;
        let buffers = self.driver().allocate_command_buffers(
            dev,
            raw_pool,
            vk::CommandBufferLevel::from_raw(level),
            count,
        )?;
        let boxed = buffers
            .into_iter()
            .map(|cb| {
                self.box_dispatchable(
                    ObjectType::CommandBuffer,
                    cb.as_raw(),
                    dispatch.clone(),
                    false,
                    Some(pool),
                    NodeInfo::CommandBuffer { level },
                )
            })
            .collect::<Vec<_>>();
        debug!(?pool, count = boxed.len(), "command buffers allocated");
        Ok(boxed)
    }

    pub fn free_command_buffers(&mut self, device: BoxedHandle, pool: BoxedHandle, buffers: &[BoxedHandle]) {
        let (Some(dev), Some(raw_pool)) = (
            self.inner.handles.unbox(ObjectType::Device, device),
            self.inner.handles.unbox(ObjectType::CommandPool, pool),
        ) else {
            tracing::warn!(?device, ?pool, "free of command buffers with unknown pool ignored");
            return;
        };
        self.drain_lane(device);
        let mut raw = Vec::with_capacity(buffers.len());
        for cb in buffers.iter().filter(|cb| !cb.is_null()) {
            match self.inner.handles.unbox(ObjectType::CommandBuffer, *cb) {
                Some(r) => {
                    raw.push(vk::CommandBuffer::from_raw(r));
                    self.forget_object(*cb);
                }
                None => tracing::warn!(command_buffer = ?cb, "free of unknown command buffer ignored"),
            }
        }
        self.driver().free_command_buffers(
            vk::Device::from_raw(dev),
            vk::CommandPool::from_raw(raw_pool),
            &raw,
        );
    }

    /// Device and driver handle of a command buffer.
    fn command_buffer(&self, command_buffer: BoxedHandle) -> VkResult<(vk::Device, vk::CommandBuffer)> {
        let raw: vk::CommandBuffer = self.unbox(ObjectType::CommandBuffer, command_buffer)?;
        let dispatch = self.dispatch(command_buffer)?;
        Ok((vk::Device::from_raw(dispatch.root), raw))
    }

    pub fn begin_command_buffer(&self, command_buffer: BoxedHandle, flags: u32) -> VkResult<()> {
        let (dev, raw) = self.command_buffer(command_buffer)?;
        self.drain_lane(self.owning_device(command_buffer)?);
        self.driver().begin_command_buffer(dev, raw, flags)
    }

    pub fn end_command_buffer(&self, command_buffer: BoxedHandle) -> VkResult<()> {
        let (dev, raw) = self.command_buffer(command_buffer)?;
        self.drain_lane(self.owning_device(command_buffer)?);
        self.driver().end_command_buffer(dev, raw)
    }

    pub fn reset_command_buffer(&self, command_buffer: BoxedHandle, flags: u32) -> VkResult<()> {
        let (dev, raw) = self.command_buffer(command_buffer)?;
        self.drain_lane(self.owning_device(command_buffer)?);
        self.driver().reset_command_buffer(dev, raw, flags)
    }

    /// Queue a begin on the device lane. Errors past validation are logged,
    /// not returned.
    pub fn begin_command_buffer_async(
        &mut self,
        command_buffer: BoxedHandle,
        flags: u32,
        sequence_number: u32,
    ) -> VkResult<()> {
        let (dev, raw) = self.command_buffer(command_buffer)?;
        let device = self.owning_device(command_buffer)?;
        let timeline = self.timeline(ObjectType::CommandBuffer, command_buffer)?;
        self.run_async(device, timeline, sequence_number, "begin command buffer", move |driver| {
            driver.begin_command_buffer(dev, raw, flags)
        });
        Ok(())
    }

    pub fn end_command_buffer_async(&mut self, command_buffer: BoxedHandle, sequence_number: u32) -> VkResult<()> {
        let (dev, raw) = self.command_buffer(command_buffer)?;
        let device = self.owning_device(command_buffer)?;
        let timeline = self.timeline(ObjectType::CommandBuffer, command_buffer)?;
        self.run_async(device, timeline, sequence_number, "end command buffer", move |driver| {
            driver.end_command_buffer(dev, raw)
        });
        Ok(())
    }

    pub fn reset_command_buffer_async(
        &mut self,
        command_buffer: BoxedHandle,
        flags: u32,
        sequence_number: u32,
    ) -> VkResult<()> {
        let (dev, raw) = self.command_buffer(command_buffer)?;
        let device = self.owning_device(command_buffer)?;
        let timeline = self.timeline(ObjectType::CommandBuffer, command_buffer)?;
        self.run_async(device, timeline, sequence_number, "reset command buffer", move |driver| {
            driver.reset_command_buffer(dev, raw, flags)
        });
        Ok(())
    }
}

impl DecoderState {
    /// Block until every async command-buffer call up to `sequence_number`
    /// has completed. Returns at once when `need_host_sync` is false.
    pub fn command_buffer_host_sync(
        &self,
        command_buffer: BoxedHandle,
        need_host_sync: bool,
        sequence_number: u32,
    ) -> VkResult<()> {
        if !need_host_sync {
            return Ok(());
        }
        let timeline = self
            .lock()
            .timeline(ObjectType::CommandBuffer, command_buffer)?;
        self.wait_timeline(timeline, need_host_sync, sequence_number)
    }
}
