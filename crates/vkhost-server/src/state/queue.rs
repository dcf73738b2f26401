use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;

use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::{BindSparseInfo, SubmitInfo};

use super::{DecoderState, StateGuard};
use crate::driver::{SparseBind, SparseBindBatch, SubmitBatch};

/// A queue resolved down to what the driver needs.
struct ResolvedQueue {
    device: BoxedHandle,
    raw_device: vk::Device,
    raw: vk::Queue,
}

impl StateGuard<'_> {
    fn queue(&self, queue: BoxedHandle) -> VkResult<ResolvedQueue> {
        let raw: vk::Queue = self.unbox(ObjectType::Queue, queue)?;
        let dispatch = self.dispatch(queue)?;
        Ok(ResolvedQueue {
            device: self.owning_device(queue)?,
            raw_device: vk::Device::from_raw(dispatch.root),
            raw,
        })
    }

    fn resolve_submits(&self, submits: &[SubmitInfo]) -> VkResult<Vec<SubmitBatch>> {
        submits
            .iter()
            .map(|s| {
                Ok(SubmitBatch {
                    wait_semaphores: self.unbox_all(ObjectType::Semaphore, &s.wait_semaphores)?,
                    wait_dst_stage_masks: s
                        .wait_dst_stage_masks
                        .iter()
                        .map(|m| vk::PipelineStageFlags::from_raw(*m))
                        .collect(),
                    command_buffers: self.unbox_all(ObjectType::CommandBuffer, &s.command_buffers)?,
                    signal_semaphores: self.unbox_all(ObjectType::Semaphore, &s.signal_semaphores)?,
                })
            })
            .collect()
    }

    fn resolve_binds(&self, binds: &[BindSparseInfo]) -> VkResult<Vec<SparseBindBatch>> {
        binds
            .iter()
            .map(|b| {
                let buffer_binds = b
                    .buffer_binds
                    .iter()
                    .map(|bb| {
                        let buffer: vk::Buffer = self.unbox(ObjectType::Buffer, bb.buffer)?;
                        let binds = bb
                            .binds
                            .iter()
                            .map(|m| {
                                Ok(SparseBind {
                                    resource_offset: m.resource_offset,
                                    size: m.size,
                                    memory: self.unbox_optional(ObjectType::DeviceMemory, m.memory)?,
                                    memory_offset: m.memory_offset,
                                    flags: vk::SparseMemoryBindFlags::from_raw(m.flags),
                                })
                            })
                            .collect::<VkResult<Vec<_>>>()?;
                        Ok((buffer, binds))
                    })
                    .collect::<VkResult<Vec<_>>>()?;
                Ok(SparseBindBatch {
                    wait_semaphores: self.unbox_all(ObjectType::Semaphore, &b.wait_semaphores)?,
                    buffer_binds,
                    signal_semaphores: self.unbox_all(ObjectType::Semaphore, &b.signal_semaphores)?,
                })
            })
            .collect()
    }

    // ── Synchronous ─────────────────────────────────────────

    /// Runs after everything already queued on the device's lane.
    pub fn queue_submit(&self, queue: BoxedHandle, submits: &[SubmitInfo], fence: BoxedHandle) -> VkResult<()> {
        let q = self.queue(queue)?;
        let batches = self.resolve_submits(submits)?;
        let fence: vk::Fence = self.unbox_optional(ObjectType::Fence, fence)?;
        self.drain_lane(q.device);
        self.driver().queue_submit(q.raw_device, q.raw, &batches, fence)
    }

    pub fn queue_wait_idle(&self, queue: BoxedHandle) -> VkResult<()> {
        let q = self.queue(queue)?;
        self.drain_lane(q.device);
        self.driver().queue_wait_idle(q.raw_device, q.raw)
    }

    pub fn queue_bind_sparse(
        &self,
        queue: BoxedHandle,
        binds: &[BindSparseInfo],
        fence: BoxedHandle,
    ) -> VkResult<()> {
        let q = self.queue(queue)?;
        let batches = self.resolve_binds(binds)?;
        let fence: vk::Fence = self.unbox_optional(ObjectType::Fence, fence)?;
        self.drain_lane(q.device);
        self.driver().queue_bind_sparse(q.raw_device, q.raw, &batches, fence)
    }

    // ── Async ───────────────────────────────────────────────
    //
    // Handles are resolved now, under the lock; the driver call runs later on
    // the device lane and advances the queue's timeline to `sequence_number`.

    pub fn queue_submit_async(
        &mut self,
        queue: BoxedHandle,
        submits: &[SubmitInfo],
        fence: BoxedHandle,
        sequence_number: u32,
    ) -> VkResult<()> {
        let q = self.queue(queue)?;
        let batches = self.resolve_submits(submits)?;
        let fence: vk::Fence = self.unbox_optional(ObjectType::Fence, fence)?;
        let timeline = self.timeline(ObjectType::Queue, queue)?;
        let (dev, raw) = (q.raw_device, q.raw);
        self.run_async(q.device, timeline, sequence_number, "queue submit", move |driver| {
            driver.queue_submit(dev, raw, &batches, fence)
        });
        Ok(())
    }

    pub fn queue_wait_idle_async(&mut self, queue: BoxedHandle, sequence_number: u32) -> VkResult<()> {
        let q = self.queue(queue)?;
        let timeline = self.timeline(ObjectType::Queue, queue)?;
        let (dev, raw) = (q.raw_device, q.raw);
        self.run_async(q.device, timeline, sequence_number, "queue wait idle", move |driver| {
            driver.queue_wait_idle(dev, raw)
        });
        Ok(())
    }

    pub fn queue_bind_sparse_async(
        &mut self,
        queue: BoxedHandle,
        binds: &[BindSparseInfo],
        fence: BoxedHandle,
        sequence_number: u32,
    ) -> VkResult<()> {
        let q = self.queue(queue)?;
        let batches = self.resolve_binds(binds)?;
        let fence: vk::Fence = self.unbox_optional(ObjectType::Fence, fence)?;
        let timeline = self.timeline(ObjectType::Queue, queue)?;
        let (dev, raw) = (q.raw_device, q.raw);
        self.run_async(q.device, timeline, sequence_number, "queue bind sparse", move |driver| {
            driver.queue_bind_sparse(dev, raw, &batches, fence)
        });
        Ok(())
    }
}

impl DecoderState {
    /// Block until every async queue call up to `sequence_number` has
    /// completed. Returns at once when `need_host_sync` is false.
    pub fn queue_host_sync(&self, queue: BoxedHandle, need_host_sync: bool, sequence_number: u32) -> VkResult<()> {
        if !need_host_sync {
            return Ok(());
        }
        let timeline = self.lock().timeline(ObjectType::Queue, queue)?;
        self.wait_timeline(timeline, need_host_sync, sequence_number)
    }
}
