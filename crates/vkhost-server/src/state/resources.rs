use ash::prelude::VkResult;
use ash::vk;
use tracing::{debug, warn};

use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::{
    BindBufferMemoryInfo, BufferCreateInfo, ImageCreateInfo, ImageViewCreateInfo,
    RenderPassCreateInfo, SamplerCreateInfo,
};

use super::{DecoderState, StateGuard, INVALID_HANDLE};
use crate::driver::MemoryRequirements2;
use crate::object_graph::{MemoryBinding, NodeInfo};

/// Widths of the throwaway images used to measure linear row pitch.
const LINEAR_LAYOUT_WIDTHS: [u32; 7] = [1, 3, 7, 15, 31, 63, 64];

impl StateGuard<'_> {
    // ── Buffer ──────────────────────────────────────────────

    pub fn create_buffer(&mut self, device: BoxedHandle, info: &BufferCreateInfo) -> VkResult<BoxedHandle> {
        self.create_child(
            ObjectType::Buffer,
            device,
            None,
            NodeInfo::Buffer {
                create_info: info.clone(),
                binding: None,
                color_buffer: None,
            },
            |driver, dev| driver.create_buffer(dev, info),
        )
    }

    /// Create a buffer and return its requirements in the same round trip.
    pub fn create_buffer_with_requirements(
        &mut self,
        device: BoxedHandle,
        info: &BufferCreateInfo,
    ) -> VkResult<(BoxedHandle, vk::MemoryRequirements)> {
        if !self.decoder().host_feature_support().use_create_resources_with_requirements {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let buffer = self.create_buffer(device, info)?;
        match self.get_buffer_memory_requirements(device, buffer) {
            Ok(requirements) => Ok((buffer, requirements)),
            Err(e) => {
                self.destroy_buffer(device, buffer);
                Err(e)
            }
        }
    }

    pub fn destroy_buffer(&mut self, device: BoxedHandle, buffer: BoxedHandle) {
        self.destroy_child(ObjectType::Buffer, device, buffer, |driver, dev, b: vk::Buffer| {
            driver.destroy_buffer(dev, b)
        });
    }

    pub fn get_buffer_memory_requirements(
        &self,
        device: BoxedHandle,
        buffer: BoxedHandle,
    ) -> VkResult<vk::MemoryRequirements> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: vk::Buffer = self.unbox(ObjectType::Buffer, buffer)?;
        let requirements = self.driver().get_buffer_memory_requirements(dev, raw)?;
        Ok(self.guest_requirements(device, requirements))
    }

    pub fn bind_buffer_memory(
        &mut self,
        device: BoxedHandle,
        buffer: BoxedHandle,
        memory: BoxedHandle,
        offset: u64,
    ) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: vk::Buffer = self.unbox(ObjectType::Buffer, buffer)?;
        let mem: vk::DeviceMemory = self.unbox(ObjectType::DeviceMemory, memory)?;
        self.driver().bind_buffer_memory(dev, raw, mem, offset)?;
        self.record_binding(buffer, memory, offset);
        Ok(())
    }

    /// Every handle is checked before the driver sees any of the binds.
    pub fn bind_buffer_memory2(&mut self, device: BoxedHandle, infos: &[BindBufferMemoryInfo]) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw = infos
            .iter()
            .map(|info| {
                Ok((
                    self.unbox(ObjectType::Buffer, info.buffer)?,
                    self.unbox(ObjectType::DeviceMemory, info.memory)?,
                    info.memory_offset,
                ))
            })
            .collect::<VkResult<Vec<(vk::Buffer, vk::DeviceMemory, u64)>>>()?;
        self.driver().bind_buffer_memory2(dev, &raw)?;
        for info in infos {
            self.record_binding(info.buffer, info.memory, info.memory_offset);
        }
        Ok(())
    }

    /// Associate a buffer with an external color buffer. Host-side only.
    pub fn register_buffer_color_buffer(&mut self, buffer: BoxedHandle, color_buffer: u32) -> VkResult<()> {
        match self.inner.graph.get_mut(buffer).map(|n| &mut n.info) {
            Some(NodeInfo::Buffer { color_buffer: slot, .. }) => {
                *slot = Some(color_buffer);
                debug!(?buffer, color_buffer, "buffer bound to color buffer");
                Ok(())
            }
            _ => {
                warn!(?buffer, "color buffer registration for unknown buffer");
                Err(INVALID_HANDLE)
            }
        }
    }

    // ── Image ───────────────────────────────────────────────

    pub fn create_image(&mut self, device: BoxedHandle, info: &ImageCreateInfo) -> VkResult<BoxedHandle> {
        self.create_child(
            ObjectType::Image,
            device,
            None,
            NodeInfo::Image {
                create_info: info.clone(),
                binding: None,
                color_buffer: None,
            },
            |driver, dev| driver.create_image(dev, info),
        )
    }

    pub fn create_image_with_requirements(
        &mut self,
        device: BoxedHandle,
        info: &ImageCreateInfo,
    ) -> VkResult<(BoxedHandle, vk::MemoryRequirements)> {
        if !self.decoder().host_feature_support().use_create_resources_with_requirements {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let image = self.create_image(device, info)?;
        match self.get_image_memory_requirements(device, image) {
            Ok(requirements) => Ok((image, requirements)),
            Err(e) => {
                self.destroy_image(device, image);
                Err(e)
            }
        }
    }

    /// Views outliving their image move up to the device.
    pub fn destroy_image(&mut self, device: BoxedHandle, image: BoxedHandle) {
        self.destroy_child(ObjectType::Image, device, image, |driver, dev, i: vk::Image| {
            driver.destroy_image(dev, i)
        });
    }

    pub fn get_image_memory_requirements(
        &self,
        device: BoxedHandle,
        image: BoxedHandle,
    ) -> VkResult<vk::MemoryRequirements> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: vk::Image = self.unbox(ObjectType::Image, image)?;
        let requirements = self.driver().get_image_memory_requirements(dev, raw)?;
        Ok(self.guest_requirements(device, requirements))
    }

    pub fn bind_image_memory(
        &mut self,
        device: BoxedHandle,
        image: BoxedHandle,
        memory: BoxedHandle,
        offset: u64,
    ) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: vk::Image = self.unbox(ObjectType::Image, image)?;
        let mem: vk::DeviceMemory = self.unbox(ObjectType::DeviceMemory, memory)?;
        self.driver().bind_image_memory(dev, raw, mem, offset)?;
        self.record_binding(image, memory, offset);
        Ok(())
    }

    pub fn get_image_memory_requirements2(
        &self,
        device: BoxedHandle,
        image: BoxedHandle,
    ) -> VkResult<MemoryRequirements2> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: vk::Image = self.unbox(ObjectType::Image, image)?;
        let mut requirements = self.driver().get_image_memory_requirements2(dev, raw)?;
        requirements.requirements = self.guest_requirements(device, requirements.requirements);
        Ok(requirements)
    }

    /// Offset and row pitch alignment the driver uses for linear images of
    /// `format`. Measured once per format on throwaway images.
    pub fn get_linear_image_layout(&mut self, device: BoxedHandle, format: i32) -> VkResult<(u64, u64)> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        if let Some(layout) = self.inner.linear_layouts.get(&format) {
            return Ok(*layout);
        }
        let driver = self.driver();
        let mut offset = 0;
        let mut alignment = u64::MAX;
        for (i, width) in LINEAR_LAYOUT_WIDTHS.into_iter().enumerate() {
            let info = ImageCreateInfo {
                flags: 0,
                image_type: vk::ImageType::TYPE_2D.as_raw(),
                format,
                extent: [width, 64, 1],
                mip_levels: 1,
                array_layers: 1,
                samples: vk::SampleCountFlags::TYPE_1.as_raw(),
                tiling: vk::ImageTiling::LINEAR.as_raw(),
                usage: (vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST).as_raw(),
                sharing_mode: vk::SharingMode::EXCLUSIVE.as_raw(),
                queue_family_indices: Vec::new(),
                initial_layout: vk::ImageLayout::UNDEFINED.as_raw(),
            };
            let image = driver.create_image(dev, &info)?;
            let layout = driver.get_image_subresource_layout(dev, image);
            driver.destroy_image(dev, image);
            let layout = layout?;
            if i == 0 {
                offset = layout.offset;
            }
            if layout.row_pitch > 0 {
                alignment = alignment.min(1u64 << layout.row_pitch.trailing_zeros());
            }
        }
        let alignment = if alignment == u64::MAX { 1 } else { alignment };
        debug!(format, offset, alignment, "linear image layout measured");
        self.inner.linear_layouts.insert(format, (offset, alignment));
        Ok((offset, alignment))
    }

    fn record_binding(&mut self, resource: BoxedHandle, memory: BoxedHandle, offset: u64) {
        if let Some(NodeInfo::Buffer { binding, .. } | NodeInfo::Image { binding, .. }) =
            self.inner.graph.get_mut(resource).map(|n| &mut n.info)
        {
            *binding = Some(MemoryBinding { memory, offset });
        }
    }

    pub fn register_image_color_buffer(&mut self, image: BoxedHandle, color_buffer: u32) -> VkResult<()> {
        match self.inner.graph.get_mut(image).map(|n| &mut n.info) {
            Some(NodeInfo::Image { color_buffer: slot, .. }) => {
                *slot = Some(color_buffer);
                debug!(?image, color_buffer, "image bound to color buffer");
                Ok(())
            }
            _ => {
                warn!(?image, "color buffer registration for unknown image");
                Err(INVALID_HANDLE)
            }
        }
    }

    pub fn create_image_view(&mut self, device: BoxedHandle, info: &ImageViewCreateInfo) -> VkResult<BoxedHandle> {
        let image: vk::Image = self.unbox(ObjectType::Image, info.image)?;
        self.create_child(
            ObjectType::ImageView,
            device,
            Some(info.image),
            NodeInfo::ImageView {
                create_info: info.clone(),
            },
            |driver, dev| driver.create_image_view(dev, image, info),
        )
    }

    pub fn destroy_image_view(&mut self, device: BoxedHandle, view: BoxedHandle) {
        self.destroy_child(ObjectType::ImageView, device, view, |driver, dev, v: vk::ImageView| {
            driver.destroy_image_view(dev, v)
        });
    }

    // ── Sampler / Render Pass ───────────────────────────────

    pub fn create_sampler(&mut self, device: BoxedHandle, info: &SamplerCreateInfo) -> VkResult<BoxedHandle> {
        self.create_child(
            ObjectType::Sampler,
            device,
            None,
            NodeInfo::Sampler {
                create_info: info.clone(),
            },
            |driver, dev| driver.create_sampler(dev, info),
        )
    }

    pub fn destroy_sampler(&mut self, device: BoxedHandle, sampler: BoxedHandle) {
        self.destroy_child(ObjectType::Sampler, device, sampler, |driver, dev, s: vk::Sampler| {
            driver.destroy_sampler(dev, s)
        });
    }

    pub fn create_render_pass(&mut self, device: BoxedHandle, info: &RenderPassCreateInfo) -> VkResult<BoxedHandle> {
        self.create_child(
            ObjectType::RenderPass,
            device,
            None,
            NodeInfo::RenderPass {
                create_info: info.clone(),
            },
            |driver, dev| driver.create_render_pass(dev, info),
        )
    }

    pub fn destroy_render_pass(&mut self, device: BoxedHandle, render_pass: BoxedHandle) {
        self.destroy_child(
            ObjectType::RenderPass,
            device,
            render_pass,
            |driver, dev, rp: vk::RenderPass| driver.destroy_render_pass(dev, rp),
        );
    }

    // ── Sync Objects ────────────────────────────────────────

    pub fn create_semaphore(&mut self, device: BoxedHandle) -> VkResult<BoxedHandle> {
        self.create_child(ObjectType::Semaphore, device, None, NodeInfo::Semaphore, |driver, dev| {
            driver.create_semaphore(dev)
        })
    }

    pub fn destroy_semaphore(&mut self, device: BoxedHandle, semaphore: BoxedHandle) {
        self.destroy_child(ObjectType::Semaphore, device, semaphore, |driver, dev, s: vk::Semaphore| {
            driver.destroy_semaphore(dev, s)
        });
    }

    pub fn create_fence(&mut self, device: BoxedHandle, signaled: bool) -> VkResult<BoxedHandle> {
        self.create_child(
            ObjectType::Fence,
            device,
            None,
            NodeInfo::Fence { signaled },
            |driver, dev| driver.create_fence(dev, signaled),
        )
    }

    pub fn destroy_fence(&mut self, device: BoxedHandle, fence: BoxedHandle) {
        self.destroy_child(ObjectType::Fence, device, fence, |driver, dev, f: vk::Fence| {
            driver.destroy_fence(dev, f)
        });
    }

    pub fn reset_fences(&mut self, device: BoxedHandle, fences: &[BoxedHandle]) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: Vec<vk::Fence> = self.unbox_all(ObjectType::Fence, fences)?;
        self.drain_lane(device);
        self.driver().reset_fences(dev, &raw)?;
        for fence in fences {
            self.set_fence_signaled(*fence, false);
        }
        Ok(())
    }

    pub fn get_fence_status(&self, device: BoxedHandle, fence: BoxedHandle) -> VkResult<bool> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: vk::Fence = self.unbox(ObjectType::Fence, fence)?;
        self.driver().get_fence_status(dev, raw)
    }

    /// The driver's view of a fence, or `recorded` when it cannot be read.
    pub(crate) fn current_fence_state(&self, fence: BoxedHandle, recorded: bool) -> bool {
        match self
            .owning_device(fence)
            .and_then(|device| self.get_fence_status(device, fence))
        {
            Ok(signaled) => signaled,
            Err(e) => {
                warn!(?fence, ?e, "fence status unavailable, keeping recorded state");
                recorded
            }
        }
    }

    fn set_fence_signaled(&mut self, fence: BoxedHandle, value: bool) {
        if let Some(NodeInfo::Fence { signaled }) = self.inner.graph.get_mut(fence).map(|n| &mut n.info) {
            *signaled = value;
        }
    }

    fn guest_requirements(
        &self,
        device: BoxedHandle,
        mut requirements: vk::MemoryRequirements,
    ) -> vk::MemoryRequirements {
        let map = self.memory_type_map(device);
        requirements.memory_type_bits = map.guest_bits(requirements.memory_type_bits);
        requirements
    }
}

impl DecoderState {
    /// Handles are unboxed under the lock and the wait happens without it,
    /// so a guest blocked on a fence does not stall other decoders.
    pub fn wait_for_fences(
        &self,
        device: BoxedHandle,
        fences: &[BoxedHandle],
        wait_all: bool,
        timeout_ns: u64,
    ) -> VkResult<()> {
        let (dev, raw, queued) = {
            let state = self.lock();
            let dev: vk::Device = state.unbox(ObjectType::Device, device)?;
            let raw: Vec<vk::Fence> = state.unbox_all(ObjectType::Fence, fences)?;
            (dev, raw, state.lane_drain_marker(device))
        };
        if let Some(done) = queued {
            // A closed lane has nothing left to run.
            let _ = done.recv();
        }
        self.driver().wait_for_fences(dev, &raw, wait_all, timeout_ns)
    }
}
