use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use tracing::{debug, warn};

use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::{
    DescriptorBufferInfo, DescriptorImageInfo, DescriptorPoolCreateInfo,
    DescriptorSetLayoutCreateInfo, DescriptorUpdateTemplateCreateInfo, WriteDescriptorSet,
};

use super::{StateGuard, INVALID_HANDLE};
use crate::driver::DescriptorWrite;
use crate::object_graph::NodeInfo;

/// What a descriptor of a given type reads from the guest's update data.
enum DescriptorPayload {
    Image,
    Buffer,
    Unsupported,
}

fn payload_of(descriptor_type: vk::DescriptorType) -> DescriptorPayload {
    match descriptor_type {
        vk::DescriptorType::SAMPLER
        | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        | vk::DescriptorType::SAMPLED_IMAGE
        | vk::DescriptorType::STORAGE_IMAGE
        | vk::DescriptorType::INPUT_ATTACHMENT => DescriptorPayload::Image,
        vk::DescriptorType::UNIFORM_BUFFER
        | vk::DescriptorType::STORAGE_BUFFER
        | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => DescriptorPayload::Buffer,
        _ => DescriptorPayload::Unsupported,
    }
}

impl StateGuard<'_> {
    // ── Layouts ─────────────────────────────────────────────

    pub fn create_descriptor_set_layout(
        &mut self,
        device: BoxedHandle,
        info: &DescriptorSetLayoutCreateInfo,
    ) -> VkResult<BoxedHandle> {
        self.create_child(
            ObjectType::DescriptorSetLayout,
            device,
            None,
            NodeInfo::DescriptorSetLayout {
                create_info: info.clone(),
            },
            |driver, dev| driver.create_descriptor_set_layout(dev, info),
        )
    }

    pub fn destroy_descriptor_set_layout(&mut self, device: BoxedHandle, layout: BoxedHandle) {
        self.destroy_child(
            ObjectType::DescriptorSetLayout,
            device,
            layout,
            |driver, dev, l: vk::DescriptorSetLayout| driver.destroy_descriptor_set_layout(dev, l),
        );
    }

    // ── Pools ───────────────────────────────────────────────

    pub fn create_descriptor_pool(
        &mut self,
        device: BoxedHandle,
        info: &DescriptorPoolCreateInfo,
    ) -> VkResult<BoxedHandle> {
        self.create_child(
            ObjectType::DescriptorPool,
            device,
            None,
            NodeInfo::DescriptorPool {
                create_info: info.clone(),
            },
            |driver, dev| driver.create_descriptor_pool(dev, info),
        )
    }

    /// Sets allocated from the pool die with it; the driver frees them.
    pub fn destroy_descriptor_pool(&mut self, device: BoxedHandle, pool: BoxedHandle) {
        if self.inner.handles.contains(pool) {
            let sets = self.forget_descendants(pool);
            debug!(?pool, sets, "released descriptor sets with pool");
        }
        self.destroy_child(
            ObjectType::DescriptorPool,
            device,
            pool,
            |driver, dev, p: vk::DescriptorPool| driver.destroy_descriptor_pool(dev, p),
        );
    }

    pub fn reset_descriptor_pool(&mut self, device: BoxedHandle, pool: BoxedHandle, _flags: u32) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw: vk::DescriptorPool = self.unbox(ObjectType::DescriptorPool, pool)?;
        self.driver().reset_descriptor_pool(dev, raw)?;
        let sets = self.forget_descendants(pool);
        debug!(?pool, sets, "descriptor pool reset");
        Ok(())
    }

    // ── Sets ────────────────────────────────────────────────

    pub fn allocate_descriptor_sets(
        &mut self,
        device: BoxedHandle,
        pool: BoxedHandle,
        layouts: &[BoxedHandle],
    ) -> VkResult<Vec<BoxedHandle>> {
        let mut resolved = Vec::with_capacity(layouts.len());
        for layout in layouts {
            let raw: vk::DescriptorSetLayout = self.unbox(ObjectType::DescriptorSetLayout, *layout)?;
            let info = match self.inner.graph.get(*layout).map(|n| &n.info) {
                Some(NodeInfo::DescriptorSetLayout { create_info }) => create_info.clone(),
                _ => return Err(INVALID_HANDLE),
            };
            resolved.push((raw, *layout, info));
        }
        self.allocate_descriptor_sets_resolved(device, pool, resolved)
    }

    /// Allocate with already-unboxed layouts. Each entry carries the boxed
    /// layout and its create info for the set's record.
    pub(crate) fn allocate_descriptor_sets_resolved(
        &mut self,
        device: BoxedHandle,
        pool: BoxedHandle,
        layouts: Vec<(vk::DescriptorSetLayout, BoxedHandle, DescriptorSetLayoutCreateInfo)>,
    ) -> VkResult<Vec<BoxedHandle>> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw_pool: vk::DescriptorPool = self.unbox(ObjectType::DescriptorPool, pool)?;
        let raw_layouts: Vec<vk::DescriptorSetLayout> = layouts.iter().map(|l| l.0).collect();
        let sets = self
            .driver()
            .allocate_descriptor_sets(dev, raw_pool, &raw_layouts)?;

        let boxed = sets
            .into_iter()
            .zip(layouts)
            .map(|(set, (_, layout, layout_info))| {
                self.box_object(
                    ObjectType::DescriptorSet,
                    set.as_raw(),
                    Some(pool),
                    NodeInfo::DescriptorSet {
                        layout,
                        layout_info,
                    },
                )
            })
            .collect::<Vec<_>>();
        debug!(?pool, count = boxed.len(), "descriptor sets allocated");
        Ok(boxed)
    }

    pub fn free_descriptor_sets(
        &mut self,
        device: BoxedHandle,
        pool: BoxedHandle,
        sets: &[BoxedHandle],
    ) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw_pool: vk::DescriptorPool = self.unbox(ObjectType::DescriptorPool, pool)?;
        let live: Vec<BoxedHandle> = sets.iter().copied().filter(|s| !s.is_null()).collect();
        let raw: Vec<vk::DescriptorSet> = self.unbox_all(ObjectType::DescriptorSet, &live)?;
        self.driver().free_descriptor_sets(dev, raw_pool, &raw)?;
        for set in live {
            self.forget_object(set);
        }
        Ok(())
    }

    pub fn update_descriptor_sets(&mut self, device: BoxedHandle, writes: &[WriteDescriptorSet]) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let resolved = writes
            .iter()
            .map(|w| {
                Ok(DescriptorWrite {
                    dst_set: self.unbox(ObjectType::DescriptorSet, w.dst_set)?,
                    dst_binding: w.dst_binding,
                    dst_array_element: w.dst_array_element,
                    descriptor_type: vk::DescriptorType::from_raw(w.descriptor_type),
                    image_infos: self.resolve_image_infos(&w.image_infos)?,
                    buffer_infos: self.resolve_buffer_infos(&w.buffer_infos)?,
                })
            })
            .collect::<VkResult<Vec<_>>>()?;
        self.driver().update_descriptor_sets(dev, &resolved);
        Ok(())
    }

    // ── Update Templates ────────────────────────────────────

    pub fn create_descriptor_update_template(
        &mut self,
        device: BoxedHandle,
        info: &DescriptorUpdateTemplateCreateInfo,
    ) -> VkResult<BoxedHandle> {
        let layout: vk::DescriptorSetLayout =
            self.unbox_optional(ObjectType::DescriptorSetLayout, info.descriptor_set_layout)?;
        self.create_child(
            ObjectType::DescriptorUpdateTemplate,
            device,
            None,
            NodeInfo::DescriptorUpdateTemplate {
                create_info: info.clone(),
            },
            |driver, dev| driver.create_descriptor_update_template(dev, layout, info),
        )
    }

    pub fn destroy_descriptor_update_template(&mut self, device: BoxedHandle, template: BoxedHandle) {
        self.destroy_child(
            ObjectType::DescriptorUpdateTemplate,
            device,
            template,
            |driver, dev, t: vk::DescriptorUpdateTemplate| {
                driver.destroy_descriptor_update_template(dev, t)
            },
        );
    }

    /// Expand a template update into plain writes. Image and buffer infos are
    /// consumed in entry order, `descriptor_count` at a time.
    pub fn update_descriptor_set_with_template(
        &mut self,
        device: BoxedHandle,
        set: BoxedHandle,
        template: BoxedHandle,
        image_infos: &[DescriptorImageInfo],
        buffer_infos: &[DescriptorBufferInfo],
    ) -> VkResult<()> {
        let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
        let raw_set: vk::DescriptorSet = self.unbox(ObjectType::DescriptorSet, set)?;
        self.unbox::<vk::DescriptorUpdateTemplate>(ObjectType::DescriptorUpdateTemplate, template)?;
        let entries = match self.inner.graph.get(template).map(|n| &n.info) {
            Some(NodeInfo::DescriptorUpdateTemplate { create_info }) => create_info.entries.clone(),
            _ => return Err(INVALID_HANDLE),
        };

        let mut images = image_infos.iter();
        let mut buffers = buffer_infos.iter();
        let mut writes = Vec::with_capacity(entries.len());
        for entry in &entries {
            let descriptor_type = vk::DescriptorType::from_raw(entry.descriptor_type);
            let count = entry.descriptor_count as usize;
            let mut write = DescriptorWrite {
                dst_set: raw_set,
                dst_binding: entry.dst_binding,
                dst_array_element: entry.dst_array_element,
                descriptor_type,
                image_infos: Vec::new(),
                buffer_infos: Vec::new(),
            };
            match payload_of(descriptor_type) {
                DescriptorPayload::Image => {
                    let infos: Vec<DescriptorImageInfo> = images.by_ref().take(count).cloned().collect();
                    write.image_infos = self.resolve_image_infos(&infos)?;
                    if write.image_infos.len() < count {
                        warn!(binding = entry.dst_binding, "template update short of image infos");
                    }
                }
                DescriptorPayload::Buffer => {
                    let infos: Vec<DescriptorBufferInfo> = buffers.by_ref().take(count).cloned().collect();
                    write.buffer_infos = self.resolve_buffer_infos(&infos)?;
                    if write.buffer_infos.len() < count {
                        warn!(binding = entry.dst_binding, "template update short of buffer infos");
                    }
                }
                DescriptorPayload::Unsupported => {
                    warn!(?descriptor_type, "skipping template entry with unsupported descriptor type");
                    continue;
                }
            }
            if !write.image_infos.is_empty() || !write.buffer_infos.is_empty() {
                writes.push(write);
            }
        }
        self.driver().update_descriptor_sets(dev, &writes);
        Ok(())
    }

    fn resolve_image_infos(&self, infos: &[DescriptorImageInfo]) -> VkResult<Vec<vk::DescriptorImageInfo>> {
        infos
            .iter()
            .map(|info| {
                Ok(vk::DescriptorImageInfo {
                    sampler: self.unbox_optional(ObjectType::Sampler, info.sampler)?,
                    image_view: self.unbox_optional(ObjectType::ImageView, info.image_view)?,
                    image_layout: vk::ImageLayout::from_raw(info.image_layout),
                })
            })
            .collect()
    }

    fn resolve_buffer_infos(&self, infos: &[DescriptorBufferInfo]) -> VkResult<Vec<vk::DescriptorBufferInfo>> {
        infos
            .iter()
            .map(|info| {
                Ok(vk::DescriptorBufferInfo {
                    buffer: self.unbox_optional(ObjectType::Buffer, info.buffer)?,
                    offset: info.offset,
                    range: info.range,
                })
            })
            .collect()
    }
}
