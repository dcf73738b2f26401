//! Save and restore of the full decoder state.
//!
//! A snapshot is the object graph in creation order plus the indirection
//! table. Restore replays each record's creation call; the caller first
//! reserves the recorded boxed handles (see [`SnapshotImage::created_handles`])
//! so the replayed objects get exactly the handles the guest still holds.
//!
//! Wire format: 4-byte magic, little-endian u32 version, then the bincode
//! encoded [`SnapshotImage`].

use std::io::{Read, Write};

use ash::vk;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::{DescriptorSetLayoutCreateInfo, MemoryAllocateInfo};

use crate::object_graph::NodeInfo;
use crate::state::StateGuard;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"VKHS";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshots are disabled")]
    Disabled,

    #[error("snapshot load needs an empty decoder state, found {live} live objects")]
    StateNotEmpty { live: usize },

    #[error("invalid snapshot magic")]
    InvalidMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("not enough reserved handles: need {needed}, have {available}")]
    InsufficientHandles { needed: usize, available: usize },

    #[error("restored {object_type:?} got handle {actual:?}, expected {expected:?}")]
    HandleMismatch {
        expected: BoxedHandle,
        actual: BoxedHandle,
        object_type: ObjectType,
    },

    #[error("driver error during restore: {0:?}")]
    Driver(vk::Result),

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

impl From<vk::Result> for SnapshotError {
    fn from(result: vk::Result) -> Self {
        SnapshotError::Driver(result)
    }
}

/// One object-graph node as captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub handle: BoxedHandle,
    pub object_type: ObjectType,
    pub parent: Option<BoxedHandle>,
    pub info: NodeInfo,
    /// Bytes of a mapped allocation at save time
    pub mapped_contents: Option<Vec<u8>>,
}

/// One indirection-table entry as captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub handle: BoxedHandle,
    pub object_type: ObjectType,
    pub owns_dispatch: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotImage {
    /// Parents before children
    pub records: Vec<NodeRecord>,
    pub table: Vec<TableEntry>,
}

impl SnapshotImage {
    /// Boxed handles in the order restore re-creates them.
    pub fn created_handles(&self) -> Vec<BoxedHandle> {
        self.records.iter().map(|r| r.handle).collect()
    }
}

pub fn write_snapshot<W: Write>(writer: &mut W, image: &SnapshotImage) -> Result<(), SnapshotError> {
    writer.write_all(&SNAPSHOT_MAGIC)?;
    writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;
    bincode::serialize_into(&mut *writer, image)?;
    writer.flush()?;
    Ok(())
}

pub fn read_snapshot<R: Read>(reader: &mut R) -> Result<SnapshotImage, SnapshotError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(SnapshotError::InvalidMagic);
    }
    let mut version = [0u8; 4];
    reader.read_exact(&mut version)?;
    let version = u32::from_le_bytes(version);
    if version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }
    Ok(bincode::deserialize_from(reader)?)
}

impl StateGuard<'_> {
    /// Capture the current state.
    pub fn snapshot_capture(&self) -> Result<SnapshotImage, SnapshotError> {
        if !self.decoder().snapshots_enabled() {
            return Err(SnapshotError::Disabled);
        }
        let save_contents = self.decoder().config().snapshot.save_memory_contents;
        // Fences signal from queued work, so settle it before reading them.
        self.drain_all_lanes();
        let records = self
            .graph()
            .in_creation_order()
            .into_iter()
            .map(|node| NodeRecord {
                handle: node.handle,
                object_type: node.object_type,
                parent: node.parent,
                info: match node.info {
                    NodeInfo::Fence { signaled } => NodeInfo::Fence {
                        signaled: self.current_fence_state(node.handle, signaled),
                    },
                    ref info => info.clone(),
                },
                mapped_contents: if save_contents {
                    self.mapped_contents(node.handle)
                } else {
                    None
                },
            })
            .collect::<Vec<_>>();
        let table = self
            .handle_map()
            .iter()
            .map(|(handle, object_type, entry)| TableEntry {
                handle,
                object_type,
                owns_dispatch: entry.owns_dispatch(),
            })
            .collect();
        Ok(SnapshotImage { records, table })
    }

    pub fn snapshot_save<W: Write>(&self, writer: &mut W) -> Result<(), SnapshotError> {
        let image = self.snapshot_capture()?;
        write_snapshot(writer, &image)?;
        info!(objects = image.records.len(), "snapshot saved");
        Ok(())
    }

    pub fn snapshot_load<R: Read>(&mut self, reader: &mut R) -> Result<(), SnapshotError> {
        if !self.decoder().snapshots_enabled() {
            return Err(SnapshotError::Disabled);
        }
        let image = read_snapshot(reader)?;
        self.snapshot_load_image(&image)
    }

    /// Replay a captured state into an empty decoder. Handles must have been
    /// reserved first. On failure everything restored so far is destroyed.
    pub fn snapshot_load_image(&mut self, image: &SnapshotImage) -> Result<(), SnapshotError> {
        if !self.decoder().snapshots_enabled() {
            return Err(SnapshotError::Disabled);
        }
        if !self.graph().is_empty() || !self.handle_map().is_empty() {
            return Err(SnapshotError::StateNotEmpty {
                live: self.handle_map().len(),
            });
        }
        let available = self.handle_map().reserved_remaining();
        if available < image.records.len() {
            return Err(SnapshotError::InsufficientHandles {
                needed: image.records.len(),
                available,
            });
        }

        match self.restore(image) {
            Ok(()) => {
                self.clear_created_handles_for_snapshot_load();
                info!(objects = image.records.len(), "snapshot restored");
                Ok(())
            }
            Err(e) => {
                warn!("snapshot restore failed, rolling back: {}", e);
                self.teardown_all();
                Err(e)
            }
        }
    }

    fn restore(&mut self, image: &SnapshotImage) -> Result<(), SnapshotError> {
        for record in &image.records {
            self.restore_record(record)?;
        }
        for record in &image.records {
            self.restore_bindings(record)?;
        }
        self.verify_table(image)
    }

    fn restore_record(&mut self, record: &NodeRecord) -> Result<(), SnapshotError> {
        let restored = match &record.info {
            NodeInfo::Instance { create_info } => self.create_instance(create_info)?,
            NodeInfo::PhysicalDevice { .. } => {
                if !self.handle_map().contains(record.handle) {
                    self.enumerate_physical_devices(parent_of(record)?)?;
                }
                record.handle
            }
            NodeInfo::Device {
                create_info,
                instance_info,
                physical_device_index,
            } => match record.parent {
                Some(pd) => self.create_device(pd, create_info)?,
                None => self.create_detached_device(instance_info, *physical_device_index, create_info)?,
            },
            NodeInfo::Queue {
                family_index,
                queue_index,
            } => self.get_device_queue(parent_of(record)?, *family_index, *queue_index)?,
            NodeInfo::DeviceMemory(memory) => {
                let device = self.record_device(record)?;
                self.allocate_memory(
                    device,
                    &MemoryAllocateInfo {
                        allocation_size: memory.size,
                        memory_type_index: memory.memory_type_index,
                        import_color_buffer: memory.color_buffer,
                    },
                )?
            }
            NodeInfo::Buffer {
                create_info,
                color_buffer,
                ..
            } => {
                let device = self.record_device(record)?;
                let buffer = self.create_buffer(device, create_info)?;
                if let Some(cb) = color_buffer {
                    self.register_buffer_color_buffer(buffer, *cb)?;
                }
                buffer
            }
            NodeInfo::Image {
                create_info,
                color_buffer,
                ..
            } => {
                let device = self.record_device(record)?;
                let image = self.create_image(device, create_info)?;
                if let Some(cb) = color_buffer {
                    self.register_image_color_buffer(image, *cb)?;
                }
                image
            }
            NodeInfo::ImageView { create_info } => {
                let device = self.record_device(record)?;
                self.create_image_view(device, create_info)?
            }
            NodeInfo::Sampler { create_info } => {
                let device = self.record_device(record)?;
                self.create_sampler(device, create_info)?
            }
            NodeInfo::DescriptorSetLayout { create_info } => {
                let device = self.record_device(record)?;
                self.create_descriptor_set_layout(device, create_info)?
            }
            NodeInfo::DescriptorPool { create_info } => {
                let device = self.record_device(record)?;
                self.create_descriptor_pool(device, create_info)?
            }
            NodeInfo::DescriptorSet {
                layout,
                layout_info,
            } => {
                let device = self.record_device(record)?;
                self.restore_descriptor_set(device, parent_of(record)?, *layout, layout_info)?
            }
            NodeInfo::DescriptorUpdateTemplate { create_info } => {
                let device = self.record_device(record)?;
                self.create_descriptor_update_template(device, create_info)?
            }
            NodeInfo::RenderPass { create_info } => {
                let device = self.record_device(record)?;
                self.create_render_pass(device, create_info)?
            }
            NodeInfo::CommandPool { create_info } => {
                let device = self.record_device(record)?;
                self.create_command_pool(device, create_info)?
            }
            NodeInfo::CommandBuffer { level } => {
                let device = self.record_device(record)?;
                self.allocate_command_buffers(device, parent_of(record)?, *level, 1)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| SnapshotError::Corrupt("empty command buffer allocation".into()))?
            }
            NodeInfo::Semaphore => {
                let device = self.record_device(record)?;
                self.create_semaphore(device)?
            }
            NodeInfo::Fence { signaled } => {
                let device = self.record_device(record)?;
                self.create_fence(device, *signaled)?
            }
        };

        let type_matches = self
            .handle_map()
            .entry(record.handle)
            .map(|(ty, _)| ty == record.object_type)
            .unwrap_or(false);
        if restored != record.handle || !type_matches {
            return Err(SnapshotError::HandleMismatch {
                expected: record.handle,
                actual: restored,
                object_type: record.object_type,
            });
        }
        debug!(handle = ?record.handle, "restored {:?}", record.object_type);
        Ok(())
    }

    /// Memory bindings and mappings, once every object exists again.
    fn restore_bindings(&mut self, record: &NodeRecord) -> Result<(), SnapshotError> {
        match &record.info {
            NodeInfo::Buffer {
                binding: Some(binding),
                ..
            }
            | NodeInfo::Image {
                binding: Some(binding),
                ..
            } if !self.graph().contains(binding.memory) => {
                warn!(handle = ?record.handle, memory = ?binding.memory, "binding to freed memory dropped");
            }
            NodeInfo::Buffer {
                binding: Some(binding),
                ..
            } => {
                let device = self.record_device(record)?;
                self.bind_buffer_memory(device, record.handle, binding.memory, binding.offset)?;
            }
            NodeInfo::Image {
                binding: Some(binding),
                ..
            } => {
                let device = self.record_device(record)?;
                self.bind_image_memory(device, record.handle, binding.memory, binding.offset)?;
            }
            NodeInfo::DeviceMemory(memory) => {
                if let Some(range) = memory.mapped {
                    let device = self.record_device(record)?;
                    self.map_memory(device, record.handle, range.offset, range.size, 0)?;
                    if let Some(contents) = &record.mapped_contents {
                        self.write_mapped_contents(record.handle, contents)?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Re-create a set. A layout the guest already destroyed is stood in for
    /// by a temporary, unboxed one built from the recorded layout info.
    fn restore_descriptor_set(
        &mut self,
        device: BoxedHandle,
        pool: BoxedHandle,
        layout: BoxedHandle,
        layout_info: &DescriptorSetLayoutCreateInfo,
    ) -> Result<BoxedHandle, SnapshotError> {
        let sets = if self.handle_map().contains(layout) {
            self.allocate_descriptor_sets(device, pool, &[layout])?
        } else {
            let dev: vk::Device = self.unbox(ObjectType::Device, device)?;
            let driver = self.decoder().driver().clone();
            let temporary = driver.create_descriptor_set_layout(dev, layout_info)?;
            let result =
                self.allocate_descriptor_sets_resolved(device, pool, vec![(temporary, layout, layout_info.clone())]);
            driver.destroy_descriptor_set_layout(dev, temporary);
            result?
        };
        sets.into_iter()
            .next()
            .ok_or_else(|| SnapshotError::Corrupt("empty descriptor set allocation".into()))
    }

    fn verify_table(&self, image: &SnapshotImage) -> Result<(), SnapshotError> {
        if self.handle_map().len() != image.table.len() {
            return Err(SnapshotError::Corrupt(format!(
                "restored {} handles, snapshot lists {}",
                self.handle_map().len(),
                image.table.len()
            )));
        }
        for entry in &image.table {
            match self.handle_map().entry(entry.handle) {
                Some((ty, e)) if ty == entry.object_type && e.owns_dispatch() == entry.owns_dispatch => {}
                _ => {
                    return Err(SnapshotError::Corrupt(format!(
                        "table entry {:?} did not restore",
                        entry.handle
                    )))
                }
            }
        }
        Ok(())
    }

    fn record_device(&self, record: &NodeRecord) -> Result<BoxedHandle, SnapshotError> {
        let parent = parent_of(record)?;
        self.owning_device(parent)
            .map_err(|_| SnapshotError::Corrupt(format!("{:?} has no owning device", record.handle)))
    }

    /// Destroy every live object, newest first, and drop all reservations.
    pub(crate) fn teardown_all(&mut self) {
        let order: Vec<(BoxedHandle, ObjectType)> = self
            .graph()
            .in_creation_order()
            .into_iter()
            .rev()
            .map(|n| (n.handle, n.object_type))
            .collect();
        for (handle, object_type) in order {
            if self.graph().contains(handle) {
                self.destroy_object(handle, object_type);
            }
        }
        self.clear_created_handles_for_snapshot_load();
    }
}

fn parent_of(record: &NodeRecord) -> Result<BoxedHandle, SnapshotError> {
    record
        .parent
        .ok_or_else(|| SnapshotError::Corrupt(format!("{:?} has no parent", record.handle)))
}
