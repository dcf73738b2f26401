use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use vkhost_protocol::handle::{BoxedHandle, ObjectType};
use vkhost_protocol::vulkan_commands::{
    BufferCreateInfo, CommandPoolCreateInfo, DescriptorPoolCreateInfo,
    DescriptorSetLayoutCreateInfo, DescriptorUpdateTemplateCreateInfo, DeviceCreateInfo,
    ImageCreateInfo, ImageViewCreateInfo, InstanceCreateInfo, RenderPassCreateInfo,
    SamplerCreateInfo,
};

/// A mapped sub-range of a memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedRange {
    pub offset: u64,
    pub size: u64,
}

/// Memory a buffer or image is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBinding {
    pub memory: BoxedHandle,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub size: u64,
    /// Guest-relative type index the allocation was requested with
    pub memory_type_index: u32,
    pub host_type_index: u32,
    pub mapped: Option<MappedRange>,
    /// Whether the guest sees the driver's own pointer
    pub direct: bool,
    pub color_buffer: Option<u32>,
}

/// Host-only metadata kept for every live object, one variant per type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeInfo {
    Instance {
        create_info: InstanceCreateInfo,
    },
    PhysicalDevice {
        index: u32,
    },
    Device {
        create_info: DeviceCreateInfo,
        /// Instance the device was created under, kept so the device can be
        /// re-created after that instance is gone.
        instance_info: InstanceCreateInfo,
        physical_device_index: u32,
    },
    Queue {
        family_index: u32,
        queue_index: u32,
    },
    DeviceMemory(MemoryInfo),
    Buffer {
        create_info: BufferCreateInfo,
        binding: Option<MemoryBinding>,
        color_buffer: Option<u32>,
    },
    Image {
        create_info: ImageCreateInfo,
        binding: Option<MemoryBinding>,
        color_buffer: Option<u32>,
    },
    ImageView {
        create_info: ImageViewCreateInfo,
    },
    Sampler {
        create_info: SamplerCreateInfo,
    },
    DescriptorSetLayout {
        create_info: DescriptorSetLayoutCreateInfo,
    },
    DescriptorPool {
        create_info: DescriptorPoolCreateInfo,
    },
    DescriptorSet {
        layout: BoxedHandle,
        /// Copy of the layout so the set can be re-created without it
        layout_info: DescriptorSetLayoutCreateInfo,
    },
    DescriptorUpdateTemplate {
        create_info: DescriptorUpdateTemplateCreateInfo,
    },
    RenderPass {
        create_info: RenderPassCreateInfo,
    },
    CommandPool {
        create_info: CommandPoolCreateInfo,
    },
    CommandBuffer {
        level: i32,
    },
    Semaphore,
    Fence {
        signaled: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectNode {
    pub handle: BoxedHandle,
    pub object_type: ObjectType,
    pub parent: Option<BoxedHandle>,
    pub children: BTreeSet<BoxedHandle>,
    /// Creation order
    pub seq: u64,
    pub info: NodeInfo,
}

/// Shadow tree of every live driver object. Parent links are plain handles;
/// children may outlive their parent.
#[derive(Debug, Default)]
pub struct ObjectGraph {
    nodes: HashMap<BoxedHandle, ObjectNode>,
    next_seq: u64,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        handle: BoxedHandle,
        object_type: ObjectType,
        parent: Option<BoxedHandle>,
        info: NodeInfo,
    ) {
        let parent = match parent {
            Some(p) if self.nodes.contains_key(&p) => Some(p),
            Some(p) => {
                warn!(?handle, parent = ?p, "parent not tracked, inserting as root");
                None
            }
            None => None,
        };
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children.insert(handle);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.nodes.insert(
            handle,
            ObjectNode {
                handle,
                object_type,
                parent,
                children: BTreeSet::new(),
                seq,
                info,
            },
        );
    }

    /// Remove one node. Its children are re-attached to its parent (or become
    /// roots).
    pub fn remove(&mut self, handle: BoxedHandle) -> Option<ObjectNode> {
        let node = self.nodes.remove(&handle)?;
        let parent = node.parent.filter(|p| self.nodes.contains_key(p));
        if let Some(p) = parent.and_then(|p| self.nodes.get_mut(&p)) {
            p.children.remove(&handle);
            p.children.extend(node.children.iter().copied());
        }
        for child in &node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.parent = parent;
            }
        }
        Some(node)
    }

    /// Every descendant of `handle`, deepest first. `handle` itself excluded.
    pub fn descendants(&self, handle: BoxedHandle) -> Vec<BoxedHandle> {
        let mut out = Vec::new();
        self.collect_descendants(handle, &mut out);
        out
    }

    fn collect_descendants(&self, handle: BoxedHandle, out: &mut Vec<BoxedHandle>) {
        if let Some(node) = self.nodes.get(&handle) {
            for child in &node.children {
                self.collect_descendants(*child, out);
                out.push(*child);
            }
        }
    }

    pub fn get(&self, handle: BoxedHandle) -> Option<&ObjectNode> {
        self.nodes.get(&handle)
    }

    pub fn get_mut(&mut self, handle: BoxedHandle) -> Option<&mut ObjectNode> {
        self.nodes.get_mut(&handle)
    }

    pub fn contains(&self, handle: BoxedHandle) -> bool {
        self.nodes.contains_key(&handle)
    }

    pub fn parent(&self, handle: BoxedHandle) -> Option<BoxedHandle> {
        self.nodes.get(&handle).and_then(|n| n.parent)
    }

    /// Direct children of the given type.
    pub fn children_of_type(&self, handle: BoxedHandle, object_type: ObjectType) -> Vec<BoxedHandle> {
        self.nodes
            .get(&handle)
            .map(|n| {
                n.children
                    .iter()
                    .copied()
                    .filter(|c| self.nodes.get(c).map(|c| c.object_type) == Some(object_type))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Nearest ancestor (or self) of the given type.
    pub fn ancestor_of_type(&self, handle: BoxedHandle, object_type: ObjectType) -> Option<BoxedHandle> {
        let mut cursor = Some(handle);
        while let Some(h) = cursor {
            let node = self.nodes.get(&h)?;
            if node.object_type == object_type {
                return Some(h);
            }
            cursor = node.parent;
        }
        None
    }

    /// Nodes sorted by creation order (parents before children).
    pub fn in_creation_order(&self) -> Vec<&ObjectNode> {
        let mut nodes: Vec<&ObjectNode> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes
    }

    /// Drop every buffer and image binding to `memory`. Returns how many
    /// were cleared.
    pub fn clear_bindings_to(&mut self, memory: BoxedHandle) -> usize {
        let mut cleared = 0;
        for node in self.nodes.values_mut() {
            let binding = match &mut node.info {
                NodeInfo::Buffer { binding, .. } | NodeInfo::Image { binding, .. } => binding,
                _ => continue,
            };
            if binding.is_some_and(|b| b.memory == memory) {
                *binding = None;
                cleared += 1;
            }
        }
        cleared
    }

    pub fn handles(&self) -> BTreeSet<BoxedHandle> {
        self.nodes.keys().copied().collect()
    }

    pub fn count_of_type(&self, object_type: ObjectType) -> usize {
        self.nodes
            .values()
            .filter(|n| n.object_type == object_type)
            .count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}
