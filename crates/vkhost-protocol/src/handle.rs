use std::fmt;

use serde::{Deserialize, Serialize};

/// Bit position of the object-type tag inside a boxed handle value.
pub const HANDLE_TAG_SHIFT: u32 = 56;

/// Mask selecting the per-process index part of a boxed handle value.
pub const HANDLE_INDEX_MASK: u64 = (1 << HANDLE_TAG_SHIFT) - 1;

/// A guest-visible handle that stands in for a real driver handle.
/// Opaque to the guest -- the host assigns these and never exposes the
/// underlying driver value.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoxedHandle(pub u64);

impl BoxedHandle {
    pub const NULL: BoxedHandle = BoxedHandle(0);

    /// Compose a handle value from a type tag and an index.
    pub fn compose(object_type: ObjectType, index: u64) -> Self {
        Self(((object_type.tag() as u64) << HANDLE_TAG_SHIFT) | (index & HANDLE_INDEX_MASK))
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn index(&self) -> u64 {
        self.0 & HANDLE_INDEX_MASK
    }

    /// The object type encoded in the handle, if the tag is a known one.
    pub fn object_type(&self) -> Option<ObjectType> {
        ObjectType::from_tag((self.0 >> HANDLE_TAG_SHIFT) as u8)
    }
}

impl fmt::Debug for BoxedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object_type() {
            Some(ty) => write!(f, "{:?}#{:#x}", ty, self.index()),
            None => write!(f, "Boxed({:#x})", self.0),
        }
    }
}

impl From<u64> for BoxedHandle {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Every driver object type the host shadows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectType {
    // Dispatchable
    Instance,
    PhysicalDevice,
    Device,
    Queue,
    CommandBuffer,

    // Non-dispatchable
    DeviceMemory,
    Buffer,
    Image,
    ImageView,
    Sampler,
    DescriptorSetLayout,
    DescriptorPool,
    DescriptorSet,
    DescriptorUpdateTemplate,
    RenderPass,
    CommandPool,
    Semaphore,
    Fence,
}

impl ObjectType {
    pub const ALL: [ObjectType; 18] = [
        ObjectType::Instance,
        ObjectType::PhysicalDevice,
        ObjectType::Device,
        ObjectType::Queue,
        ObjectType::CommandBuffer,
        ObjectType::DeviceMemory,
        ObjectType::Buffer,
        ObjectType::Image,
        ObjectType::ImageView,
        ObjectType::Sampler,
        ObjectType::DescriptorSetLayout,
        ObjectType::DescriptorPool,
        ObjectType::DescriptorSet,
        ObjectType::DescriptorUpdateTemplate,
        ObjectType::RenderPass,
        ObjectType::CommandPool,
        ObjectType::Semaphore,
        ObjectType::Fence,
    ];

    /// Whether handles of this type carry their own dispatch table.
    pub fn is_dispatchable(self) -> bool {
        matches!(
            self,
            ObjectType::Instance
                | ObjectType::PhysicalDevice
                | ObjectType::Device
                | ObjectType::Queue
                | ObjectType::CommandBuffer
        )
    }

    /// Tag stored in the top byte of a boxed handle. Zero is never used so a
    /// null handle never decodes to a valid type.
    pub fn tag(self) -> u8 {
        match self {
            ObjectType::Instance => 1,
            ObjectType::PhysicalDevice => 2,
            ObjectType::Device => 3,
            ObjectType::Queue => 4,
            ObjectType::CommandBuffer => 5,
            ObjectType::DeviceMemory => 6,
            ObjectType::Buffer => 7,
            ObjectType::Image => 8,
            ObjectType::ImageView => 9,
            ObjectType::Sampler => 10,
            ObjectType::DescriptorSetLayout => 11,
            ObjectType::DescriptorPool => 12,
            ObjectType::DescriptorSet => 13,
            ObjectType::DescriptorUpdateTemplate => 14,
            ObjectType::RenderPass => 15,
            ObjectType::CommandPool => 16,
            ObjectType::Semaphore => 17,
            ObjectType::Fence => 18,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|ty| ty.tag() == tag)
    }
}
