use ash::vk;

use crate::driver::{MemoryProperties, MemoryType};

/// Memory types never advertised to the guest.
const HIDDEN_MEMORY_FLAGS: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::from_raw(
    vk::MemoryPropertyFlags::PROTECTED.as_raw()
        | vk::MemoryPropertyFlags::LAZILY_ALLOCATED.as_raw(),
);

/// Translation between the guest's memory-type table (host table minus
/// hidden types) and the host's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTypeMap {
    guest_to_host: Vec<u32>,
    host_to_guest: Vec<Option<u32>>,
}

impl MemoryTypeMap {
    pub fn from_properties(props: &MemoryProperties) -> Self {
        let mut guest_to_host = Vec::new();
        let mut host_to_guest = Vec::with_capacity(props.types.len());
        for (host_index, ty) in props.types.iter().enumerate() {
            if ty.property_flags.intersects(HIDDEN_MEMORY_FLAGS) {
                host_to_guest.push(None);
            } else {
                host_to_guest.push(Some(guest_to_host.len() as u32));
                guest_to_host.push(host_index as u32);
            }
        }
        Self {
            guest_to_host,
            host_to_guest,
        }
    }

    /// Pass-through map used before any physical device was queried.
    pub fn identity(count: u32) -> Self {
        Self {
            guest_to_host: (0..count).collect(),
            host_to_guest: (0..count).map(Some).collect(),
        }
    }

    pub fn guest_type_count(&self) -> usize {
        self.guest_to_host.len()
    }

    pub fn host_index(&self, guest_index: u32) -> Option<u32> {
        self.guest_to_host.get(guest_index as usize).copied()
    }

    pub fn guest_index(&self, host_index: u32) -> Option<u32> {
        self.host_to_guest.get(host_index as usize).copied().flatten()
    }

    pub fn host_bits(&self, guest_bits: u32) -> u32 {
        self.guest_to_host
            .iter()
            .enumerate()
            .filter(|(guest, _)| guest_bits & (1 << guest) != 0)
            .fold(0, |acc, (_, host)| acc | (1 << host))
    }

    pub fn guest_bits(&self, host_bits: u32) -> u32 {
        self.host_to_guest
            .iter()
            .enumerate()
            .filter(|(host, _)| host_bits & (1 << host) != 0)
            .filter_map(|(_, guest)| *guest)
            .fold(0, |acc, guest| acc | (1 << guest))
    }

    /// The memory types the guest gets to see, in guest order.
    pub fn guest_types(&self, props: &MemoryProperties) -> Vec<MemoryType> {
        self.guest_to_host
            .iter()
            .filter_map(|host| props.types.get(*host as usize).copied())
            .collect()
    }
}

/// Clamp a packed API version to a (major, minor) cap.
pub fn clamp_api_version(version: u32, cap: (u32, u32)) -> u32 {
    let current = (vk::api_version_major(version), vk::api_version_minor(version));
    if current > cap {
        vk::make_api_version(0, cap.0, cap.1, 0)
    } else {
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryHeap;
    use proptest::prelude::*;

    fn props() -> MemoryProperties {
        let t = |flags| MemoryType {
            property_flags: flags,
            heap_index: 0,
        };
        MemoryProperties {
            types: vec![
                t(vk::MemoryPropertyFlags::DEVICE_LOCAL),
                t(vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::PROTECTED),
                t(vk::MemoryPropertyFlags::HOST_VISIBLE),
                t(vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::LAZILY_ALLOCATED),
                t(vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED),
            ],
            heaps: vec![MemoryHeap {
                size: 1 << 30,
                flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
            }],
        }
    }

    #[test]
    fn hidden_types_are_skipped() {
        let map = MemoryTypeMap::from_properties(&props());
        assert_eq!(map.guest_type_count(), 3);
        assert_eq!(map.host_index(1), Some(2));
        assert_eq!(map.host_index(2), Some(4));
        assert_eq!(map.host_index(3), None);
        assert_eq!(map.guest_index(1), None);
        assert_eq!(map.guest_index(4), Some(2));
    }

    #[test]
    fn type_bits_translate_both_ways() {
        let map = MemoryTypeMap::from_properties(&props());
        assert_eq!(map.host_bits(0b111), 0b10101);
        assert_eq!(map.guest_bits(0b11111), 0b111);
        assert_eq!(map.guest_bits(map.host_bits(0b101)), 0b101);
    }

    #[test]
    fn api_version_is_clamped_to_cap() {
        let v13 = vk::make_api_version(0, 1, 3, 250);
        assert_eq!(clamp_api_version(v13, (1, 1)), vk::make_api_version(0, 1, 1, 0));
        let v10 = vk::make_api_version(0, 1, 0, 61);
        assert_eq!(clamp_api_version(v10, (1, 1)), v10);
    }

    proptest! {
        #[test]
        fn guest_bits_survive_a_round_trip(bits in any::<u32>()) {
            let map = MemoryTypeMap::from_properties(&props());
            let visible = (1u32 << map.guest_type_count()) - 1;
            prop_assert_eq!(map.guest_bits(map.host_bits(bits)), bits & visible);
        }

        #[test]
        fn hidden_types_never_reach_the_host(bits in any::<u32>()) {
            let map = MemoryTypeMap::from_properties(&props());
            // Host types 1 and 3 are protected and lazily allocated.
            prop_assert_eq!(map.host_bits(bits) & 0b1010, 0);
        }
    }
}
