pub mod handle;
pub mod vulkan_commands;

pub use handle::{BoxedHandle, ObjectType};
pub use vulkan_commands::{VulkanCommand, VulkanResponse};
