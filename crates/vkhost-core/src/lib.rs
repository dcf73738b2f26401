pub mod config;
pub mod error;
pub mod handle_map;

pub use config::VkHostConfig;
pub use error::CoreError;
pub use handle_map::{encode_created_handles, BoxedEntry, DispatchLevel, DispatchTable, HandleMap};
