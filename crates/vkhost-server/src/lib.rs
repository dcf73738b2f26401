pub mod driver;
pub mod executor;
pub mod host_sync;
pub mod object_graph;
pub mod snapshot;
pub mod state;
pub mod transform;

pub use driver::{AshDriver, Driver, FakeDriver, HostPtr};
pub use executor::VulkanExecutor;
pub use snapshot::{SnapshotError, SnapshotImage};
pub use state::{DecoderState, HostFeatureSupport, StateGuard, INVALID_HANDLE};
