use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Top-level host configuration, loaded from vkhost.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VkHostConfig {
    #[serde(default)]
    pub vulkan: VulkanConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Process-wide Vulkan virtualization settings. Consulted by query calls and
/// the memory path, never mutated by guest traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulkanConfig {
    /// Highest API version advertised to the guest ("major.minor")
    #[serde(default = "default_max_api_version")]
    pub max_api_version: String,
    /// Expose the driver's own mapped pointers to the guest (zero-copy).
    /// When false, mappings go through host staging copies.
    #[serde(default = "default_true")]
    pub direct_mapping: bool,
    /// Run async submission variants on per-queue worker lanes
    #[serde(default = "default_true")]
    pub deferred_commands: bool,
    /// Advertise the create-with-requirements resource calls
    #[serde(default = "default_true")]
    pub create_resources_with_requirements: bool,
    /// Expose sparse binding features to the guest
    #[serde(default)]
    pub sparse_binding: bool,
    /// Destroy the driver instance when the guest destroys its instance
    #[serde(default = "default_true")]
    pub cleanup_instances: bool,
    /// Interval between diagnostics while a host-sync wait is pending
    #[serde(default = "default_host_sync_warn_ms")]
    pub host_sync_warn_ms: u64,
    /// Device extensions the guest is allowed to see
    #[serde(default = "default_device_extensions")]
    pub device_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Whether save/load is available at all
    #[serde(default)]
    pub enabled: bool,
    /// Capture the contents of mapped host-visible allocations
    #[serde(default = "default_true")]
    pub save_memory_contents: bool,
}

impl Default for VulkanConfig {
    fn default() -> Self {
        Self {
            max_api_version: default_max_api_version(),
            direct_mapping: true,
            deferred_commands: true,
            create_resources_with_requirements: true,
            sparse_binding: false,
            cleanup_instances: true,
            host_sync_warn_ms: default_host_sync_warn_ms(),
            device_extensions: default_device_extensions(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            save_memory_contents: true,
        }
    }
}

impl VkHostConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        let config: VkHostConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!(path, "ignoring invalid config: {}", e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if parse_api_version(&self.vulkan.max_api_version).is_none() {
            return Err(CoreError::ConfigError(format!(
                "max_api_version must look like \"1.1\", got {:?}",
                self.vulkan.max_api_version
            )));
        }
        if self.vulkan.host_sync_warn_ms == 0 {
            return Err(CoreError::ConfigError(
                "host_sync_warn_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl VulkanConfig {
    /// The advertised API version cap as (major, minor).
    pub fn max_api_version(&self) -> (u32, u32) {
        parse_api_version(&self.max_api_version).unwrap_or((1, 1))
    }
}

/// Parse "major.minor" (a trailing ".patch" is accepted and ignored).
pub fn parse_api_version(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    if let Some(patch) = parts.next() {
        patch.parse::<u32>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some((major, minor))
}

fn default_max_api_version() -> String {
    "1.1".to_string()
}

fn default_host_sync_warn_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_device_extensions() -> Vec<String> {
    [
        "VK_KHR_maintenance1",
        "VK_KHR_maintenance2",
        "VK_KHR_maintenance3",
        "VK_KHR_get_memory_requirements2",
        "VK_KHR_dedicated_allocation",
        "VK_KHR_bind_memory2",
        "VK_KHR_sampler_ycbcr_conversion",
        "VK_KHR_descriptor_update_template",
        "VK_KHR_storage_buffer_storage_class",
        "VK_KHR_external_memory",
        "VK_KHR_external_memory_fd",
        "VK_KHR_external_semaphore",
        "VK_KHR_external_semaphore_fd",
        "VK_KHR_shader_float16_int8",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
