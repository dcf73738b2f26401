use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use ash::vk;
use clap::{Parser, Subcommand};
use tracing::info;

use vkhost_core::{encode_created_handles, VkHostConfig};
use vkhost_protocol::handle::ObjectType;
use vkhost_protocol::vulkan_commands::*;
use vkhost_server::snapshot::read_snapshot;
use vkhost_server::{AshDriver, DecoderState, Driver, FakeDriver, VulkanExecutor};

#[derive(Parser)]
#[command(name = "vkhost")]
#[command(about = "vkhost - host-side Vulkan object virtualization")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what the host driver exposes to guests after filtering
    Info {
        /// Configuration file path
        #[arg(short, long, default_value_t = vkhost_common::platform::default_config_path())]
        config: String,
    },

    /// Validate a configuration file and print the effective settings
    CheckConfig {
        /// Configuration file path
        #[arg(short, long, default_value_t = vkhost_common::platform::default_config_path())]
        config: String,
    },

    /// Summarize a saved snapshot file
    InspectSnapshot {
        /// Snapshot file
        path: String,
    },

    /// Run a create/map/snapshot/restore cycle against the built-in fake driver
    Selftest,
}

fn main() -> anyhow::Result<()> {
    vkhost_common::logging::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Info { config } => {
            let config = VkHostConfig::load_or_default(&config);
            let driver = AshDriver::load().context("failed to load the Vulkan loader")?;
            info!(platform = vkhost_common::platform::platform_name(), "probing host driver");
            print_info(Arc::new(driver), config)?;
        }

        Commands::CheckConfig { config } => {
            let loaded = VkHostConfig::load(&config)
                .with_context(|| format!("invalid configuration {}", config))?;
            println!("# {} is valid; effective settings:", config);
            println!();
            print!("{}", toml::to_string_pretty(&loaded)?);
        }

        Commands::InspectSnapshot { path } => {
            let mut file = std::fs::File::open(&path).with_context(|| format!("cannot open {}", path))?;
            let image = read_snapshot(&mut file)?;

            let mut by_type: BTreeMap<ObjectType, usize> = BTreeMap::new();
            let mut mapped_bytes = 0usize;
            for record in &image.records {
                *by_type.entry(record.object_type).or_default() += 1;
                mapped_bytes += record.mapped_contents.as_ref().map_or(0, Vec::len);
            }

            println!("Snapshot {}", path);
            println!("  objects: {}", image.records.len());
            println!("  table entries: {}", image.table.len());
            println!("  saved memory contents: {} bytes", mapped_bytes);
            println!();
            for (object_type, count) in by_type {
                println!("  {:<28} {}", format!("{:?}", object_type), count);
            }
        }

        Commands::Selftest => {
            selftest()?;
            println!("selftest passed");
        }
    }

    Ok(())
}

fn print_info(driver: Arc<dyn Driver>, config: VkHostConfig) -> anyhow::Result<()> {
    let state = DecoderState::new(driver, config);
    let support = state.host_feature_support().clone();
    if !support.supports_vulkan {
        bail!("no usable Vulkan driver on this host");
    }

    println!("Host Vulkan");
    println!(
        "  advertised API:   {}.{}",
        vk::api_version_major(support.api_version),
        vk::api_version_minor(support.api_version)
    );
    println!("  Vulkan 1.1:       {}", support.supports_vulkan_1_1);
    println!("  external memory:  {}", support.supports_external_memory);
    println!("  deferred commands: {}", support.use_deferred_commands);
    println!("  direct mapping:   {}", state.using_direct_mapping());

    let mut s = state.lock();
    let instance = s.create_instance(&InstanceCreateInfo {
        app_name: Some("vkhost-info".to_string()),
        api_version: support.api_version,
        ..Default::default()
    })?;
    for (index, pd) in s.enumerate_physical_devices(instance)?.into_iter().enumerate() {
        let props = s.get_physical_device_properties(pd)?;
        let memory = s.get_physical_device_memory_properties(pd)?;
        let extensions = s.enumerate_device_extension_properties(pd)?;
        println!();
        println!("GPU {}: {} ({:?})", index, props.device_name, props.device_type);
        println!(
            "  vendor {:#06x} device {:#06x}",
            props.vendor_id, props.device_id
        );
        println!("  memory types visible to guests: {}", memory.types.len());
        for ty in &memory.types {
            println!("    heap {} {:?}", ty.heap_index, ty.property_flags);
        }
        println!("  device extensions visible to guests: {}", extensions.len());
        for ext in &extensions {
            println!("    {} (rev {})", ext.extension_name, ext.spec_version);
        }
    }
    s.destroy_instance(instance);
    Ok(())
}

/// Exercise the decoder end to end on the fake driver: bring up a device,
/// write through a mapping, save, restore into a fresh decoder and compare.
fn selftest() -> anyhow::Result<()> {
    let mut config = VkHostConfig::default();
    config.snapshot.enabled = true;

    let source = Arc::new(DecoderState::new(Arc::new(FakeDriver::new()), config.clone()));
    let executor = VulkanExecutor::new(source.clone());

    let instance = expect_handle(executor.execute(VulkanCommand::CreateInstance {
        create_info: InstanceCreateInfo {
            app_name: Some("vkhost-selftest".to_string()),
            api_version: vk::API_VERSION_1_1,
            ..Default::default()
        },
    }))?;
    let physical_device = match executor.execute(VulkanCommand::EnumeratePhysicalDevices { instance }) {
        VulkanResponse::Handles { handles } if !handles.is_empty() => handles[0],
        other => bail!("enumerate physical devices: {:?}", other),
    };
    let device = expect_handle(executor.execute(VulkanCommand::CreateDevice {
        physical_device,
        create_info: DeviceCreateInfo {
            queue_create_infos: vec![DeviceQueueCreateInfo {
                queue_family_index: 0,
                queue_priorities: vec![1.0],
            }],
            enabled_extensions: vec![],
            enabled_features: None,
        },
    }))?;
    let queue = expect_handle(executor.execute(VulkanCommand::GetDeviceQueue {
        device,
        queue_family_index: 0,
        queue_index: 0,
    }))?;

    // Guest type 1 is the first host-visible type on the fake driver.
    let memory = expect_handle(executor.execute(VulkanCommand::AllocateMemory {
        device,
        allocate_info: MemoryAllocateInfo {
            allocation_size: 4096,
            memory_type_index: 1,
            import_color_buffer: None,
        },
    }))?;
    let address = match executor.execute(VulkanCommand::MapMemory {
        device,
        memory,
        offset: 0,
        size: vk::WHOLE_SIZE,
        flags: 0,
    }) {
        VulkanResponse::MemoryMapped { address } => address,
        other => bail!("map memory: {:?}", other),
    };
    let pattern = b"vkhost selftest";
    // SAFETY: the mapping covers 4096 bytes at `address`.
    unsafe {
        std::ptr::copy_nonoverlapping(pattern.as_ptr(), address as *mut u8, pattern.len());
    }

    for (sequence_number, response) in executor
        .execute_batch(vec![
            VulkanCommand::QueueSubmitAsync {
                queue,
                submits: vec![SubmitInfo::default()],
                fence: Default::default(),
                sequence_number: 1,
            },
            VulkanCommand::QueueHostSync {
                queue,
                need_host_sync: true,
                sequence_number: 1,
            },
        ])
        .into_iter()
        .enumerate()
    {
        if !matches!(response, VulkanResponse::Success) {
            bail!("async submit step {}: {:?}", sequence_number, response);
        }
    }

    let image = source.lock().snapshot_capture()?;
    let mut bytes = Vec::new();
    source.lock().snapshot_save(&mut bytes)?;
    info!(objects = image.records.len(), bytes = bytes.len(), "captured snapshot");

    let restored = DecoderState::new(Arc::new(FakeDriver::new()), config);
    {
        let mut s = restored.lock();
        s.set_created_handles_for_snapshot_load(&encode_created_handles(&image.created_handles()))?;
        s.snapshot_load(&mut bytes.as_slice())?;

        if s.live_handles() != source.lock().live_handles() {
            bail!("restored handle set differs from the saved one");
        }
        let ptr = s
            .get_mapped_host_pointer(memory)
            .context("restored memory is not mapped")?;
        // SAFETY: the restored mapping covers the whole 4096-byte allocation.
        let restored_bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), pattern.len()) };
        if restored_bytes != pattern {
            bail!("restored memory contents differ");
        }
        s.destroy_device(device);
        s.destroy_instance(instance);
    }

    executor.execute(VulkanCommand::DestroyDevice { device });
    executor.execute(VulkanCommand::DestroyInstance { instance });
    Ok(())
}

fn expect_handle(response: VulkanResponse) -> anyhow::Result<vkhost_protocol::handle::BoxedHandle> {
    match response {
        VulkanResponse::Handle { handle } => Ok(handle),
        other => bail!("expected a handle, got {:?}", other),
    }
}
