use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use tracing::debug;

use vkhost_protocol::vulkan_commands::*;

use crate::driver::MemoryProperties;
use crate::state::{DecoderState, StateGuard};

/// Decodes guest commands into decoder-state calls.
///
/// Every command runs under the global lock, except the host-sync commands
/// and fence waits which block without it.
pub struct VulkanExecutor {
    state: Arc<DecoderState>,
}

impl VulkanExecutor {
    pub fn new(state: Arc<DecoderState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<DecoderState> {
        &self.state
    }

    fn vk_err(result: vk::Result) -> VulkanResponse {
        VulkanResponse::Error {
            code: result.as_raw(),
            message: format!("{:?}", result),
        }
    }

    fn respond<T>(result: VkResult<T>, ok: impl FnOnce(T) -> VulkanResponse) -> VulkanResponse {
        match result {
            Ok(value) => ok(value),
            Err(e) => Self::vk_err(e),
        }
    }

    fn success(result: VkResult<()>) -> VulkanResponse {
        Self::respond(result, |()| VulkanResponse::Success)
    }

    fn handle(result: VkResult<vkhost_protocol::handle::BoxedHandle>) -> VulkanResponse {
        Self::respond(result, |handle| VulkanResponse::Handle { handle })
    }

    fn memory_properties(props: MemoryProperties) -> VulkanResponse {
        VulkanResponse::PhysicalDeviceMemoryProperties {
            memory_types: props
                .types
                .iter()
                .map(|t| SerializedMemoryType {
                    property_flags: t.property_flags.as_raw(),
                    heap_index: t.heap_index,
                })
                .collect(),
            memory_heaps: props
                .heaps
                .iter()
                .map(|h| SerializedMemoryHeap {
                    size: h.size,
                    flags: h.flags.as_raw(),
                })
                .collect(),
        }
    }

    fn format_properties(props: vk::FormatProperties) -> VulkanResponse {
        VulkanResponse::FormatProperties {
            linear_tiling_features: props.linear_tiling_features.as_raw(),
            optimal_tiling_features: props.optimal_tiling_features.as_raw(),
            buffer_features: props.buffer_features.as_raw(),
        }
    }

    fn image_format_properties(props: vk::ImageFormatProperties) -> VulkanResponse {
        VulkanResponse::ImageFormatProperties {
            max_extent: [
                props.max_extent.width,
                props.max_extent.height,
                props.max_extent.depth,
            ],
            max_mip_levels: props.max_mip_levels,
            max_array_layers: props.max_array_layers,
            sample_counts: props.sample_counts.as_raw(),
            max_resource_size: props.max_resource_size,
        }
    }

    fn requirements(requirements: vk::MemoryRequirements) -> SerializedMemoryRequirements {
        SerializedMemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
        }
    }

    fn features_raw(features: &vk::PhysicalDeviceFeatures) -> Vec<u8> {
        // SAFETY: PhysicalDeviceFeatures is a plain repr(C) struct of Bool32s.
        unsafe {
            let ptr = features as *const vk::PhysicalDeviceFeatures as *const u8;
            std::slice::from_raw_parts(ptr, std::mem::size_of::<vk::PhysicalDeviceFeatures>()).to_vec()
        }
    }

    /// Commands that may block for a long time and so never hold the lock.
    fn runs_unlocked(cmd: &VulkanCommand) -> bool {
        matches!(
            cmd,
            VulkanCommand::QueueHostSync { .. }
                | VulkanCommand::CommandBufferHostSync { .. }
                | VulkanCommand::WaitForFences { .. }
        )
    }

    /// Execute commands in order, one response each. Consecutive commands
    /// share one lock acquisition; blocking commands run between them with
    /// the lock released.
    pub fn execute_batch(&self, commands: Vec<VulkanCommand>) -> Vec<VulkanResponse> {
        let mut responses = Vec::with_capacity(commands.len());
        let mut guard: Option<StateGuard<'_>> = None;
        for cmd in commands {
            if Self::runs_unlocked(&cmd) {
                guard = None;
                responses.push(self.execute_unlocked(cmd));
            } else {
                let state = guard.get_or_insert_with(|| self.state.lock());
                responses.push(Self::execute_with(state, cmd));
            }
        }
        responses
    }

    /// Execute a Vulkan command and return the response.
    pub fn execute(&self, cmd: VulkanCommand) -> VulkanResponse {
        if Self::runs_unlocked(&cmd) {
            self.execute_unlocked(cmd)
        } else {
            Self::execute_with(&mut self.state.lock(), cmd)
        }
    }

    fn execute_unlocked(&self, cmd: VulkanCommand) -> VulkanResponse {
        match cmd {
            VulkanCommand::QueueHostSync {
                queue,
                need_host_sync,
                sequence_number,
            } => Self::success(self.state.queue_host_sync(queue, need_host_sync, sequence_number)),
            VulkanCommand::CommandBufferHostSync {
                command_buffer,
                need_host_sync,
                sequence_number,
            } => Self::success(self.state.command_buffer_host_sync(
                command_buffer,
                need_host_sync,
                sequence_number,
            )),
            VulkanCommand::WaitForFences {
                device,
                fences,
                wait_all,
                timeout_ns,
            } => Self::success(self.state.wait_for_fences(device, &fences, wait_all, timeout_ns)),
            cmd => Self::execute_with(&mut self.state.lock(), cmd),
        }
    }

    fn execute_with(state: &mut StateGuard<'_>, cmd: VulkanCommand) -> VulkanResponse {
        match cmd {
            // ── Instance ────────────────────────────────────
            VulkanCommand::EnumerateInstanceVersion => Self::respond(
                state.enumerate_instance_version(),
                |version| VulkanResponse::ApiVersion { version },
            ),
            VulkanCommand::CreateInstance { create_info } => Self::handle(state.create_instance(&create_info)),
            VulkanCommand::DestroyInstance { instance } => {
                state.destroy_instance(instance);
                VulkanResponse::Success
            }
            VulkanCommand::EnumeratePhysicalDevices { instance } => Self::respond(
                state.enumerate_physical_devices(instance),
                |handles| VulkanResponse::Handles { handles },
            ),

            // ── Physical Device Queries ─────────────────────
            VulkanCommand::GetPhysicalDeviceProperties { physical_device } => Self::respond(
                state.get_physical_device_properties(physical_device),
                |props| VulkanResponse::PhysicalDeviceProperties {
                    api_version: props.api_version,
                    driver_version: props.driver_version,
                    vendor_id: props.vendor_id,
                    device_id: props.device_id,
                    device_type: props.device_type.as_raw(),
                    device_name: props.device_name,
                    pipeline_cache_uuid: props.pipeline_cache_uuid,
                },
            ),
            VulkanCommand::GetPhysicalDeviceFeatures { physical_device } => Self::respond(
                state.get_physical_device_features(physical_device),
                |features| VulkanResponse::PhysicalDeviceFeatures {
                    features_raw: Self::features_raw(&features),
                },
            ),
            VulkanCommand::GetPhysicalDeviceMemoryProperties { physical_device } => Self::respond(
                state.get_physical_device_memory_properties(physical_device),
                Self::memory_properties,
            ),
            VulkanCommand::GetPhysicalDeviceQueueFamilyProperties { physical_device } => Self::respond(
                state.get_physical_device_queue_family_properties(physical_device),
                |families| VulkanResponse::QueueFamilyProperties {
                    families: families
                        .iter()
                        .map(|f| SerializedQueueFamilyProperties {
                            queue_flags: f.queue_flags.as_raw(),
                            queue_count: f.queue_count,
                            timestamp_valid_bits: f.timestamp_valid_bits,
                            min_image_transfer_granularity: [
                                f.min_image_transfer_granularity.width,
                                f.min_image_transfer_granularity.height,
                                f.min_image_transfer_granularity.depth,
                            ],
                        })
                        .collect(),
                },
            ),
            VulkanCommand::GetPhysicalDeviceFormatProperties {
                physical_device,
                format,
            } => Self::respond(
                state.get_physical_device_format_properties(physical_device, vk::Format::from_raw(format)),
                Self::format_properties,
            ),
            VulkanCommand::GetPhysicalDeviceImageFormatProperties {
                physical_device,
                query,
            } => Self::respond(
                state.get_physical_device_image_format_properties(physical_device, &query),
                Self::image_format_properties,
            ),
            VulkanCommand::EnumerateDeviceExtensionProperties { physical_device } => Self::respond(
                state.enumerate_device_extension_properties(physical_device),
                |extensions| VulkanResponse::ExtensionProperties { extensions },
            ),
            VulkanCommand::GetPhysicalDeviceProperties2 { physical_device } => Self::respond(
                state.get_physical_device_properties2(physical_device),
                |(props, ids)| VulkanResponse::PhysicalDeviceProperties2 {
                    api_version: props.api_version,
                    driver_version: props.driver_version,
                    vendor_id: props.vendor_id,
                    device_id: props.device_id,
                    device_type: props.device_type.as_raw(),
                    device_name: props.device_name,
                    pipeline_cache_uuid: props.pipeline_cache_uuid,
                    device_uuid: ids.device_uuid,
                    driver_uuid: ids.driver_uuid,
                },
            ),
            VulkanCommand::GetPhysicalDeviceFeatures2 { physical_device } => Self::respond(
                state.get_physical_device_features2(physical_device),
                |features| VulkanResponse::PhysicalDeviceFeatures2 {
                    features_raw: Self::features_raw(&features.features),
                    protected_memory: features.protected_memory,
                    sampler_ycbcr_conversion: features.sampler_ycbcr_conversion,
                },
            ),
            VulkanCommand::GetPhysicalDeviceMemoryProperties2 { physical_device } => Self::respond(
                state.get_physical_device_memory_properties2(physical_device),
                Self::memory_properties,
            ),
            VulkanCommand::GetPhysicalDeviceFormatProperties2 {
                physical_device,
                format,
            } => Self::respond(
                state.get_physical_device_format_properties2(physical_device, vk::Format::from_raw(format)),
                Self::format_properties,
            ),
            VulkanCommand::GetPhysicalDeviceImageFormatProperties2 {
                physical_device,
                query,
            } => Self::respond(
                state.get_physical_device_image_format_properties2(physical_device, &query),
                Self::image_format_properties,
            ),
            VulkanCommand::GetPhysicalDeviceExternalSemaphoreProperties {
                physical_device,
                handle_type,
            } => Self::respond(
                state.get_physical_device_external_semaphore_properties(physical_device, handle_type),
                |props| VulkanResponse::ExternalSemaphoreProperties {
                    export_from_imported_handle_types: props.export_from_imported_handle_types.as_raw(),
                    compatible_handle_types: props.compatible_handle_types.as_raw(),
                    external_semaphore_features: props.external_semaphore_features.as_raw(),
                },
            ),

            // ── Logical Device ──────────────────────────────
            VulkanCommand::CreateDevice {
                physical_device,
                create_info,
            } => Self::handle(state.create_device(physical_device, &create_info)),
            VulkanCommand::DestroyDevice { device } => {
                state.destroy_device(device);
                VulkanResponse::Success
            }
            VulkanCommand::DeviceWaitIdle { device } => Self::success(state.device_wait_idle(device)),
            VulkanCommand::GetDeviceQueue {
                device,
                queue_family_index,
                queue_index,
            } => Self::handle(state.get_device_queue(device, queue_family_index, queue_index)),

            // ── Memory ──────────────────────────────────────
            VulkanCommand::AllocateMemory {
                device,
                allocate_info,
            } => Self::handle(state.allocate_memory(device, &allocate_info)),
            VulkanCommand::FreeMemory { device, memory } => {
                state.free_memory(device, memory);
                VulkanResponse::Success
            }
            VulkanCommand::FreeMemorySync { device, memory } => {
                Self::success(state.free_memory_sync(device, memory))
            }
            VulkanCommand::MapMemory {
                device,
                memory,
                offset,
                size,
                flags,
            } => Self::respond(state.map_memory(device, memory, offset, size, flags), |ptr| {
                VulkanResponse::MemoryMapped { address: ptr.addr() }
            }),
            VulkanCommand::UnmapMemory { device, memory } => {
                state.unmap_memory(device, memory);
                VulkanResponse::Success
            }
            VulkanCommand::FlushMappedMemoryRanges { device, ranges } => {
                Self::success(state.flush_mapped_memory_ranges(device, &ranges))
            }
            VulkanCommand::InvalidateMappedMemoryRanges { device, ranges } => {
                Self::success(state.invalidate_mapped_memory_ranges(device, &ranges))
            }
            VulkanCommand::MapMemoryIntoAddressSpace { device, memory } => Self::respond(
                state.map_memory_into_address_space(device, memory),
                |address| VulkanResponse::Address { address },
            ),
            VulkanCommand::GetMemoryHostAddressInfo { device, memory } => Self::respond(
                state.get_memory_host_address_info(device, memory),
                |(address, size, id)| VulkanResponse::HostAddressInfo { address, size, id },
            ),

            // ── Buffer ──────────────────────────────────────
            VulkanCommand::CreateBuffer {
                device,
                create_info,
            } => Self::handle(state.create_buffer(device, &create_info)),
            VulkanCommand::CreateBufferWithRequirements {
                device,
                create_info,
            } => Self::respond(
                state.create_buffer_with_requirements(device, &create_info),
                |(handle, requirements)| VulkanResponse::HandleWithRequirements {
                    handle,
                    requirements: Self::requirements(requirements),
                },
            ),
            VulkanCommand::DestroyBuffer { device, buffer } => {
                state.destroy_buffer(device, buffer);
                VulkanResponse::Success
            }
            VulkanCommand::BindBufferMemory {
                device,
                buffer,
                memory,
                memory_offset,
            } => Self::success(state.bind_buffer_memory(device, buffer, memory, memory_offset)),
            VulkanCommand::BindBufferMemory2 { device, bind_infos } => {
                Self::success(state.bind_buffer_memory2(device, &bind_infos))
            }
            VulkanCommand::GetBufferMemoryRequirements { device, buffer } => Self::respond(
                state.get_buffer_memory_requirements(device, buffer),
                |requirements| VulkanResponse::MemoryRequirements {
                    requirements: Self::requirements(requirements),
                },
            ),
            VulkanCommand::RegisterBufferColorBuffer {
                buffer,
                color_buffer,
                ..
            } => Self::success(state.register_buffer_color_buffer(buffer, color_buffer)),

            // ── Image ───────────────────────────────────────
            VulkanCommand::CreateImage {
                device,
                create_info,
            } => Self::handle(state.create_image(device, &create_info)),
            VulkanCommand::CreateImageWithRequirements {
                device,
                create_info,
            } => Self::respond(
                state.create_image_with_requirements(device, &create_info),
                |(handle, requirements)| VulkanResponse::HandleWithRequirements {
                    handle,
                    requirements: Self::requirements(requirements),
                },
            ),
            VulkanCommand::DestroyImage { device, image } => {
                state.destroy_image(device, image);
                VulkanResponse::Success
            }
            VulkanCommand::BindImageMemory {
                device,
                image,
                memory,
                memory_offset,
            } => Self::success(state.bind_image_memory(device, image, memory, memory_offset)),
            VulkanCommand::GetImageMemoryRequirements { device, image } => Self::respond(
                state.get_image_memory_requirements(device, image),
                |requirements| VulkanResponse::MemoryRequirements {
                    requirements: Self::requirements(requirements),
                },
            ),
            VulkanCommand::GetImageMemoryRequirements2 { device, image } => Self::respond(
                state.get_image_memory_requirements2(device, image),
                |r| VulkanResponse::MemoryRequirements2 {
                    requirements: Self::requirements(r.requirements),
                    prefers_dedicated: r.prefers_dedicated,
                    requires_dedicated: r.requires_dedicated,
                },
            ),
            VulkanCommand::GetLinearImageLayout { device, format } => Self::respond(
                state.get_linear_image_layout(device, format),
                |(offset, row_pitch_alignment)| VulkanResponse::LinearImageLayout {
                    offset,
                    row_pitch_alignment,
                },
            ),
            VulkanCommand::RegisterImageColorBuffer {
                image, color_buffer, ..
            } => Self::success(state.register_image_color_buffer(image, color_buffer)),
            VulkanCommand::CreateImageView {
                device,
                create_info,
            } => Self::handle(state.create_image_view(device, &create_info)),
            VulkanCommand::DestroyImageView { device, image_view } => {
                state.destroy_image_view(device, image_view);
                VulkanResponse::Success
            }
            VulkanCommand::CreateSampler {
                device,
                create_info,
            } => Self::handle(state.create_sampler(device, &create_info)),
            VulkanCommand::DestroySampler { device, sampler } => {
                state.destroy_sampler(device, sampler);
                VulkanResponse::Success
            }

            // ── Descriptors ─────────────────────────────────
            VulkanCommand::CreateDescriptorSetLayout {
                device,
                create_info,
            } => Self::handle(state.create_descriptor_set_layout(device, &create_info)),
            VulkanCommand::DestroyDescriptorSetLayout { device, layout } => {
                state.destroy_descriptor_set_layout(device, layout);
                VulkanResponse::Success
            }
            VulkanCommand::CreateDescriptorPool {
                device,
                create_info,
            } => Self::handle(state.create_descriptor_pool(device, &create_info)),
            VulkanCommand::DestroyDescriptorPool { device, pool } => {
                state.destroy_descriptor_pool(device, pool);
                VulkanResponse::Success
            }
            VulkanCommand::ResetDescriptorPool { device, pool, flags } => {
                Self::success(state.reset_descriptor_pool(device, pool, flags))
            }
            VulkanCommand::AllocateDescriptorSets {
                device,
                pool,
                set_layouts,
            } => Self::respond(
                state.allocate_descriptor_sets(device, pool, &set_layouts),
                |handles| VulkanResponse::Handles { handles },
            ),
            VulkanCommand::FreeDescriptorSets {
                device,
                pool,
                descriptor_sets,
            } => Self::success(state.free_descriptor_sets(device, pool, &descriptor_sets)),
            VulkanCommand::UpdateDescriptorSets { device, writes } => {
                Self::success(state.update_descriptor_sets(device, &writes))
            }
            VulkanCommand::CreateDescriptorUpdateTemplate {
                device,
                create_info,
            } => Self::handle(state.create_descriptor_update_template(device, &create_info)),
            VulkanCommand::DestroyDescriptorUpdateTemplate { device, template } => {
                state.destroy_descriptor_update_template(device, template);
                VulkanResponse::Success
            }
            VulkanCommand::UpdateDescriptorSetWithTemplate {
                device,
                descriptor_set,
                template,
                image_infos,
                buffer_infos,
            } => Self::success(state.update_descriptor_set_with_template(
                device,
                descriptor_set,
                template,
                &image_infos,
                &buffer_infos,
            )),

            // ── Render Pass ─────────────────────────────────
            VulkanCommand::CreateRenderPass {
                device,
                create_info,
            } => Self::handle(state.create_render_pass(device, &create_info)),
            VulkanCommand::DestroyRenderPass {
                device,
                render_pass,
            } => {
                state.destroy_render_pass(device, render_pass);
                VulkanResponse::Success
            }

            // ── Sync Objects ────────────────────────────────
            VulkanCommand::CreateSemaphore { device } => Self::handle(state.create_semaphore(device)),
            VulkanCommand::DestroySemaphore { device, semaphore } => {
                state.destroy_semaphore(device, semaphore);
                VulkanResponse::Success
            }
            VulkanCommand::CreateFence { device, signaled } => Self::handle(state.create_fence(device, signaled)),
            VulkanCommand::DestroyFence { device, fence } => {
                state.destroy_fence(device, fence);
                VulkanResponse::Success
            }
            VulkanCommand::ResetFences { device, fences } => Self::success(state.reset_fences(device, &fences)),
            VulkanCommand::GetFenceStatus { device, fence } => Self::respond(
                state.get_fence_status(device, fence),
                |signaled| VulkanResponse::FenceStatus { signaled },
            ),

            // ── Command Pool / Buffer ───────────────────────
            VulkanCommand::CreateCommandPool {
                device,
                create_info,
            } => Self::handle(state.create_command_pool(device, &create_info)),
            VulkanCommand::DestroyCommandPool {
                device,
                command_pool,
            } => {
                state.destroy_command_pool(device, command_pool);
                VulkanResponse::Success
            }
            VulkanCommand::ResetCommandPool {
                device,
                command_pool,
                flags,
            } => Self::success(state.reset_command_pool(device, command_pool, flags)),
            VulkanCommand::AllocateCommandBuffers {
                device,
                command_pool,
                level,
                count,
            } => Self::respond(
                state.allocate_command_buffers(device, command_pool, level, count),
                |handles| VulkanResponse::Handles { handles },
            ),
            VulkanCommand::FreeCommandBuffers {
                device,
                command_pool,
                command_buffers,
            } => {
                state.free_command_buffers(device, command_pool, &command_buffers);
                VulkanResponse::Success
            }
            VulkanCommand::BeginCommandBuffer {
                command_buffer,
                flags,
            } => Self::success(state.begin_command_buffer(command_buffer, flags)),
            VulkanCommand::EndCommandBuffer { command_buffer } => {
                Self::success(state.end_command_buffer(command_buffer))
            }
            VulkanCommand::ResetCommandBuffer {
                command_buffer,
                flags,
            } => Self::success(state.reset_command_buffer(command_buffer, flags)),
            VulkanCommand::BeginCommandBufferAsync {
                command_buffer,
                flags,
                sequence_number,
            } => Self::success(state.begin_command_buffer_async(command_buffer, flags, sequence_number)),
            VulkanCommand::EndCommandBufferAsync {
                command_buffer,
                sequence_number,
            } => Self::success(state.end_command_buffer_async(command_buffer, sequence_number)),
            VulkanCommand::ResetCommandBufferAsync {
                command_buffer,
                flags,
                sequence_number,
            } => Self::success(state.reset_command_buffer_async(command_buffer, flags, sequence_number)),

            // ── Queue ───────────────────────────────────────
            VulkanCommand::QueueSubmit {
                queue,
                submits,
                fence,
            } => Self::success(state.queue_submit(queue, &submits, fence)),
            VulkanCommand::QueueWaitIdle { queue } => Self::success(state.queue_wait_idle(queue)),
            VulkanCommand::QueueBindSparse {
                queue,
                bind_infos,
                fence,
            } => Self::success(state.queue_bind_sparse(queue, &bind_infos, fence)),
            VulkanCommand::QueueSubmitAsync {
                queue,
                submits,
                fence,
                sequence_number,
            } => Self::success(state.queue_submit_async(queue, &submits, fence, sequence_number)),
            VulkanCommand::QueueWaitIdleAsync {
                queue,
                sequence_number,
            } => Self::success(state.queue_wait_idle_async(queue, sequence_number)),
            VulkanCommand::QueueBindSparseAsync {
                queue,
                bind_infos,
                fence,
                sequence_number,
            } => Self::success(state.queue_bind_sparse_async(queue, &bind_infos, fence, sequence_number)),

            // Routed to `execute_unlocked` before the lock is taken.
            VulkanCommand::QueueHostSync { .. }
            | VulkanCommand::CommandBufferHostSync { .. }
            | VulkanCommand::WaitForFences { .. } => {
                debug!("blocking command on the locked path ignored");
                VulkanResponse::Success
            }
        }
    }
}
