//! Vulkan 设备后端实现
//!
//! 本模块基于 `ash` 实现 [`DeviceBackend`]，把提交层的设备调用直接转发给驱动。
//! 设备以无窗口方式创建，不依赖表面；物理设备支持交换链扩展时会一并启用，
//! 呈现请求由调用方提供交换链句柄。
//!
//! # 初始化流程
//!
//! 1. 加载 Vulkan 库并创建实例（API 1.1）
//! 2. 选择物理设备（优先独立显卡），找到同时支持图形和计算的队列族
//! 3. 创建逻辑设备和队列（按配置的队列数量，可选受保护队列）
//! 4. 交换链扩展可用时创建交换链函数表
//!
//! 同一个 `VkQueue` 上的提交和呈现需要外部同步，由提交引擎的提交锁保证。

use std::ffi::CStr;
use std::time::Duration;

use ash::extensions::khr::Swapchain;
use ash::prelude::VkResult;
use ash::vk;

use super::backend::{
    CommandBufferBegin, DeviceBackend, DeviceObject, PresentRequest, QueueSubmitInfo,
    RenderPassBegin,
};
use crate::core::config::DeviceConfig;
use crate::core::error::{Result, SubmitError};
use crate::renderer::command::Priority;
use crate::{engine_debug, engine_info, engine_warn};

const APPLICATION_NAME: &[u8] = b"dist_submit\0";

/// 基于 ash 的 Vulkan 设备
pub struct VulkanDevice {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    swapchain: Option<Swapchain>,
    physical_device_name: String,
    queue_family_index: u32,
    queue_family_properties: Vec<vk::QueueFamilyProperties>,
}

impl VulkanDevice {
    /// 创建无窗口的 Vulkan 设备
    ///
    /// # 参数
    ///
    /// * `config` - 设备配置，使用其中的队列数量和受保护内容开关
    ///
    /// # 返回值
    ///
    /// 找不到 Vulkan 库或合适的物理设备时返回 `SubmitError::Initialization`
    pub fn new(config: &DeviceConfig) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| SubmitError::Initialization(format!("failed to load Vulkan library: {}", e)))?;
        let instance = Self::create_instance(&entry)?;

        match Self::create_device(&instance, config) {
            Ok((device, swapchain, name, family_index, families)) => {
                engine_info!(
                    device = %name,
                    family = family_index,
                    swapchain = swapchain.is_some(),
                    "Vulkan device created"
                );
                Ok(Self {
                    _entry: entry,
                    instance,
                    device,
                    swapchain,
                    physical_device_name: name,
                    queue_family_index: family_index,
                    queue_family_properties: families,
                })
            }
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    fn create_instance(entry: &ash::Entry) -> Result<ash::Instance> {
        let name = CStr::from_bytes_with_nul(APPLICATION_NAME)
            .map_err(|e| SubmitError::Initialization(e.to_string()))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::builder().application_info(&app_info);

        unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| SubmitError::Initialization(format!("failed to create Vulkan instance: {:?}", e)))
    }

    #[allow(clippy::type_complexity)]
    fn create_device(
        instance: &ash::Instance,
        config: &DeviceConfig,
    ) -> Result<(ash::Device, Option<Swapchain>, String, u32, Vec<vk::QueueFamilyProperties>)> {
        let physical_devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| SubmitError::Initialization(format!("failed to enumerate physical devices: {:?}", e)))?;

        let flags = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
        let (physical_device, family_index, families) = physical_devices
            .iter()
            .filter_map(|&physical_device| {
                let families = unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
                families
                    .iter()
                    .position(|family| family.queue_flags.contains(flags))
                    .map(|index| (physical_device, index as u32, families))
            })
            .min_by_key(|(physical_device, _, _)| {
                let properties = unsafe { instance.get_physical_device_properties(*physical_device) };
                match properties.device_type {
                    vk::PhysicalDeviceType::DISCRETE_GPU => 0,
                    vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
                    vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
                    vk::PhysicalDeviceType::CPU => 3,
                    _ => 4,
                }
            })
            .ok_or_else(|| SubmitError::Initialization("no Vulkan device supports graphics and compute".to_string()))?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let family = families[family_index as usize];
        let queue_count = config.queue_count.min(family.queue_count).max(1) as usize;
        // 0 号队列对应中优先级，1 号高优先级，2 号低优先级
        let priorities: Vec<f32> = [Priority::Medium, Priority::High, Priority::Low]
            .iter()
            .take(queue_count)
            .map(Priority::queue_priority)
            .collect();

        let protected = config.enable_protected_content && family.queue_flags.contains(vk::QueueFlags::PROTECTED);
        if config.enable_protected_content && !protected {
            engine_warn!(device = %name, "Protected content requested but not supported by the queue family");
        }

        let mut queue_infos = vec![vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(family_index)
            .queue_priorities(&priorities)
            .build()];
        if protected {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::builder()
                    .flags(vk::DeviceQueueCreateFlags::PROTECTED)
                    .queue_family_index(family_index)
                    .queue_priorities(&priorities)
                    .build(),
            );
        }

        let supports_swapchain = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .map(|extensions| {
                extensions.iter().any(|extension| {
                    let extension_name = unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) };
                    extension_name == Swapchain::name()
                })
            })
            .unwrap_or(false);
        let extension_names: Vec<*const std::os::raw::c_char> = if supports_swapchain {
            vec![Swapchain::name().as_ptr()]
        } else {
            Vec::new()
        };

        let mut protected_features = vk::PhysicalDeviceProtectedMemoryFeatures::builder().protected_memory(protected);
        let mut device_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names);
        if protected {
            device_info = device_info.push_next(&mut protected_features);
        }

        let device = unsafe { instance.create_device(physical_device, &device_info, None) }
            .map_err(|e| SubmitError::Initialization(format!("failed to create Vulkan device: {:?}", e)))?;
        let swapchain = supports_swapchain.then(|| Swapchain::new(instance, &device));

        engine_debug!(queues = queue_count, protected, "Device queues created");
        Ok((device, swapchain, name, family_index, families))
    }

    pub fn physical_device_name(&self) -> &str {
        &self.physical_device_name
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}

impl DeviceBackend for VulkanDevice {
    fn backend_name(&self) -> &str {
        "Vulkan"
    }

    fn queue_family_properties(&self) -> Vec<vk::QueueFamilyProperties> {
        self.queue_family_properties.clone()
    }

    fn device_queue(&self, family_index: u32, queue_index: u32, protected: bool) -> vk::Queue {
        if protected {
            let info = vk::DeviceQueueInfo2::builder()
                .flags(vk::DeviceQueueCreateFlags::PROTECTED)
                .queue_family_index(family_index)
                .queue_index(queue_index);
            unsafe { self.device.get_device_queue2(&info) }
        } else {
            unsafe { self.device.get_device_queue(family_index, queue_index) }
        }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let info = vk::FenceCreateInfo::builder();
        unsafe { self.device.create_fence(&info, None) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn get_fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> VkResult<()> {
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&info, None) }
    }

    fn create_command_pool(&self, queue_family_index: u32, protected: bool) -> VkResult<vk::CommandPool> {
        let mut flags = vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
        if protected {
            flags |= vk::CommandPoolCreateFlags::PROTECTED;
        }
        let info = vk::CommandPoolCreateInfo::builder()
            .flags(flags)
            .queue_family_index(queue_family_index);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
    ) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info) }?;
        buffers.into_iter().next().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        if buffers.is_empty() {
            return;
        }
        unsafe { self.device.free_command_buffers(pool, buffers) }
    }

    fn reset_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn begin_command_buffer(&self, buffer: vk::CommandBuffer, begin: &CommandBufferBegin) -> VkResult<()> {
        let inheritance = begin.inheritance.map(|inheritance| {
            vk::CommandBufferInheritanceInfo::builder()
                .render_pass(inheritance.render_pass)
                .subpass(inheritance.subpass)
                .framebuffer(inheritance.framebuffer)
                .build()
        });
        let default_inheritance = vk::CommandBufferInheritanceInfo::default();

        let mut flags = vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        if inheritance.is_some() {
            flags |= vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE;
        }
        let mut info = vk::CommandBufferBeginInfo::builder().flags(flags);
        if begin.level == vk::CommandBufferLevel::SECONDARY {
            info = info.inheritance_info(inheritance.as_ref().unwrap_or(&default_inheritance));
        }
        unsafe { self.device.begin_command_buffer(buffer, &info) }
    }

    fn end_command_buffer(&self, buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(buffer) }
    }

    fn cmd_execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        unsafe { self.device.cmd_execute_commands(primary, secondaries) }
    }

    fn cmd_begin_render_pass(&self, primary: vk::CommandBuffer, begin: &RenderPassBegin) {
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(begin.render_pass)
            .framebuffer(begin.framebuffer)
            .render_area(begin.render_area)
            .clear_values(&begin.clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(primary, &info, vk::SubpassContents::SECONDARY_COMMAND_BUFFERS)
        }
    }

    fn cmd_end_render_pass(&self, primary: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(primary) }
    }

    fn queue_submit(&self, queue: vk::Queue, submit: &QueueSubmitInfo, fence: vk::Fence) -> VkResult<()> {
        let mut protected_info = vk::ProtectedSubmitInfo::builder().protected_submit(true);
        let mut info = vk::SubmitInfo::builder()
            .wait_semaphores(&submit.wait_semaphores)
            .wait_dst_stage_mask(&submit.wait_stage_masks)
            .command_buffers(&submit.command_buffers)
            .signal_semaphores(&submit.signal_semaphores);
        if submit.protected {
            info = info.push_next(&mut protected_info);
        }
        unsafe { self.device.queue_submit(queue, &[info.build()], fence) }
    }

    fn queue_present(&self, queue: vk::Queue, present: &PresentRequest) -> vk::Result {
        let swapchain = match &self.swapchain {
            Some(swapchain) => swapchain,
            None => return vk::Result::ERROR_EXTENSION_NOT_PRESENT,
        };
        let swapchains = [present.swapchain];
        let image_indices = [present.image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&present.wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        match unsafe { swapchain.queue_present(queue, &info) } {
            Ok(false) => vk::Result::SUCCESS,
            Ok(true) => vk::Result::SUBOPTIMAL_KHR,
            Err(result) => result,
        }
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }

    fn destroy_object(&self, object: DeviceObject) {
        unsafe {
            match object {
                DeviceObject::Semaphore(semaphore) => self.device.destroy_semaphore(semaphore, None),
                DeviceObject::Fence(fence) => self.device.destroy_fence(fence, None),
                DeviceObject::Buffer(buffer) => self.device.destroy_buffer(buffer, None),
                DeviceObject::Image(image) => self.device.destroy_image(image, None),
                DeviceObject::ImageView(view) => self.device.destroy_image_view(view, None),
                DeviceObject::Framebuffer(framebuffer) => self.device.destroy_framebuffer(framebuffer, None),
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(result) = self.device.device_wait_idle() {
                engine_warn!(result = ?result, "Device wait idle failed during teardown");
            }
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
