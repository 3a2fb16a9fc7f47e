// =============================================================================
// GRAPHICS BACKEND - build order, frame loop and teardown
// =============================================================================
//
// BUILD ORDER (each stage only uses the ones above it):
// ┌─────────────────────────────────────────────────────────────────┐
// │  DeviceContext   instance, surface, logical device, queues      │
// │  Swapchain       images, views, one FrameSlot per image         │
// │  CommandPools    graphics + transfer, frame command buffers     │
// │  Descriptors     pre-sized descriptor pool                      │
// │  Allocator       buffer arena over device memory                │
// │  Registry        renderers become reachable                     │
// └─────────────────────────────────────────────────────────────────┘
//
// Built stages are pushed onto a stack. A failed build and teardown both pop
// it, so release order is always the exact reverse of build order.
//
// FRAME FLOW:
// wait slot fence -> acquire -> record -> reset fence -> submit -> present
//
// =============================================================================

use ash::vk;
use std::fmt;
use std::time::Duration;

use crate::backend::{
    BackendKind, CommandPoolSet, DescriptorPool, DeviceCapabilities, DeviceContext, GpuPlatform, HeadlessPlatform,
    ParamBlock, QueueBinding, QueuePurpose, ResourceAllocator, Submission, Swapchain, SwapchainSettings,
    VulkanPlatform,
};
use crate::config::BackendConfig;
use crate::error::{BackendError, ContractMode, Result};
use crate::renderer::{BackendServices, FrameContext, Renderer, RendererHandle, RendererRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Created,
    Built,
    Running,
    ShuttingDown,
    Destroyed,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Outcome of a frame call. Transient conditions are values, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// `update()` finished; the slot is free for the renderer to touch.
    Ready { slot: usize },
    Presented {
        slot: usize,
        image_index: u32,
        suboptimal: bool,
    },
    /// Call `rebuild_swapchain()` before the next frame.
    OutOfDate,
    Timeout,
    /// The drawable area is empty; nothing was recorded.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Device,
    Swapchain,
    CommandPools,
    Descriptors,
    Allocator,
    Registry,
}

pub struct GraphicsBackend {
    platform: Box<dyn GpuPlatform>,
    state: BackendState,
    config: Option<BackendConfig>,

    // ─────────────────────────────────────────────────────────────────────────
    // STAGES (Some exactly while listed in `stages`)
    // ─────────────────────────────────────────────────────────────────────────
    stages: Vec<Stage>,
    device: Option<DeviceContext>,
    swapchain: Option<Swapchain>,
    commands: Option<CommandPoolSet>,
    descriptors: Option<DescriptorPool>,
    allocator: Option<ResourceAllocator>,
    /// Outlives builds so handles stay unique across build/teardown cycles.
    registry: RendererRegistry,

    // ─────────────────────────────────────────────────────────────────────────
    // FRAME STATE
    // ─────────────────────────────────────────────────────────────────────────
    clear_color: [f32; 4],
    fence_timeout: Duration,
    acquire_timeout: Duration,
    contract: ContractMode,
    frame_index: u64,
    rebuild_pending: bool,
    device_lost: bool,
}

impl GraphicsBackend {
    pub fn new(platform: Box<dyn GpuPlatform>) -> Self {
        let contract = ContractMode::default();
        Self {
            platform,
            state: BackendState::Created,
            config: None,
            stages: Vec::new(),
            device: None,
            swapchain: None,
            commands: None,
            descriptors: None,
            allocator: None,
            registry: RendererRegistry::new(contract),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            fence_timeout: Duration::from_secs(1),
            acquire_timeout: Duration::from_secs(1),
            contract,
            frame_index: 0,
            rebuild_pending: false,
            device_lost: false,
        }
    }

    /// Backend for a configured kind. Vulkan needs the loader library at runtime.
    pub fn for_kind(kind: BackendKind) -> Result<Self> {
        let platform: Box<dyn GpuPlatform> = match kind {
            BackendKind::Vulkan => Box::new(VulkanPlatform::load()?),
            BackendKind::Headless => Box::new(HeadlessPlatform::default()),
        };
        Ok(Self::new(platform))
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Physical devices visible to the platform. No state is kept.
    pub fn init(&self) -> Result<Vec<DeviceCapabilities>> {
        if !matches!(self.state, BackendState::Created | BackendState::Destroyed) {
            return Err(BackendError::invalid_state("enumerate devices", self.state));
        }
        DeviceContext::enumerate(self.platform.as_ref())
    }

    /// Run every build stage in order. On failure the stages built so far are
    /// released in reverse and the backend keeps its previous state.
    pub fn build(&mut self, config: BackendConfig) -> Result<()> {
        if !matches!(self.state, BackendState::Created | BackendState::Destroyed) {
            return Err(BackendError::invalid_state("build", self.state));
        }

        log::info!("Building {} graphics backend...", self.platform.kind());
        self.contract = config.contract_mode;
        self.registry.set_contract_mode(config.contract_mode);
        self.clear_color = config.clear_color;
        self.fence_timeout = config.fence_timeout;
        self.acquire_timeout = config.acquire_timeout;
        self.frame_index = 0;
        self.rebuild_pending = false;
        self.device_lost = false;

        if let Err(err) = self.build_stages(&config) {
            log::error!("Backend build failed: {}", err);
            self.release_stages();
            return Err(err);
        }

        self.config = Some(config);
        self.state = BackendState::Built;
        log::info!("Graphics backend built ({} stages)", self.stages.len());
        Ok(())
    }

    fn build_stages(&mut self, config: &BackendConfig) -> Result<()> {
        // STEP 1: Device
        let device = DeviceContext::create(self.platform.as_ref(), config)?;
        let gpu = device.shared_device()?;
        let surface = device.surface();
        let graphics = QueueBinding {
            family: device.graphics_family(),
            queue: device.graphics_queue(),
        };
        let transfer = QueueBinding {
            family: device.transfer_family(),
            queue: device.transfer_queue(),
        };
        self.device = Some(device);
        self.stages.push(Stage::Device);

        // STEP 2: Swapchain
        let settings = SwapchainSettings {
            surface_format: vk::SurfaceFormatKHR {
                format: config.surface_format,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            present_modes: config.present_modes.clone(),
            image_count: config.image_count,
        };
        let mut swapchain = Swapchain::new(gpu.clone(), surface, settings);
        swapchain.build(config.target.drawable_extent())?;
        self.swapchain = Some(swapchain);
        self.stages.push(Stage::Swapchain);

        // STEP 3: Command pools and one frame command buffer per slot
        let commands = CommandPoolSet::new(gpu.clone(), graphics, transfer)?;
        self.attach_frame_buffers(&commands)?;
        self.commands = Some(commands);
        self.stages.push(Stage::CommandPools);

        // STEP 4: Descriptors
        let descriptors = DescriptorPool::new(gpu.clone(), &config.descriptor_sizes, config.max_descriptor_sets)?;
        self.descriptors = Some(descriptors);
        self.stages.push(Stage::Descriptors);

        // STEP 5: Allocator
        let allocator = ResourceAllocator::new(gpu.as_ref(), config.contract_mode)?;
        self.allocator = Some(allocator);
        self.stages.push(Stage::Allocator);

        // STEP 6: Renderers become reachable
        self.stages.push(Stage::Registry);
        Ok(())
    }

    /// Allocate and attach one primary command buffer per frame slot.
    fn attach_frame_buffers(&mut self, commands: &CommandPoolSet) -> Result<()> {
        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or_else(|| BackendError::invalid_state("allocate frame command buffers", "unbuilt"))?;

        let count = swapchain.slot_count() as u32;
        let buffers = commands.allocate(QueuePurpose::Graphics, count, vk::CommandBufferLevel::PRIMARY)?;
        if let Err(err) = swapchain.attach_command_buffers(&buffers) {
            commands.free(QueuePurpose::Graphics, &buffers);
            return Err(err);
        }
        log::debug!("Attached {} frame command buffers", count);
        Ok(())
    }

    /// Wait idle, then release built stages in strict reverse order.
    /// Safe to call repeatedly; also run on drop.
    pub fn teardown(&mut self) {
        if matches!(self.state, BackendState::Created | BackendState::Destroyed) {
            return;
        }

        log::info!("Shutting down graphics backend...");
        self.state = BackendState::ShuttingDown;
        self.release_stages();
        self.config = None;
        self.state = BackendState::Destroyed;
        log::info!("Graphics backend destroyed after {} frames", self.frame_index);
    }

    fn release_stages(&mut self) {
        if let Some(device) = &self.device {
            if let Err(err) = device.wait_idle() {
                log::warn!("Device wait before release failed: {}", err);
            }
        }

        while let Some(stage) = self.stages.pop() {
            log::debug!("Releasing stage {:?}", stage);
            match stage {
                Stage::Registry => self.release_renderers(),
                Stage::Allocator => {
                    if let Some(mut allocator) = self.allocator.take() {
                        allocator.destroy();
                    }
                }
                Stage::Descriptors => {
                    if let Some(mut descriptors) = self.descriptors.take() {
                        descriptors.destroy();
                    }
                }
                Stage::CommandPools => {
                    if let Some(mut commands) = self.commands.take() {
                        if let Some(swapchain) = self.swapchain.as_mut() {
                            let buffers = swapchain.take_command_buffers();
                            commands.free(QueuePurpose::Graphics, &buffers);
                        }
                        commands.destroy();
                    }
                }
                Stage::Swapchain => {
                    if let Some(mut swapchain) = self.swapchain.take() {
                        swapchain.destroy();
                    }
                }
                Stage::Device => {
                    if let Some(mut device) = self.device.take() {
                        if let Err(err) = device.destroy() {
                            log::warn!("Device context release incomplete: {}", err);
                        }
                    }
                }
            }
        }
    }

    /// Detach and drop every renderer while the stages they borrow still exist.
    fn release_renderers(&mut self) {
        let drained = self.registry.drain();
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        match self.services("detach renderers") {
            Ok(services) => {
                for (handle, mut renderer) in drained {
                    if let Err(err) = renderer.detach(&services) {
                        log::warn!("Renderer '{}' ({}) failed to detach: {:#}", renderer.name(), handle, err);
                    }
                }
            }
            Err(err) => log::warn!("Dropping renderers without detach: {}", err),
        }
        log::info!("Destroyed {} renderer(s)", count);
    }

    // =========================================================================
    // FRAME LOOP
    // =========================================================================

    /// Wait for the current slot's previous submission, then let the active
    /// renderer update its per-slot state.
    pub fn update(&mut self) -> Result<FrameStatus> {
        self.check_frame_state("update")?;
        if self.rebuild_pending && !self.rebuild_swapchain()? {
            return Ok(FrameStatus::Skipped);
        }
        if self.built_swapchain("update")?.is_retired() {
            return Ok(FrameStatus::OutOfDate);
        }

        let waited = {
            let swapchain = self.built_swapchain("update")?;
            let slot = swapchain.current_slot();
            swapchain.wait_slot(slot, self.fence_timeout).map(|()| slot)
        };
        let slot = match waited {
            Ok(slot) => slot,
            Err(err) => return self.frame_error(err),
        };

        let (services, registry) = self.split("update")?;
        if let Some(renderer) = registry.active_mut() {
            if let Err(source) = renderer.update(slot, &services) {
                return Err(BackendError::Renderer {
                    name: renderer.name().to_string(),
                    source,
                });
            }
        }

        self.state = BackendState::Running;
        Ok(FrameStatus::Ready { slot })
    }

    /// Record, submit and present one frame.
    pub fn render(&mut self) -> Result<FrameStatus> {
        self.check_frame_state("render")?;
        if self.rebuild_pending && !self.rebuild_swapchain()? {
            return Ok(FrameStatus::Skipped);
        }
        if self.built_swapchain("render")?.is_retired() {
            return Ok(FrameStatus::OutOfDate);
        }

        // STEP 1: The slot's previous submission must be done before reuse
        let waited = {
            let swapchain = self.built_swapchain("render")?;
            let slot = swapchain.current_slot();
            swapchain.wait_slot(slot, self.fence_timeout).map(|()| slot)
        };
        let slot = match waited {
            Ok(slot) => slot,
            Err(err) => return self.frame_error(err),
        };

        // STEP 2: Acquire
        let acquired = self
            .built_swapchain("render")?
            .acquire_next_image(slot, self.acquire_timeout);
        let (image_index, acquire_suboptimal) = match acquired {
            Ok(acquired) => acquired,
            Err(err) => return self.frame_error(err),
        };

        // STEP 3: Record and submit. The fence is reset only once the batch is ready.
        let deferred = match self.record_and_submit(slot, image_index) {
            Ok(deferred) => deferred,
            Err(err) => return self.abandon_frame(slot, image_index, err),
        };

        // STEP 4: Present, then move on to the next slot whatever the outcome
        let presented = self.present_slot(slot, image_index);
        self.state = BackendState::Running;

        let status = match presented {
            Ok(suboptimal) => FrameStatus::Presented {
                slot,
                image_index,
                suboptimal: suboptimal || acquire_suboptimal,
            },
            Err(BackendError::SwapchainOutOfDate) => {
                log::debug!("Swapchain out of date at present");
                FrameStatus::OutOfDate
            }
            Err(err) => return self.frame_error(err),
        };

        if let Some(err) = deferred {
            return Err(err);
        }
        log::trace!("Frame {} presented: {:?}", self.frame_index, status);
        Ok(status)
    }

    /// Present the slot's image and advance to the next slot. Returns `true` when suboptimal.
    fn present_slot(&mut self, slot: usize, image_index: u32) -> Result<bool> {
        let presented = match (self.device.as_ref(), self.swapchain.as_ref()) {
            (Some(device), Some(swapchain)) => swapchain.present(device.graphics_queue(), slot, image_index),
            _ => Err(BackendError::invalid_state("present", self.state)),
        };
        if let Some(swapchain) = self.swapchain.as_mut() {
            swapchain.advance();
        }
        self.frame_index += 1;
        presented
    }

    /// Recording or submission failed after an image was acquired. An empty
    /// batch consumes the acquire semaphore and re-signals the slot fence, and
    /// the image goes back to the platform unchanged, so the slot stays usable.
    fn abandon_frame(&mut self, slot: usize, image_index: u32, err: BackendError) -> Result<FrameStatus> {
        if matches!(err, BackendError::DeviceLost) {
            return self.frame_error(err);
        }
        log::error!("Frame on slot {} failed, releasing the slot: {}", slot, err);

        let released = match self.submit_empty(slot) {
            Ok(()) => self.present_slot(slot, image_index).map(|_| ()),
            Err(release_err) => Err(release_err),
        };
        match released {
            Ok(()) | Err(BackendError::SwapchainOutOfDate) => Err(err),
            Err(BackendError::DeviceLost) => Err(self.latch(BackendError::DeviceLost)),
            Err(release_err) => {
                log::error!("Could not release frame slot {}: {}", slot, release_err);
                Err(err)
            }
        }
    }

    fn submit_empty(&self, slot: usize) -> Result<()> {
        let device = self.device_context("release frame slot")?;
        let swapchain = self.built_swapchain("release frame slot")?;
        let frame_slot = *swapchain
            .slot(slot)
            .ok_or_else(|| BackendError::invalid_parameter(format!("frame slot {}", slot)))?;

        swapchain.reset_slot_fence(slot)?;
        device.device()?.queue_submit(
            device.graphics_queue(),
            &Submission {
                command_buffers: &[],
                wait_semaphores: &[frame_slot.image_available],
                wait_stages: &[vk::PipelineStageFlags::ALL_COMMANDS],
                signal_semaphores: &[frame_slot.render_finished],
            },
            frame_slot.in_flight,
        )
    }

    /// Returns a renderer failure to report once the frame is presented.
    fn record_and_submit(&mut self, slot: usize, image_index: u32) -> Result<Option<BackendError>> {
        let clear_color = self.clear_color;
        let (services, registry) = self.split("render")?;
        let gpu = services.gpu()?;
        let swapchain = services.swapchain;

        let frame_slot = *swapchain
            .slot(slot)
            .ok_or_else(|| BackendError::invalid_parameter(format!("frame slot {}", slot)))?;
        let image = swapchain
            .image(image_index)
            .ok_or_else(|| BackendError::invalid_parameter(format!("swapchain image {}", image_index)))?;
        let view = swapchain.view(image_index).unwrap_or_default();

        let command_buffer = frame_slot.command_buffer;
        let frame = FrameContext {
            command_buffer,
            slot,
            image_index,
            image,
            view,
            extent: swapchain.extent(),
            format: swapchain.format().format,
            clear_color,
        };

        gpu.reset_command_buffer(command_buffer)?;
        gpu.begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        let mut deferred = None;
        match registry.active_mut() {
            Some(renderer) => {
                if let Err(source) = renderer.render(&frame, &services) {
                    let name = renderer.name().to_string();
                    log::error!("Renderer '{}' failed, presenting a clear frame: {:#}", name, source);
                    // Throw away whatever was recorded and keep the frame presentable
                    gpu.reset_command_buffer(command_buffer)?;
                    gpu.begin_command_buffer(command_buffer, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
                    gpu.cmd_clear_color_image(command_buffer, image, clear_color);
                    deferred = Some(BackendError::Renderer { name, source });
                }
            }
            None => gpu.cmd_clear_color_image(command_buffer, image, clear_color),
        }

        gpu.end_command_buffer(command_buffer)?;
        swapchain.reset_slot_fence(slot)?;

        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT | vk::PipelineStageFlags::TRANSFER];
        gpu.queue_submit(
            services.device.graphics_queue(),
            &Submission {
                command_buffers: &[command_buffer],
                wait_semaphores: &[frame_slot.image_available],
                wait_stages: &wait_stages,
                signal_semaphores: &[frame_slot.render_finished],
            },
            frame_slot.in_flight,
        )?;

        Ok(deferred)
    }

    /// Maps transient errors to statuses and latches device loss.
    fn frame_error(&mut self, err: BackendError) -> Result<FrameStatus> {
        match err {
            BackendError::SwapchainOutOfDate => {
                log::debug!("Swapchain out of date");
                Ok(FrameStatus::OutOfDate)
            }
            BackendError::DeviceTimeout { what, timeout } => {
                log::warn!("Timed out after {:?} waiting for {}", timeout, what);
                Ok(FrameStatus::Timeout)
            }
            BackendError::DeviceLost => {
                log::error!("Device lost, frame calls disabled until teardown");
                self.device_lost = true;
                Err(BackendError::DeviceLost)
            }
            other => Err(other),
        }
    }

    fn check_frame_state(&self, op: &'static str) -> Result<()> {
        if self.device_lost {
            return Err(BackendError::DeviceLost);
        }
        match self.state {
            BackendState::Built | BackendState::Running => Ok(()),
            state => Err(BackendError::invalid_state(op, state)),
        }
    }

    // =========================================================================
    // SWAPCHAIN
    // =========================================================================

    /// Re-create the swapchain for the target's current extent. Returns
    /// `false` when the extent is empty; the rebuild then happens on the
    /// first frame call after the target has a size again.
    pub fn rebuild_swapchain(&mut self) -> Result<bool> {
        self.check_frame_state("rebuild swapchain")?;

        let extent = self
            .config
            .as_ref()
            .map(|config| config.target.drawable_extent())
            .ok_or_else(|| BackendError::invalid_state("rebuild swapchain", self.state))?;
        if extent.width == 0 || extent.height == 0 {
            if !self.rebuild_pending {
                log::info!("Drawable area is empty, deferring swapchain rebuild");
            }
            self.rebuild_pending = true;
            return Ok(false);
        }

        let idle = self.device_context("rebuild swapchain")?.wait_idle();
        if let Err(err) = idle {
            return Err(self.latch(err));
        }

        let state = self.state;
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| BackendError::invalid_state("rebuild swapchain", state))?;
        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or_else(|| BackendError::invalid_state("rebuild swapchain", state))?;

        let old_buffers = swapchain.take_command_buffers();
        commands.free(QueuePurpose::Graphics, &old_buffers);

        // A failed rebuild retires the chain; frames report OutOfDate until one succeeds
        swapchain.rebuild(extent)?;

        let count = swapchain.slot_count() as u32;
        let attached = commands
            .allocate(QueuePurpose::Graphics, count, vk::CommandBufferLevel::PRIMARY)
            .and_then(|buffers| {
                swapchain.attach_command_buffers(&buffers).map_err(|err| {
                    commands.free(QueuePurpose::Graphics, &buffers);
                    err
                })
            });
        if let Err(err) = attached {
            // The slots have no command buffers; the next frame call rebuilds again
            log::error!("Frame command buffers not reattached after rebuild: {}", err);
            self.rebuild_pending = true;
            return Err(err);
        }

        self.rebuild_pending = false;
        log::info!("Swapchain rebuilt at {}x{}", extent.width, extent.height);
        Ok(true)
    }

    /// New format, present-mode preference and image count hint, applied by a rebuild.
    pub fn update_swapchain_settings(&mut self, settings: SwapchainSettings) -> Result<bool> {
        self.check_frame_state("update swapchain settings")?;
        if settings.image_count < 2 {
            return Err(BackendError::config(format!(
                "swapchain image count must be at least 2, got {}",
                settings.image_count
            )));
        }

        if let Some(config) = self.config.as_mut() {
            config.surface_format = settings.surface_format.format;
            config.present_modes = settings.present_modes.clone();
            config.image_count = settings.image_count;
        }
        self.built_swapchain_mut("update swapchain settings")?
            .set_settings(settings);
        self.rebuild_swapchain()
    }

    fn latch(&mut self, err: BackendError) -> BackendError {
        if matches!(err, BackendError::DeviceLost) {
            self.device_lost = true;
        }
        err
    }

    // =========================================================================
    // RENDERERS
    // =========================================================================

    /// Attach `renderer` to the built backend and take ownership of it.
    pub fn add_renderer(&mut self, mut renderer: Box<dyn Renderer>) -> Result<RendererHandle> {
        let (services, registry) = self.split("add renderer")?;
        if let Err(source) = renderer.attach(&services) {
            return Err(BackendError::Renderer {
                name: renderer.name().to_string(),
                source,
            });
        }
        let handle = registry.add(renderer);
        log::info!("Added renderer {}", handle);
        Ok(handle)
    }

    /// Detach and hand back a renderer. The active renderer cannot be removed.
    pub fn remove_renderer(&mut self, handle: RendererHandle) -> Result<Box<dyn Renderer>> {
        let (services, registry) = self.split("remove renderer")?;
        let mut renderer = registry.remove(handle)?;
        if let Err(err) = renderer.detach(&services) {
            log::warn!("Renderer '{}' failed to detach: {:#}", renderer.name(), err);
        }
        log::info!("Removed renderer {}", handle);
        Ok(renderer)
    }

    pub fn renderer(&self, handle: RendererHandle) -> Result<&dyn Renderer> {
        self.registry.get(handle)
    }

    pub fn renderer_mut(&mut self, handle: RendererHandle) -> Result<&mut dyn Renderer> {
        self.registry.get_mut(handle)
    }

    /// `None` makes render() a clear-only pass.
    pub fn set_active_renderer(&mut self, handle: Option<RendererHandle>) -> Result<()> {
        self.registry.set_active(handle)
    }

    pub fn active_renderer(&self) -> Option<RendererHandle> {
        self.registry.active()
    }

    pub fn registry(&self) -> &RendererRegistry {
        &self.registry
    }

    // =========================================================================
    // RESOURCES
    // =========================================================================

    /// Host-visible parameter buffer with a CPU cache, owned by the caller.
    pub fn create_param_block(&self, size: usize, usage: vk::BufferUsageFlags) -> Result<ParamBlock> {
        self.services("create param block")?.create_param_block(size, usage)
    }

    pub fn flush_param_block(&self, block: &mut ParamBlock) -> Result<()> {
        block.flush_to_gpu(self.allocator()?)
    }

    pub fn release_param_block(&self, block: &mut ParamBlock) -> Result<()> {
        block.release(self.allocator()?)
    }

    /// Borrowed view of the built stages, as renderers see it.
    pub fn services(&self, op: &'static str) -> Result<BackendServices<'_>> {
        let missing = || BackendError::invalid_state(op, self.state);
        Ok(BackendServices {
            device: self.device.as_ref().ok_or_else(missing)?,
            swapchain: self.swapchain.as_ref().ok_or_else(missing)?,
            allocator: self.allocator.as_ref().ok_or_else(missing)?,
            descriptors: self.descriptors.as_ref().ok_or_else(missing)?,
            contract: self.contract,
        })
    }

    /// Services plus the registry, borrowed at the same time.
    fn split(&mut self, op: &'static str) -> Result<(BackendServices<'_>, &mut RendererRegistry)> {
        let state = self.state;
        let missing = || BackendError::invalid_state(op, state);
        let services = BackendServices {
            device: self.device.as_ref().ok_or_else(missing)?,
            swapchain: self.swapchain.as_ref().ok_or_else(missing)?,
            allocator: self.allocator.as_ref().ok_or_else(missing)?,
            descriptors: self.descriptors.as_ref().ok_or_else(missing)?,
            contract: self.contract,
        };
        Ok((services, &mut self.registry))
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn kind(&self) -> BackendKind {
        self.platform.kind()
    }

    pub fn config(&self) -> Option<&BackendConfig> {
        self.config.as_ref()
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    pub fn is_rebuild_pending(&self) -> bool {
        self.rebuild_pending
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    /// Used by clear-only frames and handed to renderers in the FrameContext.
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.clear_color = color;
        if let Some(config) = self.config.as_mut() {
            config.clear_color = color;
        }
    }

    pub fn device_context(&self, op: &'static str) -> Result<&DeviceContext> {
        self.device
            .as_ref()
            .ok_or_else(|| BackendError::invalid_state(op, self.state))
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    pub fn command_pools(&self) -> Option<&CommandPoolSet> {
        self.commands.as_ref()
    }

    pub fn descriptor_pool(&self) -> Option<&DescriptorPool> {
        self.descriptors.as_ref()
    }

    pub fn allocator(&self) -> Result<&ResourceAllocator> {
        self.allocator
            .as_ref()
            .ok_or_else(|| BackendError::invalid_state("use allocator", self.state))
    }

    fn built_swapchain(&self, op: &'static str) -> Result<&Swapchain> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| BackendError::invalid_state(op, self.state))
    }

    fn built_swapchain_mut(&mut self, op: &'static str) -> Result<&mut Swapchain> {
        let state = self.state;
        self.swapchain
            .as_mut()
            .ok_or_else(|| BackendError::invalid_state(op, state))
    }
}

impl Drop for GraphicsBackend {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessTarget, ObjectKind};
    use std::sync::Arc;

    fn headless() -> (GraphicsBackend, Arc<crate::backend::HeadlessProbe>) {
        let platform = HeadlessPlatform::default();
        let probe = platform.probe();
        (GraphicsBackend::new(Box::new(platform)), probe)
    }

    fn config() -> BackendConfig {
        let mut config = BackendConfig::new(Arc::new(HeadlessTarget::new(640, 480)));
        config.contract_mode = ContractMode::Report;
        config
    }

    #[test]
    fn frame_calls_before_build_are_rejected() {
        let (mut backend, _probe) = headless();
        assert!(matches!(backend.render(), Err(BackendError::InvalidState { op: "render", .. })));
        assert!(matches!(backend.update(), Err(BackendError::InvalidState { .. })));
        assert!(backend.create_param_block(16, vk::BufferUsageFlags::UNIFORM_BUFFER).is_err());
    }

    #[test]
    fn build_twice_is_rejected() {
        let (mut backend, _probe) = headless();
        backend.build(config()).unwrap();
        assert!(matches!(backend.build(config()), Err(BackendError::InvalidState { op: "build", .. })));
        assert_eq!(backend.state(), BackendState::Built);
    }

    #[test]
    fn init_only_enumerates() {
        let (backend, probe) = headless();
        let devices = backend.init().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(probe.live_objects(), 0);
        assert_eq!(backend.state(), BackendState::Created);
    }

    #[test]
    fn teardown_is_idempotent() {
        let (mut backend, probe) = headless();
        backend.build(config()).unwrap();
        backend.teardown();
        backend.teardown();
        assert_eq!(backend.state(), BackendState::Destroyed);
        assert_eq!(probe.live_objects(), 0);
        assert_eq!(probe.live(ObjectKind::Device), 0);
        assert!(probe.violations().is_empty(), "{:?}", probe.violations());
    }

    #[test]
    fn clear_only_frame_uses_clear_color() {
        let (mut backend, probe) = headless();
        backend.build(config()).unwrap();
        backend.set_clear_color([1.0, 0.0, 0.0, 1.0]);

        let status = backend.render().unwrap();
        assert!(matches!(status, FrameStatus::Presented { slot: 0, image_index: 0, suboptimal: false }));
        assert!(probe.calls().iter().any(|call| matches!(
            call,
            crate::backend::GpuCall::ClearColorImage { color, .. } if *color == [1.0, 0.0, 0.0, 1.0]
        )));
    }

    #[test]
    fn update_reports_current_slot() {
        let (mut backend, _probe) = headless();
        backend.build(config()).unwrap();
        assert_eq!(backend.update().unwrap(), FrameStatus::Ready { slot: 0 });
        backend.render().unwrap();
        assert_eq!(backend.update().unwrap(), FrameStatus::Ready { slot: 1 });
        assert_eq!(backend.state(), BackendState::Running);
    }
}
