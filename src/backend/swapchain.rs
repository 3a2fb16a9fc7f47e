// Swapchain - Window presentation
//
// Owns the chain of presentable images, their views and one FrameSlot per
// image. Rebuilding creates the new chain against the old handle before the
// old one is released.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::gpu::{GpuDevice, SurfaceSupport, SwapchainDesc};
use super::sync::FrameSlot;
use crate::error::{BackendError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Built,
    Rebuilding,
    /// A rebuild failed after the chain was handed to the platform as the old
    /// swapchain. Images can no longer be acquired; only a rebuild recovers.
    Retired,
    Destroyed,
}

impl std::fmt::Display for SwapchainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What the caller asks for; the platform decides what it gets.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapchainSettings {
    pub surface_format: vk::SurfaceFormatKHR,
    /// Tried in order, FIFO when none is supported.
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub image_count: u32,
}

/// The per-build part of a swapchain, replaced wholesale on rebuild.
struct Chain {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    slots: Vec<FrameSlot>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
}

impl Chain {
    fn destroy(self, device: &dyn GpuDevice) {
        for slot in &self.slots {
            slot.destroy(device);
        }
        for &view in &self.views {
            device.destroy_image_view(view);
        }
        if self.handle != vk::SwapchainKHR::null() {
            device.destroy_swapchain(self.handle);
        }
    }
}

pub struct Swapchain {
    device: Arc<dyn GpuDevice>,
    surface: vk::SurfaceKHR,
    settings: SwapchainSettings,
    chain: Option<Chain>,
    current_slot: usize,
    state: SwapchainState,
}

impl Swapchain {
    pub fn new(device: Arc<dyn GpuDevice>, surface: vk::SurfaceKHR, settings: SwapchainSettings) -> Self {
        Self {
            device,
            surface,
            settings,
            chain: None,
            current_slot: 0,
            state: SwapchainState::Uninitialized,
        }
    }

    pub fn build(&mut self, extent: vk::Extent2D) -> Result<()> {
        if self.state != SwapchainState::Uninitialized {
            return Err(BackendError::invalid_state("build swapchain", self.state));
        }

        let chain = self.create_chain(extent, vk::SwapchainKHR::null())?;
        self.log_chain("Created", &chain);
        self.chain = Some(chain);
        self.current_slot = 0;
        self.state = SwapchainState::Built;
        Ok(())
    }

    /// Re-create the chain for a new extent. Frame command buffers must have
    /// been taken off the slots and the device must be idle.
    ///
    /// On failure the previous chain is retired: it is kept only so its
    /// objects can be released, and frame operations report out-of-date.
    pub fn rebuild(&mut self, extent: vk::Extent2D) -> Result<()> {
        let old_handle = match self.state {
            SwapchainState::Built => self
                .chain
                .as_ref()
                .map(|chain| chain.handle)
                .unwrap_or_else(vk::SwapchainKHR::null),
            SwapchainState::Retired => {
                // A retired chain cannot seed the next one
                if let Some(old) = self.chain.take() {
                    old.destroy(self.device.as_ref());
                }
                vk::SwapchainKHR::null()
            }
            state => return Err(BackendError::invalid_state("rebuild swapchain", state)),
        };
        self.state = SwapchainState::Rebuilding;

        match self.create_chain(extent, old_handle) {
            Ok(chain) => {
                if let Some(old) = self.chain.replace(chain) {
                    old.destroy(self.device.as_ref());
                }
                if let Some(chain) = &self.chain {
                    self.log_chain("Rebuilt", chain);
                }
                self.current_slot = 0;
                self.state = SwapchainState::Built;
                Ok(())
            }
            Err(err) => {
                log::error!("Swapchain rebuild failed, previous chain retired: {}", err);
                self.current_slot = 0;
                self.state = SwapchainState::Retired;
                Err(err)
            }
        }
    }

    fn create_chain(&self, requested: vk::Extent2D, old_swapchain: vk::SwapchainKHR) -> Result<Chain> {
        let device = self.device.as_ref();
        let support = device.surface_support(self.surface)?;
        let SurfaceSupport {
            capabilities,
            formats,
            present_modes,
        } = &support;

        let image_count = requested_image_count(self.settings.image_count, capabilities)?;
        let format = choose_surface_format(formats, self.settings.surface_format)?;
        let present_mode = choose_present_mode(present_modes, &self.settings.present_modes);
        let extent = choose_extent(capabilities, requested);

        let handle = device.create_swapchain(&SwapchainDesc {
            surface: self.surface,
            image_count,
            format,
            extent,
            present_mode,
            pre_transform: capabilities.current_transform,
            old_swapchain,
        })?;

        let mut chain = Chain {
            handle,
            images: Vec::new(),
            views: Vec::new(),
            slots: Vec::new(),
            format,
            present_mode,
            extent,
        };

        if let Err(err) = self.populate(&mut chain) {
            chain.destroy(device);
            return Err(err);
        }
        Ok(chain)
    }

    fn populate(&self, chain: &mut Chain) -> Result<()> {
        let device = self.device.as_ref();
        chain.images = device.swapchain_images(chain.handle)?;

        let granted = chain.images.len() as u32;
        if granted < self.settings.image_count {
            return Err(BackendError::config(format!(
                "platform granted {} swapchain images, {} requested",
                granted, self.settings.image_count
            )));
        }

        for &image in &chain.images {
            chain.views.push(device.create_image_view(image, chain.format.format)?);
        }
        for _ in 0..chain.images.len() {
            chain.slots.push(FrameSlot::new(device)?);
        }
        Ok(())
    }

    fn log_chain(&self, verb: &str, chain: &Chain) {
        log::info!(
            "{} swapchain: {} images, {}x{}, {:?}, {:?}",
            verb,
            chain.images.len(),
            chain.extent.width,
            chain.extent.height,
            chain.format.format,
            chain.present_mode
        );
    }

    fn built_chain(&self, op: &'static str) -> Result<&Chain> {
        match (&self.chain, self.state) {
            (Some(chain), SwapchainState::Built) => Ok(chain),
            _ => Err(BackendError::invalid_state(op, self.state)),
        }
    }

    fn slot_ref(&self, op: &'static str, slot: usize) -> Result<&FrameSlot> {
        let chain = self.built_chain(op)?;
        chain.slots.get(slot).ok_or_else(|| {
            BackendError::invalid_parameter(format!("frame slot {} of {}", slot, chain.slots.len()))
        })
    }

    // =========================================================================
    // FRAME OPERATIONS
    // =========================================================================

    /// Block until the slot's previous submission has finished.
    pub fn wait_slot(&self, slot: usize, timeout: Duration) -> Result<()> {
        let fence = self.slot_ref("wait on frame slot", slot)?.in_flight;
        self.device.wait_for_fence(fence, timeout)
    }

    pub fn reset_slot_fence(&self, slot: usize) -> Result<()> {
        let fence = self.slot_ref("reset frame slot", slot)?.in_flight;
        self.device.reset_fence(fence)
    }

    /// Signals the slot's image-available semaphore. Returns `(image_index, suboptimal)`.
    pub fn acquire_next_image(&self, slot: usize, timeout: Duration) -> Result<(u32, bool)> {
        if self.state == SwapchainState::Retired {
            return Err(BackendError::SwapchainOutOfDate);
        }
        let chain = self.built_chain("acquire swapchain image")?;
        let semaphore = self.slot_ref("acquire swapchain image", slot)?.image_available;
        self.device.acquire_next_image(chain.handle, semaphore, timeout)
    }

    /// Waits on the slot's render-finished semaphore. Returns `true` when suboptimal.
    pub fn present(&self, queue: vk::Queue, slot: usize, image_index: u32) -> Result<bool> {
        if self.state == SwapchainState::Retired {
            return Err(BackendError::SwapchainOutOfDate);
        }
        let chain = self.built_chain("present")?;
        let semaphore = self.slot_ref("present", slot)?.render_finished;
        self.device
            .queue_present(queue, chain.handle, image_index, &[semaphore])
    }

    /// Move to the next slot, wrapping at the image count.
    pub fn advance(&mut self) -> usize {
        let count = self.slot_count().max(1);
        self.current_slot = (self.current_slot + 1) % count;
        self.current_slot
    }

    // =========================================================================
    // COMMAND BUFFER ATTACHMENT
    // =========================================================================

    pub fn attach_command_buffers(&mut self, buffers: &[vk::CommandBuffer]) -> Result<()> {
        let chain = self
            .chain
            .as_mut()
            .ok_or_else(|| BackendError::invalid_state("attach command buffers", self.state))?;
        if buffers.len() != chain.slots.len() {
            return Err(BackendError::invalid_parameter(format!(
                "{} command buffers for {} frame slots",
                buffers.len(),
                chain.slots.len()
            )));
        }
        for (slot, &buffer) in chain.slots.iter_mut().zip(buffers) {
            slot.command_buffer = buffer;
        }
        Ok(())
    }

    /// Detach every slot's command buffer, returning the non-null ones.
    pub fn take_command_buffers(&mut self) -> Vec<vk::CommandBuffer> {
        let Some(chain) = self.chain.as_mut() else {
            return Vec::new();
        };
        chain
            .slots
            .iter_mut()
            .map(|slot| std::mem::replace(&mut slot.command_buffer, vk::CommandBuffer::null()))
            .filter(|buffer| *buffer != vk::CommandBuffer::null())
            .collect()
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn is_retired(&self) -> bool {
        self.state == SwapchainState::Retired
    }

    pub fn settings(&self) -> &SwapchainSettings {
        &self.settings
    }

    /// Takes effect on the next rebuild.
    pub fn set_settings(&mut self, settings: SwapchainSettings) {
        self.settings = settings;
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.chain
            .as_ref()
            .map(|chain| chain.handle)
            .unwrap_or_else(vk::SwapchainKHR::null)
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.chain.as_ref().and_then(|chain| chain.slots.get(index))
    }

    pub fn slots(&self) -> &[FrameSlot] {
        self.chain.as_ref().map(|chain| chain.slots.as_slice()).unwrap_or(&[])
    }

    pub fn slot_count(&self) -> usize {
        self.slots().len()
    }

    pub fn image_count(&self) -> usize {
        self.chain.as_ref().map(|chain| chain.images.len()).unwrap_or(0)
    }

    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.chain
            .as_ref()
            .and_then(|chain| chain.images.get(index as usize).copied())
    }

    pub fn view(&self, index: u32) -> Option<vk::ImageView> {
        self.chain
            .as_ref()
            .and_then(|chain| chain.views.get(index as usize).copied())
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.chain.as_ref().map(|chain| chain.format).unwrap_or_default()
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.chain
            .as_ref()
            .map(|chain| chain.present_mode)
            .unwrap_or(vk::PresentModeKHR::FIFO)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.chain.as_ref().map(|chain| chain.extent).unwrap_or_default()
    }

    /// Release the chain. The device must be idle. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if let Some(chain) = self.chain.take() {
            log::info!("Destroying swapchain ({} images)", chain.images.len());
            chain.destroy(self.device.as_ref());
        }
        self.state = SwapchainState::Destroyed;
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy();
    }
}

// =============================================================================
// SELECTION RULES
// =============================================================================

/// `max(hint, caps.min)` clamped to `caps.max` (0 means unbounded).
pub fn requested_image_count(hint: u32, caps: &vk::SurfaceCapabilitiesKHR) -> Result<u32> {
    if hint < 2 {
        return Err(BackendError::config(format!(
            "swapchain image count must be at least 2, got {}",
            hint
        )));
    }
    let mut count = hint.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count = count.min(caps.max_image_count);
    }
    Ok(count)
}

pub fn choose_surface_format(
    supported: &[vk::SurfaceFormatKHR],
    desired: vk::SurfaceFormatKHR,
) -> Result<vk::SurfaceFormatKHR> {
    supported
        .iter()
        .find(|f| f.format == desired.format && f.color_space == desired.color_space)
        .or_else(|| supported.first())
        .copied()
        .ok_or_else(|| BackendError::config("surface reports no supported formats"))
}

pub fn choose_present_mode(supported: &[vk::PresentModeKHR], preferred: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    preferred
        .iter()
        .copied()
        .find(|mode| supported.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO) // FIFO is always supported
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: requested
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}
