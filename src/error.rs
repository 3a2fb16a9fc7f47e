// Error taxonomy for the rendering backend
//
// Configuration and device errors fail build(), transient conditions are
// surfaced as FrameStatus values by the facade, contract violations are
// logged and rejected (and asserted when ContractMode::Assert is active).

use ash::vk;
use std::time::Duration;

use crate::renderer::RendererHandle;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("device error: {0}")]
    Device(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid renderer handle {0}")]
    InvalidHandle(RendererHandle),

    #[error("renderer {0} is active and cannot be removed")]
    ActiveRenderer(RendererHandle),

    #[error("swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("timed out after {timeout:?} waiting for {what}")]
    DeviceTimeout { what: &'static str, timeout: Duration },

    #[error("device lost")]
    DeviceLost,

    #[error("access out of bounds: offset {offset} + size {size} exceeds {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        size: usize,
        capacity: usize,
    },

    #[error("{0} exhausted")]
    PoolExhausted(&'static str),

    #[error("cannot {op} while backend is {state}")]
    InvalidState { op: &'static str, state: String },

    #[error("vulkan call failed: {0}")]
    Vulkan(vk::Result),

    #[error("failed to load Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("renderer '{name}' failed: {source}")]
    Renderer {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl BackendError {
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub fn invalid_state(op: &'static str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            op,
            state: state.to_string(),
        }
    }

    /// True for conditions the caller may retry after a swapchain rebuild or a later frame.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SwapchainOutOfDate | Self::DeviceTimeout { .. }
        )
    }
}

impl From<vk::Result> for BackendError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Vulkan(other),
        }
    }
}

/// How caller contract violations (bad handles, out-of-range access) are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractMode {
    /// Log the violation and reject the operation.
    Report,
    /// Log, then panic.
    Assert,
}

impl Default for ContractMode {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            ContractMode::Assert
        } else {
            ContractMode::Report
        }
    }
}

impl ContractMode {
    /// Logs a contract violation and hands the error back for the caller to return.
    pub(crate) fn violation(self, err: BackendError) -> BackendError {
        log::error!("Contract violation: {}", err);
        if self == ContractMode::Assert {
            panic!("contract violation: {}", err);
        }
        err
    }
}
