// =============================================================================
// MIX-GFX - rendering backend
// =============================================================================
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  GraphicsBackend (build order, frame loop, teardown)            │
// │    ├── RendererRegistry (pluggable renderers, handles)          │
// │    └── backend components                                       │
// │          └── GpuDevice seam: Vulkan (ash) or headless           │
// └─────────────────────────────────────────────────────────────────┘
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod graphics;
pub mod renderer;

pub use config::{BackendConfig, Config};
pub use error::{BackendError, ContractMode, Result};
pub use graphics::{BackendState, FrameStatus, GraphicsBackend};
pub use renderer::{BackendServices, FrameContext, Renderer, RendererHandle, RendererRegistry};
