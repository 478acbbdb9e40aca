// =============================================================================
// WYVERN - Vulkan rendering backend for a small real-time engine
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Application<G: Game> (winit loop, input, timing)               │
// │    └── Renderer (RenderPacket per frame)                        │
// │          └── VulkanBackend                                      │
// │                ├── FrameLoop (fences, images in flight, resize) │
// │                └── VulkanContext                                │
// │                      ├── Device + Swapchain + Render Pass       │
// │                      ├── Command Buffers (one per image)        │
// │                      └── Semaphores (per slot / per image)      │
// └─────────────────────────────────────────────────────────────────┘

pub mod app;
pub mod backend;
pub mod config;
pub mod renderer;
pub mod window;

pub use app::{Application, Game};
pub use config::Config;
pub use renderer::{RenderPacket, Renderer};
