//! Hardware overlay composition core for GPU-integrated SoCs
//!
//! This library implements the display-engine side of an embedded
//! compositor: vsync source arbitration across multiple physical pipes,
//! hot-plug and dynamic mode-set orchestration for an external display,
//! DRM resource caching with deterministic mode selection, cross-process
//! overlay buffer management, and the polyphase scaler coefficient
//! computation for the overlay engine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Windowing server                           │
//! │        (hotplug / vsync / invalidate callbacks)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!            vsync_control / hotplug / post_frame
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Composer                              │
//! │  ┌──────────────┐ ┌───────────────┐ ┌────────────────────┐  │
//! │  │ Hotplug      │ │ VsyncSource   │ │ OverlayPosting     │  │
//! │  │ Orchestrator │ │ Controller    │ │ Pipeline           │  │
//! │  └──────┬───────┘ └───────┬───────┘ └─────────┬──────────┘  │
//! │  ┌──────┴───────────┐ ┌───┴────────┐ ┌────────┴──────────┐  │
//! │  │ DisplayResource  │ │ software   │ │ Scaler / Buffers  │  │
//! │  │ Cache            │ │ fallback   │ │ / SharedContext   │  │
//! │  └──────────────────┘ └────────────┘ └───────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              DisplayDevice / GpuAllocator traits
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Display engine (mode-set, vsync, overlay regs)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use overlay_composer::{Composer, ComposerConfig};
//!
//! let composer = Composer::new(device, gpu, sink, ComposerConfig::default())?;
//! composer.vsync_control(true);
//! // drive hotplug / post_frame from the windowing server...
//! composer.shutdown()?;
//! ```

pub mod backend;
pub mod buffers;
pub mod composer;
pub mod config;
pub mod error;
pub mod fake;
pub mod hotplug;
pub mod modes;
pub mod post;
pub mod scaler;
pub mod shared;
pub mod vsync;

pub use backend::{DisplayDevice, DisplayMode, EventSink, GpuAllocator, Output, Pipe, Rect};
pub use composer::Composer;
pub use config::ComposerConfig;
pub use error::Error;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;
