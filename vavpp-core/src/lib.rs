//! # VAVPP Core
//!
//! Hardware video post-processing (deinterlacing) on top of a filter
//! pipeline backend such as VA-API's `VAEntrypointVideoProc`.

// ============================================================================
// Frames and Options
// ============================================================================
pub mod error;
pub mod surface;
pub mod config;

// ============================================================================
// Backends
// ============================================================================
pub mod backend;
pub mod mock;
#[cfg(feature = "vaapi")]
pub mod vaapi;

// ============================================================================
// Pipeline
// ============================================================================
pub mod refqueue;
pub mod negotiate;
pub mod render;
pub mod filter;

pub use backend::{SurfacePool, VppBackend};
pub use config::{DeintMode, DeintOptions};
pub use error::{BackendError, VppError};
pub use filter::VppFilter;
pub use surface::{ColorSpace, FieldFlags, Frame, ImageFormat, SoftwareImage, StreamParams, Surface, SurfaceId};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
