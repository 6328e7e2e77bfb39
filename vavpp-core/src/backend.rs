//! # Video Processing Backend Interface
//!
//! Abstraction over a hardware video-processing API with a filter pipeline
//! model (VA-API `VAEntrypointVideoProc`). The pipeline code only talks to
//! these traits; `vaapi.rs` implements them on top of libva and `mock.rs`
//! in memory.
//!
//! Object lifetimes follow the hardware API:
//! - config → context → filter buffers, destroyed in reverse order
//! - per picture: `begin_picture` → `create_pipeline_buffer` →
//!   `render_picture` → `end_picture`, then `destroy_buffer` on the
//!   transient parameter buffer

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::surface::{ColorSpace, Frame, ImageFormat, Surface, SurfaceId};

// ============================================================================
// Object Handles
// ============================================================================

macro_rules! backend_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub const INVALID: $name = $name(0xFFFF_FFFF);

            pub fn is_valid(self) -> bool {
                self != Self::INVALID
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{:x})", stringify!($name), self.0)
            }
        }
    };
}

backend_id!(
    /// Video-processing configuration object
    ConfigId
);
backend_id!(
    /// Video-processing context object
    ContextId
);
backend_id!(
    /// Filter or pipeline parameter buffer
    BufferId
);

// ============================================================================
// Filters and Capabilities
// ============================================================================

/// Filter types a backend may advertise. Only deinterlacing is used by the
/// pipeline, the rest are recognised so they can be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterType {
    NoiseReduction,
    Deinterlacing,
    Sharpening,
    ColorBalance,
    SkinToneEnhancement,
    TotalColorCorrection,
    Other(i32),
}

/// Deinterlacing algorithms understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeintAlgorithm {
    None,
    Bob,
    Weave,
    MotionAdaptive,
    MotionCompensated,
}

bitflags! {
    /// Per-picture flags of the deinterlacing filter buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeintFlags: u32 {
        const BOTTOM_FIELD_FIRST = 0x0001;
        const BOTTOM_FIELD = 0x0002;
        const ONE_FIELD = 0x0004;
    }
}

/// Parameters for a filter buffer at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterParams {
    Deinterlacing { algorithm: DeintAlgorithm, flags: DeintFlags },
}

impl FilterParams {
    pub fn filter_type(&self) -> FilterType {
        match self {
            Self::Deinterlacing { .. } => FilterType::Deinterlacing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorStandard {
    None,
    Bt601,
    Bt709,
    Bt470m,
    Bt470bg,
    Smpte170m,
    Smpte240m,
    GenericFilm,
    Srgb,
    Stryrgb,
    Xvycc601,
    Xvycc709,
    Bt2020,
    Explicit,
}

/// Result of a pipeline capability query for a given filter chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCaps {
    pub input_color_standards: Vec<ColorStandard>,
    pub output_color_standards: Vec<ColorStandard>,
    pub num_forward_references: u32,
    pub num_backward_references: u32,
}

// ============================================================================
// Render Requests
// ============================================================================

/// Which part of the source picture to process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PictureField {
    Frame,
    Top,
    Bottom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

impl Rect {
    pub fn of_size(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width: width.min(u16::MAX as u32) as u16,
            height: height.min(u16::MAX as u32) as u16,
        }
    }
}

/// Everything needed to process one output picture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderRequest {
    pub source: SurfaceId,
    pub destination: SurfaceId,
    pub source_region: Rect,
    pub output_region: Rect,
    pub field: PictureField,
    pub colorspace: ColorSpace,
    pub filters: Vec<BufferId>,
    pub forward_references: Vec<SurfaceId>,
    pub backward_references: Vec<SurfaceId>,
}

// ============================================================================
// Traits
// ============================================================================

/// Description of a destination surface pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDesc {
    /// Layout of the surface contents
    pub sw_format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Pool of device surfaces for upload and render targets.
pub trait SurfacePool {
    /// Take a free surface, growing the pool if the backend allows it.
    fn alloc(&mut self) -> Result<Surface, BackendError>;

    /// Copy a software frame into `dst`.
    fn upload(&mut self, dst: &Surface, src: &Frame) -> Result<(), BackendError>;

    fn desc(&self) -> PoolDesc;
}

/// Hardware video-processing backend.
pub trait VppBackend {
    type Pool: SurfacePool;

    fn name(&self) -> &str;

    fn create_config(&mut self) -> Result<ConfigId, BackendError>;
    fn destroy_config(&mut self, config: ConfigId);
    fn create_context(&mut self, config: ConfigId) -> Result<ContextId, BackendError>;
    fn destroy_context(&mut self, context: ContextId);

    /// Filter types the context supports.
    fn query_filters(&mut self, context: ContextId) -> Result<Vec<FilterType>, BackendError>;

    /// Deinterlacing algorithms the context supports.
    fn query_deinterlace_caps(&mut self, context: ContextId) -> Result<Vec<DeintAlgorithm>, BackendError>;

    fn create_filter_buffer(&mut self, context: ContextId, params: &FilterParams) -> Result<BufferId, BackendError>;

    /// Rewrite the per-picture flags of a deinterlacing filter buffer.
    fn update_deinterlace_flags(&mut self, buffer: BufferId, flags: DeintFlags) -> Result<(), BackendError>;

    /// Reference counts and colour standards for a filter chain.
    fn query_pipeline_caps(&mut self, context: ContextId, filters: &[BufferId]) -> Result<PipelineCaps, BackendError>;

    fn begin_picture(&mut self, context: ContextId, target: SurfaceId) -> Result<(), BackendError>;

    /// Create the transient pipeline parameter buffer for one request.
    fn create_pipeline_buffer(&mut self, context: ContextId, request: &RenderRequest) -> Result<BufferId, BackendError>;

    fn render_picture(&mut self, context: ContextId, buffers: &[BufferId]) -> Result<(), BackendError>;
    fn end_picture(&mut self, context: ContextId) -> Result<(), BackendError>;
    fn destroy_buffer(&mut self, buffer: BufferId);

    fn create_pool(&mut self, desc: PoolDesc) -> Result<Self::Pool, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_clamps_to_u16() {
        let r = Rect::of_size(100_000, 480);
        assert_eq!(r.width, u16::MAX);
        assert_eq!(r.height, 480);
        assert_eq!((r.x, r.y), (0, 0));
    }

    #[test]
    fn invalid_handles() {
        assert!(!BufferId::INVALID.is_valid());
        assert!(ContextId(1).is_valid());
        assert_eq!(format!("{:?}", ConfigId(16)), "ConfigId(0x10)");
    }
}
