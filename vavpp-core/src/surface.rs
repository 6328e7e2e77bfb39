//! # Surfaces and Frames
//!
//! A `SurfaceId` names one device-resident frame buffer. Surfaces are owned by
//! a pool (see `backend::SurfacePool`); the pipeline only holds reference
//! counted `Surface` leases which hand the id back to the pool when the last
//! frame referencing them goes away.
//!
//! ```text
//! ┌──────────────┐  alloc()   ┌─────────────────┐
//! │ SurfacePool  │──────────►│ Arc<Surface>    │──► Frame ──► clone() (zero copy)
//! │ (free list)  │◄──────────│ drop → recycle  │
//! └──────────────┘            └─────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ============================================================================
// Surface Identity
// ============================================================================

/// Opaque identity of a hardware surface.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceId(pub u32);

impl SurfaceId {
    /// Same value as `VA_INVALID_SURFACE`.
    pub const INVALID: SurfaceId = SurfaceId(0xFFFF_FFFF);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for SurfaceId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "0x{:x}", self.0)
        } else {
            f.write_str("INVALID")
        }
    }
}

/// Receives surface ids back when their last lease is dropped.
pub trait SurfaceRecycler: Send + Sync {
    fn recycle(&self, id: SurfaceId);
}

/// A leased hardware surface.
pub struct Surface {
    id: SurfaceId,
    width: u32,
    height: u32,
    owner: Option<Arc<dyn SurfaceRecycler>>,
}

impl Surface {
    pub fn new(id: SurfaceId, width: u32, height: u32, owner: Arc<dyn SurfaceRecycler>) -> Self {
        Self {
            id,
            width,
            height,
            owner: Some(owner),
        }
    }

    /// A surface not backed by any pool, e.g. imported from a decoder.
    pub fn unpooled(id: SurfaceId, width: u32, height: u32) -> Self {
        Self {
            id,
            width,
            height,
            owner: None,
        }
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    /// Allocated size, which may exceed the visible frame size.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.recycle(self.id);
        }
    }
}

// ============================================================================
// Stream Parameters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormat {
    /// Opaque VA-API surface
    Vaapi,
    /// 4:2:0 semi-planar (Y plane + interleaved UV)
    Nv12,
    /// 4:2:0 planar (Y + U + V)
    Yuv420p,
}

impl ImageFormat {
    pub fn is_hardware(self) -> bool {
        self == Self::Vaapi
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    #[default]
    Auto,
    Bt601,
    Bt709,
    Smpte240m,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamParams {
    pub format: ImageFormat,
    /// Software layout of the surface contents for hardware formats.
    pub hw_subformat: Option<ImageFormat>,
    pub width: u32,
    pub height: u32,
    pub colorspace: ColorSpace,
    /// Full allocated size of the upstream surface pool (hardware input only).
    pub hw_surface_size: Option<(u32, u32)>,
}

impl StreamParams {
    pub fn software(format: ImageFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            hw_subformat: None,
            width,
            height,
            colorspace: ColorSpace::Auto,
            hw_surface_size: None,
        }
    }

    pub fn hardware(width: u32, height: u32, surface_width: u32, surface_height: u32) -> Self {
        Self {
            format: ImageFormat::Vaapi,
            hw_subformat: Some(ImageFormat::Nv12),
            width,
            height,
            colorspace: ColorSpace::Auto,
            hw_surface_size: Some((surface_width, surface_height)),
        }
    }
}

// ============================================================================
// Frames
// ============================================================================

bitflags! {
    /// Interlacing flags carried by every frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FieldFlags: u8 {
        const INTERLACED = 0x01;
        const TOP_FIRST = 0x02;
        const REPEAT_FIRST = 0x04;
    }
}

/// Planar software image waiting for upload.
#[derive(Debug, Clone)]
pub struct SoftwareImage {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// One entry per plane (Y, UV for NV12; Y, U, V for 4:2:0 planar).
    pub planes: Vec<Bytes>,
    pub strides: Vec<usize>,
}

impl SoftwareImage {
    /// Tightly packed image with every byte of each plane set to `fill`.
    pub fn filled(format: ImageFormat, width: u32, height: u32, fill: u8) -> Self {
        let w = width as usize;
        let h = height as usize;
        let chroma_h = h.div_ceil(2);
        let (planes, strides) = match format {
            ImageFormat::Nv12 => (
                vec![Bytes::from(vec![fill; w * h]), Bytes::from(vec![fill; w * chroma_h])],
                vec![w, w],
            ),
            _ => {
                let cw = w.div_ceil(2);
                (
                    vec![
                        Bytes::from(vec![fill; w * h]),
                        Bytes::from(vec![fill; cw * chroma_h]),
                        Bytes::from(vec![fill; cw * chroma_h]),
                    ],
                    vec![w, cw, cw],
                )
            }
        };
        Self {
            format,
            width,
            height,
            planes,
            strides,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FrameData {
    Surface(Arc<Surface>),
    Software(Arc<SoftwareImage>),
}

/// A video frame flowing through the filter. Cloning shares the underlying
/// surface or image.
#[derive(Debug, Clone)]
pub struct Frame {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub colorspace: ColorSpace,
    /// Presentation time in seconds
    pub pts: Option<f64>,
    pub fields: FieldFlags,
    pub data: FrameData,
}

impl Frame {
    pub fn from_surface(surface: Arc<Surface>, width: u32, height: u32) -> Self {
        Self {
            format: ImageFormat::Vaapi,
            width,
            height,
            colorspace: ColorSpace::Auto,
            pts: None,
            fields: FieldFlags::empty(),
            data: FrameData::Surface(surface),
        }
    }

    pub fn from_image(image: SoftwareImage) -> Self {
        Self {
            format: image.format,
            width: image.width,
            height: image.height,
            colorspace: ColorSpace::Auto,
            pts: None,
            fields: FieldFlags::empty(),
            data: FrameData::Software(Arc::new(image)),
        }
    }

    pub fn with_pts(mut self, pts: f64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_fields(mut self, fields: FieldFlags) -> Self {
        self.fields = fields;
        self
    }

    /// Surface id, or `SurfaceId::INVALID` for software frames.
    pub fn surface_id(&self) -> SurfaceId {
        match &self.data {
            FrameData::Surface(s) => s.id(),
            FrameData::Software(_) => SurfaceId::INVALID,
        }
    }

    pub fn surface(&self) -> Option<&Arc<Surface>> {
        match &self.data {
            FrameData::Surface(s) => Some(s),
            FrameData::Software(_) => None,
        }
    }

    pub fn image(&self) -> Option<&SoftwareImage> {
        match &self.data {
            FrameData::Software(img) => Some(img),
            FrameData::Surface(_) => None,
        }
    }

    pub fn is_interlaced(&self) -> bool {
        self.fields.contains(FieldFlags::INTERLACED)
    }

    pub fn top_field_first(&self) -> bool {
        self.fields.contains(FieldFlags::TOP_FIRST)
    }

    /// Copy timing and colour attributes from `other`, keeping our own data.
    pub fn copy_attributes(&mut self, other: &Frame) {
        self.pts = other.pts;
        self.fields = other.fields;
        self.colorspace = other.colorspace;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<SurfaceId>>);

    impl SurfaceRecycler for Collect {
        fn recycle(&self, id: SurfaceId) {
            self.0.lock().push(id);
        }
    }

    #[test]
    fn invalid_sentinel() {
        assert!(!SurfaceId::INVALID.is_valid());
        assert!(SurfaceId(0).is_valid());
        assert_eq!(SurfaceId::default(), SurfaceId::INVALID);
    }

    #[test]
    fn surface_returns_to_owner_after_last_clone() {
        let owner = Arc::new(Collect::default());
        let surface = Arc::new(Surface::new(SurfaceId(7), 720, 576, owner.clone()));
        let frame = Frame::from_surface(surface, 720, 576);
        let copy = frame.clone();

        drop(frame);
        assert!(owner.0.lock().is_empty());
        assert_eq!(copy.surface_id(), SurfaceId(7));

        drop(copy);
        assert_eq!(*owner.0.lock(), vec![SurfaceId(7)]);
    }

    #[test]
    fn software_frames_have_no_surface() {
        let frame = Frame::from_image(SoftwareImage::filled(ImageFormat::Yuv420p, 9, 5, 16));
        assert_eq!(frame.surface_id(), SurfaceId::INVALID);
        let img = frame.image().unwrap();
        assert_eq!(img.planes.len(), 3);
        assert_eq!(img.strides, vec![9, 5, 5]);
        assert_eq!(img.planes[1].len(), 5 * 3);
    }
}
