// VAAPI VPP - Video Acceleration API post-processing backend (Linux)
//
// VppBackend on top of libva's video processing entry point
// (VAEntrypointVideoProc). Loads libva.so at runtime - no compile-time
// dependency.
//
// Pipeline:
// 1. Load libva and libva-drm
// 2. Open the DRM render node, initialize a VA display
// 3. Create a VideoProc config and context
// 4. Query filters, create filter buffers, query pipeline caps
// 5. Per output picture: begin, pipeline parameter buffer, render, end

use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int, c_uint};
use std::ptr;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::backend::{
    BufferId, ColorStandard, ConfigId, ContextId, DeintAlgorithm, DeintFlags, FilterParams, FilterType, PictureField,
    PipelineCaps, PoolDesc, Rect, RenderRequest, SurfacePool, VppBackend,
};
use crate::error::{BackendError, VppError};
use crate::surface::{ColorSpace, Frame, ImageFormat, SoftwareImage, Surface, SurfaceId, SurfaceRecycler};

// ============================================================================
// VA-API Types (from va/va.h, va/va_vpp.h)
// ============================================================================

type VAStatus = c_int;
type VADisplay = *mut c_void;
type VAConfigID = c_uint;
type VAContextID = c_uint;
type VASurfaceID = c_uint;
type VABufferID = c_uint;
type VAProfile = c_int;
type VAEntrypoint = c_int;
type VABufferType = c_int;
type VAProcFilterType = c_int;
type VAProcColorStandardType = c_int;

const VA_STATUS_SUCCESS: VAStatus = 0;
const VA_STATUS_ERROR_OPERATION_FAILED: VAStatus = 0x01;
const VA_STATUS_ERROR_MAX_NUM_EXCEEDED: VAStatus = 0x0b;
const VA_STATUS_ERROR_INVALID_PARAMETER: VAStatus = 0x12;
const VA_STATUS_ERROR_INVALID_IMAGE_FORMAT: VAStatus = 0x16;

const VA_INVALID_ID: c_uint = 0xffff_ffff;

const VA_PROFILE_NONE: VAProfile = -1;
const VA_ENTRYPOINT_VIDEO_PROC: VAEntrypoint = 10;
const VA_RT_FORMAT_YUV420: c_uint = 0x0000_0001;

// Buffer types
const VA_PROC_PIPELINE_PARAMETER_BUFFER_TYPE: VABufferType = 41;
const VA_PROC_FILTER_PARAMETER_BUFFER_TYPE: VABufferType = 42;

// Filter types
const VA_PROC_FILTER_NOISE_REDUCTION: VAProcFilterType = 1;
const VA_PROC_FILTER_DEINTERLACING: VAProcFilterType = 2;
const VA_PROC_FILTER_SHARPENING: VAProcFilterType = 3;
const VA_PROC_FILTER_COLOR_BALANCE: VAProcFilterType = 4;
const VA_PROC_FILTER_SKIN_TONE_ENHANCEMENT: VAProcFilterType = 5;
const VA_PROC_FILTER_TOTAL_COLOR_CORRECTION: VAProcFilterType = 6;

// Deinterlacing algorithms
const VA_PROC_DEINTERLACING_NONE: c_int = 0;
const VA_PROC_DEINTERLACING_BOB: c_int = 1;
const VA_PROC_DEINTERLACING_WEAVE: c_int = 2;
const VA_PROC_DEINTERLACING_MOTION_ADAPTIVE: c_int = 3;
const VA_PROC_DEINTERLACING_MOTION_COMPENSATED: c_int = 4;

// Picture structure and colour flags for filter_flags
const VA_FRAME_PICTURE: c_uint = 0x0000_0000;
const VA_TOP_FIELD: c_uint = 0x0000_0001;
const VA_BOTTOM_FIELD: c_uint = 0x0000_0002;
const VA_SRC_BT601: c_uint = 0x0000_0010;
const VA_SRC_BT709: c_uint = 0x0000_0020;
const VA_SRC_SMPTE_240: c_uint = 0x0000_0040;

// Image formats
const VA_FOURCC_NV12: u32 = 0x3231564E; // 'NV12'

// Query array sizes
const MAX_FILTERS: usize = 16;
const MAX_DEINTERLACING_CAPS: usize = 8;
const MAX_COLOR_STANDARDS: usize = 16;

const DRM_RENDER_NODE: &str = "/dev/dri/renderD128";

/// Surfaces a pool may create before `alloc` fails.
const MAX_POOL_SURFACES: usize = 32;

// ============================================================================
// VA-API Structures
// ============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct VARectangle {
    x: i16,
    y: i16,
    width: u16,
    height: u16,
}

impl From<Rect> for VARectangle {
    fn from(r: Rect) -> Self {
        Self {
            x: r.x,
            y: r.y,
            width: r.width,
            height: r.height,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VAProcFilterParameterBufferDeinterlacing {
    filter_type: VAProcFilterType,
    algorithm: c_int,
    flags: c_uint,
    va_reserved: [c_uint; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct VAProcFilterCapDeinterlacing {
    algorithm: c_int,
    va_reserved: [c_uint; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VAProcPipelineCaps {
    pipeline_flags: c_uint,
    filter_flags: c_uint,
    num_forward_references: c_uint,
    num_backward_references: c_uint,
    input_color_standards: *mut VAProcColorStandardType,
    num_input_color_standards: c_uint,
    output_color_standards: *mut VAProcColorStandardType,
    num_output_color_standards: c_uint,
    rotation_flags: c_uint,
    blend_flags: c_uint,
    mirror_flags: c_uint,
    num_additional_outputs: c_uint,
    num_input_pixel_formats: c_uint,
    input_pixel_format: *mut c_uint,
    num_output_pixel_formats: c_uint,
    output_pixel_format: *mut c_uint,
    max_input_width: c_uint,
    max_input_height: c_uint,
    min_input_width: c_uint,
    min_input_height: c_uint,
    max_output_width: c_uint,
    max_output_height: c_uint,
    min_output_width: c_uint,
    min_output_height: c_uint,
    // colour properties and padding of newer libva versions
    va_reserved: [c_uint; 64],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VAProcPipelineParameterBuffer {
    surface: VASurfaceID,
    surface_region: *const VARectangle,
    surface_color_standard: VAProcColorStandardType,
    output_region: *const VARectangle,
    output_background_color: c_uint,
    output_color_standard: VAProcColorStandardType,
    pipeline_flags: c_uint,
    filter_flags: c_uint,
    filters: *mut VABufferID,
    num_filters: c_uint,
    forward_references: *mut VASurfaceID,
    num_forward_references: c_uint,
    backward_references: *mut VASurfaceID,
    num_backward_references: c_uint,
    rotation_state: c_uint,
    blend_state: *const c_void,
    mirror_state: u8,
    additional_outputs: *mut VASurfaceID,
    num_additional_outputs: c_uint,
    input_surface_flag: c_uint,
    output_surface_flag: c_uint,
    // colour properties, HDR metadata and padding of newer libva versions
    va_reserved: [c_uint; 64],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VAImageFormat {
    fourcc: c_uint,
    byte_order: c_uint,
    bits_per_pixel: c_uint,
    depth: c_uint,
    red_mask: c_uint,
    green_mask: c_uint,
    blue_mask: c_uint,
    alpha_mask: c_uint,
    va_reserved: [c_uint; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VAImage {
    image_id: c_uint,
    format: VAImageFormat,
    buf: VABufferID,
    width: u16,
    height: u16,
    data_size: c_uint,
    num_planes: c_uint,
    pitches: [c_uint; 3],
    offsets: [c_uint; 3],
    num_palette_entries: c_int,
    entry_bytes: c_int,
    component_order: [i8; 4],
    va_reserved: [c_uint; 4],
}

macro_rules! zeroed_default {
    ($($ty:ty),*) => {
        $(impl Default for $ty {
            fn default() -> Self {
                // SAFETY: plain C struct, all-zero is a valid value
                unsafe { std::mem::zeroed() }
            }
        })*
    };
}

zeroed_default!(
    VAProcFilterParameterBufferDeinterlacing,
    VAProcPipelineCaps,
    VAProcPipelineParameterBuffer,
    VAImageFormat,
    VAImage
);

// ============================================================================
// Library Path Detection
// ============================================================================

#[cfg(target_os = "linux")]
fn get_libva_path() -> &'static str {
    for path in &[
        "libva.so.2",
        "/usr/lib/x86_64-linux-gnu/libva.so.2",
        "/usr/lib/libva.so.2",
        "/usr/lib64/libva.so.2",
    ] {
        if std::path::Path::new(path).exists() || !path.contains('/') {
            return path;
        }
    }
    "libva.so.2"
}

#[cfg(target_os = "linux")]
fn get_libva_drm_path() -> &'static str {
    for path in &[
        "libva-drm.so.2",
        "/usr/lib/x86_64-linux-gnu/libva-drm.so.2",
        "/usr/lib/libva-drm.so.2",
        "/usr/lib64/libva-drm.so.2",
    ] {
        if std::path::Path::new(path).exists() || !path.contains('/') {
            return path;
        }
    }
    "libva-drm.so.2"
}

// ============================================================================
// Function Types
// ============================================================================

type VaGetDisplayDrmFn = unsafe extern "C" fn(c_int) -> VADisplay;
type VaInitializeFn = unsafe extern "C" fn(VADisplay, *mut c_int, *mut c_int) -> VAStatus;
type VaTerminateFn = unsafe extern "C" fn(VADisplay) -> VAStatus;
type VaQueryVendorStringFn = unsafe extern "C" fn(VADisplay) -> *const c_char;
type VaCreateConfigFn =
    unsafe extern "C" fn(VADisplay, VAProfile, VAEntrypoint, *mut c_void, c_int, *mut VAConfigID) -> VAStatus;
type VaDestroyConfigFn = unsafe extern "C" fn(VADisplay, VAConfigID) -> VAStatus;
type VaCreateContextFn = unsafe extern "C" fn(
    VADisplay,
    VAConfigID,
    c_int,
    c_int,
    c_int,
    *mut VASurfaceID,
    c_int,
    *mut VAContextID,
) -> VAStatus;
type VaDestroyContextFn = unsafe extern "C" fn(VADisplay, VAContextID) -> VAStatus;
type VaCreateSurfacesFn =
    unsafe extern "C" fn(VADisplay, c_uint, c_uint, c_uint, *mut VASurfaceID, c_uint, *mut c_void, c_uint) -> VAStatus;
type VaDestroySurfacesFn = unsafe extern "C" fn(VADisplay, *mut VASurfaceID, c_int) -> VAStatus;
type VaCreateBufferFn =
    unsafe extern "C" fn(VADisplay, VAContextID, VABufferType, c_uint, c_uint, *mut c_void, *mut VABufferID) -> VAStatus;
type VaDestroyBufferFn = unsafe extern "C" fn(VADisplay, VABufferID) -> VAStatus;
type VaMapBufferFn = unsafe extern "C" fn(VADisplay, VABufferID, *mut *mut c_void) -> VAStatus;
type VaUnmapBufferFn = unsafe extern "C" fn(VADisplay, VABufferID) -> VAStatus;
type VaBeginPictureFn = unsafe extern "C" fn(VADisplay, VAContextID, VASurfaceID) -> VAStatus;
type VaRenderPictureFn = unsafe extern "C" fn(VADisplay, VAContextID, *mut VABufferID, c_int) -> VAStatus;
type VaEndPictureFn = unsafe extern "C" fn(VADisplay, VAContextID) -> VAStatus;
type VaDeriveImageFn = unsafe extern "C" fn(VADisplay, VASurfaceID, *mut VAImage) -> VAStatus;
type VaDestroyImageFn = unsafe extern "C" fn(VADisplay, c_uint) -> VAStatus;
type VaQueryVideoProcFiltersFn =
    unsafe extern "C" fn(VADisplay, VAContextID, *mut VAProcFilterType, *mut c_uint) -> VAStatus;
type VaQueryVideoProcFilterCapsFn =
    unsafe extern "C" fn(VADisplay, VAContextID, VAProcFilterType, *mut c_void, *mut c_uint) -> VAStatus;
type VaQueryVideoProcPipelineCapsFn =
    unsafe extern "C" fn(VADisplay, VAContextID, *mut VABufferID, c_uint, *mut VAProcPipelineCaps) -> VAStatus;
type VaErrorStrFn = unsafe extern "C" fn(VAStatus) -> *const c_char;

// ============================================================================
// Loaded Functions Container
// ============================================================================

struct VaapiLibrary {
    _libva: libloading::Library,
    _libva_drm: libloading::Library,

    va_get_display_drm: VaGetDisplayDrmFn,
    va_initialize: VaInitializeFn,
    va_terminate: VaTerminateFn,
    va_query_vendor_string: VaQueryVendorStringFn,
    va_create_config: VaCreateConfigFn,
    va_destroy_config: VaDestroyConfigFn,
    va_create_context: VaCreateContextFn,
    va_destroy_context: VaDestroyContextFn,
    va_create_surfaces: VaCreateSurfacesFn,
    va_destroy_surfaces: VaDestroySurfacesFn,
    va_create_buffer: VaCreateBufferFn,
    va_destroy_buffer: VaDestroyBufferFn,
    va_map_buffer: VaMapBufferFn,
    va_unmap_buffer: VaUnmapBufferFn,
    va_begin_picture: VaBeginPictureFn,
    va_render_picture: VaRenderPictureFn,
    va_end_picture: VaEndPictureFn,
    va_derive_image: VaDeriveImageFn,
    va_destroy_image: VaDestroyImageFn,
    va_query_video_proc_filters: VaQueryVideoProcFiltersFn,
    va_query_video_proc_filter_caps: VaQueryVideoProcFilterCapsFn,
    va_query_video_proc_pipeline_caps: VaQueryVideoProcPipelineCapsFn,
    va_error_str: VaErrorStrFn,
}

unsafe impl Send for VaapiLibrary {}
unsafe impl Sync for VaapiLibrary {}

static VAAPI_LIB: OnceLock<Option<VaapiLibrary>> = OnceLock::new();

fn load_vaapi_library() -> Option<&'static VaapiLibrary> {
    VAAPI_LIB
        .get_or_init(|| {
            #[cfg(target_os = "linux")]
            {
                unsafe {
                    let libva = match libloading::Library::new(get_libva_path()) {
                        Ok(lib) => lib,
                        Err(e) => {
                            tracing::warn!("Failed to load libva: {}", e);
                            return None;
                        }
                    };

                    let libva_drm = match libloading::Library::new(get_libva_drm_path()) {
                        Ok(lib) => lib,
                        Err(e) => {
                            tracing::warn!("Failed to load libva-drm: {}", e);
                            return None;
                        }
                    };

                    let va_initialize: VaInitializeFn = *libva.get(b"vaInitialize\0").ok()?;
                    let va_terminate: VaTerminateFn = *libva.get(b"vaTerminate\0").ok()?;
                    let va_query_vendor_string: VaQueryVendorStringFn = *libva.get(b"vaQueryVendorString\0").ok()?;
                    let va_create_config: VaCreateConfigFn = *libva.get(b"vaCreateConfig\0").ok()?;
                    let va_destroy_config: VaDestroyConfigFn = *libva.get(b"vaDestroyConfig\0").ok()?;
                    let va_create_context: VaCreateContextFn = *libva.get(b"vaCreateContext\0").ok()?;
                    let va_destroy_context: VaDestroyContextFn = *libva.get(b"vaDestroyContext\0").ok()?;
                    let va_create_surfaces: VaCreateSurfacesFn = *libva.get(b"vaCreateSurfaces\0").ok()?;
                    let va_destroy_surfaces: VaDestroySurfacesFn = *libva.get(b"vaDestroySurfaces\0").ok()?;
                    let va_create_buffer: VaCreateBufferFn = *libva.get(b"vaCreateBuffer\0").ok()?;
                    let va_destroy_buffer: VaDestroyBufferFn = *libva.get(b"vaDestroyBuffer\0").ok()?;
                    let va_map_buffer: VaMapBufferFn = *libva.get(b"vaMapBuffer\0").ok()?;
                    let va_unmap_buffer: VaUnmapBufferFn = *libva.get(b"vaUnmapBuffer\0").ok()?;
                    let va_begin_picture: VaBeginPictureFn = *libva.get(b"vaBeginPicture\0").ok()?;
                    let va_render_picture: VaRenderPictureFn = *libva.get(b"vaRenderPicture\0").ok()?;
                    let va_end_picture: VaEndPictureFn = *libva.get(b"vaEndPicture\0").ok()?;
                    let va_derive_image: VaDeriveImageFn = *libva.get(b"vaDeriveImage\0").ok()?;
                    let va_destroy_image: VaDestroyImageFn = *libva.get(b"vaDestroyImage\0").ok()?;
                    let va_query_video_proc_filters: VaQueryVideoProcFiltersFn =
                        *libva.get(b"vaQueryVideoProcFilters\0").ok()?;
                    let va_query_video_proc_filter_caps: VaQueryVideoProcFilterCapsFn =
                        *libva.get(b"vaQueryVideoProcFilterCaps\0").ok()?;
                    let va_query_video_proc_pipeline_caps: VaQueryVideoProcPipelineCapsFn =
                        *libva.get(b"vaQueryVideoProcPipelineCaps\0").ok()?;
                    let va_error_str: VaErrorStrFn = *libva.get(b"vaErrorStr\0").ok()?;

                    let va_get_display_drm: VaGetDisplayDrmFn = *libva_drm.get(b"vaGetDisplayDRM\0").ok()?;

                    tracing::info!("VAAPI library loaded successfully");

                    Some(VaapiLibrary {
                        _libva: libva,
                        _libva_drm: libva_drm,
                        va_get_display_drm,
                        va_initialize,
                        va_terminate,
                        va_query_vendor_string,
                        va_create_config,
                        va_destroy_config,
                        va_create_context,
                        va_destroy_context,
                        va_create_surfaces,
                        va_destroy_surfaces,
                        va_create_buffer,
                        va_destroy_buffer,
                        va_map_buffer,
                        va_unmap_buffer,
                        va_begin_picture,
                        va_render_picture,
                        va_end_picture,
                        va_derive_image,
                        va_destroy_image,
                        va_query_video_proc_filters,
                        va_query_video_proc_filter_caps,
                        va_query_video_proc_pipeline_caps,
                        va_error_str,
                    })
                }
            }

            #[cfg(not(target_os = "linux"))]
            {
                None
            }
        })
        .as_ref()
}

/// Check if libva can be loaded
pub fn vaapi_available() -> bool {
    load_vaapi_library().is_some()
}

// ============================================================================
// Display
// ============================================================================

/// Initialized VA display on an open DRM render node. Shared by the backend
/// and its surface pools, terminated when the last of them is gone.
struct VaDisplay {
    lib: &'static VaapiLibrary,
    raw: VADisplay,
    drm_fd: c_int,
    version: (i32, i32),
}

unsafe impl Send for VaDisplay {}
unsafe impl Sync for VaDisplay {}

impl VaDisplay {
    #[cfg(target_os = "linux")]
    fn open(device: &str) -> Result<Self, VppError> {
        let lib = load_vaapi_library().ok_or_else(|| VppError::BackendUnavailable("libva not available".into()))?;
        let path = CString::new(device).map_err(|_| VppError::BackendUnavailable(format!("bad device path {}", device)))?;

        unsafe {
            let drm_fd = libc::open(path.as_ptr(), libc::O_RDWR);
            if drm_fd < 0 {
                return Err(VppError::BackendUnavailable(format!("failed to open DRM device {}", device)));
            }

            let raw = (lib.va_get_display_drm)(drm_fd);
            if raw.is_null() {
                libc::close(drm_fd);
                return Err(VppError::BackendUnavailable("failed to get VA display".into()));
            }

            let mut major = 0;
            let mut minor = 0;
            let status = (lib.va_initialize)(raw, &mut major, &mut minor);
            if status != VA_STATUS_SUCCESS {
                let err = BackendError::new("vaInitialize", status, error_string(lib, status));
                libc::close(drm_fd);
                return Err(VppError::InitializationFailed(err));
            }

            tracing::info!("VA-API {}.{} display on {}", major, minor, device);
            Ok(Self {
                lib,
                raw,
                drm_fd,
                version: (major, minor),
            })
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn open(_device: &str) -> Result<Self, VppError> {
        Err(VppError::BackendUnavailable("VA-API is only available on Linux".into()))
    }

    fn check(&self, call: &'static str, status: VAStatus) -> Result<(), BackendError> {
        if status == VA_STATUS_SUCCESS {
            Ok(())
        } else {
            Err(BackendError::new(call, status, error_string(self.lib, status)))
        }
    }

    fn vendor(&self) -> String {
        unsafe {
            let s = (self.lib.va_query_vendor_string)(self.raw);
            if s.is_null() {
                String::new()
            } else {
                CStr::from_ptr(s).to_string_lossy().into_owned()
            }
        }
    }
}

impl Drop for VaDisplay {
    fn drop(&mut self) {
        unsafe {
            (self.lib.va_terminate)(self.raw);
            #[cfg(target_os = "linux")]
            libc::close(self.drm_fd);
        }
    }
}

fn error_string(lib: &VaapiLibrary, status: VAStatus) -> String {
    unsafe {
        let s = (lib.va_error_str)(status);
        if s.is_null() {
            format!("unknown error {}", status)
        } else {
            CStr::from_ptr(s).to_string_lossy().into_owned()
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

fn filter_type_from_va(t: VAProcFilterType) -> FilterType {
    match t {
        VA_PROC_FILTER_NOISE_REDUCTION => FilterType::NoiseReduction,
        VA_PROC_FILTER_DEINTERLACING => FilterType::Deinterlacing,
        VA_PROC_FILTER_SHARPENING => FilterType::Sharpening,
        VA_PROC_FILTER_COLOR_BALANCE => FilterType::ColorBalance,
        VA_PROC_FILTER_SKIN_TONE_ENHANCEMENT => FilterType::SkinToneEnhancement,
        VA_PROC_FILTER_TOTAL_COLOR_CORRECTION => FilterType::TotalColorCorrection,
        other => FilterType::Other(other),
    }
}

fn algorithm_to_va(a: DeintAlgorithm) -> c_int {
    match a {
        DeintAlgorithm::None => VA_PROC_DEINTERLACING_NONE,
        DeintAlgorithm::Bob => VA_PROC_DEINTERLACING_BOB,
        DeintAlgorithm::Weave => VA_PROC_DEINTERLACING_WEAVE,
        DeintAlgorithm::MotionAdaptive => VA_PROC_DEINTERLACING_MOTION_ADAPTIVE,
        DeintAlgorithm::MotionCompensated => VA_PROC_DEINTERLACING_MOTION_COMPENSATED,
    }
}

fn algorithm_from_va(a: c_int) -> Option<DeintAlgorithm> {
    match a {
        VA_PROC_DEINTERLACING_BOB => Some(DeintAlgorithm::Bob),
        VA_PROC_DEINTERLACING_WEAVE => Some(DeintAlgorithm::Weave),
        VA_PROC_DEINTERLACING_MOTION_ADAPTIVE => Some(DeintAlgorithm::MotionAdaptive),
        VA_PROC_DEINTERLACING_MOTION_COMPENSATED => Some(DeintAlgorithm::MotionCompensated),
        _ => None,
    }
}

fn color_standard_from_va(s: VAProcColorStandardType) -> ColorStandard {
    match s {
        1 => ColorStandard::Bt601,
        2 => ColorStandard::Bt709,
        3 => ColorStandard::Bt470m,
        4 => ColorStandard::Bt470bg,
        5 => ColorStandard::Smpte170m,
        6 => ColorStandard::Smpte240m,
        7 => ColorStandard::GenericFilm,
        8 => ColorStandard::Srgb,
        9 => ColorStandard::Stryrgb,
        10 => ColorStandard::Xvycc601,
        11 => ColorStandard::Xvycc709,
        12 => ColorStandard::Bt2020,
        13 => ColorStandard::Explicit,
        _ => ColorStandard::None,
    }
}

/// Colour standard and legacy `VA_SRC_*` flag for a source colourspace.
fn color_standard_to_va(csp: ColorSpace) -> (VAProcColorStandardType, c_uint) {
    match csp {
        ColorSpace::Auto => (0, 0),
        ColorSpace::Bt601 => (1, VA_SRC_BT601),
        ColorSpace::Bt709 => (2, VA_SRC_BT709),
        ColorSpace::Smpte240m => (6, VA_SRC_SMPTE_240),
        ColorSpace::Bt2020 => (12, 0),
    }
}

fn picture_flags(field: PictureField) -> c_uint {
    match field {
        PictureField::Frame => VA_FRAME_PICTURE,
        PictureField::Top => VA_TOP_FIELD,
        PictureField::Bottom => VA_BOTTOM_FIELD,
    }
}

fn ptr_or_null<T>(v: &mut [T]) -> *mut T {
    if v.is_empty() {
        ptr::null_mut()
    } else {
        v.as_mut_ptr()
    }
}

// ============================================================================
// VAAPI Backend
// ============================================================================

/// Arrays referenced by a pipeline parameter buffer. The driver reads them
/// at render time, so they stay alive until the picture ends.
struct PendingRequest {
    _source_region: Box<VARectangle>,
    _output_region: Box<VARectangle>,
    _filters: Vec<VABufferID>,
    _forward: Vec<VASurfaceID>,
    _backward: Vec<VASurfaceID>,
}

pub struct VaapiBackend {
    display: Arc<VaDisplay>,
    pending: Vec<PendingRequest>,
}

impl VaapiBackend {
    /// Open the default DRM render node.
    pub fn open() -> Result<Self, VppError> {
        Self::open_device(DRM_RENDER_NODE)
    }

    pub fn open_device(device: &str) -> Result<Self, VppError> {
        let display = VaDisplay::open(device)?;
        Ok(Self {
            display: Arc::new(display),
            pending: Vec::new(),
        })
    }

    pub fn version(&self) -> (i32, i32) {
        self.display.version
    }

    pub fn vendor(&self) -> String {
        self.display.vendor()
    }

    fn lib(&self) -> &'static VaapiLibrary {
        self.display.lib
    }
}

impl VppBackend for VaapiBackend {
    type Pool = VaapiPool;

    fn name(&self) -> &str {
        "vaapi"
    }

    fn create_config(&mut self) -> Result<ConfigId, BackendError> {
        let mut id: VAConfigID = VA_INVALID_ID;
        let status = unsafe {
            (self.lib().va_create_config)(
                self.display.raw,
                VA_PROFILE_NONE,
                VA_ENTRYPOINT_VIDEO_PROC,
                ptr::null_mut(),
                0,
                &mut id,
            )
        };
        self.display.check("vaCreateConfig", status)?;
        Ok(ConfigId(id))
    }

    fn destroy_config(&mut self, config: ConfigId) {
        unsafe {
            (self.lib().va_destroy_config)(self.display.raw, config.0);
        }
    }

    fn create_context(&mut self, config: ConfigId) -> Result<ContextId, BackendError> {
        let mut id: VAContextID = VA_INVALID_ID;
        let status = unsafe {
            (self.lib().va_create_context)(self.display.raw, config.0, 0, 0, 0, ptr::null_mut(), 0, &mut id)
        };
        self.display.check("vaCreateContext", status)?;
        Ok(ContextId(id))
    }

    fn destroy_context(&mut self, context: ContextId) {
        unsafe {
            (self.lib().va_destroy_context)(self.display.raw, context.0);
        }
    }

    fn query_filters(&mut self, context: ContextId) -> Result<Vec<FilterType>, BackendError> {
        let mut filters = [0 as VAProcFilterType; MAX_FILTERS];
        let mut num = MAX_FILTERS as c_uint;
        let status = unsafe {
            (self.lib().va_query_video_proc_filters)(self.display.raw, context.0, filters.as_mut_ptr(), &mut num)
        };
        self.display.check("vaQueryVideoProcFilters", status)?;
        let num = (num as usize).min(MAX_FILTERS);
        Ok(filters[..num].iter().map(|&t| filter_type_from_va(t)).collect())
    }

    fn query_deinterlace_caps(&mut self, context: ContextId) -> Result<Vec<DeintAlgorithm>, BackendError> {
        let mut caps = [VAProcFilterCapDeinterlacing::default(); MAX_DEINTERLACING_CAPS];
        let mut num = MAX_DEINTERLACING_CAPS as c_uint;
        let status = unsafe {
            (self.lib().va_query_video_proc_filter_caps)(
                self.display.raw,
                context.0,
                VA_PROC_FILTER_DEINTERLACING,
                caps.as_mut_ptr() as *mut c_void,
                &mut num,
            )
        };
        self.display.check("vaQueryVideoProcFilterCaps", status)?;
        let num = (num as usize).min(MAX_DEINTERLACING_CAPS);
        Ok(caps[..num].iter().filter_map(|c| algorithm_from_va(c.algorithm)).collect())
    }

    fn create_filter_buffer(&mut self, context: ContextId, params: &FilterParams) -> Result<BufferId, BackendError> {
        let FilterParams::Deinterlacing { algorithm, flags } = *params;
        let mut param = VAProcFilterParameterBufferDeinterlacing {
            filter_type: VA_PROC_FILTER_DEINTERLACING,
            algorithm: algorithm_to_va(algorithm),
            flags: flags.bits(),
            ..Default::default()
        };

        let mut id: VABufferID = VA_INVALID_ID;
        let status = unsafe {
            (self.lib().va_create_buffer)(
                self.display.raw,
                context.0,
                VA_PROC_FILTER_PARAMETER_BUFFER_TYPE,
                std::mem::size_of::<VAProcFilterParameterBufferDeinterlacing>() as c_uint,
                1,
                &mut param as *mut _ as *mut c_void,
                &mut id,
            )
        };
        self.display.check("vaCreateBuffer", status)?;
        Ok(BufferId(id))
    }

    fn update_deinterlace_flags(&mut self, buffer: BufferId, flags: DeintFlags) -> Result<(), BackendError> {
        let mut data: *mut c_void = ptr::null_mut();
        let status = unsafe { (self.lib().va_map_buffer)(self.display.raw, buffer.0, &mut data) };
        self.display.check("vaMapBuffer", status)?;
        if data.is_null() {
            return Err(BackendError::new("vaMapBuffer", VA_STATUS_ERROR_OPERATION_FAILED, "null mapping"));
        }

        unsafe {
            // SAFETY: the buffer was created from this struct type
            let param = &mut *(data as *mut VAProcFilterParameterBufferDeinterlacing);
            param.flags = flags.bits();
            (self.lib().va_unmap_buffer)(self.display.raw, buffer.0);
        }
        Ok(())
    }

    fn query_pipeline_caps(&mut self, context: ContextId, filters: &[BufferId]) -> Result<PipelineCaps, BackendError> {
        let mut filter_ids: Vec<VABufferID> = filters.iter().map(|b| b.0).collect();
        let mut input_stds = [0 as VAProcColorStandardType; MAX_COLOR_STANDARDS];
        let mut output_stds = [0 as VAProcColorStandardType; MAX_COLOR_STANDARDS];

        let mut caps = VAProcPipelineCaps {
            input_color_standards: input_stds.as_mut_ptr(),
            num_input_color_standards: MAX_COLOR_STANDARDS as c_uint,
            output_color_standards: output_stds.as_mut_ptr(),
            num_output_color_standards: MAX_COLOR_STANDARDS as c_uint,
            ..Default::default()
        };

        let status = unsafe {
            (self.lib().va_query_video_proc_pipeline_caps)(
                self.display.raw,
                context.0,
                ptr_or_null(&mut filter_ids),
                filter_ids.len() as c_uint,
                &mut caps,
            )
        };
        self.display.check("vaQueryVideoProcPipelineCaps", status)?;

        let n_in = (caps.num_input_color_standards as usize).min(MAX_COLOR_STANDARDS);
        let n_out = (caps.num_output_color_standards as usize).min(MAX_COLOR_STANDARDS);
        Ok(PipelineCaps {
            input_color_standards: input_stds[..n_in].iter().map(|&s| color_standard_from_va(s)).collect(),
            output_color_standards: output_stds[..n_out].iter().map(|&s| color_standard_from_va(s)).collect(),
            num_forward_references: caps.num_forward_references,
            num_backward_references: caps.num_backward_references,
        })
    }

    fn begin_picture(&mut self, context: ContextId, target: SurfaceId) -> Result<(), BackendError> {
        let status = unsafe { (self.lib().va_begin_picture)(self.display.raw, context.0, target.0) };
        self.display.check("vaBeginPicture", status)
    }

    fn create_pipeline_buffer(&mut self, context: ContextId, request: &RenderRequest) -> Result<BufferId, BackendError> {
        let mut pending = PendingRequest {
            _source_region: Box::new(request.source_region.into()),
            _output_region: Box::new(request.output_region.into()),
            _filters: request.filters.iter().map(|b| b.0).collect(),
            _forward: request.forward_references.iter().map(|s| s.0).collect(),
            _backward: request.backward_references.iter().map(|s| s.0).collect(),
        };

        let (color_standard, csp_flag) = color_standard_to_va(request.colorspace);
        let mut param = VAProcPipelineParameterBuffer {
            surface: request.source.0,
            surface_region: &*pending._source_region,
            surface_color_standard: color_standard,
            output_region: &*pending._output_region,
            output_background_color: 0,
            output_color_standard: color_standard,
            filter_flags: picture_flags(request.field) | csp_flag,
            filters: ptr_or_null(&mut pending._filters),
            num_filters: pending._filters.len() as c_uint,
            forward_references: ptr_or_null(&mut pending._forward),
            num_forward_references: pending._forward.len() as c_uint,
            backward_references: ptr_or_null(&mut pending._backward),
            num_backward_references: pending._backward.len() as c_uint,
            ..Default::default()
        };

        let mut id: VABufferID = VA_INVALID_ID;
        let status = unsafe {
            (self.lib().va_create_buffer)(
                self.display.raw,
                context.0,
                VA_PROC_PIPELINE_PARAMETER_BUFFER_TYPE,
                std::mem::size_of::<VAProcPipelineParameterBuffer>() as c_uint,
                1,
                &mut param as *mut _ as *mut c_void,
                &mut id,
            )
        };
        self.display.check("vaCreateBuffer", status)?;

        // heap contents do not move with the Box/Vec handles
        self.pending.push(pending);
        Ok(BufferId(id))
    }

    fn render_picture(&mut self, context: ContextId, buffers: &[BufferId]) -> Result<(), BackendError> {
        let mut ids: Vec<VABufferID> = buffers.iter().map(|b| b.0).collect();
        let status = unsafe {
            (self.lib().va_render_picture)(self.display.raw, context.0, ids.as_mut_ptr(), ids.len() as c_int)
        };
        self.display.check("vaRenderPicture", status)
    }

    fn end_picture(&mut self, context: ContextId) -> Result<(), BackendError> {
        let status = unsafe { (self.lib().va_end_picture)(self.display.raw, context.0) };
        self.pending.clear();
        self.display.check("vaEndPicture", status)
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        unsafe {
            (self.lib().va_destroy_buffer)(self.display.raw, buffer.0);
        }
    }

    fn create_pool(&mut self, desc: PoolDesc) -> Result<VaapiPool, BackendError> {
        if desc.sw_format != ImageFormat::Nv12 || desc.width == 0 || desc.height == 0 {
            return Err(BackendError::new(
                "vaCreateSurfaces",
                VA_STATUS_ERROR_INVALID_PARAMETER,
                format!("unsupported pool {:?} {}x{}", desc.sw_format, desc.width, desc.height),
            ));
        }
        Ok(VaapiPool {
            shared: Arc::new(PoolShared {
                display: self.display.clone(),
                free: Mutex::new(Vec::new()),
                surfaces: Mutex::new(Vec::new()),
            }),
            desc,
        })
    }
}

// ============================================================================
// Surface Pool
// ============================================================================

struct PoolShared {
    display: Arc<VaDisplay>,
    free: Mutex<Vec<SurfaceId>>,
    /// Every surface created by the pool
    surfaces: Mutex<Vec<VASurfaceID>>,
}

impl SurfaceRecycler for PoolShared {
    fn recycle(&self, id: SurfaceId) {
        self.free.lock().push(id);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let mut surfaces = self.surfaces.lock();
        if surfaces.is_empty() {
            return;
        }
        unsafe {
            (self.display.lib.va_destroy_surfaces)(self.display.raw, surfaces.as_mut_ptr(), surfaces.len() as c_int);
        }
        tracing::debug!("destroyed {} pooled surfaces", surfaces.len());
    }
}

/// NV12 surfaces of one size, created on demand and recycled when the last
/// frame referencing them is dropped.
pub struct VaapiPool {
    shared: Arc<PoolShared>,
    desc: PoolDesc,
}

impl VaapiPool {
    pub fn created(&self) -> usize {
        self.shared.surfaces.lock().len()
    }
}

impl SurfacePool for VaapiPool {
    fn alloc(&mut self) -> Result<Surface, BackendError> {
        let recycled = self.shared.free.lock().pop();
        if let Some(id) = recycled {
            return Ok(Surface::new(id, self.desc.width, self.desc.height, self.shared.clone()));
        }

        let mut surfaces = self.shared.surfaces.lock();
        if surfaces.len() >= MAX_POOL_SURFACES {
            return Err(BackendError::new(
                "vaCreateSurfaces",
                VA_STATUS_ERROR_MAX_NUM_EXCEEDED,
                "surface pool exhausted",
            ));
        }

        let display = &self.shared.display;
        let mut id: VASurfaceID = VA_INVALID_ID;
        let status = unsafe {
            (display.lib.va_create_surfaces)(
                display.raw,
                VA_RT_FORMAT_YUV420,
                self.desc.width,
                self.desc.height,
                &mut id,
                1,
                ptr::null_mut(),
                0,
            )
        };
        display.check("vaCreateSurfaces", status)?;
        surfaces.push(id);
        drop(surfaces);

        Ok(Surface::new(SurfaceId(id), self.desc.width, self.desc.height, self.shared.clone()))
    }

    fn upload(&mut self, dst: &Surface, src: &Frame) -> Result<(), BackendError> {
        let image = src.image().ok_or_else(|| {
            BackendError::new("upload", VA_STATUS_ERROR_INVALID_IMAGE_FORMAT, "frame has no software image")
        })?;

        let display = &self.shared.display;
        let mut va_image = VAImage::default();
        let status = unsafe { (display.lib.va_derive_image)(display.raw, dst.id().0, &mut va_image) };
        display.check("vaDeriveImage", status)?;

        let result = write_derived_image(display, &va_image, image);
        unsafe {
            (display.lib.va_destroy_image)(display.raw, va_image.image_id);
        }
        result
    }

    fn desc(&self) -> PoolDesc {
        self.desc
    }
}

fn write_derived_image(display: &VaDisplay, va_image: &VAImage, src: &SoftwareImage) -> Result<(), BackendError> {
    if va_image.format.fourcc != VA_FOURCC_NV12 || va_image.num_planes < 2 {
        return Err(BackendError::new(
            "vaDeriveImage",
            VA_STATUS_ERROR_INVALID_IMAGE_FORMAT,
            "surface is not NV12",
        ));
    }

    let mut data: *mut c_void = ptr::null_mut();
    let status = unsafe { (display.lib.va_map_buffer)(display.raw, va_image.buf, &mut data) };
    display.check("vaMapBuffer", status)?;
    if data.is_null() {
        return Err(BackendError::new("vaMapBuffer", VA_STATUS_ERROR_OPERATION_FAILED, "null mapping"));
    }

    let layout = Nv12Layout {
        width: va_image.width as usize,
        height: va_image.height as usize,
        pitch: [va_image.pitches[0] as usize, va_image.pitches[1] as usize],
        offset: [va_image.offsets[0] as usize, va_image.offsets[1] as usize],
    };
    // SAFETY: the driver maps data_size bytes for the derived image
    let dst = unsafe { std::slice::from_raw_parts_mut(data as *mut u8, va_image.data_size as usize) };
    let result = write_nv12(dst, &layout, src)
        .map_err(|e| BackendError::new("upload", VA_STATUS_ERROR_INVALID_PARAMETER, e));

    unsafe {
        (display.lib.va_unmap_buffer)(display.raw, va_image.buf);
    }
    result
}

// ============================================================================
// NV12 Upload
// ============================================================================

/// Plane layout of a mapped NV12 image.
#[derive(Debug, Clone, Copy)]
struct Nv12Layout {
    width: usize,
    height: usize,
    pitch: [usize; 2],
    offset: [usize; 2],
}

fn src_row(plane: &[u8], stride: usize, row: usize, width: usize) -> Result<&[u8], &'static str> {
    let start = row * stride;
    plane.get(start..start + width).ok_or("source plane too small")
}

fn dst_row(dst: &mut [u8], offset: usize, pitch: usize, row: usize, width: usize) -> Result<&mut [u8], &'static str> {
    let start = offset + row * pitch;
    dst.get_mut(start..start + width).ok_or("image buffer too small")
}

fn plane(src: &SoftwareImage, index: usize) -> Result<(&[u8], usize), &'static str> {
    match (src.planes.get(index), src.strides.get(index)) {
        (Some(p), Some(&stride)) => Ok((p.as_ref(), stride)),
        _ => Err("missing source plane"),
    }
}

/// Copy an NV12 or planar 4:2:0 image into an NV12 buffer, cropping to the
/// smaller of the two sizes.
fn write_nv12(dst: &mut [u8], layout: &Nv12Layout, src: &SoftwareImage) -> Result<(), &'static str> {
    let w = (src.width as usize).min(layout.width);
    let h = (src.height as usize).min(layout.height);
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);

    let (luma, luma_stride) = plane(src, 0)?;
    for row in 0..h {
        dst_row(dst, layout.offset[0], layout.pitch[0], row, w)?.copy_from_slice(src_row(luma, luma_stride, row, w)?);
    }

    match src.format {
        ImageFormat::Nv12 => {
            let (uv, uv_stride) = plane(src, 1)?;
            let bytes = (cw * 2).min(uv_stride);
            for row in 0..ch {
                dst_row(dst, layout.offset[1], layout.pitch[1], row, bytes)?
                    .copy_from_slice(src_row(uv, uv_stride, row, bytes)?);
            }
        }
        ImageFormat::Yuv420p => {
            let (u, u_stride) = plane(src, 1)?;
            let (v, v_stride) = plane(src, 2)?;
            for row in 0..ch {
                let u_row = src_row(u, u_stride, row, cw)?;
                let v_row = src_row(v, v_stride, row, cw)?;
                let out = dst_row(dst, layout.offset[1], layout.pitch[1], row, cw * 2)?;
                for (i, pair) in out.chunks_exact_mut(2).enumerate() {
                    pair[0] = u_row[i];
                    pair[1] = v_row[i];
                }
            }
        }
        ImageFormat::Vaapi => return Err("hardware frames cannot be uploaded"),
    }
    Ok(())
}
