//! # Mock Backend
//!
//! In-memory `VppBackend` that records every call. Reported capabilities,
//! supported algorithms and failing calls are configurable so the pipeline
//! can be exercised without hardware. Call names used with `fail_on` are the
//! VA-API entry point names (`vaBeginPicture`, `vaRenderPicture`, ...), plus
//! `alloc` and `upload` for the surface pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{
    BufferId, ColorStandard, ConfigId, ContextId, DeintAlgorithm, DeintFlags, FilterParams, FilterType, PipelineCaps, PoolDesc,
    RenderRequest, SurfacePool, VppBackend,
};
use crate::error::BackendError;
use crate::surface::{ColorSpace, Frame, ImageFormat, Surface, SurfaceId, SurfaceRecycler};

/// Status code returned by failing mock calls (`VA_STATUS_ERROR_OPERATION_FAILED`).
pub const MOCK_FAILURE_STATUS: i32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    CreateConfig(ConfigId),
    DestroyConfig(ConfigId),
    CreateContext(ContextId),
    DestroyContext(ContextId),
    QueryFilters,
    QueryDeinterlaceCaps,
    CreateFilterBuffer(BufferId),
    UpdateDeinterlaceFlags(BufferId, DeintFlags),
    QueryPipelineCaps(Vec<BufferId>),
    BeginPicture(SurfaceId),
    CreatePipelineBuffer(BufferId),
    RenderPicture(Vec<BufferId>),
    EndPicture,
    DestroyBuffer(BufferId),
    CreatePool(PoolDesc),
    DestroyPool,
    AllocSurface(SurfaceId),
    Upload(SurfaceId),
}

/// One request that reached `render_picture`.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub request: RenderRequest,
    /// Flags of the deinterlacing buffer at render time
    pub deint_flags: Option<DeintFlags>,
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<MockCall>,
    failing: HashSet<String>,
    next_id: u32,
}

impl MockState {
    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check(&self, call: &'static str) -> Result<(), BackendError> {
        if self.failing.contains(call) {
            Err(BackendError::new(call, MOCK_FAILURE_STATUS, "injected failure"))
        } else {
            Ok(())
        }
    }
}

/// Shared call log, readable after the backend has been dropped.
#[derive(Debug, Clone, Default)]
pub struct MockLog(Arc<Mutex<MockState>>);

impl MockLog {
    pub fn calls(&self) -> Vec<MockCall> {
        self.0.lock().calls.clone()
    }
}

#[derive(Debug)]
enum MockBuffer {
    Filter { flags: DeintFlags },
    Pipeline(RenderRequest),
}

#[derive(Debug)]
pub struct MockBackend {
    state: MockLog,
    filters: Vec<FilterType>,
    algorithms: Vec<DeintAlgorithm>,
    caps: PipelineCaps,
    pool_capacity: usize,
    buffers: HashMap<BufferId, MockBuffer>,
    open_picture: Option<SurfaceId>,
    submissions: Vec<Submission>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Backend offering deinterlacing with every algorithm and no references.
    pub fn new() -> Self {
        let state = MockLog::default();
        // keep ids clear of zero so tests catch uninitialised handles
        state.0.lock().next_id = 0x10;
        Self {
            state,
            filters: vec![FilterType::NoiseReduction, FilterType::Deinterlacing, FilterType::ColorBalance],
            algorithms: vec![
                DeintAlgorithm::Bob,
                DeintAlgorithm::Weave,
                DeintAlgorithm::MotionAdaptive,
                DeintAlgorithm::MotionCompensated,
            ],
            caps: PipelineCaps {
                input_color_standards: vec![ColorStandard::Bt601, ColorStandard::Bt709],
                output_color_standards: vec![ColorStandard::Bt601, ColorStandard::Bt709],
                num_forward_references: 0,
                num_backward_references: 0,
            },
            pool_capacity: 16,
            buffers: HashMap::new(),
            open_picture: None,
            submissions: Vec::new(),
        }
    }

    /// Report `forward` and `backward` reference counts from pipeline queries.
    pub fn with_refs(mut self, forward: u32, backward: u32) -> Self {
        self.caps.num_forward_references = forward;
        self.caps.num_backward_references = backward;
        self
    }

    pub fn with_algorithms(mut self, algorithms: &[DeintAlgorithm]) -> Self {
        self.algorithms = algorithms.to_vec();
        self
    }

    pub fn with_filters(mut self, filters: &[FilterType]) -> Self {
        self.filters = filters.to_vec();
        self
    }

    /// Maximum number of surfaces each pool hands out at once.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Make every subsequent call named `call` fail.
    pub fn fail_on(&mut self, call: &str) {
        self.state.0.lock().failing.insert(call.to_string());
    }

    pub fn clear_failures(&mut self) {
        self.state.0.lock().failing.clear();
    }

    pub fn log(&self) -> MockLog {
        self.state.clone()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.calls()
    }

    pub fn count(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.state.0.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn submissions(&self) -> &[Submission] {
        &self.submissions
    }

    /// Buffers created and not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn picture_open(&self) -> bool {
        self.open_picture.is_some()
    }

    fn record(&self, call: MockCall) {
        self.state.0.lock().calls.push(call);
    }

    fn check(&self, call: &'static str) -> Result<(), BackendError> {
        self.state.0.lock().check(call)
    }

    fn next_id(&self) -> u32 {
        self.state.0.lock().next_id()
    }
}

impl VppBackend for MockBackend {
    type Pool = MockPool;

    fn name(&self) -> &str {
        "mock"
    }

    fn create_config(&mut self) -> Result<ConfigId, BackendError> {
        self.check("vaCreateConfig")?;
        let id = ConfigId(self.next_id());
        self.record(MockCall::CreateConfig(id));
        Ok(id)
    }

    fn destroy_config(&mut self, config: ConfigId) {
        self.record(MockCall::DestroyConfig(config));
    }

    fn create_context(&mut self, config: ConfigId) -> Result<ContextId, BackendError> {
        self.check("vaCreateContext")?;
        if !config.is_valid() {
            return Err(BackendError::new("vaCreateContext", 4, "invalid config"));
        }
        let id = ContextId(self.next_id());
        self.record(MockCall::CreateContext(id));
        Ok(id)
    }

    fn destroy_context(&mut self, context: ContextId) {
        self.record(MockCall::DestroyContext(context));
    }

    fn query_filters(&mut self, _context: ContextId) -> Result<Vec<FilterType>, BackendError> {
        self.record(MockCall::QueryFilters);
        self.check("vaQueryVideoProcFilters")?;
        Ok(self.filters.clone())
    }

    fn query_deinterlace_caps(&mut self, _context: ContextId) -> Result<Vec<DeintAlgorithm>, BackendError> {
        self.record(MockCall::QueryDeinterlaceCaps);
        self.check("vaQueryVideoProcFilterCaps")?;
        Ok(self.algorithms.clone())
    }

    fn create_filter_buffer(&mut self, _context: ContextId, params: &FilterParams) -> Result<BufferId, BackendError> {
        self.check("vaCreateBuffer")?;
        let id = BufferId(self.next_id());
        let FilterParams::Deinterlacing { algorithm, flags } = *params;
        if !self.algorithms.contains(&algorithm) {
            return Err(BackendError::new("vaCreateBuffer", 0x12, "unsupported algorithm"));
        }
        self.buffers.insert(id, MockBuffer::Filter { flags });
        self.record(MockCall::CreateFilterBuffer(id));
        Ok(id)
    }

    fn update_deinterlace_flags(&mut self, buffer: BufferId, new_flags: DeintFlags) -> Result<(), BackendError> {
        self.check("vaMapBuffer")?;
        match self.buffers.get_mut(&buffer) {
            Some(MockBuffer::Filter { flags }) => *flags = new_flags,
            _ => return Err(BackendError::new("vaMapBuffer", 7, "invalid buffer")),
        }
        self.record(MockCall::UpdateDeinterlaceFlags(buffer, new_flags));
        Ok(())
    }

    fn query_pipeline_caps(&mut self, _context: ContextId, filters: &[BufferId]) -> Result<PipelineCaps, BackendError> {
        self.record(MockCall::QueryPipelineCaps(filters.to_vec()));
        self.check("vaQueryVideoProcPipelineCaps")?;
        Ok(self.caps.clone())
    }

    fn begin_picture(&mut self, _context: ContextId, target: SurfaceId) -> Result<(), BackendError> {
        self.check("vaBeginPicture")?;
        if !target.is_valid() {
            return Err(BackendError::new("vaBeginPicture", 6, "invalid surface"));
        }
        if self.open_picture.is_some() {
            return Err(BackendError::new("vaBeginPicture", 1, "picture already open"));
        }
        self.open_picture = Some(target);
        self.record(MockCall::BeginPicture(target));
        Ok(())
    }

    fn create_pipeline_buffer(&mut self, _context: ContextId, request: &RenderRequest) -> Result<BufferId, BackendError> {
        self.check("vaCreateBuffer")?;
        let id = BufferId(self.next_id());
        self.buffers.insert(id, MockBuffer::Pipeline(request.clone()));
        self.record(MockCall::CreatePipelineBuffer(id));
        Ok(id)
    }

    fn render_picture(&mut self, _context: ContextId, buffers: &[BufferId]) -> Result<(), BackendError> {
        self.record(MockCall::RenderPicture(buffers.to_vec()));
        self.check("vaRenderPicture")?;
        if self.open_picture.is_none() {
            return Err(BackendError::new("vaRenderPicture", 1, "no picture open"));
        }

        for buffer in buffers {
            let Some(MockBuffer::Pipeline(request)) = self.buffers.get(buffer) else {
                return Err(BackendError::new("vaRenderPicture", 7, "invalid buffer"));
            };
            let deint_flags = request.filters.iter().find_map(|f| match self.buffers.get(f) {
                Some(MockBuffer::Filter { flags }) => Some(*flags),
                _ => None,
            });
            self.submissions.push(Submission {
                request: request.clone(),
                deint_flags,
            });
        }
        Ok(())
    }

    fn end_picture(&mut self, _context: ContextId) -> Result<(), BackendError> {
        if self.open_picture.take().is_none() {
            return Err(BackendError::new("vaEndPicture", 1, "no picture open"));
        }
        self.record(MockCall::EndPicture);
        self.check("vaEndPicture")
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer);
        self.record(MockCall::DestroyBuffer(buffer));
    }

    fn create_pool(&mut self, desc: PoolDesc) -> Result<MockPool, BackendError> {
        self.check("vaCreateSurfaces")?;
        self.record(MockCall::CreatePool(desc));
        Ok(MockPool {
            desc,
            state: self.state.clone(),
            free: Arc::new(FreeList::default()),
            allocated: 0,
            capacity: self.pool_capacity,
        })
    }
}

// ============================================================================
// Mock Surface Pool
// ============================================================================

#[derive(Debug, Default)]
struct FreeList(Mutex<Vec<SurfaceId>>);

impl SurfaceRecycler for FreeList {
    fn recycle(&self, id: SurfaceId) {
        self.0.lock().push(id);
    }
}

#[derive(Debug)]
pub struct MockPool {
    desc: PoolDesc,
    state: MockLog,
    free: Arc<FreeList>,
    allocated: usize,
    capacity: usize,
}

impl MockPool {
    /// Surfaces currently leased out.
    pub fn in_use(&self) -> usize {
        self.allocated - self.free.0.lock().len()
    }
}

impl SurfacePool for MockPool {
    fn alloc(&mut self) -> Result<Surface, BackendError> {
        self.state.0.lock().check("alloc")?;

        let recycled = self.free.0.lock().pop();
        let id = match recycled {
            Some(id) => id,
            None if self.allocated < self.capacity => {
                self.allocated += 1;
                SurfaceId(self.state.0.lock().next_id())
            }
            None => return Err(BackendError::new("alloc", 2, "pool exhausted")),
        };

        self.state.0.lock().calls.push(MockCall::AllocSurface(id));
        Ok(Surface::new(id, self.desc.width, self.desc.height, self.free.clone()))
    }

    fn upload(&mut self, dst: &Surface, src: &Frame) -> Result<(), BackendError> {
        self.state.0.lock().check("upload")?;
        match src.image() {
            Some(img) if matches!(img.format, ImageFormat::Nv12 | ImageFormat::Yuv420p) => {}
            _ => return Err(BackendError::new("upload", 0x16, "not an uploadable software frame")),
        }
        self.state.0.lock().calls.push(MockCall::Upload(dst.id()));
        Ok(())
    }

    fn desc(&self) -> PoolDesc {
        self.desc
    }
}

impl Drop for MockPool {
    fn drop(&mut self) {
        self.state.0.lock().calls.push(MockCall::DestroyPool);
    }
}

/// Frame on a standalone mock surface, as a decoder would hand it over.
pub fn hw_frame(id: u32, width: u32, height: u32) -> Frame {
    let surface = Arc::new(Surface::unpooled(SurfaceId(id), width, height));
    let mut frame = Frame::from_surface(surface, width, height);
    frame.colorspace = ColorSpace::Bt601;
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles_and_exhausts() {
        let mut backend = MockBackend::new().with_pool_capacity(2);
        let mut pool = backend
            .create_pool(PoolDesc {
                sw_format: ImageFormat::Nv12,
                width: 64,
                height: 64,
            })
            .unwrap();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert!(pool.alloc().is_err());
        assert_eq!(pool.in_use(), 2);

        let a_id = a.id();
        drop(a);
        assert_eq!(pool.alloc().unwrap().id(), a_id);
        drop(b);
    }

    #[test]
    fn picture_nesting_is_checked() {
        let mut backend = MockBackend::new();
        let ctx = ContextId(1);
        backend.begin_picture(ctx, SurfaceId(3)).unwrap();
        assert!(backend.begin_picture(ctx, SurfaceId(4)).is_err());
        backend.end_picture(ctx).unwrap();
        assert!(backend.end_picture(ctx).is_err());
        assert!(backend.render_picture(ctx, &[]).is_err());
    }

    #[test]
    fn injected_failures() {
        let mut backend = MockBackend::new();
        backend.fail_on("vaCreateConfig");
        let err = backend.create_config().unwrap_err();
        assert_eq!(err.call, "vaCreateConfig");
        backend.clear_failures();
        assert!(backend.create_config().is_ok());
    }
}
