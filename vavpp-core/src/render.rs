//! # Frame Renderer
//!
//! Produces one output frame per call: either the current queue frame passed
//! through untouched, or a new surface rendered by the backend from the
//! current frame plus its reference window.
//!
//! Every backend object created while rendering (open picture, pipeline
//! parameter buffer) is released before returning, on success and on every
//! error path. `PictureScope` owns that cleanup.

use std::sync::Arc;

use serde::Serialize;

use crate::backend::{
    BufferId, ContextId, DeintFlags, PictureField, Rect, RenderRequest, SurfacePool, VppBackend,
};
use crate::error::{BackendError, VppError};
use crate::negotiate::PipelineNegotiator;
use crate::refqueue::ReferenceQueue;
use crate::surface::{FieldFlags, Frame, SurfaceId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderStats {
    pub rendered: u64,
    pub passed_through: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
pub struct FrameRenderer {
    stats: RenderStats,
}

impl FrameRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// Produce the next output frame.
    ///
    /// `Ok(None)` means the queue needs more input. An `Err` costs exactly one
    /// output frame; the queue has already moved past it.
    pub fn produce_next<B: VppBackend>(
        &mut self,
        backend: &mut B,
        context: ContextId,
        pipeline: &PipelineNegotiator,
        queue: &mut ReferenceQueue,
        pool: Option<&mut B::Pool>,
    ) -> Result<Option<Frame>, VppError> {
        if !queue.has_output() {
            return Ok(None);
        }
        let Some(current) = queue.get(0).cloned() else {
            return Ok(None);
        };

        if pipeline.active_filters().is_empty() || !queue.should_deinterlace() {
            queue.advance_frame();
            self.stats.passed_through += 1;
            return Ok(Some(current));
        }

        let result = self.render(backend, context, pipeline, queue, pool, &current);
        queue.advance_field();

        match result {
            Ok(frame) => {
                self.stats.rendered += 1;
                Ok(Some(frame))
            }
            Err(e) => {
                self.stats.failed += 1;
                tracing::warn!("cannot render frame {:?}: {}", current.surface_id(), e);
                Err(e)
            }
        }
    }

    fn render<B: VppBackend>(
        &mut self,
        backend: &mut B,
        context: ContextId,
        pipeline: &PipelineNegotiator,
        queue: &ReferenceQueue,
        pool: Option<&mut B::Pool>,
        current: &Frame,
    ) -> Result<Frame, VppError> {
        let source = current.surface_id();
        if !source.is_valid() {
            return Err(VppError::SubmissionFailed(BackendError::new(
                "render",
                6,
                "current frame is not on a hardware surface",
            )));
        }

        let pool = pool.ok_or_else(|| VppError::SurfaceAllocationFailed("no surface pool configured".into()))?;
        let target = pool
            .alloc()
            .map_err(|e| VppError::SurfaceAllocationFailed(e.to_string()))?;
        if !target.id().is_valid() {
            return Err(VppError::SurfaceAllocationFailed("pool returned an invalid surface".into()));
        }
        let target = Arc::new(target);

        let request = build_request(pipeline, queue, current, target.id());
        trace_request(&request);

        let deint_flags = deinterlace_flags(request.field, queue.top_field_first());
        submit(backend, context, pipeline.deinterlace_buffer(), deint_flags, &request)
            .map_err(VppError::SubmissionFailed)?;

        let mut out = Frame::from_surface(target, current.width, current.height);
        out.copy_attributes(current);
        out.pts = queue.current_pts();
        if request.field != PictureField::Frame {
            out.fields.remove(FieldFlags::INTERLACED);
        }
        Ok(out)
    }
}

/// Assemble the request for the field the queue is currently on.
pub fn build_request(
    pipeline: &PipelineNegotiator,
    queue: &ReferenceQueue,
    current: &Frame,
    destination: SurfaceId,
) -> RenderRequest {
    let field = if !queue.should_deinterlace() {
        PictureField::Frame
    } else if queue.is_top_field() {
        PictureField::Top
    } else {
        PictureField::Bottom
    };

    // Some drivers fill the two lists the wrong way round; hand them past
    // frames as forward references and vice versa.
    let dir: isize = if pipeline.reversal_bug() { -1 } else { 1 };
    let (num_forward, num_backward) = pipeline.reported_refs();

    RenderRequest {
        source: current.surface_id(),
        destination,
        source_region: Rect::of_size(current.width, current.height),
        output_region: Rect::of_size(current.width, current.height),
        field,
        colorspace: current.colorspace,
        filters: pipeline.active_filters().to_vec(),
        forward_references: collect_refs(queue, num_forward, dir),
        backward_references: collect_refs(queue, num_backward, -dir),
    }
}

/// Up to `max` surfaces at offsets `dir, 2*dir, ...`, stopping at the first
/// missing frame.
fn collect_refs(queue: &ReferenceQueue, max: usize, dir: isize) -> Vec<SurfaceId> {
    (1..=max as isize)
        .map(|n| queue.get(n * dir).map(|f| f.surface_id()))
        .take_while(|id| id.is_some_and(|id| id.is_valid()))
        .flatten()
        .collect()
}

fn deinterlace_flags(field: PictureField, top_field_first: bool) -> DeintFlags {
    let mut flags = if field == PictureField::Top {
        DeintFlags::empty()
    } else {
        DeintFlags::BOTTOM_FIELD
    };
    if !top_field_first {
        flags |= DeintFlags::BOTTOM_FIELD_FIRST;
    }
    flags
}

fn trace_request(request: &RenderRequest) {
    tracing::trace!("in={:?} out={:?} {:?}", request.source, request.destination, request.field);
    for (n, id) in request.backward_references.iter().enumerate() {
        tracing::trace!(" b{}={:?}", n, id);
    }
    for (n, id) in request.forward_references.iter().enumerate() {
        tracing::trace!(" f{}={:?}", n, id);
    }
}

fn submit<B: VppBackend>(
    backend: &mut B,
    context: ContextId,
    deint_buffer: Option<BufferId>,
    deint_flags: DeintFlags,
    request: &RenderRequest,
) -> Result<(), BackendError> {
    let mut scope = PictureScope::new(backend, context);
    scope.begin(request.destination)?;

    if let Some(buffer) = deint_buffer {
        scope.backend.update_deinterlace_flags(buffer, deint_flags)?;
    }

    let params = scope.create_pipeline_buffer(request)?;
    scope.render(&[params])?;
    scope.end()
}

// ============================================================================
// Picture Scope
// ============================================================================

/// Ends an open picture and destroys transient buffers when dropped.
struct PictureScope<'a, B: VppBackend> {
    backend: &'a mut B,
    context: ContextId,
    open: bool,
    transient: Vec<BufferId>,
}

impl<'a, B: VppBackend> PictureScope<'a, B> {
    fn new(backend: &'a mut B, context: ContextId) -> Self {
        Self {
            backend,
            context,
            open: false,
            transient: Vec::new(),
        }
    }

    fn begin(&mut self, target: SurfaceId) -> Result<(), BackendError> {
        self.backend.begin_picture(self.context, target)?;
        self.open = true;
        Ok(())
    }

    fn create_pipeline_buffer(&mut self, request: &RenderRequest) -> Result<BufferId, BackendError> {
        let buffer = self.backend.create_pipeline_buffer(self.context, request)?;
        self.transient.push(buffer);
        Ok(buffer)
    }

    fn render(&mut self, buffers: &[BufferId]) -> Result<(), BackendError> {
        self.backend.render_picture(self.context, buffers)
    }

    fn end(mut self) -> Result<(), BackendError> {
        self.open = false;
        self.backend.end_picture(self.context)
    }
}

impl<B: VppBackend> Drop for PictureScope<'_, B> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.backend.end_picture(self.context) {
                tracing::debug!("ending aborted picture: {}", e);
            }
        }
        for buffer in self.transient.drain(..) {
            self.backend.destroy_buffer(buffer);
        }
    }
}
