//! # Post-Processing Filter
//!
//! `VppFilter` owns one backend instance and everything created on it: the
//! config/context pair, the filter chain, the reference queue and the output
//! surface pool.
//!
//! Usage:
//! ```text
//! let mut vpp = VppFilter::open(backend, options)?;
//! let out_params = vpp.reconfig(&in_params)?;
//! for frame in input {
//!     vpp.filter_input(Some(frame))?;
//!     while let Some(out) = vpp.filter_output()? { ... }
//! }
//! vpp.filter_input(None)?;   // end of stream, then drain filter_output()
//! ```

use std::sync::Arc;

use crate::backend::{ConfigId, ContextId, PoolDesc, SurfacePool, VppBackend};
use crate::config::DeintOptions;
use crate::error::VppError;
use crate::negotiate::PipelineNegotiator;
use crate::refqueue::ReferenceQueue;
use crate::render::{FrameRenderer, RenderStats};
use crate::surface::{Frame, ImageFormat, StreamParams};

pub struct VppFilter<B: VppBackend> {
    backend: B,
    config: ConfigId,
    context: ContextId,
    negotiator: PipelineNegotiator,
    renderer: FrameRenderer,
    queue: ReferenceQueue,
    pool: Option<B::Pool>,
    params: Option<StreamParams>,
    /// Runtime deinterlace switch
    do_deint: bool,
}

impl<B: VppBackend> VppFilter<B> {
    /// Create the processing config and context and build the filter chain.
    pub fn open(mut backend: B, options: DeintOptions) -> Result<Self, VppError> {
        let config = backend.create_config().map_err(VppError::InitializationFailed)?;

        let context = match backend.create_context(config) {
            Ok(context) => context,
            Err(e) => {
                backend.destroy_config(config);
                return Err(VppError::InitializationFailed(e));
            }
        };

        let negotiator = match PipelineNegotiator::build(&mut backend, context, options) {
            Ok(negotiator) => negotiator,
            Err(e) => {
                backend.destroy_context(context);
                backend.destroy_config(config);
                return Err(e);
            }
        };

        tracing::info!(
            "{} video processing opened ({})",
            backend.name(),
            options.to_suboptions()
        );

        Ok(Self {
            backend,
            config,
            context,
            negotiator,
            renderer: FrameRenderer::new(),
            queue: ReferenceQueue::new(),
            pool: None,
            params: None,
            do_deint: options.deint.is_enabled(),
        })
    }

    /// Output format for input `format`, or `None` if it is not accepted.
    pub fn query_format(&self, format: ImageFormat) -> Option<ImageFormat> {
        match format {
            ImageFormat::Vaapi | ImageFormat::Nv12 | ImageFormat::Yuv420p => Some(ImageFormat::Vaapi),
        }
    }

    /// Switch to new input parameters. Buffered frames are discarded.
    pub fn reconfig(&mut self, input: &StreamParams) -> Result<StreamParams, VppError> {
        self.queue.flush();
        self.pool = None;
        self.params = None;
        self.negotiator.invalidate();

        let (sw_format, width, height) = if input.format.is_hardware() {
            let (w, h) = input.hw_surface_size.ok_or_else(|| {
                VppError::ReconfigurationFailed("hardware input without surface pool size".into())
            })?;
            (input.hw_subformat.unwrap_or(ImageFormat::Nv12), w, h)
        } else {
            (ImageFormat::Nv12, input.width, input.height)
        };

        let desc = PoolDesc {
            sw_format,
            width,
            height,
        };
        let pool = self
            .backend
            .create_pool(desc)
            .map_err(|e| VppError::ReconfigurationFailed(e.to_string()))?;

        let output = StreamParams {
            format: ImageFormat::Vaapi,
            hw_subformat: Some(sw_format),
            width: input.width,
            height: input.height,
            colorspace: input.colorspace,
            hw_surface_size: Some((width, height)),
        };

        tracing::info!(
            "reconfig {:?} {}x{} -> {:?}[{:?}] pool {}x{}",
            input.format,
            input.width,
            input.height,
            output.format,
            sw_format,
            width,
            height
        );

        self.pool = Some(pool);
        self.params = Some(*input);
        Ok(output)
    }

    /// Queue one input frame, or end of stream with `None`.
    ///
    /// A software frame that cannot be uploaded is dropped and the error
    /// returned; the stream continues with the next frame.
    pub fn filter_input(&mut self, frame: Option<Frame>) -> Result<(), VppError> {
        self.negotiator
            .configure(&mut self.backend, self.context, self.do_deint, &mut self.queue);

        let frame = match frame {
            Some(frame) if !frame.format.is_hardware() => Some(self.upload(&frame)?),
            other => other,
        };
        self.queue.push(frame);
        Ok(())
    }

    /// Produce the next output frame, `Ok(None)` when more input is needed.
    pub fn filter_output(&mut self) -> Result<Option<Frame>, VppError> {
        self.renderer.produce_next(
            &mut self.backend,
            self.context,
            &self.negotiator,
            &mut self.queue,
            self.pool.as_mut(),
        )
    }

    fn upload(&mut self, frame: &Frame) -> Result<Frame, VppError> {
        let pool = self
            .pool
            .as_mut()
            .ok_or_else(|| VppError::SurfaceAllocationFailed("no surface pool for upload".into()))?;
        let surface = pool
            .alloc()
            .map_err(|e| VppError::SurfaceAllocationFailed(e.to_string()))?;
        pool.upload(&surface, frame)
            .map_err(|e| VppError::SurfaceAllocationFailed(e.to_string()))?;

        let mut uploaded = Frame::from_surface(Arc::new(surface), frame.width, frame.height);
        uploaded.copy_attributes(frame);
        Ok(uploaded)
    }

    // ========================================================================
    // Controls
    // ========================================================================

    /// Drop all buffered frames, e.g. after a seek.
    pub fn seek_reset(&mut self) {
        tracing::debug!("seek reset, dropping {} queued frames", self.queue.len());
        self.queue.flush();
    }

    /// Turn deinterlacing on or off at runtime. Returns false if no
    /// deinterlacing mode was configured at open time.
    pub fn set_deinterlace(&mut self, on: bool) -> bool {
        if !self.negotiator.options().deint.is_enabled() {
            return false;
        }
        if self.do_deint != on {
            tracing::info!("deinterlacing {}", if on { "enabled" } else { "disabled" });
        }
        self.do_deint = on;
        true
    }

    pub fn deinterlace_enabled(&self) -> bool {
        self.do_deint
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn negotiator(&self) -> &PipelineNegotiator {
        &self.negotiator
    }

    pub fn queue(&self) -> &ReferenceQueue {
        &self.queue
    }

    pub fn pool(&self) -> Option<&B::Pool> {
        self.pool.as_ref()
    }

    pub fn params(&self) -> Option<&StreamParams> {
        self.params.as_ref()
    }

    pub fn stats(&self) -> RenderStats {
        self.renderer.stats()
    }
}

impl<B: VppBackend> Drop for VppFilter<B> {
    fn drop(&mut self) {
        self.negotiator.release(&mut self.backend);
        if self.context.is_valid() {
            self.backend.destroy_context(self.context);
        }
        if self.config.is_valid() {
            self.backend.destroy_config(self.config);
        }
        self.pool = None;
        self.queue.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PictureField;
    use crate::config::DeintMode;
    use crate::mock::{self, MockBackend, MockCall};
    use crate::surface::{FieldFlags, SoftwareImage, SurfaceId};

    fn options(deint: DeintMode, reversal_bug: bool) -> DeintOptions {
        DeintOptions {
            deint,
            interlaced_only: true,
            reversal_bug,
        }
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn open(backend: MockBackend, deint: DeintMode, reversal_bug: bool) -> VppFilter<MockBackend> {
        init_logging();
        let mut vpp = VppFilter::open(backend, options(deint, reversal_bug)).unwrap();
        vpp.reconfig(&StreamParams::hardware(720, 576, 720, 576)).unwrap();
        vpp
    }

    fn interlaced(id: u32) -> Frame {
        mock::hw_frame(id, 720, 576)
            .with_fields(FieldFlags::INTERLACED | FieldFlags::TOP_FIRST)
            .with_pts(id as f64 * 0.04)
    }

    fn drain(vpp: &mut VppFilter<MockBackend>, out: &mut Vec<Frame>) {
        while let Some(frame) = vpp.filter_output().unwrap() {
            out.push(frame);
        }
    }

    fn run(vpp: &mut VppFilter<MockBackend>, frames: impl IntoIterator<Item = Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        for frame in frames {
            vpp.filter_input(Some(frame)).unwrap();
            drain(vpp, &mut out);
        }
        vpp.filter_input(None).unwrap();
        drain(vpp, &mut out);
        out
    }

    #[test]
    fn weave_with_one_reference_each_way() {
        let mut vpp = open(MockBackend::new().with_refs(1, 1), DeintMode::Weave, false);
        let out = run(&mut vpp, (1..=5).map(interlaced));
        assert_eq!(out.len(), 5);

        let subs = vpp.backend().submissions();
        assert_eq!(subs.len(), 5);
        assert!(subs[0].request.backward_references.is_empty());
        assert_eq!(subs[0].request.forward_references, vec![SurfaceId(2)]);
        for (i, sub) in subs.iter().enumerate().take(4).skip(1) {
            let id = i as u32 + 1;
            assert_eq!(sub.request.source, SurfaceId(id));
            assert_eq!(sub.request.backward_references, vec![SurfaceId(id - 1)]);
            assert_eq!(sub.request.forward_references, vec![SurfaceId(id + 1)]);
        }
        assert!(subs[4].request.forward_references.is_empty());
        assert_eq!(subs[4].request.backward_references, vec![SurfaceId(4)]);
    }

    #[test]
    fn bob_without_references_doubles() {
        let mut vpp = open(MockBackend::new(), DeintMode::Bob, true);
        let out = run(&mut vpp, (1..=3).map(interlaced));
        assert_eq!(out.len(), 6);

        let fields: Vec<PictureField> = vpp.backend().submissions().iter().map(|s| s.request.field).collect();
        assert_eq!(
            fields,
            [
                PictureField::Top,
                PictureField::Bottom,
                PictureField::Top,
                PictureField::Bottom,
                PictureField::Top,
                PictureField::Bottom
            ]
        );
        for sub in vpp.backend().submissions() {
            assert!(sub.request.forward_references.is_empty());
            assert!(sub.request.backward_references.is_empty());
        }
        assert!(out.iter().all(|f| !f.is_interlaced()));
    }

    #[test]
    fn doubled_fields_get_distinct_timestamps() {
        let mut vpp = open(MockBackend::new(), DeintMode::Bob, true);
        let out = run(&mut vpp, (1..=3).map(interlaced));
        let pts: Vec<f64> = out.iter().map(|f| f.pts.unwrap()).collect();
        assert_eq!(pts.len(), 6);
        for pair in pts.windows(2) {
            assert!(pair[1] > pair[0], "{:?}", pts);
        }
        assert!((pts[1] - 0.06).abs() < 1e-9);
        assert!((pts[5] - 0.14).abs() < 1e-9);
    }

    #[test]
    fn output_count_per_mode() {
        const N: usize = 6;
        for mode in DeintMode::ALL {
            let mut vpp = open(MockBackend::new().with_refs(1, 1), mode, true);
            let out = run(&mut vpp, (1..=N as u32).map(interlaced));
            let expected = if mode.doubles_fields() { 2 * N } else { N };
            assert_eq!(out.len(), expected, "{}", mode);
        }
    }

    #[test]
    fn steady_state_emits_two_fields_per_input() {
        let mut vpp = open(MockBackend::new().with_refs(1, 1), DeintMode::MotionAdaptive, true);
        let mut out = Vec::new();
        vpp.filter_input(Some(interlaced(1))).unwrap();
        drain(&mut vpp, &mut out);
        vpp.filter_input(Some(interlaced(2))).unwrap();
        drain(&mut vpp, &mut out);
        for id in 3..=6 {
            let before = out.len();
            vpp.filter_input(Some(interlaced(id))).unwrap();
            drain(&mut vpp, &mut out);
            assert_eq!(out.len() - before, 2);
        }
    }

    #[test]
    fn failed_caps_query_passes_frames_through() {
        let mut backend = MockBackend::new().with_refs(2, 2);
        backend.fail_on("vaQueryVideoProcPipelineCaps");
        let mut vpp = open(backend, DeintMode::Bob, true);

        let out = run(&mut vpp, (1..=4).map(interlaced));
        assert!(vpp.deinterlace_enabled());
        assert!(vpp.negotiator().active_filters().is_empty());
        let ids: Vec<SurfaceId> = out.iter().map(|f| f.surface_id()).collect();
        assert_eq!(ids, (1..=4).map(SurfaceId).collect::<Vec<_>>());
        assert!(out.iter().all(|f| f.is_interlaced()));
        assert!(vpp.backend().submissions().is_empty());
    }

    #[test]
    fn reconfig_mid_stream_flushes() {
        let mut vpp = open(MockBackend::new().with_refs(1, 1), DeintMode::Bob, false);
        let mut out = Vec::new();
        for id in 1..=3 {
            vpp.filter_input(Some(interlaced(id))).unwrap();
        }
        // one field of frame 1 only
        out.extend(vpp.filter_output().unwrap());
        assert!(vpp.queue().is_second_field());

        vpp.reconfig(&StreamParams::hardware(1280, 720, 1280, 736)).unwrap();
        assert!(vpp.queue().is_empty());
        assert!(!vpp.queue().is_second_field());
        assert!(vpp.filter_output().unwrap().is_none());

        let caps_queries = |vpp: &VppFilter<MockBackend>| {
            vpp.backend()
                .count(|c| matches!(c, MockCall::QueryPipelineCaps(_)))
        };
        assert_eq!(caps_queries(&vpp), 1);
        vpp.filter_input(Some(interlaced(10))).unwrap();
        assert_eq!(caps_queries(&vpp), 2);
        assert_eq!(vpp.pool().unwrap().desc().height, 736);
    }

    #[test]
    fn seek_reset_needs_lookahead_again() {
        let mut vpp = open(MockBackend::new().with_refs(2, 0), DeintMode::Weave, false);
        for id in 1..=4 {
            vpp.filter_input(Some(interlaced(id))).unwrap();
        }
        vpp.seek_reset();
        vpp.seek_reset();
        assert!(vpp.queue().is_empty());

        for id in 5..=6 {
            vpp.filter_input(Some(interlaced(id))).unwrap();
            assert!(vpp.filter_output().unwrap().is_none());
        }
        vpp.filter_input(Some(interlaced(7))).unwrap();
        assert!(vpp.filter_output().unwrap().is_some());
    }

    #[test]
    fn hardware_reconfig_requires_surface_size() {
        let mut vpp = VppFilter::open(MockBackend::new(), DeintOptions::default()).unwrap();
        let mut params = StreamParams::hardware(720, 576, 720, 576);
        params.hw_surface_size = None;
        let err = vpp.reconfig(&params).unwrap_err();
        assert!(matches!(err, VppError::ReconfigurationFailed(_)));
        assert!(err.is_fatal());
        assert!(vpp.pool().is_none());
    }

    #[test]
    fn pool_creation_failure_is_reconfig_error() {
        let mut backend = MockBackend::new();
        backend.fail_on("vaCreateSurfaces");
        let mut vpp = VppFilter::open(backend, DeintOptions::default()).unwrap();
        let err = vpp
            .reconfig(&StreamParams::software(ImageFormat::Nv12, 64, 64))
            .unwrap_err();
        assert!(matches!(err, VppError::ReconfigurationFailed(_)));
    }

    #[test]
    fn software_frames_are_uploaded() {
        let mut vpp = VppFilter::open(MockBackend::new(), DeintOptions::default()).unwrap();
        let out_params = vpp
            .reconfig(&StreamParams::software(ImageFormat::Yuv420p, 352, 288))
            .unwrap();
        assert_eq!(out_params.format, ImageFormat::Vaapi);
        assert_eq!(out_params.hw_subformat, Some(ImageFormat::Nv12));
        assert_eq!(out_params.hw_surface_size, Some((352, 288)));

        let image = SoftwareImage::filled(ImageFormat::Yuv420p, 352, 288, 0x80);
        vpp.filter_input(Some(Frame::from_image(image).with_pts(1.5))).unwrap();
        let out = vpp.filter_output().unwrap().unwrap();

        assert_eq!(out.format, ImageFormat::Vaapi);
        assert!(out.surface_id().is_valid());
        assert_eq!(out.pts, Some(1.5));
        assert_eq!(vpp.backend().count(|c| matches!(c, MockCall::Upload(_))), 1);
    }

    #[test]
    fn upload_without_pool_drops_frame() {
        let mut vpp = VppFilter::open(MockBackend::new(), DeintOptions::default()).unwrap();
        let image = SoftwareImage::filled(ImageFormat::Nv12, 16, 16, 0);
        let err = vpp.filter_input(Some(Frame::from_image(image))).unwrap_err();
        assert!(matches!(err, VppError::SurfaceAllocationFailed(_)));
        assert!(vpp.queue().is_empty());
    }

    #[test]
    fn runtime_toggle() {
        let mut vpp = open(MockBackend::new(), DeintMode::Bob, true);
        assert!(vpp.set_deinterlace(false));
        assert!(!vpp.deinterlace_enabled());
        let out = run(&mut vpp, (1..=3).map(interlaced));
        assert_eq!(out.len(), 3);
        assert!(vpp.backend().submissions().is_empty());

        assert!(vpp.set_deinterlace(true));
        let out = run(&mut vpp, (4..=5).map(interlaced));
        assert_eq!(out.len(), 4);

        let mut off = open(MockBackend::new(), DeintMode::None, true);
        assert!(!off.set_deinterlace(true));
        assert!(!off.deinterlace_enabled());
    }

    #[test]
    fn render_failure_costs_one_frame() {
        let mut vpp = open(MockBackend::new(), DeintMode::Bob, true);
        vpp.filter_input(Some(interlaced(1))).unwrap();
        vpp.backend_mut().fail_on("vaRenderPicture");
        assert!(vpp.filter_output().is_err());
        vpp.backend_mut().clear_failures();
        vpp.filter_input(Some(interlaced(2))).unwrap();

        let second = vpp.filter_output().unwrap().unwrap();
        assert!(second.surface_id().is_valid());
        assert_eq!(vpp.stats().failed, 1);
        assert_eq!(vpp.stats().rendered, 1);
    }

    #[test]
    fn open_failures_release_partial_objects() {
        let mut backend = MockBackend::new();
        let log = backend.log();
        backend.fail_on("vaCreateContext");
        let err = VppFilter::open(backend, DeintOptions::default()).err().unwrap();
        assert!(matches!(err, VppError::InitializationFailed(_)));
        assert!(matches!(log.calls().last(), Some(MockCall::DestroyConfig(_))));

        let mut backend = MockBackend::new();
        let log = backend.log();
        backend.fail_on("vaQueryVideoProcFilters");
        let err = VppFilter::open(backend, DeintOptions::default()).err().unwrap();
        assert!(matches!(err, VppError::InitializationFailed(_)));
        let calls = log.calls();
        let n = calls.len();
        assert!(matches!(calls[n - 2], MockCall::DestroyContext(_)));
        assert!(matches!(calls[n - 1], MockCall::DestroyConfig(_)));
    }

    #[test]
    fn teardown_order() {
        let mut vpp = open(MockBackend::new(), DeintMode::Bob, true);
        let _ = run(&mut vpp, (1..=2).map(interlaced));
        let buffer = vpp.negotiator().descriptors()[0].buffer;
        let log = vpp.backend().log();
        drop(vpp);

        let calls = log.calls();
        let pos = |pred: &dyn Fn(&MockCall) -> bool| calls.iter().rposition(|c| pred(c)).unwrap();
        let buffer_pos = pos(&|c| *c == MockCall::DestroyBuffer(buffer));
        let context_pos = pos(&|c| matches!(c, MockCall::DestroyContext(_)));
        let config_pos = pos(&|c| matches!(c, MockCall::DestroyConfig(_)));
        let pool_pos = pos(&|c| matches!(c, MockCall::DestroyPool));
        assert!(buffer_pos < context_pos);
        assert!(context_pos < config_pos);
        assert!(config_pos < pool_pos);
    }

    #[test]
    fn formats() {
        let vpp = VppFilter::open(MockBackend::new(), DeintOptions::default()).unwrap();
        for fmt in [ImageFormat::Vaapi, ImageFormat::Nv12, ImageFormat::Yuv420p] {
            assert_eq!(vpp.query_format(fmt), Some(ImageFormat::Vaapi));
        }
    }
}
