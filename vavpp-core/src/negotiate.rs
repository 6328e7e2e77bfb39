//! # Pipeline Negotiation
//!
//! Builds the filter chain when the filter is opened, then asks the backend
//! what that chain needs (reference frames, colour standards) and sizes the
//! reference queue accordingly.
//!
//! Any query failure degrades to pass-through: no filters, no references,
//! no deinterlacing. Nothing here is fatal except failing to list the
//! context's filters at all.

use serde::Serialize;

use crate::backend::{
    BufferId, ContextId, DeintAlgorithm, DeintFlags, FilterParams, FilterType, PipelineCaps, VppBackend,
};
use crate::config::{DeintMode, DeintOptions};
use crate::error::VppError;
use crate::refqueue::{QueueMode, ReferenceQueue};

/// One filter buffer owned by the negotiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FilterDescriptor {
    pub buffer: BufferId,
    pub filter: FilterType,
    pub algorithm: DeintAlgorithm,
}

/// Cache key of the last negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainKey {
    filters: Vec<BufferId>,
    deinterlace: bool,
}

#[derive(Debug)]
pub struct PipelineNegotiator {
    options: DeintOptions,
    /// All filter buffers created at open time
    descriptors: Vec<FilterDescriptor>,
    /// Filters of the negotiated chain; empty means pass-through
    active: Vec<BufferId>,
    caps: Option<PipelineCaps>,
    last: Option<ChainKey>,
}

impl PipelineNegotiator {
    /// Create filter buffers for every supported filter the backend offers.
    pub fn build<B: VppBackend>(
        backend: &mut B,
        context: ContextId,
        options: DeintOptions,
    ) -> Result<Self, VppError> {
        let available = backend
            .query_filters(context)
            .map_err(VppError::InitializationFailed)?;
        tracing::debug!("{} offers filters {:?}", backend.name(), available);

        let mut descriptors = Vec::new();
        for filter in available {
            match filter {
                FilterType::Deinterlacing => {
                    if let Some(desc) = build_deinterlacer(backend, context, options.deint) {
                        descriptors.push(desc);
                    }
                }
                // other filters are not wired up yet
                _ => {}
            }
        }

        if options.deint.is_enabled() && descriptors.is_empty() {
            tracing::warn!("{}", VppError::UnsupportedAlgorithm(options.deint));
        }

        Ok(Self {
            options,
            descriptors,
            active: Vec::new(),
            caps: None,
            last: None,
        })
    }

    /// Negotiate the chain for the current deinterlace state and configure
    /// `queue`. Cheap when nothing changed since the last call.
    pub fn configure<B: VppBackend>(
        &mut self,
        backend: &mut B,
        context: ContextId,
        deinterlace: bool,
        queue: &mut ReferenceQueue,
    ) {
        let filters: Vec<BufferId> = self
            .descriptors
            .iter()
            .filter(|d| deinterlace || d.filter != FilterType::Deinterlacing)
            .map(|d| d.buffer)
            .collect();

        let key = ChainKey { filters, deinterlace };
        if self.last.as_ref() == Some(&key) {
            return;
        }
        let filters = key.filters.clone();
        self.last = Some(key);

        self.active.clear();
        self.caps = None;

        if filters.is_empty() {
            self.pass_through(queue);
            return;
        }

        let caps = match backend.query_pipeline_caps(context, &filters) {
            Ok(caps) => caps,
            Err(e) => {
                tracing::warn!("{}, passing frames through", VppError::BackendQueryFailed(e));
                self.pass_through(queue);
                return;
            }
        };

        let forward = caps.num_forward_references as usize;
        let backward = caps.num_backward_references as usize;
        if self.options.reversal_bug {
            let max = forward.max(backward);
            queue.set_refs(max, max);
        } else {
            queue.set_refs(backward, forward);
        }

        let mut mode = QueueMode::empty();
        if deinterlace {
            mode |= QueueMode::DEINTERLACE;
        }
        if self.options.deint.doubles_fields() {
            mode |= QueueMode::OUTPUT_FIELDS;
        }
        if self.options.interlaced_only {
            mode |= QueueMode::INTERLACED_ONLY;
        }
        queue.set_mode(mode);

        tracing::debug!(
            "pipeline: {} filters, refs forward={} backward={} (queue {}/{}), mode {:?}",
            filters.len(),
            forward,
            backward,
            queue.backward_depth(),
            queue.forward_depth(),
            mode
        );

        self.active = filters;
        self.caps = Some(caps);
    }

    fn pass_through(&mut self, queue: &mut ReferenceQueue) {
        queue.set_refs(0, 0);
        queue.set_mode(QueueMode::empty());
    }

    /// Forget the last negotiation, e.g. after a format change.
    pub fn invalidate(&mut self) {
        self.last = None;
        self.active.clear();
        self.caps = None;
    }

    pub fn active_filters(&self) -> &[BufferId] {
        &self.active
    }

    /// Deinterlacing buffer of the active chain.
    pub fn deinterlace_buffer(&self) -> Option<BufferId> {
        self.descriptors
            .iter()
            .find(|d| d.filter == FilterType::Deinterlacing && self.active.contains(&d.buffer))
            .map(|d| d.buffer)
    }

    pub fn caps(&self) -> Option<&PipelineCaps> {
        self.caps.as_ref()
    }

    /// Reference counts as reported by the backend: (forward, backward).
    pub fn reported_refs(&self) -> (usize, usize) {
        self.caps
            .as_ref()
            .map(|c| (c.num_forward_references as usize, c.num_backward_references as usize))
            .unwrap_or((0, 0))
    }

    pub fn reversal_bug(&self) -> bool {
        self.options.reversal_bug
    }

    pub fn options(&self) -> &DeintOptions {
        &self.options
    }

    pub fn descriptors(&self) -> &[FilterDescriptor] {
        &self.descriptors
    }

    pub fn has_deinterlacer(&self) -> bool {
        self.descriptors.iter().any(|d| d.filter == FilterType::Deinterlacing)
    }

    /// Destroy all filter buffers.
    pub fn release<B: VppBackend>(&mut self, backend: &mut B) {
        for desc in self.descriptors.drain(..) {
            backend.destroy_buffer(desc.buffer);
        }
        self.invalidate();
    }
}

fn build_deinterlacer<B: VppBackend>(
    backend: &mut B,
    context: ContextId,
    mode: DeintMode,
) -> Option<FilterDescriptor> {
    if !mode.is_enabled() {
        return None;
    }

    let supported = match backend.query_deinterlace_caps(context) {
        Ok(caps) => caps,
        Err(e) => {
            tracing::warn!("{}", VppError::BackendQueryFailed(e));
            return None;
        }
    };

    let algorithm = mode.algorithm();
    if !supported.contains(&algorithm) {
        tracing::debug!("deinterlacing algorithms offered: {:?}", supported);
        return None;
    }

    let params = FilterParams::Deinterlacing {
        algorithm,
        flags: DeintFlags::empty(),
    };
    match backend.create_filter_buffer(context, &params) {
        Ok(buffer) => {
            tracing::info!("deinterlacing with {} ({:?})", mode, algorithm);
            Some(FilterDescriptor {
                buffer,
                filter: FilterType::Deinterlacing,
                algorithm,
            })
        }
        Err(e) => {
            tracing::warn!("deinterlacing filter buffer: {}", e);
            None
        }
    }
}

// ============================================================================
// Capability Probe
// ============================================================================

/// Pipeline requirements of one deinterlacing algorithm.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlgorithmCaps {
    pub algorithm: DeintAlgorithm,
    pub caps: PipelineCaps,
}

/// What a backend offers, as printed by `vavpp probe`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendReport {
    pub backend: String,
    pub filters: Vec<FilterType>,
    pub deinterlace_algorithms: Vec<DeintAlgorithm>,
    pub pipelines: Vec<AlgorithmCaps>,
}

/// Query filters, deinterlacing algorithms and per-algorithm pipeline caps
/// on a temporary context.
pub fn probe_backend<B: VppBackend>(backend: &mut B) -> Result<BackendReport, VppError> {
    let config = backend.create_config().map_err(VppError::InitializationFailed)?;
    let context = match backend.create_context(config) {
        Ok(context) => context,
        Err(e) => {
            backend.destroy_config(config);
            return Err(VppError::InitializationFailed(e));
        }
    };

    let report = probe_context(backend, context);

    backend.destroy_context(context);
    backend.destroy_config(config);
    report
}

fn probe_context<B: VppBackend>(backend: &mut B, context: ContextId) -> Result<BackendReport, VppError> {
    let filters = backend
        .query_filters(context)
        .map_err(VppError::InitializationFailed)?;

    let mut report = BackendReport {
        backend: backend.name().to_string(),
        filters,
        deinterlace_algorithms: Vec::new(),
        pipelines: Vec::new(),
    };
    if !report.filters.contains(&FilterType::Deinterlacing) {
        return Ok(report);
    }

    report.deinterlace_algorithms = backend
        .query_deinterlace_caps(context)
        .map_err(VppError::BackendQueryFailed)?;

    for &algorithm in &report.deinterlace_algorithms {
        let params = FilterParams::Deinterlacing {
            algorithm,
            flags: DeintFlags::empty(),
        };
        let buffer = match backend.create_filter_buffer(context, &params) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!("{:?}: {}", algorithm, e);
                continue;
            }
        };
        let caps = backend.query_pipeline_caps(context, &[buffer]);
        backend.destroy_buffer(buffer);
        match caps {
            Ok(caps) => report.pipelines.push(AlgorithmCaps { algorithm, caps }),
            Err(e) => tracing::warn!("{:?}: {}", algorithm, VppError::BackendQueryFailed(e)),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, MockCall};

    fn open(backend: &mut MockBackend, options: DeintOptions) -> (PipelineNegotiator, ContextId) {
        let config = backend.create_config().unwrap();
        let context = backend.create_context(config).unwrap();
        let neg = PipelineNegotiator::build(backend, context, options).unwrap();
        (neg, context)
    }

    fn options(deint: DeintMode, reversal_bug: bool) -> DeintOptions {
        DeintOptions {
            deint,
            interlaced_only: true,
            reversal_bug,
        }
    }

    #[test]
    fn reversal_bug_equalizes_depths() {
        for (f, b) in [(0, 0), (2, 1), (1, 2), (3, 0)] {
            let mut backend = MockBackend::new().with_refs(f, b);
            let (mut neg, ctx) = open(&mut backend, options(DeintMode::Bob, true));
            let mut queue = ReferenceQueue::new();
            neg.configure(&mut backend, ctx, true, &mut queue);

            let max = f.max(b) as usize;
            assert_eq!(queue.forward_depth(), max, "caps ({}, {})", f, b);
            assert_eq!(queue.backward_depth(), max, "caps ({}, {})", f, b);
            assert_eq!(neg.reported_refs(), (f as usize, b as usize));
        }
    }

    #[test]
    fn depths_follow_caps_without_workaround() {
        let mut backend = MockBackend::new().with_refs(2, 1);
        let (mut neg, ctx) = open(&mut backend, options(DeintMode::MotionAdaptive, false));
        let mut queue = ReferenceQueue::new();
        neg.configure(&mut backend, ctx, true, &mut queue);

        assert_eq!(queue.forward_depth(), 2);
        assert_eq!(queue.backward_depth(), 1);
        assert_eq!(
            queue.mode(),
            QueueMode::DEINTERLACE | QueueMode::OUTPUT_FIELDS | QueueMode::INTERLACED_ONLY
        );
        assert_eq!(neg.active_filters().len(), 1);
        assert!(neg.deinterlace_buffer().is_some());
    }

    #[test]
    fn weave_does_not_output_fields() {
        let mut backend = MockBackend::new();
        let (mut neg, ctx) = open(&mut backend, options(DeintMode::Weave, true));
        let mut queue = ReferenceQueue::new();
        neg.configure(&mut backend, ctx, true, &mut queue);
        assert!(!queue.mode().contains(QueueMode::OUTPUT_FIELDS));
        assert!(queue.mode().contains(QueueMode::DEINTERLACE));
    }

    #[test]
    fn unsupported_algorithm_builds_no_filter() {
        let mut backend = MockBackend::new().with_algorithms(&[DeintAlgorithm::Bob]);
        let (mut neg, ctx) = open(&mut backend, options(DeintMode::MotionCompensated, true));
        assert!(neg.descriptors().is_empty());

        let mut queue = ReferenceQueue::new();
        neg.configure(&mut backend, ctx, true, &mut queue);
        assert!(neg.active_filters().is_empty());
        assert_eq!(queue.mode(), QueueMode::empty());
    }

    #[test]
    fn deint_none_skips_filter_creation() {
        let mut backend = MockBackend::new();
        let (neg, _) = open(&mut backend, options(DeintMode::None, true));
        assert!(neg.descriptors().is_empty());
        assert_eq!(backend.count(|c| matches!(c, MockCall::QueryDeinterlaceCaps)), 0);
    }

    #[test]
    fn failed_caps_query_passes_through() {
        let mut backend = MockBackend::new().with_refs(2, 2);
        let (mut neg, ctx) = open(&mut backend, options(DeintMode::Bob, true));
        backend.fail_on("vaQueryVideoProcPipelineCaps");

        let mut queue = ReferenceQueue::new();
        queue.set_refs(4, 4);
        neg.configure(&mut backend, ctx, true, &mut queue);

        assert!(neg.active_filters().is_empty());
        assert!(neg.caps().is_none());
        assert_eq!((queue.forward_depth(), queue.backward_depth()), (0, 0));
        assert_eq!(queue.mode(), QueueMode::empty());
    }

    #[test]
    fn runtime_toggle_drops_deinterlacer_from_chain() {
        let mut backend = MockBackend::new().with_refs(1, 1);
        let (mut neg, ctx) = open(&mut backend, options(DeintMode::Bob, false));
        let mut queue = ReferenceQueue::new();

        neg.configure(&mut backend, ctx, false, &mut queue);
        assert!(neg.active_filters().is_empty());
        assert_eq!(queue.mode(), QueueMode::empty());

        neg.configure(&mut backend, ctx, true, &mut queue);
        assert_eq!(neg.active_filters().len(), 1);
        assert_eq!(queue.forward_depth(), 1);
    }

    #[test]
    fn repeated_configure_is_cached() {
        let mut backend = MockBackend::new();
        let (mut neg, ctx) = open(&mut backend, options(DeintMode::Bob, true));
        let mut queue = ReferenceQueue::new();

        for _ in 0..5 {
            neg.configure(&mut backend, ctx, true, &mut queue);
        }
        assert_eq!(backend.count(|c| matches!(c, MockCall::QueryPipelineCaps(_))), 1);

        neg.invalidate();
        neg.configure(&mut backend, ctx, true, &mut queue);
        assert_eq!(backend.count(|c| matches!(c, MockCall::QueryPipelineCaps(_))), 2);
    }

    #[test]
    fn probe_reports_every_algorithm() {
        let mut backend = MockBackend::new().with_refs(2, 1);
        let report = probe_backend(&mut backend).unwrap();

        assert_eq!(report.backend, "mock");
        assert_eq!(report.deinterlace_algorithms.len(), 4);
        assert_eq!(report.pipelines.len(), 4);
        assert_eq!(report.pipelines[0].caps.num_forward_references, 2);
        assert_eq!(backend.live_buffers(), 0);
        assert!(matches!(backend.calls().last(), Some(MockCall::DestroyConfig(_))));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["filters"][1], "Deinterlacing");
    }

    #[test]
    fn probe_without_deinterlacer() {
        let mut backend = MockBackend::new().with_filters(&[FilterType::Sharpening]);
        let report = probe_backend(&mut backend).unwrap();
        assert!(report.deinterlace_algorithms.is_empty());
        assert!(report.pipelines.is_empty());
    }

    #[test]
    fn release_destroys_filter_buffers() {
        let mut backend = MockBackend::new();
        let (mut neg, _) = open(&mut backend, options(DeintMode::Bob, true));
        let buffer = neg.descriptors()[0].buffer;
        neg.release(&mut backend);
        assert!(neg.descriptors().is_empty());
        assert!(backend.calls().contains(&MockCall::DestroyBuffer(buffer)));
        assert_eq!(backend.live_buffers(), 0);
    }
}
