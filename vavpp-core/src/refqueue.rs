//! # Reference Queue
//!
//! Sliding window of input frames around the frame currently being
//! processed. The backend asks for a number of past (backward) and future
//! (forward) reference frames; the queue holds enough frames to satisfy that
//! and tracks which field of the current frame is next.
//!
//! ```text
//!   oldest                                   newest
//!   ┌────┬────┬─────────┬────┬────┐
//!   │ -2 │ -1 │ current │ +1 │ +2 │   get(offset)
//!   └────┴────┴─────────┴────┴────┘
//!   ◄─ backward_depth ─►  ◄─ forward_depth ─►
//! ```

use std::collections::VecDeque;

use bitflags::bitflags;

use crate::surface::Frame;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueueMode: u8 {
        /// Deinterlace frames at all
        const DEINTERLACE = 0x01;
        /// Output each field as its own frame
        const OUTPUT_FIELDS = 0x02;
        /// Only deinterlace frames flagged interlaced
        const INTERLACED_ONLY = 0x04;
    }
}

#[derive(Debug, Clone)]
struct QueuedFrame {
    frame: Frame,
    top_field_first: bool,
    interlaced: bool,
}

#[derive(Debug, Default)]
pub struct ReferenceQueue {
    /// Oldest first
    frames: VecDeque<QueuedFrame>,
    /// Index of the current frame; equal to `frames.len()` when nothing is
    /// pending.
    cursor: usize,
    second_field: bool,
    eof: bool,
    forward_depth: usize,
    backward_depth: usize,
    mode: QueueMode,
    /// Last plausible pts step between two pushed frames
    frame_gap: Option<f64>,
}

/// Step between two frame timestamps, if they are in order and less than a
/// second apart.
fn field_gap(pts: f64, next: f64) -> Option<f64> {
    let gap = next - pts;
    (gap > 0.0 && gap < 1.0).then_some(gap)
}

impl ReferenceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Set the number of past and future frames to keep around.
    pub fn set_refs(&mut self, backward: usize, forward: usize) {
        self.backward_depth = backward;
        self.forward_depth = forward;
        self.trim_past();
    }

    pub fn set_mode(&mut self, mode: QueueMode) {
        self.mode = mode;
    }

    pub fn forward_depth(&self) -> usize {
        self.forward_depth
    }

    pub fn backward_depth(&self) -> usize {
        self.backward_depth
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    // ========================================================================
    // Input
    // ========================================================================

    /// Append a frame. `None` signals end of stream and lets the remaining
    /// frames drain without full lookahead.
    pub fn push(&mut self, frame: Option<Frame>) {
        let Some(frame) = frame else {
            self.eof = true;
            return;
        };
        self.eof = false;

        let prev_pts = self.frames.back().and_then(|q| q.frame.pts);
        if let (Some(prev), Some(pts)) = (prev_pts, frame.pts) {
            if let Some(gap) = field_gap(prev, pts) {
                self.frame_gap = Some(gap);
            }
        }

        self.frames.push_back(QueuedFrame {
            top_field_first: frame.top_field_first(),
            interlaced: frame.is_interlaced(),
            frame,
        });
    }

    /// Drop all frames and return to the initial state.
    pub fn flush(&mut self) {
        self.frames.clear();
        self.cursor = 0;
        self.second_field = false;
        self.eof = false;
        self.frame_gap = None;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    // ========================================================================
    // Output
    // ========================================================================

    fn future_frames(&self) -> usize {
        self.frames.len().saturating_sub(self.cursor + 1)
    }

    fn current(&self) -> Option<&QueuedFrame> {
        self.frames.get(self.cursor)
    }

    /// More input is needed before the current frame can be processed.
    ///
    /// A second field also waits for the next frame so its timestamp can be
    /// placed between the two frames.
    pub fn needs_input(&self) -> bool {
        let lookahead = if self.second_field {
            self.forward_depth.max(1)
        } else {
            self.forward_depth
        };
        self.future_frames() < lookahead && !self.eof
    }

    pub fn has_output(&self) -> bool {
        self.current().is_some() && !self.needs_input()
    }

    /// Frame at `offset` relative to the current one (negative = past).
    pub fn get(&self, offset: isize) -> Option<&Frame> {
        let index = self.cursor as isize + offset;
        if index < 0 {
            return None;
        }
        self.frames.get(index as usize).map(|q| &q.frame)
    }

    /// Move on to the next input frame.
    pub fn advance_frame(&mut self) {
        if self.current().is_none() {
            return;
        }
        self.cursor += 1;
        self.second_field = false;
        self.trim_past();
    }

    /// Move on to the second field of the current frame, or to the next
    /// frame if there is no second field to output.
    pub fn advance_field(&mut self) {
        if self.current().is_none() {
            return;
        }
        if !self.output_second_field() {
            self.advance_frame();
        }
    }

    fn output_second_field(&mut self) -> bool {
        if self.second_field
            || !self.mode.contains(QueueMode::OUTPUT_FIELDS)
            || !self.should_deinterlace()
        {
            return false;
        }
        self.second_field = true;
        true
    }

    fn trim_past(&mut self) {
        while self.cursor > self.backward_depth {
            self.frames.pop_front();
            self.cursor -= 1;
        }
    }

    // ========================================================================
    // Field State
    // ========================================================================

    pub fn should_deinterlace(&self) -> bool {
        if !self.has_output() || !self.mode.contains(QueueMode::DEINTERLACE) {
            return false;
        }
        let interlaced = self.current().map(|q| q.interlaced).unwrap_or(false);
        interlaced || !self.mode.contains(QueueMode::INTERLACED_ONLY)
    }

    /// Parity of the field about to be output.
    pub fn is_top_field(&self) -> bool {
        if !self.has_output() {
            return false;
        }
        self.top_field_first() ^ self.second_field
    }

    pub fn top_field_first(&self) -> bool {
        if !self.has_output() {
            return false;
        }
        self.current().map(|q| q.top_field_first).unwrap_or(false)
    }

    pub fn is_second_field(&self) -> bool {
        self.second_field
    }

    /// Timestamp of the field about to be output.
    ///
    /// The second field sits half-way to the next frame. At end of stream the
    /// last seen frame step stands in for the missing next frame.
    pub fn current_pts(&self) -> Option<f64> {
        let pts = self.current()?.frame.pts?;
        if !self.second_field {
            return Some(pts);
        }
        let gap = match self.frames.get(self.cursor + 1) {
            Some(next) => next.frame.pts.and_then(|next| field_gap(pts, next)),
            None => self.frame_gap,
        };
        Some(gap.map_or(pts, |gap| pts + gap / 2.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{FieldFlags, Surface, SurfaceId};
    use std::sync::Arc;

    fn frame(id: u32, fields: FieldFlags) -> Frame {
        let surface = Arc::new(Surface::unpooled(SurfaceId(id), 64, 64));
        Frame::from_surface(surface, 64, 64)
            .with_fields(fields)
            .with_pts(id as f64 * 0.04)
    }

    fn interlaced_tff(id: u32) -> Frame {
        frame(id, FieldFlags::INTERLACED | FieldFlags::TOP_FIRST)
    }

    fn id_at(q: &ReferenceQueue, offset: isize) -> Option<u32> {
        q.get(offset).map(|f| f.surface_id().0)
    }

    #[test]
    fn needs_forward_depth_plus_one_frames() {
        let mut q = ReferenceQueue::new();
        q.set_refs(1, 2);

        q.push(Some(interlaced_tff(0)));
        assert!(!q.has_output());
        q.push(Some(interlaced_tff(1)));
        assert!(!q.has_output());
        q.push(Some(interlaced_tff(2)));
        assert!(q.has_output());
        assert_eq!(id_at(&q, 0), Some(0));
        assert_eq!(id_at(&q, 2), Some(2));
        assert_eq!(id_at(&q, 3), None);
        assert_eq!(id_at(&q, -1), None);
    }

    #[test]
    fn eof_drains_without_lookahead() {
        let mut q = ReferenceQueue::new();
        q.set_refs(0, 2);
        q.push(Some(interlaced_tff(0)));
        assert!(!q.has_output());

        q.push(None);
        assert!(q.has_output());
        q.advance_frame();
        assert!(!q.has_output());
        assert!(q.is_eof());
    }

    #[test]
    fn past_frames_trimmed_to_backward_depth() {
        let mut q = ReferenceQueue::new();
        q.set_refs(1, 0);
        for id in 0..4 {
            q.push(Some(interlaced_tff(id)));
        }
        q.advance_frame();
        q.advance_frame();
        assert_eq!(id_at(&q, 0), Some(2));
        assert_eq!(id_at(&q, -1), Some(1));
        assert_eq!(id_at(&q, -2), None);
        assert_eq!(q.len(), 3);

        q.set_refs(0, 0);
        assert_eq!(id_at(&q, -1), None);
        assert_eq!(id_at(&q, 0), Some(2));
    }

    #[test]
    fn field_cadence_visits_each_frame_twice() {
        let mut q = ReferenceQueue::new();
        q.set_mode(QueueMode::DEINTERLACE | QueueMode::OUTPUT_FIELDS);
        q.push(Some(interlaced_tff(0)));
        q.push(Some(interlaced_tff(1)));

        assert!(q.is_top_field());
        assert_eq!(q.current_pts(), Some(0.0));
        q.advance_field();
        assert_eq!(id_at(&q, 0), Some(0));
        assert!(q.is_second_field());
        assert!(!q.is_top_field());
        assert!(q.top_field_first());
        let pts = q.current_pts().unwrap();
        assert!((pts - 0.02).abs() < 1e-9);

        q.advance_field();
        assert_eq!(id_at(&q, 0), Some(1));
        assert!(!q.is_second_field());
    }

    #[test]
    fn bottom_field_first_parity() {
        let mut q = ReferenceQueue::new();
        q.set_mode(QueueMode::DEINTERLACE | QueueMode::OUTPUT_FIELDS);
        q.push(Some(frame(0, FieldFlags::INTERLACED)));
        assert!(!q.top_field_first());
        assert!(!q.is_top_field());
        q.advance_field();
        q.push(None);
        assert!(q.is_top_field());
    }

    #[test]
    fn second_field_waits_for_next_frame() {
        let mut q = ReferenceQueue::new();
        q.set_mode(QueueMode::DEINTERLACE | QueueMode::OUTPUT_FIELDS);
        q.push(Some(interlaced_tff(1)));
        assert!(q.has_output());
        q.advance_field();
        assert!(q.is_second_field());
        assert!(!q.has_output());
        assert!(q.needs_input());

        q.push(Some(interlaced_tff(2)));
        assert!(q.has_output());
        assert_eq!(id_at(&q, 0), Some(1));
        let pts = q.current_pts().unwrap();
        assert!((pts - 0.06).abs() < 1e-9);
    }

    #[test]
    fn last_second_field_uses_previous_frame_step() {
        let mut q = ReferenceQueue::new();
        q.set_mode(QueueMode::DEINTERLACE | QueueMode::OUTPUT_FIELDS);
        q.push(Some(interlaced_tff(1)));
        q.push(Some(interlaced_tff(2)));
        q.advance_field();
        q.advance_field();
        q.advance_field();
        assert!(!q.has_output());

        q.push(None);
        assert!(q.has_output());
        assert_eq!(id_at(&q, 0), Some(2));
        let pts = q.current_pts().unwrap();
        assert!((pts - 0.10).abs() < 1e-9);
    }

    #[test]
    fn progressive_frames_skip_second_field_when_interlaced_only() {
        let mut q = ReferenceQueue::new();
        q.set_mode(QueueMode::DEINTERLACE | QueueMode::OUTPUT_FIELDS | QueueMode::INTERLACED_ONLY);
        q.push(Some(frame(0, FieldFlags::empty())));
        q.push(Some(frame(1, FieldFlags::empty())));
        assert!(!q.should_deinterlace());
        q.advance_field();
        assert_eq!(id_at(&q, 0), Some(1));

        q.set_mode(QueueMode::DEINTERLACE | QueueMode::OUTPUT_FIELDS);
        assert!(q.should_deinterlace());
    }

    #[test]
    fn second_field_pts_falls_back_without_sane_gap() {
        let mut q = ReferenceQueue::new();
        q.set_mode(QueueMode::DEINTERLACE | QueueMode::OUTPUT_FIELDS);
        q.push(Some(interlaced_tff(0).with_pts(10.0)));
        q.push(Some(interlaced_tff(1).with_pts(12.0)));
        q.advance_field();
        assert_eq!(q.current_pts(), Some(10.0));
    }

    #[test]
    fn flush_is_idempotent() {
        let mut q = ReferenceQueue::new();
        q.set_refs(1, 1);
        q.set_mode(QueueMode::DEINTERLACE | QueueMode::OUTPUT_FIELDS);
        for id in 0..3 {
            q.push(Some(interlaced_tff(id)));
        }
        q.advance_field();
        q.push(None);

        q.flush();
        let once = (q.len(), q.is_second_field(), q.is_eof(), q.has_output());
        q.flush();
        let twice = (q.len(), q.is_second_field(), q.is_eof(), q.has_output());
        assert_eq!(once, twice);
        assert_eq!(once, (0, false, false, false));

        // depth survives the flush
        q.push(Some(interlaced_tff(5)));
        assert!(!q.has_output());
        q.push(Some(interlaced_tff(6)));
        assert!(q.has_output());
        assert_eq!(id_at(&q, 0), Some(5));
    }

    #[test]
    fn advancing_an_empty_queue_is_a_no_op() {
        let mut q = ReferenceQueue::new();
        q.advance_frame();
        q.advance_field();
        assert!(!q.has_output());
        q.push(Some(interlaced_tff(0)));
        assert!(q.has_output());
        assert_eq!(id_at(&q, 0), Some(0));
    }
}
