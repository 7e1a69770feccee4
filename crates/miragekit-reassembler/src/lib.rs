//! miragekit-reassembler — client-side frame reassembler (spec §3.4, §3.5,
//! §4.3).
//!
//! One instance per stream: fragments arrive in any order, the reassembler
//! aggregates them into complete frames, validates epoch/dimension-token/CRC,
//! and delivers strictly-ordered frames to a registered [`FrameSink`],
//! outside its own lock — mirroring the teacher's rule that the UDP receive
//! loop never awaits while holding `GuiState`'s mutex
//! (`duallink-gui::state::GuiState`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use miragekit_core::{
    ContentRect, DimensionToken, Epoch, FrameLossObserver, FrameNumber, StreamID, Timestamp,
    Tunables,
};
use miragekit_pool::{BufferPool, PooledBuffer, ReleaseGuard};
use miragekit_wire::{crc32, VideoHeader, VIDEO_HEADER_SIZE};

/// Delivered to a [`FrameSink`] when a frame completes. `release` must be
/// dropped (or explicitly released) once the frame bytes are no longer
/// needed so the backing buffer can return to the pool.
pub struct FrameCompleteEvent {
    pub stream_id: StreamID,
    pub frame: Bytes,
    pub is_keyframe: bool,
    pub timestamp: Timestamp,
    pub content_rect: ContentRect,
    pub release: ReleaseGuard,
}

/// Registered once per stream; invoked outside the reassembler's lock.
pub trait FrameSink: Send + Sync {
    fn on_frame_complete(&self, event: FrameCompleteEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReassemblerCounters {
    pub total_packets_received: u64,
    pub frames_delivered: u64,
    pub packets_discarded_old: u64,
    pub packets_discarded_crc: u64,
    pub packets_discarded_token: u64,
    pub packets_discarded_epoch: u64,
    pub packets_discarded_awaiting_keyframe: u64,
    pub dropped_frame_count: u64,
}

const P_FRAME_TIMEOUT: Duration = Duration::from_millis(500);
const STATS_LOG_INTERVAL: u64 = 1_000;

struct PendingFrame {
    buffer: PooledBuffer,
    received: Vec<bool>,
    received_count: u16,
    total_fragments: u16,
    max_payload_size: usize,
    is_keyframe: bool,
    timestamp: Timestamp,
    content_rect: ContentRect,
    epoch: Epoch,
    dimension_token: DimensionToken,
    received_at: Instant,
    expected_total_bytes: Option<usize>,
}

impl PendingFrame {
    fn new(
        pool: &BufferPool,
        header: &VideoHeader,
        max_payload_size: usize,
        now: Instant,
    ) -> Self {
        let total_fragments = header.fragment_count;
        let mut buffer = pool.acquire(total_fragments as usize * max_payload_size);
        buffer.as_mut().resize(total_fragments as usize * max_payload_size, 0);
        Self {
            buffer,
            received: vec![false; total_fragments as usize],
            received_count: 0,
            total_fragments,
            max_payload_size,
            is_keyframe: header.flags.keyframe,
            timestamp: header.timestamp,
            content_rect: header.content_rect,
            epoch: header.epoch,
            dimension_token: header.dimension_token,
            received_at: now,
            expected_total_bytes: None,
        }
    }

    fn is_complete(&self) -> bool {
        self.received_count == self.total_fragments
    }

    /// Returns `false` if this fragment index was already received
    /// (duplicate — receivedCount must not advance, spec §8 property 7),
    /// or if `payload` is larger than the slot it would occupy (a
    /// malformed/hostile datagram whose declared length exceeds this
    /// receiver's configured `maxPayloadSize` — rejected like any other
    /// malformed packet rather than indexed into the fixed-size buffer).
    fn push_fragment(&mut self, fragment_index: u16, payload: &[u8]) -> bool {
        let idx = fragment_index as usize;
        if idx >= self.received.len() || self.received[idx] {
            return false;
        }
        if payload.len() > self.max_payload_size {
            return false;
        }
        self.received[idx] = true;
        self.received_count += 1;

        let offset = idx * self.max_payload_size;
        let end = offset + payload.len();
        self.buffer.as_mut()[offset..end].copy_from_slice(payload);

        if idx as u16 == self.total_fragments - 1 {
            self.expected_total_bytes = Some(end);
        }
        true
    }

    fn timeout(&self, keyframe_timeout: Duration) -> Duration {
        if self.is_keyframe {
            keyframe_timeout
        } else {
            P_FRAME_TIMEOUT
        }
    }
}

struct StreamState {
    current_epoch: Epoch,
    expected_dimension_token: DimensionToken,
    dimension_token_validation_enabled: bool,
    last_completed_frame: FrameNumber,
    last_delivered_keyframe: FrameNumber,
    awaiting_keyframe: bool,
    awaiting_keyframe_since: Option<Instant>,
    pending: HashMap<FrameNumber, PendingFrame>,
    counters: ReassemblerCounters,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            current_epoch: 0,
            expected_dimension_token: 0,
            dimension_token_validation_enabled: false,
            last_completed_frame: 0,
            last_delivered_keyframe: 0,
            awaiting_keyframe: false,
            awaiting_keyframe_since: None,
            pending: HashMap::new(),
            counters: ReassemblerCounters::default(),
        }
    }
}

impl StreamState {
    fn reset_for_epoch(&mut self, new_epoch: Epoch) {
        self.pending.clear();
        self.current_epoch = new_epoch;
        self.last_completed_frame = 0;
        self.last_delivered_keyframe = 0;
    }

    fn enter_keyframe_only_mode(&mut self, now: Instant) {
        if !self.awaiting_keyframe {
            self.awaiting_keyframe_since = Some(now);
        }
        self.awaiting_keyframe = true;
    }
}

pub struct FrameReassembler {
    stream_id: StreamID,
    tunables: Tunables,
    pool: BufferPool,
    max_payload_size: usize,
    sink: Arc<dyn FrameSink>,
    state: Mutex<StreamState>,
    loss_handler: Mutex<Option<Arc<dyn FrameLossObserver>>>,
}

impl FrameReassembler {
    pub fn new(stream_id: StreamID, tunables: Tunables, pool: BufferPool, sink: Arc<dyn FrameSink>) -> Self {
        let max_payload_size = tunables.max_packet_size.saturating_sub(VIDEO_HEADER_SIZE);
        Self {
            stream_id,
            tunables,
            pool,
            max_payload_size,
            sink,
            state: Mutex::new(StreamState::default()),
            loss_handler: Mutex::new(None),
        }
    }

    pub fn set_frame_loss_handler(&self, handler: Arc<dyn FrameLossObserver>) {
        *self.loss_handler.lock().unwrap() = Some(handler);
    }

    pub fn update_expected_dimension_token(&self, token: DimensionToken) {
        let mut state = self.state.lock().unwrap();
        state.dimension_token_validation_enabled = true;
        state.expected_dimension_token = token;
    }

    pub fn reset(&self) {
        *self.state.lock().unwrap() = StreamState::default();
    }

    pub fn enter_keyframe_only_mode(&self) {
        self.state.lock().unwrap().enter_keyframe_only_mode(Instant::now());
    }

    pub fn should_request_keyframe(&self) -> bool {
        self.state.lock().unwrap().awaiting_keyframe
    }

    pub fn awaiting_keyframe_duration(&self, now: Instant) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        if state.awaiting_keyframe {
            state.awaiting_keyframe_since.map(|since| now.saturating_duration_since(since))
        } else {
            None
        }
    }

    pub fn dropped_frame_count(&self) -> u64 {
        self.state.lock().unwrap().counters.dropped_frame_count
    }

    pub fn counters(&self) -> ReassemblerCounters {
        self.state.lock().unwrap().counters
    }

    /// Ingest one fragment. See spec §4.3 for the 10-step pipeline this
    /// implements; first non-matching rule drops the packet.
    pub fn process_packet(&self, header: &VideoHeader, payload: &[u8]) {
        let now = Instant::now();
        let (complete_events, loss_events) = {
            let mut state = self.state.lock().unwrap();
            self.process_packet_locked(&mut state, header, payload, now)
        };

        for event in complete_events {
            self.sink.on_frame_complete(event);
        }
        if let Some(handler) = self.loss_handler.lock().unwrap().clone() {
            for frame_number in loss_events {
                handler.on_frame_loss(self.stream_id, frame_number);
            }
        }
    }

    fn process_packet_locked(
        &self,
        state: &mut StreamState,
        header: &VideoHeader,
        payload: &[u8],
        now: Instant,
    ) -> (Vec<FrameCompleteEvent>, Vec<FrameNumber>) {
        let mut complete_events = Vec::new();
        let mut loss_events = Vec::new();

        // 1. Stats.
            state.counters.total_packets_received += 1;
            if state.counters.total_packets_received % STATS_LOG_INTERVAL == 0 {
                tracing::debug!(
                    stream_id = self.stream_id,
                    counters = ?state.counters,
                    "reassembler stats"
                );
            }

            // 2. Epoch.
            let mut handled_epoch_change = false;
            if header.epoch != state.current_epoch {
                if header.flags.keyframe {
                    state.reset_for_epoch(header.epoch);
                    handled_epoch_change = true;
                } else {
                    state.counters.packets_discarded_epoch += 1;
                    state.enter_keyframe_only_mode(now);
                    return (complete_events, loss_events);
                }
            }

            // 3. Discontinuity flag — same policy as (2), reported under the
            // same counter (the data model has no separate discontinuity
            // counter; spec §3.5 lists only the five discard counters).
            if !handled_epoch_change && header.flags.discontinuity {
                if header.flags.keyframe {
                    state.reset_for_epoch(header.epoch);
                } else {
                    state.counters.packets_discarded_epoch += 1;
                    state.enter_keyframe_only_mode(now);
                    return (complete_events, loss_events);
                }
            }

            // 4. Dimension token.
            if state.dimension_token_validation_enabled
                && header.dimension_token != state.expected_dimension_token
            {
                if header.flags.keyframe {
                    state.expected_dimension_token = header.dimension_token;
                } else {
                    state.counters.packets_discarded_token += 1;
                    return (complete_events, loss_events);
                }
            }

            // 5. Awaiting keyframe.
            if state.awaiting_keyframe && !header.flags.keyframe {
                state.counters.packets_discarded_awaiting_keyframe += 1;
                return (complete_events, loss_events);
            }

            // 6. CRC32 (skipped when the payload is AEAD-encrypted).
            if !header.flags.encrypted_payload && crc32(payload) != header.checksum {
                state.counters.packets_discarded_crc += 1;
                return (complete_events, loss_events);
            }

            // 7. Stale non-keyframe.
            let is_old = header.frame_number < state.last_completed_frame
                && (state.last_completed_frame - header.frame_number) < 1000;
            if is_old && !header.flags.keyframe {
                state.counters.packets_discarded_old += 1;
                return (complete_events, loss_events);
            }

            // 8. Fragment store.
            let max_payload_size = self.max_payload_size;
            let pool = &self.pool;
            let frame_number = header.frame_number;
            let entry = state
                .pending
                .entry(frame_number)
                .or_insert_with(|| PendingFrame::new(pool, header, max_payload_size, now));
            entry.push_fragment(header.fragment_index, payload);
            if header.flags.keyframe {
                entry.is_keyframe = true;
            }

            self.evict_oldest_pending_if_over_cap(state);

            // 9. Completion.
            if state.pending.get(&frame_number).map(PendingFrame::is_complete).unwrap_or(false) {
                if let Some(event) = self.complete_frame_locked(state, frame_number) {
                    complete_events.push(event);
                }
            }

            // 10. Timeouts.
            self.cleanup_old_frames_locked(state, now, &mut loss_events);

        (complete_events, loss_events)
    }

    fn complete_frame_locked(
        &self,
        state: &mut StreamState,
        frame_number: FrameNumber,
    ) -> Option<FrameCompleteEvent> {
        let deliver = {
            let frame = state.pending.get(&frame_number)?;
            if frame.is_keyframe {
                frame_number > state.last_delivered_keyframe || state.last_delivered_keyframe == 0
            } else {
                frame_number > state.last_completed_frame
                    && frame_number > state.last_delivered_keyframe
            }
        };

        let frame = state.pending.remove(&frame_number)?;

        if !deliver {
            state.counters.dropped_frame_count += 1;
            return None;
        }

        state.last_completed_frame = frame_number;
        if frame.is_keyframe {
            state.last_delivered_keyframe = frame_number;
            state.awaiting_keyframe = false;
            state.awaiting_keyframe_since = None;
        }

        let last_completed = state.last_completed_frame;
        state.pending.retain(|&key, pending| pending.is_keyframe || key >= last_completed);

        state.counters.frames_delivered += 1;

        let expected = frame.expected_total_bytes.unwrap_or_else(|| frame.buffer.capacity());
        let (bytes, release) = frame.buffer.finalize(expected);

        Some(FrameCompleteEvent {
            stream_id: self.stream_id,
            frame: bytes,
            is_keyframe: frame.is_keyframe,
            timestamp: frame.timestamp,
            content_rect: frame.content_rect,
            release,
        })
    }

    /// Spec §6.5: "implementations MUST drop the oldest pending frame if
    /// the map grows beyond an implementation-defined cap (default 16)."
    /// Keyframe preservation (§8 property 3) still wins here — the oldest
    /// *non-keyframe* is evicted; if every pending frame is a keyframe the
    /// cap is left exceeded rather than violating that invariant.
    fn evict_oldest_pending_if_over_cap(&self, state: &mut StreamState) {
        let cap = self.tunables.pending_frame_cap;
        if cap == 0 || state.pending.len() <= cap {
            return;
        }
        let oldest = state
            .pending
            .iter()
            .filter(|(_, frame)| !frame.is_keyframe)
            .min_by_key(|(_, frame)| frame.received_at)
            .map(|(&frame_number, _)| frame_number);

        if let Some(frame_number) = oldest {
            state.pending.remove(&frame_number);
            state.counters.dropped_frame_count += 1;
        }
    }

    fn cleanup_old_frames_locked(
        &self,
        state: &mut StreamState,
        now: Instant,
        loss_events: &mut Vec<FrameNumber>,
    ) {
        let keyframe_timeout = self.tunables.keyframe_timeout();
        let mut timed_out = Vec::new();
        for (&frame_number, frame) in state.pending.iter() {
            if now.saturating_duration_since(frame.received_at) > frame.timeout(keyframe_timeout) {
                timed_out.push(frame_number);
            }
        }
        for frame_number in timed_out {
            state.pending.remove(&frame_number);
            state.counters.dropped_frame_count += 1;
            loss_events.push(frame_number);
        }
    }
}
