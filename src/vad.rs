//! Voice-activity gate
//!
//! Classifies capture frames as speech or silence using energy and duration
//! heuristics, and batches speech (plus padding) into segments for
//! request/response backends. Continuous backends run the gate in
//! pass-through mode and rely on server-side voice detection.

use std::collections::VecDeque;
use std::time::Duration;

use crate::audio::{AudioFrame, CAPTURE_SAMPLE_RATE, FRAME_SAMPLES};
use crate::config::VadConfig;

/// Gate state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No speech; recent frames are retained for leading padding
    Silence,
    /// A segment is open and accumulating
    SpeechActive,
    /// Energy dropped; the segment stays open until the gap elapses
    TrailingSilence,
}

/// How the gate treats incoming frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Batch speech into [`VoiceSegment`]s framed by silence
    Segmented,
    /// Forward every frame immediately, tracking activity only
    PassThrough,
}

/// Segment classification tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Speech,
    /// Reserved for consumers that want explicit markers for the silence
    /// between utterances; the gate itself emits only [`Speech`] segments
    ///
    /// [`Speech`]: SegmentKind::Speech
    SilenceGap,
}

/// A bounded span of audio framed by silence, treated as one
/// transcription unit
#[derive(Debug, Clone)]
pub struct VoiceSegment {
    frames: Vec<AudioFrame>,
    kind: SegmentKind,
    start: Duration,
    end: Duration,
}

impl VoiceSegment {
    /// Build a segment from ordered frames; `None` when empty
    #[must_use]
    pub fn from_frames(frames: Vec<AudioFrame>, kind: SegmentKind) -> Option<Self> {
        let start = frames.first()?.start_offset();
        let end = frames.last()?.end_offset();
        Some(Self {
            frames,
            kind,
            start,
            end,
        })
    }

    /// Wrap a complete pre-recorded buffer as one segment (file
    /// transcription path, bypasses the gate entirely)
    #[must_use]
    pub fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let end = Duration::from_secs_f64(samples.len() as f64 / f64::from(sample_rate));
        Self {
            frames: vec![AudioFrame::new(samples, sample_rate, 0)],
            kind: SegmentKind::Speech,
            start: Duration::ZERO,
            end,
        }
    }

    #[must_use]
    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    /// Concatenated samples of all frames
    #[must_use]
    pub fn samples(&self) -> Vec<i16> {
        self.frames
            .iter()
            .flat_map(|f| f.samples().iter().copied())
            .collect()
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.frames
            .first()
            .map_or(CAPTURE_SAMPLE_RATE, AudioFrame::sample_rate)
    }

    #[must_use]
    pub const fn kind(&self) -> SegmentKind {
        self.kind
    }

    #[must_use]
    pub const fn start(&self) -> Duration {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> Duration {
        self.end
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(|f| f.samples().is_empty())
    }
}

/// Result of pushing one frame through the gate
#[derive(Debug)]
pub enum GateOutput {
    /// Nothing to emit yet
    None,
    /// Pass-through mode: forward this frame immediately
    Forward(AudioFrame),
    /// Segmented mode: a segment closed and is ready to send
    Segment(VoiceSegment),
}

/// Energy-gated speech segmenter.
///
/// Never blocks on I/O; must keep up with the capture rate or it becomes
/// the backpressure source for the whole pipeline.
pub struct VoiceActivityGate {
    config: VadConfig,
    mode: GateMode,
    state: GateState,
    /// Recent silence frames kept for leading padding
    lead_ring: VecDeque<AudioFrame>,
    /// Consecutive speech frames seen while debouncing
    candidate: Vec<AudioFrame>,
    /// Frames of the currently open segment
    active: Vec<AudioFrame>,
    /// Debounce counter for pass-through mode (no frames are buffered)
    debounce_count: usize,
    trailing_count: usize,
    emitted: u64,
}

impl VoiceActivityGate {
    #[must_use]
    pub fn new(config: VadConfig, mode: GateMode) -> Self {
        Self {
            config,
            mode,
            state: GateState::Silence,
            lead_ring: VecDeque::new(),
            candidate: Vec::new(),
            active: Vec::new(),
            debounce_count: 0,
            trailing_count: 0,
            emitted: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> GateState {
        self.state
    }

    #[must_use]
    pub const fn mode(&self) -> GateMode {
        self.mode
    }

    /// Whether a segment is currently open (speech recently heard)
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state != GateState::Silence
    }

    /// Segments emitted so far
    #[must_use]
    pub const fn segments_emitted(&self) -> u64 {
        self.emitted
    }

    /// Frame duration at the capture rate
    fn frame_duration() -> Duration {
        #[allow(clippy::cast_precision_loss)]
        Duration::from_secs_f64(FRAME_SAMPLES as f64 / f64::from(CAPTURE_SAMPLE_RATE))
    }

    fn padding_frames(&self) -> usize {
        Self::frames_for(self.config.padding)
    }

    fn gap_frames(&self) -> usize {
        Self::frames_for(self.config.gap).max(1)
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn frames_for(duration: Duration) -> usize {
        (duration.as_secs_f64() / Self::frame_duration().as_secs_f64()).ceil() as usize
    }

    /// Feed one capture frame through the gate
    pub fn push(&mut self, frame: AudioFrame) -> GateOutput {
        let is_speech = frame.energy() > self.config.energy_threshold;

        if self.mode == GateMode::PassThrough {
            self.track_activity(is_speech);
            return GateOutput::Forward(frame);
        }

        match self.state {
            GateState::Silence => {
                if is_speech {
                    self.candidate.push(frame);
                    if self.candidate.len() >= self.config.debounce_frames {
                        // Segment opens with leading padding plus the
                        // debounced speech frames
                        self.active = self.lead_ring.drain(..).collect();
                        self.active.append(&mut self.candidate);
                        self.state = GateState::SpeechActive;
                        tracing::trace!(frames = self.active.len(), "segment opened");
                    }
                } else {
                    // Transient spike: candidate frames fall back into the
                    // padding ring
                    for f in self.candidate.drain(..) {
                        self.lead_ring.push_back(f);
                    }
                    self.lead_ring.push_back(frame);
                    let cap = self.padding_frames();
                    while self.lead_ring.len() > cap {
                        self.lead_ring.pop_front();
                    }
                }
                GateOutput::None
            }
            GateState::SpeechActive => {
                self.active.push(frame);
                if !is_speech {
                    self.state = GateState::TrailingSilence;
                    self.trailing_count = 1;
                }
                GateOutput::None
            }
            GateState::TrailingSilence => {
                self.active.push(frame);
                if is_speech {
                    self.state = GateState::SpeechActive;
                    self.trailing_count = 0;
                    GateOutput::None
                } else {
                    self.trailing_count += 1;
                    if self.trailing_count >= self.gap_frames() {
                        self.close_segment()
                            .map_or(GateOutput::None, GateOutput::Segment)
                    } else {
                        GateOutput::None
                    }
                }
            }
        }
    }

    /// Close any open segment at end of stream
    pub fn flush(&mut self) -> Option<VoiceSegment> {
        if self.state == GateState::Silence {
            return None;
        }
        self.trailing_count = 0;
        self.state = GateState::Silence;
        let frames = std::mem::take(&mut self.active);
        let segment = VoiceSegment::from_frames(frames, SegmentKind::Speech)?;
        self.emitted += 1;
        Some(segment)
    }

    fn close_segment(&mut self) -> Option<VoiceSegment> {
        // Trim trailing silence beyond the configured padding; the excess
        // re-seeds the leading-padding ring
        let keep_trailing = self.padding_frames().min(self.trailing_count);
        let excess = self.trailing_count - keep_trailing;
        let cut = self.active.len().saturating_sub(excess);
        let overflow: Vec<AudioFrame> = self.active.drain(cut..).collect();

        self.lead_ring.clear();
        self.lead_ring.extend(overflow);
        let cap = self.padding_frames();
        while self.lead_ring.len() > cap {
            self.lead_ring.pop_front();
        }

        self.state = GateState::Silence;
        self.trailing_count = 0;

        let frames = std::mem::take(&mut self.active);
        let segment = VoiceSegment::from_frames(frames, SegmentKind::Speech)?;
        self.emitted += 1;
        tracing::debug!(
            start_ms = segment.start().as_millis(),
            end_ms = segment.end().as_millis(),
            frames = segment.frames().len(),
            "segment closed"
        );
        Some(segment)
    }

    /// Pass-through activity tracking: same transitions, no buffering
    fn track_activity(&mut self, is_speech: bool) {
        match self.state {
            GateState::Silence => {
                if is_speech {
                    self.debounce_count += 1;
                    if self.debounce_count >= self.config.debounce_frames {
                        self.debounce_count = 0;
                        self.state = GateState::SpeechActive;
                    }
                } else {
                    self.debounce_count = 0;
                }
            }
            GateState::SpeechActive => {
                if !is_speech {
                    self.state = GateState::TrailingSilence;
                    self.trailing_count = 1;
                }
            }
            GateState::TrailingSilence => {
                if is_speech {
                    self.state = GateState::SpeechActive;
                    self.trailing_count = 0;
                } else {
                    self.trailing_count += 1;
                    if self.trailing_count >= self.gap_frames() {
                        self.state = GateState::Silence;
                        self.trailing_count = 0;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speech_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![5000i16; FRAME_SAMPLES], CAPTURE_SAMPLE_RATE, seq)
    }

    fn silence_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0i16; FRAME_SAMPLES], CAPTURE_SAMPLE_RATE, seq)
    }

    fn gate() -> VoiceActivityGate {
        VoiceActivityGate::new(VadConfig::default(), GateMode::Segmented)
    }

    fn run(gate: &mut VoiceActivityGate, frames: impl IntoIterator<Item = AudioFrame>) -> Vec<VoiceSegment> {
        let mut out = Vec::new();
        for frame in frames {
            if let GateOutput::Segment(seg) = gate.push(frame) {
                out.push(seg);
            }
        }
        out
    }

    #[test]
    fn all_silence_emits_nothing() {
        let mut gate = gate();
        let segments = run(&mut gate, (0..500).map(silence_frame));
        assert!(segments.is_empty());
        assert_eq!(gate.state(), GateState::Silence);
        assert_eq!(gate.segments_emitted(), 0);
    }

    #[test]
    fn transient_spike_is_debounced() {
        let mut gate = gate();
        // One loud frame surrounded by silence never opens a segment
        let mut frames: Vec<AudioFrame> = (0..10).map(silence_frame).collect();
        frames.push(speech_frame(10));
        frames.extend((11..60).map(silence_frame));

        let segments = run(&mut gate, frames);
        assert!(segments.is_empty());
        assert_eq!(gate.state(), GateState::Silence);
    }

    #[test]
    fn two_seconds_silence_one_second_speech_yields_one_segment() {
        // 2 s silence, 1 s speech-band energy, 1 s silence at 16 kHz
        let mut gate = gate();
        let mut seq = 0u64;
        let mut frames = Vec::new();
        for _ in 0..31 {
            frames.push(silence_frame(seq));
            seq += 1;
        }
        for _ in 0..16 {
            frames.push(speech_frame(seq));
            seq += 1;
        }
        for _ in 0..16 {
            frames.push(silence_frame(seq));
            seq += 1;
        }

        let segments = run(&mut gate, frames);
        assert_eq!(segments.len(), 1);

        // Speech interior ~1 s, plus at most padding on each side
        let seg = &segments[0];
        let padding = VadConfig::default().padding;
        let dur = seg.duration();
        assert!(dur >= Duration::from_millis(950), "segment too short: {dur:?}");
        assert!(
            dur <= Duration::from_millis(1100) + 2 * padding,
            "segment too long: {dur:?}"
        );
    }

    #[test]
    fn segment_never_shorter_than_debounce() {
        let config = VadConfig::default();
        let min = Duration::from_secs_f64(
            config.debounce_frames as f64 * 1024.0 / 16_000.0,
        );

        let mut gate = gate();
        let mut seq = 0u64;
        let mut frames = Vec::new();
        for _ in 0..4 {
            frames.push(speech_frame(seq));
            seq += 1;
        }
        for _ in 0..20 {
            frames.push(silence_frame(seq));
            seq += 1;
        }

        let segments = run(&mut gate, frames);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].duration() >= min);
    }

    #[test]
    fn energy_rise_during_trailing_silence_continues_segment() {
        let mut gate = gate();
        let mut seq = 0u64;
        let mut frames = Vec::new();
        // Speech, short silence (< gap), more speech, then a full gap
        for _ in 0..5 {
            frames.push(speech_frame(seq));
            seq += 1;
        }
        for _ in 0..5 {
            frames.push(silence_frame(seq));
            seq += 1;
        }
        for _ in 0..5 {
            frames.push(speech_frame(seq));
            seq += 1;
        }
        for _ in 0..15 {
            frames.push(silence_frame(seq));
            seq += 1;
        }

        let segments = run(&mut gate, frames);
        assert_eq!(segments.len(), 1, "gap re-rise must not split the segment");
        assert_eq!(gate.segments_emitted(), 1);
    }

    #[test]
    fn segment_includes_leading_padding() {
        let mut gate = gate();
        let mut seq = 0u64;
        let mut frames = Vec::new();
        for _ in 0..10 {
            frames.push(silence_frame(seq));
            seq += 1;
        }
        let speech_start = seq;
        for _ in 0..8 {
            frames.push(speech_frame(seq));
            seq += 1;
        }
        for _ in 0..15 {
            frames.push(silence_frame(seq));
            seq += 1;
        }

        let segments = run(&mut gate, frames);
        assert_eq!(segments.len(), 1);
        // First frame of the segment predates the first speech frame
        assert!(segments[0].frames()[0].seq() < speech_start);
    }

    #[test]
    fn flush_emits_open_segment() {
        let mut gate = gate();
        for seq in 0..6 {
            let out = gate.push(speech_frame(seq));
            assert!(matches!(out, GateOutput::None));
        }
        assert_eq!(gate.state(), GateState::SpeechActive);

        let seg = gate.flush().expect("open segment");
        assert!(!seg.is_empty());
        assert_eq!(gate.state(), GateState::Silence);
        assert!(gate.flush().is_none());
    }

    #[test]
    fn passthrough_forwards_every_frame() {
        let mut gate = VoiceActivityGate::new(VadConfig::default(), GateMode::PassThrough);
        for seq in 0..20 {
            let frame = if seq < 10 {
                silence_frame(seq)
            } else {
                speech_frame(seq)
            };
            assert!(matches!(gate.push(frame), GateOutput::Forward(_)));
        }
        // Activity tracking still works without buffering
        assert!(gate.is_active());
    }

    #[test]
    fn passthrough_activity_decays_after_gap() {
        let mut gate = VoiceActivityGate::new(VadConfig::default(), GateMode::PassThrough);
        for seq in 0..5 {
            gate.push(speech_frame(seq));
        }
        assert!(gate.is_active());
        for seq in 5..30 {
            gate.push(silence_frame(seq));
        }
        assert!(!gate.is_active());
    }

    #[test]
    fn segment_from_samples_covers_buffer() {
        let seg = VoiceSegment::from_samples(vec![100i16; 32_000], CAPTURE_SAMPLE_RATE);
        assert_eq!(seg.duration(), Duration::from_secs(2));
        assert_eq!(seg.samples().len(), 32_000);
        assert!(!seg.is_empty());
    }
}
