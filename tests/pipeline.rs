//! Transcription pipeline integration tests
//!
//! Drives the voice-activity gate and transcript filter with synthetic
//! audio, without requiring audio hardware or network access.

use std::time::Duration;

use kopivoice::audio::{CAPTURE_SAMPLE_RATE, FRAME_SAMPLES, AudioFrame};
use kopivoice::transcript::{FilterDecision, TranscriptFilter, TranscriptFragment};
use kopivoice::vad::{GateMode, GateOutput, VoiceActivityGate, VoiceSegment};
use kopivoice::{Config, VadConfig};

/// Generate one frame of sine-wave speech stand-in audio
fn sine_frame(seq: u64, frequency: f32, amplitude: f32) -> AudioFrame {
    let samples: Vec<i16> = (0..FRAME_SAMPLES)
        .map(|i| {
            let t = (seq as usize * FRAME_SAMPLES + i) as f32 / CAPTURE_SAMPLE_RATE as f32;
            let v = amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin();
            (v * f32::from(i16::MAX)) as i16
        })
        .collect();
    AudioFrame::new(samples, CAPTURE_SAMPLE_RATE, seq)
}

fn silent_frame(seq: u64) -> AudioFrame {
    AudioFrame::new(vec![0; FRAME_SAMPLES], CAPTURE_SAMPLE_RATE, seq)
}

/// Feed a pattern of speech/silence runs through a segmented gate and
/// collect the emitted segments
fn run_gate(gate: &mut VoiceActivityGate, pattern: &[(bool, usize)]) -> Vec<VoiceSegment> {
    let mut segments = Vec::new();
    let mut seq = 0u64;
    for &(speech, count) in pattern {
        for _ in 0..count {
            let frame = if speech {
                sine_frame(seq, 440.0, 0.5)
            } else {
                silent_frame(seq)
            };
            seq += 1;
            if let GateOutput::Segment(segment) = gate.push(frame) {
                segments.push(segment);
            }
        }
    }
    segments
}

/// Frames per `duration` at the capture rate, rounded up
fn frames_for(duration: Duration) -> usize {
    (duration.as_secs_f64() * f64::from(CAPTURE_SAMPLE_RATE) / FRAME_SAMPLES as f64).ceil()
        as usize
}

#[test]
fn speech_between_silences_yields_one_padded_segment() {
    let vad = VadConfig::default();
    let gap_frames = frames_for(vad.gap);
    let mut gate = VoiceActivityGate::new(vad, GateMode::Segmented);

    let segments = run_gate(
        &mut gate,
        &[(false, 20), (true, 16), (false, gap_frames + 2)],
    );

    assert_eq!(segments.len(), 1);
    let segment = segments[0].clone();

    // Leading padding pulls the start earlier than the first speech frame
    let speech_start = Duration::from_secs_f64(20.0 * 1024.0 / 16_000.0);
    assert!(segment.start() < speech_start);

    // Segment covers at least the full second of speech
    assert!(segment.duration() >= Duration::from_secs_f64(16.0 * 1024.0 / 16_000.0));
}

#[test]
fn continuous_silence_yields_nothing() {
    let mut gate = VoiceActivityGate::new(VadConfig::default(), GateMode::Segmented);
    let segments = run_gate(&mut gate, &[(false, 200)]);
    assert!(segments.is_empty());
    assert!(gate.flush().is_none());
}

#[test]
fn short_spike_is_debounced_away() {
    let mut gate = VoiceActivityGate::new(VadConfig::default(), GateMode::Segmented);
    // Two speech frames are below the debounce threshold of three
    let segments = run_gate(&mut gate, &[(false, 10), (true, 2), (false, 50)]);
    assert!(segments.is_empty());
}

#[test]
fn mid_utterance_pause_shorter_than_gap_stays_one_segment() {
    let vad = VadConfig::default();
    let gap_frames = frames_for(vad.gap);
    let pause = gap_frames / 2;
    let mut gate = VoiceActivityGate::new(vad, GateMode::Segmented);

    let segments = run_gate(
        &mut gate,
        &[
            (false, 10),
            (true, 10),
            (false, pause),
            (true, 10),
            (false, gap_frames + 2),
        ],
    );

    assert_eq!(segments.len(), 1);
}

#[test]
fn separate_utterances_yield_separate_segments() {
    let vad = VadConfig::default();
    let gap_frames = frames_for(vad.gap);
    let mut gate = VoiceActivityGate::new(vad, GateMode::Segmented);

    let segments = run_gate(
        &mut gate,
        &[
            (false, 10),
            (true, 10),
            (false, gap_frames + 2),
            (true, 10),
            (false, gap_frames + 2),
        ],
    );

    assert_eq!(segments.len(), 2);
    // Ordering by stream time
    assert!(segments[0].end() <= segments[1].start());
}

#[test]
fn passthrough_forwards_every_frame() {
    let mut gate = VoiceActivityGate::new(VadConfig::default(), GateMode::PassThrough);

    let mut forwarded = 0;
    for seq in 0..50 {
        let frame = if seq % 2 == 0 {
            sine_frame(seq, 300.0, 0.4)
        } else {
            silent_frame(seq)
        };
        if matches!(gate.push(frame), GateOutput::Forward(_)) {
            forwarded += 1;
        }
    }
    assert_eq!(forwarded, 50);
}

#[test]
fn segment_survives_wav_round_trip() {
    let mut gate = VoiceActivityGate::new(VadConfig::default(), GateMode::Segmented);
    let gap_frames = frames_for(VadConfig::default().gap);
    let segments = run_gate(&mut gate, &[(false, 5), (true, 20), (false, gap_frames + 2)]);
    assert_eq!(segments.len(), 1);

    let samples = segments[0].samples();
    let wav = kopivoice::audio::wav::samples_to_wav(&samples, segments[0].sample_rate()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("segment.wav");
    std::fs::write(&path, wav).unwrap();

    let (decoded, rate) = kopivoice::audio::wav::read_wav_file(&path).unwrap();
    assert_eq!(rate, CAPTURE_SAMPLE_RATE);
    assert_eq!(decoded, samples);
}

#[test]
fn hallucinations_only_suppressed_outside_speech() {
    let mut filter = TranscriptFilter::new();

    // A denylisted phrase transcribed from an actual segment passes
    let spoken =
        TranscriptFragment::final_("Thank you.", Duration::from_secs(1), Duration::from_secs(2));
    assert!(matches!(
        filter.push(spoken, false),
        FilterDecision::Hold
    ));
    assert_eq!(filter.flush().unwrap().text, "Thank you.");

    // The same phrase with no overlapping speech is suppressed
    let phantom =
        TranscriptFragment::final_("Thank you.", Duration::from_secs(5), Duration::from_secs(6));
    assert!(matches!(
        filter.push(phantom, true),
        FilterDecision::Suppress(_)
    ));
    assert!(filter.flush().is_none());
}

#[test]
fn gate_and_filter_compose_over_an_utterance() {
    let vad = VadConfig::default();
    let gap_frames = frames_for(vad.gap);
    let mut gate = VoiceActivityGate::new(vad, GateMode::Segmented);
    let mut filter = TranscriptFilter::new();

    let segments = run_gate(
        &mut gate,
        &[(false, 10), (true, 16), (false, gap_frames + 2)],
    );
    assert_eq!(segments.len(), 1);

    // A transcript for the segment's own time range is never in a
    // silence window
    let fragment = TranscriptFragment::final_(
        "hello world.",
        segments[0].start(),
        segments[0].end(),
    );
    let overlaps = fragment.start <= segments[0].end() && fragment.end >= segments[0].start();
    assert!(overlaps);

    assert!(matches!(
        filter.push(fragment, !overlaps),
        FilterDecision::Hold
    ));
    assert_eq!(filter.flush().unwrap().text, "hello world.");
}

#[test]
fn config_defaults_line_up_with_gate_expectations() {
    let config = Config::for_backend(kopivoice::BackendChoice::CloudStt);
    assert_eq!(config.vad.gap, Duration::from_millis(700));
    assert!(config.vad.debounce_frames >= 1);
    // Padding must stay below the gap or segments would never close
    assert!(config.vad.padding < config.vad.gap);
}
