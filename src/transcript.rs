//! Transcript fragments and the anti-hallucination filter
//!
//! Speech models routinely emit short stock phrases ("you", "thank you")
//! for silent or noisy audio. The filter suppresses those when no voice
//! segment was open, holds partials until superseded, and merges
//! contiguous finals into sentence-shaped units.

use std::time::Duration;

/// Confidence/finality of a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finality {
    /// Interim hypothesis; will be replaced by a later fragment
    Partial,
    /// Committed text for its time range
    Final,
}

/// One unit of backend transcript output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFragment {
    pub text: String,
    pub finality: Finality,
    /// Source time range, non-decreasing in emission order
    pub start: Duration,
    pub end: Duration,
    /// Set by the filter when the fragment was classified as a likely
    /// artifact of silence or noise
    pub hallucinated: bool,
}

impl TranscriptFragment {
    #[must_use]
    pub fn partial(text: impl Into<String>, start: Duration, end: Duration) -> Self {
        Self {
            text: text.into(),
            finality: Finality::Partial,
            start,
            end,
            hallucinated: false,
        }
    }

    #[must_use]
    pub fn final_(text: impl Into<String>, start: Duration, end: Duration) -> Self {
        Self {
            text: text.into(),
            finality: Finality::Final,
            start,
            end,
            hallucinated: false,
        }
    }

    /// Whitespace-separated token count
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

/// Filter decision for one pushed fragment
#[derive(Debug)]
pub enum FilterDecision {
    /// A completed unit is ready for the caller
    Emit(TranscriptFragment),
    /// Retained for merge or supersession; nothing to emit yet
    Hold,
    /// Dropped as a likely hallucination (flag set for observability)
    Suppress(TranscriptFragment),
}

/// Common hallucination strings emitted for silent audio
const HALLUCINATION_DENYLIST: &[&str] = &[
    "you",
    "thank you",
    "thanks for watching",
    "thank you for watching",
    "bye",
];

/// Fragments longer than this are never treated as hallucinations
const MAX_HALLUCINATION_TOKENS: usize = 3;

/// Two finals whose ranges are within this slack count as contiguous
const CONTIGUITY_SLACK: Duration = Duration::from_millis(250);

/// Stateless apart from one pending partial and one merge candidate.
#[derive(Debug, Default)]
pub struct TranscriptFilter {
    pending_partial: Option<TranscriptFragment>,
    pending_final: Option<TranscriptFragment>,
}

impl TranscriptFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw fragment through the filter.
    ///
    /// `silence_window` is true when no voice segment overlapped the
    /// fragment's time range.
    pub fn push(
        &mut self,
        fragment: TranscriptFragment,
        silence_window: bool,
    ) -> FilterDecision {
        match fragment.finality {
            Finality::Partial => {
                // Only the latest partial is retained; superseded partials
                // are discarded
                self.pending_partial = Some(fragment);
                FilterDecision::Hold
            }
            Finality::Final => {
                self.pending_partial = None;

                if silence_window && is_hallucination(&fragment) {
                    let mut flagged = fragment;
                    flagged.hallucinated = true;
                    tracing::debug!(
                        text = %flagged.text,
                        start_ms = flagged.start.as_millis(),
                        "suppressed likely hallucination"
                    );
                    return FilterDecision::Suppress(flagged);
                }

                match self.pending_final.take() {
                    Some(prev) if continues(&prev, &fragment) => {
                        self.pending_final = Some(merge(prev, fragment));
                        FilterDecision::Hold
                    }
                    Some(prev) => {
                        self.pending_final = Some(fragment);
                        FilterDecision::Emit(prev)
                    }
                    None => {
                        self.pending_final = Some(fragment);
                        FilterDecision::Hold
                    }
                }
            }
        }
    }

    /// Emit the held merge candidate, if any.
    ///
    /// Called when the caller knows no continuation is coming (silence
    /// window, turn boundary, session end).
    pub fn flush(&mut self) -> Option<TranscriptFragment> {
        self.pending_final.take()
    }

    /// The most recent interim hypothesis, for live display
    #[must_use]
    pub const fn pending_partial(&self) -> Option<&TranscriptFragment> {
        self.pending_partial.as_ref()
    }
}

/// Short denylisted phrases and bare punctuation runs
fn is_hallucination(fragment: &TranscriptFragment) -> bool {
    if fragment.token_count() > MAX_HALLUCINATION_TOKENS {
        return false;
    }

    let normalized: String = fragment
        .text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");

    if normalized.is_empty() {
        // Nothing but punctuation or whitespace
        return true;
    }

    HALLUCINATION_DENYLIST.contains(&normalized.as_str())
}

/// Contiguous ranges with no sentence boundary between them
fn continues(prev: &TranscriptFragment, next: &TranscriptFragment) -> bool {
    let contiguous = next.start <= prev.end + CONTIGUITY_SLACK && next.start >= prev.start;
    contiguous && !ends_sentence(&prev.text)
}

fn ends_sentence(text: &str) -> bool {
    matches!(
        text.trim_end().chars().last(),
        Some('.' | '!' | '?' | '…')
    )
}

fn merge(prev: TranscriptFragment, next: TranscriptFragment) -> TranscriptFragment {
    let mut text = prev.text;
    if !text.ends_with(char::is_whitespace) && !next.text.starts_with(char::is_whitespace) {
        text.push(' ');
    }
    text.push_str(next.text.trim_start());

    TranscriptFragment {
        text,
        finality: Finality::Final,
        start: prev.start,
        end: next.end.max(prev.end),
        hallucinated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn latest_partial_supersedes_earlier() {
        let mut filter = TranscriptFilter::new();

        let first = TranscriptFragment::partial("hel", ms(0), ms(300));
        let second = TranscriptFragment::partial("hello wor", ms(0), ms(800));

        assert!(matches!(filter.push(first, false), FilterDecision::Hold));
        assert!(matches!(filter.push(second.clone(), false), FilterDecision::Hold));
        assert_eq!(filter.pending_partial(), Some(&second));
    }

    #[test]
    fn partial_is_never_emitted_standalone() {
        let mut filter = TranscriptFilter::new();
        let partial = TranscriptFragment::partial("something", ms(0), ms(500));
        assert!(matches!(filter.push(partial, false), FilterDecision::Hold));
        assert!(filter.flush().is_none());
    }

    #[test]
    fn final_discards_pending_partial() {
        let mut filter = TranscriptFilter::new();
        filter.push(TranscriptFragment::partial("hello wo", ms(0), ms(700)), false);
        filter.push(
            TranscriptFragment::final_("hello world.", ms(0), ms(900)),
            false,
        );

        assert!(filter.pending_partial().is_none());
        assert_eq!(filter.flush().unwrap().text, "hello world.");
    }

    #[test]
    fn denylisted_final_in_silence_window_is_suppressed() {
        let mut filter = TranscriptFilter::new();
        let frag = TranscriptFragment::final_("Thank you.", ms(1000), ms(1400));

        match filter.push(frag, true) {
            FilterDecision::Suppress(flagged) => assert!(flagged.hallucinated),
            other => panic!("expected suppression, got {other:?}"),
        }
        assert!(filter.flush().is_none());
    }

    #[test]
    fn repeated_punctuation_in_silence_window_is_suppressed() {
        let mut filter = TranscriptFilter::new();
        let frag = TranscriptFragment::final_("...", ms(0), ms(200));
        assert!(matches!(filter.push(frag, true), FilterDecision::Suppress(_)));
    }

    #[test]
    fn denylisted_final_during_speech_passes_through() {
        let mut filter = TranscriptFilter::new();
        let frag = TranscriptFragment::final_("Thank you.", ms(1000), ms(1400));

        assert!(matches!(filter.push(frag, false), FilterDecision::Hold));
        let emitted = filter.flush().expect("fragment retained");
        assert_eq!(emitted.text, "Thank you.");
        assert!(!emitted.hallucinated);
    }

    #[test]
    fn long_text_in_silence_window_is_not_suppressed() {
        let mut filter = TranscriptFilter::new();
        let frag =
            TranscriptFragment::final_("could you pass the salt please", ms(0), ms(1500));
        assert!(matches!(filter.push(frag, true), FilterDecision::Hold));
        assert!(filter.flush().is_some());
    }

    #[test]
    fn contiguous_finals_without_boundary_merge() {
        let mut filter = TranscriptFilter::new();
        filter.push(
            TranscriptFragment::final_("I went to the", ms(0), ms(1000)),
            false,
        );
        let decision = filter.push(
            TranscriptFragment::final_("store yesterday.", ms(1100), ms(2000)),
            false,
        );

        assert!(matches!(decision, FilterDecision::Hold));
        let merged = filter.flush().unwrap();
        assert_eq!(merged.text, "I went to the store yesterday.");
        assert_eq!(merged.start, ms(0));
        assert_eq!(merged.end, ms(2000));
    }

    #[test]
    fn sentence_boundary_prevents_merge() {
        let mut filter = TranscriptFilter::new();
        filter.push(
            TranscriptFragment::final_("That is all.", ms(0), ms(1000)),
            false,
        );
        let decision = filter.push(
            TranscriptFragment::final_("Next topic", ms(1100), ms(2000)),
            false,
        );

        match decision {
            FilterDecision::Emit(prev) => assert_eq!(prev.text, "That is all."),
            other => panic!("expected emit of prior unit, got {other:?}"),
        }
        assert_eq!(filter.flush().unwrap().text, "Next topic");
    }

    #[test]
    fn distant_finals_do_not_merge() {
        let mut filter = TranscriptFilter::new();
        filter.push(
            TranscriptFragment::final_("first utterance", ms(0), ms(1000)),
            false,
        );
        let decision = filter.push(
            TranscriptFragment::final_("second utterance", ms(5000), ms(6000)),
            false,
        );

        assert!(matches!(decision, FilterDecision::Emit(_)));
    }

    #[test]
    fn time_ranges_are_non_decreasing_through_merge() {
        let mut filter = TranscriptFilter::new();
        filter.push(TranscriptFragment::final_("a and", ms(0), ms(400)), false);
        filter.push(TranscriptFragment::final_("b and", ms(450), ms(800)), false);
        filter.push(TranscriptFragment::final_("c", ms(850), ms(1000)), false);

        let merged = filter.flush().unwrap();
        assert_eq!(merged.text, "a and b and c");
        assert_eq!(merged.start, ms(0));
        assert_eq!(merged.end, ms(1000));
    }
}
