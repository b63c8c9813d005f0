use chrono::{DateTime, Utc};

use crate::model::Percent;

/// Percent of a module's media at which it counts as completed.
pub const COMPLETION_THRESHOLD: Percent = Percent::COMPLETION_THRESHOLD;

//
// ─── SAMPLE ────────────────────────────────────────────────────────────────────
//

/// One playback position reading. Lives in memory only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackSample {
    /// Seconds from the start of the media.
    pub position: f64,
    /// Total media length in seconds, if the backend knows it yet.
    pub duration: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

impl PlaybackSample {
    #[must_use]
    pub fn new(position: f64, duration: Option<f64>, observed_at: DateTime<Utc>) -> Self {
        Self {
            position,
            duration,
            observed_at,
        }
    }
}

/// `floor(position / duration * 100)` clamped to `0..=100`.
///
/// Returns `None` when the duration is missing, zero, or not finite, or when
/// the position is not finite; such samples carry no progress.
///
/// ```
/// # use course_core::calculator::percent_complete;
/// assert_eq!(percent_complete(45.0, Some(60.0)).map(|p| p.value()), Some(75));
/// assert_eq!(percent_complete(61.0, Some(60.0)).map(|p| p.value()), Some(100));
/// assert_eq!(percent_complete(10.0, Some(0.0)), None);
/// assert_eq!(percent_complete(10.0, None), None);
/// ```
#[must_use]
pub fn percent_complete(position: f64, duration: Option<f64>) -> Option<Percent> {
    let duration = duration.filter(|d| d.is_finite() && *d > 0.0)?;
    if !position.is_finite() {
        return None;
    }
    // the ratio is clamped right after, the cast cannot overflow meaningfully
    #[allow(clippy::cast_possible_truncation)]
    let raw = (position / duration * 100.0).floor() as i64;
    Some(Percent::clamped(raw))
}

//
// ─── OBSERVATION ───────────────────────────────────────────────────────────────
//

/// What the calculator derived from one sample or end-of-media signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Percent at the current position; may move backward on a rewind.
    pub display: Percent,
    /// Session maximum; never decreases. This is what gets persisted.
    pub watermark: Percent,
    /// Threshold reached while no completion is recorded yet.
    pub crossed_threshold: bool,
}

/// Pure derivation used by [`ProgressCalculator`].
///
/// Returns `None` if the sample carries no usable duration.
#[must_use]
pub fn calculate(
    sample: &PlaybackSample,
    prior_watermark: Percent,
    threshold: Percent,
    completion_recorded: bool,
) -> Option<Observation> {
    let display = percent_complete(sample.position, sample.duration)?;
    let watermark = prior_watermark.max(display);
    Some(Observation {
        display,
        watermark,
        crossed_threshold: !completion_recorded && watermark >= threshold,
    })
}

//
// ─── CALCULATOR ────────────────────────────────────────────────────────────────
//

/// Session-scoped progress derivation for one (user, module).
///
/// Keeps the watermark so rewinds never regress what is persisted, and
/// keeps reporting `crossed_threshold` until the caller confirms the
/// completion was recorded.
///
/// ```
/// # use course_core::calculator::{PlaybackSample, ProgressCalculator};
/// # use course_core::model::Percent;
/// let now = chrono::Utc::now();
/// let mut calc = ProgressCalculator::new(Percent::COMPLETION_THRESHOLD, Percent::ZERO, false);
///
/// let obs = calc.observe(&PlaybackSample::new(80.0, Some(100.0), now)).unwrap();
/// assert_eq!(obs.watermark.value(), 80);
///
/// let rewind = calc.observe(&PlaybackSample::new(20.0, Some(100.0), now)).unwrap();
/// assert_eq!(rewind.display.value(), 20);
/// assert_eq!(rewind.watermark.value(), 80);
/// ```
#[derive(Debug, Clone)]
pub struct ProgressCalculator {
    threshold: Percent,
    watermark: Percent,
    display: Percent,
    completion_recorded: bool,
}

impl ProgressCalculator {
    /// `prior_watermark` and `completion_recorded` come from the stored record,
    /// so a resumed session never reports less than what is already durable.
    #[must_use]
    pub fn new(threshold: Percent, prior_watermark: Percent, completion_recorded: bool) -> Self {
        Self {
            threshold,
            watermark: prior_watermark,
            display: prior_watermark,
            completion_recorded,
        }
    }

    /// Fold a sample in. `None` means the sample was skipped.
    pub fn observe(&mut self, sample: &PlaybackSample) -> Option<Observation> {
        let obs = calculate(
            sample,
            self.watermark,
            self.threshold,
            self.completion_recorded,
        )?;
        self.display = obs.display;
        self.watermark = obs.watermark;
        Some(obs)
    }

    /// End of media always means 100%.
    pub fn observe_ended(&mut self) -> Observation {
        self.display = Percent::FULL;
        self.watermark = Percent::FULL;
        Observation {
            display: Percent::FULL,
            watermark: Percent::FULL,
            crossed_threshold: !self.completion_recorded,
        }
    }

    /// Stop reporting threshold crossings. A recorded completion is stored
    /// as 100%, so the watermark follows it.
    pub fn mark_completion_recorded(&mut self) {
        self.completion_recorded = true;
        self.watermark = Percent::FULL;
    }

    #[must_use]
    pub fn completion_recorded(&self) -> bool {
        self.completion_recorded
    }

    #[must_use]
    pub fn watermark(&self) -> Percent {
        self.watermark
    }

    #[must_use]
    pub fn display(&self) -> Percent {
        self.display
    }

    #[must_use]
    pub fn threshold(&self) -> Percent {
        self.threshold
    }
}

impl Default for ProgressCalculator {
    fn default() -> Self {
        Self::new(COMPLETION_THRESHOLD, Percent::ZERO, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;
    use proptest::prelude::*;

    fn sample(position: f64, duration: f64) -> PlaybackSample {
        PlaybackSample::new(position, Some(duration), fixed_now())
    }

    #[test]
    fn percent_floors_and_clamps() {
        assert_eq!(percent_complete(0.0, Some(10.0)), Some(Percent::ZERO));
        assert_eq!(percent_complete(9.99, Some(10.0)).map(Percent::value), Some(99));
        assert_eq!(percent_complete(-3.0, Some(10.0)), Some(Percent::ZERO));
        assert_eq!(percent_complete(12.0, Some(10.0)), Some(Percent::FULL));
        assert_eq!(percent_complete(f64::NAN, Some(10.0)), None);
        assert_eq!(percent_complete(1.0, Some(f64::INFINITY)), None);
        assert_eq!(percent_complete(1.0, Some(-10.0)), None);
    }

    #[test]
    fn skips_samples_without_duration() {
        let mut calc = ProgressCalculator::default();
        assert_eq!(calc.observe(&PlaybackSample::new(5.0, None, fixed_now())), None);
        assert_eq!(calc.observe(&sample(5.0, 0.0)), None);
        assert_eq!(calc.watermark(), Percent::ZERO);
    }

    #[test]
    fn threshold_crossing_repeats_until_recorded() {
        let mut calc = ProgressCalculator::default();
        assert!(!calc.observe(&sample(94.9, 100.0)).unwrap().crossed_threshold);
        assert!(calc.observe(&sample(95.0, 100.0)).unwrap().crossed_threshold);
        assert!(calc.observe(&sample(96.0, 100.0)).unwrap().crossed_threshold);

        calc.mark_completion_recorded();
        assert_eq!(calc.watermark(), Percent::FULL);
        let after = calc.observe(&sample(97.0, 100.0)).unwrap();
        assert!(!after.crossed_threshold);
        assert_eq!(after.display.value(), 97);
        assert_eq!(after.watermark, Percent::FULL);
        assert!(!calc.observe_ended().crossed_threshold);
    }

    #[test]
    fn rewind_after_threshold_still_reports_crossing_from_watermark() {
        let mut calc = ProgressCalculator::default();
        calc.observe(&sample(96.0, 100.0));
        let obs = calc.observe(&sample(10.0, 100.0)).unwrap();
        assert_eq!(obs.display.value(), 10);
        assert_eq!(obs.watermark.value(), 96);
        assert!(obs.crossed_threshold);
    }

    #[test]
    fn ended_forces_full_percent() {
        let mut calc = ProgressCalculator::default();
        calc.observe(&sample(12.0, 100.0));
        let obs = calc.observe_ended();
        assert_eq!(obs.watermark, Percent::FULL);
        assert_eq!(obs.display, Percent::FULL);
        assert!(obs.crossed_threshold);
    }

    #[test]
    fn resumed_session_starts_from_stored_watermark() {
        let mut calc = ProgressCalculator::new(COMPLETION_THRESHOLD, Percent::new(40).unwrap(), false);
        let obs = calc.observe(&sample(30.0, 100.0)).unwrap();
        assert_eq!(obs.display.value(), 30);
        assert_eq!(obs.watermark.value(), 40);
    }

    #[test]
    fn already_completed_module_never_crosses() {
        let mut calc = ProgressCalculator::new(COMPLETION_THRESHOLD, Percent::FULL, true);
        assert!(!calc.observe(&sample(99.0, 100.0)).unwrap().crossed_threshold);
    }

    proptest! {
        #[test]
        fn watermark_is_monotonic_for_any_sample_sequence(
            positions in proptest::collection::vec(-10.0_f64..700.0, 1..64),
            duration in 1.0_f64..600.0,
        ) {
            let mut calc = ProgressCalculator::default();
            let mut last = Percent::ZERO;
            for p in positions {
                if let Some(obs) = calc.observe(&sample(p, duration)) {
                    prop_assert!(obs.watermark >= last);
                    prop_assert!(obs.watermark >= obs.display);
                    last = obs.watermark;
                }
            }
        }
    }
}
