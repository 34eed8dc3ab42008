//! Coordinate feedback: the consumer reports its estimate, the producer
//! scores it against ground truth.

use std::fmt;

use balltrack_analysis::SharedEstimate;
use balltrack_core::{Coordinate, CoordinateParseError};
use balltrack_transport::DataChannel;
use tracing::{debug, info, warn};

// ── Consumer side ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Sent(Coordinate),
    /// Channel not open. Reports are snapshots, so nothing is queued or retried.
    Dropped,
}

/// Sends the latest estimate as `"x,y"` over the coordinate channel.
#[derive(Debug, Clone)]
pub struct CoordinateReporter {
    channel: DataChannel,
    estimate: SharedEstimate,
}

impl CoordinateReporter {
    pub fn new(channel: DataChannel, estimate: SharedEstimate) -> Self {
        Self { channel, estimate }
    }

    pub async fn report(&self) -> ReportOutcome {
        if !self.channel.is_open() {
            return ReportOutcome::Dropped;
        }
        let coordinate = self.estimate.coordinate();
        match self.channel.send_text(coordinate.to_string()).await {
            Ok(()) => ReportOutcome::Sent(coordinate),
            Err(e) => {
                debug!("Coordinate {} dropped: {}", coordinate, e);
                ReportOutcome::Dropped
            }
        }
    }
}

// ── Producer side ─────────────────────────────────────────────────────────────

/// One scored report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackSample {
    pub estimate: Coordinate,
    pub ground_truth: Coordinate,
    /// `ground_truth - estimate`, per axis.
    pub error: Coordinate,
}

pub struct GroundTruthComparator;

impl GroundTruthComparator {
    /// Parses `message` and scores it. Estimates so far out that the error
    /// does not fit an `i32` are treated like any other malformed report.
    pub fn compare(message: &str, ground_truth: Coordinate) -> Result<FeedbackSample, CoordinateParseError> {
        let estimate: Coordinate = message.parse()?;
        let error = ground_truth
            .offset_from(estimate)
            .map_err(|e| CoordinateParseError { message: message.to_owned(), ..e })?;
        Ok(FeedbackSample { estimate, ground_truth, error })
    }
}

/// Receives every scored report on the producer.
pub trait FeedbackSink: Send {
    fn record(&mut self, sample: &FeedbackSample);

    fn malformed(&mut self, _error: &CoordinateParseError) {}
}

impl<S: FeedbackSink + ?Sized> FeedbackSink for Box<S> {
    fn record(&mut self, sample: &FeedbackSample) {
        (**self).record(sample)
    }

    fn malformed(&mut self, error: &CoordinateParseError) {
        (**self).malformed(error)
    }
}

/// Logs each `(estimate, ground truth, error)` triple.
#[derive(Debug, Default)]
pub struct LogFeedbackSink;

impl FeedbackSink for LogFeedbackSink {
    fn record(&mut self, sample: &FeedbackSample) {
        info!(
            "Received: ({}), Actual: ({}), Error: ({})",
            sample.estimate, sample.ground_truth, sample.error
        );
    }

    fn malformed(&mut self, error: &CoordinateParseError) {
        warn!("{}", error);
    }
}

/// Running accuracy over all reports.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccuracySummary {
    pub received: u64,
    pub malformed: u64,
    sum_abs_x: u64,
    sum_abs_y: u64,
    /// Largest absolute error seen on each axis, as `(x, y)`.
    pub max_abs_error: (u32, u32),
}

impl AccuracySummary {
    pub fn mean_abs_error(&self) -> (f64, f64) {
        if self.received == 0 {
            return (0.0, 0.0);
        }
        let n = self.received as f64;
        (self.sum_abs_x as f64 / n, self.sum_abs_y as f64 / n)
    }
}

impl FeedbackSink for AccuracySummary {
    fn record(&mut self, sample: &FeedbackSample) {
        let (dx, dy) = (sample.error.x.unsigned_abs(), sample.error.y.unsigned_abs());
        self.received += 1;
        self.sum_abs_x += u64::from(dx);
        self.sum_abs_y += u64::from(dy);
        self.max_abs_error.0 = self.max_abs_error.0.max(dx);
        self.max_abs_error.1 = self.max_abs_error.1.max(dy);
    }

    fn malformed(&mut self, _error: &CoordinateParseError) {
        self.malformed += 1;
    }
}

impl fmt::Display for AccuracySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (mx, my) = self.mean_abs_error();
        write!(
            f,
            "received={} malformed={} mean_abs_error=({:.1},{:.1}) max_abs_error=({},{})",
            self.received, self.malformed, mx, my, self.max_abs_error.0, self.max_abs_error.1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_is_truth_minus_estimate() {
        let sample = GroundTruthComparator::compare("300,250", Coordinate::new(310, 245)).unwrap();
        assert_eq!(sample.estimate, Coordinate::new(300, 250));
        assert_eq!(sample.error, Coordinate::new(10, -5));
    }

    #[test]
    fn malformed_messages_are_errors() {
        for bad in ["", "12", "a,b", "1,2,3", "1.5,2"] {
            assert!(GroundTruthComparator::compare(bad, Coordinate::ORIGIN).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn summary_tracks_mean_and_max() {
        let mut summary = AccuracySummary::default();
        summary.record(&GroundTruthComparator::compare("0,0", Coordinate::new(2, -4)).unwrap());
        summary.record(&GroundTruthComparator::compare("0,0", Coordinate::new(-6, 0)).unwrap());
        let err = GroundTruthComparator::compare("x", Coordinate::ORIGIN).unwrap_err();
        summary.malformed(&err);

        assert_eq!(summary.received, 2);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.mean_abs_error(), (4.0, 2.0));
        assert_eq!(summary.max_abs_error, (6, 4));
    }

    #[test]
    fn extreme_estimates_are_malformed_not_fatal() {
        let err = GroundTruthComparator::compare("-2147483648,0", Coordinate::new(320, 240)).unwrap_err();
        assert_eq!(err.message, "-2147483648,0");
        assert_eq!(err.reason, "out of range");
        assert!(GroundTruthComparator::compare("0,2147483647", Coordinate::new(0, -2)).is_err());
    }

    #[test]
    fn summary_holds_the_widest_representable_error() {
        // -1 - i32::MAX is exactly i32::MIN: representable, but its magnitude is not.
        let sample = GroundTruthComparator::compare("2147483647,0", Coordinate::new(-1, 0)).unwrap();
        assert_eq!(sample.error.x, i32::MIN);

        let mut summary = AccuracySummary::default();
        summary.record(&sample);
        assert_eq!(summary.max_abs_error, (1 << 31, 0));
        assert_eq!(summary.mean_abs_error().0, 2_147_483_648.0);
        assert!(summary.to_string().ends_with("max_abs_error=(2147483648,0)"));
    }
}
