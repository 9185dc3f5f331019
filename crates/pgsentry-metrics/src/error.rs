use rust_decimal::Decimal;

/// Failure modes of metric resolution. Callers branch on the kind: a
/// too-old server is silently skipped while a missing definition is
/// worth a (rate-limited) complaint.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricLookupError {
    /// No definition exists under this metric name.
    #[error("no SQL definition found for metric \"{metric}\"")]
    NotFound { metric: String },

    /// Definitions exist, but the server predates the oldest variant.
    #[error(
        "no suitable SQL found for metric \"{metric}\", server version \"{server_version}\" too old, min defined version: {min_version}"
    )]
    TooOld {
        metric: String,
        server_version: String,
        min_version: Decimal,
    },
}

impl MetricLookupError {
    pub fn is_too_old(&self) -> bool {
        matches!(self, MetricLookupError::TooOld { .. })
    }
}
