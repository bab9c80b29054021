use std::fmt;

use strum::EnumIter;

/// Gross protocol failures produced by the frame codec or the bus arbiter.
///
/// Every variant corresponds 1:1 with a Prometheus error-counter label, so
/// the set is small, closed, and iterable to let the metrics sink enumerate
/// all label values at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum ErrorKind {
    /// Unknown function code, over-long frame, or an internal length byte
    /// that disagrees with the bytes actually present.
    InvalidFormat,
    /// Bytes were expected but none arrived within the read window.
    Timeout,
    /// Frame bytes are intact in length but the trailing CRC does not match.
    CrcFailed,
    /// Response station/function/echoed-register disagrees with the
    /// request that is still pending.
    ResponseMismatch,
}

impl ErrorKind {
    /// The Prometheus `error` label value for this error kind.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::InvalidFormat => "decode_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CrcFailed => "crc_failed",
            ErrorKind::ResponseMismatch => "response_mismatch",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidFormat => write!(f, "invalid or unknown packet format"),
            ErrorKind::Timeout => write!(f, "too few bytes received"),
            ErrorKind::CrcFailed => write!(f, "CRC check failed"),
            ErrorKind::ResponseMismatch => write!(f, "response packet does not match request"),
        }
    }
}

impl std::error::Error for ErrorKind {}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn every_kind_has_a_distinct_label() {
        let labels: Vec<_> = ErrorKind::iter().map(ErrorKind::label).collect();
        let mut sorted = labels.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(labels.len(), sorted.len());
    }
}
