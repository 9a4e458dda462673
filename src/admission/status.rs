use serde::{Deserialize, Serialize};

/// Outcome code carried by every admission operation.
///
/// These are protocol results, not process errors: they are returned to the
/// caller, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdmissionStatus {
    Success,
    /// A required field is absent.
    MissingArgument,
    /// Wrong type, out-of-range value, or malformed JSON.
    InvalidArgument,
    FlowNameInUse,
    ClientNameInUse,
    QueueNameInUse,
    FlowNameNonexistent,
    ClientNameNonexistent,
    QueueNameNonexistent,
    /// A queue cannot be deleted while flows still cross it.
    QueueHasActiveFlows,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&AdmissionStatus::QueueHasActiveFlows).unwrap();
        assert_eq!(json, "\"QUEUE_HAS_ACTIVE_FLOWS\"");
        let back: AdmissionStatus = serde_json::from_str("\"SUCCESS\"").unwrap();
        assert_eq!(back, AdmissionStatus::Success);
    }
}
