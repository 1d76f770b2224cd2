//! Shared batch-operation semantics.
//!
//! Batch-wide constraint violations (bad or duplicate entry ids, too
//! many entries, oversized total payload) fail fast and process nothing.
//! Everything past that gate is per-entry: a structurally invalid entry
//! lands in the failure list with a machine-readable code while its
//! siblings proceed, and the call itself succeeds.

use serde::Serialize;

use crate::config::BatchConfig;
use crate::error::{QueueServiceError, Result};

/// Maximum length of a caller-supplied batch entry id.
const MAX_ENTRY_ID_LEN: usize = 80;

/// Per-entry failure, returned as data rather than an error.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResultError {
    pub id: String,
    pub code: String,
    pub message: String,
    pub sender_fault: bool,
}

impl BatchResultError {
    pub fn sender(id: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            code: code.to_string(),
            message: message.into(),
            sender_fault: true,
        }
    }
}

/// Outcome of a batch call: per-entry successes and failures, never a
/// hard error for entry-level problems.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult<T> {
    pub successes: Vec<T>,
    pub failures: Vec<BatchResultError>,
}

impl<T> BatchResult<T> {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            successes: Vec::with_capacity(n),
            failures: Vec::new(),
        }
    }
}

/// A request entry subject to batch-wide validation.
pub trait BatchEntry {
    fn entry_id(&self) -> &str;

    /// Bytes this entry contributes to the payload-size limit. Zero for
    /// operations without a payload (delete, change-visibility).
    fn payload_size(&self) -> usize {
        0
    }
}

fn entry_id_is_valid(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ENTRY_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Batch-wide fail-fast validation. Runs before any entry is processed;
/// an error here means nothing was enqueued, deleted, or changed.
pub fn validate_batch<E: BatchEntry>(entries: &[E], limits: &BatchConfig) -> Result<()> {
    if entries.is_empty() {
        return Err(QueueServiceError::Validation(
            "batch must contain at least one entry".to_string(),
        ));
    }

    if entries.len() > limits.max_entries {
        return Err(QueueServiceError::TooManyEntriesInBatchRequest(format!(
            "{} entries, maximum is {}",
            entries.len(),
            limits.max_entries
        )));
    }

    for entry in entries {
        if !entry_id_is_valid(entry.entry_id()) {
            return Err(QueueServiceError::InvalidBatchEntryId(format!(
                "entry id {:?} must match [A-Za-z0-9_-]{{1,{}}}",
                entry.entry_id(),
                MAX_ENTRY_ID_LEN
            )));
        }
    }

    for (i, entry) in entries.iter().enumerate() {
        if entries[..i].iter().any(|e| e.entry_id() == entry.entry_id()) {
            return Err(QueueServiceError::BatchEntryIdsNotDistinct(
                entry.entry_id().to_string(),
            ));
        }
    }

    let total_payload: usize = entries.iter().map(|e| e.payload_size()).sum();
    if total_payload > limits.max_payload_bytes {
        return Err(QueueServiceError::BatchRequestTooLong(format!(
            "{} bytes, maximum is {}",
            total_payload, limits.max_payload_bytes
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestEntry {
        id: String,
        size: usize,
    }

    impl BatchEntry for TestEntry {
        fn entry_id(&self) -> &str {
            &self.id
        }

        fn payload_size(&self) -> usize {
            self.size
        }
    }

    fn entry(id: &str, size: usize) -> TestEntry {
        TestEntry {
            id: id.to_string(),
            size,
        }
    }

    fn limits() -> BatchConfig {
        BatchConfig {
            max_entries: 10,
            max_payload_bytes: 1_000,
        }
    }

    #[test]
    fn test_valid_batch_passes() {
        let entries = vec![entry("a", 100), entry("b-2", 100), entry("c_3", 100)];
        assert!(validate_batch(&entries, &limits()).is_ok());
    }

    #[test]
    fn test_empty_batch_rejected() {
        let entries: Vec<TestEntry> = vec![];
        let err = validate_batch(&entries, &limits()).unwrap_err();
        assert_eq!(err.code(), "ValidationError");
    }

    #[test]
    fn test_too_many_entries() {
        let entries: Vec<TestEntry> = (0..11).map(|i| entry(&format!("e{}", i), 1)).collect();
        let err = validate_batch(&entries, &limits()).unwrap_err();
        assert_eq!(err.code(), "TooManyEntriesInBatchRequest");
    }

    #[test]
    fn test_invalid_entry_id() {
        let too_long = "x".repeat(81);
        for bad in ["", "has space", "semi;colon", too_long.as_str()] {
            let entries = vec![entry(bad, 1)];
            let err = validate_batch(&entries, &limits()).unwrap_err();
            assert_eq!(err.code(), "InvalidBatchEntryId", "id {:?}", bad);
        }
    }

    #[test]
    fn test_duplicate_entry_ids() {
        let entries = vec![entry("a", 1), entry("b", 1), entry("a", 1)];
        let err = validate_batch(&entries, &limits()).unwrap_err();
        assert_eq!(err.code(), "BatchEntryIdsNotDistinct");
    }

    #[test]
    fn test_total_payload_limit() {
        let entries = vec![entry("a", 600), entry("b", 600)];
        let err = validate_batch(&entries, &limits()).unwrap_err();
        assert_eq!(err.code(), "BatchRequestTooLong");

        // Each entry under the limit individually is fine when the sum fits
        let entries = vec![entry("a", 400), entry("b", 400)];
        assert!(validate_batch(&entries, &limits()).is_ok());
    }
}
