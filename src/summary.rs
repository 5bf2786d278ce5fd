use serde::{Deserialize, Serialize};

use crate::error::SummarizeError;

pub const MAX_LENGTH_RANGE: (u32, u32) = (30, 500);
pub const MIN_LENGTH_RANGE: (u32, u32) = (10, 100);
pub const DEFAULT_MAX_LENGTH: u32 = 150;
pub const DEFAULT_MIN_LENGTH: u32 = 40;

/// Output length bounds in model tokens.
///
/// Each bound is clamped to its slider range. The ordering between the two
/// is deliberately not enforced: `min_length > max_length` reaches the model
/// as-is, where generation stops at `max_length` because end-of-sequence is
/// forced there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LengthBounds {
    pub max_length: u32,
    pub min_length: u32,
}

impl Default for LengthBounds {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            min_length: DEFAULT_MIN_LENGTH,
        }
    }
}

impl LengthBounds {
    pub fn new(max_length: Option<u32>, min_length: Option<u32>) -> Self {
        let max_length = max_length
            .unwrap_or(DEFAULT_MAX_LENGTH)
            .clamp(MAX_LENGTH_RANGE.0, MAX_LENGTH_RANGE.1);
        let min_length = min_length
            .unwrap_or(DEFAULT_MIN_LENGTH)
            .clamp(MIN_LENGTH_RANGE.0, MIN_LENGTH_RANGE.1);
        Self {
            max_length,
            min_length,
        }
    }

    pub fn is_inverted(&self) -> bool {
        self.min_length > self.max_length
    }
}

/// One submission: the text and the bounds it is summarized under.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryRequest {
    #[serde(default)]
    pub input_text: String,
    #[serde(default)]
    pub max_length: Option<u32>,
    #[serde(default)]
    pub min_length: Option<u32>,
}

impl SummaryRequest {
    pub fn bounds(&self) -> LengthBounds {
        LengthBounds::new(self.max_length, self.min_length)
    }

    /// Whitespace-only text counts as empty.
    pub fn validate(&self) -> Result<(), SummarizeError> {
        if self.input_text.trim().is_empty() {
            return Err(SummarizeError::EmptyInput);
        }
        Ok(())
    }
}

/// What the adapter hands back for a successful submission.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryResult {
    pub summary_text: String,
    pub original_length: usize,
    pub summary_length: usize,
    pub compression_ratio: f64,
    pub compression_percent: i64,
    pub elapsed_ms: u64,
    pub input_tokens: usize,
    pub truncated: bool,
}

impl SummaryResult {
    pub fn new(input_text: &str, summary_text: String) -> Self {
        let original_length = char_len(input_text);
        let summary_length = char_len(&summary_text);
        let compression_ratio = compression_ratio(original_length, summary_length);

        Self {
            summary_text,
            original_length,
            summary_length,
            compression_ratio,
            compression_percent: compression_percent(compression_ratio),
            elapsed_ms: 0,
            input_tokens: 0,
            truncated: false,
        }
    }
}

/// Length as a user counts it: Unicode scalar values, not bytes.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

pub fn compression_ratio(original_length: usize, summary_length: usize) -> f64 {
    if original_length == 0 {
        return 0.0;
    }
    1.0 - summary_length as f64 / original_length as f64
}

pub fn compression_percent(ratio: f64) -> i64 {
    (ratio * 100.0).round() as i64
}
