use thiserror::Error;

pub const EMPTY_INPUT_MESSAGE: &str = "Please enter some text to summarize";

/// Remediation text shown next to every adapter failure.
pub const REMEDIATION_HINT: &str = "Make sure the model can be loaded: either point \
SUMMARIZER_MODEL_DIR at a local snapshot of facebook/bart-large-cnn (config.json, \
tokenizer.json or vocab.json + merges.txt, model.safetensors) or allow the server to \
download it from the Hugging Face Hub on first use. The model needs roughly 2 GB of \
free memory to run on CPU.";

/// The two conditions a submission can end in besides a summary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SummarizeError {
    /// Nothing to summarize; the adapter is never called.
    #[error("{}", EMPTY_INPUT_MESSAGE)]
    EmptyInput,

    /// Model initialization or invocation failed for any reason.
    #[error("An error occurred: {0}")]
    AdapterFailure(String),
}

impl SummarizeError {
    pub fn adapter(err: impl std::fmt::Display) -> Self {
        SummarizeError::AdapterFailure(err.to_string())
    }

    /// Flattens an anyhow chain into a single line so nested causes
    /// (e.g. "download failed: connection refused") reach the user.
    pub fn from_chain(err: &anyhow::Error) -> Self {
        SummarizeError::AdapterFailure(format!("{err:#}"))
    }

    pub fn code(&self) -> &'static str {
        match self {
            SummarizeError::EmptyInput => "empty_input",
            SummarizeError::AdapterFailure(_) => "adapter_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn empty_input_uses_fixed_warning() {
        assert_eq!(
            SummarizeError::EmptyInput.to_string(),
            "Please enter some text to summarize"
        );
    }

    #[test]
    fn adapter_failure_keeps_cause_chain() {
        let err = Err::<(), _>(anyhow::anyhow!("connection refused"))
            .context("failed to fetch model.safetensors")
            .unwrap_err();
        let mapped = SummarizeError::from_chain(&err);
        assert_eq!(
            mapped.to_string(),
            "An error occurred: failed to fetch model.safetensors: connection refused"
        );
        assert_eq!(mapped.code(), "adapter_failure");
    }
}
