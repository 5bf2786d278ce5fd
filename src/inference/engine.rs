use anyhow::{anyhow, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::sync::Mutex;
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::bart::{last_log_probs, BartForConditionalGeneration};
use super::generation::{beam_search, GenerationConfig, StepDecoder};
use super::loader::SnapshotFiles;
use super::{SummaryEngine, SummaryRecord};
use crate::config::AppConfig;
use crate::summary::LengthBounds;

/// Tokenizer artifacts removed after decoding, in application order.
const TOKENIZATION_SPACES: &[(&str, &str)] = &[
    (" .", "."),
    (" ?", "?"),
    (" !", "!"),
    (" ,", ","),
    (" ' ", "'"),
    (" n't", "n't"),
    (" 'm", "'m"),
    (" 's", "'s"),
    (" 've", "'ve"),
    (" 're", "'re"),
];

/// BART summarizer running on the CPU with one long-lived set of weights.
pub struct BartSummarizer {
    model: Mutex<BartForConditionalGeneration>,
    tokenizer: Tokenizer,
    generation: GenerationConfig,
    device: Device,
    max_input_tokens: usize,
}

impl BartSummarizer {
    pub async fn load(cfg: &AppConfig) -> Result<Self> {
        let files = SnapshotFiles::resolve(cfg).await?;
        tokio::task::spawn_blocking(move || Self::from_snapshot(&files))
            .await
            .map_err(|e| anyhow!("model loading task failed: {e}"))?
    }

    pub fn from_snapshot(files: &SnapshotFiles) -> Result<Self> {
        let started = Instant::now();
        let device = Device::Cpu;

        let config = files.load_config()?;
        let generation = files.load_generation_config(&config)?;
        let tokenizer = files.load_tokenizer()?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.weights.clone()], DType::F32, &device)?
        };
        let model = BartForConditionalGeneration::load(&config, vb)?;

        println!("🚀 BART loaded on CPU in {:.1}s", started.elapsed().as_secs_f32());
        info!(
            beams = generation.num_beams,
            length_penalty = generation.length_penalty,
            no_repeat_ngram_size = generation.no_repeat_ngram_size,
            "generation settings"
        );

        Ok(Self {
            max_input_tokens: config.max_position_embeddings,
            model: Mutex::new(model),
            tokenizer,
            generation,
            device,
        })
    }

    /// Token ids for the encoder, cut to the position window with the
    /// closing `</s>` kept. The flag reports whether anything was cut.
    fn encode_input(&self, text: &str) -> Result<(Vec<u32>, bool)> {
        let enc = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        Ok(fit_window(
            enc.get_ids().to_vec(),
            self.max_input_tokens,
            self.generation.eos_token_id,
        ))
    }

    fn decode_output(&self, ids: &[u32]) -> Result<String> {
        let raw = self
            .tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {e}"))?;
        Ok(clean_up_tokenization(&raw))
    }
}

impl SummaryEngine for BartSummarizer {
    fn summarize(&self, text: &str, bounds: &LengthBounds) -> Result<Vec<SummaryRecord>> {
        let (ids, truncated) = self.encode_input(text)?;
        if truncated {
            warn!(
                max_tokens = self.max_input_tokens,
                "input exceeds the model window, truncating"
            );
        }
        let generation = self.generation.with_bounds(bounds);

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("model lock poisoned by an earlier failure"))?;
        model.reset_kv_cache();

        let input = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let encoder_xs = model
            .encode(&input)?
            .repeat((generation.num_beams.max(1), 1, 1))?;

        let started = Instant::now();
        let output = {
            let mut decoder = BeamDecoder {
                model: &mut *model,
                encoder_xs,
                device: &self.device,
            };
            beam_search(&mut decoder, &generation)?
        };
        model.reset_kv_cache();
        debug!(
            input_tokens = ids.len(),
            output_tokens = output.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "beam search finished"
        );

        Ok(vec![SummaryRecord {
            summary_text: self.decode_output(&output)?,
            input_tokens: ids.len(),
            truncated,
        }])
    }
}

struct BeamDecoder<'a> {
    model: &'a mut BartForConditionalGeneration,
    encoder_xs: Tensor,
    device: &'a Device,
}

impl StepDecoder for BeamDecoder<'_> {
    fn step(&mut self, last_tokens: &[u32], past_len: usize) -> Result<Vec<Vec<f32>>> {
        let input = Tensor::new(last_tokens, self.device)?.unsqueeze(1)?;
        let logits = self.model.decode(&input, &self.encoder_xs, past_len)?;
        Ok(last_log_probs(&logits)?.to_vec2::<f32>()?)
    }

    fn reorder(&mut self, beam_idx: &[u32]) -> Result<()> {
        let idx = Tensor::new(beam_idx, self.device)?;
        self.model.reorder_kv_cache(&idx)?;
        Ok(())
    }
}

/// Cuts `ids` to at most `max` tokens, ending the cut sequence with `eos`.
pub fn fit_window(mut ids: Vec<u32>, max: usize, eos: u32) -> (Vec<u32>, bool) {
    if ids.len() <= max || max == 0 {
        return (ids, false);
    }
    ids.truncate(max - 1);
    ids.push(eos);
    (ids, true)
}

/// Drops the spaces the byte-level tokenizer leaves before punctuation and
/// contractions.
pub fn clean_up_tokenization(text: &str) -> String {
    let mut out = text.to_string();
    for (from, to) in TOKENIZATION_SPACES {
        out = out.replace(from, to);
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn clean_up_joins_punctuation_and_contractions() {
        assert_eq!(
            clean_up_tokenization(" The search engine is n't perfect , but it 's fast ."),
            "The search engine isn't perfect, but it's fast."
        );
    }

    #[test]
    fn input_window_keeps_closing_token() {
        const EOS: u32 = 2;
        let ids = |n: usize| -> Vec<u32> {
            let mut ids = vec![0];
            ids.extend((1..n - 1).map(|i| 10 + i as u32));
            ids.push(EOS);
            ids
        };

        let (short, cut) = fit_window(ids(1023), 1024, EOS);
        assert!(!cut);
        assert_eq!(short, ids(1023));

        let (exact, cut) = fit_window(ids(1024), 1024, EOS);
        assert!(!cut);
        assert_eq!(exact.len(), 1024);

        let (long, cut) = fit_window(ids(1025), 1024, EOS);
        assert!(cut);
        assert_eq!(long.len(), 1024);
        assert_eq!(long[0], 0);
        assert_eq!(long.last(), Some(&EOS));
        assert_eq!(long[1022], 10 + 1022);
    }

    #[test]
    fn summarizes_with_local_snapshot() {
        let snapshot = PathBuf::from("models/bart-large-cnn");
        if !snapshot.join("model.safetensors").exists() {
            eprintln!(
                "bart snapshot missing under {}, skipping test",
                snapshot.display()
            );
            return;
        }
        let files = SnapshotFiles::from_dir(&snapshot).expect("snapshot files");
        let summarizer = BartSummarizer::from_snapshot(&files).expect("failed to load bart");
        let bounds = LengthBounds::new(Some(30), Some(10));
        let records = summarizer
            .summarize("Rain fell all day.", &bounds)
            .expect("summarization failed");
        assert_eq!(records.len(), 1);
        assert!(!records[0].summary_text.is_empty());
        assert!(!records[0].truncated);
    }
}
