use std::cmp::Ordering;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use super::bart::Config as BartConfig;
use crate::summary::LengthBounds;

/// Decoding settings. Lengths count decoder tokens, the start token included.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub num_beams: usize,
    pub length_penalty: f32,
    pub no_repeat_ngram_size: usize,
    pub early_stopping: bool,
    pub min_length: usize,
    pub max_length: usize,
    pub decoder_start_token_id: u32,
    pub eos_token_id: u32,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
}

impl GenerationConfig {
    /// The settings `facebook/bart-large-cnn` ships with.
    pub fn for_model(cfg: &BartConfig) -> Self {
        Self {
            num_beams: 4,
            length_penalty: 2.0,
            no_repeat_ngram_size: 3,
            early_stopping: true,
            min_length: 56,
            max_length: 142,
            decoder_start_token_id: cfg.decoder_start_token_id,
            eos_token_id: cfg.eos_token_id,
            forced_bos_token_id: cfg.forced_bos_token_id,
            forced_eos_token_id: cfg.forced_eos_token_id,
        }
    }

    /// Overlays the fields present in `generation_config.json`.
    pub fn merge_file(mut self, file: &GenerationConfigFile) -> Self {
        if let Some(v) = file.num_beams {
            self.num_beams = v.max(1);
        }
        if let Some(v) = file.length_penalty {
            self.length_penalty = v;
        }
        if let Some(v) = file.no_repeat_ngram_size {
            self.no_repeat_ngram_size = v;
        }
        if let Some(v) = file.early_stopping {
            self.early_stopping = v;
        }
        if let Some(v) = file.min_length {
            self.min_length = v;
        }
        if let Some(v) = file.max_length {
            self.max_length = v;
        }
        if let Some(v) = file.decoder_start_token_id {
            self.decoder_start_token_id = v;
        }
        if let Some(v) = file.eos_token_id {
            self.eos_token_id = v;
        }
        if file.forced_bos_token_id.is_some() {
            self.forced_bos_token_id = file.forced_bos_token_id;
        }
        if file.forced_eos_token_id.is_some() {
            self.forced_eos_token_id = file.forced_eos_token_id;
        }
        self
    }

    /// Per-request copy carrying the caller's bounds.
    pub fn with_bounds(&self, bounds: &LengthBounds) -> Self {
        Self {
            min_length: bounds.min_length as usize,
            max_length: bounds.max_length as usize,
            ..self.clone()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerationConfigFile {
    pub num_beams: Option<usize>,
    pub length_penalty: Option<f32>,
    pub no_repeat_ngram_size: Option<usize>,
    pub early_stopping: Option<bool>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub decoder_start_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub forced_bos_token_id: Option<u32>,
    pub forced_eos_token_id: Option<u32>,
}

/// One incremental decoder step over all live beams.
pub trait StepDecoder {
    /// Log-probabilities over the vocabulary, one row per beam, for the token
    /// following `last_tokens`. `past_len` tokens per beam are already cached.
    fn step(&mut self, last_tokens: &[u32], past_len: usize) -> Result<Vec<Vec<f32>>>;

    /// Re-aligns per-beam caches: new beam `i` continues old beam `beam_idx[i]`.
    fn reorder(&mut self, beam_idx: &[u32]) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Beam {
    tokens: Vec<u32>,
    score: f32,
}

#[derive(Debug)]
struct Hypotheses {
    capacity: usize,
    length_penalty: f32,
    early_stopping: bool,
    items: Vec<(f32, Vec<u32>)>,
}

impl Hypotheses {
    fn new(capacity: usize, length_penalty: f32, early_stopping: bool) -> Self {
        Self {
            capacity,
            length_penalty,
            early_stopping,
            items: Vec::with_capacity(capacity + 1),
        }
    }

    fn normalized(&self, sum_logprobs: f32, len: usize) -> f32 {
        sum_logprobs / (len.max(1) as f32).powf(self.length_penalty)
    }

    fn worst(&self) -> f32 {
        self.items
            .iter()
            .map(|(s, _)| *s)
            .fold(f32::INFINITY, f32::min)
    }

    /// `generated_len` excludes the decoder start token. A hypothesis closed
    /// by EOS counts the EOS it was closed with.
    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32, generated_len: usize) {
        let score = self.normalized(sum_logprobs, generated_len);
        if self.items.len() < self.capacity || score > self.worst() {
            self.items.push((score, tokens));
            if self.items.len() > self.capacity {
                let worst_idx = self
                    .items
                    .iter()
                    .enumerate()
                    .min_by(|a, b| a.1 .0.partial_cmp(&b.1 .0).unwrap_or(Ordering::Equal))
                    .map(|(idx, _)| idx);
                if let Some(idx) = worst_idx {
                    self.items.swap_remove(idx);
                }
            }
        }
    }

    fn is_done(&self, best_running: f32, generated_len: usize) -> bool {
        if self.items.len() < self.capacity {
            return false;
        }
        if self.early_stopping {
            return true;
        }
        self.worst() >= self.normalized(best_running, generated_len)
    }

    fn best(self) -> Option<Vec<u32>> {
        self.items
            .into_iter()
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal))
            .map(|(_, tokens)| tokens)
    }
}

/// Masks applied to one beam's log-probabilities before ranking.
fn process_row(row: &mut [f32], history: &[u32], cur_len: usize, cfg: &GenerationConfig) {
    let eos = cfg.eos_token_id as usize;

    if cur_len < cfg.min_length && eos < row.len() {
        row[eos] = f32::NEG_INFINITY;
    }

    for banned in banned_ngram_tokens(history, cfg.no_repeat_ngram_size) {
        if let Some(slot) = row.get_mut(banned as usize) {
            *slot = f32::NEG_INFINITY;
        }
    }

    if cur_len == 1 {
        if let Some(bos) = cfg.forced_bos_token_id {
            force_token(row, bos);
        }
    }
    if cur_len + 1 == cfg.max_length {
        if let Some(forced_eos) = cfg.forced_eos_token_id {
            force_token(row, forced_eos);
        }
    }
}

fn force_token(row: &mut [f32], token: u32) {
    for (idx, slot) in row.iter_mut().enumerate() {
        *slot = if idx == token as usize { 0.0 } else { f32::NEG_INFINITY };
    }
}

/// Tokens that would complete an n-gram already present in `history`.
pub fn banned_ngram_tokens(history: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || history.len() + 1 < n {
        return Vec::new();
    }
    let prefix = &history[history.len() + 1 - n..];
    history
        .windows(n)
        .filter(|window| &window[..n - 1] == prefix)
        .map(|window| window[n - 1])
        .collect()
}

/// Beam search from the decoder start token. Returns the best sequence
/// without the start token or the closing end-of-sequence token.
pub fn beam_search<M: StepDecoder>(model: &mut M, cfg: &GenerationConfig) -> Result<Vec<u32>> {
    let num_beams = cfg.num_beams.max(1);
    if cfg.max_length < 2 {
        return Err(anyhow!("max_length must leave room for at least one token"));
    }

    // Only the first beam is live at the start so identical beams do not
    // crowd out the candidates.
    let mut beams: Vec<Beam> = (0..num_beams)
        .map(|idx| Beam {
            tokens: vec![cfg.decoder_start_token_id],
            score: if idx == 0 { 0.0 } else { -1e9 },
        })
        .collect();
    let mut finished = Hypotheses::new(num_beams, cfg.length_penalty, cfg.early_stopping);
    let mut cur_len = 1usize;

    while cur_len < cfg.max_length {
        let last: Vec<u32> = beams
            .iter()
            .map(|b| b.tokens.last().copied().unwrap_or(cfg.decoder_start_token_id))
            .collect();
        let mut rows = model.step(&last, cur_len - 1)?;
        if rows.len() != beams.len() {
            return Err(anyhow!(
                "decoder returned {} rows for {} beams",
                rows.len(),
                beams.len()
            ));
        }

        let mut candidates: Vec<(f32, usize, u32)> = Vec::new();
        for (beam_idx, row) in rows.iter_mut().enumerate() {
            process_row(row, &beams[beam_idx].tokens, cur_len, cfg);
            let base = beams[beam_idx].score;
            candidates.extend(
                row.iter()
                    .enumerate()
                    .filter(|(_, lp)| lp.is_finite())
                    .map(|(tok, lp)| (base + lp, beam_idx, tok as u32)),
            );
        }
        let keep = (2 * num_beams).min(candidates.len());
        if keep == 0 {
            break;
        }
        let by_score_desc =
            |a: &(f32, usize, u32), b: &(f32, usize, u32)| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal);
        if keep < candidates.len() {
            candidates.select_nth_unstable_by(keep - 1, by_score_desc);
            candidates.truncate(keep);
        }
        candidates.sort_by(by_score_desc);

        let mut next: Vec<Beam> = Vec::with_capacity(num_beams);
        let mut origin: Vec<u32> = Vec::with_capacity(num_beams);
        for (rank, (score, beam_idx, token)) in candidates.into_iter().enumerate() {
            if token == cfg.eos_token_id {
                if rank < num_beams {
                    let tokens = beams[beam_idx].tokens.clone();
                    let generated_len = tokens.len();
                    finished.add(tokens, score, generated_len);
                }
                continue;
            }
            let mut tokens = beams[beam_idx].tokens.clone();
            tokens.push(token);
            next.push(Beam { tokens, score });
            origin.push(beam_idx as u32);
            if next.len() == num_beams {
                break;
            }
        }

        cur_len += 1;
        if next.is_empty() {
            beams.clear();
            break;
        }
        let best_running = next.iter().map(|b| b.score).fold(f32::NEG_INFINITY, f32::max);
        if finished.is_done(best_running, cur_len - 1) {
            beams.clear();
            break;
        }

        // Pad with the strongest beam so the cache batch size never changes.
        while next.len() < num_beams {
            next.push(Beam {
                tokens: next[0].tokens.clone(),
                score: -1e9,
            });
            origin.push(origin[0]);
        }
        model.reorder(&origin)?;
        beams = next;
    }

    for beam in beams {
        if beam.score > -1e8 {
            let generated_len = beam.tokens.len() - 1;
            finished.add(beam.tokens, beam.score, generated_len);
        }
    }

    let best = finished
        .best()
        .ok_or_else(|| anyhow!("beam search produced no hypothesis"))?;
    Ok(best
        .into_iter()
        .skip(1)
        .filter(|&t| t != cfg.eos_token_id)
        .collect())
}
