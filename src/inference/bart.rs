//! BART encoder-decoder for conditional generation, laid out the way the
//! `BartForConditionalGeneration` checkpoints store their weights.

use candle::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, Activation, Embedding, LayerNorm, VarBuilder};
use candle_transformers::models::with_tracing::{linear, Linear};
use serde::Deserialize;

/// Learned positions are stored with two leading slots the model never uses.
const POSITION_OFFSET: usize = 2;

fn default_activation() -> Activation {
    Activation::Gelu
}

fn default_layer_norm_eps() -> f64 {
    1e-5
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub encoder_layers: usize,
    pub decoder_layers: usize,
    pub encoder_attention_heads: usize,
    pub decoder_attention_heads: usize,
    pub encoder_ffn_dim: usize,
    pub decoder_ffn_dim: usize,
    #[serde(default = "default_activation")]
    pub activation_function: Activation,
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub scale_embedding: bool,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    pub pad_token_id: u32,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    pub decoder_start_token_id: u32,
    #[serde(default)]
    pub forced_bos_token_id: Option<u32>,
    #[serde(default)]
    pub forced_eos_token_id: Option<u32>,
}

impl Config {
    fn embed_scale(&self) -> f64 {
        if self.scale_embedding {
            (self.d_model as f64).sqrt()
        } else {
            1.0
        }
    }
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
    is_decoder: bool,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn new(embed_dim: usize, num_heads: usize, is_decoder: bool, vb: VarBuilder) -> candle::Result<Self> {
        let head_dim = embed_dim / num_heads;
        Ok(Self {
            q_proj: linear(embed_dim, embed_dim, vb.pp("q_proj"))?,
            k_proj: linear(embed_dim, embed_dim, vb.pp("k_proj"))?,
            v_proj: linear(embed_dim, embed_dim, vb.pp("v_proj"))?,
            out_proj: linear(embed_dim, embed_dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
            is_decoder,
            kv_cache: None,
        })
    }

    fn split_heads(&self, xs: &Tensor, bsz: usize) -> candle::Result<Tensor> {
        xs.reshape((bsz, (), self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `kv_states` is the encoder output for cross-attention. Self-attention
    /// in the decoder appends to the cache; cross-attention projects the
    /// encoder output once and reuses it afterwards.
    fn forward(
        &mut self,
        xs: &Tensor,
        kv_states: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
    ) -> candle::Result<Tensor> {
        let (bsz, tgt_len, _) = xs.dims3()?;
        let query = (self.q_proj.forward(xs)? * self.scaling)?;
        let query = self.split_heads(&query, bsz)?;

        let (key, value) = match kv_states {
            None => {
                let key = self.split_heads(&self.k_proj.forward(xs)?, bsz)?;
                let value = self.split_heads(&self.v_proj.forward(xs)?, bsz)?;
                if self.is_decoder {
                    let (key, value) = match &self.kv_cache {
                        None => (key, value),
                        Some((prev_k, prev_v)) => (
                            Tensor::cat(&[prev_k, &key], 2)?,
                            Tensor::cat(&[prev_v, &value], 2)?,
                        ),
                    };
                    self.kv_cache = Some((key.clone(), value.clone()));
                    (key, value)
                } else {
                    (key, value)
                }
            }
            Some(kv_states) => match &self.kv_cache {
                Some((k, v)) => (k.clone(), v.clone()),
                None => {
                    let key = self.split_heads(&self.k_proj.forward(kv_states)?, bsz)?;
                    let value = self.split_heads(&self.v_proj.forward(kv_states)?, bsz)?;
                    self.kv_cache = Some((key.clone(), value.clone()));
                    (key, value)
                }
            },
        };

        let attn_weights = query.matmul(&key.transpose(2, 3)?.contiguous()?)?;
        let attn_weights = match attn_mask {
            None => attn_weights,
            Some(mask) => attn_weights.broadcast_add(mask)?,
        };
        let attn_probs = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_probs.matmul(&value)?;

        attn_output
            .transpose(1, 2)?
            .reshape((bsz, tgt_len, self.num_heads * self.head_dim))?
            .apply(&self.out_proj)
    }

    fn reset_kv_cache(&mut self) {
        self.kv_cache = None
    }

    fn reorder_kv_cache(&mut self, beam_idx: &Tensor) -> candle::Result<()> {
        if let Some((k, v)) = &self.kv_cache {
            self.kv_cache = Some((k.index_select(beam_idx, 0)?, v.index_select(beam_idx, 0)?));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    activation_fn: Activation,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
}

impl EncoderLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        let dim = cfg.d_model;
        Ok(Self {
            self_attn: Attention::new(dim, cfg.encoder_attention_heads, false, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(dim, cfg.layer_norm_eps, vb.pp("self_attn_layer_norm"))?,
            activation_fn: cfg.activation_function,
            fc1: linear(dim, cfg.encoder_ffn_dim, vb.pp("fc1"))?,
            fc2: linear(cfg.encoder_ffn_dim, dim, vb.pp("fc2"))?,
            final_layer_norm: layer_norm(dim, cfg.layer_norm_eps, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(&mut self, xs: &Tensor) -> candle::Result<Tensor> {
        let residual = xs;
        let xs = (self.self_attn.forward(xs, None, None)? + residual)?
            .apply(&self.self_attn_layer_norm)?;
        let residual = &xs;
        let ffn = xs
            .apply(&self.fc1)?
            .apply(&self.activation_fn)?
            .apply(&self.fc2)?;
        (ffn + residual)?.apply(&self.final_layer_norm)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    activation_fn: Activation,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        let dim = cfg.d_model;
        Ok(Self {
            self_attn: Attention::new(dim, cfg.decoder_attention_heads, true, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(dim, cfg.layer_norm_eps, vb.pp("self_attn_layer_norm"))?,
            activation_fn: cfg.activation_function,
            encoder_attn: Attention::new(dim, cfg.decoder_attention_heads, true, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: layer_norm(
                dim,
                cfg.layer_norm_eps,
                vb.pp("encoder_attn_layer_norm"),
            )?,
            fc1: linear(dim, cfg.decoder_ffn_dim, vb.pp("fc1"))?,
            fc2: linear(cfg.decoder_ffn_dim, dim, vb.pp("fc2"))?,
            final_layer_norm: layer_norm(dim, cfg.layer_norm_eps, vb.pp("final_layer_norm"))?,
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        encoder_xs: &Tensor,
        attn_mask: Option<&Tensor>,
    ) -> candle::Result<Tensor> {
        let residual = xs;
        let xs = (self.self_attn.forward(xs, None, attn_mask)? + residual)?
            .apply(&self.self_attn_layer_norm)?;
        let residual = &xs;
        let xs = (self.encoder_attn.forward(&xs, Some(encoder_xs), None)? + residual)?
            .apply(&self.encoder_attn_layer_norm)?;
        let residual = &xs;
        let ffn = xs
            .apply(&self.fc1)?
            .apply(&self.activation_fn)?
            .apply(&self.fc2)?;
        (ffn + residual)?.apply(&self.final_layer_norm)
    }

    fn reset_kv_cache(&mut self) {
        self.self_attn.reset_kv_cache();
        self.encoder_attn.reset_kv_cache();
    }

    fn reorder_kv_cache(&mut self, beam_idx: &Tensor) -> candle::Result<()> {
        self.self_attn.reorder_kv_cache(beam_idx)?;
        self.encoder_attn.reorder_kv_cache(beam_idx)
    }
}

#[derive(Debug, Clone)]
struct Encoder {
    embed_tokens: Embedding,
    embed_positions: Embedding,
    layernorm_embedding: LayerNorm,
    layers: Vec<EncoderLayer>,
    embed_scale: f64,
}

impl Encoder {
    fn new(cfg: &Config, embed_tokens: &Embedding, vb: VarBuilder) -> candle::Result<Self> {
        let embed_positions = embedding(
            cfg.max_position_embeddings + POSITION_OFFSET,
            cfg.d_model,
            vb.pp("embed_positions"),
        )?;
        let layernorm_embedding =
            layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("layernorm_embedding"))?;
        let vb_l = vb.pp("layers");
        let layers = (0..cfg.encoder_layers)
            .map(|idx| EncoderLayer::new(cfg, vb_l.pp(idx)))
            .collect::<candle::Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens: embed_tokens.clone(),
            embed_positions,
            layernorm_embedding,
            layers,
            embed_scale: cfg.embed_scale(),
        })
    }

    fn forward(&mut self, input_ids: &Tensor) -> candle::Result<Tensor> {
        let (_, seq_len) = input_ids.dims2()?;
        let xs = (self.embed_tokens.forward(input_ids)? * self.embed_scale)?;
        let positions = position_ids(0, seq_len, input_ids.device())?;
        let pos = self.embed_positions.forward(&positions)?;
        let mut xs = xs.broadcast_add(&pos)?.apply(&self.layernorm_embedding)?;
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }
}

#[derive(Debug, Clone)]
struct Decoder {
    embed_tokens: Embedding,
    embed_positions: Embedding,
    layernorm_embedding: LayerNorm,
    layers: Vec<DecoderLayer>,
    embed_scale: f64,
}

impl Decoder {
    fn new(cfg: &Config, embed_tokens: &Embedding, vb: VarBuilder) -> candle::Result<Self> {
        let embed_positions = embedding(
            cfg.max_position_embeddings + POSITION_OFFSET,
            cfg.d_model,
            vb.pp("embed_positions"),
        )?;
        let layernorm_embedding =
            layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("layernorm_embedding"))?;
        let vb_l = vb.pp("layers");
        let layers = (0..cfg.decoder_layers)
            .map(|idx| DecoderLayer::new(cfg, vb_l.pp(idx)))
            .collect::<candle::Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens: embed_tokens.clone(),
            embed_positions,
            layernorm_embedding,
            layers,
            embed_scale: cfg.embed_scale(),
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        encoder_xs: &Tensor,
        past_kv_len: usize,
    ) -> candle::Result<Tensor> {
        let (_, seq_len) = xs.dims2()?;
        let embeds = (self.embed_tokens.forward(xs)? * self.embed_scale)?;
        let positions = position_ids(past_kv_len, seq_len, xs.device())?;
        let pos = self.embed_positions.forward(&positions)?;
        let mut xs = embeds.broadcast_add(&pos)?.apply(&self.layernorm_embedding)?;

        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, past_kv_len, xs.device())?)
        } else {
            None
        };
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, encoder_xs, mask.as_ref())?;
        }
        Ok(xs)
    }

    fn reset_kv_cache(&mut self) {
        self.layers.iter_mut().for_each(|l| l.reset_kv_cache())
    }

    fn reorder_kv_cache(&mut self, beam_idx: &Tensor) -> candle::Result<()> {
        for layer in self.layers.iter_mut() {
            layer.reorder_kv_cache(beam_idx)?;
        }
        Ok(())
    }
}

/// Encoder, decoder and the tied LM head.
#[derive(Debug, Clone)]
pub struct BartForConditionalGeneration {
    encoder: Encoder,
    decoder: Decoder,
    lm_head: Tensor,
    final_logits_bias: Tensor,
}

impl BartForConditionalGeneration {
    /// Checkpoints exported from `BartForConditionalGeneration` prefix every
    /// tensor with `model.`; bare `BartModel` exports do not.
    pub fn load(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        let final_logits_bias = if vb.contains_tensor("final_logits_bias") {
            vb.get((1, cfg.vocab_size), "final_logits_bias")?
        } else {
            Tensor::zeros((1, cfg.vocab_size), vb.dtype(), vb.device())?
        };
        let vb_m = if vb.contains_tensor("model.shared.weight") {
            vb.pp("model")
        } else {
            vb
        };

        let shared = embedding(cfg.vocab_size, cfg.d_model, vb_m.pp("shared"))?;
        let encoder = Encoder::new(cfg, &shared, vb_m.pp("encoder"))?;
        let decoder = Decoder::new(cfg, &shared, vb_m.pp("decoder"))?;
        Ok(Self {
            encoder,
            decoder,
            lm_head: shared.embeddings().clone(),
            final_logits_bias,
        })
    }

    pub fn encode(&mut self, input_ids: &Tensor) -> candle::Result<Tensor> {
        self.encoder.forward(input_ids)
    }

    /// Logits for every decoder position, shape `(batch, seq, vocab)`.
    pub fn decode(
        &mut self,
        xs: &Tensor,
        encoder_xs: &Tensor,
        past_kv_len: usize,
    ) -> candle::Result<Tensor> {
        let hidden = self.decoder.forward(xs, encoder_xs, past_kv_len)?;
        let logits = hidden.broadcast_matmul(&self.lm_head.t()?)?;
        logits.broadcast_add(&self.final_logits_bias)
    }

    pub fn reset_kv_cache(&mut self) {
        self.decoder.reset_kv_cache()
    }

    /// Keeps decoder caches aligned with the surviving beams.
    pub fn reorder_kv_cache(&mut self, beam_idx: &Tensor) -> candle::Result<()> {
        self.decoder.reorder_kv_cache(beam_idx)
    }
}

fn position_ids(past_len: usize, seq_len: usize, device: &Device) -> candle::Result<Tensor> {
    let start = (past_len + POSITION_OFFSET) as u32;
    Tensor::arange(start, start + seq_len as u32, device)
}

fn causal_mask(seq_len: usize, past_len: usize, device: &Device) -> candle::Result<Tensor> {
    let total = seq_len + past_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| if j > i + past_len { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_slice(&mask, (seq_len, total), device)?
        .unsqueeze(0)?
        .unsqueeze(0)
}

/// Log-probabilities over the vocabulary for the last decoder position.
pub fn last_log_probs(logits: &Tensor) -> candle::Result<Tensor> {
    let seq_len = logits.dim(1)?;
    let last = logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
    candle_nn::ops::log_softmax(&last.to_dtype(DType::F32)?, D::Minus1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> Config {
        Config {
            vocab_size: 32,
            d_model: 8,
            encoder_layers: 1,
            decoder_layers: 2,
            encoder_attention_heads: 2,
            decoder_attention_heads: 2,
            encoder_ffn_dim: 16,
            decoder_ffn_dim: 16,
            activation_function: Activation::Gelu,
            max_position_embeddings: 16,
            scale_embedding: false,
            layer_norm_eps: 1e-5,
            pad_token_id: 1,
            bos_token_id: 0,
            eos_token_id: 2,
            decoder_start_token_id: 2,
            forced_bos_token_id: Some(0),
            forced_eos_token_id: Some(2),
        }
    }

    #[test]
    fn config_parses_hub_json() {
        let raw = r#"{
            "activation_function": "gelu",
            "d_model": 1024,
            "decoder_attention_heads": 16,
            "decoder_ffn_dim": 4096,
            "decoder_layers": 12,
            "decoder_start_token_id": 2,
            "encoder_attention_heads": 16,
            "encoder_ffn_dim": 4096,
            "encoder_layers": 12,
            "eos_token_id": 2,
            "bos_token_id": 0,
            "forced_bos_token_id": 0,
            "forced_eos_token_id": 2,
            "max_position_embeddings": 1024,
            "pad_token_id": 1,
            "scale_embedding": false,
            "vocab_size": 50264,
            "num_beams": 4
        }"#;
        let cfg: Config = serde_json::from_str(raw).expect("config should parse");
        assert_eq!(cfg.d_model, 1024);
        assert_eq!(cfg.forced_bos_token_id, Some(0));
        assert_eq!(cfg.embed_scale(), 1.0);
    }

    #[test]
    fn zero_weights_produce_expected_shapes() -> candle::Result<()> {
        let cfg = tiny_config();
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let mut model = BartForConditionalGeneration::load(&cfg, vb)?;

        let input = Tensor::new(&[[0u32, 5, 6, 7, 2]], &device)?;
        let encoded = model.encode(&input)?;
        assert_eq!(encoded.dims(), &[1, 5, 8]);

        let start = Tensor::new(&[[cfg.decoder_start_token_id]], &device)?;
        let logits = model.decode(&start, &encoded, 0)?;
        assert_eq!(logits.dims(), &[1, 1, 32]);

        let next = Tensor::new(&[[0u32]], &device)?;
        let logits = model.decode(&next, &encoded, 1)?;
        assert_eq!(logits.dims(), &[1, 1, 32]);

        let log_probs = last_log_probs(&logits)?;
        assert_eq!(log_probs.dims(), &[1, 32]);
        Ok(())
    }

    #[test]
    fn causal_mask_hides_future_positions() -> candle::Result<()> {
        let mask = causal_mask(3, 1, &Device::Cpu)?.squeeze(0)?.squeeze(0)?;
        let rows = mask.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![0.0, 0.0, f32::NEG_INFINITY, f32::NEG_INFINITY]);
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0, 0.0]);
        Ok(())
    }
}
