//! # valle
//!
//! Decode and training-target control flow for VALL-E style text-to-speech
//! models that predict residual-vector-quantized (RVQ) codec tokens.
//!
//! The neural pieces stay outside the crate and plug in through traits in
//! [`models`]: the transformer ([`SequenceModel`]), the audio codec
//! ([`Codec`]) and the phonemizer ([`TextFrontEnd`]). What lives here is
//! everything around them:
//!
//! - **Sampling** ([`generation`]): temperature, top-k/top-p, repetition,
//!   length and DRY penalties, mirostat, beam search and classifier-free
//!   guidance, all driven by one seeded [`SamplingContext`]
//! - **Decode loops** ([`inference`]): AR level 0, parallel NAR level
//!   filling, iterative masked denoising and output-length prediction,
//!   selected explicitly through [`DecodeMode`]
//! - **Training targets** ([`training`]): per-item RVQ level, timestep,
//!   token dropout and conditioning drops for one training step
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use valle::{SymbolTokenizer, SynthesisOptions, Valle, AudioBuffer};
//!
//! let front_end = SymbolTokenizer::from_file("symmap.json")?;
//! let mut tts = Valle::new(model, codec, front_end);
//!
//! let reference = AudioBuffer::load("speaker.wav")?;
//! let options = SynthesisOptions {
//!     input_prompt_length: 3.0,
//!     seed: Some(42),
//!     ..Default::default()
//! };
//! let audio = tts.synthesize("həloʊ wɜːld", "en", &[reference], Some(options))?;
//! audio.save("output.wav")?;
//! ```
//!
//! ## Decode plans
//!
//! Models trained for `ar` + `nar` decode level 0 autoregressively and then
//! fill the remaining levels in parallel. Models trained for `len` + `nar`
//! (and no `ar`) first predict the output length, then denoise a fully masked
//! canvas of that length. A model with all three uses the AR plan unless
//! [`SynthesisOptions::prefer_masked`] is set.

pub mod audio;
pub mod data;
pub mod error;
pub mod generation;
pub mod inference;
pub mod logging;
pub mod models;
pub mod tokenizer;
pub mod training;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub use audio::AudioBuffer;
pub use data::{BatchItem, Codes, Prompt, Task};
pub use error::DecodeError;
pub use generation::{CfgGuidance, SamplingContext, SamplingPolicy};
pub use inference::{
    decode, DecodeMode, DecodeOutput, LengthOptions, MaskedOptions, NoProgress, Progress,
};
pub use models::{Capability, Codec, ModelConfig, SequenceModel, TextFrontEnd};
pub use tokenizer::SymbolTokenizer;
pub use training::{build_targets, TrainingBatch, TrainingPolicy};

use inference::{ArOptions, NarOptions};

/// Options for one [`Valle::synthesize`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SynthesisOptions {
    /// Level-0 AR sampling
    pub ar: SamplingPolicy,
    /// NAR level sampling
    pub nar: SamplingPolicy,
    /// Guidance for the AR and NAR loops
    pub guidance: CfgGuidance,
    pub masked: MaskedOptions,
    pub length: LengthOptions,
    /// Upper bound on AR tokens
    pub max_ar_steps: usize,
    /// RVQ levels the NAR adds on top of level 0
    pub max_nar_levels: usize,
    /// Seconds of reference audio to keep; `0` keeps everything
    pub input_prompt_length: f64,
    /// Random seed for reproducibility
    pub seed: Option<u64>,
    /// Use length + masked decoding even when the model can run AR
    pub prefer_masked: bool,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            ar: SamplingPolicy::default().with_temperature(0.95),
            nar: SamplingPolicy::default().with_temperature(0.5),
            guidance: CfgGuidance::default(),
            masked: MaskedOptions::default(),
            length: LengthOptions::default(),
            max_ar_steps: 6 * 75,
            max_nar_levels: 7,
            input_prompt_length: 0.0,
            seed: None,
            prefer_masked: false,
        }
    }
}

impl SynthesisOptions {
    fn ar_mode(&self) -> DecodeMode {
        DecodeMode::Ar(ArOptions {
            max_steps: self.max_ar_steps,
            sampling: self.ar.clone(),
            guidance: self.guidance,
        })
    }

    fn nar_mode(&self) -> DecodeMode {
        DecodeMode::Nar(NarOptions {
            max_levels: Some(self.max_nar_levels),
            sampling: self.nar.clone(),
            guidance: self.guidance,
        })
    }
}

/// Which loops [`Valle`] chains for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePlan {
    /// AR level 0, then NAR levels when the model has them
    ArNar,
    /// Length prediction, then masked denoising
    LengthMasked,
}

/// Text + reference audio in, speech out.
///
/// Holds the three collaborators and wires the decode loops between them.
pub struct Valle<M, C, F> {
    model: M,
    codec: C,
    front_end: F,
}

impl<M, C, F> Valle<M, C, F>
where
    M: SequenceModel,
    C: Codec,
    F: TextFrontEnd,
{
    pub fn new(model: M, codec: C, front_end: F) -> Self {
        Self {
            model,
            codec,
            front_end,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn into_parts(self) -> (M, C, F) {
        (self.model, self.codec, self.front_end)
    }

    /// Pick the loops for this model and request.
    pub fn plan(&self, options: &SynthesisOptions) -> Result<DecodePlan> {
        let model = &self.model;
        let masked_capable = model.supports(Capability::Len) && model.supports(Capability::Nar);
        if masked_capable && (options.prefer_masked || !model.supports(Capability::Ar)) {
            return Ok(DecodePlan::LengthMasked);
        }
        if model.supports(Capability::Ar) {
            return Ok(DecodePlan::ArNar);
        }
        let missing = if model.supports(Capability::Nar) {
            Capability::Len
        } else {
            Capability::Ar
        };
        Err(DecodeError::MissingCapability(missing).into())
    }

    /// Reference clips → prompt codes, trimmed to `input_prompt_length`
    /// seconds and to the model's level count.
    pub fn encode_prompt(&self, reference_audio: &[AudioBuffer], input_prompt_length: f64) -> Result<Prompt> {
        if reference_audio.is_empty() {
            return Ok(Prompt::Absent);
        }
        let audio = AudioBuffer::concat(reference_audio)?;
        let mut codes = self.codec.encode(&audio)?;
        if input_prompt_length > 0.0 {
            let frames = (input_prompt_length * self.codec.frame_rate() as f64).round() as usize;
            codes.truncate(frames);
        }
        let codes = codes.truncate_levels(self.model.config().n_resp_levels);
        tracing::debug!(
            frames = codes.len(),
            levels = codes.levels(),
            "encoded reference prompt"
        );
        Ok(Prompt::Single(codes))
    }

    /// Run the decode plan and return the finished token matrix.
    pub fn generate_codes(
        &mut self,
        text: &str,
        language: &str,
        reference_audio: &[AudioBuffer],
        options: &SynthesisOptions,
        progress: &mut dyn Progress,
    ) -> Result<Codes> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("generate_codes").entered();

        let plan = self.plan(options)?;
        let mut ctx = SamplingContext::new(options.seed);
        let phonemes = self.front_end.encode(text, language)?;
        let prompt = self.encode_prompt(reference_audio, options.input_prompt_length)?;
        let item = BatchItem::tts(phonemes, prompt);
        tracing::info!(
            ?plan,
            model = %self.model.config().label(),
            prompt_frames = item.prompt.len(),
            "generating codes"
        );

        match plan {
            DecodePlan::ArNar => {
                let batch = [item];
                let level0 = decode(&mut self.model, &batch, &options.ar_mode(), &mut ctx, progress)?
                    .into_sequences()?
                    .remove(0);
                let [item] = batch;
                if !self.model.supports(Capability::Nar) || options.max_nar_levels == 0 {
                    return Ok(level0);
                }
                if level0.is_empty() {
                    tracing::warn!("AR produced no frames, skipping NAR");
                    return Ok(level0);
                }
                let batch = [item.with_response(level0)];
                Ok(decode(&mut self.model, &batch, &options.nar_mode(), &mut ctx, progress)?
                    .into_sequences()?
                    .remove(0))
            }
            DecodePlan::LengthMasked => {
                let batch = [item];
                let length_mode = DecodeMode::Length(options.length.clone());
                let len = decode(&mut self.model, &batch, &length_mode, &mut ctx, progress)?
                    .into_lengths()?
                    .remove(0);
                let [item] = batch;
                let batch = [item.with_target_len(len)];
                let masked_mode = DecodeMode::Masked(options.masked.clone());
                Ok(decode(&mut self.model, &batch, &masked_mode, &mut ctx, progress)?
                    .into_sequences()?
                    .remove(0))
            }
        }
    }

    /// Synthesize `text` (already phonemizable by the front-end) in the
    /// voice of `reference_audio`.
    pub fn synthesize(
        &mut self,
        text: &str,
        language: &str,
        reference_audio: &[AudioBuffer],
        options: Option<SynthesisOptions>,
    ) -> Result<AudioBuffer> {
        let options = options.unwrap_or_default();
        let start = Instant::now();
        let codes = self.generate_codes(text, language, reference_audio, &options, &mut NoProgress)?;
        let gen_ms = start.elapsed().as_secs_f64() * 1000.0;

        let audio = self.codec.decode(&codes)?;
        tracing::info!(
            frames = codes.len(),
            levels = codes.levels(),
            generate_ms = gen_ms,
            audio_secs = audio.duration(),
            "synthesis done"
        );
        Ok(audio)
    }
}
