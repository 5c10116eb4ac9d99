//! Autoregressive decode of RVQ level 0 (or whole frames, or text).

use anyhow::{bail, Result};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::progress::{stage, Progress};
use super::{check_batch, prune_at, stop_token_for, tail_rows};
use crate::data::{BatchItem, Codes, TextField};
use crate::error::DecodeError;
use crate::generation::sampling::{apply_length_penalty, logits_rows, sample_row};
use crate::generation::{
    fuse_output, sample_mirostat, BeamState, CfgGuidance, MirostatState, SamplingContext,
    SamplingPolicy, Strategy,
};
use crate::models::{ModelInput, SequenceModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArOptions {
    /// Upper bound on emitted tokens per item
    pub max_steps: usize,
    pub sampling: SamplingPolicy,
    pub guidance: CfgGuidance,
}

impl Default for ArOptions {
    fn default() -> Self {
        Self {
            max_steps: 500,
            sampling: SamplingPolicy::default(),
            guidance: CfgGuidance::default(),
        }
    }
}

/// Per-item AR results.
#[derive(Debug, Clone, PartialEq)]
pub struct ArOutput {
    /// Sequences truncated before their first stop token
    pub sequences: Vec<Codes>,
    /// Rows emitted before pruning
    pub unpruned_lens: Vec<usize>,
    /// Whether each item produced a stop token
    pub stopped: Vec<bool>,
}

/// One model row: the item it belongs to and the tokens decoded so far.
struct Row {
    item: usize,
    frames: Vec<Vec<u32>>,
}

impl Row {
    fn level(&self, level: usize) -> Vec<u32> {
        self.frames.iter().filter_map(|f| f.get(level).copied()).collect()
    }

    fn codes(&self, width: usize) -> Result<Codes> {
        if self.frames.is_empty() {
            return Ok(Codes::empty(width));
        }
        Codes::from_frames(&self.frames)
    }
}

fn row_input(base: &ModelInput, row: &Row, width: usize) -> Result<ModelInput> {
    let mut input = base.clone();
    match base.task.text_output_field() {
        Some(TextField::Phonemes) => input.phonemes = Some(row.level(0)),
        Some(TextField::Text) => input.text = Some(row.level(0)),
        None => input.response = Some(row.codes(width)?),
    }
    Ok(input)
}

/// Sample one frame of `levels` for row `r` at `offset` from the end. Level 0
/// is taken from `first` when a stateful sampler already chose it.
fn sample_frame(
    levels: &[Tensor],
    row: &Row,
    offset: usize,
    stop: u32,
    first: Option<u32>,
    policy: &SamplingPolicy,
    ctx: &mut SamplingContext,
) -> Result<Vec<u32>> {
    let mut frame = Vec::with_capacity(levels.len());
    for (level, tensor) in levels.iter().enumerate() {
        if level == 0 {
            if let Some(token) = first {
                frame.push(token);
                continue;
            }
        }
        let mut scores = nth_last_row(tensor, offset)?;
        if level == 0 {
            apply_length_penalty(&mut scores, stop, row.frames.len() + 1, policy.length_penalty);
        }
        let history = row.level(level);
        let (token, _) = sample_row(scores, &history, policy, ctx)?;
        frame.push(token);
    }
    Ok(frame)
}

/// Decode `batch` token by token until every item stops or `max_steps`
/// tokens have been emitted.
pub fn decode_ar<M: SequenceModel>(
    model: &mut M,
    batch: &[BatchItem],
    opts: &ArOptions,
    ctx: &mut SamplingContext,
    progress: &mut dyn Progress,
) -> Result<ArOutput> {
    check_batch(batch)?;
    let policy = &opts.sampling;
    policy.validate()?;
    let config = model.config().clone();
    let causal = config.causal_size.max(1);
    let iterations = opts.max_steps / causal;
    let strategy = policy.strategy();
    // mirostat steers level 0 only; finer levels of a frame sample plainly
    let finer = SamplingPolicy {
        mirostat_tau: 0.0,
        ..policy.clone()
    };
    if strategy == Strategy::Beam && causal > 1 {
        bail!(DecodeError::PolicyConflict(
            "beam search needs a causal size of 1".into()
        ));
    }

    let bases: Vec<ModelInput> = batch.iter().map(|item| ModelInput::from_item(item, 0)).collect();
    let stops: Vec<u32> = batch.iter().map(|item| stop_token_for(item.task, &config)).collect();

    let mut beams = match strategy {
        Strategy::Beam => Some(BeamState::new(batch.len(), policy.beam_width)?),
        _ => None,
    };
    let mut mirostat: Option<Vec<MirostatState>> = (strategy == Strategy::Mirostat).then(|| {
        vec![MirostatState::new(policy.mirostat_tau, policy.mirostat_eta); batch.len()]
    });

    let fanout = beams.as_ref().map_or(1, BeamState::width);
    let mut rows: Vec<Row> = (0..batch.len() * fanout)
        .map(|r| Row {
            item: r / fanout,
            frames: Vec::new(),
        })
        .collect();
    let mut stopped = vec![false; rows.len()];
    let mut width = 1usize;
    let mut state: Option<M::State> = None;
    let mut null_state: Option<M::State> = None;

    tracing::info!(
        items = batch.len(),
        rows = rows.len(),
        iterations,
        ?strategy,
        cfg = opts.guidance.strength,
        "AR decode"
    );
    model.enable_adapter(Some(0))?;

    #[cfg(feature = "profiling")]
    let _loop_span = tracing::info_span!("ar_loop").entered();

    for step in 0..iterations {
        if !progress.step(stage::AR, step, iterations) {
            model.enable_adapter(None)?;
            return Err(DecodeError::Cancelled.into());
        }

        let inputs: Vec<ModelInput> = rows
            .iter()
            .map(|row| row_input(&bases[row.item], row, width))
            .collect::<Result<_>>()?;
        let output = model.forward(&inputs, state.take())?;
        state = output.state;
        let mut logits = output.logits;
        if logits.len() != rows.len() {
            bail!("model returned {} items for {} rows", logits.len(), rows.len());
        }

        if opts.guidance.is_enabled() {
            let null_inputs: Vec<ModelInput> = inputs
                .iter()
                .map(|input| input.unconditional(config.text_bos, config.text_eos))
                .collect();
            let null_output = model.forward(&null_inputs, null_state.take())?;
            null_state = null_output.state;
            let lens = vec![causal; rows.len()];
            logits = fuse_output(&logits, &null_output.logits, opts.guidance, &lens)?;
        }

        width = logits.first().map_or(1, Vec::len).max(1);
        if let Some(beams) = beams.as_mut() {
            if width > 1 {
                model.enable_adapter(None)?;
                bail!(DecodeError::PolicyConflict(format!(
                    "beam search ranks single tokens, the model emits {width} levels per frame"
                )));
            }
            let last = last_rows(&logits, 0)?;
            let result = beams.step(&last, &stops, policy)?;
            for (r, row) in rows.iter_mut().enumerate() {
                let hyp = beams.row(r);
                row.frames = hyp.tokens.iter().map(|&t| vec![t]).collect();
                stopped[r] = hyp.finished;
            }
            if let Some(carried) = state.take() {
                state = model.reorder_state(carried, &result.parents)?;
            }
            if let Some(carried) = null_state.take() {
                null_state = model.reorder_state(carried, &result.parents)?;
            }
        } else {
            for pos in 0..causal {
                let offset = causal - 1 - pos;
                if let Some(states) = mirostat.take() {
                    let level0 = last_rows_at(&logits, 0, offset)?;
                    let next = sample_mirostat(&level0, states, policy.temperature, ctx)?;
                    for (r, st) in next.iter().enumerate() {
                        if stopped[r] {
                            continue;
                        }
                        let token = st.token.ok_or(DecodeError::NoCandidates)?;
                        let stop = stops[rows[r].item];
                        let frame =
                            sample_frame(&logits[r], &rows[r], offset, stop, Some(token), &finer, ctx)?;
                        stopped[r] = frame.contains(&stop);
                        rows[r].frames.push(frame);
                    }
                    mirostat = Some(next);
                    continue;
                }

                for (r, row) in rows.iter_mut().enumerate() {
                    if stopped[r] {
                        continue;
                    }
                    let stop = stops[row.item];
                    let frame = sample_frame(&logits[r], row, offset, stop, None, policy, ctx)?;
                    tracing::trace!(row = r, ?frame, "AR token");
                    stopped[r] = frame.contains(&stop);
                    row.frames.push(frame);
                }
            }
        }

        if stopped.iter().all(|s| *s) {
            tracing::debug!(step, "all items stopped");
            break;
        }
    }
    progress.finish(stage::AR);
    model.enable_adapter(None)?;

    let winners: Vec<Row> = match beams {
        Some(beams) => beams
            .best(policy.length_penalty)
            .into_iter()
            .enumerate()
            .map(|(item, hyp)| Row {
                item,
                frames: hyp.tokens.iter().map(|&t| vec![t]).collect(),
            })
            .collect(),
        None => rows,
    };

    let mut out = ArOutput {
        sequences: Vec::with_capacity(batch.len()),
        unpruned_lens: Vec::with_capacity(batch.len()),
        stopped: Vec::with_capacity(batch.len()),
    };
    for row in winners {
        let codes = row.codes(width)?;
        let stop = stops[row.item];
        out.unpruned_lens.push(codes.len());
        let (codes, found) = prune_at(codes, stop);
        if !found {
            tracing::warn!(item = row.item, len = codes.len(), "AR decode ended without a stop token");
        }
        out.stopped.push(found);
        out.sequences.push(codes);
    }
    Ok(out)
}

fn nth_last_row(tensor: &Tensor, offset: usize) -> Result<Vec<f32>> {
    let rows = tensor.dim(0)?;
    if offset >= rows {
        bail!("logits have {rows} rows, need at least {}", offset + 1);
    }
    let row = tail_rows(tensor, offset + 1)?.narrow(0, 0, 1)?;
    Ok(logits_rows(&row)?.remove(0))
}

fn last_rows_at(logits: &[Vec<Tensor>], level: usize, offset: usize) -> Result<Vec<Vec<f32>>> {
    logits
        .iter()
        .map(|levels| match levels.get(level) {
            Some(t) => nth_last_row(t, offset),
            None => bail!("model returned no logits for level {level}"),
        })
        .collect()
}

fn last_rows(logits: &[Vec<Tensor>], level: usize) -> Result<Vec<Vec<f32>>> {
    last_rows_at(logits, level, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Task;
    use crate::inference::progress::NoProgress;
    use crate::models::{ModelConfig, ModelOutput};
    use candle_core::Device;
    use std::cell::RefCell;

    /// Emits `script[step]` for every row, then the stop token. Levels past
    /// the first, when `levels > 1`, always predict their own index.
    struct Scripted {
        config: ModelConfig,
        script: Vec<u32>,
        levels: usize,
        adapters: RefCell<Vec<Option<usize>>>,
    }

    impl Scripted {
        fn new(script: Vec<u32>) -> Self {
            Self {
                config: ModelConfig {
                    n_audio_tokens: 8,
                    stop_token: 8,
                    mask_token: 9,
                    ..Default::default()
                },
                script,
                levels: 1,
                adapters: RefCell::new(Vec::new()),
            }
        }

        fn full_frames(script: Vec<u32>, levels: usize) -> Self {
            Self {
                levels,
                ..Self::new(script)
            }
        }
    }

    fn one_hot(token: u32, classes: usize, rows: usize) -> Tensor {
        let mut data = vec![0f32; classes * rows];
        for r in 0..rows {
            data[r * classes + token as usize] = 10.0;
        }
        Tensor::from_vec(data, (rows, classes), &Device::Cpu).unwrap()
    }

    impl SequenceModel for Scripted {
        type State = usize;

        fn config(&self) -> &ModelConfig {
            &self.config
        }

        fn forward(&self, inputs: &[ModelInput], state: Option<usize>) -> Result<ModelOutput<usize>> {
            let step = inputs[0].response.as_ref().map_or(0, Codes::len);
            let token = self.script.get(step).copied().unwrap_or(self.config.stop_token);
            let logits = inputs
                .iter()
                .map(|_| {
                    (0..self.levels)
                        .map(|l| match l {
                            0 => one_hot(token, 10, step + 1),
                            l => one_hot(l as u32, 10, step + 1),
                        })
                        .collect()
                })
                .collect();
            Ok(ModelOutput {
                logits,
                state: Some(state.unwrap_or(0) + 1),
            })
        }

        fn enable_adapter(&mut self, level: Option<usize>) -> Result<()> {
            self.adapters.borrow_mut().push(level);
            Ok(())
        }
    }

    fn item() -> BatchItem {
        BatchItem::tts(vec![1, 5, 6, 2], Codes::filled(4, 8, 3))
    }

    #[test]
    fn test_stops_and_prunes() {
        let mut model = Scripted::new(vec![4, 5]);
        let mut ctx = SamplingContext::new(Some(0));
        let opts = ArOptions {
            max_steps: 10,
            sampling: SamplingPolicy::greedy(),
            ..Default::default()
        };
        let out = decode_ar(&mut model, &[item(), item()], &opts, &mut ctx, &mut NoProgress).unwrap();
        assert_eq!(out.unpruned_lens, vec![3, 3]);
        assert_eq!(out.sequences[0].level(0), vec![4, 5]);
        assert_eq!(out.stopped, vec![true, true]);
    }

    #[test]
    fn test_max_steps_without_stop() {
        let mut model = Scripted::new(vec![1; 100]);
        let mut ctx = SamplingContext::new(Some(0));
        let opts = ArOptions {
            max_steps: 6,
            sampling: SamplingPolicy::greedy(),
            ..Default::default()
        };
        let out = decode_ar(&mut model, &[item()], &opts, &mut ctx, &mut NoProgress).unwrap();
        assert_eq!(out.sequences[0].len(), 6);
        assert_eq!(out.stopped, vec![false]);
    }

    #[test]
    fn test_cancellation() {
        let mut model = Scripted::new(vec![1; 100]);
        let mut ctx = SamplingContext::new(Some(0));
        let mut cancel = |_: &str, step: usize, _: usize| step < 2;
        let err = decode_ar(&mut model, &[item()], &ArOptions::default(), &mut ctx, &mut cancel)
            .unwrap_err();
        assert_eq!(err.downcast_ref::<DecodeError>(), Some(&DecodeError::Cancelled));
        assert_eq!(*model.adapters.borrow(), vec![Some(0), None]);
    }

    #[test]
    fn test_beam_search_returns_one_sequence_per_item() {
        let mut model = Scripted::new(vec![2, 3, 4]);
        let mut ctx = SamplingContext::new(Some(0));
        let opts = ArOptions {
            max_steps: 10,
            sampling: SamplingPolicy {
                beam_width: 3,
                temperature: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let out = decode_ar(&mut model, &[item()], &opts, &mut ctx, &mut NoProgress).unwrap();
        assert_eq!(out.sequences.len(), 1);
        assert_eq!(out.sequences[0].level(0), vec![2, 3, 4]);
    }

    #[test]
    fn test_mirostat_follows_confident_script() {
        let mut model = Scripted::new(vec![6, 6]);
        let mut ctx = SamplingContext::new(Some(0));
        let opts = ArOptions {
            max_steps: 10,
            sampling: SamplingPolicy {
                mirostat_tau: 3.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let out = decode_ar(&mut model, &[item()], &opts, &mut ctx, &mut NoProgress).unwrap();
        assert!(out.sequences[0].len() <= 10);
    }

    #[test]
    fn test_text_task_writes_phonemes() {
        struct Echo(ModelConfig);
        impl SequenceModel for Echo {
            type State = ();
            fn config(&self) -> &ModelConfig {
                &self.0
            }
            fn forward(&self, inputs: &[ModelInput], _: Option<()>) -> Result<ModelOutput<()>> {
                // emit 7 until the phoneme field holds two tokens, then eos
                let logits = inputs
                    .iter()
                    .map(|input| {
                        let n = input.phonemes.as_ref().map_or(0, Vec::len);
                        let token = if n < 2 { 7 } else { self.0.text_eos };
                        vec![one_hot(token, 10, 1)]
                    })
                    .collect();
                Ok(ModelOutput { logits, state: None })
            }
        }
        let mut model = Echo(ModelConfig::default());
        let mut ctx = SamplingContext::new(Some(0));
        let stt = BatchItem::new(Task::SpeechToText).with_response(Codes::filled(5, 8, 1));
        let opts = ArOptions {
            max_steps: 10,
            sampling: SamplingPolicy::greedy(),
            ..Default::default()
        };
        let out = decode_ar(&mut model, &[stt], &opts, &mut ctx, &mut NoProgress).unwrap();
        assert_eq!(out.sequences[0].level(0), vec![7, 7]);
        assert_eq!(out.unpruned_lens, vec![3]);
    }

    #[test]
    fn test_full_frames_keep_every_level() {
        let mut model = Scripted::full_frames(vec![4, 5], 3);
        let mut ctx = SamplingContext::new(Some(0));
        let opts = ArOptions {
            max_steps: 10,
            sampling: SamplingPolicy::greedy(),
            ..Default::default()
        };
        let out = decode_ar(&mut model, &[item()], &opts, &mut ctx, &mut NoProgress).unwrap();
        let codes = &out.sequences[0];
        assert_eq!(codes.levels(), 3);
        assert_eq!(codes.to_frames(), vec![vec![4, 1, 2], vec![5, 1, 2]]);
        assert_eq!(out.unpruned_lens, vec![3]);
    }

    #[test]
    fn test_mirostat_fills_finer_levels() {
        let mut model = Scripted::full_frames(vec![6, 6], 2);
        let mut ctx = SamplingContext::new(Some(0));
        let opts = ArOptions {
            max_steps: 10,
            sampling: SamplingPolicy {
                mirostat_tau: 3.0,
                top_k: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let out = decode_ar(&mut model, &[item()], &opts, &mut ctx, &mut NoProgress).unwrap();
        let codes = &out.sequences[0];
        assert_eq!(codes.levels(), 2);
        assert!(codes.level(1).iter().all(|&t| t == 1));
    }

    #[test]
    fn test_beam_rejects_full_frames() {
        let mut model = Scripted::full_frames(vec![2, 3], 2);
        let mut ctx = SamplingContext::new(Some(0));
        let opts = ArOptions {
            max_steps: 10,
            sampling: SamplingPolicy {
                beam_width: 2,
                temperature: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = decode_ar(&mut model, &[item()], &opts, &mut ctx, &mut NoProgress).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::PolicyConflict(_))
        ));
        assert_eq!(model.adapters.borrow().last(), Some(&None));
    }

    #[test]
    fn test_ragged_frames_surface_an_error() {
        let row = Row {
            item: 0,
            frames: vec![vec![1, 2], vec![3]],
        };
        assert!(row.codes(2).is_err());
        let empty = Row {
            item: 0,
            frames: Vec::new(),
        };
        assert_eq!(empty.codes(2).unwrap().levels(), 2);
    }
}
