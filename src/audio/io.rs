//! Mono PCM buffer and WAV I/O.

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

use crate::error::DecodeError;

/// Mono samples in `[-1.0, 1.0]` at a fixed sample rate.
///
/// Reference clips go into [`Codec::encode`](crate::models::Codec::encode)
/// as this type and synthesized speech comes back out of `Codec::decode`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    /// Hz
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// `[samples]` or `[1, samples]` tensor, as codec decoders emit.
    pub fn from_tensor(tensor: &Tensor, sample_rate: u32) -> Result<Self> {
        let samples = tensor.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1()?;
        Ok(Self::new(samples, sample_rate))
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(self.samples.as_slice(), device)?)
    }

    /// Seconds.
    pub fn duration(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Join clips end to end. All clips must share one sample rate.
    pub fn concat(clips: &[AudioBuffer]) -> Result<Self> {
        let Some(first) = clips.first() else {
            bail!(DecodeError::InvalidInput("no clips to concatenate".into()));
        };
        let mut samples = Vec::with_capacity(clips.iter().map(AudioBuffer::len).sum());
        for clip in clips {
            if clip.sample_rate != first.sample_rate {
                bail!(DecodeError::InvalidInput(format!(
                    "sample rate mismatch: {} Hz vs {} Hz",
                    clip.sample_rate, first.sample_rate
                )));
            }
            samples.extend_from_slice(&clip.samples);
        }
        Ok(Self::new(samples, first.sample_rate))
    }

    /// Scale so the loudest sample sits at ±1. Silence is left alone.
    pub fn normalize(&mut self) {
        let peak = self.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        if peak > 0.0 {
            self.samples.iter_mut().for_each(|s| *s /= peak);
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_wav(path, &self.samples, self.sample_rate)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_wav(path)
    }
}

/// Read a WAV file, mixing multi-channel audio down to mono.
pub fn load_wav(path: impl AsRef<Path>) -> Result<AudioBuffer> {
    let path = path.as_ref();
    let reader = WavReader::open(path)
        .with_context(|| format!("Failed to open WAV file: {}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader.into_samples::<f32>().collect::<Result<_, _>>()?,
        SampleFormat::Int => {
            let full_scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<Result<_, _>>()?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    tracing::debug!(
        path = %path.display(),
        sample_rate = spec.sample_rate,
        channels,
        "loaded reference audio"
    );
    Ok(AudioBuffer::new(samples, spec.sample_rate))
}

/// Write 16-bit mono PCM. Samples outside `[-1, 1]` are clipped.
pub fn save_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create WAV file: {}", path.display()))?;
    for &sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_duration() {
        let clip = AudioBuffer::new(vec![0.0; 36_000], 24_000);
        assert!((clip.duration() - 1.5).abs() < 1e-6);
        assert_eq!(AudioBuffer::new(vec![0.0; 10], 0).duration(), 0.0);
    }

    #[test]
    fn test_concat() {
        let a = AudioBuffer::new(vec![0.1, 0.2], 24_000);
        let b = AudioBuffer::new(vec![0.3], 24_000);
        let joined = AudioBuffer::concat(&[a.clone(), b]).unwrap();
        assert_eq!(joined.samples, vec![0.1, 0.2, 0.3]);

        let other_rate = AudioBuffer::new(vec![0.3], 16_000);
        assert!(AudioBuffer::concat(&[a, other_rate]).is_err());
        assert!(AudioBuffer::concat(&[]).is_err());
    }

    #[test]
    fn test_normalize() {
        let mut clip = AudioBuffer::new(vec![0.25, -0.5], 24_000);
        clip.normalize();
        assert_eq!(clip.samples, vec![0.5, -1.0]);

        let mut silence = AudioBuffer::new(vec![0.0; 3], 24_000);
        silence.normalize();
        assert!(silence.samples.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_tensor_round_trip() {
        let device = Device::Cpu;
        let tensor = Tensor::new(&[[0.1f32, -0.2, 0.3]], &device).unwrap();
        let clip = AudioBuffer::from_tensor(&tensor, 24_000).unwrap();
        assert_eq!(clip.len(), 3);
        assert_eq!(clip.to_tensor(&device).unwrap().dims(), &[3]);
    }

    #[test]
    fn test_wav_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        let clip = AudioBuffer::new(vec![0.0, 0.5, -0.5, 1.5], 24_000);
        clip.save(&path).unwrap();

        let loaded = AudioBuffer::load(&path).unwrap();
        assert_eq!(loaded.sample_rate, 24_000);
        assert_eq!(loaded.len(), 4);
        assert!((loaded.samples[1] - 0.5).abs() < 1e-3);
        // clipped on write
        assert!((loaded.samples[3] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_stereo_mixdown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 16_000,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for s in [0.2f32, 0.4, -1.0, 0.0] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let loaded = load_wav(&path).unwrap();
        assert_eq!(loaded.samples.len(), 2);
        assert!((loaded.samples[0] - 0.3).abs() < 1e-6);
        assert!((loaded.samples[1] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_missing_file() {
        assert!(load_wav("/nonexistent/clip.wav").is_err());
    }
}
