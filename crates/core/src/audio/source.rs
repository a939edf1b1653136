use std::{path::Path, time::Duration};

use crate::{Result, VisualiserError};

/// Fully decoded audio held in memory as interleaved `f32` samples.
#[derive(Debug, Clone)]
pub struct AudioSource {
    samples: Vec<f32>,
    channels: u16,
    sample_rate: u32,
}

impl AudioSource {
    pub fn from_samples(samples: Vec<f32>, channels: u16, sample_rate: u32) -> Result<Self> {
        if channels == 0 || sample_rate == 0 {
            return Err(VisualiserError::EngineInit(format!(
                "unsupported stream layout: {channels} channel(s) at {sample_rate} Hz"
            )));
        }
        if samples.len() % channels as usize != 0 {
            return Err(VisualiserError::InvalidInput(
                "sample count is not a multiple of the channel count",
            ));
        }
        Ok(Self {
            samples,
            channels,
            sample_rate,
        })
    }

    /// Decodes a WAV file. Integer formats are scaled into [-1, 1].
    pub fn from_wav(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|sample| sample.map(|value| value as f32 * scale))
                    .collect::<std::result::Result<_, _>>()?
            }
        };

        tracing::info!(
            path = %path.display(),
            channels = spec.channels,
            sample_rate = spec.sample_rate,
            frames = samples.len() / spec.channels.max(1) as usize,
            "decoded audio source"
        );

        Self::from_samples(samples, spec.channels, spec.sample_rate)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Interleaved samples of frame `index`.
    pub fn frame(&self, index: usize) -> &[f32] {
        let channels = self.channels as usize;
        let start = index * channels;
        &self.samples[start..start + channels]
    }
}
