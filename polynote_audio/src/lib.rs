//! Microphone capture for the live tracker.
//!
//! Opens the default cpal input device and hands mono f32 blocks to a
//! consumer thread through a bounded channel. The audio callback never
//! blocks: when the consumer falls behind, blocks are dropped.

use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::warn;

/// Capacity of the block channel. At typical device block sizes this is a
/// couple of seconds of backlog before blocks get dropped.
const CHANNEL_CAPACITY: usize = 256;

pub struct AudioCapture {
    sample_rate: u32,
    stream: cpal::Stream,
    blocks: Receiver<Vec<f32>>,
}

impl AudioCapture {
    /// Opens the default input device at the requested sample rate. The
    /// device's channel count is taken as-is and downmixed to mono.
    pub fn new(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow!("no audio input device available"))?;

        let supported = device
            .supported_input_configs()?
            .filter(|c| {
                c.sample_format() == cpal::SampleFormat::F32
                    && c.min_sample_rate() <= cpal::SampleRate(sample_rate)
                    && c.max_sample_rate() >= cpal::SampleRate(sample_rate)
            })
            .min_by_key(|c| c.channels())
            .ok_or_else(|| anyhow!("no f32 input config at {sample_rate} Hz"))?;
        let config: cpal::StreamConfig = supported
            .with_sample_rate(cpal::SampleRate(sample_rate))
            .into();
        let channels = config.channels as usize;

        let (sender, blocks): (Sender<Vec<f32>>, Receiver<Vec<f32>>) =
            bounded(CHANNEL_CAPACITY);

        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                if let Some(x) = data.iter().find(|x| !x.is_finite()) {
                    warn!("bad audio sample encountered: {x}");
                    return;
                }
                let mono: Vec<f32> = if channels == 1 {
                    data.to_vec()
                } else {
                    data.chunks_exact(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect()
                };
                // never block the audio thread; drop the block if the
                // consumer fell behind
                let _ = sender.try_send(mono);
            },
            move |err| warn!("audio stream error: {err}"),
            None,
        )?;

        Ok(Self {
            sample_rate,
            stream,
            blocks,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Receiver of mono sample blocks, one per device callback.
    pub fn blocks(&self) -> &Receiver<Vec<f32>> {
        &self.blocks
    }

    pub fn play(&self) -> Result<()> {
        self.stream.play()?;
        Ok(())
    }
}
