use chirp_core::player::Player;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Sample, SampleFormat,
};
use log::*;

use std::sync::{Arc, Mutex};

/// Owns the negotiated output device configuration. Built first so the
/// core can be constructed with the device's actual sample rate, then
/// consumed by `start` once a player exists.
pub struct AudioDriver {
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
}

/// Keeps the output stream alive; dropping it stops the callback.
pub struct AudioStream {
    _stream: cpal::Stream,
}

impl AudioDriver {
    /// Picks the default output device and its best stereo
    /// configuration, preferring the 48 kHz the synthesis was tuned at.
    pub fn new() -> Result<Self, String> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or("No audio output device available")?;

        let supported_configs_range = device
            .supported_output_configs()
            .map_err(|e| format!("Error while querying audio configs: {}", e))?;

        // Use the provided cmp_default_heuristics to find the best config
        // supported. Prioritizes 2 channels, then sample format.
        let best_config = supported_configs_range
            .max_by(|x, y| x.cmp_default_heuristics(y))
            .ok_or("No supported output configs for device")?;

        let desired = cpal::SampleRate(chirp_core::DEFAULT_SAMPLE_RATE);
        let config = if best_config.min_sample_rate() <= desired
            && desired <= best_config.max_sample_rate()
        {
            best_config.with_sample_rate(desired)
        } else {
            best_config.with_max_sample_rate()
        };

        info!("Sound:");
        info!("\t Device: {:?}", device.name().unwrap_or_default());
        info!("\t Device sample format: {:?}", config.sample_format());
        info!("\t Device sample rate: {:?}", config.sample_rate().0);
        info!("\t Device channels: {:?}", config.channels());

        Ok(AudioDriver { device, config })
    }

    /// The sample rate playback will actually run at.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    /// Builds and starts the output stream. The callback locks the
    /// shared player and pulls interleaved stereo samples straight out
    /// of it; all emulation work happens on the audio thread here.
    pub fn start(self, player: Arc<Mutex<Player>>) -> Result<AudioStream, String> {
        let err_fn = |err| error!("An error occurred on the output audio stream: {}", err);
        let sample_format = self.config.sample_format();
        let config = self.config.config();

        let stream = match sample_format {
            SampleFormat::F32 => self.device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    player.lock().unwrap().fill(data);
                },
                err_fn,
            ),
            SampleFormat::I16 => self.device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut tmp = vec![0.0f32; data.len()];
                    player.lock().unwrap().fill(&mut tmp);
                    for (out, s) in data.iter_mut().zip(tmp.iter()) {
                        *out = Sample::from(s);
                    }
                },
                err_fn,
            ),
            SampleFormat::U16 => self.device.build_output_stream(
                &config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    let mut tmp = vec![0.0f32; data.len()];
                    player.lock().unwrap().fill(&mut tmp);
                    for (out, s) in data.iter_mut().zip(tmp.iter()) {
                        *out = Sample::from(s);
                    }
                },
                err_fn,
            ),
        }
        .map_err(|e| format!("Failed to build audio stream: {}", e))?;

        stream
            .play()
            .map_err(|e| format!("Failed to start audio stream: {}", e))?;

        Ok(AudioStream { _stream: stream })
    }
}
