//! Microphone capture using CPAL.
//!
//! The device delivers int16 mono; the callback normalizes to f32, slices the
//! stream into fixed-size frames, and feeds each frame synchronously into the
//! [`FrameBus`](crate::bus::FrameBus). Everything on this path must stay fast
//! relative to the frame period.

use crate::bus::FrameBus;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Audio configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000).
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono).
    pub channels: u16,

    /// Frame size in samples (default: 480 = 30ms at 16kHz).
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 480,
        }
    }
}

impl AudioConfig {
    /// Pre-roll ring capacity in samples for a given retention window.
    pub fn preroll_samples(&self, window: std::time::Duration) -> usize {
        (self.sample_rate as f64 * window.as_secs_f64()) as usize
    }
}

/// One fixed-length block of normalized samples from the capture stream.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples normalized to -1.0..1.0.
    pub samples: Vec<f32>,

    /// When the frame was assembled.
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            captured_at: Instant::now(),
        }
    }
}

/// Microphone capture bound to the default input device.
pub struct AudioCapture {
    config: AudioConfig,
    device: Device,
    stream_config: StreamConfig,
}

impl AudioCapture {
    /// Open the default input device. Missing hardware is fatal here, before
    /// the turn loop ever starts.
    pub fn new(config: AudioConfig) -> VoiceResult<Self> {
        info!(
            "initializing audio capture ({}Hz, {} channel(s), {}-sample frames)",
            config.sample_rate, config.channels, config.frame_size
        );

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("no input device available".to_string()))?;

        info!(
            "using input device: {}",
            device.name().unwrap_or_else(|_| "unknown".to_string())
        );

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(config.frame_size as u32),
        };

        Ok(Self {
            config,
            device,
            stream_config,
        })
    }

    /// Start capturing. Each assembled frame goes straight into `bus.ingest`;
    /// the returned stream must be kept alive for capture to continue.
    pub fn start(self, bus: Arc<FrameBus>) -> VoiceResult<Stream> {
        let frame_size = self.config.frame_size;
        let mut pending = Vec::with_capacity(frame_size);

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(sample as f32 / 32768.0);
                    if pending.len() >= frame_size {
                        let samples = std::mem::replace(
                            &mut pending,
                            Vec::with_capacity(frame_size),
                        );
                        bus.ingest(AudioFrame::new(samples));
                    }
                }
            },
            move |err| {
                warn!("audio stream error: {err}");
            },
            None,
        )?;

        stream.play()?;
        info!("audio capture started");
        Ok(stream)
    }

    /// List available input devices.
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        for device in host.input_devices()? {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }
}
