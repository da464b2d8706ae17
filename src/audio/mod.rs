//! Platform microphone and speaker backends via cpal.
//!
//! Only compiled with the `device-audio` feature; the rest of the crate
//! talks to the [`crate::engines::FrameSource`] and
//! [`crate::playback::AudioOutput`] seams and never to cpal directly.
//! cpal streams are not `Send`, so each stream lives on its own thread
//! for its whole lifetime.

use crate::config::WakeConfig;
use crate::engines::{FrameSource, FrameStream};
use crate::error::{Result, VoiceError};
use crate::messages::AudioFrame;
use crate::playback::{AudioOutput, PcmSink};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How often stream threads check for shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);
/// Upper bound on buffered output audio before `write` blocks, in ms.
const OUTPUT_BACKLOG_MS: u64 = 500;

/// Microphone capture producing fixed-size 16 kHz mono i16 frames.
///
/// Captures at the device's native rate and channel count, folds to
/// mono, and linearly downsamples. Good enough for speech: the energy
/// that matters sits below 8 kHz.
pub struct CpalFrameSource {
    config: WakeConfig,
}

impl CpalFrameSource {
    pub fn new(config: WakeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl FrameSource for CpalFrameSource {
    async fn open(&self) -> Result<FrameStream> {
        let (frame_tx, frame_rx) = mpsc::channel(self.config.frame_queue);
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = CancellationToken::new();
        let thread_stop = stop.clone();
        let target_rate = self.config.sample_rate;
        let frame_samples = self.config.frame_samples;

        std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                capture_thread(frame_tx, ready_tx, thread_stop, target_rate, frame_samples)
            })
            .map_err(|e| VoiceError::Audio(format!("cannot spawn capture thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| VoiceError::Audio("capture thread died during setup".into()))??;
        Ok(FrameStream::new(frame_rx, stop))
    }
}

/// Owns the cpal input stream until the token fires. Reports setup
/// success or failure once through `ready_tx`.
fn capture_thread(
    frame_tx: mpsc::Sender<AudioFrame>,
    ready_tx: oneshot::Sender<Result<()>>,
    stop: CancellationToken,
    target_rate: u32,
    frame_samples: usize,
) {
    let setup = || -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| VoiceError::Unavailable("no input device".into()))?;
        let default_config = device
            .default_input_config()
            .map_err(|e| VoiceError::Unavailable(format!("microphone unavailable: {e}")))?;

        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();
        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            "capture: native {}Hz/{}ch -> {}Hz mono, {} samples/frame",
            native_rate, native_channels, target_rate, frame_samples
        );

        let mut pending: Vec<f32> = Vec::with_capacity(frame_samples * 2);
        let stream = device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    let mono = if native_channels > 1 {
                        to_mono(data, native_channels)
                    } else {
                        data.to_vec()
                    };
                    let samples = if native_rate != target_rate {
                        downsample(&mono, native_rate, target_rate)
                    } else {
                        mono
                    };
                    pending.extend(samples);
                    while pending.len() >= frame_samples {
                        let frame: Vec<i16> = pending
                            .drain(..frame_samples)
                            .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                            .collect();
                        let frame = AudioFrame {
                            samples: frame,
                            sample_rate: target_rate,
                            captured_at: Instant::now(),
                        };
                        // Never block the audio callback.
                        if frame_tx.try_send(frame).is_err() {
                            debug!("frame queue full, dropping frame");
                        }
                    }
                },
                move |err| error!("input stream error: {err}"),
                None,
            )
            .map_err(|e| VoiceError::Audio(format!("failed to build input stream: {e}")))?;
        stream
            .play()
            .map_err(|e| VoiceError::Audio(format!("failed to start input stream: {e}")))?;
        Ok(stream)
    };

    match setup() {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            while !stop.is_cancelled() {
                std::thread::sleep(SHUTDOWN_POLL);
            }
            drop(stream);
            debug!("capture stream closed");
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

/// Speaker output via cpal.
pub struct CpalOutput;

impl CpalOutput {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for CpalOutput {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn PcmSink>> {
        let shared = Arc::new(OutputShared {
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        });
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_shared = shared.clone();

        std::thread::Builder::new()
            .name("speaker-output".into())
            .spawn(move || output_thread(thread_shared, ready_tx, sample_rate))
            .map_err(|e| VoiceError::Audio(format!("cannot spawn output thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::Audio("output thread died during setup".into()))??;

        let backlog_cap = (sample_rate as u64 * OUTPUT_BACKLOG_MS / 1000) as usize;
        Ok(Box::new(CpalSink {
            shared,
            backlog_cap,
        }))
    }
}

struct OutputShared {
    queue: Mutex<VecDeque<f32>>,
    closed: AtomicBool,
}

/// Owns the cpal output stream; the callback drains the shared queue,
/// substituting silence on underrun.
fn output_thread(
    shared: Arc<OutputShared>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
    sample_rate: u32,
) {
    let setup = || -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| VoiceError::Unavailable("no output device".into()))?;
        let stream_config = StreamConfig {
            channels: 1,
            sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };
        let callback_shared = shared.clone();
        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let mut queue = match callback_shared.queue.lock() {
                        Ok(q) => q,
                        Err(_) => return,
                    };
                    for sample in data.iter_mut() {
                        *sample = queue.pop_front().unwrap_or(0.0);
                    }
                },
                move |err| error!("output stream error: {err}"),
                None,
            )
            .map_err(|e| VoiceError::Audio(format!("failed to build output stream: {e}")))?;
        stream
            .play()
            .map_err(|e| VoiceError::Audio(format!("failed to start output stream: {e}")))?;
        Ok(stream)
    };

    match setup() {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            while !shared.closed.load(Ordering::Relaxed) {
                std::thread::sleep(SHUTDOWN_POLL);
            }
            drop(stream);
            debug!("output stream closed");
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

struct CpalSink {
    shared: Arc<OutputShared>,
    /// Max buffered samples before `write` blocks; bounds stop latency.
    backlog_cap: usize,
}

impl PcmSink for CpalSink {
    fn write(&mut self, samples: &[f32]) -> Result<()> {
        loop {
            let backlog = self
                .shared
                .queue
                .lock()
                .map_err(|_| VoiceError::Audio("output queue poisoned".into()))?
                .len();
            if backlog <= self.backlog_cap {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.shared
            .queue
            .lock()
            .map_err(|_| VoiceError::Audio("output queue poisoned".into()))?
            .extend(samples.iter().copied());
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        loop {
            let backlog = self
                .shared
                .queue
                .lock()
                .map_err(|_| VoiceError::Audio("output queue poisoned".into()))?
                .len();
            if backlog == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Relaxed);
    }
}

/// Fold interleaved multi-channel audio to mono by averaging.
fn to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels as usize;
    data.chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Linear-interpolation downsampler. No anti-alias filter: speech
/// energy sits below 8 kHz, well under the 16 kHz target's Nyquist.
fn downsample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(src_rate) / f64::from(dst_rate);
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;

        let sample = if idx + 1 < samples.len() {
            f64::from(samples[idx]) * (1.0 - frac) + f64::from(samples[idx + 1]) * frac
        } else {
            f64::from(samples[idx.min(samples.len() - 1)])
        };
        output.push(sample as f32);
    }
    output
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn to_mono_averages_channels() {
        let stereo = [1.0, 3.0, -1.0, 1.0];
        assert_eq!(to_mono(&stereo, 2), vec![2.0, 0.0]);
    }

    #[test]
    fn downsample_halves_length_for_double_rate() {
        let samples = vec![0.5f32; 480];
        let out = downsample(&samples, 32_000, 16_000);
        assert_eq!(out.len(), 240);
        assert!((out[100] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn downsample_same_rate_is_identity() {
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(downsample(&samples, 16_000, 16_000), samples);
    }
}
