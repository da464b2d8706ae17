//! Streaming compressed-audio decode for playback transport (a).
//!
//! Fetched bytes arrive on a channel; a blocking decode loop probes the
//! container, folds decoded frames to mono f32, and writes them to the
//! output sink. Decode starts as soon as the probe has enough bytes, so
//! playback does not wait for the fetch to complete.

use crate::error::{Result, VoiceError};
use crate::messages::OutputFormat;
use crate::playback::{AudioOutput, PcmSink};
use bytes::Bytes;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Blocking reader over a channel of fetched byte chunks.
///
/// `read` blocks until bytes arrive; a dropped sender reads as EOF.
/// Lives on a blocking thread; the async fetch side gets backpressure
/// from the bounded channel.
pub struct ChannelRead {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
    pos: usize,
}

impl ChannelRead {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelRead {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                None => return Ok(0), // sender gone: end of stream
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Decode a compressed stream and write mono f32 PCM to the output.
///
/// Runs on a blocking thread. The stop token is checked between packets;
/// a stop exits cleanly with the sink dropped. `played_ms` accumulates
/// the audio duration written so far for barge-in accounting.
pub fn decode_stream(
    source: ChannelRead,
    format: OutputFormat,
    output: &dyn AudioOutput,
    stop: &CancellationToken,
    played_ms: &AtomicU64,
) -> Result<()> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::{MediaSourceStream, ReadOnlySource};
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let mss = MediaSourceStream::new(
        Box::new(ReadOnlySource::new(source)),
        Default::default(),
    );
    let mut hint = Hint::new();
    hint.with_extension(format.as_str());

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| VoiceError::Playback(format!("failed to probe audio stream: {e}")))?;

    let mut reader = probed.format;
    let track = reader
        .default_track()
        .ok_or_else(|| VoiceError::Playback("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| VoiceError::Playback(format!("failed to create decoder: {e}")))?;

    let mut sink: Option<Box<dyn PcmSink>> = None;
    let mut sample_rate = 0u32;
    let mut sample_buf: Option<SampleBuffer<f32>> = None;
    let mut mono: Vec<f32> = Vec::new();

    loop {
        if stop.is_cancelled() {
            debug!("decode stopped by request");
            return Ok(());
        }

        let packet = match reader.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(VoiceError::Playback(format!("audio read error: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(e)) => {
                debug!("skipping undecodable packet: {e}");
                continue;
            }
            Err(e) => return Err(VoiceError::Playback(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        if sink.is_none() {
            sample_rate = spec.rate;
            sink = Some(output.open(sample_rate)?);
        }

        let frames = decoded.frames();
        let needs_new = sample_buf
            .as_ref()
            .is_none_or(|b| b.capacity() < frames * channels);
        if needs_new {
            sample_buf = Some(SampleBuffer::<f32>::new(frames as u64, spec));
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);

        mono.clear();
        mono.reserve(frames);
        for frame in buf.samples().chunks_exact(channels) {
            mono.push(frame.iter().sum::<f32>() / channels as f32);
        }

        if let Some(sink) = sink.as_mut() {
            sink.write(&mono)?;
            let ms = mono.len() as u64 * 1000 / u64::from(sample_rate.max(1));
            played_ms.fetch_add(ms, Ordering::Relaxed);
        }
    }

    if let Some(mut sink) = sink {
        if !stop.is_cancelled() {
            sink.drain()?;
        }
    }
    Ok(())
}
