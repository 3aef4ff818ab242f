// src/capture.rs
//
// Audio capture devices and WAV encode/decode of captured material.

use std::io::Cursor;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::audio_buffer::{AudioBuffer, AudioData};
use crate::error::{EngineError, EngineResult, ErrorCode};

// ═══════════════════════════════════════════════════════════════════
// Device traits
// ═══════════════════════════════════════════════════════════════════

/// An opened input. Each device records independently.
pub trait CaptureDevice: Send {
    fn start(&mut self) -> EngineResult<()>;

    /// Stop and return the captured material as an encoded WAV file.
    fn stop(&mut self) -> EngineResult<Vec<u8>>;

    fn close(&mut self);

    fn is_capturing(&self) -> bool;
}

/// Source of capture devices (microphone permission lives here).
pub trait CaptureBackend: Send + Sync {
    fn open(&self) -> EngineResult<Box<dyn CaptureDevice>>;
}

// ═══════════════════════════════════════════════════════════════════
// WAV codec
// ═══════════════════════════════════════════════════════════════════

fn decode_error(e: hound::Error) -> EngineError {
    EngineError::new(
        ErrorCode::BufferDecodeError,
        format!("Failed to decode recorded audio: {e}"),
    )
    .with_source(e)
}

/// Decode a WAV file (8/16/24/32-bit PCM or 32-bit float).
pub fn decode_audio(bytes: &[u8]) -> EngineResult<AudioData> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes)).map_err(decode_error)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(decode_error)?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .map_err(decode_error)?
        }
    };

    AudioData::from_interleaved(f64::from(spec.sample_rate), usize::from(spec.channels), &samples)
        .map_err(|e| EngineError::new(ErrorCode::BufferDecodeError, e.message().to_string()))
}

/// Encode planar channels as a 32-bit float WAV file.
pub fn encode_wav(sample_rate: f64, channels: &[Vec<f32>]) -> EngineResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: channels.len().max(1) as u16,
        sample_rate: sample_rate.round() as u32,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let encode_error = |e: hound::Error| {
        EngineError::new(ErrorCode::OperationFailed, format!("WAV encoding failed: {e}"))
            .with_source(e)
    };

    let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(encode_error)?;
        for i in 0..frames {
            for ch in channels {
                writer.write_sample(ch[i]).map_err(encode_error)?;
            }
        }
        writer.finalize().map_err(encode_error)?;
    }
    Ok(cursor.into_inner())
}

// ═══════════════════════════════════════════════════════════════════
// Host input feed
// ═══════════════════════════════════════════════════════════════════

#[derive(Debug)]
struct Sink {
    id: u64,
    active: bool,
    data: Vec<Vec<f32>>,
}

#[derive(Debug)]
struct FeedInner {
    sample_rate: f64,
    channels: usize,
    access_denied: bool,
    next_id: u64,
    sinks: Vec<Sink>,
}

/// Capture backend fed with the input frames the host passes to
/// [`Engine::process_block_with_input`](crate::Engine::process_block_with_input).
///
/// Clones share the same feed.
#[derive(Debug, Clone)]
pub struct InputCapture {
    inner: Arc<Mutex<FeedInner>>,
}

impl InputCapture {
    pub fn new(sample_rate: f64, channels: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeedInner {
                sample_rate,
                channels: channels.max(1),
                access_denied: false,
                next_id: 1,
                sinks: Vec::new(),
            })),
        }
    }

    /// Simulate the user refusing (or granting) input permission.
    pub fn set_access_denied(&self, denied: bool) {
        self.inner.lock().access_denied = denied;
    }

    /// Append one block of host input to every capturing device.
    pub fn push(&self, input: &AudioBuffer) {
        let mut inner = self.inner.lock();
        if input.channels == 0 {
            return;
        }
        for sink in inner.sinks.iter_mut().filter(|s| s.active) {
            for (ch, data) in sink.data.iter_mut().enumerate() {
                data.extend_from_slice(input.channel(ch % input.channels));
            }
        }
    }

    pub fn open_devices(&self) -> usize {
        self.inner.lock().sinks.len()
    }
}

impl CaptureBackend for InputCapture {
    fn open(&self) -> EngineResult<Box<dyn CaptureDevice>> {
        let mut inner = self.inner.lock();
        if inner.access_denied {
            return Err(EngineError::new(
                ErrorCode::MicrophoneAccessDenied,
                "Microphone access denied",
            ));
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let channels = inner.channels;
        inner.sinks.push(Sink {
            id,
            active: false,
            data: vec![Vec::new(); channels],
        });
        log::debug!("Capture device {id} opened");
        Ok(Box::new(InputDevice {
            feed: Arc::clone(&self.inner),
            id,
            closed: false,
        }))
    }
}

struct InputDevice {
    feed: Arc<Mutex<FeedInner>>,
    id: u64,
    closed: bool,
}

impl InputDevice {
    fn closed_error() -> EngineError {
        EngineError::new(ErrorCode::OperationFailed, "Capture device is closed")
    }
}

impl CaptureDevice for InputDevice {
    fn start(&mut self) -> EngineResult<()> {
        let mut inner = self.feed.lock();
        let sink = inner
            .sinks
            .iter_mut()
            .find(|s| s.id == self.id)
            .ok_or_else(Self::closed_error)?;
        sink.active = true;
        for ch in sink.data.iter_mut() {
            ch.clear();
        }
        Ok(())
    }

    fn stop(&mut self) -> EngineResult<Vec<u8>> {
        let (sample_rate, data) = {
            let mut inner = self.feed.lock();
            let sample_rate = inner.sample_rate;
            let sink = inner
                .sinks
                .iter_mut()
                .find(|s| s.id == self.id)
                .ok_or_else(Self::closed_error)?;
            sink.active = false;
            let channels = sink.data.len();
            (sample_rate, std::mem::replace(&mut sink.data, vec![Vec::new(); channels]))
        };
        encode_wav(sample_rate, &data)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.feed.lock().sinks.retain(|s| s.id != self.id);
        log::debug!("Capture device {} closed", self.id);
    }

    fn is_capturing(&self) -> bool {
        self.feed
            .lock()
            .sinks
            .iter()
            .any(|s| s.id == self.id && s.active)
    }
}

impl Drop for InputDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_float_wav_round_trip() {
        let left = vec![0.0, 0.5, -0.5, 1.0];
        let right = vec![0.25; 4];
        let bytes = encode_wav(48_000.0, &[left.clone(), right]).unwrap();
        let audio = decode_audio(&bytes).unwrap();
        assert_eq!(audio.num_channels(), 2);
        assert_eq!(audio.frames(), 4);
        assert_eq!(audio.sample_rate(), 48_000.0);
        assert_eq!(audio.channel(0), left.as_slice());
    }

    #[test]
    fn test_decodes_16_bit_pcm() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut w = hound::WavWriter::new(&mut cursor, spec).unwrap();
            w.write_sample(16_384_i16).unwrap();
            w.write_sample(-32_768_i16).unwrap();
            w.finalize().unwrap();
        }
        let audio = decode_audio(&cursor.into_inner()).unwrap();
        assert_relative_eq!(audio.channel(0)[0], 0.5);
        assert_relative_eq!(audio.channel(0)[1], -1.0);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = decode_audio(b"definitely not a wav file").unwrap_err();
        assert_eq!(err.code(), ErrorCode::BufferDecodeError);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_input_capture_records_only_while_started() {
        let feed = InputCapture::new(1000.0, 2);
        let mut device = feed.open().unwrap();

        let mut block = vec![0.1, 0.2, 0.3, 0.4];
        feed.push(&AudioBuffer::new(&mut block, 2));

        device.start().unwrap();
        assert!(device.is_capturing());
        feed.push(&AudioBuffer::new(&mut block, 2));
        feed.push(&AudioBuffer::new(&mut block, 2));

        let audio = decode_audio(&device.stop().unwrap()).unwrap();
        assert_eq!(audio.frames(), 4);
        assert_relative_eq!(audio.channel(1)[1], 0.4);
        assert!(!device.is_capturing());

        device.close();
        assert_eq!(feed.open_devices(), 0);
    }

    #[test]
    fn test_denied_access() {
        let feed = InputCapture::new(48_000.0, 2);
        feed.set_access_denied(true);
        let err = feed.open().err().unwrap();
        assert_eq!(err.code(), ErrorCode::MicrophoneAccessDenied);
    }
}
