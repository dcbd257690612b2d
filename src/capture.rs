use crate::error::{Error, Result};
use crate::spectrum::{SpectrumAnalyser, VAD_FFT_SIZE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::collections::VecDeque;
use std::sync::mpsc::{sync_channel, Receiver};

const DEFAULT_CAPTURE_RATE: u32 = 16000;
const PREROLL_MS: u64 = 300;
const RAW_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Opus,
    Wav,
    Pcm16,
}

/// A container/codec candidate for recordings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub mime: &'static str,
    pub file_name: &'static str,
    pub encoding: Encoding,
}

pub const WEBM_OPUS: AudioFormat = AudioFormat {
    mime: "audio/webm;codecs=opus",
    file_name: "mic.webm",
    encoding: Encoding::Opus,
};
pub const OGG_OPUS: AudioFormat = AudioFormat {
    mime: "audio/ogg;codecs=opus",
    file_name: "mic.ogg",
    encoding: Encoding::Opus,
};
pub const WAV: AudioFormat = AudioFormat {
    mime: "audio/wav",
    file_name: "mic.wav",
    encoding: Encoding::Wav,
};
pub const PCM16: AudioFormat = AudioFormat {
    mime: "audio/pcm",
    file_name: "mic.pcm",
    encoding: Encoding::Pcm16,
};

pub const KNOWN_FORMATS: &[AudioFormat] = &[WEBM_OPUS, OGG_OPUS, WAV, PCM16];

pub fn default_preference() -> Vec<String> {
    KNOWN_FORMATS.iter().map(|f| f.mime.to_string()).collect()
}

pub fn format_by_mime(mime: &str) -> Option<AudioFormat> {
    KNOWN_FORMATS
        .iter()
        .copied()
        .find(|f| f.mime.eq_ignore_ascii_case(mime.trim()))
}

/// Whether the local recorder can produce this format.
pub fn encoder_supports(format: &AudioFormat) -> bool {
    matches!(format.encoding, Encoding::Wav | Encoding::Pcm16)
}

/// First candidate (in preference order) accepted by `supported`.
pub fn select_format<F>(preferred: &[String], supported: F) -> Option<AudioFormat>
where
    F: Fn(&AudioFormat) -> bool,
{
    preferred
        .iter()
        .filter_map(|mime| format_by_mime(mime))
        .find(|f| supported(f))
}

/// A finished, encoded recording.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub bytes: Vec<u8>,
    pub duration_ms: u64,
    pub format: AudioFormat,
}

/// Buffers mono samples for one recording; the format is fixed at creation.
#[derive(Debug)]
pub struct Recorder {
    format: AudioFormat,
    sample_rate: u32,
    samples: Vec<f32>,
}

impl Recorder {
    pub fn new(format: AudioFormat, sample_rate: u32) -> Self {
        Self {
            format,
            sample_rate: sample_rate.max(1),
            samples: Vec::new(),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }

    pub fn finish(self) -> Recording {
        let duration_ms = self.duration_ms();
        let pcm = pcm16_le(&self.samples);
        let bytes = match self.format.encoding {
            Encoding::Wav => wav_bytes(&pcm, self.sample_rate),
            Encoding::Pcm16 | Encoding::Opus => pcm,
        };
        Recording {
            bytes,
            duration_ms,
            format: self.format,
        }
    }
}

fn pcm16_le(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let clamped = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            clamped.to_le_bytes()
        })
        .collect()
}

/// Mono 16-bit RIFF/WAVE container around `pcm`.
fn wav_bytes(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let mut out = Vec::with_capacity(44 + pcm.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);
    out
}

/// Short history of samples kept while not recording, so a recording that
/// starts on detected speech includes its onset.
#[derive(Debug)]
struct Preroll {
    chunks: VecDeque<Vec<f32>>,
    samples: usize,
    limit: usize,
}

impl Preroll {
    fn new(sample_rate: u32) -> Self {
        Self {
            chunks: VecDeque::new(),
            samples: 0,
            limit: (sample_rate as u64 * PREROLL_MS / 1000) as usize,
        }
    }

    fn push(&mut self, chunk: Vec<f32>) {
        self.samples += chunk.len();
        self.chunks.push_back(chunk);
        while self.samples > self.limit {
            match self.chunks.pop_front() {
                Some(dropped) => self.samples -= dropped.len(),
                None => break,
            }
        }
    }

    fn take(&mut self) -> Vec<f32> {
        self.samples = 0;
        self.chunks.drain(..).flatten().collect()
    }
}

/// Microphone session: one input stream acquired per controller, paused
/// and resumed between recordings instead of being rebuilt.
pub struct AudioCaptureSession {
    device_name: Option<String>,
    format: AudioFormat,
    stream: Option<cpal::Stream>,
    raw_rx: Option<Receiver<Vec<f32>>>,
    sample_rate: u32,
    enabled: bool,
    recorder: Option<Recorder>,
    preroll: Preroll,
    analyser: SpectrumAnalyser,
}

impl AudioCaptureSession {
    pub fn new(device_name: Option<String>, format: AudioFormat) -> Self {
        Self {
            device_name,
            format,
            stream: None,
            raw_rx: None,
            sample_rate: DEFAULT_CAPTURE_RATE,
            enabled: false,
            recorder: None,
            preroll: Preroll::new(DEFAULT_CAPTURE_RATE),
            analyser: SpectrumAnalyser::new(VAD_FFT_SIZE),
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    /// Opens the input device. A second call while acquired is a no-op.
    pub fn acquire(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let host = cpal::default_host();
        let device = match self.device_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => host
                .input_devices()?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| Error::MicrophoneUnavailable(format!("device '{}' not found", name)))?,
            None => host
                .default_input_device()
                .ok_or_else(|| Error::MicrophoneUnavailable("no default input device".into()))?,
        };
        let name = device.name().unwrap_or_else(|_| "unknown".into());

        let config = match try_config(&device, DEFAULT_CAPTURE_RATE) {
            Some(cfg) => cfg,
            None => {
                let default = device
                    .default_input_config()
                    .map_err(|e| Error::MicrophoneUnavailable(e.to_string()))?;
                StreamConfig {
                    channels: default.channels(),
                    sample_rate: default.sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                }
            }
        };
        log::info!(
            "[audio] using input '{}': {}Hz {}ch",
            name,
            config.sample_rate.0,
            config.channels
        );

        let (raw_tx, raw_rx) = sync_channel::<Vec<f32>>(RAW_CHANNEL_DEPTH);
        let channels = config.channels as usize;
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Downmix to mono if stereo
                    let mono: Vec<f32> = if channels > 1 {
                        data.chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                            .collect()
                    } else {
                        data.to_vec()
                    };
                    let _ = raw_tx.try_send(mono);
                },
                |err| {
                    log::error!("[audio] input stream error: {}", err);
                },
                None,
            )
            .map_err(|e| Error::MicrophoneUnavailable(e.to_string()))?;
        // Some backends cannot pause; such a stream simply stays live.
        let enabled = match stream.pause() {
            Ok(()) => false,
            Err(e) => {
                log::warn!("[audio] input cannot be paused: {}", e);
                true
            }
        };

        self.sample_rate = config.sample_rate.0;
        self.preroll = Preroll::new(self.sample_rate);
        self.stream = Some(stream);
        self.raw_rx = Some(raw_rx);
        self.enabled = enabled;
        Ok(())
    }

    /// Toggles the input track without releasing the device. Audio
    /// captured before a pause never reaches a later recording.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        if let Some(stream) = self.stream.as_ref() {
            let result = if enabled {
                stream.play().map_err(Error::from)
            } else {
                stream.pause().map_err(Error::from)
            };
            if let Err(e) = result {
                log::warn!("[audio] failed to toggle input: {}", e);
                return;
            }
        }
        self.enabled = enabled;
        if !enabled {
            self.discard_pending();
        }
    }

    /// Starts buffering a new recording in the session's pinned format.
    /// With `preroll` the last few hundred ms before the call are kept,
    /// so a recording opened on detected speech includes its onset.
    pub fn start_recording(&mut self, preroll: bool) {
        self.drain();
        let mut recorder = Recorder::new(self.format, self.sample_rate);
        let onset = self.preroll.take();
        if preroll {
            recorder.push(&onset);
        }
        log::debug!(
            "[audio] recording started ({}, preroll {}ms)",
            self.format.mime,
            recorder.duration_ms()
        );
        self.recorder = Some(recorder);
    }

    fn discard_pending(&mut self) {
        if let Some(rx) = self.raw_rx.as_ref() {
            while rx.try_recv().is_ok() {}
        }
        self.preroll.take();
        self.analyser.clear();
    }

    /// Finalises the buffered audio into one recording.
    pub fn stop(&mut self) -> Option<Recording> {
        self.drain();
        let recording = self.recorder.take().map(Recorder::finish);
        if let Some(rec) = recording.as_ref() {
            log::debug!(
                "[audio] recording stopped: {}ms, {} bytes",
                rec.duration_ms,
                rec.bytes.len()
            );
        }
        recording
    }

    /// Drops the current recording, if any.
    pub fn cancel(&mut self) {
        if self.recorder.take().is_some() {
            log::debug!("[audio] recording cancelled");
        }
    }

    /// Pulls pending samples from the input callback and returns the
    /// current byte-frequency frame.
    pub fn poll_spectrum(&mut self) -> Vec<u8> {
        self.drain();
        self.analyser.byte_frequency_data()
    }

    fn drain(&mut self) {
        let Some(rx) = self.raw_rx.as_ref() else {
            return;
        };
        while let Ok(chunk) = rx.try_recv() {
            self.analyser.push_samples(&chunk);
            match self.recorder.as_mut() {
                Some(rec) => rec.push(&chunk),
                None => self.preroll.push(chunk),
            }
        }
    }

    /// Releases the device. Safe to call when nothing was acquired.
    pub fn release(&mut self) {
        self.recorder = None;
        self.raw_rx = None;
        self.enabled = false;
        self.preroll.take();
        self.analyser.clear();
        if self.stream.take().is_some() {
            log::info!("[audio] microphone released");
        }
    }
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported: Vec<_> = device.supported_input_configs().ok()?.collect();
    let fits = |r: &cpal::SupportedStreamConfigRange| {
        r.sample_format() == cpal::SampleFormat::F32
            && r.min_sample_rate().0 <= rate
            && r.max_sample_rate().0 >= rate
    };
    // Prefer mono; otherwise take any channel count and downmix.
    let range = supported
        .iter()
        .find(|r| r.channels() == 1 && fits(r))
        .or_else(|| supported.iter().find(|r| fits(r)))?;
    Some(StreamConfig {
        channels: range.channels(),
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

/// List available input devices (name strings).
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let devices = match host.input_devices() {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    devices.filter_map(|d| d.name().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_falls_back_in_order() {
        let prefs = default_preference();
        assert_eq!(select_format(&prefs, encoder_supports), Some(WAV));
        assert_eq!(select_format(&prefs, |_| true), Some(WEBM_OPUS));

        let pcm_first = vec!["audio/pcm".to_string(), "audio/wav".to_string()];
        assert_eq!(select_format(&pcm_first, encoder_supports), Some(PCM16));

        let unknown = vec!["audio/flac".to_string(), "audio/webm;codecs=opus".to_string()];
        assert_eq!(select_format(&unknown, encoder_supports), None);
    }

    #[test]
    fn wav_header_describes_payload() {
        let mut rec = Recorder::new(WAV, 16000);
        rec.push(&vec![0.25; 16000]);
        let out = rec.finish();
        assert_eq!(out.duration_ms, 1000);
        assert_eq!(out.bytes.len(), 44 + 32000);
        assert_eq!(&out.bytes[0..4], b"RIFF");
        assert_eq!(&out.bytes[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes(out.bytes[24..28].try_into().unwrap()), 16000);
        assert_eq!(u32::from_le_bytes(out.bytes[40..44].try_into().unwrap()), 32000);
        let first = i16::from_le_bytes([out.bytes[44], out.bytes[45]]);
        assert_eq!(first, (0.25f32 * 32767.0) as i16);
    }

    #[test]
    fn pcm_recording_is_headerless_and_clamped() {
        let mut rec = Recorder::new(PCM16, 8000);
        rec.push(&[2.0, -2.0, 0.0, 0.5]);
        let out = rec.finish();
        assert_eq!(out.bytes.len(), 8);
        assert_eq!(i16::from_le_bytes([out.bytes[0], out.bytes[1]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([out.bytes[2], out.bytes[3]]), i16::MIN);
        assert_eq!(out.format, PCM16);
    }

    #[test]
    fn preroll_keeps_latest_window() {
        let mut pre = Preroll::new(1000); // 300 samples
        for i in 0..10 {
            pre.push(vec![i as f32; 100]);
        }
        let kept = pre.take();
        assert_eq!(kept.len(), 300);
        assert_eq!(kept[0], 7.0);
        assert_eq!(kept[299], 9.0);
        assert!(pre.take().is_empty());
    }

    fn attach_channel(session: &mut AudioCaptureSession) -> std::sync::mpsc::SyncSender<Vec<f32>> {
        let (tx, rx) = sync_channel(RAW_CHANNEL_DEPTH);
        session.raw_rx = Some(rx);
        session.enabled = true;
        tx
    }

    #[test]
    fn manual_recording_excludes_earlier_audio() {
        let mut session = AudioCaptureSession::new(None, WAV);
        let tx = attach_channel(&mut session);
        // 1s of audio heard while the assistant was speaking
        for _ in 0..10 {
            tx.send(vec![0.3; 1600]).unwrap();
        }
        session.poll_spectrum();
        session.start_recording(false);
        // 200ms of actual speech
        tx.send(vec![0.5; 3200]).unwrap();
        let rec = session.stop().unwrap();
        assert_eq!(rec.duration_ms, 200);
    }

    #[test]
    fn pausing_discards_buffered_audio() {
        let mut session = AudioCaptureSession::new(None, WAV);
        let tx = attach_channel(&mut session);
        for _ in 0..4 {
            tx.send(vec![0.3; 1600]).unwrap();
        }
        session.poll_spectrum();
        // still queued in the channel when the input is paused
        tx.send(vec![0.3; 1600]).unwrap();
        session.set_enabled(false);
        session.set_enabled(true);

        tx.send(vec![0.5; 1600]).unwrap();
        session.start_recording(true);
        let rec = session.stop().unwrap();
        assert_eq!(rec.duration_ms, 100);
    }

    #[test]
    fn speech_onset_keeps_preroll() {
        let mut session = AudioCaptureSession::new(None, WAV);
        let tx = attach_channel(&mut session);
        for _ in 0..10 {
            tx.send(vec![0.3; 1600]).unwrap();
        }
        session.poll_spectrum();
        session.start_recording(true);
        tx.send(vec![0.5; 1600]).unwrap();
        let rec = session.stop().unwrap();
        // 300ms onset + 100ms live
        assert_eq!(rec.duration_ms, 400);
    }

    #[test]
    fn release_without_acquire_is_harmless() {
        let mut session = AudioCaptureSession::new(None, WAV);
        session.release();
        session.release();
        session.set_enabled(true);
        session.cancel();
        assert!(session.stop().is_none());
        assert!(!session.is_acquired());
        assert_eq!(session.poll_spectrum().len(), 512);
    }
}
