use crate::error::{Error, Result};
use crate::spectrum::{SpectrumAnalyser, PLAYBACK_FFT_SIZE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const DEFAULT_SAMPLE_RATE: u32 = 24000;
/// Audio buffered before playback starts (and again after an underrun).
pub const FLUSH_INTERVAL_MS: u32 = 200;

/// Jitter buffer shared between the engine and the output callback.
#[derive(Debug)]
pub struct PlaybackQueue {
    samples: VecDeque<f32>,
    prime_samples: usize,
    primed: bool,
    recent: VecDeque<f32>,
}

impl PlaybackQueue {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: VecDeque::new(),
            prime_samples: (sample_rate as u64 * FLUSH_INTERVAL_MS as u64 / 1000) as usize,
            primed: false,
            recent: VecDeque::with_capacity(PLAYBACK_FFT_SIZE),
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.samples.extend(samples.iter().copied());
        if !self.primed && self.samples.len() >= self.prime_samples {
            self.primed = true;
        }
    }

    pub fn buffered(&self) -> usize {
        self.samples.len()
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Writes `frames` mono samples into an interleaved buffer, silence
    /// while still buffering.
    pub fn fill(&mut self, out: &mut [f32], channels: usize, gain: f32) {
        let channels = channels.max(1);
        for frame in out.chunks_mut(channels) {
            let sample = if self.primed {
                match self.samples.pop_front() {
                    Some(s) => s * gain,
                    None => {
                        // Underrun: wait for another flush interval.
                        self.primed = false;
                        0.0
                    }
                }
            } else {
                0.0
            };
            if self.recent.len() == PLAYBACK_FFT_SIZE {
                self.recent.pop_front();
            }
            self.recent.push_back(sample);
            frame.iter_mut().for_each(|s| *s = sample);
        }
    }

    fn take_recent(&mut self) -> Vec<f32> {
        self.recent.drain(..).collect()
    }
}

/// f32 little-endian decoder that carries partial samples across chunks.
#[derive(Debug, Default)]
pub struct PcmDecoder {
    pending: Vec<u8>,
}

impl PcmDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<f32> {
        self.pending.extend_from_slice(bytes);
        let whole = self.pending.len() / 4 * 4;
        let out = self.pending[..whole]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.pending.drain(..whole);
        out
    }
}

#[derive(Default)]
struct ResamplerState {
    t: f64,
    last_sample: f32,
    has_last: bool,
}

fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate {
        return samples.to_vec();
    }
    let step = input_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity(((samples.len() as f64 / step) + 2.0) as usize);

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if state.has_last {
        buf.push(state.last_sample);
    }
    buf.extend_from_slice(samples);

    let mut i: usize = 0;
    let mut t = state.t;
    while i + 1 < buf.len() {
        let s0 = buf[i];
        let s1 = buf[i + 1];
        out.push(s0 + (s1 - s0) * t as f32);
        t += step;
        while t >= 1.0 {
            t -= 1.0;
            i += 1;
        }
    }

    state.t = t;
    if let Some(last) = buf.last() {
        state.last_sample = *last;
        state.has_last = true;
    }
    out
}

struct Pipeline {
    _stream: cpal::Stream,
    sample_rate: u32,
    device_rate: u32,
    queue: Arc<Mutex<PlaybackQueue>>,
    decoder: PcmDecoder,
    resampler: ResamplerState,
}

/// Streaming PCM player. The pipeline is replaced wholesale, never
/// reconfigured in place.
pub struct AudioPlaybackEngine {
    device_name: Option<String>,
    pipeline: Option<Pipeline>,
    volume: Arc<AtomicU32>,
    last_sample_rate: u32,
    analyser: SpectrumAnalyser,
}

impl AudioPlaybackEngine {
    pub fn new(device_name: Option<String>, volume: f32) -> Self {
        Self {
            device_name,
            pipeline: None,
            volume: Arc::new(AtomicU32::new(volume.clamp(0.0, 1.0).to_bits())),
            last_sample_rate: DEFAULT_SAMPLE_RATE,
            analyser: SpectrumAnalyser::new(PLAYBACK_FFT_SIZE),
        }
    }

    pub fn is_active(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn last_sample_rate(&self) -> u32 {
        self.last_sample_rate
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Creates the output pipeline, reusing it if the rate is unchanged.
    pub fn init(&mut self, sample_rate: u32) -> Result<()> {
        let sample_rate = if sample_rate == 0 {
            DEFAULT_SAMPLE_RATE
        } else {
            sample_rate
        };
        if let Some(p) = self.pipeline.as_ref() {
            if p.sample_rate == sample_rate {
                return Ok(());
            }
        }
        self.destroy();
        self.last_sample_rate = sample_rate;

        let host = cpal::default_host();
        let device = match self.device_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => host
                .output_devices()
                .map_err(|e| Error::Playback(e.to_string()))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| Error::Playback(format!("device '{}' not found", name)))?,
            None => host
                .default_output_device()
                .ok_or_else(|| Error::Playback("no default output device".into()))?,
        };

        let config = match try_output_config(&device, sample_rate) {
            Some(cfg) => cfg,
            None => {
                let default = device.default_output_config()?;
                StreamConfig {
                    channels: default.channels(),
                    sample_rate: default.sample_rate(),
                    buffer_size: cpal::BufferSize::Default,
                }
            }
        };
        let device_rate = config.sample_rate.0;
        let channels = config.channels as usize;
        log::info!(
            "[playback] init: stream {}Hz, device {}Hz {}ch",
            sample_rate,
            device_rate,
            channels
        );

        let queue = Arc::new(Mutex::new(PlaybackQueue::new(device_rate)));
        let queue_cb = queue.clone();
        let volume = self.volume.clone();
        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let gain = f32::from_bits(volume.load(Ordering::Relaxed));
                match queue_cb.lock() {
                    Ok(mut q) => q.fill(data, channels, gain),
                    Err(_) => data.iter_mut().for_each(|s| *s = 0.0),
                }
            },
            |err| {
                log::error!("[playback] output stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;

        self.pipeline = Some(Pipeline {
            _stream: stream,
            sample_rate,
            device_rate,
            queue,
            decoder: PcmDecoder::default(),
            resampler: ResamplerState::default(),
        });
        Ok(())
    }

    /// Enqueues one f32 mono chunk at the negotiated rate.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(p) = self.pipeline.as_mut() else {
            return Err(Error::Playback("engine not initialised".into()));
        };
        let samples = p.decoder.decode(bytes);
        let samples = resample_linear(&samples, p.sample_rate, p.device_rate, &mut p.resampler);
        match p.queue.lock() {
            Ok(mut q) => q.push(&samples),
            Err(_) => return Err(Error::Playback("playback queue poisoned".into())),
        }
        log::trace!("[playback] fed {} bytes", bytes.len());
        Ok(())
    }

    /// Halts playback and drops the device stream. Idempotent.
    pub fn destroy(&mut self) {
        if self.pipeline.take().is_some() {
            log::info!("[playback] destroyed");
        }
        self.analyser.clear();
    }

    /// Byte-frequency frame of what was most recently played.
    pub fn spectrum(&mut self) -> Vec<u8> {
        if let Some(p) = self.pipeline.as_ref() {
            if let Ok(mut q) = p.queue.lock() {
                let recent = q.take_recent();
                self.analyser.push_samples(&recent);
            }
        }
        self.analyser.byte_frequency_data()
    }
}

fn try_output_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported: Vec<_> = device.supported_output_configs().ok()?.collect();
    let fits = |r: &cpal::SupportedStreamConfigRange| {
        r.sample_format() == cpal::SampleFormat::F32
            && r.min_sample_rate().0 <= rate
            && r.max_sample_rate().0 >= rate
    };
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_waits_for_flush_interval() {
        let mut q = PlaybackQueue::new(1000); // primes at 200 samples
        let mut out = vec![1.0; 10];
        q.push(&[0.5; 150]);
        q.fill(&mut out, 1, 1.0);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(q.buffered(), 150);

        q.push(&[0.5; 50]);
        assert!(q.is_primed());
        q.fill(&mut out, 1, 0.5);
        assert!(out.iter().all(|&s| s == 0.25));
        assert_eq!(q.buffered(), 190);
    }

    #[test]
    fn underrun_reprimes() {
        let mut q = PlaybackQueue::new(1000);
        q.push(&[0.1; 200]);
        let mut out = vec![0.0; 250];
        q.fill(&mut out, 1, 1.0);
        assert_eq!(out[199], 0.1);
        assert_eq!(out[200], 0.0);
        assert!(!q.is_primed());
        q.push(&[0.1; 10]);
        let mut out = vec![9.0; 4];
        q.fill(&mut out, 1, 1.0);
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn fill_duplicates_across_channels() {
        let mut q = PlaybackQueue::new(5);
        q.push(&[0.1, 0.2, 0.3]);
        let mut out = vec![0.0; 6];
        q.fill(&mut out, 2, 1.0);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
        assert_eq!(q.take_recent(), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn decoder_carries_partial_samples() {
        let mut dec = PcmDecoder::default();
        let bytes: Vec<u8> = [0.5f32, -0.25, 1.0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(dec.decode(&bytes[..6]), vec![0.5]);
        assert_eq!(dec.decode(&bytes[6..7]), Vec::<f32>::new());
        assert_eq!(dec.decode(&bytes[7..]), vec![-0.25, 1.0]);
    }

    #[test]
    fn resample_changes_length_by_ratio() {
        let mut state = ResamplerState::default();
        let input = vec![0.0; 2400];
        let out = resample_linear(&input, 24000, 48000, &mut state);
        assert!((out.len() as i64 - 4800).abs() <= 2, "len {}", out.len());
        let mut state = ResamplerState::default();
        assert_eq!(resample_linear(&input, 24000, 24000, &mut state).len(), 2400);
    }

    #[test]
    fn feed_without_init_fails_and_destroy_is_idempotent() {
        let mut engine = AudioPlaybackEngine::new(None, 0.8);
        assert!(engine.feed(&[0, 0, 0, 0]).is_err());
        engine.destroy();
        engine.destroy();
        assert!(!engine.is_active());
        engine.set_volume(3.0);
        assert_eq!(engine.volume(), 1.0);
        assert_eq!(engine.spectrum().len(), PLAYBACK_FFT_SIZE / 2);
    }
}
