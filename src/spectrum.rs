use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// 512 frequency bins for the voice detector.
pub const VAD_FFT_SIZE: usize = 1024;
/// Playback visualisation tap.
pub const PLAYBACK_FFT_SIZE: usize = 2048;

const SMOOTHING: f32 = 0.8;
const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;

/// Rolling FFT over the most recent `fft_size` samples, producing byte
/// magnitudes (0..255) on a -100..-30 dB scale with time smoothing.
pub struct SpectrumAnalyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    ring: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
}

impl SpectrumAnalyser {
    pub fn new(fft_size: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / n;
                0.42 - 0.5 * (2.0 * std::f32::consts::PI * x).cos()
                    + 0.08 * (4.0 * std::f32::consts::PI * x).cos()
            })
            .collect();
        Self {
            fft_size,
            fft,
            window,
            ring: Vec::with_capacity(fft_size * 2),
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
            smoothed: vec![0.0; fft_size / 2],
        }
    }

    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }

    pub fn push_samples(&mut self, samples: &[f32]) {
        self.ring.extend_from_slice(samples);
        // Keep only the latest window (avoid unbounded growth)
        if self.ring.len() > self.fft_size * 2 {
            let drain = self.ring.len() - self.fft_size;
            self.ring.drain(..drain);
        }
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Analyses the latest window. Missing history is treated as silence.
    pub fn byte_frequency_data(&mut self) -> Vec<u8> {
        let have = self.ring.len().min(self.fft_size);
        let pad = self.fft_size - have;
        let start = self.ring.len() - have;
        for i in 0..self.fft_size {
            let sample = if i < pad {
                0.0
            } else {
                self.ring[start + i - pad]
            };
            self.buffer[i] = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DB - MIN_DB;
        self.smoothed
            .iter_mut()
            .zip(self.buffer.iter())
            .map(|(prev, bin)| {
                let mag = bin.norm() * scale;
                *prev = SMOOTHING * *prev + (1.0 - SMOOTHING) * mag;
                let db = if *prev > 0.0 {
                    20.0 * prev.log10()
                } else {
                    f32::NEG_INFINITY
                };
                (255.0 * (db - MIN_DB) / range).clamp(0.0, 255.0) as u8
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::frame_level;

    fn tone(freq: f32, rate: f32, len: usize, amp: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin())
            .collect()
    }

    #[test]
    fn silence_is_zero() {
        let mut a = SpectrumAnalyser::new(VAD_FFT_SIZE);
        a.push_samples(&vec![0.0; VAD_FFT_SIZE]);
        let data = a.byte_frequency_data();
        assert_eq!(data.len(), 512);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn tone_peaks_at_its_bin() {
        let mut a = SpectrumAnalyser::new(VAD_FFT_SIZE);
        // 1000 Hz at 16 kHz lands on bin 64
        let samples = tone(1_000.0, 16_000.0, VAD_FFT_SIZE, 0.5);
        let mut data = Vec::new();
        for _ in 0..20 {
            a.push_samples(&samples);
            data = a.byte_frequency_data();
        }
        let peak = data
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| **v)
            .map(|(i, _)| i)
            .unwrap();
        assert!((63..=65).contains(&peak), "peak at {}", peak);
        assert!(data[peak] > 200);
    }

    #[test]
    fn loud_noise_raises_level() {
        let mut quiet = SpectrumAnalyser::new(VAD_FFT_SIZE);
        let mut loud = SpectrumAnalyser::new(VAD_FFT_SIZE);
        let mut seed: u32 = 7;
        let noise: Vec<f32> = (0..VAD_FFT_SIZE)
            .map(|_| {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                ((seed >> 16) as f32 / 32_768.0) - 1.0
            })
            .collect();
        let faint: Vec<f32> = noise.iter().map(|s| s * 0.0005).collect();
        for _ in 0..10 {
            quiet.push_samples(&faint);
            loud.push_samples(&noise);
        }
        let q = frame_level(&quiet.byte_frequency_data());
        let l = frame_level(&loud.byte_frequency_data());
        assert!(l > q + 30.0, "loud={} quiet={}", l, q);
    }

    #[test]
    fn ring_stays_bounded() {
        let mut a = SpectrumAnalyser::new(256);
        for _ in 0..100 {
            a.push_samples(&[0.1; 100]);
        }
        assert!(a.ring.len() <= 512);
        a.clear();
        assert!(a.ring.is_empty());
    }
}
