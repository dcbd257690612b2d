//! Energy-based voice activity detection over byte-frequency frames.
//!
//! Frames are magnitude spectra scaled to 0..255 (see `spectrum`). The
//! level of a frame is its mean magnitude; speech is anything above a
//! volume threshold. Timing comes from the caller so the detectors stay
//! deterministic.

/// Mean magnitude of a byte-frequency frame, 0.0..=255.0.
pub fn frame_level(frame: &[u8]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: u32 = frame.iter().map(|&b| b as u32).sum();
    sum as f32 / frame.len() as f32
}

#[derive(Debug, Clone, PartialEq)]
pub struct VadConfig {
    /// Mean magnitude (0..255) above which a frame counts as speech.
    pub volume_threshold: f32,
    /// Continuous speech needed before a recording counts as speech.
    pub min_speech_ms: u64,
    /// Silence after confirmed speech that ends the recording.
    pub silence_hangover_ms: u64,
    /// Hard bound on a single recording.
    pub max_recording_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 25.0,
            min_speech_ms: 300,
            silence_hangover_ms: 2_500,
            max_recording_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadSignal {
    /// Nothing to act on.
    Continue,
    /// Speech just crossed the minimum duration. Fires once per recording.
    SpeechConfirmed,
    /// Confirmed speech followed by the full silence hangover.
    StopRecording,
    /// Recording exceeded the maximum duration.
    HardTimeout { speech_confirmed: bool },
}

/// Recording-side detector: confirms speech, then waits for silence.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    started_at: u64,
    speech_run_start: Option<u64>,
    last_voice_at: Option<u64>,
    speech_confirmed: bool,
    finished: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            started_at: 0,
            speech_run_start: None,
            last_voice_at: None,
            speech_confirmed: false,
            finished: true,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Arms the detector for a new recording starting at `now_ms`.
    pub fn reset(&mut self, now_ms: u64) {
        self.started_at = now_ms;
        self.speech_run_start = None;
        self.last_voice_at = None;
        self.speech_confirmed = false;
        self.finished = false;
    }

    /// Arms the detector for a recording that begins on already-confirmed
    /// speech, so only the silence hangover and hard timeout remain.
    pub fn reset_confirmed(&mut self, now_ms: u64) {
        self.reset(now_ms);
        self.speech_confirmed = true;
        self.last_voice_at = Some(now_ms);
    }

    pub fn speech_confirmed(&self) -> bool {
        self.speech_confirmed
    }

    /// Feeds one frame level. After `StopRecording` or `HardTimeout` the
    /// detector stays quiet until the next `reset`.
    pub fn process(&mut self, now_ms: u64, level: f32) -> VadSignal {
        if self.finished {
            return VadSignal::Continue;
        }
        if now_ms.saturating_sub(self.started_at) >= self.config.max_recording_ms {
            self.finished = true;
            log::debug!(
                "[vad] hard timeout after {}ms (speech={})",
                now_ms.saturating_sub(self.started_at),
                self.speech_confirmed
            );
            return VadSignal::HardTimeout {
                speech_confirmed: self.speech_confirmed,
            };
        }

        if level > self.config.volume_threshold {
            let run_start = *self.speech_run_start.get_or_insert(now_ms);
            self.last_voice_at = Some(now_ms);
            if !self.speech_confirmed
                && now_ms.saturating_sub(run_start) >= self.config.min_speech_ms
            {
                self.speech_confirmed = true;
                log::debug!("[vad] speech confirmed level={:.1}", level);
                return VadSignal::SpeechConfirmed;
            }
            return VadSignal::Continue;
        }

        // Speech must be continuous to count toward confirmation.
        self.speech_run_start = None;
        if self.speech_confirmed {
            if let Some(last) = self.last_voice_at {
                if now_ms.saturating_sub(last) >= self.config.silence_hangover_ms {
                    self.finished = true;
                    log::debug!("[vad] silence hangover reached");
                    return VadSignal::StopRecording;
                }
            }
        }
        VadSignal::Continue
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BargeInConfig {
    /// Higher than the recording threshold so the assistant's own audio
    /// leaking into the mic does not trigger it.
    pub volume_threshold: f32,
    pub sustain_ms: u64,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 45.0,
            sustain_ms: 80,
        }
    }
}

/// Playback-side detector: fires once on sustained loud input.
#[derive(Debug, Clone)]
pub struct BargeInDetector {
    config: BargeInConfig,
    loud_since: Option<u64>,
    fired: bool,
}

impl BargeInDetector {
    pub fn new(config: BargeInConfig) -> Self {
        Self {
            config,
            loud_since: None,
            fired: false,
        }
    }

    pub fn reset(&mut self) {
        self.loud_since = None;
        self.fired = false;
    }

    pub fn process(&mut self, now_ms: u64, level: f32) -> bool {
        if self.fired {
            return false;
        }
        if level <= self.config.volume_threshold {
            self.loud_since = None;
            return false;
        }
        let since = *self.loud_since.get_or_insert(now_ms);
        if now_ms.saturating_sub(since) >= self.config.sustain_ms {
            self.fired = true;
            log::info!("[vad] barge-in level={:.1}", level);
            return true;
        }
        false
    }
}
