use crate::capture::{self, AudioFormat};
use crate::controller::ControllerConfig;
use crate::error::{Error, Result};
use crate::protocol;
use crate::state::Mode;
use crate::vad::{BargeInConfig, VadConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Assistant service base address (http, https, ws or wss).
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    /// Resume this session instead of starting a fresh one.
    #[serde(default)]
    pub session_id: String,
    #[serde(default = "default_true")]
    pub resume_history: bool,
    #[serde(default)]
    pub mic_device: String,
    #[serde(default)]
    pub output_device: String,
    #[serde(default = "default_volume")]
    pub volume: f32,
    /// Recording container preference, most preferred first.
    #[serde(default = "capture::default_preference")]
    pub preferred_formats: Vec<String>,
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,
    #[serde(default = "default_silence_ms")]
    pub silence_ms: u64,
    #[serde(default = "default_max_recording_secs")]
    pub max_recording_secs: u64,
    #[serde(default = "default_barge_in_threshold")]
    pub barge_in_threshold: f32,
    #[serde(default = "default_barge_in_sustain_ms")]
    pub barge_in_sustain_ms: u64,
    #[serde(default = "default_true")]
    pub barge_in_enabled: bool,
    #[serde(default = "default_true")]
    pub barge_in_auto_listen: bool,
    #[serde(default)]
    pub hands_free: bool,
    #[serde(default)]
    pub text_fallback: bool,
    #[serde(default = "default_min_recording_ms")]
    pub min_recording_ms: u64,
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            mode: default_mode(),
            session_id: String::new(),
            resume_history: true,
            mic_device: String::new(),
            output_device: String::new(),
            volume: default_volume(),
            preferred_formats: capture::default_preference(),
            vad_threshold: default_vad_threshold(),
            min_speech_ms: default_min_speech_ms(),
            silence_ms: default_silence_ms(),
            max_recording_secs: default_max_recording_secs(),
            barge_in_threshold: default_barge_in_threshold(),
            barge_in_sustain_ms: default_barge_in_sustain_ms(),
            barge_in_enabled: true,
            barge_in_auto_listen: true,
            hands_free: false,
            text_fallback: false,
            min_recording_ms: default_min_recording_ms(),
            reply_timeout_secs: default_reply_timeout_secs(),
        }
    }
}

impl Settings {
    pub fn endpoint_url(&self) -> String {
        protocol::endpoint_url(&self.server_url, self.mode == Mode::Voice)
    }

    /// First preferred container the local encoder can produce, WAV if none.
    pub fn recording_format(&self) -> AudioFormat {
        capture::select_format(&self.preferred_formats, capture::encoder_supports)
            .unwrap_or(capture::WAV)
    }

    pub fn resume_session(&self) -> Option<String> {
        let id = self.session_id.trim();
        if id.is_empty() {
            None
        } else {
            Some(id.to_string())
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            mode: self.mode,
            format_hint: self.recording_format().file_name.to_string(),
            vad: VadConfig {
                volume_threshold: self.vad_threshold,
                min_speech_ms: self.min_speech_ms,
                silence_hangover_ms: self.silence_ms,
                max_recording_ms: self.max_recording_secs.saturating_mul(1000),
            },
            barge_in: BargeInConfig {
                volume_threshold: self.barge_in_threshold,
                sustain_ms: self.barge_in_sustain_ms,
            },
            barge_in_enabled: self.barge_in_enabled,
            barge_in_auto_listen: self.barge_in_auto_listen,
            hands_free: self.hands_free,
            text_fallback: self.text_fallback,
            min_recording_ms: self.min_recording_ms,
            processing_timeout_ms: self.reply_timeout_secs.saturating_mul(1000),
            ..ControllerConfig::default()
        }
    }
}

fn default_server_url() -> String {
    "http://127.0.0.1:8000".into()
}
fn default_mode() -> Mode {
    Mode::Voice
}
fn default_true() -> bool {
    true
}
fn default_volume() -> f32 {
    1.0
}
fn default_vad_threshold() -> f32 {
    25.0
}
fn default_min_speech_ms() -> u64 {
    300
}
fn default_silence_ms() -> u64 {
    2_500
}
fn default_max_recording_secs() -> u64 {
    30
}
fn default_barge_in_threshold() -> f32 {
    45.0
}
fn default_barge_in_sustain_ms() -> u64 {
    80
}
fn default_min_recording_ms() -> u64 {
    500
}
fn default_reply_timeout_secs() -> u64 {
    30
}

pub fn settings_path() -> Result<PathBuf> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("Parley").join("settings.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".parley").join("settings.json"));
    }
    Err(Error::Settings("failed to resolve data directory".into()))
}

pub fn load() -> Settings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(_) => return Settings::default(),
    };
    match fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            log::warn!("[settings] ignoring {}: {}", path.display(), e);
            Settings::default()
        }),
        Err(_) => Settings::default(),
    }
}

pub fn save(settings: &Settings) -> Result<()> {
    let path = settings_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| Error::Settings(format!("failed to serialize settings: {}", e)))?;
    fs::write(&path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let s: Settings = serde_json::from_str(r#"{"mode":"text","hands_free":true}"#).unwrap();
        assert_eq!(s.mode, Mode::Text);
        assert!(s.hands_free);
        assert_eq!(s.server_url, "http://127.0.0.1:8000");
        assert_eq!(s.silence_ms, 2_500);
        assert!(s.barge_in_auto_listen);
        assert_eq!(s.endpoint_url(), "ws://127.0.0.1:8000/ws/chat");
    }

    #[test]
    fn controller_config_carries_tuning() {
        let s = Settings {
            vad_threshold: 30.0,
            max_recording_secs: 10,
            reply_timeout_secs: 5,
            preferred_formats: vec!["audio/webm;codecs=opus".into(), "audio/pcm".into()],
            ..Default::default()
        };
        let c = s.controller_config();
        assert_eq!(c.vad.volume_threshold, 30.0);
        assert_eq!(c.vad.max_recording_ms, 10_000);
        assert_eq!(c.processing_timeout_ms, 5_000);
        assert_eq!(c.format_hint, "mic.pcm");
        assert_eq!(c.min_recording_bytes, ControllerConfig::default().min_recording_bytes);
    }

    #[test]
    fn unusable_preferences_fall_back_to_wav() {
        let s = Settings {
            preferred_formats: vec!["audio/flac".into()],
            ..Default::default()
        };
        assert_eq!(s.recording_format(), capture::WAV);
        assert_eq!(s.resume_session(), None);
    }
}
