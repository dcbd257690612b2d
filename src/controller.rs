//! Session state machine.
//!
//! `SessionController` owns every piece of canonical session state and never
//! touches a socket or an audio device. Each entry point applies one event
//! and returns the side effects the runtime must carry out, in order.
//! Status only changes through `transition`.

use crate::capture::Recording;
use crate::messages::{update_task_in, Message, MessageStore, Task};
use crate::playback::DEFAULT_SAMPLE_RATE;
use crate::protocol::{self, ClientMessage, Frame, ServerEvent};
use crate::state::{Mode, Session, SessionSnapshot, SessionStatus};
use crate::ticker::Clock;
use crate::vad::{frame_level, BargeInConfig, BargeInDetector, VadConfig, VadSignal, VoiceActivityDetector};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    pub mode: Mode,
    /// Advisory container hint sent in the `start` handshake.
    pub format_hint: String,
    pub vad: VadConfig,
    pub barge_in: BargeInConfig,
    pub barge_in_enabled: bool,
    /// Start a new recording right after a barge-in instead of going idle.
    pub barge_in_auto_listen: bool,
    /// Let the VAD open recordings on its own while idle.
    pub hands_free: bool,
    /// Keep text input usable when the microphone cannot be opened.
    pub text_fallback: bool,
    pub min_recording_ms: u64,
    pub min_recording_bytes: usize,
    pub processing_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Voice,
            format_hint: "mic.wav".into(),
            vad: VadConfig::default(),
            barge_in: BargeInConfig::default(),
            barge_in_enabled: true,
            barge_in_auto_listen: true,
            hands_free: false,
            text_fallback: false,
            min_recording_ms: 500,
            min_recording_bytes: 1_000,
            processing_timeout_ms: 30_000,
        }
    }
}

/// Work the runtime performs on behalf of the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenTransport,
    Send(ClientMessage),
    SendAudio(Vec<u8>),
    AcquireMicrophone,
    InitPlayback(u32),
    FeedPlayback(Vec<u8>),
    DestroyPlayback,
    /// `preroll` keeps the audio just before the call, for recordings
    /// opened on detected speech.
    BeginRecording { preroll: bool },
    /// Finalise the recording and report it via `on_recording_finished`.
    FinishRecording,
    DiscardRecording,
    CloseTransport,
    ReleaseMicrophone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    Closed,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MicState {
    Unrequested,
    Pending,
    Ready,
    Unavailable,
}

pub struct SessionController {
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    session: Session,
    status_since: u64,
    transport: TransportState,
    microphone: MicState,
    store: MessageStore,
    live_tasks: Vec<Task>,
    sample_rate: u32,
    playback_live: bool,
    drop_stale_audio: bool,
    recording: bool,
    vad: VoiceActivityDetector,
    barge_in: BargeInDetector,
}

impl SessionController {
    pub fn new(config: ControllerConfig, session_id: Option<String>, clock: Arc<dyn Clock>) -> Self {
        let vad = VoiceActivityDetector::new(config.vad.clone());
        let barge_in = BargeInDetector::new(config.barge_in.clone());
        let status_since = clock.now_ms();
        Self {
            config,
            clock,
            session: Session::new(session_id),
            status_since,
            transport: TransportState::Closed,
            microphone: MicState::Unrequested,
            store: MessageStore::new(),
            live_tasks: Vec::new(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            playback_live: false,
            drop_stale_audio: false,
            recording: false,
            vad,
            barge_in,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn live_tasks(&self) -> &[Task] {
        &self.live_tasks
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn microphone_available(&self) -> bool {
        self.microphone == MicState::Ready
    }

    pub fn preload_history(&mut self, history: Vec<Message>) {
        log::info!("[session] preloaded {} messages", history.len());
        self.store.preload(history);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session.id.clone(),
            status: self.session.status,
            messages: self.store.messages().to_vec(),
            tasks: self.live_tasks.clone(),
            microphone_available: self.microphone_available(),
        }
    }

    /// Whether periodic evaluation (VAD, timeouts) is needed right now.
    pub fn needs_ticker(&self) -> bool {
        match self.session.status {
            SessionStatus::Listening | SessionStatus::Speaking | SessionStatus::Processing => true,
            SessionStatus::Idle => self.hands_free_armed(),
            SessionStatus::Disconnected => false,
        }
    }

    /// Whether the input track should be enabled right now.
    pub fn wants_microphone(&self) -> bool {
        if self.microphone != MicState::Ready {
            return false;
        }
        match self.session.status {
            SessionStatus::Listening => true,
            SessionStatus::Speaking => self.config.barge_in_enabled,
            SessionStatus::Idle => self.config.hands_free,
            _ => false,
        }
    }

    fn hands_free_armed(&self) -> bool {
        self.config.hands_free
            && self.config.mode == Mode::Voice
            && self.microphone == MicState::Ready
    }

    fn transition(&mut self, next: SessionStatus, reason: &str) -> bool {
        let prev = self.session.status;
        if prev == next {
            return false;
        }
        let now = self.clock.now_ms();
        log::info!("[session] status {} -> {} ({})", prev, next, reason);
        self.session.status = next;
        self.status_since = now;
        match next {
            SessionStatus::Idle if self.config.hands_free => self.vad.reset(now),
            SessionStatus::Speaking => self.barge_in.reset(),
            _ => {}
        }
        true
    }

    // ---- connection -------------------------------------------------------

    pub fn connect(&mut self) -> Vec<Effect> {
        if self.transport != TransportState::Closed {
            log::debug!("[session] connect ignored: transport {:?}", self.transport);
            return vec![];
        }
        log::info!("[session] connecting session {}", self.session.id);
        self.transport = TransportState::Connecting;
        vec![Effect::OpenTransport]
    }

    pub fn on_transport_open(&mut self) -> Vec<Effect> {
        if self.transport != TransportState::Connecting {
            return vec![];
        }
        self.transport = TransportState::Open;
        let mut effects = vec![Effect::Send(ClientMessage::Start {
            session_id: self.session.id.clone(),
            filename: self.config.format_hint.clone(),
        })];
        self.transition(SessionStatus::Idle, "transport open");
        if self.config.mode == Mode::Voice && self.microphone == MicState::Unrequested {
            self.microphone = MicState::Pending;
            effects.push(Effect::AcquireMicrophone);
        }
        effects
    }

    pub fn on_microphone(&mut self, result: Result<(), String>) -> Vec<Effect> {
        if self.microphone != MicState::Pending {
            return vec![];
        }
        match result {
            Ok(()) => {
                log::info!("[session] microphone ready");
                self.microphone = MicState::Ready;
                if self.session.status == SessionStatus::Idle && self.config.hands_free {
                    self.vad.reset(self.clock.now_ms());
                }
                vec![]
            }
            Err(reason) => {
                log::warn!("[session] microphone unavailable: {}", reason);
                self.microphone = MicState::Unavailable;
                if self.config.text_fallback {
                    vec![]
                } else {
                    self.teardown("microphone unavailable")
                }
            }
        }
    }

    pub fn on_transport_closed(&mut self, reason: &str) -> Vec<Effect> {
        if self.transport == TransportState::Closed {
            return vec![];
        }
        log::warn!("[session] transport closed: {}", reason);
        self.teardown(reason)
    }

    /// Tears everything down. Safe to call repeatedly from any state.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        self.teardown("disconnect requested")
    }

    fn teardown(&mut self, reason: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.recording {
            self.recording = false;
            effects.push(Effect::DiscardRecording);
        }
        if self.playback_live {
            self.playback_live = false;
            effects.push(Effect::DestroyPlayback);
        }
        if self.transport != TransportState::Closed {
            self.transport = TransportState::Closed;
            effects.push(Effect::CloseTransport);
        }
        if matches!(self.microphone, MicState::Ready | MicState::Pending) {
            effects.push(Effect::ReleaseMicrophone);
        }
        self.microphone = MicState::Unrequested;
        self.drop_stale_audio = false;
        if self.store.active_id().is_some() {
            self.store.finalize(None);
        }
        self.live_tasks.clear();
        self.transition(SessionStatus::Disconnected, reason);
        effects
    }

    // ---- user input -------------------------------------------------------

    pub fn send_text_message(&mut self, text: &str) -> Vec<Effect> {
        let text = text.trim();
        if text.is_empty() {
            return vec![];
        }
        let allowed = matches!(
            self.session.status,
            SessionStatus::Idle | SessionStatus::Processing
        );
        if !allowed || self.transport != TransportState::Open {
            log::info!(
                "[session] text input rejected while {}",
                self.session.status
            );
            return vec![];
        }
        self.store.push_user(text);
        if !self.transition(SessionStatus::Processing, "text input") {
            // follow-up while waiting: the reply deadline restarts
            self.status_since = self.clock.now_ms();
        }
        vec![Effect::Send(ClientMessage::TextInput {
            text: text.to_string(),
        })]
    }

    pub fn start_recording(&mut self) -> Vec<Effect> {
        if self.config.mode != Mode::Voice
            || self.microphone != MicState::Ready
            || self.session.status != SessionStatus::Idle
        {
            log::info!(
                "[session] recording rejected while {} (mic {:?})",
                self.session.status,
                self.microphone
            );
            return vec![];
        }
        self.begin_listening(false, "recording requested")
    }

    pub fn stop_recording(&mut self) -> Vec<Effect> {
        if self.session.status != SessionStatus::Listening || !self.recording {
            return vec![];
        }
        self.finish_listening("recording stopped")
    }

    pub fn cancel_recording(&mut self) -> Vec<Effect> {
        if self.session.status != SessionStatus::Listening || !self.recording {
            return vec![];
        }
        self.recording = false;
        self.transition(SessionStatus::Idle, "recording cancelled");
        vec![Effect::DiscardRecording]
    }

    /// Barge-in: stop assistant audio and tell the server.
    pub fn interrupt(&mut self) -> Vec<Effect> {
        if self.session.status != SessionStatus::Speaking {
            return vec![];
        }
        self.playback_live = false;
        self.drop_stale_audio = true;
        let mut effects = vec![
            Effect::DestroyPlayback,
            Effect::Send(ClientMessage::Interrupt),
        ];
        if self.config.barge_in_auto_listen
            && self.config.mode == Mode::Voice
            && self.microphone == MicState::Ready
        {
            effects.extend(self.begin_listening(false, "barge-in"));
        } else {
            self.transition(SessionStatus::Idle, "barge-in");
        }
        effects
    }

    fn begin_listening(&mut self, speech_confirmed: bool, reason: &str) -> Vec<Effect> {
        let now = self.clock.now_ms();
        if speech_confirmed {
            self.vad.reset_confirmed(now);
        } else {
            self.vad.reset(now);
        }
        self.recording = true;
        self.transition(SessionStatus::Listening, reason);
        vec![Effect::BeginRecording {
            preroll: speech_confirmed,
        }]
    }

    fn finish_listening(&mut self, reason: &str) -> Vec<Effect> {
        self.recording = false;
        self.transition(SessionStatus::Processing, reason);
        vec![Effect::FinishRecording]
    }

    /// Result of `Effect::FinishRecording`. Short or empty recordings are
    /// dropped without touching the network.
    pub fn on_recording_finished(&mut self, recording: Option<Recording>) -> Vec<Effect> {
        if self.session.status != SessionStatus::Processing {
            log::debug!("[session] late recording dropped");
            return vec![];
        }
        match recording {
            Some(rec)
                if rec.duration_ms >= self.config.min_recording_ms
                    && rec.bytes.len() >= self.config.min_recording_bytes =>
            {
                log::info!(
                    "[session] sending recording: {}ms, {} bytes",
                    rec.duration_ms,
                    rec.bytes.len()
                );
                vec![Effect::SendAudio(rec.bytes)]
            }
            Some(rec) => {
                log::info!(
                    "[session] discarding short recording: {}ms, {} bytes",
                    rec.duration_ms,
                    rec.bytes.len()
                );
                self.transition(SessionStatus::Idle, "recording too short");
                vec![]
            }
            None => {
                self.transition(SessionStatus::Idle, "no recording");
                vec![]
            }
        }
    }

    /// Result of a failed `Effect::InitPlayback`. The next audio chunk
    /// asks for a fresh engine at the last negotiated rate.
    pub fn on_playback_failed(&mut self, reason: &str) -> Vec<Effect> {
        log::warn!("[session] playback unavailable: {}", reason);
        self.playback_live = false;
        vec![]
    }

    // ---- periodic ---------------------------------------------------------

    /// One analysis frame from the active spectrum tap.
    pub fn on_vad_frame(&mut self, frame: &[u8]) -> Vec<Effect> {
        let now = self.clock.now_ms();
        let level = frame_level(frame);
        match self.session.status {
            SessionStatus::Listening if self.recording => match self.vad.process(now, level) {
                VadSignal::StopRecording => self.finish_listening("silence after speech"),
                VadSignal::HardTimeout {
                    speech_confirmed: true,
                } => self.finish_listening("max recording time"),
                VadSignal::HardTimeout {
                    speech_confirmed: false,
                } => {
                    self.recording = false;
                    self.transition(SessionStatus::Idle, "no speech detected");
                    vec![Effect::DiscardRecording]
                }
                VadSignal::SpeechConfirmed | VadSignal::Continue => vec![],
            },
            SessionStatus::Speaking
                if self.config.barge_in_enabled && self.microphone == MicState::Ready =>
            {
                if self.barge_in.process(now, level) {
                    self.interrupt()
                } else {
                    vec![]
                }
            }
            SessionStatus::Idle if self.hands_free_armed() => match self.vad.process(now, level) {
                VadSignal::SpeechConfirmed => self.begin_listening(true, "speech detected"),
                VadSignal::HardTimeout { .. } => {
                    self.vad.reset(now);
                    vec![]
                }
                _ => vec![],
            },
            _ => vec![],
        }
    }

    pub fn on_tick(&mut self) -> Vec<Effect> {
        let now = self.clock.now_ms();
        if self.session.status == SessionStatus::Processing
            && now.saturating_sub(self.status_since) >= self.config.processing_timeout_ms
        {
            log::warn!(
                "[session] no reply after {}ms",
                now.saturating_sub(self.status_since)
            );
            self.transition(SessionStatus::Idle, "reply timeout");
        }
        vec![]
    }

    // ---- inbound ----------------------------------------------------------

    pub fn on_frame(&mut self, frame: Frame) -> Vec<Effect> {
        if self.transport != TransportState::Open {
            log::debug!("[session] frame ignored: transport {:?}", self.transport);
            return vec![];
        }
        match frame {
            Frame::Text(text) => match protocol::decode(&text) {
                Ok(event) => self.on_event(event),
                Err(e) => {
                    log::warn!("[protocol] ignoring frame: {}", e);
                    vec![]
                }
            },
            Frame::Binary(bytes) => self.on_audio(bytes),
        }
    }

    fn on_audio(&mut self, bytes: Vec<u8>) -> Vec<Effect> {
        if self.drop_stale_audio {
            log::trace!("[session] dropping {} bytes of interrupted audio", bytes.len());
            return vec![];
        }
        if self.session.status == SessionStatus::Listening {
            log::trace!("[session] dropping {} bytes while listening", bytes.len());
            return vec![];
        }
        let mut effects = Vec::with_capacity(2);
        if !self.playback_live {
            self.playback_live = true;
            effects.push(Effect::InitPlayback(self.sample_rate));
        }
        effects.push(Effect::FeedPlayback(bytes));
        effects
    }

    pub fn on_event(&mut self, event: ServerEvent) -> Vec<Effect> {
        log::debug!("[protocol] <- {:?}", event);
        match event {
            ServerEvent::AudioFormat { sample_rate } => {
                let changed = sample_rate != self.sample_rate;
                self.sample_rate = sample_rate;
                if changed && self.playback_live {
                    vec![Effect::DestroyPlayback, Effect::InitPlayback(sample_rate)]
                } else {
                    vec![]
                }
            }
            ServerEvent::Transcript { text } => {
                if self.config.mode == Mode::Voice {
                    self.store.push_user(&text);
                } else {
                    log::debug!("[session] transcript ignored in text mode");
                }
                vec![]
            }
            ServerEvent::AssistantStart => {
                self.drop_stale_audio = false;
                if self.store.active().is_some() {
                    // tasks of the turn being sealed
                    self.live_tasks.clear();
                }
                self.store.begin_assistant();
                if !self.live_tasks.is_empty() {
                    self.store.attach_tasks(self.live_tasks.clone());
                }
                if matches!(
                    self.session.status,
                    SessionStatus::Processing | SessionStatus::Idle
                ) {
                    self.transition(SessionStatus::Speaking, "assistant turn");
                }
                vec![]
            }
            ServerEvent::Token { text } => {
                if !self.store.append_token(&text) {
                    log::debug!("[session] token without active stream ignored");
                }
                vec![]
            }
            ServerEvent::TaskQueue { tasks } => {
                self.live_tasks = tasks.clone();
                self.store.attach_tasks(tasks);
                vec![]
            }
            ServerEvent::TaskUpdate { task_id, status } => {
                let live = update_task_in(&mut self.live_tasks, &task_id, status);
                let attached = self.store.update_task(&task_id, status);
                if !live && !attached {
                    log::debug!("[session] task update for {} ignored", task_id);
                }
                vec![]
            }
            ServerEvent::Done { assistant_text } => {
                self.store.finalize(assistant_text.as_deref());
                self.live_tasks.clear();
                if matches!(
                    self.session.status,
                    SessionStatus::Speaking | SessionStatus::Processing
                ) {
                    self.transition(SessionStatus::Idle, "turn complete");
                }
                vec![]
            }
            ServerEvent::Interrupt => {
                log::info!("[session] server acknowledged interrupt");
                self.drop_stale_audio = false;
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticker::ManualClock;

    fn open(config: ControllerConfig) -> (SessionController, ManualClock) {
        let clock = ManualClock::new();
        let mut c = SessionController::new(config, Some("s1".into()), Arc::new(clock.clone()));
        c.connect();
        c.on_transport_open();
        c.on_microphone(Ok(()));
        (c, clock)
    }

    #[test]
    fn processing_times_out_to_idle() {
        let (mut c, clock) = open(ControllerConfig::default());
        c.send_text_message("hello");
        assert_eq!(c.status(), SessionStatus::Processing);
        clock.advance(29_999);
        c.on_tick();
        assert_eq!(c.status(), SessionStatus::Processing);
        clock.advance(1);
        c.on_tick();
        assert_eq!(c.status(), SessionStatus::Idle);
    }

    #[test]
    fn hands_free_opens_recording_on_speech() {
        let config = ControllerConfig {
            hands_free: true,
            ..Default::default()
        };
        let (mut c, clock) = open(config);
        assert!(c.needs_ticker());
        assert!(c.wants_microphone());

        let loud = [80u8; 512];
        let mut effects = Vec::new();
        for _ in 0..30 {
            clock.advance(16);
            effects.extend(c.on_vad_frame(&loud));
        }
        assert_eq!(effects, vec![Effect::BeginRecording { preroll: true }]);
        assert_eq!(c.status(), SessionStatus::Listening);

        // already confirmed: silence alone ends it
        let quiet = [0u8; 512];
        let mut effects = Vec::new();
        for _ in 0..200 {
            clock.advance(16);
            effects.extend(c.on_vad_frame(&quiet));
        }
        assert_eq!(effects, vec![Effect::FinishRecording]);
        assert_eq!(c.status(), SessionStatus::Processing);
    }

    #[test]
    fn quiet_idle_without_hands_free_does_nothing() {
        let (mut c, clock) = open(ControllerConfig::default());
        assert!(!c.needs_ticker());
        assert!(!c.wants_microphone());
        clock.advance(1_000);
        assert!(c.on_vad_frame(&[200u8; 512]).is_empty());
        assert_eq!(c.status(), SessionStatus::Idle);
    }

    #[test]
    fn audio_format_change_rebuilds_live_engine() {
        let (mut c, _) = open(ControllerConfig::default());
        assert!(c.on_event(ServerEvent::AudioFormat { sample_rate: 16000 }).is_empty());
        assert_eq!(
            c.on_frame(Frame::Binary(vec![0; 8])),
            vec![Effect::InitPlayback(16000), Effect::FeedPlayback(vec![0; 8])]
        );
        assert!(c.on_event(ServerEvent::AudioFormat { sample_rate: 16000 }).is_empty());
        assert_eq!(
            c.on_event(ServerEvent::AudioFormat { sample_rate: 22050 }),
            vec![Effect::DestroyPlayback, Effect::InitPlayback(22050)]
        );
        assert_eq!(
            c.on_frame(Frame::Binary(vec![1; 4])),
            vec![Effect::FeedPlayback(vec![1; 4])]
        );
    }
}
