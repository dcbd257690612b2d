//! Runtime side of the session: owns the websocket, the microphone and the
//! speaker, and carries out the effects the controller asks for.
//!
//! Everything here runs on one local task. cpal streams are not `Send`, so
//! `spawn` must be called inside a `tokio::task::LocalSet`.

use crate::capture::{AudioCaptureSession, AudioFormat};
use crate::controller::{Effect, SessionController};
use crate::error::Error;
use crate::messages::{Message, Task};
use crate::playback::AudioPlaybackEngine;
use crate::protocol::Frame;
use crate::state::{SessionSnapshot, SessionStatus, SharedSpectrum};
use crate::ticker::{Ticker, FRAME_INTERVAL};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite};

#[derive(Debug, Clone)]
pub enum Command {
    Connect,
    Disconnect,
    SendText(String),
    StartRecording,
    StopRecording,
    CancelRecording,
    Interrupt,
    SetVolume(f32),
    Shutdown,
}

#[derive(Debug)]
enum TransportEvent {
    Opened {
        generation: u64,
        writer: mpsc::UnboundedSender<Frame>,
    },
    Frame {
        generation: u64,
        frame: Frame,
    },
    Closed {
        generation: u64,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub url: String,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub volume: f32,
    pub format: AudioFormat,
}

/// Cloneable front door used by the UI. Commands are fire-and-forget;
/// outcomes are observed through the snapshot.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    spectrum: SharedSpectrum,
}

impl SessionHandle {
    fn post(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            log::debug!("[session] command dropped: controller stopped");
        }
    }

    pub fn connect(&self) {
        self.post(Command::Connect);
    }

    pub fn disconnect(&self) {
        self.post(Command::Disconnect);
    }

    pub fn send_text_message(&self, text: impl Into<String>) {
        self.post(Command::SendText(text.into()));
    }

    pub fn start_recording(&self) {
        self.post(Command::StartRecording);
    }

    pub fn stop_recording(&self) {
        self.post(Command::StopRecording);
    }

    pub fn cancel_recording(&self) {
        self.post(Command::CancelRecording);
    }

    pub fn interrupt(&self) {
        self.post(Command::Interrupt);
    }

    pub fn set_volume(&self, volume: f32) {
        self.post(Command::SetVolume(volume));
    }

    pub fn shutdown(&self) {
        self.post(Command::Shutdown);
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status
    }

    pub fn messages(&self) -> Vec<Message> {
        self.snapshot.borrow().messages.clone()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.snapshot.borrow().tasks.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Latest byte-frequency frame (mic while listening, speaker while speaking).
    pub fn spectrum(&self) -> Vec<u8> {
        self.spectrum.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Starts the controller on the current `LocalSet`.
pub fn spawn(controller: SessionController, options: RuntimeOptions) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(controller.snapshot());
    let spectrum: SharedSpectrum = Arc::new(Mutex::new(Vec::new()));
    let runtime = SessionRuntime::new(controller, options, cmd_rx, snapshot_tx, spectrum.clone());
    tokio::task::spawn_local(runtime.run());
    SessionHandle {
        commands: cmd_tx,
        snapshot: snapshot_rx,
        spectrum,
    }
}

struct SessionRuntime {
    controller: SessionController,
    url: String,
    capture: AudioCaptureSession,
    playback: AudioPlaybackEngine,
    ticker: Ticker,
    commands: mpsc::UnboundedReceiver<Command>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    writer: Option<mpsc::UnboundedSender<Frame>>,
    connection: Option<JoinHandle<()>>,
    generation: u64,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    spectrum: SharedSpectrum,
}

impl SessionRuntime {
    fn new(
        controller: SessionController,
        options: RuntimeOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        snapshot_tx: watch::Sender<SessionSnapshot>,
        spectrum: SharedSpectrum,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let ticker = Ticker::new(FRAME_INTERVAL, controller.clock());
        Self {
            capture: AudioCaptureSession::new(options.input_device, options.format),
            playback: AudioPlaybackEngine::new(options.output_device, options.volume),
            url: options.url,
            controller,
            ticker,
            commands,
            transport_tx,
            transport_rx,
            writer: None,
            connection: None,
            generation: 0,
            snapshot_tx,
            spectrum,
        }
    }

    async fn run(mut self) {
        log::info!(
            "[session] controller started: session={} url={}",
            self.controller.session_id(),
            self.url
        );
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let cmd = match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(c) => c,
                    };
                    let effects = self.handle_command(cmd);
                    self.apply(effects);
                }
                Some(event) = self.transport_rx.recv() => {
                    let effects = self.handle_transport(event);
                    self.apply(effects);
                }
                _ = self.ticker.tick(), if self.ticker.is_running() => {
                    let effects = self.handle_tick();
                    self.apply(effects);
                }
            }
            self.sync_resources();
            self.publish();
        }

        let effects = self.controller.disconnect();
        self.apply(effects);
        self.sync_resources();
        self.publish();
        log::info!("[session] controller stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> Vec<Effect> {
        match cmd {
            Command::Connect => self.controller.connect(),
            Command::Disconnect => self.controller.disconnect(),
            Command::SendText(text) => self.controller.send_text_message(&text),
            Command::StartRecording => self.controller.start_recording(),
            Command::StopRecording => self.controller.stop_recording(),
            Command::CancelRecording => self.controller.cancel_recording(),
            Command::Interrupt => self.controller.interrupt(),
            Command::SetVolume(v) => {
                self.playback.set_volume(v);
                vec![]
            }
            Command::Shutdown => vec![],
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) -> Vec<Effect> {
        match event {
            TransportEvent::Opened { generation, writer } if generation == self.generation => {
                self.writer = Some(writer);
                self.controller.on_transport_open()
            }
            TransportEvent::Frame { generation, frame } if generation == self.generation => {
                self.controller.on_frame(frame)
            }
            TransportEvent::Closed { generation, reason } if generation == self.generation => {
                self.writer = None;
                self.connection = None;
                self.controller.on_transport_closed(&reason)
            }
            stale => {
                log::debug!("[session] stale transport event dropped: {:?}", stale);
                vec![]
            }
        }
    }

    fn handle_tick(&mut self) -> Vec<Effect> {
        let mic_frame = if self.capture.is_acquired() {
            Some(self.capture.poll_spectrum())
        } else {
            None
        };
        let mut effects = match mic_frame.as_ref() {
            Some(frame) => self.controller.on_vad_frame(frame),
            None => vec![],
        };
        effects.extend(self.controller.on_tick());

        let visual = if self.controller.status() == SessionStatus::Speaking {
            self.playback.spectrum()
        } else {
            mic_frame.unwrap_or_default()
        };
        if let Ok(mut data) = self.spectrum.lock() {
            *data = visual;
        }
        effects
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            queue.extend(self.execute(effect));
        }
    }

    fn execute(&mut self, effect: Effect) -> Vec<Effect> {
        match effect {
            Effect::OpenTransport => {
                self.open_transport();
                vec![]
            }
            Effect::Send(msg) => {
                log::debug!("[protocol] -> {:?}", msg);
                self.send_frame(Frame::Text(msg.encode()));
                vec![]
            }
            Effect::SendAudio(bytes) => {
                self.send_frame(Frame::Binary(bytes));
                vec![]
            }
            Effect::AcquireMicrophone => {
                let result = self.capture.acquire().map_err(|e| e.to_string());
                self.controller.on_microphone(result)
            }
            Effect::InitPlayback(rate) => match self.playback.init(rate) {
                Ok(()) => vec![],
                Err(e) => self.controller.on_playback_failed(&e.to_string()),
            },
            Effect::FeedPlayback(bytes) => {
                if let Err(e) = self.playback.feed(&bytes) {
                    log::debug!("[playback] chunk dropped: {}", e);
                }
                vec![]
            }
            Effect::DestroyPlayback => {
                self.playback.destroy();
                vec![]
            }
            Effect::BeginRecording { preroll } => {
                self.capture.set_enabled(true);
                self.capture.start_recording(preroll);
                vec![]
            }
            Effect::FinishRecording => {
                let recording = self.capture.stop();
                self.controller.on_recording_finished(recording)
            }
            Effect::DiscardRecording => {
                self.capture.cancel();
                vec![]
            }
            Effect::CloseTransport => {
                self.close_transport();
                vec![]
            }
            Effect::ReleaseMicrophone => {
                self.capture.release();
                vec![]
            }
        }
    }

    fn sync_resources(&mut self) {
        if self.controller.needs_ticker() {
            self.ticker.start();
        } else {
            self.ticker.stop();
        }
        let wants_mic = self.controller.wants_microphone() || self.capture.is_recording();
        self.capture.set_enabled(wants_mic);
    }

    fn publish(&self) {
        let next = self.controller.snapshot();
        self.snapshot_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn send_frame(&self, frame: Frame) {
        match self.writer.as_ref() {
            Some(writer) => {
                if writer.send(frame).is_err() {
                    log::warn!("[session] send failed: writer closed");
                }
            }
            None => log::warn!("[session] send dropped: not connected"),
        }
    }

    fn open_transport(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let url = self.url.clone();
        let events = self.transport_tx.clone();
        self.connection = Some(tokio::spawn(run_connection(url, generation, events)));
    }

    fn close_transport(&mut self) {
        // Bumping the generation orphans anything still in flight.
        self.generation += 1;
        // Dropping the writer lets the send task flush and close the socket.
        self.writer = None;
        if let Some(handle) = self.connection.take() {
            handle.abort();
        }
    }
}

async fn run_connection(
    url: String,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let closed = |reason: String| TransportEvent::Closed { generation, reason };

    let request = match url.as_str().into_client_request() {
        Ok(req) => req,
        Err(e) => {
            let _ = events.send(closed(format!("invalid url {}: {}", url, Error::from(e))));
            return;
        }
    };
    log::info!("[session] connecting to {}", url);
    let ws_stream = match connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            let _ = events.send(closed(Error::from(e).to_string()));
            return;
        }
    };
    log::info!("[session] websocket connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    if events
        .send(TransportEvent::Opened {
            generation,
            writer: out_tx,
        })
        .is_err()
    {
        return;
    }

    // Task: forward outbound frames to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let msg = match frame {
                Frame::Text(text) => tungstenite::Message::Text(text.into()),
                Frame::Binary(bytes) => tungstenite::Message::Binary(bytes.into()),
            };
            if let Err(e) = ws_tx.send(msg).await {
                log::warn!("[session] websocket send failed: {}", e);
                break;
            }
        }
        log::debug!("[session] closing websocket");
        let _ = ws_tx.close().await;
    });

    let reason = loop {
        let msg = match ws_rx.next().await {
            Some(Ok(m)) => m,
            Some(Err(e)) => break Error::from(e).to_string(),
            None => break "websocket stream ended".to_string(),
        };
        let frame = match msg {
            tungstenite::Message::Text(t) => Frame::Text(t.to_string()),
            tungstenite::Message::Binary(b) => Frame::Binary(b.to_vec()),
            tungstenite::Message::Close(frame) => {
                break match frame {
                    Some(frame) => format!("closed by server: {} {}", frame.code, frame.reason),
                    None => "closed by server".to_string(),
                };
            }
            _ => continue,
        };
        if events.send(TransportEvent::Frame { generation, frame }).is_err() {
            break "controller gone".to_string();
        }
    };

    send_task.abort();
    let _ = events.send(closed(reason));
}
