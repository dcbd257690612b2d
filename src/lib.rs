//! Client-side controller for a conversational assistant reached over a
//! websocket, by voice or by text.

pub mod capture;
pub mod controller;
pub mod error;
pub mod history;
pub mod messages;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod spectrum;
pub mod state;
pub mod ticker;
pub mod vad;

pub use controller::{ControllerConfig, Effect, SessionController};
pub use error::{Error, Result};
pub use session::{spawn, RuntimeOptions, SessionHandle};
pub use state::{Mode, SessionSnapshot, SessionStatus};
