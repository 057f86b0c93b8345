//! PeerCall Core Library
//!
//! Call session controller for 1:1 audio/video calls:
//! lifecycle state machine, offer/answer/ICE signaling, media-track
//! lifecycle (including screen-share substitution) and ring timeouts.
//!
//! Persistence and delivery are behind the [`store::CallStore`] and
//! [`store::SignalChannel`] traits; platform media sits behind
//! [`media::MediaBackend`]. The crate ships in-memory reference
//! implementations of the first two, a [`loopback`] media backend for
//! tests and demos, and a production [`rtc`] backend over the `webrtc`
//! crate. The UI layer talks to one [`controller::CallController`] per
//! user and renders from [`session::CallSnapshot`]s.

pub mod config;
pub mod controller;
pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod loopback;
pub mod media;
pub mod models;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod store;

pub use config::*;
pub use controller::*;
pub use directory::*;
pub use error::*;
pub use lifecycle::*;
pub use loopback::*;
pub use media::*;
pub use models::*;
pub use rtc::*;
pub use session::*;
pub use signaling::*;
pub use store::*;
