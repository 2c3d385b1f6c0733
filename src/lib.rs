//! Yate external-module (extmodule) client for Rust
//!
//! This crate drives a Yate softswitch over its line-oriented extmodule
//! protocol: accept and route incoming calls, authenticate SIP users,
//! register on upstream carrier trunks and run IVR sessions, all without
//! touching SIP or RTP itself.
//!
//! # Architecture
//!
//! One background task owns the socket and every piece of session state;
//! the handles are thin and cloneable:
//! - [`Pbx`] (Clone + Send): issue commands from any task
//! - [`PbxEventStream`]: session events from the background task
//! - [`Channel`] / [`Ivr`]: per-call handles carried inside events
//!
//! # Examples
//!
//! ## Answering calls with an IVR
//!
//! ```rust,no_run
//! use yate_extmodule_tokio::{Pbx, PbxConfig, PbxEvent, Sound};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), yate_extmodule_tokio::PbxError> {
//!     let mut cfg = PbxConfig::new(5040);
//!     cfg.allow_unregistered = true;
//!     let (pbx, mut events) = Pbx::new(cfg)?;
//!     pbx.connect()?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let PbxEvent::IncomingCall { channel, info } = event {
//!             println!("call from {} to {}", info.caller, info.called);
//!             let ivr = channel.route_to_ivr().await?;
//!             ivr.enqueue(Sound::file("/var/sounds/welcome.wav")).await?;
//!             ivr.play_tone("dial", Some(2000)).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Forking to gateways
//!
//! ```rust,no_run
//! use yate_extmodule_tokio::{Destination, ForkRoute};
//!
//! # async fn example(channel: yate_extmodule_tokio::Channel)
//! #     -> Result<(), yate_extmodule_tokio::PbxError> {
//! let mut dest = Destination::new("31999", vec![
//!     ForkRoute::to_host("gw1.example:5060"),
//!     ForkRoute {
//!         host: "gw2.example:5060".into(),
//!         forward_timeout: Some(15_000),
//!         ..ForkRoute::default()
//!     },
//! ]);
//! dest.caller = Some("100".into());
//! channel.route_to_destination(dest).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Carrier trunks
//!
//! ```rust,no_run
//! use yate_extmodule_tokio::Trunk;
//!
//! # async fn example(pbx: yate_extmodule_tokio::Pbx)
//! #     -> Result<(), yate_extmodule_tokio::PbxError> {
//! pbx.set_carriers(vec![
//!     Trunk::new("sip.carrier.example", "account1", "secret"),
//! ]).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod carrier;
pub mod channel;
pub mod codec;
pub mod constants;
pub mod error;
pub mod fork;
pub mod ivr;
pub mod message;
pub mod pbx;
pub mod sip;
pub mod users;

pub(crate) mod engine;
pub(crate) mod transport;

pub use auth::{AuthRequest, Authenticator};
pub use carrier::Trunk;
pub use channel::{Cause, Channel, ChannelEvent, ChannelEvents};
pub use codec::{escape, unescape, Frame};
pub use constants::DEFAULT_ENGINE_PORT;
pub use error::{PbxError, PbxResult};
pub use fork::{Destination, ForkRoute};
pub use ivr::{Ivr, Sound};
pub use message::{Message, MessageKind};
pub use pbx::{CallInfo, Pbx, PbxConfig, PbxEvent, PbxEventStream};
pub use users::LocalRoute;
