//! The PBX session handle and its event stream

use crate::auth::Authenticator;
use crate::carrier::Trunk;
use crate::channel::Channel;
use crate::constants::{
    DEFAULT_AUTHENTICATE_TIMEOUT_MS, DEFAULT_CALL_SETUP_TIMEOUT_MS, DEFAULT_CALL_TIMEOUT_MS,
    DEFAULT_RECONNECT_INTERVAL_MS, EVENT_QUEUE_SIZE,
};
use crate::engine::{Engine, Op};
use crate::error::{PbxError, PbxResult};
use crate::fork::Destination;
use crate::ivr::Ivr;
use crate::message::Message;
use crate::users::LocalRoute;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Session configuration.
///
/// `port` is the only required field; everything else has the conventional
/// defaults. A zero `reconnect_interval` (or `None`) disables automatic
/// re-dialing, leaving `destroy()` plus a fresh session as the only recovery.
#[derive(Clone)]
pub struct PbxConfig {
    /// Engine host.
    pub host: String,
    /// Engine extmodule port. Must be non-zero.
    pub port: u16,
    /// Delay before re-dialing a dead socket; `None` disables reconnects.
    pub reconnect_interval: Option<Duration>,
    /// Deadline for the host authenticator per `user.auth`.
    pub authenticate_timeout: Duration,
    /// Default call duration cap.
    pub call_timeout: Duration,
    /// Default call setup (pre-answer) cap.
    pub call_setup_timeout: Duration,
    /// Accept every `user.auth` without consulting an authenticator.
    pub allow_unregistered: bool,
    /// Offer RTP forwarding on routes that advertise it.
    pub rtp_forward: bool,
    /// Authentication policy; may also be set later on the handle.
    pub authenticator: Option<Arc<dyn Authenticator>>,
}

impl PbxConfig {
    /// Configuration for `localhost:<port>` with default knobs.
    pub fn new(port: u16) -> Self {
        PbxConfig {
            host: "localhost".to_string(),
            port,
            reconnect_interval: Some(Duration::from_millis(DEFAULT_RECONNECT_INTERVAL_MS)),
            authenticate_timeout: Duration::from_millis(DEFAULT_AUTHENTICATE_TIMEOUT_MS),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            call_setup_timeout: Duration::from_millis(DEFAULT_CALL_SETUP_TIMEOUT_MS),
            allow_unregistered: false,
            rtp_forward: true,
            authenticator: None,
        }
    }
}

impl std::fmt::Debug for PbxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbxConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("reconnect_interval", &self.reconnect_interval)
            .field("authenticate_timeout", &self.authenticate_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("call_setup_timeout", &self.call_setup_timeout)
            .field("allow_unregistered", &self.allow_unregistered)
            .field("rtp_forward", &self.rtp_forward)
            .field("authenticator", &self.authenticator.is_some())
            .finish()
    }
}

/// Summary of an incoming `call.route`.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Calling party.
    pub caller: String,
    /// Called number.
    pub called: String,
    /// The engine's billing id, when present.
    pub bill_id: Option<String>,
    /// Bare IP the call came in from.
    pub caller_host: Option<String>,
}

/// Events the session delivers to the host.
#[derive(Debug)]
#[non_exhaustive]
pub enum PbxEvent {
    /// The TCP socket is up; the handshake is starting.
    Connect,
    /// Handshake complete, the session is ready for dispatches.
    Connected,
    /// The socket is gone (or the session was destroyed).
    Disconnected,
    /// A recoverable problem; the session keeps running.
    Error(String),
    /// A carrier trunk registered upstream.
    CarrierOnline(String),
    /// A carrier trunk lost its upstream registration.
    CarrierOffline(String),
    /// A local user registered.
    UserRegister { username: String },
    /// A local user unregistered.
    UserUnregister { username: String },
    /// A lookup observed an expired registration lease.
    UserExpired { username: String },
    /// A new call wants routing; answer on the channel.
    IncomingCall { channel: Channel, info: CallInfo },
    /// A `make_call` grew its IVR leg.
    OutgoingCall { ivr: Ivr, destination: Destination },
    /// Trace: one line went out.
    SendLine(String),
    /// Trace: one line came in.
    RecvLine(String),
    /// Trace: a line was dropped instead of written, or ignored on receipt.
    SuppressLine(String),
    /// Trace: the engine confirmed an install.
    InstallConfirm {
        name: String,
        priority: u32,
        success: bool,
    },
    /// Trace: the engine confirmed a watch.
    WatchConfirm { name: String, success: bool },
    /// An installed message nobody handled was auto-replied negatively.
    ReplyUnhandled(Message),
}

/// Stream of [`PbxEvent`]s (not `Clone`).
///
/// Delivered from the session task over a bounded queue; events are dropped
/// with a warning when the host falls behind.
pub struct PbxEventStream {
    rx: mpsc::Receiver<PbxEvent>,
}

impl PbxEventStream {
    /// Receive the next event, or `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<PbxEvent> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for PbxEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PbxEventStream").finish()
    }
}

impl futures_util::Stream for PbxEventStream {
    type Item = PbxEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct PbxInner {
    ops: mpsc::UnboundedSender<Op>,
    ready_rx: watch::Receiver<bool>,
}

impl Drop for PbxInner {
    fn drop(&mut self) {
        // last handle gone; shut the session task down
        let _ = self.ops.send(Op::Destroy);
    }
}

/// Handle to one PBX session (Clone + Send).
///
/// Dropping the last clone destroys the session.
#[derive(Clone)]
pub struct Pbx {
    inner: Arc<PbxInner>,
}

impl std::fmt::Debug for Pbx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pbx").field("ready", &self.ready()).finish()
    }
}

impl Pbx {
    /// Create the session task. Refuses to start on an invalid port.
    ///
    /// Nothing is dialed until [`connect`](Self::connect) is called.
    pub fn new(cfg: PbxConfig) -> PbxResult<(Pbx, PbxEventStream)> {
        if cfg.port == 0 {
            return Err(PbxError::config("port must be a positive integer"));
        }
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (ready_tx, ready_rx) = watch::channel(false);

        debug!("starting PBX session for {}:{}", cfg.host, cfg.port);
        let engine = Engine::new(cfg, ops_tx.clone(), event_tx, ready_tx);
        tokio::spawn(engine.run(ops_rx));

        let pbx = Pbx {
            inner: Arc::new(PbxInner {
                ops: ops_tx,
                ready_rx,
            }),
        };
        let events = PbxEventStream { rx: event_rx };
        Ok((pbx, events))
    }

    fn send(&self, op: Op) -> PbxResult<()> {
        self.inner.ops.send(op).map_err(|_| PbxError::Destroyed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<PbxResult<T>>) -> Op) -> PbxResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| PbxError::Destroyed)?
    }

    /// Dial the engine and run the install/watch handshake.
    ///
    /// Completion is signalled by [`PbxEvent::Connected`]; failures retry per
    /// the configured reconnect interval.
    pub fn connect(&self) -> PbxResult<()> {
        self.send(Op::Connect)
    }

    /// Tear the session down. Further operations on any handle fail with
    /// [`PbxError::Destroyed`].
    pub fn destroy(&self) -> PbxResult<()> {
        self.send(Op::Destroy)
    }

    /// `true` iff the socket is up and the handshake has completed.
    pub fn ready(&self) -> bool {
        *self.inner.ready_rx.borrow()
    }

    /// Declare the full desired carrier set; see [`Trunk`].
    ///
    /// The session logs in to new or inactive trunks and out of removed
    /// ones; when the session is down the set is stored and replayed on the
    /// next connect.
    pub async fn set_carriers(&self, trunks: Vec<Trunk>) -> PbxResult<()> {
        self.request(|done| Op::SetCarriers { trunks, done }).await
    }

    /// Replace the authentication policy.
    pub fn set_authenticator(&self, authenticator: Arc<dyn Authenticator>) -> PbxResult<()> {
        self.send(Op::SetAuthenticator { authenticator })
    }

    /// Start an outbound call and resolve to its IVR leg.
    ///
    /// Fails with a timeout when the engine never issues the matching route
    /// request.
    pub async fn make_call(&self, dest: Destination) -> PbxResult<Ivr> {
        self.request(|done| Op::MakeCall { dest, done }).await
    }

    /// Route literal for a registered, unexpired local user, or `None`.
    pub async fn local_route(&self, caller: &str, called: &str) -> PbxResult<Option<LocalRoute>> {
        let (tx, rx) = oneshot::channel();
        self.send(Op::LocalRoute {
            caller: caller.to_string(),
            called: called.to_string(),
            done: tx,
        })?;
        rx.await.map_err(|_| PbxError::Destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = PbxConfig::new(5040);
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 5040);
        assert_eq!(cfg.reconnect_interval, Some(Duration::from_secs(5)));
        assert_eq!(cfg.authenticate_timeout, Duration::from_secs(5));
        assert_eq!(cfg.call_timeout, Duration::from_secs(7200));
        assert_eq!(cfg.call_setup_timeout, Duration::from_secs(70));
        assert!(!cfg.allow_unregistered);
        assert!(cfg.rtp_forward);
        assert!(cfg.authenticator.is_none());
    }

    #[tokio::test]
    async fn test_zero_port_refused() {
        let err = Pbx::new(PbxConfig::new(0)).err();
        assert!(matches!(err, Some(PbxError::Config { .. })));
    }

    #[tokio::test]
    async fn test_destroy_then_operations_fail() {
        let (pbx, _events) = Pbx::new(PbxConfig::new(5040)).unwrap();
        assert!(!pbx.ready());
        pbx.destroy().unwrap();
        // the engine task exits; subsequent commands report destruction
        tokio::task::yield_now().await;
        let mut failed = false;
        for _ in 0..50 {
            if pbx.set_carriers(vec![]).await.is_err() {
                failed = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(failed, "operations should fail after destroy");
    }

    #[test]
    fn test_config_debug_hides_authenticator() {
        let cfg = PbxConfig::new(1234);
        let debug = format!("{:?}", cfg);
        assert!(debug.contains("authenticator: false"));
    }
}
