//! Per-call channel handle and disconnect causes

use crate::engine::{ChannelSnapshot, Op};
use crate::error::{PbxError, PbxResult};
use crate::fork::{Destination, ForkRoute};
use crate::ivr::Ivr;
use crate::message::Message;
use crate::sip;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Why a call ended: a SIP code plus its reason phrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cause {
    pub code: u16,
    pub text: String,
}

impl Cause {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Cause {
            code,
            text: text.into(),
        }
    }

    /// The cause of a call that ran its course.
    pub fn normal_clearing() -> Self {
        Cause::new(200, "Normal call clearing")
    }

    /// Extract a cause from a `chan.hangup` notification.
    ///
    /// Precedence: a `status` phrase that maps to a known code, then a
    /// `reason`/`reason_sip` phrase, then a numeric `cause_sip`. The engine's
    /// shorthand `"hangup"` reads as `"Request Terminated"`.
    pub fn from_hangup(msg: &Message) -> Self {
        let normalize = |phrase: &str| -> String {
            if phrase == "hangup" {
                "Request Terminated".to_string()
            } else {
                phrase.to_string()
            }
        };

        if let Some(status) = msg.param("status") {
            let status = normalize(status);
            if let Some(code) = sip::code_for_phrase(&status) {
                return Cause::new(code, status);
            }
        }
        if let Some(reason) = msg.param("reason").or_else(|| msg.param("reason_sip")) {
            let reason = normalize(reason);
            if let Some(code) = sip::code_for_phrase(&reason) {
                return Cause::new(code, reason);
            }
        }
        if let Some(code) = msg.param("cause_sip").and_then(|s| s.parse::<u16>().ok()) {
            let text = sip::phrase_for_code(code).unwrap_or("Request Terminated");
            return Cause::new(code, text);
        }
        Cause::default()
    }
}

impl Default for Cause {
    fn default() -> Self {
        Cause::new(487, "Request Terminated")
    }
}

impl std::fmt::Display for Cause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Events a channel delivers to its host subscriber.
#[derive(Debug)]
#[non_exhaustive]
pub enum ChannelEvent {
    /// A peer leg connected; the two channels are now bridged.
    Peer(Channel),
    /// A fork leg started dialing.
    Fork {
        channel: Channel,
        route: ForkRoute,
    },
    /// Observed on a `fork/<n>` master channel: one of its slave legs
    /// connected. Carries the slave index.
    SlaveConnected(String),
    /// The duration timer fired; the engine has been told to drop the call.
    Timeout,
    /// In-band digit from the remote party.
    Dtmf(String),
    /// The IVR sound queue drained (or was truncated by hangup).
    QueueEmpty,
    /// Terminal event: the channel ended with the reconciled cause.
    End(Cause),
}

/// Stream of [`ChannelEvent`]s for one channel.
///
/// Dropped by the session when the channel hangs up; `recv` then returns
/// `None`.
pub struct ChannelEvents {
    pub(crate) rx: mpsc::Receiver<ChannelEvent>,
}

impl ChannelEvents {
    /// Receive the next event, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for ChannelEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEvents").finish()
    }
}

impl futures_util::Stream for ChannelEvents {
    type Item = ChannelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Handle to one engine channel (one leg of a call).
///
/// Clones address the same channel. All operations are rejected once the
/// channel has terminated, except cause queries and [`wait_end`](Self::wait_end).
#[derive(Clone)]
pub struct Channel {
    pub(crate) id: String,
    pub(crate) ops: mpsc::UnboundedSender<Op>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("id", &self.id).finish()
    }
}

impl Channel {
    /// The engine's identifier for this leg (e.g. `sip/42`).
    pub fn id(&self) -> &str {
        &self.id
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<PbxResult<T>>) -> Op) -> PbxResult<T> {
        let (tx, rx) = oneshot::channel();
        self.ops.send(make(tx)).map_err(|_| PbxError::Destroyed)?;
        rx.await.map_err(|_| PbxError::Destroyed)?
    }

    async fn snapshot(&self) -> PbxResult<ChannelSnapshot> {
        self.request(|done| Op::ChannelInfo {
            id: self.id.clone(),
            done,
        })
        .await
    }

    /// Answer the pending route by forking to the destination's routes.
    ///
    /// Requires a live channel in routing mode that has not been routed yet.
    pub async fn route_to_destination(&self, dest: Destination) -> PbxResult<()> {
        self.request(|done| Op::RouteToDestination {
            id: self.id.clone(),
            dest,
            done,
        })
        .await
    }

    /// Answer the pending route with a dumb peer and attach an IVR to it.
    ///
    /// Resolves with the [`Ivr`] once the dumb leg connects; fails if the
    /// channel hangs up first.
    pub async fn route_to_ivr(&self) -> PbxResult<Ivr> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(Op::RouteToIvr {
                id: self.id.clone(),
                done: tx,
            })
            .map_err(|_| PbxError::Destroyed)?;
        rx.await.map_err(|_| PbxError::ChannelTerminated {
            id: self.id.clone(),
        })?
    }

    /// Bridge this channel to another live channel.
    pub async fn connect_to(&self, peer: &Channel) -> PbxResult<()> {
        self.request(|done| Op::ConnectChannels {
            id: self.id.clone(),
            peer: peer.id.clone(),
            done,
        })
        .await
    }

    /// Arm (or re-arm) the duration timer.
    ///
    /// When it fires, the channel emits [`ChannelEvent::Timeout`] and the
    /// engine is told to drop the call with reason `Payment Required`.
    pub async fn set_timeout(&self, timeout: Duration) -> PbxResult<()> {
        let ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self.request(|done| Op::SetChannelTimeout {
            id: self.id.clone(),
            ms,
            done,
        })
        .await
    }

    /// Terminate the call with the given cause. Idempotent.
    pub async fn terminate(&self, cause: Cause) -> PbxResult<()> {
        self.request(|done| Op::Terminate {
            id: self.id.clone(),
            cause,
            done,
        })
        .await
    }

    /// Record one or both legs of the call into wave files.
    ///
    /// Paths must be absolute; `maxlen` caps the recording in bytes.
    pub async fn record_audio(
        &self,
        call: Option<&str>,
        peer: Option<&str>,
        maxlen: Option<u64>,
    ) -> PbxResult<()> {
        self.request(|done| Op::RecordAudio {
            id: self.id.clone(),
            call: call.map(str::to_string),
            peer: peer.map(str::to_string),
            maxlen,
            done,
        })
        .await
    }

    /// Connected time of the call; zero if it never connected.
    pub async fn duration(&self) -> PbxResult<Duration> {
        Ok(self.snapshot().await?.duration)
    }

    /// The peered channel, if a symmetric peer link is established.
    pub async fn peer(&self) -> PbxResult<Option<Channel>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.peer.map(|id| Channel {
            id,
            ops: self.ops.clone(),
        }))
    }

    /// Calling party from the originating route, if known.
    pub async fn caller(&self) -> PbxResult<Option<String>> {
        Ok(self.snapshot().await?.caller)
    }

    /// The reconciled disconnect cause.
    ///
    /// A call with positive duration always reports `200 Normal call
    /// clearing`; a `487` whose peer saved its own cause reports the peer's.
    pub async fn disconnect_cause(&self) -> PbxResult<Cause> {
        Ok(self.snapshot().await?.cause)
    }

    /// Subscribe to this channel's events.
    ///
    /// Fails with [`PbxError::ChannelTerminated`] once the channel has ended;
    /// use [`wait_end`](Self::wait_end) for the terminal cause instead.
    pub async fn events(&self) -> PbxResult<ChannelEvents> {
        let rx = self
            .request(|done| Op::Subscribe {
                id: self.id.clone(),
                done,
            })
            .await?;
        Ok(ChannelEvents { rx })
    }

    /// Wait for the channel to end, returning the reconciled cause.
    ///
    /// Resolves immediately when the channel has already terminated.
    pub async fn wait_end(&self) -> PbxResult<Cause> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(Op::WaitEnd {
                id: self.id.clone(),
                done: tx,
            })
            .map_err(|_| PbxError::Destroyed)?;
        rx.await.map_err(|_| PbxError::ChannelTerminated {
            id: self.id.clone(),
        })
    }
}
