//! IVR channel specialization
//!
//! An [`Ivr`] is a channel with a serialized sound queue: wave files and
//! timed tones are drained FIFO with at most one item playing. The queue
//! machinery lives in the session so a hangup can truncate it and still
//! deliver the queue-empty notification before the channel's subscribers
//! are cleared.

use crate::channel::{Cause, Channel, ChannelEvents};
use crate::engine::Op;
use crate::error::{PbxError, PbxResult};
use crate::fork::Destination;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;

/// One queued sound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sound {
    /// A wave file played from an absolute path.
    File { path: String },
    /// A named tone generator run for a fixed duration.
    Tone { name: String, ms: u64 },
}

impl Sound {
    /// A wave file sound.
    pub fn file(path: impl Into<String>) -> Self {
        Sound::File { path: path.into() }
    }

    /// A timed tone sound.
    pub fn tone(name: impl Into<String>, ms: u64) -> Self {
        Sound::Tone {
            name: name.into(),
            ms,
        }
    }

    /// Shape check applied at enqueue time.
    pub(crate) fn validate(&self) -> Result<(), String> {
        match self {
            Sound::File { path } if path.is_empty() => Err("empty file path".to_string()),
            Sound::Tone { name, .. } if name.is_empty() => Err("empty tone name".to_string()),
            Sound::Tone { ms: 0, .. } => Err("tone duration must be positive".to_string()),
            _ => Ok(()),
        }
    }

    /// Playability check applied when the item reaches the queue head.
    pub(crate) fn playable(&self) -> bool {
        match self {
            Sound::File { path } => path.starts_with('/'),
            Sound::Tone { name, ms } => !name.is_empty() && *ms > 0,
        }
    }
}

/// An IVR session: a [`Channel`] plus its sound queue.
#[derive(Debug, Clone)]
pub struct Ivr {
    channel: Channel,
}

impl Ivr {
    pub(crate) fn new(channel: Channel) -> Self {
        Ivr { channel }
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// The engine's identifier for the IVR leg.
    pub fn id(&self) -> &str {
        self.channel.id()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<PbxResult<T>>) -> Op) -> PbxResult<T> {
        let (tx, rx) = oneshot::channel();
        self.channel
            .ops
            .send(make(tx))
            .map_err(|_| PbxError::Destroyed)?;
        rx.await.map_err(|_| PbxError::Destroyed)?
    }

    /// Append a sound to the queue.
    ///
    /// Playback starts immediately when this is the first item and a peer is
    /// already connected, otherwise when the peer event fires.
    pub async fn enqueue(&self, sound: Sound) -> PbxResult<()> {
        if let Err(message) = sound.validate() {
            return Err(PbxError::InvalidSound { message });
        }
        self.request(|done| Op::Enqueue {
            id: self.channel.id.clone(),
            sound,
            done,
        })
        .await
    }

    /// Play a named tone.
    ///
    /// With a duration the tone is queued like any other sound; without one
    /// the generator is attached directly and plays until replaced.
    pub async fn play_tone(&self, name: &str, ms: Option<u64>) -> PbxResult<()> {
        match ms {
            Some(ms) => self.enqueue(Sound::tone(name, ms)).await,
            None => {
                self.request(|done| Op::AttachTone {
                    id: self.channel.id.clone(),
                    name: name.to_string(),
                    done,
                })
                .await
            }
        }
    }

    // Channel surface, forwarded.

    /// See [`Channel::route_to_destination`].
    pub async fn route_to_destination(&self, dest: Destination) -> PbxResult<()> {
        self.channel.route_to_destination(dest).await
    }

    /// See [`Channel::connect_to`].
    pub async fn connect_to(&self, peer: &Channel) -> PbxResult<()> {
        self.channel.connect_to(peer).await
    }

    /// See [`Channel::set_timeout`].
    pub async fn set_timeout(&self, timeout: Duration) -> PbxResult<()> {
        self.channel.set_timeout(timeout).await
    }

    /// See [`Channel::terminate`].
    pub async fn terminate(&self, cause: Cause) -> PbxResult<()> {
        self.channel.terminate(cause).await
    }

    /// See [`Channel::record_audio`].
    pub async fn record_audio(
        &self,
        call: Option<&str>,
        peer: Option<&str>,
        maxlen: Option<u64>,
    ) -> PbxResult<()> {
        self.channel.record_audio(call, peer, maxlen).await
    }

    /// See [`Channel::duration`].
    pub async fn duration(&self) -> PbxResult<Duration> {
        self.channel.duration().await
    }

    /// See [`Channel::peer`].
    pub async fn peer(&self) -> PbxResult<Option<Channel>> {
        self.channel.peer().await
    }

    /// See [`Channel::caller`].
    pub async fn caller(&self) -> PbxResult<Option<String>> {
        self.channel.caller().await
    }

    /// See [`Channel::disconnect_cause`].
    pub async fn disconnect_cause(&self) -> PbxResult<Cause> {
        self.channel.disconnect_cause().await
    }

    /// See [`Channel::events`].
    pub async fn events(&self) -> PbxResult<ChannelEvents> {
        self.channel.events().await
    }

    /// See [`Channel::wait_end`].
    pub async fn wait_end(&self) -> PbxResult<Cause> {
        self.channel.wait_end().await
    }
}
