//! The session engine
//!
//! One task owns every piece of mutable session state: the socket halves,
//! the handshake counters, the channel table, the per-channel subscriber
//! lists, the carrier and user registries and the outgoing-call table. All
//! stimuli (decoded lines, handle commands, timer firings) arrive as
//! [`Op`]s on a single queue, which gives frames their receive-order
//! delivery and subscribers their registration-order invocation without any
//! locking.
//!
//! Timers are spawned sleeps that re-enter the queue with a generation
//! number; re-arming or cancelling bumps the generation so a stale firing
//! is ignored on receipt.

use crate::auth::{AuthRequest, Authenticator};
use crate::carrier::{self, CarrierAction, CarrierState, Trunk};
use crate::channel::{Cause, Channel, ChannelEvent};
use crate::codec::{self, Frame};
use crate::constants::*;
use crate::error::{PbxError, PbxResult};
use crate::fork::{self, Destination, ForkRoute};
use crate::ivr::{Ivr, Sound};
use crate::message::Message;
use crate::pbx::{CallInfo, PbxConfig, PbxEvent};
use crate::transport::{self, LineWriter};
use crate::users::{LocalRoute, LocalUsers, Lookup};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Everything that can happen to the session, serialized on one queue.
pub(crate) enum Op {
    Connect,
    Destroy,
    Line {
        socket: u64,
        line: String,
    },
    SocketClosed {
        socket: u64,
        error: Option<String>,
    },
    Reconnect {
        socket: u64,
    },
    SetCarriers {
        trunks: Vec<Trunk>,
        done: oneshot::Sender<PbxResult<()>>,
    },
    SetAuthenticator {
        authenticator: Arc<dyn Authenticator>,
    },
    MakeCall {
        dest: Destination,
        done: oneshot::Sender<PbxResult<Ivr>>,
    },
    LocalRoute {
        caller: String,
        called: String,
        done: oneshot::Sender<Option<LocalRoute>>,
    },
    AuthResult {
        id: String,
        allow: bool,
        error: Option<String>,
    },
    OutgoingInitTimeout {
        call_id: String,
    },
    ChannelTimer {
        id: String,
        gen: u64,
    },
    ToneTimer {
        id: String,
        gen: u64,
    },
    IvrPeerReady {
        caller: String,
        dumb: String,
    },
    RouteToDestination {
        id: String,
        dest: Destination,
        done: oneshot::Sender<PbxResult<()>>,
    },
    RouteToIvr {
        id: String,
        done: oneshot::Sender<PbxResult<Ivr>>,
    },
    ConnectChannels {
        id: String,
        peer: String,
        done: oneshot::Sender<PbxResult<()>>,
    },
    SetChannelTimeout {
        id: String,
        ms: u64,
        done: oneshot::Sender<PbxResult<()>>,
    },
    Terminate {
        id: String,
        cause: Cause,
        done: oneshot::Sender<PbxResult<()>>,
    },
    ChannelInfo {
        id: String,
        done: oneshot::Sender<PbxResult<ChannelSnapshot>>,
    },
    RecordAudio {
        id: String,
        call: Option<String>,
        peer: Option<String>,
        maxlen: Option<u64>,
        done: oneshot::Sender<PbxResult<()>>,
    },
    Subscribe {
        id: String,
        done: oneshot::Sender<PbxResult<mpsc::Receiver<ChannelEvent>>>,
    },
    WaitEnd {
        id: String,
        done: oneshot::Sender<Cause>,
    },
    Enqueue {
        id: String,
        sound: Sound,
        done: oneshot::Sender<PbxResult<()>>,
    },
    AttachTone {
        id: String,
        name: String,
        done: oneshot::Sender<PbxResult<()>>,
    },
}

/// Point-in-time view of one channel, for handle queries.
#[derive(Debug, Clone)]
pub(crate) struct ChannelSnapshot {
    pub duration: Duration,
    pub peer: Option<String>,
    pub caller: Option<String>,
    pub cause: Cause,
}

/// Keys of the per-channel fan-out table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum EventKey {
    Connected,
    ConnectedOnce,
    ConnectedAsPeer,
    ConnectedAsPeerOnce,
    SlaveConnected,
    Hangup,
    Notify,
    Dtmf,
    Execute,
    ExecuteFork,
    Peer,
    Fork,
    Timeout,
    End,
    QueueEmpty,
}

impl EventKey {
    fn is_once(self) -> bool {
        matches!(self, EventKey::ConnectedOnce | EventKey::ConnectedAsPeerOnce)
    }
}

/// Payload handed to fan-out subscribers.
enum FanArg {
    Msg(Message),
    PeerId(String),
    ForkLeg { channel_id: String, route: ForkRoute },
    Cause(Cause),
    Text(String),
    Empty,
}

type Handler = Box<dyn FnMut(&mut Engine, &FanArg) + Send>;

struct ChannelState {
    caller: Option<String>,
    /// The pending `call.route` request; consumed when the reply goes out.
    call_route: Option<Message>,
    routing_mode: bool,
    routed: bool,
    terminated: bool,
    peer: Option<String>,
    connect_time: Option<Instant>,
    disconnect_time: Option<Instant>,
    saved_cause: Option<Cause>,
    final_cause: Option<Cause>,
    timer: Option<JoinHandle<()>>,
    timer_gen: u64,
    subs_epoch: u64,
    rtp_forward: bool,
}

impl ChannelState {
    fn routing(call_route: Message, caller: Option<String>, rtp_forward: bool) -> Self {
        ChannelState {
            caller,
            call_route: Some(call_route),
            routing_mode: true,
            rtp_forward,
            ..ChannelState::peer_mode()
        }
    }

    fn peer_mode() -> Self {
        ChannelState {
            caller: None,
            call_route: None,
            routing_mode: false,
            routed: false,
            terminated: false,
            peer: None,
            connect_time: None,
            disconnect_time: None,
            saved_cause: None,
            final_cause: None,
            timer: None,
            timer_gen: 0,
            subs_epoch: 0,
            rtp_forward: false,
        }
    }

    fn duration(&self) -> Duration {
        match (self.connect_time, self.disconnect_time) {
            (Some(connected), Some(disconnected)) => {
                disconnected.saturating_duration_since(connected)
            }
            (Some(connected), None) => connected.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

struct IvrState {
    queue: VecDeque<Sound>,
    playing: bool,
    tone_timer: Option<JoinHandle<()>>,
    tone_gen: u64,
}

struct OutgoingCall {
    dest: Destination,
    done: oneshot::Sender<PbxResult<Ivr>>,
    timer: JoinHandle<()>,
}

struct PendingLogin {
    account: String,
    logout: bool,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Push an event onto a host-facing channel stream, dropping on overflow.
fn forward(tx: &mpsc::Sender<ChannelEvent>, event: ChannelEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        warn!("channel event stream full, dropping {:?}", event);
    }
}

pub(crate) struct Engine {
    cfg: PbxConfig,
    ops: UnboundedSender<Op>,
    ops_weak: WeakUnboundedSender<Op>,
    events: mpsc::Sender<PbxEvent>,
    ready_tx: watch::Sender<bool>,
    authenticator: Option<Arc<dyn Authenticator>>,

    socket_gen: u64,
    writer: Option<LineWriter>,
    reader_task: Option<JoinHandle<()>>,
    initialized: bool,
    confirms_needed: usize,
    confirms_seen: usize,
    destroyed: bool,
    outbox: VecDeque<(String, bool)>,

    channels: HashMap<String, ChannelState>,
    finished_order: VecDeque<String>,
    subs: HashMap<(String, EventKey), Vec<Handler>>,
    ivrs: HashMap<String, IvrState>,
    carriers: HashMap<String, CarrierState>,
    pending_logins: HashMap<String, PendingLogin>,
    pending_auth: HashMap<String, Message>,
    users: LocalUsers,
    outgoing: HashMap<String, OutgoingCall>,
}

impl Engine {
    pub fn new(
        cfg: PbxConfig,
        ops: UnboundedSender<Op>,
        events: mpsc::Sender<PbxEvent>,
        ready_tx: watch::Sender<bool>,
    ) -> Self {
        let authenticator = cfg.authenticator.clone();
        let ops_weak = ops.downgrade();
        Engine {
            cfg,
            ops,
            ops_weak,
            events,
            ready_tx,
            authenticator,
            socket_gen: 0,
            writer: None,
            reader_task: None,
            initialized: false,
            confirms_needed: 0,
            confirms_seen: 0,
            destroyed: false,
            outbox: VecDeque::new(),
            channels: HashMap::new(),
            finished_order: VecDeque::new(),
            subs: HashMap::new(),
            ivrs: HashMap::new(),
            carriers: HashMap::new(),
            pending_logins: HashMap::new(),
            pending_auth: HashMap::new(),
            users: LocalUsers::default(),
            outgoing: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut rx: UnboundedReceiver<Op>) {
        while let Some(op) = rx.recv().await {
            self.handle_op(op).await;
            if self.destroyed {
                break;
            }
        }
        self.detach_socket();
        debug!("engine task exiting");
    }

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::Connect => self.do_connect().await,
            Op::Reconnect { socket } => {
                if !self.destroyed && socket == self.socket_gen && self.writer.is_none() {
                    info!("reconnecting");
                    self.do_connect().await;
                }
            }
            other => self.handle_sync(other),
        }
        self.flush_outbox().await;
    }

    fn handle_sync(&mut self, op: Op) {
        match op {
            Op::Connect | Op::Reconnect { .. } => {}
            Op::Destroy => self.do_destroy(),
            Op::Line { socket, line } => self.on_line(socket, line),
            Op::SocketClosed { socket, error } => {
                if socket == self.socket_gen {
                    self.handle_socket_down(error);
                }
            }
            Op::SetCarriers { trunks, done } => {
                self.apply_carriers(trunks);
                let _ = done.send(Ok(()));
            }
            Op::SetAuthenticator { authenticator } => {
                self.authenticator = Some(authenticator);
            }
            Op::MakeCall { dest, done } => self.make_call(dest, done),
            Op::LocalRoute {
                caller,
                called,
                done,
            } => {
                let route = self.local_route(&caller, &called);
                let _ = done.send(route);
            }
            Op::AuthResult { id, allow, error } => self.finish_auth(&id, allow, error),
            Op::OutgoingInitTimeout { call_id } => {
                if let Some(out) = self.outgoing.remove(&call_id) {
                    warn!("outgoing call {} never produced a route", call_id);
                    self.emit(PbxEvent::Error(format!(
                        "outgoing call {} timed out waiting for its route",
                        call_id
                    )));
                    let _ = out.done.send(Err(PbxError::Timeout {
                        timeout_ms: OUTGOING_CALL_INIT_TIMEOUT_MS,
                    }));
                }
            }
            Op::ChannelTimer { id, gen } => self.on_channel_timer(&id, gen),
            Op::ToneTimer { id, gen } => self.on_tone_timer(&id, gen),
            Op::IvrPeerReady { caller, dumb } => self.on_ivr_peer_ready(&caller, &dumb),
            Op::RouteToDestination { id, dest, done } => {
                let _ = done.send(self.route_to_destination(&id, dest));
            }
            Op::RouteToIvr { id, done } => self.route_to_ivr(&id, done),
            Op::ConnectChannels { id, peer, done } => {
                let _ = done.send(self.connect_channels(&id, &peer));
            }
            Op::SetChannelTimeout { id, ms, done } => {
                let _ = done.send(self.set_channel_timeout(&id, ms));
            }
            Op::Terminate { id, cause, done } => {
                self.terminate_channel(&id, cause);
                let _ = done.send(Ok(()));
            }
            Op::ChannelInfo { id, done } => {
                let _ = done.send(self.channel_snapshot(&id));
            }
            Op::RecordAudio {
                id,
                call,
                peer,
                maxlen,
                done,
            } => {
                let _ = done.send(self.record_audio(&id, call, peer, maxlen));
            }
            Op::Subscribe { id, done } => {
                let _ = done.send(self.subscribe_channel(&id));
            }
            Op::WaitEnd { id, done } => self.wait_end(&id, done),
            Op::Enqueue { id, sound, done } => {
                let _ = done.send(self.ivr_enqueue(&id, sound));
            }
            Op::AttachTone { id, name, done } => {
                let _ = done.send(self.ivr_attach_tone(&id, &name));
            }
        }
    }

    // ---- transport & handshake ----

    async fn do_connect(&mut self) {
        if self.destroyed {
            return;
        }
        self.detach_socket();
        self.socket_gen += 1;
        let socket = self.socket_gen;
        match transport::dial(&self.cfg.host, self.cfg.port).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                self.writer = Some(LineWriter::new(write_half));
                self.reader_task = Some(transport::spawn_reader(
                    read_half,
                    socket,
                    self.ops_weak.clone(),
                ));
                self.emit(PbxEvent::Connect);
                self.start_handshake();
            }
            Err(e) => {
                self.emit(PbxEvent::Error(format!("connect failed: {}", e)));
                self.schedule_reconnect();
            }
        }
    }

    /// Drop the current socket without notifying anyone.
    ///
    /// A stale reader keeps sending its own generation, which the line
    /// handler discards, so aborting it is a formality.
    fn detach_socket(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer = None;
        self.initialized = false;
        let _ = self.ready_tx.send(false);
    }

    fn start_handshake(&mut self) {
        self.queue_line(codec::encode_connect(CONNECT_ROLE), true);
        for (name, _) in INSTALLED_MESSAGES {
            self.queue_line(codec::encode_uninstall(name), true);
        }
        for name in WATCHED_MESSAGES {
            self.queue_line(codec::encode_unwatch(name), true);
        }
        for (name, priority) in INSTALLED_MESSAGES {
            self.queue_line(codec::encode_install(name, Some(*priority)), true);
        }
        for name in WATCHED_MESSAGES {
            self.queue_line(codec::encode_watch(name), true);
        }
        self.confirms_needed = INSTALLED_MESSAGES.len() + WATCHED_MESSAGES.len();
        self.confirms_seen = 0;
    }

    fn note_confirm(&mut self) {
        if self.initialized {
            return;
        }
        self.confirms_seen += 1;
        if self.confirms_needed > 0 && self.confirms_seen >= self.confirms_needed {
            self.initialized = true;
            let _ = self.ready_tx.send(true);
            info!("handshake complete, session ready");
            self.emit(PbxEvent::Connected);
            let desired: Vec<Trunk> = self.carriers.values().map(|c| c.trunk.clone()).collect();
            self.apply_carriers(desired);
        }
    }

    fn handle_socket_down(&mut self, error: Option<String>) {
        if let Some(error) = error {
            self.emit(PbxEvent::Error(format!("socket error: {}", error)));
        }
        self.detach_socket();
        self.confirms_needed = 0;
        self.confirms_seen = 0;
        self.pending_logins.clear();
        self.pending_auth.clear();
        for carrier in self.carriers.values_mut() {
            carrier.active = false;
        }
        for (call_id, out) in self.outgoing.drain() {
            out.timer.abort();
            debug!("failing outgoing call {} on disconnect", call_id);
            let _ = out.done.send(Err(PbxError::ConnectionClosed));
        }
        let live: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, c)| !c.terminated)
            .map(|(id, _)| id.clone())
            .collect();
        for id in live {
            self.do_terminate(&id, Cause::default());
        }
        self.emit(PbxEvent::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.destroyed {
            return;
        }
        let Some(interval) = self.cfg.reconnect_interval else {
            debug!("reconnect disabled, session stays down");
            return;
        };
        if interval.is_zero() {
            return;
        }
        let socket = self.socket_gen;
        let ops = self.ops_weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(ops) = ops.upgrade() {
                let _ = ops.send(Op::Reconnect { socket });
            }
        });
    }

    fn do_destroy(&mut self) {
        if self.destroyed {
            return;
        }
        info!("destroying session");
        self.destroyed = true;
        self.detach_socket();
        for (_, out) in self.outgoing.drain() {
            out.timer.abort();
            let _ = out.done.send(Err(PbxError::Destroyed));
        }
        let live: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, c)| !c.terminated)
            .map(|(id, _)| id.clone())
            .collect();
        for id in live {
            self.do_terminate(&id, Cause::default());
        }
        self.emit(PbxEvent::Disconnected);
    }

    fn queue_line(&mut self, line: String, force: bool) {
        self.outbox.push_back((line, force));
    }

    async fn flush_outbox(&mut self) {
        while let Some((line, force)) = self.outbox.pop_front() {
            let can_send = self.writer.is_some() && (force || self.initialized);
            if !can_send {
                trace!("suppressing line: {}", line);
                self.emit(PbxEvent::SuppressLine(line));
                continue;
            }
            let result = match self.writer.as_mut() {
                Some(writer) => writer.write_line(&line).await,
                None => continue,
            };
            match result {
                Ok(()) => {
                    self.emit(PbxEvent::SendLine(line));
                }
                Err(e) => {
                    warn!("write failed: {}", e);
                    self.handle_socket_down(Some(e.to_string()));
                    // remaining lines drain through the suppress path
                }
            }
        }
    }

    // ---- line routing ----

    fn on_line(&mut self, socket: u64, line: String) {
        if socket != self.socket_gen {
            trace!("dropping line from stale socket {}", socket);
            return;
        }
        self.emit(PbxEvent::RecvLine(line.clone()));
        match codec::decode(&line) {
            Ok(Frame::Message(msg)) => {
                if msg.is_request() {
                    self.on_request(msg);
                } else {
                    self.on_reply(msg);
                }
            }
            Ok(Frame::InstallReply {
                priority,
                name,
                success,
            }) => {
                self.emit(PbxEvent::InstallConfirm {
                    name,
                    priority,
                    success,
                });
                self.note_confirm();
            }
            Ok(Frame::WatchReply { name, success }) => {
                self.emit(PbxEvent::WatchConfirm { name, success });
                self.note_confirm();
            }
            Ok(Frame::UninstallReply) | Ok(Frame::UnwatchReply) => {
                self.emit(PbxEvent::SuppressLine(line));
            }
            Err(e) => {
                self.emit(PbxEvent::Error(format!("bad line: {}", e)));
            }
        }
    }

    fn on_request(&mut self, msg: Message) {
        match msg.name() {
            "call.route" => self.handle_call_route(msg),
            "user.auth" => self.handle_user_auth(msg),
            "user.register" => self.handle_user_register(msg),
            name => {
                debug!("auto-replying unhandled installed message {}", name);
                let reply = msg.to_reply(false);
                self.queue_line(codec::encode_message(&reply), true);
                self.emit(PbxEvent::ReplyUnhandled(msg));
            }
        }
    }

    fn on_reply(&mut self, msg: Message) {
        if let Some(pending) = self.pending_logins.remove(msg.id()) {
            if !pending.logout {
                let processed = msg.processed() == Some(true);
                if let Some(carrier) = self.carriers.get_mut(&pending.account) {
                    carrier.active = processed;
                }
            }
            return;
        }
        match msg.name() {
            "chan.connected" => self.on_chan_connected(msg),
            "chan.hangup" => self.on_chan_hangup(msg),
            "chan.notify" => {
                if let Some(target) = msg.param("targetid").map(str::to_string) {
                    self.fire(&target, EventKey::Notify, &FanArg::Msg(msg));
                }
            }
            "chan.dtmf" => {
                if let Some(id) = msg.param("id").map(str::to_string) {
                    let text = msg.param("text").unwrap_or("").to_string();
                    self.fire(&id, EventKey::Dtmf, &FanArg::Text(text));
                }
            }
            "call.execute" => self.on_call_execute(msg),
            "user.unregister" => {
                if let Some(username) = msg.param("username").map(str::to_string) {
                    if self.users.unregister(&username) {
                        self.emit(PbxEvent::UserUnregister { username });
                    }
                }
            }
            "user.notify" => self.on_user_notify(&msg),
            "user.login" => {
                // other modules' registrations, observe-only
            }
            name => {
                trace!("ignoring reply for {}", name);
            }
        }
    }

    fn on_chan_connected(&mut self, msg: Message) {
        if let Some(id) = msg.param("id").map(str::to_string) {
            self.fire(&id, EventKey::Connected, &FanArg::Msg(msg.clone()));
            self.fire(&id, EventKey::ConnectedOnce, &FanArg::Msg(msg.clone()));
        }
        if let Some(peerid) = msg.param("peerid").map(str::to_string) {
            self.fire(&peerid, EventKey::ConnectedAsPeer, &FanArg::Msg(msg.clone()));
            self.fire(
                &peerid,
                EventKey::ConnectedAsPeerOnce,
                &FanArg::Msg(msg.clone()),
            );
            // a connected fork slave also notifies its master
            if let Some(rest) = peerid.strip_prefix("fork/") {
                let mut parts = rest.splitn(2, '/');
                if let (Some(master_index), Some(slave_index)) = (parts.next(), parts.next()) {
                    let master = format!("fork/{}", master_index);
                    self.fire(
                        &master,
                        EventKey::SlaveConnected,
                        &FanArg::Text(slave_index.to_string()),
                    );
                }
            }
        }
    }

    fn on_chan_hangup(&mut self, msg: Message) {
        let Some(id) = msg.param("id").map(str::to_string) else {
            return;
        };
        let cause = Cause::from_hangup(&msg);
        debug!("chan.hangup for {}: {}", id, cause);
        if let Some(chan) = self.channels.get_mut(&id) {
            if chan.saved_cause.is_none() {
                chan.saved_cause = Some(cause.clone());
            }
        }
        self.fire(&id, EventKey::Hangup, &FanArg::Msg(msg));
        self.do_terminate(&id, cause);
    }

    fn on_call_execute(&mut self, msg: Message) {
        if let Some(id) = msg.param("id").map(str::to_string) {
            self.fire(&id, EventKey::Execute, &FanArg::Msg(msg.clone()));
        }
        if let Some(origid) = msg.param("fork.origid").map(str::to_string) {
            self.fire(&origid, EventKey::ExecuteFork, &FanArg::Msg(msg));
        }
    }

    fn on_user_notify(&mut self, msg: &Message) {
        let Some(account) = msg.param("account") else {
            return;
        };
        let Some(carrier) = self.carriers.get_mut(account) else {
            return;
        };
        let registered = msg.param_bool("registered").unwrap_or(false);
        carrier.active = registered;
        let account = account.to_string();
        if registered {
            info!("carrier {} online", account);
            self.emit(PbxEvent::CarrierOnline(account));
        } else {
            info!("carrier {} offline", account);
            self.emit(PbxEvent::CarrierOffline(account));
        }
    }

    // ---- fan-out ----

    fn subscribe(&mut self, id: &str, key: EventKey, handler: Handler) {
        self.subs
            .entry((id.to_string(), key))
            .or_default()
            .push(handler);
    }

    /// Invoke every subscriber for `(id, key)` in registration order.
    ///
    /// The list is taken out for the duration so handlers may subscribe and
    /// fire re-entrantly; survivors are merged back in front of anything
    /// added meanwhile, unless the channel cleared its subscriptions. A
    /// panicking handler is reported as an error event and dropped without
    /// aborting the batch. `*Once` keys consume their whole list.
    fn fire(&mut self, id: &str, key: EventKey, arg: &FanArg) {
        let map_key = (id.to_string(), key);
        let Some(taken) = self.subs.remove(&map_key) else {
            return;
        };
        let epoch = self.channels.get(id).map(|c| c.subs_epoch).unwrap_or(0);
        let mut survivors: Vec<Handler> = Vec::new();
        for mut handler in taken {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&mut *self, arg)));
            if outcome.is_err() {
                warn!("subscriber for {:?} on {} panicked", key, id);
                self.emit(PbxEvent::Error(format!(
                    "subscriber for {:?} on {} panicked",
                    key, id
                )));
                continue;
            }
            if !key.is_once() {
                survivors.push(handler);
            }
        }
        let still_same_epoch =
            self.channels.get(id).map(|c| c.subs_epoch).unwrap_or(0) == epoch;
        if !survivors.is_empty() && still_same_epoch {
            let added = self.subs.remove(&map_key).unwrap_or_default();
            survivors.extend(added);
            self.subs.insert(map_key, survivors);
        }
    }

    fn clear_subs(&mut self, id: &str) {
        self.subs.retain(|(chan_id, _), _| chan_id != id);
        if let Some(chan) = self.channels.get_mut(id) {
            chan.subs_epoch += 1;
        }
    }

    fn emit(&mut self, event: PbxEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("event queue full, dropping {:?}", event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    // ---- channel lifecycle ----

    fn channel_handle(&self, id: &str) -> Channel {
        Channel {
            id: id.to_string(),
            ops: self.ops.clone(),
        }
    }

    fn ensure_peer_channel(&mut self, id: &str) {
        self.channels
            .entry(id.to_string())
            .or_insert_with(ChannelState::peer_mode);
    }

    fn bind_peers(&mut self, a: &str, b: &str) {
        self.ensure_peer_channel(a);
        self.ensure_peer_channel(b);
        let now = Instant::now();
        if let Some(chan) = self.channels.get_mut(a) {
            chan.peer = Some(b.to_string());
            chan.connect_time.get_or_insert(now);
        }
        if let Some(chan) = self.channels.get_mut(b) {
            chan.peer = Some(a.to_string());
            chan.connect_time.get_or_insert(now);
        }
    }

    fn reconciled_cause(&self, id: &str) -> Cause {
        let Some(chan) = self.channels.get(id) else {
            return Cause::default();
        };
        if chan.duration() > Duration::ZERO {
            return Cause::normal_clearing();
        }
        let saved = chan.saved_cause.clone().unwrap_or_default();
        if saved.code == 487 {
            if let Some(peer_cause) = chan
                .peer
                .as_deref()
                .and_then(|peer| self.channels.get(peer))
                .and_then(|peer| peer.saved_cause.clone())
            {
                return peer_cause;
            }
        }
        saved
    }

    /// The idempotent terminal transition.
    fn do_terminate(&mut self, id: &str, cause: Cause) {
        let Some(chan) = self.channels.get_mut(id) else {
            return;
        };
        if chan.terminated {
            return;
        }
        chan.terminated = true;
        if chan.saved_cause.is_none() {
            chan.saved_cause = Some(cause);
        }
        if let Some(timer) = chan.timer.take() {
            timer.abort();
        }
        chan.timer_gen += 1;
        chan.disconnect_time = Some(Instant::now());
        let peer = chan.peer.clone();

        // reconcile while the peer link is still visible
        let final_cause = self.reconciled_cause(id);
        if let Some(chan) = self.channels.get_mut(id) {
            chan.final_cause = Some(final_cause.clone());
            chan.peer = None;
        }
        if let Some(peer_id) = peer {
            if let Some(peer_chan) = self.channels.get_mut(&peer_id) {
                if peer_chan.peer.as_deref() == Some(id) {
                    peer_chan.peer = None;
                }
            }
        }

        // drain the sound queue before anyone hears about the end
        if let Some(mut ivr) = self.ivrs.remove(id) {
            if let Some(timer) = ivr.tone_timer.take() {
                timer.abort();
            }
            if !ivr.queue.is_empty() || ivr.playing {
                ivr.queue.clear();
                self.fire(id, EventKey::QueueEmpty, &FanArg::Empty);
            }
        }

        debug!("channel {} terminated: {}", id, final_cause);
        self.fire(id, EventKey::End, &FanArg::Cause(final_cause));
        self.clear_subs(id);

        self.finished_order.push_back(id.to_string());
        while self.finished_order.len() > FINISHED_CHANNEL_BACKLOG {
            if let Some(old) = self.finished_order.pop_front() {
                if self.channels.get(&old).map(|c| c.terminated).unwrap_or(false) {
                    self.channels.remove(&old);
                }
            }
        }
    }

    /// User-facing termination: run the transition, answer a still-pending
    /// route negatively and ask the engine to drop the leg.
    fn terminate_channel(&mut self, id: &str, cause: Cause) {
        let already_done = self
            .channels
            .get(id)
            .map(|c| c.terminated)
            .unwrap_or(true);
        if already_done {
            return;
        }
        self.do_terminate(id, cause.clone());
        if let Some(route_msg) = self.channels.get_mut(id).and_then(|c| c.call_route.take()) {
            let reply = route_msg.to_reply(false);
            self.queue_line(codec::encode_message(&reply), true);
        }
        let mut drop_msg = Message::request("call.drop");
        drop_msg.set_param("id", id);
        drop_msg.set_param("reason", cause.text);
        self.queue_line(codec::encode_message(&drop_msg), false);
    }

    fn live_channel(&self, id: &str) -> PbxResult<&ChannelState> {
        match self.channels.get(id) {
            Some(chan) if !chan.terminated => Ok(chan),
            _ => Err(PbxError::ChannelTerminated { id: id.to_string() }),
        }
    }

    fn channel_snapshot(&self, id: &str) -> PbxResult<ChannelSnapshot> {
        let chan = self
            .channels
            .get(id)
            .ok_or_else(|| PbxError::ChannelTerminated { id: id.to_string() })?;
        let cause = match &chan.final_cause {
            Some(cause) => cause.clone(),
            None => self.reconciled_cause(id),
        };
        Ok(ChannelSnapshot {
            duration: chan.duration(),
            peer: chan.peer.clone(),
            caller: chan.caller.clone(),
            cause,
        })
    }

    fn arm_channel_timer(&mut self, id: &str, ms: u64) {
        let ops = self.ops_weak.clone();
        let Some(chan) = self.channels.get_mut(id) else {
            return;
        };
        if let Some(timer) = chan.timer.take() {
            timer.abort();
        }
        chan.timer_gen += 1;
        let gen = chan.timer_gen;
        let timer_id = id.to_string();
        chan.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if let Some(ops) = ops.upgrade() {
                let _ = ops.send(Op::ChannelTimer { id: timer_id, gen });
            }
        }));
    }

    fn on_channel_timer(&mut self, id: &str, gen: u64) {
        let valid = self
            .channels
            .get(id)
            .map(|c| !c.terminated && c.timer_gen == gen)
            .unwrap_or(false);
        if !valid {
            return;
        }
        if let Some(chan) = self.channels.get_mut(id) {
            chan.timer = None;
        }
        debug!("duration timer fired for {}", id);
        self.fire(id, EventKey::Timeout, &FanArg::Empty);
        let mut drop_msg = Message::request("call.drop");
        drop_msg.set_param("id", id);
        drop_msg.set_param("reason", "Payment Required");
        self.queue_line(codec::encode_message(&drop_msg), false);
    }

    fn set_channel_timeout(&mut self, id: &str, ms: u64) -> PbxResult<()> {
        self.live_channel(id)?;
        self.arm_channel_timer(id, ms);
        Ok(())
    }

    // ---- routing ----

    fn take_pending_route(&mut self, id: &str) -> PbxResult<(Message, bool)> {
        let chan = match self.channels.get_mut(id) {
            Some(chan) if !chan.terminated => chan,
            _ => return Err(PbxError::ChannelTerminated { id: id.to_string() }),
        };
        if !chan.routing_mode {
            return Err(PbxError::NotRouting { id: id.to_string() });
        }
        if chan.routed {
            return Err(PbxError::AlreadyRouted { id: id.to_string() });
        }
        let Some(route_msg) = chan.call_route.take() else {
            return Err(PbxError::NotRouting { id: id.to_string() });
        };
        chan.routed = true;
        Ok((route_msg, chan.rtp_forward))
    }

    fn route_to_destination(&mut self, id: &str, dest: Destination) -> PbxResult<()> {
        let fallback_caller = self
            .live_channel(id)?
            .caller
            .clone();
        let params = fork::plan(&dest, fallback_caller.as_deref())?;
        let (route_msg, rtp_forward) = self.take_pending_route(id)?;

        let timeout_ms = dest.timeout.unwrap_or(self.cfg.call_timeout.as_millis() as u64);
        let setup_ms = dest
            .setup_timeout
            .unwrap_or(self.cfg.call_setup_timeout.as_millis() as u64);

        let mut reply = route_msg.to_reply(true);
        reply.set_retvalue("fork");
        for (key, value) in params {
            reply.set_param(key, value);
        }
        // the engine folds setup into the cap; a precise timer takes over
        // after connect
        reply.set_param("maxcall", setup_ms.to_string());
        reply.set_param("timeout", (timeout_ms + setup_ms).to_string());
        if rtp_forward {
            reply.set_param("rtp_forward", "yes");
        }
        self.queue_line(codec::encode_message(&reply), true);

        let parent = id.to_string();
        let routes = dest.routes.clone();
        let mut leg_index = 0usize;
        self.subscribe(
            id,
            EventKey::ExecuteFork,
            Box::new(move |eng, arg| {
                let FanArg::Msg(msg) = arg else {
                    return;
                };
                let Some(fork_id) = msg.param("peerid").map(str::to_string) else {
                    eng.emit(PbxEvent::Error(format!(
                        "fork leg for {} started without a peerid",
                        parent
                    )));
                    return;
                };
                let route = routes
                    .get(leg_index.min(routes.len().saturating_sub(1)))
                    .cloned()
                    .unwrap_or_default();
                leg_index += 1;

                eng.ensure_peer_channel(&fork_id);
                let fork_handle = eng.channel_handle(&fork_id);
                eng.fire(
                    &parent,
                    EventKey::Fork,
                    &FanArg::ForkLeg {
                        channel_id: fork_handle.id.clone(),
                        route,
                    },
                );

                let bind_parent = parent.clone();
                let bind_fork = fork_id.clone();
                eng.subscribe(
                    &fork_id,
                    EventKey::Connected,
                    Box::new(move |eng, arg| {
                        let FanArg::Msg(msg) = arg else {
                            return;
                        };
                        if msg.param("peerid") != Some(bind_parent.as_str()) {
                            return;
                        }
                        let already_bound = eng
                            .channels
                            .get(&bind_fork)
                            .map(|c| c.peer.is_some())
                            .unwrap_or(true);
                        if already_bound {
                            return;
                        }
                        eng.bind_peers(&bind_fork, &bind_parent);
                        // the timer lives on the fork leg so a dumb parent
                        // going away does not lose it
                        eng.arm_channel_timer(&bind_fork, timeout_ms);
                        let fork_peer = FanArg::PeerId(bind_fork.clone());
                        eng.fire(&bind_parent, EventKey::Peer, &fork_peer);
                        let parent_peer = FanArg::PeerId(bind_parent.clone());
                        eng.fire(&bind_fork, EventKey::Peer, &parent_peer);
                    }),
                );

                let hangup_parent = parent.clone();
                eng.subscribe(
                    &fork_id,
                    EventKey::Hangup,
                    Box::new(move |eng, arg| {
                        let FanArg::Msg(msg) = arg else {
                            return;
                        };
                        let cause = Cause::from_hangup(msg);
                        if let Some(parent_chan) = eng.channels.get_mut(&hangup_parent) {
                            parent_chan.saved_cause = Some(cause.clone());
                        }
                        // redundant with fork.stop=busy, but the engine has
                        // been seen to keep ringing
                        if cause.code == 486 {
                            eng.terminate_channel(&hangup_parent, cause);
                        }
                    }),
                );
            }),
        );
        Ok(())
    }

    fn route_to_ivr(&mut self, id: &str, done: oneshot::Sender<PbxResult<Ivr>>) {
        let (route_msg, rtp_forward) = match self.take_pending_route(id) {
            Ok(parts) => parts,
            Err(e) => {
                let _ = done.send(Err(e));
                return;
            }
        };
        let mut reply = route_msg.to_reply(true);
        reply.set_retvalue("dumb/");
        if rtp_forward {
            reply.set_param("rtp_forward", "yes");
        }
        self.queue_line(codec::encode_message(&reply), true);

        let caller_id = id.to_string();
        let timeout_ms = self.cfg.call_timeout.as_millis() as u64;
        let mut done_slot = Some(done);
        self.subscribe(
            id,
            EventKey::ConnectedOnce,
            Box::new(move |eng, arg| {
                let FanArg::Msg(msg) = arg else {
                    return;
                };
                let Some(dumb) = msg.param("peerid").map(str::to_string) else {
                    eng.emit(PbxEvent::Error(format!(
                        "dumb leg for {} connected without a peerid",
                        caller_id
                    )));
                    return;
                };

                let mut answer = Message::request("call.answered");
                answer.set_param("id", dumb.clone());
                answer.set_param("targetid", caller_id.clone());
                eng.queue_line(codec::encode_message(&answer), false);

                eng.ensure_peer_channel(&dumb);
                eng.create_ivr_state(&dumb);
                eng.bind_peers(&dumb, &caller_id);
                eng.arm_channel_timer(&caller_id, timeout_ms);

                // comfort noise so the first queued sound is not clipped
                let mut attach = Message::request("chan.attach");
                attach.set_param("id", dumb.clone());
                attach.set_param("source", "tone/silence");
                eng.queue_line(codec::encode_message(&attach), false);

                let ops = eng.ops_weak.clone();
                let delay_caller = caller_id.clone();
                let delay_dumb = dumb.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(IVR_PEER_DELAY_MS)).await;
                    if let Some(ops) = ops.upgrade() {
                        let _ = ops.send(Op::IvrPeerReady {
                            caller: delay_caller,
                            dumb: delay_dumb,
                        });
                    }
                });

                let ivr = Ivr::new(eng.channel_handle(&dumb));
                if let Some(done) = done_slot.take() {
                    let _ = done.send(Ok(ivr));
                }
            }),
        );
    }

    fn on_ivr_peer_ready(&mut self, caller: &str, dumb: &str) {
        let live = |eng: &Engine, id: &str| {
            eng.channels
                .get(id)
                .map(|c| !c.terminated)
                .unwrap_or(false)
        };
        let still_peered = self
            .channels
            .get(caller)
            .map(|c| c.peer.as_deref() == Some(dumb))
            .unwrap_or(false);
        if !live(self, caller) || !live(self, dumb) || !still_peered {
            return;
        }
        let dumb_peer = FanArg::PeerId(dumb.to_string());
        self.fire(caller, EventKey::Peer, &dumb_peer);
        let caller_peer = FanArg::PeerId(caller.to_string());
        self.fire(dumb, EventKey::Peer, &caller_peer);
    }

    fn connect_channels(&mut self, id: &str, peer: &str) -> PbxResult<()> {
        self.live_channel(id)?;
        self.live_channel(peer)?;
        let has_other_peer = |eng: &Engine, a: &str, b: &str| {
            eng.channels
                .get(a)
                .and_then(|c| c.peer.as_deref())
                .map(|p| p != b)
                .unwrap_or(false)
        };
        if has_other_peer(self, id, peer) {
            return Err(PbxError::AlreadyPeered { id: id.to_string() });
        }
        if has_other_peer(self, peer, id) {
            return Err(PbxError::AlreadyPeered {
                id: peer.to_string(),
            });
        }
        let mut connect = Message::request("chan.connect");
        connect.set_param("id", id);
        connect.set_param("targetid", peer);
        self.queue_line(codec::encode_message(&connect), false);
        self.bind_peers(id, peer);
        Ok(())
    }

    fn record_audio(
        &mut self,
        id: &str,
        call: Option<String>,
        peer: Option<String>,
        maxlen: Option<u64>,
    ) -> PbxResult<()> {
        self.live_channel(id)?;
        if call.is_none() && peer.is_none() {
            return Err(PbxError::InvalidSound {
                message: "no recording target".to_string(),
            });
        }
        for path in [&call, &peer].into_iter().flatten() {
            if !path.starts_with('/') {
                return Err(PbxError::InvalidSound {
                    message: format!("recording path must be absolute: {}", path),
                });
            }
        }
        let mut record = Message::request("chan.record");
        record.set_param("id", id);
        record.set_param_opt("call", call.map(|p| format!("wave/record/{}", p)));
        record.set_param_opt("peer", peer.map(|p| format!("wave/record/{}", p)));
        record.set_param_opt("maxlen", maxlen.map(|n| n.to_string()));
        self.queue_line(codec::encode_message(&record), false);
        Ok(())
    }

    // ---- host subscriptions ----

    fn subscribe_channel(&mut self, id: &str) -> PbxResult<mpsc::Receiver<ChannelEvent>> {
        self.live_channel(id)?;
        let (tx, rx) = mpsc::channel(CHANNEL_EVENT_QUEUE_SIZE);

        let peer_tx = tx.clone();
        self.subscribe(
            id,
            EventKey::Peer,
            Box::new(move |eng, arg| {
                if let FanArg::PeerId(peer) = arg {
                    forward(&peer_tx, ChannelEvent::Peer(eng.channel_handle(peer)));
                }
            }),
        );
        let fork_tx = tx.clone();
        self.subscribe(
            id,
            EventKey::Fork,
            Box::new(move |eng, arg| {
                if let FanArg::ForkLeg { channel_id, route } = arg {
                    forward(
                        &fork_tx,
                        ChannelEvent::Fork {
                            channel: eng.channel_handle(channel_id),
                            route: route.clone(),
                        },
                    );
                }
            }),
        );
        let slave_tx = tx.clone();
        self.subscribe(
            id,
            EventKey::SlaveConnected,
            Box::new(move |_eng, arg| {
                if let FanArg::Text(index) = arg {
                    forward(&slave_tx, ChannelEvent::SlaveConnected(index.clone()));
                }
            }),
        );
        let timeout_tx = tx.clone();
        self.subscribe(
            id,
            EventKey::Timeout,
            Box::new(move |_eng, _arg| {
                forward(&timeout_tx, ChannelEvent::Timeout);
            }),
        );
        let dtmf_tx = tx.clone();
        self.subscribe(
            id,
            EventKey::Dtmf,
            Box::new(move |_eng, arg| {
                if let FanArg::Text(text) = arg {
                    forward(&dtmf_tx, ChannelEvent::Dtmf(text.clone()));
                }
            }),
        );
        let queue_tx = tx.clone();
        self.subscribe(
            id,
            EventKey::QueueEmpty,
            Box::new(move |_eng, _arg| {
                forward(&queue_tx, ChannelEvent::QueueEmpty);
            }),
        );
        let end_tx = tx;
        self.subscribe(
            id,
            EventKey::End,
            Box::new(move |_eng, arg| {
                if let FanArg::Cause(cause) = arg {
                    forward(&end_tx, ChannelEvent::End(cause.clone()));
                }
            }),
        );
        Ok(rx)
    }

    fn wait_end(&mut self, id: &str, done: oneshot::Sender<Cause>) {
        match self.channels.get(id) {
            Some(chan) if chan.terminated => {
                let cause = chan.final_cause.clone().unwrap_or_default();
                let _ = done.send(cause);
            }
            Some(_) => {
                let mut done_slot = Some(done);
                self.subscribe(
                    id,
                    EventKey::End,
                    Box::new(move |_eng, arg| {
                        if let (FanArg::Cause(cause), Some(done)) = (arg, done_slot.take()) {
                            let _ = done.send(cause.clone());
                        }
                    }),
                );
            }
            None => {
                // unknown channel, sender drop signals the error
            }
        }
    }

    // ---- installed message handlers ----

    fn handle_call_route(&mut self, msg: Message) {
        let caller = msg.param("caller").unwrap_or("").to_string();
        let callername = msg.param("callername").unwrap_or("").to_string();

        if caller.starts_with("dumb/") {
            if let Some(out) = self.outgoing.remove(&callername) {
                out.timer.abort();
                self.complete_outgoing_call(msg, out);
                return;
            }
        }

        let called = msg.param("called").unwrap_or("").to_string();
        if called.is_empty() {
            let reply = msg.to_reply(false);
            self.queue_line(codec::encode_message(&reply), true);
            self.emit(PbxEvent::Error(
                "call.route with an empty called number".to_string(),
            ));
            return;
        }
        let Some(chan_id) = msg.param("id").map(str::to_string) else {
            let reply = msg.to_reply(false);
            self.queue_line(codec::encode_message(&reply), true);
            self.emit(PbxEvent::Error(
                "call.route without a channel id".to_string(),
            ));
            return;
        };

        let rtp_forward = self.cfg.rtp_forward && msg.param("rtp_forward") == Some("possible");
        let info = CallInfo {
            caller: caller.clone(),
            called,
            bill_id: msg.param("billid").map(str::to_string),
            caller_host: msg
                .param("address")
                .map(|a| a.split(':').next().unwrap_or(a).to_string())
                .or_else(|| msg.param("ip_host").map(str::to_string)),
        };
        self.channels.insert(
            chan_id.clone(),
            ChannelState::routing(msg, Some(caller), rtp_forward),
        );

        let channel = self.channel_handle(&chan_id);
        let delivered = self.emit(PbxEvent::IncomingCall { channel, info });
        if !delivered {
            warn!("incoming call {} had no subscriber, terminating", chan_id);
            self.terminate_channel(&chan_id, Cause::default());
        }
    }

    fn complete_outgoing_call(&mut self, msg: Message, out: OutgoingCall) {
        let Some(chan_id) = msg.param("id").map(str::to_string) else {
            let reply = msg.to_reply(false);
            self.queue_line(codec::encode_message(&reply), true);
            let _ = out
                .done
                .send(Err(PbxError::protocol("outgoing route without channel id")));
            return;
        };
        let caller = msg.param("caller").map(str::to_string);
        let rtp_forward = self.cfg.rtp_forward && msg.param("rtp_forward") == Some("possible");
        self.channels.insert(
            chan_id.clone(),
            ChannelState::routing(msg, caller, rtp_forward),
        );
        self.create_ivr_state(&chan_id);
        let ivr = Ivr::new(self.channel_handle(&chan_id));

        match self.route_to_destination(&chan_id, out.dest.clone()) {
            Ok(()) => {
                info!("outgoing call established on {}", chan_id);
                self.emit(PbxEvent::OutgoingCall {
                    ivr: ivr.clone(),
                    destination: out.dest,
                });
                let _ = out.done.send(Ok(ivr));
            }
            Err(e) => {
                self.terminate_channel(&chan_id, Cause::default());
                let _ = out.done.send(Err(e));
            }
        }
    }

    fn handle_user_auth(&mut self, msg: Message) {
        let allow_extras = [("auth_register", "false"), ("auth_regfile", "false")];
        if self.cfg.allow_unregistered {
            let mut reply = msg.to_reply(true);
            for (key, value) in allow_extras {
                reply.set_param(key, value);
            }
            self.queue_line(codec::encode_message(&reply), true);
            return;
        }
        let Some(authenticator) = self.authenticator.clone() else {
            let reply = msg.to_reply(false);
            self.queue_line(codec::encode_message(&reply), true);
            self.emit(PbxEvent::Error(
                "user.auth received with no authenticator configured".to_string(),
            ));
            return;
        };

        // a registered, unexpired caller placing a call skips the digest
        if msg.param_bool("newcall") == Some(true) {
            if let Some(username) = msg.param("username").map(str::to_string) {
                match self.users.lookup(&username, unix_now()) {
                    Lookup::Found(_) => {
                        let mut reply = msg.to_reply(true);
                        for (key, value) in allow_extras {
                            reply.set_param(key, value);
                        }
                        self.queue_line(codec::encode_message(&reply), true);
                        return;
                    }
                    Lookup::Expired => {
                        self.emit(PbxEvent::UserExpired { username });
                    }
                    Lookup::Missing => {}
                }
            }
        }

        let request = AuthRequest::from_message(&msg);
        let id = msg.id().to_string();
        self.pending_auth.insert(id.clone(), msg);
        let timeout = self.cfg.authenticate_timeout;
        let ops = self.ops_weak.clone();
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, authenticator.authenticate(request)).await;
            let (allow, error) = match outcome {
                Ok(Ok(allow)) => (allow, None),
                Ok(Err(e)) => (false, Some(format!("authenticator failed: {}", e))),
                Err(_) => (
                    false,
                    Some(format!(
                        "authenticator timed out after {}ms",
                        timeout.as_millis()
                    )),
                ),
            };
            if let Some(ops) = ops.upgrade() {
                let _ = ops.send(Op::AuthResult { id, allow, error });
            }
        });
    }

    fn finish_auth(&mut self, id: &str, allow: bool, error: Option<String>) {
        let Some(original) = self.pending_auth.remove(id) else {
            return;
        };
        let mut reply = original.to_reply(allow);
        if allow {
            reply.set_param("auth_register", "false");
            reply.set_param("auth_regfile", "false");
        }
        self.queue_line(codec::encode_message(&reply), true);
        if let Some(error) = error {
            self.emit(PbxEvent::Error(error));
        }
    }

    fn handle_user_register(&mut self, msg: Message) {
        match self.users.register(msg.clone()) {
            Some(username) => {
                debug!("registered local user {}", username);
                self.emit(PbxEvent::UserRegister { username });
                let reply = msg.to_reply(true);
                self.queue_line(codec::encode_message(&reply), true);
            }
            None => {
                let reply = msg.to_reply(false);
                self.queue_line(codec::encode_message(&reply), true);
                self.emit(PbxEvent::Error(
                    "user.register without a username".to_string(),
                ));
            }
        }
    }

    fn local_route(&mut self, caller: &str, called: &str) -> Option<LocalRoute> {
        match self.users.lookup(called, unix_now()) {
            Lookup::Found(msg) => LocalUsers::local_route(&msg, caller, called),
            Lookup::Expired => {
                self.emit(PbxEvent::UserExpired {
                    username: called.to_string(),
                });
                None
            }
            Lookup::Missing => None,
        }
    }

    // ---- carriers ----

    fn apply_carriers(&mut self, desired: Vec<Trunk>) {
        let (next, actions) = carrier::diff(&self.carriers, &desired);
        self.carriers = next;
        if !self.initialized {
            debug!("session not ready, carrier set stored for replay");
            return;
        }
        for action in actions {
            match action {
                CarrierAction::Login { account, trunk } => {
                    let mut msg = Message::request("user.login");
                    msg.set_param("account", account.clone());
                    msg.set_param("protocol", "sip");
                    msg.set_param_opt("username", trunk.username.clone());
                    msg.set_param_opt("password", trunk.password.clone());
                    msg.set_param("registrar", trunk.registrar());
                    msg.set_param("outbound", trunk.registrar());
                    msg.set_param_opt(
                        "authname",
                        trunk.effective_auth_name().map(str::to_string),
                    );
                    msg.set_param("domain", trunk.effective_domain());
                    self.pending_logins.insert(
                        msg.id().to_string(),
                        PendingLogin {
                            account,
                            logout: false,
                        },
                    );
                    self.queue_line(codec::encode_message(&msg), false);
                }
                CarrierAction::Logout { account } => {
                    let mut msg = Message::request("user.login");
                    msg.set_param("account", account.clone());
                    msg.set_param("operation", "logout");
                    self.pending_logins.insert(
                        msg.id().to_string(),
                        PendingLogin {
                            account,
                            logout: true,
                        },
                    );
                    self.queue_line(codec::encode_message(&msg), false);
                }
            }
        }
    }

    // ---- outgoing calls ----

    fn make_call(&mut self, dest: Destination, done: oneshot::Sender<PbxResult<Ivr>>) {
        let call_id = Uuid::new_v4().simple().to_string();
        let total_ms = dest.timeout.unwrap_or(self.cfg.call_timeout.as_millis() as u64);
        let setup_ms = dest
            .setup_timeout
            .unwrap_or(self.cfg.call_setup_timeout.as_millis() as u64);

        let mut msg = Message::request("call.execute");
        msg.set_param("callto", "dumb/");
        msg.set_param("target", dest.called.clone());
        msg.set_param("callername", call_id.clone());
        msg.set_param("timeout", (total_ms + setup_ms).to_string());
        msg.set_param("maxcall", setup_ms.to_string());
        self.queue_line(codec::encode_message(&msg), false);

        let ops = self.ops_weak.clone();
        let timer_id = call_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(OUTGOING_CALL_INIT_TIMEOUT_MS)).await;
            if let Some(ops) = ops.upgrade() {
                let _ = ops.send(Op::OutgoingInitTimeout { call_id: timer_id });
            }
        });
        debug!("outgoing call {} dispatched", call_id);
        self.outgoing
            .insert(call_id, OutgoingCall { dest, done, timer });
    }

    // ---- IVR queue ----

    fn create_ivr_state(&mut self, id: &str) {
        if self.ivrs.contains_key(id) {
            return;
        }
        self.ivrs.insert(
            id.to_string(),
            IvrState {
                queue: VecDeque::new(),
                playing: false,
                tone_timer: None,
                tone_gen: 0,
            },
        );
        let start_id = id.to_string();
        self.subscribe(
            id,
            EventKey::Peer,
            Box::new(move |eng, _arg| {
                let pending = eng
                    .ivrs
                    .get(&start_id)
                    .map(|ivr| !ivr.playing && !ivr.queue.is_empty())
                    .unwrap_or(false);
                if pending {
                    eng.ivr_play_next(&start_id);
                }
            }),
        );
        let notify_id = id.to_string();
        self.subscribe(
            id,
            EventKey::Notify,
            Box::new(move |eng, _arg| {
                eng.ivr_advance(&notify_id);
            }),
        );
    }

    fn ivr_enqueue(&mut self, id: &str, sound: Sound) -> PbxResult<()> {
        self.live_channel(id)?;
        if let Err(message) = sound.validate() {
            return Err(PbxError::InvalidSound { message });
        }
        let Some(ivr) = self.ivrs.get_mut(id) else {
            return Err(PbxError::protocol(format!("{} is not an IVR channel", id)));
        };
        ivr.queue.push_back(sound);
        let first = ivr.queue.len() == 1 && !ivr.playing;
        let has_peer = self
            .channels
            .get(id)
            .map(|c| c.peer.is_some())
            .unwrap_or(false);
        if first && has_peer {
            self.ivr_play_next(id);
        }
        Ok(())
    }

    fn ivr_attach_tone(&mut self, id: &str, name: &str) -> PbxResult<()> {
        self.live_channel(id)?;
        let mut attach = Message::request("chan.attach");
        attach.set_param("id", id);
        attach.set_param("source", format!("tone/{}", name));
        self.queue_line(codec::encode_message(&attach), false);
        Ok(())
    }

    /// Start the head of the queue, skipping unplayable entries.
    fn ivr_play_next(&mut self, id: &str) {
        loop {
            let head = match self.ivrs.get_mut(id) {
                Some(ivr) => {
                    let skip = ivr.queue.front().map(|s| !s.playable()).unwrap_or(false);
                    if skip {
                        ivr.queue.pop_front();
                        None
                    } else {
                        match ivr.queue.front().cloned() {
                            Some(sound) => Some(sound),
                            None => return,
                        }
                    }
                }
                None => return,
            };
            let Some(head) = head else {
                self.emit(PbxEvent::Error(format!("skip invalid sound on {}", id)));
                continue;
            };
            match head {
                Sound::File { path } => {
                    let mut attach = Message::request("chan.attach");
                    attach.set_param("id", id);
                    attach.set_param("source", format!("wave/play/{}", path));
                    attach.set_param("notify", id);
                    self.queue_line(codec::encode_message(&attach), false);
                    if let Some(ivr) = self.ivrs.get_mut(id) {
                        ivr.playing = true;
                    }
                }
                Sound::Tone { name, ms } => {
                    let mut attach = Message::request("chan.attach");
                    attach.set_param("id", id);
                    attach.set_param("source", format!("tone/{}", name));
                    self.queue_line(codec::encode_message(&attach), false);
                    self.arm_tone_timer(id, ms);
                    if let Some(ivr) = self.ivrs.get_mut(id) {
                        ivr.playing = true;
                    }
                }
            }
            return;
        }
    }

    /// Shift the finished head and continue, or fall back to comfort noise.
    fn ivr_advance(&mut self, id: &str) {
        let emptied = match self.ivrs.get_mut(id) {
            Some(ivr) => {
                if let Some(timer) = ivr.tone_timer.take() {
                    timer.abort();
                }
                ivr.tone_gen += 1;
                ivr.playing = false;
                ivr.queue.pop_front();
                ivr.queue.is_empty()
            }
            None => return,
        };
        if emptied {
            let mut attach = Message::request("chan.attach");
            attach.set_param("id", id);
            attach.set_param("source", "tone/silence");
            self.queue_line(codec::encode_message(&attach), false);
            self.fire(id, EventKey::QueueEmpty, &FanArg::Empty);
        } else {
            self.ivr_play_next(id);
        }
    }

    fn arm_tone_timer(&mut self, id: &str, ms: u64) {
        let Some(ivr) = self.ivrs.get_mut(id) else {
            return;
        };
        if let Some(timer) = ivr.tone_timer.take() {
            timer.abort();
        }
        ivr.tone_gen += 1;
        let gen = ivr.tone_gen;
        let ops = self.ops_weak.clone();
        let timer_id = id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if let Some(ops) = ops.upgrade() {
                let _ = ops.send(Op::ToneTimer { id: timer_id, gen });
            }
        });
        if let Some(ivr) = self.ivrs.get_mut(id) {
            ivr.tone_timer = Some(task);
        }
    }

    /// A finished tone synthesizes the notify a wave file would get from the
    /// engine.
    fn on_tone_timer(&mut self, id: &str, gen: u64) {
        let valid = self
            .ivrs
            .get(id)
            .map(|ivr| ivr.tone_gen == gen)
            .unwrap_or(false);
        if !valid {
            return;
        }
        if let Some(ivr) = self.ivrs.get_mut(id) {
            ivr.tone_timer = None;
        }
        self.fire(id, EventKey::Notify, &FanArg::Empty);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn test_engine() -> (Engine, UnboundedReceiver<Op>, mpsc::Receiver<PbxEvent>) {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(64);
        let (ready_tx, _) = watch::channel(false);
        let engine = Engine::new(PbxConfig::new(5040), ops_tx, event_tx, ready_tx);
        (engine, ops_rx, event_rx)
    }

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, n: u32) -> Handler {
        let log = log.clone();
        Box::new(move |_eng, _arg| {
            log.lock().unwrap().push(n);
        })
    }

    #[test]
    fn fire_runs_subscribers_in_registration_order() {
        let (mut engine, _ops, _events) = test_engine();
        engine.ensure_peer_channel("sip/1");
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            engine.subscribe("sip/1", EventKey::Dtmf, recorder(&log, n));
        }
        engine.fire("sip/1", EventKey::Dtmf, &FanArg::Empty);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);

        // non-once subscribers survive the firing
        engine.fire("sip/1", EventKey::Dtmf, &FanArg::Empty);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn once_subscribers_are_consumed_atomically() {
        let (mut engine, _ops, _events) = test_engine();
        engine.ensure_peer_channel("sip/1");
        let log = Arc::new(Mutex::new(Vec::new()));
        engine.subscribe("sip/1", EventKey::ConnectedOnce, recorder(&log, 1));
        engine.subscribe("sip/1", EventKey::ConnectedOnce, recorder(&log, 2));

        engine.fire("sip/1", EventKey::ConnectedOnce, &FanArg::Empty);
        engine.fire("sip/1", EventKey::ConnectedOnce, &FanArg::Empty);
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn panicking_subscriber_does_not_abort_the_batch() {
        let (mut engine, _ops, _events) = test_engine();
        engine.ensure_peer_channel("sip/1");
        let log = Arc::new(Mutex::new(Vec::new()));
        engine.subscribe(
            "sip/1",
            EventKey::Dtmf,
            Box::new(|_eng, _arg| panic!("handler bug")),
        );
        engine.subscribe("sip/1", EventKey::Dtmf, recorder(&log, 7));

        engine.fire("sip/1", EventKey::Dtmf, &FanArg::Empty);
        assert_eq!(*log.lock().unwrap(), vec![7]);
    }

    #[test]
    fn termination_clears_all_subscriptions_for_the_channel() {
        let (mut engine, _ops, _events) = test_engine();
        engine.ensure_peer_channel("sip/1");
        let log = Arc::new(Mutex::new(Vec::new()));
        engine.subscribe("sip/1", EventKey::Dtmf, recorder(&log, 1));
        engine.subscribe("sip/1", EventKey::Notify, recorder(&log, 2));

        engine.do_terminate("sip/1", Cause::default());
        engine.fire("sip/1", EventKey::Dtmf, &FanArg::Empty);
        engine.fire("sip/1", EventKey::Notify, &FanArg::Empty);
        assert!(log.lock().unwrap().is_empty());
        assert!(engine.subs.is_empty());
    }

    #[test]
    fn terminate_is_idempotent_and_keeps_the_first_cause() {
        let (mut engine, _ops, _events) = test_engine();
        engine.ensure_peer_channel("sip/1");
        engine.do_terminate("sip/1", Cause::new(486, "Busy Here"));
        engine.do_terminate("sip/1", Cause::new(403, "Forbidden"));
        assert_eq!(
            engine.channels["sip/1"].final_cause,
            Some(Cause::new(486, "Busy Here"))
        );
    }

    #[test]
    fn cancelled_487_takes_the_peer_cause() {
        let (mut engine, _ops, _events) = test_engine();
        engine.ensure_peer_channel("sip/1");
        engine.ensure_peer_channel("sip/2");
        if let Some(chan) = engine.channels.get_mut("sip/1") {
            chan.peer = Some("sip/2".to_string());
        }
        if let Some(chan) = engine.channels.get_mut("sip/2") {
            chan.peer = Some("sip/1".to_string());
            chan.saved_cause = Some(Cause::new(603, "Decline"));
        }

        engine.do_terminate("sip/1", Cause::default());
        assert_eq!(
            engine.channels["sip/1"].final_cause,
            Some(Cause::new(603, "Decline"))
        );
        // the peer link is severed on both sides
        assert!(engine.channels["sip/1"].peer.is_none());
        assert!(engine.channels["sip/2"].peer.is_none());
    }

    #[test]
    fn fork_slave_peerid_notifies_the_master_subscriber() {
        let (mut engine, _ops, _events) = test_engine();
        engine.ensure_peer_channel("fork/1");
        let mut rx = engine.subscribe_channel("fork/1").expect("subscribe failed");

        let mut params = HashMap::new();
        params.insert("id".to_string(), "sip/6".to_string());
        params.insert("peerid".to_string(), "fork/1/2".to_string());
        let msg = Message::from_parts(
            "chan.connected",
            "c1",
            crate::message::MessageKind::Reply { processed: true },
            "",
            params,
        );
        engine.on_chan_connected(msg);

        match rx.try_recv() {
            Ok(ChannelEvent::SlaveConnected(index)) => assert_eq!(index, "2"),
            other => panic!("expected slave-connected, got {:?}", other),
        }
    }

    #[test]
    fn bare_fork_master_peerid_notifies_no_slave() {
        let (mut engine, _ops, _events) = test_engine();
        engine.ensure_peer_channel("fork/1");
        let mut rx = engine.subscribe_channel("fork/1").expect("subscribe failed");

        // the master connecting as a peer itself carries no slave index
        let mut params = HashMap::new();
        params.insert("id".to_string(), "sip/5".to_string());
        params.insert("peerid".to_string(), "fork/1".to_string());
        let msg = Message::from_parts(
            "chan.connected",
            "c2",
            crate::message::MessageKind::Reply { processed: true },
            "",
            params,
        );
        engine.on_chan_connected(msg);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn positive_duration_always_reconciles_to_normal_clearing() {
        let (mut engine, _ops, _events) = test_engine();
        engine.ensure_peer_channel("sip/1");
        if let Some(chan) = engine.channels.get_mut("sip/1") {
            chan.connect_time = Some(Instant::now() - Duration::from_secs(5));
            chan.saved_cause = Some(Cause::new(486, "Busy Here"));
        }
        engine.do_terminate("sip/1", Cause::default());
        assert_eq!(
            engine.channels["sip/1"].final_cause,
            Some(Cause::normal_clearing())
        );
    }
}

