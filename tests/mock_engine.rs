//! Integration tests against an in-process mock engine.
//!
//! A `TcpListener` stands in for Yate's extmodule listener; each test
//! drives the real wire protocol in both directions.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;
use yate_extmodule_tokio::codec::{self, Frame};
use yate_extmodule_tokio::{
    Cause, ChannelEvent, Destination, ForkRoute, Pbx, PbxConfig, PbxError, PbxEvent,
    PbxEventStream, Sound, Trunk,
};

const WAIT: Duration = Duration::from_secs(5);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct MockEngine {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl MockEngine {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("timed out waiting for connect")
            .expect("accept failed");
        let (read_half, write_half) = stream.into_split();
        MockEngine {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
        }
    }

    async fn recv(&mut self) -> String {
        timeout(WAIT, self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .expect("read failed")
            .expect("client closed the connection")
    }

    /// Receive and decode the next message frame, skipping nothing.
    async fn recv_message(&mut self) -> yate_extmodule_tokio::Message {
        let line = self.recv().await;
        match codec::decode(&line).expect("undecodable line from client") {
            Frame::Message(msg) => msg,
            other => panic!("expected a message frame, got {:?}: {}", other, line),
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("write failed");
    }

    /// Read the client's handshake and confirm every install and watch.
    async fn handshake(&mut self) {
        let connect = self.recv().await;
        assert_eq!(connect, "%%>connect:global");
        // 3 uninstalls + 8 unwatches + 3 installs + 8 watches
        for _ in 0..22 {
            let line = self.recv().await;
            if let Some(rest) = line.strip_prefix("%%>install:") {
                let (priority, name) = rest.split_once(':').expect("bad install");
                self.send(&format!("%%<install:{}:{}:true", priority, name))
                    .await;
            } else if let Some(name) = line.strip_prefix("%%>watch:") {
                self.send(&format!("%%<watch:{}:true", name)).await;
            } else {
                assert!(
                    line.starts_with("%%>uninstall:") || line.starts_with("%%>unwatch:"),
                    "unexpected handshake line: {}",
                    line
                );
            }
        }
    }
}

async fn wait_for<F>(events: &mut PbxEventStream, mut pred: F) -> PbxEvent
where
    F: FnMut(&PbxEvent) -> bool,
{
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed");
        if pred(&event) {
            return event;
        }
    }
}

async fn connected_session() -> (Pbx, PbxEventStream, MockEngine) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let port = listener.local_addr().expect("local addr").port();

    let mut cfg = PbxConfig::new(port);
    cfg.host = "127.0.0.1".to_string();
    cfg.reconnect_interval = None;
    cfg.allow_unregistered = true;
    let (pbx, mut events) = Pbx::new(cfg).expect("session start failed");
    pbx.connect().expect("connect failed");

    let mut mock = MockEngine::accept(&listener).await;
    mock.handshake().await;
    wait_for(&mut events, |e| matches!(e, PbxEvent::Connected)).await;
    assert!(pbx.ready());
    (pbx, events, mock)
}

#[tokio::test]
async fn handshake_gate_requires_all_confirmations() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let port = listener.local_addr().expect("local addr").port();

    let mut cfg = PbxConfig::new(port);
    cfg.host = "127.0.0.1".to_string();
    cfg.reconnect_interval = None;
    let (pbx, mut events) = Pbx::new(cfg).expect("session start failed");
    pbx.connect().expect("connect failed");

    let mut mock = MockEngine::accept(&listener).await;
    let connect = mock.recv().await;
    assert_eq!(connect, "%%>connect:global");

    let mut confirms: Vec<String> = Vec::new();
    for _ in 0..22 {
        let line = mock.recv().await;
        if let Some(rest) = line.strip_prefix("%%>install:") {
            let (priority, name) = rest.split_once(':').expect("bad install");
            confirms.push(format!("%%<install:{}:{}:true", priority, name));
        } else if let Some(name) = line.strip_prefix("%%>watch:") {
            confirms.push(format!("%%<watch:{}:true", name));
        }
    }
    assert_eq!(confirms.len(), 11);

    // one short of the full set must not open the gate
    let (last, first_ten) = confirms.split_last().expect("confirms");
    for confirm in first_ten {
        mock.send(confirm).await;
    }
    for _ in 0..10 {
        wait_for(&mut events, |e| {
            matches!(e, PbxEvent::InstallConfirm { .. } | PbxEvent::WatchConfirm { .. })
        })
        .await;
    }
    assert!(!pbx.ready(), "gate opened before all confirmations");

    mock.send(last).await;
    wait_for(&mut events, |e| matches!(e, PbxEvent::Connected)).await;
    assert!(pbx.ready());
}

#[tokio::test]
async fn incoming_call_forks_and_reconciles_cause() {
    let (_pbx, mut events, mut mock) = connected_session().await;

    mock.send("%%>message:route1:1700000000:call.route::id=sip/5:caller=200:called=31999:billid=b1")
        .await;

    let event = wait_for(&mut events, |e| matches!(e, PbxEvent::IncomingCall { .. })).await;
    let PbxEvent::IncomingCall { channel, info } = event else {
        unreachable!();
    };
    assert_eq!(info.caller, "200");
    assert_eq!(info.called, "31999");
    assert_eq!(info.bill_id.as_deref(), Some("b1"));
    assert_eq!(channel.id(), "sip/5");

    let mut chan_events = channel.events().await.expect("subscribe failed");

    let dest = Destination {
        called: "31999".to_string(),
        routes: vec![
            ForkRoute {
                host: "gw1:8888".to_string(),
                caller: Some("555".to_string()),
                formats: Some("g729,g723".to_string()),
                ..ForkRoute::default()
            },
            ForkRoute {
                host: "gw2:8888".to_string(),
                caller: Some("666".to_string()),
                called: Some("00031999".to_string()),
                ..ForkRoute::default()
            },
        ],
        caller: None,
        timeout: Some(600_000),
        setup_timeout: Some(30_000),
    };
    channel.route_to_destination(dest).await.expect("route failed");

    let reply = mock.recv_message().await;
    assert_eq!(reply.name(), "call.route");
    assert_eq!(reply.id(), "route1");
    assert_eq!(reply.processed(), Some(true));
    assert_eq!(reply.retvalue(), "fork");
    assert_eq!(reply.param("fork.stop"), Some("busy"));
    assert_eq!(reply.param("callto.1"), Some("sip/sip:31999@gw1:8888"));
    assert_eq!(reply.param("callto.1.caller"), Some("555"));
    assert_eq!(reply.param("callto.1.formats"), Some("g729,g723"));
    assert_eq!(reply.param("callto.2"), Some("|"));
    assert_eq!(reply.param("callto.3"), Some("sip/sip:00031999@gw2:8888"));
    assert_eq!(reply.param("callto.3.called"), Some("00031999"));
    assert_eq!(reply.param("maxcall"), Some("30000"));
    assert_eq!(reply.param("timeout"), Some("630000"));

    // first fork leg starts dialing
    mock.send("%%<message:x1:true:call.execute::id=fork/1/1:fork.origid=sip/5:peerid=sip/6")
        .await;
    let fork = timeout(WAIT, chan_events.recv())
        .await
        .expect("timed out waiting for fork event")
        .expect("channel events closed");
    let ChannelEvent::Fork { channel: leg, route } = fork else {
        panic!("expected fork event, got {:?}", fork);
    };
    assert_eq!(leg.id(), "sip/6");
    assert_eq!(route.host, "gw1:8888");

    // the leg answers and the two channels peer up
    mock.send("%%<message:x2:true:chan.connected::id=sip/6:peerid=sip/5")
        .await;
    let peer = timeout(WAIT, chan_events.recv())
        .await
        .expect("timed out waiting for peer event")
        .expect("channel events closed");
    let ChannelEvent::Peer(peer) = peer else {
        panic!("expected peer event, got {:?}", peer);
    };
    assert_eq!(peer.id(), "sip/6");

    let bound = channel.peer().await.expect("peer query failed");
    assert_eq!(bound.map(|p| p.id().to_string()).as_deref(), Some("sip/6"));

    // in-band digits reach the channel subscriber
    mock.send("%%<message:d1:true:chan.dtmf::id=sip/5:text=5")
        .await;
    let dtmf = timeout(WAIT, chan_events.recv())
        .await
        .expect("timed out waiting for dtmf")
        .expect("channel events closed");
    let ChannelEvent::Dtmf(digits) = dtmf else {
        panic!("expected dtmf event, got {:?}", dtmf);
    };
    assert_eq!(digits, "5");

    // recording both legs goes out as one chan.record
    channel
        .record_audio(Some("/rec/in.wav"), Some("/rec/out.wav"), Some(1_000_000))
        .await
        .expect("record failed");
    let record = mock.recv_message().await;
    assert_eq!(record.name(), "chan.record");
    assert_eq!(record.param("id"), Some("sip/5"));
    assert_eq!(record.param("call"), Some("wave/record//rec/in.wav"));
    assert_eq!(record.param("peer"), Some("wave/record//rec/out.wav"));
    assert_eq!(record.param("maxlen"), Some("1000000"));

    // relative recording paths are refused
    assert!(channel
        .record_audio(Some("relative.wav"), None, None)
        .await
        .is_err());

    // caller hangs up; with positive duration the cause reconciles to 200
    mock.send("%%<message:x3:true:chan.hangup::id=sip/5:status=hangup")
        .await;
    let end = timeout(WAIT, chan_events.recv())
        .await
        .expect("timed out waiting for end event")
        .expect("channel events closed");
    let ChannelEvent::End(cause) = end else {
        panic!("expected end event, got {:?}", end);
    };
    assert_eq!(cause, Cause::new(200, "Normal call clearing"));

    // subscribing after termination is refused, the end cause stays queryable
    assert!(channel.events().await.is_err());
    assert_eq!(
        channel.wait_end().await.expect("wait_end failed"),
        Cause::new(200, "Normal call clearing")
    );
}

#[tokio::test]
async fn busy_fork_leg_terminates_parent() {
    let (_pbx, mut events, mut mock) = connected_session().await;

    mock.send("%%>message:route2:1700000000:call.route::id=sip/9:caller=200:called=100")
        .await;
    let event = wait_for(&mut events, |e| matches!(e, PbxEvent::IncomingCall { .. })).await;
    let PbxEvent::IncomingCall { channel, .. } = event else {
        unreachable!();
    };
    let mut chan_events = channel.events().await.expect("subscribe failed");

    channel
        .route_to_destination(Destination::new("100", vec![ForkRoute::to_host("gw1")]))
        .await
        .expect("route failed");
    let _reply = mock.recv_message().await;

    mock.send("%%<message:y1:true:call.execute::id=fork/2/1:fork.origid=sip/9:peerid=sip/10")
        .await;
    // the leg reports busy without ever connecting
    mock.send("%%<message:y2:true:chan.hangup::id=sip/10:status=Busy Here")
        .await;

    // the parent is force-terminated with the leg's cause
    loop {
        let event = timeout(WAIT, chan_events.recv())
            .await
            .expect("timed out waiting for end event")
            .expect("channel events closed");
        if let ChannelEvent::End(cause) = event {
            assert_eq!(cause, Cause::new(486, "Busy Here"));
            break;
        }
    }

    // terminating dispatches a call.drop for the parent leg
    let drop_msg = mock.recv_message().await;
    assert_eq!(drop_msg.name(), "call.drop");
    assert_eq!(drop_msg.param("id"), Some("sip/9"));
    assert_eq!(drop_msg.param("reason"), Some("Busy Here"));
}

#[tokio::test]
async fn ivr_queue_plays_in_order() {
    let (_pbx, mut events, mut mock) = connected_session().await;

    mock.send("%%>message:route3:1700000000:call.route::id=sip/7:caller=300:called=8000")
        .await;
    let event = wait_for(&mut events, |e| matches!(e, PbxEvent::IncomingCall { .. })).await;
    let PbxEvent::IncomingCall { channel, .. } = event else {
        unreachable!();
    };

    let route_task = tokio::spawn({
        let channel = channel.clone();
        async move { channel.route_to_ivr().await }
    });

    let reply = mock.recv_message().await;
    assert_eq!(reply.id(), "route3");
    assert_eq!(reply.retvalue(), "dumb/");

    // the engine creates the dumb leg and connects it
    mock.send("%%<message:z1:true:chan.connected::id=sip/7:peerid=dumb/1")
        .await;

    let answered = mock.recv_message().await;
    assert_eq!(answered.name(), "call.answered");
    assert_eq!(answered.param("id"), Some("dumb/1"));
    assert_eq!(answered.param("targetid"), Some("sip/7"));

    let silence = mock.recv_message().await;
    assert_eq!(silence.name(), "chan.attach");
    assert_eq!(silence.param("source"), Some("tone/silence"));

    let ivr = timeout(WAIT, route_task)
        .await
        .expect("route_to_ivr timed out")
        .expect("route task panicked")
        .expect("route_to_ivr failed");
    assert_eq!(ivr.id(), "dumb/1");

    let mut ivr_events = ivr.events().await.expect("ivr subscribe failed");

    // peer link exists, so the first sound plays immediately
    ivr.enqueue(Sound::file("/snd/welcome.wav"))
        .await
        .expect("enqueue failed");
    ivr.enqueue(Sound::tone("dial", 1500)).await.expect("enqueue failed");

    let play = mock.recv_message().await;
    assert_eq!(play.name(), "chan.attach");
    assert_eq!(play.param("source"), Some("wave/play//snd/welcome.wav"));
    assert_eq!(play.param("notify"), Some("dumb/1"));

    // the engine reports the wave finished; the queued tone follows
    mock.send("%%<message:z2:true:chan.notify::targetid=dumb/1")
        .await;
    let tone = mock.recv_message().await;
    assert_eq!(tone.name(), "chan.attach");
    assert_eq!(tone.param("source"), Some("tone/dial"));

    // the tone timer expires on its own and the queue drains to silence
    let comfort = mock.recv_message().await;
    assert_eq!(comfort.name(), "chan.attach");
    assert_eq!(comfort.param("source"), Some("tone/silence"));

    loop {
        let event = timeout(WAIT, ivr_events.recv())
            .await
            .expect("timed out waiting for queue-empty")
            .expect("ivr events closed");
        if matches!(event, ChannelEvent::QueueEmpty) {
            break;
        }
    }

    // invalid sounds are rejected at enqueue
    let err = ivr.enqueue(Sound::tone("dial", 0)).await;
    assert!(matches!(err, Err(PbxError::InvalidSound { .. })));
}

#[tokio::test]
async fn make_call_round_trip() {
    let (pbx, mut events, mut mock) = connected_session().await;

    let dest = Destination {
        called: "31999".to_string(),
        routes: vec![ForkRoute::to_host("gw1:5060")],
        caller: Some("100".to_string()),
        timeout: Some(60_000),
        setup_timeout: Some(20_000),
    };
    let call_task = tokio::spawn({
        let pbx = pbx.clone();
        let dest = dest.clone();
        async move { pbx.make_call(dest).await }
    });

    let execute = mock.recv_message().await;
    assert_eq!(execute.name(), "call.execute");
    assert_eq!(execute.param("callto"), Some("dumb/"));
    assert_eq!(execute.param("target"), Some("31999"));
    assert_eq!(execute.param("maxcall"), Some("20000"));
    assert_eq!(execute.param("timeout"), Some("80000"));
    let call_id = execute.param("callername").expect("callername").to_string();

    // the dumb leg comes back asking for a route
    mock.send(&format!(
        "%%>message:oroute:{}:call.route::id=dumb/3:caller=dumb/:callername={}:called=31999",
        unix_now(),
        call_id
    ))
    .await;

    let reply = mock.recv_message().await;
    assert_eq!(reply.id(), "oroute");
    assert_eq!(reply.retvalue(), "fork");
    assert_eq!(reply.param("callto.1"), Some("sip/sip:31999@gw1:5060"));
    assert_eq!(reply.param("callto.1.caller"), Some("100"));

    let ivr = timeout(WAIT, call_task)
        .await
        .expect("make_call timed out")
        .expect("call task panicked")
        .expect("make_call failed");
    assert_eq!(ivr.id(), "dumb/3");

    let event = wait_for(&mut events, |e| matches!(e, PbxEvent::OutgoingCall { .. })).await;
    let PbxEvent::OutgoingCall { ivr: event_ivr, destination } = event else {
        unreachable!();
    };
    assert_eq!(event_ivr.id(), "dumb/3");
    assert_eq!(destination.called, "31999");
}

#[tokio::test]
async fn slave_connected_reaches_the_fork_master() {
    let (_pbx, mut events, mut mock) = connected_session().await;

    mock.send("%%>message:route5:1700000000:call.route::id=sip/12:caller=200:called=100")
        .await;
    let event = wait_for(&mut events, |e| matches!(e, PbxEvent::IncomingCall { .. })).await;
    let PbxEvent::IncomingCall { channel, .. } = event else {
        unreachable!();
    };
    let mut chan_events = channel.events().await.expect("subscribe failed");

    channel
        .route_to_destination(Destination::new("100", vec![ForkRoute::to_host("gw1")]))
        .await
        .expect("route failed");
    let _reply = mock.recv_message().await;

    // the callfork master shows up as the first executing leg
    mock.send("%%<message:f1:true:call.execute::id=fork/1:fork.origid=sip/12:peerid=fork/1")
        .await;
    let fork = timeout(WAIT, chan_events.recv())
        .await
        .expect("timed out waiting for fork event")
        .expect("channel events closed");
    let ChannelEvent::Fork { channel: master, .. } = fork else {
        panic!("expected fork event, got {:?}", fork);
    };
    assert_eq!(master.id(), "fork/1");
    let mut master_events = master.events().await.expect("master subscribe failed");

    // a slave leg answers; its peerid names the master plus the slave index
    mock.send("%%<message:f2:true:chan.connected::id=sip/13:peerid=fork/1/2")
        .await;
    let slave = timeout(WAIT, master_events.recv())
        .await
        .expect("timed out waiting for slave-connected")
        .expect("master events closed");
    let ChannelEvent::SlaveConnected(index) = slave else {
        panic!("expected slave-connected, got {:?}", slave);
    };
    assert_eq!(index, "2");
}

#[tokio::test]
async fn duration_timer_drops_the_channel() {
    let (_pbx, mut events, mut mock) = connected_session().await;

    mock.send("%%>message:route4:1700000000:call.route::id=sip/11:caller=200:called=100")
        .await;
    let event = wait_for(&mut events, |e| matches!(e, PbxEvent::IncomingCall { .. })).await;
    let PbxEvent::IncomingCall { channel, .. } = event else {
        unreachable!();
    };
    let mut chan_events = channel.events().await.expect("subscribe failed");

    channel
        .set_timeout(Duration::from_millis(50))
        .await
        .expect("set_timeout failed");

    let timed_out = timeout(WAIT, chan_events.recv())
        .await
        .expect("timed out waiting for timeout event")
        .expect("channel events closed");
    assert!(matches!(timed_out, ChannelEvent::Timeout));

    let drop_msg = mock.recv_message().await;
    assert_eq!(drop_msg.name(), "call.drop");
    assert_eq!(drop_msg.param("id"), Some("sip/11"));
    assert_eq!(drop_msg.param("reason"), Some("Payment Required"));
}

#[tokio::test(start_paused = true)]
async fn make_call_times_out_without_route() {
    let (pbx, _events) = Pbx::new(PbxConfig::new(5040)).expect("session start failed");
    let dest = Destination::new("31999", vec![ForkRoute::to_host("gw1")]);
    let err = pbx.make_call(dest).await.expect_err("expected a timeout");
    assert!(matches!(err, PbxError::Timeout { timeout_ms: 5000 }));
}

#[tokio::test]
async fn allow_unregistered_auth_replies_with_extras() {
    let (_pbx, _events, mut mock) = connected_session().await;

    mock.send("%%>message:auth1:1700000000:user.auth::username=alice:newcall=true")
        .await;
    let reply = mock.recv_message().await;
    assert_eq!(reply.name(), "user.auth");
    assert_eq!(reply.id(), "auth1");
    assert_eq!(reply.processed(), Some(true));
    assert_eq!(reply.param("auth_register"), Some("false"));
    assert_eq!(reply.param("auth_regfile"), Some("false"));
}

#[tokio::test]
async fn register_lookup_and_unregister() {
    let (pbx, mut events, mut mock) = connected_session().await;

    mock.send(&format!(
        "%%>message:reg1:{}:user.register::username=alice:expires=600:ip_host=10.0.0.7:data=sip/sip%zalice@10.0.0.7",
        unix_now()
    ))
    .await;
    let reply = mock.recv_message().await;
    assert_eq!(reply.name(), "user.register");
    assert_eq!(reply.processed(), Some(true));
    wait_for(&mut events, |e| {
        matches!(e, PbxEvent::UserRegister { username } if username == "alice")
    })
    .await;

    let route = pbx
        .local_route("100", "alice")
        .await
        .expect("local_route failed")
        .expect("expected a local route");
    assert_eq!(route.host, "10.0.0.7");
    assert_eq!(route.fullroute, "sip/sip:alice@10.0.0.7");

    mock.send("%%<message:unreg1:true:user.unregister::username=alice")
        .await;
    wait_for(&mut events, |e| {
        matches!(e, PbxEvent::UserUnregister { username } if username == "alice")
    })
    .await;
    let gone = pbx
        .local_route("100", "alice")
        .await
        .expect("local_route failed");
    assert!(gone.is_none());
}

#[tokio::test]
async fn carrier_login_logout_and_notify() {
    let (pbx, mut events, mut mock) = connected_session().await;

    let trunk = Trunk::new("carrier.example", "acct", "secret");
    let account = trunk.line_id();
    pbx.set_carriers(vec![trunk]).await.expect("set_carriers failed");

    let login = mock.recv_message().await;
    assert_eq!(login.name(), "user.login");
    assert_eq!(login.param("account"), Some(account.as_str()));
    assert_eq!(login.param("protocol"), Some("sip"));
    assert_eq!(login.param("registrar"), Some("carrier.example"));
    assert_eq!(login.param("outbound"), Some("carrier.example"));
    assert_eq!(login.param("authname"), Some("acct"));
    assert_eq!(login.param("domain"), Some("carrier.example"));

    mock.send(&format!("%%<message:{}:true:user.login:", login.id()))
        .await;
    mock.send(&format!(
        "%%<message:n1:true:user.notify::account={}:registered=true",
        codec::escape(&account)
    ))
    .await;
    wait_for(&mut events, |e| {
        matches!(e, PbxEvent::CarrierOnline(a) if *a == account)
    })
    .await;

    // removing the trunk logs it out
    pbx.set_carriers(vec![]).await.expect("set_carriers failed");
    let logout = mock.recv_message().await;
    assert_eq!(logout.name(), "user.login");
    assert_eq!(logout.param("account"), Some(account.as_str()));
    assert_eq!(logout.param("operation"), Some("logout"));
}
