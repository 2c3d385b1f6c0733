//! Wire codec for the extmodule line protocol
//!
//! Commands are newline-terminated ASCII lines. Values travel through the
//! engine's own percent-escaping: control bytes and `:` are emitted as `%`
//! followed by the byte plus `0x40`, and `%` itself doubles to `%%`. The
//! fixed-position fields of a frame (id, time, name) are never escaped;
//! parameter keys, values and the return-value slot always are.

use crate::error::{PbxError, PbxResult};
use crate::message::{Message, MessageKind};
use std::collections::HashMap;

/// Escape a string for transport.
///
/// Bytes below `0x20` and the separator `:` become `%` + (byte + 0x40);
/// `%` becomes `%%`; everything else passes through.
pub fn escape(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'%' => out.extend_from_slice(b"%%"),
            b if b < 0x20 || b == b':' => {
                out.push(b'%');
                out.push(b + 0x40);
            }
            b => out.push(b),
        }
    }
    // only ASCII bytes are rewritten, so multibyte sequences pass through
    String::from_utf8_lossy(&out).into_owned()
}

/// Exact inverse of [`escape`].
///
/// A `%` with no following byte is preserved literally rather than being
/// treated as an error.
pub fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            match bytes.get(i + 1) {
                Some(b'%') => {
                    out.push(b'%');
                    i += 2;
                }
                Some(&next) => {
                    out.push(next.wrapping_sub(0x40));
                    i += 2;
                }
                None => {
                    // lone trailing escape, keep it
                    out.push(b'%');
                    i += 1;
                }
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// One decoded line from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `%%>message` (request) or `%%<message` (reply / watched notification).
    Message(Message),
    /// `%%<install` confirmation.
    InstallReply {
        /// Priority echoed by the engine.
        priority: u32,
        /// Message name.
        name: String,
        /// Whether the install took effect.
        success: bool,
    },
    /// `%%<watch` confirmation.
    WatchReply {
        /// Message name.
        name: String,
        /// Whether the watch took effect.
        success: bool,
    },
    /// `%%<uninstall` confirmation; recognized and ignored.
    UninstallReply,
    /// `%%<unwatch` confirmation; recognized and ignored.
    UnwatchReply,
}

/// Encode the initial `%%>connect` line.
pub fn encode_connect(role: &str) -> String {
    format!("%%>connect:{}", role)
}

/// Encode an install request at an optional priority.
pub fn encode_install(name: &str, priority: Option<u32>) -> String {
    match priority {
        Some(priority) => format!("%%>install:{}:{}", priority, name),
        None => format!("%%>install::{}", name),
    }
}

/// Encode an uninstall request.
pub fn encode_uninstall(name: &str) -> String {
    format!("%%>uninstall:{}", name)
}

/// Encode a watch request.
pub fn encode_watch(name: &str) -> String {
    format!("%%>watch:{}", name)
}

/// Encode an unwatch request.
pub fn encode_unwatch(name: &str) -> String {
    format!("%%>unwatch:{}", name)
}

/// Encode a message (request or reply) as one wire line, without the
/// trailing newline.
pub fn encode_message(msg: &Message) -> String {
    let mut line = match msg.kind() {
        MessageKind::Request { time } => format!(
            "%%>message:{}:{}:{}:{}",
            msg.id(),
            time,
            msg.name(),
            escape(msg.retvalue())
        ),
        MessageKind::Reply { processed } => format!(
            "%%<message:{}:{}:{}:{}",
            msg.id(),
            processed,
            msg.name(),
            escape(msg.retvalue())
        ),
    };
    for (key, value) in msg.params() {
        line.push(':');
        line.push_str(&escape(key));
        line.push('=');
        line.push_str(&escape(value));
    }
    line
}

/// Decode one wire line into a [`Frame`].
///
/// Unknown prefixes are protocol errors; the caller drops the frame and
/// keeps reading.
pub fn decode(line: &str) -> PbxResult<Frame> {
    if let Some(rest) = line.strip_prefix("%%>message:") {
        return decode_message_request(rest);
    }
    if let Some(rest) = line.strip_prefix("%%<message:") {
        return decode_message_reply(rest);
    }
    if let Some(rest) = line.strip_prefix("%%<install:") {
        return decode_install_reply(rest);
    }
    if let Some(rest) = line.strip_prefix("%%<watch:") {
        return decode_watch_reply(rest);
    }
    if line.starts_with("%%<uninstall:") {
        return Ok(Frame::UninstallReply);
    }
    if line.starts_with("%%<unwatch:") {
        return Ok(Frame::UnwatchReply);
    }
    Err(PbxError::protocol(format!("unknown frame: {}", line)))
}

/// Split the parameter tail of a message line.
///
/// Each part is `key=value` with a left-limited split, so values may contain
/// `=`. A part with no `=` becomes a key with an empty value. The `handlers`
/// key is decoder noise from the engine and is discarded.
fn decode_params<'a>(parts: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for part in parts {
        let (key, value) = match part.split_once('=') {
            Some((key, value)) => (unescape(key), unescape(value)),
            None => (unescape(part), String::new()),
        };
        if key == "handlers" {
            continue;
        }
        params.insert(key, value);
    }
    params
}

fn decode_message_request(rest: &str) -> PbxResult<Frame> {
    let mut parts = rest.split(':');
    let id = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PbxError::protocol("message request missing id"))?;
    let time: u64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| PbxError::protocol("message request has bad time"))?;
    let name = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PbxError::protocol("message request missing name"))?;
    let retvalue = unescape(parts.next().unwrap_or(""));
    let params = decode_params(parts);

    Ok(Frame::Message(Message::from_parts(
        name,
        id,
        MessageKind::Request { time },
        retvalue,
        params,
    )))
}

fn decode_message_reply(rest: &str) -> PbxResult<Frame> {
    let mut parts = rest.split(':');
    let id = parts
        .next()
        .ok_or_else(|| PbxError::protocol("message reply missing id"))?;
    let processed = match parts.next() {
        Some("true") => true,
        Some("false") => false,
        other => {
            return Err(PbxError::protocol(format!(
                "message reply has bad processed flag: {:?}",
                other
            )))
        }
    };
    let name = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PbxError::protocol("message reply missing name"))?;
    let retvalue = unescape(parts.next().unwrap_or(""));
    let params = decode_params(parts);

    Ok(Frame::Message(Message::from_parts(
        name,
        id.to_string(),
        MessageKind::Reply { processed },
        retvalue,
        params,
    )))
}

fn decode_install_reply(rest: &str) -> PbxResult<Frame> {
    let mut parts = rest.split(':');
    let priority: u32 = parts
        .next()
        .and_then(|s| if s.is_empty() { Some(0) } else { s.parse().ok() })
        .ok_or_else(|| PbxError::protocol("install reply has bad priority"))?;
    let name = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PbxError::protocol("install reply missing name"))?;
    let success = parts.next() == Some("true");
    Ok(Frame::InstallReply {
        priority,
        name: name.to_string(),
        success,
    })
}

fn decode_watch_reply(rest: &str) -> PbxResult<Frame> {
    let mut parts = rest.split(':');
    let name = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PbxError::protocol("watch reply missing name"))?;
    let success = parts.next() == Some("true");
    Ok(Frame::WatchReply {
        name: name.to_string(),
        success,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape("a:b%c\n"), "a%zb%%c%J");
    }

    #[test]
    fn test_escape_passthrough() {
        assert_eq!(escape("plain text 123"), "plain text 123");
        assert_eq!(escape(""), "");
    }

    #[test]
    fn test_escape_round_trip_non_ascii() {
        let s = "héllo:wörld\n";
        assert_eq!(unescape(&escape(s)), s);
    }

    #[test]
    fn test_unescape_inverse() {
        assert_eq!(unescape("a%zb%%c%J"), "a:b%c\n");
    }

    #[test]
    fn test_unescape_lone_trailing_percent() {
        assert_eq!(unescape("abc%"), "abc%");
        assert_eq!(unescape("%"), "%");
    }

    #[test]
    fn test_escape_round_trip_random_ascii() {
        use rand::{distributions::Uniform, Rng, SeedableRng};

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x9a7e);
        let dist = Uniform::new_inclusive(0u8, 0x7f);
        for _ in 0..1000 {
            let len = rng.gen_range(0..64);
            let bytes: Vec<u8> = (0..len).map(|_| rng.sample(dist)).collect();
            let s = String::from_utf8(bytes).unwrap();
            assert_eq!(unescape(&escape(&s)), s, "round trip failed for {:?}", s);
        }
    }

    #[test]
    fn test_decode_message_request() {
        let frame =
            decode("%%>message:id1:1700000000:call.route:fork:called=100:caller=200").unwrap();
        let Frame::Message(msg) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(msg.name(), "call.route");
        assert_eq!(msg.id(), "id1");
        assert!(msg.is_request());
        assert_eq!(msg.time(), Some(1_700_000_000));
        assert_eq!(msg.retvalue(), "fork");
        assert_eq!(msg.param("called"), Some("100"));
        assert_eq!(msg.param("caller"), Some("200"));
    }

    #[test]
    fn test_decode_message_reply() {
        let frame = decode("%%<message:id9:true:chan.connected::id=sip/5:peerid=dumb/1").unwrap();
        let Frame::Message(msg) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(msg.name(), "chan.connected");
        assert_eq!(msg.processed(), Some(true));
        assert_eq!(msg.retvalue(), "");
        assert_eq!(msg.param("id"), Some("sip/5"));
        assert_eq!(msg.param("peerid"), Some("dumb/1"));
    }

    #[test]
    fn test_decode_value_keeps_equals() {
        let frame = decode("%%>message:i:1:m.x::filter=a=b=c").unwrap();
        let Frame::Message(msg) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(msg.param("filter"), Some("a=b=c"));
    }

    #[test]
    fn test_decode_drops_handlers_key() {
        let frame = decode("%%<message:i:false:engine.status::handlers=sip%z10:module=sip").unwrap();
        let Frame::Message(msg) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(msg.param("handlers"), None);
        assert_eq!(msg.param("module"), Some("sip"));
    }

    #[test]
    fn test_decode_param_without_value() {
        let frame = decode("%%>message:i:1:call.route::flag").unwrap();
        let Frame::Message(msg) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(msg.param("flag"), Some(""));
    }

    #[test]
    fn test_decode_install_reply() {
        assert_eq!(
            decode("%%<install:10:call.route:true").unwrap(),
            Frame::InstallReply {
                priority: 10,
                name: "call.route".to_string(),
                success: true,
            }
        );
        assert_eq!(
            decode("%%<install::user.auth:false").unwrap(),
            Frame::InstallReply {
                priority: 0,
                name: "user.auth".to_string(),
                success: false,
            }
        );
    }

    #[test]
    fn test_decode_watch_reply() {
        assert_eq!(
            decode("%%<watch:chan.hangup:true").unwrap(),
            Frame::WatchReply {
                name: "chan.hangup".to_string(),
                success: true,
            }
        );
    }

    #[test]
    fn test_decode_ignored_replies() {
        assert_eq!(
            decode("%%<uninstall:10:call.route:true").unwrap(),
            Frame::UninstallReply
        );
        assert_eq!(
            decode("%%<unwatch:chan.dtmf:true").unwrap(),
            Frame::UnwatchReply
        );
    }

    #[test]
    fn test_decode_unknown_prefix_is_error() {
        assert!(decode("%%>weird:stuff").is_err());
        assert!(decode("Error in: %%>message").is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn test_decode_bad_time_is_error() {
        assert!(decode("%%>message:id1:not-a-time:call.route:").is_err());
    }

    #[test]
    fn test_decode_bad_processed_is_error() {
        assert!(decode("%%<message:id1:maybe:call.route:").is_err());
    }

    #[test]
    fn test_encode_request_layout() {
        let mut msg = Message::from_parts(
            "call.drop",
            "abc",
            MessageKind::Request { time: 1_700_000_000 },
            "",
            Default::default(),
        );
        msg.set_param("reason", "Payment Required");
        assert_eq!(
            encode_message(&msg),
            "%%>message:abc:1700000000:call.drop::reason=Payment Required"
        );
    }

    #[test]
    fn test_encode_reply_layout() {
        let req = Message::from_parts(
            "call.route",
            "id1",
            MessageKind::Request { time: 5 },
            "",
            Default::default(),
        );
        let mut reply = req.to_reply(true);
        reply.set_retvalue("dumb/");
        assert_eq!(encode_message(&reply), "%%<message:id1:true:call.route:dumb/");
    }

    #[test]
    fn test_encode_escapes_retvalue_and_params() {
        let mut msg = Message::from_parts(
            "m.x",
            "i",
            MessageKind::Request { time: 1 },
            "a:b",
            Default::default(),
        );
        msg.set_param("text", "50%:off\n");
        assert_eq!(
            encode_message(&msg),
            "%%>message:i:1:m.x:a%zb:text=50%%%zoff%J"
        );
    }

    #[test]
    fn test_message_round_trip() {
        let mut msg = Message::request("call.execute");
        msg.set_retvalue("ret:with:colons");
        msg.set_param("callto", "dumb/");
        msg.set_param("target", "31999");
        msg.set_param("odd", "line\nbreak%and:colon");

        let Frame::Message(decoded) = decode(&encode_message(&msg)).unwrap() else {
            panic!("expected message frame");
        };
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_handshake_lines() {
        assert_eq!(encode_connect("global"), "%%>connect:global");
        assert_eq!(
            encode_install("call.route", Some(10)),
            "%%>install:10:call.route"
        );
        assert_eq!(encode_install("call.route", None), "%%>install::call.route");
        assert_eq!(encode_uninstall("user.auth"), "%%>uninstall:user.auth");
        assert_eq!(encode_watch("chan.dtmf"), "%%>watch:chan.dtmf");
        assert_eq!(encode_unwatch("chan.dtmf"), "%%>unwatch:chan.dtmf");
    }
}
