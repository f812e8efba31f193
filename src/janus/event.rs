//! Incoming gateway messages
//!
//! Both synchronous responses to our POSTs and events delivered through the
//! long-poll are parsed here into a [`GatewayMessage`].

use serde::Deserialize;
use serde_json::Value;

use crate::error::{RelayError, RelayResult};
use crate::janus::message::Jsep;
use crate::model::handle::HandleId;

/// A parsed gateway message.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayMessage {
    /// Handle the message concerns, when it is handle scoped
    pub sender: Option<HandleId>,
    pub transaction: Option<String>,
    pub notification: Notification,
    pub jsep: Option<Jsep>,
}

/// What the gateway told us.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Request received, the real answer follows as an event
    Ack,
    /// Session or handle created, `id` is the new object's id
    Success { id: Option<u64> },
    /// Gateway-level failure
    Error { code: i64, reason: String },
    /// Videoroom join confirmation with our participant id
    Joined { room: u64, id: u64 },
    /// Publish confirmation ("configured": "ok")
    Configured,
    /// RTP forwarder created
    Forwarded {
        publisher_id: u64,
        stream_id: Option<u64>,
    },
    /// RTP forwarder removed
    ForwardStopped { publisher_id: u64, stream_id: u64 },
    /// Videoroom subscriber attached to a feed; an offer is in the jsep
    Attached { feed: Option<u64> },
    /// Streaming mountpoint is preparing; an offer is in the jsep
    Preparing,
    Starting,
    Started,
    /// Plugin rejected a request
    PluginError { code: i64, reason: String },
    /// Any other plugin payload we do not act upon
    PluginEvent(Value),
    /// PeerConnection is up on the gateway side
    WebrtcUp,
    Media { kind: String, receiving: bool },
    SlowLink { uplink: bool },
    /// PeerConnection closed by the gateway
    Hangup { reason: String },
    /// Handle detached
    Detached,
    /// Remote ICE candidate, or end of candidates
    Trickle { candidate: Option<String>, completed: bool },
    /// The session expired on the gateway
    SessionTimeout,
}

impl Notification {
    /// True if the handle's PeerConnection is gone after this notification.
    pub fn is_cleanup(&self) -> bool {
        matches!(self, Notification::Hangup { .. } | Notification::Detached)
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    janus: String,
    transaction: Option<String>,
    sender: Option<u64>,
    data: Option<RawData>,
    error: Option<RawError>,
    plugindata: Option<RawPluginData>,
    jsep: Option<Jsep>,
    reason: Option<String>,
    #[serde(rename = "type")]
    media_type: Option<String>,
    receiving: Option<bool>,
    uplink: Option<bool>,
    candidate: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawData {
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    code: i64,
    reason: String,
}

#[derive(Debug, Deserialize)]
struct RawPluginData {
    data: Value,
}

/// Parse a single gateway message.
pub fn parse(value: Value) -> RelayResult<GatewayMessage> {
    let raw: RawMessage = serde_json::from_value(value)?;

    let notification = match raw.janus.as_str() {
        "ack" => Notification::Ack,
        "success" | "event" => match raw.plugindata {
            Some(plugindata) => parse_plugin_data(plugindata.data)?,
            None => Notification::Success {
                id: raw.data.and_then(|d| d.id),
            },
        },
        "error" => {
            let error = raw
                .error
                .ok_or_else(|| RelayError::Protocol("error without details".into()))?;
            Notification::Error {
                code: error.code,
                reason: error.reason,
            }
        }
        "webrtcup" => Notification::WebrtcUp,
        "media" => Notification::Media {
            kind: raw.media_type.unwrap_or_default(),
            receiving: raw.receiving.unwrap_or(false),
        },
        "slowlink" => Notification::SlowLink {
            uplink: raw.uplink.unwrap_or(false),
        },
        "hangup" => Notification::Hangup {
            reason: raw.reason.unwrap_or_default(),
        },
        "detached" => Notification::Detached,
        "trickle" => parse_trickle(raw.candidate.as_ref()),
        "timeout" => Notification::SessionTimeout,
        other => {
            return Err(RelayError::Protocol(format!("unknown message '{other}'")));
        }
    };

    Ok(GatewayMessage {
        sender: raw.sender.map(HandleId),
        transaction: raw.transaction,
        notification,
        jsep: raw.jsep,
    })
}

fn parse_trickle(candidate: Option<&Value>) -> Notification {
    let Some(candidate) = candidate else {
        return Notification::Trickle {
            candidate: None,
            completed: true,
        };
    };

    if candidate.get("completed").and_then(Value::as_bool) == Some(true) {
        return Notification::Trickle {
            candidate: None,
            completed: true,
        };
    }

    Notification::Trickle {
        candidate: candidate
            .get("candidate")
            .and_then(Value::as_str)
            .map(str::to_string),
        completed: false,
    }
}

fn parse_plugin_data(data: Value) -> RelayResult<Notification> {
    if let Some(code) = data.get("error_code").and_then(Value::as_i64) {
        let reason = data
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Ok(Notification::PluginError { code, reason });
    }

    if let Some(kind) = data.get("videoroom").and_then(Value::as_str) {
        return parse_videoroom(kind, data.clone());
    }

    if data.get("streaming").is_some() {
        return Ok(parse_streaming(data));
    }

    Ok(Notification::PluginEvent(data))
}

fn parse_videoroom(kind: &str, data: Value) -> RelayResult<Notification> {
    let field = |name: &str| data.get(name).and_then(Value::as_u64);

    let notification = match kind {
        "joined" => Notification::Joined {
            room: field("room").unwrap_or_default(),
            id: field("id")
                .ok_or_else(|| RelayError::Protocol("joined without participant id".into()))?,
        },
        "rtp_forward" => Notification::Forwarded {
            publisher_id: field("publisher_id")
                .ok_or_else(|| RelayError::Protocol("rtp_forward without publisher_id".into()))?,
            stream_id: forward_stream_id(&data),
        },
        "stop_rtp_forward" => Notification::ForwardStopped {
            publisher_id: field("publisher_id").unwrap_or_default(),
            stream_id: field("stream_id").unwrap_or_default(),
        },
        "attached" => Notification::Attached { feed: field("id") },
        "event" if data.get("configured").and_then(Value::as_str) == Some("ok") => {
            Notification::Configured
        }
        "event" if data.get("started").and_then(Value::as_str) == Some("ok") => {
            Notification::Started
        }
        _ => Notification::PluginEvent(data),
    };

    Ok(notification)
}

/// Older gateways report `rtp_stream.video_stream_id`, newer ones a list of
/// `forwarders` with a `stream_id` each.
fn forward_stream_id(data: &Value) -> Option<u64> {
    data.get("rtp_stream")
        .and_then(|s| s.get("video_stream_id"))
        .and_then(Value::as_u64)
        .or_else(|| {
            data.get("forwarders")
                .and_then(Value::as_array)
                .and_then(|f| f.first())
                .and_then(|f| f.get("stream_id"))
                .and_then(Value::as_u64)
        })
}

fn parse_streaming(data: Value) -> Notification {
    let status = data
        .get("result")
        .and_then(|r| r.get("status"))
        .and_then(Value::as_str);

    match status {
        Some("preparing") => Notification::Preparing,
        Some("starting") => Notification::Starting,
        Some("started") => Notification::Started,
        _ => Notification::PluginEvent(data),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::janus::message::JsepKind;

    #[test]
    fn session_success_carries_id() {
        let msg = parse(json!({"janus": "success", "transaction": "tx-1", "data": {"id": 555}}))
            .unwrap();

        assert_eq!(msg.notification, Notification::Success { id: Some(555) });
        assert_eq!(msg.transaction.as_deref(), Some("tx-1"));
        assert_eq!(msg.sender, None);
    }

    #[test]
    fn joined_event_from_long_poll() {
        let msg = parse(json!({
            "janus": "event",
            "session_id": 1,
            "sender": 7,
            "plugindata": {
                "plugin": "janus.plugin.videoroom",
                "data": {"videoroom": "joined", "room": 1234, "id": 42, "publishers": []}
            }
        }))
        .unwrap();

        assert_eq!(msg.sender, Some(HandleId(7)));
        assert_eq!(msg.notification, Notification::Joined { room: 1234, id: 42 });
    }

    #[test]
    fn configured_with_answer() {
        let msg = parse(json!({
            "janus": "event",
            "sender": 7,
            "plugindata": {"plugin": "janus.plugin.videoroom", "data": {"videoroom": "event", "configured": "ok"}},
            "jsep": {"type": "answer", "sdp": "v=0"}
        }))
        .unwrap();

        assert_eq!(msg.notification, Notification::Configured);
        assert_eq!(msg.jsep.unwrap().kind, JsepKind::Answer);
    }

    #[test]
    fn rtp_forward_both_layouts() {
        let legacy = parse(json!({
            "janus": "success",
            "sender": 7,
            "plugindata": {"plugin": "janus.plugin.videoroom", "data": {
                "videoroom": "rtp_forward", "room": 1234, "publisher_id": 42,
                "rtp_stream": {"host": "127.0.0.1", "video": 6000, "video_stream_id": 11}
            }}
        }))
        .unwrap();
        let current = parse(json!({
            "janus": "success",
            "sender": 7,
            "plugindata": {"plugin": "janus.plugin.videoroom", "data": {
                "videoroom": "rtp_forward", "room": 1234, "publisher_id": 42,
                "forwarders": [{"stream_id": 12, "host": "127.0.0.1", "port": 6000}]
            }}
        }))
        .unwrap();

        assert_eq!(
            legacy.notification,
            Notification::Forwarded { publisher_id: 42, stream_id: Some(11) }
        );
        assert_eq!(
            current.notification,
            Notification::Forwarded { publisher_id: 42, stream_id: Some(12) }
        );
    }

    #[test]
    fn streaming_preparing_with_offer() {
        let msg = parse(json!({
            "janus": "event",
            "sender": 9,
            "plugindata": {"plugin": "janus.plugin.streaming", "data": {
                "streaming": "event", "result": {"status": "preparing"}
            }},
            "jsep": {"type": "offer", "sdp": "v=0"}
        }))
        .unwrap();

        assert_eq!(msg.notification, Notification::Preparing);
        assert_eq!(msg.jsep.unwrap().kind, JsepKind::Offer);
    }

    #[test]
    fn plugin_error_wins_over_kind() {
        let msg = parse(json!({
            "janus": "event",
            "sender": 7,
            "plugindata": {"plugin": "janus.plugin.videoroom", "data": {
                "videoroom": "event", "error_code": 426, "error": "No such room (1234)"
            }}
        }))
        .unwrap();

        assert_eq!(
            msg.notification,
            Notification::PluginError { code: 426, reason: "No such room (1234)".into() }
        );
    }

    #[test]
    fn gateway_error_and_cleanups() {
        let err = parse(json!({"janus": "error", "error": {"code": 458, "reason": "No such session"}}))
            .unwrap();
        assert_eq!(
            err.notification,
            Notification::Error { code: 458, reason: "No such session".into() }
        );

        let hangup = parse(json!({"janus": "hangup", "sender": 9, "reason": "DTLS alert"})).unwrap();
        assert!(hangup.notification.is_cleanup());
        assert!(parse(json!({"janus": "detached", "sender": 9})).unwrap().notification.is_cleanup());
    }

    #[test]
    fn trickle_candidate_and_completion() {
        let cand = parse(json!({
            "janus": "trickle", "sender": 9,
            "candidate": {"sdpMid": "0", "sdpMLineIndex": 0, "candidate": "candidate:1 1 udp 2013266431 10.0.0.2 50000 typ host"}
        }))
        .unwrap();
        let done = parse(json!({"janus": "trickle", "sender": 9, "candidate": {"completed": true}})).unwrap();

        assert!(matches!(
            cand.notification,
            Notification::Trickle { candidate: Some(_), completed: false }
        ));
        assert_eq!(
            done.notification,
            Notification::Trickle { candidate: None, completed: true }
        );
    }

    #[test]
    fn unknown_verb_is_rejected() {
        assert!(parse(json!({"janus": "bogus"})).is_err());
    }
}
