//! Outgoing gateway requests
//!
//! Janus wraps every request in a `{"janus": <verb>, "transaction": <id>}`
//! envelope. Plugin requests travel in the `body` of a `message`, optionally
//! next to a `jsep` session description.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// SDP description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsepKind {
    Offer,
    Answer,
}

/// An SDP offer or answer as Janus carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: JsepKind,
    pub sdp: String,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: JsepKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Participant type used when joining a video room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    Publisher,
    Subscriber,
}

/// Trickle payload. We put our candidates in the SDP, so the only thing we
/// ever trickle is the end-of-candidates marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrickleCandidate {
    pub completed: bool,
}

/// Requests understood by the videoroom and streaming plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum PluginBody {
    Join {
        room: u64,
        ptype: ParticipantType,
        #[serde(skip_serializing_if = "Option::is_none")]
        display: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pin: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        feed: Option<u64>,
    },
    Publish {
        audio: bool,
        video: bool,
    },
    RtpForward {
        room: u64,
        publisher_id: u64,
        host: String,
        video_port: u16,
        video_pt: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    StopRtpForward {
        room: u64,
        publisher_id: u64,
        stream_id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    Watch {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        pin: Option<String>,
    },
    Start,
}

impl PluginBody {
    /// Name of the request, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            PluginBody::Join { .. } => "join",
            PluginBody::Publish { .. } => "publish",
            PluginBody::RtpForward { .. } => "rtp_forward",
            PluginBody::StopRtpForward { .. } => "stop_rtp_forward",
            PluginBody::Watch { .. } => "watch",
            PluginBody::Start => "start",
        }
    }
}

/// Gateway-level requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum Request {
    Create,
    Attach {
        plugin: String,
    },
    Message {
        body: PluginBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<Jsep>,
    },
    Trickle {
        candidate: TrickleCandidate,
    },
    Keepalive,
    Detach,
    Destroy,
}

/// A request stamped with its transaction id, ready to be posted.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub request: Request,
    pub transaction: String,
}

impl Envelope {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            transaction: next_transaction(),
        }
    }
}

/// Transaction ids only need to be unique within this process.
pub fn next_transaction() -> String {
    static TX_COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = TX_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("tx-{n:08x}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn join_omits_unset_fields() {
        let body = PluginBody::Join {
            room: 1234,
            ptype: ParticipantType::Publisher,
            display: Some("user".into()),
            pin: None,
            feed: None,
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"request": "join", "room": 1234, "ptype": "publisher", "display": "user"})
        );
    }

    #[test]
    fn message_carries_body_jsep_and_transaction() {
        let envelope = Envelope::new(Request::Message {
            body: PluginBody::Publish {
                audio: false,
                video: true,
            },
            jsep: Some(Jsep::offer("v=0\r\n")),
        });
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["janus"], "message");
        assert_eq!(value["body"], json!({"request": "publish", "audio": false, "video": true}));
        assert_eq!(value["jsep"], json!({"type": "offer", "sdp": "v=0\r\n"}));
        assert!(value["transaction"].as_str().unwrap().starts_with("tx-"));
    }

    #[test]
    fn rtp_forward_shape() {
        let body = PluginBody::RtpForward {
            room: 1234,
            publisher_id: 42,
            host: "127.0.0.1".into(),
            video_port: 6000,
            video_pt: 96,
            secret: Some("adminpwd".into()),
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "request": "rtp_forward",
                "room": 1234,
                "publisher_id": 42,
                "host": "127.0.0.1",
                "video_port": 6000,
                "video_pt": 96,
                "secret": "adminpwd"
            })
        );
    }

    #[test]
    fn unit_requests_are_bare_verbs() {
        assert_eq!(serde_json::to_value(Request::Create).unwrap(), json!({"janus": "create"}));
        assert_eq!(
            serde_json::to_value(PluginBody::Start).unwrap(),
            json!({"request": "start"})
        );
    }

    #[test]
    fn transactions_are_unique() {
        assert_ne!(next_transaction(), next_transaction());
    }
}
