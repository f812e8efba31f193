//! Janus REST transport
//!
//! Requests are POSTed to the gateway URL, scoped by session and handle in
//! the path. Asynchronous events are fetched by long-polling the session URL
//! on a separate task.

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::janus::event::{self, GatewayMessage, Notification};
use crate::janus::message::{Envelope, Request};
use crate::model::handle::{HandleId, SessionId};

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    server: String,
}

impl HttpTransport {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            server: server.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn url(&self, session: Option<SessionId>, handle: Option<HandleId>) -> String {
        match (session, handle) {
            (Some(s), Some(h)) => format!("{}/{}/{}", self.server, *s, *h),
            (Some(s), None) => format!("{}/{}", self.server, *s),
            _ => self.server.clone(),
        }
    }

    /// Create a gateway session.
    pub async fn create_session(&self) -> RelayResult<SessionId> {
        let reply = self.post(None, None, Request::Create).await?;
        match reply.notification {
            Notification::Success { id: Some(id) } => Ok(SessionId(id)),
            other => Err(RelayError::Session(format!(
                "unexpected reply to create: {other:?}"
            ))),
        }
    }

    /// Attach a plugin handle to the session.
    pub async fn attach(&self, session: SessionId, plugin: &str) -> RelayResult<HandleId> {
        let request = Request::Attach {
            plugin: plugin.to_string(),
        };
        let reply = self.post(Some(session), None, request).await?;
        match reply.notification {
            Notification::Success { id: Some(id) } => Ok(HandleId(id)),
            other => Err(RelayError::Protocol(format!(
                "unexpected reply to attach: {other:?}"
            ))),
        }
    }

    /// Post a request and parse the synchronous reply. A gateway-level error
    /// reply is returned as `Err`.
    pub async fn post(
        &self,
        session: Option<SessionId>,
        handle: Option<HandleId>,
        request: Request,
    ) -> RelayResult<GatewayMessage> {
        let envelope = Envelope::new(request);
        let url = self.url(session, handle);
        debug!("POST {} {}", url, serde_json::to_string(&envelope)?);

        let value: Value = self
            .client
            .post(&url)
            .json(&envelope)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut reply = event::parse(value)?;
        if reply.sender.is_none() {
            reply.sender = handle;
        }

        if let Notification::Error { code, reason } = &reply.notification {
            return Err(RelayError::Session(format!("{code}: {reason}")));
        }

        Ok(reply)
    }

    /// Wait for the next batch of events on the session.
    pub async fn poll(&self, session: SessionId, maxev: u32) -> RelayResult<Vec<GatewayMessage>> {
        let url = format!("{}?maxev={}", self.url(Some(session), None), maxev);

        let value: Value = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let values = match value {
            Value::Array(values) => values,
            single => vec![single],
        };

        values
            .into_iter()
            // An idle long-poll ends with a keepalive, there is nothing in it.
            .filter(|v| v.get("janus").and_then(Value::as_str) != Some("keepalive"))
            .map(event::parse)
            .collect()
    }
}

/// Spawn the long-poll loop. Events, and the error that ends the loop, are
/// sent over `tx`; the loop also ends when the receiver is dropped.
pub fn spawn_long_poll(
    transport: HttpTransport,
    session: SessionId,
    maxev: u32,
    tx: UnboundedSender<RelayResult<GatewayMessage>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Long-polling session {} on {}", *session, transport.server());
        loop {
            match transport.poll(session, maxev).await {
                Ok(messages) => {
                    for message in messages {
                        if tx.send(Ok(message)).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!("Long-poll for session {} failed: {}", *session, e);
                    let _ = tx.send(Err(e));
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_scoped_by_session_and_handle() {
        let t = HttpTransport::new("http://localhost:8088/janus/");

        assert_eq!(t.url(None, None), "http://localhost:8088/janus");
        assert_eq!(t.url(Some(SessionId(1)), None), "http://localhost:8088/janus/1");
        assert_eq!(
            t.url(Some(SessionId(1)), Some(HandleId(2))),
            "http://localhost:8088/janus/1/2"
        );
    }
}
