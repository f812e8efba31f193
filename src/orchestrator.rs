//! Signalling orchestrator
//!
//! A sans-IO state machine driving the publish → forward → watch sequence
//! against the gateway. It is fed [`Trigger`]s (gateway messages, results of
//! actions it asked for, media events, clock ticks) and answers with the
//! [`Action`]s the driver has to carry out. Each step is started by the
//! confirmation of the previous one, never by elapsed time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use str0m::media::Mid;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ForwardConfig, SubscribeTarget};
use crate::error::RelayError;
use crate::janus::event::{GatewayMessage, Notification};
use crate::janus::message::{Jsep, JsepKind, ParticipantType, PluginBody};
use crate::model::forward::{ForwardKey, ForwardTable, ForwardingRule};
use crate::model::handle::{
    HandleId, Negotiation, PluginHandle, Role, RoomMembership, SessionId, SurfaceId,
};
use crate::model::status::{StatusBoard, StatusLine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Joining,
    Publishing,
    AwaitingForward,
    Subscribing,
    Streaming,
    Failed,
}

/// Everything the orchestrator can be told.
#[derive(Debug)]
pub enum Trigger {
    Start,
    MediaAcquired,
    MediaFailed(RelayError),
    SessionCreated(Result<SessionId, RelayError>),
    /// The session stopped working (long-poll or keepalive failed)
    SessionLost(RelayError),
    Attached(Role, Result<HandleId, RelayError>),
    OfferCreated(Role, Result<Jsep, RelayError>),
    AnswerApplied(Role, Result<(), RelayError>),
    AnswerCreated(Role, Result<Jsep, RelayError>),
    /// A request posted for `role` failed before the gateway answered it
    RequestFailed(Role, RelayError),
    Gateway(GatewayMessage),
    /// A track became available on the connection of `role`
    TrackAdded(Role, Mid),
    /// The media connection of `role` went away
    ConnectionLost(Role),
    Tick,
    /// Run publish → forward → watch again in the same session
    Rerun,
    Dispose,
}

/// Work the driver carries out on behalf of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    AcquireMedia,
    CreateSession,
    Attach(Role),
    CreateOffer(Role),
    ApplyAnswer(Role, Jsep),
    CreateAnswer(Role, Jsep),
    Send {
        role: Role,
        body: PluginBody,
        jsep: Option<Jsep>,
    },
    AddRemoteCandidate(Role, String),
    TrickleComplete(Role),
    Render {
        surface: SurfaceId,
        role: Role,
        mid: Mid,
    },
    ClearSurface(SurfaceId),
    /// Stop rendering into a surface but keep its content
    CloseSurface(SurfaceId),
    Detach(Role),
    DestroySession,
    Status(String),
}

/// The literal values that parameterise the sequence.
#[derive(Debug, Clone)]
pub struct Plan {
    pub room: u64,
    pub display: String,
    pub pin: Option<String>,
    pub secret: Option<String>,
    pub forward: Option<ForwardConfig>,
    pub subscribe: SubscribeTarget,
    pub step_timeout: Option<Duration>,
}

impl From<&Config> for Plan {
    fn from(config: &Config) -> Self {
        Self {
            room: config.room.id,
            display: config.room.display.clone(),
            pin: config.room.pin.clone(),
            secret: config.room.secret.clone(),
            forward: config.forward.clone(),
            subscribe: config.subscribe.clone(),
            step_timeout: config.step_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RenderedTrack {
    role: Role,
    mid: Mid,
    removed: bool,
}

#[derive(Debug)]
pub struct Orchestrator {
    plan: Plan,
    state: State,
    session: Option<SessionId>,
    handles: HashMap<Role, PluginHandle>,
    membership: Option<RoomMembership>,
    publish_confirmed: bool,
    forwards: ForwardTable,
    tracks: Vec<RenderedTrack>,
    status: StatusBoard,
    deadline: Option<(Instant, &'static str)>,
}

impl Orchestrator {
    pub fn new(plan: Plan) -> Self {
        Self {
            plan,
            state: State::Idle,
            session: None,
            handles: HashMap::new(),
            membership: None,
            publish_confirmed: false,
            forwards: ForwardTable::default(),
            tracks: vec![],
            status: StatusBoard::default(),
            deadline: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn handle(&self, role: Role) -> Option<&PluginHandle> {
        self.handles.get(&role)
    }

    pub fn membership(&self) -> Option<&RoomMembership> {
        self.membership.as_ref()
    }

    pub fn forwards(&self) -> &ForwardTable {
        &self.forwards
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    /// Deadline of the step currently waiting on the gateway.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|(at, _)| at)
    }

    /// The role a gateway handle id belongs to.
    pub fn role_of(&self, handle: HandleId) -> Option<Role> {
        self.handles
            .values()
            .find(|h| h.id == handle)
            .map(|h| h.role)
    }

    /// Whether frames of the given track should still reach a surface.
    pub fn should_render(&self, role: Role, mid: Mid) -> bool {
        self.tracks
            .iter()
            .any(|t| t.role == role && t.mid == mid && !t.removed)
    }

    /// Role of the handle receiving the processed stream.
    pub fn receiving_role(&self) -> Role {
        match self.plan.subscribe {
            SubscribeTarget::Streaming { .. } => Role::Watcher,
            SubscribeTarget::Room { .. } => Role::Subscriber,
        }
    }

    pub fn handle_trigger(&mut self, now: Instant, trigger: Trigger) -> Vec<Action> {
        match trigger {
            Trigger::Dispose => return self.dispose(),
            Trigger::TrackAdded(role, mid) => return self.track_added(role, mid),
            Trigger::ConnectionLost(role) => return self.cleanup(role, "connection lost"),
            Trigger::Gateway(msg) if msg.notification.is_cleanup() => {
                return self.gateway_cleanup(msg);
            }
            _ => {}
        }

        if self.state == State::Failed {
            debug!("Ignoring {:?} after failure", trigger);
            return vec![];
        }

        match trigger {
            Trigger::Start => self.start(now),
            Trigger::MediaAcquired => self.media_acquired(now),
            Trigger::MediaFailed(e) => self.fail(e),
            Trigger::SessionCreated(result) => self.session_created(now, result),
            Trigger::Attached(role, result) => self.attached(now, role, result),
            Trigger::OfferCreated(role, result) => self.offer_created(now, role, result),
            Trigger::AnswerApplied(role, result) => self.answer_applied(now, role, result),
            Trigger::AnswerCreated(role, result) => self.answer_created(now, role, result),
            Trigger::RequestFailed(_, e) => self.fail(e),
            Trigger::SessionLost(e) => self.fail(RelayError::Session(e.to_string())),
            Trigger::Gateway(msg) => self.gateway(now, msg),
            Trigger::Tick => self.tick(now),
            Trigger::Rerun => self.rerun(now),
            Trigger::Dispose
            | Trigger::TrackAdded(..)
            | Trigger::ConnectionLost(_) => vec![],
        }
    }

    fn start(&mut self, now: Instant) -> Vec<Action> {
        if self.state != State::Idle {
            warn!("Start ignored in state {:?}", self.state);
            return vec![];
        }

        self.transition(State::Connecting);
        self.arm(now, "local media");
        vec![self.say("Acquiring local media"), Action::AcquireMedia]
    }

    fn media_acquired(&mut self, now: Instant) -> Vec<Action> {
        if self.state != State::Connecting {
            return vec![];
        }

        self.arm(now, "session");
        vec![self.say("Connecting to gateway"), Action::CreateSession]
    }

    fn session_created(
        &mut self,
        now: Instant,
        result: Result<SessionId, RelayError>,
    ) -> Vec<Action> {
        let id = match result {
            Ok(id) => id,
            Err(e) => return self.fail(RelayError::Session(e.to_string())),
        };

        info!("Session {} created", *id);
        self.session = Some(id);
        self.transition(State::Joining);
        self.arm(now, "publisher attach");
        vec![Action::Attach(Role::Publisher)]
    }

    fn attached(
        &mut self,
        now: Instant,
        role: Role,
        result: Result<HandleId, RelayError>,
    ) -> Vec<Action> {
        let id = match result {
            Ok(id) => id,
            Err(e) => return self.fail(RelayError::attach(role, e)),
        };

        info!("Attached {} handle {}", role, *id);
        self.handles.insert(role, PluginHandle::new(id, role));

        match role {
            Role::Publisher => {
                self.arm(now, "join");
                vec![Action::Send {
                    role,
                    body: PluginBody::Join {
                        room: self.plan.room,
                        ptype: ParticipantType::Publisher,
                        display: Some(self.plan.display.clone()),
                        pin: self.plan.pin.clone(),
                        feed: None,
                    },
                    jsep: None,
                }]
            }
            Role::Subscriber => {
                let feed = match &self.plan.subscribe {
                    SubscribeTarget::Room { feed } => *feed,
                    SubscribeTarget::Streaming { .. } => None,
                }
                .or(self.membership.map(|m| m.participant_id));

                let Some(feed) = feed else {
                    return self.fail(RelayError::Precondition(
                        "no feed to subscribe to".into(),
                    ));
                };

                self.arm(now, "subscriber offer");
                vec![Action::Send {
                    role,
                    body: PluginBody::Join {
                        room: self.plan.room,
                        ptype: ParticipantType::Subscriber,
                        display: None,
                        pin: self.plan.pin.clone(),
                        feed: Some(feed),
                    },
                    jsep: None,
                }]
            }
            Role::Watcher => {
                let (id, pin) = match &self.plan.subscribe {
                    SubscribeTarget::Streaming { mountpoint, pin } => (*mountpoint, pin.clone()),
                    SubscribeTarget::Room { .. } => {
                        return self.fail(RelayError::Precondition(
                            "watcher attached without a mountpoint".into(),
                        ));
                    }
                };

                self.arm(now, "watch offer");
                vec![Action::Send {
                    role,
                    body: PluginBody::Watch { id, pin },
                    jsep: None,
                }]
            }
        }
    }

    fn offer_created(
        &mut self,
        now: Instant,
        role: Role,
        result: Result<Jsep, RelayError>,
    ) -> Vec<Action> {
        let jsep = match result {
            Ok(jsep) => jsep,
            Err(e) => return self.fail(e),
        };

        let Some(handle) = self.handles.get_mut(&role) else {
            return vec![];
        };
        if handle.negotiation != Negotiation::OfferRequested {
            warn!("Unexpected offer for {} in {:?}", role, handle.negotiation);
            return vec![];
        }
        handle.negotiation = Negotiation::OfferSent;

        self.arm(now, "publish confirmation");
        vec![
            self.say("Publishing"),
            Action::Send {
                role,
                body: PluginBody::Publish {
                    audio: false,
                    video: true,
                },
                jsep: Some(jsep),
            },
            Action::TrickleComplete(role),
        ]
    }

    fn answer_applied(
        &mut self,
        now: Instant,
        role: Role,
        result: Result<(), RelayError>,
    ) -> Vec<Action> {
        if let Err(e) = result {
            return self.fail(e);
        }

        let Some(handle) = self.handles.get_mut(&role) else {
            return vec![];
        };
        if handle.negotiation != Negotiation::OfferSent {
            warn!("Answer applied for {} in {:?}", role, handle.negotiation);
            return vec![];
        }
        handle.negotiation = Negotiation::Complete;

        self.after_publish(now)
    }

    fn answer_created(
        &mut self,
        now: Instant,
        role: Role,
        result: Result<Jsep, RelayError>,
    ) -> Vec<Action> {
        let jsep = match result {
            Ok(jsep) => jsep,
            Err(e) => return self.fail(e),
        };

        let Some(handle) = self.handles.get_mut(&role) else {
            return vec![];
        };
        if handle.negotiation != Negotiation::RemoteOffer {
            warn!("Dropping answer for {}: no remote offer", role);
            return vec![];
        }
        handle.negotiation = Negotiation::AnswerSent;

        self.arm(now, "stream start");
        vec![
            Action::Send {
                role,
                body: PluginBody::Start,
                jsep: Some(jsep),
            },
            Action::TrickleComplete(role),
        ]
    }

    fn gateway(&mut self, now: Instant, msg: GatewayMessage) -> Vec<Action> {
        let role = msg.sender.and_then(|h| self.role_of(h));

        let mut actions = match (&msg.notification, role) {
            (Notification::Error { code, reason }, _) => {
                return self.fail(RelayError::Session(format!("{code}: {reason}")));
            }
            (Notification::SessionTimeout, _) => {
                return self.fail(RelayError::Session("session timed out".into()));
            }
            (Notification::PluginError { code, reason }, _) => {
                return self.fail(RelayError::Plugin {
                    code: *code,
                    reason: reason.clone(),
                });
            }
            (Notification::Joined { room, id }, Some(Role::Publisher)) => {
                self.joined(*room, *id)
            }
            (Notification::Configured, Some(Role::Publisher))
                if self.state == State::Publishing =>
            {
                self.publish_confirmed = true;
                self.after_publish(now)
            }
            (Notification::Forwarded { publisher_id, stream_id }, _) => {
                self.forwarded(now, *publisher_id, *stream_id)
            }
            (Notification::ForwardStopped { publisher_id, stream_id }, _) => {
                debug!("Forwarder {} of {} stopped", stream_id, publisher_id);
                vec![]
            }
            (Notification::Started | Notification::Starting | Notification::WebrtcUp, Some(r))
                if r.is_receiving() =>
            {
                self.started(r)
            }
            (Notification::Trickle { candidate: Some(c), .. }, Some(r)) => {
                vec![Action::AddRemoteCandidate(r, c.clone())]
            }
            (Notification::SlowLink { uplink }, Some(r)) => {
                warn!("Slow link on {} (uplink: {})", r, uplink);
                vec![]
            }
            (Notification::Ack, _) => vec![],
            (other, r) => {
                debug!("Gateway message for {:?}: {:?}", r, other);
                vec![]
            }
        };

        if let (Some(jsep), Some(role)) = (msg.jsep, role) {
            actions.extend(self.remote_jsep(now, role, jsep));
        }

        actions
    }

    fn joined(&mut self, room: u64, id: u64) -> Vec<Action> {
        if self.state != State::Joining {
            return vec![];
        }

        self.membership = Some(RoomMembership {
            room,
            participant_id: id,
            role: Role::Publisher,
        });
        if let Some(handle) = self.handles.get_mut(&Role::Publisher) {
            handle.negotiation = Negotiation::OfferRequested;
        }
        self.transition(State::Publishing);

        vec![
            self.say(format!("Joined room {room} as {id}")),
            Action::CreateOffer(Role::Publisher),
        ]
    }

    fn remote_jsep(&mut self, now: Instant, role: Role, jsep: Jsep) -> Vec<Action> {
        let Some(handle) = self.handles.get_mut(&role) else {
            return vec![];
        };

        match jsep.kind {
            JsepKind::Answer if handle.negotiation == Negotiation::OfferSent => {
                vec![Action::ApplyAnswer(role, jsep)]
            }
            JsepKind::Offer if role.is_receiving() => {
                handle.negotiation = Negotiation::RemoteOffer;
                self.arm(now, "local answer");
                vec![Action::CreateAnswer(role, jsep)]
            }
            kind => {
                warn!("Unexpected {:?} for {} in {:?}", kind, role, handle.negotiation);
                vec![]
            }
        }
    }

    /// Publishing is done once the gateway confirmed it and its answer is
    /// applied, whichever of the two comes last.
    fn after_publish(&mut self, now: Instant) -> Vec<Action> {
        let negotiated = self
            .handles
            .get(&Role::Publisher)
            .map(PluginHandle::is_negotiated)
            .unwrap_or(false);

        if self.state != State::Publishing || !negotiated || !self.publish_confirmed {
            return vec![];
        }

        let mut actions = vec![self.say("Published")];
        actions.extend(self.forward_step(now));
        actions
    }

    fn forward_step(&mut self, now: Instant) -> Vec<Action> {
        let Some(forward) = self.plan.forward.clone() else {
            return self.subscribe_step(now);
        };

        let Some(publisher_id) = self.membership.map(|m| m.participant_id) else {
            let e = RelayError::Precondition("forwarding without a participant id".into());
            warn!("{}", e);
            let mut actions = vec![self.say(format!("Skipped forwarding: {e}"))];
            actions.extend(self.subscribe_step(now));
            return actions;
        };

        let key = ForwardKey {
            publisher_id,
            host: forward.host.clone(),
            port: forward.port,
        };
        if self.forwards.contains(&key) {
            info!(
                "Publisher {} already forwarded to {}:{}",
                publisher_id, forward.host, forward.port
            );
            return self.subscribe_step(now);
        }

        self.forwards.set_pending(ForwardingRule {
            publisher_id,
            host: forward.host.clone(),
            port: forward.port,
            codec: forward.codec,
            payload_type: forward.payload_type,
            stream_id: None,
        });
        self.transition(State::AwaitingForward);
        self.arm(now, "rtp_forward");

        vec![
            self.say(format!(
                "Forwarding {} to {}:{}",
                forward.codec, forward.host, forward.port
            )),
            Action::Send {
                role: Role::Publisher,
                body: PluginBody::RtpForward {
                    room: self.plan.room,
                    publisher_id,
                    host: forward.host,
                    video_port: forward.port,
                    video_pt: forward.payload_type,
                    secret: self.plan.secret.clone(),
                },
                jsep: None,
            },
        ]
    }

    fn forwarded(&mut self, now: Instant, publisher_id: u64, stream_id: Option<u64>) -> Vec<Action> {
        if self.state != State::AwaitingForward {
            debug!("Forward confirmation for {} outside of forwarding", publisher_id);
            return vec![];
        }

        let Some(confirmation) = self.forwards.confirm(publisher_id, stream_id) else {
            warn!("Forward confirmation for unexpected publisher {}", publisher_id);
            return vec![];
        };
        let rule = &confirmation.rule;
        info!(
            "RTP forwarder {:?} active for publisher {} -> {}:{}",
            rule.stream_id, rule.publisher_id, rule.host, rule.port
        );

        let mut actions = vec![];
        if let Some(stream_id) = confirmation.replaced.and_then(|old| old.stream_id) {
            warn!("Stopping displaced forwarder {} of {}", stream_id, publisher_id);
            actions.push(Action::Send {
                role: Role::Publisher,
                body: PluginBody::StopRtpForward {
                    room: self.plan.room,
                    publisher_id,
                    stream_id,
                    secret: self.plan.secret.clone(),
                },
                jsep: None,
            });
        }
        actions.extend(self.subscribe_step(now));
        actions
    }

    fn subscribe_step(&mut self, now: Instant) -> Vec<Action> {
        let role = self.receiving_role();

        if self.handles.get(&role).is_some_and(PluginHandle::is_negotiated) {
            self.transition(State::Streaming);
            self.deadline = None;
            return vec![self.say("Streaming")];
        }

        self.transition(State::Subscribing);
        self.arm(now, "receiver attach");
        vec![self.say("Subscribing to processed stream"), Action::Attach(role)]
    }

    fn started(&mut self, role: Role) -> Vec<Action> {
        let Some(handle) = self.handles.get_mut(&role) else {
            return vec![];
        };
        if handle.negotiation != Negotiation::AnswerSent {
            return vec![];
        }
        handle.negotiation = Negotiation::Complete;

        if self.state != State::Subscribing {
            return vec![];
        }
        self.transition(State::Streaming);
        self.deadline = None;
        vec![self.say("Streaming")]
    }

    fn track_added(&mut self, role: Role, mid: Mid) -> Vec<Action> {
        if !self.handles.contains_key(&role) {
            debug!("Track {:?} for detached {}", mid, role);
            return vec![];
        }

        match self.tracks.iter_mut().find(|t| t.role == role && t.mid == mid) {
            Some(track) if !track.removed => return vec![],
            Some(track) => track.removed = false,
            None => self.tracks.push(RenderedTrack {
                role,
                mid,
                removed: false,
            }),
        }

        vec![Action::Render {
            surface: role.surface(),
            role,
            mid,
        }]
    }

    fn gateway_cleanup(&mut self, msg: GatewayMessage) -> Vec<Action> {
        let Some(role) = msg.sender.and_then(|h| self.role_of(h)) else {
            return vec![];
        };

        let detached = msg.notification == Notification::Detached;
        let reason = match msg.notification {
            Notification::Hangup { reason } => reason,
            _ => "detached".to_string(),
        };

        let actions = self.cleanup(role, &reason);
        if detached {
            self.handles.remove(&role);
        }
        actions
    }

    fn cleanup(&mut self, role: Role, reason: &str) -> Vec<Action> {
        let mut removed = false;
        for track in self.tracks.iter_mut().filter(|t| t.role == role) {
            removed |= !track.removed;
            track.removed = true;
        }
        if let Some(handle) = self.handles.get_mut(&role) {
            handle.negotiation = Negotiation::None;
        }

        info!("Cleanup for {}: {} (tracks removed: {})", role, reason, removed);
        let mut actions = vec![
            self.say(format!("{role} closed: {reason}")),
            Action::ClearSurface(role.surface()),
        ];

        if role == Role::Publisher {
            self.publish_confirmed = false;
            if let Some(membership) = self.membership.take() {
                let dropped = self.forwards.remove_publisher(membership.participant_id);
                debug!("Dropped {} forwarding rules of {}", dropped.len(), membership.participant_id);
            }
            // Nothing downstream works without the published feed.
            if matches!(
                self.state,
                State::Joining
                    | State::Publishing
                    | State::AwaitingForward
                    | State::Subscribing
                    | State::Streaming
            ) {
                actions.extend(self.fail(RelayError::Session(format!(
                    "publisher closed: {reason}"
                ))));
            }
        }

        actions
    }

    fn tick(&mut self, now: Instant) -> Vec<Action> {
        match self.deadline {
            Some((at, step)) if now >= at => self.fail(RelayError::Timeout(step.to_string())),
            _ => vec![],
        }
    }

    fn rerun(&mut self, now: Instant) -> Vec<Action> {
        if self.state != State::Streaming {
            warn!("Rerun ignored in state {:?}", self.state);
            return vec![];
        }
        if !self.publish_confirmed {
            warn!("Rerun ignored, publisher is not published");
            return vec![];
        }

        // The publisher is still published; start again from forwarding.
        self.transition(State::Publishing);
        self.after_publish(now)
    }

    fn dispose(&mut self) -> Vec<Action> {
        let mut actions = vec![];

        if self.forwards.is_pending() {
            warn!("Disposing with an unconfirmed forwarding request");
        }
        if let Some(membership) = self.membership {
            for rule in self.forwards.clear() {
                let Some(stream_id) = rule.stream_id else {
                    continue;
                };
                actions.push(Action::Send {
                    role: Role::Publisher,
                    body: PluginBody::StopRtpForward {
                        room: membership.room,
                        publisher_id: rule.publisher_id,
                        stream_id,
                        secret: self.plan.secret.clone(),
                    },
                    jsep: None,
                });
            }
        }

        for track in self.tracks.iter_mut() {
            track.removed = true;
        }
        actions.push(Action::CloseSurface(SurfaceId::Local));
        actions.push(Action::CloseSurface(SurfaceId::Remote));

        for role in [Role::Subscriber, Role::Watcher, Role::Publisher] {
            if self.handles.contains_key(&role) {
                actions.push(Action::Detach(role));
            }
        }
        if self.session.is_some() {
            actions.push(Action::DestroySession);
        }

        self.handles.clear();
        self.session = None;
        self.membership = None;
        self.publish_confirmed = false;
        self.deadline = None;
        self.transition(State::Idle);
        actions.push(self.say("Disposed"));
        actions
    }

    fn fail(&mut self, e: RelayError) -> Vec<Action> {
        error!("Flow halted in {:?}: {}", self.state, e);
        self.transition(State::Failed);
        self.deadline = None;
        vec![self.say(format!("Error: {e}"))]
    }

    fn transition(&mut self, next: State) {
        if self.state != next {
            debug!("{:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    fn arm(&mut self, now: Instant, step: &'static str) {
        self.deadline = self.plan.step_timeout.map(|t| (now + t, step));
    }

    fn say(&mut self, text: impl Into<String>) -> Action {
        let line = StatusLine::new(text);
        info!("Status: {}", line.text);
        let action = Action::Status(line.text.clone());
        self.status.push(line);
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::codec::VideoCodec;

    const PUB: HandleId = HandleId(100);
    const WATCH: HandleId = HandleId(200);

    fn plan() -> Plan {
        Plan {
            room: 1234,
            display: "tester".into(),
            pin: None,
            secret: Some("adminpwd".into()),
            forward: Some(ForwardConfig {
                host: "10.0.0.5".into(),
                port: 6000,
                codec: VideoCodec::Vp9,
                payload_type: 96,
            }),
            subscribe: SubscribeTarget::Streaming {
                mountpoint: 1,
                pin: None,
            },
            step_timeout: Some(Duration::from_secs(30)),
        }
    }

    fn event(sender: HandleId, notification: Notification, jsep: Option<Jsep>) -> Trigger {
        Trigger::Gateway(GatewayMessage {
            sender: Some(sender),
            transaction: None,
            notification,
            jsep,
        })
    }

    fn sends(actions: &[Action]) -> Vec<&PluginBody> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    fn has_forward(actions: &[Action]) -> bool {
        sends(actions)
            .iter()
            .any(|b| matches!(b, PluginBody::RtpForward { .. }))
    }

    struct Harness {
        orch: Orchestrator,
        now: Instant,
        log: Vec<Action>,
    }

    impl Harness {
        fn new(plan: Plan) -> Self {
            Self {
                orch: Orchestrator::new(plan),
                now: Instant::now(),
                log: vec![],
            }
        }

        fn feed(&mut self, trigger: Trigger) -> Vec<Action> {
            let actions = self.orch.handle_trigger(self.now, trigger);
            self.log.extend(actions.clone());
            actions
        }

        /// Drive the flow up to the point where the publish answer is applied.
        fn publish(&mut self, participant: u64) -> Vec<Action> {
            self.feed(Trigger::Start);
            self.feed(Trigger::MediaAcquired);
            self.feed(Trigger::SessionCreated(Ok(SessionId(1))));
            self.feed(Trigger::Attached(Role::Publisher, Ok(PUB)));
            self.feed(event(PUB, Notification::Joined { room: 1234, id: participant }, None));
            self.feed(Trigger::OfferCreated(Role::Publisher, Ok(Jsep::offer("local"))));
            let actions = self.feed(event(PUB, Notification::Configured, Some(Jsep::answer("remote"))));
            assert_eq!(actions, vec![Action::ApplyAnswer(Role::Publisher, Jsep::answer("remote"))]);
            self.feed(Trigger::AnswerApplied(Role::Publisher, Ok(())))
        }

        fn watch(&mut self) {
            self.feed(Trigger::Attached(Role::Watcher, Ok(WATCH)));
            self.feed(event(WATCH, Notification::Preparing, Some(Jsep::offer("gw-offer"))));
            self.feed(Trigger::AnswerCreated(Role::Watcher, Ok(Jsep::answer("local-answer"))));
            self.feed(event(WATCH, Notification::Started, None));
        }
    }

    #[test]
    fn full_sequence_reaches_streaming() {
        let mut h = Harness::new(plan());

        assert_eq!(h.feed(Trigger::Start).last(), Some(&Action::AcquireMedia));
        assert_eq!(h.feed(Trigger::MediaAcquired).last(), Some(&Action::CreateSession));
        assert_eq!(
            h.feed(Trigger::SessionCreated(Ok(SessionId(1)))),
            vec![Action::Attach(Role::Publisher)]
        );
        assert_eq!(h.orch.state(), State::Joining);
        assert_eq!(h.orch.session(), Some(SessionId(1)));

        let join = h.feed(Trigger::Attached(Role::Publisher, Ok(PUB)));
        assert_eq!(h.orch.handle(Role::Publisher).map(|p| p.id), Some(PUB));
        assert!(matches!(
            sends(&join)[..],
            [PluginBody::Join { room: 1234, ptype: ParticipantType::Publisher, .. }]
        ));

        let after_publish = h.publish_rest();
        assert!(has_forward(&after_publish));
        assert_eq!(h.orch.state(), State::AwaitingForward);

        let attach = h.feed(event(
            PUB,
            Notification::Forwarded { publisher_id: 42, stream_id: Some(7) },
            None,
        ));
        assert_eq!(attach.last(), Some(&Action::Attach(Role::Watcher)));
        assert_eq!(h.orch.state(), State::Subscribing);

        h.watch();
        assert_eq!(h.orch.state(), State::Streaming);
        assert_eq!(h.orch.deadline(), None);
        assert_eq!(h.orch.status().current(), Some("Streaming"));
    }

    impl Harness {
        fn publish_rest(&mut self) -> Vec<Action> {
            self.feed(event(PUB, Notification::Joined { room: 1234, id: 42 }, None));
            let offer = self.feed(Trigger::OfferCreated(Role::Publisher, Ok(Jsep::offer("local"))));
            assert!(matches!(sends(&offer)[..], [PluginBody::Publish { audio: false, video: true }]));
            self.feed(event(PUB, Notification::Configured, Some(Jsep::answer("remote"))));
            self.feed(Trigger::AnswerApplied(Role::Publisher, Ok(())))
        }
    }

    #[test]
    fn forward_references_joined_participant_id() {
        let mut h = Harness::new(plan());
        let actions = h.publish(42);

        let forward = sends(&actions)
            .into_iter()
            .find(|b| matches!(b, PluginBody::RtpForward { .. }))
            .cloned()
            .unwrap();
        assert_eq!(
            forward,
            PluginBody::RtpForward {
                room: 1234,
                publisher_id: 42,
                host: "10.0.0.5".into(),
                video_port: 6000,
                video_pt: 96,
                secret: Some("adminpwd".into()),
            }
        );
    }

    #[test]
    fn no_forward_before_join_confirmation() {
        let mut h = Harness::new(plan());
        h.feed(Trigger::Start);
        h.feed(Trigger::MediaAcquired);
        h.feed(Trigger::SessionCreated(Ok(SessionId(1))));
        h.feed(Trigger::Attached(Role::Publisher, Ok(PUB)));

        // Confirmation and answer arriving before any join must not advance.
        h.feed(event(PUB, Notification::Configured, Some(Jsep::answer("remote"))));
        h.feed(Trigger::AnswerApplied(Role::Publisher, Ok(())));
        h.feed(event(PUB, Notification::Forwarded { publisher_id: 42, stream_id: None }, None));

        assert!(!has_forward(&h.log));
        assert!(!h.log.contains(&Action::Attach(Role::Watcher)));
        assert_eq!(h.orch.state(), State::Joining);
    }

    #[test]
    fn missing_configured_never_attaches_watcher() {
        let mut h = Harness::new(plan());
        h.feed(Trigger::Start);
        h.feed(Trigger::MediaAcquired);
        h.feed(Trigger::SessionCreated(Ok(SessionId(1))));
        h.feed(Trigger::Attached(Role::Publisher, Ok(PUB)));
        h.feed(event(PUB, Notification::Joined { room: 1234, id: 42 }, None));
        h.feed(Trigger::OfferCreated(Role::Publisher, Ok(Jsep::offer("local"))));
        // Answer without the "configured: ok" confirmation.
        h.feed(event(PUB, Notification::PluginEvent(serde_json::json!({})), Some(Jsep::answer("a"))));
        h.feed(Trigger::AnswerApplied(Role::Publisher, Ok(())));

        assert!(!has_forward(&h.log));
        assert!(!h.log.iter().any(|a| matches!(a, Action::Attach(r) if r.is_receiving())));
        assert_eq!(h.orch.state(), State::Publishing);
    }

    #[test]
    fn answer_only_after_remote_offer() {
        let mut h = Harness::new(plan());
        h.publish(42);
        h.feed(event(PUB, Notification::Forwarded { publisher_id: 42, stream_id: Some(7) }, None));
        h.feed(Trigger::Attached(Role::Watcher, Ok(WATCH)));

        // An answer produced without a remote offer is dropped.
        let early = h.feed(Trigger::AnswerCreated(Role::Watcher, Ok(Jsep::answer("x"))));
        assert!(sends(&early).is_empty());

        let offer = h.feed(event(WATCH, Notification::Preparing, Some(Jsep::offer("gw"))));
        assert_eq!(offer, vec![Action::CreateAnswer(Role::Watcher, Jsep::offer("gw"))]);

        let start = h.feed(Trigger::AnswerCreated(Role::Watcher, Ok(Jsep::answer("x"))));
        assert_eq!(
            start[0],
            Action::Send {
                role: Role::Watcher,
                body: PluginBody::Start,
                jsep: Some(Jsep::answer("x")),
            }
        );
    }

    #[test]
    fn forward_confirmation_for_other_publisher_is_ignored() {
        let mut h = Harness::new(plan());
        h.publish(42);

        let actions = h.feed(event(PUB, Notification::Forwarded { publisher_id: 9, stream_id: None }, None));
        assert!(actions.is_empty());
        assert_eq!(h.orch.state(), State::AwaitingForward);
    }

    #[test]
    fn without_forwarding_publish_goes_straight_to_subscribe() {
        let mut h = Harness::new(Plan {
            forward: None,
            subscribe: SubscribeTarget::Room { feed: None },
            ..plan()
        });
        let actions = h.publish(42);

        assert!(!has_forward(&actions));
        assert_eq!(actions.last(), Some(&Action::Attach(Role::Subscriber)));

        // Without an explicit feed the subscriber follows our own publisher.
        let join = h.feed(Trigger::Attached(Role::Subscriber, Ok(HandleId(300))));
        assert!(matches!(
            sends(&join)[..],
            [PluginBody::Join { ptype: ParticipantType::Subscriber, feed: Some(42), .. }]
        ));
    }

    #[test]
    fn cleanup_clears_surface_and_stops_rendering() {
        let mut h = Harness::new(plan());
        h.publish(42);
        h.feed(event(PUB, Notification::Forwarded { publisher_id: 42, stream_id: Some(7) }, None));
        h.watch();

        let mid = Mid::from("0");
        let render = h.feed(Trigger::TrackAdded(Role::Watcher, mid));
        assert_eq!(
            render,
            vec![Action::Render { surface: SurfaceId::Remote, role: Role::Watcher, mid }]
        );
        assert!(h.orch.should_render(Role::Watcher, mid));

        let cleanup = h.feed(event(WATCH, Notification::Hangup { reason: "DTLS alert".into() }, None));
        assert!(cleanup.contains(&Action::ClearSurface(SurfaceId::Remote)));
        assert!(!h.orch.should_render(Role::Watcher, mid));
    }

    #[test]
    fn rerun_does_not_duplicate_forwarding() {
        let mut h = Harness::new(plan());
        h.publish(42);
        h.feed(event(PUB, Notification::Forwarded { publisher_id: 42, stream_id: Some(7) }, None));
        h.watch();
        assert_eq!(h.orch.state(), State::Streaming);

        h.log.clear();
        let actions = h.feed(Trigger::Rerun);

        assert!(!has_forward(&actions));
        assert!(!actions.iter().any(|a| matches!(a, Action::Attach(_))));
        assert_eq!(h.orch.forwards().len(), 1);
        assert_eq!(h.orch.state(), State::Streaming);
    }

    #[test]
    fn gateway_failures_halt_the_flow() {
        let mut h = Harness::new(plan());
        h.feed(Trigger::Start);
        h.feed(Trigger::MediaAcquired);
        h.feed(Trigger::SessionCreated(Ok(SessionId(1))));
        h.feed(Trigger::Attached(Role::Publisher, Ok(PUB)));

        let actions = h.feed(event(
            PUB,
            Notification::PluginError { code: 426, reason: "No such room".into() },
            None,
        ));
        assert!(matches!(&actions[..], [Action::Status(s)] if s.contains("No such room")));
        assert_eq!(h.orch.state(), State::Failed);

        // Nothing moves after a failure.
        assert!(h.feed(event(PUB, Notification::Joined { room: 1234, id: 42 }, None)).is_empty());
    }

    #[test]
    fn session_failure_is_fatal() {
        let mut h = Harness::new(plan());
        h.feed(Trigger::Start);
        h.feed(Trigger::MediaAcquired);
        let actions = h.feed(Trigger::SessionCreated(Err(RelayError::Session("refused".into()))));

        assert_eq!(actions.len(), 1);
        assert_eq!(h.orch.state(), State::Failed);
    }

    #[test]
    fn media_failure_stops_before_session() {
        let mut h = Harness::new(plan());
        h.feed(Trigger::Start);
        h.feed(Trigger::MediaFailed(RelayError::Media("camera denied".into())));

        assert!(!h.log.contains(&Action::CreateSession));
        assert_eq!(h.orch.state(), State::Failed);
    }

    #[test]
    fn deadline_expiry_fails_the_step() {
        let mut h = Harness::new(plan());
        h.feed(Trigger::Start);
        h.feed(Trigger::MediaAcquired);
        let deadline = h.orch.deadline().unwrap();

        h.now = deadline - Duration::from_millis(1);
        assert!(h.feed(Trigger::Tick).is_empty());

        h.now = deadline;
        h.feed(Trigger::Tick);
        assert_eq!(h.orch.state(), State::Failed);
    }

    #[test]
    fn dispose_tears_down_forwarders_handles_and_session() {
        let mut h = Harness::new(plan());
        h.publish(42);
        h.feed(event(PUB, Notification::Forwarded { publisher_id: 42, stream_id: Some(7) }, None));
        h.watch();

        let actions = h.feed(Trigger::Dispose);

        assert!(matches!(
            sends(&actions)[..],
            [PluginBody::StopRtpForward { publisher_id: 42, stream_id: 7, .. }]
        ));
        assert!(actions.contains(&Action::Detach(Role::Watcher)));
        assert!(actions.contains(&Action::Detach(Role::Publisher)));
        assert!(actions.contains(&Action::DestroySession));
        assert!(actions.contains(&Action::CloseSurface(SurfaceId::Local)));
        assert!(actions.contains(&Action::CloseSurface(SurfaceId::Remote)));
        // Recordings survive a clean shutdown.
        assert!(!actions.iter().any(|a| matches!(a, Action::ClearSurface(_))));
        assert_eq!(h.orch.state(), State::Idle);
        assert_eq!(h.orch.forwards().len(), 0);
    }

    #[test]
    fn trickled_candidates_are_routed_to_their_handle() {
        let mut h = Harness::new(plan());
        h.publish(42);

        let actions = h.feed(event(
            PUB,
            Notification::Trickle { candidate: Some("candidate:1 1 udp 1 10.0.0.1 5000 typ host".into()), completed: false },
            None,
        ));
        assert!(matches!(&actions[..], [Action::AddRemoteCandidate(Role::Publisher, _)]));
    }

    fn streaming(h: &mut Harness) {
        h.publish(42);
        h.feed(event(PUB, Notification::Forwarded { publisher_id: 42, stream_id: Some(7) }, None));
        h.watch();
        assert_eq!(h.orch.state(), State::Streaming);
    }

    #[test]
    fn publisher_hangup_fails_instead_of_stalling_a_rerun() {
        let mut h = Harness::new(plan());
        streaming(&mut h);

        let cleanup = h.feed(event(PUB, Notification::Hangup { reason: "ICE failed".into() }, None));
        assert!(cleanup.contains(&Action::ClearSurface(SurfaceId::Local)));
        assert_eq!(h.orch.state(), State::Failed);
        assert_eq!(h.orch.forwards().len(), 0);

        assert!(h.feed(Trigger::Rerun).is_empty());
        h.now += Duration::from_secs(3600);
        h.feed(Trigger::Tick);
        assert_eq!(h.orch.state(), State::Failed);

        // The gone publisher's forwarder is not stopped again on dispose.
        let dispose = h.feed(Trigger::Dispose);
        assert!(sends(&dispose).is_empty());
    }

    #[test]
    fn lost_publisher_connection_drops_its_forwarders() {
        let mut h = Harness::new(plan());
        streaming(&mut h);

        h.feed(Trigger::ConnectionLost(Role::Publisher));
        assert_eq!(h.orch.state(), State::Failed);
        assert_eq!(h.orch.forwards().len(), 0);
        assert!(h.orch.membership().is_none());
    }

    #[test]
    fn repeated_confirmation_stops_the_displaced_forwarder() {
        let mut h = Harness::new(plan());
        h.publish(42);
        h.feed(event(PUB, Notification::Forwarded { publisher_id: 42, stream_id: Some(7) }, None));

        // A second request for the same destination, confirmed with a new id.
        h.orch.forwards.set_pending(ForwardingRule {
            publisher_id: 42,
            host: "10.0.0.5".into(),
            port: 6000,
            codec: VideoCodec::Vp9,
            payload_type: 96,
            stream_id: None,
        });
        h.orch.state = State::AwaitingForward;
        let actions = h.feed(event(PUB, Notification::Forwarded { publisher_id: 42, stream_id: Some(8) }, None));

        assert!(matches!(
            sends(&actions)[..],
            [PluginBody::StopRtpForward { publisher_id: 42, stream_id: 7, .. }]
        ));
        assert_eq!(h.orch.forwards().len(), 1);
    }

    #[test]
    fn detached_handle_is_forgotten() {
        let mut h = Harness::new(plan());
        streaming(&mut h);
        let mid = Mid::from("0");
        h.feed(Trigger::TrackAdded(Role::Watcher, mid));

        let actions = h.feed(event(WATCH, Notification::Detached, None));
        assert!(actions.contains(&Action::ClearSurface(SurfaceId::Remote)));
        assert!(h.orch.handle(Role::Watcher).is_none());
        assert!(!h.orch.should_render(Role::Watcher, mid));

        // Tracks reported for the detached handle are not rendered.
        assert!(h.feed(Trigger::TrackAdded(Role::Watcher, mid)).is_empty());
        // Dispose no longer detaches it.
        assert!(!h.feed(Trigger::Dispose).contains(&Action::Detach(Role::Watcher)));
    }

    #[test]
    fn lost_receiving_connection_clears_remote_surface() {
        let mut h = Harness::new(plan());
        streaming(&mut h);
        let mid = Mid::from("0");
        h.feed(Trigger::TrackAdded(Role::Watcher, mid));

        let actions = h.feed(Trigger::ConnectionLost(Role::Watcher));
        assert!(actions.contains(&Action::ClearSurface(SurfaceId::Remote)));
        assert!(!h.orch.should_render(Role::Watcher, mid));
        // Losing the receiving side does not touch the publisher.
        assert_eq!(h.orch.state(), State::Streaming);
        assert_eq!(h.orch.forwards().len(), 1);
    }

    #[test]
    fn session_timeout_fails_the_flow() {
        let mut h = Harness::new(plan());
        h.publish(42);

        let actions = h.feed(Trigger::Gateway(GatewayMessage {
            sender: None,
            transaction: None,
            notification: Notification::SessionTimeout,
            jsep: None,
        }));
        assert!(matches!(&actions[..], [Action::Status(s)] if s.contains("timed out")));
        assert_eq!(h.orch.state(), State::Failed);
        assert_eq!(h.orch.deadline(), None);
    }

    #[test]
    fn videoroom_subscriber_reaches_streaming() {
        const SUB: HandleId = HandleId(300);
        let mut h = Harness::new(Plan {
            subscribe: SubscribeTarget::Room { feed: Some(77) },
            ..plan()
        });
        h.publish(42);

        let attach = h.feed(event(PUB, Notification::Forwarded { publisher_id: 42, stream_id: Some(7) }, None));
        assert_eq!(attach.last(), Some(&Action::Attach(Role::Subscriber)));

        let join = h.feed(Trigger::Attached(Role::Subscriber, Ok(SUB)));
        assert!(matches!(
            sends(&join)[..],
            [PluginBody::Join { room: 1234, ptype: ParticipantType::Subscriber, feed: Some(77), .. }]
        ));

        let offer = h.feed(event(SUB, Notification::Attached { feed: Some(77) }, Some(Jsep::offer("gw"))));
        assert_eq!(offer, vec![Action::CreateAnswer(Role::Subscriber, Jsep::offer("gw"))]);

        let start = h.feed(Trigger::AnswerCreated(Role::Subscriber, Ok(Jsep::answer("local"))));
        assert_eq!(
            start[0],
            Action::Send {
                role: Role::Subscriber,
                body: PluginBody::Start,
                jsep: Some(Jsep::answer("local")),
            }
        );
        assert_eq!(h.orch.state(), State::Subscribing);

        let started = h.feed(event(SUB, Notification::Started, None));
        assert_eq!(started, vec![Action::Status("Streaming".into())]);
        assert_eq!(h.orch.state(), State::Streaming);
        assert_eq!(h.orch.deadline(), None);

        let mid = Mid::from("1");
        assert_eq!(
            h.feed(Trigger::TrackAdded(Role::Subscriber, mid)),
            vec![Action::Render { surface: SurfaceId::Remote, role: Role::Subscriber, mid }]
        );
    }
}
