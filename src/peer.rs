//! Relay client driver
//!
//! Runs the orchestrator on a single tokio task. Every gateway event, UDP
//! datagram and timer wake-up is handled to completion before the next one,
//! so the orchestrator and the media connections need no locking. The only
//! other task is the long-poll, which hands events over a channel.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Input};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{RelayError, RelayResult};
use crate::janus::event::{GatewayMessage, Notification};
use crate::janus::message::{Request, TrickleCandidate};
use crate::janus::transport::{spawn_long_poll, HttpTransport};
use crate::media::source::LocalStream;
use crate::media::surface::{IvfSurface, LogSurface, Surface};
use crate::model::connection::{to_video_frame, Connection};
use crate::model::handle::{HandleId, Role, SessionId, SurfaceId};
use crate::model::propagated::Propagated;
use crate::orchestrator::{Action, Orchestrator, Plan, State, Trigger};
use crate::util::{host_candidate, init_log, select_host_address};

/// Longest time the loop sleeps without checking timers.
const MAX_WAIT: Duration = Duration::from_millis(100);

/// Entry point for `run`: load the configuration and drive the flow until
/// Ctrl-C or a failure.
pub fn main(config_path: Option<PathBuf>) -> Result<()> {
    init_log();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config_path))
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = Config::load(config_path.as_deref())?;
    info!(
        "Relay for room {} on {} as '{}'",
        config.room.id, config.gateway.url, config.room.display
    );

    let mut relay = Relay::new(config).await?;
    relay.run().await
}

pub struct Relay {
    config: Config,
    transport: HttpTransport,
    orchestrator: Orchestrator,
    socket: UdpSocket,
    local_addr: SocketAddr,
    candidate: Candidate,
    session: Option<SessionId>,
    handles: HashMap<Role, HandleId>,
    connections: HashMap<Role, Connection>,
    stream: Option<LocalStream>,
    local_surface: Box<dyn Surface + Send>,
    remote_surface: Box<dyn Surface + Send>,
    events_tx: UnboundedSender<RelayResult<GatewayMessage>>,
    events_rx: UnboundedReceiver<RelayResult<GatewayMessage>>,
    long_poll: Option<JoinHandle<()>>,
    buf: Vec<u8>,
}

impl Relay {
    pub async fn new(config: Config) -> Result<Self> {
        let host_addr = select_host_address();
        let socket = UdpSocket::bind(SocketAddr::new(host_addr, 0)).await?;
        let local_addr = socket.local_addr()?;
        let candidate = host_candidate(local_addr)?;
        info!("Bound UDP port: {}", local_addr);

        let width = u16::try_from(config.media.width).unwrap_or(u16::MAX);
        let height = u16::try_from(config.media.height).unwrap_or(u16::MAX);
        let local_surface = surface(&config.media.local_surface, "local", width, height);
        let remote_surface = surface(&config.media.remote_surface, "remote", width, height);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            transport: HttpTransport::new(config.gateway.url.clone()),
            orchestrator: Orchestrator::new(Plan::from(&config)),
            config,
            socket,
            local_addr,
            candidate,
            session: None,
            handles: HashMap::new(),
            connections: HashMap::new(),
            stream: None,
            local_surface,
            remote_surface,
            events_tx,
            events_rx,
            long_poll: None,
            buf: vec![0; 2000],
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        self.dispatch(Trigger::Start).await;

        let mut keepalive = tokio::time::interval(self.config.keepalive());
        // The first tick completes immediately.
        keepalive.tick().await;

        let mut rerun = RerunSignal::new()?;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            let now = Instant::now();
            let mut wake = now + MAX_WAIT;

            // Poll connections until they return timeout.
            let (timeout, propagated) = self.poll_connections();
            wake = wake.min(timeout);
            for p in propagated {
                self.propagate(p).await;
            }

            if let Some(due) = self.pump_local_media(Instant::now()) {
                wake = wake.min(due);
            }
            if let Some(deadline) = self.orchestrator.deadline() {
                wake = wake.min(deadline);
            }

            if self.orchestrator.state() == State::Failed {
                break;
            }

            // The sleep is not allowed to be 0, keep at least a millisecond.
            let wake = wake.max(Instant::now() + Duration::from_millis(1));

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Interrupted, shutting down");
                    break;
                }
                Some(event) = self.events_rx.recv() => {
                    match event {
                        Ok(msg) => self.dispatch(Trigger::Gateway(msg)).await,
                        Err(e) => self.dispatch(Trigger::SessionLost(e)).await,
                    }
                }
                received = self.socket.recv_from(&mut self.buf) => {
                    match received {
                        Ok((n, source)) => {
                            handle_datagram(&mut self.connections, self.local_addr, source, &self.buf[..n]);
                        }
                        Err(e) => warn!("UDP receive failed: {}", e),
                    }
                }
                _ = keepalive.tick() => self.keepalive().await,
                _ = rerun.recv() => {
                    info!("Rerun requested");
                    self.dispatch(Trigger::Rerun).await;
                }
                _ = tokio::time::sleep_until(wake.into()) => {}
            }

            // Drive time forward in all connections.
            let now = Instant::now();
            for connection in self.connections.values_mut() {
                connection.handle_input(Input::Timeout(now));
            }
            self.dispatch(Trigger::Tick).await;
        }

        let failed = self.orchestrator.state() == State::Failed;
        let last_status = self
            .orchestrator
            .status()
            .current()
            .unwrap_or_default()
            .to_string();

        self.shutdown().await;

        if failed {
            return Err(anyhow!(last_status));
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.dispatch(Trigger::Dispose).await;

        if let Some(long_poll) = self.long_poll.take() {
            long_poll.abort();
        }
        for connection in self.connections.values_mut() {
            connection.disconnect();
        }
        self.connections.clear();

        for line in self.orchestrator.status().lines() {
            debug!("[{}] {}", line.timestamp(), line.text);
        }
    }

    /// Feed a trigger to the orchestrator and carry out the resulting
    /// actions, including the triggers those actions produce in turn.
    async fn dispatch(&mut self, trigger: Trigger) {
        let mut pending = VecDeque::from([trigger]);
        while let Some(trigger) = pending.pop_front() {
            let actions = self.orchestrator.handle_trigger(Instant::now(), trigger);
            for action in actions {
                pending.extend(self.execute(action).await);
            }
        }
    }

    async fn execute(&mut self, action: Action) -> Vec<Trigger> {
        match action {
            Action::AcquireMedia => match LocalStream::acquire(&self.config.media) {
                Ok(stream) => {
                    self.stream = Some(stream);
                    vec![Trigger::MediaAcquired]
                }
                Err(e) => vec![Trigger::MediaFailed(e)],
            },
            Action::CreateSession => {
                let result = self.transport.create_session().await;
                if let Ok(session) = &result {
                    self.session = Some(*session);
                    self.long_poll = Some(spawn_long_poll(
                        self.transport.clone(),
                        *session,
                        self.config.gateway.maxev,
                        self.events_tx.clone(),
                    ));
                }
                vec![Trigger::SessionCreated(result)]
            }
            Action::Attach(role) => vec![Trigger::Attached(role, self.attach(role).await)],
            Action::CreateOffer(role) => {
                let result = match self.connections.get_mut(&role) {
                    Some(c) => c.create_offer(),
                    None => Err(RelayError::negotiation(role, "no connection")),
                };
                vec![Trigger::OfferCreated(role, result)]
            }
            Action::ApplyAnswer(role, jsep) => {
                let Some(connection) = self.connections.get_mut(&role) else {
                    let e = RelayError::negotiation(role, "no connection");
                    return vec![Trigger::AnswerApplied(role, Err(e))];
                };
                let result = connection.accept_answer(&jsep);
                let local = result.as_ref().ok().and_then(|_| connection.local_mid());

                let mut triggers = vec![Trigger::AnswerApplied(role, result)];
                if let Some(mid) = local {
                    triggers.push(Trigger::TrackAdded(role, mid));
                }
                triggers
            }
            Action::CreateAnswer(role, jsep) => {
                let result = match self.connections.get_mut(&role) {
                    Some(c) => c.accept_offer(&jsep),
                    None => Err(RelayError::negotiation(role, "no connection")),
                };
                vec![Trigger::AnswerCreated(role, result)]
            }
            Action::Send { role, body, jsep } => {
                let name = body.name();
                let Some(handle) = self.handles.get(&role).copied() else {
                    let e = RelayError::Precondition(format!("{name} without a {role} handle"));
                    return vec![Trigger::RequestFailed(role, e)];
                };

                info!("➡️  {} on {} handle {}", name, role, *handle);
                match self
                    .transport
                    .post(self.session, Some(handle), Request::Message { body, jsep })
                    .await
                {
                    Ok(reply) if reply.notification == Notification::Ack => vec![],
                    Ok(reply) => vec![Trigger::Gateway(reply)],
                    Err(e) => vec![Trigger::RequestFailed(role, e)],
                }
            }
            Action::AddRemoteCandidate(role, candidate) => {
                if let Some(connection) = self.connections.get_mut(&role) {
                    connection.add_remote_candidate(&candidate);
                }
                vec![]
            }
            Action::TrickleComplete(role) => {
                let request = Request::Trickle {
                    candidate: TrickleCandidate { completed: true },
                };
                if let Some(handle) = self.handles.get(&role).copied() {
                    if let Err(e) = self.transport.post(self.session, Some(handle), request).await {
                        warn!("Trickle completion for {} failed: {}", role, e);
                    }
                }
                vec![]
            }
            Action::Render { surface, role, mid } => {
                info!("🖼  Rendering {} track {:?} on {:?} surface", role, mid, surface);
                vec![]
            }
            Action::ClearSurface(id) => {
                if let Err(e) = self.surface_mut(id).clear() {
                    warn!("Clearing {:?} surface failed: {}", id, e);
                }
                vec![]
            }
            Action::CloseSurface(id) => {
                if let Err(e) = self.surface_mut(id).close() {
                    warn!("Closing {:?} surface failed: {}", id, e);
                }
                vec![]
            }
            Action::Detach(role) => {
                if let Some(mut connection) = self.connections.remove(&role) {
                    connection.disconnect();
                }
                if let Some(handle) = self.handles.remove(&role) {
                    if let Err(e) = self.transport.post(self.session, Some(handle), Request::Detach).await {
                        warn!("Detaching {} failed: {}", role, e);
                    }
                }
                vec![]
            }
            Action::DestroySession => {
                if let Some(session) = self.session.take() {
                    if let Err(e) = self.transport.post(Some(session), None, Request::Destroy).await {
                        warn!("Destroying session {} failed: {}", *session, e);
                    }
                }
                vec![]
            }
            // Already logged by the orchestrator.
            Action::Status(_) => vec![],
        }
    }

    async fn attach(&mut self, role: Role) -> RelayResult<HandleId> {
        let session = self
            .session
            .ok_or_else(|| RelayError::Session("no session".into()))?;
        let handle = self.transport.attach(session, role.plugin()).await?;

        let candidates = [self.candidate.clone()];
        let connection = match role {
            Role::Publisher => Connection::publisher(self.config.media.codec, &candidates),
            Role::Subscriber | Role::Watcher => Connection::receiver(role, &candidates),
        };
        self.connections.insert(role, connection);
        self.handles.insert(role, handle);
        Ok(handle)
    }

    async fn keepalive(&mut self) {
        let Some(session) = self.session else {
            return;
        };
        if let Err(e) = self.transport.post(Some(session), None, Request::Keepalive).await {
            self.dispatch(Trigger::SessionLost(e)).await;
        }
    }

    fn poll_connections(&mut self) -> (Instant, Vec<Propagated>) {
        let mut timeout = Instant::now() + MAX_WAIT;
        let mut queue = vec![];
        for connection in self.connections.values_mut() {
            let t = poll_until_timeout(connection, &mut queue, &self.socket);
            timeout = timeout.min(t);
        }
        (timeout, queue)
    }

    async fn propagate(&mut self, propagated: Propagated) {
        match propagated {
            Propagated::TrackOpen(role, mid, kind) => {
                debug!("{} track {:?} opened ({:?})", role, mid, kind);
                self.dispatch(Trigger::TrackAdded(role, mid)).await;
            }
            Propagated::MediaData(role, data) => {
                if !self.orchestrator.should_render(role, data.mid) {
                    return;
                }
                let Some(frame) = to_video_frame(&data) else {
                    return;
                };
                if let Err(e) = self.surface_mut(role.surface()).render(&frame) {
                    warn!("Rendering {} frame failed: {}", role, e);
                }
            }
            Propagated::KeyframeRequest(role) => {
                if let Some(stream) = self.stream.as_mut() {
                    debug!("Keyframe requested by gateway on {}, restarting source", role);
                    if let Err(e) = stream.restart() {
                        warn!("Restarting local media failed: {}", e);
                    }
                }
            }
            Propagated::Disconnected(role) => {
                self.connections.remove(&role);
                self.dispatch(Trigger::ConnectionLost(role)).await;
            }
            Propagated::Connected(role) => {
                let handle = self.orchestrator.handle(role).map(|h| *h.id);
                match self.orchestrator.membership() {
                    Some(m) => info!(
                        "{} media flowing on handle {:?} for participant {}",
                        role, handle, m.participant_id
                    ),
                    None => info!("{} media flowing on handle {:?}", role, handle),
                }
            }
            Propagated::Noop | Propagated::Timeout(_) => {}
        }
    }

    /// Send the next local frame if it is due. Returns when the following
    /// frame is due, or `None` while nothing can be published.
    fn pump_local_media(&mut self, now: Instant) -> Option<Instant> {
        let connection = self.connections.get_mut(&Role::Publisher)?;
        if !connection.is_connected() {
            return None;
        }
        let stream = self.stream.as_mut()?;

        let frame = match stream.poll_frame(now) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Some(stream.next_due()),
            Err(e) => {
                error!("Local media failed: {}", e);
                self.stream = None;
                return None;
            }
        };

        if let Err(e) = connection.write_frame(&frame) {
            error!("Cannot publish local media: {}", e);
            self.stream = None;
            return None;
        }

        let rendered = connection
            .local_mid()
            .is_some_and(|mid| self.orchestrator.should_render(Role::Publisher, mid));
        if rendered {
            if let Err(e) = self.local_surface.render(&frame) {
                warn!("Rendering local frame failed: {}", e);
            }
        }

        Some(stream.next_due())
    }

    fn surface_mut(&mut self, id: SurfaceId) -> &mut (dyn Surface + Send + 'static) {
        match id {
            SurfaceId::Local => self.local_surface.as_mut(),
            SurfaceId::Remote => self.remote_surface.as_mut(),
        }
    }
}

fn surface(
    path: &Option<PathBuf>,
    name: &'static str,
    width: u16,
    height: u16,
) -> Box<dyn Surface + Send> {
    match path {
        Some(path) => Box::new(IvfSurface::new(path, width, height)),
        None => Box::new(LogSurface::new(name)),
    }
}

/// Poll the connection until it returns a timeout. Collect any output in the
/// queue and return the timeout.
fn poll_until_timeout(
    connection: &mut Connection,
    queue: &mut Vec<Propagated>,
    socket: &UdpSocket,
) -> Instant {
    loop {
        match connection.poll_output(socket) {
            Propagated::Timeout(t) => return t,
            Propagated::Noop => continue,
            p @ Propagated::Disconnected(_) => {
                // The connection is removed once this is propagated.
                queue.push(p);
                return Instant::now();
            }
            p => queue.push(p),
        }
    }
}

/// Hand a datagram to the connection it belongs to.
fn handle_datagram(
    connections: &mut HashMap<Role, Connection>,
    destination: SocketAddr,
    source: SocketAddr,
    data: &[u8],
) {
    // Parse data to a DatagramRecv, which help preparse network data to
    // figure out the multiplexing of all protocols on one UDP port.
    let Ok(contents) = data.try_into() else {
        return;
    };

    let input = Input::Receive(
        Instant::now(),
        Receive {
            proto: Protocol::Udp,
            source,
            destination,
            contents,
        },
    );

    // The rtc.accepts() call is how we demultiplex the incoming packet to know
    // which connection the traffic belongs to.
    if let Some(connection) = connections.values_mut().find(|c| c.accepts(&input)) {
        connection.handle_input(input);
    } else {
        debug!("No connection accepts UDP input from {}", source);
    }
}

/// SIGHUP asks for the publish → forward → watch sequence to run again.
#[cfg(unix)]
struct RerunSignal(tokio::signal::unix::Signal);

#[cfg(unix)]
impl RerunSignal {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self(signal(SignalKind::hangup())?))
    }

    async fn recv(&mut self) {
        self.0.recv().await;
    }
}

#[cfg(not(unix))]
struct RerunSignal;

#[cfg(not(unix))]
impl RerunSignal {
    fn new() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_reports_a_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");

        let err = main(Some(missing)).unwrap_err();
        assert!(err.to_string().contains("missing.json"), "{err}");
    }
}
