//! Remote optimisation session over an abstract message channel.
//!
//! The transport pushes `ChannelEvent`s into a queue; the owner drains it with
//! [`Session::poll`] or [`Session::wait`].  Every event is applied once, in
//! delivery order, by a pure `(snapshot, event) → snapshot` step under a
//! single lock.  `Closed` is terminal.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::{classify, encode, Inbound, OptimizationSettings, Progress, CLOSE, HANDSHAKE};
use crate::topology::Network;
use crate::types::{FdmError, FdmResult, Point3};

// ─────────────────────────────────────────────────────────────
//  State machine
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// A problem is out; progress messages are arriving.
    Streaming,
    /// The last problem reported `Finished`.
    Idle,
    Closed,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connect,
    Opened,
    ProblemSent,
    Progress { finished: bool },
    Close,
}

/// Next state for `event`; events that do not apply leave the state as is.
pub fn transition(state: SessionState, event: Transition) -> SessionState {
    use SessionState::*;
    match (state, event) {
        (Closed, _) => Closed,
        (_, Transition::Close) => Closed,
        (Disconnected, Transition::Connect) => Connecting,
        (Connecting, Transition::Opened) => Connected,
        (Connected | Idle | Streaming, Transition::ProblemSent) => Streaming,
        (Idle | Streaming, Transition::Progress { finished: true }) => Idle,
        (Idle | Streaming, Transition::Progress { finished: false }) => Streaming,
        (state, _) => state,
    }
}

/// Everything the owner can observe about a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    /// Latest accepted progress message.
    pub progress: Option<Progress>,
    /// Network rebuilt from the latest progress, or the network last sent.
    pub network: Option<Network>,
    /// Network the current problem was encoded from; progress is applied to it.
    pub baseline: Option<Network>,
    pub received: usize,
    pub dropped: usize,
}

impl SessionSnapshot {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            progress: None,
            network: None,
            baseline: None,
            received: 0,
            dropped: 0,
        }
    }

    fn with_state(&self, state: SessionState) -> Self {
        Self { state, ..self.clone() }
    }

    fn dropping(&self) -> Self {
        Self { dropped: self.dropped + 1, ..self.clone() }
    }
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply one inbound payload.  Undecodable payloads are dropped without a
/// state change; the remote's end sentinel closes the session.
pub fn apply_inbound(snapshot: &SessionSnapshot, payload: &str) -> SessionSnapshot {
    if snapshot.state == SessionState::Closed {
        return snapshot.dropping();
    }
    let inbound = match classify(payload) {
        Ok(inbound) => inbound,
        Err(e) => {
            debug!(error = %e, "dropping undecodable payload");
            return snapshot.dropping();
        }
    };
    match inbound {
        Inbound::Ended => {
            info!("remote ended the connection");
            snapshot.with_state(transition(snapshot.state, Transition::Close))
        }
        Inbound::Control => snapshot.clone(),
        Inbound::Progress(progress) => {
            if !matches!(snapshot.state, SessionState::Streaming | SessionState::Idle) {
                debug!(state = ?snapshot.state, "dropping progress with no problem outstanding");
                return snapshot.dropping();
            }
            let network = match &snapshot.baseline {
                Some(baseline) => match progress.apply_to(baseline) {
                    Ok(net) => Some(net),
                    Err(e) => {
                        warn!(error = %e, "progress does not fit the sent network");
                        return snapshot.dropping();
                    }
                },
                None => None,
            };
            let state = transition(snapshot.state, Transition::Progress { finished: progress.finished });
            debug!(iter = progress.iteration, loss = progress.loss, finished = progress.finished, "progress");
            SessionSnapshot {
                state,
                progress: Some(progress),
                network,
                baseline: snapshot.baseline.clone(),
                received: snapshot.received + 1,
                dropped: snapshot.dropped,
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Address
// ─────────────────────────────────────────────────────────────

pub const DEFAULT_SCHEME: &str = "ws";

/// `scheme://host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> FdmResult<Self> {
        let scheme = scheme.into();
        let host = host.into();
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(FdmError::InvalidAddress(format!("bad scheme {scheme:?}")));
        }
        if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/' || c == ':') {
            return Err(FdmError::InvalidAddress(format!("bad host {host:?}")));
        }
        if port == 0 {
            return Err(FdmError::InvalidAddress("port 0".into()));
        }
        Ok(Self { scheme, host, port })
    }

    pub fn parse(s: &str) -> FdmResult<Self> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| FdmError::InvalidAddress(format!("{s:?} lacks a scheme")))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| FdmError::InvalidAddress(format!("{s:?} lacks a port")))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| FdmError::InvalidAddress(format!("{s:?}: {e}")))?;
        Self::new(scheme, host, port)
    }

    pub fn connection_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

// ─────────────────────────────────────────────────────────────
//  Channel abstraction
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened,
    Message(String),
    /// Transport-level disconnect.
    Closed,
}

/// Bidirectional text channel supplied by the caller.
///
/// `open` hands the transport the sender it must push inbound events into;
/// events may arrive from any thread.
pub trait MessageChannel {
    fn open(&mut self, address: &str, events: Sender<ChannelEvent>) -> FdmResult<()>;
    fn send(&mut self, payload: &str) -> FdmResult<()>;
    fn close(&mut self);
}

// ─────────────────────────────────────────────────────────────
//  Session
// ─────────────────────────────────────────────────────────────

pub struct Session<C: MessageChannel> {
    address: Address,
    channel: Mutex<C>,
    inbox: Receiver<ChannelEvent>,
    snapshot: Mutex<SessionSnapshot>,
}

impl<C: MessageChannel> Session<C> {
    /// Open `channel` towards `address`.  The session is `Connecting` until
    /// the transport reports `Opened`.
    pub fn connect(address: Address, mut channel: C) -> FdmResult<Self> {
        let (tx, rx) = unbounded();
        let target = address.connection_string();
        channel.open(&target, tx)?;
        info!(address = %target, "connecting");
        let snapshot = SessionSnapshot::new();
        let state = transition(snapshot.state, Transition::Connect);
        Ok(Self {
            address,
            channel: Mutex::new(channel),
            inbox: rx,
            snapshot: Mutex::new(snapshot.with_state(state)),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.lock().state
    }

    /// Current snapshot without draining the queue.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.lock().clone()
    }

    fn handle(&self, event: ChannelEvent) {
        let mut snapshot = self.snapshot.lock();
        match event {
            ChannelEvent::Opened => {
                let next = transition(snapshot.state, Transition::Opened);
                if next == SessionState::Connected && snapshot.state != next {
                    info!(address = %self.address, "connected");
                    if let Err(e) = self.channel.lock().send(HANDSHAKE) {
                        warn!(error = %e, "handshake failed");
                    }
                }
                *snapshot = snapshot.with_state(next);
            }
            ChannelEvent::Message(payload) => {
                *snapshot = apply_inbound(&snapshot, &payload);
            }
            ChannelEvent::Closed => {
                if snapshot.state != SessionState::Closed {
                    info!(address = %self.address, "transport closed");
                }
                *snapshot = snapshot.with_state(transition(snapshot.state, Transition::Close));
            }
        }
    }

    /// Apply every queued event and return the resulting snapshot.
    pub fn poll(&self) -> SessionSnapshot {
        while let Ok(event) = self.inbox.try_recv() {
            self.handle(event);
        }
        self.snapshot()
    }

    /// Block up to `timeout` for the next event, then drain the queue.
    pub fn wait(&self, timeout: Duration) -> SessionSnapshot {
        match self.inbox.recv_timeout(timeout) {
            Ok(event) => self.handle(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("event queue disconnected");
            }
        }
        self.poll()
    }

    /// Encode and send a problem.  Progress of any earlier problem is
    /// discarded.
    ///
    /// The snapshot moves to `Streaming` before the payload leaves, so a reply
    /// drained by another thread mid-send lands on the new baseline.
    pub fn send_problem(&self, network: &Network, settings: &OptimizationSettings, loads: &[Point3]) -> FdmResult<()> {
        self.poll();
        let mut snapshot = self.snapshot.lock();
        match snapshot.state {
            SessionState::Closed => return Err(FdmError::ChannelClosed),
            state @ (SessionState::Disconnected | SessionState::Connecting) => {
                return Err(FdmError::NotConnected(state))
            }
            _ => {}
        }
        let payload = encode(network, settings, loads)?.to_json()?;

        let previous = snapshot.clone();
        *snapshot = SessionSnapshot {
            state: transition(previous.state, Transition::ProblemSent),
            progress: None,
            network: Some(network.clone()),
            baseline: Some(network.clone()),
            received: previous.received,
            dropped: previous.dropped,
        };
        if let Err(e) = self.channel.lock().send(&payload) {
            warn!(error = %e, "problem not delivered");
            *snapshot = previous;
            return Err(e);
        }
        info!(edges = network.num_edges(), nodes = network.num_nodes(), "problem sent");
        Ok(())
    }

    /// Send `CLOSE` and shut the channel.  Idempotent.
    pub fn close(&self) {
        let mut snapshot = self.snapshot.lock();
        if snapshot.state == SessionState::Closed {
            return;
        }
        let mut channel = self.channel.lock();
        if matches!(snapshot.state, SessionState::Connected | SessionState::Streaming | SessionState::Idle) {
            if let Err(e) = channel.send(CLOSE) {
                debug!(error = %e, "close message not delivered");
            }
        }
        channel.close();
        *snapshot = snapshot.with_state(transition(snapshot.state, Transition::Close));
        info!(address = %self.address, "session closed");
    }
}

impl<C: MessageChannel> Drop for Session<C> {
    fn drop(&mut self) {
        self.close();
    }
}

// ─────────────────────────────────────────────────────────────
//  Connector
// ─────────────────────────────────────────────────────────────

/// Owns the current session and reconnects only when the address changes or
/// a reset is requested.
pub struct Connector<C: MessageChannel> {
    session: Option<Session<C>>,
}

impl<C: MessageChannel> Connector<C> {
    pub fn new() -> Self {
        Self { session: None }
    }

    /// Returns `true` when a new session was opened.  The old session is
    /// closed before the new channel is created.
    pub fn update<F>(&mut self, address: &Address, reset: bool, factory: F) -> FdmResult<bool>
    where
        F: FnOnce() -> C,
    {
        if let Some(session) = &self.session {
            if session.address() == address && !reset {
                return Ok(false);
            }
        }
        if let Some(old) = self.session.take() {
            old.close();
        }
        self.session = Some(Session::connect(address.clone(), factory())?);
        Ok(true)
    }

    pub fn session(&self) -> Option<&Session<C>> {
        self.session.as_ref()
    }

    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}

impl<C: MessageChannel> Default for Connector<C> {
    fn default() -> Self {
        Self::new()
    }
}
