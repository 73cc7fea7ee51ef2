//! Session tests against an in-memory channel.
//!
//! The fake channel records everything sent through it and, when asked,
//! answers problems by running the in-process optimiser and queueing its
//! progress messages, so the full connect → stream → idle → close cycle runs
//! without a network peer.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;

use formfind::optimizer::optimize;
use formfind::protocol::{OptimizationRequest, OptimizationSettings, CLOSE, CONNECTION_ENDED, HANDSHAKE};
use formfind::session::{Address, ChannelEvent, Connector, MessageChannel, Session, SessionState};
use formfind::{FdmError, FdmResult, Network, Segment};

#[derive(Clone, Default)]
struct Wire {
    addresses: Arc<Mutex<Vec<String>>>,
    sent: Arc<Mutex<Vec<String>>>,
    events: Arc<Mutex<Option<Sender<ChannelEvent>>>>,
    closed: Arc<Mutex<bool>>,
}

impl Wire {
    fn push(&self, event: ChannelEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            tx.send(event).unwrap();
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

struct FakeChannel {
    wire: Wire,
    auto_open: bool,
    solve: bool,
}

impl FakeChannel {
    fn new(wire: &Wire) -> Self {
        Self { wire: wire.clone(), auto_open: true, solve: true }
    }
}

impl MessageChannel for FakeChannel {
    fn open(&mut self, address: &str, events: Sender<ChannelEvent>) -> FdmResult<()> {
        self.wire.addresses.lock().push(address.to_string());
        if self.auto_open {
            events.send(ChannelEvent::Opened).unwrap();
        }
        *self.wire.events.lock() = Some(events);
        Ok(())
    }

    fn send(&mut self, payload: &str) -> FdmResult<()> {
        self.wire.sent.lock().push(payload.to_string());
        if self.solve && payload.starts_with('{') {
            let request = OptimizationRequest::from_json(payload)?;
            let wire = self.wire.clone();
            let last = optimize(&request, |m| wire.push(ChannelEvent::Message(m.to_json().unwrap())))?;
            self.wire.push(ChannelEvent::Message(last.to_json()?));
        }
        Ok(())
    }

    fn close(&mut self) {
        *self.wire.closed.lock() = true;
    }
}

fn cable() -> Network {
    Network::uniform(
        vec![
            Segment::new([0.0, 0.0, 0.0], [1.0, 0.0, 0.0]),
            Segment::new([1.0, 0.0, 0.0], [2.0, 0.0, 0.0]),
            Segment::new([2.0, 0.0, 0.0], [3.0, 0.0, 0.0]),
        ],
        vec![[0.0, 0.0, 0.0], [3.0, 0.0, 0.0]],
        1.0,
        0.01,
    )
    .unwrap()
}

fn settings() -> OptimizationSettings {
    OptimizationSettings {
        max_iterations: 30,
        update_frequency: 3,
        ..Default::default()
    }
}

fn address(port: u16) -> Address {
    Address::new("ws", "127.0.0.1", port).unwrap()
}

#[test]
fn connect_stream_idle_close() {
    let wire = Wire::default();
    let session = Session::connect(address(2000), FakeChannel::new(&wire)).unwrap();
    assert_eq!(session.state(), SessionState::Connecting);
    assert_eq!(*wire.addresses.lock(), vec!["ws://127.0.0.1:2000".to_string()]);

    assert_eq!(session.poll().state, SessionState::Connected);
    assert_eq!(wire.sent(), vec![HANDSHAKE.to_string()]);

    let network = cable();
    session.send_problem(&network, &settings(), &[[0.0, 0.0, -1.0]]).unwrap();
    assert_eq!(session.state(), SessionState::Streaming);

    let snap = session.poll();
    assert_eq!(snap.state, SessionState::Idle);
    let progress = snap.progress.unwrap();
    assert!(progress.finished);
    assert!(snap.received >= 1);
    assert_eq!(snap.dropped, 0);

    let solved = snap.network.unwrap();
    assert_eq!(solved.indices(), network.indices());
    assert_eq!(solved.force_densities(), progress.force_densities);
    assert!(solved.nodes()[1].position[2] < 0.0, "free node should sag under load");

    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(wire.sent().last().map(String::as_str), Some(CLOSE));
    assert!(*wire.closed.lock());
    assert!(matches!(
        session.send_problem(&network, &settings(), &[[0.0; 3]]),
        Err(FdmError::ChannelClosed)
    ));
}

#[test]
fn intermediate_reports_leave_the_session_streaming() {
    let wire = Wire::default();
    let mut channel = FakeChannel::new(&wire);
    channel.solve = false;
    let session = Session::connect(address(2001), channel).unwrap();
    session.poll();
    session.send_problem(&cable(), &settings(), &[[0.0, 0.0, -1.0]]).unwrap();

    let payload = |finished: bool| {
        format!(
            r#"{{"Finished":{finished},"Iter":4,"Loss":0.5,"Q":[2,2,2],"X":[0,1,2,3],"Y":[0,0,0,0],"Z":[0,-0.5,-0.5,0]}}"#
        )
    };
    wire.push(ChannelEvent::Message(payload(false)));
    assert_eq!(session.poll().state, SessionState::Streaming);
    wire.push(ChannelEvent::Message("garbage".into()));
    let snap = session.poll();
    assert_eq!(snap.state, SessionState::Streaming);
    assert_eq!(snap.dropped, 1);
    wire.push(ChannelEvent::Message(payload(true)));
    assert_eq!(session.wait(Duration::from_millis(50)).state, SessionState::Idle);
}

#[test]
fn problem_before_open_is_rejected() {
    let wire = Wire::default();
    let mut channel = FakeChannel::new(&wire);
    channel.auto_open = false;
    let session = Session::connect(address(2002), channel).unwrap();

    assert!(matches!(
        session.send_problem(&cable(), &settings(), &[[0.0; 3]]),
        Err(FdmError::NotConnected(SessionState::Connecting))
    ));
    assert!(wire.sent().is_empty());

    wire.push(ChannelEvent::Opened);
    assert_eq!(session.wait(Duration::from_millis(50)).state, SessionState::Connected);
}

#[test]
fn remote_end_sentinel_closes_and_discards_later_messages() {
    let wire = Wire::default();
    let session = Session::connect(address(2003), FakeChannel::new(&wire)).unwrap();
    session.poll();
    wire.push(ChannelEvent::Message(CONNECTION_ENDED.into()));
    wire.push(ChannelEvent::Message(
        r#"{"Finished":true,"Iter":1,"Loss":0,"Q":[1,1,1],"X":[],"Y":[],"Z":[]}"#.into(),
    ));
    let snap = session.poll();
    assert_eq!(snap.state, SessionState::Closed);
    assert!(snap.progress.is_none());
    assert_eq!(snap.dropped, 1);
}

#[test]
fn wait_times_out_without_events() {
    let wire = Wire::default();
    let mut channel = FakeChannel::new(&wire);
    channel.auto_open = false;
    let session = Session::connect(address(2004), channel).unwrap();
    assert_eq!(session.wait(Duration::from_millis(10)).state, SessionState::Connecting);
}

#[test]
fn connector_reconnects_only_on_change_or_reset() {
    let first = Wire::default();
    let second = Wire::default();
    let third = Wire::default();
    let mut connector = Connector::new();

    assert!(connector.update(&address(3000), false, || FakeChannel::new(&first)).unwrap());
    assert!(!connector.update(&address(3000), false, || FakeChannel::new(&second)).unwrap());
    assert!(second.addresses.lock().is_empty());
    connector.session().unwrap().poll();

    assert!(connector.update(&address(3001), false, || FakeChannel::new(&second)).unwrap());
    assert!(*first.closed.lock());
    assert_eq!(first.sent().last().map(String::as_str), Some(CLOSE));
    assert_eq!(connector.session().unwrap().address(), &address(3001));

    assert!(connector.update(&address(3001), true, || FakeChannel::new(&third)).unwrap());
    assert!(*second.closed.lock());
    assert_eq!(*third.addresses.lock(), vec!["ws://127.0.0.1:3001".to_string()]);

    connector.close();
    assert!(connector.session().is_none());
    assert!(*third.closed.lock());
}

#[test]
fn dropping_a_session_closes_the_channel() {
    let wire = Wire::default();
    {
        let session = Session::connect(address(2005), FakeChannel::new(&wire)).unwrap();
        session.poll();
    }
    assert!(*wire.closed.lock());
    assert_eq!(wire.sent().last().map(String::as_str), Some(CLOSE));
}

/// Answers every problem synchronously, then lingers inside `send` after
/// waking a listener so the reply can be drained while the send is in flight.
struct EagerChannel {
    events: Option<Sender<ChannelEvent>>,
    sent_problem: Sender<()>,
}

impl MessageChannel for EagerChannel {
    fn open(&mut self, _address: &str, events: Sender<ChannelEvent>) -> FdmResult<()> {
        events.send(ChannelEvent::Opened).unwrap();
        self.events = Some(events);
        Ok(())
    }

    fn send(&mut self, payload: &str) -> FdmResult<()> {
        if payload.starts_with('{') {
            if let Some(events) = &self.events {
                let reply = r#"{"Finished":true,"Iter":7,"Loss":0.1,"Q":[2,2,2],"X":[0,1,2,3],"Y":[0,0,0,0],"Z":[0,-0.5,-0.5,0]}"#;
                events.send(ChannelEvent::Message(reply.into())).unwrap();
            }
            self.sent_problem.send(()).unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }

    fn close(&mut self) {}
}

#[test]
fn reply_drained_during_send_is_kept() {
    let (sent_tx, sent_rx) = bounded(1);
    let channel = EagerChannel { events: None, sent_problem: sent_tx };
    let session = Session::connect(address(2006), channel).unwrap();
    session.poll();

    thread::scope(|scope| {
        let listener = scope.spawn(|| {
            sent_rx.recv().unwrap();
            session.poll().state
        });
        session.send_problem(&cable(), &settings(), &[[0.0, 0.0, -1.0]]).unwrap();
        assert_eq!(listener.join().unwrap(), SessionState::Idle);
    });

    let snap = session.snapshot();
    assert_eq!(snap.state, SessionState::Idle);
    assert_eq!(snap.received, 1);
    let progress = snap.progress.unwrap();
    assert!(progress.finished);
    assert_eq!(progress.force_densities, vec![2.0; 3]);
    assert_eq!(snap.network.unwrap().force_densities(), vec![2.0; 3]);
}
