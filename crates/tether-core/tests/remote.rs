use std::sync::{Arc, Mutex};

use tether_core::{Endpoint, Handle, Message, Runtime, RuntimeOptions, Transport};
use tether_types::{Error, ErrorKind, PeerToken, Signals, TrapEvent, TriggerCondition};

/// Delivers straight into another runtime on the calling thread.
struct Loopback {
    target: Arc<Runtime>,
    closed: Mutex<Vec<PeerToken>>,
}

impl Loopback {
    fn to(target: &Arc<Runtime>) -> Arc<Self> {
        Arc::new(Self {
            target: target.clone(),
            closed: Mutex::new(Vec::new()),
        })
    }
}

impl Transport for Loopback {
    fn send(&self, peer: PeerToken, message: Message) -> Result<(), Error> {
        self.target.deliver_remote(peer, message)
    }

    fn peer_closed(&self, peer: PeerToken) {
        self.closed.lock().unwrap().push(peer);
        self.target.remote_peer_closed(peer);
    }
}

fn runtimes() -> (Arc<Runtime>, Arc<Runtime>) {
    (
        Runtime::new(RuntimeOptions::default().node_name("left")),
        Runtime::new(RuntimeOptions::default().node_name("right")),
    )
}

fn payload(message: Message) -> String {
    String::from_utf8(message.payload).unwrap()
}

#[test]
fn exported_endpoint_keeps_talking_to_its_peer() {
    let (left, right) = runtimes();
    let to_right = Loopback::to(&right);
    let to_left = Loopback::to(&left);

    let (a, b) = left.create_message_pipe();
    a.write("queued before export").unwrap();

    let token = left.export_endpoint(b.clone(), to_right.clone()).unwrap();
    assert_eq!(token.queued, vec![b"queued before export".to_vec()]);
    assert!(!token.peer_closed);
    assert_eq!(b.signal_state().unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert!(a.signal_state().unwrap().satisfied().contains(Signals::PEER_REMOTE));

    let remote = right.import_endpoint(token, to_left.clone()).unwrap();
    assert!(remote.signal_state().unwrap().satisfied().contains(Signals::PEER_REMOTE));
    assert_eq!(payload(remote.read().unwrap()), "queued before export");

    a.write("hello").unwrap();
    assert_eq!(payload(remote.read().unwrap()), "hello");
    remote.write("reply").unwrap();
    assert_eq!(payload(a.read().unwrap()), "reply");

    assert_eq!(left.snapshot().remote_bindings, 1);
    assert_eq!(right.snapshot().remote_bindings, 1);
}

#[test]
fn closing_either_side_reaches_across() {
    let (left, right) = runtimes();
    let to_right = Loopback::to(&right);
    let to_left = Loopback::to(&left);

    let (a, b) = left.create_message_pipe();
    let token = left.export_endpoint(b, to_right.clone()).unwrap();
    let peer = token.peer;
    let remote = right.import_endpoint(token, to_left.clone()).unwrap();

    remote.close().unwrap();
    assert_eq!(*to_left.closed.lock().unwrap(), vec![peer]);
    let state = a.signal_state().unwrap();
    assert!(state.satisfied().contains(Signals::PEER_CLOSED));
    assert!(!state.satisfied().contains(Signals::PEER_REMOTE));
    assert_eq!(a.write("gone").unwrap_err().kind(), ErrorKind::FailedPrecondition);
    assert_eq!(left.snapshot().remote_bindings, 0);

    let (c, d) = left.create_message_pipe();
    let token = left.export_endpoint(d, to_right.clone()).unwrap();
    let remote = right.import_endpoint(token, to_left.clone()).unwrap();
    c.close().unwrap();
    assert!(remote.signal_state().unwrap().satisfied().contains(Signals::PEER_CLOSED));
}

#[test]
fn peer_closure_survives_the_token() {
    let (left, right) = runtimes();
    let (a, b) = left.create_message_pipe();
    a.write("final").unwrap();
    a.close().unwrap();

    let token = left.export_endpoint(b, Loopback::to(&right)).unwrap();
    assert!(token.peer_closed);
    let remote = right.import_endpoint(token, Loopback::to(&left)).unwrap();
    let state = remote.signal_state().unwrap();
    assert!(state.satisfied().contains(Signals::PEER_CLOSED | Signals::READABLE));
    assert_eq!(payload(remote.read().unwrap()), "final");
    assert_eq!(remote.read().unwrap_err().kind(), ErrorKind::FailedPrecondition);
}

#[test]
fn transport_deliveries_are_flagged() {
    let (left, right) = runtimes();
    let (a, b) = left.create_message_pipe();
    let token = left.export_endpoint(b, Loopback::to(&right)).unwrap();
    let peer = token.peer;
    drop(token);

    let events: Arc<Mutex<Vec<TrapEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let trap = left.create_trap(move |event| sink.lock().unwrap().push(event));
    trap.add_trigger(&a, Signals::READABLE, TriggerCondition::Satisfied, 1)
        .unwrap();
    trap.arm(1).unwrap();

    left.deliver_remote(peer, Message::new("from afar")).unwrap();
    {
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].within_api_call);
    }
    assert_eq!(payload(a.read().unwrap()), "from afar");
    trap.close().unwrap();
}

#[test]
fn remote_quotas_and_signals_follow_the_write_path() {
    let (left, right) = runtimes();
    let (a, b) = left.create_message_pipe();
    let token = left.export_endpoint(b, Loopback::to(&right)).unwrap();
    let peer = token.peer;

    a.set_quota(
        tether_types::QuotaType::ReceiveQueueLength,
        1,
        &Default::default(),
    )
    .unwrap();
    left.deliver_remote(peer, Message::new("1")).unwrap();
    left.deliver_remote(peer, Message::new("2")).unwrap();
    assert!(a.signal_state().unwrap().satisfied().contains(Signals::QUOTA_EXCEEDED));
}

#[test]
fn unknown_tokens_and_handle_bearing_queues_are_rejected() {
    let (left, right) = runtimes();
    let bogus = PeerToken { node: 1, link: 999 };
    assert_eq!(
        left.deliver_remote(bogus, Message::new("?")).unwrap_err().kind(),
        ErrorKind::NotFound
    );

    let (a, b) = left.create_message_pipe();
    let (c, _d) = left.create_message_pipe();
    a.write(Message::with_handles("carrying", vec![Handle::from(c)]))
        .unwrap();
    let err = left
        .export_endpoint(b.clone(), Loopback::to(&right))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(b.queued_messages().unwrap(), 1);
}

#[test]
fn importing_the_same_token_twice_fails() {
    let (left, right) = runtimes();
    let (_a, b) = left.create_message_pipe();
    let token = left.export_endpoint(b, Loopback::to(&right)).unwrap();
    let _remote = right
        .import_endpoint(token.clone(), Loopback::to(&left))
        .unwrap();
    let err = right
        .import_endpoint(token, Loopback::to(&left))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
}

#[test]
fn moved_endpoint_keeps_its_remote_peer() {
    let (left, right) = runtimes();
    let to_right = Loopback::to(&right);
    let to_left = Loopback::to(&left);

    let (a, b) = left.create_message_pipe();
    let token = left.export_endpoint(b, to_right.clone()).unwrap();
    let remote = right.import_endpoint(token, to_left.clone()).unwrap();

    let (x, y) = left.create_message_pipe();
    x.write(Message::with_handles("carrying", vec![Handle::from(a)]))
        .unwrap();
    let mut carried = y.read().unwrap();
    let moved = carried.handles.pop().unwrap().into_message_pipe().unwrap();
    drop(carried);

    remote.write("from remote").unwrap();
    assert_eq!(payload(moved.read().unwrap()), "from remote");
    moved.write("from moved").unwrap();
    assert_eq!(payload(remote.read().unwrap()), "from moved");
    assert_eq!(left.snapshot().remote_bindings, 1);

    remote.close().unwrap();
    let state = moved.signal_state().unwrap();
    assert!(state.satisfied().contains(Signals::PEER_CLOSED));
    assert!(!state.satisfied().contains(Signals::PEER_REMOTE));
}

#[test]
fn late_delivery_to_a_closed_endpoint_fails_precondition() {
    let (left, right) = runtimes();
    let (a, b) = left.create_message_pipe();
    let token = left.export_endpoint(b, Loopback::to(&right)).unwrap();
    let peer = token.peer;

    a.close().unwrap();
    let err = left.deliver_remote(peer, Message::new("late")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    assert_eq!(left.snapshot().remote_bindings, 0);

    // Once the far side reports its own closure the binding is forgotten.
    left.remote_peer_closed(peer);
    let err = left.deliver_remote(peer, Message::new("later")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn node_ids_come_from_options_or_are_random() {
    let pinned = Runtime::new(RuntimeOptions::default().node_id(9));
    let (_a, b) = pinned.create_message_pipe();
    let token = pinned.export_endpoint(b, Loopback::to(&pinned)).unwrap();
    assert_eq!(token.peer.node, 9);

    let (left, right) = runtimes();
    let (_c, d) = left.create_message_pipe();
    let (_e, f) = right.create_message_pipe();
    let from_left = left.export_endpoint(d, Loopback::to(&right)).unwrap();
    let from_right = right.export_endpoint(f, Loopback::to(&left)).unwrap();
    assert_ne!(from_left.peer, from_right.peer);
}
