use std::sync::Arc;

use tether_core::{Endpoint, Runtime, RuntimeOptions};
use tether_types::{
    DataPipeOptions, HandleKind, SharedBufferOptions, Signals, TriggerCondition, WriteDataFlags,
};

#[test]
fn snapshot_lists_live_objects() {
    let rt = Runtime::new(RuntimeOptions::default().node_name("diag"));
    let (a, b) = rt.create_message_pipe();
    let (producer, consumer) = rt.create_data_pipe(&DataPipeOptions::new(1, 32)).unwrap();
    let buffer = rt
        .create_shared_buffer(16, &SharedBufferOptions::default())
        .unwrap();
    let trap = rt.create_trap(|_| {});

    a.write("one").unwrap();
    a.write("two").unwrap();
    producer.write(b"bytes", WriteDataFlags::empty()).unwrap();
    trap.add_trigger(&b, Signals::READABLE, TriggerCondition::Satisfied, 42)
        .unwrap();

    let snapshot = rt.snapshot();
    assert_eq!(snapshot.node_name, "diag");
    assert_eq!(snapshot.endpoints.len(), 5);

    let b_entry = snapshot
        .endpoints
        .iter()
        .find(|e| e.id == b.id())
        .unwrap();
    assert_eq!(b_entry.kind, HandleKind::MessagePipe);
    assert_eq!(b_entry.queued, 2);
    assert_ne!(b_entry.signals_state.satisfied & Signals::READABLE.bits(), 0);

    let consumer_entry = snapshot
        .endpoints
        .iter()
        .find(|e| e.id == consumer.id())
        .unwrap();
    assert_eq!(consumer_entry.queued, 5);

    assert_eq!(snapshot.traps.len(), 1);
    let trap_entry = &snapshot.traps[0];
    assert!(!trap_entry.armed);
    assert_eq!(trap_entry.triggers.len(), 1);
    assert_eq!(trap_entry.triggers[0].context, 42);
    assert_eq!(trap_entry.triggers[0].endpoint, b.id());
    assert!(trap_entry.triggers[0].ready);

    buffer.close().unwrap();
    drop(a);
    let snapshot = rt.snapshot();
    assert_eq!(snapshot.endpoints.len(), 3);
    trap.close().unwrap();
}

#[test]
fn object_ids_are_unique_per_runtime() {
    let rt: Arc<Runtime> = Runtime::new(RuntimeOptions::default());
    let (a, b) = rt.create_message_pipe();
    let (c, d) = rt.create_message_pipe();
    let trap = rt.create_trap(|_| {});
    let mut ids = vec![a.id(), b.id(), c.id(), d.id(), trap.id()];
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}
