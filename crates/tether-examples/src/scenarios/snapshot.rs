use std::sync::Arc;

use tether::{
    DataPipeOptions, DuplicateBufferOptions, Runtime, RuntimeOptions, RuntimeSnapshot,
    SharedBufferOptions, Signals, TriggerCondition, WriteDataFlags,
};
use tracing::info;

/// Builds a small, fixed population of objects worth looking at.
fn populate(runtime: &Arc<Runtime>) -> Result<impl Sized, String> {
    let (a, b) = runtime.create_message_pipe();
    a.write("one").map_err(|e| format!("write failed: {e}"))?;
    a.write("two").map_err(|e| format!("write failed: {e}"))?;

    let (producer, consumer) = runtime
        .create_data_pipe(&DataPipeOptions::new(1, 32))
        .map_err(|e| format!("failed to create data pipe: {e}"))?;
    producer
        .write(b"streamed bytes", WriteDataFlags::empty())
        .map_err(|e| format!("data write failed: {e}"))?;

    let buffer = runtime
        .create_shared_buffer(4096, &SharedBufferOptions::default())
        .map_err(|e| format!("failed to create buffer: {e}"))?;
    let read_only = buffer
        .duplicate(&DuplicateBufferOptions { read_only: true })
        .map_err(|e| format!("failed to duplicate buffer: {e}"))?;

    let trap = runtime.create_trap(|_| {});
    trap.add_trigger(&b, Signals::READABLE, TriggerCondition::Satisfied, 1)
        .map_err(|e| format!("failed to add trigger: {e}"))?;
    trap.add_trigger(&consumer, Signals::PEER_CLOSED, TriggerCondition::Satisfied, 2)
        .map_err(|e| format!("failed to add trigger: {e}"))?;

    Ok((a, b, producer, consumer, buffer, read_only, trap))
}

pub fn capture(options: RuntimeOptions) -> Result<RuntimeSnapshot, String> {
    let runtime = Runtime::new(options);
    let _objects = populate(&runtime)?;
    Ok(runtime.snapshot())
}

pub async fn run(options: RuntimeOptions) -> Result<(), String> {
    let snapshot = capture(options)?;
    info!(
        endpoints = snapshot.endpoints.len(),
        traps = snapshot.traps.len(),
        "captured snapshot"
    );
    let json = facet_json::to_string(&snapshot)
        .map_err(|e| format!("failed to encode snapshot: {e}"))?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether::HandleKind;

    #[test]
    fn snapshot_lists_every_live_object() {
        let snapshot = capture(RuntimeOptions::default().node_name("snap")).unwrap();
        assert_eq!(snapshot.node_name, "snap");

        let count = |kind: HandleKind| snapshot.endpoints.iter().filter(|e| e.kind == kind).count();
        assert_eq!(count(HandleKind::MessagePipe), 2);
        assert_eq!(count(HandleKind::DataPipeProducer), 1);
        assert_eq!(count(HandleKind::DataPipeConsumer), 1);
        assert_eq!(count(HandleKind::SharedBuffer), 2);

        let queued: Vec<_> = snapshot
            .endpoints
            .iter()
            .filter(|e| e.kind == HandleKind::MessagePipe)
            .map(|e| e.queued)
            .collect();
        assert_eq!(queued, vec![0, 2]);

        assert_eq!(snapshot.traps.len(), 1);
        assert_eq!(snapshot.traps[0].triggers.len(), 2);
        assert!(!snapshot.traps[0].armed);
    }

    #[test]
    fn snapshot_encodes_as_json() {
        let snapshot = capture(RuntimeOptions::default().node_name("json")).unwrap();
        let json = facet_json::to_string(&snapshot).unwrap();
        assert!(json.starts_with(r#"{"node_name":"json","endpoints":["#));
    }
}
