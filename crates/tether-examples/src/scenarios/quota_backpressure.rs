use tether::{
    Endpoint, QuotaOptions, QuotaType, Runtime, RuntimeOptions, Signals, TrapEvent,
    TrapEventResult, TriggerCondition,
};
use tokio::sync::mpsc;
use tracing::info;

const OVER: u64 = 1;
const UNDER: u64 = 2;

fn wait_for(events: &mut mpsc::UnboundedReceiver<TrapEvent>, context: u64) -> bool {
    while let Ok(event) = events.try_recv() {
        if event.context == context && event.result == TrapEventResult::Ok {
            return true;
        }
    }
    false
}

/// Writes into a pipe until the receiver's queue-length quota trips, then
/// drains it until the quota clears again.
pub async fn run(options: RuntimeOptions, limit: u64) -> Result<(), String> {
    if limit == 0 {
        return Err("quota limit must be at least 1".to_string());
    }
    let runtime = Runtime::new(options);
    let (sender, receiver) = runtime.create_message_pipe();
    receiver
        .set_quota(QuotaType::ReceiveQueueLength, limit, &QuotaOptions::default())
        .map_err(|e| format!("failed to set quota: {e}"))?;

    let (tx, mut events) = mpsc::unbounded_channel();
    let trap = runtime.create_trap(move |event| {
        let _ = tx.send(event);
    });
    trap.add_trigger(
        &receiver,
        Signals::QUOTA_EXCEEDED,
        TriggerCondition::Satisfied,
        OVER,
    )
    .map_err(|e| format!("failed to watch quota: {e}"))?;
    trap.arm(1).map_err(|e| format!("failed to arm: {e}"))?;

    let mut written = 0u64;
    while !wait_for(&mut events, OVER) {
        sender
            .write(format!("message {written}").into_bytes())
            .map_err(|e| format!("write failed: {e}"))?;
        written += 1;
    }
    let usage = receiver
        .query_quota(QuotaType::ReceiveQueueLength)
        .map_err(|e| format!("failed to query quota: {e}"))?;
    info!(written, usage = usage.usage, limit, "receiver over quota");
    println!("quota: exceeded after {written} write(s), {} queued", usage.usage);

    trap.remove_trigger(OVER)
        .map_err(|e| format!("failed to drop quota watch: {e}"))?;
    trap.add_trigger(
        &receiver,
        Signals::QUOTA_EXCEEDED,
        TriggerCondition::Unsatisfied,
        UNDER,
    )
    .map_err(|e| format!("failed to watch quota: {e}"))?;
    trap.arm(1).map_err(|e| format!("failed to arm: {e}"))?;

    let mut drained = 0u64;
    while !wait_for(&mut events, UNDER) {
        receiver
            .read()
            .map_err(|e| format!("read failed: {e}"))?;
        drained += 1;
    }
    let queued = receiver
        .queued_messages()
        .map_err(|e| format!("failed to count queue: {e}"))?;
    info!(drained, queued, "receiver back under quota");
    println!("quota: cleared after draining {drained}, {queued} still queued");

    trap.close().map_err(|e| format!("failed to close trap: {e}"))?;
    if written != limit + 1 || queued as u64 != limit - 1 {
        return Err(format!(
            "unexpected hysteresis: tripped after {written}, cleared at {queued} for limit {limit}"
        ));
    }
    let state = receiver
        .signal_state()
        .map_err(|e| format!("failed to read signals: {e}"))?;
    if state.satisfied().contains(Signals::QUOTA_EXCEEDED) {
        return Err("quota still reported as exceeded".to_string());
    }
    Ok(())
}
