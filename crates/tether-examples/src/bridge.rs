//! Awaiting tether signals from tokio tasks.

use tether::{
    ArmError, Endpoint, Error, ErrorKind, Message, MessagePipeEndpoint, Runtime, SignalState,
    Signals, Trap, TrapEvent, TrapEventResult, TriggerCondition,
};
use tokio::sync::mpsc;

/// One trap with a single `Satisfied` trigger, readable as a future.
pub struct SignalStream {
    trap: Trap,
    events: mpsc::UnboundedReceiver<TrapEvent>,
}

impl SignalStream {
    pub fn watch<E: Endpoint + ?Sized>(
        runtime: &Runtime,
        endpoint: &E,
        signals: Signals,
    ) -> Result<Self, Error> {
        let (tx, events) = mpsc::unbounded_channel();
        let trap = runtime.create_trap(move |event| {
            let _ = tx.send(event);
        });
        trap.add_trigger(endpoint, signals, TriggerCondition::Satisfied, 0)?;
        Ok(Self { trap, events })
    }

    /// Resolves once any watched signal is satisfied.
    pub async fn ready(&mut self) -> Result<SignalState, Error> {
        match self.trap.arm(1) {
            Ok(()) => {}
            Err(ArmError::Blocked { events, .. }) => {
                return match events.first() {
                    Some(event) => settle(event),
                    None => Err(Error::failed_precondition("trap blocked with no ready events")),
                };
            }
            Err(ArmError::NoTriggers) => {
                return Err(Error::failed_precondition("watch was cancelled"));
            }
            Err(err) => return Err(err.into()),
        }

        match self.events.recv().await {
            Some(event) => settle(&event),
            None => Err(Error::invalid_argument("trap handler is gone")),
        }
    }
}

impl Drop for SignalStream {
    fn drop(&mut self) {
        let _ = self.trap.close();
    }
}

fn settle(event: &TrapEvent) -> Result<SignalState, Error> {
    match event.result {
        TrapEventResult::Ok => Ok(event.signals_state),
        TrapEventResult::FailedPrecondition => Err(Error::failed_precondition(
            "watched signals can no longer be satisfied",
        )),
        TrapEventResult::Cancelled => Err(Error::failed_precondition("watch was cancelled")),
    }
}

/// Reads the next message, parking the task until one is queued.
pub async fn read_message(
    pipe: &MessagePipeEndpoint,
    readable: &mut SignalStream,
) -> Result<Message, Error> {
    loop {
        match pipe.read() {
            Err(err) if err.kind() == ErrorKind::ShouldWait => {
                readable.ready().await?;
            }
            other => return other,
        }
    }
}
