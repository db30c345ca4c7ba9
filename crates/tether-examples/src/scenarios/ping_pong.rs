use std::sync::Arc;

use tether::{ErrorKind, MessagePipeEndpoint, Runtime, RuntimeOptions, Signals};
use tracing::{debug, info};

use crate::bridge::{SignalStream, read_message};

fn decode_counter(payload: &[u8]) -> Result<u32, String> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| format!("expected a 4-byte counter, got {} bytes", payload.len()))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Answers every counter with its successor until the peer hangs up.
async fn bounce(runtime: Arc<Runtime>, pipe: MessagePipeEndpoint) -> Result<u32, String> {
    let mut readable = SignalStream::watch(&runtime, &pipe, Signals::READABLE)
        .map_err(|e| format!("failed to watch bouncer pipe: {e}"))?;
    let mut bounced = 0;
    loop {
        let message = match read_message(&pipe, &mut readable).await {
            Ok(message) => message,
            Err(err) if err.kind() == ErrorKind::FailedPrecondition => return Ok(bounced),
            Err(err) => return Err(format!("bouncer read failed: {err}")),
        };
        let value = decode_counter(&message.payload)?;
        pipe.write((value + 1).to_be_bytes().to_vec())
            .map_err(|e| format!("bouncer write failed: {e}"))?;
        bounced += 1;
    }
}

pub async fn run(options: RuntimeOptions, rounds: u32) -> Result<(), String> {
    let runtime = Runtime::new(options);
    let (local, far) = runtime.create_message_pipe();
    let bouncer = tokio::spawn(bounce(runtime.clone(), far));

    let mut readable = SignalStream::watch(&runtime, &local, Signals::READABLE)
        .map_err(|e| format!("failed to watch local pipe: {e}"))?;
    let mut value = 0u32;
    for round in 0..rounds {
        local
            .write(value.to_be_bytes().to_vec())
            .map_err(|e| format!("write failed in round {round}: {e}"))?;
        let reply = read_message(&local, &mut readable)
            .await
            .map_err(|e| format!("read failed in round {round}: {e}"))?;
        let next = decode_counter(&reply.payload)?;
        if next != value + 1 {
            return Err(format!("round {round}: sent {value}, got back {next}"));
        }
        debug!(round, value = next, "pong");
        value = next + 1;
    }

    drop(readable);
    drop(local);
    let bounced = bouncer
        .await
        .map_err(|e| format!("bouncer task failed: {e}"))??;
    info!(rounds, bounced, final_value = value, "ping-pong finished");
    println!("ping-pong: {bounced} round trip(s), final counter {value}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bounces_every_round() {
        run(RuntimeOptions::default(), 50).await.unwrap();
    }

    #[test]
    fn counters_must_be_four_bytes() {
        assert_eq!(decode_counter(&7u32.to_be_bytes()).unwrap(), 7);
        assert!(decode_counter(b"abc").is_err());
    }
}
