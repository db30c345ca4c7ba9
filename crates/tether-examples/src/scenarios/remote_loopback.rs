use std::sync::Arc;

use tether::wire::{
    DEFAULT_MAX_FRAME_BYTES, FrameSink, FrameTransport, Inbound, apply_frame, encode_token,
};
use tether::{Error, ErrorKind, MessagePipeEndpoint, Runtime, RuntimeOptions, Signals};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{SignalStream, read_message};

struct ChannelSink(mpsc::UnboundedSender<Vec<u8>>);

impl FrameSink for ChannelSink {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), Error> {
        self.0
            .send(frame)
            .map_err(|_| Error::failed_precondition("frame channel is closed"))
    }
}

type Link = Arc<FrameTransport<ChannelSink>>;

/// Applies inbound frames to `runtime`. Imported endpoints answer through
/// `reply` and are handed to `imported`.
async fn pump(
    runtime: Arc<Runtime>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    reply: Link,
    imported: mpsc::UnboundedSender<MessagePipeEndpoint>,
) {
    let node = runtime.options().node_name.clone();
    while let Some(frame) = frames.recv().await {
        match apply_frame(&runtime, &frame, DEFAULT_MAX_FRAME_BYTES) {
            Ok(Inbound::Endpoint(token)) => match runtime.import_endpoint(token, reply.clone()) {
                Ok(endpoint) => {
                    let _ = imported.send(endpoint);
                }
                Err(err) => warn!(%node, %err, "failed to import endpoint"),
            },
            Ok(inbound) => debug!(%node, ?inbound, "frame applied"),
            Err(err) => warn!(%node, %err, "dropping frame"),
        }
    }
}

/// Shouts every message back until the peer hangs up.
async fn shout(runtime: Arc<Runtime>, pipe: MessagePipeEndpoint) -> Result<u32, String> {
    let mut readable = SignalStream::watch(&runtime, &pipe, Signals::READABLE)
        .map_err(|e| format!("failed to watch imported pipe: {e}"))?;
    let mut echoed = 0;
    loop {
        let message = match read_message(&pipe, &mut readable).await {
            Ok(message) => message,
            Err(err) if err.kind() == ErrorKind::FailedPrecondition => return Ok(echoed),
            Err(err) => return Err(format!("remote read failed: {err}")),
        };
        pipe.write(message.payload.to_ascii_uppercase())
            .map_err(|e| format!("remote write failed: {e}"))?;
        echoed += 1;
    }
}

pub async fn run(options: RuntimeOptions, messages: u32) -> Result<(), String> {
    let base = options.node_name.clone();
    let left = Runtime::new(options.clone().node_name(format!("{base}-left")));
    let right = Runtime::new(options.node_name(format!("{base}-right")));

    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();
    let to_right: Link = FrameTransport::new(ChannelSink(right_tx));
    let to_left: Link = FrameTransport::new(ChannelSink(left_tx));
    let (imported_tx, mut imported_rx) = mpsc::unbounded_channel();
    let left_pump = tokio::spawn(pump(
        left.clone(),
        left_rx,
        to_right.clone(),
        imported_tx.clone(),
    ));
    let right_pump = tokio::spawn(pump(right.clone(), right_rx, to_left.clone(), imported_tx));

    let (local, outbound) = left.create_message_pipe();
    local
        .write("sent before the move")
        .map_err(|e| format!("initial write failed: {e}"))?;
    let token = left
        .export_endpoint(outbound, to_right.clone())
        .map_err(|e| format!("export failed: {e}"))?;
    let frame = encode_token(&token).map_err(|e| format!("failed to frame token: {e}"))?;
    to_right
        .sink()
        .send_frame(frame)
        .map_err(|e| format!("failed to send token: {e}"))?;
    let remote = imported_rx
        .recv()
        .await
        .ok_or_else(|| "endpoint never arrived".to_string())?;
    let shouter = tokio::spawn(shout(right.clone(), remote));

    let mut readable = SignalStream::watch(&left, &local, Signals::READABLE)
        .map_err(|e| format!("failed to watch local pipe: {e}"))?;
    let mut expected = vec!["SENT BEFORE THE MOVE".to_string()];
    expected.extend((0..messages).map(|i| format!("MESSAGE {i}")));
    for i in 0..messages {
        local
            .write(format!("message {i}").into_bytes())
            .map_err(|e| format!("write {i} failed: {e}"))?;
    }
    for want in &expected {
        let reply = read_message(&local, &mut readable)
            .await
            .map_err(|e| format!("reply read failed: {e}"))?;
        if reply.payload != want.as_bytes() {
            return Err(format!(
                "expected {want:?}, got {:?}",
                String::from_utf8_lossy(&reply.payload)
            ));
        }
    }

    drop(readable);
    drop(local);
    let echoed = shouter
        .await
        .map_err(|e| format!("remote task failed: {e}"))??;
    left_pump.abort();
    right_pump.abort();

    info!(echoed, "remote loopback finished");
    println!("remote-loopback: {echoed} message(s) crossed the wire and came back");
    Ok(())
}
