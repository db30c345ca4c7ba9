use std::sync::Arc;

use tether::{
    DataPipeConsumer, DataPipeOptions, DataPipeProducer, Endpoint, Error, ErrorKind, Runtime,
    RuntimeOptions, Signals,
};
use tracing::{debug, info};

use crate::bridge::SignalStream;

fn pattern(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Fills as much of the ring as is contiguous right now. `None` means full.
fn fill(producer: &DataPipeProducer, sent: u64, total: u64) -> Result<Option<usize>, Error> {
    let mut region = match producer.begin_write() {
        Ok(region) => region,
        Err(err) if err.kind() == ErrorKind::ShouldWait => return Ok(None),
        Err(err) => return Err(err),
    };
    let n = region.len().min((total - sent) as usize);
    for (i, byte) in region[..n].iter_mut().enumerate() {
        *byte = pattern(sent + i as u64);
    }
    region.end(n)?;
    Ok(Some(n))
}

enum Drained {
    Bytes(usize),
    Empty,
    Finished,
}

fn drain(consumer: &DataPipeConsumer, received: u64) -> Result<Drained, String> {
    let region = match consumer.begin_read() {
        Ok(region) => region,
        Err(err) if err.kind() == ErrorKind::ShouldWait => return Ok(Drained::Empty),
        Err(err) if err.kind() == ErrorKind::FailedPrecondition => return Ok(Drained::Finished),
        Err(err) => return Err(format!("begin_read failed: {err}")),
    };
    if let Some(i) = (0..region.len()).find(|&i| region[i] != pattern(received + i as u64)) {
        return Err(format!("corrupt byte at offset {}", received + i as u64));
    }
    let n = region.len();
    region
        .end(n)
        .map_err(|e| format!("end_read failed: {e}"))?;
    Ok(Drained::Bytes(n))
}

async fn produce(runtime: Arc<Runtime>, producer: DataPipeProducer, total: u64) -> Result<u64, String> {
    let mut writable = SignalStream::watch(&runtime, &producer, Signals::WRITABLE)
        .map_err(|e| format!("failed to watch producer: {e}"))?;
    let mut sent = 0u64;
    let mut stalls = 0u64;
    while sent < total {
        match fill(&producer, sent, total).map_err(|e| format!("write failed: {e}"))? {
            Some(n) => sent += n as u64,
            None => {
                stalls += 1;
                writable
                    .ready()
                    .await
                    .map_err(|e| format!("producer wait failed: {e}"))?;
            }
        }
    }
    producer
        .close()
        .map_err(|e| format!("failed to close producer: {e}"))?;
    Ok(stalls)
}

pub async fn run(options: RuntimeOptions, total_bytes: u64, capacity: u32) -> Result<(), String> {
    let runtime = Runtime::new(options);
    let (producer, consumer) = runtime
        .create_data_pipe(&DataPipeOptions::new(1, capacity))
        .map_err(|e| format!("failed to create data pipe: {e}"))?;
    info!(capacity = producer.capacity(), total_bytes, "streaming");
    let writer = tokio::spawn(produce(runtime.clone(), producer, total_bytes));

    let mut readable = SignalStream::watch(&runtime, &consumer, Signals::READABLE)
        .map_err(|e| format!("failed to watch consumer: {e}"))?;
    let mut received = 0u64;
    loop {
        match drain(&consumer, received)? {
            Drained::Bytes(n) => {
                received += n as u64;
                debug!(received, "drained");
            }
            Drained::Empty => match readable.ready().await {
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::FailedPrecondition => break,
                Err(err) => return Err(format!("consumer wait failed: {err}")),
            },
            Drained::Finished => break,
        }
    }

    let stalls = writer
        .await
        .map_err(|e| format!("producer task failed: {e}"))??;
    if received != total_bytes {
        return Err(format!("received {received} of {total_bytes} bytes"));
    }
    info!(received, stalls, "stream complete");
    println!("data-stream: {received} byte(s) verified, producer stalled {stalls} time(s)");
    Ok(())
}
