use std::sync::{Arc, Mutex};
use std::thread;

use tether_core::{DataPipeConsumer, DataPipeProducer, Endpoint, Runtime, RuntimeOptions};
use tether_types::{
    DataPipeOptions, ErrorKind, ReadDataFlags, Signals, TrapEventResult, TriggerCondition,
    WriteDataFlags,
};

fn runtime() -> Arc<Runtime> {
    Runtime::new(RuntimeOptions::default())
}

fn pipe(rt: &Arc<Runtime>, element: u32, capacity: u32) -> (DataPipeProducer, DataPipeConsumer) {
    rt.create_data_pipe(&DataPipeOptions::new(element, capacity))
        .unwrap()
}

fn satisfied(endpoint: &impl Endpoint) -> Signals {
    endpoint.signal_state().unwrap().satisfied()
}

fn satisfiable(endpoint: &impl Endpoint) -> Signals {
    endpoint.signal_state().unwrap().satisfiable()
}

#[test]
fn creation_options_are_validated() {
    let rt = Runtime::new(
        RuntimeOptions::default()
            .default_data_pipe_capacity_bytes(10)
            .max_data_pipe_capacity_bytes(64),
    );
    let err = rt
        .create_data_pipe(&DataPipeOptions::new(0, 16))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = rt
        .create_data_pipe(&DataPipeOptions::new(4, 10))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    let err = rt
        .create_data_pipe(&DataPipeOptions::new(1, 128))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);

    let (producer, consumer) = pipe(&rt, 4, 0);
    assert_eq!(producer.capacity(), 8);
    assert_eq!(consumer.element_num_bytes(), 4);

    let (producer, _consumer) = pipe(&rt, 16, 0);
    assert_eq!(producer.capacity(), 16);
}

#[test]
fn write_then_read() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 1, 16);
    assert_eq!(satisfied(&producer), Signals::WRITABLE);
    assert_eq!(consumer.read(&mut [0u8; 4], ReadDataFlags::empty()).unwrap_err().kind(), ErrorKind::ShouldWait);

    assert_eq!(producer.write(b"hello", WriteDataFlags::empty()).unwrap(), 5);
    assert!(satisfied(&consumer).contains(Signals::READABLE | Signals::NEW_DATA_READABLE));
    assert_eq!(consumer.query().unwrap(), 5);

    let mut buf = [0u8; 8];
    assert_eq!(consumer.read(&mut buf, ReadDataFlags::empty()).unwrap(), 5);
    assert_eq!(&buf[..5], b"hello");
    assert!(!satisfied(&consumer).contains(Signals::READABLE));
    assert_eq!(producer.write(&[], WriteDataFlags::empty()).unwrap(), 0);
}

#[test]
fn sizes_must_be_whole_elements() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 4, 16);
    assert_eq!(
        producer.write(&[0; 6], WriteDataFlags::empty()).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    producer.write(&[1; 8], WriteDataFlags::empty()).unwrap();
    assert_eq!(
        consumer.read(&mut [0; 3], ReadDataFlags::empty()).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
    assert_eq!(consumer.read(&mut [0; 4], ReadDataFlags::empty()).unwrap(), 4);
}

#[test]
fn partial_and_all_or_none_writes() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 1, 8);

    let err = producer
        .write(&[7; 10], WriteDataFlags::ALL_OR_NONE)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert_eq!(consumer.query().unwrap(), 0);

    assert_eq!(producer.write(&[7; 10], WriteDataFlags::empty()).unwrap(), 8);
    assert!(!satisfied(&producer).contains(Signals::WRITABLE));
    assert!(satisfiable(&producer).contains(Signals::WRITABLE));
    assert_eq!(
        producer.write(&[7], WriteDataFlags::empty()).unwrap_err().kind(),
        ErrorKind::ShouldWait
    );

    consumer.discard(3, ReadDataFlags::empty()).unwrap();
    assert!(satisfied(&producer).contains(Signals::WRITABLE));
    assert_eq!(producer.write(&[8; 3], WriteDataFlags::ALL_OR_NONE).unwrap(), 3);
}

#[test]
fn read_flags() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 1, 16);
    producer.write(b"abcdef", WriteDataFlags::empty()).unwrap();

    let mut buf = [0u8; 3];
    assert_eq!(consumer.read(&mut buf, ReadDataFlags::PEEK).unwrap(), 3);
    assert_eq!(&buf, b"abc");
    assert_eq!(consumer.query().unwrap(), 6);

    assert_eq!(
        consumer
            .read(&mut [0; 10], ReadDataFlags::ALL_OR_NONE)
            .unwrap_err()
            .kind(),
        ErrorKind::OutOfRange
    );
    assert_eq!(consumer.discard(2, ReadDataFlags::ALL_OR_NONE).unwrap(), 2);
    assert_eq!(
        consumer.read(&mut [0; 10], ReadDataFlags::QUERY).unwrap(),
        4
    );
    assert_eq!(consumer.read(&mut buf, ReadDataFlags::DISCARD).unwrap(), 3);
    assert_eq!(consumer.read(&mut buf, ReadDataFlags::empty()).unwrap(), 1);
    assert_eq!(buf[0], b'f');

    for flags in [
        ReadDataFlags::QUERY | ReadDataFlags::PEEK,
        ReadDataFlags::QUERY | ReadDataFlags::DISCARD,
        ReadDataFlags::PEEK | ReadDataFlags::DISCARD,
    ] {
        assert_eq!(
            consumer.read(&mut buf, flags).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }
}

#[test]
fn any_read_attempt_clears_new_data() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 1, 16);
    producer.write(b"abc", WriteDataFlags::empty()).unwrap();
    assert!(satisfied(&consumer).contains(Signals::NEW_DATA_READABLE));

    let err = consumer
        .read(&mut [0; 8], ReadDataFlags::ALL_OR_NONE)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    assert!(!satisfied(&consumer).contains(Signals::NEW_DATA_READABLE));
    assert!(satisfied(&consumer).contains(Signals::READABLE));

    producer.write(b"d", WriteDataFlags::empty()).unwrap();
    assert!(satisfied(&consumer).contains(Signals::NEW_DATA_READABLE));
    consumer.query().unwrap();
    assert!(!satisfied(&consumer).contains(Signals::NEW_DATA_READABLE));
}

#[test]
fn new_data_readable_wakes_a_trap_each_time() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 1, 16);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let trap = rt.create_trap(move |event| sink.lock().unwrap().push(event.result));
    trap.add_trigger(&consumer, Signals::NEW_DATA_READABLE, TriggerCondition::Satisfied, 1)
        .unwrap();

    trap.arm(1).unwrap();
    producer.write(b"a", WriteDataFlags::empty()).unwrap();
    assert!(trap.arm(1).is_err());
    consumer.query().unwrap();
    trap.arm(1).unwrap();
    producer.write(b"b", WriteDataFlags::empty()).unwrap();

    assert_eq!(
        *events.lock().unwrap(),
        vec![TrapEventResult::Ok, TrapEventResult::Ok]
    );
    trap.close().unwrap();
}

#[test]
fn closed_producer_drains_then_fails() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 1, 16);
    producer.write(b"tail", WriteDataFlags::empty()).unwrap();
    producer.close().unwrap();

    assert!(satisfied(&consumer).contains(Signals::PEER_CLOSED | Signals::READABLE));
    let err = consumer
        .read(&mut [0; 8], ReadDataFlags::ALL_OR_NONE)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);

    let mut buf = [0u8; 8];
    assert_eq!(consumer.read(&mut buf, ReadDataFlags::empty()).unwrap(), 4);
    assert_eq!(
        consumer.read(&mut buf, ReadDataFlags::empty()).unwrap_err().kind(),
        ErrorKind::FailedPrecondition
    );
    assert_eq!(
        consumer.begin_read().err().map(|e| e.kind()),
        Some(ErrorKind::FailedPrecondition)
    );
    let remaining = satisfiable(&consumer);
    assert!(!remaining.intersects(Signals::READABLE | Signals::NEW_DATA_READABLE));
    assert!(remaining.contains(Signals::PEER_CLOSED));
}

#[test]
fn closed_consumer_leaves_a_full_producer_unwritable() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 1, 4);
    producer.write(&[1; 4], WriteDataFlags::empty()).unwrap();
    consumer.close().unwrap();

    let state = producer.signal_state().unwrap();
    assert_eq!(state.satisfied(), Signals::PEER_CLOSED);
    assert!(!state.satisfiable().contains(Signals::WRITABLE));
    assert_eq!(
        producer.write(&[1], WriteDataFlags::empty()).unwrap_err().kind(),
        ErrorKind::FailedPrecondition
    );
    assert_eq!(
        producer.begin_write().err().map(|e| e.kind()),
        Some(ErrorKind::FailedPrecondition)
    );
}

// ── Two-phase ──────────────────────────────────────────────────

#[test]
fn two_phase_write_blocks_other_writes() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 2, 8);

    let mut region = producer.begin_write().unwrap();
    assert_eq!(region.len(), 8);
    region[..4].copy_from_slice(b"wxyz");
    assert!(!satisfied(&producer).contains(Signals::WRITABLE));
    assert_eq!(
        producer.write(&[0; 2], WriteDataFlags::empty()).unwrap_err().kind(),
        ErrorKind::Busy
    );
    assert_eq!(producer.begin_write().err().map(|e| e.kind()), Some(ErrorKind::Busy));
    region.end(4).unwrap();

    let mut buf = [0u8; 4];
    consumer.read(&mut buf, ReadDataFlags::ALL_OR_NONE).unwrap();
    assert_eq!(&buf, b"wxyz");
}

#[test]
fn invalid_end_still_terminates_the_session() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 2, 8);

    let region = producer.begin_write().unwrap();
    assert_eq!(region.end(3).unwrap_err().kind(), ErrorKind::InvalidArgument);
    let region = producer.begin_write().unwrap();
    assert_eq!(region.end(10).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(consumer.query().unwrap(), 0);

    {
        let _dropped = producer.begin_write().unwrap();
    }
    assert_eq!(producer.write(&[5; 2], WriteDataFlags::empty()).unwrap(), 2);

    let region = consumer.begin_read().unwrap();
    assert_eq!(&*region, &[5, 5]);
    assert_eq!(
        consumer.read(&mut [0; 2], ReadDataFlags::empty()).unwrap_err().kind(),
        ErrorKind::Busy
    );
    assert_eq!(region.end(1).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(consumer.query().unwrap(), 2);
}

#[test]
fn two_phase_spans_stop_at_the_ring_boundary() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 1, 100);

    let first: Vec<u8> = (0..20).collect();
    assert_eq!(producer.write(&first, WriteDataFlags::empty()).unwrap(), 20);
    assert_eq!(consumer.discard(10, ReadDataFlags::empty()).unwrap(), 10);

    let mut region = producer.begin_write().unwrap();
    assert_eq!(region.len(), 80);
    region.fill(0xaa);
    region.end(80).unwrap();

    let mut region = producer.begin_write().unwrap();
    assert_eq!(region.len(), 10);
    region.fill(0xbb);
    region.end(10).unwrap();
    assert_eq!(
        producer.begin_write().err().map(|e| e.kind()),
        Some(ErrorKind::ShouldWait)
    );
    assert_eq!(consumer.query().unwrap(), 100);

    let region = consumer.begin_read().unwrap();
    assert_eq!(region.len(), 90);
    assert_eq!(&region[..10], &first[10..]);
    drop(region);

    let mut all = [0u8; 100];
    assert_eq!(consumer.read(&mut all, ReadDataFlags::ALL_OR_NONE).unwrap(), 100);
    assert_eq!(&all[..10], &first[10..]);
    assert!(all[10..90].iter().all(|&b| b == 0xaa));
    assert!(all[90..].iter().all(|&b| b == 0xbb));
}

#[test]
fn two_phase_read_releases_space_to_the_producer() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 1, 4);
    producer.write(b"full", WriteDataFlags::empty()).unwrap();
    assert!(!satisfied(&producer).contains(Signals::WRITABLE));

    let region = consumer.begin_read().unwrap();
    assert_eq!(&*region, b"full");
    assert!(!satisfied(&consumer).contains(Signals::READABLE));
    region.end(2).unwrap();

    assert!(satisfied(&producer).contains(Signals::WRITABLE));
    assert_eq!(producer.write(b"more", WriteDataFlags::empty()).unwrap(), 2);
    let mut buf = [0u8; 4];
    consumer.read(&mut buf, ReadDataFlags::ALL_OR_NONE).unwrap();
    assert_eq!(&buf, b"llmo");
}

#[test]
fn streaming_across_threads_keeps_every_byte() {
    let rt = runtime();
    let (producer, consumer) = pipe(&rt, 1, 64);
    let total = 10_000usize;

    let writer = thread::spawn(move || {
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let mut sent = 0;
        while sent < total {
            match producer.write(&data[sent..], WriteDataFlags::empty()) {
                Ok(n) => sent += n,
                Err(err) if err.kind() == ErrorKind::ShouldWait => thread::yield_now(),
                Err(err) => panic!("write failed: {err}"),
            }
        }
    });

    let mut received = Vec::with_capacity(total);
    let mut buf = [0u8; 37];
    loop {
        match consumer.read(&mut buf, ReadDataFlags::empty()) {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == ErrorKind::ShouldWait => thread::yield_now(),
            Err(err) if err.kind() == ErrorKind::FailedPrecondition => break,
            Err(err) => panic!("read failed: {err}"),
        }
    }
    writer.join().unwrap();

    assert_eq!(received.len(), total);
    assert!(received.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
}

#[test]
fn data_pipes_have_no_quotas() {
    let rt = runtime();
    let (_producer, consumer) = pipe(&rt, 1, 4);
    let err = consumer
        .query_quota(tether_types::QuotaType::ReceiveQueueLength)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}
