// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Replication consumer integration tests: session establishment, snapshot
//! ordering, flow control and liveness, with a recording producer standing
//! in for the connection layer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use memstone::{
    CasToken, Datatype, DcpConsumer, DcpResponse, DeletionMessage, DocState, DocStateFilter,
    Engine, EngineError, KvEngine, MessageProducer, MutationMessage, Opaque, ResponseStatus,
    StoreOp, StreamEndReason, TaskPool, VBucketState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Out {
    StreamReq { vbid: u16, opaque: Opaque, start_seqno: u64 },
    AddStreamRsp { success: bool },
    CloseStream { vbid: u16 },
    BufferAck { bytes: u32 },
    Control { key: String, value: String },
    Noop,
}

#[derive(Debug, Default)]
struct RecordingProducer {
    messages: Vec<Out>,
}

impl RecordingProducer {
    fn stream_req_opaques(&self) -> Vec<Opaque> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Out::StreamReq { opaque, .. } => Some(*opaque),
                _ => None,
            })
            .collect()
    }

    fn control_keys(&self) -> Vec<String> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Out::Control { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    fn buffer_acks(&self) -> Vec<u32> {
        self.messages
            .iter()
            .filter_map(|m| match m {
                Out::BufferAck { bytes } => Some(*bytes),
                _ => None,
            })
            .collect()
    }
}

impl MessageProducer for RecordingProducer {
    fn stream_req(
        &mut self,
        vbid: u16,
        _flags: u32,
        opaque: Opaque,
        start_seqno: u64,
        _end_seqno: u64,
        _vb_uuid: u64,
        _snap_start: u64,
        _snap_end: u64,
    ) -> memstone::Result<()> {
        self.messages.push(Out::StreamReq {
            vbid,
            opaque,
            start_seqno,
        });
        Ok(())
    }

    fn add_stream_rsp(
        &mut self,
        _remote_opaque: Opaque,
        _local_opaque: Opaque,
        success: bool,
    ) -> memstone::Result<()> {
        self.messages.push(Out::AddStreamRsp { success });
        Ok(())
    }

    fn close_stream(&mut self, _opaque: Opaque, vbid: u16) -> memstone::Result<()> {
        self.messages.push(Out::CloseStream { vbid });
        Ok(())
    }

    fn buffer_ack(&mut self, _opaque: Opaque, bytes: u32) -> memstone::Result<()> {
        self.messages.push(Out::BufferAck { bytes });
        Ok(())
    }

    fn control(&mut self, key: &str, value: &str) -> memstone::Result<()> {
        self.messages.push(Out::Control {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn noop(&mut self, _opaque: Opaque) -> memstone::Result<()> {
        self.messages.push(Out::Noop);
        Ok(())
    }
}

fn setup(cfg: &str) -> (Arc<Engine>, Arc<DcpConsumer>, Arc<TaskPool>) {
    let tasks = TaskPool::new(2);
    let engine = Engine::from_config_str(cfg, Arc::clone(&tasks)).expect("engine config");
    let consumer = DcpConsumer::new(Arc::clone(&engine), "replication:test");
    (engine, consumer, tasks)
}

/// Pump `step` until the consumer reports idle.
fn drain(consumer: &DcpConsumer, producer: &mut RecordingProducer) {
    loop {
        match consumer.step(producer) {
            Ok(()) => continue,
            Err(EngineError::WouldBlock) => break,
            Err(e) => panic!("step failed: {:?}", e),
        }
    }
}

fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn mutation(key: &[u8], value_len: usize, seqno: u64) -> MutationMessage {
    MutationMessage {
        key: key.to_vec().into_boxed_slice(),
        value: vec![0x42u8; value_len].into_boxed_slice(),
        flags: 0,
        expiration: 0,
        datatype: Datatype::RAW,
        cas: seqno,
        by_seqno: seqno,
        rev_seqno: 1,
        lock_time: 0,
    }
}

#[test]
fn control_negotiation_order() {
    let (_engine, consumer, tasks) = setup("ignore_vbucket=true");
    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);
    assert_eq!(
        producer.control_keys(),
        vec![
            "connection_buffer_size",
            "enable_noop",
            "set_noop_interval",
            "set_priority",
            "enable_ext_metadata",
            "enable_value_compression",
            "supports_cursor_dropping",
            "send_stream_end_on_client_close_stream",
        ]
    );
    tasks.shutdown();
}

#[test]
fn replication_session_applies_mutations_and_acks() {
    // Small connection buffer so three mutations trip the ack threshold.
    let (engine, consumer, tasks) = setup("ignore_vbucket=true;dcp_conn_buffer_size=1024");
    consumer.add_stream(7, 0, 0).expect("add_stream");

    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);
    let opaques = producer.stream_req_opaques();
    assert_eq!(opaques.len(), 1, "one STREAM_REQ after controls");
    let opaque = opaques[0];

    assert!(consumer.handle_response(&DcpResponse {
        opaque,
        status: ResponseStatus::Success,
    }));

    consumer
        .snapshot_marker(opaque, 0, 100, 102, 0x01)
        .expect("marker");
    for (i, seqno) in (100u64..=102).enumerate() {
        let key = format!("repl-{}", i);
        consumer
            .mutation(opaque, 0, mutation(key.as_bytes(), 200, seqno))
            .expect("mutation");
    }

    // The background processor drains the stream buffer into the store.
    wait_until(|| consumer.stream_buffered_bytes(0) == 0);
    for i in 0..3 {
        let key = format!("repl-{}", i);
        wait_until(|| engine.get(key.as_bytes(), 0, DocStateFilter::Alive).is_ok());
    }

    // Liveness advanced with the inbound traffic.
    assert_eq!(consumer.seconds_since_last_message(), 0);

    // More than bufferSize/4 released: exactly one ack carrying every
    // released byte.
    drain(&consumer, &mut producer);
    let acks = producer.buffer_acks();
    assert_eq!(acks.len(), 1, "one BUFFER_ACK expected, got {:?}", acks);
    let marker_bytes: u32 = 24;
    let mutation_bytes: u32 = 3 * (24 + 6 + 200);
    assert_eq!(acks[0], marker_bytes + mutation_bytes);
    assert!(acks[0] > 1024 / 4);

    engine.destroy(true);
    tasks.shutdown();
}

#[test]
fn ordering_violation_kills_the_stream() {
    let (_engine, consumer, tasks) = setup("ignore_vbucket=true");
    consumer.add_stream(7, 0, 0).expect("add_stream");
    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);
    let opaque = producer.stream_req_opaques()[0];
    consumer.handle_response(&DcpResponse {
        opaque,
        status: ResponseStatus::Success,
    });

    consumer
        .snapshot_marker(opaque, 0, 100, 102, 0x01)
        .expect("marker");
    let err = consumer
        .mutation(opaque, 0, mutation(b"early", 10, 99))
        .unwrap_err();
    assert_eq!(err, EngineError::Disconnect);
    assert!(!consumer.is_stream_present(0), "stream torn down");
    tasks.shutdown();
}

#[test]
fn data_before_marker_kills_the_stream() {
    let (_engine, consumer, tasks) = setup("ignore_vbucket=true");
    consumer.add_stream(7, 0, 0).expect("add_stream");
    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);
    let opaque = producer.stream_req_opaques()[0];
    consumer.handle_response(&DcpResponse {
        opaque,
        status: ResponseStatus::Success,
    });

    let err = consumer
        .mutation(opaque, 0, mutation(b"early", 10, 1))
        .unwrap_err();
    assert_eq!(err, EngineError::Disconnect);
    tasks.shutdown();
}

#[test]
fn duplicate_stream_refused() {
    let (_engine, consumer, tasks) = setup("ignore_vbucket=true");
    consumer.add_stream(7, 3, 0).expect("first");
    assert_eq!(
        consumer.add_stream(8, 3, 0).unwrap_err(),
        EngineError::KeyExists
    );
    tasks.shutdown();
}

#[test]
fn unknown_opaque_is_no_such_key() {
    let (_engine, consumer, tasks) = setup("ignore_vbucket=true");
    consumer.add_stream(7, 0, 0).expect("add_stream");
    assert_eq!(
        consumer
            .mutation(999, 0, mutation(b"k", 1, 1))
            .unwrap_err(),
        EngineError::NoSuchKey
    );
    tasks.shutdown();
}

#[test]
fn deletions_apply_in_stream_order() {
    let (engine, consumer, tasks) = setup("ignore_vbucket=true");
    // Seed a document the stream will delete.
    let mut item = engine
        .allocate(b"doomed", 1, 0, 0, Datatype::RAW, 0)
        .expect("alloc");
    item.value_mut().copy_from_slice(b"v");
    engine
        .store(item, CasToken::Any, StoreOp::Add, DocState::Alive)
        .expect("seed");

    consumer.add_stream(7, 0, 0).expect("add_stream");
    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);
    let opaque = producer.stream_req_opaques()[0];
    consumer.handle_response(&DcpResponse {
        opaque,
        status: ResponseStatus::Success,
    });

    consumer.snapshot_marker(opaque, 0, 1, 2, 0x01).expect("marker");
    consumer
        .mutation(opaque, 0, mutation(b"kept", 8, 1))
        .expect("mutation");
    consumer
        .deletion(
            opaque,
            0,
            DeletionMessage {
                key: b"doomed".to_vec().into_boxed_slice(),
                cas: 0,
                datatype: Datatype::RAW,
                by_seqno: 2,
                rev_seqno: 1,
            },
        )
        .expect("deletion");

    wait_until(|| consumer.stream_buffered_bytes(0) == 0);
    wait_until(|| engine.get(b"kept", 0, DocStateFilter::Alive).is_ok());
    wait_until(|| {
        matches!(
            engine.get(b"doomed", 0, DocStateFilter::Alive),
            Err(EngineError::NoSuchKey)
        )
    });

    engine.destroy(true);
    tasks.shutdown();
}

#[test]
fn stream_end_removes_the_stream() {
    let (_engine, consumer, tasks) = setup("ignore_vbucket=true");
    consumer.add_stream(7, 0, 0).expect("add_stream");
    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);
    let opaque = producer.stream_req_opaques()[0];
    consumer.handle_response(&DcpResponse {
        opaque,
        status: ResponseStatus::Success,
    });
    consumer
        .stream_end(opaque, 0, StreamEndReason::Ok)
        .expect("stream end");
    wait_until(|| !consumer.is_stream_present(0));
    tasks.shutdown();
}

#[test]
fn host_close_stream_emits_close() {
    let (_engine, consumer, tasks) = setup("ignore_vbucket=true");
    consumer.add_stream(7, 5, 0).expect("add_stream");
    consumer.close_stream(5).expect("close");
    assert!(!consumer.is_stream_present(5));
    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);
    assert!(producer
        .messages
        .iter()
        .any(|m| matches!(m, Out::CloseStream { vbid: 5 })));
    assert_eq!(
        consumer.close_stream(5).unwrap_err(),
        EngineError::NoSuchKey
    );
    tasks.shutdown();
}

#[test]
fn vbucket_state_change_closes_stream() {
    let (engine, consumer, tasks) = setup("");
    engine
        .set_vbucket_state(9, VBucketState::Replica)
        .expect("to replica");
    consumer.add_stream(7, 9, 0).expect("add_stream");
    // Replica -> replica transitions keep the stream.
    engine
        .set_vbucket_state(9, VBucketState::Replica)
        .expect("still replica");
    assert!(consumer.is_stream_present(9));
    // Away from replica: the consumer closes its stream.
    engine
        .set_vbucket_state(9, VBucketState::Active)
        .expect("to active");
    assert!(!consumer.is_stream_present(9));
    engine.destroy(true);
    tasks.shutdown();
}

#[test]
fn rollback_to_zero_resets_and_restreams() {
    let (engine, consumer, tasks) = setup("ignore_vbucket=true");
    // Pre-existing data that must vanish with the rollback.
    let mut item = engine
        .allocate(b"stale", 1, 0, 0, Datatype::RAW, 0)
        .expect("alloc");
    item.value_mut().copy_from_slice(b"v");
    engine
        .store(item, CasToken::Any, StoreOp::Add, DocState::Alive)
        .expect("seed");
    engine.clock().advance(1);

    consumer.add_stream(7, 0, 0).expect("add_stream");
    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);
    let opaque = producer.stream_req_opaques()[0];

    consumer.handle_response(&DcpResponse {
        opaque,
        status: ResponseStatus::Rollback(0),
    });

    // The rollback task empties the bucket and queues a fresh STREAM_REQ.
    wait_until(|| {
        drain(&consumer, &mut producer);
        producer.stream_req_opaques().len() == 2
    });
    assert_eq!(
        engine.get(b"stale", 0, DocStateFilter::Alive).unwrap_err(),
        EngineError::NoSuchKey,
        "bucket reset by rollback"
    );
    assert!(consumer.is_stream_present(0), "stream re-requested");

    engine.destroy(true);
    tasks.shutdown();
}

#[test]
fn idle_peer_is_disconnected() {
    let (engine, consumer, tasks) = setup("ignore_vbucket=true;dcp_idle_timeout=5");
    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);

    // Exactly at the timeout: still alive, a NOOP keepalive goes out.
    engine.clock().advance(5);
    match consumer.step(&mut producer) {
        Ok(()) => {}
        Err(e) => panic!("expected keepalive, got {:?}", e),
    }
    assert!(matches!(producer.messages.last(), Some(Out::Noop)));

    // Strictly past the timeout: terminal disconnect.
    engine.clock().advance(1);
    assert_eq!(consumer.step(&mut producer).unwrap_err(), EngineError::Disconnect);
    assert!(consumer.is_dead());
    // And it stays dead.
    assert_eq!(consumer.step(&mut producer).unwrap_err(), EngineError::Disconnect);
    tasks.shutdown();
}

#[test]
fn noop_resets_liveness() {
    let (engine, consumer, tasks) = setup("ignore_vbucket=true;dcp_idle_timeout=5");
    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);

    engine.clock().advance(4);
    consumer.noop(1).expect("peer noop");
    engine.clock().advance(4);
    // 4s since the peer noop: not idle yet.
    match consumer.step(&mut producer) {
        Ok(()) | Err(EngineError::WouldBlock) => {}
        Err(e) => panic!("unexpected {:?}", e),
    }
    assert!(!consumer.is_dead());
    tasks.shutdown();
}

#[test]
fn two_streams_both_make_progress() {
    // Tiny batches force interleaved processing across the ready queue.
    let (engine, consumer, tasks) = setup(
        "ignore_vbucket=true;dcp_consumer_process_buffered_messages_batch_size=1;\
         dcp_consumer_process_buffered_messages_yield_limit=1",
    );
    for vbid in [0u16, 1] {
        consumer.add_stream(u32::from(vbid) + 70, vbid, 0).expect("add_stream");
    }
    let mut producer = RecordingProducer::default();
    drain(&consumer, &mut producer);
    let opaques = producer.stream_req_opaques();
    assert_eq!(opaques.len(), 2);

    for (idx, vbid) in [0u16, 1].iter().enumerate() {
        let opaque = opaques[idx];
        consumer.handle_response(&DcpResponse {
            opaque,
            status: ResponseStatus::Success,
        });
        consumer
            .snapshot_marker(opaque, *vbid, 1, 8, 0x01)
            .expect("marker");
        for seqno in 1u64..=8 {
            let key = format!("vb{}-{}", vbid, seqno);
            consumer
                .mutation(opaque, *vbid, mutation(key.as_bytes(), 16, seqno))
                .expect("mutation");
        }
    }

    wait_until(|| {
        consumer.stream_buffered_bytes(0) == 0 && consumer.stream_buffered_bytes(1) == 0
    });
    for vbid in [0u16, 1] {
        for seqno in 1u64..=8 {
            let key = format!("vb{}-{}", vbid, seqno);
            wait_until(|| engine.get(key.as_bytes(), 0, DocStateFilter::Alive).is_ok());
        }
    }
    engine.destroy(true);
    tasks.shutdown();
}

#[test]
fn consumer_stats_emit() {
    let (_engine, consumer, tasks) = setup("ignore_vbucket=true");
    consumer.add_stream(7, 0, 0).expect("add_stream");
    let mut names = Vec::new();
    consumer.add_stats(&mut |name, _| names.push(name.to_string()));
    assert!(names.contains(&"streams".to_string()));
    assert!(names.contains(&"backoffs".to_string()));
    assert!(names.contains(&"flow_control_buffer_size".to_string()));
    tasks.shutdown();
}
