use bytes::Bytes;
use ofbench_core::{
    ControlChannel, ControlConfig, ControlError, ExecutionContext, LoopError, LoopExit,
    MessageKind, UnknownKindPolicy, WireError,
};
use ofbench_testkit::{concat, message, raw_message, run_stream, RecordingModule, Slot};
use tokio::io::AsyncWriteExt;

fn sample_stream() -> Bytes {
    concat(&[
        message(MessageKind::Hello, 1, b""),
        message(MessageKind::PacketIn, 2, &[0x11; 40]),
        message(MessageKind::PortStatus, 3, &[0x22; 56]),
        message(MessageKind::Error, 4, b"oops"),
        message(MessageKind::StatsReply, 5, &[0x33; 300]),
        message(MessageKind::FlowRemoved, 6, &[0x44; 80]),
        message(MessageKind::BarrierReply, 7, b""),
        message(MessageKind::EchoRequest, 8, b"ping"),
    ])
}

fn expected_messages() -> Vec<(Slot, u32)> {
    vec![
        (Slot::PacketIn, 2),
        (Slot::PortStatus, 3),
        (Slot::Error, 4),
        (Slot::StatsReply, 5),
        (Slot::FlowRemoved, 6),
        (Slot::Other, 7),
        (Slot::EchoRequest, 8),
    ]
}

#[tokio::test]
async fn chunking_does_not_change_the_dispatched_sequence() {
    let whole = run_stream(sample_stream(), 64 * 1024, ControlConfig::default()).await;
    assert_eq!(whole.exit.unwrap(), LoopExit::ControlClosed);
    assert_eq!(whole.recorder.messages(), expected_messages());

    for chunk in [1, 3, 7, 13] {
        let run = run_stream(sample_stream(), chunk, ControlConfig::default()).await;
        assert_eq!(run.exit.unwrap(), LoopExit::ControlClosed, "chunk size {chunk}");
        assert_eq!(run.recorder.messages(), expected_messages(), "chunk size {chunk}");
    }
}

#[tokio::test]
async fn small_initial_buffer_grows_and_keeps_invariants() {
    let config = ControlConfig {
        initial_capacity: 16,
        ..ControlConfig::default()
    };
    let (mut control, mut peer) = ControlChannel::pair(config);
    let (mut module, recorder) = RecordingModule::new("recording");
    let mut ctx = ExecutionContext::default();

    let stream = sample_stream();
    let expected = expected_messages().len();
    tokio::spawn(async move {
        peer.write_all(&stream).await.unwrap();
        // keep the connection open until the test is done reading
        std::future::pending::<()>().await;
    });

    let mut capacity = control.buffer().capacity();
    while recorder.messages().len() < expected {
        control.read_and_dispatch(&mut module, &mut ctx).await.unwrap();
        let buffer = control.buffer();
        assert!(buffer.start() <= buffer.end());
        assert!(buffer.end() <= buffer.capacity());
        assert!(buffer.capacity() >= capacity);
        capacity = buffer.capacity();
    }

    assert!(capacity > 16);
    assert_eq!(recorder.messages(), expected_messages());
}

#[tokio::test]
async fn half_a_header_waits_for_the_rest() {
    let (mut control, mut peer) = ControlChannel::pair(ControlConfig::default());
    let (mut module, recorder) = RecordingModule::new("recording");
    let mut ctx = ExecutionContext::default();
    let msg = message(MessageKind::PortStatus, 9, b"");
    assert_eq!(msg.len(), 8);

    peer.write_all(&msg[..4]).await.unwrap();
    let dispatched = control.read_and_dispatch(&mut module, &mut ctx).await.unwrap();
    assert_eq!(dispatched, 0);
    assert_eq!(control.buffer().len(), 4);
    assert!(recorder.is_empty());

    peer.write_all(&msg[4..]).await.unwrap();
    let dispatched = control.read_and_dispatch(&mut module, &mut ctx).await.unwrap();
    assert_eq!(dispatched, 1);
    assert_eq!(recorder.messages(), vec![(Slot::PortStatus, 9)]);
    assert!(control.buffer().is_empty());
}

#[tokio::test]
async fn back_to_back_messages_in_one_read() {
    let (mut control, mut peer) = ControlChannel::pair(ControlConfig::default());
    let (mut module, recorder) = RecordingModule::new("recording");
    let mut ctx = ExecutionContext::default();

    let first = message(MessageKind::PacketIn, 1, &[0; 4]);
    let second = message(MessageKind::FlowRemoved, 2, &[0; 8]);
    assert_eq!((first.len(), second.len()), (12, 16));
    peer.write_all(&concat(&[first, second])).await.unwrap();

    let dispatched = control.read_and_dispatch(&mut module, &mut ctx).await.unwrap();
    assert_eq!(dispatched, 2);
    assert_eq!(
        recorder.messages(),
        vec![(Slot::PacketIn, 1), (Slot::FlowRemoved, 2)]
    );
    assert!(control.buffer().is_empty());
    assert_eq!((control.buffer().start(), control.buffer().end()), (0, 0));
}

#[tokio::test]
async fn version_mismatch_drops_only_that_message() {
    let stream = concat(&[
        raw_message(0x04, MessageKind::PacketIn.as_u8(), 1, b"foreign"),
        message(MessageKind::PacketIn, 2, b"native"),
    ]);
    let run = run_stream(stream, 5, ControlConfig::default()).await;

    assert_eq!(run.exit.unwrap(), LoopExit::ControlClosed);
    assert_eq!(run.recorder.messages(), vec![(Slot::PacketIn, 2)]);
}

#[tokio::test]
async fn unknown_kind_aborts_by_default() {
    let stream = concat(&[
        message(MessageKind::PacketIn, 1, b""),
        raw_message(0x01, 200, 5, b"junk"),
        message(MessageKind::PacketIn, 2, b""),
    ]);
    let run = run_stream(stream, 64, ControlConfig::default()).await;

    assert!(matches!(
        run.exit,
        Err(LoopError::Control(ControlError::UnknownKind { kind: 200, xid: 5 }))
    ));
    assert_eq!(run.recorder.messages(), vec![(Slot::PacketIn, 1)]);
}

#[tokio::test]
async fn unknown_kind_can_be_skipped() {
    let stream = concat(&[
        message(MessageKind::PacketIn, 1, b""),
        raw_message(0x01, 200, 5, b"junk"),
        message(MessageKind::PacketIn, 2, b""),
    ]);
    let config = ControlConfig {
        unknown_kind: UnknownKindPolicy::Drop,
        ..ControlConfig::default()
    };
    let run = run_stream(stream, 64, config).await;

    assert_eq!(run.exit.unwrap(), LoopExit::ControlClosed);
    assert_eq!(
        run.recorder.messages(),
        vec![(Slot::PacketIn, 1), (Slot::PacketIn, 2)]
    );
}

#[tokio::test]
async fn length_below_header_is_fatal() {
    let mut bad = message(MessageKind::PacketIn, 1, b"").to_vec();
    bad[2..4].copy_from_slice(&4u16.to_be_bytes());
    let run = run_stream(Bytes::from(bad), 64, ControlConfig::default()).await;

    assert!(matches!(
        run.exit,
        Err(LoopError::Control(ControlError::Framing(
            WireError::LengthTooShort { length: 4 }
        )))
    ));
    assert!(run.recorder.is_empty());
}

#[tokio::test]
async fn echo_requests_are_answered() {
    let stream = concat(&[
        message(MessageKind::EchoRequest, 77, b"are you there"),
        message(MessageKind::Hello, 78, b""),
    ]);
    let run = run_stream(stream, 4, ControlConfig::default()).await;

    assert_eq!(run.exit.unwrap(), LoopExit::ControlClosed);
    let replies = ofbench_testkit::decode_all(&run.replies).unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind(), Some(MessageKind::EchoReply));
    assert_eq!(replies[0].xid(), 77);
    assert_eq!(replies[0].payload(), b"are you there");
}
