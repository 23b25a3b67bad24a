use std::time::Duration;

use scry_jdwp::wire::codec::{encode_command, encode_reply, JdwpReader, JdwpWriter, HANDSHAKE};
use scry_jdwp::wire::{
    EventModifier, JdwpClient, JdwpEvent, JdwpIdSizes, JdwpValue, Location, EVENT_KIND_BREAKPOINT,
    EVENT_KIND_SINGLE_STEP, HEADER_LEN, SUSPEND_POLICY_EVENT_THREAD, TAG_OBJECT, TYPE_TAG_CLASS,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

struct Command {
    id: u32,
    command_set: u8,
    command: u8,
    payload: Vec<u8>,
}

async fn read_command(stream: &mut TcpStream) -> Command {
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.unwrap();
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let mut payload = vec![0u8; length - HEADER_LEN];
    stream.read_exact(&mut payload).await.unwrap();
    Command {
        id,
        command_set: header[9],
        command: header[10],
        payload,
    }
}

/// Accepts one debugger, completes the handshake and answers `IDSizes`.
async fn accept_debugger(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut handshake = [0u8; 14];
    stream.read_exact(&mut handshake).await.unwrap();
    assert_eq!(&handshake, HANDSHAKE);
    stream.write_all(HANDSHAKE).await.unwrap();

    let idsizes = read_command(&mut stream).await;
    assert_eq!((idsizes.command_set, idsizes.command), (1, 7));
    let mut w = JdwpWriter::new();
    for _ in 0..5 {
        w.write_u32(8);
    }
    stream
        .write_all(&encode_reply(idsizes.id, 0, &w.into_vec()))
        .await
        .unwrap();
    stream
}

fn location(index: u64) -> Location {
    Location {
        type_tag: TYPE_TAG_CLASS,
        class_id: 0x10,
        method_id: 0x20,
        index,
    }
}

#[tokio::test]
async fn composite_packet_arrives_as_one_event_set() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let mut stream = accept_debugger(&listener).await;
        let sizes = JdwpIdSizes::default();
        let mut w = JdwpWriter::new();
        w.write_u8(SUSPEND_POLICY_EVENT_THREAD);
        w.write_u32(2);
        w.write_u8(EVENT_KIND_BREAKPOINT);
        w.write_i32(3);
        w.write_object_id(1, &sizes);
        w.write_location(&location(15), &sizes);
        w.write_u8(EVENT_KIND_SINGLE_STEP);
        w.write_i32(4);
        w.write_object_id(1, &sizes);
        w.write_location(&location(15), &sizes);
        stream
            .write_all(&encode_command(100, 64, 100, &w.into_vec()))
            .await
            .unwrap();
        stream
    });

    let client = JdwpClient::connect(addr).await.unwrap();
    let set = client.next_event_set().await.unwrap();
    assert_eq!(set.suspend_policy, SUSPEND_POLICY_EVENT_THREAD);
    assert_eq!(
        set.events,
        vec![
            JdwpEvent::Breakpoint {
                request_id: 3,
                thread: 1,
                location: location(15),
            },
            JdwpEvent::SingleStep {
                request_id: 4,
                thread: 1,
                location: location(15),
            },
        ]
    );
    drop(peer.await.unwrap());
}

#[tokio::test]
async fn event_request_set_encodes_modifiers_and_returns_request_id() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let mut stream = accept_debugger(&listener).await;
        let cmd = read_command(&mut stream).await;
        assert_eq!((cmd.command_set, cmd.command), (15, 1));

        let sizes = JdwpIdSizes::default();
        let mut r = JdwpReader::new(&cmd.payload);
        assert_eq!(r.read_u8().unwrap(), EVENT_KIND_BREAKPOINT);
        assert_eq!(r.read_u8().unwrap(), SUSPEND_POLICY_EVENT_THREAD);
        assert_eq!(r.read_u32().unwrap(), 1);
        assert_eq!(r.read_u8().unwrap(), 7);
        assert_eq!(r.read_location(&sizes).unwrap(), location(24));
        assert_eq!(r.remaining(), 0);

        let mut w = JdwpWriter::new();
        w.write_i32(42);
        stream
            .write_all(&encode_reply(cmd.id, 0, &w.into_vec()))
            .await
            .unwrap();
        stream
    });

    let client = JdwpClient::connect(addr).await.unwrap();
    let request_id = client
        .event_request_set(
            EVENT_KIND_BREAKPOINT,
            SUSPEND_POLICY_EVENT_THREAD,
            &[EventModifier::LocationOnly {
                location: location(24),
            }],
        )
        .await
        .unwrap();
    assert_eq!(request_id, 42);
    drop(peer.await.unwrap());
}

#[tokio::test]
async fn vm_error_reply_surfaces_error_code() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let mut stream = accept_debugger(&listener).await;
        let cmd = read_command(&mut stream).await;
        assert_eq!((cmd.command_set, cmd.command), (16, 1));
        stream
            .write_all(&encode_reply(cmd.id, 35, &[]))
            .await
            .unwrap();
        stream
    });

    let client = JdwpClient::connect(addr).await.unwrap();
    let err = client
        .stack_frame_get_values(1, 1, &[(0, "I".to_string())])
        .await
        .unwrap_err();
    assert_eq!(err.vm_error_code(), Some(35));
    drop(peer.await.unwrap());
}

#[tokio::test]
async fn array_region_reads_tagged_object_elements() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let mut stream = accept_debugger(&listener).await;
        let cmd = read_command(&mut stream).await;
        assert_eq!((cmd.command_set, cmd.command), (13, 2));

        let sizes = JdwpIdSizes::default();
        let mut w = JdwpWriter::new();
        w.write_u8(TAG_OBJECT);
        w.write_u32(2);
        w.write_tagged_value(
            &JdwpValue::Object {
                tag: b's',
                id: 0x44,
            },
            &sizes,
        );
        w.write_tagged_value(&JdwpValue::null(), &sizes);
        stream
            .write_all(&encode_reply(cmd.id, 0, &w.into_vec()))
            .await
            .unwrap();
        stream
    });

    let client = JdwpClient::connect(addr).await.unwrap();
    let values = client.array_reference_get_values(0x99, 0, 2).await.unwrap();
    assert_eq!(
        values,
        vec![
            JdwpValue::Object {
                tag: b's',
                id: 0x44
            },
            JdwpValue::null()
        ]
    );
    drop(peer.await.unwrap());
}

#[tokio::test]
async fn closed_socket_ends_event_stream_and_cancels_token() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = tokio::spawn(async move {
        let stream = accept_debugger(&listener).await;
        drop(stream);
    });

    let client = JdwpClient::connect(addr).await.unwrap();
    peer.await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(5), client.next_event_set())
        .await
        .unwrap();
    assert!(next.is_none());
    tokio::time::timeout(Duration::from_secs(5), client.shutdown_token().cancelled())
        .await
        .unwrap();
    assert!(client.vm_resume().await.unwrap_err().is_disconnect());
}
