use tokio::sync::{mpsc, oneshot};

use crate::dispatch::{ClientEvent, Dispatcher};
use crate::error::{ClientError, ERR_UNEXPECTED_COMMAND};
use crate::resp::RespValue;

const HELLO_REPLY: &[u8] =
    b"%3\r\n$6\r\nserver\r\n$5\r\nredis\r\n$7\r\nversion\r\n$5\r\n7.4.0\r\n$5\r\nproto\r\n:3\r\n";

fn new_dispatcher() -> (Dispatcher, mpsc::UnboundedReceiver<ClientEvent>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    (Dispatcher::new(events_tx), events_rx)
}

fn submit(
    dispatcher: &mut Dispatcher,
    command: &str,
    parameters: &[&str],
) -> (
    Option<Vec<u8>>,
    oneshot::Receiver<Result<RespValue, ClientError>>,
) {
    let (reply, receiver) = oneshot::channel();
    let bytes = dispatcher.submit(
        command.to_string(),
        parameters.iter().map(|s| s.to_string()).collect(),
        reply,
    );
    (bytes, receiver)
}

#[test]
fn test_handshake_resolves_and_emits_ready() {
    let (mut dispatcher, mut events) = new_dispatcher();

    let hello = dispatcher.start_handshake();
    assert_eq!(hello, b"*2\r\n$5\r\nHELLO\r\n$1\r\n3\r\n".to_vec());
    assert_eq!(dispatcher.pending_len(), 1);
    assert!(!dispatcher.ready());

    dispatcher.ingest(HELLO_REPLY).expect("handshake reply should dispatch");

    assert!(dispatcher.ready());
    assert_eq!(dispatcher.pending_len(), 0);
    match events.try_recv().expect("ready event expected") {
        ClientEvent::Ready(map) => {
            assert_eq!(map.map_get("proto").and_then(RespValue::as_integer), Some(3));
        }
        other => panic!("expected ready event, got {:?}", other),
    }
}

#[test]
fn test_handshake_error_reply_is_fatal() {
    let (mut dispatcher, _events) = new_dispatcher();
    dispatcher.start_handshake();

    // A RESP2-only server rejects HELLO; nobody awaits the handshake
    // entry, so the failure must surface as a connection fault instead
    // of disappearing into its discarded reply slot.
    match dispatcher.ingest(b"-NOPROTO unsupported protocol version\r\n") {
        Err(ClientError::Protocol(message)) => {
            assert!(message.contains("NOPROTO"), "got: {}", message);
        }
        other => panic!("expected fatal handshake rejection, got {:?}", other),
    }
    assert!(!dispatcher.ready());
    assert_eq!(dispatcher.pending_len(), 0);
}

#[test]
fn test_pipelined_replies_resolve_in_write_order() {
    let (mut dispatcher, _events) = new_dispatcher();

    let (bytes_a, mut reply_a) = submit(&mut dispatcher, "GET", &["a"]);
    let (bytes_b, mut reply_b) = submit(&mut dispatcher, "GET", &["b"]);
    let (bytes_c, mut reply_c) = submit(&mut dispatcher, "GET", &["c"]);
    assert!(bytes_a.is_some() && bytes_b.is_some() && bytes_c.is_some());
    assert_eq!(dispatcher.pending_len(), 3);

    // All three replies arrive in one read.
    dispatcher
        .ingest(b"+one\r\n+two\r\n+three\r\n")
        .expect("replies should dispatch");

    assert_eq!(dispatcher.pending_len(), 0);
    assert_eq!(
        reply_a.try_recv().unwrap().unwrap(),
        RespValue::Text("one".to_string())
    );
    assert_eq!(
        reply_b.try_recv().unwrap().unwrap(),
        RespValue::Text("two".to_string())
    );
    assert_eq!(
        reply_c.try_recv().unwrap().unwrap(),
        RespValue::Text("three".to_string())
    );
}

#[test]
fn test_push_interleaved_with_pipelined_replies() {
    let (mut dispatcher, mut events) = new_dispatcher();

    let (_, mut reply_a) = submit(&mut dispatcher, "GET", &["a"]);
    let (_, mut reply_b) = submit(&mut dispatcher, "GET", &["b"]);

    // An invalidation push lands between the two replies; it must not
    // consume either pending command.
    dispatcher
        .ingest(b"+one\r\n>2\r\n$10\r\ninvalidate\r\n*1\r\n$3\r\nfoo\r\n+two\r\n")
        .expect("interleaved stream should dispatch");

    assert_eq!(
        events.try_recv().expect("invalidation event expected"),
        ClientEvent::Invalidate(vec!["foo".to_string()])
    );
    assert_eq!(
        reply_a.try_recv().unwrap().unwrap(),
        RespValue::Text("one".to_string())
    );
    assert_eq!(
        reply_b.try_recv().unwrap().unwrap(),
        RespValue::Text("two".to_string())
    );
    assert_eq!(dispatcher.pending_len(), 0);
}

#[test]
fn test_error_reply_rejects_the_command() {
    let (mut dispatcher, _events) = new_dispatcher();
    let (_, mut reply) = submit(&mut dispatcher, "INCR", &["k"]);

    dispatcher
        .ingest(b"-ERR value is not an integer\r\n")
        .expect("error reply should dispatch");

    match reply.try_recv().unwrap() {
        Err(ClientError::Server(message)) => {
            assert_eq!(message, "ERR value is not an integer");
        }
        other => panic!("expected server error, got {:?}", other),
    }
}

#[test]
fn test_reply_with_empty_queue_is_protocol_fault() {
    let (mut dispatcher, _events) = new_dispatcher();
    match dispatcher.ingest(b"+orphan\r\n") {
        Err(ClientError::Protocol(_)) => {}
        other => panic!("expected protocol fault, got {:?}", other),
    }
}

#[test]
fn test_subscribe_acks_track_state_without_dequeueing() {
    let (mut dispatcher, _events) = new_dispatcher();
    assert!(!dispatcher.subscribed());

    dispatcher
        .ingest(b">3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n")
        .expect("subscribe ack should dispatch");
    assert!(dispatcher.subscribed());
    assert!(dispatcher.subscribed_channels().contains("ch"));
    assert_eq!(dispatcher.pending_len(), 0);

    dispatcher
        .ingest(b">3\r\n$10\r\npsubscribe\r\n$4\r\nch.*\r\n:2\r\n")
        .expect("psubscribe ack should dispatch");
    assert_eq!(dispatcher.subscribed_channels().len(), 2);

    dispatcher
        .ingest(b">3\r\n$11\r\nunsubscribe\r\n$2\r\nch\r\n:1\r\n")
        .expect("unsubscribe ack should dispatch");
    assert!(dispatcher.subscribed(), "count 1 keeps subscribed mode");
    assert!(!dispatcher.subscribed_channels().contains("ch"));

    dispatcher
        .ingest(b">3\r\n$12\r\npunsubscribe\r\n$4\r\nch.*\r\n:0\r\n")
        .expect("punsubscribe ack should dispatch");
    assert!(!dispatcher.subscribed(), "count 0 leaves subscribed mode");
    assert!(dispatcher.subscribed_channels().is_empty());
}

#[test]
fn test_gate_rejects_disallowed_command_while_subscribed() {
    let (mut dispatcher, _events) = new_dispatcher();
    dispatcher
        .ingest(b">3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n")
        .expect("subscribe ack should dispatch");

    let (bytes, mut reply) = submit(&mut dispatcher, "SET", &["k", "v"]);
    assert!(bytes.is_none(), "gated command must not produce bytes");
    assert_eq!(dispatcher.pending_len(), 0, "gated command is never queued");

    match reply.try_recv().unwrap() {
        Err(error @ ClientError::UnexpectedCommand { .. }) => {
            assert_eq!(error.code(), Some(ERR_UNEXPECTED_COMMAND));
        }
        other => panic!("expected gate rejection, got {:?}", other),
    }
}

#[test]
fn test_gate_allow_list_is_case_insensitive() {
    let (mut dispatcher, _events) = new_dispatcher();
    dispatcher
        .ingest(b">3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n")
        .expect("subscribe ack should dispatch");

    for command in ["PING", "ping", "Subscribe", "UNSUBSCRIBE", "reset", "QUIT"] {
        let (bytes, _reply) = submit(&mut dispatcher, command, &[]);
        assert!(bytes.is_some(), "{} should pass the gate", command);
    }
    let (bytes, _reply) = submit(&mut dispatcher, "get", &["k"]);
    assert!(bytes.is_none());
}

#[test]
fn test_message_and_pmessage_events() {
    let (mut dispatcher, mut events) = new_dispatcher();

    dispatcher
        .ingest(b">3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nhello\r\n")
        .expect("message push should dispatch");
    assert_eq!(
        events.try_recv().unwrap(),
        ClientEvent::Message {
            channel: "ch".to_string(),
            payload: RespValue::Text("hello".to_string()),
        }
    );

    dispatcher
        .ingest(b">4\r\n$8\r\npmessage\r\n$4\r\nch.*\r\n$4\r\nch.1\r\n$2\r\nhi\r\n")
        .expect("pmessage push should dispatch");
    assert_eq!(
        events.try_recv().unwrap(),
        ClientEvent::PatternMessage {
            pattern: "ch.*".to_string(),
            channel: "ch.1".to_string(),
            payload: RespValue::Text("hi".to_string()),
        }
    );
}

#[test]
fn test_invalidate_null_payload_is_empty_key_list() {
    let (mut dispatcher, mut events) = new_dispatcher();
    dispatcher
        .ingest(b">2\r\n$10\r\ninvalidate\r\n_\r\n")
        .expect("invalidate push should dispatch");
    assert_eq!(events.try_recv().unwrap(), ClientEvent::Invalidate(Vec::new()));
}

#[test]
fn test_partial_frames_across_ingest_calls() {
    let (mut dispatcher, _events) = new_dispatcher();
    let (_, mut reply) = submit(&mut dispatcher, "GET", &["a"]);

    dispatcher.ingest(b"$5\r\nhel").expect("partial frame is fine");
    assert_eq!(dispatcher.pending_len(), 1);
    dispatcher.ingest(b"lo\r\n").expect("completion should dispatch");

    assert_eq!(
        reply.try_recv().unwrap().unwrap(),
        RespValue::Text("hello".to_string())
    );
}

#[test]
fn test_fail_all_rejects_every_pending_command() {
    let (mut dispatcher, _events) = new_dispatcher();
    let (_, mut reply_a) = submit(&mut dispatcher, "GET", &["a"]);
    let (_, mut reply_b) = submit(&mut dispatcher, "GET", &["b"]);

    dispatcher.fail_all();

    assert_eq!(dispatcher.pending_len(), 0);
    assert!(matches!(
        reply_a.try_recv().unwrap(),
        Err(ClientError::ConnectionClosed)
    ));
    assert!(matches!(
        reply_b.try_recv().unwrap(),
        Err(ClientError::ConnectionClosed)
    ));
}
