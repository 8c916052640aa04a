//! End-to-end `ClientPut` conversations against a scripted node.

use std::time::Duration;

use fcp::{Client, ClientConfig, Error, Message};
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

/// Node side of an in-memory connection.
struct Node {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Node {
    async fn recv(&mut self) -> Message {
        timeout(Duration::from_secs(5), fcp_proto::read_message(&mut self.reader))
            .await
            .expect("timed out waiting for client")
            .unwrap()
            .expect("client closed the connection")
    }

    /// Asserts the client sends nothing for a short while.
    async fn expect_silence(&mut self) {
        let next = timeout(
            Duration::from_millis(200),
            fcp_proto::read_message(&mut self.reader),
        )
        .await;
        assert!(next.is_err(), "unexpected message: {next:?}");
    }

    async fn send(&mut self, msg: Message) {
        fcp_proto::write_message(&mut self.writer, &msg).await.unwrap();
    }

    async fn put_successful(&mut self, identifier: &str, uri: &str) {
        self.send(
            Message::new("PutSuccessful")
                .with_field("Identifier", identifier)
                .with_field("URI", uri),
        )
        .await;
    }

    async fn protocol_error(&mut self, identifier: &str, code: u32) {
        self.send(
            Message::new("ProtocolError")
                .with_field("Identifier", identifier)
                .with_field("Code", code.to_string())
                .with_field("Fatal", "false"),
        )
        .await;
    }
}

fn config(max_in_flight: usize) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.name = "test-client".into();
    config.max_in_flight = max_in_flight;
    config
}

/// Connects a client to a scripted node, answering the hello exchange.
async fn connect() -> (Client, Node) {
    connect_with(config(16)).await
}

async fn connect_with(config: ClientConfig) -> (Client, Node) {
    let (client_side, node_side) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(node_side);
    let mut node = Node {
        reader: BufReader::new(reader),
        writer,
    };

    let handshake = async {
        let hello = node.recv().await;
        assert_eq!(hello.name(), "ClientHello");
        assert_eq!(hello.field("Name"), Some("test-client"));
        assert_eq!(hello.field("ExpectedVersion"), Some("2.0"));
        node.send(Message::new("NodeHello").with_field("Version", "Fred,0.7"))
            .await;
    };
    let (client, ()) = tokio::join!(Client::over(client_side, &config), handshake);
    (client.unwrap(), node)
}

async fn wait_idle(client: &Client) {
    for _ in 0..100 {
        if client.engine().in_flight() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("sequences still registered: {}", client.engine().in_flight());
}

#[tokio::test]
async fn direct_upload_resolves_to_key() {
    let (client, mut node) = connect().await;

    let pending = client
        .put()
        .from_bytes(b"hello".to_vec())
        .named("greeting.txt")
        .launch("CHK@")
        .unwrap();

    let put = node.recv().await;
    assert_eq!(put.name(), "ClientPut");
    assert_eq!(put.field("URI"), Some("CHK@"));
    assert_eq!(put.field("UploadFrom"), Some("direct"));
    assert_eq!(put.field("DataLength"), Some("5"));
    assert_eq!(put.field("TargetFilename"), Some("greeting.txt"));
    assert_eq!(put.payload(), Some(&b"hello"[..]));

    let id = put.field("Identifier").unwrap().to_owned();
    node.put_successful(&id, "CHK@abc/greeting.txt").await;

    let key = pending.await.unwrap().unwrap();
    assert_eq!(key.as_str(), "CHK@abc/greeting.txt");
    wait_idle(&client).await;
}

#[tokio::test]
async fn redirect_upload_names_target() {
    let (client, mut node) = connect().await;

    let pending = client.put().redirect_to("KSK@target").launch("KSK@alias").unwrap();

    let put = node.recv().await;
    assert_eq!(put.field("UploadFrom"), Some("redirect"));
    assert_eq!(put.field("TargetURI"), Some("KSK@target"));
    assert!(put.payload().is_none());

    let id = put.field("Identifier").unwrap().to_owned();
    node.send(
        Message::new("PutFailed")
            .with_field("Identifier", id.as_str())
            .with_field("Code", "9"),
    )
    .await;

    assert!(pending.await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_protocol_error_resolves_empty() {
    let (client, mut node) = connect().await;

    let pending = client.put().from_bytes(b"x".to_vec()).launch("CHK@").unwrap();
    let put = node.recv().await;
    node.protocol_error(put.field("Identifier").unwrap(), 7).await;

    assert!(pending.await.unwrap().is_none());
    node.expect_silence().await;
}

#[tokio::test]
async fn disk_upload_completes_verification_and_resends() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("site.html");
    std::fs::write(&file, "<html/>").unwrap();
    let directory = dir.path().to_str().unwrap().to_owned();

    let (client, mut node) = connect().await;
    let pending = client.put().from_file(&file).launch("CHK@").unwrap();

    let put = node.recv().await;
    assert_eq!(put.field("UploadFrom"), Some("disk"));
    assert_eq!(put.field("Filename"), file.to_str());
    let id = put.field("Identifier").unwrap().to_owned();

    node.protocol_error(&id, 25).await;

    let request = node.recv().await;
    assert_eq!(request.name(), "TestDDARequest");
    assert_eq!(request.field("Directory"), Some(directory.as_str()));
    assert_eq!(request.field("WantReadDirectory"), Some("true"));
    assert_eq!(request.field("WantWriteDirectory"), Some("true"));

    let probe = dir.path().join("probe.txt");
    std::fs::write(&probe, "secret-token\n").unwrap();
    let written = dir.path().join("written.txt");
    node.send(
        Message::new("TestDDAReply")
            .with_field("Directory", directory.as_str())
            .with_field("ReadFilename", probe.to_str().unwrap())
            .with_field("WriteFilename", written.to_str().unwrap())
            .with_field("ContentToWrite", "write-proof"),
    )
    .await;

    let response = node.recv().await;
    assert_eq!(response.name(), "TestDDAResponse");
    assert_eq!(response.field("Directory"), Some(directory.as_str()));
    assert_eq!(response.field("ReadContent"), Some("secret-token"));
    assert_eq!(std::fs::read_to_string(&written).unwrap(), "write-proof");

    node.send(
        Message::new("TestDDAComplete")
            .with_field("Directory", directory.as_str())
            .with_field("ReadDirectoryAllowed", "true")
            .with_field("WriteDirectoryAllowed", "true"),
    )
    .await;

    let resent = node.recv().await;
    assert_eq!(resent, put);

    node.put_successful(&id, "CHK@site").await;
    assert_eq!(pending.await.unwrap().unwrap().as_str(), "CHK@site");
    node.expect_silence().await;
}

#[tokio::test]
async fn unreadable_probe_sends_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("data.bin");
    let directory = dir.path().to_str().unwrap().to_owned();

    let (client, mut node) = connect().await;
    let pending = client.put().from_file(&file).launch("CHK@").unwrap();
    let id = node.recv().await.field("Identifier").unwrap().to_owned();

    node.protocol_error(&id, 25).await;
    assert_eq!(node.recv().await.name(), "TestDDARequest");

    let missing = dir.path().join("does-not-exist");
    node.send(
        Message::new("TestDDAReply")
            .with_field("Directory", directory.as_str())
            .with_field("ReadFilename", missing.to_str().unwrap()),
    )
    .await;

    let response = node.recv().await;
    assert_eq!(response.name(), "TestDDAResponse");
    assert_eq!(response.field("ReadContent"), Some("failed-to-read"));

    node.send(
        Message::new("TestDDAComplete")
            .with_field("Directory", directory.as_str())
            .with_field("ReadDirectoryAllowed", "false"),
    )
    .await;
    assert_eq!(node.recv().await.name(), "ClientPut");

    // A second verification demand ends the command instead of looping.
    node.protocol_error(&id, 25).await;
    assert!(pending.await.unwrap().is_none());
    node.expect_silence().await;
}

#[tokio::test]
async fn overlong_probe_sends_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    let directory = dir.path().to_str().unwrap().to_owned();
    let probe = dir.path().join("probe.txt");
    std::fs::write(&probe, vec![b'x'; 64 * 1024]).unwrap();

    let (client, mut node) = connect().await;
    let pending = client
        .put()
        .from_file(dir.path().join("data.bin"))
        .launch("CHK@")
        .unwrap();
    let id = node.recv().await.field("Identifier").unwrap().to_owned();

    node.protocol_error(&id, 25).await;
    assert_eq!(node.recv().await.name(), "TestDDARequest");
    node.send(
        Message::new("TestDDAReply")
            .with_field("Directory", directory.as_str())
            .with_field("ReadFilename", probe.to_str().unwrap()),
    )
    .await;

    let response = node.recv().await;
    assert_eq!(response.name(), "TestDDAResponse");
    assert_eq!(response.field("ReadContent"), Some("failed-to-read"));

    drop(node);
    assert!(pending.await.unwrap().is_none());
}

#[tokio::test]
async fn verification_for_non_disk_upload_resolves_empty() {
    let (client, mut node) = connect().await;
    let pending = client.put().redirect_to("KSK@b").launch("KSK@a").unwrap();
    let id = node.recv().await.field("Identifier").unwrap().to_owned();

    node.protocol_error(&id, 25).await;
    assert!(pending.await.unwrap().is_none());
    node.expect_silence().await;
}

#[tokio::test]
async fn interleaved_replies_are_not_crossed() {
    let dir = tempfile::tempdir().unwrap();
    let (client, mut node) = connect().await;

    let a = client
        .put()
        .from_file(dir.path().join("a.txt"))
        .launch("CHK@")
        .unwrap();
    let id_a = node.recv().await.field("Identifier").unwrap().to_owned();
    let b = client
        .put()
        .from_file(dir.path().join("b.txt"))
        .launch("CHK@")
        .unwrap();
    let id_b = node.recv().await.field("Identifier").unwrap().to_owned();
    assert_ne!(id_a, id_b);

    node.put_successful(&id_b, "CHK@key-b").await;
    node.put_successful(&id_a, "CHK@key-a").await;

    assert_eq!(a.await.unwrap().unwrap().as_str(), "CHK@key-a");
    assert_eq!(b.await.unwrap().unwrap().as_str(), "CHK@key-b");
}

#[tokio::test]
async fn uncorrelated_replies_are_ignored() {
    let (client, mut node) = connect().await;

    let pending = client.put().from_bytes(b"x".to_vec()).launch("CHK@").unwrap();
    let id = node.recv().await.field("Identifier").unwrap().to_owned();

    node.put_successful("someone-else", "CHK@wrong").await;
    node.protocol_error("someone-else", 25).await;
    node.send(Message::new("PeerNote").with_field("NodeIdentifier", "peer"))
        .await;
    node.put_successful(&id, "CHK@right").await;

    assert_eq!(pending.await.unwrap().unwrap().as_str(), "CHK@right");
}

#[tokio::test]
async fn sibling_error_leaves_upload_running() {
    let dir = tempfile::tempdir().unwrap();
    let directory = dir.path().to_str().unwrap().to_owned();
    let (client, mut node) = connect().await;

    let a = client
        .put()
        .from_file(dir.path().join("a.txt"))
        .launch("CHK@")
        .unwrap();
    let id_a = node.recv().await.field("Identifier").unwrap().to_owned();
    let b = client
        .put()
        .from_file(dir.path().join("b.txt"))
        .launch("CHK@")
        .unwrap();
    let id_b = node.recv().await.field("Identifier").unwrap().to_owned();

    // Reaches both uploads through the shared directory.
    node.send(
        Message::new("ProtocolError")
            .with_field("Identifier", id_b.as_str())
            .with_field("Directory", directory.as_str())
            .with_field("Code", "7")
            .with_field("Fatal", "false"),
    )
    .await;
    assert!(b.await.unwrap().is_none());

    node.put_successful(&id_a, "CHK@key-a").await;
    assert_eq!(a.await.unwrap().unwrap().as_str(), "CHK@key-a");
}

#[tokio::test]
async fn connection_close_resolves_all_empty() {
    let (client, mut node) = connect().await;

    let a = client.put().from_bytes(b"a".to_vec()).launch("CHK@").unwrap();
    node.recv().await;
    let b = client.put().redirect_to("KSK@x").launch("KSK@y").unwrap();
    node.recv().await;

    client.engine().terminate("test");
    client.engine().terminate("test again");

    assert!(a.await.unwrap().is_none());
    assert!(b.await.unwrap().is_none());
    wait_idle(&client).await;
}

#[tokio::test]
async fn node_hangup_terminates_sequences() {
    let (client, mut node) = connect().await;

    let pending = client.put().from_bytes(b"a".to_vec()).launch("CHK@").unwrap();
    node.recv().await;
    drop(node);

    assert!(pending.await.unwrap().is_none());

    // Commands launched after the hangup finish without waiting.
    let late = client.put().redirect_to("KSK@x").launch("KSK@y").unwrap();
    assert!(late.await.unwrap().is_none());
}

#[tokio::test]
async fn oversized_payload_terminates_sequences() {
    let (client, mut node) = connect().await;

    let pending = client.put().from_bytes(b"a".to_vec()).launch("CHK@").unwrap();
    node.recv().await;
    node.writer
        .write_all(b"AllData\nDataLength=18446744073709551615\nData\n")
        .await
        .unwrap();

    let resolved = timeout(Duration::from_secs(5), pending).await.unwrap();
    assert!(resolved.unwrap().is_none());
    wait_idle(&client).await;
}

#[tokio::test]
async fn conflicting_sources_fail_before_sending() {
    let (client, mut node) = connect().await;

    let err = client
        .put()
        .from_file("/tmp/a.txt")
        .redirect_to("KSK@b")
        .launch("CHK@")
        .unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));

    let err = client.put().named("x").launch("CHK@").unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));

    node.expect_silence().await;
    assert_eq!(client.engine().in_flight(), 0);
}

#[tokio::test]
async fn short_stream_fails_without_sending() {
    let (client, mut node) = connect().await;

    let pending = client
        .put()
        .from_stream(&b"abc"[..], 10)
        .launch("CHK@")
        .unwrap();
    let err = pending.await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    node.expect_silence().await;
}

#[tokio::test]
async fn abandoned_command_is_deregistered() {
    let (client, mut node) = connect().await;

    let pending = client.put().from_bytes(b"a".to_vec()).launch("CHK@").unwrap();
    let id = node.recv().await.field("Identifier").unwrap().to_owned();
    assert_eq!(client.engine().in_flight(), 1);

    pending.cancel();
    wait_idle(&client).await;

    // Late replies for the abandoned command go nowhere.
    node.put_successful(&id, "CHK@late").await;
    node.expect_silence().await;
    assert_eq!(client.engine().in_flight(), 0);
}

#[tokio::test]
async fn concurrent_commands_use_distinct_identifiers() {
    let (client, mut node) = connect().await;

    let pending: Vec<_> = (0..10u8)
        .map(|i| {
            client
                .put()
                .from_bytes(vec![i])
                .launch("CHK@")
                .unwrap()
        })
        .collect();

    let mut ids = std::collections::HashSet::new();
    for _ in 0..10 {
        let put = node.recv().await;
        ids.insert(put.field("Identifier").unwrap().to_owned());
    }
    assert_eq!(ids.len(), 10);

    for id in &ids {
        node.put_successful(id, &format!("CHK@{id}")).await;
    }
    for p in pending {
        assert!(p.await.unwrap().is_some());
    }
}

#[tokio::test]
async fn in_flight_bound_holds_back_extra_commands() {
    let (client, mut node) = connect_with(config(1)).await;

    let first = client.put().from_bytes(b"1".to_vec()).launch("CHK@").unwrap();
    let second = client.put().from_bytes(b"2".to_vec()).launch("CHK@").unwrap();

    let put = node.recv().await;
    let id = put.field("Identifier").unwrap().to_owned();
    node.expect_silence().await;

    node.put_successful(&id, "CHK@one").await;
    let next = node.recv().await;
    assert_ne!(next.field("Identifier"), Some(id.as_str()));
    node.put_successful(next.field("Identifier").unwrap(), "CHK@two")
        .await;

    let mut keys = vec![
        first.await.unwrap().unwrap().to_string(),
        second.await.unwrap().unwrap().to_string(),
    ];
    keys.sort();
    assert_eq!(keys, ["CHK@one", "CHK@two"]);
}

#[tokio::test]
async fn duplicate_client_name_is_refused() {
    let (client_side, node_side) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(node_side);
    let mut node = Node {
        reader: BufReader::new(reader),
        writer,
    };

    let refuse = async {
        node.recv().await;
        node.send(Message::new("CloseConnectionDuplicateClientName"))
            .await;
    };
    let cfg = config(4);
    let (result, ()) = tokio::join!(Client::over(client_side, &cfg), refuse);
    assert!(matches!(result, Err(Error::Handshake(_))));
}
