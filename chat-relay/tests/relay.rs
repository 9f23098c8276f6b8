use std::{collections::HashSet, net::SocketAddr, time::Duration};

use anyhow::Result;
use chat_relay::{
    listener::Listener,
    message::{Command, CommandKind, Response, ResponseKind, read_message, write_message},
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn join(addr: SocketAddr, nickname: &str) -> Result<Self> {
        let mut client = Self::connect(addr).await?;
        client.send(&Command::connect(nickname)).await?;
        Ok(client)
    }

    async fn send(&mut self, command: &Command) -> Result<()> {
        write_message(&mut self.writer, command).await?;
        Ok(())
    }

    async fn send_raw(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<Response>> {
        Ok(timeout(READ_TIMEOUT, read_message::<_, Response>(&mut self.reader)).await??)
    }

    async fn expect(&mut self) -> Result<Response> {
        let response = self.next().await?;
        Ok(response.expect("expected a response, got end of stream"))
    }

    async fn expect_users(&mut self) -> Result<HashSet<String>> {
        let response = self.expect().await?;
        assert_eq!(response.kind, ResponseKind::Users, "{response:?}");
        Ok(response
            .nicknames()
            .expect("users carries nicknames")
            .iter()
            .cloned()
            .collect())
    }

    async fn expect_closed(&mut self) -> Result<()> {
        let next = self.next().await?;
        assert!(next.is_none(), "expected end of stream, got {next:?}");
        Ok(())
    }
}

fn nicks(nicknames: &[&str]) -> HashSet<String> {
    nicknames.iter().map(|nickname| nickname.to_string()).collect()
}

async fn start_listener() -> Result<(Listener, SocketAddr)> {
    let listener = Listener::new();
    let addr = listener.start(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    Ok((listener, addr))
}

#[tokio::test]
async fn two_clients_converse_and_part() -> Result<()> {
    let (listener, addr) = start_listener().await?;

    let mut a = TestClient::join(addr, "A").await?;
    assert_eq!(a.expect_users().await?, nicks(&["A"]));

    let mut b = TestClient::join(addr, "B").await?;
    assert_eq!(a.expect_users().await?, nicks(&["A", "B"]));
    assert_eq!(b.expect_users().await?, nicks(&["A", "B"]));
    assert_eq!(listener.directory().snapshot_nicks().await, vec!["A", "B"]);

    a.send(&Command::new(CommandKind::StartConversation, "A", "B", "hi\n"))
        .await?;
    assert_eq!(b.expect().await?, Response::message("B", "hi\n", "A"));

    b.send(&Command::disconnect("B")).await?;
    b.expect_closed().await?;
    assert_eq!(a.expect_users().await?, nicks(&["A"]));

    // The message to B is dropped; the self-addressed one proves nothing
    // else reached A in between.
    a.send(&Command::new(CommandKind::SendMessage, "A", "B", "still there?"))
        .await?;
    a.send(&Command::new(CommandKind::SendMessage, "A", "A", "note to self"))
        .await?;
    assert_eq!(a.expect().await?, Response::message("A", "note to self", "A"));

    listener.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_nickname_is_rejected_over_tcp() -> Result<()> {
    let (listener, addr) = start_listener().await?;

    let mut first = TestClient::join(addr, "alice").await?;
    first.expect_users().await?;

    let mut second = TestClient::join(addr, "alice").await?;
    let rejection = second.expect().await?;
    assert_eq!(rejection.kind, ResponseKind::RejectConnection);
    second.expect_closed().await?;

    // The rejected client can pick another nickname on a new connection.
    let mut retry = TestClient::join(addr, "alice2").await?;
    assert_eq!(retry.expect_users().await?, nicks(&["alice", "alice2"]));
    assert_eq!(first.expect_users().await?, nicks(&["alice", "alice2"]));

    listener.stop().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_connects_for_one_nickname_have_one_winner() -> Result<()> {
    let (listener, addr) = start_listener().await?;

    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(TestClient::connect(addr).await?);
    }
    for client in &mut clients {
        client.send(&Command::connect("zed")).await?;
    }

    let mut accepted = 0;
    let mut rejected = 0;
    for client in &mut clients {
        match client.expect().await?.kind {
            ResponseKind::Users => accepted += 1,
            ResponseKind::RejectConnection => {
                client.expect_closed().await?;
                rejected += 1;
            }
            other => panic!("unexpected response {other:?}"),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(rejected, 9);
    assert_eq!(listener.directory().snapshot_nicks().await, vec!["zed"]);

    listener.stop().await;
    Ok(())
}

#[tokio::test]
async fn dropped_client_is_announced_as_gone() -> Result<()> {
    let (listener, addr) = start_listener().await?;

    let mut alice = TestClient::join(addr, "alice").await?;
    alice.expect_users().await?;
    let mut bob = TestClient::join(addr, "bob").await?;
    bob.expect_users().await?;
    alice.expect_users().await?;

    drop(bob);

    assert_eq!(alice.expect_users().await?, nicks(&["alice"]));
    assert!(listener.directory().lookup("bob").await.is_none());

    listener.stop().await;
    Ok(())
}

#[tokio::test]
async fn invalid_command_is_answered_and_session_continues() -> Result<()> {
    let (listener, addr) = start_listener().await?;

    let mut alice = TestClient::join(addr, "alice").await?;
    alice.expect_users().await?;

    alice
        .send_raw(r#"{"type":"SHOUT","senderNick":"alice"}"#)
        .await?;
    assert_eq!(alice.expect().await?.kind, ResponseKind::Error);

    alice.send_raw("").await?;
    alice
        .send(&Command::new(CommandKind::SendMessage, "alice", "alice", "ping"))
        .await?;
    assert_eq!(alice.expect().await?, Response::message("alice", "ping", "alice"));

    listener.stop().await;
    Ok(())
}

#[tokio::test]
async fn garbage_closes_the_connection() -> Result<()> {
    let (listener, addr) = start_listener().await?;

    let mut watcher = TestClient::join(addr, "watcher").await?;
    watcher.expect_users().await?;
    let mut noisy = TestClient::join(addr, "noisy").await?;
    noisy.expect_users().await?;
    watcher.expect_users().await?;

    noisy.send_raw("this is not json").await?;
    noisy.expect_closed().await?;
    assert_eq!(watcher.expect_users().await?, nicks(&["watcher"]));

    listener.stop().await;
    Ok(())
}

#[tokio::test]
async fn messages_before_connect_are_refused() -> Result<()> {
    let (listener, addr) = start_listener().await?;

    let mut client = TestClient::connect(addr).await?;
    client
        .send(&Command::new(CommandKind::SendMessage, "ghost", "anyone", "hello"))
        .await?;

    assert_eq!(client.expect().await?.kind, ResponseKind::Error);
    client.expect_closed().await?;
    assert!(listener.directory().snapshot_nicks().await.is_empty());

    listener.stop().await;
    Ok(())
}

#[tokio::test]
async fn stop_sends_server_close_and_ends_every_session() -> Result<()> {
    let (listener, addr) = start_listener().await?;

    let mut alice = TestClient::join(addr, "alice").await?;
    alice.expect_users().await?;
    let mut bob = TestClient::join(addr, "bob").await?;
    bob.expect_users().await?;
    alice.expect_users().await?;
    // Never registers; the error reply proves its session is running.
    let mut lurker = TestClient::connect(addr).await?;
    lurker.send_raw(r#"{"type":"SHOUT","senderNick":""}"#).await?;
    assert_eq!(lurker.expect().await?.kind, ResponseKind::Error);

    assert!(listener.stop().await);

    for client in [&mut alice, &mut bob] {
        assert_eq!(client.expect().await?.kind, ResponseKind::ServerClose);
        client.expect_closed().await?;
    }
    lurker.expect_closed().await?;

    assert!(listener.directory().snapshot_nicks().await.is_empty());
    assert!(TcpStream::connect(addr).await.is_err());

    // A stopped listener can be started again.
    let (restarted_addr, mut carol) = {
        let addr = listener.start(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        (addr, TestClient::join(addr, "carol").await?)
    };
    assert_eq!(carol.expect_users().await?, nicks(&["carol"]));
    assert_eq!(listener.local_addr(), Some(restarted_addr));

    listener.stop().await;
    Ok(())
}

#[tokio::test]
async fn stop_returns_while_a_client_has_stopped_reading() -> Result<()> {
    let (listener, addr) = start_listener().await?;

    let mut alice = TestClient::join(addr, "alice").await?;
    alice.expect_users().await?;
    let mut bob = TestClient::join(addr, "bob").await?;
    bob.expect_users().await?;

    // Alice never reads again; bob's session ends up parked writing to her.
    let flood = tokio::spawn(async move {
        let text = "x".repeat(64 * 1024);
        for _ in 0..256 {
            let command = Command::new(CommandKind::SendMessage, "bob", "alice", text.as_str());
            if bob.send(&command).await.is_err() {
                break;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stopped = timeout(Duration::from_secs(10), listener.stop()).await;
    assert_eq!(stopped.ok(), Some(true), "stop did not return");
    assert!(!listener.is_running());

    flood.abort();
    drop(alice);
    Ok(())
}
