//! Per-connection request/response loops for the three session kinds.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt},
    select,
    sync::{mpsc, watch},
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    audit::{AuditLog, AuditRecord},
    protocol::{Request, SessionKind, read_line, write_line},
    room::{BulkOperation, Member, OUTBOX_CAPACITY, Room, SessionId},
};

/// How long a finished session keeps flushing queued lines to a client that
/// is not reading before the stream is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Everything a session shares with the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
    pub room: Arc<Room>,
    pub audit: AuditLog,
}

/// A registered session that has not started running yet.
pub struct Session<R, W> {
    id: SessionId,
    kind: SessionKind,
    peer: SocketAddr,
    reader: R,
    writer: W,
    outbox: mpsc::Sender<String>,
    outbox_rx: mpsc::Receiver<String>,
    running: watch::Receiver<bool>,
    context: SessionContext,
}

impl<R, W> Session<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Registers a new session in the room. Returns `None` if the room is
    /// closed and no longer takes members.
    pub fn register(
        kind: SessionKind,
        peer: SocketAddr,
        reader: R,
        writer: W,
        context: SessionContext,
    ) -> Option<Self> {
        let id = context.room.next_session_id();
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (running_tx, running) = watch::channel(true);

        let member = Member::new(id, kind, peer, outbox.clone(), running_tx);
        if !context.room.register(member) {
            return None;
        }

        Some(Self {
            id,
            kind,
            peer,
            reader,
            writer,
            outbox,
            outbox_rx,
            running,
            context,
        })
    }

    /// Serves the client until it quits, disconnects or is stopped. The
    /// session always leaves the room and closes its stream on the way out.
    pub async fn run(self) {
        let Session {
            id,
            kind,
            peer,
            reader,
            writer,
            outbox,
            outbox_rx,
            running,
            context,
        } = self;

        let membership = Membership {
            room: Arc::clone(&context.room),
            id,
        };
        let mut delivery = tokio::spawn(drain_outbox(outbox_rx, writer, running.clone()));
        info!(%peer, %kind, "session started");

        let mut handler = Handler {
            id,
            kind,
            peer,
            reader,
            outbox,
            running,
            context,
        };
        if let Err(error) = handler.serve().await {
            debug!(%peer, ?error, "session stream failed");
        }

        // Leaving the room drops the member's outbox handle; together with the
        // handler's own handle that lets the delivery task drain and close.
        // A stopped session's delivery task has already given up the stream.
        drop(membership);
        drop(handler);
        if timeout(CLOSE_GRACE, &mut delivery).await.is_err() {
            debug!(%peer, "client is not reading; dropping stream");
            delivery.abort();
        }
        info!(%peer, %kind, "session closed");
    }
}

/// Deregisters on drop, so every exit path leaves the room.
struct Membership {
    room: Arc<Room>,
    id: SessionId,
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.room.deregister(self.id);
    }
}

struct Handler<R> {
    id: SessionId,
    kind: SessionKind,
    peer: SocketAddr,
    reader: R,
    outbox: mpsc::Sender<String>,
    running: watch::Receiver<bool>,
    context: SessionContext,
}

impl<R> Handler<R>
where
    R: AsyncBufRead + Unpin,
{
    async fn serve(&mut self) -> io::Result<()> {
        while let Some(line) = self.next_line().await? {
            let request = Request::parse(&line);
            if request == Request::Quit {
                break;
            }
            self.context
                .audit
                .write(AuditRecord::new(self.peer.ip(), line.as_str(), self.kind));
            if !self.handle(&line, request).await? {
                break;
            }
        }
        Ok(())
    }

    /// Returns `false` when the session should end.
    async fn handle(&mut self, line: &str, request: Request<'_>) -> io::Result<bool> {
        match (self.kind, request) {
            (_, Request::Quit) => return Ok(false),
            (_, Request::Connections) => {
                self.reply(self.context.room.size().to_string()).await;
            }
            (SessionKind::Broadcast, Request::Username) => {
                let Some(candidate) = self.next_line().await? else {
                    return Ok(false);
                };
                let outcome = self.context.room.apply(BulkOperation::ClaimUsername {
                    requester: self.id,
                    candidate,
                });
                debug!(peer = %self.peer, ?outcome, "username requested");
            }
            (SessionKind::Broadcast, _) => {
                self.context.room.apply(BulkOperation::Broadcast {
                    sender: self.id,
                    text: line.to_string(),
                });
            }
            (SessionKind::Echo, Request::Logs) => self.replay_audit_log().await,
            (SessionKind::Echo, _) => self.reply(line).await,
            (SessionKind::Reverse, _) => self.reply(reverse(line)).await,
        }
        Ok(true)
    }

    async fn replay_audit_log(&mut self) {
        match self.context.audit.read().await {
            Ok(records) => {
                for record in records {
                    self.reply(record).await;
                }
            }
            Err(error) => debug!(peer = %self.peer, ?error, "failed to read audit log"),
        }
    }

    /// Next line from the client, or `None` on EOF or once the session is stopped.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        select! {
            biased;
            _ = stopped(&mut self.running) => Ok(None),
            line = read_line(&mut self.reader) => line,
        }
    }

    /// Queues a reply, waiting for room in the outbox unless the session is stopped.
    async fn reply(&mut self, line: impl Into<String>) {
        let line = line.into();
        select! {
            biased;
            _ = stopped(&mut self.running) => {}
            _ = self.outbox.send(line) => {}
        }
    }
}

/// Resolves once the running flag is cleared or the room drops the member.
async fn stopped(running: &mut watch::Receiver<bool>) {
    loop {
        if !*running.borrow_and_update() {
            return;
        }
        if running.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves only when the running flag is cleared. A member that simply left
/// the room keeps flushing its outbox.
async fn stop_requested(running: &mut watch::Receiver<bool>) {
    loop {
        if !*running.borrow_and_update() {
            return;
        }
        if running.changed().await.is_err() {
            if !*running.borrow() {
                return;
            }
            std::future::pending::<()>().await;
        }
    }
}

/// Writes queued lines to the client. On stop the stream is dropped at once,
/// even in the middle of a blocked write.
async fn drain_outbox<W>(
    mut outbox: mpsc::Receiver<String>,
    mut writer: W,
    mut running: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        select! {
            biased;
            _ = stop_requested(&mut running) => {
                debug!("session stopped; closing client stream");
                return;
            }
            delivered = deliver_next(&mut outbox, &mut writer) => {
                if !delivered {
                    break;
                }
            }
        }
    }
    if let Err(error) = writer.shutdown().await {
        debug!(?error, "failed to close client stream");
    }
}

/// Writes the next queued line. Returns `false` once the outbox is closed or
/// the client stream fails.
async fn deliver_next<W>(outbox: &mut mpsc::Receiver<String>, writer: &mut W) -> bool
where
    W: AsyncWrite + Unpin,
{
    let Some(line) = outbox.recv().await else {
        return false;
    };
    if let Err(error) = write_line(writer, &line).await {
        debug!(?error, "failed to deliver line to client");
        return false;
    }
    true
}

pub fn reverse(line: &str) -> String {
    line.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{BufReader, DuplexStream, ReadHalf, WriteHalf},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    struct Peer {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        task: JoinHandle<()>,
    }

    impl Peer {
        async fn send(&mut self, line: &str) {
            write_line(&mut self.writer, line).await.expect("send line");
        }

        async fn recv(&mut self) -> Option<String> {
            timeout(WAIT, read_line(&mut self.reader))
                .await
                .expect("line within timeout")
                .expect("read line")
        }
    }

    fn context() -> SessionContext {
        SessionContext {
            room: Arc::new(Room::new()),
            audit: AuditLog::disabled(),
        }
    }

    fn start(kind: SessionKind, port: u16, context: &SessionContext) -> Peer {
        start_with_buffer(kind, port, context, 1024)
    }

    fn start_with_buffer(
        kind: SessionKind,
        port: u16,
        context: &SessionContext,
        buffer: usize,
    ) -> Peer {
        let (client, server) = tokio::io::duplex(buffer);
        let (server_reader, server_writer) = tokio::io::split(server);
        let peer = SocketAddr::from(([127, 0, 0, 1], port));
        let session = Session::register(
            kind,
            peer,
            BufReader::new(server_reader),
            server_writer,
            context.clone(),
        )
        .expect("room open");
        let task = tokio::spawn(session.run());

        let (client_reader, client_writer) = tokio::io::split(client);
        Peer {
            reader: BufReader::new(client_reader),
            writer: client_writer,
            task,
        }
    }

    #[test]
    fn reverse_handles_multibyte_characters() {
        assert_eq!(reverse("hello"), "olleh");
        assert_eq!(reverse("añb"), "bña");
        assert_eq!(reverse(""), "");
    }

    #[tokio::test]
    async fn reverse_session_replies_and_counts_itself() {
        let context = context();
        let mut client = start(SessionKind::Reverse, 4000, &context);

        client.send("hello").await;
        assert_eq!(client.recv().await.as_deref(), Some("olleh"));
        client.send("CONN").await;
        assert_eq!(client.recv().await.as_deref(), Some("1"));
        client.send("LOG").await;
        assert_eq!(client.recv().await.as_deref(), Some("GOL"));
    }

    #[tokio::test]
    async fn quit_closes_the_stream_and_leaves_the_room() {
        let context = context();
        let mut client = start(SessionKind::Echo, 4000, &context);

        client.send("ping").await;
        assert_eq!(client.recv().await.as_deref(), Some("ping"));
        client.send("QUIT").await;
        assert_eq!(client.recv().await, None);

        timeout(WAIT, client.task).await.expect("session ended").expect("join");
        assert_eq!(context.room.size(), 0);
    }

    #[tokio::test]
    async fn client_disconnect_counts_as_quit() {
        let context = context();
        let client = start(SessionKind::Broadcast, 4000, &context);
        assert_eq!(context.room.size(), 1);

        let Peer { reader, writer, task } = client;
        drop(writer);
        drop(reader);

        timeout(WAIT, task).await.expect("session ended").expect("join");
        assert_eq!(context.room.size(), 0);
    }

    #[tokio::test]
    async fn stop_all_ends_blocked_sessions() {
        let context = context();
        let mut echo = start(SessionKind::Echo, 4000, &context);
        let mut broadcast = start(SessionKind::Broadcast, 4001, &context);
        echo.send("ready").await;
        assert_eq!(echo.recv().await.as_deref(), Some("ready"));

        context.room.apply(BulkOperation::StopAll);

        assert_eq!(echo.recv().await, None);
        assert_eq!(broadcast.recv().await, None);
        timeout(WAIT, echo.task).await.expect("echo ended").expect("join");
        timeout(WAIT, broadcast.task).await.expect("broadcast ended").expect("join");
        assert_eq!(context.room.size(), 0);
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_end_the_session() {
        let context = context();
        let mut client = start(SessionKind::Echo, 4000, &context);

        client.writer.write_all(b"caf\xe9\n").await.expect("send raw bytes");
        assert_eq!(client.recv().await.as_deref(), Some("caf\u{fffd}"));
        client.send("ping").await;
        assert_eq!(client.recv().await.as_deref(), Some("ping"));
        assert_eq!(context.room.size(), 1);
    }

    #[tokio::test]
    async fn stop_all_drops_a_member_that_stopped_reading() {
        let context = context();
        let stalled = start_with_buffer(SessionKind::Broadcast, 4000, &context, 64);
        let mut speaker = start(SessionKind::Broadcast, 4001, &context);

        let filler = "x".repeat(32);
        for _ in 0..OUTBOX_CAPACITY * 2 {
            speaker.send(&filler).await;
        }
        speaker.send("CONN").await;
        assert_eq!(speaker.recv().await.as_deref(), Some("2"));

        context.room.apply(BulkOperation::StopAll);

        let Peer {
            mut reader,
            writer: _writer,
            task,
        } = stalled;
        timeout(WAIT, task).await.expect("stalled session ended").expect("join");
        timeout(WAIT, speaker.task).await.expect("speaker ended").expect("join");
        assert_eq!(context.room.size(), 0);

        let closed = timeout(WAIT, async {
            while let Ok(Some(_)) = read_line(&mut reader).await {}
        })
        .await;
        assert!(closed.is_ok(), "stalled client stream was not closed");
    }

    #[tokio::test]
    async fn broadcast_members_chat_under_their_usernames() {
        let context = context();
        let mut alice = start(SessionKind::Broadcast, 4000, &context);
        let mut bob = start(SessionKind::Broadcast, 4001, &context);

        alice.send("USERNAME").await;
        alice.send("alice").await;
        alice.send("hi bob").await;
        assert_eq!(bob.recv().await.as_deref(), Some("alice: hi bob"));

        bob.send("USERNAME").await;
        bob.send("alice").await;
        assert_eq!(bob.recv().await.as_deref(), Some("Username not available"));

        bob.send("hello").await;
        assert_eq!(alice.recv().await.as_deref(), Some("127.0.0.1:4001: hello"));

        alice.send("CONN").await;
        assert_eq!(alice.recv().await.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn echo_replays_the_audit_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let context = SessionContext {
            room: Arc::new(Room::new()),
            audit: AuditLog::open(dir.path().join("chatLog.txt"))
                .await
                .expect("open log"),
        };
        let mut client = start(SessionKind::Echo, 4000, &context);

        client.send("hello").await;
        assert_eq!(client.recv().await.as_deref(), Some("hello"));
        client.send("LOG").await;

        let first = client.recv().await.expect("first record");
        let second = client.recv().await.expect("second record");
        assert!(first.ends_with("TO: ECHO_SERVER; MESSAGE: hello"));
        assert!(second.ends_with("TO: ECHO_SERVER; MESSAGE: LOG"));
    }
}
