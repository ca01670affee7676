use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Ends the session.
pub const QUIT: &str = "QUIT";
/// Asks for the number of live sessions.
pub const CONN: &str = "CONN";
/// Announces that the next line is the desired display name (broadcast only).
pub const USERNAME: &str = "USERNAME";
/// Replays the audit log (echo only).
pub const LOG: &str = "LOG";

/// Sent to a broadcast member whose requested display name is already held.
pub const USERNAME_TAKEN: &str = "Username not available";

/// The session flavors a client can pick during negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionKind {
    #[default]
    Echo,
    Reverse,
    Broadcast,
}

impl SessionKind {
    pub const ALL: [SessionKind; 3] = [SessionKind::Echo, SessionKind::Reverse, SessionKind::Broadcast];

    /// Name shown in the menu, the confirmation line and audit records.
    pub fn name(self) -> &'static str {
        match self {
            SessionKind::Echo => "ECHO_SERVER",
            SessionKind::Reverse => "REVERSE_SERVER",
            SessionKind::Broadcast => "BROADCAST_SERVER",
        }
    }

    fn alias(self) -> &'static str {
        match self {
            SessionKind::Echo => "echo",
            SessionKind::Reverse => "reverse",
            SessionKind::Broadcast => "broadcast",
        }
    }

    /// Matches a client's selection against kind names and their short aliases,
    /// ignoring case and surrounding whitespace.
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        Self::ALL.into_iter().find(|kind| {
            trimmed.eq_ignore_ascii_case(kind.name()) || trimmed.eq_ignore_ascii_case(kind.alias())
        })
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A line received from a client once its session kind is fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Quit,
    Connections,
    Username,
    Logs,
    Payload(&'a str),
}

impl<'a> Request<'a> {
    /// Control tokens must match the whole line exactly; everything else is payload.
    pub fn parse(line: &'a str) -> Self {
        match line {
            QUIT => Request::Quit,
            CONN => Request::Connections,
            USERNAME => Request::Username,
            LOG => Request::Logs,
            payload => Request::Payload(payload),
        }
    }
}

/// Menu presented to a fresh connection. The trailing empty line marks its end.
pub fn menu() -> String {
    let mut menu = format!(
        "Welcome to the chat server\nChoose the type of chat you prefer, default is {}.\nOptions are:\n",
        SessionKind::default()
    );
    for kind in SessionKind::ALL {
        menu.push_str(kind.name());
        menu.push('\n');
    }
    menu
}

pub fn confirmation(kind: SessionKind) -> String {
    format!("Selected server: {kind}")
}

/// Reads one line without its terminator. Returns `None` once the peer closes.
///
/// Bytes that are not valid UTF-8 are replaced rather than failing the read.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let bytes = reader.read_until(b'\n', &mut buf).await?;
    if bytes == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf);
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
