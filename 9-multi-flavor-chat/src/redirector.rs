//! Negotiation that turns a fresh connection into a running session.

use std::{io, net::SocketAddr};

use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::TcpStream,
};
use tracing::{debug, info};

use crate::{
    admission::NegotiationSlot,
    protocol::{self, SessionKind, read_line, write_line},
    session::{Session, SessionContext},
};

/// Outcome of reading the client's choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Chosen(SessionKind),
    /// Unknown, empty or missing choice; the default kind applies.
    Defaulted,
}

impl Selection {
    pub fn kind(self) -> SessionKind {
        match self {
            Selection::Chosen(kind) => kind,
            Selection::Defaulted => SessionKind::default(),
        }
    }
}

/// Runs the negotiation for one accepted connection and, if it completes,
/// registers and spawns the session. The slot is released when this returns,
/// whatever the outcome.
pub async fn redirect(
    stream: TcpStream,
    peer: SocketAddr,
    slot: NegotiationSlot,
    context: SessionContext,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let selection = match negotiate(&mut reader, &mut writer).await {
        Ok(selection) => selection,
        Err(error) => {
            debug!(%peer, ?error, "negotiation aborted");
            return;
        }
    };
    info!(%peer, kind = %selection.kind(), "selected server");

    if slot.is_stopped() {
        debug!(%peer, "server stopped during negotiation");
        return;
    }
    match Session::register(selection.kind(), peer, reader, writer, context) {
        Some(session) => {
            tokio::spawn(session.run());
        }
        None => debug!(%peer, "room closed during negotiation"),
    }
    drop(slot);
}

/// Sends the menu, reads one selection line and confirms the chosen kind.
///
/// A failed or empty read falls back to the default kind; only write failures
/// abort the negotiation.
pub async fn negotiate<R, W>(reader: &mut R, writer: &mut W) -> io::Result<Selection>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_line(writer, &protocol::menu()).await?;
    let selection = read_selection(reader).await;
    write_line(writer, &protocol::confirmation(selection.kind())).await?;
    Ok(selection)
}

async fn read_selection<R>(reader: &mut R) -> Selection
where
    R: AsyncBufRead + Unpin,
{
    match read_line(reader).await {
        Ok(Some(line)) => SessionKind::parse(&line).map_or(Selection::Defaulted, Selection::Chosen),
        Ok(None) => Selection::Defaulted,
        Err(error) => {
            debug!(?error, "failed to read selection");
            Selection::Defaulted
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt, BufReader};

    use super::*;

    async fn negotiate_with(client_input: &[u8]) -> (Selection, Vec<String>) {
        let (mut server_side, client_side) = tokio::io::duplex(4096);
        let (client_reader, mut client_writer) = tokio::io::split(client_side);
        client_writer.write_all(client_input).await.expect("client input");
        client_writer.shutdown().await.expect("close client input");

        let (server_reader, mut server_writer) = tokio::io::split(&mut server_side);
        let mut server_reader = BufReader::new(server_reader);
        let selection = negotiate(&mut server_reader, &mut server_writer)
            .await
            .expect("negotiate");
        drop(server_writer);
        drop(server_reader);
        drop(server_side);

        let mut client_reader = BufReader::new(client_reader);
        let mut lines = Vec::new();
        while let Some(line) = read_line(&mut client_reader).await.expect("read") {
            lines.push(line);
        }
        (selection, lines)
    }

    #[tokio::test]
    async fn menu_then_confirmation_for_a_known_kind() {
        let (selection, lines) = negotiate_with(b"Reverse_Server\n").await;

        assert_eq!(selection, Selection::Chosen(SessionKind::Reverse));
        assert_eq!(lines[0], "Welcome to the chat server");
        assert_eq!(&lines[3..7], ["ECHO_SERVER", "REVERSE_SERVER", "BROADCAST_SERVER", ""]);
        assert_eq!(lines.last().map(String::as_str), Some("Selected server: REVERSE_SERVER"));
    }

    #[tokio::test]
    async fn unknown_choice_defaults_to_echo() {
        let (selection, lines) = negotiate_with(b"telnet\n").await;

        assert_eq!(selection, Selection::Defaulted);
        assert_eq!(selection.kind(), SessionKind::Echo);
        assert_eq!(lines.last().map(String::as_str), Some("Selected server: ECHO_SERVER"));
    }

    #[tokio::test]
    async fn closed_input_defaults_to_echo() {
        let (selection, _) = negotiate_with(b"").await;
        assert_eq!(selection, Selection::Defaulted);
    }
}
