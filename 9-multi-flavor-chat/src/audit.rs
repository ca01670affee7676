//! Append-only audit trail of every line a session processes.
//!
//! One writer task owns the file. Sessions queue records without waiting, and
//! reads travel through the same queue so a replay always includes every
//! record queued before it.

use std::{
    fmt, io,
    net::IpAddr,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::protocol::SessionKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub at: DateTime<Local>,
    pub sender: IpAddr,
    pub kind: SessionKind,
    pub content: String,
}

impl AuditRecord {
    pub fn new(sender: IpAddr, content: impl Into<String>, kind: SessionKind) -> Self {
        Self {
            at: Local::now(),
            sender,
            kind,
            content: content.into(),
        }
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DATE: {}; FROM: {}; TO: {}; MESSAGE: {}",
            self.at.format("%a %b %e %H:%M:%S %Y"),
            self.sender,
            self.kind,
            self.content
        )
    }
}

enum AuditRequest {
    Write(AuditRecord),
    Read {
        respond_to: oneshot::Sender<io::Result<Vec<String>>>,
    },
}

/// Cloneable handle to the audit trail. A disabled log drops writes and
/// reads back nothing.
#[derive(Clone, Default)]
pub struct AuditLog {
    requests: Option<mpsc::UnboundedSender<AuditRequest>>,
}

impl AuditLog {
    /// Opens (creating if needed) the log file and its parent directory, then
    /// starts the writer task. Must be called inside a Tokio runtime.
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (requests, inbox) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(path, file, inbox));
        Ok(Self {
            requests: Some(requests),
        })
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Queues one record. Failures are logged and otherwise ignored.
    pub fn write(&self, record: AuditRecord) {
        let Some(requests) = &self.requests else {
            return;
        };
        if requests.send(AuditRequest::Write(record)).is_err() {
            debug!("audit writer has stopped; record dropped");
        }
    }

    /// Returns every record in the log, oldest first.
    pub async fn read(&self) -> io::Result<Vec<String>> {
        let Some(requests) = &self.requests else {
            return Ok(Vec::new());
        };
        let (respond_to, response) = oneshot::channel();
        requests
            .send(AuditRequest::Read { respond_to })
            .map_err(|_| writer_gone())?;
        response.await.map_err(|_| writer_gone())?
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "audit writer has stopped")
}

async fn run_writer(path: PathBuf, mut file: File, mut inbox: mpsc::UnboundedReceiver<AuditRequest>) {
    while let Some(request) = inbox.recv().await {
        match request {
            AuditRequest::Write(record) => {
                if let Err(error) = append(&mut file, &record).await {
                    warn!(path = %path.display(), ?error, "failed to append audit record");
                }
            }
            AuditRequest::Read { respond_to } => {
                let _ = respond_to.send(read_records(&mut file, &path).await);
            }
        }
    }
}

async fn append(file: &mut File, record: &AuditRecord) -> io::Result<()> {
    let line = format!("{record}\n");
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

async fn read_records(file: &mut File, path: &Path) -> io::Result<Vec<String>> {
    file.flush().await?;
    let contents = fs::read_to_string(path).await?;
    Ok(contents.lines().map(str::to_owned).collect())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[tokio::test]
    async fn records_are_appended_and_read_back_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("log").join("chatLog.txt");
        let log = AuditLog::open(&path).await.expect("open log");
        let sender = IpAddr::V4(Ipv4Addr::LOCALHOST);

        log.write(AuditRecord::new(sender, "hello", SessionKind::Echo));
        log.write(AuditRecord::new(sender, "olleh", SessionKind::Reverse));
        let lines = log.read().await.expect("read log");

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("DATE: "));
        assert!(lines[0].ends_with("; FROM: 127.0.0.1; TO: ECHO_SERVER; MESSAGE: hello"));
        assert!(lines[1].ends_with("; TO: REVERSE_SERVER; MESSAGE: olleh"));
    }

    #[tokio::test]
    async fn reopening_appends_to_existing_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chatLog.txt");
        let sender = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let first = AuditLog::open(&path).await.expect("open log");
        first.write(AuditRecord::new(sender, "one", SessionKind::Broadcast));
        first.read().await.expect("flush first log");

        let second = AuditLog::open(&path).await.expect("reopen log");
        second.write(AuditRecord::new(sender, "two", SessionKind::Broadcast));
        let lines = second.read().await.expect("read log");

        assert_eq!(lines.len(), 2);
        assert!(lines[1].ends_with("MESSAGE: two"));
    }

    #[tokio::test]
    async fn disabled_log_reads_empty() {
        let log = AuditLog::disabled();
        log.write(AuditRecord::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "ignored",
            SessionKind::Echo,
        ));
        assert!(log.read().await.expect("read").is_empty());
    }
}
