use std::{future::Future, net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    admission::{AdmissionController, NegotiationSlot},
    audit::AuditLog,
    redirector,
    room::Room,
    session::SessionContext,
};

pub const DEFAULT_MAX_CONNECTIONS: usize = 5;
pub const DEFAULT_AUDIT_LOG: &str = "log/chatLog.txt";

/// Settings for one chat server instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Upper bound on live sessions plus connections still negotiating.
    pub max_connections: usize,
    /// Where audit records are appended. `None` disables the audit log.
    pub audit_log: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            audit_log: Some(PathBuf::from(DEFAULT_AUDIT_LOG)),
        }
    }
}

pub struct ChatServer {
    listener: TcpListener,
    admission: Arc<AdmissionController>,
    context: SessionContext,
}

impl ChatServer {
    pub async fn new(listener: TcpListener, config: ServerConfig) -> Result<Self> {
        let audit = match &config.audit_log {
            Some(path) => AuditLog::open(path)
                .await
                .with_context(|| format!("failed to open audit log {}", path.display()))?,
            None => AuditLog::disabled(),
        };
        let room = Arc::new(Room::new());
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&room),
            config.max_connections,
        ));

        Ok(Self {
            listener,
            admission,
            context: SessionContext { room, audit },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves, then stops every session.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer {
            listener,
            admission,
            context,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&admission, &context);
                    break;
                }
                admitted = admit(&listener, &admission) => {
                    let Some((slot, accept_result)) = admitted else {
                        break;
                    };
                    handle_accept_result(accept_result, slot, &context);
                }
            }
        }

        Ok(())
    }
}

/// Waits for capacity, then for the next connection. The slot is booked
/// before accepting so a connection arriving at capacity stays queued.
async fn admit(
    listener: &TcpListener,
    admission: &Arc<AdmissionController>,
) -> Option<(NegotiationSlot, std::io::Result<(TcpStream, SocketAddr)>)> {
    let slot = admission.enter().await?;
    let accepted = listener.accept().await;
    Some((slot, accepted))
}

fn handle_shutdown(admission: &AdmissionController, context: &SessionContext) {
    admission.stop();
    let stopped = context.room.close();
    info!(sessions = stopped, "chat server shutting down");
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    slot: NegotiationSlot,
    context: &SessionContext,
) {
    match result {
        Ok((stream, peer)) => {
            info!(%peer, "connection accepted");
            tokio::spawn(redirector::redirect(stream, peer, slot, context.clone()));
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}
