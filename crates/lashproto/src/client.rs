//! Client-side connection helper.
//!
//! A managed application calls [`connect`] once at startup: it dials the
//! daemon socket, runs the version gate, announces itself with `Connect`,
//! and hands back the live [`Connection`] pair.
//!
//! A client relaunched by the daemon's loader finds its identity in the
//! environment ([`env_identity`]): the loader sets `LASH_SERVER`,
//! `LASH_PROJECT` and `LASH_CLIENT_ID` so the process reattaches under the
//! UUID it was saved with.

use std::path::Path;

use tokio::net::UnixStream;
use tracing::info;
use uuid::Uuid;

use crate::conn::Connection;
use crate::error::ProtoError;
use crate::event::{CommEvent, ConnectParams};
use crate::wire;

/// Identity a loader-relaunched client inherits from its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvIdentity {
    pub server: String,
    pub project: String,
    pub id: Uuid,
}

/// Read the loader-provided reconnect identity, if this process was
/// launched by the daemon.
pub fn env_identity() -> Option<EnvIdentity> {
    let server = std::env::var("LASH_SERVER").ok()?;
    let project = std::env::var("LASH_PROJECT").ok()?;
    let id = std::env::var("LASH_CLIENT_ID").ok()?.parse().ok()?;
    Some(EnvIdentity {
        server,
        project,
        id,
    })
}

/// Dial the daemon, pass the version gate, send `Connect`, and return the
/// established connection pair.
pub async fn connect(socket: &Path, params: ConnectParams) -> Result<Connection, ProtoError> {
    let mut stream = UnixStream::connect(socket).await?;
    wire::handshake(&mut stream).await?;
    wire::write_event(&mut stream, &CommEvent::Connect(params.clone())).await?;
    info!(
        "connected to {} as client {} of project {}",
        socket.display(),
        params.id,
        params.project
    );
    Ok(Connection::spawn(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_identity_requires_all_three_vars() {
        // Not set in the test environment.
        std::env::remove_var("LASH_SERVER");
        std::env::remove_var("LASH_PROJECT");
        std::env::remove_var("LASH_CLIENT_ID");
        assert!(env_identity().is_none());
    }
}
