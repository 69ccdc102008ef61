//! Session server: accept loop and session-event handling.
//!
//! Each accepted socket goes through the version gate, then declares itself
//! with `Connect` (a managed client) or `IfaceConnect` (a GUI/control
//! peer). Clients get a registry record and a connection pair; their
//! configs are retained as last-known state, and their session events drive
//! the save/restore/quit machinery.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lashconf::LashConfig;
use lashproto::{
    wire, CommEvent, Connection, ConnectParams, Event, EventKind, Inbound, ProtoError,
    PROTOCOL_VERSION,
};

use crate::graph::{GraphManager, PatchSnapshot};
use crate::loader::Loader;
use crate::persist::{self, SavedClient};
use crate::registry::{Client, Registry};

pub struct SessionServer {
    config: LashConfig,
    registry: Registry,
    snapshot: PatchSnapshot,
    loader: AsyncMutex<Option<Loader>>,
    /// Saved state for clients we have relaunched but which have not yet
    /// reconnected; consumed on their next Connect.
    pending_restores: Mutex<HashMap<Uuid, SavedClient>>,
}

impl SessionServer {
    pub fn new(config: LashConfig, manager: Arc<dyn GraphManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Registry::new(),
            snapshot: PatchSnapshot::new(manager),
            loader: AsyncMutex::new(None),
            pending_restores: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn snapshot(&self) -> &PatchSnapshot {
        &self.snapshot
    }

    /// Bind the listening socket and serve until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let socket_path = self.config.paths.socket.clone();
        let listener = bind_socket(&socket_path)?;
        info!("listening on {}", socket_path.display());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream).await {
                                debug!("connection ended with error: {e:#}");
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }

        let _ = std::fs::remove_file(&socket_path);
        info!("server stopped");
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, mut stream: UnixStream) -> Result<()> {
        match wire::handshake(&mut stream).await {
            Ok(_) => {}
            Err(ProtoError::VersionMismatch { theirs, .. }) => {
                // Reported distinctly from generic I/O so operators can
                // spot version-skew deployments.
                warn!("rejected peer with protocol version {theirs} (ours {PROTOCOL_VERSION})");
                return Ok(());
            }
            Err(e) => return Err(e).context("handshake failed"),
        }

        match wire::read_event(&mut stream).await {
            Ok(CommEvent::Connect(params)) => self.handle_client(stream, params).await,
            Ok(CommEvent::IfaceConnect) => self.handle_interface(stream).await,
            Ok(other) => {
                warn!("peer opened with {:?} instead of a connect, dropping", other.tag());
                Ok(())
            }
            Err(e) if e.is_disconnect() => Ok(()),
            Err(e) => Err(e).context("failed to read connect event"),
        }
    }

    /// Register a managed client and pump its traffic until it goes away.
    async fn handle_client(self: Arc<Self>, stream: UnixStream, params: ConnectParams) -> Result<()> {
        if params.protocol_version != PROTOCOL_VERSION {
            warn!(
                "client {} declares version {} after a {} handshake",
                params.id, params.protocol_version, PROTOCOL_VERSION
            );
        }

        let default_dir = self.config.paths.projects_dir.join(&params.project);
        let project = self
            .registry
            .find_or_create_project(&params.project, default_dir);

        // A relaunched client reconnects under the UUID it was saved with.
        let client = match project.find_client(params.id) {
            Some(existing) => {
                info!("client {} reattached to project {}", params.id, params.project);
                existing
            }
            None => {
                info!(
                    "client {} ({}) joined project {}",
                    params.id, params.class, params.project
                );
                let client = Client::from_connect(&params);
                project.add_client(client.clone());
                client
            }
        };

        let mut conn = Connection::spawn(stream);
        let attachment = client.attach(conn.sender(), conn.closed_token());

        self.finish_restore(&client).await;

        while let Some(inbound) = conn.recv().await {
            match inbound {
                Inbound::Config(config) => {
                    debug!("client {}: config {} ({} bytes)", client.id, config.key, config.value_size());
                    client.store_config(config);
                }
                Inbound::Event(event) => {
                    self.handle_session_event(event).await;
                }
            }
        }
        conn.join().await;

        // Release only our own attachment; if the client already
        // reconnected on another handler, its connection stays up.
        client.detach(attachment);
        info!("client {} disconnected", client.id);
        Ok(())
    }

    /// A control/GUI peer: it only issues session events.
    async fn handle_interface(self: Arc<Self>, stream: UnixStream) -> Result<()> {
        info!("interface peer connected");
        let mut conn = Connection::spawn(stream);
        while let Some(inbound) = conn.recv().await {
            match inbound {
                Inbound::Event(event) => self.handle_session_event(event).await,
                Inbound::Config(config) => {
                    warn!("interface peer sent config {}, ignoring", config.key);
                }
            }
        }
        conn.join().await;
        info!("interface peer disconnected");
        Ok(())
    }

    /// If this client was relaunched from a save, replay its configs and
    /// reconnect its patches now that it is back on the graph.
    async fn finish_restore(&self, client: &Arc<Client>) {
        let saved = self
            .pending_restores
            .lock()
            .expect("restores lock poisoned")
            .remove(&client.id);
        let Some(saved) = saved else { return };

        info!("client {} reappeared, finishing restore", client.id);
        for (key, value) in &saved.configs {
            client.store_config(lashproto::Config::new(key.clone(), value.clone()));
            let replay = CommEvent::Config(lashproto::Config::new(key.clone(), value.clone()));
            if client.send(replay).await.is_err() {
                warn!("client {} closed while replaying configs", client.id);
                return;
            }
        }
        persist::reapply_patches(&saved, &self.snapshot);
    }

    async fn handle_session_event(&self, event: Event) {
        debug!("session event {:?} for project {}", event.kind, event.project);
        match event.kind {
            EventKind::Save => {
                if let Err(e) = self.save(&event.project).await {
                    warn!("save of project {} failed: {e:#}", event.project);
                }
            }
            EventKind::Restore => {
                if let Err(e) = self.restore(&event).await {
                    warn!("restore of project {} failed: {e:#}", event.project);
                }
            }
            EventKind::Quit => self.quit(&event.project).await,
            EventKind::ProjectAdd => {
                let dir = self.config.paths.projects_dir.join(&event.project);
                self.registry.find_or_create_project(&event.project, dir);
            }
            EventKind::ProjectRemove => self.quit(&event.project).await,
            EventKind::ProjectName => {
                if let Some(project) = self.registry.find_project(&event.project) {
                    info!("renaming project {} to {}", event.project, event.string);
                    project.set_name(&event.string);
                }
            }
            EventKind::ProjectDir => {
                if let Some(project) = self.registry.find_project(&event.project) {
                    project.set_directory(event.string.clone().into());
                }
            }
            EventKind::ClientName => {
                if let Some((_, client)) = self.registry.find_client(event.client_id) {
                    client.set_class(&event.string);
                }
            }
            EventKind::Percentage => {
                debug!(
                    "client {} progress: {}%",
                    event.client_id, event.string
                );
            }
        }
    }

    /// Notify every client to dump its state, then capture the project.
    async fn save(&self, name: &str) -> Result<()> {
        let project = self
            .registry
            .find_project(name)
            .with_context(|| format!("no project named {name}"))?;

        for client in project.clients() {
            let notify = CommEvent::Event(
                Event::new(EventKind::Save, name).with_client(client.id),
            );
            if client.send(notify).await.is_err() {
                debug!("client {} not connected, saving last-known state", client.id);
            }
        }

        persist::save_project(&project, &self.snapshot)?;
        Ok(())
    }

    /// Relaunch every saved client of a project through the loader.
    async fn restore(&self, event: &Event) -> Result<()> {
        let dir = if event.string.is_empty() {
            self.config.paths.projects_dir.join(&event.project)
        } else {
            event.string.clone().into()
        };
        let saved = persist::load_project(&dir)?;
        info!(
            "restoring project {} ({} clients) from {}",
            saved.name,
            saved.clients.len(),
            dir.display()
        );

        self.registry.find_or_create_project(&saved.name, dir);
        let server_addr = self.config.paths.socket.display().to_string();

        let mut guard = self.loader.lock().await;
        if guard.is_none() {
            *guard = Some(Loader::fork()?);
        }
        let loader = guard.as_mut().expect("loader just forked");

        for saved_client in &saved.clients {
            let params = persist::exec_params(saved_client, &saved.name, &server_addr);
            match loader.load(&params).await {
                Ok(pid) => {
                    debug!("relaunched client {} as pid {pid}", saved_client.id);
                    self.pending_restores
                        .lock()
                        .expect("restores lock poisoned")
                        .insert(saved_client.id, saved_client.clone());
                }
                Err(e) => warn!("could not relaunch client {}: {e}", saved_client.id),
            }
        }
        Ok(())
    }

    /// Tell every client to quit, then tear the project down. Clients are
    /// destroyed before the project itself; each destruction scrubs the
    /// client's cached patches while the project is still live.
    async fn quit(&self, name: &str) {
        let Some(project) = self.registry.find_project(name) else {
            debug!("quit for unknown project {name}");
            return;
        };

        for client in project.clients() {
            let notify =
                CommEvent::Event(Event::new(EventKind::Quit, name).with_client(client.id));
            let _ = client.send(notify).await;
        }

        self.registry.destroy_project(name, |_, client| {
            self.snapshot.remove_client(client.id);
        });
    }
}

/// Bind the daemon socket: create the parent directory, unlink a stale
/// socket from a previous run, and restrict to owner-only access.
fn bind_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("failed to bind {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    Ok(listener)
}
