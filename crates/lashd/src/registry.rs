//! In-daemon model of clients and the projects they belong to.
//!
//! The registry is shared by the accept loop (adding clients) and the
//! session-event path (removing/destroying them). Structural mutation takes
//! the write side of an `RwLock`; read-only enumeration (rendering a client
//! list for a GUI peer) runs concurrently on the read side.
//!
//! Client connections are held through [`Refcounted`] so that no component
//! assumes sole ownership: the registry holds one reference, a pending save
//! or patch operation can retain another, and the last releaser cancels the
//! connection pair.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lashproto::{CommEvent, Config, ConnectParams, EventSender, SendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::refcount::Refcounted;

/// Client flag: already captured in the session file.
pub const CLIENT_SAVED: u32 = 1 << 0;

/// The live ends of a client's connection pair.
#[derive(Clone)]
pub struct ConnHandle {
    pub sender: EventSender,
    pub closed: CancellationToken,
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle")
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

/// The client's connection slot. Each attach bumps the generation; a
/// handler can only release the attachment it made, so a handler that
/// lingers past a reconnect cannot tear down its successor.
#[derive(Default)]
struct ConnSlot {
    generation: u64,
    attached: Option<Refcounted<ConnHandle>>,
}

/// A running (or last-known) audio application tracked by the daemon.
pub struct Client {
    pub id: Uuid,
    class: RwLock<String>,
    flags: AtomicU32,
    argv: RwLock<Vec<String>>,
    working_dir: RwLock<String>,
    /// Last-known configs, retained across disconnects.
    configs: RwLock<BTreeMap<String, Vec<u8>>>,
    conn: Mutex<ConnSlot>,
}

impl Client {
    pub fn from_connect(params: &ConnectParams) -> Arc<Self> {
        Arc::new(Self {
            id: params.id,
            class: RwLock::new(params.class.clone()),
            flags: AtomicU32::new(params.flags),
            argv: RwLock::new(params.argv.clone()),
            working_dir: RwLock::new(params.working_dir.clone()),
            configs: RwLock::new(BTreeMap::new()),
            conn: Mutex::new(ConnSlot::default()),
        })
    }

    /// Attach a live connection, superseding any stale one. The registry's
    /// reference is the initial count of one; the destructor cancels the
    /// pair when the last holder lets go. Returns the attachment id the
    /// handler must pass back to [`Client::detach`].
    pub fn attach(&self, sender: EventSender, closed: CancellationToken) -> u64 {
        let cancel = closed.clone();
        let handle = Refcounted::new(1, ConnHandle { sender, closed }, move |_| {
            cancel.cancel();
        });
        let mut slot = self.conn.lock().expect("conn lock poisoned");
        if let Some(old) = slot.attached.take() {
            // Reconnect replaces a stale attachment.
            old.del_ref();
        }
        slot.generation += 1;
        slot.attached = Some(handle);
        slot.generation
    }

    /// Drop the registry's reference for the attachment a handler made.
    /// A no-op when a newer connection has already replaced it. The
    /// connection winds down once any in-flight retainers release theirs.
    pub fn detach(&self, attachment: u64) {
        let mut slot = self.conn.lock().expect("conn lock poisoned");
        if slot.generation != attachment {
            return;
        }
        if let Some(handle) = slot.attached.take() {
            handle.del_ref();
        }
    }

    /// Unconditionally release whatever attachment is current. Only for
    /// teardown paths where no newer connection can be racing in.
    pub fn detach_current(&self) {
        let mut slot = self.conn.lock().expect("conn lock poisoned");
        if let Some(handle) = slot.attached.take() {
            handle.del_ref();
        }
    }

    /// Retain the connection for an out-of-registry operation. The caller
    /// must balance with `del_ref`.
    pub fn retain_conn(&self) -> Option<Refcounted<ConnHandle>> {
        let slot = self.conn.lock().expect("conn lock poisoned");
        slot.attached.as_ref().map(|handle| {
            handle.add_ref();
            handle.clone()
        })
    }

    pub fn is_connected(&self) -> bool {
        self.conn
            .lock()
            .expect("conn lock poisoned")
            .attached
            .is_some()
    }

    /// Push an event to the client, if it is connected.
    pub async fn send(&self, event: CommEvent) -> Result<(), SendError> {
        let Some(handle) = self.retain_conn() else {
            return Err(SendError::Closed);
        };
        let result = handle.get().sender.send(event).await;
        handle.del_ref();
        result
    }

    pub fn store_config(&self, config: Config) {
        self.configs
            .write()
            .expect("configs lock poisoned")
            .insert(config.key, config.value);
    }

    pub fn configs(&self) -> BTreeMap<String, Vec<u8>> {
        self.configs.read().expect("configs lock poisoned").clone()
    }

    pub fn class(&self) -> String {
        self.class.read().expect("class lock poisoned").clone()
    }

    pub fn set_class(&self, class: impl Into<String>) {
        *self.class.write().expect("class lock poisoned") = class.into();
    }

    pub fn argv(&self) -> Vec<String> {
        self.argv.read().expect("argv lock poisoned").clone()
    }

    pub fn working_dir(&self) -> String {
        self.working_dir.read().expect("working_dir lock poisoned").clone()
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("class", &self.class())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// A named grouping of clients with a save directory.
pub struct Project {
    name: RwLock<String>,
    directory: RwLock<PathBuf>,
    /// Insertion order is add order and is preserved through saves.
    clients: RwLock<Vec<Arc<Client>>>,
}

impl Project {
    pub fn new(name: impl Into<String>, directory: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            name: RwLock::new(name.into()),
            directory: RwLock::new(directory),
            clients: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> String {
        self.name.read().expect("name lock poisoned").clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write().expect("name lock poisoned") = name.into();
    }

    pub fn directory(&self) -> PathBuf {
        self.directory.read().expect("directory lock poisoned").clone()
    }

    pub fn set_directory(&self, dir: PathBuf) {
        *self.directory.write().expect("directory lock poisoned") = dir;
    }

    pub fn add_client(&self, client: Arc<Client>) {
        debug!("project {}: adding client {}", self.name(), client.id);
        self.clients
            .write()
            .expect("clients lock poisoned")
            .push(client);
    }

    /// Remove a client, returning it so the caller decides whether to also
    /// destroy it. Removal alone does not close the socket.
    pub fn remove_client(&self, id: Uuid) -> Option<Arc<Client>> {
        let mut clients = self.clients.write().expect("clients lock poisoned");
        let idx = clients.iter().position(|c| c.id == id)?;
        Some(clients.remove(idx))
    }

    pub fn find_client(&self, id: Uuid) -> Option<Arc<Client>> {
        self.clients
            .read()
            .expect("clients lock poisoned")
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Snapshot of the client list in insertion order.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().expect("clients lock poisoned").clone()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().expect("clients lock poisoned").len()
    }
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("name", &self.name())
            .field("clients", &self.client_count())
            .finish()
    }
}

/// The daemon-wide project/client registry.
#[derive(Default)]
pub struct Registry {
    projects: RwLock<Vec<Arc<Project>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_project(&self, name: impl Into<String>, directory: PathBuf) -> Arc<Project> {
        let project = Project::new(name, directory);
        info!("created project {}", project.name());
        self.projects
            .write()
            .expect("projects lock poisoned")
            .push(project.clone());
        project
    }

    pub fn find_project(&self, name: &str) -> Option<Arc<Project>> {
        self.projects
            .read()
            .expect("projects lock poisoned")
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    pub fn find_or_create_project(&self, name: &str, default_dir: PathBuf) -> Arc<Project> {
        // Double-checked under the write lock so two racing connects don't
        // create the project twice.
        let mut projects = self.projects.write().expect("projects lock poisoned");
        if let Some(existing) = projects.iter().find(|p| p.name() == name) {
            return existing.clone();
        }
        let project = Project::new(name, default_dir);
        info!("created project {}", project.name());
        projects.push(project.clone());
        project
    }

    pub fn projects(&self) -> Vec<Arc<Project>> {
        self.projects.read().expect("projects lock poisoned").clone()
    }

    /// Find a client anywhere in the registry.
    pub fn find_client(&self, id: Uuid) -> Option<(Arc<Project>, Arc<Client>)> {
        for project in self.projects() {
            if let Some(client) = project.find_client(id) {
                return Some((project, client));
            }
        }
        None
    }

    /// Destroy a project: every contained client is destroyed first (its
    /// connection released), and only then is the project dropped from the
    /// registry. `on_client_destroyed` runs per client while the project is
    /// still live, so teardown hooks (removing graph patches) can reach it.
    pub fn destroy_project(
        &self,
        name: &str,
        mut on_client_destroyed: impl FnMut(&Project, &Client),
    ) -> bool {
        let Some(project) = self.find_project(name) else {
            return false;
        };

        // Drain clients in insertion order. The project stays registered
        // and alive until every client is gone.
        loop {
            let client = {
                let mut clients = project.clients.write().expect("clients lock poisoned");
                if clients.is_empty() {
                    break;
                }
                clients.remove(0)
            };
            debug!("destroying client {} of project {name}", client.id);
            on_client_destroyed(&project, &client);
            client.detach_current();
        }

        let mut projects = self.projects.write().expect("projects lock poisoned");
        let before = projects.len();
        projects.retain(|p| !Arc::ptr_eq(p, &project));
        if projects.len() == before {
            warn!("project {name} vanished during teardown");
        }
        info!("destroyed project {name}");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(project: &str, class: &str) -> ConnectParams {
        ConnectParams {
            protocol_version: lashproto::PROTOCOL_VERSION,
            flags: 0,
            project: project.into(),
            working_dir: "/tmp".into(),
            class: class.into(),
            id: Uuid::new_v4(),
            argv: vec![class.to_string()],
        }
    }

    #[test]
    fn add_find_remove() {
        let registry = Registry::new();
        let project = registry.create_project("demo", PathBuf::from("/tmp/demo"));
        let client = Client::from_connect(&params("demo", "synth"));
        let id = client.id;
        project.add_client(client);

        assert!(project.find_client(id).is_some());
        assert!(project.find_client(Uuid::new_v4()).is_none());

        let removed = project.remove_client(id).unwrap();
        assert_eq!(removed.id, id);
        assert!(project.remove_client(id).is_none());
    }

    #[test]
    fn insertion_order_is_preserved() {
        let registry = Registry::new();
        let project = registry.create_project("demo", PathBuf::from("/tmp/demo"));
        let mut ids = Vec::new();
        for class in ["synth", "sampler", "mixer"] {
            let client = Client::from_connect(&params("demo", class));
            ids.push(client.id);
            project.add_client(client);
        }
        let listed: Vec<Uuid> = project.clients().iter().map(|c| c.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn find_or_create_is_idempotent() {
        let registry = Registry::new();
        let a = registry.find_or_create_project("demo", PathBuf::from("/tmp/demo"));
        let b = registry.find_or_create_project("demo", PathBuf::from("/elsewhere"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.projects().len(), 1);
    }

    #[test]
    fn cascading_teardown_destroys_clients_before_project() {
        let registry = Registry::new();
        let project = registry.create_project("demo", PathBuf::from("/tmp/demo"));
        let mut expected = Vec::new();
        for class in ["a", "b", "c"] {
            let client = Client::from_connect(&params("demo", class));
            expected.push(client.id);
            project.add_client(client);
        }

        let mut destroyed = Vec::new();
        let ok = registry.destroy_project("demo", |proj, client| {
            // The project must still be reachable from the hook.
            assert_eq!(proj.name(), "demo");
            destroyed.push(client.id);
        });
        assert!(ok);
        assert_eq!(destroyed, expected);
        assert!(registry.find_project("demo").is_none());
    }

    #[test]
    fn destroy_unknown_project_reports_false() {
        let registry = Registry::new();
        assert!(!registry.destroy_project("ghost", |_, _| {}));
    }

    #[test]
    fn disconnected_client_keeps_last_known_state() {
        let client = Client::from_connect(&params("demo", "synth"));
        client.store_config(Config::new("gain", vec![0, 0, 128, 63]));
        client.detach_current(); // no-op, never attached
        assert!(!client.is_connected());
        assert_eq!(client.configs()["gain"], vec![0, 0, 128, 63]);
        assert_eq!(client.class(), "synth");
    }

    #[tokio::test]
    async fn last_retainer_cancels_the_connection() {
        let (stream, _peer) = tokio::io::duplex(4096);
        let conn = lashproto::Connection::spawn(stream);
        let token = conn.closed_token();

        let client = Client::from_connect(&params("demo", "synth"));
        let attachment = client.attach(conn.sender(), token.clone());

        let retained = client.retain_conn().unwrap();
        client.detach(attachment);
        // A pending operation still holds the connection open.
        assert!(!token.is_cancelled());

        retained.del_ref();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn stale_detach_spares_a_reattached_connection() {
        let client = Client::from_connect(&params("demo", "synth"));

        let (first_stream, _first_peer) = tokio::io::duplex(4096);
        let first_conn = lashproto::Connection::spawn(first_stream);
        let first = client.attach(first_conn.sender(), first_conn.closed_token());

        // The client dropped and reconnected before the first handler
        // reached its detach.
        let (second_stream, _second_peer) = tokio::io::duplex(4096);
        let second_conn = lashproto::Connection::spawn(second_stream);
        let second_token = second_conn.closed_token();
        let second = client.attach(second_conn.sender(), second_token.clone());

        client.detach(first);
        assert!(client.is_connected());
        assert!(!second_token.is_cancelled());

        client.detach(second);
        assert!(!client.is_connected());
        assert!(second_token.is_cancelled());
    }
}
