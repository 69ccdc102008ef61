//! lashd - the LASH session daemon.
//!
//! Tracks running audio-application clients, groups them into projects,
//! and saves/restores a project's running state (programs, arguments,
//! graph patches) across process restarts.
//!
//! The daemon side of the system: the wire protocol and connection pair
//! live in `lashproto`, configuration in `lashconf`.

pub mod graph;
pub mod loader;
pub mod persist;
pub mod refcount;
pub mod registry;
pub mod server;

pub use graph::{GraphManager, InMemoryGraph, Patch, PatchSnapshot};
pub use loader::{Loader, LoaderChannel, LoaderError};
pub use refcount::Refcounted;
pub use registry::{Client, Project, Registry, CLIENT_SAVED};
pub use server::SessionServer;
