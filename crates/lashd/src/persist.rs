//! Project persistence.
//!
//! A project directory holds `project.json`: the client list (UUID, class,
//! argv, working directory), each client's last-known configs, and the
//! graph patches captured at save time. Field names map 1:1 to the live
//! registry types so a restore can rebuild ExecParams directly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use lashproto::ExecParams;

use crate::graph::{Patch, PatchSnapshot};
use crate::registry::{Project, CLIENT_SAVED};

const PROJECT_FILE: &str = "project.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedClient {
    pub id: Uuid,
    pub class: String,
    pub argv: Vec<String>,
    pub working_dir: String,
    pub configs: BTreeMap<String, Vec<u8>>,
    pub patches: Vec<Patch>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedProject {
    pub name: String,
    pub saved_at: DateTime<Utc>,
    pub clients: Vec<SavedClient>,
}

/// Capture a project's running state into its directory.
///
/// Clients are written in insertion order; each gets its patches snapshotted
/// through the graph adapter and its `SAVED` flag set.
pub fn save_project(project: &Project, snapshot: &PatchSnapshot) -> Result<PathBuf> {
    let dir = project.directory();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create project dir {}", dir.display()))?;

    let mut clients = Vec::new();
    for client in project.clients() {
        let patches = snapshot.get_client_patches(client.id).unwrap_or_default();
        clients.push(SavedClient {
            id: client.id,
            class: client.class(),
            argv: client.argv(),
            working_dir: client.working_dir(),
            configs: client.configs(),
            patches,
        });
        client.set_flag(CLIENT_SAVED);
    }

    let saved = SavedProject {
        name: project.name(),
        saved_at: Utc::now(),
        clients,
    };

    let path = dir.join(PROJECT_FILE);
    let json = serde_json::to_vec_pretty(&saved).context("failed to encode project state")?;
    std::fs::write(&path, json)
        .with_context(|| format!("failed to write {}", path.display()))?;

    info!(
        "saved project {} ({} clients) to {}",
        saved.name,
        saved.clients.len(),
        path.display()
    );
    Ok(path)
}

/// Read a saved project back from its directory.
pub fn load_project(dir: &Path) -> Result<SavedProject> {
    let path = dir.join(PROJECT_FILE);
    let json = std::fs::read(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&json)
        .with_context(|| format!("failed to parse {}", path.display()))
}

/// Build the relaunch payload for one saved client.
pub fn exec_params(saved: &SavedClient, project: &str, server: &str) -> ExecParams {
    ExecParams {
        working_dir: saved.working_dir.clone(),
        server: server.to_string(),
        project: project.to_string(),
        argv: saved.argv.clone(),
        id: saved.id,
    }
}

/// Replay a saved client's patches once it has reappeared on the graph.
pub fn reapply_patches(saved: &SavedClient, snapshot: &PatchSnapshot) -> usize {
    let applied = snapshot.reapply(&saved.patches);
    debug!(
        "reapplied {}/{} patches for client {}",
        applied,
        saved.patches.len(),
        saved.id
    );
    applied
}
