//! Durable project registry
//!
//! Single source of truth for everything the proxy routes to: a map from
//! subdomain to project, persisted as a JSON array. Every mutation rewrites
//! the whole snapshot through a temp file and rename, so the store is always
//! a complete document. External edits are picked up by a file watcher.

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Highest port handed out by `next_free_port`
const PORT_CEILING: u16 = 9000;

/// Lifecycle status of a registered project
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    /// Registered but never probed
    Registered,
    /// Seen listening on its port
    Active,
    /// Last health check passed
    Healthy,
    /// Last health check failed
    Unhealthy,
    /// Status missing from the store or not yet determined
    #[default]
    Unknown,
}

impl ProjectStatus {
    /// Statuses that make a project routable/listable as active
    pub fn is_active(&self) -> bool {
        matches!(self, ProjectStatus::Active | ProjectStatus::Healthy)
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectStatus::Registered => "registered",
            ProjectStatus::Active => "active",
            ProjectStatus::Healthy => "healthy",
            ProjectStatus::Unhealthy => "unhealthy",
            ProjectStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A service the proxy routes to, keyed by its subdomain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub name: String,
    pub subdomain: String,
    pub port: u16,
    /// Free-form kind tag: "web", "api", "service", ...
    #[serde(rename = "type", default = "default_project_type")]
    pub project_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
    /// Upstream speaks HTTPS itself (rare; informational)
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: ProjectStatus,
    pub registered_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

fn default_project_type() -> String {
    "web".to_string()
}

fn default_health_check_path() -> String {
    "/".to_string()
}

/// Fields accepted when registering a new project
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub port: u16,
    #[serde(rename = "type")]
    pub project_type: Option<String>,
    pub description: Option<String>,
    pub health_check_path: Option<String>,
    pub tls_enabled: Option<bool>,
    pub auto_start: Option<bool>,
    pub tags: Option<Vec<String>>,
}

/// Partial update for an existing project. The subdomain is the project's
/// identity and cannot be patched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub port: Option<u16>,
    #[serde(rename = "type")]
    pub project_type: Option<String>,
    pub description: Option<String>,
    pub health_check_path: Option<String>,
    pub tls_enabled: Option<bool>,
    pub auto_start: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub status: Option<ProjectStatus>,
}

/// Registry-wide counters for the stats endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub status_counts: HashMap<String, usize>,
    pub type_counts: HashMap<String, usize>,
}

/// The project store. Mutations hold the write lock across the in-memory
/// change and the snapshot write, so two writers never interleave mid-file.
pub struct Registry {
    store_path: PathBuf,
    backups: bool,
    max_backups: usize,
    projects: RwLock<HashMap<String, Project>>,
}

impl Registry {
    /// Open the store at the configured path, creating an empty one (and its
    /// parent directory) if nothing is there yet. A present-but-unreadable
    /// store is an error, not an empty registry.
    pub fn open(config: &RegistryConfig) -> anyhow::Result<Self> {
        let store_path = PathBuf::from(&config.store_path);

        if let Some(parent) = store_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let registry = Self {
            store_path: store_path.clone(),
            backups: config.backups,
            max_backups: config.max_backups,
            projects: RwLock::new(HashMap::new()),
        };

        if store_path.exists() {
            let map = load_store(&store_path)?;
            info!(
                projects = map.len(),
                path = %store_path.display(),
                "Registry loaded"
            );
            *registry.projects.write() = map;
        } else {
            let projects = registry.projects.write();
            registry.persist_locked(&projects)?;
            info!(path = %store_path.display(), "Registry created");
        }

        Ok(registry)
    }

    /// Register a new project. Fails with a validation error when name,
    /// subdomain or port are missing, and with a conflict when the subdomain
    /// is taken (the existing entry is left untouched).
    pub fn register(&self, req: RegistrationRequest) -> Result<Project, RegistryError> {
        let mut missing = Vec::new();
        if req.name.trim().is_empty() {
            missing.push("name");
        }
        if req.subdomain.trim().is_empty() {
            missing.push("subdomain");
        }
        if req.port == 0 {
            missing.push("port");
        }
        if !missing.is_empty() {
            return Err(RegistryError::Validation(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }

        let mut projects = self.projects.write();
        if projects.contains_key(&req.subdomain) {
            return Err(RegistryError::Conflict(req.subdomain));
        }

        let now = Utc::now();
        let project = Project {
            name: req.name,
            subdomain: req.subdomain,
            port: req.port,
            project_type: req.project_type.unwrap_or_else(default_project_type),
            description: req.description.unwrap_or_default(),
            health_check_path: req.health_check_path.unwrap_or_else(default_health_check_path),
            tls_enabled: req.tls_enabled.unwrap_or(false),
            auto_start: req.auto_start.unwrap_or(false),
            tags: req.tags.unwrap_or_default(),
            status: ProjectStatus::Registered,
            registered_at: now,
            last_update: now,
        };

        projects.insert(project.subdomain.clone(), project.clone());
        self.persist_locked(&projects)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        info!(
            subdomain = %project.subdomain,
            port = project.port,
            "Project registered"
        );
        Ok(project)
    }

    /// Remove a project, returning the removed record.
    pub fn unregister(&self, subdomain: &str) -> Result<Project, RegistryError> {
        let mut projects = self.projects.write();
        let project = projects
            .remove(subdomain)
            .ok_or_else(|| RegistryError::NotFound(subdomain.to_string()))?;
        self.persist_locked(&projects)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        info!(subdomain = %project.subdomain, "Project unregistered");
        Ok(project)
    }

    /// Merge the set fields of a patch into an existing project.
    pub fn update(&self, subdomain: &str, patch: ProjectPatch) -> Result<Project, RegistryError> {
        if patch.port == Some(0) {
            return Err(RegistryError::Validation(
                "'port' must be greater than 0".to_string(),
            ));
        }

        let mut projects = self.projects.write();
        let updated = match projects.get_mut(subdomain) {
            Some(project) => {
                if let Some(name) = patch.name {
                    project.name = name;
                }
                if let Some(port) = patch.port {
                    project.port = port;
                }
                if let Some(project_type) = patch.project_type {
                    project.project_type = project_type;
                }
                if let Some(description) = patch.description {
                    project.description = description;
                }
                if let Some(path) = patch.health_check_path {
                    project.health_check_path = path;
                }
                if let Some(tls) = patch.tls_enabled {
                    project.tls_enabled = tls;
                }
                if let Some(auto) = patch.auto_start {
                    project.auto_start = auto;
                }
                if let Some(tags) = patch.tags {
                    project.tags = tags;
                }
                if let Some(status) = patch.status {
                    project.status = status;
                }
                project.last_update = Utc::now();
                project.clone()
            }
            None => return Err(RegistryError::NotFound(subdomain.to_string())),
        };
        self.persist_locked(&projects)
            .map_err(|e| RegistryError::Storage(e.to_string()))?;

        info!(subdomain, "Project updated");
        Ok(updated)
    }

    /// Best-effort status write from the health and discovery loops. Returns
    /// false when the project no longer exists. Persistence failures are
    /// logged here rather than propagated so a full disk cannot take down
    /// the check loop.
    pub fn set_status(&self, subdomain: &str, status: ProjectStatus) -> bool {
        let mut projects = self.projects.write();
        match projects.get_mut(subdomain) {
            Some(project) => {
                if project.status == status {
                    // Health passes call this every minute; skip the disk
                    // write when nothing changed.
                    return true;
                }
                project.status = status;
                project.last_update = Utc::now();
            }
            None => return false,
        }
        if let Err(e) = self.persist_locked(&projects) {
            error!(error = %e, subdomain, "Failed to persist status change");
        }
        true
    }

    pub fn get(&self, subdomain: &str) -> Option<Project> {
        self.projects.read().get(subdomain).cloned()
    }

    /// All projects, ordered by subdomain.
    pub fn list(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self.projects.read().values().cloned().collect();
        projects.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        projects
    }

    /// Projects whose status makes them routable (active or healthy).
    pub fn list_active(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self
            .projects
            .read()
            .values()
            .filter(|p| p.status.is_active())
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        projects
    }

    pub fn list_by_type(&self, project_type: &str) -> Vec<Project> {
        let mut projects: Vec<Project> = self
            .projects
            .read()
            .values()
            .filter(|p| p.project_type == project_type)
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        projects
    }

    pub fn list_by_tag(&self, tag: &str) -> Vec<Project> {
        let mut projects: Vec<Project> = self
            .projects
            .read()
            .values()
            .filter(|p| p.tags.iter().any(|t| t == tag))
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        projects
    }

    pub fn find_by_port(&self, port: u16) -> Option<Project> {
        self.projects
            .read()
            .values()
            .find(|p| p.port == port)
            .cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Project> {
        self.projects
            .read()
            .values()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Ports are advisory: registration never fails on a collision, but
    /// callers can check before picking one.
    pub fn is_port_in_use(&self, port: u16) -> bool {
        self.projects.read().values().any(|p| p.port == port)
    }

    /// First unclaimed port in [from, 9000], or None when the range is full.
    pub fn next_free_port(&self, from: u16) -> Option<u16> {
        let projects = self.projects.read();
        (from..=PORT_CEILING).find(|port| !projects.values().any(|p| p.port == *port))
    }

    pub fn len(&self) -> usize {
        self.projects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.read().is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let projects = self.projects.read();
        let mut status_counts: HashMap<String, usize> = HashMap::new();
        let mut type_counts: HashMap<String, usize> = HashMap::new();
        for project in projects.values() {
            *status_counts.entry(project.status.to_string()).or_insert(0) += 1;
            *type_counts.entry(project.project_type.clone()).or_insert(0) += 1;
        }
        RegistryStats {
            total: projects.len(),
            status_counts,
            type_counts,
        }
    }

    /// Re-read the store file and swap the whole map. Readers see the old
    /// state or the fully loaded new one, never a partial mix. A broken file
    /// leaves current state in place and returns the parse error.
    pub fn reload(&self) -> anyhow::Result<usize> {
        let map = load_store(&self.store_path)?;
        let count = map.len();
        *self.projects.write() = map;
        Ok(count)
    }

    /// Watch the store file and reload on external edits. The watcher runs
    /// until shutdown; events for our own snapshot writes also land here,
    /// which is harmless because reload parses what we just wrote.
    pub fn spawn_watcher(
        self: &std::sync::Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        use notify::{RecursiveMode, Watcher};

        let (tx, mut rx) = mpsc::channel::<notify::Event>(16);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.blocking_send(event);
                }
            }
        })?;

        // Watch the directory, not the file: editors and our own atomic
        // writes replace the file, which would orphan a file-level watch.
        let dir = match self.store_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let registry = self.clone();
        let store_name = self
            .store_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();

        let handle = tokio::spawn(async move {
            // Moved in so it lives as long as the task
            let _watcher = watcher;
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        if !event
                            .paths
                            .iter()
                            .any(|p| p.file_name() == Some(store_name.as_os_str()))
                        {
                            continue;
                        }
                        // Editors write in bursts; let them finish, then
                        // drain whatever queued up.
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                        while rx.try_recv().is_ok() {}
                        match registry.reload() {
                            Ok(count) => {
                                info!(projects = count, "Registry reloaded from disk")
                            }
                            Err(e) => {
                                warn!(error = %e, "Registry reload failed, keeping current state")
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(handle)
    }

    /// Write the full snapshot: optional backup of the previous file, then
    /// temp file + rename so the store is never observed half-written.
    /// Callers hold the write lock, which serializes snapshots.
    fn persist_locked(&self, projects: &HashMap<String, Project>) -> anyhow::Result<()> {
        if self.backups && self.store_path.exists() {
            self.rotate_backups()?;
        }

        let mut list: Vec<&Project> = projects.values().collect();
        list.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        let json = serde_json::to_string_pretty(&list)?;

        let dir = match self.store_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(&self.store_path)?;
        Ok(())
    }

    fn rotate_backups(&self) -> anyhow::Result<()> {
        let backup_path = self
            .store_path
            .with_extension(format!("json.backup.{}", Utc::now().timestamp_millis()));
        std::fs::copy(&self.store_path, &backup_path)?;

        // Prune the oldest beyond the cap. Millisecond names sort
        // chronologically as strings.
        let dir = match self.store_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let prefix = format!(
            "{}.backup.",
            self.store_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );
        let mut backups: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .map(|n| n.to_string_lossy().starts_with(&prefix))
                    .unwrap_or(false)
            })
            .collect();
        backups.sort();
        while backups.len() > self.max_backups {
            let oldest = backups.remove(0);
            if let Err(e) = std::fs::remove_file(&oldest) {
                warn!(error = %e, path = %oldest.display(), "Failed to prune backup");
            }
        }
        Ok(())
    }
}

fn load_store(path: &Path) -> anyhow::Result<HashMap<String, Project>> {
    let content = std::fs::read_to_string(path)?;
    let list: Vec<Project> = serde_json::from_str(&content)?;
    let mut map = HashMap::with_capacity(list.len());
    for project in list {
        map.insert(project.subdomain.clone(), project);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> RegistryConfig {
        RegistryConfig {
            store_path: dir
                .path()
                .join("projects.json")
                .to_string_lossy()
                .into_owned(),
            watch: false,
            backups: true,
            max_backups: 3,
        }
    }

    fn request(name: &str, subdomain: &str, port: u16) -> RegistrationRequest {
        RegistrationRequest {
            name: name.to_string(),
            subdomain: subdomain.to_string(),
            port,
            ..Default::default()
        }
    }

    #[test]
    fn test_register_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&test_config(&dir)).unwrap();

        let project = registry.register(request("My App", "app", 3000)).unwrap();
        assert_eq!(project.status, ProjectStatus::Registered);
        assert_eq!(project.project_type, "web");
        assert_eq!(project.health_check_path, "/");

        let fetched = registry.get("app").unwrap();
        assert_eq!(fetched, project);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_register_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&test_config(&dir)).unwrap();

        let err = registry
            .register(RegistrationRequest::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Missing required fields: name, subdomain, port"
        );

        let err = registry.register(request("App", "", 3000)).unwrap_err();
        assert_eq!(err.to_string(), "Missing required fields: subdomain");
    }

    #[test]
    fn test_duplicate_subdomain_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&test_config(&dir)).unwrap();

        registry.register(request("First", "app", 3000)).unwrap();
        let err = registry.register(request("Second", "app", 4000)).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));

        // Original registration untouched
        let project = registry.get("app").unwrap();
        assert_eq!(project.name, "First");
        assert_eq!(project.port, 3000);
    }

    #[test]
    fn test_unregister() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&test_config(&dir)).unwrap();

        registry.register(request("App", "app", 3000)).unwrap();
        let removed = registry.unregister("app").unwrap();
        assert_eq!(removed.name, "App");
        assert!(registry.get("app").is_none());

        let err = registry.unregister("app").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn test_update_merges_patch() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&test_config(&dir)).unwrap();

        registry.register(request("App", "app", 3000)).unwrap();
        let updated = registry
            .update(
                "app",
                ProjectPatch {
                    port: Some(3100),
                    description: Some("now with docs".to_string()),
                    tags: Some(vec!["prod".to_string()]),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.port, 3100);
        assert_eq!(updated.description, "now with docs");
        assert_eq!(updated.tags, vec!["prod"]);
        // Untouched fields survive
        assert_eq!(updated.name, "App");
        assert_eq!(updated.subdomain, "app");
    }

    #[test]
    fn test_update_unknown_and_zero_port() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&test_config(&dir)).unwrap();

        let err = registry.update("ghost", ProjectPatch::default()).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));

        registry.register(request("App", "app", 3000)).unwrap();
        let err = registry
            .update(
                "app",
                ProjectPatch {
                    port: Some(0),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
    }

    #[test]
    fn test_set_status() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&test_config(&dir)).unwrap();

        registry.register(request("App", "app", 3000)).unwrap();
        assert!(registry.set_status("app", ProjectStatus::Healthy));
        assert_eq!(registry.get("app").unwrap().status, ProjectStatus::Healthy);

        assert!(!registry.set_status("ghost", ProjectStatus::Healthy));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);

        {
            let registry = Registry::open(&config).unwrap();
            registry.register(request("App", "app", 3000)).unwrap();
            registry.set_status("app", ProjectStatus::Healthy);
        }

        let reopened = Registry::open(&config).unwrap();
        let project = reopened.get("app").unwrap();
        assert_eq!(project.name, "App");
        assert_eq!(project.status, ProjectStatus::Healthy);
    }

    #[test]
    fn test_load_defaults_missing_status() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        std::fs::write(
            &config.store_path,
            r#"[{
                "name": "Legacy",
                "subdomain": "legacy",
                "port": 3000,
                "registeredAt": "2026-01-01T00:00:00Z",
                "lastUpdate": "2026-01-01T00:00:00Z"
            }]"#,
        )
        .unwrap();

        let registry = Registry::open(&config).unwrap();
        let project = registry.get("legacy").unwrap();
        assert_eq!(project.status, ProjectStatus::Unknown);
        assert_eq!(project.project_type, "web");
        assert_eq!(project.health_check_path, "/");
        assert!(!project.tls_enabled);
    }

    #[test]
    fn test_open_rejects_corrupt_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.store_path, "{not json").unwrap();
        assert!(Registry::open(&config).is_err());
    }

    #[test]
    fn test_backup_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let registry = Registry::open(&config).unwrap();

        for i in 0..8u16 {
            registry
                .register(request(&format!("App {i}"), &format!("app{i}"), 3000 + i))
                .unwrap();
            // Millisecond backup names need distinct timestamps
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("projects.json.backup.")
            })
            .count();
        assert!(backups <= 3, "expected at most 3 backups, found {backups}");
        assert!(backups > 0);
    }

    #[test]
    fn test_list_filters() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&test_config(&dir)).unwrap();

        let mut api = request("API", "api", 3000);
        api.project_type = Some("api".to_string());
        api.tags = Some(vec!["internal".to_string()]);
        registry.register(api).unwrap();
        registry.register(request("Web", "web", 3001)).unwrap();
        registry.set_status("web", ProjectStatus::Active);

        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.list_by_type("api").len(), 1);
        assert_eq!(registry.list_by_type("web").len(), 1);
        assert_eq!(registry.list_by_tag("internal").len(), 1);
        assert_eq!(registry.list_by_tag("nope").len(), 0);

        let active = registry.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].subdomain, "web");
    }

    #[test]
    fn test_ports() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&test_config(&dir)).unwrap();

        registry.register(request("A", "a", 3001)).unwrap();
        registry.register(request("B", "b", 3002)).unwrap();

        assert!(registry.is_port_in_use(3001));
        assert!(!registry.is_port_in_use(3003));
        assert_eq!(registry.find_by_port(3002).unwrap().subdomain, "b");
        assert_eq!(registry.next_free_port(3001), Some(3003));

        registry.register(request("Top", "top", 9000)).unwrap();
        assert_eq!(registry.next_free_port(9000), None);
    }

    #[test]
    fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::open(&test_config(&dir)).unwrap();

        registry.register(request("A", "a", 3001)).unwrap();
        registry.register(request("B", "b", 3002)).unwrap();
        registry.set_status("a", ProjectStatus::Healthy);

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.status_counts.get("healthy"), Some(&1));
        assert_eq!(stats.status_counts.get("registered"), Some(&1));
        assert_eq!(stats.type_counts.get("web"), Some(&2));
    }

    #[test]
    fn test_reload_picks_up_external_edit() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let registry = Registry::open(&config).unwrap();
        registry.register(request("App", "app", 3000)).unwrap();

        std::fs::write(
            &config.store_path,
            r#"[{
                "name": "Edited",
                "subdomain": "edited",
                "port": 4000,
                "status": "active",
                "registeredAt": "2026-01-01T00:00:00Z",
                "lastUpdate": "2026-01-01T00:00:00Z"
            }]"#,
        )
        .unwrap();

        let count = registry.reload().unwrap();
        assert_eq!(count, 1);
        assert!(registry.get("app").is_none());
        assert_eq!(registry.get("edited").unwrap().status, ProjectStatus::Active);
    }

    #[test]
    fn test_reload_bad_json_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let registry = Registry::open(&config).unwrap();
        registry.register(request("App", "app", 3000)).unwrap();

        std::fs::write(&config.store_path, "not json at all").unwrap();
        assert!(registry.reload().is_err());
        assert!(registry.get("app").is_some());
    }

    #[test]
    fn test_wire_format() {
        let now = Utc::now();
        let project = Project {
            name: "App".to_string(),
            subdomain: "app".to_string(),
            port: 3000,
            project_type: "api".to_string(),
            description: String::new(),
            health_check_path: "/health".to_string(),
            tls_enabled: true,
            auto_start: false,
            tags: vec![],
            status: ProjectStatus::Healthy,
            registered_at: now,
            last_update: now,
        };

        let json = serde_json::to_string(&project).unwrap();
        assert!(json.contains("\"type\":\"api\""));
        assert!(json.contains("\"tlsEnabled\":true"));
        assert!(json.contains("\"healthCheckPath\":\"/health\""));
        assert!(json.contains("\"registeredAt\""));
        assert!(json.contains("\"status\":\"healthy\""));
    }
}
