//! Service discovery
//!
//! Finds services the registry does not know about yet: scans the local port
//! range for listeners, identifies what is answering over HTTP, walks
//! configured directories for project manifests, and reconciles everything
//! with the registry.

use crate::config::DiscoveryConfig;
use crate::registry::{ProjectStatus, RegistrationRequest, Registry};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// HTTP identification probe timeout
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Candidates reported per manifest kind
const MAX_PER_MANIFEST: usize = 20;

/// Framework needles checked against response headers, in priority order
const HEADER_FRAMEWORKS: &[&str] = &[
    "express", "koa", "fastify", "next", "nuxt", "gatsby", "react", "vue", "angular", "svelte",
];

/// Fallback needles checked against the response body
const BODY_FRAMEWORKS: &[&str] = &["react", "vue", "angular"];

/// Manifest file to ecosystem type, first match per directory wins
const MANIFESTS: &[(&str, &str)] = &[
    ("package.json", "nodejs"),
    ("Dockerfile", "docker"),
    ("docker-compose.yml", "docker-compose"),
    ("requirements.txt", "python"),
    ("Gemfile", "ruby"),
    ("go.mod", "go"),
    ("Cargo.toml", "rust"),
];

/// Dependency and build output directories the manifest walk never enters
const SKIPPED_DIRS: &[&str] = &["node_modules", "target", "vendor", "dist", "build", "__pycache__"];

/// What answered an HTTP probe on an open port
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub port: u16,
    pub framework: Option<String>,
    /// "api", "web" or "service"
    #[serde(rename = "type")]
    pub service_type: String,
    pub server_header: Option<String>,
    pub content_type: Option<String>,
    pub suggested_subdomain: String,
}

/// A project directory found by the manifest walk
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCandidate {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub project_type: String,
    pub description: Option<String>,
    pub framework: Option<String>,
    pub default_port: Option<u16>,
}

/// Result of one full scan-and-reconcile pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub active_services: usize,
    pub web_services: usize,
    pub candidates: usize,
    /// Newly auto-registered this pass
    pub registered: usize,
    pub duration_ms: u64,
}

/// Scanner for local services and project directories
pub struct Discovery {
    registry: Arc<Registry>,
    config: DiscoveryConfig,
    client: reqwest::Client,
    port_pattern: Regex,
    last_scan: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl Discovery {
    pub fn new(registry: Arc<Registry>, config: DiscoveryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(IDENTIFY_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("subgate-discovery/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let port_pattern = Regex::new(r"(?:port|PORT)[\s=:]+(\d+)")?;

        Ok(Self {
            registry,
            config,
            client,
            port_pattern,
            last_scan: parking_lot::Mutex::new(None),
        })
    }

    /// Run scheduled scans until shutdown. No-op when disabled; on-demand
    /// scans through the API work either way.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Scheduled discovery disabled");
            return;
        }
        info!(
            interval_secs = self.config.interval_secs,
            "Discovery scanner started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {
                    if let Err(e) = self.scan_and_update().await {
                        error!(error = %e, "Discovery scan failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Discovery scanner shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// TCP-probe the inclusive port range, one concurrent batch at a time.
    /// Refusals and timeouts just exclude the port.
    pub async fn scan_ports(&self, start: u16, end: u16) -> Vec<u16> {
        if start > end {
            return Vec::new();
        }
        let ports: Vec<u16> = (start..=end).collect();
        let mut open = Vec::new();
        for batch in ports.chunks(self.config.batch_size.max(1)) {
            let probes = batch.iter().map(|&port| self.probe_port(port));
            let results = futures::future::join_all(probes).await;
            open.extend(
                batch
                    .iter()
                    .zip(results)
                    .filter(|(_, is_open)| *is_open)
                    .map(|(port, _)| *port),
            );
        }
        open
    }

    async fn probe_port(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                self.config.probe_timeout(),
                TcpStream::connect(("127.0.0.1", port)),
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Probe each open port over HTTP. Ports that do not answer HTTP are
    /// silently dropped.
    pub async fn identify_services(&self, ports: &[u16]) -> Vec<ServiceInfo> {
        let mut services = Vec::new();
        for &port in ports {
            if let Some(info) = self.identify_service(port).await {
                debug!(
                    port,
                    framework = info.framework.as_deref().unwrap_or("none"),
                    service_type = %info.service_type,
                    "Identified web service"
                );
                services.push(info);
            }
        }
        services
    }

    async fn identify_service(&self, port: u16) -> Option<ServiceInfo> {
        let url = format!("http://localhost:{}/", port);
        let response = self.client.get(&url).send().await.ok()?;

        let headers = response.headers().clone();
        let server_header = headers
            .get("server")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let header_text: String = headers
            .iter()
            .map(|(name, value)| {
                format!("{}: {}\n", name.as_str(), value.to_str().unwrap_or(""))
            })
            .collect::<String>()
            .to_lowercase();
        let body = response.text().await.unwrap_or_default();

        let framework = identify_framework(&header_text, &body);
        let service_type = classify_service(content_type.as_deref(), &header_text);
        let base = framework
            .clone()
            .unwrap_or_else(|| service_type.to_string());
        let suggested_subdomain = sanitize_subdomain(&format!("{}-{}", base, port));

        Some(ServiceInfo {
            port,
            framework,
            service_type: service_type.to_string(),
            server_header,
            content_type,
            suggested_subdomain,
        })
    }

    /// Walk the configured roots for project manifests. Hidden directories
    /// and dependency caches are skipped; each manifest kind reports at most
    /// 20 candidates.
    pub fn detect_project_structures(&self) -> Vec<ProjectCandidate> {
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        let mut candidates = Vec::new();
        for root in &self.config.scan_roots {
            self.walk_dir(Path::new(root), 0, &mut counts, &mut candidates);
        }
        candidates
    }

    fn walk_dir(
        &self,
        dir: &Path,
        depth: usize,
        counts: &mut HashMap<&'static str, usize>,
        out: &mut Vec<ProjectCandidate>,
    ) {
        if let Some(candidate) = self.inspect_dir(dir, counts) {
            out.push(candidate);
        }

        if depth >= self.config.scan_depth {
            return;
        }
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            self.walk_dir(&path, depth + 1, counts, out);
        }
    }

    fn inspect_dir(
        &self,
        dir: &Path,
        counts: &mut HashMap<&'static str, usize>,
    ) -> Option<ProjectCandidate> {
        let (manifest, project_type) = MANIFESTS
            .iter()
            .find(|(manifest, _)| dir.join(manifest).is_file())
            .copied()?;

        let count = counts.entry(manifest).or_insert(0);
        if *count >= MAX_PER_MANIFEST {
            return None;
        }
        *count += 1;

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        let mut candidate = ProjectCandidate {
            name,
            path: dir.display().to_string(),
            project_type: project_type.to_string(),
            description: None,
            framework: None,
            default_port: None,
        };

        if manifest == "package.json" {
            self.enrich_from_package_json(dir, &mut candidate);
        }

        Some(candidate)
    }

    /// Pull description, framework and a default port out of package.json.
    /// A broken manifest leaves the candidate bare rather than dropping it.
    fn enrich_from_package_json(&self, dir: &Path, candidate: &mut ProjectCandidate) {
        let Ok(content) = std::fs::read_to_string(dir.join("package.json")) else {
            return;
        };
        let Ok(pkg) = serde_json::from_str::<serde_json::Value>(&content) else {
            return;
        };

        if let Some(description) = pkg.get("description").and_then(|v| v.as_str()) {
            if !description.is_empty() {
                candidate.description = Some(description.to_string());
            }
        }

        for deps_key in ["dependencies", "devDependencies"] {
            if candidate.framework.is_some() {
                break;
            }
            if let Some(deps) = pkg.get(deps_key).and_then(|v| v.as_object()) {
                candidate.framework = HEADER_FRAMEWORKS
                    .iter()
                    .find(|name| deps.contains_key(**name))
                    .map(|name| name.to_string());
            }
        }

        if let Some(scripts) = pkg.get("scripts").and_then(|v| v.as_object()) {
            for script in scripts.values().filter_map(|v| v.as_str()) {
                if let Some(port) = self.extract_port(script) {
                    candidate.default_port = Some(port);
                    break;
                }
            }
        }
    }

    fn extract_port(&self, script: &str) -> Option<u16> {
        self.port_pattern
            .captures(script)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Full pass: scan ports, identify services, walk manifests, then
    /// reconcile with the registry. Unknown live services are registered
    /// (autoStart off, tagged auto-discovered); known live services are
    /// nudged to active unless health already rated them. Per-service
    /// failures are logged and skipped.
    pub async fn scan_and_update(&self) -> anyhow::Result<ScanSummary> {
        let started = Instant::now();
        info!(
            start = self.config.port_start,
            end = self.config.port_end,
            "Discovery scan started"
        );

        let open_ports = self
            .scan_ports(self.config.port_start, self.config.port_end)
            .await;
        let services = self.identify_services(&open_ports).await;
        let candidates = self.detect_project_structures();

        let mut registered = 0usize;
        for service in &services {
            match self.registry.find_by_port(service.port) {
                Some(project) => {
                    // Listening again after being down, or never checked:
                    // mark routable. Health ratings are left alone.
                    if !project.status.is_active() {
                        self.registry
                            .set_status(&project.subdomain, ProjectStatus::Active);
                    }
                }
                None => {
                    let mut tags = vec!["auto-discovered".to_string()];
                    if let Some(framework) = &service.framework {
                        tags.push(framework.clone());
                    }
                    tags.push(service.service_type.clone());

                    let request = RegistrationRequest {
                        name: format!("Auto-discovered service on port {}", service.port),
                        subdomain: service.suggested_subdomain.clone(),
                        port: service.port,
                        project_type: Some(service.service_type.clone()),
                        description: service
                            .server_header
                            .as_ref()
                            .map(|s| format!("Server: {}", s)),
                        auto_start: Some(false),
                        tags: Some(tags),
                        ..Default::default()
                    };
                    match self.registry.register(request) {
                        Ok(project) => {
                            registered += 1;
                            info!(
                                subdomain = %project.subdomain,
                                port = project.port,
                                "Auto-registered discovered service"
                            );
                        }
                        Err(e) => {
                            warn!(
                                port = service.port,
                                error = %e,
                                "Skipping auto-registration"
                            );
                        }
                    }
                }
            }
        }

        *self.last_scan.lock() = Some(Utc::now());

        let summary = ScanSummary {
            active_services: open_ports.len(),
            web_services: services.len(),
            candidates: candidates.len(),
            registered,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            active = summary.active_services,
            web = summary.web_services,
            candidates = summary.candidates,
            registered = summary.registered,
            duration_ms = summary.duration_ms,
            "Discovery scan complete"
        );
        Ok(summary)
    }

    pub fn last_scan(&self) -> Option<DateTime<Utc>> {
        *self.last_scan.lock()
    }
}

fn identify_framework(header_text: &str, body: &str) -> Option<String> {
    for needle in HEADER_FRAMEWORKS {
        if header_text.contains(needle) {
            return Some(needle.to_string());
        }
    }
    if !body.is_empty() {
        let body = body.to_lowercase();
        for needle in BODY_FRAMEWORKS {
            if body.contains(needle) {
                return Some(needle.to_string());
            }
        }
    }
    None
}

fn classify_service(content_type: Option<&str>, header_text: &str) -> &'static str {
    let content_type = content_type.unwrap_or("");
    if content_type.contains("application/json") {
        "api"
    } else if content_type.contains("text/html") {
        "web"
    } else if header_text.contains("x-powered-by") || header_text.contains("server") {
        "web"
    } else {
        "service"
    }
}

/// DNS label rules: lowercase, [a-z0-9-], no leading/trailing or doubled
/// dashes, at most 63 characters.
fn sanitize_subdomain(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true; // suppress leading dashes
    for c in name.to_lowercase().chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c == '-' {
            if last_dash {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        out.push(c);
        if out.len() == 63 {
            break;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_registry(dir: &TempDir) -> Arc<Registry> {
        let config = RegistryConfig {
            store_path: dir
                .path()
                .join("projects.json")
                .to_string_lossy()
                .into_owned(),
            watch: false,
            backups: false,
            max_backups: 0,
        };
        Arc::new(Registry::open(&config).unwrap())
    }

    fn fast_config(scan_root: &Path) -> DiscoveryConfig {
        DiscoveryConfig {
            enabled: true,
            interval_secs: 30,
            port_start: 1,
            port_end: 1,
            batch_size: 50,
            probe_timeout_ms: 200,
            scan_roots: vec![scan_root.to_string_lossy().into_owned()],
            scan_depth: 3,
        }
    }

    /// Serves a fixed raw HTTP response on every connection.
    async fn mock_server(raw_response: &'static str) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(raw_response.as_bytes()).await;
            }
        });
        port
    }

    async fn dead_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[test]
    fn test_sanitize_subdomain() {
        assert_eq!(sanitize_subdomain("My App!"), "my-app");
        assert_eq!(sanitize_subdomain("--weird--name--"), "weird-name");
        assert_eq!(sanitize_subdomain("express-3000"), "express-3000");
        assert_eq!(sanitize_subdomain(&"x".repeat(80)).len(), 63);
        assert_eq!(sanitize_subdomain("___"), "");
    }

    #[test]
    fn test_identify_framework_rules() {
        assert_eq!(
            identify_framework("x-powered-by: express\n", ""),
            Some("express".to_string())
        );
        // Header rules run in priority order
        assert_eq!(
            identify_framework("server: next\nx-thing: react\n", ""),
            Some("next".to_string())
        );
        // Body is the fallback
        assert_eq!(
            identify_framework("content-type: text/html\n", "<div id=\"REACT-root\">"),
            Some("react".to_string())
        );
        assert_eq!(identify_framework("content-type: text/plain\n", "hello"), None);
    }

    #[test]
    fn test_classify_service() {
        assert_eq!(classify_service(Some("application/json"), ""), "api");
        assert_eq!(classify_service(Some("text/html; charset=utf-8"), ""), "web");
        assert_eq!(classify_service(None, "server: nginx\n"), "web");
        assert_eq!(classify_service(Some("text/plain"), "date: now\n"), "service");
    }

    #[tokio::test]
    async fn test_port_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let discovery = Discovery::new(registry, fast_config(dir.path())).unwrap();

        assert_eq!(
            discovery.extract_port("PORT=3000 node server.js"),
            Some(3000)
        );
        assert_eq!(
            discovery.extract_port("node server.js --port 8080"),
            Some(8080)
        );
        assert_eq!(discovery.extract_port("webpack serve port: 4000"), Some(4000));
        // Flags without the word "port" do not match
        assert_eq!(discovery.extract_port("next dev -p 3000"), None);
        assert_eq!(discovery.extract_port("node server.js"), None);
    }

    #[tokio::test]
    async fn test_scan_ports() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let discovery = Discovery::new(registry, fast_config(dir.path())).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = dead_port().await;

        assert_eq!(discovery.scan_ports(open, open).await, vec![open]);
        assert!(discovery.scan_ports(closed, closed).await.is_empty());
        // Inverted range is empty, not an error
        assert!(discovery.scan_ports(100, 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_identify_services() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let discovery = Discovery::new(registry, fast_config(dir.path())).unwrap();

        let port = mock_server(
            "HTTP/1.1 200 OK\r\nX-Powered-By: Express\r\nContent-Type: application/json\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}",
        )
        .await;
        let services = discovery.identify_services(&[port]).await;

        assert_eq!(services.len(), 1);
        let info = &services[0];
        assert_eq!(info.framework.as_deref(), Some("express"));
        assert_eq!(info.service_type, "api");
        assert_eq!(info.suggested_subdomain, format!("express-{}", port));

        // Ports that answer TCP but not HTTP produce nothing
        let silent = dead_port().await;
        assert!(discovery.identify_services(&[silent]).await.is_empty());
    }

    #[tokio::test]
    async fn test_detect_project_structures() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);

        let node_dir = dir.path().join("frontend");
        std::fs::create_dir_all(&node_dir).unwrap();
        std::fs::write(
            node_dir.join("package.json"),
            r#"{
                "name": "frontend",
                "description": "The web frontend",
                "dependencies": { "express": "^4.0.0" },
                "scripts": { "start": "PORT=4100 node server.js" }
            }"#,
        )
        .unwrap();

        let go_dir = dir.path().join("backend");
        std::fs::create_dir_all(&go_dir).unwrap();
        std::fs::write(go_dir.join("go.mod"), "module example.com/backend\n").unwrap();

        // Hidden and dependency directories are skipped
        let hidden = dir.path().join(".cache");
        std::fs::create_dir_all(&hidden).unwrap();
        std::fs::write(hidden.join("package.json"), "{}").unwrap();
        let node_modules = node_dir.join("node_modules").join("leftpad");
        std::fs::create_dir_all(&node_modules).unwrap();
        std::fs::write(node_modules.join("package.json"), "{}").unwrap();

        let discovery = Discovery::new(registry, fast_config(dir.path())).unwrap();
        let mut candidates = discovery.detect_project_structures();
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].name, "backend");
        assert_eq!(candidates[0].project_type, "go");
        assert_eq!(candidates[1].name, "frontend");
        assert_eq!(candidates[1].project_type, "nodejs");
        assert_eq!(candidates[1].description.as_deref(), Some("The web frontend"));
        assert_eq!(candidates[1].framework.as_deref(), Some("express"));
        assert_eq!(candidates[1].default_port, Some(4100));
    }

    #[tokio::test]
    async fn test_manifest_walk_respects_depth() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);

        let deep = dir.path().join("a").join("b").join("c").join("d");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("Cargo.toml"), "[package]\nname = \"deep\"\n").unwrap();

        let mut config = fast_config(dir.path());
        config.scan_depth = 2;
        let discovery = Discovery::new(registry, config).unwrap();
        assert!(discovery.detect_project_structures().is_empty());
    }

    #[tokio::test]
    async fn test_scan_and_update_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let port = mock_server(
            "HTTP/1.1 200 OK\r\nX-Powered-By: Express\r\nContent-Type: text/html\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let mut config = fast_config(dir.path());
        config.port_start = port;
        config.port_end = port;
        let discovery = Discovery::new(Arc::clone(&registry), config).unwrap();

        let first = discovery.scan_and_update().await.unwrap();
        assert_eq!(first.active_services, 1);
        assert_eq!(first.web_services, 1);
        assert_eq!(first.registered, 1);

        let project = registry.get(&format!("express-{}", port)).unwrap();
        assert_eq!(project.port, port);
        assert_eq!(project.project_type, "web");
        assert!(!project.auto_start);
        assert!(project.tags.contains(&"auto-discovered".to_string()));
        assert!(project.tags.contains(&"express".to_string()));
        assert_eq!(project.status, ProjectStatus::Registered);

        // Second pass registers nothing and marks the known service active
        let second = discovery.scan_and_update().await.unwrap();
        assert_eq!(second.registered, 0);
        assert_eq!(registry.len(), 1);
        let project = registry.get(&format!("express-{}", port)).unwrap();
        assert_eq!(project.status, ProjectStatus::Active);
        assert!(discovery.last_scan().is_some());
    }

    #[tokio::test]
    async fn test_scan_and_update_skips_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let port = mock_server(
            "HTTP/1.1 200 OK\r\nX-Powered-By: Express\r\nContent-Type: text/html\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        // Same subdomain the scanner would suggest, different port: the
        // auto-registration conflicts and is skipped.
        registry
            .register(RegistrationRequest {
                name: "Squatter".to_string(),
                subdomain: format!("express-{}", port),
                port: 9,
                ..Default::default()
            })
            .unwrap();

        let mut config = fast_config(dir.path());
        config.port_start = port;
        config.port_end = port;
        let discovery = Discovery::new(Arc::clone(&registry), config).unwrap();

        let summary = discovery.scan_and_update().await.unwrap();
        assert_eq!(summary.registered, 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get(&format!("express-{}", port)).unwrap().name,
            "Squatter"
        );
    }

    #[tokio::test]
    async fn test_scan_and_update_nudges_existing_to_active() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let port = mock_server(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        registry
            .register(RegistrationRequest {
                name: "Known".to_string(),
                subdomain: "known".to_string(),
                port,
                ..Default::default()
            })
            .unwrap();
        registry.set_status("known", ProjectStatus::Healthy);

        let mut config = fast_config(dir.path());
        config.port_start = port;
        config.port_end = port;
        let discovery = Discovery::new(Arc::clone(&registry), config).unwrap();
        discovery.scan_and_update().await.unwrap();

        // Health's verdict outranks the port probe
        assert_eq!(registry.get("known").unwrap().status, ProjectStatus::Healthy);

        registry.set_status("known", ProjectStatus::Unhealthy);
        discovery.scan_and_update().await.unwrap();
        assert_eq!(registry.get("known").unwrap().status, ProjectStatus::Active);
    }
}
