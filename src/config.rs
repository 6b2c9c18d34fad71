use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Project registry storage settings
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Health check settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Service discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// ACME/Let's Encrypt configuration
    #[serde(default)]
    pub acme: AcmeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Base domain that subdomains hang off of (e.g. "example.com").
    /// Subdomain routing requires a dotted domain; "localhost" only serves
    /// the root info page.
    #[serde(default = "default_domain")]
    pub domain: String,

    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port (default: 443 when TLS material is available)
    pub tls_port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Static key for the admin API (X-API-Key header or api_key query).
    /// If not set, admin routes answer 501.
    pub admin_api_key: Option<String>,

    /// Maximum time to wait for an upstream response in seconds (default: 30)
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,

    /// Maximum idle connections per upstream host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        self.tls_port.unwrap_or(443)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            port: default_listen_port(),
            tls_port: None,
            bind: default_bind_address(),
            admin_api_key: None,
            proxy_timeout_secs: default_proxy_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Path to the JSON store (default: ./data/projects.json)
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Watch the store file and hot-reload external edits (default: true)
    #[serde(default = "default_true")]
    pub watch: bool,

    /// Take a timestamped backup before each overwrite (default: true)
    #[serde(default = "default_true")]
    pub backups: bool,

    /// How many backups to keep (default: 5)
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            watch: default_true(),
            backups: default_true(),
            max_backups: default_max_backups(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Seconds between scheduled full health passes (default: 60)
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Per-attempt probe timeout in seconds (default: 5)
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Retry attempts for 5xx and transport failures (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Window for uptime statistics in hours (default: 24)
    #[serde(default = "default_uptime_window")]
    pub uptime_window_hours: i64,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            max_retries: default_max_retries(),
            uptime_window_hours: default_uptime_window(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Run the scheduled discovery scan (default: true).
    /// On-demand scans via the API work either way.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between scheduled scans (default: 30)
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,

    /// First port of the scan range (default: 3001)
    #[serde(default = "default_port_start")]
    pub port_start: u16,

    /// Last port of the scan range, inclusive (default: 9000)
    #[serde(default = "default_port_end")]
    pub port_end: u16,

    /// Ports probed concurrently per batch (default: 50)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// TCP connect timeout per probe in milliseconds (default: 1000)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Directories to walk for project manifests (default: ["."])
    #[serde(default = "default_scan_roots")]
    pub scan_roots: Vec<String>,

    /// Maximum directory depth for the manifest walk (default: 3)
    #[serde(default = "default_scan_depth")]
    pub scan_depth: usize,
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_discovery_interval(),
            port_start: default_port_start(),
            port_end: default_port_end(),
            batch_size: default_batch_size(),
            probe_timeout_ms: default_probe_timeout(),
            scan_roots: default_scan_roots(),
            scan_depth: default_scan_depth(),
        }
    }
}

/// ACME (Let's Encrypt) configuration for the wildcard certificate
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Enable certificate issuance and the daily renewal check
    #[serde(default)]
    pub enabled: bool,

    /// Contact email for Let's Encrypt notifications (required when enabled)
    pub email: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[serde(default)]
    pub staging: bool,

    /// Local directory for certificates, keys and the ACME account
    #[serde(default = "default_cert_dir")]
    pub cert_dir: String,
}

impl AcmeConfig {
    pub fn directory_url(&self) -> &'static str {
        if self.staging {
            "https://acme-staging-v02.api.letsencrypt.org/directory"
        } else {
            "https://acme-v02.api.letsencrypt.org/directory"
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: None,
            staging: false,
            cert_dir: default_cert_dir(),
        }
    }
}

// Default value functions
fn default_domain() -> String {
    "localhost".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_timeout() -> u64 {
    30 // 30 seconds max for an upstream to respond
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per upstream
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_store_path() -> String {
    "./data/projects.json".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_backups() -> usize {
    5
}

fn default_health_interval() -> u64 {
    60 // Full health pass every minute
}

fn default_health_timeout() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_uptime_window() -> i64 {
    24 // hours
}

fn default_discovery_interval() -> u64 {
    30
}

fn default_port_start() -> u16 {
    3001
}

fn default_port_end() -> u16 {
    9000
}

fn default_batch_size() -> usize {
    50 // Ports probed concurrently per scan batch
}

fn default_probe_timeout() -> u64 {
    1000 // 1 second per TCP probe
}

fn default_scan_roots() -> Vec<String> {
    vec![".".to_string()]
}

fn default_scan_depth() -> usize {
    3
}

fn default_cert_dir() -> String {
    "./certs".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.domain.is_empty() {
            errors.push("'server.domain' must not be empty".to_string());
        }

        if self.server.port == 0 && self.server.tls_port.unwrap_or(0) == 0 && !self.acme.enabled {
            errors.push("no listeners configured: 'server.port' is 0 and TLS is off".to_string());
        }

        if self.discovery.port_start > self.discovery.port_end {
            errors.push(format!(
                "discovery port range is inverted: {} > {}",
                self.discovery.port_start, self.discovery.port_end
            ));
        }

        if self.discovery.batch_size == 0 {
            errors.push("'discovery.batch_size' must be greater than 0".to_string());
        }

        if self.health.max_retries == 0 {
            errors.push("'health.max_retries' must be at least 1".to_string());
        }

        if self.acme.enabled && self.acme.email.is_none() {
            errors.push("'acme.email' is required when ACME is enabled".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
