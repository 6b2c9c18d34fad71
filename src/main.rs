use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use subgate::acme::{CertificateManager, StdinSolver};
use subgate::api::{ApiState, PKG_NAME, VERSION};
use subgate::config::Config;
use subgate::discovery::Discovery;
use subgate::health::HealthChecker;
use subgate::pool::{ConnectionPool, PoolConfig};
use subgate::proxy::{ProxyContext, ProxyServer};
use subgate::registry::Registry;
use subgate::stats::StatsCollector;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("subgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::acquire(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // An unreadable store aborts startup rather than coming up empty
    let registry = Arc::new(Registry::open(&config.registry)?);
    info!(
        projects = registry.len(),
        store = %config.registry.store_path,
        "Project registry loaded"
    );

    let health = Arc::new(HealthChecker::new(
        Arc::clone(&registry),
        config.health.clone(),
    )?);
    let discovery = Arc::new(Discovery::new(
        Arc::clone(&registry),
        config.discovery.clone(),
    )?);
    let stats = Arc::new(StatsCollector::new());
    let certs = Arc::new(CertificateManager::new(
        &config.acme,
        &config.server.domain,
        Arc::new(StdinSolver),
    )?);

    // Watch the store for edits made behind our back
    let _watcher_handle = if config.registry.watch {
        match registry.spawn_watcher(shutdown_rx.clone()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Registry file watcher unavailable, continuing without it");
                None
            }
        }
    } else {
        None
    };

    // Initial discovery scan runs to completion before traffic is served
    if config.discovery.enabled {
        let summary = discovery.scan_and_update().await?;
        info!(
            active_services = summary.active_services,
            registered = summary.registered,
            duration_ms = summary.duration_ms,
            "Initial discovery scan complete"
        );
    }

    // Seed health state so the routing gate has a verdict for every project
    let checks = health.check_all().await;
    info!(
        projects = checks.len(),
        healthy = checks.iter().filter(|c| c.healthy).count(),
        "Initial health check complete"
    );

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    };
    let pool = Arc::new(ConnectionPool::new(pool_config));

    let api = Arc::new(ApiState::new(
        Arc::clone(&registry),
        Arc::clone(&health),
        Arc::clone(&discovery),
        Arc::clone(&stats),
        Arc::clone(&certs),
        &config,
    ));

    let ctx = Arc::new(ProxyContext {
        registry: Arc::clone(&registry),
        health: Arc::clone(&health),
        stats: Arc::clone(&stats),
        pool,
        api,
        base_domain: config.server.domain.to_lowercase(),
        proxy_timeout: config.server.proxy_timeout(),
    });

    // Missing TLS material is fine (HTTP-only); broken material is logged
    // and likewise downgrades rather than aborting startup
    let tls_acceptor = match certs.tls_acceptor() {
        Ok(acceptor) => acceptor,
        Err(e) => {
            error!(error = %e, "Failed to load TLS material, continuing without HTTPS");
            None
        }
    };

    // Create HTTP proxy listener (if port > 0)
    let http_port = config.server.http_port();
    let https_port = config.server.https_port();
    let http_proxy_handle = if http_port > 0 {
        let http_proxy = ProxyServer::new(
            listener_addr(&config.server.bind, http_port)?,
            Arc::clone(&ctx),
            shutdown_rx.clone(),
        );

        Some(tokio::spawn(async move {
            if let Err(e) = http_proxy.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }))
    } else {
        None
    };

    // Create HTTPS proxy listener (if TLS material loaded and port > 0)
    let https_proxy_handle = match tls_acceptor {
        Some(acceptor) if https_port > 0 => {
            let https_proxy = ProxyServer::new(
                listener_addr(&config.server.bind, https_port)?,
                Arc::clone(&ctx),
                shutdown_rx.clone(),
            )
            .with_tls(acceptor);

            Some(tokio::spawn(async move {
                if let Err(e) = https_proxy.run().await {
                    error!(error = %e, "HTTPS proxy server error");
                }
            }))
        }
        _ => {
            if config.acme.enabled {
                info!("No certificate on disk yet; HTTPS starts after issuance and restart");
            }
            None
        }
    };

    // Scheduled tasks: health sweep, discovery scan, certificate renewal
    let health_runner = Arc::clone(&health);
    let health_shutdown = shutdown_rx.clone();
    tokio::spawn(async move { health_runner.run(health_shutdown).await });

    let discovery_runner = Arc::clone(&discovery);
    let discovery_shutdown = shutdown_rx.clone();
    tokio::spawn(async move { discovery_runner.run(discovery_shutdown).await });

    let renewal_task = if config.acme.enabled {
        let certs_runner = Arc::clone(&certs);
        let certs_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            certs_runner.run(certs_shutdown).await
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or registry reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup()).expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading project registry...");
                    match registry.reload() {
                        Ok(count) => {
                            info!(projects = count, "Registry reloaded from disk");
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload registry");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // The renewal task may be blocked on a DNS challenge; don't wait for it
    if let Some(handle) = renewal_task {
        handle.abort();
    }

    // Wait for listeners to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_proxy_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_proxy_handle {
            let _ = handle.await;
        }
    })
    .await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn listener_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port).parse().map_err(|e| {
        error!(bind = %bind, port = port, error = %e, "Invalid bind address");
        anyhow::anyhow!("invalid bind address {}:{}: {}", bind, port, e)
    })
}

/// Keeps the PID file open so its flock lives as long as the process.
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // LOCK_NB so a second instance fails fast instead of hanging
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn acquire(path: &Path) -> anyhow::Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    let http_port = config.server.http_port();
    let https_port = config.server.https_port();
    info!(
        domain = %config.server.domain,
        bind = %config.server.bind,
        http_port = if http_port > 0 { Some(http_port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        admin_api = config.server.admin_api_key.is_some(),
        "Server configuration"
    );
    info!(
        store = %config.registry.store_path,
        watch = config.registry.watch,
        backups = config.registry.backups,
        "Registry settings"
    );
    info!(
        interval_secs = config.health.interval_secs,
        timeout_secs = config.health.timeout_secs,
        max_retries = config.health.max_retries,
        uptime_window_hours = config.health.uptime_window_hours,
        "Health check settings"
    );
    info!(
        enabled = config.discovery.enabled,
        interval_secs = config.discovery.interval_secs,
        port_range = %format!("{}-{}", config.discovery.port_start, config.discovery.port_end),
        "Discovery settings"
    );
    info!(
        enabled = config.acme.enabled,
        staging = config.acme.staging,
        cert_dir = %config.acme.cert_dir,
        "Certificate settings"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        proxy_timeout_secs = config.server.proxy_timeout_secs,
        "Connection pool settings"
    );
}
