//! ACME certificate management.
//!
//! Obtains one wildcard certificate covering the base domain and all its
//! subdomains via the DNS-01 challenge, and renews it before expiry. DNS
//! record placement goes through [`DnsChallengeSolver`]; the default
//! [`StdinSolver`] walks an operator through adding the TXT records by hand.

use crate::config::AcmeConfig;
use anyhow::Context;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use serde::Serialize;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Renew when this close to expiry.
const RENEW_THRESHOLD_DAYS: i64 = 30;

/// Assumed remaining lifetime when the expiry cannot be parsed, so a
/// corrupt certificate does not trigger a renewal loop.
const FALLBACK_LIFETIME_DAYS: i64 = 90;

/// How often the background task re-checks the certificate.
const RENEW_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Places and removes the TXT records that prove domain control.
///
/// Implementations may block; they are always invoked off the async runtime.
pub trait DnsChallengeSolver: Send + Sync {
    /// Make `record_name TXT "record_value"` resolvable, returning once it is
    /// safe for the CA to look it up.
    fn present(&self, record_name: &str, record_value: &str) -> anyhow::Result<()>;

    /// Called once the authorization no longer needs the record.
    fn cleanup(&self, record_name: &str);
}

/// Interactive solver: prints the TXT record and waits for the operator to
/// confirm on stdin that it has been created.
pub struct StdinSolver;

impl DnsChallengeSolver for StdinSolver {
    fn present(&self, record_name: &str, record_value: &str) -> anyhow::Result<()> {
        use std::io::Write;

        println!();
        println!("  Create the following DNS TXT record:");
        println!();
        println!("      {}    IN TXT    \"{}\"", record_name, record_value);
        println!();
        println!("  If an earlier prompt created a record with this name, it has");
        println!("  already been verified and can be replaced with this value.");
        println!();
        println!(
            "  Wait for propagation (check with: dig TXT {}), then press Enter...",
            record_name
        );

        std::io::stdout()
            .flush()
            .context("Failed to flush challenge instructions")?;
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .context("Failed to read challenge confirmation from stdin")?;
        Ok(())
    }

    fn cleanup(&self, record_name: &str) {
        info!(record = %record_name, "TXT record is no longer needed and can be removed");
    }
}

/// Certificate status as reported by the admin API.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertInfo {
    pub exists: bool,
    pub domain: String,
    pub wildcard: String,
    pub expiry_date: Option<DateTime<Utc>>,
    pub days_until_expiry: Option<i64>,
    pub needs_renewal: bool,
    pub staging: bool,
}

/// Owns the on-disk certificate store and the ACME account, and drives
/// issuance and renewal for `domain` + `*.domain`.
///
/// Store layout under `cert_dir`:
/// `accounts/` ACME account credentials per environment,
/// `certs/<domain>.crt` the PEM chain, `private/<domain>.key` the key (0600).
pub struct CertificateManager {
    config: AcmeConfig,
    base_domain: String,
    cert_dir: PathBuf,
    solver: Arc<dyn DnsChallengeSolver>,
    issuing: AtomicBool,
}

impl CertificateManager {
    pub fn new(
        config: &AcmeConfig,
        base_domain: &str,
        solver: Arc<dyn DnsChallengeSolver>,
    ) -> anyhow::Result<Self> {
        let cert_dir = validate_cert_dir(Path::new(&config.cert_dir))?;

        for sub in ["accounts", "certs", "private"] {
            let dir = cert_dir.join(sub);
            std::fs::create_dir_all(&dir).with_context(|| {
                format!("Failed to create certificate directory {}", dir.display())
            })?;
        }

        Ok(Self {
            config: config.clone(),
            base_domain: base_domain.to_string(),
            cert_dir,
            solver,
            issuing: AtomicBool::new(false),
        })
    }

    /// The names every certificate covers: the base domain and its wildcard.
    fn domains(&self) -> Vec<String> {
        vec![
            self.base_domain.clone(),
            format!("*.{}", self.base_domain),
        ]
    }

    fn account_path(&self) -> PathBuf {
        let file = if self.config.staging {
            "account-staging.json"
        } else {
            "account.json"
        };
        self.cert_dir.join("accounts").join(file)
    }

    fn cert_path(&self) -> PathBuf {
        self.cert_dir
            .join("certs")
            .join(format!("{}.crt", self.base_domain))
    }

    fn key_path(&self) -> PathBuf {
        self.cert_dir
            .join("private")
            .join(format!("{}.key", self.base_domain))
    }

    /// Whether a certificate and key pair is on disk.
    pub fn has_certificate(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Whether an issuance is currently running.
    pub fn is_issuing(&self) -> bool {
        self.issuing.load(Ordering::SeqCst)
    }

    /// Load the persisted ACME account, or register a new one.
    async fn load_or_create_account(&self, email: &str) -> anyhow::Result<Account> {
        let path = self.account_path();

        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read ACME account file {}", path.display()))?;
            let credentials: AccountCredentials =
                serde_json::from_str(&raw).context("Failed to parse ACME account credentials")?;
            let account = Account::from_credentials(credentials)
                .await
                .context("Failed to restore ACME account")?;
            debug!(path = %path.display(), "Reusing existing ACME account");
            return Ok(account);
        }

        info!(email = %email, staging = self.config.staging, "Registering new ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            self.config.directory_url(),
            None,
        )
        .await
        .context("Failed to create ACME account")?;

        let serialized = serde_json::to_string_pretty(&credentials)
            .context("Failed to serialize ACME account credentials")?;
        write_restricted(&path, serialized.as_bytes())?;
        info!(path = %path.display(), "ACME account credentials saved");

        Ok(account)
    }

    /// Order a certificate for the base domain and its wildcard.
    ///
    /// Walks each authorization through its DNS-01 challenge via the solver,
    /// then finalizes the order and writes the result to the store. Only one
    /// issuance may run at a time.
    pub async fn issue(&self) -> anyhow::Result<()> {
        let _guard = IssueGuard::acquire(&self.issuing)?;

        let email = self
            .config
            .email
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("ACME requires a contact email ([acme] email)"))?;

        let account = self.load_or_create_account(email).await?;

        let domains = self.domains();
        info!(domains = ?domains, staging = self.config.staging, "Requesting certificate");

        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;

        // The base domain and its wildcard authorize against the same bare
        // identifier, so authorizations are tracked by position rather than
        // by name.
        for (index, authz) in authorizations.iter().enumerate() {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| {
                    anyhow::anyhow!("DNS-01 challenge not offered for {}", identifier)
                })?;

            let record_name = challenge_record_name(&identifier);
            let record_value = order.key_authorization(challenge).dns_value();

            info!(domain = %identifier, record = %record_name, "DNS-01 challenge received");

            let solver = Arc::clone(&self.solver);
            let (name, value) = (record_name.clone(), record_value);
            tokio::task::spawn_blocking(move || solver.present(&name, &value))
                .await
                .context("Challenge solver task failed")??;

            // Notify the CA we're ready
            order.set_challenge_ready(&challenge.url).await?;

            // Wait for the authorization to become valid
            let mut attempts = 0;
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;

                order.refresh().await?;
                let auths = order.authorizations().await?;

                match auths.get(index).map(|a| &a.status) {
                    Some(AuthorizationStatus::Valid) => {
                        info!(domain = %identifier, "Authorization valid");
                        break;
                    }
                    Some(AuthorizationStatus::Pending) => {
                        attempts += 1;
                        if attempts > 30 {
                            anyhow::bail!("Authorization timeout for {}", identifier);
                        }
                        debug!(domain = %identifier, attempt = attempts, "Waiting for authorization");
                    }
                    Some(AuthorizationStatus::Invalid) => {
                        anyhow::bail!(
                            "Authorization failed for {} (the TXT record may not have propagated)",
                            identifier
                        );
                    }
                    Some(status) => {
                        debug!(domain = %identifier, status = ?status, "Authorization status");
                    }
                    None => {
                        anyhow::bail!("Authorization not found for {}", identifier);
                    }
                }
            }

            self.solver.cleanup(&record_name);
        }

        // Wait for the order to be ready
        let mut attempts = 0;
        loop {
            let state = order.state();
            match state.status {
                OrderStatus::Ready => break,
                OrderStatus::Pending => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("Order timeout");
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
                OrderStatus::Invalid => {
                    anyhow::bail!("Order invalid");
                }
                OrderStatus::Valid => break,
                OrderStatus::Processing => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
            }
        }

        // Generate CSR and finalize the order
        let mut params = CertificateParams::new(domains.clone())?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, self.base_domain.clone());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;

        order.finalize(csr.der()).await?;

        // Wait for the certificate
        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            let state = order.state();

            match state.status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("Order valid but no certificate returned");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > 30 {
                        anyhow::bail!("Certificate timeout");
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                _ => anyhow::bail!("Unexpected order status: {:?}", state.status),
            }
        };

        self.save_cert(&cert_chain_pem, &private_key.serialize_pem())?;
        info!(domains = ?domains, "Certificate obtained and saved");

        Ok(())
    }

    /// Issue when no certificate exists or the current one is close to
    /// expiry. Returns whether an issuance ran.
    pub async fn renew_if_needed(&self) -> anyhow::Result<bool> {
        if !self.has_certificate() {
            info!("No certificate on disk, requesting initial issuance");
            self.issue().await?;
            return Ok(true);
        }

        let days_left = match self.days_until_expiry() {
            Some(days) => days,
            None => {
                warn!("Could not parse certificate expiry, assuming a fresh certificate");
                FALLBACK_LIFETIME_DAYS
            }
        };

        if days_left <= RENEW_THRESHOLD_DAYS {
            info!(days_left, "Certificate close to expiry, renewing");
            self.issue().await?;
            info!("Certificate renewed; restart to serve it on the TLS listener");
            Ok(true)
        } else {
            debug!(days_left, "Certificate still valid");
            Ok(false)
        }
    }

    /// Expiry of the stored certificate, if it parses.
    pub fn expiry_date(&self) -> Option<DateTime<Utc>> {
        use x509_parser::prelude::*;

        let pem = std::fs::read(self.cert_path()).ok()?;
        let cert = rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
            .next()?
            .ok()?;
        let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
        DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0)
    }

    fn days_until_expiry(&self) -> Option<i64> {
        self.expiry_date().map(|e| (e - Utc::now()).num_days())
    }

    /// Status summary for the admin API.
    pub fn cert_info(&self) -> CertInfo {
        let exists = self.has_certificate();
        let expiry = if exists { self.expiry_date() } else { None };
        let days = if exists {
            Some(match expiry {
                Some(e) => (e - Utc::now()).num_days(),
                None => FALLBACK_LIFETIME_DAYS,
            })
        } else {
            None
        };

        CertInfo {
            exists,
            domain: self.base_domain.clone(),
            wildcard: format!("*.{}", self.base_domain),
            expiry_date: expiry,
            days_until_expiry: days,
            needs_renewal: matches!(days, Some(d) if d <= RENEW_THRESHOLD_DAYS),
            staging: self.config.staging,
        }
    }

    /// Build a TLS acceptor from the stored certificate, or `None` when no
    /// material is on disk yet.
    pub fn tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        if !self.has_certificate() {
            return Ok(None);
        }

        let certs = load_certs(&self.cert_path())?;
        let key = load_private_key(&self.key_path())?;

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
    }

    /// Write a self-signed certificate for the base domain and its wildcard
    /// into the store. Lets the TLS listener come up without a CA.
    pub fn generate_self_signed(&self) -> anyhow::Result<()> {
        let mut params = CertificateParams::new(self.domains())?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, self.base_domain.clone());

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.self_signed(&key_pair)?;

        self.save_cert(&cert.pem(), &key_pair.serialize_pem())?;
        warn!(domain = %self.base_domain, "Self-signed certificate generated (browsers will not trust it)");
        Ok(())
    }

    /// Periodic renewal check. Issuance through the interactive solver needs
    /// an operator at the console when a renewal comes due.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            check_interval_hours = RENEW_CHECK_INTERVAL.as_secs() / 3600,
            renew_threshold_days = RENEW_THRESHOLD_DAYS,
            "Certificate renewal task started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(RENEW_CHECK_INTERVAL) => {
                    match self.renew_if_needed().await {
                        Ok(true) => info!("Certificate renewal completed"),
                        Ok(false) => {}
                        Err(e) => error!(error = %e, "Certificate renewal failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Certificate renewal task stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Persist the chain and key. Both go through a temp file and rename so
    /// a crash cannot leave a half-written pair; the key is written 0600.
    fn save_cert(&self, cert_pem: &str, key_pem: &str) -> anyhow::Result<()> {
        write_atomic(&self.cert_path(), cert_pem.as_bytes())?;
        write_restricted(&self.key_path(), key_pem.as_bytes())?;
        info!(
            cert = %self.cert_path().display(),
            key = %self.key_path().display(),
            "Certificate material saved"
        );
        Ok(())
    }
}

/// Single-flight guard for issuance; clears the flag on drop.
struct IssueGuard<'a>(&'a AtomicBool);

impl<'a> IssueGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> anyhow::Result<Self> {
        if flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(Self(flag))
        } else {
            anyhow::bail!("Certificate issuance already in progress");
        }
    }
}

impl Drop for IssueGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// TXT record name for a DNS-01 challenge. Wildcards validate against the
/// bare domain.
fn challenge_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}

/// Reject traversal in the configured store path and pin it down.
fn validate_cert_dir(dir: &Path) -> anyhow::Result<PathBuf> {
    if dir
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        anyhow::bail!(
            "Certificate directory must not contain '..': {}",
            dir.display()
        );
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create certificate directory {}", dir.display()))?;
    dir.canonicalize()
        .with_context(|| format!("Failed to resolve certificate directory {}", dir.display()))
}

fn write_atomic(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Path has no parent directory: {}", path.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)
        .context("Failed to write certificate material")?;
    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("Failed to move {} into place: {}", path.display(), e))?;
    Ok(())
}

/// Like [`write_atomic`] but owner-readable only; for key material.
fn write_restricted(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Path has no parent directory: {}", path.display()))?;
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)
        .context("Failed to write key material")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))
            .context("Failed to restrict key permissions")?;
    }

    tmp.persist(path)
        .map_err(|e| anyhow::anyhow!("Failed to move {} into place: {}", path.display(), e))?;
    Ok(())
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            anyhow::anyhow!("Failed to parse certificates from {}: {}", path.display(), e)
        })?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path.display(), e))?
        {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    anyhow::bail!("No private key found in {}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> AcmeConfig {
        AcmeConfig {
            enabled: true,
            email: Some("ops@example.com".to_string()),
            staging: true,
            cert_dir: dir.to_string_lossy().into_owned(),
        }
    }

    fn manager(dir: &Path) -> CertificateManager {
        CertificateManager::new(&test_config(dir), "example.com", Arc::new(StdinSolver))
            .expect("manager")
    }

    /// Write a real certificate expiring roughly `days` from now.
    fn write_cert_expiring_in(mgr: &CertificateManager, days: i64) {
        let expiry = Utc::now() + chrono::Duration::days(days);
        let mut params = CertificateParams::new(vec!["example.com".to_string()]).expect("params");
        params.not_after =
            rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).expect("key pair");
        let cert = params.self_signed(&key_pair).expect("cert");
        mgr.save_cert(&cert.pem(), &key_pair.serialize_pem())
            .expect("save");
    }

    #[test]
    fn test_store_layout_created() {
        let dir = tempdir().expect("tempdir");
        let _mgr = manager(dir.path());

        assert!(dir.path().join("accounts").is_dir());
        assert!(dir.path().join("certs").is_dir());
        assert!(dir.path().join("private").is_dir());
    }

    #[test]
    fn test_no_certificate_initially() {
        let dir = tempdir().expect("tempdir");
        let mgr = manager(dir.path());

        assert!(!mgr.has_certificate());
        assert!(mgr.tls_acceptor().expect("acceptor").is_none());

        let info = mgr.cert_info();
        assert!(!info.exists);
        assert_eq!(info.days_until_expiry, None);
        assert!(!info.needs_renewal);
    }

    #[test]
    fn test_self_signed_enables_tls() {
        let dir = tempdir().expect("tempdir");
        let mgr = manager(dir.path());

        mgr.generate_self_signed().expect("self-signed");

        assert!(mgr.has_certificate());
        assert!(mgr.tls_acceptor().expect("acceptor").is_some());

        // Default rcgen validity is far in the future
        let info = mgr.cert_info();
        assert!(info.exists);
        assert!(!info.needs_renewal);
        assert_eq!(info.domain, "example.com");
        assert_eq!(info.wildcard, "*.example.com");
    }

    #[test]
    fn test_renewal_needed_near_expiry() {
        let dir = tempdir().expect("tempdir");
        let mgr = manager(dir.path());

        write_cert_expiring_in(&mgr, 10);

        let info = mgr.cert_info();
        assert!(info.needs_renewal);
        // date_time_ymd truncates to midnight, so allow a day of slack
        assert!(matches!(info.days_until_expiry, Some(d) if (8..=10).contains(&d)));
    }

    #[test]
    fn test_no_renewal_with_plenty_of_time() {
        let dir = tempdir().expect("tempdir");
        let mgr = manager(dir.path());

        write_cert_expiring_in(&mgr, 60);

        let info = mgr.cert_info();
        assert!(!info.needs_renewal);
        assert!(matches!(info.days_until_expiry, Some(d) if (58..=60).contains(&d)));
    }

    #[test]
    fn test_unparseable_expiry_falls_back() {
        let dir = tempdir().expect("tempdir");
        let mgr = manager(dir.path());

        std::fs::write(mgr.cert_path(), b"not a certificate").expect("write cert");
        std::fs::write(mgr.key_path(), b"not a key").expect("write key");

        assert!(mgr.has_certificate());
        assert_eq!(mgr.expiry_date(), None);

        let info = mgr.cert_info();
        assert_eq!(info.days_until_expiry, Some(FALLBACK_LIFETIME_DAYS));
        assert!(!info.needs_renewal);
    }

    #[cfg(unix)]
    #[test]
    fn test_key_written_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().expect("tempdir");
        let mgr = manager(dir.path());

        mgr.generate_self_signed().expect("self-signed");

        let mode = std::fs::metadata(mgr.key_path())
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_account_path_per_environment() {
        let dir = tempdir().expect("tempdir");

        let staging = manager(dir.path());
        let mut production_config = test_config(dir.path());
        production_config.staging = false;
        let production =
            CertificateManager::new(&production_config, "example.com", Arc::new(StdinSolver))
                .expect("manager");

        assert_ne!(staging.account_path(), production.account_path());
        assert!(staging
            .account_path()
            .to_string_lossy()
            .contains("account-staging"));
    }

    #[test]
    fn test_rejects_parent_dir_in_store_path() {
        let mut config = test_config(Path::new("./certs"));
        config.cert_dir = "../escaped-certs".to_string();

        let result = CertificateManager::new(&config, "example.com", Arc::new(StdinSolver));
        assert!(result.is_err());
    }

    #[test]
    fn test_challenge_record_name_strips_wildcard() {
        assert_eq!(
            challenge_record_name("example.com"),
            "_acme-challenge.example.com"
        );
        assert_eq!(
            challenge_record_name("*.example.com"),
            "_acme-challenge.example.com"
        );
    }

    #[test]
    fn test_issue_guard_is_single_flight() {
        let flag = AtomicBool::new(false);

        let first = IssueGuard::acquire(&flag).expect("first acquire");
        assert!(IssueGuard::acquire(&flag).is_err());

        drop(first);
        assert!(IssueGuard::acquire(&flag).is_ok());
    }

    #[test]
    fn test_cert_info_wire_format() {
        let dir = tempdir().expect("tempdir");
        let mgr = manager(dir.path());
        mgr.generate_self_signed().expect("self-signed");

        let value = serde_json::to_value(mgr.cert_info()).expect("serialize");
        assert!(value.get("daysUntilExpiry").is_some());
        assert!(value.get("needsRenewal").is_some());
        assert_eq!(value["staging"], serde_json::json!(true));
    }
}
