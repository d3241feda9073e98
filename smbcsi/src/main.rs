use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use libsmbcsi::backend::smb::{SmbController, SmbIdentity, SmbNode};
use libsmbcsi::config::{DEFAULT_DRIVER_NAME, DEFAULT_MAX_VOLUMES_PER_NODE, DEFAULT_STATE_DIR};
use libsmbcsi::mounter::{Mounter, OsMounter};
use libsmbcsi::registry::{FileRegistry, Registry};
use libsmbcsi::transport::{CsiServer, CsiServices};
use libsmbcsi::{DriverConfig, Mode};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// SMB/CIFS CSI plugin for RK8s
#[derive(Parser, Debug)]
#[command(name = "smbcsi", version, about)]
struct Args {
    /// Services to run: controller, node or all
    #[arg(long, env = "SMBCSI_MODE", value_enum, default_value_t = Mode::All)]
    mode: Mode,

    /// Identifier reported by NodeGetInfo; required for the node service
    #[arg(long, env = "SMBCSI_NODE_ID", default_value = "")]
    node_id: String,

    #[arg(long, env = "SMBCSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// Registry file, snapshot archives and controller share mounts live here
    #[arg(long, env = "SMBCSI_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    #[arg(long, env = "SMBCSI_LISTEN", default_value = "0.0.0.0:6443")]
    listen: SocketAddr,

    /// PEM certificate chain for the QUIC endpoint
    #[arg(long, env = "SMBCSI_TLS_CERT")]
    tls_cert: PathBuf,

    /// PEM private key for the QUIC endpoint
    #[arg(long, env = "SMBCSI_TLS_KEY")]
    tls_key: PathBuf,

    /// Seconds a single mount or unmount may take; 0 disables the limit
    #[arg(long, env = "SMBCSI_MOUNT_TIMEOUT", default_value_t = 0)]
    mount_timeout: u64,

    #[arg(long, env = "SMBCSI_MAX_VOLUMES_PER_NODE", default_value_t = DEFAULT_MAX_VOLUMES_PER_NODE)]
    max_volumes_per_node: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "SMBCSI_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            driver_name: self.driver_name.clone(),
            node_id: self.node_id.clone(),
            state_dir: self.state_dir.clone(),
            mode: self.mode,
            listen: self.listen,
            mount_timeout: Some(self.mount_timeout),
            max_volumes_per_node: self.max_volumes_per_node,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_tls(cert: &Path, key: &Path) -> Result<rustls::ServerConfig> {
    let certs = CertificateDer::pem_file_iter(cert)
        .with_context(|| format!("reading certificates from {}", cert.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates in {}", cert.display()))?;
    let key = PrivateKeyDer::from_pem_file(key)
        .with_context(|| format!("reading private key from {}", key.display()))?;
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate or key")
}

async fn build_services(config: &DriverConfig) -> Result<CsiServices> {
    let mounter: Arc<dyn Mounter> = Arc::new(OsMounter::new());
    let registry: Option<Arc<dyn Registry>> = if config.mode.runs_controller() {
        let registry = FileRegistry::open(config.registry_path())
            .await
            .context("opening volume registry")?;
        Some(Arc::new(registry))
    } else {
        None
    };

    let mut services = CsiServices::new(Arc::new(SmbIdentity::new(config)));
    if let Some(registry) = &registry {
        services = services.with_controller(Arc::new(SmbController::new(
            config,
            Arc::clone(registry),
            Arc::clone(&mounter),
        )));
    }
    if config.mode.runs_node() {
        let mut node = SmbNode::new(config, mounter);
        if let Some(registry) = registry {
            node = node.with_registry(registry);
        }
        services = services.with_node(Arc::new(node));
    }
    Ok(services)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.driver_config();
    if config.mode.runs_node() && config.node_id.is_empty() {
        bail!("--node-id is required when the node service runs");
    }
    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .with_context(|| format!("creating state dir {}", config.state_dir.display()))?;

    // Both ring and aws-lc-rs may be compiled in through quinn.
    let _ = rustls::crypto::ring::default_provider().install_default();
    let tls = load_tls(&args.tls_cert, &args.tls_key)?;

    let services = build_services(&config).await?;
    let server = CsiServer::new(config.listen, tls, services)?;
    info!(
        mode = ?config.mode,
        driver = %config.driver_name,
        node_id = %config.node_id,
        state_dir = %config.state_dir.display(),
        "smbcsi started",
    );

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server.shutdown();
        }
    }
    Ok(())
}
