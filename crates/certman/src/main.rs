use anyhow::Context;
use certman::manifest::{load_manifest, load_manifests};
use certman::reconcile::Reconciler;
use certman::workqueue::reconcile_all;
use clap::{Parser, Subcommand};
use cm_acme::{CertificateManager, ParsedCertificate};
use cm_common::{CertmanConfig, FileSecretStore, SecretStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "certman", about = "ACME DNS-01 certificate manager")]
struct Cli {
    /// .env file to load before reading the environment
    #[arg(long, env = "CERTMAN_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile every manifest in REQUESTS_DIR, repeating on an interval
    Run {
        /// Exit after a single pass
        #[arg(long)]
        once: bool,
        #[arg(long, default_value_t = 3600)]
        interval_secs: u64,
    },
    /// Issue (or reuse) the certificate for one manifest
    Issue { manifest: PathBuf },
    /// Report whether the stored certificate needs reissuing
    Check { manifest: PathBuf },
    /// Revoke the stored certificate
    Revoke { manifest: PathBuf },
    /// Check that the DNS zone accepts challenge records
    Validate { manifest: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Environment is read before any runtime thread exists.
    let config = CertmanConfig::load(cli.env_file.as_deref());

    init_tracing(cli.json_logs);
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(run(cli.command, config))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,certman=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(command: Command, config: CertmanConfig) -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    let secrets: Arc<dyn SecretStore> = Arc::new(FileSecretStore::new(&config.secrets_dir));
    let manager = CertificateManager::from_config(&config, secrets.clone())?;
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(manager),
        secrets,
        config.state_dir.clone(),
        &config.operator_namespace,
    ));

    match command {
        Command::Run {
            once,
            interval_secs,
        } => run_loop(reconciler, &config, once, Duration::from_secs(interval_secs)).await,
        Command::Issue { manifest } => {
            let request = load_manifest(&manifest)?;
            let outcome = reconciler.reconcile(&request).await?;
            info!(request = %request.key(), outcome = ?outcome, "Done");
            Ok(())
        }
        Command::Check { manifest } => {
            let request = load_manifest(&manifest)?;
            let current = reconciler.current_certificate(&request).await?;
            let reissue = reconciler
                .manager()
                .should_reissue(&request, current.as_deref())?;
            match current {
                Some(pem) => {
                    let certificate = ParsedCertificate::from_pem(&pem)?;
                    info!(
                        request = %request.key(),
                        not_after = %certificate.not_after,
                        days_remaining = certificate.days_remaining(chrono::Utc::now()),
                        dns_names = ?certificate.dns_names,
                        reissue,
                        "Stored certificate"
                    );
                }
                None => info!(request = %request.key(), reissue, "No certificate stored"),
            }
            Ok(())
        }
        Command::Revoke { manifest } => {
            let request = load_manifest(&manifest)?;
            reconciler.revoke(&request).await?;
            info!(request = %request.key(), "Certificate revoked");
            Ok(())
        }
        Command::Validate { manifest } => {
            let request = load_manifest(&manifest)?;
            let writable = reconciler
                .manager()
                .validate_dns_write_access(&request)
                .await?;
            if !writable {
                anyhow::bail!("DNS zone {} is not writable", request.acme_dns_domain);
            }
            info!(request = %request.key(), zone = %request.acme_dns_domain, "DNS zone writable");
            Ok(())
        }
    }
}

async fn run_loop(
    reconciler: Arc<Reconciler>,
    config: &CertmanConfig,
    once: bool,
    interval: Duration,
) -> anyhow::Result<()> {
    info!(requests_dir = %config.requests_dir.display(), "certman starting");

    loop {
        match load_manifests(&config.requests_dir) {
            Ok(manifests) => {
                let requests = manifests.into_iter().map(|(_, request)| request).collect();
                let summary = reconcile_all(
                    reconciler.clone(),
                    requests,
                    config.max_concurrent_reconciles,
                    config.max_requeues,
                )
                .await;
                if once && summary.failed > 0 {
                    anyhow::bail!("{} request(s) failed", summary.failed);
                }
            }
            Err(e) => {
                error!("Failed to load manifests: {e:#}");
                if once {
                    return Err(e);
                }
            }
        }

        if once {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return Ok(());
            }
        }
    }
}
