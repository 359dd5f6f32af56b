mod com;
mod config;
mod scheduler;

use std::path::PathBuf;

use clap::Parser;
use enclave::Enclave;
use eyre::WrapErr;
use shared::tee::Attester;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::scheduler::InterruptFlag;

#[derive(Parser, Debug, Default)]
#[command(version, about = "Key synchronization and attestation for enclave applications", long_about = None)]
pub struct Cli {
    #[arg(long, value_name = "ADDR", help = "Listening address for the enclave application")]
    internal: Option<String>,
    #[arg(long, value_name = "ADDR", help = "Listening address for attestation requests")]
    external: Option<String>,
    #[arg(long, value_name = "ADDR", help = "Listening address for key sync requests of workers")]
    sync: Option<String>,
    #[arg(long, value_name = "ADDR", help = "Leader to synchronize key material from")]
    leader: Option<String>,
    #[arg(long, value_name = "SECONDS", help = "Synchronize with the leader periodically")]
    sync_interval: Option<u64>,
    #[arg(long, value_name = "MILLISECONDS", help = "Deadline of a key synchronization")]
    handshake_timeout: Option<u64>,
    #[arg(long, value_name = "SECONDS", help = "How long issued nonces stay valid")]
    nonce_ttl: Option<u64>,
    #[arg(long, value_name = "MILLISECONDS", help = "How long connections may idle")]
    listen_timeout: Option<u64>,
    #[arg(long, value_name = "BOOL", help = "Wait for the application before serving attestations")]
    wait_for_app: Option<bool>,
    #[arg(long, value_name = "PATH", help = "Nitriding's TLS private key")]
    tls_key: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Nitriding's TLS certificate")]
    tls_cert: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "PEM encoded root certificate of attestation documents")]
    nitro_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = Config::load_or_init(cli).wrap_err("Could not load the config")?;
    config.validate()?;
    info!("Nitriding started.");
    run(new_attester(&config)?, config).await
}

#[cfg(feature = "nitro")]
fn new_attester(config: &Config) -> eyre::Result<enclave::nitro::NitroAttester> {
    let path = config
        .nitro_root
        .as_ref()
        .ok_or_else(|| eyre::eyre!("A Nitro root certificate must be configured"))?;
    let root = std::fs::read(path)
        .wrap_err_with(|| format!("Could not read the root certificate at {}", path.display()))?;
    Ok(enclave::nitro::NitroAttester::new(&root)?)
}

#[cfg(not(feature = "nitro"))]
fn new_attester(_: &Config) -> eyre::Result<shared::tee::transparent::TransparentAttester> {
    tracing::warn!("Running without attestation hardware. Documents are not signed.");
    Ok(Default::default())
}

async fn run<A: Attester>(attester: A, config: Config) -> eyre::Result<()> {
    let enclave = Enclave::new(attester, config.settings());
    if let (Some(key), Some(cert)) = (&config.tls_key, &config.tls_cert) {
        let key = std::fs::read(key)
            .wrap_err_with(|| format!("Could not read the TLS key at {}", key.display()))?;
        let cert = std::fs::read(cert)
            .wrap_err_with(|| format!("Could not read the TLS certificate at {}", cert.display()))?;
        enclave.set_nitriding_keys(key, cert);
        info!("Loaded TLS key material.");
    }

    let interrupt = InterruptFlag::new();
    {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, shutting down.");
            }
            interrupt.interrupt();
        });
    }

    tokio::try_join!(
        com::run_internal(enclave.clone(), config.clone(), interrupt.clone()),
        com::run_external(enclave.clone(), config.clone(), interrupt.clone()),
        com::run_sync(enclave, config, interrupt),
    )?;
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt::SubscriberBuilder::default()
        .with_ansi(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
