use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, Subcommand};
use nitriding_client::error::{Error, Result};
use nitriding_client::{
    get_state, init_logging, put_state, random_nonce, ready, register_hash, request_attestation,
    sync,
};

#[derive(Parser)]
#[command(version, about, long_about=None)]
struct Cli {
    #[arg(
        long,
        value_name = "ADDR",
        default_value = "127.0.0.1:8080",
        help = "Address of nitriding's internal endpoint"
    )]
    internal: String,
    #[arg(
        long,
        value_name = "ADDR",
        default_value = "127.0.0.1:8443",
        help = "Address of nitriding's external endpoint"
    )]
    external: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Request an attestation document from the external endpoint")]
    Attest {
        #[arg(short, long, help = "Hex encoded nonce, a random one is used if omitted")]
        nonce: Option<String>,
    },
    #[command(about = "Retrieve the application's key material")]
    GetState {
        #[arg(short, long, help = "Write the key material to this file")]
        out: Option<PathBuf>,
    },
    #[command(about = "Store the application's key material")]
    PutState {
        #[arg(short, long, help = "File holding the key material")]
        file: PathBuf,
    },
    #[command(about = "Register the hash of the application's public key")]
    RegisterHash {
        #[arg(long, help = "Base64 encoded SHA-256 hash")]
        hash: String,
    },
    #[command(about = "Signal that the application is ready")]
    Ready,
    #[command(about = "Synchronize key material from a leader enclave")]
    Sync {
        #[arg(short, long, value_name = "ADDR", help = "Key sync address of the leader")]
        leader: String,
    },
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::InvalidInput(format!("could not read {}: {e}", path.display())))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Attest { nonce } => {
            let nonce = match nonce {
                Some(nonce) => hex::decode(nonce)
                    .map_err(|e| Error::InvalidInput(format!("nonce is not hex: {e}")))?,
                None => random_nonce().to_vec(),
            };
            tracing::info!("Requesting attestation over nonce {}", hex::encode(&nonce));
            let doc = request_attestation(&cli.external, &nonce).await?;
            println!("{}", STANDARD.encode(doc));
        }
        Commands::GetState { out } => {
            let state = get_state(&cli.internal).await?;
            match out {
                Some(path) => std::fs::write(&path, state).map_err(|e| {
                    Error::InvalidInput(format!("could not write {}: {e}", path.display()))
                })?,
                None => println!("{}", hex::encode(state)),
            }
        }
        Commands::PutState { file } => {
            put_state(&cli.internal, read_file(&file)?).await?;
            tracing::info!("Key material stored.");
        }
        Commands::RegisterHash { hash } => {
            register_hash(&cli.internal, &hash).await?;
            tracing::info!("Hash registered.");
        }
        Commands::Ready => {
            ready(&cli.internal).await?;
            tracing::info!("Readiness signalled.");
        }
        Commands::Sync { leader } => {
            tracing::info!("Synchronizing key material from {leader}...");
            sync(&cli.internal, &leader).await?;
            tracing::info!("Key material synchronized.");
        }
    }
    Ok(())
}
