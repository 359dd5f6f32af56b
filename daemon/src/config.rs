use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use enclave::Settings;
use eyre::{WrapErr, bail};
use serde::{Deserialize, Serialize};

use crate::Cli;

const CONFIG_FILE: &str = "config.toml";
const NITRIDING_DIR: &str = ".nitriding";
const INTERNAL_ADDRESS: &str = "127.0.0.1:8080";
const EXTERNAL_ADDRESS: &str = "0.0.0.0:8443";
const SYNC_ADDRESS: &str = "0.0.0.0:9444";
const LISTEN_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Where the enclave application reaches us
    pub internal_addr: String,
    /// Where clients request attestation documents
    pub external_addr: String,
    /// Where workers request our key material
    pub sync_addr: String,
    /// The leader to synchronize key material from, if we are a worker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    /// Synchronize again every this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_interval_secs: Option<u64>,
    pub handshake_timeout_ms: u64,
    pub nonce_ttl_secs: u64,
    /// How long a connection may idle before it is closed
    pub listen_timeout_ms: u64,
    /// Only expose the external endpoint once the application is ready
    pub wait_for_app: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<PathBuf>,
    /// PEM encoded root certificate of the attestation documents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nitro_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            internal_addr: INTERNAL_ADDRESS.to_string(),
            external_addr: EXTERNAL_ADDRESS.to_string(),
            sync_addr: SYNC_ADDRESS.to_string(),
            leader: None,
            sync_interval_secs: None,
            handshake_timeout_ms: settings.handshake_timeout.as_millis() as u64,
            nonce_ttl_secs: settings.nonce_ttl.as_secs(),
            listen_timeout_ms: LISTEN_TIMEOUT_MS,
            wait_for_app: true,
            tls_key: None,
            tls_cert: None,
            nitro_root: None,
        }
    }
}

impl Config {
    pub fn load_from(config_file: &Path) -> std::io::Result<Self> {
        toml::from_str(&std::fs::read_to_string(config_file)?).map_err(|e| {
            std::io::Error::new(
                ErrorKind::InvalidData,
                format!("Could not parse config file: {e}"),
            )
        })
    }

    /// Parse a config from CLI arguments, using defaults for everything
    /// not given
    pub fn init(cli: Cli) -> Self {
        let mut conf = Self::default();
        conf.apply(cli);
        conf
    }

    /// Overwrite the config with the CLI args present
    fn apply(&mut self, cli: Cli) {
        if let Some(addr) = cli.internal {
            self.internal_addr = addr;
        }
        if let Some(addr) = cli.external {
            self.external_addr = addr;
        }
        if let Some(addr) = cli.sync {
            self.sync_addr = addr;
        }
        if let Some(leader) = cli.leader {
            self.leader = Some(leader);
        }
        if let Some(secs) = cli.sync_interval {
            self.sync_interval_secs = Some(secs);
        }
        if let Some(ms) = cli.handshake_timeout {
            self.handshake_timeout_ms = ms;
        }
        if let Some(secs) = cli.nonce_ttl {
            self.nonce_ttl_secs = secs;
        }
        if let Some(ms) = cli.listen_timeout {
            self.listen_timeout_ms = ms;
        }
        if let Some(wait) = cli.wait_for_app {
            self.wait_for_app = wait;
        }
        if let Some(path) = cli.tls_key {
            self.tls_key = Some(path);
        }
        if let Some(path) = cli.tls_cert {
            self.tls_cert = Some(path);
        }
        if let Some(path) = cli.nitro_root {
            self.nitro_root = Some(path);
        }
    }

    /// First try to load the config file. If that succeeds, overwrite the config
    /// with the CLI args present and persist it. If there is no config file yet,
    /// create a config from the CLI args and persist it. Any other failure is
    /// returned and the file is left alone.
    ///
    /// Returns the final config.
    pub fn load_or_init(cli: Cli) -> std::io::Result<Self> {
        let n_dir = nitriding_dir()?;
        std::fs::create_dir_all(&n_dir)?;
        Self::load_or_init_at(&n_dir.join(CONFIG_FILE), cli)
    }

    fn load_or_init_at(config_file: &Path, cli: Cli) -> std::io::Result<Self> {
        let conf = match Self::load_from(config_file) {
            Ok(mut conf) => {
                conf.apply(cli);
                conf
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!("No config file found, new config created.");
                Self::init(cli)
            }
            Err(e) => return Err(e),
        };
        conf.save_to(config_file)?;
        Ok(conf)
    }

    pub fn save_to(&self, config_file: &Path) -> std::io::Result<()> {
        let conf = toml::to_string(self)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        std::fs::write(config_file, conf)
    }

    /// Reject configurations nitriding cannot run with
    pub fn validate(&self) -> eyre::Result<()> {
        for (name, addr) in [
            ("internal", &self.internal_addr),
            ("external", &self.external_addr),
            ("sync", &self.sync_addr),
        ] {
            addr.parse::<SocketAddr>()
                .wrap_err_with(|| format!("Invalid {name} listen address '{addr}'"))?;
        }
        if let Some(leader) = &self.leader {
            shared::tcp::validate_addr(leader)?;
        }
        match self.sync_interval_secs {
            Some(0) => bail!("The sync interval must be positive"),
            Some(_) if self.leader.is_none() => {
                bail!("A sync interval requires a leader to synchronize from")
            }
            _ => {}
        }
        if self.handshake_timeout_ms == 0 {
            bail!("The handshake timeout must be positive");
        }
        if self.nonce_ttl_secs == 0 {
            bail!("The nonce TTL must be positive");
        }
        if self.listen_timeout_ms == 0 {
            bail!("The listen timeout must be positive");
        }
        if self.tls_key.is_some() != self.tls_cert.is_some() {
            bail!("The TLS key and certificate must be given together");
        }
        Ok(())
    }

    pub fn settings(&self) -> Settings {
        Settings {
            nonce_ttl: Duration::from_secs(self.nonce_ttl_secs),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        self.sync_interval_secs.map(Duration::from_secs)
    }
}

pub fn nitriding_dir() -> std::io::Result<PathBuf> {
    home::home_dir()
        .map(|home| home.join(NITRIDING_DIR))
        .ok_or_else(|| std::io::Error::new(ErrorKind::NotFound, "Could not find home directory"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nitriding-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("Test failed");
        dir.join(CONFIG_FILE)
    }

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().expect("Test failed");
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let conf = Config::init(Cli {
            leader: Some("leader.internal:9444".to_string()),
            sync_interval: Some(300),
            wait_for_app: Some(false),
            ..Cli::default()
        });
        assert_eq!(conf.leader.as_deref(), Some("leader.internal:9444"));
        assert_eq!(conf.sync_interval(), Some(Duration::from_secs(300)));
        assert!(!conf.wait_for_app);
        assert_eq!(conf.internal_addr, INTERNAL_ADDRESS);
        conf.validate().expect("Test failed");
    }

    #[test]
    fn test_save_then_load() {
        let file = temp_file("roundtrip");
        let conf = Config {
            leader: Some("10.0.0.1:9444".to_string()),
            tls_key: Some(PathBuf::from("/etc/nitriding/key.der")),
            tls_cert: Some(PathBuf::from("/etc/nitriding/cert.der")),
            ..Config::default()
        };
        conf.save_to(&file).expect("Test failed");
        assert_eq!(Config::load_from(&file).expect("Test failed"), conf);
    }

    #[test]
    fn test_unparsable_file() {
        let file = temp_file("garbage");
        std::fs::write(&file, "internal_addr = [").expect("Test failed");
        let err = Config::load_from(&file).expect_err("Test failed");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_missing_file_is_created() {
        let file = temp_file("fresh");
        _ = std::fs::remove_file(&file);
        let conf = Config::load_or_init_at(
            &file,
            Cli {
                leader: Some("10.0.0.1:9444".to_string()),
                ..Cli::default()
            },
        )
        .expect("Test failed");
        assert_eq!(conf.leader.as_deref(), Some("10.0.0.1:9444"));
        assert_eq!(Config::load_from(&file).expect("Test failed"), conf);
    }

    #[test]
    fn test_broken_file_is_not_overwritten() {
        let file = temp_file("typo");
        let broken = "internal_adr = \"127.0.0.1:8080\"\n";
        std::fs::write(&file, broken).expect("Test failed");
        let err = Config::load_or_init_at(&file, Cli::default()).expect_err("Test failed");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(std::fs::read_to_string(&file).expect("Test failed"), broken);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let invalid = [
            Config {
                internal_addr: "localhost".to_string(),
                ..Config::default()
            },
            Config {
                leader: Some("no port".to_string()),
                ..Config::default()
            },
            Config {
                sync_interval_secs: Some(60),
                ..Config::default()
            },
            Config {
                leader: Some("10.0.0.1:9444".to_string()),
                sync_interval_secs: Some(0),
                ..Config::default()
            },
            Config {
                handshake_timeout_ms: 0,
                ..Config::default()
            },
            Config {
                nonce_ttl_secs: 0,
                ..Config::default()
            },
            Config {
                tls_key: Some(PathBuf::from("key.der")),
                ..Config::default()
            },
        ];
        for conf in invalid {
            assert!(conf.validate().is_err(), "{conf:?}");
        }
    }
}
