//! Server configuration: built-in defaults, an optional JSON file and
//! command line flags (each also readable from a `MATTER_*` variable),
//! applied in that order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::mdns::zone::DEFAULT_HOSTNAME;

pub const DEFAULT_PORT: u32 = 5580;
pub const DEFAULT_VENDOR_ID: i64 = 0xFFF1;
pub const DEFAULT_FABRIC_ID: i64 = 1;
const STORAGE_DIR: &str = ".matter_server";
const CONFIG_FILE: &str = "config.json";
const DOTENV_FILE: &str = ".env";

#[derive(Parser, Debug, Default, Clone)]
#[command(name = "matter-server", version, about = "Matter WebSocket server")]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, env = "MATTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// File with KEY=VALUE lines loaded into the environment
    #[arg(long, env = "MATTER_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// TCP port for HTTP and WebSocket
    #[arg(long, env = "MATTER_PORT")]
    pub port: Option<u32>,

    /// Addresses to listen on, comma separated
    #[arg(long = "listen", env = "MATTER_LISTEN", value_delimiter = ',')]
    pub listen: Vec<String>,

    #[arg(long, env = "MATTER_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    #[arg(long, env = "MATTER_VENDOR_ID")]
    pub vendor_id: Option<i64>,

    #[arg(long, env = "MATTER_FABRIC_ID")]
    pub fabric_id: Option<i64>,

    /// Network interface used for mDNS
    #[arg(long, env = "MATTER_PRIMARY_INTERFACE")]
    pub primary_interface: Option<String>,

    #[arg(long, env = "MATTER_MDNS_ENABLED")]
    pub mdns_enabled: Option<bool>,

    /// Hostname advertised over mDNS (".local" is appended)
    #[arg(long, env = "MATTER_MDNS_HOSTNAME")]
    pub mdns_hostname: Option<String>,

    /// trace, debug, info, warn or error
    #[arg(long, env = "MATTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// console or json
    #[arg(long, env = "MATTER_LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MdnsConfig {
    pub enabled: bool,
    pub hostname: String,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hostname: default_hostname(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "console".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u32,
    pub listen_addresses: Vec<String>,
    pub storage_path: PathBuf,
    pub vendor_id: i64,
    pub fabric_id: i64,
    pub primary_interface: Option<String>,
    pub mdns: MdnsConfig,
    pub log: LogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let storage_path = std::env::current_dir()
            .map(|cwd| cwd.join(STORAGE_DIR))
            .unwrap_or_else(|_| PathBuf::from(STORAGE_DIR));
        Self {
            port: DEFAULT_PORT,
            listen_addresses: Vec::new(),
            storage_path,
            vendor_id: DEFAULT_VENDOR_ID,
            fabric_id: DEFAULT_FABRIC_ID,
            primary_interface: None,
            mdns: MdnsConfig::default(),
            log: LogConfig::default(),
        }
    }
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| DEFAULT_HOSTNAME.to_owned())
}

impl ServerConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .context(format!("reading config file {}", path.display()))?;
        serde_json::from_str(&data).context(format!("parsing config file {}", path.display()))
    }

    /// Overlay every flag that was given.
    pub fn apply(&mut self, cli: &Cli) {
        if let Some(port) = cli.port {
            self.port = port;
        }
        if !cli.listen.is_empty() {
            self.listen_addresses = cli.listen.clone();
        }
        if let Some(path) = &cli.storage_path {
            self.storage_path = path.clone();
        }
        if let Some(v) = cli.vendor_id {
            self.vendor_id = v;
        }
        if let Some(v) = cli.fabric_id {
            self.fabric_id = v;
        }
        if let Some(iface) = &cli.primary_interface {
            self.primary_interface = Some(iface.clone());
        }
        if let Some(enabled) = cli.mdns_enabled {
            self.mdns.enabled = enabled;
        }
        if let Some(hostname) = &cli.mdns_hostname {
            self.mdns.hostname = hostname.clone();
        }
        if let Some(level) = &cli.log_level {
            self.log.level = level.clone();
        }
        if let Some(format) = &cli.log_format {
            self.log.format = format.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=65535).contains(&self.port) {
            anyhow::bail!("invalid port: {}", self.port);
        }
        if !(0..=0xFFFF).contains(&self.vendor_id) {
            anyhow::bail!("invalid vendor ID: {}", self.vendor_id);
        }
        if self.fabric_id <= 0 {
            anyhow::bail!("invalid fabric ID: {}", self.fabric_id);
        }
        Ok(())
    }

    /// Port as bound. Only meaningful after [ServerConfig::validate].
    pub fn port(&self) -> u16 {
        u16::try_from(self.port).unwrap_or(0)
    }
}

/// `--config` if given, else the first existing of
/// `$HOME/.matter_server/config.json` and `./config.json`.
fn config_file(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    let home = std::env::var_os("HOME").map(|h| PathBuf::from(h).join(STORAGE_DIR).join(CONFIG_FILE));
    home.into_iter()
        .chain(std::iter::once(PathBuf::from(CONFIG_FILE)))
        .find(|p| p.is_file())
}

/// Resolve and validate the configuration for `cli`.
pub fn load(cli: &Cli) -> Result<ServerConfig> {
    let mut cfg = match config_file(cli) {
        Some(path) => {
            log::debug!("using config file {}", path.display());
            ServerConfig::from_file(&path)?
        }
        None => ServerConfig::default(),
    };
    cfg.apply(cli);
    cfg.validate().context("config validation failed")?;
    Ok(cfg)
}

/// Value of `--env-file` in raw arguments, needed before flags are parsed.
pub fn env_file_from_args<I, S>(args: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let arg = arg.as_ref();
        if arg == "--env-file" {
            return args.next().map(|v| PathBuf::from(v.as_ref()));
        }
        if let Some(v) = arg.strip_prefix("--env-file=") {
            return Some(PathBuf::from(v));
        }
    }
    None
}

fn unquote(value: &str) -> &str {
    let b = value.as_bytes();
    if b.len() >= 2 && (b[0] == b'"' || b[0] == b'\'') && b[b.len() - 1] == b[0] {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Set `KEY=VALUE` lines from `path`, skipping blanks and `#` comments.
/// Variables already in the environment are left alone.
pub fn load_env_file(path: &Path) -> Result<()> {
    let data =
        std::fs::read_to_string(path).context(format!("reading env file {}", path.display()))?;
    for (n, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            anyhow::bail!("invalid line {} in {}: {}", n + 1, path.display(), line);
        };
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("invalid line {} in {}: {}", n + 1, path.display(), line);
        }
        if std::env::var_os(key).is_none() {
            std::env::set_var(key, unquote(value.trim()));
        }
    }
    Ok(())
}

/// Load `explicit` or, when absent, `./.env` if it exists. A broken
/// implicit `.env` is only reported.
pub fn load_dotenv(explicit: Option<&Path>) -> Result<()> {
    match explicit {
        Some(path) => load_env_file(path),
        None => {
            let path = Path::new(DOTENV_FILE);
            if path.is_file() {
                if let Err(e) = load_env_file(path) {
                    eprintln!("ignoring {}: {:#}", DOTENV_FILE, e);
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut all = vec!["matter-server"];
        all.extend_from_slice(args);
        Cli::try_parse_from(all).unwrap()
    }

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 5580);
        assert_eq!(cfg.vendor_id, 0xFFF1);
        assert_eq!(cfg.fabric_id, 1);
        assert!(cfg.listen_addresses.is_empty());
        assert!(cfg.storage_path.ends_with(".matter_server"));
        assert!(cfg.mdns.enabled);
        assert!(!cfg.mdns.hostname.is_empty());
        assert_eq!(cfg.log.level, "info");
        assert_eq!(cfg.log.format, "console");
        cfg.validate().unwrap();
    }

    #[test]
    fn flag_beats_file_beats_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"port": 6000, "fabric_id": 5, "mdns": {"hostname": "from-file"}}"#,
        )
        .unwrap();
        let path = path.to_str().unwrap();

        let cfg = load(&cli(&["--config", path, "--port", "7000"])).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.fabric_id, 5);
        assert_eq!(cfg.mdns.hostname, "from-file");
        assert!(cfg.mdns.enabled);
        assert_eq!(cfg.vendor_id, DEFAULT_VENDOR_ID);

        let cfg = load(&cli(&[
            "--config",
            path,
            "--listen",
            "127.0.0.1,::1",
            "--mdns-enabled",
            "false",
        ]))
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.listen_addresses, vec!["127.0.0.1", "::1"]);
        assert!(!cfg.mdns.enabled);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(load(&cli(&["--config", path.to_str().unwrap()])).is_err());
    }

    #[test]
    fn validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.json");
        std::fs::write(&path, "{}").unwrap();
        let path = path.to_str().unwrap();

        assert!(load(&cli(&["--config", path, "--port", "0"])).is_err());
        assert!(load(&cli(&["--config", path, "--port", "70000"])).is_err());
        assert!(load(&cli(&["--config", path, "--vendor-id", "65536"])).is_err());
        assert!(load(&cli(&["--config", path, "--vendor-id=-1"])).is_err());
        assert!(load(&cli(&["--config", path, "--fabric-id", "0"])).is_err());
        assert!(load(&cli(&["--config", path, "--port", "65535"])).is_ok());
    }

    #[test]
    fn env_file_argument() {
        assert_eq!(
            env_file_from_args(["x", "--env-file", "a.env"]),
            Some(PathBuf::from("a.env"))
        );
        assert_eq!(
            env_file_from_args(["x", "--port", "1", "--env-file=b.env"]),
            Some(PathBuf::from("b.env"))
        );
        assert_eq!(env_file_from_args(["x", "--port", "1"]), None);
    }

    #[test]
    fn env_file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.env");
        std::fs::write(
            &path,
            "# comment\n\
             MATTER_DOTENV_TEST_A=\"double quoted\"\n\
             MATTER_DOTENV_TEST_B='single'\n\
             \n\
             MATTER_DOTENV_TEST_C = plain=value\n\
             MATTER_DOTENV_TEST_KEEP=from-file\n",
        )
        .unwrap();
        std::env::set_var("MATTER_DOTENV_TEST_KEEP", "from-env");

        load_env_file(&path).unwrap();
        assert_eq!(std::env::var("MATTER_DOTENV_TEST_A").unwrap(), "double quoted");
        assert_eq!(std::env::var("MATTER_DOTENV_TEST_B").unwrap(), "single");
        assert_eq!(std::env::var("MATTER_DOTENV_TEST_C").unwrap(), "plain=value");
        assert_eq!(std::env::var("MATTER_DOTENV_TEST_KEEP").unwrap(), "from-env");
    }

    #[test]
    fn env_file_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.env");
        std::fs::write(&path, "JUSTAKEY\n").unwrap();
        assert!(load_env_file(&path).is_err());
        assert!(load_dotenv(Some(&dir.path().join("missing.env"))).is_err());
    }
}
