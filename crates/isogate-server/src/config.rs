//! Gateway configuration: TOML file + CLI overrides.

use crate::policy::AccessPolicy;
use isogate_core::{GatewayError, GatewayResult, LengthHeader, Nii, WireProfile};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Whether a handler finishes one exchange before reading the next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transmission {
    #[default]
    Sync,
    Async,
}

/// Which side to drop when an exchange fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionWhenDisconnect {
    DisconnectSource,
    DisconnectDestination,
    #[default]
    DisconnectBoth,
    NoDisconnect,
}

impl ActionWhenDisconnect {
    pub const ALL: [ActionWhenDisconnect; 4] = [
        ActionWhenDisconnect::DisconnectSource,
        ActionWhenDisconnect::DisconnectDestination,
        ActionWhenDisconnect::DisconnectBoth,
        ActionWhenDisconnect::NoDisconnect,
    ];

    pub fn closes_source(self) -> bool {
        matches!(
            self,
            ActionWhenDisconnect::DisconnectSource | ActionWhenDisconnect::DisconnectBoth
        )
    }

    pub fn closes_destination(self) -> bool {
        matches!(
            self,
            ActionWhenDisconnect::DisconnectDestination | ActionWhenDisconnect::DisconnectBoth
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthFormat {
    #[default]
    Binary2,
    Ascii4,
}

impl From<LengthFormat> for LengthHeader {
    fn from(f: LengthFormat) -> Self {
        match f {
            LengthFormat::Binary2 => LengthHeader::Binary2,
            LengthFormat::Ascii4 => LengthHeader::Ascii4,
        }
    }
}

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub source: SideSection,
    #[serde(default)]
    pub destination: DestinationSection,
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub permanent: PermanentSection,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub crypto: CryptoSection,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub transmission: Transmission,
    #[serde(default)]
    pub action_when_disconnect: ActionWhenDisconnect,
    #[serde(default)]
    pub length_header: LengthFormat,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_admission_backoff_ms")]
    pub admission_backoff_ms: u64,
    #[serde(default = "default_restart_cooldown_ms")]
    pub restart_cooldown_ms: u64,
    #[serde(default)]
    pub require_logon: bool,
    #[serde(default = "default_max_exchange_retries")]
    pub max_exchange_retries: u32,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            transmission: Transmission::default(),
            action_when_disconnect: ActionWhenDisconnect::default(),
            length_header: LengthFormat::default(),
            max_message_size: default_max_message_size(),
            admission_backoff_ms: default_admission_backoff_ms(),
            restart_cooldown_ms: default_restart_cooldown_ms(),
            require_logon: false,
            max_exchange_retries: default_max_exchange_retries(),
        }
    }
}

/// `[timeouts]` section, all in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSection {
    #[serde(default = "default_source_timeout")]
    pub source_secs: u64,
    #[serde(default = "default_destination_timeout")]
    pub destination_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            source_secs: default_source_timeout(),
            destination_secs: default_destination_timeout(),
            connect_secs: default_connect_timeout(),
        }
    }
}

/// Wire profile of one side (`[source]`, and the profile half of `[destination]`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SideSection {
    #[serde(default)]
    pub header: bool,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub mac: bool,
    #[serde(default)]
    pub key_id: Option<String>,
}

impl SideSection {
    fn profile(&self) -> WireProfile {
        WireProfile {
            header: self.header,
            encrypt: self.encrypt,
            mac: self.mac,
            key_id: self.key_id.clone().filter(|k| !k.is_empty()),
        }
    }
}

/// `[destination]` section: default upstream plus its wire profile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationSection {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(flatten)]
    pub side: SideSection,
}

/// `[security]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SecuritySection {
    /// Comma-separated IPs / CIDR blocks. Empty = everyone.
    #[serde(default)]
    pub allow: String,
    /// Comma-separated IPs / CIDR blocks, checked before `allow`.
    #[serde(default)]
    pub deny: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            allow: String::new(),
            deny: String::new(),
            tls: false,
            cert: default_cert_path(),
            key: default_key_path(),
        }
    }
}

/// `[permanent]` section: always-on upstream links.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PermanentSection {
    /// Keep a permanent link to the default destination for all traffic.
    /// Ignored when `links` is non-empty.
    #[serde(default)]
    pub connect_all: bool,
    /// NII -> host:port.
    #[serde(default)]
    pub links: BTreeMap<String, String>,
}

/// `[monitor]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_backlog_bytes")]
    pub backlog_bytes: usize,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            address: None,
            interval_secs: default_monitor_interval(),
            backlog_bytes: default_backlog_bytes(),
        }
    }
}

/// `[log]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_log_keep")]
    pub keep: usize,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            file: None,
            max_bytes: default_log_max_bytes(),
            keep: default_log_keep(),
        }
    }
}

/// `[crypto]` section: key id -> hex key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CryptoSection {
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_max_connections() -> usize {
    100
}
fn default_max_message_size() -> usize {
    isogate_core::framing::DEFAULT_MAX_MESSAGE
}
fn default_admission_backoff_ms() -> u64 {
    50
}
fn default_restart_cooldown_ms() -> u64 {
    2000
}
fn default_max_exchange_retries() -> u32 {
    3
}
fn default_source_timeout() -> u64 {
    120
}
fn default_destination_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_cert_path() -> String {
    "~/.isogate/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.isogate/key.pem".to_string()
}
fn default_monitor_interval() -> u64 {
    5
}
fn default_backlog_bytes() -> usize {
    64 * 1024
}
fn default_log_max_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_log_keep() -> usize {
    5
}

/// Inbound TLS material.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Resolved permanent-link settings.
#[derive(Debug, Clone, Default)]
pub struct PermanentConfig {
    pub links: BTreeMap<Nii, String>,
    pub connect_all: bool,
}

impl PermanentConfig {
    /// Wildcard mode only applies when no explicit table is configured.
    pub fn wildcard(&self) -> bool {
        self.links.is_empty() && self.connect_all
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub address: String,
    pub interval: Duration,
    pub backlog_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
    pub max_bytes: u64,
    pub keep: usize,
}

/// Values given on the command line; each wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub max_connections: Option<usize>,
    pub destination: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Resolved gateway configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub transmission: Transmission,
    pub action_when_disconnect: ActionWhenDisconnect,
    pub length_header: LengthHeader,
    pub max_message_size: usize,
    pub admission_backoff: Duration,
    pub restart_cooldown: Duration,
    pub require_logon: bool,
    pub max_exchange_retries: u32,
    pub source_timeout: Duration,
    pub destination_timeout: Duration,
    pub connect_timeout: Duration,
    pub source: WireProfile,
    pub destination: WireProfile,
    pub destination_addr: Option<String>,
    pub routes: BTreeMap<Nii, String>,
    pub access: AccessPolicy,
    pub tls: Option<TlsPaths>,
    pub permanent: PermanentConfig,
    pub monitor: Option<MonitorConfig>,
    pub log: LogConfig,
    pub crypto_keys: BTreeMap<String, String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_connections: default_max_connections(),
            transmission: Transmission::Sync,
            action_when_disconnect: ActionWhenDisconnect::default(),
            length_header: LengthHeader::Binary2,
            max_message_size: default_max_message_size(),
            admission_backoff: Duration::from_millis(default_admission_backoff_ms()),
            restart_cooldown: Duration::from_millis(default_restart_cooldown_ms()),
            require_logon: false,
            max_exchange_retries: default_max_exchange_retries(),
            source_timeout: Duration::from_secs(default_source_timeout()),
            destination_timeout: Duration::from_secs(default_destination_timeout()),
            connect_timeout: Duration::from_secs(default_connect_timeout()),
            source: WireProfile::plain(),
            destination: WireProfile::plain(),
            destination_addr: None,
            routes: BTreeMap::new(),
            access: AccessPolicy::default(),
            tls: None,
            permanent: PermanentConfig::default(),
            monitor: None,
            log: LogConfig {
                file: None,
                max_bytes: default_log_max_bytes(),
                keep: default_log_keep(),
            },
            crypto_keys: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> GatewayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded).map_err(|e| {
                        GatewayError::config(format!("cannot read {}: {e}", expanded.display()))
                    })?;
                    Self::parse_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    pub fn parse_file(content: &str) -> GatewayResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| GatewayError::config(format!("config parse error: {e}")))
    }

    /// Merge CLI overrides into a parsed file and validate the result.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> GatewayResult<Self> {
        let listen_str = overrides.listen.unwrap_or(file.gateway.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|e| GatewayError::config(format!("invalid listen address {listen_str:?}: {e}")))?;

        let max_connections = overrides
            .max_connections
            .unwrap_or(file.gateway.max_connections);
        if max_connections == 0 {
            return Err(GatewayError::config("max_connections must be at least 1"));
        }

        let destination_addr = overrides.destination.or(file.destination.address);
        if let Some(addr) = &destination_addr {
            check_target(addr)?;
        }

        let source = file.source.profile();
        let destination = file.destination.side.profile();
        source.validate()?;
        destination.validate()?;
        for profile in [&source, &destination] {
            if let Some(key) = &profile.key_id {
                if !file.crypto.keys.contains_key(key) {
                    return Err(GatewayError::config(format!(
                        "key_id {key:?} is not in [crypto.keys]"
                    )));
                }
            }
        }

        let routes = parse_nii_table("routes", &file.routes)?;
        let permanent = PermanentConfig {
            links: parse_nii_table("permanent.links", &file.permanent.links)?,
            connect_all: file.permanent.connect_all,
        };
        if permanent.wildcard() && destination_addr.is_none() {
            return Err(GatewayError::config(
                "permanent.connect_all needs [destination] address",
            ));
        }

        let access = AccessPolicy::parse(&file.security.allow, &file.security.deny)?;

        // A certificate on the command line turns TLS on.
        let tls = if file.security.tls || overrides.cert.is_some() {
            let cert = overrides.cert.unwrap_or(file.security.cert);
            let key = overrides.key.unwrap_or(file.security.key);
            Some(TlsPaths {
                cert: expand_tilde_str(&cert),
                key: expand_tilde_str(&key),
            })
        } else {
            None
        };

        let monitor = match file.monitor.address.filter(|a| !a.is_empty()) {
            Some(address) => {
                check_target(&address)?;
                Some(MonitorConfig {
                    address,
                    interval: Duration::from_secs(file.monitor.interval_secs.max(1)),
                    backlog_bytes: file.monitor.backlog_bytes,
                })
            }
            None => None,
        };

        Ok(Self {
            listen,
            max_connections,
            transmission: file.gateway.transmission,
            action_when_disconnect: file.gateway.action_when_disconnect,
            length_header: file.gateway.length_header.into(),
            max_message_size: file.gateway.max_message_size,
            admission_backoff: Duration::from_millis(file.gateway.admission_backoff_ms.max(1)),
            restart_cooldown: Duration::from_millis(file.gateway.restart_cooldown_ms),
            require_logon: file.gateway.require_logon,
            max_exchange_retries: file.gateway.max_exchange_retries,
            source_timeout: Duration::from_secs(file.timeouts.source_secs),
            destination_timeout: Duration::from_secs(file.timeouts.destination_secs),
            connect_timeout: Duration::from_secs(file.timeouts.connect_secs),
            source,
            destination,
            destination_addr,
            routes,
            access,
            tls,
            permanent,
            monitor,
            log: LogConfig {
                file: file.log.file.map(|f| expand_tilde_str(&f)),
                max_bytes: file.log.max_bytes,
                keep: file.log.keep,
            },
            crypto_keys: file.crypto.keys,
        })
    }
}

fn parse_nii_table(
    section: &str,
    table: &BTreeMap<String, String>,
) -> GatewayResult<BTreeMap<Nii, String>> {
    let mut out = BTreeMap::new();
    for (nii, target) in table {
        let parsed = Nii::parse(nii)
            .ok_or_else(|| GatewayError::config(format!("[{section}] bad NII {nii:?}")))?;
        check_target(target)?;
        out.insert(parsed, target.clone());
    }
    Ok(out)
}

/// `host:port` with a numeric port.
fn check_target(target: &str) -> GatewayResult<()> {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(GatewayError::config(format!(
            "{target:?} is not a host:port address"
        ))),
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use isogate_core::VerificationError;

    const SAMPLE: &str = r#"
[gateway]
listen = "127.0.0.1:5500"
max_connections = 8
transmission = "async"
action_when_disconnect = "no_disconnect"
length_header = "ascii4"

[timeouts]
destination_secs = 5

[source]
header = true
mac = true
key_id = "zpk"

[destination]
address = "10.0.0.5:6000"

[routes]
"003" = "10.0.0.6:6000"

[security]
allow = "10.0.0.0/8, 127.0.0.1"
deny = "10.0.0.13"

[permanent.links]
"001" = "10.0.0.7:7000"

[monitor]
address = "127.0.0.1:9000"

[crypto.keys]
zpk = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
"#;

    #[test]
    fn defaults_without_file() {
        let cfg = GatewayConfig::resolve(ConfigFile::default(), Overrides::default()).unwrap();
        assert_eq!(cfg.listen.port(), 5000);
        assert_eq!(cfg.max_connections, 100);
        assert_eq!(cfg.transmission, Transmission::Sync);
        assert_eq!(cfg.action_when_disconnect, ActionWhenDisconnect::DisconnectBoth);
        assert_eq!(cfg.length_header, LengthHeader::Binary2);
        assert!(cfg.tls.is_none());
        assert!(cfg.monitor.is_none());
        assert!(cfg.permanent.links.is_empty() && !cfg.permanent.wildcard());
    }

    #[test]
    fn parses_full_sample() {
        let file = GatewayConfig::parse_file(SAMPLE).unwrap();
        let cfg = GatewayConfig::resolve(file, Overrides::default()).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:5500".parse().unwrap());
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.transmission, Transmission::Async);
        assert_eq!(cfg.action_when_disconnect, ActionWhenDisconnect::NoDisconnect);
        assert_eq!(cfg.length_header, LengthHeader::Ascii4);
        assert_eq!(cfg.destination_timeout, Duration::from_secs(5));
        assert!(cfg.source.header && cfg.source.mac);
        assert_eq!(cfg.source.key_id.as_deref(), Some("zpk"));
        assert_eq!(cfg.destination_addr.as_deref(), Some("10.0.0.5:6000"));
        assert_eq!(cfg.routes.get(&Nii(3)).map(String::as_str), Some("10.0.0.6:6000"));
        assert_eq!(cfg.permanent.links.len(), 1);
        assert!(!cfg.permanent.wildcard());
        assert!(cfg.access.is_allowed("10.1.2.3".parse().unwrap()));
        assert!(!cfg.access.is_allowed("10.0.0.13".parse().unwrap()));
        assert!(cfg.monitor.is_some());
    }

    #[test]
    fn cli_overrides_win() {
        let file = GatewayConfig::parse_file(SAMPLE).unwrap();
        let cfg = GatewayConfig::resolve(
            file,
            Overrides {
                listen: Some("0.0.0.0:7000".into()),
                max_connections: Some(2),
                destination: Some("upstream:9100".into()),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.listen.port(), 7000);
        assert_eq!(cfg.max_connections, 2);
        assert_eq!(cfg.destination_addr.as_deref(), Some("upstream:9100"));
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            "[gateway]\nlisten = \"nowhere\"",
            "[gateway]\nmax_connections = 0",
            "[destination]\naddress = \"no-port\"",
            "[routes]\n\"abc\" = \"h:1\"",
            "[source]\nmac = true\nkey_id = \"k\"",
            "[source]\nheader = true\nmac = true\nkey_id = \"missing\"",
            "[permanent]\nconnect_all = true",
            "[security]\nallow = \"10.0.0.0/99\"",
        ];
        for content in bad {
            let err = GatewayConfig::parse_file(content)
                .and_then(|f| GatewayConfig::resolve(f, Overrides::default()))
                .unwrap_err();
            assert_eq!(err.kind, VerificationError::WrongConfiguration, "{content}");
        }
    }

    #[test]
    fn unknown_enum_value_is_parse_error() {
        let err = GatewayConfig::parse_file("[gateway]\ntransmission = \"sometimes\"").unwrap_err();
        assert_eq!(err.kind, VerificationError::WrongConfiguration);
    }

    #[test]
    fn policy_flags() {
        assert!(ActionWhenDisconnect::DisconnectBoth.closes_source());
        assert!(ActionWhenDisconnect::DisconnectBoth.closes_destination());
        assert!(!ActionWhenDisconnect::NoDisconnect.closes_source());
        assert!(ActionWhenDisconnect::DisconnectDestination.closes_destination());
        assert!(!ActionWhenDisconnect::DisconnectDestination.closes_source());
    }
}
