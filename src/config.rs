use std::{
    collections::HashSet,
    fmt,
    net::IpAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("check_ips.{0} must contain at least one address")]
    EmptyAddressList(&'static str),

    #[error("check_ips.{list}: {addr} is listed more than once")]
    DuplicateAddress { list: &'static str, addr: IpAddr },

    #[error("{0} must be a positive integer")]
    NotPositive(&'static str),

    #[error("{field} must be at most {max}")]
    TooLarge { field: &'static str, max: u64 },

    #[error("opnsense_ipmi.{0} must not be empty")]
    EmptyField(&'static str),

    #[error(
        "opnsense_ipmi needs credentials: set either user/password or credentials_file, not both"
    )]
    Credentials,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "critical" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level `{other}`")),
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_filter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(rename = "loglevel", default = "default_log_level")]
    pub log_level: LogLevel,

    /// How long to leave the router alone after a reset.
    /// In minutes.
    #[serde(rename = "reset_delay")]
    pub reset_delay_minutes: u64,

    /// If this is true, then resetting will not happen.
    /// Instead, we log that we would have reset the router.
    #[serde(default)]
    pub no_restart: bool,

    /// Time between two check cycles.
    /// In seconds.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    #[serde(default)]
    pub policy: AggregationPolicy,

    #[serde(default)]
    pub probe: ProbeConfig,

    pub check_ips: CheckIps,

    pub opnsense_ipmi: IpmiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckIps {
    /// Addresses on the same network as the router, e.g. the router's own LAN interface.
    pub local: Vec<IpAddr>,

    /// Addresses on the internet, reachable only through the router.
    pub global: Vec<IpAddr>,
}

/// How per-address failures are folded into a verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Down only when every local and every global address failed.
    #[default]
    AllUnreachable,

    /// Down when a local and a global address both failed,
    /// or when more than half of either list failed.
    Majority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMethod {
    /// Run the host's `ping` binary.
    #[default]
    Command,

    /// Send echo requests from an ICMP socket inside the process.
    Icmp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default)]
    pub method: ProbeMethod,

    /// Echo requests sent per probe; one reply is enough.
    #[serde(default = "default_probe_count")]
    pub count: u16,

    /// In seconds, per echo request.
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// Maximum number of probes in flight during one evaluation.
    /// 1 probes strictly one after another.
    #[serde(default = "default_probe_concurrency")]
    pub concurrency: usize,

    /// How many recent results to remember per address.
    #[serde(default = "default_probe_history")]
    pub history: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            method: ProbeMethod::default(),
            count: default_probe_count(),
            timeout_secs: default_probe_timeout(),
            concurrency: default_probe_concurrency(),
            history: default_probe_history(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Https => f.write_str("https"),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IpmiConfig {
    pub protocol: Protocol,
    pub ip: String,
    pub port: u16,

    /// Passed through to Redfish as `ResetType`, e.g. `On` or `ForceRestart`.
    pub reset_type: String,

    #[serde(default = "default_system_id")]
    pub system_id: String,

    /// BMCs usually present self-signed certificates.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    pub user: Option<String>,
    pub password: Option<String>,

    /// YAML file with `user` and `password` keys.
    /// Relative paths are resolved against the config file's directory.
    pub credentials_file: Option<PathBuf>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One week.
const MAX_RESET_DELAY_MINUTES: u64 = 7 * 24 * 60;
/// One day.
const MAX_CHECK_INTERVAL_SECS: u64 = 24 * 60 * 60;
const MAX_PROBE_TIMEOUT_SECS: u64 = 60;
const MAX_REQUEST_TIMEOUT_SECS: u64 = 300;

impl fmt::Debug for IpmiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpmiConfig")
            .field("protocol", &self.protocol)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("reset_type", &self.reset_type)
            .field("system_id", &self.system_id)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("timeout_secs", &self.timeout_secs)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("credentials_file", &self.credentials_file)
            .finish()
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_check_interval() -> u64 {
    60
}

fn default_probe_count() -> u16 {
    1
}

fn default_probe_timeout() -> u64 {
    2
}

fn default_probe_concurrency() -> usize {
    8
}

fn default_probe_history() -> usize {
    1
}

fn default_system_id() -> String {
    "Self".to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    10
}

/// Read and validate the config file at `path`.
pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: Config = parse(&text, path)?;

    // Credentials are resolved once here so the rest of the program
    // only ever sees inline user/password.
    if let Some(file) = config.opnsense_ipmi.credentials_file.take() {
        if config.opnsense_ipmi.user.is_some() || config.opnsense_ipmi.password.is_some() {
            return Err(ConfigError::Credentials);
        }
        let file = match path.parent() {
            Some(dir) if file.is_relative() => dir.join(file),
            _ => file,
        };
        let creds = load_credentials(&file)?;
        config.opnsense_ipmi.user = Some(creds.user);
        config.opnsense_ipmi.password = Some(creds.password);
    }

    config.validate()?;
    Ok(config)
}

fn parse<T: serde::de::DeserializeOwned>(text: &str, path: &Path) -> Result<T, ConfigError> {
    serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_credentials(path: &Path) -> Result<Credentials, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text, path)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reset_delay_minutes == 0 {
            return Err(ConfigError::NotPositive("reset_delay"));
        }
        at_most("reset_delay", self.reset_delay_minutes, MAX_RESET_DELAY_MINUTES)?;
        if self.check_interval_secs == 0 {
            return Err(ConfigError::NotPositive("check_interval_secs"));
        }
        at_most(
            "check_interval_secs",
            self.check_interval_secs,
            MAX_CHECK_INTERVAL_SECS,
        )?;
        if self.probe.count == 0 {
            return Err(ConfigError::NotPositive("probe.count"));
        }
        if self.probe.timeout_secs == 0 {
            return Err(ConfigError::NotPositive("probe.timeout_secs"));
        }
        at_most(
            "probe.timeout_secs",
            self.probe.timeout_secs,
            MAX_PROBE_TIMEOUT_SECS,
        )?;
        if self.probe.concurrency == 0 {
            return Err(ConfigError::NotPositive("probe.concurrency"));
        }
        if self.probe.history == 0 {
            return Err(ConfigError::NotPositive("probe.history"));
        }

        // An address in both lists would be probed and counted twice.
        let mut seen = HashSet::new();
        validate_list("local", &self.check_ips.local, &mut seen)?;
        validate_list("global", &self.check_ips.global, &mut seen)?;

        let ipmi = &self.opnsense_ipmi;
        if ipmi.ip.trim().is_empty() {
            return Err(ConfigError::EmptyField("ip"));
        }
        if ipmi.reset_type.trim().is_empty() {
            return Err(ConfigError::EmptyField("reset_type"));
        }
        if ipmi.system_id.trim().is_empty() {
            return Err(ConfigError::EmptyField("system_id"));
        }
        if ipmi.port == 0 {
            return Err(ConfigError::NotPositive("opnsense_ipmi.port"));
        }
        if ipmi.timeout_secs == 0 {
            return Err(ConfigError::NotPositive("opnsense_ipmi.timeout_secs"));
        }
        at_most(
            "opnsense_ipmi.timeout_secs",
            ipmi.timeout_secs,
            MAX_REQUEST_TIMEOUT_SECS,
        )?;
        if ipmi.credentials().is_none() {
            return Err(ConfigError::Credentials);
        }

        Ok(())
    }

    pub fn reset_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reset_delay_minutes.saturating_mul(60))
    }

    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval_secs)
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

impl IpmiConfig {
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.user, &self.password, &self.credentials_file) {
            (Some(user), Some(password), None) => Some(Credentials {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

fn at_most(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::TooLarge { field, max });
    }
    Ok(())
}

fn validate_list(
    list: &'static str,
    addrs: &[IpAddr],
    seen: &mut HashSet<IpAddr>,
) -> Result<(), ConfigError> {
    if addrs.is_empty() {
        return Err(ConfigError::EmptyAddressList(list));
    }
    for addr in addrs {
        if !seen.insert(*addr) {
            return Err(ConfigError::DuplicateAddress { list, addr: *addr });
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
loglevel: INFO
reset_delay: 10
no_restart: false
check_ips:
  local:
    - 10.0.0.1
  global:
    - 1.1.1.1
    - 2606:4700:4700::1111
opnsense_ipmi:
  protocol: https
  ip: 10.0.0.2
  port: 443
  reset_type: ForceRestart
  user: admin
  password: hunter2
"#;

    fn write_config(dir: &tempfile::TempDir, name: &str, text: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
        path
    }

    fn load_str(text: &str) -> Result<Config, ConfigError> {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "config.yml", text);
        load(path)
    }

    #[test]
    fn loads_sample_with_defaults() {
        let config = load_str(SAMPLE).unwrap();
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.reset_delay_minutes, 10);
        assert_eq!(config.reset_delay(), std::time::Duration::from_secs(600));
        assert!(!config.no_restart);
        assert_eq!(config.check_ips.local, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(config.check_ips.global.len(), 2);
        assert!(config.check_ips.global[1].is_ipv6());
        assert_eq!(config.opnsense_ipmi.protocol, Protocol::Https);
        assert_eq!(config.opnsense_ipmi.system_id, "Self");
        assert!(config.opnsense_ipmi.accept_invalid_certs);
        assert_eq!(config.policy, AggregationPolicy::AllUnreachable);
        assert_eq!(config.probe.method, ProbeMethod::Command);
        assert_eq!(config.probe.timeout_secs, 2);
        assert_eq!(config.check_interval_secs, 60);
    }

    #[test]
    fn log_level_accepts_python_names() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("critical".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("Debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn rejects_zero_reset_delay() {
        let text = SAMPLE.replace("reset_delay: 10", "reset_delay: 0");
        assert!(matches!(
            load_str(&text),
            Err(ConfigError::NotPositive("reset_delay"))
        ));
    }

    #[test]
    fn rejects_reset_delay_that_would_overflow() {
        let text = SAMPLE.replace("reset_delay: 10", "reset_delay: 400000000000000000");
        assert!(matches!(
            load_str(&text),
            Err(ConfigError::TooLarge { field: "reset_delay", .. })
        ));
    }

    #[test]
    fn accepts_reset_delay_of_one_week() {
        let text = SAMPLE.replace("reset_delay: 10", "reset_delay: 10080");
        let config = load_str(&text).unwrap();
        assert_eq!(config.reset_delay(), std::time::Duration::from_secs(604_800));
    }

    #[test]
    fn rejects_huge_timeouts_and_intervals() {
        let text = format!("{SAMPLE}probe:\n  count: 2\n  timeout_secs: 10000000000000000000\n");
        assert!(matches!(
            load_str(&text),
            Err(ConfigError::TooLarge { field: "probe.timeout_secs", .. })
        ));

        let text = format!("{SAMPLE}check_interval_secs: 18446744073709551615\n");
        assert!(matches!(
            load_str(&text),
            Err(ConfigError::TooLarge { field: "check_interval_secs", .. })
        ));

        let text = format!("{SAMPLE}  timeout_secs: 100000\n");
        assert!(matches!(
            load_str(&text),
            Err(ConfigError::TooLarge { field: "opnsense_ipmi.timeout_secs", .. })
        ));
    }

    #[test]
    fn reset_delay_saturates_instead_of_overflowing() {
        let mut config = fixtures::config(&["10.0.0.1"], &["1.1.1.1"]);
        config.reset_delay_minutes = u64::MAX;
        assert_eq!(config.reset_delay(), std::time::Duration::from_secs(u64::MAX));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_reset_delay() {
        let text = SAMPLE.replace("reset_delay: 10", "reset_delay: -5");
        assert!(matches!(load_str(&text), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn rejects_missing_reset_delay() {
        let text = SAMPLE.replace("reset_delay: 10\n", "");
        assert!(matches!(load_str(&text), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn rejects_unknown_protocol() {
        let text = SAMPLE.replace("protocol: https", "protocol: ftp");
        assert!(matches!(load_str(&text), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn rejects_malformed_address() {
        let text = SAMPLE.replace("- 10.0.0.1", "- 10.0.0.300");
        assert!(matches!(load_str(&text), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn rejects_empty_local_list() {
        let text = SAMPLE.replace("  local:\n    - 10.0.0.1\n", "  local: []\n");
        assert!(matches!(
            load_str(&text),
            Err(ConfigError::EmptyAddressList("local"))
        ));
    }

    #[test]
    fn rejects_duplicate_addresses() {
        let text = SAMPLE.replace("    - 2606:4700:4700::1111", "    - 1.1.1.1");
        assert!(matches!(
            load_str(&text),
            Err(ConfigError::DuplicateAddress { list: "global", .. })
        ));
    }

    #[test]
    fn rejects_address_in_both_lists() {
        let text = SAMPLE.replace("    - 1.1.1.1", "    - 10.0.0.1");
        assert!(matches!(
            load_str(&text),
            Err(ConfigError::DuplicateAddress { list: "global", .. })
        ));
    }

    #[test]
    fn rejects_missing_credentials() {
        let text = SAMPLE
            .replace("  user: admin\n", "")
            .replace("  password: hunter2\n", "");
        assert!(matches!(load_str(&text), Err(ConfigError::Credentials)));
    }

    #[test]
    fn reads_credentials_file_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        write_config(&dir, "login.yml", "user: root\npassword: secret\n");
        let text = SAMPLE
            .replace("  user: admin\n", "")
            .replace("  password: hunter2\n", "  credentials_file: login.yml\n");
        let path = write_config(&dir, "config.yml", &text);

        let config = load(path).unwrap();
        let creds = config.opnsense_ipmi.credentials().unwrap();
        assert_eq!(creds.user, "root");
        assert_eq!(creds.password, "secret");
        assert!(config.opnsense_ipmi.credentials_file.is_none());
    }

    #[test]
    fn rejects_both_credential_sources() {
        let dir = tempfile::tempdir().unwrap();
        write_config(&dir, "login.yml", "user: root\npassword: secret\n");
        let text = format!("{SAMPLE}  credentials_file: login.yml\n");
        let path = write_config(&dir, "config.yml", &text);
        assert!(matches!(load(path), Err(ConfigError::Credentials)));
    }

    #[test]
    fn missing_credentials_file_is_a_read_error() {
        let text = SAMPLE
            .replace("  user: admin\n", "")
            .replace("  password: hunter2\n", "  credentials_file: nope.yml\n");
        assert!(matches!(load_str(&text), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn parses_probe_and_policy_sections() {
        let text = format!(
            "{SAMPLE}policy: majority\nprobe:\n  method: icmp\n  count: 3\n  concurrency: 1\n  history: 5\n"
        );
        let config = load_str(&text).unwrap();
        assert_eq!(config.policy, AggregationPolicy::Majority);
        assert_eq!(config.probe.method, ProbeMethod::Icmp);
        assert_eq!(config.probe.count, 3);
        assert_eq!(config.probe.concurrency, 1);
        assert_eq!(config.probe.history, 5);
        assert_eq!(config.probe.timeout_secs, 2);
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let creds = Credentials {
            user: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));

        let config = load_str(SAMPLE).unwrap();
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
        assert!(printed.contains("admin"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load(dir.path().join("absent.yml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
