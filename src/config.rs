//! Command-line surface and validated run configuration.
//!
//! [`Args`] is the raw clap view of the command line. [`Args::into_config`]
//! turns it into a [`Config`], rejecting anything malformed before a single
//! socket is created.

use std::fmt;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Largest accepted write chunk: 64 MiB.
pub const MAX_WRITE_CHUNK: usize = 64 * 1024 * 1024;

/// Write chunk used when `--write-length` is not given.
pub const DEFAULT_WRITE_CHUNK: usize = 64 * 1024;

const DEFAULT_SERVER_ADDRESS: &str = "0.0.0.0";
const DEFAULT_CLIENT_ADDRESS: &str = "127.0.0.1";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bad port '{0}': expected an integer in 1-65535")]
    BadPort(String),

    #[error("bad address '{0}': server address must be a dotted quad")]
    BadAddress(String),

    #[error("bad duration '{0}': expected a positive number of seconds")]
    BadDuration(String),

    #[error("bad size '{0}': expected a positive integer with optional k/m/g/t/p/e suffix")]
    BadSize(String),

    #[error("write length '{0}' exceeds the 64 MiB limit")]
    ChunkTooLarge(String),

    #[error("bad toggle '{0}': expected on/off, yes/no or enabled/disabled")]
    BadToggle(String),

    #[error("expected [addr] port, got {0} positional arguments")]
    BadEndpoint(usize),
}

// ---------------------------------------------------------------------------
// Role / Mode / OutputFormat
// ---------------------------------------------------------------------------

/// Which side of the connection this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

/// Whether sessions write generated data or only consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Generator,
    Sink,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Generator => f.write_str("generator"),
            Mode::Sink => f.write_str("sink"),
        }
    }
}

/// How measurement output is rendered on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Args (clap)
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(
    name = "tcpspeedtest",
    about = "Measure sustained TCP throughput between two hosts",
    version,
    long_about = None
)]
pub struct Args {
    /// Listen for incoming connections
    #[arg(long, conflicts_with = "client")]
    pub server: bool,

    /// Connect to a listening peer (default)
    #[arg(long)]
    pub client: bool,

    /// Write generated data continuously (client default)
    #[arg(long, conflicts_with = "sink")]
    pub generator: bool,

    /// Only read and discard incoming data (server default)
    #[arg(long)]
    pub sink: bool,

    /// Terminate every connection after SECS seconds
    #[arg(long, value_name = "SECS", value_parser = parse_timeout)]
    pub timeout: Option<Duration>,

    /// Print a rate report every SECS seconds
    #[arg(long, value_name = "SECS", value_parser = parse_interval)]
    pub interval: Option<Duration>,

    /// Bytes per write, with optional k/m/g/t/p/e suffix (max 64M)
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub write_length: Option<usize>,

    /// Set TCP_NODELAY on every connection
    #[arg(
        long,
        value_name = "on|off",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "on",
        value_parser = parse_toggle
    )]
    pub nodelay: Option<bool>,

    /// Emit one JSON object per line instead of text
    #[arg(long)]
    pub json: bool,

    /// [addr] port
    #[arg(value_name = "ADDR PORT", num_args = 1..=2, required = true)]
    pub endpoint: Vec<String>,
}

impl Args {
    /// Resolve defaults and validate positionals into a [`Config`].
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let role = if self.server { Role::Server } else { Role::Client };

        // Generator unless explicitly a sink, or a server left to its default.
        let mode = if self.generator {
            Mode::Generator
        } else if self.sink || role == Role::Server {
            Mode::Sink
        } else {
            Mode::Generator
        };

        let (address, port) = match self.endpoint.as_slice() {
            [port] => (None, port),
            [address, port] => (Some(address.as_str()), port),
            other => return Err(ConfigError::BadEndpoint(other.len())),
        };
        let port = parse_port(port)?;

        let address = match (role, address) {
            (Role::Server, Some(addr)) => parse_dotted_quad(addr)?,
            (Role::Client, Some(addr)) => addr.to_string(),
            (Role::Server, None) => DEFAULT_SERVER_ADDRESS.to_string(),
            (Role::Client, None) => DEFAULT_CLIENT_ADDRESS.to_string(),
        };

        Ok(Config {
            role,
            mode,
            address,
            port,
            no_delay: self.nodelay.unwrap_or(false),
            write_chunk_size: self.write_length.unwrap_or(DEFAULT_WRITE_CHUNK),
            report_interval: self.interval,
            idle_timeout: self.timeout,
            output: if self.json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Validated, immutable run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub role: Role,
    pub mode: Mode,
    /// Listen address (server) or connect target (client).
    pub address: String,
    /// Port 0 asks the OS for an ephemeral port (server, library use only).
    pub port: u16,
    pub no_delay: bool,
    pub write_chunk_size: usize,
    pub report_interval: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub output: OutputFormat,
}

impl Config {
    /// A sink server on all interfaces.
    pub fn server(port: u16) -> Self {
        Self {
            role: Role::Server,
            mode: Mode::Sink,
            address: DEFAULT_SERVER_ADDRESS.to_string(),
            port,
            no_delay: false,
            write_chunk_size: DEFAULT_WRITE_CHUNK,
            report_interval: None,
            idle_timeout: None,
            output: OutputFormat::Text,
        }
    }

    /// A generator client connecting to `address:port`.
    pub fn client(address: impl Into<String>, port: u16) -> Self {
        Self {
            role: Role::Client,
            mode: Mode::Generator,
            address: address.into(),
            port,
            ..Self::server(port)
        }
    }

    /// Bind or connect address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Generator or sink.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Set `TCP_NODELAY` on every connection.
    pub fn with_no_delay(mut self, no_delay: bool) -> Self {
        self.no_delay = no_delay;
        self
    }

    /// Bytes per write in generator mode.
    pub fn with_write_chunk_size(mut self, size: usize) -> Self {
        self.write_chunk_size = size;
        self
    }

    /// Emit rate reports at most this often.
    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = Some(interval);
        self
    }

    /// Server: stop everything after this long. Client: close after this long connected.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }

    /// `address:port` as handed to bind / connect.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Re-check the invariants [`Args::into_config`] guarantees, for configs
    /// assembled by hand.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_chunk_size == 0 {
            return Err(ConfigError::BadSize(self.write_chunk_size.to_string()));
        }
        if self.write_chunk_size > MAX_WRITE_CHUNK {
            return Err(ConfigError::ChunkTooLarge(
                self.write_chunk_size.to_string(),
            ));
        }
        for duration in [self.report_interval, self.idle_timeout].into_iter().flatten() {
            if duration.is_zero() {
                return Err(ConfigError::BadDuration(format!("{:?}", duration)));
            }
        }
        match self.role {
            Role::Server => {
                parse_dotted_quad(&self.address)?;
            }
            Role::Client => {
                if self.port == 0 {
                    return Err(ConfigError::BadPort("0".into()));
                }
                if self.address.is_empty() {
                    return Err(ConfigError::BadAddress(String::new()));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Value parsers
// ---------------------------------------------------------------------------

/// Port: one to five digits, value in 1-65535.
pub fn parse_port(s: &str) -> Result<u16, ConfigError> {
    let bad = || ConfigError::BadPort(s.to_string());
    if s.is_empty() || s.len() > 5 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    match s.parse::<u32>() {
        Ok(port @ 1..=65535) => Ok(port as u16),
        _ => Err(bad()),
    }
}

/// Dotted quad with octets in 0-255, normalized (`010.0.0.1` -> `10.0.0.1`).
pub fn parse_dotted_quad(s: &str) -> Result<String, ConfigError> {
    let bad = || ConfigError::BadAddress(s.to_string());
    let octets: Vec<&str> = s.split('.').collect();
    if octets.len() != 4 {
        return Err(bad());
    }
    let mut normalized = Vec::with_capacity(4);
    for octet in octets {
        if octet.is_empty() || octet.len() > 3 || !octet.bytes().all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }
        let value: u16 = octet.parse().map_err(|_| bad())?;
        if value > 255 {
            return Err(bad());
        }
        normalized.push(value.to_string());
    }
    Ok(normalized.join("."))
}

/// Positive decimal seconds: `2`, `0.5`, `1.25`.
fn parse_seconds(s: &str) -> Result<f64, ConfigError> {
    let bad = || ConfigError::BadDuration(s.to_string());
    let (whole, fraction) = match s.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (s, None),
    };
    let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !digits(whole) || fraction.is_some_and(|f| !digits(f)) {
        return Err(bad());
    }
    let secs: f64 = s.parse().map_err(|_| bad())?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(bad());
    }
    Ok(secs)
}

/// Idle timeout, resolved to whole milliseconds (at least 1 ms).
pub fn parse_timeout(s: &str) -> Result<Duration, ConfigError> {
    let secs = parse_seconds(s)?;
    let millis = (secs * 1000.0).round().max(1.0);
    if millis > u64::MAX as f64 {
        return Err(ConfigError::BadDuration(s.to_string()));
    }
    Ok(Duration::from_millis(millis as u64))
}

/// Report interval, kept at full precision.
pub fn parse_interval(s: &str) -> Result<Duration, ConfigError> {
    let secs = parse_seconds(s)?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::BadDuration(s.to_string()))
}

/// Byte count with optional binary suffix, capped at [`MAX_WRITE_CHUNK`].
pub fn parse_size(s: &str) -> Result<usize, ConfigError> {
    let bad = || ConfigError::BadSize(s.to_string());
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    if digits.is_empty() || digits.starts_with('0') {
        return Err(bad());
    }
    let shift = match suffix {
        "" => 0,
        "k" | "K" => 10,
        "m" | "M" => 20,
        "g" | "G" => 30,
        "t" | "T" => 40,
        "p" | "P" => 50,
        "e" | "E" => 60,
        _ => return Err(bad()),
    };
    let too_large = || ConfigError::ChunkTooLarge(s.to_string());
    let base: u64 = digits.parse().map_err(|_| too_large())?;
    let bytes = base.checked_mul(1u64 << shift).ok_or_else(too_large)?;
    if bytes > MAX_WRITE_CHUNK as u64 {
        return Err(too_large());
    }
    Ok(bytes as usize)
}

/// `on|yes|enabled` / `off|no|disabled`.
pub fn parse_toggle(s: &str) -> Result<bool, ConfigError> {
    match s {
        "on" | "yes" | "enabled" => Ok(true),
        "off" | "no" | "disabled" => Ok(false),
        _ => Err(ConfigError::BadToggle(s.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, String> {
        let mut argv = vec!["tcpspeedtest"];
        argv.extend_from_slice(args);
        let args = Args::try_parse_from(argv).map_err(|e| e.to_string())?;
        args.into_config().map_err(|e| e.to_string())
    }

    #[test]
    fn test_client_defaults() {
        let config = parse(&["9000"]).unwrap();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.mode, Mode::Generator);
        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert!(!config.no_delay);
        assert_eq!(config.write_chunk_size, 64 * 1024);
        assert_eq!(config.report_interval, None);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.output, OutputFormat::Text);
    }

    #[test]
    fn test_server_defaults_to_sink_on_all_interfaces() {
        let config = parse(&["--server", "9000"]).unwrap();
        assert_eq!(config.role, Role::Server);
        assert_eq!(config.mode, Mode::Sink);
        assert_eq!(config.address, "0.0.0.0");
    }

    #[test]
    fn test_server_generator_explicit() {
        let config = parse(&["--server", "--generator", "10.0.0.1", "9000"]).unwrap();
        assert_eq!(config.mode, Mode::Generator);
        assert_eq!(config.address, "10.0.0.1");
    }

    #[test]
    fn test_client_sink_explicit() {
        let config = parse(&["--client", "--sink", "example.net", "80"]).unwrap();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.mode, Mode::Sink);
        assert_eq!(config.address, "example.net");
    }

    #[test]
    fn test_conflicting_flags_rejected() {
        assert!(parse(&["--server", "--client", "9000"]).is_err());
        assert!(parse(&["--generator", "--sink", "9000"]).is_err());
    }

    #[test]
    fn test_duplicate_flags_rejected() {
        assert!(parse(&["--server", "--server", "9000"]).is_err());
        assert!(parse(&["--timeout=1", "--timeout=2", "9000"]).is_err());
    }

    #[test]
    fn test_positionals() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["a", "b", "9000"]).is_err());
        assert!(parse(&["0"]).is_err());
        assert!(parse(&["65536"]).is_err());
        assert!(parse(&["123456"]).is_err());
        assert!(parse(&["port"]).is_err());
        assert_eq!(parse(&["65535"]).unwrap().port, 65535);
    }

    #[test]
    fn test_server_address_normalized() {
        let config = parse(&["--server", "010.001.000.255", "9000"]).unwrap();
        assert_eq!(config.address, "10.1.0.255");
    }

    #[test]
    fn test_server_address_rejected() {
        assert!(parse(&["--server", "256.0.0.1", "9000"]).is_err());
        assert!(parse(&["--server", "localhost", "9000"]).is_err());
        assert!(parse(&["--server", "1.2.3", "9000"]).is_err());
        assert!(parse(&["--server", "1.2.3.4.5", "9000"]).is_err());
    }

    #[test]
    fn test_parse_timeout() {
        assert_eq!(parse_timeout("2").unwrap(), Duration::from_millis(2000));
        assert_eq!(parse_timeout("1.5").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_timeout("0.0001").unwrap(), Duration::from_millis(1));
        assert!(parse_timeout("0").is_err());
        assert!(parse_timeout("0.0").is_err());
        assert!(parse_timeout("-1").is_err());
        assert!(parse_timeout("1.").is_err());
        assert!(parse_timeout(".5").is_err());
        assert!(parse_timeout("1s").is_err());
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("0.25").unwrap(), Duration::from_millis(250));
        assert!(parse_interval("0").is_err());
        assert!(parse_interval("abc").is_err());
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("1").unwrap(), 1);
        assert_eq!(parse_size("100").unwrap(), 100);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("2M").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("64m").unwrap(), MAX_WRITE_CHUNK);
    }

    #[test]
    fn test_parse_size_limits() {
        assert_eq!(parse_size("65m"), Err(ConfigError::ChunkTooLarge("65m".into())));
        assert!(matches!(parse_size("1g"), Err(ConfigError::ChunkTooLarge(_))));
        assert!(matches!(parse_size("16e"), Err(ConfigError::ChunkTooLarge(_))));
        assert!(matches!(
            parse_size("99999999999999999999999"),
            Err(ConfigError::ChunkTooLarge(_))
        ));
        assert!(matches!(parse_size("0"), Err(ConfigError::BadSize(_))));
        assert!(matches!(parse_size("k"), Err(ConfigError::BadSize(_))));
        assert!(matches!(parse_size("10x"), Err(ConfigError::BadSize(_))));
        assert!(matches!(parse_size("10kb"), Err(ConfigError::BadSize(_))));
    }

    #[test]
    fn test_nodelay_forms() {
        assert!(parse(&["--nodelay", "9000"]).unwrap().no_delay);
        assert!(parse(&["--nodelay=yes", "9000"]).unwrap().no_delay);
        assert!(parse(&["--nodelay=enabled", "9000"]).unwrap().no_delay);
        assert!(!parse(&["--nodelay=off", "9000"]).unwrap().no_delay);
        assert!(!parse(&["--nodelay=disabled", "9000"]).unwrap().no_delay);
        assert!(parse(&["--nodelay=maybe", "9000"]).is_err());
    }

    #[test]
    fn test_full_command_line() {
        let config = parse(&[
            "--client",
            "--generator",
            "--timeout=2.5",
            "--interval=1",
            "--write-length=128k",
            "--nodelay",
            "--json",
            "192.168.1.10",
            "5201",
        ])
        .unwrap();
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.report_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.write_chunk_size, 128 * 1024);
        assert!(config.no_delay);
        assert_eq!(config.output, OutputFormat::Json);
        assert_eq!(config.endpoint(), "192.168.1.10:5201");
    }

    #[test]
    fn test_validate_hand_built_configs() {
        assert!(Config::server(0).validate().is_ok());
        assert!(Config::client("127.0.0.1", 9000).validate().is_ok());
        assert!(Config::client("127.0.0.1", 0).validate().is_err());
        assert!(Config::server(9000)
            .with_write_chunk_size(MAX_WRITE_CHUNK + 1)
            .validate()
            .is_err());
        assert!(Config::server(9000).with_write_chunk_size(0).validate().is_err());
        assert!(Config::server(9000)
            .with_address("not-an-ip")
            .validate()
            .is_err());
        assert!(Config::server(9000)
            .with_idle_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
