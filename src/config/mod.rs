use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATABASE: &str = "central_server.db";
pub const DEFAULT_CERT: &str = "certs/server.crt";
pub const DEFAULT_KEY: &str = "certs/server.key";
pub const DEFAULT_LOG: &str = "logs/central_server.log";
pub const DEFAULT_MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(239, 192, 0, 1);
pub const DEFAULT_MULTICAST_PORT: u16 = 30001;

/// Tuning values the CLI does not cover, loadable from a TOML file via
/// `--config`. Every field has a default, so a partial file is fine.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerTuning {
    pub session_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub data_collection_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub store_pool_size: usize,
    pub max_frame_size_bytes: usize,
}

impl Default for ServerTuning {
    fn default() -> Self {
        Self {
            session_timeout_secs: 3600,
            cleanup_interval_secs: 300,
            data_collection_interval_secs: 60,
            heartbeat_interval_secs: 30,
            store_pool_size: 5,
            max_frame_size_bytes: 1024 * 1024,
        }
    }
}

impl ServerTuning {
    pub fn load_from_toml(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let content = fs::read_to_string(path.as_ref()).map_err(|source| OptionsError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| OptionsError::TomlParse {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerOptions {
    pub port: u16,
    pub database: String,
    pub cert: String,
    pub key: String,
    pub log: String,
    pub verbose: bool,
    pub multicast_enabled: bool,
    pub multicast_address: Ipv4Addr,
    pub multicast_port: u16,
    pub tuning: ServerTuning,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database: DEFAULT_DATABASE.to_owned(),
            cert: DEFAULT_CERT.to_owned(),
            key: DEFAULT_KEY.to_owned(),
            log: DEFAULT_LOG.to_owned(),
            verbose: false,
            multicast_enabled: false,
            multicast_address: DEFAULT_MULTICAST_ADDRESS,
            multicast_port: DEFAULT_MULTICAST_PORT,
            tuning: ServerTuning::default(),
        }
    }
}

#[derive(Debug)]
pub enum OptionsError {
    HelpRequested,
    MissingValue {
        flag: String,
    },
    InvalidValue {
        flag: String,
        value: String,
        expected: &'static str,
    },
    UnknownFlag {
        flag: String,
    },
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HelpRequested => write!(f, "help requested"),
            Self::MissingValue { flag } => write!(f, "missing value for '{flag}'"),
            Self::InvalidValue {
                flag,
                value,
                expected,
            } => write!(f, "invalid value '{value}' for '{flag}', expected {expected}"),
            Self::UnknownFlag { flag } => write!(f, "unknown flag '{flag}'"),
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
        }
    }
}

impl std::error::Error for OptionsError {}

pub fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [options]\n\
         Options:\n\
         \x20 -p, --port <port>        Server port (default: {DEFAULT_PORT})\n\
         \x20 -c, --config <file>      Tuning file (TOML)\n\
         \x20 -d, --database <path>    Database file path\n\
         \x20 --cert <file>            TLS certificate file\n\
         \x20 --key <file>             TLS private key file\n\
         \x20 -l, --log <file>         Log file path\n\
         \x20 -v, --verbose            Enable verbose logging\n\
         \x20 --mcast on|off           UDP multicast DISCOVER/ANNOUNCE (default: off)\n\
         \x20 --maddr <ip>             Multicast address (default: {DEFAULT_MULTICAST_ADDRESS})\n\
         \x20 --mport <port>           Multicast port    (default: {DEFAULT_MULTICAST_PORT})\n\
         \x20 -h, --help               Show this help message"
    )
}

impl ServerOptions {
    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, OptionsError> {
        let mut options = Self::default();
        let mut config_file: Option<String> = None;
        let mut iter = args.into_iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-h" | "--help" => return Err(OptionsError::HelpRequested),
                "-p" | "--port" => {
                    options.port = parse_value(&arg, iter.next(), "port number")?;
                }
                "-c" | "--config" => {
                    config_file = Some(take_value(&arg, iter.next())?);
                }
                "-d" | "--database" => {
                    options.database = take_value(&arg, iter.next())?;
                }
                "--cert" => {
                    options.cert = take_value(&arg, iter.next())?;
                }
                "--key" => {
                    options.key = take_value(&arg, iter.next())?;
                }
                "-l" | "--log" => {
                    options.log = take_value(&arg, iter.next())?;
                }
                "-v" | "--verbose" => {
                    options.verbose = true;
                }
                "--mcast" => {
                    let value = take_value(&arg, iter.next())?;
                    options.multicast_enabled = match value.to_ascii_lowercase().as_str() {
                        "on" | "1" | "true" => true,
                        "off" | "0" | "false" => false,
                        _ => {
                            return Err(OptionsError::InvalidValue {
                                flag: arg,
                                value,
                                expected: "on|off",
                            })
                        }
                    };
                }
                "--maddr" => {
                    options.multicast_address =
                        parse_value(&arg, iter.next(), "IPv4 multicast address")?;
                }
                "--mport" => {
                    options.multicast_port = parse_value(&arg, iter.next(), "port number")?;
                }
                _ => return Err(OptionsError::UnknownFlag { flag: arg }),
            }
        }

        if let Some(path) = config_file {
            options.tuning = ServerTuning::load_from_toml(&path)?;
        }

        Ok(options)
    }
}

fn take_value(flag: &str, value: Option<String>) -> Result<String, OptionsError> {
    value.ok_or_else(|| OptionsError::MissingValue {
        flag: flag.to_owned(),
    })
}

fn parse_value<T: std::str::FromStr>(
    flag: &str,
    value: Option<String>,
    expected: &'static str,
) -> Result<T, OptionsError> {
    let raw = take_value(flag, value)?;
    raw.parse().map_err(|_| OptionsError::InvalidValue {
        flag: flag.to_owned(),
        value: raw,
        expected,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    use super::{OptionsError, ServerOptions, ServerTuning};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| (*arg).to_owned()).collect()
    }

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "faregate-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = ServerOptions::parse(Vec::new()).expect("empty args should parse");
        assert_eq!(options.port, 8080);
        assert_eq!(options.database, "central_server.db");
        assert_eq!(options.cert, "certs/server.crt");
        assert_eq!(options.key, "certs/server.key");
        assert_eq!(options.log, "logs/central_server.log");
        assert!(!options.verbose);
        assert!(!options.multicast_enabled);
        assert_eq!(options.multicast_address, Ipv4Addr::new(239, 192, 0, 1));
        assert_eq!(options.multicast_port, 30001);
        assert_eq!(options.tuning.session_timeout_secs, 3600);
        assert_eq!(options.tuning.store_pool_size, 5);
    }

    #[test]
    fn flags_override_defaults() {
        let options = ServerOptions::parse(args(&[
            "--port", "8090", "-d", "admin.db", "--mcast", "on", "--maddr", "239.192.0.7",
            "--mport", "30002", "-v",
        ]))
        .expect("flags should parse");

        assert_eq!(options.port, 8090);
        assert_eq!(options.database, "admin.db");
        assert!(options.multicast_enabled);
        assert_eq!(options.multicast_address, Ipv4Addr::new(239, 192, 0, 7));
        assert_eq!(options.multicast_port, 30002);
        assert!(options.verbose);
    }

    #[test]
    fn rejects_unknown_flag_and_missing_value() {
        let unknown = ServerOptions::parse(args(&["--nope"])).expect_err("unknown flag");
        assert!(matches!(unknown, OptionsError::UnknownFlag { .. }));

        let missing = ServerOptions::parse(args(&["--port"])).expect_err("missing value");
        assert!(matches!(missing, OptionsError::MissingValue { .. }));

        let invalid = ServerOptions::parse(args(&["--mcast", "maybe"])).expect_err("bad toggle");
        assert!(matches!(invalid, OptionsError::InvalidValue { .. }));
    }

    #[test]
    fn help_flag_short_circuits() {
        let error = ServerOptions::parse(args(&["-h"])).expect_err("help should short-circuit");
        assert!(matches!(error, OptionsError::HelpRequested));
    }

    #[test]
    fn tuning_file_overrides_defaults_partially() {
        let path = write_temp_config(
            r#"
session_timeout_secs = 60
store_pool_size = 2
"#,
            "partial",
        );

        let options =
            ServerOptions::parse(args(&["--config", path.to_str().expect("utf8 path")]))
                .expect("config file should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(options.tuning.session_timeout_secs, 60);
        assert_eq!(options.tuning.store_pool_size, 2);
        // untouched fields keep their defaults
        assert_eq!(options.tuning.heartbeat_interval_secs, 30);
        assert_eq!(options.tuning, ServerTuning {
            session_timeout_secs: 60,
            store_pool_size: 2,
            ..ServerTuning::default()
        });
    }

    #[test]
    fn tuning_file_rejects_unknown_keys() {
        let path = write_temp_config("not_a_real_key = 1\n", "unknown-key");
        let error = ServerOptions::parse(args(&["--config", path.to_str().expect("utf8 path")]))
            .expect_err("unknown key should fail");
        fs::remove_file(path).expect("temp config cleanup should succeed");
        assert!(matches!(error, OptionsError::TomlParse { .. }));
    }
}
