//! Configuration of the relaykit servers
//!
//! A configuration file is a JSON5 document:
//!
//! ```json
//! {
//!     // SOCKS5 server, CONNECT and optionally UDP ASSOCIATE
//!     "socks5": {
//!         "listen": "127.0.0.1:1080",
//!         "users": [
//!             { "name": "alice", "password": "s3cret" }
//!         ],
//!         "udp_associate": true
//!     },
//!     // UDP datagrams carried on TCP with length-delimited envelopes
//!     "udp_tunnel": { "listen": "127.0.0.1:1081" },
//!     // request/response RPC endpoint
//!     "rpc": { "listen": "127.0.0.1:7000" },
//!
//!     "timeout": 10,
//!     "idle_timeout": 300,
//!     "worker_count": 4
//! }
//! ```
//!
//! At least one of `socks5`, `udp_tunnel` and `rpc` has to be present.

use std::{
    fmt::{self, Debug, Display, Formatter},
    fs::OpenOptions,
    io::{self, Read},
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use relaykit::relay::socks5::PasswdAuth;
use serde::Deserialize;

/// Default handshake, connect and graceful disconnect timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default idle timeout of a session
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    socks5: Option<RawSocks5Config>,
    #[serde(default)]
    udp_tunnel: Option<RawListenConfig>,
    #[serde(default)]
    rpc: Option<RawListenConfig>,

    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    idle_timeout: Option<u64>,
    #[serde(default)]
    worker_count: Option<usize>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RawSocks5Config {
    listen: Option<String>,
    #[serde(default)]
    users: Vec<RawUser>,
    #[serde(default)]
    udp_associate: bool,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RawUser {
    name: String,
    password: String,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RawListenConfig {
    listen: Option<String>,
}

/// SOCKS5 server configuration
#[derive(Clone, Debug)]
pub struct Socks5Config {
    /// Listen address of the TCP control connections
    pub listen: SocketAddr,
    /// Username/password table, anonymous access when empty
    pub auth: PasswdAuth,
    /// Whether UDP ASSOCIATE is served
    pub udp_associate: bool,
}

impl Socks5Config {
    pub fn new(listen: SocketAddr) -> Socks5Config {
        Socks5Config {
            listen,
            auth: PasswdAuth::new(),
            udp_associate: false,
        }
    }
}

/// Configuration of a server that only needs a listen address
#[derive(Clone, Debug)]
pub struct ListenConfig {
    pub listen: SocketAddr,
}

impl ListenConfig {
    pub fn new(listen: SocketAddr) -> ListenConfig {
        ListenConfig { listen }
    }
}

/// Configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// SOCKS5 server
    pub socks5: Option<Socks5Config>,
    /// UDP-over-TCP tunnel server
    pub udp_tunnel: Option<ListenConfig>,
    /// RPC server
    pub rpc: Option<ListenConfig>,

    /// Handshake, connect and graceful disconnect timeout
    pub timeout: Duration,
    /// Sessions without traffic for this long are closed
    pub idle_timeout: Duration,

    /// Workers in runtime, `1` builds a current thread runtime
    pub worker_count: usize,

    /// Configuration file path, the actual path of the configuration.
    pub config_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

/// Configuration parsing error kind
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing required fields in JSON configuration
    MissingField,
    /// Missing some keys that must be provided together
    Malformed,
    /// Invalid value of configuration
    Invalid,
    /// Invalid JSON
    JsonParsingError,
    /// `std::io::Error`
    IoError,
}

/// Configuration parsing error
pub struct Error {
    pub kind: ErrorKind,
    pub desc: &'static str,
    pub detail: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, desc: &'static str, detail: Option<String>) -> Error {
        Error { kind, desc, detail }
    }
}

macro_rules! impl_from {
    ($error:ty, $kind:expr, $desc:expr) => {
        impl From<$error> for Error {
            fn from(err: $error) -> Self {
                Error::new($kind, $desc, Some(format!("{:?}", err)))
            }
        }
    };
}

impl_from!(io::Error, ErrorKind::IoError, "error while reading file");
impl_from!(json5::Error, ErrorKind::JsonParsingError, "json parse error");

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.detail {
            None => write!(f, "{}", self.desc),
            Some(ref det) => write!(f, "{} {}", self.desc, det),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.detail {
            None => f.write_str(self.desc),
            Some(ref d) => write!(f, "{}, {}", self.desc, d),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, err.to_string())
    }
}

fn parse_listen(listen: Option<String>, section: &'static str) -> Result<SocketAddr, Error> {
    let listen = match listen {
        Some(l) => l,
        None => {
            let err = Error::new(
                ErrorKind::MissingField,
                "missing `listen` in server configuration",
                Some(section.to_owned()),
            );
            return Err(err);
        }
    };

    listen.parse::<SocketAddr>().map_err(|_| {
        Error::new(
            ErrorKind::Malformed,
            "`listen` should be an \"ip:port\" address",
            Some(format!("{section}: {listen}")),
        )
    })
}

impl Config {
    /// Creates an empty configuration
    pub fn new() -> Config {
        Config {
            socks5: None,
            udp_tunnel: None,
            rpc: None,
            timeout: DEFAULT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            worker_count: 1,
            config_path: None,
        }
    }

    fn load_from_raw(raw: RawConfig) -> Result<Config, Error> {
        let mut config = Config::new();

        if let Some(socks5) = raw.socks5 {
            let listen = parse_listen(socks5.listen, "socks5")?;

            let mut auth = PasswdAuth::new();
            for user in socks5.users {
                // RFC1929 carries both fields with a single length byte
                if user.name.is_empty() || user.name.len() > 255 {
                    let err = Error::new(
                        ErrorKind::Invalid,
                        "socks5 user name must be 1 to 255 bytes",
                        Some(user.name),
                    );
                    return Err(err);
                }
                if user.password.len() > 255 {
                    let err = Error::new(
                        ErrorKind::Invalid,
                        "socks5 password must be at most 255 bytes",
                        Some(user.name),
                    );
                    return Err(err);
                }
                auth.add_user(user.name, user.password);
            }

            config.socks5 = Some(Socks5Config {
                listen,
                auth,
                udp_associate: socks5.udp_associate,
            });
        }

        if let Some(tunnel) = raw.udp_tunnel {
            config.udp_tunnel = Some(ListenConfig::new(parse_listen(tunnel.listen, "udp_tunnel")?));
        }

        if let Some(rpc) = raw.rpc {
            config.rpc = Some(ListenConfig::new(parse_listen(rpc.listen, "rpc")?));
        }

        if let Some(timeout) = raw.timeout {
            if timeout == 0 {
                return Err(Error::new(ErrorKind::Invalid, "`timeout` must be positive", None));
            }
            config.timeout = Duration::from_secs(timeout);
        }

        if let Some(idle_timeout) = raw.idle_timeout {
            if idle_timeout == 0 {
                return Err(Error::new(ErrorKind::Invalid, "`idle_timeout` must be positive", None));
            }
            config.idle_timeout = Duration::from_secs(idle_timeout);
        }

        if let Some(worker_count) = raw.worker_count {
            if worker_count == 0 {
                return Err(Error::new(ErrorKind::Invalid, "`worker_count` must be positive", None));
            }
            config.worker_count = worker_count;
        }

        config.check_integrity()?;
        Ok(config)
    }

    /// Load configuration from a JSON5 string
    pub fn load_from_str(s: &str) -> Result<Config, Error> {
        let raw = json5::from_str::<RawConfig>(s)?;
        Config::load_from_raw(raw)
    }

    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(filename: P) -> Result<Config, Error> {
        let filename = filename.as_ref();

        let mut reader = OpenOptions::new().read(true).open(filename)?;
        let mut content = String::new();
        reader.read_to_string(&mut content)?;

        let mut config = Config::load_from_str(&content[..])?;

        // Record the path of the configuration for auto-reloading
        config.config_path = Some(filename.to_owned());

        Ok(config)
    }

    /// Check if there are any servers to start
    pub fn check_integrity(&self) -> Result<(), Error> {
        if self.socks5.is_none() && self.udp_tunnel.is_none() && self.rpc.is_none() {
            let err = Error::new(
                ErrorKind::MissingField,
                "missing server configuration, expecting `socks5`, `udp_tunnel` or `rpc`",
                None,
            );
            return Err(err);
        }

        if self.timeout.is_zero() || self.idle_timeout.is_zero() {
            return Err(Error::new(ErrorKind::Invalid, "timeouts must be positive", None));
        }

        Ok(())
    }
}
