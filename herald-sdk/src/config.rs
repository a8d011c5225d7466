//! Connection configuration and its validation.
//!
//! The configuration is read from a hierarchical key/value source using
//! dotted keys:
//!
//! ```toml
//! debug = false
//! channels = ["#general", "#ops"]
//!
//! [server]
//! address = "irc.example.org"
//! port = 6697
//! secure = true
//!
//! [user]
//! username = "bot"
//! nickname = "bot1"
//! realname = "Bot One"
//! password = "hunter2"    # optional
//! ```
//!
//! Validation is eager and all-or-nothing: [`ConnectionConfig::from_source`]
//! either returns a complete config or a [`ClientError::ConfigurationFormat`]
//! listing every problem found.

use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::flood::FloodPolicy;

/// Quit reason sent when no `quit_message` is configured.
pub const DEFAULT_QUIT_MESSAGE: &str = "Glory Be";

/// A value had the wrong type for the key it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatch {
    pub expected: &'static str,
}

/// A read-only hierarchical configuration store addressed by dotted keys.
pub trait ConfigSource {
    fn get_str(&self, key: &str) -> Result<Option<String>, TypeMismatch>;
    fn get_int(&self, key: &str) -> Result<Option<i64>, TypeMismatch>;
    fn get_bool(&self, key: &str) -> Result<Option<bool>, TypeMismatch>;
    /// An ordered list of strings.
    fn get_str_list(&self, key: &str) -> Result<Option<Vec<String>>, TypeMismatch>;
}

impl ConfigSource for toml::Value {
    fn get_str(&self, key: &str) -> Result<Option<String>, TypeMismatch> {
        match lookup(self, key) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(TypeMismatch { expected: "string" }),
        }
    }

    fn get_int(&self, key: &str) -> Result<Option<i64>, TypeMismatch> {
        match lookup(self, key) {
            None => Ok(None),
            Some(toml::Value::Integer(i)) => Ok(Some(*i)),
            Some(_) => Err(TypeMismatch { expected: "integer" }),
        }
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, TypeMismatch> {
        match lookup(self, key) {
            None => Ok(None),
            Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
            Some(_) => Err(TypeMismatch { expected: "boolean" }),
        }
    }

    fn get_str_list(&self, key: &str) -> Result<Option<Vec<String>>, TypeMismatch> {
        let mismatch = TypeMismatch { expected: "array of strings" };
        match lookup(self, key) {
            None => Ok(None),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or(mismatch.clone()))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(mismatch),
        }
    }
}

fn lookup<'a>(root: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    key.split('.').try_fold(root, |node, part| node.get(part))
}

/// The identity presented to the server during registration.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_name: String,
    pub nick_name: String,
    pub real_name: String,
    /// Server password, sent as PASS before NICK/USER.
    pub password: Option<String>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("user_name", &self.user_name)
            .field("nick_name", &self.nick_name)
            .field("real_name", &self.real_name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub address: String,
    pub port: u16,
    pub secure: bool,
    /// Skip certificate verification (self-signed test servers only).
    pub tls_insecure: bool,
}

impl ConnectTarget {
    /// `host:port`, as used for socket connects and log fields. IPv6
    /// literals are bracketed.
    pub fn host_port(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Validated, immutable connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub target: ConnectTarget,
    pub identity: Identity,
    /// Channels to join after registration, in declared order.
    pub channels: Vec<String>,
    /// Log every raw line in both directions.
    pub debug_logging: bool,
    pub quit_message: String,
    pub flood: FloodPolicy,
}

impl ConnectionConfig {
    /// Extract and validate a configuration.
    ///
    /// Nothing is connected or mutated here; callers should not attempt a
    /// connection unless this returns `Ok`.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        let mut problems = Vec::new();

        let address = required_text(source, "server.address", &mut problems);
        let port = match source.get_int("server.port") {
            Ok(Some(p)) => match u16::try_from(p) {
                Ok(p) if p != 0 => Some(p),
                _ => {
                    problems.push(format!("server.port: {p} is not a valid port"));
                    None
                }
            },
            Ok(None) => {
                problems.push("server.port: missing".to_string());
                None
            }
            Err(e) => {
                problems.push(mismatch("server.port", &e));
                None
            }
        };
        let secure = match source.get_bool("server.secure") {
            Ok(Some(b)) => Some(b),
            Ok(None) => {
                problems.push("server.secure: missing".to_string());
                None
            }
            Err(e) => {
                problems.push(mismatch("server.secure", &e));
                None
            }
        };
        let tls_insecure = optional(source.get_bool("server.tls_insecure"), "server.tls_insecure", &mut problems)
            .unwrap_or(false);

        let user_name = required_text(source, "user.username", &mut problems);
        let nick_name = required_text(source, "user.nickname", &mut problems);
        let real_name = required_text(source, "user.realname", &mut problems);
        let password = optional(source.get_str("user.password"), "user.password", &mut problems)
            .filter(|p| !p.is_empty());

        let channels = optional(source.get_str_list("channels"), "channels", &mut problems)
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let debug_logging = optional(source.get_bool("debug"), "debug", &mut problems).unwrap_or(false);
        let quit_message = optional(source.get_str("quit_message"), "quit_message", &mut problems)
            .unwrap_or_else(|| DEFAULT_QUIT_MESSAGE.to_string());

        let flood = flood_policy(source, &mut problems);

        match (address, port, secure, user_name, nick_name, real_name) {
            (Some(address), Some(port), Some(secure), Some(user_name), Some(nick_name), Some(real_name))
                if problems.is_empty() =>
            {
                Ok(Self {
                    target: ConnectTarget { address, port, secure, tls_insecure },
                    identity: Identity { user_name, nick_name, real_name, password },
                    channels,
                    debug_logging,
                    quit_message,
                    flood,
                })
            }
            _ => Err(ClientError::format(problems)),
        }
    }
}

fn required_text(source: &dyn ConfigSource, key: &str, problems: &mut Vec<String>) -> Option<String> {
    match source.get_str(key) {
        Ok(Some(s)) if !s.trim().is_empty() => Some(s),
        Ok(Some(_)) => {
            problems.push(format!("{key}: empty"));
            None
        }
        Ok(None) => {
            problems.push(format!("{key}: missing"));
            None
        }
        Err(e) => {
            problems.push(mismatch(key, &e));
            None
        }
    }
}

fn optional<T>(value: Result<Option<T>, TypeMismatch>, key: &str, problems: &mut Vec<String>) -> Option<T> {
    value.unwrap_or_else(|e| {
        problems.push(mismatch(key, &e));
        None
    })
}

fn mismatch(key: &str, e: &TypeMismatch) -> String {
    format!("{key}: expected {}", e.expected)
}

fn flood_policy(source: &dyn ConfigSource, problems: &mut Vec<String>) -> FloodPolicy {
    let defaults = FloodPolicy::default();
    let mut positive = |key: &str| -> Option<u64> {
        let v = optional(source.get_int(key), key, problems)?;
        match u64::try_from(v) {
            Ok(v) if v > 0 => Some(v),
            _ => {
                problems.push(format!("{key}: must be greater than zero"));
                None
            }
        }
    };

    let capacity = positive("flood.capacity").map_or(defaults.capacity, |v| v as usize);
    let interval = positive("flood.interval_secs").map_or(defaults.refill_interval, Duration::from_secs);
    let queue_capacity = positive("flood.queue_capacity").map_or(defaults.queue_capacity, |v| v as usize);

    FloodPolicy { capacity, refill_interval: interval, queue_capacity }
}
