use std::{fmt, net::IpAddr, path::Path, str::FromStr};

use anyhow::Context;
use config::{File, FileFormat};
use serde::Deserialize;

/// The port used when the relay endpoint does not name one.
pub const DEFAULT_SMTP_PORT: u16 = 587;

pub const USERNAME_VAR: &str = "CONTACT_SMTP_USERNAME";
pub const TOKEN_VAR: &str = "CONTACT_SMTP_TOKEN";

pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    config::Config::builder()
        .add_source(File::from_str(&content, FileFormat::Toml))
        .build()?
        .try_deserialize()
        .context("Failed to load config")
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub http: HttpConfig,
    pub smtp: SmtpConfig,
    pub cors: CorsConfig,
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    pub host: IpAddr,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct SmtpConfig {
    pub endpoint: Endpoint,
    pub ehlo_domain: String,
    pub sender_name: String,
    pub recipient: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

/// The upstream SMTP server, written as `host[:port]`.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl FromStr for Endpoint {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('@') {
            return Err("credentials do not belong in the endpoint");
        }
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| "invalid port number")?),
            None => (s, DEFAULT_SMTP_PORT),
        };
        if host.is_empty() {
            return Err("missing host");
        }
        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

/// A duration written like `30s`, `5m` or `1m 30s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duration(pub std::time::Duration);

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> Self {
        value.0
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut out = std::time::Duration::default();
        for part in s.split_whitespace() {
            let factor = match part.as_bytes()[part.len() - 1] {
                b's' => 1,
                b'm' => 60,
                b'h' => 3600,
                _ => return Err(serde::de::Error::custom("Invalid duration")),
            };
            let value = part[..part.len() - 1]
                .parse::<u64>()
                .map_err(|_| serde::de::Error::custom("Invalid duration"))?;
            let secs = value
                .checked_mul(factor)
                .ok_or_else(|| serde::de::Error::custom("Invalid duration"))?;
            out = out
                .checked_add(std::time::Duration::from_secs(secs))
                .ok_or_else(|| serde::de::Error::custom("Invalid duration"))?;
        }
        Ok(Self(out))
    }
}

/// The account used to authenticate with the SMTP server.
///
/// Read from the environment only, never from the config file.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

impl Credentials {
    /// `None` unless both variables are set and non-empty.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let username = lookup(USERNAME_VAR).filter(|x| !x.is_empty())?;
        let token = lookup(TOKEN_VAR).filter(|x| !x.is_empty())?;
        Some(Self { username, token })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const DEFAULT_CONFIG_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/config.toml");

    #[test]
    fn parse_host() {
        assert_eq!(
            "smtp.example.org".parse(),
            Ok(Endpoint {
                host: "smtp.example.org".to_string(),
                port: 587,
            })
        )
    }

    #[test]
    fn parse_host_port() {
        assert_eq!(
            "127.0.0.1:2525".parse(),
            Ok(Endpoint {
                host: "127.0.0.1".to_string(),
                port: 2525,
            })
        )
    }

    #[test]
    fn reject_user_pass() {
        assert_eq!(
            "user:pwd@127.0.0.1:587".parse::<Endpoint>(),
            Err("credentials do not belong in the endpoint")
        )
    }

    #[test]
    fn reject_bad_port() {
        assert_eq!(
            "smtp.example.org:smtp".parse::<Endpoint>(),
            Err("invalid port number")
        );
        assert_eq!(":587".parse::<Endpoint>(), Err("missing host"));
    }

    #[test]
    fn parse_duration() {
        for (input, expected) in [
            ("30s", Some(30)),
            ("5m", Some(5 * 60)),
            ("1h", Some(3600)),
            ("1m 30s", Some(90)),
            ("", Some(0)),
            ("xyz", None),
            ("7ss", None),
            ("ä", None),
            ("18446744073709551615h", None),
            ("18446744073709551615s 1s", None),
        ] {
            let input = serde_json::Value::String(input.into());
            let output = serde_json::from_value::<Duration>(input.clone())
                .ok()
                .map(|x| x.0.as_secs());
            assert_eq!(output, expected, "{input}");
        }
    }

    #[test]
    fn credentials_require_both_variables() {
        let env = HashMap::from([(USERNAME_VAR, "relay@example.org"), (TOKEN_VAR, "secret")]);
        let credentials =
            Credentials::from_lookup(|name| env.get(name).map(|x| x.to_string())).unwrap();
        assert_eq!(credentials.username, "relay@example.org");
        assert_eq!(credentials.token, "secret");
        assert!(!format!("{credentials:?}").contains("secret"));

        let env = HashMap::from([(USERNAME_VAR, "relay@example.org"), (TOKEN_VAR, "")]);
        assert!(Credentials::from_lookup(|name| env.get(name).map(|x| x.to_string())).is_none());

        assert!(Credentials::from_lookup(|_| None).is_none());
    }

    #[test]
    fn load_default_config() {
        let config = load(DEFAULT_CONFIG_PATH).unwrap();
        assert_eq!(config.smtp.endpoint.port, 587);
        assert_eq!(config.smtp.timeout.0.as_secs(), 30);
        assert!(!config.cors.allowed_origins.is_empty());
    }

    #[test]
    fn missing_config_file() {
        let err = load("/nonexistent/contact-relay.toml").unwrap_err();
        assert!(err.to_string().starts_with("Failed to read config file"));
    }
}
