//! Secret sources for the CLI: environment variables, an interactive
//! password prompt, and a reachability check for connection endpoints.

use assetkit::{ConnectionVerifier, CredentialSource, Entity, Secret, SecretPrompt};
use regex::Regex;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::LazyLock;
use std::time::Duration;

/// Prefix of environment variables holding secrets
pub const ENV_SECRET_PREFIX: &str = "FERRY_SECRET_";

/// Environment variable for a logical key.
///
/// `connection/6f1c…/password` becomes `FERRY_SECRET_CONNECTION_6F1C…_PASSWORD`.
pub fn env_var_name(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{ENV_SECRET_PREFIX}{normalized}")
}

/// Looks secrets up in `FERRY_SECRET_*` environment variables.
pub struct EnvSource;

impl CredentialSource for EnvSource {
    fn lookup(&self, key: &str) -> Option<Secret> {
        let var = env_var_name(key);
        match std::env::var(&var) {
            Ok(value) if !value.is_empty() => {
                log::debug!("secret for {key} found in {var}");
                Some(Secret::new(value))
            }
            _ => None,
        }
    }
}

/// Asks the operator on the terminal.
pub struct TerminalPrompt;

impl SecretPrompt for TerminalPrompt {
    fn prompt(&self, entity: &Entity, field: &str, attempt: u32) -> Option<Secret> {
        let prompt = if attempt == 1 {
            format!("{} for {} '{}'", field, entity.kind, entity.name)
        } else {
            format!("{} for {} '{}' (attempt {})", field, entity.kind, entity.name, attempt)
        };
        match dialoguer::Password::new()
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
        {
            Ok(value) if !value.is_empty() => Some(Secret::new(value)),
            Ok(_) => None,
            Err(e) => {
                log::warn!("could not read secret from terminal: {e}");
                None
            }
        }
    }
}

static URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*)://(?:[^@/]*@)?(?P<host>\[[^\]]+\]|[^:/?#]+)(?::(?P<port>\d+))?")
        .expect("uri pattern is valid")
});

/// `(host, port)` of a connection URI, with the scheme's default port
pub fn endpoint(uri: &str) -> Option<(String, u16)> {
    let caps = URI.captures(uri)?;
    let scheme = caps.name("scheme")?.as_str().to_lowercase();
    let host = caps
        .name("host")?
        .as_str()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = match caps.name("port") {
        Some(p) => p.as_str().parse().ok()?,
        None => default_port(scheme.split('+').next().unwrap_or(&scheme))?,
    };
    Some((host, port))
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "postgres" | "postgresql" => Some(5432),
        "mysql" | "mariadb" => Some(3306),
        "mssql" => Some(1433),
        "redshift" => Some(5439),
        "clickhouse" => Some(8123),
        "trino" | "presto" => Some(8080),
        "https" => Some(443),
        "http" => Some(80),
        _ => None,
    }
}

/// Accepts a secret only when the connection's endpoint accepts a TCP
/// connection. File-based URIs (no host) are always accepted.
pub struct ReachabilityVerifier {
    pub timeout: Duration,
}

impl Default for ReachabilityVerifier {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionVerifier for ReachabilityVerifier {
    fn verify(&self, entity: &Entity, _field: &str, _secret: &Secret) -> Result<(), String> {
        let Some(uri) = entity.payload.get("uri").and_then(|v| v.as_str()) else {
            return Err("connection has no uri".to_string());
        };
        let Some((host, port)) = endpoint(uri) else {
            log::debug!("{}: no network endpoint to check", entity.name);
            return Ok(());
        };

        let addrs = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| format!("cannot resolve {host}: {e}"))?;
        let mut last_error = format!("{host}:{port} did not resolve");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return Ok(()),
                Err(e) => last_error = format!("{addr}: {e}"),
            }
        }
        Err(last_error)
    }
}
