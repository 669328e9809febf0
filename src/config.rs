//! Start-up configuration from `AGENDA_*` environment variables.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use chrono::NaiveTime;
use chrono_tz::Tz;
use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("both AGENDA_TLS_CERT and AGENDA_TLS_KEY must be set, or neither")]
    PartialTls,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub timezone: Tz,
    pub reminder_time: NaiveTime,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tls_cert = lookup("AGENDA_TLS_CERT").filter(|s| !s.is_empty());
        let tls_key = lookup("AGENDA_TLS_KEY").filter(|s| !s.is_empty());
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::PartialTls);
        }

        let reminder_time = match lookup("AGENDA_REMINDER_TIME") {
            Some(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|e| ConfigError::Invalid {
                var: "AGENDA_REMINDER_TIME",
                value: raw.clone(),
                reason: e.to_string(),
            })?,
            None => NaiveTime::from_hms_opt(14, 0, 0).unwrap_or_default(),
        };

        Ok(Self {
            port: parsed(&lookup, "AGENDA_PORT")?.unwrap_or(5433),
            bind: lookup("AGENDA_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("AGENDA_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: lookup("AGENDA_PASSWORD").unwrap_or_else(|| "agenda".into()),
            max_connections: parsed(&lookup, "AGENDA_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "AGENDA_COMPACT_THRESHOLD")?.unwrap_or(1000),
            timezone: parsed(&lookup, "AGENDA_TIMEZONE")?.unwrap_or(chrono_tz::Europe::Madrid),
            reminder_time,
            tls_cert,
            tls_key,
            metrics_port: parsed(&lookup, "AGENDA_METRICS_PORT")?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("agenda.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// PEM certificate chain and private key into a TLS acceptor. `None` when
/// TLS is not configured.
pub fn load_tls_acceptor(config: &Config) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (&config.tls_cert, &config.tls_key) {
        (Some(c), Some(k)) => (c, k),
        _ => return Ok(None),
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?)).collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut tls = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    tls.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(tls))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = from(&[]).unwrap();
        assert_eq!(config.port, 5433);
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.timezone, chrono_tz::Europe::Madrid);
        assert_eq!(config.reminder_time, NaiveTime::from_hms_opt(14, 0, 0).unwrap());
        assert_eq!(config.wal_path(), PathBuf::from("./data/agenda.wal"));
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn overrides() {
        let config = from(&[
            ("AGENDA_PORT", "6000"),
            ("AGENDA_TIMEZONE", "America/Mexico_City"),
            ("AGENDA_REMINDER_TIME", "09:30"),
            ("AGENDA_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.timezone, chrono_tz::America::Mexico_City);
        assert_eq!(config.reminder_time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = from(&[("AGENDA_PORT", "http")]).unwrap_err();
        assert!(err.to_string().starts_with("AGENDA_PORT"));
        assert!(from(&[("AGENDA_TIMEZONE", "Mars/Olympus")]).is_err());
        assert!(from(&[("AGENDA_REMINDER_TIME", "2pm")]).is_err());
    }

    #[test]
    fn tls_needs_both_files() {
        assert!(matches!(from(&[("AGENDA_TLS_CERT", "cert.pem")]), Err(ConfigError::PartialTls)));
        let config = from(&[]).unwrap();
        assert!(load_tls_acceptor(&config).unwrap().is_none());
    }
}
