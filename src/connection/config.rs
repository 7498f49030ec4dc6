//! Postgres connection configuration.
use std::{borrow::Cow, env::var, fmt, time::Duration};

use crate::{common::ByteStr, net::{SslMode, TlsSettings}};

/// Postgres connection config.
///
/// Built from a `pq://` connection string, from the environment, or field
/// by field. Plain query keys are forwarded to the server as startup
/// settings; square bracketed keys configure the driver itself:
/// `[sslmode]`, `[sslcrtfile]`, `[sslkeyfile]`, `[sslrootcrtfile]`,
/// `[connect_timeout]`, `[server_encoding]`, `[unix]`.
///
/// ```text
/// pq://user:pass@host:5432/db?application_name=app&[sslmode]=require
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) user: ByteStr,
    pub(crate) pass: ByteStr,
    pub(crate) host: ByteStr,
    pub(crate) port: u16,
    pub(crate) dbname: ByteStr,
    /// Unix domain socket path; overrides host/port transport.
    pub(crate) unix: Option<ByteStr>,
    /// Plain query keys, forwarded as startup settings.
    pub(crate) settings: Vec<(ByteStr, ByteStr)>,
    pub(crate) tls: TlsSettings,
    pub(crate) connect_timeout: Option<Duration>,
    /// Encoding hint for the password bytes; informational, the driver
    /// itself pins `client_encoding` to UTF8.
    pub(crate) server_encoding: Option<ByteStr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: "postgres".into(),
            pass: ByteStr::default(),
            host: "localhost".into(),
            port: 5432,
            dbname: ByteStr::default(),
            unix: None,
            settings: Vec::new(),
            tls: TlsSettings::default(),
            connect_timeout: None,
            server_encoding: None,
        }
    }
}

impl Config {
    /// Retrieve configuration from environment variable.
    ///
    /// It reads:
    /// - `PGUSER`
    /// - `PGPASS` / `PGPASSWORD`
    /// - `PGHOST`
    /// - `PGPORT`
    /// - `PGDATABASE`
    ///
    /// Additionally, it also read `DATABASE_URL` to provide missing value
    /// from previous variables before fallback to default value.
    pub fn from_env() -> Config {
        let url = var("DATABASE_URL").ok().and_then(|e| Config::parse(&e).ok());
        let url = url.as_ref();

        let user = var("PGUSER")
            .map(ByteStr::from)
            .unwrap_or_else(|_| url.map(|u| u.user.clone()).unwrap_or_else(|| "postgres".into()));
        let pass = var("PGPASS")
            .or_else(|_| var("PGPASSWORD"))
            .map(ByteStr::from)
            .unwrap_or_else(|_| url.map(|u| u.pass.clone()).unwrap_or_default());
        let host = var("PGHOST")
            .map(ByteStr::from)
            .unwrap_or_else(|_| url.map(|u| u.host.clone()).unwrap_or_else(|| "localhost".into()));
        let dbname = var("PGDATABASE")
            .map(ByteStr::from)
            .unwrap_or_else(|_| url.map(|u| u.dbname.clone()).unwrap_or_else(|| user.clone()));
        let port = var("PGPORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .or(url.map(|u| u.port))
            .unwrap_or(5432);

        Self {
            user,
            pass,
            host,
            port,
            dbname,
            unix: url.and_then(|u| u.unix.clone()),
            settings: url.map(|u| u.settings.clone()).unwrap_or_default(),
            tls: url.map(|u| u.tls.clone()).unwrap_or_default(),
            connect_timeout: url.and_then(|u| u.connect_timeout),
            server_encoding: url.and_then(|u| u.server_encoding.clone()),
        }
    }

    /// Parse config from a `pq://` url.
    pub fn parse(url: &str) -> Result<Config, ParseError> {
        let rest = url
            .split_once("://")
            .filter(|(scheme, _)| matches!(*scheme, "pq" | "postgres" | "postgresql"))
            .map(|(_, rest)| rest)
            .ok_or_else(|| ParseError::new("expected pq:// scheme"))?;

        let mut config = Config::default();

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let (authority, dbname) = match location.split_once('/') {
            Some((authority, dbname)) => (authority, dbname),
            None => (location, ""),
        };

        let hostport = match authority.rsplit_once('@') {
            Some((userinfo, hostport)) => {
                match userinfo.split_once(':') {
                    Some((user, pass)) => {
                        config.user = ByteStr::copy_from_str(user);
                        config.pass = ByteStr::copy_from_str(pass);
                    }
                    None => config.user = ByteStr::copy_from_str(userinfo),
                }
                hostport
            }
            None => authority,
        };

        match hostport.rsplit_once(':') {
            Some((host, port)) => {
                config.host = ByteStr::copy_from_str(host);
                config.port = port.parse().map_err(|_| ParseError::new("invalid port"))?;
            }
            None => {
                if !hostport.is_empty() {
                    config.host = ByteStr::copy_from_str(hostport);
                }
            }
        }

        config.dbname = match dbname.is_empty() {
            true => config.user.clone(),
            false => ByteStr::copy_from_str(dbname),
        };

        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ParseError::new("query item without '='"))?;

            match key.strip_prefix('[').and_then(|k| k.strip_suffix(']')) {
                Some(driver_key) => config.apply_driver_option(driver_key, value)?,
                None => config
                    .settings
                    .push((ByteStr::copy_from_str(key), ByteStr::copy_from_str(value))),
            }
        }

        Ok(config)
    }

    fn apply_driver_option(&mut self, key: &str, value: &str) -> Result<(), ParseError> {
        match key {
            "sslmode" => {
                self.tls.mode = SslMode::parse(value)
                    .ok_or_else(|| ParseError::new("invalid sslmode"))?;
            }
            "sslcrtfile" => self.tls.cert_file = Some(value.into()),
            "sslkeyfile" => self.tls.key_file = Some(value.into()),
            "sslrootcrtfile" => self.tls.root_file = Some(value.into()),
            "connect_timeout" => {
                let seconds: u64 = value
                    .parse()
                    .map_err(|_| ParseError::new("invalid connect_timeout"))?;
                self.connect_timeout = Some(Duration::from_secs(seconds));
            }
            "server_encoding" => self.server_encoding = Some(ByteStr::copy_from_str(value)),
            "unix" => self.unix = Some(ByteStr::copy_from_str(value)),
            _ => return Err(ParseError::new("unknown driver option")),
        }
        Ok(())
    }

    /// Builder style setters for field by field construction.
    pub fn user(mut self, user: &str) -> Self {
        self.user = ByteStr::copy_from_str(user);
        self
    }

    pub fn password(mut self, pass: &str) -> Self {
        self.pass = ByteStr::copy_from_str(pass);
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = ByteStr::copy_from_str(host);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn dbname(mut self, dbname: &str) -> Self {
        self.dbname = ByteStr::copy_from_str(dbname);
        self
    }

    pub fn unix(mut self, path: &str) -> Self {
        self.unix = Some(ByteStr::copy_from_str(path));
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.tls.mode = mode;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Forward a startup setting to the server.
    pub fn setting(mut self, name: &str, value: &str) -> Self {
        self.settings
            .push((ByteStr::copy_from_str(name), ByteStr::copy_from_str(value)));
        self
    }
}

impl std::str::FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Error when parsing url.
pub struct ParseError {
    reason: Cow<'static, str>,
}

impl ParseError {
    fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for ParseError { }

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            return f.write_str(&self.reason)
        }
        write!(f, "failed to parse url: {}", self.reason)
    }
}

impl fmt::Debug for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn full_url() {
        let config =
            Config::parse("pq://alice:s3cret@db.example.com:5433/orders?application_name=app")
                .unwrap();
        assert_eq!(config.user, "alice");
        assert_eq!(config.pass, "s3cret");
        assert_eq!(config.host, "db.example.com");
        assert_eq!(config.port, 5433);
        assert_eq!(config.dbname, "orders");
        assert_eq!(config.settings.len(), 1);
        assert_eq!(config.settings[0].0, "application_name");
    }

    #[test]
    fn defaults_fill_in() {
        let config = Config::parse("pq://bob@localhost/").unwrap();
        assert_eq!(config.user, "bob");
        assert_eq!(config.port, 5432);
        // database defaults to the user name
        assert_eq!(config.dbname, "bob");
    }

    #[test]
    fn driver_options_are_bracketed() {
        let config = Config::parse(
            "pq://u@h/db?[sslmode]=require&[connect_timeout]=7&[unix]=/run/pg.s&search_path=public",
        )
        .unwrap();
        assert_eq!(config.tls.mode, SslMode::Require);
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(7)));
        assert_eq!(config.unix.as_deref(), Some("/run/pg.s"));
        // plain keys stay startup settings
        assert_eq!(config.settings.len(), 1);
        assert_eq!(config.settings[0].0, "search_path");
    }

    #[test]
    fn rejects_wrong_scheme_and_bad_values() {
        assert!(Config::parse("mysql://u@h/db").is_err());
        assert!(Config::parse("pq://u@h:not-a-port/db").is_err());
        assert!(Config::parse("pq://u@h/db?[sslmode]=sideways").is_err());
        assert!(Config::parse("pq://u@h/db?[made_up]=1").is_err());
    }
}
