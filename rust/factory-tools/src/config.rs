use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub influx: InfluxConfig,
    pub database_url: String,
    pub max_pool_size: u32,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub default_limit: i64,
    pub max_limit: i64,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    factory_tools_listen_addr: Option<String>,
    #[serde(default)]
    factory_tools_listen_host: Option<String>,
    #[serde(default)]
    factory_tools_listen_port: Option<u16>,
    #[serde(default)]
    influxdb_url: Option<String>,
    #[serde(default)]
    influxdb_token: Option<String>,
    #[serde(default)]
    influxdb_org: Option<String>,
    #[serde(default)]
    influxdb_bucket: Option<String>,
    #[serde(default)]
    factory_tools_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    postgres_host: Option<String>,
    #[serde(default = "default_pg_port")]
    postgres_port: u16,
    #[serde(default)]
    postgres_db: Option<String>,
    #[serde(default)]
    postgres_user: Option<String>,
    #[serde(default)]
    postgres_password: Option<String>,
    #[serde(default = "default_pool_size")]
    factory_tools_max_pool_size: u32,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default = "default_limit")]
    factory_tools_default_limit: i64,
    #[serde(default = "default_max_limit")]
    factory_tools_max_limit: i64,
    #[serde(default = "default_timeout_secs")]
    factory_tools_request_timeout_secs: u64,
}

const fn default_pg_port() -> u16 {
    5432
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_limit() -> i64 {
    100
}

const fn default_max_limit() -> i64 {
    1000
}

const fn default_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse factory-tools environment variables")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let listen_addr = resolve_addr(
            raw.factory_tools_listen_addr,
            raw.factory_tools_listen_host,
            raw.factory_tools_listen_port,
        )?;

        let influx = InfluxConfig {
            url: raw
                .influxdb_url
                .context("INFLUXDB_URL must be set")?
                .trim_end_matches('/')
                .to_string(),
            token: raw.influxdb_token.context("INFLUXDB_TOKEN must be set")?,
            org: raw.influxdb_org.context("INFLUXDB_ORG must be set")?,
            bucket: raw.influxdb_bucket.context("INFLUXDB_BUCKET must be set")?,
        };

        let database_url = match raw.factory_tools_database_url.or(raw.database_url) {
            Some(url) => url,
            None => assemble_database_url(
                raw.postgres_host,
                raw.postgres_port,
                raw.postgres_db,
                raw.postgres_user,
                raw.postgres_password,
            )?,
        };

        Ok(Self {
            listen_addr,
            influx,
            database_url,
            max_pool_size: raw.factory_tools_max_pool_size.max(1),
            pg_ssl_root_cert: raw.pgsslrootcert,
            pg_ssl_cert: raw.pgsslcert,
            pg_ssl_key: raw.pgsslkey,
            default_limit: raw.factory_tools_default_limit.max(1),
            max_limit: raw
                .factory_tools_max_limit
                .max(raw.factory_tools_default_limit.max(1)),
            request_timeout: Duration::from_secs(raw.factory_tools_request_timeout_secs.max(1)),
        })
    }

    /// Configuration for tests and embedders that bring their own backends.
    pub fn embedded(database_url: String, influx: InfluxConfig) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            influx,
            database_url,
            max_pool_size: 1,
            pg_ssl_root_cert: None,
            pg_ssl_cert: None,
            pg_ssl_key: None,
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            request_timeout: Duration::from_secs(default_timeout_secs()),
        }
    }
}

fn assemble_database_url(
    host: Option<String>,
    port: u16,
    db: Option<String>,
    user: Option<String>,
    password: Option<String>,
) -> Result<String> {
    let host = host.context(
        "FACTORY_TOOLS_DATABASE_URL, DATABASE_URL or POSTGRES_HOST must be set",
    )?;
    let db = db.context("POSTGRES_DB must be set when using POSTGRES_HOST")?;
    let user = user.context("POSTGRES_USER must be set when using POSTGRES_HOST")?;

    // Key/value form avoids percent-encoding passwords into a URL.
    let mut url = format!(
        "host={} port={port} dbname={} user={}",
        quote_conninfo(&host),
        quote_conninfo(&db),
        quote_conninfo(&user)
    );
    if let Some(password) = password {
        url.push_str(&format!(" password={}", quote_conninfo(&password)));
    }
    Ok(url)
}

fn quote_conninfo(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid FACTORY_TOOLS_LISTEN_ADDR value")?
            .next()
            .context("FACTORY_TOOLS_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8490);
    let combined = format!("{}:{}", host, port);
    combined
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}
