use crate::{
    backend::{RelationalRow, RelationalSession, RelationalSource},
    config::AppConfig,
    error::{Result, ServiceError},
};
use anyhow::Context;
use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{crypto::ring, ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use serde_json::{Map, Number, Value};
use std::error::Error as StdError;
use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_postgres::types::{FromSql, Kind, ToSql, Type};
use tokio_postgres::{Client, Config as PgConfig, NoTls, Row};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, info};

pub type PgPool = Pool<PgConnectionManager>;

type DecodeResult<T> = std::result::Result<T, Box<dyn StdError + Sync + Send>>;

pub async fn connect_pool(config: &AppConfig) -> anyhow::Result<PgPool> {
    let manager = PgConnectionManager::new(
        &config.database_url,
        config.pg_ssl_root_cert.as_deref(),
        config.pg_ssl_cert.as_deref(),
        config.pg_ssl_key.as_deref(),
    )?;
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .connection_timeout(config.request_timeout)
        .build(manager)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    // One-time connectivity check; tool calls still report their own connection errors.
    match pool.get().await {
        Ok(_) => info!("database connectivity check succeeded"),
        Err(err) => error!(error = ?err, "initial database connectivity check failed"),
    }

    Ok(pool)
}

/// Hands out one pooled connection per tool call.
#[derive(Clone)]
pub struct PostgresSource {
    pool: PgPool,
}

impl PostgresSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RelationalSource for PostgresSource {
    async fn acquire(&self) -> Result<Box<dyn RelationalSession>> {
        let conn = self.pool.get_owned().await.map_err(|err| {
            error!(error = ?err, "failed to acquire database connection");
            ServiceError::Connection(format!("{err:?}"))
        })?;
        Ok(Box::new(PgSession { conn }))
    }
}

pub struct PgSession {
    conn: PooledConnection<'static, PgConnectionManager>,
}

#[async_trait]
impl RelationalSession for PgSession {
    async fn query(&mut self, sql: &str, params: &[&str]) -> Result<Vec<RelationalRow>> {
        let binds: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let rows = self.conn.query(sql, &binds).await?;
        rows.iter().map(row_to_json).collect()
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        Ok(self.conn.execute(sql, &[]).await?)
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        debug!("database connection returned to pool");
    }
}

/// Converts a row into an ordered JSON object, one key per column.
pub fn row_to_json(row: &Row) -> Result<RelationalRow> {
    let mut out = Map::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let raw: Option<RawBytes<'_>> = row.try_get(idx)?;
        let value = match raw {
            None => Value::Null,
            Some(RawBytes(bytes)) => decode_value(column.type_(), bytes).map_err(|err| {
                ServiceError::Backend(format!(
                    "failed to decode column '{}' ({}): {err}",
                    column.name(),
                    column.type_()
                ))
            })?,
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

/// Binary column payload, accepted for every type.
struct RawBytes<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawBytes<'a> {
    fn from_sql(_: &Type, raw: &'a [u8]) -> DecodeResult<Self> {
        Ok(RawBytes(raw))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// JSON natives pass through; everything else becomes its string form.
fn decode_value(ty: &Type, raw: &[u8]) -> DecodeResult<Value> {
    let value = match *ty {
        Type::BOOL => Value::Bool(bool::from_sql(ty, raw)?),
        Type::INT2 => Value::from(i16::from_sql(ty, raw)?),
        Type::INT4 => Value::from(i32::from_sql(ty, raw)?),
        Type::INT8 => Value::from(i64::from_sql(ty, raw)?),
        Type::OID => Value::from(u32::from_sql(ty, raw)?),
        Type::FLOAT4 => float_value(f64::from(f32::from_sql(ty, raw)?)),
        Type::FLOAT8 => float_value(f64::from_sql(ty, raw)?),
        Type::CHAR => Value::String(char::from(i8::from_sql(ty, raw)? as u8).to_string()),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            Value::String(String::from_sql(ty, raw)?)
        }
        Type::JSON | Type::JSONB => Value::from_sql(ty, raw)?,
        Type::TIMESTAMP => Value::String(NaiveDateTime::from_sql(ty, raw)?.to_string()),
        Type::TIMESTAMPTZ => Value::String(DateTime::<Utc>::from_sql(ty, raw)?.to_rfc3339()),
        Type::DATE => Value::String(NaiveDate::from_sql(ty, raw)?.to_string()),
        Type::TIME => Value::String(NaiveTime::from_sql(ty, raw)?.to_string()),
        Type::UUID => Value::String(uuid::Uuid::from_sql(ty, raw)?.to_string()),
        Type::NUMERIC => Value::String(decode_numeric(raw)?),
        Type::BYTEA => Value::String(hex_bytes(raw)),
        Type::INTERVAL => Value::String(decode_interval(raw)?),
        Type::TIMETZ => Value::String(decode_timetz(raw)?),
        Type::INET | Type::CIDR => Value::String(decode_inet(ty, raw)?),
        Type::MONEY => Value::String(decode_money(i64::from_sql(ty, raw)?)),
        Type::MACADDR | Type::MACADDR8 => Value::String(decode_macaddr(raw)?),
        Type::XML => Value::String(String::from_sql(ty, raw)?),
        _ => match ty.kind() {
            Kind::Domain(inner) => decode_value(inner, raw)?,
            Kind::Array(member) => {
                let items = Vec::<Option<RawBytes<'_>>>::from_sql(ty, raw)?;
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(match item {
                        Some(RawBytes(bytes)) => decode_value(member, bytes)?,
                        None => Value::Null,
                    });
                }
                Value::Array(values)
            }
            // Enum labels and citext travel as plain text in binary format.
            Kind::Enum(_) => Value::String(String::from_sql(ty, raw)?),
            Kind::Simple if ty.name() == "citext" => Value::String(String::from_sql(ty, raw)?),
            _ => return Err(format!("unsupported column type {}", ty.name()).into()),
        },
    };
    Ok(value)
}

fn float_value(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

fn hex_bytes(raw: &[u8]) -> String {
    let mut out = String::with_capacity(2 + raw.len() * 2);
    out.push_str("\\x");
    for byte in raw {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

const USECS_PER_SEC: u64 = 1_000_000;

/// `months`, `days` and microseconds, rendered like the server's default
/// `IntervalStyle` (`1 year 2 mons 3 days 04:05:06.5`).
fn decode_interval(raw: &[u8]) -> DecodeResult<String> {
    if raw.len() != 16 {
        return Err("interval value must be 16 bytes".into());
    }
    let micros = i64::from_be_bytes(raw[0..8].try_into()?);
    let days = i32::from_be_bytes(raw[8..12].try_into()?);
    let months = i32::from_be_bytes(raw[12..16].try_into()?);

    let mut parts = Vec::new();
    let mut unit = |value: i64, singular: &str, plural: &str| {
        if value != 0 {
            let name = if value == 1 { singular } else { plural };
            parts.push(format!("{value} {name}"));
        }
    };
    unit(i64::from(months / 12), "year", "years");
    unit(i64::from(months % 12), "mon", "mons");
    unit(i64::from(days), "day", "days");

    if micros != 0 || parts.is_empty() {
        let sign = match micros {
            m if m < 0 => "-",
            m if m > 0 && (days < 0 || months < 0) => "+",
            _ => "",
        };
        parts.push(format!("{sign}{}", clock(micros.unsigned_abs())));
    }
    Ok(parts.join(" "))
}

/// `HH:MM:SS[.ffffff]`; hours are not wrapped at 24 for intervals.
fn clock(micros: u64) -> String {
    let secs = micros / USECS_PER_SEC;
    let fraction = micros % USECS_PER_SEC;
    let mut out = format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60);
    if fraction > 0 {
        out.push('.');
        out.push_str(format!("{fraction:06}").trim_end_matches('0'));
    }
    out
}

/// Time of day plus zone; the wire zone counts seconds west of UTC.
fn decode_timetz(raw: &[u8]) -> DecodeResult<String> {
    if raw.len() != 12 {
        return Err("timetz value must be 12 bytes".into());
    }
    let micros = i64::from_be_bytes(raw[0..8].try_into()?);
    let zone_west = i32::from_be_bytes(raw[8..12].try_into()?);
    if micros < 0 {
        return Err("timetz value before midnight".into());
    }

    let east = -i64::from(zone_west);
    let sign = if east < 0 { '-' } else { '+' };
    let east = east.unsigned_abs();
    let mut out = clock(micros.unsigned_abs());
    out.push(sign);
    out.push_str(&format!("{:02}", east / 3600));
    if east % 3600 != 0 {
        out.push_str(&format!(":{:02}", east / 60 % 60));
    }
    if east % 60 != 0 {
        out.push_str(&format!(":{:02}", east % 60));
    }
    Ok(out)
}

/// `inet` omits a full-length prefix; `cidr` always shows it.
fn decode_inet(ty: &Type, raw: &[u8]) -> DecodeResult<String> {
    let addr = IpAddr::from_sql(ty, raw)?;
    let bits = raw.get(1).copied().ok_or("inet value too short")?;
    let full = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if *ty == Type::INET && bits == full {
        Ok(addr.to_string())
    } else {
        Ok(format!("{addr}/{bits}"))
    }
}

/// Money is stored as an integer count of cents.
fn decode_money(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{sign}{}.{:02}", cents / 100, cents % 100)
}

fn decode_macaddr(raw: &[u8]) -> DecodeResult<String> {
    if raw.len() != 6 && raw.len() != 8 {
        return Err("macaddr value must be 6 or 8 bytes".into());
    }
    let octets: Vec<String> = raw.iter().map(|b| format!("{b:02x}")).collect();
    Ok(octets.join(":"))
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Renders the binary NUMERIC wire format (base-10000 digit groups) exactly.
fn decode_numeric(raw: &[u8]) -> DecodeResult<String> {
    if raw.len() < 8 {
        return Err("numeric value too short".into());
    }
    let read_u16 = |pos: usize| u16::from_be_bytes([raw[pos], raw[pos + 1]]);
    let ndigits = read_u16(0) as usize;
    let weight = read_u16(2) as i16 as i32;
    let sign = read_u16(4);
    let dscale = read_u16(6) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }
    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric digit groups truncated".into());
    }

    let digit = |i: i32| -> u16 {
        if i < 0 || i as usize >= ndigits {
            0
        } else {
            read_u16(8 + i as usize * 2)
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                out.push_str(&digit(i).to_string());
            } else {
                out.push_str(&format!("{:04}", digit(i)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: PgTls,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

impl PgConnectionManager {
    fn new(
        database_url: &str,
        root_cert: Option<&str>,
        client_cert: Option<&str>,
        client_key: Option<&str>,
    ) -> anyhow::Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid database connection string")?;
        let tls = if let Some(path) = root_cert {
            PgTls::Rustls(build_tls_connector(path, client_cert, client_key)?)
        } else {
            PgTls::None
        };
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = Client;
    type Error = tokio_postgres::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        match &self.tls {
            PgTls::None => {
                let (client, connection) = self.config.connect(NoTls).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        error!(error = %err, "postgres connection closed with error");
                    }
                });
                Ok(client)
            }
            PgTls::Rustls(connector) => {
                let (client, connection) = self.config.connect(connector.clone()).await?;
                tokio::spawn(async move {
                    if let Err(err) = connection.await {
                        error!(error = %err, "postgres connection closed with error");
                    }
                });
                Ok(client)
            }
        }
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.simple_query("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_closed()
    }
}

fn build_tls_connector(
    root_cert: &str,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> anyhow::Result<MakeRustlsConnect> {
    let mut reader = BufReader::new(File::open(root_cert).context("failed to open PGSSLROOTCERT")?);
    let mut root_store = RootCertStore::empty();
    for cert in certs(&mut reader) {
        let cert = cert.context("failed to parse PGSSLROOTCERT")?;
        root_store
            .add(cert)
            .map_err(|_| anyhow::anyhow!("invalid certificate in PGSSLROOTCERT"))?;
    }

    Ok(MakeRustlsConnect::new(build_client_config(
        root_store,
        root_cert,
        client_cert,
        client_key,
    )?))
}

fn build_client_config(
    root_store: RootCertStore,
    root_cert: &str,
    client_cert: Option<&str>,
    client_key: Option<&str>,
) -> anyhow::Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_root_certificates(root_store);

    match (client_cert, client_key) {
        (None, None) => Ok(builder.with_no_client_auth()),
        (Some(cert), Some(key)) => {
            let certs = load_client_certs(cert)?;
            let key = load_client_key(key)?;
            builder
                .with_client_auth_cert(certs, key)
                .with_context(|| format!("failed to build client TLS config for {root_cert}"))
        }
        _ => anyhow::bail!("PGSSLCERT and PGSSLKEY must both be set (or neither)"),
    }
}

fn load_client_certs(path: &str) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLCERT file '{path}'"))?,
    );

    let mut chain = Vec::new();
    for cert in certs(&mut reader) {
        chain.push(cert.context("failed to parse PGSSLCERT")?);
    }

    if chain.is_empty() {
        anyhow::bail!("PGSSLCERT contained no certificates");
    }

    Ok(chain)
}

fn load_client_key(path: &str) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("failed to open PGSSLKEY file '{path}'"))?,
    );

    let key = rustls_pemfile::private_key(&mut reader)
        .context("failed to parse PGSSLKEY")?
        .context("PGSSLKEY contained no private keys")?;

    Ok(key)
}
