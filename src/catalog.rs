//! Catalog queries the driver issues.
//!
//! The SQL texts here are part of the external contract: type resolution,
//! session metadata, settings access, LISTEN/NOTIFY helpers, advisory
//! locks, and the read-only two phase commit probes.
use time::OffsetDateTime;

use crate::{
    Result,
    common::ByteStr,
    connection::Connection,
    postgres::Oid,
    value::{Array, Value},
};

const LOOKUP_TYPE: &str = "\
SELECT ns.nspname, t.typname, t.typtype, t.typlen, t.typelem, t.typrelid, \
COALESCE(ae.typreceive::oid, 0) != 0, COALESCE(ae.typsend::oid, 0) != 0 \
FROM pg_catalog.pg_type t \
JOIN pg_catalog.pg_namespace ns ON t.typnamespace = ns.oid \
LEFT JOIN pg_catalog.pg_type ae ON t.typelem = ae.oid \
WHERE t.oid = $1";

const LOOKUP_COMPOSITE: &str = "\
SELECT a.atttypid, a.attname, t.typtype = 'd' \
FROM pg_catalog.pg_attribute a \
JOIN pg_catalog.pg_type t ON a.atttypid = t.oid \
WHERE a.attrelid = $1 AND a.attnum > 0 AND NOT a.attisdropped \
ORDER BY a.attnum";

const LOOKUP_BASETYPE_RECURSIVE: &str = "\
WITH RECURSIVE walk(oid, base) AS (\
SELECT t.oid, t.typbasetype FROM pg_catalog.pg_type t WHERE t.oid = $1 \
UNION ALL \
SELECT t.oid, t.typbasetype FROM pg_catalog.pg_type t \
JOIN walk w ON t.oid = w.base\
) SELECT oid FROM walk WHERE base = 0";

/// Server version 9.2 is the baseline; earlier variants are not issued.
const STARTUP_DATA: &str = "\
SELECT pg_catalog.version()::text, \
pg_catalog.pg_postmaster_start_time()::text, \
pg_catalog.inet_client_addr()::text, \
pg_catalog.inet_client_port()";

const SETTING_GET: &str = "SELECT setting FROM pg_catalog.pg_settings WHERE name = $1";
const SETTING_SET: &str = "SELECT pg_catalog.set_config($1, $2, false)";
const SETTING_MGET: &str =
    "SELECT name, setting FROM pg_catalog.pg_settings WHERE name = ANY($1)";
const SETTING_ITEMS: &str = "SELECT name, setting FROM pg_catalog.pg_settings";

const LISTENING_CHANNELS: &str = "SELECT pg_catalog.pg_listening_channels()::text";
const NOTIFY: &str = "SELECT pg_catalog.pg_notify($1, $2)";

const LOOKUP_PREPARED_XACTS: &str = "\
SELECT gid, prepared, owner::text, database::text FROM pg_catalog.pg_prepared_xacts";
const XACT_IS_PREPARED: &str = "SELECT TRUE FROM pg_catalog.pg_prepared_xacts WHERE gid = $1";

/// One `pg_type` row, as needed for codec resolution.
#[derive(Debug)]
pub(crate) struct PgTypeInfo {
    pub namespace: ByteStr,
    pub name: ByteStr,
    pub typtype: u8,
    pub typlen: i16,
    pub typelem: Oid,
    pub typrelid: Oid,
    pub elem_has_bin_recv: bool,
    pub elem_has_bin_send: bool,
}

/// One attribute of a composite type, in `attnum` order.
#[derive(Debug)]
pub(crate) struct PgAttributeInfo {
    pub oid: Oid,
    pub name: ByteStr,
    #[allow(dead_code, reason = "part of the lookup contract")]
    pub is_domain: bool,
}

/// Session metadata reported by [`Connection::startup_data`].
#[derive(Debug, Clone)]
pub struct StartupData {
    pub version: ByteStr,
    pub backend_start: ByteStr,
    /// NULL over unix domain sockets.
    pub client_addr: Option<ByteStr>,
    pub client_port: Option<i32>,
}

/// Key of an advisory lock: a single 64 bit key or a pair of 32 bit keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisoryKey {
    Single(i64),
    Pair(i32, i32),
}

/// One row of `pg_prepared_xacts`.
///
/// Two phase commit itself is out of scope; these read-only probes remain
/// for external tooling.
#[derive(Debug, Clone)]
pub struct PreparedXact {
    pub gid: ByteStr,
    pub prepared: OffsetDateTime,
    pub owner: ByteStr,
    pub database: ByteStr,
}

impl Connection {
    pub(crate) async fn lookup_type(&mut self, oid: Oid) -> Result<Option<PgTypeInfo>> {
        let stmt = self.prepare(LOOKUP_TYPE).await?;
        let rows = stmt.fetch_all(self, &[Value::Oid(oid)]).await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        let typtype: ByteStr = row.try_get(2)?;
        Ok(Some(PgTypeInfo {
            namespace: row.try_get(0)?,
            name: row.try_get(1)?,
            typtype: typtype.as_bytes().first().copied().unwrap_or(b'b'),
            typlen: row.try_get(3)?,
            typelem: row.try_get(4)?,
            typrelid: row.try_get(5)?,
            elem_has_bin_recv: row.try_get::<_, Option<bool>>(6)?.unwrap_or(false),
            elem_has_bin_send: row.try_get::<_, Option<bool>>(7)?.unwrap_or(false),
        }))
    }

    pub(crate) async fn lookup_composite(&mut self, relid: Oid) -> Result<Vec<PgAttributeInfo>> {
        let stmt = self.prepare(LOOKUP_COMPOSITE).await?;
        let rows = stmt.fetch_all(self, &[Value::Oid(relid)]).await?;
        rows.into_iter()
            .map(|row| {
                Ok(PgAttributeInfo {
                    oid: row.try_get(0)?,
                    name: row.try_get(1)?,
                    is_domain: row.try_get(2)?,
                })
            })
            .collect()
    }

    /// Leaf base type of a domain, following the basetype chain.
    pub(crate) async fn lookup_basetype_recursive(&mut self, oid: Oid) -> Result<Oid> {
        let stmt = self.prepare(LOOKUP_BASETYPE_RECURSIVE).await?;
        let rows = stmt.fetch_all(self, &[Value::Oid(oid)]).await?;
        match rows.first() {
            Some(row) => Ok(row.try_get(0)?),
            None => Ok(oid),
        }
    }

    /// Server version, postmaster start time and the client address as the
    /// server sees it.
    pub async fn startup_data(&mut self) -> Result<StartupData> {
        let stmt = self.prepare(STARTUP_DATA).await?;
        let rows = stmt.fetch_all(self, &[]).await?;
        let Some(row) = rows.into_iter().next() else {
            return Err(crate::error::StateError::EmptyQuery.into());
        };
        Ok(StartupData {
            version: row.try_get(0)?,
            backend_start: row.try_get(1)?,
            client_addr: row.try_get(2)?,
            client_port: row.try_get(3)?,
        })
    }

    // ===== settings =====

    /// Current value of one server setting.
    pub async fn setting_get(&mut self, name: &str) -> Result<Option<ByteStr>> {
        let stmt = self.prepare(SETTING_GET).await?;
        let rows = stmt.fetch_all(self, &[name.into()]).await?;
        match rows.first() {
            Some(row) => Ok(Some(row.try_get(0)?)),
            None => Ok(None),
        }
    }

    /// Set a setting for the session; the previous value comes back.
    pub async fn setting_set(&mut self, name: &str, value: &str) -> Result<ByteStr> {
        let stmt = self.prepare(SETTING_SET).await?;
        let rows = stmt.fetch_all(self, &[name.into(), value.into()]).await?;
        match rows.first() {
            Some(row) => Ok(row.try_get(0)?),
            None => Ok(ByteStr::default()),
        }
    }

    /// Fetch several settings in one round trip.
    pub async fn setting_mget(&mut self, names: &[&str]) -> Result<Vec<(ByteStr, ByteStr)>> {
        let stmt = self.prepare(SETTING_MGET).await?;
        let keys = Array::from_vec(
            crate::postgres::oid::TEXT,
            names.iter().map(|n| Value::from(*n)).collect(),
        );
        let rows = stmt.fetch_all(self, &[Value::Array(keys)]).await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
            .collect()
    }

    /// Apply several settings, pipelined in one round trip.
    pub async fn setting_update<'a>(
        &mut self,
        settings: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        let stmt = self.prepare(SETTING_SET).await?;
        let rows: Vec<Vec<Value>> = settings
            .into_iter()
            .map(|(name, value)| vec![name.into(), value.into()])
            .collect();
        stmt.load_rows(self, rows).await?;
        Ok(())
    }

    /// Every `pg_settings` item.
    pub async fn settings_items(&mut self) -> Result<Vec<(ByteStr, ByteStr)>> {
        let stmt = self.prepare(SETTING_ITEMS).await?;
        let rows = stmt.fetch_all(self, &[]).await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
            .collect()
    }

    // ===== LISTEN / NOTIFY =====

    /// Start listening on a channel.
    pub async fn listen(&mut self, channel: &str) -> Result<()> {
        self.execute(&format!("LISTEN {}", quote_ident(channel))).await?;
        Ok(())
    }

    /// Stop listening on a channel.
    pub async fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.execute(&format!("UNLISTEN {}", quote_ident(channel))).await?;
        Ok(())
    }

    /// Raise a notification with a payload.
    pub async fn notify(&mut self, channel: &str, payload: &str) -> Result<()> {
        let stmt = self.prepare(NOTIFY).await?;
        stmt.fetch_all(self, &[channel.into(), payload.into()]).await?;
        Ok(())
    }

    /// Channels this session is listening on.
    pub async fn listening_channels(&mut self) -> Result<Vec<ByteStr>> {
        let stmt = self.prepare(LISTENING_CHANNELS).await?;
        let rows = stmt.fetch_all(self, &[]).await?;
        rows.into_iter().map(|row| Ok(row.try_get(0)?)).collect()
    }

    // ===== advisory locks =====

    /// Acquire an advisory lock, waiting until it is granted.
    pub async fn advisory_lock(&mut self, key: AdvisoryKey, shared: bool) -> Result<()> {
        let sql = advisory_sql(AdvisoryOp::Lock, key, shared);
        let stmt = self.prepare(sql).await?;
        stmt.fetch_all(self, &advisory_params(key)).await?;
        Ok(())
    }

    /// Try to acquire an advisory lock without waiting.
    pub async fn advisory_try_lock(&mut self, key: AdvisoryKey, shared: bool) -> Result<bool> {
        let sql = advisory_sql(AdvisoryOp::TryLock, key, shared);
        let stmt = self.prepare(sql).await?;
        let rows = stmt.fetch_all(self, &advisory_params(key)).await?;
        match rows.first() {
            Some(row) => Ok(row.try_get(0)?),
            None => Ok(false),
        }
    }

    /// Release an advisory lock; `false` when it was not held.
    pub async fn advisory_unlock(&mut self, key: AdvisoryKey, shared: bool) -> Result<bool> {
        let sql = advisory_sql(AdvisoryOp::Unlock, key, shared);
        let stmt = self.prepare(sql).await?;
        let rows = stmt.fetch_all(self, &advisory_params(key)).await?;
        match rows.first() {
            Some(row) => Ok(row.try_get(0)?),
            None => Ok(false),
        }
    }

    // ===== two phase commit probes =====

    /// Prepared transactions visible to this session.
    pub async fn lookup_prepared_xacts(&mut self) -> Result<Vec<PreparedXact>> {
        let stmt = self.prepare(LOOKUP_PREPARED_XACTS).await?;
        let rows = stmt.fetch_all(self, &[]).await?;
        rows.into_iter()
            .map(|row| {
                Ok(PreparedXact {
                    gid: row.try_get(0)?,
                    prepared: row.try_get(1)?,
                    owner: row.try_get(2)?,
                    database: row.try_get(3)?,
                })
            })
            .collect()
    }

    /// Whether a global transaction id is currently prepared.
    pub async fn xact_is_prepared(&mut self, gid: &str) -> Result<bool> {
        let stmt = self.prepare(XACT_IS_PREPARED).await?;
        let rows = stmt.fetch_all(self, &[gid.into()]).await?;
        Ok(!rows.is_empty())
    }
}

/// SQL identifier quoting.
pub(crate) fn quote_ident(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for c in ident.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

#[derive(Clone, Copy)]
enum AdvisoryOp {
    Lock,
    TryLock,
    Unlock,
}

fn advisory_sql(op: AdvisoryOp, key: AdvisoryKey, shared: bool) -> &'static str {
    use {AdvisoryKey::*, AdvisoryOp::*};
    // the twelve statement shapes are fixed; text is selected, not built
    match (op, key, shared) {
        (Lock, Single(_), false) => "SELECT pg_catalog.pg_advisory_lock($1)",
        (Lock, Single(_), true) => "SELECT pg_catalog.pg_advisory_lock_shared($1)",
        (Lock, Pair(..), false) => "SELECT pg_catalog.pg_advisory_lock($1, $2)",
        (Lock, Pair(..), true) => "SELECT pg_catalog.pg_advisory_lock_shared($1, $2)",
        (TryLock, Single(_), false) => "SELECT pg_catalog.pg_try_advisory_lock($1)",
        (TryLock, Single(_), true) => "SELECT pg_catalog.pg_try_advisory_lock_shared($1)",
        (TryLock, Pair(..), false) => "SELECT pg_catalog.pg_try_advisory_lock($1, $2)",
        (TryLock, Pair(..), true) => "SELECT pg_catalog.pg_try_advisory_lock_shared($1, $2)",
        (Unlock, Single(_), false) => "SELECT pg_catalog.pg_advisory_unlock($1)",
        (Unlock, Single(_), true) => "SELECT pg_catalog.pg_advisory_unlock_shared($1)",
        (Unlock, Pair(..), false) => "SELECT pg_catalog.pg_advisory_unlock($1, $2)",
        (Unlock, Pair(..), true) => "SELECT pg_catalog.pg_advisory_unlock_shared($1, $2)",
    }
}

fn advisory_params(key: AdvisoryKey) -> Vec<Value> {
    match key {
        AdvisoryKey::Single(key) => vec![Value::Int8(key)],
        AdvisoryKey::Pair(a, b) => vec![Value::Int4(a), Value::Int4(b)],
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ident_quoting() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn advisory_sql_selection() {
        assert_eq!(
            advisory_sql(AdvisoryOp::Lock, AdvisoryKey::Single(1), false),
            "SELECT pg_catalog.pg_advisory_lock($1)",
        );
        assert_eq!(
            advisory_sql(AdvisoryOp::TryLock, AdvisoryKey::Pair(1, 2), true),
            "SELECT pg_catalog.pg_try_advisory_lock_shared($1, $2)",
        );
        assert_eq!(
            advisory_sql(AdvisoryOp::Unlock, AdvisoryKey::Single(1), true),
            "SELECT pg_catalog.pg_advisory_unlock_shared($1)",
        );
    }
}
