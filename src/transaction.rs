//! Transaction scopes and savepoints.
use std::fmt::Write;

use crate::{
    Result,
    connection::Connection,
    error::StateError,
    postgres::{TransactionStatus, frontend},
    transport::PgTransport,
};

/// Transaction characteristics for [`Connection::begin_with`].
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub isolation: Option<Isolation>,
    pub read_only: Option<bool>,
    pub deferrable: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    fn keyword(self) -> &'static str {
        match self {
            Isolation::ReadUncommitted => "READ UNCOMMITTED",
            Isolation::ReadCommitted => "READ COMMITTED",
            Isolation::RepeatableRead => "REPEATABLE READ",
            Isolation::Serializable => "SERIALIZABLE",
        }
    }
}

fn start_string(options: &TransactionOptions) -> String {
    let mut sql = String::from("START TRANSACTION");
    if let Some(isolation) = options.isolation {
        write!(sql, " ISOLATION LEVEL {}", isolation.keyword()).expect("write to string");
    }
    if let Some(read_only) = options.read_only {
        sql.push_str(if read_only { " READ ONLY" } else { " READ WRITE" });
    }
    if let Some(deferrable) = options.deferrable {
        sql.push_str(if deferrable { " DEFERRABLE" } else { " NOT DEFERRABLE" });
    }
    sql
}

fn savepoint_name(depth: u32) -> String {
    format!("__pg_savepoint_{depth}__")
}

impl Connection {
    /// Begin a transaction block, or a savepoint when already inside one.
    pub async fn begin(&mut self) -> Result<Transaction<'_>> {
        self.begin_with(TransactionOptions::default()).await
    }

    /// Begin a transaction block with explicit characteristics.
    pub async fn begin_with(&mut self, options: TransactionOptions) -> Result<Transaction<'_>> {
        let depth = self.tx_depth;

        let sql = match depth {
            0 => start_string(&options),
            _ => {
                let default = options.isolation.is_none()
                    && options.read_only.is_none()
                    && options.deferrable.is_none();
                if !default {
                    return Err(StateError::WrongState {
                        expected: "top level transaction for characteristics",
                        actual: "savepoint",
                    }
                    .into());
                }
                format!("SAVEPOINT {}", savepoint_name(depth))
            }
        };

        self.execute(&sql).await?;
        self.tx_depth += 1;

        Ok(Transaction { conn: self, depth, done: false })
    }
}

/// An RAII implementation of transaction scope.
///
/// To commit, use [`Transaction::commit`]. If not commited, when this
/// structure is dropped, the transaction (or its savepoint) is rolled
/// back.
///
/// Nested [`begin`][Connection::begin] calls generate savepoints; commit
/// releases, rollback rolls back to and releases.
///
/// # Example
///
/// ```no_run
/// # async fn test(mut conn: postq::Connection) -> postq::Result<()> {
/// let mut tx = conn.begin().await?;
///
/// tx.execute("INSERT INTO post(name) VALUES ('foo')").await?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction<'c> {
    conn: &'c mut Connection,
    depth: u32,
    done: bool,
}

impl Transaction<'_> {
    /// Begin a nested scope backed by a savepoint.
    pub async fn begin(&mut self) -> Result<Transaction<'_>> {
        self.conn.begin().await
    }

    /// Commit the block, or release the savepoint of a nested scope.
    ///
    /// Committing a failed block is refused: the block is rolled back and
    /// a failed-block error is raised, never a silent rollback by the
    /// server's implicit rule.
    pub async fn commit(mut self) -> Result<()> {
        self.check_depth()?;

        if self.conn.transaction_status() == TransactionStatus::FailedBlock {
            self.rollback_inner().await?;
            return Err(StateError::FailedBlockOnExit.into());
        }

        let sql = match self.depth {
            0 => "COMMIT".to_owned(),
            depth => format!("RELEASE SAVEPOINT {}", savepoint_name(depth)),
        };
        self.conn.execute(&sql).await?;
        self.conn.tx_depth = self.depth;
        self.done = true;
        Ok(())
    }

    /// Roll the block back, or roll back to and release the savepoint.
    pub async fn rollback(mut self) -> Result<()> {
        self.rollback_inner().await
    }

    async fn rollback_inner(&mut self) -> Result<()> {
        self.check_depth()?;

        let sql = match self.depth {
            0 => "ROLLBACK".to_owned(),
            depth => {
                let name = savepoint_name(depth);
                format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}")
            }
        };
        self.conn.query_simple(&sql).await?;
        self.conn.tx_depth = self.depth;
        self.done = true;
        Ok(())
    }

    /// A savepoint that was already released or rolled back cannot be
    /// finished again.
    fn check_depth(&self) -> Result<()> {
        if self.conn.tx_depth != self.depth + 1 {
            return Err(StateError::SavepointGone.into());
        }
        Ok(())
    }
}

impl std::ops::Deref for Transaction<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl std::ops::DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.done || self.conn.is_closed() {
            return;
        }
        if self.conn.tx_depth != self.depth + 1 {
            // an inner scope leaked past this one; nothing sane to send
            return;
        }

        // roll back without awaiting: buffer the statement and skip its
        // reply on the next operation
        let sql = match self.depth {
            0 => "ROLLBACK".to_owned(),
            depth => {
                let name = savepoint_name(depth);
                format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}")
            }
        };
        self.conn.stream.send(frontend::Query { sql: &sql });
        self.conn.stream.ready_request();
        self.conn.tx_depth = self.depth;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn start_transaction_characteristics() {
        assert_eq!(start_string(&TransactionOptions::default()), "START TRANSACTION");
        assert_eq!(
            start_string(&TransactionOptions {
                isolation: Some(Isolation::Serializable),
                read_only: Some(true),
                deferrable: Some(true),
            }),
            "START TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY DEFERRABLE",
        );
        assert_eq!(
            start_string(&TransactionOptions {
                isolation: None,
                read_only: Some(false),
                deferrable: Some(false),
            }),
            "START TRANSACTION READ WRITE NOT DEFERRABLE",
        );
    }

    #[test]
    fn savepoint_names_follow_depth() {
        assert_eq!(savepoint_name(1), "__pg_savepoint_1__");
        assert_eq!(savepoint_name(3), "__pg_savepoint_3__");
    }
}
