//! Postgres v3.0 frontend protocol client runtime.
//!
//! # Examples
//!
//! Single connection:
//!
//! ```no_run
//! use postq::{Connection, First, Value};
//!
//! # async fn app() -> postq::Result<()> {
//! let mut conn = Connection::connect("pq://postgres@localhost/postgres").await?;
//!
//! let stmt = conn.prepare("SELECT $1::int4").await?;
//! let First::Value(Value::Int4(echoed)) = stmt.first(&mut conn, &[(-12345i32).into()]).await?
//! else { unreachable!() };
//!
//! assert_eq!(echoed, -12345);
//! # Ok(())
//! # }
//! ```
//!
//! Begin a transaction:
//!
//! ```no_run
//! use postq::Connection;
//!
//! # async fn app() -> postq::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//!
//! let mut tx = conn.begin().await?;
//!
//! tx.execute("INSERT INTO foo(id) VALUES (14)").await?;
//!
//! // if this failed, `tx` would be dropped and the block rolled back
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Listen for notifications:
//!
//! ```no_run
//! use postq::{Connection, NotifyEvent};
//! use std::time::Duration;
//!
//! # async fn app() -> postq::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//! conn.listen("events").await?;
//!
//! let mut manager = conn.iter_notifications(Some(Duration::from_secs(10)));
//! while let Some(event) = manager.next().await {
//!     match event {
//!         NotifyEvent::Notified { notifications, .. } => {
//!             for n in notifications {
//!                 println!("{}: {} (from {})", n.channel, n.payload, n.pid);
//!             }
//!         }
//!         // idle tick, the safe point to break the loop
//!         NotifyEvent::Idle => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;
mod io;

pub mod net;

// Protocol
pub mod postgres;

mod stream;
mod transport;

// Encoding
pub mod types;
mod value;

// Component
mod catalog;
mod connection;
mod copy;
mod cursor;
mod error;
mod notify;
mod query;
mod registry;
mod row;
mod statement;
mod transaction;

pub use catalog::{AdvisoryKey, PreparedXact, StartupData};
pub use connection::{Config, Connection, ParseError, QueryResult};
pub use copy::{
    CopyError, CopyIn, CopyManager, CopyOut, CopyProducer, CopyReceiver, CopyStats, FnReceiver,
    IterProducer, transfer,
};
pub use cursor::{Cursor, Direction, Whence};
pub use error::{AuthError, Error, ErrorKind, Result, StateError};
pub use notify::{Notification, NotificationManager, NotifyEvent};
pub use postgres::{DatabaseError, Notice, TransactionStatus};
pub use query::{ChunkStream, ColumnStream, RowStream};
pub use registry::{TypeEntry, TypeKind, TypeRegistry};
pub use row::{ColumnInfo, FromRow, Row, RowIndex, RowSchema};
pub use statement::{First, Statement};
pub use stream::NoticeHook;
pub use transaction::{Isolation, Transaction, TransactionOptions};
pub use transport::{PgTransport, PgTransportExt};
pub use value::{Array, ArrayDim, Inet, Interval, Numeric, NumericSign, Record, RecordField, Value};
