//! Scrollable server side cursors.
//!
//! Declared `INSENSITIVE SCROLL ... WITH HOLD`, so a cursor outlives the
//! transaction that created it. Reads and seeks translate to `FETCH` and
//! `MOVE` statements over the extended protocol, decoding rows against the
//! declaring statement's schema.
use crate::{
    Result,
    catalog::quote_ident,
    connection::Connection,
    error::StateError,
    row::Row,
    row::RowSchema,
    statement::{CursorName, StatementInner},
    value::Value,
};

/// Cursor travel direction.
///
/// A cursor whose direction is [`Backward`][Direction::Backward] inverts
/// the sense of every read and seek: a reversed-order query walked
/// backward yields the same slices as the forward-ordered query walked
/// forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

impl Direction {
    fn invert(self) -> Direction {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            Direction::Forward => "FORWARD",
            Direction::Backward => "BACKWARD",
        }
    }
}

/// Origin of a [`Cursor::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the result set.
    Absolute,
    /// From the current position.
    Relative,
    /// From past the last row.
    FromEnd,
}

/// A named scrollable cursor, WITH HOLD.
#[derive(Debug)]
pub struct Cursor {
    name: CursorName,
    schema: RowSchema,
    direction: Direction,
    closed: bool,
}

fn declare_statement_string(cursor: &str, statement: &str) -> String {
    format!("DECLARE {cursor} INSENSITIVE SCROLL CURSOR WITH HOLD FOR {statement}")
}

/// MOVE statements for one seek, after applying the direction flag.
fn seek_moves(direction: Direction, offset: i64, whence: Whence, ident: &str) -> Vec<String> {
    let (mut offset, mut whence) = (offset, whence);

    if direction == Direction::Backward {
        match whence {
            Whence::Relative => offset = -offset,
            Whence::Absolute => whence = Whence::FromEnd,
            Whence::FromEnd => whence = Whence::Absolute,
        }
    }

    match whence {
        Whence::Absolute => vec![format!("MOVE ABSOLUTE {offset} IN {ident}")],
        Whence::Relative => match offset < 0 {
            true => vec![format!("MOVE BACKWARD {} IN {ident}", -offset)],
            false => vec![format!("MOVE RELATIVE {offset} IN {ident}")],
        },
        Whence::FromEnd => vec![
            // position past the last record, then step back
            format!("MOVE LAST IN {ident}"),
            format!("MOVE NEXT IN {ident}"),
            format!("MOVE BACKWARD {offset} IN {ident}"),
        ],
    }
}

impl Cursor {
    pub(crate) async fn declare(
        conn: &mut Connection,
        inner: &StatementInner,
        params: &[Value],
    ) -> Result<Cursor> {
        conn.ensure_ready(Some(&inner.sql))?;

        let name = CursorName::next();
        let sql = declare_statement_string(&quote_ident(name.as_str()), &inner.sql);

        use crate::postgres::{backend, frontend};
        use crate::transport::{PgTransport, PgTransportExt};

        let encoded = inner.encode_params(params)?;
        conn.stream.send(frontend::Parse {
            prepare_name: "",
            sql: &sql,
            oids_len: 0,
            oids: std::iter::empty(),
        });
        conn.stream.send(frontend::Bind {
            portal_name: "",
            stmt_name: "",
            param_formats: &inner.param_formats(),
            params: &encoded,
            result_formats: &[],
        });
        conn.stream.send(frontend::Execute { portal_name: "", max_row: 1 });
        conn.stream.send(frontend::Sync);
        conn.stream.flush().await?;

        conn.recv_expect::<backend::ParseComplete>().await?;
        conn.recv_expect::<backend::BindComplete>().await?;
        loop {
            use crate::postgres::BackendMessage::*;
            match conn.recv_expect().await? {
                CommandComplete(_) => {}
                ReadyForQuery(_) => break,
                f => return conn.fail_resync(f.unexpected("declare cursor").into()).await,
            }
        }

        Ok(Cursor {
            name,
            schema: inner.schema.clone(),
            direction: Direction::Forward,
            closed: false,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Invert the sense of subsequent reads and seeks.
    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    /// Requested direction combined with the cursor direction flag.
    fn which_way(&self, direction: Option<Direction>) -> Direction {
        match (self.direction, direction) {
            (flag, None) => flag,
            (Direction::Forward, Some(requested)) => requested,
            (Direction::Backward, Some(requested)) => requested.invert(),
        }
    }

    /// Fetch up to `quantity` rows; `None` reads the rest of the cursor.
    ///
    /// Rows come back in fetch order: a backward fetch yields them
    /// starting with the row nearest the current position.
    pub async fn read(
        &mut self,
        conn: &mut Connection,
        quantity: Option<u32>,
        direction: Option<Direction>,
    ) -> Result<Vec<Row>> {
        self.guard()?;
        if quantity == Some(0) {
            return Ok(Vec::new());
        }

        let way = self.which_way(direction);
        let sql = match quantity {
            Some(n) => format!(
                "FETCH {} {} IN {}",
                way.keyword(),
                n,
                quote_ident(self.name.as_str()),
            ),
            None => format!(
                "FETCH {} ALL IN {}",
                way.keyword(),
                quote_ident(self.name.as_str()),
            ),
        };

        let (rows, _) = conn.extended_text_command(&sql, &self.schema).await?;
        Ok(rows)
    }

    /// Fetch the next row in the cursor direction.
    pub async fn next(&mut self, conn: &mut Connection) -> Result<Option<Row>> {
        let mut rows = self.read(conn, Some(1), None).await?;
        Ok(match rows.is_empty() {
            true => None,
            false => Some(rows.swap_remove(0)),
        })
    }

    /// Move the cursor position. Returns the number of rows the position
    /// moved over.
    ///
    /// With the direction flag at [`Backward`][Direction::Backward],
    /// absolute seeks count from the end, end seeks count from the start,
    /// and relative offsets negate, keeping seek/read pairs symmetric
    /// between a query and its reversed form.
    pub async fn seek(&mut self, conn: &mut Connection, offset: i64, whence: Whence) -> Result<u64> {
        self.guard()?;

        let ident = quote_ident(self.name.as_str());
        let moves = seek_moves(self.direction, offset, whence, &ident);

        let empty = RowSchema::empty();
        let mut count = 0;
        for sql in &moves {
            let (_, tag) = conn.extended_text_command(sql, &empty).await?;
            count = tag.map(|t| t.rows_affected()).unwrap_or_default();
        }
        Ok(count)
    }

    /// Close the server side cursor. Idempotent.
    pub async fn close(&mut self, conn: &mut Connection) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        conn.execute(&format!("CLOSE {}", quote_ident(self.name.as_str()))).await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn guard(&self) -> Result<()> {
        if self.closed {
            return Err(StateError::StatementClosed.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn declare_string_shape() {
        assert_eq!(
            declare_statement_string("\"c00001\"", "SELECT 1"),
            "DECLARE \"c00001\" INSENSITIVE SCROLL CURSOR WITH HOLD FOR SELECT 1",
        );
    }

    #[test]
    fn direction_combination() {
        let mut cursor = Cursor {
            name: CursorName::next(),
            schema: RowSchema::empty(),
            direction: Direction::Forward,
            closed: false,
        };
        assert_eq!(cursor.which_way(None), Direction::Forward);
        assert_eq!(cursor.which_way(Some(Direction::Backward)), Direction::Backward);

        cursor.set_direction(Direction::Backward);
        assert_eq!(cursor.which_way(None), Direction::Backward);
        // a backward cursor read backward walks forward
        assert_eq!(cursor.which_way(Some(Direction::Backward)), Direction::Forward);
    }

    #[test]
    fn seek_translation_is_symmetric() {
        // forward cursor, seek to the end
        assert_eq!(
            seek_moves(Direction::Forward, 0, Whence::FromEnd, "\"c\""),
            vec![
                "MOVE LAST IN \"c\"",
                "MOVE NEXT IN \"c\"",
                "MOVE BACKWARD 0 IN \"c\"",
            ],
        );
        // the same seek on a backward cursor addresses the start
        assert_eq!(
            seek_moves(Direction::Backward, 0, Whence::FromEnd, "\"c\""),
            vec!["MOVE ABSOLUTE 0 IN \"c\""],
        );
        // and an absolute seek on a backward cursor counts from the end
        assert_eq!(
            seek_moves(Direction::Backward, 3, Whence::Absolute, "\"c\""),
            vec![
                "MOVE LAST IN \"c\"",
                "MOVE NEXT IN \"c\"",
                "MOVE BACKWARD 3 IN \"c\"",
            ],
        );
        // relative offsets negate under the backward flag
        assert_eq!(
            seek_moves(Direction::Backward, 2, Whence::Relative, "\"c\""),
            vec!["MOVE BACKWARD 2 IN \"c\""],
        );
        assert_eq!(
            seek_moves(Direction::Forward, -2, Whence::Relative, "\"c\""),
            vec!["MOVE BACKWARD 2 IN \"c\""],
        );
    }
}
