//! Postgres row operation.
//!
//! - [`Row`]
//! - [`RowSchema`]
//! - [`FromRow`]
//! - [`RowIndex`]
use std::sync::Arc;

use crate::{
    common::ByteStr,
    postgres::{Oid, PgFormat, backend::DataRow},
    types::{Codec, DecodeError},
    value::Value,
};

/// One column of a result set: wire description plus the resolved codec.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: ByteStr,
    pub oid: Oid,
    pub format: PgFormat,
    pub(crate) codec: Arc<Codec>,
}

/// Shared description of a result set shape.
///
/// Cloning is cheap; every row of a result set holds the same schema.
#[derive(Debug, Clone)]
pub struct RowSchema {
    columns: Arc<[ColumnInfo]>,
}

impl RowSchema {
    pub(crate) fn new(columns: Vec<ColumnInfo>) -> Self {
        Self { columns: columns.into() }
    }

    /// Schema of a statement that returns no rows.
    pub(crate) fn empty() -> Self {
        Self { columns: Arc::from(Vec::new()) }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    /// Index of the column with the given name.
    ///
    /// Names map to indices; indices are authoritative. The first of
    /// duplicate names wins.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == *name)
    }

    /// The format codes to request for a `Bind` against this schema.
    pub(crate) fn result_formats(&self) -> Vec<PgFormat> {
        self.columns.iter().map(|c| c.format).collect()
    }

    /// Decode one `DataRow` against this schema.
    pub(crate) fn decode_row(&self, data: DataRow) -> Result<Row, crate::Error> {
        let raw = data.split()?;
        if raw.len() != self.columns.len() {
            return Err(crate::postgres::ProtocolError::ColumnCount {
                expected: self.columns.len(),
                got: raw.len(),
            }
            .into());
        }

        let mut values = Vec::with_capacity(raw.len());
        for (index, (bytes, column)) in raw.into_iter().zip(self.columns.iter()).enumerate() {
            let value = match bytes {
                None => Value::Null,
                Some(bytes) => column
                    .codec
                    .decode(bytes)
                    .map_err(|e| e.in_column(column.name.clone(), index))?,
            };
            values.push(value);
        }

        Ok(Row { schema: self.clone(), values })
    }
}

/// A decoded result row: ordered typed values with column name lookup.
#[derive(Debug, Clone)]
pub struct Row {
    schema: RowSchema,
    values: Vec<Value>,
}

/// Per column mapping function for [`Row::transform`].
pub type ColumnMap<'a> = &'a dyn Fn(Value) -> Value;

impl Row {
    pub fn schema(&self) -> &RowSchema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Borrow a column value.
    pub fn value<I: RowIndex>(&self, index: I) -> Result<&Value, DecodeError> {
        let at = index.position(&self.schema)?;
        Ok(&self.values[at])
    }

    /// Get and convert a column value.
    pub fn try_get<I: RowIndex, T>(&self, index: I) -> Result<T, DecodeError>
    where
        T: TryFrom<Value, Error = DecodeError>,
    {
        let at = index.position(&self.schema)?;
        T::try_from(self.values[at].clone())
            .map_err(|e| e.in_column(self.schema.columns[at].name.clone(), at))
    }

    /// Consume self into the column values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Apply per column mappings, producing a row with the same schema.
    ///
    /// `positional[i]` maps column `i`; `None` leaves it unchanged. Entries
    /// in `named` map their column by name and win over positional ones.
    pub fn transform(
        mut self,
        positional: &[Option<ColumnMap>],
        named: &[(&str, ColumnMap)],
    ) -> Result<Row, DecodeError> {
        for (index, map) in positional.iter().enumerate() {
            if index >= self.values.len() {
                break;
            }
            if let Some(map) = map {
                let value = std::mem::replace(&mut self.values[index], Value::Null);
                self.values[index] = map(value);
            }
        }

        for (name, map) in named {
            let at = name.position(&self.schema)?;
            let value = std::mem::replace(&mut self.values[at], Value::Null);
            self.values[at] = map(value);
        }

        Ok(self)
    }
}

impl std::ops::Index<usize> for Row {
    type Output = Value;

    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

impl IntoIterator for Row {
    type Item = Value;
    type IntoIter = std::vec::IntoIter<Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

impl FromRow for Vec<Value> {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row.into_values())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:tt),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: TryFrom<Value, Error = DecodeError>),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get::<_, $t>($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3, T4 4, T5 5);

/// Type that can be used for indexing column.
pub trait RowIndex: sealed::Sealed {
    fn position(&self, schema: &RowSchema) -> Result<usize, DecodeError>;
}

impl RowIndex for usize {
    fn position(&self, schema: &RowSchema) -> Result<usize, DecodeError> {
        if *self >= schema.len() {
            return Err(DecodeError::ColumnNotFound(
                itoa::Buffer::new().format(*self).to_owned().into(),
            ));
        }
        Ok(*self)
    }
}

impl RowIndex for &str {
    fn position(&self, schema: &RowSchema) -> Result<usize, DecodeError> {
        schema
            .index_of(self)
            .ok_or_else(|| DecodeError::ColumnNotFound(String::from(*self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::oid;

    pub(crate) fn schema(names: &[(&'static str, Codec, Oid)]) -> RowSchema {
        RowSchema::new(
            names
                .iter()
                .map(|(name, codec, oid)| ColumnInfo {
                    name: (*name).into(),
                    oid: *oid,
                    format: codec.format(),
                    codec: Arc::new(codec.clone()),
                })
                .collect(),
        )
    }

    fn sample() -> Row {
        Row {
            schema: schema(&[
                ("id", Codec::Int4, oid::INT4),
                ("label", Codec::Text, oid::TEXT),
            ]),
            values: vec![Value::Int4(7), Value::Text("seven".into())],
        }
    }

    #[test]
    fn name_and_index_lookup() {
        let row = sample();
        assert_eq!(row.try_get::<_, i32>(0).unwrap(), 7);
        assert_eq!(row.try_get::<_, i32>("id").unwrap(), 7);
        assert_eq!(row.try_get::<_, String>("label").unwrap(), "seven");
        assert!(row.try_get::<_, i32>("missing").is_err());
        assert!(row.try_get::<_, i32>(9).is_err());
    }

    #[test]
    fn null_decodes_to_sentinel() {
        let row = Row {
            schema: schema(&[("v", Codec::Int4, oid::INT4)]),
            values: vec![Value::Null],
        };
        assert!(row.value(0).unwrap().is_null());
        assert_eq!(row.try_get::<_, Option<i32>>(0).unwrap(), None);
        assert!(row.try_get::<_, i32>(0).is_err());
    }

    #[test]
    fn transform_keeps_schema() {
        let doubled = |v: Value| match v {
            Value::Int4(n) => Value::Int4(n * 2),
            v => v,
        };
        let upper = |v: Value| match v {
            Value::Text(s) => Value::Text(s.to_uppercase().into()),
            v => v,
        };

        let row = sample()
            .transform(&[Some(&doubled), None], &[("label", &upper)])
            .unwrap();
        assert_eq!(row.try_get::<_, i32>("id").unwrap(), 14);
        assert_eq!(row.try_get::<_, String>("label").unwrap(), "SEVEN");
        assert_eq!(row.schema().len(), 2);
    }
}
