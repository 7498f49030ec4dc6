//! Per connection type oid registry.
//!
//! Maps type oids to wire codecs. Builtins are preloaded; everything else
//! is resolved lazily from `pg_type` through the owning connection and
//! memoized until the connection closes.
//!
//! The registry must issue SQL to resolve types, and executing SQL uses
//! the registry. The cycle is broken by preloading codecs for every oid
//! the catalog lookup queries themselves produce, so those lookups never
//! recurse into resolution.
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::{
    Result,
    common::ByteStr,
    connection::Connection,
    postgres::{Oid, oid},
    types::{Codec, CompositeAttr, DecodeError},
};

/// Catalog classification of one resolved type.
#[derive(Debug, Clone)]
pub struct TypeEntry {
    pub oid: Oid,
    pub namespace: ByteStr,
    pub name: ByteStr,
    pub kind: TypeKind,
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Base,
    /// An array; `element` following `typelem`.
    Array { element: Oid },
    /// A declared composite or a table row type.
    Composite { relid: Oid, attributes: Vec<(ByteStr, Oid)> },
    /// A domain; `base` is the *leaf* of the basetype chain.
    Domain { base: Oid },
    /// Pseudo types, anonymous records included.
    Pseudo,
}

/// Codec cache keyed by type oid.
pub struct TypeRegistry {
    codecs: HashMap<Oid, Arc<Codec>>,
    entries: HashMap<Oid, TypeEntry>,
}

impl TypeRegistry {
    /// A registry holding the builtin codecs, including every oid used by
    /// the catalog lookup queries.
    pub fn bootstrap() -> Self {
        let mut codecs = HashMap::new();

        let scalars: &[(Oid, Codec)] = &[
            (oid::BOOL, Codec::Bool),
            (oid::BYTEA, Codec::Bytea),
            (oid::CHAR, Codec::Text),
            (oid::NAME, Codec::Text),
            (oid::INT8, Codec::Int8),
            (oid::INT2, Codec::Int2),
            (oid::INT4, Codec::Int4),
            (oid::TEXT, Codec::Text),
            (oid::OID, Codec::Oid),
            (oid::FLOAT4, Codec::Float4),
            (oid::FLOAT8, Codec::Float8),
            (oid::INET, Codec::Inet),
            (oid::CIDR, Codec::Inet),
            (oid::BPCHAR, Codec::Text),
            (oid::VARCHAR, Codec::Text),
            (oid::DATE, Codec::Date),
            (oid::TIME, Codec::Time),
            (oid::TIMESTAMP, Codec::Timestamp),
            (oid::TIMESTAMPTZ, Codec::TimestampTz),
            (oid::INTERVAL, Codec::Interval),
            (oid::TIMETZ, Codec::TimeTz),
            (oid::NUMERIC, Codec::Numeric),
        ];
        for (id, codec) in scalars {
            codecs.insert(*id, Arc::new(codec.clone()));
        }

        let arrays: &[(Oid, Oid)] = &[
            (oid::BOOL_ARRAY, oid::BOOL),
            (oid::BYTEA_ARRAY, oid::BYTEA),
            (oid::NAME_ARRAY, oid::NAME),
            (oid::INT2_ARRAY, oid::INT2),
            (oid::INT4_ARRAY, oid::INT4),
            (oid::TEXT_ARRAY, oid::TEXT),
            (oid::INT8_ARRAY, oid::INT8),
            (oid::FLOAT4_ARRAY, oid::FLOAT4),
            (oid::FLOAT8_ARRAY, oid::FLOAT8),
        ];
        for (id, element_oid) in arrays {
            let element = codecs[element_oid].clone();
            codecs.insert(
                *id,
                Arc::new(Codec::Array { element_oid: *element_oid, element }),
            );
        }

        Self { codecs, entries: HashMap::new() }
    }

    pub fn get(&self, oid: Oid) -> Option<Arc<Codec>> {
        self.codecs.get(&oid).cloned()
    }

    pub fn insert(&mut self, oid: Oid, codec: Arc<Codec>) {
        self.codecs.insert(oid, codec);
    }

    /// Catalog info recorded during resolution; `None` for builtins and
    /// unresolved oids.
    pub fn entry(&self, oid: Oid) -> Option<&TypeEntry> {
        self.entries.get(&oid)
    }

    fn record(&mut self, entry: TypeEntry) {
        self.entries.insert(entry.oid, entry);
    }
}

impl Connection {
    /// Resolve the codec for a type oid, querying the catalog on a miss.
    ///
    /// Falls back to text format when no binary codec exists on either
    /// side for the type.
    pub(crate) async fn resolve_codec(&mut self, oid: Oid) -> Result<Arc<Codec>> {
        let mut path = Vec::new();
        self.resolve_codec_rec(oid, &mut path).await
    }

    fn resolve_codec_rec<'a>(
        &'a mut self,
        typid: Oid,
        path: &'a mut Vec<Oid>,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<Codec>>> + 'a>> {
        Box::pin(async move {
            if let Some(codec) = self.registry.get(typid) {
                return Ok(codec);
            }
            if path.contains(&typid) {
                return Err(DecodeError::out_of_range("recursive type definition").into());
            }
            path.push(typid);

            let Some(info) = self.lookup_type(typid).await? else {
                // no pg_type row; decode as text and let the caller convert
                let codec = Arc::new(Codec::TextFallback);
                self.registry.insert(typid, codec.clone());
                path.pop();
                return Ok(codec);
            };

            let codec = if info.typtype == b'd' {
                // domains share the wire format of their leaf base type
                let base = self.lookup_basetype_recursive(typid).await?;
                let codec = self.resolve_codec_rec(base, path).await?;
                self.registry.record(TypeEntry {
                    oid: typid,
                    namespace: info.namespace.clone(),
                    name: info.name.clone(),
                    kind: TypeKind::Domain { base },
                });
                codec
            } else if info.typrelid != 0 {
                let attrs = self.lookup_composite(info.typrelid).await?;
                let mut attributes = Vec::with_capacity(attrs.len());
                let mut resolved = Vec::with_capacity(attrs.len());
                for attr in &attrs {
                    let codec = self.resolve_codec_rec(attr.oid, path).await?;
                    attributes.push((attr.name.clone(), attr.oid));
                    resolved.push(CompositeAttr {
                        name: attr.name.clone(),
                        oid: attr.oid,
                        codec,
                    });
                }
                self.registry.record(TypeEntry {
                    oid: typid,
                    namespace: info.namespace.clone(),
                    name: info.name.clone(),
                    kind: TypeKind::Composite { relid: info.typrelid, attributes },
                });
                Arc::new(Codec::Record { attributes: resolved.into() })
            } else if info.typelem != 0 && info.typlen == -1 {
                self.registry.record(TypeEntry {
                    oid: typid,
                    namespace: info.namespace.clone(),
                    name: info.name.clone(),
                    kind: TypeKind::Array { element: info.typelem },
                });
                if info.elem_has_bin_recv && info.elem_has_bin_send {
                    let element = self.resolve_codec_rec(info.typelem, path).await?;
                    match element.format() {
                        crate::postgres::PgFormat::Binary => {
                            Arc::new(Codec::Array { element_oid: info.typelem, element })
                        }
                        crate::postgres::PgFormat::Text => Arc::new(Codec::TextFallback),
                    }
                } else {
                    Arc::new(Codec::TextFallback)
                }
            } else {
                self.registry.record(TypeEntry {
                    oid: typid,
                    namespace: info.namespace.clone(),
                    name: info.name.clone(),
                    kind: match info.typtype {
                        b'p' => TypeKind::Pseudo,
                        _ => TypeKind::Base,
                    },
                });
                Arc::new(Codec::TextFallback)
            };

            path.pop();
            self.registry.insert(typid, codec.clone());
            Ok(codec)
        })
    }

    /// Catalog classification of a type, if it was resolved already.
    pub fn type_entry(&self, oid: Oid) -> Option<&TypeEntry> {
        self.registry.entry(oid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bootstrap_covers_catalog_query_types() {
        let registry = TypeRegistry::bootstrap();
        // the oids produced by the lookup queries themselves
        for id in [
            oid::OID,
            oid::NAME,
            oid::TEXT,
            oid::CHAR,
            oid::BOOL,
            oid::INT2,
            oid::INT4,
            oid::INT8,
        ] {
            assert!(registry.get(id).is_some(), "missing bootstrap codec for {id}");
        }
    }

    #[test]
    fn bootstrap_arrays_carry_their_element() {
        let registry = TypeRegistry::bootstrap();
        let codec = registry.get(oid::INT4_ARRAY).unwrap();
        let Codec::Array { element_oid, element } = codec.as_ref() else {
            panic!("expected array codec")
        };
        assert_eq!(*element_oid, oid::INT4);
        assert!(matches!(element.as_ref(), Codec::Int4));
    }
}
