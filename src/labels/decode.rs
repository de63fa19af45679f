//! Serde deserializer over the label node tree.
//!
//! # Design Decisions
//! - Leaves are strings; scalars are parsed on demand
//! - Struct fields match label segments case-insensitively
//! - A sequence can be a comma-separated leaf, numbered children, or a
//!   single struct node (`loadbalancer.server.port` fills `servers[0]`)
//! - Unknown struct fields are errors so typos never silently vanish

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use serde::de::value::StringDeserializer;
use serde::de::{self, DeserializeSeed, IntoDeserializer, MapAccess, SeqAccess, Visitor};
use serde::forward_to_deserialize_any;

use crate::labels::parser::Node;
use crate::labels::DecodeError;

/// Label segments that name a one-element sequence field.
const SLICE_AS_STRUCT: &[(&str, &str)] = &[("server", "servers")];

pub struct NodeDeserializer {
    node: Node,
}

impl NodeDeserializer {
    pub fn new(node: Node) -> Self {
        Self { node }
    }

    fn leaf(&self, expected: &str) -> Result<&str, DecodeError> {
        match &self.node {
            Node::Leaf(value) => Ok(value.trim()),
            Node::Branch(_) => Err(DecodeError::message(format!(
                "expected {expected}, found nested labels"
            ))),
        }
    }

    fn parse<T>(&self, expected: &str) -> Result<T, DecodeError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.leaf(expected)?;
        raw.parse::<T>().map_err(|e| {
            DecodeError::message(format!("invalid {expected} value {raw:?}: {e}"))
        })
    }
}

macro_rules! deserialize_number {
    ($($method:ident => $visit:ident: $ty:ty,)*) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
                visitor.$visit(self.parse::<$ty>(stringify!($ty))?)
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for NodeDeserializer {
    type Error = DecodeError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        match self.node {
            Node::Leaf(value) => visitor.visit_string(value),
            Node::Branch(children) => visitor.visit_map(BranchAccess::plain(children)),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        let raw = self.leaf("bool")?;
        if raw.eq_ignore_ascii_case("true") {
            visitor.visit_bool(true)
        } else if raw.eq_ignore_ascii_case("false") {
            visitor.visit_bool(false)
        } else {
            Err(DecodeError::message(format!("invalid bool value {raw:?}")))
        }
    }

    deserialize_number! {
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
        deserialize_f32 => visit_f32: f32,
        deserialize_f64 => visit_f64: f64,
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        visitor.visit_char(self.parse::<char>("char")?)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        self.deserialize_string(visitor)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        match self.node {
            Node::Leaf(value) => visitor.visit_string(value),
            Node::Branch(_) => Err(DecodeError::message(
                "expected a value, found nested labels",
            )),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        // A node only exists when at least one label declared it.
        visitor.visit_some(self)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, DecodeError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        let items = match self.node {
            Node::Leaf(value) => value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Node::Leaf(item.to_string()))
                .collect(),
            Node::Branch(children) => {
                let indexed: Option<Vec<(usize, Node)>> = children
                    .iter()
                    .map(|(key, node)| key.parse::<usize>().ok().map(|i| (i, node.clone())))
                    .collect();
                match indexed {
                    Some(mut indexed) if !indexed.is_empty() => {
                        indexed.sort_by_key(|(i, _)| *i);
                        indexed.into_iter().map(|(_, node)| node).collect()
                    }
                    _ => vec![Node::Branch(children)],
                }
            }
        };
        visitor.visit_seq(NodeSeq {
            items: items.into_iter(),
            index: 0,
        })
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        match self.node {
            Node::Branch(children) => visitor.visit_map(BranchAccess::plain(children)),
            Node::Leaf(_) => Err(DecodeError::message("expected nested labels, found a value")),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, DecodeError> {
        match self.node {
            Node::Branch(children) => {
                visitor.visit_map(BranchAccess::for_struct(children, fields)?)
            }
            // `...middlewares.gzip.compress=true` enables a section with defaults.
            Node::Leaf(value) if value.trim().is_empty() || value.trim().eq_ignore_ascii_case("true") => {
                visitor.visit_map(BranchAccess::plain(BTreeMap::new()))
            }
            Node::Leaf(value) => Err(DecodeError::message(format!(
                "expected nested labels, found value {value:?}"
            ))),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, DecodeError> {
        let raw = self.leaf("enum variant")?.to_string();
        visitor.visit_enum(raw.into_deserializer())
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        self.deserialize_string(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, DecodeError> {
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        bytes byte_buf unit_struct tuple tuple_struct
    }
}

struct NodeSeq {
    items: std::vec::IntoIter<Node>,
    index: usize,
}

impl<'de> SeqAccess<'de> for NodeSeq {
    type Error = DecodeError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, DecodeError> {
        let Some(node) = self.items.next() else {
            return Ok(None);
        };
        let index = self.index;
        self.index += 1;
        seed.deserialize(NodeDeserializer::new(node))
            .map(Some)
            .map_err(|e| e.within(&index.to_string()))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

struct BranchAccess {
    entries: std::vec::IntoIter<(String, String, Node)>,
    pending: Option<(String, Node)>,
}

impl BranchAccess {
    /// Keys are passed through untouched (names of routers, headers, ...).
    fn plain(children: BTreeMap<String, Node>) -> Self {
        let entries: Vec<_> = children
            .into_iter()
            .map(|(key, node)| (key.clone(), key, node))
            .collect();
        Self {
            entries: entries.into_iter(),
            pending: None,
        }
    }

    /// Keys are resolved against the struct's field names.
    fn for_struct(
        children: BTreeMap<String, Node>,
        fields: &'static [&'static str],
    ) -> Result<Self, DecodeError> {
        let mut entries = Vec::with_capacity(children.len());
        for (key, node) in children {
            let field = resolve_field(&key, fields)
                .ok_or_else(|| DecodeError::new(key.clone(), "unknown field"))?;
            entries.push((field.to_string(), key, node));
        }
        Ok(Self {
            entries: entries.into_iter(),
            pending: None,
        })
    }
}

fn resolve_field(key: &str, fields: &'static [&'static str]) -> Option<&'static str> {
    if let Some(field) = fields.iter().find(|f| f.eq_ignore_ascii_case(key)) {
        return Some(field);
    }
    SLICE_AS_STRUCT
        .iter()
        .filter(|(label, _)| label.eq_ignore_ascii_case(key))
        .find_map(|(_, target)| fields.iter().find(|f| f.eq_ignore_ascii_case(target)))
        .copied()
}

impl<'de> MapAccess<'de> for BranchAccess {
    type Error = DecodeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, DecodeError> {
        let Some((field, label, node)) = self.entries.next() else {
            return Ok(None);
        };
        let field: StringDeserializer<DecodeError> = field.into_deserializer();
        let key = seed.deserialize(field)?;
        self.pending = Some((label, node));
        Ok(Some(key))
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(
        &mut self,
        seed: V,
    ) -> Result<V::Value, DecodeError> {
        let (label, node) = self
            .pending
            .take()
            .ok_or_else(|| DecodeError::message("value requested before key"))?;
        seed.deserialize(NodeDeserializer::new(node))
            .map_err(|e| e.within(&label))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}
