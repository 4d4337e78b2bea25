//! Flattening codec between structured values and annotations.
//!
//! Values are flattened into key/value pairs whose keys are `.`-joined
//! paths: struct fields contribute their names (`Parent.Child`), map
//! entries their keys (`Map.Key`), and sequence elements their indices
//! (`Seq.0`). Scalar leaves are rendered as plain text: strings verbatim,
//! numbers and booleans in their decimal forms, timestamps as RFC3339 with
//! nanoseconds (via chrono's serde impl). Rebuilding a value reverses the
//! process: the key paths are assembled into a tree and the target type is
//! deserialized from it, parsing scalars out of the text leaves.
//!
//! Empty containers flatten to nothing, so container-typed fields of
//! round-tripped values should carry `#[serde(default)]`.

use std::collections::{btree_map, BTreeMap};

use serde::de::{self, IntoDeserializer};
use serde::Serialize;
use serde_json::Value;

use crate::error::EventError;
use crate::span::{Annotation, Annotations, SCHEMA_PREFIX};

/// Flattens `value` into annotations keyed by path.
pub fn flatten<T: Serialize>(value: &T) -> Result<Annotations, EventError> {
    let value = serde_json::to_value(value).map_err(|err| EventError::Encode(err.to_string()))?;
    let mut out = Annotations::new();
    flatten_value("", value, &mut out);
    Ok(out)
}

fn flatten_value(prefix: &str, value: Value, out: &mut Annotations) {
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push(Annotation::new(prefix, if b { "true" } else { "false" })),
        Value::Number(n) => out.push(Annotation::new(prefix, n.to_string())),
        Value::String(s) => out.push(Annotation::new(prefix, s)),
        Value::Array(items) => {
            for (i, item) in items.into_iter().enumerate() {
                flatten_value(&join(prefix, &i.to_string()), item, out);
            }
        }
        Value::Object(entries) => {
            for (key, entry) in entries {
                flatten_value(&join(prefix, &key), entry, out);
            }
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Rebuilds a value of type `T` from flattened annotations.
///
/// Schema markers are skipped; unknown keys are ignored by the target
/// type's deserializer as usual.
pub fn unflatten<T: de::DeserializeOwned>(anns: &Annotations) -> Result<T, EventError> {
    let mut root = Node::Branch(BTreeMap::new());
    for ann in anns {
        if ann.key.starts_with(SCHEMA_PREFIX) {
            continue;
        }
        let path: Vec<&str> = ann.key.split('.').collect();
        let text = String::from_utf8_lossy(&ann.value).into_owned();
        root.insert(&path, text);
    }
    T::deserialize(&root).map_err(|err| EventError::Decode(err.to_string()))
}

/// One node of the reassembled value tree: either a scalar's text form or
/// a map of path segments.
enum Node {
    Leaf(String),
    Branch(BTreeMap<String, Node>),
}

impl Node {
    fn insert(&mut self, path: &[&str], value: String) {
        let Some((head, rest)) = path.split_first() else {
            *self = Node::Leaf(value);
            return;
        };
        if let Node::Leaf(_) = self {
            // A shorter path already claimed this position; the longer,
            // more specific one wins.
            *self = Node::Branch(BTreeMap::new());
        }
        match self {
            Node::Branch(entries) => entries
                .entry((*head).to_string())
                .or_insert_with(|| Node::Branch(BTreeMap::new()))
                .insert(rest, value),
            Node::Leaf(_) => {}
        }
    }
}

macro_rules! deserialize_parsed {
    ($method:ident, $visit:ident, $ty:ty) => {
        fn $method<V>(self, visitor: V) -> Result<V::Value, Self::Error>
        where
            V: de::Visitor<'de>,
        {
            match self {
                Node::Leaf(text) => {
                    let parsed: $ty = text.parse().map_err(|_| {
                        de::Error::custom(format_args!(
                            concat!("invalid ", stringify!($ty), " value {:?}"),
                            text
                        ))
                    })?;
                    visitor.$visit(parsed)
                }
                Node::Branch(_) => Err(de::Error::custom(concat!(
                    "expected ",
                    stringify!($ty),
                    ", found nested value"
                ))),
            }
        }
    };
}

impl<'de> de::Deserializer<'de> for &'de Node {
    type Error = de::value::Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self {
            Node::Leaf(text) => visitor.visit_str(text),
            Node::Branch(_) => self.deserialize_map(visitor),
        }
    }

    deserialize_parsed!(deserialize_bool, visit_bool, bool);
    deserialize_parsed!(deserialize_i8, visit_i8, i8);
    deserialize_parsed!(deserialize_i16, visit_i16, i16);
    deserialize_parsed!(deserialize_i32, visit_i32, i32);
    deserialize_parsed!(deserialize_i64, visit_i64, i64);
    deserialize_parsed!(deserialize_u8, visit_u8, u8);
    deserialize_parsed!(deserialize_u16, visit_u16, u16);
    deserialize_parsed!(deserialize_u32, visit_u32, u32);
    deserialize_parsed!(deserialize_u64, visit_u64, u64);
    deserialize_parsed!(deserialize_f32, visit_f32, f32);
    deserialize_parsed!(deserialize_f64, visit_f64, f64);
    deserialize_parsed!(deserialize_char, visit_char, char);

    fn deserialize_str<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self {
            Node::Leaf(text) => visitor.visit_str(text),
            Node::Branch(_) => Err(de::Error::custom("expected string, found nested value")),
        }
    }

    fn deserialize_string<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self {
            Node::Leaf(text) => visitor.visit_bytes(text.as_bytes()),
            Node::Branch(_) => Err(de::Error::custom("expected bytes, found nested value")),
        }
    }

    fn deserialize_byte_buf<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        // A present node is always Some; absent fields never reach here.
        visitor.visit_some(self)
    }

    fn deserialize_unit<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self {
            Node::Branch(entries) => {
                let mut indexed: Vec<(usize, &Node)> = Vec::with_capacity(entries.len());
                for (key, node) in entries {
                    let index: usize = key.parse().map_err(|_| {
                        de::Error::custom(format_args!("non-numeric sequence index {key:?}"))
                    })?;
                    indexed.push((index, node));
                }
                indexed.sort_by_key(|(index, _)| *index);
                visitor.visit_seq(SeqNodes {
                    iter: indexed.into_iter(),
                })
            }
            Node::Leaf(_) => Err(de::Error::custom("expected sequence, found scalar")),
        }
    }

    fn deserialize_tuple<V>(self, _len: usize, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self {
            Node::Branch(entries) => visitor.visit_map(BranchEntries {
                iter: entries.iter(),
                value: None,
            }),
            Node::Leaf(_) => Err(de::Error::custom("expected map, found scalar")),
        }
    }

    fn deserialize_struct<V>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_map(visitor)
    }

    fn deserialize_enum<V>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        match self {
            Node::Leaf(text) => visitor.visit_enum(text.as_str().into_deserializer()),
            Node::Branch(_) => Err(de::Error::custom(
                "only unit enum variants are supported in annotations",
            )),
        }
    }

    fn deserialize_identifier<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_unit()
    }
}

struct SeqNodes<'de> {
    iter: std::vec::IntoIter<(usize, &'de Node)>,
}

impl<'de> de::SeqAccess<'de> for SeqNodes<'de> {
    type Error = de::value::Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error>
    where
        T: de::DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some((_, node)) => seed.deserialize(node).map(Some),
            None => Ok(None),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

struct BranchEntries<'de> {
    iter: btree_map::Iter<'de, String, Node>,
    value: Option<&'de Node>,
}

impl<'de> de::MapAccess<'de> for BranchEntries<'de> {
    type Error = de::value::Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: de::DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some((key, node)) => {
                self.value = Some(node);
                seed.deserialize(key.as_str().into_deserializer()).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: de::DeserializeSeed<'de>,
    {
        let node = self
            .value
            .take()
            .ok_or_else(|| de::Error::custom("value requested before key"))?;
        seed.deserialize(node)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}
