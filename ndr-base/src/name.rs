//! Hierarchical names.
//!
//! A [`Name`] is an ordered sequence of typed binary [`Component`]s. Names are ordered
//! component by component using the canonical NDN order (type, then length, then bytes),
//! which keeps every name that shares a prefix contiguous in a sorted map.

use std::{cmp::Ordering, fmt, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::tlv::{self, TlvError};

/// TLV type of a name.
pub const TYPE_NAME: u64 = 7;
/// Component type for parameter digests.
pub const TYPE_PARAMETERS_DIGEST: u64 = 2;
/// Component type for generic, opaque components.
pub const TYPE_GENERIC: u64 = 8;
/// Component type for segment numbers.
pub const TYPE_SEGMENT: u64 = 50;
/// Component type for sequence numbers.
pub const TYPE_SEQUENCE: u64 = 58;

/// Errors parsing or decoding a [`Name`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The binary encoding is invalid.
    #[error("invalid name encoding: {0}")]
    Tlv(#[from] TlvError),
    /// A URI component could not be parsed.
    #[error("invalid name component {0:?}")]
    InvalidComponent(String),
}

/// A single name component.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Component {
    typ: u64,
    value: Bytes,
}

impl Component {
    /// Creates a component of an arbitrary type.
    pub fn new(typ: u64, value: impl Into<Bytes>) -> Self {
        Self {
            typ,
            value: value.into(),
        }
    }

    /// Creates a generic component.
    pub fn generic(value: impl Into<Bytes>) -> Self {
        Self::new(TYPE_GENERIC, value)
    }

    /// Creates a segment number component.
    pub fn segment(n: u64) -> Self {
        Self::new(TYPE_SEGMENT, tlv::encode_nonneg(n))
    }

    /// Creates a sequence number component.
    pub fn sequence(n: u64) -> Self {
        Self::new(TYPE_SEQUENCE, tlv::encode_nonneg(n))
    }

    /// Creates a parameters digest component.
    pub fn parameters_digest(digest: [u8; 32]) -> Self {
        Self::new(TYPE_PARAMETERS_DIGEST, digest.to_vec())
    }

    /// The component type.
    pub fn typ(&self) -> u64 {
        self.typ
    }

    /// The raw component value.
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Interprets the value as a NonNegativeInteger, regardless of the type.
    pub fn to_number(&self) -> Option<u64> {
        tlv::decode_nonneg(&self.value)
    }

    /// The segment number, if this is a segment component.
    pub fn as_segment(&self) -> Option<u64> {
        (self.typ == TYPE_SEGMENT)
            .then(|| self.to_number())
            .flatten()
    }

    /// The sequence number, if this is a sequence number component.
    pub fn as_sequence(&self) -> Option<u64> {
        (self.typ == TYPE_SEQUENCE)
            .then(|| self.to_number())
            .flatten()
    }

    fn encoded_len(&self) -> usize {
        tlv::var_number_len(self.typ)
            + tlv::var_number_len(self.value.len() as u64)
            + self.value.len()
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        self.typ
            .cmp(&other.typ)
            .then_with(|| self.value.len().cmp(&other.value.len()))
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.typ {
            TYPE_SEGMENT if self.as_segment().is_some() => {
                write!(f, "seg={}", self.to_number().unwrap_or_default())
            }
            TYPE_SEQUENCE if self.as_sequence().is_some() => {
                write!(f, "seq={}", self.to_number().unwrap_or_default())
            }
            TYPE_PARAMETERS_DIGEST if self.value.len() == 32 => {
                write!(f, "params-sha256={}", hex::encode(&self.value))
            }
            TYPE_GENERIC => write_escaped(f, &self.value),
            typ => {
                write!(f, "{typ}=")?;
                write_escaped(f, &self.value)
            }
        }
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Component({self})")
    }
}

impl FromStr for Component {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NameError::InvalidComponent(s.to_string());
        if let Some(n) = s.strip_prefix("seg=") {
            return n.parse().map(Component::segment).map_err(|_| invalid());
        }
        if let Some(n) = s.strip_prefix("seq=") {
            return n.parse().map(Component::sequence).map_err(|_| invalid());
        }
        if let Some(digest) = s.strip_prefix("params-sha256=") {
            let digest: [u8; 32] = hex::decode(digest)
                .ok()
                .and_then(|d| d.try_into().ok())
                .ok_or_else(invalid)?;
            return Ok(Component::parameters_digest(digest));
        }
        if let Some((typ, value)) = s.split_once('=') {
            if let Ok(typ) = typ.parse::<u64>() {
                return Ok(Component::new(typ, unescape(value).ok_or_else(invalid)?));
            }
        }
        Ok(Component::generic(unescape(s).ok_or_else(invalid)?))
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, value: &[u8]) -> fmt::Result {
    if value.is_empty() {
        return f.write_str("...");
    }
    // a value made only of periods would collide with the "..." marker
    let all_periods = value.iter().all(|b| *b == b'.');
    for b in value {
        if all_periods {
            f.write_str("%2E")?;
            continue;
        }
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                write!(f, "{}", *b as char)?
            }
            _ => write!(f, "%{b:02X}")?,
        }
    }
    Ok(())
}

fn unescape(s: &str) -> Option<Vec<u8>> {
    if s == "..." {
        return Some(Vec::new());
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}

/// A hierarchical name, immutable once built.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Name(Vec<Component>);

impl Name {
    /// The empty (root) name.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Builds a name from components.
    pub fn from_components(components: impl IntoIterator<Item = Component>) -> Self {
        Self(components.into_iter().collect())
    }

    /// The components of this name.
    pub fn components(&self) -> &[Component] {
        &self.0
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this is the root name.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Component at `index`.
    pub fn get(&self, index: usize) -> Option<&Component> {
        self.0.get(index)
    }

    /// The last component.
    pub fn last(&self) -> Option<&Component> {
        self.0.last()
    }

    /// The numeric value of the last component, if it is a segment or sequence number.
    pub fn last_number(&self) -> Option<u64> {
        let last = self.0.last()?;
        last.as_segment().or_else(|| last.as_sequence())
    }

    /// The first `n` components as a new name.
    pub fn prefix(&self, n: usize) -> Name {
        Self(self.0[..n.min(self.0.len())].to_vec())
    }

    /// Returns a new name with `component` appended.
    pub fn append(&self, component: Component) -> Name {
        let mut components = self.0.clone();
        components.push(component);
        Self(components)
    }

    /// Returns a new name with a generic component appended.
    pub fn append_generic(&self, value: impl Into<Bytes>) -> Name {
        self.append(Component::generic(value))
    }

    /// Returns a new name with a segment number appended.
    pub fn append_segment(&self, n: u64) -> Name {
        self.append(Component::segment(n))
    }

    /// Returns a new name with a sequence number appended.
    pub fn append_sequence(&self, n: u64) -> Name {
        self.append(Component::sequence(n))
    }

    /// Returns `self` followed by all components of `other`.
    pub fn join(&self, other: &Name) -> Name {
        Self(self.0.iter().chain(other.0.iter()).cloned().collect())
    }

    /// Whether every component of `self` equals the corresponding component of `other`.
    ///
    /// A name is a prefix of itself.
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }

    /// Encodes the components without the outer name type and length.
    ///
    /// For two names `a` and `b`, `a.is_prefix_of(b)` exactly when the encoding of `a` is a
    /// byte prefix of the encoding of `b`, which makes this the canonical storage key.
    pub fn encode_components(&self) -> Vec<u8> {
        let len = self.0.iter().map(Component::encoded_len).sum();
        let mut buf = Vec::with_capacity(len);
        for c in &self.0 {
            tlv::write_element(&mut buf, c.typ, &c.value);
        }
        buf
    }

    /// Encodes the full name element.
    pub fn encode(&self) -> Vec<u8> {
        let inner = self.encode_components();
        let mut buf = Vec::with_capacity(inner.len() + 10);
        tlv::write_element(&mut buf, TYPE_NAME, &inner);
        buf
    }

    /// Decodes a sequence of components with no outer framing.
    pub fn decode_components(mut buf: &[u8]) -> Result<Name, NameError> {
        let mut components = Vec::new();
        while !buf.is_empty() {
            let (typ, value) = tlv::read_element(&mut buf)?;
            components.push(Component::new(typ, Bytes::copy_from_slice(value)));
        }
        Ok(Self(components))
    }

    /// Decodes a full name element.
    pub fn decode(mut buf: &[u8]) -> Result<Name, NameError> {
        let (typ, value) = tlv::read_element(&mut buf)?;
        if typ != TYPE_NAME {
            return Err(TlvError::UnexpectedType {
                expected: TYPE_NAME,
                found: typ,
            }
            .into());
        }
        if !buf.is_empty() {
            return Err(TlvError::TrailingBytes(buf.len()).into());
        }
        Self::decode_components(value)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for c in &self.0 {
            write!(f, "/{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({self})")
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split('/')
            .filter(|c| !c.is_empty())
            .map(Component::from_str)
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

impl From<Vec<Component>> for Name {
    fn from(components: Vec<Component>) -> Self {
        Self(components)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[test]
    fn uri_roundtrip() {
        for s in [
            "/",
            "/a/b/c",
            "/repo/seg=3",
            "/node/sync/seq=70000",
            "/with%20space/%00%FF",
            "/32=raw/...",
        ] {
            assert_eq!(name(s).to_string(), s);
        }
        assert_eq!(name("a/b").to_string(), "/a/b");
        assert!("/seg=x".parse::<Name>().is_err());
        assert!("/bad%zz".parse::<Name>().is_err());
    }

    #[test]
    fn prefix_relation() {
        let a = name("/a/b");
        assert!(a.is_prefix_of(&a));
        assert!(a.is_prefix_of(&name("/a/b/c")));
        assert!(!a.is_prefix_of(&name("/a")));
        assert!(!a.is_prefix_of(&name("/a/bc")));
        assert!(Name::root().is_prefix_of(&a));
    }

    #[test]
    fn segments_sort_numerically() {
        let base = name("/obj");
        let mut names: Vec<_> = [256u64, 2, 255, 10, 0]
            .iter()
            .map(|n| base.append_segment(*n))
            .collect();
        names.sort();
        let order: Vec<_> = names
            .iter()
            .map(|n| n.last().and_then(Component::as_segment).unwrap())
            .collect();
        assert_eq!(order, vec![0, 2, 10, 255, 256]);
    }

    #[test]
    fn full_encoding() {
        let n = name("/a/seg=1");
        let encoded = n.encode();
        assert_eq!(encoded, vec![7, 6, 8, 1, b'a', 50, 1, 1]);
        assert_eq!(Name::decode(&encoded).unwrap(), n);
        assert!(matches!(
            Name::decode(&[8, 0]),
            Err(NameError::Tlv(TlvError::UnexpectedType { .. }))
        ));
    }

    fn arb_component() -> impl Strategy<Value = Component> {
        prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..6).prop_map(Component::generic),
            any::<u64>().prop_map(Component::segment),
            any::<u64>().prop_map(Component::sequence),
        ]
    }

    fn arb_name() -> impl Strategy<Value = Name> {
        proptest::collection::vec(arb_component(), 0..5).prop_map(Name::from)
    }

    proptest! {
        #[test]
        fn encoding_roundtrips(n in arb_name()) {
            prop_assert_eq!(Name::decode_components(&n.encode_components()).unwrap(), n.clone());
            prop_assert_eq!(n.to_string().parse::<Name>().unwrap(), n);
        }

        #[test]
        fn prefix_matches_key_prefix(a in arb_name(), b in arb_name()) {
            let joined = a.join(&b);
            prop_assert!(a.is_prefix_of(&joined));
            prop_assert!(joined.encode_components().starts_with(&a.encode_components()));
            prop_assert_eq!(
                a.is_prefix_of(&b),
                b.encode_components().starts_with(&a.encode_components())
            );
        }

        #[test]
        fn prefix_sorts_first(a in arb_name(), b in arb_name()) {
            prop_assert!(a <= a.join(&b));
        }
    }
}
