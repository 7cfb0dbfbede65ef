//! Subspaces: tuple-prefixed slices of the keyspace.
//!
//! A `Subspace` scopes every key a component touches under a common packed
//! prefix, so components sharing a store cannot collide and range operations
//! (`clear_range`, scans) stay cheap to express.

use crate::tuple::{self, Element, TupleError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    /// A subspace rooted at raw prefix bytes (not tuple-encoded).
    pub fn from_bytes(prefix: &[u8]) -> Self {
        Self {
            prefix: prefix.to_vec(),
        }
    }

    /// A subspace rooted at the packed form of `elements`.
    pub fn new(elements: &[Element]) -> Self {
        Self {
            prefix: tuple::pack(elements),
        }
    }

    /// The raw prefix. Also the key used when a subspace doubles as a single
    /// cell, e.g. the active marker.
    pub fn key(&self) -> &[u8] {
        &self.prefix
    }

    /// Child subspace scoped by one more tuple element.
    pub fn get(&self, element: Element) -> Subspace {
        let mut prefix = self.prefix.clone();
        prefix.extend_from_slice(&tuple::pack(std::slice::from_ref(&element)));
        Subspace { prefix }
    }

    /// Pack a tuple under this subspace's prefix.
    pub fn pack(&self, elements: &[Element]) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(&tuple::pack(elements));
        key
    }

    /// Decode a key produced by [`Subspace::pack`], stripping the prefix.
    pub fn unpack(&self, key: &[u8]) -> Result<Vec<Element>, TupleError> {
        let rest = key
            .strip_prefix(self.prefix.as_slice())
            .ok_or(TupleError::OutsidePrefix)?;
        tuple::unpack(rest)
    }

    /// True iff `key` lies within this subspace.
    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// The half-open key range covering every packed tuple in this subspace.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut begin = self.prefix.clone();
        begin.push(0x00);
        let mut end = self.prefix.clone();
        end.push(0xFF);
        (begin, end)
    }

    /// The range covering keys packed under `self` extended by `elements`.
    pub fn range_of(&self, elements: &[Element]) -> (Vec<u8>, Vec<u8>) {
        let mut sub = self.clone();
        for elem in elements {
            sub = sub.get(elem.clone());
        }
        sub.range()
    }

    /// The range covering the entire prefix, including the bare prefix key
    /// itself. Used to wipe a component's whole footprint.
    pub fn full_range(&self) -> (Vec<u8>, Vec<u8>) {
        let begin = self.prefix.clone();
        let mut end = self.prefix.clone();
        end.push(0xFF);
        (begin, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_under_prefix() {
        let root = Subspace::from_bytes(b"bucket");
        let child = root.get(Element::Bytes(b"avp".to_vec())).get(Element::Int(1));
        let key = child.pack(&[Element::Bytes(b"uid-1".to_vec())]);
        assert!(child.contains(&key));
        assert!(root.contains(&key));
        let decoded = child.unpack(&key).unwrap();
        assert_eq!(decoded, vec![Element::Bytes(b"uid-1".to_vec())]);
    }

    #[test]
    fn range_covers_exactly_the_subspace() {
        let sub = Subspace::from_bytes(b"p").get(Element::Bytes(b"to".to_vec()));
        let (begin, end) = sub.range();
        let inside = sub.pack(&[Element::Int(7)]);
        assert!(begin <= inside && inside < end);
        let sibling = Subspace::from_bytes(b"p")
            .get(Element::Bytes(b"tz".to_vec()))
            .pack(&[Element::Int(7)]);
        assert!(!(begin <= sibling && sibling < end));
    }

    #[test]
    fn unpack_rejects_foreign_keys() {
        let sub = Subspace::from_bytes(b"alpha");
        let err = sub.unpack(b"beta\x01x\x00").unwrap_err();
        assert_eq!(err, TupleError::OutsidePrefix);
    }
}
