//! Internal keys: user keys extended with a sequence/type tag.
//!
//! The write pipeline stamps each mutation with a monotonically increasing
//! 56-bit sequence number and a value type. The pair is packed into a fixed64
//! tag appended to the user key:
//!
//! ```text
//! +----------+--------------------------------+
//! | user_key | (sequence << 8) | type : u64 LE|
//! +----------+--------------------------------+
//! ```
//!
//! Internal keys order ascending by user key, then *descending* by tag, so
//! the newest version of a key is encountered first.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::coding::{decode_fixed64, put_fixed64};
use crate::comparator::Comparator;

/// Value types tagged onto internal keys. The discriminants are embedded in
/// on-disk structures and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ValueType {
    Deletion = 0,
    Value = 1,
}

impl ValueType {
    pub fn from_u8(tag: u8) -> Option<ValueType> {
        match tag {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }
}

/// When seeking to a (user_key, sequence) pair, the highest-numbered type is
/// used: tags sort descending, so it positions before every entry of that
/// user key at the same sequence.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

pub type SequenceNumber = u64;

/// Sequence numbers occupy 56 bits, leaving room for the type byte.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

pub fn pack_sequence_and_type(sequence: SequenceNumber, value_type: ValueType) -> u64 {
    debug_assert!(sequence <= MAX_SEQUENCE_NUMBER);
    (sequence << 8) | value_type as u64
}

/// An internal key decomposed into its parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
}

/// Appends the serialization of `key` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, key: &ParsedInternalKey) {
    dst.extend_from_slice(key.user_key);
    put_fixed64(dst, pack_sequence_and_type(key.sequence, key.value_type));
}

/// Splits an internal key into its parts. Returns `None` when the trailer is
/// missing or carries an unknown value type.
pub fn parse_internal_key(internal_key: &[u8]) -> Option<ParsedInternalKey> {
    if internal_key.len() < 8 {
        return None;
    }
    let (user_key, tag_bytes) = internal_key.split_at(internal_key.len() - 8);
    let tag = decode_fixed64(tag_bytes);
    let value_type = ValueType::from_u8((tag & 0xff) as u8)?;
    Some(ParsedInternalKey {
        user_key,
        sequence: tag >> 8,
        value_type,
    })
}

/// Returns the user-key portion of an internal key.
///
/// # Panics
///
/// Panics if `internal_key` is shorter than the 8-byte tag.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    assert!(internal_key.len() >= 8);
    &internal_key[..internal_key.len() - 8]
}

/// Orders internal keys: ascending user key per the wrapped comparator, then
/// descending tag so newer entries sort first.
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
        InternalKeyComparator { user_comparator }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user_comparator
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "emberdb.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let order = self
            .user_comparator
            .compare(extract_user_key(a), extract_user_key(b));
        if order != Ordering::Equal {
            return order;
        }
        let atag = decode_fixed64(&a[a.len() - 8..]);
        let btag = decode_fixed64(&b[b.len() - 8..]);
        btag.cmp(&atag)
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user_comparator
            .find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len()
            && self.user_comparator.compare(user_start, &tmp) == Ordering::Less
        {
            // The user key grew logically but shrank physically; tack on the
            // earliest possible tag so the result sorts before both bounds.
            put_fixed64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(start, &tmp), Ordering::Less);
            debug_assert_eq!(self.compare(&tmp, limit), Ordering::Less);
            *start = tmp;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user_comparator.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len()
            && self.user_comparator.compare(user_key, &tmp) == Ordering::Less
        {
            put_fixed64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(key, &tmp), Ordering::Less);
            *key = tmp;
        }
    }
}
