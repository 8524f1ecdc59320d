// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// Kind discriminator of an interned AOT cache record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq, Hash))]
pub enum RecordKind {
    ClassLoader,
    Class,
    Method,
    ClassChain,
    WellKnownClasses,
    AotHeader,
}

impl RecordKind {
    pub const ALL: [RecordKind; 6] = [
        RecordKind::ClassLoader,
        RecordKind::Class,
        RecordKind::Method,
        RecordKind::ClassChain,
        RecordKind::WellKnownClasses,
        RecordKind::AotHeader,
    ];

    fn from_tag(tag: u64) -> Option<RecordKind> {
        RecordKind::ALL.get(tag as usize).copied()
    }
}

/// Stable identity of an interned AOT cache record: a `(kind, id)` pair.
/// Ids are dense per kind and never reused within one cache.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq, Hash))]
pub struct RecordId {
    pub kind: RecordKind,
    pub id: u64,
}

impl RecordId {
    pub fn new(kind: RecordKind, id: u64) -> Self {
        Self { kind, id }
    }

    /// Packs the pair into one u64 for "server offsets" mode, where record
    /// ids stand in for shared-class-cache offsets. Kind lives in the top
    /// three bits; ids are capped well below 2^61 in practice.
    pub fn encode(self) -> u64 {
        ((self.kind as u64) << 61) | (self.id & ((1 << 61) - 1))
    }

    pub fn decode(raw: u64) -> Option<Self> {
        let kind = RecordKind::from_tag(raw >> 61)?;
        Some(Self { kind, id: raw & ((1 << 61) - 1) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_round_trips_through_encoding() {
        for kind in RecordKind::ALL {
            let id = RecordId::new(kind, 123_456);
            assert_eq!(RecordId::decode(id.encode()), Some(id));
        }
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        assert_eq!(RecordId::decode(7 << 61), None);
    }
}
