// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::ids::ClassHandle;

/// Half-open range of client addresses known to hold unloaded classes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq))]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One flattened class-hierarchy entry as sent by the client. Sub-class
/// handles are embedded; the invariant is that a sub-class is always loaded
/// before its super-class, so a modification blob referencing a new sub-class
/// carries that sub-class earlier in the same blob.
#[derive(
    Debug, Clone, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub struct ChTableMod {
    pub class: ClassHandle,
    pub flags: u32,
    pub visited_status: u32,
    pub should_not_be_newly_extended: bool,
    pub sub_classes: Vec<ClassHandle>,
}

/// Class-hierarchy data computed during a compilation, shipped back to the
/// client for commit into its own table.
#[derive(
    Debug, Clone, Default, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub struct ChTableCommit {
    pub updated: Vec<ChTableMod>,
}
