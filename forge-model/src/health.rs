// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// Free-physical-memory bucket attached to every reply. Clients back off
/// when the server reports anything other than `Normal`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq))]
pub enum MemoryState {
    Normal,
    Low,
    VeryLow,
}

/// Active-worker bucket attached to every reply.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq))]
pub enum ThreadState {
    Normal,
    High,
    VeryHigh,
}
