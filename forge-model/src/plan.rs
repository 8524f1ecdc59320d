// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// Optimization level requested by the client, in ascending hotness order.
/// The ordering is load-bearing: AOT cache keys compare levels exactly.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq, Hash))]
pub enum OptLevel {
    Cold,
    Warm,
    Hot,
    VeryHot,
    Scorching,
}

#[derive(
    Debug, Clone, PartialEq, Eq,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
pub struct OptimizationPlan {
    pub opt_level: OptLevel,
    pub insert_instrumentation: bool,
    /// The client asked for the compilation log to be shipped back.
    pub log_compilation: bool,
}

impl OptimizationPlan {
    pub fn cold() -> Self {
        Self {
            opt_level: OptLevel::Cold,
            insert_instrumentation: false,
            log_compilation: false,
        }
    }

    pub fn at(opt_level: OptLevel) -> Self {
        Self {
            opt_level,
            insert_instrumentation: false,
            log_compilation: false,
        }
    }
}
