// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// 64-bit opaque identity of one client VM, stable for its lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
    Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq, Hash))]
pub struct ClientId(pub u64);

impl core::fmt::Display for ClientId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! opaque_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            Serialize, Deserialize, Archive, RkyvSerialize, RkyvDeserialize,
        )]
        #[archive(check_bytes)]
        #[archive_attr(derive(Debug, Clone, Copy, PartialEq, Eq, Hash))]
        pub struct $name(pub u64);

        impl $name {
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

opaque_handle!(
    /// Client-side address of a loaded class. Meaningless to the server except
    /// as a cache key; a handle may be reused by the client after an unload,
    /// which is why unload lists must be applied in order.
    ClassHandle
);
opaque_handle!(
    /// Client-side address of a method body.
    MethodHandle
);
opaque_handle!(
    /// Client-side address of a class loader.
    LoaderHandle
);
opaque_handle!(
    /// Client-side address of a constant pool.
    ConstantPoolHandle
);

impl ClassHandle {
    /// Inserted into an unload list to signal that every session cache must be
    /// cleared (class redefinition via hot-code-replace extensions).
    pub const REDEFINITION_SENTINEL: ClassHandle = ClassHandle(u64::MAX);
}
