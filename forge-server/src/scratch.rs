// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::collections::HashMap;

use forge_model::{
    ConstantPoolHandle, FieldAttributes, MethodHandle, ProfileEntry, ResolveKind,
    ResolvedMethodPayload,
};

/// Unresolved answers are tentative: the constant-pool slot may resolve at
/// any moment on the client. They are served this many times before being
/// dropped and re-fetched.
pub const UNRESOLVED_TTL: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolveKey {
    pub constant_pool: ConstantPoolHandle,
    pub cp_index: u32,
    pub kind: ResolveKind,
}

struct TtlEntry<T> {
    value: T,
    /// `None` for settled answers; `Some(n)` counts down tentative ones.
    ttl: Option<u32>,
}

/// Per-compilation scratch caches: tentative answers bound to a
/// single `CompilationTask`, dropped wholesale when the request recycles.
#[derive(Default)]
pub struct ScratchCaches {
    resolved_methods: HashMap<ResolveKey, TtlEntry<Option<ResolvedMethodPayload>>>,
    field_attributes: HashMap<(ConstantPoolHandle, u32, bool), TtlEntry<Option<FieldAttributes>>>,
    profiles: HashMap<(MethodHandle, u32), Option<ProfileEntry>>,
    static_finals: HashMap<u64, Option<u64>>,
}

impl ScratchCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a resolution answer, decrementing the TTL of tentative
    /// entries; an entry whose TTL reaches zero is dropped so the next query
    /// asks the client again.
    pub fn get_resolved_method(&mut self, key: ResolveKey) -> Option<Option<ResolvedMethodPayload>> {
        let entry = self.resolved_methods.get_mut(&key)?;
        match &mut entry.ttl {
            None => Some(entry.value.clone()),
            Some(ttl) => {
                let value = entry.value.clone();
                *ttl = ttl.saturating_sub(1);
                if *ttl == 0 {
                    self.resolved_methods.remove(&key);
                }
                Some(value)
            }
        }
    }

    pub fn put_resolved_method(
        &mut self,
        key: ResolveKey,
        value: Option<ResolvedMethodPayload>,
    ) {
        let tentative = match &value {
            None => true,
            Some(payload) => payload.unresolved_in_cp,
        };
        let ttl = tentative.then_some(UNRESOLVED_TTL);
        self.resolved_methods.insert(key, TtlEntry { value, ttl });
    }

    /// Same TTL discipline as method resolutions: unresolved answers are
    /// served a bounded number of times, then re-asked.
    pub fn get_field_attributes(
        &mut self,
        cp: ConstantPoolHandle,
        cp_index: u32,
        is_static: bool,
    ) -> Option<Option<FieldAttributes>> {
        let key = (cp, cp_index, is_static);
        let entry = self.field_attributes.get_mut(&key)?;
        match &mut entry.ttl {
            None => Some(entry.value),
            Some(ttl) => {
                let value = entry.value;
                *ttl = ttl.saturating_sub(1);
                if *ttl == 0 {
                    self.field_attributes.remove(&key);
                }
                Some(value)
            }
        }
    }

    pub fn put_field_attributes(
        &mut self,
        cp: ConstantPoolHandle,
        cp_index: u32,
        is_static: bool,
        value: Option<FieldAttributes>,
    ) {
        let tentative = match &value {
            None => true,
            Some(attributes) => attributes.unresolved_in_cp,
        };
        let ttl = tentative.then_some(UNRESOLVED_TTL);
        self.field_attributes.insert((cp, cp_index, is_static), TtlEntry { value, ttl });
    }

    pub fn get_profile(&self, method: MethodHandle, bytecode_index: u32) -> Option<Option<ProfileEntry>> {
        self.profiles.get(&(method, bytecode_index)).cloned()
    }

    pub fn put_profile(&mut self, method: MethodHandle, bytecode_index: u32, entry: Option<ProfileEntry>) {
        self.profiles.insert((method, bytecode_index), entry);
    }

    pub fn get_static_final(&self, address: u64) -> Option<Option<u64>> {
        self.static_finals.get(&address).copied()
    }

    pub fn put_static_final(&mut self, address: u64, value: Option<u64>) {
        self.static_finals.insert(address, value);
    }

    pub fn clear(&mut self) {
        self.resolved_methods.clear();
        self.field_attributes.clear();
        self.profiles.clear();
        self.static_finals.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_model::{ClassHandle, MethodHandle};

    fn key() -> ResolveKey {
        ResolveKey {
            constant_pool: ConstantPoolHandle(1),
            cp_index: 3,
            kind: ResolveKind::Virtual,
        }
    }

    fn unresolved_payload() -> ResolvedMethodPayload {
        ResolvedMethodPayload {
            method: MethodHandle(10),
            defining_class: ClassHandle(20),
            vtable_slot: 0,
            unresolved_in_cp: true,
            jitted_entry: 0,
        }
    }

    #[test]
    fn unresolved_entries_expire_after_ttl_queries() {
        let mut scratch = ScratchCaches::new();
        scratch.put_resolved_method(key(), Some(unresolved_payload()));

        for _ in 0..UNRESOLVED_TTL {
            assert!(scratch.get_resolved_method(key()).is_some());
        }
        // TTL exhausted: the cache forgets, forcing a fresh fetch.
        assert!(scratch.get_resolved_method(key()).is_none());
    }

    #[test]
    fn unresolved_field_attributes_expire_like_resolutions() {
        use forge_model::{FieldAttributes, FieldDataType};
        let mut scratch = ScratchCaches::new();
        let attributes = FieldAttributes {
            offset_or_address: 16,
            data_type: FieldDataType::Int32,
            is_volatile: false,
            is_final: false,
            is_private: false,
            unresolved_in_cp: true,
            defining_class: None,
        };
        scratch.put_field_attributes(ConstantPoolHandle(1), 4, false, Some(attributes));

        for _ in 0..UNRESOLVED_TTL {
            assert!(scratch.get_field_attributes(ConstantPoolHandle(1), 4, false).is_some());
        }
        assert!(scratch.get_field_attributes(ConstantPoolHandle(1), 4, false).is_none());
    }

    #[test]
    fn settled_entries_never_expire() {
        let mut scratch = ScratchCaches::new();
        let mut payload = unresolved_payload();
        payload.unresolved_in_cp = false;
        scratch.put_resolved_method(key(), Some(payload));

        for _ in 0..10 {
            assert!(scratch.get_resolved_method(key()).is_some());
        }
    }
}
