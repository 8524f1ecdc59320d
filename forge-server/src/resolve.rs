// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use forge_model::{
    ClassHandle, ConstantPoolHandle, Message, MessageType, MethodHandle, ResolveKind,
    ResolvedMethodPayload,
};
use forge_transport::StreamError;

use crate::compiler::{CompilationContext, CompileError};
use crate::scratch::ResolveKey;

/// A method the compiler resolved through the client's constant pool.
///
/// Two flavours share one data shape: a `Regular` resolution is used as-is,
/// while a `Relocatable` one additionally left validation records behind so
/// the artifact can be re-validated when loaded from the AOT cache. The
/// capability set below dispatches on the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedMethod {
    Regular(ResolvedMethodPayload),
    Relocatable(ResolvedMethodPayload),
}

impl ResolvedMethod {
    fn payload(&self) -> &ResolvedMethodPayload {
        match self {
            ResolvedMethod::Regular(p) | ResolvedMethod::Relocatable(p) => p,
        }
    }

    pub fn method(&self) -> MethodHandle {
        self.payload().method
    }

    pub fn class_of_method(&self) -> ClassHandle {
        self.payload().defining_class
    }

    pub fn vtable_slot(&self) -> u32 {
        self.payload().vtable_slot
    }

    pub fn is_unresolved_in_cp(&self) -> bool {
        self.payload().unresolved_in_cp
    }

    /// Entry point of an already-jitted body. Relocatable resolutions never
    /// report one: the address is only meaningful after relocation on the
    /// client that loads the artifact.
    pub fn start_address_for_jitted(&self) -> Option<u64> {
        match self {
            ResolvedMethod::Regular(p) if p.jitted_entry != 0 => Some(p.jitted_entry),
            _ => None,
        }
    }

    pub fn is_relocatable(&self) -> bool {
        matches!(self, ResolvedMethod::Relocatable(_))
    }
}

impl<'a> CompilationContext<'a> {
    /// Resolves a constant-pool method reference, consulting the scratch
    /// cache first (tentative answers carry a TTL), then the client.
    ///
    /// In the relocatable flavour every successful resolution also emits a
    /// validation record against the defining class; in server-offsets mode
    /// a record that cannot be built aborts the compilation.
    pub async fn resolve_method(
        &mut self,
        constant_pool: ConstantPoolHandle,
        cp_index: u32,
        kind: ResolveKind,
    ) -> Result<Option<ResolvedMethod>, CompileError> {
        let key = ResolveKey { constant_pool, cp_index, kind };

        let payload = match self.scratch.get_resolved_method(key) {
            Some(cached) => cached,
            None => {
                let fetched = self.fetch_resolution(constant_pool, cp_index, kind).await?;
                self.scratch.put_resolved_method(key, fetched.clone());
                fetched
            }
        };

        let Some(payload) = payload else {
            return Ok(None);
        };

        if !self.is_relocatable() {
            return Ok(Some(ResolvedMethod::Regular(payload)));
        }

        self.emit_validation_record(payload.defining_class)?;
        Ok(Some(ResolvedMethod::Relocatable(payload)))
    }

    async fn fetch_resolution(
        &mut self,
        constant_pool: ConstantPoolHandle,
        cp_index: u32,
        kind: ResolveKind,
    ) -> Result<Option<ResolvedMethodPayload>, CompileError> {
        self.stream
            .write(&Message::MethodResolveFetch { constant_pool, cp_index, kind })
            .await?;
        match self.stream.read().await? {
            Message::MethodResolveReply { resolved } => Ok(resolved),
            other => Err(StreamError::TypeMismatch {
                expected: Some(MessageType::MethodResolveReply),
                actual: other.message_type(),
            }
            .into()),
        }
    }

    /// Validation evidence for one resolution: the AOT class record of the
    /// defining class, folded into the stored method's dependency set.
    fn emit_validation_record(&mut self, defining_class: ClassHandle) -> Result<(), CompileError> {
        let Some(cache) = self.aot_cache.clone() else {
            // Plain relocatable compilation without an AOT cache binding:
            // validation stays offset-based on the client, nothing to emit.
            return Ok(());
        };

        let mut missing_loader_info = false;
        match self.session.class_record(defining_class, &cache, &mut missing_loader_info) {
            Some(record) => {
                if !self.validation_records.contains(&record) {
                    self.validation_records.push(record);
                }
                Ok(())
            }
            None if self.use_server_offsets() => Err(CompileError::AotRecordUnavailable),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(jitted_entry: u64) -> ResolvedMethodPayload {
        ResolvedMethodPayload {
            method: MethodHandle(1),
            defining_class: ClassHandle(2),
            vtable_slot: 6,
            unresolved_in_cp: false,
            jitted_entry,
        }
    }

    #[test]
    fn regular_resolution_reports_jitted_entry() {
        let resolved = ResolvedMethod::Regular(payload(0x4000));
        assert_eq!(resolved.start_address_for_jitted(), Some(0x4000));
        assert_eq!(resolved.class_of_method(), ClassHandle(2));
        assert!(!resolved.is_relocatable());
    }

    #[test]
    fn relocatable_resolution_hides_jitted_entry() {
        let resolved = ResolvedMethod::Relocatable(payload(0x4000));
        assert_eq!(resolved.start_address_for_jitted(), None);
        assert!(resolved.is_relocatable());
    }
}
