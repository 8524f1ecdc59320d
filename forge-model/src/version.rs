// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

/// Wire protocol major version. Bumped on incompatible frame layout changes.
pub const WIRE_MAJOR: u16 = 1;
/// Wire protocol minor version. Bumped when the message inventory grows.
pub const WIRE_MINOR: u16 = 4;

/// Builds the 64-bit version tag carried in every frame header:
/// `major << 48 | minor << 32 | config_hash`. The config hash folds in
/// build-time options that change message payload layouts, so two binaries
/// with the same wire version but different layouts still refuse to talk.
pub const fn wire_version(config_hash: u32) -> u64 {
    ((WIRE_MAJOR as u64) << 48) | ((WIRE_MINOR as u64) << 32) | config_hash as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tag_packs_fields() {
        let tag = wire_version(0xdead_beef);
        assert_eq!(tag >> 48, WIRE_MAJOR as u64);
        assert_eq!((tag >> 32) & 0xffff, WIRE_MINOR as u64);
        assert_eq!(tag & 0xffff_ffff, 0xdead_beef);
    }

    #[test]
    fn config_hash_changes_tag() {
        assert_ne!(wire_version(1), wire_version(2));
    }
}
