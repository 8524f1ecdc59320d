// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use std::collections::{BTreeSet, HashMap};

use forge_model::{ChTableMod, ClassHandle};
use tracing::debug;

/// One mirrored class-hierarchy entry. Sub-classes are a set of handles, not
/// pointers: unloading a class erases its handle from every other entry's
/// sub-class set, so there is never a dangling edge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorEntry {
    pub flags: u32,
    pub visited_status: u32,
    pub should_not_be_newly_extended: bool,
    /// Count of live assumptions against this class. Server-owned: never
    /// overwritten by client modifications.
    pub assumption_refs: u32,
    pub sub_classes: BTreeSet<ClassHandle>,
}

/// Flat mirror of the client's class-hierarchy table.
#[derive(Default)]
pub struct ChTableMirror {
    classes: HashMap<ClassHandle, MirrorEntry>,
    initialized: bool,
}

impl ChTableMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// First-time population from the client's serialized table snapshot.
    pub fn initialize(&mut self, snapshot: &[ChTableMod]) {
        debug_assert!(!self.initialized, "mirror must be empty at initialization");
        self.commit_modifications(snapshot);
        self.initialized = true;
        debug!("[ChTable] initialized with {} classes", self.classes.len());
    }

    /// Applies one critical request's deltas: modifications first, in the
    /// order sent, then removes.
    pub fn apply(&mut self, mods: &[ChTableMod], removes: &[ClassHandle]) {
        if !mods.is_empty() {
            self.commit_modifications(mods);
        }
        if !removes.is_empty() {
            self.commit_removes(removes);
        }
    }

    fn commit_modifications(&mut self, mods: &[ChTableMod]) {
        for m in mods {
            // A class with no mirror yet gets a blank one. A referenced
            // sub-class is always either already present or earlier in this
            // same blob (sub-classes load before their super-class), so no
            // recursive creation happens here.
            let entry = self.classes.entry(m.class).or_default();
            entry.flags = m.flags;
            entry.visited_status = m.visited_status;
            entry.should_not_be_newly_extended = m.should_not_be_newly_extended;
            entry.sub_classes = m.sub_classes.iter().copied().collect();
        }
    }

    fn commit_removes(&mut self, removes: &[ClassHandle]) {
        for class in removes {
            // May have been removed earlier in this same update block.
            self.classes.remove(class);
        }
        for entry in self.classes.values_mut() {
            for class in removes {
                entry.sub_classes.remove(class);
            }
        }
    }

    pub fn find(&self, class: ClassHandle) -> Option<&MirrorEntry> {
        self.classes.get(&class)
    }

    pub fn find_mut(&mut self, class: ClassHandle) -> Option<&mut MirrorEntry> {
        self.classes.get_mut(&class)
    }

    /// Drops the whole mirror; the next request re-initializes from a fresh
    /// client snapshot.
    pub fn clear(&mut self) {
        self.classes.clear();
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(class: u64, subs: &[u64]) -> ChTableMod {
        ChTableMod {
            class: ClassHandle(class),
            flags: 1,
            visited_status: 0,
            should_not_be_newly_extended: false,
            sub_classes: subs.iter().map(|&s| ClassHandle(s)).collect(),
        }
    }

    #[test]
    fn modifications_apply_before_removes() {
        let mut mirror = ChTableMirror::new();
        mirror.initialize(&[m(1, &[]), m(2, &[1])]);

        // One critical request both modifies class 2 and removes class 1.
        mirror.apply(&[m(2, &[1])], &[ClassHandle(1)]);
        assert!(mirror.find(ClassHandle(1)).is_none());
        let two = mirror.find(ClassHandle(2)).unwrap();
        assert!(two.sub_classes.is_empty());
    }

    #[test]
    fn applying_the_same_blob_twice_is_idempotent() {
        let blob = vec![m(10, &[]), m(11, &[10]), m(12, &[10, 11])];

        let mut once = ChTableMirror::new();
        once.initialize(&[]);
        once.apply(&blob, &[]);

        let mut twice = ChTableMirror::new();
        twice.initialize(&[]);
        twice.apply(&blob, &[]);
        twice.apply(&blob, &[]);

        for class in [10, 11, 12] {
            assert_eq!(once.find(ClassHandle(class)), twice.find(ClassHandle(class)));
        }
        assert_eq!(once.len(), twice.len());
    }

    #[test]
    fn assumption_refs_survive_client_modifications() {
        let mut mirror = ChTableMirror::new();
        mirror.initialize(&[m(5, &[])]);
        mirror.find_mut(ClassHandle(5)).unwrap().assumption_refs = 7;

        mirror.apply(&[m(5, &[])], &[]);
        assert_eq!(mirror.find(ClassHandle(5)).unwrap().assumption_refs, 7);
    }

    #[test]
    fn remove_strips_handle_from_all_sub_class_sets() {
        let mut mirror = ChTableMirror::new();
        mirror.initialize(&[m(1, &[]), m(2, &[1]), m(3, &[1])]);

        mirror.apply(&[], &[ClassHandle(1)]);
        assert!(mirror.find(ClassHandle(2)).unwrap().sub_classes.is_empty());
        assert!(mirror.find(ClassHandle(3)).unwrap().sub_classes.is_empty());
    }
}
