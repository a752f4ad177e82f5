//! MethodTable Cache - memoized per-type facts
//!
//! One entry per type handle, created zeroed on first lookup. The layout is
//! fetched from the metadata service at most once per entry, failures
//! included; name and GCDesc are filled in lazily the first time someone
//! needs them.

use crate::error::{HeapError, Result};
use crate::object::{ReferenceLayout, TypeHandle};
use crate::stats::CacheStats;
use crate::target::{HeapMetadataService, MethodTableLayout};
use rustc_hash::FxHashMap;
use std::rc::Rc;

/// Cached facts about one type
#[derive(Debug, Clone, Default)]
pub struct MethodTableInfo {
    pub layout: MethodTableLayout,
    pub name: Option<String>,
    /// Decoded GCDesc, `None` until first needed
    pub references: Option<Rc<ReferenceLayout>>,
    queried: bool,
}

impl MethodTableInfo {
    /// Whether `layout` holds real data
    ///
    /// Every valid type has a non-zero base size.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.layout.base_size != 0
    }

    /// Whether the metadata service has been asked about this type
    #[inline]
    pub fn was_queried(&self) -> bool {
        self.queried
    }
}

/// Per-session type cache
#[derive(Debug, Default)]
pub struct MethodTableCache {
    entries: FxHashMap<TypeHandle, MethodTableInfo>,
    queries: u64,
    stats: CacheStats,
}

impl MethodTableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `type_handle`, created empty if missing
    ///
    /// Callers must check [`MethodTableInfo::is_initialized`] before trusting
    /// the layout.
    pub fn lookup(&mut self, type_handle: TypeHandle) -> &mut MethodTableInfo {
        self.entries.entry(type_handle).or_default()
    }

    /// Layout of `type_handle`, querying the metadata service on first use
    ///
    /// A type that cannot be resolved is reported as corruption: the type
    /// handle was readable but does not name a valid type.
    pub fn layout(
        &mut self,
        type_handle: TypeHandle,
        metadata: &dyn HeapMetadataService,
    ) -> Result<MethodTableLayout> {
        let info = self.entries.entry(type_handle).or_default();
        if info.queried {
            self.stats.hits += 1;
        } else {
            info.queried = true;
            self.queries += 1;
            self.stats.misses += 1;
            match metadata.method_table_layout(type_handle) {
                Ok(layout) => info.layout = layout,
                Err(e) => {
                    self.stats.failures += 1;
                    log::debug!("MethodTable {} unresolved: {}", type_handle, e);
                },
            }
        }

        if info.is_initialized() {
            Ok(info.layout)
        } else {
            Err(HeapError::corruption(
                type_handle.address(),
                "type handle does not resolve to a valid MethodTable",
            ))
        }
    }

    /// Type name, cached; unresolvable types get a placeholder
    pub fn name(&mut self, type_handle: TypeHandle, metadata: &dyn HeapMetadataService) -> String {
        let info = self.entries.entry(type_handle).or_default();
        info.name
            .get_or_insert_with(|| {
                metadata
                    .type_name(type_handle)
                    .unwrap_or_else(|_| format!("<unknown type {}>", type_handle))
            })
            .clone()
    }

    /// Decoded GCDesc, produced by `decode` on first use
    ///
    /// Decode failures are not remembered.
    pub fn references(
        &mut self,
        type_handle: TypeHandle,
        decode: impl FnOnce() -> Result<ReferenceLayout>,
    ) -> Result<Rc<ReferenceLayout>> {
        let info = self.entries.entry(type_handle).or_default();
        if let Some(layout) = &info.references {
            return Ok(Rc::clone(layout));
        }
        let layout = Rc::new(decode()?);
        info.references = Some(Rc::clone(&layout));
        Ok(layout)
    }

    /// Layout queries issued to the metadata service so far
    pub fn queries(&self) -> u64 {
        self.queries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Forget every entry
    pub fn invalidate(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::SnapshotBuilder;

    #[test]
    fn test_lookup_starts_uninitialized() {
        let mut cache = MethodTableCache::new();
        let info = cache.lookup(TypeHandle::new(0x1000));
        assert!(!info.is_initialized());
        assert!(!info.was_queried());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_single_query_per_type() {
        let mut builder = SnapshotBuilder::new();
        let th = builder.add_type("Leaf", 24, &[]);
        let snap = builder.build();

        let mut cache = MethodTableCache::new();
        let first = cache.layout(th, &snap).unwrap();
        let second = cache.layout(th, &snap).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.queries(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_failed_query_is_remembered() {
        let snap = SnapshotBuilder::new().build();
        let mut cache = MethodTableCache::new();
        let bogus = TypeHandle::new(0xdead_0000);

        for _ in 0..3 {
            assert!(matches!(
                cache.layout(bogus, &snap),
                Err(HeapError::HeapCorruption { .. })
            ));
        }
        assert_eq!(cache.queries(), 1);
        assert_eq!(cache.stats().failures, 1);
    }

    #[test]
    fn test_name_placeholder_and_cache() {
        let mut builder = SnapshotBuilder::new();
        let th = builder.add_type("App.Order", 24, &[]);
        let snap = builder.build();

        let mut cache = MethodTableCache::new();
        assert_eq!(cache.name(th, &snap), "App.Order");
        assert!(cache.name(TypeHandle::new(0x40), &snap).starts_with("<unknown type"));
    }

    #[test]
    fn test_references_decoded_once() {
        let mut cache = MethodTableCache::new();
        let th = TypeHandle::new(0x1000);
        let mut calls = 0;
        for _ in 0..2 {
            cache
                .references(th, || {
                    calls += 1;
                    Ok(ReferenceLayout::empty())
                })
                .unwrap();
        }
        assert_eq!(calls, 1);

        cache.invalidate();
        assert!(cache.is_empty());
    }
}
