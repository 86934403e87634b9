use std::sync::{Arc, OnceLock};

use rayon::prelude::*;
use shaderinject_scanner::{scan, Pattern};

use crate::image::MemoryRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Unresolved,
    Resolved(usize),
    Failed,
}

/// Shared view of one registered signature. The registry writes the slot exactly once.
#[derive(Debug, Clone)]
pub struct QueryHandle {
    name: Arc<str>,
    slot: Arc<OnceLock<Option<usize>>>,
}

impl QueryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn state(&self) -> QueryState {
        match self.slot.get() {
            None => QueryState::Unresolved,
            Some(Some(address)) => QueryState::Resolved(*address),
            Some(None) => QueryState::Failed,
        }
    }
    pub fn address(&self) -> Option<usize> {
        self.slot.get().copied().flatten()
    }
}

#[derive(Debug)]
struct Query {
    pattern: Pattern,
    handle: QueryHandle,
}

#[derive(Debug, Default)]
pub struct SignatureRegistry {
    pending: Vec<Query>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    pub resolved: usize,
    pub failed: usize,
    pub failed_names: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to resolve {failed} out of {total} signatures: {}", names.join(", "))]
pub struct SignatureError {
    pub failed: usize,
    pub total: usize,
    pub names: Vec<String>,
}

impl ResolutionReport {
    pub fn total(&self) -> usize {
        self.resolved + self.failed
    }
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
    /// For callers that cannot continue with any signature missing.
    pub fn ensure_complete(&self) -> Result<(), SignatureError> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(SignatureError {
                failed: self.failed,
                total: self.total(),
                names: self.failed_names.clone(),
            })
        }
    }
}

impl SignatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<Arc<str>>, pattern: Pattern) -> QueryHandle {
        let handle = QueryHandle {
            name: name.into(),
            slot: Default::default(),
        };
        self.pending.push(Query {
            pattern,
            handle: handle.clone(),
        });
        handle
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Scan `region` for every pending signature in parallel. Each query only writes its
    /// own slot. The pending set is emptied, so a later call only sees new registrations.
    pub fn resolve_all(&mut self, region: &MemoryRegion<'_>) -> ResolutionReport {
        tracing::info!(
            "resolving {} signatures in {:#x}..{:#x}",
            self.pending.len(),
            region.base(),
            region.base() + region.len()
        );

        self.pending.par_iter().for_each(|query| {
            let address = scan(&query.pattern, region.data()).map(|offset| region.base() + offset);
            let _ = query.handle.slot.set(address);
        });

        let mut report = ResolutionReport::default();
        for query in self.pending.drain(..) {
            match query.handle.state() {
                QueryState::Resolved(address) => {
                    tracing::debug!("{} = {address:#x}", query.handle.name());
                    report.resolved += 1;
                }
                _ => {
                    tracing::warn!(
                        "failed to resolve {} ({})",
                        query.handle.name(),
                        query.pattern
                    );
                    report.failed += 1;
                    report.failed_names.push(query.handle.name().to_string());
                }
            }
        }

        tracing::info!(
            "resolved {} of {} signatures",
            report.resolved,
            report.total()
        );
        report
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use shaderinject_scanner::pattern;

    #[test]
    fn test_resolve() {
        let data = b"\x00\x00\x48\x8b\x05\x11\x22\x33\x44\xc3\x90\x90".to_vec();
        let region = MemoryRegion::with_base(0x1000, &data);

        let mut registry = SignatureRegistry::new();
        let found = registry.register("found", pattern!("48 8B 05 ? ? ? ? C3"));
        let missing = registry.register("missing", pattern!("FF FF"));
        let wildcard = registry.register("wildcard", pattern!("?? ??"));
        assert_eq!(QueryState::Unresolved, found.state());

        let report = registry.resolve_all(&region);
        assert_eq!(2, report.resolved);
        assert_eq!(1, report.failed);
        assert_eq!(vec!["missing".to_string()], report.failed_names);
        assert_eq!(0, registry.pending());

        assert_eq!(QueryState::Resolved(0x1002), found.state());
        assert_eq!(Some(0x1002), found.address());
        assert_eq!(QueryState::Failed, missing.state());
        assert_eq!(None, missing.address());
        assert_eq!(Some(0x1000), wildcard.address());

        let err = report.ensure_complete().unwrap_err();
        assert_eq!(3, err.total);
        assert_eq!(
            "failed to resolve 1 out of 3 signatures: missing",
            err.to_string()
        );
    }

    #[test]
    fn test_one_shot() {
        let data = vec![0xAA; 64];
        let region = MemoryRegion::with_base(0, &data);

        let mut registry = SignatureRegistry::new();
        let first = registry.register("first", pattern!("AA AA"));
        assert!(registry.resolve_all(&region).ensure_complete().is_ok());

        // a second pass only scans queries registered since and never rewrites old slots
        let other = MemoryRegion::with_base(0x5000, &data);
        let second = registry.register("second", pattern!("AA"));
        let report = registry.resolve_all(&other);
        assert_eq!(1, report.total());
        assert_eq!(Some(0), first.address());
        assert_eq!(Some(0x5000), second.address());
    }

    #[test]
    fn test_parallel_independent() {
        let mut data = vec![0u8; 1 << 16];
        let mut registry = SignatureRegistry::new();
        let mut expected = vec![];
        for i in 0..64usize {
            let at = i * 1000 + 7;
            let bytes = [0xE8, i as u8, 0x5A, 0xC3];
            data[at..at + 4].copy_from_slice(&bytes);
            let pattern = Pattern::from_bytes(bytes.to_vec()).unwrap();
            expected.push((registry.register(format!("sig{i}"), pattern), at));
        }
        let region = MemoryRegion::with_base(0, &data);
        assert!(registry.resolve_all(&region).is_complete());
        for (handle, at) in expected {
            assert_eq!(Some(at), handle.address(), "{}", handle.name());
        }
    }
}
