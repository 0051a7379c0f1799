//! Per-call-site adaptive caches.
//!
//! Every code unit the engine runs gets a [`CodeProfile`] holding one
//! [`SiteCache`] slot per instruction offset and the back-edge counters used by
//! OSR. A site starts `Unresolved`, is resolved on first execution to the
//! operand kinds or target it observed, and falls back to `Generic` after
//! repeated guard failures. A cache only ever short-circuits work whose result
//! the generic path would produce identically.

use std::rc::Rc;

use smallvec::SmallVec;

use crate::{
    bytecode::CodeUnit,
    function::Function,
    osr::{CompiledLoop, LoopInfo},
    value::Value,
};

/// Guard failures tolerated before a site stops specializing.
pub const MAX_SITE_MISSES: u8 = 4;

/// Resolved operation of one call site.
#[derive(Debug, Clone, Default)]
pub enum SiteCache {
    #[default]
    Unresolved,
    /// Operator site that has seen two `int` operands.
    IntInt,
    /// Operator site that has seen two `float` operands.
    FloatFloat,
    /// `+` or comparison site that has seen two `str` operands.
    StrStr,
    /// Global lookup valid while the namespace keeps this id and version.
    Global { globals_id: u64, version: u64, value: Value },
    /// Host attribute read from a fixed slot while the object keeps this shape.
    Attr { shape: u64, slot: usize },
    /// Call site targeting a function whose arguments need no binding work.
    Call { function: Rc<Function> },
    /// Always take the generic call-out.
    Generic,
}

/// A site slot: the cache plus its miss counter.
#[derive(Debug, Clone, Default)]
pub struct Site {
    pub cache: SiteCache,
    misses: u8,
}

impl Site {
    /// Records a guard failure; degrades to `Generic` once misses pile up.
    ///
    /// Returns true if the site was re-opened for resolution.
    pub fn miss(&mut self) -> bool {
        self.misses = self.misses.saturating_add(1);
        if self.misses >= MAX_SITE_MISSES {
            self.cache = SiteCache::Generic;
            false
        } else {
            self.cache = SiteCache::Unresolved;
            true
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self.cache, SiteCache::Unresolved)
    }
}

/// Profiling state of one code unit, shared by all its activations.
#[derive(Debug)]
pub struct CodeProfile {
    sites: Vec<Site>,
    loops: SmallVec<[LoopInfo; 4]>,
    compiled: SmallVec<[Rc<CompiledLoop>; 2]>,
}

impl CodeProfile {
    #[must_use]
    pub fn new(code: &CodeUnit) -> Self {
        Self {
            sites: vec![Site::default(); code.bytecode().len()],
            loops: SmallVec::new(),
            compiled: SmallVec::new(),
        }
    }

    /// Cache slot of the instruction at `offset`.
    pub fn site(&mut self, offset: usize) -> Option<&mut Site> {
        self.sites.get_mut(offset)
    }

    /// Number of sites that have left the `Unresolved` state.
    #[must_use]
    pub fn resolved_sites(&self) -> usize {
        self.sites.iter().filter(|site| !site.is_unresolved()).count()
    }

    /// Loop record for the back-edge at `back_edge`, created on first use.
    pub fn loop_info(&mut self, header: u32, back_edge: u32) -> &mut LoopInfo {
        let index = match self.loops.iter().position(|info| info.back_edge_offset == back_edge) {
            Some(index) => index,
            None => {
                self.loops.push(LoopInfo::new(header, back_edge));
                self.loops.len() - 1
            }
        };
        &mut self.loops[index]
    }

    pub fn loops(&self) -> &[LoopInfo] {
        &self.loops
    }

    pub fn compiled_loop(&self, header: u32) -> Option<Rc<CompiledLoop>> {
        self.compiled.iter().find(|entry| entry.header() == header).cloned()
    }

    pub fn add_compiled_loop(&mut self, entry: Rc<CompiledLoop>) {
        self.compiled.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_misses_degrade_to_generic() {
        let mut site = Site {
            cache: SiteCache::IntInt,
            ..Site::default()
        };
        for _ in 1..MAX_SITE_MISSES {
            assert!(site.miss());
            assert!(site.is_unresolved());
        }
        assert!(!site.miss());
        assert!(matches!(site.cache, SiteCache::Generic));
    }

    #[test]
    fn loop_records_are_keyed_by_back_edge() {
        let mut builder = crate::bytecode::CodeBuilder::new("f");
        builder.emit_return_none();
        let code = builder.build().unwrap();
        let mut profile = CodeProfile::new(&code);
        profile.loop_info(0, 10).record_iteration(100);
        profile.loop_info(0, 10).record_iteration(100);
        profile.loop_info(4, 20).record_iteration(100);
        assert_eq!(profile.loops().len(), 2);
        assert_eq!(profile.loops()[0].trip_count, 2);
    }
}
