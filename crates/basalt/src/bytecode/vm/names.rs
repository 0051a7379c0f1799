//! Global, attribute and import access.

use super::Frame;
use crate::{
    engine::Engine,
    exception_private::{ExcType, RunError, RunResult},
    inline_cache::SiteCache,
    value::Value,
};

impl Engine {
    /// Globals first, then the runtime's builtins.
    ///
    /// The resolved value is cached per site together with the namespace's
    /// identity and version, so any store to the namespace invalidates it.
    pub(super) fn load_global(&mut self, frame: &Frame, index: usize) -> RunResult<Value> {
        let name = frame.code.name_at(index);
        let (globals_id, version) = (frame.globals.id(), frame.globals.version());

        if self.config.specialize {
            let mut profile = frame.profile.borrow_mut();
            if let Some(site) = profile.site(frame.instr_pc) {
                let cached = match &site.cache {
                    SiteCache::Global {
                        globals_id: id,
                        version: seen,
                        value,
                    } if *id == globals_id && *seen == version => Some(value.clone()),
                    _ => None,
                };
                match cached {
                    Some(value) => {
                        self.stats.cache_hits += 1;
                        return Ok(value);
                    }
                    None if matches!(site.cache, SiteCache::Global { .. }) => {
                        site.miss();
                        self.stats.cache_misses += 1;
                    }
                    None => {}
                }
            }
        }

        let value = frame
            .globals
            .get(name)
            .or_else(|| self.runtime.builtin(name))
            .ok_or_else(|| ExcType::name_error(name))?;

        if self.config.specialize {
            let mut profile = frame.profile.borrow_mut();
            if let Some(site) = profile.site(frame.instr_pc) {
                if site.is_unresolved() {
                    site.cache = SiteCache::Global {
                        globals_id,
                        version,
                        value: value.clone(),
                    };
                    self.stats.resolved_sites += 1;
                }
            }
        }
        Ok(value)
    }

    /// Attribute read; host objects with a stable shape are read by slot.
    pub(super) fn load_attr(&mut self, frame: &Frame, obj: &Value, index: usize) -> RunResult<Value> {
        let name = frame.code.name_at(index);
        if self.config.specialize {
            if let Value::Object(host) = obj {
                if let Some(shape) = host.shape_id() {
                    let mut profile = frame.profile.borrow_mut();
                    if let Some(site) = profile.site(frame.instr_pc) {
                        match site.cache {
                            SiteCache::Attr { shape: seen, slot } if seen == shape => {
                                if let Some(value) = host.read_slot(slot) {
                                    self.stats.cache_hits += 1;
                                    return Ok(value);
                                }
                                site.miss();
                                self.stats.cache_misses += 1;
                            }
                            SiteCache::Unresolved => {
                                if let Some(slot) = host.slot_of(name) {
                                    site.cache = SiteCache::Attr { shape, slot };
                                    self.stats.resolved_sites += 1;
                                    if let Some(value) = host.read_slot(slot) {
                                        return Ok(value);
                                    }
                                }
                            }
                            SiteCache::Generic => {}
                            _ => {
                                site.miss();
                                self.stats.cache_misses += 1;
                            }
                        }
                    }
                }
            }
        }
        self.runtime.get_attr(obj, name)
    }

    /// `from module import name`: a missing attribute is an `ImportError`.
    pub(super) fn import_from(&self, module: &Value, name: &str) -> RunResult<Value> {
        match self.runtime.get_attr(module, name) {
            Err(RunError::Exc(exc)) if exc.exc_type() == ExcType::AttributeError => {
                let module_name = match module {
                    Value::Module(module) => module.name().to_owned(),
                    other => other.type_name().to_owned(),
                };
                Err(ExcType::ImportError.msg(format!("cannot import name '{name}' from '{module_name}'")))
            }
            other => other,
        }
    }
}
