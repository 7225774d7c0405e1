//! ofbench-registry: loading and keeping test modules.
//!
//! A module reference is resolved by a [`ModuleLoader`]:
//! - [`Catalog`] for modules compiled into the binary
//! - [`DylibLoader`] for shared objects exporting a symbol table
//!
//! Whatever the source, a loaded module has every capability slot bound:
//! `name` and `start` must come from the module, anything else it leaves
//! out falls back to the default module.
//!
//! ```ignore
//! let mut catalog = Catalog::new();
//! catalog.register("echo_rtt", EchoRtt::default);
//!
//! let mut registry = ModuleRegistry::new();
//! let handle = registry.load(&catalog, "echo_rtt", "count=5")?;
//! let module = registry.checkout(handle);
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

mod catalog;
mod dylib;
pub mod symbols;

use std::fmt;

use libloading::Library;
use ofbench_core::TestModule;

pub use catalog::Catalog;
pub use dylib::DylibLoader;
pub use symbols::{ModuleSymbols, SymbolModule};

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot open module `{reference}`: {reason}")]
    CannotOpen { reference: String, reason: String },
    #[error("module `{reference}` does not provide required symbol `{symbol}`")]
    MissingRequiredSymbol {
        reference: String,
        symbol: &'static str,
    },
}

/// A resolved module and the code object backing it, if any.
pub struct LoadedCode {
    pub module: Box<dyn TestModule>,
    pub library: Option<Library>,
}

impl LoadedCode {
    /// A module with no separate code object.
    pub fn builtin(module: Box<dyn TestModule>) -> Self {
        Self {
            module,
            library: None,
        }
    }
}

impl fmt::Debug for LoadedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedCode")
            .field("module", &self.module.name())
            .field("library", &self.library.is_some())
            .finish()
    }
}

/// Resolves a module reference into code.
pub trait ModuleLoader {
    fn load(&self, reference: &str) -> Result<LoadedCode, LoadError>;
}

/// Split a command-line module reference of the form `module[=args]`.
pub fn split_reference(spec: &str) -> (&str, &str) {
    spec.split_once('=').unwrap_or((spec, ""))
}

/// Identifies a module in a [`ModuleRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle(usize);

impl ModuleHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

const INITIAL_CAPACITY: usize = 4;

struct ModuleEntry {
    name: String,
    reference: String,
    init_args: String,
    /// `None` while the module is checked out for a test run.
    module: Option<Box<dyn TestModule>>,
}

/// Append-only list of loaded modules.
///
/// Loaded code objects are kept until the registry is dropped, after every
/// module that points into them.
#[derive(Default)]
pub struct ModuleRegistry {
    // Field order matters: modules must drop before their libraries.
    entries: Vec<ModuleEntry>,
    libraries: Vec<Library>,
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names().collect::<Vec<_>>())
            .field("libraries", &self.libraries.len())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `reference` through `loader` and register the module.
    ///
    /// Failures are returned to the caller; the registry is left unchanged.
    pub fn load(
        &mut self,
        loader: &dyn ModuleLoader,
        reference: &str,
        init_args: &str,
    ) -> Result<ModuleHandle, LoadError> {
        let LoadedCode { module, library } = loader.load(reference).inspect_err(|e| {
            tracing::warn!(reference, error = %e, "module failed to load");
        })?;

        if self.entries.len() == self.entries.capacity() {
            let grow = self.entries.capacity().max(INITIAL_CAPACITY);
            self.entries.reserve_exact(grow);
        }

        let handle = ModuleHandle(self.entries.len());
        let name = module.name().to_owned();
        tracing::info!(%name, reference, args = init_args, "module loaded");
        self.entries.push(ModuleEntry {
            name,
            reference: reference.to_owned(),
            init_args: init_args.to_owned(),
            module: Some(module),
        });
        if let Some(library) = library {
            self.libraries.push(library);
        }
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Handles in load order.
    pub fn handles(&self) -> impl Iterator<Item = ModuleHandle> {
        (0..self.entries.len()).map(ModuleHandle)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn name(&self, handle: ModuleHandle) -> Option<&str> {
        self.entries.get(handle.0).map(|e| e.name.as_str())
    }

    pub fn reference(&self, handle: ModuleHandle) -> Option<&str> {
        self.entries.get(handle.0).map(|e| e.reference.as_str())
    }

    pub fn init_args(&self, handle: ModuleHandle) -> Option<&str> {
        self.entries.get(handle.0).map(|e| e.init_args.as_str())
    }

    /// Take the module out for a test run. `None` if the handle is unknown
    /// or the module is already checked out.
    pub fn checkout(&mut self, handle: ModuleHandle) -> Option<Box<dyn TestModule>> {
        self.entries.get_mut(handle.0)?.module.take()
    }

    /// Put a module back after its run.
    pub fn checkin(&mut self, handle: ModuleHandle, module: Box<dyn TestModule>) {
        match self.entries.get_mut(handle.0) {
            Some(entry) => {
                if entry.module.replace(module).is_some() {
                    tracing::warn!(name = %entry.name, "module checked in twice");
                }
            }
            None => tracing::warn!(handle = handle.0, "checkin for unknown module"),
        }
    }
}

#[cfg(test)]
mod tests {
    use ofbench_core::{DefaultModule, ExecutionContext, HandlerResult};

    use super::*;

    struct Named(&'static str);

    impl TestModule for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn start(&mut self, _ctx: &mut ExecutionContext) -> HandlerResult {
            Ok(())
        }
    }

    fn catalog() -> Catalog {
        let mut catalog = Catalog::new();
        catalog
            .register("alpha", || Named("alpha"))
            .register("beta", || Named("beta"))
            .register("default", || DefaultModule);
        catalog
    }

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("echo_rtt"), ("echo_rtt", ""));
        assert_eq!(
            split_reference("echo_rtt=count=3 interval_ms=5"),
            ("echo_rtt", "count=3 interval_ms=5")
        );
    }

    #[test]
    fn test_load_records_name_and_args() {
        let mut registry = ModuleRegistry::new();
        let handle = registry.load(&catalog(), "alpha", "x=1").unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.name(handle), Some("alpha"));
        assert_eq!(registry.reference(handle), Some("alpha"));
        assert_eq!(registry.init_args(handle), Some("x=1"));
    }

    #[test]
    fn test_failed_load_leaves_registry_unchanged() {
        let mut registry = ModuleRegistry::new();
        let err = registry.load(&catalog(), "gamma", "").unwrap_err();
        assert!(matches!(err, LoadError::CannotOpen { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_doubles() {
        let catalog = catalog();
        let mut registry = ModuleRegistry::new();
        registry.load(&catalog, "alpha", "").unwrap();
        assert_eq!(registry.capacity(), INITIAL_CAPACITY);

        for _ in 1..INITIAL_CAPACITY {
            registry.load(&catalog, "beta", "").unwrap();
        }
        assert_eq!(registry.capacity(), INITIAL_CAPACITY);

        registry.load(&catalog, "alpha", "").unwrap();
        assert_eq!(registry.capacity(), INITIAL_CAPACITY * 2);
        assert_eq!(registry.handles().count(), INITIAL_CAPACITY + 1);
    }

    #[test]
    fn test_checkout_and_checkin() {
        let mut registry = ModuleRegistry::new();
        let handle = registry.load(&catalog(), "beta", "").unwrap();

        let module = registry.checkout(handle).unwrap();
        assert_eq!(module.name(), "beta");
        assert!(registry.checkout(handle).is_none());

        registry.checkin(handle, module);
        assert!(registry.checkout(handle).is_some());
    }
}
