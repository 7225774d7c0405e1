//! Modules compiled into the binary, looked up by name.

use std::collections::BTreeMap;
use std::fmt;

use ofbench_core::TestModule;

use crate::symbols::ModuleSymbols;
use crate::{LoadError, LoadedCode, ModuleLoader};

type Factory = Box<dyn Fn() -> Box<dyn TestModule> + Send + Sync>;

enum Entry {
    Factory(Factory),
    Symbols(ModuleSymbols),
}

/// Built-in modules by name.
#[derive(Default)]
pub struct Catalog {
    entries: BTreeMap<String, Entry>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("modules", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module type. Each load gets a fresh instance.
    pub fn register<F, M>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: TestModule + 'static,
    {
        self.entries.insert(
            name.into(),
            Entry::Factory(Box::new(move || -> Box<dyn TestModule> { Box::new(factory()) })),
        );
        self
    }

    /// Register a module given as a symbol table. Required slots are only
    /// checked when it is loaded.
    pub fn register_symbols(
        &mut self,
        name: impl Into<String>,
        symbols: ModuleSymbols,
    ) -> &mut Self {
        self.entries.insert(name.into(), Entry::Symbols(symbols));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl ModuleLoader for Catalog {
    fn load(&self, reference: &str) -> Result<LoadedCode, LoadError> {
        let entry = self
            .entries
            .get(reference)
            .ok_or_else(|| LoadError::CannotOpen {
                reference: reference.to_owned(),
                reason: "no built-in module by that name".into(),
            })?;

        let module: Box<dyn TestModule> = match entry {
            Entry::Factory(factory) => factory(),
            Entry::Symbols(symbols) => Box::new(symbols.bind(reference)?),
        };
        Ok(LoadedCode::builtin(module))
    }
}
