//! Modules loaded from shared objects.
//!
//! A shared object exports the slots listed in [`SLOT_NAMES`] as unmangled
//! Rust functions with the signatures in [`crate::symbols`]. It must be
//! built with the same toolchain and the same `ofbench-core` as the
//! harness, since the slots use the Rust ABI.

use libloading::Library;

use crate::symbols::{ModuleSymbols, SLOT_NAMES};
use crate::{LoadError, LoadedCode, ModuleLoader};

#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl DylibLoader {
    pub fn new() -> Self {
        Self
    }
}

/// Copy a function pointer out of `library`, if it exports `symbol`.
///
/// # Safety
///
/// `T` must be the exact type of the exported item, and the returned value
/// must not outlive `library`.
unsafe fn lookup<T: Copy>(library: &Library, symbol: &str) -> Option<T> {
    // SAFETY: forwarded to the caller.
    unsafe { library.get::<T>(symbol.as_bytes()) }
        .ok()
        .map(|sym| *sym)
}

impl ModuleLoader for DylibLoader {
    fn load(&self, reference: &str) -> Result<LoadedCode, LoadError> {
        // SAFETY: loading a module runs its initialisers. Module references
        // come from the operator, who vouches for them.
        let library = unsafe { Library::new(reference) }.map_err(|e| LoadError::CannotOpen {
            reference: reference.to_owned(),
            reason: e.to_string(),
        })?;

        // SAFETY: the slot types are the documented module ABI, and the
        // library is kept alive next to the module for the whole process.
        let symbols = unsafe {
            ModuleSymbols {
                name: lookup(&library, SLOT_NAMES[0]),
                start: lookup(&library, SLOT_NAMES[1]),
                init: lookup(&library, SLOT_NAMES[2]),
                get_pcap_filter: lookup(&library, SLOT_NAMES[3]),
                handle_pcap_event: lookup(&library, SLOT_NAMES[4]),
                of_event_packet_in: lookup(&library, SLOT_NAMES[5]),
                of_event_error: lookup(&library, SLOT_NAMES[6]),
                of_event_stats_reply: lookup(&library, SLOT_NAMES[7]),
                of_event_flow_removed: lookup(&library, SLOT_NAMES[8]),
                of_event_port_status: lookup(&library, SLOT_NAMES[9]),
                of_event_echo_request: lookup(&library, SLOT_NAMES[10]),
                of_event_other: lookup(&library, SLOT_NAMES[11]),
                handle_timer_event: lookup(&library, SLOT_NAMES[12]),
            }
        };
        tracing::debug!(reference, bound = ?symbols.bound_slots(), "resolved module symbols");

        let module = symbols.bind(reference)?;
        Ok(LoadedCode {
            module: Box::new(module),
            library: Some(library),
        })
    }
}
