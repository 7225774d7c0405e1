//! Test modules compiled into the binary.

mod echo_rtt;

use ofbench_registry::Catalog;

pub use echo_rtt::EchoRtt;

/// Catalog of every built-in module.
pub fn builtin_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    catalog.register("echo_rtt", EchoRtt::default);
    catalog
}
