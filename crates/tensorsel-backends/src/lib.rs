//! Built-in capability descriptors.
//!
//! Each backend kind lives behind a cargo feature. [`register_builtin`] adds
//! the compiled-in sets in a fixed order (vendor, then generic, then host), so
//! priority within every operation kind is reproducible and a disabled
//! backend only removes its own entries.

#[cfg(feature = "generic")]
mod generic;
#[cfg(feature = "host")]
mod host;
mod kernel;
#[cfg(feature = "vendor")]
mod vendor;

use tensorsel::registry;
use tensorsel::{BackendKind, ImplRegistry, KindMask, RegistryBuilder};

pub use kernel::KernelPlan;

/// Registers every compiled-in backend into `builder`, highest priority first.
pub fn register_builtin(builder: &mut RegistryBuilder) {
    #[cfg(feature = "vendor")]
    vendor::register(builder);
    #[cfg(feature = "generic")]
    generic::register(builder);
    #[cfg(feature = "host")]
    host::register(builder);
    log::debug!("registered built-in backends: {}", compiled_kinds());
}

pub fn builtin_registry() -> ImplRegistry {
    let mut builder = RegistryBuilder::new();
    register_builtin(&mut builder);
    builder.freeze()
}

/// Installs the built-in registry as the process-wide one, unless another
/// registry was installed first.
pub fn install_builtin() -> &'static ImplRegistry {
    registry::install_with(register_builtin)
}

/// Backend kinds this build contributes descriptors for.
pub fn compiled_kinds() -> KindMask {
    let mut kinds = KindMask::NONE;
    if cfg!(feature = "vendor") {
        kinds.insert(BackendKind::Vendor);
    }
    if cfg!(feature = "generic") {
        kinds.insert(BackendKind::Generic);
    }
    if cfg!(feature = "host") {
        kinds.insert(BackendKind::Host);
    }
    kinds
}
