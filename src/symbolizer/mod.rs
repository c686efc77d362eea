use crate::ksym::KernelSymbols;
use crate::symbols::Demangler;
use std::sync::Arc;

/// A kernel function an address resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSymbol {
    /// Demangled name.
    pub name: String,
    /// Name as it appears in the kernel symbol table.
    pub system_name: Arc<str>,
}

/// Thin adapter over a shared [`KernelSymbols`] table.
///
/// Lookups are not cached here; the table owns its own consistency and refresh policy.
#[derive(Clone)]
pub struct SymbolResolver {
    ksyms: Arc<dyn KernelSymbols>,
    demangler: Demangler,
}

impl SymbolResolver {
    pub fn new(ksyms: Arc<dyn KernelSymbols>) -> Self {
        Self {
            ksyms,
            demangler: Demangler::new(),
        }
    }

    /// Returns `None` when the table does not know the address.
    pub fn resolve(&self, addr: u64) -> Option<KernelSymbol> {
        let system_name = self.ksyms.lookup(addr)?;
        if system_name.is_empty() {
            return None;
        }

        Some(KernelSymbol {
            name: self.demangler.demangle(&system_name),
            system_name,
        })
    }
}
