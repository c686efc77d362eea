/// Demangler demangles GCC/LLVM C++ and Rust symbol names.
///
/// Mangling encodes each unique function and parameter list combination into a unique name
/// for the linker. Kernel symbols are mostly plain C names, but Rust kernel code and
/// out-of-tree modules still show up mangled in the kernel symbol table.
#[derive(Debug, Default, Clone, Copy)]
pub struct Demangler;

impl Demangler {
    pub fn new() -> Self {
        Self
    }

    /// Returns the human-readable name, or the input when it is not a mangled name.
    pub fn demangle(&self, system_name: &str) -> String {
        if let Ok(demangled) = rustc_demangle::try_demangle(system_name) {
            return format!("{:#}", demangled);
        }

        // Only names carrying the Itanium prefix are C++ mangled.
        if system_name.starts_with("_Z") {
            if let Ok(symbol) = cpp_demangle::Symbol::new(system_name) {
                return symbol.to_string();
            }
        }

        system_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_demangled() {
        let demangler = Demangler::new();
        assert_eq!("do_syscall_64", demangler.demangle("do_syscall_64"));
    }

    #[test]
    fn test_cpp() {
        let demangler = Demangler::new();
        assert_eq!(
            "std::allocator<char>::allocator(std::allocator<char> const&)",
            demangler.demangle("_ZNSaIcEC1ERKS_")
        );
    }

    #[test]
    fn test_rust() {
        let demangler = Demangler::new();
        assert_eq!(
            "collections::slice::<impl [T]>::as_mut_ptr",
            demangler.demangle(
                "_ZN11collections5slice29_$LT$impl$u20$$u5b$T$u5d$$GT$10as_mut_ptr17hf12a6d0409938c96E"
            )
        );
    }
}
