//! Kernel symbol resolution seam
//!
//! Symbol table parsing lives outside the engine; the readers only need a
//! lookup from kernel address to name when finalizing a bundle. A production
//! embedder injects its kallsyms-backed implementation here.

/// Resolves kernel addresses to symbol names. Lookups may legitimately fail
/// (heap pointers, module churn); failures mean the address simply stays
/// unnamed in the output.
pub trait SymbolResolver {
    fn lookup(&mut self, addr: u64) -> Option<String>;
}

/// Resolver that knows nothing; every address stays unnamed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSymbolizer;

impl SymbolResolver for NullSymbolizer {
    fn lookup(&mut self, _addr: u64) -> Option<String> {
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::SymbolResolver;
    use std::collections::HashMap;

    /// Fixed-table resolver for tests.
    #[derive(Debug, Default)]
    pub struct FixedSymbolizer {
        pub symbols: HashMap<u64, String>,
    }

    impl FixedSymbolizer {
        pub fn with(entries: &[(u64, &str)]) -> Self {
            FixedSymbolizer {
                symbols: entries.iter().map(|(a, n)| (*a, (*n).to_string())).collect(),
            }
        }
    }

    impl SymbolResolver for FixedSymbolizer {
        fn lookup(&mut self, addr: u64) -> Option<String> {
            self.symbols.get(&addr).cloned()
        }
    }
}
