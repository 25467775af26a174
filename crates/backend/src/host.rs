//! Functions provided by the host process.
//!
//! These answer `resolve_process_symbol`: references no loaded module
//! defines fall back to them.

use std::sync::Arc;

use lazyjit_core::{ExecutorAddr, ExecutorSymbolDef, JitError, NativeFunction, SymbolBody, SymbolFlags};
use rustc_hash::FxHashMap;

/// Host function signature.
pub type HostFn = dyn Fn(&[i64]) -> i64 + Send + Sync;

/// A host function with a fixed arity.
pub struct HostFunction {
    name: String,
    arity: u32,
    function: Arc<HostFn>,
}

impl NativeFunction for HostFunction {
    fn invoke(&self, args: &[i64]) -> Result<i64, JitError> {
        if args.len() != usize::try_from(self.arity).unwrap_or(usize::MAX) {
            return Err(JitError::trap(
                &self.name,
                format!("expected {} argument(s), got {}", self.arity, args.len()),
            ));
        }
        Ok((self.function)(args))
    }

    fn arity(&self) -> u32 {
        self.arity
    }
}

/// Base of the address range used for host symbols.
const HOST_ADDR_BASE: u64 = 0x5000_0000;

/// Registry of host functions, keyed by symbol name.
pub struct HostSymbols {
    symbols: FxHashMap<String, ExecutorSymbolDef>,
    next_addr: u64,
}

impl HostSymbols {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            symbols: FxHashMap::default(),
            next_addr: HOST_ADDR_BASE,
        }
    }

    /// `abs`, `min`, `max` and `print_i64`.
    pub fn standard() -> Self {
        let mut host = Self::empty();
        host.register("abs", 1, |args| args.first().copied().unwrap_or_default().wrapping_abs());
        host.register("min", 2, |args| match args {
            [a, b] => *a.min(b),
            _ => 0,
        });
        host.register("max", 2, |args| match args {
            [a, b] => *a.max(b),
            _ => 0,
        });
        host.register("print_i64", 1, |args| {
            let value = args.first().copied().unwrap_or_default();
            println!("{value}");
            value
        });
        host
    }

    /// Add or replace a host function.
    pub fn register<F>(&mut self, name: &str, arity: u32, function: F)
    where
        F: Fn(&[i64]) -> i64 + Send + Sync + 'static,
    {
        let addr = ExecutorAddr::new(self.next_addr);
        self.next_addr = self.next_addr.saturating_add(0x10);
        let body: Arc<dyn NativeFunction> = Arc::new(HostFunction {
            name: name.to_owned(),
            arity,
            function: Arc::new(function),
        });
        self.symbols.insert(
            name.to_owned(),
            ExecutorSymbolDef {
                addr,
                flags: SymbolFlags::EXPORTED_FUNCTION,
                body: SymbolBody::Function(body),
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<ExecutorSymbolDef> {
        self.symbols.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl Default for HostSymbols {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for HostSymbols {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.symbols.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HostSymbols").field("symbols", &names).finish()
    }
}
