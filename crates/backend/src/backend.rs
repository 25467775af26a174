//! Reference native backend.
//!
//! `compile` verifies and lowers a module, `load` binds every import through
//! the session's resolver and hands out one address per function. Loaded
//! functions run on the interpreter in [`crate::execution`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use lazyjit_core::{
    ExecutorAddr, ExecutorSymbolDef, JitError, LinkResolver, LinkTarget, LoadableCode,
    LoadedObject, NativeBackend, NativeFunction, SymbolBody, SymbolFlags, TargetDescriptor,
};
use lazyjit_ir::{DataLayout, Module};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::compiler::{CompiledModule, ImportKind, compile_module};
use crate::execution::ReferenceFunction;
use crate::host::HostSymbols;

/// Base of the address range used for loaded code.
const CODE_ADDR_BASE: u64 = 0x1000_0000;
/// Address stride between loaded functions.
const CODE_ADDR_STRIDE: u64 = 0x40;

/// Target triple of the machine running this process.
pub fn host_triple() -> String {
    format!("{}-unknown-{}", std::env::consts::ARCH, std::env::consts::OS)
}

/// Reference code generator and loader.
#[derive(Debug)]
pub struct ReferenceBackend {
    target: TargetDescriptor,
    host: HostSymbols,
    next_addr: AtomicU64,
}

impl ReferenceBackend {
    /// Backend for the host target with the standard host functions.
    pub fn new() -> Self {
        Self {
            target: TargetDescriptor {
                triple: host_triple(),
                data_layout: DataLayout::host(),
            },
            host: HostSymbols::standard(),
            next_addr: AtomicU64::new(CODE_ADDR_BASE),
        }
    }

    pub fn with_data_layout(mut self, data_layout: DataLayout) -> Self {
        self.target.data_layout = data_layout;
        self
    }

    /// Replace the host function table.
    pub fn with_host_symbols(mut self, host: HostSymbols) -> Self {
        self.host = host;
        self
    }

    /// Register one more host function.
    pub fn with_host_function<F>(mut self, name: &str, arity: u32, function: F) -> Self
    where
        F: Fn(&[i64]) -> i64 + Send + Sync + 'static,
    {
        self.host.register(name, arity, function);
        self
    }

    fn bind(&self, compiled: &CompiledModule, resolver: &dyn LinkResolver) -> Result<Vec<LinkTarget>, JitError> {
        compiled
            .imports
            .iter()
            .map(|import| {
                let target = resolver.resolve(&import.name)?;
                match (&import.kind, &target) {
                    (ImportKind::Data, LinkTarget::Data(_)) => Ok(target),
                    (ImportKind::Function { argc }, LinkTarget::Function(function))
                        if function.arity() == *argc =>
                    {
                        Ok(target)
                    }
                    (ImportKind::Function { argc }, LinkTarget::Function(function)) => {
                        Err(JitError::compilation_failed(
                            &compiled.name,
                            format!(
                                "`{}` takes {} argument(s) but is called with {argc}",
                                import.name,
                                function.arity()
                            ),
                        ))
                    }
                    (ImportKind::Function { .. }, LinkTarget::Data(_)) => Err(JitError::compilation_failed(
                        &compiled.name,
                        format!("`{}` is data but is called", import.name),
                    )),
                    (ImportKind::Data, LinkTarget::Function(_)) => Err(JitError::compilation_failed(
                        &compiled.name,
                        format!("`{}` is a function but is loaded as data", import.name),
                    )),
                }
            })
            .collect()
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeBackend for ReferenceBackend {
    fn target(&self) -> TargetDescriptor {
        self.target.clone()
    }

    fn compile(&self, module: &Module, target: &TargetDescriptor) -> Result<LoadableCode, JitError> {
        if let Some(layout) = &module.data_layout
            && layout != &target.data_layout
        {
            return Err(JitError::compilation_failed(
                &module.name,
                format!("module layout {layout} does not match target layout {}", target.data_layout),
            ));
        }
        let compiled = compile_module(module)?;
        debug!(
            module = %module.name,
            functions = compiled.functions.len(),
            imports = compiled.imports.len(),
            "Compiled module"
        );
        Ok(LoadableCode::new(module.name.clone(), compiled))
    }

    fn load(
        &self,
        code: LoadableCode,
        resolver: &dyn LinkResolver,
    ) -> Result<Box<dyn LoadedObject>, JitError> {
        let compiled: CompiledModule = code.downcast()?;
        let links: Arc<[LinkTarget]> = self.bind(&compiled, resolver)?.into();

        let mut symbols = FxHashMap::default();
        for function in compiled.functions {
            let addr = ExecutorAddr::new(self.next_addr.fetch_add(CODE_ADDR_STRIDE, Ordering::Relaxed));
            let name = function.name.clone();
            let body: Arc<dyn NativeFunction> =
                Arc::new(ReferenceFunction::new(function, Arc::clone(&links)));
            symbols.insert(
                name,
                ExecutorSymbolDef {
                    addr,
                    flags: SymbolFlags::EXPORTED_FUNCTION,
                    body: SymbolBody::Function(body),
                },
            );
        }
        debug!(module = %compiled.name, symbols = symbols.len(), "Loaded module");
        Ok(Box::new(ReferenceObject {
            module: compiled.name,
            symbols,
            released: AtomicBool::new(false),
        }))
    }

    fn resolve_process_symbol(&self, name: &str) -> Option<ExecutorSymbolDef> {
        self.host.get(name)
    }
}

/// Code of one loaded module.
#[derive(Debug)]
pub struct ReferenceObject {
    module: String,
    symbols: FxHashMap<String, ExecutorSymbolDef>,
    released: AtomicBool,
}

impl LoadedObject for ReferenceObject {
    fn address_of(&self, name: &str) -> Option<ExecutorSymbolDef> {
        if self.released.load(Ordering::Acquire) {
            return None;
        }
        self.symbols.get(name).cloned()
    }

    fn release(&self) -> Result<(), JitError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Err(JitError::trap(&self.module, "object released twice"));
        }
        debug!(module = %self.module, "Released module code");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyjit_ir::{Function, Inst};

    /// Resolves every name to the data value 3, except `twice`.
    struct FixedResolver;

    struct Twice;

    impl NativeFunction for Twice {
        fn invoke(&self, args: &[i64]) -> Result<i64, JitError> {
            Ok(args.first().copied().unwrap_or_default() * 2)
        }

        fn arity(&self) -> u32 {
            1
        }
    }

    impl LinkResolver for FixedResolver {
        fn resolve(&self, name: &str) -> Result<LinkTarget, JitError> {
            match name {
                "twice" => Ok(LinkTarget::Function(Arc::new(Twice))),
                "missing" => Err(JitError::SymbolNotFound(name.to_string())),
                _ => Ok(LinkTarget::Data(3)),
            }
        }
    }

    fn compile_and_load(module: &Module) -> Result<Box<dyn LoadedObject>, JitError> {
        let backend = ReferenceBackend::new();
        let code = backend.compile(module, &backend.target())?;
        backend.load(code, &FixedResolver)
    }

    fn call(object: &dyn LoadedObject, name: &str, args: &[i64]) -> i64 {
        match object.address_of(name).map(|def| def.body) {
            Some(SymbolBody::Function(function)) => function.invoke(args).unwrap(),
            _ => panic!("no function `{name}`"),
        }
    }

    #[test]
    fn loads_and_links() {
        let module = Module::new("m").with_function(Function::define(
            "f",
            0,
            vec![
                Inst::Global("three".to_string()),
                Inst::Call {
                    callee: "twice".to_string(),
                    argc: 1,
                },
                Inst::Ret,
            ],
        ));
        let object = compile_and_load(&module).unwrap();
        assert_eq!(call(object.as_ref(), "f", &[]), 6);
        assert!(object.address_of("g").is_none());
    }

    #[test]
    fn unresolved_import_fails_load() {
        let module = Module::new("m").with_function(Function::define(
            "f",
            0,
            vec![Inst::Global("missing".to_string()), Inst::Ret],
        ));
        assert_eq!(
            compile_and_load(&module).err(),
            Some(JitError::SymbolNotFound("missing".to_string()))
        );
    }

    #[test]
    fn arity_mismatch_fails_load() {
        let module = Module::new("m").with_function(Function::define(
            "f",
            0,
            vec![
                Inst::Const(1),
                Inst::Const(2),
                Inst::Call {
                    callee: "twice".to_string(),
                    argc: 2,
                },
                Inst::Ret,
            ],
        ));
        assert!(matches!(
            compile_and_load(&module),
            Err(JitError::CompilationFailed { .. })
        ));
    }

    #[test]
    fn mismatched_layout_is_rejected() {
        let backend = ReferenceBackend::new();
        let module = Module::new("m").with_data_layout("E-p:64:64".parse().unwrap());
        assert!(backend.compile(&module, &backend.target()).is_err());
    }

    #[test]
    fn release_twice_is_an_error() {
        let module =
            Module::new("m").with_function(Function::define("f", 0, vec![Inst::Const(1), Inst::Ret]));
        let object = compile_and_load(&module).unwrap();
        assert!(object.release().is_ok());
        assert!(object.address_of("f").is_none());
        assert!(matches!(object.release(), Err(JitError::Trap { .. })));
    }

    #[test]
    fn reloading_gets_fresh_addresses() {
        let backend = ReferenceBackend::new();
        let module =
            Module::new("m").with_function(Function::define("f", 0, vec![Inst::Const(1), Inst::Ret]));
        let first = backend.load(backend.compile(&module, &backend.target()).unwrap(), &FixedResolver);
        let second = backend.load(backend.compile(&module, &backend.target()).unwrap(), &FixedResolver);
        assert_ne!(
            first.unwrap().address_of("f").unwrap().addr,
            second.unwrap().address_of("f").unwrap().addr
        );
    }

    #[test]
    fn process_symbols_come_from_host_table() {
        let backend = ReferenceBackend::new().with_host_function("seven", 0, |_| 7);
        assert!(backend.resolve_process_symbol("seven").is_some());
        assert!(backend.resolve_process_symbol("max").is_some());
        assert!(backend.resolve_process_symbol("nope").is_none());
    }
}
