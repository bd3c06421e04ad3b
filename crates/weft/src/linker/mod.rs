//! Named import registry.
//!
//! The [`Linker`] collects named host functions and resolves them
//! against a module's declared imports during instantiation.

use std::collections::HashMap;
use std::rc::Rc;

use crate::engine::Engine;
use crate::instance::{Instance, Global, Memory, Table};
use crate::module::{Function, HostFunction, Module, WasmFunction};

/// A named import registry that resolves function imports during
/// instantiation.
///
/// # Examples
///
/// ```ignore
/// let mut linker = Linker::new();
/// linker.func(host_fn);
/// let mut instance = linker.instantiate(&engine, &module)?;
/// ```
#[derive(Default)]
pub struct Linker {
    funcs: HashMap<String, Rc<HostFunction>>,
}

impl Linker {
    /// Create an empty linker.
    pub fn new() -> Linker {
        Linker::default()
    }

    /// Register a host function under its own name.
    pub fn func(&mut self, f: Rc<HostFunction>) {
        self.funcs.insert(f.name.clone(), f);
    }

    /// Check whether an import name is already registered.
    pub fn has(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }

    /// Resolve a module's imports and instantiate it.
    ///
    /// For each declared import: look up the name, verify the
    /// signature matches, and place it in the function index space
    /// ahead of the module's own functions. Every local function's
    /// entry code is pointed at the engine's interpreter trampoline.
    pub fn instantiate(
        &self,
        engine: &Engine,
        module: &Rc<Module>,
    ) -> Result<Instance, anyhow::Error> {
        let mut functions = Vec::with_capacity(module.func_count());

        for import in &module.imports {
            let Some(host) = self.funcs.get(&import.name) else {
                anyhow::bail!("import '{}' was not found", import.name);
            };
            anyhow::ensure!(
                *host.sig == *import.sig,
                "import '{}' signature mismatch",
                import.name
            );
            functions.push(Function::Host(Rc::clone(host)));
        }

        for (i, mf) in module.funcs.iter().enumerate() {
            mf.decl.target_code.set(engine.interp_trampoline());
            functions.push(Function::Wasm(Rc::new(WasmFunction {
                name: mf.name.clone(),
                index: (module.imports.len() + i) as u32,
                decl: Rc::clone(&mf.decl),
            })));
        }

        let memories = module
            .memories
            .iter()
            .map(|m| Memory::new(m.min_pages, m.max_pages))
            .collect();
        let tables = module
            .tables
            .iter()
            .map(|t| Table::new(t.ty, t.min, t.max))
            .collect();
        let globals = module
            .globals
            .iter()
            .map(|g| Global {
                ty: g.ty,
                mutable: g.mutable,
                value: g.init,
            })
            .collect();

        Ok(Instance {
            memories,
            tables,
            globals,
            heaptypes: module.heaptypes.clone(),
            data: module.data.clone(),
            elems: module.elems.clone(),
            dropped_data: vec![false; module.data.len()],
            dropped_elems: vec![false; module.elems.len()],
            functions,
            module: Rc::clone(module),
        })
    }
}
