//! Module model: signatures, heap-type declarations, function bodies
//! and the programmatic builder.
//!
//! Parsing and validation live outside this crate; bodies arrive as a
//! flat, pre-resolved instruction stream (branch targets are absolute
//! instruction indices) the way the interpreter wants them.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use wasmparser::{FieldType, ValType};

use crate::spc::CompiledCode;
use crate::trap::Throwable;
use crate::value::Value;

/// Function signature.
#[derive(Debug, Clone, PartialEq)]
pub struct SigDecl {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

/// Struct heap-type declaration.
#[derive(Debug)]
pub struct StructDecl {
    pub fields: Vec<FieldType>,
}

/// Array heap-type declaration.
#[derive(Debug)]
pub struct ArrayDecl {
    pub elem: FieldType,
}

/// One entry of the module's heap-type index space.
#[derive(Debug, Clone)]
pub enum HeapTypeDecl {
    Struct(Rc<StructDecl>),
    Array(Rc<ArrayDecl>),
}

/// Flat interpreter instruction. Branch targets are absolute
/// instruction indices within the owning body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Instr {
    Nop,
    Unreachable,
    // Constants.
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    V128Const(u128),
    RefNull,
    // i31.
    RefI31,
    I31GetS,
    I31GetU,
    // Locals and stack shuffling.
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    Drop,
    // Integer arithmetic and comparisons.
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32DivU,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LtU,
    I32LeS,
    I32GtS,
    I32GeS,
    I32Eqz,
    I64Add,
    I64Sub,
    // Memory 0 accesses (static offset added to the popped address).
    I32Load { offset: u32 },
    I32Store { offset: u32 },
    I64Load { offset: u32 },
    I64Store { offset: u32 },
    MemorySize(u32),
    // Control.
    /// Loop header: loop-probe and tier-up site.
    Loop,
    Br(u32),
    BrIf(u32),
    Return,
    Call(u32),
    ReturnCall(u32),
    // Complex operators, dispatched through the runtime.
    MemoryGrow(u32),
    MemoryInit { data: u32, mem: u32 },
    MemoryCopy { dst: u32, src: u32 },
    MemoryFill(u32),
    DataDrop(u32),
    ElemDrop(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    TableGet(u32),
    TableSet(u32),
    TableGrow(u32),
    TableFill(u32),
    TableInit { elem: u32, table: u32 },
    TableCopy { dst: u32, src: u32 },
    StructNew(u32),
    StructNewDefault(u32),
    StructGet { ty: u32, field: u32 },
    StructGetS { ty: u32, field: u32 },
    StructGetU { ty: u32, field: u32 },
    StructSet { ty: u32, field: u32 },
    ArrayNew(u32),
    ArrayNewDefault(u32),
    ArrayNewFixed { ty: u32, len: u32 },
    ArrayNewData { ty: u32, data: u32 },
    ArrayNewElem { ty: u32, elem: u32 },
    ArrayLen,
    ArrayGet(u32),
    ArrayGetS(u32),
    ArrayGetU(u32),
    ArraySet(u32),
    ArrayFill(u32),
    ArrayCopy { dst: u32, src: u32 },
    ArrayInitData { ty: u32, data: u32 },
    ArrayInitElem { ty: u32, elem: u32 },
}

/// A function declaration: signature, extra locals, flat body.
///
/// `target_code` is the entry executed when the enter-func stub
/// dispatches this function: the interpreter trampoline by default, or
/// the compiled entry thunk once tier-up installs one. Generated code
/// reads it at a fixed offset, hence the `#[repr(C)]` prefix.
#[repr(C)]
#[derive(Debug)]
pub struct FuncDecl {
    pub(crate) target_code: Cell<*const u8>,
    pub sig: Rc<SigDecl>,
    /// Locals beyond the parameters, zero-initialized at entry.
    pub locals: Vec<ValType>,
    pub body: Vec<Instr>,
    pub(crate) compiled: RefCell<Option<Rc<CompiledCode>>>,
}

impl FuncDecl {
    pub fn new(sig: Rc<SigDecl>, locals: Vec<ValType>, body: Vec<Instr>) -> FuncDecl {
        FuncDecl {
            target_code: Cell::new(std::ptr::null()),
            sig,
            locals,
            body,
            compiled: RefCell::new(None),
        }
    }

    /// Byte offset of `target_code`, part of the generated-code ABI.
    pub(crate) fn target_code_offset() -> usize {
        std::mem::offset_of!(FuncDecl, target_code)
    }

    pub fn local_count(&self) -> usize {
        self.sig.params.len() + self.locals.len()
    }

    pub fn compiled(&self) -> Option<Rc<CompiledCode>> {
        self.compiled.borrow().clone()
    }
}

/// An instantiated Wasm function.
#[derive(Debug)]
pub struct WasmFunction {
    pub name: String,
    pub index: u32,
    pub decl: Rc<FuncDecl>,
}

/// Result of a host callback.
pub enum HostResult {
    Value0,
    Value1(Value),
    ValueN(Vec<Value>),
    Throw(Box<Throwable>),
    /// Tail-call the target with fresh arguments: host targets loop in
    /// place, Wasm targets are re-dispatched without growing the
    /// native stack.
    TailCall(Function, Vec<Value>),
}

pub type HostFn = Box<dyn FnMut(&[Value]) -> HostResult>;

/// A host function: named callback over dynamic values.
pub struct HostFunction {
    pub name: String,
    pub sig: Rc<SigDecl>,
    pub(crate) callback: RefCell<HostFn>,
}

impl HostFunction {
    pub fn new(
        name: impl Into<String>,
        sig: Rc<SigDecl>,
        callback: impl FnMut(&[Value]) -> HostResult + 'static,
    ) -> Rc<HostFunction> {
        Rc::new(HostFunction {
            name: name.into(),
            sig,
            callback: RefCell::new(Box::new(callback)),
        })
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction").field("name", &self.name).finish()
    }
}

/// Either kind of callable.
#[derive(Debug, Clone)]
pub enum Function {
    Wasm(Rc<WasmFunction>),
    Host(Rc<HostFunction>),
}

impl Function {
    pub fn sig(&self) -> &Rc<SigDecl> {
        match self {
            Function::Wasm(f) => &f.decl.sig,
            Function::Host(f) => &f.sig,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Function::Wasm(f) => &f.name,
            Function::Host(f) => &f.name,
        }
    }
}

/// Linear memory definition, page-granular.
#[derive(Debug, Clone, Copy)]
pub struct MemoryDef {
    pub min_pages: u32,
    pub max_pages: Option<u32>,
}

/// Table definition.
#[derive(Debug, Clone)]
pub struct TableDef {
    pub ty: ValType,
    pub min: u32,
    pub max: Option<u32>,
}

/// Global definition.
#[derive(Debug, Clone)]
pub struct GlobalDef {
    pub ty: ValType,
    pub mutable: bool,
    pub init: Value,
}

/// A declared-but-unresolved function import.
#[derive(Debug, Clone)]
pub struct ImportDecl {
    pub name: String,
    pub sig: Rc<SigDecl>,
}

/// A module function (the local, non-imported part of the index space).
#[derive(Debug)]
pub struct ModuleFunc {
    pub name: String,
    pub decl: Rc<FuncDecl>,
}

/// A complete module, ready for instantiation.
#[derive(Debug, Default)]
pub struct Module {
    pub sigs: Vec<Rc<SigDecl>>,
    pub heaptypes: Vec<HeapTypeDecl>,
    pub imports: Vec<ImportDecl>,
    pub funcs: Vec<ModuleFunc>,
    pub memories: Vec<MemoryDef>,
    pub tables: Vec<TableDef>,
    pub globals: Vec<GlobalDef>,
    /// Passive data segments.
    pub data: Vec<Vec<u8>>,
    /// Passive element segments (reference-group values).
    pub elems: Vec<Vec<Value>>,
}

impl Module {
    /// Total function index space: imports first, then local functions.
    pub fn func_count(&self) -> usize {
        self.imports.len() + self.funcs.len()
    }
}

/// Programmatic module assembly. Replaces the out-of-scope parser.
#[derive(Default)]
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new() -> ModuleBuilder {
        ModuleBuilder::default()
    }

    /// Intern a signature, returning its index.
    pub fn sig(&mut self, params: &[ValType], results: &[ValType]) -> u32 {
        let sig = SigDecl {
            params: params.to_vec(),
            results: results.to_vec(),
        };
        if let Some(i) = self.module.sigs.iter().position(|s| **s == sig) {
            return i as u32;
        }
        self.module.sigs.push(Rc::new(sig));
        (self.module.sigs.len() - 1) as u32
    }

    /// Declare a struct heap type, returning its heap-type index.
    pub fn struct_type(&mut self, fields: &[FieldType]) -> u32 {
        self.module.heaptypes.push(HeapTypeDecl::Struct(Rc::new(StructDecl {
            fields: fields.to_vec(),
        })));
        (self.module.heaptypes.len() - 1) as u32
    }

    /// Declare an array heap type, returning its heap-type index.
    pub fn array_type(&mut self, elem: FieldType) -> u32 {
        self.module.heaptypes.push(HeapTypeDecl::Array(Rc::new(ArrayDecl { elem })));
        (self.module.heaptypes.len() - 1) as u32
    }

    /// Declare a function import. Imports occupy the low end of the
    /// function index space, so all imports must precede `func` calls.
    pub fn import(&mut self, name: impl Into<String>, sig: u32) -> u32 {
        assert!(
            self.module.funcs.is_empty(),
            "imports must be declared before local functions"
        );
        let sig = Rc::clone(&self.module.sigs[sig as usize]);
        self.module.imports.push(ImportDecl {
            name: name.into(),
            sig,
        });
        (self.module.imports.len() - 1) as u32
    }

    /// Define a function, returning its function index.
    pub fn func(
        &mut self,
        name: impl Into<String>,
        sig: u32,
        locals: &[ValType],
        body: Vec<Instr>,
    ) -> u32 {
        let sig = Rc::clone(&self.module.sigs[sig as usize]);
        let decl = Rc::new(FuncDecl::new(sig, locals.to_vec(), body));
        self.module.funcs.push(ModuleFunc {
            name: name.into(),
            decl,
        });
        (self.module.imports.len() + self.module.funcs.len() - 1) as u32
    }

    pub fn memory(&mut self, min_pages: u32, max_pages: Option<u32>) -> u32 {
        self.module.memories.push(MemoryDef { min_pages, max_pages });
        (self.module.memories.len() - 1) as u32
    }

    pub fn table(&mut self, ty: ValType, min: u32, max: Option<u32>) -> u32 {
        self.module.tables.push(TableDef { ty, min, max });
        (self.module.tables.len() - 1) as u32
    }

    pub fn global(&mut self, ty: ValType, mutable: bool, init: Value) -> u32 {
        self.module.globals.push(GlobalDef { ty, mutable, init });
        (self.module.globals.len() - 1) as u32
    }

    /// Add a passive data segment.
    pub fn data(&mut self, bytes: &[u8]) -> u32 {
        self.module.data.push(bytes.to_vec());
        (self.module.data.len() - 1) as u32
    }

    /// Add a passive element segment.
    pub fn elem(&mut self, values: Vec<Value>) -> u32 {
        self.module.elems.push(values);
        (self.module.elems.len() - 1) as u32
    }

    pub fn finish(self) -> Rc<Module> {
        Rc::new(self.module)
    }
}
