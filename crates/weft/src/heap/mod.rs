//! Wasm GC heap objects: structs and arrays.
//!
//! Objects are allocated behind `Rc` and addressed from value-stack
//! slots as raw payloads. Cells use interior mutability so shared
//! objects can be mutated through any live reference without aliasing
//! `&mut`. The collector itself is external; this module only provides
//! allocation and the layout the scan contract relies on.

use std::cell::Cell;
use std::rc::Rc;

use wasmparser::{StorageType, ValType};

use crate::module::{ArrayDecl, StructDecl};
use crate::value::Value;

/// Arrays longer than this trap with `OOM` at allocation.
pub const MAX_ARRAY_LENGTH: u32 = 1 << 28;

/// A possibly-null reference to a heap object.
///
/// The raw pointer doubles as the slot payload; it must be aligned to
/// at least 2 bytes so bit 0 stays free for inline i31 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRef(*mut HeapObject);

impl HeapRef {
    pub const NULL: HeapRef = HeapRef(std::ptr::null_mut());

    pub fn from_raw(ptr: *mut HeapObject) -> HeapRef {
        debug_assert!(ptr as usize & 1 == 0, "heap object misaligned");
        HeapRef(ptr)
    }

    #[inline(always)]
    pub fn raw(self) -> *mut HeapObject {
        self.0
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Dereference a non-null reference.
    ///
    /// # Safety
    ///
    /// The referent must be kept alive by its owning [`Heap`].
    pub unsafe fn get<'a>(self) -> &'a HeapObject {
        debug_assert!(!self.is_null());
        unsafe { &*self.0 }
    }
}

/// Sign/zero extension mode for packed field reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext {
    /// Plain read; only valid for unpacked fields.
    None,
    Signed,
    Unsigned,
}

/// An allocated GC object: declaration reference plus value cells.
///
/// Cells hold slot payloads (the same encoding as value-stack slots,
/// so references are pointer-or-i31 bits and null is 0). `v128` fields
/// span two cells.
#[derive(Debug)]
pub enum HeapObject {
    Struct {
        decl: Rc<StructDecl>,
        cells: Box<[Cell<u64>]>,
    },
    Array {
        decl: Rc<ArrayDecl>,
        len: u32,
        cells: Box<[Cell<u64>]>,
    },
}

impl HeapObject {
    pub fn array_len(&self) -> u32 {
        match self {
            HeapObject::Array { len, .. } => *len,
            HeapObject::Struct { .. } => 0,
        }
    }
}

/// Number of cells a storage type occupies.
fn storage_cells(ty: StorageType) -> usize {
    match ty {
        StorageType::Val(ValType::V128) => 2,
        _ => 1,
    }
}

/// Cell offset of a struct field.
fn field_cell_offset(decl: &StructDecl, field: u32) -> usize {
    decl.fields[..field as usize]
        .iter()
        .map(|f| storage_cells(f.element_type))
        .sum()
}

fn struct_cell_count(decl: &StructDecl) -> usize {
    decl.fields.iter().map(|f| storage_cells(f.element_type)).sum()
}

/// Read a cell pair as a typed value, applying packed-field extension.
fn load_cells(ty: StorageType, ext: Ext, cells: &[Cell<u64>], at: usize) -> Value {
    let lo = cells[at].get();
    match ty {
        StorageType::I8 => match ext {
            Ext::Signed => Value::I32(lo as u8 as i8 as i32),
            _ => Value::I32(lo as u8 as i32),
        },
        StorageType::I16 => match ext {
            Ext::Signed => Value::I32(lo as u16 as i16 as i32),
            _ => Value::I32(lo as u16 as i32),
        },
        StorageType::Val(ValType::I32) => Value::I32(lo as u32 as i32),
        StorageType::Val(ValType::I64) => Value::I64(lo as i64),
        StorageType::Val(ValType::F32) => Value::F32(f32::from_bits(lo as u32)),
        StorageType::Val(ValType::F64) => Value::F64(f64::from_bits(lo)),
        StorageType::Val(ValType::V128) => {
            let hi = cells[at + 1].get();
            Value::V128((lo as u128) | ((hi as u128) << 64))
        }
        StorageType::Val(ValType::Ref(_)) => Value::decode_ref(lo),
    }
}

/// Store a value into a cell pair, truncating packed fields.
fn store_cells(ty: StorageType, cells: &[Cell<u64>], at: usize, v: &Value) {
    let (lo, hi) = v.payload();
    match ty {
        StorageType::I8 => cells[at].set(lo & 0xFF),
        StorageType::I16 => cells[at].set(lo & 0xFFFF),
        StorageType::Val(ValType::V128) => {
            cells[at].set(lo);
            cells[at + 1].set(hi);
        }
        StorageType::Val(_) => cells[at].set(lo),
    }
}

/// Object registry. Keeps every allocation alive; the external
/// collector decides reclamation at safepoints.
#[derive(Default)]
pub struct Heap {
    objects: Vec<Rc<HeapObject>>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap::default()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn register(&mut self, obj: HeapObject) -> HeapRef {
        let rc = Rc::new(obj);
        let ptr = Rc::as_ptr(&rc) as *mut HeapObject;
        self.objects.push(rc);
        HeapRef::from_raw(ptr)
    }

    /// Allocate a struct with explicit field values, declaration order.
    pub fn alloc_struct(&mut self, decl: &Rc<StructDecl>, values: &[Value]) -> HeapRef {
        debug_assert_eq!(values.len(), decl.fields.len());
        let cells: Box<[Cell<u64>]> =
            (0..struct_cell_count(decl)).map(|_| Cell::new(0)).collect();
        for (i, v) in values.iter().enumerate() {
            let field = &decl.fields[i];
            store_cells(field.element_type, &cells, field_cell_offset(decl, i as u32), v);
        }
        self.register(HeapObject::Struct {
            decl: Rc::clone(decl),
            cells,
        })
    }

    /// Allocate a struct with default (zero/null) fields.
    pub fn alloc_struct_default(&mut self, decl: &Rc<StructDecl>) -> HeapRef {
        let cells: Box<[Cell<u64>]> =
            (0..struct_cell_count(decl)).map(|_| Cell::new(0)).collect();
        self.register(HeapObject::Struct {
            decl: Rc::clone(decl),
            cells,
        })
    }

    /// Allocate an array filled with one element value.
    pub fn alloc_array(&mut self, decl: &Rc<ArrayDecl>, len: u32, fill: &Value) -> HeapRef {
        let stride = storage_cells(decl.elem.element_type);
        let cells: Box<[Cell<u64>]> =
            (0..len as usize * stride).map(|_| Cell::new(0)).collect();
        for i in 0..len as usize {
            store_cells(decl.elem.element_type, &cells, i * stride, fill);
        }
        self.register(HeapObject::Array {
            decl: Rc::clone(decl),
            len,
            cells,
        })
    }

    /// Allocate an array from explicit element values.
    pub fn alloc_array_from(&mut self, decl: &Rc<ArrayDecl>, values: &[Value]) -> HeapRef {
        let stride = storage_cells(decl.elem.element_type);
        let cells: Box<[Cell<u64>]> =
            (0..values.len() * stride).map(|_| Cell::new(0)).collect();
        for (i, v) in values.iter().enumerate() {
            store_cells(decl.elem.element_type, &cells, i * stride, v);
        }
        self.register(HeapObject::Array {
            decl: Rc::clone(decl),
            len: values.len() as u32,
            cells,
        })
    }

    /// Allocate a zero/null-filled array.
    pub fn alloc_array_default(&mut self, decl: &Rc<ArrayDecl>, len: u32) -> HeapRef {
        let stride = storage_cells(decl.elem.element_type);
        let cells: Box<[Cell<u64>]> =
            (0..len as usize * stride).map(|_| Cell::new(0)).collect();
        self.register(HeapObject::Array {
            decl: Rc::clone(decl),
            len,
            cells,
        })
    }
}

/// Read a struct field.
pub fn struct_get(obj: &HeapObject, field: u32, ext: Ext) -> Value {
    match obj {
        HeapObject::Struct { decl, cells } => {
            let fty = decl.fields[field as usize].element_type;
            load_cells(fty, ext, cells, field_cell_offset(decl, field))
        }
        HeapObject::Array { .. } => unreachable!("struct access on array object"),
    }
}

/// Write a struct field.
pub fn struct_set(obj: &HeapObject, field: u32, v: &Value) {
    match obj {
        HeapObject::Struct { decl, cells } => {
            let fty = decl.fields[field as usize].element_type;
            store_cells(fty, cells, field_cell_offset(decl, field), v);
        }
        HeapObject::Array { .. } => unreachable!("struct access on array object"),
    }
}

/// Read an array element. The index must already be bounds-checked.
pub fn array_get(obj: &HeapObject, index: u32, ext: Ext) -> Value {
    match obj {
        HeapObject::Array { decl, cells, len } => {
            debug_assert!(index < *len);
            let stride = storage_cells(decl.elem.element_type);
            load_cells(decl.elem.element_type, ext, cells, index as usize * stride)
        }
        HeapObject::Struct { .. } => unreachable!("array access on struct object"),
    }
}

/// Write an array element. The index must already be bounds-checked.
pub fn array_set(obj: &HeapObject, index: u32, v: &Value) {
    match obj {
        HeapObject::Array { decl, cells, len } => {
            debug_assert!(index < *len);
            let stride = storage_cells(decl.elem.element_type);
            store_cells(decl.elem.element_type, cells, index as usize * stride, v);
        }
        HeapObject::Struct { .. } => unreachable!("array access on struct object"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ArrayDecl, StructDecl};
    use wasmparser::FieldType;

    fn field(ty: StorageType) -> FieldType {
        FieldType {
            element_type: ty,
            mutable: true,
        }
    }

    #[test]
    fn packed_fields_extend_on_read() {
        let decl = Rc::new(StructDecl {
            fields: vec![field(StorageType::I8), field(StorageType::I16)],
        });
        let mut heap = Heap::new();
        let s = heap.alloc_struct(&decl, &[Value::I32(-1), Value::I32(-2)]);
        let obj = unsafe { s.get() };
        assert_eq!(struct_get(obj, 0, Ext::Signed), Value::I32(-1));
        assert_eq!(struct_get(obj, 0, Ext::Unsigned), Value::I32(0xFF));
        assert_eq!(struct_get(obj, 1, Ext::Signed), Value::I32(-2));
        assert_eq!(struct_get(obj, 1, Ext::Unsigned), Value::I32(0xFFFE));
    }

    #[test]
    fn v128_field_spans_two_cells() {
        let decl = Rc::new(StructDecl {
            fields: vec![
                field(StorageType::Val(ValType::V128)),
                field(StorageType::Val(ValType::I32)),
            ],
        });
        let mut heap = Heap::new();
        let v = Value::V128(0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10u128);
        let s = heap.alloc_struct(&decl, &[v, Value::I32(7)]);
        let obj = unsafe { s.get() };
        assert_eq!(struct_get(obj, 0, Ext::None), v);
        assert_eq!(struct_get(obj, 1, Ext::None), Value::I32(7));
    }

    #[test]
    fn ref_fields_round_trip_i31_and_null() {
        let decl = Rc::new(StructDecl {
            fields: vec![field(StorageType::Val(crate::value::anyref()))],
        });
        let mut heap = Heap::new();
        let s = heap.alloc_struct(&decl, &[Value::I31(77)]);
        let obj = unsafe { s.get() };
        assert_eq!(struct_get(obj, 0, Ext::None), Value::I31(77));
        struct_set(obj, 0, &Value::NULL);
        assert_eq!(struct_get(obj, 0, Ext::None), Value::NULL);
    }

    #[test]
    fn array_fill_and_mutate() {
        let decl = Rc::new(ArrayDecl {
            elem: field(StorageType::Val(ValType::I64)),
        });
        let mut heap = Heap::new();
        let a = heap.alloc_array(&decl, 4, &Value::I64(-9));
        let obj = unsafe { a.get() };
        assert_eq!(obj.array_len(), 4);
        for i in 0..4 {
            assert_eq!(array_get(obj, i, Ext::None), Value::I64(-9));
        }
        array_set(obj, 2, &Value::I64(123));
        assert_eq!(array_get(obj, 2, Ext::None), Value::I64(123));
        assert_eq!(array_get(obj, 1, Ext::None), Value::I64(-9));
    }

    #[test]
    fn default_struct_is_zeroed() {
        let decl = Rc::new(StructDecl {
            fields: vec![
                field(StorageType::Val(ValType::I32)),
                field(StorageType::Val(crate::value::anyref())),
            ],
        });
        let mut heap = Heap::new();
        let s = heap.alloc_struct_default(&decl);
        let obj = unsafe { s.get() };
        assert_eq!(struct_get(obj, 0, Ext::None), Value::I32(0));
        assert_eq!(struct_get(obj, 1, Ext::None), Value::NULL);
    }
}
