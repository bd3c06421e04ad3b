//! The typed, tag-per-slot operand stack.
//!
//! Each slot is `rep.slot_size()` bytes: a tag byte (low 7 bits are the
//! type code, high bit reserved) followed by a 16-byte payload at
//! `tag_size`. Pushes write the tag, pops check it; a mismatch is an
//! engine bug reported as an internal throwable, never a Wasm trap.
//!
//! No bounds checks on push: overflow runs into the mapping's red zone.

use wasmparser::ValType;

use crate::heap::HeapObject;
use crate::stack::mapping::StackMapping;
use crate::trap::Throwable;
use crate::value::{TypeCode, Value, ValueRep};

/// Result alias for operations that can only fail on engine bugs.
pub type StackResult<T> = Result<T, Box<Throwable>>;

/// The value stack of one stack object.
///
/// `#[repr(C)]` with `vsp` first: generated code keeps the live top in
/// the VSP register and spills to/reloads from this field at stack
/// switches, addressing it at a fixed offset.
#[repr(C)]
#[derive(Debug)]
pub struct ValueStack {
    /// Logical top; grows upward.
    vsp: *mut u8,
    base: *mut u8,
    limit: *mut u8,
    rep: ValueRep,
}

impl ValueStack {
    pub(crate) fn new(mapping: &StackMapping, rep: ValueRep) -> ValueStack {
        ValueStack {
            vsp: mapping.value_base(),
            base: mapping.value_base(),
            limit: mapping.value_limit(),
            rep,
        }
    }

    /// Byte offset of the `vsp` field (generated-code ABI).
    pub(crate) fn vsp_offset() -> usize {
        std::mem::offset_of!(ValueStack, vsp)
    }

    #[inline(always)]
    pub fn vsp(&self) -> *mut u8 {
        self.vsp
    }

    #[inline(always)]
    pub(crate) fn set_vsp(&mut self, vsp: *mut u8) {
        debug_assert!(vsp >= self.base && vsp <= self.limit);
        self.vsp = vsp;
    }

    #[inline(always)]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline(always)]
    pub fn rep(&self) -> ValueRep {
        self.rep
    }

    /// Slots currently live.
    pub fn depth(&self) -> usize {
        (self.vsp as usize - self.base as usize) / self.rep.slot_size()
    }

    pub(crate) fn clear(&mut self) {
        self.vsp = self.base;
    }

    // --- Raw slot access ---

    /// Write one slot at `at`. In untagged mode the tag byte is elided.
    #[inline(always)]
    unsafe fn write_slot(&self, at: *mut u8, code: TypeCode, lo: u64, hi: u64) {
        let tag_size = self.rep.tag_size();
        unsafe {
            if self.rep.tagged {
                at.write(code as u8);
            }
            (at.add(tag_size) as *mut u64).write(lo);
            (at.add(tag_size + 8) as *mut u64).write(hi);
        }
    }

    /// Read one slot's payload at `at`.
    #[inline(always)]
    unsafe fn read_payload(&self, at: *const u8) -> (u64, u64) {
        let tag_size = self.rep.tag_size();
        unsafe {
            (
                (at.add(tag_size) as *const u64).read(),
                (at.add(tag_size + 8) as *const u64).read(),
            )
        }
    }

    /// Check a slot's tag against an expected code.
    ///
    /// Only the low 7 bits are significant; the reserved high bit must
    /// be clear. Untagged mode skips the check entirely.
    #[inline(always)]
    unsafe fn check_tag(&self, at: *const u8, expected: TypeCode) -> StackResult<TypeCode> {
        if !self.rep.tagged {
            return Ok(expected);
        }
        let byte = unsafe { at.read() };
        if byte & 0x80 != 0 {
            return Err(Throwable::internal("value slot sets the reserved tag bit"));
        }
        let Some(actual) = TypeCode::from_byte(byte & 0x7F) else {
            return Err(Throwable::internal("value slot holds an unknown type code"));
        };
        if !expected.accepts(actual) {
            return Err(Throwable::internal("value slot tag mismatch"));
        }
        Ok(actual)
    }

    // --- Push ---

    /// Push a value, tagging it with its dynamic type code.
    #[inline(always)]
    pub fn push(&mut self, v: &Value) {
        self.push_with(v.type_code(), v);
    }

    /// Push a value under an explicit type code (e.g. a statically
    /// typed `ref.null`).
    #[inline(always)]
    pub fn push_with(&mut self, code: TypeCode, v: &Value) {
        debug_assert!(
            self.vsp as usize + self.rep.slot_size() <= self.limit as usize,
            "value stack overflow past the red zone"
        );
        let (lo, hi) = v.payload();
        unsafe {
            self.write_slot(self.vsp, code, lo, hi);
            self.vsp = self.vsp.add(self.rep.slot_size());
        }
    }

    /// Push values left to right.
    pub fn push_n(&mut self, values: &[Value]) {
        for v in values {
            self.push(v);
        }
    }

    // --- Pop ---

    /// Pop one slot, checking its tag against `expected`.
    ///
    /// Reference-category expectations accept any reference tag.
    pub fn pop(&mut self, expected: TypeCode) -> StackResult<Value> {
        unsafe {
            self.vsp = self.vsp.sub(self.rep.slot_size());
            let actual = match self.check_tag(self.vsp, expected) {
                Ok(a) => a,
                Err(e) => {
                    // Leave the stack as it was before the failed pop.
                    self.vsp = self.vsp.add(self.rep.slot_size());
                    return Err(e);
                }
            };
            let (lo, hi) = self.read_payload(self.vsp);
            Ok(Value::decode(actual, lo, hi))
        }
    }

    /// Tag-checked u32 pop.
    pub fn pop_u32(&mut self) -> StackResult<u32> {
        match self.pop(TypeCode::I32)? {
            Value::I32(v) => Ok(v as u32),
            _ => Err(Throwable::internal("i32 slot decoded to a non-i32 value")),
        }
    }

    /// Tag-checked u64 pop.
    pub fn pop_u64(&mut self) -> StackResult<u64> {
        match self.pop(TypeCode::I64)? {
            Value::I64(v) => Ok(v as u64),
            _ => Err(Throwable::internal("i64 slot decoded to a non-i64 value")),
        }
    }

    /// Pop any reference-tagged slot: inline i31, null, or object.
    pub fn pop_ref(&mut self) -> StackResult<Value> {
        self.pop(TypeCode::AnyRef)
    }

    /// Inspect the top slot as a reference without popping.
    pub fn peek_ref(&self) -> StackResult<Value> {
        unsafe {
            let at = self.vsp.sub(self.rep.slot_size());
            self.check_tag(at, TypeCode::AnyRef)?;
            let (lo, _) = self.read_payload(at);
            Ok(Value::decode_ref(lo))
        }
    }

    /// Pop one slot per type, right to left, returning the values in
    /// declaration order.
    pub fn pop_n(&mut self, types: &[ValType]) -> StackResult<Vec<Value>> {
        let mut values = Vec::with_capacity(types.len());
        for ty in types.iter().rev() {
            values.push(self.pop(TypeCode::for_valtype(*ty))?);
        }
        values.reverse();
        Ok(values)
    }

    /// Drop the top slot without inspecting it.
    pub fn drop_slot(&mut self) {
        unsafe {
            self.vsp = self.vsp.sub(self.rep.slot_size());
        }
    }

    // --- Typed frame access (locals live on the value stack) ---

    /// Read the typed value of the slot at `slot_ptr`.
    ///
    /// Requires tagged mode: without tags the slot's type is unknown.
    pub fn read_value(&self, slot_ptr: *const u8) -> StackResult<Value> {
        if !self.rep.tagged {
            return Err(Throwable::internal("typed frame access requires tagged slots"));
        }
        unsafe {
            let byte = slot_ptr.read() & 0x7F;
            let Some(code) = TypeCode::from_byte(byte) else {
                return Err(Throwable::internal("value slot holds an unknown type code"));
            };
            let (lo, hi) = self.read_payload(slot_ptr);
            Ok(Value::decode(code, lo, hi))
        }
    }

    /// Overwrite the slot at `slot_ptr` with a non-reference value.
    ///
    /// Reference writes fail until a GC write-barrier story exists.
    pub fn write_value(&mut self, slot_ptr: *mut u8, v: &Value) -> StackResult<()> {
        if !self.rep.tagged {
            return Err(Throwable::internal("typed frame access requires tagged slots"));
        }
        if v.is_ref() {
            return Err(Throwable::internal(
                "unsupported: reference writes through frame access",
            ));
        }
        let (lo, hi) = v.payload();
        unsafe {
            self.write_slot(slot_ptr, v.type_code(), lo, hi);
        }
        Ok(())
    }

    /// Pointer to the slot `n` slots below `vsp`.
    #[inline(always)]
    pub fn slot_below(&self, n: usize) -> *mut u8 {
        unsafe { self.vsp.sub(n * self.rep.slot_size()) }
    }

    // --- GC scan ---

    /// Collect heap-object roots from every live slot.
    ///
    /// A slot is a root only if its tag is a reference code, the
    /// payload is nonzero, and payload bit 0 is clear (inline i31s set
    /// bit 0 and are never scanned).
    pub fn scan_roots(&self) -> Vec<*mut HeapObject> {
        assert!(self.rep.tagged, "GC scan requires tagged slots");
        let mut roots = Vec::new();
        let slot_size = self.rep.slot_size();
        let tag_size = self.rep.tag_size();
        let mut at = self.base;
        while at < self.vsp {
            unsafe {
                let code = TypeCode::from_byte(at.read() & 0x7F);
                let payload = (at.add(tag_size) as *const u64).read();
                if let Some(code) = code {
                    if code.is_ref() && payload != 0 && payload & 1 == 0 {
                        roots.push(payload as usize as *mut HeapObject);
                    }
                }
                at = at.add(slot_size);
            }
        }
        roots
    }

    /// Iterate `(tag_byte, payload_lo)` of every live slot (tests and
    /// invariant checks).
    pub fn slots(&self) -> Vec<(u8, u64)> {
        let slot_size = self.rep.slot_size();
        let tag_size = self.rep.tag_size();
        let mut out = Vec::new();
        let mut at = self.base;
        while at < self.vsp {
            unsafe {
                let tag = if self.rep.tagged { at.read() } else { 0 };
                let lo = (at.add(tag_size) as *const u64).read();
                out.push((tag, lo));
                at = at.add(slot_size);
            }
        }
        out
    }
}
