//! Runtime instance model and execution engine.
//!
//! A `ModuleInst` owns its non-imported instances through `Rc`, so tearing
//! one down never frees an imported instance that another module still
//! uses. Generated code reaches instances through raw pointers embedded at
//! compile time; the `#[repr(C)]` prefixes below are the fields those
//! pointers dereference and must not be reordered.

use paste::paste;
use std::any::Any;
use std::cell::{Cell, OnceCell, RefCell, UnsafeCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::codeseg::CodeSegment;
use crate::debug_println;
use crate::error::*;
use crate::types::*;

// ---------------- Values ----------------

/// The engine's canonical argument/return representation, independent of
/// any native calling convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

macro_rules! value_accessors {
    ($(($variant:ident, $ty:ident)),+ $(,)?) => {
        paste! {
            $(
                #[inline]
                pub fn [<from_ $ty>](v: $ty) -> Value { Value::$variant(v) }
                #[inline]
                pub fn [<as_ $ty>](self) -> $ty {
                    match self {
                        Value::$variant(v) => v,
                        other => panic!(concat!("expected ", stringify!($ty), " value, got {:?}"), other),
                    }
                }
            )+
        }
    };
}

impl Value {
    value_accessors!((I32, i32), (I64, i64), (F32, f32), (F64, f64));

    #[inline]
    pub fn ty(self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
        }
    }

    /// Raw 8-byte payload as it travels through generated code.
    #[inline]
    pub fn raw_bits(self) -> u64 {
        match self {
            Value::I32(v) => v as u32 as u64,
            Value::I64(v) => v as u64,
            Value::F32(v) => v.to_bits() as u64,
            Value::F64(v) => v.to_bits(),
        }
    }

    /// The zero value of a type, used before initializers run.
    #[inline]
    pub fn zero(ty: ValType) -> Value {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0.0),
            ValType::F64 => Value::F64(0.0),
        }
    }

    #[inline]
    pub fn from_raw_bits(ty: ValType, raw: u64) -> Value {
        match ty {
            ValType::I32 => Value::I32(raw as u32 as i32),
            ValType::I64 => Value::I64(raw as i64),
            ValType::F32 => Value::F32(f32::from_bits(raw as u32)),
            ValType::F64 => Value::F64(f64::from_bits(raw)),
        }
    }
}

// ---------------- Per-thread execution state ----------------

struct ExecState {
    pending_trap: Cell<Option<Trap>>,
    stack_limit: Cell<usize>,
}

thread_local! {
    static EXEC: ExecState = const {
        ExecState { pending_trap: Cell::new(None), stack_limit: Cell::new(0) }
    };
}

#[inline]
pub(crate) fn set_pending_trap(trap: Trap) {
    EXEC.with(|s| {
        // the first trap wins; later ones raised while unwinding are noise
        if s.pending_trap.get().is_none() {
            s.pending_trap.set(Some(trap));
        }
    });
}

#[inline]
pub(crate) fn take_pending_trap() -> Option<Trap> {
    EXEC.with(|s| s.pending_trap.take())
}

#[inline]
pub(crate) fn trap_is_pending() -> bool {
    EXEC.with(|s| s.pending_trap.get().is_some())
}

/// Sets this thread's stack-overflow limit: guest frames may not extend at
/// or below this address. Zero disables the check. Set once by the embedder
/// before the first invocation.
pub fn set_stack_limit(limit: usize) {
    EXEC.with(|s| s.stack_limit.set(limit));
}

/// Convenience wrapper around [`set_stack_limit`]: leaves `bytes` of the
/// current thread stack for guest use and reserves the rest.
pub fn reserve_guest_stack(bytes: usize) {
    let probe = 0u8;
    let here = &probe as *const u8 as usize;
    set_stack_limit(here.saturating_sub(bytes));
}

// ---------------- Helpers called by generated code ----------------

pub(crate) extern "C" fn wajit_raise_trap(code: u32) {
    let trap = Trap::from_code(code).unwrap_or(Trap::Abort);
    debug_println!("generated code raised trap: {}", trap);
    set_pending_trap(trap);
}

pub(crate) extern "C" fn wajit_trap_pending() -> u32 {
    trap_is_pending() as u32
}

pub(crate) extern "C" fn wajit_stack_check() -> u32 {
    let probe = 0u8;
    let sp = &probe as *const u8 as usize;
    let overflow = EXEC.with(|s| {
        let limit = s.stack_limit.get();
        limit != 0 && sp <= limit
    });
    if overflow {
        set_pending_trap(Trap::StackOverflow);
        1
    } else {
        0
    }
}

pub(crate) extern "C" fn wajit_memory_grow(mem: *const MemInst, delta: u32) -> u32 {
    let mem = unsafe { &*mem };
    mem.grow(delta)
}

pub(crate) extern "C" fn wajit_resolve_indirect_call_raw(
    table: *const TableInst,
    expected: *const FuncType,
    idx: u32,
) -> *const FuncInst {
    let (table, expected) = unsafe { (&*table, &*expected) };
    match resolve_indirect_call_ref(table, expected, idx) {
        Ok(func) => func,
        Err(trap) => {
            set_pending_trap(trap);
            std::ptr::null()
        }
    }
}

pub(crate) extern "C" fn wajit_call_host(data: *const HostFuncData, args: *const u64) -> u64 {
    let data = unsafe { &*data };
    let n = data.ty.params.len();
    let mut vals = Vec::with_capacity(n);
    for (i, ty) in data.ty.params.iter().enumerate() {
        vals.push(Value::from_raw_bits(*ty, unsafe { *args.add(i) }));
    }
    // a panicking host function must not unwind into generated frames
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (data.func)(&vals)));
    match outcome {
        Ok(Ok(Some(v))) => v.raw_bits(),
        Ok(Ok(None)) => 0,
        Ok(Err(trap)) => {
            set_pending_trap(trap);
            0
        }
        Err(_) => {
            set_pending_trap(Trap::Abort);
            0
        }
    }
}

// ---------------- Speculation-safe indexing ----------------

/// Forces `index` to zero whenever `index + extent > size`, without a
/// data-dependent branch, so a mis-speculated access cannot read past the
/// array even transiently. Never the sole bounds check; callers still test
/// the range explicitly.
#[inline]
pub fn array_index_nospec(index: usize, extent: usize, size: usize) -> usize {
    let in_bounds = match index.checked_add(extent) {
        // black_box forces the mask to be computed from the sum rather
        // than folded back into a branch
        Some(end) => (std::hint::black_box(end) <= size) as usize,
        None => 0,
    };
    index & in_bounds.wrapping_neg()
}

// ---------------- Function instances ----------------

pub type HostFn = Box<dyn Fn(&[Value]) -> Result<Option<Value>, Trap>>;

pub struct HostFuncData {
    pub(crate) func: HostFn,
    pub(crate) ty: FuncType,
}

impl HostFuncData {
    pub(crate) fn new(func: HostFn, ty: FuncType) -> Self {
        Self { func, ty }
    }
}

/// A callable function: compiled guest code, or a host closure wrapped in a
/// compiled trampoline so the table/indirect-call paths treat both alike.
#[repr(C)]
pub struct FuncInst {
    /// Read at a fixed offset by generated call sequences; must stay first.
    code_ptr: Cell<*const u8>,
    ty: FuncType,
    invoker_ptr: Cell<*const u8>,
    code: RefCell<Option<CodeSegment>>,
    invoker: RefCell<Option<CodeSegment>>,
    host: Option<Box<HostFuncData>>,
    module: OnceCell<Weak<ModuleInst>>,
}

/// Byte offset of the entry pointer inside `FuncInst`, used by generated
/// call sequences.
pub(crate) const FUNCINST_CODE_OFFSET: i32 = 0;

impl FuncInst {
    /// Allocates an empty instance whose code is filled in later; direct
    /// calls to a function may be compiled before the function itself.
    pub(crate) fn shell(ty: FuncType) -> Rc<FuncInst> {
        Rc::new(FuncInst {
            code_ptr: Cell::new(std::ptr::null()),
            ty,
            invoker_ptr: Cell::new(std::ptr::null()),
            code: RefCell::new(None),
            invoker: RefCell::new(None),
            host: None,
            module: OnceCell::new(),
        })
    }

    pub(crate) fn shell_host(ty: FuncType, data: Box<HostFuncData>) -> Rc<FuncInst> {
        Rc::new(FuncInst {
            code_ptr: Cell::new(std::ptr::null()),
            ty,
            invoker_ptr: Cell::new(std::ptr::null()),
            code: RefCell::new(None),
            invoker: RefCell::new(None),
            host: Some(data),
            module: OnceCell::new(),
        })
    }

    pub(crate) fn install_code(&self, segment: CodeSegment) {
        self.code_ptr.set(segment.base());
        *self.code.borrow_mut() = Some(segment);
    }

    pub(crate) fn install_invoker(&self, segment: CodeSegment) {
        self.invoker_ptr.set(segment.base());
        *self.invoker.borrow_mut() = Some(segment);
    }

    pub(crate) fn set_module(&self, module: &Rc<ModuleInst>) {
        let _ = self.module.set(Rc::downgrade(module));
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    pub fn is_host(&self) -> bool {
        self.host.is_some()
    }

    pub fn code_size(&self) -> usize {
        self.code.borrow().as_ref().map(|s| s.len()).unwrap_or(0)
    }

    pub(crate) fn code_entry(&self) -> *const u8 {
        self.code_ptr.get()
    }

    /// The module this function belongs to, if it is guest code and the
    /// module is still alive. Host trampolines use this to find the
    /// caller's memory and globals.
    pub fn module(&self) -> Option<Rc<ModuleInst>> {
        self.module.get().and_then(|w| w.upgrade())
    }
}

// ---------------- Tables ----------------

pub struct TableInst {
    elems: UnsafeCell<Vec<Option<Rc<FuncInst>>>>,
    max: Option<u32>,
}

impl TableInst {
    pub fn new(limits: Limits) -> Rc<TableInst> {
        Rc::new(TableInst {
            elems: UnsafeCell::new(vec![None; limits.min as usize]),
            max: limits.max,
        })
    }

    pub fn len(&self) -> usize {
        unsafe { (*self.elems.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max(&self) -> Option<u32> {
        self.max
    }

    pub fn get(&self, idx: usize) -> Option<Rc<FuncInst>> {
        unsafe { (&(*self.elems.get())).get(idx).cloned().flatten() }
    }

    pub fn set(&self, idx: usize, func: Option<Rc<FuncInst>>) -> Result<(), Trap> {
        let elems = unsafe { &mut *self.elems.get() };
        match elems.get_mut(idx) {
            Some(slot) => {
                *slot = func;
                Ok(())
            }
            None => Err(Trap::TableOverflow),
        }
    }

    /// Grows by `delta` null entries; returns the old length, or `u32::MAX`
    /// when the configured maximum would be exceeded.
    pub fn grow(&self, delta: u32) -> u32 {
        let elems = unsafe { &mut *self.elems.get() };
        let old = elems.len() as u32;
        if delta == 0 {
            return old;
        }
        let new = match old.checked_add(delta) {
            Some(n) => n,
            None => return u32::MAX,
        };
        if self.max.is_some_and(|m| new > m) {
            return u32::MAX;
        }
        elems.resize(new as usize, None);
        old
    }

    fn slot_ref(&self, idx: usize) -> Option<&Option<Rc<FuncInst>>> {
        unsafe { (&(*self.elems.get())).get(idx) }
    }
}

// ---------------- Linear memory ----------------

/// One linear memory. `data`/`size` mirror the backing buffer and sit at
/// fixed offsets (0 and 8) so generated bounds checks and accesses can read
/// them directly; growth rewrites both.
#[repr(C)]
pub struct MemInst {
    data: Cell<*mut u8>,
    size: Cell<usize>,
    buf: UnsafeCell<Vec<u8>>,
    max: Option<u32>,
}

pub(crate) const MEMINST_DATA_OFFSET: i32 = 0;
pub(crate) const MEMINST_SIZE_OFFSET: i32 = 8;

impl MemInst {
    pub fn new(limits: Limits) -> Rc<MemInst> {
        let bytes = limits.min as usize * PAGE_SIZE;
        let mut buf = vec![0u8; bytes];
        Rc::new(MemInst {
            data: Cell::new(buf.as_mut_ptr()),
            size: Cell::new(bytes),
            buf: UnsafeCell::new(buf),
            max: limits.max,
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.size.get()
    }

    pub fn size_pages(&self) -> u32 {
        (self.size.get() / PAGE_SIZE) as u32
    }

    pub fn max_pages(&self) -> Option<u32> {
        self.max
    }

    /// Monotonic growth in whole pages; returns the old page count, or
    /// `u32::MAX` on failure. Never shrinks.
    pub fn grow(&self, delta: u32) -> u32 {
        let old_pages = self.size_pages();
        if delta == 0 {
            return old_pages;
        }
        let new_pages = match old_pages.checked_add(delta) {
            Some(n) => n,
            None => return u32::MAX,
        };
        if new_pages > MAX_PAGES || self.max.is_some_and(|m| new_pages > m) {
            return u32::MAX;
        }
        let buf = unsafe { &mut *self.buf.get() };
        buf.resize(new_pages as usize * PAGE_SIZE, 0);
        self.data.set(buf.as_mut_ptr());
        self.size.set(buf.len());
        old_pages
    }

    /// Copy out of guest memory with a speculation-safe base index; the
    /// explicit range check stays the authoritative bounds check.
    pub fn read_bytes(&self, offset: u32, out: &mut [u8]) -> Result<(), Trap> {
        let size = self.size.get();
        let start = offset as usize;
        let end = start.checked_add(out.len()).ok_or(Trap::MemoryOverflow)?;
        if end > size {
            return Err(Trap::MemoryOverflow);
        }
        let start = array_index_nospec(start, out.len(), size);
        let buf = unsafe { &*self.buf.get() };
        out.copy_from_slice(&buf[start..start + out.len()]);
        Ok(())
    }

    pub fn write_bytes(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let size = self.size.get();
        let start = offset as usize;
        let end = start.checked_add(bytes.len()).ok_or(Trap::MemoryOverflow)?;
        if end > size {
            return Err(Trap::MemoryOverflow);
        }
        let buf = unsafe { &mut *self.buf.get() };
        buf[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

// ---------------- Globals ----------------

/// One global value. The payload sits at offset 0 for direct access from
/// generated `get_global`/`set_global` sequences.
#[repr(C)]
pub struct GlobalInst {
    value: Cell<u64>,
    ty: ValType,
    mutability: Mut,
}

impl GlobalInst {
    pub fn new(value: Value, mutability: Mut) -> Rc<GlobalInst> {
        Rc::new(GlobalInst {
            value: Cell::new(value.raw_bits()),
            ty: value.ty(),
            mutability,
        })
    }

    pub fn ty(&self) -> ValType {
        self.ty
    }

    pub fn mutability(&self) -> Mut {
        self.mutability
    }

    pub fn get(&self) -> Value {
        Value::from_raw_bits(self.ty, self.value.get())
    }

    /// Host-side assignment; immutable globals reject it once module
    /// initialization is over.
    pub fn set(&self, value: Value) -> Result<(), Error> {
        if self.mutability != Mut::Var {
            return validation(GLOBAL_IS_IMMUTABLE);
        }
        if value.ty() != self.ty {
            return validation(TYPE_MISMATCH);
        }
        self.value.set(value.raw_bits());
        Ok(())
    }

    pub(crate) fn init(&self, value: Value) {
        self.value.set(value.raw_bits());
    }
}

// ---------------- Import typechecks ----------------

pub fn typecheck_func(expected: &FuncType, actual: &FuncInst) -> bool {
    type_equal(expected, actual.ty())
}

pub fn typecheck_table(expected: &TableType, actual: &TableInst) -> bool {
    limits_match(&expected.limits, actual.len() as u32, actual.max())
}

pub fn typecheck_memory(expected: &MemoryType, actual: &MemInst) -> bool {
    limits_match(&expected.limits, actual.size_pages(), actual.max_pages())
}

pub fn typecheck_global(expected: &GlobalType, actual: &GlobalInst) -> bool {
    expected.ty == actual.ty() && expected.mutability == actual.mutability()
}

// ---------------- Exports and module instances ----------------

#[derive(Clone)]
pub enum Extern {
    Func(Rc<FuncInst>),
    Table(Rc<TableInst>),
    Mem(Rc<MemInst>),
    Global(Rc<GlobalInst>),
}

impl Extern {
    pub fn kind(&self) -> crate::ast::ExternKind {
        use crate::ast::ExternKind;
        match self {
            Extern::Func(_) => ExternKind::Func,
            Extern::Table(_) => ExternKind::Table,
            Extern::Mem(_) => ExternKind::Mem,
            Extern::Global(_) => ExternKind::Global,
        }
    }
}

pub struct Export {
    pub name: String,
    pub value: Extern,
}

/// Exports offered to an importing module, keyed by item name.
pub type ModuleImports = HashMap<String, Extern>;
/// All import sources, keyed by module name.
pub type Imports = HashMap<String, ModuleImports>;

/// A linked, executable module instance. Imported entries occupy the low
/// indices of each vector.
pub struct ModuleInst {
    pub types: Box<[FuncType]>,
    pub funcs: Vec<Rc<FuncInst>>,
    pub tables: Vec<Rc<TableInst>>,
    pub mems: Vec<Rc<MemInst>>,
    pub globals: Vec<Rc<GlobalInst>>,
    pub exports: Vec<Export>,
    pub n_imported_funcs: usize,
    pub n_imported_tables: usize,
    pub n_imported_mems: usize,
    pub n_imported_globals: usize,
    pub(crate) start: Option<u32>,
    private: RefCell<Option<Box<dyn Any>>>,
}

impl ModuleInst {
    pub(crate) fn assemble(
        types: Box<[FuncType]>,
        funcs: Vec<Rc<FuncInst>>,
        tables: Vec<Rc<TableInst>>,
        mems: Vec<Rc<MemInst>>,
        globals: Vec<Rc<GlobalInst>>,
        exports: Vec<Export>,
        imported: (usize, usize, usize, usize),
        start: Option<u32>,
    ) -> Rc<ModuleInst> {
        let inst = Rc::new(ModuleInst {
            types,
            funcs,
            tables,
            mems,
            globals,
            exports,
            n_imported_funcs: imported.0,
            n_imported_tables: imported.1,
            n_imported_mems: imported.2,
            n_imported_globals: imported.3,
            start,
            private: RefCell::new(None),
        });
        for func in &inst.funcs[inst.n_imported_funcs..] {
            func.set_module(&inst);
        }
        inst
    }

    pub fn get_export(&self, name: &str, kind: crate::ast::ExternKind) -> Option<Extern> {
        self.exports
            .iter()
            .find(|e| e.name == name && e.value.kind() == kind)
            .map(|e| e.value.clone())
    }

    /// The declared start function, to be invoked by the embedder before
    /// any other call into this instance.
    pub fn start_func(&self) -> Option<Rc<FuncInst>> {
        self.start.map(|idx| self.funcs[idx as usize].clone())
    }

    /// Opaque embedder context dropped together with the instance.
    pub fn set_private_data(&self, data: Box<dyn Any>) {
        *self.private.borrow_mut() = Some(data);
    }

    pub fn private_data(&self) -> std::cell::Ref<'_, Option<Box<dyn Any>>> {
        self.private.borrow()
    }
}

// ---------------- Indirect calls ----------------

fn resolve_indirect_call_ref(
    table: &TableInst,
    expected: &FuncType,
    idx: u32,
) -> Result<*const FuncInst, Trap> {
    let len = table.len();
    if idx as usize >= len {
        return Err(Trap::TableOverflow);
    }
    let masked = array_index_nospec(idx as usize, 1, len);
    let slot = table.slot_ref(masked).ok_or(Trap::TableOverflow)?;
    let func = slot.as_ref().ok_or(Trap::UninitializedTableEntry)?;
    if !type_equal(expected, func.ty()) {
        return Err(Trap::MismatchedType);
    }
    Ok(Rc::as_ptr(func))
}

/// Table dispatch with run-time type checking and speculation-safe slot
/// access. Trap order: bounds, then initialization, then type.
pub fn resolve_indirect_call(
    table: &TableInst,
    expected: &FuncType,
    idx: u32,
) -> Result<Rc<FuncInst>, Trap> {
    resolve_indirect_call_ref(table, expected, idx)?;
    // the slot holds the strong reference the raw pointer came from
    Ok(table.get(idx as usize).expect("resolved slot"))
}

// ---------------- Invocation ----------------

/// Invokes a function instance with tagged arguments.
///
/// Argument count and types must match `func.ty()`; that is the embedder's
/// contract, and breaking it is a programming error (panic), not a guest
/// trap. A trap anywhere in the call chain unwinds every generated frame
/// back to this checkpoint and surfaces as `Error::Trap`.
pub fn invoke(func: &FuncInst, args: &[Value]) -> Result<Option<Value>, Error> {
    let ty = func.ty();
    assert_eq!(args.len(), ty.params.len(), "argument count mismatch");
    debug_assert!(
        args.iter().zip(ty.params.iter()).all(|(v, t)| v.ty() == *t),
        "argument type mismatch"
    );

    let invoker = func.invoker_ptr.get();
    assert!(!invoker.is_null(), "function has no compiled invoker");

    let mut raw_args: Vec<u64> = Vec::with_capacity(args.len());
    for arg in args {
        raw_args.push(arg.raw_bits());
    }

    // fresh checkpoint for this top-level call
    let _ = take_pending_trap();

    let entry: extern "C" fn(*const u64) -> u64 = unsafe { std::mem::transmute(invoker) };
    let raw_result = entry(raw_args.as_ptr());

    if let Some(trap) = take_pending_trap() {
        return Err(Error::Trap(trap));
    }
    Ok(ty.result.map(|rt| Value::from_raw_bits(rt, raw_result)))
}
