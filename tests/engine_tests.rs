//! End-to-end tests against the public embedding API: encode a binary
//! module, instantiate it (which JIT-compiles every body), and drive the
//! compiled code through `invoke`.

use std::cell::Cell;
use std::rc::Rc;

use wajit::{
    host_func, instantiate, instantiate_with_options, invoke, load_module, run_start,
    CompileOptions, Error, Extern, FuncType, Imports, ModuleImports, Trap, ValType, Value,
};

// ---------------- tiny binary-module builder ----------------

const I32: u8 = 0x7f;
const I64: u8 = 0x7e;
const F32: u8 = 0x7d;
const F64: u8 = 0x7c;
const VOID: Option<u8> = None;

fn leb(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

fn sleb(mut v: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

fn name(s: &str) -> Vec<u8> {
    let mut out = leb(s.len() as u64);
    out.extend_from_slice(s.as_bytes());
    out
}

fn cat(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in parts {
        out.extend_from_slice(p);
    }
    out
}

#[derive(Default)]
struct ModuleBuilder {
    types: Vec<Vec<u8>>,
    imports: Vec<Vec<u8>>,
    n_imported_funcs: u32,
    functions: Vec<u32>,
    table: Option<Vec<u8>>,
    memory: Option<Vec<u8>>,
    globals: Vec<Vec<u8>>,
    exports: Vec<Vec<u8>>,
    start: Option<u32>,
    elements: Vec<Vec<u8>>,
    code: Vec<Vec<u8>>,
    data: Vec<Vec<u8>>,
}

impl ModuleBuilder {
    fn new() -> Self {
        Self::default()
    }

    fn ty(&mut self, params: &[u8], result: Option<u8>) -> u32 {
        let mut entry = vec![0x60];
        entry.extend(leb(params.len() as u64));
        entry.extend_from_slice(params);
        match result {
            Some(r) => {
                entry.push(1);
                entry.push(r);
            }
            None => entry.push(0),
        }
        self.types.push(entry);
        self.types.len() as u32 - 1
    }

    fn import_func(&mut self, module: &str, field: &str, typeidx: u32) {
        let entry = cat(&[&name(module), &name(field), &[0x00], &leb(typeidx as u64)]);
        self.imports.push(entry);
        self.n_imported_funcs += 1;
    }

    fn import_memory(&mut self, module: &str, field: &str, min: u32, max: Option<u32>) {
        let entry = cat(&[&name(module), &name(field), &[0x02], &limits(min, max)]);
        self.imports.push(entry);
    }

    /// Declares a defined function; returns its index in the function
    /// index space (imports included). Locals are (count, valtype) runs.
    fn func(&mut self, typeidx: u32, locals: &[(u32, u8)], body: &[u8]) -> u32 {
        self.functions.push(typeidx);
        let mut decls = leb(locals.len() as u64);
        for (count, ty) in locals {
            decls.extend(leb(*count as u64));
            decls.push(*ty);
        }
        let content = cat(&[&decls, body, &[0x0b]]);
        let mut entry = leb(content.len() as u64);
        entry.extend(content);
        self.code.push(entry);
        self.n_imported_funcs + self.code.len() as u32 - 1
    }

    fn table(&mut self, min: u32, max: Option<u32>) {
        self.table = Some(cat(&[&[0x70], &limits(min, max)]));
    }

    fn memory(&mut self, min: u32, max: Option<u32>) {
        self.memory = Some(limits(min, max));
    }

    fn global(&mut self, ty: u8, mutable: bool, init: &[u8]) -> u32 {
        self.globals.push(cat(&[&[ty, mutable as u8], init, &[0x0b]]));
        self.globals.len() as u32 - 1
    }

    fn export(&mut self, export_name: &str, kind: u8, idx: u32) {
        self.exports.push(cat(&[&name(export_name), &[kind], &leb(idx as u64)]));
    }

    fn export_func(&mut self, export_name: &str, idx: u32) {
        self.export(export_name, 0, idx);
    }

    fn elem(&mut self, offset_expr: &[u8], funcidxs: &[u32]) {
        let mut entry = cat(&[&leb(0), offset_expr, &[0x0b], &leb(funcidxs.len() as u64)]);
        for idx in funcidxs {
            entry.extend(leb(*idx as u64));
        }
        self.elements.push(entry);
    }

    fn data(&mut self, offset_expr: &[u8], bytes: &[u8]) {
        self.data.push(cat(&[
            &leb(0),
            offset_expr,
            &[0x0b],
            &leb(bytes.len() as u64),
            bytes,
        ]));
    }

    fn build(&self) -> Vec<u8> {
        fn section(out: &mut Vec<u8>, id: u8, entries: &[Vec<u8>]) {
            if entries.is_empty() {
                return;
            }
            let mut payload = leb(entries.len() as u64);
            for e in entries {
                payload.extend_from_slice(e);
            }
            out.push(id);
            out.extend(leb(payload.len() as u64));
            out.extend(payload);
        }

        let mut out = b"\0asm\x01\0\0\0".to_vec();
        section(&mut out, 1, &self.types);
        section(&mut out, 2, &self.imports);
        if !self.functions.is_empty() {
            let entries: Vec<Vec<u8>> =
                self.functions.iter().map(|t| leb(*t as u64)).collect();
            section(&mut out, 3, &entries);
        }
        if let Some(t) = &self.table {
            section(&mut out, 4, std::slice::from_ref(t));
        }
        if let Some(m) = &self.memory {
            section(&mut out, 5, std::slice::from_ref(m));
        }
        section(&mut out, 6, &self.globals);
        section(&mut out, 7, &self.exports);
        if let Some(start) = self.start {
            out.push(8);
            let payload = leb(start as u64);
            out.extend(leb(payload.len() as u64));
            out.extend(payload);
        }
        section(&mut out, 9, &self.elements);
        section(&mut out, 10, &self.code);
        section(&mut out, 11, &self.data);
        out
    }
}

fn limits(min: u32, max: Option<u32>) -> Vec<u8> {
    match max {
        Some(max) => cat(&[&[1], &leb(min as u64), &leb(max as u64)]),
        None => cat(&[&[0], &leb(min as u64)]),
    }
}

// opcode shorthands
fn i32c(v: i32) -> Vec<u8> {
    cat(&[&[0x41], &sleb(v as i64)])
}
fn f64c(v: f64) -> Vec<u8> {
    cat(&[&[0x44], &v.to_le_bytes()])
}
fn local(i: u32) -> Vec<u8> {
    cat(&[&[0x20], &leb(i as u64)])
}
fn set_local(i: u32) -> Vec<u8> {
    cat(&[&[0x21], &leb(i as u64)])
}
fn call(f: u32) -> Vec<u8> {
    cat(&[&[0x10], &leb(f as u64)])
}

fn instantiate_bytes(bytes: &[u8]) -> Rc<wajit::ModuleInst> {
    let module = load_module(bytes).expect("module should decode and validate");
    instantiate(&module, &Imports::new()).expect("instantiation should succeed")
}

fn invoke_export(inst: &wajit::ModuleInst, name: &str, args: &[Value]) -> Result<Option<Value>, Error> {
    match inst.get_export(name, wajit::ast::ExternKind::Func) {
        Some(Extern::Func(f)) => invoke(&f, args),
        _ => panic!("missing function export {}", name),
    }
}

// ---------------- tests ----------------

#[test]
fn add_two_numbers() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[I32, I32], Some(I32));
    let add = b.func(ty, &[], &cat(&[&local(0), &local(1), &[0x6a]]));
    b.export_func("add", add);
    let inst = instantiate_bytes(&b.build());
    let out = invoke_export(&inst, "add", &[Value::I32(40), Value::I32(2)]).unwrap();
    assert_eq!(out, Some(Value::I32(42)));
    let out = invoke_export(&inst, "add", &[Value::I32(-1), Value::I32(1)]).unwrap();
    assert_eq!(out, Some(Value::I32(0)));
}

#[test]
fn round_trip_host_import() {
    // one imported i32 -> i32 function, one defined function that calls it
    // and adds 1; the host doubles; invoking with 3 yields 7
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[I32], Some(I32));
    b.import_func("env", "double", ty);
    let wrapper = b.func(ty, &[], &cat(&[&local(0), &call(0), &i32c(1), &[0x6a]]));
    b.export_func("double_plus_one", wrapper);

    let module = load_module(&b.build()).unwrap();
    let double = host_func(FuncType::new(vec![ValType::I32], Some(ValType::I32)), |args| {
        Ok(Some(Value::I32(args[0].as_i32() * 2)))
    })
    .unwrap();
    let mut env = ModuleImports::new();
    env.insert("double".to_string(), Extern::Func(double));
    let mut imports = Imports::new();
    imports.insert("env".to_string(), env);

    let inst = instantiate(&module, &imports).unwrap();
    let out = invoke_export(&inst, "double_plus_one", &[Value::I32(3)]).unwrap();
    assert_eq!(out, Some(Value::I32(7)));
}

#[test]
fn factorial_loop() {
    // local 1 = acc = 1; loop { if n <= 1 break; acc *= n; n -= 1 }
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[I32], Some(I32));
    let body = cat(&[
        &i32c(1),
        &set_local(1),
        &[0x02, 0x40], // block
        &[0x03, 0x40], // loop
        &local(0),
        &i32c(1),
        &[0x4c], // i32.le_s
        &[0x0d, 0x01], // br_if 1 (exit block)
        &local(1),
        &local(0),
        &[0x6c], // i32.mul
        &set_local(1),
        &local(0),
        &i32c(1),
        &[0x6b], // i32.sub
        &set_local(0),
        &[0x0c, 0x00], // br 0 (continue loop)
        &[0x0b],       // end loop
        &[0x0b],       // end block
        &local(1),
    ]);
    let fac = b.func(ty, &[(1, I32)], &body);
    b.export_func("fac", fac);
    let inst = instantiate_bytes(&b.build());
    assert_eq!(invoke_export(&inst, "fac", &[Value::I32(0)]).unwrap(), Some(Value::I32(1)));
    assert_eq!(invoke_export(&inst, "fac", &[Value::I32(5)]).unwrap(), Some(Value::I32(120)));
    assert_eq!(invoke_export(&inst, "fac", &[Value::I32(10)]).unwrap(), Some(Value::I32(3628800)));
}

#[test]
fn recursive_calls() {
    // fib(n) = n < 2 ? n : fib(n-1) + fib(n-2)
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[I32], Some(I32));
    let body = cat(&[
        &local(0),
        &i32c(2),
        &[0x48], // i32.lt_s
        &[0x04, 0x7f], // if (result i32)
        &local(0),
        &[0x05], // else
        &local(0),
        &i32c(1),
        &[0x6b],
        &call(0),
        &local(0),
        &i32c(2),
        &[0x6b],
        &call(0),
        &[0x6a],
        &[0x0b], // end if
    ]);
    let fib = b.func(ty, &[], &body);
    b.export_func("fib", fib);
    let inst = instantiate_bytes(&b.build());
    assert_eq!(invoke_export(&inst, "fib", &[Value::I32(10)]).unwrap(), Some(Value::I32(55)));
}

#[test]
fn br_table_dispatch() {
    // returns 10/20/default 99 depending on the selector
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[I32], Some(I32));
    let body = cat(&[
        &[0x02, 0x40], // block 2 (default)
        &[0x02, 0x40], // block 1
        &[0x02, 0x40], // block 0
        &local(0),
        &[0x0e, 0x02, 0x00, 0x01, 0x02], // br_table [0 1] default 2
        &[0x0b],
        &i32c(10),
        &[0x0f], // return
        &[0x0b],
        &i32c(20),
        &[0x0f],
        &[0x0b],
        &i32c(99),
    ]);
    let pick = b.func(ty, &[], &body);
    b.export_func("pick", pick);
    let inst = instantiate_bytes(&b.build());
    assert_eq!(invoke_export(&inst, "pick", &[Value::I32(0)]).unwrap(), Some(Value::I32(10)));
    assert_eq!(invoke_export(&inst, "pick", &[Value::I32(1)]).unwrap(), Some(Value::I32(20)));
    assert_eq!(invoke_export(&inst, "pick", &[Value::I32(5)]).unwrap(), Some(Value::I32(99)));
}

#[test]
fn memory_boundary_loads() {
    // one 64 KiB page; a 1-byte load at 65535 succeeds, a 2-byte load at
    // 65535 overruns by one byte and traps
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[I32], Some(I32));
    b.memory(1, Some(1));
    let load8 = b.func(ty, &[], &cat(&[&local(0), &[0x2d, 0x00, 0x00]])); // i32.load8_u
    let load16 = b.func(ty, &[], &cat(&[&local(0), &[0x2f, 0x01, 0x00]])); // i32.load16_u
    b.export_func("load8", load8);
    b.export_func("load16", load16);
    let inst = instantiate_bytes(&b.build());
    assert_eq!(
        invoke_export(&inst, "load8", &[Value::I32(65535)]).unwrap(),
        Some(Value::I32(0))
    );
    assert_eq!(
        invoke_export(&inst, "load16", &[Value::I32(65535)]),
        Err(Error::Trap(Trap::MemoryOverflow))
    );
    assert_eq!(
        invoke_export(&inst, "load8", &[Value::I32(65536)]),
        Err(Error::Trap(Trap::MemoryOverflow))
    );
}

#[test]
fn memory_data_store_and_grow() {
    let mut b = ModuleBuilder::new();
    let load_ty = b.ty(&[I32], Some(I32));
    let store_ty = b.ty(&[I32, I32], VOID);
    let none_i32 = b.ty(&[], Some(I32));
    let grow_ty = b.ty(&[I32], Some(I32));
    b.memory(1, Some(3));
    let load = b.func(load_ty, &[], &cat(&[&local(0), &[0x28, 0x02, 0x00]])); // i32.load
    let store = b.func(store_ty, &[], &cat(&[&local(0), &local(1), &[0x36, 0x02, 0x00]]));
    let size = b.func(none_i32, &[], &[0x3f, 0x00]); // memory.size
    let grow = b.func(grow_ty, &[], &cat(&[&local(0), &[0x40, 0x00]])); // memory.grow
    b.export_func("load", load);
    b.export_func("store", store);
    b.export_func("size", size);
    b.export_func("grow", grow);
    b.data(&i32c(16), &42u32.to_le_bytes());

    let inst = instantiate_bytes(&b.build());
    // data segment landed
    assert_eq!(invoke_export(&inst, "load", &[Value::I32(16)]).unwrap(), Some(Value::I32(42)));
    // store then load back
    invoke_export(&inst, "store", &[Value::I32(100), Value::I32(-7)]).unwrap();
    assert_eq!(invoke_export(&inst, "load", &[Value::I32(100)]).unwrap(), Some(Value::I32(-7)));
    // grow by one page, observable through memory.size and new bounds
    assert_eq!(invoke_export(&inst, "size", &[]).unwrap(), Some(Value::I32(1)));
    assert_eq!(invoke_export(&inst, "grow", &[Value::I32(1)]).unwrap(), Some(Value::I32(1)));
    assert_eq!(invoke_export(&inst, "size", &[]).unwrap(), Some(Value::I32(2)));
    invoke_export(&inst, "store", &[Value::I32(65536 + 8), Value::I32(9)]).unwrap();
    assert_eq!(
        invoke_export(&inst, "load", &[Value::I32(65536 + 8)]).unwrap(),
        Some(Value::I32(9))
    );
    // growing past the declared max reports -1
    assert_eq!(invoke_export(&inst, "grow", &[Value::I32(5)]).unwrap(), Some(Value::I32(-1)));
}

#[test]
fn indirect_call_trap_ordering() {
    // table of length 2: slot 0 holds a () -> i32 function, slot 1 is null
    let mut b = ModuleBuilder::new();
    let none_i32 = b.ty(&[], Some(I32));
    let none_i64 = b.ty(&[], Some(I64));
    let caller_ty = b.ty(&[I32], Some(I32));
    let caller64_ty = b.ty(&[I32], Some(I64));
    b.table(2, Some(2));
    let seven = b.func(none_i32, &[], &i32c(7));
    let call_i32 = b.func(
        caller_ty,
        &[],
        &cat(&[&local(0), &[0x11], &leb(none_i32 as u64), &[0x00]]),
    );
    let call_i64 = b.func(
        caller64_ty,
        &[],
        &cat(&[&local(0), &[0x11], &leb(none_i64 as u64), &[0x00]]),
    );
    b.export_func("call_i32", call_i32);
    b.export_func("call_i64", call_i64);
    b.elem(&i32c(0), &[seven]);

    let inst = instantiate_bytes(&b.build());
    assert_eq!(
        invoke_export(&inst, "call_i32", &[Value::I32(0)]).unwrap(),
        Some(Value::I32(7))
    );
    assert_eq!(
        invoke_export(&inst, "call_i32", &[Value::I32(1)]),
        Err(Error::Trap(Trap::UninitializedTableEntry))
    );
    assert_eq!(
        invoke_export(&inst, "call_i32", &[Value::I32(2)]),
        Err(Error::Trap(Trap::TableOverflow))
    );
    // wrong expected type on an initialized slot
    assert_eq!(
        invoke_export(&inst, "call_i64", &[Value::I32(0)]),
        Err(Error::Trap(Trap::MismatchedType))
    );
    // out-of-range dominates the type check
    assert_eq!(
        invoke_export(&inst, "call_i64", &[Value::I32(9)]),
        Err(Error::Trap(Trap::TableOverflow))
    );
}

#[test]
fn division_traps() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[I32, I32], Some(I32));
    let div = b.func(ty, &[], &cat(&[&local(0), &local(1), &[0x6d]])); // div_s
    let rem = b.func(ty, &[], &cat(&[&local(0), &local(1), &[0x6f]])); // rem_s
    let divu = b.func(ty, &[], &cat(&[&local(0), &local(1), &[0x6e]])); // div_u
    b.export_func("div_s", div);
    b.export_func("rem_s", rem);
    b.export_func("div_u", divu);
    let inst = instantiate_bytes(&b.build());

    assert_eq!(
        invoke_export(&inst, "div_s", &[Value::I32(7), Value::I32(-2)]).unwrap(),
        Some(Value::I32(-3))
    );
    assert_eq!(
        invoke_export(&inst, "div_s", &[Value::I32(1), Value::I32(0)]),
        Err(Error::Trap(Trap::IntegerOverflow))
    );
    assert_eq!(
        invoke_export(&inst, "div_s", &[Value::I32(i32::MIN), Value::I32(-1)]),
        Err(Error::Trap(Trap::IntegerOverflow))
    );
    // MIN % -1 is defined as 0, not a trap
    assert_eq!(
        invoke_export(&inst, "rem_s", &[Value::I32(i32::MIN), Value::I32(-1)]).unwrap(),
        Some(Value::I32(0))
    );
    assert_eq!(
        invoke_export(&inst, "rem_s", &[Value::I32(7), Value::I32(3)]).unwrap(),
        Some(Value::I32(1))
    );
    assert_eq!(
        invoke_export(&inst, "div_u", &[Value::I32(-2), Value::I32(2)]).unwrap(),
        Some(Value::I32(0x7fffffff))
    );
}

#[test]
fn i64_arithmetic() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[I64, I64], Some(I64));
    let cmp_ty = b.ty(&[I64, I64], Some(I32));
    let mul = b.func(ty, &[], &cat(&[&local(0), &local(1), &[0x7e]]));
    let shl = b.func(ty, &[], &cat(&[&local(0), &local(1), &[0x86]]));
    let lt = b.func(cmp_ty, &[], &cat(&[&local(0), &local(1), &[0x53]])); // lt_s
    b.export_func("mul", mul);
    b.export_func("shl", shl);
    b.export_func("lt", lt);
    let inst = instantiate_bytes(&b.build());
    assert_eq!(
        invoke_export(&inst, "mul", &[Value::I64(1 << 40), Value::I64(4)]).unwrap(),
        Some(Value::I64(1 << 42))
    );
    assert_eq!(
        invoke_export(&inst, "shl", &[Value::I64(1), Value::I64(63)]).unwrap(),
        Some(Value::I64(i64::MIN))
    );
    assert_eq!(
        invoke_export(&inst, "lt", &[Value::I64(i64::MIN), Value::I64(0)]).unwrap(),
        Some(Value::I32(1))
    );
    assert_eq!(
        invoke_export(&inst, "lt", &[Value::I64(3), Value::I64(3)]).unwrap(),
        Some(Value::I32(0))
    );
}

#[test]
fn float_ops() {
    let mut b = ModuleBuilder::new();
    let bin = b.ty(&[F64, F64], Some(F64));
    let cmp = b.ty(&[F64, F64], Some(I32));
    let un = b.ty(&[F64], Some(F64));
    let add = b.func(bin, &[], &cat(&[&local(0), &local(1), &[0xa0]]));
    let mul = b.func(bin, &[], &cat(&[&local(0), &local(1), &[0xa2]]));
    let lt = b.func(cmp, &[], &cat(&[&local(0), &local(1), &[0x63]]));
    let eq = b.func(cmp, &[], &cat(&[&local(0), &local(1), &[0x61]]));
    let sqrt = b.func(un, &[], &cat(&[&local(0), &[0x9f]]));
    let neg = b.func(un, &[], &cat(&[&local(0), &[0x9a]]));
    let floor = b.func(un, &[], &cat(&[&local(0), &[0x9c]]));
    b.export_func("add", add);
    b.export_func("mul", mul);
    b.export_func("lt", lt);
    b.export_func("eq", eq);
    b.export_func("sqrt", sqrt);
    b.export_func("neg", neg);
    b.export_func("floor", floor);
    let inst = instantiate_bytes(&b.build());

    assert_eq!(
        invoke_export(&inst, "add", &[Value::F64(1.5), Value::F64(2.25)]).unwrap(),
        Some(Value::F64(3.75))
    );
    assert_eq!(
        invoke_export(&inst, "mul", &[Value::F64(3.0), Value::F64(-2.0)]).unwrap(),
        Some(Value::F64(-6.0))
    );
    assert_eq!(
        invoke_export(&inst, "sqrt", &[Value::F64(81.0)]).unwrap(),
        Some(Value::F64(9.0))
    );
    assert_eq!(
        invoke_export(&inst, "neg", &[Value::F64(1.5)]).unwrap(),
        Some(Value::F64(-1.5))
    );
    assert_eq!(
        invoke_export(&inst, "floor", &[Value::F64(2.9)]).unwrap(),
        Some(Value::F64(2.0))
    );
    assert_eq!(
        invoke_export(&inst, "lt", &[Value::F64(1.0), Value::F64(2.0)]).unwrap(),
        Some(Value::I32(1))
    );
    // NaN compares false, including against itself
    assert_eq!(
        invoke_export(&inst, "lt", &[Value::F64(f64::NAN), Value::F64(2.0)]).unwrap(),
        Some(Value::I32(0))
    );
    assert_eq!(
        invoke_export(&inst, "eq", &[Value::F64(f64::NAN), Value::F64(f64::NAN)]).unwrap(),
        Some(Value::I32(0))
    );
    assert_eq!(
        invoke_export(&inst, "eq", &[Value::F64(0.5), Value::F64(0.5)]).unwrap(),
        Some(Value::I32(1))
    );
}

#[test]
fn trunc_overflow_traps() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[F64], Some(I32));
    let trunc = b.func(ty, &[], &cat(&[&local(0), &[0xaa]])); // i32.trunc_f64_s
    b.export_func("trunc", trunc);
    let inst = instantiate_bytes(&b.build());
    assert_eq!(
        invoke_export(&inst, "trunc", &[Value::F64(-3.7)]).unwrap(),
        Some(Value::I32(-3))
    );
    assert_eq!(
        invoke_export(&inst, "trunc", &[Value::F64(3e10)]),
        Err(Error::Trap(Trap::IntegerOverflow))
    );
    assert_eq!(
        invoke_export(&inst, "trunc", &[Value::F64(f64::NAN)]),
        Err(Error::Trap(Trap::IntegerOverflow))
    );
}

#[test]
fn unreachable_traps() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[], VOID);
    let f = b.func(ty, &[], &[0x00]); // unreachable
    b.export_func("boom", f);
    let inst = instantiate_bytes(&b.build());
    assert_eq!(invoke_export(&inst, "boom", &[]), Err(Error::Trap(Trap::Unreachable)));
    // the instance stays usable after a trap
    assert_eq!(invoke_export(&inst, "boom", &[]), Err(Error::Trap(Trap::Unreachable)));
}

#[test]
fn globals_and_init_ordering() {
    let mut b = ModuleBuilder::new();
    let get_ty = b.ty(&[], Some(I32));
    let set_ty = b.ty(&[I32], VOID);
    // g0 = 5 (const), g1 = g0 (reads an earlier global), g2 mutable counter
    b.global(I32, false, &i32c(5));
    b.global(I32, false, &[0x23, 0x00]); // get_global 0
    b.global(I32, true, &i32c(0));
    let get1 = b.func(get_ty, &[], &[0x23, 0x01]);
    let get2 = b.func(get_ty, &[], &[0x23, 0x02]);
    let set2 = b.func(set_ty, &[], &cat(&[&local(0), &[0x24, 0x02]]));
    b.export_func("get1", get1);
    b.export_func("get2", get2);
    b.export_func("set2", set2);
    b.export("g1", 3, 1);
    let inst = instantiate_bytes(&b.build());

    assert_eq!(invoke_export(&inst, "get1", &[]).unwrap(), Some(Value::I32(5)));
    assert_eq!(invoke_export(&inst, "get2", &[]).unwrap(), Some(Value::I32(0)));
    invoke_export(&inst, "set2", &[Value::I32(33)]).unwrap();
    assert_eq!(invoke_export(&inst, "get2", &[]).unwrap(), Some(Value::I32(33)));
    // exported immutable global is readable from the host
    match inst.get_export("g1", wajit::ast::ExternKind::Global) {
        Some(Extern::Global(g)) => assert_eq!(g.get(), Value::I32(5)),
        _ => panic!("missing global export"),
    }

    // a global initializer referencing a later global is rejected
    let mut bad = ModuleBuilder::new();
    bad.global(I32, false, &[0x23, 0x01]);
    bad.global(I32, false, &i32c(1));
    assert!(matches!(load_module(&bad.build()), Err(Error::Validation(_))));
}

#[test]
fn start_function_runs_before_other_calls() {
    let mut b = ModuleBuilder::new();
    let void = b.ty(&[], VOID);
    let notify_ty = b.ty(&[I32], VOID);
    b.import_func("env", "notify", notify_ty);
    let start = b.func(void, &[], &cat(&[&i32c(123), &call(0)]));
    b.start = Some(start);

    let module = load_module(&b.build()).unwrap();
    let seen = Rc::new(Cell::new(0));
    let seen2 = seen.clone();
    let notify = host_func(FuncType::new(vec![ValType::I32], None), move |args| {
        seen2.set(args[0].as_i32());
        Ok(None)
    })
    .unwrap();
    let mut env = ModuleImports::new();
    env.insert("notify".to_string(), Extern::Func(notify));
    let mut imports = Imports::new();
    imports.insert("env".to_string(), env);

    let inst = instantiate(&module, &imports).unwrap();
    assert_eq!(seen.get(), 0, "instantiation must not run the start function");
    run_start(&inst).unwrap();
    assert_eq!(seen.get(), 123);
}

#[test]
fn start_function_trap_is_uninstantiable() {
    let mut b = ModuleBuilder::new();
    let void = b.ty(&[], VOID);
    let start = b.func(void, &[], &[0x00]); // unreachable
    b.start = Some(start);
    let inst = instantiate_bytes(&b.build());
    assert_eq!(run_start(&inst), Err(Error::Uninstantiable(Trap::Unreachable)));
}

#[test]
fn host_exit_trap_surfaces() {
    let mut b = ModuleBuilder::new();
    let exit_ty = b.ty(&[I32], VOID);
    b.import_func("env", "exit", exit_ty);
    let ty = b.ty(&[], Some(I32));
    // calls exit(3) and would return 1 if exit did not unwind
    let f = b.func(ty, &[], &cat(&[&i32c(3), &call(0), &i32c(1)]));
    b.export_func("main", f);

    let module = load_module(&b.build()).unwrap();
    let exit = host_func(FuncType::new(vec![ValType::I32], None), |args| {
        Err(Trap::Exit(args[0].as_i32() as u32))
    })
    .unwrap();
    let mut env = ModuleImports::new();
    env.insert("exit".to_string(), Extern::Func(exit));
    let mut imports = Imports::new();
    imports.insert("env".to_string(), env);
    let inst = instantiate(&module, &imports).unwrap();
    assert_eq!(invoke_export(&inst, "main", &[]), Err(Error::Trap(Trap::Exit(3))));
}

#[test]
fn instantiation_failures_leave_no_partial_instance() {
    let host = host_func(FuncType::new(vec![], Some(ValType::I32)), |_| {
        Ok(Some(Value::I32(1)))
    })
    .unwrap();
    let mut env = ModuleImports::new();
    env.insert("f".to_string(), Extern::Func(host.clone()));
    let mut imports = Imports::new();
    imports.insert("env".to_string(), env);
    let baseline = Rc::strong_count(&host);

    // missing import
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[], Some(I32));
    b.import_func("env", "missing", ty);
    let module = load_module(&b.build()).unwrap();
    assert_eq!(instantiate(&module, &imports).err(), Some(Error::Link("unknown import")));
    assert_eq!(Rc::strong_count(&host), baseline);

    // import type mismatch
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[I64], Some(I32));
    b.import_func("env", "f", ty);
    let module = load_module(&b.build()).unwrap();
    assert_eq!(
        instantiate(&module, &imports).err(),
        Some(Error::Link("incompatible import type"))
    );
    assert_eq!(Rc::strong_count(&host), baseline);

    // element segment out of range: the import was already resolved, the
    // failure must still release every reference
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[], Some(I32));
    b.import_func("env", "f", ty);
    b.table(1, Some(1));
    b.elem(&i32c(1), &[0]);
    let module = load_module(&b.build()).unwrap();
    assert_eq!(
        instantiate(&module, &imports).err(),
        Some(Error::Link("elements segment does not fit"))
    );
    assert_eq!(Rc::strong_count(&host), baseline);

    // success holds one extra reference, dropping the instance releases it
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[], Some(I32));
    b.import_func("env", "f", ty);
    let module = load_module(&b.build()).unwrap();
    let inst = instantiate(&module, &imports).unwrap();
    assert!(Rc::strong_count(&host) > baseline);
    drop(inst);
    assert_eq!(Rc::strong_count(&host), baseline);
}

#[test]
fn select_and_conversions() {
    let mut b = ModuleBuilder::new();
    let sel_ty = b.ty(&[I32, I32, I32], Some(I32));
    let wrap_ty = b.ty(&[I64], Some(I32));
    let ext_ty = b.ty(&[I32], Some(I64));
    let conv_ty = b.ty(&[I32], Some(F64));
    let sel = b.func(sel_ty, &[], &cat(&[&local(0), &local(1), &local(2), &[0x1b]]));
    let wrap = b.func(wrap_ty, &[], &cat(&[&local(0), &[0xa7]]));
    let ext_s = b.func(ext_ty, &[], &cat(&[&local(0), &[0xac]]));
    let conv = b.func(conv_ty, &[], &cat(&[&local(0), &[0xb7]])); // f64.convert_i32_s
    b.export_func("sel", sel);
    b.export_func("wrap", wrap);
    b.export_func("ext_s", ext_s);
    b.export_func("conv", conv);
    let inst = instantiate_bytes(&b.build());

    assert_eq!(
        invoke_export(&inst, "sel", &[Value::I32(11), Value::I32(22), Value::I32(1)]).unwrap(),
        Some(Value::I32(11))
    );
    assert_eq!(
        invoke_export(&inst, "sel", &[Value::I32(11), Value::I32(22), Value::I32(0)]).unwrap(),
        Some(Value::I32(22))
    );
    assert_eq!(
        invoke_export(&inst, "wrap", &[Value::I64(0x1_0000_0005)]).unwrap(),
        Some(Value::I32(5))
    );
    assert_eq!(
        invoke_export(&inst, "ext_s", &[Value::I32(-2)]).unwrap(),
        Some(Value::I64(-2))
    );
    assert_eq!(
        invoke_export(&inst, "conv", &[Value::I32(-3)]).unwrap(),
        Some(Value::F64(-3.0))
    );
}

#[test]
fn retpoline_hardened_code_still_works() {
    let mut b = ModuleBuilder::new();
    let none_i32 = b.ty(&[], Some(I32));
    let caller_ty = b.ty(&[I32], Some(I32));
    b.table(1, Some(1));
    let nine = b.func(none_i32, &[], &i32c(9));
    let call_it = b.func(
        caller_ty,
        &[],
        &cat(&[&local(0), &[0x11], &leb(none_i32 as u64), &[0x00]]),
    );
    b.export_func("call_it", call_it);
    b.elem(&i32c(0), &[nine]);

    let module = load_module(&b.build()).unwrap();
    let opts = CompileOptions { retpoline: true };
    let inst = instantiate_with_options(&module, &Imports::new(), opts).unwrap();
    assert_eq!(
        invoke_export(&inst, "call_it", &[Value::I32(0)]).unwrap(),
        Some(Value::I32(9))
    );
    assert_eq!(
        invoke_export(&inst, "call_it", &[Value::I32(1)]),
        Err(Error::Trap(Trap::TableOverflow))
    );
}

#[test]
fn runaway_recursion_traps_stack_overflow() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[], VOID);
    let f = b.func(ty, &[], &call(0)); // calls itself forever
    b.export_func("spin", f);
    let inst = instantiate_bytes(&b.build());
    wajit::reserve_guest_stack(256 * 1024);
    assert_eq!(invoke_export(&inst, "spin", &[]), Err(Error::Trap(Trap::StackOverflow)));
    // the thread survives and can invoke again
    assert_eq!(invoke_export(&inst, "spin", &[]), Err(Error::Trap(Trap::StackOverflow)));
    wajit::set_stack_limit(0);
}

#[test]
fn imported_memory_is_shared() {
    // module A exports its memory; module B imports it and writes through it
    let mut a = ModuleBuilder::new();
    let load_ty = a.ty(&[I32], Some(I32));
    a.memory(1, Some(2));
    let load = a.func(load_ty, &[], &cat(&[&local(0), &[0x28, 0x02, 0x00]]));
    a.export_func("load", load);
    a.export("mem", 2, 0);
    let inst_a = instantiate_bytes(&a.build());

    let mut b = ModuleBuilder::new();
    let store_ty = b.ty(&[I32, I32], VOID);
    b.import_memory("a", "mem", 1, Some(2));
    let store = b.func(store_ty, &[], &cat(&[&local(0), &local(1), &[0x36, 0x02, 0x00]]));
    b.export_func("store", store);
    let module_b = load_module(&b.build()).unwrap();

    let mem = match inst_a.get_export("mem", wajit::ast::ExternKind::Mem) {
        Some(ext) => ext,
        None => panic!("missing memory export"),
    };
    let mut from_a = ModuleImports::new();
    from_a.insert("mem".to_string(), mem);
    let mut imports = Imports::new();
    imports.insert("a".to_string(), from_a);
    let inst_b = instantiate(&module_b, &imports).unwrap();

    invoke_export(&inst_b, "store", &[Value::I32(64), Value::I32(7777)]).unwrap();
    assert_eq!(invoke_export(&inst_a, "load", &[Value::I32(64)]).unwrap(), Some(Value::I32(7777)));
}

#[test]
fn many_arguments_spill_to_the_stack() {
    // 9 i32 parameters force stack passing in the native convention, both
    // for the invoker and for a guest-to-guest call
    let mut b = ModuleBuilder::new();
    let params = [I32; 9];
    let ty = b.ty(&params, Some(I32));
    let none_i32 = b.ty(&[], Some(I32));
    // sum all nine
    let mut body = local(0);
    for i in 1..9 {
        body.extend(local(i));
        body.push(0x6a);
    }
    let sum = b.func(ty, &[], &body);
    // calls sum9 with the constants 1..=9
    let mut caller_body = Vec::new();
    for v in 1..=9 {
        caller_body.extend(i32c(v));
    }
    caller_body.extend(call(sum));
    let caller = b.func(none_i32, &[], &caller_body);
    b.export_func("sum9", sum);
    b.export_func("sum9_consts", caller);
    let inst = instantiate_bytes(&b.build());
    let args: Vec<Value> = (1..=9).map(Value::I32).collect();
    assert_eq!(invoke_export(&inst, "sum9", &args).unwrap(), Some(Value::I32(45)));
    assert_eq!(invoke_export(&inst, "sum9_consts", &[]).unwrap(), Some(Value::I32(45)));
}

#[test]
fn mixed_float_int_call_chain() {
    // guest -> guest call with mixed argument classes
    let mut b = ModuleBuilder::new();
    let inner_ty = b.ty(&[F64, I32, F64], Some(F64));
    let outer_ty = b.ty(&[I32], Some(F64));
    // inner(a, n, c) = a * n + c
    let inner = b.func(
        inner_ty,
        &[],
        &cat(&[
            &local(0),
            &local(1),
            &[0xb7], // f64.convert_i32_s
            &[0xa2], // f64.mul
            &local(2),
            &[0xa0], // f64.add
        ]),
    );
    // outer(n) = inner(2.5, n, 0.5)
    let outer = b.func(
        outer_ty,
        &[],
        &cat(&[&f64c(2.5), &local(0), &f64c(0.5), &call(inner)]),
    );
    b.export_func("outer", outer);
    let inst = instantiate_bytes(&b.build());
    assert_eq!(
        invoke_export(&inst, "outer", &[Value::I32(4)]).unwrap(),
        Some(Value::F64(10.5))
    );
}
