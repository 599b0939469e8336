//! Module instantiation: resolve imports, allocate instances, JIT-compile
//! bodies, run initializers, apply element/data segments, build the export
//! table.
//!
//! There is no partial success: every early return drops the locally built
//! vectors, which frees exactly the instances allocated so far and leaves
//! imported instances untouched (they are shared references into their
//! owning module).

use std::rc::Rc;

use crate::ast::*;
use crate::codeseg::CodeWriter;
use crate::compile::{compile_function, compile_host_wrapper, compile_invoker, CompileCtx, CompileOptions};
use crate::debug_println;
use crate::error::*;
use crate::runtime::*;
use crate::types::*;

pub fn instantiate(module: &Module, imports: &Imports) -> Result<Rc<ModuleInst>, Error> {
    instantiate_with_options(module, imports, CompileOptions::default())
}

pub fn instantiate_with_options(
    module: &Module,
    imports: &Imports,
    opts: CompileOptions,
) -> Result<Rc<ModuleInst>, Error> {
    // compilation trusts validation; re-validating here keeps the engine
    // safe against embedders that skipped it
    crate::validator::validate_module(module)?;

    let mut funcs: Vec<Rc<FuncInst>> = Vec::with_capacity(module.n_funcs());
    let mut tables: Vec<Rc<TableInst>> = Vec::with_capacity(module.n_tables());
    let mut mems: Vec<Rc<MemInst>> = Vec::with_capacity(module.n_memories());
    let mut globals: Vec<Rc<GlobalInst>> = Vec::with_capacity(module.n_globals());

    // 1. resolve imports in declaration order
    for import in &module.imports {
        let resolved = imports
            .get(&import.module)
            .and_then(|m| m.get(&import.name))
            .ok_or(Error::Link(UNKNOWN_IMPORT))?;
        match (&import.desc, resolved) {
            (ImportDesc::Func(typeidx), Extern::Func(func)) => {
                let expected = &module.types[*typeidx as usize];
                if !typecheck_func(expected, func) {
                    return link(INCOMPATIBLE_IMPORT);
                }
                funcs.push(func.clone());
            }
            (ImportDesc::Table(tt), Extern::Table(table)) => {
                if !typecheck_table(tt, table) {
                    return link(INCOMPATIBLE_IMPORT);
                }
                tables.push(table.clone());
            }
            (ImportDesc::Mem(mt), Extern::Mem(mem)) => {
                if !typecheck_memory(mt, mem) {
                    return link(INCOMPATIBLE_IMPORT);
                }
                mems.push(mem.clone());
            }
            (ImportDesc::Global(gt), Extern::Global(global)) => {
                if !typecheck_global(gt, global) {
                    return link(INCOMPATIBLE_IMPORT);
                }
                globals.push(global.clone());
            }
            _ => return link(INCOMPATIBLE_IMPORT),
        }
    }
    let imported = (funcs.len(), tables.len(), mems.len(), globals.len());

    // stable storage: function-type pointers are embedded in generated
    // indirect-call sequences
    let types: Box<[FuncType]> = module.types.clone().into_boxed_slice();

    // 2. allocate defined tables, memories and globals, then compile the
    // defined functions (their code embeds pointers to all of these)
    for tt in &module.tables {
        tables.push(TableInst::new(tt.limits));
    }
    for mt in &module.memories {
        mems.push(MemInst::new(mt.limits));
    }
    for g in &module.globals {
        globals.push(GlobalInst::new(Value::zero(g.ty.ty), g.ty.mutability));
    }
    for typeidx in &module.functions {
        funcs.push(FuncInst::shell(types[*typeidx as usize].clone()));
    }

    let ctx = CompileCtx {
        types: &types,
        funcs: &funcs,
        tables: &tables,
        mems: &mems,
        globals: &globals,
        opts,
    };
    for (i, body) in module.code.iter().enumerate() {
        let func = &funcs[imported.0 + i];
        let blob = compile_function(&ctx, func.ty(), &body.locals, &body.body)?;
        debug_println!("compiled function {}: {} bytes", imported.0 + i, blob.len());
        func.install_code(CodeWriter::with_code(&blob)?.seal()?);
        let invoker = compile_invoker(func.ty(), func.code_entry(), opts)?;
        func.install_invoker(CodeWriter::with_code(&invoker)?.seal()?);
    }

    // 3. global initializers, in declaration order; an initializer sees
    // imports and earlier defined globals only
    for (i, g) in module.globals.iter().enumerate() {
        let value = eval_const(&g.init, &globals[..imported.3 + i])?;
        globals[imported.3 + i].init(value);
    }

    // 4. element segments
    for segment in &module.elements {
        let table = tables
            .get(segment.tableidx as usize)
            .ok_or(Error::Link(UNKNOWN_TABLE))?;
        let offset = eval_const(&segment.offset, &globals)?.as_i32() as u32;
        let end = offset as u64 + segment.funcidxs.len() as u64;
        if end > table.len() as u64 {
            return link(ELEM_SEG_DNF);
        }
        for (j, funcidx) in segment.funcidxs.iter().enumerate() {
            table
                .set(offset as usize + j, Some(funcs[*funcidx as usize].clone()))
                .map_err(|_| Error::Link(ELEM_SEG_DNF))?;
        }
    }

    // 5. data segments
    for segment in &module.data {
        let mem = mems
            .get(segment.memidx as usize)
            .ok_or(Error::Link(UNKNOWN_MEMORY))?;
        let offset = eval_const(&segment.offset, &globals)?.as_i32() as u32;
        mem.write_bytes(offset, &segment.bytes)
            .map_err(|_| Error::Link(DATA_SEG_DNF))?;
    }

    // 6. exports
    let mut exports = Vec::with_capacity(module.exports.len());
    for entry in &module.exports {
        let value = match entry.kind {
            ExternKind::Func => Extern::Func(funcs[entry.idx as usize].clone()),
            ExternKind::Table => Extern::Table(tables[entry.idx as usize].clone()),
            ExternKind::Mem => Extern::Mem(mems[entry.idx as usize].clone()),
            ExternKind::Global => Extern::Global(globals[entry.idx as usize].clone()),
        };
        exports.push(Export { name: entry.name.clone(), value });
    }

    // 7. the start function is recorded, not run; the embedder invokes it
    // (see run_start) before any other call
    Ok(ModuleInst::assemble(
        types, funcs, tables, mems, globals, exports, imported, module.start,
    ))
}

/// Evaluates a validated initializer expression.
fn eval_const(expr: &[Instr], globals: &[Rc<GlobalInst>]) -> Result<Value, Error> {
    match expr.first() {
        Some(Instr::I32Const(v)) => Ok(Value::I32(*v)),
        Some(Instr::I64Const(v)) => Ok(Value::I64(*v)),
        Some(Instr::F32Const(v)) => Ok(Value::F32(*v)),
        Some(Instr::F64Const(v)) => Ok(Value::F64(*v)),
        Some(Instr::GetGlobal(idx)) => globals
            .get(*idx as usize)
            .map(|g| g.get())
            .ok_or(Error::Validation(UNKNOWN_GLOBAL)),
        _ => validation(CONST_EXP_REQUIRED),
    }
}

/// Runs a recorded start function. A trap during it is reported as an
/// instantiation-time failure; the instance should be discarded.
pub fn run_start(inst: &Rc<ModuleInst>) -> Result<(), Error> {
    match inst.start_func() {
        None => Ok(()),
        Some(func) => match invoke(&func, &[]) {
            Ok(_) => Ok(()),
            Err(Error::Trap(trap)) => Err(Error::Uninstantiable(trap)),
            Err(e) => Err(e),
        },
    }
}

/// Wraps a host closure as a `FuncInst`: the closure gets a compiled
/// native-convention trampoline, so tables and indirect calls treat it
/// exactly like guest code.
pub fn host_func(
    ty: FuncType,
    f: impl Fn(&[Value]) -> Result<Option<Value>, Trap> + 'static,
) -> Result<Rc<FuncInst>, Error> {
    host_func_with_options(ty, f, CompileOptions::default())
}

pub fn host_func_with_options(
    ty: FuncType,
    f: impl Fn(&[Value]) -> Result<Option<Value>, Trap> + 'static,
    opts: CompileOptions,
) -> Result<Rc<FuncInst>, Error> {
    let data = Box::new(HostFuncData::new(Box::new(f), ty.clone()));
    let data_ptr: *const HostFuncData = &*data;
    let inst = FuncInst::shell_host(ty.clone(), data);
    let wrapper = compile_host_wrapper(&ty, data_ptr)?;
    inst.install_code(CodeWriter::with_code(&wrapper)?.seal()?);
    let invoker = compile_invoker(&ty, inst.code_entry(), opts)?;
    inst.install_invoker(CodeWriter::with_code(&invoker)?.seal()?);
    Ok(inst)
}
