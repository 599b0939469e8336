//! Module and function-body validation over the decoded AST.
//!
//! The body checker is the usual control-frame algorithm: one frame per
//! block/loop/if, a value stack of known-or-unknown types, and a
//! stack-polymorphic mode after unconditional branches.

use crate::ast::*;
use crate::error::*;
use crate::types::*;

pub fn validate_module(module: &Module) -> Result<(), Error> {
    // function/table/memory/global declarations
    for typeidx in &module.functions {
        if *typeidx as usize >= module.types.len() {
            return validation(UNKNOWN_TYPE);
        }
    }
    for import in &module.imports {
        if let ImportDesc::Func(typeidx) = import.desc {
            if typeidx as usize >= module.types.len() {
                return validation(UNKNOWN_TYPE);
            }
        }
    }
    if module.n_tables() > 1 {
        return validation(MULTIPLE_TABLES);
    }
    if module.n_memories() > 1 {
        return validation(MULTIPLE_MEMORIES);
    }

    // global initializers, in declaration order; an initializer may only
    // read globals with a strictly lower index
    let n_imported_globals = module.n_imported(ExternKind::Global);
    for (i, global) in module.globals.iter().enumerate() {
        let self_idx = (n_imported_globals + i) as u32;
        validate_const_expr(module, &global.init, global.ty.ty, self_idx)?;
    }

    // exports
    let mut seen = std::collections::HashSet::new();
    for export in &module.exports {
        if !seen.insert(export.name.as_str()) {
            return validation(DUP_EXPORT_NAME);
        }
        let in_range = match export.kind {
            ExternKind::Func => (export.idx as usize) < module.n_funcs(),
            ExternKind::Table => (export.idx as usize) < module.n_tables(),
            ExternKind::Mem => (export.idx as usize) < module.n_memories(),
            ExternKind::Global => (export.idx as usize) < module.n_globals(),
        };
        if !in_range {
            let msg = match export.kind {
                ExternKind::Func => UNKNOWN_FUNC,
                ExternKind::Table => UNKNOWN_TABLE,
                ExternKind::Mem => UNKNOWN_MEMORY,
                ExternKind::Global => UNKNOWN_GLOBAL,
            };
            return validation(msg);
        }
    }

    // start function: must exist and be [] -> []
    if let Some(start) = module.start {
        match module.func_type(start) {
            None => return validation(UNKNOWN_FUNC),
            Some(ty) => {
                if !ty.params.is_empty() || ty.result.is_some() {
                    return validation(START_FUNC);
                }
            }
        }
    }

    // element segments
    let n_globals = module.n_globals() as u32;
    for segment in &module.elements {
        if module.table_type(segment.tableidx).is_none() {
            return validation(UNKNOWN_TABLE);
        }
        validate_const_expr(module, &segment.offset, ValType::I32, n_globals)?;
        for funcidx in &segment.funcidxs {
            if *funcidx as usize >= module.n_funcs() {
                return validation(UNKNOWN_FUNC);
            }
        }
    }

    // data segments
    for segment in &module.data {
        if module.memory_type(segment.memidx).is_none() {
            return validation(UNKNOWN_MEMORY);
        }
        validate_const_expr(module, &segment.offset, ValType::I32, n_globals)?;
    }

    // function bodies
    let n_imported_funcs = module.n_imported(ExternKind::Func);
    for (i, body) in module.code.iter().enumerate() {
        let ty = module
            .func_type((n_imported_funcs + i) as u32)
            .ok_or(Error::Validation(UNKNOWN_TYPE))?;
        FuncValidator::new(module, ty, &body.locals).validate(&body.body)?;
    }
    Ok(())
}

/// Initializer expressions are a single constant instruction or a read of an
/// immutable global with index below `global_limit`.
fn validate_const_expr(
    module: &Module,
    expr: &[Instr],
    expected: ValType,
    global_limit: u32,
) -> Result<(), Error> {
    if expr.len() != 1 {
        return validation(CONST_EXP_REQUIRED);
    }
    let actual = match &expr[0] {
        Instr::I32Const(_) => ValType::I32,
        Instr::I64Const(_) => ValType::I64,
        Instr::F32Const(_) => ValType::F32,
        Instr::F64Const(_) => ValType::F64,
        Instr::GetGlobal(idx) => {
            if *idx >= global_limit {
                return validation(UNKNOWN_GLOBAL);
            }
            let gt = module.global_type(*idx).ok_or(Error::Validation(UNKNOWN_GLOBAL))?;
            if gt.mutability != Mut::Const {
                return validation(CONST_EXP_REQUIRED);
            }
            gt.ty
        }
        _ => return validation(CONST_EXP_REQUIRED),
    };
    if actual != expected {
        return validation(TYPE_MISMATCH);
    }
    Ok(())
}

// ---------------- Function-body checking ----------------

/// `None` is the unknown type that appears below a polymorphic point.
type StackType = Option<ValType>;

struct Frame {
    /// Types a branch to this frame carries (loop: none, block/if: result).
    label: BlockType,
    /// Types the frame leaves behind when control falls off its end.
    result: BlockType,
    height: usize,
    unreachable: bool,
}

struct FuncValidator<'m> {
    module: &'m Module,
    locals: Vec<ValType>,
    result: BlockType,
    vals: Vec<StackType>,
    frames: Vec<Frame>,
}

impl<'m> FuncValidator<'m> {
    fn new(module: &'m Module, ty: &FuncType, declared_locals: &[ValType]) -> Self {
        let mut locals = ty.params.clone();
        locals.extend_from_slice(declared_locals);
        Self {
            module,
            locals,
            result: ty.result,
            vals: Vec::with_capacity(64),
            frames: Vec::new(),
        }
    }

    fn validate(mut self, body: &[Instr]) -> Result<(), Error> {
        // the function body behaves like a block whose label carries the
        // function result (a `return` is a branch to it)
        self.block(body, self.result, self.result)?;
        Ok(())
    }

    fn push(&mut self, ty: ValType) {
        self.vals.push(Some(ty));
    }

    fn pop_any(&mut self) -> Result<StackType, Error> {
        let frame = self.frames.last().expect("no frame");
        if self.vals.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return validation(TYPE_MISMATCH);
        }
        Ok(self.vals.pop().unwrap())
    }

    fn pop_expect(&mut self, expected: ValType) -> Result<(), Error> {
        match self.pop_any()? {
            None => Ok(()),
            Some(actual) if actual == expected => Ok(()),
            Some(_) => validation(TYPE_MISMATCH),
        }
    }

    fn pop_block(&mut self, ty: BlockType) -> Result<(), Error> {
        if let Some(vt) = ty {
            self.pop_expect(vt)?;
        }
        Ok(())
    }

    fn push_block(&mut self, ty: BlockType) {
        if let Some(vt) = ty {
            self.push(vt);
        }
    }

    fn mark_unreachable(&mut self) {
        let frame = self.frames.last_mut().expect("no frame");
        self.vals.truncate(frame.height);
        frame.unreachable = true;
    }

    fn label_of(&self, depth: u32) -> Result<BlockType, Error> {
        let n = self.frames.len();
        if depth as usize >= n {
            return validation(UNKNOWN_LABEL);
        }
        Ok(self.frames[n - 1 - depth as usize].label)
    }

    /// Validates one nested sequence under a fresh frame.
    fn block(&mut self, body: &[Instr], label: BlockType, result: BlockType) -> Result<(), Error> {
        self.frames.push(Frame {
            label,
            result,
            height: self.vals.len(),
            unreachable: false,
        });
        for instr in body {
            self.instr(instr)?;
        }
        // falling off the end must leave exactly the result types
        let frame = self.frames.last().unwrap();
        if !frame.unreachable {
            let expected = frame.result.map(|_| 1).unwrap_or(0);
            if self.vals.len() != frame.height + expected {
                return validation(TYPE_MISMATCH);
            }
        }
        let result = frame.result;
        self.pop_block(result)?;
        let frame = self.frames.pop().unwrap();
        self.vals.truncate(frame.height);
        self.push_block(result);
        Ok(())
    }

    fn local_type(&self, idx: u32) -> Result<ValType, Error> {
        self.locals
            .get(idx as usize)
            .copied()
            .ok_or(Error::Validation(UNKNOWN_LOCAL))
    }

    fn instr(&mut self, instr: &Instr) -> Result<(), Error> {
        match instr {
            Instr::Unreachable => self.mark_unreachable(),
            Instr::Nop => {}
            Instr::Block { ty, body } => self.block(body, *ty, *ty)?,
            Instr::Loop { ty, body } => self.block(body, None, *ty)?,
            Instr::If { ty, then, else_ } => {
                self.pop_expect(ValType::I32)?;
                if ty.is_some() && else_.is_empty() {
                    return validation(TYPE_MISMATCH);
                }
                self.block(then, *ty, *ty)?;
                if !else_.is_empty() {
                    // the then arm already pushed the result; take it back
                    // before checking the else arm against the same type
                    self.pop_block(*ty)?;
                    self.block(else_, *ty, *ty)?;
                }
            }
            Instr::Br { depth } => {
                let label = self.label_of(*depth)?;
                self.pop_block(label)?;
                self.mark_unreachable();
            }
            Instr::BrIf { depth } => {
                self.pop_expect(ValType::I32)?;
                let label = self.label_of(*depth)?;
                self.pop_block(label)?;
                self.push_block(label);
            }
            Instr::BrTable { targets, default } => {
                self.pop_expect(ValType::I32)?;
                let label = self.label_of(*default)?;
                for target in targets {
                    if self.label_of(*target)? != label {
                        return validation(TYPE_MISMATCH);
                    }
                }
                self.pop_block(label)?;
                self.mark_unreachable();
            }
            Instr::Return => {
                self.pop_block(self.result)?;
                self.mark_unreachable();
            }
            Instr::Call { func } => {
                let ty = self.module.func_type(*func).ok_or(Error::Validation(UNKNOWN_FUNC))?;
                let (params, result) = (ty.params.clone(), ty.result);
                for param in params.iter().rev() {
                    self.pop_expect(*param)?;
                }
                self.push_block(result);
            }
            Instr::CallIndirect { ty } => {
                if self.module.table_type(0).is_none() {
                    return validation(UNKNOWN_TABLE);
                }
                let ty = self
                    .module
                    .types
                    .get(*ty as usize)
                    .ok_or(Error::Validation(UNKNOWN_TYPE))?;
                let (params, result) = (ty.params.clone(), ty.result);
                self.pop_expect(ValType::I32)?;
                for param in params.iter().rev() {
                    self.pop_expect(*param)?;
                }
                self.push_block(result);
            }
            Instr::Drop => {
                self.pop_any()?;
            }
            Instr::Select => {
                self.pop_expect(ValType::I32)?;
                let a = self.pop_any()?;
                let b = self.pop_any()?;
                let ty = match (a, b) {
                    (Some(a), Some(b)) => {
                        if a != b {
                            return validation(TYPE_MISMATCH);
                        }
                        Some(a)
                    }
                    (Some(t), None) | (None, Some(t)) => Some(t),
                    (None, None) => None,
                };
                if let Some(t) = ty {
                    self.push(t);
                } else {
                    self.vals.push(None);
                }
            }
            Instr::GetLocal(idx) => {
                let ty = self.local_type(*idx)?;
                self.push(ty);
            }
            Instr::SetLocal(idx) => {
                let ty = self.local_type(*idx)?;
                self.pop_expect(ty)?;
            }
            Instr::TeeLocal(idx) => {
                let ty = self.local_type(*idx)?;
                self.pop_expect(ty)?;
                self.push(ty);
            }
            Instr::GetGlobal(idx) => {
                let gt = self
                    .module
                    .global_type(*idx)
                    .ok_or(Error::Validation(UNKNOWN_GLOBAL))?;
                self.push(gt.ty);
            }
            Instr::SetGlobal(idx) => {
                let gt = self
                    .module
                    .global_type(*idx)
                    .ok_or(Error::Validation(UNKNOWN_GLOBAL))?;
                if gt.mutability != Mut::Var {
                    return validation(GLOBAL_IS_IMMUTABLE);
                }
                self.pop_expect(gt.ty)?;
            }
            Instr::Load(op, memarg) => {
                if self.module.memory_type(0).is_none() {
                    return validation(UNKNOWN_MEMORY);
                }
                if (1u32 << memarg.align.min(31)) > op.width() {
                    return validation(ALIGNMENT_TOO_LARGE);
                }
                self.pop_expect(ValType::I32)?;
                self.push(op.valtype());
            }
            Instr::Store(op, memarg) => {
                if self.module.memory_type(0).is_none() {
                    return validation(UNKNOWN_MEMORY);
                }
                if (1u32 << memarg.align.min(31)) > op.width() {
                    return validation(ALIGNMENT_TOO_LARGE);
                }
                self.pop_expect(op.valtype())?;
                self.pop_expect(ValType::I32)?;
            }
            Instr::MemorySize => {
                if self.module.memory_type(0).is_none() {
                    return validation(UNKNOWN_MEMORY);
                }
                self.push(ValType::I32);
            }
            Instr::MemoryGrow => {
                if self.module.memory_type(0).is_none() {
                    return validation(UNKNOWN_MEMORY);
                }
                self.pop_expect(ValType::I32)?;
                self.push(ValType::I32);
            }
            Instr::I32Const(_) => self.push(ValType::I32),
            Instr::I64Const(_) => self.push(ValType::I64),
            Instr::F32Const(_) => self.push(ValType::F32),
            Instr::F64Const(_) => self.push(ValType::F64),
            Instr::Num(op) => {
                let (ins, out) = op.stack_effect();
                for ty in ins.iter().rev() {
                    self.pop_expect(*ty)?;
                }
                self.push(out);
            }
        }
        Ok(())
    }
}
