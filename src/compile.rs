//! The JIT compiler: validated function bodies, invokers and host-function
//! trampolines all become self-contained, position-independent x86-64 blobs.
//!
//! Execution model of compiled guest code:
//! - System V AMD64 calling convention at function boundaries.
//! - Every WASM operand-stack slot is an 8-byte machine-stack slot; the
//!   upper bits of i32/f32 slots are insignificant.
//! - Locals live in the frame below rbp; `[rbp-8]` is a scratch slot used
//!   by indirect calls.
//! - Traps record a pending reason through a helper and unwind one frame;
//!   every call site polls the pending flag and keeps unwinding, so a trap
//!   reaches the outermost `invoke` checkpoint with no frame left behind.
//! - Instance pointers (memory, table, globals, callee functions) are
//!   embedded as absolute immediates; the blobs themselves contain no
//!   relocations.

use nohash_hasher::IntMap;
use std::rc::Rc;

use crate::ast::*;
use crate::error::*;
use crate::runtime::{
    set_pending_trap, wajit_call_host, wajit_memory_grow, wajit_raise_trap,
    wajit_resolve_indirect_call_raw, wajit_stack_check, wajit_trap_pending, FuncInst,
    HostFuncData, MemInst, TableInst, FUNCINST_CODE_OFFSET, MEMINST_DATA_OFFSET,
    MEMINST_SIZE_OFFSET,
};
use crate::types::*;
use crate::x86::*;

#[derive(Clone, Copy, Debug, Default)]
pub struct CompileOptions {
    /// Emit retpoline sequences for indirect branches in generated code.
    pub retpoline: bool,
}

impl CompileOptions {
    /// Picks hardening based on the running CPU. Retpolines only matter on
    /// cores with unrestricted indirect branch prediction; turning them on
    /// everywhere is the conservative default for untrusted input.
    pub fn detect() -> Self {
        CompileOptions { retpoline: cfg!(target_arch = "x86_64") }
    }
}

/// Everything a function body compilation needs to resolve indices into
/// embedded pointers. The referents must stay alive as long as the
/// generated code does; the module instance owns both.
pub(crate) struct CompileCtx<'a> {
    pub types: &'a [FuncType],
    pub funcs: &'a [Rc<FuncInst>],
    pub tables: &'a [Rc<TableInst>],
    pub mems: &'a [Rc<MemInst>],
    pub globals: &'a [Rc<crate::runtime::GlobalInst>],
    pub opts: CompileOptions,
}

// ---------------- Math helpers called from generated code ----------------
//
// Anything whose x86 encoding does not match WASM semantics directly
// (NaN-aware min/max, round-to-even, trapping float->int conversions, bit
// counting) is done in one call to a host helper instead of a long inline
// sequence.

extern "C" fn wajit_i32_clz(x: u32) -> u32 { x.leading_zeros() }
extern "C" fn wajit_i32_ctz(x: u32) -> u32 { x.trailing_zeros() }
extern "C" fn wajit_i32_popcnt(x: u32) -> u32 { x.count_ones() }
extern "C" fn wajit_i64_clz(x: u64) -> u64 { x.leading_zeros() as u64 }
extern "C" fn wajit_i64_ctz(x: u64) -> u64 { x.trailing_zeros() as u64 }
extern "C" fn wajit_i64_popcnt(x: u64) -> u64 { x.count_ones() as u64 }

macro_rules! float_minmax {
    ($min_name:ident, $max_name:ident, $ty:ty) => {
        extern "C" fn $min_name(a: $ty, b: $ty) -> $ty {
            if a.is_nan() || b.is_nan() {
                <$ty>::NAN
            } else if a == b {
                // picks -0 over +0
                if a.is_sign_negative() { a } else { b }
            } else if a < b {
                a
            } else {
                b
            }
        }
        extern "C" fn $max_name(a: $ty, b: $ty) -> $ty {
            if a.is_nan() || b.is_nan() {
                <$ty>::NAN
            } else if a == b {
                // picks +0 over -0
                if a.is_sign_positive() { a } else { b }
            } else if a > b {
                a
            } else {
                b
            }
        }
    };
}

float_minmax!(wajit_f32_min, wajit_f32_max, f32);
float_minmax!(wajit_f64_min, wajit_f64_max, f64);

macro_rules! float_round {
    ($($name:ident, $ty:ty, $method:ident;)+) => {
        $(extern "C" fn $name(x: $ty) -> $ty { x.$method() })+
    };
}

float_round! {
    wajit_f32_ceil, f32, ceil;
    wajit_f32_floor, f32, floor;
    wajit_f32_trunc, f32, trunc;
    wajit_f32_nearest, f32, round_ties_even;
    wajit_f64_ceil, f64, ceil;
    wajit_f64_floor, f64, floor;
    wajit_f64_trunc, f64, trunc;
    wajit_f64_nearest, f64, round_ties_even;
}

macro_rules! trunc_to_int {
    ($name:ident, $float:ty, $int:ty, $lo_ok:expr, $hi_fail:expr) => {
        extern "C" fn $name(x: $float) -> $int {
            if x.is_nan() {
                set_pending_trap(Trap::IntegerOverflow);
                return 0;
            }
            let t = x.trunc();
            if t >= $hi_fail || t < $lo_ok {
                set_pending_trap(Trap::IntegerOverflow);
                return 0;
            }
            t as $int
        }
    };
}

trunc_to_int!(wajit_i32_trunc_f32_s, f32, i32, -2147483648.0, 2147483648.0);
trunc_to_int!(wajit_i32_trunc_f32_u, f32, u32, 0.0, 4294967296.0);
trunc_to_int!(wajit_i32_trunc_f64_s, f64, i32, -2147483648.0, 2147483648.0);
trunc_to_int!(wajit_i32_trunc_f64_u, f64, u32, 0.0, 4294967296.0);
trunc_to_int!(wajit_i64_trunc_f32_s, f32, i64, -9223372036854775808.0, 9223372036854775808.0);
trunc_to_int!(wajit_i64_trunc_f32_u, f32, u64, 0.0, 18446744073709551616.0);
trunc_to_int!(wajit_i64_trunc_f64_s, f64, i64, -9223372036854775808.0, 9223372036854775808.0);
trunc_to_int!(wajit_i64_trunc_f64_u, f64, u64, 0.0, 18446744073709551616.0);

extern "C" fn wajit_f32_convert_u64(x: u64) -> f32 { x as f32 }
extern "C" fn wajit_f64_convert_u64(x: u64) -> f64 { x as f64 }

// ---------------- Argument classification ----------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ArgLoc {
    IntReg(Reg),
    SseReg(u8),
    /// Zero-based stack slot, left to right.
    Stack(usize),
}

/// SysV placement for a parameter list: integers take rdi..r9, floats take
/// xmm0..xmm7, the rest spills to the stack in declaration order.
fn classify_args(params: &[ValType]) -> (Vec<ArgLoc>, usize) {
    let mut locs = Vec::with_capacity(params.len());
    let mut n_int = 0usize;
    let mut n_sse = 0usize;
    let mut n_stack = 0usize;
    for ty in params {
        if ty.is_float() {
            if n_sse < N_SSE_ARG_REGS {
                locs.push(ArgLoc::SseReg(n_sse as u8));
                n_sse += 1;
            } else {
                locs.push(ArgLoc::Stack(n_stack));
                n_stack += 1;
            }
        } else if n_int < INT_ARG_REGS.len() {
            locs.push(ArgLoc::IntReg(INT_ARG_REGS[n_int]));
            n_int += 1;
        } else {
            locs.push(ArgLoc::Stack(n_stack));
            n_stack += 1;
        }
    }
    (locs, n_stack)
}

// ---------------- Invoker and host wrapper ----------------

/// Compiles the adapter from the engine calling convention (pointer to an
/// array of raw 8-byte payloads) to the native convention of `target`,
/// returning the raw result payload.
pub(crate) fn compile_invoker(
    ty: &FuncType,
    target: *const u8,
    opts: CompileOptions,
) -> Result<Vec<u8>, Error> {
    if ty.params.len() > FUNC_TYPE_MAX_INPUTS {
        return compile_err(UNSUPPORTED_CONSTRUCT);
    }
    let mut asm = Asm::new();
    asm.push_reg(Reg::Rbp);
    asm.mov_reg_reg(Reg::Rbp, Reg::Rsp, true);
    // keep the array pointer out of the argument registers
    asm.mov_reg_reg(Reg::R10, Reg::Rdi, true);

    let (locs, n_stack) = classify_args(&ty.params);
    let padded = n_stack + (n_stack & 1);
    if padded > 0 {
        asm.sub_reg_imm32(Reg::Rsp, (8 * padded) as i32, true);
    }
    for (i, loc) in locs.iter().enumerate() {
        let src_disp = (8 * i) as i32;
        match loc {
            ArgLoc::Stack(slot) => {
                asm.mov_reg_mem(Reg::Rax, Reg::R10, src_disp, true);
                asm.mov_mem_reg(Reg::Rsp, (8 * slot) as i32, Reg::Rax, true);
            }
            ArgLoc::IntReg(reg) => {
                asm.mov_reg_mem(*reg, Reg::R10, src_disp, true);
            }
            ArgLoc::SseReg(xmm) => {
                asm.load_xmm(*xmm, Reg::R10, src_disp, ty.params[i] == ValType::F64);
            }
        }
    }

    asm.mov_reg_imm64(Reg::R11, target as u64);
    if opts.retpoline {
        let thunk = asm.new_label();
        asm.call_label(thunk);
        finish_invoker_result(&mut asm, ty);
        asm.leave();
        asm.ret();
        asm.emit_retpoline_thunk(thunk, Reg::R11);
    } else {
        asm.call_reg(Reg::R11);
        finish_invoker_result(&mut asm, ty);
        asm.leave();
        asm.ret();
    }
    Ok(asm.finish())
}

fn finish_invoker_result(asm: &mut Asm, ty: &FuncType) {
    match ty.result {
        Some(ValType::F32) => asm.mov_reg_xmm(Reg::Rax, 0, false),
        Some(ValType::F64) => asm.mov_reg_xmm(Reg::Rax, 0, true),
        _ => {}
    }
}

/// Compiles the mirror adapter: a native-convention entry point that spills
/// its arguments into a payload array and hands them, together with the
/// embedded closure pointer, to the fixed host-call shim.
pub(crate) fn compile_host_wrapper(
    ty: &FuncType,
    data: *const HostFuncData,
) -> Result<Vec<u8>, Error> {
    if ty.params.len() > FUNC_TYPE_MAX_INPUTS {
        return compile_err(UNSUPPORTED_CONSTRUCT);
    }
    let mut asm = Asm::new();
    asm.push_reg(Reg::Rbp);
    asm.mov_reg_reg(Reg::Rbp, Reg::Rsp, true);

    let n = ty.params.len();
    let buf_slots = n + (n & 1);
    if buf_slots > 0 {
        asm.sub_reg_imm32(Reg::Rsp, (8 * buf_slots) as i32, true);
    }
    let (locs, _) = classify_args(&ty.params);
    for (i, loc) in locs.iter().enumerate() {
        let dst_disp = (8 * i) as i32;
        match loc {
            ArgLoc::IntReg(reg) => asm.mov_mem_reg(Reg::Rsp, dst_disp, *reg, true),
            ArgLoc::SseReg(xmm) => {
                asm.store_xmm(Reg::Rsp, dst_disp, *xmm, ty.params[i] == ValType::F64)
            }
            ArgLoc::Stack(slot) => {
                asm.mov_reg_mem(Reg::Rax, Reg::Rbp, (16 + 8 * slot) as i32, true);
                asm.mov_mem_reg(Reg::Rsp, dst_disp, Reg::Rax, true);
            }
        }
    }

    asm.mov_reg_imm64(Reg::Rdi, data as u64);
    asm.mov_reg_reg(Reg::Rsi, Reg::Rsp, true);
    asm.mov_reg_imm64(Reg::Rax, wajit_call_host as usize as u64);
    asm.call_reg(Reg::Rax);
    match ty.result {
        Some(ValType::F32) => asm.mov_xmm_reg(0, Reg::Rax, false),
        Some(ValType::F64) => asm.mov_xmm_reg(0, Reg::Rax, true),
        _ => {}
    }
    asm.leave();
    asm.ret();
    Ok(asm.finish())
}

// ---------------- Function bodies ----------------

/// Compiles one validated function body. The returned blob implements the
/// native calling convention for `ty` and is position-independent.
pub(crate) fn compile_function(
    ctx: &CompileCtx,
    ty: &FuncType,
    declared_locals: &[ValType],
    body: &[Instr],
) -> Result<Vec<u8>, Error> {
    if ty.params.len() > FUNC_TYPE_MAX_INPUTS {
        return compile_err(UNSUPPORTED_CONSTRUCT);
    }
    let compiler = FuncCompiler::new(ctx, ty, declared_locals);
    compiler.compile(body)
}

struct Frame {
    label: Label,
    entry_depth: usize,
    /// Slots a branch to this frame carries (0 for loops).
    arity: usize,
    /// Slots on the stack above `entry_depth` after the frame exits.
    result_arity: usize,
}

struct FuncCompiler<'a> {
    asm: Asm,
    ctx: &'a CompileCtx<'a>,
    ty: &'a FuncType,
    n_locals: usize,
    /// Compile-time operand-stack depth in 8-byte slots.
    depth: usize,
    frames: Vec<Frame>,
    unwind: Label,
    trap_stubs: IntMap<u32, Label>,
    retpoline_thunk: Option<Label>,
    /// Set after an unconditional branch; cleared at the next branch target.
    dead: bool,
}

const SCRATCH_DISP: i32 = -8;

impl<'a> FuncCompiler<'a> {
    fn new(ctx: &'a CompileCtx<'a>, ty: &'a FuncType, declared_locals: &[ValType]) -> Self {
        let mut asm = Asm::new();
        let unwind = asm.new_label();
        Self {
            asm,
            ctx,
            ty,
            n_locals: ty.params.len() + declared_locals.len(),
            depth: 0,
            frames: Vec::new(),
            unwind,
            trap_stubs: IntMap::default(),
            retpoline_thunk: None,
            dead: false,
        }
    }

    fn local_disp(&self, idx: u32) -> i32 {
        -(16 + 8 * idx as i32)
    }

    fn compile(mut self, body: &[Instr]) -> Result<Vec<u8>, Error> {
        let result_arity = self.ty.result.map(|_| 1).unwrap_or(0);

        // prologue
        self.asm.push_reg(Reg::Rbp);
        self.asm.mov_reg_reg(Reg::Rbp, Reg::Rsp, true);
        let frame_bytes = (8 * (1 + self.n_locals) + 15) & !15;
        let frame_bytes = i32::try_from(frame_bytes).map_err(|_| Error::Compile(BODY_TOO_LARGE))?;
        self.asm.sub_reg_imm32(Reg::Rsp, frame_bytes, true);

        // spill parameters into their local slots first; the stack probe
        // below is a call and clobbers the argument registers
        let (locs, _) = classify_args(&self.ty.params);
        for (i, loc) in locs.iter().enumerate() {
            let disp = self.local_disp(i as u32);
            match loc {
                ArgLoc::IntReg(reg) => self.asm.mov_mem_reg(Reg::Rbp, disp, *reg, true),
                ArgLoc::SseReg(xmm) => {
                    let double = self.ty.params[i] == ValType::F64;
                    self.asm.store_xmm(Reg::Rbp, disp, *xmm, double);
                }
                ArgLoc::Stack(slot) => {
                    self.asm.mov_reg_mem(Reg::Rax, Reg::Rbp, (16 + 8 * slot) as i32, true);
                    self.asm.mov_mem_reg(Reg::Rbp, disp, Reg::Rax, true);
                }
            }
        }

        // declared locals start zeroed
        if self.n_locals > self.ty.params.len() {
            self.asm.xor_reg_reg(Reg::Rax, Reg::Rax, false);
            for i in self.ty.params.len()..self.n_locals {
                let disp = self.local_disp(i as u32);
                self.asm.mov_mem_reg(Reg::Rbp, disp, Reg::Rax, true);
            }
        }

        // stack-overflow probe
        self.asm.mov_reg_imm64(Reg::Rax, wajit_stack_check as usize as u64);
        self.asm.call_reg(Reg::Rax);
        self.asm.test_reg_reg(Reg::Rax, Reg::Rax, false);
        self.asm.jcc_label(CC_NE, self.unwind);

        // the body is one big block; `return` branches to its exit label
        let exit = self.asm.new_label();
        self.frames.push(Frame {
            label: exit,
            entry_depth: 0,
            arity: result_arity,
            result_arity,
        });
        self.seq(body)?;
        let frame = self.frames.pop().unwrap();
        self.asm.bind(frame.label);

        // epilogue: result (if any) is the single slot left on the stack
        match self.ty.result {
            None => {}
            Some(ValType::F32) => {
                self.asm.pop_reg(Reg::Rax);
                self.asm.mov_xmm_reg(0, Reg::Rax, false);
            }
            Some(ValType::F64) => {
                self.asm.pop_reg(Reg::Rax);
                self.asm.mov_xmm_reg(0, Reg::Rax, true);
            }
            Some(_) => self.asm.pop_reg(Reg::Rax),
        }
        self.asm.leave();
        self.asm.ret();

        // shared unwind path: a callee or helper left a trap pending
        self.asm.bind(self.unwind);
        self.asm.leave();
        self.asm.ret();

        // trap stubs raise the reason and join the unwind path; they are
        // entered by jumps from arbitrary stack depths, so realign first
        let stubs: Vec<(u32, Label)> = self.trap_stubs.iter().map(|(k, v)| (*k, *v)).collect();
        for (code, label) in stubs {
            self.asm.bind(label);
            self.asm.and_rsp_imm8(-16);
            self.asm.mov_reg_imm32(Reg::Rdi, code);
            self.asm.mov_reg_imm64(Reg::Rax, wajit_raise_trap as usize as u64);
            self.asm.call_reg(Reg::Rax);
            self.asm.jmp_label(self.unwind);
        }

        if let Some(thunk) = self.retpoline_thunk {
            self.asm.emit_retpoline_thunk(thunk, Reg::R11);
        }

        Ok(self.asm.finish())
    }

    // ---------------- small emission helpers ----------------

    fn push(&mut self, reg: Reg) {
        self.asm.push_reg(reg);
        self.depth += 1;
    }

    fn pop(&mut self, reg: Reg) {
        self.asm.pop_reg(reg);
        self.depth -= 1;
    }

    fn trap_label(&mut self, trap: Trap) -> Label {
        if let Some(label) = self.trap_stubs.get(&trap.code()) {
            return *label;
        }
        let label = self.asm.new_label();
        self.trap_stubs.insert(trap.code(), label);
        label
    }

    /// Aligned call to a helper whose address is a constant; arguments must
    /// already sit in their registers. Clobbers rax.
    fn helper_call(&mut self, helper: usize) {
        let pad = self.depth % 2 == 1;
        if pad {
            self.asm.sub_reg_imm32(Reg::Rsp, 8, true);
        }
        self.asm.mov_reg_imm64(Reg::Rax, helper as u64);
        self.asm.call_reg(Reg::Rax);
        if pad {
            self.asm.add_reg_imm32(Reg::Rsp, 8, true);
        }
    }

    /// Poll for a pending trap after a call and unwind if one is recorded.
    fn trap_poll(&mut self) {
        self.helper_call(wajit_trap_pending as usize);
        self.asm.test_reg_reg(Reg::Rax, Reg::Rax, false);
        self.asm.jcc_label(CC_NE, self.unwind);
    }

    /// pop operand, call unary helper with it in rdi, push rax.
    fn helper_unop_int(&mut self, helper: usize) {
        self.pop(Reg::Rax);
        self.asm.mov_reg_reg(Reg::Rdi, Reg::Rax, true);
        self.helper_call(helper);
        self.push(Reg::Rax);
    }

    /// pop f operand into xmm0, call helper, push the float result.
    fn helper_unop_float(&mut self, helper: usize, double: bool) {
        self.pop(Reg::Rax);
        self.asm.mov_xmm_reg(0, Reg::Rax, double);
        self.helper_call(helper);
        self.asm.mov_reg_xmm(Reg::Rax, 0, double);
        self.push(Reg::Rax);
    }

    /// pop b, a into xmm1, xmm0, call helper, push the float result.
    fn helper_binop_float(&mut self, helper: usize, double: bool) {
        self.pop(Reg::Rcx);
        self.pop(Reg::Rax);
        self.asm.mov_xmm_reg(0, Reg::Rax, double);
        self.asm.mov_xmm_reg(1, Reg::Rcx, double);
        self.helper_call(helper);
        self.asm.mov_reg_xmm(Reg::Rax, 0, double);
        self.push(Reg::Rax);
    }

    /// pop float operand, call trapping conversion helper, push int result.
    fn helper_trunc(&mut self, helper: usize, double: bool) {
        self.pop(Reg::Rax);
        self.asm.mov_xmm_reg(0, Reg::Rax, double);
        self.helper_call(helper);
        self.push(Reg::Rax);
        self.trap_poll();
    }

    // ---------------- control flow ----------------

    fn seq(&mut self, body: &[Instr]) -> Result<(), Error> {
        for instr in body {
            self.instr(instr)?;
            if self.dead {
                // nothing later in this sequence is reachable; branch
                // targets only exist at enclosing block boundaries
                break;
            }
        }
        Ok(())
    }

    fn close_block(&mut self, frame: Frame) {
        if self.dead && self.asm.label_referenced(frame.label) {
            self.dead = false;
        }
        self.asm.bind(frame.label);
        self.depth = frame.entry_depth + frame.result_arity;
    }

    fn block(&mut self, ty: BlockType, body: &[Instr]) -> Result<(), Error> {
        let label = self.asm.new_label();
        let result_arity = ty.map(|_| 1).unwrap_or(0);
        self.frames.push(Frame {
            label,
            entry_depth: self.depth,
            arity: result_arity,
            result_arity,
        });
        self.seq(body)?;
        let frame = self.frames.pop().unwrap();
        self.close_block(frame);
        Ok(())
    }

    fn loop_(&mut self, ty: BlockType, body: &[Instr]) -> Result<(), Error> {
        let label = self.asm.new_label();
        self.asm.bind(label);
        let result_arity = ty.map(|_| 1).unwrap_or(0);
        self.frames.push(Frame {
            label,
            entry_depth: self.depth,
            arity: 0,
            result_arity,
        });
        self.seq(body)?;
        let frame = self.frames.pop().unwrap();
        // backward branches re-enter the loop; the end is reachable only by
        // falling off the body
        self.depth = frame.entry_depth + frame.result_arity;
        Ok(())
    }

    fn if_(&mut self, ty: BlockType, then: &[Instr], else_: &[Instr]) -> Result<(), Error> {
        self.pop(Reg::Rax);
        self.asm.test_reg_reg(Reg::Rax, Reg::Rax, false);
        let else_label = self.asm.new_label();
        self.asm.jcc_label(CC_E, else_label);

        let end = self.asm.new_label();
        let result_arity = ty.map(|_| 1).unwrap_or(0);
        let entry_depth = self.depth;
        self.frames.push(Frame {
            label: end,
            entry_depth,
            arity: result_arity,
            result_arity,
        });
        self.seq(then)?;
        let then_dead = self.dead;
        if !then_dead {
            self.asm.jmp_label(end);
        }

        self.dead = false;
        self.depth = entry_depth;
        self.asm.bind(else_label);
        self.seq(else_)?;
        let else_dead = self.dead;

        let frame = self.frames.pop().unwrap();
        self.dead = then_dead && else_dead;
        self.close_block(frame);
        Ok(())
    }

    /// Emits the stack unwinding and jump for a branch to `rel_depth`.
    /// Leaves `self.depth` untouched; conditional callers need it intact.
    fn emit_branch(&mut self, rel_depth: u32, depth_now: usize) -> Result<(), Error> {
        let fi = self
            .frames
            .len()
            .checked_sub(1 + rel_depth as usize)
            .ok_or(Error::Compile(UNSUPPORTED_CONSTRUCT))?;
        let (label, arity, entry_depth) =
            (self.frames[fi].label, self.frames[fi].arity, self.frames[fi].entry_depth);
        let discard = depth_now - arity - entry_depth;
        if arity == 1 {
            self.asm.pop_reg(Reg::Rax);
        }
        if discard > 0 {
            self.asm.add_reg_imm32(Reg::Rsp, (8 * discard) as i32, true);
        }
        if arity == 1 {
            self.asm.push_reg(Reg::Rax);
        }
        self.asm.jmp_label(label);
        Ok(())
    }

    // ---------------- calls ----------------

    fn indirect_target_thunk(&mut self) -> Option<Label> {
        if !self.ctx.opts.retpoline {
            return None;
        }
        if self.retpoline_thunk.is_none() {
            self.retpoline_thunk = Some(self.asm.new_label());
        }
        self.retpoline_thunk
    }

    /// Calls a function whose `FuncInst` pointer is either an embedded
    /// constant (direct call) or spilled in the scratch slot (indirect).
    /// Arguments are the top `n_args` operand slots.
    fn emit_call(&mut self, callee: &FuncType, funcinst: Option<*const FuncInst>) {
        let n_args = callee.params.len();
        let (locs, n_stack) = classify_args(&callee.params);
        let pad = (self.depth + n_stack) & 1;
        if pad == 1 {
            self.asm.sub_reg_imm32(Reg::Rsp, 8, true);
        }

        // stack-passed arguments go on top, first argument nearest rsp;
        // push them in reverse declaration order
        let mut pushed = 0usize;
        for (i, loc) in locs.iter().enumerate().rev() {
            if let ArgLoc::Stack(_) = loc {
                let disp = 8 * (n_args - 1 - i + pad + pushed);
                self.asm.push_mem(Reg::Rsp, disp as i32);
                pushed += 1;
            }
        }

        // register arguments load straight from the operand slots
        let base = 8 * (pad + n_stack);
        for (i, loc) in locs.iter().enumerate() {
            let disp = (base + 8 * (n_args - 1 - i)) as i32;
            match loc {
                ArgLoc::IntReg(reg) => self.asm.mov_reg_mem(*reg, Reg::Rsp, disp, true),
                ArgLoc::SseReg(xmm) => {
                    self.asm.load_xmm(*xmm, Reg::Rsp, disp, callee.params[i] == ValType::F64)
                }
                ArgLoc::Stack(_) => {}
            }
        }

        match funcinst {
            Some(ptr) => self.asm.mov_reg_imm64(Reg::R11, ptr as u64),
            None => self.asm.mov_reg_mem(Reg::R11, Reg::Rbp, SCRATCH_DISP, true),
        }
        self.asm.mov_reg_mem(Reg::R11, Reg::R11, FUNCINST_CODE_OFFSET, true);
        match self.indirect_target_thunk() {
            Some(thunk) => self.asm.call_label(thunk),
            None => self.asm.call_reg(Reg::R11),
        }

        // drop pushed copies, padding and the argument slots
        let cleanup = 8 * (pad + n_stack + n_args);
        if cleanup > 0 {
            self.asm.add_reg_imm32(Reg::Rsp, cleanup as i32, true);
        }
        self.depth -= n_args;

        match callee.result {
            None => {}
            Some(ValType::F32) => {
                self.asm.mov_reg_xmm(Reg::Rax, 0, false);
                self.push(Reg::Rax);
            }
            Some(ValType::F64) => {
                self.asm.mov_reg_xmm(Reg::Rax, 0, true);
                self.push(Reg::Rax);
            }
            Some(_) => self.push(Reg::Rax),
        }
        self.trap_poll();
    }

    // ---------------- memory ----------------

    /// addr is on the stack; leaves the effective address in rax with the
    /// bounds check done, and the memory base in r11.
    fn emit_mem_address(&mut self, offset: u32, width: u32, value_on_top: bool) {
        let mem = Rc::as_ptr(&self.ctx.mems[0]);
        if value_on_top {
            self.pop(Reg::Rcx); // value
        }
        self.pop(Reg::Rax); // address
        self.asm.zero_extend_32(Reg::Rax);
        if offset != 0 {
            self.asm.mov_reg_imm32(Reg::Rdx, offset);
            self.asm.add_reg_reg(Reg::Rax, Reg::Rdx, true);
        }
        self.asm.mov_reg_imm64(Reg::R11, mem as u64);
        self.asm.mov_reg_mem(Reg::Rdx, Reg::R11, MEMINST_SIZE_OFFSET, true);
        self.asm.lea(Reg::R10, Reg::Rax, width as i32);
        self.asm.cmp_reg_reg(Reg::R10, Reg::Rdx, true);
        let stub = self.trap_label(Trap::MemoryOverflow);
        self.asm.jcc_label(CC_A, stub);
        self.asm.mov_reg_mem(Reg::R11, Reg::R11, MEMINST_DATA_OFFSET, true);
    }

    fn load(&mut self, op: LoadOp, memarg: MemArg) {
        use LoadOp::*;
        self.emit_mem_address(memarg.offset, op.width(), false);
        let signed = matches!(
            op,
            I32Load8S | I32Load16S | I64Load8S | I64Load16S | I64Load32S
        );
        self.asm.load_idx(Reg::Rax, Reg::R11, Reg::Rax, op.width(), signed);
        self.push(Reg::Rax);
    }

    fn store(&mut self, op: StoreOp, memarg: MemArg) {
        self.emit_mem_address(memarg.offset, op.width(), true);
        self.asm.store_idx(Reg::R11, Reg::Rax, Reg::Rcx, op.width());
    }

    // ---------------- integer/float op groups ----------------

    /// pop b, pop a, cc(a, b), push bool
    fn int_cmp(&mut self, cc: u8, wide: bool) {
        self.pop(Reg::Rcx);
        self.pop(Reg::Rax);
        self.asm.cmp_reg_reg(Reg::Rax, Reg::Rcx, wide);
        self.asm.setcc(cc, Reg::Rax);
        self.asm.movzx8(Reg::Rax, Reg::Rax);
        self.push(Reg::Rax);
    }

    /// pop b, pop a, a = op(a, b), push a
    fn int_alu(&mut self, op: fn(&mut Asm, Reg, Reg, bool), wide: bool) {
        self.pop(Reg::Rcx);
        self.pop(Reg::Rax);
        op(&mut self.asm, Reg::Rax, Reg::Rcx, wide);
        self.push(Reg::Rax);
    }

    fn int_shift(&mut self, ext: u8, wide: bool) {
        self.pop(Reg::Rcx);
        self.pop(Reg::Rax);
        self.asm.shift_cl(ext, Reg::Rax, wide);
        self.push(Reg::Rax);
    }

    /// Signed/unsigned division and remainder with the WASM trap rules.
    fn int_div(&mut self, wide: bool, signed: bool, remainder: bool) {
        let stub = self.trap_label(Trap::IntegerOverflow);
        self.pop(Reg::Rcx);
        self.pop(Reg::Rax);
        self.asm.test_reg_reg(Reg::Rcx, Reg::Rcx, wide);
        self.asm.jcc_label(CC_E, stub);
        if signed {
            let after = self.asm.new_label();
            if remainder {
                // MIN % -1 is 0, and idiv would fault on it
                let do_div = self.asm.new_label();
                self.asm.cmp_reg_imm8(Reg::Rcx, -1, wide);
                self.asm.jcc_label(CC_NE, do_div);
                self.asm.xor_reg_reg(Reg::Rdx, Reg::Rdx, false);
                self.asm.jmp_label(after);
                self.asm.bind(do_div);
            } else {
                // MIN / -1 overflows
                let ok = self.asm.new_label();
                if wide {
                    self.asm.mov_reg_imm64(Reg::Rdx, i64::MIN as u64);
                    self.asm.cmp_reg_reg(Reg::Rax, Reg::Rdx, true);
                } else {
                    self.asm.cmp_reg_imm32(Reg::Rax, i32::MIN, false);
                }
                self.asm.jcc_label(CC_NE, ok);
                self.asm.cmp_reg_imm8(Reg::Rcx, -1, wide);
                self.asm.jcc_label(CC_E, stub);
                self.asm.bind(ok);
            }
            if wide {
                self.asm.cqo();
            } else {
                self.asm.cdq();
            }
            self.asm.idiv_reg(Reg::Rcx, wide);
            if remainder {
                self.asm.bind(after);
            }
        } else {
            self.asm.xor_reg_reg(Reg::Rdx, Reg::Rdx, false);
            self.asm.div_reg(Reg::Rcx, wide);
        }
        if remainder {
            self.push(Reg::Rdx);
        } else {
            self.push(Reg::Rax);
        }
    }

    /// pop b, pop a, SSE op into a, push
    fn float_arith(&mut self, opcode: u8, double: bool) {
        self.pop(Reg::Rcx);
        self.pop(Reg::Rax);
        self.asm.mov_xmm_reg(0, Reg::Rax, double);
        self.asm.mov_xmm_reg(1, Reg::Rcx, double);
        self.asm.sse_arith(opcode, 0, 1, double);
        self.asm.mov_reg_xmm(Reg::Rax, 0, double);
        self.push(Reg::Rax);
    }

    /// Ordered float comparison; `swapped` compares (b, a) so that
    /// less-than forms reduce to the unsigned-above conditions.
    fn float_cmp(&mut self, cc: u8, swapped: bool, double: bool) {
        self.pop(Reg::Rcx);
        self.pop(Reg::Rax);
        self.asm.mov_xmm_reg(0, Reg::Rax, double);
        self.asm.mov_xmm_reg(1, Reg::Rcx, double);
        if swapped {
            self.asm.ucomis(1, 0, double);
        } else {
            self.asm.ucomis(0, 1, double);
        }
        self.asm.setcc(cc, Reg::Rax);
        self.asm.movzx8(Reg::Rax, Reg::Rax);
        self.push(Reg::Rax);
    }

    /// eq/ne need the parity flag folded in: unordered compares as not-equal.
    fn float_eq_ne(&mut self, negated: bool, double: bool) {
        self.pop(Reg::Rcx);
        self.pop(Reg::Rax);
        self.asm.mov_xmm_reg(0, Reg::Rax, double);
        self.asm.mov_xmm_reg(1, Reg::Rcx, double);
        self.asm.ucomis(0, 1, double);
        if negated {
            self.asm.setcc(CC_P, Reg::Rcx);
            self.asm.setcc(CC_NE, Reg::Rax);
            self.asm.or8(Reg::Rax, Reg::Rcx);
        } else {
            self.asm.setcc(CC_NP, Reg::Rcx);
            self.asm.setcc(CC_E, Reg::Rax);
            self.asm.and8(Reg::Rax, Reg::Rcx);
        }
        self.asm.movzx8(Reg::Rax, Reg::Rax);
        self.push(Reg::Rax);
    }

    /// Sign-bit manipulation done in integer registers.
    fn float_sign_unop(&mut self, is_abs: bool, double: bool) {
        self.pop(Reg::Rax);
        if double {
            let mask: u64 = if is_abs { !(1 << 63) } else { 1 << 63 };
            self.asm.mov_reg_imm64(Reg::Rcx, mask);
            if is_abs {
                self.asm.and_reg_reg(Reg::Rax, Reg::Rcx, true);
            } else {
                self.asm.xor_reg_reg(Reg::Rax, Reg::Rcx, true);
            }
        } else if is_abs {
            self.asm.and_reg_imm32(Reg::Rax, 0x7fff_ffff, false);
        } else {
            self.asm.xor_reg_imm32(Reg::Rax, 0x8000_0000, false);
        }
        self.push(Reg::Rax);
    }

    fn float_copysign(&mut self, double: bool) {
        self.pop(Reg::Rcx);
        self.pop(Reg::Rax);
        if double {
            self.asm.mov_reg_imm64(Reg::Rdx, !(1u64 << 63));
            self.asm.and_reg_reg(Reg::Rax, Reg::Rdx, true);
            self.asm.mov_reg_imm64(Reg::Rdx, 1u64 << 63);
            self.asm.and_reg_reg(Reg::Rcx, Reg::Rdx, true);
            self.asm.or_reg_reg(Reg::Rax, Reg::Rcx, true);
        } else {
            self.asm.and_reg_imm32(Reg::Rax, 0x7fff_ffff, false);
            self.asm.and_reg_imm32(Reg::Rcx, 0x8000_0000, false);
            self.asm.or_reg_reg(Reg::Rax, Reg::Rcx, false);
        }
        self.push(Reg::Rax);
    }

    fn float_sqrt(&mut self, double: bool) {
        self.pop(Reg::Rax);
        self.asm.mov_xmm_reg(0, Reg::Rax, double);
        self.asm.sse_arith(Asm::SSE_SQRT, 0, 0, double);
        self.asm.mov_reg_xmm(Reg::Rax, 0, double);
        self.push(Reg::Rax);
    }

    // ---------------- the instruction dispatch ----------------

    fn instr(&mut self, instr: &Instr) -> Result<(), Error> {
        match instr {
            Instr::Unreachable => {
                let stub = self.trap_label(Trap::Unreachable);
                self.asm.jmp_label(stub);
                self.dead = true;
            }
            Instr::Nop => {}
            Instr::Block { ty, body } => self.block(*ty, body)?,
            Instr::Loop { ty, body } => self.loop_(*ty, body)?,
            Instr::If { ty, then, else_ } => self.if_(*ty, then, else_)?,
            Instr::Br { depth } => {
                self.emit_branch(*depth, self.depth)?;
                self.dead = true;
            }
            Instr::BrIf { depth } => {
                self.pop(Reg::Rax);
                self.asm.test_reg_reg(Reg::Rax, Reg::Rax, false);
                let skip = self.asm.new_label();
                self.asm.jcc_label(CC_E, skip);
                self.emit_branch(*depth, self.depth)?;
                self.asm.bind(skip);
            }
            Instr::BrTable { targets, default } => {
                self.pop(Reg::Rax);
                let depth_now = self.depth;
                let mut stubs = Vec::with_capacity(targets.len() + 1);
                for (i, target) in targets.iter().enumerate() {
                    let stub = self.asm.new_label();
                    self.asm.cmp_reg_imm32(Reg::Rax, i as i32, false);
                    self.asm.jcc_label(CC_E, stub);
                    stubs.push((stub, *target));
                }
                let default_stub = self.asm.new_label();
                self.asm.jmp_label(default_stub);
                stubs.push((default_stub, *default));
                for (stub, target) in stubs {
                    self.asm.bind(stub);
                    self.emit_branch(target, depth_now)?;
                }
                self.dead = true;
            }
            Instr::Return => {
                self.emit_branch(self.frames.len() as u32 - 1, self.depth)?;
                self.dead = true;
            }
            Instr::Call { func } => {
                let callee = self.ctx.funcs[*func as usize].clone();
                let ptr = Rc::as_ptr(&callee);
                self.emit_call(callee.ty(), Some(ptr));
            }
            Instr::CallIndirect { ty } => {
                let table = Rc::as_ptr(&self.ctx.tables[0]);
                let expected = &self.ctx.types[*ty as usize] as *const FuncType;
                self.pop(Reg::Rax);
                self.asm.mov_reg_reg(Reg::Rdx, Reg::Rax, false);
                self.asm.mov_reg_imm64(Reg::Rdi, table as u64);
                self.asm.mov_reg_imm64(Reg::Rsi, expected as u64);
                self.helper_call(wajit_resolve_indirect_call_raw as usize);
                self.asm.test_reg_reg(Reg::Rax, Reg::Rax, true);
                self.asm.jcc_label(CC_E, self.unwind);
                self.asm.mov_mem_reg(Reg::Rbp, SCRATCH_DISP, Reg::Rax, true);
                let expected = self.ctx.types[*ty as usize].clone();
                self.emit_call(&expected, None);
            }
            Instr::Drop => {
                self.asm.add_reg_imm32(Reg::Rsp, 8, true);
                self.depth -= 1;
            }
            Instr::Select => {
                self.pop(Reg::Rax);
                self.pop(Reg::Rcx);
                self.pop(Reg::Rdx);
                self.asm.test_reg_reg(Reg::Rax, Reg::Rax, false);
                // condition zero picks the second operand
                self.asm.cmovcc(CC_E, Reg::Rdx, Reg::Rcx, true);
                self.push(Reg::Rdx);
            }
            Instr::GetLocal(idx) => {
                self.asm.push_mem(Reg::Rbp, self.local_disp(*idx));
                self.depth += 1;
            }
            Instr::SetLocal(idx) => {
                self.asm.pop_mem(Reg::Rbp, self.local_disp(*idx));
                self.depth -= 1;
            }
            Instr::TeeLocal(idx) => {
                self.asm.mov_reg_mem(Reg::Rax, Reg::Rsp, 0, true);
                self.asm.mov_mem_reg(Reg::Rbp, self.local_disp(*idx), Reg::Rax, true);
            }
            Instr::GetGlobal(idx) => {
                let global = Rc::as_ptr(&self.ctx.globals[*idx as usize]);
                self.asm.mov_reg_imm64(Reg::Rax, global as u64);
                self.asm.push_mem(Reg::Rax, 0);
                self.depth += 1;
            }
            Instr::SetGlobal(idx) => {
                let global = Rc::as_ptr(&self.ctx.globals[*idx as usize]);
                self.asm.mov_reg_imm64(Reg::Rax, global as u64);
                self.asm.pop_mem(Reg::Rax, 0);
                self.depth -= 1;
            }
            Instr::Load(op, memarg) => self.load(*op, *memarg),
            Instr::Store(op, memarg) => self.store(*op, *memarg),
            Instr::MemorySize => {
                let mem = Rc::as_ptr(&self.ctx.mems[0]);
                self.asm.mov_reg_imm64(Reg::Rax, mem as u64);
                self.asm.mov_reg_mem(Reg::Rax, Reg::Rax, MEMINST_SIZE_OFFSET, true);
                self.asm.shr_imm8(Reg::Rax, 16, true);
                self.push(Reg::Rax);
            }
            Instr::MemoryGrow => {
                let mem = Rc::as_ptr(&self.ctx.mems[0]);
                self.pop(Reg::Rax);
                self.asm.mov_reg_reg(Reg::Rsi, Reg::Rax, false);
                self.asm.mov_reg_imm64(Reg::Rdi, mem as u64);
                self.helper_call(wajit_memory_grow as usize);
                self.push(Reg::Rax);
            }
            Instr::I32Const(v) => {
                self.asm.push_imm32(*v);
                self.depth += 1;
            }
            Instr::I64Const(v) => {
                if let Ok(small) = i32::try_from(*v) {
                    self.asm.push_imm32(small);
                } else {
                    self.asm.mov_reg_imm64(Reg::Rax, *v as u64);
                    self.asm.push_reg(Reg::Rax);
                }
                self.depth += 1;
            }
            Instr::F32Const(v) => {
                self.asm.push_imm32(v.to_bits() as i32);
                self.depth += 1;
            }
            Instr::F64Const(v) => {
                self.asm.mov_reg_imm64(Reg::Rax, v.to_bits());
                self.asm.push_reg(Reg::Rax);
                self.depth += 1;
            }
            Instr::Num(op) => self.num_op(*op),
        }
        Ok(())
    }

    fn num_op(&mut self, op: NumOp) {
        use NumOp::*;
        match op {
            // tests and comparisons
            I32Eqz | I64Eqz => {
                let wide = op == I64Eqz;
                self.pop(Reg::Rax);
                self.asm.test_reg_reg(Reg::Rax, Reg::Rax, wide);
                self.asm.setcc(CC_E, Reg::Rax);
                self.asm.movzx8(Reg::Rax, Reg::Rax);
                self.push(Reg::Rax);
            }
            I32Eq | I64Eq => self.int_cmp(CC_E, op == I64Eq),
            I32Ne | I64Ne => self.int_cmp(CC_NE, op == I64Ne),
            I32LtS | I64LtS => self.int_cmp(CC_L, op == I64LtS),
            I32LtU | I64LtU => self.int_cmp(CC_B, op == I64LtU),
            I32GtS | I64GtS => self.int_cmp(CC_G, op == I64GtS),
            I32GtU | I64GtU => self.int_cmp(CC_A, op == I64GtU),
            I32LeS | I64LeS => self.int_cmp(CC_LE, op == I64LeS),
            I32LeU | I64LeU => self.int_cmp(CC_BE, op == I64LeU),
            I32GeS | I64GeS => self.int_cmp(CC_GE, op == I64GeS),
            I32GeU | I64GeU => self.int_cmp(CC_AE, op == I64GeU),

            F32Eq => self.float_eq_ne(false, false),
            F32Ne => self.float_eq_ne(true, false),
            F64Eq => self.float_eq_ne(false, true),
            F64Ne => self.float_eq_ne(true, true),
            F32Lt => self.float_cmp(CC_A, true, false),
            F32Gt => self.float_cmp(CC_A, false, false),
            F32Le => self.float_cmp(CC_AE, true, false),
            F32Ge => self.float_cmp(CC_AE, false, false),
            F64Lt => self.float_cmp(CC_A, true, true),
            F64Gt => self.float_cmp(CC_A, false, true),
            F64Le => self.float_cmp(CC_AE, true, true),
            F64Ge => self.float_cmp(CC_AE, false, true),

            // integer arithmetic
            I32Add | I64Add => self.int_alu(Asm::add_reg_reg, op == I64Add),
            I32Sub | I64Sub => self.int_alu(Asm::sub_reg_reg, op == I64Sub),
            I32And | I64And => self.int_alu(Asm::and_reg_reg, op == I64And),
            I32Or | I64Or => self.int_alu(Asm::or_reg_reg, op == I64Or),
            I32Xor | I64Xor => self.int_alu(Asm::xor_reg_reg, op == I64Xor),
            I32Mul | I64Mul => {
                let wide = op == I64Mul;
                self.pop(Reg::Rcx);
                self.pop(Reg::Rax);
                self.asm.imul_reg_reg(Reg::Rax, Reg::Rcx, wide);
                self.push(Reg::Rax);
            }
            I32DivS => self.int_div(false, true, false),
            I32DivU => self.int_div(false, false, false),
            I32RemS => self.int_div(false, true, true),
            I32RemU => self.int_div(false, false, true),
            I64DivS => self.int_div(true, true, false),
            I64DivU => self.int_div(true, false, false),
            I64RemS => self.int_div(true, true, true),
            I64RemU => self.int_div(true, false, true),

            I32Shl | I64Shl => self.int_shift(4, op == I64Shl),
            I32ShrS | I64ShrS => self.int_shift(7, op == I64ShrS),
            I32ShrU | I64ShrU => self.int_shift(5, op == I64ShrU),
            I32Rotl | I64Rotl => self.int_shift(0, op == I64Rotl),
            I32Rotr | I64Rotr => self.int_shift(1, op == I64Rotr),

            I32Clz => self.helper_unop_int(wajit_i32_clz as usize),
            I32Ctz => self.helper_unop_int(wajit_i32_ctz as usize),
            I32Popcnt => self.helper_unop_int(wajit_i32_popcnt as usize),
            I64Clz => self.helper_unop_int(wajit_i64_clz as usize),
            I64Ctz => self.helper_unop_int(wajit_i64_ctz as usize),
            I64Popcnt => self.helper_unop_int(wajit_i64_popcnt as usize),

            // float arithmetic
            F32Add => self.float_arith(Asm::SSE_ADD, false),
            F32Sub => self.float_arith(Asm::SSE_SUB, false),
            F32Mul => self.float_arith(Asm::SSE_MUL, false),
            F32Div => self.float_arith(Asm::SSE_DIV, false),
            F64Add => self.float_arith(Asm::SSE_ADD, true),
            F64Sub => self.float_arith(Asm::SSE_SUB, true),
            F64Mul => self.float_arith(Asm::SSE_MUL, true),
            F64Div => self.float_arith(Asm::SSE_DIV, true),
            F32Sqrt => self.float_sqrt(false),
            F64Sqrt => self.float_sqrt(true),
            F32Abs => self.float_sign_unop(true, false),
            F32Neg => self.float_sign_unop(false, false),
            F64Abs => self.float_sign_unop(true, true),
            F64Neg => self.float_sign_unop(false, true),
            F32Copysign => self.float_copysign(false),
            F64Copysign => self.float_copysign(true),
            F32Min => self.helper_binop_float(wajit_f32_min as usize, false),
            F32Max => self.helper_binop_float(wajit_f32_max as usize, false),
            F64Min => self.helper_binop_float(wajit_f64_min as usize, true),
            F64Max => self.helper_binop_float(wajit_f64_max as usize, true),
            F32Ceil => self.helper_unop_float(wajit_f32_ceil as usize, false),
            F32Floor => self.helper_unop_float(wajit_f32_floor as usize, false),
            F32Trunc => self.helper_unop_float(wajit_f32_trunc as usize, false),
            F32Nearest => self.helper_unop_float(wajit_f32_nearest as usize, false),
            F64Ceil => self.helper_unop_float(wajit_f64_ceil as usize, true),
            F64Floor => self.helper_unop_float(wajit_f64_floor as usize, true),
            F64Trunc => self.helper_unop_float(wajit_f64_trunc as usize, true),
            F64Nearest => self.helper_unop_float(wajit_f64_nearest as usize, true),

            // conversions
            I32WrapI64 => {
                self.pop(Reg::Rax);
                self.asm.zero_extend_32(Reg::Rax);
                self.push(Reg::Rax);
            }
            I64ExtendSI32 => {
                self.pop(Reg::Rax);
                self.asm.movsxd(Reg::Rax, Reg::Rax);
                self.push(Reg::Rax);
            }
            I64ExtendUI32 => {
                self.pop(Reg::Rax);
                self.asm.zero_extend_32(Reg::Rax);
                self.push(Reg::Rax);
            }
            I32TruncSF32 => self.helper_trunc(wajit_i32_trunc_f32_s as usize, false),
            I32TruncUF32 => self.helper_trunc(wajit_i32_trunc_f32_u as usize, false),
            I32TruncSF64 => self.helper_trunc(wajit_i32_trunc_f64_s as usize, true),
            I32TruncUF64 => self.helper_trunc(wajit_i32_trunc_f64_u as usize, true),
            I64TruncSF32 => self.helper_trunc(wajit_i64_trunc_f32_s as usize, false),
            I64TruncUF32 => self.helper_trunc(wajit_i64_trunc_f32_u as usize, false),
            I64TruncSF64 => self.helper_trunc(wajit_i64_trunc_f64_s as usize, true),
            I64TruncUF64 => self.helper_trunc(wajit_i64_trunc_f64_u as usize, true),

            F32ConvertSI32 => self.convert_int_to_float(false, false, true),
            F32ConvertUI32 => self.convert_int_to_float(false, false, false),
            F64ConvertSI32 => self.convert_int_to_float(true, false, true),
            F64ConvertUI32 => self.convert_int_to_float(true, false, false),
            F32ConvertSI64 => self.convert_int_to_float(false, true, true),
            F64ConvertSI64 => self.convert_int_to_float(true, true, true),
            F32ConvertUI64 => self.helper_convert_u64(wajit_f32_convert_u64 as usize, false),
            F64ConvertUI64 => self.helper_convert_u64(wajit_f64_convert_u64 as usize, true),

            F32DemoteF64 => {
                self.pop(Reg::Rax);
                self.asm.mov_xmm_reg(0, Reg::Rax, true);
                self.asm.cvt_float_float(0, 0, true);
                self.asm.mov_reg_xmm(Reg::Rax, 0, false);
                self.push(Reg::Rax);
            }
            F64PromoteF32 => {
                self.pop(Reg::Rax);
                self.asm.mov_xmm_reg(0, Reg::Rax, false);
                self.asm.cvt_float_float(0, 0, false);
                self.asm.mov_reg_xmm(Reg::Rax, 0, true);
                self.push(Reg::Rax);
            }

            // reinterpretations move raw bits between equally-sized slots;
            // the slot already holds exactly those bits
            I32ReinterpretF32 | I64ReinterpretF64 | F32ReinterpretI32 | F64ReinterpretI64 => {}
        }
    }

    fn convert_int_to_float(&mut self, to_double: bool, from_64: bool, signed: bool) {
        self.pop(Reg::Rax);
        if from_64 {
            debug_assert!(signed, "u64 conversions go through a helper");
            self.asm.cvtsi2(0, Reg::Rax, to_double, true);
        } else if signed {
            self.asm.cvtsi2(0, Reg::Rax, to_double, false);
        } else {
            // a zero-extended u32 is a non-negative i64
            self.asm.zero_extend_32(Reg::Rax);
            self.asm.cvtsi2(0, Reg::Rax, to_double, true);
        }
        self.asm.mov_reg_xmm(Reg::Rax, 0, to_double);
        self.push(Reg::Rax);
    }

    fn helper_convert_u64(&mut self, helper: usize, to_double: bool) {
        self.pop(Reg::Rax);
        self.asm.mov_reg_reg(Reg::Rdi, Reg::Rax, true);
        self.helper_call(helper);
        self.asm.mov_reg_xmm(Reg::Rax, 0, to_double);
        self.push(Reg::Rax);
    }
}
