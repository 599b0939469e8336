//! Minimal x86-64 instruction emitter for the JIT.
//!
//! Emits into a plain byte buffer with rel32 label fixups; the result is
//! position-independent as long as all external references go through
//! absolute addresses materialized with `mov_reg_imm64`.

use nohash_hasher::IntMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
}

impl Reg {
    #[inline]
    fn low(self) -> u8 { self as u8 & 7 }
    #[inline]
    fn ext(self) -> bool { self as u8 >= 8 }
}

/// SysV integer argument registers, in order.
pub const INT_ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
/// Number of SysV SSE argument registers (xmm0..xmm7).
pub const N_SSE_ARG_REGS: usize = 8;

// Condition codes (the low nibble of the 0F 8x / 0F 9x opcode families).
pub const CC_B: u8 = 0x2; // unsigned <
pub const CC_AE: u8 = 0x3; // unsigned >=
pub const CC_E: u8 = 0x4;
pub const CC_NE: u8 = 0x5;
pub const CC_BE: u8 = 0x6; // unsigned <=
pub const CC_A: u8 = 0x7; // unsigned >
pub const CC_P: u8 = 0xa;
pub const CC_NP: u8 = 0xb;
pub const CC_L: u8 = 0xc;
pub const CC_GE: u8 = 0xd;
pub const CC_LE: u8 = 0xe;
pub const CC_G: u8 = 0xf;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Label(u32);

pub struct Asm {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    /// label id -> rel32 patch sites (offset of the 4-byte field)
    fixups: IntMap<u32, Vec<usize>>,
}

impl Asm {
    pub fn new() -> Self {
        Self { code: Vec::with_capacity(256), labels: Vec::new(), fixups: IntMap::default() }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0 as usize].is_none(), "label bound twice");
        self.labels[label.0 as usize] = Some(self.code.len());
    }

    pub fn label_referenced(&self, label: Label) -> bool {
        self.fixups.get(&label.0).is_some_and(|v| !v.is_empty())
    }

    /// Patches every recorded rel32 and returns the finished blob.
    pub fn finish(mut self) -> Vec<u8> {
        for (label, sites) in &self.fixups {
            let target = self.labels[*label as usize].expect("unbound label referenced");
            for site in sites {
                let rel = target as i64 - (*site as i64 + 4);
                let rel32 = i32::try_from(rel).expect("jump distance overflow");
                self.code[*site..*site + 4].copy_from_slice(&rel32.to_le_bytes());
            }
        }
        self.code
    }

    // ---------------- raw emission ----------------

    #[inline]
    fn u8(&mut self, b: u8) {
        self.code.push(b);
    }

    #[inline]
    fn u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    #[inline]
    fn u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    /// REX prefix; emitted only when a bit is set (or forced).
    #[inline]
    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let byte = 0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | b as u8;
        if byte != 0x40 {
            self.u8(byte);
        }
    }

    #[inline]
    fn rex_force(&mut self, w: bool, r: bool, x: bool, b: bool) {
        self.u8(0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | b as u8);
    }

    /// ModRM (+SIB +disp) for a register operand and a `[base + disp]`
    /// memory operand.
    fn modrm_mem(&mut self, reg_low: u8, base: Reg, disp: i32) {
        let need_sib = base.low() == 4; // rsp/r12
        let mode = if disp == 0 && base.low() != 5 {
            0u8
        } else if (-128..=127).contains(&disp) {
            1u8
        } else {
            2u8
        };
        let rm = if need_sib { 4 } else { base.low() };
        self.u8(mode << 6 | reg_low << 3 | rm);
        if need_sib {
            self.u8(0x24); // scale 0, no index, base rsp/r12
        }
        match mode {
            0 => {}
            1 => self.u8(disp as i8 as u8),
            _ => self.u32(disp as u32),
        }
    }

    /// ModRM+SIB for `[base + index]` (scale 1, no displacement).
    fn modrm_mem_idx(&mut self, reg_low: u8, base: Reg, index: Reg) {
        debug_assert!(index != Reg::Rsp, "rsp cannot be an index");
        if base.low() == 5 {
            // rbp/r13 base needs an explicit disp8 of zero
            self.u8(1 << 6 | reg_low << 3 | 4);
            self.u8(index.low() << 3 | base.low());
            self.u8(0);
        } else {
            self.u8(reg_low << 3 | 4);
            self.u8(index.low() << 3 | base.low());
        }
    }

    #[inline]
    fn modrm_reg(&mut self, reg_low: u8, rm: Reg) {
        self.u8(0xc0 | reg_low << 3 | rm.low());
    }

    // ---------------- moves ----------------

    pub fn push_reg(&mut self, reg: Reg) {
        self.rex(false, false, false, reg.ext());
        self.u8(0x50 + reg.low());
    }

    pub fn pop_reg(&mut self, reg: Reg) {
        self.rex(false, false, false, reg.ext());
        self.u8(0x58 + reg.low());
    }

    /// push imm32 (sign-extended to 64 bits on the stack).
    pub fn push_imm32(&mut self, imm: i32) {
        self.u8(0x68);
        self.u32(imm as u32);
    }

    /// push qword [base + disp]
    pub fn push_mem(&mut self, base: Reg, disp: i32) {
        self.rex(false, false, false, base.ext());
        self.u8(0xff);
        self.modrm_mem(6, base, disp);
    }

    /// pop qword [base + disp]
    pub fn pop_mem(&mut self, base: Reg, disp: i32) {
        self.rex(false, false, false, base.ext());
        self.u8(0x8f);
        self.modrm_mem(0, base, disp);
    }

    pub fn mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        self.rex_force(true, false, false, reg.ext());
        self.u8(0xb8 + reg.low());
        self.u64(imm);
    }

    /// mov r32, imm32 (zero-extends).
    pub fn mov_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.rex(false, false, false, reg.ext());
        self.u8(0xb8 + reg.low());
        self.u32(imm);
    }

    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg, wide: bool) {
        self.rex(wide, src.ext(), false, dst.ext());
        self.u8(0x89);
        self.modrm_reg(src.low(), dst);
    }

    /// mov reg, qword/dword [base + disp]; the dword form zero-extends.
    pub fn mov_reg_mem(&mut self, dst: Reg, base: Reg, disp: i32, wide: bool) {
        self.rex(wide, dst.ext(), false, base.ext());
        self.u8(0x8b);
        self.modrm_mem(dst.low(), base, disp);
    }

    pub fn mov_mem_reg(&mut self, base: Reg, disp: i32, src: Reg, wide: bool) {
        self.rex(wide, src.ext(), false, base.ext());
        self.u8(0x89);
        self.modrm_mem(src.low(), base, disp);
    }

    /// Loads from `[base + index]` zero- or sign-extending `width` bytes
    /// into a 64-bit destination.
    pub fn load_idx(&mut self, dst: Reg, base: Reg, index: Reg, width: u32, signed: bool) {
        match (width, signed) {
            (1, false) => {
                self.rex(false, dst.ext(), index.ext(), base.ext());
                self.u8(0x0f);
                self.u8(0xb6);
            }
            (1, true) => {
                self.rex(true, dst.ext(), index.ext(), base.ext());
                self.u8(0x0f);
                self.u8(0xbe);
            }
            (2, false) => {
                self.rex(false, dst.ext(), index.ext(), base.ext());
                self.u8(0x0f);
                self.u8(0xb7);
            }
            (2, true) => {
                self.rex(true, dst.ext(), index.ext(), base.ext());
                self.u8(0x0f);
                self.u8(0xbf);
            }
            (4, false) => {
                self.rex(false, dst.ext(), index.ext(), base.ext());
                self.u8(0x8b);
            }
            (4, true) => {
                // movsxd
                self.rex_force(true, dst.ext(), index.ext(), base.ext());
                self.u8(0x63);
            }
            (8, _) => {
                self.rex(true, dst.ext(), index.ext(), base.ext());
                self.u8(0x8b);
            }
            _ => unreachable!("bad load width"),
        }
        self.modrm_mem_idx(dst.low(), base, index);
    }

    /// Stores the low `width` bytes of `src` to `[base + index]`.
    pub fn store_idx(&mut self, base: Reg, index: Reg, src: Reg, width: u32) {
        match width {
            1 => {
                // force REX so sil/dil are addressable uniformly
                self.rex_force(false, src.ext(), index.ext(), base.ext());
                self.u8(0x88);
            }
            2 => {
                self.u8(0x66);
                self.rex(false, src.ext(), index.ext(), base.ext());
                self.u8(0x89);
            }
            4 => {
                self.rex(false, src.ext(), index.ext(), base.ext());
                self.u8(0x89);
            }
            8 => {
                self.rex(true, src.ext(), index.ext(), base.ext());
                self.u8(0x89);
            }
            _ => unreachable!("bad store width"),
        }
        self.modrm_mem_idx(src.low(), base, index);
    }

    /// movsxd dst64, src32
    pub fn movsxd(&mut self, dst: Reg, src: Reg) {
        self.rex_force(true, dst.ext(), false, src.ext());
        self.u8(0x63);
        self.modrm_reg(dst.low(), src);
    }

    /// mov dst32, src32 as an explicit zero-extension of the low half.
    pub fn zero_extend_32(&mut self, reg: Reg) {
        self.mov_reg_reg(reg, reg, false);
    }

    // ---------------- ALU ----------------

    fn alu_reg_reg(&mut self, opcode: u8, dst: Reg, src: Reg, wide: bool) {
        self.rex(wide, src.ext(), false, dst.ext());
        self.u8(opcode);
        self.modrm_reg(src.low(), dst);
    }

    pub fn add_reg_reg(&mut self, dst: Reg, src: Reg, wide: bool) {
        self.alu_reg_reg(0x01, dst, src, wide);
    }
    pub fn sub_reg_reg(&mut self, dst: Reg, src: Reg, wide: bool) {
        self.alu_reg_reg(0x29, dst, src, wide);
    }
    pub fn and_reg_reg(&mut self, dst: Reg, src: Reg, wide: bool) {
        self.alu_reg_reg(0x21, dst, src, wide);
    }
    pub fn or_reg_reg(&mut self, dst: Reg, src: Reg, wide: bool) {
        self.alu_reg_reg(0x09, dst, src, wide);
    }
    pub fn xor_reg_reg(&mut self, dst: Reg, src: Reg, wide: bool) {
        self.alu_reg_reg(0x31, dst, src, wide);
    }
    pub fn cmp_reg_reg(&mut self, a: Reg, b: Reg, wide: bool) {
        self.alu_reg_reg(0x39, a, b, wide);
    }
    pub fn test_reg_reg(&mut self, a: Reg, b: Reg, wide: bool) {
        self.rex(wide, b.ext(), false, a.ext());
        self.u8(0x85);
        self.modrm_reg(b.low(), a);
    }

    pub fn imul_reg_reg(&mut self, dst: Reg, src: Reg, wide: bool) {
        self.rex(wide, dst.ext(), false, src.ext());
        self.u8(0x0f);
        self.u8(0xaf);
        self.modrm_reg(dst.low(), src);
    }

    fn alu_reg_imm32(&mut self, ext: u8, reg: Reg, imm: u32, wide: bool) {
        self.rex(wide, false, false, reg.ext());
        self.u8(0x81);
        self.modrm_reg(ext, reg);
        self.u32(imm);
    }

    pub fn add_reg_imm32(&mut self, reg: Reg, imm: i32, wide: bool) {
        self.alu_reg_imm32(0, reg, imm as u32, wide);
    }
    pub fn sub_reg_imm32(&mut self, reg: Reg, imm: i32, wide: bool) {
        self.alu_reg_imm32(5, reg, imm as u32, wide);
    }
    pub fn and_reg_imm32(&mut self, reg: Reg, imm: u32, wide: bool) {
        self.alu_reg_imm32(4, reg, imm, wide);
    }
    pub fn xor_reg_imm32(&mut self, reg: Reg, imm: u32, wide: bool) {
        self.alu_reg_imm32(6, reg, imm, wide);
    }
    pub fn cmp_reg_imm32(&mut self, reg: Reg, imm: i32, wide: bool) {
        self.alu_reg_imm32(7, reg, imm as u32, wide);
    }

    /// cmp reg, imm8 (sign-extended)
    pub fn cmp_reg_imm8(&mut self, reg: Reg, imm: i8, wide: bool) {
        self.rex(wide, false, false, reg.ext());
        self.u8(0x83);
        self.modrm_reg(7, reg);
        self.u8(imm as u8);
    }

    pub fn cdq(&mut self) {
        self.u8(0x99);
    }

    pub fn cqo(&mut self) {
        self.u8(0x48);
        self.u8(0x99);
    }

    pub fn div_reg(&mut self, reg: Reg, wide: bool) {
        self.rex(wide, false, false, reg.ext());
        self.u8(0xf7);
        self.modrm_reg(6, reg);
    }

    pub fn idiv_reg(&mut self, reg: Reg, wide: bool) {
        self.rex(wide, false, false, reg.ext());
        self.u8(0xf7);
        self.modrm_reg(7, reg);
    }

    /// Shift/rotate by cl. `ext`: 0=rol 1=ror 4=shl 5=shr 7=sar.
    pub fn shift_cl(&mut self, ext: u8, reg: Reg, wide: bool) {
        self.rex(wide, false, false, reg.ext());
        self.u8(0xd3);
        self.modrm_reg(ext, reg);
    }

    pub fn shr_imm8(&mut self, reg: Reg, imm: u8, wide: bool) {
        self.rex(wide, false, false, reg.ext());
        self.u8(0xc1);
        self.modrm_reg(5, reg);
        self.u8(imm);
    }

    pub fn lea(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex_force(true, dst.ext(), false, base.ext());
        self.u8(0x8d);
        self.modrm_mem(dst.low(), base, disp);
    }

    /// and rsp, imm8 (stack realignment before noreturn helper calls)
    pub fn and_rsp_imm8(&mut self, imm: i8) {
        self.u8(0x48);
        self.u8(0x83);
        self.modrm_reg(4, Reg::Rsp);
        self.u8(imm as u8);
    }

    // ---------------- flags ----------------

    /// setcc on an 8-bit register (use rax..rdx only).
    pub fn setcc(&mut self, cc: u8, reg: Reg) {
        debug_assert!((reg as u8) < 4);
        self.u8(0x0f);
        self.u8(0x90 + cc);
        self.modrm_reg(0, reg);
    }

    /// movzx dst32, src8 (use rax..rdx only).
    pub fn movzx8(&mut self, dst: Reg, src: Reg) {
        debug_assert!((src as u8) < 4);
        self.rex(false, dst.ext(), false, false);
        self.u8(0x0f);
        self.u8(0xb6);
        self.modrm_reg(dst.low(), src);
    }

    /// and dst8, src8 (use rax..rdx only).
    pub fn and8(&mut self, dst: Reg, src: Reg) {
        self.u8(0x20);
        self.modrm_reg(src.low(), dst);
    }

    /// or dst8, src8 (use rax..rdx only).
    pub fn or8(&mut self, dst: Reg, src: Reg) {
        self.u8(0x08);
        self.modrm_reg(src.low(), dst);
    }

    pub fn cmovcc(&mut self, cc: u8, dst: Reg, src: Reg, wide: bool) {
        self.rex(wide, dst.ext(), false, src.ext());
        self.u8(0x0f);
        self.u8(0x40 + cc);
        self.modrm_reg(dst.low(), src);
    }

    // ---------------- control flow ----------------

    pub fn jmp_label(&mut self, label: Label) {
        self.u8(0xe9);
        self.fixups.entry(label.0).or_default().push(self.code.len());
        self.u32(0);
    }

    pub fn jcc_label(&mut self, cc: u8, label: Label) {
        self.u8(0x0f);
        self.u8(0x80 + cc);
        self.fixups.entry(label.0).or_default().push(self.code.len());
        self.u32(0);
    }

    pub fn call_reg(&mut self, reg: Reg) {
        self.rex(false, false, false, reg.ext());
        self.u8(0xff);
        self.modrm_reg(2, reg);
    }

    pub fn ret(&mut self) {
        self.u8(0xc3);
    }

    pub fn leave(&mut self) {
        self.u8(0xc9);
    }

    pub fn pause(&mut self) {
        self.u8(0xf3);
        self.u8(0x90);
    }

    pub fn lfence(&mut self) {
        self.u8(0x0f);
        self.u8(0xae);
        self.u8(0xe8);
    }

    /// call rel32 to a local label.
    pub fn call_label(&mut self, label: Label) {
        self.u8(0xe8);
        self.fixups.entry(label.0).or_default().push(self.code.len());
        self.u32(0);
    }

    /// Out-of-line retpoline thunk body for indirect calls through `reg`.
    /// Call sites `call` the bound label instead of `call reg`; the thunk
    /// swaps the speculation-trapping return address for the real target.
    pub fn emit_retpoline_thunk(&mut self, thunk: Label, reg: Reg) {
        self.bind(thunk);
        let set_up = self.new_label();
        let capture = self.new_label();
        self.call_label(set_up);
        self.bind(capture);
        self.pause();
        self.lfence();
        self.jmp_label(capture);
        self.bind(set_up);
        // mov [rsp], reg
        self.rex(true, reg.ext(), false, false);
        self.u8(0x89);
        self.modrm_mem(reg.low(), Reg::Rsp, 0);
        self.ret();
    }

    // ---------------- SSE ----------------

    fn sse_prefix_op(&mut self, prefix: u8, opcode: u8, xmm: u8, rm: Reg, wide: bool) {
        self.u8(prefix);
        self.rex(wide, xmm >= 8, false, rm.ext());
        self.u8(0x0f);
        self.u8(opcode);
        self.modrm_reg(xmm & 7, rm);
    }

    /// movq xmm, r64 / movd xmm, r32
    pub fn mov_xmm_reg(&mut self, xmm: u8, reg: Reg, wide: bool) {
        self.sse_prefix_op(0x66, 0x6e, xmm, reg, wide);
    }

    /// movq r64, xmm / movd r32, xmm
    pub fn mov_reg_xmm(&mut self, reg: Reg, xmm: u8, wide: bool) {
        self.sse_prefix_op(0x66, 0x7e, xmm, reg, wide);
    }

    /// movss/movsd xmm, [base + disp]
    pub fn load_xmm(&mut self, xmm: u8, base: Reg, disp: i32, double: bool) {
        self.u8(if double { 0xf2 } else { 0xf3 });
        self.rex(false, xmm >= 8, false, base.ext());
        self.u8(0x0f);
        self.u8(0x10);
        self.modrm_mem(xmm & 7, base, disp);
    }

    /// movss/movsd [base + disp], xmm
    pub fn store_xmm(&mut self, base: Reg, disp: i32, xmm: u8, double: bool) {
        self.u8(if double { 0xf2 } else { 0xf3 });
        self.rex(false, xmm >= 8, false, base.ext());
        self.u8(0x0f);
        self.u8(0x11);
        self.modrm_mem(xmm & 7, base, disp);
    }

    fn sse_xmm_xmm(&mut self, prefix: Option<u8>, opcode: u8, dst: u8, src: u8) {
        if let Some(p) = prefix {
            self.u8(p);
        }
        self.rex(false, dst >= 8, false, src >= 8);
        self.u8(0x0f);
        self.u8(opcode);
        self.u8(0xc0 | (dst & 7) << 3 | (src & 7));
    }

    /// addss/addsd, subss/subsd, mulss/mulsd, divss/divsd, sqrtss/sqrtsd
    pub fn sse_arith(&mut self, opcode: u8, dst: u8, src: u8, double: bool) {
        self.sse_xmm_xmm(Some(if double { 0xf2 } else { 0xf3 }), opcode, dst, src);
    }

    pub const SSE_ADD: u8 = 0x58;
    pub const SSE_MUL: u8 = 0x59;
    pub const SSE_SUB: u8 = 0x5c;
    pub const SSE_DIV: u8 = 0x5e;
    pub const SSE_SQRT: u8 = 0x51;

    /// ucomiss/ucomisd a, b
    pub fn ucomis(&mut self, a: u8, b: u8, double: bool) {
        if double {
            self.sse_xmm_xmm(Some(0x66), 0x2e, a, b);
        } else {
            self.sse_xmm_xmm(None, 0x2e, a, b);
        }
    }

    /// cvtsi2ss/cvtsi2sd xmm, r32/r64
    pub fn cvtsi2(&mut self, xmm: u8, reg: Reg, double: bool, wide: bool) {
        self.u8(if double { 0xf2 } else { 0xf3 });
        self.rex(wide, xmm >= 8, false, reg.ext());
        self.u8(0x0f);
        self.u8(0x2a);
        self.modrm_reg(xmm & 7, reg);
    }

    /// cvtss2sd (double=false: from f32) / cvtsd2ss (double=true: from f64)
    pub fn cvt_float_float(&mut self, dst: u8, src: u8, from_double: bool) {
        self.sse_xmm_xmm(Some(if from_double { 0xf2 } else { 0xf3 }), 0x5a, dst, src);
    }
}
