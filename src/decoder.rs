//! Binary-format decoder: bytes in, [`ast::Module`] out.
//!
//! Structural well-formedness is enforced here (magic/version, section
//! ordering and sizes, UTF-8 names, value-type bytes, count consistency);
//! index bounds and typing are the validator's job.

use crate::ast::*;
use crate::byte_iter::ByteIter;
use crate::debug_println;
use crate::error::*;
use crate::types::*;

const MAGIC_HEADER: &[u8; 4] = b"\0asm";
const BINARY_VERSION: u32 = 1;

/// Deepest allowed block/loop/if nesting while decoding one body.
const MAX_NESTING: usize = 1024;
/// Most locals one function may declare, parameters included.
pub const MAX_LOCALS: usize = 50000;

pub fn decode(bytes: &[u8]) -> Result<Module, Error> {
    if bytes.len() < 8 {
        return malformed(UNEXPECTED_END);
    }
    if &bytes[0..4] != MAGIC_HEADER {
        return malformed(NO_MAGIC_HEADER);
    }
    if u32::from_le_bytes(bytes[4..8].try_into().unwrap()) != BINARY_VERSION {
        return malformed(UNKNOWN_BINARY_VERSION);
    }

    let mut it = ByteIter::new(bytes, 8);
    let mut module = Module::default();
    let mut last_id: u8 = 0;

    while !it.empty() {
        let id = it.read_u8()?;
        let size = it.read_u32()? as usize;
        if !it.has_n_left(size) {
            return malformed(UNEXPECTED_END);
        }
        if id == 0 {
            // custom section, skipped wholesale
            it.advance(size);
            continue;
        }
        if id > 11 {
            return malformed(INVALID_SECTION_ID);
        }
        if id <= last_id {
            return malformed(SECTION_OUT_OF_ORDER);
        }
        last_id = id;

        let section_start = it.cur();
        match id {
            1 => parse_type_section(&mut it, &mut module)?,
            2 => parse_import_section(&mut it, &mut module)?,
            3 => parse_function_section(&mut it, &mut module)?,
            4 => parse_table_section(&mut it, &mut module)?,
            5 => parse_memory_section(&mut it, &mut module)?,
            6 => parse_global_section(&mut it, &mut module)?,
            7 => parse_export_section(&mut it, &mut module)?,
            8 => parse_start_section(&mut it, &mut module)?,
            9 => parse_element_section(&mut it, &mut module)?,
            10 => parse_code_section(&mut it, &mut module)?,
            11 => parse_data_section(&mut it, &mut module)?,
            _ => unreachable!(),
        }
        if it.cur() - section_start != size {
            return malformed(SECTION_SIZE_MISMATCH);
        }
    }

    if module.code.len() != module.functions.len() {
        return malformed(FUNC_CODE_INCONSISTENT);
    }
    debug_println!(
        "decoded module: {} types, {} imports, {} functions",
        module.types.len(),
        module.imports.len(),
        module.functions.len()
    );
    Ok(module)
}

fn read_valtype(it: &mut ByteIter) -> Result<ValType, Error> {
    ValType::from_byte(it.read_u8()?).ok_or(Error::Malformed(INVALID_VALUE_TYPE))
}

fn read_limits(it: &mut ByteIter) -> Result<Limits, Error> {
    let flags = it.read_var(1)?;
    let min = it.read_u32()?;
    let max = if flags == 1 { Some(it.read_u32()?) } else { None };
    Ok(Limits { min, max })
}

fn read_global_type(it: &mut ByteIter) -> Result<GlobalType, Error> {
    let ty = ValType::from_byte(it.read_u8()?).ok_or(Error::Malformed(INVALID_GLOBAL_TYPE))?;
    let mutability = Mut::from_byte(it.read_u8()?).ok_or(Error::Malformed(INVALID_MUTABILITY))?;
    Ok(GlobalType { ty, mutability })
}

fn read_table_type(it: &mut ByteIter) -> Result<TableType, Error> {
    if it.read_u8()? != ELEM_TYPE_FUNCREF {
        return malformed(MALFORMED_REF_TYPE);
    }
    let limits = read_limits(it)?;
    check_table_limits(&limits)?;
    Ok(TableType { limits })
}

fn read_memory_type(it: &mut ByteIter) -> Result<MemoryType, Error> {
    let limits = read_limits(it)?;
    check_memory_limits(&limits)?;
    Ok(MemoryType { limits })
}

fn parse_type_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    let n_types = it.read_u32()?;
    module.types.reserve(n_types as usize);
    for _ in 0..n_types {
        if it.read_u8()? != 0x60 {
            return malformed(INVALID_FUNC_TYPE_TAG);
        }
        let n_params = it.read_u32()? as usize;
        if n_params > FUNC_TYPE_MAX_INPUTS {
            return malformed(TOO_MANY_PARAMS);
        }
        let mut params = Vec::with_capacity(n_params);
        for _ in 0..n_params {
            params.push(read_valtype(it)?);
        }
        let n_results = it.read_u32()?;
        if n_results > 1 {
            return malformed(INVALID_RESULT_ARITY);
        }
        let result = if n_results == 1 { Some(read_valtype(it)?) } else { None };
        module.types.push(FuncType::new(params, result));
    }
    Ok(())
}

fn parse_import_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    let n_imports = it.read_u32()?;
    for _ in 0..n_imports {
        let module_name = it.read_name()?;
        let name = it.read_name()?;
        let kind = ExternKind::from_byte(it.read_u8()?)
            .ok_or(Error::Malformed(MALFORMED_IMPORT_KIND))?;
        let desc = match kind {
            ExternKind::Func => ImportDesc::Func(it.read_u32()?),
            ExternKind::Table => ImportDesc::Table(read_table_type(it)?),
            ExternKind::Mem => ImportDesc::Mem(read_memory_type(it)?),
            ExternKind::Global => ImportDesc::Global(read_global_type(it)?),
        };
        module.imports.push(Import { module: module_name, name, desc });
    }
    Ok(())
}

fn parse_function_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    let n_functions = it.read_u32()?;
    module.functions.reserve(n_functions as usize);
    for _ in 0..n_functions {
        module.functions.push(it.read_u32()?);
    }
    Ok(())
}

fn parse_table_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    let n_tables = it.read_u32()?;
    for _ in 0..n_tables {
        module.tables.push(read_table_type(it)?);
    }
    Ok(())
}

fn parse_memory_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    let n_memories = it.read_u32()?;
    for _ in 0..n_memories {
        module.memories.push(read_memory_type(it)?);
    }
    Ok(())
}

fn parse_global_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    let n_globals = it.read_u32()?;
    for _ in 0..n_globals {
        let ty = read_global_type(it)?;
        let init = decode_expr(it)?;
        module.globals.push(GlobalDef { ty, init });
    }
    Ok(())
}

fn parse_export_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    let n_exports = it.read_u32()?;
    for _ in 0..n_exports {
        let name = it.read_name()?;
        let kind = ExternKind::from_byte(it.read_u8()?)
            .ok_or(Error::Malformed(MALFORMED_IMPORT_KIND))?;
        let idx = it.read_u32()?;
        module.exports.push(ExportEntry { name, kind, idx });
    }
    Ok(())
}

fn parse_start_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    module.start = Some(it.read_u32()?);
    Ok(())
}

fn parse_element_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    let n_segments = it.read_u32()?;
    for _ in 0..n_segments {
        let tableidx = it.read_u32()?;
        let offset = decode_expr(it)?;
        let n_funcs = it.read_u32()? as usize;
        let mut funcidxs = Vec::with_capacity(n_funcs);
        for _ in 0..n_funcs {
            funcidxs.push(it.read_u32()?);
        }
        module.elements.push(ElemSegment { tableidx, offset, funcidxs });
    }
    Ok(())
}

fn parse_code_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    let n_bodies = it.read_u32()?;
    for func_i in 0..n_bodies {
        let body_size = it.read_u32()? as usize;
        let body_start = it.cur();
        if !it.has_n_left(body_size) {
            return malformed(UNEXPECTED_END);
        }

        let n_params = module
            .functions
            .get(func_i as usize)
            .and_then(|ti| module.types.get(*ti as usize))
            .map(|ty| ty.params.len())
            .unwrap_or(0);

        let mut locals = Vec::new();
        let n_decls = it.read_u32()?;
        for _ in 0..n_decls {
            let count = it.read_u32()? as usize;
            let ty = read_valtype(it)?;
            if locals.len() + count + n_params > MAX_LOCALS {
                return malformed(TOO_MANY_LOCALS);
            }
            locals.extend(std::iter::repeat(ty).take(count));
        }

        let (body, terminator) = decode_instr_seq(it, 0)?;
        if terminator != Terminator::End {
            return malformed(END_EXPECTED);
        }
        if it.cur() - body_start != body_size {
            return malformed(SECTION_SIZE_MISMATCH);
        }
        module.code.push(FuncBody { locals, body });
    }
    Ok(())
}

fn parse_data_section(it: &mut ByteIter, module: &mut Module) -> Result<(), Error> {
    let n_segments = it.read_u32()?;
    for _ in 0..n_segments {
        let memidx = it.read_u32()?;
        let offset = decode_expr(it)?;
        let len = it.read_u32()? as usize;
        let bytes = it.read_slice(len)?.to_vec();
        module.data.push(DataSegment { memidx, offset, bytes });
    }
    Ok(())
}

// ---------------- Instruction decoding ----------------

#[derive(PartialEq, Eq, Debug)]
enum Terminator {
    End,
    Else,
}

fn read_block_type(it: &mut ByteIter) -> Result<BlockType, Error> {
    let byte = it.read_u8()?;
    if byte == 0x40 {
        return Ok(None);
    }
    match ValType::from_byte(byte) {
        Some(vt) => Ok(Some(vt)),
        None => malformed(INVALID_VALUE_TYPE),
    }
}

/// Decodes an initializer expression (global/element/data offsets): a plain
/// instruction sequence terminated by `end`. Whether it is actually constant
/// is checked during validation.
fn decode_expr(it: &mut ByteIter) -> Result<Vec<Instr>, Error> {
    let (body, terminator) = decode_instr_seq(it, 0)?;
    if terminator != Terminator::End {
        return malformed(END_EXPECTED);
    }
    Ok(body)
}

/// Decodes instructions until the `end`/`else` wire marker, materializing
/// nested streams as owned child sequences.
fn decode_instr_seq(it: &mut ByteIter, depth: usize) -> Result<(Vec<Instr>, Terminator), Error> {
    if depth > MAX_NESTING {
        return malformed(ILLEGAL_OP);
    }
    let mut out = Vec::new();
    loop {
        let opcode = it.read_u8()?;
        let instr = match opcode {
            0x0b => return Ok((out, Terminator::End)),
            0x05 => return Ok((out, Terminator::Else)),
            0x00 => Instr::Unreachable,
            0x01 => Instr::Nop,
            0x02 => {
                let ty = read_block_type(it)?;
                let (body, terminator) = decode_instr_seq(it, depth + 1)?;
                if terminator != Terminator::End {
                    return malformed(END_EXPECTED);
                }
                Instr::Block { ty, body }
            }
            0x03 => {
                let ty = read_block_type(it)?;
                let (body, terminator) = decode_instr_seq(it, depth + 1)?;
                if terminator != Terminator::End {
                    return malformed(END_EXPECTED);
                }
                Instr::Loop { ty, body }
            }
            0x04 => {
                let ty = read_block_type(it)?;
                let (then, terminator) = decode_instr_seq(it, depth + 1)?;
                let else_ = if terminator == Terminator::Else {
                    let (else_body, terminator) = decode_instr_seq(it, depth + 1)?;
                    if terminator != Terminator::End {
                        return malformed(END_EXPECTED);
                    }
                    else_body
                } else {
                    Vec::new()
                };
                Instr::If { ty, then, else_ }
            }
            0x0c => Instr::Br { depth: it.read_u32()? },
            0x0d => Instr::BrIf { depth: it.read_u32()? },
            0x0e => {
                let n_targets = it.read_u32()? as usize;
                let mut targets = Vec::with_capacity(n_targets);
                for _ in 0..n_targets {
                    targets.push(it.read_u32()?);
                }
                let default = it.read_u32()?;
                Instr::BrTable { targets, default }
            }
            0x0f => Instr::Return,
            0x10 => Instr::Call { func: it.read_u32()? },
            0x11 => {
                let ty = it.read_u32()?;
                if it.read_u8()? != 0 {
                    return malformed(ZERO_FLAG_EXPECTED);
                }
                Instr::CallIndirect { ty }
            }
            0x1a => Instr::Drop,
            0x1b => Instr::Select,
            0x20 => Instr::GetLocal(it.read_u32()?),
            0x21 => Instr::SetLocal(it.read_u32()?),
            0x22 => Instr::TeeLocal(it.read_u32()?),
            0x23 => Instr::GetGlobal(it.read_u32()?),
            0x24 => Instr::SetGlobal(it.read_u32()?),
            0x28..=0x35 => {
                let op = LoadOp::from_opcode(opcode).unwrap();
                let align = it.read_u32()?;
                let offset = it.read_u32()?;
                Instr::Load(op, MemArg { align, offset })
            }
            0x36..=0x3e => {
                let op = StoreOp::from_opcode(opcode).unwrap();
                let align = it.read_u32()?;
                let offset = it.read_u32()?;
                Instr::Store(op, MemArg { align, offset })
            }
            0x3f => {
                if it.read_u8()? != 0 {
                    return malformed(ZERO_FLAG_EXPECTED);
                }
                Instr::MemorySize
            }
            0x40 => {
                if it.read_u8()? != 0 {
                    return malformed(ZERO_FLAG_EXPECTED);
                }
                Instr::MemoryGrow
            }
            0x41 => Instr::I32Const(it.read_i32()?),
            0x42 => Instr::I64Const(it.read_i64()?),
            0x43 => Instr::F32Const(it.read_f32()?),
            0x44 => Instr::F64Const(it.read_f64()?),
            _ => match NumOp::from_opcode(opcode) {
                Some(op) => Instr::Num(op),
                None => return malformed(ILLEGAL_OP),
            },
        };
        out.push(instr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leb(mut v: u32) -> Vec<u8> {
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

    fn section(id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![id];
        out.extend(leb(payload.len() as u32));
        out.extend_from_slice(payload);
        out
    }

    fn module_bytes(sections: &[Vec<u8>]) -> Vec<u8> {
        let mut out = b"\0asm\x01\0\0\0".to_vec();
        for s in sections {
            out.extend_from_slice(s);
        }
        out
    }

    #[test]
    fn rejects_bad_header() {
        assert_eq!(decode(b"\0as").err(), Some(Error::Malformed(UNEXPECTED_END)));
        assert_eq!(
            decode(b"\0asX\x01\0\0\0").err(),
            Some(Error::Malformed(NO_MAGIC_HEADER))
        );
        assert_eq!(
            decode(b"\0asm\x02\0\0\0").err(),
            Some(Error::Malformed(UNKNOWN_BINARY_VERSION))
        );
    }

    #[test]
    fn empty_module_decodes() {
        let m = decode(b"\0asm\x01\0\0\0").unwrap();
        assert!(m.types.is_empty() && m.code.is_empty());
    }

    #[test]
    fn rejects_out_of_order_sections() {
        // memory section (5) before table section (4)
        let bytes = module_bytes(&[section(5, &[0]), section(4, &[0])]);
        assert_eq!(decode(&bytes).err(), Some(Error::Malformed(SECTION_OUT_OF_ORDER)));
    }

    #[test]
    fn decodes_nested_body() {
        // type () -> i32; one function: block (result i32) i32.const 7 end; end
        let type_sec = section(1, &[1, 0x60, 0, 1, 0x7f]);
        let func_sec = section(3, &[1, 0]);
        let body = [
            1, // declared locals vector: one run
            2, 0x7f, // two i32 locals
            0x02, 0x7f, // block (result i32)
            0x41, 0x07, // i32.const 7
            0x0b, // end (block)
            0x0b, // end (function)
        ];
        let mut code_payload = vec![1u8];
        code_payload.extend(leb(body.len() as u32));
        code_payload.extend_from_slice(&body);
        let code_sec = section(10, &code_payload);

        let m = decode(&module_bytes(&[type_sec, func_sec, code_sec])).unwrap();
        assert_eq!(m.code.len(), 1);
        assert_eq!(m.code[0].locals, vec![ValType::I32, ValType::I32]);
        match &m.code[0].body[0] {
            Instr::Block { ty, body } => {
                assert_eq!(*ty, Some(ValType::I32));
                assert_eq!(body.as_slice(), &[Instr::I32Const(7)]);
            }
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn code_function_count_mismatch() {
        let type_sec = section(1, &[1, 0x60, 0, 0]);
        let func_sec = section(3, &[1, 0]);
        // no code section at all
        let bytes = module_bytes(&[type_sec, func_sec]);
        assert_eq!(decode(&bytes).err(), Some(Error::Malformed(FUNC_CODE_INCONSISTENT)));
    }
}
