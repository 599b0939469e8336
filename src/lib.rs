//! wajit: a WebAssembly JIT execution engine.
//!
//! Modules decode into an owned AST, validate against the MVP type system,
//! and instantiate into directly executable native code with strict W^X
//! code segments and a tagged-value embedding API. There is no interpreter;
//! every function body, host trampoline and calling-convention adapter is
//! compiled to x86-64 machine code at instantiation time.

pub mod ast;
mod byte_iter;
pub mod codeseg;
pub mod compile;
pub mod decoder;
pub mod error;
mod leb128;
pub mod instantiate;
pub mod runtime;
pub mod types;
pub mod validator;
mod x86;

pub use ast::Module;
pub use compile::CompileOptions;
pub use decoder::decode;
pub use error::{Error, Trap};
pub use instantiate::{host_func, host_func_with_options, instantiate, instantiate_with_options, run_start};
pub use runtime::{
    array_index_nospec, invoke, reserve_guest_stack, resolve_indirect_call, set_stack_limit,
    typecheck_func, typecheck_global, typecheck_memory, typecheck_table, Export, Extern, FuncInst,
    GlobalInst, Imports, MemInst, ModuleImports, ModuleInst, TableInst, Value,
};
pub use types::{type_equal, FuncType, GlobalType, Limits, MemoryType, Mut, TableType, ValType};
pub use validator::validate_module;

/// Decode and validate in one step; the returned module is ready to
/// instantiate.
pub fn load_module(bytes: &[u8]) -> Result<Module, Error> {
    let module = decoder::decode(bytes)?;
    validator::validate_module(&module)?;
    Ok(module)
}

// Debug macro that only prints when the wasm_debug feature is enabled
#[cfg(feature = "wasm_debug")]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

#[cfg(not(feature = "wasm_debug"))]
macro_rules! debug_println {
    ($($arg:tt)*) => {};
}

pub(crate) use debug_println;
