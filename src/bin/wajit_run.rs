use clap::Parser;
use std::fs;
use std::path::PathBuf;

use wajit::{
    host_func, instantiate_with_options, invoke, load_module, run_start, CompileOptions, Error,
    FuncType, Imports, ModuleImports, Trap, ValType, Value,
};

#[derive(Parser, Debug)]
#[command(name = "wajit-run")]
#[command(about = "Execute WebAssembly modules with the wajit JIT engine")]
#[command(long_about = "
Loads a binary WebAssembly module, instantiates it (JIT-compiling every
function to native code), runs its start function and optionally invokes an
exported function with typed arguments.

A small default import set is provided under the \"env\" module:
  env.print_i32 : i32 -> ()
  env.exit      : i32 -> ()      (raises the exit trap)

Examples:
  # Instantiate and run the start function only
  wajit-run module.wasm

  # Invoke an exported function with arguments
  wajit-run module.wasm --invoke add --args 10:i32 20:i32

  # Floating point arguments
  wajit-run module.wasm --invoke scale --args 3.5:f64 2:i32
")]
struct Args {
    /// Path to the WebAssembly module file
    wasm_file: PathBuf,

    /// Exported function to invoke after instantiation
    #[arg(short, long)]
    invoke: Option<String>,

    /// Arguments to pass (format: value:type, e.g. 42:i32, 3.14:f64)
    #[arg(short, long, value_delimiter = ' ', num_args = 0..)]
    args: Vec<String>,

    /// Emit retpolines in generated code
    #[arg(long)]
    retpoline: bool,

    /// List exports instead of running
    #[arg(short, long)]
    list_exports: bool,
}

fn parse_value(arg: &str) -> Result<Value, String> {
    let (value_str, type_str) = arg
        .split_once(':')
        .ok_or_else(|| format!("invalid argument '{}', expected value:type", arg))?;
    match type_str {
        "i32" => value_str
            .parse::<i32>()
            .map(Value::I32)
            .map_err(|_| format!("failed to parse '{}' as i32", value_str)),
        "i64" => value_str
            .parse::<i64>()
            .map(Value::I64)
            .map_err(|_| format!("failed to parse '{}' as i64", value_str)),
        "f32" => value_str
            .parse::<f32>()
            .map(Value::F32)
            .map_err(|_| format!("failed to parse '{}' as f32", value_str)),
        "f64" => value_str
            .parse::<f64>()
            .map(Value::F64)
            .map_err(|_| format!("failed to parse '{}' as f64", value_str)),
        _ => Err(format!("unknown type '{}', supported: i32 i64 f32 f64", type_str)),
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::I32(v) => format!("{} (i32)", v),
        Value::I64(v) => format!("{} (i64)", v),
        Value::F32(v) => format!("{} (f32)", v),
        Value::F64(v) => format!("{} (f64)", v),
    }
}

fn default_imports() -> Result<Imports, Error> {
    let mut env = ModuleImports::new();
    env.insert(
        "print_i32".to_string(),
        wajit::Extern::Func(host_func(
            FuncType::new(vec![ValType::I32], None),
            |args| {
                println!("{}", args[0].as_i32());
                Ok(None)
            },
        )?),
    );
    env.insert(
        "exit".to_string(),
        wajit::Extern::Func(host_func(
            FuncType::new(vec![ValType::I32], None),
            |args| Err(Trap::Exit(args[0].as_i32() as u32)),
        )?),
    );
    let mut imports = Imports::new();
    imports.insert("env".to_string(), env);
    Ok(imports)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let bytes = fs::read(&args.wasm_file)
        .map_err(|e| format!("failed to read {:?}: {}", args.wasm_file, e))?;
    let module = load_module(&bytes)?;

    let imports = default_imports()?;
    let opts = CompileOptions { retpoline: args.retpoline };
    let inst = instantiate_with_options(&module, &imports, opts)?;

    if args.list_exports {
        for export in &inst.exports {
            println!("{}: {}", export.name, export.value.kind().repr());
        }
        return Ok(());
    }

    wajit::reserve_guest_stack(512 * 1024);
    run_start(&inst)?;

    if let Some(name) = &args.invoke {
        let func = match inst.get_export(name, wajit::ast::ExternKind::Func) {
            Some(wajit::Extern::Func(f)) => f,
            _ => return Err(format!("no exported function named '{}'", name).into()),
        };
        let call_args = args
            .args
            .iter()
            .map(|a| parse_value(a))
            .collect::<Result<Vec<_>, _>>()?;
        if call_args.len() != func.ty().params.len() {
            return Err(format!(
                "'{}' takes {} argument(s), got {}",
                name,
                func.ty().params.len(),
                call_args.len()
            )
            .into());
        }
        match invoke(&func, &call_args) {
            Ok(Some(value)) => println!("{}", format_value(&value)),
            Ok(None) => {}
            Err(Error::Trap(Trap::Exit(code))) => std::process::exit(code as i32),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
