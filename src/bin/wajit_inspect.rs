use clap::Parser;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;

use wajit::ast::Module;
use wajit::{decode, validate_module, FuncType, Limits};

#[derive(Parser, Debug)]
#[command(name = "wajit-inspect")]
#[command(about = "Inspect the structure of a binary WebAssembly module")]
struct Args {
    /// Path to the WebAssembly module file
    wasm_file: PathBuf,

    /// Emit the summary as JSON
    #[arg(short, long)]
    json: bool,

    /// Also run validation and report the result
    #[arg(short, long)]
    validate: bool,
}

#[derive(Serialize)]
struct ImportSummary {
    module: String,
    name: String,
    kind: &'static str,
}

#[derive(Serialize)]
struct ExportSummary {
    name: String,
    kind: &'static str,
    index: u32,
}

#[derive(Serialize)]
struct ModuleSummary {
    types: Vec<FuncType>,
    imports: Vec<ImportSummary>,
    functions: usize,
    tables: Vec<Limits>,
    memories: Vec<Limits>,
    globals: usize,
    exports: Vec<ExportSummary>,
    start: Option<u32>,
    element_segments: usize,
    data_segments: usize,
    valid: Option<bool>,
}

fn summarize(module: &Module, valid: Option<bool>) -> ModuleSummary {
    ModuleSummary {
        types: module.types.clone(),
        imports: module
            .imports
            .iter()
            .map(|i| ImportSummary {
                module: i.module.clone(),
                name: i.name.clone(),
                kind: i.desc.kind().repr(),
            })
            .collect(),
        functions: module.functions.len(),
        tables: module.tables.iter().map(|t| t.limits).collect(),
        memories: module.memories.iter().map(|m| m.limits).collect(),
        globals: module.globals.len(),
        exports: module
            .exports
            .iter()
            .map(|e| ExportSummary { name: e.name.clone(), kind: e.kind.repr(), index: e.idx })
            .collect(),
        start: module.start,
        element_segments: module.elements.len(),
        data_segments: module.data.len(),
        valid,
    }
}

fn type_repr(ty: &FuncType) -> String {
    let params: Vec<&str> = ty.params.iter().map(|p| p.repr()).collect();
    let result = ty.result.map(|r| r.repr()).unwrap_or("()");
    format!("({}) -> {}", params.join(", "), result)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let bytes = fs::read(&args.wasm_file)
        .map_err(|e| format!("failed to read {:?}: {}", args.wasm_file, e))?;
    let module = decode(&bytes)?;
    let valid = if args.validate {
        Some(validate_module(&module).is_ok())
    } else {
        None
    };
    let summary = summarize(&module, valid);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("types ({}):", summary.types.len());
    for (i, ty) in summary.types.iter().enumerate() {
        println!("  [{}] {}", i, type_repr(ty));
    }
    println!("imports ({}):", summary.imports.len());
    for import in &summary.imports {
        println!("  {}.{} [{}]", import.module, import.name, import.kind);
    }
    println!("functions: {}", summary.functions);
    for (what, limits) in [("tables", &summary.tables), ("memories", &summary.memories)] {
        println!("{} ({}):", what, limits.len());
        for l in limits.iter() {
            match l.max {
                Some(max) => println!("  min {} max {}", l.min, max),
                None => println!("  min {} (no max)", l.min),
            }
        }
    }
    println!("globals: {}", summary.globals);
    println!("exports ({}):", summary.exports.len());
    for export in &summary.exports {
        println!("  {} [{} {}]", export.name, export.kind, export.index);
    }
    match summary.start {
        Some(idx) => println!("start: func {}", idx),
        None => println!("start: none"),
    }
    println!("element segments: {}", summary.element_segments);
    println!("data segments: {}", summary.data_segments);
    if let Some(valid) = summary.valid {
        println!("validation: {}", if valid { "ok" } else { "FAILED" });
    }
    Ok(())
}
