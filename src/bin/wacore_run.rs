use clap::Parser;
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};
use wacore::{Config, ExportValue, FuncAddr, Imports, Instance, Module, Value};

#[derive(Parser, Debug)]
#[command(name = "wacore-run")]
#[command(about = "Execute WebAssembly modules with the wacore interpreter")]
#[command(long_about = "
wacore-run - run a WebAssembly binary from the command line

Decodes the module, instantiates it with no imports and invokes one export.

Examples:
  # Run the default _start function (if exists)
  wacore-run module.wasm

  # Invoke a function with arguments (i32, i64, f32, f64, v128, funcref, externref)
  wacore-run module.wasm --invoke add --args 10:i32 20:i32

  # Limit recursion and show per-call logging
  wacore-run module.wasm --invoke fib --args 30:i64 --max-call-depth 200 --log-level debug

  # Load execution limits from a JSON file
  wacore-run module.wasm --invoke main --config limits.json
")]
struct Args {
    /// Path to the WebAssembly binary
    wasm_file: PathBuf,

    /// Function to invoke (defaults to _start)
    #[arg(short, long)]
    invoke: Option<String>,

    /// Arguments to pass to the function (format: value:type, e.g., 42:i32, null:funcref)
    #[arg(short, long, value_delimiter = ' ', num_args = 0..)]
    args: Vec<String>,

    /// List all exports instead of running
    #[arg(short, long)]
    list_exports: bool,

    /// JSON file with execution limits
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides max_call_depth from the config
    #[arg(long)]
    max_call_depth: Option<usize>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    debug: bool,
}

fn init_logging(directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    let subscriber = fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(true).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn parse_ref(value_str: &str) -> Result<Option<u32>, String> {
    if value_str == "null" {
        return Ok(None);
    }
    value_str.parse::<u32>().map(Some).map_err(|_| format!("Failed to parse '{}' as a reference", value_str))
}

fn parse_value(arg: &str) -> Result<Value, String> {
    let (value_str, type_str) = arg
        .rsplit_once(':')
        .ok_or_else(|| format!("Invalid argument format '{}'. Expected format: value:type (e.g., 42:i32)", arg))?;

    match type_str {
        "i32" => value_str
            .parse::<i32>()
            .or_else(|_| value_str.parse::<u32>().map(|v| v as i32))
            .map(Value::I32)
            .map_err(|_| format!("Failed to parse '{}' as i32", value_str)),
        "i64" => value_str
            .parse::<i64>()
            .or_else(|_| value_str.parse::<u64>().map(|v| v as i64))
            .map(Value::I64)
            .map_err(|_| format!("Failed to parse '{}' as i64", value_str)),
        "f32" => value_str.parse::<f32>().map(Value::F32).map_err(|_| format!("Failed to parse '{}' as f32", value_str)),
        "f64" => value_str.parse::<f64>().map(Value::F64).map_err(|_| format!("Failed to parse '{}' as f64", value_str)),
        "v128" => {
            let digits = value_str.strip_prefix("0x").unwrap_or(value_str);
            u128::from_str_radix(digits, 16)
                .map(Value::V128)
                .map_err(|_| format!("Failed to parse '{}' as hex v128", value_str))
        }
        "funcref" => parse_ref(value_str).map(|r| Value::FuncRef(r.map(FuncAddr::local))),
        "externref" => parse_ref(value_str).map(Value::ExternRef),
        _ => Err(format!(
            "Unknown type '{}'. Supported types: i32, i64, f32, f64, v128, funcref, externref",
            type_str
        )),
    }
}

fn load_config(args: &Args) -> Result<Config, String> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| format!("Failed to read config {:?}: {}", path, e))?;
            Config::from_json(&text).map_err(|e| format!("Invalid config {:?}: {}", path, e))?
        }
        None => Config::default(),
    };
    if let Some(depth) = args.max_call_depth {
        config.max_call_depth = depth;
    }
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(if args.debug { "debug" } else { args.log_level.as_str() });

    let config = load_config(&args)?;
    tracing::debug!(file = ?args.wasm_file, ?config, "loading module");

    let bytes = fs::read(&args.wasm_file).map_err(|e| format!("Failed to read WASM file: {}", e))?;
    let module = Module::decode(&bytes).map_err(|e| format!("Failed to decode module: {}", e))?;
    let instance = Instance::instantiate_with_config(std::rc::Rc::new(module), &Imports::new(), &config)
        .map_err(|e| format!("Failed to instantiate module: {}", e))?;

    if args.list_exports {
        let exports = instance.exports();
        let mut names: Vec<_> = exports.keys().collect();
        names.sort();
        println!("Exports:");
        for name in names {
            match &exports[name] {
                ExportValue::Function(f) => println!("  {} func {}", name, f.ty()),
                ExportValue::Table(t) => println!("  {} table {} [{}]", name, t.borrow().elem_type(), t.borrow().size()),
                ExportValue::Memory(m) => println!("  {} memory {} pages", name, m.pages()),
                ExportValue::Global(g) => println!("  {} global {}", name, g.ty().ty),
                ExportValue::Tag(t) => println!("  {} tag {}", name, t.ty()),
            }
        }
        return Ok(());
    }

    let func_name = args.invoke.as_deref().unwrap_or("_start");
    let mut wasm_args = Vec::new();
    for arg_str in &args.args {
        wasm_args.push(parse_value(arg_str)?);
    }

    tracing::debug!(func = func_name, args = wasm_args.len(), "invoking");
    let results = instance.invoke(func_name, &wasm_args).map_err(|e| format!("Execution failed: {}", e))?;

    if !results.is_empty() {
        println!("Result:");
        for (i, result) in results.iter().enumerate() {
            println!("  [{}] {}", i, result);
        }
    }

    Ok(())
}
