use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use tfg::builder::GraphBuilder;
use tfg::graph::{Graph, Input};
use tfg::graph_def::GraphDef;
use tfg::import::{ImportOptions, ImportResult, ReturnElement};
use tfg::kernels::{ops_and_kernels, DEFAULT_OPS};
use tfg::registry::OpRegistry;
use tfg::runtime::{Runtime, RuntimeConfig};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    Text,
    Json,
    Dot,
    Ops,
    Summary,
}

#[derive(Parser, Debug)]
#[command(
    name = "tfg",
    version,
    about = "Traced function graphs: imports, merges and inspects graph definitions"
)]
struct Cli {
    /// Graph definition (.pbtxt text form or .json)
    graph: PathBuf,

    /// Second graph definition imported into the first
    #[arg(long)]
    merge: Option<PathBuf>,

    /// Name scope for the merged graph ("" merges into the top-level namespace)
    #[arg(long, requires = "merge")]
    prefix: Option<String>,

    /// Rebind an input of the imported graph: `name:k=tensor` or `^name=node` (repeatable)
    #[arg(long = "input-map", value_name = "KEY=TENSOR")]
    input_map: Vec<String>,

    /// Tensor (`name:k`) or node name to report after import (repeatable)
    #[arg(long = "return", value_name = "NAME")]
    returns: Vec<String>,

    /// Output form
    #[arg(long, value_enum, default_value_t = EmitStage::Summary)]
    emit: EmitStage,

    /// Op library files with REGISTER_OP() entries (repeatable)
    #[arg(short = 'I', long = "ops", value_name = "FILE")]
    ops: Vec<PathBuf>,

    /// Runtime configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// A failure and the exit status it maps to.
struct Failure {
    status: u8,
    message: String,
}

impl Failure {
    fn usage(message: impl ToString) -> Self {
        Failure {
            status: 2,
            message: message.to_string(),
        }
    }

    fn import(message: impl ToString) -> Self {
        Failure {
            status: 1,
            message: message.to_string(),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(output) => {
            print!("{}", output);
            ExitCode::SUCCESS
        }
        Err(f) => {
            eprintln!("tfg: error: {}", f.message);
            ExitCode::from(f.status)
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<String, Failure> {
    // ── Configuration ──
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load(path).map_err(Failure::usage)?,
        None => RuntimeConfig::default(),
    };
    let mut registry = OpRegistry::with_builtin_ops();
    for path in &cli.ops {
        let count = registry.load_op_file(path).map_err(Failure::usage)?;
        tracing::info!(path = %path.display(), ops = count, "loaded op library");
    }
    let rt = Runtime::with_registry(config, registry);

    // ── Load definitions ──
    let base = GraphDef::load(&cli.graph).map_err(Failure::usage)?;
    let merge = match &cli.merge {
        Some(path) => Some(GraphDef::load(path).map_err(Failure::usage)?),
        None => None,
    };
    let input_map = parse_input_map(&cli.input_map)?;

    // ── Import ──
    let mut b = GraphBuilder::new(&rt);
    let mut options = ImportOptions::default().with_prefix("");
    let mut results = Vec::new();
    match merge {
        None => {
            options.input_map = input_map;
            options.return_elements = cli.returns.clone();
            results.push(b.import(&base, options).map_err(Failure::import)?);
        }
        Some(merge) => {
            results.push(b.import(&base, options).map_err(Failure::import)?);
            let mut options = ImportOptions {
                prefix: cli.prefix.clone(),
                input_map,
                return_elements: cli.returns.clone(),
                ..ImportOptions::default()
            };
            if options.prefix.is_none() {
                options.prefix = Some(String::from("import"));
            }
            results.push(b.import(&merge, options).map_err(Failure::import)?);
        }
    }
    for diag in results.iter().flat_map(|r| &r.diagnostics) {
        eprintln!("tfg: {}", diag);
    }
    let graph = b.into_graph();
    tracing::info!(nodes = graph.len(), version = graph.version(), "graph assembled");

    // ── Emit ──
    let def = GraphDef::from_graph(&graph);
    let returned = results.last().and_then(|r: &ImportResult| r.returned.clone());
    match cli.emit {
        EmitStage::Text => Ok(def.to_text()),
        EmitStage::Json => def.to_json().map(|s| s + "\n").map_err(Failure::usage),
        EmitStage::Dot => Ok(tfg::dot::emit_dot(&graph)),
        EmitStage::Ops => {
            let pairs = ops_and_kernels(std::slice::from_ref(&def), rt.kernels(), DEFAULT_OPS)
                .map_err(Failure::usage)?;
            Ok(pairs
                .iter()
                .map(|(op, kernel)| format!("{}\t{}\n", op, kernel))
                .collect())
        }
        EmitStage::Summary => Ok(summary(&graph, returned.as_deref())),
    }
}

fn parse_input_map(entries: &[String]) -> Result<BTreeMap<String, Input>, Failure> {
    let mut map = BTreeMap::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| Failure::usage(format!("--input-map expects KEY=TENSOR, got '{}'", entry)))?;
        let input = Input::parse(value.trim()).map_err(Failure::usage)?;
        map.insert(key.trim().to_string(), input);
    }
    Ok(map)
}

fn summary(graph: &Graph, returned: Option<&[ReturnElement]>) -> String {
    let mut ops: BTreeMap<&str, usize> = BTreeMap::new();
    for node in graph.nodes() {
        *ops.entry(node.op.as_str()).or_default() += 1;
    }
    let versions = graph.versions();
    let mut out = format!(
        "nodes: {}\nversion: {}\nproducer: {} min_consumer: {}\n",
        graph.len(),
        graph.version(),
        versions.producer,
        versions.min_consumer
    );
    out.push_str("ops:\n");
    for (op, count) in ops {
        out.push_str(&format!("  {} {}\n", op, count));
    }
    let mut functions: Vec<&str> = graph.functions().map(|f| f.name.as_str()).collect();
    functions.sort_unstable();
    if !functions.is_empty() {
        out.push_str(&format!("functions: {}\n", functions.join(", ")));
    }
    if let Some(returned) = returned {
        out.push_str("returned:\n");
        for r in returned {
            match r {
                ReturnElement::Tensor(t) => match graph.output(t) {
                    Ok(slot) => out.push_str(&format!("  {} {} {}\n", t, slot.dtype, slot.shape)),
                    Err(_) => out.push_str(&format!("  {}\n", t)),
                },
                ReturnElement::Node(n) => out.push_str(&format!("  ^{}\n", n)),
            }
        }
    }
    out
}
