//! rra-cli - Inspect the acceleration structures of a trace chunk.

use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use rra_bvh::bvh::{
    AccelerationStructure, BundleLoader, BvhBundle, ChunkFile, EncodedBvh, NodeView, StructureStats,
};
use rra_bvh::config::Settings;
use rra_bvh::dxr::{to_standard_format, DxrBuildSettings};
use rra_bvh::sah::{SahEvaluator, SahReport};
use serde_json::json;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Filter directives for `RRA_LOG`
const LOG_ENV: &str = "RRA_LOG";
/// Set to 1 to write a chrome trace (needs the chrome-trace feature)
#[cfg(feature = "chrome-trace")]
const TRACE_ENV: &str = "RRA_TRACE";

/// Depth past which `tree` stops descending unless `--depth` says otherwise
const DEFAULT_TREE_DEPTH: u32 = 6;

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut level: Option<&str> = None;
    let mut config: Option<PathBuf> = None;
    let mut filtered_args: Vec<&str> = Vec::new();
    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "--verbose" => level = Some("debug"),
            "-vv" | "--trace" => level = Some("trace"),
            "-q" | "--quiet" => level = Some("error"),
            "-c" | "--config" => match iter.next() {
                Some(p) => config = Some(PathBuf::from(p)),
                None => fail("--config needs a file argument"),
            },
            _ => filtered_args.push(arg),
        }
    }

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let json_mode = filtered_args.iter().any(|&s| s == "--json" || s == "-j");
    if json_mode {
        level = Some("off");
    }
    let _guard = init_tracing(level);

    let settings = match Settings::load(config.as_deref()) {
        Ok(s) => s,
        Err(e) => fail(&format!("Failed to load settings: {}", e)),
    };
    tracing::debug!(?settings, "settings loaded");

    match filtered_args[0] {
        "info" | "i" => cmd_info(require_file(&filtered_args, "info <chunk>"), &settings),
        "tree" | "t" => {
            let path = require_file(&filtered_args, "tree <chunk> [blas|tlas] [index] [--depth N]");
            let rest: Vec<&str> = filtered_args[2..].to_vec();
            cmd_tree(path, &rest, &settings);
        }
        "stats" | "s" => cmd_stats(require_file(&filtered_args, "stats <chunk>"), &settings),
        "sah" => cmd_sah(require_file(&filtered_args, "sah <chunk>"), &settings),
        "dump" | "d" => cmd_dump(require_file(&filtered_args, "dump <chunk> [--json]"), json_mode, &settings),
        "help" | "h" | "-h" | "--help" => print_help(),

        // Default: if file exists, show info; otherwise error
        _ => {
            if Path::new(filtered_args[0]).exists() {
                cmd_info(filtered_args[0], &settings);
            } else {
                eprintln!("Unknown command: {}", filtered_args[0]);
                eprintln!();
                print_help();
                process::exit(1);
            }
        }
    }
}

fn print_help() {
    println!("rra-cli - acceleration structure inspector (built {})", rra_bvh::build_date());
    println!();
    println!("USAGE:");
    println!("    rra-cli [OPTIONS] <COMMAND> <chunk> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    i, info   <chunk>                     Structure counts, headers and decode failures");
    println!("    t, tree   <chunk> [blas|tlas] [idx]   Node hierarchy of one structure");
    println!("    s, stats  <chunk>                     Node and primitive statistics");
    println!("    sah       <chunk>                     Surface area heuristic costs");
    println!("    d, dump   <chunk> [--json]            Build settings and standard node records");
    println!("    h, help                             Show this help");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose        Show debug output");
    println!("    -vv, --trace         Show trace output (very verbose)");
    println!("    -q, --quiet          Errors only");
    println!("    -c, --config <file>  JSON settings file (else $RRA_CONFIG)");
    println!();
    println!("ENVIRONMENT:");
    println!("    RRA_LOG      tracing filter directives, e.g. rra_bvh=debug");
    println!("    RRA_TRACE=1  write trace.json (chrome-trace feature)");
}

fn fail(msg: &str) -> ! {
    eprintln!("Error: {}", msg);
    process::exit(1);
}

fn require_file<'a>(args: &[&'a str], usage: &str) -> &'a str {
    match args.get(1) {
        Some(path) => path,
        None => {
            eprintln!("Error: missing chunk argument");
            eprintln!("Usage: rra-cli {}", usage);
            process::exit(1);
        }
    }
}

// ============================================================================
// Tracing
// ============================================================================

struct TraceGuard {
    #[cfg(feature = "chrome-trace")]
    _chrome: Option<tracing_chrome::FlushGuard>,
}

fn init_tracing(level: Option<&str>) -> TraceGuard {
    let filter = match level {
        Some(l) => EnvFilter::new(l),
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    #[cfg(feature = "chrome-trace")]
    {
        if env::var(TRACE_ENV).ok().as_deref() == Some("1") {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file("trace.json")
                .build();
            if tracing::subscriber::set_global_default(registry.with(chrome_layer)).is_err() {
                return TraceGuard { _chrome: None };
            }
            return TraceGuard { _chrome: Some(guard) };
        }
        let _ = tracing::subscriber::set_global_default(registry);
        TraceGuard { _chrome: None }
    }

    #[cfg(not(feature = "chrome-trace"))]
    {
        let _ = tracing::subscriber::set_global_default(registry);
        TraceGuard {}
    }
}

// ============================================================================
// Loading
// ============================================================================

fn load(path: &str, settings: &Settings) -> Arc<BvhBundle> {
    tracing::info!("Opening chunk: {}", path);
    let file = match ChunkFile::open(path) {
        Ok(f) => f,
        Err(e) => fail(&format!("Failed to open {}: {}", path, e)),
    };
    let loader = BundleLoader::new(settings.decode.clone());
    match loader.load(&file.chunk()) {
        Ok(bundle) => bundle,
        Err(e) => fail(&format!("Failed to decode {}: {}", path, e)),
    }
}

fn describe(bvh: &EncodedBvh) -> String {
    let h = bvh.header();
    format!(
        "{} {:?}, {} nodes, {} primitives ({} active), {} bytes",
        h.rtip.name(),
        h.structure_type(),
        bvh.node_count(),
        h.primitive_count,
        h.active_primitive_count,
        h.size_in_bytes
    )
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_info(path: &str, settings: &Settings) {
    let bundle = load(path, settings);

    println!("Chunk: {}", path);
    println!("BLAS: {} ({} decoded)", bundle.blas_count(), bundle.blas_iter().count());
    println!("TLAS: {} ({} decoded)", bundle.tlas_count(), bundle.tlas_iter().count());
    println!();

    for (i, blas) in bundle.blas_iter() {
        println!("  blas[{}] {}, {} geometries", i, describe(blas.bvh()), blas.geometry_count());
    }
    for (i, tlas) in bundle.tlas_iter() {
        println!(
            "  tlas[{}] {}, {} instances ({} missing)",
            i,
            describe(tlas.bvh()),
            tlas.instance_count(),
            tlas.missing_count()
        );
    }

    if !bundle.failures().is_empty() {
        println!();
        println!("Failures ({}):", bundle.failures().len());
        for f in bundle.failures() {
            let slot = f.slot.map_or_else(|| "-".to_string(), |s| s.to_string());
            let level = f.level.map_or_else(|| "?".to_string(), |l| format!("{:?}", l));
            println!("  entry {} {}[{}] {}: {}", f.entry, level, slot, f.kind(), f.error);
        }
    }
}

fn cmd_tree(path: &str, args: &[&str], settings: &Settings) {
    let mut max_depth = DEFAULT_TREE_DEPTH;
    let mut positional = Vec::new();
    let mut iter = args.iter();
    while let Some(&arg) = iter.next() {
        if arg == "--depth" {
            max_depth = match iter.next().and_then(|d| d.parse().ok()) {
                Some(d) => d,
                None => fail("--depth needs a number"),
            };
        } else {
            positional.push(arg);
        }
    }
    let top_level = positional.first().map(|s| *s == "tlas").unwrap_or(false);
    let index: usize = positional.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);

    let bundle = load(path, settings);
    let bvh = if top_level {
        bundle.get_tlas(index).map(|t| t.bvh())
    } else {
        bundle.get_blas(index).map(|b| b.bvh())
    };
    let Some(bvh) = bvh else {
        fail(&format!("{}[{}] is not present", if top_level { "tlas" } else { "blas" }, index));
    };

    println!("{}", describe(bvh));
    match bvh.root() {
        Some(root) => print_tree(bvh, root, max_depth),
        None => println!("(empty)"),
    }
}

fn print_tree(bvh: &EncodedBvh, node: NodeView<'_>, max_depth: u32) {
    let indent = "  ".repeat(node.depth() as usize);
    let b = node.bounds();
    if node.is_leaf() {
        println!(
            "{}{} @{} prims={} [{:.3?} .. {:.3?}]",
            indent,
            node.kind(),
            node.byte_offset(),
            node.primitive_count(),
            b.min,
            b.max
        );
        return;
    }
    println!(
        "{}{} @{} children={} [{:.3?} .. {:.3?}]",
        indent,
        node.kind(),
        node.byte_offset(),
        node.child_indices().len(),
        b.min,
        b.max
    );
    if node.depth() >= max_depth {
        if !node.child_indices().is_empty() {
            println!("{}  ...", indent);
        }
        return;
    }
    for child in bvh.children(node.index) {
        print_tree(bvh, child, max_depth);
    }
}

fn cmd_stats(path: &str, settings: &Settings) {
    let bundle = load(path, settings);
    let s = bundle.stats();

    println!("Chunk: {}", path);
    println!("Structures: {} BLAS, {} TLAS, {} absent", s.blas_count, s.tlas_count, s.absent_structures);
    println!(
        "Nodes: {} interior ({} box32, {} box16, {} bvh8), {} leaves ({} triangle, {} procedural, {} instance)",
        s.nodes.interior(),
        s.nodes.box32,
        s.nodes.box16,
        s.nodes.quantized_bvh8,
        s.nodes.leaves(),
        s.nodes.triangle,
        s.nodes.procedural,
        s.nodes.instance
    );
    println!("Primitives: {} ({} valid triangles)", s.primitive_count, s.valid_triangles);
    println!("Empty BLAS: {}", s.empty_blas);
    println!("Instances: {} missing, {} inactive", s.missing_instances, s.inactive_instances);
    println!();

    for (i, blas) in bundle.blas_iter() {
        print_structure_stats(&format!("blas[{}]", i), &StructureStats::compute(blas.bvh()));
    }
    for (i, tlas) in bundle.tlas_iter() {
        print_structure_stats(&format!("tlas[{}]", i), &StructureStats::compute(tlas.bvh()));
    }
}

fn print_structure_stats(name: &str, s: &StructureStats) {
    println!(
        "  {:<10} nodes={:<6} prims={:<6} depth={:<3} avg_leaf_depth={:.2} area={:.3}{}",
        name,
        s.nodes.interior() + s.nodes.leaves(),
        s.primitive_count,
        s.max_depth,
        s.average_leaf_depth,
        s.root_surface_area,
        if s.revisits > 0 {
            format!(" revisits={}", s.revisits)
        } else {
            String::new()
        }
    );
}

fn cmd_sah(path: &str, settings: &Settings) {
    let bundle = load(path, settings);
    let evaluator = SahEvaluator::new(settings.sah);
    let report = evaluator.evaluate_bundle(&bundle);

    println!(
        "Cost model: traversal={} intersection={}",
        evaluator.config().traversal_cost,
        evaluator.config().intersection_cost
    );
    for (i, r) in &report.blas {
        print_sah(&format!("blas[{}]", i), r);
    }
    for (i, r) in &report.tlas {
        print_sah(&format!("tlas[{}]", i), r);
    }
}

fn print_sah(name: &str, r: &SahReport) {
    let quality = r
        .triangle_quality
        .map(|q| format!(" quality min={:.3} avg={:.3}", q.min, q.average))
        .unwrap_or_default();
    println!("  {:<10} cost={:.4} leaves={}{}", name, r.total_cost, r.leaf_count, quality);
    for e in r.errors() {
        println!("    {}", e);
    }
}

fn cmd_dump(path: &str, json_mode: bool, settings: &Settings) {
    let bundle = load(path, settings);

    if !json_mode {
        for (i, blas) in bundle.blas_iter() {
            println!("blas[{}] {:?}", i, DxrBuildSettings::from_header(blas.header()));
        }
        for (i, tlas) in bundle.tlas_iter() {
            println!("tlas[{}] {:?}", i, DxrBuildSettings::from_header(tlas.header()));
            for inst in tlas.instances() {
                println!(
                    "  instance {} -> {:?} mask=0x{:02x} id={}",
                    inst.index,
                    inst.blas_reference(),
                    inst.desc().mask,
                    inst.desc().instance_id
                );
            }
        }
        return;
    }

    let structure = |bvh: &EncodedBvh| {
        let nodes: Vec<_> = bvh.nodes().map(|n| to_standard_format(&n)).collect();
        json!({
            "settings": DxrBuildSettings::from_header(bvh.header()),
            "header": bvh.header(),
            "stats": StructureStats::compute(bvh),
            "nodes": nodes,
        })
    };
    let blas: Vec<_> = bundle
        .blas_iter()
        .map(|(i, b)| json!({ "slot": i, "structure": structure(b.bvh()) }))
        .collect();
    let tlas: Vec<_> = bundle
        .tlas_iter()
        .map(|(i, t)| {
            json!({
                "slot": i,
                "structure": structure(t.bvh()),
                "references": t.references(),
            })
        })
        .collect();
    let failures: Vec<_> = bundle
        .failures()
        .iter()
        .map(|f| {
            json!({
                "entry": f.entry,
                "level": f.level,
                "slot": f.slot,
                "kind": f.kind().to_string(),
                "message": f.error.to_string(),
            })
        })
        .collect();
    let out = json!({
        "chunk": path,
        "blas": blas,
        "tlas": tlas,
        "failures": failures,
        "stats": bundle.stats(),
    });
    match serde_json::to_string_pretty(&out) {
        Ok(text) => println!("{}", text),
        Err(e) => fail(&format!("JSON serialization failed: {}", e)),
    }
}
