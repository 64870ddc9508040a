//! Hostcall runtime command-line interface
//!
//! This CLI provides tools for:
//! - Inspecting host and guest memory parameters
//! - Listing the imports a configuration grants
//! - Checking JSON interface descriptions against the host
//! - Probing region growth and call marshaling on this machine

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hostcall_runtime::{
    default_provider, host_page_size, interface, register_builtin, translate, GuestInstance,
    GuestMemoryRegion, HeapVirtualMemory, ImportDecl, ImportRegistry, Param, Ret, Returns,
    RuntimeConfig, Signature, StrDescriptor, Value, VirtualMemory, GUEST_PAGE_SIZE,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "hostcall")]
#[command(author, version, about = "Guest memory and host call runtime CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Runtime configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show page sizes and the effective configuration
    Info,

    /// List imports granted by the configuration
    Imports {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check an interface description against the granted imports
    Check {
        /// Interface description (JSON)
        interface: PathBuf,
    },

    /// Exercise region growth and a marshaled call
    Probe {
        /// Bytes to reserve
        #[arg(long, default_value = "2097152")]
        reserve: u64,

        /// Growth requests in bytes, applied in order
        #[arg(long, value_delimiter = ',', default_value = "1000,2097152")]
        grow: Vec<u64>,

        /// Use the portable heap provider instead of the platform one
        #[arg(long)]
        heap: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => {
            let config = RuntimeConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            info!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => Ok(RuntimeConfig::default()),
    }
}

fn build_registry(config: &RuntimeConfig) -> Result<ImportRegistry<()>> {
    let mut registry = ImportRegistry::with_builtins()?;
    register_builtin(&mut registry, &config.capabilities).context("Failed to grant capabilities")?;
    Ok(registry)
}

fn provider(heap: bool) -> Arc<dyn VirtualMemory> {
    if heap {
        Arc::new(HeapVirtualMemory::new())
    } else {
        default_provider()
    }
}

fn cmd_info(config: &RuntimeConfig) -> Result<()> {
    let provider = default_provider();

    println!("=== Hostcall Runtime ===");
    println!();
    println!("Pages:");
    println!("  Host page size:    {} bytes", host_page_size());
    println!("  Provider page:     {} bytes ({:?})", provider.page_size(), provider);
    println!("  Guest page size:   {} bytes", GUEST_PAGE_SIZE);
    println!();
    println!("Memory:");
    println!("  Reserve:           {} bytes", config.memory.reserve_rounded());
    println!("  Initial pages:     {}", config.memory.initial_pages);
    println!("  Scratch:           {} bytes", config.scratch_bytes);
    println!();
    println!("Capabilities:");
    println!("  log:               {}", config.capabilities.log);
    match &config.capabilities.files_root {
        Some(root) => println!(
            "  files:             {} ({})",
            root.display(),
            if config.capabilities.files_writable { "read-write" } else { "read-only" }
        ),
        None => println!("  files:             denied"),
    }

    Ok(())
}

fn cmd_imports(config: &RuntimeConfig, json: bool) -> Result<()> {
    let registry = build_registry(config)?;
    let imports = registry.imports();

    if json {
        println!("{}", serde_json::to_string_pretty(&imports)?);
        return Ok(());
    }

    println!("{} imports:", imports.len());
    for decl in &imports {
        match registry.signature(&decl.name, &decl.ty) {
            Some(sig) => println!("  {:<16} {:<28} {}", decl.name, decl.ty.to_string(), sig),
            None => println!("  {:<16} {}", decl.name, decl.ty),
        }
    }
    Ok(())
}

fn cmd_check(config: &RuntimeConfig, path: &Path) -> Result<()> {
    let decls = interface::load_interface(path)
        .with_context(|| format!("Failed to load interface {}", path.display()))?;
    let registry = build_registry(config)?;
    let missing = interface::missing_imports(&registry, &decls)?;

    println!("{} routines in {}:", decls.len(), path.display());
    for decl in &decls {
        let import = decl.import_decl()?;
        let status = if missing.contains(&import) { "MISSING" } else { "ok" };
        println!("  {:<8} {:<32} {}", status, import.name, import.ty);
    }

    if !missing.is_empty() {
        bail!("{} of {} routines are not provided by this host", missing.len(), decls.len());
    }
    Ok(())
}

fn cmd_probe(config: &RuntimeConfig, reserve: u64, grow: &[u64], heap: bool) -> Result<()> {
    let mut region = GuestMemoryRegion::create(provider(heap), reserve)
        .with_context(|| format!("Failed to reserve {} bytes", reserve))?;
    println!("Reserved {} bytes", region.reserved_size());

    for &request in grow {
        let before = region.current_size();
        match region.grow(request) {
            Ok(size) => println!("  grow({:>10}) -> {:>10} bytes (+{})", request, size, size - before),
            Err(e) => println!("  grow({:>10}) -> failed: {}", request, e),
        }
    }

    let end = region.current_size();
    match translate(&region, end.saturating_sub(6) as u32, 10u64) {
        Ok(_) => println!("  translate past end unexpectedly succeeded"),
        Err(e) => println!("  translate past end: {}", e),
    }
    region.destroy();

    // Echo a string through the marshaling layer
    let mut registry = ImportRegistry::<()>::new();
    let sig = Signature::new(&[Param::Str], &[Ret::Str]);
    let ty = sig.lower();
    registry.register_routine("echo", sig, |_, args| Ok(Returns::one(args.bytes(0)?)))?;
    let table = registry.link(&[ImportDecl::new("echo", ty)])?;

    let mut guest = GuestInstance::new(config, provider(heap), table, ())
        .context("Failed to create guest instance")?;
    let text = b"hello from the host";
    guest.memory_mut().write(64, text)?;
    StrDescriptor::new(64, text.len() as u64).write(guest.memory_mut(), 0)?;
    guest.call_import(0, &[Value::I32(32), Value::I32(0)], &mut [])?;

    let out = StrDescriptor::read(guest.memory(), 32)?;
    let echoed = out.resolve(guest.memory())?.as_bytes().to_vec();
    println!(
        "  echo: {:?} via scratch offset {}",
        String::from_utf8_lossy(&echoed),
        out.offset
    );
    if echoed != text {
        bail!("echo round trip corrupted the string");
    }
    guest.end_frame();

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => cmd_info(&config),
        Commands::Imports { json } => cmd_imports(&config, json),
        Commands::Check { interface } => cmd_check(&config, &interface),
        Commands::Probe { reserve, grow, heap } => cmd_probe(&config, reserve, &grow, heap),
    }
}
