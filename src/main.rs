//! codeweave CLI - offline instrumentation of ELF files.
//!
//! Loads an ELF object or executable into memory, runs the instrumentation
//! pipeline against it and reports what would be deployed. Hooks and the
//! detour buffer are placed right after the loaded image.

use std::path::{Path, PathBuf};

use anyhow::Context;
use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use codeweave::analysis::split_into_blocks;
use codeweave::catalog::discover;
use codeweave::elf::{self, LoadedImage};
use codeweave::memory::{read_vec, BumpAllocator};
use codeweave::sink::{format_blocks, FileSink};
use codeweave::{HookAddresses, InstrumentConfig, InstrumentationSession, ProgressInfo, ProgressStage};

/// Instrument x86/x86-64 functions through detoured copies.
#[derive(Parser)]
#[command(name = "codeweave")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the functions that would be instrumented
    Functions {
        /// ELF file to load
        path: PathBuf,

        /// Load address for relocatable objects
        #[arg(long, value_parser = parse_addr)]
        base: Option<u64>,
    },

    /// Show the blocks and jump tables of each function
    Blocks {
        /// ELF file to load
        path: PathBuf,

        /// Load address for relocatable objects
        #[arg(long, value_parser = parse_addr)]
        base: Option<u64>,

        /// Only analyse this function
        #[arg(short, long)]
        function: Option<String>,
    },

    /// Instrument every function and deploy the detours in memory
    Instrument {
        /// ELF file to load
        path: PathBuf,

        /// Load address for relocatable objects
        #[arg(long, value_parser = parse_addr)]
        base: Option<u64>,

        /// Record accesses through the stack pointer too
        #[arg(long)]
        record_stack: bool,

        /// Generate code without touching the image
        #[arg(long)]
        dry_run: bool,

        /// Alignment of each copy in the detour buffer
        #[arg(long, default_value = "16")]
        alignment: usize,

        /// Functions to leave alone (comma-separated)
        #[arg(long, value_delimiter = ',')]
        skip: Vec<String>,

        /// Size of the executable arena holding the detour buffer
        #[arg(long, default_value = "16777216")]
        arena_size: usize,

        /// Write block and IR listings to this file
        #[arg(long)]
        dump: Option<PathBuf>,

        /// Write the deployed detour buffer to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(&digits.replace('_', ""), 16).map_err(|e| format!("invalid address '{s}': {e}"))
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Functions { path, base } => {
            list_functions(&path, base)?;
        }

        Commands::Blocks { path, base, function } => {
            show_blocks(&path, base, function.as_deref())?;
        }

        Commands::Instrument {
            path,
            base,
            record_stack,
            dry_run,
            alignment,
            skip,
            arena_size,
            dump,
            output,
        } => {
            let options = InstrumentOptions {
                record_stack,
                dry_run,
                alignment,
                skip,
                arena_size,
                dump,
                output,
            };
            instrument(&path, base, options)?;
        }
    }

    Ok(())
}

fn load(path: &Path, base: Option<u64>) -> anyhow::Result<LoadedImage> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let image = elf::load(&data, &name, base)?;
    println!(
        "Loaded {} ({:?}, {} sections, {} symbols)",
        path.display(),
        image.arch,
        image.module.sections.len(),
        image.symbols.len()
    );
    Ok(image)
}

fn list_functions(path: &Path, base: Option<u64>) -> anyhow::Result<()> {
    let image = load(path, base)?;
    let functions = discover(&image.module, &image.symbols)?;

    println!("Functions ({}):", functions.len());
    println!("{:<20} {:>12}  Name", "Address", "Size");
    for func in &functions {
        println!(
            "0x{:016X} {:>12}  {}",
            func.addr,
            ByteSize::b(func.size as u64),
            func.name
        );
    }
    Ok(())
}

fn show_blocks(path: &Path, base: Option<u64>, only: Option<&str>) -> anyhow::Result<()> {
    let image = load(path, base)?;
    let functions = discover(&image.module, &image.symbols)?;

    for mut func in functions {
        if only.is_some_and(|name| name != func.name) {
            continue;
        }
        let code = read_vec(&image.memory, func.addr, func.size)?;
        match split_into_blocks(&func, &code, &image.module, &image.memory, image.arch) {
            Ok(analysis) => {
                func.blocks = analysis.blocks;
                func.jump_tables = analysis.jump_tables;
                print!("{}", format_blocks(&func));
            }
            Err(err) if err.is_function_local() => {
                println!("function {} @ 0x{:X}: {}", func.name, func.addr, err);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

struct InstrumentOptions {
    record_stack: bool,
    dry_run: bool,
    alignment: usize,
    skip: Vec<String>,
    arena_size: usize,
    dump: Option<PathBuf>,
    output: Option<PathBuf>,
}

/// Map one trap-filled stub per hook right after the image.
fn map_hooks(image: &mut LoadedImage) -> anyhow::Result<(HookAddresses, u64)> {
    const STUB: u64 = 16;
    let start = image.end.next_multiple_of(0x1000);
    let stub = |i: u64| start + i * STUB;
    let hooks = HookAddresses {
        on_function_entry: stub(0),
        on_function_exit: stub(1),
        on_block_end: stub(2),
        on_call_pre: stub(3),
        on_call_post: stub(4),
        on_indirect_call: stub(5),
        on_indirect_jump: stub(6),
    };
    let end = stub(7);
    image
        .memory
        .map(start, vec![0xCC; (end - start) as usize], true)?;
    Ok((hooks, end.next_multiple_of(0x1000)))
}

fn instrument(path: &Path, base: Option<u64>, options: InstrumentOptions) -> anyhow::Result<()> {
    let mut image = load(path, base)?;
    let (hooks, arena) = map_hooks(&mut image)?;
    image.memory.map_zeroed(arena, options.arena_size, true)?;
    let mut alloc = BumpAllocator::new(arena, options.arena_size);

    // Create progress bar
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );

    let pb_clone = pb.clone();
    let config = InstrumentConfig {
        arch: image.arch,
        hooks,
        function_alignment: options.alignment,
        record_stack_accesses: options.record_stack,
        skip_functions: options.skip,
        dry_run: options.dry_run,
        progress_callback: Some(std::sync::Arc::new(move |info: &ProgressInfo| {
            let pct = if info.total > 0 {
                (info.current as f64 / info.total as f64 * 100.0) as u64
            } else {
                0
            };

            let msg = match info.stage {
                ProgressStage::Instrumenting => {
                    let item = info.current_item.as_deref().unwrap_or("");
                    format!(
                        "{} - {} ({} done, {} skipped)",
                        info.stage.name(),
                        item,
                        info.instrumented,
                        info.skipped
                    )
                }
                _ => info.stage.name().to_string(),
            };

            pb_clone.set_position(pct);
            pb_clone.set_message(msg);
        })),
    };

    let mut session = InstrumentationSession::init(image.module.clone(), &image.symbols, config)?;
    if let Some(ref dump) = options.dump {
        session.set_sink(Box::new(FileSink::create(dump)?));
    }
    let stats = session.instrument_all(&mut image.memory, &mut alloc)?;
    pb.finish_with_message("Complete");

    println!();
    println!("Functions:     {}", stats.functions);
    println!("Instrumented:  {}", stats.instrumented);
    println!("Skipped:       {}", stats.skipped);
    println!("Blocks:        {}", stats.blocks);
    println!("Jump tables:   {}", stats.jump_tables);
    println!("Block infos:   {}", session.block_infos().len());
    println!("Relocations:   {}", stats.relocations);
    println!("Detour buffer: {}", ByteSize::b(stats.buffer_size as u64));
    for skipped in session.skipped() {
        println!("  skipped {} @ 0x{:X}: {}", skipped.name, skipped.addr, skipped.reason);
    }

    if let (Some(output), Some(deployment)) = (&options.output, session.deployment()) {
        if let Some(addr) = deployment.buffer().addr() {
            let bytes = image.memory.bytes(addr, deployment.buffer().size())?;
            std::fs::write(output, &bytes).with_context(|| format!("failed to write {}", output.display()))?;
            println!("Detour buffer written to {} (base 0x{:X})", output.display(), addr);
        }
    }

    session.teardown(&mut alloc);
    Ok(())
}
