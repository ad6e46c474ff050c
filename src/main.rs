use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use allegrex::analyst::FunctionDb;
use allegrex::mips::MipsOpcode;
use allegrex::{GuestMemory, HaltSyscalls, JitCore, RuntimeConfig};

fn parse_hex(s: &str) -> Result<u32, String> {
    let t = s.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => t.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{s}': {e}"))
}

#[derive(Parser)]
#[command(name = "allegrex")]
#[command(about = "MIPS32 to x86-64 dynamic binary translator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flat MIPS binary image
    Run {
        /// Raw little-endian MIPS image
        image: PathBuf,

        /// Guest address the image is loaded at
        #[arg(long, value_parser = parse_hex, default_value = "0x08000000")]
        base: u32,

        /// Entry point (defaults to the load base)
        #[arg(long, value_parser = parse_hex)]
        entry: Option<u32>,

        /// Stop after this many guest cycles (0 = run until halt)
        #[arg(long, default_value = "0")]
        cycles: u64,

        /// Runtime configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Function database to match against
        #[arg(long)]
        func_db: Option<PathBuf>,

        /// Log every compiled block
        #[arg(long)]
        trace_jit: bool,

        /// Print block cache statistics on exit
        #[arg(long)]
        stats: bool,
    },
    /// Scan an image for functions and write a database
    Scan {
        /// Raw little-endian MIPS image
        image: PathBuf,

        /// Guest address the image is loaded at
        #[arg(long, value_parser = parse_hex, default_value = "0x08000000")]
        base: u32,

        /// Where to write the database (TOML)
        #[arg(short, long, default_value = "functions.toml")]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            image,
            base,
            entry,
            cycles,
            config,
            func_db,
            trace_jit,
            stats,
        } => cmd_run(image, base, entry, cycles, config, func_db, trace_jit, stats),
        Commands::Scan {
            image,
            base,
            output,
        } => cmd_scan(image, base, output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    image: PathBuf,
    base: u32,
    entry: Option<u32>,
    cycles: u64,
    config_path: Option<PathBuf>,
    func_db: Option<PathBuf>,
    trace_jit: bool,
    stats: bool,
) -> Result<(), String> {
    let mut config = match config_path {
        Some(p) => RuntimeConfig::load(&p).map_err(|e| e.to_string())?,
        None => RuntimeConfig::default(),
    };
    if trace_jit {
        config.trace_jit = true;
    }
    if func_db.is_some() {
        config.func_db = func_db;
    }

    let data = std::fs::read(&image)
        .map_err(|e| format!("cannot read {}: {e}", image.display()))?;

    let mut core = JitCore::new(config, Box::new(HaltSyscalls)).map_err(|e| e.to_string())?;
    core.mem_mut()
        .write_block(base, &data)
        .map_err(|e| e.to_string())?;
    core.scan_functions(base, base + data.len() as u32);
    core.reset(entry.unwrap_or(base));

    let mut total: u64 = 0;
    while core.state().is_running() && (cycles == 0 || total < cycles) {
        total += core.run_slice() as u64;
    }

    println!("halted after {total} cycles, v0 = {:#x}", core.state().gpr[2]);
    if stats {
        let s = core.stats();
        println!(
            "blocks: {} live / {} invalid, {} guest bytes -> {} code bytes",
            s.num_blocks - s.num_invalid,
            s.num_invalid,
            s.total_guest_bytes,
            s.total_code_bytes
        );
    }
    Ok(())
}

fn cmd_scan(image: PathBuf, base: u32, output: PathBuf) -> Result<(), String> {
    let data = std::fs::read(&image)
        .map_err(|e| format!("cannot read {}: {e}", image.display()))?;

    let mut mem = GuestMemory::new();
    mem.write_block(base, &data).map_err(|e| e.to_string())?;

    let mut db = FunctionDb::new();
    db.scan(|a| MipsOpcode(mem.read32(a)), base, base + data.len() as u32);
    db.save(&output).map_err(|e| e.to_string())?;
    println!(
        "found {} functions, wrote {}",
        db.functions().len(),
        output.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_addresses() {
        assert_eq!(parse_hex("0x08000000").unwrap(), allegrex::mem::RAM_BASE);
        assert_eq!(parse_hex("1024").unwrap(), 1024);
        assert!(parse_hex("0xGG").is_err());
    }
}
