//! The MinZ compiler command-line interface.
//!
//! Reads a module in the textual MIR form, runs the optimization pipeline, and writes the
//! selected backend's assembly. `--emit-mir` stops after optimization and prints the MIR text;
//! `--verbose` prints every recorded optimization decision in the order it happened.

use anyhow::{anyhow, bail, Context as _, Result};
use clap::Parser;
use minz_codegen::settings::{Flags, OptLevel};
use minz_codegen::{isa, write_module, Context};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "minzc",
    version,
    about = "MinZ MIR optimizer and 8/16-bit code generator"
)]
struct Cli {
    /// Input module in textual MIR form.
    input: Option<PathBuf>,

    /// Output path. Defaults to the input path with the target's extension.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target backend name (see --targets).
    #[arg(short, long, default_value = "z80")]
    target: String,

    /// Optimization level: none, basic or full (also 0, 1, 2).
    #[arg(short = 'O', long = "opt", default_value = "full")]
    opt_level: String,

    /// Base address for the low-memory register tier, e.g. $F000.
    #[arg(long)]
    lowmem_base: Option<String>,

    /// Disable the self-modifying calling conventions.
    #[arg(long)]
    no_smc: bool,

    /// Print the optimized MIR instead of assembly.
    #[arg(long)]
    emit_mir: bool,

    /// Print every optimization decision.
    #[arg(short, long)]
    verbose: bool,

    /// List the registered target backends and exit.
    #[arg(long)]
    targets: bool,
}

fn parse_address(text: &str) -> Result<u16> {
    let parsed = if let Some(hex) = text.strip_prefix('$') {
        u16::from_str_radix(hex, 16)
    } else if let Some(hex) = text.strip_prefix("0x") {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|_| anyhow!("bad address '{}'", text))
}

fn list_targets() -> Result<()> {
    for name in isa::BACKEND_NAMES {
        let isa = isa::lookup(name)?;
        let caps = isa.capabilities();
        println!(
            "{:8} .{:6} smc={} shadow={} indexed={} native16={}",
            isa.name(),
            isa.extension(),
            caps.supports_smc,
            caps.shadow_registers,
            caps.indexed_addressing,
            caps.native_16bit,
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.targets {
        return list_targets();
    }

    let input = match cli.input {
        Some(input) => input,
        None => bail!("no input file; try --help"),
    };
    let text = std::fs::read_to_string(&input)
        .with_context(|| format!("reading {}", input.display()))?;
    let module = minz_reader::parse_module(&text)
        .map_err(|e| anyhow!("{}: {}", input.display(), e))?;

    let opt_level: OptLevel = cli
        .opt_level
        .parse()
        .map_err(|()| anyhow!("bad optimization level '{}'", cli.opt_level))?;
    let mut flags = Flags::builder().opt_level(opt_level).enable_smc(!cli.no_smc);
    if let Some(base) = &cli.lowmem_base {
        flags = flags.lowmem_base(parse_address(base)?);
    }
    let flags = flags.build();

    let isa = isa::lookup(&cli.target)?;
    let mut ctx = Context::new(module, flags);

    let artifact = if cli.emit_mir {
        minz_codegen::opt::optimize(
            &mut ctx.module,
            &ctx.flags,
            isa.capabilities().supports_smc,
            &mut ctx.diagnostics,
        )?;
        write_module(&ctx.module)
    } else {
        ctx.compile(&*isa)
            .with_context(|| format!("compiling {}", input.display()))?
    };

    if cli.verbose {
        for record in ctx.diagnostics.records() {
            println!("{}", record);
        }
    }

    let output = cli.output.unwrap_or_else(|| {
        if cli.emit_mir {
            input.with_extension("opt.mir")
        } else {
            input.with_extension(isa.extension())
        }
    });
    std::fs::write(&output, artifact)
        .with_context(|| format!("writing {}", output.display()))?;
    log::info!("wrote {}", output.display());
    Ok(())
}
