#![forbid(unsafe_code)]

#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::cell::RefCell;
    use std::fs::File;
    use std::io::{self, BufWriter, Write};
    use std::path::PathBuf;
    use std::rc::Rc;

    use anyhow::{bail, Context, Result};
    use clap::Parser;
    use pcx_cpu_core::exec::{ExecDispatcher, RealModeIvt, RunStop};
    use pcx_cpu_core::jit::{JitConfig, OptimizerKind};
    use pcx_cpu_core::{CpuState, FlatBus, PortDevice};
    use pcx_x86::{SegReg, Width};
    use tracing::{debug, info};
    use tracing_subscriber::EnvFilter;

    /// Blocks per `run` call; debug-console output is flushed between slices.
    const SLICE_BLOCKS: u64 = 10_000;
    const DEBUGCON_PORT: u16 = 0xE9;

    #[derive(Debug, Parser)]
    #[command(about = "Run a flat real-mode image on the pcx interpreter")]
    pub struct Args {
        /// Raw image copied into guest RAM at `--load-addr`.
        #[arg(long)]
        image: PathBuf,

        /// Linear load address; execution starts at `0000:<load-addr>`.
        #[arg(long, default_value = "0x7c00", value_parser = parse_u32)]
        load_addr: u32,

        /// Guest RAM size in MiB.
        #[arg(long, default_value_t = 16)]
        ram_mib: u32,

        /// Stop after executing at most N blocks.
        #[arg(long)]
        max_blocks: Option<u64>,

        /// Executions of a block before it is queued for compilation (0 disables the compiler).
        #[arg(long, default_value_t = JitConfig::default().compile_threshold)]
        threshold: u64,

        /// Optimizer run by the background compiler.
        #[arg(long, default_value = "identity")]
        optimizer: OptimizerKind,

        /// Write a CPU snapshot here on exit.
        #[arg(long)]
        snapshot_out: Option<PathBuf>,

        /// Log filter, e.g. `pcx_cpu_core=debug`. Falls back to `RUST_LOG`, then `warn`.
        #[arg(long)]
        log: Option<String>,
    }

    fn parse_u32(s: &str) -> Result<u32, String> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse(),
        };
        parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
    }

    /// Bochs-style debug console: bytes written to port 0xE9 are collected for the host.
    struct DebugCon(Rc<RefCell<Vec<u8>>>);

    impl PortDevice for DebugCon {
        fn read(&mut self, _port: u16, _width: Width) -> u32 {
            u32::from(DEBUGCON_PORT)
        }

        fn write(&mut self, _port: u16, _width: Width, value: u32) {
            self.0.borrow_mut().push(value as u8);
        }
    }

    fn init_logging(filter: Option<&str>) -> Result<()> {
        let filter = match filter {
            Some(directives) => EnvFilter::try_new(directives)
                .with_context(|| format!("invalid --log filter {directives:?}"))?,
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
        Ok(())
    }

    pub fn main() -> Result<()> {
        let args = Args::parse();
        init_logging(args.log.as_deref())?;

        let ram_bytes = usize::try_from(args.ram_mib)
            .ok()
            .and_then(|mib| mib.checked_mul(1024 * 1024))
            .context("RAM size overflow")?;
        let image = std::fs::read(&args.image)
            .with_context(|| format!("failed to read image: {}", args.image.display()))?;
        let load_end = u64::from(args.load_addr) + image.len() as u64;
        if load_end > ram_bytes as u64 {
            bail!(
                "image of {} bytes at {:#x} does not fit in {} MiB of RAM",
                image.len(),
                args.load_addr,
                args.ram_mib
            );
        }
        if args.load_addr > 0xFFFF {
            bail!("load address {:#x} is not reachable from segment 0", args.load_addr);
        }

        let mut bus = FlatBus::new(ram_bytes);
        bus.load(args.load_addr, &image);
        let debugcon = Rc::new(RefCell::new(Vec::new()));
        bus.ports_mut().register(
            DEBUGCON_PORT..=DEBUGCON_PORT,
            Box::new(DebugCon(Rc::clone(&debugcon))),
        );

        let mut cpu = CpuState::new();
        cpu.eip = args.load_addr;
        cpu.set_sp(args.load_addr);

        let config = JitConfig {
            enabled: args.threshold != 0,
            optimizer: args.optimizer,
            ..JitConfig::with_threshold(args.threshold)
        };
        info!(?config, image = %args.image.display(), "starting");
        let mut exec = ExecDispatcher::new(config);
        let mut ivt = RealModeIvt::new();
        let mut out = BufWriter::new(io::stdout());

        let mut blocks = 0u64;
        let mut instructions = 0u64;
        let result = loop {
            let budget = match args.max_blocks {
                Some(max) if blocks >= max => break Ok(()),
                Some(max) => (max - blocks).min(SLICE_BLOCKS),
                None => SLICE_BLOCKS,
            };
            let exit = match exec.run(&mut cpu, &mut bus, &mut ivt, budget) {
                Ok(exit) => exit,
                Err(err) => break Err(err),
            };
            blocks += exit.blocks;
            instructions += exit.instructions;
            out.write_all(&debugcon.borrow_mut().split_off(0))?;
            debug!(blocks, instructions, "slice done");

            if exit.stop == RunStop::Halted {
                // Nothing in this runner raises interrupts, so a halt is final.
                eprintln!("guest halted after {blocks} blocks ({instructions} instructions)");
                break Ok(());
            }
        };
        out.write_all(&debugcon.borrow_mut().split_off(0))?;
        out.flush()?;

        print_registers(&mut cpu);
        let cache = exec.blocks().cache_stats();
        eprintln!(
            "cache: {} hits, {} misses, {} invalidations, {} evictions",
            cache.hits, cache.misses, cache.invalidations, cache.evictions
        );
        let compiler = exec.blocks().compiler_stats();
        eprintln!(
            "compiler: {} enqueued, {} dropped, {} displaced, {} evicted, {} compiled, {} rejected",
            compiler.enqueued,
            compiler.dropped,
            compiler.displaced,
            compiler.evicted,
            compiler.compiled,
            compiler.rejected
        );
        for event in &ivt.unhandled {
            eprintln!("undelivered: {event:?}");
        }

        if let Some(path) = &args.snapshot_out {
            let mut f = BufWriter::new(File::create(path).with_context(|| {
                format!("failed to create snapshot file: {}", path.display())
            })?);
            pcx_snapshot::save_cpu(&cpu, &mut f)
                .with_context(|| format!("failed to write snapshot: {}", path.display()))?;
            f.flush()?;
        }

        result.context("execution stopped")
    }

    fn print_registers(cpu: &mut CpuState) {
        const NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
        for (name, value) in NAMES.iter().zip(cpu.gpr) {
            eprintln!("{name}={value:08x}");
        }
        let eip = cpu.eip;
        let eflags = cpu.eflags();
        eprintln!("eip={:08x} eflags={:08x}", eip, eflags);
        let segs = SegReg::ALL
            .iter()
            .map(|&seg| format!("{seg:?}={:04x}", cpu.seg(seg).selector).to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        eprintln!("{segs}");
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    native::main()
}
