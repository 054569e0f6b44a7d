use clap::{Parser as ClapParser, ValueEnum};
use log::LevelFilter;
use std::{path::PathBuf, process};

use squawk::demo::DemoProgram;
use squawk::{CollectorKind, TraceFlags, Vm, VmResult, VmSettings};

const DEFAULT_RAM: u32 = 64 * 1024;
const DEFAULT_EEPROM: u32 = 16 * 1024;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CollectorArg {
    /// Two-space copying
    Cheney,
    /// Mark-compact with partial collections
    Lisp2,
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(required_unless_present = "demo", help = "The image file to run")]
    image: Option<PathBuf>,

    #[arg(long, conflicts_with = "image", help = "Run the built-in allocation demo")]
    demo: bool,

    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_RAM, help = "RAM size of the demo image")]
    ram: u32,

    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_EEPROM, help = "EEPROM size of the demo image")]
    eeprom: u32,

    #[arg(long, value_name = "BASE", help = "Write <BASE><n>.image after every collection")]
    checkpoint: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = CollectorArg::Lisp2)]
    collector: CollectorArg,

    #[arg(long, value_name = "PERCENT", default_value_t = 10, help = "Ideal young generation size")]
    young: u32,

    #[arg(long, help = "Always collect all of RAM")]
    full_gc: bool,

    #[arg(long, help = "Disable time slice preemption")]
    no_yield: bool,

    #[arg(long, help = "Collect before every allocation")]
    excessive_gc: bool,

    #[arg(long, requires = "excessive_gc", help = "Also size stack chunks exactly")]
    very_excessive_gc: bool,

    #[arg(long, help = "Print counters on exit")]
    stats: bool,

    #[arg(long)]
    trace_instructions: bool,
    #[arg(long)]
    trace_methods: bool,
    #[arg(long)]
    trace_allocation: bool,
    #[arg(long)]
    trace_frames: bool,
    #[arg(long)]
    trace_gc: bool,
    #[arg(long)]
    trace_gc_verbose: bool,
    #[arg(long)]
    trace_gc_summary: bool,
    #[arg(long)]
    trace_migration: bool,
    #[arg(long)]
    trace_migration_verbose: bool,
    #[arg(long)]
    trace_image: bool,
    #[arg(long)]
    trace_eeprom_gc: bool,
}

impl Cli {
    fn trace_flags(&self) -> TraceFlags {
        [
            (self.trace_instructions, TraceFlags::INSTRUCTIONS),
            (self.trace_methods, TraceFlags::METHODS),
            (self.trace_allocation, TraceFlags::ALLOCATION),
            (self.trace_frames, TraceFlags::FRAMES),
            (self.trace_gc, TraceFlags::GC),
            (self.trace_gc_verbose, TraceFlags::GC | TraceFlags::GC_VERBOSE),
            (self.trace_gc_summary, TraceFlags::GC_SUMMARY),
            (self.trace_migration, TraceFlags::MIGRATION),
            (self.trace_migration_verbose, TraceFlags::MIGRATION | TraceFlags::MIGRATION_VERBOSE),
            (self.trace_image, TraceFlags::IMAGE),
            (self.trace_eeprom_gc, TraceFlags::EEPROM_GC),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .fold(TraceFlags::empty(), |acc, (_, flag)| acc | flag)
    }

    fn settings(&self) -> VmSettings {
        VmSettings {
            collector: match self.collector {
                CollectorArg::Cheney => CollectorKind::Cheney,
                CollectorArg::Lisp2 => CollectorKind::Lisp2,
            },
            young_percent: self.young,
            full_gc: self.full_gc,
            no_yield: self.no_yield,
            excessive_gc: self.excessive_gc,
            very_excessive_gc: self.very_excessive_gc,
            stats: self.stats,
            checkpoint: self.checkpoint.clone(),
            trace: self.trace_flags(),
        }
    }
}

/// `RUST_LOG` wins; otherwise warnings, plus whatever the trace flags and
/// `--stats` ask for.
fn init_logging(settings: &VmSettings) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Warn);
    if settings.stats {
        builder.filter_module("squawk", LevelFilter::Info);
    }
    for (target, flags) in TraceFlags::TARGETS {
        let enabled = settings.trace & flags;
        if enabled.is_empty() {
            continue;
        }
        let level = if enabled.is_verbose() {
            LevelFilter::Trace
        } else {
            LevelFilter::Debug
        };
        builder.filter_module(target, level);
    }
    builder.parse_default_env();
    builder.init();
}

fn run(cli: &Cli, settings: VmSettings) -> VmResult<i32> {
    let mut vm = match &cli.image {
        Some(path) => Vm::load(path, settings)?,
        None => {
            let om = DemoProgram::default().build(cli.eeprom, cli.ram, &settings);
            Vm::boot(om, settings)?
        }
    };
    vm.run()
}

fn main() {
    let cli = Cli::parse();
    let settings = cli.settings();
    init_logging(&settings);

    std::panic::set_hook(Box::new(|info| {
        log::error!(target: "squawk", "VM invariant violated: {info}");
        eprintln!("squawk: {info}");
        process::exit(1);
    }));

    match run(&cli, settings) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("squawk: {err}");
            process::exit(1);
        }
    }
}
