use libpseudos::config::DosConfig;
use libpseudos::dos_file_system::StandardDosFileSystem;
use libpseudos::machine::{Machine, Memory};
use libpseudos::memory_manager::DosMemoryManager;
use libpseudos::process_manager::{DosProcessManager, ExecParameters};

use clap::Parser;
use log::{error, LevelFilter, Log, Metadata, Record};

use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pseudos")]
#[command(about = "Loads a DOS program into conventional memory and shows where everything went", long_about = None)]
struct Cli {
	/// Host directory that is the root of drive C:
	root_dir: PathBuf,

	/// Program to load, relative to the root directory
	program: String,

	/// Command line arguments for the program
	#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
	args: Vec<String>,

	/// Extra environment variable for the program, as KEY=VALUE
	#[arg(short, long = "env", value_parser = parse_environment_variable)]
	environment: Vec<(String, String)>,
}

fn parse_environment_variable(arg: &str) -> Result<(String, String), String> {
	match arg.find('=') {
		Some(pos) if pos > 0 => Ok((arg[..pos].to_string(), arg[pos + 1..].to_string())),
		_ => Err(format!("expected KEY=VALUE, got {}", arg)),
	}
}

struct StderrLogger;

impl Log for StderrLogger {
	fn enabled(&self, metadata: &Metadata) -> bool {
		metadata.level() <= log::max_level()
	}

	fn log(&self, record: &Record) {
		if self.enabled(record.metadata()) {
			eprintln!("[{:5}] {}: {}", record.level(), record.target(), record.args());
		}
	}

	fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging() {
	let level = std::env::var("PSEUDOS_LOG").ok()
		.and_then(|value| value.parse::<LevelFilter>().ok())
		.unwrap_or(LevelFilter::Info);
	if log::set_logger(&LOGGER).is_ok() {
		log::set_max_level(level);
	}
}

/// Something like MEM /C.
fn print_memory_map<M: Memory>(machine: &M, memory_manager: &DosMemoryManager) {
	let blocks = match memory_manager.blocks(machine) {
		Ok(blocks) => blocks,
		Err(err) => {
			error!("Can't walk the memory chain: {}", err);
			return;
		}
	};
	println!("  MCB   Data  Paragraphs  Owner  Name");
	for block in blocks {
		let name = if block.is_free(machine) {
			"(free)".to_string()
		} else {
			String::from_utf8_lossy(&block.owner_name(machine)).into_owned()
		};
		println!("  {:04x}  {:04x}  {:10}  {:04x}   {}", block.segment, block.data_segment(), block.size(machine), block.owner(machine), name);
	}
}

fn main() {
	init_logging();
	let cli = Cli::parse();

	// DOS keeps the space that separated the program name from its arguments.
	let command_tail = if cli.args.is_empty() {
		vec![]
	} else {
		format!(" {}", cli.args.join(" ")).into_bytes()
	};

	let config = DosConfig::default();
	let file_system = StandardDosFileSystem::new(cli.root_dir);
	let mut process_manager = match DosProcessManager::new(&config, Box::new(file_system)) {
		Ok(process_manager) => process_manager,
		Err(err) => {
			eprintln!("Bad configuration: {}", err);
			std::process::exit(1);
		}
	};
	for (key, value) in &cli.environment {
		process_manager.environment.set(key, value);
	}
	let mut machine = Machine::new(config.memory_bytes);
	process_manager.initialise(&mut machine);

	let params = ExecParameters {
		command_tail,
		..ExecParameters::default()
	};
	let loaded = match process_manager.load_only(&mut machine, cli.program.as_bytes(), &params) {
		Ok(loaded) => loaded,
		Err(err) => {
			eprintln!("Couldn't load {}: {}", cli.program, err);
			std::process::exit(1);
		}
	};

	println!("{} loaded at PSP {:04x}, environment at {:04x}", cli.program.to_uppercase(), loaded.psp_segment, loaded.environment_segment);
	println!("  CS:IP {}  SS:SP {}  DS {:04x}  ES {:04x}", loaded.registers.code, loaded.registers.stack, loaded.registers.data_segment, loaded.registers.extra_segment);
	print_memory_map(&machine, &process_manager.memory_manager);
}
