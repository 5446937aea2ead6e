use crate::bios_loader::initialise_bios_data_area;
use crate::config::DosConfig;
use crate::dos_error_codes::DosErrorCode;
use crate::dos_file_system::{DosFileSystem, DosReadError};
use crate::environment::EnvironmentVariables;
use crate::exe_loader::{DosExecutable, InitialRegisters};
use crate::machine::{bytes_to_paragraphs, seg_off_to_linear, Cpu, Flag, Memory, Reg, SegmentedAddress};
use crate::mcb::{MemoryControlBlock, MCB_OWNER_NAME_BYTES};
use crate::memory_manager::{DosMemoryError, DosMemoryManager};
use crate::process_registry::DosProcessRegistry;
use crate::psp::{
	ProgramSegmentPrefix, FCB_BYTES, FILE_HANDLE_TABLE_SIZE, SAVED_VECTOR_INTERRUPTS,
	STANDARD_FILE_HANDLE_COUNT, UNUSED_FILE_HANDLE,
};

use log::{debug, error, info, warn};

// An environment block can't be bigger than 32KB.
const MAX_ENVIRONMENT_BYTES: usize = 0x8000;
// INT 21h/31h never leaves less than the PSP's first 96 bytes behind.
const MIN_RESIDENT_PARAGRAPHS: u16 = 6;
// stdin, stdout and stderr share the CON entry of the file table, then AUX, then PRN.
const ROOT_STANDARD_FILE_HANDLES: [u8; STANDARD_FILE_HANDLE_COUNT] = [1, 1, 1, 0, 2];
const TERMINATE_ADDRESS_INTERRUPT: u8 = 0x22;
// There is no current directory, so relative paths are taken from the root of this drive.
const DEFAULT_DRIVE: u8 = b'C';

#[derive(Debug, Clone, PartialEq)]
pub enum DosProcessError {
	/// Goes back to the guest as an error code.
	Dos(DosErrorCode),
	/// The MCB chain was overwritten. The caller decides whether to carry on.
	AllocatorCorrupted { segment: u16 },
	/// Nothing sensible can continue, e.g. the first program doesn't fit in memory.
	Fatal(String),
}

impl DosProcessError {
	pub fn error_code(&self) -> DosErrorCode {
		match self {
			DosProcessError::Dos(code) => *code,
			DosProcessError::AllocatorCorrupted{..} => DosErrorCode::MemoryControlBlockDestroyed,
			DosProcessError::Fatal(_) => DosErrorCode::InsufficientMemory,
		}
	}

	pub fn is_fatal(&self) -> bool {
		match self {
			DosProcessError::Fatal(_) => true,
			_ => false,
		}
	}
}

impl std::fmt::Display for DosProcessError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			DosProcessError::Dos(code) => write!(f, "DOS error {}", code),
			DosProcessError::AllocatorCorrupted{segment} => write!(f, "memory control block chain corrupted at {:04x}", segment),
			DosProcessError::Fatal(message) => write!(f, "fatal: {}", message),
		}
	}
}

impl From<DosErrorCode> for DosProcessError {
	fn from(code: DosErrorCode) -> DosProcessError {
		DosProcessError::Dos(code)
	}
}

impl From<DosMemoryError> for DosProcessError {
	fn from(err: DosMemoryError) -> DosProcessError {
		match err {
			DosMemoryError::ChainCorrupted{segment} => DosProcessError::AllocatorCorrupted{segment},
			other => DosProcessError::Dos(other.into()),
		}
	}
}

impl From<DosReadError> for DosProcessError {
	fn from(err: DosReadError) -> DosProcessError {
		match err {
			DosReadError::Dos(code) => DosProcessError::Dos(code),
			DosReadError::Host(message) => DosProcessError::Fatal(message),
		}
	}
}

/// What the caller of EXEC passes in besides the program path. This is the INT 21h/4Bh parameter
/// block with its far pointers already followed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecParameters {
	/// Zero means build a fresh block from the process-wide environment.
	pub environment_segment: u16,
	pub command_tail: Vec<u8>,
	pub fcb1: [u8; FCB_BYTES],
	pub fcb2: [u8; FCB_BYTES],
}

impl Default for ExecParameters {
	fn default() -> ExecParameters {
		ExecParameters {
			environment_segment: 0,
			command_tail: vec![],
			fcb1: [0; FCB_BYTES],
			fcb2: [0; FCB_BYTES],
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
	LoadAndRun,
	LoadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedProgram {
	pub psp_segment: u16,
	pub environment_segment: u16,
	pub block_paragraphs: u16,
	pub registers: InitialRegisters,
}

/// Goes in the high byte of the return code INT 21h/4Dh hands to the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TerminationKind {
	Normal = 0,
	ControlBreak = 1,
	CriticalError = 2,
	StayResident = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
	/// Registers have been switched back to the parent, which continues at `resume_address`.
	ResumeParent { parent_segment: u16, resume_address: SegmentedAddress },
	/// The program that ended was started by the host. The emulation should stop.
	TopLevelExit { return_code: u16 },
}

/// Loads programs into conventional memory and cleans up after them.
#[derive(Debug)]
pub struct DosProcessManager {
	pub memory_manager: DosMemoryManager,
	pub registry: DosProcessRegistry,
	pub environment: EnvironmentVariables,
	pub file_system: Box<dyn DosFileSystem>,
	dos_version: (u8, u8),
	conventional_memory_kb: u16,
	last_return_code: u16,
}

/// The fully qualified form of a program path, e.g. `games/zzt.exe` becomes `C:\GAMES\ZZT.EXE`.
fn qualify_program_path(program_path: &[u8]) -> Vec<u8> {
	let path: Vec<u8> = program_path.iter()
		.map(|c| if *c == b'/' { b'\\' } else { c.to_ascii_uppercase() })
		.collect();
	let (drive, rest) = if path.len() >= 2 && path[1] == b':' {
		(path[0], &path[2..])
	} else {
		(DEFAULT_DRIVE, &path[..])
	};
	let mut qualified = vec![drive, b':'];
	if rest.first() != Some(&b'\\') {
		qualified.push(b'\\');
	}
	qualified.extend_from_slice(rest);
	qualified
}

/// The name that goes in the owner field of the program's MCB: the file title without its
/// extension.
fn program_title(program_path: &[u8]) -> Vec<u8> {
	let file_name = program_path.rsplit(|c| *c == b'\\' || *c == b'/' || *c == b':').next().unwrap_or(program_path);
	file_name.iter()
		.take_while(|c| **c != b'.')
		.take(MCB_OWNER_NAME_BYTES)
		.map(|c| c.to_ascii_uppercase())
		.collect()
}

impl DosProcessManager {
	pub fn new(config: &DosConfig, file_system: Box<dyn DosFileSystem>) -> Result<DosProcessManager, DosProcessError> {
		config.validate().map_err(DosProcessError::Fatal)?;
		let mut memory_manager = DosMemoryManager::new(config.first_mcb_segment, config.end_segment)
			.map_err(|err| DosProcessError::Fatal(err.to_string()))?;
		memory_manager.strategy = config.strategy;
		Ok(DosProcessManager {
			memory_manager,
			registry: DosProcessRegistry::new(config.root_psp_segment),
			environment: EnvironmentVariables::from_pairs(config.environment.iter().cloned()),
			file_system,
			dos_version: config.dos_version,
			conventional_memory_kb: config.conventional_memory_kb(),
			last_return_code: 0,
		})
	}

	/// Sets up the BIOS data area, the MCB chain and the root PSP that the first program gets as
	/// its parent.
	pub fn initialise<M: Memory>(&mut self, machine: &mut M) {
		initialise_bios_data_area(machine, self.conventional_memory_kb);
		self.memory_manager.initialise(machine);
		let root_segment = self.registry.root_segment();
		let root = ProgramSegmentPrefix::new(root_segment);
		// The root is its own parent, like COMMAND.COM.
		root.initialise(machine, self.memory_manager.end_segment(), root_segment, self.dos_version);
		for (handle, file_index) in ROOT_STANDARD_FILE_HANDLES.iter().enumerate() {
			root.set_file_handle(machine, handle, *file_index);
		}
		root.save_vectors_from_table(machine);
		self.registry.set_current_segment(root_segment);
		info!("DOS initialised: {}KB conventional memory, root PSP at {:04x}", self.conventional_memory_kb, root_segment);
	}

	pub fn load_and_run<M: Memory + Cpu>(&mut self, machine: &mut M, program_path: &[u8], params: &ExecParameters) -> Result<LoadedProgram, DosProcessError> {
		self.load_program(machine, program_path, params, ExecMode::LoadAndRun)
	}

	pub fn load_only<M: Memory + Cpu>(&mut self, machine: &mut M, program_path: &[u8], params: &ExecParameters) -> Result<LoadedProgram, DosProcessError> {
		self.load_program(machine, program_path, params, ExecMode::LoadOnly)
	}

	pub fn load_program<M: Memory + Cpu>(&mut self, machine: &mut M, program_path: &[u8], params: &ExecParameters, mode: ExecMode) -> Result<LoadedProgram, DosProcessError> {
		let program_path = qualify_program_path(program_path);
		let file_bytes = self.file_system.read_file(&program_path)?;
		let executable = DosExecutable::parse(&file_bytes).map_err(|err| {
			warn!("Can't load {}: {}", String::from_utf8_lossy(&program_path), err);
			DosErrorCode::InvalidFormat
		})?;

		let parent_segment = self.registry.current_segment();
		let is_first_program = self.registry.is_empty();

		let builds_environment = params.environment_segment == 0;
		let environment_segment = if builds_environment {
			self.create_environment_block(machine, &program_path, parent_segment)?
		} else {
			params.environment_segment
		};

		let block = match self.reserve_program_block(machine, &executable, parent_segment, is_first_program) {
			Ok(block) => block,
			Err(err) => {
				if builds_environment {
					if let Err(free_err) = self.memory_manager.free_segment(machine, environment_segment) {
						error!("Couldn't release environment block {:04x}: {}", environment_segment, free_err);
					}
				}
				if is_first_program {
					return Err(DosProcessError::Fatal(format!("No room for {}: {}", String::from_utf8_lossy(&program_path), err)));
				}
				return Err(err);
			}
		};
		let psp_segment = block.data_segment();
		let block_paragraphs = block.size(machine);
		block.set_owner(machine, psp_segment);
		block.set_owner_name(machine, &program_title(&program_path));

		// Termination picks the parent's stack up from here.
		let parent = ProgramSegmentPrefix::new(parent_segment);
		let caller_stack = SegmentedAddress::new(machine.get_reg_u16(Reg::SS), machine.get_reg_u16(Reg::SP));
		parent.set_caller_stack(machine, caller_stack);

		let psp = ProgramSegmentPrefix::new(psp_segment);
		psp.initialise(machine, psp_segment.wrapping_add(block_paragraphs), parent_segment, self.dos_version);
		psp.set_environment_segment(machine, environment_segment);
		psp.save_vectors_from_table(machine);
		for handle in 0..STANDARD_FILE_HANDLE_COUNT {
			let file_index = parent.file_handle(machine, handle);
			psp.set_file_handle(machine, handle, file_index);
		}
		psp.set_command_tail(machine, &params.command_tail);
		psp.set_fcb(machine, 0, &params.fcb1);
		psp.set_fcb(machine, 1, &params.fcb2);

		let registers = executable.load_into_machine(machine, psp_segment, block_paragraphs);
		self.registry.push(psp_segment);

		if mode == ExecMode::LoadAndRun {
			set_initial_registers(machine, &registers);
		}
		info!("Loaded {} at {:04x} ({} paragraphs), entry {}", String::from_utf8_lossy(&program_path), psp_segment, block_paragraphs, registers.code);

		Ok(LoadedProgram {
			psp_segment,
			environment_segment,
			block_paragraphs,
			registers,
		})
	}

	fn create_environment_block<M: Memory>(&mut self, machine: &mut M, program_path: &[u8], owner: u16) -> Result<u16, DosProcessError> {
		let block_bytes = self.environment.build_block(program_path);
		if block_bytes.len() > MAX_ENVIRONMENT_BYTES {
			return Err(DosErrorCode::InvalidEnvironment.into());
		}
		let paragraphs = bytes_to_paragraphs(block_bytes.len()) as u16;
		let block = self.memory_manager.allocate(machine, paragraphs, owner)?;
		machine.insert_contiguous_bytes(&block_bytes, seg_off_to_linear(block.data_segment(), 0) as usize);
		debug!("Environment block at {:04x} ({} bytes)", block.data_segment(), block_bytes.len());
		Ok(block.data_segment())
	}

	fn reserve_program_block<M: Memory>(&mut self, machine: &mut M, executable: &DosExecutable, owner: u16, is_first_program: bool) -> Result<MemoryControlBlock, DosProcessError> {
		let range = executable.compute_alloc_range(machine, &self.memory_manager, None)?;
		// The first program gets everything that is left, whatever its header says.
		let size = if is_first_program {
			let largest = self.memory_manager.find_largest_free(machine).map_or(0, |block| block.size(machine));
			if largest < range.min_paragraphs {
				return Err(DosMemoryError::InsufficientMemory{available: largest}.into());
			}
			largest
		} else {
			range.max_paragraphs
		};
		match self.memory_manager.allocate(machine, size, owner) {
			Ok(block) => Ok(block),
			Err(DosMemoryError::InsufficientMemory{available}) if available >= range.min_paragraphs => {
				debug!("Wanted {} paragraphs, settling for {}", size, available);
				Ok(self.memory_manager.allocate(machine, available, owner)?)
			}
			Err(err) => Err(err.into()),
		}
	}

	/// Loads an overlay: the image goes to `load_segment` with `relocation_factor` added to its
	/// relocations. No memory is allocated and no process is created.
	pub fn load_overlay<M: Memory>(&mut self, machine: &mut M, program_path: &[u8], load_segment: u16, relocation_factor: u16) -> Result<(), DosProcessError> {
		let file_bytes = self.file_system.read_file(&qualify_program_path(program_path))?;
		match DosExecutable::parse(&file_bytes).map_err(|_| DosErrorCode::InvalidFormat)? {
			DosExecutable::Flat(image) => machine.insert_contiguous_bytes(&image, seg_off_to_linear(load_segment, 0) as usize),
			DosExecutable::Segmented(exe) => exe.relocate_into(machine, load_segment, relocation_factor),
		}
		debug!("Loaded overlay {} at {:04x}", String::from_utf8_lossy(program_path), load_segment);
		Ok(())
	}

	/// Makes a copy of the current PSP at `child_segment`. The child is not registered as a
	/// process; whoever asked for it decides what happens to it.
	pub fn create_child_psp<M: Memory>(&mut self, machine: &mut M, child_segment: u16, memory_top: u16) {
		let parent_segment = self.registry.current_segment();
		let parent = ProgramSegmentPrefix::new(parent_segment);
		let child = ProgramSegmentPrefix::new(child_segment);
		// The command tail, FCBs, environment and saved stack all come across with the copy.
		child.copy_from(machine, parent);
		child.set_next_segment(machine, memory_top);
		child.set_parent_segment(machine, parent_segment);
		child.save_vectors_from_table(machine);
		for handle in 0..FILE_HANDLE_TABLE_SIZE {
			let file_index = parent.file_handle(machine, handle);
			let inherited = if file_index != UNUSED_FILE_HANDLE && self.file_system.is_no_inherit(file_index) {
				UNUSED_FILE_HANDLE
			} else {
				file_index
			};
			child.set_file_handle(machine, handle, inherited);
		}
		debug!("Created child PSP at {:04x} from {:04x}", child_segment, parent_segment);
	}

	/// Whether a process other than `psp_segment` still has `file_index` in its handle table.
	fn file_shared_with_other_process<M: Memory>(&self, machine: &M, psp_segment: u16, parent_segment: u16, file_index: u8) -> bool {
		self.registry.processes().iter()
			.cloned()
			.chain(std::iter::once(parent_segment))
			.filter(|segment| *segment != psp_segment)
			.any(|segment| {
				let other = ProgramSegmentPrefix::new(segment);
				(0..FILE_HANDLE_TABLE_SIZE).any(|handle| other.file_handle(machine, handle) == file_index)
			})
	}

	fn close_process_files<M: Memory>(&mut self, machine: &mut M, psp: ProgramSegmentPrefix) {
		let parent_segment = psp.parent_segment(machine);
		for handle in STANDARD_FILE_HANDLE_COUNT..FILE_HANDLE_TABLE_SIZE {
			let file_index = psp.file_handle(machine, handle);
			if file_index == UNUSED_FILE_HANDLE {
				continue;
			}
			psp.set_file_handle(machine, handle, UNUSED_FILE_HANDLE);
			if self.file_shared_with_other_process(machine, psp.segment, parent_segment, file_index) {
				continue;
			}
			if let Err(err) = self.file_system.close(file_index) {
				warn!("Couldn't close handle {} (file {}) of {:04x}: {}", handle, file_index, psp.segment, err);
			}
		}
	}

	/// Ends the current process and works out where execution goes next.
	pub fn terminate<M: Memory + Cpu>(&mut self, machine: &mut M, exit_code: u8, kind: TerminationKind) -> Result<TerminationOutcome, DosProcessError> {
		let psp_segment = self.registry.current_segment();
		let psp = ProgramSegmentPrefix::new(psp_segment);
		self.last_return_code = ((kind as u16) << 8) | exit_code as u16;

		// A resident program keeps its files as well as its memory.
		if kind != TerminationKind::StayResident {
			self.close_process_files(machine, psp);
		}

		// The PSP is inside the memory about to be released, so read what's needed first.
		let saved_vectors: Vec<(u8, SegmentedAddress)> = SAVED_VECTOR_INTERRUPTS.iter()
			.filter_map(|interrupt_index| psp.saved_vector(machine, *interrupt_index).map(|vector| (*interrupt_index, vector)))
			.collect();
		let parent_segment = psp.parent_segment(machine);

		let mut result = Ok(());
		if kind != TerminationKind::StayResident {
			if let Err(err) = self.memory_manager.free_process_memory(machine, psp_segment) {
				error!("Couldn't release the memory of {:04x}: {}", psp_segment, err);
				result = Err(DosProcessError::from(err));
			}
		}

		for (interrupt_index, vector) in &saved_vectors {
			machine.set_interrupt_vector(*interrupt_index, *vector);
		}
		self.registry.pop_current();
		info!("Process {:04x} ended with 0x{:04x}", psp_segment, self.last_return_code);

		let resume_address = saved_vectors.iter()
			.find(|(interrupt_index, _)| *interrupt_index == TERMINATE_ADDRESS_INTERRUPT)
			.map(|(_, vector)| *vector)
			.unwrap_or_default();

		if parent_segment != psp_segment && self.registry.contains(parent_segment) {
			self.registry.set_current_segment(parent_segment);
			let parent = ProgramSegmentPrefix::new(parent_segment);
			machine.set_reg_u16(Reg::DS, parent_segment);
			machine.set_reg_u16(Reg::ES, parent_segment);
			let stack = parent.caller_stack(machine);
			if stack != SegmentedAddress::default() {
				machine.set_reg_u16(Reg::SS, stack.segment);
				machine.set_reg_u16(Reg::SP, stack.offset);
			}
			machine.set_reg_u16(Reg::CS, resume_address.segment);
			machine.set_reg_u16(Reg::IP, resume_address.offset);
			debug!("Resuming {:04x} at {}", parent_segment, resume_address);
			// Corruption only matters to the caller once the parent is running again.
			result.map(|()| TerminationOutcome::ResumeParent{parent_segment, resume_address})
		} else {
			let return_code = self.last_return_code;
			result.map(|()| TerminationOutcome::TopLevelExit{return_code})
		}
	}

	/// INT 21h/31h: shrinks the current process to `keep_paragraphs` and ends it without releasing
	/// anything.
	pub fn terminate_and_stay_resident<M: Memory + Cpu>(&mut self, machine: &mut M, exit_code: u8, keep_paragraphs: u16) -> Result<TerminationOutcome, DosProcessError> {
		let psp_segment = self.registry.current_segment();
		let keep_paragraphs = keep_paragraphs.max(MIN_RESIDENT_PARAGRAPHS);
		match self.memory_manager.resize(machine, psp_segment, keep_paragraphs, psp_segment) {
			Ok(block) => {
				let memory_top = psp_segment.wrapping_add(block.size(machine));
				ProgramSegmentPrefix::new(psp_segment).set_next_segment(machine, memory_top);
			}
			Err(err) => warn!("Resident program {:04x} keeps its whole block: {}", psp_segment, err),
		}
		self.terminate(machine, exit_code, TerminationKind::StayResident)
	}

	/// INT 21h/4Dh. The code can only be read once.
	pub fn take_last_return_code(&mut self) -> u16 {
		std::mem::replace(&mut self.last_return_code, 0)
	}
}

pub fn set_initial_registers<M: Cpu>(machine: &mut M, registers: &InitialRegisters) {
	machine.set_reg_u16(Reg::CS, registers.code.segment);
	machine.set_reg_u16(Reg::IP, registers.code.offset);
	machine.set_reg_u16(Reg::SS, registers.stack.segment);
	machine.set_reg_u16(Reg::SP, registers.stack.offset);
	machine.set_reg_u16(Reg::DS, registers.data_segment);
	machine.set_reg_u16(Reg::ES, registers.extra_segment);
	machine.set_flag(Flag::Interrupt, true);
}
