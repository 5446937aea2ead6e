use crate::dos_error_codes::DosErrorCode;
use crate::exe_loader::InitialRegisters;
use crate::machine::{Cpu, Flag, Memory, Reg, RegHalf, SegmentedAddress};
use crate::memory_manager::{DosMemoryError, MemoryStrategy};
use crate::process_manager::{DosProcessError, DosProcessManager, ExecParameters, TerminationKind, TerminationOutcome};
use crate::psp::{ProgramSegmentPrefix, FCB_BYTES};

use log::{debug, error, trace, warn};

// Offsets into the INT 21h/4Bh parameter block.
const EXEC_ENVIRONMENT_SEGMENT: u32 = 0x00;
const EXEC_COMMAND_TAIL: u32 = 0x02;
const EXEC_FCB1: u32 = 0x06;
const EXEC_FCB2: u32 = 0x0a;
// Only filled in for AL=1, so the caller can start the child itself.
const EXEC_CHILD_STACK: u32 = 0x0e;
const EXEC_CHILD_CODE: u32 = 0x12;
// The overlay form (AL=3) has its own layout.
const OVERLAY_LOAD_SEGMENT: u32 = 0x00;
const OVERLAY_RELOCATION_FACTOR: u32 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DosInterruptResult {
	ShouldReturn,
	/// The running program ended and the registers now belong to its parent.
	ProcessResumed,
	/// The program started by the host ended with this return code.
	ShouldExit(u16),
	/// DOS itself can't continue, e.g. the memory chain is destroyed.
	ShouldHalt,
}

/// Whatever runs the CPU calls this when the guest executes INT n for an interrupt DOS owns.
pub trait EventHandler {
	fn handle_interrupt<M: Memory + Cpu>(&mut self, machine: &mut M, interrupt_index: u8);
}

#[derive(Debug)]
pub struct DosEventHandler {
	pub process_manager: DosProcessManager,
	pub result: DosInterruptResult,
}

fn set_success<M: Cpu>(machine: &mut M) {
	machine.set_flag(Flag::Carry, false);
}

fn set_error<M: Cpu>(machine: &mut M, error_code: DosErrorCode) {
	machine.set_flag(Flag::Carry, true);
	machine.set_reg_u16(Reg::AX, error_code as u16);
}

fn read_far_pointer<M: Memory>(machine: &M, addr: u32) -> SegmentedAddress {
	SegmentedAddress {
		offset: machine.peek_u16(addr),
		segment: machine.peek_u16(addr + 2),
	}
}

fn write_far_pointer<M: Memory>(machine: &mut M, addr: u32, pointer: SegmentedAddress) {
	machine.poke_u16(addr, pointer.offset);
	machine.poke_u16(addr + 2, pointer.segment);
}

fn read_fcb<M: Memory>(machine: &M, pointer: SegmentedAddress) -> [u8; FCB_BYTES] {
	let mut fcb = [0u8; FCB_BYTES];
	fcb.copy_from_slice(&machine.read_bytes(pointer.linear(), FCB_BYTES));
	fcb
}

/// Follows the pointers in an EXEC parameter block at ES:BX.
fn read_exec_parameters<M: Memory>(machine: &M, block_addr: u32) -> ExecParameters {
	let command_tail_pointer = read_far_pointer(machine, block_addr + EXEC_COMMAND_TAIL);
	// The tail is a count byte followed by the characters.
	let command_tail_len = machine.peek_u8(command_tail_pointer.linear()) as usize;
	ExecParameters {
		environment_segment: machine.peek_u16(block_addr + EXEC_ENVIRONMENT_SEGMENT),
		command_tail: machine.read_bytes(command_tail_pointer.linear() + 1, command_tail_len),
		fcb1: read_fcb(machine, read_far_pointer(machine, block_addr + EXEC_FCB1)),
		fcb2: read_fcb(machine, read_far_pointer(machine, block_addr + EXEC_FCB2)),
	}
}

impl DosEventHandler {
	pub fn new(process_manager: DosProcessManager) -> DosEventHandler {
		DosEventHandler {
			process_manager,
			result: DosInterruptResult::ShouldReturn,
		}
	}

	fn current_psp_segment(&self) -> u16 {
		self.process_manager.registry.current_segment()
	}

	fn report_process_error<M: Cpu>(&mut self, machine: &mut M, err: DosProcessError) {
		match &err {
			DosProcessError::Fatal(message) => {
				error!("{}", message);
				self.result = DosInterruptResult::ShouldHalt;
				return;
			}
			DosProcessError::AllocatorCorrupted{segment} => error!("Memory control block chain destroyed at {:04x}", segment),
			DosProcessError::Dos(_) => {}
		}
		set_error(machine, err.error_code());
	}

	fn finish_termination(&mut self, outcome: Result<TerminationOutcome, DosProcessError>) {
		self.result = match outcome {
			Ok(TerminationOutcome::ResumeParent{..}) => DosInterruptResult::ProcessResumed,
			Ok(TerminationOutcome::TopLevelExit{return_code}) => DosInterruptResult::ShouldExit(return_code),
			Err(err) => {
				error!("Couldn't end the process cleanly: {}", err);
				DosInterruptResult::ShouldHalt
			}
		};
	}

	fn terminate<M: Memory + Cpu>(&mut self, machine: &mut M, exit_code: u8, kind: TerminationKind) {
		let outcome = self.process_manager.terminate(machine, exit_code, kind);
		self.finish_termination(outcome);
	}

	/// On failure the largest block that could have been had goes in BX.
	fn report_memory_error<M: Memory + Cpu>(&mut self, machine: &mut M, err: DosMemoryError) {
		let (error_code, largest) = match err {
			DosMemoryError::InsufficientMemory{available} => (DosErrorCode::InsufficientMemory, available),
			DosMemoryError::ChainCorrupted{segment} => {
				error!("Memory control block chain destroyed at {:04x}", segment);
				// Anything free before the damage can still be offered to the guest.
				match self.process_manager.memory_manager.find_largest_free(machine) {
					Some(block) => (DosErrorCode::InsufficientMemory, block.size(machine)),
					None => (DosErrorCode::MemoryControlBlockDestroyed, 0),
				}
			}
			other => (other.into(), 0),
		};
		machine.set_reg_u16(Reg::BX, largest);
		set_error(machine, error_code);
	}

	fn handle_exec<M: Memory + Cpu>(&mut self, machine: &mut M) {
		let exec_mode = machine.get_reg_u8(Reg::AX, RegHalf::Low);
		let program_path = machine.read_null_terminated_string(machine.get_seg_reg(Reg::DS, Reg::DX));
		let block_addr = machine.get_seg_reg(Reg::ES, Reg::BX);
		debug!("EXEC {} of {}", exec_mode, String::from_utf8_lossy(&program_path));
		match exec_mode {
			0x00 => {
				let params = read_exec_parameters(machine, block_addr);
				// Carry has to be clear when the child starts, not when EXEC returns.
				set_success(machine);
				if let Err(err) = self.process_manager.load_and_run(machine, &program_path, &params) {
					self.report_process_error(machine, err);
				}
			}
			0x01 => {
				let params = read_exec_parameters(machine, block_addr);
				match self.process_manager.load_only(machine, &program_path, &params) {
					Ok(loaded) => {
						let InitialRegisters{code, stack, ..} = loaded.registers;
						write_far_pointer(machine, block_addr + EXEC_CHILD_STACK, stack);
						write_far_pointer(machine, block_addr + EXEC_CHILD_CODE, code);
						set_success(machine);
					}
					Err(err) => self.report_process_error(machine, err),
				}
			}
			0x03 => {
				let load_segment = machine.peek_u16(block_addr + OVERLAY_LOAD_SEGMENT);
				let relocation_factor = machine.peek_u16(block_addr + OVERLAY_RELOCATION_FACTOR);
				match self.process_manager.load_overlay(machine, &program_path, load_segment, relocation_factor) {
					Ok(()) => set_success(machine),
					Err(err) => self.report_process_error(machine, err),
				}
			}
			_ => {
				warn!("Unsupported EXEC mode: 0x{:02x}", exec_mode);
				set_error(machine, DosErrorCode::InvalidFunction);
			}
		}
	}

	fn handle_interrupt_21h<M: Memory + Cpu>(&mut self, machine: &mut M) {
		let dos_int = machine.get_reg_u8(Reg::AX, RegHalf::High);
		trace!("DOS interrupt: 0x{:02x}", dos_int);
		match dos_int {
			0x00 => {
				// Terminate program, the CP/M way.
				self.terminate(machine, 0, TerminationKind::Normal);
			}
			0x25 => {
				// Store DS:DX as an entry of the interrupt vector table.
				let interrupt_index = machine.get_reg_u8(Reg::AX, RegHalf::Low);
				let vector = SegmentedAddress::new(machine.get_reg_u16(Reg::DS), machine.get_reg_u16(Reg::DX));
				machine.set_interrupt_vector(interrupt_index, vector);
			}
			0x30 => {
				// DOS version. Programs see whatever is in their own PSP.
				let psp = ProgramSegmentPrefix::new(self.current_psp_segment());
				let (major, minor) = psp.dos_version(machine);
				machine.set_reg_u16(Reg::AX, (minor as u16) << 8 | major as u16);
				machine.set_reg_u16(Reg::BX, 0);
				machine.set_reg_u16(Reg::CX, 0);
			}
			0x31 => {
				// Terminate and stay resident. DX is the number of paragraphs to keep.
				let exit_code = machine.get_reg_u8(Reg::AX, RegHalf::Low);
				let keep_paragraphs = machine.get_reg_u16(Reg::DX);
				let outcome = self.process_manager.terminate_and_stay_resident(machine, exit_code, keep_paragraphs);
				self.finish_termination(outcome);
			}
			0x35 => {
				// Get an entry of the interrupt vector table and store it in ES:BX.
				let vector = machine.get_interrupt_vector(machine.get_reg_u8(Reg::AX, RegHalf::Low));
				machine.set_reg_u16(Reg::BX, vector.offset);
				machine.set_reg_u16(Reg::ES, vector.segment);
			}
			0x48 => {
				// Allocate BX paragraphs. The segment goes in AX.
				let size = machine.get_reg_u16(Reg::BX);
				let owner = self.current_psp_segment();
				match self.process_manager.memory_manager.allocate(machine, size, owner) {
					Ok(block) => {
						set_success(machine);
						machine.set_reg_u16(Reg::AX, block.data_segment());
					}
					Err(err) => self.report_memory_error(machine, err),
				}
			}
			0x49 => {
				// Free the block at ES.
				let segment = machine.get_reg_u16(Reg::ES);
				match self.process_manager.memory_manager.free_segment(machine, segment) {
					Ok(()) => set_success(machine),
					Err(err) => set_error(machine, err.into()),
				}
			}
			0x4a => {
				// Resize the block at ES to BX paragraphs.
				let segment = machine.get_reg_u16(Reg::ES);
				let size = machine.get_reg_u16(Reg::BX);
				let owner = self.current_psp_segment();
				match self.process_manager.memory_manager.resize(machine, segment, size, owner) {
					Ok(_) => set_success(machine),
					Err(err) => self.report_memory_error(machine, err),
				}
			}
			0x4b => {
				self.handle_exec(machine);
			}
			0x4c => {
				let exit_code = machine.get_reg_u8(Reg::AX, RegHalf::Low);
				self.terminate(machine, exit_code, TerminationKind::Normal);
			}
			0x4d => {
				// Return code of the last child: AL is what it passed, AH is how it ended.
				let return_code = self.process_manager.take_last_return_code();
				machine.set_reg_u16(Reg::AX, return_code);
				set_success(machine);
			}
			0x50 => {
				let segment = machine.get_reg_u16(Reg::BX);
				self.process_manager.registry.set_current_segment(segment);
			}
			0x51 | 0x62 => {
				machine.set_reg_u16(Reg::BX, self.current_psp_segment());
			}
			0x55 => {
				// Make a copy of the current PSP at DX. SI is the end of the child's memory.
				let child_segment = machine.get_reg_u16(Reg::DX);
				let memory_top = machine.get_reg_u16(Reg::SI);
				self.process_manager.create_child_psp(machine, child_segment, memory_top);
			}
			0x58 => {
				let strategy_func = machine.get_reg_u8(Reg::AX, RegHalf::Low);
				match strategy_func {
					0x00 => {
						let strategy = self.process_manager.memory_manager.strategy;
						machine.set_reg_u16(Reg::AX, strategy.to_u16());
						set_success(machine);
					}
					0x01 => {
						match MemoryStrategy::from_u16(machine.get_reg_u16(Reg::BX)) {
							Ok(strategy) => {
								self.process_manager.memory_manager.strategy = strategy;
								set_success(machine);
							}
							Err(error_code) => set_error(machine, error_code),
						}
					}
					_ => {
						warn!("Unknown allocation strategy func: 0x{:02x}", strategy_func);
						set_error(machine, DosErrorCode::InvalidFunction);
					}
				}
			}
			_ => {
				warn!("Unknown DOS interrupt: 0x{:02x}", dos_int);
				set_error(machine, DosErrorCode::InvalidFunction);
			}
		}
	}
}

impl EventHandler for DosEventHandler {
	fn handle_interrupt<M: Memory + Cpu>(&mut self, machine: &mut M, interrupt_index: u8) {
		self.result = DosInterruptResult::ShouldReturn;

		match interrupt_index {
			0x20 => {
				// Terminate program.
				self.terminate(machine, 0, TerminationKind::Normal);
			}
			// This is the DOS interrupt.
			// http://spike.scu.edu.au/~barry/interrupts.html
			// http://stanislavs.org/helppc/int_21.html
			0x21 => {
				self.handle_interrupt_21h(machine);
			}
			_ => {
				warn!("Unhandled interrupt: 0x{:02x}", interrupt_index);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::DosConfig;
	use crate::dos_file_system::InMemoryDosFileSystem;
	use crate::machine::{seg_off_to_linear, Machine};
	use crate::mcb::MemoryControlBlock;

	// Scratch space for strings and parameter blocks, well above anything the tests allocate.
	const SCRATCH_SEGMENT: u16 = 0x9000;

	fn boot() -> (Machine, DosEventHandler, u16) {
		let config = DosConfig::default();
		let mut file_system = InMemoryDosFileSystem::new();
		file_system.insert_file(b"SHELL.COM", vec![0x90; 0x10]);
		file_system.insert_file(b"CHILD.COM", vec![0xb4, 0x4c, 0xcd, 0x21]);
		let mut process_manager = DosProcessManager::new(&config, Box::new(file_system)).unwrap();
		let mut machine = Machine::new(config.memory_bytes);
		process_manager.initialise(&mut machine);
		let shell = process_manager.load_and_run(&mut machine, b"SHELL.COM", &ExecParameters::default()).unwrap();
		process_manager.memory_manager.resize(&mut machine, shell.psp_segment, 0x100, shell.psp_segment).unwrap();
		(machine, DosEventHandler::new(process_manager), shell.psp_segment)
	}

	fn call_dos(machine: &mut Machine, handler: &mut DosEventHandler, ax: u16) {
		machine.set_reg_u16(Reg::AX, ax);
		handler.handle_interrupt(machine, 0x21);
	}

	/// Writes a path and an EXEC parameter block into scratch memory and points DS:DX and ES:BX
	/// at them.
	fn prepare_exec(machine: &mut Machine, path: &[u8], command_tail: &[u8]) -> u32 {
		let scratch = seg_off_to_linear(SCRATCH_SEGMENT, 0);
		machine.insert_contiguous_bytes(path, scratch as usize);
		machine.poke_u8(scratch + path.len() as u32, 0);
		machine.poke_u8(scratch + 0x80, command_tail.len() as u8);
		machine.insert_contiguous_bytes(command_tail, scratch as usize + 0x81);
		let block_addr = scratch + 0x40;
		machine.poke_u16(block_addr + EXEC_ENVIRONMENT_SEGMENT, 0);
		write_far_pointer(machine, block_addr + EXEC_COMMAND_TAIL, SegmentedAddress::new(SCRATCH_SEGMENT, 0x80));
		write_far_pointer(machine, block_addr + EXEC_FCB1, SegmentedAddress::new(SCRATCH_SEGMENT, 0xc0));
		write_far_pointer(machine, block_addr + EXEC_FCB2, SegmentedAddress::new(SCRATCH_SEGMENT, 0xd0));
		machine.set_reg_u16(Reg::DS, SCRATCH_SEGMENT);
		machine.set_reg_u16(Reg::DX, 0);
		machine.set_reg_u16(Reg::ES, SCRATCH_SEGMENT);
		machine.set_reg_u16(Reg::BX, 0x40);
		block_addr
	}

	#[test] fn test_allocate_and_free() {
		let (mut machine, mut handler, shell_segment) = boot();
		machine.set_reg_u16(Reg::BX, 0x20);
		call_dos(&mut machine, &mut handler, 0x4800);
		assert!(!machine.get_flag(Flag::Carry));
		let segment = machine.get_reg_u16(Reg::AX);
		let block = MemoryControlBlock::for_data_segment(segment).unwrap();
		assert_eq!(block.owner(&machine), shell_segment);
		assert_eq!(block.size(&machine), 0x20);

		machine.set_reg_u16(Reg::ES, segment);
		call_dos(&mut machine, &mut handler, 0x4900);
		assert!(!machine.get_flag(Flag::Carry));
		assert!(block.is_free(&machine));

		machine.set_reg_u16(Reg::ES, 0x1234);
		call_dos(&mut machine, &mut handler, 0x4900);
		assert!(machine.get_flag(Flag::Carry));
		assert_eq!(machine.get_reg_u16(Reg::AX), DosErrorCode::InvalidMemoryBlockAddress as u16);
	}

	#[test] fn test_allocate_too_much_reports_largest() {
		let (mut machine, mut handler, _) = boot();
		machine.set_reg_u16(Reg::BX, 0xffff);
		call_dos(&mut machine, &mut handler, 0x4800);
		assert!(machine.get_flag(Flag::Carry));
		assert_eq!(machine.get_reg_u16(Reg::AX), DosErrorCode::InsufficientMemory as u16);
		let largest = handler.process_manager.memory_manager.find_largest_free(&mut machine).unwrap();
		assert_eq!(machine.get_reg_u16(Reg::BX), largest.size(&machine));
	}

	#[test] fn test_allocate_on_destroyed_chain() {
		let (mut machine, mut handler, shell_segment) = boot();
		let shell_block = MemoryControlBlock::for_data_segment(shell_segment).unwrap();
		let free_block = shell_block.next(&machine).unwrap();
		machine.poke_u8(free_block.segment as u32 * 16, b'X');
		machine.set_reg_u16(Reg::BX, 0x10);
		call_dos(&mut machine, &mut handler, 0x4800);
		assert!(machine.get_flag(Flag::Carry));
		assert_eq!(machine.get_reg_u16(Reg::AX), DosErrorCode::MemoryControlBlockDestroyed as u16);
		assert_eq!(machine.get_reg_u16(Reg::BX), 0);
		assert_eq!(handler.result, DosInterruptResult::ShouldReturn);
	}

	#[test] fn test_allocate_on_damaged_chain_offers_block_before_damage() {
		let (mut machine, mut handler, _) = boot();
		let manager = &handler.process_manager.memory_manager;
		let hole = manager.allocate(&mut machine, 0x20, 0x7777).unwrap();
		let fence = manager.allocate(&mut machine, 0x10, 0x7777).unwrap();
		manager.free(&mut machine, hole).unwrap();
		let tail = fence.next(&machine).unwrap();
		machine.poke_u8(tail.segment as u32 * 16, b'X');

		machine.set_reg_u16(Reg::BX, 0x30);
		call_dos(&mut machine, &mut handler, 0x4800);
		assert!(machine.get_flag(Flag::Carry));
		assert_eq!(machine.get_reg_u16(Reg::AX), DosErrorCode::InsufficientMemory as u16);
		assert_eq!(machine.get_reg_u16(Reg::BX), 0x20);
		assert_eq!(handler.result, DosInterruptResult::ShouldReturn);
	}

	#[test] fn test_resize() {
		let (mut machine, mut handler, shell_segment) = boot();
		machine.set_reg_u16(Reg::ES, shell_segment);
		machine.set_reg_u16(Reg::BX, 0x80);
		call_dos(&mut machine, &mut handler, 0x4a00);
		assert!(!machine.get_flag(Flag::Carry));
		assert_eq!(MemoryControlBlock::for_data_segment(shell_segment).unwrap().size(&machine), 0x80);

		machine.set_reg_u16(Reg::BX, 0xffff);
		call_dos(&mut machine, &mut handler, 0x4a00);
		assert!(machine.get_flag(Flag::Carry));
		assert_eq!(machine.get_reg_u16(Reg::AX), DosErrorCode::InsufficientMemory as u16);
		let end = DosConfig::default().end_segment;
		assert_eq!(machine.get_reg_u16(Reg::BX), end - shell_segment);
		assert_eq!(MemoryControlBlock::for_data_segment(shell_segment).unwrap().size(&machine), 0x80);
	}

	#[test] fn test_interrupt_vectors() {
		let (mut machine, mut handler, _) = boot();
		machine.set_reg_u16(Reg::DS, 0x1234);
		machine.set_reg_u16(Reg::DX, 0x5678);
		call_dos(&mut machine, &mut handler, 0x2523);
		assert_eq!(machine.get_interrupt_vector(0x23), SegmentedAddress::new(0x1234, 0x5678));
		call_dos(&mut machine, &mut handler, 0x3523);
		assert_eq!(machine.get_reg_u16(Reg::ES), 0x1234);
		assert_eq!(machine.get_reg_u16(Reg::BX), 0x5678);
	}

	#[test] fn test_exec_and_exit_returns_to_parent() {
		let (mut machine, mut handler, shell_segment) = boot();
		machine.set_interrupt_vector(0x22, SegmentedAddress::new(shell_segment, 0x0105));
		prepare_exec(&mut machine, b"CHILD.COM", b" HELLO");
		call_dos(&mut machine, &mut handler, 0x4b00);
		assert_eq!(handler.result, DosInterruptResult::ShouldReturn);
		let child_segment = handler.process_manager.registry.current_segment();
		assert_ne!(child_segment, shell_segment);
		assert_eq!(machine.get_reg_u16(Reg::CS), child_segment);
		assert_eq!(machine.get_reg_u16(Reg::IP), 0x100);
		assert_eq!(ProgramSegmentPrefix::new(child_segment).command_tail(&machine), b" HELLO".to_vec());

		call_dos(&mut machine, &mut handler, 0x4c07);
		assert_eq!(handler.result, DosInterruptResult::ProcessResumed);
		assert_eq!(machine.get_reg_u16(Reg::CS), shell_segment);
		assert_eq!(machine.get_reg_u16(Reg::IP), 0x0105);
		assert_eq!(handler.process_manager.registry.current_segment(), shell_segment);

		call_dos(&mut machine, &mut handler, 0x4d00);
		assert_eq!(machine.get_reg_u16(Reg::AX), 0x0007);
	}

	#[test] fn test_exec_load_only_fills_parameter_block() {
		let (mut machine, mut handler, _) = boot();
		let block_addr = prepare_exec(&mut machine, b"CHILD.COM", b"");
		call_dos(&mut machine, &mut handler, 0x4b01);
		assert!(!machine.get_flag(Flag::Carry));
		let child_segment = handler.process_manager.registry.current_segment();
		assert_eq!(read_far_pointer(&machine, block_addr + EXEC_CHILD_CODE), SegmentedAddress::new(child_segment, 0x100));
		assert_eq!(read_far_pointer(&machine, block_addr + EXEC_CHILD_STACK), SegmentedAddress::new(child_segment, 0xfffe));
	}

	#[test] fn test_exec_missing_program() {
		let (mut machine, mut handler, _) = boot();
		prepare_exec(&mut machine, b"GONE.EXE", b"");
		call_dos(&mut machine, &mut handler, 0x4b00);
		assert!(machine.get_flag(Flag::Carry));
		assert_eq!(machine.get_reg_u16(Reg::AX), DosErrorCode::FileNotFound as u16);
		assert_eq!(handler.result, DosInterruptResult::ShouldReturn);
	}

	#[test] fn test_top_level_exit() {
		let (mut machine, mut handler, _) = boot();
		call_dos(&mut machine, &mut handler, 0x4c02);
		assert_eq!(handler.result, DosInterruptResult::ShouldExit(0x0002));

		let (mut machine, mut handler, _) = boot();
		handler.handle_interrupt(&mut machine, 0x20);
		assert_eq!(handler.result, DosInterruptResult::ShouldExit(0));
	}

	#[test] fn test_dos_version() {
		let (mut machine, mut handler, _) = boot();
		machine.set_reg_u16(Reg::BX, 0xffff);
		call_dos(&mut machine, &mut handler, 0x3000);
		assert_eq!(machine.get_reg_u8(Reg::AX, RegHalf::Low), 5);
		assert_eq!(machine.get_reg_u8(Reg::AX, RegHalf::High), 0);
		assert_eq!(machine.get_reg_u16(Reg::BX), 0);
	}

	#[test] fn test_current_psp() {
		let (mut machine, mut handler, shell_segment) = boot();
		call_dos(&mut machine, &mut handler, 0x6200);
		assert_eq!(machine.get_reg_u16(Reg::BX), shell_segment);
		machine.set_reg_u16(Reg::BX, 0x2000);
		call_dos(&mut machine, &mut handler, 0x5000);
		call_dos(&mut machine, &mut handler, 0x5100);
		assert_eq!(machine.get_reg_u16(Reg::BX), 0x2000);
	}

	#[test] fn test_create_child_psp() {
		let (mut machine, mut handler, shell_segment) = boot();
		machine.set_reg_u16(Reg::DX, 0x3000);
		machine.set_reg_u16(Reg::SI, 0x3100);
		call_dos(&mut machine, &mut handler, 0x5500);
		let child = ProgramSegmentPrefix::new(0x3000);
		assert_eq!(child.parent_segment(&machine), shell_segment);
		assert_eq!(child.next_segment(&machine), 0x3100);
		assert!(!handler.process_manager.registry.contains(0x3000));
	}

	#[test] fn test_allocation_strategy() {
		let (mut machine, mut handler, _) = boot();
		machine.set_reg_u16(Reg::BX, 0x0002);
		call_dos(&mut machine, &mut handler, 0x5801);
		assert!(!machine.get_flag(Flag::Carry));
		call_dos(&mut machine, &mut handler, 0x5800);
		assert_eq!(machine.get_reg_u16(Reg::AX), 0x0002);

		machine.set_reg_u16(Reg::BX, 0x0003);
		call_dos(&mut machine, &mut handler, 0x5801);
		assert!(machine.get_flag(Flag::Carry));
		assert_eq!(machine.get_reg_u16(Reg::AX), DosErrorCode::InvalidFunction as u16);
	}

	#[test] fn test_unknown_function() {
		let (mut machine, mut handler, _) = boot();
		call_dos(&mut machine, &mut handler, 0x9900);
		assert!(machine.get_flag(Flag::Carry));
		assert_eq!(machine.get_reg_u16(Reg::AX), DosErrorCode::InvalidFunction as u16);
	}

	#[test] fn test_stay_resident() {
		let (mut machine, mut handler, shell_segment) = boot();
		machine.set_interrupt_vector(0x22, SegmentedAddress::new(shell_segment, 0x0200));
		prepare_exec(&mut machine, b"CHILD.COM", b"");
		call_dos(&mut machine, &mut handler, 0x4b00);
		let child_segment = handler.process_manager.registry.current_segment();
		machine.set_reg_u16(Reg::DX, 0x40);
		call_dos(&mut machine, &mut handler, 0x3100);
		assert_eq!(handler.result, DosInterruptResult::ProcessResumed);
		let block = MemoryControlBlock::for_data_segment(child_segment).unwrap();
		assert_eq!(block.owner(&machine), child_segment);
		assert_eq!(block.size(&machine), 0x40);
		call_dos(&mut machine, &mut handler, 0x4d00);
		assert_eq!(machine.get_reg_u16(Reg::AX), 0x0300);
	}
}
