use crate::machine::{seg_off_to_linear, Memory, SegmentedAddress};

use log::warn;

// https://en.wikipedia.org/wiki/Program_Segment_Prefix
pub const PSP_SIZE_BYTES: u16 = 0x100;
// The Program Segment Prefix is 256 bytes in size, which is 16 paragraphs.
pub const PSP_SIZE_PARAGRAPHS: u16 = 0x10;
pub const FILE_HANDLE_TABLE_SIZE: usize = 20;
pub const UNUSED_FILE_HANDLE: u8 = 0xff;
// stdin, stdout, stderr, stdaux and stdprn are always passed on to children.
pub const STANDARD_FILE_HANDLE_COUNT: usize = 5;
pub const FCB_BYTES: usize = 16;
pub const COMMAND_TAIL_MAX_CHARS: usize = 126;
// The three vectors a process header keeps a copy of, in the order they are stored.
pub const SAVED_VECTOR_INTERRUPTS: [u8; 3] = [0x22, 0x23, 0x24];

const PSP_INT20: u16 = 0x00;
const PSP_NEXT_SEGMENT: u16 = 0x02;
const PSP_FAR_CALL: u16 = 0x05;
const PSP_SAVED_VECTORS: u16 = 0x0a;
const PSP_PARENT_SEGMENT: u16 = 0x16;
const PSP_FILE_HANDLE_TABLE: u16 = 0x18;
const PSP_ENVIRONMENT_SEGMENT: u16 = 0x2c;
const PSP_CALLER_SP: u16 = 0x2e;
const PSP_CALLER_SS: u16 = 0x30;
const PSP_FILE_HANDLE_TABLE_SIZE: u16 = 0x32;
const PSP_FILE_HANDLE_TABLE_POINTER: u16 = 0x34;
const PSP_PREVIOUS_PSP: u16 = 0x38;
const PSP_DOS_VERSION: u16 = 0x40;
const PSP_INT21_RETF: u16 = 0x50;
const PSP_FCB1: u16 = 0x5c;
const PSP_FCB2: u16 = 0x6c;
const PSP_COMMAND_TAIL_LEN: u16 = 0x80;
const PSP_COMMAND_TAIL: u16 = 0x81;

/// A view onto the 256 byte process header at `segment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramSegmentPrefix {
	pub segment: u16,
}

impl ProgramSegmentPrefix {
	pub fn new(segment: u16) -> ProgramSegmentPrefix {
		ProgramSegmentPrefix{segment}
	}

	fn addr(&self, offset: u16) -> u32 {
		seg_off_to_linear(self.segment, offset)
	}

	/// Clears the header and fills in the parts that are the same for every process. Everything
	/// process specific is left for the caller.
	pub fn initialise<M: Memory>(&self, machine: &mut M, next_segment: u16, parent_segment: u16, dos_version: (u8, u8)) {
		for i in 0..PSP_SIZE_BYTES {
			machine.poke_u8(self.addr(i), 0);
		}
		// CP/M exit: Always INT 20h
		machine.poke_u8(self.addr(PSP_INT20), 0xcd);
		machine.poke_u8(self.addr(PSP_INT20 + 1), 0x20);
		self.set_next_segment(machine, next_segment);
		// CP/M style far call into the dispatcher. Nothing uses it, but it has to look like a CALL.
		machine.poke_u8(self.addr(PSP_FAR_CALL), 0x9a);
		machine.poke_u16(self.addr(PSP_FAR_CALL + 1), 0xfef0);
		machine.poke_u16(self.addr(PSP_FAR_CALL + 3), 0xf01d);
		self.set_parent_segment(machine, parent_segment);
		for i in 0..FILE_HANDLE_TABLE_SIZE {
			self.set_file_handle(machine, i, UNUSED_FILE_HANDLE);
		}
		machine.poke_u16(self.addr(PSP_FILE_HANDLE_TABLE_SIZE), FILE_HANDLE_TABLE_SIZE as u16);
		machine.poke_u16(self.addr(PSP_FILE_HANDLE_TABLE_POINTER), PSP_FILE_HANDLE_TABLE);
		machine.poke_u16(self.addr(PSP_FILE_HANDLE_TABLE_POINTER + 2), self.segment);
		machine.poke_u16(self.addr(PSP_PREVIOUS_PSP), 0xffff);
		machine.poke_u16(self.addr(PSP_PREVIOUS_PSP + 2), 0xffff);
		machine.poke_u8(self.addr(PSP_DOS_VERSION), dos_version.0);
		machine.poke_u8(self.addr(PSP_DOS_VERSION + 1), dos_version.1);
		machine.poke_u8(self.addr(PSP_INT21_RETF), 0xcd);
		machine.poke_u8(self.addr(PSP_INT21_RETF + 1), 0x21);
		machine.poke_u8(self.addr(PSP_INT21_RETF + 2), 0xcb);
		self.set_command_tail(machine, b"");
	}

	/// Copies the whole header from `other`. The far pointer to the handle table is the only
	/// self-referencing field, so it is pointed at the new copy.
	pub fn copy_from<M: Memory>(&self, machine: &mut M, other: ProgramSegmentPrefix) {
		let bytes = machine.read_bytes(other.addr(0), PSP_SIZE_BYTES as usize);
		machine.insert_contiguous_bytes(&bytes, self.addr(0) as usize);
		if machine.peek_u16(self.addr(PSP_FILE_HANDLE_TABLE_POINTER + 2)) == other.segment {
			machine.poke_u16(self.addr(PSP_FILE_HANDLE_TABLE_POINTER + 2), self.segment);
		}
	}

	pub fn next_segment<M: Memory>(&self, machine: &M) -> u16 {
		machine.peek_u16(self.addr(PSP_NEXT_SEGMENT))
	}

	pub fn set_next_segment<M: Memory>(&self, machine: &mut M, segment: u16) {
		machine.poke_u16(self.addr(PSP_NEXT_SEGMENT), segment);
	}

	pub fn parent_segment<M: Memory>(&self, machine: &M) -> u16 {
		machine.peek_u16(self.addr(PSP_PARENT_SEGMENT))
	}

	pub fn set_parent_segment<M: Memory>(&self, machine: &mut M, segment: u16) {
		machine.poke_u16(self.addr(PSP_PARENT_SEGMENT), segment);
	}

	pub fn environment_segment<M: Memory>(&self, machine: &M) -> u16 {
		machine.peek_u16(self.addr(PSP_ENVIRONMENT_SEGMENT))
	}

	pub fn set_environment_segment<M: Memory>(&self, machine: &mut M, segment: u16) {
		machine.poke_u16(self.addr(PSP_ENVIRONMENT_SEGMENT), segment);
	}

	fn saved_vector_offset(interrupt_index: u8) -> Option<u16> {
		SAVED_VECTOR_INTERRUPTS.iter()
			.position(|i| *i == interrupt_index)
			.map(|pos| PSP_SAVED_VECTORS + pos as u16 * 4)
	}

	/// Only 0x22, 0x23 and 0x24 are kept in the header.
	pub fn saved_vector<M: Memory>(&self, machine: &M, interrupt_index: u8) -> Option<SegmentedAddress> {
		let offset = ProgramSegmentPrefix::saved_vector_offset(interrupt_index)?;
		Some(SegmentedAddress {
			offset: machine.peek_u16(self.addr(offset)),
			segment: machine.peek_u16(self.addr(offset + 2)),
		})
	}

	pub fn set_saved_vector<M: Memory>(&self, machine: &mut M, interrupt_index: u8, vector: SegmentedAddress) {
		if let Some(offset) = ProgramSegmentPrefix::saved_vector_offset(interrupt_index) {
			machine.poke_u16(self.addr(offset), vector.offset);
			machine.poke_u16(self.addr(offset + 2), vector.segment);
		}
	}

	/// Takes a copy of the live 0x22-0x24 vectors so they can be put back when the process ends.
	pub fn save_vectors_from_table<M: Memory>(&self, machine: &mut M) {
		for interrupt_index in SAVED_VECTOR_INTERRUPTS.iter() {
			let vector = machine.get_interrupt_vector(*interrupt_index);
			self.set_saved_vector(machine, *interrupt_index, vector);
		}
	}

	pub fn file_handle<M: Memory>(&self, machine: &M, handle: usize) -> u8 {
		if handle >= FILE_HANDLE_TABLE_SIZE {
			return UNUSED_FILE_HANDLE;
		}
		machine.peek_u8(self.addr(PSP_FILE_HANDLE_TABLE + handle as u16))
	}

	pub fn set_file_handle<M: Memory>(&self, machine: &mut M, handle: usize, file_index: u8) {
		if handle < FILE_HANDLE_TABLE_SIZE {
			machine.poke_u8(self.addr(PSP_FILE_HANDLE_TABLE + handle as u16), file_index);
		}
	}

	pub fn caller_stack<M: Memory>(&self, machine: &M) -> SegmentedAddress {
		SegmentedAddress {
			segment: machine.peek_u16(self.addr(PSP_CALLER_SS)),
			offset: machine.peek_u16(self.addr(PSP_CALLER_SP)),
		}
	}

	pub fn set_caller_stack<M: Memory>(&self, machine: &mut M, stack: SegmentedAddress) {
		machine.poke_u16(self.addr(PSP_CALLER_SS), stack.segment);
		machine.poke_u16(self.addr(PSP_CALLER_SP), stack.offset);
	}

	pub fn dos_version<M: Memory>(&self, machine: &M) -> (u8, u8) {
		(machine.peek_u8(self.addr(PSP_DOS_VERSION)), machine.peek_u8(self.addr(PSP_DOS_VERSION + 1)))
	}

	/// The tail without its length byte or 0x0d terminator.
	pub fn command_tail<M: Memory>(&self, machine: &M) -> Vec<u8> {
		let len = (machine.peek_u8(self.addr(PSP_COMMAND_TAIL_LEN)) as usize).min(COMMAND_TAIL_MAX_CHARS);
		machine.read_bytes(self.addr(PSP_COMMAND_TAIL), len)
	}

	pub fn set_command_tail<M: Memory>(&self, machine: &mut M, command_line_tail: &[u8]) {
		let mut command_line_tail = command_line_tail;
		if command_line_tail.len() > COMMAND_TAIL_MAX_CHARS {
			warn!("Command line tail too long ({} bytes), truncating", command_line_tail.len());
			command_line_tail = &command_line_tail[..COMMAND_TAIL_MAX_CHARS];
		}
		// The length doesn't include the 0x0d terminator character.
		machine.poke_u8(self.addr(PSP_COMMAND_TAIL_LEN), command_line_tail.len() as u8);
		let mut current_command_line_pos = PSP_COMMAND_TAIL;
		for byte in command_line_tail {
			machine.poke_u8(self.addr(current_command_line_pos), *byte);
			current_command_line_pos += 1;
		}
		machine.poke_u8(self.addr(current_command_line_pos), 0x0d);
	}

	fn fcb_offset(index: usize) -> u16 {
		if index == 0 { PSP_FCB1 } else { PSP_FCB2 }
	}

	/// `index` is 0 for the first FCB and 1 for the second.
	pub fn fcb<M: Memory>(&self, machine: &M, index: usize) -> [u8; FCB_BYTES] {
		let mut fcb = [0u8; FCB_BYTES];
		fcb.copy_from_slice(&machine.read_bytes(self.addr(ProgramSegmentPrefix::fcb_offset(index)), FCB_BYTES));
		fcb
	}

	pub fn set_fcb<M: Memory>(&self, machine: &mut M, index: usize, fcb: &[u8; FCB_BYTES]) {
		machine.insert_contiguous_bytes(fcb, self.addr(ProgramSegmentPrefix::fcb_offset(index)) as usize);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::machine::Machine;

	#[test] fn test_initialise_layout() {
		let mut machine = Machine::new(0x100000);
		let psp = ProgramSegmentPrefix::new(0x1000);
		psp.initialise(&mut machine, 0x9fff, 0x0160, (5, 0));
		assert_eq!(machine.read_bytes(0x10000, 2), vec![0xcd, 0x20]);
		assert_eq!(machine.peek_u16(0x10002), 0x9fff);
		assert_eq!(machine.peek_u16(0x10016), 0x0160);
		assert_eq!(machine.peek_u8(0x10018), UNUSED_FILE_HANDLE);
		assert_eq!(machine.peek_u16(0x10032), 20);
		assert_eq!(machine.peek_u16(0x10036), 0x1000);
		assert_eq!(machine.read_bytes(0x10050, 3), vec![0xcd, 0x21, 0xcb]);
		assert_eq!(machine.peek_u8(0x10080), 0);
		assert_eq!(machine.peek_u8(0x10081), 0x0d);
		assert_eq!(psp.dos_version(&machine), (5, 0));
	}

	#[test] fn test_command_tail() {
		let mut machine = Machine::new(0x100000);
		let psp = ProgramSegmentPrefix::new(0x1000);
		psp.set_command_tail(&mut machine, b" /C DIR");
		assert_eq!(machine.peek_u8(0x10080), 7);
		assert_eq!(machine.peek_u8(0x10088), 0x0d);
		assert_eq!(psp.command_tail(&machine), b" /C DIR".to_vec());
		psp.set_command_tail(&mut machine, &[b'x'; 200]);
		assert_eq!(psp.command_tail(&machine).len(), COMMAND_TAIL_MAX_CHARS);
		assert_eq!(machine.peek_u8(0x10081 + COMMAND_TAIL_MAX_CHARS as u32), 0x0d);
	}

	#[test] fn test_saved_vectors() {
		let mut machine = Machine::new(0x100000);
		let psp = ProgramSegmentPrefix::new(0x1000);
		machine.set_interrupt_vector(0x22, SegmentedAddress::new(0x0200, 0x0010));
		machine.set_interrupt_vector(0x23, SegmentedAddress::new(0x0300, 0x0020));
		machine.set_interrupt_vector(0x24, SegmentedAddress::new(0x0400, 0x0030));
		psp.save_vectors_from_table(&mut machine);
		assert_eq!(machine.peek_u16(0x1000a), 0x0010);
		assert_eq!(machine.peek_u16(0x1000c), 0x0200);
		assert_eq!(psp.saved_vector(&machine, 0x23), Some(SegmentedAddress::new(0x0300, 0x0020)));
		assert_eq!(psp.saved_vector(&machine, 0x24), Some(SegmentedAddress::new(0x0400, 0x0030)));
		assert_eq!(psp.saved_vector(&machine, 0x21), None);
	}

	#[test] fn test_copy_from_repoints_handle_table() {
		let mut machine = Machine::new(0x100000);
		let parent = ProgramSegmentPrefix::new(0x1000);
		parent.initialise(&mut machine, 0x2000, 0x0160, (5, 0));
		parent.set_file_handle(&mut machine, 0, 1);
		parent.set_fcb(&mut machine, 1, &[7u8; FCB_BYTES]);
		let child = ProgramSegmentPrefix::new(0x3000);
		child.copy_from(&mut machine, parent);
		assert_eq!(child.file_handle(&machine, 0), 1);
		assert_eq!(child.fcb(&machine, 1), [7u8; FCB_BYTES]);
		assert_eq!(child.fcb(&machine, 0), [0u8; FCB_BYTES]);
		assert_eq!(machine.peek_u16(0x30036), 0x3000);
	}
}
