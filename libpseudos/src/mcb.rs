use crate::machine::{seg_off_to_linear, Memory};

// http://stanislavs.org/helppc/memory_control_block.html
pub const MCB_TYPE_NON_LAST: u8 = b'M';
pub const MCB_TYPE_LAST: u8 = b'Z';
pub const MCB_FREE_OWNER: u16 = 0;
// Written over the header of a block that was absorbed by its predecessor. No conventional
// memory block can ever be this big.
pub const MCB_POISONED_SIZE: u16 = 0xffff;
pub const MCB_OWNER_NAME_BYTES: usize = 8;

const MCB_TYPE_OFFSET: u16 = 0x00;
const MCB_OWNER_OFFSET: u16 = 0x01;
const MCB_SIZE_OFFSET: u16 = 0x03;
const MCB_OWNER_NAME_OFFSET: u16 = 0x08;

/// A view onto the one paragraph header at `segment`. Nothing is cached: every accessor reads the
/// guest memory again, because the guest is free to rewrite it between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryControlBlock {
	pub segment: u16,
}

impl MemoryControlBlock {
	pub fn new(segment: u16) -> MemoryControlBlock {
		MemoryControlBlock{segment}
	}

	/// The header sits one paragraph below the data it describes.
	pub fn for_data_segment(data_segment: u16) -> Option<MemoryControlBlock> {
		data_segment.checked_sub(1).map(MemoryControlBlock::new)
	}

	fn addr(&self, offset: u16) -> u32 {
		seg_off_to_linear(self.segment, offset)
	}

	pub fn data_segment(&self) -> u16 {
		self.segment.wrapping_add(1)
	}

	pub fn block_type<M: Memory>(&self, machine: &M) -> u8 {
		machine.peek_u8(self.addr(MCB_TYPE_OFFSET))
	}

	pub fn set_block_type<M: Memory>(&self, machine: &mut M, block_type: u8) {
		machine.poke_u8(self.addr(MCB_TYPE_OFFSET), block_type);
	}

	pub fn is_last<M: Memory>(&self, machine: &M) -> bool {
		self.block_type(machine) == MCB_TYPE_LAST
	}

	pub fn set_last<M: Memory>(&self, machine: &mut M, last: bool) {
		self.set_block_type(machine, if last { MCB_TYPE_LAST } else { MCB_TYPE_NON_LAST });
	}

	pub fn owner<M: Memory>(&self, machine: &M) -> u16 {
		machine.peek_u16(self.addr(MCB_OWNER_OFFSET))
	}

	pub fn set_owner<M: Memory>(&self, machine: &mut M, owner: u16) {
		machine.poke_u16(self.addr(MCB_OWNER_OFFSET), owner);
	}

	pub fn is_free<M: Memory>(&self, machine: &M) -> bool {
		self.owner(machine) == MCB_FREE_OWNER
	}

	pub fn set_free<M: Memory>(&self, machine: &mut M) {
		self.set_owner(machine, MCB_FREE_OWNER);
	}

	pub fn size<M: Memory>(&self, machine: &M) -> u16 {
		machine.peek_u16(self.addr(MCB_SIZE_OFFSET))
	}

	pub fn set_size<M: Memory>(&self, machine: &mut M, size: u16) {
		machine.poke_u16(self.addr(MCB_SIZE_OFFSET), size);
	}

	pub fn is_valid<M: Memory>(&self, machine: &M) -> bool {
		let block_type = self.block_type(machine);
		(block_type == MCB_TYPE_NON_LAST || block_type == MCB_TYPE_LAST)
			&& self.size(machine) != MCB_POISONED_SIZE
	}

	/// Segment of the first paragraph after this block's data. This is where the next header lives
	/// for an 'M' block, or the end of the chain for the 'Z' block.
	pub fn end_segment<M: Memory>(&self, machine: &M) -> u32 {
		self.segment as u32 + 1 + self.size(machine) as u32
	}

	/// The following block, or None for the last block or if the arithmetic runs off the end of
	/// the address space. The returned block is not checked for validity.
	pub fn next<M: Memory>(&self, machine: &M) -> Option<MemoryControlBlock> {
		if self.is_last(machine) {
			return None;
		}
		let end = self.end_segment(machine);
		if end > 0xffff {
			None
		} else {
			Some(MemoryControlBlock::new(end as u16))
		}
	}

	pub fn poison<M: Memory>(&self, machine: &mut M) {
		self.set_block_type(machine, 0);
		self.set_size(machine, MCB_POISONED_SIZE);
	}

	/// Writes a complete header, clearing the name field.
	pub fn write<M: Memory>(&self, machine: &mut M, last: bool, owner: u16, size: u16) {
		self.set_last(machine, last);
		self.set_owner(machine, owner);
		self.set_size(machine, size);
		for i in 5..MCB_OWNER_NAME_OFFSET + MCB_OWNER_NAME_BYTES as u16 {
			machine.poke_u8(self.addr(i), 0);
		}
	}

	pub fn owner_name<M: Memory>(&self, machine: &M) -> Vec<u8> {
		let mut name = machine.read_bytes(self.addr(MCB_OWNER_NAME_OFFSET), MCB_OWNER_NAME_BYTES);
		if let Some(end) = name.iter().position(|c| *c == 0) {
			name.truncate(end);
		}
		name
	}

	/// The name is NUL padded when shorter than eight characters, and not terminated otherwise.
	pub fn set_owner_name<M: Memory>(&self, machine: &mut M, name: &[u8]) {
		for i in 0..MCB_OWNER_NAME_BYTES {
			let byte = name.get(i).cloned().unwrap_or(0);
			machine.poke_u8(self.addr(MCB_OWNER_NAME_OFFSET + i as u16), byte);
		}
	}
}
