use byteorder::{ByteOrder, LittleEndian};

// Real mode can address one megabyte plus the HMA, but without the A20 line enabled every
// segment:offset wraps around at 1MB.
pub const ADDRESS_MASK: u32 = 0xfffff;
pub const PARAGRAPH_BYTES: u32 = 16;
pub const INTERRUPT_TABLE_ENTRY_BYTES: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SegmentedAddress {
	pub segment: u16,
	pub offset: u16,
}

impl SegmentedAddress {
	pub fn new(segment: u16, offset: u16) -> SegmentedAddress {
		SegmentedAddress{segment, offset}
	}

	pub fn linear(&self) -> u32 {
		seg_off_to_linear(self.segment, self.offset)
	}
}

impl std::fmt::Display for SegmentedAddress {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:04x}:{:04x}", self.segment, self.offset)
	}
}

pub fn seg_off_to_linear(segment: u16, offset: u16) -> u32 {
	((segment as u32 * PARAGRAPH_BYTES) + offset as u32) & ADDRESS_MASK
}

/// Rounds a byte count up to whole paragraphs.
pub fn bytes_to_paragraphs(byte_count: usize) -> usize {
	(byte_count + PARAGRAPH_BYTES as usize - 1) / PARAGRAPH_BYTES as usize
}

/// Byte addressable guest memory. Only `peek_u8` and `poke_u8` are required, everything else is
/// built on top of them.
pub trait Memory {
	fn peek_u8(&self, addr: u32) -> u8;
	fn poke_u8(&mut self, addr: u32, value: u8);

	fn peek_u16(&self, addr: u32) -> u16 {
		LittleEndian::read_u16(&[self.peek_u8(addr), self.peek_u8(addr + 1)])
	}

	fn poke_u16(&mut self, addr: u32, value: u16) {
		let mut bytes = [0u8; 2];
		LittleEndian::write_u16(&mut bytes, value);
		self.poke_u8(addr, bytes[0]);
		self.poke_u8(addr + 1, bytes[1]);
	}

	fn insert_contiguous_bytes(&mut self, bytes: &[u8], at: usize) {
		for (i, byte) in bytes.iter().enumerate() {
			self.poke_u8((at + i) as u32, *byte);
		}
	}

	fn read_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
		(0..len as u32).map(|i| self.peek_u8(addr + i)).collect()
	}

	fn read_null_terminated_string(&self, addr: u32) -> Vec<u8> {
		let mut result = vec![];
		let mut pos = addr;
		loop {
			let byte = self.peek_u8(pos);
			if byte == 0 || result.len() > 0xffff {
				break;
			}
			result.push(byte);
			pos += 1;
		}
		result
	}

	// Each interrupt table entry is stored as IP then CS.
	fn get_interrupt_vector(&self, interrupt_index: u8) -> SegmentedAddress {
		let entry_addr = interrupt_index as u32 * INTERRUPT_TABLE_ENTRY_BYTES;
		SegmentedAddress {
			offset: self.peek_u16(entry_addr),
			segment: self.peek_u16(entry_addr + 2),
		}
	}

	fn set_interrupt_vector(&mut self, interrupt_index: u8, vector: SegmentedAddress) {
		let entry_addr = interrupt_index as u32 * INTERRUPT_TABLE_ENTRY_BYTES;
		self.poke_u16(entry_addr, vector.offset);
		self.poke_u16(entry_addr + 2, vector.segment);
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
	AX, BX, CX, DX,
	SI, DI, BP, SP,
	CS, DS, ES, SS,
	IP,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegHalf {
	High,
	Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
	Carry,
	Zero,
	Interrupt,
}

impl Flag {
	pub fn mask(&self) -> u16 {
		match self {
			Flag::Carry => 1 << 0,
			Flag::Zero => 1 << 6,
			Flag::Interrupt => 1 << 9,
		}
	}
}

/// The register file of the CPU that is running the guest.
pub trait Cpu {
	fn get_reg_u16(&self, reg: Reg) -> u16;
	fn set_reg_u16(&mut self, reg: Reg, value: u16);
	fn get_flag(&self, flag: Flag) -> bool;
	fn set_flag(&mut self, flag: Flag, on: bool);

	fn get_reg_u8(&self, reg: Reg, half: RegHalf) -> u8 {
		let value = self.get_reg_u16(reg);
		match half {
			RegHalf::High => (value >> 8) as u8,
			RegHalf::Low => (value & 0xff) as u8,
		}
	}

	fn set_reg_u8(&mut self, reg: Reg, half: RegHalf, value: u8) {
		let old = self.get_reg_u16(reg);
		let new = match half {
			RegHalf::High => (old & 0x00ff) | ((value as u16) << 8),
			RegHalf::Low => (old & 0xff00) | value as u16,
		};
		self.set_reg_u16(reg, new);
	}

	fn get_seg_reg(&self, seg_reg: Reg, offset_reg: Reg) -> u32 {
		seg_off_to_linear(self.get_reg_u16(seg_reg), self.get_reg_u16(offset_reg))
	}
}

/// Plain memory and register state of a real mode machine. Instruction execution lives
/// elsewhere; this is what the DOS layer reads and writes.
#[derive(Clone)]
pub struct Machine {
	pub memory: Vec<u8>,
	regs: [u16; 13],
	flags: u16,
}

impl std::fmt::Debug for Machine {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_struct("Machine")
			.field("memory_bytes", &self.memory.len())
			.field("regs", &self.regs)
			.field("flags", &self.flags)
			.finish()
	}
}

impl Machine {
	pub fn new(memory_bytes: usize) -> Machine {
		Machine {
			memory: vec![0; memory_bytes],
			regs: [0; 13],
			flags: 0,
		}
	}

	fn reg_index(reg: Reg) -> usize {
		match reg {
			Reg::AX => 0, Reg::BX => 1, Reg::CX => 2, Reg::DX => 3,
			Reg::SI => 4, Reg::DI => 5, Reg::BP => 6, Reg::SP => 7,
			Reg::CS => 8, Reg::DS => 9, Reg::ES => 10, Reg::SS => 11,
			Reg::IP => 12,
		}
	}
}

impl Memory for Machine {
	fn peek_u8(&self, addr: u32) -> u8 {
		self.memory.get(addr as usize).cloned().unwrap_or(0xff)
	}

	fn poke_u8(&mut self, addr: u32, value: u8) {
		if let Some(byte) = self.memory.get_mut(addr as usize) {
			*byte = value;
		}
	}

	fn peek_u16(&self, addr: u32) -> u16 {
		let addr = addr as usize;
		match self.memory.get(addr..addr + 2) {
			Some(bytes) => LittleEndian::read_u16(bytes),
			None => LittleEndian::read_u16(&[self.peek_u8(addr as u32), self.peek_u8(addr as u32 + 1)]),
		}
	}

	fn insert_contiguous_bytes(&mut self, bytes: &[u8], at: usize) {
		let end = (at + bytes.len()).min(self.memory.len());
		if at < end {
			self.memory[at..end].copy_from_slice(&bytes[..end - at]);
		}
	}
}

impl Cpu for Machine {
	fn get_reg_u16(&self, reg: Reg) -> u16 {
		self.regs[Machine::reg_index(reg)]
	}

	fn set_reg_u16(&mut self, reg: Reg, value: u16) {
		self.regs[Machine::reg_index(reg)] = value;
	}

	fn get_flag(&self, flag: Flag) -> bool {
		self.flags & flag.mask() != 0
	}

	fn set_flag(&mut self, flag: Flag, on: bool) {
		if on {
			self.flags |= flag.mask();
		} else {
			self.flags &= !flag.mask();
		}
	}
}
