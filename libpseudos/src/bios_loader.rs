use crate::machine::Memory;

pub const BIOS_START: u32 = 0x40 << 4;
const fn bios_off(offset: u32) -> u32 {
	BIOS_START + offset
}

pub const BIOS_EQUIPMENT: u32 = bios_off(0x10);
pub const BIOS_MEMORY_SIZE_KB: u32 = bios_off(0x13);

// http://www.bioscentral.com/misc/bda.htm
pub fn initialise_bios_data_area<M: Memory>(machine: &mut M, conventional_memory_kb: u16) {
	// The BIOS Data Area starts at the start of the 0x40 segment.
	// Equipment
	machine.poke_u16(BIOS_EQUIPMENT, 0x0061);
	// Memory size in KB. Programs read this (or INT 12h) to find the top of conventional memory.
	machine.poke_u16(BIOS_MEMORY_SIZE_KB, conventional_memory_kb);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::machine::Machine;

	#[test] fn test_memory_size_word() {
		let mut machine = Machine::new(0x1000);
		initialise_bios_data_area(&mut machine, 640);
		assert_eq!(machine.peek_u16(0x413), 640);
		assert_eq!(machine.peek_u16(0x410), 0x0061);
	}
}
