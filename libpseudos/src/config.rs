use crate::memory_manager::MemoryStrategy;
use crate::psp::PSP_SIZE_PARAGRAPHS;

/// Everything needed to boot the DOS personality onto a fresh machine.
#[derive(Debug, Clone, PartialEq)]
pub struct DosConfig {
	pub memory_bytes: usize,
	// COMMAND.COM normally sits just below the first free MCB. Its PSP is the parent of the first
	// program but it is never tracked by the allocator.
	pub root_psp_segment: u16,
	pub first_mcb_segment: u16,
	// One past the last paragraph of conventional memory. 0xa000 is where video memory starts.
	pub end_segment: u16,
	pub strategy: MemoryStrategy,
	/// (major, minor)
	pub dos_version: (u8, u8),
	pub environment: Vec<(String, String)>,
}

impl Default for DosConfig {
	fn default() -> DosConfig {
		DosConfig {
			memory_bytes: 0x100000 + 0x10000,
			root_psp_segment: 0x0160,
			first_mcb_segment: 0x0170,
			end_segment: 0xa000,
			strategy: MemoryStrategy::default(),
			dos_version: (5, 0),
			environment: vec![
				("COMSPEC".to_string(), "C:\\COMMAND.COM".to_string()),
				("PATH".to_string(), "C:\\".to_string()),
			],
		}
	}
}

impl DosConfig {
	pub fn conventional_memory_kb(&self) -> u16 {
		((self.end_segment as u32 * 16) / 1024) as u16
	}

	/// Checks that the segments fit together and inside the machine. The chain bounds themselves
	/// are checked by the memory manager.
	pub fn validate(&self) -> Result<(), String> {
		if self.root_psp_segment as u32 + PSP_SIZE_PARAGRAPHS as u32 > self.first_mcb_segment as u32 {
			return Err(format!("Root PSP at {:04x} overlaps the first MCB at {:04x}", self.root_psp_segment, self.first_mcb_segment));
		}
		if self.end_segment as usize * 16 > self.memory_bytes {
			return Err(format!("Conventional memory ends at {:04x}, past the end of {} bytes of memory", self.end_segment, self.memory_bytes));
		}
		Ok(())
	}
}
