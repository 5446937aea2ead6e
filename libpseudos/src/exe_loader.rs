use crate::machine::{bytes_to_paragraphs, seg_off_to_linear, Memory, SegmentedAddress, PARAGRAPH_BYTES};
use crate::mcb::MemoryControlBlock;
use crate::memory_manager::{DosMemoryError, DosMemoryManager};
use crate::psp::{PSP_SIZE_BYTES, PSP_SIZE_PARAGRAPHS};

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

// https://wiki.osdev.org/MZ

const EXE_PARAGRAPH_BYTES: usize = 16;
const EXE_BLOCK_BYTES: usize = 512;
const EXE_SIGNATURE: u16 = 0x5a4d;
// Some very old linkers wrote the signature backwards.
const EXE_SIGNATURE_REVERSED: u16 = 0x4d5a;
// A COM file has to fit in one segment along with the PSP and a stack word.
pub const COM_MAX_BYTES: usize = 0xff00;
// This is the offset where a COM file is put, and where execution starts.
pub const COM_ENTRY_OFFSET: u16 = PSP_SIZE_BYTES;
pub const COM_INITIAL_SP: u16 = 0xfffe;
const COM_SEGMENT_PARAGRAPHS: u16 = 0x1000;

#[derive(Debug)]
pub struct MzHeader {
	signature: u16,
	last_block_bytes: u16,
	file_block_count: u16,
	relocation_items: u16,
	header_paragraph_count: u16,
	minimum_memory_paragraphs: u16,
	maximum_memory_paragraphs: u16,
	initial_ss: u16,
	initial_sp: u16,
	checksum: u16,
	initial_ip: u16,
	initial_cs: u16,
	relocation_table: u16,
	overlay: u16,
}

impl MzHeader {
	pub fn byte_size() -> usize {
		28
	}

	pub fn parse<R: std::io::Read>(stream: &mut R) -> Result<MzHeader, String> {
		let mut read_field = |name: &str| stream.read_u16::<LittleEndian>().map_err(|e| format!("Failed to read {}: {}", name, e));
		Ok(MzHeader {
			signature: read_field("signature")?,
			last_block_bytes: read_field("last_block_bytes")?,
			file_block_count: read_field("file_block_count")?,
			relocation_items: read_field("relocation_items")?,
			header_paragraph_count: read_field("header_paragraph_count")?,
			minimum_memory_paragraphs: read_field("minimum_memory_paragraphs")?,
			maximum_memory_paragraphs: read_field("maximum_memory_paragraphs")?,
			initial_ss: read_field("initial_ss")?,
			initial_sp: read_field("initial_sp")?,
			checksum: read_field("checksum")?,
			initial_ip: read_field("initial_ip")?,
			initial_cs: read_field("initial_cs")?,
			relocation_table: read_field("relocation_table")?,
			overlay: read_field("overlay")?,
		})
	}

	pub fn has_signature(&self) -> bool {
		self.signature == EXE_SIGNATURE || self.signature == EXE_SIGNATURE_REVERSED
	}

	pub fn data_start(&self) -> usize {
		self.header_paragraph_count as usize * EXE_PARAGRAPH_BYTES
	}

	pub fn data_end(&self) -> usize {
		let subtract_bytes = if self.last_block_bytes > 0 {
			EXE_BLOCK_BYTES - (self.last_block_bytes as usize).min(EXE_BLOCK_BYTES)
		} else {
			0
		};
		(self.file_block_count as usize * EXE_BLOCK_BYTES).saturating_sub(subtract_bytes)
	}

	/// The load module: everything between the header and the end the header declares. Files
	/// that are shorter than declared are loaded as far as they go.
	pub fn extract_data<'a>(&self, file_bytes: &'a [u8]) -> Result<&'a [u8], String> {
		let start = self.data_start();
		let end = self.data_end().min(file_bytes.len());
		if start > end {
			return Err(format!("Header size {} is past the end of the image ({})", start, end));
		}
		Ok(&file_bytes[start..end])
	}

	pub fn read_relocations(&self, file_bytes: &[u8]) -> Result<Vec<SegmentedAddress>, String> {
		let table_start = self.relocation_table as usize;
		let table_end = table_start + self.relocation_items as usize * 4;
		let mut stream = file_bytes.get(table_start..table_end)
			.ok_or_else(|| format!("Relocation table at 0x{:x} with {} items runs past the end of the file", table_start, self.relocation_items))?;
		let mut relocations = Vec::with_capacity(self.relocation_items as usize);
		for i in 0..self.relocation_items {
			let offset = stream.read_u16::<LittleEndian>().map_err(|e| format!("Failed to read relocation {}: {}", i, e))?;
			let segment = stream.read_u16::<LittleEndian>().map_err(|e| format!("Failed to read relocation {}: {}", i, e))?;
			relocations.push(SegmentedAddress{segment, offset});
		}
		Ok(relocations)
	}
}

/// An MZ program after its header has been taken apart.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentedExecutable {
	pub min_extra_paragraphs: u16,
	pub max_extra_paragraphs: u16,
	pub initial_stack: SegmentedAddress,
	pub initial_code: SegmentedAddress,
	/// Image relative locations of words that hold a segment number.
	pub relocations: Vec<SegmentedAddress>,
	pub image: Vec<u8>,
}

impl SegmentedExecutable {
	pub fn from_mz_bytes(file_bytes: &[u8]) -> Result<SegmentedExecutable, String> {
		let mut stream = file_bytes;
		let header = MzHeader::parse(&mut stream)?;
		if !header.has_signature() {
			return Err(format!("Bad MZ signature: 0x{:04x}", header.signature));
		}
		debug!("{:#?}", header);
		Ok(SegmentedExecutable {
			min_extra_paragraphs: header.minimum_memory_paragraphs,
			max_extra_paragraphs: header.maximum_memory_paragraphs,
			initial_stack: SegmentedAddress::new(header.initial_ss, header.initial_sp),
			initial_code: SegmentedAddress::new(header.initial_cs, header.initial_ip),
			relocations: header.read_relocations(file_bytes)?,
			image: header.extract_data(file_bytes)?.to_vec(),
		})
	}

	pub fn image_paragraphs(&self) -> u16 {
		bytes_to_paragraphs(self.image.len()) as u16
	}

	/// Min and max both zero is the linker's way of asking to be loaded at the top of memory.
	pub fn loads_high(&self) -> bool {
		self.min_extra_paragraphs == 0 && self.max_extra_paragraphs == 0
	}

	/// Copies the image to `load_segment` and adds `relocation_factor` to each relocated word.
	pub fn relocate_into<M: Memory>(&self, machine: &mut M, load_segment: u16, relocation_factor: u16) {
		machine.insert_contiguous_bytes(&self.image, seg_off_to_linear(load_segment, 0) as usize);
		for relocation in &self.relocations {
			let addr = seg_off_to_linear(load_segment.wrapping_add(relocation.segment), relocation.offset);
			let value = machine.peek_u16(addr);
			machine.poke_u16(addr, value.wrapping_add(relocation_factor));
		}
	}

	/// Puts the program into the block that starts with its PSP and works out the registers it
	/// starts with.
	pub fn load_into_machine<M: Memory>(&self, machine: &mut M, psp_segment: u16, block_paragraphs: u16) -> InitialRegisters {
		let load_segment = if self.loads_high() {
			psp_segment.wrapping_add(block_paragraphs).wrapping_sub(self.image_paragraphs())
		} else {
			psp_segment.wrapping_add(PSP_SIZE_PARAGRAPHS)
		};
		debug!("Loading {} bytes at {:04x} with {} relocations", self.image.len(), load_segment, self.relocations.len());
		self.relocate_into(machine, load_segment, load_segment);

		InitialRegisters {
			code: SegmentedAddress::new(self.initial_code.segment.wrapping_add(load_segment), self.initial_code.offset),
			stack: SegmentedAddress::new(self.initial_stack.segment.wrapping_add(load_segment), self.initial_stack.offset),
			data_segment: psp_segment,
			extra_segment: psp_segment,
		}
	}
}

/// The two kinds of program DOS can run.
#[derive(Debug, Clone, PartialEq)]
pub enum DosExecutable {
	/// A COM file: raw bytes with no header, loaded right after the PSP.
	Flat(Vec<u8>),
	Segmented(SegmentedExecutable),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRange {
	pub min_paragraphs: u16,
	pub max_paragraphs: u16,
}

/// Register values a freshly loaded program starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialRegisters {
	pub code: SegmentedAddress,
	pub stack: SegmentedAddress,
	pub data_segment: u16,
	pub extra_segment: u16,
}

impl DosExecutable {
	/// DOS decides by signature, not by file extension.
	pub fn parse(file_bytes: &[u8]) -> Result<DosExecutable, String> {
		let mut signature_stream = file_bytes;
		let is_mz = file_bytes.len() >= MzHeader::byte_size() && signature_stream.read_u16::<LittleEndian>()
			.map(|signature| signature == EXE_SIGNATURE || signature == EXE_SIGNATURE_REVERSED)
			.unwrap_or(false);
		if is_mz {
			Ok(DosExecutable::Segmented(SegmentedExecutable::from_mz_bytes(file_bytes)?))
		} else if file_bytes.len() > COM_MAX_BYTES {
			Err(format!("Flat program too large: {} bytes", file_bytes.len()))
		} else {
			Ok(DosExecutable::Flat(file_bytes.to_vec()))
		}
	}

	/// Paragraphs needed for the image plus the PSP in front of it.
	pub fn base_paragraphs(&self) -> u16 {
		let image_paragraphs = match self {
			DosExecutable::Flat(image) => bytes_to_paragraphs(image.len()) as u16,
			DosExecutable::Segmented(exe) => exe.image_paragraphs(),
		};
		image_paragraphs.saturating_add(PSP_SIZE_PARAGRAPHS)
	}

	/// Programs that get handed the biggest block there is rather than what they asked for.
	pub fn wants_largest_block(&self) -> bool {
		match self {
			DosExecutable::Flat(_) => true,
			DosExecutable::Segmented(exe) => exe.loads_high(),
		}
	}

	/// How much memory the program needs (`min`) and would like (`max`).
	///
	/// If it asks for nothing extra at all it gets the largest free block, or the free block at
	/// `fixed_segment` if a load address was given.
	pub fn compute_alloc_range<M: Memory>(&self, machine: &mut M, memory_manager: &DosMemoryManager, fixed_segment: Option<u16>) -> Result<AllocRange, DosMemoryError> {
		let base = self.base_paragraphs();
		if let DosExecutable::Segmented(exe) = self {
			if !exe.loads_high() {
				let min_paragraphs = base.saturating_add(exe.min_extra_paragraphs);
				let max_paragraphs = base.saturating_add(exe.max_extra_paragraphs).max(min_paragraphs);
				return Ok(AllocRange{min_paragraphs, max_paragraphs});
			}
		}

		let available = match fixed_segment {
			Some(segment) => {
				let block = memory_manager.block_for_segment(machine, segment)?;
				if block.is_free(machine) { block.size(machine) } else { 0 }
			}
			None => memory_manager.find_largest_free(machine).map_or(0, |block: MemoryControlBlock| block.size(machine)),
		};
		if available < base {
			return Err(DosMemoryError::InsufficientMemory{available});
		}
		Ok(AllocRange{min_paragraphs: base, max_paragraphs: available})
	}

	pub fn load_into_machine<M: Memory>(&self, machine: &mut M, psp_segment: u16, block_paragraphs: u16) -> InitialRegisters {
		match self {
			DosExecutable::Flat(image) => load_flat(machine, image, psp_segment, block_paragraphs),
			DosExecutable::Segmented(exe) => exe.load_into_machine(machine, psp_segment, block_paragraphs),
		}
	}
}

/// COM programs get one segment for everything, starting at the PSP.
///
/// The stack starts at the top of that segment, or at the top of the block if the block is smaller
/// than 64KB.
pub fn load_flat<M: Memory>(machine: &mut M, image: &[u8], psp_segment: u16, block_paragraphs: u16) -> InitialRegisters {
	machine.insert_contiguous_bytes(image, seg_off_to_linear(psp_segment, COM_ENTRY_OFFSET) as usize);
	let initial_sp = if block_paragraphs >= COM_SEGMENT_PARAGRAPHS {
		COM_INITIAL_SP
	} else {
		(block_paragraphs * PARAGRAPH_BYTES as u16).saturating_sub(2)
	};
	// A zero word on the stack makes a near RET land on the INT 20h at PSP:0000.
	machine.poke_u16(seg_off_to_linear(psp_segment, initial_sp), 0);
	InitialRegisters {
		code: SegmentedAddress::new(psp_segment, COM_ENTRY_OFFSET),
		stack: SegmentedAddress::new(psp_segment, initial_sp),
		data_segment: psp_segment,
		extra_segment: psp_segment,
	}
}
