use crate::dos_error_codes::DosErrorCode;
use crate::machine::Memory;
use crate::mcb::{MemoryControlBlock, MCB_FREE_OWNER};

use log::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
	FirstFit,
	BestFit,
	LastFit,
}

/// Upper memory is not modelled, so this is remembered and reported back to the guest but never
/// changes which block gets picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HighMemoryPreference {
	LowOnly,
	HighOnly,
	HighThenLow,
}

/// The value behind INT 21h/58h.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStrategy {
	pub fit: AllocationStrategy,
	pub high_memory: HighMemoryPreference,
}

impl Default for MemoryStrategy {
	fn default() -> MemoryStrategy {
		MemoryStrategy {
			fit: AllocationStrategy::FirstFit,
			high_memory: HighMemoryPreference::LowOnly,
		}
	}
}

impl MemoryStrategy {
	// http://www.ctyme.com/intr/rb-2994.htm
	pub fn from_u16(value: u16) -> Result<MemoryStrategy, DosErrorCode> {
		if value & 0xff3c != 0 {
			return Err(DosErrorCode::InvalidFunction);
		}
		let fit = match value & 0x03 {
			0 => AllocationStrategy::FirstFit,
			1 => AllocationStrategy::BestFit,
			2 => AllocationStrategy::LastFit,
			_ => return Err(DosErrorCode::InvalidFunction),
		};
		let high_memory = match value & 0xc0 {
			0x00 => HighMemoryPreference::LowOnly,
			0x40 => HighMemoryPreference::HighOnly,
			0x80 => HighMemoryPreference::HighThenLow,
			_ => return Err(DosErrorCode::InvalidFunction),
		};
		Ok(MemoryStrategy{fit, high_memory})
	}

	pub fn to_u16(&self) -> u16 {
		let fit = match self.fit {
			AllocationStrategy::FirstFit => 0,
			AllocationStrategy::BestFit => 1,
			AllocationStrategy::LastFit => 2,
		};
		let high_memory = match self.high_memory {
			HighMemoryPreference::LowOnly => 0x00,
			HighMemoryPreference::HighOnly => 0x40,
			HighMemoryPreference::HighThenLow => 0x80,
		};
		fit | high_memory
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DosMemoryError {
	/// Nothing big enough. `available` is what the guest gets told it could have had instead.
	InsufficientMemory { available: u16 },
	/// A header in the chain has been overwritten.
	ChainCorrupted { segment: u16 },
	/// The guest named a block that isn't one.
	InvalidBlock { segment: u16 },
	SplitTooLarge { requested: u16, available: u16 },
	/// The region handed to the manager can't hold even one header and one paragraph.
	RegionTooSmall { start_segment: u16, end_segment: u16 },
}

impl std::fmt::Display for DosMemoryError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			DosMemoryError::InsufficientMemory{available} => write!(f, "insufficient memory, {} paragraphs available", available),
			DosMemoryError::ChainCorrupted{segment} => write!(f, "memory control block chain corrupted at {:04x}", segment),
			DosMemoryError::InvalidBlock{segment} => write!(f, "no memory block at {:04x}", segment),
			DosMemoryError::SplitTooLarge{requested, available} => write!(f, "cannot split {} paragraphs out of {}", requested, available),
			DosMemoryError::RegionTooSmall{start_segment, end_segment} => write!(f, "no room for a memory chain between {:04x} and {:04x}", start_segment, end_segment),
		}
	}
}

impl From<DosMemoryError> for DosErrorCode {
	fn from(err: DosMemoryError) -> DosErrorCode {
		match err {
			DosMemoryError::InsufficientMemory{..} => DosErrorCode::InsufficientMemory,
			DosMemoryError::ChainCorrupted{..} => DosErrorCode::MemoryControlBlockDestroyed,
			DosMemoryError::InvalidBlock{..} => DosErrorCode::InvalidMemoryBlockAddress,
			DosMemoryError::SplitTooLarge{..} | DosMemoryError::RegionTooSmall{..} => DosErrorCode::InsufficientMemory,
		}
	}
}

/// Owns the MCB chain of conventional memory. The chain itself lives in guest memory, this only
/// knows where it starts and ends.
#[derive(Debug, Clone, PartialEq)]
pub struct DosMemoryManager {
	start_segment: u16,
	end_segment: u16,
	pub strategy: MemoryStrategy,
}

impl DosMemoryManager {
	pub fn new(start_segment: u16, end_segment: u16) -> Result<DosMemoryManager, DosMemoryError> {
		if end_segment <= start_segment.saturating_add(1) {
			return Err(DosMemoryError::RegionTooSmall{start_segment, end_segment});
		}
		Ok(DosMemoryManager {
			start_segment,
			end_segment,
			strategy: MemoryStrategy::default(),
		})
	}

	pub fn end_segment(&self) -> u16 {
		self.end_segment
	}

	pub fn first_block(&self) -> MemoryControlBlock {
		MemoryControlBlock::new(self.start_segment)
	}

	/// Writes a single free block covering everything.
	pub fn initialise<M: Memory>(&self, machine: &mut M) {
		let size = self.end_segment - self.start_segment - 1;
		self.first_block().write(machine, true, MCB_FREE_OWNER, size);
		debug!("Initialised MCB chain at {:04x} with {} free paragraphs", self.start_segment, size);
	}

	fn check_block<M: Memory>(&self, machine: &M, block: MemoryControlBlock) -> Result<(), DosMemoryError> {
		if block.segment < self.start_segment || block.segment >= self.end_segment || !block.is_valid(machine) {
			error!("Corrupted MCB at {:04x}: type 0x{:02x}, size 0x{:04x}", block.segment, block.block_type(machine), block.size(machine));
			return Err(DosMemoryError::ChainCorrupted{segment: block.segment});
		}
		Ok(())
	}

	/// The block after `block`, after checking that `block` is intact and that the chain doesn't
	/// run past the end of conventional memory.
	fn checked_next<M: Memory>(&self, machine: &M, block: MemoryControlBlock) -> Result<Option<MemoryControlBlock>, DosMemoryError> {
		self.check_block(machine, block)?;
		if block.end_segment(machine) > self.end_segment as u32 {
			error!("MCB at {:04x} runs past the end of conventional memory", block.segment);
			return Err(DosMemoryError::ChainCorrupted{segment: block.segment});
		}
		if block.is_last(machine) {
			return Ok(None);
		}
		match block.next(machine) {
			Some(next) => {
				self.check_block(machine, next)?;
				Ok(Some(next))
			}
			None => Err(DosMemoryError::ChainCorrupted{segment: block.segment}),
		}
	}

	/// Every block in the chain, from low to high memory.
	pub fn blocks<M: Memory>(&self, machine: &M) -> Result<Vec<MemoryControlBlock>, DosMemoryError> {
		let mut result = vec![];
		let mut current = Some(self.first_block());
		while let Some(block) = current {
			result.push(block);
			current = self.checked_next(machine, block)?;
		}
		Ok(result)
	}

	/// Absorbs any free blocks directly after `block` into it. `block` itself doesn't have to be
	/// free.
	fn join_free_successors<M: Memory>(&self, machine: &mut M, block: MemoryControlBlock) -> Result<(), DosMemoryError> {
		while let Some(next) = self.checked_next(machine, block)? {
			if !next.is_free(machine) {
				break;
			}
			let joined_size = block.size(machine) as u32 + 1 + next.size(machine) as u32;
			trace!("Joining MCB {:04x} into {:04x}", next.segment, block.segment);
			block.set_size(machine, joined_size as u16);
			let next_type = next.block_type(machine);
			block.set_block_type(machine, next_type);
			next.poison(machine);
		}
		Ok(())
	}

	/// Walks the whole chain, coalescing free neighbours on the way, and returns every free block
	/// that has at least `min_size` paragraphs.
	pub fn find_candidates<M: Memory>(&self, machine: &mut M, min_size: u16) -> Result<Vec<MemoryControlBlock>, DosMemoryError> {
		let mut candidates = vec![];
		let mut current = Some(self.first_block());
		while let Some(block) = current {
			self.check_block(machine, block)?;
			if block.is_free(machine) {
				self.join_free_successors(machine, block)?;
				if block.size(machine) >= min_size {
					candidates.push(block);
				}
			}
			current = self.checked_next(machine, block)?;
		}
		Ok(candidates)
	}

	/// Candidates are expected in chain order.
	pub fn select_by_strategy<M: Memory>(&self, machine: &M, candidates: &[MemoryControlBlock], strategy: AllocationStrategy) -> Option<MemoryControlBlock> {
		match strategy {
			AllocationStrategy::FirstFit => candidates.first().cloned(),
			AllocationStrategy::BestFit => candidates.iter().cloned().min_by_key(|block| block.size(machine)),
			AllocationStrategy::LastFit => candidates.last().cloned(),
		}
	}

	/// Allocates with the manager's current strategy.
	pub fn allocate<M: Memory>(&self, machine: &mut M, size: u16, owner: u16) -> Result<MemoryControlBlock, DosMemoryError> {
		self.allocate_with_strategy(machine, size, owner, self.strategy.fit)
	}

	pub fn allocate_with_strategy<M: Memory>(&self, machine: &mut M, size: u16, owner: u16, strategy: AllocationStrategy) -> Result<MemoryControlBlock, DosMemoryError> {
		let candidates = self.find_candidates(machine, size)?;
		let block = match self.select_by_strategy(machine, &candidates, strategy) {
			Some(block) => block,
			None => {
				let available = self.find_largest_free(machine).map_or(0, |block| block.size(machine));
				debug!("No block of {} paragraphs for {:04x}, largest is {}", size, owner, available);
				return Err(DosMemoryError::InsufficientMemory{available});
			}
		};
		self.split(machine, block, size)?;
		block.set_owner(machine, owner);
		debug!("Allocated {} paragraphs at {:04x} for {:04x}", size, block.data_segment(), owner);
		Ok(block)
	}

	/// Cuts `block` down to `size` paragraphs and puts a new free block in the remainder.
	pub fn split<M: Memory>(&self, machine: &mut M, block: MemoryControlBlock, size: u16) -> Result<(), DosMemoryError> {
		let old_size = block.size(machine);
		if size == old_size {
			return Ok(());
		}
		if size > old_size {
			return Err(DosMemoryError::SplitTooLarge{requested: size, available: old_size});
		}
		let was_last = block.is_last(machine);
		block.set_size(machine, size);
		block.set_last(machine, false);
		let remainder = MemoryControlBlock::new(block.segment + 1 + size);
		remainder.write(machine, was_last, MCB_FREE_OWNER, old_size - size - 1);
		trace!("Split MCB {:04x} into {} + {} at {:04x}", block.segment, size, old_size - size - 1, remainder.segment);
		Ok(())
	}

	/// Marks the block free. The header is left exactly as it was otherwise; neighbours are only
	/// merged the next time an allocation walks past.
	pub fn free<M: Memory>(&self, machine: &mut M, block: MemoryControlBlock) -> Result<(), DosMemoryError> {
		if block.segment < self.start_segment || block.segment >= self.end_segment || !block.is_valid(machine) {
			return Err(DosMemoryError::InvalidBlock{segment: block.segment});
		}
		block.set_free(machine);
		debug!("Freed MCB {:04x} ({} paragraphs)", block.segment, block.size(machine));
		Ok(())
	}

	/// Finds the block whose data starts at `data_segment`, the way INT 21h names blocks.
	pub fn block_for_segment<M: Memory>(&self, machine: &M, data_segment: u16) -> Result<MemoryControlBlock, DosMemoryError> {
		let block = MemoryControlBlock::for_data_segment(data_segment)
			.ok_or(DosMemoryError::InvalidBlock{segment: data_segment})?;
		if block.segment < self.start_segment || block.segment >= self.end_segment || !block.is_valid(machine) {
			return Err(DosMemoryError::InvalidBlock{segment: data_segment});
		}
		Ok(block)
	}

	pub fn free_segment<M: Memory>(&self, machine: &mut M, data_segment: u16) -> Result<(), DosMemoryError> {
		let block = self.block_for_segment(machine, data_segment)?;
		self.free(machine, block)
	}

	/// Grows or shrinks the block whose data starts at `data_segment`. On failure the block keeps
	/// its original size and the error holds the most it could have grown to.
	pub fn resize<M: Memory>(&self, machine: &mut M, data_segment: u16, new_size: u16, owner: u16) -> Result<MemoryControlBlock, DosMemoryError> {
		let block = self.block_for_segment(machine, data_segment)?;
		let original_size = block.size(machine);
		self.join_free_successors(machine, block)?;
		let available = block.size(machine);
		if available < new_size {
			self.split(machine, block, original_size)?;
			debug!("Can't resize {:04x} to {} paragraphs, only {} available", data_segment, new_size, available);
			return Err(DosMemoryError::InsufficientMemory{available});
		}
		self.split(machine, block, new_size)?;
		block.set_owner(machine, owner);
		debug!("Resized {:04x} from {} to {} paragraphs", data_segment, original_size, new_size);
		Ok(block)
	}

	/// The biggest free block, after coalescing. Ties go to the lowest address.
	///
	/// A damaged header ends the walk early and the best block found before it is returned, so
	/// this still gives an answer after an allocation has failed with `ChainCorrupted`.
	pub fn find_largest_free<M: Memory>(&self, machine: &mut M) -> Option<MemoryControlBlock> {
		let mut largest: Option<(MemoryControlBlock, u16)> = None;
		let mut current = Some(self.first_block());
		while let Some(block) = current {
			if self.check_block(machine, block).is_err() {
				break;
			}
			let mut joined = Ok(());
			if block.is_free(machine) {
				joined = self.join_free_successors(machine, block);
				let size = block.size(machine);
				if largest.map_or(true, |(_, largest_size)| size > largest_size) {
					largest = Some((block, size));
				}
			}
			current = match joined.and_then(|()| self.checked_next(machine, block)) {
				Ok(next) => next,
				Err(err) => {
					error!("Largest free block search stopped early: {}", err);
					None
				}
			};
		}
		largest.map(|(block, _)| block)
	}

	/// Frees everything `owner` holds. Called once when a process ends.
	pub fn free_process_memory<M: Memory>(&self, machine: &mut M, owner: u16) -> Result<(), DosMemoryError> {
		let mut current = Some(self.first_block());
		while let Some(block) = current {
			// Read the link before touching the header.
			current = self.checked_next(machine, block)?;
			if block.owner(machine) == owner {
				block.set_free(machine);
				debug!("Released MCB {:04x} ({} paragraphs) of {:04x}", block.segment, block.size(machine), owner);
			}
		}
		Ok(())
	}

	pub fn check_chain_integrity<M: Memory>(&self, machine: &M) -> bool {
		match self.blocks(machine) {
			Ok(blocks) => blocks.last().map_or(false, |block| block.is_last(machine)),
			Err(_) => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::machine::Machine;
	use crate::mcb::MCB_TYPE_LAST;
	use proptest::prelude::*;

	const START: u16 = 0x100;

	fn new_chain(total_paragraphs: u16) -> (Machine, DosMemoryManager) {
		let mut machine = Machine::new(0x100000);
		let manager = DosMemoryManager::new(START, START + total_paragraphs).unwrap();
		manager.initialise(&mut machine);
		(machine, manager)
	}

	fn sizes(machine: &Machine, manager: &DosMemoryManager) -> Vec<(u16, u16)> {
		manager.blocks(machine).unwrap().iter().map(|block| (block.owner(machine), block.size(machine))).collect()
	}

	#[test] fn test_region_too_small() {
		assert_eq!(DosMemoryManager::new(START, START + 1), Err(DosMemoryError::RegionTooSmall{start_segment: START, end_segment: START + 1}));
		assert!(DosMemoryManager::new(START, START).is_err());
		assert!(DosMemoryManager::new(0xffff, 0x0010).is_err());
		assert!(DosMemoryManager::new(START, START + 2).is_ok());
	}

	#[test] fn test_initialise_single_free_block() {
		let (machine, manager) = new_chain(64);
		assert_eq!(sizes(&machine, &manager), vec![(0, 63)]);
		assert!(manager.first_block().is_last(&machine));
		assert!(manager.check_chain_integrity(&machine));
	}

	#[test] fn test_allocate_splits_block() {
		let (mut machine, manager) = new_chain(64);
		let block = manager.allocate(&mut machine, 10, 0x500).unwrap();
		assert_eq!(block.segment, START);
		assert_eq!(sizes(&machine, &manager), vec![(0x500, 10), (0, 52)]);
		assert!(!block.is_last(&machine));
		assert!(manager.check_chain_integrity(&machine));
	}

	#[test] fn test_allocate_whole_block_does_not_split() {
		let (mut machine, manager) = new_chain(64);
		let block = manager.allocate(&mut machine, 63, 0x500).unwrap();
		assert_eq!(sizes(&machine, &manager), vec![(0x500, 63)]);
		assert!(block.is_last(&machine));
	}

	#[test] fn test_end_to_end_reuse_of_freed_block() {
		let (mut machine, manager) = new_chain(64);
		let a = manager.allocate(&mut machine, 10, 0xa).unwrap();
		let b = manager.allocate(&mut machine, 10, 0xb).unwrap();
		manager.free(&mut machine, a).unwrap();
		let c = manager.allocate(&mut machine, 5, 0xc).unwrap();
		assert_eq!(c.segment, a.segment);
		assert_ne!(c.segment, b.segment);
		assert!(manager.check_chain_integrity(&machine));
		// Headers plus data always add up to the whole region.
		let blocks = manager.blocks(&machine).unwrap();
		let total: u32 = blocks.iter().map(|block| block.size(&machine) as u32 + 1).sum();
		assert_eq!(total, 64);
		assert_eq!(sizes(&machine, &manager), vec![(0xc, 5), (0, 4), (0xb, 10), (0, 41)]);
	}

	#[test] fn test_free_does_not_coalesce() {
		let (mut machine, manager) = new_chain(64);
		let a = manager.allocate(&mut machine, 10, 0xa).unwrap();
		manager.free(&mut machine, a).unwrap();
		// Still two blocks, and the freed header still says 10.
		assert_eq!(sizes(&machine, &manager), vec![(0, 10), (0, 52)]);
		assert_eq!(a.size(&machine), 10);
		// The next allocation merges them.
		let b = manager.allocate(&mut machine, 20, 0xb).unwrap();
		assert_eq!(b.segment, a.segment);
		assert_eq!(sizes(&machine, &manager), vec![(0xb, 20), (0, 42)]);
	}

	#[test] fn test_free_then_allocate_same_size_reuses_segment() {
		let (mut machine, manager) = new_chain(64);
		let a = manager.allocate(&mut machine, 30, 0xa).unwrap();
		manager.free(&mut machine, a).unwrap();
		let b = manager.allocate(&mut machine, 30, 0xb).unwrap();
		assert_eq!(a.segment, b.segment);
	}

	fn fragmented_chain() -> (Machine, DosMemoryManager) {
		// free 20 | used 5 | free 8 | used 5 | free 12 | used 5 | rest
		let (mut machine, manager) = new_chain(200);
		let mut frees = vec![];
		for size in &[20, 8, 12] {
			frees.push(manager.allocate(&mut machine, *size, 0x1).unwrap());
			manager.allocate(&mut machine, 5, 0x2).unwrap();
		}
		for block in frees {
			manager.free(&mut machine, block).unwrap();
		}
		(machine, manager)
	}

	#[test] fn test_first_fit_picks_lowest_address() {
		let (mut machine, manager) = fragmented_chain();
		let block = manager.allocate_with_strategy(&mut machine, 8, 0x3, AllocationStrategy::FirstFit).unwrap();
		assert_eq!(block.segment, START);
	}

	#[test] fn test_best_fit_picks_smallest_sufficient() {
		let (mut machine, manager) = fragmented_chain();
		let candidates = manager.find_candidates(&mut machine, 8).unwrap();
		let block = manager.allocate_with_strategy(&mut machine, 8, 0x3, AllocationStrategy::BestFit).unwrap();
		assert_eq!(block.segment, START + 21 + 6);
		assert_eq!(block.size(&machine), 8);
		// Nothing that qualified was smaller than what was chosen.
		for candidate in candidates {
			if candidate != block {
				assert!(candidate.size(&machine) >= 8);
			}
		}
		let block = manager.allocate_with_strategy(&mut machine, 10, 0x3, AllocationStrategy::BestFit).unwrap();
		assert_eq!(block.segment, START + 21 + 6 + 9 + 6);
	}

	#[test] fn test_last_fit_picks_highest_address() {
		let (mut machine, manager) = fragmented_chain();
		let candidates = manager.find_candidates(&mut machine, 8).unwrap();
		let block = manager.allocate_with_strategy(&mut machine, 8, 0x3, AllocationStrategy::LastFit).unwrap();
		assert_eq!(Some(&block), candidates.last());
		assert!(block.segment > START + 21 + 6 + 9 + 6);
	}

	#[test] fn test_allocate_reports_largest_when_full() {
		let (mut machine, manager) = fragmented_chain();
		let largest = manager.find_largest_free(&mut machine).unwrap();
		let largest_size = largest.size(&machine);
		match manager.allocate(&mut machine, largest_size + 1, 0x3) {
			Err(DosMemoryError::InsufficientMemory{available}) => assert_eq!(available, largest_size),
			other => panic!("Unexpected allocation result: {:?}", other),
		}
		assert!(manager.check_chain_integrity(&machine));
	}

	#[test] fn test_split_too_large_leaves_block_alone() {
		let (mut machine, manager) = new_chain(64);
		let block = manager.first_block();
		assert_eq!(manager.split(&mut machine, block, 64), Err(DosMemoryError::SplitTooLarge{requested: 64, available: 63}));
		assert_eq!(sizes(&machine, &manager), vec![(0, 63)]);
		assert_eq!(block.block_type(&machine), MCB_TYPE_LAST);
	}

	#[test] fn test_split_then_join_restores_size() {
		let (mut machine, manager) = new_chain(64);
		let block = manager.first_block();
		manager.split(&mut machine, block, 17).unwrap();
		assert_eq!(sizes(&machine, &manager), vec![(0, 17), (0, 45)]);
		manager.join_free_successors(&mut machine, block).unwrap();
		assert_eq!(sizes(&machine, &manager), vec![(0, 63)]);
		assert!(block.is_last(&machine));
	}

	#[test] fn test_resize_grows_into_free_neighbour() {
		let (mut machine, manager) = new_chain(64);
		let a = manager.allocate(&mut machine, 10, 0xa).unwrap();
		let resized = manager.resize(&mut machine, a.data_segment(), 40, 0xa).unwrap();
		assert_eq!(resized, a);
		assert_eq!(sizes(&machine, &manager), vec![(0xa, 40), (0, 22)]);
	}

	#[test] fn test_resize_shrinks() {
		let (mut machine, manager) = new_chain(64);
		let a = manager.allocate(&mut machine, 40, 0xa).unwrap();
		manager.allocate(&mut machine, 5, 0xb).unwrap();
		manager.resize(&mut machine, a.data_segment(), 10, 0xa).unwrap();
		assert_eq!(sizes(&machine, &manager), vec![(0xa, 10), (0, 29), (0xb, 5), (0, 16)]);
		assert!(manager.check_chain_integrity(&machine));
	}

	#[test] fn test_resize_failure_restores_block() {
		let (mut machine, manager) = new_chain(64);
		let a = manager.allocate(&mut machine, 10, 0xa).unwrap();
		let gap = manager.allocate(&mut machine, 10, 0xb).unwrap();
		manager.allocate(&mut machine, 5, 0xc).unwrap();
		manager.free(&mut machine, gap).unwrap();
		let before = sizes(&machine, &manager);
		assert_eq!(manager.resize(&mut machine, a.data_segment(), 30, 0xa), Err(DosMemoryError::InsufficientMemory{available: 21}));
		assert_eq!(sizes(&machine, &manager), before);
		assert!(manager.check_chain_integrity(&machine));
	}

	#[test] fn test_resize_invalid_segment() {
		let (mut machine, manager) = new_chain(64);
		manager.allocate(&mut machine, 10, 0xa).unwrap();
		assert_eq!(manager.resize(&mut machine, START + 5, 4, 0xa), Err(DosMemoryError::InvalidBlock{segment: START + 5}));
		assert_eq!(manager.free_segment(&mut machine, 0x50), Err(DosMemoryError::InvalidBlock{segment: 0x50}));
	}

	#[test] fn test_free_process_memory_only_touches_owner() {
		let (mut machine, manager) = new_chain(100);
		manager.allocate(&mut machine, 10, 0xa).unwrap();
		manager.allocate(&mut machine, 10, 0xb).unwrap();
		manager.allocate(&mut machine, 10, 0xa).unwrap();
		manager.allocate(&mut machine, 10, 0xc).unwrap();
		manager.free_process_memory(&mut machine, 0xa).unwrap();
		assert_eq!(sizes(&machine, &manager), vec![(0, 10), (0xb, 10), (0, 10), (0xc, 10), (0, 55)]);
	}

	#[test] fn test_largest_free_coalesces() {
		let (mut machine, manager) = new_chain(100);
		let a = manager.allocate(&mut machine, 10, 0xa).unwrap();
		let b = manager.allocate(&mut machine, 10, 0xb).unwrap();
		manager.allocate(&mut machine, 70, 0xc).unwrap();
		manager.free(&mut machine, a).unwrap();
		manager.free(&mut machine, b).unwrap();
		let largest = manager.find_largest_free(&mut machine).unwrap();
		assert_eq!(largest.segment, START);
		assert_eq!(largest.size(&machine), 21);
	}

	#[test] fn test_largest_free_when_full() {
		let (mut machine, manager) = new_chain(64);
		manager.allocate(&mut machine, 63, 0xa).unwrap();
		assert_eq!(manager.find_largest_free(&mut machine), None);
	}

	#[test] fn test_corruption_is_distinct_from_no_space() {
		let (mut machine, manager) = new_chain(64);
		let a = manager.allocate(&mut machine, 10, 0xa).unwrap();
		let next = a.next(&machine).unwrap();
		// The guest scribbles over the second header.
		machine.poke_u8(next.segment as u32 * 16, b'X');
		assert!(!manager.check_chain_integrity(&machine));
		assert_eq!(manager.allocate(&mut machine, 5, 0xb), Err(DosMemoryError::ChainCorrupted{segment: next.segment}));
		assert_eq!(DosErrorCode::from(DosMemoryError::ChainCorrupted{segment: 0}), DosErrorCode::MemoryControlBlockDestroyed);
	}

	#[test] fn test_largest_free_stops_at_damage() {
		let (mut machine, manager) = new_chain(64);
		let a = manager.allocate(&mut machine, 20, 0xa).unwrap();
		let b = manager.allocate(&mut machine, 10, 0xb).unwrap();
		manager.free(&mut machine, a).unwrap();
		let tail = b.next(&machine).unwrap();
		machine.poke_u8(tail.segment as u32 * 16, b'X');
		assert_eq!(manager.allocate(&mut machine, 25, 0xc), Err(DosMemoryError::ChainCorrupted{segment: tail.segment}));
		let largest = manager.find_largest_free(&mut machine).unwrap();
		assert_eq!(largest.segment, a.segment);
		assert_eq!(largest.size(&machine), 20);
	}

	#[test] fn test_largest_free_on_damaged_first_block() {
		let (mut machine, manager) = new_chain(64);
		machine.poke_u8(START as u32 * 16, b'X');
		assert_eq!(manager.find_largest_free(&mut machine), None);
	}

	#[test] fn test_chain_running_off_the_end_is_corrupt() {
		let (mut machine, manager) = new_chain(64);
		let a = manager.allocate(&mut machine, 10, 0xa).unwrap();
		a.set_size(&mut machine, 80);
		assert!(!manager.check_chain_integrity(&machine));
	}

	#[derive(Debug, Clone)]
	enum ChainOperation {
		Allocate(u16, AllocationStrategy),
		Free(usize),
		Resize(usize, u16),
	}

	fn chain_operation() -> impl Strategy<Value = ChainOperation> {
		let fit = prop_oneof![
			Just(AllocationStrategy::FirstFit),
			Just(AllocationStrategy::BestFit),
			Just(AllocationStrategy::LastFit),
		];
		prop_oneof![
			(1..0x60u16, fit).prop_map(|(size, fit)| ChainOperation::Allocate(size, fit)),
			any::<usize>().prop_map(ChainOperation::Free),
			(any::<usize>(), 1..0x80u16).prop_map(|(index, size)| ChainOperation::Resize(index, size)),
		]
	}

	proptest! {
		#[test]
		fn test_chain_stays_intact_through_any_operations(operations in proptest::collection::vec(chain_operation(), 1..80)) {
			let (mut machine, manager) = new_chain(0x400);
			let mut live: Vec<MemoryControlBlock> = vec![];
			for operation in operations {
				match operation {
					ChainOperation::Allocate(size, fit) => {
						match manager.allocate_with_strategy(&mut machine, size, 0x42, fit) {
							Ok(block) => {
								prop_assert_eq!(block.size(&machine), size);
								live.push(block);
							}
							Err(DosMemoryError::InsufficientMemory{available}) => prop_assert!(available < size),
							Err(err) => prop_assert!(false, "allocate failed: {}", err),
						}
					}
					ChainOperation::Free(index) if !live.is_empty() => {
						let block = live.remove(index % live.len());
						prop_assert_eq!(manager.free(&mut machine, block), Ok(()));
					}
					ChainOperation::Resize(index, size) if !live.is_empty() => {
						let block = live[index % live.len()];
						let old_size = block.size(&machine);
						match manager.resize(&mut machine, block.data_segment(), size, 0x42) {
							Ok(_) => prop_assert_eq!(block.size(&machine), size),
							Err(DosMemoryError::InsufficientMemory{available}) => {
								prop_assert!(available < size);
								prop_assert_eq!(block.size(&machine), old_size);
							}
							Err(err) => prop_assert!(false, "resize failed: {}", err),
						}
					}
					_ => {}
				}
				prop_assert!(manager.check_chain_integrity(&machine));
				// Headers plus data always cover the whole region.
				let blocks = manager.blocks(&machine).unwrap();
				let total: u32 = blocks.iter().map(|block| block.size(&machine) as u32 + 1).sum();
				prop_assert_eq!(total, 0x400);
				for block in &live {
					prop_assert_eq!(block.owner(&machine), 0x42);
				}
			}
		}
	}

	#[test] fn test_strategy_values() {
		assert_eq!(MemoryStrategy::from_u16(0x01).unwrap().fit, AllocationStrategy::BestFit);
		let high = MemoryStrategy::from_u16(0x82).unwrap();
		assert_eq!(high.fit, AllocationStrategy::LastFit);
		assert_eq!(high.high_memory, HighMemoryPreference::HighThenLow);
		assert_eq!(high.to_u16(), 0x82);
		assert_eq!(MemoryStrategy::from_u16(0x03), Err(DosErrorCode::InvalidFunction));
		assert_eq!(MemoryStrategy::from_u16(0xc0), Err(DosErrorCode::InvalidFunction));
		assert_eq!(MemoryStrategy::from_u16(0x04), Err(DosErrorCode::InvalidFunction));
	}

	#[test] fn test_high_memory_bits_do_not_change_selection() {
		let (mut machine, mut manager) = fragmented_chain();
		manager.strategy = MemoryStrategy::from_u16(0x40).unwrap();
		let block = manager.allocate(&mut machine, 8, 0x3).unwrap();
		assert_eq!(block.segment, START);
	}
}
