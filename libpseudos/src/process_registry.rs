use crate::psp::ProgramSegmentPrefix;

/// The processes that are currently loaded, oldest first, and the PSP that INT 21h calls act on.
///
/// The current segment is not always the top of the stack: INT 21h/50h lets a program switch it to
/// anything it likes.
#[derive(Debug, Clone, PartialEq)]
pub struct DosProcessRegistry {
	root_segment: u16,
	processes: Vec<u16>,
	current_segment: u16,
}

impl DosProcessRegistry {
	pub fn new(root_segment: u16) -> DosProcessRegistry {
		DosProcessRegistry {
			root_segment,
			processes: vec![],
			current_segment: root_segment,
		}
	}

	pub fn root_segment(&self) -> u16 {
		self.root_segment
	}

	pub fn push(&mut self, segment: u16) {
		self.processes.push(segment);
		self.current_segment = segment;
	}

	/// Removes the current process. Afterwards the newest remaining process (or the root) is
	/// current.
	pub fn pop_current(&mut self) -> Option<u16> {
		let pos = self.processes.iter().rposition(|segment| *segment == self.current_segment)?;
		let removed = self.processes.remove(pos);
		self.current_segment = self.processes.last().cloned().unwrap_or(self.root_segment);
		Some(removed)
	}

	pub fn current(&self) -> Option<ProgramSegmentPrefix> {
		if self.contains(self.current_segment) {
			Some(ProgramSegmentPrefix::new(self.current_segment))
		} else {
			None
		}
	}

	pub fn current_segment(&self) -> u16 {
		self.current_segment
	}

	pub fn set_current_segment(&mut self, segment: u16) {
		self.current_segment = segment;
	}

	pub fn contains(&self, segment: u16) -> bool {
		self.processes.contains(&segment)
	}

	pub fn processes(&self) -> &[u16] {
		&self.processes
	}

	pub fn is_empty(&self) -> bool {
		self.processes.is_empty()
	}
}
