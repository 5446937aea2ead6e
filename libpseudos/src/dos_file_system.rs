use crate::dos_error_codes::DosErrorCode;

use log::warn;

use std::collections::HashMap;
use std::io::Read;

// Bit 7 of the access mode byte given to INT 21h/3Dh.
pub const OPEN_NO_INHERIT: u8 = 0x80;

#[derive(Debug, Clone, PartialEq)]
pub enum DosReadError {
	/// Reported back to the guest.
	Dos(DosErrorCode),
	/// The host failed after the file was found, e.g. it vanished part way through. There is no
	/// DOS error that covers this.
	Host(String),
}

impl From<DosErrorCode> for DosReadError {
	fn from(code: DosErrorCode) -> DosReadError {
		DosReadError::Dos(code)
	}
}

impl std::fmt::Display for DosReadError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			DosReadError::Dos(code) => write!(f, "DOS error {}", code),
			DosReadError::Host(message) => write!(f, "host I/O failure: {}", message),
		}
	}
}

/// The host side of DOS file handles, as far as loading and ending programs needs it.
///
/// Handles returned here are what gets stored in a PSP's file handle table.
pub trait DosFileSystem : std::fmt::Debug {
	/// Returns a file handle if successful. Error code if not.
	fn open(&mut self, filename: &[u8], access_mode: u8) -> Result<u8, DosErrorCode>;
	/// Returns error code if close failed.
	fn close(&mut self, handle: u8) -> Result<(), DosErrorCode>;
	/// Reads a whole file, for loading programs.
	fn read_file(&mut self, filename: &[u8]) -> Result<Vec<u8>, DosReadError>;
	/// Whether the handle was opened with the no-inherit bit, so child processes must not get it.
	fn is_no_inherit(&self, handle: u8) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DosFileAccessMode {
	ReadOnly,
	WriteOnly,
	ReadWrite,
}

impl DosFileAccessMode {
	pub fn from_u8(access_mode: u8) -> Result<DosFileAccessMode, DosErrorCode> {
		match access_mode & 0x07 {
			0 => Ok(DosFileAccessMode::ReadOnly),
			1 => Ok(DosFileAccessMode::WriteOnly),
			2 => Ok(DosFileAccessMode::ReadWrite),
			_ => Err(DosErrorCode::InvalidFileAccessMode),
		}
	}
}

// The first handles of the system file table are the devices every process starts with.
const FIRST_FILE_HANDLE: usize = 5;
const MAX_FILE_HANDLES: usize = 0xfe;

/// Strips a drive letter and leading backslashes. Only the file name part is looked up.
fn dos_file_title(filename: &[u8]) -> &[u8] {
	let after_drive = if filename.len() >= 2 && filename[1] == b':' { &filename[2..] } else { filename };
	match after_drive.iter().rposition(|c| *c == b'\\' || *c == b'/') {
		Some(pos) => &after_drive[pos + 1..],
		None => after_drive,
	}
}

fn ascii_filename_to_string(ascii: &[u8]) -> String {
	ascii.iter().map(|c| c.to_ascii_uppercase() as char).collect()
}

fn std_file_error_to_dos_error(err: std::io::Error) -> DosErrorCode {
	match err.kind() {
		std::io::ErrorKind::NotFound => DosErrorCode::FileNotFound,
		std::io::ErrorKind::PermissionDenied => DosErrorCode::AccessDenied,
		std::io::ErrorKind::AlreadyExists => DosErrorCode::FileAlreadyExists,
		_ => {
			warn!("Unexpected file error: {:?}", err);
			DosErrorCode::PathNotFound
		}
	}
}

#[derive(Debug)]
struct OpenFile<F> {
	// Held so the host file stays open for as long as the guest has the handle.
	#[allow(dead_code)]
	file: F,
	no_inherit: bool,
}

/// Serves files out of one directory on the host. DOS names are matched case insensitively.
#[derive(Debug)]
pub struct StandardDosFileSystem {
	root_path: std::path::PathBuf,
	file_handles: Vec<Option<OpenFile<std::fs::File>>>,
}

impl StandardDosFileSystem {
	pub fn new(root_path: std::path::PathBuf) -> StandardDosFileSystem {
		StandardDosFileSystem {
			root_path,
			file_handles: vec![],
		}
	}

	fn get_empty_slot(&mut self) -> Result<usize, DosErrorCode> {
		get_empty_slot(&mut self.file_handles)
	}

	fn get_real_filepath(&self, filename: &[u8]) -> std::path::PathBuf {
		let mut string_filename = ascii_filename_to_string(dos_file_title(filename));

		if let Ok(read_dir) = std::fs::read_dir(&self.root_path) {
			for dir_file_entry in read_dir.flatten() {
				if let Ok(dir_file_entry_name) = dir_file_entry.file_name().into_string() {
					if dir_file_entry_name.to_uppercase() == string_filename {
						string_filename = dir_file_entry_name;
						break;
					}
				}
			}
		}
		self.root_path.join(string_filename)
	}
}

fn get_empty_slot<F>(file_handles: &mut Vec<Option<OpenFile<F>>>) -> Result<usize, DosErrorCode> {
	match file_handles.iter().position(|slot| slot.is_none()) {
		Some(pos) => Ok(pos),
		None => {
			if file_handles.len() >= MAX_FILE_HANDLES - FIRST_FILE_HANDLE {
				return Err(DosErrorCode::NoFileHandlesLeft);
			}
			file_handles.push(None);
			Ok(file_handles.len() - 1)
		}
	}
}

fn slot_for_handle<F>(file_handles: &mut Vec<Option<OpenFile<F>>>, handle: u8) -> Option<&mut Option<OpenFile<F>>> {
	(handle as usize).checked_sub(FIRST_FILE_HANDLE).and_then(move |index| file_handles.get_mut(index))
}

fn close_slot<F>(file_handles: &mut Vec<Option<OpenFile<F>>>, handle: u8) -> Result<(), DosErrorCode> {
	match slot_for_handle(file_handles, handle) {
		Some(slot) if slot.is_some() => {
			*slot = None;
			Ok(())
		}
		_ => Err(DosErrorCode::InvalidFileHandle),
	}
}

fn slot_is_no_inherit<F>(file_handles: &[Option<OpenFile<F>>], handle: u8) -> bool {
	(handle as usize).checked_sub(FIRST_FILE_HANDLE)
		.and_then(|index| file_handles.get(index))
		.map_or(false, |slot| slot.as_ref().map_or(false, |open_file| open_file.no_inherit))
}

impl DosFileSystem for StandardDosFileSystem {
	fn open(&mut self, filename: &[u8], access_mode: u8) -> Result<u8, DosErrorCode> {
		let mode = DosFileAccessMode::from_u8(access_mode)?;
		let real_filepath = self.get_real_filepath(filename);
		let slot = self.get_empty_slot()?;

		let mut open_options = std::fs::OpenOptions::new();
		open_options
			.read(mode == DosFileAccessMode::ReadOnly || mode == DosFileAccessMode::ReadWrite)
			.write(mode == DosFileAccessMode::WriteOnly || mode == DosFileAccessMode::ReadWrite);

		match open_options.open(real_filepath) {
			Ok(file) => {
				self.file_handles[slot] = Some(OpenFile{file, no_inherit: access_mode & OPEN_NO_INHERIT != 0});
				Ok((slot + FIRST_FILE_HANDLE) as u8)
			}
			Err(err) => Err(std_file_error_to_dos_error(err)),
		}
	}

	fn close(&mut self, handle: u8) -> Result<(), DosErrorCode> {
		close_slot(&mut self.file_handles, handle)
	}

	fn read_file(&mut self, filename: &[u8]) -> Result<Vec<u8>, DosReadError> {
		let real_filepath = self.get_real_filepath(filename);
		let mut file = std::fs::File::open(&real_filepath).map_err(std_file_error_to_dos_error)?;
		let metadata = file.metadata().map_err(|err| DosReadError::Host(format!("{}: {}", real_filepath.display(), err)))?;
		if metadata.is_dir() {
			return Err(DosErrorCode::AccessDenied.into());
		}
		let mut data = vec![];
		file.read_to_end(&mut data).map_err(|err| DosReadError::Host(format!("{}: {}", real_filepath.display(), err)))?;
		Ok(data)
	}

	fn is_no_inherit(&self, handle: u8) -> bool {
		slot_is_no_inherit(&self.file_handles, handle)
	}
}

/// Files held in memory. Used for tests and for embedding programs without a host directory.
#[derive(Debug, Default)]
pub struct InMemoryDosFileSystem {
	files: HashMap<String, Vec<u8>>,
	file_handles: Vec<Option<OpenFile<String>>>,
}

impl InMemoryDosFileSystem {
	pub fn new() -> InMemoryDosFileSystem {
		InMemoryDosFileSystem::default()
	}

	pub fn insert_file(&mut self, filename: &[u8], data: Vec<u8>) {
		self.files.insert(ascii_filename_to_string(dos_file_title(filename)), data);
	}
}

impl DosFileSystem for InMemoryDosFileSystem {
	fn open(&mut self, filename: &[u8], access_mode: u8) -> Result<u8, DosErrorCode> {
		DosFileAccessMode::from_u8(access_mode)?;
		let name = ascii_filename_to_string(dos_file_title(filename));
		if !self.files.contains_key(&name) {
			return Err(DosErrorCode::FileNotFound);
		}
		let slot = get_empty_slot(&mut self.file_handles)?;
		self.file_handles[slot] = Some(OpenFile{file: name, no_inherit: access_mode & OPEN_NO_INHERIT != 0});
		Ok((slot + FIRST_FILE_HANDLE) as u8)
	}

	fn close(&mut self, handle: u8) -> Result<(), DosErrorCode> {
		close_slot(&mut self.file_handles, handle)
	}

	fn read_file(&mut self, filename: &[u8]) -> Result<Vec<u8>, DosReadError> {
		self.files.get(&ascii_filename_to_string(dos_file_title(filename)))
			.cloned()
			.ok_or(DosReadError::Dos(DosErrorCode::FileNotFound))
	}

	fn is_no_inherit(&self, handle: u8) -> bool {
		slot_is_no_inherit(&self.file_handles, handle)
	}
}
