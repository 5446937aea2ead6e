// http://stanislavs.org/helppc/dos_error_codes.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DosErrorCode {
	InvalidFunction = 0x01,
	FileNotFound = 0x02,
	PathNotFound = 0x03,
	NoFileHandlesLeft = 0x04,
	AccessDenied = 0x05,
	InvalidFileHandle = 0x06,
	MemoryControlBlockDestroyed = 0x07,
	InsufficientMemory = 0x08,
	InvalidMemoryBlockAddress = 0x09,
	InvalidEnvironment = 0x0a,
	InvalidFormat = 0x0b,
	InvalidFileAccessMode = 0x0c,
	FileAlreadyExists = 0x50,
}

impl std::fmt::Display for DosErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?} (0x{:02x})", self, *self as u8)
	}
}
