pub mod bios_loader;
pub mod config;
pub mod dos_event_handler;
pub mod dos_error_codes;
pub mod dos_file_system;
pub mod environment;
pub mod exe_loader;
pub mod machine;
pub mod mcb;
pub mod memory_manager;
pub mod process_manager;
pub mod process_registry;
pub mod psp;

// https://en.wikipedia.org/wiki/Program_Segment_Prefix
// http://www.ctyme.com/intr/rb-2939.htm (memory control blocks)
// https://toonormal.com/2018/06/07/notes-ms-dos-dev-for-intel-8086-cpus-using-a-modern-pc/
// - "DOS programs require that all programs start at the 256 byte boundary"
