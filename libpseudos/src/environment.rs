/// The process-wide environment variable set. Order is kept because programs see the variables in
/// the order they were set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnvironmentVariables {
	variables: Vec<(String, String)>,
}

// The word between the double NUL and the program path. It counts the strings that follow.
const ENVIRONMENT_PATH_MARKER: u16 = 0x0001;

impl EnvironmentVariables {
	pub fn new() -> EnvironmentVariables {
		EnvironmentVariables::default()
	}

	pub fn from_pairs<I: IntoIterator<Item = (String, String)>>(pairs: I) -> EnvironmentVariables {
		let mut environment = EnvironmentVariables::new();
		for (key, value) in pairs {
			environment.set(&key, &value);
		}
		environment
	}

	/// Keys are case insensitive like in COMMAND.COM and stored upper case. Setting an existing
	/// key keeps its position.
	pub fn set(&mut self, key: &str, value: &str) {
		let key = key.to_uppercase();
		match self.variables.iter_mut().find(|(existing, _)| *existing == key) {
			Some(entry) => entry.1 = value.to_string(),
			None => self.variables.push((key, value.to_string())),
		}
	}

	/// The bytes of an environment block: each `KEY=VALUE` NUL terminated, an extra NUL, the
	/// marker word and then the full path of the program.
	pub fn build_block(&self, program_path: &[u8]) -> Vec<u8> {
		let mut block = vec![];
		for (key, value) in &self.variables {
			block.extend_from_slice(key.as_bytes());
			block.push(b'=');
			block.extend_from_slice(value.as_bytes());
			block.push(0);
		}
		// An empty environment still needs its terminating double NUL.
		if self.variables.is_empty() {
			block.push(0);
		}
		block.push(0);
		block.extend_from_slice(&ENVIRONMENT_PATH_MARKER.to_le_bytes());
		block.extend_from_slice(program_path);
		block.push(0);
		block
	}
}
