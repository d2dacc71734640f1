//! Sandbox-side runtime: the live value model, the marshalling layer,
//! the capture function and the interpreter that hosts them.

pub mod capture;
pub mod interpreter;
pub mod marshal;
pub mod sandbox;
pub mod value;

pub use capture::ProbeRuntime;
pub use interpreter::{ConsoleLevel, ConsoleSink, Interpreter, RecordingConsole, SilentConsole};
pub use marshal::marshal;
pub use sandbox::{SandboxHandle, spawn_sandbox};
pub use value::Value;
