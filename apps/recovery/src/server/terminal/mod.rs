mod pty;

pub use pty::{PtyProcess, PtyReader, PtyWriter, ShellCommand, SpawnConfig};
