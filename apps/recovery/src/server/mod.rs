pub mod shell;
pub mod terminal;

pub use shell::{ShellError, ShellServer, ShellService, SshShellService};
pub use terminal::ShellCommand;
