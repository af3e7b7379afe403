mod client;
mod command;

pub use client::RemoteClient;
pub use command::{CommandOutput, CommandRunner, ShellRunner};
