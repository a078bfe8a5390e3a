use std::process;

/// How the process is about to terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// A polling cycle ran to completion.
    Success,
    /// A fatal error was hit; details are already logged.
    Failure,
    /// Dying because this signal was received.
    Signal(i32),
}

pub enum Never {}

impl ExitCode {
    pub fn exit(self) -> Never {
        let code = match self {
            ExitCode::Success => 0,
            ExitCode::Failure => 1,
            ExitCode::Signal(signal) => signal,
        };

        process::exit(code)
    }
}
