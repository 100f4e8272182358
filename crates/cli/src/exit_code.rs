// Consistent exit codes for the tandem CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   10 = relay not reachable
//   11 = configuration error
//   13 = network timeout

use std::process;

use tandem_client::config::ConfigError;
use tandem_common::error::SyncError;

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    RelayDown = 10,
    Config = 11,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(sync_err) = cause.downcast_ref::<SyncError>() {
                return Self::from_sync_code(sync_err.code());
            }
            if cause.downcast_ref::<ConfigError>().is_some() {
                return Self::Config;
            }
            if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
                return Self::Network;
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused => Self::RelayDown,
                    std::io::ErrorKind::TimedOut => Self::Network,
                    _ => Self::Error,
                };
            }
        }

        let msg = format!("{err:#}");
        if msg.contains("relay") && (msg.contains("connect") || msg.contains("refused")) {
            return Self::RelayDown;
        }

        Self::Error
    }

    /// Map a `SyncError` code string to an exit code.
    pub fn from_sync_code(code: &str) -> Self {
        match code {
            "SYNC_CONNECTION_LOST" => Self::RelayDown,
            "SYNC_MALFORMED_MESSAGE" => Self::Usage,
            _ => Self::Error,
        }
    }

    /// Exit the process with this code.
    pub fn exit(self) -> ! {
        process::exit(self.code())
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}
