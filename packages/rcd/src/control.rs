//! Inbound command parsing.
//!
//! ```text
//! <device>;<raw command>                       forward to the control file
//! *;<raw command>                              forward to every device
//! <device>;debugfs;<file>                      read file, reply to sender
//! <device>;debugfs;<file>;<value>              write value to file
//! <device>;debugfs_monitor;<file>;<port>[;<bufsize>;<timeout_ms>]
//! ```

use std::io;
use std::time::Duration;

use crate::session::SessionError;

/// Longest accepted debugfs file name.
pub const MAX_FILE_NAME: usize = 64;

/// Deepest accepted debugfs file name, in path components.
pub const MAX_FILE_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Device(String),
}

/// Batching parameters for a compressed monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferArgs {
    pub size: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Control {
        target: Target,
        payload: String,
    },
    DebugfsRead {
        device: String,
        file: String,
    },
    DebugfsWrite {
        device: String,
        file: String,
        value: String,
    },
    Monitor {
        device: String,
        file: String,
        port: u16,
        compression: Option<BufferArgs>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Syntax error")]
    Syntax,

    #[error("Device not found")]
    UnknownDevice,

    #[error("Cannot use debugfs with wildcard device")]
    WildcardDebugfs,

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl CommandError {
    /// Error line sent back to the issuing subscriber.
    pub fn reply(&self) -> String {
        format!("*;0;#error;{self}\n")
    }
}

/// Parse one inbound line. Lines without a payload yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    if line.is_empty() {
        return Ok(None);
    }

    let (id, rest) = line.split_once(';').ok_or(CommandError::Syntax)?;
    if id.is_empty() {
        return Err(CommandError::Syntax);
    }
    if rest.is_empty() {
        return Ok(None);
    }
    let target = if id == "*" {
        Target::All
    } else {
        Target::Device(id.to_string())
    };

    if let Some((cmd, args)) = rest.split_once(';') {
        if cmd.starts_with("debugfs") {
            let Target::Device(device) = target else {
                return Err(CommandError::WildcardDebugfs);
            };
            return parse_debugfs(device, cmd, args).map(Some);
        }
    }

    Ok(Some(Command::Control {
        target,
        payload: rest.to_string(),
    }))
}

fn parse_debugfs(device: String, cmd: &str, args: &str) -> Result<Command, CommandError> {
    let (file, extra) = match args.split_once(';') {
        Some((file, extra)) => (file, Some(extra)),
        None => (args, None),
    };
    validate_file_name(file)?;
    let file = file.to_string();

    match (cmd, extra) {
        ("debugfs", None) => Ok(Command::DebugfsRead { device, file }),
        ("debugfs", Some(value)) => Ok(Command::DebugfsWrite {
            device,
            file,
            value: value.to_string(),
        }),
        ("debugfs_monitor", Some(extra)) => {
            let fields: Vec<&str> = extra.split(';').collect();
            let compression = match fields.len() {
                1 => None,
                3 => Some(BufferArgs {
                    size: parse_number::<usize>(fields[1])
                        .filter(|&n| n > 0)
                        .ok_or(CommandError::Syntax)?,
                    timeout: Duration::from_millis(
                        parse_number::<u64>(fields[2]).ok_or(CommandError::Syntax)?,
                    ),
                }),
                _ => return Err(CommandError::Syntax),
            };
            let port: u16 = parse_number(fields[0]).ok_or(CommandError::Syntax)?;
            Ok(Command::Monitor {
                device,
                file,
                port,
                compression,
            })
        }
        ("debugfs_monitor", None) => Err(CommandError::Syntax),
        _ => Err(CommandError::InvalidArgument),
    }
}

fn parse_number<T: std::str::FromStr>(field: &str) -> Option<T> {
    field.trim().parse().ok()
}

/// Accept only short relative names without dots, so a name can never
/// leave the device's debugfs directory.
pub fn validate_file_name(file: &str) -> Result<(), CommandError> {
    let ok = !file.is_empty()
        && file.len() <= MAX_FILE_NAME
        && !file.contains('.')
        && !file.starts_with('/')
        && file.split('/').all(|part| !part.is_empty())
        && file.split('/').count() <= MAX_FILE_DEPTH;

    if ok {
        Ok(())
    } else {
        Err(CommandError::InvalidArgument)
    }
}
