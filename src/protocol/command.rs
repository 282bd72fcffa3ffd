//! Command vocabulary and fixed-size frame codec

use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;

/// Frame capacity used when the policy does not set one
pub const DEFAULT_FRAME_CAPACITY: usize = 256;

/// Smallest frame that can carry every command
///
/// "CONTINUE"/"SHUTDOWN" need 9 bytes, "PROCESS" + terminator + index needs 12.
pub const MIN_FRAME_CAPACITY: usize = 12;

/// Size of the stage index that follows a PROCESS name
const STAGE_INDEX_WIDTH: usize = std::mem::size_of::<i32>();

/// A control message broadcast from the coordinator to the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Liveness round: no work follows
    Continue,
    /// Leave the receive loop and exit
    Shutdown,
    /// Exchange data directly among workers, then barrier
    Sync,
    /// Run the stage at `stage_index`, then barrier
    Process { stage_index: i32 },
}

impl Command {
    /// Every command name, in wire spelling
    pub const NAMES: [&'static str; 4] = ["CONTINUE", "SHUTDOWN", "SYNC", "PROCESS"];

    /// Canonical wire name
    pub fn name(&self) -> &'static str {
        match self {
            Command::Continue => "CONTINUE",
            Command::Shutdown => "SHUTDOWN",
            Command::Sync => "SYNC",
            Command::Process { .. } => "PROCESS",
        }
    }

    /// True if workers join a barrier after handling this command
    pub fn is_round(&self) -> bool {
        matches!(self, Command::Sync | Command::Process { .. })
    }

    /// Bytes this command occupies in a frame, terminator included
    pub fn encoded_len(&self) -> usize {
        let payload = match self {
            Command::Process { .. } => STAGE_INDEX_WIDTH,
            _ => 0,
        };
        self.name().len() + 1 + payload
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Process { stage_index } => write!(f, "PROCESS({})", stage_index),
            other => f.write_str(other.name()),
        }
    }
}

/// Encodes and decodes commands into fixed-capacity frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandCodec {
    capacity: usize,
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_CAPACITY)
    }
}

impl CommandCodec {
    /// Create a codec for frames of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Frame size in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A zeroed frame, ready to receive a broadcast
    pub fn empty_frame(&self) -> Vec<u8> {
        vec![0u8; self.capacity]
    }

    /// Write `command` into `frame`
    ///
    /// The frame must be exactly `capacity` bytes. A command that does not fit
    /// strictly inside it, terminator included, is rejected rather than
    /// truncated.
    pub fn encode(&self, command: &Command, frame: &mut [u8]) -> ProtocolResult<()> {
        self.check_frame_len(frame.len())?;

        let required = command.encoded_len();
        if required > self.capacity {
            return Err(ProtocolError::Framing {
                what: format!("command {}", command.name()),
                required,
                capacity: self.capacity,
            });
        }

        frame.fill(0);
        let name = command.name().as_bytes();
        frame[..name.len()].copy_from_slice(name);
        // frame[name.len()] stays 0: terminator

        if let Command::Process { stage_index } = command {
            let start = name.len() + 1;
            frame[start..start + STAGE_INDEX_WIDTH].copy_from_slice(&stage_index.to_le_bytes());
        }

        Ok(())
    }

    /// Allocate a frame and encode `command` into it
    pub fn frame(&self, command: &Command) -> ProtocolResult<Vec<u8>> {
        let mut frame = self.empty_frame();
        self.encode(command, &mut frame)?;
        Ok(frame)
    }

    /// Read the command held in `frame`
    pub fn decode(&self, frame: &[u8]) -> ProtocolResult<Command> {
        self.check_frame_len(frame.len())?;

        let terminator = frame.iter().position(|&b| b == 0).ok_or_else(|| ProtocolError::Framing {
            what: "unterminated command name".to_string(),
            required: self.capacity + 1,
            capacity: self.capacity,
        })?;

        let raw = &frame[..terminator];
        let name = String::from_utf8_lossy(raw);
        let name = name.trim_end_matches(' ');

        match name {
            "CONTINUE" => Ok(Command::Continue),
            "SHUTDOWN" => Ok(Command::Shutdown),
            "SYNC" => Ok(Command::Sync),
            "PROCESS" => {
                let start = terminator + 1;
                let end = start + STAGE_INDEX_WIDTH;
                let bytes = frame.get(start..end).ok_or_else(|| ProtocolError::Framing {
                    what: "PROCESS stage index".to_string(),
                    required: end,
                    capacity: self.capacity,
                })?;
                let mut index = [0u8; STAGE_INDEX_WIDTH];
                index.copy_from_slice(bytes);
                Ok(Command::Process {
                    stage_index: i32::from_le_bytes(index),
                })
            }
            other => Err(ProtocolError::UnknownCommand {
                name: other.to_string(),
            }),
        }
    }

    fn check_frame_len(&self, len: usize) -> ProtocolResult<()> {
        if len != self.capacity {
            return Err(ProtocolError::Framing {
                what: format!("frame buffer of {} bytes", len),
                required: len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}
