//! Messages exchanged by the transports to carry out collectives
//!
//! Every participant counts collectives. Each envelope carries the sequence
//! number of the collective it belongs to, so a participant that is one step
//! ahead or behind gets an error instead of consuming the wrong frame.
//!
//! On byte streams an envelope travels as a 4-byte little-endian length
//! followed by its bincode encoding.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};

/// Largest encoded envelope accepted from a stream
pub const MAX_ENVELOPE_LEN: usize = 1 << 20;

/// A single transport message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    /// Worker introduces itself after connecting
    Hello { rank: usize },

    /// Coordinator's command frame for collective `seq`
    Broadcast { seq: u64, frame: Vec<u8> },

    /// Worker `rank` reached barrier `seq`
    Arrive { seq: u64, rank: usize },

    /// Every participant reached barrier `seq`
    Release { seq: u64 },

    /// Worker `rank` left the channel
    Departed { rank: usize },
}

impl Envelope {
    /// Short kind name for error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::Broadcast { .. } => "broadcast",
            Envelope::Arrive { .. } => "arrive",
            Envelope::Release { .. } => "release",
            Envelope::Departed { .. } => "departed",
        }
    }

    /// Serialize to bytes using bincode
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Write one length-prefixed envelope
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let bytes = self
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "envelope too large"))?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&bytes)?;
        writer.flush()
    }

    /// Read one length-prefixed envelope
    ///
    /// A stream closed before the first byte yields `UnexpectedEof`.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut len = [0u8; 4];
        reader.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_ENVELOPE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("envelope of {} bytes exceeds limit of {}", len, MAX_ENVELOPE_LEN),
            ));
        }

        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        Self::from_bytes(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Envelope::Hello { rank } => write!(f, "hello from rank {}", rank),
            Envelope::Broadcast { seq, frame } => {
                write!(f, "broadcast #{} ({} bytes)", seq, frame.len())
            }
            Envelope::Arrive { seq, rank } => write!(f, "arrive #{} from rank {}", seq, rank),
            Envelope::Release { seq } => write!(f, "release #{}", seq),
            Envelope::Departed { rank } => write!(f, "rank {} departed", rank),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_stream_framing() {
        let mut buf = Vec::new();
        let first = Envelope::Broadcast {
            seq: 3,
            frame: b"SYNC\0\0\0\0".to_vec(),
        };
        let second = Envelope::Arrive { seq: 4, rank: 2 };
        first.write_to(&mut buf).unwrap();
        second.write_to(&mut buf).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(Envelope::read_from(&mut cursor).unwrap(), first);
        assert_eq!(Envelope::read_from(&mut cursor).unwrap(), second);

        let err = Envelope::read_from(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let len = (MAX_ENVELOPE_LEN as u32 + 1).to_le_bytes();
        let mut cursor = Cursor::new(len.to_vec());
        let err = Envelope::read_from(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_display() {
        assert_eq!(Envelope::Release { seq: 9 }.to_string(), "release #9");
        assert_eq!(Envelope::Departed { rank: 1 }.kind(), "departed");
    }
}
