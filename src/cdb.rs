//! SCSI command descriptor blocks, treated as opaque bytes.
//!
//! The ring never interprets a CDB, but the kernel finds its end from the
//! operation code alone, so a [`CommandBlock`] is only accepted when its length
//! matches the opcode's group (SPC-4 4.2.5.1).

use crate::error::{Error, Result};

/// "The TEST UNIT READY command provides a means to check if the logical unit
/// is ready."
///
/// SPC-2 7.25
pub const TEST_UNIT_READY: u8 = 0x00;

/// Opcode of a variable length CDB, whose length lives in byte 7.
const VARIABLE_LENGTH: u8 = 0x7f;

/// Length a CDB starting with `cdb[0]` must have, if the opcode's group
/// defines one.
///
/// Returns `None` for reserved and vendor specific groups, and for a variable
/// length CDB too short to carry its length byte.
pub fn expected_len(cdb: &[u8]) -> Option<usize> {
    let opcode = *cdb.first()?;
    match opcode {
        0x00..=0x1f => Some(6),
        0x20..=0x5f => Some(10),
        VARIABLE_LENGTH => cdb.get(7).map(|additional| usize::from(*additional) + 8),
        0x80..=0x9f => Some(16),
        0xa0..=0xbf => Some(12),
        _ => None,
    }
}

/// A serialized CDB ready to be placed in a ring slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandBlock {
    bytes: Vec<u8>,
}

impl CommandBlock {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        let Some(expected) = expected_len(&bytes) else {
            return Err(Error::InvalidCdb(match bytes.first() {
                Some(opcode) => format!("opcode 0x{opcode:02x} has no defined length"),
                None => "empty CDB".to_owned(),
            }));
        };
        if bytes.len() != expected {
            return Err(Error::InvalidCdb(format!(
                "opcode 0x{:02x} needs {expected} bytes, got {}",
                bytes[0],
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// A 6 byte TEST UNIT READY with every other field zero.
pub fn test_unit_ready() -> CommandBlock {
    CommandBlock {
        bytes: vec![TEST_UNIT_READY, 0, 0, 0, 0, 0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_lengths() {
        assert_eq!(expected_len(&[0x00]), Some(6));
        assert_eq!(expected_len(&[0x28]), Some(10));
        assert_eq!(expected_len(&[0x88]), Some(16));
        assert_eq!(expected_len(&[0xa8]), Some(12));
        assert_eq!(expected_len(&[0x60]), None);
        assert_eq!(expected_len(&[0xc0]), None);
        assert_eq!(expected_len(&[]), None);
    }

    #[test]
    fn variable_length_reads_byte_7() {
        let mut cdb = vec![0u8; 32];
        cdb[0] = VARIABLE_LENGTH;
        cdb[7] = 24;
        assert_eq!(expected_len(&cdb), Some(32));
        assert_eq!(expected_len(&cdb[..7]), None);
        assert!(CommandBlock::new(cdb).is_ok());
    }

    #[test]
    fn rejects_length_mismatch() {
        let e = CommandBlock::new(vec![0x28; 6]).expect_err("READ(10) is 10 bytes");
        assert!(e.to_string().contains("needs 10 bytes"));
        assert!(matches!(CommandBlock::new(Vec::new()), Err(Error::InvalidCdb(_))));
    }

    #[test]
    fn test_unit_ready_is_well_formed() {
        let cdb = test_unit_ready();
        assert_eq!(cdb.len(), 6);
        assert_eq!(cdb.opcode(), TEST_UNIT_READY);
        assert_eq!(CommandBlock::new(cdb.as_bytes().to_vec()).unwrap(), cdb);
    }
}
