//! Sphero command packet codec
//!
//! # Packet Structure
//!
//! ```text
//! [0]     : SOP1 (always 0xFF)
//! [1]     : SOP2 (0xFF = answer requested, 0xFE = no answer)
//! [2]     : DID  - virtual device id
//! [3]     : CID  - command id
//! [4]     : SEQ  - sequence number, echoed in the answer
//! [5]     : DLEN - payload length
//! [6..]   : payload (DLEN bytes)
//! [last]  : CHK  - !(sum(DID..=last payload byte) mod 256)
//! ```

use crate::domain::commands::SpheroCommand;
use crate::error::CodecError;
use crate::infrastructure::bluetooth::transport::WriteMode;

pub const SOP1: u8 = 0xFF;
pub const SOP2_ACKNOWLEDGED: u8 = 0xFF;
pub const SOP2_UNACKNOWLEDGED: u8 = 0xFE;

pub const HEADER_LEN: usize = 6;
pub const CHECKSUM_LEN: usize = 1;
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Whether the device is asked to answer the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Acknowledged,
    Unacknowledged,
}

impl Delivery {
    pub fn sop2(self) -> u8 {
        match self {
            Self::Acknowledged => SOP2_ACKNOWLEDGED,
            Self::Unacknowledged => SOP2_UNACKNOWLEDGED,
        }
    }

    fn from_sop2(byte: u8) -> Option<Self> {
        match byte {
            SOP2_ACKNOWLEDGED => Some(Self::Acknowledged),
            SOP2_UNACKNOWLEDGED => Some(Self::Unacknowledged),
            _ => None,
        }
    }

    pub fn write_mode(self) -> WriteMode {
        match self {
            Self::Acknowledged => WriteMode::WithResponse,
            Self::Unacknowledged => WriteMode::WithoutResponse,
        }
    }
}

impl From<WriteMode> for Delivery {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::WithResponse => Self::Acknowledged,
            WriteMode::WithoutResponse => Self::Unacknowledged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub delivery: Delivery,
    pub device_id: u8,
    pub command_id: u8,
    pub sequence: u8,
    pub payload_len: u8,
}

/// One's-complement of the byte sum, truncated to 8 bits.
pub fn checksum(bytes: &[u8]) -> u8 {
    !bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Frames `payload` into a command packet.
pub fn encode(
    delivery: Delivery,
    device_id: u8,
    command_id: u8,
    sequence: u8,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CodecError::PayloadTooLarge(payload.len()));
    }

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len() + CHECKSUM_LEN);
    bytes.extend_from_slice(&[
        SOP1,
        delivery.sop2(),
        device_id,
        command_id,
        sequence,
        payload.len() as u8,
    ]);
    bytes.extend_from_slice(payload);
    bytes.push(checksum(&bytes[2..]));
    Ok(bytes)
}

/// Parses a single command packet.
pub fn decode(bytes: &[u8]) -> Result<(PacketHeader, Vec<u8>), CodecError> {
    if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN + CHECKSUM_LEN,
            actual: bytes.len(),
        });
    }

    if bytes[0] != SOP1 {
        return Err(CodecError::BadStartOfPacket(bytes[0]));
    }
    let delivery = Delivery::from_sop2(bytes[1]).ok_or(CodecError::BadStartOfPacket(bytes[1]))?;

    let payload_len = bytes[5];
    let total = HEADER_LEN + payload_len as usize + CHECKSUM_LEN;
    if bytes.len() < total {
        return Err(CodecError::Truncated {
            needed: total,
            actual: bytes.len(),
        });
    }
    if bytes.len() > total {
        // the trailing byte is the checksum; DLEN is covered by it
        let last = bytes.len() - 1;
        let expected = checksum(&bytes[2..last]);
        if expected != bytes[last] {
            return Err(CodecError::ChecksumMismatch {
                expected,
                found: bytes[last],
            });
        }
        return Err(CodecError::ChecksumMismatch {
            expected: checksum(&bytes[2..total - 1]),
            found: bytes[total - 1],
        });
    }

    let expected = checksum(&bytes[2..total - 1]);
    let found = bytes[total - 1];
    if expected != found {
        return Err(CodecError::ChecksumMismatch { expected, found });
    }

    let header = PacketHeader {
        delivery,
        device_id: bytes[2],
        command_id: bytes[3],
        sequence: bytes[4],
        payload_len,
    };
    Ok((header, bytes[HEADER_LEN..total - 1].to_vec()))
}

/// An encoded command, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    header: PacketHeader,
    bytes: Vec<u8>,
}

impl CommandPacket {
    pub fn build(
        command: &SpheroCommand,
        sequence: u8,
        delivery: Delivery,
    ) -> Result<Self, CodecError> {
        let payload = command.payload();
        let bytes = encode(
            delivery,
            command.device_id(),
            command.command_id(),
            sequence,
            &payload,
        )?;
        Ok(Self {
            header: PacketHeader {
                delivery,
                device_id: command.device_id(),
                command_id: command.command_id(),
                sequence,
                payload_len: payload.len() as u8,
            },
            bytes,
        })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..self.bytes.len() - CHECKSUM_LEN]
    }

    pub fn checksum(&self) -> u8 {
        self.bytes[self.bytes.len() - 1]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::commands::RollState;

    #[test]
    fn test_known_roll_packet() {
        // roll at speed 0x80, heading 90
        let bytes = encode(Delivery::Unacknowledged, 0x02, 0x30, 0x01, &[0x80, 0x00, 0x5A, 0x01])
            .unwrap();
        let sum: u32 = [0x02u32, 0x30, 0x01, 0x04, 0x80, 0x00, 0x5A, 0x01].iter().sum();
        assert_eq!(
            bytes,
            vec![0xFF, 0xFE, 0x02, 0x30, 0x01, 0x04, 0x80, 0x00, 0x5A, 0x01, !(sum as u8)]
        );
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let payloads: [&[u8]; 4] = [&[], &[0x00], &[0xFF; 17], &[0xAB; 255]];
        for (i, payload) in payloads.iter().enumerate() {
            let seq = (i as u8).wrapping_mul(77);
            let bytes = encode(Delivery::Acknowledged, 0x02, 0x20, seq, payload).unwrap();
            let (header, decoded) = decode(&bytes).unwrap();
            assert_eq!(header.delivery, Delivery::Acknowledged);
            assert_eq!(header.device_id, 0x02);
            assert_eq!(header.command_id, 0x20);
            assert_eq!(header.sequence, seq);
            assert_eq!(header.payload_len as usize, payload.len());
            assert_eq!(decoded, payload.to_vec());
        }
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; 256];
        assert_eq!(
            encode(Delivery::Acknowledged, 0, 1, 0, &payload),
            Err(CodecError::PayloadTooLarge(256))
        );
    }

    #[test]
    fn test_single_byte_corruption_detected() {
        let bytes = encode(Delivery::Acknowledged, 0x02, 0x20, 0x42, &[10, 20, 30, 0]).unwrap();
        let dlen_index = 5;

        for index in 2..bytes.len() {
            for flip in [0x01u8, 0x02, 0x04, 0x80, 0xFF] {
                let mut corrupted = bytes.clone();
                corrupted[index] ^= flip;
                let result = decode(&corrupted);
                let detected = if index == dlen_index && corrupted[index] > bytes[index] {
                    // a larger DLEN asks for bytes that are not there
                    matches!(result, Err(CodecError::Truncated { .. }))
                } else {
                    matches!(result, Err(CodecError::ChecksumMismatch { .. }))
                };
                assert!(
                    detected,
                    "byte {index} flipped with {flip:#04X} gave {result:?}"
                );
            }
        }
    }

    #[test]
    fn test_length_field_corruption_rejected() {
        let bytes = encode(Delivery::Acknowledged, 0x02, 0x20, 0x42, &[10, 20, 30, 0]).unwrap();

        let mut longer = bytes.clone();
        longer[5] += 1;
        assert!(matches!(decode(&longer), Err(CodecError::Truncated { .. })));

        for dlen in 0..4u8 {
            let mut shorter = bytes.clone();
            shorter[5] = dlen;
            assert!(matches!(
                decode(&shorter),
                Err(CodecError::ChecksumMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(Delivery::Acknowledged, 0x02, 0x20, 0x42, &[10, 20]).unwrap();
        bytes.push(0x55);
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_delivery_marker_is_not_checksummed() {
        // SOP2 sits outside the checksum; swapping the two valid markers
        // changes the delivery mode only
        let mut bytes = encode(Delivery::Acknowledged, 0x02, 0x20, 0x42, &[10, 20, 30, 0]).unwrap();
        bytes[1] = SOP2_UNACKNOWLEDGED;
        let (header, payload) = decode(&bytes).unwrap();
        assert_eq!(header.delivery, Delivery::Unacknowledged);
        assert_eq!(payload, vec![10, 20, 30, 0]);

        bytes[1] = 0xFD;
        assert_eq!(decode(&bytes), Err(CodecError::BadStartOfPacket(0xFD)));
    }

    #[test]
    fn test_start_of_packet_validated() {
        let mut bytes = encode(Delivery::Acknowledged, 0, 1, 0, &[]).unwrap();
        bytes[1] = 0x00;
        assert_eq!(decode(&bytes), Err(CodecError::BadStartOfPacket(0x00)));
        bytes[0] = 0x7F;
        assert_eq!(decode(&bytes), Err(CodecError::BadStartOfPacket(0x7F)));
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(
            decode(&[0xFF, 0xFF, 0x00]),
            Err(CodecError::Truncated {
                needed: 7,
                actual: 3
            })
        );

        let bytes = encode(Delivery::Acknowledged, 0x02, 0x20, 1, &[1, 2, 3, 4]).unwrap();
        assert!(matches!(
            decode(&bytes[..bytes.len() - 2]),
            Err(CodecError::Truncated { needed: 11, .. })
        ));
    }

    #[test]
    fn test_command_packet_from_roll() {
        let cmd = SpheroCommand::Roll {
            speed: 255,
            heading: 0,
            state: RollState::Go,
        };
        let packet = CommandPacket::build(&cmd, 9, Delivery::Unacknowledged).unwrap();
        assert_eq!(packet.payload(), &[255, 0, 0, 1]);
        assert_eq!(packet.header().sequence, 9);
        assert_eq!(packet.as_bytes()[1], SOP2_UNACKNOWLEDGED);

        let (header, payload) = decode(packet.as_bytes()).unwrap();
        assert_eq!(&header, packet.header());
        assert_eq!(payload, packet.payload());
        assert_eq!(packet.checksum(), checksum(&packet.as_bytes()[2..10]));
    }

    #[test]
    fn test_delivery_write_modes() {
        assert_eq!(Delivery::Acknowledged.write_mode(), WriteMode::WithResponse);
        assert_eq!(
            Delivery::from(WriteMode::WithoutResponse),
            Delivery::Unacknowledged
        );
    }
}
