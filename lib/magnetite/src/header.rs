use crate::crypto;
use crate::{WireError, WireResult};
use byteorder::{ByteOrder, LittleEndian};

/// Size of the authenticated header carried by every routed packet:
/// type, sequence, flow id, flow version, flow flags and the AEAD tag.
pub const HEADER_BYTES: usize = 1 + 8 + 8 + 1 + 1 + crypto::MAC_SIZE;

/// Size of the unauthenticated ping and pong packets:
/// type, flow id, ping sequence.
pub const PING_PONG_BYTES: usize = 1 + 8 + 8;

/// Size of the backup flow framing: type and flow id, payload follows.
pub const BACKUP_BYTES: usize = 1 + 8;

const DIRECTION_BIT: u64 = 1u64 << 63;

const ADDITIONAL_DATA_OFFSET: usize = 9;
const ADDITIONAL_DATA_BYTES: usize = 8 + 1 + 1;
const MAC_OFFSET: usize = ADDITIONAL_DATA_OFFSET + ADDITIONAL_DATA_BYTES;

/// Every data plane packet starts with one of these type bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum PacketType {
    Direct = 0,
    RouteRequest = 1,
    RouteResponse = 2,
    ClientToServer = 3,
    ServerToClient = 4,
    ClientRelayPing = 7,
    ClientRelayPong = 8,
    DirectServerPing = 9,
    DirectServerPong = 10,
    RelayServerPing = 11,
    RelayServerPong = 12,
    ContinueRequest = 13,
    ContinueResponse = 14,
    Migrate = 15,
    MigrateResponse = 16,
    Destroy = 17,
    Backup = 18,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<PacketType> {
        let packet_type = match value {
            0 => PacketType::Direct,
            1 => PacketType::RouteRequest,
            2 => PacketType::RouteResponse,
            3 => PacketType::ClientToServer,
            4 => PacketType::ServerToClient,
            7 => PacketType::ClientRelayPing,
            8 => PacketType::ClientRelayPong,
            9 => PacketType::DirectServerPing,
            10 => PacketType::DirectServerPong,
            11 => PacketType::RelayServerPing,
            12 => PacketType::RelayServerPong,
            13 => PacketType::ContinueRequest,
            14 => PacketType::ContinueResponse,
            15 => PacketType::Migrate,
            16 => PacketType::MigrateResponse,
            17 => PacketType::Destroy,
            18 => PacketType::Backup,
            _ => return None,
        };

        Some(packet_type)
    }

    /// True for types that begin with the 35 byte authenticated header.
    pub fn has_header(self) -> bool {
        match self {
            PacketType::RouteResponse
            | PacketType::ClientToServer
            | PacketType::ServerToClient
            | PacketType::RelayServerPing
            | PacketType::RelayServerPong
            | PacketType::ContinueResponse
            | PacketType::Migrate
            | PacketType::MigrateResponse
            | PacketType::Destroy => true,
            _ => false,
        }
    }

    /// Sequence high bit must be set on these types.
    fn is_server_to_client(self) -> bool {
        match self {
            PacketType::RouteResponse
            | PacketType::ServerToClient
            | PacketType::ContinueResponse
            | PacketType::MigrateResponse
            | PacketType::RelayServerPong => true,
            _ => false,
        }
    }

    /// Sequence high bit must be clear on these types.
    fn is_client_to_server(self) -> bool {
        match self {
            PacketType::ClientToServer
            | PacketType::Migrate
            | PacketType::Destroy
            | PacketType::RelayServerPing => true,
            _ => false,
        }
    }
}

impl From<PacketType> for u8 {
    #[inline]
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

/// The decoded authenticated header. The sequence carries the direction
/// bit only on the wire; it is applied on write and stripped on read so
/// that handlers never see the raw bit 63.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub packet_type: PacketType,
    pub sequence: u64,
    pub flow_id: u64,
    pub flow_version: u8,
    pub flow_flags: u8,
}

/// Writes the authenticated header into the first 35 bytes of the buffer.
/// The tag authenticates the flow id, version and flags under the supplied
/// key, with the direction-adjusted sequence as the nonce.
pub fn write_header(
    header: &Header,
    private_key: &[u8; crypto::KEY_SIZE],
    buffer: &mut [u8],
) -> WireResult<()> {
    if buffer.len() < HEADER_BYTES {
        return Err(WireError::TooSmall);
    }

    if !header.packet_type.has_header() {
        return Err(WireError::MissingHeader);
    }

    let mut sequence = header.sequence;
    if header.packet_type.is_server_to_client() {
        sequence |= DIRECTION_BIT;
    } else if header.packet_type.is_client_to_server() {
        sequence &= !DIRECTION_BIT;
    }

    buffer[0] = header.packet_type.into();
    LittleEndian::write_u64(&mut buffer[1..9], sequence);
    LittleEndian::write_u64(&mut buffer[9..17], header.flow_id);
    buffer[17] = header.flow_version;
    buffer[18] = header.flow_flags;

    let (additional, mac) = buffer[ADDITIONAL_DATA_OFFSET..HEADER_BYTES].split_at_mut(ADDITIONAL_DATA_BYTES);

    if !crypto::encrypt(mac, &[], additional, sequence, private_key) {
        return Err(WireError::Crypto);
    }

    Ok(())
}

/// Reads the header fields without verifying the tag. Used to locate the
/// session that owns the key before the authenticated read. Rejects any
/// packet whose direction bit does not match its type.
pub fn peek_header(buffer: &[u8]) -> WireResult<Header> {
    if buffer.len() < HEADER_BYTES {
        return Err(WireError::TooSmall);
    }

    let packet_type = PacketType::from_u8(buffer[0]).ok_or(WireError::UnknownType)?;

    if !packet_type.has_header() {
        return Err(WireError::MissingHeader);
    }

    let sequence = LittleEndian::read_u64(&buffer[1..9]);

    check_direction(packet_type, sequence)?;

    Ok(Header {
        packet_type,
        sequence: sequence & !DIRECTION_BIT,
        flow_id: LittleEndian::read_u64(&buffer[9..17]),
        flow_version: buffer[17],
        flow_flags: buffer[18],
    })
}

/// Verifies the header tag under the supplied key and returns the decoded
/// header. The direction bit is validated and stripped.
pub fn read_header(private_key: &[u8; crypto::KEY_SIZE], buffer: &[u8]) -> WireResult<Header> {
    if buffer.len() < HEADER_BYTES {
        return Err(WireError::TooSmall);
    }

    let packet_type = PacketType::from_u8(buffer[0]).ok_or(WireError::UnknownType)?;

    if !packet_type.has_header() {
        return Err(WireError::MissingHeader);
    }

    let sequence = LittleEndian::read_u64(&buffer[1..9]);

    let additional = &buffer[ADDITIONAL_DATA_OFFSET..MAC_OFFSET];
    let mac = &buffer[MAC_OFFSET..HEADER_BYTES];

    if !crypto::decrypt(&mut [], mac, additional, sequence, private_key) {
        return Err(WireError::Crypto);
    }

    check_direction(packet_type, sequence)?;

    Ok(Header {
        packet_type,
        sequence: sequence & !DIRECTION_BIT,
        flow_id: LittleEndian::read_u64(&buffer[9..17]),
        flow_version: buffer[17],
        flow_flags: buffer[18],
    })
}

#[inline]
fn check_direction(packet_type: PacketType, sequence: u64) -> WireResult<()> {
    if packet_type.is_server_to_client() && sequence & DIRECTION_BIT == 0 {
        return Err(WireError::DirectionBit);
    }

    if packet_type.is_client_to_server() && sequence & DIRECTION_BIT != 0 {
        return Err(WireError::DirectionBit);
    }

    Ok(())
}

/// Builds one of the unauthenticated ping/pong packets.
pub fn write_ping(packet_type: PacketType, flow_id: u64, sequence: u64) -> [u8; PING_PONG_BYTES] {
    let mut packet = [0u8; PING_PONG_BYTES];

    packet[0] = packet_type.into();
    LittleEndian::write_u64(&mut packet[1..9], flow_id);
    LittleEndian::write_u64(&mut packet[9..17], sequence);

    packet
}

/// Reads the flow id and sequence out of a ping/pong packet body. The
/// caller has already matched the type byte.
pub fn read_ping(buffer: &[u8]) -> WireResult<(u64, u64)> {
    if buffer.len() != PING_PONG_BYTES {
        return Err(WireError::TooSmall);
    }

    let flow_id = LittleEndian::read_u64(&buffer[1..9]);
    let sequence = LittleEndian::read_u64(&buffer[9..17]);

    Ok((flow_id, sequence))
}

/// Writes the body of an authenticated path ping: flow id and sequence,
/// zero padded to `PING_PONG_BYTES` on the wire.
pub fn write_ping_body(flow_id: u64, sequence: u64, buffer: &mut [u8]) -> WireResult<()> {
    if buffer.len() != PING_PONG_BYTES {
        return Err(WireError::TooSmall);
    }

    LittleEndian::write_u64(&mut buffer[0..8], flow_id);
    LittleEndian::write_u64(&mut buffer[8..16], sequence);
    buffer[16] = 0;

    Ok(())
}

/// Reads the body of an authenticated path ping.
pub fn read_ping_body(buffer: &[u8]) -> WireResult<(u64, u64)> {
    if buffer.len() != PING_PONG_BYTES {
        return Err(WireError::TooSmall);
    }

    let flow_id = LittleEndian::read_u64(&buffer[0..8]);
    let sequence = LittleEndian::read_u64(&buffer[8..16]);

    Ok((flow_id, sequence))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header(packet_type: PacketType) -> Header {
        Header {
            packet_type,
            sequence: 1000,
            flow_id: 0x1122334455667788,
            flow_version: 5,
            flow_flags: 1,
        }
    }

    #[test]
    fn test_write_read_roundtrip() {
        crypto::init();

        let key = crypto::random_key();

        for &packet_type in &[
            PacketType::RouteResponse,
            PacketType::ClientToServer,
            PacketType::ServerToClient,
            PacketType::RelayServerPing,
            PacketType::RelayServerPong,
            PacketType::ContinueResponse,
            PacketType::Migrate,
            PacketType::MigrateResponse,
            PacketType::Destroy,
        ] {
            let header = make_header(packet_type);

            let mut buffer = [0u8; HEADER_BYTES];
            write_header(&header, &key, &mut buffer).unwrap();

            assert_eq!(peek_header(&buffer).unwrap(), header);
            assert_eq!(read_header(&key, &buffer).unwrap(), header);
        }
    }

    #[test]
    fn test_read_err_key_mismatch() {
        crypto::init();

        let key = crypto::random_key();
        let header = make_header(PacketType::ClientToServer);

        let mut buffer = [0u8; HEADER_BYTES];
        write_header(&header, &key, &mut buffer).unwrap();

        let other_key = crypto::random_key();
        assert_eq!(read_header(&other_key, &buffer), Err(WireError::Crypto));
    }

    #[test]
    fn test_read_err_tampered_flow_id() {
        crypto::init();

        let key = crypto::random_key();
        let header = make_header(PacketType::ServerToClient);

        let mut buffer = [0u8; HEADER_BYTES];
        write_header(&header, &key, &mut buffer).unwrap();

        // Flow id is additional data; flipping a bit must break the tag.
        buffer[9] ^= 1;

        assert_eq!(read_header(&key, &buffer), Err(WireError::Crypto));
    }

    #[test]
    fn test_peek_err_direction_bit() {
        crypto::init();

        let key = crypto::random_key();
        let header = make_header(PacketType::ServerToClient);

        let mut buffer = [0u8; HEADER_BYTES];
        write_header(&header, &key, &mut buffer).unwrap();

        // Clear the direction bit. Server to client packets must carry it.
        buffer[8] &= 0x7F;

        assert_eq!(peek_header(&buffer), Err(WireError::DirectionBit));
    }

    #[test]
    fn test_peek_err_no_header_type() {
        let buffer = [0u8; HEADER_BYTES];
        assert_eq!(peek_header(&buffer), Err(WireError::MissingHeader));
    }

    #[test]
    fn test_peek_err_unknown_type() {
        let mut buffer = [0u8; HEADER_BYTES];
        buffer[0] = 200;
        assert_eq!(peek_header(&buffer), Err(WireError::UnknownType));
    }

    #[test]
    fn test_peek_err_too_small() {
        let buffer = [0u8; HEADER_BYTES - 1];
        assert_eq!(peek_header(&buffer), Err(WireError::TooSmall));
    }

    #[test]
    fn test_direction_bit_stripped() {
        crypto::init();

        let key = crypto::random_key();
        let mut header = make_header(PacketType::ServerToClient);
        header.sequence = 77;

        let mut buffer = [0u8; HEADER_BYTES];
        write_header(&header, &key, &mut buffer).unwrap();

        // On the wire the high bit is set.
        assert_ne!(buffer[8] & 0x80, 0);

        // Decoded sequence has the bit stripped.
        assert_eq!(read_header(&key, &buffer).unwrap().sequence, 77);
    }

    #[test]
    fn test_ping_roundtrip() {
        let packet = write_ping(PacketType::DirectServerPing, 42, 117);

        assert_eq!(packet[0], u8::from(PacketType::DirectServerPing));
        assert_eq!(read_ping(&packet).unwrap(), (42, 117));
    }

    #[test]
    fn test_ping_err_bad_length() {
        let packet = [0u8; PING_PONG_BYTES - 1];
        assert_eq!(read_ping(&packet), Err(WireError::TooSmall));
    }

    #[test]
    fn test_ping_body_roundtrip() {
        let mut body = [0xFFu8; PING_PONG_BYTES];
        write_ping_body(9, 55, &mut body).unwrap();

        assert_eq!(read_ping_body(&body).unwrap(), (9, 55));
        assert_eq!(body[16], 0);
    }
}
