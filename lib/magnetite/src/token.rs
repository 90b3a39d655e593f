use crate::address::{Address, ADDRESS_BYTES};
use crate::crypto;
use crate::{WireError, WireResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

pub const FLOW_TOKEN_BYTES: usize = 8 + 8 + 1 + 1 + 4 + 4 + ADDRESS_BYTES + crypto::KEY_SIZE;
pub const SEALED_FLOW_TOKEN_BYTES: usize =
    crypto::BOX_NONCE_SIZE + FLOW_TOKEN_BYTES + crypto::BOX_MAC_SIZE;

pub const CONTINUE_TOKEN_BYTES: usize = 8 + 8 + 1 + 1;
pub const SEALED_CONTINUE_TOKEN_BYTES: usize =
    crypto::BOX_NONCE_SIZE + CONTINUE_TOKEN_BYTES + crypto::BOX_MAC_SIZE;

pub const SERVER_TOKEN_BYTES: usize = 8 + 8 + 1 + 1;
pub const SEALED_SERVER_TOKEN_BYTES: usize =
    crypto::BOX_NONCE_SIZE + SERVER_TOKEN_BYTES + crypto::BOX_MAC_SIZE;

/// Describes one hop of a route from the holder's perspective: the address
/// of the next node and the symmetric key authenticating the packet header
/// on that hop. Sealed per recipient by the route controller.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlowToken {
    pub expire_timestamp: u64,
    pub flow_id: u64,
    pub flow_version: u8,
    pub flow_flags: u8,
    pub kbps_up: u32,
    pub kbps_down: u32,
    pub next_address: Address,
    pub private_key: [u8; crypto::KEY_SIZE],
}

impl FlowToken {
    /// An empty token. Flow id 0 never names a real flow.
    pub fn zero() -> FlowToken {
        FlowToken {
            expire_timestamp: 0,
            flow_id: 0,
            flow_version: 0,
            flow_flags: 0,
            kbps_up: 0,
            kbps_down: 0,
            next_address: Address::None,
            private_key: [0u8; crypto::KEY_SIZE],
        }
    }

    /// Write the plain token record to the supplied stream.
    pub fn write<W: Write>(&self, mut stream: W) -> WireResult<()> {
        self.write_io(&mut stream).map_err(|_| WireError::TooSmall)
    }

    fn write_io<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u64::<LittleEndian>(self.expire_timestamp)?;
        stream.write_u64::<LittleEndian>(self.flow_id)?;
        stream.write_u8(self.flow_version)?;
        stream.write_u8(self.flow_flags)?;
        stream.write_u32::<LittleEndian>(self.kbps_up)?;
        stream.write_u32::<LittleEndian>(self.kbps_down)?;
        self.next_address.write(&mut *stream)?;
        stream.write_all(&self.private_key)
    }

    /// Parse the plain token record from the supplied stream.
    pub fn read<R: Read>(mut stream: R) -> WireResult<FlowToken> {
        let expire_timestamp = stream.read_u64::<LittleEndian>().map_err(|_| WireError::TooSmall)?;
        let flow_id = stream.read_u64::<LittleEndian>().map_err(|_| WireError::TooSmall)?;
        let flow_version = stream.read_u8().map_err(|_| WireError::TooSmall)?;
        let flow_flags = stream.read_u8().map_err(|_| WireError::TooSmall)?;
        let kbps_up = stream.read_u32::<LittleEndian>().map_err(|_| WireError::TooSmall)?;
        let kbps_down = stream.read_u32::<LittleEndian>().map_err(|_| WireError::TooSmall)?;
        let next_address = Address::read(&mut stream).map_err(|_| WireError::TooSmall)?;

        let mut private_key = [0u8; crypto::KEY_SIZE];
        stream.read_exact(&mut private_key).map_err(|_| WireError::TooSmall)?;

        Ok(FlowToken {
            expire_timestamp,
            flow_id,
            flow_version,
            flow_flags,
            kbps_up,
            kbps_down,
            next_address,
            private_key,
        })
    }

    /// Seals the token to a recipient: random nonce, plain record,
    /// authenticated box. Appends exactly `SEALED_FLOW_TOKEN_BYTES` to the
    /// buffer.
    pub fn write_sealed(
        &self,
        sender_private_key: &[u8; crypto::BOX_SECRET_KEY_SIZE],
        recipient_public_key: &[u8; crypto::BOX_PUBLIC_KEY_SIZE],
        buffer: &mut Vec<u8>,
    ) -> WireResult<()> {
        let mut nonce = [0u8; crypto::BOX_NONCE_SIZE];
        crypto::random_bytes(&mut nonce);

        let mut plain = [0u8; FLOW_TOKEN_BYTES];
        self.write(Cursor::new(&mut plain[..]))?;

        let mut cipher = [0u8; FLOW_TOKEN_BYTES + crypto::BOX_MAC_SIZE];
        if !crypto::box_seal(&mut cipher, &plain, &nonce, recipient_public_key, sender_private_key) {
            return Err(WireError::Crypto);
        }

        buffer.extend_from_slice(&nonce);
        buffer.extend_from_slice(&cipher);

        Ok(())
    }

    /// Opens the sealed token at the head of the buffer and advances the
    /// buffer past it, so that a chain of tokens can be peeled hop by hop.
    pub fn read_sealed(
        buffer: &mut &[u8],
        sender_public_key: &[u8; crypto::BOX_PUBLIC_KEY_SIZE],
        recipient_private_key: &[u8; crypto::BOX_SECRET_KEY_SIZE],
    ) -> WireResult<FlowToken> {
        if buffer.len() < SEALED_FLOW_TOKEN_BYTES {
            return Err(WireError::TooSmall);
        }

        let mut nonce = [0u8; crypto::BOX_NONCE_SIZE];
        nonce.copy_from_slice(&buffer[..crypto::BOX_NONCE_SIZE]);

        let cipher = &buffer[crypto::BOX_NONCE_SIZE..SEALED_FLOW_TOKEN_BYTES];

        let mut plain = [0u8; FLOW_TOKEN_BYTES];
        if !crypto::box_open(&mut plain, cipher, &nonce, sender_public_key, recipient_private_key) {
            return Err(WireError::Crypto);
        }

        let token = FlowToken::read(&plain[..])?;

        *buffer = &buffer[SEALED_FLOW_TOKEN_BYTES..];

        Ok(token)
    }
}

/// Extends an existing route without rotating keys. Carries no key and no
/// address; it merely proves the controller authorized another slice.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ContinueToken {
    pub expire_timestamp: u64,
    pub flow_id: u64,
    pub flow_version: u8,
    pub flow_flags: u8,
}

impl ContinueToken {
    pub fn write<W: Write>(&self, mut stream: W) -> WireResult<()> {
        self.write_io(&mut stream).map_err(|_| WireError::TooSmall)
    }

    fn write_io<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u64::<LittleEndian>(self.expire_timestamp)?;
        stream.write_u64::<LittleEndian>(self.flow_id)?;
        stream.write_u8(self.flow_version)?;
        stream.write_u8(self.flow_flags)
    }

    pub fn read<R: Read>(mut stream: R) -> WireResult<ContinueToken> {
        let expire_timestamp = stream.read_u64::<LittleEndian>().map_err(|_| WireError::TooSmall)?;
        let flow_id = stream.read_u64::<LittleEndian>().map_err(|_| WireError::TooSmall)?;
        let flow_version = stream.read_u8().map_err(|_| WireError::TooSmall)?;
        let flow_flags = stream.read_u8().map_err(|_| WireError::TooSmall)?;

        Ok(ContinueToken {
            expire_timestamp,
            flow_id,
            flow_version,
            flow_flags,
        })
    }

    pub fn write_sealed(
        &self,
        sender_private_key: &[u8; crypto::BOX_SECRET_KEY_SIZE],
        recipient_public_key: &[u8; crypto::BOX_PUBLIC_KEY_SIZE],
        buffer: &mut Vec<u8>,
    ) -> WireResult<()> {
        let mut nonce = [0u8; crypto::BOX_NONCE_SIZE];
        crypto::random_bytes(&mut nonce);

        let mut plain = [0u8; CONTINUE_TOKEN_BYTES];
        self.write(Cursor::new(&mut plain[..]))?;

        let mut cipher = [0u8; CONTINUE_TOKEN_BYTES + crypto::BOX_MAC_SIZE];
        if !crypto::box_seal(&mut cipher, &plain, &nonce, recipient_public_key, sender_private_key) {
            return Err(WireError::Crypto);
        }

        buffer.extend_from_slice(&nonce);
        buffer.extend_from_slice(&cipher);

        Ok(())
    }

    pub fn read_sealed(
        buffer: &mut &[u8],
        sender_public_key: &[u8; crypto::BOX_PUBLIC_KEY_SIZE],
        recipient_private_key: &[u8; crypto::BOX_SECRET_KEY_SIZE],
    ) -> WireResult<ContinueToken> {
        if buffer.len() < SEALED_CONTINUE_TOKEN_BYTES {
            return Err(WireError::TooSmall);
        }

        let mut nonce = [0u8; crypto::BOX_NONCE_SIZE];
        nonce.copy_from_slice(&buffer[..crypto::BOX_NONCE_SIZE]);

        let cipher = &buffer[crypto::BOX_NONCE_SIZE..SEALED_CONTINUE_TOKEN_BYTES];

        let mut plain = [0u8; CONTINUE_TOKEN_BYTES];
        if !crypto::box_open(&mut plain, cipher, &nonce, sender_public_key, recipient_private_key) {
            return Err(WireError::Crypto);
        }

        let token = ContinueToken::read(&plain[..])?;

        *buffer = &buffer[SEALED_CONTINUE_TOKEN_BYTES..];

        Ok(token)
    }
}

/// Acknowledges a server side route install. The server seals one of these
/// back to the controller; the client carries it verbatim in the next route
/// update request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ServerToken {
    pub expire_timestamp: u64,
    pub flow_id: u64,
    pub flow_version: u8,
    pub flow_flags: u8,
}

impl ServerToken {
    pub fn write<W: Write>(&self, mut stream: W) -> WireResult<()> {
        self.write_io(&mut stream).map_err(|_| WireError::TooSmall)
    }

    fn write_io<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u64::<LittleEndian>(self.expire_timestamp)?;
        stream.write_u64::<LittleEndian>(self.flow_id)?;
        stream.write_u8(self.flow_version)?;
        stream.write_u8(self.flow_flags)
    }

    pub fn read<R: Read>(mut stream: R) -> WireResult<ServerToken> {
        let expire_timestamp = stream.read_u64::<LittleEndian>().map_err(|_| WireError::TooSmall)?;
        let flow_id = stream.read_u64::<LittleEndian>().map_err(|_| WireError::TooSmall)?;
        let flow_version = stream.read_u8().map_err(|_| WireError::TooSmall)?;
        let flow_flags = stream.read_u8().map_err(|_| WireError::TooSmall)?;

        Ok(ServerToken {
            expire_timestamp,
            flow_id,
            flow_version,
            flow_flags,
        })
    }

    pub fn write_sealed(
        &self,
        sender_private_key: &[u8; crypto::BOX_SECRET_KEY_SIZE],
        recipient_public_key: &[u8; crypto::BOX_PUBLIC_KEY_SIZE],
        buffer: &mut Vec<u8>,
    ) -> WireResult<()> {
        let mut nonce = [0u8; crypto::BOX_NONCE_SIZE];
        crypto::random_bytes(&mut nonce);

        let mut plain = [0u8; SERVER_TOKEN_BYTES];
        self.write(Cursor::new(&mut plain[..]))?;

        let mut cipher = [0u8; SERVER_TOKEN_BYTES + crypto::BOX_MAC_SIZE];
        if !crypto::box_seal(&mut cipher, &plain, &nonce, recipient_public_key, sender_private_key) {
            return Err(WireError::Crypto);
        }

        buffer.extend_from_slice(&nonce);
        buffer.extend_from_slice(&cipher);

        Ok(())
    }

    pub fn read_sealed(
        buffer: &mut &[u8],
        sender_public_key: &[u8; crypto::BOX_PUBLIC_KEY_SIZE],
        recipient_private_key: &[u8; crypto::BOX_SECRET_KEY_SIZE],
    ) -> WireResult<ServerToken> {
        if buffer.len() < SEALED_SERVER_TOKEN_BYTES {
            return Err(WireError::TooSmall);
        }

        let mut nonce = [0u8; crypto::BOX_NONCE_SIZE];
        nonce.copy_from_slice(&buffer[..crypto::BOX_NONCE_SIZE]);

        let cipher = &buffer[crypto::BOX_NONCE_SIZE..SEALED_SERVER_TOKEN_BYTES];

        let mut plain = [0u8; SERVER_TOKEN_BYTES];
        if !crypto::box_open(&mut plain, cipher, &nonce, sender_public_key, recipient_private_key) {
            return Err(WireError::Crypto);
        }

        let token = ServerToken::read(&plain[..])?;

        *buffer = &buffer[SEALED_SERVER_TOKEN_BYTES..];

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_flow_token() -> FlowToken {
        FlowToken {
            expire_timestamp: 1_600_000_000,
            flow_id: 0xdeadbeefcafe,
            flow_version: 3,
            flow_flags: 1,
            kbps_up: 512,
            kbps_down: 1024,
            next_address: Address::Ipv4 {
                ip: [10, 0, 0, 2],
                port: 40000,
            },
            private_key: [42u8; crypto::KEY_SIZE],
        }
    }

    #[test]
    fn test_flow_token_plain_roundtrip() {
        let token = make_flow_token();

        let mut buffer = Vec::new();
        token.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), FLOW_TOKEN_BYTES);

        assert_eq!(FlowToken::read(&buffer[..]).unwrap(), token);
    }

    #[test]
    fn test_flow_token_sealed_roundtrip() {
        crypto::init();

        let (sender_public, sender_private) = crypto::generate_keypair();
        let (recipient_public, recipient_private) = crypto::generate_keypair();

        let token = make_flow_token();

        let mut buffer = Vec::new();
        token
            .write_sealed(&sender_private, &recipient_public, &mut buffer)
            .unwrap();
        assert_eq!(buffer.len(), SEALED_FLOW_TOKEN_BYTES);

        let mut cursor = &buffer[..];
        let opened = FlowToken::read_sealed(&mut cursor, &sender_public, &recipient_private).unwrap();

        assert_eq!(opened, token);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_flow_token_sealed_err_wrong_keypair() {
        crypto::init();

        let (_, sender_private) = crypto::generate_keypair();
        let (recipient_public, _) = crypto::generate_keypair();
        let (other_public, other_private) = crypto::generate_keypair();

        let token = make_flow_token();

        let mut buffer = Vec::new();
        token
            .write_sealed(&sender_private, &recipient_public, &mut buffer)
            .unwrap();

        let mut cursor = &buffer[..];
        assert_eq!(
            FlowToken::read_sealed(&mut cursor, &other_public, &other_private),
            Err(WireError::Crypto)
        );
    }

    #[test]
    fn test_flow_token_chain_peeling() {
        crypto::init();

        let (sender_public, sender_private) = crypto::generate_keypair();
        let (first_public, first_private) = crypto::generate_keypair();
        let (second_public, second_private) = crypto::generate_keypair();

        let mut first = make_flow_token();
        first.flow_version = 1;

        let mut second = make_flow_token();
        second.flow_version = 2;

        let mut buffer = Vec::new();
        first.write_sealed(&sender_private, &first_public, &mut buffer).unwrap();
        second.write_sealed(&sender_private, &second_public, &mut buffer).unwrap();

        let mut cursor = &buffer[..];
        let opened = FlowToken::read_sealed(&mut cursor, &sender_public, &first_private).unwrap();
        assert_eq!(opened.flow_version, 1);
        assert_eq!(cursor.len(), SEALED_FLOW_TOKEN_BYTES);

        let opened = FlowToken::read_sealed(&mut cursor, &sender_public, &second_private).unwrap();
        assert_eq!(opened.flow_version, 2);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_continue_token_sealed_roundtrip() {
        crypto::init();

        let (sender_public, sender_private) = crypto::generate_keypair();
        let (recipient_public, recipient_private) = crypto::generate_keypair();

        let token = ContinueToken {
            expire_timestamp: 1_600_000_100,
            flow_id: 7,
            flow_version: 2,
            flow_flags: 0,
        };

        let mut buffer = Vec::new();
        token
            .write_sealed(&sender_private, &recipient_public, &mut buffer)
            .unwrap();
        assert_eq!(buffer.len(), SEALED_CONTINUE_TOKEN_BYTES);

        let mut cursor = &buffer[..];
        let opened =
            ContinueToken::read_sealed(&mut cursor, &sender_public, &recipient_private).unwrap();
        assert_eq!(opened, token);
    }

    #[test]
    fn test_server_token_sealed_roundtrip() {
        crypto::init();

        let (sender_public, sender_private) = crypto::generate_keypair();
        let (recipient_public, recipient_private) = crypto::generate_keypair();

        let token = ServerToken {
            expire_timestamp: 1_600_000_200,
            flow_id: 9,
            flow_version: 4,
            flow_flags: 1,
        };

        let mut buffer = Vec::new();
        token
            .write_sealed(&sender_private, &recipient_public, &mut buffer)
            .unwrap();
        assert_eq!(buffer.len(), SEALED_SERVER_TOKEN_BYTES);

        let mut cursor = &buffer[..];
        let opened = ServerToken::read_sealed(&mut cursor, &sender_public, &recipient_private).unwrap();
        assert_eq!(opened, token);
    }

    #[test]
    fn test_sealed_err_too_small() {
        let (public_key, private_key) = ([0u8; 32], [0u8; 32]);
        let mut cursor = &[0u8; SEALED_SERVER_TOKEN_BYTES - 1][..];

        assert_eq!(
            ServerToken::read_sealed(&mut cursor, &public_key, &private_key),
            Err(WireError::TooSmall)
        );
    }
}
