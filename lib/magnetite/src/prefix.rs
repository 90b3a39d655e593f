use crate::address::{Address, ADDRESS_BYTES};
use crate::{WireError, WireResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

/// Fixed part of the prefix: 1 type byte and the u32 total length.
pub const ROUTE_PREFIX_BYTES: usize = 1 + 4;

/// Upper bound on the total prefix length on the wire.
pub const ROUTE_PREFIX_MAX_BYTES: usize = 1024;

const PREFIX_TYPE_NULL: u8 = 0;
const PREFIX_TYPE_SERVER_ADDRESS: u8 = 1;
const PREFIX_TYPE_DIRECT: u8 = 2;
const PREFIX_TYPE_FORCED_ROUTE: u8 = 3;

const MAX_ADDRESS_STRING_LENGTH: usize = 256;

/// Variable length prefix at the head of every route install blob. Drives
/// whether the client builds a relay path or falls directly to the server.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RoutePrefix {
    Null,
    ServerAddress(Address),
    Direct(String),
    ForcedRoute,
}

impl RoutePrefix {
    /// Reads the prefix at the head of the buffer and advances past it.
    /// The prefix must be the first thing parsed out of a route blob.
    pub fn read(buffer: &mut &[u8]) -> WireResult<RoutePrefix> {
        let mut stream = *buffer;

        if stream.len() < ROUTE_PREFIX_BYTES {
            return Err(WireError::TooSmall);
        }

        let prefix_type = stream.read_u8().map_err(|_| WireError::TooSmall)?;
        let prefix_length = stream.read_u32::<LittleEndian>().map_err(|_| WireError::TooSmall)? as usize;

        if prefix_length > ROUTE_PREFIX_MAX_BYTES || buffer.len() < prefix_length {
            return Err(WireError::BadPrefix);
        }

        let prefix = match prefix_type {
            PREFIX_TYPE_NULL => {
                if prefix_length != ROUTE_PREFIX_BYTES {
                    return Err(WireError::BadPrefix);
                }
                RoutePrefix::Null
            }
            PREFIX_TYPE_SERVER_ADDRESS => {
                if prefix_length != ROUTE_PREFIX_BYTES + ADDRESS_BYTES {
                    return Err(WireError::BadPrefix);
                }
                let address = Address::read(&mut stream).map_err(|_| WireError::BadAddress)?;
                RoutePrefix::ServerAddress(address)
            }
            PREFIX_TYPE_DIRECT => {
                if prefix_length > ROUTE_PREFIX_BYTES + MAX_ADDRESS_STRING_LENGTH
                    || prefix_length < ROUTE_PREFIX_BYTES
                {
                    return Err(WireError::BadPrefix);
                }
                let value = &stream[..prefix_length - ROUTE_PREFIX_BYTES];
                let string = std::str::from_utf8(value).map_err(|_| WireError::BadPrefix)?;
                RoutePrefix::Direct(string.to_owned())
            }
            PREFIX_TYPE_FORCED_ROUTE => {
                if prefix_length != ROUTE_PREFIX_BYTES {
                    return Err(WireError::BadPrefix);
                }
                RoutePrefix::ForcedRoute
            }
            _ => return Err(WireError::BadPrefix),
        };

        *buffer = &buffer[prefix_length..];

        Ok(prefix)
    }

    /// Writes the prefix in its wire form.
    pub fn write(&self, buffer: &mut Vec<u8>) -> WireResult<()> {
        match self {
            RoutePrefix::Null => {
                buffer.write_u8(PREFIX_TYPE_NULL).unwrap();
                buffer
                    .write_u32::<LittleEndian>(ROUTE_PREFIX_BYTES as u32)
                    .unwrap();
            }
            RoutePrefix::ServerAddress(address) => {
                buffer.write_u8(PREFIX_TYPE_SERVER_ADDRESS).unwrap();
                buffer
                    .write_u32::<LittleEndian>((ROUTE_PREFIX_BYTES + ADDRESS_BYTES) as u32)
                    .unwrap();
                address.write(&mut *buffer).map_err(|_| WireError::BadAddress)?;
            }
            RoutePrefix::Direct(string) => {
                if string.len() > MAX_ADDRESS_STRING_LENGTH {
                    return Err(WireError::TooLarge);
                }
                buffer.write_u8(PREFIX_TYPE_DIRECT).unwrap();
                buffer
                    .write_u32::<LittleEndian>((ROUTE_PREFIX_BYTES + string.len()) as u32)
                    .unwrap();
                buffer.write_all(string.as_bytes()).unwrap();
            }
            RoutePrefix::ForcedRoute => {
                buffer.write_u8(PREFIX_TYPE_FORCED_ROUTE).unwrap();
                buffer
                    .write_u32::<LittleEndian>(ROUTE_PREFIX_BYTES as u32)
                    .unwrap();
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(prefix: RoutePrefix) {
        let mut buffer = Vec::new();
        prefix.write(&mut buffer).unwrap();

        // Trailing bytes after the prefix must be left alone.
        buffer.extend_from_slice(&[0xAB, 0xCD]);

        let mut cursor = &buffer[..];
        assert_eq!(RoutePrefix::read(&mut cursor).unwrap(), prefix);
        assert_eq!(cursor, &[0xAB, 0xCD]);
    }

    #[test]
    fn test_roundtrip_null() {
        roundtrip(RoutePrefix::Null);
    }

    #[test]
    fn test_roundtrip_server_address() {
        roundtrip(RoutePrefix::ServerAddress(Address::Ipv4 {
            ip: [127, 0, 0, 1],
            port: 5000,
        }));
    }

    #[test]
    fn test_roundtrip_direct() {
        roundtrip(RoutePrefix::Direct("127.0.0.1:5000".to_owned()));
    }

    #[test]
    fn test_roundtrip_forced_route() {
        roundtrip(RoutePrefix::ForcedRoute);
    }

    #[test]
    fn test_read_err_unknown_type() {
        let mut buffer = Vec::new();
        buffer.write_u8(200).unwrap();
        buffer.write_u32::<LittleEndian>(5).unwrap();

        let mut cursor = &buffer[..];
        assert_eq!(RoutePrefix::read(&mut cursor), Err(WireError::BadPrefix));
    }

    #[test]
    fn test_read_err_bad_length() {
        let mut buffer = Vec::new();
        buffer.write_u8(PREFIX_TYPE_NULL).unwrap();
        buffer.write_u32::<LittleEndian>(100).unwrap();
        buffer.extend_from_slice(&[0u8; 95]);

        let mut cursor = &buffer[..];
        assert_eq!(RoutePrefix::read(&mut cursor), Err(WireError::BadPrefix));
    }

    #[test]
    fn test_read_err_truncated() {
        let buffer = [PREFIX_TYPE_NULL, 5, 0];
        let mut cursor = &buffer[..];
        assert_eq!(RoutePrefix::read(&mut cursor), Err(WireError::TooSmall));
    }

    #[test]
    fn test_read_err_oversized() {
        let mut buffer = Vec::new();
        buffer.write_u8(PREFIX_TYPE_DIRECT).unwrap();
        buffer.write_u32::<LittleEndian>(2000).unwrap();
        buffer.extend_from_slice(&[b'a'; 2000]);

        let mut cursor = &buffer[..];
        assert_eq!(RoutePrefix::read(&mut cursor), Err(WireError::BadPrefix));
    }
}
