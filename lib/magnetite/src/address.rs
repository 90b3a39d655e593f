use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

/// Size of the fixed address record on the wire: 1 tag byte plus the
/// payload zero-padded to 18 bytes.
pub const ADDRESS_BYTES: usize = 19;

const ADDRESS_NONE: u8 = 0;
const ADDRESS_IPV4: u8 = 1;
const ADDRESS_IPV6: u8 = 2;

/// A network address as carried inside tokens and route blobs. Serialized
/// as a fixed 19 byte record so that every structure containing an address
/// has a fixed wire size.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    None,
    Ipv4 { ip: [u8; 4], port: u16 },
    Ipv6 { ip: [u16; 8], port: u16 },
}

impl Address {
    #[inline]
    pub fn is_none(&self) -> bool {
        *self == Address::None
    }

    /// Write the fixed 19 byte record to the supplied stream.
    pub fn write<W: Write>(&self, mut stream: W) -> io::Result<()> {
        match *self {
            Address::Ipv4 { ip, port } => {
                stream.write_u8(ADDRESS_IPV4)?;
                stream.write_all(&ip)?;
                stream.write_u16::<LittleEndian>(port)?;
                stream.write_all(&[0u8; 12])
            }
            Address::Ipv6 { ip, port } => {
                stream.write_u8(ADDRESS_IPV6)?;
                for group in &ip {
                    stream.write_u16::<LittleEndian>(*group)?;
                }
                stream.write_u16::<LittleEndian>(port)
            }
            Address::None => stream.write_all(&[0u8; ADDRESS_BYTES]),
        }
    }

    /// Parse the fixed 19 byte record from the supplied stream. An unknown
    /// tag byte reads as `Address::None`, matching the zero record.
    pub fn read<R: Read>(mut stream: R) -> io::Result<Address> {
        let tag = stream.read_u8()?;

        match tag {
            ADDRESS_IPV4 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip)?;
                let port = stream.read_u16::<LittleEndian>()?;
                let mut pad = [0u8; 12];
                stream.read_exact(&mut pad)?;
                Ok(Address::Ipv4 { ip, port })
            }
            ADDRESS_IPV6 => {
                let mut ip = [0u16; 8];
                for group in ip.iter_mut() {
                    *group = stream.read_u16::<LittleEndian>()?;
                }
                let port = stream.read_u16::<LittleEndian>()?;
                Ok(Address::Ipv6 { ip, port })
            }
            _ => {
                let mut pad = [0u8; ADDRESS_BYTES - 1];
                stream.read_exact(&mut pad)?;
                Ok(Address::None)
            }
        }
    }

    /// Converts to a socket address usable with `std::net`. `None` has no
    /// socket form.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match *self {
            Address::Ipv4 { ip, port } => Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
                port,
            ))),
            Address::Ipv6 { ip, port } => Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::new(ip[0], ip[1], ip[2], ip[3], ip[4], ip[5], ip[6], ip[7]),
                port,
                0,
                0,
            ))),
            Address::None => None,
        }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Address {
        match addr {
            SocketAddr::V4(v4) => Address::Ipv4 {
                ip: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Address::Ipv6 {
                ip: v6.ip().segments(),
                port: v6.port(),
            },
        }
    }

    /// Encodes an IPv4 address and port as a 64 bit flow id with the high
    /// bit set. Returns 0 for anything that is not IPv4.
    pub fn to_direct_flow_id(&self) -> u64 {
        match *self {
            Address::Ipv4 { ip, port } => {
                let mut flow_id = 0u64;

                flow_id |= u64::from(ip[0]);
                flow_id <<= 8;
                flow_id |= u64::from(ip[1]);
                flow_id <<= 8;
                flow_id |= u64::from(ip[2]);
                flow_id <<= 8;
                flow_id |= u64::from(ip[3]);
                flow_id <<= 8;
                flow_id |= u64::from(port >> 8);
                flow_id <<= 8;
                flow_id |= u64::from(port & 0xFF);

                flow_id | (1u64 << 63)
            }
            _ => 0,
        }
    }

    /// Decodes a direct-peer flow id back into an IPv4 address. Flow ids
    /// without the high bit set decode as `Address::None`.
    pub fn from_direct_flow_id(flow_id: u64) -> Address {
        if flow_id & (1u64 << 63) == 0 {
            return Address::None;
        }

        let ip = [
            (flow_id >> 40) as u8,
            (flow_id >> 32) as u8,
            (flow_id >> 24) as u8,
            (flow_id >> 16) as u8,
        ];
        let port = (flow_id & 0xFFFF) as u16;

        Address::Ipv4 { ip, port }
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(value: &str) -> Result<Address, Self::Err> {
        SocketAddr::from_str(value).map(Address::from_socket_addr)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to_socket_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "NONE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(address: Address) -> Address {
        let mut buffer = Vec::new();
        address.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), ADDRESS_BYTES);
        Address::read(&buffer[..]).unwrap()
    }

    #[test]
    fn test_roundtrip_ipv4() {
        let address = Address::Ipv4 {
            ip: [127, 0, 0, 1],
            port: 40000,
        };
        assert_eq!(roundtrip(address), address);
    }

    #[test]
    fn test_roundtrip_ipv6() {
        let address = Address::Ipv6 {
            ip: [0xfe80, 0, 0, 0, 0x0202, 0xb3ff, 0xfe1e, 0x8329],
            port: 50000,
        };
        assert_eq!(roundtrip(address), address);
    }

    #[test]
    fn test_roundtrip_none() {
        assert_eq!(roundtrip(Address::None), Address::None);
    }

    #[test]
    fn test_parse_and_display() {
        let address: Address = "10.2.3.4:5000".parse().unwrap();
        assert_eq!(
            address,
            Address::Ipv4 {
                ip: [10, 2, 3, 4],
                port: 5000
            }
        );
        assert_eq!(address.to_string(), "10.2.3.4:5000");
    }

    #[test]
    fn test_parse_err() {
        assert!("not an address".parse::<Address>().is_err());
        assert!("10.2.3.4".parse::<Address>().is_err());
    }

    #[test]
    fn test_direct_flow_id_roundtrip() {
        let address = Address::Ipv4 {
            ip: [192, 168, 1, 15],
            port: 27015,
        };

        let flow_id = address.to_direct_flow_id();
        assert_ne!(flow_id, 0);
        assert_ne!(flow_id & (1u64 << 63), 0);
        assert_eq!(Address::from_direct_flow_id(flow_id), address);
    }

    #[test]
    fn test_direct_flow_id_requires_high_bit() {
        assert_eq!(Address::from_direct_flow_id(12345), Address::None);
    }

    #[test]
    fn test_direct_flow_id_not_ipv4() {
        assert_eq!(Address::None.to_direct_flow_id(), 0);
    }
}
