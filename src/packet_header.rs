use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Which side of a connection a packet belongs to.
///
/// The numeric values are wire-visible: everything below
/// [`PacketType::RESPONSE_THRESHOLD`] was sent by a client and routes to the
/// receiving terminal's *server*-side registry, everything at or above it
/// routes to the *client*-side registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum PacketType {
    /// Encrypted packet, client to server.
    Protected = 4,
    /// Encrypted packet, server to client.
    ProtectedResponse = 12,
}

impl PacketType {
    pub const RESPONSE_THRESHOLD: u16 = 8;

    /// True if a packet of this type is looked up in the server-side registry.
    pub fn routes_to_server(&self) -> bool {
        u16::from(*self) < Self::RESPONSE_THRESHOLD
    }
}

/// The fixed 16-byte header present on every packet, transmitted unencrypted.
/// All integers little-endian.
///
/// ```ascii
///  0: salt (u32)          - random per packet; doubles as the IV variation
///                           for the encrypted frame that follows
///  4: engagement (u16)    - routing / versioning tag, 0 for this version
///  6: packet type (u16)   - see PacketType
///  8: connection id (u64) - derived from the handshake, never chosen
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub salt: u32,
    pub engagement: u16,
    pub packet_type: PacketType,
    pub connection_id: u64,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 16;
    pub const ENGAGEMENT_V1: u16 = 0;

    pub fn new(salt: u32, packet_type: PacketType, connection_id: u64) -> PacketHeader {
        PacketHeader {
            salt,
            engagement: Self::ENGAGEMENT_V1,
            packet_type,
            connection_id,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.salt);
        buf.put_u16_le(self.engagement);
        buf.put_u16_le(self.packet_type.into());
        buf.put_u64_le(self.connection_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let salt = buf.try_get_u32_le()?;
        let engagement = buf.try_get_u16_le()?;
        let packet_type = PacketType::try_from(buf.try_get_u16_le()?)?;
        let connection_id = buf.try_get_u64_le()?;
        Ok(PacketHeader {
            salt,
            engagement,
            packet_type,
            connection_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::protected(PacketType::Protected, true)]
    #[case::protected_response(PacketType::ProtectedResponse, false)]
    fn test_routing(#[case] packet_type: PacketType, #[case] expected: bool) {
        assert_eq!(packet_type.routes_to_server(), expected);
    }

    #[rstest]
    #[case::zero(0, PacketType::Protected, 0)]
    #[case::typical(0xdead_beef, PacketType::ProtectedResponse, 0x1122_3344_5566_7788)]
    #[case::max(u32::MAX, PacketType::Protected, u64::MAX)]
    fn test_ser_deser(#[case] salt: u32, #[case] packet_type: PacketType, #[case] connection_id: u64) {
        let original = PacketHeader::new(salt, packet_type, connection_id);

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_layout_is_little_endian() {
        let header = PacketHeader::new(0x0403_0201, PacketType::Protected, 0x0807_0605_0403_0201);

        let mut buf = BytesMut::new();
        header.ser(&mut buf);

        assert_eq!(
            buf.as_ref(),
            &[1, 2, 3, 4, 0, 0, 4, 0, 1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_deser_rejects_unknown_packet_type() {
        let buf: &[u8] = &[0, 0, 0, 0, 0, 0, 99, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(PacketHeader::deser(&mut &buf[..]).is_err());
    }

    #[test]
    fn test_deser_rejects_truncated() {
        let buf: &[u8] = &[1, 2, 3];
        assert!(PacketHeader::deser(&mut &buf[..]).is_err());
    }
}
