use bitflags::bitflags;

/// Offset of the flag byte within a TCP header (RFC 793).
pub const FLAGS_OFFSET: usize = 13;
/// Offset of the two checksum bytes within a TCP header (RFC 793).
pub const CHECKSUM_OFFSET: usize = 16;

bitflags! {
    /// The eight standard TCP flags, as laid out in header byte 13.
    ///
    /// The experimental "NS" flag lives in byte 12 and is not handled.
    /// Declaration order is the order flag names are rendered in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const CWR = 0x80;
        const ECE = 0x40;
        const URG = 0x20;
        const ACK = 0x10;
        const PSH = 0x08;
        const RST = 0x04;
        const SYN = 0x02;
        const FIN = 0x01;
    }
}

/// Tests whether `flags` are set in the header's flag byte.
///
/// `header` must start at the first byte of the TCP header and hold at
/// least 14 bytes; offsets are not bounds checked here.
pub fn flag_is_set(header: &[u8], flags: TcpFlags) -> bool {
    TcpFlags::from_bits_truncate(header[FLAGS_OFFSET]).contains(flags)
}

/// Names of the flags set in the header, lazily, in declaration order
/// (CWR first, FIN last). Never yields a name for the NS bit.
pub fn flag_names(header: &[u8]) -> impl Iterator<Item = &'static str> {
    TcpFlags::from_bits_truncate(header[FLAGS_OFFSET])
        .iter_names()
        .map(|(name, _)| name)
}

/// The checksum field as it appears on the wire, big-endian.
///
/// At the transport layers this runs on, the stack has usually not filled
/// the field in yet, so zero is the common reading.
pub fn checksum(header: &[u8]) -> u16 {
    u16::from_be_bytes([header[CHECKSUM_OFFSET], header[CHECKSUM_OFFSET + 1]])
}

/// Renders one byte as its 8-character binary form, most significant
/// bit first. Diagnostic rendering only.
pub fn binary_octet(value: u8) -> String {
    format!("{:08b}", value)
}
