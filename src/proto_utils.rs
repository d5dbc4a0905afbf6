/// DNS wire header length.
pub const HEADER_LEN: usize = 12;

/// RCODE 0, a successful resolution.
pub const RCODE_NOERROR: u8 = 0;

/// 仅解析 DNS 头部，避免全量 Message 解析的分配开销
/// Header-only parse, avoiding the allocation cost of a full Message parse.
///
/// The reply matcher consumes `id`, `tc` and `rcode`; the rest of the header
/// is carried for logging and query-side sanity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool,
    pub opcode: u8,
    pub tc: bool,
    pub rd: bool,
    pub rcode: u8,
    pub qdcount: u16,
    pub ancount: u16,
}

/// Parse the fixed 12-byte header. `None` when the packet cannot carry one.
pub fn parse_header(packet: &[u8]) -> Option<DnsHeader> {
    if packet.len() < HEADER_LEN {
        return None;
    }

    let id = u16::from_be_bytes([packet[0], packet[1]]);

    // Flags: QR(1) Opcode(4) AA(1) TC(1) RD(1) | RA(1) Z(3) RCODE(4)
    let flags_hi = packet[2];
    let flags_lo = packet[3];

    Some(DnsHeader {
        id,
        qr: flags_hi & 0x80 != 0,
        opcode: (flags_hi >> 3) & 0x0F,
        tc: flags_hi & 0x02 != 0,
        rd: flags_hi & 0x01 != 0,
        rcode: flags_lo & 0x0F,
        qdcount: u16::from_be_bytes([packet[4], packet[5]]),
        ancount: u16::from_be_bytes([packet[6], packet[7]]),
    })
}
