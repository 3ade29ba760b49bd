use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::from_utf8;

use bytes::Bytes;
use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};

pub const HEADER_LEN: usize = 12;

const TYPE_A: u16 = 1;
const TYPE_AAAA: u16 = 28;

/// First question of a query, parsed without allocating.
///
/// `qname` borrows from the caller's scratch buffer and is lowercased,
/// dot-joined, without the trailing root dot.
pub struct ParsedQuery<'a> {
    pub tx_id: u16,
    pub qname: &'a str,
    pub qtype: u16,
    pub qclass: u16,
    /// ARCOUNT of the packet; non-zero usually means an EDNS OPT record.
    pub additionals: u16,
}

/// Bound on compression-pointer hops while expanding a name; anything
/// deeper is a malformed or adversarial packet.
const MAX_POINTER_HOPS: usize = 8;

/// Expand one (possibly compressed) name starting at `start` into `out`
/// as a lowercased, dot-joined string. Returns the offset just past the
/// name *field* at `start` (a pointer ends the field in place) and the
/// number of bytes written.
fn expand_name(packet: &[u8], start: usize, out: &mut [u8]) -> Option<(usize, usize)> {
    let mut cursor = start;
    let mut written = 0;
    // Set at the first pointer: the field ends there, wherever the
    // pointer chain leads afterwards.
    let mut field_end: Option<usize> = None;
    let mut hops = 0;

    loop {
        let len = *packet.get(cursor)? as usize;
        if len == 0 {
            break;
        }
        if len & 0xC0 == 0xC0 {
            let low = *packet.get(cursor + 1)? as usize;
            if field_end.is_none() {
                field_end = Some(cursor + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return None;
            }
            cursor = ((len & 0x3F) << 8) | low;
            continue;
        }
        let label = packet.get(cursor + 1..cursor + 1 + len)?;
        if written > 0 {
            *out.get_mut(written)? = b'.';
            written += 1;
        }
        let dst = out.get_mut(written..written + len)?;
        for (d, s) in dst.iter_mut().zip(label) {
            *d = s.to_ascii_lowercase();
        }
        written += len;
        cursor += 1 + len;
    }

    Some((field_end.unwrap_or(cursor + 1), written))
}

/// Parse the DNS header and first question only, avoiding a full message
/// decode on the hot path. `buf` receives the normalized name; 256 bytes
/// is enough for any legal QNAME.
pub fn parse_query<'a>(packet: &[u8], buf: &'a mut [u8]) -> Option<ParsedQuery<'a>> {
    if packet.len() < HEADER_LEN {
        return None;
    }

    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    let additionals = u16::from_be_bytes([packet[10], packet[11]]);
    if qd_count == 0 {
        return None;
    }

    let (after_name, name_len) = expand_name(packet, HEADER_LEN, buf)?;
    if packet.len() < after_name + 4 {
        return None;
    }
    let qtype = u16::from_be_bytes([packet[after_name], packet[after_name + 1]]);
    let qclass = u16::from_be_bytes([packet[after_name + 2], packet[after_name + 3]]);

    let qname = from_utf8(&buf[..name_len]).ok()?;

    Some(ParsedQuery {
        tx_id,
        qname,
        qtype,
        qclass,
        additionals,
    })
}

pub fn tx_id(packet: &[u8]) -> Option<u16> {
    if packet.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([packet[0], packet[1]]))
}

pub fn set_id(packet: &mut [u8], id: u16) {
    if packet.len() >= 2 {
        packet[0..2].copy_from_slice(&id.to_be_bytes());
    }
}

pub fn is_response(packet: &[u8]) -> bool {
    packet.len() >= 3 && packet[2] & 0x80 != 0
}

pub fn is_truncated(packet: &[u8]) -> bool {
    packet.len() >= 3 && packet[2] & 0x02 != 0
}

pub fn response_code(packet: &[u8]) -> Option<u8> {
    if packet.len() < 4 {
        return None;
    }
    Some(packet[3] & 0x0F)
}

/// Skip one (possibly compressed) name starting at `pos`; returns the
/// offset just past it. A pointer terminates the name in place.
fn skip_name(packet: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        if pos >= packet.len() {
            return None;
        }
        let len = packet[pos];
        if len == 0 {
            return Some(pos + 1);
        }
        if (len & 0xC0) == 0xC0 {
            if pos + 2 > packet.len() {
                return None;
            }
            return Some(pos + 2);
        }
        pos += 1 + len as usize;
    }
}

/// Extract every A/AAAA address from the answer section. Unknown RR types
/// are skipped over via RDLENGTH. Returns None on a malformed packet so
/// the caller can discard the reply as if it never arrived.
pub fn answer_ips(packet: &[u8]) -> Option<Vec<IpAddr>> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    let an_count = u16::from_be_bytes([packet[6], packet[7]]);

    let mut pos = HEADER_LEN;
    for _ in 0..qd_count {
        pos = skip_name(packet, pos)?;
        pos += 4; // QTYPE + QCLASS
        if pos > packet.len() {
            return None;
        }
    }

    let mut ips = Vec::new();
    for _ in 0..an_count {
        pos = skip_name(packet, pos)?;
        if pos + 10 > packet.len() {
            return None;
        }
        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let rd_len = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;
        if pos + rd_len > packet.len() {
            return None;
        }
        match (rtype, rd_len) {
            (TYPE_A, 4) => {
                let o: [u8; 4] = packet[pos..pos + 4].try_into().ok()?;
                ips.push(IpAddr::V4(Ipv4Addr::from(o)));
            }
            (TYPE_AAAA, 16) => {
                let o: [u8; 16] = packet[pos..pos + 16].try_into().ok()?;
                ips.push(IpAddr::V6(Ipv6Addr::from(o)));
            }
            _ => {}
        }
        pos += rd_len;
    }
    Some(ips)
}

/// Synthesize an NXDOMAIN/SERVFAIL reply echoing the client's question.
///
/// QR=1, RA=1, AA=0; RD is copied from the query. When the query carried
/// an OPT record the reply advertises `udp_max_size` as its payload size.
/// Falls back to a header-only reply when the query does not decode.
pub fn build_failure_reply(query: &[u8], rcode: ResponseCode, udp_max_size: u16) -> Bytes {
    if let Ok(req) = Message::from_bytes(query) {
        let mut msg = Message::new();
        msg.set_id(req.id());
        msg.set_message_type(MessageType::Response);
        msg.set_op_code(req.op_code());
        msg.set_recursion_desired(req.recursion_desired());
        msg.set_recursion_available(true);
        msg.set_authoritative(false);
        msg.set_response_code(rcode);
        for q in req.queries() {
            msg.add_query(q.clone());
        }
        if req.edns().is_some() {
            let mut edns = Edns::new();
            edns.set_max_payload(udp_max_size);
            msg.set_edns(edns);
        }

        let mut out = Vec::with_capacity(query.len() + 16);
        let mut encoder = BinEncoder::new(&mut out);
        if msg.emit(&mut encoder).is_ok() {
            return Bytes::from(out);
        }
    }

    // Header-only fallback for queries that do not decode.
    let mut out = vec![0u8; HEADER_LEN];
    if query.len() >= 2 {
        out[0..2].copy_from_slice(&query[0..2]);
    }
    out[2] = 0x80 | (query.get(2).copied().unwrap_or(0) & 0x01); // QR, copy RD
    out[3] = 0x80 | rcode.low(); // RA, RCODE
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{DNSClass, Name, RecordType};
    use std::str::FromStr;

    fn build_query(id: u16, name: &str, rtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(Name::from_str(name).unwrap());
        q.set_query_type(rtype);
        q.set_query_class(DNSClass::IN);
        msg.add_query(q);
        msg.to_bytes().unwrap()
    }

    fn be16(v: u16) -> [u8; 2] {
        v.to_be_bytes()
    }

    /// Hand-built response: question + given answer records, names as
    /// pointers to offset 12.
    fn build_response(
        id: u16,
        name: &str,
        answers: &[(u16, Vec<u8>)],
        rcode: u8,
        truncated: bool,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&be16(id));
        let flags2: u8 = 0x80 | 0x01 | if truncated { 0x02 } else { 0 };
        out.push(flags2);
        out.push(0x80 | rcode);
        out.extend_from_slice(&be16(1)); // QDCOUNT
        out.extend_from_slice(&be16(answers.len() as u16));
        out.extend_from_slice(&be16(0));
        out.extend_from_slice(&be16(0));
        for label in name.split('.') {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(&be16(1)); // QTYPE A
        out.extend_from_slice(&be16(1)); // QCLASS IN
        for (rtype, rdata) in answers {
            out.extend_from_slice(&[0xC0, 0x0C]);
            out.extend_from_slice(&be16(*rtype));
            out.extend_from_slice(&be16(1));
            out.extend_from_slice(&300u32.to_be_bytes());
            out.extend_from_slice(&be16(rdata.len() as u16));
            out.extend_from_slice(rdata);
        }
        out
    }

    #[test]
    fn parse_query_extracts_question() {
        let packet = build_query(0x1234, "WWW.Example.COM", RecordType::A);
        let mut buf = [0u8; 256];
        let q = parse_query(&packet, &mut buf).expect("parse");
        assert_eq!(q.tx_id, 0x1234);
        assert_eq!(q.qname, "www.example.com");
        assert_eq!(q.qtype, 1);
        assert_eq!(q.qclass, 1);
    }

    #[test]
    fn parse_query_rejects_short_and_empty() {
        let mut buf = [0u8; 256];
        assert!(parse_query(&[0u8; 4], &mut buf).is_none());
        // Header with QDCOUNT=0
        assert!(parse_query(&[0u8; 12], &mut buf).is_none());
    }

    #[test]
    fn parse_query_follows_compression_pointers() {
        // Question name is a pointer to a name stored past the question.
        let mut packet = Vec::new();
        packet.extend_from_slice(&be16(7));
        packet.extend_from_slice(&[0x01, 0x00]);
        packet.extend_from_slice(&be16(1));
        packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        packet.extend_from_slice(&[0xC0, 18]); // pointer to offset 18
        packet.extend_from_slice(&be16(1));
        packet.extend_from_slice(&be16(1));
        packet.extend_from_slice(b"\x02qq\x03com\x00");
        let mut buf = [0u8; 256];
        let q = parse_query(&packet, &mut buf).expect("parse");
        assert_eq!(q.qname, "qq.com");
    }

    #[test]
    fn parse_query_detects_pointer_loops() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&be16(7));
        packet.extend_from_slice(&[0x01, 0x00]);
        packet.extend_from_slice(&be16(1));
        packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        packet.extend_from_slice(&[0xC0, 12]); // points at itself
        packet.extend_from_slice(&be16(1));
        packet.extend_from_slice(&be16(1));
        let mut buf = [0u8; 256];
        assert!(parse_query(&packet, &mut buf).is_none());
    }

    #[test]
    fn answer_ips_collects_both_families_and_skips_unknown_types() {
        let answers = vec![
            (5u16, b"\x03foo\xC0\x0C".to_vec()), // CNAME, skipped
            (1u16, vec![93, 184, 216, 34]),
            (28u16, {
                let v6: Ipv6Addr = "2606:2800:220:1::1".parse().unwrap();
                v6.octets().to_vec()
            }),
            (16u16, b"\x04text".to_vec()), // TXT, skipped
        ];
        let packet = build_response(1, "example.com", &answers, 0, false);
        let ips = answer_ips(&packet).expect("parse");
        assert_eq!(ips.len(), 2);
        assert_eq!(ips[0], "93.184.216.34".parse::<IpAddr>().unwrap());
        assert_eq!(ips[1], "2606:2800:220:1::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn answer_ips_rejects_truncated_rdata() {
        let packet = build_response(1, "example.com", &[(1, vec![93, 184, 216, 34])], 0, false);
        assert!(answer_ips(&packet[..packet.len() - 2]).is_none());
    }

    #[test]
    fn answer_ips_empty_for_no_answers() {
        let packet = build_response(1, "example.com", &[], 3, false);
        assert_eq!(answer_ips(&packet).expect("parse"), Vec::<IpAddr>::new());
    }

    #[test]
    fn flag_accessors() {
        let resp = build_response(9, "example.com", &[], 0, true);
        assert!(is_response(&resp));
        assert!(is_truncated(&resp));
        assert_eq!(response_code(&resp), Some(0));

        let query = build_query(9, "example.com", RecordType::A);
        assert!(!is_response(&query));
        assert!(!is_truncated(&query));
    }

    #[test]
    fn set_id_rewrites_in_place() {
        let mut packet = build_query(0x1111, "example.com", RecordType::A);
        set_id(&mut packet, 0xBEEF);
        assert_eq!(tx_id(&packet), Some(0xBEEF));
        let mut buf = [0u8; 256];
        assert_eq!(parse_query(&packet, &mut buf).unwrap().tx_id, 0xBEEF);
    }

    #[test]
    fn failure_reply_echoes_question_with_nxdomain() {
        let query = build_query(0x4242, "blocked.example", RecordType::A);
        let reply = build_failure_reply(&query, ResponseCode::NXDomain, 4096);

        assert_eq!(tx_id(&reply), Some(0x4242));
        assert!(is_response(&reply));
        assert_eq!(response_code(&reply), Some(3));

        let msg = Message::from_bytes(&reply).expect("decode");
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].name().to_ascii(), "blocked.example.");
        assert!(msg.recursion_available());
        assert!(!msg.authoritative());
    }

    #[test]
    fn failure_reply_advertises_udp_max_size_with_edns() {
        let mut msg = Message::new();
        msg.set_id(5);
        msg.set_message_type(MessageType::Query);
        let mut q = Query::new();
        q.set_name(Name::from_str("example.com").unwrap());
        q.set_query_type(RecordType::A);
        msg.add_query(q);
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        msg.set_edns(edns);
        let query = msg.to_bytes().unwrap();

        let reply = build_failure_reply(&query, ResponseCode::ServFail, 4096);
        let decoded = Message::from_bytes(&reply).expect("decode");
        assert_eq!(decoded.edns().map(|e| e.max_payload()), Some(4096));
    }

    #[test]
    fn failure_reply_degrades_to_header_for_garbage() {
        let reply = build_failure_reply(&[0xAB, 0xCD, 0x01], ResponseCode::ServFail, 512);
        assert_eq!(reply.len(), HEADER_LEN);
        assert_eq!(tx_id(&reply), Some(0xABCD));
        assert!(is_response(&reply));
        assert_eq!(response_code(&reply), Some(2));
    }

    // Codec closure: decode-then-encode of our own output is stable.
    #[test]
    fn synthesized_reply_round_trips() {
        let query = build_query(77, "www.example.com", RecordType::A);
        let reply = build_failure_reply(&query, ResponseCode::NXDomain, 4096);
        let msg = Message::from_bytes(&reply).expect("decode");
        let re_emitted = msg.to_bytes().expect("encode");
        assert_eq!(&reply[..], &re_emitted[..]);
    }
}
