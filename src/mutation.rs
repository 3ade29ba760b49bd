use bytes::Bytes;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

use crate::proto_utils::HEADER_LEN;

/// Rewrite a query so the question's QNAME becomes a forward compression
/// pointer to a verbatim copy of the name stored past the question
/// section. A compliant resolver follows the pointer and sees the same
/// question; middleboxes that scan the question sequentially misread it.
///
/// Only plain single-question queries are eligible: a packet with answer,
/// authority, or additional records (EDNS OPT) is left alone and None is
/// returned so the caller sends the original bytes.
pub fn mutate_query(packet: &[u8]) -> Option<Vec<u8>> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let qd_count = u16::from_be_bytes([packet[4], packet[5]]);
    let an_count = u16::from_be_bytes([packet[6], packet[7]]);
    let ns_count = u16::from_be_bytes([packet[8], packet[9]]);
    let ar_count = u16::from_be_bytes([packet[10], packet[11]]);
    if qd_count != 1 || an_count != 0 || ns_count != 0 || ar_count != 0 {
        return None;
    }

    // Locate the end of the QNAME; client queries carrying pointers are
    // not eligible.
    let mut pos = HEADER_LEN;
    loop {
        let len = *packet.get(pos)?;
        if len == 0 {
            break;
        }
        if len & 0xC0 != 0 {
            return None;
        }
        pos += 1 + len as usize;
    }
    let name_end = pos; // offset of the terminal zero
    if packet.len() < name_end + 5 {
        return None;
    }
    let qname = &packet[HEADER_LEN..=name_end];
    let type_class = &packet[name_end + 1..name_end + 5];

    // The name copy lands right after the rewritten question: header,
    // 2-byte pointer, QTYPE, QCLASS.
    let tail_offset = HEADER_LEN + 2 + 4;
    let mut out = Vec::with_capacity(tail_offset + qname.len());
    out.extend_from_slice(&packet[..HEADER_LEN]);
    out.push(0xC0 | ((tail_offset >> 8) as u8));
    out.push((tail_offset & 0xFF) as u8);
    out.extend_from_slice(type_class);
    out.extend_from_slice(qname);
    Some(out)
}

/// Leniently decode a reply received on the mutated path and re-emit it
/// canonically under the client's transaction ID. The re-emission writes
/// a standard question section, so the reply matches the client's packet
/// layout regardless of how the upstream echoed the mutated question.
/// None means the reply did not decode and must be dropped.
pub fn restore_reply(reply: &[u8], client_id: u16) -> Option<Bytes> {
    let mut msg = Message::from_bytes(reply).ok()?;
    msg.set_id(client_id);
    let out = msg.to_bytes().ok()?;
    Some(Bytes::from(out))
}
