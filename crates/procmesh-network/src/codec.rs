//! Wire codec for the routed message frame: fixed 44-byte header, a
//! variable-length alias, and a variable-length payload. All integer fields
//! are little-endian u32; there is no in-band framing token, so a decode
//! failure past the bounded header means the byte stream is desynchronised.

pub const HEADER_LEN: usize = 44;

/// Ultimate destination carried in the `dst_remote` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstRemote {
    Broadcast,
    Alias,
    Pid(u32),
}

impl DstRemote {
    fn to_wire(self) -> u32 {
        match self {
            DstRemote::Broadcast => 0,
            DstRemote::Alias => 1,
            DstRemote::Pid(pid) => pid,
        }
    }

    fn from_wire(v: u32) -> Self {
        match v {
            0 => DstRemote::Broadcast,
            1 => DstRemote::Alias,
            pid => DstRemote::Pid(pid),
        }
    }
}

/// One routed message. `dst` is the next-hop pid and is rewritten at every
/// hop; everything else is immutable once a frame is constructed, except
/// when it's cloned to build a forwarded or ack variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst: u32,
    pub src: u32,
    pub serialize: bool,
    pub request_ack: bool,
    pub is_ack: bool,
    pub id: u32,
    pub urgent: bool,
    pub dst_remote: DstRemote,
    pub last_node_pid: u32,
    pub broadcast: bool,
    pub alias: String,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Returns a copy rewritten for the next hop: `dst` and `last_node_pid`
    /// updated, everything else unchanged. Used both when forwarding and
    /// when fanning a local submission out to every neighbour.
    pub fn for_next_hop(&self, dst: u32, last_node_pid: u32) -> Frame {
        Frame { dst, last_node_pid, ..self.clone() }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.alias.len() + 4 + self.payload.len()
    }
}

pub fn encode(frame: &Frame, out: &mut Vec<u8>) {
    out.reserve(frame.encoded_len());
    out.extend_from_slice(&frame.dst.to_le_bytes());
    out.extend_from_slice(&frame.src.to_le_bytes());
    out.extend_from_slice(&u32::from(frame.serialize).to_le_bytes());
    out.extend_from_slice(&u32::from(frame.request_ack).to_le_bytes());
    out.extend_from_slice(&u32::from(frame.is_ack).to_le_bytes());
    out.extend_from_slice(&frame.id.to_le_bytes());
    out.extend_from_slice(&u32::from(frame.urgent).to_le_bytes());
    out.extend_from_slice(&frame.dst_remote.to_wire().to_le_bytes());
    out.extend_from_slice(&frame.last_node_pid.to_le_bytes());
    out.extend_from_slice(&u32::from(frame.broadcast).to_le_bytes());
    out.extend_from_slice(&(frame.alias.len() as u32).to_le_bytes());
    out.extend_from_slice(frame.alias.as_bytes());
    out.extend_from_slice(&(frame.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&frame.payload);
}

#[inline]
fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().expect("4-byte slice"))
}

/// Attempts to parse one frame from the front of `buf`. Returns `None` if
/// fewer than a complete frame's worth of bytes are buffered, leaving `buf`
/// untouched so a later read can complete it. On success, removes exactly
/// the consumed prefix.
pub fn try_decode(buf: &mut Vec<u8>) -> Option<Frame> {
    if buf.len() < HEADER_LEN {
        return None;
    }

    let alias_len = read_u32(buf, 40) as usize;
    let after_alias = HEADER_LEN + alias_len;
    if buf.len() < after_alias + 4 {
        return None;
    }

    let payload_len = read_u32(buf, after_alias) as usize;
    let total = after_alias + 4 + payload_len;
    if buf.len() < total {
        return None;
    }

    let frame = Frame {
        dst: read_u32(buf, 0),
        src: read_u32(buf, 4),
        serialize: read_u32(buf, 8) != 0,
        request_ack: read_u32(buf, 12) != 0,
        is_ack: read_u32(buf, 16) != 0,
        id: read_u32(buf, 20),
        urgent: read_u32(buf, 24) != 0,
        dst_remote: DstRemote::from_wire(read_u32(buf, 28)),
        last_node_pid: read_u32(buf, 32),
        broadcast: read_u32(buf, 36) != 0,
        alias: String::from_utf8_lossy(&buf[HEADER_LEN..after_alias]).into_owned(),
        payload: buf[after_alias + 4..total].to_vec(),
    };

    buf.drain(..total);
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(alias: &str, payload: &[u8]) -> Frame {
        Frame {
            dst: 42,
            src: 7,
            serialize: true,
            request_ack: false,
            is_ack: false,
            id: 1234,
            urgent: true,
            dst_remote: if alias.is_empty() { DstRemote::Pid(42) } else { DstRemote::Alias },
            last_node_pid: 7,
            broadcast: false,
            alias: alias.to_string(),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn round_trips() {
        let frame = sample("worker", b"hello");
        let mut bytes = Vec::new();
        encode(&frame, &mut bytes);
        let decoded = try_decode(&mut bytes).expect("decodes");
        assert_eq!(decoded, frame);
        assert!(bytes.is_empty());
    }

    #[test]
    fn short_buffer_is_untouched() {
        let frame = sample("", b"payload bytes");
        let mut bytes = Vec::new();
        encode(&frame, &mut bytes);
        let full = bytes.clone();

        for cut in 0..full.len() {
            let mut partial = full[..cut].to_vec();
            assert!(try_decode(&mut partial).is_none());
            assert_eq!(partial, full[..cut]);
        }
    }

    #[test]
    fn decodes_two_frames_back_to_back() {
        let a = sample("", b"a");
        let b = sample("b-alias", b"bb");
        let mut bytes = Vec::new();
        encode(&a, &mut bytes);
        encode(&b, &mut bytes);

        let first = try_decode(&mut bytes).expect("first frame");
        assert_eq!(first, a);
        let second = try_decode(&mut bytes).expect("second frame");
        assert_eq!(second, b);
        assert!(bytes.is_empty());
    }

    #[test]
    fn broadcast_and_alias_round_trip() {
        let mut frame = sample("", b"x");
        frame.dst_remote = DstRemote::Broadcast;
        frame.broadcast = true;
        let mut bytes = Vec::new();
        encode(&frame, &mut bytes);
        assert_eq!(try_decode(&mut bytes).unwrap().dst_remote, DstRemote::Broadcast);
    }
}
