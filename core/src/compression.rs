//! IP-profile header compression context.
//!
//! Wraps a compressor and a decompressor, each carrying independent
//! per-flow context state, behind `shrink`/`expand`. No published crate
//! implements this wire format (see `DESIGN.md`), so this module builds
//! the IP-only profile's observable behavior directly: a flow's first
//! datagram always crosses the link as an uncompressed "establishing"
//! packet (the no-context soft fallback), and once both ends have seen
//! it, later datagrams on the same flow cross as a small delta
//! referencing the now-shared static header fields (source/destination
//! address, protocol, TTL, ToS).

use std::collections::HashMap;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::framing::MAX_PACKET_SIZE;

/// First byte of a compressed payload. Never collides with a real IPv4
/// packet, whose first byte always has `0x4` in the high nibble.
const COMPRESSED_MARKER: u8 = 0xFF;

const IPV4_MIN_HEADER_LEN: usize = 20;

type Ipv4Addr = [u8; 4];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    protocol: u8,
    lo: Ipv4Addr,
    hi: Ipv4Addr,
}

impl FlowKey {
    fn new(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        if src <= dst {
            FlowKey { protocol, lo: src, hi: dst }
        } else {
            FlowKey { protocol, lo: dst, hi: src }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StaticChain {
    version_ihl: u8,
    tos: u8,
    ttl: u8,
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
}

struct ParsedIpv4<'a> {
    header: StaticChain,
    id: u16,
    flags_frag: u16,
    payload: &'a [u8],
}

fn parse_ipv4(ip: &[u8]) -> Option<ParsedIpv4<'_>> {
    if ip.len() < IPV4_MIN_HEADER_LEN {
        return None;
    }
    let version_ihl = ip[0];
    let version = version_ihl >> 4;
    let ihl = (version_ihl & 0x0F) as usize;
    if version != 4 || ihl != 5 {
        // Options present, or not even IPv4: fall back to uncompressed
        // handling rather than teaching the delta format about IP options.
        return None;
    }
    let header_len = ihl * 4;
    if ip.len() < header_len {
        return None;
    }

    Some(ParsedIpv4 {
        header: StaticChain {
            version_ihl,
            tos: ip[1],
            ttl: ip[8],
            protocol: ip[9],
            src: [ip[12], ip[13], ip[14], ip[15]],
            dst: [ip[16], ip[17], ip[18], ip[19]],
        },
        id: (&ip[4..6]).read_u16::<BigEndian>().unwrap(),
        flags_frag: (&ip[6..8]).read_u16::<BigEndian>().unwrap(),
        payload: &ip[header_len..],
    })
}

/// RFC 791 Internet checksum, computed with the checksum field zeroed.
fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for (offset, mut word) in header.chunks(2).enumerate() {
        sum += if offset * 2 == 10 {
            0 // checksum field itself
        } else {
            word.read_u16::<BigEndian>().unwrap_or(0) as u32
        };
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn rebuild_ipv4(chain: &StaticChain, id: u16, flags_frag: u16, payload: &[u8], out: &mut Vec<u8>) {
    out.clear();
    let total_len = (IPV4_MIN_HEADER_LEN + payload.len()).min(u16::MAX as usize) as u16;

    out.push(chain.version_ihl);
    out.push(chain.tos);
    out.write_u16::<BigEndian>(total_len).unwrap();
    out.write_u16::<BigEndian>(id).unwrap();
    out.write_u16::<BigEndian>(flags_frag).unwrap();
    out.push(chain.ttl);
    out.push(chain.protocol);
    out.write_u16::<BigEndian>(0).unwrap(); // checksum placeholder
    out.extend_from_slice(&chain.src);
    out.extend_from_slice(&chain.dst);

    let checksum = ipv4_checksum(&out[..IPV4_MIN_HEADER_LEN]);
    (&mut out[10..12]).write_u16::<BigEndian>(checksum).unwrap();

    out.extend_from_slice(payload);
}

struct CompressorCtx {
    established: bool,
}

struct DecompressorCtx {
    chain: StaticChain,
}

/// Outcome of `CompressionContext::shrink`, a tagged outcome rather than a
/// sentinel integer, so callers can't mistake one failure mode for another.
pub enum ShrinkOutcome<'a> {
    /// Input was empty; the pipeline should skip the write entirely.
    Empty,
    /// Compression was skipped or the flow has no established context yet;
    /// `bytes` is the original datagram, to be sent as-is.
    Passthrough(&'a [u8]),
    /// Compression succeeded; `bytes` is the compressed payload.
    Compressed(&'a [u8]),
}

pub enum ExpandOutcome<'a> {
    /// Payload is presumed to already be an uncompressed IP datagram.
    Passthrough(&'a [u8]),
    /// Payload was a compressed delta, successfully reconstructed.
    Decompressed(&'a [u8]),
}

/// A hard, unrecoverable ROHC-layer error (maps to `FatalReason::Rohc`).
#[derive(Debug)]
pub struct RohcError(pub String);

pub struct CompressionContext {
    icmp_only: bool,
    compressor_contexts: HashMap<FlowKey, CompressorCtx>,
    decompressor_contexts: HashMap<u16, DecompressorCtx>,
    shrink_buf: Vec<u8>,
    expand_buf: Vec<u8>,
}

impl CompressionContext {
    /// Construct compressor and decompressor state. When `icmp_only` is
    /// set, only IPv4/ICMP datagrams are compressed and everything else
    /// is passed through untouched.
    pub fn new(icmp_only: bool) -> Self {
        CompressionContext {
            icmp_only,
            compressor_contexts: HashMap::new(),
            decompressor_contexts: HashMap::new(),
            shrink_buf: Vec::with_capacity(MAX_PACKET_SIZE),
            expand_buf: Vec::with_capacity(MAX_PACKET_SIZE),
        }
    }

    fn flow_cid(flow: &FlowKey) -> u16 {
        // FNV-1a over the flow's canonical (unordered) identity. Both ends
        // derive the same id independently, with no negotiation needed.
        let mut hash: u32 = 0x811C_9DC5;
        let bytes = [flow.protocol]
            .into_iter()
            .chain(flow.lo.into_iter())
            .chain(flow.hi.into_iter());
        for b in bytes {
            hash ^= b as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        (hash ^ (hash >> 16)) as u16
    }

    /// Compress `ip`, an outbound IP datagram read from the TUN endpoint.
    pub fn shrink(&mut self, ip: &[u8]) -> Result<ShrinkOutcome<'_>, RohcError> {
        if ip.is_empty() {
            return Ok(ShrinkOutcome::Empty);
        }

        let version = ip[0] >> 4;
        if version == 4 && self.icmp_only && ip.len() > 9 && ip[9] != 1 {
            // Deliberate narrowing: compression is ICMP-only for now.
            return Ok(ShrinkOutcome::Passthrough(ip));
        }

        let parsed = match parse_ipv4(ip) {
            Some(parsed) => parsed,
            None => return Ok(ShrinkOutcome::Passthrough(ip)),
        };

        let flow = FlowKey::new(parsed.header.protocol, parsed.header.src, parsed.header.dst);

        let established = self
            .compressor_contexts
            .entry(flow)
            .or_insert(CompressorCtx { established: false });

        if !established.established {
            established.established = true;
            return Ok(ShrinkOutcome::Passthrough(ip));
        }

        self.shrink_buf.clear();
        self.shrink_buf.push(COMPRESSED_MARKER);
        self.shrink_buf.write_u16::<BigEndian>(Self::flow_cid(&flow)).unwrap();
        self.shrink_buf.write_u16::<BigEndian>(parsed.id).unwrap();
        self.shrink_buf.write_u16::<BigEndian>(parsed.flags_frag).unwrap();
        self.shrink_buf.extend_from_slice(parsed.payload);

        Ok(ShrinkOutcome::Compressed(&self.shrink_buf[..]))
    }

    /// Decompress `payload`, an inbound frame payload read from the serial
    /// endpoint.
    pub fn expand(&mut self, payload: &[u8]) -> Result<ExpandOutcome<'_>, RohcError> {
        if payload.first() != Some(&COMPRESSED_MARKER) {
            // Presumed-uncompressed datagram. If it parses as IPv4,
            // establish/refresh this end's decompressor context for the
            // flow and deliver feedback to the local compressor so a
            // reply on the same flow can be compressed immediately.
            if let Some(parsed) = parse_ipv4(payload) {
                let flow = FlowKey::new(parsed.header.protocol, parsed.header.src, parsed.header.dst);
                let cid = Self::flow_cid(&flow);
                self.decompressor_contexts
                    .insert(cid, DecompressorCtx { chain: parsed.header });
                self.deliver_feedback(flow);
            }
            return Ok(ExpandOutcome::Passthrough(payload));
        }

        if payload.len() < 7 {
            return Err(RohcError("compressed payload shorter than header".into()));
        }
        let cid = (&payload[1..3]).read_u16::<BigEndian>().unwrap();
        let id = (&payload[3..5]).read_u16::<BigEndian>().unwrap();
        let flags_frag = (&payload[5..7]).read_u16::<BigEndian>().unwrap();
        let body = &payload[7..];

        let ctx = match self.decompressor_contexts.get(&cid) {
            Some(ctx) => ctx,
            None => {
                // No context established for this cid: presumed
                // uncompressed soft fallback.
                return Ok(ExpandOutcome::Passthrough(payload));
            }
        };

        rebuild_ipv4(&ctx.chain, id, flags_frag, body, &mut self.expand_buf);
        Ok(ExpandOutcome::Decompressed(&self.expand_buf[..]))
    }

    /// Deliver decompressor feedback to the local compressor context for
    /// `flow`, marking it established so a reply does not need its own
    /// uncompressed establishing packet.
    fn deliver_feedback(&mut self, flow: FlowKey) {
        self.compressor_contexts
            .entry(flow)
            .or_insert(CompressorCtx { established: false })
            .established = true;
    }
}
