//! HDLC-style byte-stuffing framer/deframer.
//!
//! Two reserved bytes delimit and escape frames on the serial byte stream:
//! `FLAG` (0x7E) marks frame boundaries and `ESC` (0x7D) escapes any payload
//! byte that collides with either reserved value. The deframer is modeled
//! as pure state so it can be unit tested in isolation from any fd.

pub const MAX_PACKET_SIZE: usize = 65536;

pub const FLAG: u8 = 0x7E;
pub const ESC: u8 = 0x7D;

const ESC_XOR: u8 = 0x20;

/// Largest possible encoded frame: opening flag, every payload byte doubled
/// by escaping, closing flag.
pub const MAX_FRAME_SIZE: usize = 1 + 2 * MAX_PACKET_SIZE + 1;

/// Encodes whole packets into HDLC-framed byte sequences.
///
/// Owns a single `MAX_FRAME_SIZE` buffer; the slice returned by `encode` is
/// only valid until the next call, mirroring the single-threaded pipeline
/// that is the only caller.
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Framer {
            buf: vec![0u8; MAX_FRAME_SIZE],
        }
    }

    /// Encode `payload` as a complete HDLC frame. Panics if `payload` is
    /// larger than `MAX_PACKET_SIZE` — the pipeline never hands it one,
    /// since both endpoints cap reads at that size.
    pub fn encode(&mut self, payload: &[u8]) -> &[u8] {
        assert!(payload.len() <= MAX_PACKET_SIZE);

        let mut j = 0;
        self.buf[j] = FLAG;
        j += 1;

        for &byte in payload {
            match byte {
                FLAG | ESC => {
                    self.buf[j] = ESC;
                    self.buf[j + 1] = byte ^ ESC_XOR;
                    j += 2;
                }
                _ => {
                    self.buf[j] = byte;
                    j += 1;
                }
            }
        }

        self.buf[j] = FLAG;
        j += 1;

        debug_assert!(j <= MAX_FRAME_SIZE);
        &self.buf[..j]
    }
}

impl Default for Framer {
    fn default() -> Self {
        Framer::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    InFrame,
    InEscape,
}

/// Single persistent deframer state machine. Must be created once at
/// daemon startup and never reset except then — the state spans every
/// serial read for the lifetime of the pipeline.
pub struct Deframer {
    state: State,
    acc: Vec<u8>,
}

impl Deframer {
    pub fn new() -> Self {
        Deframer {
            state: State::Idle,
            acc: Vec::with_capacity(MAX_PACKET_SIZE),
        }
    }

    /// Feed one chunk of bytes as read from the serial fd. Consumes bytes
    /// from the front of `chunk` up to and including the byte that
    /// completed a frame (if any), returning how many bytes were consumed
    /// and the completed payload, if one was produced.
    ///
    /// Callers must call this in a loop, advancing past `consumed` each
    /// time, until the whole chunk is drained — a single read can contain
    /// several frames, or none.
    pub fn feed_one<'a>(&'a mut self, chunk: &[u8]) -> (usize, Option<&'a [u8]>) {
        let mut produced = false;

        for (i, &byte) in chunk.iter().enumerate() {
            match self.state {
                State::Idle => {
                    if byte == FLAG {
                        self.state = State::InFrame;
                        self.acc.clear();
                    }
                    // Anything else is leading noise: resynchronization
                    // tolerance, ignore it.
                }
                State::InFrame => match byte {
                    ESC => self.state = State::InEscape,
                    FLAG => {
                        // Completed frame (possibly empty). Stay ready for
                        // a following opening FLAG by returning to Idle;
                        // a back-to-back FLAG, FLAG is close-then-open.
                        self.state = State::Idle;
                        produced = true;
                    }
                    _ => {
                        if self.acc.len() == MAX_PACKET_SIZE {
                            // Overflow: drop the partial frame and
                            // resynchronize. Not reported to the pipeline
                            // as an error.
                            self.state = State::Idle;
                            self.acc.clear();
                        } else {
                            self.acc.push(byte);
                        }
                    }
                },
                State::InEscape => {
                    if self.acc.len() == MAX_PACKET_SIZE {
                        self.state = State::Idle;
                        self.acc.clear();
                    } else {
                        self.acc.push(byte ^ ESC_XOR);
                        self.state = State::InFrame;
                    }
                }
            }

            if produced {
                let consumed = i + 1;
                if self.acc.is_empty() {
                    // Idle-fill (two adjacent FLAGs): silently drop, never
                    // forward to compression.
                    return (consumed, None);
                }
                return (consumed, Some(&self.acc[..]));
            }
        }

        (chunk.len(), None)
    }

    #[cfg(test)]
    fn accumulator_len(&self) -> usize {
        self.acc.len()
    }
}

impl Default for Deframer {
    fn default() -> Self {
        Deframer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(deframer: &mut Deframer, mut bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let (consumed, frame) = deframer.feed_one(bytes);
            if let Some(frame) = frame {
                out.push(frame.to_vec());
            }
            bytes = &bytes[consumed..];
        }
        out
    }

    #[test]
    fn round_trip_single_packet() {
        for len in [1usize, 2, 60, 1500, MAX_PACKET_SIZE] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let mut framer = Framer::new();
            let encoded = framer.encode(&payload).to_vec();

            let mut deframer = Deframer::new();
            let frames = decode_all(&mut deframer, &encoded);
            assert_eq!(frames, vec![payload]);
        }
    }

    #[test]
    fn flag_only_at_boundaries() {
        let payload = vec![FLAG, ESC, 1, FLAG, ESC, ESC, 0xFF];
        let mut framer = Framer::new();
        let encoded = framer.encode(&payload).to_vec();
        assert_eq!(encoded[0], FLAG);
        assert_eq!(*encoded.last().unwrap(), FLAG);
        for &b in &encoded[1..encoded.len() - 1] {
            assert_ne!(b, FLAG);
        }
    }

    #[test]
    fn empty_frame_is_dropped() {
        let mut deframer = Deframer::new();
        let frames = decode_all(&mut deframer, &[FLAG, FLAG]);
        assert!(frames.is_empty());
    }

    #[test]
    fn escape_pair_decodes_to_xored_byte() {
        // ESC, 0x5E decodes to 0x5E ^ 0x20 == 0x7E (FLAG) carried as data.
        let stream = [FLAG, ESC, 0x5E, FLAG];
        let mut deframer = Deframer::new();
        let frames = decode_all(&mut deframer, &stream);
        assert_eq!(frames, vec![vec![0x7E]]);
    }

    #[test]
    fn garbage_prefix_is_ignored() {
        let payload = vec![1, 2, 3, 4];
        let mut framer = Framer::new();
        let encoded = framer.encode(&payload).to_vec();

        let mut stream = vec![0u8; 4096];
        stream.extend_from_slice(&encoded);

        let mut deframer = Deframer::new();
        let frames = decode_all(&mut deframer, &stream);
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn split_across_chunks() {
        let payload = vec![10, 20, 30, FLAG, ESC, 40];
        let mut framer = Framer::new();
        let encoded = framer.encode(&payload).to_vec();

        let mut deframer = Deframer::new();
        let mut frames = Vec::new();
        for chunk in encoded.chunks(3) {
            frames.extend(decode_all(&mut deframer, chunk));
        }
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn overflow_drops_partial_frame_and_resyncs() {
        let mut deframer = Deframer::new();
        let mut stream = vec![FLAG];
        stream.extend(std::iter::repeat(0xAAu8).take(MAX_PACKET_SIZE + 10));
        // No closing FLAG yet: accumulator should have been capped and
        // dropped internally without panicking.
        let (consumed, frame) = deframer.feed_one(&stream);
        assert_eq!(consumed, stream.len());
        assert!(frame.is_none());
        assert!(deframer.accumulator_len() <= MAX_PACKET_SIZE);

        // Next legitimate frame still decodes correctly.
        let payload = vec![1, 2, 3];
        let mut framer = Framer::new();
        let encoded = framer.encode(&payload);
        let frames = decode_all(&mut deframer, encoded);
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn multiple_frames_in_one_read_preserve_order() {
        let payloads: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8; 8]).collect();
        let mut framer = Framer::new();
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend_from_slice(framer.encode(p));
        }

        let mut deframer = Deframer::new();
        let frames = decode_all(&mut deframer, &stream);
        assert_eq!(frames, payloads);
    }

    #[test]
    fn mid_frame_corruption_resyncs_for_next_frame() {
        let a = vec![1u8, 2, 3, 4];
        let b = vec![9u8, 8, 7, 6];
        let mut framer = Framer::new();
        let mut stream = framer.encode(&a).to_vec();
        let second = framer.encode(&b).to_vec();

        // Flip a byte strictly inside the first frame's payload region.
        let flip_at = 2;
        stream[flip_at] ^= 0xFF;
        stream.extend_from_slice(&second);

        let mut deframer = Deframer::new();
        let frames = decode_all(&mut deframer, &stream);
        // The corrupted frame may or may not equal `a`, but the second
        // frame must always be delivered intact.
        assert_eq!(frames.last().unwrap(), &b);
    }
}
