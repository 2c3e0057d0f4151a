//! STK500v2 message framing
//!
//! Every message travels as
//!
//! ```text
//! 0x1B  seq  len_hi  len_lo  0x0E  body[len]  checksum
//! ```
//!
//! where the checksum is the XOR of every preceding byte. The answer to a
//! request carries the request's sequence number.

use std::time::{Duration, Instant};

use crate::error::{Result, Stk500Error};
use crate::protocol::{ANSWER_CKSUM_ERROR, HEADER_LEN, MAX_BODY_LEN, MESSAGE_START, TOKEN};
use crate::transport::Transport;

/// XOR of all bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Build a complete frame around `body`
pub fn encode_frame(sequence: u8, body: &[u8]) -> Vec<u8> {
    let len = body.len() as u16;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len() + 1);
    frame.push(MESSAGE_START);
    frame.push(sequence);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.push(TOKEN);
    frame.extend_from_slice(body);
    frame.push(checksum(&frame));
    frame
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Sequence,
    SizeHi,
    SizeLo,
    Token,
    Data,
    Checksum,
}

/// Result of feeding one byte to a [`FrameParser`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// Need more bytes
    Pending,
    /// A complete, checksum-valid frame
    Frame {
        /// Sequence number carried by the frame
        sequence: u8,
        /// Frame body
        body: Vec<u8>,
    },
    /// A complete frame whose checksum did not resolve to zero
    ChecksumMismatch,
    /// Header announced a body larger than allowed
    TooLarge {
        /// Announced body length
        len: usize,
    },
}

/// Byte-at-a-time frame decoder
///
/// With an expected sequence number set, frames carrying any other number
/// are skipped: the parser drops back to hunting for a start marker.
#[derive(Debug, Clone)]
pub struct FrameParser {
    state: State,
    expected: Option<u8>,
    max_len: usize,
    sequence: u8,
    len: usize,
    body: Vec<u8>,
    sum: u8,
}

impl FrameParser {
    /// Create a parser accepting bodies up to `max_len` bytes
    pub fn new(max_len: usize) -> Self {
        Self {
            state: State::Start,
            expected: None,
            max_len,
            sequence: 0,
            len: 0,
            body: Vec::new(),
            sum: 0,
        }
    }

    /// Only accept frames carrying `sequence` (or any, with `None`)
    pub fn expect(&mut self, sequence: Option<u8>) {
        self.expected = sequence;
    }

    /// Change the body size limit
    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len;
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.state = State::Start;
        self.body.clear();
        self.sum = 0;
    }

    /// Whether the parser is between frames
    pub fn is_idle(&self) -> bool {
        self.state == State::Start
    }

    /// Feed one received byte
    pub fn feed(&mut self, byte: u8) -> Feed {
        if self.state != State::Checksum {
            self.sum ^= byte;
        }
        match self.state {
            State::Start => {
                if byte == MESSAGE_START {
                    self.sum = MESSAGE_START;
                    self.state = State::Sequence;
                } else {
                    self.sum = 0;
                }
            }
            State::Sequence => match self.expected {
                Some(expected) if expected != byte => {
                    log::trace!(
                        "frame: skipping sequence {} while expecting {}",
                        byte,
                        expected
                    );
                    self.reset();
                }
                _ => {
                    self.sequence = byte;
                    self.state = State::SizeHi;
                }
            },
            State::SizeHi => {
                self.len = (byte as usize) << 8;
                self.state = State::SizeLo;
            }
            State::SizeLo => {
                self.len |= byte as usize;
                if self.len > self.max_len {
                    let len = self.len;
                    self.reset();
                    return Feed::TooLarge { len };
                }
                self.state = State::Token;
            }
            State::Token => {
                if byte == TOKEN {
                    self.body.clear();
                    self.state = if self.len == 0 {
                        State::Checksum
                    } else {
                        State::Data
                    };
                } else {
                    log::trace!("frame: bad token 0x{:02X}", byte);
                    self.reset();
                }
            }
            State::Data => {
                self.body.push(byte);
                if self.body.len() == self.len {
                    self.state = State::Checksum;
                }
            }
            State::Checksum => {
                let valid = self.sum ^ byte == 0;
                let body = std::mem::take(&mut self.body);
                self.reset();
                return if valid {
                    Feed::Frame {
                        sequence: self.sequence,
                        body,
                    }
                } else {
                    Feed::ChecksumMismatch
                };
            }
        }
        Feed::Pending
    }
}

/// Reliable request/answer exchange over a [`Transport`]
pub struct Framer<T: Transport> {
    transport: T,
    sequence: u8,
    parser: FrameParser,
    byte_timeout: Duration,
    frame_timeout: Duration,
}

impl<T: Transport> Framer<T> {
    /// Wrap `transport`
    ///
    /// A receive fails when any single byte takes longer than `byte_timeout`
    /// or the whole frame longer than `frame_timeout`.
    pub fn new(transport: T, byte_timeout: Duration, frame_timeout: Duration) -> Self {
        Self {
            transport,
            sequence: 1,
            parser: FrameParser::new(MAX_BODY_LEN),
            byte_timeout,
            frame_timeout,
        }
    }

    /// Sequence number the next exchange uses
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Start numbering from 1 again
    pub fn reset_sequence(&mut self) {
        self.sequence = 1;
    }

    /// Access the underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give back the underlying transport
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Send `body` with the current sequence number
    pub fn send(&mut self, body: &[u8]) -> Result<()> {
        if body.len() > MAX_BODY_LEN {
            return Err(Stk500Error::FrameTooLarge {
                len: body.len(),
                max: MAX_BODY_LEN,
            });
        }
        let frame = encode_frame(self.sequence, body);
        log::trace!("frame: send seq {} {:02X?}", self.sequence, body);
        self.transport.write(&frame)?;
        self.transport.flush()
    }

    /// Receive the answer carrying the current sequence number
    ///
    /// On success the sequence number advances (wrapping). A timeout,
    /// checksum failure or oversized frame leaves it unchanged.
    pub fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
        self.parser.reset();
        self.parser.expect(Some(self.sequence));
        self.parser.set_max_len(max_len);

        let deadline = Instant::now() + self.frame_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Stk500Error::Timeout);
            }
            let byte = self
                .transport
                .read_byte(self.byte_timeout.min(remaining))?
                .ok_or(Stk500Error::Timeout)?;

            match self.parser.feed(byte) {
                Feed::Pending => {}
                Feed::Frame { body, .. } => {
                    self.sequence = self.sequence.wrapping_add(1);
                    log::trace!("frame: recv {:02X?}", body);
                    if body.first() == Some(&ANSWER_CKSUM_ERROR) {
                        return Err(Stk500Error::PeerChecksumError);
                    }
                    return Ok(body);
                }
                Feed::ChecksumMismatch => return Err(Stk500Error::ChecksumMismatch),
                Feed::TooLarge { len } => {
                    return Err(Stk500Error::FrameTooLarge { len, max: max_len })
                }
            }
        }
    }

    /// Send `body` and receive its answer
    pub fn exchange(&mut self, body: &[u8], max_len: usize) -> Result<Vec<u8>> {
        self.send(body)?;
        self.receive(max_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Loopback-free transport: records writes, serves queued input
    #[derive(Default)]
    struct ScriptedTransport {
        written: Vec<u8>,
        input: VecDeque<u8>,
    }

    impl Transport for ScriptedTransport {
        fn write(&mut self, data: &[u8]) -> Result<()> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn read_byte(&mut self, _timeout: Duration) -> Result<Option<u8>> {
            Ok(self.input.pop_front())
        }

        fn discard_input(&mut self) -> Result<()> {
            self.input.clear();
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            Ok(())
        }

        fn delay_us(&mut self, _us: u32) {}
    }

    fn framer(input: &[u8]) -> Framer<ScriptedTransport> {
        let transport = ScriptedTransport {
            written: Vec::new(),
            input: input.iter().copied().collect(),
        };
        Framer::new(transport, Duration::from_millis(10), Duration::from_secs(1))
    }

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(1, &[0x01]);
        assert_eq!(frame, vec![0x1B, 0x01, 0x00, 0x01, 0x0E, 0x01, 0x14]);
        assert_eq!(checksum(&frame), 0);
    }

    #[test]
    fn test_parser_round_trip() {
        let body: Vec<u8> = (0..=255u8).collect();
        let mut parser = FrameParser::new(MAX_BODY_LEN);
        let frame = encode_frame(0x42, &body);
        let (last, head) = frame.split_last().unwrap();
        for b in head {
            assert_eq!(parser.feed(*b), Feed::Pending);
        }
        assert_eq!(
            parser.feed(*last),
            Feed::Frame {
                sequence: 0x42,
                body
            }
        );
        assert!(parser.is_idle());
    }

    #[test]
    fn test_parser_skips_noise_and_wrong_sequence() {
        let mut stream = vec![0x00, 0xFF, 0x0E];
        stream.extend(encode_frame(7, &[0xAA]));
        stream.extend(encode_frame(8, &[0xBB]));

        let mut parser = FrameParser::new(MAX_BODY_LEN);
        parser.expect(Some(8));
        let frames: Vec<_> = stream
            .iter()
            .filter_map(|b| match parser.feed(*b) {
                Feed::Pending => None,
                other => Some(other),
            })
            .collect();
        assert_eq!(
            frames,
            vec![Feed::Frame {
                sequence: 8,
                body: vec![0xBB]
            }]
        );
    }

    #[test]
    fn test_parser_rejects_oversized() {
        let mut parser = FrameParser::new(4);
        let frame = encode_frame(1, &[0; 5]);
        let results: Vec<_> = frame[..4].iter().map(|b| parser.feed(*b)).collect();
        assert_eq!(results[3], Feed::TooLarge { len: 5 });
    }

    #[test]
    fn test_exchange_advances_sequence() {
        let mut answers = encode_frame(1, &[0x01, 0x00]);
        answers.extend(encode_frame(2, &[0x03, 0x00, 0x02]));
        let mut f = framer(&answers);

        assert_eq!(f.exchange(&[0x01], 16).unwrap(), vec![0x01, 0x00]);
        assert_eq!(f.sequence(), 2);
        assert_eq!(f.exchange(&[0x03, 0x90], 16).unwrap(), vec![0x03, 0x00, 0x02]);
        assert_eq!(f.sequence(), 3);

        let written = &f.transport_mut().written;
        assert_eq!(&written[..7], &encode_frame(1, &[0x01])[..]);
        assert_eq!(&written[7..], &encode_frame(2, &[0x03, 0x90])[..]);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut f = framer(&encode_frame(255, &[0x01, 0x00]));
        for _ in 0..254 {
            f.sequence = f.sequence.wrapping_add(1);
        }
        assert_eq!(f.sequence(), 255);
        f.receive(16).unwrap();
        assert_eq!(f.sequence(), 0);
    }

    #[test]
    fn test_corrupted_checksum_is_rejected() {
        let mut frame = encode_frame(1, &[0x01, 0x00]);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let mut f = framer(&frame);
        assert!(matches!(f.receive(16), Err(Stk500Error::ChecksumMismatch)));
        assert_eq!(f.sequence(), 1);
    }

    #[test]
    fn test_any_corrupted_byte_is_rejected() {
        let body = [0x10, 0x00, 0x55, 0xAA];
        let frame = encode_frame(1, &body);
        for index in 0..frame.len() {
            for mask in 1..=255u8 {
                let mut corrupted = frame.clone();
                corrupted[index] ^= mask;
                let mut f = framer(&corrupted);
                let result = f.receive(16);
                assert!(
                    result.is_err(),
                    "byte {} ^ 0x{:02X} accepted as {:?}",
                    index,
                    mask,
                    result
                );
                assert_eq!(f.sequence(), 1);
            }
        }

        let mut f = framer(&frame);
        assert_eq!(f.receive(16).unwrap(), body);
    }

    #[test]
    fn test_stale_frame_then_timeout() {
        // Only an answer to an older request arrives
        let mut f = framer(&encode_frame(5, &[0x01, 0x00]));
        f.sequence = 6;
        assert!(matches!(f.receive(16), Err(Stk500Error::Timeout)));
        assert_eq!(f.sequence(), 6);
    }

    #[test]
    fn test_stale_frame_then_current() {
        let mut input = encode_frame(5, &[0x01, 0x00]);
        input.extend(encode_frame(6, &[0x02, 0x00]));
        let mut f = framer(&input);
        f.sequence = 6;
        assert_eq!(f.receive(16).unwrap(), vec![0x02, 0x00]);
    }

    #[test]
    fn test_peer_checksum_error() {
        let mut f = framer(&encode_frame(1, &[ANSWER_CKSUM_ERROR, 0xC1]));
        assert!(matches!(
            f.receive(16),
            Err(Stk500Error::PeerChecksumError)
        ));
    }

    #[test]
    fn test_empty_input_times_out() {
        let mut f = framer(&[]);
        assert!(matches!(f.receive(16), Err(Stk500Error::Timeout)));
    }
}
