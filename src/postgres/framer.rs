//! Incremental message framing.
//!
//! Slices the incoming byte stream into `{type, body}` frames. The buffer is
//! arena style: socket reads append at the tail, consumed frames split off
//! the head, and `BytesMut` reclaims the consumed region once outstanding
//! frame bodies are dropped.
use bytes::{Buf, BytesMut};

use super::error::ProtocolError;

/// A raw backend frame: message type octet and body.
///
/// The four byte length prefix is consumed by the framer; `body` holds
/// `length - 4` bytes.
#[derive(Debug)]
pub struct Frame {
    pub kind: u8,
    pub body: bytes::Bytes,
}

/// A frame yielded while the connection is in COPY-out mode.
///
/// COPY data frames are passed through without element decoding. The first
/// frame whose kind is not `CopyData` suspends the copy scan; the caller
/// dispatches it through the ordinary path and switches modes back.
#[derive(Debug)]
pub enum CopyFrame {
    /// Body of a `CopyData` (`d`) frame.
    Data(bytes::Bytes),
    /// First non-COPY-data frame; copy scan is over.
    Final(Frame),
}

/// Splits a growing byte buffer into postgres frames.
#[derive(Debug, Default)]
pub struct Framer {
    buf: BytesMut,
}

/// msgtype + length
const HEADER: usize = 1 + 4;

impl Framer {
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(1024) }
    }

    /// The fill side of the buffer. Socket reads append here.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Returns `true` if any unconsumed bytes are buffered.
    ///
    /// Buffered bytes may be an incomplete frame; use [`next_frame`][1] to
    /// find out.
    ///
    /// [1]: Framer::next_frame
    pub fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Feed bytes by copying. Reads normally go through [`buffer_mut`][1]
    /// instead.
    ///
    /// [1]: Framer::buffer_mut
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Split off the next complete frame, if the buffer holds one.
    ///
    /// Feeding the stream one byte at a time yields the exact same frames
    /// as feeding it whole.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        let Some(mut header) = self.buf.get(..HEADER) else {
            return Ok(None);
        };

        let kind = header.get_u8();
        let len = header.get_i32();

        if len < 4 {
            return Err(ProtocolError::invalid_header(len));
        }

        let body_len = len as usize - 4;
        if self.buf.len() < HEADER + body_len {
            // remember how much is still missing so the next read can
            // size its buffer accordingly
            self.buf.reserve(HEADER + body_len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(HEADER);
        let body = self.buf.split_to(body_len).freeze();
        Ok(Some(Frame { kind, body }))
    }

    /// Split off the next frame under the COPY-data predicate.
    ///
    /// `CopyData` bodies are yielded without decoding; any other kind
    /// suspends the scan and surfaces the frame whole.
    pub fn next_copy_frame(&mut self) -> Result<Option<CopyFrame>, ProtocolError> {
        Ok(self.next_frame()?.map(|frame| match frame.kind {
            b'd' => CopyFrame::Data(frame.body),
            _ => CopyFrame::Final(frame),
        }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BufMut;

    fn frame(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(kind);
        buf.put_i32(4 + body.len() as i32);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn splits_concatenated_frames_in_order() {
        let mut wire = Vec::new();
        wire.extend(frame(b'1', b""));
        wire.extend(frame(b'T', b"some description"));
        wire.extend(frame(b'Z', b"I"));

        let mut framer = Framer::new();
        framer.extend_from_slice(&wire);

        let f = framer.next_frame().unwrap().unwrap();
        assert_eq!((f.kind, &f.body[..]), (b'1', &b""[..]));
        let f = framer.next_frame().unwrap().unwrap();
        assert_eq!((f.kind, &f.body[..]), (b'T', &b"some description"[..]));
        let f = framer.next_frame().unwrap().unwrap();
        assert_eq!((f.kind, &f.body[..]), (b'Z', &b"I"[..]));
        assert!(framer.next_frame().unwrap().is_none());
        assert!(!framer.has_buffered());
    }

    #[test]
    fn byte_at_a_time_equals_whole_feed() {
        let mut wire = Vec::new();
        wire.extend(frame(b'C', b"SELECT 3\0"));
        wire.extend(frame(b'Z', b"T"));
        wire.extend(frame(b'D', &[0, 1, 0, 0, 0, 2, b'o', b'k']));

        let mut whole = Framer::new();
        whole.extend_from_slice(&wire);
        let mut expected = Vec::new();
        while let Some(f) = whole.next_frame().unwrap() {
            expected.push((f.kind, f.body.to_vec()));
        }

        let mut trickle = Framer::new();
        let mut got = Vec::new();
        for byte in &wire {
            trickle.extend_from_slice(std::slice::from_ref(byte));
            while let Some(f) = trickle.next_frame().unwrap() {
                got.push((f.kind, f.body.to_vec()));
            }
        }

        assert_eq!(expected.len(), 3);
        assert_eq!(got, expected);
    }

    #[test]
    fn invalid_length_is_fatal() {
        let mut framer = Framer::new();
        framer.extend_from_slice(&[b'Q', 0, 0, 0, 3]);
        assert!(matches!(
            framer.next_frame(),
            Err(ProtocolError::InvalidHeader { len: 3 })
        ));
    }

    #[test]
    fn copy_scan_suspends_on_terminator() {
        let mut wire = Vec::new();
        wire.extend(frame(b'd', b"1\tfoo\n"));
        wire.extend(frame(b'd', b"2\tbar\n"));
        wire.extend(frame(b'c', b""));
        wire.extend(frame(b'C', b"COPY 2\0"));

        let mut framer = Framer::new();
        framer.extend_from_slice(&wire);

        let CopyFrame::Data(one) = framer.next_copy_frame().unwrap().unwrap() else {
            panic!("expected data")
        };
        assert_eq!(&one[..], b"1\tfoo\n");
        let CopyFrame::Data(_) = framer.next_copy_frame().unwrap().unwrap() else {
            panic!("expected data")
        };
        let CopyFrame::Final(done) = framer.next_copy_frame().unwrap().unwrap() else {
            panic!("expected final")
        };
        assert_eq!(done.kind, b'c');

        // scan suspended; ordinary framing resumes
        let complete = framer.next_frame().unwrap().unwrap();
        assert_eq!(complete.kind, b'C');
    }
}
