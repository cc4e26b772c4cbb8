//! Blocking framed stream.
//!
//! [`FramedStream`] wraps any `Read + Write` byte stream and exchanges
//! complete frames: a [`PacketHeader`] followed by exactly `header.size`
//! payload bytes. The declared size is validated against
//! [`MAX_FRAME_SIZE`] *before* the payload buffer is allocated, so a
//! corrupt or hostile peer cannot force an oversized allocation.

use std::io::{ErrorKind, Read, Write};

use super::error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
use super::{PacketHeader, PacketKind, HEADER_LEN};

/// A framed view over a blocking byte stream.
///
/// One `send` or `recv` call moves exactly one frame. The stream is
/// flushed after every send so a request is fully on the wire before the
/// caller blocks on the response.
#[derive(Debug)]
pub struct FramedStream<S> {
    stream: S,
    max_frame_size: usize,
}

impl<S> FramedStream<S> {
    /// Wrap a stream with the default frame cap.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Wrap a stream with a custom frame cap.
    ///
    /// # Panics
    ///
    /// Panics if `max_frame_size` exceeds [`MAX_FRAME_SIZE`].
    pub fn with_max_frame_size(stream: S, max_frame_size: usize) -> Self {
        assert!(
            max_frame_size <= MAX_FRAME_SIZE,
            "max_frame_size {max_frame_size} exceeds protocol limit {MAX_FRAME_SIZE}"
        );
        Self {
            stream,
            max_frame_size,
        }
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Consume the wrapper and return the stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Write> FramedStream<S> {
    /// Send one frame.
    ///
    /// The header's `size` field is derived from `payload`; callers never
    /// set it themselves.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] for payloads beyond the
    /// frame cap, or [`ProtocolError::Io`] on stream failure.
    pub fn send(&mut self, id: u32, kind: PacketKind, payload: &[u8]) -> ProtocolResult<()> {
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(
                payload.len(),
                self.max_frame_size,
            ));
        }
        #[allow(clippy::cast_possible_truncation)] // bounded by the cap above
        let header = PacketHeader::new(id, kind, payload.len() as u32);
        self.stream.write_all(&header.encode())?;
        if !payload.is_empty() {
            self.stream.write_all(payload)?;
        }
        self.stream.flush()?;
        Ok(())
    }
}

impl<S: Read> FramedStream<S> {
    /// Receive one complete frame.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::ConnectionClosed`] if the peer hangs up at a
    ///   frame boundary or mid-frame.
    /// - [`ProtocolError::FrameTooLarge`] if the declared size exceeds the
    ///   cap; nothing is allocated in that case.
    /// - [`ProtocolError::Io`] on any other stream failure.
    pub fn recv(&mut self) -> ProtocolResult<(PacketHeader, Vec<u8>)> {
        let mut header_buf = [0u8; HEADER_LEN];
        read_exact_or_closed(&mut self.stream, &mut header_buf)?;
        let header = PacketHeader::decode(&header_buf);

        let size = header.size as usize;
        if size > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(size, self.max_frame_size));
        }

        let mut payload = vec![0u8; size];
        if size > 0 {
            read_exact_or_closed(&mut self.stream, &mut payload)?;
        }
        Ok((header, payload))
    }
}

fn read_exact_or_closed<R: Read>(stream: &mut R, buf: &mut [u8]) -> ProtocolResult<()> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(ProtocolError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn roundtrip(payload: &[u8]) -> (PacketHeader, Vec<u8>) {
        let mut tx = FramedStream::new(Cursor::new(Vec::new()));
        tx.send(3, PacketKind::TestCase, payload).unwrap();
        let bytes = tx.into_inner().into_inner();

        let mut rx = FramedStream::new(Cursor::new(bytes));
        rx.recv().unwrap()
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let (header, payload) = roundtrip(b"concrete inputs");
        assert_eq!(header.id, 3);
        assert_eq!(header.packet_kind().unwrap(), PacketKind::TestCase);
        assert_eq!(payload, b"concrete inputs");
    }

    #[test]
    fn test_empty_payload_frame() {
        let (header, payload) = roundtrip(&[]);
        assert_eq!(header.size, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_recv_rejects_oversized_frame_before_allocation() {
        let header = PacketHeader::new(1, PacketKind::Image, 64 * 1024 * 1024);
        let mut rx = FramedStream::new(Cursor::new(header.encode().to_vec()));
        let result = rx.recv();
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { max: MAX_FRAME_SIZE, .. })
        ));
    }

    #[test]
    fn test_send_rejects_oversized_payload() {
        let mut tx = FramedStream::with_max_frame_size(Cursor::new(Vec::new()), 8);
        let result = tx.send(1, PacketKind::Trace, &[0u8; 9]);
        assert!(matches!(
            result,
            Err(ProtocolError::FrameTooLarge { size: 9, max: 8 })
        ));
    }

    #[test]
    fn test_truncated_header_reports_closed_connection() {
        let mut rx = FramedStream::new(Cursor::new(vec![0u8; 5]));
        assert!(matches!(rx.recv(), Err(ProtocolError::ConnectionClosed)));
    }

    #[test]
    fn test_truncated_payload_reports_closed_connection() {
        let header = PacketHeader::new(1, PacketKind::Trace, 10);
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut rx = FramedStream::new(Cursor::new(bytes));
        assert!(matches!(rx.recv(), Err(ProtocolError::ConnectionClosed)));
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut tx = FramedStream::new(Cursor::new(Vec::new()));
        tx.send(1, PacketKind::StatusRequest, &[]).unwrap();
        tx.send(1, PacketKind::TraceRequest, &[]).unwrap();
        let bytes = tx.into_inner().into_inner();

        let mut rx = FramedStream::new(Cursor::new(bytes));
        let (first, _) = rx.recv().unwrap();
        let (second, _) = rx.recv().unwrap();
        assert_eq!(first.packet_kind().unwrap(), PacketKind::StatusRequest);
        assert_eq!(second.packet_kind().unwrap(), PacketKind::TraceRequest);
    }
}
