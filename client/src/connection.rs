//! The framed request/response engine.
//!
//! One command is in flight at a time: `execute` writes a full request
//! (frame, optional trailer, optional stream body) and reads back the
//! complete reply before returning. Sideband streams borrow the
//! connection exclusively, so the borrow checker rules out interleaved
//! commands.

use std::io::{Read, Write};
use std::sync::Arc;

use tracing::{debug, warn};

use boxtin_protocol::{
    Error, Header, Reply, Request, ServerErrorKind, WireRecord, HANDSHAKE_LEN, HANDSHAKE_MAGIC,
    STREAM_FRAME,
};

use crate::blocks::WEAK_CHECKSUM_TOLERANCE;
use crate::crypto::CipherSuite;
use crate::stream::StreamReader;

pub struct Connection<T> {
    pub(crate) transport: T,
    pub(crate) crypt: Arc<CipherSuite>,
    handshaken: bool,
    pub(crate) weak_checksum_tolerance: u16,
}

impl<T: Read + Write> Connection<T> {
    pub fn new(transport: T, crypt: Arc<CipherSuite>) -> Self {
        Self {
            transport,
            crypt,
            handshaken: false,
            weak_checksum_tolerance: WEAK_CHECKSUM_TOLERANCE,
        }
    }

    pub fn cipher(&self) -> &Arc<CipherSuite> {
        &self.crypt
    }

    /// Per-half tolerance applied when verifying rolling checksums on
    /// read.
    pub fn set_weak_checksum_tolerance(&mut self, tolerance: u16) {
        self.weak_checksum_tolerance = tolerance;
    }

    /// Both sides send the zero-padded magic and expect it echoed
    /// byte-for-byte before the first command.
    fn handshake(&mut self) -> Result<(), Error> {
        let mut hello = [0u8; HANDSHAKE_LEN];
        hello[..HANDSHAKE_MAGIC.len()].copy_from_slice(HANDSHAKE_MAGIC);
        self.transport.write_all(&hello)?;
        self.transport.flush()?;
        let mut reply = [0u8; HANDSHAKE_LEN];
        self.transport.read_exact(&mut reply)?;
        if reply != hello {
            return Err(Error::HandshakeFailed);
        }
        debug!("handshake complete");
        Ok(())
    }

    /// Sends one request and reads back its reply.
    ///
    /// `trailer` is appended to the request frame (and counted by its
    /// size field); `stream_body` is sent as a separate stream frame
    /// between the request and the reply. An error reply is mapped to
    /// [`Error::Server`]; the session stays usable afterwards.
    pub fn execute<R: Request>(
        &mut self,
        request: &R,
        trailer: Option<&[u8]>,
        stream_body: Option<&[u8]>,
    ) -> Result<Reply, Error> {
        if !self.handshaken {
            self.handshake()?;
            self.handshaken = true;
        }

        let trailer_len = trailer.map_or(0, <[u8]>::len);
        let header = Header {
            size: (Header::WIRE_SIZE + R::WIRE_SIZE + trailer_len) as u32,
            command: R::CODE,
        };
        let mut frame = Vec::with_capacity(header.size as usize);
        header.encode_into(&mut frame);
        request.encode_into(&mut frame);
        if let Some(trailer) = trailer {
            frame.extend_from_slice(trailer);
        }
        self.transport.write_all(&frame)?;
        debug!(command = R::CODE, size = header.size, "sent command");

        if let Some(body) = stream_body {
            let stream_header = Header {
                size: body.len() as u32,
                command: STREAM_FRAME,
            };
            self.transport.write_all(&stream_header.encode())?;
            self.transport.write_all(body)?;
            debug!(len = body.len(), "sent stream body");
        }
        self.transport.flush()?;

        let header = self.read_header()?;
        debug!(command = header.command, size = header.size, "received reply");
        if header.command != 0 && header.command != R::REPLY_CODE {
            return Err(Error::UnexpectedReply {
                got: header.command,
                expected: R::REPLY_CODE,
            });
        }
        if (header.size as usize) < Header::WIRE_SIZE {
            return Err(Error::ProtocolViolation(format!(
                "reply frame size {} is smaller than its own header",
                header.size
            )));
        }
        let mut body = vec![0u8; header.size as usize - Header::WIRE_SIZE];
        self.transport.read_exact(&mut body)?;

        let (reply, used) = Reply::decode(header.command, &body).map_err(|err| match err {
            Error::EndOfStream => Error::ProtocolViolation(format!(
                "reply body for code {} is truncated",
                header.command
            )),
            other => other,
        })?;
        if used < body.len() {
            warn!(
                code = header.command,
                surplus = body.len() - used,
                "reply frame carries surplus bytes"
            );
        }

        if let Reply::Error(body) = reply {
            let kind = ServerErrorKind::from_wire(body.error_type, body.error_subtype);
            debug!(%kind, "command failed on the store");
            return Err(Error::Server(kind));
        }
        Ok(reply)
    }

    /// Reads the stream frame that certain replies announce. The
    /// returned reader must be fully consumed (or drained) before the
    /// next command.
    pub fn get_stream(&mut self) -> Result<StreamReader<'_, T>, Error> {
        let header = self.read_header()?;
        if header.command != STREAM_FRAME {
            return Err(Error::ProtocolViolation(format!(
                "expected a stream frame, got command {}",
                header.command
            )));
        }
        debug!(len = header.size, "reading stream");
        Ok(StreamReader::new(&mut self.transport, header.size))
    }

    fn read_header(&mut self) -> Result<Header, Error> {
        let mut raw = [0u8; Header::WIRE_SIZE];
        self.transport.read_exact(&mut raw)?;
        Header::decode(&raw)
    }
}
