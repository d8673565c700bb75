//! asyncread/asyncwrite adapter over the noise transport.
//!
//! http/2 runs on top of this stream after the upgrade. reads reassemble
//! `[type:1][len:2 be][ciphertext]` record frames and decrypt them;
//! writes chunk plaintext to the frame limit and encrypt. noise frames
//! are atomic, so a partially written frame is buffered and finished
//! before any new data is accepted.

use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{error, trace};

use ironscale_proto::{MAX_PLAINTEXT_SIZE, MSG_TYPE_RECORD, NoiseTransport};

/// upper bound for the frame reassembly buffer.
///
/// a frame's length field is u16, so a single frame tops out around
/// 64 kib; headroom covers reads spanning frame boundaries.
const MAX_PENDING_FRAME_SIZE: usize = 128 * 1024;

pub(super) struct HttpNoiseStream {
    io: TokioIo<hyper::upgrade::Upgraded>,
    transport: NoiseTransport,
    /// decrypted plaintext not yet handed to the caller.
    read_buffer: BytesMut,
    /// raw bytes of a frame still being reassembled.
    pending_frame: BytesMut,
    /// an encrypted frame not yet fully written to the wire.
    write_buffer: BytesMut,
    /// plaintext bytes the buffered frame represents; reported to the
    /// caller once the frame is flushed.
    write_pending_plaintext_len: usize,
}

impl HttpNoiseStream {
    pub(super) fn new(io: TokioIo<hyper::upgrade::Upgraded>, transport: NoiseTransport) -> Self {
        Self {
            io,
            transport,
            read_buffer: BytesMut::new(),
            pending_frame: BytesMut::new(),
            write_buffer: BytesMut::new(),
            write_pending_plaintext_len: 0,
        }
    }
}

impl AsyncRead for HttpNoiseStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // hand out buffered plaintext first
        if !this.read_buffer.is_empty() {
            let len = std::cmp::min(buf.remaining(), this.read_buffer.len());
            buf.put_slice(&this.read_buffer[..len]);
            this.read_buffer.advance(len);
            return Poll::Ready(Ok(()));
        }

        loop {
            // a complete frame starts with [type:1][len:2 be]
            if this.pending_frame.len() >= 3 {
                let msg_type = this.pending_frame[0];
                let msg_len =
                    u16::from_be_bytes([this.pending_frame[1], this.pending_frame[2]]) as usize;
                let total = 3 + msg_len;

                if msg_type != MSG_TYPE_RECORD {
                    error!(
                        expected = format!("0x{MSG_TYPE_RECORD:02x}"),
                        got = format!("0x{msg_type:02x}"),
                        "unexpected noise frame type"
                    );
                    return Poll::Ready(Err(io::Error::new(
                        ErrorKind::InvalidData,
                        format!("unexpected Noise frame type 0x{msg_type:02x}"),
                    )));
                }

                if this.pending_frame.len() >= total {
                    let ciphertext = &this.pending_frame[3..total];
                    match this.transport.decrypt(ciphertext) {
                        Ok(plaintext) => {
                            this.pending_frame.advance(total);

                            let copy_len = std::cmp::min(buf.remaining(), plaintext.len());
                            buf.put_slice(&plaintext[..copy_len]);
                            if copy_len < plaintext.len() {
                                this.read_buffer.extend_from_slice(&plaintext[copy_len..]);
                            }
                            return Poll::Ready(Ok(()));
                        }
                        Err(e) => {
                            error!(error = %e, "noise decrypt failed");
                            return Poll::Ready(Err(io::Error::new(
                                ErrorKind::InvalidData,
                                format!("noise decrypt failed: {e}"),
                            )));
                        }
                    }
                }
            }

            // need more bytes from the wire
            let mut tmp = [0u8; 4096];
            let mut read_buf = ReadBuf::new(&mut tmp);
            match Pin::new(&mut this.io).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let received = read_buf.filled();
                    if received.is_empty() {
                        if this.pending_frame.is_empty() {
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            ErrorKind::UnexpectedEof,
                            "connection closed inside a Noise frame",
                        )));
                    }

                    trace!(bytes = received.len(), "noise stream read");
                    this.pending_frame.extend_from_slice(received);

                    if this.pending_frame.len() > MAX_PENDING_FRAME_SIZE {
                        return Poll::Ready(Err(io::Error::new(
                            ErrorKind::InvalidData,
                            "noise frame reassembly buffer overflow",
                        )));
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for HttpNoiseStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // a previously buffered frame must go out before new data
        if !this.write_buffer.is_empty() {
            let pending = this.write_buffer.clone();
            match Pin::new(&mut this.io).poll_write(cx, &pending) {
                Poll::Ready(Ok(written)) => {
                    this.write_buffer.advance(written);
                    if this.write_buffer.is_empty() {
                        let len = this.write_pending_plaintext_len;
                        this.write_pending_plaintext_len = 0;
                        return Poll::Ready(Ok(len));
                    }
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        // chunk to the frame limit
        let to_write = std::cmp::min(buf.len(), MAX_PLAINTEXT_SIZE);
        let ciphertext = match this.transport.encrypt(&buf[..to_write]) {
            Ok(ct) => ct,
            Err(e) => {
                error!(error = %e, "noise encrypt failed");
                return Poll::Ready(Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!("noise encrypt failed: {e}"),
                )));
            }
        };

        let mut frame = BytesMut::with_capacity(3 + ciphertext.len());
        frame.extend_from_slice(&[MSG_TYPE_RECORD]);
        frame.extend_from_slice(&(ciphertext.len() as u16).to_be_bytes());
        frame.extend_from_slice(&ciphertext);

        let frame_len = frame.len();
        match Pin::new(&mut this.io).poll_write(cx, &frame) {
            Poll::Ready(Ok(written)) => {
                if written == frame_len {
                    Poll::Ready(Ok(to_write))
                } else {
                    // the frame is atomic: buffer the rest
                    frame.advance(written);
                    this.write_buffer = frame;
                    this.write_pending_plaintext_len = to_write;
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                this.write_buffer = frame;
                this.write_pending_plaintext_len = to_write;
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while !this.write_buffer.is_empty() {
            let pending = this.write_buffer.clone();
            match Pin::new(&mut this.io).poll_write(cx, &pending) {
                Poll::Ready(Ok(written)) => {
                    this.write_buffer.advance(written);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        this.write_pending_plaintext_len = 0;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
