use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::BodyMode;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const LINE_LIMIT_BYTES: usize = 8 * 1024;

/// A stream plus the bytes read past the last consumed message boundary.
/// All parsing in this crate consumes from `read_buf` first, so pipelined
/// bytes survive across heads, bodies and keep-alive exchanges.
pub struct BufferedStream<S> {
    pub stream: S,
    pub read_buf: Vec<u8>,
}

impl<S> BufferedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    /// Pull one read off the socket into the buffer. Zero means EOF.
    async fn refill(&mut self) -> io::Result<usize> {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        let count = self.stream.read(&mut chunk).await?;
        self.read_buf.extend_from_slice(&chunk[..count]);
        Ok(count)
    }

    /// Read up to and including the head terminator. `Ok(None)` means the
    /// peer closed cleanly before sending anything. Already-scanned bytes
    /// are not rescanned on the next refill.
    pub async fn read_head(&mut self, max_bytes: usize) -> io::Result<Option<Vec<u8>>> {
        let mut scanned = 0_usize;
        loop {
            if let Some(offset) = self.read_buf[scanned..]
                .windows(4)
                .position(|window| window == b"\r\n\r\n")
            {
                let end = scanned + offset + 4;
                return Ok(Some(self.read_buf.drain(..end).collect()));
            }
            scanned = self.read_buf.len().saturating_sub(3);

            if self.read_buf.len() > max_bytes {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "message head exceeded configured limit",
                ));
            }
            if self.refill().await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-head",
                ));
            }
        }
    }

    /// One CRLF-terminated line, terminator included.
    async fn take_line(&mut self) -> io::Result<Vec<u8>> {
        let mut scanned = 0_usize;
        loop {
            if let Some(offset) = self.read_buf[scanned..]
                .windows(2)
                .position(|window| window == b"\r\n")
            {
                let end = scanned + offset + 2;
                return Ok(self.read_buf.drain(..end).collect());
            }
            scanned = self.read_buf.len().saturating_sub(1);

            if self.read_buf.len() > LINE_LIMIT_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "body framing line exceeded limit",
                ));
            }
            if self.refill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-line",
                ));
            }
        }
    }
}

/// A fully decoded body prefix and whether the body ended within it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBody {
    pub bytes: Vec<u8>,
    pub complete: bool,
}

enum ReaderState {
    Done,
    Sized { left: u64 },
    ChunkHeader,
    InChunk { left: u64 },
    Drain,
}

/// Incremental body engine driving one message body in either of two modes:
/// [`read_decoded`](Self::read_decoded) yields payload bytes with the
/// transfer framing stripped (for buffering and inspection), while
/// [`copy_raw_to`](Self::copy_raw_to) forwards the body in its original
/// framing (the zero-copy pass-through path). Both run the same state
/// machine, so a body is consumed exactly once either way.
pub struct BodyReader<'a, S> {
    source: &'a mut BufferedStream<S>,
    state: ReaderState,
}

impl<'a, S: AsyncRead + Unpin> BodyReader<'a, S> {
    pub fn new(source: &'a mut BufferedStream<S>, mode: BodyMode) -> Self {
        let state = match mode {
            BodyMode::None => ReaderState::Done,
            BodyMode::ContentLength(0) => ReaderState::Done,
            BodyMode::ContentLength(length) => ReaderState::Sized { left: length },
            BodyMode::Chunked => ReaderState::ChunkHeader,
            BodyMode::CloseDelimited => ReaderState::Drain,
        };
        Self { source, state }
    }

    /// Next run of decoded payload bytes; zero means the body is complete.
    pub async fn read_decoded(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.state {
                ReaderState::Done => return Ok(0),
                ReaderState::Sized { left } => {
                    let taken = self.take_payload(buf, left, "sized body").await?;
                    self.state = match left - taken as u64 {
                        0 => ReaderState::Done,
                        remaining => ReaderState::Sized { left: remaining },
                    };
                    return Ok(taken);
                }
                ReaderState::ChunkHeader => {
                    if !self.begin_chunk().await? {
                        self.discard_trailers().await?;
                        self.state = ReaderState::Done;
                        return Ok(0);
                    }
                }
                ReaderState::InChunk { left } => {
                    let taken = self.take_payload(buf, left, "chunk data").await?;
                    self.state = match left - taken as u64 {
                        0 => {
                            self.finish_chunk().await?;
                            ReaderState::ChunkHeader
                        }
                        remaining => ReaderState::InChunk { left: remaining },
                    };
                    return Ok(taken);
                }
                ReaderState::Drain => {
                    if self.source.read_buf.is_empty() && self.source.refill().await? == 0 {
                        self.state = ReaderState::Done;
                        return Ok(0);
                    }
                    let take = buf.len().min(self.source.read_buf.len());
                    buf[..take].copy_from_slice(&self.source.read_buf[..take]);
                    self.source.read_buf.drain(..take);
                    return Ok(take);
                }
            }
        }
    }

    /// Decode up to `cap` bytes into memory. `complete` is false when the
    /// cap was reached first, in which case the reader can keep draining the
    /// remainder with [`read_decoded`](Self::read_decoded).
    pub async fn read_to_cap(&mut self, cap: usize) -> io::Result<DecodedBody> {
        let mut bytes = Vec::new();
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            let count = self.read_decoded(&mut chunk).await?;
            if count == 0 {
                return Ok(DecodedBody {
                    bytes,
                    complete: true,
                });
            }
            bytes.extend_from_slice(&chunk[..count]);
            if bytes.len() > cap {
                return Ok(DecodedBody {
                    bytes,
                    complete: false,
                });
            }
        }
    }

    /// Forward the body byte-for-byte, chunk framing and trailers included.
    /// Returns the payload byte count (framing excluded).
    pub async fn copy_raw_to<W: AsyncWrite + Unpin>(&mut self, sink: &mut W) -> io::Result<u64> {
        let mut payload = 0_u64;
        loop {
            match self.state {
                ReaderState::Done => return Ok(payload),
                ReaderState::Sized { left } => {
                    let copied = self.copy_payload(sink, left, "sized body").await?;
                    payload += copied;
                    self.state = match left - copied {
                        0 => ReaderState::Done,
                        remaining => ReaderState::Sized { left: remaining },
                    };
                }
                ReaderState::ChunkHeader => {
                    if !self.begin_chunk_raw(sink).await? {
                        self.forward_trailers(sink).await?;
                        self.state = ReaderState::Done;
                    }
                }
                ReaderState::InChunk { left } => {
                    let copied = self.copy_payload(sink, left, "chunk data").await?;
                    payload += copied;
                    self.state = match left - copied {
                        0 => {
                            let terminator = self.source.take_line().await?;
                            if terminator != b"\r\n" {
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    "chunk data not followed by CRLF",
                                ));
                            }
                            sink.write_all(&terminator).await?;
                            ReaderState::ChunkHeader
                        }
                        remaining => ReaderState::InChunk { left: remaining },
                    };
                }
                ReaderState::Drain => {
                    if self.source.read_buf.is_empty() && self.source.refill().await? == 0 {
                        self.state = ReaderState::Done;
                        continue;
                    }
                    sink.write_all(&self.source.read_buf).await?;
                    payload += self.source.read_buf.len() as u64;
                    self.source.read_buf.clear();
                }
            }
        }
    }

    /// Copy buffered payload into `buf`, refilling once if the buffer is
    /// empty. EOF inside a counted region is a truncation error.
    async fn take_payload(
        &mut self,
        buf: &mut [u8],
        left: u64,
        what: &'static str,
    ) -> io::Result<usize> {
        if self.source.read_buf.is_empty() && self.source.refill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("peer closed inside {what}"),
            ));
        }
        let take = buf
            .len()
            .min(self.source.read_buf.len())
            .min(left as usize);
        buf[..take].copy_from_slice(&self.source.read_buf[..take]);
        self.source.read_buf.drain(..take);
        Ok(take)
    }

    /// Stream up to `left` buffered payload bytes into `sink`.
    async fn copy_payload<W: AsyncWrite + Unpin>(
        &mut self,
        sink: &mut W,
        left: u64,
        what: &'static str,
    ) -> io::Result<u64> {
        if self.source.read_buf.is_empty() && self.source.refill().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("peer closed inside {what}"),
            ));
        }
        let take = self.source.read_buf.len().min(left as usize);
        sink.write_all(&self.source.read_buf[..take]).await?;
        self.source.read_buf.drain(..take);
        Ok(take as u64)
    }

    /// Read the next chunk-size line. True when a data chunk follows, false
    /// on the final zero-size chunk.
    async fn begin_chunk(&mut self) -> io::Result<bool> {
        let line = self.source.take_line().await?;
        let size = chunk_size_of(&line)?;
        if size == 0 {
            return Ok(false);
        }
        self.state = ReaderState::InChunk { left: size };
        Ok(true)
    }

    async fn begin_chunk_raw<W: AsyncWrite + Unpin>(&mut self, sink: &mut W) -> io::Result<bool> {
        let line = self.source.take_line().await?;
        let size = chunk_size_of(&line)?;
        sink.write_all(&line).await?;
        if size == 0 {
            return Ok(false);
        }
        self.state = ReaderState::InChunk { left: size };
        Ok(true)
    }

    /// Consume the CRLF terminator that follows a chunk's data bytes.
    async fn finish_chunk(&mut self) -> io::Result<()> {
        let terminator = self.source.take_line().await?;
        if terminator != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk data not followed by CRLF",
            ));
        }
        Ok(())
    }

    /// Trailer section after the zero chunk: header lines up to a bare CRLF.
    async fn discard_trailers(&mut self) -> io::Result<()> {
        loop {
            if self.source.take_line().await? == b"\r\n" {
                return Ok(());
            }
        }
    }

    async fn forward_trailers<W: AsyncWrite + Unpin>(&mut self, sink: &mut W) -> io::Result<()> {
        loop {
            let line = self.source.take_line().await?;
            sink.write_all(&line).await?;
            if line == b"\r\n" {
                return Ok(());
            }
        }
    }
}

fn chunk_size_of(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size is not UTF-8"))?;
    let digits = match text.find(';') {
        Some(extension_start) => &text[..extension_start],
        None => text,
    };
    u64::from_str_radix(digits.trim(), 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk size is not valid hex"))
}
