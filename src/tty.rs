//! Decoding of the multiplexed stdout/stderr streams returned by the logs
//! and exec endpoints.
//!
//! Each frame starts with an 8 byte header: the stream type, three zero
//! bytes and the big endian payload length.

use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use futures_util::{
    io::{AsyncRead, AsyncReadExt},
    stream::{Stream, TryStreamExt},
};
use hyper::body::Bytes;
use std::io;

#[derive(Debug, Clone, PartialEq)]
pub enum TtyChunk {
    StdIn(Vec<u8>),
    StdOut(Vec<u8>),
    StdErr(Vec<u8>),
}

async fn decode_chunk<S>(mut stream: S) -> Option<(Result<TtyChunk>, S)>
where
    S: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; 8];

    match stream.read_exact(&mut header_bytes).await {
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
        Err(e) => return Some((Err(Error::IO(e)), stream)),
        _ => (),
    }

    let data_length = BigEndian::read_u32(&header_bytes[4..]);

    let mut data = vec![0u8; data_length as usize];

    if stream.read_exact(&mut data).await.is_err() {
        return None;
    }

    let chunk = match header_bytes[0] {
        0 => TtyChunk::StdIn(data),
        1 => TtyChunk::StdOut(data),
        2 => TtyChunk::StdErr(data),
        n => {
            return Some((
                Err(Error::InvalidResponse(format!(
                    "invalid stream number from docker daemon: '{}'",
                    n
                ))),
                stream,
            ))
        }
    };

    Some((Ok(chunk), stream))
}

pub fn decode<S>(hyper_chunk_stream: S) -> impl Stream<Item = Result<TtyChunk>>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let stream = hyper_chunk_stream
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .into_async_read();

    futures_util::stream::unfold(stream, decode_chunk)
}
