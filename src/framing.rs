//! Framed reader: the only synchronization point between the Passport
//! codec and the TCP layer.

use tokio::io::AsyncReadExt;

use crate::error::ProxyError;

/// Read exactly `n` bytes from `stream`, or fail with
/// [`ProxyError::StreamClosed`] if the peer hangs up before all of them
/// arrive.
pub async fn read_exact<S>(stream: &mut S, n: usize) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncReadExt + Unpin,
{
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        let read = stream.read(&mut buf[filled..]).await?;
        if read == 0 {
            return Err(ProxyError::StreamClosed {
                expected: n,
                got: filled,
            });
        }
        filled += read;
    }
    Ok(buf)
}

/// Read one complete Passport frame (header + payload) off `stream`.
///
/// Composes [`read_exact`] with [`passport_protocol::decode_header`]:
/// read the fixed 28-byte header, validate it, then read exactly
/// `payload_length` more bytes.
pub async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>, ProxyError>
where
    S: AsyncReadExt + Unpin,
{
    let mut header_bytes = read_exact(stream, passport_protocol::HEADER_LEN).await?;
    let header = passport_protocol::decode_header(&header_bytes)?;
    let payload = read_exact(stream, header.payload_length as usize).await?;
    header_bytes.extend_from_slice(&payload);
    Ok(header_bytes)
}
