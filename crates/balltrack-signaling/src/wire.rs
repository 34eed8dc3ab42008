//! Length-prefixed JSON framing.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::message::WireMessage;

/// Largest body accepted from the peer.
pub const MAX_MESSAGE_BYTES: usize = 1_048_576;

pub(crate) async fn write_msg(
    stream: &mut (impl AsyncWrite + Unpin),
    msg: &WireMessage,
) -> io::Result<()> {
    let json = serde_json::to_vec(msg).map_err(io::Error::other)?;
    let len = json.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&json).await?;
    stream.flush().await?;
    debug!("Sent {} ({} bytes)", msg.kind(), json.len());
    Ok(())
}

/// Reads one body. `Ok(None)` when the peer closed cleanly between messages.
pub(crate) async fn read_frame(stream: &mut (impl AsyncRead + Unpin)) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes"),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub(crate) fn decode(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let sent = WireMessage::Answer { sdp: "x".repeat(200) };
        let writer = tokio::spawn(async move {
            write_msg(&mut a, &sent).await.unwrap();
            write_msg(&mut a, &WireMessage::Bye).await.unwrap();
        });

        let first = decode(&read_frame(&mut b).await.unwrap().unwrap()).unwrap();
        assert!(matches!(first, WireMessage::Answer { ref sdp } if sdp.len() == 200));
        let second = decode(&read_frame(&mut b).await.unwrap().unwrap()).unwrap();
        assert_eq!(second, WireMessage::Bye);
        writer.await.unwrap();
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(16);
        a.write_all(&(MAX_MESSAGE_BYTES as u32 + 1).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
