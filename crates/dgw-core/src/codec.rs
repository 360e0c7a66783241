//! Length-prefixed framing for the device control stream.
//!
//! Wire format: `[4-byte big-endian length][version byte][type byte][JSON payload]`

use crate::error::{GatewayError, GatewayResult};
use crate::messages::{Message, MsgType, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size (1 MiB). Larger frames are a fatal protocol error.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encode a message into a full frame (length prefix included).
pub fn encode_message(msg: &Message) -> GatewayResult<Vec<u8>> {
    let body_len = 2 + msg.payload.len();
    if body_len > MAX_FRAME_SIZE {
        return Err(GatewayError::Codec(format!(
            "frame too large: {body_len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut frame = Vec::with_capacity(4 + body_len);
    frame.extend_from_slice(&(body_len as u32).to_be_bytes());
    frame.push(msg.version);
    frame.push(msg.msg_type.into());
    frame.extend_from_slice(&msg.payload);
    Ok(frame)
}

/// Decode a frame body (without the length prefix) into a message.
pub fn decode_body(body: &[u8]) -> GatewayResult<Message> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(GatewayError::Codec(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            body.len()
        )));
    }
    if body.len() < 2 {
        return Err(GatewayError::Codec("frame too short".into()));
    }

    let version = body[0];
    if version != PROTOCOL_VERSION {
        return Err(GatewayError::Codec(format!(
            "unsupported protocol version: {version}"
        )));
    }

    let msg_type = MsgType::try_from(body[1]).map_err(|_| GatewayError::UnknownType(body[1]))?;

    Ok(Message {
        version,
        msg_type,
        payload: body[2..].to_vec(),
    })
}

/// Read one framed message from the stream.
///
/// On [`GatewayError::UnknownType`] the frame has been fully consumed and the
/// stream is still aligned; every other error is fatal to the connection.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> GatewayResult<Message> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(GatewayError::Codec(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    decode_body(&body)
}

/// Write one framed message to the stream and flush it.
///
/// The frame is built in a single buffer and written with one `write_all`, so
/// a frame is never interleaved with another as long as the caller serialises
/// writes (the session write lock).
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> GatewayResult<()> {
    let frame = encode_message(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AckPayload, PingPayload};

    #[tokio::test]
    async fn round_trip_single() {
        let msg = Message::new(MsgType::Ping, &PingPayload { timestamp: 42 }).unwrap();
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_message(&mut client, &msg).await.unwrap();
        let decoded = read_message(&mut server).await.unwrap();

        assert_eq!(decoded, msg);
        let ping: PingPayload = decoded.decode_payload().unwrap();
        assert_eq!(ping.timestamp, 42);
    }

    #[tokio::test]
    async fn round_trip_multiple() {
        let msgs: Vec<Message> = (0..3)
            .map(|i| {
                Message::new(
                    MsgType::Ack,
                    &AckPayload {
                        cmd_id: format!("cmd-{i}"),
                        status: "ok".into(),
                        detail: String::new(),
                    },
                )
                .unwrap()
            })
            .collect();

        let (mut client, mut server) = tokio::io::duplex(4096);
        for m in &msgs {
            write_message(&mut client, m).await.unwrap();
        }
        for m in &msgs {
            let decoded = read_message(&mut server).await.unwrap();
            assert_eq!(&decoded, m);
        }
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Hand-written length prefix claiming 2 MiB.
        let len = (2 * 1024 * 1024u32).to_be_bytes();
        client.write_all(&len).await.unwrap();

        let err = read_message(&mut server).await.unwrap_err();
        assert!(matches!(err, GatewayError::Codec(_)));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let msg = Message {
            version: PROTOCOL_VERSION,
            msg_type: MsgType::Report,
            payload: vec![0u8; MAX_FRAME_SIZE],
        };
        assert!(encode_message(&msg).is_err());
    }

    #[test]
    fn rejects_bad_version() {
        let body = [9u8, 3, b'{', b'}'];
        let err = decode_body(&body).unwrap_err();
        assert!(matches!(err, GatewayError::Codec(_)));
    }

    #[test]
    fn rejects_short_body() {
        assert!(decode_body(&[1u8]).is_err());
        assert!(decode_body(&[]).is_err());
    }

    #[test]
    fn unknown_type_is_distinguishable() {
        let body = [PROTOCOL_VERSION, 99, b'{', b'}'];
        let err = decode_body(&body).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownType(99)));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(&[1u8, 3]).await.unwrap();
        drop(client);

        assert!(read_message(&mut server).await.is_err());
    }
}
