// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Forge Authors – https://github.com/forge-jit/forge

use forge_model::{Message, MessageType};
use rkyv::Deserialize as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::StreamError;

/// Frame layout: `u32 length | u32 type | u64 version_tag | payload`.
/// `length` counts everything after itself (type + version + payload).
const HEADER_AFTER_LEN: usize = 4 + 8;

/// Compiled method bodies and ROM class payloads dominate frame sizes;
/// anything beyond this is corruption, not data.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

pub struct RawFrame {
    pub message_type: MessageType,
    pub version_tag: u64,
    pub payload: Vec<u8>,
}

pub async fn write_frame<W>(io: &mut W, message: &Message, version_tag: u64) -> Result<(), StreamError>
where
    W: AsyncWrite + Unpin,
{
    let payload = rkyv::to_bytes::<_, 1024>(message)
        .map_err(|e| StreamError::Corrupt(format!("serialize: {e}")))?;

    let len = (HEADER_AFTER_LEN + payload.len()) as u32;
    io.write_all(&len.to_le_bytes()).await?;
    io.write_all(&(message.message_type() as u32).to_le_bytes()).await?;
    io.write_all(&version_tag.to_le_bytes()).await?;
    io.write_all(&payload).await?;
    io.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(io: &mut R) -> Result<RawFrame, StreamError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len < HEADER_AFTER_LEN || len > MAX_FRAME_LEN {
        return Err(StreamError::Corrupt(format!("frame length {len}")));
    }

    let mut type_buf = [0u8; 4];
    io.read_exact(&mut type_buf).await?;
    let raw_type = u32::from_le_bytes(type_buf);
    let message_type = MessageType::from_u32(raw_type)
        .ok_or_else(|| StreamError::Corrupt(format!("unknown message type {raw_type}")))?;

    let mut version_buf = [0u8; 8];
    io.read_exact(&mut version_buf).await?;
    let version_tag = u64::from_le_bytes(version_buf);

    let mut payload = vec![0u8; len - HEADER_AFTER_LEN];
    io.read_exact(&mut payload).await?;

    Ok(RawFrame { message_type, version_tag, payload })
}

impl RawFrame {
    /// Decodes the payload and checks that the decoded variant agrees with
    /// the header tag; a disagreement means the peer framed a different
    /// message than it announced.
    pub fn decode(&self) -> Result<Message, StreamError> {
        let archived = rkyv::check_archived_root::<Message>(&self.payload)
            .map_err(|e| StreamError::Corrupt(format!("payload validation: {e:?}")))?;
        let message: Message = archived
            .deserialize(&mut rkyv::de::deserializers::SharedDeserializeMap::new())
            .map_err(|e| StreamError::Corrupt(format!("payload decode: {e:?}")))?;

        if message.message_type() != self.message_type {
            return Err(StreamError::Corrupt(format!(
                "header tag {:?} does not match payload variant {:?}",
                self.message_type,
                message.message_type()
            )));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_model::{wire_version, Message};

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = std::io::Cursor::new(Vec::new());
        let tag = wire_version(7);
        write_frame(&mut buf, &Message::VmInfoFetch, tag).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame.message_type, MessageType::VmInfoFetch);
        assert_eq!(frame.version_tag, tag);
        assert!(matches!(frame.decode().unwrap(), Message::VmInfoFetch));
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(StreamError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn header_tag_must_match_payload_variant() {
        let mut buf = std::io::Cursor::new(Vec::new());
        write_frame(&mut buf, &Message::ConnectionTerminate, 0).await.unwrap();
        // Smash the header tag to claim a different type.
        let mut bytes = buf.into_inner();
        bytes[4..8].copy_from_slice(&(MessageType::VmInfoFetch as u32).to_le_bytes());

        let mut cursor = std::io::Cursor::new(bytes);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert!(matches!(frame.decode(), Err(StreamError::Corrupt(_))));
    }
}
