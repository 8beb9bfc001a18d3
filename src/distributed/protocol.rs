//! Rendezvous protocol
//!
//! Messages exchanged between participants and the rendezvous hub in
//! multi-process runs. The protocol uses MessagePack (rmp-serde) for compact
//! binary serialization with full serde feature support.
//!
//! # Protocol Version
//!
//! Current version: 1
//!
//! # Message Flow
//!
//! ```text
//! Participant                      Hub (hosted by world rank 0)
//!     |                              |
//!     |-------- HELLO -------------->|
//!     |<------- WELCOME -------------|
//!     |                              |
//!     |-- CONTRIBUTE(group, seq) --->|   (repeated, one per collective)
//!     |<-- DELIVERY(group, seq) -----|   (once every member contributed)
//!     |                              |
//!     |-------- GOODBYE ------------>|
//! ```
//!
//! Either side may send ABORT at any point. The hub relays an abort to every
//! participant, which turns its pending and future collectives into errors.
//!
//! # Message Framing
//!
//! Each message is prefixed with a 4-byte length field (little-endian u32):
//!
//! ```text
//! [4 bytes: message length][N bytes: MessagePack-serialized message]
//! ```

use crate::distributed::rendezvous::{Collective, Delivery};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
///
/// Increment this when making breaking changes to the protocol.
/// Hub and participants must have matching protocol versions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame
///
/// Dataset broadcasts to node owners travel as a single frame, so this bounds
/// the dataset size of a multi-process run (about 64M values).
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024 * 1024;

/// Protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// First message on a connection (Participant → Hub)
    Hello(HelloMessage),

    /// Handshake accepted (Hub → Participant)
    Welcome(WelcomeMessage),

    /// One member's part of a collective round (Participant → Hub)
    Contribute(ContributeMessage),

    /// Result of a completed round (Hub → Participant)
    Delivery(DeliveryMessage),

    /// Run aborted (either direction)
    ///
    /// Sent by a participant that hit a fatal error, relayed by the hub to all.
    Abort(AbortMessage),

    /// Participant is done and will close the connection (Participant → Hub)
    Goodbye { rank: usize },

    /// Handshake rejected (Hub → Participant)
    Error(ErrorMessage),
}

/// Hello message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloMessage {
    /// Protocol version (must match)
    pub protocol_version: u32,

    /// World rank claimed by this participant
    pub rank: usize,

    /// World size this participant was launched with
    pub world_size: usize,

    /// Node identifier (hostname unless overridden)
    pub node_id: String,
}

/// Welcome message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeMessage {
    pub protocol_version: u32,
    pub world_size: usize,
}

/// Contribute message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContributeMessage {
    /// Group the collective runs on
    pub group: String,

    /// Member's sequence number on that group
    pub seq: u64,

    /// Member index within the group
    pub member: usize,

    /// Group size as seen by this member
    pub group_size: usize,

    /// Kind of collective
    pub op: Collective,

    /// Opaque payload (MessagePack encoded by the typed collectives)
    pub payload: Vec<u8>,
}

/// Delivery message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMessage {
    pub group: String,
    pub seq: u64,
    pub delivery: Delivery,
}

/// Abort message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortMessage {
    /// World rank that raised the abort
    pub rank: usize,

    /// Human readable cause
    pub reason: String,
}

/// Error message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub error: String,
}

/// Serialize a message to bytes
///
/// Prepends a 4-byte length field for framing.
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>> {
    let msg_bytes = rmp_serde::to_vec(msg).context("Failed to serialize message")?;

    if msg_bytes.len() > MAX_MESSAGE_BYTES {
        anyhow::bail!(
            "Message too large: {} bytes (max {} bytes)",
            msg_bytes.len(),
            MAX_MESSAGE_BYTES
        );
    }

    let msg_len = msg_bytes.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg_bytes.len());
    framed.extend_from_slice(&msg_len.to_le_bytes());
    framed.extend_from_slice(&msg_bytes);

    Ok(framed)
}

/// Deserialize a message from bytes
///
/// Expects a 4-byte length prefix followed by a MessagePack-serialized message.
///
/// # Returns
///
/// Returns (message, bytes_consumed) where bytes_consumed includes the length prefix.
pub fn deserialize_message(buf: &[u8]) -> Result<(Message, usize)> {
    if buf.len() < 4 {
        anyhow::bail!("Buffer too small for message length (need 4 bytes, got {})", buf.len());
    }

    let msg_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if buf.len() < 4 + msg_len {
        anyhow::bail!("Incomplete message (need {} bytes, got {})", 4 + msg_len, buf.len());
    }

    let msg = rmp_serde::from_slice(&buf[4..4 + msg_len]).context("Failed to deserialize message")?;

    Ok((msg, 4 + msg_len))
}

/// Read a complete message from a stream (or one half of a split stream)
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("Failed to read message length")?;

    let msg_len = u32::from_le_bytes(len_buf) as usize;

    if msg_len > MAX_MESSAGE_BYTES {
        anyhow::bail!("Message too large: {} bytes (max {} bytes)", msg_len, MAX_MESSAGE_BYTES);
    }

    let mut frame = vec![0u8; 4 + msg_len];
    frame[..4].copy_from_slice(&len_buf);
    stream
        .read_exact(&mut frame[4..])
        .await
        .context("Failed to read message body")?;

    let (msg, _) = deserialize_message(&frame)?;
    Ok(msg)
}

/// Write a message to a stream (or one half of a split stream)
pub async fn write_message<W: AsyncWrite + Unpin>(stream: &mut W, msg: &Message) -> Result<()> {
    let framed = serialize_message(msg)?;

    stream.write_all(&framed).await.context("Failed to write message")?;

    // Flush so collectives are never held back by buffering
    stream.flush().await.context("Failed to flush stream")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_deserialize_hello() {
        let msg = Message::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            rank: 3,
            world_size: 8,
            node_id: "compute-17".to_string(),
        });

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, consumed) = deserialize_message(&bytes).unwrap();

        assert_eq!(consumed, bytes.len());

        match deserialized {
            Message::Hello(hello) => {
                assert_eq!(hello.protocol_version, PROTOCOL_VERSION);
                assert_eq!(hello.rank, 3);
                assert_eq!(hello.world_size, 8);
                assert_eq!(hello.node_id, "compute-17");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_serialize_deserialize_contribute() {
        let msg = Message::Contribute(ContributeMessage {
            group: "world/0.1".to_string(),
            seq: 7,
            member: 1,
            group_size: 3,
            op: Collective::Gather { root: 0 },
            payload: vec![1, 2, 3],
        });

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, _) = deserialize_message(&bytes).unwrap();

        match deserialized {
            Message::Contribute(c) => {
                assert_eq!(c.group, "world/0.1");
                assert_eq!(c.seq, 7);
                assert_eq!(c.op, Collective::Gather { root: 0 });
                assert_eq!(c.payload, vec![1, 2, 3]);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_serialize_deserialize_abort() {
        let msg = Message::Abort(AbortMessage {
            rank: 2,
            reason: "shared segment allocation failed".to_string(),
        });

        let bytes = serialize_message(&msg).unwrap();
        let (deserialized, _) = deserialize_message(&bytes).unwrap();

        match deserialized {
            Message::Abort(abort) => {
                assert_eq!(abort.rank, 2);
                assert_eq!(abort.reason, "shared segment allocation failed");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_message_framing() {
        let msg = Message::Goodbye { rank: 0 };
        let bytes = serialize_message(&msg).unwrap();

        assert!(bytes.len() >= 4);
        let msg_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(bytes.len(), 4 + msg_len);
    }

    #[test]
    fn test_incomplete_frame_is_rejected() {
        let bytes = serialize_message(&Message::Goodbye { rank: 1 }).unwrap();
        assert!(deserialize_message(&bytes[..2]).is_err());
        assert!(deserialize_message(&bytes[..bytes.len() - 1]).is_err());
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let msg = Message::Delivery(DeliveryMessage {
            group: "world".to_string(),
            seq: 0,
            delivery: Delivery::Value(vec![9, 9]),
        });
        write_message(&mut client, &msg).await.unwrap();

        match read_message(&mut server).await.unwrap() {
            Message::Delivery(d) => {
                assert_eq!(d.group, "world");
                assert_eq!(d.delivery, Delivery::Value(vec![9, 9]));
            }
            _ => panic!("Wrong message type"),
        }
    }
}
