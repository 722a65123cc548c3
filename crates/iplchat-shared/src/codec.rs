//! Length-prefixed packet framing over any async byte stream.
//!
//! Wire layout per packet: `u32 kind ‖ u32 payload_len ‖ payload`, all
//! integers little-endian. Receivers reassemble from the stream with
//! `read_exact`, so partial reads are handled by the runtime.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_PACKET_PAYLOAD;
use crate::error::ProtocolError;
use crate::packet::{Packet, PacketKind};

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32_le(packet.kind as u32).await?;
    writer.write_u32_le(packet.payload.len() as u32).await?;
    writer.write_all(&packet.payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_packet<R>(reader: &mut R) -> Result<Packet, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u32_le().await?;
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_PACKET_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }

    // The payload is consumed even for an unknown tag, so the stream stays
    // in sync and the receiver can drop just this packet.
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let kind = PacketKind::from_u32(tag).ok_or(ProtocolError::UnknownPacketKind(tag))?;
    Ok(Packet { kind, payload })
}
