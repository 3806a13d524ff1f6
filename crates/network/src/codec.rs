//! Length-prefixed envelope codec.
//!
//! All four protocols share one frame format: a 4-byte big-endian length
//! followed by the JSON encoding of an [`Envelope`]. Responses are the tiny
//! [`MsgAck`] receipt, framed the same way.

use std::io;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::request_response::{self, Codec, ProtocolSupport};
use libp2p::StreamProtocol;

use tss_types::{Envelope, MsgAck, TssProtocol, MAX_FRAME_BYTES};

#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec;

async fn read_frame<T>(io: &mut T) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let mut len_bytes = [0u8; 4];
    io.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<T>(io: &mut T, data: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    if data.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", data.len()),
        ));
    }
    io.write_all(&(data.len() as u32).to_be_bytes()).await?;
    io.write_all(data).await?;
    io.close().await
}

#[async_trait]
impl Codec for EnvelopeCodec {
    type Protocol = StreamProtocol;
    type Request = Envelope;
    type Response = MsgAck;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Envelope>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_frame(io).await?;
        serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<MsgAck>
    where
        T: AsyncRead + Unpin + Send,
    {
        let buf = read_frame(io).await?;
        serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        req: Envelope,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let data =
            serde_json::to_vec(&req).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(io, &data).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        res: MsgAck,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let data =
            serde_json::to_vec(&res).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        write_frame(io, &data).await
    }
}

/// A request-response behaviour speaking the envelope codec on one protocol.
pub fn envelope_behaviour(protocol: TssProtocol) -> request_response::Behaviour<EnvelopeCodec> {
    let protocols = std::iter::once((
        StreamProtocol::new(protocol.id()),
        ProtocolSupport::Full,
    ));
    request_response::Behaviour::new(protocols, request_response::Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[tokio::test]
    async fn test_request_round_trip() {
        let env = Envelope::new("sess", TssProtocol::Tss, "pk", vec![1, 2, 3]);

        let mut wire = Vec::new();
        let mut codec = EnvelopeCodec;
        let proto = StreamProtocol::new(TssProtocol::Tss.id());
        codec
            .write_request(&proto, &mut Cursor::new(&mut wire), env.clone())
            .await
            .unwrap();

        // The frame leads with the payload length.
        let framed_len = u32::from_be_bytes(wire[..4].try_into().unwrap()) as usize;
        assert_eq!(framed_len, wire.len() - 4);

        let decoded = codec
            .read_request(&proto, &mut Cursor::new(&wire))
            .await
            .unwrap();
        assert_eq!(decoded.session_id, env.session_id);
        assert_eq!(decoded.payload, env.payload);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_FRAME_BYTES as u32 + 1).to_be_bytes());
        let mut codec = EnvelopeCodec;
        let proto = StreamProtocol::new(TssProtocol::Tss.id());
        let err = codec
            .read_request(&proto, &mut Cursor::new(&wire))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_ack_round_trip() {
        let mut wire = Vec::new();
        let mut codec = EnvelopeCodec;
        let proto = StreamProtocol::new(TssProtocol::JoinParty.id());
        codec
            .write_response(&proto, &mut Cursor::new(&mut wire), MsgAck::Received)
            .await
            .unwrap();
        let decoded = codec
            .read_response(&proto, &mut Cursor::new(&wire))
            .await
            .unwrap();
        assert_eq!(decoded, MsgAck::Received);
    }
}
