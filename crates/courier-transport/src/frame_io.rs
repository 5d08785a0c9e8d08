// Envelope IO over QUIC streams. Payloads above the connection's cap are refused
// before anything is allocated for them.
use anyhow::{Context, Result, bail};
use bytes::BytesMut;
use courier_wire::{Envelope, EnvelopeHeader, HEADER_LEN};
use quinn::{ReadExactError, RecvStream, SendStream};

/// Next envelope, or `None` when the peer finished the stream between envelopes.
pub(crate) async fn read_envelope(
    recv: &mut RecvStream,
    scratch: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Envelope>> {
    let mut header = [0u8; HEADER_LEN];
    match recv.read_exact(&mut header).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(ReadExactError::FinishedEarly(read)) => {
            bail!("stream finished {read} bytes into an envelope header")
        }
        Err(ReadExactError::ReadError(err)) => return Err(err.into()),
    }
    let header = EnvelopeHeader::parse(&header).context("parse envelope header")?;
    let length = header.length as usize;
    if length > max_frame_bytes {
        bail!(
            "{} envelope of {length} bytes exceeds the {max_frame_bytes} byte cap",
            header.kind
        );
    }
    scratch.clear();
    scratch.resize(length, 0);
    recv.read_exact(&mut scratch[..])
        .await
        .with_context(|| format!("read {} payload", header.kind))?;
    let envelope = Envelope::decode(header.kind, scratch.split().freeze())
        .with_context(|| format!("decode {} envelope", header.kind))?;
    Ok(Some(envelope))
}

pub(crate) async fn write_envelope(
    send: &mut SendStream,
    envelope: &Envelope,
    max_frame_bytes: usize,
) -> Result<()> {
    let frame = envelope.encode().context("encode envelope")?;
    let payload = frame.len() - HEADER_LEN;
    if payload > max_frame_bytes {
        bail!(
            "{} envelope of {payload} bytes exceeds the {max_frame_bytes} byte cap",
            envelope.kind()
        );
    }
    send.write_all(&frame).await.context("write envelope")?;
    Ok(())
}
