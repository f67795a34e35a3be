//! Framing of wire envelopes over an async byte stream.
//!
//! Each frame is the SBS-encoded `Hat.Msg` envelope prefixed by its byte
//! length as a variable length unsigned integer (the repository's native
//! unsigned integer encoding). No padding, no checksum; the stream below is
//! assumed reliable.

use crate::{
    error::{
        Error,
        Result,
    },
    wire::{
        WireMsg,
        HAT_MODULE,
        MSG_TYPE,
    },
};
use sbs::{
    var_len,
    Repository,
};
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncWrite,
    AsyncWriteExt,
};


// inbound frames above this limit are a protocol error rather than an
// allocation
const MAX_FRAME_LEN: u64 = 16 << 20;

/// Encode and transmit one envelope.
pub(crate) async fn write_msg<W>(
    write: &mut W,
    repo: &Repository,
    msg: &WireMsg,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = repo
        .encode(Some(HAT_MODULE), MSG_TYPE, &msg.to_value())
        .map_err(|e| Error::Protocol(format!("encoding envelope: {}", e)))?;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    var_len::write_var_len_uint(&mut frame, payload.len() as u64)
        .map_err(|e| Error::Protocol(format!("encoding frame length: {}", e)))?;
    frame.extend_from_slice(&payload);
    write.write_all(&frame).await?;
    write.flush().await?;
    Ok(())
}

/// Receive and decode one envelope. Any decode failure, EOF mid-frame, or
/// oversized length is fatal to the connection.
pub(crate) async fn read_msg<R>(read: &mut R, repo: &Repository) -> Result<WireMsg>
where
    R: AsyncRead + Unpin,
{
    let len = read_frame_len(read).await?;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!("frame length {} over limit", len)));
    }
    let mut payload = vec![0; len as usize];
    read.read_exact(&mut payload).await?;
    let value = repo
        .decode(Some(HAT_MODULE), MSG_TYPE, &payload)
        .map_err(|e| Error::Protocol(format!("decoding envelope: {}", e)))?;
    WireMsg::from_value(value)
        .map_err(|e| Error::Protocol(format!("invalid envelope: {:#}", e)))
}

// var len uint read byte by byte off the stream; same encoding as
// `sbs::var_len::read_var_len_uint`
async fn read_frame_len<R>(read: &mut R) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut n: u64 = 0;
    let mut shift = 0;
    loop {
        if shift >= 64 {
            return Err(Error::Protocol("too many bytes in frame length".to_owned()));
        }
        let curr_byte = read.read_u8().await?;
        n |= ((curr_byte & var_len::LO_7_BITS) as u64) << shift;
        shift += 7;
        if curr_byte & var_len::MORE_BIT == 0 {
            return Ok(n);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{
        sbs_repo,
        WireData,
    };

    #[tokio::test]
    async fn frame_round_trips() {
        let repo = sbs_repo();
        let msg = WireMsg {
            id: 200,
            first: 1,
            owner: false,
            token: true,
            last: false,
            data: WireData {
                module: None,
                ty: "Integer".to_owned(),
                data: vec![0x05],
            },
        };

        let mut frame = Vec::new();
        write_msg(&mut frame, &repo, &msg).await.unwrap();

        let mut read = frame.as_slice();
        let decoded = read_msg(&mut read, &repo).await.unwrap();
        assert!(read.is_empty());
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.first, msg.first);
        assert_eq!(decoded.data.ty, msg.data.ty);
        assert_eq!(decoded.data.data, msg.data.data);
    }

    #[tokio::test]
    async fn garbage_frame_is_a_protocol_error() {
        let repo = sbs_repo();
        let mut read = &[0x01u8, 0x02, 0x03, 0x04][..];
        assert!(matches!(
            read_msg(&mut read, &repo).await,
            Err(Error::Protocol(_)),
        ));
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let repo = sbs_repo();
        // length prefix of 100 followed by 1 byte
        let mut read = &[0x64u8, 0x00][..];
        assert!(read_msg(&mut read, &repo).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_rejected_before_reading_it() {
        let repo = sbs_repo();
        let mut frame = Vec::new();
        var_len::write_var_len_uint(&mut frame, MAX_FRAME_LEN + 1).unwrap();
        let mut read = frame.as_slice();
        assert!(matches!(
            read_msg(&mut read, &repo).await,
            Err(Error::Protocol(_)),
        ));
    }
}
