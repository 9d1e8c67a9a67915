use anyhow::{anyhow, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Spec §6 calls the wire schema "illustrative" JSON; the transport detail
/// of framing it is this crate's to pick. A 4-byte big-endian length prefix
/// ahead of the JSON body keeps reads simple without a line-delimited
/// parser that would have to tolerate stray newline bytes inside
/// `audio_data`, which this wire encoding carries as a JSON byte array
/// rather than base64 text.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Read one length-prefixed JSON frame and deserialize it as `M`.
pub async fn read_json_frame<R, M>(reader: &mut R) -> Result<M>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(anyhow!("frame length out of range: {len}"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Serialize `msg` as JSON and write it as one length-prefixed frame.
pub async fn write_json_frame<W, M>(writer: &mut W, msg: &M) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(anyhow!("frame too large: {} bytes", body.len()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_an_in_memory_pipe() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Sample {
            n: u32,
            s: String,
        }

        let (mut client, mut server) = tokio::io::duplex(4096);
        let sent = Sample {
            n: 7,
            s: "hello".into(),
        };
        write_json_frame(&mut client, &sent).await.unwrap();
        let received: Sample = read_json_frame(&mut server).await.unwrap();
        assert_eq!(sent, received);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_u32(MAX_FRAME_BYTES as u32 + 1).await.unwrap();
        let result: Result<serde_json::Value> = read_json_frame(&mut server).await;
        assert!(result.is_err());
    }
}
