//! Length-prefixed framing over any async byte stream, plus the two pump
//! tasks that let the protocol runtime treat the stream as frame channels.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{Frame, WireConfig, WireError};

/// Write one length-prefixed frame.
pub async fn write_framed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    max_size: usize,
) -> Result<(), WireError> {
    let data = frame.to_bytes()?;
    if data.len() > max_size {
        return Err(WireError::FrameTooLarge {
            size: data.len(),
            max: max_size,
        });
    }

    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&data).await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the stream ends cleanly before a new frame starts.
/// Ending inside the length prefix or the body is an `Io` error.
pub async fn read_framed<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<Frame>, WireError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after {filled} of 4 length bytes"),
            )
            .into());
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(WireError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    Frame::from_bytes(&buf).map(Some)
}

/// Spawn a task that decodes frames from `reader` into a channel.
///
/// The channel ends after EOF or after the first error, which is delivered
/// as the last item.
pub fn spawn_reader<R>(
    mut reader: R,
    config: &WireConfig,
) -> (mpsc::Receiver<Result<Frame, WireError>>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_buffer);
    let max_size = config.max_frame_size;

    let task = tokio::spawn(async move {
        loop {
            match read_framed(&mut reader, max_size).await {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::trace!("wire: remote closed the stream");
                    break;
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    (rx, task)
}

/// Spawn a task that encodes frames from a channel into `writer`.
///
/// When every sender is dropped the task flushes and shuts the writer down,
/// which the remote observes as EOF.
pub fn spawn_writer<W>(
    mut writer: W,
    config: &WireConfig,
) -> (mpsc::Sender<Frame>, JoinHandle<Result<(), WireError>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(config.channel_buffer);
    let max_size = config.max_frame_size;

    let task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            write_framed(&mut writer, &frame, max_size).await?;
            writer.flush().await?;
        }
        writer.shutdown().await?;
        Ok(())
    });

    (tx, task)
}
