/// The session event loop.
///
/// A single async task that owns the session state and multiplexes over
/// inbound frames, application commands, batch resolutions, sub-stream
/// completions and the handshake timer.
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use multifeed_wire::{spawn_reader, spawn_writer};

use crate::error::MuxError;

use super::executor::{Executor, Exit};
use super::state::MuxState;
use super::{MuxCommand, MuxConfig, MuxEvent, MuxHandle};

/// How long a draining session waits for progress before giving up on the
/// sub-streams still running.
const DRAIN_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for queued frames to reach the stream on shutdown.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Main event loop. Owns all session state.
pub(super) async fn mux_loop<T>(
    stream: T,
    config: MuxConfig,
    mut state: MuxState,
    handle: MuxHandle,
    mut cmd_rx: mpsc::Receiver<MuxCommand>,
    event_tx: mpsc::Sender<MuxEvent>,
) -> Result<(), MuxError>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (mut frames, reader) = spawn_reader(read_half, &config.wire);
    let (outbound, mut writer) = spawn_writer(write_half, &config.wire);

    let mut exec = Executor::new(outbound, event_tx, handle, config.replicate_options());

    let handshake_deadline = tokio::time::sleep(config.handshake_timeout);
    tokio::pin!(handshake_deadline);

    tracing::info!(
        "mux: session started (initiator={}, live={})",
        config.initiator,
        config.live
    );

    let mut stream_ended = false;
    let mut writer_done = false;
    let mut exit = exec.execute(state.start()).await;

    while exit.is_none() {
        let effects = tokio::select! {
            frame = frames.recv(), if !stream_ended => match frame {
                Some(Ok(frame)) => state.handle_frame(frame),
                Some(Err(e)) => {
                    stream_ended = true;
                    state.handle_transport_error(e.into())
                }
                None => {
                    stream_ended = true;
                    state.handle_eof()
                }
            },

            Some(cmd) = cmd_rx.recv() => state.handle_command(cmd),

            Some(batch) = exec.batches.next(), if !exec.batches.is_empty() => {
                state.handle_batch_ready(batch)
            }

            Some((key, outcome)) = exec.running.next(), if !exec.running.is_empty() => {
                state.handle_substream_closed(key, outcome)
            }

            _ = &mut handshake_deadline, if state.awaiting_handshake() => {
                state.handle_handshake_timeout()
            }

            result = &mut writer, if !writer_done => {
                writer_done = true;
                match result {
                    Ok(Ok(())) => Vec::new(),
                    Ok(Err(e)) => state.handle_writer_error(e.into()),
                    Err(e) => state.handle_writer_error(MuxError::Transport(e.to_string())),
                }
            }

            _ = tokio::time::sleep(DRAIN_IDLE_TIMEOUT), if exec.is_draining() => {
                tracing::debug!(
                    "mux: {} sub-streams still running after the stream ended, cancelling",
                    exec.running.len()
                );
                exit = Some(Exit::Finished);
                Vec::new()
            }
        };

        if exit.is_none() {
            exit = exec.execute(effects).await;
        }
        if exit.is_none() && exec.is_drained() {
            exit = Some(Exit::Finished);
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    exec.cancel_all().await;
    reader.abort();
    drop(frames);
    drop(exec);

    if !writer_done {
        match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut writer).await {
            Ok(Ok(Err(e))) => tracing::debug!("mux: writer failed during shutdown: {e}"),
            Ok(_) => {}
            Err(_) => {
                tracing::debug!("mux: writer did not drain in time");
                writer.abort();
            }
        }
    }

    match exit {
        Some(Exit::Failed(err)) => {
            tracing::info!("mux: session ended with error: {err}");
            Err(err)
        }
        _ => {
            tracing::info!("mux: session ended");
            Ok(())
        }
    }
}
