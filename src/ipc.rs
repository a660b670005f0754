//! Named-pipe bridge between a channel and client processes.
//!
//! Each message on the pipes is one bincode-encoded [`CanFrame`] preceded by
//! a single length byte. The pipe servers themselves are Windows only; the
//! framing is portable.

use bincode::config;
use log::warn;

use crate::frame::CanFrame;

/// Largest encoded frame a length byte can describe.
pub const MAX_MESSAGE_LEN: usize = u8::MAX as usize;

/// `\\.\pipe\can_<channel>_<direction>`, with path separators in the channel
/// name replaced so that `USBCAN2/0/1` maps to `can_USBCAN2_0_1_in`.
pub fn pipe_name(channel: &str, direction: &str) -> String {
    let channel: String = channel
        .chars()
        .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
        .collect();
    format!(r"\\.\pipe\can_{}_{}", channel, direction)
}

/// Encodes one frame as a length-prefixed pipe message.
pub fn encode_pipe_message(frame: &CanFrame) -> Option<Vec<u8>> {
    let mut data = match bincode::serde::encode_to_vec(frame, config::standard()) {
        Ok(data) => data,
        Err(e) => {
            warn!("Cannot encode {:?}: {}", frame, e);
            return None;
        }
    };
    if data.len() > MAX_MESSAGE_LEN {
        warn!("Serialized CanFrame too large: {}", data.len());
        return None;
    }
    let mut msg = Vec::with_capacity(data.len() + 1);
    msg.push(data.len() as u8);
    msg.append(&mut data);
    Some(msg)
}

/// Decodes every complete message at the front of `buffer` and removes it.
/// A trailing partial message stays in the buffer for the next read.
pub fn decode_pipe_messages(buffer: &mut Vec<u8>) -> Vec<CanFrame> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while let Some(&len) = buffer.get(offset) {
        let end = offset + 1 + len as usize;
        if buffer.len() < end {
            break;
        }
        match bincode::serde::decode_from_slice::<CanFrame, _>(
            &buffer[offset + 1..end],
            config::standard(),
        ) {
            Ok((frame, _)) => frames.push(frame),
            Err(e) => warn!("Dropping undecodable pipe message: {}", e),
        }
        offset = end;
    }

    buffer.drain(..offset);
    frames
}

#[cfg(windows)]
pub use self::server::{start_ipc_reader, start_ipc_writer};

#[cfg(windows)]
mod server {
    use std::io::ErrorKind;

    use log::info;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
    use tokio::sync::mpsc::{Receiver, Sender};

    use super::{decode_pipe_messages, pipe_name};
    use crate::frame::CanFrame;

    async fn create_server_and_wait(pipe_name: &str) -> std::io::Result<NamedPipeServer> {
        let server = ServerOptions::new().create(pipe_name)?;
        info!("Created server on: {}", pipe_name);
        server.connect().await?;
        Ok(server)
    }

    /// Serves `can_<channel>_in`: frames written by clients are forwarded to `tx`.
    /// A new client is awaited whenever the current one disconnects.
    pub async fn start_ipc_reader(channel: String, tx: Sender<CanFrame>) -> std::io::Result<()> {
        let pipe_name = pipe_name(&channel, "in");

        loop {
            let mut server = create_server_and_wait(&pipe_name).await?;
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                let read = server.read_buf(&mut buffer).await?;
                if read == 0 {
                    info!("Pipe closed by client");
                    break;
                }
                for frame in decode_pipe_messages(&mut buffer) {
                    if tx.send(frame).await.is_err() {
                        info!("Receiver closed");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Serves `can_<channel>_out`: every message from `rx` is written to the client.
    pub async fn start_ipc_writer(
        channel: String,
        mut rx: Receiver<Vec<u8>>,
    ) -> std::io::Result<()> {
        let pipe_name = pipe_name(&channel, "out");
        let mut server = create_server_and_wait(&pipe_name).await?;

        while let Some(msg) = rx.recv().await {
            if let Err(e) = server.write_all(&msg).await {
                if e.kind() == ErrorKind::BrokenPipe {
                    info!("Client disconnected from IPC Writer");
                    server.shutdown().await?;
                    server = create_server_and_wait(&pipe_name).await?;
                    continue;
                }
                return Err(e);
            }
            server.flush().await?;
        }
        Ok(())
    }
}
