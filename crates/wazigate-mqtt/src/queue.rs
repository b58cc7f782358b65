//! Durable outbound packet queue for a named peer.
//!
//! While a writer is attached and nothing is backlogged, packets go
//! straight to the writer. Otherwise they are appended to
//! `{dir}/{id}.tmp` in MQTT wire format. Attaching a writer drains the
//! file in order; drained bytes are overwritten with zeros when the drain
//! is interrupted, so a restart resumes after the last delivered packet.
//! A valid fixed header never starts with `0x00` (reserved type 0), which
//! is what the recovery scan relies on.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{Sink, SinkExt};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::codec::MqttCodec;
use crate::error::Error;
use crate::packet::Packet;

const ZERO_CHUNK: usize = 64 * 1024;

/// Destination for queued packets.
#[async_trait]
pub trait PacketWriter: Send {
    async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error>;
}

#[async_trait]
impl<S> PacketWriter for S
where
    S: Sink<Packet, Error = Error> + Unpin + Send,
{
    async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        self.send(packet.clone()).await
    }
}

struct QueueState {
    writer: Option<Box<dyn PacketWriter>>,
    spill: Option<File>,
    /// Undelivered bytes in the spill file.
    size: u64,
    read_offset: u64,
}

pub struct Queue {
    id: String,
    path: PathBuf,
    state: Mutex<QueueState>,
}

impl Queue {
    /// Open the queue `id` under `dir`, recovering any spill file left by a
    /// previous run.
    pub async fn open(dir: impl AsRef<Path>, id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{id}.tmp"));

        let mut state = QueueState {
            writer: None,
            spill: None,
            size: 0,
            read_offset: 0,
        };

        match tokio::fs::read(&path).await {
            Ok(data) => {
                let offset = data.iter().take_while(|b| **b == 0).count();
                let live = data.len() - offset;
                if live == 0 {
                    debug!(queue = %id, "removing drained spill file");
                    tokio::fs::remove_file(&path).await?;
                } else {
                    info!(queue = %id, bytes = live, "recovered spilled packets");
                    state.spill = Some(open_spill(&path, false).await?);
                    state.read_offset = offset as u64;
                    state.size = live as u64;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            id,
            path,
            state: Mutex::new(state),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Undelivered bytes waiting in the spill file.
    pub async fn backlog(&self) -> u64 {
        self.state.lock().await.size
    }

    pub async fn has_writer(&self) -> bool {
        self.state.lock().await.writer.is_some()
    }

    /// Hand a packet to the attached writer, or spill it to disk.
    pub async fn write_packet(&self, packet: &Packet) -> Result<(), Error> {
        let mut state = self.state.lock().await;

        if state.spill.is_none() {
            if let Some(writer) = state.writer.as_mut() {
                match writer.write_packet(packet).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(queue = %self.id, error = %e, "writer failed; spilling to disk");
                        state.writer = None;
                    }
                }
            }
            state.spill = Some(open_spill(&self.path, true).await?);
            state.read_offset = 0;
            state.size = 0;
        }

        let mut buf = BytesMut::with_capacity(packet.encoded_len());
        packet.encode(&mut buf)?;
        if let Some(file) = state.spill.as_mut() {
            file.seek(SeekFrom::End(0)).await?;
            file.write_all(&buf).await?;
            file.flush().await?;
        }
        state.size += buf.len() as u64;
        Ok(())
    }

    /// Drain the backlog into `writer`, then keep it attached for direct
    /// writes. On failure the writer is dropped and the error returned.
    pub async fn serve_writer(&self, mut writer: Box<dyn PacketWriter>) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        state.writer = None;

        if state.spill.is_some() {
            self.drain(&mut state, writer.as_mut()).await?;
        }

        state.writer = Some(writer);
        Ok(())
    }

    /// Send a packet only if a writer is attached and nothing is
    /// backlogged. Never spills.
    pub async fn send_direct(&self, packet: &Packet) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if state.spill.is_some() {
            return Err(Error::Closed);
        }
        match state.writer.as_mut() {
            Some(writer) => writer.write_packet(packet).await,
            None => Err(Error::Closed),
        }
    }

    /// Detach the current writer, if any. Later packets are spilled.
    pub async fn detach(&self) {
        self.state.lock().await.writer = None;
    }

    async fn drain(&self, state: &mut QueueState, writer: &mut dyn PacketWriter) -> Result<(), Error> {
        let start = state.read_offset;
        let mut raw = Vec::new();
        if let Some(file) = state.spill.as_mut() {
            file.seek(SeekFrom::Start(start)).await?;
            file.read_to_end(&mut raw).await?;
        }
        let mut data = BytesMut::from(raw.as_slice());

        let mut codec = MqttCodec::new();
        let mut sent = 0usize;
        loop {
            let before = data.len();
            let packet = match codec.decode(&mut data) {
                Ok(Some(packet)) => packet,
                Ok(None) => {
                    if !data.is_empty() {
                        warn!(queue = %self.id, bytes = data.len(), "discarding truncated spilled packet");
                    }
                    break;
                }
                Err(e) => {
                    warn!(queue = %self.id, error = %e, "discarding corrupt spill file");
                    break;
                }
            };
            let consumed = (before - data.len()) as u64;

            if let Err(e) = writer.write_packet(&packet).await {
                warn!(queue = %self.id, sent, error = %e, "writer failed while draining");
                let end = state.read_offset;
                if let Some(file) = state.spill.as_mut() {
                    zero_range(file, start, end).await?;
                }
                return Err(e);
            }
            state.read_offset += consumed;
            state.size = state.size.saturating_sub(consumed);
            sent += 1;
        }

        info!(queue = %self.id, sent, "spill drained");
        state.spill = None;
        state.size = 0;
        state.read_offset = 0;
        tokio::fs::remove_file(&self.path).await?;
        Ok(())
    }
}

async fn open_spill(path: &Path, truncate: bool) -> Result<File, Error> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(truncate)
        .open(path)
        .await?)
}

async fn zero_range(file: &mut File, start: u64, end: u64) -> Result<(), Error> {
    file.seek(SeekFrom::Start(start)).await?;
    let zeros = vec![0u8; ZERO_CHUNK];
    let mut remaining = end.saturating_sub(start);
    while remaining > 0 {
        let n = usize::try_from(remaining).map_or(ZERO_CHUNK, |r| r.min(ZERO_CHUNK));
        file.write_all(&zeros[..n]).await?;
        remaining -= n as u64;
    }
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}
