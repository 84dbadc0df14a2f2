// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

//! Byte-stream transport for the SSH agent protocol over a channel that only
//! carries discrete messages.
//!
//! Each message carries one agent protocol frame as an array of byte values.
//! Inbound frames are written into a pipe with a 4-byte big-endian length
//! prefix, where the agent reads them as an ordinary stream. The agent's
//! replies travel through a second pipe and are cut back into frames by a
//! background task.

mod pipe;
pub(crate) mod registry;

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    task::JoinHandle,
};
use tokio_util::{
    bytes::{Bytes, BytesMut},
    codec::{Encoder, FramedRead, LengthDelimitedCodec},
};

use crate::error::{self, Result};

pub(crate) use registry::Registry;

use self::pipe::PipeWriter;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub(crate) struct Frame {
    pub(crate) data: Vec<u8>,
}

/// The message channel an [`AgentPort`] is attached to.
#[async_trait]
pub(crate) trait Channel: Send + Sync {
    async fn post_message(&self, frame: Frame) -> Result<()>;

    /// Tears down the channel. Called when the peer sends something that
    /// cannot be decoded.
    async fn disconnect(&self);
}

// A 4-byte big-endian length prefix. Every length the prefix can express is
// a valid frame.
fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(usize::try_from(u32::MAX).unwrap_or(usize::MAX))
        .new_codec()
}

/// The agent's side of a port: reads return inbound frames as a byte stream,
/// and writes are delivered back to the channel.
#[derive(Debug)]
pub(crate) struct AgentStream {
    inbound: DuplexStream,
    outbound: PipeWriter,
}

impl AsyncRead for AgentStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inbound).poll_read(cx, buf)
    }
}

impl AsyncWrite for AgentStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.outbound).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.outbound).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.outbound).poll_shutdown(cx)
    }
}

pub(crate) struct AgentPort {
    channel: Arc<dyn Channel>,
    inbound: PipeWriter,
    outbound: PipeWriter,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl AgentPort {
    /// Attaches a new port to `channel`, returning it together with the
    /// stream the agent should serve. Replies are delivered to the channel
    /// from a background task until the port is disconnected.
    pub(crate) fn new(channel: Arc<dyn Channel>) -> (Self, AgentStream) {
        let (inbound_reader, inbound) = pipe::pipe();
        let (outbound_reader, outbound) = pipe::pipe();

        let delivery = tokio::spawn(deliver(Arc::clone(&channel), outbound_reader));

        (
            Self {
                channel,
                inbound,
                outbound: outbound.clone(),
                delivery: Mutex::new(Some(delivery)),
            },
            AgentStream {
                inbound: inbound_reader,
                outbound,
            },
        )
    }

    /// Passes one message received from the channel to the agent.
    ///
    /// A message that is not a valid frame disconnects the channel, since
    /// there is no way to find the start of the next frame.
    pub(crate) async fn on_message(&self, text: &str) -> Result<()> {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Disconnecting channel after malformed frame: {}", e);
                self.abort().await;
                return Err(error::Protocol::Decode(e.to_string()).into());
            }
        };
        debug!("Received frame of {} bytes", frame.data.len());

        let mut buf = BytesMut::with_capacity(frame.data.len() + 4);
        if let Err(e) = codec().encode(Bytes::from(frame.data), &mut buf) {
            self.abort().await;
            return Err(error::Protocol::Decode(e.to_string()).into());
        }

        let mut inbound = self.inbound.clone();
        if let Err(e) = inbound.write_all(&buf).await {
            return Err(if e.kind() == io::ErrorKind::BrokenPipe {
                error::Protocol::Disconnected
            } else {
                error::Protocol::Pipe(e)
            }
            .into());
        }
        Ok(())
    }

    /// Closes both pipes. Pending agent reads see end-of-stream and the
    /// delivery task stops once it has forwarded what was already written.
    pub(crate) fn disconnect(&self) {
        self.inbound.close();
        self.outbound.close();
    }

    /// Waits for the delivery task to finish.
    pub(crate) async fn closed(&self) -> Result<()> {
        let handle = self
            .delivery
            .lock()
            .map_err(|_| error::Internal::Poisoned)?
            .take();

        if let Some(handle) = handle {
            handle.await?;
        }
        Ok(())
    }

    async fn abort(&self) {
        self.channel.disconnect().await;
        self.disconnect();
    }
}

async fn deliver(channel: Arc<dyn Channel>, outbound: DuplexStream) {
    let mut frames = FramedRead::new(outbound, codec());
    while let Some(next) = frames.next().await {
        match next {
            Ok(payload) => {
                debug!("Sending frame of {} bytes", payload.len());
                let frame = Frame {
                    data: payload.to_vec(),
                };
                if let Err(e) = channel.post_message(frame).await {
                    warn!("Failed to deliver agent response: {}", e);
                    break;
                }
            }
            Err(e) => {
                warn!("Agent response stream ended abnormally: {}", e);
                break;
            }
        }
    }
    debug!("Agent response delivery finished");
}
