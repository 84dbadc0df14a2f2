// SPDX-FileCopyrightText: 2022-2024 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    fmt::Debug,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use log::debug;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{self, Result};

/// Exchanges JSON text messages over a WebSocket, receiving `In` and sending
/// `Out`. A close frame from the peer ends the stream.
pub(crate) struct WebSocketStream<S, In, Out> {
    inner: tokio_tungstenite::WebSocketStream<S>,
    types: PhantomData<fn(Out) -> In>,
}

impl<S: AsyncRead + AsyncWrite + Unpin, In: DeserializeOwned + Debug, Out> futures_util::Stream
    for WebSocketStream<S, In, Out>
{
    type Item = Result<In>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let msg = match futures_util::ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Poll::Ready(Some(Err(e.into()))),
                None => return Poll::Ready(None),
            };

            // LINT: Control frames are answered by tungstenite itself.
            #[allow(clippy::wildcard_enum_match_arm)]
            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => return Poll::Ready(None),
                Message::Binary(_) => {
                    return Poll::Ready(Some(Err(error::Protocol::Decode(
                        "binary messages are not supported".to_owned(),
                    )
                    .into())))
                }
                _ => continue,
            };

            let msg = serde_json::from_str(&text).map_err(Into::into);
            debug!("Received {} bytes: {:?}", text.len(), msg);
            return Poll::Ready(Some(msg));
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin, In, Out: Serialize + Debug> futures_util::Sink<Out>
    for WebSocketStream<S, In, Out>
{
    type Error = error::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(Into::into)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Out) -> Result<(), Self::Error> {
        debug!("Sending message: {:?}", item);
        Pin::new(&mut self.inner)
            .start_send(Message::Text(serde_json::to_string(&item)?))
            .map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(Into::into)
    }
}

impl<S, In, Out> From<tokio_tungstenite::WebSocketStream<S>> for WebSocketStream<S, In, Out> {
    fn from(inner: tokio_tungstenite::WebSocketStream<S>) -> Self {
        Self {
            inner,
            types: PhantomData,
        }
    }
}
