//! WebSocket transport for the signaling relay.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{decode_relay, encode_client, SignalEvent, SignalSender, SignalingChannel};
use crate::error::SignalingError;

/// Connect to the relay and spawn the reader and writer tasks.
///
/// There is no reconnect: a lost connection surfaces once as
/// [`SignalEvent::ChannelError`] and the session treats it as fatal.
pub async fn connect(url: &str) -> Result<SignalingChannel, SignalingError> {
    let (ws, _) = connect_async(url).await?;
    info!(url, "Signaling channel connected");
    let (mut sink, mut stream) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();

    let writer_err = in_tx.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match encode_client(&msg) {
                Ok(t) => t,
                Err(e) => {
                    warn!("Dropping unencodable signaling message: {e}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                let _ = writer_err.send(SignalEvent::ChannelError(e.to_string()));
                return;
            }
        }
        let _ = sink.close().await;
        debug!("Signaling writer finished");
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(t)) => t.as_str().to_owned(),
                Ok(Message::Close(_)) => {
                    let _ = in_tx.send(SignalEvent::ChannelError("closed by relay".into()));
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    let _ = in_tx.send(SignalEvent::ChannelError(e.to_string()));
                    return;
                }
            };
            match decode_relay(&text) {
                Ok(msg) => {
                    if in_tx.send(SignalEvent::Message(msg)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(frame = %text, "Dropping signaling frame: {e}"),
            }
        }
        let _ = in_tx.send(SignalEvent::ChannelError("relay stream ended".into()));
    });

    Ok(SignalingChannel::from_parts(
        SignalSender::new(out_tx),
        in_rx,
        vec![writer, reader],
    ))
}
