//! Persistent-channel transport over a WebSocket.
//!
//! A background reader parses every inbound frame into a queue. `send` forwards
//! capture frames until the service transcribes the visitor, returns at the
//! `answer` event, and hands the queue to an audio pump that feeds playback.
//! The pump holds the queue until the answer audio ends, so the next turn
//! cannot read frames that belong to this one. A turn that ends any other
//! way retires the channel, and the next turn opens a fresh one.

use super::client::DialogueClient;
use super::protocol::{self, StreamEvent};
use super::{AudioStart, DialogueReply, DialogueTransport, PcmStream, ReplyAudio, ReplyEvent, Utterance};
use crate::audio::AudioFrame;
use crate::config::TransportMode;
use crate::error::{KioskError, KioskResult};
use crate::events::Answer;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Inbox = mpsc::UnboundedReceiver<Inbound>;

#[derive(Debug)]
enum Inbound {
    Event(StreamEvent),
    Malformed(String),
    Closed(String),
}

struct Link {
    writer: SplitSink<WsStream, Message>,
    inbox: Arc<Mutex<Inbox>>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct StreamingTransport {
    url: String,
    connect_timeout: Duration,
    answer_timeout: Duration,
    client: DialogueClient,
    link: Option<Link>,
}

impl StreamingTransport {
    pub fn new(client: DialogueClient) -> Self {
        let service = client.service();
        Self {
            url: service.stream_url(),
            connect_timeout: service.connect_timeout(),
            answer_timeout: service.request_timeout(),
            client,
            link: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .map_or(false, |l| l.connected.load(Ordering::SeqCst))
    }

    async fn connect(&self) -> KioskResult<Link> {
        info!(url = %self.url, "Connecting to dialogue stream");
        let ws = match timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return Err(KioskError::Connect(e.to_string())),
            Err(_) => {
                return Err(KioskError::Connect(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )))
            }
        };
        let (writer, reader) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_frames(reader, tx, Arc::clone(&connected)));
        Ok(Link {
            writer,
            inbox: Arc::new(Mutex::new(rx)),
            connected,
            reader,
        })
    }

    /// Reuse the live channel, or reconnect if it dropped since the last turn.
    async fn ensure_link(&mut self) -> KioskResult<()> {
        if let Some(link) = &self.link {
            let mut inbox = link.inbox.lock().await;
            while let Ok(stale) = inbox.try_recv() {
                debug!(?stale, "discarding frame left over from the previous turn");
            }
            drop(inbox);
            if link.connected.load(Ordering::SeqCst) {
                return Ok(());
            }
            info!("dialogue stream dropped, reconnecting");
        }
        self.link = None;
        self.link = Some(self.connect().await?);
        Ok(())
    }
}

async fn read_frames(
    mut reader: SplitStream<WsStream>,
    tx: mpsc::UnboundedSender<Inbound>,
    connected: Arc<AtomicBool>,
) {
    let reason = loop {
        let inbound = match reader.next().await {
            Some(Ok(Message::Text(text))) => match protocol::parse_text(&text) {
                Ok(Some(event)) => Inbound::Event(event),
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "malformed stream frame");
                    Inbound::Malformed(e.to_string())
                }
            },
            Some(Ok(Message::Binary(bytes))) => match protocol::parse_binary(&bytes) {
                Ok(event) => Inbound::Event(event),
                Err(e) => {
                    warn!(error = %e, "malformed audio frame");
                    Inbound::Malformed(e.to_string())
                }
            },
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or_else(|| "closed by service".to_string(), |f| f.reason.to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        };
        // Nobody listening just means the transport is gone; keep draining.
        let _ = tx.send(inbound);
    };
    connected.store(false, Ordering::SeqCst);
    debug!(%reason, "dialogue stream reader finished");
    let _ = tx.send(Inbound::Closed(reason));
}

async fn next_frame(frames: &mut Option<mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn spawn_audio_pump(inbox: OwnedMutexGuard<Inbox>, connected: Arc<AtomicBool>) -> PcmStream {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(pump_answer_audio(inbox, tx, connected));
    rx
}

/// Feed answer audio to playback until `audio_end`. If playback gives up
/// first, or the answer aborts, the rest of this answer is still in flight,
/// so the channel is marked down and the next turn reconnects.
async fn pump_answer_audio(
    mut inbox: OwnedMutexGuard<Inbox>,
    tx: mpsc::Sender<ReplyEvent>,
    connected: Arc<AtomicBool>,
) {
    loop {
        let inbound = tokio::select! {
            inbound = inbox.recv() => inbound,
            _ = tx.closed() => {
                debug!("playback stopped reading answer audio");
                connected.store(false, Ordering::SeqCst);
                return;
            }
        };
        let (event, last) = match inbound {
            Some(Inbound::Event(StreamEvent::AudioStart {
                sample_rate,
                channels,
                emotion,
                gesture,
                ..
            })) => (
                ReplyEvent::Start(AudioStart {
                    sample_rate,
                    channels,
                    emotion,
                    gesture,
                }),
                false,
            ),
            Some(Inbound::Event(StreamEvent::AudioChunk(pcm))) => (ReplyEvent::Chunk(pcm), false),
            Some(Inbound::Event(StreamEvent::VideoUrl { url })) => (ReplyEvent::Video(url), false),
            Some(Inbound::Event(StreamEvent::AudioEnd)) => (ReplyEvent::End, true),
            Some(Inbound::Event(StreamEvent::Error { message })) => {
                (ReplyEvent::Abort(KioskError::Remote(message)), true)
            }
            Some(Inbound::Event(other)) => {
                debug!(?other, "ignoring frame during answer audio");
                continue;
            }
            Some(Inbound::Malformed(reason)) => {
                (ReplyEvent::Abort(KioskError::MalformedFrame(reason)), true)
            }
            Some(Inbound::Closed(reason)) => {
                debug!(%reason, "channel closed mid-answer, treating as audio end");
                (ReplyEvent::End, true)
            }
            None => (ReplyEvent::End, true),
        };
        let aborted = matches!(event, ReplyEvent::Abort(_));
        if tx.send(event).await.is_err() || aborted {
            connected.store(false, Ordering::SeqCst);
            return;
        }
        if last {
            return;
        }
    }
}

/// One turn on the channel: forward frames until the service answers.
async fn exchange(
    link: &mut Link,
    frames: mpsc::Receiver<AudioFrame>,
    answer_timeout: Duration,
) -> KioskResult<DialogueReply> {
    let deadline = Instant::now() + answer_timeout;
    let mut inbox = Arc::clone(&link.inbox).lock_owned().await;
    let mut frames = Some(frames);
    let mut reply = DialogueReply::default();

    loop {
        tokio::select! {
            frame = next_frame(&mut frames) => match frame {
                Some(frame) => {
                    if let Err(e) = link.writer.send(Message::Binary(frame.payload.into())).await {
                        link.connected.store(false, Ordering::SeqCst);
                        return Err(KioskError::ChannelClosed(e.to_string()));
                    }
                }
                None => {
                    debug!("capture finished sending frames");
                    frames = None;
                }
            },
            inbound = inbox.recv() => match inbound {
                Some(Inbound::Event(event)) => match event {
                    StreamEvent::UserText { text } => {
                        // The service has the whole utterance; stop the microphone.
                        frames = None;
                        reply.user_text = Some(text);
                    }
                    StreamEvent::Answer { text, emotion, gesture } => {
                        reply.answer = Answer {
                            text,
                            emotion: emotion.filter(|e| !e.is_empty()),
                            gesture: gesture.filter(|g| !g.is_empty()),
                            video_url: reply.answer.video_url.take(),
                            ..Default::default()
                        };
                        reply.audio = ReplyAudio::Pcm(spawn_audio_pump(inbox, Arc::clone(&link.connected)));
                        return Ok(reply);
                    }
                    StreamEvent::Clarify { text } => {
                        reply.clarify = Some(text);
                        return Ok(reply);
                    }
                    StreamEvent::VideoUrl { url } => reply.answer.video_url = Some(url),
                    StreamEvent::Error { message } => return Err(KioskError::Remote(message)),
                    other => {
                        return Err(KioskError::MalformedFrame(format!(
                            "{other:?} before answer"
                        )));
                    }
                },
                Some(Inbound::Malformed(reason)) => return Err(KioskError::MalformedFrame(reason)),
                Some(Inbound::Closed(reason)) => return Err(KioskError::ChannelClosed(reason)),
                None => return Err(KioskError::ChannelClosed("reader stopped".to_string())),
            },
            _ = sleep_until(deadline) => {
                return Err(KioskError::Remote(format!(
                    "no answer within {:?}",
                    answer_timeout
                )));
            }
        }
    }
}

#[async_trait::async_trait]
impl DialogueTransport for StreamingTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Streaming
    }

    async fn open(&mut self) -> KioskResult<()> {
        self.ensure_link().await
    }

    async fn send(&mut self, utterance: Utterance) -> KioskResult<DialogueReply> {
        let Utterance::Frames(frames) = utterance else {
            return Err(KioskError::Config(
                "streaming transport expects live frames".to_string(),
            ));
        };
        self.ensure_link().await?;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| KioskError::ChannelClosed("no dialogue stream".to_string()))?;
        let result = exchange(link, frames, self.answer_timeout).await;
        if let Err(e) = &result {
            // Whatever the service still sends for this turn must not reach the next one.
            debug!(error = %e, "retiring dialogue stream after an unfinished turn");
            self.link = None;
        }
        result
    }

    async fn greet(&mut self, text: &str) -> KioskResult<DialogueReply> {
        Ok(self.client.greet(text).await?.into())
    }
}
