//! Kiosk Orchestrator - the single cooperative event loop
//!
//! One task interleaves five sources: the presence watch (last write wins),
//! the event channel fed by the turn runner, the render tick (lipsync), the
//! status tick (start listening when someone is present and nothing is
//! running) and shutdown. All state transitions go through
//! [`TurnController::dispatch`]; the loop only applies the resulting actions.

use crate::avatar::{AvatarReactor, SubtitlePresenter};
use crate::capture::AudioCaptureChannel;
use crate::config::{KioskConfig, TransportMode, TurnConfig};
use crate::error::KioskResult;
use crate::events::{
    event_channel, AnswerAudio, EventReceiver, EventSender, KioskEvent, TransportEvent, TurnTrigger,
};
use crate::playback::{AmplitudeTap, PlaybackNote, ResponsePlaybackSynchronizer};
use crate::presence::PresenceState;
use crate::transport::{DialogueReply, SessionTransport, Utterance};
use crate::turn::{Presentation, TurnAction, TurnController, TurnPhase};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Everything one turn needs, owned by whichever runner holds the lock.
pub struct TurnRunner {
    capture: Arc<AudioCaptureChannel>,
    transport: SessionTransport,
    playback: ResponsePlaybackSynchronizer,
    greeting_text: String,
}

impl TurnRunner {
    pub fn new(
        capture: Arc<AudioCaptureChannel>,
        transport: SessionTransport,
        playback: ResponsePlaybackSynchronizer,
        turn: &TurnConfig,
    ) -> Self {
        Self {
            capture,
            transport,
            playback,
            greeting_text: turn.greeting_text.clone(),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.transport.mode()
    }

    /// Run one turn and report how it ended. Always emits exactly one
    /// terminal event.
    pub async fn run(&mut self, trigger: TurnTrigger, events: &EventSender) {
        let outcome = match trigger {
            TurnTrigger::Greeting => self.greet(events).await,
            TurnTrigger::Listen | TurnTrigger::Manual => self.listen(events).await,
        };
        if let Err(e) = outcome {
            let event = if e.is_transport() {
                KioskEvent::Transport(TransportEvent::Failed(e.to_string()))
            } else if e.is_device() {
                KioskEvent::DeviceUnavailable(e.to_string())
            } else {
                KioskEvent::TurnFailed(e.to_string())
            };
            let _ = events.send(event);
        }
    }

    async fn greet(&mut self, events: &EventSender) -> KioskResult<()> {
        let reply = self.transport.greet(&self.greeting_text).await?;
        self.deliver(reply, events).await
    }

    async fn listen(&mut self, events: &EventSender) -> KioskResult<()> {
        let reply = match self.transport.mode() {
            TransportMode::Buffered => {
                let duration = self.capture.config().buffered_duration();
                let audio = self.capture.capture(duration).await?;
                let decision = self.capture.gate(&audio);
                if !decision.should_send() {
                    debug!(?decision, "quiet utterance");
                    let _ = events.send(KioskEvent::AudioSuppressed);
                    return Ok(());
                }
                let _ = events.send(KioskEvent::AudioGateOpened);
                self.transport.send(Utterance::Clip(audio)).await?
            }
            TransportMode::Streaming => match self.stream(events).await? {
                Some(reply) => reply,
                None => {
                    let _ = events.send(KioskEvent::AudioSuppressed);
                    return Ok(());
                }
            },
        };
        self.deliver(reply, events).await
    }

    /// Capture and transport run side by side; the transport only starts once
    /// the energy trigger fires. `None` means no speech was heard.
    async fn stream(&mut self, events: &EventSender) -> KioskResult<Option<DialogueReply>> {
        let (frames_tx, frames_rx) = mpsc::channel(32);
        let (opened_tx, opened_rx) = oneshot::channel::<()>();
        let capture = Arc::clone(&self.capture);
        let transport = &mut self.transport;
        let gate_events = events.clone();

        let capturing = capture.stream_utterance(frames_tx, move || {
            let _ = gate_events.send(KioskEvent::AudioGateOpened);
            let _ = opened_tx.send(());
        });
        let sending = async move {
            if opened_rx.await.is_err() {
                return None;
            }
            Some(transport.send(Utterance::Frames(frames_rx)).await)
        };
        let (captured, sent) = tokio::join!(capturing, sending);

        match (captured, sent) {
            (captured, Some(Ok(reply))) => {
                if let Err(e) = captured {
                    warn!(error = %e, "capture failed after the answer started");
                }
                Ok(Some(reply))
            }
            (_, Some(Err(e))) => Err(e),
            (Err(e), None) => Err(e),
            (Ok(outcome), None) => {
                debug!(?outcome, "no speech before trigger timeout");
                Ok(None)
            }
        }
    }

    async fn deliver(&mut self, reply: DialogueReply, events: &EventSender) -> KioskResult<()> {
        if reply.is_empty() {
            let _ = events.send(KioskEvent::Transport(TransportEvent::Empty));
            return Ok(());
        }
        let DialogueReply {
            user_text,
            mut answer,
            clarify,
            audio,
        } = reply;
        answer.audio = AnswerAudio::from(&audio);
        if let Some(text) = user_text {
            let _ = events.send(KioskEvent::Transport(TransportEvent::UserText(text)));
        }
        if let Some(text) = clarify {
            let _ = events.send(KioskEvent::Transport(TransportEvent::Clarify(text)));
            return Ok(());
        }
        let _ = events.send(KioskEvent::Transport(TransportEvent::Answer(answer)));

        let notes = events.clone();
        let report = self
            .playback
            .play(audio, move |note| {
                let event = match note {
                    PlaybackNote::Started(start) => TransportEvent::AudioStart {
                        sample_rate: start.sample_rate,
                        emotion: start.emotion,
                        gesture: start.gesture,
                    },
                    PlaybackNote::Video(url) => TransportEvent::VideoUrl(url),
                };
                let _ = notes.send(KioskEvent::Transport(event));
            })
            .await?;
        let _ = events.send(KioskEvent::PlaybackEnded {
            timed_out: report.timed_out,
        });
        Ok(())
    }
}

/// Cheap, cloneable control surface for a running [`KioskOrchestrator`].
#[derive(Clone)]
pub struct KioskHandle {
    events: EventSender,
    phases: broadcast::Sender<TurnPhase>,
    shutdown: Arc<Notify>,
}

impl KioskHandle {
    /// Manual retry. Subject to the same presence and busy gate as any turn.
    /// Returns false once the loop has stopped.
    pub fn request_turn(&self) -> bool {
        self.events
            .send(KioskEvent::TurnRequested(TurnTrigger::Manual))
            .is_ok()
    }

    /// Every phase change, in order.
    pub fn phases(&self) -> broadcast::Receiver<TurnPhase> {
        self.phases.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

pub struct KioskOrchestrator {
    controller: TurnController,
    runner: Arc<Mutex<TurnRunner>>,
    tap: AmplitudeTap,
    avatar: Box<dyn AvatarReactor>,
    presenter: Box<dyn SubtitlePresenter>,
    presence: watch::Receiver<PresenceState>,
    events_tx: EventSender,
    events_rx: EventReceiver,
    phases: broadcast::Sender<TurnPhase>,
    shutdown: Arc<Notify>,
    status_interval: Duration,
    render_interval: Duration,
    turn_task: Option<JoinHandle<()>>,
}

impl KioskOrchestrator {
    pub fn new(
        config: &KioskConfig,
        runner: TurnRunner,
        presence: watch::Receiver<PresenceState>,
        avatar: Box<dyn AvatarReactor>,
        presenter: Box<dyn SubtitlePresenter>,
    ) -> Self {
        let presentation = Presentation {
            subtitles_enabled: config.settings.subtitles_enabled,
            video_avatar: config.settings.video_avatar(),
        };
        let (events_tx, events_rx) = event_channel();
        let (phases, _) = broadcast::channel(64);
        let tap = runner.playback.tap();
        info!(mode = ?runner.mode(), "🎭 Kiosk orchestrator initialized");
        Self {
            controller: TurnController::new(config.turn.clone(), presentation),
            runner: Arc::new(Mutex::new(runner)),
            tap,
            avatar,
            presenter,
            presence,
            events_tx,
            events_rx,
            phases,
            shutdown: Arc::new(Notify::new()),
            status_interval: config.turn.status_interval(),
            render_interval: config.playback.render_interval(),
            turn_task: None,
        }
    }

    pub fn handle(&self) -> KioskHandle {
        KioskHandle {
            events: self.events_tx.clone(),
            phases: self.phases.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Run until [`KioskHandle::shutdown`].
    pub async fn run(mut self) {
        info!("🚀 Kiosk loop running");
        let mut status = interval(self.status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut render = interval(self.render_interval);
        render.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut presence_open = true;

        let present = self.presence.borrow_and_update().present;
        self.handle_event(KioskEvent::PresenceChanged(present));

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("🛑 Kiosk loop stopping");
                    break;
                }
                changed = self.presence.changed(), if presence_open => match changed {
                    Ok(()) => {
                        let present = self.presence.borrow_and_update().present;
                        self.handle_event(KioskEvent::PresenceChanged(present));
                    }
                    Err(_) => {
                        warn!("presence monitor stopped, keeping last presence");
                        presence_open = false;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                joined = join_turn(&mut self.turn_task) => {
                    self.turn_task = None;
                    self.reap_turn(joined);
                }
                _ = render.tick() => self.avatar.set_amplitude(self.tap.level()),
                _ = status.tick() => {
                    if self.controller.is_present() && !self.controller.is_busy() {
                        self.handle_event(KioskEvent::TurnRequested(TurnTrigger::Listen));
                    }
                }
            }
        }

        if let Some(task) = self.turn_task.take() {
            task.abort();
        }
    }

    fn handle_event(&mut self, event: KioskEvent) {
        let terminal = event.is_terminal();
        let actions = self.controller.dispatch(event, Instant::now());
        if terminal {
            debug!(actions = actions.len(), "terminal event applied");
        }
        for action in actions {
            self.apply(action);
        }
    }

    /// The runner task ended. Apply whatever it reported, then make sure the
    /// busy flag did not outlive it.
    fn reap_turn(&mut self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            error!(error = %e, "turn runner panicked");
        }
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
        }
        if self.controller.is_busy() {
            self.handle_event(KioskEvent::TurnFailed("turn ended without a result".to_string()));
        }
    }

    fn apply(&mut self, action: TurnAction) {
        match action {
            TurnAction::BeginTurn { id, trigger } => self.spawn_turn(id, trigger),
            TurnAction::PhaseChanged(phase) => {
                if phase == TurnPhase::Processing {
                    self.presenter.clear();
                }
                let _ = self.phases.send(phase);
            }
            TurnAction::SetEmotion(name) => self.avatar.set_emotion(&name),
            TurnAction::PlayGesture(name) => self.avatar.play_gesture(&name),
            TurnAction::ShowUserText(text) => self.presenter.show_user_text(&text),
            TurnAction::ShowAnswer { text, subtitles } => self.presenter.show_answer(&text, subtitles),
            TurnAction::ShowRouting(routing) => self.presenter.show_routing(&routing),
            TurnAction::ShowVideo(url) => self.presenter.show_video(&url),
            TurnAction::ShowNotice(notice) => self.presenter.show_notice(&notice),
        }
    }

    fn spawn_turn(&mut self, id: u64, trigger: TurnTrigger) {
        let runner = Arc::clone(&self.runner);
        let events = self.events_tx.clone();
        self.turn_task = Some(tokio::spawn(async move {
            let mut runner = runner.lock().await;
            debug!(id, ?trigger, "turn runner started");
            runner.run(trigger, &events).await;
        }));
    }
}

async fn join_turn(task: &mut Option<JoinHandle<()>>) -> Result<(), JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
