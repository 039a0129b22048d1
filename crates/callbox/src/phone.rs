//! Call facade: one actor task per phone owns the signaling socket, the
//! current negotiator and every in-flight media acquisition.
//!
//! [`Phone`] is only a handle. Commands, transport events, media events and
//! acquisition results are all processed on the actor in arrival order, so the
//! negotiator never needs a lock. Acquisitions run on their own task and come
//! back tagged with the negotiator generation that requested them; a result
//! for a session that has since been closed or replaced is discarded and its
//! stream stopped.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use callbox_proto::{IceCandidate, SessionDescription, SignalingMessage};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::PhoneConfig;
use crate::events::{EventHub, Subscription};
use crate::media::{
    MediaConstraints, MediaError, MediaEvent, MediaEvents, MediaPlatform, MediaStream,
};
use crate::negotiator::{NegotiationError, NegotiationState, Negotiator};
use crate::transport::{SignalingSocket, TransportError, TransportEvent, TransportState};

#[derive(Debug, Clone, PartialEq)]
pub enum PhoneEvent<M> {
    Connected,
    Registered { id: String },
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    TransportFailed { attempts: u32 },
    IncomingCall { from: String, caller: Option<String> },
    LocalMedia(M),
    RemoteMedia(M),
    CallEstablished { peer: String },
    CallFailed { reason: String },
    CallEnded,
    RelayError { reason: String },
}

#[derive(Debug, Error)]
pub enum PhoneError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("not connected to the signaling relay")]
    NotConnected,
    #[error("call already in progress ({state})")]
    Busy { state: NegotiationState },
    #[error("call cancelled by hangup")]
    Cancelled,
    #[error("signaling socket is down, offer not sent")]
    SignalingUnavailable,
    #[error("phone task has stopped")]
    Stopped,
}

type Reply<T> = oneshot::Sender<Result<T, PhoneError>>;

enum Command {
    Connect { reply: Reply<()> },
    Call { target: String, reply: Reply<()> },
    Hangup { reply: Reply<()> },
}

#[derive(Debug, Clone)]
enum Purpose {
    Outgoing { target: String },
    Answering { peer: String },
}

struct Acquired<S> {
    generation: u64,
    purpose: Purpose,
    result: Result<S, MediaError>,
}

pub struct Phone<P: MediaPlatform> {
    name: &'static str,
    client_id: String,
    commands: mpsc::UnboundedSender<Command>,
    events: EventHub<PhoneEvent<P::Stream>>,
    state: watch::Receiver<NegotiationState>,
}

impl<P: MediaPlatform> Phone<P> {
    /// Spawn the phone actor. Must be called from within a Tokio runtime.
    pub fn new(config: PhoneConfig, platform: P) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (acquired_tx, acquired_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(NegotiationState::Idle);
        let events = EventHub::new();
        let name = platform.name();
        let client_id = config.client_id.clone();

        let actor = PhoneActor {
            config,
            platform: Arc::new(platform),
            events: events.clone(),
            state_tx,
            socket: None,
            transport_events: None,
            connected: false,
            negotiator: None,
            media_events: None,
            generation: 0,
            acquisition: None,
            pending_call: None,
            acquired_tx,
        };
        tokio::spawn(actor.run(commands_rx, acquired_rx));

        Self {
            name,
            client_id,
            commands: commands_tx,
            events,
            state: state_rx,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribe before connecting or calling; events are not replayed.
    pub fn subscribe(&self) -> Subscription<PhoneEvent<P::Stream>> {
        self.events.subscribe()
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<NegotiationState> {
        self.state.clone()
    }

    /// Open the signaling socket and prepare an idle session. Registration
    /// happens asynchronously on every successful (re)connect.
    pub async fn connect(&self) -> Result<(), PhoneError> {
        self.request(|reply| Command::Connect { reply }).await
    }

    /// Acquire local media and send an offer to `target`. Resolves once the
    /// offer has been handed to the socket.
    pub async fn call(&self, target: &str) -> Result<(), PhoneError> {
        let target = target.to_string();
        self.request(|reply| Command::Call { target, reply }).await
    }

    /// End the call and close the signaling socket.
    pub async fn hangup(&self) -> Result<(), PhoneError> {
        self.request(|reply| Command::Hangup { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, PhoneError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| PhoneError::Stopped)?;
        reply_rx.await.map_err(|_| PhoneError::Stopped)?
    }
}

struct PhoneActor<P: MediaPlatform> {
    config: PhoneConfig,
    platform: Arc<P>,
    events: EventHub<PhoneEvent<P::Stream>>,
    state_tx: watch::Sender<NegotiationState>,
    socket: Option<SignalingSocket>,
    transport_events: Option<Subscription<TransportEvent>>,
    connected: bool,
    negotiator: Option<Negotiator<P::Session>>,
    media_events: Option<MediaEvents<P::Stream>>,
    generation: u64,
    /// Generation of the negotiator waiting on an acquisition, if any.
    acquisition: Option<u64>,
    pending_call: Option<Reply<()>>,
    acquired_tx: mpsc::UnboundedSender<Acquired<P::Stream>>,
}

async fn next_transport_event(
    sub: &mut Option<Subscription<TransportEvent>>,
) -> TransportEvent {
    match sub {
        Some(sub) => match sub.recv().await {
            Some(event) => event,
            None => pending().await,
        },
        None => pending().await,
    }
}

async fn next_media_event<S>(rx: &mut Option<MediaEvents<S>>) -> MediaEvent<S> {
    match rx {
        Some(rx) => match rx.recv().await {
            Some(event) => event,
            None => pending().await,
        },
        None => pending().await,
    }
}

impl<P: MediaPlatform> PhoneActor<P> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut acquired: mpsc::UnboundedReceiver<Acquired<P::Stream>>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = next_transport_event(&mut self.transport_events) => {
                    self.handle_transport_event(event).await;
                }
                event = next_media_event(&mut self.media_events) => {
                    self.handle_media_event(event);
                }
                Some(done) = acquired.recv() => {
                    self.handle_acquired(done).await;
                }
            }
            self.publish_state();
        }

        debug!(target = "callbox::phone", client_id = %self.config.client_id, "phone handle dropped, shutting down");
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.close().await;
        }
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
    }

    fn emit(&self, event: PhoneEvent<P::Stream>) {
        self.events.emit(event);
    }

    fn publish_state(&self) {
        let state = self
            .negotiator
            .as_ref()
            .map(Negotiator::state)
            .unwrap_or(NegotiationState::Idle);
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn send(&self, message: &SignalingMessage) -> bool {
        self.socket
            .as_ref()
            .is_some_and(|socket| socket.send(message))
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let result = self.connect().await;
                self.publish_state();
                let _ = reply.send(result);
            }
            Command::Call { target, reply } => match self.start_call(target).await {
                Ok(()) => self.pending_call = Some(reply),
                Err(err) => {
                    self.publish_state();
                    let _ = reply.send(Err(err));
                }
            },
            Command::Hangup { reply } => {
                self.hangup().await;
                self.publish_state();
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Settle a pending `call()` once the actor's state reflects the outcome.
    fn resolve_call(&mut self, result: Result<(), PhoneError>) {
        self.publish_state();
        if let Some(reply) = self.pending_call.take() {
            let _ = reply.send(result);
        }
    }

    async fn connect(&mut self) -> Result<(), PhoneError> {
        if self.socket_usable() {
            return Ok(());
        }
        if let Some(stale) = self.socket.take() {
            debug!(target = "callbox::phone", state = ?stale.state(), "replacing finished signaling socket");
            stale.close();
            self.transport_events = None;
            self.connected = false;
        }
        let socket =
            SignalingSocket::new(&self.config.signaling_url, self.config.transport.clone())?;
        self.transport_events = Some(socket.subscribe());
        socket.open()?;
        info!(
            target = "callbox::phone",
            client_id = %self.config.client_id,
            url = %self.config.signaling_url,
            "connecting to signaling relay"
        );
        self.socket = Some(socket);
        if self.negotiator.as_ref().map_or(true, Negotiator::is_closed) {
            self.fresh_negotiator().await?;
        }
        Ok(())
    }

    /// Replace the current negotiator with a new one on a new media session.
    async fn fresh_negotiator(&mut self) -> Result<(), PhoneError> {
        if let Some(mut old) = self.negotiator.take() {
            old.close().await;
        }
        self.media_events = None;
        self.generation += 1;
        let (session, media_events) = self.platform.create_session().await?;
        self.negotiator = Some(Negotiator::new(
            self.generation,
            self.config.client_id.clone(),
            session,
        ));
        self.media_events = Some(media_events);
        debug!(target = "callbox::phone", generation = self.generation, "new negotiation session");
        Ok(())
    }

    fn current_state(&self) -> NegotiationState {
        self.negotiator
            .as_ref()
            .map(Negotiator::state)
            .unwrap_or(NegotiationState::Idle)
    }

    /// A socket that is open or still able to reconnect.
    fn socket_usable(&self) -> bool {
        self.socket.as_ref().is_some_and(|socket| {
            !matches!(
                socket.state(),
                TransportState::Exhausted | TransportState::Closed
            )
        })
    }

    async fn start_call(&mut self, target: String) -> Result<(), PhoneError> {
        if !self.socket_usable() {
            return Err(PhoneError::NotConnected);
        }
        let state = self.current_state();
        if self.acquisition.is_some()
            || !matches!(state, NegotiationState::Idle | NegotiationState::Closed)
        {
            return Err(PhoneError::Busy { state });
        }
        if self.negotiator.as_ref().map_or(true, Negotiator::is_closed) {
            self.fresh_negotiator().await?;
        }
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.set_peer(target.clone());
        }
        info!(target = "callbox::phone", peer = %target, "placing call");
        let constraints = self.config.media_constraints;
        self.spawn_acquisition(Purpose::Outgoing { target }, constraints);
        Ok(())
    }

    fn spawn_acquisition(&mut self, purpose: Purpose, constraints: MediaConstraints) {
        let generation = self.generation;
        let platform = Arc::clone(&self.platform);
        let done = self.acquired_tx.clone();
        self.acquisition = Some(generation);
        tokio::spawn(async move {
            let result = platform.acquire_local_media(&constraints).await;
            let _ = done.send(Acquired {
                generation,
                purpose,
                result,
            });
        });
    }

    async fn hangup(&mut self) {
        self.acquisition = None;
        let had_call = self
            .negotiator
            .as_ref()
            .is_some_and(|negotiator| !negotiator.is_closed());
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.close().await;
        }
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        self.transport_events = None;
        self.media_events = None;
        if self.connected {
            self.connected = false;
            self.emit(PhoneEvent::Disconnected);
        }
        if had_call {
            info!(target = "callbox::phone", client_id = %self.config.client_id, "call ended");
            self.emit(PhoneEvent::CallEnded);
        }
        self.resolve_call(Err(PhoneError::Cancelled));
    }

    async fn handle_acquired(&mut self, done: Acquired<P::Stream>) {
        let Acquired {
            generation,
            purpose,
            result,
        } = done;
        let current = self.acquisition == Some(generation)
            && self
                .negotiator
                .as_ref()
                .is_some_and(|n| n.generation() == generation && !n.is_closed());
        if !current {
            debug!(target = "callbox::phone", generation, "discarding media for a finished session");
            if let Ok(stream) = result {
                stream.stop();
            }
            return;
        }
        self.acquisition = None;

        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                warn!(target = "callbox::phone", error = %err, "local media unavailable");
                self.fail_call(PhoneError::Media(err)).await;
                return;
            }
        };
        self.emit(PhoneEvent::LocalMedia(stream.clone()));

        let outcome = match purpose {
            Purpose::Outgoing { target } => self.send_offer(stream, target).await,
            Purpose::Answering { peer } => self.send_answer(stream, peer).await,
        };
        if let Err(err) = outcome {
            self.fail_call(err).await;
        }
    }

    async fn send_offer(&mut self, stream: P::Stream, target: String) -> Result<(), PhoneError> {
        let Some(negotiator) = self.negotiator.as_mut() else {
            stream.stop();
            return Err(PhoneError::NotConnected);
        };
        negotiator.attach_local_stream(stream).await?;
        let offer = negotiator.create_offer().await?;
        let message = SignalingMessage::Offer {
            sdp: offer.sdp,
            target: target.clone(),
            caller: Some(self.config.client_id.clone()),
            from: None,
        };
        if !self.send(&message) {
            return Err(PhoneError::SignalingUnavailable);
        }
        info!(target = "callbox::phone", peer = %target, "offer sent");
        self.resolve_call(Ok(()));
        Ok(())
    }

    async fn send_answer(&mut self, stream: P::Stream, peer: String) -> Result<(), PhoneError> {
        let Some(negotiator) = self.negotiator.as_mut() else {
            stream.stop();
            return Err(PhoneError::NotConnected);
        };
        negotiator.attach_local_stream(stream).await?;
        let answer = negotiator.create_answer().await?;
        let message = SignalingMessage::Answer {
            sdp: answer.sdp,
            target: peer.clone(),
            from: None,
        };
        if !self.send(&message) {
            return Err(PhoneError::SignalingUnavailable);
        }
        info!(target = "callbox::phone", peer = %peer, "answer sent");
        self.emit(PhoneEvent::CallEstablished { peer });
        Ok(())
    }

    /// Tear the session down after a resource or send failure. The socket
    /// stays up so the phone can take or place another call.
    async fn fail_call(&mut self, err: PhoneError) {
        warn!(target = "callbox::phone", error = %err, "call failed");
        if let Some(negotiator) = self.negotiator.as_mut() {
            negotiator.close().await;
        }
        self.emit(PhoneEvent::CallFailed {
            reason: err.to_string(),
        });
        self.resolve_call(Err(err));
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.connected = true;
                self.emit(PhoneEvent::Connected);
                let register = SignalingMessage::Register {
                    id: self.config.client_id.clone(),
                };
                if !self.send(&register) {
                    warn!(target = "callbox::phone", "register not sent");
                }
                self.flush_local_candidates();
            }
            TransportEvent::Closed { reason } => {
                if self.connected {
                    self.connected = false;
                    info!(target = "callbox::phone", reason = %reason, "signaling connection lost");
                    self.emit(PhoneEvent::Disconnected);
                }
            }
            TransportEvent::Message(text) => match SignalingMessage::decode(&text) {
                Ok(message) => self.handle_signal(message).await,
                Err(err) => {
                    warn!(target = "callbox::phone", error = %err, "dropping unparseable signaling frame")
                }
            },
            TransportEvent::Error { message } => {
                debug!(target = "callbox::phone", error = %message, "signaling transport error");
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                self.emit(PhoneEvent::Reconnecting { attempt, delay });
            }
            TransportEvent::Exhausted { attempts } => {
                warn!(target = "callbox::phone", attempts, "signaling relay unreachable, giving up");
                self.emit(PhoneEvent::TransportFailed { attempts });
            }
        }
    }

    async fn handle_signal(&mut self, message: SignalingMessage) {
        debug!(target = "callbox::phone", kind = message.kind(), from = ?message.sender(), "signaling message received");
        match message {
            SignalingMessage::Registered { id } => {
                info!(target = "callbox::phone", id = %id, "registered with relay");
                self.emit(PhoneEvent::Registered { id });
            }
            SignalingMessage::Error { error } => {
                warn!(target = "callbox::phone", error = %error, "relay reported an error");
                self.emit(PhoneEvent::RelayError { reason: error });
            }
            SignalingMessage::Offer {
                sdp, caller, from, ..
            } => self.handle_offer(sdp, caller, from).await,
            SignalingMessage::Answer { sdp, from, .. } => self.handle_answer(sdp, from).await,
            SignalingMessage::Candidate {
                candidate, from, ..
            } => self.handle_candidate(candidate, from).await,
            SignalingMessage::Register { .. } => {
                debug!(target = "callbox::phone", "ignoring register frame from relay");
            }
        }
    }

    async fn handle_offer(&mut self, sdp: String, caller: Option<String>, from: Option<String>) {
        let Some(peer) = from.clone().or_else(|| caller.clone()) else {
            warn!(target = "callbox::phone", "dropping offer with no sender");
            return;
        };
        if self.acquisition.is_some() {
            warn!(target = "callbox::phone", peer = %peer, "negotiation in progress, dropping offer");
            return;
        }
        if self.negotiator.as_ref().map_or(true, Negotiator::is_closed) {
            if let Err(err) = self.fresh_negotiator().await {
                warn!(target = "callbox::phone", error = %err, "cannot create session for incoming call");
                return;
            }
        }
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        if let Err(err) = negotiator
            .accept_remote_offer(&SessionDescription::offer(sdp))
            .await
        {
            warn!(target = "callbox::phone", peer = %peer, error = %err, "dropping offer");
            return;
        }
        negotiator.set_peer(peer.clone());
        info!(target = "callbox::phone", peer = %peer, "incoming call");
        self.emit(PhoneEvent::IncomingCall {
            from: peer.clone(),
            caller,
        });
        let constraints = self.config.answer_constraints;
        self.spawn_acquisition(Purpose::Answering { peer }, constraints);
    }

    async fn handle_answer(&mut self, sdp: String, from: Option<String>) {
        let Some(negotiator) = self.negotiator.as_mut() else {
            warn!(target = "callbox::phone", "answer without a session, dropping");
            return;
        };
        if let (Some(from), Some(peer)) = (from.as_deref(), negotiator.peer()) {
            if from != peer {
                warn!(target = "callbox::phone", from, peer, "answer from unexpected peer, dropping");
                return;
            }
        }
        match negotiator
            .apply_remote_answer(&SessionDescription::answer(sdp))
            .await
        {
            Ok(()) => {
                let peer = negotiator.peer().unwrap_or_default().to_string();
                info!(target = "callbox::phone", peer = %peer, "call established");
                self.emit(PhoneEvent::CallEstablished { peer });
            }
            Err(err) => warn!(target = "callbox::phone", error = %err, "dropping answer"),
        }
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate, from: Option<String>) {
        let Some(negotiator) = self.negotiator.as_mut() else {
            debug!(target = "callbox::phone", "candidate without a session, dropping");
            return;
        };
        if let Err(err) = negotiator.add_remote_candidate(candidate).await {
            warn!(target = "callbox::phone", from = ?from, error = %err, "remote candidate dropped");
        }
    }

    fn handle_media_event(&mut self, event: MediaEvent<P::Stream>) {
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                let Some(negotiator) = self.negotiator.as_mut() else {
                    return;
                };
                if negotiator.is_closed() {
                    return;
                }
                negotiator.queue_local_candidate(candidate);
                self.flush_local_candidates();
            }
            MediaEvent::RemoteStream(stream) => {
                debug!(target = "callbox::phone", stream = stream.id(), "remote media received");
                self.emit(PhoneEvent::RemoteMedia(stream));
            }
            MediaEvent::ConnectionState(state) => {
                debug!(target = "callbox::phone", state = %state, "media connection state changed");
            }
        }
    }

    /// Send queued local candidates to the current peer. Anything that cannot
    /// be sent goes back on the queue for the next reconnect.
    fn flush_local_candidates(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        let Some(negotiator) = self.negotiator.as_mut() else {
            return;
        };
        let Some(peer) = negotiator.peer().map(str::to_string) else {
            return;
        };
        if !socket.is_open() {
            return;
        }
        let mut pending = negotiator.drain_local_candidates().into_iter();
        for candidate in pending.by_ref() {
            let message = SignalingMessage::Candidate {
                candidate: candidate.clone(),
                target: peer.clone(),
                from: None,
            };
            if !socket.send(&message) {
                negotiator.queue_local_candidate(candidate);
                break;
            }
        }
        for rest in pending {
            negotiator.queue_local_candidate(rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LoopbackPlatform;

    #[tokio::test]
    async fn call_before_connect_is_rejected() {
        let phone = Phone::new(
            PhoneConfig::new("alice", "ws://127.0.0.1:9"),
            LoopbackPlatform::new(),
        );
        assert!(matches!(phone.call("bob").await, Err(PhoneError::NotConnected)));
        assert_eq!(phone.state(), NegotiationState::Idle);
        assert_eq!(phone.name(), "loopback");
    }

    #[tokio::test]
    async fn invalid_signaling_url_fails_connect() {
        let phone = Phone::new(
            PhoneConfig::new("alice", "http://127.0.0.1:9"),
            LoopbackPlatform::new(),
        );
        assert!(matches!(
            phone.connect().await,
            Err(PhoneError::Transport(TransportError::InvalidUrl { .. }))
        ));
    }

    #[tokio::test]
    async fn hangup_while_acquiring_cancels_the_call() {
        let platform = LoopbackPlatform::gated();
        let phone = Phone::new(
            PhoneConfig::new("alice", "ws://127.0.0.1:9"),
            platform.clone(),
        );
        let mut events = phone.subscribe();
        phone.connect().await.expect("connect");

        let call = {
            let request = phone.call("bob");
            tokio::pin!(request);
            tokio::select! {
                _ = &mut request => panic!("call resolved before media was granted"),
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
            phone.hangup().await.expect("hangup");
            request.await
        };
        assert!(matches!(call, Err(PhoneError::Cancelled)));
        assert_eq!(phone.state(), NegotiationState::Closed);

        platform.release_acquisitions(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let streams = platform.streams();
        assert_eq!(streams.len(), 1);
        assert!(streams[0].is_stopped());
        assert_eq!(phone.state(), NegotiationState::Closed);

        while let Some(event) = events.try_recv() {
            assert!(
                !matches!(event, PhoneEvent::LocalMedia(_)),
                "late media must not be surfaced"
            );
        }
    }

    async fn wait_for_event<M>(
        events: &mut Subscription<PhoneEvent<M>>,
        mut pred: impl FnMut(&PhoneEvent<M>) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = events.recv().await.expect("phone event stream ended");
                if pred(&event) {
                    return;
                }
            }
        })
        .await
        .expect("expected phone event");
    }

    #[tokio::test]
    async fn connect_after_exhaustion_builds_a_new_socket() {
        use crate::transport::TransportConfig;
        use futures_util::StreamExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let transport = TransportConfig {
            reconnect_interval_ms: 10,
            reconnect_decay: 1.0,
            max_reconnect_interval_ms: 10,
            connect_timeout_ms: 1_000,
            ..TransportConfig::default()
        }
        .with_max_reconnect_attempts(1);
        let platform = LoopbackPlatform::new();
        let phone = Phone::new(
            PhoneConfig::new("alice", format!("ws://{addr}")).with_transport(transport),
            platform.clone(),
        );
        let mut events = phone.subscribe();
        phone.connect().await.expect("connect");
        wait_for_event(&mut events, |e| {
            matches!(e, PhoneEvent::TransportFailed { attempts: 1 })
        })
        .await;

        assert!(matches!(phone.call("bob").await, Err(PhoneError::NotConnected)));
        assert_eq!(platform.record().acquisitions, 0);

        let listener = TcpListener::bind(addr).await.expect("rebind");
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });

        phone.connect().await.expect("reconnect");
        wait_for_event(&mut events, |e| matches!(e, PhoneEvent::Connected)).await;
        phone.hangup().await.expect("hangup");
    }

    #[tokio::test]
    async fn denied_media_fails_the_call() {
        let platform = LoopbackPlatform::new();
        platform.deny_media("camera blocked");
        let phone = Phone::new(
            PhoneConfig::new("alice", "ws://127.0.0.1:9"),
            platform.clone(),
        );
        let mut events = phone.subscribe();
        phone.connect().await.expect("connect");

        assert!(matches!(
            phone.call("bob").await,
            Err(PhoneError::Media(MediaError::PermissionDenied(_)))
        ));
        assert_eq!(phone.state(), NegotiationState::Closed);
        let mut failed = false;
        while let Some(event) = events.try_recv() {
            failed |= matches!(event, PhoneEvent::CallFailed { .. });
        }
        assert!(failed);
    }
}
