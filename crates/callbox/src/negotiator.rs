//! Offer/answer state machine for one call.
//!
//! ```text
//! Idle ──create_offer──▶ HaveLocalOffer ──apply_remote_answer──▶ Stable
//!  │                                                              ▲
//!  └──accept_remote_offer──▶ HaveRemoteOffer ──create_answer──────┘
//! any ──close──▶ Closed
//! ```
//!
//! A transition that is not legal from the current state returns
//! [`NegotiationError::InvalidState`] and leaves everything untouched. Remote
//! candidates that arrive before any remote description are held back and
//! applied in arrival order once one is set.

use std::collections::VecDeque;
use std::fmt;

use callbox_proto::{DescriptionKind, IceCandidate, SessionDescription};
use thiserror::Error;
use tracing::{debug, warn};

use crate::media::{MediaError, MediaSession, MediaStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::Stable => "stable",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        operation: &'static str,
        state: NegotiationState,
    },
    #[error("expected a remote {expected:?}, got {actual:?}")]
    UnexpectedDescription {
        expected: DescriptionKind,
        actual: DescriptionKind,
    },
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    Buffered,
}

pub struct Negotiator<S: MediaSession> {
    generation: u64,
    local_id: String,
    peer: Option<String>,
    state: NegotiationState,
    session: S,
    local_stream: Option<S::Stream>,
    remote_description_set: bool,
    pending_remote: Vec<IceCandidate>,
    pending_local: VecDeque<IceCandidate>,
}

impl<S: MediaSession> Negotiator<S> {
    pub fn new(generation: u64, local_id: impl Into<String>, session: S) -> Self {
        Self {
            generation,
            local_id: local_id.into(),
            peer: None,
            state: NegotiationState::Idle,
            session,
            local_stream: None,
            remote_description_set: false,
            pending_remote: Vec::new(),
            pending_local: VecDeque::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn set_peer(&mut self, peer: impl Into<String>) {
        self.peer = Some(peer.into());
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn local_stream(&self) -> Option<&S::Stream> {
        self.local_stream.as_ref()
    }

    pub fn buffered_remote_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[NegotiationState],
    ) -> Result<(), NegotiationError> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        warn!(
            target = "callbox::negotiator",
            generation = self.generation,
            operation,
            state = %self.state,
            "negotiation step rejected"
        );
        Err(NegotiationError::InvalidState {
            operation,
            state: self.state,
        })
    }

    fn transition(&mut self, next: NegotiationState) {
        debug!(
            target = "callbox::negotiator",
            generation = self.generation,
            from = %self.state,
            to = %next,
            "negotiation state changed"
        );
        self.state = next;
    }

    /// Hand the acquired stream to the media session. Once closed, the stream
    /// is stopped instead of attached.
    pub async fn attach_local_stream(&mut self, stream: S::Stream) -> Result<(), NegotiationError> {
        if let Err(err) = self.require(
            "attach_local_stream",
            &[
                NegotiationState::Idle,
                NegotiationState::HaveLocalOffer,
                NegotiationState::HaveRemoteOffer,
                NegotiationState::Stable,
            ],
        ) {
            stream.stop();
            return Err(err);
        }
        if let Err(err) = self.session.attach_local_stream(&stream).await {
            stream.stop();
            return Err(err.into());
        }
        if let Some(previous) = self.local_stream.replace(stream) {
            previous.stop();
        }
        Ok(())
    }

    pub async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.require("create_offer", &[NegotiationState::Idle])?;
        let offer = self
            .session
            .create_local_description(DescriptionKind::Offer)
            .await?;
        self.session.apply_local_description(&offer).await?;
        self.transition(NegotiationState::HaveLocalOffer);
        Ok(offer)
    }

    /// First half of answering: apply the remote offer and release any
    /// candidates that arrived ahead of it.
    pub async fn accept_remote_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.require("accept_remote_offer", &[NegotiationState::Idle])?;
        if offer.kind != DescriptionKind::Offer {
            return Err(NegotiationError::UnexpectedDescription {
                expected: DescriptionKind::Offer,
                actual: offer.kind,
            });
        }
        self.session.apply_remote_description(offer).await?;
        self.remote_description_set = true;
        self.transition(NegotiationState::HaveRemoteOffer);
        self.flush_remote_candidates().await;
        Ok(())
    }

    pub async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.require("create_answer", &[NegotiationState::HaveRemoteOffer])?;
        let answer = self
            .session
            .create_local_description(DescriptionKind::Answer)
            .await?;
        self.session.apply_local_description(&answer).await?;
        self.transition(NegotiationState::Stable);
        Ok(answer)
    }

    pub async fn apply_remote_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.accept_remote_offer(offer).await?;
        self.create_answer().await
    }

    pub async fn apply_remote_answer(
        &mut self,
        answer: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.require("apply_remote_answer", &[NegotiationState::HaveLocalOffer])?;
        if answer.kind != DescriptionKind::Answer {
            return Err(NegotiationError::UnexpectedDescription {
                expected: DescriptionKind::Answer,
                actual: answer.kind,
            });
        }
        self.session.apply_remote_description(answer).await?;
        self.remote_description_set = true;
        self.transition(NegotiationState::Stable);
        self.flush_remote_candidates().await;
        Ok(())
    }

    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, NegotiationError> {
        self.require(
            "add_remote_candidate",
            &[
                NegotiationState::Idle,
                NegotiationState::HaveLocalOffer,
                NegotiationState::HaveRemoteOffer,
                NegotiationState::Stable,
            ],
        )?;
        if !self.remote_description_set {
            debug!(
                target = "callbox::negotiator",
                generation = self.generation,
                buffered = self.pending_remote.len() + 1,
                "buffering remote candidate until a remote description is set"
            );
            self.pending_remote.push(candidate);
            return Ok(CandidateOutcome::Buffered);
        }
        self.session.add_ice_candidate(&candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    async fn flush_remote_candidates(&mut self) {
        if self.pending_remote.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_remote);
        debug!(
            target = "callbox::negotiator",
            generation = self.generation,
            count = pending.len(),
            "applying buffered remote candidates"
        );
        for candidate in pending {
            if let Err(err) = self.session.add_ice_candidate(&candidate).await {
                warn!(
                    target = "callbox::negotiator",
                    generation = self.generation,
                    candidate = %candidate.candidate,
                    error = %err,
                    "buffered remote candidate rejected"
                );
            }
        }
    }

    pub fn queue_local_candidate(&mut self, candidate: IceCandidate) {
        if self.is_closed() {
            return;
        }
        self.pending_local.push_back(candidate);
    }

    pub fn drain_local_candidates(&mut self) -> Vec<IceCandidate> {
        self.pending_local.drain(..).collect()
    }

    pub fn pending_local_candidates(&self) -> usize {
        self.pending_local.len()
    }

    /// Tear down the call. Safe to call from any state, any number of times.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.transition(NegotiationState::Closed);
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }
        self.session.close().await;
        self.pending_remote.clear();
        self.pending_local.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LoopbackPlatform, LoopbackSession, MediaConstraints, MediaPlatform};

    async fn negotiator(platform: &LoopbackPlatform, id: &str) -> Negotiator<LoopbackSession> {
        let (session, _events) = platform.create_session().await.expect("session");
        let mut negotiator = Negotiator::new(1, id, session);
        let stream = platform
            .acquire_local_media(&MediaConstraints::default())
            .await
            .expect("media");
        negotiator.attach_local_stream(stream).await.expect("attach");
        negotiator
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn offer_answer_reaches_stable_on_both_sides() {
        let platform = LoopbackPlatform::new();
        let mut alice = negotiator(&platform, "alice").await;
        let mut bob = negotiator(&platform, "bob").await;

        let offer = alice.create_offer().await.expect("offer");
        assert_eq!(alice.state(), NegotiationState::HaveLocalOffer);

        let answer = bob.apply_remote_offer(&offer).await.expect("answer");
        assert_eq!(bob.state(), NegotiationState::Stable);
        assert_eq!(answer.kind, DescriptionKind::Answer);

        alice.apply_remote_answer(&answer).await.expect("apply answer");
        assert_eq!(alice.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn illegal_steps_keep_the_previous_state() {
        let platform = LoopbackPlatform::new();
        let mut alice = negotiator(&platform, "alice").await;
        let answer = SessionDescription::answer("v=0\r\n");

        assert!(matches!(
            alice.apply_remote_answer(&answer).await,
            Err(NegotiationError::InvalidState {
                operation: "apply_remote_answer",
                state: NegotiationState::Idle
            })
        ));
        assert_eq!(alice.state(), NegotiationState::Idle);

        alice.create_offer().await.expect("offer");
        assert!(alice.create_offer().await.is_err());
        assert!(alice.create_answer().await.is_err());
        assert_eq!(alice.state(), NegotiationState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn second_remote_offer_is_rejected_once_stable() {
        let platform = LoopbackPlatform::new();
        let mut alice = negotiator(&platform, "alice").await;
        let mut bob = negotiator(&platform, "bob").await;
        let offer = alice.create_offer().await.expect("offer");

        bob.apply_remote_offer(&offer).await.expect("first offer");
        assert!(matches!(
            bob.apply_remote_offer(&offer).await,
            Err(NegotiationError::InvalidState {
                state: NegotiationState::Stable,
                ..
            })
        ));
        assert_eq!(bob.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn remote_offer_is_rejected_while_our_offer_is_pending() {
        let platform = LoopbackPlatform::new();
        let mut alice = negotiator(&platform, "alice").await;
        let mut bob = negotiator(&platform, "bob").await;
        alice.create_offer().await.expect("alice offer");
        let crossing = bob.create_offer().await.expect("bob offer");

        assert!(matches!(
            alice.accept_remote_offer(&crossing).await,
            Err(NegotiationError::InvalidState {
                operation: "accept_remote_offer",
                state: NegotiationState::HaveLocalOffer
            })
        ));
        assert!(alice.apply_remote_offer(&crossing).await.is_err());
        assert_eq!(alice.state(), NegotiationState::HaveLocalOffer);
        assert!(alice.session().remote_description().is_none());
    }

    #[tokio::test]
    async fn second_remote_offer_is_rejected_before_answering() {
        let platform = LoopbackPlatform::new();
        let mut alice = negotiator(&platform, "alice").await;
        let mut bob = negotiator(&platform, "bob").await;
        let mut carol = negotiator(&platform, "carol").await;
        let first = alice.create_offer().await.expect("alice offer");
        let second = carol.create_offer().await.expect("carol offer");

        bob.accept_remote_offer(&first).await.expect("first offer");
        assert!(matches!(
            bob.accept_remote_offer(&second).await,
            Err(NegotiationError::InvalidState {
                operation: "accept_remote_offer",
                state: NegotiationState::HaveRemoteOffer
            })
        ));
        assert_eq!(bob.state(), NegotiationState::HaveRemoteOffer);
        assert_eq!(bob.session().remote_description(), Some(first));

        let answer = bob.create_answer().await.expect("answer");
        alice.apply_remote_answer(&answer).await.expect("apply answer");
        assert_eq!(alice.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn early_candidates_are_applied_in_order_after_the_answer() {
        let platform = LoopbackPlatform::new();
        let mut alice = negotiator(&platform, "alice").await;
        let mut bob = negotiator(&platform, "bob").await;
        let offer = alice.create_offer().await.expect("offer");

        for n in 1..=3 {
            assert_eq!(
                alice.add_remote_candidate(candidate(n)).await.expect("buffer"),
                CandidateOutcome::Buffered
            );
        }
        assert_eq!(alice.buffered_remote_candidates(), 3);
        assert!(alice.session().applied_candidates().is_empty());

        let answer = bob.apply_remote_offer(&offer).await.expect("answer");
        alice.apply_remote_answer(&answer).await.expect("apply answer");
        assert_eq!(
            alice.add_remote_candidate(candidate(4)).await.expect("apply"),
            CandidateOutcome::Applied
        );

        assert_eq!(alice.buffered_remote_candidates(), 0);
        assert_eq!(
            alice.session().applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3), candidate(4)]
        );
    }

    #[tokio::test]
    async fn accept_then_answer_flushes_buffer_before_answering() {
        let platform = LoopbackPlatform::new();
        let mut alice = negotiator(&platform, "alice").await;
        let (session, _events) = platform.create_session().await.expect("session");
        let mut bob = Negotiator::new(2, "bob", session);
        let offer = alice.create_offer().await.expect("offer");

        bob.add_remote_candidate(candidate(7)).await.expect("buffer");
        bob.accept_remote_offer(&offer).await.expect("accept");
        assert_eq!(bob.state(), NegotiationState::HaveRemoteOffer);
        assert_eq!(bob.session().applied_candidates(), vec![candidate(7)]);

        bob.create_answer().await.expect("answer");
        assert_eq!(bob.state(), NegotiationState::Stable);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_media() {
        let platform = LoopbackPlatform::new();
        let mut alice = negotiator(&platform, "alice").await;
        alice.create_offer().await.expect("offer");
        alice.queue_local_candidate(candidate(1));
        alice.add_remote_candidate(candidate(2)).await.expect("buffer");

        alice.close().await;
        alice.close().await;
        assert_eq!(alice.state(), NegotiationState::Closed);
        assert!(alice.session().is_closed());
        assert!(platform.streams()[0].is_stopped());
        assert_eq!(alice.pending_local_candidates(), 0);
        assert_eq!(alice.buffered_remote_candidates(), 0);
        assert_eq!(platform.record().sessions_closed, 1);

        let late = platform
            .acquire_local_media(&MediaConstraints::audio_only())
            .await
            .expect("media");
        assert!(alice.attach_local_stream(late.clone()).await.is_err());
        assert!(late.is_stopped());
        assert!(alice.add_remote_candidate(candidate(3)).await.is_err());
    }
}
