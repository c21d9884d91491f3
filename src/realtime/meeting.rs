//! Meeting-level wrapper with roster tracking.
//!
//! `MeetingSession` forwards every inbound envelope from a [`SessionClient`]
//! into a queue and decodes it into a [`ServerEvent`] on `recv`, keeping an
//! in-memory participant roster up to date along the way.

use tokio::sync::mpsc;

use crate::realtime::client::{ConnectionParams, SessionClient, SessionClientError};
use crate::realtime::proto::{Envelope, Participant, ServerEvent};
use crate::realtime::registry::Subscription;

/// Joined meeting. Dropping it disconnects the underlying client.
#[derive(Debug)]
pub struct MeetingSession {
    client: SessionClient,
    session_id: String,
    forwarder: Option<Subscription>,
    events: mpsc::UnboundedReceiver<Envelope>,
    participants: Vec<Participant>,
    ended: bool,
    /// Connection stopped for good; only queued events remain.
    finished: bool,
}

impl MeetingSession {
    /// Connects `client` and starts collecting meeting events.
    ///
    /// Events delivered during the handshake are already queued when this
    /// returns, including the CONNECTED envelope.
    pub async fn join(
        client: &SessionClient,
        params: ConnectionParams,
    ) -> Result<Self, SessionClientError> {
        let session = Self::attach(client, params.session_id.trim());
        client.connect(params).await?;
        Ok(session)
    }

    fn attach(client: &SessionClient, session_id: &str) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let forwarder = client.on_envelope(move |envelope| {
            let _ = tx.send(envelope.clone());
        });
        Self {
            client: client.clone(),
            session_id: session_id.to_string(),
            forwarder: Some(forwarder),
            events,
            participants: Vec::new(),
            ended: false,
            finished: false,
        }
    }

    /// Waits for the next meeting event.
    ///
    /// Returns `None` once the connection has stopped for good and the
    /// queued events are drained. That happens after MEETING_ENDED, a normal
    /// close from the server, exhausted reconnects, or `disconnect`.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        let envelope = if self.ended || self.finished {
            self.events.try_recv().ok()?
        } else {
            tokio::select! {
                biased;
                envelope = self.events.recv() => envelope?,
                _ = self.client.closed() => {
                    self.finished = true;
                    self.events.try_recv().ok()?
                }
            }
        };
        let event = ServerEvent::from_envelope(&envelope);
        self.apply(&event);
        Some(event)
    }

    fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::ParticipantList(list) => {
                self.participants = list.participants.clone();
            }
            ServerEvent::UserJoined(participant) => {
                if !self.participants.iter().any(|known| known.same_as(participant)) {
                    self.participants.push(participant.clone());
                }
            }
            ServerEvent::UserLeft(participant) => {
                self.participants.retain(|known| !known.same_as(participant));
            }
            ServerEvent::MeetingEnded => {
                self.ended = true;
                self.client.disconnect();
            }
            _ => {}
        }
    }

    /// Participants known from the events received so far.
    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    /// Returns `true` once MEETING_ENDED has been received.
    pub fn has_ended(&self) -> bool {
        self.ended
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    /// Sends a chat message; see [`SessionClient::send_chat`].
    pub fn send_chat(&self, text: impl Into<String>) -> bool {
        self.client.send_chat(text)
    }

    pub fn request_recognition(&self) -> bool {
        self.client.request_recognition()
    }

    /// Leaves the meeting and closes the connection.
    pub fn leave(self) {
        drop(self);
    }
}

impl Drop for MeetingSession {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.unsubscribe();
        }
        self.client.disconnect();
    }
}
