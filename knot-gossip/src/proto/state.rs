//! Multiplexing of topic states over one peer.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::topic::{self, Command, Config, Event, TopicState};
use super::{PeerIdentity, TopicId};

/// A gossip wire message, addressed to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message<PI> {
    /// The topic this message belongs to.
    pub topic: TopicId,
    /// The topic level message.
    pub message: topic::Message<PI>,
}

/// A timer for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    /// The topic the timer belongs to.
    pub topic: TopicId,
    /// The topic level timer.
    pub timer: topic::Timer,
}

/// Input event for the protocol state machine.
#[derive(Debug)]
pub enum InEvent<PI> {
    /// A message was received from a peer.
    RecvMessage(PI, Message<PI>),
    /// A command for a topic was issued by the application.
    Command(TopicId, Command<PI>),
    /// A timer scheduled earlier has expired.
    TimerExpired(Timer),
    /// The connection to a peer was lost.
    PeerDisconnected(PI),
}

/// Output event of the protocol state machine.
///
/// The caller must act on every event: send the message, schedule the timer
/// and feed it back as [`InEvent::TimerExpired`] when due, deliver the event
/// to subscribers of the topic, or drop the connection to the peer.
#[derive(Debug, PartialEq, Eq)]
pub enum OutEvent<PI> {
    /// Send a message to a peer.
    SendMessage(PI, Message<PI>),
    /// Emit an event to the subscribers of a topic.
    EmitEvent(TopicId, Event<PI>),
    /// Schedule a timer.
    ScheduleTimer(Duration, Timer),
    /// The peer is not needed by any topic anymore, close the connection.
    DisconnectPeer(PI),
}

/// The gossip state of a single peer, across all its topics.
///
/// Free of IO: drive it by calling [`State::handle`] and acting on the
/// returned events.
#[derive(Debug)]
pub struct State<PI> {
    me: PI,
    config: Config,
    topics: HashMap<TopicId, TopicState<PI>>,
}

impl<PI: PeerIdentity> State<PI> {
    /// Create a new state machine for the peer `me`.
    pub fn new(me: PI, config: Config) -> Self {
        Self {
            me,
            config,
            topics: Default::default(),
        }
    }

    /// The identity this state machine acts as.
    pub fn me(&self) -> &PI {
        &self.me
    }

    /// Whether the peer has local state for a topic.
    pub fn has_topic(&self, topic: &TopicId) -> bool {
        self.topics.contains_key(topic)
    }

    /// Handle an input event, returning the actions to take.
    pub fn handle(&mut self, event: InEvent<PI>) -> Vec<OutEvent<PI>> {
        trace!(me = ?self.me, ?event, "handle event");
        let mut out = Vec::new();
        match event {
            InEvent::Command(topic, command) => {
                let quit = matches!(command, Command::Quit);
                let state = self
                    .topics
                    .entry(topic)
                    .or_insert_with(|| TopicState::new(self.me, self.config.clone()));
                let mut topic_out = Vec::new();
                state.handle(topic::InEvent::Command(command), &mut topic_out);
                if quit {
                    self.topics.remove(&topic);
                }
                self.translate(topic, topic_out, &mut out);
            }
            InEvent::RecvMessage(from, message) => {
                // messages for topics we are not subscribed to are dropped
                if let Some(state) = self.topics.get_mut(&message.topic) {
                    let mut topic_out = Vec::new();
                    state.handle(
                        topic::InEvent::RecvMessage(from, message.message),
                        &mut topic_out,
                    );
                    self.translate(message.topic, topic_out, &mut out);
                }
            }
            InEvent::TimerExpired(timer) => {
                if let Some(state) = self.topics.get_mut(&timer.topic) {
                    let mut topic_out = Vec::new();
                    state.handle(topic::InEvent::TimerExpired(timer.timer), &mut topic_out);
                    self.translate(timer.topic, topic_out, &mut out);
                }
            }
            InEvent::PeerDisconnected(peer) => {
                let topics: Vec<TopicId> = self.topics.keys().copied().collect();
                for topic in topics {
                    let state = self.topics.get_mut(&topic).expect("just listed");
                    let mut topic_out = Vec::new();
                    state.handle(topic::InEvent::PeerDisconnected(peer), &mut topic_out);
                    self.translate(topic, topic_out, &mut out);
                }
            }
        }
        out
    }

    fn translate(
        &self,
        topic: TopicId,
        topic_out: Vec<topic::OutEvent<PI>>,
        out: &mut Vec<OutEvent<PI>>,
    ) {
        for event in topic_out {
            match event {
                topic::OutEvent::SendMessage(to, message) => {
                    out.push(OutEvent::SendMessage(to, Message { topic, message }))
                }
                topic::OutEvent::EmitEvent(event) => out.push(OutEvent::EmitEvent(topic, event)),
                topic::OutEvent::ScheduleTimer(delay, timer) => {
                    out.push(OutEvent::ScheduleTimer(delay, Timer { topic, timer }))
                }
                topic::OutEvent::DisconnectPeer(peer) => {
                    // keep the connection if another topic still uses the peer
                    let used = self
                        .topics
                        .iter()
                        .any(|(id, state)| *id != topic && state.neighbors().any(|n| *n == peer));
                    if !used {
                        out.push(OutEvent::DisconnectPeer(peer));
                    }
                }
            }
        }
    }
}
