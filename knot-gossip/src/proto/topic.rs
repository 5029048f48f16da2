//! Protocol state for a single topic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::PeerIdentity;

/// Protocol configuration, shared by all topics.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of neighbors per topic.
    pub max_neighbors: usize,
    /// Interval at which joining is retried while a topic has no neighbors.
    pub join_retry: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_neighbors: 8,
            join_retry: Duration::from_secs(5),
        }
    }
}

/// Wire messages within a single topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message<PI> {
    /// Ask the receiver to become a neighbor.
    Join,
    /// Answer to a join, carrying other peers on the topic.
    JoinAck {
        /// Other peers the receiver may try to join.
        peers: Vec<PI>,
    },
    /// A broadcast message, flooded through the mesh.
    Broadcast {
        /// The peer that originally broadcast the message.
        origin: PI,
        /// Sequence number, counted per origin.
        seq: u64,
        /// The message payload.
        content: Bytes,
    },
}

/// Commands from the application.
#[derive(Debug)]
pub enum Command<PI> {
    /// Join the topic, bootstrapping from the given peers.
    Join(Vec<PI>),
    /// Broadcast a message to all peers on the topic.
    Broadcast(Bytes),
    /// Leave the topic.
    Quit,
}

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<PI> {
    /// The topic was joined locally.
    ///
    /// Emitted as soon as local state exists, independent of whether any
    /// bootstrap peer was reachable.
    Joined,
    /// A peer became a neighbor on this topic.
    NeighborUp(PI),
    /// A neighbor went away.
    NeighborDown(PI),
    /// A broadcast message was received.
    Received(ReceivedMessage<PI>),
}

/// A received broadcast message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage<PI> {
    /// The message payload.
    pub content: Bytes,
    /// The neighbor that delivered the message to us. Not necessarily the
    /// origin of the broadcast.
    pub delivered_from: PI,
}

/// Timers a topic may schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// Re-send joins while the topic has no neighbors.
    RetryJoin,
}

/// Input to the topic state machine.
#[derive(Debug)]
pub(crate) enum InEvent<PI> {
    RecvMessage(PI, Message<PI>),
    Command(Command<PI>),
    TimerExpired(Timer),
    PeerDisconnected(PI),
}

/// Output of the topic state machine.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OutEvent<PI> {
    SendMessage(PI, Message<PI>),
    EmitEvent(Event<PI>),
    ScheduleTimer(Duration, Timer),
    DisconnectPeer(PI),
}

/// State of a single topic.
///
/// Membership is a join handshake with a capped neighbor set. Neighbor sets
/// are not guaranteed to be symmetric; broadcasts are accepted from any peer
/// and forwarded to our own neighbors.
///
/// Each broadcast carries a per origin sequence number. Duplicates are
/// suppressed and delivery is buffered per origin, so each origin's messages
/// reach the application in send order. The first message seen from an
/// origin defines the starting point; anything the origin broadcast before
/// we joined is not delivered.
#[derive(Debug)]
pub(crate) struct TopicState<PI> {
    me: PI,
    config: Config,
    neighbors: HashSet<PI>,
    bootstrap: HashSet<PI>,
    next_seq: u64,
    deliver_next: HashMap<PI, u64>,
    buffered: HashMap<PI, BTreeMap<u64, (PI, Bytes)>>,
    joined_emitted: bool,
}

impl<PI: PeerIdentity> TopicState<PI> {
    pub fn new(me: PI, config: Config) -> Self {
        Self {
            me,
            config,
            neighbors: Default::default(),
            bootstrap: Default::default(),
            next_seq: 0,
            deliver_next: Default::default(),
            buffered: Default::default(),
            joined_emitted: false,
        }
    }

    pub fn handle(&mut self, event: InEvent<PI>, out: &mut Vec<OutEvent<PI>>) {
        match event {
            InEvent::Command(Command::Join(peers)) => self.join(peers, out),
            InEvent::Command(Command::Broadcast(content)) => self.broadcast(content, out),
            InEvent::Command(Command::Quit) => self.quit(out),
            InEvent::RecvMessage(from, Message::Join) => self.on_join(from, out),
            InEvent::RecvMessage(from, Message::JoinAck { peers }) => {
                self.on_join_ack(from, peers, out)
            }
            InEvent::RecvMessage(from, Message::Broadcast { origin, seq, content }) => {
                self.on_broadcast(from, origin, seq, content, out)
            }
            InEvent::TimerExpired(Timer::RetryJoin) => self.retry_join(out),
            InEvent::PeerDisconnected(peer) => self.on_disconnect(peer, out),
        }
    }

    pub fn neighbors(&self) -> impl Iterator<Item = &PI> {
        self.neighbors.iter()
    }

    fn join(&mut self, peers: Vec<PI>, out: &mut Vec<OutEvent<PI>>) {
        for peer in peers {
            if peer != self.me && !self.neighbors.contains(&peer) {
                self.bootstrap.insert(peer);
                out.push(OutEvent::SendMessage(peer, Message::Join));
            }
        }
        if !self.joined_emitted {
            self.joined_emitted = true;
            out.push(OutEvent::EmitEvent(Event::Joined));
        }
        if !self.bootstrap.is_empty() {
            out.push(OutEvent::ScheduleTimer(
                self.config.join_retry,
                Timer::RetryJoin,
            ));
        }
    }

    fn broadcast(&mut self, content: Bytes, out: &mut Vec<OutEvent<PI>>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        for neighbor in self.neighbors.iter() {
            out.push(OutEvent::SendMessage(
                *neighbor,
                Message::Broadcast {
                    origin: self.me,
                    seq,
                    content: content.clone(),
                },
            ));
        }
    }

    fn quit(&mut self, out: &mut Vec<OutEvent<PI>>) {
        for neighbor in self.neighbors.drain() {
            out.push(OutEvent::DisconnectPeer(neighbor));
        }
        self.bootstrap.clear();
    }

    fn on_join(&mut self, from: PI, out: &mut Vec<OutEvent<PI>>) {
        self.bootstrap.remove(&from);
        let peers = self
            .neighbors
            .iter()
            .filter(|peer| **peer != from)
            .copied()
            .collect();
        out.push(OutEvent::SendMessage(from, Message::JoinAck { peers }));
        self.add_neighbor(from, out);
    }

    fn on_join_ack(&mut self, from: PI, peers: Vec<PI>, out: &mut Vec<OutEvent<PI>>) {
        self.bootstrap.remove(&from);
        self.add_neighbor(from, out);
        for peer in peers {
            if peer != self.me
                && !self.neighbors.contains(&peer)
                && !self.bootstrap.contains(&peer)
                && self.neighbors.len() + self.bootstrap.len() < self.config.max_neighbors
            {
                self.bootstrap.insert(peer);
                out.push(OutEvent::SendMessage(peer, Message::Join));
            }
        }
    }

    fn on_broadcast(
        &mut self,
        from: PI,
        origin: PI,
        seq: u64,
        content: Bytes,
        out: &mut Vec<OutEvent<PI>>,
    ) {
        if origin == self.me {
            return;
        }
        let next = match self.deliver_next.get(&origin) {
            Some(next) => *next,
            None => {
                // first contact with this origin, start at whatever arrives
                self.deliver_next.insert(origin, seq);
                seq
            }
        };
        if seq < next {
            return;
        }
        let buffer = self.buffered.entry(origin).or_default();
        if buffer.contains_key(&seq) {
            return;
        }
        // forward on first receipt, even if delivery has to wait for a gap
        for neighbor in self.neighbors.iter() {
            if *neighbor != from && *neighbor != origin {
                out.push(OutEvent::SendMessage(
                    *neighbor,
                    Message::Broadcast {
                        origin,
                        seq,
                        content: content.clone(),
                    },
                ));
            }
        }
        buffer.insert(seq, (from, content));
        let mut next = next;
        while let Some((from, content)) = buffer.remove(&next) {
            next += 1;
            out.push(OutEvent::EmitEvent(Event::Received(ReceivedMessage {
                content,
                delivered_from: from,
            })));
        }
        self.deliver_next.insert(origin, next);
    }

    fn retry_join(&mut self, out: &mut Vec<OutEvent<PI>>) {
        if self.neighbors.is_empty() && !self.bootstrap.is_empty() {
            for peer in self.bootstrap.iter() {
                out.push(OutEvent::SendMessage(*peer, Message::Join));
            }
            out.push(OutEvent::ScheduleTimer(
                self.config.join_retry,
                Timer::RetryJoin,
            ));
        }
    }

    fn on_disconnect(&mut self, peer: PI, out: &mut Vec<OutEvent<PI>>) {
        self.bootstrap.remove(&peer);
        if self.neighbors.remove(&peer) {
            out.push(OutEvent::EmitEvent(Event::NeighborDown(peer)));
        }
    }

    fn add_neighbor(&mut self, peer: PI, out: &mut Vec<OutEvent<PI>>) {
        if peer != self.me
            && !self.neighbors.contains(&peer)
            && self.neighbors.len() < self.config.max_neighbors
        {
            self.neighbors.insert(peer);
            out.push(OutEvent::EmitEvent(Event::NeighborUp(peer)));
        }
    }
}
