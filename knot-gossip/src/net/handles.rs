//! Subscriber handles to gossip topics.

use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::Stream;
use knot_net::PeerId;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::ToActor;
use crate::proto::{self, TopicId};

/// An event on a subscribed topic.
///
/// Consumers should match on the variants they know and ignore the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A gossip protocol event.
    Gossip(GossipEvent),
    /// The subscriber fell behind and the oldest pending events were
    /// dropped.
    Lagged,
}

/// A protocol event on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipEvent {
    /// The topic was joined locally.
    Joined,
    /// A peer became a neighbor on this topic.
    NeighborUp(PeerId),
    /// A neighbor went away.
    NeighborDown(PeerId),
    /// A broadcast message was received.
    Received(Message),
}

impl GossipEvent {
    pub(super) fn from_proto(event: proto::Event<PeerId>) -> Self {
        match event {
            proto::Event::Joined => Self::Joined,
            proto::Event::NeighborUp(peer) => Self::NeighborUp(peer),
            proto::Event::NeighborDown(peer) => Self::NeighborDown(peer),
            proto::Event::Received(message) => Self::Received(Message {
                content: message.content,
                delivered_from: message.delivered_from,
            }),
        }
    }
}

/// A message received on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The message payload.
    pub content: Bytes,
    /// The neighbor that delivered the message. Not necessarily its origin.
    pub delivered_from: PeerId,
}

/// A subscribed topic, both halves in one place.
///
/// Splits into a [`GossipSender`] and a [`GossipReceiver`] so sending and
/// receiving can move to different tasks.
pub struct GossipTopic {
    sender: GossipSender,
    receiver: GossipReceiver,
}

impl GossipTopic {
    pub(super) fn new(
        topic: TopicId,
        to_actor: mpsc::Sender<ToActor>,
        events: broadcast::Receiver<GossipEvent>,
    ) -> Self {
        Self {
            sender: GossipSender { topic, to_actor },
            receiver: GossipReceiver {
                stream: BroadcastStream::new(events),
            },
        }
    }

    /// Split into sender and receiver halves.
    pub fn split(self) -> (GossipSender, GossipReceiver) {
        (self.sender, self.receiver)
    }

    /// Broadcast a message on the topic.
    pub async fn broadcast(&self, content: Bytes) -> Result<()> {
        self.sender.broadcast(content).await
    }
}

impl Stream for GossipTopic {
    type Item = Result<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

/// The sending half of a subscribed topic.
#[derive(Debug, Clone)]
pub struct GossipSender {
    topic: TopicId,
    to_actor: mpsc::Sender<ToActor>,
}

impl GossipSender {
    /// Broadcast a message on the topic.
    pub async fn broadcast(&self, content: Bytes) -> Result<()> {
        self.to_actor
            .send(ToActor::Broadcast {
                topic: self.topic,
                content,
            })
            .await
            .map_err(|_| anyhow!("gossip actor dropped"))
    }
}

/// The receiving half of a subscribed topic.
///
/// A stream of [`Event`]s. The underlying channel is bounded; if the
/// consumer falls behind, the oldest events are dropped and an
/// [`Event::Lagged`] marker takes their place.
pub struct GossipReceiver {
    stream: BroadcastStream<GossipEvent>,
}

impl Stream for GossipReceiver {
    type Item = Result<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.stream).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(Ok(Event::Gossip(event)))),
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => {
                Poll::Ready(Some(Ok(Event::Lagged)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
