//! Networking for gossip: connects the protocol state machine to peers.
//!
//! A single actor owns the [`proto::State`] and all connections. Commands
//! and connection events arrive over an mpsc inbox; protocol output events
//! are turned into frames on per-peer send queues, scheduled timers and
//! events on per-topic subscriber channels.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use knot_net::{Connection, Endpoint, PeerAddr, PeerId, RecvStream, SendStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::proto::{self, Command, Config, InEvent, OutEvent, TopicId};

pub mod handles;

pub use handles::{Event, GossipEvent, GossipReceiver, GossipSender, GossipTopic, Message};

/// The protocol identifier for gossip connections.
pub const GOSSIP_ALPN: &[u8] = b"/knot/gossip/1";

/// Capacity of the per-topic subscriber channels. Subscribers that fall
/// further behind lose the oldest events and see [`Event::Lagged`].
const SUBSCRIBER_CAP: usize = 256;
/// Capacity of the actor inbox.
const TO_ACTOR_CAP: usize = 64;
/// Capacity of the per-peer send queues.
const SEND_QUEUE_CAP: usize = 64;
/// Maximum size of a gossip frame on the wire.
const MAX_FRAME_SIZE: u32 = 1024 * 1024;

type ProtoMessage = proto::Message<PeerId>;

/// A handle to the gossip actor.
///
/// Cheap to clone. The actor runs until all handles are dropped.
#[derive(Debug, Clone)]
pub struct Gossip {
    to_actor: mpsc::Sender<ToActor>,
}

impl Gossip {
    /// Spawn the gossip actor on the given endpoint.
    pub fn spawn(endpoint: Endpoint, config: Config) -> Self {
        let (to_actor, inbox) = mpsc::channel(TO_ACTOR_CAP);
        let actor = Actor {
            state: proto::State::new(endpoint.peer_id(), config),
            endpoint,
            to_actor: to_actor.clone(),
            inbox,
            conns: Default::default(),
            dialing: Default::default(),
            pending_sends: Default::default(),
            subscribers: Default::default(),
        };
        tokio::task::spawn(actor.run());
        Self { to_actor }
    }

    /// Subscribe to a topic, joining via the given bootstrap peers.
    ///
    /// An [`Event::Gossip`] with [`GossipEvent::Joined`] is delivered right
    /// away; unreachable bootstrap peers are retried in the background.
    pub async fn subscribe(&self, topic: TopicId, bootstrap: Vec<PeerAddr>) -> Result<GossipTopic> {
        let (reply, reply_rx) = oneshot::channel();
        self.to_actor
            .send(ToActor::Subscribe {
                topic,
                bootstrap,
                reply,
            })
            .await
            .map_err(|_| anyhow!("gossip actor dropped"))?;
        reply_rx.await.context("gossip actor dropped")
    }

    /// Broadcast a message on a topic.
    pub async fn broadcast(&self, topic: TopicId, content: Bytes) -> Result<()> {
        self.to_actor
            .send(ToActor::Broadcast { topic, content })
            .await
            .map_err(|_| anyhow!("gossip actor dropped"))
    }

    /// Leave a topic.
    pub async fn quit(&self, topic: TopicId) -> Result<()> {
        self.to_actor
            .send(ToActor::Quit(topic))
            .await
            .map_err(|_| anyhow!("gossip actor dropped"))
    }

    /// Hand an accepted gossip connection to the actor.
    pub async fn handle_connection(&self, conn: Connection) -> Result<()> {
        self.to_actor
            .send(ToActor::IncomingConn(conn))
            .await
            .map_err(|_| anyhow!("gossip actor dropped"))
    }
}

enum ToActor {
    Subscribe {
        topic: TopicId,
        bootstrap: Vec<PeerAddr>,
        reply: oneshot::Sender<GossipTopic>,
    },
    Broadcast {
        topic: TopicId,
        content: Bytes,
    },
    Quit(TopicId),
    IncomingConn(Connection),
    DialDone(PeerId, Result<Connection>),
    RecvMessage(PeerId, ProtoMessage),
    ConnClosed(PeerId),
    Timer(proto::Timer),
}

struct Actor {
    state: proto::State<PeerId>,
    endpoint: Endpoint,
    to_actor: mpsc::Sender<ToActor>,
    inbox: mpsc::Receiver<ToActor>,
    conns: HashMap<PeerId, mpsc::Sender<ProtoMessage>>,
    dialing: HashSet<PeerId>,
    pending_sends: HashMap<PeerId, Vec<ProtoMessage>>,
    subscribers: HashMap<TopicId, broadcast::Sender<GossipEvent>>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(msg) = self.inbox.recv().await {
            self.handle_msg(msg).await;
        }
        debug!("gossip actor stopped");
    }

    async fn handle_msg(&mut self, msg: ToActor) {
        match msg {
            ToActor::Subscribe {
                topic,
                bootstrap,
                reply,
            } => {
                let events = self
                    .subscribers
                    .entry(topic)
                    .or_insert_with(|| broadcast::channel(SUBSCRIBER_CAP).0)
                    .subscribe();
                let handle = GossipTopic::new(topic, self.to_actor.clone(), events);
                let rejoined = self.state.has_topic(&topic);
                let peers = bootstrap.into_iter().map(|addr| addr.peer_id).collect();
                let out = self.state.handle(InEvent::Command(topic, Command::Join(peers)));
                self.handle_out(out).await;
                if rejoined {
                    // the topic already existed, so the state machine stays
                    // quiet; tell the new subscriber it is on the topic
                    if let Some(subscribers) = self.subscribers.get(&topic) {
                        subscribers.send(GossipEvent::Joined).ok();
                    }
                }
                reply.send(handle).ok();
            }
            ToActor::Broadcast { topic, content } => {
                let out = self
                    .state
                    .handle(InEvent::Command(topic, Command::Broadcast(content)));
                self.handle_out(out).await;
            }
            ToActor::Quit(topic) => {
                let out = self.state.handle(InEvent::Command(topic, Command::Quit));
                self.subscribers.remove(&topic);
                self.handle_out(out).await;
            }
            ToActor::IncomingConn(conn) => {
                let peer = conn.remote_peer_id();
                self.setup_conn(peer, conn, false);
            }
            ToActor::DialDone(peer, result) => {
                self.dialing.remove(&peer);
                match result {
                    Ok(conn) => self.setup_conn(peer, conn, true),
                    Err(err) => {
                        debug!(peer = %peer.fmt_short(), %err, "dial failed");
                        self.pending_sends.remove(&peer);
                        let out = self.state.handle(InEvent::PeerDisconnected(peer));
                        self.handle_out(out).await;
                    }
                }
            }
            ToActor::RecvMessage(peer, message) => {
                let out = self.state.handle(InEvent::RecvMessage(peer, message));
                self.handle_out(out).await;
            }
            ToActor::ConnClosed(peer) => {
                if self.conns.remove(&peer).is_some() {
                    let out = self.state.handle(InEvent::PeerDisconnected(peer));
                    self.handle_out(out).await;
                }
            }
            ToActor::Timer(timer) => {
                let out = self.state.handle(InEvent::TimerExpired(timer));
                self.handle_out(out).await;
            }
        }
    }

    async fn handle_out(&mut self, events: Vec<OutEvent<PeerId>>) {
        for event in events {
            match event {
                OutEvent::SendMessage(peer, message) => self.send_message(peer, message),
                OutEvent::EmitEvent(topic, event) => {
                    if let Some(subscribers) = self.subscribers.get(&topic) {
                        // send only fails if no subscriber is left
                        subscribers.send(GossipEvent::from_proto(event)).ok();
                    }
                }
                OutEvent::ScheduleTimer(delay, timer) => self.schedule_timer(delay, timer),
                OutEvent::DisconnectPeer(peer) => {
                    // dropping the send queue ends the write loop and with it
                    // the connection
                    self.conns.remove(&peer);
                }
            }
        }
    }

    fn send_message(&mut self, peer: PeerId, message: ProtoMessage) {
        if let Some(queue) = self.conns.get(&peer) {
            // gossip tolerates loss, drop instead of blocking the actor
            if queue.try_send(message).is_err() {
                warn!(peer = %peer.fmt_short(), "send queue full, dropping message");
            }
        } else {
            self.pending_sends.entry(peer).or_default().push(message);
            if self.dialing.insert(peer) {
                let endpoint = self.endpoint.clone();
                let to_actor = self.to_actor.clone();
                tokio::task::spawn(async move {
                    let result = endpoint
                        .connect(peer, GOSSIP_ALPN)
                        .await
                        .map_err(anyhow::Error::from);
                    to_actor.send(ToActor::DialDone(peer, result)).await.ok();
                });
            }
        }
    }

    fn setup_conn(&mut self, peer: PeerId, conn: Connection, dialer: bool) {
        let (queue, queue_rx) = mpsc::channel(SEND_QUEUE_CAP);
        if let Some(pending) = self.pending_sends.remove(&peer) {
            for message in pending {
                queue.try_send(message).ok();
            }
        }
        self.conns.insert(peer, queue);
        let to_actor = self.to_actor.clone();
        tokio::task::spawn(async move {
            if let Err(err) = conn_loop(conn, dialer, queue_rx, &to_actor, peer).await {
                trace!(peer = %peer.fmt_short(), %err, "connection closed");
            }
            to_actor.send(ToActor::ConnClosed(peer)).await.ok();
        });
    }

    fn schedule_timer(&mut self, delay: Duration, timer: proto::Timer) {
        let to_actor = self.to_actor.clone();
        tokio::task::spawn(async move {
            tokio::time::sleep(delay).await;
            to_actor.send(ToActor::Timer(timer)).await.ok();
        });
    }
}

/// Run the read and write loops of one gossip connection.
///
/// The dialer opens the stream, the acceptor accepts it. Returns when either
/// side closes or a frame is malformed.
async fn conn_loop(
    conn: Connection,
    dialer: bool,
    mut queue: mpsc::Receiver<ProtoMessage>,
    to_actor: &mpsc::Sender<ToActor>,
    peer: PeerId,
) -> Result<()> {
    let (send, recv) = if dialer {
        conn.open_bi().await?
    } else {
        conn.accept_bi().await?
    };
    let write = async move {
        let mut send = send;
        while let Some(message) = queue.recv().await {
            write_message(&mut send, &message).await?;
        }
        anyhow::Ok(())
    };
    let read = async move {
        let mut recv = recv;
        loop {
            let message = read_message(&mut recv).await?;
            to_actor.send(ToActor::RecvMessage(peer, message)).await?;
        }
        #[allow(unreachable_code)]
        anyhow::Ok(())
    };
    tokio::select! {
        res = write => res,
        res = read => res,
    }
}

async fn write_message(send: &mut SendStream, message: &ProtoMessage) -> Result<()> {
    let data = postcard::to_stdvec(message)?;
    anyhow::ensure!(data.len() as u32 <= MAX_FRAME_SIZE, "message too large");
    send.write_u32(data.len() as u32).await?;
    send.write_all(&data).await?;
    Ok(())
}

async fn read_message(recv: &mut RecvStream) -> Result<ProtoMessage> {
    let len = recv.read_u32().await?;
    anyhow::ensure!(len <= MAX_FRAME_SIZE, "frame of {len} bytes exceeds limit");
    let mut buf = vec![0u8; len as usize];
    recv.read_exact(&mut buf).await?;
    Ok(postcard::from_bytes(&buf)?)
}
