//! Member-to-member messaging contract and the in-process loopback network.
//!
//! The advisor only needs fire-and-forget broadcast, a directed send for
//! answering newcomers, and membership notifications. [`LoopbackNetwork`]
//! provides all three inside one process: every joined member gets an inbox
//! channel drained by its own delivery thread.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Mutex, RwLock};

use crate::cluster::member::MemberId;
use crate::cluster::message::AdvisorMessage;
use crate::core::errors::{GridError, Result};

/// Inbound side: implemented by the cluster advisor.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: AdvisorMessage);
    fn member_joined(&self, member: &MemberId);
    fn member_departed(&self, member: &MemberId);
}

/// Outbound side, bound to one local member.
pub trait Transport: Send + Sync {
    fn local_member(&self) -> &MemberId;

    /// Deliver to every other member. Attempts all peers; the first
    /// delivery failure is returned after the rest were tried.
    fn broadcast(&self, message: &AdvisorMessage) -> Result<()>;

    fn send_to(&self, member: &MemberId, message: &AdvisorMessage) -> Result<()>;

    /// Start delivering inbound traffic to `handler`.
    fn join(&self, handler: Arc<dyn MessageHandler>) -> Result<()>;

    /// Stop receiving and tell the remaining members this one departed.
    fn leave(&self);

    /// Current membership view, including the local member once joined.
    fn members(&self) -> Vec<MemberId>;
}

enum Delivery {
    Frame(String),
    Joined(MemberId),
    Departed(MemberId),
    Stop,
}

struct Peer {
    inbox: Sender<Delivery>,
    worker: Option<thread::JoinHandle<()>>,
}

/// In-process cluster fabric.
#[derive(Default)]
pub struct LoopbackNetwork {
    peers: RwLock<BTreeMap<MemberId, Peer>>,
    /// Members whose inbound link is cut; sends to them fail.
    partitioned: RwLock<BTreeSet<MemberId>>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Endpoint for `member`. Nothing is delivered until it joins.
    #[must_use]
    pub fn endpoint(self: &Arc<Self>, member: MemberId) -> LoopbackEndpoint {
        LoopbackEndpoint {
            network: Arc::clone(self),
            member,
            joined: Mutex::new(false),
        }
    }

    /// Cut (or restore) delivery to `member`, simulating a network fault.
    pub fn set_partitioned(&self, member: &MemberId, partitioned: bool) {
        let mut cut = self.partitioned.write();
        if partitioned {
            cut.insert(member.clone());
        } else {
            cut.remove(member);
        }
    }

    /// Drop `member` without any goodbye message, as a crash would.
    pub fn crash(&self, member: &MemberId) {
        self.remove(member);
    }

    #[must_use]
    pub fn members(&self) -> Vec<MemberId> {
        self.peers.read().keys().cloned().collect()
    }

    /// Stop every delivery thread and wait for them.
    pub fn shutdown(&self) {
        let peers = std::mem::take(&mut *self.peers.write());
        for (_, mut peer) in peers {
            let _ = peer.inbox.send(Delivery::Stop);
            if let Some(worker) = peer.worker.take() {
                let _ = worker.join();
            }
        }
    }

    fn add(&self, member: &MemberId, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let (tx, rx) = unbounded::<Delivery>();
        let worker = thread::Builder::new()
            .name(format!("gg-deliver-{member}"))
            .spawn(move || delivery_loop(&rx, handler.as_ref()))
            .map_err(|e| GridError::Runtime {
                details: format!("failed to spawn delivery thread: {e}"),
            })?;

        let mut peers = self.peers.write();
        for (existing, peer) in peers.iter() {
            if existing != member {
                let _ = peer.inbox.send(Delivery::Joined(member.clone()));
            }
        }
        if let Some(old) = peers.insert(
            member.clone(),
            Peer {
                inbox: tx,
                worker: Some(worker),
            },
        ) {
            let _ = old.inbox.send(Delivery::Stop);
        }
        Ok(())
    }

    fn remove(&self, member: &MemberId) {
        let mut peers = self.peers.write();
        if let Some(peer) = peers.remove(member) {
            // The worker is not joined here: `leave` may run on its own thread.
            let _ = peer.inbox.send(Delivery::Stop);
        }
        for peer in peers.values() {
            let _ = peer.inbox.send(Delivery::Departed(member.clone()));
        }
    }

    fn deliver(&self, to: &MemberId, frame: String) -> Result<()> {
        if self.partitioned.read().contains(to) {
            return Err(GridError::Propagation {
                member: to.clone(),
                details: "member unreachable".to_string(),
            });
        }
        let peers = self.peers.read();
        let Some(peer) = peers.get(to) else {
            return Err(GridError::Propagation {
                member: to.clone(),
                details: "member is not in the view".to_string(),
            });
        };
        // A closed inbox means the member's delivery thread is gone.
        peer.inbox
            .send(Delivery::Frame(frame))
            .map_err(|_| GridError::ChannelClosed {
                component: "loopback inbox",
            })
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("members", &self.members())
            .finish_non_exhaustive()
    }
}

fn delivery_loop(rx: &Receiver<Delivery>, handler: &dyn MessageHandler) {
    while let Ok(delivery) = rx.recv() {
        match delivery {
            Delivery::Frame(raw) => match AdvisorMessage::decode(&raw) {
                Ok(message) => handler.handle_message(message),
                Err(e) => eprintln!("[GG-TRANSPORT] dropping undecodable frame: {e}"),
            },
            Delivery::Joined(member) => handler.member_joined(&member),
            Delivery::Departed(member) => handler.member_departed(&member),
            Delivery::Stop => break,
        }
    }
}

/// One member's attachment to a [`LoopbackNetwork`].
pub struct LoopbackEndpoint {
    network: Arc<LoopbackNetwork>,
    member: MemberId,
    joined: Mutex<bool>,
}

impl LoopbackEndpoint {
    #[must_use]
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }
}

impl Transport for LoopbackEndpoint {
    fn local_member(&self) -> &MemberId {
        &self.member
    }

    fn broadcast(&self, message: &AdvisorMessage) -> Result<()> {
        let frame = message.encode()?;
        let targets: Vec<MemberId> = self
            .network
            .members()
            .into_iter()
            .filter(|m| *m != self.member)
            .collect();
        let mut first_failure = None;
        for target in targets {
            if let Err(e) = self.network.deliver(&target, frame.clone()) {
                first_failure.get_or_insert(e);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    fn send_to(&self, member: &MemberId, message: &AdvisorMessage) -> Result<()> {
        self.network.deliver(member, message.encode()?)
    }

    fn join(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut joined = self.joined.lock();
        self.network.add(&self.member, handler)?;
        *joined = true;
        Ok(())
    }

    fn leave(&self) {
        let mut joined = self.joined.lock();
        if *joined {
            self.network.remove(&self.member);
            *joined = false;
        }
    }

    fn members(&self) -> Vec<MemberId> {
        self.network.members()
    }
}
