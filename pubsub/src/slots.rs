//! Connection-slot bookkeeping. Every peer occupies at most one of three slots:
//!
//! * *solicited* - peers this node subscribed to; capped at `max_solicited`
//! * *standby* - solicited candidates displaced because the cap was reached; unbounded and
//!   eligible for promotion when a solicited slot frees up
//! * *unsolicited* - peers that subscribed to this node; capped at `max_unsolicited`

use std::net::SocketAddr;

use rustc_hash::FxHashSet;

use crate::peer::TransportId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotKind {
    Solicited,
    Standby,
    Unsolicited,
}

/// outcome of trying to admit a peer into a solicited slot
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdmitOutcome {
    Solicited,
    /// the solicited set was full, the peer was parked in standby
    Standby,
    /// the peer already held a solicited or standby slot
    AlreadyPresent,
}

/// outcome of an incoming subscribe
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnsolicitedOutcome {
    Admitted,
    /// the peer already holds a slot of some kind; one peer never occupies two
    AlreadyPresent,
    /// the unsolicited cap is reached and the peer holds no other slot
    Full,
}

pub struct PeerSlots {
    max_solicited: usize,
    max_unsolicited: usize,
    solicited: FxHashSet<TransportId>,
    standby: FxHashSet<TransportId>,
    unsolicited: FxHashSet<TransportId>,
}

impl PeerSlots {
    pub fn new(max_solicited: usize, max_unsolicited: usize) -> PeerSlots {
        PeerSlots {
            max_solicited,
            max_unsolicited,
            solicited: FxHashSet::default(),
            standby: FxHashSet::default(),
            unsolicited: FxHashSet::default(),
        }
    }

    pub fn kind_of(&self, id: TransportId) -> Option<SlotKind> {
        if self.solicited.contains(&id) {
            Some(SlotKind::Solicited)
        }
        else if self.standby.contains(&id) {
            Some(SlotKind::Standby)
        }
        else if self.unsolicited.contains(&id) {
            Some(SlotKind::Unsolicited)
        }
        else {
            None
        }
    }

    /// Admit a peer as solicited, displacing it from any other slot it held. A full solicited
    ///  set silently demotes the peer to standby.
    pub fn admit_solicited(&mut self, id: TransportId) -> AdmitOutcome {
        if self.solicited.contains(&id) {
            return AdmitOutcome::AlreadyPresent;
        }

        if self.solicited.len() >= self.max_solicited {
            if self.standby.insert(id) {
                AdmitOutcome::Standby
            }
            else {
                AdmitOutcome::AlreadyPresent
            }
        }
        else {
            self.standby.remove(&id);
            self.unsolicited.remove(&id);
            self.solicited.insert(id);
            AdmitOutcome::Solicited
        }
    }

    /// admit a peer that subscribed to us
    pub fn admit_unsolicited(&mut self, id: TransportId) -> UnsolicitedOutcome {
        if self.kind_of(id).is_some() {
            return UnsolicitedOutcome::AlreadyPresent;
        }
        if self.unsolicited.len() >= self.max_unsolicited {
            return UnsolicitedOutcome::Full;
        }
        self.unsolicited.insert(id);
        UnsolicitedOutcome::Admitted
    }

    pub fn remove(&mut self, id: TransportId) -> Option<SlotKind> {
        let kind = self.kind_of(id)?;
        match kind {
            SlotKind::Solicited => self.solicited.remove(&id),
            SlotKind::Standby => self.standby.remove(&id),
            SlotKind::Unsolicited => self.unsolicited.remove(&id),
        };
        Some(kind)
    }

    pub fn remove_unsolicited(&mut self, id: TransportId) -> bool {
        self.unsolicited.remove(&id)
    }

    /// promote a standby peer into a freed-up solicited slot
    pub fn promote(&mut self, id: TransportId) -> bool {
        if !self.standby.contains(&id) || self.solicited.len() >= self.max_solicited {
            return false;
        }
        self.standby.remove(&id);
        self.solicited.insert(id);
        true
    }

    pub fn max_solicited(&self) -> usize {
        self.max_solicited
    }

    pub fn num_solicited(&self) -> usize {
        self.solicited.len()
    }

    /// the peers a publish fans out to: solicited plus unsolicited
    pub fn fanout(&self) -> impl Iterator<Item = TransportId> + '_ {
        self.solicited.iter().chain(self.unsolicited.iter()).copied()
    }

    /// the peers that receive heartbeats: solicited plus standby (unsolicited peers heartbeat
    ///  us, not the other way around)
    pub fn heartbeat_targets(&self) -> impl Iterator<Item = TransportId> + '_ {
        self.solicited.iter().chain(self.standby.iter()).copied()
    }

    pub fn solicited_ids(&self) -> Vec<TransportId> {
        self.solicited.iter().copied().collect()
    }

    pub fn standby_ids(&self) -> Vec<TransportId> {
        self.standby.iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.solicited.is_empty() && self.standby.is_empty()
    }
}


/// Addresses that recently cost us a solicited or standby peer. Subscribing to them is
///  suppressed until the periodic blacklist tick wipes the set; an incoming subscribe from a
///  blacklisted address is treated as a full promotion instead.
#[derive(Default)]
pub struct Blacklist {
    addrs: FxHashSet<SocketAddr>,
}

impl Blacklist {
    pub fn insert(&mut self, addr: SocketAddr) {
        self.addrs.insert(addr);
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.addrs.contains(&addr)
    }

    pub fn remove(&mut self, addr: SocketAddr) -> bool {
        self.addrs.remove(&addr)
    }

    pub fn clear(&mut self) {
        self.addrs.clear();
    }
}
