//! Invariant and ordering checks over lobby state and deliveries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use kaos_social::{EntityId, LobbyState};
use parking_lot::Mutex;

/// A broken lobby invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    OwnerNotMember { lobby: EntityId, owner: EntityId },
    OwnerMissing { lobby: EntityId },
    DuplicateMember { lobby: EntityId, member: EntityId },
    OverCapacity { lobby: EntityId, members: usize, max: u32 },
    StrayMemberData { lobby: EntityId, member: EntityId },
}

/// Checks cached lobby records against the lobby invariants and collects
/// every violation seen.
#[derive(Default)]
pub struct LobbyVerifier {
    violations: Mutex<Vec<Violation>>,
    checked: AtomicU64,
}

impl LobbyVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check one record. Returns the violations it has.
    pub fn check(&self, lobby: &LobbyState) -> Vec<Violation> {
        self.checked.fetch_add(1, Ordering::Relaxed);
        let id = lobby.id;
        let mut found = Vec::new();

        let mut seen = HashSet::new();
        for member in &lobby.members {
            if !seen.insert(*member) {
                found.push(Violation::DuplicateMember {
                    lobby: id,
                    member: *member,
                });
            }
        }

        if !lobby.members.is_empty() {
            match lobby.owner {
                Some(owner) if !seen.contains(&owner) => {
                    found.push(Violation::OwnerNotMember { lobby: id, owner })
                }
                Some(_) => {}
                None => found.push(Violation::OwnerMissing { lobby: id }),
            }
        }

        if lobby.max_members > 0 && lobby.members.len() > lobby.max_members as usize {
            found.push(Violation::OverCapacity {
                lobby: id,
                members: lobby.members.len(),
                max: lobby.max_members,
            });
        }

        for member in lobby.member_metadata.keys() {
            if !seen.contains(member) {
                found.push(Violation::StrayMemberData {
                    lobby: id,
                    member: *member,
                });
            }
        }

        self.violations.lock().extend(found.iter().cloned());
        found
    }

    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.violations.lock().is_empty()
    }

    pub fn checked(&self) -> u64 {
        self.checked.load(Ordering::Relaxed)
    }
}

/// Whether two views of the same lobby agree on membership, ownership and
/// lobby-level data. Local-only fields (membership, watermark) are ignored.
pub fn converged(a: &LobbyState, b: &LobbyState) -> bool {
    let members = |l: &LobbyState| l.members.iter().copied().collect::<HashSet<_>>();
    a.id == b.id
        && members(a) == members(b)
        && a.owner == b.owner
        && a.metadata == b.metadata
        && a.member_metadata == b.member_metadata
        && a.game_server == b.game_server
}

/// Checks that ticks delivered for each (receiver, entity) stream never go
/// backwards.
#[derive(Default)]
pub struct OrderChecker {
    last: Mutex<HashMap<(EntityId, EntityId), u64>>,
    total_seen: AtomicU64,
    out_of_order: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    InOrder,
    /// Same tick as the previous delivery on this stream.
    Repeated,
    OutOfOrder { last: u64 },
}

impl OrderChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, receiver: EntityId, entity: EntityId, tick: u64) -> OrderStatus {
        self.total_seen.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last.lock();
        match last.insert((receiver, entity), tick) {
            None => OrderStatus::InOrder,
            Some(prev) if tick > prev => OrderStatus::InOrder,
            Some(prev) if tick == prev => OrderStatus::Repeated,
            Some(prev) => {
                last.insert((receiver, entity), prev);
                self.out_of_order.fetch_add(1, Ordering::Relaxed);
                OrderStatus::OutOfOrder { last: prev }
            }
        }
    }

    pub fn stats(&self) -> OrderStats {
        OrderStats {
            total_seen: self.total_seen.load(Ordering::Relaxed),
            streams: self.last.lock().len() as u64,
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderStats {
    pub total_seen: u64,
    pub streams: u64,
    pub out_of_order: u64,
}

impl OrderStats {
    pub fn is_perfect(&self) -> bool {
        self.out_of_order == 0
    }
}
