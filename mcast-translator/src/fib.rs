use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mcast_config::AddressSpace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Existing(Ipv4Addr),
    Allocated(Ipv4Addr),
    Exhausted,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    group: Ipv4Addr,
    last_seen: Instant,
}

struct FibState {
    space: AddressSpace,
    entries: HashMap<SocketAddrV4, Entry>,
    allocated: HashSet<Ipv4Addr>,
    random_attempts: usize,
    rng: StdRng,
}

/// Forwarding table from unicast clients to their multicast groups, together with the set of
/// groups in use. Both live behind one lock so they can never disagree.
pub struct Fib {
    state: Mutex<FibState>,
}

impl Fib {
    pub fn new(space: AddressSpace, random_attempts: usize) -> Self {
        Self::with_rng(space, random_attempts, StdRng::from_os_rng())
    }

    pub fn with_rng(space: AddressSpace, random_attempts: usize, rng: StdRng) -> Self {
        Fib {
            state: Mutex::new(FibState {
                space,
                entries: HashMap::new(),
                allocated: HashSet::new(),
                random_attempts: random_attempts.max(1),
                rng,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FibState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, client: &SocketAddrV4) -> Option<Ipv4Addr> {
        self.state().entries.get(client).map(|entry| entry.group)
    }

    /// Assigns a free group to `client`, which must not have one yet.
    /// Returns `None` only when every usable address of the space is taken.
    pub fn allocate(&self, client: SocketAddrV4) -> Option<Ipv4Addr> {
        let mut state = self.state();
        assert!(
            !state.entries.contains_key(&client),
            "{client} already has a multicast group"
        );
        state.allocate(client, Instant::now())
    }

    /// Returns the client's group, allocating one if this is the first time it is seen
    pub fn resolve(&self, client: SocketAddrV4, now: Instant) -> Resolution {
        let mut state = self.state();
        if let Some(entry) = state.entries.get_mut(&client) {
            entry.last_seen = now;
            return Resolution::Existing(entry.group);
        }
        match state.allocate(client, now) {
            Some(group) => Resolution::Allocated(group),
            None => Resolution::Exhausted,
        }
    }

    /// Drops every client that has been silent for at least `idle_timeout`, releasing its group
    pub fn evict_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<(SocketAddrV4, Ipv4Addr)> {
        let mut state = self.state();
        let FibState { entries, allocated, .. } = &mut *state;

        let mut evicted = Vec::new();
        entries.retain(|&client, entry| {
            let expired = now.saturating_duration_since(entry.last_seen) >= idle_timeout;
            if expired {
                allocated.remove(&entry.group);
                evicted.push((client, entry.group));
            }
            !expired
        });
        evicted
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn allocated_count(&self) -> usize {
        self.state().allocated.len()
    }
}

impl FibState {
    fn allocate(&mut self, client: SocketAddrV4, now: Instant) -> Option<Ipv4Addr> {
        let index = self.free_index()?;
        let group = self.space.nth(index);

        self.allocated.insert(group);
        self.entries.insert(client, Entry { group, last_seen: now });
        Some(group)
    }

    fn free_index(&mut self) -> Option<u64> {
        let usable = self.space.usable();
        if self.allocated.len() as u64 >= usable {
            return None;
        }

        let high = self.space.size() - 2;
        let mut index = 1;
        for _ in 0..self.random_attempts {
            index = self.rng.random_range(1..=high);
            if !self.allocated.contains(&self.space.nth(index)) {
                return Some(index);
            }
        }

        // There is at least one free address, so probing terminates within one lap
        for _ in 0..usable {
            index = if index >= high { 1 } else { index + 1 };
            if !self.allocated.contains(&self.space.nth(index)) {
                return Some(index);
            }
        }
        None
    }
}
