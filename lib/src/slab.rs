//! The connection slab of a worker
//!
//! Records live in a [`slab::Slab`]. Each allocation is stamped with a
//! generation, so a [`ClientId`] kept after its record was freed (in a
//! peer link, a deferred action, or an in-flight poll event) no longer
//! resolves, even once the slot has been reused.
//!
//! The mio token of a registration carries the slot, the generation and the
//! [`Side`] of the socket:
//!
//! ```plain
//!  63   62 ........... 33   32 ........... 1    0
//! | 0 | generation (30b) | slot index (32b) | side |
//! ```

use mio::Token;
use ::slab::Slab;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("client tokens need a 64 bit usize");

const SIDE_BITS: u32 = 1;
const INDEX_BITS: u32 = 32;
const GENERATION_BITS: u32 = 30;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SlabError {
    #[error("client slab exhausted, {0} clients are already allocated")]
    Exhausted(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    index: usize,
    generation: u32,
}

/// which socket of a record a registration belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// the socket the record owns for its whole life
    Inbound,
    /// an outbound connection not established yet
    Outbound,
}

impl ClientId {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn token(&self, side: Side) -> Token {
        let side = match side {
            Side::Inbound => 0,
            Side::Outbound => 1,
        };
        Token(
            ((self.generation as usize) << (INDEX_BITS + SIDE_BITS))
                | (self.index << SIDE_BITS)
                | side,
        )
    }

    fn from_token(token: Token) -> (ClientId, Side) {
        let side = if token.0 & 1 == 0 {
            Side::Inbound
        } else {
            Side::Outbound
        };
        let id = ClientId {
            index: (token.0 >> SIDE_BITS) & INDEX_MASK,
            generation: ((token.0 >> (INDEX_BITS + SIDE_BITS)) as u32) & GENERATION_MASK,
        };
        (id, side)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: T,
}

pub struct ClientSlab<T> {
    slots: Slab<Slot<T>>,
    next_generation: u32,
    /// 0 means unbounded
    max: usize,
}

impl<T> ClientSlab<T> {
    /// preallocates `capacity` records, refuses allocations past `max`
    pub fn new(capacity: usize, max: usize) -> Self {
        ClientSlab {
            slots: Slab::with_capacity(capacity),
            next_generation: 0,
            max,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Allocates a record. `build` receives the id the record will have, so
    /// sockets can be registered under their final token before the record
    /// exists; if it fails nothing is allocated.
    pub fn insert_with<E, F>(&mut self, build: F) -> Result<ClientId, E>
    where
        E: From<SlabError>,
        F: FnOnce(ClientId) -> Result<T, E>,
    {
        let index = self.slots.vacant_key();
        if (self.max != 0 && self.slots.len() >= self.max) || index > INDEX_MASK {
            return Err(SlabError::Exhausted(self.slots.len()).into());
        }

        let id = ClientId {
            index,
            generation: self.next_generation,
        };
        let value = build(id)?;

        self.next_generation = (self.next_generation + 1) & GENERATION_MASK;
        let inserted = self.slots.insert(Slot {
            generation: id.generation,
            value,
        });
        debug_assert_eq!(inserted, index);
        Ok(id)
    }

    #[cfg(test)]
    pub fn insert(&mut self, value: T) -> Result<ClientId, SlabError> {
        self.insert_with(|_| Ok(value))
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: ClientId) -> Option<&T> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .map(|slot| &mut slot.value)
    }

    /// both records at once, `None` if either is gone or they are the same
    pub fn get2_mut(&mut self, a: ClientId, b: ClientId) -> Option<(&mut T, &mut T)> {
        if a.index == b.index {
            return None;
        }
        let (slot_a, slot_b) = self.slots.get2_mut(a.index, b.index)?;
        if slot_a.generation != a.generation || slot_b.generation != b.generation {
            return None;
        }
        Some((&mut slot_a.value, &mut slot_b.value))
    }

    pub fn remove(&mut self, id: ClientId) -> Option<T> {
        if !self.contains(id) {
            return None;
        }
        Some(self.slots.remove(id.index).value)
    }

    /// the live record a token designates, stale tokens yield `None`
    pub fn resolve(&self, token: Token) -> Option<(ClientId, Side)> {
        let (id, side) = ClientId::from_token(token);
        self.contains(id).then_some((id, side))
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.slots
            .iter()
            .map(|(index, slot)| ClientId {
                index,
                generation: slot.generation,
            })
            .collect()
    }

    /// frees every record, handing each one to `callback`
    pub fn drain<F: FnMut(ClientId, T)>(&mut self, mut callback: F) {
        for id in self.ids() {
            if let Some(value) = self.remove(id) {
                callback(id, value);
            }
        }
    }
}
