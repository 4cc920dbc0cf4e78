//! Entity handles that events are addressed to.
//!
//! The 64-bit id space is split in two:
//! - Low 32 bits: identities supplied by the host (zero-extended)
//! - Everything above: handles minted by [`EntityHandle::create`]
//!
//! The two ranges never overlap, so a minted handle can never collide with
//! a handle derived from an external identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{DispatchError, DispatchResult};

/// First id handed out by the minting counter.
const FIRST_MINTED: u64 = u32::MAX as u64 + 1;

/// Sentinel bits for [`EntityHandle::NONE`].
const NONE_BITS: u64 = u64::MAX;

/// Next id to mint. Shared by every dispatcher in the process.
static NEXT_MINTED: AtomicU64 = AtomicU64::new(FIRST_MINTED);

/// Opaque 64-bit address for events and subscriptions.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityHandle(u64);

impl EntityHandle {
    /// The "no entity" sentinel (all bits set).
    pub const NONE: EntityHandle = EntityHandle(NONE_BITS);

    /// Mint a fresh handle above the 32-bit identity range.
    ///
    /// # Panics
    ///
    /// Panics if the minting counter reaches the sentinel value, which
    /// requires minting on the order of 2^64 handles.
    #[must_use]
    pub fn create() -> Self {
        match Self::reserve(1) {
            Ok(reservation) => reservation.first,
            Err(err) => panic!("entity handle space exhausted: {err}"),
        }
    }

    /// Derive a handle from an external 32-bit identity.
    ///
    /// Negative identities are reinterpreted as their unsigned bit pattern,
    /// so the result always lands in the low 32 bits.
    #[must_use]
    pub const fn from_identity(id: i32) -> Self {
        Self(id as u32 as u64)
    }

    /// Derive a handle from an unsigned external identity.
    #[must_use]
    pub const fn from_u32(id: u32) -> Self {
        Self(id as u64)
    }

    /// Reconstruct a handle from its raw bits.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits of this handle.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Whether this is the [`EntityHandle::NONE`] sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == NONE_BITS
    }

    /// Whether this handle was derived from an external identity.
    #[must_use]
    pub const fn is_external(self) -> bool {
        self.0 < FIRST_MINTED
    }

    /// Reserve a contiguous block of `count` minted handles.
    ///
    /// Handles inside the block are never returned by [`EntityHandle::create`]
    /// or by any other reservation.
    pub fn reserve(count: u64) -> DispatchResult<EntityReservation> {
        let start = NEXT_MINTED
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                next.checked_add(count).filter(|end| *end <= NONE_BITS)
            })
            .map_err(|_| DispatchError::CounterOverflow { requested: count })?;

        Ok(EntityReservation {
            first: EntityHandle(start),
            len: count,
        })
    }
}

impl Default for EntityHandle {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "EntityHandle(NONE)")
        } else {
            write!(f, "EntityHandle({:#x})", self.0)
        }
    }
}

impl fmt::Display for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// A block of minted handles reserved for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityReservation {
    first: EntityHandle,
    len: u64,
}

impl EntityReservation {
    /// Get the handle at `index` inside the reservation.
    pub fn get(&self, index: u64) -> DispatchResult<EntityHandle> {
        if index >= self.len {
            return Err(DispatchError::ReservationOutOfRange {
                index,
                len: self.len,
            });
        }
        Ok(EntityHandle(self.first.0 + index))
    }

    /// Number of handles in the reservation.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Whether the reservation holds no handles.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over every handle in the reservation.
    pub fn iter(&self) -> impl Iterator<Item = EntityHandle> + use<> {
        let first = self.first.0;
        (0..self.len).map(move |i| EntityHandle(first + i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_range_stays_in_low_bits() {
        let high_mask = 0xffff_ffff_u64 << 32;

        for id in [i32::MIN, -1, 0, 1, i32::MAX] {
            let handle = EntityHandle::from_identity(id);
            assert_eq!(handle.to_bits() & high_mask, 0, "identity {id} leaked upward");
            assert!(handle.is_external());
        }

        assert_ne!(EntityHandle::create().to_bits() & high_mask, 0);
    }

    #[test]
    fn test_equal_identities_give_equal_handles() {
        assert_eq!(EntityHandle::from_identity(42), EntityHandle::from_identity(42));
        assert_eq!(EntityHandle::from_identity(-1), EntityHandle::from_u32(u32::MAX));
        assert_ne!(EntityHandle::from_identity(1), EntityHandle::from_identity(2));
    }

    #[test]
    fn test_minted_handles_are_unique() {
        let a = EntityHandle::create();
        let b = EntityHandle::create();
        assert_ne!(a, b);
        assert!(!a.is_external());
        assert!(!a.is_none());
    }

    #[test]
    fn test_none_sentinel() {
        assert!(EntityHandle::NONE.is_none());
        assert_eq!(EntityHandle::default(), EntityHandle::NONE);
        assert_eq!(format!("{}", EntityHandle::NONE), "none");
    }

    #[test]
    fn test_reservation() {
        let reservation = EntityHandle::reserve(3).unwrap();
        let t1 = reservation.get(0).unwrap();
        let t2 = reservation.get(1).unwrap();
        let t3 = reservation.get(2).unwrap();

        assert_ne!(t1, t2);
        assert_ne!(t2, t3);
        assert_ne!(t1, t3);
        assert_eq!(reservation.iter().count(), 3);

        assert!(matches!(
            reservation.get(3),
            Err(DispatchError::ReservationOutOfRange { index: 3, len: 3 })
        ));

        let after = EntityHandle::create();
        assert!(reservation.iter().all(|h| h != after));
    }

    #[test]
    fn test_reservation_overflow() {
        assert!(matches!(
            EntityHandle::reserve(u64::MAX),
            Err(DispatchError::CounterOverflow { requested: u64::MAX })
        ));

        // A failed reservation must not consume the counter
        let _ = EntityHandle::create();
    }
}
