// src/rabbitmq/correlation.rs

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Mutex;

/// Length of generated correlation ids.
pub const CORRELATION_ID_LEN: usize = 32;

/// Opaque token matching a reply to its request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of correlation ids for outgoing requests.
///
/// Ids only need to be unique among in-flight requests. None of the
/// provided generators are unpredictable; supply a CSPRNG-backed
/// implementation if ids must not be guessable.
pub trait CorrelationIdGenerator: Send + Sync {
    fn next_id(&self) -> CorrelationId;
}

fn uppercase_id<R: Rng + ?Sized>(rng: &mut R) -> CorrelationId {
    let id: String = (0..CORRELATION_ID_LEN)
        .map(|_| char::from(rng.random_range(b'A'..=b'Z')))
        .collect();
    CorrelationId(id)
}

/// 32 uppercase ASCII letters from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomCorrelationIds;

impl CorrelationIdGenerator for RandomCorrelationIds {
    fn next_id(&self) -> CorrelationId {
        uppercase_id(&mut rand::rng())
    }
}

/// Same alphabet as [`RandomCorrelationIds`] but reproducible from a seed.
#[derive(Debug)]
pub struct SeededCorrelationIds {
    rng: Mutex<StdRng>,
}

impl SeededCorrelationIds {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl CorrelationIdGenerator for SeededCorrelationIds {
    fn next_id(&self) -> CorrelationId {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        uppercase_id(&mut *rng)
    }
}

impl<G: CorrelationIdGenerator + ?Sized> CorrelationIdGenerator for std::sync::Arc<G> {
    fn next_id(&self) -> CorrelationId {
        (**self).next_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_well_formed(id: &CorrelationId) {
        assert_eq!(id.as_str().len(), CORRELATION_ID_LEN);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_uppercase()));
    }

    #[test]
    fn random_ids_are_32_uppercase_letters() {
        let ids = RandomCorrelationIds;
        for _ in 0..1_000 {
            assert_well_formed(&ids.next_id());
        }
    }

    // 26^32 possible ids: a collision in 10^4 draws is astronomically unlikely,
    // but this is a statistical property of a non-cryptographic RNG, not a guarantee.
    #[test]
    fn random_ids_do_not_collide_in_practice() {
        let ids = RandomCorrelationIds;
        let drawn: HashSet<_> = (0..10_000).map(|_| ids.next_id()).collect();
        assert_eq!(drawn.len(), 10_000);
    }

    #[test]
    fn whole_alphabet_is_reachable() {
        let ids = SeededCorrelationIds::new(7);
        let seen: HashSet<u8> = (0..200)
            .flat_map(|_| ids.next_id().as_str().bytes().collect::<Vec<_>>())
            .collect();

        assert!(seen.contains(&b'A'));
        assert!(seen.contains(&b'Z'));
        assert_eq!(seen.len(), 26);
    }

    #[test]
    fn seeded_ids_are_reproducible() {
        let first = SeededCorrelationIds::new(42);
        let second = SeededCorrelationIds::new(42);

        for _ in 0..10 {
            let id = first.next_id();
            assert_well_formed(&id);
            assert_eq!(id, second.next_id());
        }
    }

    #[test]
    fn display_is_the_raw_id() {
        let id = CorrelationId::from("ABC");
        assert_eq!(id.to_string(), "ABC");
    }
}
