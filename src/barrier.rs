use std::sync::atomic::{AtomicUsize, Ordering};

/// Count-down rendezvous for the per-iteration boundary.
///
/// Every worker calls [`ping`](Barrier::ping) after draining its partition;
/// the call that completes the count observes `true` and takes over the
/// reduction step. The counter re-arms before `true` is returned, so one
/// instance serves every iteration of a run. No blocking is involved:
/// workers have already finished their rows when they ping.
pub struct Barrier {
    arrived: AtomicUsize,
    parties: usize,
}

impl Barrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "barrier needs at least one party");
        Barrier {
            arrived: AtomicUsize::new(0),
            parties,
        }
    }

    /// Returns `true` iff this call was the last to arrive in the current
    /// round.
    pub fn ping(&self) -> bool {
        let arrived = self.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived == self.parties {
            self.arrived.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_party_always_crosses() {
        let b = Barrier::new(1);
        assert!(b.ping());
        assert!(b.ping());
    }

    #[test]
    fn exactly_one_caller_crosses_per_round() {
        let b = Barrier::new(4);
        for _round in 0..3 {
            let crossings: usize = (0..4).map(|_| usize::from(b.ping())).sum();
            assert_eq!(crossings, 1);
        }
    }

    #[test]
    fn last_caller_is_the_one_that_crosses() {
        let b = Barrier::new(3);
        assert!(!b.ping());
        assert!(!b.ping());
        assert!(b.ping());
    }
}
