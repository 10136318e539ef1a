use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::config::LoadBalancerKind;
use crate::upstream::Upstream;

// A pluggable selector over the fixed upstream set. pick_upstream never
// returns when the set is non-empty.
pub trait LoadBalancer: Send + Sync {
    fn pick_upstream(&self) -> Arc<Upstream>;
}

pub fn build(kind: LoadBalancerKind, upstreams: Arc<Vec<Arc<Upstream>>>) -> Box<dyn LoadBalancer> {
    assert!(!upstreams.is_empty(), "load balancer needs at least one upstream");
    match kind {
        LoadBalancerKind::RoundRobin => Box::new(RoundRobin::new(upstreams)),
        LoadBalancerKind::UniformRandom => Box::new(UniformRandom::new(upstreams)),
        LoadBalancerKind::LeastUsed => Box::new(LeastUsed::new(upstreams)),
    }
}

// Cursor advances before indexing, so the first pick is index 1, not 0.
pub struct RoundRobin {
    upstreams: Arc<Vec<Arc<Upstream>>>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(upstreams: Arc<Vec<Arc<Upstream>>>) -> Self {
        Self {
            upstreams,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobin {
    fn pick_upstream(&self) -> Arc<Upstream> {
        let n = self.upstreams.len();
        let i = self.cursor.fetch_add(1, Ordering::SeqCst).wrapping_add(1) % n;
        Arc::clone(&self.upstreams[i])
    }
}

// Reseeds from a fresh thread-local RNG on every call instead of holding
// one PRNG for the policy's lifetime, so picks stay independent even if
// callers clone the policy across threads.
pub struct UniformRandom {
    upstreams: Arc<Vec<Arc<Upstream>>>,
}

impl UniformRandom {
    pub fn new(upstreams: Arc<Vec<Arc<Upstream>>>) -> Self {
        Self { upstreams }
    }

    fn pick_from(upstreams: &[Arc<Upstream>]) -> Arc<Upstream> {
        let i = rand::thread_rng().gen_range(0..upstreams.len());
        Arc::clone(&upstreams[i])
    }
}

impl LoadBalancer for UniformRandom {
    fn pick_upstream(&self) -> Arc<Upstream> {
        Self::pick_from(&self.upstreams)
    }
}

// Among upstreams with no failure in the last second, picks the one
// with the lowest recent byte rate. Ties go to the earliest upstream.
// Falls back to uniform-random over the full set if every upstream has
// failed in the last second.
pub struct LeastUsed {
    upstreams: Arc<Vec<Arc<Upstream>>>,
}

impl LeastUsed {
    pub fn new(upstreams: Arc<Vec<Arc<Upstream>>>) -> Self {
        Self { upstreams }
    }
}

impl LoadBalancer for LeastUsed {
    fn pick_upstream(&self) -> Arc<Upstream> {
        let mut best: Option<(usize, u64)> = None;
        for (idx, up) in self.upstreams.iter().enumerate() {
            if up.failed.last_second_count() != 0 {
                continue;
            }
            let rate = up.byte_rate.last_minute_count();
            match best {
                Some((_, best_rate)) if rate >= best_rate => {}
                _ => best = Some((idx, rate)),
            }
        }
        match best {
            Some((idx, _)) => Arc::clone(&self.upstreams[idx]),
            None => UniformRandom::pick_from(&self.upstreams),
        }
    }
}
