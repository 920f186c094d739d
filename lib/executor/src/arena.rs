use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use bumpalo::Bump;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct ArenaPoolConfig {
    /// Pooled arenas unused for longer than this are dropped on the next acquire or release.
    pub idle_timeout: Duration,
    /// Number of releases after which the peak average is folded down.
    pub peak_window: usize,
    /// Capacity of arenas created for a usage id without history.
    pub min_capacity: usize,
}

impl Default for ArenaPoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            peak_window: 50,
            min_capacity: 1024,
        }
    }
}

/// Arena checked out of an [`ArenaPool`]. Hand it back with [`ArenaPool::release`].
#[derive(Debug)]
pub struct ArenaPoolItem {
    pub arena: Bump,
}

#[derive(Debug)]
struct PooledArena {
    arena: Bump,
    released_at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct PeakSize {
    count: usize,
    total_bytes: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<PooledArena>,
    sizes: HashMap<u64, PeakSize>,
}

/// Pool of bump arenas shared by concurrent executions.
///
/// New arenas are sized from a moving average of the peaks seen for the same usage id,
/// so repeated work of the same kind gets right-sized buffers.
#[derive(Debug, Default)]
pub struct ArenaPool {
    config: ArenaPoolConfig,
    state: Mutex<PoolState>,
}

impl ArenaPool {
    pub fn new(config: ArenaPoolConfig) -> Self {
        Self {
            config,
            state: Mutex::default(),
        }
    }

    pub fn acquire(&self, usage_id: u64) -> ArenaPoolItem {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.drop_stale(&mut state, Instant::now());
        if let Some(pooled) = state.idle.pop() {
            return ArenaPoolItem {
                arena: pooled.arena,
            };
        }
        let capacity = Self::arena_size(&state, usage_id, self.config.min_capacity);
        drop(state);
        trace!(usage_id, capacity, "creating arena");
        ArenaPoolItem {
            arena: Bump::with_capacity(capacity),
        }
    }

    /// Resets the arena and returns it to the pool, recording its peak for `usage_id`.
    pub fn release(&self, usage_id: u64, item: ArenaPoolItem) {
        let mut arena = item.arena;
        let peak = arena.allocated_bytes();
        arena.reset();

        let window = self.config.peak_window.max(1);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let size = state.sizes.entry(usage_id).or_default();
        if size.count >= window {
            size.total_bytes /= window;
            size.count = 1;
        }
        size.count += 1;
        size.total_bytes += peak;
        let now = Instant::now();
        self.drop_stale(&mut state, now);
        state.idle.push(PooledArena {
            arena,
            released_at: now,
        });
    }

    /// Drops pooled arenas idle for longer than the configured timeout as of `now`.
    /// Returns how many were dropped. Acquire and release sweep on their own.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.drop_stale(&mut state, now)
    }

    pub fn idle_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .idle
            .len()
    }

    /// Capacity a new arena for `usage_id` would start with.
    pub fn size_hint(&self, usage_id: u64) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Self::arena_size(&state, usage_id, self.config.min_capacity)
    }

    fn drop_stale(&self, state: &mut PoolState, now: Instant) -> usize {
        let before = state.idle.len();
        let timeout = self.config.idle_timeout;
        state
            .idle
            .retain(|pooled| now.saturating_duration_since(pooled.released_at) < timeout);
        let dropped = before - state.idle.len();
        if dropped > 0 {
            trace!(dropped, "dropped idle arenas");
        }
        dropped
    }

    fn arena_size(state: &PoolState, usage_id: u64, min_capacity: usize) -> usize {
        match state.sizes.get(&usage_id) {
            Some(size) if size.count > 0 => (size.total_bytes / size.count).max(min_capacity),
            _ => min_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_arenas() {
        let pool = ArenaPool::default();
        let item = pool.acquire(42);
        item.arena.alloc_str("test data");
        pool.release(42, item);
        assert_eq!(pool.idle_len(), 1);

        let item = pool.acquire(42);
        assert_eq!(pool.idle_len(), 0);
        assert_eq!(item.arena.alloc_str("new data"), "new data");
    }

    #[test]
    fn sizes_new_arenas_from_released_peaks() {
        let pool = ArenaPool::new(ArenaPoolConfig {
            min_capacity: 16,
            ..Default::default()
        });
        assert_eq!(pool.size_hint(7), 16);

        let item = pool.acquire(7);
        item.arena.alloc_slice_fill_copy(4096, 0u8);
        pool.release(7, item);
        assert!(pool.size_hint(7) >= 4096);
        assert_eq!(pool.size_hint(8), 16);
    }

    #[test]
    fn folds_the_average_every_window() {
        let pool = ArenaPool::new(ArenaPoolConfig {
            peak_window: 2,
            min_capacity: 1,
            ..Default::default()
        });
        for _ in 0..5 {
            let item = pool.acquire(1);
            item.arena.alloc_slice_fill_copy(100, 0u8);
            pool.release(1, item);
        }
        let state = pool.state.lock().unwrap();
        assert!(state.sizes[&1].count <= 2);
    }

    #[test]
    fn sweeps_idle_arenas() {
        let pool = ArenaPool::new(ArenaPoolConfig {
            idle_timeout: Duration::from_secs(10),
            ..Default::default()
        });
        let first = pool.acquire(1);
        let second = pool.acquire(1);
        pool.release(1, first);
        pool.release(1, second);

        assert_eq!(pool.sweep_idle(Instant::now()), 0);
        assert_eq!(pool.sweep_idle(Instant::now() + Duration::from_secs(11)), 2);
        assert_eq!(pool.idle_len(), 0);
    }

    #[test]
    fn acquire_drops_arenas_idle_past_the_timeout() {
        let pool = ArenaPool::new(ArenaPoolConfig {
            idle_timeout: Duration::from_millis(20),
            ..Default::default()
        });
        let first = pool.acquire(1);
        let second = pool.acquire(1);
        pool.release(1, first);
        pool.release(1, second);
        assert_eq!(pool.idle_len(), 2);

        std::thread::sleep(Duration::from_millis(50));
        let item = pool.acquire(1);
        assert_eq!(pool.idle_len(), 0);

        pool.release(1, item);
        assert_eq!(pool.idle_len(), 1);
    }
}
