use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use super::models::{ChunkCoord, RoadSegmentPlacement, WorldId};
use super::registry::WorldRegistry;

pub type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GateTimings {
    /// A pending chunk is force-released after this long.
    pub release_timeout: Duration,
    /// A processed entry lingers this long to absorb late registrations.
    pub removal_grace: Duration,
}

impl Default for GateTimings {
    fn default() -> Self {
        Self { release_timeout: Duration::from_secs(30), removal_grace: Duration::from_secs(5) }
    }
}

struct ChunkRoadState {
    processed: bool,
    /// Road tasks still holding the chunk back.
    holders: usize,
    callbacks: Vec<ReleaseCallback>,
    created_at: Instant,
    processed_at: Option<Instant>,
}

impl ChunkRoadState {
    fn pending(now: Instant) -> Self {
        Self { processed: false, holders: 1, callbacks: Vec::new(), created_at: now, processed_at: None }
    }

    fn finish(&mut self, now: Instant) -> Vec<ReleaseCallback> {
        self.processed = true;
        self.holders = 0;
        self.processed_at = Some(now);
        std::mem::take(&mut self.callbacks)
    }
}

#[derive(Default)]
struct WorldChunks {
    chunks: Mutex<HashMap<ChunkCoord, ChunkRoadState>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub timed_out: usize,
    pub removed: usize,
}

/// Holds chunks back from their consumer while road work touching them is in flight.
pub struct ChunkReleaseGate {
    worlds: WorldRegistry<WorldChunks>,
    timings: GateTimings,
}

impl Default for ChunkReleaseGate {
    fn default() -> Self {
        Self::new(GateTimings::default())
    }
}

impl ChunkReleaseGate {
    pub fn new(timings: GateTimings) -> Self {
        Self { worlds: WorldRegistry::new(), timings }
    }

    pub fn mark_pending(&self, world: &WorldId, chunk: ChunkCoord) {
        self.mark_pending_at(world, chunk, Instant::now());
    }

    /// Takes a hold on `chunk`. A chunk that is already pending gains another
    /// holder; a processed one starts over with an empty callback list.
    pub fn mark_pending_at(&self, world: &WorldId, chunk: ChunkCoord, now: Instant) {
        let w = self.worlds.get_or_insert_with(world, WorldChunks::default);
        let mut chunks = w.chunks.lock();
        match chunks.get_mut(&chunk) {
            Some(state) if !state.processed => state.holders += 1,
            _ => {
                chunks.insert(chunk, ChunkRoadState::pending(now));
            }
        }
    }

    /// Runs `cb` now if the chunk has nothing pending, otherwise once it is released.
    pub fn register_release_callback<F>(&self, world: &WorldId, chunk: ChunkCoord, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut cb: Option<ReleaseCallback> = Some(Box::new(cb));
        if let Some(w) = self.worlds.get(world) {
            let mut chunks = w.chunks.lock();
            if let Some(state) = chunks.get_mut(&chunk) {
                if !state.processed {
                    if let Some(cb) = cb.take() { state.callbacks.push(cb); }
                }
            }
        }
        if let Some(cb) = cb {
            run_callbacks(world, chunk, vec![cb]);
        }
    }

    /// One-shot receiver that yields once the chunk is released.
    pub fn release_signal(&self, world: &WorldId, chunk: ChunkCoord) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        self.register_release_callback(world, chunk, move || {
            let _ = tx.send(());
        });
        rx
    }

    pub fn mark_processed(&self, world: &WorldId, chunk: ChunkCoord) -> bool {
        self.mark_processed_at(world, chunk, Instant::now())
    }

    /// Drops one hold on `chunk`. The last hold releases it, running each queued
    /// callback exactly once. Returns false when there was nothing pending
    /// (including a repeat call after release).
    pub fn mark_processed_at(&self, world: &WorldId, chunk: ChunkCoord, now: Instant) -> bool {
        let Some(w) = self.worlds.get(world) else { return false; };
        let callbacks = {
            let mut chunks = w.chunks.lock();
            match chunks.get_mut(&chunk) {
                Some(state) if !state.processed => {
                    state.holders = state.holders.saturating_sub(1);
                    if state.holders > 0 {
                        return true;
                    }
                    state.finish(now)
                }
                _ => return false,
            }
        };
        run_callbacks(world, chunk, callbacks);
        true
    }

    pub fn is_pending(&self, world: &WorldId, chunk: ChunkCoord) -> bool {
        let Some(w) = self.worlds.get(world) else { return false; };
        let pending = w.chunks.lock().get(&chunk).map_or(false, |s| !s.processed);
        pending
    }

    pub fn pending_chunks(&self, world: &WorldId) -> Vec<ChunkCoord> {
        let Some(w) = self.worlds.get(world) else { return Vec::new(); };
        let chunks = w.chunks.lock();
        let mut v: Vec<ChunkCoord> = chunks.iter().filter(|(_, s)| !s.processed).map(|(c, _)| *c).collect();
        v.sort_unstable();
        v
    }

    /// Number of entries still tracked for `world`, processed ones included.
    pub fn tracked(&self, world: &WorldId) -> usize {
        let Some(w) = self.worlds.get(world) else { return 0; };
        let n = w.chunks.lock().len();
        n
    }

    pub fn sweep(&self, world: &WorldId) -> SweepStats {
        self.sweep_at(world, Instant::now())
    }

    /// Force-releases timed-out chunks and drops processed entries past the grace delay.
    pub fn sweep_at(&self, world: &WorldId, now: Instant) -> SweepStats {
        let mut stats = SweepStats::default();
        let Some(w) = self.worlds.get(world) else { return stats; };
        let mut expired: Vec<(ChunkCoord, Vec<ReleaseCallback>)> = Vec::new();
        {
            let mut chunks = w.chunks.lock();
            let timeout = self.timings.release_timeout;
            let grace = self.timings.removal_grace;
            for (coord, state) in chunks.iter_mut() {
                if !state.processed && now.saturating_duration_since(state.created_at) >= timeout {
                    expired.push((*coord, state.finish(now)));
                }
            }
            let before = chunks.len();
            chunks.retain(|_, s| match s.processed_at {
                Some(at) if s.processed => now.saturating_duration_since(at) < grace,
                _ => true,
            });
            stats.removed = before - chunks.len();
        }
        expired.sort_by_key(|(c, _)| *c);
        for (coord, callbacks) in expired {
            log::warn!(
                "[gate] world {} chunk ({},{}) not released within {:?}; forcing release",
                world, coord.x, coord.z, self.timings.release_timeout
            );
            run_callbacks(world, coord, callbacks);
            stats.timed_out += 1;
        }
        stats
    }

    /// Force-processes everything pending for `world` and forgets the world.
    pub fn release_world(&self, world: &WorldId) -> usize {
        let Some(w) = self.worlds.remove(world) else { return 0; };
        let now = Instant::now();
        let mut drained: Vec<(ChunkCoord, Vec<ReleaseCallback>)> = {
            let mut chunks = w.chunks.lock();
            let out = chunks
                .iter_mut()
                .filter(|(_, s)| !s.processed)
                .map(|(c, s)| (*c, s.finish(now)))
                .collect();
            chunks.clear();
            out
        };
        drained.sort_by_key(|(c, _)| *c);
        let n = drained.len();
        for (coord, callbacks) in drained {
            run_callbacks(world, coord, callbacks);
        }
        if n > 0 {
            log::info!("[gate] world {} unloaded; released {} pending chunks", world, n);
        }
        n
    }
}

fn run_callbacks(world: &WorldId, chunk: ChunkCoord, callbacks: Vec<ReleaseCallback>) {
    for cb in callbacks {
        if catch_unwind(AssertUnwindSafe(cb)).is_err() {
            log::error!("[gate] release callback for world {} chunk ({},{}) panicked", world, chunk.x, chunk.z);
        }
    }
}

/// Chunks touched by any segment center or footprint cell.
pub fn extract_affected_chunks(segments: &[RoadSegmentPlacement]) -> BTreeSet<ChunkCoord> {
    let mut out = BTreeSet::new();
    for s in segments {
        out.insert(s.center.chunk());
        for p in &s.width_positions {
            out.insert(p.chunk());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::roads::models::Coordinate;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn world() -> WorldId {
        WorldId::new("overworld")
    }

    const C: ChunkCoord = ChunkCoord { x: 2, z: -3 };

    #[test]
    fn mark_processed_runs_each_callback_once() {
        let gate = ChunkReleaseGate::default();
        let hits = Arc::new(AtomicUsize::new(0));
        gate.mark_pending(&world(), C);
        for _ in 0..3 {
            let h = hits.clone();
            gate.register_release_callback(&world(), C, move || { h.fetch_add(1, Ordering::SeqCst); });
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(gate.mark_processed(&world(), C));
        assert!(!gate.mark_processed(&world(), C));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let gate = ChunkReleaseGate::default();
        let order = Arc::new(PlMutex::new(Vec::new()));
        gate.mark_pending(&world(), C);
        for i in 0..5 {
            let o = order.clone();
            gate.register_release_callback(&world(), C, move || o.lock().push(i));
        }
        gate.mark_processed(&world(), C);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn registration_after_release_runs_immediately() {
        let gate = ChunkReleaseGate::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        // nothing pending at all
        gate.register_release_callback(&world(), C, move || { h.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        gate.mark_pending(&world(), C);
        gate.mark_processed(&world(), C);
        let h = hits.clone();
        gate.register_release_callback(&world(), C, move || { h.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pending_again_is_an_independent_lifecycle() {
        let gate = ChunkReleaseGate::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        gate.mark_pending(&world(), C);
        let f = first.clone();
        gate.register_release_callback(&world(), C, move || { f.fetch_add(1, Ordering::SeqCst); });
        gate.mark_processed(&world(), C);

        gate.mark_pending(&world(), C);
        assert!(gate.is_pending(&world(), C));
        let s = second.clone();
        gate.register_release_callback(&world(), C, move || { s.fetch_add(1, Ordering::SeqCst); });
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert!(gate.mark_processed(&world(), C));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn chunk_waits_for_every_holder() {
        let gate = ChunkReleaseGate::default();
        gate.mark_pending(&world(), C);
        gate.mark_pending(&world(), C);
        let rx = gate.release_signal(&world(), C);

        assert!(gate.mark_processed(&world(), C));
        assert!(gate.is_pending(&world(), C));
        assert!(rx.try_recv().is_err());

        assert!(gate.mark_processed(&world(), C));
        assert!(!gate.is_pending(&world(), C));
        assert!(rx.try_recv().is_ok());
        assert!(!gate.mark_processed(&world(), C));
    }

    #[test]
    fn timeout_overrides_remaining_holders() {
        let gate = ChunkReleaseGate::default();
        let t0 = Instant::now();
        gate.mark_pending_at(&world(), C, t0);
        gate.mark_pending_at(&world(), C, t0);
        let rx = gate.release_signal(&world(), C);
        assert_eq!(gate.sweep_at(&world(), t0 + Duration::from_secs(30)).timed_out, 1);
        assert!(rx.try_recv().is_ok());
        // late holders find nothing left to release
        assert!(!gate.mark_processed(&world(), C));
    }

    #[test]
    fn panicking_callback_does_not_stop_the_rest() {
        let gate = ChunkReleaseGate::default();
        let hits = Arc::new(AtomicUsize::new(0));
        gate.mark_pending(&world(), C);
        gate.register_release_callback(&world(), C, || panic!("consumer blew up"));
        let h = hits.clone();
        gate.register_release_callback(&world(), C, move || { h.fetch_add(1, Ordering::SeqCst); });
        assert!(gate.mark_processed(&world(), C));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_forces_release_then_grace_removes_entry() {
        let gate = ChunkReleaseGate::new(GateTimings {
            release_timeout: Duration::from_secs(30),
            removal_grace: Duration::from_secs(5),
        });
        let t0 = Instant::now();
        gate.mark_pending_at(&world(), C, t0);
        let rx = gate.release_signal(&world(), C);
        assert!(rx.try_recv().is_err());

        assert_eq!(gate.sweep_at(&world(), t0 + Duration::from_secs(29)), SweepStats::default());
        assert!(gate.is_pending(&world(), C));

        let stats = gate.sweep_at(&world(), t0 + Duration::from_secs(30));
        assert_eq!(stats.timed_out, 1);
        assert!(!gate.is_pending(&world(), C));
        assert!(rx.try_recv().is_ok());
        assert_eq!(gate.tracked(&world()), 1);

        let stats = gate.sweep_at(&world(), t0 + Duration::from_secs(36));
        assert_eq!(stats.removed, 1);
        assert_eq!(gate.tracked(&world()), 0);
    }

    #[test]
    fn release_world_flushes_pending_chunks() {
        let gate = ChunkReleaseGate::default();
        let hits = Arc::new(AtomicUsize::new(0));
        for x in 0..3 {
            let c = ChunkCoord { x, z: 0 };
            gate.mark_pending(&world(), c);
            let h = hits.clone();
            gate.register_release_callback(&world(), c, move || { h.fetch_add(1, Ordering::SeqCst); });
        }
        gate.mark_processed(&world(), ChunkCoord { x: 0, z: 0 });
        assert_eq!(gate.release_world(&world()), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(gate.pending_chunks(&world()).is_empty());
    }

    #[test]
    fn affected_chunks_cover_centers_and_footprints() {
        let seg = RoadSegmentPlacement {
            center: Coordinate::new(15, 64, 0),
            width_positions: [Coordinate::new(16, 64, 0), Coordinate::new(15, 64, -1)].into_iter().collect(),
        };
        let chunks = extract_affected_chunks(&[seg]);
        let expected: BTreeSet<ChunkCoord> = [
            ChunkCoord { x: 0, z: 0 },
            ChunkCoord { x: 1, z: 0 },
            ChunkCoord { x: 0, z: -1 },
        ]
        .into_iter()
        .collect();
        assert_eq!(chunks, expected);
    }
}
