use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

struct FillBuf {
    index: HashMap<usize, usize>,
    rows: Vec<f64>,
}

struct CacheShard {
    fill: Mutex<FillBuf>,
    frozen_index: HashMap<usize, usize>,
    frozen_rows: Vec<f64>,
}

/// Bounded, partitioned row cache with build-and-freeze semantics.
///
/// One shard per worker. While a generation fills, each worker appends rows
/// into its own shard (bounded to `capacity / (2 * workers)` rows) behind a
/// shard-local lock; lookups miss. Once [`build_index`](RowCache::build_index)
/// runs, the generation is frozen: lookups are lock-free reads of the frozen
/// storage and further inserts are silently refused. A generation never
/// evicts; the engine discards the whole cache on its regeneration schedule
/// instead.
///
/// `worker` identifies the shard, which is always the worker that owns the
/// row under the stable row-to-worker map.
pub struct RowCache {
    ncols: usize,
    shard_cap: usize,
    frozen: bool,
    hits: AtomicUsize,
    shards: Vec<CacheShard>,
}

impl RowCache {
    pub fn new(workers: usize, ncols: usize, capacity_rows: usize) -> Self {
        let shard_cap = (capacity_rows / (2 * workers)).max(1);
        let shards = (0..workers)
            .map(|_| CacheShard {
                fill: Mutex::new(FillBuf {
                    index: HashMap::new(),
                    rows: Vec::new(),
                }),
                frozen_index: HashMap::new(),
                frozen_rows: Vec::new(),
            })
            .collect();
        RowCache {
            ncols,
            shard_cap,
            frozen: false,
            hits: AtomicUsize::new(0),
            shards,
        }
    }

    /// Look up a cached row. Misses are a normal return value; only a
    /// frozen generation serves hits.
    pub fn get(&self, worker: usize, row_id: usize) -> Option<&[f64]> {
        if !self.frozen {
            return None;
        }
        let shard = &self.shards[worker];
        let &slot = shard.frozen_index.get(&row_id)?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(&shard.frozen_rows[slot * self.ncols..(slot + 1) * self.ncols])
    }

    /// Offer a row to the calling worker's shard. A frozen generation, a
    /// full shard, or an already-registered id silently refuse.
    pub fn try_insert(&self, worker: usize, row_id: usize, row: &[f64]) {
        if self.frozen {
            return;
        }
        let mut buf = self.shards[worker].fill.lock().unwrap();
        if buf.index.len() >= self.shard_cap || buf.index.contains_key(&row_id) {
            return;
        }
        let slot = buf.index.len();
        buf.index.insert(row_id, slot);
        buf.rows.extend_from_slice(row);
    }

    /// Freeze every shard into its read-only lookup form.
    pub fn build_index(&mut self) {
        for shard in &mut self.shards {
            let buf = shard.fill.get_mut().unwrap();
            shard.frozen_index = std::mem::take(&mut buf.index);
            shard.frozen_rows = std::mem::take(&mut buf.rows);
        }
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }
}

/// Regeneration schedule for the row cache.
///
/// `io_iter` counts iterations that performed at least one row fetch. A
/// regeneration falls due when `io_iter` reaches the `due` mark; the update
/// interval then doubles on the first regeneration and afterwards grows by
/// the number of io-iterations since the previous one. Regenerations thus
/// concentrate at the start of a run, while centroids still move, and die
/// out as the run converges. With the default start interval of 5 the due
/// marks are 5, 15, 35, 75, ...
pub struct RegenSchedule {
    interval: u32,
    io_iter: u32,
    due: u32,
    last_regen: u32,
    regens: u32,
}

impl RegenSchedule {
    pub fn new(start_interval: u32) -> Self {
        let interval = start_interval.max(1);
        RegenSchedule {
            interval,
            io_iter: 0,
            due: interval,
            last_regen: 0,
            regens: 0,
        }
    }

    /// Record the end of an iteration; returns `true` when the cache should
    /// be regenerated now. Iterations without any row fetch do not advance
    /// the schedule.
    pub fn advance(&mut self, did_fetch: bool) -> bool {
        if !did_fetch {
            return false;
        }
        self.io_iter += 1;
        if self.io_iter != self.due {
            return false;
        }
        let since = self.io_iter - self.last_regen;
        self.interval = if self.regens == 0 {
            self.interval * 2
        } else {
            self.interval + since
        };
        self.last_regen = self.io_iter;
        self.due = self.io_iter + self.interval;
        self.regens += 1;
        true
    }

    pub fn io_iter(&self) -> u32 {
        self.io_iter
    }

    pub fn regens(&self) -> u32 {
        self.regens
    }
}
