//! The time-sliced node ownership schedule.
//!
//! The schedule is an ordered run of contiguous, non-overlapping
//! slices covering `[now, now + horizon]`. Each slice holds one cell
//! per cluster node: zero for free, or the owning reservation id.
//! Allocation is earliest-fit: slide a window of the requested length
//! forward until every candidate node is free across the whole window.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::reservation::Reservation;

/// Length of one schedule slice, in minutes. Must divide 60; shorter
/// slices mean less waiting for reservations to start but bigger
/// schedule files. Every piece of slice math goes through this symbol.
pub const SLICE_MINUTES: i64 = 1;

/// Minimum schedule length kept ahead of now, in minutes (12 hours).
pub const MIN_SCHED_LEN: i64 = 720;

/// One slice in seconds.
pub const SLICE_SECS: i64 = SLICE_MINUTES * 60;

/// Bound on extend-and-retry rounds during allocation, so a request
/// that can never fit (all nodes busy forever would need an infinite
/// schedule) fails instead of growing the file without limit.
const MAX_EXTEND_ROUNDS: usize = 1000;

/// A fixed window of time across all cluster nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlice {
    /// Start of the window, UNIX seconds, aligned to [`SLICE_SECS`].
    pub start: i64,
    /// End of the window: `start + SLICE_SECS`.
    pub end: i64,
    /// One cell per node index: reservation id, or zero for free.
    pub nodes: Vec<u64>,
}

/// Which nodes a request wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRequest {
    /// Any `n` nodes; the allocator picks the lowest free indices.
    Count(usize),
    /// Exactly these node indices.
    Explicit(Vec<usize>),
}

/// The full schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schedule {
    slices: Vec<TimeSlice>,
}

/// Round down to a slice boundary.
pub fn align(t: i64) -> i64 {
    t - t.rem_euclid(SLICE_SECS)
}

/// Slices needed to cover `minutes` of wall time.
fn slices_for(minutes: i64) -> usize {
    let secs = minutes * 60;
    ((secs + SLICE_SECS - 1) / SLICE_SECS).max(1) as usize
}

impl Schedule {
    /// The raw slice run, oldest first.
    pub fn slices(&self) -> &[TimeSlice] {
        &self.slices
    }

    /// Append zeroed slices until the schedule covers `until`.
    ///
    /// An empty schedule starts at the slice containing `base`.
    pub fn extend_to(&mut self, node_count: usize, base: i64, until: i64) {
        let mut next = match self.slices.last() {
            Some(last) => last.end,
            None => align(base),
        };

        while next < until {
            self.slices.push(TimeSlice {
                start: next,
                end: next + SLICE_SECS,
                nodes: vec![0; node_count],
            });
            next += SLICE_SECS;
        }
    }

    /// Drop every slice strictly before the slice containing `now`.
    pub fn trim_before(&mut self, now: i64) {
        let cut = align(now);
        self.slices.retain(|s| s.end > cut);
    }

    /// Zero every cell owned by `id`.
    pub fn delete(&mut self, id: u64) {
        for slice in &mut self.slices {
            for cell in &mut slice.nodes {
                if *cell == id {
                    *cell = 0;
                }
            }
        }
    }

    /// Reservation id owning node `index` at time `t`, zero if free.
    pub fn owner_at(&self, t: i64, index: usize) -> u64 {
        self.slices
            .iter()
            .find(|s| s.start <= t && t < s.end)
            .and_then(|s| s.nodes.get(index))
            .copied()
            .unwrap_or(0)
    }

    /// Find the earliest window of `duration_minutes` at or after
    /// `after` in which the request fits, and mark it with `id`.
    ///
    /// Returns `(start, end, node_indices)` where `end` honors the
    /// requested duration exactly (the marked slices cover it).
    pub fn reserve(
        &mut self,
        req: &NodeRequest,
        node_count: usize,
        duration_minutes: i64,
        after: i64,
        id: u64,
    ) -> Result<(i64, i64, Vec<usize>)> {
        if duration_minutes <= 0 {
            return Err(Error::usage("duration must be positive".to_string()));
        }
        match req {
            NodeRequest::Count(0) => {
                return Err(Error::usage("need at least one node".to_string()))
            }
            NodeRequest::Count(n) if *n > node_count => {
                return Err(Error::schedule(format!(
                    "cluster only has {} nodes",
                    node_count
                )));
            }
            NodeRequest::Explicit(indices) => {
                if indices.is_empty() {
                    return Err(Error::usage("need at least one node".to_string()));
                }
                if indices.iter().any(|&i| i >= node_count) {
                    return Err(Error::schedule("node index out of range".to_string()));
                }
            }
            _ => {}
        }

        let k = slices_for(duration_minutes);

        for _ in 0..MAX_EXTEND_ROUNDS {
            self.extend_to(
                node_count,
                after,
                align(after) + (k as i64) * SLICE_SECS + MIN_SCHED_LEN * 60,
            );

            if let Some((w, indices)) = self.find_window(req, k, after) {
                let start = self.slices[w].start;
                for slice in &mut self.slices[w..w + k] {
                    for &i in &indices {
                        slice.nodes[i] = id;
                    }
                }
                return Ok((start, start + duration_minutes * 60, indices));
            }

            // No fit in the current horizon: grow it and retry.
            let last = self.slices.last().map(|s| s.end).unwrap_or(align(after));
            self.extend_to(node_count, after, last + MIN_SCHED_LEN * 60);
        }

        Err(Error::schedule(
            "no feasible window within the schedule horizon".to_string(),
        ))
    }

    /// Earliest fitting window at or after `after`, without mutating.
    ///
    /// Returns the window's first slice index and the chosen node
    /// indices (lowest-first for count requests).
    pub fn find_window(
        &self,
        req: &NodeRequest,
        k: usize,
        after: i64,
    ) -> Option<(usize, Vec<usize>)> {
        let first = self.slices.iter().position(|s| s.start >= after)?;

        for w in first..self.slices.len().checked_sub(k - 1)? {
            let window = &self.slices[w..w + k];
            if window.len() < k {
                break;
            }

            match req {
                NodeRequest::Explicit(indices) => {
                    if indices
                        .iter()
                        .all(|&i| window.iter().all(|s| s.nodes.get(i) == Some(&0)))
                    {
                        return Some((w, indices.clone()));
                    }
                }
                NodeRequest::Count(n) => {
                    let node_count = window[0].nodes.len();
                    let free: Vec<usize> = (0..node_count)
                        .filter(|&i| window.iter().all(|s| s.nodes.get(i) == Some(&0)))
                        .take(*n)
                        .collect();
                    if free.len() == *n {
                        return Some((w, free));
                    }
                }
            }
        }

        None
    }

    /// Grow a reservation by `extra_minutes`.
    ///
    /// Succeeds only when every slice immediately after the
    /// reservation's current run is free (or already owned by it) for
    /// all of its nodes; otherwise nothing is mutated.
    pub fn extend_reservation(
        &mut self,
        r: &Reservation,
        node_indices: &[usize],
        node_count: usize,
        extra_minutes: i64,
    ) -> Result<i64> {
        if extra_minutes <= 0 {
            return Err(Error::usage("extension must be positive".to_string()));
        }

        let k = slices_for(extra_minutes);

        let last_owned = self
            .slices
            .iter()
            .rposition(|s| s.nodes.iter().any(|&c| c == r.id))
            .ok_or_else(|| Error::schedule(format!("reservation {} not in schedule", r.name)))?;

        self.extend_to(
            node_count,
            r.end_time,
            self.slices[last_owned].end + (k as i64) * SLICE_SECS + MIN_SCHED_LEN * 60,
        );

        let run = &self.slices[last_owned + 1..last_owned + 1 + k];
        for slice in run {
            for &i in node_indices {
                let cell = slice.nodes.get(i).copied().unwrap_or(0);
                if cell != 0 && cell != r.id {
                    return Err(Error::schedule(format!(
                        "conflict: node {} is reserved from {}",
                        i,
                        Reservation::format_time(slice.start)
                    )));
                }
            }
        }

        for slice in &mut self.slices[last_owned + 1..last_owned + 1 + k] {
            // Slices written before a cluster grew may be short.
            if slice.nodes.len() < node_count {
                slice.nodes.resize(node_count, 0);
            }
            for &i in node_indices {
                slice.nodes[i] = r.id;
            }
        }

        Ok(r.end_time + extra_minutes * 60)
    }

    /// Verify schedule ↔ reservation consistency; used before state is
    /// persisted and in tests. Both directions are checked: every cell
    /// must reference a live reservation, and every reservation's
    /// window must be fully marked for its hosts across the slices it
    /// intersects (slices already trimmed to the past are exempt).
    pub fn check_consistency(
        &self,
        reservations: &HashMap<u64, Reservation>,
        config: &Config,
    ) -> Result<()> {
        for slice in &self.slices {
            for &cell in &slice.nodes {
                if cell != 0 && !reservations.contains_key(&cell) {
                    return Err(Error::schedule(format!(
                        "slice at {} references unknown reservation {}",
                        slice.start, cell
                    )));
                }
            }
        }

        for (id, r) in reservations {
            for host in &r.hosts {
                let index = config.node_index(host).map_err(|_| {
                    Error::schedule(format!(
                        "reservation {} names unknown host {}",
                        r.name, host
                    ))
                })?;

                for slice in &self.slices {
                    if slice.start >= r.end_time || slice.end <= r.start_time {
                        continue;
                    }
                    let cell = slice.nodes.get(index).copied().unwrap_or(0);
                    if cell != *id {
                        return Err(Error::schedule(format!(
                            "slice at {} should hold reservation {} on {} but holds {}",
                            slice.start, r.name, host, cell
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Source of new reservation ids: nonzero, unique across the table,
/// retried on collision.
pub enum IdSource {
    /// Draw random ids (production).
    Random,
    /// Hand out 1, 2, 3, ... (tests, deterministic output).
    Sequential(u64),
}

impl IdSource {
    /// Next id not present in `existing`.
    pub fn next(&mut self, existing: &HashMap<u64, Reservation>) -> u64 {
        match self {
            IdSource::Random => loop {
                let id: u64 = rand::random();
                if id != 0 && !existing.contains_key(&id) {
                    return id;
                }
            },
            IdSource::Sequential(counter) => loop {
                *counter += 1;
                if !existing.contains_key(counter) {
                    return *counter;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(id: u64, name: &str, hosts: &[&str], start: i64, end: i64) -> Reservation {
        Reservation {
            id,
            name: name.to_string(),
            owner: "alice".to_string(),
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            start_time: start,
            end_time: end,
            vlan: 0,
            pxe_profile: None,
            kernel: None,
            initrd: None,
            kernel_args: String::new(),
        }
    }

    #[test]
    fn slices_align_and_chain() {
        let mut sched = Schedule::default();
        sched.extend_to(4, 37, 300);
        let slices = sched.slices();
        assert_eq!(slices[0].start, 0);
        for pair in slices.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert_eq!(pair[0].end - pair[0].start, SLICE_SECS);
        }
        assert!(slices.last().unwrap().end >= 300);
    }

    #[test]
    fn back_to_back_requests_do_not_overlap() {
        // Cluster of 4, two 2-node requests fill it; the third queues
        // behind them.
        let mut sched = Schedule::default();

        let (s1, e1, n1) = sched
            .reserve(&NodeRequest::Count(2), 4, 60, 0, 1)
            .unwrap();
        assert_eq!((s1, e1), (0, 3600));
        assert_eq!(n1, [0, 1]);

        let (s2, e2, n2) = sched
            .reserve(&NodeRequest::Count(2), 4, 60, 0, 2)
            .unwrap();
        assert_eq!((s2, e2), (0, 3600));
        assert_eq!(n2, [2, 3]);

        // Nothing free until the first pair ends.
        let (s3, _, n3) = sched
            .reserve(&NodeRequest::Count(3), 4, 60, 0, 3)
            .unwrap();
        assert!(s3 >= 3600);
        assert_eq!(n3, [0, 1, 2]);
    }

    #[test]
    fn explicit_nodes_wait_for_their_nodes() {
        let mut sched = Schedule::default();
        sched
            .reserve(&NodeRequest::Explicit(vec![1]), 4, 60, 0, 1)
            .unwrap();

        // Node 1 is taken for an hour; an explicit request for it
        // starts after, even though other nodes are free now.
        let (start, _, nodes) = sched
            .reserve(&NodeRequest::Explicit(vec![1]), 4, 30, 0, 2)
            .unwrap();
        assert!(start >= 3600);
        assert_eq!(nodes, [1]);
    }

    #[test]
    fn earliest_after_skips_ahead() {
        let mut sched = Schedule::default();
        let (start, end, _) = sched
            .reserve(&NodeRequest::Count(1), 4, 60, 7200, 1)
            .unwrap();
        assert_eq!(start, 7200);
        assert_eq!(end, 7200 + 3600);
    }

    #[test]
    fn delete_leaves_no_cells() {
        let mut sched = Schedule::default();
        sched.reserve(&NodeRequest::Count(2), 4, 60, 0, 9).unwrap();
        sched.delete(9);
        assert!(sched
            .slices()
            .iter()
            .all(|s| s.nodes.iter().all(|&c| c != 9)));

        // The freed window is reusable at the same start.
        let (start, _, _) = sched.reserve(&NodeRequest::Count(4), 4, 60, 0, 10).unwrap();
        assert_eq!(start, 0);
    }

    #[test]
    fn extend_succeeds_only_into_free_slices() {
        let mut sched = Schedule::default();

        let r1 = {
            let (s, e, _) = sched
                .reserve(&NodeRequest::Explicit(vec![0]), 4, 60, 0, 1)
                .unwrap();
            res(1, "first", &["kn01"], s, e)
        };

        // A second reservation takes node 0 right at the boundary.
        let (s2, e2, _) = sched
            .reserve(&NodeRequest::Explicit(vec![0]), 4, 60, r1.end_time, 2)
            .unwrap();
        assert_eq!(s2, 3600);
        let r2 = res(2, "second", &["kn01"], s2, e2);

        // Extending the first by even a minute collides.
        let before = sched.clone();
        assert!(sched.extend_reservation(&r1, &[0], 4, 1).is_err());
        // Failure mutates nothing.
        assert_eq!(sched, before);

        // Delete the blocker, then the extension lands.
        sched.delete(r2.id);
        let new_end = sched.extend_reservation(&r1, &[0], 4, 1).unwrap();
        assert_eq!(new_end, r1.end_time + 60);
        assert_eq!(sched.owner_at(r1.end_time, 0), 1);
    }

    #[test]
    fn trim_drops_past_slices_only() {
        let mut sched = Schedule::default();
        sched.extend_to(2, 0, 600);
        sched.trim_before(185);
        // The slice containing t=185 (120..180 is gone, 180..240 stays).
        assert_eq!(sched.slices()[0].start, 180);
    }

    fn test_config(nodes: usize) -> Config {
        Config {
            tftp_root: "/tftpboot".into(),
            prefix: "kn".to_string(),
            start: 1,
            end: nodes,
            padlen: 2,
            ..Config::default()
        }
    }

    #[test]
    fn consistency_check_finds_orphans() {
        let config = test_config(2);
        let mut sched = Schedule::default();
        sched.reserve(&NodeRequest::Count(1), 2, 60, 0, 5).unwrap();

        let mut table = HashMap::new();
        assert!(sched.check_consistency(&table, &config).is_err());

        table.insert(5, res(5, "r", &["kn01"], 0, 3600));
        sched.check_consistency(&table, &config).unwrap();
    }

    #[test]
    fn consistency_check_finds_unmarked_windows() {
        let config = test_config(2);

        // A recorded reservation whose window was never written into
        // the schedule at all.
        let mut sched = Schedule::default();
        sched.extend_to(2, 0, 3600);
        let mut table = HashMap::new();
        table.insert(7, res(7, "ghost", &["kn02"], 0, 3600));
        assert!(sched.check_consistency(&table, &config).is_err());

        // Properly allocated, the same table passes.
        let mut sched = Schedule::default();
        sched
            .reserve(&NodeRequest::Explicit(vec![1]), 2, 60, 0, 7)
            .unwrap();
        sched.check_consistency(&table, &config).unwrap();

        // A single cell zeroed inside the window is drift.
        sched.slices[30].nodes[1] = 0;
        assert!(sched.check_consistency(&table, &config).is_err());
    }

    #[test]
    fn binary_round_trip() {
        let mut sched = Schedule::default();
        sched.reserve(&NodeRequest::Count(2), 4, 90, 0, 3).unwrap();

        let bytes = bincode::serialize(&sched).unwrap();
        let back: Schedule = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, sched);
    }

    #[test]
    fn sequential_ids_skip_existing() {
        let mut ids = IdSource::Sequential(0);
        let mut table = HashMap::new();
        assert_eq!(ids.next(&table), 1);
        table.insert(2, res(2, "x", &[], 0, 1));
        assert_eq!(ids.next(&table), 3);
    }

    #[test]
    fn random_ids_are_nonzero_and_fresh() {
        let mut ids = IdSource::Random;
        let table = HashMap::new();
        let a = ids.next(&table);
        let b = ids.next(&table);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }
}
