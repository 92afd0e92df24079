use super::opcode;
use super::{AccessEngine, ProfileError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Per-address tracking state, serialized by the entry mutex.
#[derive(Debug, Default)]
struct EntryState {
    /// 0 means the address was never accessed.
    last_tid: u64,
    /// Instruction set kept only while the address is unshared; drained
    /// into the global set on the shared transition.
    inst_idxs: Option<HashSet<u32>>,
    freq: u64,
    shared: bool,
    write_encountered: bool,
}

#[derive(Debug, Default)]
struct Entry {
    state: Mutex<EntryState>,
}

/// Identifies instructions that touched addresses shared across threads.
///
/// Entries materialize on first access, so untouched addresses cost
/// nothing; `max_memory` bounds the serialization scan.
pub struct SharedTracker {
    table: DashMap<u32, Arc<Entry>>,
    shared_inst_idxs: Mutex<BTreeSet<u32>>,
    addr_min: AtomicU32,
    addr_max: AtomicU32,
    max_memory: u64,
}

impl SharedTracker {
    pub fn new(max_memory: u64) -> Self {
        Self {
            table: DashMap::new(),
            shared_inst_idxs: Mutex::new(BTreeSet::new()),
            addr_min: AtomicU32::new(u32::MAX),
            addr_max: AtomicU32::new(0),
            max_memory,
        }
    }

    fn entry(&self, addr: u32) -> Arc<Entry> {
        let guard = self.table.entry(addr).or_default();
        Arc::clone(guard.value())
    }
}

impl AccessEngine for SharedTracker {
    fn log_access(&self, tid: u64, addr: u32, opcode: u32, inst_idx: u32) {
        let is_write = opcode::lookup(opcode).is_store();
        let entry = self.entry(addr);

        let mut state = entry.state.lock();
        if state.last_tid == 0 {
            // First-ever access is unshared regardless of thread or op.
            state.inst_idxs = Some(HashSet::from([inst_idx]));
        } else if state.shared {
            // Lock order: entry mutex, then the global set, never reversed.
            self.shared_inst_idxs.lock().insert(inst_idx);
        } else if tid != state.last_tid {
            state.shared = true;
            let drained = state.inst_idxs.take();
            let mut global = self.shared_inst_idxs.lock();
            if let Some(idxs) = drained {
                global.extend(idxs);
            }
            global.insert(inst_idx);
        } else if let Some(idxs) = state.inst_idxs.as_mut() {
            idxs.insert(inst_idx);
        }
        state.last_tid = tid;
        state.freq += 1;
        state.write_encountered = is_write;
        drop(state);

        self.addr_min.fetch_min(addr, Ordering::Relaxed);
        self.addr_max.fetch_max(addr, Ordering::Relaxed);
    }

    /// Layout: prefix, shared inst idxs (count + ascending values), shared
    /// addrs (count + ascending values), then one partial record per
    /// unshared address in ascending address order.
    fn collect_profile(&self, prefix: &[u8]) -> Result<Vec<u8>, ProfileError> {
        let mut out = prefix.to_vec();

        let addr_ceiling = self
            .max_memory
            .saturating_sub(1)
            .min(u64::from(u32::MAX)) as u32;
        let addr_max = self.addr_max.load(Ordering::Relaxed).min(addr_ceiling);

        let shared_insts = self.shared_inst_idxs.lock();
        out.extend_from_slice(&(shared_insts.len() as u32).to_le_bytes());
        for idx in shared_insts.iter() {
            out.extend_from_slice(&idx.to_le_bytes());
        }
        drop(shared_insts);

        let mut touched: Vec<u32> = self
            .table
            .iter()
            .map(|entry| *entry.key())
            .filter(|addr| *addr <= addr_max)
            .collect();
        touched.sort_unstable();

        let mut shared_addrs = Vec::new();
        let mut partials = Vec::new();
        for addr in touched {
            let Some(entry) = self.table.get(&addr) else {
                continue;
            };
            let state = entry.state.lock();
            if state.last_tid == 0 {
                continue;
            }
            if state.shared {
                shared_addrs.push(addr);
            } else {
                partials.extend_from_slice(&addr.to_le_bytes());
                partials.extend_from_slice(&state.last_tid.to_le_bytes());
                partials.push(state.write_encountered as u8);
                let mut idxs: Vec<u32> = state
                    .inst_idxs
                    .as_ref()
                    .map(|set| set.iter().copied().collect())
                    .unwrap_or_default();
                idxs.sort_unstable();
                partials.extend_from_slice(&(idxs.len() as u32).to_le_bytes());
                for idx in idxs {
                    partials.extend_from_slice(&idx.to_le_bytes());
                }
            }
        }

        out.extend_from_slice(&(shared_addrs.len() as u32).to_le_bytes());
        for addr in shared_addrs {
            out.extend_from_slice(&addr.to_le_bytes());
        }
        out.extend_from_slice(&partials);

        Ok(out)
    }
}
