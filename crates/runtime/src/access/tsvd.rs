use super::opcode;
use super::{AccessEngine, ProfileError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// One guest access, as seen by the probe protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessRecord {
    pub tid: u64,
    pub inst_idx: u32,
    pub opcode: u32,
    pub addr: u32,
}

impl PartialEq for AccessRecord {
    // Records are named by their static site; thread and address are
    // carried for the serialization invariant, not identity.
    fn eq(&self, other: &Self) -> bool {
        self.inst_idx == other.inst_idx && self.opcode == other.opcode
    }
}

impl Eq for AccessRecord {}

/// Unordered pair of conflicting accesses: `(a, b)` and `(b, a)` are the
/// same violation.
#[derive(Debug, Clone, Copy)]
pub struct ViolationPair {
    pub first: AccessRecord,
    pub second: AccessRecord,
}

impl ViolationPair {
    pub fn new(first: AccessRecord, second: AccessRecord) -> Self {
        Self { first, second }
    }
}

impl PartialEq for ViolationPair {
    fn eq(&self, other: &Self) -> bool {
        (self.first == other.first && self.second == other.second)
            || (self.first == other.second && self.second == other.first)
    }
}

impl Eq for ViolationPair {}

impl Hash for ViolationPair {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Commutative so that flipped pairs land in the same bucket.
        state.write_u32(self.first.inst_idx ^ self.second.inst_idx);
    }
}

#[derive(Debug, Default)]
struct Entry {
    probe: AtomicBool,
    freq_diff_tid_consec: AtomicI64,
    access: Mutex<AccessRecord>,
}

/// Probes each access and briefly delays the accessor to widen the window
/// in which a conflicting thread can collide with it.
pub struct TsvdProbe {
    table: DashMap<u32, Arc<Entry>>,
    violations: Mutex<HashSet<ViolationPair>>,
    delay_units: u32,
}

impl TsvdProbe {
    pub fn new(delay_units: u32) -> Self {
        Self {
            table: DashMap::new(),
            violations: Mutex::new(HashSet::new()),
            delay_units,
        }
    }

    /// Busy wait; a syscall sleep would stretch the probe window by
    /// scheduler latency.
    fn delay(units: u32) {
        for _ in 0..units {
            std::hint::spin_loop();
        }
    }

    fn entry(&self, addr: u32) -> Arc<Entry> {
        let guard = self.table.entry(addr).or_default();
        Arc::clone(guard.value())
    }
}

impl AccessEngine for TsvdProbe {
    fn log_access(&self, tid: u64, addr: u32, opcode: u32, inst_idx: u32) {
        let current = AccessRecord {
            tid,
            inst_idx,
            opcode,
            addr,
        };
        let entry = self.entry(addr);

        // The record mutex serializes probe handoff; it is released before
        // the delay so a conflicting thread can reach the probed branch.
        let mut record = entry.access.lock();
        let probed = entry.probe.swap(true, Ordering::SeqCst);
        if !probed {
            *record = current;
            drop(record);
            Self::delay(self.delay_units);
            entry.probe.store(false, Ordering::SeqCst);
        } else if tid != record.tid {
            let previous = opcode::lookup(record.opcode);
            let this = opcode::lookup(opcode);
            if (previous.is_store() || this.is_store())
                && (previous.is_non_atomic() || this.is_non_atomic())
            {
                self.violations
                    .lock()
                    .insert(ViolationPair::new(*record, current));
            }
            entry.freq_diff_tid_consec.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Layout: prefix, u32 violation count, then per pair
    /// `{addr, inst_1, op_1, inst_2, op_2}`.
    fn collect_profile(&self, prefix: &[u8]) -> Result<Vec<u8>, ProfileError> {
        let mut pairs: Vec<ViolationPair> = {
            let violations = self.violations.lock();
            violations.iter().copied().collect()
        };
        pairs.sort_unstable_by_key(|pair| (pair.first.inst_idx, pair.second.inst_idx));

        let mut out = prefix.to_vec();
        out.extend_from_slice(&(pairs.len() as u32).to_le_bytes());
        for pair in pairs {
            if pair.first.tid == pair.second.tid || pair.first.addr != pair.second.addr {
                return Err(ProfileError::InconsistentViolation);
            }
            for value in [
                pair.first.addr,
                pair.first.inst_idx,
                pair.first.opcode,
                pair.second.inst_idx,
                pair.second.opcode,
            ] {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Ok(out)
    }
}
