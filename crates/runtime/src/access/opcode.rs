/// Kind of memory access an opcode performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    None,
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atomicity {
    Atomic,
    NonAtomic,
}

/// Classification of one memory-access opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpAccess {
    pub mnemonic: &'static str,
    pub ty: AccessType,
    /// Access width in bytes.
    pub width: u8,
    pub atomicity: Atomicity,
}

impl OpAccess {
    pub fn is_store(&self) -> bool {
        self.ty == AccessType::Store
    }

    pub fn is_non_atomic(&self) -> bool {
        self.atomicity == Atomicity::NonAtomic
    }
}

const fn op(mnemonic: &'static str, ty: AccessType, width: u8, atomicity: Atomicity) -> OpAccess {
    OpAccess {
        mnemonic,
        ty,
        width,
        atomicity,
    }
}

/// Width pattern of one atomic RMW block: i32, i64, i32 8/16, i64 8/16/32.
const RMW_WIDTHS: [u8; 7] = [4, 8, 1, 2, 1, 2, 4];

/// Classify `opcode`. Atomic operations arrive with the 0xFE prefix in
/// the high byte. Unknown opcodes classify as no-access.
pub fn lookup(opcode: u32) -> OpAccess {
    use AccessType::{Load, None, Store};
    use Atomicity::{Atomic, NonAtomic};

    match opcode {
        0x28 => op("i32.load", Load, 4, NonAtomic),
        0x29 => op("i64.load", Load, 8, NonAtomic),
        0x2A => op("f32.load", Load, 4, NonAtomic),
        0x2B => op("f64.load", Load, 8, NonAtomic),
        0x2C => op("i32.load8_s", Load, 1, NonAtomic),
        0x2D => op("i32.load8_u", Load, 1, NonAtomic),
        0x2E => op("i32.load16_s", Load, 2, NonAtomic),
        0x2F => op("i32.load16_u", Load, 2, NonAtomic),
        0x30 => op("i64.load8_s", Load, 1, NonAtomic),
        0x31 => op("i64.load8_u", Load, 1, NonAtomic),
        0x32 => op("i64.load16_s", Load, 2, NonAtomic),
        0x33 => op("i64.load16_u", Load, 2, NonAtomic),
        0x34 => op("i64.load32_s", Load, 4, NonAtomic),
        0x35 => op("i64.load32_u", Load, 4, NonAtomic),
        0x36 => op("i32.store", Store, 4, NonAtomic),
        0x37 => op("i64.store", Store, 8, NonAtomic),
        0x38 => op("f32.store", Store, 4, NonAtomic),
        0x39 => op("f64.store", Store, 8, NonAtomic),
        0x3A => op("i32.store8", Store, 1, NonAtomic),
        0x3B => op("i32.store16", Store, 2, NonAtomic),
        0x3C => op("i64.store8", Store, 1, NonAtomic),
        0x3D => op("i64.store16", Store, 2, NonAtomic),
        0x3E => op("i64.store32", Store, 4, NonAtomic),

        0xFE00 => op("memory.atomic.notify", None, 4, Atomic),
        0xFE01 => op("memory.atomic.wait32", None, 4, Atomic),
        0xFE02 => op("memory.atomic.wait64", None, 8, Atomic),
        0xFE03 => op("atomic.fence", None, 0, Atomic),

        0xFE10 => op("i32.atomic.load", Load, 4, Atomic),
        0xFE11 => op("i64.atomic.load", Load, 8, Atomic),
        0xFE12 => op("i32.atomic.load8_u", Load, 1, Atomic),
        0xFE13 => op("i32.atomic.load16_u", Load, 2, Atomic),
        0xFE14 => op("i64.atomic.load8_u", Load, 1, Atomic),
        0xFE15 => op("i64.atomic.load16_u", Load, 2, Atomic),
        0xFE16 => op("i64.atomic.load32_u", Load, 4, Atomic),
        0xFE17 => op("i32.atomic.store", Store, 4, Atomic),
        0xFE18 => op("i64.atomic.store", Store, 8, Atomic),
        0xFE19 => op("i32.atomic.store8", Store, 1, Atomic),
        0xFE1A => op("i32.atomic.store16", Store, 2, Atomic),
        0xFE1B => op("i64.atomic.store8", Store, 1, Atomic),
        0xFE1C => op("i64.atomic.store16", Store, 2, Atomic),
        0xFE1D => op("i64.atomic.store32", Store, 4, Atomic),

        // RMW blocks (add, sub, and, or, xor, xchg, cmpxchg): read and
        // write, so they classify as stores.
        0xFE1E..=0xFE4E => op(
            "atomic.rmw",
            Store,
            RMW_WIDTHS[((opcode - 0xFE1E) % 7) as usize],
            Atomic,
        ),

        _ => op("unknown", None, 0, NonAtomic),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_loads_and_stores() {
        let load = lookup(0x28);
        assert_eq!(load.ty, AccessType::Load);
        assert_eq!(load.width, 4);
        assert!(load.is_non_atomic());
        assert!(!load.is_store());

        let store = lookup(0x3A);
        assert!(store.is_store());
        assert_eq!(store.width, 1);
        assert_eq!(store.mnemonic, "i32.store8");
    }

    #[test]
    fn atomic_accesses() {
        let load = lookup(0xFE10);
        assert_eq!(load.ty, AccessType::Load);
        assert!(!load.is_non_atomic());

        let store = lookup(0xFE18);
        assert!(store.is_store());
        assert_eq!(store.width, 8);
        assert!(!store.is_non_atomic());
    }

    #[test]
    fn rmw_classifies_as_atomic_store() {
        // i32.atomic.rmw.add
        let rmw = lookup(0xFE1E);
        assert!(rmw.is_store());
        assert_eq!(rmw.width, 4);
        assert!(!rmw.is_non_atomic());

        // i64.atomic.rmw32.cmpxchg_u, last op of the last block
        let cmpxchg = lookup(0xFE4E);
        assert!(cmpxchg.is_store());
        assert_eq!(cmpxchg.width, 4);
    }

    #[test]
    fn unknown_and_non_access_opcodes() {
        assert_eq!(lookup(0x01).ty, AccessType::None);
        assert_eq!(lookup(0xFE01).ty, AccessType::None);
        assert_eq!(lookup(0xFFFF_FFFF).ty, AccessType::None);
    }
}
