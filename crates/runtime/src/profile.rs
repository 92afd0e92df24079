/// Guest resource usage, reported as the fixed-size profile prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rusage {
    /// Monotonic-raw microseconds elapsed inside the guest's main.
    pub cpu_time_us: u64,
}

impl Rusage {
    pub const LEN: usize = 8;

    pub fn to_le_bytes(&self) -> [u8; Self::LEN] {
        self.cpu_time_us.to_le_bytes()
    }
}

/// Raw monotonic clock in microseconds, immune to NTP slew.
pub fn cpu_time_raw_us() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: `ts` outlives the call; CLOCK_MONOTONIC_RAW is always valid.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rusage_serializes_little_endian() {
        let rusage = Rusage {
            cpu_time_us: 0x0102_0304_0506_0708,
        };
        assert_eq!(
            rusage.to_le_bytes(),
            [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn raw_clock_is_monotonic() {
        let first = cpu_time_raw_us();
        let second = cpu_time_raw_us();
        assert!(second >= first);
    }
}
