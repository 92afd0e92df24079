use rand::Rng;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};

/// Duplicate stdout for framed output, then point fd 1 and fd 2 at
/// /dev/null so guest prints cannot corrupt the frame stream.
pub fn steal_stdout() -> io::Result<File> {
    let null = OpenOptions::new().write(true).open("/dev/null")?;

    // Safety: fd 1 is valid at process start; the dup'd descriptor is
    // owned by the returned File and nothing else.
    unsafe {
        let pipe_fd = libc::dup(1);
        if pipe_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(null.as_raw_fd(), 1) < 0 || libc::dup2(null.as_raw_fd(), 2) < 0 {
            libc::close(pipe_fd);
            return Err(io::Error::last_os_error());
        }
        Ok(File::from_raw_fd(pipe_fd))
    }
}

/// Density-driven 0/1 instruction mask; `density` is a percentage.
pub fn random_inst_mask(density: u32, len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| u8::from(rng.gen_range(0u32..100) < density))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_extremes_are_deterministic() {
        assert_eq!(random_inst_mask(0, 16), vec![0u8; 16]);
        assert_eq!(random_inst_mask(100, 16), vec![1u8; 16]);
    }

    #[test]
    fn mask_is_zero_one_valued() {
        let mask = random_inst_mask(50, 256);
        assert_eq!(mask.len(), 256);
        assert!(mask.iter().all(|b| *b <= 1));
    }
}
