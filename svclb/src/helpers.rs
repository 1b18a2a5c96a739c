use anyhow::anyhow;
use libc::{clock_gettime, timespec, CLOCK_MONOTONIC};

pub(crate) fn if_index_to_name(index: u32) -> Option<String> {
    let mut name = [0 as libc::c_char; libc::IF_NAMESIZE];
    let iname = unsafe { libc::if_indextoname(index, name.as_mut_ptr()) };

    if iname.is_null() {
        None
    } else {
        let str = unsafe { std::ffi::CStr::from_ptr(iname) };
        Some(str.to_string_lossy().to_string())
    }
}

pub(crate) fn if_name_or_default(index: u32) -> String {
    if_index_to_name(index).unwrap_or_else(|| format!("if#{}", index))
}

/// Resolves an interface name, `if#<index>` names an index directly.
pub fn ifindex(ifname: &str) -> Result<u32, anyhow::Error> {
    if let Some(index) = ifname.strip_prefix("if#") {
        if let Ok(index) = index.parse::<u32>() {
            return Ok(index);
        }
    }

    let c_interface = std::ffi::CString::new(ifname)?;
    let if_index = unsafe { libc::if_nametoindex(c_interface.as_ptr()) };
    if if_index == 0 {
        Err(anyhow!("No interface named {}", ifname))
    } else {
        Ok(if_index)
    }
}

/// Monotonic clock in nanoseconds, zero if the clock can't be read.
pub fn get_monotonic_clock_ns() -> u64 {
    let mut tp = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ptp = &mut tp as *mut timespec;

    if 0 != unsafe { clock_gettime(CLOCK_MONOTONIC, ptp) } {
        return 0;
    }

    tp.tv_sec as u64 * 1_000_000_000 + tp.tv_nsec as u64
}

/// Formats the age of a timestamp taken from the monotonic clock.
pub struct PrintTimeStatus {
    now: u64,
}

impl PrintTimeStatus {
    pub fn new(now: u64) -> Self {
        Self { now }
    }

    pub fn status(&self, expires: u64) -> String {
        if self.now >= expires {
            "stale".to_string()
        } else {
            format!("{}s", expires - self.now)
        }
    }
}
