//! Process helpers for the QEMU supervisor.
//!
//! Signal delivery and CPU pinning go through libc; the supervisor
//! itself owns the `std::process::Child` and its blocking `wait`.

use crate::error::{Error, Result};

/// Check if a process is alive.
pub fn is_alive(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Send SIGKILL to a process.
///
/// Returns true if the signal was sent successfully.
pub fn kill(pid: libc::pid_t) -> bool {
    unsafe { libc::kill(pid, libc::SIGKILL) == 0 }
}

/// Pin a process to the given CPU set.
///
/// An empty set is a configuration error; unknown CPUs surface as the
/// underlying EINVAL.
pub fn set_affinity(pid: libc::pid_t, cpus: &[usize]) -> Result<()> {
    if cpus.is_empty() {
        return Err(Error::config("affinity set is empty"));
    }

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }

        if libc::sched_setaffinity(pid, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            let err = std::io::Error::last_os_error();
            return Err(Error::launch(format!("pin pid {} failed: {}", pid, err)));
        }
    }

    Ok(())
}

/// Per-process usage counters, read from `/proc/<pid>/stat`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcStats {
    /// Process id the stats were read for.
    pub pid: i32,
    /// User-mode jiffies.
    pub utime: u64,
    /// Kernel-mode jiffies.
    pub stime: u64,
    /// Virtual memory size in bytes.
    pub vsize: u64,
    /// Resident set size in pages.
    pub rss: i64,
}

/// Read usage counters for a pid from procfs.
pub fn read_proc_stats(pid: libc::pid_t) -> Result<ProcStats> {
    let raw = std::fs::read_to_string(format!("/proc/{}/stat", pid))?;
    parse_proc_stat(pid, &raw)
}

/// Parse one `/proc/<pid>/stat` line.
///
/// The comm field (2) may contain spaces and parentheses, so fields are
/// counted from the closing paren rather than split naively.
fn parse_proc_stat(pid: libc::pid_t, raw: &str) -> Result<ProcStats> {
    let after_comm = raw
        .rfind(')')
        .map(|i| &raw[i + 1..])
        .ok_or_else(|| Error::launch(format!("unparseable stat line for pid {}", pid)))?;

    // after_comm starts at field 3 (state); utime/stime are fields 14/15,
    // vsize 23, rss 24.
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    if fields.len() < 22 {
        return Err(Error::launch(format!(
            "short stat line for pid {}: {} fields",
            pid,
            fields.len()
        )));
    }

    let parse = |s: &str| s.parse::<u64>().unwrap_or(0);

    Ok(ProcStats {
        pid,
        utime: parse(fields[11]),
        stime: parse(fields[12]),
        vsize: parse(fields[20]),
        rss: fields[21].parse::<i64>().unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_self() {
        let pid = unsafe { libc::getpid() };
        assert!(is_alive(pid));
    }

    #[test]
    fn stat_line_with_spaces_in_comm() {
        let raw = "1234 (qemu system x86) S 1 1234 1234 0 -1 4194560 \
                   100 0 0 0 55 33 0 0 20 0 4 0 12345 987654321 4321 \
                   18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";
        let stats = parse_proc_stat(1234, raw).unwrap();
        assert_eq!(stats.utime, 55);
        assert_eq!(stats.stime, 33);
        assert_eq!(stats.vsize, 987654321);
        assert_eq!(stats.rss, 4321);
    }

    #[test]
    fn empty_affinity_rejected() {
        let pid = unsafe { libc::getpid() };
        assert!(set_affinity(pid, &[]).is_err());
    }
}
