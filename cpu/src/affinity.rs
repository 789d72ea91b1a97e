// cpu affinity for long-running I/O threads

use crate::error::CpuError;
use std::{fs, io};

// glibc's fixed cpu_set_t width
#[cfg(target_os = "linux")]
const CPU_SETSIZE: usize = 1024;

// pin the calling thread to a single cpu
#[cfg(target_os = "linux")]
pub fn set_cpu_affinity(cpu: usize) -> Result<(), CpuError> {
    let max_cpu = max_cpu_id()?;
    if cpu > max_cpu {
        return Err(CpuError::InvalidCpu { cpu, max: max_cpu });
    }
    if cpu >= CPU_SETSIZE {
        return Err(CpuError::InvalidCpu {
            cpu,
            max: CPU_SETSIZE - 1,
        });
    }

    // safety: cpu_set_t is a pod type, zero-initialization is its empty state
    let mut cpu_set: libc::cpu_set_t = unsafe { std::mem::zeroed() };

    // safety: cpu validated against CPU_SETSIZE above
    unsafe {
        libc::CPU_SET(cpu, &mut cpu_set);
    }

    // safety: pid 0 targets the calling thread; the set pointer is valid
    let result = unsafe {
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set)
    };

    if result != 0 {
        return Err(CpuError::Io(io::Error::last_os_error()));
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_cpu_affinity(_cpu: usize) -> Result<(), CpuError> {
    Err(CpuError::NotSupported)
}

// highest online cpu id
#[cfg(target_os = "linux")]
fn max_cpu_id() -> Result<usize, CpuError> {
    // sysfs reports online cpus as a range, e.g. "0-127"
    if let Ok(content) = fs::read_to_string("/sys/devices/system/cpu/online") {
        let content = content.trim();
        if let Some(range) = content.split('-').nth(1) {
            if let Ok(max) = range.parse::<usize>() {
                return Ok(max);
            }
        } else if let Ok(max) = content.parse::<usize>() {
            return Ok(max);
        }
    }

    // safety: sysconf is always safe to call
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };

    if count <= 0 {
        return Err(CpuError::Io(io::Error::last_os_error()));
    }

    Ok((count as usize).saturating_sub(1))
}

// number of online logical cpus
#[cfg(target_os = "linux")]
pub fn cpu_count() -> Result<usize, CpuError> {
    Ok(max_cpu_id()?.saturating_add(1))
}

#[cfg(not(target_os = "linux"))]
pub fn cpu_count() -> Result<usize, CpuError> {
    Err(CpuError::NotSupported)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_count_positive() {
        assert!(cpu_count().unwrap() >= 1);
    }

    #[test]
    fn test_set_affinity_current_cpu() {
        // pin to wherever we already run; always inside the cpuset
        // safety: sched_getcpu has no preconditions
        let cpu = unsafe { libc::sched_getcpu() };
        assert!(cpu >= 0);
        set_cpu_affinity(cpu as usize).unwrap();
    }

    #[test]
    fn test_set_affinity_invalid_cpu() {
        match set_cpu_affinity(usize::MAX) {
            Err(CpuError::InvalidCpu { .. }) => {}
            other => panic!("expected InvalidCpu, got {:?}", other),
        }
    }
}
