use log::warn;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::io;

/// Pins the calling thread on `cpu`, modulo the configured processor count.
pub fn set_affinity(cpu: usize) -> Result<(), nix::Error> {
    let mut core = CpuSet::new();
    core.set(cpu % num_processors())?;
    sched_setaffinity(Pid::from_raw(0), &core)
}

pub fn num_processors() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Switches the calling thread to SCHED_FIFO at `priority`.
pub fn set_realtime_priority(priority: i32) -> io::Result<()> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Real-time priority is best effort: measurements still run without it, only noisier.
pub fn try_set_realtime_priority(priority: i32) -> bool {
    match set_realtime_priority(priority) {
        Ok(()) => true,
        Err(e) => {
            warn!("sched_setscheduler failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sched::sched_getaffinity;
    use std::thread;

    #[test]
    fn pins_on_an_allowed_cpu() {
        let allowed = sched_getaffinity(Pid::from_raw(0)).unwrap();
        let first = (0..CpuSet::count())
            .find(|i| allowed.is_set(*i).unwrap())
            .unwrap();
        // Own thread, so the test harness thread keeps its affinity.
        thread::spawn(move || {
            set_affinity(first).unwrap();
            let now = sched_getaffinity(Pid::from_raw(0)).unwrap();
            assert!(now.is_set(first % num_processors()).unwrap());
            let pinned = (0..CpuSet::count())
                .filter(|i| now.is_set(*i).unwrap())
                .count();
            assert_eq!(pinned, 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn at_least_one_processor() {
        assert!(num_processors() >= 1);
    }
}
