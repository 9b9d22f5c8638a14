//! Realtime disciplines: denormal handling, scoped caches, priority sync.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Interval between realtime priority synchronisations. The current
/// priority is piggy-backed on the next audio request whenever this much
/// wall-clock time has passed.
pub const PRIORITY_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Flushes denormals to zero for as long as the value lives.
///
/// Acquired around audio processing; the previous control-register state is
/// restored on every exit path, including unwinds.
pub struct ScopedFlushToZero {
    #[cfg(target_arch = "x86_64")]
    previous_csr: u32,
}

#[cfg(target_arch = "x86_64")]
const FTZ_DAZ_BITS: u32 = 0x8040;

impl ScopedFlushToZero {
    /// Enable flush-to-zero and denormals-are-zero.
    #[cfg(target_arch = "x86_64")]
    pub fn new() -> ScopedFlushToZero {
        unsafe {
            let previous_csr = std::arch::x86_64::_mm_getcsr();
            std::arch::x86_64::_mm_setcsr(previous_csr | FTZ_DAZ_BITS);
            ScopedFlushToZero { previous_csr }
        }
    }

    /// No denormal control on this architecture.
    #[cfg(not(target_arch = "x86_64"))]
    pub fn new() -> ScopedFlushToZero {
        ScopedFlushToZero {}
    }
}

impl Default for ScopedFlushToZero {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedFlushToZero {
    fn drop(&mut self) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_setcsr(self.previous_csr);
        }
    }
}

/// Single-writer cache whose value is only visible while a guard is alive.
///
/// Used to answer repeated synchronous queries a plugin makes during one
/// host call without re-entering the socket: the host call stores the value
/// for its own duration, the socket-thread handlers read it.
pub struct ScopedValueCache<T: Clone> {
    value: Mutex<Option<T>>,
}

impl<T: Clone> Default for ScopedValueCache<T> {
    fn default() -> Self {
        ScopedValueCache { value: Mutex::new(None) }
    }
}

impl<T: Clone> ScopedValueCache<T> {
    /// Install a value for the lifetime of the returned guard.
    pub fn set(&self, value: T) -> ScopedValueGuard<'_, T> {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        ScopedValueGuard { cache: self }
    }

    /// The cached value, if a guard is currently alive.
    pub fn get(&self) -> Option<T> {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Clears its cache's value on drop.
pub struct ScopedValueGuard<'a, T: Clone> {
    cache: &'a ScopedValueCache<T>,
}

impl<T: Clone> Drop for ScopedValueGuard<'_, T> {
    fn drop(&mut self) {
        *self.cache.value.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Cache whose value stays alive for a fixed wall-clock span.
///
/// Backs slowly changing cross-process reads such as the remote version
/// string.
pub struct TimedValueCache<T: Clone> {
    ttl: Duration,
    slot: Mutex<Option<(T, Instant)>>,
}

impl<T: Clone> TimedValueCache<T> {
    /// Cache with the given time to live.
    pub fn new(ttl: Duration) -> TimedValueCache<T> {
        TimedValueCache { ttl, slot: Mutex::new(None) }
    }

    /// The cached value if it has not expired.
    pub fn get(&self) -> Option<T> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref()
            .filter(|(_, stored)| stored.elapsed() < self.ttl)
            .map(|(value, _)| value.clone())
    }

    /// Store a value, restarting its lifetime.
    pub fn set(&self, value: T) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some((value, Instant::now()));
    }

    /// Return the cached value, refreshing it through `produce` on expiry.
    pub fn get_or_insert_with(&self, produce: impl FnOnce() -> T) -> T {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((value, stored)) = slot.as_ref() {
            if stored.elapsed() < self.ttl {
                return value.clone();
            }
        }
        let value = produce();
        *slot = Some((value.clone(), Instant::now()));
        value
    }
}

/// The calling thread's SCHED_FIFO priority, if it runs under that policy.
pub fn current_realtime_priority() -> Option<i32> {
    unsafe {
        let mut policy = 0;
        let mut param: libc::sched_param = std::mem::zeroed();
        if libc::pthread_getschedparam(libc::pthread_self(), &mut policy, &mut param) != 0 {
            return None;
        }
        (policy == libc::SCHED_FIFO).then(|| param.sched_priority)
    }
}

/// Move the calling thread to SCHED_FIFO at `priority`.
///
/// Failure (typically missing privileges) is reported so callers can warn
/// once and carry on with the default policy.
pub fn set_realtime_priority(priority: i32) -> std::io::Result<()> {
    unsafe {
        let param = libc::sched_param { sched_priority: priority };
        if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

/// Rate limiter for priority piggy-backing on the audio path.
pub struct PrioritySync {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Default for PrioritySync {
    fn default() -> Self {
        PrioritySync::new(PRIORITY_SYNC_INTERVAL)
    }
}

impl PrioritySync {
    /// Sync at most once per `interval`.
    pub fn new(interval: Duration) -> PrioritySync {
        PrioritySync { interval, last: Mutex::new(None) }
    }

    /// The priority to attach to the next audio request, if the interval
    /// has elapsed and the calling thread runs realtime FIFO.
    pub fn poll(&self) -> Option<i32> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let due = last.map_or(true, |at| at.elapsed() >= self.interval);
        if !due {
            return None;
        }
        let priority = current_realtime_priority()?;
        *last = Some(Instant::now());
        Some(priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn flush_to_zero_restores_prior_state() {
        unsafe {
            let before = std::arch::x86_64::_mm_getcsr();
            {
                let _guard = ScopedFlushToZero::new();
                let active = std::arch::x86_64::_mm_getcsr();
                assert_eq!(active & FTZ_DAZ_BITS, FTZ_DAZ_BITS);
            }
            assert_eq!(std::arch::x86_64::_mm_getcsr(), before);
        }
    }

    #[test]
    fn scoped_cache_is_some_iff_guard_alive() {
        let cache = ScopedValueCache::default();
        assert_eq!(cache.get(), None::<i32>);
        {
            let _guard = cache.set(17);
            assert_eq!(cache.get(), Some(17));
        }
        assert_eq!(cache.get(), None);
    }

    #[test]
    fn timed_cache_expires() {
        let cache = TimedValueCache::new(Duration::from_millis(10));
        assert_eq!(cache.get_or_insert_with(|| 1), 1);
        assert_eq!(cache.get(), Some(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(), None);
        assert_eq!(cache.get_or_insert_with(|| 2), 2);
    }

    #[test]
    fn priority_sync_rate_limits() {
        let sync = PrioritySync::new(Duration::from_secs(3600));
        // Not running SCHED_FIFO in tests: poll always yields None, but it
        // must not consume the interval slot when it does.
        if sync.poll().is_none() {
            assert!(sync.last.lock().unwrap().is_none());
        }
    }

    #[test]
    fn reading_priority_never_panics() {
        let _ = current_realtime_priority();
    }
}
