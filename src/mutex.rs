#![allow(clippy::module_name_repetitions)]

/// A `#[repr(C)]` pthread mutex, for sharing a [`crate::Pool`] and the lists over it between
/// threads, or between processes when placed in shared memory.
///
/// Pools and lists do no locking of their own; every operation on them, including dropping
/// handles, must happen while the guard is held.
#[derive(Debug)]
#[repr(C)]
pub struct Mutex<T> {
    lock: nix::sys::pthread::Mutex,
    data: std::cell::UnsafeCell<T>,
}

impl<T> Mutex<T> {
    /// Creates a new mutex, `attr` may for example make it process shared.
    ///
    /// # Errors
    ///
    /// When [`nix::sys::pthread::Mutex::new`] errors.
    pub fn new(data: T, attr: Option<nix::sys::pthread::MutexAttr>) -> nix::Result<Self> {
        #[cfg(feature = "log")]
        log::trace!("Mutex::new");

        Ok(Self {
            lock: nix::sys::pthread::Mutex::new(attr)?,
            data: std::cell::UnsafeCell::new(data),
        })
    }

    /// # Errors
    ///
    /// When locking the underlying pthread mutex fails.
    pub fn lock(&self) -> nix::Result<MutexGuard<T>> {
        #[cfg(feature = "log")]
        log::trace!("Mutex::lock");

        self.lock.lock()?;

        Ok(MutexGuard(self))
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

pub struct MutexGuard<'a, T>(&'a Mutex<T>);
unsafe impl<T: Send> Sync for Mutex<T> {}
impl<'a, T> std::ops::Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.0.data.get() }
    }
}
impl<'a, T> std::ops::DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.0.data.get() }
    }
}
impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        #[cfg(feature = "log")]
        log::trace!("Mutex::unlock");

        let result = self.0.lock.unlock();
        debug_assert!(result.is_ok(), "failed to unlock mutex: {result:?}");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::pedantic)]

    use super::*;
    use crate::Pool;

    #[test]
    fn mutex_debug() {
        assert_eq!(
            format!("{:?}", Mutex::new((), None).unwrap()),
            "Mutex { lock: Mutex(UnsafeCell { .. }), data: UnsafeCell { .. } }"
        );
    }

    #[test]
    fn mutex_get_mut() {
        let mut mutex = Mutex::new(1u8, None).unwrap();
        *mutex.get_mut() = 2;
        assert_eq!(*mutex.lock().unwrap(), 2);
    }

    #[test]
    fn shared_pool() {
        const THREADS: u64 = 4;
        const ROUNDS: u64 = 200;

        let pool = Mutex::new(Pool::<8, u64>::new(), None).unwrap();

        std::thread::scope(|scope| {
            for thread in 0..THREADS {
                let pool = &pool;
                scope.spawn(move || {
                    for round in 0..ROUNDS {
                        let guard = pool.lock().unwrap();
                        let a = guard.alloc(thread * ROUNDS + round, None).unwrap();
                        let b = a.clone();
                        assert_eq!(b.refs(), 2);
                        assert_eq!(*b, thread * ROUNDS + round);
                        drop(a);
                        drop(b);
                    }
                });
            }
        });

        let guard = pool.lock().unwrap();
        assert_eq!(guard.debug(), 0);
        assert_eq!(guard.stats().blocks_cur, 0);
        assert_eq!(guard.stats().blocks_max, 1);
    }
}
