// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded worker pool for independent decode tasks.

use crate::{Error, Result, SubCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Either a rayon pool of fixed size or synchronous execution on the calling thread.
#[derive(Debug, Clone)]
pub(crate) struct DecodePool(Option<Arc<rayon_core::ThreadPool>>);

impl DecodePool {
    pub(crate) const fn synchronous() -> Self {
        Self(None)
    }

    /// A pool of `threads` workers; zero runs every task on the calling thread.
    pub(crate) fn with_threads(threads: usize) -> Self {
        if threads == 0 {
            return Self::synchronous();
        }
        match rayon_core::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("heif-decode-{i}"))
            .build()
        {
            Ok(pool) => {
                log::debug!("decode pool with {threads} threads");
                Self(Some(Arc::new(pool)))
            },
            Err(e) => {
                log::warn!("failed to start decode pool ({e}); decoding on the calling thread");
                Self::synchronous()
            },
        }
    }

    /// Sized by the available hardware concurrency.
    pub(crate) fn default_size() -> usize {
        std::thread::available_parallelism().map_or(0, usize::from)
    }

    pub(crate) fn threads(&self) -> usize {
        self.0.as_ref().map_or(0, |pool| pool.current_num_threads())
    }

    /// Run `task(0..count)` and collect the results in index order.
    ///
    /// Once a task fails, tasks that have not started yet are skipped; running
    /// ones finish. The error of the lowest failing index is returned.
    pub(crate) fn run<T, F>(&self, count: usize, task: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync,
    {
        let mut slots: Vec<Option<Result<T>>> = Vec::new();
        slots.try_reserve_exact(count).map_err(|_| Error::OutOfMemory)?;
        slots.resize_with(count, || None);
        let failed = AtomicBool::new(false);

        match &self.0 {
            Some(pool) => {
                let (task, failed) = (&task, &failed);
                pool.scope(|scope| {
                    for (index, slot) in slots.iter_mut().enumerate() {
                        scope.spawn(move |_| {
                            if failed.load(Ordering::Acquire) {
                                return;
                            }
                            let result = task(index);
                            if result.is_err() {
                                failed.store(true, Ordering::Release);
                            }
                            *slot = Some(result);
                        });
                    }
                });
            },
            None => {
                for (index, slot) in slots.iter_mut().enumerate() {
                    let result = task(index);
                    let stop = result.is_err();
                    *slot = Some(result);
                    if stop {
                        break;
                    }
                }
            },
        }

        let mut out = Vec::new();
        out.try_reserve_exact(count).map_err(|_| Error::OutOfMemory)?;
        let mut skipped = false;
        for slot in slots {
            match slot {
                Some(Ok(value)) => out.push(value),
                Some(Err(e)) => return Err(e),
                None => skipped = true,
            }
        }
        if skipped {
            return Err(Error::InvalidData(SubCode::Unspecified, "decode task skipped without a failure"));
        }
        Ok(out)
    }
}

#[test]
fn results_keep_task_order() {
    for threads in [0, 1, 4] {
        let pool = DecodePool::with_threads(threads);
        let out = pool.run(20, |i| Ok(i * i)).unwrap();
        assert_eq!(out, (0..20).map(|i| i * i).collect::<Vec<_>>());
    }
}

#[test]
fn lowest_failing_task_is_reported() {
    for threads in [0, 3] {
        let pool = DecodePool::with_threads(threads);
        let err = pool
            .run(10, |i| match i {
                4 => Err(Error::InvalidData(SubCode::InvalidGridData, "four")),
                7 => Err(Error::InvalidData(SubCode::MissingGridImages, "seven")),
                _ => Ok(i),
            })
            .unwrap_err();
        // with workers, task 7 may finish first, but 4 is reported whenever it ran
        assert!(matches!(err.subcode(), SubCode::InvalidGridData | SubCode::MissingGridImages));
        if threads == 0 {
            assert_eq!(err.subcode(), SubCode::InvalidGridData);
        }
    }
}
