// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::{Condvar, Mutex};

use link_cache::{Job, PostFn};

/// A small worker pool standing in for the application scheduler.
///
/// Accepted jobs are guaranteed to run: on drop, the pool stops accepting
/// and drains the queue before joining its workers. This matters for the
/// manager, whose shutdown spins until every dispatched task has finished.
pub struct Pool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
}

impl Pool {
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..workers)
            .map(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || Self::work(shared))
            })
            .collect();

        Self { shared, workers }
    }

    fn work(shared: Arc<Shared>) {
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(job) = queue.pop_front() {
                        break Some(job);
                    }
                    if shared.shutdown.load(Ordering::Acquire) {
                        break None;
                    }
                    shared.available.wait(&mut queue);
                }
            };
            match job {
                Some(job) => job(),
                None => return,
            }
        }
    }

    pub fn post(&self, job: Job) -> bool {
        self.shared.queue.lock().push_back(job);
        self.shared.available.notify_one();
        true
    }

    /// The hook to hand to `Manager::new`.
    pub fn post_fn(&self) -> PostFn {
        let shared = Arc::clone(&self.shared);
        Box::new(move |job| {
            shared.queue.lock().push_back(job);
            shared.available.notify_one();
            true
        })
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
