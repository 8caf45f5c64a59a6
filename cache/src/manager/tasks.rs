// Copyright © 2021 The Radicle Link Contributors
//
// This file is part of radicle-link, distributed under the GPLv3 with Radicle
// Linking Exception. For full terms see the included LICENSE file.

use std::sync::Arc;

use tracing::debug;

use super::{Job, Manager, State};
use crate::{cache::Managed, table::Table};

/// Which global process a task belongs to, if any. The manager's global
/// `rebalancing`/`resizing` flags are cleared when the last task of that
/// environment finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskEnvironment {
    None,
    Rebalancing,
    Resizing,
}

/// Frees a cache's memory until its usage fits the lowered soft limit, then
/// finalizes the limits.
///
/// The cache's `resizing` metadata flag is set by the manager before
/// dispatch and is guaranteed to be cleared by this task, whether it ran to
/// completion or not.
pub(crate) struct FreeMemoryTask {
    environment: TaskEnvironment,
    manager: Arc<Manager>,
    cache: Arc<dyn Managed>,
}

impl FreeMemoryTask {
    pub fn new(environment: TaskEnvironment, manager: Arc<Manager>, cache: Arc<dyn Managed>) -> Self {
        Self {
            environment,
            manager,
            cache,
        }
    }

    /// Post the task to the scheduler. The caller holds the manager lock.
    /// On rejection all task counters are reverted.
    pub fn dispatch(self, manager: &Manager, state: &mut State) -> bool {
        let environment = self.environment;
        manager.prepare_task(environment);

        let job: Job = Box::new(move || self.run());
        if manager.post(job) {
            true
        } else {
            manager.unprepare_task_locked(environment, state);
            false
        }
    }

    fn run(self) {
        let Self {
            environment,
            manager,
            cache,
        } = self;

        debug_assert!(cache.core().is_resizing_flag_set());

        let ran = cache.free_memory();
        debug!(id = cache.id(), ran, "free memory task finished");

        if ran {
            // under the limit: finalize hard = soft and give the budget back
            let mut state = manager.state.write();
            let reclaimed = {
                let mut meta = cache.core().metadata.write();
                debug_assert!(meta.is_resizing());
                let reclaimed = meta.hard_usage_limit - meta.soft_usage_limit;
                let soft = meta.soft_usage_limit;
                meta.adjust_limits(soft, soft);
                meta.toggle_resizing();
                reclaimed
            };
            state.sub_allocation(reclaimed);
        } else {
            // could not get under the limit (shutdown, pinned values):
            // still guarantee the flag is cleared
            let mut meta = cache.core().metadata.write();
            debug_assert!(meta.is_resizing());
            meta.toggle_resizing();
        }

        manager.unprepare_task(environment);
    }
}

/// Moves a cache's contents into a freshly leased table.
///
/// The cache's `migrating` metadata flag is set by the manager before
/// dispatch; `migrate` clears it. If migration could not run, the leased
/// table goes back to the manager pool.
pub(crate) struct MigrateTask {
    environment: TaskEnvironment,
    manager: Arc<Manager>,
    cache: Arc<dyn Managed>,
    table: Arc<Table>,
}

impl MigrateTask {
    pub fn new(
        environment: TaskEnvironment,
        manager: Arc<Manager>,
        cache: Arc<dyn Managed>,
        table: Arc<Table>,
    ) -> Self {
        Self {
            environment,
            manager,
            cache,
            table,
        }
    }

    /// Post the task to the scheduler. The caller holds the manager lock.
    /// On rejection all task counters are reverted.
    pub fn dispatch(self, manager: &Manager, state: &mut State) -> bool {
        let environment = self.environment;
        manager.prepare_task(environment);

        let job: Job = Box::new(move || self.run());
        if manager.post(job) {
            true
        } else {
            manager.unprepare_task_locked(environment, state);
            false
        }
    }

    fn run(self) {
        let Self {
            environment,
            manager,
            cache,
            table,
        } = self;

        debug_assert!(cache.core().is_migrating_flag_set());

        let ran = cache.migrate(Arc::clone(&table));
        debug!(id = cache.id(), ran, new_log_size = table.log_size(), "migrate task finished");

        if !ran {
            manager.reclaim_table(table);
        }

        manager.unprepare_task(environment);
    }
}
