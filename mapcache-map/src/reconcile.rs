//! Background reconciliation of failed writes.
//!
//! A failed update or delete leaves a cache entry whose desired action is
//! still outstanding. [`Shared::schedule_sync`] installs a periodic task on
//! the map's scheduler; each run is one pass of
//! [`Shared::resolve_errors`], which replays the outstanding operations
//! against the store until the cache and the table agree again.

use crate::cache::CacheKind;
use crate::map::{Map, Shared, State};
use crate::metrics::{OP_DELETE, OP_UPDATE};
use crate::scheduler::{Job, TaskSpec};
use mapcache_core::{DesiredAction, MapError, MapKey, MapRecord, MapResult, MapValue, MirrorMode};
use mapcache_events::Action;
use std::sync::Arc;
use std::time::Instant;

impl<K: MapKey, V: MapValue> Shared<K, V> {
    /// Flag outstanding work and make sure a sync task will pick it up.
    ///
    /// Scheduling is debounced: within `min_interval` of the previous
    /// scheduling only the flag is set, since the installed task is still
    /// due to run.
    pub(crate) fn schedule_sync(&self, state: &mut State<K, V>) {
        state.outstanding_errors = true;

        let Some(scheduler) = &self.scheduler else {
            return;
        };
        if state
            .last_scheduled
            .is_some_and(|last| last.elapsed() < self.reconcile.min_interval)
        {
            return;
        }
        state.last_scheduled = Some(Instant::now());

        let name = self.task_name();
        tracing::debug!(parent: &self.span, task = %name, "Scheduling map sync");
        scheduler.install(
            &name,
            TaskSpec {
                start_delay: self.reconcile.start_delay,
                run_interval: self.reconcile.min_interval,
                job: self.sync_job(),
            },
        );
    }

    fn sync_job(&self) -> Job {
        let this = self.this.clone();
        Arc::new(move || match this.upgrade() {
            Some(shared) => shared.resolve_errors(),
            // The map is gone; its Drop removes the task.
            None => Ok(()),
        })
    }

    /// One reconciliation pass.
    ///
    /// Replays every outstanding cache entry against the store. The pass
    /// stops scanning once more than `max_sync_errors` replays failed.
    /// Returns [`MapError::SyncOutstanding`] when entries remain, which
    /// keeps the task retrying.
    pub(crate) fn resolve_errors(&self) -> MapResult<()> {
        let started = Instant::now();
        let mut state = self.write()?;

        if !self.kind.has_values() || !state.outstanding_errors {
            return Ok(());
        }

        let mut outstanding = state
            .cache
            .values()
            .filter(|e| e.desired_action.is_outstanding())
            .count();
        if outstanding == 0 {
            state.outstanding_errors = false;
            return Ok(());
        }

        let store = self.open_locked(&mut state)?;
        let info = store.info();
        let errors_only = self.kind == CacheKind::Values(MirrorMode::ErrorsOnly);

        tracing::debug!(parent: &self.span, remaining = outstanding, "Starting map sync");

        let keys: Vec<String> = state.cache.keys().cloned().collect();
        let (mut resolved, mut scanned, mut errors) = (0usize, 0usize, 0usize);

        for cache_key in keys {
            let Some(entry) = state.cache.get_mut(&cache_key) else {
                continue;
            };
            scanned += 1;

            let remove = match entry.desired_action {
                DesiredAction::Ok => false,

                DesiredAction::Insert => {
                    // Insert entries are only ever created with a value.
                    let Some(value) = entry.value.as_ref() else {
                        continue;
                    };
                    let result = store.upsert(&entry.key.to_bytes(), &self.encode_value(&info, value));
                    self.record_op(OP_UPDATE, result.is_ok());
                    match result {
                        Ok(()) => {
                            entry.desired_action = DesiredAction::Ok;
                            entry.last_error = None;
                            resolved += 1;
                            outstanding -= 1;
                        }
                        Err(source) => {
                            entry.last_error = Some(MapError::Update {
                                map: self.spec.name.clone(),
                                source,
                            });
                            errors += 1;
                        }
                    }
                    self.add_event(
                        Action::Update,
                        &entry.key,
                        entry.value.as_ref(),
                        entry.desired_action,
                        entry.last_error.as_ref(),
                    );
                    errors_only && entry.desired_action == DesiredAction::Ok
                }

                DesiredAction::Delete => {
                    let result = store.delete(&entry.key.to_bytes());
                    let done = match result {
                        Ok(()) => true,
                        Err(e) if e.is_not_found() => true,
                        Err(source) => {
                            entry.last_error = Some(MapError::Delete {
                                map: self.spec.name.clone(),
                                key: entry.key.to_string(),
                                source,
                            });
                            errors += 1;
                            false
                        }
                    };
                    self.record_op(OP_DELETE, done);
                    if done {
                        entry.last_error = None;
                        resolved += 1;
                        outstanding -= 1;
                    }
                    self.add_event(
                        Action::Delete,
                        &entry.key,
                        None,
                        entry.desired_action,
                        entry.last_error.as_ref(),
                    );
                    done
                }
            };

            if remove {
                state.cache.remove(&cache_key);
            }
            if errors > self.reconcile.max_sync_errors {
                break;
            }
        }

        self.update_pressure(&state);
        state.outstanding_errors = outstanding > 0;

        tracing::debug!(
            parent: &self.span,
            remaining = outstanding,
            resolved,
            scanned,
            duration_ms = started.elapsed().as_millis() as u64,
            "Map sync completed"
        );

        if outstanding > 0 {
            Err(MapError::SyncOutstanding { count: outstanding })
        } else {
            Ok(())
        }
    }
}

impl<K: MapKey, V: MapValue> Map<K, V> {
    /// Run one reconciliation pass on the calling thread.
    ///
    /// This is what the scheduled sync task runs. Handles built without a
    /// scheduler rely on callers invoking it.
    pub fn resolve_errors(&self) -> MapResult<()> {
        self.shared.resolve_errors()
    }
}
