//! Incremental repair: a bounded amount of work per trigger, resumable across
//! triggers, never two steps at once.
//!
//! State lives in the options table so every trigger (and every process) sees
//! the same cursor:
//!
//! | option                          | meaning                                   |
//! |---------------------------------|-------------------------------------------|
//! | `acfml_fixer_process_locked`    | a step is in flight                       |
//! | `acfml_fixer_process_offset`    | owner ids `<= offset` have been processed |
//! | `acfml_fixer_process_done`      | the whole table has been processed        |
//! | `acfml_fixer_process_last_run`  | RFC 3339 time of the last completed step  |

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::pages::fetch_page;
use crate::repair::maybe_update_meta;
use crate::store::{
    MetaStore, OPTION_FALSE, OPTION_TRUE, OptionStore, option_flag, option_u64,
};

pub(crate) const DONE_OPTION: &str = "acfml_fixer_process_done";
pub(crate) const OFFSET_OPTION: &str = "acfml_fixer_process_offset";
pub(crate) const LOCK_OPTION: &str = "acfml_fixer_process_locked";
pub(crate) const LAST_RUN_OPTION: &str = "acfml_fixer_process_last_run";

pub(crate) const DEFAULT_CHUNK_NUMS: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct ProgressState {
    pub(crate) locked: bool,
    pub(crate) offset: u64,
    pub(crate) finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) last_run: Option<String>,
}

pub(crate) struct ProgressGate<'a, S: OptionStore + ?Sized> {
    options: &'a S,
}

impl<'a, S: OptionStore + ?Sized> ProgressGate<'a, S> {
    pub(crate) fn new(options: &'a S) -> Self {
        Self { options }
    }

    pub(crate) fn state(&self) -> Result<ProgressState> {
        Ok(ProgressState {
            locked: self.is_locked()?,
            offset: self.offset()?,
            finished: self.is_finished()?,
            last_run: self
                .options
                .get_option(LAST_RUN_OPTION)?
                .filter(|v| !v.is_empty()),
        })
    }

    pub(crate) fn is_finished(&self) -> Result<bool> {
        option_flag(self.options, DONE_OPTION)
    }

    fn finish(&self) -> Result<()> {
        self.options.set_option(DONE_OPTION, OPTION_TRUE)
    }

    pub(crate) fn offset(&self) -> Result<u64> {
        option_u64(self.options, OFFSET_OPTION)
    }

    fn update_offset(&self, offset: u64) -> Result<()> {
        self.options.set_option(OFFSET_OPTION, &offset.to_string())
    }

    fn touch_last_run(&self) -> Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.options.set_option(LAST_RUN_OPTION, &now)
    }

    pub(crate) fn is_locked(&self) -> Result<bool> {
        option_flag(self.options, LOCK_OPTION)
    }

    /// Clear a lock left behind by a step that died mid-flight.
    pub(crate) fn force_unlock(&self) -> Result<bool> {
        let was_locked = self.is_locked()?;
        self.options.set_option(LOCK_OPTION, OPTION_FALSE)?;
        Ok(was_locked)
    }

    /// Run `f` while holding the lock. Returns `Ok(None)` without calling `f`
    /// when another step holds it. The lock is released whether `f` succeeds,
    /// fails or panics.
    pub(crate) fn run_lockable<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<Option<T>> {
        if !self.options.try_set_flag(LOCK_OPTION)? {
            info!("repair step already in progress; skipping");
            return Ok(None);
        }
        let guard = LockGuard {
            options: self.options,
            armed: true,
        };
        let result = f();
        let released = guard.release();
        let value = result?;
        released?;
        Ok(Some(value))
    }
}

struct LockGuard<'a, S: OptionStore + ?Sized> {
    options: &'a S,
    armed: bool,
}

impl<S: OptionStore + ?Sized> LockGuard<'_, S> {
    fn release(mut self) -> Result<()> {
        self.armed = false;
        self.options.set_option(LOCK_OPTION, OPTION_FALSE)
    }
}

impl<S: OptionStore + ?Sized> Drop for LockGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.options.set_option(LOCK_OPTION, OPTION_FALSE) {
                warn!(error = %e, "failed to release repair lock");
            }
        }
    }
}

// ── Incremental step ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StepReport {
    pub(crate) offset: u64,
    pub(crate) total: u64,
    pub(crate) pages: u32,
    pub(crate) repaired: usize,
    pub(crate) finished: bool,
}

impl StepReport {
    pub(crate) fn notice(&self) -> String {
        format!(
            "ACFML Cleaner has processed {} / {} posts",
            self.offset, self.total
        )
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    AlreadyFinished,
    Busy,
    Ran(StepReport),
}

/// Process up to `chunk_nums` pages from the persisted offset. The offset is
/// persisted after each page, so a failure leaves it at the last page that
/// completed.
pub(crate) fn incremental_step<S: MetaStore + OptionStore + ?Sized>(
    store: &S,
    chunk_size: u64,
    chunk_nums: u32,
) -> Result<StepReport> {
    let gate = ProgressGate::new(store);
    let chunk_size = chunk_size.max(1);
    let mut offset = gate.offset()?;
    let total = store.count_owners()?;
    let mut pages = 0;
    let mut repaired = 0;

    while pages < chunk_nums && offset < total {
        for record in fetch_page(store, chunk_size, offset) {
            if maybe_update_meta(store, &record)? {
                repaired += 1;
            }
        }
        offset = offset.saturating_add(chunk_size);
        gate.update_offset(offset)?;
        pages += 1;
    }
    gate.touch_last_run()?;

    let finished = offset >= total;
    if finished {
        gate.finish()?;
    }
    info!(offset, total, pages, repaired, finished, "incremental repair step done");
    Ok(StepReport {
        offset,
        total,
        pages,
        repaired,
        finished,
    })
}

/// One trigger: skip once finished, otherwise run a step under the lock.
pub(crate) fn trigger_step<S: MetaStore + OptionStore + ?Sized>(
    store: &S,
    chunk_size: u64,
    chunk_nums: u32,
) -> Result<StepOutcome> {
    let gate = ProgressGate::new(store);
    if gate.is_finished()? {
        return Ok(StepOutcome::AlreadyFinished);
    }
    let outcome = gate.run_lockable(|| incremental_step(store, chunk_size, chunk_nums))?;
    Ok(outcome.map_or(StepOutcome::Busy, StepOutcome::Ran))
}
