//! Bulk passes and the small operator commands built on the same pieces.

use std::io::Write;

use serde::Serialize;
use tracing::{debug, info};

use crate::detect::is_affected;
use crate::error::Result;
use crate::gate::{ProgressGate, ProgressState};
use crate::pages::{INTERNAL_KEY_PREFIX, Pages};
use crate::progress_bar::ProgressBar;
use crate::repair::{maybe_update_meta, planned_repair};
use crate::report::Reporter;
use crate::serialized::maybe_serialize;
use crate::store::{MetaStore, MetadataRecord, OptionStore};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct PassSummary {
    pub(crate) pages: u64,
    pub(crate) records: usize,
    pub(crate) affected: usize,
}

/// Walk every page from offset 0, feeding each record to `callback` and
/// ticking the progress bar once per page. `callback` returns whether the
/// record was affected.
pub(crate) fn command_template<S, W, F>(
    store: &S,
    chunk_size: u64,
    label: &str,
    progress: W,
    mut callback: F,
) -> Result<PassSummary>
where
    S: MetaStore + ?Sized,
    W: Write,
    F: FnMut(&MetadataRecord) -> Result<bool>,
{
    let chunk_size = chunk_size.max(1);
    let expected_pages = store.count_owners()?.div_ceil(chunk_size);
    let mut bar = ProgressBar::new(label, expected_pages, progress);
    let mut summary = PassSummary::default();

    let mut pages = Pages::new(store, chunk_size);
    for page in pages.by_ref() {
        for record in &page.records {
            if callback(record)? {
                summary.affected += 1;
            }
        }
        let (low, high) = page.range();
        debug!(low, high, records = page.records.len(), "page done");
        summary.pages += 1;
        summary.records += page.records.len();
        bar.tick();
    }
    bar.finish();
    info!(
        pages = summary.pages,
        records = summary.records,
        affected = summary.affected,
        stopped_at = pages.offset(),
        "{label}: pass complete"
    );
    Ok(summary)
}

/// `acfml clear`: repair every affected record.
pub(crate) fn run_clear<S: MetaStore + ?Sized, W: Write>(
    store: &S,
    chunk_size: u64,
    progress: W,
) -> Result<PassSummary> {
    command_template(store, chunk_size, "Clearing post meta", progress, |record| {
        maybe_update_meta(store, record)
    })
}

/// `acfml list`: report affected records without touching them.
pub(crate) fn run_list<S: MetaStore + ?Sized, W: Write>(
    store: &S,
    chunk_size: u64,
    reporter: &Reporter,
    progress: W,
) -> Result<PassSummary> {
    command_template(store, chunk_size, "Listing affected post meta", progress, |record| {
        reporter.record(record)
    })
}

/// Pretty JSON for the `--json` flags.
pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

// ── Status ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct StatusReport {
    #[serde(flatten)]
    pub(crate) state: ProgressState,
    pub(crate) total: u64,
}

pub(crate) fn status<S: MetaStore + OptionStore + ?Sized>(store: &S) -> Result<StatusReport> {
    Ok(StatusReport {
        state: ProgressGate::new(store).state()?,
        total: store.count_owners()?,
    })
}

impl StatusReport {
    pub(crate) fn render(&self) -> String {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        format!(
            "offset:   {} / {}\nfinished: {}\nlocked:   {}\nlast run: {}",
            self.state.offset,
            self.total,
            yes_no(self.state.finished),
            yes_no(self.state.locked),
            self.state.last_run.as_deref().unwrap_or("never"),
        )
    }
}

// ── Inspect ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Inspection {
    pub(crate) meta_id: u64,
    pub(crate) owner_id: u64,
    pub(crate) key: String,
    pub(crate) internal: bool,
    pub(crate) decodable: bool,
    pub(crate) affected: bool,
    pub(crate) stored_bytes: usize,
    pub(crate) repaired_bytes: Option<usize>,
    pub(crate) fixed: bool,
}

/// Examine one record by id, optionally repairing it. Internal keys are
/// reported but never repaired.
pub(crate) fn inspect<S: MetaStore + ?Sized>(
    store: &S,
    meta_id: u64,
    fix: bool,
) -> Result<Option<Inspection>> {
    let Some(record) = store.get_by_id(meta_id)? else {
        return Ok(None);
    };
    let decoded = record.decode();
    let affected = decoded
        .as_ref()
        .is_ok_and(|value| is_affected(&record.key, value));
    let internal = record.key.starts_with(INTERNAL_KEY_PREFIX);
    let repaired_bytes = planned_repair(&record).map(|v| maybe_serialize(&v).len());
    let fixed = fix && !internal && maybe_update_meta(store, &record)?;
    Ok(Some(Inspection {
        meta_id: record.id,
        owner_id: record.owner_id,
        key: record.key.clone(),
        internal,
        decodable: decoded.is_ok(),
        affected,
        stored_bytes: record.value.len(),
        repaired_bytes,
        fixed,
    }))
}

impl Inspection {
    pub(crate) fn render(&self) -> String {
        let mut out = format!(
            "meta {} (post {}, key {:?}): {} bytes",
            self.meta_id, self.owner_id, self.key, self.stored_bytes
        );
        if !self.decodable {
            out.push_str(", not decodable; left alone");
        } else if !self.affected {
            out.push_str(", not affected");
        } else {
            out.push_str(", affected");
            if let Some(bytes) = self.repaired_bytes {
                out.push_str(&format!(", {bytes} bytes after repair"));
            }
        }
        if self.internal {
            out.push_str(" (internal key, never repaired)");
        }
        if self.fixed {
            out.push_str("; repaired");
        }
        out
    }
}
