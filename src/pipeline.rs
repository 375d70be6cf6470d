use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::alignment::{AlignmentFetch, AlignmentFetcher, AlignmentSource};
use crate::config::PipelineConfig;
use crate::coordinator::{CancelToken, Coordinator};
use crate::domain::{AnnotationRecord, FailureReason, FetchOutcome, IdentityKey, RegionClass};
use crate::error::KiraError;
use crate::harvest::{HarvestItem, Harvester};
use crate::page::SessionProvider;
use crate::sequence::{ProteinSequenceSource, SequenceFetcher, StructureSequenceSource};
use crate::store::{
    AlignmentStore, AnnotationTable, AppendResult, ErrorLog, FastaWriter, RegionArtifacts,
    read_records,
};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionState {
    Pending,
    Harvesting,
    Alignments,
    Sequences,
    Done,
    Errored,
}

impl RegionState {
    pub fn as_str(self) -> &'static str {
        match self {
            RegionState::Pending => "pending",
            RegionState::Harvesting => "harvesting",
            RegionState::Alignments => "alignments",
            RegionState::Sequences => "sequences",
            RegionState::Done => "done",
            RegionState::Errored => "errored",
        }
    }
}

/// Counters for one fetch stage of one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionSummary {
    pub region: String,
    pub state: RegionState,
    pub failed_in: Option<RegionState>,
    pub error: Option<String>,
    pub records: usize,
    pub annotations_appended: usize,
    pub pages_read: usize,
    pub pages_failed: usize,
    /// Set when cancellation stopped the region before its stages finished.
    /// `state` then names the stage that was interrupted.
    pub interrupted: bool,
    pub alignments: Option<StageSummary>,
    pub sequences: Option<StageSummary>,
    pub artifacts: RegionArtifacts,
}

impl RegionSummary {
    fn new(region: &RegionClass, artifacts: RegionArtifacts) -> Self {
        Self {
            region: region.to_string(),
            state: RegionState::Pending,
            failed_in: None,
            error: None,
            records: 0,
            annotations_appended: 0,
            pages_read: 0,
            pages_failed: 0,
            interrupted: false,
            alignments: None,
            sequences: None,
            artifacts,
        }
    }

    pub fn is_errored(&self) -> bool {
        self.state == RegionState::Errored
    }

    /// A region that neither finished nor errored: interrupted mid-stage, or
    /// never started because the run was cancelled first.
    pub fn is_unfinished(&self) -> bool {
        !matches!(self.state, RegionState::Done | RegionState::Errored)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub regions: Vec<RegionSummary>,
}

impl RunSummary {
    pub fn errored(&self) -> usize {
        self.regions.iter().filter(|region| region.is_errored()).count()
    }

    pub fn unfinished(&self) -> usize {
        self.regions
            .iter()
            .filter(|region| region.is_unfinished())
            .count()
    }

    pub fn all_done(&self) -> bool {
        self.regions
            .iter()
            .all(|region| region.state == RegionState::Done)
    }
}

/// Drives harvest, alignment and sequence stages for each configured region.
pub struct Pipeline<P, A, S, U> {
    provider: P,
    alignments: Arc<A>,
    sequences: Arc<SequenceFetcher<S, U>>,
    cancel: CancelToken,
}

impl<P, A, S, U> Pipeline<P, A, S, U>
where
    P: SessionProvider,
    A: AlignmentSource + 'static,
    S: StructureSequenceSource + 'static,
    U: ProteinSequenceSource + 'static,
{
    pub fn new(provider: P, alignments: A, structure: S, protein: U) -> Self {
        Self {
            provider,
            alignments: Arc::new(alignments),
            sequences: Arc::new(SequenceFetcher::new(structure, protein)),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Regions run one after another; an errored region does not stop the
    /// ones after it.
    pub fn run(&self, config: &PipelineConfig, sink: &dyn ProgressSink) -> RunSummary {
        let mut summary = RunSummary::default();
        for region in &config.regions {
            let artifacts = config.paths.resolve(region);
            if self.cancel.is_cancelled() {
                info!(region = %region, "run cancelled; region left pending");
                summary.regions.push(RegionSummary::new(region, artifacts));
                continue;
            }
            summary.regions.push(self.run_region(region, artifacts, config, sink));
        }
        summary
    }

    fn run_region(
        &self,
        region: &RegionClass,
        artifacts: RegionArtifacts,
        config: &PipelineConfig,
        sink: &dyn ProgressSink,
    ) -> RegionSummary {
        let start = Instant::now();
        let mut summary = RegionSummary::new(region, artifacts.clone());
        match self.drive_region(region, &artifacts, config, &mut summary, sink) {
            Ok(()) if summary.interrupted => {
                warn!(
                    region = %region,
                    stage = summary.state.as_str(),
                    "region interrupted by cancellation"
                );
            }
            Ok(()) => {
                summary.state = RegionState::Done;
                info!(region = %region, records = summary.records, "region done");
            }
            Err(err) => {
                error!(
                    region = %region,
                    stage = summary.state.as_str(),
                    error = %err,
                    "region failed"
                );
                summary.failed_in = Some(summary.state);
                summary.state = RegionState::Errored;
                summary.error = Some(err.to_string());
            }
        }
        sink.event(ProgressEvent {
            message: format!("phase=Done; region {region} {}", summary.state.as_str()),
            elapsed: Some(start.elapsed()),
        });
        summary
    }

    fn drive_region(
        &self,
        region: &RegionClass,
        artifacts: &RegionArtifacts,
        config: &PipelineConfig,
        summary: &mut RegionSummary,
        sink: &dyn ProgressSink,
    ) -> Result<(), KiraError> {
        summary.state = RegionState::Harvesting;
        let records = if config.alignments_only {
            sink.event(ProgressEvent {
                message: format!("phase=Load; reading {}", artifacts.annotations),
                elapsed: None,
            });
            first_occurrences(read_records(&artifacts.annotations)?)
        } else {
            sink.event(ProgressEvent {
                message: format!("phase=Harvest; region {region}"),
                elapsed: None,
            });
            self.harvest_region(region, artifacts, config, summary)?
        };
        summary.records = records.len();
        if summary.interrupted {
            return Ok(());
        }

        if config.alignments_only || config.save_alignments {
            summary.state = RegionState::Alignments;
            sink.event(ProgressEvent {
                message: format!("phase=Alignments; {} records", records.len()),
                elapsed: None,
            });
            let stage = self.fetch_alignments(region, &records, artifacts, config)?;
            summary.alignments = Some(stage);
            if stage.cancelled > 0 {
                summary.interrupted = true;
                return Ok(());
            }
        }

        if config.save_sequences && !config.alignments_only {
            summary.state = RegionState::Sequences;
            sink.event(ProgressEvent {
                message: format!("phase=Sequences; {} records", records.len()),
                elapsed: None,
            });
            let stage = self.fetch_sequences(region, &records, artifacts, config)?;
            summary.sequences = Some(stage);
            summary.interrupted = stage.cancelled > 0;
        }
        Ok(())
    }

    fn harvest_region(
        &self,
        region: &RegionClass,
        artifacts: &RegionArtifacts,
        config: &PipelineConfig,
        summary: &mut RegionSummary,
    ) -> Result<Vec<AnnotationRecord>, KiraError> {
        let harvester =
            Harvester::new(&self.provider, config.page_retry).with_max_pages(config.max_pages);
        let mut harvest = harvester.harvest(region)?;
        let mut table = AnnotationTable::open(&artifacts.annotations)?;
        let mut log = FailureLog::new(&artifacts.harvest_log, format!("harvest region={region}"));

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for item in harvest.by_ref() {
            match item {
                HarvestItem::Record(record) => {
                    if table.append(&record)? == AppendResult::Appended {
                        summary.annotations_appended += 1;
                    }
                    if seen.insert(record.key()) {
                        records.push(record);
                    }
                }
                HarvestItem::PageFailed {
                    page,
                    attempts,
                    reason,
                } => {
                    log.record_raw(
                        &format!("page:{page}"),
                        "page_error",
                        &format!("gave up after {attempts} attempts: {reason}"),
                    )?;
                }
            }
            if self.cancel.is_cancelled() {
                warn!(region = %region, "harvest interrupted by cancellation");
                summary.interrupted = true;
                break;
            }
        }
        summary.pages_read = harvest.pages_read();
        summary.pages_failed = harvest.pages_failed();
        info!(
            region = %region,
            records = records.len(),
            appended = summary.annotations_appended,
            pages = summary.pages_read,
            "harvest finished"
        );
        Ok(records)
    }

    fn fetch_alignments(
        &self,
        region: &RegionClass,
        records: &[AnnotationRecord],
        artifacts: &RegionArtifacts,
        config: &PipelineConfig,
    ) -> Result<StageSummary, KiraError> {
        let store = AlignmentStore::new(artifacts.alignments_dir.clone());
        store.ensure_dir()?;
        let fetcher = Arc::new(AlignmentFetcher::new(
            Arc::clone(&self.alignments),
            store.clone(),
        ));
        let mut log = FailureLog::new(
            &artifacts.alignment_log,
            format!("alignments region={region}"),
        );
        let mut stage = StageSummary::default();

        let report = self.coordinator(config).run(
            records,
            move |record| fetcher.fetch(record),
            |_, _, outcome| {
                match outcome {
                    FetchOutcome::Success(AlignmentFetch::AlreadyPresent(_)) => stage.skipped += 1,
                    FetchOutcome::Success(AlignmentFetch::Downloaded(payload)) => {
                        let path = store.write(&payload)?;
                        debug!(key = %payload.key, path = %path, "alignment stored");
                        stage.written += 1;
                    }
                    FetchOutcome::Failure {
                        key,
                        reason,
                        detail,
                    } => {
                        log.record(&key, reason, &detail)?;
                        stage.failed += 1;
                    }
                }
                Ok(())
            },
        )?;
        stage.cancelled = report.cancelled;
        Ok(stage)
    }

    fn fetch_sequences(
        &self,
        region: &RegionClass,
        records: &[AnnotationRecord],
        artifacts: &RegionArtifacts,
        config: &PipelineConfig,
    ) -> Result<StageSummary, KiraError> {
        let mut fasta = FastaWriter::open(&artifacts.sequences)?;
        let pending: Vec<AnnotationRecord> = records
            .iter()
            .filter(|record| !fasta.contains(&record.key()))
            .cloned()
            .collect();
        let mut stage = StageSummary {
            skipped: records.len() - pending.len(),
            ..StageSummary::default()
        };
        if stage.skipped > 0 {
            info!(region = %region, skipped = stage.skipped, "sequences already on disk");
        }

        let fetcher = Arc::clone(&self.sequences);
        let mut log = FailureLog::new(
            &artifacts.sequence_log,
            format!("sequences region={region}"),
        );
        let report = self.coordinator(config).run(
            &pending,
            move |record| fetcher.fetch(record),
            |_, _, outcome| {
                match outcome {
                    FetchOutcome::Success(sequence) => match fasta.append(&sequence)? {
                        AppendResult::Appended => stage.written += 1,
                        AppendResult::AlreadyPresent => stage.skipped += 1,
                    },
                    FetchOutcome::Failure {
                        key,
                        reason,
                        detail,
                    } => {
                        log.record(&key, reason, &detail)?;
                        stage.failed += 1;
                    }
                }
                Ok(())
            },
        )?;
        stage.cancelled = report.cancelled;
        Ok(stage)
    }

    fn coordinator(&self, config: &PipelineConfig) -> Coordinator {
        Coordinator::new(config.workers)
            .with_item_timeout(config.item_timeout)
            .with_item_retry(config.item_retry)
            .with_cancel_token(self.cancel.clone())
    }
}

/// Keeps the first record seen for each identity key, in order.
fn first_occurrences(records: Vec<AnnotationRecord>) -> Vec<AnnotationRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.key()))
        .collect()
}

/// Error log opened on first use, so clean runs leave no log file behind.
struct FailureLog<'a> {
    path: &'a Utf8Path,
    banner: String,
    log: Option<ErrorLog>,
}

impl<'a> FailureLog<'a> {
    fn new(path: &'a Utf8Path, banner: String) -> Self {
        Self {
            path,
            banner,
            log: None,
        }
    }

    fn handle(&mut self) -> Result<&mut ErrorLog, KiraError> {
        let log = match self.log.take() {
            Some(log) => log,
            None => ErrorLog::open(self.path, &self.banner)?,
        };
        Ok(self.log.insert(log))
    }

    fn record(
        &mut self,
        key: &IdentityKey,
        reason: FailureReason,
        detail: &str,
    ) -> Result<(), KiraError> {
        warn!(key = %key, reason = reason.as_str(), detail, "fetch failed");
        self.handle()?.record(key, reason, detail)
    }

    fn record_raw(&mut self, key: &str, reason: &str, detail: &str) -> Result<(), KiraError> {
        self.handle()?.record_raw(key, reason, detail)
    }
}
