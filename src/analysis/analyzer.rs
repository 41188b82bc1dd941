//! Light and deep analysis passes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::colour::ColourScheme;
use super::diffs::DiffListBuilder;
use super::geojson::geojson_diff;
use super::history::ElementCache;
use super::labels::{build_labels, passes_prefilter, LabelContext, LabelRule};
use super::summary::SummaryBuilder;
use super::{AnalysisError, Budget, Result};
use crate::config::TrackerConfig;
use crate::model::{
    Action, ChangesetInfo, ChangesetMeta, ChangesetRecord, DiffList, Misc, Modification,
    ProcessedTag, TagDiff,
};
use crate::osmapi::ChangesetApi;

/// Changesets observed more recently than this are shown as new.
const NEW_CSET_SECS: i64 = 240;

/// Processed tag diff entries kept per action.
const MAX_PROCESSED_TAGS: usize = 20;

/// Reason recorded when the processing budget ran out.
pub const TRUNCATED_TIMEOUT: &str = "Timeout";

/// Result of the deep pass.
#[derive(Debug, Clone)]
pub struct DeepAnalysis {
    pub info: ChangesetInfo,
    /// The processing budget ran out; `info` holds what was computed.
    pub truncated: bool,
}

/// Runs analysis passes against the changeset API.
pub struct Analyzer {
    api: Arc<dyn ChangesetApi>,
    pre_labels: Vec<LabelRule>,
    post_labels: Vec<LabelRule>,
    prefilter: Vec<Vec<String>>,
    refresh_meta: chrono::Duration,
    max_processing: Option<Duration>,
    colours: ColourScheme,
}

impl Analyzer {
    /// Compile the configured label rules. Fails on a bad regex or an
    /// unreadable area file.
    pub fn new(api: Arc<dyn ChangesetApi>, config: &TrackerConfig) -> Result<Self> {
        let pre_labels = LabelRule::from_configs(&config.pre_labels)?;
        let post_labels = LabelRule::from_configs(&config.post_labels)?;
        info!(
            pre_labels = pre_labels.len(),
            post_labels = post_labels.len(),
            prefilter_groups = config.prefilter_labels.len(),
            "Analyzer configured"
        );
        Ok(Self {
            api,
            pre_labels,
            post_labels,
            prefilter: config.prefilter_labels.clone(),
            refresh_meta: chrono::Duration::minutes(config.refresh_meta_minutes),
            max_processing: config.cset_processing_time_max_s.map(Duration::from_secs),
            colours: ColourScheme::new(0),
        })
    }

    pub fn api(&self) -> &Arc<dyn ChangesetApi> {
        &self.api
    }

    pub async fn fetch_meta(&self, cid: i64) -> Result<ChangesetMeta> {
        Ok(self.api.changeset(cid).await?)
    }

    /// Labels from the pre-filter rules, evaluated on metadata only.
    pub fn pre_labels(&self, cid: i64, meta: &ChangesetMeta) -> Vec<String> {
        build_labels(&self.pre_labels, &LabelContext::new(cid, meta, None))
    }

    /// Labels from the post-analysis rules.
    pub fn post_labels(
        &self,
        cid: i64,
        meta: &ChangesetMeta,
        changes: Option<&[Modification]>,
    ) -> Vec<String> {
        build_labels(&self.post_labels, &LabelContext::new(cid, meta, changes))
    }

    pub fn passes_prefilter(&self, labels: &[String]) -> bool {
        passes_prefilter(labels, &self.prefilter)
    }

    /// Whether the stored metadata should be fetched again.
    pub fn meta_refresh_due(&self, record: &ChangesetRecord, now: DateTime<Utc>) -> bool {
        if record.meta.is_none() {
            return true;
        }
        let has_timestamp = record
            .info
            .as_ref()
            .is_some_and(|info| info.misc.timestamp_type.is_some());
        if !has_timestamp {
            return true;
        }
        self.refresh_meta > chrono::Duration::zero() && now - record.refreshed > self.refresh_meta
    }

    /// Derived display fields from metadata alone.
    ///
    /// Starts from the record's current `misc`; timestamps are recomputed
    /// when `meta_refreshed` or not yet set.
    pub fn local1(
        &self,
        record: &ChangesetRecord,
        meta: &ChangesetMeta,
        meta_refreshed: bool,
        now: DateTime<Utc>,
    ) -> Misc {
        let mut misc = record
            .info
            .as_ref()
            .map(|info| info.misc.clone())
            .unwrap_or_default();

        if misc.user_colour.is_none() {
            let user = meta.user.as_deref().unwrap_or_default();
            misc.user_colour = Some(self.colours.colour(user).to_string());
        }

        if meta_refreshed || misc.timestamp_type.is_none() {
            let (ts_type, ts) = meta.timestamp(false);
            misc.timestamp_type = Some(ts_type);
            misc.timestamp_type_txt = Some(ts_type.label().to_string());
            misc.timestamp = Some(ts);
        }

        let is_new = record
            .source
            .as_ref()
            .is_some_and(|source| (now - source.observed).num_seconds() < NEW_CSET_SECS);
        misc.state = Some(if is_new { "new" } else { "old" }.to_string());
        misc
    }

    /// `local1` plus tag diff entries prepared for display.
    pub fn local2(
        &self,
        record: &ChangesetRecord,
        meta: &ChangesetMeta,
        info: &mut ChangesetInfo,
        meta_refreshed: bool,
        now: DateTime<Utc>,
    ) {
        let truncated = info.misc.truncated.take();
        let mut misc = self.local1(record, meta, meta_refreshed, now);
        misc.truncated = truncated;
        if let Some(tagdiff) = &info.tagdiff {
            process_tagdiff(&mut misc, tagdiff);
        }
        info.misc = misc;
    }

    /// Full analysis of a closed changeset.
    ///
    /// A `Timeout` stops the passes early; whatever was counted so far is
    /// returned with `misc.truncated` set and without diffs or GeoJSON.
    pub async fn deep(&self, cid: i64) -> Result<DeepAnalysis> {
        let budget = Budget::new(self.max_processing);
        let changes = self.api.changeset_download(cid).await?;
        debug!(cid, modifications = changes.len(), "Downloaded changeset content");

        let mut cache = ElementCache::new(self.api.clone());
        for modification in &changes {
            cache.insert(modification.element_type, modification.data.clone());
        }

        let mut summary = SummaryBuilder::new();
        let mut diffs: Option<DiffList> = None;
        let truncated = match run_passes(&mut cache, &changes, &budget, &mut summary).await {
            Ok(list) => {
                diffs = Some(list);
                false
            }
            Err(AnalysisError::Timeout(max)) => {
                warn!(cid, budget = ?max, "Changeset not fully processed");
                true
            }
            Err(e) => return Err(e),
        };

        let mut info = ChangesetInfo::default();
        summary.write_into(&mut info);

        if !truncated {
            match geojson_diff(&mut cache, &changes, diffs.as_ref()).await {
                Ok(geojson) => info.geojson = Some(geojson),
                Err(e) => warn!(cid, error = %e, "Failed to build GeoJSON"),
            }
        } else {
            info.misc.truncated = Some(TRUNCATED_TIMEOUT.to_string());
        }

        info.diffs = diffs;
        info.geometry = Some(cache.snapshot());
        info.changes = Some(changes);
        debug!(cid, cached_versions = cache.len(), truncated, "Deep analysis finished");
        Ok(DeepAnalysis { info, truncated })
    }
}

async fn run_passes(
    cache: &mut ElementCache,
    changes: &[Modification],
    budget: &Budget,
    summary: &mut SummaryBuilder,
) -> Result<DiffList> {
    for modification in changes {
        budget.check()?;
        summary.add(cache, modification).await?;
    }
    let mut diffs = DiffListBuilder::new();
    for modification in changes {
        budget.check()?;
        diffs.add(cache, modification).await?;
    }
    Ok(diffs.finish())
}

/// Fill `processed_tagdiff`: entries by descending count, at most
/// `MAX_PROCESSED_TAGS` per action with a trailer counting the rest.
pub fn process_tagdiff(misc: &mut Misc, tagdiff: &TagDiff) {
    misc.processed_tagdiff.clear();
    misc.processed_tagdiff_trailer.clear();
    for action in Action::ALL {
        let mut sorted: Vec<(&String, &u64)> = tagdiff.bucket(action).iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(a.1));
        if sorted.len() > MAX_PROCESSED_TAGS {
            let rest = sorted.len() - MAX_PROCESSED_TAGS;
            misc.processed_tagdiff_trailer.insert(
                action,
                format!(
                    "{} other {} item{}",
                    rest,
                    action,
                    if rest == 1 { "" } else { "s" }
                ),
            );
        }
        let processed = sorted
            .into_iter()
            .take(MAX_PROCESSED_TAGS)
            .map(|(tag, count)| ProcessedTag {
                tag: tag.clone(),
                count: *count,
            })
            .collect();
        misc.processed_tagdiff.insert(action, processed);
    }
}
