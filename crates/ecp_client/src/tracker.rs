// SPDX-License-Identifier: Apache-2.0

//! Append-only log of observed pipeline and task bundles. New observations
//! are merged with an existing log, deduplicated against their neighbors,
//! and optionally pruned down to the records still acceptable under the
//! freshness policy. Output is deterministic YAML: repositories sort
//! lexicographically and records stay newest first.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bundle::{bundle_info, Collection};
use crate::error::EcpError;
use crate::image::{parse_and_resolve_all, ImageReference};
use crate::runtime::RunContext;

/// One observed bundle. Only `digest`, `effective_on`, and `tag` persist;
/// the repository is the map key and the collection picks the map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRecord {
    pub digest: String,
    #[serde(with = "effective_on_format")]
    pub effective_on: DateTime<Utc>,
    pub tag: String,
    #[serde(skip)]
    pub repository: String,
    #[serde(skip)]
    pub collection: Option<Collection>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Tracker {
    #[serde(
        rename = "pipeline-bundles",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub pipeline_bundles: BTreeMap<String, Vec<BundleRecord>>,
    #[serde(
        rename = "task-bundles",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub task_bundles: BTreeMap<String, Vec<BundleRecord>>,
}

impl Tracker {
    /// Parse an existing tracker document, or start empty.
    fn from_input(input: Option<&[u8]>) -> Result<Tracker, EcpError> {
        match input {
            Some(bytes) => serde_yaml::from_slice(bytes).map_err(|e| {
                EcpError::Configuration(format!("unable to parse tracker input: {e}"))
            }),
            None => Ok(Tracker::default()),
        }
    }

    /// Prepend the record to its repository's list, newest first.
    fn add_bundle_record(&mut self, record: BundleRecord) {
        let collection = match record.collection {
            Some(Collection::PipelineBundles) => {
                debug!(digest = %record.digest, "adding record to the pipelines collection");
                &mut self.pipeline_bundles
            }
            Some(Collection::TaskBundles) => {
                debug!(digest = %record.digest, "adding record to the tasks collection");
                &mut self.task_bundles
            }
            None => {
                warn!(digest = %record.digest, "ignoring record with no collection");
                return;
            }
        };
        collection
            .entry(record.repository.clone())
            .or_default()
            .insert(0, record);
    }

    fn filter_bundles(&mut self, prune: bool, now: DateTime<Utc>) {
        for (repository, records) in self.pipeline_bundles.iter_mut() {
            debug!(%repository, "filtering pipeline records");
            *records = filter_records(std::mem::take(records), prune, now);
        }
        for (repository, records) in self.task_bundles.iter_mut() {
            debug!(%repository, "filtering task records");
            *records = filter_records(std::mem::take(records), prune, now);
        }
    }

    /// Serialize as YAML. Keys come from sorted maps and fixed field order,
    /// so repeated serialization of the same state is byte-identical.
    pub fn output(&self) -> Result<Vec<u8>, EcpError> {
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .map_err(|e| EcpError::Configuration(format!("unable to serialize tracker: {e}")))
    }
}

/// Load an existing tracker log, add the given bundles, and emit the merged
/// log. Each URL must reference a Tekton bundle; a bundle joins one or both
/// collections depending on the resources it packages. With `freshen`,
/// existing repository:tag pairs are re-resolved first so retagged bundles
/// pick up their new digests. With `prune`, records no longer acceptable are
/// dropped.
pub async fn track(
    ctx: &RunContext,
    urls: &[String],
    input: Option<&[u8]>,
    prune: bool,
    freshen: bool,
) -> Result<Vec<u8>, EcpError> {
    let mut refs = parse_and_resolve_all(ctx, urls, true)
        .await
        .map_err(|e| EcpError::image_access("bundle", e))?;

    let mut tracker = Tracker::from_input(input)?;

    if freshen {
        debug!("freshen is enabled");
        refs.extend(input_bundle_tags(ctx, &tracker).await?);
    }

    let effective = effective_on(Utc::now());
    for reference in &refs {
        debug!(%reference, "processing bundle");
        let info = bundle_info(ctx, reference).await?;
        for collection in &info.collections {
            tracker.add_bundle_record(BundleRecord {
                digest: reference.digest.clone().unwrap_or_default(),
                effective_on: effective,
                tag: reference.tag.clone().unwrap_or_default(),
                repository: reference.repository.clone(),
                collection: Some(*collection),
            });
        }
    }

    tracker.filter_bundles(prune, Utc::now());
    tracker.output()
}

/// Unique `repository:tag` references across both collections, resolved
/// against the registry.
async fn input_bundle_tags(
    ctx: &RunContext,
    tracker: &Tracker,
) -> Result<Vec<ImageReference>, EcpError> {
    let mut unique: BTreeSet<String> = BTreeSet::new();
    for (repository, records) in tracker
        .pipeline_bundles
        .iter()
        .chain(tracker.task_bundles.iter())
    {
        for record in records {
            unique.insert(format!("{repository}:{}", record.tag));
        }
    }
    let urls: Vec<String> = unique.into_iter().collect();
    parse_and_resolve_all(ctx, &urls, true)
        .await
        .map_err(|e| EcpError::image_access("bundle", e))
}

/// The beginning of the day 30 days from `now`, in UTC. Day resolution keeps
/// the serialized form at plain RFC3339 seconds.
fn effective_on(now: DateTime<Utc>) -> DateTime<Utc> {
    (now + Duration::days(30))
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
}

/// Reduce a newest-first record list. Adjacent records sharing a digest
/// collapse to the oldest of the run, so re-observing a digest never
/// postpones its effective date. When pruning, records older than the most
/// recent past-effective record are dropped.
fn filter_records(
    records: Vec<BundleRecord>,
    prune: bool,
    now: DateTime<Utc>,
) -> Vec<BundleRecord> {
    let mut unique: Vec<BundleRecord> = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        if i + 1 < records.len() && records[i + 1].digest == record.digest {
            continue;
        }
        unique.push(record.clone());
    }

    let total = records.len();
    let mut relevant: Vec<BundleRecord> = Vec::with_capacity(unique.len());
    for record in unique {
        let expired = now > record.effective_on;
        relevant.push(record);
        if prune && expired {
            break;
        }
    }

    let filtered = total - relevant.len();
    if filtered != 0 {
        debug!(filtered, prune, "filtered bundle records");
    }
    relevant
}

mod effective_on_format {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, FORMAT)
            .map(|dt| dt.and_utc())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record(digest: &str, effective_on: DateTime<Utc>) -> BundleRecord {
        BundleRecord {
            digest: digest.to_string(),
            effective_on,
            tag: "main".to_string(),
            repository: "registry.io/p".to_string(),
            collection: Some(Collection::PipelineBundles),
        }
    }

    fn days_from_now(days: i64) -> DateTime<Utc> {
        Utc::now() + Duration::days(days)
    }

    #[test]
    fn effective_on_is_midnight_thirty_days_out() {
        let now = Utc.with_ymd_and_hms(2025, 1, 2, 13, 45, 59).unwrap();
        let effective = effective_on(now);
        assert_eq!(
            effective,
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn effective_on_serializes_without_nanoseconds() {
        let record = record("sha256:aaa", Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());
        let yaml = serde_yaml::to_string(&record).unwrap();
        assert!(yaml.contains("effective_on: 2025-02-01T00:00:00Z"), "{yaml}");
    }

    #[test]
    fn adjacent_duplicates_collapse_to_the_oldest_record() {
        let newer = record("sha256:aaa", days_from_now(40));
        let older = record("sha256:aaa", days_from_now(20));
        let filtered = filter_records(vec![newer, older.clone()], false, Utc::now());
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].effective_on, older.effective_on);
    }

    #[test]
    fn no_adjacent_records_share_a_digest_after_filtering() {
        let records = vec![
            record("sha256:aaa", days_from_now(50)),
            record("sha256:aaa", days_from_now(40)),
            record("sha256:bbb", days_from_now(30)),
            record("sha256:bbb", days_from_now(20)),
            record("sha256:aaa", days_from_now(10)),
        ];
        let filtered = filter_records(records, false, Utc::now());
        let digests: Vec<&str> = filtered.iter().map(|r| r.digest.as_str()).collect();
        assert_eq!(digests, vec!["sha256:aaa", "sha256:bbb", "sha256:aaa"]);
        for pair in filtered.windows(2) {
            assert_ne!(pair[0].digest, pair[1].digest);
        }
    }

    #[test]
    fn non_adjacent_duplicates_are_not_collapsed() {
        let records = vec![
            record("sha256:aaa", days_from_now(30)),
            record("sha256:bbb", days_from_now(20)),
            record("sha256:aaa", days_from_now(10)),
        ];
        let filtered = filter_records(records, false, Utc::now());
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn prune_keeps_future_records_and_one_past_record() {
        let records = vec![
            record("sha256:ccc", days_from_now(30)),
            record("sha256:bbb", days_from_now(-30)),
            record("sha256:aaa", days_from_now(-60)),
        ];

        let pruned = filter_records(records.clone(), true, Utc::now());
        let digests: Vec<&str> = pruned.iter().map(|r| r.digest.as_str()).collect();
        assert_eq!(digests, vec!["sha256:ccc", "sha256:bbb"]);

        let unpruned = filter_records(records, false, Utc::now());
        assert_eq!(unpruned.len(), 3);
    }

    #[test]
    fn records_are_prepended_newest_first() {
        let mut tracker = Tracker::default();
        tracker.add_bundle_record(record("sha256:aaa", days_from_now(10)));
        tracker.add_bundle_record(record("sha256:bbb", days_from_now(20)));

        let records = tracker.pipeline_bundles.get("registry.io/p").unwrap();
        assert_eq!(records[0].digest, "sha256:bbb");
        assert_eq!(records[1].digest, "sha256:aaa");
    }

    #[test]
    fn readding_the_same_digest_leaves_one_record() {
        let mut tracker = Tracker::default();
        tracker.add_bundle_record(record("sha256:aaa", days_from_now(30)));
        // second run observes the same digest with a fresher effective date
        tracker.add_bundle_record(record("sha256:aaa", days_from_now(31)));
        tracker.filter_bundles(true, Utc::now());

        let records = tracker.pipeline_bundles.get("registry.io/p").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].digest, "sha256:aaa");
    }

    #[test]
    fn record_without_collection_is_ignored() {
        let mut tracker = Tracker::default();
        let mut r = record("sha256:aaa", days_from_now(30));
        r.collection = None;
        tracker.add_bundle_record(r);
        assert!(tracker.pipeline_bundles.is_empty());
        assert!(tracker.task_bundles.is_empty());
    }

    #[test]
    fn output_is_byte_deterministic() {
        let effective = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let mut tracker = Tracker::default();
        for repository in ["registry.io/zeta", "registry.io/alpha"] {
            let mut r = record("sha256:aaa", effective);
            r.repository = repository.to_string();
            tracker.add_bundle_record(r.clone());
            let mut t = r;
            t.collection = Some(Collection::TaskBundles);
            tracker.add_bundle_record(t);
        }

        let first = tracker.output().unwrap();
        let second = tracker.output().unwrap();
        assert_eq!(first, second);

        // round-trip through parsing stays byte-identical
        let reparsed = Tracker::from_input(Some(&first)).unwrap();
        assert_eq!(reparsed.output().unwrap(), first);

        // repositories are sorted lexicographically inside each collection
        let text = String::from_utf8(first).unwrap();
        let alpha = text.find("registry.io/alpha").unwrap();
        let zeta = text.find("registry.io/zeta").unwrap();
        assert!(alpha < zeta, "{text}");
    }

    #[test]
    fn parses_existing_documents_and_defaults_missing_collections() {
        let input = b"task-bundles:\n  registry.io/t:\n  - digest: sha256:aaa\n    effective_on: 2025-02-01T00:00:00Z\n    tag: main\n";
        let tracker = Tracker::from_input(Some(input)).unwrap();
        assert!(tracker.pipeline_bundles.is_empty());
        let records = tracker.task_bundles.get("registry.io/t").unwrap();
        assert_eq!(records[0].digest, "sha256:aaa");
        assert_eq!(records[0].tag, "main");

        let err = Tracker::from_input(Some(b"not: [valid")).unwrap_err();
        assert!(err.to_string().contains("tracker input"));
    }
}
