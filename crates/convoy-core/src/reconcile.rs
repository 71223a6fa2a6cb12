//! Reconciliation of a listing against the persisted rows of one watcher.

use crate::events::{ChangeEvent, ChangeKind, EventSink, WatchEvent};
use crate::CoreError;
use convoy_runtime::Listing;
use convoy_schema::{DeviceUuid, ManagedContainer, ObservedContainer, ProviderId, WatcherName};
use convoy_store::{ContainerRepository, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Status written to the rows of a watcher whose listing failed.
pub const UNREACHABLE_STATUS: &str = "unreachable";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Unobserved rows kept because their node could not be listed.
    pub preserved: usize,
    /// Observations dropped because a later one had the same provider id.
    pub duplicates: usize,
}

impl ReconcileReport {
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Collapse repeated provider ids, keeping the last observation at the
/// position of the first.
fn dedup(watcher: &WatcherName, observed: Vec<ObservedContainer>) -> (Vec<ObservedContainer>, usize) {
    let mut index: HashMap<ProviderId, usize> = HashMap::with_capacity(observed.len());
    let mut unique: Vec<ObservedContainer> = Vec::with_capacity(observed.len());
    let mut duplicates = 0;
    for container in observed {
        if let Some(&at) = index.get(&container.provider_id) {
            warn!(
                "{watcher}: provider id {} listed twice, keeping the last entry",
                container.provider_id
            );
            unique[at] = container;
            duplicates += 1;
        } else {
            index.insert(container.provider_id.clone(), unique.len());
            unique.push(container);
        }
    }
    (unique, duplicates)
}

/// Bring the rows of `watcher` in line with `listing`.
///
/// Inserts and updates run first; rows that were not observed are deleted
/// only after every upsert succeeded, and never when their node is listed
/// in `listing.failures`. Unchanged input performs no writes and emits no
/// events.
pub fn reconcile(
    device: &DeviceUuid,
    watcher: &WatcherName,
    listing: Listing,
    repo: &dyn ContainerRepository,
    sink: &dyn EventSink,
) -> Result<ReconcileReport, CoreError> {
    let failed: Vec<String> = listing.failures.iter().map(|f| f.scope.clone()).collect();
    let (observed, duplicates) = dedup(watcher, listing.containers);
    let mut report = ReconcileReport {
        duplicates,
        ..ReconcileReport::default()
    };

    let mut existing: HashMap<ProviderId, ManagedContainer> = HashMap::new();
    let mut stale: Vec<ManagedContainer> = Vec::new();
    for row in repo.find_by_watcher(watcher)? {
        if existing.contains_key(&row.provider_id) {
            warn!(
                "{watcher}: duplicate row {} for provider id {}",
                row.uuid, row.provider_id
            );
            stale.push(row);
        } else {
            existing.insert(row.provider_id.clone(), row);
        }
    }

    let aborted = |report: &ReconcileReport, source: StoreError| CoreError::Reconciliation {
        watcher: watcher.to_string(),
        applied: report.writes(),
        source,
    };

    for container in observed {
        match existing.remove(&container.provider_id) {
            Some(mut row) => {
                if !row.differs_from(&container) {
                    report.unchanged += 1;
                    continue;
                }
                row.apply(&container);
                repo.update_or_create(&row)
                    .map_err(|e| aborted(&report, e))?;
                report.updated += 1;
                sink.emit(WatchEvent::Container(ChangeEvent {
                    change: ChangeKind::Updated,
                    container: row,
                }));
            }
            None => {
                let row = ManagedContainer::from_observed(device.clone(), watcher.clone(), container);
                repo.update_or_create(&row)
                    .map_err(|e| aborted(&report, e))?;
                report.created += 1;
                sink.emit(WatchEvent::Container(ChangeEvent {
                    change: ChangeKind::Created,
                    container: row,
                }));
            }
        }
    }

    stale.extend(existing.into_values());
    for row in stale {
        if row
            .node
            .as_deref()
            .is_some_and(|node| failed.iter().any(|f| f == node))
        {
            debug!(
                "{watcher}: keeping {} ({}), node was not listed",
                row.name, row.provider_id
            );
            report.preserved += 1;
            continue;
        }
        repo.delete_by_uuid(&row.uuid)
            .map_err(|e| aborted(&report, e))?;
        report.deleted += 1;
        sink.emit(WatchEvent::Container(ChangeEvent {
            change: ChangeKind::Deleted,
            container: row,
        }));
    }

    if report.writes() > 0 {
        debug!(
            "{watcher}: reconciled ({} created, {} updated, {} deleted)",
            report.created, report.updated, report.deleted
        );
    }
    Ok(report)
}

/// Mark every row of `watcher` unreachable after its listing failed.
/// Only the status changes; nothing is deleted. Returns the rows written.
pub fn mark_unreachable(
    watcher: &WatcherName,
    repo: &dyn ContainerRepository,
    sink: &dyn EventSink,
) -> Result<usize, CoreError> {
    let mut written = 0;
    for mut row in repo.find_by_watcher(watcher)? {
        if row.status == UNREACHABLE_STATUS {
            continue;
        }
        row.status = UNREACHABLE_STATUS.to_owned();
        row.stats = None;
        row.updated_at = chrono::Utc::now().to_rfc3339();
        repo.update_or_create(&row)
            .map_err(|source| CoreError::Reconciliation {
                watcher: watcher.to_string(),
                applied: written,
                source,
            })?;
        written += 1;
        sink.emit(WatchEvent::Container(ChangeEvent {
            change: ChangeKind::Updated,
            container: row,
        }));
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use convoy_runtime::ScopeFailure;
    use convoy_schema::ContainerKind;
    use convoy_store::MemoryRepository;

    fn device() -> DeviceUuid {
        DeviceUuid::new("d1")
    }

    fn watcher() -> WatcherName {
        WatcherName::new("docker-d1")
    }

    fn seen(id: &str, status: &str) -> ObservedContainer {
        ObservedContainer::new(id, ContainerKind::Container, id, status)
    }

    fn run(repo: &MemoryRepository, sink: &RecordingSink, containers: Vec<ObservedContainer>) -> ReconcileReport {
        reconcile(&device(), &watcher(), Listing::complete(containers), repo, sink).unwrap()
    }

    fn ids(repo: &MemoryRepository) -> Vec<String> {
        let mut ids: Vec<String> = repo
            .find_by_watcher(&watcher())
            .unwrap()
            .into_iter()
            .map(|c| c.provider_id.to_string())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn replaces_a_with_d() {
        let repo = MemoryRepository::new();
        let sink = RecordingSink::new();
        run(&repo, &sink, vec![seen("A", "running"), seen("B", "running"), seen("C", "running")]);
        let before: HashMap<String, String> = repo
            .list()
            .unwrap()
            .into_iter()
            .map(|c| (c.provider_id.to_string(), c.uuid.to_string()))
            .collect();
        sink.clear();

        let report = run(&repo, &sink, vec![seen("B", "running"), seen("C", "running"), seen("D", "running")]);
        assert_eq!((report.created, report.updated, report.deleted, report.unchanged), (1, 0, 1, 2));
        assert_eq!(ids(&repo), vec!["B", "C", "D"]);
        for row in repo.list().unwrap() {
            if let Some(uuid) = before.get(row.provider_id.as_str()) {
                assert_eq!(row.uuid.as_str(), uuid);
            }
        }
        let kinds: Vec<ChangeKind> = sink.changes().iter().map(|c| c.change).collect();
        assert_eq!(kinds, vec![ChangeKind::Created, ChangeKind::Deleted]);
    }

    #[test]
    fn unchanged_listing_writes_nothing() {
        let repo = MemoryRepository::new();
        let sink = RecordingSink::new();
        run(&repo, &sink, vec![seen("A", "running")]);
        let writes = repo.writes();
        sink.clear();

        let report = run(&repo, &sink, vec![seen("A", "running")]);
        assert_eq!(report.writes(), 0);
        assert_eq!(repo.writes(), writes);
        assert!(sink.events().is_empty());
    }

    #[test]
    fn duplicate_provider_ids_keep_last() {
        let repo = MemoryRepository::new();
        let sink = RecordingSink::new();
        let report = run(&repo, &sink, vec![seen("A", "running"), seen("A", "exited")]);
        assert_eq!(report.created, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(repo.list().unwrap()[0].status, "exited");
    }

    #[test]
    fn failed_nodes_keep_their_rows() {
        let repo = MemoryRepository::new();
        let sink = RecordingSink::new();
        let vm = |id: &str, node: &str| {
            ObservedContainer::new(id, ContainerKind::VirtualMachine, id, "running").on_node(node)
        };
        run(&repo, &sink, vec![vm("100", "pve1"), vm("200", "pve2")]);

        let listing = Listing {
            containers: vec![vm("100", "pve1")],
            failures: vec![ScopeFailure {
                scope: "pve2".to_owned(),
                reason: "timeout".to_owned(),
            }],
        };
        let report = reconcile(&device(), &watcher(), listing, &repo, &sink).unwrap();
        assert_eq!(report.preserved, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(ids(&repo), vec!["100", "200"]);
    }

    #[test]
    fn write_failure_skips_deletes() {
        let repo = MemoryRepository::new();
        let sink = RecordingSink::new();
        run(&repo, &sink, vec![seen("A", "running"), seen("B", "running")]);

        repo.fail_writes_after(Some(0));
        let err = reconcile(
            &device(),
            &watcher(),
            Listing::complete(vec![seen("C", "running")]),
            &repo,
            &sink,
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Reconciliation { applied: 0, .. }), "{err}");
        assert_eq!(ids(&repo), vec!["A", "B"]);
    }

    #[test]
    fn unreachable_marks_once() {
        let repo = MemoryRepository::new();
        let sink = RecordingSink::new();
        run(&repo, &sink, vec![seen("A", "running"), seen("B", "exited")]);

        assert_eq!(mark_unreachable(&watcher(), &repo, &sink).unwrap(), 2);
        assert_eq!(mark_unreachable(&watcher(), &repo, &sink).unwrap(), 0);
        assert!(repo
            .list()
            .unwrap()
            .iter()
            .all(|c| c.status == UNREACHABLE_STATUS));
    }
}
