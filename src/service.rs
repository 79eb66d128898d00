//! Read-side facade over the reconciled datasets.
//!
//! Each view is an awaited pipeline: reconcile the rows, index their raids,
//! then resolve owners through the reference tables.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info};

use crate::audit::{details_label, AuditAction};
use crate::cache::{Snapshot, SnapshotCache};
use crate::joins::{GroupIndex, Owner, OwnershipIndex};
use crate::ledger::{self, AccountStanding, Standing};
use crate::models::{
    AccountRow, AttendanceRow, AuditRow, CharacterRow, ClassificationRow, Config, DatasetRow,
    EventRow, LootRow, MembershipRow,
};
use crate::query::{FieldValue, Queryable};
use crate::reconcile::{
    system_clock, Clock, Dataset, DatasetState, LoadKind, ReconcilePolicy, Reconciler,
    ReferenceLoader,
};
use crate::remote::{FetcherLimits, RemoteFetcher, RemoteSource};
use crate::sources::{GroupOrigins, OriginIndex, SourceDisambiguator, SourceMatch};

/// Loot rows with their raid and owner indexes.
#[derive(Debug, Clone)]
pub struct LootView {
    pub snapshot: Arc<Snapshot<LootRow>>,
    pub groups: GroupIndex,
    pub owners: OwnershipIndex,
}

/// One loot row joined for display.
#[derive(Debug, Clone)]
pub struct LootEntry<'a> {
    pub row: &'a LootRow,
    pub raid: String,
    pub date: Option<&'a str>,
    pub owner: Owner,
    pub class_name: Option<&'a str>,
}

impl LootView {
    /// Rows newest-first, joined to their raid and account.
    pub fn entries(&self) -> Vec<LootEntry<'_>> {
        self.snapshot
            .rows
            .iter()
            .map(|row| {
                let (raid, date) = match row.raid_id {
                    Some(id) => (self.groups.label(id), self.groups.date_of(id)),
                    None => (String::new(), None),
                };
                let char_id = row.char_id.as_deref();
                let name = row.character_name.as_deref();
                LootEntry {
                    row,
                    raid,
                    date,
                    owner: self.owners.resolve(char_id, name),
                    class_name: self.owners.class_of(char_id, name),
                }
            })
            .collect()
    }
}

impl Queryable for LootEntry<'_> {
    fn field(&self, name: &str) -> FieldValue<'_> {
        match name {
            "raid" => FieldValue::text(Some(self.raid.as_str())),
            "date" => FieldValue::date(self.date),
            "account" | "owner" => FieldValue::text(Some(self.owner.label())),
            "class" => FieldValue::text(self.class_name),
            other => self.row.field(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub row: AuditRow,
    pub action: AuditAction,
    pub details: String,
}

impl Queryable for AuditEntry {
    fn field(&self, name: &str) -> FieldValue<'_> {
        match name {
            "details" => FieldValue::text(Some(self.details.as_str())),
            "title" => FieldValue::text(Some(self.action.title())),
            other => self.row.field(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Standings {
    pub characters: Vec<Standing>,
    pub accounts: Vec<AccountStanding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub dataset: String,
    pub kind: LoadKind,
    pub new_rows: usize,
    pub total_rows: usize,
    pub watermark: i64,
}

pub struct LedgerService {
    loot: Reconciler<LootRow>,
    attendance: Reconciler<AttendanceRow>,
    events: Reconciler<EventRow>,
    audit: Reconciler<AuditRow>,
    references: ReferenceLoader,
    sources: OnceCell<Arc<SourceDisambiguator>>,
    item_sources_path: PathBuf,
    item_overrides_path: Option<PathBuf>,
}

impl LedgerService {
    pub fn new(source: Arc<dyn RemoteSource>, cache: SnapshotCache, config: &Config) -> Self {
        Self::with_clock(source, cache, config, system_clock())
    }

    pub fn with_clock(
        source: Arc<dyn RemoteSource>,
        cache: SnapshotCache,
        config: &Config,
        clock: Clock,
    ) -> Self {
        let fetcher = RemoteFetcher::new(
            source,
            FetcherLimits {
                page_size: config.page_size,
                max_pages: config.max_full_pages,
                in_chunk_size: config.in_chunk_size,
            },
        );
        let policy = ReconcilePolicy::from_config(config);
        Self {
            loot: Reconciler::with_clock(fetcher.clone(), cache.clone(), policy, clock.clone()),
            attendance: Reconciler::with_clock(
                fetcher.clone(),
                cache.clone(),
                policy,
                clock.clone(),
            ),
            events: Reconciler::with_clock(fetcher.clone(), cache.clone(), policy, clock.clone()),
            audit: Reconciler::with_clock(fetcher.clone(), cache.clone(), policy, clock.clone()),
            references: ReferenceLoader::with_clock(fetcher, cache, clock),
            sources: OnceCell::new(),
            item_sources_path: PathBuf::from(&config.item_sources_path),
            item_overrides_path: config.item_overrides_path.as_ref().map(PathBuf::from),
        }
    }

    /// Status of the loot dataset: the cached snapshot shows up here as soon
    /// as a reconcile starts, before the remote answers.
    pub fn subscribe_loot(&self) -> watch::Receiver<DatasetState<LootRow>> {
        self.loot.subscribe(LootRow::TABLE)
    }

    pub async fn ownership(&self, ttl: Duration) -> Result<OwnershipIndex> {
        let (characters, accounts, memberships) = tokio::try_join!(
            self.references.load::<CharacterRow>(ttl),
            self.references.load::<AccountRow>(ttl),
            self.references.load::<MembershipRow>(ttl),
        )
        .context("load ownership tables")?;
        Ok(OwnershipIndex::build(&characters, &accounts, &memberships))
    }

    pub async fn loot_view(&self, ttl: Duration) -> Result<LootView> {
        let snapshot = self
            .loot
            .reconcile(&Dataset::of::<LootRow>(), ttl)
            .await
            .context("reconcile raid_loot")?
            .snapshot;

        let groups = GroupIndex::from_snapshot(&snapshot);
        let gaps = groups.gaps(&snapshot.rows);
        if !gaps.is_empty() {
            debug!(gaps = gaps.len(), "loot rows shown with raw raid ids");
        }

        let owners = self.ownership(ttl).await?;
        Ok(LootView {
            snapshot,
            groups,
            owners,
        })
    }

    async fn disambiguator(&self) -> Result<&Arc<SourceDisambiguator>> {
        self.sources
            .get_or_try_init(|| async {
                let mut index = OriginIndex::load(&self.item_sources_path).await?;
                if let Some(path) = &self.item_overrides_path {
                    index.load_overrides(path).await?;
                }
                Ok::<_, anyhow::Error>(Arc::new(SourceDisambiguator::new(index)))
            })
            .await
    }

    pub async fn disambiguate_source(
        &self,
        item_name: &str,
        group_id: Option<i64>,
        group_name: Option<&str>,
        ttl: Duration,
    ) -> Result<Option<SourceMatch>> {
        let disambiguator = self.disambiguator().await?;
        let classifications = self
            .references
            .load::<ClassificationRow>(ttl)
            .await
            .context("load raid classifications")?;
        let origins = GroupOrigins::from_rows(&classifications);
        Ok(disambiguator.disambiguate(item_name, group_id, group_name, &origins))
    }

    pub async fn standings(&self, ttl: Duration, since: Option<&str>) -> Result<Standings> {
        let events_ds = Dataset::of::<EventRow>();
        let attendance_ds = Dataset::of::<AttendanceRow>();
        let loot_ds = Dataset::of::<LootRow>();
        let (events, attendance, loot) = tokio::try_join!(
            self.events.reconcile(&events_ds, ttl),
            self.attendance.reconcile(&attendance_ds, ttl),
            self.loot.reconcile(&loot_ds, ttl),
        )
        .context("reconcile ledger tables")?;

        let groups = GroupIndex::new(
            events
                .snapshot
                .groups
                .values()
                .chain(attendance.snapshot.groups.values())
                .chain(loot.snapshot.groups.values())
                .cloned(),
        );

        let characters = ledger::standings(
            &events.snapshot.rows,
            &attendance.snapshot.rows,
            &loot.snapshot.rows,
            &groups,
            since,
        );
        let owners = self.ownership(ttl).await?;
        let accounts = ledger::by_account(&characters, &owners);
        Ok(Standings {
            characters,
            accounts,
        })
    }

    /// Audit log, newest first.
    pub async fn audit_entries(&self, ttl: Duration) -> Result<Vec<AuditEntry>> {
        let snapshot = self
            .audit
            .reconcile(&Dataset::of::<AuditRow>(), ttl)
            .await
            .context("reconcile officer_audit_log")?
            .snapshot;
        Ok(snapshot
            .rows
            .iter()
            .map(|row| AuditEntry {
                row: row.clone(),
                action: AuditAction::parse(&row.action),
                details: details_label(row),
            })
            .collect())
    }

    /// Reconcile every dataset and refresh the reference tables.
    pub async fn sync_all(&self, ttl: Duration) -> Result<Vec<SyncReport>> {
        let loot_ds = Dataset::of::<LootRow>();
        let attendance_ds = Dataset::of::<AttendanceRow>();
        let events_ds = Dataset::of::<EventRow>();
        let audit_ds = Dataset::of::<AuditRow>();
        let (loot, attendance, events, audit) = tokio::try_join!(
            self.loot.reconcile(&loot_ds, ttl),
            self.attendance.reconcile(&attendance_ds, ttl),
            self.events.reconcile(&events_ds, ttl),
            self.audit.reconcile(&audit_ds, ttl),
        )
        .context("reconcile datasets")?;

        tokio::try_join!(
            self.references.load::<CharacterRow>(ttl),
            self.references.load::<AccountRow>(ttl),
            self.references.load::<MembershipRow>(ttl),
            self.references.load::<ClassificationRow>(ttl),
        )
        .context("load reference tables")?;

        let reports = vec![
            report(&*loot.snapshot, loot.kind, loot.new_rows),
            report(&*attendance.snapshot, attendance.kind, attendance.new_rows),
            report(&*events.snapshot, events.kind, events.new_rows),
            report(&*audit.snapshot, audit.kind, audit.new_rows),
        ];
        for r in &reports {
            info!(
                dataset = %r.dataset,
                kind = ?r.kind,
                new_rows = r.new_rows,
                total_rows = r.total_rows,
                "dataset synced"
            );
        }
        Ok(reports)
    }
}

fn report<R>(snapshot: &Snapshot<R>, kind: LoadKind, new_rows: usize) -> SyncReport {
    SyncReport {
        dataset: snapshot.dataset_key.clone(),
        kind,
        new_rows,
        total_rows: snapshot.rows.len(),
        watermark: snapshot.watermark,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use serde_json::json;

    fn seeded_remote() -> Arc<MemoryRemote> {
        let remote = Arc::new(MemoryRemote::new());
        remote.insert_rows(
            "raids",
            vec![json!({"raid_id": 1, "raid_name": "Plane of Water Raid", "date_iso": "2024-03-01"})],
        );
        remote.insert_rows(
            "raid_loot",
            vec![
                json!({"id": 1, "raid_id": 1, "item_name": "Ring of X", "char_id": "101", "character_name": "Aldric", "cost": 10}),
                json!({"id": 2, "raid_id": 9, "item_name": "Mithril Helm", "character_name": "Dorn", "cost": 5}),
            ],
        );
        remote.insert_rows(
            "characters",
            vec![
                json!({"char_id": "101", "name": "Aldric", "class_name": "Warrior"}),
                json!({"char_id": "104", "name": "Dorn", "class_name": "Rogue"}),
            ],
        );
        remote.insert_rows(
            "accounts",
            vec![json!({"account_id": "A1", "display_name": "Big Al", "toon_names": "Aldric"})],
        );
        remote.insert_rows(
            "character_account",
            vec![json!({"char_id": "101", "account_id": "A1"})],
        );
        remote
    }

    #[tokio::test]
    async fn test_loot_view_joins_raids_and_owners() {
        let remote = seeded_remote();
        let service = LedgerService::new(remote, SnapshotCache::in_memory(), &Config::default());

        let view = service.loot_view(Duration::from_secs(60)).await.unwrap();
        let entries = view.entries();
        assert_eq!(entries.len(), 2);

        // newest first; raid 9 does not exist remotely
        assert_eq!(entries[0].row.id, 2);
        assert_eq!(entries[0].raid, "9");
        assert_eq!(entries[0].owner, Owner::Unowned);
        assert_eq!(entries[0].class_name, Some("Rogue"));

        assert_eq!(entries[1].raid, "Plane of Water Raid");
        assert_eq!(entries[1].owner.label(), "Big Al");
        assert_eq!(entries[1].date, Some("2024-03-01"));
    }

    #[tokio::test]
    async fn test_sync_all_and_standings_reconcile_every_dataset() {
        let remote = seeded_remote();
        let service =
            LedgerService::new(remote.clone(), SnapshotCache::in_memory(), &Config::default());
        let ttl = Duration::from_secs(60);

        let reports = service.sync_all(ttl).await.unwrap();
        let names: Vec<&str> = reports.iter().map(|r| r.dataset.as_str()).collect();
        assert_eq!(
            names,
            vec!["raid_loot", "raid_event_attendance", "raid_events", "officer_audit_log"]
        );
        assert!(reports.iter().all(|r| r.kind == LoadKind::Full));

        let standings = service.standings(ttl, None).await.unwrap();
        let aldric = standings
            .characters
            .iter()
            .find(|s| s.name == "Aldric")
            .unwrap();
        assert_eq!(aldric.spent, 10.0);
        assert_eq!(standings.accounts[0].label, "(no account)");
    }

    #[tokio::test]
    async fn test_loot_entries_are_queryable() {
        let service =
            LedgerService::new(seeded_remote(), SnapshotCache::in_memory(), &Config::default());
        let view = service.loot_view(Duration::from_secs(60)).await.unwrap();
        let entries = view.entries();

        let hits = crate::query::Query::new()
            .filter("account", "big")
            .apply(&entries);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].row.item_name, "Ring of X");
    }

    #[tokio::test]
    async fn test_origin_index_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("item_sources.json");
        std::fs::write(
            &path,
            r#"{"Ring of X": [{"mob": "Mob A", "zone": "Water"}, {"mob": "Mob B", "zone": "Fire"}]}"#,
        )
        .unwrap();
        let config = Config {
            item_sources_path: path.to_string_lossy().into_owned(),
            ..Config::default()
        };
        let service = LedgerService::new(seeded_remote(), SnapshotCache::in_memory(), &config);
        let ttl = Duration::from_secs(60);

        let m = service
            .disambiguate_source("Ring of X", Some(1), Some("Plane of Water Raid"), ttl)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.candidate.zone, "Water");

        // the file is not read again
        std::fs::remove_file(&path).unwrap();
        assert!(service
            .disambiguate_source("Ring of X", None, None, ttl)
            .await
            .unwrap()
            .is_some());
    }
}
