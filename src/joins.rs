//! Client-side joins the remote service does not provide: rows to their raid,
//! characters to their account.

use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::cache::Snapshot;
use crate::models::{match_key, AccountRow, CharacterRow, DatasetRow, GroupSummary, MembershipRow};

/// Label used for characters that belong to no account.
pub const NO_ACCOUNT_LABEL: &str = "(no account)";

/// A row whose parent raid is not in the group index. Display falls back to
/// the raw id; never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialJoinGap {
    pub row_id: i64,
    pub group_id: i64,
}

impl fmt::Display for PartialJoinGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {} references unknown raid {}", self.row_id, self.group_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupIndex {
    groups: HashMap<i64, GroupSummary>,
}

impl GroupIndex {
    pub fn new(groups: impl IntoIterator<Item = GroupSummary>) -> Self {
        Self {
            groups: groups.into_iter().map(|g| (g.group_id, g)).collect(),
        }
    }

    pub fn from_snapshot<R>(snapshot: &Snapshot<R>) -> Self {
        Self::new(snapshot.groups.values().cloned())
    }

    pub fn get(&self, group_id: i64) -> Option<&GroupSummary> {
        self.groups.get(&group_id)
    }

    /// Raid name, or the raw id when the raid is unknown or unnamed.
    pub fn label(&self, group_id: i64) -> String {
        match self.groups.get(&group_id) {
            Some(g) if !g.name.trim().is_empty() => g.name.clone(),
            _ => group_id.to_string(),
        }
    }

    pub fn date_of(&self, group_id: i64) -> Option<&str> {
        self.groups.get(&group_id).and_then(|g| g.date.as_deref())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Rows whose parent reference has no group.
    pub fn gaps<R: DatasetRow>(&self, rows: &[R]) -> Vec<PartialJoinGap> {
        let gaps: Vec<PartialJoinGap> = rows
            .iter()
            .filter_map(|r| {
                let group_id = r.parent_id()?;
                (!self.groups.contains_key(&group_id)).then(|| PartialJoinGap {
                    row_id: r.row_id(),
                    group_id,
                })
            })
            .collect();
        if !gaps.is_empty() {
            debug!(gaps = gaps.len(), "rows with unresolved raid references");
        }
        gaps
    }

    /// Rows grouped by parent, groups in order of first appearance and rows
    /// in input order. Rows without a parent are skipped.
    pub fn rows_by_group<'a, R: DatasetRow>(&self, rows: &'a [R]) -> Vec<(i64, Vec<&'a R>)> {
        let mut order: Vec<i64> = Vec::new();
        let mut buckets: HashMap<i64, Vec<&'a R>> = HashMap::new();
        for row in rows {
            let Some(group_id) = row.parent_id() else {
                continue;
            };
            buckets
                .entry(group_id)
                .or_insert_with(|| {
                    order.push(group_id);
                    Vec::new()
                })
                .push(row);
        }
        order
            .into_iter()
            .map(|id| {
                let rows = buckets.remove(&id).unwrap_or_default();
                (id, rows)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    Account { account_id: String, label: String },
    Unowned,
}

impl Owner {
    pub fn label(&self) -> &str {
        match self {
            Owner::Account { label, .. } => label,
            Owner::Unowned => NO_ACCOUNT_LABEL,
        }
    }

    pub fn account_id(&self) -> Option<&str> {
        match self {
            Owner::Account { account_id, .. } => Some(account_id),
            Owner::Unowned => None,
        }
    }
}

/// Character → account resolution.
///
/// Keys are trimmed and case-folded. When a row carries both a character id
/// and a name, an id match wins.
#[derive(Debug, Clone, Default)]
pub struct OwnershipIndex {
    characters: HashMap<String, CharacterRow>,
    char_id_by_name: HashMap<String, String>,
    account_by_char: HashMap<String, String>,
    accounts: HashMap<String, AccountRow>,
    members: HashMap<String, Vec<String>>,
}

impl OwnershipIndex {
    pub fn build(
        characters: &[CharacterRow],
        accounts: &[AccountRow],
        memberships: &[MembershipRow],
    ) -> Self {
        let mut index = Self::default();

        for c in characters {
            let id = match_key(&c.char_id);
            if id.is_empty() {
                continue;
            }
            let name = match_key(&c.name);
            if !name.is_empty() {
                // first character wins for duplicate names
                index.char_id_by_name.entry(name).or_insert_with(|| id.clone());
            }
            index.characters.insert(id, c.clone());
        }

        for a in accounts {
            index.accounts.insert(match_key(&a.account_id), a.clone());
        }

        for m in memberships {
            let char_id = match_key(&m.char_id);
            let account_id = match_key(&m.account_id);
            if char_id.is_empty() || account_id.is_empty() {
                continue;
            }
            // at most one owner per character
            if index.account_by_char.contains_key(&char_id) {
                continue;
            }
            index
                .members
                .entry(account_id.clone())
                .or_default()
                .push(char_id.clone());
            index.account_by_char.insert(char_id, account_id);
        }

        debug!(
            characters = index.characters.len(),
            accounts = index.accounts.len(),
            memberships = index.account_by_char.len(),
            "ownership index built"
        );
        index
    }

    fn char_key(&self, char_id: Option<&str>, name: Option<&str>) -> Option<String> {
        if let Some(id) = char_id.map(match_key).filter(|k| !k.is_empty()) {
            if self.characters.contains_key(&id) || self.account_by_char.contains_key(&id) {
                return Some(id);
            }
        }
        let name = name.map(match_key).filter(|k| !k.is_empty())?;
        self.char_id_by_name.get(&name).cloned()
    }

    pub fn resolve(&self, char_id: Option<&str>, name: Option<&str>) -> Owner {
        let Some(key) = self.char_key(char_id, name) else {
            return Owner::Unowned;
        };
        match self.account_by_char.get(&key) {
            Some(account_id) => Owner::Account {
                account_id: self
                    .accounts
                    .get(account_id)
                    .map(|a| a.account_id.clone())
                    .unwrap_or_else(|| account_id.clone()),
                label: self.account_label(account_id),
            },
            None => Owner::Unowned,
        }
    }

    pub fn character(&self, char_id: Option<&str>, name: Option<&str>) -> Option<&CharacterRow> {
        let key = self.char_key(char_id, name)?;
        self.characters.get(&key)
    }

    pub fn class_of(&self, char_id: Option<&str>, name: Option<&str>) -> Option<&str> {
        self.character(char_id, name)?.class_name.as_deref()
    }

    /// Display name, else the first toon name, else the account id.
    pub fn account_label(&self, account_id: &str) -> String {
        let key = match_key(account_id);
        let Some(account) = self.accounts.get(&key) else {
            return account_id.trim().to_string();
        };
        if let Some(name) = account
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return name.to_string();
        }
        if let Some(first) = account
            .toon_names
            .as_deref()
            .and_then(|t| t.split(',').map(str::trim).find(|s| !s.is_empty()))
        {
            return first.to_string();
        }
        account.account_id.clone()
    }

    /// Characters linked to `account_id`, in membership order.
    pub fn characters_of(&self, account_id: &str) -> Vec<&CharacterRow> {
        self.members
            .get(&match_key(account_id))
            .map(|ids| ids.iter().filter_map(|id| self.characters.get(id)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LootRow;

    fn raid(id: i64, name: &str) -> GroupSummary {
        GroupSummary {
            group_id: id,
            name: name.to_string(),
            date: Some("2024-05-01".into()),
        }
    }

    fn loot(id: i64, raid_id: Option<i64>) -> LootRow {
        LootRow {
            id,
            raid_id,
            event_id: None,
            item_name: "Mithril Helm".into(),
            char_id: None,
            character_name: None,
            cost: None,
            assigned_char_id: None,
            assigned_character_name: None,
        }
    }

    fn character(id: &str, name: &str, class: &str) -> CharacterRow {
        CharacterRow {
            char_id: id.into(),
            name: name.into(),
            class_name: Some(class.into()),
        }
    }

    fn owners() -> OwnershipIndex {
        OwnershipIndex::build(
            &[
                character("101", "Aldric", "Warrior"),
                character("102", "Brienne", "Cleric"),
                character("103", "Cato", "Wizard"),
                character("104", "Dorn", "Rogue"),
            ],
            &[
                AccountRow {
                    account_id: "A1".into(),
                    display_name: Some("Big Al".into()),
                    toon_names: Some("Aldric,Brienne".into()),
                },
                AccountRow {
                    account_id: "A2".into(),
                    display_name: Some("  ".into()),
                    toon_names: Some(" Cato , Other".into()),
                },
            ],
            &[
                MembershipRow {
                    char_id: "101".into(),
                    account_id: "A1".into(),
                },
                MembershipRow {
                    char_id: "102".into(),
                    account_id: "A1".into(),
                },
                MembershipRow {
                    char_id: "103".into(),
                    account_id: "A2".into(),
                },
            ],
        )
    }

    #[test]
    fn test_group_label_falls_back_to_raw_id() {
        let index = GroupIndex::new(vec![raid(1, "Plane of Fear"), raid(2, "")]);
        assert_eq!(index.label(1), "Plane of Fear");
        assert_eq!(index.label(2), "2");
        assert_eq!(index.label(99), "99");
        assert_eq!(index.date_of(1), Some("2024-05-01"));
    }

    #[test]
    fn test_gaps_list_unresolved_parents() {
        let index = GroupIndex::new(vec![raid(1, "Plane of Fear")]);
        let rows = vec![loot(3, Some(1)), loot(2, Some(7)), loot(1, None)];
        assert_eq!(
            index.gaps(&rows),
            vec![PartialJoinGap {
                row_id: 2,
                group_id: 7
            }]
        );
    }

    #[test]
    fn test_rows_by_group_keeps_order() {
        let index = GroupIndex::default();
        let rows = vec![
            loot(5, Some(2)),
            loot(4, Some(1)),
            loot(3, Some(2)),
            loot(2, None),
            loot(1, Some(1)),
        ];
        let grouped = index.rows_by_group(&rows);
        let shape: Vec<(i64, Vec<i64>)> = grouped
            .iter()
            .map(|(g, rs)| (*g, rs.iter().map(|r| r.id).collect()))
            .collect();
        assert_eq!(shape, vec![(2, vec![5, 3]), (1, vec![4, 1])]);
    }

    #[test]
    fn test_member_resolves_to_owner_label() {
        let index = owners();
        let owner = index.resolve(Some("101"), None);
        assert_eq!(owner.label(), "Big Al");
        assert_eq!(owner.account_id(), Some("A1"));

        // name lookup is trimmed and case-folded
        assert_eq!(index.resolve(None, Some("  brienne ")).label(), "Big Al");
        // blank display name falls back to the first toon
        assert_eq!(index.resolve(None, Some("Cato")).label(), "Cato");
    }

    #[test]
    fn test_id_match_wins_over_name() {
        let index = owners();
        let owner = index.resolve(Some("103"), Some("Aldric"));
        assert_eq!(owner.account_id(), Some("A2"));
    }

    #[test]
    fn test_non_member_is_unowned() {
        let index = owners();
        assert_eq!(index.resolve(Some("104"), Some("Dorn")), Owner::Unowned);
        assert_eq!(index.resolve(None, Some("Nobody")), Owner::Unowned);
        assert_eq!(index.resolve(None, None).label(), NO_ACCOUNT_LABEL);
    }

    #[test]
    fn test_characters_of_and_class() {
        let index = owners();
        let names: Vec<&str> = index
            .characters_of("a1")
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["Aldric", "Brienne"]);
        assert_eq!(index.class_of(None, Some("dorn")), Some("Rogue"));
        assert_eq!(index.account_label("A9"), "A9");
    }
}
