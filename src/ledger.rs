//! DKP standings
//!
//! Earned = DKP of every event a character attended, spent = cost of every
//! item they bought, balance = earned - spent. Characters are keyed by id when
//! the row has one, else by name.

use std::collections::HashMap;

use crate::joins::{GroupIndex, Owner, OwnershipIndex, NO_ACCOUNT_LABEL};
use crate::models::{match_key, AttendanceRow, EventRow, LootRow};
use crate::query::{date_prefix, FieldValue, Queryable};

#[derive(Debug, Clone, PartialEq)]
pub struct Standing {
    pub char_id: Option<String>,
    pub name: String,
    pub earned: f64,
    pub spent: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountStanding {
    pub account_id: Option<String>,
    pub label: String,
    pub characters: Vec<String>,
    pub earned: f64,
    pub spent: f64,
    pub balance: f64,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn sort_by_balance<T>(items: &mut [T], balance: impl Fn(&T) -> f64, name: impl Fn(&T) -> &str) {
    items.sort_by(|a, b| {
        balance(b)
            .total_cmp(&balance(a))
            .then_with(|| name(a).to_lowercase().cmp(&name(b).to_lowercase()))
    });
}

#[derive(Default)]
struct Tally {
    char_id: Option<String>,
    name: String,
    earned: f64,
    spent: f64,
}

/// Restricts standings to raids dated on or after a day.
struct SinceFilter<'a> {
    since: Option<&'a str>,
    groups: &'a GroupIndex,
}

impl SinceFilter<'_> {
    fn allows(&self, raid_id: Option<i64>) -> bool {
        let Some(since) = self.since else {
            return true;
        };
        // undated raids are excluded once a start date is set
        raid_id
            .and_then(|id| self.groups.date_of(id))
            .map(|d| date_prefix(d) >= date_prefix(since))
            .unwrap_or(false)
    }
}

fn tally_for<'t>(
    tallies: &'t mut HashMap<String, Tally>,
    id_by_name: &HashMap<String, String>,
    char_id: Option<&str>,
    name: Option<&str>,
) -> Option<&'t mut Tally> {
    let name = name.map(str::trim).filter(|n| !n.is_empty());
    let id = char_id
        .map(str::to_string)
        .or_else(|| name.and_then(|n| id_by_name.get(&match_key(n)).cloned()));
    let key = match (&id, name) {
        (Some(id), _) => format!("id:{}", id),
        (None, Some(n)) => format!("name:{}", match_key(n)),
        (None, None) => return None,
    };
    let t = tallies.entry(key).or_default();
    if t.char_id.is_none() {
        t.char_id = id;
    }
    if let Some(n) = name {
        t.name = n.to_string();
    } else if t.name.is_empty() {
        t.name = t.char_id.clone().unwrap_or_default();
    }
    Some(t)
}

/// Per-character standings, highest balance first.
pub fn standings(
    events: &[EventRow],
    attendance: &[AttendanceRow],
    loot: &[LootRow],
    groups: &GroupIndex,
    since: Option<&str>,
) -> Vec<Standing> {
    let filter = SinceFilter { since, groups };

    let mut event_dkp: HashMap<(i64, &str), f64> = HashMap::new();
    for e in events {
        if let (Some(raid_id), Some(event_id)) = (e.raid_id, e.event_id.as_deref()) {
            event_dkp.insert((raid_id, event_id), e.dkp_value.unwrap_or(0.0));
        }
    }

    // attendance rows without an id borrow one from a row that has both
    let mut id_by_name: HashMap<String, String> = HashMap::new();
    for row in attendance {
        if let (Some(id), Some(name)) = (row.char_id.as_deref(), row.character_name.as_deref()) {
            let name = match_key(name);
            if !name.is_empty() {
                id_by_name.entry(name).or_insert_with(|| id.to_string());
            }
        }
    }

    let mut tallies: HashMap<String, Tally> = HashMap::new();

    for row in attendance {
        if !filter.allows(row.raid_id) {
            continue;
        }
        let dkp = match (row.raid_id, row.event_id.as_deref()) {
            (Some(raid_id), Some(event_id)) => {
                event_dkp.get(&(raid_id, event_id)).copied().unwrap_or(0.0)
            }
            _ => 0.0,
        };
        if let Some(t) = tally_for(
            &mut tallies,
            &id_by_name,
            row.char_id.as_deref(),
            row.character_name.as_deref(),
        ) {
            t.earned += dkp;
        }
    }

    for row in loot {
        if !filter.allows(row.raid_id) {
            continue;
        }
        if let Some(t) = tally_for(
            &mut tallies,
            &id_by_name,
            row.char_id.as_deref(),
            row.character_name.as_deref(),
        ) {
            t.spent += row.cost.unwrap_or(0.0);
        }
    }

    let mut out: Vec<Standing> = tallies
        .into_values()
        .map(|t| Standing {
            char_id: t.char_id,
            name: t.name,
            earned: round2(t.earned),
            spent: round2(t.spent),
            balance: round2(t.earned - t.spent),
        })
        .collect();
    sort_by_balance(&mut out, |s| s.balance, |s| &s.name);
    out
}

/// Roll character standings up to their accounts. Characters without an
/// account share one "(no account)" entry.
pub fn by_account(standings: &[Standing], owners: &OwnershipIndex) -> Vec<AccountStanding> {
    let mut accounts: HashMap<Option<String>, AccountStanding> = HashMap::new();
    for s in standings {
        let owner = owners.resolve(s.char_id.as_deref(), Some(s.name.as_str()));
        let (account_id, label) = match owner {
            Owner::Account { account_id, label } => (Some(account_id), label),
            Owner::Unowned => (None, NO_ACCOUNT_LABEL.to_string()),
        };
        let entry = accounts
            .entry(account_id.clone())
            .or_insert_with(|| AccountStanding {
                account_id,
                label,
                characters: Vec::new(),
                earned: 0.0,
                spent: 0.0,
                balance: 0.0,
            });
        entry.characters.push(s.name.clone());
        entry.earned += s.earned;
        entry.spent += s.spent;
    }

    let mut out: Vec<AccountStanding> = accounts
        .into_values()
        .map(|mut a| {
            a.earned = round2(a.earned);
            a.spent = round2(a.spent);
            a.balance = round2(a.earned - a.spent);
            a
        })
        .collect();
    sort_by_balance(&mut out, |a| a.balance, |a| &a.label);
    out
}

impl Queryable for Standing {
    fn field(&self, name: &str) -> FieldValue<'_> {
        match name {
            "name" | "character" => FieldValue::text(Some(self.name.as_str())),
            "earned" => FieldValue::Number(self.earned),
            "spent" => FieldValue::Number(self.spent),
            "balance" => FieldValue::Number(self.balance),
            _ => FieldValue::Missing,
        }
    }
}

impl Queryable for AccountStanding {
    fn field(&self, name: &str) -> FieldValue<'_> {
        match name {
            "name" | "account" => FieldValue::text(Some(self.label.as_str())),
            "earned" => FieldValue::Number(self.earned),
            "spent" => FieldValue::Number(self.spent),
            "balance" => FieldValue::Number(self.balance),
            _ => FieldValue::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountRow, CharacterRow, GroupSummary, MembershipRow};

    fn event(raid_id: i64, event_id: &str, dkp: f64) -> EventRow {
        EventRow {
            id: raid_id * 10 + event_id.len() as i64,
            raid_id: Some(raid_id),
            event_id: Some(event_id.into()),
            event_order: None,
            event_name: None,
            dkp_value: Some(dkp),
            event_time: None,
        }
    }

    fn attended(
        id: i64,
        raid_id: i64,
        event_id: &str,
        char_id: Option<&str>,
        name: &str,
    ) -> AttendanceRow {
        AttendanceRow {
            id,
            raid_id: Some(raid_id),
            event_id: Some(event_id.into()),
            char_id: char_id.map(str::to_string),
            character_name: Some(name.into()),
        }
    }

    fn bought(id: i64, raid_id: i64, char_id: Option<&str>, name: &str, cost: f64) -> LootRow {
        LootRow {
            id,
            raid_id: Some(raid_id),
            event_id: None,
            item_name: "Item".into(),
            char_id: char_id.map(str::to_string),
            character_name: Some(name.into()),
            cost: Some(cost),
            assigned_char_id: None,
            assigned_character_name: None,
        }
    }

    fn groups() -> GroupIndex {
        GroupIndex::new(vec![
            GroupSummary {
                group_id: 1,
                name: "Plane of Fear".into(),
                date: Some("2024-01-10".into()),
            },
            GroupSummary {
                group_id: 2,
                name: "Plane of Hate".into(),
                date: Some("2024-02-10T20:00:00".into()),
            },
        ])
    }

    fn fixture() -> (Vec<EventRow>, Vec<AttendanceRow>, Vec<LootRow>) {
        let events = vec![event(1, "1", 10.0), event(1, "2", 5.0), event(2, "1", 20.0)];
        let attendance = vec![
            attended(1, 1, "1", Some("101"), "Aldric"),
            attended(2, 1, "2", None, "Aldric"),
            attended(3, 2, "1", Some("101"), "Aldric"),
            attended(4, 1, "1", Some("102"), "Brienne"),
            attended(5, 2, "1", None, "Cato"),
        ];
        let loot = vec![
            bought(1, 1, Some("101"), "Aldric", 12.0),
            bought(2, 2, None, "Cato", 25.0),
        ];
        (events, attendance, loot)
    }

    #[test]
    fn test_earned_spent_balance() {
        let (events, attendance, loot) = fixture();
        let out = standings(&events, &attendance, &loot, &groups(), None);

        let names: Vec<&str> = out.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Aldric", "Brienne", "Cato"]);

        let aldric = &out[0];
        assert_eq!(aldric.char_id.as_deref(), Some("101"));
        // the id-less row joins the same character through its name
        assert_eq!(aldric.earned, 35.0);
        assert_eq!(aldric.spent, 12.0);
        assert_eq!(aldric.balance, 23.0);

        let cato = &out[2];
        assert_eq!(cato.char_id, None);
        assert_eq!(cato.balance, -5.0);
    }

    #[test]
    fn test_since_restricts_to_later_raids() {
        let (events, attendance, loot) = fixture();
        let out = standings(&events, &attendance, &loot, &groups(), Some("2024-02-01"));
        let aldric = out.iter().find(|s| s.name == "Aldric").unwrap();
        assert_eq!(aldric.earned, 20.0);
        assert_eq!(aldric.spent, 0.0);
        assert!(out.iter().all(|s| s.name != "Brienne"));
    }

    #[test]
    fn test_balance_sort_tolerates_nan() {
        let mut rows: Vec<Standing> = (0..40)
            .map(|i| Standing {
                char_id: None,
                name: format!("Toon{:02}", i),
                earned: 0.0,
                spent: 0.0,
                balance: if i % 5 == 0 { f64::NAN } else { (i % 13) as f64 },
            })
            .collect();
        sort_by_balance(&mut rows, |s| s.balance, |s| &s.name);

        let finite: Vec<f64> = rows
            .iter()
            .map(|s| s.balance)
            .filter(|b| !b.is_nan())
            .collect();
        assert_eq!(finite.len(), 32);
        assert!(finite.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_account_rollup() {
        let (events, attendance, loot) = fixture();
        let out = standings(&events, &attendance, &loot, &groups(), None);
        let owners = OwnershipIndex::build(
            &[
                CharacterRow {
                    char_id: "101".into(),
                    name: "Aldric".into(),
                    class_name: None,
                },
                CharacterRow {
                    char_id: "102".into(),
                    name: "Brienne".into(),
                    class_name: None,
                },
            ],
            &[AccountRow {
                account_id: "A1".into(),
                display_name: Some("Big Al".into()),
                toon_names: None,
            }],
            &[
                MembershipRow {
                    char_id: "101".into(),
                    account_id: "A1".into(),
                },
                MembershipRow {
                    char_id: "102".into(),
                    account_id: "A1".into(),
                },
            ],
        );

        let rolled = by_account(&out, &owners);
        assert_eq!(rolled.len(), 2);
        assert_eq!(rolled[0].label, "Big Al");
        assert_eq!(rolled[0].balance, 33.0);
        assert_eq!(rolled[0].characters.len(), 2);
        assert_eq!(rolled[1].label, NO_ACCOUNT_LABEL);
        assert_eq!(rolled[1].account_id, None);
    }
}
