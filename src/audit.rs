//! Officer audit log rendering
//!
//! `officer_audit_log.action` is free text written by the officer tools; it is
//! decoded into an `AuditAction` once, and every kind has one rendering rule
//! over the row's JSON `delta`.

use serde_json::Value;

use crate::models::AuditRow;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuditAction {
    AddLoot,
    DeleteLoot,
    EditLootCost,
    AssignLoot,
    AddRaid,
    DeleteRaid,
    EditRaid,
    AddEvent,
    DeleteEvent,
    EditEventDkp,
    AddAttendee,
    RemoveAttendee,
    LinkCharacter,
    UnlinkCharacter,
    Other(String),
}

/// Accepted spellings for each known kind.
const ACTION_NAMES: &[(&str, AuditAction)] = &[
    ("add_loot", AuditAction::AddLoot),
    ("loot_add", AuditAction::AddLoot),
    ("delete_loot", AuditAction::DeleteLoot),
    ("remove_loot", AuditAction::DeleteLoot),
    ("edit_loot_cost", AuditAction::EditLootCost),
    ("update_loot_cost", AuditAction::EditLootCost),
    ("assign_loot", AuditAction::AssignLoot),
    ("add_raid", AuditAction::AddRaid),
    ("delete_raid", AuditAction::DeleteRaid),
    ("edit_raid", AuditAction::EditRaid),
    ("update_raid", AuditAction::EditRaid),
    ("add_event", AuditAction::AddEvent),
    ("add_tic", AuditAction::AddEvent),
    ("delete_event", AuditAction::DeleteEvent),
    ("delete_tic", AuditAction::DeleteEvent),
    ("edit_event_dkp", AuditAction::EditEventDkp),
    ("edit_tic_dkp", AuditAction::EditEventDkp),
    ("add_attendee", AuditAction::AddAttendee),
    ("add_attendance", AuditAction::AddAttendee),
    ("remove_attendee", AuditAction::RemoveAttendee),
    ("delete_attendance", AuditAction::RemoveAttendee),
    ("link_character", AuditAction::LinkCharacter),
    ("add_character_account", AuditAction::LinkCharacter),
    ("unlink_character", AuditAction::UnlinkCharacter),
    ("remove_character_account", AuditAction::UnlinkCharacter),
];

impl AuditAction {
    pub fn parse(action: &str) -> Self {
        let normalized: String = action
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' || c == '.' { '_' } else { c })
            .collect();
        ACTION_NAMES
            .iter()
            .find(|(name, _)| *name == normalized)
            .map(|(_, kind)| kind.clone())
            .unwrap_or_else(|| AuditAction::Other(action.trim().to_string()))
    }

    pub fn title(&self) -> &str {
        match self {
            AuditAction::AddLoot => "Loot added",
            AuditAction::DeleteLoot => "Loot deleted",
            AuditAction::EditLootCost => "Loot cost changed",
            AuditAction::AssignLoot => "Loot assigned",
            AuditAction::AddRaid => "Raid added",
            AuditAction::DeleteRaid => "Raid deleted",
            AuditAction::EditRaid => "Raid edited",
            AuditAction::AddEvent => "Tic added",
            AuditAction::DeleteEvent => "Tic deleted",
            AuditAction::EditEventDkp => "Tic DKP changed",
            AuditAction::AddAttendee => "Attendee added",
            AuditAction::RemoveAttendee => "Attendee removed",
            AuditAction::LinkCharacter => "Character linked",
            AuditAction::UnlinkCharacter => "Character unlinked",
            AuditAction::Other(raw) => raw,
        }
    }
}

// First present, non-empty value among `keys`, rendered as text.
fn pick(delta: Option<&Value>, keys: &[&str]) -> Option<String> {
    let obj = delta?.as_object()?;
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(
            n.as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| format!("{}", f as i64))
                .unwrap_or_else(|| n.to_string()),
        ),
        other => Some(other.to_string()),
    })
}

// `{"cost": {"old": 5, "new": 10}}` or `{"old_cost": 5, "new_cost": 10}`.
fn change(delta: Option<&Value>, field: &str) -> (Option<String>, Option<String>) {
    let nested = delta.and_then(|d| d.get(field)).filter(|v| v.is_object());
    if nested.is_some() {
        return (pick(nested, &["old", "from"]), pick(nested, &["new", "to"]));
    }
    let old_key = format!("old_{}", field);
    let new_key = format!("new_{}", field);
    (
        pick(delta, &[old_key.as_str()]),
        pick(delta, &[new_key.as_str(), field]),
    )
}

fn or_unknown(v: Option<String>) -> String {
    v.unwrap_or_else(|| "?".to_string())
}

fn render_change(what: &str, (old, new): (Option<String>, Option<String>)) -> String {
    match (old, new) {
        (Some(o), Some(n)) => format!("{} {} → {}", what, o, n),
        (None, Some(n)) => format!("{} → {}", what, n),
        (Some(o), None) => format!("{} was {}", what, o),
        (None, None) => what.to_string(),
    }
}

fn compact(delta: Option<&Value>) -> Option<String> {
    let text = delta.filter(|d| !d.is_null())?.to_string();
    if text.chars().count() > 120 {
        Some(format!("{}…", text.chars().take(119).collect::<String>()))
    } else {
        Some(text)
    }
}

const ITEM: &[&str] = &["item_name", "item"];
const CHARACTER: &[&str] = &["character_name", "char_name", "name"];
const RAID: &[&str] = &["raid_name", "raid_id"];
const EVENT: &[&str] = &["event_name", "event_id"];

/// One-line description of what an audit row changed.
pub fn details_label(row: &AuditRow) -> String {
    let d = row.delta.as_ref();
    match AuditAction::parse(&row.action) {
        AuditAction::AddLoot => format!(
            "{} to {} for {} DKP",
            or_unknown(pick(d, ITEM)),
            or_unknown(pick(d, CHARACTER)),
            or_unknown(pick(d, &["cost"])),
        ),
        AuditAction::DeleteLoot => format!(
            "{} from {}",
            or_unknown(pick(d, ITEM)),
            or_unknown(pick(d, CHARACTER)),
        ),
        AuditAction::EditLootCost => format!(
            "{}: {}",
            or_unknown(pick(d, ITEM)),
            render_change("cost", change(d, "cost")),
        ),
        AuditAction::AssignLoot => format!(
            "{} → {}",
            or_unknown(pick(d, ITEM)),
            or_unknown(pick(d, &["assigned_character_name", "assigned_to", "character_name"])),
        ),
        AuditAction::AddRaid | AuditAction::DeleteRaid => {
            let raid = or_unknown(pick(d, RAID));
            match pick(d, &["date_iso", "date"]) {
                Some(date) => format!("{} ({})", raid, date),
                None => raid,
            }
        }
        AuditAction::EditRaid => format!(
            "{}: {}",
            or_unknown(pick(d, &["raid_id"])),
            render_change("name", change(d, "raid_name")),
        ),
        AuditAction::AddEvent | AuditAction::DeleteEvent => format!(
            "{} in {} ({} DKP)",
            or_unknown(pick(d, EVENT)),
            or_unknown(pick(d, RAID)),
            or_unknown(pick(d, &["dkp_value", "dkp"])),
        ),
        AuditAction::EditEventDkp => format!(
            "{}: {}",
            or_unknown(pick(d, EVENT)),
            render_change("DKP", change(d, "dkp_value")),
        ),
        AuditAction::AddAttendee | AuditAction::RemoveAttendee => format!(
            "{} @ {}",
            or_unknown(pick(d, CHARACTER)),
            or_unknown(pick(d, EVENT).or_else(|| pick(d, RAID))),
        ),
        AuditAction::LinkCharacter | AuditAction::UnlinkCharacter => format!(
            "{} ↔ {}",
            or_unknown(pick(d, CHARACTER).or_else(|| pick(d, &["char_id"]))),
            or_unknown(pick(d, &["account_name", "display_name", "account_id"])),
        ),
        AuditAction::Other(_) => compact(d)
            .or_else(|| {
                let target = row.target_type.as_deref()?;
                Some(match row.target_id.as_deref() {
                    Some(id) => format!("{} {}", target, id),
                    None => target.to_string(),
                })
            })
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(action: &str, delta: Value) -> AuditRow {
        AuditRow {
            id: 1,
            created_at: Some("2024-03-01T20:00:00Z".into()),
            actor_display_name: Some("Officer".into()),
            action: action.into(),
            target_type: Some("raid_loot".into()),
            target_id: Some("55".into()),
            delta: Some(delta),
        }
    }

    #[test]
    fn test_parse_spellings() {
        assert_eq!(AuditAction::parse("add_loot"), AuditAction::AddLoot);
        assert_eq!(AuditAction::parse(" Add-Tic "), AuditAction::AddEvent);
        assert_eq!(AuditAction::parse("edit tic dkp"), AuditAction::EditEventDkp);
        assert_eq!(
            AuditAction::parse("bulk_import"),
            AuditAction::Other("bulk_import".into())
        );
        assert_eq!(AuditAction::parse("bulk_import").title(), "bulk_import");
    }

    #[test]
    fn test_every_known_spelling_round_trips() {
        for (name, kind) in ACTION_NAMES {
            assert_eq!(&AuditAction::parse(name), kind);
            assert!(!matches!(kind, AuditAction::Other(_)));
        }
    }

    #[test]
    fn test_add_loot_label() {
        let r = row(
            "add_loot",
            json!({"item_name": "Mithril Helm", "character_name": "Aldric", "cost": 30.0}),
        );
        assert_eq!(details_label(&r), "Mithril Helm to Aldric for 30 DKP");
    }

    #[test]
    fn test_cost_change_label() {
        let nested = row(
            "edit_loot_cost",
            json!({"item_name": "Amulet", "cost": {"old": 5, "new": 10}}),
        );
        assert_eq!(details_label(&nested), "Amulet: cost 5 → 10");

        let flat = row("edit_loot_cost", json!({"item": "Amulet", "old_cost": 5, "new_cost": 7.5}));
        assert_eq!(details_label(&flat), "Amulet: cost 5 → 7.5");
    }

    #[test]
    fn test_missing_fields_render_placeholder() {
        let r = row("delete_loot", json!({}));
        assert_eq!(details_label(&r), "? from ?");
    }

    #[test]
    fn test_unknown_action_falls_back() {
        let r = row("bulk_import", json!({"rows": 3}));
        assert_eq!(details_label(&r), "{\"rows\":3}");

        let mut bare = row("bulk_import", Value::Null);
        bare.delta = None;
        assert_eq!(details_label(&bare), "raid_loot 55");
    }
}
