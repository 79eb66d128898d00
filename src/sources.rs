//! Item drop sources
//!
//! `item_sources.json` maps an item name to every mob (and zone) known to drop
//! it. Many items drop from several mobs, so the raid the item was bought in
//! is used to pick the most likely one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use crate::models::{match_key, ClassificationRow};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCandidate {
    pub mob: String,
    #[serde(default)]
    pub zone: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(SourceCandidate),
    Many(Vec<SourceCandidate>),
}

#[derive(Debug, Default, Deserialize)]
struct SourceOverrides {
    /// Item → the one mob it is known to come from.
    #[serde(default)]
    classifications: HashMap<String, SourceCandidate>,
    /// Misspelled item name → canonical name.
    #[serde(default)]
    aliases: HashMap<String, String>,
}

/// Mob names appear as `#Coirnav_the_Avatar_of_Water|`, `Coirnav the Avatar
/// of Water` and everything in between.
pub fn mob_key(mob: &str) -> String {
    let s = mob.trim();
    let s = s.strip_prefix('#').unwrap_or(s);
    let s = s.strip_suffix('|').unwrap_or(s);
    match_key(&s.replace('_', " "))
}

/// Normalized item name → drop candidates, in file order.
#[derive(Debug, Clone, Default)]
pub struct OriginIndex {
    by_item: HashMap<String, Vec<SourceCandidate>>,
}

impl OriginIndex {
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: HashMap<String, OneOrMany> =
            serde_json::from_str(text).context("parse item sources")?;
        let mut by_item: HashMap<String, Vec<SourceCandidate>> = HashMap::new();
        // sort for a stable merge order across differently-cased duplicates
        let mut entries: Vec<(String, OneOrMany)> = raw.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (item, sources) in entries {
            let key = match_key(&item);
            if key.is_empty() {
                continue;
            }
            let sources = match sources {
                OneOrMany::One(c) => vec![c],
                OneOrMany::Many(v) => v,
            };
            let merged = by_item.entry(key).or_default();
            for mut c in sources {
                c.mob = c.mob.trim().to_string();
                c.zone = c.zone.trim().to_string();
                if c.mob.is_empty() && c.zone.is_empty() {
                    continue;
                }
                if !merged.contains(&c) {
                    merged.push(c);
                }
            }
        }
        by_item.retain(|_, v| !v.is_empty());
        Ok(Self { by_item })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read item sources {}", path.display()))?;
        let index = Self::from_json(&text)?;
        info!(path = %path.display(), items = index.len(), "item sources loaded");
        Ok(index)
    }

    /// Apply an overrides file: `classifications` pin an item to a single
    /// source, `aliases` point a misspelled name at a canonical one.
    pub fn apply_overrides(&mut self, text: &str) -> Result<()> {
        let overrides: SourceOverrides =
            serde_json::from_str(text).context("parse item source overrides")?;

        for (item, c) in overrides.classifications {
            if c.mob.trim().is_empty() {
                continue;
            }
            self.by_item.insert(
                match_key(&item),
                vec![SourceCandidate {
                    mob: c.mob.trim().to_string(),
                    zone: c.zone.trim().to_string(),
                }],
            );
        }
        for (typo, canonical) in overrides.aliases {
            if let Some(sources) = self.by_item.get(&match_key(&canonical)).cloned() {
                self.by_item.insert(match_key(&typo), sources);
            }
        }
        Ok(())
    }

    pub async fn load_overrides(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read item source overrides {}", path.display()))?;
        self.apply_overrides(&text)
    }

    pub fn candidates(&self, item_name: &str) -> &[SourceCandidate] {
        self.by_item
            .get(&match_key(item_name))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_item.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_item.is_empty()
    }
}

/// Raid → mobs its loot was classified under (`raid_classifications`).
#[derive(Debug, Clone, Default)]
pub struct GroupOrigins {
    by_group: HashMap<i64, HashSet<String>>,
}

impl GroupOrigins {
    pub fn from_rows(rows: &[ClassificationRow]) -> Self {
        let mut by_group: HashMap<i64, HashSet<String>> = HashMap::new();
        for r in rows {
            let mob = mob_key(&r.mob);
            if !mob.is_empty() {
                by_group.entry(r.raid_id).or_default().insert(mob);
            }
        }
        Self { by_group }
    }

    pub fn origins_of(&self, group_id: i64) -> Option<&HashSet<String>> {
        self.by_group.get(&group_id).filter(|s| !s.is_empty())
    }
}

/// Raid-name keywords and the zone or mob substrings they point at.
pub struct KeywordSet {
    pub keywords: &'static [&'static str],
    pub prefer: &'static [&'static str],
}

/// Checked in order; the first set with a keyword in the raid name decides.
pub const ZONE_KEYWORDS: &[KeywordSet] = &[
    KeywordSet { keywords: &["water"], prefer: &["water", "coirnav"] },
    KeywordSet { keywords: &["fire"], prefer: &["fire", "fennin"] },
    KeywordSet { keywords: &["earth"], prefer: &["earth", "rathe"] },
    KeywordSet { keywords: &["air"], prefer: &["air", "xegony"] },
    KeywordSet { keywords: &["time", "potime"], prefer: &["time", "quarm"] },
    KeywordSet { keywords: &["fear"], prefer: &["fear", "cazic"] },
    KeywordSet { keywords: &["hate"], prefer: &["hate", "innoruuk"] },
    KeywordSet { keywords: &["torment"], prefer: &["torment", "saryrn"] },
    KeywordSet { keywords: &["valor"], prefer: &["valor", "mithaniel"] },
    KeywordSet { keywords: &["storms", "thunder"], prefer: &["storms", "thunder", "karana"] },
    KeywordSet { keywords: &["justice"], prefer: &["justice", "tribunal"] },
    KeywordSet { keywords: &["nightmare"], prefer: &["nightmare", "terris"] },
    KeywordSet { keywords: &["disease"], prefer: &["disease", "bertoxxulous"] },
    KeywordSet { keywords: &["innovation"], prefer: &["innovation", "manaetic"] },
    KeywordSet { keywords: &["vex thal", "vt"], prefer: &["vex thal", "aten ha ra"] },
    KeywordSet { keywords: &["ssra", "ssraeshza", "emp"], prefer: &["ssraeshza", "emperor"] },
    KeywordSet { keywords: &["sky", "veeshan"], prefer: &["sky", "veeshan"] },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Basis {
    /// Only one known source.
    Single,
    /// The raid was classified under this mob.
    GroupOrigin,
    /// The raid name pointed at this zone.
    ZoneKeyword,
    /// Nothing matched; first listed source.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMatch {
    pub candidate: SourceCandidate,
    pub basis: Basis,
}

pub struct SourceDisambiguator {
    index: OriginIndex,
    keywords: &'static [KeywordSet],
}

impl SourceDisambiguator {
    pub fn new(index: OriginIndex) -> Self {
        Self {
            index,
            keywords: ZONE_KEYWORDS,
        }
    }

    pub fn index(&self) -> &OriginIndex {
        &self.index
    }

    /// Most likely drop source of `item_name` bought in the given raid.
    pub fn disambiguate(
        &self,
        item_name: &str,
        group_id: Option<i64>,
        group_name: Option<&str>,
        origins: &GroupOrigins,
    ) -> Option<SourceMatch> {
        let candidates = self.index.candidates(item_name);
        let hit = |c: &SourceCandidate, basis| {
            Some(SourceMatch {
                candidate: c.clone(),
                basis,
            })
        };

        match candidates {
            [] => return None,
            [only] => return hit(only, Basis::Single),
            _ => {}
        }

        if let Some(known) = group_id.and_then(|id| origins.origins_of(id)) {
            if let Some(c) = candidates.iter().find(|c| known.contains(&mob_key(&c.mob))) {
                return hit(c, Basis::GroupOrigin);
            }
        }

        if let Some(name) = group_name {
            let words = format!(" {} ", word_key(name));
            let set = self
                .keywords
                .iter()
                .find(|set| set.keywords.iter().any(|k| words.contains(&format!(" {} ", k))));
            if let Some(set) = set {
                let found = candidates.iter().find(|c| {
                    let zone = match_key(&c.zone);
                    let mob = mob_key(&c.mob);
                    set.prefer.iter().any(|p| zone.contains(p) || mob.contains(p))
                });
                if let Some(c) = found {
                    return hit(c, Basis::ZoneKeyword);
                }
            }
        }

        debug!(item = item_name, candidates = candidates.len(), "no source hint, using first");
        hit(&candidates[0], Basis::Fallback)
    }
}

// Raid names are free text ("PoWater - Coirnav (2nd try)"); keep letters and
// digits so keywords match on word boundaries.
fn word_key(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    match_key(&cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_index() -> OriginIndex {
        OriginIndex::from_json(
            r#"{
                "Ring of X": [
                    {"mob": "Mob A", "zone": "Water"},
                    {"mob": "Mob B", "zone": "Fire"}
                ],
                "Mithril Helm": {"mob": "Smith", "zone": "Forge"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_keyword_picks_zone_candidate() {
        let d = SourceDisambiguator::new(ring_index());
        let m = d
            .disambiguate(
                "Ring of X",
                Some(1),
                Some("Plane of Water Raid"),
                &GroupOrigins::default(),
            )
            .unwrap();
        assert_eq!(m.candidate.zone, "Water");
        assert_eq!(m.basis, Basis::ZoneKeyword);
    }

    #[test]
    fn test_no_keyword_falls_back_to_first() {
        let d = SourceDisambiguator::new(ring_index());
        let m = d
            .disambiguate("ring of x", Some(1), Some("Tuesday Raid"), &GroupOrigins::default())
            .unwrap();
        assert_eq!(m.candidate.mob, "Mob A");
        assert_eq!(m.basis, Basis::Fallback);
    }

    #[test]
    fn test_keyword_needs_whole_word() {
        // "Fairy" must not trigger the air set
        let d = SourceDisambiguator::new(
            OriginIndex::from_json(
                r#"{"Gem": [{"mob": "Gnome", "zone": "Earth"}, {"mob": "Xegony", "zone": "Air"}]}"#,
            )
            .unwrap(),
        );
        let m = d
            .disambiguate("Gem", None, Some("Fairy Hunt"), &GroupOrigins::default())
            .unwrap();
        assert_eq!(m.basis, Basis::Fallback);
    }

    #[test]
    fn test_group_origin_beats_keyword() {
        let d = SourceDisambiguator::new(ring_index());
        let origins = GroupOrigins::from_rows(&[ClassificationRow {
            raid_id: 7,
            mob: "#Mob_B|".into(),
            zone: Some("Fire".into()),
        }]);
        let m = d
            .disambiguate("Ring of X", Some(7), Some("Plane of Water Raid"), &origins)
            .unwrap();
        assert_eq!(m.candidate.mob, "Mob B");
        assert_eq!(m.basis, Basis::GroupOrigin);
    }

    #[test]
    fn test_single_and_missing() {
        let d = SourceDisambiguator::new(ring_index());
        let m = d
            .disambiguate("  MITHRIL   helm ", None, None, &GroupOrigins::default())
            .unwrap();
        assert_eq!(m.basis, Basis::Single);
        assert!(d
            .disambiguate("Unknown Item", None, None, &GroupOrigins::default())
            .is_none());
    }

    #[test]
    fn test_duplicate_keys_merge() {
        let index = OriginIndex::from_json(
            r#"{
                "Essence of Water": [{"mob": "Coirnav", "zone": "Plane of Water"}],
                "essence of water": [
                    {"mob": "Coirnav", "zone": "Plane of Water"},
                    {"mob": "Anar", "zone": "Plane of Time"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.candidates("Essence of Water").len(), 2);
    }

    #[test]
    fn test_overrides_and_aliases() {
        let mut index = ring_index();
        index
            .apply_overrides(
                r#"{
                    "classifications": {"Ring of X": {"mob": "Mob B", "zone": "Fire"}},
                    "aliases": {"Mithrll Helm": "Mithril Helm"}
                }"#,
            )
            .unwrap();
        assert_eq!(
            index.candidates("Ring of X"),
            &[SourceCandidate {
                mob: "Mob B".into(),
                zone: "Fire".into()
            }]
        );
        assert_eq!(index.candidates("mithrll helm")[0].mob, "Smith");
    }

    #[test]
    fn test_mob_key_normalization() {
        assert_eq!(mob_key("#Coirnav_the_Avatar_of_Water|"), "coirnav the avatar of water");
        assert_eq!(mob_key("  Coirnav the Avatar of Water "), "coirnav the avatar of water");
    }
}
