use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// A row of an append-only remote table.
///
/// Ids are unique and strictly increasing in insertion order; the parent
/// reference points at a raid (`raids.raid_id`).
pub trait DatasetRow: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Remote table name.
    const TABLE: &'static str;
    /// PostgREST `select` list.
    const COLUMNS: &'static str;

    fn row_id(&self) -> i64;
    fn parent_id(&self) -> Option<i64>;
}

/// One loot purchase (`raid_loot`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LootRow {
    pub id: i64,
    #[serde(default)]
    pub raid_id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub item_name: String,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub char_id: Option<String>,
    #[serde(default)]
    pub character_name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub cost: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub assigned_char_id: Option<String>,
    #[serde(default)]
    pub assigned_character_name: Option<String>,
}

impl DatasetRow for LootRow {
    const TABLE: &'static str = "raid_loot";
    const COLUMNS: &'static str = "id,raid_id,event_id,item_name,char_id,character_name,cost,\
                                   assigned_char_id,assigned_character_name";

    fn row_id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> Option<i64> {
        self.raid_id
    }
}

/// Per-event attendance (`raid_event_attendance`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRow {
    pub id: i64,
    #[serde(default)]
    pub raid_id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub event_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub char_id: Option<String>,
    #[serde(default)]
    pub character_name: Option<String>,
}

impl DatasetRow for AttendanceRow {
    const TABLE: &'static str = "raid_event_attendance";
    const COLUMNS: &'static str = "id,raid_id,event_id,char_id,character_name";

    fn row_id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> Option<i64> {
        self.raid_id
    }
}

/// A DKP-awarding raid event (`raid_events`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: i64,
    #[serde(default)]
    pub raid_id: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event_order: Option<i64>,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub dkp_value: Option<f64>,
    #[serde(default)]
    pub event_time: Option<String>,
}

impl DatasetRow for EventRow {
    const TABLE: &'static str = "raid_events";
    const COLUMNS: &'static str =
        "id,raid_id,event_id,event_order,event_name,dkp_value,event_time";

    fn row_id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> Option<i64> {
        self.raid_id
    }
}

/// Officer audit log entry (`officer_audit_log`). Not attached to a raid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRow {
    pub id: i64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub actor_display_name: Option<String>,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub delta: Option<serde_json::Value>,
}

impl DatasetRow for AuditRow {
    const TABLE: &'static str = "officer_audit_log";
    const COLUMNS: &'static str =
        "id,created_at,actor_display_name,action,target_type,target_id,delta";

    fn row_id(&self) -> i64 {
        self.id
    }

    fn parent_id(&self) -> Option<i64> {
        None
    }
}

/// Raid header (`raids`), the group every row points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    #[serde(rename = "raid_id")]
    pub group_id: i64,
    #[serde(rename = "raid_name", default)]
    pub name: String,
    #[serde(rename = "date_iso", default)]
    pub date: Option<String>,
}

impl GroupSummary {
    pub const TABLE: &'static str = "raids";
    pub const KEY_COLUMN: &'static str = "raid_id";
    pub const COLUMNS: &'static str = "raid_id,raid_name,date_iso";
}

/// Character (`characters`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterRow {
    #[serde(deserialize_with = "de_string")]
    pub char_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub class_name: Option<String>,
}

/// Account (`accounts`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRow {
    #[serde(deserialize_with = "de_string")]
    pub account_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Comma separated character names, main first.
    #[serde(default)]
    pub toon_names: Option<String>,
}

/// Character to account link (`character_account`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MembershipRow {
    #[serde(deserialize_with = "de_string")]
    pub char_id: String,
    #[serde(deserialize_with = "de_string")]
    pub account_id: String,
}

/// Raid classified by the mobs whose loot dropped in it (`raid_classifications`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRow {
    pub raid_id: i64,
    #[serde(default)]
    pub mob: String,
    #[serde(default)]
    pub zone: Option<String>,
}

/// Small tables without a monotonic id, loaded whole.
pub trait ReferenceRow: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: &'static str;
    const COLUMNS: &'static str;
    /// Column that gives paging a stable order.
    const KEY: &'static str;
}

impl ReferenceRow for CharacterRow {
    const TABLE: &'static str = "characters";
    const COLUMNS: &'static str = "char_id,name,class_name";
    const KEY: &'static str = "char_id";
}

impl ReferenceRow for AccountRow {
    const TABLE: &'static str = "accounts";
    const COLUMNS: &'static str = "account_id,display_name,toon_names";
    const KEY: &'static str = "account_id";
}

impl ReferenceRow for MembershipRow {
    const TABLE: &'static str = "character_account";
    const COLUMNS: &'static str = "char_id,account_id";
    const KEY: &'static str = "char_id";
}

impl ReferenceRow for ClassificationRow {
    const TABLE: &'static str = "raid_classifications";
    const COLUMNS: &'static str = "raid_id,mob,zone";
    const KEY: &'static str = "raid_id";
}

// PostgREST returns text or numeric columns depending on the table DDL; ids
// and amounts are accepted in either form.

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Str(String),
    Int(i64),
    Float(f64),
}

fn de_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match StringOrNumber::deserialize(d)? {
        StringOrNumber::Str(s) => s.trim().to_string(),
        StringOrNumber::Int(i) => i.to_string(),
        StringOrNumber::Float(f) => format_id_float(f),
    })
}

fn de_opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<StringOrNumber>::deserialize(d)? {
        None => None,
        Some(StringOrNumber::Str(s)) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Some(StringOrNumber::Int(i)) => Some(i.to_string()),
        Some(StringOrNumber::Float(f)) => Some(format_id_float(f)),
    })
}

fn de_opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let value = match Option::<StringOrNumber>::deserialize(d)? {
        None => None,
        Some(StringOrNumber::Str(s)) => s.trim().parse::<f64>().ok(),
        Some(StringOrNumber::Int(i)) => Some(i as f64),
        Some(StringOrNumber::Float(f)) => Some(f),
    };
    // numeric NaN/Infinity arrive as text; treat them as missing
    Ok(value.filter(|f| f.is_finite()))
}

// "123.0" ids come from float columns; keep them as "123".
fn format_id_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        (f as i64).to_string()
    } else {
        f.to_string()
    }
}

/// Lookup key for names typed by hand: whitespace collapsed, case-folded.
pub fn match_key(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub cache_db_path: String,
    pub snapshot_ttl: Duration,
    pub page_size: usize,
    pub max_full_pages: usize,
    pub max_incremental_pages: usize,
    pub in_chunk_size: usize,
    pub http_timeout: Duration,
    pub item_sources_path: String,
    pub item_overrides_path: Option<String>,
    pub verify_row_count: bool,
    /// Reload every dataset in full on its first reconcile in a process.
    pub full_reload_on_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_key: None,
            cache_db_path: "./raid_ledger_cache.db".to_string(),
            snapshot_ttl: Duration::from_secs(6 * 3600),
            page_size: 1000,
            max_full_pages: 500,
            max_incremental_pages: 20,
            in_chunk_size: 200,
            http_timeout: Duration::from_secs(30),
            item_sources_path: "./item_sources.json".to_string(),
            item_overrides_path: None,
            verify_row_count: true,
            full_reload_on_start: true,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();

        let supabase_url = std::env::var("SUPABASE_URL")
            .ok()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty());

        // Service role first, anon key if RLS allows reads.
        let supabase_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                std::env::var("SUPABASE_ANON_KEY")
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            });

        let cache_db_path =
            std::env::var("CACHE_DB_PATH").unwrap_or_else(|_| defaults.cache_db_path.clone());

        let snapshot_ttl = std::env::var("SNAPSHOT_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.snapshot_ttl);

        let page_size = env_usize("PAGE_SIZE").unwrap_or(defaults.page_size);
        let max_full_pages = env_usize("MAX_FULL_PAGES").unwrap_or(defaults.max_full_pages);
        let max_incremental_pages =
            env_usize("MAX_INCREMENTAL_PAGES").unwrap_or(defaults.max_incremental_pages);
        let in_chunk_size = env_usize("IN_CHUNK_SIZE").unwrap_or(defaults.in_chunk_size);

        let http_timeout = std::env::var("HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.http_timeout);

        let item_sources_path = std::env::var("ITEM_SOURCES_PATH")
            .unwrap_or_else(|_| defaults.item_sources_path.clone());
        let item_overrides_path = std::env::var("ITEM_OVERRIDES_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let verify_row_count = env_flag("VERIFY_ROW_COUNT").unwrap_or(defaults.verify_row_count);
        let full_reload_on_start =
            env_flag("FULL_RELOAD_ON_START").unwrap_or(defaults.full_reload_on_start);

        Ok(Self {
            supabase_url,
            supabase_key,
            cache_db_path,
            snapshot_ttl,
            page_size,
            max_full_pages,
            max_incremental_pages,
            in_chunk_size,
            http_timeout,
            item_sources_path,
            item_overrides_path,
            verify_row_count,
            full_reload_on_start,
        })
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "off" | "no"))
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&v| v > 0)
}
