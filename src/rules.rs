use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::Result;

const CACHE_TTL: Duration = Duration::from_secs(120);

/// A single predicate against one field of a [`RuleContext`] (§4.8/§4.9 Rule
/// Engine). `Any` matches regardless of the field's value.
#[derive(Debug, Clone)]
pub enum Predicate {
    Any,
    Equals(String),
    OneOf(Vec<String>),
    TriState(Option<bool>),
    IntEquals(i64),
    Range(f64, f64),
}

impl Predicate {
    fn matches_text(&self, value: &str) -> bool {
        match self {
            Predicate::Any => true,
            Predicate::Equals(expected) => expected.eq_ignore_ascii_case(value),
            Predicate::OneOf(set) => set.iter().any(|v| v.eq_ignore_ascii_case(value)),
            Predicate::TriState(_) | Predicate::IntEquals(_) | Predicate::Range(_, _) => false,
        }
    }

    fn matches_bool(&self, value: Option<bool>) -> bool {
        match self {
            Predicate::Any => true,
            Predicate::TriState(expected) => *expected == value,
            _ => false,
        }
    }

    fn matches_int(&self, value: Option<i64>) -> bool {
        match self {
            Predicate::Any => true,
            Predicate::IntEquals(expected) => value == Some(*expected),
            _ => false,
        }
    }

    /// Range predicates require a present context value; `Any` matches
    /// regardless, including when the context value is absent.
    fn matches_number(&self, value: Option<f64>) -> bool {
        match self {
            Predicate::Any => true,
            Predicate::Range(lo, hi) => value.is_some_and(|v| v >= *lo && v <= *hi),
            _ => false,
        }
    }
}

/// Scope a rule is eligible to fire in (§4.9 "Scope: Import | Edit | Both").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Import,
    Edit,
    Both,
}

impl Scope {
    fn matches(self, requested: Scope) -> bool {
        self == Scope::Both || self == requested
    }
}

/// Whether a matched rule's outcome applies only to the triggering row or
/// to both sides of a matched pair (§4.9 "ApplyTo: Self | Both").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyTo {
    SelfOnly,
    Both,
}

impl Default for ApplyTo {
    fn default() -> Self {
        ApplyTo::SelfOnly
    }
}

/// Normalized snapshot of a reconciliation row used to evaluate truth
/// rules (§3 "RuleContext"). Text fields are uppercased and trimmed, sign
/// is normalized to 'D'/'C', and guarantee-type synonyms are collapsed
/// (§9 decision: REISSU*/ISSU*/NOTIF*|ADVISING* families).
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub is_pivot: Option<bool>,
    pub booking: Option<String>,
    pub guarantee_type: Option<String>,
    pub transaction_type: Option<String>,
    pub sign: Option<char>,
    pub is_mt_acked: Option<bool>,
    pub has_dwings_link: Option<bool>,
    pub is_grouped: Option<bool>,
    pub is_amount_match: Option<bool>,
    pub is_matched: Option<bool>,
    pub has_manual_match: Option<bool>,
    pub is_first_request: Option<bool>,
    pub trigger_date_is_null: Option<bool>,
    pub comm_id_email: Option<bool>,
    pub bgi_status_initiated: Option<bool>,
    pub days_since_trigger: Option<f64>,
    pub operation_days_ago: Option<f64>,
    pub days_since_reminder: Option<f64>,
    pub missing_amount: Option<f64>,
    pub current_action_id: Option<i64>,
    pub amount: f64,
}

impl RuleContext {
    pub fn normalize(mut self) -> Self {
        self.guarantee_type = self.guarantee_type.map(|t| normalize_guarantee_type(&t));
        self.transaction_type = self.transaction_type.map(|t| t.trim().to_ascii_uppercase());
        self.booking = self.booking.map(|t| t.trim().to_ascii_uppercase());
        self.sign = self.sign.map(|c| c.to_ascii_uppercase());
        self
    }
}

/// Collapses guarantee-type free text into one of the synonym families
/// recognized by the rule engine.
fn normalize_guarantee_type(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    if upper.starts_with("REISSU") || upper.starts_with("ISSU") {
        "ISSUANCE".to_string()
    } else if upper.starts_with("NOTIF") || upper.starts_with("ADVISING") {
        "ADVISING".to_string()
    } else {
        upper
    }
}

/// Structured result of a matched rule (§4.9), carried back to the caller
/// instead of a bare outcome label so it can drive both KPI/action
/// assignment and reminder scheduling.
#[derive(Debug, Clone, Default)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub action_id: Option<i64>,
    pub kpi_id: Option<i64>,
    pub incident_type_id: Option<i64>,
    pub risky_item: Option<bool>,
    pub reason_non_risky_id: Option<i64>,
    pub to_remind: Option<bool>,
    pub to_remind_days: Option<i64>,
    pub first_claim_today: Option<bool>,
    pub apply_to: ApplyTo,
    pub auto_apply: bool,
    pub message: Option<String>,
}

/// One row of the truth table, evaluated in ascending `Priority` order;
/// the first matching, enabled, in-scope rule wins (§4.8 "first-match-wins").
#[derive(Debug, Clone)]
pub struct TruthRule {
    pub rule_id: String,
    pub priority: i64,
    pub enabled: bool,
    pub scope: Scope,
    pub booking: Predicate,
    pub account_side: Predicate,
    pub guarantee_type: Predicate,
    pub transaction_type: Predicate,
    pub sign: Predicate,
    pub mt_status: Predicate,
    pub has_dwings_link: Predicate,
    pub is_grouped: Predicate,
    pub is_amount_match: Predicate,
    pub is_matched: Predicate,
    pub has_manual_match: Predicate,
    pub is_first_request: Predicate,
    pub trigger_date_is_null: Predicate,
    pub comm_id_email: Predicate,
    pub bgi_status_initiated: Predicate,
    pub current_action_id: Predicate,
    pub days_since_trigger: Predicate,
    pub operation_days_ago: Predicate,
    pub days_since_reminder: Predicate,
    pub missing_amount: Predicate,
    pub amount_range: Predicate,
    pub outcome: RuleOutcome,
}

impl TruthRule {
    fn matches(&self, ctx: &RuleContext, scope: Scope) -> bool {
        self.enabled
            && self.scope.matches(scope)
            && account_side_matches(&self.account_side, ctx.is_pivot)
            && self.booking.matches_text(ctx.booking.as_deref().unwrap_or(""))
            && self.guarantee_type.matches_text(ctx.guarantee_type.as_deref().unwrap_or(""))
            && self.transaction_type.matches_text(ctx.transaction_type.as_deref().unwrap_or(""))
            && sign_matches(&self.sign, ctx.sign)
            && mt_status_matches(&self.mt_status, ctx.is_mt_acked)
            && self.has_dwings_link.matches_bool(ctx.has_dwings_link)
            && self.is_grouped.matches_bool(ctx.is_grouped)
            && self.is_amount_match.matches_bool(ctx.is_amount_match)
            && self.is_matched.matches_bool(ctx.is_matched)
            && self.has_manual_match.matches_bool(ctx.has_manual_match)
            && self.is_first_request.matches_bool(ctx.is_first_request)
            && self.trigger_date_is_null.matches_bool(ctx.trigger_date_is_null)
            && self.comm_id_email.matches_bool(ctx.comm_id_email)
            && self.bgi_status_initiated.matches_bool(ctx.bgi_status_initiated)
            && self.current_action_id.matches_int(ctx.current_action_id)
            && self.days_since_trigger.matches_number(ctx.days_since_trigger)
            && self.operation_days_ago.matches_number(ctx.operation_days_ago)
            && self.days_since_reminder.matches_number(ctx.days_since_reminder)
            && self.missing_amount.matches_number(ctx.missing_amount)
            && self.amount_range.matches_number(Some(ctx.amount))
    }
}

/// `AccountSide` is stored as "P"/"R" text but evaluated against the
/// context's derived pivot/receivable boolean.
fn account_side_matches(predicate: &Predicate, is_pivot: Option<bool>) -> bool {
    match predicate {
        Predicate::Any => true,
        Predicate::Equals(expected) => {
            let expected_pivot = expected.eq_ignore_ascii_case("P");
            is_pivot == Some(expected_pivot)
        }
        _ => false,
    }
}

fn sign_matches(predicate: &Predicate, sign: Option<char>) -> bool {
    match (predicate, sign) {
        (Predicate::Any, _) => true,
        (Predicate::Equals(expected), Some(s)) => expected.eq_ignore_ascii_case(&s.to_string()),
        _ => false,
    }
}

/// `MtStatus` is stored as "ACKED"/"NOTACKED"/"NULL" text but evaluated
/// against the context's tri-state acknowledgement flag.
fn mt_status_matches(predicate: &Predicate, is_mt_acked: Option<bool>) -> bool {
    match predicate {
        Predicate::Any => true,
        Predicate::Equals(expected) => match expected.to_ascii_uppercase().as_str() {
            "ACKED" => is_mt_acked == Some(true),
            "NOTACKED" => is_mt_acked == Some(false),
            "NULL" => is_mt_acked.is_none(),
            _ => false,
        },
        _ => false,
    }
}

/// Evaluates `rules` (assumed already sorted by `priority` ascending)
/// against `ctx` for the given `scope`, returning the first match's outcome.
pub fn evaluate(rules: &[TruthRule], ctx: &RuleContext, scope: Scope) -> Option<RuleOutcome> {
    rules.iter().find(|r| r.matches(ctx, scope)).map(|r| r.outcome.clone())
}

struct CachedRules {
    rules: Vec<TruthRule>,
    loaded_at: Instant,
}

static RULE_CACHE: Lazy<Mutex<Option<CachedRules>>> = Lazy::new(|| Mutex::new(None));

/// Loads the truth table from the `Rules` table, auto-creating it if
/// absent, and caches the parsed rows for up to [`CACHE_TTL`] (§4.8
/// "2 minute TTL cache").
pub fn load_rules(conn: &Connection) -> Result<Vec<TruthRule>> {
    {
        let cache = RULE_CACHE.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.loaded_at.elapsed() < CACHE_TTL {
                return Ok(cached.rules.clone());
            }
        }
    }
    ensure_schema(conn)?;
    let rules = fetch_rules(conn)?;
    *RULE_CACHE.lock() = Some(CachedRules { rules: rules.clone(), loaded_at: Instant::now() });
    Ok(rules)
}

pub fn invalidate_rule_cache() {
    *RULE_CACHE.lock() = None;
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS Rules (
    RuleID TEXT PRIMARY KEY,
    Priority INTEGER NOT NULL,
    Enabled INTEGER NOT NULL DEFAULT 1,
    Scope TEXT NOT NULL DEFAULT 'Both',
    Booking TEXT,
    AccountSide TEXT,
    GuaranteeType TEXT,
    TransactionType TEXT,
    Sign TEXT,
    MtStatus TEXT,
    HasDwingsLink TEXT,
    IsGrouped TEXT,
    IsAmountMatch TEXT,
    IsMatched TEXT,
    HasManualMatch TEXT,
    IsFirstRequest TEXT,
    TriggerDateIsNull TEXT,
    CommIdEmail TEXT,
    BgiStatusInitiated TEXT,
    CurrentActionId INTEGER,
    DaysSinceTriggerMin REAL,
    DaysSinceTriggerMax REAL,
    OperationDaysAgoMin REAL,
    OperationDaysAgoMax REAL,
    DaysSinceReminderMin REAL,
    DaysSinceReminderMax REAL,
    MissingAmountMin REAL,
    MissingAmountMax REAL,
    AmountMin REAL,
    AmountMax REAL,
    ActionId INTEGER,
    KpiId INTEGER,
    IncidentTypeId INTEGER,
    RiskyItem INTEGER,
    ReasonNonRiskyId INTEGER,
    ToRemind INTEGER,
    ToRemindDays INTEGER,
    FirstClaimToday INTEGER,
    ApplyTo TEXT NOT NULL DEFAULT 'Self',
    AutoApply INTEGER NOT NULL DEFAULT 0,
    Message TEXT
);
"#,
    )?;
    Ok(())
}

fn fetch_rules(conn: &Connection) -> Result<Vec<TruthRule>> {
    let mut stmt = conn.prepare(
        "SELECT RuleID, Priority, Enabled, Scope, Booking, AccountSide, GuaranteeType, TransactionType, Sign,
                MtStatus, HasDwingsLink, IsGrouped, IsAmountMatch, IsMatched, HasManualMatch, IsFirstRequest,
                TriggerDateIsNull, CommIdEmail, BgiStatusInitiated, CurrentActionId,
                DaysSinceTriggerMin, DaysSinceTriggerMax, OperationDaysAgoMin, OperationDaysAgoMax,
                DaysSinceReminderMin, DaysSinceReminderMax, MissingAmountMin, MissingAmountMax,
                AmountMin, AmountMax, ActionId, KpiId, IncidentTypeId, RiskyItem, ReasonNonRiskyId,
                ToRemind, ToRemindDays, FirstClaimToday, ApplyTo, AutoApply, Message
         FROM Rules ORDER BY Priority ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let enabled: i64 = row.get(2)?;
        let scope: String = row.get(3)?;
        let current_action_id: Option<i64> = row.get(19)?;
        let risky_item: Option<i64> = row.get(33)?;
        let to_remind: Option<i64> = row.get(35)?;
        let first_claim_today: Option<i64> = row.get(37)?;
        let apply_to: String = row.get(38)?;
        let auto_apply: i64 = row.get(39)?;
        Ok(TruthRule {
            rule_id: row.get(0)?,
            priority: row.get(1)?,
            enabled: enabled != 0,
            scope: parse_scope(&scope),
            booking: predicate_from_list(row.get(4)?),
            account_side: predicate_from_text(row.get(5)?),
            guarantee_type: predicate_from_list(row.get(6)?),
            transaction_type: predicate_from_list(row.get(7)?),
            sign: predicate_from_text(row.get(8)?),
            mt_status: predicate_from_text(row.get(9)?),
            has_dwings_link: predicate_from_tristate(row.get(10)?),
            is_grouped: predicate_from_tristate(row.get(11)?),
            is_amount_match: predicate_from_tristate(row.get(12)?),
            is_matched: predicate_from_tristate(row.get(13)?),
            has_manual_match: predicate_from_tristate(row.get(14)?),
            is_first_request: predicate_from_tristate(row.get(15)?),
            trigger_date_is_null: predicate_from_tristate(row.get(16)?),
            comm_id_email: predicate_from_tristate(row.get(17)?),
            bgi_status_initiated: predicate_from_tristate(row.get(18)?),
            current_action_id: current_action_id.map(Predicate::IntEquals).unwrap_or(Predicate::Any),
            days_since_trigger: range_predicate(row.get(20)?, row.get(21)?),
            operation_days_ago: range_predicate(row.get(22)?, row.get(23)?),
            days_since_reminder: range_predicate(row.get(24)?, row.get(25)?),
            missing_amount: range_predicate(row.get(26)?, row.get(27)?),
            amount_range: range_predicate(row.get(28)?, row.get(29)?),
            outcome: RuleOutcome {
                rule_id: row.get(0)?,
                action_id: row.get(30)?,
                kpi_id: row.get(31)?,
                incident_type_id: row.get(32)?,
                risky_item: risky_item.map(|v| v != 0),
                reason_non_risky_id: row.get(34)?,
                to_remind: to_remind.map(|v| v != 0),
                to_remind_days: row.get(36)?,
                first_claim_today: first_claim_today.map(|v| v != 0),
                apply_to: parse_apply_to(&apply_to),
                auto_apply: auto_apply != 0,
                message: row.get(40)?,
            },
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn range_predicate(lo: Option<f64>, hi: Option<f64>) -> Predicate {
    match (lo, hi) {
        (Some(lo), Some(hi)) => Predicate::Range(lo, hi),
        _ => Predicate::Any,
    }
}

fn parse_scope(raw: &str) -> Scope {
    match raw.trim().to_ascii_lowercase().as_str() {
        "import" => Scope::Import,
        "edit" => Scope::Edit,
        _ => Scope::Both,
    }
}

fn parse_apply_to(raw: &str) -> ApplyTo {
    if raw.trim().eq_ignore_ascii_case("both") {
        ApplyTo::Both
    } else {
        ApplyTo::SelfOnly
    }
}

fn predicate_from_text(raw: Option<String>) -> Predicate {
    match raw {
        None => Predicate::Any,
        Some(s) if s.trim().is_empty() || s.trim() == "*" => Predicate::Any,
        Some(s) => Predicate::Equals(s),
    }
}

/// Splits a rule's set-valued field on any of `;`, `,`, `|` (§4.9 "the
/// rule's value is split on `;,|`").
fn predicate_from_list(raw: Option<String>) -> Predicate {
    match raw {
        None => Predicate::Any,
        Some(s) if s.trim().is_empty() || s.trim() == "*" => Predicate::Any,
        Some(s) => {
            let items: Vec<String> = s
                .split([';', ',', '|'])
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if items.len() == 1 {
                Predicate::Equals(items.into_iter().next().unwrap())
            } else {
                Predicate::OneOf(items)
            }
        }
    }
}

fn predicate_from_tristate(raw: Option<String>) -> Predicate {
    match raw.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
        None => Predicate::Any,
        Some(ref s) if s.is_empty() || s == "*" => Predicate::Any,
        Some(ref s) if s == "true" || s == "yes" || s == "1" => Predicate::TriState(Some(true)),
        Some(ref s) if s == "false" || s == "no" || s == "0" => Predicate::TriState(Some(false)),
        _ => Predicate::Any,
    }
}
