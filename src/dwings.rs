use std::collections::HashSet;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Matches a BGPMT reference: the literal prefix followed by 8-20
/// alphanumeric characters, word-isolated (§4.7 "BGPMT token").
static BGPMT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bBGPMT[A-Za-z0-9]{8,20}\b").unwrap());

/// Matches the composite BGI form only (§9 decision: "BGI composite
/// alphanumeric form only", the legacy bare-numeric `BGI\d{13}` form is
/// not recognized).
static BGI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bBGI(?:\d{6}[A-F0-9]{7}|\d{4}[A-Za-z]{2}[A-F0-9]{7})\b").unwrap());

/// Matches a guarantee id: `G` or `N` prefix, 4 digits, 2 letters, 9
/// digits (§4.7).
static GUARANTEE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b[GN]\d{4}[A-Za-z]{2}\d{9}\b").unwrap());

const AMOUNT_TOLERANCE: f64 = 0.01;

pub fn extract_bgpmt(text: &str) -> Option<String> {
    BGPMT_RE.find(text).map(|m| m.as_str().to_ascii_uppercase())
}

pub fn extract_bgi(text: &str) -> Option<String> {
    BGI_RE.find(text).map(|m| m.as_str().to_ascii_uppercase())
}

pub fn extract_guarantee_id(text: &str) -> Option<String> {
    GUARANTEE_RE.find(text).map(|m| m.as_str().to_ascii_uppercase())
}

/// An invoice candidate from the DWINGS reference tables, reduced to the
/// fields the resolver needs (§4.7 `DwingsInvoice`). There is no dedicated
/// BGI field: a BGI token is matched directly against `invoice_id`, since
/// the invoice identifier itself is in BGI format.
#[derive(Debug, Clone)]
pub struct InvoiceCandidate {
    pub invoice_id: String,
    pub bgpmt: Option<String>,
    pub business_case_id: Option<String>,
    pub business_case_reference: Option<String>,
    pub requested_amount: Option<f64>,
    pub billing_amount: Option<f64>,
    pub requested_execution_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Resolves an AMBRE row's free-text comment/label against invoice
/// candidates by exact BGPMT match. Multiple matches are ambiguous and
/// resolve to `None` rather than guessing (§4.7 "ambiguous -> None").
pub fn resolve_invoice_by_bgpmt<'a>(text: &str, candidates: &'a [InvoiceCandidate]) -> Option<&'a InvoiceCandidate> {
    let token = extract_bgpmt(text)?;
    let mut matches = candidates.iter().filter(|c| c.bgpmt.as_deref() == Some(token.as_str()));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

/// Resolves by the composite BGI token matched against `invoice_id`, same
/// ambiguity rule as BGPMT.
pub fn resolve_invoice_by_bgi<'a>(text: &str, candidates: &'a [InvoiceCandidate]) -> Option<&'a InvoiceCandidate> {
    let token = extract_bgi(text)?;
    let mut matches = candidates.iter().filter(|c| c.invoice_id.eq_ignore_ascii_case(&token));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

fn pick_date(c: &InvoiceCandidate) -> Option<DateTime<Utc>> {
    c.requested_execution_date.or(c.start_date).or(c.end_date)
}

fn date_distance(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> i64 {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).num_seconds().abs(),
        _ => i64::MAX,
    }
}

fn amount_distance(c: &InvoiceCandidate, target: f64) -> f64 {
    let requested = c.requested_amount.map(|a| (a - target).abs());
    let billing = c.billing_amount.map(|a| (a - target).abs());
    match (requested, billing) {
        (Some(r), Some(b)) => r.min(b),
        (Some(r), None) => r,
        (None, Some(b)) => b,
        (None, None) => f64::MAX,
    }
}

fn amount_within_tolerance(c: &InvoiceCandidate, target: f64) -> bool {
    c.requested_amount.is_some_and(|a| (a - target).abs() <= AMOUNT_TOLERANCE)
        || c.billing_amount.is_some_and(|a| (a - target).abs() <= AMOUNT_TOLERANCE)
}

/// Resolves every invoice under a guarantee id, ranked by date proximity
/// first, then amount proximity (§4.7/§4.8 "date-first ranked resolution").
/// When `amount` is given, candidates outside [`AMOUNT_TOLERANCE`] are
/// hard-filtered out rather than merely ranked lower. Results are capped
/// at `take`.
pub fn resolve_invoices_by_guarantee<'a>(
    guarantee_id: &str,
    date: Option<DateTime<Utc>>,
    amount: Option<f64>,
    take: usize,
    candidates: &'a [InvoiceCandidate],
) -> Vec<&'a InvoiceCandidate> {
    let token = guarantee_id.trim().to_ascii_uppercase();
    if token.is_empty() {
        return Vec::new();
    }

    let mut matched: Vec<&InvoiceCandidate> = candidates
        .iter()
        .filter(|c| {
            let reference_match = c.business_case_reference.as_deref().is_some_and(|r| r.eq_ignore_ascii_case(&token))
                || c.business_case_id.as_deref().is_some_and(|r| r.eq_ignore_ascii_case(&token));
            reference_match
                || c.business_case_reference.as_deref().is_some_and(|r| r.to_ascii_uppercase().contains(&token))
                || c.business_case_id.as_deref().is_some_and(|r| r.to_ascii_uppercase().contains(&token))
        })
        .collect();

    if let Some(target_amount) = amount {
        matched.retain(|c| amount_within_tolerance(c, target_amount));
    }

    matched.sort_by(|a, b| {
        let a_dist = date_distance(pick_date(a), date);
        let b_dist = date_distance(pick_date(b), date);
        a_dist.cmp(&b_dist).then_with(|| {
            let a_amt = amount.map(|t| amount_distance(a, t)).unwrap_or(0.0);
            let b_amt = amount.map(|t| amount_distance(b, t)).unwrap_or(0.0);
            a_amt.partial_cmp(&b_amt).unwrap_or(std::cmp::Ordering::Equal)
        })
    });
    matched.truncate(take);
    matched
}

/// Full suggestion pipeline for one AMBRE row, trying BGI, then BGPMT,
/// then guarantee-ranked candidates across the four fields that can carry
/// a reference (explicit BGI, reconciliation number, reconciliation
/// origin number, raw label), deduplicating by invoice id and capping at
/// `take` (§4.7 "SuggestInvoicesForAmbre").
#[allow(clippy::too_many_arguments)]
pub fn suggest_invoices_for_ambre<'a>(
    explicit_bgi: Option<&str>,
    reconciliation_num: Option<&str>,
    reconciliation_origin_num: Option<&str>,
    raw_label: Option<&str>,
    amount: Option<f64>,
    value_date: Option<DateTime<Utc>>,
    take: usize,
    candidates: &'a [InvoiceCandidate],
) -> Vec<&'a InvoiceCandidate> {
    let fields: Vec<&str> = [explicit_bgi, reconciliation_num, reconciliation_origin_num, raw_label]
        .into_iter()
        .flatten()
        .collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut results: Vec<&InvoiceCandidate> = Vec::new();

    for field in &fields {
        if results.len() >= take {
            return results;
        }
        if let Some(c) = resolve_invoice_by_bgi(field, candidates) {
            push_unique(&mut seen, &mut results, c);
        }
    }

    for field in &fields {
        if results.len() >= take {
            return results;
        }
        if let Some(c) = resolve_invoice_by_bgpmt(field, candidates) {
            push_unique(&mut seen, &mut results, c);
        }
    }

    for field in &fields {
        if results.len() >= take {
            break;
        }
        if let Some(token) = extract_guarantee_id(field) {
            for c in resolve_invoices_by_guarantee(&token, value_date, amount, take, candidates) {
                if results.len() >= take {
                    break;
                }
                push_unique(&mut seen, &mut results, c);
            }
        }
    }

    results.truncate(take);
    results
}

fn push_unique<'a>(seen: &mut HashSet<String>, results: &mut Vec<&'a InvoiceCandidate>, candidate: &'a InvoiceCandidate) {
    if seen.insert(candidate.invoice_id.to_ascii_uppercase()) {
        results.push(candidate);
    }
}
