//! Remittance Engine: period math, per-holding fee/strip calculation and
//! the payout state machine. The payout lifecycle is an explicit
//! `match (state, event)` state machine rejecting illegal transitions, and
//! every money computation uses `Decimal` with half-up rounding.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Monthly,
    Weekly,
}

/// `[periodStart, periodEnd]` plus the cutoff (business days after period end).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemittancePeriod {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub cutoff: NaiveDate,
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Advances `date` by `n` business days, excluding Saturday/Sunday. Holidays
/// are not observed unless explicitly configured, so this function
/// takes no holiday calendar.
fn add_business_days(date: NaiveDate, n: u32) -> NaiveDate {
    let mut remaining = n;
    let mut current = date;
    while remaining > 0 {
        current += Duration::days(1);
        if !is_weekend(current) {
            remaining -= 1;
        }
    }
    current
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .unwrap()
        .pred_opt()
        .unwrap()
}

/// Computes the period and cutoff for `as_of_date` under the given cadence.
pub fn compute_period(as_of_date: NaiveDate, cadence: Cadence, grace_days: u32) -> RemittancePeriod {
    match cadence {
        Cadence::Monthly => {
            let start = NaiveDate::from_ymd_opt(as_of_date.year(), as_of_date.month(), 1).unwrap();
            let end = last_day_of_month(as_of_date.year(), as_of_date.month());
            let cutoff = add_business_days(end, grace_days);
            RemittancePeriod { start, end, cutoff }
        }
        Cadence::Weekly => {
            let days_until_friday = (Weekday::Fri.num_days_from_monday() as i64
                - as_of_date.weekday().num_days_from_monday() as i64
                + 7)
                % 7;
            let friday = as_of_date + Duration::days(days_until_friday);
            let start = friday - Duration::days(6);
            let cutoff = add_business_days(friday, grace_days);
            RemittancePeriod { start, end: friday, cutoff }
        }
    }
}

/// An active `(investor, loan)` pairing the remittance engine sums activity for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestorHolding {
    pub tenant_id: String,
    pub investor_id: String,
    pub loan_id: String,
    pub participation_pct: Decimal,
    pub svc_fee_bps: Decimal,
    pub strip_bps: Decimal,
    pub pass_escrow: bool,
}

/// Summed in-period activity for one holding, taken from the servicing ledger
/// by the caller (the ledger itself lives outside this crate's scope).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeriodActivity {
    pub principal: Decimal,
    pub interest: Decimal,
    pub escrow: Decimal,
    pub fees: Decimal,
    pub beginning_upb: Decimal,
    pub ending_upb: Decimal,
}

fn round_half_up(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// One computed line of a remittance run: UPB, collected amounts, and the
/// fee/strip/net math derived from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemittanceItem {
    pub loan_id: String,
    pub investor_id: String,
    pub principal: Decimal,
    pub interest: Decimal,
    pub escrow: Decimal,
    pub fees: Decimal,
    pub beginning_upb: Decimal,
    pub ending_upb: Decimal,
    pub average_upb: Decimal,
    pub servicing_fee: Decimal,
    pub strip: Decimal,
    pub net_remit: Decimal,
}

fn ten_thousand() -> Decimal {
    Decimal::from(10_000)
}

fn twelve() -> Decimal {
    Decimal::from(12)
}

/// Computes one `RemittanceItem` for a holding's summed period activity.
pub fn compute_item(holding: &InvestorHolding, activity: &PeriodActivity) -> RemittanceItem {
    let average_upb = (activity.beginning_upb + activity.ending_upb) / Decimal::from(2);
    let participation = holding.participation_pct;

    let servicing_fee = round_half_up(
        average_upb * holding.svc_fee_bps / ten_thousand() / twelve() * participation,
    );
    let strip = round_half_up(average_upb * holding.strip_bps / ten_thousand() / twelve() * participation);

    let escrow_component = if holding.pass_escrow { activity.escrow } else { Decimal::ZERO };
    let net_remit = round_half_up(
        (activity.principal + activity.interest + escrow_component) * participation - servicing_fee - strip,
    );

    RemittanceItem {
        loan_id: holding.loan_id.clone(),
        investor_id: holding.investor_id.clone(),
        principal: activity.principal,
        interest: activity.interest,
        escrow: activity.escrow,
        fees: activity.fees,
        beginning_upb: activity.beginning_upb,
        ending_upb: activity.ending_upb,
        average_upb,
        servicing_fee,
        strip,
        net_remit,
    }
}

/// `participationPct` above 1.0 is a detection-only anomaly per the resolved
/// open question in the accompanying design notes: the engine still computes
/// the item (no silent clamp), but flags it so downstream validation can raise
/// a defect rather than the engine making a unilateral correction.
pub fn flag_participation_anomaly(holding: &InvestorHolding) -> Option<String> {
    if holding.participation_pct > Decimal::ONE {
        Some(format!(
            "participation_pct {} exceeds 1.0 for investor {} / loan {}",
            holding.participation_pct, holding.investor_id, holding.loan_id
        ))
    } else {
        None
    }
}

/// `Requested -> Sent -> Settled`, with an `error` escape to `Failed` from
/// either pre-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayoutState {
    Requested,
    Sent,
    Settled,
    Failed,
}

impl PayoutState {
    pub fn can_transition_to(self, next: PayoutState) -> bool {
        matches!(
            (self, next),
            (PayoutState::Requested, PayoutState::Sent)
                | (PayoutState::Sent, PayoutState::Settled)
                | (PayoutState::Requested, PayoutState::Failed)
                | (PayoutState::Sent, PayoutState::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: String,
    pub tenant_id: String,
    pub investor_id: String,
    pub period: RemittancePeriod,
    pub amount: Decimal,
    pub state: PayoutState,
}

impl Payout {
    pub fn transition(&mut self, next: PayoutState) -> Result<(), crate::error::CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(crate::error::CoreError::stage_violation(
                &format!("{:?}", next),
                &format!("{:?}", self.state),
            ));
        }
        self.state = next;
        Ok(())
    }
}

/// A full remittance run for one `(tenant, investor, period)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemittanceRun {
    pub tenant_id: String,
    pub investor_id: String,
    pub period: RemittancePeriod,
    pub items: Vec<RemittanceItem>,
    pub payout: Payout,
}

/// Pure computation over a caller-supplied activity map; persistence and the
/// uniqueness-constraint-based at-most-once guarantee live in the adapters layer.
pub struct RemittanceEngine;

impl RemittanceEngine {
    /// Builds a `RemittanceRun` from holdings and their matching period
    /// activity. `activity` must contain one entry per holding, matched by
    /// position; callers assemble this from the servicing ledger.
    pub fn build_run(
        tenant_id: &str,
        investor_id: &str,
        period: RemittancePeriod,
        holdings: &[InvestorHolding],
        activity: &[PeriodActivity],
    ) -> RemittanceRun {
        let items: Vec<RemittanceItem> = holdings
            .iter()
            .zip(activity.iter())
            .map(|(holding, activity)| compute_item(holding, activity))
            .collect();

        let total: Decimal = items.iter().map(|i| i.net_remit).sum();

        RemittanceRun {
            tenant_id: tenant_id.to_string(),
            investor_id: investor_id.to_string(),
            period,
            items,
            payout: Payout {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                investor_id: investor_id.to_string(),
                period,
                amount: total,
                state: PayoutState::Requested,
            },
        }
    }

    /// Idempotent entry point: the `(tenant_id, investor_id, period_start,
    /// period_end)` uniqueness constraint lives in the adapters-layer
    /// repository, which is the only thing that can answer "does a run already
    /// exist for this period" — so the caller passes that answer in and this
    /// stays a pure function of its inputs (idempotency and the open
    /// question resolution: replay short-circuits rather than erroring).
    pub fn build_run_idempotent(
        tenant_id: &str,
        investor_id: &str,
        period: RemittancePeriod,
        holdings: &[InvestorHolding],
        activity: &[PeriodActivity],
        already_exists: bool,
    ) -> RemittanceOutcome {
        if already_exists {
            return RemittanceOutcome::Skipped {
                tenant_id: tenant_id.to_string(),
                investor_id: investor_id.to_string(),
                period,
            };
        }
        RemittanceOutcome::Created(Self::build_run(tenant_id, investor_id, period, holdings, activity))
    }
}

/// Result of attempting to produce a remittance run for a period: either a
/// freshly computed run, or a no-op because one already exists (8:
/// "re-invocation short-circuits with `{skipped: true}`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemittanceOutcome {
    Created(RemittanceRun),
    Skipped {
        tenant_id: String,
        investor_id: String,
        period: RemittancePeriod,
    },
}

impl RemittanceOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, RemittanceOutcome::Skipped { .. })
    }
}

/// One GL posting line. A payout always nets to a balanced Debit Investor
/// Payable / Credit Cash pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GlSide {
    Debit,
    Credit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlEntry {
    pub account: String,
    pub side: GlSide,
    pub amount: Decimal,
}

/// Builds the two-line GL posting for a payout: Debit Investor Payable /
/// Credit Cash for the payout amount.
pub fn gl_entries_for_payout(payout: &Payout, investor_payable_account: &str, cash_account: &str) -> Vec<GlEntry> {
    vec![
        GlEntry {
            account: investor_payable_account.to_string(),
            side: GlSide::Debit,
            amount: payout.amount,
        },
        GlEntry {
            account: cash_account.to_string(),
            side: GlSide::Credit,
            amount: payout.amount,
        },
    ]
}

/// Renders the `loan_activity` CSV report for a run: fixed header,
/// one row per item, trailing newline.
pub fn render_loan_activity_csv(items: &[RemittanceItem]) -> String {
    let mut out = String::from("LoanId,UPB_Beg,UPB_End,Principal,Interest,Escrow,Fees,SvcFee,StripIO,Net\n");
    for item in items {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{}\n",
            item.loan_id,
            item.beginning_upb,
            item.ending_upb,
            item.principal,
            item.interest,
            item.escrow,
            item.fees,
            item.servicing_fee,
            item.strip,
            item.net_remit,
        ));
    }
    out
}

/// The JSON body of the `remittance.payout.sent` webhook. Signing
/// (`X-LoanServe-Signature`) and the actual POST are I/O and live in
/// `loanserve-adapters::webhook`; this is the pure payload the signature is
/// computed over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutWebhookPayload {
    pub event: &'static str,
    pub investor_id: String,
    pub payout_id: String,
    pub run_id: String,
    pub amount: Decimal,
    pub currency: &'static str,
    pub method: &'static str,
    pub reference: String,
    pub sent_at: DateTime<Utc>,
}

impl PayoutWebhookPayload {
    pub fn for_payout(payout: &Payout, run_id: &str, sent_at: DateTime<Utc>) -> Self {
        let reference = format!("PAY-{}", payout.id.chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect::<String>().to_uppercase());
        Self {
            event: "remittance.payout.sent",
            investor_id: payout.investor_id.clone(),
            payout_id: payout.id.clone(),
            run_id: run_id.to_string(),
            amount: payout.amount,
            currency: "USD",
            method: "ACH",
            reference,
            sent_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn monthly_period_spans_the_whole_calendar_month() {
        let as_of = NaiveDate::from_ymd_opt(2026, 2, 15).unwrap();
        let period = compute_period(as_of, Cadence::Monthly, 3);
        assert_eq!(period.start, NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
        assert_eq!(period.end, NaiveDate::from_ymd_opt(2026, 2, 28).unwrap());
        assert!(period.cutoff > period.end);
    }

    #[test]
    fn weekly_period_ends_on_friday() {
        let as_of = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        let period = compute_period(as_of, Cadence::Weekly, 2);
        assert_eq!(period.end.weekday(), Weekday::Fri);
    }

    #[test]
    fn business_day_addition_skips_weekends() {
        let friday = NaiveDate::from_ymd_opt(2026, 3, 6).unwrap();
        assert_eq!(friday.weekday(), Weekday::Fri);
        let plus_one = add_business_days(friday, 1);
        assert_eq!(plus_one, NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
    }

    #[test]
    fn compute_item_matches_spec_formula() {
        let holding = InvestorHolding {
            tenant_id: "tenant-1".to_string(),
            investor_id: "inv-1".to_string(),
            loan_id: "loan-1".to_string(),
            participation_pct: dec("1.0"),
            svc_fee_bps: dec("25"),
            strip_bps: dec("10"),
            pass_escrow: true,
        };
        let activity = PeriodActivity {
            principal: dec("1000.00"),
            interest: dec("500.00"),
            escrow: dec("200.00"),
            fees: dec("12.34"),
            beginning_upb: dec("200000.00"),
            ending_upb: dec("199000.00"),
        };
        let item = compute_item(&holding, &activity);
        assert_eq!(item.fees, dec("12.34"));
        assert_eq!(item.average_upb, dec("199500.00"));
        // 199500 * 25 / 10000 / 12 = 41.5625 -> 41.56
        assert_eq!(item.servicing_fee, dec("41.56"));
        // 199500 * 10 / 10000 / 12 = 16.625 -> 16.63 (half-up)
        assert_eq!(item.strip, dec("16.63"));
        let expected_net = round_half_up(dec("1700.00") - dec("41.56") - dec("16.63"));
        assert_eq!(item.net_remit, expected_net);
    }

    #[test]
    fn pass_escrow_false_excludes_escrow_from_net() {
        let holding = InvestorHolding {
            tenant_id: "tenant-1".to_string(),
            investor_id: "inv-1".to_string(),
            loan_id: "loan-1".to_string(),
            participation_pct: dec("1.0"),
            svc_fee_bps: Decimal::ZERO,
            strip_bps: Decimal::ZERO,
            pass_escrow: false,
        };
        let activity = PeriodActivity {
            principal: dec("100.00"),
            interest: dec("50.00"),
            escrow: dec("9999.00"),
            fees: Decimal::ZERO,
            beginning_upb: Decimal::ZERO,
            ending_upb: Decimal::ZERO,
        };
        let item = compute_item(&holding, &activity);
        assert_eq!(item.net_remit, dec("150.00"));
    }

    #[test]
    fn participation_above_one_is_flagged_not_clamped() {
        let holding = InvestorHolding {
            tenant_id: "tenant-1".to_string(),
            investor_id: "inv-1".to_string(),
            loan_id: "loan-1".to_string(),
            participation_pct: dec("1.25"),
            svc_fee_bps: Decimal::ZERO,
            strip_bps: Decimal::ZERO,
            pass_escrow: false,
        };
        assert!(flag_participation_anomaly(&holding).is_some());
    }

    #[test]
    fn payout_state_machine_rejects_skipping_states() {
        let mut payout = Payout {
            id: "p-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            investor_id: "inv-1".to_string(),
            period: compute_period(NaiveDate::from_ymd_opt(2026, 2, 15).unwrap(), Cadence::Monthly, 3),
            amount: dec("100.00"),
            state: PayoutState::Requested,
        };
        assert!(payout.transition(PayoutState::Settled).is_err());
        assert!(payout.transition(PayoutState::Sent).is_ok());
        assert!(payout.transition(PayoutState::Settled).is_ok());
    }

    #[test]
    fn build_run_sums_items_into_payout_amount() {
        let period = compute_period(NaiveDate::from_ymd_opt(2026, 2, 15).unwrap(), Cadence::Monthly, 3);
        let holding = InvestorHolding {
            tenant_id: "tenant-1".to_string(),
            investor_id: "inv-1".to_string(),
            loan_id: "loan-1".to_string(),
            participation_pct: dec("1.0"),
            svc_fee_bps: Decimal::ZERO,
            strip_bps: Decimal::ZERO,
            pass_escrow: false,
        };
        let activity = PeriodActivity {
            principal: dec("100.00"),
            interest: dec("0.00"),
            escrow: Decimal::ZERO,
            fees: Decimal::ZERO,
            beginning_upb: Decimal::ZERO,
            ending_upb: Decimal::ZERO,
        };
        let run = RemittanceEngine::build_run("tenant-1", "inv-1", period, &[holding], &[activity]);
        assert_eq!(run.payout.amount, dec("100.00"));
        assert_eq!(run.payout.state, PayoutState::Requested);
    }

    #[test]
    fn build_run_idempotent_skips_when_already_exists() {
        let period = compute_period(NaiveDate::from_ymd_opt(2026, 2, 15).unwrap(), Cadence::Monthly, 3);
        let outcome = RemittanceEngine::build_run_idempotent("tenant-1", "inv-1", period, &[], &[], true);
        match outcome {
            RemittanceOutcome::Skipped { tenant_id, investor_id, .. } => {
                assert_eq!(tenant_id, "tenant-1");
                assert_eq!(investor_id, "inv-1");
            }
            RemittanceOutcome::Created(_) => panic!("expected skipped outcome"),
        }
    }

    #[test]
    fn build_run_idempotent_creates_when_absent() {
        let period = compute_period(NaiveDate::from_ymd_opt(2026, 2, 15).unwrap(), Cadence::Monthly, 3);
        let outcome = RemittanceEngine::build_run_idempotent("tenant-1", "inv-1", period, &[], &[], false);
        assert!(matches!(outcome, RemittanceOutcome::Created(_)));
        assert!(!outcome.is_skipped());
    }

    #[test]
    fn gl_entries_balance_debit_and_credit() {
        let payout = Payout {
            id: "p-1".to_string(),
            tenant_id: "tenant-1".to_string(),
            investor_id: "inv-1".to_string(),
            period: compute_period(NaiveDate::from_ymd_opt(2026, 2, 15).unwrap(), Cadence::Monthly, 3),
            amount: dec("512.34"),
            state: PayoutState::Requested,
        };
        let entries = gl_entries_for_payout(&payout, "2100-investor-payable", "1000-cash");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].side, GlSide::Debit);
        assert_eq!(entries[0].account, "2100-investor-payable");
        assert_eq!(entries[1].side, GlSide::Credit);
        assert_eq!(entries[1].account, "1000-cash");
        assert_eq!(entries[0].amount, entries[1].amount);
    }

    #[test]
    fn loan_activity_csv_has_exact_header_and_trailing_newline() {
        let item = RemittanceItem {
            loan_id: "loan-1".to_string(),
            investor_id: "inv-1".to_string(),
            principal: dec("100.00"),
            interest: dec("10.00"),
            escrow: dec("5.00"),
            fees: dec("2.00"),
            beginning_upb: dec("1000.00"),
            ending_upb: dec("900.00"),
            average_upb: dec("950.00"),
            servicing_fee: dec("1.00"),
            strip: dec("0.50"),
            net_remit: dec("113.50"),
        };
        let csv = render_loan_activity_csv(&[item]);
        assert!(csv.starts_with("LoanId,UPB_Beg,UPB_End,Principal,Interest,Escrow,Fees,SvcFee,StripIO,Net\n"));
        assert!(csv.ends_with('\n'));
        assert!(csv.contains("loan-1,1000.00,900.00,100.00,10.00,5.00,2.00,1.00,0.50,113.50"));
    }

    #[test]
    fn webhook_payload_matches_spec_shape() {
        let payout = Payout {
            id: "abcdef1234567890".to_string(),
            tenant_id: "tenant-1".to_string(),
            investor_id: "inv-1".to_string(),
            period: compute_period(NaiveDate::from_ymd_opt(2026, 2, 15).unwrap(), Cadence::Monthly, 3),
            amount: dec("250.00"),
            state: PayoutState::Sent,
        };
        let sent_at = Utc::now();
        let payload = PayoutWebhookPayload::for_payout(&payout, "run-1", sent_at);
        assert_eq!(payload.event, "remittance.payout.sent");
        assert_eq!(payload.investor_id, "inv-1");
        assert_eq!(payload.currency, "USD");
        assert_eq!(payload.method, "ACH");
        assert!(payload.reference.starts_with("PAY-"));
        assert_eq!(payload.reference.len(), "PAY-".len() + 8);
    }
}
