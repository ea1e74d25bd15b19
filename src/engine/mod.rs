// src/engine/mod.rs
//
// The GENIUS sequence engine: walks enrolled leads through their step plan
// under daily send limits and a monthly budget.

pub mod plan;
pub mod store;

#[cfg(test)]
pub(crate) mod memory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::error::{db_error, ApiError};
use crate::models::{Channel, LeadRow, MessageOutcome};
use crate::outbound::{MessageSender, OutboundMessage};
use crate::templates::{self, RenderedMessage, TemplateData};

use plan::{PlannedStep, SequencePlan, StepContent};
use store::{EngineStore, MessageEntry, StepCommit};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("invalid sequence: {0}")]
    Plan(String),
    #[error("invalid engine config: {0}")]
    Config(String),
    #[error("engine lease unavailable")]
    Busy,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Db(e) => db_error(e),
            EngineError::Plan(msg) => ApiError::BadRequest("INVALID_SEQUENCE", msg),
            EngineError::Config(msg) => ApiError::validation(msg),
            EngineError::Busy => {
                ApiError::Conflict("ENGINE_BUSY", "engine is busy, retry shortly".into())
            }
        }
    }
}

/// Persisted engine row. Counters reset on the first tick of a new UTC day
/// (daily) or month (spend).
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct EngineState {
    pub is_running: bool,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub daily_email_limit: i32,
    pub daily_sms_limit: i32,
    pub monthly_budget_cents: i64,
    pub pause_threshold_percent: i32,
    pub cost_per_email_cents: i64,
    pub cost_per_sms_cents: i64,
    pub cost_per_whatsapp_cents: i64,
    pub emails_sent_today: i32,
    pub sms_sent_today: i32,
    pub counters_date: NaiveDate,
    pub month_spend_cents: i64,
    pub spend_month: String,
    pub total_sent: i64,
    pub last_run_at: Option<DateTime<Utc>>,
}

fn month_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

impl EngineState {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            is_running: false,
            is_paused: false,
            pause_reason: None,
            daily_email_limit: 200,
            daily_sms_limit: 100,
            monthly_budget_cents: 10_000,
            pause_threshold_percent: 90,
            cost_per_email_cents: 1,
            cost_per_sms_cents: 8,
            cost_per_whatsapp_cents: 5,
            emails_sent_today: 0,
            sms_sent_today: 0,
            counters_date: now.date_naive(),
            month_spend_cents: 0,
            spend_month: month_key(now),
            total_sent: 0,
            last_run_at: None,
        }
    }

    /// Returns true when any counter was reset.
    pub fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        let today = now.date_naive();
        if self.counters_date != today {
            self.counters_date = today;
            self.emails_sent_today = 0;
            self.sms_sent_today = 0;
            changed = true;
        }
        let month = month_key(now);
        if self.spend_month != month {
            self.spend_month = month;
            self.month_spend_cents = 0;
            changed = true;
        }
        changed
    }

    /// spend >= budget * threshold% (integer arithmetic, no rounding).
    pub fn budget_threshold_reached(&self) -> bool {
        i128::from(self.month_spend_cents) * 100
            >= i128::from(self.monthly_budget_cents) * i128::from(self.pause_threshold_percent)
    }

    pub fn cost_for(&self, channel: Channel) -> i64 {
        match channel {
            Channel::Email => self.cost_per_email_cents,
            Channel::Sms => self.cost_per_sms_cents,
            Channel::Whatsapp => self.cost_per_whatsapp_cents,
        }
    }

    pub fn daily_limit_reached(&self, channel: Channel) -> bool {
        if channel.is_short_message() {
            self.sms_sent_today >= self.daily_sms_limit
        } else {
            self.emails_sent_today >= self.daily_email_limit
        }
    }

    pub fn record_send(&mut self, channel: Channel, cost_cents: i64) {
        if channel.is_short_message() {
            self.sms_sent_today += 1;
        } else {
            self.emails_sent_today += 1;
        }
        self.month_spend_cents += cost_cents;
        self.total_sent += 1;
    }

    pub fn pause(&mut self, reason: impl Into<String>) {
        self.is_paused = true;
        self.pause_reason = Some(reason.into());
    }

    fn budget_pause_reason(&self) -> String {
        format!(
            "monthly spend {} cents reached {}% of budget {} cents",
            self.month_spend_cents, self.pause_threshold_percent, self.monthly_budget_cents
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfigUpdate {
    pub daily_email_limit: Option<i32>,
    pub daily_sms_limit: Option<i32>,
    pub monthly_budget_cents: Option<i64>,
    pub pause_threshold_percent: Option<i32>,
    pub cost_per_email_cents: Option<i64>,
    pub cost_per_sms_cents: Option<i64>,
    pub cost_per_whatsapp_cents: Option<i64>,
}

impl EngineConfigUpdate {
    pub fn apply(&self, state: &mut EngineState) -> Result<(), EngineError> {
        fn non_negative<T: PartialOrd + Default + Copy>(name: &str, v: Option<T>) -> Result<Option<T>, EngineError> {
            match v {
                Some(v) if v < T::default() => Err(EngineError::Config(format!("{name} must be >= 0"))),
                other => Ok(other),
            }
        }

        if let Some(p) = self.pause_threshold_percent {
            if !(1..=100).contains(&p) {
                return Err(EngineError::Config(
                    "pause_threshold_percent must be between 1 and 100".into(),
                ));
            }
        }
        let daily_email = non_negative("daily_email_limit", self.daily_email_limit)?;
        let daily_sms = non_negative("daily_sms_limit", self.daily_sms_limit)?;
        let budget = non_negative("monthly_budget_cents", self.monthly_budget_cents)?;
        let email_cost = non_negative("cost_per_email_cents", self.cost_per_email_cents)?;
        let sms_cost = non_negative("cost_per_sms_cents", self.cost_per_sms_cents)?;
        let wa_cost = non_negative("cost_per_whatsapp_cents", self.cost_per_whatsapp_cents)?;

        if let Some(v) = daily_email {
            state.daily_email_limit = v;
        }
        if let Some(v) = daily_sms {
            state.daily_sms_limit = v;
        }
        if let Some(v) = budget {
            state.monthly_budget_cents = v;
        }
        if let Some(v) = self.pause_threshold_percent {
            state.pause_threshold_percent = v;
        }
        if let Some(v) = email_cost {
            state.cost_per_email_cents = v;
        }
        if let Some(v) = sms_cost {
            state.cost_per_sms_cents = v;
        }
        if let Some(v) = wa_cost {
            state.cost_per_whatsapp_cents = v;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub batch_size: i64,
    pub public_base_url: String,
    pub booking_url: String,
    pub sender_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub ran: bool,
    pub skipped_reason: Option<String>,
    pub examined: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
    pub deferred: usize,
    pub completed: usize,
    pub halted: usize,
    pub paused: bool,
    /// An operator pause or stop arrived mid-batch; remaining leads wait.
    pub interrupted: bool,
}

impl TickReport {
    fn not_run(reason: impl Into<String>, paused: bool) -> Self {
        Self {
            skipped_reason: Some(reason.into()),
            paused,
            ..Self::default()
        }
    }
}

/// Why an otherwise due step cannot go out to this lead.
fn skip_reason(lead: &LeadRow, step: &PlannedStep) -> Option<&'static str> {
    match step.channel {
        Channel::Email if lead.email.is_none() => return Some("no email address"),
        Channel::Sms | Channel::Whatsapp if lead.phone.is_none() => {
            return Some("no phone number");
        }
        Channel::Sms | Channel::Whatsapp if !lead.marketing_opt_in => {
            return Some("no marketing consent");
        }
        _ => {}
    }
    if !templates::is_eligible(lead.status, step.key()) {
        return Some("template not eligible for lead status");
    }
    None
}

fn recipient(lead: &LeadRow, channel: Channel) -> Option<String> {
    match channel {
        Channel::Email => lead.email.clone(),
        Channel::Sms | Channel::Whatsapp => lead.phone.clone(),
    }
}

pub struct Engine {
    store: Arc<dyn EngineStore>,
    sender: Arc<dyn MessageSender>,
    settings: EngineSettings,
    writer: Mutex<()>,
    /// Pending operator pause/stop calls. A running tick stops between
    /// leads while this is non-zero instead of holding `writer` to the end.
    halt_requests: AtomicUsize,
}

/// Registers an operator halt until dropped.
struct HaltRequest<'a>(&'a AtomicUsize);

impl Drop for HaltRequest<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Engine {
    pub fn new(
        store: Arc<dyn EngineStore>,
        sender: Arc<dyn MessageSender>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            sender,
            settings,
            writer: Mutex::new(()),
            halt_requests: AtomicUsize::new(0),
        }
    }

    fn request_halt(&self) -> HaltRequest<'_> {
        self.halt_requests.fetch_add(1, Ordering::SeqCst);
        HaltRequest(&self.halt_requests)
    }

    fn halt_requested(&self) -> bool {
        self.halt_requests.load(Ordering::SeqCst) > 0
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn unsubscribe_url(&self, lead_id: Uuid) -> String {
        format!(
            "{}/api/v1/public/unsubscribe/{lead_id}",
            self.settings.public_base_url
        )
    }

    pub fn template_data(&self, lead: &LeadRow, clinic_name: Option<String>) -> TemplateData {
        let full_name = lead.name.trim().to_string();
        let first_name = full_name
            .split_whitespace()
            .next()
            .unwrap_or("there")
            .to_string();
        TemplateData {
            first_name,
            full_name,
            city: lead.city.clone(),
            clinic_name,
            booking_url: self.settings.booking_url.clone(),
            sender_name: self.settings.sender_name.clone(),
            unsubscribe_url: self.unsubscribe_url(lead.lead_id),
        }
    }

    pub fn render_step(step: &PlannedStep, data: &TemplateData) -> RenderedMessage {
        match &step.content {
            StepContent::Catalog(id) => templates::render(*id, data),
            StepContent::Custom { subject, body } => {
                templates::render_custom(step.channel, subject.as_deref(), body, data)
            }
        }
    }

    /// Current state as the next tick would see it (counters rolled).
    pub async fn status(&self) -> Result<EngineState, EngineError> {
        let mut state = self.store.load_state().await?;
        state.roll_over(Utc::now());
        Ok(state)
    }

    async fn mutate<F>(&self, f: F) -> Result<EngineState, EngineError>
    where
        F: FnOnce(&mut EngineState) -> Result<(), EngineError> + Send,
    {
        let _writer = self.writer.lock().await;
        let lease = self
            .store
            .acquire_lease(true)
            .await?
            .ok_or(EngineError::Busy)?;

        let result = async {
            let mut state = self.store.load_state().await?;
            state.roll_over(Utc::now());
            f(&mut state)?;
            self.store.save_state(&state).await?;
            Ok(state)
        }
        .await;

        if let Err(e) = self.store.release_lease(lease).await {
            tracing::warn!(error = %e, "failed to release engine lease");
        }
        result
    }

    pub async fn start(&self) -> Result<EngineState, EngineError> {
        let state = self.mutate(|s| {
            s.is_running = true;
            Ok(())
        })
        .await?;
        tracing::info!(paused = state.is_paused, "engine started");
        Ok(state)
    }

    pub async fn stop(&self) -> Result<EngineState, EngineError> {
        let _halt = self.request_halt();
        let state = self.mutate(|s| {
            s.is_running = false;
            Ok(())
        })
        .await?;
        tracing::info!("engine stopped");
        Ok(state)
    }

    pub async fn pause(&self, reason: String) -> Result<EngineState, EngineError> {
        tracing::info!(%reason, "engine paused by operator");
        let _halt = self.request_halt();
        self.mutate(move |s| {
            s.pause(reason);
            Ok(())
        })
        .await
    }

    /// Clears the pause. If the budget is still over the threshold the next
    /// tick pauses again.
    pub async fn resume(&self) -> Result<EngineState, EngineError> {
        let state = self.mutate(|s| {
            s.is_paused = false;
            s.pause_reason = None;
            Ok(())
        })
        .await?;
        if state.budget_threshold_reached() {
            tracing::warn!("engine resumed while monthly budget threshold is still reached");
        }
        Ok(state)
    }

    pub async fn update_config(&self, update: EngineConfigUpdate) -> Result<EngineState, EngineError> {
        self.mutate(move |s| update.apply(s)).await
    }

    pub async fn reset_counters(&self) -> Result<EngineState, EngineError> {
        self.mutate(|s| {
            s.emails_sent_today = 0;
            s.sms_sent_today = 0;
            s.month_spend_cents = 0;
            Ok(())
        })
        .await
    }

    pub async fn run_tick(
        &self,
        now: DateTime<Utc>,
        trigger: TickTrigger,
    ) -> Result<TickReport, EngineError> {
        let _writer = self.writer.lock().await;
        let Some(lease) = self.store.acquire_lease(false).await? else {
            tracing::debug!("engine lease held by another instance; skipping tick");
            return Ok(TickReport::not_run("lease held by another instance", false));
        };

        let result = self.tick_locked(now, trigger).await;

        if let Err(e) = self.store.release_lease(lease).await {
            tracing::warn!(error = %e, "failed to release engine lease");
        }
        result
    }

    async fn tick_locked(
        &self,
        now: DateTime<Utc>,
        trigger: TickTrigger,
    ) -> Result<TickReport, EngineError> {
        let mut state = self.store.load_state().await?;
        let rolled = state.roll_over(now);

        if state.is_paused {
            if rolled {
                self.store.save_state(&state).await?;
            }
            let reason = state.pause_reason.clone().unwrap_or_else(|| "paused".into());
            return Ok(TickReport::not_run(format!("paused: {reason}"), true));
        }
        if trigger == TickTrigger::Scheduled && !state.is_running {
            if rolled {
                self.store.save_state(&state).await?;
            }
            return Ok(TickReport::not_run("engine is stopped", false));
        }

        let mut report = TickReport {
            ran: true,
            ..TickReport::default()
        };
        state.last_run_at = Some(now);

        if state.budget_threshold_reached() {
            let reason = state.budget_pause_reason();
            tracing::warn!(%reason, "engine self-paused");
            state.pause(reason);
            report.paused = true;
            self.store.save_state(&state).await?;
            return Ok(report);
        }

        let leads = self.store.due_leads(now, self.settings.batch_size).await?;
        let mut plans: HashMap<Option<Uuid>, Arc<SequencePlan>> = HashMap::new();
        let mut clinic_names: HashMap<Uuid, Option<String>> = HashMap::new();

        for lead in leads {
            if state.is_paused {
                break;
            }
            if self.halt_requested() {
                tracing::info!(examined = report.examined, "operator halt requested; ending tick early");
                report.interrupted = true;
                break;
            }
            report.examined += 1;

            let plan = match plans.get(&lead.sequence_id) {
                Some(p) => Arc::clone(p),
                None => match self.store.load_plan(lead.sequence_id).await {
                    Ok(p) => {
                        let p = Arc::new(p);
                        plans.insert(lead.sequence_id, Arc::clone(&p));
                        p
                    }
                    Err(EngineError::Plan(msg)) => {
                        tracing::error!(lead_id = %lead.lead_id, error = %msg, "broken sequence; halting lead");
                        self.store.halt_lead(lead.lead_id).await?;
                        report.halted += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            let Some(step) = plan.step(lead.sequence_day) else {
                self.store.halt_lead(lead.lead_id).await?;
                report.completed += 1;
                tracing::info!(lead_id = %lead.lead_id, "sequence completed");
                continue;
            };

            if !lead.status.accepts_automation() {
                self.store.halt_lead(lead.lead_id).await?;
                report.halted += 1;
                tracing::info!(lead_id = %lead.lead_id, status = %lead.status, "lead left the funnel; sequence halted");
                continue;
            }

            let next_day = lead.sequence_day + 1;

            if let Some(reason) = skip_reason(&lead, step) {
                let commit = StepCommit {
                    lead_id: lead.lead_id,
                    observed_status: lead.status,
                    status: lead.status,
                    contacted_at: lead.contacted_at,
                    last_sent_at: lead.last_sent_at,
                    sequence_day: next_day,
                    next_due_at: plan.due_after(next_day, now),
                    message: MessageEntry {
                        lead_id: lead.lead_id,
                        campaign_id: lead.campaign_id,
                        channel: step.channel,
                        template_key: step.key().label().to_string(),
                        sequence_day: lead.sequence_day,
                        outcome: MessageOutcome::Skipped,
                        provider_message_id: None,
                        error: Some(reason.to_string()),
                        cost_cents: 0,
                    },
                    today: state.counters_date,
                };
                self.store.commit_step(&commit, &state).await?;
                report.skipped += 1;
                tracing::debug!(lead_id = %lead.lead_id, sequence_day = lead.sequence_day, reason, "step skipped");
                continue;
            }

            if state.daily_limit_reached(step.channel) {
                report.deferred += 1;
                continue;
            }

            if state.budget_threshold_reached() {
                let reason = state.budget_pause_reason();
                tracing::warn!(%reason, "engine self-paused");
                state.pause(reason);
                report.paused = true;
                break;
            }

            let clinic_name = match lead.clinic_id {
                Some(cid) => match clinic_names.get(&cid) {
                    Some(name) => name.clone(),
                    None => {
                        let name = self.store.clinic_name(cid).await?;
                        clinic_names.insert(cid, name.clone());
                        name
                    }
                },
                None => None,
            };

            let data = self.template_data(&lead, clinic_name);
            let rendered = Self::render_step(step, &data);
            let Some(to) = recipient(&lead, step.channel) else {
                continue;
            };
            let message = OutboundMessage {
                channel: step.channel,
                to,
                subject: rendered.subject,
                text: rendered.text,
                html: rendered.html,
            };

            match self.sender.send(&message).await {
                Ok(receipt) => {
                    let cost = state.cost_for(step.channel);
                    state.record_send(step.channel, cost);

                    let commit = StepCommit {
                        lead_id: lead.lead_id,
                        observed_status: lead.status,
                        status: lead.status.after_automated_send(),
                        contacted_at: lead.contacted_at.or(Some(now)),
                        last_sent_at: Some(now),
                        sequence_day: next_day,
                        next_due_at: plan.due_after(next_day, now),
                        message: MessageEntry {
                            lead_id: lead.lead_id,
                            campaign_id: lead.campaign_id,
                            channel: step.channel,
                            template_key: step.key().label().to_string(),
                            sequence_day: lead.sequence_day,
                            outcome: MessageOutcome::Sent,
                            provider_message_id: receipt.provider_message_id,
                            error: None,
                            cost_cents: cost,
                        },
                        today: state.counters_date,
                    };
                    self.store.commit_step(&commit, &state).await?;
                    report.sent += 1;
                    tracing::info!(
                        lead_id = %lead.lead_id,
                        channel = %step.channel,
                        sequence_day = lead.sequence_day,
                        template = step.key().label(),
                        "step sent"
                    );

                    if state.budget_threshold_reached() {
                        let reason = state.budget_pause_reason();
                        tracing::warn!(%reason, "engine self-paused");
                        state.pause(reason);
                        report.paused = true;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        lead_id = %lead.lead_id,
                        channel = %step.channel,
                        error = %e,
                        "send failed; lead stays due"
                    );
                    let entry = MessageEntry {
                        lead_id: lead.lead_id,
                        campaign_id: lead.campaign_id,
                        channel: step.channel,
                        template_key: step.key().label().to_string(),
                        sequence_day: lead.sequence_day,
                        outcome: MessageOutcome::Failed,
                        provider_message_id: None,
                        error: Some(e.to_string()),
                        cost_cents: 0,
                    };
                    self.store.record_failure(&entry).await?;
                    report.failed += 1;
                }
            }
        }

        self.store.save_state(&state).await?;
        Ok(report)
    }

    pub fn spawn_ticker(self: Arc<Self>, every: StdDuration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.run_tick(Utc::now(), TickTrigger::Scheduled).await {
                    Ok(report) if report.ran => tracing::info!(
                        examined = report.examined,
                        sent = report.sent,
                        skipped = report.skipped,
                        failed = report.failed,
                        deferred = report.deferred,
                        paused = report.paused,
                        "engine tick finished"
                    ),
                    Ok(report) => tracing::debug!(reason = ?report.skipped_reason, "engine tick idle"),
                    Err(e) => tracing::error!(error = %e, "engine tick failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::memory::{MemoryStore, RecordingSender};
    use super::*;
    use crate::lifecycle::LeadStatus;
    use crate::outbound::{SendError, SendReceipt};
    use chrono::{Duration, TimeZone};

    fn settings() -> EngineSettings {
        EngineSettings {
            batch_size: 100,
            public_base_url: "https://app.example.com".into(),
            booking_url: "https://app.example.com/book".into(),
            sender_name: "Sam".into(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
    }

    fn running_state() -> EngineState {
        let mut s = EngineState::fresh(t0());
        s.is_running = true;
        s
    }

    fn engine(store: &Arc<MemoryStore>, sender: &Arc<RecordingSender>) -> Engine {
        Engine::new(store.clone(), sender.clone(), settings())
    }

    #[tokio::test]
    async fn test_one_send_then_wait_for_next_delay() {
        let store = Arc::new(MemoryStore::new(running_state()));
        let sender = Arc::new(RecordingSender::default());
        let lead = store.add_lead(MemoryStore::lead("Ana Lopez", t0()));
        let engine = engine(&store, &sender);

        let report = engine.run_tick(t0() + Duration::minutes(1), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.sent, 1);
        let after = store.lead_by_id(lead);
        assert_eq!(after.sequence_day, 1);
        assert_eq!(after.status, LeadStatus::Contacted);
        assert_eq!(after.contacted_at, Some(t0() + Duration::minutes(1)));

        let report = engine.run_tick(t0() + Duration::hours(1), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(sender.sent().len(), 1);
        assert_eq!(store.lead_by_id(lead).sequence_day, 1);

        // day 1 is due two days after the first send
        let report = engine
            .run_tick(t0() + Duration::days(2) + Duration::minutes(1), TickTrigger::Scheduled)
            .await
            .unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(store.lead_by_id(lead).sequence_day, 2);
        assert_eq!(sender.sent()[1].subject.as_deref(), Some("What 12 extra patients a month looks like"));
    }

    #[tokio::test]
    async fn test_daily_email_limit_is_never_exceeded() {
        let mut state = running_state();
        state.daily_email_limit = 3;
        let store = Arc::new(MemoryStore::new(state));
        let sender = Arc::new(RecordingSender::default());
        for i in 0..5 {
            store.add_lead(MemoryStore::lead(&format!("Lead {i}"), t0()));
        }
        let engine = engine(&store, &sender);

        let report = engine.run_tick(t0() + Duration::minutes(5), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.sent, 3);
        assert_eq!(report.deferred, 2);

        let report = engine.run_tick(t0() + Duration::hours(3), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(store.state().emails_sent_today, 3);

        // the next calendar day the remaining two go out
        let report = engine.run_tick(t0() + Duration::days(1), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(store.state().emails_sent_today, 2);
    }

    #[tokio::test]
    async fn test_pauses_when_budget_threshold_reached() {
        let mut state = running_state();
        state.monthly_budget_cents = 10;
        state.pause_threshold_percent = 50;
        state.cost_per_email_cents = 2;
        let store = Arc::new(MemoryStore::new(state));
        let sender = Arc::new(RecordingSender::default());
        for i in 0..10 {
            store.add_lead(MemoryStore::lead(&format!("Lead {i}"), t0()));
        }
        let engine = engine(&store, &sender);

        let report = engine.run_tick(t0() + Duration::minutes(1), TickTrigger::Scheduled).await.unwrap();
        // 2 + 2 + 2 = 6 >= 5 after the third send
        assert_eq!(report.sent, 3);
        assert!(report.paused);
        let s = store.state();
        assert!(s.is_paused);
        assert!(s.pause_reason.unwrap().contains("budget"));
        assert!(s.month_spend_cents * 100 >= s.monthly_budget_cents * i64::from(s.pause_threshold_percent));

        let report = engine.run_tick(t0() + Duration::minutes(2), TickTrigger::Manual).await.unwrap();
        assert!(!report.ran);
        assert_eq!(sender.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_stopped_engine_only_runs_manually() {
        let store = Arc::new(MemoryStore::new(EngineState::fresh(t0())));
        let sender = Arc::new(RecordingSender::default());
        store.add_lead(MemoryStore::lead("Ana", t0()));
        let engine = engine(&store, &sender);

        let report = engine.run_tick(t0(), TickTrigger::Scheduled).await.unwrap();
        assert!(!report.ran);
        assert_eq!(report.skipped_reason.as_deref(), Some("engine is stopped"));

        let report = engine.run_tick(t0(), TickTrigger::Manual).await.unwrap();
        assert_eq!(report.sent, 1);
    }

    #[tokio::test]
    async fn test_failed_send_leaves_lead_due() {
        let store = Arc::new(MemoryStore::new(running_state()));
        let sender = Arc::new(RecordingSender::default());
        let mut lead = MemoryStore::lead("Ana", t0());
        lead.email = Some("bounce@example.com".into());
        let id = store.add_lead(lead);
        sender.fail_for("bounce@example.com");
        let engine = engine(&store, &sender);

        let report = engine.run_tick(t0() + Duration::minutes(1), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.failed, 1);
        let after = store.lead_by_id(id);
        assert_eq!(after.sequence_day, 0);
        assert_eq!(after.status, LeadStatus::New);
        assert_eq!(after.next_due_at, Some(t0()));
        assert_eq!(store.state().emails_sent_today, 0);
        assert_eq!(store.state().month_spend_cents, 0);
        assert_eq!(store.messages()[0].outcome, MessageOutcome::Failed);
    }

    #[tokio::test]
    async fn test_terminal_and_engaged_leads_are_halted_not_messaged() {
        let store = Arc::new(MemoryStore::new(running_state()));
        let sender = Arc::new(RecordingSender::default());
        let mut ids = Vec::new();
        for status in [LeadStatus::Won, LeadStatus::Lost, LeadStatus::Replied, LeadStatus::Unsubscribed] {
            let mut lead = MemoryStore::lead("Ana", t0());
            lead.status = status;
            ids.push(store.add_lead(lead));
        }
        let engine = engine(&store, &sender);

        let report = engine.run_tick(t0() + Duration::minutes(1), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.halted, 4);
        for id in ids {
            let lead = store.lead_by_id(id);
            assert!(lead.next_due_at.is_none());
            assert!(lead.status.is_terminal() || lead.status == LeadStatus::Replied);
        }
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_sms_step_without_consent_is_skipped_for_free() {
        let store = Arc::new(MemoryStore::new(running_state()));
        let sender = Arc::new(RecordingSender::default());
        let mut lead = MemoryStore::lead("Ana", t0());
        lead.sequence_day = 2; // quick_check_in sms
        lead.phone = Some("+15551234567".into());
        lead.marketing_opt_in = false;
        let id = store.add_lead(lead);
        let engine = engine(&store, &sender);

        let now = t0() + Duration::minutes(1);
        let report = engine.run_tick(now, TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.sent, 0);
        let after = store.lead_by_id(id);
        assert_eq!(after.sequence_day, 3);
        assert_eq!(after.next_due_at, Some(now + Duration::days(3)));
        assert_eq!(after.status, LeadStatus::New);
        assert_eq!(store.state().month_spend_cents, 0);
        assert_eq!(store.messages()[0].outcome, MessageOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_sequence_completes_after_last_step() {
        let store = Arc::new(MemoryStore::new(running_state()));
        let sender = Arc::new(RecordingSender::default());
        let mut lead = MemoryStore::lead("Ana", t0());
        lead.sequence_day = 7;
        let id = store.add_lead(lead);
        let engine = engine(&store, &sender);

        let report = engine.run_tick(t0() + Duration::minutes(1), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(store.lead_by_id(id).next_due_at.is_none());
    }

    #[tokio::test]
    async fn test_tick_skips_while_lease_held_elsewhere() {
        let store = Arc::new(MemoryStore::new(running_state()));
        let sender = Arc::new(RecordingSender::default());
        store.add_lead(MemoryStore::lead("Ana", t0()));
        store.set_lease_held_elsewhere(true);
        let engine = engine(&store, &sender);

        let report = engine.run_tick(t0() + Duration::minutes(1), TickTrigger::Scheduled).await.unwrap();
        assert!(!report.ran);
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_resume_clears_pause_and_next_tick_repauses_if_over_budget() {
        let mut state = running_state();
        state.pause("manual");
        state.monthly_budget_cents = 100;
        state.month_spend_cents = 95;
        state.spend_month = month_key(Utc::now());
        let store = Arc::new(MemoryStore::new(state));
        let sender = Arc::new(RecordingSender::default());
        let engine = engine(&store, &sender);

        let resumed = engine.resume().await.unwrap();
        assert!(!resumed.is_paused);
        assert!(resumed.pause_reason.is_none());

        let report = engine.run_tick(Utc::now(), TickTrigger::Scheduled).await.unwrap();
        assert!(report.paused);
        assert!(store.state().is_paused);
    }

    #[tokio::test]
    async fn test_config_update_validates() {
        let store = Arc::new(MemoryStore::new(EngineState::fresh(Utc::now())));
        let engine = engine(&store, &Arc::new(RecordingSender::default()));

        let err = engine
            .update_config(EngineConfigUpdate {
                pause_threshold_percent: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let err = engine
            .update_config(EngineConfigUpdate {
                daily_email_limit: Some(-1),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));

        let state = engine
            .update_config(EngineConfigUpdate {
                daily_email_limit: Some(50),
                monthly_budget_cents: Some(2_500),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(state.daily_email_limit, 50);
        assert_eq!(store.state().monthly_budget_cents, 2_500);
    }

    #[tokio::test]
    async fn test_custom_sequence_sends_rendered_sms() {
        let store = Arc::new(MemoryStore::new(running_state()));
        let sender = Arc::new(RecordingSender::default());
        let sequence_id = Uuid::new_v4();
        store.add_plan(
            sequence_id,
            SequencePlan::from_steps(vec![PlannedStep {
                channel: Channel::Sms,
                delay: Duration::zero(),
                content: StepContent::Custom {
                    subject: None,
                    body: "Hi {first_name}, book at {booking_url}".into(),
                },
            }]),
        );
        let mut lead = MemoryStore::lead("Ana Lopez", t0());
        lead.sequence_id = Some(sequence_id);
        lead.phone = Some("+15551234567".into());
        let id = store.add_lead(lead);
        let engine = engine(&store, &sender);

        let report = engine.run_tick(t0(), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.sent, 1);
        let sent = sender.sent();
        assert_eq!(sent[0].to, "+15551234567");
        assert_eq!(sent[0].text, "Hi Ana, book at https://app.example.com/book");
        assert_eq!(store.state().sms_sent_today, 1);
        assert_eq!(store.state().month_spend_cents, 8);
        // single-step plan: nothing further is scheduled
        assert!(store.lead_by_id(id).next_due_at.is_none());
        assert_eq!(store.messages()[0].template_key, "custom");
    }

    #[test]
    fn test_roll_over_resets_counters() {
        let mut s = EngineState::fresh(t0());
        s.emails_sent_today = 10;
        s.sms_sent_today = 4;
        s.month_spend_cents = 300;
        assert!(!s.roll_over(t0() + Duration::hours(2)));
        assert!(s.roll_over(t0() + Duration::days(1)));
        assert_eq!(s.emails_sent_today, 0);
        assert_eq!(s.month_spend_cents, 300);
        assert!(s.roll_over(t0() + Duration::days(31)));
        assert_eq!(s.month_spend_cents, 0);
    }

    #[test]
    fn test_zero_budget_means_no_sending() {
        let mut s = EngineState::fresh(t0());
        s.monthly_budget_cents = 0;
        assert!(s.budget_threshold_reached());
    }

    /// Applies an edit to one lead while its message is in flight.
    struct EditingSender {
        store: Arc<MemoryStore>,
        lead: Uuid,
        edit: fn(&mut LeadRow),
        inner: RecordingSender,
    }

    #[async_trait::async_trait]
    impl MessageSender for EditingSender {
        async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
            self.store.update_lead(self.lead, self.edit);
            self.inner.send(message).await
        }
    }

    fn editing_tick_setup(edit: fn(&mut LeadRow)) -> (Arc<MemoryStore>, Arc<EditingSender>, Uuid) {
        let store = Arc::new(MemoryStore::new(running_state()));
        let id = store.add_lead(MemoryStore::lead("Ana Lopez", t0()));
        let sender = Arc::new(EditingSender {
            store: store.clone(),
            lead: id,
            edit,
            inner: RecordingSender::default(),
        });
        (store, sender, id)
    }

    #[tokio::test]
    async fn test_unsubscribe_during_send_is_not_reverted() {
        let (store, sender, id) = editing_tick_setup(|l: &mut LeadRow| {
            l.status = LeadStatus::Unsubscribed;
            l.marketing_opt_in = false;
            l.next_due_at = None;
        });
        let engine = Engine::new(store.clone(), sender.clone(), settings());

        let now = t0() + Duration::minutes(1);
        let report = engine.run_tick(now, TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.sent, 1);

        let after = store.lead_by_id(id);
        assert_eq!(after.status, LeadStatus::Unsubscribed);
        assert!(!after.marketing_opt_in);
        assert!(after.next_due_at.is_none());
        assert_eq!(after.sequence_day, 1);
        assert_eq!(after.contacted_at, Some(now));
        // the send happened, so it is still logged and charged
        assert_eq!(store.messages()[0].outcome, MessageOutcome::Sent);
        assert_eq!(store.state().emails_sent_today, 1);

        let report = engine
            .run_tick(t0() + Duration::days(5), TickTrigger::Scheduled)
            .await
            .unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(sender.inner.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_manual_status_edit_during_send_keeps_schedule() {
        let (store, sender, id) = editing_tick_setup(|l: &mut LeadRow| l.status = LeadStatus::Warm);
        let engine = Engine::new(store.clone(), sender.clone(), settings());

        let now = t0() + Duration::minutes(1);
        engine.run_tick(now, TickTrigger::Scheduled).await.unwrap();

        let after = store.lead_by_id(id);
        assert_eq!(after.status, LeadStatus::Warm);
        assert_eq!(after.sequence_day, 1);
        assert_eq!(after.next_due_at, Some(now + Duration::days(2)));
    }

    /// Issues an operator pause from inside the first send of a tick.
    #[derive(Default)]
    struct PausingSender {
        engine: std::sync::OnceLock<Arc<Engine>>,
        pause: std::sync::Mutex<Option<tokio::task::JoinHandle<Result<EngineState, EngineError>>>>,
        inner: RecordingSender,
    }

    #[async_trait::async_trait]
    impl MessageSender for PausingSender {
        async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
            let result = self.inner.send(message).await;
            {
                let mut pause = self.pause.lock().unwrap();
                if pause.is_none() {
                    let engine = self.engine.get().unwrap().clone();
                    *pause = Some(tokio::spawn(async move {
                        engine.pause("operator".into()).await
                    }));
                }
            }
            // let the pause request register while this tick still holds the writer
            tokio::task::yield_now().await;
            result
        }
    }

    #[tokio::test]
    async fn test_operator_pause_mid_tick_stops_further_sends() {
        let store = Arc::new(MemoryStore::new(running_state()));
        for i in 0..4 {
            store.add_lead(MemoryStore::lead(&format!("Lead {i}"), t0()));
        }
        let sender = Arc::new(PausingSender::default());
        let engine = Arc::new(Engine::new(store.clone(), sender.clone(), settings()));
        assert!(sender.engine.set(engine.clone()).is_ok());

        let report = engine
            .run_tick(t0() + Duration::minutes(1), TickTrigger::Scheduled)
            .await
            .unwrap();
        assert_eq!(report.sent, 1);
        assert!(report.interrupted);
        assert_eq!(sender.inner.sent().len(), 1);

        let pause = sender.pause.lock().unwrap().take().unwrap();
        let paused = pause.await.unwrap().unwrap();
        assert!(paused.is_paused);
        assert_eq!(store.state().pause_reason.as_deref(), Some("operator"));
        assert_eq!(store.state().emails_sent_today, 1);

        let report = engine
            .run_tick(t0() + Duration::minutes(2), TickTrigger::Scheduled)
            .await
            .unwrap();
        assert!(!report.ran);
        assert_eq!(sender.inner.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_inactive_sequence_holds_enrolled_leads() {
        let store = Arc::new(MemoryStore::new(running_state()));
        let sender = Arc::new(RecordingSender::default());
        let sequence_id = Uuid::new_v4();
        store.add_plan(sequence_id, SequencePlan::genius());
        let mut lead = MemoryStore::lead("Ana Lopez", t0());
        lead.sequence_id = Some(sequence_id);
        let id = store.add_lead(lead);
        store.set_sequence_active(sequence_id, false);
        let engine = engine(&store, &sender);

        let report = engine.run_tick(t0() + Duration::minutes(1), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.examined, 0);
        assert!(sender.sent().is_empty());
        let held = store.lead_by_id(id);
        assert_eq!(held.sequence_day, 0);
        assert_eq!(held.next_due_at, Some(t0()));

        store.set_sequence_active(sequence_id, true);
        let report = engine.run_tick(t0() + Duration::minutes(2), TickTrigger::Scheduled).await.unwrap();
        assert_eq!(report.sent, 1);
        assert_eq!(store.lead_by_id(id).sequence_day, 1);
    }
}
