// In-memory store and sender for engine tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::lifecycle::LeadStatus;
use crate::models::{LeadRow, LeadSource};
use crate::outbound::{MessageSender, OutboundMessage, SendError, SendReceipt};

use super::plan::SequencePlan;
use super::store::{EngineLease, EngineStore, MessageEntry, StepCommit};
use super::{EngineError, EngineState};

#[derive(Default)]
struct Inner {
    state: Option<EngineState>,
    leads: Vec<LeadRow>,
    plans: HashMap<Uuid, SequencePlan>,
    inactive_sequences: HashSet<Uuid>,
    messages: Vec<MessageEntry>,
    held_elsewhere: bool,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(state: EngineState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: Some(state),
                ..Inner::default()
            }),
        }
    }

    /// A freshly enrolled lead on the built-in sequence, due at `due`.
    pub fn lead(name: &str, due: DateTime<Utc>) -> LeadRow {
        let id = Uuid::new_v4();
        LeadRow {
            lead_id: id,
            name: name.to_string(),
            email: Some(format!("{}@example.com", id.simple())),
            phone: None,
            status: LeadStatus::New,
            source: LeadSource::Manual,
            city: None,
            state: None,
            country: None,
            clinic_id: None,
            campaign_id: None,
            sequence_id: None,
            sequence_day: 0,
            marketing_opt_in: true,
            notes: None,
            created_at: due,
            updated_at: due,
            contacted_at: None,
            last_sent_at: None,
            next_due_at: Some(due),
            enrolled_at: Some(due),
        }
    }

    pub fn add_lead(&self, lead: LeadRow) -> Uuid {
        let id = lead.lead_id;
        self.inner.lock().unwrap().leads.push(lead);
        id
    }

    pub fn add_plan(&self, sequence_id: Uuid, plan: SequencePlan) {
        self.inner.lock().unwrap().plans.insert(sequence_id, plan);
    }

    pub fn set_sequence_active(&self, sequence_id: Uuid, active: bool) {
        let mut inner = self.inner.lock().unwrap();
        if active {
            inner.inactive_sequences.remove(&sequence_id);
        } else {
            inner.inactive_sequences.insert(sequence_id);
        }
    }

    pub fn lead_by_id(&self, id: Uuid) -> LeadRow {
        self.inner
            .lock()
            .unwrap()
            .leads
            .iter()
            .find(|l| l.lead_id == id)
            .cloned()
            .unwrap()
    }

    /// Edits a stored lead the way an operator or public link would.
    pub fn update_lead(&self, id: Uuid, edit: impl FnOnce(&mut LeadRow)) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(lead) = inner.leads.iter_mut().find(|l| l.lead_id == id) {
            edit(lead);
        }
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().unwrap().state.clone().unwrap()
    }

    pub fn messages(&self) -> Vec<MessageEntry> {
        self.inner.lock().unwrap().messages.clone()
    }

    pub fn set_lease_held_elsewhere(&self, held: bool) {
        self.inner.lock().unwrap().held_elsewhere = held;
    }
}

#[async_trait]
impl EngineStore for MemoryStore {
    async fn acquire_lease(&self, wait: bool) -> Result<Option<EngineLease>, EngineError> {
        if self.inner.lock().unwrap().held_elsewhere && !wait {
            return Ok(None);
        }
        Ok(Some(EngineLease::local()))
    }

    async fn release_lease(&self, _lease: EngineLease) -> Result<(), EngineError> {
        Ok(())
    }

    async fn load_state(&self) -> Result<EngineState, EngineError> {
        Ok(self.state())
    }

    async fn save_state(&self, state: &EngineState) -> Result<(), EngineError> {
        self.inner.lock().unwrap().state = Some(state.clone());
        Ok(())
    }

    async fn due_leads(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<LeadRow>, EngineError> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<LeadRow> = inner
            .leads
            .iter()
            .filter(|l| l.next_due_at.is_some_and(|d| d <= now))
            .filter(|l| {
                l.sequence_id
                    .is_none_or(|id| !inner.inactive_sequences.contains(&id))
            })
            .cloned()
            .collect();
        due.sort_by_key(|l| l.next_due_at);
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn load_plan(&self, sequence_id: Option<Uuid>) -> Result<SequencePlan, EngineError> {
        match sequence_id {
            None => Ok(SequencePlan::genius()),
            Some(id) => self
                .inner
                .lock()
                .unwrap()
                .plans
                .get(&id)
                .cloned()
                .ok_or_else(|| EngineError::Plan(format!("sequence {id} missing"))),
        }
    }

    async fn clinic_name(&self, _clinic_id: Uuid) -> Result<Option<String>, EngineError> {
        Ok(Some("Bright Smiles".to_string()))
    }

    async fn halt_lead(&self, lead_id: Uuid) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(lead) = inner.leads.iter_mut().find(|l| l.lead_id == lead_id) {
            lead.next_due_at = None;
        }
        Ok(())
    }

    async fn commit_step(&self, commit: &StepCommit, state: &EngineState) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(lead) = inner
            .leads
            .iter_mut()
            .find(|l| l.lead_id == commit.lead_id && l.sequence_day == commit.message.sequence_day)
        {
            let current = lead.status;
            if current == commit.observed_status {
                lead.status = commit.status;
            }
            lead.contacted_at = lead.contacted_at.or(commit.contacted_at);
            lead.last_sent_at = commit.last_sent_at;
            lead.sequence_day = commit.sequence_day;
            lead.next_due_at = if current.accepts_automation() {
                commit.next_due_at
            } else {
                None
            };
        }
        inner.messages.push(commit.message.clone());
        inner.state = Some(state.clone());
        Ok(())
    }

    async fn record_failure(&self, entry: &MessageEntry) -> Result<(), EngineError> {
        self.inner.lock().unwrap().messages.push(entry.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundMessage>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_for(&self, to: &str) {
        self.failing.lock().unwrap().insert(to.to_string());
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SendError> {
        if self.failing.lock().unwrap().contains(&message.to) {
            return Err(SendError::Provider {
                status: 422,
                body: "rejected".into(),
            });
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(SendReceipt {
            provider_message_id: Some(format!("msg-{}", self.sent.lock().unwrap().len())),
        })
    }
}
