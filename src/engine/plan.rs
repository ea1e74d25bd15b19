use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Channel, SequenceStepRow};
use crate::templates::{TemplateId, TemplateKey};

use super::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepContent {
    Catalog(TemplateId),
    Custom { subject: Option<String>, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub channel: Channel,
    /// Wait after the previous send (or after enrollment for the first step).
    pub delay: Duration,
    pub content: StepContent,
}

impl PlannedStep {
    pub fn key(&self) -> TemplateKey {
        match &self.content {
            StepContent::Catalog(id) => TemplateKey::Catalog(*id),
            StepContent::Custom { .. } => TemplateKey::Custom,
        }
    }
}

pub fn step_delay(days: i32, hours: i32) -> Duration {
    Duration::days(i64::from(days.max(0))) + Duration::hours(i64::from(hours.max(0)))
}

/// Ordered steps a lead walks through; `sequence_day` indexes into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePlan {
    steps: Vec<PlannedStep>,
}

impl SequencePlan {
    /// The built-in drip used when a lead has no custom sequence.
    pub fn genius() -> Self {
        let catalog = |channel, days, id| PlannedStep {
            channel,
            delay: step_delay(days, 0),
            content: StepContent::Catalog(id),
        };
        Self {
            steps: vec![
                catalog(Channel::Email, 0, TemplateId::PainAwareness),
                catalog(Channel::Email, 2, TemplateId::RoiStory),
                catalog(Channel::Sms, 2, TemplateId::QuickCheckIn),
                catalog(Channel::Email, 3, TemplateId::CaseStudy),
                catalog(Channel::Whatsapp, 3, TemplateId::DemoInvite),
                catalog(Channel::Email, 4, TemplateId::ObjectionHandling),
                catalog(Channel::Email, 7, TemplateId::Breakup),
            ],
        }
    }

    pub fn from_steps(steps: Vec<PlannedStep>) -> Self {
        Self { steps }
    }

    pub fn from_rows(rows: &[SequenceStepRow]) -> Result<Self, EngineError> {
        let mut rows: Vec<&SequenceStepRow> = rows.iter().collect();
        rows.sort_by_key(|r| r.step_order);

        let mut steps = Vec::with_capacity(rows.len());
        for r in rows {
            let content = match (&r.template_id, &r.body) {
                (Some(tid), _) => {
                    let id = tid.parse::<TemplateId>().map_err(|e| {
                        EngineError::Plan(format!("step {}: {e}", r.step_order))
                    })?;
                    if !id.fits_channel(r.channel) {
                        return Err(EngineError::Plan(format!(
                            "step {}: template {id} cannot be sent over {}",
                            r.step_order, r.channel
                        )));
                    }
                    StepContent::Catalog(id)
                }
                (None, Some(body)) => StepContent::Custom {
                    subject: r.subject.clone(),
                    body: body.clone(),
                },
                (None, None) => {
                    return Err(EngineError::Plan(format!(
                        "step {} has neither body nor template",
                        r.step_order
                    )));
                }
            };
            steps.push(PlannedStep {
                channel: r.channel,
                delay: step_delay(r.delay_days, r.delay_hours),
                content,
            });
        }
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn step(&self, day: i32) -> Option<&PlannedStep> {
        usize::try_from(day).ok().and_then(|i| self.steps.get(i))
    }

    /// When step `day` becomes due, counting from `reference` (the previous
    /// send or the enrollment time). `None` once the plan is exhausted.
    pub fn due_after(&self, day: i32, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.step(day).map(|s| reference + s.delay)
    }
}

pub async fn load_plan(db: &PgPool, sequence_id: Option<Uuid>) -> Result<SequencePlan, EngineError> {
    let Some(sequence_id) = sequence_id else {
        return Ok(SequencePlan::genius());
    };

    let rows: Vec<SequenceStepRow> = sqlx::query_as::<_, SequenceStepRow>(
        r#"
        SELECT step_id, sequence_id, step_order, channel, delay_days, delay_hours,
               subject, body, template_id, created_at
        FROM sequence_step
        WHERE sequence_id = $1
        ORDER BY step_order ASC
        "#,
    )
    .bind(sequence_id)
    .fetch_all(db)
    .await?;

    SequencePlan::from_rows(&rows)
}

/// When a lead enrolled at `now` gets its first step.
pub async fn enrollment_due(
    db: &PgPool,
    sequence_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, EngineError> {
    let plan = load_plan(db, sequence_id).await?;
    plan.due_after(0, now)
        .ok_or_else(|| EngineError::Plan("sequence has no steps".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(order: i32, channel: Channel, template: Option<&str>, body: Option<&str>) -> SequenceStepRow {
        SequenceStepRow {
            step_id: Uuid::new_v4(),
            sequence_id: Uuid::nil(),
            step_order: order,
            channel,
            delay_days: 1,
            delay_hours: 6,
            subject: None,
            body: body.map(str::to_string),
            template_id: template.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_genius_plan_starts_immediately() {
        let plan = SequencePlan::genius();
        assert_eq!(plan.len(), 7);
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(plan.due_after(0, t0), Some(t0));
        assert_eq!(plan.due_after(1, t0), Some(t0 + Duration::days(2)));
        assert_eq!(plan.due_after(7, t0), None);
        assert!(plan.step(-1).is_none());
    }

    #[test]
    fn test_rows_are_ordered_and_delays_combined() {
        let rows = vec![
            row(2, Channel::Sms, None, Some("Hi {first_name}")),
            row(1, Channel::Email, Some("roi_story"), None),
        ];
        let plan = SequencePlan::from_rows(&rows).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.steps()[0].content, StepContent::Catalog(TemplateId::RoiStory));
        assert_eq!(plan.steps()[1].delay, Duration::hours(30));
        assert_eq!(plan.steps()[1].key(), TemplateKey::Custom);
    }

    #[test]
    fn test_rejects_template_on_wrong_channel() {
        let rows = vec![row(0, Channel::Sms, Some("case_study"), None)];
        assert!(matches!(SequencePlan::from_rows(&rows), Err(EngineError::Plan(_))));
    }

    #[test]
    fn test_rejects_unknown_template() {
        let rows = vec![row(0, Channel::Email, Some("newsletter"), None)];
        assert!(SequencePlan::from_rows(&rows).is_err());
    }
}
