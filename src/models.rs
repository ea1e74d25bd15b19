use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::engine::Engine;
use crate::lifecycle::{BookingStatus, CampaignStatus, LeadStatus, ParseEnumError};

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub engine: Arc<Engine>,
    pub operator_token_sha256: String,
}

/* -------------------------
   API envelopes
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct OkData {
    pub ok: bool,
}

pub fn ok() -> ApiOk<OkData> {
    ApiOk {
        data: OkData { ok: true },
    }
}

/* -------------------------
   Enums stored as text
--------------------------*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Whatsapp,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Whatsapp => "whatsapp",
        }
    }

    /// SMS and WhatsApp share the short-message budget and consent rules.
    pub fn is_short_message(self) -> bool {
        !matches!(self, Channel::Email)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum LeadSource {
    Manual,
    CsvImport,
    Chatbot,
    Booking,
    Referral,
    Other,
}

impl LeadSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LeadSource::Manual => "manual",
            LeadSource::CsvImport => "csv_import",
            LeadSource::Chatbot => "chatbot",
            LeadSource::Booking => "booking",
            LeadSource::Referral => "referral",
            LeadSource::Other => "other",
        }
    }
}

impl FromStr for LeadSource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "manual" => LeadSource::Manual,
            "csv_import" | "csv" | "import" => LeadSource::CsvImport,
            "chatbot" | "chat" => LeadSource::Chatbot,
            "booking" => LeadSource::Booking,
            "referral" => LeadSource::Referral,
            "other" => LeadSource::Other,
            _ => {
                return Err(ParseEnumError {
                    kind: "lead source",
                    value: s.to_string(),
                })
            }
        };
        Ok(source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum CampaignType {
    Drip,
    Reactivation,
    Broadcast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum MessageOutcome {
    Sent,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum UserRole {
    Owner,
    Staff,
    Admin,
}

/* -------------------------
   DB Row Models
--------------------------*/

pub const LEAD_COLUMNS: &str = "lead_id, name, email, phone, status, source, city, state, country, \
     clinic_id, campaign_id, sequence_id, sequence_day, marketing_opt_in, notes, \
     created_at, updated_at, contacted_at, last_sent_at, next_due_at, enrolled_at";

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LeadRow {
    pub lead_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: LeadStatus,
    pub source: LeadSource,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub clinic_id: Option<Uuid>,
    pub campaign_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
    pub sequence_day: i32,
    pub marketing_opt_in: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub contacted_at: Option<DateTime<Utc>>,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub next_due_at: Option<DateTime<Utc>>,
    /// Set while the lead belongs to a sequence, even when its schedule is
    /// halted by a status change.
    pub enrolled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ClinicRow {
    pub clinic_id: Uuid,
    pub name: String,
    pub slug: String,
    pub brand_color: Option<String>,
    pub logo_url: Option<String>,
    pub owner_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SequenceRow {
    pub sequence_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct SequenceStepRow {
    pub step_id: Uuid,
    pub sequence_id: Uuid,
    pub step_order: i32,
    pub channel: Channel,
    pub delay_days: i32,
    pub delay_hours: i32,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub template_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CampaignRow {
    pub campaign_id: Uuid,
    pub name: String,
    pub campaign_type: CampaignType,
    pub status: CampaignStatus,
    pub sequence_id: Option<Uuid>,
    pub total_sent: i64,
    pub sent_today: i32,
    pub sent_today_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct BookingRow {
    pub booking_id: Uuid,
    pub clinic_id: Uuid,
    pub patient_name: String,
    pub patient_email: Option<String>,
    pub patient_phone: Option<String>,
    pub status: BookingStatus,
    pub preferred_date: Option<NaiveDate>,
    pub preferred_time: Option<NaiveTime>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UserRow {
    pub user_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: UserRole,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct MessageLogRow {
    pub message_id: Uuid,
    pub lead_id: Uuid,
    pub campaign_id: Option<Uuid>,
    pub channel: Channel,
    pub template_key: String,
    pub sequence_day: i32,
    pub outcome: MessageOutcome,
    pub provider_message_id: Option<String>,
    pub error: Option<String>,
    pub cost_cents: i64,
    pub created_at: DateTime<Utc>,
}

/* -------------------------
   Helpers
--------------------------*/

/// Trims and drops empty optional text.
pub fn clean_opt(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

/// Keeps a leading `+` and the digits; anything shorter than 7 digits is
/// rejected.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 || digits.len() > 15 {
        return None;
    }
    Some(if plus { format!("+{digits}") } else { digits })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_check() {
        assert!(is_plausible_email("dr.smith@clinic.com"));
        assert!(!is_plausible_email("dr.smith"));
        assert!(!is_plausible_email("@clinic.com"));
        assert!(!is_plausible_email("a b@clinic.com"));
        assert!(!is_plausible_email("a@clinic"));
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+1 (555) 123-4567").as_deref(), Some("+15551234567"));
        assert_eq!(normalize_phone("555 123 4567").as_deref(), Some("5551234567"));
        assert_eq!(normalize_phone("12-34"), None);
    }

    #[test]
    fn test_lead_source_parse() {
        assert_eq!("CSV".parse::<LeadSource>().unwrap(), LeadSource::CsvImport);
        assert_eq!("manual".parse::<LeadSource>().unwrap(), LeadSource::Manual);
        assert!("billboard".parse::<LeadSource>().is_err());
    }
}
