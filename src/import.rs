// src/import.rs
//
// CSV lead import. Parsing is pure and reports bad rows by line; only the
// accepted rows are written, all in one transaction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::engine::plan;
use crate::error::{db_error, ApiError};
use crate::lifecycle::LeadStatus;
use crate::models::{is_plausible_email, normalize_phone, LeadSource};
use crate::routes::lead_routes::ensure_sequence_open;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("csv has no header row")]
    MissingHeader,
    #[error("csv needs a name column (name, full_name, contact or first_name/last_name)")]
    NoNameColumn,
    #[error("csv needs an email or phone column")]
    NoContactColumn,
    #[error("csv could not be read: {0}")]
    Csv(#[from] csv::Error),
}

impl From<ImportError> for ApiError {
    fn from(e: ImportError) -> Self {
        ApiError::BadRequest("INVALID_CSV", e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedLead {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub status: LeadStatus,
    pub source: LeadSource,
    pub marketing_opt_in: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    pub line: u64,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ParsedImport {
    pub leads: Vec<ImportedLead>,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Field {
    Name,
    FirstName,
    LastName,
    Email,
    Phone,
    City,
    State,
    Country,
    Status,
    Source,
    OptIn,
    Notes,
}

fn field_for_header(header: &str) -> Option<Field> {
    let h = header
        .trim()
        .trim_start_matches('\u{feff}')
        .to_ascii_lowercase()
        .replace([' ', '-'], "_");
    let field = match h.as_str() {
        "name" | "full_name" | "fullname" | "contact" | "contact_name" => Field::Name,
        "first_name" | "firstname" => Field::FirstName,
        "last_name" | "lastname" | "surname" => Field::LastName,
        "email" | "e_mail" | "email_address" => Field::Email,
        "phone" | "mobile" | "phone_number" | "cell" => Field::Phone,
        "city" => Field::City,
        "state" | "province" | "region" => Field::State,
        "country" => Field::Country,
        "status" => Field::Status,
        "source" => Field::Source,
        "marketing_opt_in" | "opt_in" | "optin" | "consent" => Field::OptIn,
        "notes" | "note" => Field::Notes,
        _ => return None,
    };
    Some(field)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "n" => Some(false),
        "1" | "true" | "yes" | "y" | "x" => Some(true),
        _ => None,
    }
}

struct Columns(HashMap<Field, usize>);

impl Columns {
    fn get<'r>(&self, record: &'r csv::StringRecord, field: Field) -> Option<&'r str> {
        self.0
            .get(&field)
            .and_then(|&i| record.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

fn lead_from_record(cols: &Columns, record: &csv::StringRecord) -> Result<ImportedLead, String> {
    let name = match cols.get(record, Field::Name) {
        Some(n) => n.to_string(),
        None => {
            let parts: Vec<&str> = [Field::FirstName, Field::LastName]
                .into_iter()
                .filter_map(|f| cols.get(record, f))
                .collect();
            parts.join(" ")
        }
    };
    if name.is_empty() {
        return Err("missing name".into());
    }

    let email = match cols.get(record, Field::Email) {
        Some(e) if is_plausible_email(e) => Some(e.to_ascii_lowercase()),
        Some(e) => return Err(format!("invalid email '{e}'")),
        None => None,
    };
    let phone = match cols.get(record, Field::Phone) {
        Some(p) => Some(normalize_phone(p).ok_or_else(|| format!("invalid phone '{p}'"))?),
        None => None,
    };
    if email.is_none() && phone.is_none() {
        return Err("missing email and phone".into());
    }

    let status = match cols.get(record, Field::Status) {
        Some(s) => s.parse::<LeadStatus>().map_err(|e| e.to_string())?,
        None => LeadStatus::New,
    };
    let source = match cols.get(record, Field::Source) {
        Some(s) => s.parse::<LeadSource>().map_err(|e| e.to_string())?,
        None => LeadSource::CsvImport,
    };
    let marketing_opt_in = match cols.get(record, Field::OptIn) {
        Some(v) => parse_flag(v).ok_or_else(|| format!("invalid opt-in value '{v}'"))?,
        None => false,
    };

    let text = |f: Field| cols.get(record, f).map(str::to_string);
    Ok(ImportedLead {
        name,
        email,
        phone,
        city: text(Field::City),
        state: text(Field::State),
        country: text(Field::Country),
        status,
        source,
        marketing_opt_in,
        notes: text(Field::Notes),
    })
}

pub fn parse_leads_csv(data: &[u8]) -> Result<ParsedImport, ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let headers = reader.headers()?.clone();
    if headers.iter().all(|h| h.trim().is_empty()) {
        return Err(ImportError::MissingHeader);
    }

    let mut map = HashMap::new();
    for (i, h) in headers.iter().enumerate() {
        if let Some(field) = field_for_header(h) {
            // first matching column wins
            map.entry(field).or_insert(i);
        }
    }
    if !map.contains_key(&Field::Name)
        && !map.contains_key(&Field::FirstName)
        && !map.contains_key(&Field::LastName)
    {
        return Err(ImportError::NoNameColumn);
    }
    if !map.contains_key(&Field::Email) && !map.contains_key(&Field::Phone) {
        return Err(ImportError::NoContactColumn);
    }
    let cols = Columns(map);

    let mut parsed = ParsedImport::default();
    let mut seen_emails: HashMap<String, u64> = HashMap::new();

    for (idx, result) in reader.records().enumerate() {
        // header is line 1
        let fallback_line = idx as u64 + 2;
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                let line = e
                    .position()
                    .map(|p| p.line())
                    .unwrap_or(fallback_line);
                parsed.rejected.push(RejectedRow {
                    line,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);

        match lead_from_record(&cols, &record) {
            Ok(lead) => {
                if let Some(email) = &lead.email {
                    if let Some(first) = seen_emails.get(email) {
                        parsed.rejected.push(RejectedRow {
                            line,
                            reason: format!("duplicate email (first seen on line {first})"),
                        });
                        continue;
                    }
                    seen_emails.insert(email.clone(), line);
                }
                parsed.leads.push(lead);
            }
            Err(reason) => parsed.rejected.push(RejectedRow { line, reason }),
        }
    }

    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub clinic_id: Option<Uuid>,
    pub sequence_id: Option<Uuid>,
    pub enroll: bool,
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub rejected: Vec<RejectedRow>,
    pub lead_ids: Vec<Uuid>,
    pub dry_run: bool,
}

async fn ensure_exists(db: &PgPool, sql: &str, id: Uuid, what: &str) -> Result<(), ApiError> {
    let found: Option<Uuid> = sqlx::query_scalar(sql)
        .bind(id)
        .fetch_optional(db)
        .await
        .map_err(db_error)?;
    found.map(|_| ()).ok_or_else(|| ApiError::not_found(what))
}

/// Parses `data` and inserts the accepted rows. Enrolled leads only enter
/// automation when their status accepts it.
pub async fn import_leads(
    db: &PgPool,
    data: &[u8],
    opts: &ImportOptions,
    now: DateTime<Utc>,
) -> Result<ImportReport, ApiError> {
    if let Some(id) = opts.clinic_id {
        ensure_exists(db, "SELECT clinic_id FROM clinic WHERE clinic_id = $1", id, "clinic").await?;
    }
    match opts.sequence_id {
        Some(id) if opts.enroll => ensure_sequence_open(db, id).await?,
        Some(id) => {
            ensure_exists(db, "SELECT sequence_id FROM sequence WHERE sequence_id = $1", id, "sequence")
                .await?
        }
        None => {}
    }

    let parsed = parse_leads_csv(data)?;

    let first_due = if opts.enroll {
        Some(plan::enrollment_due(db, opts.sequence_id, now).await?)
    } else {
        None
    };

    if opts.dry_run {
        return Ok(ImportReport {
            imported: parsed.leads.len(),
            rejected: parsed.rejected,
            lead_ids: Vec::new(),
            dry_run: true,
        });
    }

    let mut tx = db.begin().await.map_err(db_error)?;
    let mut lead_ids = Vec::with_capacity(parsed.leads.len());

    for lead in &parsed.leads {
        let next_due_at = first_due.filter(|_| lead.status.accepts_automation());
        let sequence_id = if opts.enroll { opts.sequence_id } else { None };

        let lead_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO lead (
              name, email, phone, status, source, city, state, country,
              clinic_id, sequence_id, marketing_opt_in, notes, next_due_at, enrolled_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14)
            RETURNING lead_id
            "#,
        )
        .bind(&lead.name)
        .bind(&lead.email)
        .bind(&lead.phone)
        .bind(lead.status)
        .bind(lead.source)
        .bind(&lead.city)
        .bind(&lead.state)
        .bind(&lead.country)
        .bind(opts.clinic_id)
        .bind(sequence_id)
        .bind(lead.marketing_opt_in)
        .bind(&lead.notes)
        .bind(next_due_at)
        .bind(opts.enroll.then_some(now))
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;

        lead_ids.push(lead_id);
    }

    tx.commit().await.map_err(db_error)?;

    tracing::info!(
        imported = lead_ids.len(),
        rejected = parsed.rejected.len(),
        enroll = opts.enroll,
        "csv lead import finished"
    );

    Ok(ImportReport {
        imported: lead_ids.len(),
        rejected: parsed.rejected,
        lead_ids,
        dry_run: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed_rows_are_all_imported() {
        let csv = "Name,Email,Phone,City\n\
                   Ana Lopez,ana@example.com,,Austin\n\
                   Ben Ng,,+1 555 123 4567,Dallas\n\
                   Cara Diaz,CARA@Example.com,555-987-6543,\n";
        let parsed = parse_leads_csv(csv.as_bytes()).unwrap();
        assert!(parsed.rejected.is_empty());
        assert_eq!(parsed.leads.len(), 3);
        assert!(parsed.leads.iter().all(|l| l.source == LeadSource::CsvImport));
        assert!(parsed.leads.iter().all(|l| l.status == LeadStatus::New));
        assert_eq!(parsed.leads[1].phone.as_deref(), Some("+15551234567"));
        assert_eq!(parsed.leads[2].email.as_deref(), Some("cara@example.com"));
        assert_eq!(parsed.leads[2].city, None);
    }

    #[test]
    fn test_malformed_rows_are_reported_and_others_kept() {
        let csv = "full_name,e-mail,mobile,status\n\
                   Ana,ana@example.com,,warm\n\
                   ,nobody@example.com,,\n\
                   Ben,,,\n\
                   Cara,not-an-email,,\n\
                   Dan,dan@example.com,,mystery\n\
                   Eve,eve@example.com,,Booked\n";
        let parsed = parse_leads_csv(csv.as_bytes()).unwrap();
        let names: Vec<&str> = parsed.leads.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["Ana", "Eve"]);
        assert_eq!(parsed.leads[0].status, LeadStatus::Warm);
        assert_eq!(parsed.leads[1].status, LeadStatus::DemoBooked);

        let lines: Vec<u64> = parsed.rejected.iter().map(|r| r.line).collect();
        assert_eq!(lines, vec![3, 4, 5, 6]);
        assert_eq!(parsed.rejected[0].reason, "missing name");
        assert_eq!(parsed.rejected[1].reason, "missing email and phone");
    }

    #[test]
    fn test_duplicate_email_rejected_after_first() {
        let csv = "name,email\nAna,ana@example.com\nAna Again,ANA@example.com\n";
        let parsed = parse_leads_csv(csv.as_bytes()).unwrap();
        assert_eq!(parsed.leads.len(), 1);
        assert_eq!(parsed.rejected.len(), 1);
        assert!(parsed.rejected[0].reason.contains("line 2"));
    }

    #[test]
    fn test_first_and_last_name_columns_are_joined() {
        let csv = "First Name,Last Name,Phone,Consent,Source\nAna,Lopez,5551234567,yes,manual\n";
        let parsed = parse_leads_csv(csv.as_bytes()).unwrap();
        let lead = &parsed.leads[0];
        assert_eq!(lead.name, "Ana Lopez");
        assert!(lead.marketing_opt_in);
        assert_eq!(lead.source, LeadSource::Manual);
    }

    #[test]
    fn test_file_without_required_columns_is_rejected() {
        assert!(matches!(
            parse_leads_csv(b"email,phone\na@b.co,\n"),
            Err(ImportError::NoNameColumn)
        ));
        assert!(matches!(
            parse_leads_csv(b"name,city\nAna,Austin\n"),
            Err(ImportError::NoContactColumn)
        ));
    }

    #[test]
    fn test_blank_lines_and_short_rows() {
        let csv = "name,email,city\n\nAna,ana@example.com\n";
        let parsed = parse_leads_csv(csv.as_bytes()).unwrap();
        assert_eq!(parsed.leads.len(), 1);
        assert_eq!(parsed.leads[0].city, None);
    }
}
