// src/routes/template_routes.rs

use axum::{extract::State, routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{db_error, ApiError},
    lifecycle::LeadStatus,
    middleware::auth_context::OperatorContext,
    models::{clean_opt, ApiOk, AppState, Channel},
    templates::{
        self, is_eligible, should_send_sms, RenderedMessage, TemplateData, TemplateId, TemplateKey,
    },
};

use super::lead_routes::fetch_lead;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/templates", get(list_templates))
        .route("/templates/render", post(render_template))
}

#[derive(Debug, Serialize)]
pub struct TemplateInfo {
    pub template_id: TemplateId,
    pub channels: &'static [Channel],
    pub reactivation: bool,
    /// Statuses the template may be sent to.
    pub eligible_statuses: Vec<LeadStatus>,
}

fn template_info(id: TemplateId) -> TemplateInfo {
    const EMAIL: &[Channel] = &[Channel::Email];
    const SHORT: &[Channel] = &[Channel::Sms, Channel::Whatsapp];
    TemplateInfo {
        template_id: id,
        channels: if id.is_email() { EMAIL } else { SHORT },
        reactivation: id.is_reactivation(),
        eligible_statuses: LeadStatus::ALL
            .into_iter()
            .filter(|s| is_eligible(*s, TemplateKey::Catalog(id)))
            .collect(),
    }
}

pub async fn list_templates(_op: OperatorContext) -> Json<ApiOk<Vec<TemplateInfo>>> {
    Json(ApiOk {
        data: TemplateId::ALL.into_iter().map(template_info).collect(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    pub template_id: Option<String>,
    /// Custom copy with `{first_name}`-style placeholders instead of a
    /// catalog template.
    pub body: Option<String>,
    pub subject: Option<String>,
    pub channel: Option<Channel>,
    pub lead_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct RenderPreview {
    pub channel: Channel,
    pub template_key: &'static str,
    pub message: RenderedMessage,
    /// Present when rendered for a lead: whether the engine would send it.
    pub eligible: Option<bool>,
    pub ineligible_reason: Option<&'static str>,
}

fn sample_data(state: &AppState) -> TemplateData {
    let settings = state.engine.settings();
    TemplateData {
        first_name: "Alex".into(),
        full_name: "Alex Example".into(),
        city: Some("Springfield".into()),
        clinic_name: Some("Example Dental".into()),
        booking_url: settings.booking_url.clone(),
        sender_name: settings.sender_name.clone(),
        unsubscribe_url: format!("{}/api/v1/public/unsubscribe/preview", settings.public_base_url),
    }
}

fn ineligibility(
    status: LeadStatus,
    opt_in: bool,
    key: TemplateKey,
    channel: Channel,
) -> Option<&'static str> {
    let allowed = if channel.is_short_message() {
        should_send_sms(status.as_str(), key.label())
    } else {
        is_eligible(status, key)
    };
    if !allowed {
        return Some("template not eligible for lead status");
    }
    if channel.is_short_message() && !opt_in {
        return Some("no marketing consent for sms/whatsapp");
    }
    None
}

pub async fn render_template(
    State(state): State<AppState>,
    _op: OperatorContext,
    Json(req): Json<RenderRequest>,
) -> Result<Json<ApiOk<RenderPreview>>, ApiError> {
    let body = clean_opt(req.body);
    let key = match (clean_opt(req.template_id), &body) {
        (Some(_), Some(_)) => {
            return Err(ApiError::validation("set either template_id or body, not both"))
        }
        (None, None) => return Err(ApiError::validation("template_id or body is required")),
        (Some(raw), None) => TemplateKey::Catalog(
            raw.parse::<TemplateId>()
                .map_err(|e| ApiError::validation(e.to_string()))?,
        ),
        (None, Some(_)) => TemplateKey::Custom,
    };

    let channel = match (req.channel, key) {
        (Some(c), TemplateKey::Catalog(id)) if !id.fits_channel(c) => {
            return Err(ApiError::validation(format!(
                "template {id} cannot be sent over {c}"
            )))
        }
        (Some(c), _) => c,
        (None, TemplateKey::Catalog(id)) if !id.is_email() => Channel::Sms,
        (None, _) => Channel::Email,
    };

    let (data, lead) = match req.lead_id {
        Some(lead_id) => {
            let lead = fetch_lead(&state.db, lead_id).await?;
            let clinic_name: Option<String> = match lead.clinic_id {
                Some(cid) => sqlx::query_scalar("SELECT name FROM clinic WHERE clinic_id = $1")
                    .bind(cid)
                    .fetch_optional(&state.db)
                    .await
                    .map_err(db_error)?,
                None => None,
            };
            (state.engine.template_data(&lead, clinic_name), Some(lead))
        }
        None => (sample_data(&state), None),
    };

    let message = match (key, body) {
        (TemplateKey::Catalog(id), _) => templates::render(id, &data),
        (TemplateKey::Custom, Some(body)) => {
            templates::render_custom(channel, req.subject.as_deref(), &body, &data)
        }
        (TemplateKey::Custom, None) => {
            return Err(ApiError::validation("template_id or body is required"))
        }
    };

    let reason = lead
        .as_ref()
        .and_then(|l| ineligibility(l.status, l.marketing_opt_in, key, channel));

    Ok(Json(ApiOk {
        data: RenderPreview {
            channel,
            template_key: key.label(),
            message,
            eligible: lead.as_ref().map(|_| reason.is_none()),
            ineligible_reason: reason,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_listing_reflects_eligibility() {
        let info = template_info(TemplateId::ReactivationOffer);
        assert!(info.reactivation);
        assert_eq!(info.channels, &[Channel::Email]);
        assert!(info.eligible_statuses.contains(&LeadStatus::Cold));
        assert!(!info.eligible_statuses.contains(&LeadStatus::Warm));

        let info = template_info(TemplateId::QuickCheckIn);
        assert!(info.channels.contains(&Channel::Whatsapp));
        assert!(!info.eligible_statuses.contains(&LeadStatus::Unsubscribed));
    }

    #[test]
    fn test_ineligibility_reasons() {
        let key = TemplateKey::Catalog(TemplateId::QuickCheckIn);
        assert_eq!(ineligibility(LeadStatus::Warm, true, key, Channel::Sms), None);
        assert!(ineligibility(LeadStatus::Warm, false, key, Channel::Sms).is_some());
        assert!(ineligibility(LeadStatus::Won, true, key, Channel::Sms).is_some());
        assert_eq!(
            ineligibility(LeadStatus::New, false, TemplateKey::Custom, Channel::Email),
            None
        );
    }
}
