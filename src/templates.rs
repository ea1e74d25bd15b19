// src/templates.rs
//
// Built-in outreach copy. Every template is a plain function of
// `TemplateData`; there is no template engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::lifecycle::{LeadStatus, ParseEnumError};
use crate::models::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateId {
    PainAwareness,
    RoiStory,
    QuickCheckIn,
    CaseStudy,
    DemoInvite,
    ObjectionHandling,
    Breakup,
    ReactivationCheckIn,
    ReactivationOffer,
}

impl TemplateId {
    pub const ALL: [TemplateId; 9] = [
        TemplateId::PainAwareness,
        TemplateId::RoiStory,
        TemplateId::QuickCheckIn,
        TemplateId::CaseStudy,
        TemplateId::DemoInvite,
        TemplateId::ObjectionHandling,
        TemplateId::Breakup,
        TemplateId::ReactivationCheckIn,
        TemplateId::ReactivationOffer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateId::PainAwareness => "pain_awareness",
            TemplateId::RoiStory => "roi_story",
            TemplateId::QuickCheckIn => "quick_check_in",
            TemplateId::CaseStudy => "case_study",
            TemplateId::DemoInvite => "demo_invite",
            TemplateId::ObjectionHandling => "objection_handling",
            TemplateId::Breakup => "breakup",
            TemplateId::ReactivationCheckIn => "reactivation_check_in",
            TemplateId::ReactivationOffer => "reactivation_offer",
        }
    }

    pub fn is_reactivation(self) -> bool {
        self.as_str().starts_with("reactivation")
    }

    /// Email templates carry a subject and HTML; the rest are short text.
    pub fn is_email(self) -> bool {
        !matches!(
            self,
            TemplateId::QuickCheckIn | TemplateId::DemoInvite | TemplateId::ReactivationCheckIn
        )
    }

    pub fn fits_channel(self, channel: Channel) -> bool {
        self.is_email() == (channel == Channel::Email)
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateId {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        TemplateId::ALL
            .into_iter()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| ParseEnumError {
                kind: "template id",
                value: s.to_string(),
            })
    }
}

/// What a sequence step sends: a catalog template or a custom body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKey {
    Catalog(TemplateId),
    Custom,
}

impl TemplateKey {
    pub fn label(self) -> &'static str {
        match self {
            TemplateKey::Catalog(id) => id.as_str(),
            TemplateKey::Custom => "custom",
        }
    }
}

fn excluded_from_outreach(status: LeadStatus) -> bool {
    matches!(
        status,
        LeadStatus::DemoBooked | LeadStatus::Won | LeadStatus::Lost | LeadStatus::Unsubscribed
    )
}

fn reactivation_eligible(status: LeadStatus) -> bool {
    matches!(
        status,
        LeadStatus::New | LeadStatus::Contacted | LeadStatus::Cold | LeadStatus::NoResponse
    )
}

pub fn is_eligible(status: LeadStatus, key: TemplateKey) -> bool {
    if excluded_from_outreach(status) {
        return false;
    }
    match key {
        TemplateKey::Catalog(id) if id.is_reactivation() => reactivation_eligible(status),
        _ => true,
    }
}

/// String-level eligibility check for short messages. Unknown statuses are
/// never eligible; unknown template ids are treated as custom copy.
pub fn should_send_sms(status: &str, template_id: &str) -> bool {
    let Ok(status) = status.parse::<LeadStatus>() else {
        return false;
    };
    let key = template_id
        .parse::<TemplateId>()
        .map(TemplateKey::Catalog)
        .unwrap_or(TemplateKey::Custom);
    is_eligible(status, key)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TemplateData {
    pub first_name: String,
    pub full_name: String,
    pub city: Option<String>,
    pub clinic_name: Option<String>,
    pub booking_url: String,
    pub sender_name: String,
    pub unsubscribe_url: String,
}

impl TemplateData {
    fn practice(&self) -> &str {
        self.clinic_name.as_deref().unwrap_or("your practice")
    }

    fn city_phrase(&self) -> String {
        match self.city.as_deref() {
            Some(city) => format!("in {city}"),
            None => "near you".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub subject: Option<String>,
    pub text: String,
    pub html: Option<String>,
}

pub fn html_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wraps plain paragraphs (blank-line separated) into a minimal HTML body.
fn paragraphs_to_html(text: &str, data: &TemplateData) -> String {
    let mut html = String::from("<!doctype html><html><body style=\"font-family:sans-serif\">");
    for para in text.split("\n\n").filter(|p| !p.trim().is_empty()) {
        html.push_str("<p>");
        html.push_str(&html_escape(para.trim()).replace('\n', "<br>"));
        html.push_str("</p>");
    }
    html.push_str(&format!(
        "<p style=\"font-size:12px;color:#888\"><a href=\"{}\">Unsubscribe</a></p></body></html>",
        html_escape(&data.unsubscribe_url)
    ));
    html
}

fn email(subject: String, body: String, data: &TemplateData) -> RenderedMessage {
    let text = format!(
        "{body}\n\n{}\n\nUnsubscribe: {}",
        data.sender_name, data.unsubscribe_url
    );
    let html = paragraphs_to_html(&format!("{body}\n\n{}", data.sender_name), data);
    RenderedMessage {
        subject: Some(subject),
        text,
        html: Some(html),
    }
}

fn short(text: String) -> RenderedMessage {
    RenderedMessage {
        subject: None,
        text: format!("{text} Reply STOP to opt out."),
        html: None,
    }
}

pub fn render(id: TemplateId, data: &TemplateData) -> RenderedMessage {
    let first = &data.first_name;
    match id {
        TemplateId::PainAwareness => email(
            format!("{first}, how many new patients did {} miss last month?", data.practice()),
            format!(
                "Hi {first},\n\nMost dental practices {} lose one in three new-patient enquiries \
                 because nobody answers after hours or follows up within a day.\n\n\
                 We help clinics capture those enquiries automatically and book them straight \
                 into the calendar. Would a 15 minute walkthrough be useful?\n\n{}",
                data.city_phrase(),
                data.booking_url
            ),
            data,
        ),
        TemplateId::RoiStory => email(
            "What 12 extra patients a month looks like".to_string(),
            format!(
                "Hi {first},\n\nOne of our clinics added 12 new patients in their first month \
                 just by answering website enquiries instantly and following up by text.\n\n\
                 At an average first-visit value that paid for the year in a week. Happy to run \
                 the numbers for {}: {}",
                data.practice(),
                data.booking_url
            ),
            data,
        ),
        TemplateId::QuickCheckIn => short(format!(
            "Hi {first}, {} here. Did my note about missed patient enquiries reach you? \
             Book a quick call: {}",
            data.sender_name, data.booking_url
        )),
        TemplateId::CaseStudy => email(
            format!("How a practice {} filled its hygiene book", data.city_phrase()),
            format!(
                "Hi {first},\n\nA two-chair practice {} had gaps in the hygiene schedule every \
                 week. With automated reminders and a booking page of their own, the gaps were \
                 gone within six weeks.\n\nI can show you the exact setup: {}",
                data.city_phrase(),
                data.booking_url
            ),
            data,
        ),
        TemplateId::DemoInvite => short(format!(
            "Hi {first}, want to see how clinics {} book more patients without extra staff? \
             Pick a time: {}",
            data.city_phrase(),
            data.booking_url
        )),
        TemplateId::ObjectionHandling => email(
            "\"We already have a front desk\"".to_string(),
            format!(
                "Hi {first},\n\nThat is the most common reply we get, and it is a good one. \
                 We do not replace the front desk; we catch the enquiries that arrive when they \
                 are busy or the office is closed, then hand them over ready to book.\n\n\
                 Worth 15 minutes? {}",
                data.booking_url
            ),
            data,
        ),
        TemplateId::Breakup => email(
            format!("Should I close your file, {first}?"),
            format!(
                "Hi {first},\n\nI have not heard back, so I will assume the timing is not \
                 right and stop writing. If that changes, you can always grab a slot here: {}",
                data.booking_url
            ),
            data,
        ),
        TemplateId::ReactivationCheckIn => short(format!(
            "Hi {first}, it has been a while! {} has new openings this month. \
             Book here: {}",
            data.practice(),
            data.booking_url
        )),
        TemplateId::ReactivationOffer => email(
            format!("{first}, a fresh start for {}", data.practice()),
            format!(
                "Hi {first},\n\nWe spoke a while ago about patient growth for {}. \
                 We have since launched booking pages and an after-hours assistant, and the \
                 first month is on us for returning contacts.\n\nInterested? {}",
                data.practice(),
                data.booking_url
            ),
            data,
        ),
    }
}

/// Placeholder substitution for custom step copy.
pub fn render_placeholders(template: &str, data: &TemplateData) -> String {
    template
        .replace("{first_name}", &data.first_name)
        .replace("{name}", &data.full_name)
        .replace("{city}", data.city.as_deref().unwrap_or(""))
        .replace("{clinic_name}", data.clinic_name.as_deref().unwrap_or(""))
        .replace("{booking_url}", &data.booking_url)
        .replace("{sender_name}", &data.sender_name)
        .replace("{unsubscribe_url}", &data.unsubscribe_url)
}

pub fn render_custom(
    channel: Channel,
    subject: Option<&str>,
    body: &str,
    data: &TemplateData,
) -> RenderedMessage {
    let text = render_placeholders(body, data);
    match channel {
        Channel::Email => {
            let subject = subject
                .map(|s| render_placeholders(s, data))
                .unwrap_or_else(|| format!("A note for {}", data.first_name));
            RenderedMessage {
                subject: Some(subject),
                html: Some(paragraphs_to_html(&text, data)),
                text: format!("{text}\n\nUnsubscribe: {}", data.unsubscribe_url),
            }
        }
        Channel::Sms | Channel::Whatsapp => RenderedMessage {
            subject: None,
            text,
            html: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> TemplateData {
        TemplateData {
            first_name: "Ana".into(),
            full_name: "Ana Lopez".into(),
            city: Some("Austin".into()),
            clinic_name: Some("Bright <Smiles>".into()),
            booking_url: "https://example.com/book".into(),
            sender_name: "Sam".into(),
            unsubscribe_url: "https://example.com/u/1".into(),
        }
    }

    #[test]
    fn test_excluded_statuses_never_get_sms() {
        for status in ["booked", "demo_booked", "won", "lost", "unsubscribed", "opted_out"] {
            for id in TemplateId::ALL {
                assert!(!should_send_sms(status, id.as_str()), "{status} / {id}");
            }
            assert!(!should_send_sms(status, "custom"));
            assert!(!should_send_sms(&status.to_uppercase(), "quick_check_in"));
        }
    }

    #[test]
    fn test_reactivation_only_for_dormant_statuses() {
        for status in ["new", "Contacted", "COLD", "no_response"] {
            assert!(should_send_sms(status, "reactivation_check_in"), "{status}");
            assert!(should_send_sms(status, "reactivation_offer"), "{status}");
        }
        for status in ["warm", "replied"] {
            assert!(!should_send_sms(status, "reactivation_check_in"), "{status}");
            assert!(should_send_sms(status, "quick_check_in"), "{status}");
        }
    }

    #[test]
    fn test_unknown_status_is_not_eligible() {
        assert!(!should_send_sms("mystery", "quick_check_in"));
    }

    #[test]
    fn test_template_channels() {
        assert!(TemplateId::PainAwareness.fits_channel(Channel::Email));
        assert!(!TemplateId::PainAwareness.fits_channel(Channel::Sms));
        assert!(TemplateId::DemoInvite.fits_channel(Channel::Whatsapp));
        assert_eq!("Reactivation-Offer".parse::<TemplateId>().unwrap(), TemplateId::ReactivationOffer);
    }

    #[test]
    fn test_every_template_renders_with_its_shape() {
        let d = data();
        for id in TemplateId::ALL {
            let msg = render(id, &d);
            assert!(msg.text.contains("Ana"), "{id}");
            if id.is_email() {
                assert!(msg.subject.is_some());
                let html = msg.html.unwrap();
                assert!(html.contains("Unsubscribe"));
                assert!(!html.contains("<Smiles>"));
            } else {
                assert!(msg.subject.is_none());
                assert!(msg.html.is_none());
                assert!(msg.text.contains("STOP"));
            }
        }
    }

    #[test]
    fn test_custom_placeholders() {
        let d = data();
        let out = render_placeholders("Hi {first_name} from {city}, see {booking_url}", &d);
        assert_eq!(out, "Hi Ana from Austin, see https://example.com/book");

        let msg = render_custom(Channel::Email, None, "Hello {name}", &d);
        assert_eq!(msg.subject.as_deref(), Some("A note for Ana"));
        assert!(msg.text.starts_with("Hello Ana Lopez"));
    }
}
