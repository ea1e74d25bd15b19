// src/lifecycle.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where a lead sits in the sales/patient funnel.
///
/// Stored as snake_case text. Parsing from user input goes through
/// [`LeadStatus::from_str`], which is case-insensitive and understands the
/// legacy aliases `booked` and `opted_out`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum LeadStatus {
    New,
    Contacted,
    Warm,
    Cold,
    NoResponse,
    Replied,
    DemoBooked,
    Won,
    Lost,
    Unsubscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Unchanged,
    Forward,
    Lateral,
    Backward,
    Reopen,
}

impl Transition {
    /// Manual edits of this kind need an explicit `force`.
    pub fn needs_force(self) -> bool {
        matches!(self, Transition::Backward | Transition::Reopen)
    }
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 10] = [
        LeadStatus::New,
        LeadStatus::Contacted,
        LeadStatus::Warm,
        LeadStatus::Cold,
        LeadStatus::NoResponse,
        LeadStatus::Replied,
        LeadStatus::DemoBooked,
        LeadStatus::Won,
        LeadStatus::Lost,
        LeadStatus::Unsubscribed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LeadStatus::New => "new",
            LeadStatus::Contacted => "contacted",
            LeadStatus::Warm => "warm",
            LeadStatus::Cold => "cold",
            LeadStatus::NoResponse => "no_response",
            LeadStatus::Replied => "replied",
            LeadStatus::DemoBooked => "demo_booked",
            LeadStatus::Won => "won",
            LeadStatus::Lost => "lost",
            LeadStatus::Unsubscribed => "unsubscribed",
        }
    }

    fn rank(self) -> u8 {
        match self {
            LeadStatus::New => 0,
            LeadStatus::Contacted => 1,
            LeadStatus::Warm | LeadStatus::Cold | LeadStatus::NoResponse => 2,
            LeadStatus::Replied => 3,
            LeadStatus::DemoBooked => 4,
            LeadStatus::Won | LeadStatus::Lost | LeadStatus::Unsubscribed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LeadStatus::Won | LeadStatus::Lost | LeadStatus::Unsubscribed
        )
    }

    /// Statuses the sequence engine keeps messaging.
    pub fn accepts_automation(self) -> bool {
        matches!(
            self,
            LeadStatus::New
                | LeadStatus::Contacted
                | LeadStatus::Warm
                | LeadStatus::Cold
                | LeadStatus::NoResponse
        )
    }

    /// Labels of every status in `accepts_automation`, for SQL guards.
    pub fn automated_labels() -> Vec<&'static str> {
        LeadStatus::ALL
            .into_iter()
            .filter(|s| s.accepts_automation())
            .map(LeadStatus::as_str)
            .collect()
    }

    /// The only status change the engine is allowed to make: first send
    /// moves `new` to `contacted`. Everything else is left alone.
    pub fn after_automated_send(self) -> LeadStatus {
        match self {
            LeadStatus::New => LeadStatus::Contacted,
            other => other,
        }
    }

    pub fn classify(from: LeadStatus, to: LeadStatus) -> Transition {
        if from == to {
            return Transition::Unchanged;
        }
        if from.is_terminal() {
            return Transition::Reopen;
        }
        match to.rank().cmp(&from.rank()) {
            std::cmp::Ordering::Greater => Transition::Forward,
            std::cmp::Ordering::Equal => Transition::Lateral,
            std::cmp::Ordering::Less => Transition::Backward,
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

fn normalize(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_")
}

impl FromStr for LeadStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match normalize(s).as_str() {
            "new" => LeadStatus::New,
            "contacted" => LeadStatus::Contacted,
            "warm" => LeadStatus::Warm,
            "cold" => LeadStatus::Cold,
            "no_response" | "noresponse" => LeadStatus::NoResponse,
            "replied" => LeadStatus::Replied,
            "demo_booked" | "booked" => LeadStatus::DemoBooked,
            "won" => LeadStatus::Won,
            "lost" => LeadStatus::Lost,
            "unsubscribed" | "opted_out" | "optedout" => LeadStatus::Unsubscribed,
            _ => {
                return Err(ParseEnumError {
                    kind: "lead status",
                    value: s.to_string(),
                })
            }
        };
        Ok(status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Ready,
    Active,
    Paused,
    Completed,
    Archived,
}

impl CampaignStatus {
    pub fn can_transition_to(self, to: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, to),
            (Draft, Ready)
                | (Draft, Archived)
                | (Ready, Active)
                | (Ready, Draft)
                | (Ready, Archived)
                | (Active, Paused)
                | (Active, Completed)
                | (Paused, Active)
                | (Paused, Completed)
                | (Paused, Archived)
                | (Completed, Archived)
        )
    }

    pub fn is_deletable(self) -> bool {
        matches!(self, CampaignStatus::Draft | CampaignStatus::Archived)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    Missed,
}

impl BookingStatus {
    pub fn can_transition_to(self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Pending, Missed)
                | (Confirmed, Completed)
                | (Confirmed, Missed)
                | (Confirmed, Cancelled)
        )
    }
}

/// Plain snake_case parsing for the smaller lifecycle enums.
macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let wanted = s.trim().to_ascii_lowercase();
                $ty::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == wanted)
                    .ok_or_else(|| ParseEnumError {
                        kind: $kind,
                        value: s.to_string(),
                    })
            }
        }
    };
}

text_enum!(CampaignStatus, "campaign status", {
    Draft => "draft",
    Ready => "ready",
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Archived => "archived",
});

text_enum!(BookingStatus, "booking status", {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
    Completed => "completed",
    Missed => "missed",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive_and_accepts_aliases() {
        assert_eq!("NEW".parse::<LeadStatus>().unwrap(), LeadStatus::New);
        assert_eq!("No-Response".parse::<LeadStatus>().unwrap(), LeadStatus::NoResponse);
        assert_eq!("booked".parse::<LeadStatus>().unwrap(), LeadStatus::DemoBooked);
        assert_eq!("Opted_Out".parse::<LeadStatus>().unwrap(), LeadStatus::Unsubscribed);
        assert!("qualified".parse::<LeadStatus>().is_err());
        assert!("".parse::<LeadStatus>().is_err());
    }

    #[test]
    fn test_campaign_and_booking_status_parse() {
        assert_eq!("Active".parse::<CampaignStatus>().unwrap(), CampaignStatus::Active);
        assert!("running".parse::<CampaignStatus>().is_err());
        for s in BookingStatus::ALL {
            assert_eq!(s.to_string().parse::<BookingStatus>().unwrap(), *s);
        }
        assert!(!BookingStatus::Cancelled.can_transition_to(BookingStatus::Confirmed));
        assert!(CampaignStatus::Paused.can_transition_to(CampaignStatus::Active));
        assert!(!CampaignStatus::Active.is_deletable());
    }

    #[test]
    fn test_display_strings_parse_back() {
        for status in LeadStatus::ALL {
            assert_eq!(status.as_str().parse::<LeadStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_automated_send_only_moves_new_forward() {
        for status in LeadStatus::ALL {
            let next = status.after_automated_send();
            if status == LeadStatus::New {
                assert_eq!(next, LeadStatus::Contacted);
            } else {
                assert_eq!(next, status);
            }
            assert!(matches!(
                LeadStatus::classify(status, next),
                Transition::Unchanged | Transition::Forward
            ));
        }
    }

    #[test]
    fn test_classify() {
        use LeadStatus::*;
        assert_eq!(LeadStatus::classify(New, Replied), Transition::Forward);
        assert_eq!(LeadStatus::classify(Warm, Cold), Transition::Lateral);
        assert_eq!(LeadStatus::classify(Replied, Contacted), Transition::Backward);
        assert_eq!(LeadStatus::classify(Won, New), Transition::Reopen);
        assert_eq!(LeadStatus::classify(Won, Lost), Transition::Reopen);
        assert_eq!(LeadStatus::classify(Lost, Lost), Transition::Unchanged);
        assert_eq!(LeadStatus::classify(DemoBooked, Lost), Transition::Forward);
    }

    #[test]
    fn test_leaving_terminal_is_never_forward() {
        for from in LeadStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in LeadStatus::ALL {
                let t = LeadStatus::classify(from, to);
                assert!(t == Transition::Unchanged || t == Transition::Reopen);
            }
        }
    }

    #[test]
    fn test_automation_excludes_engaged_and_terminal() {
        assert!(LeadStatus::Cold.accepts_automation());
        assert!(!LeadStatus::Replied.accepts_automation());
        assert!(!LeadStatus::DemoBooked.accepts_automation());
        assert!(!LeadStatus::Unsubscribed.accepts_automation());
    }

    #[test]
    fn test_campaign_lattice() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Ready));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(!Draft.can_transition_to(Active));
        assert!(!Archived.can_transition_to(Draft));
        assert!(!Completed.can_transition_to(Active));
        assert!(Archived.is_deletable());
        assert!(!Active.is_deletable());
    }

    #[test]
    fn test_booking_lattice() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Pending.can_transition_to(Completed));
    }
}
