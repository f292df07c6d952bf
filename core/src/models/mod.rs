//! Planning hierarchy records and their SQLite repositories.
//!
//! Project → Release → Epic → UserStory → UseCase / TestCase. Children are
//! removed by `ON DELETE CASCADE`, so the repositories only ever delete the
//! row they were asked about.

pub mod backlog;
pub mod projects;
pub mod releases;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::Row;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::errors::{PlanFlowError, PlanFlowResult};

/// Declares a status-like enum persisted and serialised by its display text.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident, default = $default:ident, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                Self::parse(raw).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} '{raw}'", stringify!($name)).into())
                })
            }
        }
    };
}

text_enum!(ProjectStatus, default = Draft, {
    Draft => "Draft",
    InPlanning => "In Planning",
    InDevelopment => "In Development",
    InReview => "In Review",
    Completed => "Completed",
    OnHold => "On Hold",
    Cancelled => "Cancelled",
});

text_enum!(ReleaseStatus, default = NotStarted, {
    NotStarted => "Not Started",
    Planning => "Planning",
    InProgress => "In Progress",
    Testing => "Testing",
    Completed => "Completed",
    OnHold => "On Hold",
});

text_enum!(EpicStatus, default = Draft, {
    Draft => "Draft",
    Ready => "Ready",
    InProgress => "In Progress",
    Completed => "Completed",
    OnHold => "On Hold",
});

text_enum!(StoryStatus, default = Draft, {
    Draft => "Draft",
    Ready => "Ready",
    InProgress => "In Progress",
    InReview => "In Review",
    Testing => "Testing",
    Completed => "Completed",
    Blocked => "Blocked",
});

text_enum!(
    /// Shared by user stories and test cases.
    Priority, default = Medium, {
    Low => "Low",
    Medium => "Medium",
    High => "High",
    Critical => "Critical",
});

text_enum!(Automation, default = No, {
    Yes => "Yes",
    No => "No",
    Partial => "Partial",
});

pub(crate) fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// `DD-Mon-YYYY`, the format list views display.
pub(crate) fn display_date(ts: i64) -> String {
    let fmt = format_description!("[day]-[month repr:short]-[year]");
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(fmt).ok())
        .unwrap_or_default()
}

/// Parses a `YYYY-MM-DD` calendar date.
pub fn parse_date(field: &str, raw: &str) -> PlanFlowResult<Date> {
    Date::parse(raw.trim(), format_description!("[year]-[month]-[day]")).map_err(|_| {
        PlanFlowError::Validation(format!("{field} must be a YYYY-MM-DD date, got '{raw}'"))
    })
}

pub(crate) fn check_name(field: &str, value: &str, max: usize) -> PlanFlowResult<()> {
    if value.trim().is_empty() {
        return Err(PlanFlowError::Validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > max {
        return Err(PlanFlowError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(())
}

pub(crate) fn check_progress(progress: f64) -> PlanFlowResult<()> {
    if !(0.0..=100.0).contains(&progress) {
        return Err(PlanFlowError::Validation(
            "progress must be between 0 and 100".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn list_to_sql(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn list_from_row(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(Vec::new()),
        Some(text) => serde_json::from_str(&text)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}
