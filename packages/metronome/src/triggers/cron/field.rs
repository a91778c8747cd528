//! Cron field expressions: parsing and matching.

use serde::{Deserialize, Serialize};

use crate::errors::TriggerError;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const WEEKDAY_NAMES: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

/// Which component of the timestamp an expression constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Year,
    Month,
    /// Day of month.
    Day,
    /// ISO week number.
    Week,
    /// 0–6 = Monday–Sunday.
    DayOfWeek,
    Hour,
    Minute,
    Second,
}

impl FieldKind {
    pub(crate) fn bounds(self) -> (i32, i32) {
        match self {
            FieldKind::Year => (1970, 9999),
            FieldKind::Month => (1, 12),
            FieldKind::Day => (1, 31),
            FieldKind::Week => (1, 53),
            FieldKind::DayOfWeek => (0, 6),
            FieldKind::Hour => (0, 23),
            FieldKind::Minute => (0, 59),
            FieldKind::Second => (0, 59),
        }
    }

    fn alias(self, name: &str) -> Option<i32> {
        let names: &[&str] = match self {
            FieldKind::Month => &MONTH_NAMES,
            FieldKind::DayOfWeek => &WEEKDAY_NAMES,
            _ => return None,
        };
        let position = names.iter().position(|n| *n == name)? as i32;
        Some(if self == FieldKind::Month {
            position + 1
        } else {
            position
        })
    }
}

/// One comma-separated alternative within a field expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldExpr {
    /// `*` or `*/step`, anchored at the field minimum.
    All { step: u32 },
    /// `a`, `a-b`, or `a-b/step`.
    Range { first: i32, last: i32, step: u32 },
    /// `last` (or `L`) — the last day of the month. Day field only.
    LastDay,
}

/// A parsed field expression; the parsed form is what gets serialized, so a
/// restored trigger never re-parses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronField {
    kind: FieldKind,
    exprs: Vec<FieldExpr>,
}

impl CronField {
    /// Parse an expression such as `*/5`, `mon-fri`, `1,15,last`.
    pub(crate) fn parse(kind: FieldKind, expr: &str) -> Result<Self, TriggerError> {
        let text = expr.trim().to_ascii_lowercase();
        if text.is_empty() {
            return Err(TriggerError::invalid(format!(
                "empty expression for {kind:?} field"
            )));
        }
        let exprs = text
            .split(',')
            .map(|part| parse_part(kind, part.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { kind, exprs })
    }

    /// `*`: matches every value in the field's range.
    pub(crate) fn wildcard(kind: FieldKind) -> Self {
        Self {
            kind,
            exprs: vec![FieldExpr::All { step: 1 }],
        }
    }

    /// Matches only the field's minimum value.
    pub(crate) fn minimum(kind: FieldKind) -> Self {
        let (min, _) = kind.bounds();
        Self {
            kind,
            exprs: vec![FieldExpr::Range {
                first: min,
                last: min,
                step: 1,
            }],
        }
    }

    /// Whether `value` satisfies this expression. `last_of_month` gives the
    /// number of days in the month under consideration (day field only).
    pub(crate) fn matches(&self, value: i32, last_of_month: i32) -> bool {
        let (min, _) = self.kind.bounds();
        self.exprs.iter().any(|expr| match *expr {
            FieldExpr::All { step } => (value - min) % step as i32 == 0,
            FieldExpr::Range { first, last, step } => {
                value >= first && value <= last && (value - first) % step as i32 == 0
            }
            FieldExpr::LastDay => value == last_of_month,
        })
    }
}

fn parse_part(kind: FieldKind, part: &str) -> Result<FieldExpr, TriggerError> {
    if part == "*" {
        return Ok(FieldExpr::All { step: 1 });
    }
    if let Some(step) = part.strip_prefix("*/") {
        return Ok(FieldExpr::All {
            step: parse_step(kind, step)?,
        });
    }
    if part == "last" || part == "l" {
        if kind == FieldKind::Day {
            return Ok(FieldExpr::LastDay);
        }
        return Err(TriggerError::invalid(format!(
            "{part:?} is only valid in the day field"
        )));
    }

    let (body, step) = match part.split_once('/') {
        Some((body, step)) => (body, parse_step(kind, step)?),
        None => (part, 1),
    };
    let (first, last) = match body.split_once('-') {
        Some((first, last)) => (parse_value(kind, first)?, parse_value(kind, last)?),
        None => {
            let value = parse_value(kind, body)?;
            (value, value)
        }
    };
    if first > last {
        return Err(TriggerError::invalid(format!(
            "range {body:?} in {kind:?} field runs backwards"
        )));
    }
    Ok(FieldExpr::Range { first, last, step })
}

fn parse_value(kind: FieldKind, text: &str) -> Result<i32, TriggerError> {
    let value = match kind.alias(text) {
        Some(value) => value,
        None => text.parse::<i32>().map_err(|_| {
            TriggerError::invalid(format!("unparsable value {text:?} in {kind:?} field"))
        })?,
    };
    let (min, max) = kind.bounds();
    if value < min || value > max {
        return Err(TriggerError::invalid(format!(
            "value {value} out of range {min}..={max} for {kind:?} field"
        )));
    }
    Ok(value)
}

fn parse_step(kind: FieldKind, text: &str) -> Result<u32, TriggerError> {
    let step = text.parse::<u32>().map_err(|_| {
        TriggerError::invalid(format!("unparsable step {text:?} in {kind:?} field"))
    })?;
    if step == 0 {
        return Err(TriggerError::invalid(format!(
            "step must be positive in {kind:?} field"
        )));
    }
    Ok(step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_everything_in_range() {
        let field = CronField::wildcard(FieldKind::Hour);
        assert!(field.matches(0, 0));
        assert!(field.matches(23, 0));
    }

    #[test]
    fn stepped_wildcard_is_anchored_at_the_minimum() {
        let field = CronField::parse(FieldKind::Minute, "*/15").unwrap();
        assert!(field.matches(0, 0));
        assert!(field.matches(45, 0));
        assert!(!field.matches(20, 0));

        // Day minimum is 1, so */2 hits the odd days.
        let field = CronField::parse(FieldKind::Day, "*/2").unwrap();
        assert!(field.matches(1, 31));
        assert!(field.matches(3, 31));
        assert!(!field.matches(2, 31));
    }

    #[test]
    fn ranges_steps_and_lists_combine() {
        let field = CronField::parse(FieldKind::Hour, "0-6/2,12,18-20").unwrap();
        for hour in [0, 2, 4, 6, 12, 18, 19, 20] {
            assert!(field.matches(hour, 0), "hour {hour} should match");
        }
        for hour in [1, 7, 11, 17, 21] {
            assert!(!field.matches(hour, 0), "hour {hour} should not match");
        }
    }

    #[test]
    fn weekday_names_parse_as_ranges() {
        let field = CronField::parse(FieldKind::DayOfWeek, "mon-fri").unwrap();
        for dow in 0..5 {
            assert!(field.matches(dow, 0));
        }
        assert!(!field.matches(5, 0));
        assert!(!field.matches(6, 0));
    }

    #[test]
    fn month_names_parse_one_based() {
        let field = CronField::parse(FieldKind::Month, "jan,jun-aug").unwrap();
        assert!(field.matches(1, 0));
        assert!(field.matches(6, 0));
        assert!(field.matches(8, 0));
        assert!(!field.matches(5, 0));
    }

    #[test]
    fn last_day_tracks_the_month() {
        let field = CronField::parse(FieldKind::Day, "last").unwrap();
        assert!(field.matches(31, 31));
        assert!(field.matches(29, 29));
        assert!(!field.matches(28, 29));

        let field = CronField::parse(FieldKind::Day, "L").unwrap();
        assert!(field.matches(30, 30));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for (kind, expr) in [
            (FieldKind::Hour, ""),
            (FieldKind::Hour, "25"),
            (FieldKind::Hour, "6-2"),
            (FieldKind::Hour, "*/0"),
            (FieldKind::Hour, "frob"),
            (FieldKind::Minute, "last"),
            (FieldKind::DayOfWeek, "7"),
            (FieldKind::Month, "0"),
        ] {
            assert!(
                CronField::parse(kind, expr).is_err(),
                "{expr:?} in {kind:?} should fail"
            );
        }
    }

    #[test]
    fn parsed_fields_roundtrip_through_serde() {
        let field = CronField::parse(FieldKind::Day, "1-15/2,last").unwrap();
        let json = serde_json::to_string(&field).unwrap();
        let back: CronField = serde_json::from_str(&json).unwrap();
        assert_eq!(field, back);
    }
}
