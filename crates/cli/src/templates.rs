//! Canned driver status requests.
//!
//! Drivers mostly send the same handful of hours-of-service notifications;
//! these templates keep them one command away. `reset` takes a duration.

pub struct Template {
    pub id: &'static str,
    pub text: &'static str,
    pub needs_time: bool,
    pub description: &'static str,
}

pub const TEMPLATES: &[Template] = &[
    Template {
        id: "pretrip",
        text: "15min Pre Trip Inspection",
        needs_time: false,
        description: "Required safety check before starting",
    },
    Template {
        id: "break",
        text: "30min Break Time",
        needs_time: false,
        description: "Rest period notification",
    },
    Template {
        id: "reset",
        text: "Hour Reset",
        needs_time: true,
        description: "Mandatory reset period",
    },
    Template {
        id: "violations",
        text: "Check Violations",
        needs_time: false,
        description: "Review compliance status",
    },
    Template {
        id: "inspection",
        text: "Getting DOT Inspection",
        needs_time: false,
        description: "Department of Transportation check",
    },
];

/// Durations suggested in the template listing.
pub const QUICK_TIME_OPTIONS: &[&str] = &["30min", "1h", "4h", "11h"];

pub fn find(id: &str) -> Option<&'static Template> {
    TEMPLATES.iter().find(|t| t.id.eq_ignore_ascii_case(id))
}

/// Valid duration arguments for templates that take one: 1h to 11h plus the
/// 34h restart.
pub fn time_options() -> Vec<String> {
    let mut out: Vec<String> = (1..=11).map(|h| format!("{}h", h)).collect();
    out.push("34h".to_string());
    out
}

/// Produce the outgoing request text, validating the duration when the
/// template requires one.
pub fn render(template: &Template, time: Option<&str>) -> Result<String, String> {
    if !template.needs_time {
        return Ok(template.text.to_string());
    }
    let time = time.ok_or_else(|| {
        format!(
            "template '{}' needs a duration (e.g. {})",
            template.id,
            QUICK_TIME_OPTIONS.join(", ")
        )
    })?;
    if !time_options().iter().any(|o| o == time) {
        return Err(format!(
            "unknown duration {:?}; use one of {}",
            time,
            time_options().join(", ")
        ));
    }
    Ok(format!("{} ({})", template.text, time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_is_case_insensitive() {
        assert_eq!(find("Break").map(|t| t.text), Some("30min Break Time"));
        assert!(find("siesta").is_none());
    }

    #[test]
    fn plain_template_renders_text() {
        let t = find("pretrip").unwrap();
        assert_eq!(render(t, None).unwrap(), "15min Pre Trip Inspection");
    }

    #[test]
    fn timed_template_requires_valid_duration() {
        let t = find("reset").unwrap();
        assert!(render(t, None).is_err());
        assert!(render(t, Some("90min")).is_err());
        assert_eq!(render(t, Some("8h")).unwrap(), "Hour Reset (8h)");
        assert_eq!(render(t, Some("34h")).unwrap(), "Hour Reset (34h)");
    }

    #[test]
    fn time_options_cover_one_to_eleven_and_restart() {
        let options = time_options();
        assert_eq!(options.first().map(String::as_str), Some("1h"));
        assert!(options.contains(&"11h".to_string()));
        assert_eq!(options.last().map(String::as_str), Some("34h"));
        assert_eq!(options.len(), 12);
    }
}
