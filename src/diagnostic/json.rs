use super::{Diagnostic, Severity};

/// One diagnostic as a single-line JSON object.
pub fn render(d: &Diagnostic) -> String {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };

    let labels: Vec<serde_json::Value> = d
        .labels
        .iter()
        .map(|l| {
            serde_json::json!({
                "start": l.span.start,
                "end": l.span.end,
                "message": l.message,
            })
        })
        .collect();

    let mut obj = serde_json::json!({
        "severity": severity,
        "code": d.code,
        "message": d.message,
        "labels": labels,
        "notes": d.notes,
    });

    if let Some(address) = d.address {
        obj["address"] = serde_json::Value::from(address);
    }
    if let Some(depth) = d.frame_depth {
        obj["frame_depth"] = serde_json::Value::from(depth);
    }

    serde_json::to_string(&obj).unwrap_or_else(|_| {
        r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let v = parse_json(&render(&Diagnostic::error("runtime", "division by zero")));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["code"], "runtime");
        assert_eq!(v["message"], "division by zero");
        assert!(v["labels"].as_array().unwrap().is_empty());
    }

    #[test]
    fn render_with_span() {
        let d = Diagnostic::error("runtime", "bad index")
            .with_span(Span { start: 2, end: 5 }, "here");
        let v = parse_json(&render(&d));
        let label = &v["labels"][0];
        assert_eq!(label["start"], 2);
        assert_eq!(label["end"], 5);
        assert_eq!(label["message"], "here");
    }

    #[test]
    fn render_location_only_when_present() {
        let v = parse_json(&render(&Diagnostic::error("compile", "x")));
        assert!(v.get("address").is_none());
        assert!(v.get("frame_depth").is_none());

        let v = parse_json(&render(&Diagnostic::error("runtime", "x").with_location(14, 2)));
        assert_eq!(v["address"], 14);
        assert_eq!(v["frame_depth"], 2);
    }

    #[test]
    fn render_with_notes() {
        let d = Diagnostic::error("internal", "bad")
            .with_note("in function 'f'")
            .with_note("called from 'g'");
        let v = parse_json(&render(&d));
        let notes = v["notes"].as_array().unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0], "in function 'f'");
    }

    #[test]
    fn render_warning_severity() {
        let v = parse_json(&render(&Diagnostic::warning("compile", "unused variable")));
        assert_eq!(v["severity"], "warning");
    }
}
