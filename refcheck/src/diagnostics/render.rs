//! Report renderers

use std::fmt::Write;

use ariadne::{Color, Config, Label, ReportKind, Source};

use super::{Diagnostic, Report, Severity};

fn plural(n: usize, word: &str) -> String {
    if n == 1 { format!("{n} {word}") } else { format!("{n} {word}s") }
}

fn summary(report: &Report) -> String {
    let s = &report.stats;
    let mut line = format!(
        "{}, {}, {}; {}/{} obligations proved in {}",
        plural(s.errors, "error"),
        plural(s.warnings, "warning"),
        plural(s.notes, "note"),
        s.proved,
        s.obligations,
        plural(s.methods, "method"),
    );
    if s.skipped_methods > 0 {
        let _ = write!(line, " ({} skipped)", s.skipped_methods);
    }
    if report.cancelled {
        line.push_str(" (cancelled)");
    }
    line
}

/// Detail lines shared by the text and pretty renderers
fn write_details(out: &mut String, diag: &Diagnostic) {
    if let Some(method) = &diag.method {
        let _ = writeln!(out, "  in {method}");
    }
    if let Some(pred) = &diag.predicate {
        let _ = writeln!(out, "  declared:     {}", pred.declared);
        let _ = writeln!(out, "  instantiated: {}", pred.instantiated);
    }
    if let Some(witness) = &diag.witness {
        let pairs: Vec<String> = witness.iter().map(|(k, v)| format!("{k} = {v}")).collect();
        let _ = writeln!(out, "  witness:      {}", pairs.join(", "));
    }
    if let Some(snippet) = &diag.snippet {
        for line in snippet.lines() {
            let _ = writeln!(out, "  | {}", line.trim_end());
        }
    }
    if let Some(smt) = &diag.smt {
        let _ = writeln!(out, "  smt:");
        for line in smt.lines() {
            let _ = writeln!(out, "    {line}");
        }
    }
}

fn header(diag: &Diagnostic) -> String {
    format!(
        "{}:{}: {}[{}]: {}",
        diag.file, diag.location, diag.severity, diag.kind, diag.message
    )
}

/// Plain text; identical input yields identical output
pub fn render_text(report: &Report) -> String {
    let mut out = String::new();
    for diag in &report.diagnostics {
        let _ = writeln!(out, "{}", header(diag));
        write_details(&mut out, diag);
    }
    let _ = writeln!(out, "{}", summary(report));
    out
}

pub fn render_json(report: &Report) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}

/// Source snippets where `source` can supply the file, plain text otherwise
pub fn render_pretty(report: &Report, source: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::new();
    for diag in &report.diagnostics {
        let snippet = diag
            .location
            .is_known()
            .then(|| source(&diag.file))
            .flatten()
            .and_then(|text| snippet(diag, &text));
        match snippet {
            Some(rendered) => {
                out.push_str(&rendered);
                let mut details = String::new();
                write_details(&mut details, diag);
                out.push_str(&details);
            }
            None => {
                let _ = writeln!(out, "{}", header(diag));
                write_details(&mut out, diag);
            }
        }
    }
    let _ = writeln!(out, "{}", summary(report));
    out
}

/// Character range of the token at a 1-based line/column
fn char_range(text: &str, line: u32, column: u32) -> Option<std::ops::Range<usize>> {
    let mut offset = 0;
    for (index, content) in text.lines().enumerate() {
        if index + 1 == line as usize {
            let col = (column.max(1) - 1) as usize;
            let len = content.chars().count();
            if col > len {
                return None;
            }
            let word = content
                .chars()
                .skip(col)
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '.')
                .count()
                .max(1);
            let start = offset + col;
            return Some(start..start + word.min(len.saturating_sub(col)).max(1));
        }
        offset += content.chars().count() + 1;
    }
    None
}

fn snippet(diag: &Diagnostic, text: &str) -> Option<String> {
    let range = char_range(text, diag.location.line, diag.location.column)?;
    let (kind, color) = match diag.severity {
        Severity::Error => (ReportKind::Error, Color::Red),
        Severity::Warning => (ReportKind::Warning, Color::Yellow),
        Severity::Note => (ReportKind::Advice, Color::Blue),
    };
    let name = diag.file.as_str();
    let label = match &diag.predicate {
        Some(pred) => format!("requires `{}`", pred.declared),
        None => diag.kind.to_string(),
    };
    let mut buf = Vec::new();
    ariadne::Report::build(kind, (name, range.clone()))
        .with_config(Config::default().with_color(false))
        .with_code(diag.kind)
        .with_message(&diag.message)
        .with_label(Label::new((name, range)).with_message(label).with_color(color))
        .finish()
        .write((name, Source::from(text)), &mut buf)
        .ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Location;
    use crate::diagnostics::Stats;

    fn report() -> Report {
        let diag = Diagnostic::unchecked_call("Main.java", "Main.main", "Broken.f", Location::new(2, 5));
        let stats = Stats {
            units: 1,
            methods: 1,
            obligations: 2,
            proved: 2,
            ..Stats::default()
        };
        Report::new(vec![diag], stats, false, false)
    }

    #[test]
    fn test_text_report() {
        insta::assert_snapshot!(render_text(&report()), @r"
        Main.java:2:5: note[UncheckedCall]: call to `Broken.f` is not checked: its contract failed to load
          in Main.main
        0 errors, 0 warnings, 1 note; 2/2 obligations proved in 1 method
        ");
    }

    #[test]
    fn test_json_report_fields() {
        let json: serde_json::Value = serde_json::from_str(&render_json(&report()).unwrap()).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["diagnostics"][0]["kind"], "UncheckedCall");
        assert_eq!(json["diagnostics"][0]["severity"], "note");
        assert_eq!(json["diagnostics"][0]["location"]["line"], 2);
        assert!(json["diagnostics"][0].get("witness").is_none());
    }

    #[test]
    fn test_pretty_falls_back_without_source() {
        let text = render_pretty(&report(), &|_| None);
        assert_eq!(text, render_text(&report()));
    }

    #[test]
    fn test_pretty_snippet_points_at_call() {
        let source = "class Main {\n    b.f();\n}\n";
        let text = render_pretty(&report(), &|_| Some(source.to_string()));
        assert!(text.contains("b.f();"), "{text}");
        assert!(text.contains("Broken.f"), "{text}");
    }

    #[test]
    fn test_char_range() {
        let text = "ab\ncd list.get(1)\n";
        assert_eq!(char_range(text, 2, 4), Some(6..14));
        assert_eq!(char_range(text, 9, 1), None);
    }
}
