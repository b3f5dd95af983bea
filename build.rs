use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding this crate's own Rust sources. Everything else under the
// package root (build output, reference material) is left alone.
const SOURCE_DIRS: &[&str] = &[
    "shared",
    "metric",
    "predictions",
    "stacking",
    "cli",
    "tests",
    "benches",
];

const FORBIDDEN_WORDS: &[&str] = &[
    "FIXED", "CORRECTED", "FIX", "FIXES", "NEW", "CHANGED", "CHANGES", "CHANGE", "MODIFIED",
    "MODIFIES", "MODIFY", "UPDATED", "UPDATES", "UPDATE",
];

#[derive(Clone, Copy)]
enum Check {
    UnderscoreBinding,
    ForbiddenWord,
    StarsInComment,
    ShoutingComment,
    AllowDeadCode,
}

impl Check {
    fn pattern(self) -> String {
        match self {
            Check::UnderscoreBinding => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Check::ForbiddenWord => format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Check::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Check::ShoutingComment => r"(//|/\*).*".to_string(),
            Check::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn title(self) -> &'static str {
        match self {
            Check::UnderscoreBinding => "underscore-prefixed identifiers",
            Check::ForbiddenWord => "comments with change-log words",
            Check::StarsInComment => "'**' in regular comments",
            Check::ShoutingComment => "all-uppercase comments",
            Check::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> String {
        match self {
            Check::UnderscoreBinding => {
                "Use the binding (dropping the underscore) or remove it completely.".to_string()
            }
            Check::ForbiddenWord => format!(
                "Comments must describe the code, not its history. Remove any of: {}.",
                FORBIDDEN_WORDS.join(", ")
            ),
            Check::StarsInComment => "'**' is only allowed in doc comments.".to_string(),
            Check::ShoutingComment => "Rewrite the comment in sentence case or delete it.".to_string(),
            Check::AllowDeadCode => "Use the code or delete it.".to_string(),
        }
    }

    // Whether a line matched by `pattern` is a real violation.
    fn is_violation(self, line: &str) -> bool {
        let trimmed = line.trim_start();
        match self {
            Check::UnderscoreBinding => !is_comment(trimmed) && !underscore_only_in_strings(line),
            Check::ForbiddenWord | Check::AllowDeadCode => true,
            Check::StarsInComment => !trimmed.starts_with("///") && !trimmed.starts_with("//!"),
            Check::ShoutingComment => comment_text(trimmed).is_some_and(|text| {
                let mut letters = text.chars().filter(|c| c.is_alphabetic()).peekable();
                letters.peek().is_some() && letters.all(|c| c.is_uppercase())
            }),
        }
    }
}

fn is_comment(trimmed: &str) -> bool {
    trimmed.starts_with("//") || trimmed.starts_with("/*")
}

// True when a quoted segment of the line holds an underscore.
fn underscore_only_in_strings(line: &str) -> bool {
    line.contains('"')
        && line
            .split('"')
            .enumerate()
            .any(|(index, part)| index % 2 == 1 && part.contains('_'))
}

fn comment_text(trimmed: &str) -> Option<&str> {
    for prefix in ["///", "//!", "//"] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return Some(rest.trim());
        }
    }
    let start = trimmed.find("/*")? + 2;
    let body = &trimmed[start..];
    Some(body.find("*/").map_or(body, |end| &body[..end]).trim())
}

struct Collector {
    check: Check,
    violations: Vec<String>,
}

impl Sink for Collector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.check.is_violation(line) {
            self.violations.push(format!("{line_number}:{line}"));
        }
        Ok(true)
    }
}

fn rust_sources() -> Vec<PathBuf> {
    SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect()
}

fn scan(check: Check, files: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(&check.pattern())?;
    let mut searcher = Searcher::new();
    for path in files {
        let mut collector = Collector {
            check,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            return Err(report(check, path, &collector.violations).into());
        }
    }
    Ok(())
}

fn report(check: Check, path: &Path, violations: &[String]) -> String {
    let mut message = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        violations.len(),
        check.title(),
        path.display()
    );
    for violation in violations {
        message.push_str(&format!("   {violation}\n"));
    }
    message.push_str(&format!("\n⚠️ {}\n", check.advice()));
    message
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let files = rust_sources();
    for check in [
        Check::UnderscoreBinding,
        Check::ForbiddenWord,
        Check::StarsInComment,
        Check::ShoutingComment,
        Check::AllowDeadCode,
    ] {
        if let Err(e) = scan(check, &files) {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
