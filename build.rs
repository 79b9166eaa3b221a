use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source directories checked by the policy gate. Everything else in the
// working tree (build output, data, reference material) is left alone.
const SOURCE_DIRS: [&str; 4] = ["predict", "cli", "tests", "benches"];

const FORBIDDEN_WORDS: [&str; 14] = [
    "FIXED",
    "CORRECTED",
    "FIX",
    "FIXES",
    "NEW",
    "CHANGED",
    "CHANGES",
    "CHANGE",
    "MODIFIED",
    "MODIFIES",
    "MODIFY",
    "UPDATED",
    "UPDATES",
    "UPDATE",
];

// One project convention, enforced line by line.
#[derive(Clone, Copy)]
enum Rule {
    UnderscorePrefix,
    ForbiddenWord,
    StarsInComment,
    AllUppercaseComment,
    AllowDeadCode,
}

impl Rule {
    const ALL: [Rule; 5] = [
        Rule::UnderscorePrefix,
        Rule::ForbiddenWord,
        Rule::StarsInComment,
        Rule::AllUppercaseComment,
        Rule::AllowDeadCode,
    ];

    // Line-level regex that preselects candidate lines for `is_violation`.
    fn pattern(self) -> String {
        match self {
            Rule::UnderscorePrefix => r"\b(_[a-zA-Z0-9_]+)\b".to_string(),
            Rule::ForbiddenWord => format!(r"(//|/\*).*(?:{})", FORBIDDEN_WORDS.join("|")),
            Rule::StarsInComment => r"(//|/\*).*\*\*".to_string(),
            Rule::AllUppercaseComment => r"(//|/\*).*".to_string(),
            Rule::AllowDeadCode => r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]".to_string(),
        }
    }

    fn is_violation(self, line: &str) -> bool {
        match self {
            Rule::UnderscorePrefix => !is_comment(line) && !has_underscore_in_string(line),
            Rule::ForbiddenWord | Rule::AllowDeadCode => true,
            Rule::StarsInComment => !is_doc_comment(line),
            Rule::AllUppercaseComment => comment_text(line).is_some_and(|text| {
                let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !letters.is_empty() && letters.iter().all(|c| c.is_uppercase())
            }),
        }
    }

    fn explanation(self) -> String {
        match self {
            Rule::UnderscorePrefix => {
                "Underscore-prefixed names are not allowed in this project.\n   \
                 Either use the binding (removing the underscore) or remove it completely."
                    .to_string()
            }
            Rule::ForbiddenWord => format!(
                "Comments containing {} are not allowed.\n   \
                 Describe the code as it is, not the edit that produced it.",
                FORBIDDEN_WORDS.join(", ")
            ),
            Rule::StarsInComment => {
                "The '**' pattern is not allowed in regular comments (doc comments may use it)."
                    .to_string()
            }
            Rule::AllUppercaseComment => {
                "Comments where all alphabetic characters are uppercase are not allowed.\n   \
                 Consider deleting the comment completely."
                    .to_string()
            }
            Rule::AllowDeadCode => {
                "#[allow(dead_code)] attributes are not allowed.\n   \
                 Either use the code (removing the attribute) or remove it completely."
                    .to_string()
            }
        }
    }
}

fn is_doc_comment(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("///") || trimmed.starts_with("//!")
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with("//")
        || (line.contains("/*") && !line.contains("*/match") && !line.contains("*/let"))
}

// A match between a pair of quotes belongs to a string literal, not a binding.
fn has_underscore_in_string(line: &str) -> bool {
    line.split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

// The text of a comment line without its leading marker.
fn comment_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed
        .strip_prefix("///")
        .or_else(|| trimmed.strip_prefix("//!"))
        .or_else(|| trimmed.strip_prefix("//"))
    {
        return Some(rest.trim());
    }
    let start = line.find("/*")? + 2;
    Some(match line[start..].find("*/") {
        Some(end) => line[start..start + end].trim(),
        None => line[start..].trim(),
    })
}

// Collects every violating line of one file for one rule.
struct RuleCollector {
    rule: Rule,
    violations: Vec<String>,
}

impl Sink for RuleCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.rule.is_violation(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
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

fn check_file(rule: Rule, matcher: &RegexMatcher, path: &Path) -> Result<(), Box<dyn Error>> {
    let mut collector = RuleCollector {
        rule,
        violations: Vec::new(),
    };
    Searcher::new().search_path(matcher, path, &mut collector)?;
    if collector.violations.is_empty() {
        return Ok(());
    }

    let mut error_msg = format!(
        "\n❌ ERROR: Found {} policy violations in {}:\n",
        collector.violations.len(),
        path.display()
    );
    for violation in &collector.violations {
        error_msg.push_str(&format!("   {violation}\n"));
    }
    error_msg.push_str(&format!("\n⚠️ {}\n", rule.explanation()));
    Err(error_msg.into())
}

fn scan_sources(sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    for rule in Rule::ALL {
        let matcher = RegexMatcher::new_line_matcher(&rule.pattern())?;
        for path in sources {
            check_file(rule, &matcher, path)?;
        }
    }
    Ok(())
}

// Compiles this script on its own with the crate's strict lints, so the gate
// holds itself to the policy it enforces.
fn check_build_script() {
    let out_dir = std::env::var("OUT_DIR").unwrap_or_else(|_| ".".to_string());
    let output = std::process::Command::new("rustc")
        .args([
            "--edition",
            "2021",
            "-D",
            "unused_variables",
            "-D",
            "dead_code",
            "-D",
            "unused_imports",
            "--crate-type",
            "bin",
            "--error-format",
            "human",
            "--emit",
            "metadata",
            "build.rs",
        ])
        .arg("--out-dir")
        .arg(out_dir)
        .output();

    match output {
        Ok(output) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lint_failed = ["unused variable", "is never used", "unused import"]
                .iter()
                .any(|needle| stderr.contains(needle));
            if lint_failed {
                eprintln!("\n❌ ERROR: build.rs violates the project lints!");
                eprintln!("{stderr}");
                std::process::exit(1);
            }
        }
        Ok(_) => {}
        Err(e) => {
            println!("cargo:warning=Could not lint build.rs with rustc: {e}");
        }
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    check_build_script();

    if let Err(e) = scan_sources(&rust_sources()) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
