//! QA test runner and patch applier.

use crate::types::{Contract, Issue, Patch, PatchKind, QaResult, TestArg, TestKind};
use crate::util::text::{ensure_header, word_count};
use regex::RegexBuilder;
use std::collections::HashMap;

/// Run every test in `contract` against `content`, collecting issues (with
/// suggested patches where applicable) in test order.
pub fn run_tests(content: &str, contract: &Contract) -> QaResult {
    let mut issues = Vec::new();
    let words = word_count(content);
    if words < 1 {
        issues.push(Issue::new("empty"));
    }

    for t in &contract.tests {
        match t.kind {
            TestKind::Nonempty => {
                if words < 1 {
                    issues.push(Issue::new("nonempty_fail"));
                }
            }
            TestKind::Regex => {
                let pattern = t.arg.as_text();
                match RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .multi_line(true)
                    .build()
                {
                    Ok(re) => {
                        if !re.is_match(content) {
                            issues.push(
                                Issue::new("regex_fail").with_detail("pattern", &pattern),
                            );
                        }
                    }
                    Err(_) => {
                        issues.push(Issue::new("regex_invalid").with_detail("pattern", &pattern));
                    }
                }
            }
            TestKind::Contains => {
                let needle = t.arg.as_text();
                if !content.to_lowercase().contains(&needle.to_lowercase()) {
                    issues.push(Issue::new("contains_missing").with_detail("needle", &needle));
                }
            }
            TestKind::WordCountMin => {
                let need = t.arg.as_count(50);
                if words < need {
                    let hint = format!("Expand with {}+ words.", need.saturating_sub(words));
                    let mut arg = HashMap::new();
                    arg.insert("hint".to_string(), hint);
                    issues.push(
                        Issue::new("too_short")
                            .with_detail("needed", need)
                            .with_detail("have", words)
                            .with_patch(Patch {
                                kind: PatchKind::AppendText,
                                arg,
                            }),
                    );
                }
            }
            TestKind::HeaderPresent => {
                let wanted = t.arg.as_text();
                let (ok, suggestion) = ensure_header(content, &wanted);
                if !ok {
                    let mut issue = Issue::new("header_missing").with_detail("wanted", &wanted);
                    if let Some((level, title)) = suggestion {
                        let mut arg = HashMap::new();
                        arg.insert("title".to_string(), title);
                        arg.insert("level".to_string(), level.to_string());
                        issue = issue.with_patch(Patch {
                            kind: PatchKind::InsertHeader,
                            arg,
                        });
                    }
                    issues.push(issue);
                }
            }
        }
    }

    QaResult {
        ok: issues.is_empty(),
        issues,
    }
}

/// Apply patches in order; malformed patches are skipped without aborting
/// the rest of the batch.
pub fn apply_patches(content: &str, patches: &[Patch]) -> String {
    let mut out = content.to_string();
    for p in patches {
        match p.kind {
            PatchKind::InsertHeader => {
                let title = p
                    .arg
                    .get("title")
                    .cloned()
                    .unwrap_or_else(|| "Section".to_string());
                let level: u8 = p
                    .arg
                    .get("level")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2);
                let level = level.clamp(1, 6);
                let hdr = format!("{} {}\n", "#".repeat(level as usize), title);
                if out.trim().is_empty() {
                    out = hdr;
                } else {
                    let mut lines: Vec<String> =
                        out.lines().map(|l| l.to_string()).collect();
                    if lines.first().map(|l| l.starts_with('#')).unwrap_or(false) {
                        lines[0] = hdr.trim().to_string();
                    } else {
                        lines.insert(0, hdr.trim().to_string());
                    }
                    out = lines.join("\n");
                }
            }
            PatchKind::AppendText => {
                let hint = p.arg.get("hint").map(|s| s.trim()).unwrap_or("");
                if !hint.is_empty() {
                    out = format!("{}\n\n{}\n", out.trim_end(), hint);
                }
            }
            PatchKind::PrependText => {
                let hint = p.arg.get("hint").map(|s| s.trim()).unwrap_or("");
                if !hint.is_empty() {
                    out = format!("{}\n\n{}", hint, out.trim_start());
                }
            }
            PatchKind::RegexSub => {
                let pattern = p.arg.get("pattern").map(|s| s.as_str()).unwrap_or("");
                let repl = p.arg.get("repl").map(|s| s.as_str()).unwrap_or("");
                if let Ok(re) = RegexBuilder::new(pattern).multi_line(true).build() {
                    out = re.replace_all(&out, repl).into_owned();
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Contract;

    #[test]
    fn run_tests_flags_missing_header_and_suggests_patch() {
        let contract = Contract::for_section("Answer", Some(5));
        let qa = run_tests("too short", &contract);
        assert!(!qa.ok);
        assert!(qa.issues.iter().any(|i| i.code == "header_missing"));
        assert!(qa.issues.iter().any(|i| i.code == "too_short"));
    }

    #[test]
    fn run_tests_passes_when_contract_satisfied() {
        let contract = Contract::for_section("Answer", Some(2));
        let qa = run_tests("## Answer\n\nhello world there", &contract);
        assert!(qa.ok, "{:?}", qa.issues);
    }

    #[test]
    fn apply_patches_inserts_header_at_start() {
        let mut arg = HashMap::new();
        arg.insert("title".to_string(), "Answer".to_string());
        arg.insert("level".to_string(), "2".to_string());
        let patch = Patch {
            kind: PatchKind::InsertHeader,
            arg,
        };
        let out = apply_patches("body text", &[patch]);
        assert!(out.starts_with("## Answer"));
    }

    #[test]
    fn apply_patches_skips_malformed_regex_sub() {
        let mut arg = HashMap::new();
        arg.insert("pattern".to_string(), "(".to_string());
        arg.insert("repl".to_string(), "x".to_string());
        let patch = Patch {
            kind: PatchKind::RegexSub,
            arg,
        };
        let out = apply_patches("unchanged", &[patch]);
        assert_eq!(out, "unchanged");
    }
}
