use regex::Regex;

use crate::errors::{Result, ServiceError};
use crate::models::{AnalysisDetails, CodeAnalysis, CodeIssue, CodeSuggestion, Level, Technology};

const LONG_LINE: usize = 120;
const DEEP_NESTING: usize = 4;
const LONG_BLOCK_LINES: usize = 50;

/// Structural facts pulled out of the code before any rule runs.
#[derive(Debug, Default)]
struct CodeStructure {
    imports: Vec<String>,
    functions: Vec<(String, u32)>,
    classes: Vec<(String, u32)>,
    components: Vec<String>,
    hooks: Vec<String>,
}

struct LineRule {
    pattern: Regex,
    unless: Option<Regex>,
    description: &'static str,
    severity: Level,
}

impl LineRule {
    fn matches(&self, line: &str) -> bool {
        self.pattern.is_match(line) && !self.unless.as_ref().map_or(false, |u| u.is_match(line))
    }
}

/// Heuristic, regex-driven code review. Output depends only on the code and
/// technology, so identical input always yields identical analysis.
pub struct CodeAnalyzer {
    python_import: Regex,
    python_from_import: Regex,
    python_def: Regex,
    python_class: Regex,
    js_import: Regex,
    js_require: Regex,
    js_function: Regex,
    js_class: Regex,
    js_component: Regex,
    js_hook: Regex,
    decision: Regex,
    secret: Regex,
    python_rules: Vec<LineRule>,
    js_rules: Vec<LineRule>,
    sql_rules: Vec<LineRule>,
    html_rules: Vec<LineRule>,
    css_rules: Vec<LineRule>,
}

fn re(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| ServiceError::Internal(format!("Invalid analyzer pattern {}: {}", pattern, e)))
}

fn rule(pattern: &str, description: &'static str, severity: Level) -> Result<LineRule> {
    Ok(LineRule {
        pattern: re(pattern)?,
        unless: None,
        description,
        severity,
    })
}

fn rule_unless(pattern: &str, unless: &str, description: &'static str, severity: Level) -> Result<LineRule> {
    Ok(LineRule {
        pattern: re(pattern)?,
        unless: Some(re(unless)?),
        description,
        severity,
    })
}

impl CodeAnalyzer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            python_import: re(r"^\s*import\s+([\w.]+)")?,
            python_from_import: re(r"^\s*from\s+([\w.]+)\s+import\s+")?,
            python_def: re(r"^\s*(?:async\s+)?def\s+(\w+)\s*\(")?,
            python_class: re(r"^\s*class\s+(\w+)")?,
            js_import: re(r#"^\s*import\s+(?:[^'"]*?\s+from\s+)?['"]([^'"]+)['"]"#)?,
            js_require: re(r#"require\(\s*['"]([^'"]+)['"]\s*\)"#)?,
            js_function: re(
                r"(?:function\s+([A-Za-z_$][\w$]*)\s*\(|(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*(?:async\s*)?(?:function\b|\([^)]*\)\s*=>|[A-Za-z_$][\w$]*\s*=>))",
            )?,
            js_class: re(r"class\s+([A-Za-z_$][\w$]*)")?,
            js_component: re(r"(?:function|const|let|var)\s+([A-Z][\w$]*)\s*(?:=|\()")?,
            js_hook: re(r"\b(use[A-Z][\w$]*)\s*\(")?,
            decision: re(r"\b(?:if|elif|for|while|case|catch|except|when)\b|&&|\|\||\?\s")?,
            secret: re(r#"(?i)\b(password|passwd|secret|api_key|apikey|token)\b\s*[:=]\s*['"][^'"]{4,}['"]"#)?,
            python_rules: vec![
                rule(r"^\s*except\s*:", "Bare `except:` swallows every exception", Level::Medium)?,
                rule(r"\b(?:eval|exec)\s*\(", "Use of eval/exec on dynamic input", Level::High)?,
                rule(r"def\s+\w+\([^)]*=\s*(?:\[\]|\{\}|set\(\))", "Mutable default argument", Level::Medium)?,
                rule(r"^\s*from\s+[\w.]+\s+import\s+\*", "Wildcard import pollutes the namespace", Level::Low)?,
                rule(r"==\s*None\b|!=\s*None\b", "Comparison to None should use `is` / `is not`", Level::Low)?,
            ],
            js_rules: vec![
                rule(r"\beval\s*\(", "Use of eval on dynamic input", Level::High)?,
                rule(r"\.innerHTML\s*=", "Assigning innerHTML can introduce XSS", Level::High)?,
                rule(r"dangerouslySetInnerHTML", "dangerouslySetInnerHTML bypasses React escaping", Level::Medium)?,
                rule(r"[^=!]==[^=]|!=[^=]", "Loose equality; prefer === / !==", Level::Low)?,
                rule(r"^\s*var\s+", "`var` is function-scoped; prefer let/const", Level::Low)?,
                rule(r"console\.log\s*\(", "Leftover console.log", Level::Low)?,
            ],
            sql_rules: vec![
                rule(r"(?i)\bselect\s+\*", "SELECT * fetches every column", Level::Low)?,
                rule(r"(?i)^\s*delete\s+from\s+\w+\s*;?\s*$", "DELETE without WHERE clause", Level::High)?,
                rule_unless(r"(?i)^\s*update\s+\w+\s+set\s+[^;]*;\s*$", r"(?i)\bwhere\b", "UPDATE without WHERE clause", Level::High)?,
            ],
            html_rules: vec![
                rule_unless(r"(?i)<img\b", r"(?i)\balt\s*=", "Image without alt text", Level::Medium)?,
                rule(r"(?i)\son\w+\s*=", "Inline event handler attribute", Level::Low)?,
                rule(r"(?i)<font\b|<center\b", "Deprecated presentational element", Level::Low)?,
            ],
            css_rules: vec![
                rule(r"!important", "!important makes overrides hard", Level::Low)?,
                rule(r"^\s*#[\w-]+\s*\{", "ID selector has high specificity", Level::Low)?,
            ],
        })
    }

    /// Run the full analysis over one piece of code.
    pub fn analyze(&self, code: &str, technology: Technology) -> Result<CodeAnalysis> {
        if code.trim().is_empty() {
            return Err(ServiceError::Validation("No code to analyze".to_string()));
        }
        log::debug!("Analyzing {} lines of {}", code.lines().count(), technology);

        let structure = self.extract_structure(code, technology);
        let mut issues = Vec::new();

        self.check_balance(code, technology, &mut issues);
        self.run_line_rules(code, technology, &mut issues);
        self.check_secrets(code, &mut issues);
        let depth = max_nesting(code, technology);
        if depth > DEEP_NESTING {
            issues.push(CodeIssue {
                description: format!("Deeply nested code (depth {})", depth),
                severity: Level::Medium,
                line_number: None,
            });
        }

        issues.sort_by(|a, b| {
            a.line_number
                .unwrap_or(u32::MAX)
                .cmp(&b.line_number.unwrap_or(u32::MAX))
                .then(b.severity.cmp(&a.severity))
                .then(a.description.cmp(&b.description))
        });

        let long_lines = code.lines().filter(|l| l.chars().count() > LONG_LINE).count();
        let suggestions = self.suggest(code, technology, &structure, &issues, depth, long_lines);
        let complexity_score = self.complexity_score(code, depth);

        let details = AnalysisDetails {
            code_structure: Some(describe_structure(&structure, code)),
            best_practices: Some(describe_issues(&issues)),
            additional_notes: None,
        };

        let mut dependencies: Vec<String> = Vec::new();
        for import in &structure.imports {
            if !dependencies.contains(import) {
                dependencies.push(import.clone());
            }
        }

        Ok(CodeAnalysis {
            issues,
            suggestions,
            dependencies,
            complexity_score,
            analysis_details: Some(details),
        })
    }

    fn extract_structure(&self, code: &str, technology: Technology) -> CodeStructure {
        let mut structure = CodeStructure::default();

        for (idx, line) in code.lines().enumerate() {
            let line_no = idx as u32 + 1;
            if technology == Technology::Python {
                if let Some(cap) = self.python_import.captures(line) {
                    structure.imports.push(cap[1].to_string());
                } else if let Some(cap) = self.python_from_import.captures(line) {
                    structure.imports.push(cap[1].to_string());
                }
                if let Some(cap) = self.python_def.captures(line) {
                    structure.functions.push((cap[1].to_string(), line_no));
                }
                if let Some(cap) = self.python_class.captures(line) {
                    structure.classes.push((cap[1].to_string(), line_no));
                }
            } else if technology.is_javascript_like() {
                if let Some(cap) = self.js_import.captures(line) {
                    structure.imports.push(cap[1].to_string());
                }
                for cap in self.js_require.captures_iter(line) {
                    structure.imports.push(cap[1].to_string());
                }
                for cap in self.js_function.captures_iter(line) {
                    if let Some(name) = cap.get(1).or_else(|| cap.get(2)) {
                        structure.functions.push((name.as_str().to_string(), line_no));
                    }
                }
                for cap in self.js_class.captures_iter(line) {
                    structure.classes.push((cap[1].to_string(), line_no));
                }
                if technology == Technology::React {
                    for cap in self.js_component.captures_iter(line) {
                        structure.components.push(cap[1].to_string());
                    }
                    for cap in self.js_hook.captures_iter(line) {
                        let hook = cap[1].to_string();
                        if !structure.hooks.contains(&hook) {
                            structure.hooks.push(hook);
                        }
                    }
                }
            }
        }

        structure
    }

    // Report the first unbalanced bracket as a syntax error
    fn check_balance(&self, code: &str, technology: Technology, issues: &mut Vec<CodeIssue>) {
        if matches!(technology, Technology::Html | Technology::Sql) {
            return;
        }

        let mut stack: Vec<(char, u32)> = Vec::new();
        for (ch, line) in code_chars(code, technology) {
            match ch {
                '(' | '[' | '{' => stack.push((ch, line)),
                ')' | ']' | '}' => {
                    let expected = match ch {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        _ => {
                            issues.push(CodeIssue {
                                description: format!("Syntax error: unexpected '{}'", ch),
                                severity: Level::High,
                                line_number: Some(line),
                            });
                            return;
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some((open, line)) = stack.pop() {
            issues.push(CodeIssue {
                description: format!("Syntax error: unclosed '{}'", open),
                severity: Level::High,
                line_number: Some(line),
            });
        }
    }

    fn run_line_rules(&self, code: &str, technology: Technology, issues: &mut Vec<CodeIssue>) {
        let rules = match technology {
            Technology::Python => &self.python_rules,
            Technology::Sql => &self.sql_rules,
            Technology::Html => &self.html_rules,
            Technology::Css => &self.css_rules,
            _ => &self.js_rules,
        };

        for rule in rules {
            // One issue per rule, anchored at its first occurrence
            let first = code
                .lines()
                .enumerate()
                .filter(|(_, line)| !is_comment_line(line, technology))
                .find(|(_, line)| rule.matches(line));
            if let Some((idx, _)) = first {
                let occurrences = code.lines().filter(|line| rule.matches(line)).count();
                let description = if occurrences > 1 {
                    format!("{} ({} occurrences)", rule.description, occurrences)
                } else {
                    rule.description.to_string()
                };
                issues.push(CodeIssue {
                    description,
                    severity: rule.severity,
                    line_number: Some(idx as u32 + 1),
                });
            }
        }
    }

    fn check_secrets(&self, code: &str, issues: &mut Vec<CodeIssue>) {
        for (idx, line) in code.lines().enumerate() {
            if let Some(cap) = self.secret.captures(line) {
                issues.push(CodeIssue {
                    description: format!("Hardcoded credential in `{}`", &cap[1]),
                    severity: Level::High,
                    line_number: Some(idx as u32 + 1),
                });
            }
        }
    }

    fn suggest(
        &self,
        code: &str,
        technology: Technology,
        structure: &CodeStructure,
        issues: &[CodeIssue],
        depth: usize,
        long_lines: usize,
    ) -> Vec<CodeSuggestion> {
        let mut suggestions = Vec::new();

        if issues.iter().any(|i| i.severity == Level::High) {
            suggestions.push(CodeSuggestion {
                description: "Resolve the high-severity issues first".to_string(),
                benefit: Some("Removes correctness and security risks".to_string()),
                effort: Level::Medium,
            });
        }
        if depth > DEEP_NESTING {
            suggestions.push(CodeSuggestion {
                description: "Extract deeply nested logic into helper functions or use early returns".to_string(),
                benefit: Some("Improves readability and testability".to_string()),
                effort: Level::Medium,
            });
        }
        if long_lines > 0 {
            suggestions.push(CodeSuggestion {
                description: format!("Wrap {} line(s) longer than {} characters", long_lines, LONG_LINE),
                benefit: Some("Easier to read and review".to_string()),
                effort: Level::Low,
            });
        }
        if let Some((name, _)) = self.longest_function(code, structure) {
            suggestions.push(CodeSuggestion {
                description: format!("Split `{}` into smaller functions", name),
                benefit: Some("Shorter functions are easier to reason about".to_string()),
                effort: Level::High,
            });
        }

        let total_lines = code.lines().count();
        let comment_lines = code.lines().filter(|l| is_comment_line(l, technology)).count();
        if total_lines > 30 && comment_lines == 0 {
            suggestions.push(CodeSuggestion {
                description: "Add comments or docstrings to the non-obvious parts".to_string(),
                benefit: Some("Helps future maintainers".to_string()),
                effort: Level::Low,
            });
        }
        if technology.is_javascript_like() && issues.iter().any(|i| i.description.contains("`var`")) {
            suggestions.push(CodeSuggestion {
                description: "Replace `var` declarations with `const` or `let`".to_string(),
                benefit: Some("Block scoping avoids hoisting bugs".to_string()),
                effort: Level::Low,
            });
        }
        if technology == Technology::React && structure.hooks.len() > 5 {
            suggestions.push(CodeSuggestion {
                description: "Group related hooks into a custom hook".to_string(),
                benefit: Some("Keeps components focused on rendering".to_string()),
                effort: Level::Medium,
            });
        }

        suggestions
    }

    // The longest function past the size threshold, measured to the next definition
    fn longest_function<'a>(&self, code: &str, structure: &'a CodeStructure) -> Option<(&'a str, usize)> {
        let total = code.lines().count() as u32;
        let mut starts: Vec<(&str, u32)> = structure
            .functions
            .iter()
            .chain(structure.classes.iter())
            .map(|(name, line)| (name.as_str(), *line))
            .collect();
        starts.sort_by_key(|(_, line)| *line);

        structure
            .functions
            .iter()
            .filter_map(|(name, line)| {
                let end = starts
                    .iter()
                    .map(|(_, l)| *l)
                    .find(|l| l > line)
                    .unwrap_or(total + 1);
                let len = (end - line) as usize;
                (len > LONG_BLOCK_LINES).then_some((name.as_str(), len))
            })
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(a.0)))
    }

    /// 0–10 score from decision points, nesting depth and size.
    fn complexity_score(&self, code: &str, depth: usize) -> f64 {
        let decisions = self.decision.find_iter(code).count() as f64;
        let lines = code.lines().filter(|l| !l.trim().is_empty()).count() as f64;

        let raw = (1.0 + decisions).ln() * 2.0 + depth as f64 * 0.5 + lines / 200.0;
        (raw.min(10.0) * 10.0).round() / 10.0
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Scan {
    Code,
    Quoted(char),
    TripleQuoted(char),
    LineComment,
    BlockComment,
    Regex { in_class: bool },
}

/// Characters that matter for bracket matching. Strings, Python triple
/// quoted strings, comments and JS regex literals are skipped.
fn code_chars(code: &str, technology: Technology) -> Vec<(char, u32)> {
    let python = technology == Technology::Python;
    let javascript = technology.is_javascript_like();
    let slash_comments = javascript || technology == Technology::Css;

    let chars: Vec<char> = code.chars().collect();
    let mut out = Vec::new();
    let mut line = 1u32;
    let mut state = Scan::Code;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        if ch == '\n' {
            line += 1;
        }

        match state {
            Scan::Code => match ch {
                '\n' => {}
                '"' | '\'' if python && next == Some(ch) && chars.get(i + 2) == Some(&ch) => {
                    state = Scan::TripleQuoted(ch);
                    i += 2;
                }
                '"' | '\'' | '`' => state = Scan::Quoted(ch),
                '#' if python => state = Scan::LineComment,
                '/' if slash_comments && next == Some('/') => {
                    state = Scan::LineComment;
                    i += 1;
                }
                '/' if slash_comments && next == Some('*') => {
                    state = Scan::BlockComment;
                    i += 1;
                }
                '/' if javascript && regex_allowed(&chars[..i]) => state = Scan::Regex { in_class: false },
                _ => out.push((ch, line)),
            },
            Scan::LineComment => {
                if ch == '\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                if ch == '*' && next == Some('/') {
                    state = Scan::Code;
                    i += 1;
                }
            }
            Scan::Quoted(quote) => {
                if ch == '\\' {
                    if next == Some('\n') {
                        line += 1;
                    }
                    i += 1;
                } else if ch == quote || (ch == '\n' && quote != '`') {
                    // Single and double quoted strings also end at the line break
                    state = Scan::Code;
                }
            }
            Scan::TripleQuoted(quote) => {
                if ch == '\\' {
                    if next == Some('\n') {
                        line += 1;
                    }
                    i += 1;
                } else if ch == quote && next == Some(quote) && chars.get(i + 2) == Some(&quote) {
                    state = Scan::Code;
                    i += 2;
                }
            }
            Scan::Regex { in_class } => match ch {
                '\\' => i += 1,
                '[' => state = Scan::Regex { in_class: true },
                ']' => state = Scan::Regex { in_class: false },
                '/' if !in_class => state = Scan::Code,
                '\n' => state = Scan::Code,
                _ => {}
            },
        }
        i += 1;
    }

    out
}

/// Whether a `/` at this point starts a regex literal rather than a division:
/// true after an operator, an opening bracket or a keyword like `return`.
fn regex_allowed(before: &[char]) -> bool {
    let mut end = before.len();
    while end > 0 && before[end - 1].is_whitespace() {
        end -= 1;
    }
    let prev = match end.checked_sub(1).map(|j| before[j]) {
        Some(prev) => prev,
        None => return true,
    };
    if "(,=:[!&|?{};+-*%~^".contains(prev) {
        return true;
    }

    let is_word = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
    if !is_word(prev) {
        return false;
    }
    let mut start = end;
    while start > 0 && is_word(before[start - 1]) {
        start -= 1;
    }
    let word: String = before[start..end].iter().collect();
    matches!(
        word.as_str(),
        "return" | "typeof" | "case" | "in" | "of" | "delete" | "void" | "throw" | "new" | "else" | "yield" | "await"
    )
}

fn is_comment_line(line: &str, technology: Technology) -> bool {
    let trimmed = line.trim_start();
    match technology {
        Technology::Python => trimmed.starts_with('#'),
        Technology::Sql => trimmed.starts_with("--"),
        Technology::Html => trimmed.starts_with("<!--"),
        _ => trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*'),
    }
}

fn max_nesting(code: &str, technology: Technology) -> usize {
    if technology == Technology::Python {
        // Indentation levels, assuming 4-space (or tab) indents
        return code
            .lines()
            .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .map(|l| {
                let indent: usize = l
                    .chars()
                    .take_while(|c| c.is_whitespace())
                    .map(|c| if c == '\t' { 4 } else { 1 })
                    .sum();
                indent / 4
            })
            .max()
            .unwrap_or(0);
    }

    let mut depth = 0usize;
    let mut max = 0usize;
    for (ch, _) in code_chars(code, technology) {
        match ch {
            '{' => {
                depth += 1;
                max = max.max(depth);
            }
            '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

fn describe_structure(structure: &CodeStructure, code: &str) -> String {
    let mut parts = vec![
        format!("{} line(s)", code.lines().count()),
        format!("{} function(s)", structure.functions.len()),
        format!("{} class(es)", structure.classes.len()),
        format!("{} import(s)", structure.imports.len()),
    ];
    if !structure.components.is_empty() {
        parts.push(format!("components: {}", structure.components.join(", ")));
    }
    if !structure.hooks.is_empty() {
        parts.push(format!("hooks: {}", structure.hooks.join(", ")));
    }
    parts.join("; ")
}

fn describe_issues(issues: &[CodeIssue]) -> String {
    if issues.is_empty() {
        return "No common anti-patterns detected".to_string();
    }
    let count = |level: Level| issues.iter().filter(|i| i.severity == level).count();
    format!(
        "Found {} issue(s): {} high, {} medium, {} low",
        issues.len(),
        count(Level::High),
        count(Level::Medium),
        count(Level::Low)
    )
}
