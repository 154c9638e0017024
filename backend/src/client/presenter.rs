use std::collections::HashMap;

use crate::models::{CodeAnalysis, QueryResponse, SolutionResult};

pub const LOADING: &str = "Loading…";
pub const NO_OFFICIAL: &str = "No official solution available";
pub const NO_COMMUNITY: &str = "No community solution available";
pub const NO_ANALYSIS: &str = "No code analysis available";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tab {
    #[default]
    Official,
    Community,
    Analysis,
}

impl Tab {
    pub const ALL: [Tab; 3] = [Tab::Official, Tab::Community, Tab::Analysis];

    pub fn title(&self) -> &'static str {
        match self {
            Tab::Official => "Official Documentation",
            Tab::Community => "Community Solutions",
            Tab::Analysis => "Code Analysis",
        }
    }
}

/// Visible markdown for one tab of a response. Pure: the same response and
/// tab always render the same text.
pub fn render(response: &QueryResponse, tab: Tab) -> String {
    match tab {
        Tab::Official => render_solution(response.official_solution.as_ref(), response, NO_OFFICIAL),
        Tab::Community => render_solution(response.community_solution.as_ref(), response, NO_COMMUNITY),
        Tab::Analysis => match &response.code_analysis {
            Some(analysis) => render_analysis(analysis),
            None => NO_ANALYSIS.to_string(),
        },
    }
}

fn render_solution(solution: Option<&SolutionResult>, response: &QueryResponse, empty: &str) -> String {
    let solution = match solution {
        Some(solution) => solution,
        None => return empty.to_string(),
    };

    let mut out = solution.answer.trim().to_string();
    if let Some(code) = &solution.code_changes {
        out.push_str(&format!(
            "\n\n### Suggested Changes\n\n```{}\n{}\n```",
            response.technology,
            code.trim_end()
        ));
    }
    if !solution.references.is_empty() {
        out.push_str("\n\n### References\n");
        for (i, reference) in solution.references.iter().enumerate() {
            let source = &reference.source;
            let title = match &source.url {
                Some(url) => format!("[{}]({})", source.title, url),
                None => source.title.clone(),
            };
            out.push_str(&match &source.description {
                Some(description) => format!("\n{}. {} - {}", i + 1, title, description),
                None => format!("\n{}. {}", i + 1, title),
            });
        }
    }
    out.push_str(&format!("\n\n_Confidence: {:.0}%_", solution.confidence_score * 100.0));
    out
}

fn render_analysis(analysis: &CodeAnalysis) -> String {
    let mut out = format!("**Complexity:** {:.1}/10", analysis.complexity_score);

    out.push_str("\n\n### Issues\n");
    if analysis.issues.is_empty() {
        out.push_str("\nNo issues found.");
    }
    for issue in &analysis.issues {
        let severity = issue.severity.to_string().to_uppercase();
        out.push_str(&match issue.line_number {
            Some(line) => format!("\n- **{}** (line {}): {}", severity, line, issue.description),
            None => format!("\n- **{}**: {}", severity, issue.description),
        });
    }

    if !analysis.suggestions.is_empty() {
        out.push_str("\n\n### Suggestions\n");
        for suggestion in &analysis.suggestions {
            out.push_str(&format!("\n- {} (effort: {})", suggestion.description, suggestion.effort));
            if let Some(benefit) = &suggestion.benefit {
                out.push_str(&format!(": {}", benefit));
            }
        }
    }

    if !analysis.dependencies.is_empty() {
        out.push_str(&format!("\n\n### Dependencies\n\n{}", analysis.dependencies.join(", ")));
    }

    if let Some(details) = &analysis.analysis_details {
        for (heading, text) in [
            ("Structure", &details.code_structure),
            ("Best Practices", &details.best_practices),
            ("Notes", &details.additional_notes),
        ] {
            if let Some(text) = text {
                out.push_str(&format!("\n\n### {}\n\n{}", heading, text.trim()));
            }
        }
    }
    out
}

/// Text the copy button puts on the clipboard: the suggested code when
/// there is some, otherwise the answer.
pub fn copy_text(response: &QueryResponse, tab: Tab) -> Option<String> {
    let solution = match tab {
        Tab::Official => response.official_solution.as_ref(),
        Tab::Community => response.community_solution.as_ref(),
        Tab::Analysis => None,
    }?;
    Some(solution.code_changes.clone().unwrap_or_else(|| solution.answer.clone()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Up,
    Down,
}

/// At most one overlay is open at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overlay {
    #[default]
    None,
    Help,
    MobileMenu,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TabFlags {
    pub copied: bool,
    pub vote: Option<Vote>,
    pub bookmarked: bool,
}

/// Local view state. Nothing here is sent to the server and changing it
/// never triggers a request.
#[derive(Debug, Clone, Default)]
pub struct PresenterState {
    active_tab: Tab,
    overlay: Overlay,
    flags: HashMap<Tab, TabFlags>,
}

impl PresenterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_tab(&self) -> Tab {
        self.active_tab
    }

    pub fn select_tab(&mut self, tab: Tab) {
        self.active_tab = tab;
    }

    /// What the results panel shows right now.
    pub fn view(&self, response: Option<&QueryResponse>, loading: bool) -> Option<String> {
        if loading {
            return Some(LOADING.to_string());
        }
        response.map(|r| render(r, self.active_tab))
    }

    pub fn overlay(&self) -> Overlay {
        self.overlay
    }

    /// Open `overlay`, or close it when it is already open.
    pub fn toggle_overlay(&mut self, overlay: Overlay) {
        self.overlay = if self.overlay == overlay { Overlay::None } else { overlay };
    }

    pub fn close_overlay(&mut self) {
        self.overlay = Overlay::None;
    }

    pub fn flags(&self, tab: Tab) -> TabFlags {
        self.flags.get(&tab).copied().unwrap_or_default()
    }

    pub fn set_copied(&mut self, tab: Tab, copied: bool) {
        self.flags.entry(tab).or_default().copied = copied;
    }

    /// Voting the same way twice clears the vote.
    pub fn vote(&mut self, tab: Tab, vote: Vote) {
        let flags = self.flags.entry(tab).or_default();
        flags.vote = if flags.vote == Some(vote) { None } else { Some(vote) };
    }

    pub fn toggle_bookmark(&mut self, tab: Tab) {
        let flags = self.flags.entry(tab).or_default();
        flags.bookmarked = !flags.bookmarked;
    }

    /// A new response starts with fresh per-tab feedback.
    pub fn reset_feedback(&mut self) {
        self.flags.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CodeIssue, DocumentSource, Level, Pool, Reference, Technology};
    use chrono::Utc;

    fn response() -> QueryResponse {
        QueryResponse {
            query: "How do I sort?".to_string(),
            official_solution: Some(SolutionResult {
                source_type: Pool::Official,
                answer: "Use `sorted()`.".to_string(),
                code_changes: Some("items = sorted(items)".to_string()),
                references: vec![Reference {
                    source: DocumentSource {
                        title: "Sorting HOW TO".to_string(),
                        description: Some("Python docs".to_string()),
                        url: Some("https://docs.python.org/3/howto/sorting.html".to_string()),
                        source_type: Pool::Official,
                    },
                    score: 0.9,
                    excerpt: None,
                }],
                confidence_score: 0.9,
            }),
            community_solution: None,
            code_analysis: Some(CodeAnalysis {
                issues: vec![CodeIssue {
                    description: "Syntax error: unclosed '('".to_string(),
                    severity: Level::High,
                    line_number: Some(2),
                }],
                suggestions: vec![],
                dependencies: vec!["os".to_string()],
                complexity_score: 1.5,
                analysis_details: None,
            }),
            technology: Technology::Python,
            execution_time: 1.2,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_render_is_idempotent() {
        let response = response();
        for tab in Tab::ALL {
            assert_eq!(render(&response, tab), render(&response, tab));
        }
    }

    #[test]
    fn test_absent_community_does_not_affect_official() {
        let response = response();
        assert_eq!(render(&response, Tab::Community), NO_COMMUNITY);

        let official = render(&response, Tab::Official);
        assert!(official.starts_with("Use `sorted()`."));
        assert!(official.contains("```python\nitems = sorted(items)\n```"));
        assert!(official.contains("1. [Sorting HOW TO](https://docs.python.org/3/howto/sorting.html) - Python docs"));
    }

    #[test]
    fn test_empty_states_differ_from_loading() {
        let mut response = response();
        response.official_solution = None;
        response.code_analysis = None;
        assert_eq!(render(&response, Tab::Official), NO_OFFICIAL);
        assert_eq!(render(&response, Tab::Analysis), NO_ANALYSIS);

        let state = PresenterState::new();
        assert_eq!(state.view(Some(&response), true).as_deref(), Some(LOADING));
        assert_eq!(state.view(Some(&response), false).as_deref(), Some(NO_OFFICIAL));
        assert_eq!(state.view(None, false), None);
    }

    #[test]
    fn test_render_analysis() {
        let text = render(&response(), Tab::Analysis);
        assert!(text.starts_with("**Complexity:** 1.5/10"));
        assert!(text.contains("- **HIGH** (line 2): Syntax error: unclosed '('"));
        assert!(text.contains("### Dependencies\n\nos"));
    }

    #[test]
    fn test_only_one_overlay() {
        let mut state = PresenterState::new();
        state.toggle_overlay(Overlay::Help);
        state.toggle_overlay(Overlay::MobileMenu);
        assert_eq!(state.overlay(), Overlay::MobileMenu);
        state.toggle_overlay(Overlay::MobileMenu);
        assert_eq!(state.overlay(), Overlay::None);
    }

    #[test]
    fn test_feedback_flags_are_per_tab() {
        let mut state = PresenterState::new();
        state.vote(Tab::Official, Vote::Up);
        state.toggle_bookmark(Tab::Community);
        state.set_copied(Tab::Official, true);

        assert_eq!(state.flags(Tab::Official).vote, Some(Vote::Up));
        assert!(state.flags(Tab::Official).copied);
        assert!(!state.flags(Tab::Official).bookmarked);
        assert!(state.flags(Tab::Community).bookmarked);

        state.vote(Tab::Official, Vote::Up);
        assert_eq!(state.flags(Tab::Official).vote, None);

        state.select_tab(Tab::Analysis);
        assert_eq!(state.active_tab(), Tab::Analysis);
        state.reset_feedback();
        assert_eq!(state.flags(Tab::Community), TabFlags::default());
    }

    #[test]
    fn test_copy_text_prefers_code() {
        let response = response();
        assert_eq!(copy_text(&response, Tab::Official).as_deref(), Some("items = sorted(items)"));
        assert_eq!(copy_text(&response, Tab::Community), None);
    }
}
