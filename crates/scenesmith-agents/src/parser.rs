use scenesmith_types::Role;

use crate::error::{AgentError, Result};

/// What a stage's raw completion text is reduced to before it goes back over
/// the bus as a `StageResponse`.
#[derive(Debug, Clone, Default)]
pub struct ParsedResponse {
    pub script: Option<String>,
    pub notes: String,
    /// Structured hints merged into Shared Context, e.g. a Reviewer's
    /// `rating`/`should_refine` (spec.md §3's AgentResult.hints).
    pub hints: serde_json::Value,
}

/// Scrapes `rating: N` and `should_refine: true|false` tokens out of free
/// text notes. This is the one place a Reviewer's verdict becomes
/// structured data; every other role's hints default to an empty object.
fn scrape_hints(notes: &str) -> serde_json::Value {
    let mut hints = serde_json::Map::new();
    let lower = notes.to_ascii_lowercase();
    if let Some(pos) = lower.find("rating") {
        let tail = &notes[pos..];
        if let Some(colon) = tail.find(':') {
            let digits: String = tail[colon + 1..]
                .chars()
                .skip_while(|c| c.is_whitespace())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(rating) = digits.parse::<i64>() {
                hints.insert("rating".into(), serde_json::Value::from(rating));
            }
        }
    }
    if lower.contains("should_refine: true") || lower.contains("should_refine:true") {
        hints.insert("should_refine".into(), serde_json::Value::Bool(true));
    } else if lower.contains("should_refine: false") || lower.contains("should_refine:false") {
        hints.insert("should_refine".into(), serde_json::Value::Bool(false));
    }
    serde_json::Value::Object(hints)
}

/// Extracts a usable script (and human-readable notes) from an LLM's raw
/// completion text. A role-specific prompt format is the provider's concern,
/// not this trait's; `ResponseParser` only has to agree with whatever
/// `CompletionClient` implementation is wired in for the same deployment.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, role: Role, raw: &str) -> Result<ParsedResponse>;
}

/// Looks for a fenced ```python ... ``` block and treats everything outside
/// it as notes. Works for any role; stages that never emit a script (e.g.
/// Reviewer) simply produce a `ParsedResponse` with `script: None`.
#[derive(Debug, Default)]
pub struct FencedCodeBlockParser;

impl ResponseParser for FencedCodeBlockParser {
    fn parse(&self, _role: Role, raw: &str) -> Result<ParsedResponse> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AgentError::Parse("completion text was empty".into()));
        }

        let fence_start = trimmed.find("```python").or_else(|| trimmed.find("```"));
        let Some(start) = fence_start else {
            let hints = scrape_hints(trimmed);
            return Ok(ParsedResponse { script: None, notes: trimmed.to_string(), hints });
        };

        let after_fence = &trimmed[start..];
        let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
        let body = &after_fence[body_start..];
        let Some(end) = body.find("```") else {
            return Err(AgentError::Parse("unterminated code fence in completion".into()));
        };

        let script = body[..end].to_string();
        let mut notes = String::new();
        notes.push_str(trimmed[..start].trim());
        let remainder = body[end + 3..].trim();
        if !remainder.is_empty() {
            if !notes.is_empty() {
                notes.push('\n');
            }
            notes.push_str(remainder);
        }

        let hints = scrape_hints(&notes);
        Ok(ParsedResponse { script: Some(script), notes, hints })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_script_and_surrounding_notes() {
        let raw = "Built a cube.\n```python\nimport bpy\nbpy.ops.mesh.primitive_cube_add()\n```\nLooks good.";
        let parsed = FencedCodeBlockParser.parse(Role::Builder, raw).unwrap();
        assert_eq!(parsed.script.unwrap(), "import bpy\nbpy.ops.mesh.primitive_cube_add()\n");
        assert_eq!(parsed.notes, "Built a cube.\nLooks good.");
    }

    #[test]
    fn text_with_no_fence_becomes_notes_with_no_script() {
        let parsed = FencedCodeBlockParser.parse(Role::Reviewer, "rating: 8, looks complete").unwrap();
        assert!(parsed.script.is_none());
        assert_eq!(parsed.notes, "rating: 8, looks complete");
    }

    #[test]
    fn empty_completion_is_a_parse_error() {
        let err = FencedCodeBlockParser.parse(Role::Builder, "   ").unwrap_err();
        assert!(matches!(err, AgentError::Parse(_)));
    }

    #[test]
    fn unterminated_fence_is_a_parse_error() {
        let err = FencedCodeBlockParser.parse(Role::Builder, "```python\nimport bpy\n").unwrap_err();
        assert!(matches!(err, AgentError::Parse(_)));
    }

    #[test]
    fn reviewer_verdict_is_scraped_into_structured_hints() {
        let parsed = FencedCodeBlockParser
            .parse(Role::Reviewer, "rating: 5, should_refine: true, needs more lighting")
            .unwrap();
        assert_eq!(parsed.hints["rating"], 5);
        assert_eq!(parsed.hints["should_refine"], true);
    }
}
