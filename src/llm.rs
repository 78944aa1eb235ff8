//! The LLM interface this crate consumes: a synchronous trait plus a
//! duck-typed response parser. Only the trait and the parser are this
//! crate's job — the HTTP transport for a real provider lives elsewhere.

use crate::error::{FuzzError, Result};
use crate::seed::{Seed, TestCase};

/// Everything the fuzzing engine needs from a language model, kept
/// synchronous so callers can apply a simple wall-clock timeout the same
/// way they do for subprocesses.
pub trait LlmClient {
    /// Produces free-text, used both for the one-shot "understanding" prior
    /// and for oracle classification prompts.
    fn ask(&self, prompt: &str) -> Result<String>;

    /// Builds a one-time textual prior about an (ISA, strategy) pair.
    fn understand(&self, prompt: &str) -> Result<String> {
        self.ask(prompt)
    }

    /// Synthesizes a brand-new seed (depth 0, parent 0) from the
    /// understanding text and a free-form prompt.
    fn generate(&self, understanding: &str, prompt: &str) -> Result<Seed> {
        let prompt = format!("{understanding}\n\n{prompt}");
        let response = self.ask(&prompt)?;
        parse_seed_response(&response, 0, 0)
    }

    /// Produces a child seed derived from `parent`, optionally conditioned
    /// on a prior divergence explanation (CFG-guided retries).
    fn mutate(&self, understanding: &str, parent: &Seed, divergence: Option<&str>) -> Result<Seed> {
        let mut prompt = format!(
            "{understanding}\n\nMutate this seed to reach new coverage:\n{}\n",
            parent.content
        );
        if let Some(d) = divergence {
            prompt.push_str(&format!("Previous attempt diverged: {d}\n"));
        }
        let response = self.ask(&prompt)?;
        parse_seed_response(&response, parent.id, parent.depth + 1)
    }
}

/// Extracts a fenced C-source block and zero-or-more `{command, expected}`
/// test-case records from free-form LLM output.
///
/// Tolerates surrounding prose: the scan is greedy for the first fenced
/// block (` ``` ` or ` ```c `) and then looks, anywhere after it, for lines
/// of the form `COMMAND: <template> EXPECT: <substring>`. A response with no
/// fenced block at all is malformed.
pub fn parse_seed_response(response: &str, parent_id: u64, depth: u32) -> Result<Seed> {
    let content = extract_fenced_block(response)
        .ok_or_else(|| FuzzError::LlmResponseMalformed("no fenced source block found".to_string()))?;
    let test_cases = extract_test_cases(response);
    Ok(Seed::new(content, test_cases, parent_id, depth))
}

fn extract_fenced_block(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after_open = &text[start + 3..];
    let first_newline = after_open.find('\n').unwrap_or(0);
    let body_start = first_newline + 1;
    let body = &after_open[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim_end().to_string())
}

/// Matches `COMMAND: <template> EXPECT: <substring>` lines anywhere in the
/// text, in order, tolerant of extra whitespace.
fn extract_test_cases(text: &str) -> Vec<TestCase> {
    let mut cases = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("COMMAND:") else {
            continue;
        };
        let Some((command, expect)) = rest.split_once("EXPECT:") else {
            continue;
        };
        cases.push(TestCase {
            command_template: command.trim().to_string(),
            expected_stdout_substring: expect.trim().to_string(),
        });
    }
    cases
}

/// A deterministic, in-memory stand-in for a networked provider: used by
/// the `generate` command's offline seed templates and by tests. Returns
/// canned responses keyed by a substring of the prompt, falling back to a
/// fixed trivial program.
pub struct StubLlmClient {
    pub responses: Vec<(String, String)>,
    pub default_response: String,
}

impl StubLlmClient {
    pub fn new() -> Self {
        StubLlmClient {
            responses: Vec::new(),
            default_response: "```c\nint main(void) { return 0; }\n```\n\
                 COMMAND: ./a.out EXPECT: \n"
                .to_string(),
        }
    }

    pub fn with_response(mut self, matches_substring: &str, response: &str) -> Self {
        self.responses
            .push((matches_substring.to_string(), response.to_string()));
        self
    }
}

impl Default for StubLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmClient for StubLlmClient {
    fn ask(&self, prompt: &str) -> Result<String> {
        for (needle, response) in &self.responses {
            if prompt.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self.default_response.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_c_block_ignoring_language_tag() {
        let text = "here you go\n```c\nint main() {}\n```\nhope it helps";
        assert_eq!(extract_fenced_block(text).unwrap(), "int main() {}");
    }

    #[test]
    fn extracts_test_cases_tolerating_prose() {
        let text = "```c\nint main(){}\n```\n\
            Some notes.\n\
            COMMAND: ./a.out --x EXPECT: ok\n\
            more prose\n\
            COMMAND: ./a.out --y EXPECT: done\n";
        let cases = extract_test_cases(text);
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].command_template, "./a.out --x");
        assert_eq!(cases[0].expected_stdout_substring, "ok");
    }

    #[test]
    fn malformed_response_with_no_fence_is_an_error() {
        let result = parse_seed_response("no code here, sorry", 0, 0);
        assert!(result.is_err());
    }

    #[test]
    fn stub_client_returns_default_when_nothing_matches() {
        let client = StubLlmClient::new();
        let response = client.ask("anything").unwrap();
        assert!(response.contains("int main"));
    }

    #[test]
    fn stub_client_matches_by_substring() {
        let client = StubLlmClient::new().with_response("uncovered block 7", "```c\nvoid f(){}\n```\n");
        let response = client.ask("reach uncovered block 7 please").unwrap();
        assert!(response.contains("void f"));
    }

    #[test]
    fn generate_builds_a_root_seed() {
        let client = StubLlmClient::new();
        let seed = client.generate("understanding text", "make something").unwrap();
        assert_eq!(seed.parent_id, 0);
        assert_eq!(seed.depth, 0);
        assert!(seed.content.contains("int main"));
    }

    #[test]
    fn mutate_builds_a_child_seed_with_incremented_depth() {
        let client = StubLlmClient::new();
        let mut parent = Seed::new("int main(){}".to_string(), vec![], 0, 2);
        parent.id = 5;
        let child = client.mutate("understanding", &parent, Some("missed branch")).unwrap();
        assert_eq!(child.parent_id, 5);
        assert_eq!(child.depth, 3);
    }
}
