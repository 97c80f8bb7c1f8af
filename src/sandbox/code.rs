//! Units of untrusted code handed to the sandbox.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Languages the sandbox knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    Shell,
}

impl Language {
    /// Maps a markdown fence tag (```` ```py ````) to a language.
    pub fn from_fence_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Some(Language::Python),
            "sh" | "bash" | "shell" => Some(Language::Shell),
            _ => None,
        }
    }

    /// Script file name used inside the scratch directory.
    pub fn script_name(&self) -> &'static str {
        match self {
            Language::Python => "script.py",
            Language::Shell => "script.sh",
        }
    }

    /// Interpreter command for the script.
    pub fn interpreter(&self) -> &'static str {
        match self {
            Language::Python => "python3",
            Language::Shell => "sh",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::Python => f.write_str("python"),
            Language::Shell => f.write_str("shell"),
        }
    }
}

/// A single piece of code to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub language: Language,
    pub source: String,
}

impl CodeUnit {
    pub fn new(language: Language, source: impl Into<String>) -> Self {
        Self {
            language,
            source: source.into(),
        }
    }

    /// Extracts the first fenced code block from an LLM reply.
    ///
    /// Text right after the opening fence is a language tag only if it looks
    /// like one; otherwise it is the first line of code. A reply without
    /// fences is taken as code only if it is non-empty and `fallback` is used
    /// for its language.
    pub fn from_reply(reply: &str, fallback: Language) -> Option<Self> {
        if let Some(start) = reply.find("```") {
            let after = &reply[start + 3..];
            let (tag, body) = match after.split_once('\n') {
                Some((head, rest)) if is_fence_tag(head) => (head, rest),
                _ => ("", after),
            };
            let end = body.find("```").unwrap_or(body.len());
            let source = body[..end].trim_end();
            if source.trim().is_empty() {
                return None;
            }
            let language = Language::from_fence_tag(tag).unwrap_or(fallback);
            return Some(Self::new(language, format!("{}\n", source)));
        }

        let trimmed = reply.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self::new(fallback, format!("{}\n", trimmed)))
        }
    }
}

fn is_fence_tag(text: &str) -> bool {
    text.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_tags_map_to_languages() {
        assert_eq!(Language::from_fence_tag("py"), Some(Language::Python));
        assert_eq!(Language::from_fence_tag("Python"), Some(Language::Python));
        assert_eq!(Language::from_fence_tag("bash"), Some(Language::Shell));
        assert_eq!(Language::from_fence_tag("rust"), None);
    }

    #[test]
    fn from_reply_takes_first_fenced_block() {
        let reply = "Here you go:\n```python\ndef add(a, b):\n    return a + b\n```\nand\n```sh\necho no\n```";
        let code = CodeUnit::from_reply(reply, Language::Shell).unwrap();

        assert_eq!(code.language, Language::Python);
        assert_eq!(code.source, "def add(a, b):\n    return a + b\n");
    }

    #[test]
    fn from_reply_uses_fallback_for_untagged_fence() {
        let reply = "```\necho hi\n```";
        let code = CodeUnit::from_reply(reply, Language::Shell).unwrap();
        assert_eq!(code.language, Language::Shell);
        assert_eq!(code.source, "echo hi\n");
    }

    #[test]
    fn from_reply_accepts_bare_code() {
        let code = CodeUnit::from_reply("  print('hi')  ", Language::Python).unwrap();
        assert_eq!(code.source, "print('hi')\n");
    }

    #[test]
    fn from_reply_rejects_empty_replies() {
        assert!(CodeUnit::from_reply("   ", Language::Python).is_none());
        assert!(CodeUnit::from_reply("```python\n\n```", Language::Python).is_none());
    }

    #[test]
    fn from_reply_reads_single_line_fences() {
        let code = CodeUnit::from_reply("```print(1 + 2)```", Language::Python).unwrap();
        assert_eq!(code.language, Language::Python);
        assert_eq!(code.source, "print(1 + 2)\n");

        let code = CodeUnit::from_reply("```echo a\necho b\n```", Language::Shell).unwrap();
        assert_eq!(code.source, "echo a\necho b\n");
    }
}
