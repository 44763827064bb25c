//! Line-by-line parsing of a streamed changes feed.
//!
//! A normal (non-continuous) changes response is one JSON object, but the
//! server writes one change per line:
//!
//! ```text
//! {"results":[
//! {"seq":"1-g1","id":"a","changes":[{"rev":"1-x"}]},
//! {"seq":"2-g1","id":"b","changes":[{"rev":"3-y"}],"deleted":true}
//! ],
//! "last_seq":"2-g1","pending":0}
//! ```
//!
//! Reading it line by line keeps memory flat for multi-million entry pages.

use serde_json::Value;

use super::types::{seq_token, DocStub};

/// Splits a byte stream into lines, carrying partial lines across chunks.
#[derive(Debug, Default)]
pub struct LineSplitter {
    remainder: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every line completed by `chunk`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.remainder.extend_from_slice(chunk);
        let Some(last_newline) = self.remainder.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.remainder.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.remainder, rest);
        complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    /// Returns the unterminated last line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.remainder.is_empty() {
            None
        } else {
            let line = std::mem::take(&mut self.remainder);
            Some(String::from_utf8_lossy(&line).into_owned())
        }
    }
}

/// One change entry of the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEntry {
    pub id: String,
    pub seq: Option<String>,
    /// Last revision listed in `changes[]`
    pub rev: Option<String>,
    pub deleted: bool,
}

impl ChangeEntry {
    /// The stub to fetch; deleted documents have none.
    pub fn stub(&self) -> Option<DocStub> {
        if self.deleted {
            return None;
        }
        self.rev.as_ref().map(|rev| DocStub {
            id: self.id.clone(),
            rev: rev.clone(),
        })
    }
}

/// What a single line of the feed turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeLine {
    Change(ChangeEntry),
    /// Trailer carrying the checkpoint and/or the pending count
    Tail {
        last_seq: Option<String>,
        pending: Option<u64>,
    },
    /// Framing of the wrapping object (`{"results":[`, `],`) or a blank line
    Framing,
    /// Anything that does not parse
    Malformed,
}

/// Parses one line of a streamed changes response.
pub fn parse_change_line(line: &str) -> ChangeLine {
    let trimmed = line.trim();
    let trimmed = trimmed.strip_suffix(',').unwrap_or(trimmed);
    if trimmed.is_empty() || trimmed.starts_with(']') || trimmed.starts_with("{\"results\"") {
        return ChangeLine::Framing;
    }

    let parsed = if trimmed.starts_with("\"last_seq\":") {
        serde_json::from_str::<Value>(&format!("{{{}", trimmed))
    } else {
        serde_json::from_str::<Value>(trimmed)
    };
    let Ok(value) = parsed else {
        return ChangeLine::Malformed;
    };
    let Some(obj) = value.as_object() else {
        return ChangeLine::Malformed;
    };

    if let Some(changes) = obj.get("changes").and_then(Value::as_array) {
        let Some(id) = obj.get("id").and_then(Value::as_str) else {
            return ChangeLine::Malformed;
        };
        return ChangeLine::Change(ChangeEntry {
            id: id.to_string(),
            seq: obj.get("seq").and_then(seq_token),
            rev: changes
                .last()
                .and_then(|c| c.get("rev"))
                .and_then(Value::as_str)
                .map(str::to_string),
            deleted: obj.get("deleted").and_then(Value::as_bool).unwrap_or(false),
        });
    }

    if obj.contains_key("last_seq") || obj.contains_key("pending") {
        return ChangeLine::Tail {
            last_seq: obj.get("last_seq").and_then(seq_token),
            pending: obj.get("pending").and_then(Value::as_u64),
        };
    }

    ChangeLine::Framing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_carries_partial_lines() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"{\"a\":").is_empty());
        assert_eq!(splitter.push(b"1}\n{\"b\""), vec!["{\"a\":1}".to_string()]);
        assert_eq!(
            splitter.push(b":2}\n\n{\"c\":3}\n"),
            vec!["{\"b\":2}".to_string(), String::new(), "{\"c\":3}".to_string()]
        );
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_flushes_remainder() {
        let mut splitter = LineSplitter::new();
        assert_eq!(splitter.push(b"one\ntwo"), vec!["one".to_string()]);
        assert_eq!(splitter.finish(), Some("two".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_keeps_multibyte_chars_intact() {
        let mut splitter = LineSplitter::new();
        let text = "{\"name\":\"Zoë\"}\n".as_bytes();
        // Split inside the two-byte "ë"
        let cut = text.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(splitter.push(&text[..cut]).is_empty());
        assert_eq!(
            splitter.push(&text[cut..]),
            vec!["{\"name\":\"Zoë\"}".to_string()]
        );
    }

    #[test]
    fn test_parse_change_entry_uses_last_rev() {
        let line = r#"{"seq":"5-g1","id":"doc1","changes":[{"rev":"1-a"},{"rev":"2-b"}]},"#;
        let ChangeLine::Change(entry) = parse_change_line(line) else {
            panic!("expected a change");
        };
        assert_eq!(entry.id, "doc1");
        assert_eq!(entry.seq.as_deref(), Some("5-g1"));
        assert_eq!(
            entry.stub(),
            Some(DocStub {
                id: "doc1".to_string(),
                rev: "2-b".to_string()
            })
        );
    }

    #[test]
    fn test_deleted_entry_has_no_stub() {
        let line = r#"{"seq":6,"id":"gone","changes":[{"rev":"3-c"}],"deleted":true}"#;
        let ChangeLine::Change(entry) = parse_change_line(line) else {
            panic!("expected a change");
        };
        assert!(entry.deleted);
        assert_eq!(entry.seq.as_deref(), Some("6"));
        assert_eq!(entry.stub(), None);
    }

    #[test]
    fn test_parse_tail_line() {
        assert_eq!(
            parse_change_line(r#""last_seq":"9-g1","pending":12}"#),
            ChangeLine::Tail {
                last_seq: Some("9-g1".to_string()),
                pending: Some(12)
            }
        );
        assert_eq!(
            parse_change_line(r#"{"last_seq":9}"#),
            ChangeLine::Tail {
                last_seq: Some("9".to_string()),
                pending: None
            }
        );
    }

    #[test]
    fn test_framing_and_malformed_lines() {
        assert_eq!(parse_change_line("{\"results\":["), ChangeLine::Framing);
        assert_eq!(parse_change_line("],"), ChangeLine::Framing);
        assert_eq!(parse_change_line("   "), ChangeLine::Framing);
        assert_eq!(parse_change_line("{\"seq\":1,\"id\":"), ChangeLine::Malformed);
        assert_eq!(parse_change_line("[1,2]"), ChangeLine::Malformed);
    }

    #[test]
    fn test_same_entry_gives_same_stub() {
        let line = r#"{"seq":"1","id":"x","changes":[{"rev":"1-a"}]}"#;
        assert_eq!(parse_change_line(line), parse_change_line(line));
    }
}
