use anyhow::{bail, Result};

/// One `key = value` pair. The value is kept as raw trimmed source text;
/// interpretation happens at extraction time.
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub key: String,
    pub value: String,
}

/// A block: `name "label" { ... }` with nested attributes and blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Block {
    pub name: String,
    pub labels: Vec<String>,
    pub attrs: Vec<Attr>,
    pub blocks: Vec<Block>,
}

impl Block {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    pub fn blocks_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Block> {
        self.blocks.iter().filter(move |b| b.name == name)
    }

    pub fn first_block(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }
}

/// Scan a configuration file body into its block tree.
///
/// This is deliberately not a full HCL parser: expressions are captured
/// as raw text and only the shapes the discovery pipeline needs (string
/// literals, booleans, string lists, a couple of well-known function
/// calls) are interpreted downstream.
pub fn scan(source: &str) -> Result<Block> {
    let mut scanner = Scanner {
        chars: source.chars().collect(),
        pos: 0,
    };
    let mut root = Block::default();
    scanner.parse_body(&mut root, true)?;
    Ok(root)
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
}

impl Scanner {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.pos += 1;
                }
                Some('#') => self.skip_line(),
                Some('/') if self.peek_at(1) == Some('/') => self.skip_line(),
                Some('/') if self.peek_at(1) == Some('*') => {
                    self.pos += 2;
                    while self.pos < self.chars.len() {
                        if self.peek() == Some('*') && self.peek_at(1) == Some('/') {
                            self.pos += 2;
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == '\n' {
                break;
            }
        }
    }

    fn parse_body(&mut self, block: &mut Block, top_level: bool) -> Result<()> {
        loop {
            self.skip_trivia();
            match self.peek() {
                None => {
                    if !top_level {
                        bail!("unexpected end of file inside block `{}`", block.name);
                    }
                    return Ok(());
                }
                Some('}') => {
                    if top_level {
                        bail!("unbalanced `}}` at top level");
                    }
                    self.pos += 1;
                    return Ok(());
                }
                Some(c) if c.is_alphabetic() || c == '_' => {
                    self.parse_statement(block)?;
                }
                Some(c) => bail!("unexpected character `{c}`"),
            }
        }
    }

    fn parse_statement(&mut self, parent: &mut Block) -> Result<()> {
        let name = self.read_identifier();
        self.skip_trivia();

        let mut labels = Vec::new();
        while self.peek() == Some('"') {
            labels.push(self.read_quoted()?);
            self.skip_trivia();
        }

        match self.peek() {
            Some('{') => {
                self.pos += 1;
                let mut child = Block {
                    name,
                    labels,
                    ..Block::default()
                };
                self.parse_body(&mut child, false)?;
                parent.blocks.push(child);
                Ok(())
            }
            Some('=') if labels.is_empty() => {
                self.pos += 1;
                let value = self.read_value()?;
                parent.attrs.push(Attr {
                    key: name,
                    value: value.trim().to_string(),
                });
                Ok(())
            }
            _ => bail!("expected `{{` or `=` after `{name}`"),
        }
    }

    fn read_identifier(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn read_quoted(&mut self) -> Result<String> {
        debug_assert_eq!(self.peek(), Some('"'));
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.bump() {
                None => bail!("unterminated string literal"),
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => bail!("unterminated escape in string literal"),
                },
                Some(c) => out.push(c),
            }
        }
    }

    /// Capture an attribute value as raw text: a balanced `[...]` or
    /// `{...}`, a quoted string (with any trailing same-line text, to
    /// keep interpolations intact), or the remainder of the line.
    fn read_value(&mut self) -> Result<String> {
        self.skip_trivia();
        let start = self.pos;
        match self.peek() {
            Some('[') => self.consume_balanced('[', ']')?,
            Some('{') => self.consume_balanced('{', '}')?,
            Some('"') => {
                self.read_quoted()?;
                self.consume_to_eol();
            }
            _ => self.consume_to_eol(),
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn consume_to_eol(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            if c == '#' || (c == '/' && self.peek_at(1) == Some('/')) {
                break;
            }
            self.pos += 1;
        }
    }

    fn consume_balanced(&mut self, open: char, close: char) -> Result<()> {
        let mut depth = 0usize;
        loop {
            match self.peek() {
                None => bail!("unbalanced `{open}`"),
                Some('"') => {
                    self.read_quoted()?;
                }
                Some('#') => self.skip_line(),
                Some(c) => {
                    self.pos += 1;
                    if c == open {
                        depth += 1;
                    } else if c == close {
                        depth -= 1;
                        if depth == 0 {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Interpret raw value text as a string literal.
pub fn as_string(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('"') {
        return None;
    }
    let mut scanner = Scanner {
        chars: trimmed.chars().collect(),
        pos: 0,
    };
    let value = scanner.read_quoted().ok()?;
    // Reject values with trailing content, e.g. interpolations.
    scanner.skip_trivia();
    scanner.peek().is_none().then_some(value)
}

/// Interpret raw value text as a boolean literal.
pub fn as_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

/// Interpret raw value text as a list of string literals, tolerating
/// newlines and trailing commas. Non-literal elements are skipped.
pub fn as_string_list(raw: &str) -> Option<Vec<String>> {
    let trimmed = raw.trim();
    let inner = trimmed.strip_prefix('[')?.strip_suffix(']')?;
    let mut scanner = Scanner {
        chars: inner.chars().collect(),
        pos: 0,
    };
    let mut out = Vec::new();
    loop {
        scanner.skip_trivia();
        match scanner.peek() {
            None => return Some(out),
            Some('"') => {
                if let Ok(value) = scanner.read_quoted() {
                    out.push(value);
                }
            }
            Some(',') => {
                scanner.pos += 1;
            }
            Some(_) => {
                // Skip a non-literal element up to the next comma.
                while let Some(c) = scanner.peek() {
                    if c == ',' {
                        break;
                    }
                    scanner.pos += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_blocks_and_attrs() {
        let root = scan(r#"
# provision the network
terraform {
  source = "git::github.com/acme/vpc?ref=v1.2.0"
}

dependency "vpc" {
  config_path = "../vpc"
}

inputs = {
  cidr = "10.0.0.0/16"
}
"#)
        .unwrap();

        assert_eq!(root.blocks.len(), 2);
        let terraform = root.first_block("terraform").unwrap();
        assert_eq!(
            as_string(terraform.attr("source").unwrap()).as_deref(),
            Some("git::github.com/acme/vpc?ref=v1.2.0")
        );

        let dependency = root.first_block("dependency").unwrap();
        assert_eq!(dependency.labels, vec!["vpc"]);
        assert_eq!(
            as_string(dependency.attr("config_path").unwrap()).as_deref(),
            Some("../vpc")
        );

        assert!(root.attr("inputs").unwrap().starts_with('{'));
    }

    #[test]
    fn test_scan_multiline_list() {
        let root = scan(r#"
dependencies {
  paths = [
    "../db",
    "../vpc", # network
  ]
}
"#)
        .unwrap();
        let deps = root.first_block("dependencies").unwrap();
        assert_eq!(
            as_string_list(deps.attr("paths").unwrap()).unwrap(),
            vec!["../db", "../vpc"]
        );
    }

    #[test]
    fn test_scan_nested_blocks() {
        let root = scan(r#"
errors {
  retry "transient" {
    retryable_errors = [".*timeout.*"]
    max_attempts = 3
  }
}
"#)
        .unwrap();
        let errors = root.first_block("errors").unwrap();
        let retry = errors.first_block("retry").unwrap();
        assert_eq!(retry.labels, vec!["transient"]);
        assert_eq!(retry.attr("max_attempts"), Some("3"));
    }

    #[test]
    fn test_scan_comments_do_not_leak() {
        let root = scan(r#"
// leading comment
terraform {
  /* block
     comment */
  source = "./modules/app" # trailing
}
"#)
        .unwrap();
        let terraform = root.first_block("terraform").unwrap();
        assert_eq!(
            as_string(terraform.attr("source").unwrap()).as_deref(),
            Some("./modules/app")
        );
    }

    #[test]
    fn test_scan_unbalanced_block_errors() {
        assert!(scan("terraform {").is_err());
        assert!(scan("}").is_err());
    }

    #[test]
    fn test_as_string_rejects_interpolation_remainder() {
        assert_eq!(as_string(r#""plain""#).as_deref(), Some("plain"));
        assert_eq!(as_string(r#""${local.x}/y""#).as_deref(), Some("${local.x}/y"));
        assert!(as_string(r#""a" + "b""#).is_none());
        assert!(as_string("local.path").is_none());
    }

    #[test]
    fn test_as_bool() {
        assert_eq!(as_bool(" true "), Some(true));
        assert_eq!(as_bool("false"), Some(false));
        assert_eq!(as_bool("local.flag"), None);
    }

    #[test]
    fn test_string_list_skips_expressions() {
        assert_eq!(
            as_string_list(r#"["a", local.b, "c"]"#).unwrap(),
            vec!["a", "c"]
        );
    }
}
