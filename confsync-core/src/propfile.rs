use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Parses properties-format text into key/value pairs in file order.
/// Blank lines and `#`/`!` comment lines are skipped; the first unescaped
/// `=` or `:` separates key from value.
pub fn parse_properties(content: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            continue;
        }
        let Some((key, value)) = split_key_value(trimmed) else {
            continue;
        };
        entries.push((
            unescape(key.trim_end()),
            unescape(value.trim_start()),
        ));
    }
    entries
}

fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (index, byte) in line.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' => escaped = true,
            b'=' | b':' => return Some((&line[..index], &line[index + 1..])),
            _ => {}
        }
    }
    None
}

/// Line-preserving editor for a local properties file. Lines are indexed
/// on load; saving rewrites only the lines whose key is being replaced,
/// keeps every other line and its order, and appends unmatched entries
/// (after an optional comment block) at the end.
pub struct PropertyFile {
    path: PathBuf,
    lines: Vec<String>,
    key_lines: HashMap<String, usize>,
}

impl PropertyFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut lines = Vec::new();
        let mut key_lines = HashMap::new();
        for (index, line) in content.lines().enumerate() {
            lines.push(line.to_owned());
            if line.trim_start().starts_with('#') {
                continue;
            }
            if let Some(eq) = line.find('=') {
                if eq > 0 {
                    key_lines.insert(line[..eq].to_owned(), index);
                }
            }
        }
        Ok(Self {
            path: path.to_owned(),
            lines,
            key_lines,
        })
    }

    pub fn save(&mut self, entries: &BTreeMap<String, String>, comment: Option<&str>) -> Result<()> {
        let mut remaining = entries.clone();
        for (key, index) in &self.key_lines {
            if let Some(value) = remaining.remove(key) {
                self.lines[*index] = format_entry(key, &value);
            }
        }

        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        if let Some(comment) = comment {
            for comment_line in comment.lines() {
                out.push('#');
                out.push_str(comment_line);
                out.push('\n');
            }
        }
        for (key, value) in &remaining {
            out.push_str(&format_entry(key, value));
            out.push('\n');
        }

        std::fs::write(&self.path, out)?;
        Ok(())
    }
}

fn format_entry(key: &str, value: &str) -> String {
    // Keys escape every space; values only a leading one.
    format!("{}={}", escape(key, true), escape(value, false))
}

fn escape(text: &str, escape_all_spaces: bool) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for (index, unit) in text.encode_utf16().enumerate() {
        match unit {
            0x5c => out.push_str("\\\\"),
            0x20 => {
                if index == 0 || escape_all_spaces {
                    out.push('\\');
                }
                out.push(' ');
            }
            0x09 => out.push_str("\\t"),
            0x0a => out.push_str("\\n"),
            0x0d => out.push_str("\\r"),
            0x0c => out.push_str("\\f"),
            0x3d | 0x3a | 0x23 | 0x21 => {
                out.push('\\');
                out.push(unit as u8 as char);
            }
            0x20..=0x7e => out.push(unit as u8 as char),
            _ => out.push_str(&format!("\\u{unit:04X}")),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut units: Vec<u16> = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    let mut buf = [0u16; 2];
    while let Some(c) = chars.next() {
        if c != '\\' {
            units.extend_from_slice(c.encode_utf16(&mut buf));
            continue;
        }
        match chars.next() {
            Some('t') => units.push(0x09),
            Some('n') => units.push(0x0a),
            Some('r') => units.push(0x0d),
            Some('f') => units.push(0x0c),
            Some('u') => {
                let mut value: u16 = 0;
                let mut valid = true;
                for _ in 0..4 {
                    match chars.next().and_then(|h| h.to_digit(16)) {
                        Some(digit) => value = (value << 4) | digit as u16,
                        None => {
                            valid = false;
                            break;
                        }
                    }
                }
                if valid {
                    units.push(value);
                }
            }
            Some(other) => units.extend_from_slice(other.encode_utf16(&mut buf)),
            None => units.push(u16::from(b'\\')),
        }
    }
    String::from_utf16_lossy(&units)
}
