//! Extracts a summary and per-parameter descriptions from a docstring.
//!
//! Three layouts are understood:
//!
//! ```text
//! Google            NumPy               Sphinx
//! Args:             Parameters          :param city: ...
//!     city: ...     ----------
//!                   city : str
//!                       ...
//! ```
//!
//! [`parse_docstring`] tries all three and keeps whichever yields the most
//! parameters.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocstringStyle {
    Google,
    Numpy,
    Sphinx,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedDocstring {
    pub description: Option<String>,
    pub params: BTreeMap<String, String>,
    /// `None` when no parameter section was found.
    pub style: Option<DocstringStyle>,
}

static GOOGLE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(Args|Arguments|Parameters|Params):\s*$").expect("valid regex")
});
static GOOGLE_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\*{0,2}(\w+)\s*(?:\([^)]*\))?\s*:\s*(.*)$").expect("valid regex")
});
static NUMPY_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)\s*(?::.*)?$").expect("valid regex"));
static SPHINX_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^:param\s+(?:[^:]*\s)?(\w+)\s*:\s*(.*)$").expect("valid regex")
});

pub fn parse_docstring(doc: &str) -> ParsedDocstring {
    let candidates = [
        parse_with_style(doc, DocstringStyle::Google),
        parse_with_style(doc, DocstringStyle::Numpy),
        parse_with_style(doc, DocstringStyle::Sphinx),
    ];

    let mut best: Option<ParsedDocstring> = None;
    for candidate in candidates {
        let better = match &best {
            None => true,
            Some(current) => candidate.params.len() > current.params.len(),
        };
        if better {
            best = Some(candidate);
        }
    }

    match best {
        Some(parsed) if !parsed.params.is_empty() => parsed,
        _ => ParsedDocstring {
            description: leading_description(&lines(doc), usize::MAX),
            params: BTreeMap::new(),
            style: None,
        },
    }
}

pub fn parse_with_style(doc: &str, style: DocstringStyle) -> ParsedDocstring {
    let lines = lines(doc);
    let (section_start, params) = match style {
        DocstringStyle::Google => parse_google(&lines),
        DocstringStyle::Numpy => parse_numpy(&lines),
        DocstringStyle::Sphinx => parse_sphinx(&lines),
    };

    ParsedDocstring {
        description: leading_description(&lines, section_start.unwrap_or(usize::MAX)),
        style: (!params.is_empty()).then_some(style),
        params,
    }
}

fn lines(doc: &str) -> Vec<&str> {
    doc.lines().map(str::trim_end).collect()
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn leading_description(lines: &[&str], end: usize) -> Option<String> {
    let text = lines
        .iter()
        .take(end)
        .map(|line| line.trim())
        .collect::<Vec<_>>()
        .join("\n");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn push_continuation(params: &mut BTreeMap<String, String>, name: &str, text: &str) {
    if let Some(existing) = params.get_mut(name) {
        if existing.is_empty() {
            existing.push_str(text);
        } else {
            existing.push(' ');
            existing.push_str(text);
        }
    }
}

fn parse_google(lines: &[&str]) -> (Option<usize>, BTreeMap<String, String>) {
    let mut params = BTreeMap::new();
    let Some(start) = lines
        .iter()
        .position(|line| GOOGLE_HEADER.is_match(line.trim()))
    else {
        return (None, params);
    };

    let header_indent = indent_of(lines[start]);
    let mut entry_indent = None;
    let mut current: Option<String> = None;

    for line in &lines[start + 1..] {
        if line.trim().is_empty() {
            continue;
        }
        let indent = indent_of(line);
        if indent <= header_indent {
            break;
        }
        let entry_indent = *entry_indent.get_or_insert(indent);
        let text = line.trim();

        if indent == entry_indent {
            if let Some(caps) = GOOGLE_ENTRY.captures(text) {
                let name = caps[1].to_string();
                params.insert(name.clone(), caps[2].trim().to_string());
                current = Some(name);
            }
        } else if let Some(name) = &current {
            push_continuation(&mut params, name, text);
        }
    }

    (Some(start), params)
}

fn parse_numpy(lines: &[&str]) -> (Option<usize>, BTreeMap<String, String>) {
    let mut params = BTreeMap::new();
    let is_underline =
        |line: &str| line.trim().len() >= 3 && line.trim().chars().all(|c| c == '-');

    let Some(start) = (0..lines.len().saturating_sub(1)).find(|&idx| {
        matches!(lines[idx].trim(), "Parameters" | "Params" | "Arguments")
            && is_underline(lines[idx + 1])
    }) else {
        return (None, params);
    };

    let section_indent = indent_of(lines[start]);
    let mut current: Option<String> = None;
    let mut idx = start + 2;

    while idx < lines.len() {
        let line = lines[idx];
        if line.trim().is_empty() {
            idx += 1;
            continue;
        }
        if lines.get(idx + 1).is_some_and(|next| is_underline(next)) {
            break;
        }

        let indent = indent_of(line);
        let text = line.trim();
        if indent <= section_indent {
            match NUMPY_ENTRY.captures(text) {
                Some(caps) => {
                    let name = caps[1].to_string();
                    params.insert(name.clone(), String::new());
                    current = Some(name);
                }
                None => break,
            }
        } else if let Some(name) = &current {
            push_continuation(&mut params, name, text);
        }
        idx += 1;
    }

    (Some(start), params)
}

fn parse_sphinx(lines: &[&str]) -> (Option<usize>, BTreeMap<String, String>) {
    let mut params = BTreeMap::new();
    let mut section_start = None;
    let mut current: Option<String> = None;

    for (idx, line) in lines.iter().enumerate() {
        let text = line.trim();
        if text.starts_with(':') {
            section_start.get_or_insert(idx);
            current = None;
            if let Some(caps) = SPHINX_PARAM.captures(text) {
                let name = caps[1].to_string();
                params.insert(name.clone(), caps[2].trim().to_string());
                current = Some(name);
            }
        } else if text.is_empty() {
            current = None;
        } else if let Some(name) = &current {
            push_continuation(&mut params, name, text);
        }
    }

    (section_start, params)
}
