//! Statement classification and script splitting used by `run` and `shell`.

/// Leading keywords that mark a statement as returning rows.
const READ_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "PRAGMA", "VALUES", "TABLE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Returns rows; routed to `execute_query`.
    Query,
    /// Returns an affected-row count; routed to `execute_command`.
    Command,
}

/// Classify a statement by its first keyword, ignoring leading comments and parentheses.
pub fn classify_statement(statement: &str) -> StatementKind {
    let stripped = strip_comments(statement);
    let head = stripped.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
    let keyword: String = head
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();

    if READ_KEYWORDS.contains(&keyword.as_str()) {
        StatementKind::Query
    } else {
        StatementKind::Command
    }
}

/// Split a script into statements on `;` outside quotes, with comments removed.
///
/// Empty statements are dropped and the terminating `;` is not included.
pub fn split_statements(script: &str) -> Vec<String> {
    let cleaned = strip_comments(script);
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in cleaned.chars() {
        match (quote, c) {
            (None, '\'' | '"') => {
                quote = Some(c);
                current.push(c);
            }
            (Some(q), _) if c == q => {
                quote = None;
                current.push(c);
            }
            (None, ';') => {
                push_statement(&mut statements, &current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// Remove `-- line` and `/* block */` comments that sit outside string literals.
pub fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

/// Collapse whitespace and cut a statement for one-line progress output.
pub fn truncate_statement(statement: &str, max_chars: usize) -> String {
    let flat = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", cut)
}
