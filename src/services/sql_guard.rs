//! Conservative read-only gate over SQL text.
//!
//! This is deliberately not a SQL parser. A small tokeniser walks the text
//! tracking quote and comment state, and classification works on the first
//! keyword plus a handful of structural probes (top-level `INTO`, CTE
//! bodies, `EXPLAIN` options). Anything the probes cannot understand is
//! rejected.

const DML_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];

const BLOCKED_KEYWORDS: &[&str] = &[
    "CALL", "DO", "COPY", "TRUNCATE", "LOCK", "GRANT", "REVOKE", "PREPARE", "EXECUTE", "INSERT",
    "UPDATE", "DELETE", "CREATE", "DROP", "ALTER", "MERGE",
];

const EXPLAIN_OPTION_KEYWORDS: &[&str] = &[
    "ANALYZE", "VERBOSE", "COSTS", "SETTINGS", "BUFFERS", "WAL", "TIMING", "SUMMARY", "FORMAT",
    "TEXT", "JSON", "XML", "YAML", "TRUE", "FALSE", "ON", "OFF",
];

const WITH_REJECT_MESSAGE: &str = "WITH statements only allowed when every CTE is read-only and \
     the final statement is SELECT, TABLE, or VALUES";

#[derive(Debug, Clone, PartialEq)]
enum SqlToken {
    /// Bare word (keyword, identifier, or number) outside quotes/comments.
    Word { text: String, depth: i32, pos: usize },
    /// A double-quoted identifier. Its content never matches a keyword.
    Quoted { depth: i32, pos: usize },
    /// Any other single code character.
    Symbol { ch: char, depth: i32, pos: usize },
}

impl SqlToken {
    fn depth(&self) -> i32 {
        match self {
            SqlToken::Word { depth, .. }
            | SqlToken::Quoted { depth, .. }
            | SqlToken::Symbol { depth, .. } => *depth,
        }
    }

    fn pos(&self) -> usize {
        match self {
            SqlToken::Word { pos, .. }
            | SqlToken::Quoted { pos, .. }
            | SqlToken::Symbol { pos, .. } => *pos,
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Tokenise SQL into code tokens, skipping the contents of single-quoted
/// strings, double-quoted identifiers, dollar-quoted blocks, line comments
/// and (nested) block comments. Escaped quotes are `''` and `""`.
fn tokenize(sql: &str) -> Vec<SqlToken> {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let mut tokens = Vec::new();
    let mut depth: i32 = 0;
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|(_, c)| *c);

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && peek(i + 1) == Some('-') {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
        } else if c == '/' && peek(i + 1) == Some('*') {
            let mut level = 1;
            i += 2;
            while i < chars.len() && level > 0 {
                if chars[i].1 == '/' && peek(i + 1) == Some('*') {
                    level += 1;
                    i += 2;
                } else if chars[i].1 == '*' && peek(i + 1) == Some('/') {
                    level -= 1;
                    i += 2;
                } else {
                    i += 1;
                }
            }
        } else if c == '\'' {
            i += 1;
            while i < chars.len() {
                if chars[i].1 == '\'' {
                    if peek(i + 1) == Some('\'') {
                        i += 2;
                    } else {
                        i += 1;
                        break;
                    }
                } else {
                    i += 1;
                }
            }
        } else if c == '"' {
            i += 1;
            while i < chars.len() {
                if chars[i].1 == '"' {
                    if peek(i + 1) == Some('"') {
                        i += 2;
                    } else {
                        i += 1;
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            tokens.push(SqlToken::Quoted { depth, pos });
        } else if c == '$' {
            // `$tag$ … $tag$` is a dollar-quoted block; `$1` is a parameter.
            let mut j = i + 1;
            while j < chars.len() && is_word_char(chars[j].1) {
                j += 1;
            }
            let tag_is_quote = j < chars.len()
                && chars[j].1 == '$'
                && (j == i + 1 || !chars[i + 1].1.is_ascii_digit());
            if tag_is_quote {
                let tag: String = chars[i..=j].iter().map(|(_, ch)| *ch).collect();
                i = match find_dollar_close(&chars, j + 1, &tag) {
                    Some(end) => end,
                    None => chars.len(),
                };
            } else {
                tokens.push(SqlToken::Symbol { ch: '$', depth, pos });
                i += 1;
            }
        } else if c == '(' {
            tokens.push(SqlToken::Symbol { ch: '(', depth, pos });
            depth += 1;
            i += 1;
        } else if c == ')' {
            depth -= 1;
            tokens.push(SqlToken::Symbol { ch: ')', depth, pos });
            i += 1;
        } else if is_word_char(c) {
            let start = i;
            while i < chars.len() && is_word_char(chars[i].1) {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
            tokens.push(SqlToken::Word { text, depth, pos });
        } else {
            tokens.push(SqlToken::Symbol { ch: c, depth, pos });
            i += 1;
        }
    }

    tokens
}

/// Find the index just past the closing `$tag$`, if present.
fn find_dollar_close(chars: &[(usize, char)], from: usize, tag: &str) -> Option<usize> {
    let tag_chars: Vec<char> = tag.chars().collect();
    let mut i = from;
    while i + tag_chars.len() <= chars.len() {
        if chars[i].1 == '$'
            && chars[i..i + tag_chars.len()]
                .iter()
                .zip(&tag_chars)
                .all(|((_, a), b)| a == b)
        {
            return Some(i + tag_chars.len());
        }
        i += 1;
    }
    None
}

fn word_at<'a>(tokens: &'a [SqlToken], i: usize) -> Option<&'a str> {
    match tokens.get(i) {
        Some(SqlToken::Word { text, .. }) => Some(text.as_str()),
        _ => None,
    }
}

fn is_word(tokens: &[SqlToken], i: usize, expected: &str) -> bool {
    word_at(tokens, i).is_some_and(|w| w.eq_ignore_ascii_case(expected))
}

fn is_symbol(tokens: &[SqlToken], i: usize, expected: char) -> bool {
    matches!(tokens.get(i), Some(SqlToken::Symbol { ch, .. }) if *ch == expected)
}

/// Index just past the `)` matching the `(` at `open`.
fn skip_balanced(tokens: &[SqlToken], open: usize) -> Option<usize> {
    let open_depth = tokens[open].depth();
    for (offset, token) in tokens[open + 1..].iter().enumerate() {
        if let SqlToken::Symbol { ch: ')', depth, .. } = token {
            if *depth == open_depth {
                return Some(open + 1 + offset + 1);
            }
        }
    }
    None
}

/// Strip leading whitespace and SQL comments. Idempotent.
pub fn strip_leading_comments(sql: &str) -> &str {
    let bytes = sql.as_bytes();
    let mut i = 0;
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i + 1 < bytes.len() && bytes[i] == b'-' && bytes[i + 1] == b'-' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'*' {
            let mut level = 1;
            i += 2;
            while i < bytes.len() && level > 0 {
                if i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'*' {
                    level += 1;
                    i += 2;
                } else if i + 1 < bytes.len() && bytes[i] == b'*' && bytes[i + 1] == b'/' {
                    level -= 1;
                    i += 2;
                } else {
                    i += 1;
                }
            }
        } else {
            return &sql[i..];
        }
    }
}

/// Uppercased first keyword of the statement, after leading comments.
pub fn first_keyword(sql: &str) -> Option<String> {
    let stripped = strip_leading_comments(sql);
    let word: String = stripped
        .chars()
        .take_while(|c| is_word_char(*c))
        .collect();
    if word.is_empty() {
        None
    } else {
        Some(word.to_ascii_uppercase())
    }
}

fn ensure_single_statement(tokens: &[SqlToken]) -> Result<(), String> {
    let semi = tokens
        .iter()
        .position(|t| matches!(t, SqlToken::Symbol { ch: ';', .. }));
    if let Some(i) = semi {
        if tokens.len() > i + 1 {
            return Err("Multiple statements not allowed".to_string());
        }
    }
    Ok(())
}

fn has_top_level_into(tokens: &[SqlToken]) -> bool {
    tokens.iter().any(|t| {
        matches!(t, SqlToken::Word { text, depth, .. }
            if *depth == 0 && text.eq_ignore_ascii_case("INTO"))
    })
}

/// True iff any top-level `AS ( … )` body contains a DML keyword.
fn cte_bodies_contain_dml(tokens: &[SqlToken]) -> bool {
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].depth() == 0 && is_word(tokens, i, "AS") {
            let mut j = i + 1;
            if is_word(tokens, j, "NOT") {
                j += 1;
            }
            if is_word(tokens, j, "MATERIALIZED") {
                j += 1;
            }
            if is_symbol(tokens, j, '(') {
                let end = match skip_balanced(tokens, j) {
                    Some(end) => end,
                    // Unbalanced parens: assume the worst.
                    None => return true,
                };
                let body = &tokens[j + 1..end - 1];
                let dml = body.iter().any(|t| {
                    matches!(t, SqlToken::Word { text, .. }
                        if DML_KEYWORDS.iter().any(|k| text.eq_ignore_ascii_case(k)))
                });
                if dml {
                    return true;
                }
                i = end;
                continue;
            }
        }
        i += 1;
    }
    false
}

/// Walk `WITH name [(cols)] AS [NOT MATERIALIZED] ( body ) [, …]` and return
/// the token index where the final statement starts. `None` when the shape
/// is not understood.
fn with_final_statement_index(tokens: &[SqlToken]) -> Option<usize> {
    let mut i = 1;
    if is_word(tokens, i, "RECURSIVE") {
        i += 1;
    }
    loop {
        match tokens.get(i) {
            Some(SqlToken::Word { .. }) | Some(SqlToken::Quoted { .. }) => i += 1,
            _ => return None,
        }
        if is_symbol(tokens, i, '(') {
            i = skip_balanced(tokens, i)?;
        }
        if !is_word(tokens, i, "AS") {
            return None;
        }
        i += 1;
        if is_word(tokens, i, "NOT") {
            i += 1;
        }
        if is_word(tokens, i, "MATERIALIZED") {
            i += 1;
        }
        if !is_symbol(tokens, i, '(') {
            return None;
        }
        i = skip_balanced(tokens, i)?;
        if is_symbol(tokens, i, ',') {
            i += 1;
            continue;
        }
        return Some(i);
    }
}

/// Whether a `WITH` statement is acceptable in read-only mode: DML-free CTE
/// bodies and a final statement of `SELECT` (without top-level `INTO`),
/// `TABLE`, or `VALUES`.
fn with_is_read_safe(tokens: &[SqlToken]) -> bool {
    if cte_bodies_contain_dml(tokens) {
        return false;
    }
    let Some(final_index) = with_final_statement_index(tokens) else {
        return false;
    };
    let rest = &tokens[final_index..];
    match word_at(rest, 0).map(str::to_ascii_uppercase).as_deref() {
        Some("SELECT") => !has_top_level_into(rest),
        Some("TABLE") | Some("VALUES") => true,
        _ => false,
    }
}

/// True iff any top-level CTE body of the statement contains DML.
pub fn cte_contains_dml(sql: &str) -> bool {
    cte_bodies_contain_dml(&tokenize(sql))
}

/// The text of the final statement following the last top-level CTE of a
/// `WITH` statement. For non-`WITH` statements, the comment-stripped input.
pub fn extract_final_statement_after_ctes(sql: &str) -> Option<String> {
    let stripped = strip_leading_comments(sql);
    if first_keyword(sql).as_deref() != Some("WITH") {
        return Some(stripped.to_string());
    }
    let tokens = tokenize(stripped);
    let index = with_final_statement_index(&tokens)?;
    tokens.get(index).map(|t| stripped[t.pos()..].to_string())
}

/// Whether the statement can be wrapped in `DECLARE … CURSOR FOR …`.
pub fn is_cursor_eligible(sql: &str) -> bool {
    match first_keyword(sql).as_deref() {
        Some("SELECT") | Some("TABLE") | Some("VALUES") => true,
        Some("WITH") => with_is_read_safe(&tokenize(strip_leading_comments(sql))),
        _ => false,
    }
}

fn validate_explain(tokens: &[SqlToken]) -> Result<(), String> {
    let mut i = 1;
    let mut analyze = false;

    if is_symbol(tokens, i, '(') {
        let end =
            skip_balanced(tokens, i).ok_or_else(|| "Malformed EXPLAIN option list".to_string())?;
        analyze = tokens[i + 1..end - 1].iter().any(|t| {
            matches!(t, SqlToken::Word { text, .. } if text.eq_ignore_ascii_case("ANALYZE"))
        });
        i = end;
    }

    while let Some(word) = word_at(tokens, i) {
        let upper = word.to_ascii_uppercase();
        // `TABLE` and `VALUES` start statements and are never option words
        // in this position.
        if upper == "TABLE" || upper == "VALUES" {
            break;
        }
        if !EXPLAIN_OPTION_KEYWORDS.contains(&upper.as_str())
            && !word.chars().all(|c| c.is_ascii_digit())
        {
            break;
        }
        if upper == "ANALYZE" {
            analyze = true;
        }
        i += 1;
    }

    let Some(inner) = word_at(tokens, i) else {
        return Err("EXPLAIN requires a statement".to_string());
    };
    let inner_keyword = inner.to_ascii_uppercase();

    if BLOCKED_KEYWORDS.contains(&inner_keyword.as_str()) {
        return Err(format!("Statement type not allowed: {inner_keyword}"));
    }

    if analyze {
        let rest = &tokens[i..];
        let safe = match inner_keyword.as_str() {
            "SELECT" => !has_top_level_into(rest),
            "TABLE" | "VALUES" => true,
            "WITH" => with_is_read_safe(rest),
            _ => false,
        };
        if !safe {
            return Err(
                "EXPLAIN ANALYZE is only allowed for SELECT, TABLE, VALUES, or read-only WITH \
                 statements"
                    .to_string(),
            );
        }
    }

    Ok(())
}

/// Admit only the read-only statement subset. The error message never
/// contains user data beyond the first keyword.
pub fn validate_read_only(sql: &str) -> Result<(), String> {
    let tokens = tokenize(sql);

    let Some(first) = tokens.iter().find_map(|t| match t {
        SqlToken::Word { text, .. } => Some(text.to_ascii_uppercase()),
        _ => None,
    }) else {
        return Err("Empty SQL statement".to_string());
    };

    // Reject anything that does not even start with a word.
    match tokens.first() {
        Some(SqlToken::Word { .. }) => {}
        _ => return Err("Statement must start with a keyword".to_string()),
    }

    ensure_single_statement(&tokens)?;

    match first.as_str() {
        "SELECT" => {
            if has_top_level_into(&tokens) {
                Err("SELECT INTO is not allowed in read-only mode".to_string())
            } else {
                Ok(())
            }
        }
        "SHOW" | "VALUES" | "TABLE" => Ok(()),
        "WITH" => {
            if with_is_read_safe(&tokens) {
                Ok(())
            } else {
                Err(WITH_REJECT_MESSAGE.to_string())
            }
        }
        "EXPLAIN" => validate_explain(&tokens),
        other => Err(format!("Statement type not allowed: {other}")),
    }
}
