//! libpq `keyword=value` connection strings.

/// Splits `host=db1 port=5432 password='it''s'` style strings into pairs.
///
/// Values may be single-quoted; inside quotes `\'` and `\\` are escapes.
/// Whitespace around `=` is allowed.
pub fn parse_keyword_dsn(input: &str) -> Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(format!("missing \"=\" after {:?} in connection info string", key));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => return Err("unterminated quoted string in connection info string".to_string()),
                    },
                    Some('\'') => break,
                    Some(c) => value.push(c),
                    None => return Err("unterminated quoted string in connection info string".to_string()),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                } else {
                    value.push(c);
                }
            }
        }

        if key.is_empty() {
            return Err("empty keyword in connection info string".to_string());
        }
        pairs.push((key, value));
    }

    Ok(pairs)
}
