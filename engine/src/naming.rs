//! Container names derived from arbitrary job names.
//!
//! The runtime accepts `[a-zA-Z0-9][a-zA-Z0-9_.-]*`. Characters outside that
//! grammar are written as their UTF-16 code unit in four lowercase hex digits
//! followed by `_`. Since `_` is never emitted literally, an `xxxx_` run in
//! the input that stands for a character the encoder would have escaped at
//! that position is copied through, which makes encoding idempotent. Runs
//! standing for legal characters get their `_` escaped like any other.

const ESCAPE_MARKER: char = '_';

fn is_first_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
}

fn is_body_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-'
}

pub fn encode_container_name(job_name: &str) -> String {
    let chars: Vec<char> = job_name.chars().collect();
    let mut encoded = String::with_capacity(job_name.len());
    let mut i = 0;

    while i < chars.len() {
        if is_escape_sequence(&chars[i..], i == 0) {
            encoded.extend(&chars[i..i + 5]);
            i += 5;
            continue;
        }

        let c = chars[i];
        let legal = if i == 0 {
            is_first_char(c)
        } else {
            is_body_char(c)
        };

        if legal {
            encoded.push(c);
        } else {
            push_escaped(&mut encoded, c);
        }
        i += 1;
    }

    encoded
}

fn is_escape_sequence(chars: &[char], at_start: bool) -> bool {
    if chars.len() < 5
        || chars[4] != ESCAPE_MARKER
        || !chars[..4].iter().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
    {
        return false;
    }

    let digits: String = chars[..4].iter().collect();
    let Ok(unit) = u16::from_str_radix(&digits, 16) else {
        return false;
    };
    // Lone surrogates only come from escaping astral characters.
    match char::from_u32(u32::from(unit)) {
        None => true,
        Some(c) if at_start => !is_first_char(c),
        Some(c) => !is_body_char(c),
    }
}

fn push_escaped(out: &mut String, c: char) {
    let mut units = [0u16; 2];
    for unit in c.encode_utf16(&mut units) {
        out.push_str(&format!("{:04x}{}", unit, ESCAPE_MARKER));
    }
}
