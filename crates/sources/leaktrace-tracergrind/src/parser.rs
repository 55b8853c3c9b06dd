//! Parser of the memory lines of `texttrace` output.
//!
//! Memory lines are tagged `[R]`, `[W]` or `[M]` and carry `KEY: value` fields:
//!
//! ```text
//! [W] INS_ADDRESS: 0x109214 MODE: W START_ADDRESS: 0x4a5f00 LENGTH: 4 DATA: 0x00 00 00 42
//! ```
//!
//! `DATA` takes the rest of the line and is printed most significant byte first. All other
//! tags (instruction, block and metadata lines) are skipped.

use leaktrace_core::event::{AccessEvent, AccessKind, StackRange};

const DATA_FIELD: &str = "DATA:";

/// Parses one line of the text trace.
///
/// Returns `Ok(None)` for lines that are not memory accesses.
pub(crate) fn parse_line(line: &str) -> Result<Option<AccessEvent>, String> {
    let Some(rest) = line.trim().strip_prefix('[') else {
        return Ok(None);
    };
    let Some((tag, rest)) = rest.split_once(']') else {
        return Ok(None);
    };
    let tagged = match tag {
        "R" => Some(AccessKind::Read),
        "W" => Some(AccessKind::Write),
        "M" => None,
        _ => return Ok(None),
    };
    let (fields, data) = rest
        .split_once(DATA_FIELD)
        .ok_or_else(|| "missing DATA field".to_string())?;

    let mut pc = None;
    let mut mode = None;
    let mut address = None;
    let mut size = None;
    let mut tokens = fields.split_whitespace();
    while let Some(token) = tokens.next() {
        let (key, value) = token
            .split_once(':')
            .ok_or_else(|| format!("unexpected token {:?}", token))?;
        let value = match value {
            "" => tokens
                .next()
                .ok_or_else(|| format!("missing value of {}", key))?,
            value => value,
        };
        match key {
            "INS_ADDRESS" | "PC" => pc = Some(parse_hex(key, value)?),
            "START_ADDRESS" => address = Some(parse_hex(key, value)?),
            "LENGTH" => size = Some(parse_length(value)?),
            "MODE" => mode = Some(value.parse::<AccessKind>().map_err(|e| e.to_string())?),
            _ => {}
        }
    }

    let kind = match (tagged, mode) {
        (Some(tagged), Some(mode)) if tagged != mode => {
            return Err(format!("tag [{}] contradicts MODE {}", tag, mode));
        }
        (Some(kind), _) | (None, Some(kind)) => kind,
        (None, None) => return Err("missing MODE field".to_string()),
    };
    Ok(Some(AccessEvent {
        kind,
        pc: pc.ok_or_else(|| "missing INS_ADDRESS field".to_string())?,
        address: address.ok_or_else(|| "missing START_ADDRESS field".to_string())?,
        size: size.ok_or_else(|| "missing LENGTH field".to_string())?,
        data: parse_data(data)?,
        stack: StackRange::EMPTY,
    }))
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

fn parse_hex(key: &str, value: &str) -> Result<u64, String> {
    u64::from_str_radix(strip_hex_prefix(value), 16)
        .map_err(|_| format!("invalid {} {:?}", key, value))
}

fn parse_length(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| format!("invalid LENGTH {:?}", value))
}

/// Values wider than 16 bytes keep their 16 least significant bytes.
fn parse_data(data: &str) -> Result<u128, String> {
    let digits: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = strip_hex_prefix(&digits);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid DATA {:?}", data.trim()));
    }
    let low = &digits[digits.len().saturating_sub(32)..];
    u128::from_str_radix(low, 16).map_err(|e| e.to_string())
}
