use chrono::{DateTime, NaiveDateTime};

use crate::error::{IngestError, Result};
use crate::EDF_TIME_DIMENSION;

/// 检查字符串是否为有效的整数
pub fn is_integer_number(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() {
        return false;
    }

    let digits = s.strip_prefix('+').or_else(|| s.strip_prefix('-')).unwrap_or(s);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// 检查字符串是否为有效的数字（包括浮点数）
pub fn is_number(s: &str) -> bool {
    let s = s.trim();
    !s.is_empty() && s.parse::<f64>().is_ok()
}

/// 解析EDF时间字符串为100纳秒单位
pub fn parse_edf_time(s: &str) -> Result<i64> {
    let s = s.trim();

    if s.is_empty() {
        return Err(IngestError::header("EDF time", "empty time string"));
    }

    // 处理符号
    let (negative, s) = if let Some(rest) = s.strip_prefix('-') {
        (true, rest)
    } else if let Some(rest) = s.strip_prefix('+') {
        (false, rest)
    } else {
        (false, s)
    };

    let invalid = |what: &str| IngestError::header("EDF time", format!("invalid {} in '{}'", what, s));

    let (integer_part, decimal_part) = s.split_once('.').unwrap_or((s, ""));
    if integer_part.is_empty() && decimal_part.is_empty() {
        return Err(invalid("number"));
    }
    // 只接受ASCII数字，之后按字节切片才安全
    if !integer_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("integer part"));
    }
    if !decimal_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("decimal part"));
    }

    let mut value = 0i64;
    if !integer_part.is_empty() {
        value = integer_part
            .parse::<i64>()
            .ok()
            .and_then(|v| v.checked_mul(EDF_TIME_DIMENSION))
            .ok_or_else(|| invalid("integer part"))?;
    }

    // 小数部分（最多7位精度）
    if !decimal_part.is_empty() {
        let decimal_str = &decimal_part[..decimal_part.len().min(7)];
        let decimal_value: i64 = decimal_str.parse().map_err(|_| invalid("decimal part"))?;
        value = value
            .checked_add(decimal_value * 10i64.pow(7 - decimal_str.len() as u32))
            .ok_or_else(|| invalid("decimal part"))?;
    }

    Ok(if negative { -value } else { value })
}

/// Formats 100ns units as signed TAL seconds: no trailing zeros, no
/// trailing dot.
pub fn format_edf_time(t: i64) -> String {
    let sign = if t < 0 { '-' } else { '+' };
    let seconds = t.abs() / EDF_TIME_DIMENSION;
    let fraction = t.abs() % EDF_TIME_DIMENSION;
    if fraction == 0 {
        format!("{}{}", sign, seconds)
    } else {
        let digits = format!("{:07}", fraction);
        format!("{}{}.{}", sign, seconds, digits.trim_end_matches('0'))
    }
}

/// 非本地化的整数解析（避免受系统locale影响）
pub fn atoi_nonlocalized(s: &str) -> i64 {
    s.trim().parse().unwrap_or(0)
}

/// 非本地化的浮点数解析
pub fn atof_nonlocalized(s: &str) -> f64 {
    s.trim().parse().unwrap_or(0.0)
}

/// Replaces anything outside printable ASCII with `_`.
pub fn to_ascii(s: &str) -> String {
    s.chars()
        .map(|c| if (' '..='~').contains(&c) { c } else { '_' })
        .collect()
}

/// 100ns EDF time units to milliseconds, rounded.
pub fn edf_time_to_ms(t: i64) -> i64 {
    let per_ms = EDF_TIME_DIMENSION / 1000;
    (t + per_ms / 2).div_euclid(per_ms)
}

pub fn datetime_to_ms(dt: NaiveDateTime) -> i64 {
    dt.and_utc().timestamp_millis()
}

pub fn ms_to_datetime(ms: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

pub fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// LEB128 unsigned varint.
pub fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Reads a varint at `*pos`, advancing it. `None` on truncation or overflow.
pub fn read_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*pos)?;
        *pos += 1;
        if shift >= 64 {
            return None;
        }
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
}
