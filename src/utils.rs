use num::{FromPrimitive, traits::WrappingAdd};
use std::env;
use tracing::warn;

/// Environment variables of the CA client library that are reported by `info`
pub const EPICS_CA_ENVIRONMENT: [&str; 8] = [
    "EPICS_CA_ADDR_LIST",
    "EPICS_CA_AUTO_ADDR_LIST",
    "EPICS_CA_CONN_TMO",
    "EPICS_CA_MAX_ARRAY_BYTES",
    "EPICS_CA_SERVER_PORT",
    "EPICS_CA_REPEATER_PORT",
    "EPICS_CA_BEACON_PERIOD",
    "EPICS_CA_MAX_SEARCH_PERIOD",
];

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

/// Whether the cache runs in polling mode, from `PVCACHE_POLLING`
///
/// Any value other than `0`, `no` or `false` selects polling mode.
pub fn get_default_polling_mode() -> bool {
    env::var("PVCACHE_POLLING")
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "no" | "false"))
        .unwrap_or(false)
}

/// Timeout used when a caller passes zero, either from environment or default 3s
pub fn get_default_timeout() -> f32 {
    env::var("PVCACHE_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3.0f32)
        .max(0.01f32)
}

/// Idle sleep of the connect worker, either from environment or default 0.1s
pub fn get_default_connect_idle() -> f32 {
    env::var("PVCACHE_CONNECT_IDLE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.1f32)
        .max(0.001f32)
}

/// Current values of the CA environment, with unset variables left empty
pub fn read_ca_environment() -> Vec<(String, String)> {
    EPICS_CA_ENVIRONMENT
        .iter()
        .map(|name| (name.to_string(), env::var(name).unwrap_or_default()))
        .collect()
}

/// Strip whitespace that CA names cannot carry
///
/// Surrounding whitespace is dropped, and anything after an inner space or tab
/// is cut off.
pub fn clean_pv_name(name: &str) -> String {
    let trimmed = name.trim();
    match trimmed.find([' ', '\t']) {
        Some(pos) => {
            warn!("PV name '{name}' contains whitespace, using '{}'", &trimmed[..pos]);
            trimmed[..pos].to_string()
        }
        None => trimmed.to_string(),
    }
}

/// Format a number the way C's `%g` does
pub fn format_general(value: f64) -> String {
    const PRECISION: i32 = 6;
    fn trim_fraction(s: &str) -> &str {
        if s.contains('.') {
            s.trim_end_matches('0').trim_end_matches('.')
        } else {
            s
        }
    }

    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    // Rounding to the precision can carry into the exponent, so take it from
    // the rounded scientific form rather than from log10
    let scientific = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if exponent < -4 || exponent >= PRECISION {
        format!(
            "{}e{}{:02}",
            trim_fraction(mantissa),
            if exponent < 0 { '-' } else { '+' },
            exponent.abs()
        )
    } else {
        let decimals = (PRECISION - 1 - exponent) as usize;
        trim_fraction(&format!("{value:.decimals$}")).to_string()
    }
}

/// Length of the longest prefix of `text` that reads as a decimal number
fn numeric_prefix_len(text: &str, allow_fraction: bool) -> usize {
    let bytes = text.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut has_digits = end > digits_start;
    if !allow_fraction {
        return if has_digits { end } else { 0 };
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        let fraction_start = end;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        has_digits |= end > fraction_start;
    }
    if !has_digits {
        return 0;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+' | b'-')) {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    end
}

/// Read the leading number of a string, like C's `strtod`. Zero if there is none.
pub fn parse_leading_f64(text: &str) -> f64 {
    let text = text.trim_start();
    let len = numeric_prefix_len(text, true);
    text[..len].parse().unwrap_or(0.0)
}

/// Read the leading integer of a string, like C's `strtol`. Saturates on overflow.
pub fn parse_leading_i64(text: &str) -> i64 {
    let text = text.trim_start();
    let len = numeric_prefix_len(text, false);
    let digits = &text[..len];
    match digits.parse::<i64>() {
        Ok(v) => v,
        Err(_) if digits.is_empty() => 0,
        Err(_) if digits.starts_with('-') => i64::MIN,
        Err(_) => i64::MAX,
    }
}
