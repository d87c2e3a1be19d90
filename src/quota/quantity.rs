use std::cmp::Ordering;
use std::fmt;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("quantity {0:?} has no numeric part")]
    MissingNumber(String),
    #[error("quantity {0:?} has an unknown suffix")]
    UnknownSuffix(String),
    #[error("quantity {0:?} is out of range")]
    Overflow(String),
}

/// How a quantity was written, kept so computed values print in the same
/// style as the configured ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    DecimalSI,
    BinarySI,
    DecimalExponent,
}

const DECIMAL_SUFFIXES: [(&str, u32); 6] = [
    ("E", 18),
    ("P", 15),
    ("T", 12),
    ("G", 9),
    ("M", 6),
    ("k", 3),
];

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ei", 60),
    ("Pi", 50),
    ("Ti", 40),
    ("Gi", 30),
    ("Mi", 20),
    ("Ki", 10),
];

/// A resource quantity held as an integer number of milli-units.
///
/// Equality and ordering compare the value only, so `1Gi` and `1073741824`
/// are equal even though they print differently.
#[derive(Debug, Clone, Copy, Default)]
pub struct Amount {
    millis: i128,
    format: Format,
}

impl Amount {
    pub fn zero(format: Format) -> Self {
        Self { millis: 0, format }
    }

    pub fn from_millis(millis: i128, format: Format) -> Self {
        Self { millis, format }
    }

    pub fn millis(&self) -> i128 {
        self.millis
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(QuantityError::Empty);
        }

        let number_end = s
            .char_indices()
            .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-'))))
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(number_end);

        let (negative, digits) = match number.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, number.strip_prefix('+').unwrap_or(number)),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(QuantityError::MissingNumber(input.to_string()));
        }
        if frac_part.contains('.') {
            return Err(QuantityError::MissingNumber(input.to_string()));
        }

        let overflow = || QuantityError::Overflow(input.to_string());
        let mut mantissa: i128 = 0;
        for c in int_part.chars().chain(frac_part.chars()) {
            let d = c.to_digit(10).ok_or_else(|| QuantityError::MissingNumber(input.to_string()))?;
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(d as i128))
                .ok_or_else(overflow)?;
        }
        let frac_digits = frac_part.len() as i32;

        let (format, decimal_exp, binary_exp) = parse_suffix(suffix)
            .ok_or_else(|| QuantityError::UnknownSuffix(input.to_string()))?;

        // millis = mantissa * 2^binary_exp * 10^(decimal_exp + 3 - frac_digits), rounded up
        let exp10 = decimal_exp + 3 - frac_digits;
        let mut numerator = mantissa
            .checked_mul(1i128.checked_shl(binary_exp).ok_or_else(overflow)?)
            .ok_or_else(overflow)?;
        let mut denominator: i128 = 1;
        if exp10 >= 0 {
            numerator = numerator
                .checked_mul(pow10(exp10 as u32).ok_or_else(overflow)?)
                .ok_or_else(overflow)?;
        } else {
            denominator = pow10((-exp10) as u32).ok_or_else(overflow)?;
        }
        let mut millis = numerator / denominator;
        if numerator % denominator != 0 {
            millis += 1;
        }
        if negative {
            millis = -millis;
        }

        Ok(Self { millis, format })
    }

    pub fn from_quantity(q: &Quantity) -> Result<Self, QuantityError> {
        Self::parse(&q.0)
    }

    pub fn to_quantity(&self) -> Quantity {
        Quantity(self.to_string())
    }

    /// Multiplies by `ratio`, truncating to whole milli-units. The format of
    /// the original quantity is kept.
    pub fn scale(&self, ratio: f64) -> Self {
        let ratio_micros = (ratio * 1_000_000.0).round() as i128;
        Self {
            millis: self.millis.saturating_mul(ratio_micros) / 1_000_000,
            format: self.format,
        }
    }
}

impl std::ops::Add for Amount {
    type Output = Amount;

    fn add(self, other: Amount) -> Amount {
        Amount {
            millis: self.millis.saturating_add(other.millis),
            format: self.format,
        }
    }
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

fn parse_suffix(suffix: &str) -> Option<(Format, i32, u32)> {
    match suffix {
        "" => Some((Format::DecimalSI, 0, 0)),
        "n" => Some((Format::DecimalSI, -9, 0)),
        "u" => Some((Format::DecimalSI, -6, 0)),
        "m" => Some((Format::DecimalSI, -3, 0)),
        _ => {
            if let Some((_, exp)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
                return Some((Format::DecimalSI, *exp as i32, 0));
            }
            if let Some((_, exp)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
                return Some((Format::BinarySI, 0, *exp));
            }
            let exponent = suffix.strip_prefix('e').or_else(|| suffix.strip_prefix('E'))?;
            exponent
                .parse::<i32>()
                .ok()
                .map(|e| (Format::DecimalExponent, e, 0))
        }
    }
}

impl PartialEq for Amount {
    fn eq(&self, other: &Self) -> bool {
        self.millis == other.millis
    }
}

impl Eq for Amount {}

impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Amount {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis.cmp(&other.millis)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.millis == 0 {
            return write!(f, "0");
        }
        let sign = if self.millis < 0 { "-" } else { "" };
        let abs = self.millis.unsigned_abs();
        if abs % 1000 != 0 {
            return write!(f, "{sign}{abs}m");
        }
        let value = abs / 1000;

        if self.format == Format::BinarySI {
            for (suffix, exp) in BINARY_SUFFIXES {
                let unit = 1u128 << exp;
                if value % unit == 0 {
                    return write!(f, "{sign}{}{suffix}", value / unit);
                }
            }
        }

        for (suffix, exp) in DECIMAL_SUFFIXES {
            let unit = 10u128.pow(exp);
            if value % unit == 0 {
                return match self.format {
                    Format::DecimalExponent => write!(f, "{sign}{}e{exp}", value / unit),
                    _ => write!(f, "{sign}{}{suffix}", value / unit),
                };
            }
        }
        write!(f, "{sign}{value}")
    }
}
