use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// The maximum length, in characters, of each submitted field.
///
/// Longer values are truncated rather than rejected.
pub mod max_len {
    pub const NAME: usize = 100;

    /// The maximum length of a forward-path per RFC 5321 minus the angle brackets.
    pub const EMAIL: usize = 254;

    pub const PHONE: usize = 30;
    pub const COMPANY: usize = 200;
    pub const JOB_TITLE: usize = 100;
    pub const COMPANY_SIZE: usize = 50;
    pub const SCREENINGS_PER_YEAR: usize = 50;

    /// Applies to every entry of the `interests` list separately.
    pub const INTEREST: usize = 100;

    pub const MESSAGE: usize = 5000;
}

/// The maximum number of entries kept from the `interests` list.
pub const MAX_INTERESTS: usize = 10;

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@",
        r"[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?",
        r"(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*$",
    ))
    .unwrap()
});

/// A contact form submission that passed validation.
///
/// None of the fields contain a carriage return or a line feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub name: String,
    pub email: String,
    pub phone: String,
    pub company: String,
    pub job_title: String,
    pub company_size: String,
    pub screenings_per_year: String,
    pub interests: Vec<String>,
    pub message: String,
}

/// A reason for rejecting a submission.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid request body")]
    InvalidBody,
    #[error("Name is required")]
    NameRequired,
    #[error("Email is required")]
    EmailRequired,
    #[error("Invalid email format")]
    InvalidEmail,
}

/// Replace every `\r` and `\n` with a single space.
pub fn sanitize_crlf(input: &str) -> String {
    input
        .chars()
        .map(|c| if matches!(c, '\r' | '\n') { ' ' } else { c })
        .collect()
}

/// Coerce `value` to a string, strip line breaks and truncate it to
/// `max_len` characters.
pub fn sanitize_field(value: &Value, max_len: usize) -> String {
    sanitize_crlf(&coerce(value)).chars().take(max_len).collect()
}

/// Check `email` against a simplified RFC 5322 address grammar.
pub fn is_valid_email(email: &str) -> bool {
    !email.is_empty()
        && email.chars().count() <= max_len::EMAIL
        && EMAIL_REGEX.is_match(email)
}

/// Turn an untrusted request body into a [`Submission`].
///
/// All fields are sanitized first, then the required fields are checked.
/// Every problem found is reported, in field order.
pub fn validate_submission(raw: &Value) -> Result<Submission, Vec<ValidationError>> {
    let Some(input) = raw.as_object() else {
        return Err(vec![ValidationError::InvalidBody]);
    };

    let field = |key: &str, max_len: usize| {
        input
            .get(key)
            .map(|value| sanitize_field(value, max_len))
            .unwrap_or_default()
    };

    let name = field("name", max_len::NAME);
    let email = field("email", max_len::EMAIL);
    let phone = field("phone", max_len::PHONE);
    let company = field("company", max_len::COMPANY);
    let job_title = field("jobTitle", max_len::JOB_TITLE);
    let company_size = field("companySize", max_len::COMPANY_SIZE);
    let screenings_per_year = field("screeningsPerYear", max_len::SCREENINGS_PER_YEAR);
    let message = field("message", max_len::MESSAGE);

    let interests = match input.get("interests") {
        Some(Value::Array(entries)) => entries
            .iter()
            .take(MAX_INTERESTS)
            .filter(|entry| entry.is_string())
            .map(|entry| sanitize_field(entry, max_len::INTEREST))
            .filter(|entry| !entry.is_empty())
            .collect(),
        _ => Vec::new(),
    };

    let mut errors = Vec::new();
    if name.is_empty() {
        errors.push(ValidationError::NameRequired);
    }
    if email.is_empty() {
        errors.push(ValidationError::EmailRequired);
    } else if !is_valid_email(&email) {
        errors.push(ValidationError::InvalidEmail);
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(Submission {
        name,
        email,
        phone,
        company,
        job_title,
        company_size,
        screenings_per_year,
        interests,
        message,
    })
}

/// String conversion with the same results as JavaScript's `String(value)`
/// on a parsed JSON value, except that `null` becomes empty.
fn coerce(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.as_f64().map_or_else(|| n.to_string(), number_to_string),
        Value::String(s) => s.clone(),
        Value::Array(entries) => entries.iter().map(coerce).collect::<Vec<_>>().join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

/// Format `value` like JavaScript's `Number.prototype.toString`: the
/// shortest digits that round-trip, in positional notation for decimal
/// exponents from -7 to 20 and in exponent notation otherwise.
fn number_to_string(value: f64) -> String {
    // JSON numbers are always finite.
    if value == 0.0 {
        return "0".to_string();
    }

    // `{:e}` yields the shortest round-trip digits, e.g. `-1.25e-7`.
    let formatted = format!("{:e}", value.abs());
    let (mantissa, exponent) = formatted.split_once('e').unwrap_or((formatted.as_str(), "0"));
    let digits = mantissa.replace('.', "");
    let k = digits.len() as i32;
    let n = exponent.parse::<i32>().unwrap_or(0) + 1;

    let mut out = String::with_capacity(digits.len() + 8);
    if value < 0.0 {
        out.push('-');
    }
    if k <= n && n <= 21 {
        out.push_str(&digits);
        out.extend(std::iter::repeat('0').take((n - k) as usize));
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        out.push_str(int);
        out.push('.');
        out.push_str(frac);
    } else if -6 < n && n <= 0 {
        out.push_str("0.");
        out.extend(std::iter::repeat('0').take((-n) as usize));
        out.push_str(&digits);
    } else {
        let (first, rest) = digits.split_at(1);
        out.push_str(first);
        if !rest.is_empty() {
            out.push('.');
            out.push_str(rest);
        }
        let e = n - 1;
        out.push_str(if e < 0 { "e-" } else { "e+" });
        out.push_str(&e.abs().to_string());
    }
    out
}
