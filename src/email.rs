use base64ct::{Base64, Encoding};

use crate::validate::{sanitize_crlf, Submission};

const RULE: &str = "================================";

/// The most bytes of header text carried by one RFC 2047 encoded word, so
/// that a `Subject:` line holding one stays within 76 characters.
const MAX_WORD_BYTES: usize = 39;

/// A plain text email built from a [`Submission`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    /// Lines separated by `\n`.
    pub body: String,
    /// The address of whoever filled in the form.
    pub reply_to: String,
}

impl From<&Submission> for OutboundMessage {
    fn from(submission: &Submission) -> Self {
        let mut lines = vec![
            "NEW CONTACT FORM SUBMISSION".to_string(),
            RULE.to_string(),
            String::new(),
            format!("Name: {}", submission.name),
            format!("Email: {}", submission.email),
        ];

        let optional = [
            ("Phone", &submission.phone),
            ("Company", &submission.company),
            ("Job Title", &submission.job_title),
            ("Company Size", &submission.company_size),
            ("Screenings per Year", &submission.screenings_per_year),
        ];
        for (label, value) in optional {
            if !value.is_empty() {
                lines.push(format!("{label}: {value}"));
            }
        }
        if !submission.interests.is_empty() {
            lines.push(format!("Interests: {}", submission.interests.join(", ")));
        }
        if !submission.message.is_empty() {
            lines.extend([
                String::new(),
                "Message:".to_string(),
                "--------".to_string(),
                submission.message.clone(),
            ]);
        }

        lines.extend([
            String::new(),
            RULE.to_string(),
            format!("Reply directly to respond to {}", submission.name),
        ]);

        Self {
            subject: format!("New Contact Form Submission from {}", submission.name),
            body: lines.join("\n"),
            reply_to: submission.email.clone(),
        }
    }
}

impl OutboundMessage {
    /// Render the message as sent after `DATA`, including the terminating
    /// `.` line.
    ///
    /// Header values are stripped of line breaks again here, whatever
    /// their source. The body is sent quoted-printable, so no line exceeds
    /// 76 characters before dot-stuffing.
    pub fn to_payload(&self, sender_name: &str, sender: &str, recipient: &str) -> String {
        let headers = [
            format!(
                "From: {} <{}>",
                encode_header(&sanitize_crlf(sender_name)),
                sanitize_crlf(sender)
            ),
            format!("To: {}", sanitize_crlf(recipient)),
            format!("Reply-To: {}", sanitize_crlf(&self.reply_to)),
            format!("Subject: {}", encode_header(&sanitize_crlf(&self.subject))),
            "MIME-Version: 1.0".to_string(),
            "Content-Type: text/plain; charset=utf-8".to_string(),
            "Content-Transfer-Encoding: quoted-printable".to_string(),
        ];

        let mut payload = String::with_capacity(self.body.len() + 512);
        for header in headers {
            payload.push_str(&header);
            payload.push_str("\r\n");
        }
        payload.push_str("\r\n");
        let text = self
            .body
            .split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .collect::<Vec<_>>()
            .join("\r\n");
        payload.push_str(&dot_stuff(&quoted_printable::encode_to_str(text)));
        payload.push_str(".\r\n");
        payload
    }
}

/// Encode a header value as RFC 2047 encoded words unless it is plain ASCII.
///
/// Long values are split on character boundaries into several words, each
/// on its own folded line.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }

    let mut words = Vec::new();
    let mut start = 0;
    for (ix, c) in value.char_indices() {
        if ix + c.len_utf8() - start > MAX_WORD_BYTES {
            words.push(encode_word(&value[start..ix]));
            start = ix;
        }
    }
    words.push(encode_word(&value[start..]));
    words.join("\r\n ")
}

fn encode_word(text: &str) -> String {
    format!("=?utf-8?B?{}?=", Base64::encode_string(text.as_bytes()))
}

/// Terminate every line with CRLF and double leading dots, so no line of
/// the body can end the data phase.
fn dot_stuff(body: &str) -> String {
    let mut result = String::with_capacity(body.len() + 64);
    for line in body.split('\n') {
        let line = line.trim_end_matches('\r');
        if line.starts_with('.') {
            result.push('.');
        }
        result.push_str(line);
        result.push_str("\r\n");
    }
    result
}
