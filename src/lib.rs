//! A backend for a website contact form.
//!
//! Submissions arrive as JSON on `POST /api/contact`, are validated and
//! stripped of anything that could inject mail headers, and are then
//! relayed as a plain text email through an authenticated SMTP server.
//!
//! The SMTP client is small and strict: it always upgrades the connection
//! with `STARTTLS`, authenticates with `AUTH LOGIN` and checks the reply
//! to every command. See [`relay::deliver`] for a single exchange and
//! [`smtp::transition`] for the protocol steps.

#![forbid(unsafe_code)]

pub mod config;
pub mod email;
pub mod relay;
pub mod server;
pub mod smtp;
pub mod transport;
pub mod validate;

pub use email::OutboundMessage;
pub use relay::{Relay, RelaySettings, SmtpRelay};
pub use smtp::Error as SmtpError;
pub use validate::{validate_submission, Submission, ValidationError};
