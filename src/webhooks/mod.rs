//! Webhook intake: signature verification, payload parsing, event routing.

pub mod events;
pub mod handlers;
pub mod parser;
pub mod signature;

pub use events::QueueEvent;
pub use handlers::handle_event;
pub use parser::{ParseError, parse_webhook};
pub use signature::WebhookSecret;
