// Webhook ingestion
//
// Handles:
// - Token authentication and parameter validation
// - Query, header and body decoding
// - Envelope construction and publishing through the broker link

pub mod envelope;
pub mod error;
pub mod pipeline;
pub mod request;

pub use envelope::WebhookEnvelope;
pub use error::WebhookError;
pub use pipeline::{Accepted, WebhookPipeline};
pub use request::WebhookRequest;
