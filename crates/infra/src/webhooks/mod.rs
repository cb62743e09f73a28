//! Inbound webhook pipeline: verify, parse, ingest.

pub mod ingest;
pub mod parser;
pub mod signature;

pub use ingest::{EventReport, IngestError, IngestReport, IngestResult, WebhookIngestor, WebhookStatus};
pub use parser::{
    Direction, InboundMessage, StatusUpdate, WEBHOOK_SOURCE, WebhookEvent, WebhookParseError,
    parse_webhook,
};
pub use signature::{SIGNATURE_HEADER, SignatureError, SignatureVerifier};
