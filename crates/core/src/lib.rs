//! `surveyline-core`: shared foundation building blocks.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, the domain error model and the clock abstraction.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{DeliveryId, ResponseId, SurveyId, TenantId};
