//! `surveyline-delivery`: the lifecycle of one survey sent to one recipient.
//!
//! Pure domain code: the delivery state machine, recipient phone validation and
//! hashing, and the response record written when a recipient replies.

pub mod delivery;
pub mod phone;
pub mod response;

pub use delivery::{
    Delivery, DeliveryError, DeliveryStatus, NewDelivery, ProviderStatus, StatusApplication,
    DEFAULT_MAX_RETRIES,
};
pub use phone::{PhoneNumber, normalize_phone, recipient_hash};
pub use response::SurveyResponse;
