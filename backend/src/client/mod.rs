//! Client side of the query contract: submitting requests, rendering the
//! combined response per tab, and the notification list that reports
//! outcomes.

pub mod notifications;
pub mod presenter;
pub mod submitter;

pub use notifications::{Notification, NotificationCenter, NotificationKind};
pub use presenter::{render, Overlay, PresenterState, Tab};
pub use submitter::{QuerySubmitter, SubmitError, UploadOutcome};
