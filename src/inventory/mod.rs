//! Inventory API
//!
//! Seed and cloud asset submission, resource tag publishing and integration
//! status reporting.

pub mod client;
pub mod healthcheck;
pub mod report;
pub mod tags;

pub use client::{plan_batches, SubmissionBatch, SubmissionClient};
pub use healthcheck::{Healthcheck, HealthcheckErrorCode, HealthcheckRun};
pub use report::{LabelStatus, ReportSummary, SubmissionReport};
pub use tags::{plan_tags, TagPublisher, TagSummary, TagTarget};
