//! Notification delivery: the [`Destination`] seam, per-destination
//! [`Dispatcher`] workers, and the [`Registry`] that builds them from rules.

pub mod dispatcher;
pub mod error;
pub mod logger;
pub mod registry;
pub mod webhook;

pub use dispatcher::{Destination, DispatchSettings, Dispatcher};
pub use error::{DeliveryError, DispatchError};
pub use registry::Registry;

use jobwatch_templates::{Template, TemplateError};

/// Plain-text summary used when a destination does not configure its own
/// message: the job name followed by each pod's name and logs.
pub const DEFAULT_SUMMARY: &str =
    "Job {{.Job.Name}}\n\n{{range .Pods}}{{.Name}}\n\n{{.Logs}}\n\n\n{{end}}";

pub(crate) fn summary_template() -> Result<Template, TemplateError> {
    Template::parse(DEFAULT_SUMMARY)
}
