//! Console notifier writing human-readable lines to standard error.

use async_trait::async_trait;

use super::{failure_lines, Notification, Notifier, NotifierError};

pub struct StderrNotifier {
    name: String,
}

impl StderrNotifier {
    pub fn new(name: &str) -> StderrNotifier {
        StderrNotifier {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Notifier for StderrNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, n: &Notification) -> Result<(), NotifierError> {
        let message = if n.result.valid() {
            format!(
                "Successfully checked {} feed {} at URL: {} in {}ms",
                n.app_name, n.endpoint_name, n.result.url, n.result.duration_ms
            )
        } else {
            let mut errors = String::new();
            for (validator, error) in failure_lines(n) {
                errors.push_str(&format!("{validator}: {error}\n"));
            }
            format!(
                "Validation error on {} feed '{}' at URL: {}\nErrors:\n{}",
                n.app_name, n.endpoint_name, n.result.url, errors
            )
        };
        eprintln!("Notification:\n{message}");
        Ok(())
    }
}
