//! HipChat room notifier using the v2 room-notification API.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use super::{
    dashboard_url, failure_lines, required_string_option, Notification, Notifier, NotifierError,
};
use crate::config::ConfigError;

pub struct HipchatNotifier {
    name: String,
    client: Client,
    api_key: String,
    room: String,
    web_root: String,
}

#[derive(Serialize)]
struct RoomNotification<'a> {
    message: &'a str,
    message_format: &'a str,
    color: &'a str,
}

impl HipchatNotifier {
    pub fn from_options(
        name: &str,
        options: &Value,
        web_root: &str,
    ) -> Result<HipchatNotifier, ConfigError> {
        Ok(HipchatNotifier {
            name: name.to_string(),
            client: Client::new(),
            api_key: required_string_option("hipchat", name, options, "apikey")?,
            room: required_string_option("hipchat", name, options, "room")?,
            web_root: web_root.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for HipchatNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, n: &Notification) -> Result<(), NotifierError> {
        let (message, color) = if n.result.valid() {
            (
                format!(
                    "Successfully checked {} feed {} at URL: {} in {}ms",
                    n.app_name, n.endpoint_name, n.result.url, n.result.duration_ms
                ),
                "green",
            )
        } else {
            let mut errors = String::new();
            for (validator, error) in failure_lines(n) {
                errors.push_str(&format!("{validator}: {error}<br/>"));
            }
            (
                format!(
                    "Validation error on {} feed '{}' at URL: {}.<br/>Errors:<br/>{}<a href=\"{}\">View Feed</a>",
                    n.app_name,
                    n.endpoint_name,
                    n.result.url,
                    errors,
                    dashboard_url(&self.web_root, n)
                ),
                "red",
            )
        };

        let url = format!(
            "https://api.hipchat.com/v2/room/{}/notification",
            self.room
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&RoomNotification {
                message: &message,
                message_format: "html",
                color,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifierError::SendFailed(format!(
                "HipChat returned status {status}: {body}"
            )));
        }
        Ok(())
    }
}
