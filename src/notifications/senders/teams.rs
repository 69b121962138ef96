//! Microsoft Teams webhook notifier posting MessageCard payloads.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::{
    dashboard_url, failure_lines, required_string_option, Notification, Notifier, NotifierError,
};
use crate::config::ConfigError;

pub struct TeamsNotifier {
    name: String,
    client: Client,
    url: String,
    web_root: String,
}

impl TeamsNotifier {
    pub fn from_options(
        name: &str,
        options: &Value,
        web_root: &str,
    ) -> Result<TeamsNotifier, ConfigError> {
        Ok(TeamsNotifier {
            name: name.to_string(),
            client: Client::new(),
            url: required_string_option("teams", name, options, "url")?,
            web_root: web_root.to_string(),
        })
    }

    fn build_card(&self, n: &Notification) -> Value {
        let (title, color, sections) = if n.result.valid() {
            (
                "FeedMonitor Fetch Successful",
                "00FF00",
                vec![json!({
                    "facts": [
                        {"name": "Application:", "value": n.app_name},
                        {"name": "Endpoint Name:", "value": n.endpoint_name},
                        {"name": "URL:", "value": n.result.url},
                        {"name": "Duration:", "value": format!("{}ms", n.result.duration_ms)},
                    ],
                    "text": "Feed fetched and validated successfully."
                })],
            )
        } else {
            let mut sections = vec![json!({
                "facts": [
                    {"name": "Application:", "value": n.app_name},
                    {"name": "Endpoint Name:", "value": n.endpoint_name},
                    {"name": "URL:", "value": n.result.url},
                ],
                "text": "Validation failed."
            })];
            for (validator, error) in failure_lines(n) {
                sections.push(json!({
                    "facts": [
                        {"name": "Validator:", "value": validator},
                        {"name": "Error:", "value": error},
                    ]
                }));
            }
            ("FeedMonitor Fetch Failed", "FF0000", sections)
        };

        json!({
            "@type": "MessageCard",
            "@context": "http://schema.org/extensions",
            "summary": title,
            "themeColor": color,
            "title": title,
            "sections": sections,
            "potentialAction": [{
                "@type": "OpenUri",
                "name": "View in FeedMonitor",
                "targets": [{"os": "default", "uri": dashboard_url(&self.web_root, n)}]
            }]
        })
    }
}

#[async_trait]
impl Notifier for TeamsNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn notify(&self, n: &Notification) -> Result<(), NotifierError> {
        let card = self.build_card(n);
        let response = self.client.post(&self.url).json(&card).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifierError::SendFailed(format!(
                "Teams webhook returned status {status}: {body}"
            )));
        }
        Ok(())
    }
}
