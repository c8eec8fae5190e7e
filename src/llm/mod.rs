//! Provider plumbing: chat message types, failover rosters, and the
//! streaming completions client.

pub mod client;
pub mod models;

pub use client::{open_stream, ChatDelta, ChatStream, StreamError};
pub use models::{Backend, ModelEntry, Roster};

use serde::{Deserialize, Serialize};

/// One part of a chat message body (OpenAI-style content array).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    pub detail: String,
}

/// A user-supplied image attachment, already encoded as a data: URL.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub data_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl Message {
    /// A plain text message for the given role.
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// A user message carrying the question plus any image attachments.
    pub fn user_with_images(text: impl Into<String>, attachments: &[Attachment]) -> Self {
        let mut content = vec![ContentPart::Text { text: text.into() }];
        for file in attachments {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: file.data_url.clone(),
                    detail: "low".to_string(),
                },
            });
        }
        Self {
            role: "user".to_string(),
            content,
        }
    }

    /// The concatenated text parts of this message.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect()
    }
}
