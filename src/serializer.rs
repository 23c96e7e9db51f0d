use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::MigrxResult;
use crate::error::{BoxError, Error};
use crate::util::truncate_body;

/// Decoder for one family of response media types.
pub trait PayloadSerializer: Send + Sync {
    fn media_types(&self) -> &[&'static str];

    fn decode(&self, body: &[u8]) -> Result<serde_json::Value, BoxError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn media_types(&self) -> &[&'static str] {
        &["application/json"]
    }

    fn decode(&self, body: &[u8]) -> Result<serde_json::Value, BoxError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Ordered set of serializers; the first registered one is the fallback for bodies that
/// arrive without a `Content-Type`.
#[derive(Clone)]
pub struct SerializerRegistry {
    serializers: Vec<Arc<dyn PayloadSerializer>>,
}

impl std::fmt::Debug for SerializerRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SerializerRegistry")
            .field("accept", &self.accept_header_value())
            .finish()
    }
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        Self::new().register(JsonSerializer)
    }
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self {
            serializers: Vec::new(),
        }
    }

    pub fn register(mut self, serializer: impl PayloadSerializer + 'static) -> Self {
        self.serializers.push(Arc::new(serializer));
        self
    }

    pub fn resolve(&self, content_type: Option<&str>) -> Option<&dyn PayloadSerializer> {
        let Some(content_type) = content_type else {
            return self.serializers.first().map(|serializer| serializer.as_ref());
        };
        let essence = media_type_essence(content_type);
        self.serializers
            .iter()
            .find(|serializer| {
                serializer.media_types().iter().any(|media_type| {
                    media_type.eq_ignore_ascii_case(&essence) || structured_suffix_matches(media_type, &essence)
                })
            })
            .map(|serializer| serializer.as_ref())
    }

    /// Value for an `Accept` header listing every registered media type.
    pub fn accept_header_value(&self) -> String {
        let mut media_types: Vec<&str> = Vec::new();
        for serializer in &self.serializers {
            for media_type in serializer.media_types() {
                if !media_types.contains(media_type) {
                    media_types.push(*media_type);
                }
            }
        }
        media_types.join(", ")
    }

    pub fn deserialize<T>(&self, content_type: Option<&str>, body: &[u8]) -> MigrxResult<T>
    where
        T: DeserializeOwned,
    {
        let content_type_text = content_type.unwrap_or_default().to_owned();
        let serializer =
            self.resolve(content_type)
                .ok_or_else(|| Error::UnsupportedContentType {
                    content_type: content_type_text.clone(),
                })?;
        let value = serializer
            .decode(body)
            .map_err(|source| Error::Deserialize {
                content_type: content_type_text.clone(),
                source,
                body: truncate_body(body),
            })?;
        serde_json::from_value(value).map_err(|source| Error::Deserialize {
            content_type: content_type_text,
            source: Box::new(source),
            body: truncate_body(body),
        })
    }
}

fn media_type_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

// application/vnd.api+json is served by an application/json decoder.
fn structured_suffix_matches(media_type: &str, essence: &str) -> bool {
    let Some((_, subtype)) = media_type.split_once('/') else {
        return false;
    };
    essence.ends_with(&format!("+{subtype}"))
}
