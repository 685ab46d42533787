use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Series,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Series => "series",
        }
    }
}

/// One logical lookup ("find playable sources for title X"), handed
/// unchanged to every provider.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SourceRequest {
    /// External title id, e.g. an IMDb id
    pub id: String,
    pub media_type: MediaType,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    /// Metadata resolved once by the caller and shared by all providers
    #[serde(default)]
    pub prefetched_meta: Option<serde_json::Value>,
}

impl SourceRequest {
    pub fn movie(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            media_type: MediaType::Movie,
            season: None,
            episode: None,
            prefetched_meta: None,
        }
    }

    pub fn episode(id: impl Into<String>, season: u32, episode: u32) -> Self {
        Self {
            id: id.into(),
            media_type: MediaType::Series,
            season: Some(season),
            episode: Some(episode),
            prefetched_meta: None,
        }
    }

    /// Cache key identifying this request, independent of prefetched metadata
    pub fn cache_key(&self) -> String {
        match (self.season, self.episode) {
            (Some(s), Some(e)) => format!("{}:{}:{}:{}", self.media_type.as_str(), self.id, s, e),
            _ => format!("{}:{}", self.media_type.as_str(), self.id),
        }
    }
}

/// A single playable source returned by a provider
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StreamSource {
    pub provider: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub seeders: Option<u32>,
    #[serde(default)]
    pub info_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key() {
        assert_eq!(SourceRequest::movie("tt0111161").cache_key(), "movie:tt0111161");
        assert_eq!(
            SourceRequest::episode("tt0903747", 1, 3).cache_key(),
            "series:tt0903747:1:3"
        );
    }

    #[test]
    fn test_stream_source_optional_fields() {
        let src: StreamSource = serde_json::from_str(
            r#"{"provider":"a","title":"Movie 1080p","url":"magnet:?xt=1"}"#,
        )
        .unwrap();
        assert_eq!(src.quality, None);
        assert_eq!(src.provider, "a");
    }
}
