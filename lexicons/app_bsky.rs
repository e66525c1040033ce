//! `app.bsky.*` lexicons needed for short-form posts.

pub mod richtext {
    pub mod facet {
        use serde::{Deserialize, Serialize};

        pub const LINK: &str = "app.bsky.richtext.facet#link";

        /// UTF-8 byte range into the post text, end exclusive.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct ByteSlice {
            pub byte_start: usize,
            pub byte_end: usize,
        }

        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(tag = "$type")]
        pub enum Feature {
            #[serde(rename = "app.bsky.richtext.facet#link")]
            Link { uri: String },
            #[serde(rename = "app.bsky.richtext.facet#mention")]
            Mention { did: String },
            #[serde(rename = "app.bsky.richtext.facet#tag")]
            Tag { tag: String },
        }

        /// An annotation over a byte range of post text.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub struct Facet {
            pub index: ByteSlice,
            pub features: Vec<Feature>,
        }

        impl Facet {
            pub fn link(byte_start: usize, byte_end: usize, uri: impl Into<String>) -> Self {
                Self {
                    index: ByteSlice {
                        byte_start,
                        byte_end,
                    },
                    features: vec![Feature::Link { uri: uri.into() }],
                }
            }
        }
    }
}

pub mod feed {
    pub mod post {
        use chrono::{DateTime, SecondsFormat, Utc};
        use serde::{Deserialize, Serialize};
        use unicode_segmentation::UnicodeSegmentation;

        use super::super::richtext::facet::Facet;
        use crate::{LexiconRecord, ValidationError};

        pub const NSID: &str = "app.bsky.feed.post";

        pub const MAX_GRAPHEMES: usize = 300;
        pub const MAX_BYTES: usize = 3_000;

        /// A short-form Bluesky post.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct Post {
            pub text: String,
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub facets: Option<Vec<Facet>>,
            pub created_at: String,
        }

        impl Post {
            pub fn new(text: String, facets: Vec<Facet>, created_at: DateTime<Utc>) -> Self {
                Self {
                    text,
                    facets: if facets.is_empty() { None } else { Some(facets) },
                    created_at: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                }
            }
        }

        impl LexiconRecord for Post {
            const NSID: &'static str = NSID;

            fn validate(&self) -> Result<(), ValidationError> {
                if grapheme_len(&self.text) > MAX_GRAPHEMES {
                    return Err(ValidationError::TooLong {
                        field: "text",
                        max: MAX_GRAPHEMES,
                        unit: "graphemes",
                    });
                }
                if self.text.len() > MAX_BYTES {
                    return Err(ValidationError::TooLong {
                        field: "text",
                        max: MAX_BYTES,
                        unit: "bytes",
                    });
                }
                for facet in self.facets.iter().flatten() {
                    let (start, end) = (facet.index.byte_start, facet.index.byte_end);
                    if start >= end || end > self.text.len() {
                        return Err(ValidationError::FacetOutOfRange { start, end });
                    }
                }
                Ok(())
            }
        }

        /// Number of user-perceived characters in `text`.
        pub fn grapheme_len(text: &str) -> usize {
            text.graphemes(true).count()
        }

        /// Longest prefix of `text` holding at most `max` graphemes.
        pub fn truncate_graphemes(text: &str, max: usize) -> &str {
            match text.grapheme_indices(true).nth(max) {
                Some((offset, _)) => &text[..offset],
                None => text,
            }
        }

        #[cfg(test)]
        mod tests {
            use super::*;

            #[test]
            fn link_facets_serialize_with_type_tags() {
                let post = Post::new(
                    "see https://example.com".into(),
                    vec![Facet::link(4, 23, "https://example.com")],
                    Utc::now(),
                );
                let json = post.to_record_json().unwrap();

                assert_eq!(json["$type"], "app.bsky.feed.post");
                assert_eq!(json["facets"][0]["index"]["byteStart"], 4);
                assert_eq!(json["facets"][0]["index"]["byteEnd"], 23);
                assert_eq!(
                    json["facets"][0]["features"][0]["$type"],
                    "app.bsky.richtext.facet#link"
                );
                assert_eq!(
                    json["facets"][0]["features"][0]["uri"],
                    "https://example.com"
                );
            }

            #[test]
            fn empty_facets_are_omitted() {
                let post = Post::new("plain".into(), vec![], Utc::now());
                let json = post.to_record_json().unwrap();
                assert!(json.get("facets").is_none());
            }

            #[test]
            fn truncation_respects_grapheme_boundaries() {
                let text = "e\u{301}e\u{301}e\u{301}";
                assert_eq!(grapheme_len(text), 3);
                assert_eq!(truncate_graphemes(text, 2), "e\u{301}e\u{301}");
                assert_eq!(truncate_graphemes("abc", 10), "abc");
            }

            #[test]
            fn facet_past_end_of_text_is_rejected() {
                let post = Post::new("short".into(), vec![Facet::link(2, 40, "x")], Utc::now());
                assert_eq!(
                    post.validate(),
                    Err(ValidationError::FacetOutOfRange { start: 2, end: 40 })
                );
            }

            #[test]
            fn overlong_text_is_rejected() {
                let post = Post::new("a".repeat(MAX_GRAPHEMES + 1), vec![], Utc::now());
                assert!(matches!(
                    post.validate(),
                    Err(ValidationError::TooLong { field: "text", .. })
                ));
            }
        }
    }
}
