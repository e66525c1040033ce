//! `com.whtwnd.*` lexicons (Whitewind blogging).

pub mod blog {
    pub mod entry {
        use chrono::{DateTime, SecondsFormat, Utc};
        use serde::{Deserialize, Serialize};

        use crate::{LexiconRecord, ValidationError};

        pub const NSID: &str = "com.whtwnd.blog.entry";

        const MAX_CONTENT_LEN: usize = 100_000;
        const MAX_TITLE_LEN: usize = 1_000;

        /// Who can see an entry on Whitewind.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum Visibility {
            #[default]
            Public,
            Url,
            Author,
        }

        impl Visibility {
            pub fn as_str(&self) -> &'static str {
                match self {
                    Visibility::Public => "public",
                    Visibility::Url => "url",
                    Visibility::Author => "author",
                }
            }
        }

        /// A long-form Markdown blog entry.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct Entry {
            /// Markdown body
            pub content: String,
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub title: Option<String>,
            #[serde(default)]
            pub visibility: Visibility,
            pub created_at: String,
        }

        impl Entry {
            pub fn new(title: Option<String>, content: String, created_at: DateTime<Utc>) -> Self {
                Self {
                    content,
                    title: title.filter(|t| !t.trim().is_empty()),
                    visibility: Visibility::Public,
                    created_at: created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                }
            }
        }

        impl LexiconRecord for Entry {
            const NSID: &'static str = NSID;

            fn validate(&self) -> Result<(), ValidationError> {
                if self.content.trim().is_empty() {
                    return Err(ValidationError::Missing { field: "content" });
                }
                if self.content.chars().count() > MAX_CONTENT_LEN {
                    return Err(ValidationError::TooLong {
                        field: "content",
                        max: MAX_CONTENT_LEN,
                        unit: "characters",
                    });
                }
                if let Some(title) = &self.title {
                    if title.chars().count() > MAX_TITLE_LEN {
                        return Err(ValidationError::TooLong {
                            field: "title",
                            max: MAX_TITLE_LEN,
                            unit: "characters",
                        });
                    }
                }
                Ok(())
            }
        }

    }
}
