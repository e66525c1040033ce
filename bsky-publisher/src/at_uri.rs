use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SCHEME: &str = "at://";

/// Reference to a record in a user's repository: `at://{repo}/{collection}/{rkey}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AtUri {
    pub repo: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    pub fn new(
        repo: impl Into<String>,
        collection: impl Into<String>,
        rkey: impl Into<String>,
    ) -> Result<Self> {
        let uri = Self {
            repo: repo.into(),
            collection: collection.into(),
            rkey: rkey.into(),
        };
        for part in [&uri.repo, &uri.collection, &uri.rkey] {
            if part.is_empty() || part.contains('/') {
                return Err(Error::MalformedUri(uri.to_string()));
            }
        }
        Ok(uri)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| Error::MalformedUri(s.to_string()))?;

        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [repo, collection, rkey]
                if !repo.is_empty() && !collection.is_empty() && !rkey.is_empty() =>
            {
                Ok(Self {
                    repo: repo.to_string(),
                    collection: collection.to_string(),
                    rkey: rkey.to_string(),
                })
            }
            _ => Err(Error::MalformedUri(s.to_string())),
        }
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}/{}", SCHEME, self.repo, self.collection, self.rkey)
    }
}

impl FromStr for AtUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AtUri {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<AtUri> for String {
    fn from(uri: AtUri) -> Self {
        uri.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats() {
        let raw = "at://did:plc:abc123/com.whtwnd.blog.entry/3kq2xyz";
        let uri = AtUri::parse(raw).unwrap();
        assert_eq!(uri.repo, "did:plc:abc123");
        assert_eq!(uri.collection, "com.whtwnd.blog.entry");
        assert_eq!(uri.rkey, "3kq2xyz");
        assert_eq!(uri.to_string(), raw);
    }

    #[test]
    fn constructed_uri_parses_back() {
        let uri = AtUri::new("did:web:example.com", "app.bsky.feed.post", "abc").unwrap();
        assert_eq!(AtUri::parse(&uri.to_string()).unwrap(), uri);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in [
            "not-a-uri",
            "https://did:plc:abc/col/rkey",
            "at://did:plc:abc",
            "at://did:plc:abc/col",
            "at://did:plc:abc/col/rkey/extra",
            "at://did:plc:abc//rkey",
            "at:///col/rkey",
            "",
        ] {
            assert!(
                matches!(AtUri::parse(bad), Err(Error::MalformedUri(_))),
                "accepted {:?}",
                bad
            );
        }
        assert!(AtUri::new("did:plc:abc", "", "rkey").is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let uri: AtUri = serde_json::from_str(r#""at://did:plc:a/app.bsky.feed.post/x""#).unwrap();
        assert_eq!(uri.rkey, "x");
        assert_eq!(
            serde_json::to_string(&uri).unwrap(),
            r#""at://did:plc:a/app.bsky.feed.post/x""#
        );
        assert!(serde_json::from_str::<AtUri>(r#""at://nope""#).is_err());
    }
}
