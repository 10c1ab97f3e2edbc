pub use uri::{InvalidUriError, Uri};

mod uri {
    use std::fmt::Display;
    use std::str::FromStr;

    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub struct InvalidUriError(String);

    impl Display for InvalidUriError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl From<http::uri::InvalidUri> for InvalidUriError {
        fn from(value: http::uri::InvalidUri) -> Self {
            InvalidUriError(value.to_string())
        }
    }

    /// An absolute `http(s)` URI used as the root of remote API paths.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct Uri(http::Uri);

    impl Uri {
        pub fn new(uri: http::Uri) -> Result<Self, InvalidUriError> {
            let absolute =
                matches!(uri.scheme_str(), Some("http") | Some("https")) && uri.host().is_some();
            if !absolute {
                return Err(InvalidUriError(format!(
                    "expected an absolute http(s) URI, got '{uri}'"
                )));
            }
            Ok(Self(uri))
        }

        /// Append `path` to this URI, keeping any path prefix it already has.
        ///
        /// Query strings on the base URI are discarded.
        pub fn join(&self, path: &str) -> String {
            let scheme = self.0.scheme_str().unwrap_or("http");
            let authority = self.0.authority().map(|a| a.as_str()).unwrap_or_default();
            let prefix = self.0.path().trim_end_matches('/');
            let path = path.trim_start_matches('/');
            format!("{scheme}://{authority}{prefix}/{path}")
        }
    }

    impl Display for Uri {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for Uri {
        type Err = InvalidUriError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Self::new(http::Uri::from_str(s)?)
        }
    }

    impl TryFrom<String> for Uri {
        type Error = InvalidUriError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::new(http::Uri::from_maybe_shared(value)?)
        }
    }

    impl From<Uri> for http::Uri {
        fn from(value: Uri) -> Self {
            value.0
        }
    }

    impl Serialize for Uri {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            serializer.serialize_str(&self.to_string())
        }
    }

    impl<'de> Deserialize<'de> for Uri {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        }
    }

}
