//! Operator-supplied locations.
//!
//! A location is either a cloud URL or a local path. Cloud URLs are turned into a [`StoreSpec`]
//! plus a handler-relative path (`bucket/key...`); anything that is not recognized as a cloud URL
//! is a local filesystem path.

use std::sync::{Arc, LazyLock};

use anyhow::Context;
use common::handler::{FilesystemHandler, Handler, ObjectStoreHandler, StoreKind, StoreSpec};

struct Pattern {
    regex: regex::Regex,
    kind: StoreKind,
    emulator: bool,
}

fn pattern(regex: &str, kind: StoreKind, emulator: bool) -> Option<Pattern> {
    match regex::Regex::new(regex) {
        Ok(regex) => Some(Pattern {
            regex,
            kind,
            emulator,
        }),
        Err(error) => {
            tracing::error!("bad location pattern {:?}: {}", regex, &error);
            None
        }
    }
}

// every pattern names its captures: account, region, bucket and rest
static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    [
        pattern(r"^s3://(?P<bucket>[^/]+)(?P<rest>/.*)?$", StoreKind::S3, false),
        pattern(
            r"^https://(?P<bucket>[^/]+)\.s3(?:[.-](?P<region>[a-z0-9-]+))?\.amazonaws\.com(?P<rest>/.*)?$",
            StoreKind::S3,
            false,
        ),
        pattern(
            r"^https://s3(?:[.-](?P<region>[a-z0-9-]+))?\.amazonaws\.com/(?P<bucket>[^/]+)(?P<rest>/.*)?$",
            StoreKind::S3,
            false,
        ),
        pattern(r"^gs://(?P<bucket>[^/]+)(?P<rest>/.*)?$", StoreKind::Gcs, false),
        pattern(r"^az://(?P<bucket>[^/]+)(?P<rest>/.*)?$", StoreKind::Azure, false),
        pattern(
            r"^https://(?P<account>[^./]+)\.blob\.core\.windows\.net/(?P<bucket>[^/]+)(?P<rest>/.*)?$",
            StoreKind::Azure,
            false,
        ),
        pattern(
            r"^http://127\.0\.0\.1:10000/(?P<account>[^/]+)/(?P<bucket>[^/]+)(?P<rest>/.*)?$",
            StoreKind::Azure,
            true,
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
});

/// Where a location points, before any client is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Local(String),
    Store { spec: StoreSpec, path: String },
}

impl Address {
    #[must_use]
    pub fn parse(location: &str) -> Self {
        for pattern in PATTERNS.iter() {
            let Some(captures) = pattern.regex.captures(location) else {
                continue;
            };
            let Some(bucket) = captures.name("bucket") else {
                continue;
            };
            let mut spec = StoreSpec::new(pattern.kind, bucket.as_str());
            spec.emulator = pattern.emulator;
            spec.account = captures.name("account").map(|account| account.as_str().to_string());
            if let Some(region) = captures.name("region") {
                spec.options
                    .push(("aws_region".to_string(), region.as_str().to_string()));
            }
            let rest = captures.name("rest").map_or("/", |rest| rest.as_str());
            let path = format!("{}{}", bucket.as_str(), rest);
            return Address::Store { spec, path };
        }
        Address::Local(location.to_string())
    }

    /// Path the handler expects for `location`.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Address::Local(path) | Address::Store { path, .. } => path,
        }
    }
}

/// A handler together with the handler-relative path it was opened for.
pub struct Endpoint {
    pub handler: Arc<dyn Handler>,
    pub path: String,
    local: bool,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("origin", &self.handler.origin())
            .field("path", &self.path)
            .finish()
    }
}

impl Endpoint {
    /// Builds the handler for `location`. `options` are backend config keys for cloud stores and
    /// override the environment.
    pub fn open(location: &str, options: &[(String, String)]) -> anyhow::Result<Self> {
        match Address::parse(location) {
            Address::Local(path) => Ok(Self {
                handler: Arc::new(FilesystemHandler::new()),
                path,
                local: true,
            }),
            Address::Store { mut spec, path } => {
                for (key, value) in options {
                    spec.options.retain(|(existing, _)| existing != key);
                    spec.options.push((key.clone(), value.clone()));
                }
                let handler = ObjectStoreHandler::from_spec(&spec)
                    .with_context(|| format!("cannot connect to {location:?}"))?;
                Ok(Self {
                    handler: Arc::new(handler),
                    path,
                    local: false,
                })
            }
        }
    }

    /// Collection path for a new collection `name` under this endpoint.
    ///
    /// Local collections are directories below the endpoint; cloud collections are named
    /// directly.
    #[must_use]
    pub fn collection_path(&self, name: &str) -> String {
        if !self.local {
            return name.to_string();
        }
        let root = self.path.trim_end_matches('/');
        if root.is_empty() && self.path.starts_with('/') {
            format!("/{name}")
        } else if root.is_empty() {
            name.to_string()
        } else {
            format!("{root}/{name}")
        }
    }
}

/// Parses a `KEY=VALUE` backend option.
pub fn parse_option(option: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = option
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got {option:?}"))?;
    if key.is_empty() {
        anyhow::bail!("empty option name in {option:?}");
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(location: &str) -> (StoreSpec, String) {
        match Address::parse(location) {
            Address::Store { spec, path } => (spec, path),
            Address::Local(path) => panic!("{path:?} was parsed as a local path"),
        }
    }

    #[test]
    fn detects_s3_urls() {
        let (spec, path) = store("s3://bucket/dir/a.txt");
        assert_eq!(spec.kind, StoreKind::S3);
        assert_eq!(spec.bucket, "bucket");
        assert_eq!(path, "bucket/dir/a.txt");
        let (spec, path) = store("https://bucket.s3.eu-west-1.amazonaws.com/dir/");
        assert_eq!(spec.bucket, "bucket");
        assert_eq!(
            spec.options,
            vec![("aws_region".to_string(), "eu-west-1".to_string())]
        );
        assert_eq!(path, "bucket/dir/");
        let (spec, path) = store("https://s3.amazonaws.com/bucket");
        assert_eq!(spec.bucket, "bucket");
        assert!(spec.options.is_empty());
        assert_eq!(path, "bucket/");
    }

    #[test]
    fn detects_gcs_and_azure_urls() {
        let (spec, path) = store("gs://bucket/a");
        assert_eq!((spec.kind, path.as_str()), (StoreKind::Gcs, "bucket/a"));
        assert_eq!(Address::parse("gs://bucket").path(), "bucket/");
        let (spec, _) = store("az://container/");
        assert_eq!(spec.kind, StoreKind::Azure);
        assert_eq!(spec.account, None);
        let (spec, path) = store("https://acct.blob.core.windows.net/container/x/y.bin");
        assert_eq!(spec.account.as_deref(), Some("acct"));
        assert_eq!(spec.bucket, "container");
        assert_eq!(path, "container/x/y.bin");
        assert!(!spec.emulator);
        let (spec, path) = store("http://127.0.0.1:10000/devstoreaccount1/container/");
        assert!(spec.emulator);
        assert_eq!(spec.account.as_deref(), Some("devstoreaccount1"));
        assert_eq!(path, "container/");
    }

    #[test]
    fn everything_else_is_local() {
        for location in ["/tmp/data/", "relative/file.txt", "file.txt", "ftp-like:dir/"] {
            let address = Address::parse(location);
            assert_eq!(address, Address::Local(location.to_string()));
            assert_eq!(address.path(), location);
        }
    }

    #[test]
    fn local_collection_paths() -> anyhow::Result<()> {
        let endpoint = Endpoint::open("/tmp/root/", &[])?;
        assert_eq!(endpoint.collection_path("new"), "/tmp/root/new");
        let endpoint = Endpoint::open("/", &[])?;
        assert_eq!(endpoint.collection_path("new"), "/new");
        let endpoint = Endpoint::open("base", &[])?;
        assert_eq!(endpoint.collection_path("new"), "base/new");
        Ok(())
    }

    #[test]
    fn options_need_a_key() {
        assert_eq!(
            parse_option("aws_region=us-east-2").unwrap(),
            ("aws_region".to_string(), "us-east-2".to_string())
        );
        assert!(parse_option("novalue").is_err());
        assert!(parse_option("=x").is_err());
    }
}
