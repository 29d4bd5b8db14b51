//! URL and host filters applied at Begin

/// Recognizes calls to the SDK's own endpoints
///
/// Tracking these would feed every telemetry upload back into the pipeline
/// as a new dependency.
#[derive(Debug, Clone, Default)]
pub struct IngestionUrlFilter {
    prefixes: Vec<String>,
}

impl IngestionUrlFilter {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let prefixes = endpoints
            .into_iter()
            .map(|e| e.as_ref().trim().trim_end_matches('/').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { prefixes }
    }

    /// Whether `url` points at one of the SDK's own endpoints
    pub fn is_ingestion(&self, url: &str) -> bool {
        let url = url.trim().to_ascii_lowercase();
        self.prefixes.iter().any(|prefix| url.starts_with(prefix.as_str()))
    }
}

/// Hosts that never receive correlation headers
///
/// Entries are sanitized on insert: a scheme, port, or path is stripped so
/// `https://Storage.Example.com/x` and `storage.example.com` are the same
/// entry. A host matches when it contains any entry, so `core.windows.net`
/// excludes every storage account under it.
#[derive(Debug, Clone, Default)]
pub struct SanitizedHostList {
    hosts: Vec<String>,
}

impl SanitizedHostList {
    pub fn new() -> Self {
        Self::default()
    }

    fn sanitize(entry: &str) -> Option<String> {
        let entry = entry.trim();
        let without_scheme = match entry.find("://") {
            Some(i) => &entry[i + 3..],
            None => entry,
        };
        let host = without_scheme
            .split(['/', '?', '#'])
            .next()
            .unwrap_or_default();
        let host = host.rsplit_once(':').map_or(host, |(h, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) {
                h
            } else {
                host
            }
        });

        let host = host.to_ascii_lowercase();
        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    }

    /// Add an entry; returns `false` if it was empty or already present
    pub fn insert(&mut self, entry: &str) -> bool {
        match Self::sanitize(entry) {
            Some(host) if !self.hosts.contains(&host) => {
                self.hosts.push(host);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    /// Whether `host` falls under any entry
    pub fn matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.hosts.iter().any(|entry| host.contains(entry.as_str()))
    }
}

impl<S: AsRef<str>> FromIterator<S> for SanitizedHostList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut list = Self::new();
        for entry in iter {
            list.insert(entry.as_ref());
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingestion_filter() {
        let filter = IngestionUrlFilter::new([
            "https://dc.services.visualstudio.com/v2/track",
            "https://dc.services.visualstudio.com/",
        ]);
        assert!(filter.is_ingestion("https://DC.services.visualstudio.com/v2/track"));
        assert!(filter.is_ingestion(
            "https://dc.services.visualstudio.com/api/profiles/abc/appId"
        ));
        assert!(!filter.is_ingestion("https://example.com/v2/track"));
    }

    #[test]
    fn test_ingestion_filter_ignores_empty_endpoints() {
        let filter = IngestionUrlFilter::new(["", "  "]);
        assert!(!filter.is_ingestion("https://example.com/"));
    }

    #[test]
    fn test_host_list_sanitizes_entries() {
        let list: SanitizedHostList = [
            "https://Storage.Example.com:443/path?q=1",
            "storage.example.com",
            "",
            "bing.com",
        ]
        .into_iter()
        .collect();

        assert_eq!(list.len(), 2);
        assert_eq!(
            list.iter().collect::<Vec<_>>(),
            vec!["storage.example.com", "bing.com"]
        );
    }

    #[test]
    fn test_host_list_matches_substrings() {
        let list: SanitizedHostList = ["core.windows.net", "bing.com"].into_iter().collect();

        assert!(list.matches("myaccount.blob.core.windows.net"));
        assert!(list.matches("WWW.BING.COM"));
        assert!(!list.matches("example.com"));
    }
}
