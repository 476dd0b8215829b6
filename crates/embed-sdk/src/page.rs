use std::fmt;

/// Logical kind of content currently shown by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PageType {
    Dashboards,
    Explore,
    Looks,
    Extensions,
    QueryVisualization,
    Reports,
    Preload,
    #[default]
    Unknown,
}

impl PageType {
    pub fn as_str(self) -> &'static str {
        match self {
            PageType::Dashboards => "dashboards",
            PageType::Explore => "explore",
            PageType::Looks => "looks",
            PageType::Extensions => "extensions",
            PageType::QueryVisualization => "query-visualization",
            PageType::Reports => "reports",
            PageType::Preload => "preload",
            PageType::Unknown => "unknown",
        }
    }

    /// Segment used when building `/embed/<segment>/<id>` urls.
    pub fn path_segment(self) -> &'static str {
        match self {
            PageType::Reports => "reporting",
            other => other.as_str(),
        }
    }

    pub fn from_segment(segment: &str) -> Self {
        match segment {
            "dashboards" => PageType::Dashboards,
            "explore" => PageType::Explore,
            "looks" => PageType::Looks,
            "extensions" => PageType::Extensions,
            "query-visualization" => PageType::QueryVisualization,
            "reports" | "reporting" => PageType::Reports,
            "preload" => PageType::Preload,
            _ => PageType::Unknown,
        }
    }

    /// `/embed/<type>/...` maps to `<type>`; anything else is unknown.
    pub fn from_url(url: &str) -> Self {
        url.split(['?', '#'])
            .next()
            .and_then(|path| path.split('/').nth(2))
            .map(PageType::from_segment)
            .unwrap_or_default()
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version of the embedded application, parsed from `lookerVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AppVersion {
    pub major: i32,
    pub minor: i32,
}

impl AppVersion {
    pub const UNKNOWN: AppVersion = AppVersion::new(-1, -1);

    pub const fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    /// `"25.1.0"` parses to 25.1; a bare `"25"` parses to 25.0.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.');
        let major = parts.next()?.parse::<i32>().ok()?;
        let minor = match parts.next() {
            Some(minor) => minor.parse::<i32>().ok()?,
            None => 0,
        };
        Some(AppVersion { major, minor })
    }

    pub fn is_at_least(&self, major: i32, minor: i32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

impl Default for AppVersion {
    fn default() -> Self {
        Self::UNKNOWN
    }
}
