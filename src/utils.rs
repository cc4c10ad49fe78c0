use crate::{OptimizationSettings, ScrapeError};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

/// Decides which sub-resources a page may load
///
/// Matching is on the browser's resource type name, case-insensitive
/// (`image`, `stylesheet`, `font`, `media`, ...).
#[derive(Debug, Clone)]
pub struct ResourceFilter {
    blocked_resources: HashSet<String>,
}

impl ResourceFilter {
    pub fn new<I, S>(resource_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            blocked_resources: resource_types
                .into_iter()
                .map(|kind| kind.as_ref().trim().to_ascii_lowercase())
                .filter(|kind| !kind.is_empty())
                .collect(),
        }
    }

    pub fn from_settings(settings: &OptimizationSettings) -> Self {
        Self::new(&settings.blocked_resource_types)
    }

    pub fn should_block(&self, resource_type: &str) -> bool {
        self.blocked_resources
            .contains(&resource_type.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.blocked_resources.is_empty()
    }

    pub fn blocked_resources(&self) -> &HashSet<String> {
        &self.blocked_resources
    }
}

impl Default for ResourceFilter {
    fn default() -> Self {
        Self::from_settings(&OptimizationSettings::default())
    }
}

/// Headers a regular desktop browser sends with every navigation.
pub fn standard_headers() -> Vec<(&'static str, &'static str)> {
    vec![
        ("Accept-Language", "en-US,en;q=0.9"),
        ("Accept-Encoding", "gzip, deflate, br"),
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
        ("Connection", "keep-alive"),
        ("Upgrade-Insecure-Requests", "1"),
    ]
}

pub fn random_user_agent(user_agents: &[String]) -> Option<&str> {
    user_agents
        .choose(&mut rand::thread_rng())
        .map(String::as_str)
}

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Accepts absolute http(s) URLs with a host.
pub fn validate_url(url: &str) -> Result<Url, ScrapeError> {
    let parsed = Url::parse(url.trim()).map_err(|e| {
        ScrapeError::Validation(format!(
            "Invalid URL '{url}': {e}. URL must be a valid HTTP/HTTPS address"
        ))
    })?;

    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        "http" | "https" => Err(ScrapeError::Validation(format!("Invalid URL '{url}': missing host"))),
        scheme => Err(ScrapeError::Validation(format!(
            "Invalid URL '{url}': unsupported scheme '{scheme}'. URL must be a valid HTTP/HTTPS address"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test.txt"), "test.txt");
        assert_eq!(sanitize_filename("test/file.txt"), "test_file.txt");
        assert_eq!(sanitize_filename("test:file?.txt"), "test_file_.txt");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(102400), "100.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://example.com/path?q=1").is_ok());
        assert!(matches!(
            validate_url("ftp://example.com"),
            Err(ScrapeError::Validation(_))
        ));
        assert!(validate_url("invalid-url").is_err());
        assert!(validate_url("javascript:alert(1)").is_err());
        assert!(validate_url("").is_err());
    }

    #[test]
    fn test_resource_filter_defaults() {
        let filter = ResourceFilter::default();
        assert!(filter.should_block("image"));
        assert!(filter.should_block("Stylesheet"));
        assert!(filter.should_block("font"));
        assert!(filter.should_block("media"));
        assert!(!filter.should_block("document"));
        assert!(!filter.should_block("script"));
    }

    #[test]
    fn test_resource_filter_custom() {
        let filter = ResourceFilter::new(["Script", " ", "xhr"]);
        assert_eq!(filter.blocked_resources().len(), 2);
        assert!(filter.should_block("script"));
        assert!(!filter.should_block("image"));
        assert!(ResourceFilter::new(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_user_agent_rotation() {
        let agents = crate::default_user_agents();
        let picked = random_user_agent(&agents).unwrap();
        assert!(agents.iter().any(|agent| agent == picked));
        assert!(random_user_agent(&[]).is_none());
    }

    #[test]
    fn test_standard_headers() {
        let headers = standard_headers();
        assert_eq!(headers.len(), 5);
        assert!(headers.iter().any(|(name, _)| *name == "Accept-Language"));
        assert!(headers
            .iter()
            .any(|(name, value)| *name == "Upgrade-Insecure-Requests" && *value == "1"));
    }
}
