//! Request classification for the cache agent.

use crate::api::ResourceRequest;

const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif", "bmp", "mp4", "webm",
];
const MEDIA_SEGMENTS: &[&str] = &["/images/", "/img/", "/media/"];

/// Versioned cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// App shell and other static resources.
    Static,
    Images,
    Api,
}

impl CacheTier {
    pub const ALL: [CacheTier; 3] = [CacheTier::Static, CacheTier::Images, CacheTier::Api];

    pub fn prefix(&self) -> &'static str {
        match self {
            CacheTier::Static => "static",
            CacheTier::Images => "images",
            CacheTier::Api => "api",
        }
    }

    /// `{tier}-v{version}`, e.g. `api-v1.4.0`.
    pub fn cache_name(&self, version: &str) -> String {
        format!("{}-v{version}", self.prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Non-idempotent or authentication traffic. Never cached.
    Bypass,
    /// Serve from cache, refresh in the background.
    CacheFirst,
    /// Network, falling back to the last cached response.
    NetworkFirst,
    /// Serve from cache while refreshing; wait on the network on a miss.
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn tier(&self) -> Option<CacheTier> {
        match self {
            Strategy::Bypass => None,
            Strategy::CacheFirst => Some(CacheTier::Images),
            Strategy::NetworkFirst => Some(CacheTier::Api),
            Strategy::StaleWhileRevalidate => Some(CacheTier::Static),
        }
    }
}

/// URL patterns that decide a request's strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRules {
    pub api_prefix: String,
    pub auth_path: String,
}

impl RouteRules {
    pub fn is_api(&self, path: &str) -> bool {
        let prefix = self.api_prefix.trim_end_matches('/');
        path == prefix || path.starts_with(&self.api_prefix)
    }

    pub fn is_auth(&self, path: &str) -> bool {
        let auth = self.auth_path.trim_end_matches('/');
        path == auth || path.starts_with(&format!("{auth}/"))
    }
}

fn is_media(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    if MEDIA_SEGMENTS.iter().any(|segment| lower.contains(segment)) {
        return true;
    }
    lower
        .rsplit_once('.')
        .map(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Pick the strategy for `request`.
pub fn classify(request: &ResourceRequest, rules: &RouteRules) -> Strategy {
    let path = request.path();
    if !request.is_get() || rules.is_auth(path) {
        return Strategy::Bypass;
    }
    if is_media(path) {
        return Strategy::CacheFirst;
    }
    if rules.is_api(path) {
        return Strategy::NetworkFirst;
    }
    Strategy::StaleWhileRevalidate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> RouteRules {
        RouteRules {
            api_prefix: "/api/".into(),
            auth_path: "/api/auth".into(),
        }
    }

    #[test]
    fn writes_and_auth_are_bypassed() {
        let rules = rules();
        let post = ResourceRequest::new("POST", "https://ventas.example.com/api/pedidos");
        assert_eq!(classify(&post, &rules), Strategy::Bypass);

        let login = ResourceRequest::get("https://ventas.example.com/api/auth/login");
        assert_eq!(classify(&login, &rules), Strategy::Bypass);
        let auth = ResourceRequest::get("https://ventas.example.com/api/auth");
        assert_eq!(classify(&auth, &rules), Strategy::Bypass);

        let authors = ResourceRequest::get("https://ventas.example.com/api/authors");
        assert_eq!(classify(&authors, &rules), Strategy::NetworkFirst);
    }

    #[test]
    fn resource_classes_map_to_strategies() {
        let rules = rules();
        let cases = [
            ("https://ventas.example.com/api/productos?page=1", Strategy::NetworkFirst),
            ("https://ventas.example.com/api/clientes/42", Strategy::NetworkFirst),
            ("https://ventas.example.com/images/p/42.JPG", Strategy::CacheFirst),
            ("https://cdn.example.com/media/banner", Strategy::CacheFirst),
            ("https://ventas.example.com/assets/logo.webp", Strategy::CacheFirst),
            ("https://ventas.example.com/index.html", Strategy::StaleWhileRevalidate),
            ("https://ventas.example.com/assets/app.js", Strategy::StaleWhileRevalidate),
            ("https://ventas.example.com/", Strategy::StaleWhileRevalidate),
        ];
        for (url, expected) in cases {
            assert_eq!(classify(&ResourceRequest::get(url), &rules), expected, "{url}");
        }
    }

    #[test]
    fn tiers_are_versioned() {
        assert_eq!(CacheTier::Api.cache_name("1.4.0"), "api-v1.4.0");
        assert_eq!(Strategy::CacheFirst.tier(), Some(CacheTier::Images));
        assert_eq!(Strategy::Bypass.tier(), None);
    }
}
