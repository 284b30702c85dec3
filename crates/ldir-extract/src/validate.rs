//! Pure validators: a raw JSON candidate in, a normalized value or `None` out.
//!
//! Validators never panic and never return errors; a rejection just means the
//! caller moves on to the next candidate in the chain.

use std::sync::LazyLock;

use ldir_core::SocialPlatform;
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use url::Url;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9](?:[a-z0-9\-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9\-]*[a-z0-9])?)*\.[a-z]{2,}$")
        .unwrap()
});
static HANDLE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^@?[A-Za-z0-9_.\-]+$").unwrap());
static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

const PLACEHOLDER_EMAIL_DOMAINS: &[&str] = &[
    "example.com",
    "example.org",
    "example.net",
    "domain.com",
    "email.com",
    "test.com",
    "sentry.io",
    "wixpress.com",
];
const PLACEHOLDER_HANDLES: &[&str] = &[
    "none", "null", "nil", "na", "undefined", "unknown", "tbd", "test", "example", "username", "handle",
];
const NOREPLY_LOCAL_PARTS: &[&str] = &["noreply", "no-reply", "donotreply", "do-not-reply"];
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "avif"];
const IMAGE_CDN_DOMAINS: &[&str] = &[
    "cloudinary.com",
    "cloudfront.net",
    "googleusercontent.com",
    "wixstatic.com",
    "squarespace-cdn.com",
    "shopify.com",
    "imgix.net",
    "fbcdn.net",
    "cdninstagram.com",
];
/// Any host containing one of these labels is a directory, map, or social page, not a website.
const NON_WEBSITE_LABELS: &[&str] = &[
    "google",
    "facebook",
    "instagram",
    "twitter",
    "tiktok",
    "youtube",
    "linkedin",
    "tripadvisor",
    "talabat",
    "deliveroo",
];
const NON_WEBSITE_DOMAINS: &[&str] = &["goo.gl", "g.page", "x.com", "fb.com", "booking.com", "wa.me", "linktr.ee"];

struct PlatformRules {
    hosts: &'static [&'static str],
    base_url: &'static str,
    /// First path segments that never point at a profile.
    skip_segments: &'static [&'static str],
    /// Pages whose profile identity lives in the `id` query parameter.
    id_query_pages: &'static [&'static str],
}

const INSTAGRAM: PlatformRules = PlatformRules {
    hosts: &["instagram.com", "www.instagram.com"],
    base_url: "https://instagram.com/",
    skip_segments: &["p", "reel", "reels", "stories", "explore", "accounts", "tv", "share", "sharer"],
    id_query_pages: &[],
};
const FACEBOOK: PlatformRules = PlatformRules {
    hosts: &["facebook.com", "www.facebook.com", "m.facebook.com", "fb.com"],
    base_url: "https://facebook.com/",
    skip_segments: &[
        "sharer",
        "sharer.php",
        "share",
        "dialog",
        "plugins",
        "login",
        "events",
        "groups",
        "watch",
        "photo",
        "photos",
        "marketplace",
        "tr",
    ],
    id_query_pages: &["profile.php"],
};
const TWITTER: PlatformRules = PlatformRules {
    hosts: &["twitter.com", "www.twitter.com", "x.com", "www.x.com"],
    base_url: "https://x.com/",
    skip_segments: &["intent", "share", "hashtag", "search", "i", "home", "login"],
    id_query_pages: &[],
};
const TIKTOK: PlatformRules = PlatformRules {
    hosts: &["tiktok.com", "www.tiktok.com"],
    base_url: "https://www.tiktok.com/@",
    skip_segments: &["tag", "music", "discover", "embed", "share"],
    id_query_pages: &[],
};
const YOUTUBE: PlatformRules = PlatformRules {
    hosts: &["youtube.com", "www.youtube.com", "m.youtube.com"],
    base_url: "https://www.youtube.com/@",
    skip_segments: &["watch", "embed", "results", "shorts", "playlist", "share"],
    id_query_pages: &[],
};
const LINKEDIN: PlatformRules = PlatformRules {
    hosts: &["linkedin.com", "www.linkedin.com"],
    base_url: "https://www.linkedin.com/company/",
    skip_segments: &["sharearticle", "sharing", "share", "feed", "login", "posts"],
    id_query_pages: &[],
};

fn rules_for(platform: SocialPlatform) -> &'static PlatformRules {
    match platform {
        SocialPlatform::Instagram => &INSTAGRAM,
        SocialPlatform::Facebook => &FACEBOOK,
        SocialPlatform::Twitter => &TWITTER,
        SocialPlatform::Tiktok => &TIKTOK,
        SocialPlatform::Youtube => &YOUTUBE,
        SocialPlatform::Linkedin => &LINKEDIN,
    }
}

fn trimmed_str(raw: &JsonValue) -> Option<&str> {
    raw.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Leftovers from scraping markdown links, e.g. `https://x.com/a](https://x.com/a)`.
pub fn has_markdown_artifacts(value: &str) -> bool {
    value.contains(['[', ']', '(', ')'])
}

pub fn email(raw: &JsonValue) -> Option<String> {
    let lowered = trimmed_str(raw)?.to_ascii_lowercase();
    let value = lowered.strip_prefix("mailto:").unwrap_or(&lowered);
    let value = value.split('?').next().unwrap_or(value).trim();
    if !EMAIL_RE.is_match(value) {
        return None;
    }
    let (local, domain) = value.rsplit_once('@')?;
    let placeholder_domain = PLACEHOLDER_EMAIL_DOMAINS
        .iter()
        .any(|d| domain == *d || domain.ends_with(&format!(".{d}")));
    if NOREPLY_LOCAL_PARTS.contains(&local) || placeholder_domain {
        return None;
    }
    // `logo@2x.png` passes the shape check.
    if IMAGE_EXTENSIONS.iter().any(|ext| domain.ends_with(&format!(".{ext}"))) {
        return None;
    }
    Some(value.to_string())
}

/// Profile URL for `platform`, or a canonical URL built from a bare handle.
pub fn social_url(platform: SocialPlatform, raw: &JsonValue) -> Option<String> {
    let value = trimmed_str(raw)?;
    if has_markdown_artifacts(value) {
        return None;
    }
    let rules = rules_for(platform);
    if value.starts_with("http") {
        profile_url(rules, value)
    } else {
        handle_url(rules, value)
    }
}

/// Like [`social_url`] but absolute URLs only. For crawled page links, where a
/// bare word is a relative path rather than a handle.
pub fn social_link(platform: SocialPlatform, raw: &JsonValue) -> Option<String> {
    let value = trimmed_str(raw)?;
    if !value.starts_with("http") || has_markdown_artifacts(value) {
        return None;
    }
    profile_url(rules_for(platform), value)
}

fn profile_url(rules: &PlatformRules, value: &str) -> Option<String> {
    let url = Url::parse(value).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    if !rules.hosts.contains(&host.as_str()) {
        return None;
    }
    let first_segment = url.path_segments()?.find(|s| !s.is_empty())?.to_ascii_lowercase();
    if rules.skip_segments.contains(&first_segment.as_str()) {
        return None;
    }
    let path = url.path().trim_end_matches('/');
    if rules.id_query_pages.contains(&first_segment.as_str()) {
        let id = url
            .query_pairs()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))?;
        return Some(format!("{}://{}{}?id={}", url.scheme(), host, path, id));
    }
    Some(format!("{}://{}{}", url.scheme(), host, path))
}

fn handle_url(rules: &PlatformRules, value: &str) -> Option<String> {
    if !HANDLE_RE.is_match(value) {
        return None;
    }
    let handle = value.trim_start_matches('@');
    let lowered = handle.to_ascii_lowercase();
    if !handle.chars().any(|c| c.is_ascii_alphanumeric())
        || [".com", ".net", ".html", ".htm", ".php"].iter().any(|ext| lowered.ends_with(ext))
        || PLACEHOLDER_HANDLES.contains(&lowered.as_str())
        || rules.skip_segments.contains(&lowered.as_str())
    {
        return None;
    }
    Some(format!("{}{}", rules.base_url, handle))
}

/// `$`-strings map to their length (capped at 4); currency amounts are bucketed.
pub fn price_level(raw: &JsonValue) -> Option<i64> {
    match raw {
        JsonValue::Number(n) => n.as_i64().filter(|v| (1..=4).contains(v)),
        JsonValue::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if s.chars().all(|c| c == '$') {
                return Some((s.len() as i64).min(4));
            }
            let amount: f64 = NUMBER_RE.find(s)?.as_str().parse().ok()?;
            price_bucket(amount)
        }
        _ => None,
    }
}

fn price_bucket(amount: f64) -> Option<i64> {
    if !amount.is_finite() || amount <= 0.0 {
        None
    } else if amount < 3.0 {
        Some(1)
    } else if amount < 6.0 {
        Some(2)
    } else if amount < 10.0 {
        Some(3)
    } else {
        Some(4)
    }
}

pub fn image_url(raw: &JsonValue) -> Option<String> {
    let value = trimmed_str(raw)?;
    if !value.starts_with("http") || has_markdown_artifacts(value) {
        return None;
    }
    let url = Url::parse(value).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let path = url.path().to_ascii_lowercase();
    let filename = path.rsplit('/').next().unwrap_or_default();
    if filename.contains("favicon") || filename.contains("touch-icon") {
        return None;
    }
    let has_image_ext = IMAGE_EXTENSIONS
        .iter()
        .any(|ext| filename.ends_with(&format!(".{ext}")));
    let on_cdn = IMAGE_CDN_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")));
    (has_image_ext || on_cdn).then(|| value.to_string())
}

pub fn website(raw: &JsonValue) -> Option<String> {
    let value = trimmed_str(raw)?;
    if !value.starts_with("http") || has_markdown_artifacts(value) {
        return None;
    }
    let url = Url::parse(value).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    if host.split('.').any(|label| NON_WEBSITE_LABELS.contains(&label))
        || NON_WEBSITE_DOMAINS
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    {
        return None;
    }
    Some(value.trim_end_matches('/').to_string())
}

pub fn phone(raw: &JsonValue) -> Option<String> {
    let text = match raw {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    let text = text.strip_prefix("tel:").unwrap_or(&text).trim();
    if text.chars().any(|c| c.is_alphabetic()) {
        return None;
    }
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    if !(7..=15).contains(&digits.len()) {
        return None;
    }
    if text.starts_with('+') {
        Some(format!("+{digits}"))
    } else {
        Some(digits)
    }
}

const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

fn weekday(name: &str) -> Option<&'static str> {
    let lowered = name.trim().trim_end_matches('.').to_ascii_lowercase();
    if lowered.len() < 3 {
        return None;
    }
    WEEKDAYS.into_iter().find(|d| d.starts_with(lowered.as_str()))
}

/// Opening hours as an object keyed by lowercase weekday.
pub fn hours(raw: &JsonValue) -> Option<JsonValue> {
    let mut out = Map::new();
    let mut put = |day: &str, hours: &JsonValue| {
        if let (Some(day), Some(hours)) = (weekday(day), trimmed_str(hours)) {
            out.entry(day).or_insert_with(|| JsonValue::String(hours.to_string()));
        }
    };
    match raw {
        JsonValue::Array(items) => {
            for item in items {
                if let (Some(day), Some(hours)) = (item.get("day").and_then(JsonValue::as_str), item.get("hours")) {
                    put(day, hours);
                }
            }
        }
        JsonValue::Object(map) => {
            for (day, hours) in map {
                put(day, hours);
            }
        }
        _ => return None,
    }
    (!out.is_empty()).then_some(JsonValue::Object(out))
}

fn number_like(raw: &JsonValue) -> Option<f64> {
    match raw {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

/// Star rating in `(0, 5]`, rounded to one decimal.
pub fn rating(raw: &JsonValue) -> Option<f64> {
    let value = number_like(raw)?;
    (value > 0.0 && value <= 5.0).then(|| (value * 10.0).round() / 10.0)
}

pub fn review_count(raw: &JsonValue) -> Option<i64> {
    match raw {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
    .filter(|v| *v > 0)
}
