//! Field extractors: one declarative priority chain per output column.
//!
//! Each chain is an ordered list of candidate JSON paths into the raw scrape
//! blobs. Candidates are probed in order and the first value a validator
//! accepts wins.

pub mod validate;

use ldir_core::{ExtractionResult, FieldValue, Listing, SocialPlatform, Source, TargetField};
use serde_json::Value as JsonValue;
use tracing::debug;

pub const CRATE_NAME: &str = "ldir-extract";

/// Confidence assumed for AI output that does not report one.
pub const DEFAULT_AI_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Confidence {
    Fixed(f64),
    /// Taken from the blob's top-level `confidence` key.
    Reported,
}

impl Confidence {
    fn resolve(self, blob: &JsonValue) -> f64 {
        match self {
            Confidence::Fixed(v) => v,
            Confidence::Reported => blob
                .get("confidence")
                .and_then(JsonValue::as_f64)
                .unwrap_or(DEFAULT_AI_CONFIDENCE),
        }
    }
}

#[derive(Clone, Copy)]
pub struct Candidate {
    pub source: Source,
    pub path: &'static [&'static str],
    pub confidence: Confidence,
    /// Replaces the rule's validator for this candidate only.
    pub validate: Option<Validator>,
}

impl Candidate {
    pub fn label(&self) -> String {
        format!("{}.{}", self.source.blob_name(), self.path.join("."))
    }
}

pub type Validator = fn(&JsonValue) -> Option<FieldValue>;

const fn apify(path: &'static [&'static str], confidence: f64) -> Candidate {
    Candidate {
        source: Source::Apify,
        path,
        confidence: Confidence::Fixed(confidence),
        validate: None,
    }
}

const fn firecrawl(path: &'static [&'static str], confidence: f64) -> Candidate {
    Candidate {
        source: Source::Firecrawl,
        path,
        confidence: Confidence::Fixed(confidence),
        validate: None,
    }
}

const fn ai(path: &'static [&'static str]) -> Candidate {
    Candidate {
        source: Source::Ai,
        path,
        confidence: Confidence::Reported,
        validate: None,
    }
}


pub struct FieldRule {
    pub field: TargetField,
    pub candidates: &'static [Candidate],
    pub validate: Validator,
    /// Try each element of an array candidate in turn instead of handing the array to the validator.
    pub spread_arrays: bool,
}

fn text(value: Option<String>) -> Option<FieldValue> {
    value.map(FieldValue::Text)
}

fn email_value(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::email(raw))
}

fn phone_value(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::phone(raw))
}

fn website_value(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::website(raw))
}

fn price_level_value(raw: &JsonValue) -> Option<FieldValue> {
    validate::price_level(raw).map(FieldValue::Integer)
}

fn hours_value(raw: &JsonValue) -> Option<FieldValue> {
    validate::hours(raw).map(FieldValue::Json)
}

fn image_value(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::image_url(raw))
}

fn rating_value(raw: &JsonValue) -> Option<FieldValue> {
    validate::rating(raw).map(FieldValue::Decimal)
}

fn review_count_value(raw: &JsonValue) -> Option<FieldValue> {
    validate::review_count(raw).map(FieldValue::Integer)
}

fn instagram_value(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_url(SocialPlatform::Instagram, raw))
}

fn facebook_value(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_url(SocialPlatform::Facebook, raw))
}

fn twitter_value(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_url(SocialPlatform::Twitter, raw))
}

fn tiktok_value(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_url(SocialPlatform::Tiktok, raw))
}

fn youtube_value(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_url(SocialPlatform::Youtube, raw))
}

fn linkedin_value(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_url(SocialPlatform::Linkedin, raw))
}

const PAGE_LINKS: &[&str] = &["website_scrape", "links"];

/// Crawled `<a href>` values: absolute profile URLs only, never bare handles.
const fn page_links(validate: Validator) -> Candidate {
    Candidate {
        source: Source::Firecrawl,
        path: PAGE_LINKS,
        confidence: Confidence::Fixed(0.6),
        validate: Some(validate),
    }
}

fn instagram_link(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_link(SocialPlatform::Instagram, raw))
}

fn facebook_link(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_link(SocialPlatform::Facebook, raw))
}

fn twitter_link(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_link(SocialPlatform::Twitter, raw))
}

fn tiktok_link(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_link(SocialPlatform::Tiktok, raw))
}

fn youtube_link(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_link(SocialPlatform::Youtube, raw))
}

fn linkedin_link(raw: &JsonValue) -> Option<FieldValue> {
    text(validate::social_link(SocialPlatform::Linkedin, raw))
}

/// Canonical priority table. Structured scrape fields come before crawled free text.
pub static FIELD_RULES: &[FieldRule] = &[
    FieldRule {
        field: TargetField::Email,
        candidates: &[
            firecrawl(&["operational", "email"], 0.9),
            firecrawl(&["website_scrape", "emails"], 0.7),
            apify(&["email"], 0.8),
            apify(&["emails"], 0.8),
        ],
        validate: email_value,
        spread_arrays: true,
    },
    FieldRule {
        field: TargetField::Phone,
        candidates: &[
            apify(&["phone"], 0.9),
            apify(&["phoneUnformatted"], 0.9),
            firecrawl(&["operational", "phone"], 0.8),
        ],
        validate: phone_value,
        spread_arrays: true,
    },
    FieldRule {
        field: TargetField::Website,
        candidates: &[
            apify(&["website"], 0.9),
            firecrawl(&["website_scrape", "metadata", "sourceURL"], 0.7),
        ],
        validate: website_value,
        spread_arrays: true,
    },
    FieldRule {
        field: TargetField::PriceLevel,
        candidates: &[
            apify(&["price"], 0.9),
            firecrawl(&["booking", "price_range"], 0.7),
            ai(&["price_level"]),
        ],
        validate: price_level_value,
        spread_arrays: false,
    },
    FieldRule {
        field: TargetField::Hours,
        candidates: &[
            apify(&["openingHours"], 0.9),
            firecrawl(&["operational", "hours"], 0.8),
        ],
        validate: hours_value,
        spread_arrays: false,
    },
    FieldRule {
        field: TargetField::Instagram,
        candidates: &[
            firecrawl(&["social_media", "instagram"], 0.85),
            apify(&["instagrams"], 0.8),
            apify(&["instagram"], 0.8),
            page_links(instagram_link),
        ],
        validate: instagram_value,
        spread_arrays: true,
    },
    FieldRule {
        field: TargetField::Facebook,
        candidates: &[
            firecrawl(&["social_media", "facebook"], 0.85),
            apify(&["facebooks"], 0.8),
            apify(&["facebook"], 0.8),
            page_links(facebook_link),
        ],
        validate: facebook_value,
        spread_arrays: true,
    },
    FieldRule {
        field: TargetField::Twitter,
        candidates: &[
            firecrawl(&["social_media", "twitter"], 0.85),
            apify(&["twitters"], 0.8),
            apify(&["twitter"], 0.8),
            page_links(twitter_link),
        ],
        validate: twitter_value,
        spread_arrays: true,
    },
    FieldRule {
        field: TargetField::Tiktok,
        candidates: &[
            firecrawl(&["social_media", "tiktok"], 0.85),
            apify(&["tiktoks"], 0.8),
            apify(&["tiktok"], 0.8),
            page_links(tiktok_link),
        ],
        validate: tiktok_value,
        spread_arrays: true,
    },
    FieldRule {
        field: TargetField::Youtube,
        candidates: &[
            firecrawl(&["social_media", "youtube"], 0.85),
            apify(&["youtubes"], 0.8),
            apify(&["youtube"], 0.8),
            page_links(youtube_link),
        ],
        validate: youtube_value,
        spread_arrays: true,
    },
    FieldRule {
        field: TargetField::Linkedin,
        candidates: &[
            firecrawl(&["social_media", "linkedin"], 0.85),
            apify(&["linkedIns"], 0.8),
            apify(&["linkedin"], 0.8),
            page_links(linkedin_link),
        ],
        validate: linkedin_value,
        spread_arrays: true,
    },
    FieldRule {
        field: TargetField::LogoImage,
        candidates: &[
            firecrawl(&["website_scrape", "metadata", "msapplication-TileImage"], 0.85),
            firecrawl(&["website_scrape", "metadata", "og:image"], 0.8),
            firecrawl(&["website_scrape", "metadata", "ogImage"], 0.8),
            firecrawl(&["website_scrape", "metadata", "twitter:image"], 0.75),
        ],
        validate: image_value,
        spread_arrays: true,
    },
    FieldRule {
        field: TargetField::Rating,
        candidates: &[
            apify(&["totalScore"], 0.9),
            firecrawl(&["booking", "rating"], 0.7),
        ],
        validate: rating_value,
        spread_arrays: false,
    },
    FieldRule {
        field: TargetField::ReviewCount,
        candidates: &[
            apify(&["reviewsCount"], 0.9),
            firecrawl(&["booking", "review_count"], 0.7),
        ],
        validate: review_count_value,
        spread_arrays: false,
    },
];

pub fn rule_for(field: TargetField) -> Option<&'static FieldRule> {
    FIELD_RULES.iter().find(|r| r.field == field)
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// Outcome of walking one field's chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub result: Option<ExtractionResult>,
    /// Candidate values a validator turned down.
    pub rejected: usize,
    /// Candidates skipped for falling under the confidence threshold.
    pub low_confidence: usize,
}

pub fn extract(listing: &Listing, field: TargetField, min_confidence: f64) -> Extraction {
    let mut outcome = Extraction::default();
    let Some(rule) = rule_for(field) else {
        return outcome;
    };

    for candidate in rule.candidates {
        let Some(blob) = listing.blob(candidate.source) else {
            continue;
        };
        let Some(raw) = json_path(blob, candidate.path).filter(|v| !v.is_null()) else {
            continue;
        };
        let confidence = candidate.confidence.resolve(blob);
        if confidence < min_confidence {
            debug!(field = %field, source = %candidate.label(), confidence, "candidate below confidence threshold");
            outcome.low_confidence += 1;
            continue;
        }

        let values: Vec<&JsonValue> = match raw {
            JsonValue::Array(items) if rule.spread_arrays => items.iter().collect(),
            other => vec![other],
        };
        let validate = candidate.validate.unwrap_or(rule.validate);
        for value in values {
            match validate(value) {
                Some(accepted) => {
                    outcome.result = Some(ExtractionResult {
                        field,
                        value: accepted,
                        source: candidate.label(),
                        confidence,
                    });
                    return outcome;
                }
                None => {
                    debug!(field = %field, source = %candidate.label(), raw = %value, "candidate rejected");
                    outcome.rejected += 1;
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn listing_with(apify: JsonValue, firecrawl: JsonValue) -> Listing {
        let mut listing = Listing::new(Uuid::new_v4(), "Cafe Goa");
        listing.apify_output = Some(apify);
        listing.firecrawl_output = Some(firecrawl);
        listing
    }

    #[test]
    fn every_target_field_has_exactly_one_rule() {
        for field in TargetField::ALL {
            let count = FIELD_RULES.iter().filter(|r| r.field == field).count();
            assert_eq!(count, 1, "{field}");
        }
    }

    #[test]
    fn price_from_structured_scrape_field() {
        let listing = listing_with(json!({"price": "$$"}), json!({"booking": {"price_range": "$$$$"}}));
        let result = extract(&listing, TargetField::PriceLevel, 0.5).result.unwrap();
        assert_eq!(result.value, FieldValue::Integer(2));
        assert_eq!(result.source, "apify_output.price");
    }

    #[test]
    fn price_falls_back_to_booking_range() {
        let listing = listing_with(json!({"price": "n/a"}), json!({"booking": {"price_range": "KWD 7"}}));
        let outcome = extract(&listing, TargetField::PriceLevel, 0.5);
        assert_eq!(outcome.rejected, 1);
        let result = outcome.result.unwrap();
        assert_eq!(result.value, FieldValue::Integer(3));
        assert_eq!(result.source, "firecrawl_output.booking.price_range");
    }

    #[test]
    fn ai_candidates_respect_reported_confidence() {
        let mut listing = Listing::new(Uuid::new_v4(), "Hotel");
        listing.ai_output = Some(json!({"price_level": "$$$", "confidence": 0.3}));
        let outcome = extract(&listing, TargetField::PriceLevel, 0.5);
        assert_eq!(outcome.result, None);
        assert_eq!(outcome.low_confidence, 1);

        listing.ai_output = Some(json!({"price_level": "$$$", "confidence": 0.92}));
        let result = extract(&listing, TargetField::PriceLevel, 0.5).result.unwrap();
        assert_eq!(result.value, FieldValue::Integer(3));
        assert_eq!(result.confidence, 0.92);
    }

    #[test]
    fn logo_prefers_tile_image_then_og_image() {
        let og_only = listing_with(
            json!({}),
            json!({"website_scrape": {"metadata": {"og:image": "https://cdn.example.com/logo.png"}}}),
        );
        let result = extract(&og_only, TargetField::LogoImage, 0.5).result.unwrap();
        assert_eq!(result.value, FieldValue::Text("https://cdn.example.com/logo.png".into()));
        assert_eq!(result.source, "firecrawl_output.website_scrape.metadata.og:image");

        let both = listing_with(
            json!({}),
            json!({"website_scrape": {"metadata": {
                "msapplication-TileImage": "https://cafegoa.com/tile.png",
                "og:image": ["https://cdn.example.com/logo.png"]
            }}}),
        );
        let result = extract(&both, TargetField::LogoImage, 0.5).result.unwrap();
        assert_eq!(result.value, FieldValue::Text("https://cafegoa.com/tile.png".into()));
    }

    #[test]
    fn operational_email_beats_scrape_email() {
        let listing = listing_with(
            json!({"email": "owner@cafegoa.com"}),
            json!({"operational": {"email": "Bookings@CafeGoa.com"}}),
        );
        let result = extract(&listing, TargetField::Email, 0.5).result.unwrap();
        assert_eq!(result.value, FieldValue::Text("bookings@cafegoa.com".into()));
    }

    #[test]
    fn placeholder_email_yields_nothing() {
        let listing = listing_with(json!({"email": "noreply@example.com"}), json!({}));
        let outcome = extract(&listing, TargetField::Email, 0.5);
        assert_eq!(outcome.result, None);
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn relative_page_links_are_not_taken_as_handles() {
        let listing = listing_with(
            json!({}),
            json!({"website_scrape": {"links": ["menu", "index.html", "https://www.instagram.com/cafegoa"]}}),
        );
        let ig = extract(&listing, TargetField::Instagram, 0.5);
        assert_eq!(ig.rejected, 2);
        assert_eq!(
            ig.result.unwrap().value,
            FieldValue::Text("https://www.instagram.com/cafegoa".into())
        );
        for field in [TargetField::Facebook, TargetField::Linkedin, TargetField::Tiktok] {
            assert_eq!(extract(&listing, field, 0.5).result, None, "{field}");
        }
    }

    #[test]
    fn social_chain_skips_bad_hosts_and_scans_page_links() {
        let listing = listing_with(
            json!({"instagrams": ["https://instagram.evil.com/cafegoa"]}),
            json!({"website_scrape": {"links": [
                "https://www.facebook.com/sharer/sharer.php?u=cafegoa.com",
                "https://www.facebook.com/cafegoa",
                "https://www.instagram.com/cafegoa/"
            ]}}),
        );
        let ig = extract(&listing, TargetField::Instagram, 0.5).result.unwrap();
        assert_eq!(ig.value, FieldValue::Text("https://www.instagram.com/cafegoa".into()));
        assert_eq!(ig.source, "firecrawl_output.website_scrape.links");

        let fb = extract(&listing, TargetField::Facebook, 0.5).result.unwrap();
        assert_eq!(fb.value, FieldValue::Text("https://www.facebook.com/cafegoa".into()));
    }

    #[test]
    fn social_handle_in_crawl_section_becomes_url() {
        let listing = listing_with(json!({}), json!({"social_media": {"instagram": "@cafegoa"}}));
        let result = extract(&listing, TargetField::Instagram, 0.5).result.unwrap();
        assert_eq!(result.value, FieldValue::Text("https://instagram.com/cafegoa".into()));
    }

    #[test]
    fn hours_array_is_validated_whole() {
        let listing = listing_with(
            json!({"openingHours": [{"day": "Sunday", "hours": "Open 24 hours"}]}),
            json!({}),
        );
        let result = extract(&listing, TargetField::Hours, 0.5).result.unwrap();
        assert_eq!(result.value, FieldValue::Json(json!({"sunday": "Open 24 hours"})));
    }

    #[test]
    fn threshold_above_all_candidates_yields_nothing() {
        let listing = listing_with(json!({"totalScore": 4.4}), json!({}));
        let outcome = extract(&listing, TargetField::Rating, 0.95);
        assert_eq!(outcome.result, None);
        assert_eq!(outcome.low_confidence, 1);
    }
}
