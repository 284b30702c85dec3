//! Core listing model and reconciliation value types for the directory pipeline.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ldir-core";

/// Output column the reconciler can populate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    Email,
    Phone,
    Website,
    PriceLevel,
    Hours,
    Instagram,
    Facebook,
    Twitter,
    Tiktok,
    Youtube,
    Linkedin,
    LogoImage,
    Rating,
    ReviewCount,
}

impl TargetField {
    pub const ALL: [TargetField; 14] = [
        TargetField::Email,
        TargetField::Phone,
        TargetField::Website,
        TargetField::PriceLevel,
        TargetField::Hours,
        TargetField::Instagram,
        TargetField::Facebook,
        TargetField::Twitter,
        TargetField::Tiktok,
        TargetField::Youtube,
        TargetField::Linkedin,
        TargetField::LogoImage,
        TargetField::Rating,
        TargetField::ReviewCount,
    ];

    pub fn column(self) -> &'static str {
        match self {
            TargetField::Email => "email",
            TargetField::Phone => "phone",
            TargetField::Website => "website",
            TargetField::PriceLevel => "price_level",
            TargetField::Hours => "hours",
            TargetField::Instagram => "instagram",
            TargetField::Facebook => "facebook",
            TargetField::Twitter => "twitter",
            TargetField::Tiktok => "tiktok",
            TargetField::Youtube => "youtube",
            TargetField::Linkedin => "linkedin",
            TargetField::LogoImage => "logo_image",
            TargetField::Rating => "rating",
            TargetField::ReviewCount => "review_count",
        }
    }

    pub fn from_column(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|f| f.column() == name)
    }

    /// Stored in a text column, where a blank string can stand in for null.
    pub fn is_text(self) -> bool {
        !matches!(
            self,
            TargetField::PriceLevel | TargetField::Hours | TargetField::Rating | TargetField::ReviewCount
        )
    }

    pub fn social_platform(self) -> Option<SocialPlatform> {
        match self {
            TargetField::Instagram => Some(SocialPlatform::Instagram),
            TargetField::Facebook => Some(SocialPlatform::Facebook),
            TargetField::Twitter => Some(SocialPlatform::Twitter),
            TargetField::Tiktok => Some(SocialPlatform::Tiktok),
            TargetField::Youtube => Some(SocialPlatform::Youtube),
            TargetField::Linkedin => Some(SocialPlatform::Linkedin),
            _ => None,
        }
    }
}

impl fmt::Display for TargetField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocialPlatform {
    Instagram,
    Facebook,
    Twitter,
    Tiktok,
    Youtube,
    Linkedin,
}

impl SocialPlatform {
    /// Key used by the crawl output's `social_media` section and the scrape output.
    pub fn key(self) -> &'static str {
        match self {
            SocialPlatform::Instagram => "instagram",
            SocialPlatform::Facebook => "facebook",
            SocialPlatform::Twitter => "twitter",
            SocialPlatform::Tiktok => "tiktok",
            SocialPlatform::Youtube => "youtube",
            SocialPlatform::Linkedin => "linkedin",
        }
    }

    pub fn field(self) -> TargetField {
        match self {
            SocialPlatform::Instagram => TargetField::Instagram,
            SocialPlatform::Facebook => TargetField::Facebook,
            SocialPlatform::Twitter => TargetField::Twitter,
            SocialPlatform::Tiktok => TargetField::Tiktok,
            SocialPlatform::Youtube => TargetField::Youtube,
            SocialPlatform::Linkedin => TargetField::Linkedin,
        }
    }
}

/// Raw upstream blob a candidate value is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Apify,
    Firecrawl,
    Ai,
}

impl Source {
    pub fn blob_name(self) -> &'static str {
        match self {
            Source::Apify => "apify_output",
            Source::Firecrawl => "firecrawl_output",
            Source::Ai => "ai_output",
        }
    }
}

/// Normalized value staged for an output column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Decimal(f64),
    Text(String),
    Json(JsonValue),
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Integer(_) | FieldValue::Decimal(_) => false,
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Json(v) => json_is_empty(v),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Decimal(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Integer(v) => JsonValue::from(*v),
            FieldValue::Decimal(v) => JsonValue::from(*v),
            FieldValue::Text(s) => JsonValue::String(s.clone()),
            FieldValue::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Decimal(v) => write!(f, "{v}"),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Json(v) => write!(f, "{v}"),
        }
    }
}

fn json_is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(a) => a.is_empty(),
        JsonValue::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Validated value produced by one extractor; consumed immediately by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub field: TargetField,
    pub value: FieldValue,
    /// Dotted path of the candidate that produced the value, e.g. `apify_output.price`.
    pub source: String,
    pub confidence: f64,
}

/// One directory listing row with its raw scrape blobs and typed output columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub apify_output: Option<JsonValue>,
    #[serde(default)]
    pub firecrawl_output: Option<JsonValue>,
    #[serde(default)]
    pub ai_output: Option<JsonValue>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub price_level: Option<i64>,
    #[serde(default)]
    pub hours: Option<JsonValue>,
    #[serde(default)]
    pub instagram: Option<String>,
    #[serde(default)]
    pub facebook: Option<String>,
    #[serde(default)]
    pub twitter: Option<String>,
    #[serde(default)]
    pub tiktok: Option<String>,
    #[serde(default)]
    pub youtube: Option<String>,
    #[serde(default)]
    pub linkedin: Option<String>,
    #[serde(default)]
    pub logo_image: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: Option<i64>,
}

impl Listing {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            slug: None,
            apify_output: None,
            firecrawl_output: None,
            ai_output: None,
            email: None,
            phone: None,
            website: None,
            price_level: None,
            hours: None,
            instagram: None,
            facebook: None,
            twitter: None,
            tiktok: None,
            youtube: None,
            linkedin: None,
            logo_image: None,
            rating: None,
            review_count: None,
        }
    }

    pub fn blob(&self, source: Source) -> Option<&JsonValue> {
        match source {
            Source::Apify => self.apify_output.as_ref(),
            Source::Firecrawl => self.firecrawl_output.as_ref(),
            Source::Ai => self.ai_output.as_ref(),
        }
    }

    fn text_slot(&mut self, field: TargetField) -> Option<&mut Option<String>> {
        match field {
            TargetField::Email => Some(&mut self.email),
            TargetField::Phone => Some(&mut self.phone),
            TargetField::Website => Some(&mut self.website),
            TargetField::Instagram => Some(&mut self.instagram),
            TargetField::Facebook => Some(&mut self.facebook),
            TargetField::Twitter => Some(&mut self.twitter),
            TargetField::Tiktok => Some(&mut self.tiktok),
            TargetField::Youtube => Some(&mut self.youtube),
            TargetField::Linkedin => Some(&mut self.linkedin),
            TargetField::LogoImage => Some(&mut self.logo_image),
            _ => None,
        }
    }

    /// Current value of an output column, if any.
    pub fn current(&self, field: TargetField) -> Option<FieldValue> {
        let text = |v: &Option<String>| v.clone().map(FieldValue::Text);
        match field {
            TargetField::Email => text(&self.email),
            TargetField::Phone => text(&self.phone),
            TargetField::Website => text(&self.website),
            TargetField::PriceLevel => self.price_level.map(FieldValue::Integer),
            TargetField::Hours => self.hours.clone().map(FieldValue::Json),
            TargetField::Instagram => text(&self.instagram),
            TargetField::Facebook => text(&self.facebook),
            TargetField::Twitter => text(&self.twitter),
            TargetField::Tiktok => text(&self.tiktok),
            TargetField::Youtube => text(&self.youtube),
            TargetField::Linkedin => text(&self.linkedin),
            TargetField::LogoImage => text(&self.logo_image),
            TargetField::Rating => self.rating.map(FieldValue::Decimal),
            TargetField::ReviewCount => self.review_count.map(FieldValue::Integer),
        }
    }

    /// Present and non-empty. Blank strings and empty JSON containers count as empty.
    pub fn is_populated(&self, field: TargetField) -> bool {
        self.current(field).is_some_and(|v| !v.is_empty())
    }

    /// Apply a staged update in place. Values of the wrong shape for a column are ignored.
    pub fn apply(&mut self, update: &ListingUpdate) {
        for (field, value) in update.iter() {
            match field {
                TargetField::PriceLevel => self.price_level = value.as_i64().or(self.price_level),
                TargetField::ReviewCount => self.review_count = value.as_i64().or(self.review_count),
                TargetField::Rating => self.rating = value.as_f64().or(self.rating),
                TargetField::Hours => {
                    if let FieldValue::Json(v) = value {
                        self.hours = Some(v.clone());
                    }
                }
                other => {
                    if let (Some(slot), Some(text)) = (self.text_slot(other), value.as_text()) {
                        *slot = Some(text.to_string());
                    }
                }
            }
        }
    }
}

/// Partial update staged for one listing: only the fields that change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ListingUpdate {
    fields: BTreeMap<TargetField, FieldValue>,
}

impl ListingUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a value. The first value staged for a field wins; returns whether it was taken.
    pub fn stage(&mut self, field: TargetField, value: FieldValue) -> bool {
        if self.fields.contains_key(&field) {
            return false;
        }
        self.fields.insert(field, value);
        true
    }

    pub fn get(&self, field: TargetField) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TargetField, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    pub fn fields(&self) -> Vec<TargetField> {
        self.fields.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Request body for a partial update, keyed by column name.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.column().to_string(), v.to_json()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn column_names_round_trip_through_from_column() {
        for field in TargetField::ALL {
            assert_eq!(TargetField::from_column(field.column()), Some(field));
        }
        assert_eq!(TargetField::from_column("not_a_column"), None);
    }

    #[test]
    fn blank_strings_and_empty_json_are_not_populated() {
        let mut listing = Listing::new(Uuid::nil(), "Cafe Goa");
        listing.email = Some("   ".to_string());
        listing.hours = Some(json!({}));
        listing.price_level = Some(2);
        assert!(!listing.is_populated(TargetField::Email));
        assert!(!listing.is_populated(TargetField::Hours));
        assert!(!listing.is_populated(TargetField::Instagram));
        assert!(listing.is_populated(TargetField::PriceLevel));
    }

    #[test]
    fn first_staged_value_wins() {
        let mut update = ListingUpdate::new();
        assert!(update.stage(TargetField::PriceLevel, FieldValue::Integer(2)));
        assert!(!update.stage(TargetField::PriceLevel, FieldValue::Integer(4)));
        assert_eq!(update.get(TargetField::PriceLevel), Some(&FieldValue::Integer(2)));
    }

    #[test]
    fn update_serializes_as_flat_column_object() {
        let mut update = ListingUpdate::new();
        update.stage(TargetField::LogoImage, FieldValue::Text("https://cdn.example.com/logo.png".into()));
        update.stage(TargetField::PriceLevel, FieldValue::Integer(3));
        update.stage(TargetField::Hours, FieldValue::Json(json!({"monday": "9 AM to 5 PM"})));

        let expected = json!({
            "price_level": 3,
            "hours": {"monday": "9 AM to 5 PM"},
            "logo_image": "https://cdn.example.com/logo.png",
        });
        assert_eq!(update.to_json(), expected);
        assert_eq!(serde_json::to_value(&update).unwrap(), expected);
    }

    #[test]
    fn apply_writes_typed_columns() {
        let mut listing = Listing::new(Uuid::nil(), "Mall");
        let mut update = ListingUpdate::new();
        update.stage(TargetField::Instagram, FieldValue::Text("https://instagram.com/mall".into()));
        update.stage(TargetField::Rating, FieldValue::Decimal(4.5));
        update.stage(TargetField::ReviewCount, FieldValue::Integer(120));
        listing.apply(&update);

        assert_eq!(listing.instagram.as_deref(), Some("https://instagram.com/mall"));
        assert_eq!(listing.rating, Some(4.5));
        assert_eq!(listing.review_count, Some(120));
    }

    #[test]
    fn listing_rows_ignore_unknown_columns() {
        let row = json!({
            "id": "00000000-0000-0000-0000-000000000001",
            "name": "Hotel",
            "area": "Salmiya",
            "price_level": null,
            "apify_output": {"price": "$$"},
        });
        let listing: Listing = serde_json::from_value(row).unwrap();
        assert_eq!(listing.price_level, None);
        assert_eq!(listing.apify_output, Some(json!({"price": "$$"})));
    }

    #[test]
    fn only_string_columns_are_text() {
        let text: Vec<_> = TargetField::ALL.into_iter().filter(|f| f.is_text()).collect();
        assert_eq!(text.len(), 10);
        assert!(!TargetField::Hours.is_text());
        assert!(!TargetField::PriceLevel.is_text());
        assert!(TargetField::LogoImage.is_text());
    }
}
