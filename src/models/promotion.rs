use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;

/// One "free now" promotion as shown to the reader.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionItem {
    pub title:         String,
    pub image_url:     Option<String>,
    pub product_url:   String,
    pub ends_at_utc:   DateTime<Utc>,
    pub ends_at_local: DateTime<Tz>,
}

impl PromotionItem {
    /// Stable key used for de-duplication: `"<title>|<end in RFC 3339>"`.
    /// A later repeat of the same title has a different end date, hence a new key.
    /// Sub-second ends are written with six digits, whole seconds with none.
    pub fn identity_key(&self) -> String {
        let precision = if self.ends_at_utc.timestamp_subsec_micros() == 0 {
            SecondsFormat::Secs
        } else {
            SecondsFormat::Micros
        };
        format!("{}|{}", self.title, self.ends_at_utc.to_rfc3339_opts(precision, false))
    }

    pub fn local_expiry(&self) -> String {
        format_expiry(&self.ends_at_local)
    }
}

/// "Wed, Jan 08, 11:00 AM EST"
pub fn format_expiry(dt: &DateTime<Tz>) -> String {
    dt.format("%a, %b %d, %I:%M %p %Z").to_string()
}
