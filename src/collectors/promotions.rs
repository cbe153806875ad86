use crate::collectors::catalog::FetchError;
use crate::config::STORE_BASE;
use crate::models::promotion::PromotionItem;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::Value;

/// Preferred cover art first; thumbnails only as a last resort.
const IMAGE_PRIORITY: [&str; 6] = [
    "OfferImageTall",
    "DieselStoreFrontTall",
    "VaultClosed",
    "DieselStoreFrontWide",
    "OfferImageWide",
    "Thumbnail",
];

/// Extract the promotions that are free right now from a
/// `freeGamesPromotions` payload, soonest-ending first.
///
/// Only a payload that is not a JSON object, or whose element list is not an
/// array, is an error. Individual elements that don't qualify or don't parse
/// are skipped.
pub fn parse_free_now(
    payload: &Value,
    now:     DateTime<Utc>,
    tz:      Tz,
    locale:  &str,
) -> Result<Vec<PromotionItem>, FetchError> {
    if !payload.is_object() {
        return Err(FetchError::Malformed("payload is not a JSON object".into()));
    }
    let elements = match payload.pointer("/data/Catalog/searchStore/elements") {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(a))    => a,
        Some(_) => return Err(FetchError::Malformed("searchStore.elements is not an array".into())),
    };

    let mut items: Vec<PromotionItem> = elements.iter()
        .filter_map(|el| {
            let item = parse_element(el, now, tz, locale);
            if item.is_none() {
                tracing::debug!(title = el["title"].as_str().unwrap_or(""), "element skipped");
            }
            item
        })
        .collect();

    items.sort_by_key(|i| i.ends_at_utc);
    Ok(items)
}

fn parse_element(el: &Value, now: DateTime<Utc>, tz: Tz, locale: &str) -> Option<PromotionItem> {
    let offer = el.pointer("/promotions/promotionalOffers")?
        .as_array()?
        .first()?
        .get("promotionalOffers")?
        .as_array()?
        .first()?;

    let free_now = is_free_now(&offer["discountSetting"])?;

    let end = parse_utc(offer["endDate"].as_str()?)?;
    if end <= now { return None; }

    if !free_now {
        if let Some(start) = offer["startDate"].as_str() {
            let start = parse_utc(start)?;
            if !(start <= now && now <= end) { return None; }
        }
    }

    let title = el["title"].as_str().unwrap_or("").trim().to_string();
    Some(PromotionItem {
        image_url:     pick_image(&el["keyImages"]),
        product_url:   product_url(el, &title, locale),
        ends_at_utc:   end,
        ends_at_local: end.with_timezone(&tz),
        title,
    })
}

/// `Some(true)` for a 0% PERCENTAGE discount. `None` when the percentage is
/// present but not a number, which disqualifies the element.
fn is_free_now(setting: &Value) -> Option<bool> {
    let pct = match &setting["discountPercentage"] {
        Value::Null      => 0.0,
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _                => return None,
    };
    Some(setting["discountType"].as_str() == Some("PERCENTAGE") && pct == 0.0)
}

fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim()).ok().map(|dt| dt.with_timezone(&Utc))
}

/// Best image by type priority; the first image when no type matches.
fn pick_image(key_images: &Value) -> Option<String> {
    let images = key_images.as_array().filter(|a| !a.is_empty())?;
    let with_url = |img: &Value| -> Option<String> {
        img["url"].as_str().filter(|u| !u.is_empty()).map(String::from)
    };

    for wanted in IMAGE_PRIORITY {
        // Later entries of the same type override earlier ones.
        let hit = images.iter().rev()
            .filter(|img| img["type"].as_str() == Some(wanted))
            .find_map(with_url);
        if hit.is_some() { return hit; }
    }
    with_url(&images[0])
}

/// Store page URL: catalog mapping slug, then product/url slug, then a search.
fn product_url(el: &Value, title: &str, locale: &str) -> String {
    let mapped = el.pointer("/catalogNs/mappings")
        .and_then(Value::as_array)
        .and_then(|maps| maps.iter().find_map(|m| non_empty(&m["pageSlug"])));

    let slug = mapped.or_else(|| {
        non_empty(&el["productSlug"])
            .or_else(|| non_empty(&el["urlSlug"]))
            .map(|s| if s.starts_with("p/") { s } else { format!("p/{}", s) })
    });

    match slug {
        Some(slug) => format!("{}/{}/{}", STORE_BASE, locale, slug)
            .replace("//", "/")
            .replace("https:/", "https://"),
        None => format!("{}/{}/search?q={}", STORE_BASE, locale, urlencoding::encode(title)),
    }
}

fn non_empty(v: &Value) -> Option<String> {
    v.as_str().filter(|s| !s.is_empty()).map(String::from)
}
