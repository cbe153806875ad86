use crate::models::promotion::{format_expiry, PromotionItem};
use anyhow::{anyhow, Context as _, Result};
use chrono_tz::Tz;
use serde::Serialize;
use tera::{Context, Tera};

const DEFAULT_TITLE: &str = "Epic Free Games";

/// A finished email: the subject plus both alternative bodies.
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject:   String,
    pub preheader: String,
    pub html:      String,
    pub text:      String,
}

#[derive(Serialize)]
struct Card<'a> {
    title:   &'a str,
    url:     &'a str,
    image:   Option<&'a str>,
    expires: String,
}

/// Email renderer backed by the templates embedded at build time.
/// The `.html` template is auto-escaped by tera, so titles and URLs from
/// the catalog can never inject markup.
pub struct Renderer {
    engine: Tera,
}

impl Renderer {
    pub fn new() -> Result<Self> {
        let mut engine = Tera::default();
        engine
            .add_raw_templates(vec![
                ("digest.html", include_str!("../../templates/digest.html")),
                ("digest.txt",  include_str!("../../templates/digest.txt")),
            ])
            .context("loading email templates")?;
        Ok(Self { engine })
    }

    /// Render `items` into one email. `header` overrides the synthesized subject.
    pub fn render(&self, items: &[PromotionItem], tz_name: &str, header: Option<&str>) -> Result<RenderedEmail> {
        let tz: Tz = tz_name.parse().map_err(|_| anyhow!("unknown timezone {:?}", tz_name))?;
        let subject = header.map(String::from).unwrap_or_else(|| subject_for(items));
        let preheader = preheader_for(items);

        let cards: Vec<Card> = items.iter()
            .map(|it| Card {
                title:   &it.title,
                url:     &it.product_url,
                image:   it.image_url.as_deref().filter(|u| !u.is_empty()),
                expires: format_expiry(&it.ends_at_utc.with_timezone(&tz)),
            })
            .collect();

        let mut ctx = Context::new();
        ctx.insert("subject", &subject);
        ctx.insert("preheader", &preheader);
        ctx.insert("cards", &cards);

        let html = self.engine.render("digest.html", &ctx).context("rendering HTML body")?;
        let text = self.engine.render("digest.txt", &ctx).context("rendering text body")?;
        Ok(RenderedEmail { subject, preheader, html, text })
    }
}

/// "Epic Free Games: A, B" or the bare title when there is nothing.
pub fn subject_for(items: &[PromotionItem]) -> String {
    if items.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        format!("{}: {}", DEFAULT_TITLE, titles(items))
    }
}

fn preheader_for(items: &[PromotionItem]) -> String {
    if items.is_empty() {
        "No new 'FREE NOW' games right now.".to_string()
    } else {
        format!("New 'FREE NOW' games: {}", titles(items))
    }
}

fn titles(items: &[PromotionItem]) -> String {
    items.iter().map(|i| i.title.as_str()).collect::<Vec<_>>().join(", ")
}
