//! UserVoice forum suggestions, newest first.

use serde::Deserialize;

use super::http::get_json;
use super::{parse_timestamp, Continuation, CursorKind, Page, PageOrder, PageRequest, Record, Source, SourceError};

const PER_PAGE: usize = 100;

pub struct UservoiceSource {
    name: String,
    base_url: String,
    forum_id: u64,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SuggestionsPage {
    #[serde(default)]
    suggestions: Vec<Suggestion>,
}

#[derive(Debug, Deserialize)]
struct Suggestion {
    id: u64,
    created_at: String,
    #[serde(default)]
    creator: Option<Creator>,
    #[serde(default)]
    category: Option<Named>,
    #[serde(default)]
    status: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct Creator {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

impl UservoiceSource {
    pub fn new(name: &str, base_url: &str, forum_id: u64, api_key: String, client: reqwest::Client) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            forum_id,
            api_key,
            client,
        }
    }
}

fn to_record(suggestion: Suggestion) -> Result<Record, SourceError> {
    let mut record = Record::new(suggestion.id, parse_timestamp(&suggestion.created_at)?);
    record.reporter = suggestion.creator.map(|c| c.id.to_string());
    if let Some(category) = suggestion.category {
        record.dimension = Some(category.name.clone());
        record.tags.push(format!("category:{}", category.name));
    }
    if let Some(status) = suggestion.status {
        record.tags.push(format!("status:{}", status.name));
    }
    Ok(record)
}

fn parse_page(body: SuggestionsPage, page: u32) -> Result<Page, SourceError> {
    let full = body.suggestions.len() >= PER_PAGE;
    let records = body.suggestions.into_iter().map(to_record).collect::<Result<Vec<_>, _>>()?;
    let next = full.then_some(Continuation::Page(page + 1));
    Ok(Page { records, next })
}

#[async_trait::async_trait]
impl Source for UservoiceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> PageOrder {
        PageOrder::Descending
    }

    fn cursor_kind(&self) -> CursorKind {
        CursorKind::Time
    }

    fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(30)
    }

    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, SourceError> {
        let page = match request.continuation {
            Some(Continuation::Page(n)) => *n,
            _ => 1,
        };
        let url = format!("{}/api/v1/forums/{}/suggestions.json", self.base_url, self.forum_id);
        let builder = self.client.get(&url).query(&[
            ("client", self.api_key.clone()),
            ("page", page.to_string()),
            ("per_page", PER_PAGE.to_string()),
            ("sort", "newest".to_string()),
        ]);
        let (body, _) = get_json::<SuggestionsPage>(builder).await?;
        parse_page(body, page)
    }
}
