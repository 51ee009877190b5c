//! GitHub repository issues, newest first, keyed by issue number.

use serde::Deserialize;

use super::http::{get_json, header_str};
use super::{parse_timestamp, Continuation, CursorKind, Page, PageOrder, PageRequest, Record, Source, SourceError};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
const PER_PAGE: u32 = 100;

pub struct GithubSource {
    name: String,
    api_base: String,
    owner: String,
    repo: String,
    token: Option<String>,
    dimension_prefix: Option<String>,
    dimension_suffix: Option<String>,
    relay_logins: Vec<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Issue {
    number: u64,
    created_at: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    user: Option<User>,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

impl GithubSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        api_base: Option<&str>,
        owner: &str,
        repo: &str,
        token: Option<String>,
        dimension_prefix: Option<String>,
        dimension_suffix: Option<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.to_string(),
            api_base: api_base.unwrap_or(DEFAULT_API_BASE).trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token,
            dimension_prefix,
            dimension_suffix,
            relay_logins: Vec::new(),
            client,
        }
    }

    /// Accounts that file issues on behalf of many users. Their issues keep
    /// the `author:` tag but carry no reporter identity.
    pub fn with_relay_logins(mut self, logins: Vec<String>) -> Self {
        self.relay_logins = logins;
        self
    }

    fn extract_dimension(&self, body: &str) -> Option<String> {
        let prefix = self.dimension_prefix.as_deref()?;
        extract_between(body, prefix, self.dimension_suffix.as_deref().unwrap_or("\n"))
    }
}

/// First non-empty text between `prefix` and the next `suffix`.
pub fn extract_between(body: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = body.find(prefix)? + prefix.len();
    let rest = &body[start..];
    let end = rest.find(suffix).unwrap_or(rest.len());
    let found = rest[..end].trim();
    (!found.is_empty()).then(|| found.to_string())
}

/// Whether a `Link` header advertises a `rel="next"` page.
pub fn has_next_link(link: Option<&str>) -> bool {
    let Some(link) = link else {
        return false;
    };
    link.split(',').any(|part| {
        part.split(';')
            .skip(1)
            .any(|param| param.trim().replace(' ', "") == "rel=\"next\"")
    })
}

impl GithubSource {
    fn to_record(&self, issue: Issue) -> Result<Record, SourceError> {
        let mut record = Record::new(issue.number, parse_timestamp(&issue.created_at)?);
        record.dimension = issue.body.as_deref().and_then(|b| self.extract_dimension(b));
        if let Some(user) = issue.user {
            record.tags.push(format!("author:{}", user.login));
            if !self.relay_logins.iter().any(|l| l.eq_ignore_ascii_case(&user.login)) {
                record.reporter = Some(user.login);
            }
        }
        record.tags.extend(issue.labels.into_iter().map(|l| l.name));
        if issue.pull_request.is_some() {
            record.tags.push("pull-request".to_string());
        }
        Ok(record)
    }

    fn parse_page(&self, issues: Vec<Issue>, page: u32, link: Option<&str>) -> Result<Page, SourceError> {
        let records = issues
            .into_iter()
            .map(|issue| self.to_record(issue))
            .collect::<Result<Vec<_>, _>>()?;
        let next = (has_next_link(link) && !records.is_empty()).then_some(Continuation::Page(page + 1));
        Ok(Page { records, next })
    }
}

#[async_trait::async_trait]
impl Source for GithubSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> PageOrder {
        PageOrder::Descending
    }

    fn cursor_kind(&self) -> CursorKind {
        CursorKind::Id
    }

    fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(7)
    }

    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, SourceError> {
        let page = match request.continuation {
            Some(Continuation::Page(n)) => *n,
            _ => 1,
        };
        let url = format!("{}/repos/{}/{}/issues", self.api_base, self.owner, self.repo);
        let mut builder = self
            .client
            .get(&url)
            .query(&[
                ("state", "all".to_string()),
                ("sort", "created".to_string()),
                ("direction", "desc".to_string()),
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ])
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let (issues, headers) = get_json::<Vec<Issue>>(builder).await?;
        self.parse_page(issues, page, header_str(&headers, "link"))
    }
}
