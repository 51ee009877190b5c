//! JIRA issue search, one dimension per issue taken from a custom field.

use serde::Deserialize;
use serde_json::Value;

use super::http::get_json;
use super::{parse_timestamp, Continuation, CursorKind, Page, PageOrder, PageRequest, Record, Source, SourceError};

const MAX_RESULTS: u64 = 1000;

pub struct JiraSource {
    name: String,
    base_url: String,
    user: String,
    password: String,
    jql: String,
    dimension_field: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    #[serde(default)]
    start_at: u64,
    #[serde(default)]
    total: u64,
    issues: Vec<Issue>,
}

#[derive(Debug, Deserialize)]
struct Issue {
    id: String,
    fields: serde_json::Map<String, Value>,
}

impl JiraSource {
    pub fn new(
        name: &str,
        base_url: &str,
        user: &str,
        password: String,
        jql: &str,
        dimension_field: &str,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password,
            jql: jql.to_string(),
            dimension_field: dimension_field.to_string(),
            client,
        }
    }

    fn query(&self, since_ms: i64) -> String {
        // JQL `created` compares against milliseconds since the epoch.
        format!("{} and created > {} order by created asc", self.jql, since_ms)
    }
}

fn dimension_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => items.iter().find_map(|v| dimension_of(Some(v))),
        Value::Object(map) => map.get("value").and_then(|v| dimension_of(Some(v))),
        _ => None,
    }
}

fn reporter_of(value: Option<&Value>) -> Option<String> {
    let reporter = value?.as_object()?;
    ["accountId", "name", "emailAddress"]
        .iter()
        .find_map(|k| reporter.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn to_record(issue: Issue, dimension_field: &str) -> Result<Record, SourceError> {
    let id = issue
        .id
        .parse::<u64>()
        .map_err(|_| SourceError::Schema(format!("issue id '{}' is not numeric", issue.id)))?;
    let created = issue
        .fields
        .get("created")
        .and_then(Value::as_str)
        .ok_or_else(|| SourceError::Schema(format!("issue {} has no created field", id)))?;

    let mut record = Record::new(id, parse_timestamp(created)?);
    record.dimension = dimension_of(issue.fields.get(dimension_field));
    record.reporter = reporter_of(issue.fields.get("reporter"));
    if let Some(kind) = issue
        .fields
        .get("issuetype")
        .and_then(|t| t.get("name"))
        .and_then(Value::as_str)
    {
        record.tags.push(format!("type:{}", kind));
    }
    Ok(record)
}

fn parse_page(search: SearchPage, dimension_field: &str) -> Result<Page, SourceError> {
    let returned = search.issues.len() as u64;
    let records = search
        .issues
        .into_iter()
        .map(|issue| to_record(issue, dimension_field))
        .collect::<Result<Vec<_>, _>>()?;
    let next_offset = search.start_at + returned;
    let next = (returned > 0 && next_offset < search.total).then_some(Continuation::Offset(next_offset));
    Ok(Page { records, next })
}

#[async_trait::async_trait]
impl Source for JiraSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> PageOrder {
        PageOrder::Ascending
    }

    fn cursor_kind(&self) -> CursorKind {
        CursorKind::Time
    }

    fn freshness_lag(&self) -> chrono::Duration {
        // `created` filters only have minute granularity.
        chrono::Duration::seconds(60)
    }

    fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(100)
    }

    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, SourceError> {
        let start_at = match request.continuation {
            Some(Continuation::Offset(n)) => *n,
            _ => 0,
        };
        let fields = format!("created,reporter,issuetype,{}", self.dimension_field);
        let url = format!("{}/rest/api/latest/search", self.base_url);
        let builder = self
            .client
            .get(&url)
            .query(&[
                ("jql", self.query(request.since.timestamp_millis())),
                ("fields", fields),
                ("maxResults", MAX_RESULTS.to_string()),
                ("startAt", start_at.to_string()),
            ])
            .basic_auth(&self.user, Some(&self.password))
            .header("Content-Type", "application/json");
        let (search, _) = get_json::<SearchPage>(builder).await?;
        parse_page(search, &self.dimension_field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const FIELD: &str = "customfield_10024";

    fn page(body: &str) -> Page {
        parse_page(serde_json::from_str(body).unwrap(), FIELD).unwrap()
    }

    #[test]
    fn test_parse_search_page() {
        let p = page(
            r#"{"startAt": 0, "maxResults": 1000, "total": 1500, "issues": [
                {"id": "10001", "key": "AI-1", "fields": {
                    "created": "2014-01-01T12:34:56.000-0800",
                    "customfield_10024": ["fractions_1"],
                    "reporter": {"accountId": "abc"},
                    "issuetype": {"name": "Bug"}}},
                {"id": "10002", "key": "AI-2", "fields": {
                    "created": "2014-01-01T12:40:00.000-0800",
                    "customfield_10024": null}}
            ]}"#,
        );
        assert_eq!(p.records.len(), 2);
        assert_eq!(p.records[0].id, 10001);
        assert_eq!(p.records[0].created_at, Utc.with_ymd_and_hms(2014, 1, 1, 20, 34, 56).unwrap());
        assert_eq!(p.records[0].dimension.as_deref(), Some("fractions_1"));
        assert_eq!(p.records[0].reporter.as_deref(), Some("abc"));
        assert_eq!(p.records[0].tags, vec!["type:Bug".to_string()]);
        assert_eq!(p.records[1].dimension, None);
        assert_eq!(p.next, Some(Continuation::Offset(2)));
    }

    #[test]
    fn test_last_page_has_no_continuation() {
        let p = page(r#"{"startAt": 998, "total": 1000, "issues": [
            {"id": "1", "fields": {"created": "2014-01-01T12:34:56.000+0000"}},
            {"id": "2", "fields": {"created": "2014-01-01T12:35:56.000+0000"}}
        ]}"#);
        assert_eq!(p.next, None);
    }

    #[test]
    fn test_missing_created_is_schema_error() {
        let search: SearchPage =
            serde_json::from_str(r#"{"issues": [{"id": "5", "fields": {}}]}"#).unwrap();
        assert!(matches!(parse_page(search, FIELD), Err(SourceError::Schema(_))));
    }

    #[test]
    fn test_dimension_shapes() {
        let v: Value = serde_json::json!({"value": "exercise-a"});
        assert_eq!(dimension_of(Some(&v)).as_deref(), Some("exercise-a"));
        let v: Value = serde_json::json!(["", "exercise-b"]);
        assert_eq!(dimension_of(Some(&v)).as_deref(), Some("exercise-b"));
        assert_eq!(dimension_of(Some(&serde_json::json!(42))), None);
    }
}
