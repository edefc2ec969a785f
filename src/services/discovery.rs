// Project discovery over the Transifex REST API
//
// The API is reached only through the `ProjectSource` capability so the rest
// of the pipeline never sees HTTP; tests plug in an in-memory source.

use crate::models::Project;
use serde::Deserialize;
use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use thiserror::Error;
use tracing::debug;

const JSON_API: &str = "application/vnd.api+json";

/// Errors raised while talking to the discovery API
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Token rejected or lacking permission (401/403)
    #[error("API token is invalid or has insufficient permissions: {0}")]
    Auth(String),

    /// Organization does not exist or is not visible to the token (404)
    #[error("Organization '{0}' not found or not accessible")]
    OrganizationNotFound(String),

    #[error("Discovery request failed (HTTP {status}): {message}")]
    Request { status: u16, message: String },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected API response: {0}")]
    InvalidResponse(String),
}

impl DiscoveryError {
    /// Auth failures abort the run with a token diagnostic rather than a discovery one.
    pub fn is_auth(&self) -> bool {
        matches!(self, DiscoveryError::Auth(_))
    }
}

/// One page of the organization's project listing
#[derive(Debug, Clone, Default)]
pub struct ProjectPage {
    pub projects: Vec<Project>,
    /// Opaque cursor for the following page, `None` on the last page
    pub next: Option<String>,
}

/// Narrow capability over the remote project listing.
pub trait ProjectSource {
    /// Look up the organization, returning its display name.
    fn fetch_organization(
        &self,
        org_slug: &str,
    ) -> impl Future<Output = Result<String, DiscoveryError>> + Send;

    /// Fetch one page of projects; `cursor` is `None` for the first page.
    fn fetch_page(
        &self,
        org_slug: &str,
        cursor: Option<&str>,
    ) -> impl Future<Output = Result<ProjectPage, DiscoveryError>> + Send;
}

/// Sequence-producing wrapper over a [`ProjectSource`].
pub struct DiscoveryClient<S> {
    source: S,
}

impl<S: ProjectSource> DiscoveryClient<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Check that the organization exists and the token can list its projects.
    pub async fn validate_organization(&self, org_slug: &str) -> Result<String, DiscoveryError> {
        let name = self.source.fetch_organization(org_slug).await?;
        tracing::info!("Organization found: {}", name);

        let mut pager = self.pager(org_slug);
        let _ = pager.next().await?;
        tracing::info!("API access verified for organization {}", org_slug);

        Ok(name)
    }

    /// Lazily page through every project of the organization.
    pub fn pager<'a>(&'a self, org_slug: &'a str) -> ProjectPager<'a, S> {
        ProjectPager {
            source: &self.source,
            org_slug,
            buffered: VecDeque::new(),
            cursor: None,
            exhausted: false,
            pages_fetched: 0,
        }
    }

    /// All projects of the organization.
    pub async fn list_projects(&self, org_slug: &str) -> Result<Vec<Project>, DiscoveryError> {
        let mut pager = self.pager(org_slug);
        let mut projects = Vec::new();
        while let Some(project) = pager.next().await? {
            projects.push(project);
        }
        tracing::info!("Found {} project(s) in organization", projects.len());
        Ok(projects)
    }

    /// Only the requested projects, stopping as soon as all of them were seen.
    pub async fn list_wanted_projects(
        &self,
        org_slug: &str,
        wanted: &BTreeSet<String>,
    ) -> Result<Vec<Project>, DiscoveryError> {
        let mut pager = self.pager(org_slug);
        let mut found = Vec::new();
        let mut seen = BTreeSet::new();

        while seen.len() < wanted.len() {
            let Some(project) = pager.next().await? else {
                break;
            };
            if wanted.contains(&project.slug) && seen.insert(project.slug.clone()) {
                found.push(project);
            }
        }

        let not_found: Vec<&str> = wanted
            .iter()
            .filter(|slug| !seen.contains(*slug))
            .map(String::as_str)
            .collect();
        if !not_found.is_empty() {
            tracing::warn!("Projects not found: {}", not_found.join(", "));
        }

        tracing::info!(
            "Found {} of {} requested project(s) after {} page(s)",
            found.len(),
            wanted.len(),
            pager.pages_fetched()
        );
        Ok(found)
    }
}

/// Lazy cursor over a paged project listing; pages are fetched on demand.
pub struct ProjectPager<'a, S> {
    source: &'a S,
    org_slug: &'a str,
    buffered: VecDeque<Project>,
    cursor: Option<String>,
    exhausted: bool,
    pages_fetched: usize,
}

impl<S: ProjectSource> ProjectPager<'_, S> {
    /// Next project, fetching another page only when the buffer is empty.
    pub async fn next(&mut self) -> Result<Option<Project>, DiscoveryError> {
        loop {
            if let Some(project) = self.buffered.pop_front() {
                return Ok(Some(project));
            }
            if self.exhausted {
                return Ok(None);
            }

            let page = self
                .source
                .fetch_page(self.org_slug, self.cursor.as_deref())
                .await?;
            self.pages_fetched += 1;
            debug!(
                "Fetched project page {} ({} projects)",
                self.pages_fetched,
                page.projects.len()
            );

            self.buffered.extend(page.projects);
            self.exhausted = page.next.is_none();
            self.cursor = page.next;
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

#[derive(Debug, Deserialize)]
struct ProjectList {
    data: Vec<ProjectResource>,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProjectResource {
    attributes: ProjectAttributes,
}

#[derive(Debug, Deserialize)]
struct ProjectAttributes {
    slug: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrganizationDocument {
    data: OrganizationResource,
}

#[derive(Debug, Deserialize)]
struct OrganizationResource {
    attributes: OrganizationAttributes,
}

#[derive(Debug, Deserialize)]
struct OrganizationAttributes {
    #[serde(default)]
    name: Option<String>,
    slug: String,
}

/// Parse a JSON:API project listing body.
pub fn parse_project_page(body: &str) -> Result<ProjectPage, DiscoveryError> {
    let list: ProjectList =
        serde_json::from_str(body).map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;

    let projects = list
        .data
        .into_iter()
        .map(|resource| {
            let name = resource
                .attributes
                .name
                .unwrap_or_else(|| resource.attributes.slug.clone());
            Project::new(resource.attributes.slug, name)
        })
        .collect();

    Ok(ProjectPage {
        projects,
        next: list.links.next,
    })
}

/// [`ProjectSource`] backed by the Transifex REST API v3.
pub struct TransifexApi {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl TransifexApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("txbulk/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn get(&self, url: &str, org_slug: &str) -> Result<String, DiscoveryError> {
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, JSON_API)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;

        match status {
            s if s.is_success() => Ok(body),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(DiscoveryError::Auth(format!("HTTP {}", status.as_u16())))
            }
            reqwest::StatusCode::NOT_FOUND => {
                Err(DiscoveryError::OrganizationNotFound(org_slug.to_string()))
            }
            _ => Err(DiscoveryError::Request {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            }),
        }
    }
}

impl ProjectSource for TransifexApi {
    async fn fetch_organization(&self, org_slug: &str) -> Result<String, DiscoveryError> {
        let url = format!("{}/organizations/o:{}", self.base_url, org_slug);
        let body = self.get(&url, org_slug).await?;
        let doc: OrganizationDocument = serde_json::from_str(&body)
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;
        let attributes = doc.data.attributes;
        Ok(attributes.name.unwrap_or(attributes.slug))
    }

    async fn fetch_page(
        &self,
        org_slug: &str,
        cursor: Option<&str>,
    ) -> Result<ProjectPage, DiscoveryError> {
        let url = match cursor {
            Some(next) => next.to_string(),
            None => format!(
                "{}/projects?filter[organization]=o:{}",
                self.base_url, org_slug
            ),
        };
        let body = self.get(&url, org_slug).await?;
        parse_project_page(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct PagedSource {
        pages: Vec<Vec<&'static str>>,
        calls: AtomicUsize,
    }

    impl ProjectSource for PagedSource {
        async fn fetch_organization(&self, org_slug: &str) -> Result<String, DiscoveryError> {
            if org_slug == "acme" {
                Ok("Acme Corp".to_string())
            } else {
                Err(DiscoveryError::OrganizationNotFound(org_slug.to_string()))
            }
        }

        async fn fetch_page(
            &self,
            _org_slug: &str,
            cursor: Option<&str>,
        ) -> Result<ProjectPage, DiscoveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let index: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let next = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
            Ok(ProjectPage {
                projects: self.pages[index]
                    .iter()
                    .map(|slug| Project::new(*slug, slug.to_uppercase()))
                    .collect(),
                next,
            })
        }
    }

    fn three_pages() -> PagedSource {
        PagedSource {
            pages: vec![vec!["alpha", "beta"], vec!["gamma"], vec!["delta", "epsilon"]],
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn test_list_projects_walks_all_pages() {
        let client = DiscoveryClient::new(three_pages());
        let projects = client.list_projects("acme").await.unwrap();

        let slugs: Vec<&str> = projects.iter().map(|p| p.slug.as_str()).collect();
        assert_eq!(slugs, vec!["alpha", "beta", "gamma", "delta", "epsilon"]);
        assert_eq!(client.source().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wanted_projects_terminate_early() {
        let client = DiscoveryClient::new(three_pages());
        let wanted: BTreeSet<String> = ["beta".to_string()].into_iter().collect();

        let projects = client.list_wanted_projects("acme", &wanted).await.unwrap();

        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].slug, "beta");
        assert_eq!(client.source().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wanted_projects_missing_slug_reads_everything() {
        let client = DiscoveryClient::new(three_pages());
        let wanted: BTreeSet<String> = ["gamma".to_string(), "nope".to_string()]
            .into_iter()
            .collect();

        let projects = client.list_wanted_projects("acme", &wanted).await.unwrap();

        assert_eq!(projects.len(), 1);
        assert_eq!(client.source().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validate_unknown_organization() {
        let client = DiscoveryClient::new(three_pages());
        let err = client.validate_organization("nobody").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::OrganizationNotFound(_)));
        assert!(!err.is_auth());
    }

    #[test]
    fn test_parse_project_page() {
        let body = r#"{
            "data": [
                {"id": "o:acme:p:web", "type": "projects", "attributes": {"slug": "web", "name": "Website"}},
                {"id": "o:acme:p:app", "type": "projects", "attributes": {"slug": "app"}}
            ],
            "links": {"self": "x", "next": "https://rest.api.transifex.com/projects?page[cursor]=abc"}
        }"#;

        let page = parse_project_page(body).unwrap();
        assert_eq!(page.projects[0], Project::new("web", "Website"));
        assert_eq!(page.projects[1], Project::new("app", "app"));
        assert!(page.next.unwrap().contains("page[cursor]=abc"));
    }

    #[test]
    fn test_parse_last_page_has_no_cursor() {
        let body = r#"{"data": [], "links": {"next": null}}"#;
        let page = parse_project_page(body).unwrap();
        assert!(page.projects.is_empty());
        assert!(page.next.is_none());
    }

    #[test]
    fn test_parse_invalid_body() {
        let err = parse_project_page("<html>").unwrap_err();
        assert!(matches!(err, DiscoveryError::InvalidResponse(_)));
    }
}
