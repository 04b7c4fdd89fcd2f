//! Loading already-generated course material.
//!
//! The engine does not own durability: finished units are saved server-side.
//! It only needs to hydrate the store with what a course already contains.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use coursegen_protocol::{Coordinates, MaterialKind, UnitKind};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backend::{CredentialProvider, StaticCredentials};
use crate::config::BackendConfig;
use crate::error::BackendError;
use crate::unit::ContentUnit;

/// A persisted material or folder as returned by the course service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialRecord {
    pub id: String,

    #[serde(default)]
    pub kind: UnitKind,

    #[serde(default, alias = "type")]
    pub material_kind: Option<MaterialKind>,

    pub module_number: u32,

    #[serde(default)]
    pub chapter_number: Option<u32>,

    #[serde(default)]
    pub slide_number: Option<u32>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub content: String,
}

impl MaterialRecord {
    /// Hydrate a complete unit keeping the server-assigned id.
    pub fn into_unit(self) -> ContentUnit {
        let coordinates = Coordinates {
            module_number: self.module_number,
            chapter_number: self.chapter_number,
            slide_number: self.slide_number,
        };
        let unit = match (self.kind, self.material_kind) {
            (UnitKind::Folder, _) => ContentUnit::folder(coordinates),
            (UnitKind::File, kind) => {
                ContentUnit::material(kind.unwrap_or(MaterialKind::Resource), coordinates)
            }
        };
        let unit = unit.with_id(self.id).completed(self.content);
        match self.title {
            Some(title) => unit.with_title(title),
            None => unit,
        }
    }
}

/// Source of a course's existing units.
#[async_trait]
pub trait CourseRepository: Send + Sync {
    async fn load_existing(&self, course_id: &str) -> Result<Vec<ContentUnit>, BackendError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MaterialsResponse {
    List(Vec<MaterialRecord>),
    Wrapped { materials: Vec<MaterialRecord> },
}

impl MaterialsResponse {
    fn into_records(self) -> Vec<MaterialRecord> {
        match self {
            Self::List(records) | Self::Wrapped { materials: records } => records,
        }
    }
}

/// Course service reached over HTTP.
pub struct HttpCourseRepository {
    client: reqwest::Client,
    config: BackendConfig,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpCourseRepository {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            client,
            config,
            credentials: Arc::new(StaticCredentials::default()),
        })
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }
}

#[async_trait]
impl CourseRepository for HttpCourseRepository {
    async fn load_existing(&self, course_id: &str) -> Result<Vec<ContentUnit>, BackendError> {
        let url = self.config.materials_url(course_id);
        debug!("Loading materials of course {course_id} from {url}");

        let mut builder = self.client.get(&url);
        if let Some(token) = self.credentials.bearer_token() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("Loading course {course_id} failed: {status}");
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        let records = serde_json::from_str::<MaterialsResponse>(&body)
            .map_err(|e| BackendError::InvalidResponse(e.to_string()))?
            .into_records();

        info!("Loaded {} materials for course {course_id}", records.len());
        Ok(records.into_iter().map(MaterialRecord::into_unit).collect())
    }
}

/// Repository backed by memory, for tests and offline sessions.
#[derive(Default)]
pub struct InMemoryCourseRepository {
    courses: RwLock<HashMap<String, Vec<MaterialRecord>>>,
}

impl InMemoryCourseRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_course(
        mut self,
        course_id: impl Into<String>,
        records: Vec<MaterialRecord>,
    ) -> Self {
        self.courses.get_mut().insert(course_id.into(), records);
        self
    }

    pub async fn insert(&self, course_id: impl Into<String>, records: Vec<MaterialRecord>) {
        self.courses.write().await.insert(course_id.into(), records);
    }
}

#[async_trait]
impl CourseRepository for InMemoryCourseRepository {
    async fn load_existing(&self, course_id: &str) -> Result<Vec<ContentUnit>, BackendError> {
        let courses = self.courses.read().await;
        let records = courses.get(course_id).cloned().unwrap_or_default();
        Ok(records.into_iter().map(MaterialRecord::into_unit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(id: &str, slide: u32) -> MaterialRecord {
        MaterialRecord {
            id: id.to_string(),
            kind: UnitKind::File,
            material_kind: Some(MaterialKind::Slide),
            module_number: 1,
            chapter_number: Some(1),
            slide_number: Some(slide),
            title: None,
            content: format!("slide {slide}"),
        }
    }

    #[test]
    fn test_record_into_unit() {
        let unit = record("m-1", 2).into_unit();
        assert_eq!(unit.id.as_str(), "m-1");
        assert_eq!(unit.status, UnitStatus::Complete);
        assert_eq!(unit.content, "slide 2");
        assert_eq!(unit.coordinates, Coordinates::slide(1, 1, 2));
    }

    #[test]
    fn test_folder_record() {
        let record: MaterialRecord = serde_json::from_value(json!({
            "id": "f-1",
            "kind": "folder",
            "module_number": 2,
            "title": "Advanced topics"
        }))
        .unwrap();
        let unit = record.into_unit();
        assert!(unit.is_folder());
        assert_eq!(unit.material_kind, None);
        assert_eq!(unit.display_title(), "Advanced topics");
    }

    #[tokio::test]
    async fn test_http_load_existing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/courses/c-1/materials"))
            .and(header("authorization", "Bearer t"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "materials": [record("m-1", 1), record("m-2", 2)]
            })))
            .mount(&server)
            .await;

        let repository = HttpCourseRepository::new(BackendConfig::new(format!("{}/api", server.uri())))
            .unwrap()
            .with_credentials(Arc::new(StaticCredentials::new("t")));
        let units = repository.load_existing("c-1").await.unwrap();

        let ids: Vec<&str> = units.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2"]);
    }

    #[tokio::test]
    async fn test_http_load_existing_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let repository =
            HttpCourseRepository::new(BackendConfig::new(server.uri())).unwrap();
        let result = repository.load_existing("missing").await;
        assert!(matches!(result, Err(BackendError::Status { status: 404, .. })));
    }

    #[tokio::test]
    async fn test_in_memory_repository() {
        let repository = InMemoryCourseRepository::new();
        repository.insert("c-1", vec![record("m-1", 1)]).await;

        assert_eq!(repository.load_existing("c-1").await.unwrap().len(), 1);
        assert!(repository.load_existing("c-2").await.unwrap().is_empty());
    }
}
