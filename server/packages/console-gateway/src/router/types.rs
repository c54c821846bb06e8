use super::*;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub active_streams: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub email: String,
    pub verified_at: String,
    pub issued_at: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema, ToSchema)]
pub struct CallbackQuery {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema, ToSchema)]
pub struct FilePathQuery {
    #[serde(default)]
    pub path: Option<String>,
}

impl FilePathQuery {
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MkdirRequest {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FileListResponse {
    pub path: String,
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}
